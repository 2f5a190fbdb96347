//! Noise transport, server and client over loopback TCP.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use leosac::message::Message;
use leosac::remote::transport::MAX_CHUNK;
use leosac::remote::{
    KeyPair, RemoteClient, RemoteError, RemoteServer, RemoteSession, RequestSink, KO, OK,
};

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

/// Answers every request with `OK` followed by the request frames.
fn echo_sink(seen_keys: Arc<Mutex<Vec<String>>>) -> RequestSink {
    Arc::new(move |session: RemoteSession, msg: Message| {
        seen_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(session.peer_key().to_owned());
        let mut reply = Message::new().with(OK);
        for part in msg.parts() {
            reply.push(part.to_vec());
        }
        session.reply(reply);
    })
}

#[tokio::test]
async fn request_reaches_sink_and_reply_comes_back() {
    let server_keys = KeyPair::generate().expect("server keys");
    let client_keys = KeyPair::generate().expect("client keys");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let server = RemoteServer::bind(loopback(), server_keys.clone(), echo_sink(Arc::clone(&seen)))
        .await
        .expect("bind");

    let mut client = RemoteClient::connect(
        &server.local_addr().to_string(),
        &server_keys.public_base64(),
        Some(client_keys.clone()),
    )
    .await
    .expect("connect");

    let reply = client
        .request(&Message::new().with("MODULE_LIST"))
        .await
        .expect("reply");
    assert_eq!(reply.str_at(0), Some(OK));
    assert_eq!(reply.str_at(1), Some("MODULE_LIST"));

    let mut stripped = client
        .request_ok(&Message::new().with("CONFIG_VERSION"))
        .await
        .expect("ok reply");
    assert_eq!(stripped.pop_string().expect("frame"), "CONFIG_VERSION");

    let keys = seen.lock().unwrap_or_else(PoisonError::into_inner).clone();
    assert_eq!(keys, vec![client_keys.public_base64(); 2]);
    server.shutdown();
}

#[tokio::test]
async fn messages_larger_than_one_noise_frame_survive() {
    let server_keys = KeyPair::generate().expect("server keys");
    let server = RemoteServer::bind(
        loopback(),
        server_keys.clone(),
        echo_sink(Arc::new(Mutex::new(Vec::new()))),
    )
    .await
    .expect("bind");
    let mut client = RemoteClient::connect(
        &format!("tcp://{}", server.local_addr()),
        &server_keys.public_base64(),
        None,
    )
    .await
    .expect("connect")
    .with_timeout(Duration::from_secs(5));

    let payload: Vec<u8> = (0..MAX_CHUNK.saturating_mul(3))
        .map(|i| u8::try_from(i % 251).unwrap_or_default())
        .collect();
    let reply = client
        .request(&Message::new().with("BLOB").with(payload.clone()))
        .await
        .expect("reply");
    assert_eq!(reply.part(2), Some(payload.as_slice()));
}

#[tokio::test]
async fn wrong_server_key_fails_the_handshake() {
    let server_keys = KeyPair::generate().expect("server keys");
    let impostor = KeyPair::generate().expect("other keys");
    let server = RemoteServer::bind(
        loopback(),
        server_keys,
        echo_sink(Arc::new(Mutex::new(Vec::new()))),
    )
    .await
    .expect("bind");

    let result = RemoteClient::connect(
        &server.local_addr().to_string(),
        &impostor.public_base64(),
        None,
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn malformed_server_key_is_rejected_before_connecting() {
    let result = RemoteClient::connect("127.0.0.1:1", "not-base64!", None).await;
    assert!(matches!(result, Err(RemoteError::InvalidKey(_))));
}

#[tokio::test]
async fn ko_reply_becomes_refused() {
    let server_keys = KeyPair::generate().expect("server keys");
    let sink: RequestSink = Arc::new(|session: RemoteSession, _msg: Message| {
        session.reply(Message::new().with(KO).with("nope"));
    });
    let server = RemoteServer::bind(loopback(), server_keys.clone(), sink)
        .await
        .expect("bind");
    let mut client = RemoteClient::connect(
        &server.local_addr().to_string(),
        &server_keys.public_base64(),
        None,
    )
    .await
    .expect("connect");

    let err = client
        .request_ok(&Message::new().with("SAVE"))
        .await
        .expect_err("refused");
    assert!(matches!(
        err,
        RemoteError::Refused { ref command, ref reason } if command == "SAVE" && reason == "nope"
    ));
}

#[tokio::test]
async fn late_replies_are_delivered_on_the_same_connection() {
    let server_keys = KeyPair::generate().expect("server keys");
    let sink: RequestSink = Arc::new(|session: RemoteSession, _msg: Message| {
        session.reply(Message::new().with("DELAYED").with("42"));
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            session.reply(Message::new().with(OK).with("42").with("SUCCESS"));
        });
    });
    let server = RemoteServer::bind(loopback(), server_keys.clone(), sink)
        .await
        .expect("bind");
    let mut client = RemoteClient::connect(
        &server.local_addr().to_string(),
        &server_keys.public_base64(),
        None,
    )
    .await
    .expect("connect");

    let first = client
        .request(&Message::new().with("SYNC_FROM"))
        .await
        .expect("delayed");
    assert_eq!(first.str_at(0), Some("DELAYED"));
    let outcome = client
        .receive_within(Duration::from_secs(2))
        .await
        .expect("outcome");
    assert_eq!(outcome.str_at(2), Some("SUCCESS"));
}
