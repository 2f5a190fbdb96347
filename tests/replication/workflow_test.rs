//! Fetch, version gate and outcome delivery, with the MAIN loop driven by
//! the test thread.

use std::sync::Arc;
use std::time::{Duration, Instant};

use leosac::config::ConfigTree;
use leosac::message::Message;
use leosac::remote::{RemoteError, RemoteSession};
use leosac::replication::{
    start_sync, ConfigSource, RemoteConfig, ReplicationHost, SyncError, SyncOptions,
};
use leosac::scheduler::{Affinity, Scheduler};
use tokio::sync::mpsc;

#[derive(Default)]
struct FakeHost {
    applied: Vec<(u64, SyncOptions)>,
    fail: bool,
}

impl ReplicationHost for FakeHost {
    fn apply_remote_config(
        &mut self,
        remote: &RemoteConfig,
        options: &SyncOptions,
    ) -> Result<(), SyncError> {
        if self.fail {
            return Err(SyncError::Incomplete("WIEGAND".to_owned()));
        }
        self.applied.push((remote.version(), *options));
        Ok(())
    }
}

struct FakeSource(Option<Result<RemoteConfig, RemoteError>>);

impl ConfigSource for FakeSource {
    fn fetch(&mut self) -> Result<RemoteConfig, RemoteError> {
        self.0.take().unwrap_or(Err(RemoteError::Closed))
    }
}

fn peer_at(version: i64) -> RemoteConfig {
    let mut general = ConfigTree::new();
    general.insert("version", version);
    let mut remote = RemoteConfig::new(general);
    remote.add_module("MONITOR", ConfigTree::new(), Vec::new());
    remote
}

/// Run a sync to completion on this thread and return the outcome message.
fn drive(
    host: &mut FakeHost,
    fetched: Result<RemoteConfig, RemoteError>,
    local_version: u64,
    options: SyncOptions,
) -> (String, Message) {
    let scheduler = Arc::new(Scheduler::<FakeHost>::new());
    scheduler.register_thread(Affinity::Main);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = RemoteSession::new("client", tx);

    let id = start_sync(
        &scheduler,
        Box::new(FakeSource(Some(fetched))),
        local_version,
        session,
        options,
    );

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(msg) = rx.try_recv() {
            return (id.to_string(), msg);
        }
        assert!(Instant::now() < deadline, "no outcome delivered");
        scheduler.wait_for_main(Duration::from_millis(10));
        scheduler.update(Affinity::Main, host);
    }
}

fn frames(msg: &Message) -> Vec<String> {
    msg.parts()
        .map(|p| String::from_utf8_lossy(p).into_owned())
        .collect()
}

#[test]
fn newer_peer_is_applied_once() {
    let mut host = FakeHost::default();
    let options = SyncOptions {
        autocommit: true,
        sync_general_config: false,
    };
    let (id, outcome) = drive(&mut host, Ok(peer_at(8)), 5, options);

    assert_eq!(frames(&outcome), vec!["OK".to_owned(), id, "SUCCESS".to_owned()]);
    assert_eq!(host.applied, vec![(8, options)]);
}

#[test]
fn older_or_equal_peer_aborts_without_applying() {
    for peer in [3, 5] {
        let mut host = FakeHost::default();
        let (id, outcome) = drive(&mut host, Ok(peer_at(peer)), 5, SyncOptions::default());
        let frames = frames(&outcome);
        assert_eq!(frames.first().map(String::as_str), Some("KO"));
        assert_eq!(frames.get(1), Some(&id));
        assert_eq!(frames.get(2).map(String::as_str), Some("ABORTED"));
        assert!(frames.get(3).is_some_and(|r| r.contains("not newer")));
        assert!(host.applied.is_empty());
    }
}

#[test]
fn fetch_failure_aborts() {
    let mut host = FakeHost::default();
    let (_, outcome) = drive(
        &mut host,
        Err(RemoteError::Timeout("remote reply".to_owned())),
        0,
        SyncOptions::default(),
    );
    let frames = frames(&outcome);
    assert_eq!(frames.get(2).map(String::as_str), Some("ABORTED"));
    assert!(frames.get(3).is_some_and(|r| r.contains("timed out")));
    assert!(host.applied.is_empty());
}

#[test]
fn apply_failure_is_reported_as_failed() {
    let mut host = FakeHost {
        fail: true,
        ..FakeHost::default()
    };
    let (_, outcome) = drive(&mut host, Ok(peer_at(2)), 1, SyncOptions::default());
    let frames = frames(&outcome);
    assert_eq!(frames.first().map(String::as_str), Some("KO"));
    assert_eq!(frames.get(2).map(String::as_str), Some("FAILED"));
    assert!(frames.get(3).is_some_and(|r| r.contains("WIEGAND")));
}
