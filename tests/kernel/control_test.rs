//! Local control requests handled on MAIN.

use leosac::config::codec::{self, ConfigFormat};
use leosac::config::{ConfigStore, ConfigTree};
use leosac::kernel::control::{requests, FACTORY_CONFIG_FILE};
use leosac::message::Message;
use leosac::remote::{KO, OK, UNKNOWN_MESSAGE};

use super::{Layout, Node};

const NETWORK: &str = "[network]\nenabled = true\ninterface = \"eth0\"\n";

fn request(name: &str) -> Message {
    Message::new().with(name)
}

#[test]
fn directories_come_from_runtime_paths() {
    let layout = Layout::new();
    layout.write_config("", "[]");
    let node = Node::boot(&layout);
    let control = node.handle.control();

    let reply = control.request(request(requests::SCRIPTS_DIR)).expect("reply");
    assert_eq!(reply.str_at(0), Some(OK));
    assert_eq!(
        reply.str_at(1),
        Some(layout.paths().scripts_dir.display().to_string().as_str())
    );

    let reply = control
        .request(request(requests::FACTORY_CONFIG_DIR))
        .expect("reply");
    assert_eq!(
        reply.str_at(1),
        Some(layout.paths().factory_config_dir.display().to_string().as_str())
    );

    let reply = control.request(request("SELF_DESTRUCT")).expect("reply");
    assert_eq!(reply.str_at(0), Some(KO));
    assert_eq!(reply.str_at(1), Some(UNKNOWN_MESSAGE));

    assert!(!node.stop());
}

#[test]
fn network_section_can_be_read_and_replaced() {
    let layout = Layout::new();
    layout.write_config(NETWORK, "[]");
    let node = Node::boot(&layout);
    let control = node.handle.control();

    let reply = control
        .request(request(requests::GET_NETCONFIG))
        .expect("reply");
    assert_eq!(reply.str_at(0), Some(OK));
    let network = codec::decode(reply.part(1).expect("blob"), ConfigFormat::Binary).expect("decode");
    assert_eq!(network.get_str("interface"), Some("eth0"));

    let replacement = ConfigTree::parse("enabled = false\ninterface = \"wlan0\"\n").expect("tree");
    let blob = codec::encode(&replacement, ConfigFormat::Binary).expect("encode");
    let reply = control
        .request(request(requests::SET_NETCONFIG).with(blob))
        .expect("reply");
    assert_eq!(reply.str_at(0), Some(OK));

    let saved = ConfigStore::load(&layout.config_path()).expect("reload");
    assert_eq!(saved.kconfig().get_str("network.interface"), Some("wlan0"));
    assert_eq!(saved.kconfig().get_bool("network.enabled"), Some(false));

    let reply = control
        .request(request(requests::SET_NETCONFIG))
        .expect("reply");
    assert_eq!(reply.str_at(0), Some(KO));
    assert_eq!(reply.str_at(1), Some("Malformed message: SET_NETCONFIG"));

    let reply = control
        .request(request(requests::SET_NETCONFIG).with("not a config"))
        .expect("reply");
    assert_eq!(reply.str_at(0), Some(KO));

    assert!(!node.stop());
}

#[test]
fn restart_request_asks_for_a_rebuild() {
    let layout = Layout::new();
    layout.write_config("", "[]");
    let node = Node::boot(&layout);

    let reply = node
        .handle
        .control()
        .request(request(requests::RESTART))
        .expect("reply");
    assert_eq!(reply.str_at(0), Some(OK));
    assert!(node.join());
}

#[test]
fn reset_restores_the_factory_file_and_restarts() {
    let layout = Layout::new();
    layout.write_config("instance_name = \"customized\"", "[]");
    let factory = "instance_name = \"factory\"\n";
    std::fs::write(
        layout.paths().factory_config_dir.join(FACTORY_CONFIG_FILE),
        factory,
    )
    .expect("factory file");
    let node = Node::boot(&layout);

    let reply = node
        .handle
        .control()
        .request(request(requests::RESET))
        .expect("reply");
    assert_eq!(reply.str_at(0), Some(OK));
    assert!(node.join());
    assert_eq!(
        std::fs::read_to_string(layout.config_path()).expect("read"),
        factory
    );
}

#[test]
fn reset_without_factory_file_is_refused() {
    let layout = Layout::new();
    layout.write_config("", "[]");
    let node = Node::boot(&layout);

    let reply = node
        .handle
        .control()
        .request(request(requests::RESET))
        .expect("reply");
    assert_eq!(reply.str_at(0), Some(KO));
    assert!(!node.stop());
}
