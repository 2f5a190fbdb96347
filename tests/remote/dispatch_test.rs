//! Command dispatch against a scripted host.

use leosac::config::codec::{self, ConfigFormat};
use leosac::config::{ConfigError, ConfigTree};
use leosac::message::Message;
use leosac::modules::supervisor::ModuleConfigDump;
use leosac::modules::ModuleError;
use leosac::remote::{
    commands, dispatch, PermissionEntry, RemoteControlSecurity, RemoteHost, RemoteSession,
    SyncRequest, DELAYED, KO, OK, PERMISSION_DENIED, UNKNOWN_MESSAGE,
};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Default)]
struct FakeHost {
    saved: usize,
    save_fails: bool,
    syncs: Vec<SyncRequest>,
}

impl RemoteHost for FakeHost {
    fn running_modules(&self) -> Vec<String> {
        vec!["MONITOR".to_owned(), "WIEGAND".to_owned()]
    }

    fn module_config(&self, name: &str) -> Result<ModuleConfigDump, ModuleError> {
        if name != "WIEGAND" {
            return Err(ModuleError::NotLoaded(name.to_owned()));
        }
        let entry = ConfigTree::parse(
            "name = \"WIEGAND\"\nfile = \"libwiegand.so\"\n[module_config]\nhigh_gpio = \"gpio_14\"\n",
        )
        .map_err(ModuleError::Config)?;
        Ok(ModuleConfigDump {
            name: name.to_owned(),
            entry,
            additional_files: vec![("/etc/leosac/wiegand.map".to_owned(), "1=2".to_owned())],
        })
    }

    fn exportable_general_config(&self) -> Result<ConfigTree, ConfigError> {
        ConfigTree::parse("version = 7\nautosave = true\n")
    }

    fn config_version(&self) -> u64 {
        7
    }

    fn save_config(&mut self) -> Result<(), ConfigError> {
        if self.save_fails {
            return Err(ConfigError::NoBackingFile);
        }
        self.saved = self.saved.saturating_add(1);
        Ok(())
    }

    fn sync_from(&mut self, request: SyncRequest, _session: RemoteSession) -> Uuid {
        self.syncs.push(request);
        Uuid::nil()
    }
}

fn session(key: &str) -> (RemoteSession, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RemoteSession::new(key, tx), rx)
}

fn run(host: &mut FakeHost, msg: Message) -> Message {
    let (session, _rx) = session("client");
    dispatch(host, &RemoteControlSecurity::open(), &session, msg)
}

fn command(name: &str) -> Message {
    Message::new().with(name)
}

#[test]
fn unknown_command_is_refused() {
    let reply = run(&mut FakeHost::default(), command("REBOOT"));
    assert_eq!(reply.str_at(0), Some(KO));
    assert_eq!(reply.str_at(1), Some(UNKNOWN_MESSAGE));

    let reply = run(&mut FakeHost::default(), Message::new());
    assert_eq!(reply.str_at(1), Some(UNKNOWN_MESSAGE));
}

#[test]
fn wrong_arity_is_malformed() {
    let reply = run(&mut FakeHost::default(), command(commands::MODULE_LIST).with("extra"));
    assert_eq!(reply.str_at(0), Some(KO));
    assert_eq!(reply.str_at(1), Some("Malformed message: MODULE_LIST"));

    let reply = run(&mut FakeHost::default(), command(commands::GENERAL_CONFIG));
    assert_eq!(reply.str_at(1), Some("Malformed message: GENERAL_CONFIG"));
}

#[test]
fn module_list_names_running_modules() {
    let reply = run(&mut FakeHost::default(), command(commands::MODULE_LIST));
    let frames: Vec<&str> = (0..reply.len()).filter_map(|i| reply.str_at(i)).collect();
    assert_eq!(frames, vec![OK, "MONITOR", "WIEGAND"]);
}

#[test]
fn config_version_is_a_u64_frame() {
    let mut reply = run(&mut FakeHost::default(), command(commands::CONFIG_VERSION));
    assert_eq!(reply.pop_string().expect("status"), OK);
    assert_eq!(reply.pop_u64().expect("version"), 7);
    assert!(reply.is_empty());
}

#[test]
fn module_config_carries_entry_and_files() {
    let mut msg = command(commands::MODULE_CONFIG).with("WIEGAND");
    msg.push_u8(ConfigFormat::Text.as_byte());
    let reply = run(&mut FakeHost::default(), msg);

    assert_eq!(reply.str_at(0), Some(OK));
    assert_eq!(reply.str_at(1), Some("WIEGAND"));
    let entry = codec::decode(reply.part(2).expect("blob"), ConfigFormat::Text).expect("decode");
    assert_eq!(entry.get_str("module_config.high_gpio"), Some("gpio_14"));
    assert_eq!(reply.str_at(3), Some("/etc/leosac/wiegand.map"));
    assert_eq!(reply.str_at(4), Some("1=2"));
    assert_eq!(reply.len(), 5);
}

#[test]
fn module_config_for_unknown_module_is_ko() {
    let mut msg = command(commands::MODULE_CONFIG).with("GHOST");
    msg.push_u8(ConfigFormat::Binary.as_byte());
    let reply = run(&mut FakeHost::default(), msg);
    assert_eq!(reply.str_at(0), Some(KO));
}

#[test]
fn unknown_format_byte_is_malformed() {
    let mut msg = command(commands::GENERAL_CONFIG);
    msg.push_u8(9);
    let reply = run(&mut FakeHost::default(), msg);
    assert_eq!(reply.str_at(1), Some("Malformed message: GENERAL_CONFIG"));
}

#[test]
fn general_config_in_binary() {
    let mut msg = command(commands::GENERAL_CONFIG);
    msg.push_u8(ConfigFormat::Binary.as_byte());
    let reply = run(&mut FakeHost::default(), msg);
    assert_eq!(reply.str_at(0), Some(OK));
    let tree = codec::decode(reply.part(1).expect("blob"), ConfigFormat::Binary).expect("decode");
    assert_eq!(tree.get_integer("version"), Some(7));
    assert_eq!(tree.get_bool("autosave"), Some(true));
}

#[test]
fn save_reports_host_result() {
    let mut host = FakeHost::default();
    assert_eq!(run(&mut host, command(commands::SAVE)).str_at(0), Some(OK));
    assert_eq!(host.saved, 1);

    host.save_fails = true;
    let reply = run(&mut host, command(commands::SAVE));
    assert_eq!(reply.str_at(0), Some(KO));
    assert_eq!(host.saved, 1);
}

#[test]
fn sync_from_is_delayed_and_forwarded() {
    let mut host = FakeHost::default();
    let mut msg = command(commands::SYNC_FROM).with("tcp://10.0.0.2:12345");
    msg.push_bool(true);
    msg.push("cHVibGljcHVibGljcHVibGljcHVibGljcHVibGljMDA=");
    msg.push_bool(false);

    let reply = run(&mut host, msg);
    assert_eq!(reply.str_at(0), Some(DELAYED));
    assert_eq!(reply.str_at(1), Some(Uuid::nil().to_string().as_str()));
    assert_eq!(
        host.syncs,
        vec![SyncRequest {
            endpoint: "tcp://10.0.0.2:12345".to_owned(),
            autocommit: true,
            remote_pubkey: "cHVibGljcHVibGljcHVibGljcHVibGljcHVibGljMDA=".to_owned(),
            sync_general_config: false,
        }]
    );
}

#[test]
fn permissions_are_checked_before_dispatch() {
    let security = RemoteControlSecurity::default().with_entry(
        "reader-key",
        PermissionEntry {
            default_allow: false,
            exceptions: [commands::MODULE_LIST.to_owned()].into_iter().collect(),
        },
    );
    let mut host = FakeHost::default();

    let (reader, _rx) = session("reader-key");
    let reply = dispatch(&mut host, &security, &reader, command(commands::MODULE_LIST));
    assert_eq!(reply.str_at(0), Some(OK));

    let reply = dispatch(&mut host, &security, &reader, command(commands::SAVE));
    assert_eq!(reply.str_at(1), Some(PERMISSION_DENIED));
    assert_eq!(host.saved, 0);

    let (stranger, _rx) = session("unknown-key");
    let reply = dispatch(&mut host, &security, &stranger, command(commands::MODULE_LIST));
    assert_eq!(reply.str_at(1), Some(PERMISSION_DENIED));
}
