//! Boot, MAIN-thread RPC, notices and shutdown of a whole kernel.

use std::sync::Arc;
use std::time::Duration;

use leosac::bus::topics;
use leosac::config::{ConfigStore, ConfigTree};
use leosac::kernel::Kernel;
use leosac::modules::{ConfigDump, Module, ModuleContext, ModuleError, ModuleFactory, ModuleRegistry};
use leosac::scheduler::TaskError;

use super::{Layout, Node};

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn core_api_answers_from_the_main_thread() {
    let layout = Layout::new();
    layout.write_config("instance_name = \"lobby\"\nversion = 12\n", "[\"KERNEL\"]");
    let node = Node::boot(&layout);
    let core = node.handle.core_api();

    assert_eq!(core.instance_name().expect("name"), "lobby");
    assert_eq!(core.config_version().expect("version"), 12);
    assert_eq!(core.modules_names().expect("modules"), vec!["MONITOR"]);
    let general = core.kernel_config().expect("general");
    assert_eq!(general.get_integer("version"), Some(12));
    assert_eq!(general.get_str("instance_name"), Some("lobby"));
    let first = core.uptime().expect("uptime");
    std::thread::sleep(Duration::from_millis(5));
    assert!(core.uptime().expect("uptime") > first);

    assert!(!node.stop());
}

#[test]
fn ready_and_reload_notices_reach_subscribers() {
    let layout = Layout::new();
    layout.write_config("", "[]");
    let mut node = Node::boot(&layout);

    let ready = node.notices.recv_timeout(WAIT).expect("ready notice");
    assert_eq!(ready.str_at(0), Some(topics::KERNEL));
    assert_eq!(ready.str_at(1), Some(topics::SYSTEM_READY));

    node.handle.reload();
    let hup = node.notices.recv_timeout(WAIT).expect("reload notice");
    assert_eq!(hup.str_at(1), Some(topics::SIGHUP));

    assert!(!node.stop());
}

#[test]
fn restart_request_ends_the_loop_with_a_restart_flag() {
    let layout = Layout::new();
    layout.write_config("", "[]");
    let node = Node::boot(&layout);
    node.handle.restart();
    assert!(node.join());
}

#[test]
fn calls_after_shutdown_fail_instead_of_hanging() {
    let layout = Layout::new();
    layout.write_config("", "[]");
    let node = Node::boot(&layout);
    let core = node.handle.core_api();
    assert!(!node.stop());

    assert_eq!(core.config_version(), Err(TaskError::ShutDown));
}

#[test]
fn autosave_writes_the_configuration_on_shutdown() {
    let layout = Layout::new();
    layout.write_config("autosave = true\nversion = 3\n", "[\"KERNEL\"]");
    let before = std::fs::read_to_string(layout.config_path()).expect("read");
    std::fs::write(layout.config_path(), format!("# hand-written\n{before}")).expect("write");

    let node = Node::boot(&layout);
    assert!(!node.stop());

    let after = std::fs::read_to_string(layout.config_path()).expect("read");
    assert!(!after.contains("# hand-written"));
    let saved = ConfigStore::load(&layout.config_path()).expect("reload");
    assert_eq!(saved.config_version(), 3);
    assert_eq!(saved.module_names(), vec!["MONITOR"]);
}

/// Counts its polls and reports the count in its dumped configuration.
struct TallyFactory;

impl ModuleFactory for TallyFactory {
    fn module_name(&self) -> &str {
        "TALLY"
    }

    fn start(&self, ctx: ModuleContext) -> Result<Box<dyn Module>, ModuleError> {
        Ok(Box::new(Tally {
            config: ctx.config,
            polls: 0,
        }))
    }
}

struct Tally {
    config: ConfigTree,
    polls: i64,
}

impl Module for Tally {
    fn poll(&mut self, timeout: Duration) -> Result<(), ModuleError> {
        std::thread::sleep(timeout);
        self.polls = self.polls.saturating_add(1);
        Ok(())
    }

    fn dump_config(&self) -> ConfigDump {
        let mut module_config = self.config.clone();
        module_config.insert("live", true);
        ConfigDump {
            module_config,
            additional_files: Vec::new(),
        }
    }
}

#[test]
fn autosave_keeps_live_module_configuration() {
    let layout = Layout::new();
    std::fs::write(layout.plugins().join("libtally.so"), b"").expect("plugin");
    layout.write_config(
        "autosave = true\nversion = 4\n\n[[modules]]\nname = \"TALLY\"\nfile = \"libtally.so\"\n\
         [modules.module_config]\nlive = false\n",
        "[\"KERNEL\"]",
    );
    let mut registry = ModuleRegistry::builtin();
    registry.register("libtally.so", Arc::new(TallyFactory));

    let node = Node::boot_with(&layout, registry);
    let core = node.handle.core_api();
    assert!(core.modules_names().expect("modules").contains(&"TALLY".to_owned()));
    assert!(!node.stop());

    let saved = ConfigStore::load(&layout.config_path()).expect("reload");
    let entry = saved.load_config("TALLY").expect("tally entry");
    assert_eq!(entry.get_bool("module_config.live"), Some(true));
    assert_eq!(saved.config_version(), 4);
}

#[test]
fn missing_module_file_aborts_the_boot() {
    let layout = Layout::new();
    layout.write_config("", "[]");
    std::fs::remove_file(layout.plugins().join(leosac::modules::monitor::MODULE_FILE))
        .expect("remove plugin");

    let runtime = tokio::runtime::Runtime::new().expect("runtime");
    let store = ConfigStore::load(&layout.config_path()).expect("load");
    let kernel = Kernel::new(
        store,
        runtime.handle().clone(),
        ModuleRegistry::builtin(),
        layout.paths(),
    )
    .expect("kernel");
    let err = kernel.run().expect_err("boot fails");
    assert!(format!("{err:#}").contains("libmonitor.so"));
}
