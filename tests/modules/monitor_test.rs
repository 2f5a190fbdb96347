//! The built-in `MONITOR` module.

use std::time::Duration;

use leosac::config::ObjectType;
use leosac::modules::monitor::{MODULE_FILE, MODULE_NAME};
use leosac::modules::{ModuleError, ModuleFactory, ModuleRegistry};

use super::{store, Harness};

const MONITOR: &str = r#"
[[modules]]
name = "MONITOR"
file = "libmonitor.so"
level = 1

[modules.module_config]
topics = ["KERNEL"]

[[modules.module_config.objects]]
name = "lobby_led"
type = "led"

[[modules.module_config.objects]]
name = "lobby_gpio"
type = "gpio"

[[modules.module_config.references]]
name = "lobby_gpio"
type = "gpio"
"#;

#[test]
fn builtin_registry_provides_the_monitor() {
    let registry = ModuleRegistry::builtin();
    let factory = registry.get(MODULE_FILE).expect("registered");
    assert_eq!(factory.module_name(), MODULE_NAME);
}

#[test]
fn monitor_registers_its_objects() {
    let mut harness = Harness::new(ModuleRegistry::builtin(), &[MODULE_FILE], true);
    let store = store(MONITOR).expect("store");
    harness.supervisor.load_modules(&store).expect("load");
    harness.supervisor.init_modules().expect("init");

    assert!(harness
        .checker
        .has_object_of_type("lobby_led", ObjectType::Led));
    assert!(harness
        .checker
        .has_object_of_type("lobby_gpio", ObjectType::Gpio));
    assert_eq!(harness.supervisor.running_modules(), vec![MODULE_NAME]);

    let dump = harness
        .supervisor
        .dump_config(MODULE_NAME, Duration::from_secs(2))
        .expect("dump");
    assert_eq!(
        dump.entry.child("module_config"),
        store
            .load_config(MODULE_NAME)
            .and_then(|entry| entry.child("module_config"))
    );
}

#[test]
fn dangling_reference_blocks_start_in_strict_mode() {
    let doc = r#"
        [[modules]]
        name = "MONITOR"
        file = "libmonitor.so"
        [[modules.module_config.references]]
        name = "missing_reader"
        type = "reader"
    "#;

    let mut strict = Harness::new(ModuleRegistry::builtin(), &[MODULE_FILE], true);
    strict.supervisor.load_modules(&store(doc).expect("store")).expect("load");
    assert!(matches!(
        strict.supervisor.init_modules(),
        Err(ModuleError::StartFailed { .. })
    ));

    let mut lenient = Harness::new(ModuleRegistry::builtin(), &[MODULE_FILE], false);
    lenient.supervisor.load_modules(&store(doc).expect("store")).expect("load");
    lenient.supervisor.init_modules().expect("warning only");
    assert_eq!(lenient.supervisor.running_modules(), vec![MODULE_NAME]);
}
