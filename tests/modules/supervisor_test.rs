//! Module loading, ordering, start/stop and configuration dumps.

use std::sync::Arc;
use std::time::{Duration, Instant};

use leosac::modules::{ModuleError, ModuleRegistry, StopMode};

use super::{entries, store, Harness, Journal, Probe};

const DUMP_TIMEOUT: Duration = Duration::from_secs(2);

fn registry(journal: &Journal, names: &[(&str, &str)]) -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    for (file, name) in names {
        registry.register(*file, Arc::new(Probe::new(name, journal)));
    }
    registry
}

const THREE_MODULES: &str = r#"
[[modules]]
name = "DOOR"
file = "libdoor.so"
level = 5

[[modules]]
name = "AUTH"
file = "libauth.so"
level = 1

[[modules]]
name = "LED"
file = "libled.so"
level = 5

[[modules]]
name = "AUDIT"
file = "libaudit.so"
"#;

fn three_modules(journal: &Journal) -> Harness {
    Harness::new(
        registry(
            journal,
            &[
                ("libdoor.so", "DOOR"),
                ("libauth.so", "AUTH"),
                ("libled.so", "LED"),
                ("libaudit.so", "AUDIT"),
            ],
        ),
        &["libdoor.so", "libauth.so", "libled.so", "libaudit.so"],
        false,
    )
}

#[test]
fn modules_start_by_level_then_load_order_and_stop_in_reverse() {
    let journal = Journal::default();
    let mut harness = three_modules(&journal);
    let store = store(THREE_MODULES).expect("store");

    harness.supervisor.load_modules(&store).expect("load");
    assert_eq!(
        harness.supervisor.known_modules(),
        vec!["AUTH", "DOOR", "LED", "AUDIT"]
    );
    assert_eq!(harness.supervisor.order_key("AUDIT").map(|k| k.0), Some(100));

    harness.supervisor.init_modules().expect("init");
    assert_eq!(
        harness.supervisor.running_modules(),
        vec!["AUTH", "DOOR", "LED", "AUDIT"]
    );

    harness.supervisor.stop_modules(StopMode::Hard);
    assert!(harness.supervisor.known_modules().is_empty());
    assert_eq!(
        entries(&journal),
        vec![
            "start:AUTH",
            "start:DOOR",
            "start:LED",
            "start:AUDIT",
            "stop:AUDIT:Hard",
            "stop:LED:Hard",
            "stop:DOOR:Hard",
            "stop:AUTH:Hard",
        ]
    );
}

#[test]
fn soft_stop_keeps_modules_loaded_for_a_restart() {
    let journal = Journal::default();
    let mut harness = three_modules(&journal);
    let store = store(THREE_MODULES).expect("store");
    harness.supervisor.load_modules(&store).expect("load");
    harness.supervisor.init_modules().expect("init");

    harness.supervisor.stop_modules(StopMode::Soft);
    assert!(harness.supervisor.running_modules().is_empty());
    assert_eq!(harness.supervisor.known_modules().len(), 4);

    harness.supervisor.init_module("LED").expect("restart one");
    assert_eq!(harness.supervisor.running_modules(), vec!["LED"]);
    assert!(entries(&journal).contains(&"stop:LED:Soft".to_owned()));
}

#[test]
fn stop_module_by_name() {
    let journal = Journal::default();
    let mut harness = three_modules(&journal);
    let store = store(THREE_MODULES).expect("store");
    harness.supervisor.load_modules(&store).expect("load");
    harness.supervisor.init_modules().expect("init");

    harness
        .supervisor
        .stop_module("DOOR", StopMode::Hard)
        .expect("stop");
    assert!(!harness.supervisor.is_known("DOOR"));
    assert_eq!(harness.supervisor.running_modules(), vec!["AUTH", "LED", "AUDIT"]);
    assert!(matches!(
        harness.supervisor.stop_module("DOOR", StopMode::Hard),
        Err(ModuleError::NotLoaded(name)) if name == "DOOR"
    ));
}

#[test]
fn missing_backing_file_is_reported() {
    let journal = Journal::default();
    let mut harness = Harness::new(registry(&journal, &[("libdoor.so", "DOOR")]), &[], false);
    let store = store("[[modules]]\nname = \"DOOR\"\nfile = \"libdoor.so\"\n").expect("store");

    let err = harness
        .supervisor
        .load_module(&store, "DOOR")
        .expect_err("no file on disk");
    assert!(matches!(
        err,
        ModuleError::FileNotFound { ref name, ref file } if name == "DOOR" && file == "libdoor.so"
    ));
}

#[test]
fn file_without_implementation_is_rejected() {
    let journal = Journal::default();
    let mut harness = Harness::new(registry(&journal, &[]), &["libdoor.so"], false);
    let store = store("[[modules]]\nname = \"DOOR\"\nfile = \"libdoor.so\"\n").expect("store");

    assert!(matches!(
        harness.supervisor.load_module(&store, "DOOR"),
        Err(ModuleError::UnknownImplementation(file)) if file == "libdoor.so"
    ));
}

#[test]
fn loading_requires_stored_configuration_once() {
    let journal = Journal::default();
    let mut harness = Harness::new(
        registry(&journal, &[("libdoor.so", "DOOR")]),
        &["libdoor.so"],
        false,
    );
    let store = store("[[modules]]\nname = \"DOOR\"\nfile = \"libdoor.so\"\n").expect("store");

    assert!(matches!(
        harness.supervisor.load_module(&store, "GHOST"),
        Err(ModuleError::MissingConfig(name)) if name == "GHOST"
    ));
    harness.supervisor.load_module(&store, "DOOR").expect("first");
    assert!(matches!(
        harness.supervisor.load_module(&store, "DOOR"),
        Err(ModuleError::AlreadyLoaded(name)) if name == "DOOR"
    ));
}

#[test]
fn first_plugin_directory_wins() {
    let journal = Journal::default();
    let mut harness = Harness::new(
        registry(&journal, &[("libdoor.so", "DOOR")]),
        &["libdoor.so"],
        false,
    );
    let second = tempfile::tempdir().expect("tempdir");
    super::touch(second.path(), "libdoor.so");
    harness.supervisor.add_to_path(second.path());
    harness.supervisor.add_to_path(harness.plugins.path());
    assert_eq!(harness.supervisor.search_path().len(), 2);

    let store = store("[[modules]]\nname = \"DOOR\"\nfile = \"libdoor.so\"\n").expect("store");
    harness.supervisor.load_module(&store, "DOOR").expect("load");
    assert_eq!(
        harness.supervisor.module_file("DOOR"),
        Some(harness.plugins.path().join("libdoor.so").as_path())
    );
}

#[test]
fn implementation_must_report_the_configured_name() {
    let journal = Journal::default();
    let mut harness = Harness::new(
        registry(&journal, &[("libdoor.so", "DOOR_V2")]),
        &["libdoor.so"],
        false,
    );
    let store = store("[[modules]]\nname = \"DOOR\"\nfile = \"libdoor.so\"\n").expect("store");
    harness.supervisor.load_module(&store, "DOOR").expect("load");

    let err = harness.supervisor.init_module("DOOR").expect_err("mismatch");
    assert!(matches!(
        err,
        ModuleError::NameMismatch { ref configured, ref reported }
            if configured == "DOOR" && reported == "DOOR_V2"
    ));
    assert!(harness.supervisor.running_modules().is_empty());
    assert!(entries(&journal).is_empty());
}

#[test]
fn start_failure_is_reported_and_nothing_runs() {
    let journal = Journal::default();
    let mut registry = ModuleRegistry::new();
    let mut probe = Probe::new("DOOR", &journal);
    probe.fail_start = true;
    registry.register("libdoor.so", Arc::new(probe));
    let mut harness = Harness::new(registry, &["libdoor.so"], false);
    let store = store("[[modules]]\nname = \"DOOR\"\nfile = \"libdoor.so\"\n").expect("store");
    harness.supervisor.load_module(&store, "DOOR").expect("load");

    let err = harness.supervisor.init_modules().expect_err("start fails");
    assert!(matches!(
        err,
        ModuleError::StartFailed { ref name, ref reason }
            if name == "DOOR" && reason.contains("device unavailable")
    ));
    assert!(harness.supervisor.running_modules().is_empty());
    assert!(harness.supervisor.is_known("DOOR"));
}

#[test]
fn failing_module_drops_out_of_running_list() {
    let journal = Journal::default();
    let mut registry = ModuleRegistry::new();
    let mut probe = Probe::new("DOOR", &journal);
    probe.fail_poll = true;
    registry.register("libdoor.so", Arc::new(probe));
    let mut harness = Harness::new(registry, &["libdoor.so"], false);
    let store = store("[[modules]]\nname = \"DOOR\"\nfile = \"libdoor.so\"\n").expect("store");
    harness.supervisor.load_modules(&store).expect("load");
    harness.supervisor.init_modules().expect("init");

    let deadline = Instant::now() + Duration::from_secs(2);
    while !harness.supervisor.running_modules().is_empty() {
        assert!(Instant::now() < deadline, "module thread never exited");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(harness.supervisor.known_modules(), vec!["DOOR"]);
}

#[test]
fn dump_merges_live_settings_into_the_entry() {
    let journal = Journal::default();
    let mut harness = Harness::new(
        registry(&journal, &[("libdoor.so", "DOOR")]),
        &["libdoor.so"],
        false,
    );
    let store = store(
        r#"
        [[modules]]
        name = "DOOR"
        file = "libdoor.so"
        level = 3
        [modules.module_config]
        open_delay = 4
        "#,
    )
    .expect("store");
    harness.supervisor.load_modules(&store).expect("load");

    assert!(matches!(
        harness.supervisor.dump_config("DOOR", DUMP_TIMEOUT),
        Err(ModuleError::NotRunning(_))
    ));
    assert!(matches!(
        harness.supervisor.dump_config("GHOST", DUMP_TIMEOUT),
        Err(ModuleError::NotLoaded(_))
    ));

    harness.supervisor.init_modules().expect("init");
    let dump = harness
        .supervisor
        .dump_config("DOOR", DUMP_TIMEOUT)
        .expect("dump");
    assert_eq!(dump.name, "DOOR");
    assert_eq!(dump.entry.get_str("file"), Some("libdoor.so"));
    assert_eq!(dump.entry.get_integer("level"), Some(3));
    assert_eq!(dump.entry.get_integer("module_config.open_delay"), Some(4));
    assert_eq!(dump.entry.get_bool("module_config.live"), Some(true));
    assert_eq!(
        dump.additional_files,
        vec![("DOOR.txt".to_owned(), "payload".to_owned())]
    );
}
