//! Config re-read semantics at the supervisor level.

use warden_cli::config;
use warden_cli::supervisor::Supervisor;

const BASE: &str = r#"
[processes.app]
command = "/bin/true"
autostart = false
"#;

#[test]
fn reload_is_idempotent_without_filesystem_changes() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("warden.toml");
    std::fs::write(&path, BASE).unwrap();
    unsafe {
        std::env::set_var("WARDEN_CONFIG", &path);
    }

    let mut sup = Supervisor::new(config::load(&path).unwrap());

    let first = sup.reload_config().unwrap();
    assert_eq!(first, (vec![], vec![], vec![]));
    let second = sup.reload_config().unwrap();
    assert_eq!(second, (vec![], vec![], vec![]));

    // now change the file: the diff reports it, the active group is untouched
    std::fs::write(
        &path,
        r#"
[processes.app]
command = "/bin/false"
autostart = false

[processes.extra]
command = "/bin/true"
autostart = false
"#,
    )
    .unwrap();
    let (added, changed, removed) = sup.reload_config().unwrap();
    assert_eq!(added, vec!["extra"]);
    assert_eq!(changed, vec!["app"]);
    assert!(removed.is_empty());
    assert_eq!(
        sup.groups["app"].by_name("app").unwrap().config.command,
        "/bin/true"
    );

    // applying the change goes through update/add
    let members = sup.update_process_group("app").unwrap();
    assert_eq!(members, vec!["app"]);
    assert_eq!(
        sup.groups["app"].by_name("app").unwrap().config.command,
        "/bin/false"
    );
}

#[test]
fn reload_with_a_broken_file_keeps_the_active_config() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("warden2.toml");
    std::fs::write(&path, BASE).unwrap();

    let sup = Supervisor::new(config::load(&path).unwrap());
    let loaded_before = sup.group_configs.clone();

    std::fs::write(&path, "processes = 42").unwrap();
    assert!(config::load(&path).is_err());

    // nothing about the running supervisor changed
    assert_eq!(sup.group_configs, loaded_before);
    assert!(sup.groups.contains_key("app"));
}
