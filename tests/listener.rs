//! Event-listener delivery against a real listener child speaking the
//! READY/RESULT protocol.

use std::time::{Duration, Instant};
use warden_cli::config::{self, GroupConfig};
use warden_cli::states::{ListenerState, ProcessState};
use warden_cli::supervisor::Supervisor;

fn load(dir: &tempfile::TempDir, body: &str) -> Vec<GroupConfig> {
    let path = dir.path().join("warden.toml");
    std::fs::write(&path, body).unwrap();
    config::load(&path).unwrap()
}

fn tick_until(
    sup: &mut Supervisor,
    timeout: Duration,
    mut pred: impl FnMut(&Supervisor) -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        sup.tick();
        if pred(sup) {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

const LISTENER_SCRIPT: &str = r#"
while :; do
  printf 'READY\n'
  IFS= read -r header || exit 0
  len=${header##*len:}
  head -c "$len" >/dev/null
  printf 'RESULT 2\nOK'
done
"#;

#[test]
fn listener_acknowledges_buffered_state_events() {
    let dir = tempfile::TempDir::new().unwrap();
    let script = dir.path().join("listener.sh");
    std::fs::write(&script, LISTENER_SCRIPT).unwrap();

    let mut sup = Supervisor::new(load(
        &dir,
        &format!(
            r#"
[pools.audit]
events = ["PROCESS_STATE"]
buffer_size = 8

[processes.listener0]
group = "audit"
command = "/bin/sh {script}"
startsecs = 0
stdout_logfile = "{dir}/listener0.out.log"
stderr_logfile = "{dir}/listener0.err.log"
"#,
            script = script.display(),
            dir = dir.path().display()
        ),
    ));

    // the listener's own STARTING/RUNNING events land in the pool buffer and
    // are drained once it reports READY
    assert!(tick_until(&mut sup, Duration::from_secs(20), |sup| {
        let group = &sup.groups["audit"];
        let listener = group.by_name("listener0").unwrap();
        listener.state == ProcessState::Running
            && listener.listener_state == Some(ListenerState::Ready)
            && group.pool.as_ref().unwrap().event_buffer.is_empty()
    }));

    let listener = sup.groups["audit"].by_name("listener0").unwrap();
    assert_ne!(listener.listener_state, Some(ListenerState::Unknown));
    assert!(listener.event.is_none());

    // shut the listener down cleanly
    sup.with_process("audit", "listener0", |proc, bus| {
        proc.stop(false, bus);
    })
    .unwrap();
    assert!(tick_until(&mut sup, Duration::from_secs(10), |sup| {
        sup.groups["audit"]
            .by_name("listener0")
            .unwrap()
            .state
            .in_all_stopped_states()
    }));
}
