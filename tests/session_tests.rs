use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio::time::timeout;

use runhub::config::{BuilderConfig, Config, MilliSecond, PolicyConfig};
use runhub::exec::ExecEnv;
use runhub::registry::SessionRegistry;
use runhub::session::{ClientEvent, ServerEvent, Session, SessionState};
use runhub::source::SourceRef;

// Global counter to ensure unique work directories
static TEST_DIR_COUNTER: AtomicU32 = AtomicU32::new(0);

/// "Compiles" a shell script: rejects files without an interpreter line,
/// otherwise copies the script into place and marks it executable
const SCRIPT_BUILDER: &str = "head -n 1 %INPUT% | grep -q '^#!' \
    || { echo 'error: missing interpreter line' >&2; exit 1; }; \
    cp %INPUT% %OUTPUT% && chmod +x %OUTPUT%";

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

// Test guard that removes the work directory on drop
struct TestDirGuard {
    path: PathBuf,
}

impl TestDirGuard {
    fn new() -> Self {
        let id = TEST_DIR_COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!("runhub-session-{}-{id}", std::process::id()));
        let _ = fs::remove_dir_all(&path);
        Self { path }
    }

    fn is_empty(&self) -> bool {
        fs::read_dir(&self.path).map(|d| d.count() == 0).unwrap_or(true)
    }
}

impl Drop for TestDirGuard {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

fn script_config(work_dir: &Path, policy: PolicyConfig) -> Config {
    Config {
        builder: BuilderConfig {
            command: vec!["sh".into(), "-c".into(), SCRIPT_BUILDER.into()],
            source_extension: "sh".into(),
            timeout: MilliSecond(5_000),
        },
        policy,
        work_dir: Some(work_dir.to_path_buf()),
        ..Default::default()
    }
}

fn default_policy() -> PolicyConfig {
    PolicyConfig {
        inactivity_timeout: MilliSecond(10_000),
        cleanup_retry_delay: MilliSecond(50),
        ..Default::default()
    }
}

fn make_env(dir: &TestDirGuard, policy: PolicyConfig) -> Arc<ExecEnv> {
    Arc::new(ExecEnv::from_config(&script_config(&dir.path, policy)).unwrap())
}

fn run_event(code: &str) -> ClientEvent {
    ClientEvent::Run {
        source: SourceRef::Code(code.to_string()),
        input: None,
    }
}

fn output_text(events: &[ServerEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::Output { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

fn is_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

struct Client {
    session: Arc<Session>,
    events: mpsc::UnboundedReceiver<ServerEvent>,
}

impl Client {
    fn start(env: Arc<ExecEnv>) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let session = Session::start("test", env, tx);
        Self { session, events }
    }

    fn send(&self, event: ClientEvent) {
        assert!(self.session.send(event));
    }

    async fn next(&mut self) -> ServerEvent {
        timeout(EVENT_TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("session channel closed")
    }

    /// Collects events up to and including `done`
    async fn until_done(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        loop {
            let event = self.next().await;
            let done = event == ServerEvent::Done;
            events.push(event);
            if done {
                return events;
            }
        }
    }

    async fn until_compiled(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        loop {
            let event = self.next().await;
            assert_ne!(event, ServerEvent::Done, "run ended before compiling: {events:?}");
            let compiled = event == ServerEvent::Compiled;
            events.push(event);
            if compiled {
                return events;
            }
        }
    }

    /// Reads output until a `pid=<n>` line shows up
    async fn until_pid(&mut self) -> i32 {
        let mut text = String::new();
        loop {
            if let ServerEvent::Output { text: chunk } = self.next().await {
                text.push_str(&chunk);
            }
            if let Some(start) = text.find("pid=") {
                let rest = &text[start + 4..];
                if let Some(end) = rest.find('\n') {
                    return rest[..end].trim().parse().unwrap();
                }
            }
        }
    }
}

#[tokio::test]
async fn test_compile_failure_reports_once_and_cleans_up() {
    let dir = TestDirGuard::new();
    let mut client = Client::start(make_env(&dir, default_policy()));

    client.send(run_event("echo 'no interpreter line'"));
    let events = client.until_done().await;

    let failures = events
        .iter()
        .filter(|e| matches!(e, ServerEvent::Output { text } if text.contains("Compilation failed")))
        .count();
    assert_eq!(failures, 1);
    assert!(!events.contains(&ServerEvent::Compiled));
    assert_eq!(
        output_text(&events),
        "Compiling...\nCompilation failed:\nerror: missing interpreter line\n"
    );
    assert!(dir.is_empty());
    assert_eq!(client.session.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_multibyte_output_across_read_boundary() {
    let dir = TestDirGuard::new();
    let mut client = Client::start(make_env(&dir, default_policy()));

    // 4095 ASCII bytes put the two bytes of "é" on either side of a 4 KiB read
    client.send(run_event("#!/bin/sh\nprintf '%4095s\\303\\251' '' | tr ' ' a"));
    let text = output_text(&client.until_done().await);

    let expected = format!("{}é", "a".repeat(4095));
    assert!(!text.contains('\u{FFFD}'));
    assert!(text.contains(&expected));
    assert!(text.ends_with("é\n[Process exited with code 0]\n"));
}

#[tokio::test]
async fn test_interactive_echo() {
    let dir = TestDirGuard::new();
    let mut client = Client::start(make_env(&dir, default_policy()));

    client.send(run_event("#!/bin/sh\nread line\necho \"got: $line\""));
    client.until_compiled().await;

    client.send(ClientEvent::Input {
        text: "hello".to_string(),
    });
    let text = output_text(&client.until_done().await);

    assert!(text.contains("got: hello\n"), "{text}");
    assert!(text.ends_with("\n[Process exited with code 0]\n"), "{text}");
    assert!(dir.is_empty());
}

#[tokio::test]
async fn test_initial_input_is_framed_as_a_line() {
    let dir = TestDirGuard::new();
    let mut client = Client::start(make_env(&dir, default_policy()));

    client.send(ClientEvent::Run {
        source: SourceRef::Code("#!/bin/sh\nread a\nread b\necho \"$a-$b\"".to_string()),
        input: Some("left\nright".to_string()),
    });
    let text = output_text(&client.until_done().await);

    assert!(text.contains("left-right\n"), "{text}");
}

#[tokio::test]
async fn test_nonzero_exit_and_stderr_are_relayed() {
    let dir = TestDirGuard::new();
    let mut client = Client::start(make_env(&dir, default_policy()));

    client.send(run_event("#!/bin/sh\necho broken >&2\nexit 4"));
    let text = output_text(&client.until_done().await);

    assert!(text.contains("broken\n"), "{text}");
    assert!(text.ends_with("\n[Process exited with code 4]\n"), "{text}");
}

#[tokio::test]
async fn test_inactivity_timeout_kills_and_cleans_up() {
    let dir = TestDirGuard::new();
    let policy = PolicyConfig {
        inactivity_timeout: MilliSecond(300),
        ..default_policy()
    };
    let mut client = Client::start(make_env(&dir, policy));

    client.send(run_event("#!/bin/sh\necho \"pid=$$\"\nsleep 30"));
    client.until_compiled().await;
    let pid = client.until_pid().await;
    let text = output_text(&client.until_done().await);

    assert!(text.contains("[Process killed: inactivity timeout]"), "{text}");
    assert!(!is_alive(pid));
    assert!(dir.is_empty());
}

#[tokio::test]
async fn test_output_keeps_the_inactivity_timer_alive() {
    let dir = TestDirGuard::new();
    let policy = PolicyConfig {
        inactivity_timeout: MilliSecond(400),
        ..default_policy()
    };
    let mut client = Client::start(make_env(&dir, policy));

    client.send(run_event(
        "#!/bin/sh\nfor i in 1 2 3 4 5 6 7 8; do echo tick; sleep 0.1; done",
    ));
    let text = output_text(&client.until_done().await);

    assert_eq!(text.matches("tick").count(), 8);
    assert!(text.ends_with("\n[Process exited with code 0]\n"), "{text}");
}

#[tokio::test]
async fn test_interactive_wall_clock_cap() {
    let dir = TestDirGuard::new();
    let policy = PolicyConfig {
        interactive_hard_timeout: Some(MilliSecond(1_000)),
        ..default_policy()
    };
    let mut client = Client::start(make_env(&dir, policy));

    client.send(run_event("#!/bin/sh\nwhile true; do echo busy; sleep 0.1; done"));
    let text = output_text(&client.until_done().await);

    assert!(text.contains("[Process killed: 1 second timeout]"), "{text}");
    assert!(dir.is_empty());
}

#[tokio::test]
async fn test_stop_kills_running_process() {
    let dir = TestDirGuard::new();
    let mut client = Client::start(make_env(&dir, default_policy()));

    client.send(run_event("#!/bin/sh\necho \"pid=$$\"\nwhile true; do sleep 1; done"));
    client.until_compiled().await;
    let pid = client.until_pid().await;
    assert!(is_alive(pid));

    client.send(ClientEvent::Stop);
    let text = output_text(&client.until_done().await);

    assert!(text.contains("[Process killed: stopped by user]"), "{text}");
    assert!(!is_alive(pid));
    assert!(dir.is_empty());
    assert_eq!(client.session.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_stop_without_process_reports_it() {
    let dir = TestDirGuard::new();
    let mut client = Client::start(make_env(&dir, default_policy()));

    client.send(ClientEvent::Stop);
    assert_eq!(client.next().await, ServerEvent::output("[No active process]\n"));

    // and no terminal event follows
    let extra = timeout(Duration::from_millis(200), client.events.recv()).await;
    assert!(extra.is_err(), "unexpected event {extra:?}");
}

#[tokio::test]
async fn test_stop_during_build_cancels_it() {
    let dir = TestDirGuard::new();
    let mut config = script_config(&dir.path, default_policy());
    config.builder.command = vec![
        "sh".into(),
        "-c".into(),
        "sleep 30; cp %INPUT% %OUTPUT%".into(),
    ];
    let env = Arc::new(ExecEnv::from_config(&config).unwrap());
    let mut client = Client::start(env);

    client.send(run_event("#!/bin/sh\necho never"));
    assert_eq!(client.next().await, ServerEvent::output("Compiling...\n"));
    client.send(ClientEvent::Stop);
    let events = client.until_done().await;

    assert!(output_text(&events).contains("[Build cancelled: stopped by user]"));
    assert!(!events.contains(&ServerEvent::Compiled));
    assert!(dir.is_empty());
}

#[tokio::test]
async fn test_new_run_replaces_running_process() {
    let dir = TestDirGuard::new();
    let mut client = Client::start(make_env(&dir, default_policy()));

    client.send(run_event("#!/bin/sh\necho \"pid=$$\"\nwhile true; do sleep 1; done"));
    client.until_compiled().await;
    let first_pid = client.until_pid().await;

    client.send(run_event("#!/bin/sh\necho second"));
    let first = output_text(&client.until_done().await);
    assert!(first.contains("[Process killed: restarted by new run]"), "{first}");
    assert!(!is_alive(first_pid));

    let second = output_text(&client.until_done().await);
    assert!(second.starts_with("Compiling...\n"), "{second}");
    assert!(second.contains("second\n"), "{second}");
    assert!(dir.is_empty());
}

#[tokio::test]
async fn test_every_run_gets_exactly_one_done() {
    let dir = TestDirGuard::new();
    let mut client = Client::start(make_env(&dir, default_policy()));
    let mut events = Vec::new();

    client.send(run_event("not a script"));
    events.extend(client.until_done().await);
    client.send(run_event("#!/bin/sh\necho ok"));
    events.extend(client.until_done().await);
    client.send(ClientEvent::Run {
        source: SourceRef::Program("missing".to_string()),
        input: None,
    });
    events.extend(client.until_done().await);
    client.send(run_event("#!/bin/sh\nsleep 30"));
    client.until_compiled().await;
    client.send(ClientEvent::Stop);
    events.extend(client.until_done().await);

    let text = output_text(&events);
    assert_eq!(events.iter().filter(|e| **e == ServerEvent::Done).count(), 4);
    assert!(text.contains("Compilation failed"), "{text}");
    assert!(text.contains("ok\n"), "{text}");
    assert!(text.contains("Failed to prepare source: unknown program `missing`"), "{text}");
    assert!(text.contains("stopped by user"), "{text}");
    let extra = timeout(Duration::from_millis(200), client.events.recv()).await;
    assert!(extra.is_err(), "unexpected event {extra:?}");
    assert!(dir.is_empty());
}

#[tokio::test]
async fn test_burst_of_runs_terminates_each_one() {
    let dir = TestDirGuard::new();
    let mut client = Client::start(make_env(&dir, default_policy()));

    client.send(run_event("#!/bin/sh\nsleep 30"));
    client.send(run_event("#!/bin/sh\nsleep 30"));
    client.send(run_event("#!/bin/sh\nsleep 30"));
    client.send(ClientEvent::Stop);

    let mut events = Vec::new();
    for _ in 0..3 {
        events.extend(client.until_done().await);
    }

    assert_eq!(events.iter().filter(|e| **e == ServerEvent::Done).count(), 3);
    let extra = timeout(Duration::from_millis(300), client.events.recv()).await;
    assert!(extra.is_err(), "unexpected event {extra:?}");
    assert_eq!(client.session.state(), SessionState::Idle);
    assert!(dir.is_empty());
}

#[tokio::test]
async fn test_spawn_failure_is_reported_and_cleaned_up() {
    let dir = TestDirGuard::new();
    let mut config = script_config(&dir.path, default_policy());
    // artifact without the executable bit
    config.builder.command = vec!["sh".into(), "-c".into(), "cp %INPUT% %OUTPUT%".into()];
    let env = Arc::new(ExecEnv::from_config(&config).unwrap());
    let mut client = Client::start(env);

    client.send(run_event("#!/bin/sh\necho hi"));
    let text = output_text(&client.until_done().await);

    assert!(text.contains("Failed to start process"), "{text}");
    assert!(dir.is_empty());
}

#[tokio::test]
async fn test_disconnect_mid_run_kills_and_cleans_up() {
    let dir = TestDirGuard::new();
    let registry = SessionRegistry::new(make_env(&dir, default_policy()));
    let (tx, events) = mpsc::unbounded_channel();
    let session = registry.attach("conn-test", tx);
    let mut client = Client { session, events };

    client.send(run_event("#!/bin/sh\necho \"pid=$$\"\nwhile true; do sleep 1; done"));
    client.until_compiled().await;
    let pid = client.until_pid().await;

    let session = registry.detach("conn-test").unwrap();
    timeout(EVENT_TIMEOUT, session.closed()).await.unwrap();

    assert_eq!(session.state(), SessionState::Closed);
    assert!(!is_alive(pid));
    assert!(dir.is_empty());
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_dropped_client_channel_tears_session_down() {
    let dir = TestDirGuard::new();
    let mut client = Client::start(make_env(&dir, default_policy()));

    client.send(run_event("#!/bin/sh\necho \"pid=$$\"\nwhile true; do sleep 1; done"));
    client.until_compiled().await;
    let pid = client.until_pid().await;

    let Client { session, events } = client;
    drop(events);
    timeout(EVENT_TIMEOUT, session.closed()).await.unwrap();

    assert!(!is_alive(pid));
    assert!(dir.is_empty());
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let dir = TestDirGuard::new();
    let env = make_env(&dir, default_policy());
    let mut slow = Client::start(env.clone());
    let mut fast = Client::start(env);

    slow.send(run_event("#!/bin/sh\nwhile true; do sleep 1; done"));
    slow.until_compiled().await;

    fast.send(run_event("#!/bin/sh\necho quick"));
    let text = output_text(&fast.until_done().await);
    assert!(text.contains("quick\n"), "{text}");
    assert_eq!(slow.session.state(), SessionState::Running);

    slow.send(ClientEvent::Stop);
    slow.until_done().await;
    assert!(dir.is_empty());
}
