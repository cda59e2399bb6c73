#![cfg(unix)]

use std::path::Path;
use std::time::Duration;

use cmdgate_tools::{
    AuditConfig, AuditLogger, Bindings, ExecutionStatus, GateDecision, HostEnvironment,
    ReadinessState, ToolCall, ToolError, ToolEvent, ToolExecutor, ToolRegistry, ToolRunner,
    ToolsConfig,
};
use tokio_util::sync::CancellationToken;

fn config() -> ToolsConfig {
    ToolsConfig {
        kill_grace_ms: 200,
        readiness_poll_ms: 50,
        ..ToolsConfig::default()
    }
}

fn runner(tools: &[(&str, String)]) -> ToolRunner {
    let mut registry = ToolRegistry::new(HostEnvironment::Laptop);
    for (id, raw) in tools {
        assert!(registry.register_toml(id, raw).unwrap(), "{id} not registered");
    }
    ToolRunner::new(registry, &config())
}

fn params(pairs: &[(&str, &str)]) -> Bindings {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), serde_json::Value::from(*v)))
        .collect()
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn process_gone(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if kill(Pid::from_raw(pid), None).is_err() {
        return true;
    }
    // Reparented zombies still accept signal 0.
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .is_ok_and(|stat| stat.rsplit(')').next().is_some_and(|rest| rest.trim_start().starts_with('Z')))
}

async fn wait_gone(pid: i32) -> bool {
    for _ in 0..100 {
        if process_gone(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

fn workdir_line(dir: &Path) -> String {
    format!("command_workdir = \"{}\"", dir.display())
}

#[tokio::test]
async fn prerequisites_file_is_returned_in_full() {
    let dir = tempfile::tempdir().unwrap();
    let content = "rust >= 1.88\ndocker\njust\n";
    std::fs::write(dir.path().join("prerequisites.info"), content).unwrap();
    let raw = format!(
        "command = \"cat prerequisites.info\"\n{}\n[output_filter]\nlimit_lines = 100",
        workdir_line(dir.path())
    );
    let r = runner(&[("prerequisites", raw)]);

    let result = r.invoke("prerequisites", &Bindings::new()).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed { exit_code: Some(0) });
    assert_eq!(result.output, content);
    assert_eq!(result.command, "cat prerequisites.info");
    assert_eq!(result.decision, GateDecision::Allow);
    assert_eq!(result.stats.raw_lines, 3);
    assert_eq!(result.stats.raw_bytes, content.len());
}

#[tokio::test]
async fn denied_command_spawns_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let raw = format!(
        r#"
        command = "%cmd%"
        {}
        [[parameters]]
        name = "cmd"
        [confirmation]
        deny = ["sudo*", "*touch*"]
        "#,
        workdir_line(dir.path())
    );
    let r = runner(&[("shell", raw)]);

    let result = r
        .invoke("shell", &params(&[("cmd", "sudo rm -rf /")]))
        .await
        .unwrap();
    assert_eq!(
        result.status,
        ExecutionStatus::Denied {
            pattern: "sudo*".into()
        }
    );
    assert!(result.output.is_empty());

    let result = r
        .invoke_confirmed("shell", &params(&[("cmd", "touch marker")]))
        .await
        .unwrap();
    assert!(matches!(result.status, ExecutionStatus::Denied { .. }));
    assert!(!dir.path().join("marker").exists());
}

#[tokio::test]
async fn ask_user_requires_confirmation_then_runs() {
    let dir = tempfile::tempdir().unwrap();
    let raw = format!(
        "command = \"touch marker\"\n{}\n[confirmation]\nask_user = [\"touch*\"]",
        workdir_line(dir.path())
    );
    let r = runner(&[("touch", raw)]);

    let result = r.invoke("touch", &Bindings::new()).await.unwrap();
    assert_eq!(
        result.status,
        ExecutionStatus::ConfirmationRequired {
            pattern: "touch*".into()
        }
    );
    assert!(!dir.path().join("marker").exists());
    assert!(matches!(result.error(), Some(ToolError::ConfirmationRequired { .. })));

    let result = r.invoke_confirmed("touch", &Bindings::new()).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed { exit_code: Some(0) });
    assert!(dir.path().join("marker").exists());
}

#[tokio::test]
async fn deny_beats_ask_even_when_confirmed() {
    let raw = r#"
        command = "rm -rf build"
        [confirmation]
        ask_user = ["*"]
        deny = ["*rm -rf*"]
    "#
    .to_owned();
    let r = runner(&[("clean", raw)]);
    let check = r.check("clean", &Bindings::new()).unwrap();
    assert_eq!(
        check.decision,
        GateDecision::Deny {
            pattern: "*rm -rf*".into()
        }
    );
    let result = r.invoke_confirmed("clean", &Bindings::new()).await.unwrap();
    assert!(matches!(result.status, ExecutionStatus::Denied { .. }));
}

#[tokio::test]
async fn timeout_kills_process_group_and_keeps_partial_output() {
    let dir = tempfile::tempdir().unwrap();
    let raw = format!(
        "command = \"sleep 30 & echo $! > child.pid; echo started; wait\"\ntimeout = 0.5\n{}",
        workdir_line(dir.path())
    );
    let r = runner(&[("slow", raw)]);

    let started = std::time::Instant::now();
    let result = r.invoke("slow", &Bindings::new()).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::TimedOut);
    assert_eq!(result.output, "started\n");
    assert!(started.elapsed() < Duration::from_secs(10));

    let pid: i32 = std::fs::read_to_string(dir.path().join("child.pid"))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(wait_gone(pid).await, "background child {pid} survived");
}

#[tokio::test]
async fn grep_filter_through_runner() {
    let raw = r#"
        command = "printf 'a\nERROR x\nb\nc\n'"
        [output_filter]
        grep = "(?i)error"
        grep_context_lines = 1
    "#
    .to_owned();
    let r = runner(&[("log", raw)]);
    let result = r.invoke("log", &Bindings::new()).await.unwrap();
    assert_eq!(result.output, "a\nERROR x\nb\n");
    assert_eq!(result.stats.raw_lines, 4);
    assert_eq!(result.stats.filtered_lines, 3);
}

#[tokio::test]
async fn unknown_tool_and_invalid_params() {
    let raw = "command = \"cat %file%\"\n[[parameters]]\nname = \"file\"".to_owned();
    let r = runner(&[("cat", raw)]);
    assert!(matches!(
        r.invoke("nope", &Bindings::new()).await,
        Err(ToolError::UnknownTool { .. })
    ));
    assert!(matches!(
        r.invoke("cat", &Bindings::new()).await,
        Err(ToolError::InvalidParams { .. })
    ));
}

#[tokio::test]
async fn missing_workdir_is_spawn_error() {
    let raw = "command = \"ls\"\ncommand_workdir = \"/nonexistent/cmdgate\"".to_owned();
    let r = runner(&[("ls", raw)]);
    assert!(matches!(
        r.invoke("ls", &Bindings::new()).await,
        Err(ToolError::Spawn { .. })
    ));
}

#[tokio::test]
async fn cancellation_folds_into_status() {
    let raw = "command = \"echo waiting; sleep 30\"".to_owned();
    let r = runner(&[("wait", raw)]);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });
    let result = r
        .invoke_with_cancel("wait", &Bindings::new(), false, &cancel)
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Cancelled);
    assert_eq!(result.output, "waiting\n");
}

#[tokio::test]
async fn readiness_port_never_opened_times_out_and_keeps_running() {
    let port = free_port();
    let raw = format!(
        "command = \"echo booting; sleep 30\"\nstartup_wait = 0.5\nstartup_wait_port = {port}"
    );
    let r = runner(&[("server", raw)]);

    let started = std::time::Instant::now();
    let result = r.invoke("server", &Bindings::new()).await.unwrap();
    assert_eq!(
        result.status,
        ExecutionStatus::Started {
            readiness: ReadinessState::TimedOut
        }
    );
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(result.output, "booting\n");

    let status = r.service_status("server").await.unwrap();
    assert!(status.running);
    let stopped = r.stop_service("server").await.unwrap();
    assert!(!stopped.running);
    assert!(r.service_status("server").await.is_none());
}

#[tokio::test]
async fn readiness_keyword_reaches_ready() {
    let raw = r#"
        command = "sleep 0.2; echo 'Serving HTTP'; sleep 30"
        startup_wait = 5
        startup_wait_keyword = "Serving"
    "#
    .to_owned();
    let r = runner(&[("http", raw)]);
    let result = r.invoke("http", &Bindings::new()).await.unwrap();
    assert_eq!(
        result.status,
        ExecutionStatus::Started {
            readiness: ReadinessState::Ready
        }
    );
    assert!(result.status.is_success());
    assert!(result.output.contains("Serving HTTP"));
    assert_eq!(r.running_services().await, vec!["http"]);
    assert_eq!(r.shutdown().await.len(), 1);
    assert!(r.running_services().await.is_empty());
}

#[tokio::test]
async fn cancel_during_readiness_terminates_group() {
    let dir = tempfile::tempdir().unwrap();
    let raw = format!(
        r#"
        command = "sleep 30 & echo $! > bg.pid; echo $$ > leader.pid; echo booting; wait"
        {}
        startup_wait = 10
        startup_wait_keyword = "never printed"
        "#,
        workdir_line(dir.path())
    );
    let r = runner(&[("api", raw)]);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let result = r
        .invoke_with_cancel("api", &Bindings::new(), false, &cancel)
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Cancelled);
    assert_eq!(result.output, "booting\n");
    assert!(started.elapsed() < Duration::from_secs(5));

    for file in ["bg.pid", "leader.pid"] {
        let pid: i32 = std::fs::read_to_string(dir.path().join(file))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(wait_gone(pid).await, "{file} process {pid} survived cancel");
    }
    assert!(r.service_status("api").await.is_none());
    assert!(r.running_services().await.is_empty());
}

#[tokio::test]
async fn readiness_port_open_reaches_ready() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let raw = format!("command = \"sleep 30\"\nstartup_wait = 5\nstartup_wait_port = \"{port}\"");
    let r = runner(&[("db", raw)]);
    let result = r.invoke("db", &Bindings::new()).await.unwrap();
    assert_eq!(
        result.status,
        ExecutionStatus::Started {
            readiness: ReadinessState::Ready
        }
    );
    r.shutdown().await;
}

#[tokio::test]
async fn service_exiting_early_reports_exit_code() {
    let raw = r#"
        command = "echo 'address in use'; exit 3"
        startup_wait = 5
        startup_wait_keyword = "listening"
    "#
    .to_owned();
    let r = runner(&[("broken", raw)]);
    let result = r.invoke("broken", &Bindings::new()).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed { exit_code: Some(3) });
    assert_eq!(result.output, "address in use\n");
    assert!(r.service_status("broken").await.is_none());
}

#[tokio::test]
async fn relaunch_stops_previous_instance() {
    let raw = r#"
        command = "echo up; sleep 30"
        startup_wait = 5
        startup_wait_keyword = "up"
    "#
    .to_owned();
    let r = runner(&[("svc", raw)]);
    r.invoke("svc", &Bindings::new()).await.unwrap();
    let first = r.service_status("svc").await.unwrap();
    r.invoke("svc", &Bindings::new()).await.unwrap();
    let second = r.service_status("svc").await.unwrap();

    assert_ne!(first.pid, second.pid);
    let first_pid = i32::try_from(first.pid.unwrap()).unwrap();
    assert!(wait_gone(first_pid).await);
    r.shutdown().await;
}

#[tokio::test]
async fn events_are_emitted_in_order() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let raw = "command = \"echo hello\"".to_owned();
    let r = runner(&[("hello", raw)]).with_tool_event_tx(tx);
    let result = r.invoke("hello", &Bindings::new()).await.unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(matches!(
        events.first(),
        Some(ToolEvent::Started { command, .. }) if command == "echo hello"
    ));
    assert!(events
        .iter()
        .any(|e| matches!(e, ToolEvent::OutputChunk { chunk, .. } if chunk.contains("hello"))));
    assert!(matches!(
        events.last(),
        Some(ToolEvent::Completed { invocation_id, status, .. })
            if *invocation_id == result.invocation_id && status.is_success()
    ));
}

#[tokio::test]
async fn audit_trail_records_each_decision() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    let logger = AuditLogger::from_config(&AuditConfig {
        enabled: true,
        destination: path.display().to_string(),
    })
    .await
    .unwrap();
    let r = runner(&[
        ("ok", "command = \"true\"".to_owned()),
        (
            "blocked",
            "command = \"sudo ls\"\n[confirmation]\ndeny = [\"sudo*\"]".to_owned(),
        ),
    ])
    .with_audit(logger);

    r.invoke("ok", &Bindings::new()).await.unwrap();
    r.invoke("blocked", &Bindings::new()).await.unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<serde_json::Value> = content
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["tool"], "ok");
    assert_eq!(lines[0]["result"]["type"], "success");
    assert_eq!(lines[1]["result"]["type"], "blocked");
    assert_eq!(lines[1]["result"]["pattern"], "sudo*");
}

#[tokio::test]
async fn tool_executor_trait_dispatch() {
    let raw = "command = \"echo %word%\"\n[[parameters]]\nname = \"word\"".to_owned();
    let r = runner(&[("echo", raw)]);
    let call = ToolCall::new("echo").with_param("word", 7);
    let result = r.execute_tool_call(&call).await.unwrap();
    assert_eq!(result.output, "7\n");
    let result = r.execute_confirmed(&call).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed { exit_code: Some(0) });
}
