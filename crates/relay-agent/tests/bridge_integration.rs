mod support;

use relay_agent::{
    Bridge, BridgeError, BridgeEvent, SpawnRequest, SubagentStatus, SubmitOutcome,
};
use serde_json::json;
use std::time::Duration;
use support::{
    INIT_S1, RESULT_42, collect_until, load_registry, print_lines, test_config, wait_until,
    write_sh_manifest,
};
use tempfile::tempdir;

const WAIT: Duration = Duration::from_secs(10);

fn result_line(answer: &str) -> String {
    format!(r#"{{"type":"result","session_id":"w1","result":"{answer}","is_error":false}}"#)
}

#[tokio::test(flavor = "current_thread")]
async fn subagent_runs_without_making_the_conversation_busy() {
    let dir = tempdir().expect("temp dir should be created");
    let script = format!("sleep 0.2; {}", print_lines(&[result_line("audit clean").as_str()]));
    write_sh_manifest(dir.path(), "echo-agent", json!({}), &script);
    let bridge = Bridge::new(test_config(dir.path()), load_registry(dir.path()))
        .expect("bridge should build");

    let ticket = bridge
        .spawn_subagent("chat-1", SpawnRequest::new("audit deps").with_label("audit"))
        .expect("spawn should be accepted");
    let run_id = ticket.run_id.clone();
    assert!(!bridge.sessions().is_busy("chat-1"));

    let record = bridge
        .wait_for_subagent(ticket, Some(WAIT))
        .await
        .expect("lane should deliver")
        .expect("subagent should finish in time");
    assert_eq!(record.run_id, run_id);
    assert_eq!(record.status, SubagentStatus::Completed);
    assert_eq!(record.result.as_deref(), Some("audit clean"));
    assert_eq!(record.parent_session_id.as_deref(), Some("chat-1"));
    assert!(bridge.sessions().get_subagent(&run_id).is_none());
}

#[tokio::test(flavor = "current_thread")]
async fn finished_subagent_results_are_injected_once() {
    let dir = tempdir().expect("temp dir should be created");
    let prompt_log = dir.path().join("prompt.log");
    write_sh_manifest(
        dir.path(),
        "worker",
        json!({}),
        &print_lines(&[result_line("3 crates outdated").as_str()]),
    );
    let foreground = format!(
        r#"printf '%s' "$1" > "$PROMPT_LOG"; {}"#,
        print_lines(&[INIT_S1, RESULT_42])
    );
    write_sh_manifest(
        dir.path(),
        "echo-agent",
        json!({ "env": { "PROMPT_LOG": prompt_log.display().to_string() } }),
        &foreground,
    );
    let bridge = Bridge::new(test_config(dir.path()), load_registry(dir.path()))
        .expect("bridge should build");

    let ticket = bridge
        .spawn_subagent(
            "chat-1",
            SpawnRequest::new("check outdated crates").with_engine("worker"),
        )
        .expect("spawn should be accepted");
    let run_id = ticket.run_id.clone();
    bridge
        .wait_for_subagent(ticket, Some(WAIT))
        .await
        .expect("lane should deliver");

    let SubmitOutcome::Turn(summary) = bridge.submit("chat-1", "what next?").await.expect("turn")
    else {
        panic!("expected a turn");
    };
    assert_eq!(summary.injected_runs, vec![run_id.clone()]);
    let prompt = std::fs::read_to_string(&prompt_log).expect("prompt log should exist");
    assert!(prompt.contains("3 crates outdated"));
    assert!(prompt.ends_with("what next?"));
    assert!(bridge.subagents().get(&run_id).is_some_and(|run| run.results_injected));

    let SubmitOutcome::Turn(second) = bridge.submit("chat-1", "and now?").await.expect("turn")
    else {
        panic!("expected a turn");
    };
    assert!(second.injected_runs.is_empty());
    let prompt = std::fs::read_to_string(&prompt_log).expect("prompt log should exist");
    assert_eq!(prompt, "and now?");
}

#[tokio::test(flavor = "current_thread")]
async fn messages_queue_while_busy_and_drain_in_order() {
    let dir = tempdir().expect("temp dir should be created");
    let script = format!(
        r#"sleep 0.3; printf '{{"type":"result","session_id":"s1","result":"%s","is_error":false}}\n' "$1""#
    );
    write_sh_manifest(dir.path(), "echo-agent", json!({}), &script);
    let bridge = Bridge::new(test_config(dir.path()), load_registry(dir.path()))
        .expect("bridge should build");
    let mut events = bridge.subscribe();

    let first = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.submit("chat-1", "first").await })
    };
    assert!(wait_until(WAIT, || bridge.sessions().is_busy("chat-1")).await);

    assert_eq!(
        bridge.submit("chat-1", "second").await.expect("submit"),
        SubmitOutcome::Queued { position: 1 }
    );
    assert_eq!(
        bridge.submit("chat-1", "third").await.expect("submit"),
        SubmitOutcome::Queued { position: 2 }
    );

    let first = first.await.expect("task should join").expect("turn should run");
    assert!(matches!(first, SubmitOutcome::Turn(ref summary) if summary.answer == "first"));

    let mut completed = 0;
    let seen = collect_until(&mut events, WAIT, |event| {
        if matches!(event.event, BridgeEvent::Completed { .. }) {
            completed += 1;
        }
        completed == 3
    })
    .await;
    let answers: Vec<_> = seen
        .iter()
        .filter_map(|event| match &event.event {
            BridgeEvent::Completed { answer, .. } => Some(answer.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(answers, vec!["first", "second", "third"]);
    assert!(wait_until(WAIT, || bridge.sessions().queue_length("chat-1") == 0).await);
}

#[tokio::test(flavor = "current_thread")]
async fn spec_mode_plans_refines_and_executes() {
    let dir = tempdir().expect("temp dir should be created");
    let script = r#"if [ "$1" = "--plan" ]; then
printf '%s\n' '{"type":"system","subtype":"init","session_id":"p1"}'
printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"ExitPlanMode","input":{"plan":"1. add tests"}}]}}'
printf '%s\n' '{"type":"result","session_id":"p1","result":"plan ready","is_error":false}'
else
printf '%s\n' '{"type":"result","session_id":"p1","result":"implemented","is_error":false}'
fi"#;
    write_sh_manifest(
        dir.path(),
        "echo-agent",
        json!({ "plan_mode_args": ["--plan"] }),
        script,
    );
    let bridge = Bridge::new(test_config(dir.path()), load_registry(dir.path()))
        .expect("bridge should build");

    let planned = bridge
        .enter_spec_mode("chat-1", "add tests")
        .await
        .expect("planning turn should run");
    assert!(matches!(
        planned,
        SubmitOutcome::Turn(ref summary) if summary.plan.as_deref() == Some("1. add tests")
    ));
    let state = bridge.spec_mode().get_spec_mode("chat-1").expect("spec mode active");
    assert_eq!(state.pending_plan.as_deref(), Some("1. add tests"));

    let refined = bridge
        .submit("chat-1", "What about tests?")
        .await
        .expect("refinement turn should run");
    assert!(matches!(refined, SubmitOutcome::Turn(ref summary) if summary.plan.is_some()));
    assert!(bridge.spec_mode().is_in_spec_mode("chat-1"));

    let executed = bridge.submit("chat-1", "yes").await.expect("execution turn");
    assert!(matches!(
        executed,
        SubmitOutcome::Turn(ref summary) if summary.answer == "implemented"
    ));
    assert!(!bridge.spec_mode().is_in_spec_mode("chat-1"));

    bridge
        .enter_spec_mode("chat-1", "rewrite everything")
        .await
        .expect("planning turn should run");
    assert_eq!(
        bridge.submit("chat-1", "cancel").await.expect("cancel"),
        SubmitOutcome::SpecCancelled
    );
    assert!(bridge.spec_mode().get_spec_mode("chat-1").is_none());
}

#[tokio::test(flavor = "current_thread")]
async fn stopping_a_running_subagent_terminates_it() {
    let dir = tempdir().expect("temp dir should be created");
    write_sh_manifest(dir.path(), "echo-agent", json!({}), "exec sleep 30");
    let bridge = Bridge::new(test_config(dir.path()), load_registry(dir.path()))
        .expect("bridge should build");

    let ticket = bridge
        .spawn_subagent("chat-1", SpawnRequest::new("long task"))
        .expect("spawn should be accepted");
    let run_id = ticket.run_id.clone();
    assert!(
        wait_until(WAIT, || {
            bridge
                .sessions()
                .get_subagent(&run_id)
                .is_some_and(|session| session.is_running())
        })
        .await
    );

    assert!(bridge.stop_subagent(&run_id).expect("run exists"));
    let record = bridge
        .wait_for_subagent(ticket, Some(WAIT))
        .await
        .expect("lane should deliver")
        .expect("stopped run should finish");
    assert_eq!(record.status, SubagentStatus::Stopped);
    assert!(matches!(
        bridge.stop_subagent("missing"),
        Err(BridgeError::UnknownRun(_))
    ));
}

#[tokio::test(flavor = "current_thread")]
async fn subagent_ceiling_is_enforced_and_stop_all_reports_count() {
    let dir = tempdir().expect("temp dir should be created");
    write_sh_manifest(dir.path(), "echo-agent", json!({}), "exec sleep 30");
    let mut config = test_config(dir.path());
    config.subagents.max_concurrent = 2;
    let bridge = Bridge::new(config, load_registry(dir.path())).expect("bridge should build");

    let tickets: Vec<_> = (0..2)
        .map(|index| {
            bridge
                .spawn_subagent("chat-1", SpawnRequest::new(format!("task {index}")))
                .expect("spawn under the ceiling")
        })
        .collect();
    assert!(matches!(
        bridge.spawn_subagent("chat-1", SpawnRequest::new("one too many")),
        Err(BridgeError::SubagentLimit { limit: 2, .. })
    ));
    assert!(bridge.spawn_subagent("chat-2", SpawnRequest::new("other chat")).is_ok());

    assert_eq!(bridge.stop_all_subagents("chat-1"), 2);
    for ticket in tickets {
        let record = bridge
            .wait_for_subagent(ticket, Some(WAIT))
            .await
            .expect("lane should deliver")
            .expect("run should settle");
        assert_eq!(record.status, SubagentStatus::Stopped);
    }
    assert!(bridge.subagents().can_spawn("chat-1"));
    bridge.stop_all_subagents("chat-2");
}

#[tokio::test(flavor = "current_thread")]
async fn wait_for_subagent_times_out_without_cancelling() {
    let dir = tempdir().expect("temp dir should be created");
    write_sh_manifest(dir.path(), "echo-agent", json!({}), "exec sleep 30");
    let bridge = Bridge::new(test_config(dir.path()), load_registry(dir.path()))
        .expect("bridge should build");

    let ticket = bridge
        .spawn_subagent("chat-1", SpawnRequest::new("slow"))
        .expect("spawn should be accepted");
    let run_id = ticket.run_id.clone();
    let waited = bridge
        .wait_for_subagent(ticket, Some(Duration::from_millis(100)))
        .await
        .expect("timeout is not an error");
    assert!(waited.is_none());
    assert!(
        bridge
            .subagents()
            .get(&run_id)
            .is_some_and(|run| !run.status.is_terminal())
    );
    bridge.stop_all_subagents("chat-1");
}

#[tokio::test(flavor = "current_thread")]
async fn interrupt_terminates_the_foreground_turn() {
    let dir = tempdir().expect("temp dir should be created");
    let script = format!("{}; exec sleep 30", print_lines(&[INIT_S1]));
    write_sh_manifest(dir.path(), "echo-agent", json!({}), &script);
    let bridge = Bridge::new(test_config(dir.path()), load_registry(dir.path()))
        .expect("bridge should build");

    let turn = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.submit("chat-1", "long").await })
    };
    assert!(
        wait_until(WAIT, || {
            bridge
                .sessions()
                .resume_token("chat-1", "echo-agent")
                .is_some()
        })
        .await
    );
    assert!(bridge.interrupt("chat-1"));

    let outcome = tokio::time::timeout(WAIT, turn)
        .await
        .expect("turn should end after interrupt")
        .expect("task should join")
        .expect("turn result");
    assert!(matches!(outcome, SubmitOutcome::Turn(ref summary) if summary.interrupted));
    assert!(!bridge.sessions().is_busy("chat-1"));
    assert!(!bridge.interrupt("chat-1"));
}

#[tokio::test(flavor = "current_thread")]
async fn unknown_engines_are_rejected() {
    let dir = tempdir().expect("temp dir should be created");
    write_sh_manifest(dir.path(), "echo-agent", json!({}), &print_lines(&[INIT_S1, RESULT_42]));
    let bridge = Bridge::new(test_config(dir.path()), load_registry(dir.path()))
        .expect("bridge should build");

    assert!(matches!(
        bridge.switch_engine("chat-1", "codex"),
        Err(BridgeError::UnknownEngine(name)) if name == "codex"
    ));
    assert!(matches!(
        bridge.spawn_subagent("chat-1", SpawnRequest::new("x").with_engine("codex")),
        Err(BridgeError::UnknownEngine(_))
    ));
    assert_eq!(bridge.active_engine("chat-1"), "echo-agent");
}

#[tokio::test(flavor = "current_thread")]
async fn registry_survives_a_restart() {
    let dir = tempdir().expect("temp dir should be created");
    write_sh_manifest(
        dir.path(),
        "echo-agent",
        json!({}),
        &print_lines(&[result_line("persisted").as_str()]),
    );
    let mut config = test_config(dir.path());
    config.subagents.state_path = Some(dir.path().join("state/subagents.json"));

    let bridge = Bridge::new(config.clone(), load_registry(dir.path())).expect("bridge should build");
    let ticket = bridge
        .spawn_subagent("chat-1", SpawnRequest::new("remember me"))
        .expect("spawn should be accepted");
    let run_id = ticket.run_id.clone();
    bridge
        .wait_for_subagent(ticket, Some(WAIT))
        .await
        .expect("lane should deliver");
    let orphan = bridge
        .subagents()
        .spawn("chat-1", "never scheduled", "echo-agent", None, None)
        .run_id;
    assert!(bridge.save_subagents().await.expect("save should succeed"));

    let restarted = Bridge::new(config, load_registry(dir.path())).expect("bridge should build");
    assert_eq!(restarted.restore_subagents().await.expect("restore"), 2);
    let record = restarted.subagents().get(&run_id).expect("run restored");
    assert_eq!(record.status, SubagentStatus::Completed);
    assert_eq!(record.result.as_deref(), Some("persisted"));
    assert_eq!(
        restarted.subagents().get(&orphan).map(|run| run.status),
        Some(SubagentStatus::Error)
    );
}

#[tokio::test(flavor = "current_thread")]
async fn results_stay_pending_when_the_foreground_agent_fails_to_spawn() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempdir().expect("temp dir should be created");
    write_sh_manifest(
        dir.path(),
        "worker",
        json!({}),
        &print_lines(&[result_line("3 crates outdated").as_str()]),
    );
    let agent = dir.path().join("echo-agent.sh");
    let write_agent = || {
        std::fs::write(&agent, format!("#!/bin/sh\n{}\n", print_lines(&[INIT_S1, RESULT_42])))
            .expect("agent script should write");
        std::fs::set_permissions(&agent, std::fs::Permissions::from_mode(0o755))
            .expect("agent script should be executable");
    };
    write_agent();
    std::fs::write(
        dir.path().join("echo-agent.json"),
        json!({ "name": "echo-agent", "command": agent.display().to_string() }).to_string(),
    )
    .expect("manifest write should succeed");
    let bridge = Bridge::new(test_config(dir.path()), load_registry(dir.path()))
        .expect("bridge should build");

    let ticket = bridge
        .spawn_subagent(
            "chat-1",
            SpawnRequest::new("check outdated crates").with_engine("worker"),
        )
        .expect("spawn should be accepted");
    let run_id = ticket.run_id.clone();
    bridge
        .wait_for_subagent(ticket, Some(WAIT))
        .await
        .expect("lane should deliver");

    std::fs::remove_file(&agent).expect("agent script should be removed");
    let SubmitOutcome::Turn(failed) = bridge.submit("chat-1", "what next?").await.expect("turn")
    else {
        panic!("expected a turn");
    };
    assert!(failed.is_error);
    assert!(failed.injected_runs.is_empty());
    assert!(bridge.subagents().get(&run_id).is_some_and(|run| !run.results_injected));
    assert_eq!(bridge.subagents().get_pending_results("chat-1", "chat-1").len(), 1);

    write_agent();
    let SubmitOutcome::Turn(delivered) = bridge.submit("chat-1", "what next?").await.expect("turn")
    else {
        panic!("expected a turn");
    };
    assert!(!delivered.is_error);
    assert_eq!(delivered.injected_runs, vec![run_id.clone()]);
    assert!(bridge.subagents().get(&run_id).is_some_and(|run| run.results_injected));
}

#[tokio::test(flavor = "current_thread")]
async fn spec_mode_without_a_plan_keeps_the_task_and_accepts_cancel() {
    let dir = tempdir().expect("temp dir should be created");
    let prompt_log = dir.path().join("prompt.log");
    let script = r#"if [ "$1" = "--plan" ]; then
printf '%s' "$2" > "$PROMPT_LOG"
printf '%s\n' '{"type":"result","session_id":"p1","result":"planner crashed","is_error":true}'
fi"#;
    write_sh_manifest(
        dir.path(),
        "echo-agent",
        json!({
            "plan_mode_args": ["--plan"],
            "env": { "PROMPT_LOG": prompt_log.display().to_string() },
        }),
        script,
    );
    let bridge = Bridge::new(test_config(dir.path()), load_registry(dir.path()))
        .expect("bridge should build");

    let planned = bridge
        .enter_spec_mode("chat-1", "add tests")
        .await
        .expect("planning turn should run");
    assert!(matches!(planned, SubmitOutcome::Turn(ref summary) if summary.is_error));
    let state = bridge.spec_mode().get_spec_mode("chat-1").expect("spec mode active");
    assert!(state.pending_plan.is_none());

    bridge
        .submit("chat-1", "focus on the parser")
        .await
        .expect("planning turn should run");
    let prompt = std::fs::read_to_string(&prompt_log).expect("prompt log should exist");
    assert!(prompt.contains("add tests"));
    assert!(prompt.contains("focus on the parser"));

    assert_eq!(
        bridge.submit("chat-1", "cancel").await.expect("cancel"),
        SubmitOutcome::SpecCancelled
    );
    assert!(!bridge.spec_mode().is_in_spec_mode("chat-1"));
}
