//! Executive running on its own thread

use std::sync::Arc;
use std::time::{Duration, Instant};

use reactive_exec::prelude::*;

const WAIT: Duration = Duration::from_secs(5);

fn spawn(config: ExecConfig) -> (ExecRunner, Arc<ScriptedInterface>, Arc<RecordingListener>) {
    let adapter = Arc::new(ScriptedInterface::new());
    let recorder = Arc::new(RecordingListener::new());
    let exec = Exec::new(config, Interfaces::shared(adapter.clone()))
        .unwrap()
        .with_listener(recorder.clone());
    adapter.attach(exec.queue());
    (ExecRunner::spawn(exec).unwrap(), adapter, recorder)
}

#[test]
fn test_plan_runs_to_completion_on_thread() {
    let (runner, adapter, recorder) = spawn(ExecConfig::default());
    adapter.auto_ack_commands(CommandHandle::Success);
    let handle = runner.handle();

    handle
        .add_plan(PlanNode::list(
            "Root",
            vec![PlanNode::command("Go", "go", vec![ExprSpec::string("north")])],
        ))
        .unwrap();
    assert!(handle.mark_and_wait(WAIT).unwrap());
    // the ack arrives after the first mark; one more round trip covers it
    assert!(handle.mark_and_wait(WAIT).unwrap());

    let last = recorder.last_transition("Root").unwrap();
    assert_eq!(last.to, NodeState::Finished);
    assert_eq!(last.outcome, Some(NodeOutcome::Success));
    assert_eq!(adapter.commands()[0].args, vec![Value::String("north".into())]);

    let summary = runner.stop().unwrap();
    assert!(summary.cycles >= 2);
    assert!(!handle.is_running());
}

#[test]
fn test_external_state_change_drives_plan() {
    let (runner, adapter, recorder) = spawn(ExecConfig::default());
    let handle = runner.handle();
    handle
        .add_plan(
            PlanNode::empty("Gate").with_start(ExprSpec::lookup_on_change("door_open", 0.0)),
        )
        .unwrap();
    assert!(handle.mark_and_wait(WAIT).unwrap());
    assert_eq!(recorder.states_of("Gate"), vec![NodeState::Waiting]);

    adapter.publish_state(State::named("door_open"), Value::Boolean(true));
    assert!(handle.mark_and_wait(WAIT).unwrap());
    assert_eq!(
        recorder.last_transition("Gate").map(|t| t.to),
        Some(NodeState::Finished)
    );
    runner.stop().unwrap();
}

#[test]
fn test_scheduled_wakeup_runs_cycle() {
    let config = ExecConfig {
        idle_wait_ms: 60_000,
        ..ExecConfig::default()
    };
    let (runner, adapter, _) = spawn(config);
    let handle = runner.handle();
    assert!(handle.mark_and_wait(WAIT).unwrap());
    let before = adapter.lookup_count("time");

    handle.schedule_wakeup(Instant::now() + Duration::from_millis(20));
    let deadline = Instant::now() + WAIT;
    while adapter.lookup_count("time") == before && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(adapter.lookup_count("time") > before);
    runner.stop().unwrap();
}

#[test]
fn test_shutdown_via_handle_aborts_commands() {
    let (runner, adapter, _) = spawn(ExecConfig::default());
    adapter.auto_ack_aborts(true);
    let handle = runner.handle();
    handle
        .add_plan(PlanNode::command("Drive", "drive", vec![]))
        .unwrap();
    assert!(handle.mark_and_wait(WAIT).unwrap());

    handle.shutdown().unwrap();
    let summary = runner.join().unwrap();
    assert_eq!(summary.shutdown.aborts_requested, 1);
    assert_eq!(summary.shutdown.aborts_unacknowledged, 0);
    assert_eq!(adapter.aborts().len(), 1);
    assert!(matches!(handle.mark(), Err(ExecError::QueueClosed)));
}

#[test]
fn test_fatal_error_stops_thread() {
    let config = ExecConfig::default().with_max_steps(20);
    let (runner, _, _) = spawn(config);
    let handle = runner.handle();
    handle
        .add_plan(PlanNode::empty("Spin").with_repeat(ExprSpec::boolean(true)))
        .unwrap();
    let result = runner.join();
    assert!(matches!(result, Err(ExecError::QuiescenceOverflow(20))));
    assert!(!handle.is_running());
}
