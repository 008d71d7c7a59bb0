//! End-to-end plan execution scenarios driven cycle by cycle

use std::sync::Arc;
use std::time::Duration;

use reactive_exec::engine::expr::Operator;
use reactive_exec::prelude::*;

// ============================================================================
// Helpers
// ============================================================================

fn setup() -> (Exec, Arc<ScriptedInterface>, Arc<RecordingListener>) {
    setup_with(ExecConfig::default())
}

fn setup_with(config: ExecConfig) -> (Exec, Arc<ScriptedInterface>, Arc<RecordingListener>) {
    let adapter = Arc::new(ScriptedInterface::new());
    let recorder = Arc::new(RecordingListener::new());
    let exec = Exec::new(config, Interfaces::shared(adapter.clone()))
        .unwrap()
        .with_listener(recorder.clone());
    adapter.attach(exec.queue());
    (exec, adapter, recorder)
}

fn finished_with(exec: &Exec, node: &str, outcome: NodeOutcome) {
    assert_eq!(exec.node_state(node), Some(NodeState::Finished), "state of {}", node);
    assert_eq!(exec.node_outcome(node), Some(outcome), "outcome of {}", node);
}

// ============================================================================
// Commands and assignments
// ============================================================================

#[test]
fn test_assignment_waits_for_command_success() {
    let (mut exec, adapter, recorder) = setup();
    let plan = PlanNode::list(
        "Root",
        vec![
            PlanNode::command("A", "move", vec![ExprSpec::int(3)]),
            PlanNode::assignment("B", "x", ExprSpec::int(1)).with_start(ExprSpec::eq(
                ExprSpec::NodeCommandHandle("A".into()),
                ExprSpec::handle(CommandHandle::Success),
            )),
        ],
    )
    .with_variable("x", Value::Integer(0));
    exec.add_plan(plan).unwrap();

    exec.run_cycle().unwrap();
    let commands = adapter.commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].name, "move");
    assert_eq!(commands[0].args, vec![Value::Integer(3)]);
    assert_eq!(exec.node_state("A"), Some(NodeState::Executing));
    assert_eq!(exec.node_state("B"), Some(NodeState::Waiting));
    assert_eq!(exec.variable_value("Root", "x"), Some(Value::Integer(0)));

    exec.queue()
        .enqueue_command_ack(commands[0].id, CommandHandle::Success)
        .unwrap();
    exec.run_until_quiescent(10).unwrap();

    finished_with(&exec, "A", NodeOutcome::Success);
    finished_with(&exec, "B", NodeOutcome::Success);
    finished_with(&exec, "Root", NodeOutcome::Success);
    assert_eq!(exec.variable_value("Root", "x"), Some(Value::Integer(1)));
    assert_eq!(
        recorder.states_of("B"),
        vec![
            NodeState::Waiting,
            NodeState::Executing,
            NodeState::IterationEnded,
            NodeState::Finished
        ]
    );
    assert!(exec.all_plans_finished());
}

#[test]
fn test_command_return_value_lands_in_variable() {
    let (mut exec, adapter, _) = setup();
    adapter.auto_ack_commands(CommandHandle::Success);
    adapter.return_value("measure", Value::Real(2.5));
    let plan = PlanNode::list(
        "Root",
        vec![PlanNode::command("Measure", "measure", vec![]).with_returns("reading")],
    )
    .with_variable("reading", Value::Unknown);
    exec.add_plan(plan).unwrap();
    exec.run_until_quiescent(10).unwrap();

    assert_eq!(exec.variable_value("Root", "reading"), Some(Value::Real(2.5)));
    finished_with(&exec, "Measure", NodeOutcome::Success);
}

#[test]
fn test_denied_command_fails_node() {
    let (mut exec, adapter, _) = setup();
    adapter.auto_ack_commands(CommandHandle::Denied);
    exec.add_plan(PlanNode::list("Root", vec![PlanNode::command("Go", "go", vec![])]))
        .unwrap();
    exec.run_until_quiescent(10).unwrap();

    finished_with(&exec, "Go", NodeOutcome::Failure);
    assert_eq!(exec.node_failure("Go"), Some(FailureType::PostConditionFailed));
}

#[test]
fn test_lower_priority_value_assigns_first() {
    let (mut exec, _, recorder) = setup();
    let plan = PlanNode::list(
        "Root",
        vec![
            PlanNode::assignment("Low", "x", ExprSpec::int(1)).with_priority(2),
            PlanNode::assignment("High", "x", ExprSpec::int(2)).with_priority(1),
        ],
    )
    .with_variable("x", Value::Integer(0));
    exec.add_plan(plan).unwrap();
    exec.run_until_quiescent(10).unwrap();

    let order: Vec<String> = recorder.assignments().into_iter().map(|a| a.node).collect();
    assert_eq!(order, vec!["High".to_string(), "Low".to_string()]);
    assert_eq!(exec.variable_value("Root", "x"), Some(Value::Integer(1)));
    finished_with(&exec, "Low", NodeOutcome::Success);
    finished_with(&exec, "High", NodeOutcome::Success);
}

#[test]
fn test_unprioritized_contention_uses_declaration_order() {
    let (mut exec, _, recorder) = setup();
    let plan = PlanNode::list(
        "Root",
        vec![
            PlanNode::assignment("First", "x", ExprSpec::int(1)),
            PlanNode::assignment("Second", "x", ExprSpec::int(2)),
        ],
    )
    .with_variable("x", Value::Integer(0));
    exec.add_plan(plan).unwrap();
    exec.run_until_quiescent(10).unwrap();

    let order: Vec<String> = recorder.assignments().into_iter().map(|a| a.node).collect();
    assert_eq!(order, vec!["First".to_string(), "Second".to_string()]);
    assert_eq!(exec.variable_value("Root", "x"), Some(Value::Integer(2)));
}

#[test]
fn test_equal_priorities_in_one_list_rejected_at_load() {
    let (mut exec, _, _) = setup();
    let plan = PlanNode::list(
        "Root",
        vec![
            PlanNode::assignment("A", "x", ExprSpec::int(1)).with_priority(1),
            PlanNode::assignment("B", "x", ExprSpec::int(2)).with_priority(1),
        ],
    )
    .with_variable("x", Value::Integer(0));
    let err = exec.add_plan(plan).unwrap_err();
    assert!(matches!(err, ExecError::DuplicatePriority { .. }));
    assert_eq!(exec.node_count(), 0);
}

#[test]
fn test_equal_priorities_in_different_lists_rejected_at_load() {
    let (mut exec, adapter, _) = setup();
    exec.add_plan(PlanNode::list("Other", vec![PlanNode::command("Drive", "drive", vec![])]))
        .unwrap();
    exec.run_cycle().unwrap();
    let before = exec.node_count();

    let plan = PlanNode::list(
        "Root",
        vec![
            PlanNode::list(
                "Left",
                vec![PlanNode::assignment("A", "x", ExprSpec::int(1)).with_priority(1)],
            ),
            PlanNode::list(
                "Right",
                vec![PlanNode::assignment("B", "x", ExprSpec::int(2)).with_priority(1)],
            ),
        ],
    )
    .with_variable("x", Value::Integer(0));
    let err = exec.add_plan(plan).unwrap_err();
    assert!(err.is_structural());
    assert!(matches!(err, ExecError::DuplicatePriority { priority: 1, .. }));
    assert_eq!(exec.node_count(), before);
    assert_eq!(exec.find_node("A"), None);

    // the plan already running is untouched
    let drive = adapter.last_command("drive").unwrap();
    exec.queue()
        .enqueue_command_ack(drive.id, CommandHandle::Success)
        .unwrap();
    exec.run_until_quiescent(10).unwrap();
    finished_with(&exec, "Other", NodeOutcome::Success);
}

#[test]
fn test_lower_priority_waits_while_reservation_held() {
    let (mut exec, adapter, _) = setup();
    let plan = PlanNode::list(
        "Root",
        vec![
            PlanNode::assignment("Low", "x", ExprSpec::int(1)).with_priority(2),
            PlanNode::assignment("High", "x", ExprSpec::int(2))
                .with_priority(1)
                .with_end(ExprSpec::lookup_on_change("done", 0.0)),
        ],
    )
    .with_variable("x", Value::Integer(0));
    exec.add_plan(plan).unwrap();
    exec.run_cycle().unwrap();

    assert_eq!(exec.node_state("High"), Some(NodeState::Executing));
    assert_eq!(exec.node_state("Low"), Some(NodeState::Waiting));
    assert_eq!(exec.variable_value("Root", "x"), Some(Value::Integer(2)));

    exec.run_cycle().unwrap();
    assert_eq!(exec.node_state("Low"), Some(NodeState::Waiting));

    adapter.publish_state(State::named("done"), Value::Boolean(true));
    exec.run_until_quiescent(10).unwrap();
    finished_with(&exec, "High", NodeOutcome::Success);
    finished_with(&exec, "Low", NodeOutcome::Success);
    assert_eq!(exec.variable_value("Root", "x"), Some(Value::Integer(1)));
}

// ============================================================================
// Conditions
// ============================================================================

#[test]
fn test_skip_condition() {
    let (mut exec, adapter, _) = setup();
    let plan = PlanNode::list(
        "Root",
        vec![PlanNode::command("Skipped", "never", vec![]).with_skip(ExprSpec::boolean(true))],
    );
    exec.add_plan(plan).unwrap();
    exec.run_until_quiescent(10).unwrap();

    finished_with(&exec, "Skipped", NodeOutcome::Skipped);
    finished_with(&exec, "Root", NodeOutcome::Success);
    assert!(adapter.commands().is_empty());
}

#[test]
fn test_false_precondition_skips_body() {
    let (mut exec, _, recorder) = setup();
    let plan = PlanNode::list(
        "Root",
        vec![PlanNode::assignment("Guarded", "x", ExprSpec::int(5)).with_pre(ExprSpec::boolean(false))],
    )
    .with_variable("x", Value::Integer(0));
    exec.add_plan(plan).unwrap();
    exec.run_until_quiescent(10).unwrap();

    finished_with(&exec, "Guarded", NodeOutcome::Skipped);
    assert_eq!(exec.variable_value("Root", "x"), Some(Value::Integer(0)));
    assert!(!recorder.states_of("Guarded").contains(&NodeState::Executing));
}

#[test]
fn test_false_postcondition_fails() {
    let (mut exec, _, _) = setup();
    let plan = PlanNode::list(
        "Root",
        vec![PlanNode::empty("Check").with_post(ExprSpec::boolean(false))],
    );
    exec.add_plan(plan).unwrap();
    exec.run_until_quiescent(10).unwrap();

    finished_with(&exec, "Check", NodeOutcome::Failure);
    assert_eq!(exec.node_failure("Check"), Some(FailureType::PostConditionFailed));
}

#[test]
fn test_invariant_failure_aborts_command() {
    let (mut exec, adapter, _) = setup();
    adapter.auto_ack_aborts(true);
    adapter.set_state(State::named("healthy"), Value::Boolean(true));
    let plan = PlanNode::list(
        "Root",
        vec![PlanNode::command("Drive", "drive", vec![])
            .with_invariant(ExprSpec::lookup_on_change("healthy", 0.0))],
    );
    exec.add_plan(plan).unwrap();
    exec.run_cycle().unwrap();
    assert_eq!(exec.node_state("Drive"), Some(NodeState::Executing));
    assert!(adapter.is_subscribed(&State::named("healthy")));

    adapter.publish_state(State::named("healthy"), Value::Boolean(false));
    exec.run_cycle().unwrap();
    assert_eq!(exec.node_state("Drive"), Some(NodeState::Failing));
    assert_eq!(adapter.aborts().len(), 1);
    assert_eq!(adapter.aborts()[0].name, "drive");

    exec.run_until_quiescent(10).unwrap();
    finished_with(&exec, "Drive", NodeOutcome::Failure);
    assert_eq!(
        exec.node_failure("Drive"),
        Some(FailureType::InvariantConditionFailed)
    );
    assert!(!adapter.is_subscribed(&State::named("healthy")));
}

#[test]
fn test_failing_waits_for_abort_ack() {
    let (mut exec, adapter, _) = setup();
    let plan = PlanNode::list(
        "Root",
        vec![PlanNode::command("Drive", "drive", vec![])
            .with_exit(ExprSpec::lookup_on_change("stop", 0.0))],
    );
    exec.add_plan(plan).unwrap();
    exec.run_cycle().unwrap();
    adapter.publish_state(State::named("stop"), Value::Boolean(true));
    exec.run_until_quiescent(10).unwrap();
    assert_eq!(exec.node_state("Drive"), Some(NodeState::Failing));
    assert_eq!(exec.node_failure("Drive"), Some(FailureType::Exited));

    let aborted = adapter.aborts()[0].id;
    exec.queue().enqueue_command_abort_ack(aborted, true).unwrap();
    exec.run_until_quiescent(10).unwrap();
    assert_eq!(exec.node_state("Drive"), Some(NodeState::Finished));
    assert_eq!(exec.node_outcome("Drive"), Some(NodeOutcome::Interrupted));
}

#[test]
fn test_ancestor_exit_reaches_children() {
    let (mut exec, adapter, _) = setup();
    adapter.auto_ack_aborts(true);
    let plan = PlanNode::list(
        "Root",
        vec![
            PlanNode::command("Drive", "drive", vec![]),
            PlanNode::empty("Later").with_start(ExprSpec::boolean(false)),
        ],
    )
    .with_exit(ExprSpec::lookup_on_change("halt", 0.0));
    exec.add_plan(plan).unwrap();
    exec.run_cycle().unwrap();

    adapter.publish_state(State::named("halt"), Value::Boolean(true));
    exec.run_until_quiescent(10).unwrap();

    assert_eq!(exec.node_failure("Root"), Some(FailureType::Exited));
    assert_eq!(exec.node_failure("Drive"), Some(FailureType::ParentExited));
    finished_with(&exec, "Later", NodeOutcome::Skipped);
    assert_eq!(exec.node_state("Root"), Some(NodeState::Finished));
}

#[test]
fn test_repeat_until_condition_false() {
    let (mut exec, _, recorder) = setup();
    let count = || ExprSpec::var("count");
    let plan = PlanNode::list(
        "Root",
        vec![PlanNode::assignment(
            "Inc",
            "count",
            ExprSpec::op(Operator::Add, vec![count(), ExprSpec::int(1)]),
        )
        .with_repeat(ExprSpec::op(Operator::Lt, vec![count(), ExprSpec::int(3)]))],
    )
    .with_variable("count", Value::Integer(0));
    exec.add_plan(plan).unwrap();
    exec.run_until_quiescent(10).unwrap();

    assert_eq!(exec.variable_value("Root", "count"), Some(Value::Integer(3)));
    assert_eq!(recorder.assignments().len(), 3);
    let inc = exec.find_node("Inc").unwrap();
    assert_eq!(exec.node(inc).unwrap().iteration, 2);
    finished_with(&exec, "Inc", NodeOutcome::Success);
}

#[test]
fn test_runaway_repeat_is_fatal() {
    let (mut exec, _, _) = setup_with(ExecConfig::default().with_max_steps(50));
    exec.add_plan(PlanNode::empty("Spin").with_repeat(ExprSpec::boolean(true)))
        .unwrap();
    let err = exec.run_cycle().unwrap_err();
    assert!(matches!(err, ExecError::QuiescenceOverflow(50)));
    assert!(err.is_fatal());
}

// ============================================================================
// Lookups
// ============================================================================

#[test]
fn test_lookup_now_once_per_cycle() {
    let (mut exec, adapter, _) = setup();
    adapter.set_state(State::named("battery"), Value::Real(80.0));
    let above = |n: i64| {
        ExprSpec::op(
            Operator::Gt,
            vec![ExprSpec::lookup_now("battery"), ExprSpec::int(n)],
        )
    };
    let plan = PlanNode::list(
        "Root",
        vec![
            PlanNode::empty("A").with_start(above(10)),
            PlanNode::empty("B").with_start(above(50)),
        ],
    );
    exec.add_plan(plan).unwrap();
    exec.run_cycle().unwrap();

    assert_eq!(adapter.lookup_count("battery"), 1);
    finished_with(&exec, "A", NodeOutcome::Success);
    finished_with(&exec, "B", NodeOutcome::Success);
}

#[test]
fn test_change_lookup_tolerance() {
    let (mut exec, adapter, _) = setup();
    adapter.set_state(State::named("speed"), Value::Real(1.0));
    let plan = PlanNode::list(
        "Root",
        vec![PlanNode::empty("Fast").with_start(ExprSpec::op(
            Operator::Ge,
            vec![ExprSpec::lookup_on_change("speed", 0.5), ExprSpec::real(1.4)],
        ))],
    );
    exec.add_plan(plan).unwrap();
    exec.run_cycle().unwrap();
    assert_eq!(adapter.thresholds(&State::named("speed")), Some((1.5, 0.5)));

    // inside the band: not delivered
    adapter.publish_state(State::named("speed"), Value::Real(1.4));
    exec.run_until_quiescent(10).unwrap();
    assert_eq!(exec.node_state("Fast"), Some(NodeState::Waiting));

    adapter.publish_state(State::named("speed"), Value::Real(1.6));
    exec.run_until_quiescent(10).unwrap();
    finished_with(&exec, "Fast", NodeOutcome::Success);
}

fn lookup_with_arg(name: &str, arg: ExprSpec) -> ExprSpec {
    ExprSpec::LookupOnChange {
        name: name.to_string(),
        args: vec![arg],
        tolerance: 0.0,
    }
}

#[test]
fn test_lookup_follows_argument_change() {
    let (mut exec, adapter, _) = setup();
    let temp = |sensor: &str| State::new("temp", vec![Value::String(sensor.to_string())]);
    adapter.set_state(temp("a"), Value::Integer(1));
    adapter.set_state(temp("b"), Value::Integer(100));
    let plan = PlanNode::list(
        "Root",
        vec![
            PlanNode::assignment("Switch", "sensor", ExprSpec::string("b"))
                .with_start(ExprSpec::lookup_on_change("go", 0.0)),
            PlanNode::empty("Watch").with_start(ExprSpec::op(
                Operator::Ge,
                vec![lookup_with_arg("temp", ExprSpec::var("sensor")), ExprSpec::int(50)],
            )),
        ],
    )
    .with_variable("sensor", Value::String("a".into()));
    exec.add_plan(plan).unwrap();
    exec.run_cycle().unwrap();
    assert_eq!(exec.node_state("Watch"), Some(NodeState::Waiting));
    assert!(adapter.is_subscribed(&temp("a")));

    adapter.publish_state(State::named("go"), Value::Boolean(true));
    exec.run_until_quiescent(10).unwrap();

    assert_eq!(
        exec.variable_value("Root", "sensor"),
        Some(Value::String("b".into()))
    );
    finished_with(&exec, "Watch", NodeOutcome::Success);
    assert!(!adapter.is_subscribed(&temp("a")));
    assert_eq!(adapter.lookup_count("temp"), 2);
}

#[test]
fn test_lookup_with_unknown_argument_is_not_registered() {
    let (mut exec, adapter, _) = setup();
    let temp_b = State::new("temp", vec![Value::String("b".into())]);
    adapter.set_state(temp_b.clone(), Value::Integer(100));
    let plan = PlanNode::list(
        "Root",
        vec![
            PlanNode::assignment("Pick", "sensor", ExprSpec::string("b"))
                .with_start(ExprSpec::lookup_on_change("go", 0.0)),
            PlanNode::empty("Watch").with_start(ExprSpec::op(
                Operator::Ge,
                vec![lookup_with_arg("temp", ExprSpec::var("sensor")), ExprSpec::int(50)],
            )),
        ],
    )
    .with_variable("sensor", Value::Unknown);
    exec.add_plan(plan).unwrap();
    exec.run_cycle().unwrap();

    assert_eq!(adapter.lookup_count("temp"), 0);
    assert_eq!(exec.node_state("Watch"), Some(NodeState::Waiting));

    adapter.publish_state(State::named("go"), Value::Boolean(true));
    exec.run_until_quiescent(10).unwrap();
    assert_eq!(adapter.lookup_count("temp"), 1);
    finished_with(&exec, "Watch", NodeOutcome::Success);
}

// ============================================================================
// Libraries
// ============================================================================

#[test]
fn test_library_call_assigns_through_alias() {
    let (mut exec, _, recorder) = setup();
    exec.add_library(
        PlanNode::assignment("SetFlag", "flag", ExprSpec::boolean(true)).with_interface("flag"),
    )
    .unwrap();
    let plan = PlanNode::list(
        "Root",
        vec![PlanNode::library_call("Call", "SetFlag").with_alias("flag", ExprSpec::var("done"))],
    )
    .with_variable("done", Value::Boolean(false));
    exec.add_plan(plan).unwrap();
    exec.run_until_quiescent(10).unwrap();

    assert_eq!(exec.variable_value("Root", "done"), Some(Value::Boolean(true)));
    finished_with(&exec, "SetFlag", NodeOutcome::Success);
    finished_with(&exec, "Call", NodeOutcome::Success);
    assert_eq!(recorder.libraries(), vec!["SetFlag".to_string()]);
}

#[test]
fn test_unknown_library_rejected() {
    let (mut exec, _, _) = setup();
    let err = exec
        .add_plan(PlanNode::library_call("Call", "Missing"))
        .unwrap_err();
    assert!(matches!(err, ExecError::UnknownLibrary(ref name) if name == "Missing"));
    assert!(exec.plans().is_empty());
}

#[test]
fn test_structural_error_from_queue_is_reported_not_fatal() {
    let (mut exec, _, _) = setup();
    exec.queue()
        .enqueue_plan(PlanNode::assignment("Bad", "nowhere", ExprSpec::int(1)))
        .unwrap();
    let report = exec.run_cycle().unwrap();
    assert_eq!(report.entries, 1);
    assert!(exec.plans().is_empty());
    assert_eq!(exec.node_count(), 0);
}

// ============================================================================
// Messages and planner updates
// ============================================================================

#[test]
fn test_receive_message_pairs_with_waiting_command() {
    let (mut exec, adapter, _) = setup();
    let plan = PlanNode::list(
        "Root",
        vec![PlanNode::command("Wait", "ReceiveMessage", vec![ExprSpec::string("hello")])
            .with_returns("msg")],
    )
    .with_variable("msg", Value::Unknown);
    exec.add_plan(plan).unwrap();
    exec.run_cycle().unwrap();
    assert_eq!(exec.node_state("Wait"), Some(NodeState::Executing));
    assert!(adapter.commands().is_empty());

    exec.queue()
        .enqueue_receive_message("hello", Value::Integer(42))
        .unwrap();
    exec.run_until_quiescent(10).unwrap();

    assert_eq!(exec.variable_value("Root", "msg"), Some(Value::Integer(42)));
    finished_with(&exec, "Wait", NodeOutcome::Success);
}

#[test]
fn test_buffered_message_pairs_on_dispatch() {
    let (mut exec, _, _) = setup();
    exec.queue()
        .enqueue_receive_message("hello", Value::String("early".to_string()))
        .unwrap();
    exec.run_cycle().unwrap();

    let plan = PlanNode::list(
        "Root",
        vec![PlanNode::command("Wait", "ReceiveMessage", vec![ExprSpec::string("hello")])
            .with_returns("msg")],
    )
    .with_variable("msg", Value::Unknown);
    exec.add_plan(plan).unwrap();
    exec.run_until_quiescent(10).unwrap();

    assert_eq!(exec.variable_value("Root", "msg"), Some(Value::String("early".to_string())));
}

#[test]
fn test_planner_update_acknowledged() {
    let (mut exec, adapter, _) = setup();
    adapter.auto_ack_updates(true);
    let plan = PlanNode::list(
        "Root",
        vec![PlanNode::update("Report", vec![("progress", ExprSpec::int(5))])],
    );
    exec.add_plan(plan).unwrap();
    exec.run_until_quiescent(10).unwrap();

    let updates = adapter.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].pairs, vec![("progress".to_string(), Value::Integer(5))]);
    finished_with(&exec, "Report", NodeOutcome::Success);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_collect_finished_plans_tears_down() {
    let (mut exec, _, recorder) = setup();
    let baseline = exec.graph().len();
    let plan = PlanNode::list(
        "Root",
        vec![PlanNode::assignment("Set", "x", ExprSpec::int(1))],
    )
    .with_variable("x", Value::Integer(0));
    let id = exec.add_plan(plan).unwrap();
    exec.run_until_quiescent(10).unwrap();

    let reports = exec.collect_finished_plans().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].id, id);
    assert_eq!(reports[0].outcome, Some(NodeOutcome::Success));
    assert_eq!(exec.node_count(), 0);
    assert_eq!(exec.graph().len(), baseline);
    assert_eq!(recorder.plans(), vec![(id, "Root".to_string())]);
}

#[test]
fn test_shutdown_aborts_outstanding_commands() {
    let (mut exec, adapter, _) = setup();
    adapter.auto_ack_aborts(true);
    exec.add_plan(PlanNode::list("Root", vec![PlanNode::command("Drive", "drive", vec![])]))
        .unwrap();
    exec.run_cycle().unwrap();
    exec.queue().enqueue_terminate().unwrap();
    exec.run_cycle().unwrap();
    assert!(exec.is_terminating());

    let report = exec.shutdown().unwrap();
    assert_eq!(report.aborts_requested, 1);
    assert_eq!(report.aborts_unacknowledged, 0);
    assert_eq!(exec.node_count(), 0);
    assert!(exec.queue().is_closed());
    assert!(matches!(
        exec.add_plan(PlanNode::empty("Late")),
        Err(ExecError::NotRunning)
    ));
}

#[test]
fn test_shutdown_gives_up_on_silent_adapter() {
    let config = ExecConfig::default().with_abort_timeout(Duration::from_millis(20));
    let (mut exec, adapter, _) = setup_with(config);
    exec.add_plan(PlanNode::list("Root", vec![PlanNode::command("Drive", "drive", vec![])]))
        .unwrap();
    exec.run_cycle().unwrap();

    let report = exec.shutdown().unwrap();
    assert_eq!(report.aborts_requested, 1);
    assert_eq!(report.aborts_unacknowledged, 1);
    assert_eq!(adapter.aborts().len(), 1);
}
