//! Plans and configuration loaded from disk, then executed

use std::io::Write;
use std::sync::Arc;

use reactive_exec::prelude::*;

const PLAN_YAML: &str = r#"
id: Mission
type: list
variables:
  - name: samples
    initial: { Integer: 0 }
children:
  - id: Sample
    type: command
    name: take_sample
    returns: samples
  - id: Report
    type: update
    start:
      op:
        op: eq
        args:
          - { node_outcome: Sample }
          - { value: { Outcome: SUCCESS } }
    pairs:
      - name: samples
        value: { var: samples }
"#;

#[test]
fn test_yaml_plan_from_file_executes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mission.yaml");
    std::fs::write(&path, PLAN_YAML).unwrap();

    let adapter = Arc::new(ScriptedInterface::new());
    adapter.auto_ack_commands(CommandHandle::Success);
    adapter.auto_ack_updates(true);
    adapter.return_value("take_sample", Value::Integer(7));
    let mut exec = Exec::new(ExecConfig::default(), Interfaces::shared(adapter.clone())).unwrap();
    adapter.attach(exec.queue());

    exec.add_plan(PlanNode::from_file(&path).unwrap()).unwrap();
    exec.run_until_quiescent(20).unwrap();

    assert_eq!(exec.node_outcome("Mission"), Some(NodeOutcome::Success));
    let updates = adapter.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].node, "Report");
    assert_eq!(updates[0].pairs, vec![("samples".to_string(), Value::Integer(7))]);
}

#[test]
fn test_json_plan_round_trips_through_yaml() {
    let json = r#"{
        "id": "Root",
        "type": "list",
        "children": [
            {"id": "Wait", "type": "empty", "start": {"lookup_on_change": {"name": "go", "tolerance": 0.0}}}
        ]
    }"#;
    let plan = PlanNode::from_json(json).unwrap();
    let yaml = plan.to_yaml().unwrap();
    assert_eq!(PlanNode::from_yaml(&yaml).unwrap(), plan);
}

#[test]
fn test_config_file_shapes_executive() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "time_state: clock").unwrap();
    writeln!(file, "allow_duplicate_messages: true").unwrap();
    let config = ExecConfig::from_file(file.path()).unwrap();

    let adapter = Arc::new(ScriptedInterface::new());
    adapter.set_state(State::named("clock"), Value::Real(12.5));
    let mut exec = Exec::new(config, Interfaces::shared(adapter.clone())).unwrap();
    exec.run_cycle().unwrap();

    assert_eq!(exec.current_time(), Some(12.5));
    assert_eq!(adapter.lookup_count("clock"), 1);
    assert_eq!(adapter.lookup_count("time"), 0);
}
