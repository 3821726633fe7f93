// crates/wfcore/tests/graph_test.rs

use serde_json::json;
use std::collections::{HashMap, HashSet};
use wfcore::{
    Connection, ConnectionFilter, ConnectionType, NodeDescription, NodeGroup, NodeSpec, NodeTypes,
    Workflow, WorkflowDefinition, WorkflowError,
};

/// Minimal type catalogue standing in for the runtime registry.
struct Types(HashMap<&'static str, NodeDescription>);

impl Types {
    fn standard() -> Self {
        let mut types = HashMap::new();
        types.insert(
            "trigger.manual",
            NodeDescription::new("trigger.manual", NodeGroup::Trigger).inputs(vec![]),
        );
        types.insert(
            "trigger.poll",
            NodeDescription::new("trigger.poll", NodeGroup::Poll).inputs(vec![]),
        );
        types.insert("action", NodeDescription::new("action", NodeGroup::Action));
        types.insert("tool", NodeDescription::new("tool", NodeGroup::Action).inputs(vec![]));
        Self(types)
    }
}

impl NodeTypes for Types {
    fn description(&self, type_name: &str) -> Option<NodeDescription> {
        self.0.get(type_name).cloned()
    }
}

fn workflow_with(nodes: &[(&str, &str)], edges: &[(&str, &str)]) -> Workflow {
    let mut workflow = Workflow::new("test");
    for (name, node_type) in nodes {
        workflow.add_node(NodeSpec::new(*name, *node_type)).unwrap();
    }
    for (from, to) in edges {
        workflow.connect(from, to).unwrap();
    }
    workflow
}

/// Trigger -> A, Trigger -> B, A -> C, B -> C, C -> D
fn diamond() -> Workflow {
    workflow_with(
        &[
            ("Trigger", "trigger.manual"),
            ("A", "action"),
            ("B", "action"),
            ("C", "action"),
            ("D", "action"),
        ],
        &[("Trigger", "A"), ("Trigger", "B"), ("A", "C"), ("B", "C"), ("C", "D")],
    )
}

fn set(names: Vec<String>) -> HashSet<String> {
    names.into_iter().collect()
}

#[test]
fn test_parents_and_children_are_inverse() {
    let workflow = diamond();
    let filter = ConnectionFilter::All;

    for node in workflow.node_names() {
        for child in workflow.get_child_nodes(node, &filter, None) {
            assert!(
                workflow.get_parent_nodes(&child, &filter, None).contains(node),
                "{} should be an ancestor of {}",
                node,
                child
            );
        }
        for parent in workflow.get_parent_nodes(node, &filter, None) {
            assert!(workflow.get_child_nodes(&parent, &filter, None).contains(node));
        }
    }
}

#[test]
fn test_diamond_reports_each_node_once() {
    let workflow = diamond();
    let parents = workflow.get_parent_nodes("D", &ConnectionFilter::main(), None);
    assert_eq!(parents.len(), 4);
    assert_eq!(parents[0], "C");
    assert_eq!(
        set(parents),
        set(vec!["A".into(), "B".into(), "C".into(), "Trigger".into()])
    );
}

#[test]
fn test_depth_limits_traversal() {
    let workflow = diamond();
    assert_eq!(
        workflow.get_child_nodes("Trigger", &ConnectionFilter::All, Some(1)),
        vec!["A".to_string(), "B".to_string()]
    );
    assert_eq!(
        set(workflow.get_parent_nodes("D", &ConnectionFilter::All, Some(2))),
        set(vec!["C".into(), "A".into(), "B".into()])
    );
    assert!(workflow
        .get_child_nodes("Trigger", &ConnectionFilter::All, Some(0))
        .is_empty());
}

#[test]
fn test_connection_filters() {
    let mut workflow = workflow_with(
        &[("Agent", "action"), ("Tool", "tool"), ("Fallback", "action")],
        &[],
    );
    workflow
        .add_connection(Connection::main("Tool", "Agent").of_type("ai_tool"))
        .unwrap();
    workflow.add_connection(Connection::error("Agent", "Fallback")).unwrap();

    assert!(workflow
        .get_parent_nodes("Agent", &ConnectionFilter::main(), None)
        .is_empty());
    assert_eq!(
        workflow.get_parent_nodes("Agent", &ConnectionFilter::AllNonMain, None),
        vec!["Tool".to_string()]
    );
    assert_eq!(
        workflow.get_child_nodes("Agent", &ConnectionFilter::Only(ConnectionType::Error), None),
        vec!["Fallback".to_string()]
    );
    assert_eq!(
        workflow.get_child_nodes("Agent", &ConnectionFilter::AllNonMain, None),
        vec!["Fallback".to_string()]
    );
}

#[test]
fn test_cycle_is_rejected_and_rolled_back() {
    let mut workflow = diamond();
    let before = workflow.connections().len();

    let result = workflow.connect("D", "Trigger");
    assert!(matches!(result, Err(WorkflowError::InvalidDefinition(_))));
    assert_eq!(workflow.connections().len(), before);
    assert!(workflow
        .get_parent_nodes("Trigger", &ConnectionFilter::All, None)
        .is_empty());
}

#[test]
fn test_definition_validation() {
    let duplicate_names: WorkflowDefinition = serde_json::from_value(json!({
        "name": "dup",
        "nodes": [
            {"name": "A", "node_type": "action"},
            {"name": "A", "node_type": "action"}
        ]
    }))
    .unwrap();
    assert!(matches!(
        Workflow::from_definition(duplicate_names),
        Err(WorkflowError::InvalidDefinition(_))
    ));

    let dangling: WorkflowDefinition = serde_json::from_value(json!({
        "name": "dangling",
        "nodes": [{"name": "A", "node_type": "action"}],
        "connections": [{"source": "A", "destination": "Ghost"}]
    }))
    .unwrap();
    assert!(matches!(
        Workflow::from_definition(dangling),
        Err(WorkflowError::InvalidDefinition(_))
    ));

    let cyclic: WorkflowDefinition = serde_json::from_value(json!({
        "name": "cyclic",
        "nodes": [
            {"name": "A", "node_type": "action"},
            {"name": "B", "node_type": "action"}
        ],
        "connections": [
            {"source": "A", "destination": "B"},
            {"source": "B", "destination": "A"}
        ]
    }))
    .unwrap();
    assert!(Workflow::from_definition(cyclic).is_err());
}

#[test]
fn test_remove_node_drops_its_connections() {
    let mut workflow = diamond();
    workflow.remove_node("C").unwrap();

    assert!(workflow.connections().iter().all(|c| c.source != "C" && c.destination != "C"));
    assert!(workflow.get_parent_nodes("D", &ConnectionFilter::All, None).is_empty());
    assert!(matches!(workflow.get_node("C"), Err(WorkflowError::NodeNotFound(_))));
}

#[test]
fn test_topological_order_respects_edges() {
    let workflow = diamond();
    let order = workflow.topological_order().unwrap();
    let position = |name: &str| order.iter().position(|n| n == name).unwrap();

    for conn in workflow.connections() {
        assert!(position(&conn.source) < position(&conn.destination));
    }
    assert_eq!(order, vec!["Trigger", "A", "B", "C", "D"]);
}

#[test]
fn test_highest_node_in_diamond() {
    let workflow = diamond();
    assert_eq!(
        workflow.get_highest_node("D", None, &mut HashSet::new()),
        vec!["Trigger".to_string()]
    );
    assert!(workflow
        .get_highest_node("Trigger", None, &mut HashSet::new())
        .is_empty());
}

#[test]
fn test_highest_node_skips_disabled_parents() {
    let mut workflow = Workflow::new("disabled");
    workflow.add_node(NodeSpec::new("Root", "action")).unwrap();
    workflow.add_node(NodeSpec::new("Off", "action").disabled()).unwrap();
    workflow.add_node(NodeSpec::new("Leaf", "action")).unwrap();
    workflow.connect("Root", "Off").unwrap();
    workflow.connect("Off", "Leaf").unwrap();

    assert!(workflow
        .get_highest_node("Leaf", None, &mut HashSet::new())
        .is_empty());
}

#[test]
fn test_highest_node_by_input_index() {
    let mut workflow = workflow_with(&[("Left", "action"), ("Right", "action"), ("Merge", "action")], &[]);
    workflow.connect("Left", "Merge").unwrap();
    workflow
        .add_connection(Connection::main("Right", "Merge").to_input(1))
        .unwrap();

    assert_eq!(
        workflow.get_highest_node("Merge", Some(1), &mut HashSet::new()),
        vec!["Right".to_string()]
    );
}

#[test]
fn test_parent_main_input_node_follows_auxiliary_links() {
    let mut workflow = workflow_with(
        &[("Trigger", "trigger.manual"), ("Agent", "action"), ("Tool", "tool"), ("Memory", "tool")],
        &[("Trigger", "Agent")],
    );
    workflow
        .add_connection(Connection::main("Memory", "Tool").of_type("ai_memory"))
        .unwrap();
    workflow
        .add_connection(Connection::main("Tool", "Agent").of_type("ai_tool"))
        .unwrap();

    assert_eq!(workflow.get_parent_main_input_node("Memory").unwrap().name, "Agent");
    assert_eq!(workflow.get_parent_main_input_node("Agent").unwrap().name, "Agent");

    let start = workflow.get_start_node(&Types::standard(), Some("Tool")).unwrap();
    assert_eq!(start.name, "Trigger");
}

#[test]
fn test_start_node_prefers_triggers_in_definition_order() {
    let types = Types::standard();
    let workflow = workflow_with(
        &[
            ("Orphan", "action"),
            ("Poller", "trigger.poll"),
            ("First", "trigger.manual"),
            ("Second", "trigger.manual"),
        ],
        &[],
    );
    assert_eq!(workflow.get_start_node(&types, None).unwrap().name, "First");

    let polling = workflow_with(&[("Orphan", "action"), ("Poller", "trigger.poll")], &[]);
    assert_eq!(polling.get_start_node(&types, None).unwrap().name, "Poller");

    let plain = workflow_with(&[("A", "action"), ("B", "action")], &[("A", "B")]);
    assert_eq!(plain.get_start_node(&types, None).unwrap().name, "A");
}

#[test]
fn test_start_node_for_destination() {
    let types = Types::standard();
    let mut workflow = workflow_with(
        &[
            ("Left", "action"),
            ("Right", "trigger.manual"),
            ("Merge", "action"),
            ("Other", "trigger.manual"),
        ],
        &[("Left", "Merge"), ("Right", "Merge")],
    );
    assert_eq!(workflow.get_start_node(&types, Some("Merge")).unwrap().name, "Right");
    assert_eq!(workflow.get_start_node(&types, Some("Left")).unwrap().name, "Left");

    workflow.get_node_mut("Right").unwrap().disabled = true;
    assert_eq!(workflow.get_start_node(&types, Some("Merge")).unwrap().name, "Left");

    assert!(matches!(
        workflow.get_start_node(&types, Some("Nope")),
        Err(WorkflowError::NodeNotFound(_))
    ));
}

#[test]
fn test_start_node_requires_an_enabled_node() {
    let mut workflow = Workflow::new("empty");
    assert!(matches!(
        workflow.get_start_node(&Types::standard(), None),
        Err(WorkflowError::NoStartNode)
    ));
    workflow.add_node(NodeSpec::new("Off", "trigger.manual").disabled()).unwrap();
    assert!(matches!(
        workflow.get_start_node(&Types::standard(), None),
        Err(WorkflowError::NoStartNode)
    ));
}

#[test]
fn test_rename_rewrites_every_reference() {
    let mut workflow = Workflow::new("rename");
    workflow.add_node(NodeSpec::new("Fetch", "action")).unwrap();
    workflow.add_node(NodeSpec::new("FetchAll", "action")).unwrap();
    workflow
        .add_node(
            NodeSpec::new("Use", "action")
                .with_parameter("a", r#"{{ $node["Fetch"].json.id }}"#)
                .with_parameter("b", "id={{ $node.Fetch.json.id }} all={{ $node.FetchAll.json }}")
                .with_parameter("c", json!({"nested": ["{{ $('Fetch').json }}"]}))
                .with_parameter("d", "$node.Fetch outside a block"),
        )
        .unwrap();
    workflow.connect("Fetch", "Use").unwrap();
    workflow.connect("FetchAll", "Use").unwrap();
    workflow.set_pin_data("Fetch", json!({"id": 1})).unwrap();
    workflow.set_static_data("node:Fetch", json!({"cursor": 3}).as_object().unwrap().clone());

    workflow.rename_node("Fetch", "Load Users").unwrap();

    let params = &workflow.get_node("Use").unwrap().parameters;
    assert_eq!(params["a"], json!(r#"{{ $node["Load Users"].json.id }}"#));
    assert_eq!(
        params["b"],
        json!(r#"id={{ $node["Load Users"].json.id }} all={{ $node.FetchAll.json }}"#)
    );
    assert_eq!(params["c"], json!({"nested": ["{{ $('Load Users').json }}"]}));
    assert_eq!(params["d"], json!("$node.Fetch outside a block"));

    assert!(workflow.get_node("Load Users").is_ok());
    assert!(!workflow.contains_node("Fetch"));
    assert_eq!(
        workflow.get_parent_nodes("Use", &ConnectionFilter::All, None),
        vec!["Load Users".to_string(), "FetchAll".to_string()]
    );
    assert_eq!(workflow.get_pin_data("Load Users"), Some(&json!({"id": 1})));
    assert_eq!(workflow.get_static_data("node:Load Users")["cursor"], json!(3));
    assert!(workflow.get_static_data("node:Fetch").is_empty());
    assert_eq!(workflow.node_names()[0], "Load Users");
}

#[test]
fn test_rename_is_idempotent() {
    let mut workflow = diamond();
    workflow.rename_node("A", "Alpha").unwrap();
    let once = workflow.to_definition();

    workflow.rename_node("A", "Alpha").unwrap();
    let twice = workflow.to_definition();
    assert_eq!(
        serde_json::to_value(&once.nodes).unwrap(),
        serde_json::to_value(&twice.nodes).unwrap()
    );
    assert_eq!(once.connections, twice.connections);

    workflow.rename_node("Alpha", "Alpha").unwrap();
    assert!(matches!(
        workflow.rename_node("Ghost", "Spirit"),
        Err(WorkflowError::NodeNotFound(_))
    ));
    assert!(matches!(
        workflow.rename_node("Alpha", "B"),
        Err(WorkflowError::InvalidDefinition(_))
    ));
}

#[test]
fn test_data_ancestors_and_descendants() {
    let mut workflow = diamond();
    workflow.add_node(NodeSpec::new("Handler", "action")).unwrap();
    workflow.add_connection(Connection::error("C", "Handler")).unwrap();

    let descendants = workflow.data_descendants("A");
    assert_eq!(descendants, set(vec!["C".into(), "D".into(), "Handler".into()]));
    assert!(workflow.data_ancestors("Handler").contains("Trigger"));
}

#[test]
fn test_renaming_a_clone_leaves_the_original_alone() {
    let original = workflow_with(
        &[("Poll", "trigger.poll"), ("A", "action")],
        &[("Poll", "A")],
    );
    original.set_static_data("node:Poll", json!({"cursor": 7}).as_object().unwrap().clone());

    let mut copy = original.clone();
    copy.rename_node("Poll", "Renamed").unwrap();

    assert!(original.contains_node("Poll"));
    assert_eq!(original.get_static_data("node:Poll").get("cursor"), Some(&json!(7)));
    assert!(original.get_static_data("node:Renamed").is_empty());
    assert_eq!(copy.get_static_data("node:Renamed").get("cursor"), Some(&json!(7)));
    assert!(copy.get_static_data("node:Poll").is_empty());

    copy.set_static_data("global", json!({"seen": true}).as_object().unwrap().clone());
    assert!(original.get_static_data("global").is_empty());
}
