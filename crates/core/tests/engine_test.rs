use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use wireflow_core::runtime::diff::DeploymentType;
use wireflow_core::runtime::engine::{build_test_engine, Engine};
use wireflow_core::runtime::model::*;
use wireflow_core::runtime::nodes::FlowNodeBehavior;
use wireflow_core::runtime::registry::RegistryBuilder;

fn eid(s: &str) -> ElementId {
    s.parse().unwrap()
}

#[tokio::test]
async fn test_inject_reaches_sink_quickly() {
    let flows_json = json!([
        { "id": "100", "type": "tab", "label": "Flow 1" },
        { "id": "1", "type": "inject", "z": "100",
            "once": true, "onceDelay": 0, "repeat": "",
            "topic": "t", "payload": "hello", "payloadType": "str",
            "wires": [ [ "2" ] ] },
        { "id": "2", "z": "100", "type": "test-once" }
    ]);
    let engine = build_test_engine(flows_json).unwrap();
    let msgs = engine.run_once(1, Duration::from_millis(200)).await.unwrap();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].get("topic").unwrap(), &Variant::from("t"));
    assert_eq!(msgs[0].get("payload").unwrap(), &Variant::from("hello"));
}

fn switch_flows() -> serde_json::Value {
    // switch on payload; port 0 tags route=low, port 1 tags route=high
    json!([
        { "id": "100", "type": "tab", "label": "Flow 1" },
        { "id": "1", "type": "switch", "z": "100",
            "property": "payload", "propertyType": "msg",
            "rules": [ { "t": "lt", "v": "10", "vt": "num" }, { "t": "gte", "v": "10", "vt": "num" } ],
            "checkall": "true",
            "wires": [ [ "2" ], [ "3" ] ] },
        { "id": "2", "type": "change", "z": "100",
            "rules": [ { "t": "set", "p": "route", "pt": "msg", "to": "low", "tot": "str" } ],
            "wires": [ [ "9" ] ] },
        { "id": "3", "type": "change", "z": "100",
            "rules": [ { "t": "set", "p": "route", "pt": "msg", "to": "high", "tot": "str" } ],
            "wires": [ [ "9" ] ] },
        { "id": "9", "z": "100", "type": "test-once" }
    ])
}

#[tokio::test]
async fn test_switch_routes_by_rule() {
    for (payload, expected_route) in [(5i64, "low"), (15, "high"), (10, "high")] {
        let engine = build_test_engine(switch_flows()).unwrap();
        let to_inject = vec![(eid("1"), Msg::with_payload(Variant::from(payload)))];
        let msgs = engine.run_once_with_inject(1, Duration::from_millis(500), to_inject).await.unwrap();
        assert_eq!(msgs.len(), 1, "payload {} must match exactly one port", payload);
        assert_eq!(msgs[0].get("route").unwrap(), &Variant::from(expected_route), "payload {}", payload);
    }
}

#[tokio::test]
async fn test_split_join_round_trip() {
    let flows_json = json!([
        { "id": "100", "type": "tab", "label": "Flow 1" },
        { "id": "1", "type": "split", "z": "100", "wires": [ [ "2" ] ] },
        { "id": "2", "type": "join", "z": "100", "mode": "auto", "wires": [ [ "9" ] ] },
        { "id": "9", "z": "100", "type": "test-once" }
    ]);
    let engine = build_test_engine(flows_json).unwrap();
    let payload = Variant::Array(vec![Variant::from(1), Variant::from(2), Variant::from(3)]);
    let to_inject = vec![(eid("1"), Msg::with_payload(payload.clone()))];
    let msgs = engine.run_once_with_inject(1, Duration::from_millis(500), to_inject).await.unwrap();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].get("payload").unwrap(), &payload);
    assert!(msgs[0].get("parts").is_none());
}

#[tokio::test]
async fn test_split_join_string_round_trip() {
    let flows_json = json!([
        { "id": "100", "type": "tab", "label": "Flow 1" },
        { "id": "1", "type": "split", "z": "100", "splt": "-", "wires": [ [ "2" ] ] },
        { "id": "2", "type": "join", "z": "100", "mode": "auto", "wires": [ [ "9" ] ] },
        { "id": "9", "z": "100", "type": "test-once" }
    ]);
    let engine = build_test_engine(flows_json).unwrap();
    let to_inject = vec![(eid("1"), Msg::with_payload(Variant::from("a-b-c")))];
    let msgs = engine.run_once_with_inject(1, Duration::from_millis(500), to_inject).await.unwrap();
    assert_eq!(msgs[0].get("payload").unwrap(), &Variant::from("a-b-c"));
}

fn catch_flows() -> serde_json::Value {
    // "a" and "b" both fail on non-numeric payloads; the catch node only
    // listens to "a"
    json!([
        { "id": "100", "type": "tab", "label": "Flow 1" },
        { "id": "a", "type": "range", "z": "100",
            "minin": 0, "maxin": 10, "minout": 0, "maxout": 100, "wires": [ [] ] },
        { "id": "b", "type": "range", "z": "100",
            "minin": 0, "maxin": 10, "minout": 0, "maxout": 100, "wires": [ [] ] },
        { "id": "c", "type": "catch", "z": "100", "scope": [ "000000000000000a" ], "wires": [ [ "9" ] ] },
        { "id": "9", "z": "100", "type": "test-once" }
    ])
}

#[tokio::test]
async fn test_catch_receives_scoped_error() {
    let engine = build_test_engine(catch_flows()).unwrap();
    let to_inject = vec![(eid("a"), Msg::with_payload(Variant::from("boom")))];
    let msgs = engine.run_once_with_inject(1, Duration::from_millis(500), to_inject).await.unwrap();
    assert_eq!(msgs.len(), 1);
    let source_id = msgs[0].get_nav("error.source.id").unwrap();
    assert_eq!(source_id, &Variant::from("000000000000000a"));
    assert!(msgs[0].get_nav("error.message").is_some());
}

#[tokio::test]
async fn test_catch_ignores_out_of_scope_error() {
    let engine = build_test_engine(catch_flows()).unwrap();
    let to_inject = vec![(eid("b"), Msg::with_payload(Variant::from("boom")))];
    let result = engine.run_once_with_inject(1, Duration::from_millis(300), to_inject).await;
    assert!(result.is_err(), "the out-of-scope error must not reach the catch node");
}

#[tokio::test]
async fn test_unscoped_catch_receives_all_same_flow_errors() {
    let flows_json = json!([
        { "id": "100", "type": "tab", "label": "Flow 1" },
        { "id": "a", "type": "range", "z": "100",
            "minin": 0, "maxin": 10, "minout": 0, "maxout": 100, "wires": [ [] ] },
        { "id": "c", "type": "catch", "z": "100", "wires": [ [ "9" ] ] },
        { "id": "9", "z": "100", "type": "test-once" }
    ]);
    let engine = build_test_engine(flows_json).unwrap();
    let to_inject = vec![(eid("a"), Msg::with_payload(Variant::from("nan")))];
    let msgs = engine.run_once_with_inject(1, Duration::from_millis(500), to_inject).await.unwrap();
    assert_eq!(msgs.len(), 1);
}

#[tokio::test]
async fn test_rate_limit_passes_all_messages_in_order() {
    let flows_json = json!([
        { "id": "100", "type": "tab", "label": "Flow 1" },
        { "id": "1", "type": "delay", "z": "100",
            "pauseType": "rate", "rate": 5, "nbRateUnits": 1, "rateUnits": "second",
            "drop": false, "wires": [ [ "9" ] ] },
        { "id": "9", "z": "100", "type": "test-once" }
    ]);
    let engine = build_test_engine(flows_json).unwrap();
    let to_inject: Vec<(ElementId, Msg)> =
        (1..=5).map(|i| (eid("1"), Msg::with_payload(Variant::from(i)))).collect();

    let begin = std::time::Instant::now();
    let msgs = engine.run_once_with_inject(5, Duration::from_secs(3), to_inject).await.unwrap();
    let elapsed = begin.elapsed();

    assert_eq!(msgs.len(), 5);
    for (i, msg) in msgs.iter().enumerate() {
        assert_eq!(msg.get("payload").unwrap(), &Variant::from((i + 1) as i64), "order must be preserved");
    }
    // 4 metered intervals of 200ms separate the 5 emissions
    assert!(elapsed >= Duration::from_millis(500), "metering was too fast: {:?}", elapsed);
}

#[tokio::test]
async fn test_rate_limit_drop_admits_one_of_burst() {
    let flows_json = json!([
        { "id": "100", "type": "tab", "label": "Flow 1" },
        { "id": "1", "type": "delay", "z": "100",
            "pauseType": "rate", "rate": 2, "nbRateUnits": 1, "rateUnits": "second",
            "drop": true, "wires": [ [ "9" ] ] },
        { "id": "9", "z": "100", "type": "test-once" }
    ]);
    let engine = build_test_engine(flows_json).unwrap();
    let to_inject: Vec<(ElementId, Msg)> =
        (1..=5).map(|i| (eid("1"), Msg::with_payload(Variant::from(i)))).collect();
    let msgs = engine.run_once_with_inject(1, Duration::from_millis(400), to_inject).await.unwrap();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].get("payload").unwrap(), &Variant::from(1));
}

#[tokio::test]
async fn test_trigger_block_mode_single_cycle() {
    let flows_json = json!([
        { "id": "100", "type": "tab", "label": "Flow 1" },
        { "id": "1", "type": "trigger", "z": "100",
            "op1": "go", "op1type": "str", "op2": "done", "op2type": "str",
            "duration": "200", "units": "ms",
            "wires": [ [ "9" ] ] },
        { "id": "9", "z": "100", "type": "test-once" }
    ]);
    let engine = build_test_engine(flows_json).unwrap();
    let to_inject: Vec<(ElementId, Msg)> =
        (0..3).map(|_| (eid("1"), Msg::with_payload(Variant::from("in")))).collect();
    let msgs = engine.run_once_with_inject(2, Duration::from_secs(1), to_inject).await.unwrap();

    // one cycle only: a single op1 and a single op2 for three arrivals
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0].get("payload").unwrap(), &Variant::from("go"));
    assert_eq!(msgs[1].get("payload").unwrap(), &Variant::from("done"));
}

#[tokio::test]
async fn test_fan_out_forks_message_ids() {
    let flows_json = json!([
        { "id": "100", "type": "tab", "label": "Flow 1" },
        { "id": "1", "type": "inject", "z": "100",
            "once": true, "onceDelay": 0, "repeat": "",
            "topic": "", "payload": "x", "payloadType": "str",
            "wires": [ [ "8", "9" ] ] },
        { "id": "8", "z": "100", "type": "test-once" },
        { "id": "9", "z": "100", "type": "test-once" }
    ]);
    let engine = build_test_engine(flows_json).unwrap();
    let msgs = engine.run_once(2, Duration::from_millis(500)).await.unwrap();
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0].get("payload").unwrap(), msgs[1].get("payload").unwrap());
    // one destination got the original, the other a fork with a fresh id
    assert_ne!(msgs[0].id(), msgs[1].id());
}

#[tokio::test]
async fn test_link_call_round_trip() {
    let flows_json = json!([
        { "id": "100", "type": "tab", "label": "Flow 1" },
        { "id": "5", "type": "link call", "z": "100", "linkType": "static",
            "links": [ "1" ], "timeout": "2", "wires": [ [ "9" ] ] },
        { "id": "1", "type": "link in", "z": "100", "wires": [ [ "3" ] ] },
        { "id": "3", "type": "change", "z": "100",
            "rules": [ { "t": "set", "p": "payload", "pt": "msg", "to": "returned", "tot": "str" } ],
            "wires": [ [ "4" ] ] },
        { "id": "4", "type": "link out", "z": "100", "mode": "return", "wires": [] },
        { "id": "9", "z": "100", "type": "test-once" }
    ]);
    let engine = build_test_engine(flows_json).unwrap();
    let to_inject = vec![(eid("5"), Msg::with_payload(Variant::from("query")))];
    let msgs = engine.run_once_with_inject(1, Duration::from_millis(500), to_inject).await.unwrap();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].get("payload").unwrap(), &Variant::from("returned"));
}

#[tokio::test]
async fn test_link_call_timeout_raises_one_error() {
    let flows_json = json!([
        { "id": "100", "type": "tab", "label": "Flow 1" },
        { "id": "5", "type": "link call", "z": "100", "linkType": "static",
            "links": [ "1" ], "timeout": "0.2", "wires": [ [ ] ] },
        // the linked target never returns
        { "id": "1", "type": "link in", "z": "100", "wires": [ [ ] ] },
        { "id": "c", "type": "catch", "z": "100", "wires": [ [ "9" ] ] },
        { "id": "9", "z": "100", "type": "test-once" }
    ]);
    let engine = build_test_engine(flows_json).unwrap();
    let to_inject = vec![(eid("5"), Msg::with_payload(Variant::from("query")))];
    let msgs = engine.run_once_with_inject(1, Duration::from_secs(2), to_inject).await.unwrap();
    assert_eq!(msgs.len(), 1);
    let message = msgs[0].get_nav("error.message").unwrap().as_str().unwrap().to_string();
    assert!(message.contains("timed out"), "unexpected error message: {}", message);
}

#[tokio::test]
async fn test_subflow_instance_expands_and_relays() {
    let flows_json = json!([
        { "id": "100", "type": "tab", "label": "Flow 1" },
        { "id": "sf1", "type": "subflow", "name": "sub",
            "in": [ { "wires": [ { "id": "n1" } ] } ],
            "out": [ { "wires": [ { "id": "n1", "port": 0 } ] } ] },
        { "id": "n1", "type": "change", "z": "sf1",
            "rules": [ { "t": "set", "p": "payload", "pt": "msg", "to": "via-sub", "tot": "str" } ],
            "wires": [ [ ] ] },
        { "id": "inst", "type": "subflow:sf1", "z": "100", "wires": [ [ "9" ] ] },
        { "id": "9", "z": "100", "type": "test-once" }
    ]);
    let engine = build_test_engine(flows_json).unwrap();
    let to_inject = vec![(eid("inst"), Msg::with_payload(Variant::from("in")))];
    let msgs = engine.run_once_with_inject(1, Duration::from_millis(500), to_inject).await.unwrap();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].get("payload").unwrap(), &Variant::from("via-sub"));
}

#[tokio::test]
async fn test_mqtt_loopback_pub_sub() {
    let flows_json = json!([
        { "id": "b1", "type": "mqtt-broker", "name": "local", "broker": "loop" },
        { "id": "100", "type": "tab", "label": "Flow 1" },
        { "id": "out1", "type": "mqtt out", "z": "100", "topic": "t/1", "qos": 0, "retain": false,
            "broker": "00000000000000b1", "wires": [] },
        { "id": "in1", "type": "mqtt in", "z": "100", "topic": "t/#", "qos": 0, "datatype": "auto",
            "broker": "00000000000000b1", "wires": [ [ "9" ] ] },
        { "id": "9", "z": "100", "type": "test-once" }
    ]);
    let engine = build_test_engine(flows_json).unwrap();
    // give the subscriber a head start before publishing
    let to_inject = vec![(eid("out1"), Msg::with_payload(Variant::from("hello")))];
    let msgs = engine.run_once_with_inject(1, Duration::from_secs(1), to_inject).await.unwrap();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].get("payload").unwrap(), &Variant::from("hello"));
    assert_eq!(msgs[0].get("topic").unwrap(), &Variant::from("t/1"));
}

async fn make_engine_for_deploy(flows_json: serde_json::Value) -> Engine {
    let registry = RegistryBuilder::default().build().unwrap();
    Engine::with_json(&registry, flows_json, None).unwrap()
}

#[tokio::test]
async fn test_incremental_redeploy_keeps_unchanged_nodes() {
    let old_flows = json!([
        { "id": "100", "type": "tab", "label": "Flow 1" },
        { "id": "a", "type": "test-once", "z": "100", "wires": [] },
        { "id": "b", "type": "debug", "z": "100", "wires": [] }
    ]);
    let new_flows = json!([
        { "id": "100", "type": "tab", "label": "Flow 1" },
        { "id": "a", "type": "test-once", "z": "100", "wires": [] },
        { "id": "c", "type": "debug", "z": "100", "wires": [] }
    ]);

    let engine = make_engine_for_deploy(old_flows).await;
    let a_before = engine.find_flow_node_by_id(&eid("a")).unwrap();
    assert!(engine.find_flow_node_by_id(&eid("b")).is_some());

    let diff = engine.set_flows(new_flows.clone(), DeploymentType::Nodes, false).await.unwrap();
    assert!(diff.removed.contains(&eid("b")));
    assert!(diff.added.contains(&eid("c")));
    assert!(!diff.changed.contains(&eid("a")));

    // "b" is gone, "c" is live, "a" is the very same instance
    assert!(engine.find_flow_node_by_id(&eid("b")).is_none());
    assert!(engine.find_flow_node_by_id(&eid("c")).is_some());
    let a_after = engine.find_flow_node_by_id(&eid("a")).unwrap();
    assert!(Arc::ptr_eq(&a_before, &a_after), "an unchanged node must not be recycled");

    assert_eq!(engine.get_flows(), new_flows.as_array().cloned().unwrap());
}

#[tokio::test]
async fn test_full_redeploy_replaces_everything() {
    let old_flows = json!([
        { "id": "100", "type": "tab", "label": "Flow 1" },
        { "id": "a", "type": "test-once", "z": "100", "wires": [] }
    ]);
    let engine = make_engine_for_deploy(old_flows).await;
    let a_before = engine.find_flow_node_by_id(&eid("a")).unwrap();

    let new_flows = json!([
        { "id": "100", "type": "tab", "label": "Flow 1" },
        { "id": "a", "type": "test-once", "z": "100", "wires": [] }
    ]);
    engine.set_flows(new_flows, DeploymentType::Full, false).await.unwrap();

    let a_after = engine.find_flow_node_by_id(&eid("a")).unwrap();
    assert!(!Arc::ptr_eq(&a_before, &a_after), "a full deploy rebuilds every node");
}

#[tokio::test]
async fn test_redeploy_while_running_delivers_to_new_node() {
    let old_flows = json!([
        { "id": "100", "type": "tab", "label": "Flow 1" },
        { "id": "1", "type": "inject", "z": "100",
            "once": false, "repeat": "0.05",
            "topic": "", "payload": "tick", "payloadType": "str",
            "wires": [ [ ] ] }
    ]);
    let new_flows = json!([
        { "id": "100", "type": "tab", "label": "Flow 1" },
        { "id": "1", "type": "inject", "z": "100",
            "once": false, "repeat": "0.05",
            "topic": "", "payload": "tick", "payloadType": "str",
            "wires": [ [ "9" ] ] },
        { "id": "9", "type": "test-once", "z": "100", "wires": [] }
    ]);

    let engine = make_engine_for_deploy(old_flows).await;
    engine.start().await.unwrap();

    let inject_before = engine.find_flow_node_by_id(&eid("1")).unwrap();
    assert!(inject_before.get_base().ports.read().unwrap()[0].wires.is_empty());

    let diff = engine.set_flows(new_flows, DeploymentType::Nodes, false).await.unwrap();
    assert!(diff.added.contains(&eid("9")));
    assert!(diff.rewired.contains(&eid("1")));

    // the sink is live and the surviving inject node is rewired to it
    assert!(engine.find_flow_node_by_id(&eid("9")).is_some());
    let inject_after = engine.find_flow_node_by_id(&eid("1")).unwrap();
    assert!(Arc::ptr_eq(&inject_before, &inject_after));
    {
        let ports = inject_after.get_base().ports.read().unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].wires.len(), 1);
        assert_eq!(ports[0].wires[0].target_id, eid("9"));
    }

    engine.stop().await.unwrap();
}
