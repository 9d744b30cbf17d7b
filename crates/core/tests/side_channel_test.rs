use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use wireflow_core::runtime::engine::{build_test_engine, Engine, EngineBuilder};
use wireflow_core::runtime::hooks::{HookVerdict, Hooks};
use wireflow_core::runtime::model::*;
use wireflow_core::runtime::registry::RegistryBuilder;

fn eid(s: &str) -> ElementId {
    s.parse().unwrap()
}

#[tokio::test]
async fn test_complete_node_sees_finished_units() {
    let flows_json = json!([
        { "id": "100", "type": "tab", "label": "Flow 1" },
        { "id": "1", "type": "inject", "z": "100",
            "once": true, "onceDelay": 0, "repeat": "",
            "topic": "", "payload": "x", "payloadType": "str",
            "wires": [ [ ] ] },
        { "id": "c", "type": "complete", "z": "100", "scope": [ "0000000000000001" ], "wires": [ [ "9" ] ] },
        { "id": "9", "z": "100", "type": "test-once" }
    ]);
    let engine = build_test_engine(flows_json).unwrap();
    let msgs = engine.run_once(1, Duration::from_millis(500)).await.unwrap();
    assert_eq!(msgs.len(), 1);
    // the completed message is re-emitted unchanged
    assert_eq!(msgs[0].get("payload").unwrap(), &Variant::from("x"));
}

#[tokio::test]
async fn test_status_node_receives_scoped_status() {
    let flows_json = json!([
        { "id": "b1", "type": "mqtt-broker", "name": "local", "broker": "loop" },
        { "id": "100", "type": "tab", "label": "Flow 1" },
        { "id": "a1", "type": "mqtt in", "z": "100", "topic": "t/#", "qos": 0,
            "broker": "00000000000000b1", "wires": [ [ ] ] },
        { "id": "s1", "type": "status", "z": "100", "scope": [ "00000000000000a1" ], "wires": [ [ "9" ] ] },
        { "id": "9", "z": "100", "type": "test-once" }
    ]);
    let engine = build_test_engine(flows_json).unwrap();
    let msgs = engine.run_once(1, Duration::from_secs(1)).await.unwrap();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].get_nav("status.fill").unwrap(), &Variant::from("green"));
    assert_eq!(msgs[0].get_nav("status.shape").unwrap(), &Variant::from("dot"));
    assert_eq!(msgs[0].get_nav("status.source.id").unwrap(), &Variant::from("00000000000000a1"));
}

async fn engine_with_hooks(flows_json: serde_json::Value, hooks: Arc<Hooks>) -> Engine {
    let registry = RegistryBuilder::default().build().unwrap();
    let engine = EngineBuilder::default().with_registry(registry).with_hooks(hooks).build(None).unwrap();
    engine.set_flows(flows_json, wireflow_core::runtime::diff::DeploymentType::Full, false).await.unwrap();
    engine
}

#[tokio::test]
async fn test_pre_deliver_hook_halts_the_leg() {
    let flows_json = json!([
        { "id": "100", "type": "tab", "label": "Flow 1" },
        { "id": "1", "type": "inject", "z": "100",
            "once": true, "onceDelay": 0, "repeat": "",
            "topic": "", "payload": "x", "payloadType": "str",
            "wires": [ [ "9" ] ] },
        { "id": "9", "z": "100", "type": "test-once" }
    ]);

    let hooks = Arc::new(Hooks::new());
    hooks.add_fn("preDeliver.block-all", |_| Ok(HookVerdict::Halt)).unwrap();

    let engine = engine_with_hooks(flows_json.clone(), hooks.clone()).await;
    let result = engine.run_once(1, Duration::from_millis(300)).await;
    assert!(result.is_err(), "a halted preDeliver must suppress the delivery");

    // removing the handler opens the path again
    hooks.remove("*.block-all").unwrap();
    let engine = engine_with_hooks(flows_json, hooks).await;
    let msgs = engine.run_once(1, Duration::from_millis(500)).await.unwrap();
    assert_eq!(msgs.len(), 1);
}

#[tokio::test]
async fn test_on_send_hook_can_rewrite_messages() {
    let flows_json = json!([
        { "id": "100", "type": "tab", "label": "Flow 1" },
        { "id": "1", "type": "inject", "z": "100",
            "once": true, "onceDelay": 0, "repeat": "",
            "topic": "", "payload": "original", "payloadType": "str",
            "wires": [ [ "9" ] ] },
        { "id": "9", "z": "100", "type": "test-once" }
    ]);

    let hooks = Arc::new(Hooks::new());
    hooks
        .add_fn("onSend.stamp", |payload| {
            if let wireflow_core::runtime::hooks::HookPayload::Send(e) = &payload {
                if let Some(mut guard) = e.msg.try_write() {
                    guard.set("stamped".to_string(), Variant::Bool(true));
                }
            }
            Ok(HookVerdict::Continue)
        })
        .unwrap();

    let engine = engine_with_hooks(flows_json, hooks).await;
    let msgs = engine.run_once(1, Duration::from_millis(500)).await.unwrap();
    assert_eq!(msgs.len(), 1);
    // the hook saw the live handle, so its mark is on the delivered msg
    assert_eq!(msgs[0].get("stamped"), Some(&Variant::Bool(true)));
}

#[cfg(feature = "nodes_fs")]
#[tokio::test]
async fn test_file_write_then_read_back() {
    let dir = std::env::temp_dir().join(format!("wireflow-test-{}", ElementId::new()));
    let file_path = dir.join("out.txt");
    let file_path_str = file_path.to_string_lossy().to_string();

    let flows_json = json!([
        { "id": "100", "type": "tab", "label": "Flow 1" },
        { "id": "1", "type": "file", "z": "100",
            "filename": file_path_str, "filenameType": "str",
            "overwriteFile": "true", "createDir": true, "appendNewline": "false",
            "wires": [ [ "2" ] ] },
        { "id": "2", "type": "file in", "z": "100",
            "filename": file_path_str, "filenameType": "str", "format": "utf8",
            "wires": [ [ "9" ] ] },
        { "id": "9", "z": "100", "type": "test-once" }
    ]);
    let engine = build_test_engine(flows_json).unwrap();
    let to_inject = vec![(eid("1"), Msg::with_payload(Variant::from("persisted")))];
    let msgs = engine.run_once_with_inject(1, Duration::from_secs(1), to_inject).await.unwrap();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].get("payload").unwrap(), &Variant::from("persisted"));

    let _ = std::fs::remove_dir_all(&dir);
}
