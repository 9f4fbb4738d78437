use serde_json::json;

use super::*;

#[test]
fn command_builder_collects_params() {
    let cmd = Command::new("call_service").with_param("domain", "light").with_param("brightness", 80);
    assert_eq!(cmd.op, "call_service");
    assert_eq!(cmd.params.get("domain"), Some(&json!("light")));
    assert_eq!(cmd.params.get("brightness"), Some(&json!(80)));
}

#[test]
fn command_deserializes_without_params() {
    let cmd: Command = serde_json::from_value(json!({ "op": "get_states" })).expect("command");
    assert_eq!(cmd, Command::new("get_states"));
}

#[test]
fn auth_rejection_codes_are_recognized() {
    for code in ["unauthorized", "invalid_auth", "auth_invalid", "401", "403"] {
        assert!(RemoteError::new(code, "nope").is_auth_rejection(), "{code} should be an auth rejection");
    }
    assert!(!RemoteError::new("not_found", "missing").is_auth_rejection());
    assert!(!RemoteError::new("500", "boom").is_auth_rejection());
}

#[test]
fn partial_payload_is_an_object() {
    let mut fields = Map::new();
    fields.insert("state".into(), json!("on"));
    let event = Event { topic: "light.kitchen".into(), event_type: "state_changed".into(), value: EventValue::Partial(fields) };
    assert_eq!(event.payload(), json!({ "state": "on" }));
}

#[test]
fn full_payload_is_the_value() {
    let event = Event::full("light.kitchen", "state_changed", json!("on"));
    assert_eq!(event.payload(), json!("on"));
    assert_eq!(Inbound::Event(event).kind(), "event");
}
