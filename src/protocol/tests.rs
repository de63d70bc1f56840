use super::*;
use crate::shm::SegmentDescriptor;
use serde_json::json;

#[test]
fn test_parameterless_request_serialization() {
    let request = ControlRequest::Ping.to_jsonrpc(JsonRpcId::Number(1)).unwrap();
    let json = serde_json::to_value(JsonRpcMessage::request(request)).unwrap();

    assert_eq!(json["jsonrpc"], "2.0");
    assert_eq!(json["id"], 1);
    assert_eq!(json["method"], "ping");
    assert_eq!(json["params"], json!({}));
}

#[test]
fn test_connect_request_uses_camel_case_params() {
    let request = ControlRequest::Connect {
        capability_id: "loopback".to_string(),
        parameters: json!({"rate": 10}),
        session_id: "abc".to_string(),
    };
    let rpc = request.to_jsonrpc(JsonRpcId::Number(7)).unwrap();

    assert_eq!(rpc.method, "connect");
    assert_eq!(
        rpc.params,
        Some(json!({"capabilityId": "loopback", "parameters": {"rate": 10}, "sessionId": "abc"}))
    );
    assert_eq!(ControlRequest::from_jsonrpc(&rpc).unwrap(), request);
}

#[test]
fn test_every_method_name_matches_wire_name() {
    let descriptor = SegmentDescriptor {
        mapping_name: "/tmp/seg".to_string(),
        capacity: 4096,
        offset: 0,
        size: 4224,
    };
    let requests = vec![
        ControlRequest::Ping,
        ControlRequest::GetCapabilities,
        ControlRequest::Disconnect {
            session_id: "s".to_string(),
            reason: Some("done".to_string()),
        },
        ControlRequest::GetUiState {
            capability_id: "c".to_string(),
            session_id: None,
            view_id: Some("main".to_string()),
        },
        ControlRequest::ApplySharedMemorySegment {
            session_id: "s".to_string(),
            descriptor,
        },
        ControlRequest::SetBackpressure {
            session_id: "s".to_string(),
            level: BackpressureLevel::High,
        },
        ControlRequest::Notify {
            notification: HostNotification::LocaleChanged {
                locale: "de-DE".to_string(),
            },
        },
        ControlRequest::Shutdown,
    ];

    for request in requests {
        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(wire["method"], request.method_name());

        let rpc = request.to_jsonrpc(JsonRpcId::Number(1)).unwrap();
        let line = JsonRpcMessage::request(rpc).to_line().unwrap();
        let parsed: JsonRpcMessage = serde_json::from_slice(&line).unwrap();
        let JsonRpcMessage::V2(JsonRpcV2Message::Request(parsed)) = parsed else {
            panic!("Expected request message");
        };
        assert_eq!(ControlRequest::from_jsonrpc(&parsed).unwrap(), request);
    }
}

#[test]
fn test_unknown_method_is_rejected() {
    let rpc = JsonRpcRequest {
        id: JsonRpcId::Number(1),
        method: "reboot".to_string(),
        params: None,
    };
    assert!(ControlRequest::from_jsonrpc(&rpc).is_err());
}

#[test]
fn test_backpressure_level_wire_names() {
    let params = ControlRequest::SetBackpressure {
        session_id: "s".to_string(),
        level: BackpressureLevel::Medium,
    }
    .to_jsonrpc(JsonRpcId::Number(3))
    .unwrap()
    .params
    .unwrap();
    assert_eq!(params, json!({"sessionId": "s", "level": "medium"}));
}

#[test]
fn test_response_deserialization() {
    let response: JsonRpcMessage = serde_json::from_value(json!({
        "jsonrpc": "2.0",
        "id": 4,
        "result": {"accepted": true, "grantedBytes": 2048}
    }))
    .unwrap();

    let JsonRpcMessage::V2(JsonRpcV2Message::Response(resp)) = response else {
        panic!("Expected response message");
    };
    assert_eq!(resp.id, JsonRpcId::Number(4));
    let result: ApplySegmentResult = serde_json::from_value(resp.result.unwrap()).unwrap();
    assert!(result.accepted);
    assert_eq!(result.granted_bytes, Some(2048));
}

#[test]
fn test_error_response_deserialization() {
    let response: JsonRpcMessage = serde_json::from_value(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "error": {"code": -32601, "message": "Method not found"}
    }))
    .unwrap();

    let JsonRpcMessage::V2(JsonRpcV2Message::Response(resp)) = response else {
        panic!("Expected response message");
    };
    assert!(resp.result.is_none());
    let error = resp.error.unwrap();
    assert_eq!(error.code, error_codes::METHOD_NOT_FOUND);
    assert_eq!(error.message, "Method not found");
}

#[test]
fn test_host_event_wire_format() {
    let event: HostEvent = serde_json::from_value(json!({
        "event": "session-registered",
        "token": "t",
        "processId": 42,
        "sessionId": "s"
    }))
    .unwrap();
    assert_eq!(
        event,
        HostEvent::SessionRegistered {
            token: "t".to_string(),
            process_id: 42,
            session_id: "s".to_string(),
        }
    );

    let invalidated = HostEvent::UiStateInvalidated {
        capability_id: "c".to_string(),
        session_id: None,
        view_id: None,
        reason: Some("changed".to_string()),
    };
    assert_eq!(
        serde_json::to_value(&invalidated).unwrap(),
        json!({"event": "ui-state-invalidated", "capabilityId": "c", "reason": "changed"})
    );
    assert_eq!(invalidated.name(), "ui-state-invalidated");
}

#[test]
fn test_notification_wire_format() {
    let custom = HostNotification::Custom {
        name: "theme".to_string(),
        payload: json!({"dark": true}),
    };
    assert_eq!(
        serde_json::to_value(&custom).unwrap(),
        json!({"kind": "custom", "name": "theme", "payload": {"dark": true}})
    );

    let settings: HostNotification =
        serde_json::from_value(json!({"kind": "settings-changed"})).unwrap();
    assert_eq!(settings, HostNotification::SettingsChanged { plugin_id: None });
}

#[test]
fn test_capability_descriptor_defaults() {
    let capability: CapabilityDescriptor = serde_json::from_value(json!({
        "id": "loopback",
        "displayName": "Loopback",
        "sharedMemory": {"minBytes": 4096}
    }))
    .unwrap();

    assert!(!capability.supports_multiple_sessions);
    assert_eq!(capability.data_format(), "binary");
    let shm = capability.shared_memory.unwrap();
    assert_eq!(shm.requested_bytes(None), 4096);
    assert_eq!(shm.requested_bytes(Some(8192)), 8192);
    // Hints below the minimum are raised to it.
    assert_eq!(shm.requested_bytes(Some(1024)), 4096);
    assert_eq!(shm.requested_bytes(Some(0)), 4096);

    let preferred = SharedMemoryRequirement {
        min_bytes: 4096,
        preferred_bytes: Some(65536),
    };
    assert_eq!(preferred.requested_bytes(None), 65536);
}

#[test]
fn test_parameter_validation() {
    let schema = json!({
        "type": "object",
        "required": ["port"],
        "properties": {
            "port": {"type": "integer"},
            "label": {"type": "string"}
        }
    });

    assert!(validate_parameters(&schema, &json!({"port": 8080})).is_ok());
    assert!(validate_parameters(&schema, &json!({"port": 1, "extra": [1]})).is_ok());

    let missing = validate_parameters(&schema, &json!({"label": "x"})).unwrap_err();
    assert!(missing.contains("port"));
    assert!(validate_parameters(&schema, &json!({"port": "80"})).is_err());
    assert!(validate_parameters(&schema, &json!({"port": 1.5})).is_err());
    assert!(validate_parameters(&schema, &json!([1, 2])).is_err());

    assert!(validate_parameters(&json!(null), &json!("anything")).is_ok());
    assert!(validate_parameters(&json!({}), &json!(null)).is_ok());
}
