//! Integration tests for linebridge-common library.

use linebridge_common::{
    CommandRequest, CommandResponse, DesiredProperties, ErrorEvent, Format, KeyExprBuilder,
    TelemetryEvent, decode, decode_auto, encode, parse_config,
};

fn telemetry() -> TelemetryEvent {
    TelemetryEvent {
        device_name: "Device 1".to_string(),
        production_status: "1".to_string(),
        workorder_id: "3f2a-77".to_string(),
        good_count: 1_204,
        bad_count: 17,
        temperature: 74.25,
        timestamp: 1_700_000_000_000,
    }
}

#[test]
fn test_telemetry_workflow() {
    let event = telemetry();
    let keys = KeyExprBuilder::default();

    // Key for the event
    let key = keys.telemetry_key(&event.device_name);
    assert_eq!(key, "linebridge/opcua/Device_1/telemetry");

    // JSON on the wire
    let json_bytes = encode(&event, Format::Json).expect("JSON encode failed");
    let decoded: TelemetryEvent = decode(&json_bytes, Format::Json).expect("JSON decode failed");
    assert_eq!(decoded, event);

    // CBOR is smaller and still auto-detected
    let cbor_bytes = encode(&event, Format::Cbor).expect("CBOR encode failed");
    assert!(
        cbor_bytes.len() < json_bytes.len(),
        "CBOR should be smaller than JSON"
    );
    let auto_decoded: TelemetryEvent = decode_auto(&cbor_bytes).expect("Auto decode failed");
    assert_eq!(auto_decoded, event);
}

#[test]
fn test_error_events_for_every_bit() {
    for bit in 0..32u8 {
        let event = ErrorEvent::rising("Device 3", bit);
        assert_eq!(event.error_code, 1u32 << bit);

        let bytes = encode(&event, Format::Json).unwrap();
        let decoded: ErrorEvent = decode_auto(&bytes).unwrap();
        assert_eq!(decoded.error_bit, bit);
        assert_eq!(decoded.error_code, event.error_code);
    }
}

#[test]
fn test_command_request_from_cloud_payload() {
    let request: CommandRequest =
        decode_auto(br#"  {"device": "Device 2", "command": "ResetErrorStatus"}"#).unwrap();
    assert_eq!(request.device, "Device 2");
    assert_eq!(request.command, "ResetErrorStatus");

    // Missing fields decode as empty so the dispatcher can answer 400
    let partial: CommandRequest = decode_auto(br#"{"device": "Device 2"}"#).unwrap();
    assert!(partial.command.is_empty());
}

#[test]
fn test_command_response_shape() {
    let response = CommandResponse::new(404, "Unknown command 'Jump'");
    let json: serde_json::Value =
        serde_json::from_slice(&encode(&response, Format::Json).unwrap()).unwrap();

    assert_eq!(json["status"], 404);
    assert_eq!(json["message"], "Unknown command 'Jump'");
    assert!(!response.is_success());
}

#[test]
fn test_desired_properties_routing() {
    let keys = KeyExprBuilder::new("plant/line3");
    let key = keys.desired_key("Device 4");
    assert_eq!(keys.parse_desired_key(&key), Some("Device_4"));

    let desired: DesiredProperties = decode_auto(br#"{"productionRate": 60}"#).unwrap();
    assert_eq!(desired.production_rate, 60);
    assert_eq!(desired.device, None);
}

#[test]
fn test_config_parse_helper() {
    #[derive(serde::Deserialize)]
    struct Sample {
        zenoh: linebridge_common::ZenohConfig,
    }

    let sample: Sample = parse_config(r#"{ zenoh: { mode: "client", connect: ["tcp/127.0.0.1:7447"] } }"#)
        .expect("parse failed");
    assert_eq!(sample.zenoh.mode, "client");
    assert_eq!(sample.zenoh.connect.len(), 1);
    assert!(sample.zenoh.validate().is_ok());
}
