//! Integration tests for the wire formats.
//!
//! These decode frames written the way the service writes them, rather than
//! frames produced by this crate, to pin the field names and shapes.

use tidewire_protocol::{
    codes, Action, Data, Flags, Format, PresenceAction, ProtocolMessage,
};

#[test]
fn test_inbound_message_frame_decodes_from_json() {
    let json = br#"{
        "action": 15,
        "channel": "prices",
        "channelSerial": "a:1",
        "connectionSerial": 12,
        "id": "conn-1:12",
        "timestamp": 1700000000000,
        "messages": [
            {"id": "conn-1:12:0", "name": "tick", "data": "eyJwIjoxfQ==",
             "encoding": "json/base64", "extras": {"delta": {"from": "conn-1:11:0", "format": "vcdiff"}}}
        ]
    }"#;
    let frame: ProtocolMessage = Format::Json.deserialize(json).unwrap();
    assert_eq!(frame.action, Action::Message);
    assert_eq!(frame.connection_serial, Some(12));
    let msg = &frame.messages[0];
    assert_eq!(msg.encoding.as_deref(), Some("json/base64"));
    assert_eq!(msg.delta_from(), Some("conn-1:11:0"));
    assert_eq!(msg.data, Some(Data::String("eyJwIjoxfQ==".into())));
}

#[test]
fn test_attached_frame_flags_decode() {
    let json = br#"{"action": 11, "channel": "c", "flags": 5}"#;
    let frame: ProtocolMessage = Format::Json.deserialize(json).unwrap();
    assert!(frame.has_flag(Flags::HAS_PRESENCE));
    assert!(frame.has_flag(Flags::RESUMED));
    assert!(!frame.has_flag(Flags::HAS_BACKLOG));
}

#[test]
fn test_nack_frame_carries_range_and_error() {
    let json = br#"{"action": 2, "msgSerial": 3, "count": 2,
                    "error": {"message": "rejected", "code": 40160, "statusCode": 401}}"#;
    let frame: ProtocolMessage = Format::Json.deserialize(json).unwrap();
    assert_eq!(frame.serial_range(), Some((3, 4)));
    assert!(frame.error.unwrap().is_token_error());
}

#[test]
fn test_presence_frame_round_trips_through_msgpack() {
    let json = br#"{"action": 14, "channel": "lobby",
                    "presence": [{"action": 2, "clientId": "bob", "data": "hi"}]}"#;
    let frame: ProtocolMessage = Format::Json.deserialize(json).unwrap();
    assert_eq!(frame.presence[0].action, PresenceAction::Enter);

    let packed = Format::MsgPack.serialize(&frame).unwrap();
    let back: ProtocolMessage = Format::MsgPack.deserialize(&packed).unwrap();
    assert_eq!(back, frame);
}

#[test]
fn test_disconnected_frame_with_connection_error() {
    let json = br#"{"action": 6, "error": {"message": "bye", "code": 80003}}"#;
    let frame: ProtocolMessage = Format::Json.deserialize(json).unwrap();
    let err = frame.error.unwrap();
    assert_eq!(err.code, codes::DISCONNECTED);
    assert!(err.is_retriable());
}
