//! Tests for the wire envelope

use chrono::Utc;

use frontrank_core::{QueryConfig, State};

use super::*;
use crate::cmd::ResultKey;

#[test]
fn test_msg_type_wire_values() {
    for (tag, value) in [
        (MsgType::Unknown, "0"),
        (MsgType::Command, "1"),
        (MsgType::Result, "2"),
        (MsgType::BroadCast, "3"),
    ] {
        assert_eq!(serde_json::to_string(&tag).unwrap(), value);
    }

    let decoded: MsgType = serde_json::from_str("3").unwrap();
    assert_eq!(decoded, MsgType::BroadCast);

    // out-of-range tags degrade to Unknown
    let decoded: MsgType = serde_json::from_str("42").unwrap();
    assert_eq!(decoded, MsgType::Unknown);
}

#[test]
fn test_message_round_trip() {
    let cmd = Command::new("state");
    let msg = Message::command(7, &cmd).unwrap();

    let json = serde_json::to_string(&msg).unwrap();
    assert!(json.contains("\"MsgID\":7"), "{json}");
    assert!(json.contains("\"MsgType\":1"), "{json}");

    let decoded: Message = serde_json::from_str(&json).unwrap();
    assert_eq!(decoded, msg);
    assert_eq!(decoded.get_command().unwrap(), cmd);
}

#[test]
fn test_broadcast_has_zero_id() {
    let state = State::new(Utc::now(), QueryConfig::with_defaults(), Vec::new());
    let msg = Message::broadcast(&state).unwrap();

    assert_eq!(msg.msg_id, 0);
    assert_eq!(msg.msg_type, MsgType::BroadCast);
    assert_eq!(msg.get_state().unwrap(), state);
}

#[test]
fn test_type_tag_enforced() {
    let msg = Message::command(1, &Command::new("info")).unwrap();

    assert!(msg.get_result().is_err());
    assert!(msg.get_state().is_err());
    assert!(msg.get_command().is_ok());
}

#[test]
fn test_result_pairs_with_command_id() {
    let result = CmdResult::ok("state")
        .with_value(ResultKey::Interval, &"1m")
        .unwrap();
    let msg = Message::result(9, &result).unwrap();

    assert_eq!(msg.msg_id, 9);

    let decoded = msg.get_result().unwrap();
    assert_eq!(decoded, result);
}

#[test]
fn test_garbage_data_is_typed_error() {
    let msg = Message {
        msg_id: 3,
        msg_type: MsgType::Command,
        data: serde_json::json!([1, 2, 3]),
    };

    let err = msg.get_command().unwrap_err();
    assert!(matches!(err, Error::InvalidMsgData(_)));
}
