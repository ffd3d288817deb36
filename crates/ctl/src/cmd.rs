//! Commands and results
//!
//! A `Command` is a name plus string kwargs; a `CmdResult` answers it with
//! a return code, a human message and typed values under the closed
//! [`ResultKey`] set. Values stay raw JSON until a consumer decodes the key
//! it cares about.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// A control-plane command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "KwArgs", default)]
    pub kw_args: HashMap<String, String>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kw_args: HashMap::new(),
        }
    }

    pub fn arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.kw_args.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command{{Name:{} KwArgs:{:?}}}", self.name, self.kw_args)
    }
}

/// Reserved value keys of a result.
///
/// The wire names are a stable contract between server and clients; adding
/// a key is a coordinated change on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultKey {
    Interval,
    Origin,
    State,
    Config,
    Plugins,
    Handlers,
}

/// Answer to one command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CmdResult {
    #[serde(rename = "Rtn")]
    pub rtn: i32,
    #[serde(rename = "Message", default)]
    pub message: String,
    #[serde(rename = "CmdName", default)]
    pub cmd_name: String,
    #[serde(rename = "Values", default)]
    pub values: HashMap<ResultKey, Value>,
}

impl CmdResult {
    pub fn ok(cmd_name: impl Into<String>) -> Self {
        Self {
            cmd_name: cmd_name.into(),
            ..Default::default()
        }
    }

    pub fn fail(cmd_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rtn: 1,
            message: message.into(),
            cmd_name: cmd_name.into(),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_value<T: Serialize>(mut self, key: ResultKey, value: &T) -> Result<Self> {
        self.values.insert(key, serde_json::to_value(value)?);
        Ok(self)
    }

    pub fn is_ok(&self) -> bool {
        self.rtn == 0
    }

    /// Decode one value key on demand.
    pub fn decode<T: serde::de::DeserializeOwned>(&self, key: ResultKey) -> Result<Option<T>> {
        match self.values.get(&key) {
            Some(raw) => Ok(Some(serde_json::from_value(raw.clone())?)),
            None => Ok(None),
        }
    }
}

impl fmt::Display for CmdResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Result{{Rtn:{} CmdName:{} Message:{} Values:{:?}}}",
            self.rtn,
            self.cmd_name,
            self.message,
            self.values.keys().collect::<Vec<_>>(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_round_trip() {
        let cmd = Command::new("period").arg("interval", "200ms");

        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"Name\""), "{json}");
        assert!(json.contains("\"KwArgs\""), "{json}");

        let decoded: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn test_result_key_wire_names() {
        for (key, name) in [
            (ResultKey::Interval, "Interval"),
            (ResultKey::Origin, "Origin"),
            (ResultKey::State, "State"),
            (ResultKey::Config, "Config"),
            (ResultKey::Plugins, "Plugins"),
            (ResultKey::Handlers, "Handlers"),
        ] {
            let json = serde_json::to_string(&key).unwrap();
            assert_eq!(json, format!("\"{name}\""));
        }
    }

    #[test]
    fn test_result_values_decode_on_demand() {
        let result = CmdResult::ok("period")
            .with_value(ResultKey::Origin, &"1m")
            .unwrap()
            .with_value(ResultKey::Interval, &"200ms")
            .unwrap();

        let json = serde_json::to_string(&result).unwrap();
        let decoded: CmdResult = serde_json::from_str(&json).unwrap();

        let origin: Option<String> = decoded.decode(ResultKey::Origin).unwrap();
        assert_eq!(origin.as_deref(), Some("1m"));

        let absent: Option<String> = decoded.decode(ResultKey::State).unwrap();
        assert!(absent.is_none());
    }

    #[test]
    fn test_result_decode_wrong_type_fails() {
        let result = CmdResult::ok("info")
            .with_value(ResultKey::Interval, &"not a number")
            .unwrap();

        let decoded: crate::error::Result<Option<u64>> = result.decode(ResultKey::Interval);
        assert!(decoded.is_err());
    }

    #[test]
    fn test_fail_sets_rtn() {
        let result = CmdResult::fail("bogus", "unsupported command");
        assert_eq!(result.rtn, 1);
        assert!(!result.is_ok());
        assert_eq!(result.message, "unsupported command");
    }
}
