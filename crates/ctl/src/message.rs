//! Wire envelope
//!
//! Every control-plane frame is one `Message`, sent as a single
//! line-delimited JSON object `{MsgID, MsgType, Data}`. `MsgID` pairs a
//! command with its result and is zero exactly for broadcasts; `Data`
//! carries the type-specific payload as embedded JSON.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use frontrank_core::State;

use crate::cmd::{CmdResult, Command};
use crate::error::{Error, Result};

/// Message type tag, `u8` on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MsgType {
    #[default]
    Unknown,
    Command,
    Result,
    BroadCast,
}

impl MsgType {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Command,
            2 => Self::Result,
            3 => Self::BroadCast,
            _ => Self::Unknown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Command => 1,
            Self::Result => 2,
            Self::BroadCast => 3,
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "Unknown",
            Self::Command => "Command",
            Self::Result => "Result",
            Self::BroadCast => "BroadCast",
        };
        f.write_str(name)
    }
}

impl Serialize for MsgType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for MsgType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(Self::from_u8(u8::deserialize(deserializer)?))
    }
}

/// One control-plane frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Session-monotonic pairing id; zero iff broadcast.
    #[serde(rename = "MsgID")]
    pub msg_id: u64,
    #[serde(rename = "MsgType")]
    pub msg_type: MsgType,
    #[serde(rename = "Data", default)]
    pub data: Value,
}

impl Message {
    pub fn command(msg_id: u64, cmd: &Command) -> Result<Self> {
        Ok(Self {
            msg_id,
            msg_type: MsgType::Command,
            data: serde_json::to_value(cmd)?,
        })
    }

    pub fn result(msg_id: u64, result: &CmdResult) -> Result<Self> {
        Ok(Self {
            msg_id,
            msg_type: MsgType::Result,
            data: serde_json::to_value(result)?,
        })
    }

    pub fn broadcast(state: &State) -> Result<Self> {
        Ok(Self {
            msg_id: 0,
            msg_type: MsgType::BroadCast,
            data: serde_json::to_value(state)?,
        })
    }

    pub fn get_command(&self) -> Result<Command> {
        if self.msg_type != MsgType::Command {
            return Err(Error::InvalidMsgType(format!(
                "not a command msg: {}",
                self.msg_type
            )));
        }

        decode(&self.data)
    }

    pub fn get_result(&self) -> Result<CmdResult> {
        if self.msg_type != MsgType::Result {
            return Err(Error::InvalidMsgType(format!(
                "not a result msg: {}",
                self.msg_type
            )));
        }

        decode(&self.data)
    }

    pub fn get_state(&self) -> Result<State> {
        if self.msg_type != MsgType::BroadCast {
            return Err(Error::InvalidMsgType(format!(
                "not a state msg: {}",
                self.msg_type
            )));
        }

        decode(&self.data)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message{{MsgID:{} MsgType:{} Data:{}}}",
            self.msg_id, self.msg_type, self.data
        )
    }
}

fn decode<T: serde::de::DeserializeOwned>(data: &Value) -> Result<T> {
    serde_json::from_value(data.clone()).map_err(|e| Error::InvalidMsgData(e.to_string()))
}

#[cfg(test)]
#[path = "message_test.rs"]
mod tests;
