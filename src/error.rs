// Copyright 2020 Joyent, Inc.

//! Error type shared by every layer of the crate.

use std::fmt;
use std::io;

use crate::item_group::ItemGroupType;
use crate::protocol;

pub type Result<T> = std::result::Result<T, HapiError>;

#[derive(Debug)]
pub enum HapiError {
    /// A received buffer could not be decoded. The message is rejected.
    BrokenPacket(String),

    /// An ItemData record declared a type tag outside the known set.
    UnknownItemType(u16),

    /// A row did not match the type signature already fixed for its table.
    GroupTypeMismatch {
        expected: ItemGroupType,
        found: ItemGroupType,
    },

    /// An item was added to a group after it was frozen.
    GroupFrozen,

    /// Ordinary traffic was attempted before the initiation handshake.
    NotInitiated,

    /// The peer answered with an explicit error response.
    ErrorResponse { code: u16, command: u16 },

    /// The session to the peer was lost while waiting.
    ConnectionLost(String),

    /// The session was closed locally.
    Closed,

    Io(io::Error),

    Config(String),

    /// A command handler could not complete its work.
    Handler(String),
}

impl HapiError {
    pub fn broken<S: Into<String>>(msg: S) -> HapiError {
        HapiError::BrokenPacket(msg.into())
    }

    /// Returns true for failures caused by a malformed buffer.
    pub fn is_malformed(&self) -> bool {
        match self {
            HapiError::BrokenPacket(_)
            | HapiError::UnknownItemType(_)
            | HapiError::GroupTypeMismatch { .. } => true,
            _ => false,
        }
    }
}

impl fmt::Display for HapiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HapiError::BrokenPacket(msg) => write!(f, "Broken packet: {}", msg),
            HapiError::UnknownItemType(t) => {
                write!(f, "Unknown item data type: {}", t)
            }
            HapiError::GroupTypeMismatch { expected, found } => write!(
                f,
                "Item group type mismatch: expected {}, found {}",
                expected, found
            ),
            HapiError::GroupFrozen => write!(f, "Item group is frozen"),
            HapiError::NotInitiated => {
                write!(f, "Initiation handshake has not completed")
            }
            HapiError::ErrorResponse { code, command } => write!(
                f,
                "Error response {} for command {}",
                protocol::response_code_name(*code),
                protocol::command_code_name(*command)
            ),
            HapiError::ConnectionLost(msg) => {
                write!(f, "Connection lost: {}", msg)
            }
            HapiError::Closed => write!(f, "Session closed"),
            HapiError::Io(e) => write!(f, "I/O error: {}", e),
            HapiError::Config(msg) => write!(f, "Configuration error: {}", msg),
            HapiError::Handler(msg) => write!(f, "Handler failed: {}", msg),
        }
    }
}

impl std::error::Error for HapiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HapiError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for HapiError {
    fn from(e: io::Error) -> Self {
        HapiError::Io(e)
    }
}

impl From<serde_json::Error> for HapiError {
    fn from(e: serde_json::Error) -> Self {
        HapiError::Config(e.to_string())
    }
}
