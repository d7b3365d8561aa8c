// Copyright 2020 Joyent, Inc.

//! HAPI: the Hatohol Arm Plugin Interface
//!
//! HAPI is a binary RPC protocol spoken between a Hatohol server process
//! (the gate) and an arm plugin, a separate process that collects data
//! from one monitoring system. Each side owns a pair of message queues;
//! `<address>-S` carries packets to the gate and `<address>-C` carries
//! packets to the plugin.
//!
//! Protocol definition
//!
//! Every packet starts with a 10-byte little-endian header:
//!
//! * LENGTH        4-byte unsigned integer, the size of the whole packet
//!                 including this header
//!
//! * CODE          2-byte unsigned integer. Values below 0x8000 are command
//!                 codes; values at or above it are response codes
//!
//! * SEQUENCE_ID   4-byte unsigned integer correlating a response with its
//!                 command. Zero marks a command that expects no response
//!
//! * BODY          Command-specific. A response body starts with the echoed
//!                 2-byte command code
//!
//! Bulk data travels as item tables. An item table is a list of rows
//! (item groups) that share one column type signature, and every cell is
//! a typed item datum:
//!
//! * ItemData      u8 null flag, u16 type, u64 item id, then the value
//!                 (BOOL u8, INT i64, UINT64 u64, DOUBLE 8 bytes,
//!                 STRING u32 length + bytes + NUL)
//!
//! * ItemGroup     u16 flags, u16 item count, u32 length, then the items
//!
//! * ItemTable     u16 flags, u32 group count, u32 length, then the groups
//!
//! A session starts with the initiation handshake: the plugin sends an
//! INITIATION command with a random key and the gate answers with the same
//! key. No other command is accepted before that.

use slog::{o, Drain, Logger};

pub mod arm_info;
pub mod config;
pub mod dispatch;
pub mod endian;
pub mod error;
pub mod gate;
pub mod interface;
pub mod item_codec;
pub mod item_data;
pub mod item_group;
pub mod item_table;
pub mod messages;
pub mod plugin;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod wire;

pub use crate::error::{HapiError, Result};
pub use crate::gate::ArmPluginGate;
pub use crate::interface::{ConnectionState, HapiInterface};
pub use crate::item_data::{ItemData, ItemDataType, ItemValue};
pub use crate::item_group::{ItemGroup, ItemGroupType};
pub use crate::item_table::ItemTable;
pub use crate::plugin::{ArmBackend, ArmPlugin};

/// Returns a clone of `log`, or a logger draining into the `log` crate.
pub(crate) fn logger(log: Option<&Logger>) -> Logger {
    log.cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
}
