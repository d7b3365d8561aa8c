// Copyright 2020 Joyent, Inc.

//! Message-oriented transports.
//!
//! A transport delivers whole packets between the gate and a plugin. Each
//! side reads from its own queue and writes to the peer's:
//! `<address>-S` carries traffic to the gate and `<address>-C` traffic to
//! the plugin.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;

pub mod memory;
pub mod tcp;

pub use self::memory::MemoryBus;
pub use self::tcp::TcpTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Gate,
    Plugin,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Gate => Role::Plugin,
            Role::Plugin => Role::Gate,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Role::Gate => "gate",
            Role::Plugin => "plugin",
        }
    }

    /// Queue this role receives from.
    pub fn inbox(self, address: &str) -> String {
        match self {
            Role::Gate => format!("{}-S", address),
            Role::Plugin => format!("{}-C", address),
        }
    }

    /// Queue this role sends to.
    pub fn outbox(self, address: &str) -> String {
        self.peer().inbox(address)
    }
}

pub trait Connection: Send + Sync {
    /// Blocks until the link is usable. Returns [`HapiError::Closed`]
    /// if [`close`](#tymethod.close) is called meanwhile.
    ///
    /// [`HapiError::Closed`]: ../enum.HapiError.html#variant.Closed
    fn establish(&self) -> Result<()>;

    fn send(&self, packet: Bytes) -> Result<()>;

    /// Blocks for the next packet. `Ok(None)` means the connection was
    /// closed locally; a lost link is an error.
    fn receive(&self) -> Result<Option<Bytes>>;

    /// Closes the connection and wakes a blocked `establish` or `receive`.
    fn close(&self);
}

pub trait Transport: Send + Sync {
    fn open(&self, address: &str, role: Role) -> Result<Arc<dyn Connection>>;
}
