// Copyright 2020 Joyent, Inc.

//! A transport connection driven by one background thread.
//!
//! The thread establishes the connection, then delivers every inbound
//! packet to the handler in arrival order. Handlers run on that thread, so
//! a handler that blocks stalls the whole session.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use parking_lot::Mutex;
use slog::{debug, error, info, o, trace, warn, Logger};

use crate::error::{HapiError, Result};
use crate::transport::{Connection, Role, Transport};

/// Reason given when a packet handler panics. The session ends as if
/// the connection broke.
pub const HANDLER_PANICKED: &str = "handler panicked";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ConnectFailed(String),
    Lost(String),
    /// The session was stopped locally.
    Closed,
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::ConnectFailed(msg) => write!(f, "connect failed: {}", msg),
            SessionEvent::Lost(msg) => write!(f, "connection lost: {}", msg),
            SessionEvent::Closed => write!(f, "closed"),
        }
    }
}

pub trait SessionHandler: Send + Sync {
    fn on_connected(&self);

    fn on_received(&self, packet: Bytes);

    fn on_session_changed(&self, event: SessionEvent);
}

pub struct Session {
    transport: Arc<dyn Transport>,
    address: String,
    role: Role,
    connection: Mutex<Option<Arc<dyn Connection>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    log: Logger,
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>, address: &str, role: Role, log: &Logger) -> Session {
        Session {
            transport,
            address: address.to_string(),
            role,
            connection: Mutex::new(None),
            worker: Mutex::new(None),
            log: log.new(o!("component" => "session")),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Opens a connection and starts the receive thread. A previous run is
    /// stopped first.
    pub fn start(&self, handler: Arc<dyn SessionHandler>) -> Result<()> {
        self.stop();

        let conn = self.transport.open(&self.address, self.role)?;
        *self.connection.lock() = Some(Arc::clone(&conn));

        let log = self.log.clone();
        let name = format!("hapi-{}-{}", self.role.name(), self.address);
        let spawned = thread::Builder::new()
            .name(name)
            .spawn(move || receive_loop(conn, handler, log));
        match spawned {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.close_connection();
                Err(HapiError::Io(e))
            }
        }
    }

    pub fn send(&self, packet: Bytes) -> Result<()> {
        let conn = self.connection.lock().clone();
        match conn {
            Some(conn) => {
                trace!(self.log, "sending packet"; "bytes" => packet.len());
                conn.send(packet)
            }
            None => Err(HapiError::Closed),
        }
    }

    /// Closes the connection and waits for the receive thread, unless
    /// called from that thread.
    pub fn stop(&self) {
        self.close_connection();
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if handle.thread().id() != thread::current().id() {
                if handle.join().is_err() {
                    warn!(self.log, "receive thread panicked");
                }
            }
        }
    }

    fn close_connection(&self) {
        let conn = self.connection.lock().take();
        if let Some(conn) = conn {
            conn.close();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(conn: Arc<dyn Connection>, handler: Arc<dyn SessionHandler>, log: Logger) {
    match conn.establish() {
        Ok(()) => (),
        Err(HapiError::Closed) => {
            handler.on_session_changed(SessionEvent::Closed);
            return;
        }
        Err(e) => {
            warn!(log, "failed to establish connection"; "error" => %e);
            handler.on_session_changed(SessionEvent::ConnectFailed(e.to_string()));
            return;
        }
    }

    info!(log, "connection established");
    handler.on_connected();

    loop {
        match conn.receive() {
            Ok(Some(packet)) => {
                trace!(log, "received packet"; "bytes" => packet.len());
                let delivered =
                    panic::catch_unwind(AssertUnwindSafe(|| handler.on_received(packet)));
                if delivered.is_err() {
                    error!(log, "packet handler panicked");
                    conn.close();
                    handler.on_session_changed(SessionEvent::Lost(HANDLER_PANICKED.to_string()));
                    break;
                }
            }
            Ok(None) => {
                debug!(log, "connection closed");
                handler.on_session_changed(SessionEvent::Closed);
                break;
            }
            Err(e) => {
                warn!(log, "connection lost"; "error" => %e);
                handler.on_session_changed(SessionEvent::Lost(e.to_string()));
                break;
            }
        }
    }
}
