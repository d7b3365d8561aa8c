// Copyright 2020 Joyent, Inc.

//! The HAPI protocol state machine shared by plugins and gates.
//!
//! Connection lifecycle:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Initiated -> (Terminating) -> Disconnected
//! ```
//!
//! Once the transport connects, the plugin sends an INITIATION command
//! carrying a random key and the gate echoes it back. Both sides are
//! initiated from then on; before that only the initiation exchange may
//! be sent and any other command is refused with NOT_INITIATED.
//!
//! Requests are correlated with replies by sequence id. Every outstanding
//! request owns its own completion in a map keyed by sequence id, so any
//! number of threads may wait on calls at the same time and replies may
//! arrive in any order. There is no timeout here; a waiting call ends when
//! its reply arrives or when the session goes away.
//!
//! Handlers and completions run on the session's receive thread. They
//! must not make blocking calls on the same interface.

use std::cell::Cell;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures::channel::oneshot;
use futures::executor::block_on;
use parking_lot::{Condvar, Mutex, MutexGuard};
use slog::{debug, info, o, trace, warn, Logger};

use crate::dispatch::CommandDispatchTable;
use crate::error::{HapiError, Result};
use crate::item_codec::{encode_item_table, table_from_bytes};
use crate::item_table::{ItemTable, ItemTablePtr};
use crate::messages::{InitiationBody, WireBody};
use crate::protocol::{
    self, encode_command, encode_response, HapiCommandCode, HapiMessage, HapiResponse,
    HapiResponseCode, FIRE_AND_FORGET_SEQUENCE_ID,
};
use crate::session::{Session, SessionEvent, SessionHandler};
use crate::transport::{Role, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Initiated,
    Terminating,
}

/// Lifecycle notifications. They run on the receive thread.
pub trait InterfaceHooks: Send + Sync {
    fn on_connected(&self) {}

    fn on_initiated(&self) {}

    fn on_disconnected(&self, _event: &SessionEvent) {}
}

pub struct NoHooks;

impl InterfaceHooks for NoHooks {}

/// Sequence ids run from 1 to `u32::MAX` and wrap back to 1. Zero is kept
/// for commands that expect no reply.
#[derive(Debug, Default)]
pub struct SequenceId(u32);

impl SequenceId {
    pub fn new() -> SequenceId {
        SequenceId(FIRE_AND_FORGET_SEQUENCE_ID)
    }

    /// The next call to `next` returns `last + 1`, wrapping as usual.
    pub fn after(last: u32) -> SequenceId {
        SequenceId(last)
    }
}

impl Iterator for SequenceId {
    type Item = u32;

    fn next(&mut self) -> Option<Self::Item> {
        self.0 = if self.0 == u32::max_value() {
            1
        } else {
            self.0 + 1
        };
        Some(self.0)
    }
}

type Completion = Box<dyn FnOnce(Result<Bytes>) + Send + Sync>;

struct PendingCall {
    command: u16,
    completion: Completion,
}

/// What a command handler gets to look at and reply through.
pub struct CommandContext<'a> {
    interface: &'a HapiInterface,
    message: &'a HapiMessage,
    replied: Cell<bool>,
}

impl<'a> CommandContext<'a> {
    fn new(interface: &'a HapiInterface, message: &'a HapiMessage) -> CommandContext<'a> {
        CommandContext {
            interface,
            message,
            replied: Cell::new(false),
        }
    }

    pub fn interface(&self) -> &HapiInterface {
        self.interface
    }

    pub fn code(&self) -> u16 {
        self.message.code()
    }

    pub fn sequence_id(&self) -> u32 {
        self.message.sequence_id()
    }

    pub fn body(&self) -> &[u8] {
        &self.message.body
    }

    pub fn decode_body<B: WireBody>(&self) -> Result<B> {
        B::decode(&self.message.body)
    }

    pub fn replied(&self) -> bool {
        self.replied.get()
    }

    pub fn reply(&self, body: &[u8]) -> Result<()> {
        self.respond(HapiResponseCode::Ok, body)
    }

    pub fn reply_ok(&self) -> Result<()> {
        self.reply(&[])
    }

    pub fn reply_body<B: WireBody>(&self, body: &B) -> Result<()> {
        self.reply(&body.encode()?)
    }

    pub fn reply_table(&self, table: &ItemTable) -> Result<()> {
        let mut buf = BytesMut::new();
        encode_item_table(table, &mut buf)?;
        self.reply(&buf)
    }

    pub fn reply_error(&self, code: HapiResponseCode) -> Result<()> {
        self.respond(code, &[])
    }

    fn respond(&self, code: HapiResponseCode, body: &[u8]) -> Result<()> {
        self.replied.set(true);
        self.interface
            .send_response(code, self.code(), self.sequence_id(), body)
    }
}

struct InterfaceCore {
    role: Role,
    session: Session,
    dispatch: CommandDispatchTable,
    hooks: Arc<dyn InterfaceHooks>,
    state: Mutex<ConnectionState>,
    state_changed: Condvar,
    sequence: Mutex<SequenceId>,
    pending: DashMap<u32, PendingCall>,
    log: Logger,
}

/// Handle to one protocol endpoint. Clones share the same endpoint.
#[derive(Clone)]
pub struct HapiInterface {
    core: Arc<InterfaceCore>,
}

struct SessionAdapter {
    core: Weak<InterfaceCore>,
}

impl SessionAdapter {
    fn interface(&self) -> Option<HapiInterface> {
        self.core.upgrade().map(|core| HapiInterface { core })
    }
}

impl SessionHandler for SessionAdapter {
    fn on_connected(&self) {
        if let Some(iface) = self.interface() {
            iface.handle_connected();
        }
    }

    fn on_received(&self, packet: Bytes) {
        if let Some(iface) = self.interface() {
            iface.handle_packet(packet);
        }
    }

    fn on_session_changed(&self, event: SessionEvent) {
        if let Some(iface) = self.interface() {
            iface.handle_session_changed(event);
        }
    }
}

impl HapiInterface {
    pub fn new(
        role: Role,
        address: &str,
        transport: Arc<dyn Transport>,
        dispatch: CommandDispatchTable,
        hooks: Arc<dyn InterfaceHooks>,
        log: Option<&Logger>,
    ) -> HapiInterface {
        let log = crate::logger(log).new(o!("role" => role.name(), "address" => address.to_string()));
        HapiInterface {
            core: Arc::new(InterfaceCore {
                role,
                session: Session::new(transport, address, role, &log),
                dispatch,
                hooks,
                state: Mutex::new(ConnectionState::Disconnected),
                state_changed: Condvar::new(),
                sequence: Mutex::new(SequenceId::new()),
                pending: DashMap::new(),
                log,
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.core.role
    }

    pub fn address(&self) -> &str {
        self.core.session.address()
    }

    pub fn log(&self) -> &Logger {
        &self.core.log
    }

    pub fn state(&self) -> ConnectionState {
        *self.lock_state()
    }

    pub fn is_initiated(&self) -> bool {
        self.state() == ConnectionState::Initiated
    }

    /// Connects in the background. Progress is reported through the hooks
    /// and [`state`](#method.state).
    pub fn start(&self) -> Result<()> {
        info!(self.core.log, "starting");
        // a previous run reports its own close before the new one begins
        self.core.session.stop();
        self.set_state(ConnectionState::Connecting);
        let adapter = Arc::new(SessionAdapter {
            core: Arc::downgrade(&self.core),
        });
        if let Err(e) = self.core.session.start(adapter) {
            self.set_state(ConnectionState::Disconnected);
            return Err(e);
        }
        Ok(())
    }

    /// Closes the session and fails every outstanding call.
    pub fn stop(&self) {
        info!(self.core.log, "stopping");
        self.core.session.stop();
        self.set_state(ConnectionState::Disconnected);
        self.fail_pending(|| HapiError::Closed);
    }

    /// Waits until the handshake completes. Returns false on timeout.
    pub fn wait_initiated(&self, timeout: Duration) -> bool {
        let mut guard = self.lock_state();
        self.core.state_changed.wait_while_for(
            &mut guard,
            |state| *state != ConnectionState::Initiated,
            timeout,
        );
        *guard == ConnectionState::Initiated
    }

    /// Sends a command and calls `on_reply` from the receive thread with
    /// the reply body, or with the error response or session failure.
    pub fn start_call<F>(&self, code: u16, body: &[u8], on_reply: F) -> Result<u32>
    where
        F: FnOnce(Result<Bytes>) + Send + Sync + 'static,
    {
        self.ensure_initiated()?;
        self.send_request(code, body, Box::new(on_reply), ConnectionState::Initiated)
    }

    /// Sends a command and blocks until its reply arrives.
    pub fn call(&self, code: u16, body: &[u8]) -> Result<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.start_call(code, body, move |res| {
            let _ = tx.send(res);
        })?;
        block_on(rx).unwrap_or(Err(HapiError::Closed))
    }

    pub fn call_body<B: WireBody>(&self, code: u16, body: &[u8]) -> Result<B> {
        B::decode(&self.call(code, body)?)
    }

    pub fn call_table(&self, code: u16, body: &[u8]) -> Result<ItemTablePtr> {
        table_from_bytes(&self.call(code, body)?)
    }

    /// Sends a command with sequence id 0. No reply is expected.
    pub fn send_oneway(&self, code: u16, body: &[u8]) -> Result<()> {
        self.ensure_initiated()?;
        let packet = encode_command(code, FIRE_AND_FORGET_SEQUENCE_ID, body)?;
        debug!(self.core.log, "sending one-way command";
               "code" => protocol::command_code_name(code));
        self.core.session.send(packet)
    }

    fn send_response(
        &self,
        code: HapiResponseCode,
        command: u16,
        sequence_id: u32,
        body: &[u8],
    ) -> Result<()> {
        if sequence_id == FIRE_AND_FORGET_SEQUENCE_ID {
            trace!(self.core.log, "not answering one-way command";
                   "code" => protocol::command_code_name(command));
            return Ok(());
        }
        let packet = encode_response(code, command, sequence_id, body)?;
        trace!(self.core.log, "sending response";
               "code" => protocol::response_code_name(code.code()),
               "sequence_id" => sequence_id);
        self.core.session.send(packet)
    }

    /// Registers the call, then sends it. `expected` is the state the
    /// interface must still be in once the call is registered; a session
    /// that went away in between has already drained the pending calls.
    fn send_request(
        &self,
        code: u16,
        body: &[u8],
        completion: Completion,
        expected: ConnectionState,
    ) -> Result<u32> {
        let sequence_id = self.next_sequence_id();
        let packet = encode_command(code, sequence_id, body)?;

        let previous = self.core.pending.insert(
            sequence_id,
            PendingCall {
                command: code,
                completion,
            },
        );
        if previous.is_some() {
            warn!(self.core.log, "sequence id reused while a call is outstanding";
                  "sequence_id" => sequence_id);
        }

        let state = self.state();
        if state != expected {
            debug!(self.core.log, "state changed before sending";
                   "sequence_id" => sequence_id, "state" => format!("{:?}", state));
            if self.core.pending.remove(&sequence_id).is_some() {
                return Err(HapiError::NotInitiated);
            }
            // already failed by the drain
            return Ok(sequence_id);
        }

        debug!(self.core.log, "sending command";
               "code" => protocol::command_code_name(code),
               "sequence_id" => sequence_id);
        if let Err(e) = self.core.session.send(packet) {
            self.core.pending.remove(&sequence_id);
            return Err(e);
        }
        Ok(sequence_id)
    }

    fn next_sequence_id(&self) -> u32 {
        self.core.sequence.lock().next().unwrap_or(1)
    }

    fn ensure_initiated(&self) -> Result<()> {
        if self.is_initiated() {
            Ok(())
        } else {
            Err(HapiError::NotInitiated)
        }
    }

    fn handle_connected(&self) {
        info!(self.core.log, "connected");
        self.set_state(ConnectionState::Connected);
        self.core.hooks.on_connected();
        if self.core.role == Role::Plugin {
            self.send_initiation();
        }
    }

    fn send_initiation(&self) {
        let key: u64 = rand::random();
        let body = match (InitiationBody { key }).encode() {
            Ok(body) => body,
            Err(e) => {
                warn!(self.core.log, "failed to build initiation"; "error" => %e);
                return;
            }
        };
        let core = Arc::downgrade(&self.core);
        let completion = Box::new(move |res: Result<Bytes>| {
            if let Some(core) = core.upgrade() {
                HapiInterface { core }.finish_initiation(key, res);
            }
        });
        let sent = self.send_request(
            HapiCommandCode::Initiation.code(),
            &body,
            completion,
            ConnectionState::Connected,
        );
        if let Err(e) = sent {
            warn!(self.core.log, "failed to send initiation"; "error" => %e);
        }
    }

    fn finish_initiation(&self, key: u64, res: Result<Bytes>) {
        let echoed = res.and_then(|body| InitiationBody::decode(&body));
        match echoed {
            Ok(InitiationBody { key: k }) if k == key => {
                info!(self.core.log, "initiated");
                self.set_state(ConnectionState::Initiated);
                self.core.hooks.on_initiated();
            }
            Ok(_) => warn!(self.core.log, "initiation reply carries a different key"),
            Err(e) => warn!(self.core.log, "initiation failed"; "error" => %e),
        }
    }

    fn handle_session_changed(&self, event: SessionEvent) {
        info!(self.core.log, "session changed"; "event" => %event);
        self.set_state(ConnectionState::Disconnected);
        match &event {
            SessionEvent::Closed => self.fail_pending(|| HapiError::Closed),
            SessionEvent::Lost(msg) | SessionEvent::ConnectFailed(msg) => {
                self.fail_pending(|| HapiError::ConnectionLost(msg.clone()))
            }
        }
        self.core.hooks.on_disconnected(&event);
    }

    fn handle_packet(&self, packet: Bytes) {
        let msg = match HapiMessage::parse(packet) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(self.core.log, "dropping malformed packet"; "error" => %e);
                return;
            }
        };
        if msg.is_response() {
            self.handle_response(msg);
        } else {
            self.handle_command(msg);
        }
    }

    fn handle_response(&self, msg: HapiMessage) {
        let sequence_id = msg.sequence_id();
        let pending = match self.core.pending.remove(&sequence_id) {
            Some((_, p)) => p,
            None => {
                warn!(self.core.log, "dropping reply for unknown sequence id";
                      "sequence_id" => sequence_id,
                      "code" => protocol::response_code_name(msg.code()));
                return;
            }
        };

        let result = HapiResponse::from_message(msg).and_then(|res| {
            if res.command != pending.command {
                return Err(HapiError::broken(format!(
                    "reply echoes command {} but {} was sent",
                    protocol::command_code_name(res.command),
                    protocol::command_code_name(pending.command)
                )));
            }
            res.into_result()
        });
        if let Err(e) = &result {
            debug!(self.core.log, "call failed";
                   "sequence_id" => sequence_id, "error" => %e);
        }
        (pending.completion)(result);
    }

    fn handle_command(&self, msg: HapiMessage) {
        let code = msg.code();
        let sequence_id = msg.sequence_id();
        debug!(self.core.log, "received command";
               "code" => protocol::command_code_name(code),
               "sequence_id" => sequence_id);

        if code == HapiCommandCode::Initiation.code() {
            self.handle_initiation(&msg);
            return;
        }

        if !self.is_initiated() {
            warn!(self.core.log, "command before initiation";
                  "code" => protocol::command_code_name(code));
            self.reply_error(HapiResponseCode::NotInitiated, code, sequence_id);
            return;
        }

        let handler = match self.core.dispatch.get(code) {
            Some(handler) => handler,
            None => {
                warn!(self.core.log, "unsupported command";
                      "code" => protocol::command_code_name(code),
                      "sequence_id" => sequence_id);
                self.reply_error(HapiResponseCode::UnsupportedCommand, code, sequence_id);
                return;
            }
        };

        if code == HapiCommandCode::ReqTerminate.code() {
            self.set_state(ConnectionState::Terminating);
        }

        let ctx = CommandContext::new(self, &msg);
        if let Err(e) = handler(&ctx) {
            warn!(self.core.log, "command handler failed";
                  "code" => protocol::command_code_name(code),
                  "sequence_id" => sequence_id,
                  "error" => %e);
            if !ctx.replied() {
                let res = if e.is_malformed() {
                    HapiResponseCode::MalformedCommand
                } else {
                    HapiResponseCode::HandlerError
                };
                self.reply_error(res, code, sequence_id);
            }
        }
    }

    fn handle_initiation(&self, msg: &HapiMessage) {
        let code = msg.code();
        if self.core.role != Role::Gate {
            self.reply_error(HapiResponseCode::UnsupportedCommand, code, msg.sequence_id());
            return;
        }
        let body = match InitiationBody::decode(&msg.body) {
            Ok(body) => body,
            Err(e) => {
                warn!(self.core.log, "malformed initiation"; "error" => %e);
                self.reply_error(HapiResponseCode::MalformedCommand, code, msg.sequence_id());
                return;
            }
        };

        self.set_state(ConnectionState::Initiated);
        let reply = body
            .encode()
            .and_then(|b| self.send_response(HapiResponseCode::Ok, code, msg.sequence_id(), &b));
        if let Err(e) = reply {
            warn!(self.core.log, "failed to answer initiation"; "error" => %e);
            return;
        }
        info!(self.core.log, "initiated");
        self.core.hooks.on_initiated();
    }

    fn reply_error(&self, res: HapiResponseCode, command: u16, sequence_id: u32) {
        if let Err(e) = self.send_response(res, command, sequence_id, &[]) {
            warn!(self.core.log, "failed to send error response"; "error" => %e);
        }
    }

    fn fail_pending<F: Fn() -> HapiError>(&self, make_error: F) {
        let ids: Vec<u32> = self.core.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, pending)) = self.core.pending.remove(&id) {
                (pending.completion)(Err(make_error()));
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let mut guard = self.lock_state();
        if *guard != state {
            trace!(self.core.log, "state change";
                   "from" => format!("{:?}", *guard), "to" => format!("{:?}", state));
            *guard = state;
            self.core.state_changed.notify_all();
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.core.state.lock()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::thread;
    use std::time::Instant;

    use crate::transport::MemoryBus;

    fn gate_interface(address: &str) -> HapiInterface {
        HapiInterface::new(
            Role::Gate,
            address,
            Arc::new(MemoryBus::new()),
            CommandDispatchTable::new(),
            Arc::new(NoHooks),
            Some(&Logger::root(slog::Discard, o!())),
        )
    }

    fn wait_for_state(iface: &HapiInterface, state: ConnectionState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if iface.state() == state {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn sequence_ids_start_at_one_and_skip_zero_on_wrap() {
        let mut seq = SequenceId::new();
        assert_eq!(seq.next(), Some(1));
        assert_eq!(seq.next(), Some(2));

        let mut seq = SequenceId::after(u32::max_value() - 1);
        assert_eq!(seq.next(), Some(u32::max_value()));
        assert_eq!(seq.next(), Some(1));
    }

    #[test]
    fn restart_never_falls_back_to_disconnected() {
        let iface = gate_interface("restart");
        iface.start().unwrap();
        assert!(wait_for_state(&iface, ConnectionState::Connected));

        iface.start().unwrap();
        assert_ne!(iface.state(), ConnectionState::Disconnected);
        assert!(wait_for_state(&iface, ConnectionState::Connected));
        iface.stop();
    }

    #[test]
    fn request_is_withdrawn_when_state_moved_on() {
        let iface = gate_interface("withdrawn");
        iface.start().unwrap();
        assert!(wait_for_state(&iface, ConnectionState::Connected));

        let (tx, rx) = oneshot::channel();
        let completion = Box::new(move |res: Result<Bytes>| {
            let _ = tx.send(res);
        });
        let sent = iface.send_request(
            HapiCommandCode::GetLastEventId.code(),
            &[],
            completion,
            ConnectionState::Initiated,
        );
        match sent {
            Err(HapiError::NotInitiated) => (),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(iface.core.pending.is_empty());
        // the completion was dropped without running
        assert!(block_on(rx).is_err());
        iface.stop();
    }
}
