// Copyright 2020 Joyent, Inc.

//! Drives a plugin-side interface against a gate played by hand.

use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use slog::{o, Drain, Level, LevelFilter, Logger};

use hapi_rpc::dispatch::CommandDispatchTable;
use hapi_rpc::interface::{CommandContext, HapiInterface, NoHooks};
use hapi_rpc::messages::{
    FetchRequest, InitiationBody, LastEventIdBody, MonitoringServerInfo, Timespec, WireBody,
};
use hapi_rpc::protocol::{
    encode_command, encode_response, HapiCommandCode, HapiMessage, HapiResponse,
    HapiResponseCode,
};
use hapi_rpc::session::HANDLER_PANICKED;
use hapi_rpc::transport::{Connection, MemoryBus, Role};
use hapi_rpc::{ConnectionState, HapiError};

fn test_log() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Warning,
        ))
        .fuse(),
        o!(),
    )
}

fn receive(conn: &Arc<dyn Connection>) -> HapiMessage {
    HapiMessage::parse(conn.receive().unwrap().unwrap()).unwrap()
}

fn reply(conn: &Arc<dyn Connection>, code: HapiResponseCode, to: &HapiMessage, body: &[u8]) {
    let packet = encode_response(code, to.code(), to.sequence_id(), body).unwrap();
    conn.send(packet).unwrap();
}

fn fetch_items_only() -> CommandDispatchTable {
    let mut table = CommandDispatchTable::new();
    table.register(HapiCommandCode::ReqFetchItems, |ctx: &CommandContext<'_>| {
        let request: FetchRequest = ctx.decode_body()?;
        ctx.reply(&request.host_id.to_le_bytes())
    });
    table
}

fn initiated_plugin(address: &str) -> (HapiInterface, Arc<dyn Connection>, MemoryBus) {
    initiated_plugin_with(address, fetch_items_only())
}

/// Starts a plugin interface and completes the handshake from the gate
/// side.
fn initiated_plugin_with(
    address: &str,
    commands: CommandDispatchTable,
) -> (HapiInterface, Arc<dyn Connection>, MemoryBus) {
    let bus = MemoryBus::new();
    let gate = bus.connect(address, Role::Gate).unwrap();
    let plugin = HapiInterface::new(
        Role::Plugin,
        address,
        Arc::new(bus.clone()),
        commands,
        Arc::new(NoHooks),
        Some(&test_log()),
    );
    plugin.start().unwrap();

    let init = receive(&gate);
    assert_eq!(init.code(), HapiCommandCode::Initiation.code());
    assert_ne!(init.sequence_id(), 0);
    let key = InitiationBody::decode(&init.body).unwrap();
    reply(&gate, HapiResponseCode::Ok, &init, &key.encode().unwrap());

    assert!(plugin.wait_initiated(Duration::from_secs(10)));
    (plugin, gate, bus)
}

#[test]
fn calls_before_initiation_are_refused() {
    let bus = MemoryBus::new();
    let plugin = HapiInterface::new(
        Role::Plugin,
        "fake-early",
        Arc::new(bus),
        CommandDispatchTable::new(),
        Arc::new(NoHooks),
        Some(&test_log()),
    );
    match plugin.call(HapiCommandCode::GetLastEventId.code(), &[]) {
        Err(HapiError::NotInitiated) => (),
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(plugin.state(), ConnectionState::Disconnected);
}

#[test]
fn wrong_initiation_key_keeps_session_uninitiated() {
    let bus = MemoryBus::new();
    let gate = bus.connect("fake-key", Role::Gate).unwrap();
    let plugin = HapiInterface::new(
        Role::Plugin,
        "fake-key",
        Arc::new(bus.clone()),
        CommandDispatchTable::new(),
        Arc::new(NoHooks),
        Some(&test_log()),
    );
    plugin.start().unwrap();

    let init = receive(&gate);
    let key = InitiationBody::decode(&init.body).unwrap().key;
    let wrong = InitiationBody {
        key: key.wrapping_add(1),
    };
    reply(&gate, HapiResponseCode::Ok, &init, &wrong.encode().unwrap());

    assert!(!plugin.wait_initiated(Duration::from_millis(200)));
    assert_eq!(plugin.state(), ConnectionState::Connected);
    plugin.stop();
}

#[test]
fn concurrent_calls_get_their_own_replies() {
    let (plugin, gate, _bus) = initiated_plugin("fake-order");

    let p1 = plugin.clone();
    let first = thread::spawn(move || {
        p1.call_body::<LastEventIdBody>(HapiCommandCode::GetLastEventId.code(), &[])
    });
    let cmd1 = receive(&gate);
    assert_eq!(cmd1.code(), HapiCommandCode::GetLastEventId.code());

    let p2 = plugin.clone();
    let second = thread::spawn(move || {
        p2.call_body::<Timespec>(HapiCommandCode::GetTimestampOfLastTrigger.code(), &[])
    });
    let cmd2 = receive(&gate);
    assert_eq!(cmd2.code(), HapiCommandCode::GetTimestampOfLastTrigger.code());
    assert_ne!(cmd1.sequence_id(), cmd2.sequence_id());

    // answer the second call first
    let ts = Timespec::new(1_600_000_000, 42);
    reply(&gate, HapiResponseCode::Ok, &cmd2, &ts.encode().unwrap());
    let id = LastEventIdBody { event_id: 99 };
    reply(&gate, HapiResponseCode::Ok, &cmd1, &id.encode().unwrap());

    assert_eq!(first.join().unwrap().unwrap().event_id(), Some(99));
    assert_eq!(second.join().unwrap().unwrap(), ts);
    plugin.stop();
}

#[test]
fn async_calls_resolve_out_of_order() {
    let (plugin, gate, _bus) = initiated_plugin("fake-async");

    let (tx, rx) = mpsc::channel();
    for tag in &["a", "b"] {
        let tx = tx.clone();
        let tag = tag.to_string();
        plugin
            .start_call(HapiCommandCode::GetLastEventId.code(), &[], move |res| {
                let _ = tx.send((tag, res.unwrap()));
            })
            .unwrap();
    }
    let a = receive(&gate);
    let b = receive(&gate);
    reply(&gate, HapiResponseCode::Ok, &b, b"B");
    reply(&gate, HapiResponseCode::Ok, &a, b"A");

    let mut got = vec![
        rx.recv_timeout(Duration::from_secs(10)).unwrap(),
        rx.recv_timeout(Duration::from_secs(10)).unwrap(),
    ];
    assert_eq!(got[0], ("b".to_string(), Bytes::from_static(b"B")));
    got.sort();
    assert_eq!(
        got,
        vec![
            ("a".to_string(), Bytes::from_static(b"A")),
            ("b".to_string(), Bytes::from_static(b"B")),
        ]
    );
    plugin.stop();
}

#[test]
fn error_response_fails_the_call() {
    let (plugin, gate, _bus) = initiated_plugin("fake-error");

    let p = plugin.clone();
    let call = thread::spawn(move || p.call(HapiCommandCode::GetLastEventId.code(), &[]));
    let cmd = receive(&gate);
    reply(&gate, HapiResponseCode::NotFound, &cmd, &[]);

    match call.join().unwrap() {
        Err(HapiError::ErrorResponse { code, command }) => {
            assert_eq!(code, HapiResponseCode::NotFound.code());
            assert_eq!(command, HapiCommandCode::GetLastEventId.code());
        }
        other => panic!("unexpected: {:?}", other),
    }
    plugin.stop();
}

#[test]
fn unterminated_host_name_fails_the_call() {
    let (plugin, gate, _bus) = initiated_plugin("fake-broken");

    let p = plugin.clone();
    let call = thread::spawn(move || {
        p.call_body::<MonitoringServerInfo>(HapiCommandCode::GetMonitoringServerInfo.code(), &[])
    });
    let cmd = receive(&gate);

    let mut info = MonitoringServerInfo::default();
    info.host_name = "zbx1.example.com".to_string();
    info.port = 10051;
    info.polling_interval_sec = 60;
    let mut body = info.encode().unwrap().to_vec();
    let nul = MonitoringServerInfo::FIXED_SIZE + info.host_name.len();
    body[nul] = b'x';
    reply(&gate, HapiResponseCode::Ok, &cmd, &body);

    match call.join().unwrap() {
        Err(HapiError::BrokenPacket(_)) => (),
        other => panic!("unexpected: {:?}", other),
    }
    // the session survives a bad body
    assert!(plugin.is_initiated());
    plugin.stop();
}

#[test]
fn unsupported_command_gets_error_response() {
    let (plugin, gate, _bus) = initiated_plugin("fake-unsupported");

    gate.send(encode_command(0x1234, 9, &[]).unwrap()).unwrap();
    let res = HapiResponse::from_message(receive(&gate)).unwrap();
    assert_eq!(res.code, HapiResponseCode::UnsupportedCommand.code());
    assert_eq!(res.command, 0x1234);
    assert_eq!(res.sequence_id, 9);
    plugin.stop();
}

#[test]
fn handlers_reply_and_bad_bodies_are_malformed() {
    let (plugin, gate, _bus) = initiated_plugin("fake-handler");

    let request = FetchRequest { host_id: 10084 };
    let packet = encode_command(
        HapiCommandCode::ReqFetchItems.code(),
        5,
        &request.encode().unwrap(),
    )
    .unwrap();
    gate.send(packet).unwrap();
    let res = HapiResponse::from_message(receive(&gate)).unwrap();
    assert!(res.is_ok());
    assert_eq!(res.sequence_id, 5);
    assert_eq!(&res.body[..], &10084u64.to_le_bytes()[..]);

    let packet = encode_command(HapiCommandCode::ReqFetchItems.code(), 6, &[1, 2]).unwrap();
    gate.send(packet).unwrap();
    let res = HapiResponse::from_message(receive(&gate)).unwrap();
    assert_eq!(res.code, HapiResponseCode::MalformedCommand.code());
    assert_eq!(res.sequence_id, 6);
    plugin.stop();
}

#[test]
fn stray_replies_are_dropped() {
    let (plugin, gate, _bus) = initiated_plugin("fake-stray");

    let stray = encode_response(
        HapiResponseCode::Ok,
        HapiCommandCode::GetLastEventId.code(),
        4242,
        &[],
    )
    .unwrap();
    gate.send(stray).unwrap();
    // garbage shorter than a header
    gate.send(Bytes::from_static(&[1, 2, 3])).unwrap();

    let p = plugin.clone();
    let call = thread::spawn(move || p.call(HapiCommandCode::GetLastEventId.code(), &[]));
    let cmd = receive(&gate);
    reply(&gate, HapiResponseCode::Ok, &cmd, b"ok");
    assert_eq!(call.join().unwrap().unwrap(), Bytes::from_static(b"ok"));
    plugin.stop();
}

#[test]
fn connection_loss_fails_pending_calls() {
    let (plugin, gate, bus) = initiated_plugin("fake-lost");

    let p = plugin.clone();
    let call = thread::spawn(move || p.call(HapiCommandCode::GetLastEventId.code(), &[]));
    let _cmd = receive(&gate);
    bus.sever("fake-lost");

    match call.join().unwrap() {
        Err(HapiError::ConnectionLost(_)) => (),
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(plugin.state(), ConnectionState::Disconnected);
    plugin.stop();
}

#[test]
fn commands_before_initiation_get_not_initiated() {
    let bus = MemoryBus::new();
    let gate = bus.connect("fake-not-init", Role::Gate).unwrap();
    let plugin = HapiInterface::new(
        Role::Plugin,
        "fake-not-init",
        Arc::new(bus.clone()),
        fetch_items_only(),
        Arc::new(NoHooks),
        Some(&test_log()),
    );
    plugin.start().unwrap();
    let _init = receive(&gate);

    let packet = encode_command(HapiCommandCode::ReqFetchItems.code(), 3, &[0; 8]).unwrap();
    gate.send(packet).unwrap();
    let res = HapiResponse::from_message(receive(&gate)).unwrap();
    assert_eq!(res.code, HapiResponseCode::NotInitiated.code());
    assert_eq!(res.sequence_id, 3);
    plugin.stop();
}

#[test]
fn panicking_handler_ends_the_session() {
    let mut commands = CommandDispatchTable::new();
    commands.register(HapiCommandCode::ReqFetchItems, |_: &CommandContext<'_>| {
        panic!("backend blew up")
    });
    let (plugin, gate, _bus) = initiated_plugin_with("fake-panic", commands);

    let p = plugin.clone();
    let call = thread::spawn(move || p.call(HapiCommandCode::GetLastEventId.code(), &[]));
    let cmd = receive(&gate);

    let packet = encode_command(HapiCommandCode::ReqFetchItems.code(), 7, &[0; 8]).unwrap();
    gate.send(packet).unwrap();

    // the outstanding call fails instead of waiting for a reply that the
    // dead receive thread could never deliver
    match call.join().unwrap() {
        Err(HapiError::ConnectionLost(msg)) => assert_eq!(msg, HANDLER_PANICKED),
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(plugin.state(), ConnectionState::Disconnected);

    // a late reply goes nowhere and new calls are refused
    reply(&gate, HapiResponseCode::Ok, &cmd, &[]);
    match plugin.call(HapiCommandCode::GetLastEventId.code(), &[]) {
        Err(HapiError::NotInitiated) => (),
        other => panic!("unexpected: {:?}", other),
    }
    plugin.stop();
}
