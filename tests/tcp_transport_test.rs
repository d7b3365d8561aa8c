// Copyright 2020 Joyent, Inc.

use std::sync::{mpsc, Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use slog::{debug, info, o, Drain, Level, LevelFilter, Logger};

use hapi_rpc::dispatch::CommandDispatchTable;
use hapi_rpc::interface::{CommandContext, HapiInterface, NoHooks};
use hapi_rpc::item_codec::table_from_bytes;
use hapi_rpc::item_data::ItemData;
use hapi_rpc::item_group::ItemGroup;
use hapi_rpc::item_table::ItemTable;
use hapi_rpc::messages::{FetchRequest, WireBody};
use hapi_rpc::protocol::HapiCommandCode;
use hapi_rpc::transport::{Role, TcpTransport};

const ADDRESS: &str = "127.0.0.1:56652";

fn root_log() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Info,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

/// Answers REQ_FETCH_ITEMS with one row per requested kilobyte, each row
/// carrying a 1000 byte string.
fn echo_commands(log: Logger) -> CommandDispatchTable {
    let mut table = CommandDispatchTable::new();
    table.register(HapiCommandCode::ReqFetchItems, move |ctx: &CommandContext<'_>| {
        let request: FetchRequest = ctx.decode_body()?;
        debug!(log, "handling fetch items request"; "rows" => request.host_id);
        let mut items = ItemTable::new();
        for i in 0..request.host_id {
            let mut row = ItemGroup::new();
            row.add_data(ItemData::new(1, i))?;
            row.add_data(ItemData::new(2, "a".repeat(1000)))?;
            items.add(row)?;
        }
        ctx.reply_table(&items)
    });
    table
}

fn run_gate(barrier: Arc<Barrier>, done: mpsc::Receiver<()>) {
    let log = root_log();
    let gate = HapiInterface::new(
        Role::Gate,
        ADDRESS,
        Arc::new(TcpTransport),
        echo_commands(log.clone()),
        Arc::new(NoHooks),
        Some(&log),
    );
    gate.start().expect("failed to bind");
    info!(log, "listening for hapi requests"; "address" => ADDRESS);

    barrier.wait();

    let _ = done.recv();
    gate.stop();
}

#[test]
fn gate_plugin_comms_over_tcp() {
    let barrier = Arc::new(Barrier::new(2));
    let barrier_clone = barrier.clone();
    let (done_tx, done_rx) = mpsc::channel();
    let h_gate = thread::spawn(move || run_gate(barrier_clone, done_rx));

    barrier.wait();

    let log = root_log();
    let plugin = HapiInterface::new(
        Role::Plugin,
        ADDRESS,
        Arc::new(TcpTransport),
        CommandDispatchTable::new(),
        Arc::new(NoHooks),
        Some(&log),
    );
    plugin.start().unwrap();
    assert!(plugin.wait_initiated(Duration::from_secs(10)));

    // plugin to gate direction is covered by the in-memory tests; here the
    // plugin plays the fetching side to move large tables over the stream
    for rows in 1..20u64 {
        let body = FetchRequest { host_id: rows }.encode().unwrap();
        let reply = plugin
            .call(HapiCommandCode::ReqFetchItems.code(), &body)
            .unwrap();
        let table = table_from_bytes(&reply).unwrap();
        assert_eq!(table.num_groups() as u64, rows);
        let last = &table.groups()[rows as usize - 1];
        assert_eq!(last.get(1).unwrap().get::<u64>(), rows - 1);
        assert_eq!(last.get(2).unwrap().get::<String>().len(), 1000);
    }

    plugin.stop();
    done_tx.send(()).unwrap();
    h_gate.join().unwrap();
}
