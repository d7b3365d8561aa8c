// Copyright 2020 Joyent, Inc.

use std::process;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use slog::{error, info, o, Drain, Logger};

use hapi_rpc::config::GateConfig;
use hapi_rpc::gate::{ArmPluginGate, MemoryStore, TableKind};
use hapi_rpc::messages::ALL_HOSTS;
use hapi_rpc::transport::TcpTransport;

static APP: &'static str = "hapigate";
static DEFAULT_ADDRESS: &'static str = "127.0.0.1:2031";
const DEFAULT_INTERVAL: u64 = 10;

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Serves one HAPI arm plugin over TCP and polls it for items")
        .version(crate_version!())
        .arg(
            Arg::with_name("config")
                .help("JSON gate configuration file")
                .long("config")
                .short("c")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("address")
                .help("Address to listen on (Default: 127.0.0.1:2031)")
                .long("address")
                .short("a")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("plugin")
                .help("Plugin executable to launch")
                .long("plugin")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("interval")
                .help("Seconds between item fetches (Default: 10)")
                .long("interval")
                .short("i")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("count")
                .help("Number of fetches before shutting down")
                .long("count")
                .short("n")
                .takes_value(true),
        )
        .get_matches()
}

fn main() {
    let matches = parse_opts(APP.to_string());

    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let mut config = match matches.value_of("config") {
        Some(path) => GateConfig::from_file(path).unwrap_or_else(|e| {
            eprintln!("Failed to load configuration: {}", e);
            process::exit(1)
        }),
        None => GateConfig::default(),
    };
    if let Some(address) = matches.value_of("address") {
        config.queue_address = address.to_string();
    } else if config.queue_address.is_empty() {
        config.queue_address = DEFAULT_ADDRESS.to_string();
    }
    if let Some(plugin) = matches.value_of("plugin") {
        config.plugin_path = Some(plugin.into());
    }
    let interval = value_t!(matches, "interval", u64).unwrap_or(DEFAULT_INTERVAL);
    let count = value_t!(matches, "count", u64).ok();

    let store = Arc::new(MemoryStore::new());
    let gate = ArmPluginGate::new(
        &config,
        Arc::new(TcpTransport),
        store.clone(),
        None,
        Some(&root_log),
    );
    if let Err(e) = gate.start() {
        eprintln!("Failed to start gate: {}", e);
        process::exit(1)
    }
    info!(root_log, "gate started"; "address" => &config.queue_address);

    if !gate.wait_for_launch(Duration::from_secs(60)) {
        error!(root_log, "plugin did not come up");
    }

    let mut fetched = 0;
    while count.map_or(true, |n| fetched < n) {
        match gate.fetch_items(ALL_HOSTS) {
            Ok(items) => {
                info!(root_log, "fetched items"; "rows" => items.num_groups());
                for row in items.groups() {
                    let cells: Vec<String> =
                        row.items().iter().map(|item| item.to_string()).collect();
                    println!("{}", cells.join("\t"));
                }
            }
            Err(e) => error!(root_log, "fetch failed"; "error" => %e),
        }
        info!(root_log, "stored tables";
              "hosts" => store.tables(TableKind::Hosts).len(),
              "triggers" => store.tables(TableKind::Triggers).len(),
              "events" => store.tables(TableKind::Events).len());
        match gate.status().to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => error!(root_log, "failed to render status"; "error" => %e),
        }
        fetched += 1;
        thread::sleep(Duration::from_secs(interval));
    }

    gate.stop();
}
