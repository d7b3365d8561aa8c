// Copyright 2020 Joyent, Inc.

use std::process;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::prelude::*;
use clap::{crate_version, App, Arg, ArgMatches};
use slog::{error, info, o, Drain, Logger};

use hapi_rpc::arm_info::ArmInfo;
use hapi_rpc::config::PluginConfig;
use hapi_rpc::item_data::ItemData;
use hapi_rpc::item_group::ItemGroup;
use hapi_rpc::item_table::ItemTable;
use hapi_rpc::messages::{FetchRequest, ALL_HOSTS};
use hapi_rpc::plugin::{ArmBackend, ArmPlugin};
use hapi_rpc::transport::TcpTransport;
use hapi_rpc::Result;

static APP: &'static str = "hapiplugin";

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Toy HAPI arm plugin reporting the local clock as an item")
        .version(crate_version!())
        .arg(
            Arg::with_name("address")
                .help("Gate address (Default: $HAPI_QUEUE_ADDR)")
                .long("address")
                .short("a")
                .takes_value(true),
        )
        .get_matches()
}

struct ClockBackend {
    log: Logger,
}

impl ArmBackend for ClockBackend {
    fn fetch_items(&self, request: &FetchRequest) -> Result<ItemTable> {
        info!(self.log, "fetching items"; "host_id" => request.host_id);
        let host_id = if request.host_id == ALL_HOSTS {
            1
        } else {
            request.host_id
        };
        let now = Utc::now();
        let mut row = ItemGroup::new();
        row.add_data(ItemData::new(1, host_id))?;
        row.add_data(ItemData::new(2, "system.localtime"))?;
        row.add_data(ItemData::new(3, now.timestamp() as u64))?;
        row.add_data(ItemData::new(4, now.to_rfc3339()))?;

        let mut table = ItemTable::new();
        table.add(row)?;
        Ok(table)
    }

    fn terminate(&self) {
        info!(self.log, "terminating");
        process::exit(0);
    }
}

fn hosts() -> Result<ItemTable> {
    let mut row = ItemGroup::new();
    row.add_data(ItemData::new(1, 1u64))?;
    row.add_data(ItemData::new(2, "localhost"))?;
    let mut table = ItemTable::new();
    table.add(row)?;
    Ok(table)
}

fn main() {
    let matches = parse_opts(APP.to_string());

    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let config = match matches.value_of("address") {
        Some(address) => PluginConfig::new(address),
        None => PluginConfig::from_env().unwrap_or_else(|e| {
            eprintln!("{}", e);
            process::exit(1)
        }),
    };

    let backend = Arc::new(ClockBackend {
        log: root_log.clone(),
    });
    let plugin = ArmPlugin::new(&config, Arc::new(TcpTransport), backend, Some(&root_log));
    if let Err(e) = plugin.start() {
        eprintln!("Failed to start plugin: {}", e);
        process::exit(1)
    }
    if !plugin.wait_initiated(Duration::from_secs(30)) {
        eprintln!("Gate did not answer the initiation");
        process::exit(1)
    }

    let mut arm_info = ArmInfo::default();
    arm_info.running = true;
    match plugin.get_monitoring_server_info() {
        Ok(server) => {
            info!(root_log, "serving monitoring server";
                  "host_name" => &server.host_name, "port" => server.port);
            arm_info.log_success();
        }
        Err(e) => {
            error!(root_log, "failed to get server info"; "error" => %e);
            arm_info.log_failure(&e.to_string());
        }
    }

    let sent = hosts().and_then(|table| plugin.send_hosts(&table));
    if let Err(e) = sent {
        error!(root_log, "failed to send hosts"; "error" => %e);
        arm_info.log_failure(&e.to_string());
    }
    if let Err(e) = plugin.send_arm_info(&arm_info) {
        error!(root_log, "failed to send arm info"; "error" => %e);
    }

    // requests from the gate are served on the session thread
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}
