// Copyright 2020 Joyent, Inc.

//! The plugin side of HAPI.
//!
//! An [`ArmPlugin`] pairs the protocol endpoint with an [`ArmBackend`], the
//! client of one monitoring system. The gate's fetch and terminate
//! requests are delegated to the backend; everything the plugin tells the
//! gate goes through the blocking helpers on `ArmPlugin`.

use std::process;
use std::sync::Arc;
use std::time::Duration;

use slog::{info, o, Logger};

use crate::arm_info::ArmInfo;
use crate::config::PluginConfig;
use crate::dispatch::CommandDispatchTable;
use crate::error::Result;
use crate::interface::{CommandContext, HapiInterface, InterfaceHooks};
use crate::item_codec::table_to_bytes;
use crate::item_table::ItemTable;
use crate::messages::{
    FetchHistoryRequest, FetchRequest, HostsChangedBody, LastEventIdBody,
    MonitoringServerInfo, TimeOfLastEventRequest, Timespec, WireBody,
};
use crate::protocol::HapiCommandCode;
use crate::session::SessionEvent;
use crate::transport::{Role, Transport};

/// A monitoring-system client driven by the gate.
///
/// Every method runs on the session's receive thread.
pub trait ArmBackend: Send + Sync {
    fn fetch_items(&self, _request: &FetchRequest) -> Result<ItemTable> {
        Ok(ItemTable::new())
    }

    fn fetch_history(&self, _request: &FetchHistoryRequest) -> Result<ItemTable> {
        Ok(ItemTable::new())
    }

    fn fetch_triggers(&self, _request: &FetchRequest) -> Result<ItemTable> {
        Ok(ItemTable::new())
    }

    /// Called after the gate asked the plugin to terminate.
    fn terminate(&self) {
        process::exit(0);
    }

    fn on_initiated(&self) {}

    fn on_disconnected(&self, _event: &SessionEvent) {}

    /// Adds extension commands or replaces the built-in ones.
    fn register_commands(&self, _table: &mut CommandDispatchTable) {}
}

struct BackendHooks {
    backend: Arc<dyn ArmBackend>,
}

impl InterfaceHooks for BackendHooks {
    fn on_initiated(&self) {
        self.backend.on_initiated();
    }

    fn on_disconnected(&self, event: &SessionEvent) {
        self.backend.on_disconnected(event);
    }
}

fn builtin_commands(backend: &Arc<dyn ArmBackend>) -> CommandDispatchTable {
    let mut table = CommandDispatchTable::new();

    let b = Arc::clone(backend);
    table.register(HapiCommandCode::ReqFetchItems, move |ctx| {
        let request: FetchRequest = ctx.decode_body()?;
        ctx.reply_table(&b.fetch_items(&request)?)
    });

    let b = Arc::clone(backend);
    table.register(HapiCommandCode::ReqFetchHistory, move |ctx| {
        let request: FetchHistoryRequest = ctx.decode_body()?;
        ctx.reply_table(&b.fetch_history(&request)?)
    });

    let b = Arc::clone(backend);
    table.register(HapiCommandCode::ReqFetchTriggers, move |ctx| {
        let request: FetchRequest = ctx.decode_body()?;
        ctx.reply_table(&b.fetch_triggers(&request)?)
    });

    let b = Arc::clone(backend);
    table.register(HapiCommandCode::ReqTerminate, move |ctx: &CommandContext<'_>| {
        info!(ctx.interface().log(), "terminate requested");
        ctx.reply_ok()?;
        b.terminate();
        Ok(())
    });

    table
}

pub struct ArmPlugin {
    interface: HapiInterface,
    log: Logger,
}

impl ArmPlugin {
    pub fn new(
        config: &PluginConfig,
        transport: Arc<dyn Transport>,
        backend: Arc<dyn ArmBackend>,
        log: Option<&Logger>,
    ) -> ArmPlugin {
        let log = crate::logger(log).new(o!("component" => "plugin"));

        let mut table = builtin_commands(&backend);
        backend.register_commands(&mut table);

        let hooks = Arc::new(BackendHooks { backend });
        let interface = HapiInterface::new(
            Role::Plugin,
            &config.queue_address,
            transport,
            table,
            hooks,
            Some(&log),
        );
        ArmPlugin { interface, log }
    }

    pub fn interface(&self) -> &HapiInterface {
        &self.interface
    }

    pub fn start(&self) -> Result<()> {
        info!(self.log, "starting plugin"; "address" => self.interface.address());
        self.interface.start()
    }

    pub fn stop(&self) {
        self.interface.stop();
    }

    pub fn wait_initiated(&self, timeout: Duration) -> bool {
        self.interface.wait_initiated(timeout)
    }

    pub fn get_monitoring_server_info(&self) -> Result<MonitoringServerInfo> {
        self.interface
            .call_body(HapiCommandCode::GetMonitoringServerInfo.code(), &[])
    }

    pub fn get_timestamp_of_last_trigger(&self) -> Result<Timespec> {
        self.interface
            .call_body(HapiCommandCode::GetTimestampOfLastTrigger.code(), &[])
    }

    /// Returns `None` when the gate has not stored any event yet.
    pub fn get_last_event_id(&self) -> Result<Option<u64>> {
        let body: LastEventIdBody = self
            .interface
            .call_body(HapiCommandCode::GetLastEventId.code(), &[])?;
        Ok(body.event_id())
    }

    /// An empty `trigger_id` asks about events of any trigger.
    pub fn get_time_of_last_event(&self, trigger_id: &str) -> Result<Timespec> {
        let request = TimeOfLastEventRequest {
            trigger_id: trigger_id.to_string(),
        };
        self.interface
            .call_body(HapiCommandCode::GetTimeOfLastEvent.code(), &request.encode()?)
    }

    pub fn get_if_hosts_changed(&self) -> Result<bool> {
        let body: HostsChangedBody = self
            .interface
            .call_body(HapiCommandCode::GetIfHostsChanged.code(), &[])?;
        Ok(body.changed)
    }

    pub fn send_updated_triggers(&self, table: &ItemTable) -> Result<()> {
        self.send_table(HapiCommandCode::SendUpdatedTriggers, table)
    }

    pub fn send_hosts(&self, table: &ItemTable) -> Result<()> {
        self.send_table(HapiCommandCode::SendHosts, table)
    }

    pub fn send_host_group_elements(&self, table: &ItemTable) -> Result<()> {
        self.send_table(HapiCommandCode::SendHostGroupElements, table)
    }

    pub fn send_host_groups(&self, table: &ItemTable) -> Result<()> {
        self.send_table(HapiCommandCode::SendHostGroups, table)
    }

    pub fn send_updated_events(&self, table: &ItemTable) -> Result<()> {
        self.send_table(HapiCommandCode::SendUpdatedEvents, table)
    }

    pub fn send_hap_self_triggers(&self, table: &ItemTable) -> Result<()> {
        self.send_table(HapiCommandCode::SendHapSelfTriggers, table)
    }

    pub fn send_arm_info(&self, info: &ArmInfo) -> Result<()> {
        self.interface
            .call(HapiCommandCode::SendArmInfo.code(), &info.encode()?)?;
        Ok(())
    }

    fn send_table(&self, code: HapiCommandCode, table: &ItemTable) -> Result<()> {
        self.interface.call(code.code(), &table_to_bytes(table)?)?;
        Ok(())
    }
}

impl Drop for ArmPlugin {
    fn drop(&mut self) {
        self.interface.stop();
    }
}
