// Copyright 2020 Joyent, Inc.

//! The gate side of HAPI.
//!
//! An [`ArmPluginGate`] serves the requests of one arm plugin, stores what
//! the plugin sends, and keeps the plugin alive. A supervisor thread runs
//! rounds of "open the session, launch the plugin process, wait until
//! something breaks", sleeping between rounds with exponential backoff.
//! The sleep is interrupted by [`ArmPluginGate::stop`].

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use slog::{debug, error, info, o, warn, Logger};

use crate::arm_info::{ArmInfo, ArmStatus};
use crate::config::{GateConfig, RetryPolicy, ENV_NAME_QUEUE_ADDR};
use crate::dispatch::CommandDispatchTable;
use crate::error::{HapiError, Result};
use crate::interface::{CommandContext, HapiInterface, InterfaceHooks};
use crate::item_codec::table_from_bytes;
use crate::item_table::ItemTablePtr;
use crate::messages::{
    FetchHistoryRequest, FetchRequest, HostsChangedBody, LastEventIdBody,
    TimeOfLastEventRequest, Timespec, WireBody, EVENT_ID_NONE,
};
use crate::protocol::HapiCommandCode;
use crate::session::SessionEvent;
use crate::transport::{Role, Transport};

/// How long a plugin gets to exit on its own before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(3);

/// Kinds of tables a plugin pushes to the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    Triggers,
    Hosts,
    HostGroupElements,
    HostGroups,
    Events,
    HapSelfTriggers,
}

impl TableKind {
    fn command(self) -> HapiCommandCode {
        match self {
            TableKind::Triggers => HapiCommandCode::SendUpdatedTriggers,
            TableKind::Hosts => HapiCommandCode::SendHosts,
            TableKind::HostGroupElements => HapiCommandCode::SendHostGroupElements,
            TableKind::HostGroups => HapiCommandCode::SendHostGroups,
            TableKind::Events => HapiCommandCode::SendUpdatedEvents,
            TableKind::HapSelfTriggers => HapiCommandCode::SendHapSelfTriggers,
        }
    }

    const ALL: [TableKind; 6] = [
        TableKind::Triggers,
        TableKind::Hosts,
        TableKind::HostGroupElements,
        TableKind::HostGroups,
        TableKind::Events,
        TableKind::HapSelfTriggers,
    ];
}

/// Where the gate keeps plugin data and what it answers the plugin's
/// queries from. Methods run on the session's receive thread.
pub trait ArmDataStore: Send + Sync {
    fn store(&self, kind: TableKind, table: ItemTablePtr) -> Result<()>;

    fn timestamp_of_last_trigger(&self) -> Option<Timespec>;

    fn last_event_id(&self) -> Option<u64>;

    /// An empty `trigger_id` means any trigger.
    fn time_of_last_event(&self, trigger_id: &str) -> Option<Timespec>;

    /// True once after the host list changed.
    fn take_hosts_changed(&self) -> bool;
}

#[derive(Default)]
struct MemoryStoreInner {
    tables: HashMap<TableKind, Vec<ItemTablePtr>>,
    last_trigger: Option<Timespec>,
    last_event_id: Option<u64>,
    last_event_times: HashMap<String, Timespec>,
    hosts_changed: bool,
}

/// Keeps everything in memory. The bookkeeping values are set by the
/// owner; stored tables are kept in arrival order.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    pub fn tables(&self, kind: TableKind) -> Vec<ItemTablePtr> {
        self.lock().tables.get(&kind).cloned().unwrap_or_default()
    }

    pub fn set_timestamp_of_last_trigger(&self, t: Timespec) {
        self.lock().last_trigger = Some(t);
    }

    pub fn set_last_event_id(&self, id: u64) {
        self.lock().last_event_id = Some(id);
    }

    pub fn set_time_of_last_event(&self, trigger_id: &str, t: Timespec) {
        let mut inner = self.lock();
        inner.last_event_times.insert(trigger_id.to_string(), t);
        let newest = inner.last_event_times.entry(String::new()).or_default();
        if t > *newest {
            *newest = t;
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStoreInner> {
        self.inner.lock()
    }
}

impl ArmDataStore for MemoryStore {
    fn store(&self, kind: TableKind, table: ItemTablePtr) -> Result<()> {
        let mut inner = self.lock();
        if kind == TableKind::Hosts {
            inner.hosts_changed = true;
        }
        inner.tables.entry(kind).or_default().push(table);
        Ok(())
    }

    fn timestamp_of_last_trigger(&self) -> Option<Timespec> {
        self.lock().last_trigger
    }

    fn last_event_id(&self) -> Option<u64> {
        self.lock().last_event_id
    }

    fn time_of_last_event(&self, trigger_id: &str) -> Option<Timespec> {
        self.lock().last_event_times.get(trigger_id).cloned()
    }

    fn take_hosts_changed(&self) -> bool {
        let mut inner = self.lock();
        let changed = inner.hosts_changed;
        inner.hosts_changed = false;
        changed
    }
}

/// A running plugin process.
pub trait PluginProcess: Send {
    /// Returns a description of the exit once the process has exited.
    fn exited(&mut self) -> Result<Option<String>>;

    fn kill(&mut self) -> Result<()>;

    /// Gives the process `grace` to exit on its own, then kills it.
    fn reap(&mut self, grace: Duration) {
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            match self.exited() {
                Ok(Some(_)) | Err(_) => return,
                Ok(None) => thread::sleep(Duration::from_millis(20)),
            }
        }
        let _ = self.kill();
    }
}

impl PluginProcess for Child {
    fn exited(&mut self) -> Result<Option<String>> {
        Ok(self.try_wait()?.map(|status| status.to_string()))
    }

    fn kill(&mut self) -> Result<()> {
        Child::kill(self)?;
        Child::wait(self)?;
        Ok(())
    }
}

pub trait PluginLauncher: Send + Sync {
    fn launch(&self, queue_address: &str) -> Result<Box<dyn PluginProcess>>;
}

/// Spawns the plugin executable with the queue address in its
/// environment.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    path: PathBuf,
    args: Vec<OsString>,
}

impl CommandLauncher {
    pub fn new<P: Into<PathBuf>>(path: P, args: &[String]) -> CommandLauncher {
        CommandLauncher {
            path: path.into(),
            args: args.iter().map(OsString::from).collect(),
        }
    }
}

impl PluginLauncher for CommandLauncher {
    fn launch(&self, queue_address: &str) -> Result<Box<dyn PluginProcess>> {
        let child = Command::new(&self.path)
            .args(&self.args)
            .env(ENV_NAME_QUEUE_ADDR, queue_address)
            .spawn()
            .map_err(|e| HapiError::Handler(format!("{}: {}", self.path.display(), e)))?;
        Ok(Box::new(child))
    }
}

#[derive(Default)]
struct SignalState {
    cancelled: bool,
    session_lost: Option<String>,
    initiated: bool,
    launch: Option<bool>,
}

/// State shared between the supervisor, the interface hooks and callers.
#[derive(Default)]
struct GateSignals {
    state: Mutex<SignalState>,
    changed: Condvar,
}

impl GateSignals {
    fn lock(&self) -> MutexGuard<'_, SignalState> {
        self.state.lock()
    }

    fn update<F: FnOnce(&mut SignalState)>(&self, f: F) {
        f(&mut self.lock());
        self.changed.notify_all();
    }

    /// Sleeps for `timeout` unless cancelled first. Returns true when
    /// cancelled.
    fn sleep(&self, timeout: Duration) -> bool {
        let mut guard = self.lock();
        self.changed.wait_while_for(&mut guard, |s| !s.cancelled, timeout);
        guard.cancelled
    }
}

struct GateHooks {
    signals: Arc<GateSignals>,
    status: Arc<ArmStatus>,
}

impl InterfaceHooks for GateHooks {
    fn on_initiated(&self) {
        self.status.set_running(true);
        self.signals.update(|s| {
            s.initiated = true;
            s.launch = Some(true);
        });
    }

    fn on_disconnected(&self, event: &SessionEvent) {
        self.status.set_running(false);
        let reason = event.to_string();
        self.signals.update(|s| s.session_lost = Some(reason));
    }
}

fn gate_commands(
    config: &GateConfig,
    store: &Arc<dyn ArmDataStore>,
    status: &Arc<ArmStatus>,
) -> CommandDispatchTable {
    let mut table = CommandDispatchTable::new();

    let server = config.monitoring_server.clone();
    table.register(HapiCommandCode::GetMonitoringServerInfo, move |ctx| {
        ctx.reply_body(&server)
    });

    let s = Arc::clone(store);
    table.register(HapiCommandCode::GetTimestampOfLastTrigger, move |ctx| {
        ctx.reply_body(&s.timestamp_of_last_trigger().unwrap_or_default())
    });

    let s = Arc::clone(store);
    table.register(HapiCommandCode::GetLastEventId, move |ctx| {
        ctx.reply_body(&LastEventIdBody {
            event_id: s.last_event_id().unwrap_or(EVENT_ID_NONE),
        })
    });

    let s = Arc::clone(store);
    table.register(HapiCommandCode::GetTimeOfLastEvent, move |ctx| {
        let request: TimeOfLastEventRequest = ctx.decode_body()?;
        ctx.reply_body(&s.time_of_last_event(&request.trigger_id).unwrap_or_default())
    });

    let s = Arc::clone(store);
    table.register(HapiCommandCode::GetIfHostsChanged, move |ctx| {
        ctx.reply_body(&HostsChangedBody {
            changed: s.take_hosts_changed(),
        })
    });

    for kind in TableKind::ALL.iter().cloned() {
        let s = Arc::clone(store);
        table.register(kind.command(), move |ctx: &CommandContext<'_>| {
            let rows = table_from_bytes(ctx.body())?;
            debug!(ctx.interface().log(), "storing table";
                   "kind" => format!("{:?}", kind), "rows" => rows.num_groups());
            s.store(kind, rows)?;
            ctx.reply_ok()
        });
    }

    let st = Arc::clone(status);
    table.register(HapiCommandCode::SendArmInfo, move |ctx| {
        let report: ArmInfo = ctx.decode_body()?;
        st.update_from_report(&report);
        ctx.reply_ok()
    });

    table
}

struct Supervisor {
    interface: HapiInterface,
    signals: Arc<GateSignals>,
    status: Arc<ArmStatus>,
    launcher: Option<Arc<dyn PluginLauncher>>,
    retry: RetryPolicy,
    poll_interval: Duration,
    log: Logger,
}

enum RoundEnd {
    Cancelled,
    Failed(String),
}

impl Supervisor {
    fn run(self) {
        let mut attempts: u32 = 0;
        loop {
            let end = self.round();
            let initiated = self.signals.lock().initiated;

            self.interface.stop();
            self.status.set_running(false);

            let reason = match end {
                RoundEnd::Cancelled => break,
                RoundEnd::Failed(reason) => reason,
            };
            warn!(self.log, "plugin round ended"; "reason" => &reason);
            self.status.log_failure(&reason);

            if initiated {
                attempts = 0;
            } else {
                self.signals.update(|s| s.launch = Some(false));
            }
            attempts += 1;
            if self.retry.exhausted(attempts) {
                error!(self.log, "giving up on plugin"; "attempts" => attempts);
                break;
            }

            let delay = self.retry.backoff(attempts);
            info!(self.log, "retrying plugin";
                  "attempt" => attempts, "delay_ms" => delay.as_millis() as u64);
            if self.signals.sleep(delay) {
                break;
            }
        }
        info!(self.log, "supervisor exiting");
    }

    fn round(&self) -> RoundEnd {
        self.signals.update(|s| {
            s.session_lost = None;
            s.initiated = false;
        });
        if self.signals.lock().cancelled {
            return RoundEnd::Cancelled;
        }

        if let Err(e) = self.interface.start() {
            return RoundEnd::Failed(format!("failed to open session: {}", e));
        }

        let mut child = match &self.launcher {
            Some(launcher) => match launcher.launch(self.interface.address()) {
                Ok(child) => {
                    info!(self.log, "plugin launched");
                    Some(child)
                }
                Err(e) => return RoundEnd::Failed(format!("failed to launch plugin: {}", e)),
            },
            None => None,
        };

        let end = self.watch(&mut child);
        if let Some(mut child) = child {
            child.reap(TERMINATE_GRACE);
        }
        end
    }

    fn watch(&self, child: &mut Option<Box<dyn PluginProcess>>) -> RoundEnd {
        let mut state = self.signals.lock();
        loop {
            if state.cancelled {
                return RoundEnd::Cancelled;
            }
            if let Some(reason) = state.session_lost.take() {
                return RoundEnd::Failed(reason);
            }
            if let Some(process) = child.as_mut() {
                match process.exited() {
                    Ok(Some(status)) => {
                        *child = None;
                        return RoundEnd::Failed(format!("plugin exited: {}", status));
                    }
                    Ok(None) => (),
                    Err(e) => return RoundEnd::Failed(format!("plugin wait failed: {}", e)),
                }
            }
            self.signals.changed.wait_for(&mut state, self.poll_interval);
        }
    }
}

pub struct ArmPluginGate {
    interface: HapiInterface,
    status: Arc<ArmStatus>,
    signals: Arc<GateSignals>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    launcher: Option<Arc<dyn PluginLauncher>>,
    retry: RetryPolicy,
    poll_interval: Duration,
    log: Logger,
}

impl ArmPluginGate {
    /// Builds a gate. When `launcher` is `None` and the configuration names
    /// a plugin executable, that executable is launched.
    pub fn new(
        config: &GateConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn ArmDataStore>,
        launcher: Option<Arc<dyn PluginLauncher>>,
        log: Option<&Logger>,
    ) -> ArmPluginGate {
        ArmPluginGate::with_commands(
            config,
            transport,
            store,
            launcher,
            CommandDispatchTable::new(),
            log,
        )
    }

    /// Like [`new`](#method.new), with extra command handlers. They replace
    /// built-in handlers registered for the same code.
    pub fn with_commands(
        config: &GateConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn ArmDataStore>,
        launcher: Option<Arc<dyn PluginLauncher>>,
        commands: CommandDispatchTable,
        log: Option<&Logger>,
    ) -> ArmPluginGate {
        let address = config.effective_queue_address();
        let log = crate::logger(log).new(o!("component" => "gate"));

        let status = Arc::new(ArmStatus::new());
        let signals = Arc::new(GateSignals::default());

        let mut table = gate_commands(config, &store, &status);
        table.merge(commands);

        let hooks = Arc::new(GateHooks {
            signals: Arc::clone(&signals),
            status: Arc::clone(&status),
        });
        let interface = HapiInterface::new(Role::Gate, &address, transport, table, hooks, Some(&log));

        let launcher = launcher.or_else(|| {
            config.plugin_path.as_ref().map(|path| {
                Arc::new(CommandLauncher::new(path.clone(), &config.plugin_args))
                    as Arc<dyn PluginLauncher>
            })
        });

        ArmPluginGate {
            interface,
            status,
            signals,
            supervisor: Mutex::new(None),
            launcher,
            retry: config.retry.clone(),
            poll_interval: config.child_poll_interval(),
            log,
        }
    }

    pub fn interface(&self) -> &HapiInterface {
        &self.interface
    }

    /// Starts the supervisor thread.
    pub fn start(&self) -> Result<()> {
        let mut supervisor = self.supervisor.lock();
        if supervisor.is_some() {
            return Ok(());
        }
        self.signals.update(|s| *s = SignalState::default());

        let worker = Supervisor {
            interface: self.interface.clone(),
            signals: Arc::clone(&self.signals),
            status: Arc::clone(&self.status),
            launcher: self.launcher.clone(),
            retry: self.retry.clone(),
            poll_interval: self.poll_interval,
            log: self.log.clone(),
        };
        info!(self.log, "starting gate"; "address" => self.interface.address());
        let handle = thread::Builder::new()
            .name(format!("hapi-gate-supervisor-{}", self.interface.address()))
            .spawn(move || worker.run())?;
        *supervisor = Some(handle);
        Ok(())
    }

    /// Asks the plugin to terminate, then shuts the gate down.
    pub fn stop(&self) {
        info!(self.log, "stopping gate");
        if self.interface.is_initiated() {
            if let Err(e) = self
                .interface
                .send_oneway(HapiCommandCode::ReqTerminate.code(), &[])
            {
                warn!(self.log, "failed to send terminate"; "error" => %e);
            }
        }
        self.signals.update(|s| s.cancelled = true);
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(self.log, "supervisor panicked");
            }
        }
        self.interface.stop();
    }

    /// Waits for the first launch outcome. Returns false on failure or
    /// timeout. After a reconnect the outcome of the latest round counts.
    pub fn wait_for_launch(&self, timeout: Duration) -> bool {
        let mut guard = self.signals.lock();
        self.signals
            .changed
            .wait_while_for(&mut guard, |s| s.launch.is_none(), timeout);
        guard.launch.unwrap_or(false)
    }

    pub fn status(&self) -> ArmInfo {
        self.status.snapshot()
    }

    pub fn fetch_items(&self, host_id: u64) -> Result<ItemTablePtr> {
        let request = FetchRequest { host_id };
        self.interface
            .call_table(HapiCommandCode::ReqFetchItems.code(), &request.encode()?)
    }

    /// Requests items and returns at once; `on_reply` runs on the receive
    /// thread when the table arrives.
    pub fn start_fetch_items<F>(&self, host_id: u64, on_reply: F) -> Result<()>
    where
        F: FnOnce(Result<ItemTablePtr>) + Send + Sync + 'static,
    {
        let request = FetchRequest { host_id };
        self.interface.start_call(
            HapiCommandCode::ReqFetchItems.code(),
            &request.encode()?,
            move |res| on_reply(res.and_then(|body| table_from_bytes(&body))),
        )?;
        Ok(())
    }

    pub fn fetch_history(&self, request: &FetchHistoryRequest) -> Result<ItemTablePtr> {
        self.interface
            .call_table(HapiCommandCode::ReqFetchHistory.code(), &request.encode()?)
    }

    pub fn fetch_triggers(&self, host_id: u64) -> Result<ItemTablePtr> {
        let request = FetchRequest { host_id };
        self.interface
            .call_table(HapiCommandCode::ReqFetchTriggers.code(), &request.encode()?)
    }
}

impl Drop for ArmPluginGate {
    fn drop(&mut self) {
        self.signals.update(|s| s.cancelled = true);
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}
