//! The administration device of the server.
//!
//! `DServer` is the explicitly constructed context owning the served devices,
//! the polling thread pool and the property store. The admin commands of the
//! polling subsystem are implemented in `poll_admin` and `poll_status`, the
//! cache-aware read path in `crate::cache`.

mod poll_admin;
mod poll_status;

pub use poll_status::format_since;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::data::{CmdValue, LongStringArray, POLL_ATTRIBUTE, POLL_COMMAND};
use crate::devices::{lookup_pair, DeviceBackend, DeviceImpl, DeviceRegistry, PollingDefaults};
use crate::error::DsError;
use crate::events::EventChannel;
use crate::polling::{PollCmd, PollObjKind, PollingThreadPool, PollingWorker};
use crate::properties::{wrap_pool_conf, PropertyStore, MAX_DEV_PROP_LENGTH};

/// Smallest polling period accepted for a periodically polled object.
pub const MIN_POLL_PERIOD_MS: i64 = 5;

/// Default bound on the wait for a polling worker to take a command.
pub const DEFAULT_CMD_TIMEOUT: Duration = Duration::from_millis(3200);

pub const POOL_CONF_PROP: &str = "polling_threads_pool_conf";

/// Polling knobs shared by every device of the server.
#[derive(Clone, Debug)]
pub struct PollingSettings {
    pub ring_depth: usize,
    pub poll_old_factor: u32,
    /// Minimum period for devices defining no `min_poll_period`. 0 for none.
    pub min_poll_period_ms: u32,
    pub pool_size: usize,
    pub cmd_timeout: Duration,
    /// Read every polled attribute in its own call.
    pub polling_before_9: bool,
    /// Name of the admin device, under which the pool configuration is stored.
    pub admin_name: String,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            ring_depth: 10,
            poll_old_factor: 4,
            min_poll_period_ms: 0,
            pool_size: 1,
            cmd_timeout: DEFAULT_CMD_TIMEOUT,
            polling_before_9: false,
            admin_name: "dserver/dserverd/1".to_string(),
        }
    }
}

impl PollingSettings {
    pub fn device_defaults(&self) -> PollingDefaults {
        PollingDefaults {
            ring_depth: self.ring_depth,
            poll_old_factor: self.poll_old_factor,
            min_poll_period_ms: self.min_poll_period_ms,
        }
    }
}

pub struct DServer {
    registry: DeviceRegistry,
    pool: PollingThreadPool,
    store: Arc<dyn PropertyStore>,
    with_db: bool,
    settings: PollingSettings,
    events: Arc<EventChannel>,
    polling_on: AtomicBool,
    status: Mutex<String>,
}

fn polling_status_string(on: bool) -> String {
    let state = if on { "ON" } else { "OFF" };
    format!("The device is ON\nThe polling is {state}")
}

impl DServer {
    /// Build the server context. With `with_db` unset, the store is only
    /// read, never written.
    pub fn new(
        settings: PollingSettings,
        store: Arc<dyn PropertyStore>,
        with_db: bool,
    ) -> Result<Arc<Self>, DsError> {
        let pool = PollingThreadPool::new(
            settings.pool_size,
            settings.cmd_timeout,
            settings.polling_before_9,
        );
        if let Some(conf) = store.get_device_property(&settings.admin_name, POOL_CONF_PROP)? {
            pool.preassign(&conf);
        }
        Ok(Arc::new(Self {
            registry: DeviceRegistry::new(),
            pool,
            store,
            with_db,
            settings,
            events: Arc::new(EventChannel::new()),
            polling_on: AtomicBool::new(true),
            status: Mutex::new(polling_status_string(true)),
        }))
    }

    /// Register a device, loading its polling configuration from the store.
    pub fn add_device(
        &self,
        name: &str,
        idl_version: u32,
        backend: Box<dyn DeviceBackend>,
    ) -> Result<Arc<DeviceImpl>, DsError> {
        let device = Arc::new(DeviceImpl::from_store(
            name,
            idl_version,
            backend,
            self.store.as_ref(),
            self.settings.device_defaults(),
            self.events.clone(),
        )?);
        self.registry.insert(device.clone());
        tracing::info!("Device {} registered (IDL {})", name, idl_version);
        Ok(device)
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &PollingThreadPool {
        &self.pool
    }

    pub fn events(&self) -> &Arc<EventChannel> {
        &self.events
    }

    pub fn settings(&self) -> &PollingSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn PropertyStore> {
        &self.store
    }

    pub fn with_db(&self) -> bool {
        self.with_db
    }

    pub fn is_polling_on(&self) -> bool {
        self.polling_on.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> String {
        self.status.lock().clone()
    }

    /// Start polling every device according to its stored configuration.
    ///
    /// Objects listed in `polled_cmd` / `polled_attr` are added first, then
    /// attributes declaring a polling period in code unless the device lists
    /// them in `non_auto_polled_attr`. The first poll of the objects of one
    /// device is spread over their period.
    pub fn configure_polling(&self) {
        for device in self.registry.all() {
            let mut wanted: Vec<(&str, String, i64)> = Vec::new();
            {
                let poll = device.poll();
                for (kind, list) in [
                    (POLL_COMMAND, &poll.polled_cmd),
                    (POLL_ATTRIBUTE, &poll.polled_attr),
                ] {
                    for pair in list.chunks(2) {
                        match pair.get(1).map(|p| p.trim().parse::<i64>()) {
                            Some(Ok(period)) => wanted.push((kind, pair[0].clone(), period)),
                            _ => tracing::warn!(
                                "Bad polling configuration for {} {} on {}, ignored",
                                kind,
                                pair[0],
                                device.name()
                            ),
                        }
                    }
                }
                for attr in device.attributes() {
                    if attr.polling_period_ms == 0
                        || lookup_pair(&poll.polled_attr, &attr.name).is_some()
                        || poll
                            .non_auto_polled_attr
                            .iter()
                            .any(|n| n.eq_ignore_ascii_case(&attr.name))
                    {
                        continue;
                    }
                    wanted.push((POLL_ATTRIBUTE, attr.name.clone(), attr.polling_period_ms as i64));
                }
            }

            let nb = wanted.len() as u64;
            for (i, (kind, name, period)) in wanted.into_iter().enumerate() {
                let delay = Duration::from_millis(period.max(0) as u64 * i as u64 / nb.max(1));
                let argin = LongStringArray {
                    lvalue: vec![period],
                    svalue: vec![device.name().to_string(), kind.to_string(), name.clone()],
                };
                if let Err(e) = self.add_obj_polling(&argin, false, delay, None) {
                    tracing::warn!(
                        "Cannot start polling {} {} on {}: {}",
                        kind,
                        name,
                        device.name(),
                        e
                    );
                }
            }
        }
    }

    /// Send `cmd` to every worker and wait for each of them.
    fn broadcast(&self, cmd: fn() -> PollCmd) -> Result<(), DsError> {
        for worker in self.pool.workers() {
            worker.send(cmd(), !worker.is_current_thread())?;
        }
        Ok(())
    }

    pub fn start_polling(&self) -> Result<(), DsError> {
        self.broadcast(|| PollCmd::Start)?;
        self.polling_on.store(true, Ordering::SeqCst);
        *self.status.lock() = polling_status_string(true);
        Ok(())
    }

    pub fn stop_polling(&self) -> Result<(), DsError> {
        self.broadcast(|| PollCmd::Stop)?;
        self.polling_on.store(false, Ordering::SeqCst);
        *self.status.lock() = polling_status_string(false);
        Ok(())
    }

    /// Stop polling everything on one device and release its worker.
    pub fn stop_device_polling(&self, device: &str) -> Result<(), DsError> {
        let dev = self.registry.get(device)?;
        if let Some(worker) = self.pool.worker_for(dev.name()) {
            worker.send(
                PollCmd::RemDev {
                    device: dev.name().to_string(),
                },
                !worker.is_current_thread(),
            )?;
        }
        {
            let mut poll = dev.poll();
            for obj in poll.objects.drain(..) {
                if obj.kind() == PollObjKind::Attribute {
                    dev.set_attr_polling_period(obj.name(), 0);
                }
            }
            poll.polled = false;
        }
        if let Some(worker) = self.pool.unassign(dev.name()) {
            self.kill_worker(&worker);
        }
        self.persist_pool_conf()?;
        tracing::info!("Polling of device {} stopped", dev.name());
        Ok(())
    }

    /// Terminate a worker left without devices. A worker cannot join itself,
    /// so from its own thread it is only asked to leave its loop.
    fn kill_worker(&self, worker: &PollingWorker) {
        if worker.is_current_thread() {
            worker.request_exit();
        } else {
            worker.exit_and_join();
        }
    }

    /// Store the pool configuration when a database is in use.
    fn persist_pool_conf(&self) -> Result<(), DsError> {
        if !self.with_db {
            return Ok(());
        }
        let conf = wrap_pool_conf(&self.pool.pool_conf(), MAX_DEV_PROP_LENGTH);
        if conf.is_empty() {
            self.store
                .delete_device_property(&self.settings.admin_name, POOL_CONF_PROP)
        } else {
            self.store
                .put_device_property(&self.settings.admin_name, POOL_CONF_PROP, &conf)
        }
    }

    /// Write or delete one device property, when a database is in use.
    fn persist_list(&self, device: &str, prop: &str, value: &[String]) -> Result<(), DsError> {
        if !self.with_db {
            return Ok(());
        }
        if value.is_empty() {
            self.store.delete_device_property(device, prop)
        } else {
            self.store.put_device_property(device, prop, value)
        }
    }

    /// Terminate every polling worker.
    pub fn shutdown(&self) {
        tracing::info!("Shutting down polling threads");
        self.pool.shutdown();
    }

    /// Snapshot of the device to worker assignment.
    pub fn pool_assignment(&self) -> HashMap<usize, Vec<String>> {
        self.pool
            .workers()
            .iter()
            .map(|w| (w.id(), self.pool.devices_of(w.id())))
            .collect()
    }
}

/// An administration command of the server.
#[derive(Debug)]
pub enum AdminCommand {
    AddObjPolling { argin: LongStringArray },
    UpdObjPollingPeriod { argin: LongStringArray },
    RemObjPolling { argin: Vec<String> },
    TriggerPolling { argin: Vec<String> },
    PolledDevice,
    DevPollStatus { device: String },
    StartPolling,
    StopPolling,
}

/// Log the result of an admin command with timing information.
fn log_command_result<T>(
    result: &Result<T, DsError>,
    request_arrival_time: Instant,
    command_start_time: Instant,
    ok_msg: &str,
    err_msg: &str,
) {
    match result {
        Ok(_) => tracing::info!(
            time_to_command_done = ?request_arrival_time.elapsed(),
            dserverd_overhead = ?command_start_time - request_arrival_time,
            "{ok_msg}",
        ),
        Err(e) => tracing::warn!(
            time_to_command_done = ?request_arrival_time.elapsed(),
            dserverd_overhead = ?command_start_time - request_arrival_time,
            reason = e.reason(),
            "{err_msg}: {e}",
        ),
    }
}

impl AdminCommand {
    pub fn execute(
        &self,
        server: &DServer,
        client: Option<&str>,
        request_arrival_time: Instant,
    ) -> Result<CmdValue, DsError> {
        let command_start_time = Instant::now();
        match self {
            Self::AddObjPolling { argin } => {
                let result = server
                    .add_obj_polling(argin, true, Duration::ZERO, client)
                    .map(|_| CmdValue::Void);
                log_command_result(
                    &result,
                    request_arrival_time,
                    command_start_time,
                    &format!("Polling added for {:?} every {:?} ms", argin.svalue, argin.lvalue),
                    &format!("Cannot add polling for {:?}", argin.svalue),
                );
                result
            }
            Self::UpdObjPollingPeriod { argin } => {
                let result = server
                    .upd_obj_polling_period(argin, true, client)
                    .map(|_| CmdValue::Void);
                log_command_result(
                    &result,
                    request_arrival_time,
                    command_start_time,
                    &format!("Polling period of {:?} set to {:?} ms", argin.svalue, argin.lvalue),
                    &format!("Cannot update polling period of {:?}", argin.svalue),
                );
                result
            }
            Self::RemObjPolling { argin } => {
                let result = server
                    .rem_obj_polling(argin, true, client)
                    .map(|_| CmdValue::Void);
                log_command_result(
                    &result,
                    request_arrival_time,
                    command_start_time,
                    &format!("Polling removed for {argin:?}"),
                    &format!("Cannot remove polling for {argin:?}"),
                );
                result
            }
            Self::TriggerPolling { argin } => {
                let result = server.trigger_polling(argin).map(|_| CmdValue::Void);
                log_command_result(
                    &result,
                    request_arrival_time,
                    command_start_time,
                    &format!("Polling triggered for {argin:?}"),
                    &format!("Cannot trigger polling for {argin:?}"),
                );
                result
            }
            Self::PolledDevice => Ok(CmdValue::StringArray(server.polled_device())),
            Self::DevPollStatus { device } => {
                server.dev_poll_status(device).map(CmdValue::StringArray)
            }
            Self::StartPolling => {
                let result = server.start_polling().map(|_| CmdValue::Void);
                log_command_result(
                    &result,
                    request_arrival_time,
                    command_start_time,
                    "Polling started",
                    "Cannot start polling",
                );
                result
            }
            Self::StopPolling => {
                let result = server.stop_polling().map(|_| CmdValue::Void);
                log_command_result(
                    &result,
                    request_arrival_time,
                    command_start_time,
                    "Polling stopped",
                    "Cannot stop polling",
                );
                result
            }
        }
    }
}
