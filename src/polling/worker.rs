//! Polling worker threads.
//!
//! Each worker is one named OS thread owning the polled objects of a set of
//! devices. It sleeps until the next object is due or until a command shows
//! up in its mailbox, whichever comes first.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::Span;

use super::mailbox::Mailbox;
use super::poll_obj::{PollObjKind, PolledData, PolledObject};
use crate::data::AttributeValue;
use crate::devices::DeviceImpl;
use crate::error::{DevError, DsError};

/// A command for a polling worker.
#[derive(Debug)]
pub enum PollCmd {
    /// Start polling an object already pushed in the device's list.
    AddObj {
        device: Arc<DeviceImpl>,
        kind: PollObjKind,
        name: String,
        delay: Duration,
    },
    /// Stop polling a periodically polled object.
    RemObj {
        device: String,
        kind: PollObjKind,
        name: String,
    },
    /// Forget an externally triggered object.
    RemExtTrigObj {
        device: String,
        kind: PollObjKind,
        name: String,
    },
    /// Reschedule an object whose period has just been changed.
    UpdPeriod {
        device: Arc<DeviceImpl>,
        kind: PollObjKind,
        name: String,
        period: Duration,
    },
    /// Poll an externally triggered object once, now.
    Trigger {
        device: Arc<DeviceImpl>,
        kind: PollObjKind,
        name: String,
    },
    /// Forget every object of a device.
    RemDev { device: String },
    Start,
    Stop,
    Exit,
}

/// What travels through the mailbox: the command, when the request arrived
/// and the span of the request that sent it.
pub type PollCmdRequest = (PollCmd, Instant, Span);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Running,
    Stopped,
    Exiting,
}

struct WorkItem {
    device: Arc<DeviceImpl>,
    obj: Arc<PolledObject>,
    next: Instant,
}

impl WorkItem {
    fn is(&self, device: &str, kind: PollObjKind, name: &str) -> bool {
        self.device.name().eq_ignore_ascii_case(device) && self.obj.is(kind, name)
    }
}

struct Schedule {
    state: WorkerState,
    items: Vec<WorkItem>,
    ext_trig: Vec<WorkItem>,
}

struct Shared {
    id: usize,
    mailbox: Mailbox<PollCmdRequest>,
    schedule: Mutex<Schedule>,
    exit_requested: AtomicBool,
    nb_polled_objects: AtomicUsize,
    polling_before_9: bool,
}

/// Handle to one polling thread.
pub struct PollingWorker {
    shared: Arc<Shared>,
    thread_id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
    cmd_timeout: Duration,
}

impl std::fmt::Debug for PollingWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingWorker")
            .field("id", &self.shared.id)
            .field("thread_id", &self.thread_id)
            .finish()
    }
}

impl PollingWorker {
    /// Spawn a worker thread. It starts `Idle` and polls nothing until it
    /// receives `Start`.
    pub fn spawn(id: usize, cmd_timeout: Duration, polling_before_9: bool) -> Result<Self, DsError> {
        let shared = Arc::new(Shared {
            id,
            mailbox: Mailbox::new(),
            schedule: Mutex::new(Schedule {
                state: WorkerState::Idle,
                items: Vec::new(),
                ext_trig: Vec::new(),
            }),
            exit_requested: AtomicBool::new(false),
            nb_polled_objects: AtomicUsize::new(0),
            polling_before_9,
        });
        let handle = std::thread::Builder::new()
            .name(format!("polling-{id}"))
            .spawn({
                let shared = shared.clone();
                move || shared.run()
            })?;
        tracing::info!("Polling thread {} successfully spawned", id);
        Ok(Self {
            shared,
            thread_id: handle.thread().id(),
            handle: Mutex::new(Some(handle)),
            cmd_timeout,
        })
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn state(&self) -> WorkerState {
        self.shared.schedule.lock().state
    }

    pub fn nb_polled_objects(&self) -> usize {
        self.shared.nb_polled_objects.load(Ordering::Relaxed)
    }

    /// Whether the caller runs on this worker's own thread.
    pub fn is_current_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    /// Lower-cased names of the devices this worker polls.
    pub fn polled_devices(&self) -> Vec<String> {
        let schedule = self.shared.schedule.lock();
        let mut names: Vec<String> = schedule
            .items
            .iter()
            .chain(schedule.ext_trig.iter())
            .map(|i| i.device.name().to_lowercase())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Send a command. Commands from the worker's own thread are executed
    /// in place. Otherwise, wait for execution if `wait` is set.
    pub fn send(&self, cmd: PollCmd, wait: bool) -> Result<(), DsError> {
        if self.is_current_thread() {
            if self.shared.execute(cmd, Instant::now()) {
                self.request_exit();
            }
            return Ok(());
        }
        self.shared
            .mailbox
            .post((cmd, Instant::now(), Span::current()), wait, self.cmd_timeout)
    }

    /// Overwrite whatever is pending with `Exit`. Used to get rid of a
    /// worker whose first command timed out.
    pub fn cancel(&self) {
        self.shared
            .mailbox
            .force_post((PollCmd::Exit, Instant::now(), Span::current()));
    }

    /// Ask the worker to leave its loop once the current poll is done.
    pub fn request_exit(&self) {
        self.shared.exit_requested.store(true, Ordering::SeqCst);
    }

    /// Send `Exit` and wait for the thread to terminate.
    pub fn exit_and_join(&self) {
        self.shared
            .mailbox
            .force_post((PollCmd::Exit, Instant::now(), Span::current()));
        self.join();
    }

    pub fn join(&self) {
        if self.is_current_thread() {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            tracing::debug!("Joining polling thread {}", self.shared.id);
            if handle.join().is_err() {
                tracing::error!("Polling thread {} panicked", self.shared.id);
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|h| h.is_finished())
            .unwrap_or(true)
    }
}

/// Log the result of a worker command with timing information.
fn log_command_result(
    worker: usize,
    found: bool,
    request_arrival_time: Instant,
    command_start_time: Instant,
    ok_msg: &str,
    err_msg: &str,
) {
    if found {
        tracing::debug!(
            worker,
            time_to_command_done = ?request_arrival_time.elapsed(),
            polling_overhead = ?command_start_time - request_arrival_time,
            "{ok_msg}",
        );
    } else {
        tracing::warn!(
            worker,
            time_to_command_done = ?request_arrival_time.elapsed(),
            polling_overhead = ?command_start_time - request_arrival_time,
            "{err_msg}",
        );
    }
}

impl Shared {
    fn run(self: Arc<Self>) {
        loop {
            let deadline = self.next_deadline();
            if let Some((cmd, arrival, span)) = self.mailbox.wait_for_command(deadline) {
                let _span_guard = span.enter();
                let exit = self.execute(cmd, arrival);
                self.mailbox.complete();
                if exit {
                    break;
                }
            } else {
                self.poll_due();
            }
            if self.exit_requested.load(Ordering::SeqCst) {
                break;
            }
        }
        self.schedule.lock().state = WorkerState::Exiting;
        // Release anybody still waiting on a command we will never run.
        self.mailbox.complete();
        tracing::info!("Polling thread {} exiting", self.id);
    }

    fn next_deadline(&self) -> Option<Instant> {
        let schedule = self.schedule.lock();
        if schedule.state != WorkerState::Running {
            return None;
        }
        schedule.items.iter().map(|i| i.next).min()
    }

    /// Execute one command. Returns true when the worker must exit.
    fn execute(&self, cmd: PollCmd, request_arrival_time: Instant) -> bool {
        let command_start_time = Instant::now();
        match cmd {
            PollCmd::AddObj {
                device,
                kind,
                name,
                delay,
            } => {
                let obj = device.poll().find(kind, &name).cloned();
                let found = obj.is_some();
                if let Some(obj) = obj {
                    let upd = obj.upd();
                    let mut schedule = self.schedule.lock();
                    if upd.is_zero() {
                        schedule.ext_trig.push(WorkItem {
                            device: device.clone(),
                            obj,
                            next: command_start_time,
                        });
                    } else {
                        let next = self
                            .aligned_next(&schedule, &device, kind, upd)
                            .unwrap_or(command_start_time + delay);
                        schedule.items.push(WorkItem {
                            device: device.clone(),
                            obj,
                            next,
                        });
                    }
                    self.nb_polled_objects.fetch_add(1, Ordering::Relaxed);
                }
                log_command_result(
                    self.id,
                    found,
                    request_arrival_time,
                    command_start_time,
                    &format!("Polling of {kind} {name} on {} added", device.name()),
                    &format!("No polled {kind} {name} on {} to add", device.name()),
                );
            }
            PollCmd::RemObj { device, kind, name } | PollCmd::RemExtTrigObj { device, kind, name } => {
                let found = {
                    let mut schedule = self.schedule.lock();
                    let before = schedule.items.len() + schedule.ext_trig.len();
                    schedule.items.retain(|i| !i.is(&device, kind, &name));
                    schedule.ext_trig.retain(|i| !i.is(&device, kind, &name));
                    let removed = before - schedule.items.len() - schedule.ext_trig.len();
                    self.nb_polled_objects.fetch_sub(removed, Ordering::Relaxed);
                    removed > 0
                };
                log_command_result(
                    self.id,
                    found,
                    request_arrival_time,
                    command_start_time,
                    &format!("Polling of {kind} {name} on {device} removed"),
                    &format!("{kind} {name} on {device} was not polled by this thread"),
                );
            }
            PollCmd::UpdPeriod {
                device,
                kind,
                name,
                period,
            } => {
                let mut schedule = self.schedule.lock();
                let mut found = false;
                if let Some(pos) = schedule.items.iter().position(|i| i.is(device.name(), kind, &name)) {
                    found = true;
                    let mut item = schedule.items.remove(pos);
                    if period.is_zero() {
                        schedule.ext_trig.push(item);
                    } else {
                        item.next = self
                            .aligned_next(&schedule, &device, kind, period)
                            .unwrap_or(command_start_time + period);
                        schedule.items.push(item);
                    }
                } else if let Some(pos) = schedule
                    .ext_trig
                    .iter()
                    .position(|i| i.is(device.name(), kind, &name))
                {
                    found = true;
                    if !period.is_zero() {
                        let mut item = schedule.ext_trig.remove(pos);
                        item.next = command_start_time;
                        schedule.items.push(item);
                    }
                }
                drop(schedule);
                log_command_result(
                    self.id,
                    found,
                    request_arrival_time,
                    command_start_time,
                    &format!("Polling period of {kind} {name} set to {period:?}"),
                    &format!("Cannot update polling period of {kind} {name}: not polled"),
                );
            }
            PollCmd::Trigger { device, kind, name } => {
                let obj = self
                    .schedule
                    .lock()
                    .ext_trig
                    .iter()
                    .find(|i| i.is(device.name(), kind, &name))
                    .map(|i| i.obj.clone());
                let found = obj.is_some();
                if let Some(obj) = obj {
                    match kind {
                        PollObjKind::Command => poll_command(&device, &obj),
                        PollObjKind::Attribute => poll_attributes(&device, &[obj]),
                    }
                }
                log_command_result(
                    self.id,
                    found,
                    request_arrival_time,
                    command_start_time,
                    &format!("Polling of {kind} {name} triggered"),
                    &format!("Cannot trigger polling of {kind} {name}: not externally triggered"),
                );
            }
            PollCmd::RemDev { device } => {
                let mut schedule = self.schedule.lock();
                let before = schedule.items.len() + schedule.ext_trig.len();
                schedule
                    .items
                    .retain(|i| !i.device.name().eq_ignore_ascii_case(&device));
                schedule
                    .ext_trig
                    .retain(|i| !i.device.name().eq_ignore_ascii_case(&device));
                let removed = before - schedule.items.len() - schedule.ext_trig.len();
                self.nb_polled_objects.fetch_sub(removed, Ordering::Relaxed);
                drop(schedule);
                log_command_result(
                    self.id,
                    true,
                    request_arrival_time,
                    command_start_time,
                    &format!("{removed} polled object(s) of {device} removed"),
                    "",
                );
            }
            PollCmd::Start => {
                let mut schedule = self.schedule.lock();
                schedule.state = WorkerState::Running;
                for item in schedule.items.iter_mut() {
                    item.next = command_start_time;
                }
                drop(schedule);
                log_command_result(
                    self.id,
                    true,
                    request_arrival_time,
                    command_start_time,
                    "Polling started",
                    "",
                );
            }
            PollCmd::Stop => {
                self.schedule.lock().state = WorkerState::Stopped;
                log_command_result(
                    self.id,
                    true,
                    request_arrival_time,
                    command_start_time,
                    "Polling stopped",
                    "",
                );
            }
            PollCmd::Exit => return true,
        }
        false
    }

    /// Next due time of another attribute of the same device polled at the
    /// same period, so that both are read by one call.
    fn aligned_next(
        &self,
        schedule: &Schedule,
        device: &DeviceImpl,
        kind: PollObjKind,
        upd: Duration,
    ) -> Option<Instant> {
        if self.polling_before_9 || kind != PollObjKind::Attribute {
            return None;
        }
        schedule
            .items
            .iter()
            .find(|i| {
                i.obj.kind() == PollObjKind::Attribute
                    && i.device.name().eq_ignore_ascii_case(device.name())
                    && i.obj.upd() == upd
            })
            .map(|i| i.next)
    }

    /// Collect due objects, reschedule them, then run the polls without
    /// holding the schedule lock.
    fn poll_due(&self) {
        let now = Instant::now();
        let due: Vec<(Arc<DeviceImpl>, Arc<PolledObject>)> = {
            let mut schedule = self.schedule.lock();
            if schedule.state != WorkerState::Running {
                return;
            }
            schedule
                .items
                .iter_mut()
                .filter(|i| i.next <= now)
                .map(|i| {
                    let upd = i.obj.upd();
                    i.next += upd;
                    if i.next <= now {
                        i.next = now + upd;
                    }
                    (i.device.clone(), i.obj.clone())
                })
                .collect()
        };

        // Commands one by one, attributes grouped per (device, period).
        let mut groups: BTreeMap<(String, Duration), (Arc<DeviceImpl>, Vec<Arc<PolledObject>>)> =
            BTreeMap::new();
        for (device, obj) in due {
            match obj.kind() {
                PollObjKind::Command => poll_command(&device, &obj),
                PollObjKind::Attribute if self.polling_before_9 => {
                    poll_attributes(&device, &[obj])
                }
                PollObjKind::Attribute => {
                    groups
                        .entry((device.name().to_lowercase(), obj.upd()))
                        .or_insert_with(|| (device.clone(), Vec::new()))
                        .1
                        .push(obj);
                }
            }
        }
        for (_, (device, objs)) in groups {
            poll_attributes(&device, &objs);
        }
    }
}

fn poll_command(device: &DeviceImpl, obj: &PolledObject) {
    let start = Instant::now();
    let result = device.execute_for_polling(obj.name());
    let needed = start.elapsed();
    if let Err(e) = &result {
        tracing::debug!("Polling of command {} on {} failed: {}", obj.name(), device.name(), e);
    }
    obj.insert(result.map(PolledData::Command), start, needed);
}

fn as_attr_result(value: &Result<PolledData, DevError>) -> Option<Result<AttributeValue, DevError>> {
    match value {
        Ok(PolledData::Attribute(v)) => Some(Ok(v.clone())),
        Ok(PolledData::Command(_)) => None,
        Err(e) => Some(Err(e.clone())),
    }
}

/// Read a group of attributes with one device call and store each result.
pub(crate) fn poll_attributes(device: &DeviceImpl, objs: &[Arc<PolledObject>]) {
    let names: Vec<String> = objs.iter().map(|o| o.name().to_string()).collect();
    let start = Instant::now();
    let results = device.read_attributes_for_polling(&names);
    let needed = start.elapsed();
    let events = device.events();

    for (obj, result) in objs.iter().zip(results) {
        let previous = {
            let mut inner = obj.lock();
            let previous = inner.ring.latest().ok().and_then(|e| as_attr_result(&e.value));
            inner.push(
                result.clone().map(PolledData::Attribute),
                start,
                needed,
            );
            previous
        };
        events.fire_polled(device.name(), obj.name(), &result, previous.as_ref());
    }
}
