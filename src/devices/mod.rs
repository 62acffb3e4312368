//! Served devices.
//!
//! A device class implements [`DeviceBackend`]; the server wraps each
//! backend in a [`DeviceImpl`] that owns the polling state of that device.

pub mod registry;
pub mod sim;

pub use registry::DeviceRegistry;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::data::{
    AttrData, AttrDataFormat, AttrDataType, AttrWriteType, AttributeValue, CmdValue, DevState,
};
use crate::error::{DevError, DsError};
use crate::events::EventChannel;
use crate::polling::{PollObjKind, PolledObject};
use crate::properties::PropertyStore;

/// Description of a device command.
#[derive(Clone, Debug)]
pub struct CmdInfo {
    pub name: String,
    /// Commands taking an input argument cannot be polled.
    pub takes_argin: bool,
}

impl CmdInfo {
    pub fn void(name: &str) -> Self {
        Self {
            name: name.to_string(),
            takes_argin: false,
        }
    }

    pub fn with_argin(name: &str) -> Self {
        Self {
            name: name.to_string(),
            takes_argin: true,
        }
    }
}

/// Description of a device attribute.
#[derive(Clone, Debug)]
pub struct AttrInfo {
    pub name: String,
    pub data_type: AttrDataType,
    pub format: AttrDataFormat,
    pub writable: AttrWriteType,
    /// `device/attribute` of the root attribute for forwarded attributes.
    pub forward_root: Option<String>,
    /// Polling period declared in code, 0 if none.
    pub polling_period_ms: u32,
}

impl AttrInfo {
    pub fn scalar(name: &str, data_type: AttrDataType) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            format: AttrDataFormat::Scalar,
            writable: AttrWriteType::Read,
            forward_root: None,
            polling_period_ms: 0,
        }
    }

    pub fn spectrum(name: &str, data_type: AttrDataType) -> Self {
        Self {
            format: AttrDataFormat::Spectrum,
            ..Self::scalar(name, data_type)
        }
    }

    pub fn writable(mut self, writable: AttrWriteType) -> Self {
        self.writable = writable;
        self
    }

    pub fn forwarded_to(mut self, root: &str) -> Self {
        self.forward_root = Some(root.to_string());
        self
    }

    pub fn polled_every(mut self, period_ms: u32) -> Self {
        self.polling_period_ms = period_ms;
        self
    }
}

/// A trait for the live side of one device.
///
/// This abstracts over device classes so the polling engine can be tested
/// against fake devices.
pub trait DeviceBackend: Send {
    /// User commands exposed by the device. State, Status and Init are added
    /// by the server.
    fn commands(&self) -> Vec<CmdInfo>;
    /// User attributes exposed by the device. State and Status are added by
    /// the server.
    fn attributes(&self) -> Vec<AttrInfo>;
    /// Execute a command.
    fn command_inout(&mut self, name: &str, argin: &CmdValue) -> Result<CmdValue, DevError>;
    /// Read a set of attributes in one call. One result per requested name,
    /// in order.
    fn read_attributes(&mut self, names: &[String]) -> Vec<Result<AttributeValue, DevError>>;
    /// Current device state.
    fn state(&mut self) -> Result<DevState, DevError> {
        Ok(DevState::On)
    }
    /// Current device status.
    fn status(&mut self) -> Result<String, DevError> {
        let state = self.state()?;
        Ok(format!("The device is in {state} state."))
    }
    /// Re-initialise the device.
    fn init(&mut self) -> Result<(), DevError> {
        Ok(())
    }
}

/// Polling-related device properties.
#[derive(Clone, Debug, Default)]
pub struct PollingProps {
    pub poll_ring_depth: Option<usize>,
    pub cmd_poll_ring_depth: Vec<String>,
    pub attr_poll_ring_depth: Vec<String>,
    pub min_poll_period: Option<u32>,
    pub cmd_min_poll_period: Vec<String>,
    pub attr_min_poll_period: Vec<String>,
    pub poll_old_factor: Option<u32>,
}

/// Defaults applied when a device does not define its own polling properties.
#[derive(Copy, Clone, Debug)]
pub struct PollingDefaults {
    pub ring_depth: usize,
    pub poll_old_factor: u32,
    pub min_poll_period_ms: u32,
}

/// The polled-object list of a device and its persisted polling lists.
///
/// Guarded by the device's poll monitor.
#[derive(Debug, Default)]
pub struct DevicePolling {
    pub objects: Vec<Arc<PolledObject>>,
    pub polled: bool,
    pub polled_cmd: Vec<String>,
    pub polled_attr: Vec<String>,
    pub non_auto_polled_cmd: Vec<String>,
    pub non_auto_polled_attr: Vec<String>,
}

impl DevicePolling {
    pub fn find(&self, kind: PollObjKind, name: &str) -> Option<&Arc<PolledObject>> {
        self.objects.iter().find(|o| o.is(kind, name))
    }

    pub fn position(&self, kind: PollObjKind, name: &str) -> Option<usize> {
        self.objects.iter().position(|o| o.is(kind, name))
    }

    /// The `polled_cmd` or `polled_attr` list.
    pub fn obj_list(&mut self, kind: PollObjKind) -> &mut Vec<String> {
        match kind {
            PollObjKind::Command => &mut self.polled_cmd,
            PollObjKind::Attribute => &mut self.polled_attr,
        }
    }

    pub fn non_auto_list(&mut self, kind: PollObjKind) -> &mut Vec<String> {
        match kind {
            PollObjKind::Command => &mut self.non_auto_polled_cmd,
            PollObjKind::Attribute => &mut self.non_auto_polled_attr,
        }
    }
}

/// One served device.
pub struct DeviceImpl {
    name: String,
    idl_version: u32,
    commands: Vec<CmdInfo>,
    attributes: Vec<AttrInfo>,
    // The device monitor: every live execution goes through it.
    backend: Mutex<Box<dyn DeviceBackend>>,
    // The poll monitor.
    poll: Mutex<DevicePolling>,
    props: PollingProps,
    defaults: PollingDefaults,
    attr_polling_periods: Mutex<HashMap<String, u32>>,
    lock_owner: Mutex<Option<String>>,
    events: Arc<EventChannel>,
}

impl std::fmt::Debug for DeviceImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceImpl")
            .field("name", &self.name)
            .field("idl_version", &self.idl_version)
            .finish()
    }
}

pub const STATE: &str = "state";
pub const STATUS: &str = "status";
pub const INIT: &str = "init";

impl DeviceImpl {
    pub fn new(
        name: &str,
        idl_version: u32,
        backend: Box<dyn DeviceBackend>,
        props: PollingProps,
        polling_lists: DevicePolling,
        defaults: PollingDefaults,
        events: Arc<EventChannel>,
    ) -> Self {
        let mut commands = vec![
            CmdInfo::void("State"),
            CmdInfo::void("Status"),
            CmdInfo::void("Init"),
        ];
        commands.extend(backend.commands());
        let mut attributes = backend.attributes();
        attributes.push(AttrInfo::scalar("State", AttrDataType::DevState));
        attributes.push(AttrInfo::scalar("Status", AttrDataType::DevString));
        let attr_polling_periods = attributes
            .iter()
            .map(|a| (a.name.to_lowercase(), a.polling_period_ms))
            .collect();

        Self {
            name: name.to_string(),
            idl_version,
            commands,
            attributes,
            backend: Mutex::new(backend),
            poll: Mutex::new(polling_lists),
            props,
            defaults,
            attr_polling_periods: Mutex::new(attr_polling_periods),
            lock_owner: Mutex::new(None),
            events,
        }
    }

    /// Build a device and load its polling configuration from the store.
    pub fn from_store(
        name: &str,
        idl_version: u32,
        backend: Box<dyn DeviceBackend>,
        store: &dyn PropertyStore,
        defaults: PollingDefaults,
        events: Arc<EventChannel>,
    ) -> Result<Self, DsError> {
        let get = |prop: &str| -> Result<Vec<String>, DsError> {
            Ok(store.get_device_property(name, prop)?.unwrap_or_default())
        };
        let parse_single = |prop: &str| -> Result<Option<u32>, DsError> {
            match get(prop)?.first() {
                Some(v) => v.trim().parse().map(Some).map_err(|_| {
                    DsError::BadConfigurationProperty(format!(
                        "System property {prop} for device {name} has wrong syntax"
                    ))
                }),
                None => Ok(None),
            }
        };

        let props = PollingProps {
            poll_ring_depth: parse_single("poll_ring_depth")?.map(|d| d as usize),
            cmd_poll_ring_depth: get("cmd_poll_ring_depth")?,
            attr_poll_ring_depth: get("attr_poll_ring_depth")?,
            min_poll_period: parse_single("min_poll_period")?,
            cmd_min_poll_period: get("cmd_min_poll_period")?,
            attr_min_poll_period: get("attr_min_poll_period")?,
            poll_old_factor: parse_single("poll_old_factor")?,
        };
        let lists = DevicePolling {
            polled_cmd: get("polled_cmd")?,
            polled_attr: get("polled_attr")?,
            non_auto_polled_cmd: get("non_auto_polled_cmd")?,
            non_auto_polled_attr: get("non_auto_polled_attr")?,
            ..Default::default()
        };
        Ok(Self::new(
            name,
            idl_version,
            backend,
            props,
            lists,
            defaults,
            events,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn idl_version(&self) -> u32 {
        self.idl_version
    }

    pub fn events(&self) -> &Arc<EventChannel> {
        &self.events
    }

    pub fn commands(&self) -> &[CmdInfo] {
        &self.commands
    }

    pub fn attributes(&self) -> &[AttrInfo] {
        &self.attributes
    }

    /// Take the poll monitor.
    pub fn poll(&self) -> MutexGuard<'_, DevicePolling> {
        self.poll.lock()
    }

    pub fn is_polled(&self) -> bool {
        self.poll.lock().polled
    }

    pub fn command_info(&self, name: &str) -> Result<&CmdInfo, DsError> {
        self.commands
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| DsError::CommandNotFound(name.to_string()))
    }

    /// Check the command exists and can be executed without input.
    pub fn check_command_exists(&self, name: &str) -> Result<(), DsError> {
        let info = self.command_info(name)?;
        if info.takes_argin {
            return Err(DsError::IncompatibleCmdArgument(format!(
                "Command {name} cannot be polled because it needs input value"
            )));
        }
        Ok(())
    }

    pub fn attr_info(&self, name: &str) -> Result<&AttrInfo, DsError> {
        self.attributes
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| DsError::AttrNotFound(name.to_string()))
    }

    /// Runtime polling period of an attribute, 0 when not polled.
    pub fn attr_polling_period(&self, name: &str) -> u32 {
        self.attr_polling_periods
            .lock()
            .get(&name.to_lowercase())
            .copied()
            .unwrap_or(0)
    }

    pub fn set_attr_polling_period(&self, name: &str, period_ms: u32) {
        self.attr_polling_periods
            .lock()
            .insert(name.to_lowercase(), period_ms);
    }

    pub fn poll_old_factor(&self) -> u32 {
        self.props
            .poll_old_factor
            .unwrap_or(self.defaults.poll_old_factor)
    }

    pub fn cmd_poll_ring_depth(&self, name: &str) -> Result<usize, DsError> {
        self.poll_ring_depth(&self.props.cmd_poll_ring_depth, "cmd_poll_ring_depth", name)
    }

    pub fn attr_poll_ring_depth(&self, name: &str) -> Result<usize, DsError> {
        self.poll_ring_depth(&self.props.attr_poll_ring_depth, "attr_poll_ring_depth", name)
    }

    pub fn ring_depth_for(&self, kind: PollObjKind, name: &str) -> Result<usize, DsError> {
        match kind {
            PollObjKind::Command => self.cmd_poll_ring_depth(name),
            PollObjKind::Attribute => self.attr_poll_ring_depth(name),
        }
    }

    fn poll_ring_depth(&self, list: &[String], prop: &str, name: &str) -> Result<usize, DsError> {
        match lookup_pair(list, name) {
            Some(v) => v.trim().parse().map_err(|_| {
                DsError::BadConfigurationProperty(format!(
                    "System property {prop} for device {} has wrong syntax",
                    self.name
                ))
            }),
            None => Ok(self
                .props
                .poll_ring_depth
                .unwrap_or(self.defaults.ring_depth)),
        }
    }

    /// Minimum authorized polling period for an object: the per-object
    /// override first, then the device `min_poll_period`, then the
    /// process-wide minimum. Zero means no minimum.
    pub fn min_poll_period_for(&self, kind: PollObjKind, name: &str) -> Result<u32, DsError> {
        let (list, prop) = match kind {
            PollObjKind::Command => (&self.props.cmd_min_poll_period, "cmd_min_poll_period"),
            PollObjKind::Attribute => (&self.props.attr_min_poll_period, "attr_min_poll_period"),
        };
        match lookup_pair(list, name) {
            Some(v) => v.trim().parse().map_err(|_| {
                DsError::BadConfigurationProperty(format!(
                    "System property {prop} for device {} has wrong syntax",
                    self.name
                ))
            }),
            None => Ok(self
                .props
                .min_poll_period
                .unwrap_or(self.defaults.min_poll_period_ms)),
        }
    }

    /// Take the exclusive client lock.
    pub fn lock(&self, client: &str) -> Result<(), DsError> {
        let mut owner = self.lock_owner.lock();
        match owner.as_deref() {
            Some(current) if current != client => Err(DsError::DeviceLocked(format!(
                "Device {} is already locked by another client",
                self.name
            ))),
            _ => {
                *owner = Some(client.to_string());
                Ok(())
            }
        }
    }

    pub fn unlock(&self, client: &str) -> Result<(), DsError> {
        let mut owner = self.lock_owner.lock();
        match owner.as_deref() {
            Some(current) if current != client => Err(DsError::DeviceLocked(format!(
                "Device {} is locked by another client, it cannot be unlocked",
                self.name
            ))),
            _ => {
                *owner = None;
                Ok(())
            }
        }
    }

    /// Refuse `operation` if another client holds the device lock.
    pub fn check_lock_owner(&self, client: Option<&str>, operation: &str) -> Result<(), DsError> {
        let owner = self.lock_owner.lock();
        match (owner.as_deref(), client) {
            (None, _) => Ok(()),
            (Some(current), Some(client)) if current == client => Ok(()),
            (Some(_), _) => Err(DsError::DeviceLocked(format!(
                "Device {} is locked by another client. {operation} not allowed",
                self.name
            ))),
        }
    }

    /// Execute a command on the device.
    pub fn command_inout(&self, name: &str, argin: &CmdValue) -> Result<CmdValue, DsError> {
        let info = self.command_info(name)?;
        let mut backend = self.backend.lock();
        let result = match info.name.to_lowercase().as_str() {
            STATE => backend.state().map(CmdValue::State),
            STATUS => backend.status().map(CmdValue::String),
            INIT => backend.init().map(|_| CmdValue::Void),
            _ => backend.command_inout(&info.name, argin),
        };
        Ok(result?)
    }

    /// Read attributes on the device, failing as a whole when one read fails.
    pub fn read_attributes(&self, names: &[String]) -> Result<Vec<AttributeValue>, DsError> {
        for name in names {
            self.attr_info(name)?;
        }
        self.read_attributes_for_polling(names)
            .into_iter()
            .map(|r| r.map_err(DsError::from))
            .collect()
    }

    /// Read attributes with one result per name. State and Status are served
    /// by the built-in handlers; the rest go to the backend in a single call.
    pub fn read_attributes_for_polling(
        &self,
        names: &[String],
    ) -> Vec<Result<AttributeValue, DevError>> {
        let mut backend = self.backend.lock();
        let user: Vec<String> = names
            .iter()
            .filter(|n| !is_state_or_status(n))
            .cloned()
            .collect();
        let mut user_values = if user.is_empty() {
            Vec::new()
        } else {
            backend.read_attributes(&user)
        }
        .into_iter();

        names
            .iter()
            .map(|n| match n.to_lowercase().as_str() {
                STATE => backend
                    .state()
                    .map(|s| AttributeValue::scalar("State", AttrData::StateScalar(s))),
                STATUS => backend
                    .status()
                    .map(|s| AttributeValue::scalar("Status", AttrData::String(vec![s]))),
                _ => user_values.next().unwrap_or_else(|| {
                    Err(DevError::new(
                        "API_IncoherentDevData",
                        format!("Device returned no value for attribute {n}"),
                        self.name.clone(),
                    ))
                }),
            })
            .collect()
    }

    /// Execute a command on behalf of the polling engine.
    pub fn execute_for_polling(&self, name: &str) -> Result<CmdValue, DevError> {
        self.command_inout(name, &CmdValue::Void)
            .map_err(|e| e.to_dev_error(&self.name))
    }
}

pub fn is_state_or_status(name: &str) -> bool {
    name.eq_ignore_ascii_case(STATE) || name.eq_ignore_ascii_case(STATUS)
}

/// Look up `name` in a flat `[name, value, name, value, ...]` list.
pub(crate) fn lookup_pair<'a>(list: &'a [String], name: &str) -> Option<&'a str> {
    list.chunks(2)
        .find(|pair| pair[0].eq_ignore_ascii_case(name))
        .and_then(|pair| pair.get(1))
        .map(String::as_str)
}
