//! Cache-aware read path of the IDL 2 device interface.
//!
//! Reads name a source. `DEV` always executes on the device, `CACHE` only
//! serves the polling buffer and `CACHE_DEV` serves the buffer when it can,
//! falling back to a live execution when the object is not polled, has no
//! data yet or is not refreshed any more. Once the buffer has been found
//! usable, a failure while extracting the value (a failed poll, data that
//! cannot be converted) is returned to the caller whatever the source.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::data::{
    AttrData, AttrDataFormat, AttrDataType, AttrHistory, AttrQuality, AttrWriteType,
    AttributeValue, CmdHistory, CmdValue, DevSource, LongStringArray, ALL_ATTR, POLL_ATTRIBUTE,
};
use crate::devices::{is_state_or_status, AttrInfo, DeviceImpl, STATE};
use crate::dserver::DServer;
use crate::error::DsError;
use crate::polling::{PollObjKind, PolledData, PolledObject};

/// How long a read waits for the first poll of attributes it just started
/// polling.
const FIRST_POLL_WAIT: Duration = Duration::from_millis(600);

/// Extract a command result from a State or Status attribute value.
fn attr2cmd(value: &AttributeValue, state: bool) -> Result<CmdValue, DsError> {
    let converted = match (&value.data, state) {
        (AttrData::StateScalar(s), true) => Some(CmdValue::State(*s)),
        (AttrData::StateArray(states), true) => states.first().copied().map(CmdValue::State),
        (AttrData::String(strings), false) => strings.first().cloned().map(CmdValue::String),
        _ => None,
    };
    converted.ok_or_else(|| {
        DsError::IncoherentDevData(format!(
            "Can't extract {} from the value stored in the polling buffer",
            if state { "state" } else { "status" }
        ))
    })
}

fn to_cmd_value(data: &PolledData, name: &str, promoted: bool) -> Result<CmdValue, DsError> {
    match data {
        PolledData::Command(v) => Ok(v.clone()),
        PolledData::Attribute(v) if promoted => attr2cmd(v, name.eq_ignore_ascii_case(STATE)),
        PolledData::Attribute(_) => Err(DsError::IncoherentDevData(format!(
            "Polling buffer of command {name} holds attribute data"
        ))),
    }
}

/// Latest polled result of a command, converted for the caller.
fn last_cmd_result(obj: &PolledObject, name: &str, promoted: bool) -> Result<CmdValue, DsError> {
    let inner = obj.lock();
    match &inner.ring.latest()?.value {
        Ok(data) => to_cmd_value(data, name, promoted),
        Err(e) => Err(DsError::Device(e.clone())),
    }
}

/// Latest polled value of an attribute.
fn last_attr_value(obj: &PolledObject, info: &AttrInfo) -> Result<AttributeValue, DsError> {
    let inner = obj.lock();
    match &inner.ring.latest()?.value {
        Err(e) => Err(DsError::Device(e.clone())),
        Ok(PolledData::Attribute(v)) if v.quality == AttrQuality::Invalid => {
            let mut value = AttributeValue::invalid(&info.name);
            value.timestamp_ms = v.timestamp_ms;
            Ok(value)
        }
        Ok(PolledData::Attribute(_)) if info.data_type == AttrDataType::DevEncoded => {
            Err(DsError::NotSupportedFeature(format!(
                "Data type for attribute {} is DEV_ENCODED. It's not possible to retrieve \
                 this data type through the interface you are using (IDL V2)",
                info.name
            )))
        }
        Ok(PolledData::Attribute(v)) => Ok(v.clone()),
        Ok(PolledData::Command(_)) => Err(DsError::IncoherentDevData(format!(
            "Polling buffer of attribute {} holds command data",
            info.name
        ))),
    }
}

/// Fail unless the object has data fresh enough to be served.
fn check_usable(obj: &PolledObject, what: &str, name: &str) -> Result<(), DsError> {
    let inner = obj.lock();
    if inner.ring.is_empty() {
        return Err(DsError::NoDataYet(format!(
            "No data available in cache for {what} {name}"
        )));
    }
    if inner.is_stale(Instant::now()) {
        return Err(DsError::NotUpdatedAnyMore(format!(
            "Data in cache for {what} {name} not updated any more"
        )));
    }
    Ok(())
}

/// Whether a command is served from the buffer of the State or Status
/// attribute.
fn is_promoted(dev: &DeviceImpl, cmd: &str) -> bool {
    dev.idl_version() >= 3 && is_state_or_status(cmd)
}

fn lookup_polled_cmd(dev: &DeviceImpl, name: &str) -> Result<(Arc<PolledObject>, bool), DsError> {
    let cmd = name.to_lowercase();
    dev.check_command_exists(&cmd)?;
    let promoted = is_promoted(dev, &cmd);
    let kind = if promoted {
        PollObjKind::Attribute
    } else {
        PollObjKind::Command
    };
    let obj = dev
        .poll()
        .find(kind, &cmd)
        .cloned()
        .ok_or_else(|| DsError::CmdNotPolled(format!("Command {name} not polled")))?;
    check_usable(&obj, "command", name)?;
    Ok((obj, promoted))
}

impl DServer {
    /// Execute a command, possibly from the polling buffer.
    pub fn command_inout_2(
        &self,
        device: &str,
        name: &str,
        argin: &CmdValue,
        source: DevSource,
        client: Option<&str>,
    ) -> Result<CmdValue, DsError> {
        let dev = self.registry().get(device)?;
        tracing::debug!(
            "command_inout_2 arrived, source = {:?}, command = {}",
            source,
            name
        );
        if !is_state_or_status(name) {
            dev.check_lock_owner(client, "command_inout2")?;
        }
        if source == DevSource::Device {
            return dev.command_inout(name, argin);
        }

        match lookup_polled_cmd(&dev, name) {
            Ok((obj, promoted)) => {
                tracing::debug!("Returning data from polling buffer");
                last_cmd_result(&obj, name, promoted)
            }
            Err(e) if source == DevSource::Cache => Err(e),
            Err(e) => {
                tracing::debug!("Cache not usable for command {} ({}), executing it", name, e);
                dev.command_inout(name, argin)
            }
        }
    }

    /// Read attributes, possibly from the polling buffers. The whole read
    /// fails when one attribute fails.
    pub fn read_attributes_2(
        &self,
        device: &str,
        names: &[String],
        source: DevSource,
    ) -> Result<Vec<AttributeValue>, DsError> {
        let dev = self.registry().get(device)?;
        tracing::debug!("read_attributes_2 arrived, source = {:?}, names = {:?}", source, names);

        let all_attr = names.len() == 1 && names[0] == ALL_ATTR;
        if source == DevSource::Device {
            if all_attr {
                let every: Vec<String> = dev.attributes().iter().map(|a| a.name.clone()).collect();
                return dev.read_attributes(&every);
            }
            return dev.read_attributes(names);
        }

        let real_names: Vec<String> = if all_attr {
            dev.poll()
                .objects
                .iter()
                .filter(|o| o.kind() == PollObjKind::Attribute)
                .map(|o| o.name().to_string())
                .collect()
        } else {
            names.to_vec()
        };

        let polled = match self.lookup_polled_attrs(&dev, &real_names, all_attr) {
            Ok(polled) => polled,
            Err(e) if source == DevSource::Cache => return Err(e),
            Err(e) => {
                tracing::debug!("Cache not usable for {:?} ({}), reading the device", real_names, e);
                if all_attr {
                    let every: Vec<String> =
                        dev.attributes().iter().map(|a| a.name.clone()).collect();
                    return dev.read_attributes(&every);
                }
                return dev.read_attributes(&real_names);
            }
        };

        polled
            .iter()
            .map(|(obj, info)| last_attr_value(obj, info))
            .collect()
    }

    /// Resolve every requested attribute to a polled object holding fresh
    /// data. Attributes with a polling period declared in code are started
    /// on the fly.
    fn lookup_polled_attrs(
        &self,
        dev: &Arc<DeviceImpl>,
        names: &[String],
        all_attr: bool,
    ) -> Result<Vec<(Arc<PolledObject>, AttrInfo)>, DsError> {
        if !all_attr {
            for name in names {
                dev.attr_info(name)?;
            }
        }

        let to_start: Vec<(String, u32)> = {
            let poll = dev.poll();
            let mut to_start = Vec::new();
            for name in names {
                if poll.find(PollObjKind::Attribute, name).is_some() {
                    continue;
                }
                let period = dev.attr_polling_period(name);
                let non_auto = poll
                    .non_auto_polled_attr
                    .iter()
                    .any(|n| n.eq_ignore_ascii_case(name));
                if period == 0 || non_auto {
                    return Err(DsError::AttrNotPolled(format!("Attribute {name} not polled")));
                }
                to_start.push((name.clone(), period));
            }
            to_start
        };
        if !to_start.is_empty() {
            for (name, period) in &to_start {
                let argin = LongStringArray {
                    lvalue: vec![i64::from(*period)],
                    svalue: vec![dev.name().to_string(), POLL_ATTRIBUTE.to_string(), name.clone()],
                };
                self.add_obj_polling(&argin, false, Duration::ZERO, None)?;
            }
            std::thread::sleep(FIRST_POLL_WAIT);
        }

        let mut polled = Vec::with_capacity(names.len());
        for name in names {
            let obj = dev
                .poll()
                .find(PollObjKind::Attribute, name)
                .cloned()
                .ok_or_else(|| DsError::AttrNotPolled(format!("Attribute {name} not polled")))?;
            check_usable(&obj, "attribute", name)?;

            let info = dev.attr_info(name)?.clone();
            if matches!(info.format, AttrDataFormat::Spectrum | AttrDataFormat::Image)
                && info.writable != AttrWriteType::Read
            {
                return Err(DsError::NotSupportedFeature(format!(
                    "Client too old to get data for attribute {name}.\n\
                     Please, use a client linked with Tango V5 \
                     and a device inheriting from Device_3Impl"
                )));
            }
            polled.push((obj, info));
        }
        Ok(polled)
    }

    /// Up to `n` records of a polled command, most recent first.
    pub fn command_inout_history_2(
        &self,
        device: &str,
        name: &str,
        n: usize,
    ) -> Result<Vec<CmdHistory>, DsError> {
        let dev = self.registry().get(device)?;
        let cmd = name.to_lowercase();
        dev.check_command_exists(&cmd)?;
        let promoted = is_promoted(&dev, &cmd);
        let kind = if promoted {
            PollObjKind::Attribute
        } else {
            PollObjKind::Command
        };
        let obj = dev
            .poll()
            .find(kind, &cmd)
            .cloned()
            .ok_or_else(|| DsError::CmdNotPolled(format!("Command {name} not polled")))?;

        let inner = obj.lock();
        let records = inner.ring.history(n).map_err(|_| {
            DsError::NoDataYet(format!("No data available in cache for command {name}"))
        })?;
        records
            .into_iter()
            .map(|entry| {
                Ok(match &entry.value {
                    Ok(data) => CmdHistory {
                        timestamp_ms: entry.date_ms,
                        cmd_failed: false,
                        value: Some(to_cmd_value(data, name, promoted)?),
                        errors: Vec::new(),
                    },
                    Err(e) => CmdHistory {
                        timestamp_ms: entry.date_ms,
                        cmd_failed: true,
                        value: None,
                        errors: vec![e.clone()],
                    },
                })
            })
            .collect()
    }

    /// Up to `n` records of a polled attribute, most recent first.
    pub fn read_attribute_history_2(
        &self,
        device: &str,
        name: &str,
        n: usize,
    ) -> Result<Vec<AttrHistory>, DsError> {
        let dev = self.registry().get(device)?;
        dev.attr_info(name)?;
        let obj = dev
            .poll()
            .find(PollObjKind::Attribute, name)
            .cloned()
            .ok_or_else(|| DsError::AttrNotPolled(format!("Attribute {name} not polled")))?;

        let inner = obj.lock();
        let records = inner.ring.history(n).map_err(|_| {
            DsError::NoDataYet(format!("No data available in cache for attribute {name}"))
        })?;
        Ok(records
            .into_iter()
            .map(|entry| match &entry.value {
                Ok(PolledData::Attribute(v)) => AttrHistory {
                    timestamp_ms: entry.date_ms,
                    attr_failed: false,
                    value: Some(v.clone()),
                    errors: Vec::new(),
                },
                Ok(PolledData::Command(_)) => AttrHistory {
                    timestamp_ms: entry.date_ms,
                    attr_failed: false,
                    value: None,
                    errors: Vec::new(),
                },
                Err(e) => AttrHistory {
                    timestamp_ms: entry.date_ms,
                    attr_failed: true,
                    value: None,
                    errors: vec![e.clone()],
                },
            })
            .collect())
    }
}
