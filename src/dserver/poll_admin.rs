//! Polling administration commands: add, update, remove and trigger.

use std::sync::Arc;
use std::time::Duration;

use super::{DServer, MIN_POLL_PERIOD_MS};
use crate::data::{
    AttrHistory, AttributeValue, CmdHistory, LongStringArray, LOCAL_POLL_REQUEST, POLL_ATTRIBUTE,
    POLL_COMMAND,
};
use crate::devices::{is_state_or_status, DeviceImpl, INIT};
use crate::error::{DevError, DsError};
use crate::polling::{Assignment, PollCmd, PollObjKind, PolledData, PolledObject};

/// Parse an object type token. The local request suffix means the request
/// comes from a polling thread, which must not wait for itself.
fn parse_obj_type(raw: &str) -> Result<(PollObjKind, bool), DsError> {
    let lower = raw.to_lowercase();
    let (base, local_request) = match lower.strip_suffix(LOCAL_POLL_REQUEST) {
        Some(base) => (base, true),
        None => (lower.as_str(), false),
    };
    match base {
        POLL_COMMAND => Ok((PollObjKind::Command, local_request)),
        POLL_ATTRIBUTE => Ok((PollObjKind::Attribute, local_request)),
        _ => Err(DsError::NotSupported(format!(
            "Object type {raw} not supported"
        ))),
    }
}

/// Devices speaking IDL 3 or later poll State and Status as attributes.
fn effective_kind(dev: &DeviceImpl, kind: PollObjKind, name: &str) -> PollObjKind {
    if kind == PollObjKind::Command && dev.idl_version() >= 3 && is_state_or_status(name) {
        PollObjKind::Attribute
    } else {
        kind
    }
}

fn capitalized(kind: PollObjKind) -> &'static str {
    match kind {
        PollObjKind::Command => "Command",
        PollObjKind::Attribute => "Attribute",
    }
}

fn polled_prop(kind: PollObjKind) -> &'static str {
    match kind {
        PollObjKind::Command => "polled_cmd",
        PollObjKind::Attribute => "polled_attr",
    }
}

fn non_auto_prop(kind: PollObjKind) -> &'static str {
    match kind {
        PollObjKind::Command => "non_auto_polled_cmd",
        PollObjKind::Attribute => "non_auto_polled_attr",
    }
}

fn pair_position(list: &[String], name: &str) -> Option<usize> {
    list.chunks(2)
        .position(|pair| pair[0].eq_ignore_ascii_case(name))
        .map(|i| i * 2)
}

/// Set the period of `name` in a flat name/period list, appending the pair
/// if it is not there yet.
fn upsert_pair(list: &mut Vec<String>, name: &str, period: i64) {
    match pair_position(list, name) {
        Some(pos) if pos + 1 < list.len() => list[pos + 1] = period.to_string(),
        Some(_) => list.push(period.to_string()),
        None => {
            list.push(name.to_string());
            list.push(period.to_string());
        }
    }
}

fn remove_pair(list: &mut Vec<String>, name: &str) -> bool {
    match pair_position(list, name) {
        Some(pos) => {
            let end = (pos + 2).min(list.len());
            list.drain(pos..end);
            true
        }
        None => false,
    }
}

impl DServer {
    fn check_upd_authorized(
        &self,
        dev: &DeviceImpl,
        kind: PollObjKind,
        name: &str,
        upd: i64,
    ) -> Result<(), DsError> {
        let min = i64::from(dev.min_poll_period_for(kind, name)?);
        if min != 0 && upd < min {
            return Err(DsError::NotSupported(format!(
                "Polling period for {kind} {name} is below the min authorized ({min})"
            )));
        }
        Ok(())
    }

    /// Validate a requested period and return it in milliseconds.
    fn check_period(upd: i64) -> Result<u32, DsError> {
        if upd != 0 && upd < MIN_POLL_PERIOD_MS {
            return Err(DsError::NotSupported(format!(
                "{upd} is below the min authorized period ({MIN_POLL_PERIOD_MS} mS)"
            )));
        }
        u32::try_from(upd).map_err(|_| {
            DsError::NotSupported(format!(
                "{upd} is above the max authorized period ({} mS)",
                u32::MAX
            ))
        })
    }

    /// Start polling one command or attribute.
    ///
    /// `argin` is `([period_ms], [device, type, name])`. With `with_db_upd`
    /// the device polling lists are written back to the store. The worker
    /// takes the first poll `delay` after receiving the object.
    pub fn add_obj_polling(
        &self,
        argin: &LongStringArray,
        with_db_upd: bool,
        delay: Duration,
        client: Option<&str>,
    ) -> Result<(), DsError> {
        if argin.svalue.len() != 3 || argin.lvalue.len() != 1 {
            return Err(DsError::WrongNumberOfArgs);
        }
        let dev = self.registry.get(&argin.svalue[0])?;
        tracing::debug!(
            "Receiving request to add polling for {} {} of device {}",
            argin.svalue[1],
            argin.svalue[2],
            dev.name()
        );
        dev.check_lock_owner(client, "AddObjPolling")?;

        let (kind, local_request) = parse_obj_type(&argin.svalue[1])?;
        let obj_name = argin.svalue[2].to_lowercase();
        match kind {
            PollObjKind::Command => {
                dev.check_command_exists(&obj_name)?;
                if obj_name == INIT {
                    return Err(DsError::NotSupported(
                        "It's not possible to poll the Init command!".to_string(),
                    ));
                }
            }
            PollObjKind::Attribute => {
                dev.attr_info(&obj_name)?;
            }
        }
        let kind = effective_kind(&dev, kind, &obj_name);

        if dev.poll().find(kind, &obj_name).is_some() {
            return Err(DsError::AlreadyPolled(format!(
                "{} {obj_name} already polled",
                capitalized(kind)
            )));
        }

        let upd = argin.lvalue[0];
        let period_ms = Self::check_period(upd)?;
        if upd != 0 {
            self.check_upd_authorized(&dev, kind, &obj_name, upd)?;
        }

        if kind == PollObjKind::Attribute {
            if let Some(root) = &dev.attr_info(&obj_name)?.forward_root {
                return Err(DsError::NotSupportedFeature(format!(
                    "Attribute {obj_name} is a forwarded attribute.\n\
                     It's not supported to poll a forwarded attribute.\n\
                     Polling has to be done on the root attribute ({root})"
                )));
            }
        }

        let depth = dev.ring_depth_for(kind, &obj_name)?;
        let obj = Arc::new(PolledObject::new(
            dev.name(),
            kind,
            &obj_name,
            Duration::from_millis(u64::from(period_ms)),
            depth,
            dev.poll_old_factor(),
        ));
        {
            let mut poll = dev.poll();
            if poll.find(kind, &obj_name).is_some() {
                return Err(DsError::AlreadyPolled(format!(
                    "{} {obj_name} already polled",
                    capitalized(kind)
                )));
            }
            poll.objects.push(obj);
        }

        let (worker, assignment) = match self.pool.assign(dev.name()) {
            Ok(assigned) => assigned,
            Err(e) => {
                self.forget_object(&dev, kind, &obj_name);
                return Err(e);
            }
        };

        let wait = !worker.is_current_thread() && !local_request;
        let sent = worker.send(
            PollCmd::AddObj {
                device: dev.clone(),
                kind,
                name: obj_name.clone(),
                delay,
            },
            wait,
        );
        if let Err(e) = sent {
            tracing::warn!(
                "Polling thread {} did not take {} {} of {}, rolling back",
                worker.id(),
                kind,
                obj_name,
                dev.name()
            );
            self.forget_object(&dev, kind, &obj_name);
            if assignment != Assignment::Existing && dev.poll().objects.is_empty() {
                if let Some(orphan) = self.pool.unassign(dev.name()) {
                    orphan.cancel();
                }
            }
            return Err(e);
        }

        if kind == PollObjKind::Attribute {
            dev.set_attr_polling_period(&obj_name, period_ms);
        }

        let (prop, value) = {
            let mut poll = dev.poll();
            poll.polled = true;
            let non_auto = poll.non_auto_list(kind);
            match non_auto.iter().position(|n| n.eq_ignore_ascii_case(&obj_name)) {
                Some(pos) => {
                    non_auto.remove(pos);
                    (non_auto_prop(kind), non_auto.clone())
                }
                None => {
                    let list = poll.obj_list(kind);
                    upsert_pair(list, &obj_name, upd);
                    (polled_prop(kind), list.clone())
                }
            }
        };
        if with_db_upd {
            self.persist_list(dev.name(), prop, &value)?;
        }

        if assignment == Assignment::Created && self.is_polling_on() {
            worker.send(PollCmd::Start, wait)?;
        }
        if assignment != Assignment::Existing {
            self.persist_pool_conf()?;
        }
        Ok(())
    }

    fn forget_object(&self, dev: &DeviceImpl, kind: PollObjKind, name: &str) {
        let mut poll = dev.poll();
        if let Some(pos) = poll.position(kind, name) {
            poll.objects.remove(pos);
        }
    }

    /// Change the period of an already polled object.
    pub fn upd_obj_polling_period(
        &self,
        argin: &LongStringArray,
        with_db_upd: bool,
        client: Option<&str>,
    ) -> Result<(), DsError> {
        if argin.svalue.len() != 3 || argin.lvalue.len() != 1 {
            return Err(DsError::WrongNumberOfArgs);
        }
        let dev = self.registry.get(&argin.svalue[0])?;
        if !dev.is_polled() {
            return Err(DsError::DeviceNotPolled(dev.name().to_string()));
        }
        dev.check_lock_owner(client, "UpdObjPollingPeriod")?;

        let (kind, _) = parse_obj_type(&argin.svalue[1])?;
        let obj_name = argin.svalue[2].to_lowercase();
        let kind = effective_kind(&dev, kind, &obj_name);
        let obj = dev
            .poll()
            .find(kind, &obj_name)
            .cloned()
            .ok_or_else(|| DsError::PollObjNotFound(obj_name.clone()))?;

        let upd = argin.lvalue[0];
        if upd != 0 {
            self.check_upd_authorized(&dev, kind, &obj_name, upd)?;
        }
        let period_ms = Self::check_period(upd)?;

        let worker = self
            .pool
            .worker_for(dev.name())
            .ok_or_else(|| DsError::PollingThreadNotFound(dev.name().to_string()))?;

        let period = Duration::from_millis(u64::from(period_ms));
        obj.update_upd(period);
        worker.send(
            PollCmd::UpdPeriod {
                device: dev.clone(),
                kind,
                name: obj_name.clone(),
                period,
            },
            false,
        )?;

        if kind == PollObjKind::Attribute {
            dev.set_attr_polling_period(&obj_name, period_ms);
        }
        let value = {
            let mut poll = dev.poll();
            let list = poll.obj_list(kind);
            upsert_pair(list, &obj_name, upd);
            list.clone()
        };
        if with_db_upd {
            self.persist_list(dev.name(), polled_prop(kind), &value)?;
        }
        Ok(())
    }

    /// Stop polling one command or attribute.
    pub fn rem_obj_polling(
        &self,
        argin: &[String],
        with_db_upd: bool,
        client: Option<&str>,
    ) -> Result<(), DsError> {
        if argin.len() != 3 {
            return Err(DsError::WrongNumberOfArgs);
        }
        let dev = self.registry.get(&argin[0])?;
        if !dev.is_polled() {
            return Err(DsError::DeviceNotPolled(dev.name().to_string()));
        }
        dev.check_lock_owner(client, "RemObjPolling")?;

        let (kind, local_request) = parse_obj_type(&argin[1])?;
        let obj_name = argin[2].to_lowercase();
        let kind = effective_kind(&dev, kind, &obj_name);
        let obj = dev
            .poll()
            .find(kind, &obj_name)
            .cloned()
            .ok_or_else(|| DsError::PollObjNotFound(obj_name.clone()))?;

        let worker = self
            .pool
            .worker_for(dev.name())
            .ok_or_else(|| DsError::PollingThreadNotFound(dev.name().to_string()))?;
        let wait = !worker.is_current_thread() && !local_request;
        let device = dev.name().to_string();
        let name = obj_name.clone();
        let cmd = if obj.upd().is_zero() {
            PollCmd::RemExtTrigObj { device, kind, name }
        } else {
            PollCmd::RemObj { device, kind, name }
        };
        worker.send(cmd, wait)?;

        let device_empty = {
            let mut poll = dev.poll();
            if let Some(pos) = poll.position(kind, &obj_name) {
                poll.objects.remove(pos);
            }
            if poll.objects.is_empty() {
                poll.polled = false;
            }
            poll.objects.is_empty()
        };
        if kind == PollObjKind::Attribute {
            dev.set_attr_polling_period(&obj_name, 0);
        }

        // An object missing from the polled list was configured in code:
        // remember it must not be polled automatically any more.
        let (prop, value) = {
            let mut poll = dev.poll();
            let list = poll.obj_list(kind);
            if remove_pair(list, &obj_name) {
                (polled_prop(kind), list.clone())
            } else {
                let non_auto = poll.non_auto_list(kind);
                if !non_auto.iter().any(|n| n.eq_ignore_ascii_case(&obj_name)) {
                    non_auto.push(obj_name.clone());
                }
                (non_auto_prop(kind), non_auto.clone())
            }
        };
        if with_db_upd {
            self.persist_list(dev.name(), prop, &value)?;
        }

        if device_empty {
            if let Some(worker) = self.pool.unassign(dev.name()) {
                tracing::debug!("Polling thread {} has no device left", worker.id());
                self.kill_worker(&worker);
            }
            self.persist_pool_conf()?;
        }

        if kind == PollObjKind::Attribute {
            self.events.fire_polling_stopped(dev.name(), &obj_name);
        }
        Ok(())
    }

    /// Poll an externally triggered object once.
    pub fn trigger_polling(&self, argin: &[String]) -> Result<(), DsError> {
        if argin.len() != 3 {
            return Err(DsError::WrongNumberOfArgs);
        }
        let dev = self.registry.get(&argin[0])?;
        if !dev.is_polled() {
            return Err(DsError::DeviceNotPolled(dev.name().to_string()));
        }
        let (kind, _) = parse_obj_type(&argin[1])?;
        let obj_name = argin[2].to_lowercase();
        let kind = effective_kind(&dev, kind, &obj_name);
        let obj = dev
            .poll()
            .find(kind, &obj_name)
            .cloned()
            .ok_or_else(|| DsError::PollObjNotFound(obj_name.clone()))?;
        if !obj.upd().is_zero() {
            return Err(DsError::NotSupported(format!(
                "Polling for {kind} {obj_name} (device {}) is not externally triggered.",
                dev.name()
            )));
        }
        let worker = self
            .pool
            .worker_for(dev.name())
            .ok_or_else(|| DsError::PollingThreadNotFound(dev.name().to_string()))?;
        worker.send(
            PollCmd::Trigger {
                device: dev.clone(),
                kind,
                name: obj_name,
            },
            !worker.is_current_thread(),
        )
    }

    /// Find an externally triggered object whose buffer the caller wants to
    /// fill.
    fn externally_filled(
        &self,
        dev: &DeviceImpl,
        kind: PollObjKind,
        name: &str,
    ) -> Result<Arc<PolledObject>, DsError> {
        let obj = dev.poll().find(kind, name).cloned().ok_or_else(|| match kind {
            PollObjKind::Command => DsError::CmdNotPolled(format!("Command {name} not polled")),
            PollObjKind::Attribute => {
                DsError::AttrNotPolled(format!("Attribute {name} not polled"))
            }
        })?;
        if !obj.upd().is_zero() {
            return Err(DsError::NotSupported(format!(
                "Polling for {kind} {name} (device {}) is not externally triggered.",
                dev.name()
            )));
        }
        Ok(obj)
    }

    /// Push caller-built records, oldest first, into the buffer of an
    /// externally triggered command.
    pub fn fill_cmd_polling_buffer(
        &self,
        device: &str,
        cmd_name: &str,
        records: Vec<CmdHistory>,
    ) -> Result<(), DsError> {
        let dev = self.registry.get(device)?;
        dev.check_command_exists(cmd_name)?;
        let obj = self.externally_filled(&dev, PollObjKind::Command, cmd_name)?;
        for record in records {
            let value = if record.cmd_failed {
                Err(first_error(record.errors, dev.name()))
            } else {
                Ok(PolledData::Command(record.value.unwrap_or_default()))
            };
            obj.insert_external(value, record.timestamp_ms);
        }
        Ok(())
    }

    /// Push caller-built records, oldest first, into the buffer of an
    /// externally triggered attribute.
    pub fn fill_attr_polling_buffer(
        &self,
        device: &str,
        attr_name: &str,
        records: Vec<AttrHistory>,
    ) -> Result<(), DsError> {
        let dev = self.registry.get(device)?;
        let info = dev.attr_info(attr_name)?;
        let obj = self.externally_filled(&dev, PollObjKind::Attribute, attr_name)?;
        for record in records {
            let value = if record.attr_failed {
                Err(first_error(record.errors, dev.name()))
            } else {
                Ok(PolledData::Attribute(
                    record
                        .value
                        .unwrap_or_else(|| AttributeValue::invalid(&info.name)),
                ))
            };
            obj.insert_external(value, record.timestamp_ms);
        }
        Ok(())
    }
}

fn first_error(errors: Vec<DevError>, device: &str) -> DevError {
    errors.into_iter().next().unwrap_or_else(|| {
        DevError::new(
            "API_IncoherentDevData",
            "Failed record without error description",
            device,
        )
    })
}
