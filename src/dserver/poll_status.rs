//! Polling status reports.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::time::{Duration, Instant};

use super::DServer;
use crate::devices::{is_state_or_status, DeviceImpl};
use crate::error::DsError;
use crate::polling::{PollObjKind, PolledObject};

/// Number of records used for the "delta between last records" line.
const DELTA_WINDOW: usize = 4;

/// Human-readable age: milliseconds below one second, seconds and
/// milliseconds below one minute, minutes with optional seconds and
/// milliseconds otherwise.
pub fn format_since(age: Duration) -> String {
    let secs = age.as_secs_f64();
    if secs < 1.0 {
        format!("{} mS", age.as_millis())
    } else if secs < 60.0 {
        format!("{} S and {} mS", age.as_secs(), age.subsec_millis())
    } else {
        let mut out = format!("{} MN", age.as_secs() / 60);
        let sec = age.as_secs() % 60;
        let msec = age.subsec_millis();
        if sec != 0 {
            let _ = write!(out, " ,{sec} S");
        }
        if msec != 0 {
            let _ = write!(out, " and {msec} mS");
        }
        out
    }
}

impl DServer {
    /// Names of the devices having at least one polled object, sorted.
    pub fn polled_device(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .registry
            .all()
            .into_iter()
            .filter(|d| d.is_polled())
            .map(|d| d.name().to_string())
            .collect();
        names.sort_by_key(|n| n.to_lowercase());
        names
    }

    /// One report per polled object of a device: commands first, then
    /// attributes. State and Status polled as attributes are reported in
    /// both sections.
    pub fn dev_poll_status(&self, device: &str) -> Result<Vec<String>, DsError> {
        let dev = self.registry.get(device)?;
        let objects: Vec<_> = dev.poll().objects.clone();
        if objects.is_empty() {
            return Ok(Vec::new());
        }

        // Declared names of the attributes read by the same call, per period.
        let mut polled_together: BTreeMap<Duration, Vec<String>> = BTreeMap::new();
        if !self.settings.polling_before_9 {
            for obj in objects.iter().filter(|o| o.kind() == PollObjKind::Attribute) {
                polled_together
                    .entry(obj.upd())
                    .or_default()
                    .push(declared_attr_name(&dev, obj.name()));
            }
        }

        let now = Instant::now();
        let mut cmd_section = Vec::new();
        let mut attr_section = Vec::new();
        for obj in &objects {
            let report = obj_status(&dev, obj, &polled_together, now);
            match obj.kind() {
                PollObjKind::Command => cmd_section.push(report),
                PollObjKind::Attribute => {
                    if is_state_or_status(obj.name()) {
                        cmd_section.push(report.replace("attribute", "command"));
                    }
                    attr_section.push(report);
                }
            }
        }
        cmd_section.extend(attr_section);
        Ok(cmd_section)
    }
}

fn declared_attr_name(dev: &DeviceImpl, name: &str) -> String {
    dev.attr_info(name)
        .map(|a| a.name.clone())
        .unwrap_or_else(|_| name.to_string())
}

fn declared_cmd_name(dev: &DeviceImpl, name: &str) -> String {
    dev.command_info(name)
        .map(|c| c.name.clone())
        .unwrap_or_else(|_| name.to_string())
}

fn obj_status(
    dev: &DeviceImpl,
    obj: &PolledObject,
    polled_together: &BTreeMap<Duration, Vec<String>>,
    now: Instant,
) -> String {
    let kind = obj.kind();
    let mut out = match kind {
        PollObjKind::Command => format!("Polled command name = {}", declared_cmd_name(dev, obj.name())),
        PollObjKind::Attribute => {
            format!("Polled attribute name = {}", declared_attr_name(dev, obj.name()))
        }
    };

    let inner = obj.lock();
    let upd = inner.upd();
    if upd.is_zero() {
        out.push_str("\nPolling externally triggered");
    } else {
        let _ = write!(out, "\nPolling period (mS) = {}", upd.as_millis());
    }
    let _ = write!(out, "\nPolling ring buffer depth = {}", inner.ring.depth());

    let (Some(needed), Some(since)) = (inner.ring.needed_time(), inner.ring.last_insert()) else {
        out.push_str("\nNo data recorded yet");
        return out;
    };

    if needed.is_zero() {
        out.push_str("\nThe polling buffer is externally filled in");
    } else if !upd.is_zero() {
        out.push_str("\nTime needed for the last ");
        match kind {
            PollObjKind::Command => out.push_str("command execution (mS) = "),
            PollObjKind::Attribute => match polled_together.get(&upd) {
                Some(names) if names.len() == 1 => out.push_str("attribute reading (mS) = "),
                Some(names) => {
                    let _ = write!(out, "attributes ({}) reading (mS) = ", names.join(" + "));
                }
                None => out.push_str("attribute reading(ms) = "),
            },
        }
        let _ = write!(out, "{:.3}", needed.as_secs_f64() * 1000.0);

        let age = now.saturating_duration_since(since).saturating_sub(needed);
        let _ = write!(out, "\nData not updated since {}", format_since(age));
    }

    if let Ok(deltas) = inner.ring.delta_t(DELTA_WINDOW) {
        let deltas: Vec<String> = deltas.iter().map(|d| d.as_millis().to_string()).collect();
        let _ = write!(out, "\nDelta between last records (in mS) = {}", deltas.join(", "));
    }

    if let Some(err) = inner.ring.last_error() {
        match kind {
            PollObjKind::Command => out.push_str("\nLast command execution FAILED :"),
            PollObjKind::Attribute => out.push_str("\nLast attribute read FAILED :"),
        }
        let _ = write!(
            out,
            "\n\tReason = {}\n\tDesc = {}\n\tOrigin = {}",
            err.reason, err.desc, err.origin
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn since_below_one_second() {
        assert_eq!(format_since(Duration::from_millis(250)), "250 mS");
    }

    #[test]
    fn since_below_one_minute() {
        assert_eq!(format_since(Duration::from_millis(12_345)), "12 S and 345 mS");
    }

    #[test]
    fn since_minutes() {
        assert_eq!(format_since(Duration::from_secs(120)), "2 MN");
        assert_eq!(format_since(Duration::from_millis(125_500)), "2 MN ,5 S and 500 mS");
        assert_eq!(format_since(Duration::from_millis(180_020)), "3 MN and 20 mS");
    }
}
