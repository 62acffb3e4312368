//! Device property storage.
//!
//! Polling configuration survives restarts through a property store. The
//! daemon uses a JSON file when one is configured and an in-memory map
//! otherwise.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::DsError;

/// Maximum length of one property line.
pub const MAX_DEV_PROP_LENGTH: usize = 255;

type PropMap = BTreeMap<String, BTreeMap<String, Vec<String>>>;

/// A trait for the property database.
pub trait PropertyStore: Send + Sync {
    /// Read a device property. `None` if it is not defined.
    fn get_device_property(&self, device: &str, name: &str) -> Result<Option<Vec<String>>, DsError>;
    /// Create or overwrite a device property.
    fn put_device_property(&self, device: &str, name: &str, value: &[String]) -> Result<(), DsError>;
    /// Remove a device property.
    fn delete_device_property(&self, device: &str, name: &str) -> Result<(), DsError>;
}

/// Store that keeps everything in memory.
#[derive(Default)]
pub struct MemoryPropertyStore {
    props: Mutex<PropMap>,
}

impl MemoryPropertyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PropertyStore for MemoryPropertyStore {
    fn get_device_property(&self, device: &str, name: &str) -> Result<Option<Vec<String>>, DsError> {
        Ok(get(&self.props.lock(), device, name))
    }

    fn put_device_property(&self, device: &str, name: &str, value: &[String]) -> Result<(), DsError> {
        put(&mut self.props.lock(), device, name, value);
        Ok(())
    }

    fn delete_device_property(&self, device: &str, name: &str) -> Result<(), DsError> {
        delete(&mut self.props.lock(), device, name);
        Ok(())
    }
}

/// Store backed by a JSON file, rewritten on every change.
pub struct FilePropertyStore {
    path: PathBuf,
    props: Mutex<PropMap>,
}

impl FilePropertyStore {
    /// Open the store, creating an empty one if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DsError> {
        let path = path.as_ref().to_path_buf();
        let props = if path.exists() {
            let text = fs::read_to_string(&path)?;
            if text.trim().is_empty() {
                PropMap::new()
            } else {
                serde_json::from_str(&text)?
            }
        } else {
            PropMap::new()
        };
        tracing::info!("Loaded property file {}", path.display());
        Ok(Self {
            path,
            props: Mutex::new(props),
        })
    }

    fn save(&self, props: &PropMap) -> Result<(), DsError> {
        let text = serde_json::to_string_pretty(props)?;
        fs::write(&self.path, text)?;
        Ok(())
    }
}

impl PropertyStore for FilePropertyStore {
    fn get_device_property(&self, device: &str, name: &str) -> Result<Option<Vec<String>>, DsError> {
        Ok(get(&self.props.lock(), device, name))
    }

    fn put_device_property(&self, device: &str, name: &str, value: &[String]) -> Result<(), DsError> {
        let mut props = self.props.lock();
        put(&mut props, device, name, value);
        self.save(&props)
    }

    fn delete_device_property(&self, device: &str, name: &str) -> Result<(), DsError> {
        let mut props = self.props.lock();
        delete(&mut props, device, name);
        self.save(&props)
    }
}

fn get(props: &PropMap, device: &str, name: &str) -> Option<Vec<String>> {
    props
        .get(&device.to_lowercase())
        .and_then(|d| d.get(&name.to_lowercase()))
        .cloned()
}

fn put(props: &mut PropMap, device: &str, name: &str, value: &[String]) {
    props
        .entry(device.to_lowercase())
        .or_default()
        .insert(name.to_lowercase(), value.to_vec());
}

fn delete(props: &mut PropMap, device: &str, name: &str) {
    let device = device.to_lowercase();
    if let Some(d) = props.get_mut(&device) {
        d.remove(&name.to_lowercase());
        if d.is_empty() {
            props.remove(&device);
        }
    }
}

/// Split pool configuration entries longer than `max_len` into several
/// lines. Every line but the last of an entry ends with `\`.
pub fn wrap_pool_conf(entries: &[String], max_len: usize) -> Vec<String> {
    let mut lines = Vec::with_capacity(entries.len());
    for entry in entries {
        let chars: Vec<char> = entry.chars().collect();
        let nb_lines = chars.len() / max_len + 1;
        if nb_lines == 1 {
            lines.push(entry.clone());
            continue;
        }
        for (i, chunk) in chars.chunks(max_len).enumerate() {
            let mut line: String = chunk.iter().collect();
            if i < nb_lines - 1 {
                line.push('\\');
            }
            lines.push(line);
        }
        if chars.len() % max_len == 0 {
            // The entry filled its last chunk exactly: that chunk got a
            // continuation marker, so close it with an empty line.
            lines.push(String::new());
        }
    }
    lines
}

/// Join continuation lines back into pool configuration entries.
pub fn unwrap_pool_conf(lines: &[String]) -> Vec<String> {
    let mut entries = Vec::new();
    let mut current = String::new();
    let mut continued = false;
    for line in lines {
        match line.strip_suffix('\\') {
            Some(head) => {
                current.push_str(head);
                continued = true;
            }
            None => {
                current.push_str(line);
                if !current.is_empty() {
                    entries.push(std::mem::take(&mut current));
                }
                continued = false;
            }
        }
    }
    if continued && !current.is_empty() {
        entries.push(current);
    }
    entries
}
