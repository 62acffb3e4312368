//! Assignment of devices to polling workers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::worker::PollingWorker;
use crate::error::DsError;
use crate::properties::unwrap_pool_conf;

/// How a device got its worker.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Assignment {
    /// The device was already assigned.
    Existing,
    /// A new worker was spawned for the device.
    Created,
    /// The device joined a worker polling other devices.
    Joined,
}

#[derive(Default)]
struct PoolInner {
    dev_to_worker: HashMap<String, usize>,
    workers: BTreeMap<usize, Arc<PollingWorker>>,
    members: BTreeMap<usize, Vec<String>>,
    preferred: Vec<Vec<String>>,
    next_id: usize,
}

/// The process-wide registry of polling workers.
///
/// Every membership change goes through one coarse lock. It is never held
/// while talking to a worker.
pub struct PollingThreadPool {
    inner: Mutex<PoolInner>,
    pool_size: usize,
    cmd_timeout: Duration,
    polling_before_9: bool,
}

impl PollingThreadPool {
    pub fn new(pool_size: usize, cmd_timeout: Duration, polling_before_9: bool) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                next_id: 1,
                ..Default::default()
            }),
            pool_size: pool_size.max(1),
            cmd_timeout,
            polling_before_9,
        }
    }

    pub fn cmd_timeout(&self) -> Duration {
        self.cmd_timeout
    }

    /// Load a pool configuration. Devices listed in the same entry end up
    /// on the same worker.
    pub fn preassign(&self, conf: &[String]) {
        let groups = unwrap_pool_conf(conf)
            .into_iter()
            .map(|entry| {
                entry
                    .split(',')
                    .map(|d| d.trim().to_lowercase())
                    .filter(|d| !d.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|g| !g.is_empty())
            .collect();
        self.inner.lock().preferred = groups;
    }

    /// Find or create the worker for a device.
    pub fn assign(&self, device: &str) -> Result<(Arc<PollingWorker>, Assignment), DsError> {
        let device = device.to_lowercase();
        let mut inner = self.inner.lock();

        if let Some(id) = inner.dev_to_worker.get(&device) {
            if let Some(worker) = inner.workers.get(id) {
                return Ok((worker.clone(), Assignment::Existing));
            }
        }

        let grouped_with = inner
            .preferred
            .iter()
            .find(|g| g.contains(&device))
            .and_then(|g| g.iter().find_map(|d| inner.dev_to_worker.get(d).copied()));

        let (id, assignment) = match grouped_with {
            Some(id) => (id, Assignment::Joined),
            None if inner.workers.len() < self.pool_size => {
                let id = inner.next_id;
                inner.next_id += 1;
                let worker = PollingWorker::spawn(id, self.cmd_timeout, self.polling_before_9)?;
                inner.workers.insert(id, Arc::new(worker));
                (id, Assignment::Created)
            }
            None => {
                let least_loaded = inner
                    .workers
                    .values()
                    .min_by_key(|w| w.nb_polled_objects())
                    .map(|w| w.id())
                    .ok_or_else(|| DsError::PollingThreadNotFound(device.clone()))?;
                (least_loaded, Assignment::Joined)
            }
        };

        inner.dev_to_worker.insert(device.clone(), id);
        inner.members.entry(id).or_default().push(device.clone());
        let worker = inner
            .workers
            .get(&id)
            .cloned()
            .ok_or_else(|| DsError::PollingThreadNotFound(device.clone()))?;
        tracing::debug!("Device {} assigned to polling thread {} ({:?})", device, id, assignment);
        Ok((worker, assignment))
    }

    /// Remove a device from its worker. Returns the worker when it has no
    /// device left; the caller is then responsible for terminating it.
    pub fn unassign(&self, device: &str) -> Option<Arc<PollingWorker>> {
        let device = device.to_lowercase();
        let mut inner = self.inner.lock();
        let id = inner.dev_to_worker.remove(&device)?;
        let now_empty = match inner.members.get_mut(&id) {
            Some(members) => {
                members.retain(|d| d != &device);
                members.is_empty()
            }
            None => true,
        };
        if !now_empty {
            return None;
        }
        inner.members.remove(&id);
        inner.workers.remove(&id)
    }

    pub fn worker_for(&self, device: &str) -> Option<Arc<PollingWorker>> {
        let inner = self.inner.lock();
        inner
            .dev_to_worker
            .get(&device.to_lowercase())
            .and_then(|id| inner.workers.get(id))
            .cloned()
    }

    pub fn workers(&self) -> Vec<Arc<PollingWorker>> {
        self.inner.lock().workers.values().cloned().collect()
    }

    pub fn devices_of(&self, worker_id: usize) -> Vec<String> {
        self.inner
            .lock()
            .members
            .get(&worker_id)
            .cloned()
            .unwrap_or_default()
    }

    /// One comma-joined entry per worker, in worker order.
    pub fn pool_conf(&self) -> Vec<String> {
        self.inner
            .lock()
            .members
            .values()
            .filter(|m| !m.is_empty())
            .map(|m| m.join(","))
            .collect()
    }

    /// Terminate every worker.
    pub fn shutdown(&self) {
        let workers: Vec<Arc<PollingWorker>> = {
            let mut inner = self.inner.lock();
            inner.dev_to_worker.clear();
            inner.members.clear();
            std::mem::take(&mut inner.workers).into_values().collect()
        };
        for worker in workers {
            worker.exit_and_join();
        }
    }
}
