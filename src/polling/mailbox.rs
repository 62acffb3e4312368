//! Single-slot command mailbox between request threads and a polling worker.
//!
//! A sender may only post while no other command is pending, and optionally
//! blocks until the worker reports completion. Both waits are bounded. A
//! waiting sender whose command is overwritten by `force_post` gets an error.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::DsError;

#[derive(Debug)]
struct Slot<T> {
    cmd: Option<T>,
    pending: bool,
    posted: u64,
    completed: u64,
    // Tickets of senders blocked until completion.
    waiting: Vec<u64>,
    // Waited-for tickets overwritten before the worker took them.
    superseded: Vec<u64>,
}

#[derive(Debug)]
pub struct Mailbox<T> {
    slot: Mutex<Slot<T>>,
    cond: Condvar,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                cmd: None,
                pending: false,
                posted: 0,
                completed: 0,
                waiting: Vec::new(),
                superseded: Vec::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Post a command. When `wait` is set, block until the worker has
    /// executed it. Either wait failing within `timeout` is reported as
    /// `CommandTimedOut`; a command already posted stays in the slot.
    pub fn post(&self, cmd: T, wait: bool, timeout: Duration) -> Result<(), DsError> {
        let mut slot = self.slot.lock();
        if slot.pending {
            let deadline = Instant::now() + timeout;
            self.cond
                .wait_while_until(&mut slot, |s| s.pending, deadline);
            if slot.pending {
                return Err(DsError::CommandTimedOut(
                    "Polling thread blocked !!!".to_string(),
                ));
            }
        }
        slot.cmd = Some(cmd);
        slot.pending = true;
        slot.posted += 1;
        let ticket = slot.posted;
        self.cond.notify_all();

        if !wait {
            return Ok(());
        }
        slot.waiting.push(ticket);
        let deadline = Instant::now() + timeout;
        self.cond.wait_while_until(
            &mut slot,
            |s| s.completed < ticket && !s.superseded.contains(&ticket),
            deadline,
        );
        slot.waiting.retain(|t| *t != ticket);
        let superseded = slot.superseded.contains(&ticket);
        slot.superseded.retain(|t| *t != ticket);

        if superseded {
            return Err(DsError::CommandTimedOut(
                "Polling thread command replaced before execution".to_string(),
            ));
        }
        if slot.completed < ticket {
            return Err(DsError::CommandTimedOut(
                "Polling thread blocked !!!".to_string(),
            ));
        }
        Ok(())
    }

    /// Overwrite the slot regardless of what is pending. A sender waiting
    /// for the overwritten command is released with an error.
    pub fn force_post(&self, cmd: T) {
        let mut slot = self.slot.lock();
        let overwritten = slot.posted;
        if slot.cmd.is_some() && slot.waiting.contains(&overwritten) {
            slot.superseded.push(overwritten);
        }
        slot.cmd = Some(cmd);
        slot.pending = true;
        slot.posted += 1;
        self.cond.notify_all();
    }

    /// Worker side: wait for a command until `deadline` (forever if `None`).
    pub fn wait_for_command(&self, deadline: Option<Instant>) -> Option<T> {
        let mut slot = self.slot.lock();
        match deadline {
            Some(deadline) => {
                self.cond
                    .wait_while_until(&mut slot, |s| s.cmd.is_none(), deadline);
            }
            None => self.cond.wait_while(&mut slot, |s| s.cmd.is_none()),
        }
        slot.cmd.take()
    }

    /// Worker side: take a command without waiting.
    pub fn try_take(&self) -> Option<T> {
        self.slot.lock().cmd.take()
    }

    /// Worker side: mark every posted command as executed and wake senders.
    pub fn complete(&self) {
        let mut slot = self.slot.lock();
        if slot.cmd.is_none() {
            slot.pending = false;
        }
        slot.completed = slot.posted - u64::from(slot.cmd.is_some());
        self.cond.notify_all();
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn post_without_wait_leaves_command_pending() {
        let mb: Mailbox<u32> = Mailbox::new();
        mb.post(1, false, Duration::from_millis(10)).unwrap();
        assert!(mb.is_pending());
        assert_eq!(mb.try_take(), Some(1));
        mb.complete();
        assert!(!mb.is_pending());
    }

    #[test]
    fn second_post_times_out_while_pending() {
        let mb: Mailbox<u32> = Mailbox::new();
        mb.post(1, false, Duration::from_millis(10)).unwrap();
        let err = mb.post(2, false, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, DsError::CommandTimedOut(_)));
        assert_eq!(mb.try_take(), Some(1));
    }

    #[test]
    fn waiting_post_returns_after_completion() {
        let mb = Arc::new(Mailbox::<u32>::new());
        let worker = {
            let mb = mb.clone();
            thread::spawn(move || {
                let cmd = mb.wait_for_command(None);
                mb.complete();
                cmd
            })
        };
        mb.post(7, true, Duration::from_secs(5)).unwrap();
        assert_eq!(worker.join().unwrap(), Some(7));
        assert!(!mb.is_pending());
    }

    #[test]
    fn waiting_post_times_out_without_worker() {
        let mb: Mailbox<u32> = Mailbox::new();
        let start = Instant::now();
        let err = mb.post(1, true, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, DsError::CommandTimedOut(_)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn commands_are_executed_in_order() {
        let mb = Arc::new(Mailbox::<u32>::new());
        let worker = {
            let mb = mb.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                while seen.len() < 5 {
                    if let Some(cmd) = mb.wait_for_command(None) {
                        seen.push(cmd);
                        mb.complete();
                    }
                }
                seen
            })
        };
        for i in 0..5 {
            mb.post(i, false, Duration::from_secs(5)).unwrap();
        }
        assert_eq!(worker.join().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn force_post_replaces_pending_command() {
        let mb: Mailbox<u32> = Mailbox::new();
        mb.post(1, false, Duration::from_millis(10)).unwrap();
        mb.force_post(99);
        assert_eq!(mb.try_take(), Some(99));
    }

    #[test]
    fn overwritten_waiting_sender_gets_an_error() {
        let mb = Arc::new(Mailbox::<u32>::new());
        let sender = {
            let mb = mb.clone();
            thread::spawn(move || mb.post(1, true, Duration::from_secs(5)))
        };
        while !mb.is_pending() {
            thread::sleep(Duration::from_millis(1));
        }
        mb.force_post(99);
        assert_eq!(mb.try_take(), Some(99));
        mb.complete();

        let err = sender.join().unwrap().unwrap_err();
        assert!(matches!(err, DsError::CommandTimedOut(_)));
        assert!(!mb.is_pending());
    }

    #[test]
    fn wait_for_command_honours_deadline() {
        let mb: Mailbox<u32> = Mailbox::new();
        let got = mb.wait_for_command(Some(Instant::now() + Duration::from_millis(20)));
        assert_eq!(got, None);
    }
}
