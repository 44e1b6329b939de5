//! Live connection registry
//!
//! Process-local map of `agent_id -> live connection`. The mutex is only held
//! for lookup/insert/delete; callers get cloned `Arc`s and never hold the lock
//! across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use courier_core::transport::DeviceConnection;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct LiveConnection {
    conn: Arc<dyn DeviceConnection>,
    pump: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
}

/// Removed entry handed back to the caller for teardown.
pub struct Detached {
    pub conn: Arc<dyn DeviceConnection>,
    pump: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
}

impl Detached {
    /// Stop the event pump and the pairing listener. The connection itself is
    /// left to the caller.
    pub fn stop_tasks(&mut self) {
        for task in [self.pump.take(), self.listener.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

type TaskSlot = fn(&mut LiveConnection) -> &mut Option<JoinHandle<()>>;

/// Outcome of `insert_if_absent`.
pub enum Registration {
    /// Our connection is now the live one.
    Inserted(Arc<dyn DeviceConnection>),
    /// Someone registered first; theirs is returned.
    Existing(Arc<dyn DeviceConnection>),
}

#[derive(Default)]
pub struct ConnectionRegistry {
    live: Mutex<HashMap<String, LiveConnection>>,
    // Pairing-code refreshes, tracked separately so they survive re-registration.
    refreshes: Mutex<HashMap<String, Instant>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self) -> MutexGuard<'_, HashMap<String, LiveConnection>> {
        // Entries are plain data; a poisoned map is still consistent.
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<dyn DeviceConnection>> {
        self.live().get(agent_id).map(|l| l.conn.clone())
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.live().contains_key(agent_id)
    }

    pub fn len(&self) -> usize {
        self.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert_if_absent(
        &self,
        agent_id: &str,
        conn: Arc<dyn DeviceConnection>,
    ) -> Registration {
        let mut live = self.live();
        if let Some(existing) = live.get(agent_id) {
            return Registration::Existing(existing.conn.clone());
        }
        live.insert(
            agent_id.to_string(),
            LiveConnection {
                conn: conn.clone(),
                pump: None,
                listener: None,
            },
        );
        Registration::Inserted(conn)
    }

    /// Record the event pump for `conn`. If the entry was replaced or removed
    /// in the meantime the pump is aborted.
    pub fn set_pump(&self, agent_id: &str, conn: &Arc<dyn DeviceConnection>, pump: JoinHandle<()>) {
        self.attach_task(agent_id, conn, pump, |l| &mut l.pump);
    }

    /// Record the pairing listener for `conn`, aborting the one it supersedes.
    /// A listener for a replaced or removed entry is aborted.
    pub fn set_listener(
        &self,
        agent_id: &str,
        conn: &Arc<dyn DeviceConnection>,
        listener: JoinHandle<()>,
    ) {
        self.attach_task(agent_id, conn, listener, |l| &mut l.listener);
    }

    fn attach_task(
        &self,
        agent_id: &str,
        conn: &Arc<dyn DeviceConnection>,
        task: JoinHandle<()>,
        slot: TaskSlot,
    ) {
        let mut live = self.live();
        match live.get_mut(agent_id) {
            Some(entry) if Arc::ptr_eq(&entry.conn, conn) => {
                if let Some(old) = slot(entry).replace(task) {
                    old.abort();
                }
            }
            _ => task.abort(),
        }
    }

    pub fn remove(&self, agent_id: &str) -> Option<Detached> {
        self.live().remove(agent_id).map(|l| Detached {
            conn: l.conn,
            pump: l.pump,
            listener: l.listener,
        })
    }

    /// Remove the entry only if it still holds `conn`.
    pub fn remove_if_same(&self, agent_id: &str, conn: &Arc<dyn DeviceConnection>) -> bool {
        let mut live = self.live();
        match live.get(agent_id) {
            Some(entry) if Arc::ptr_eq(&entry.conn, conn) => {
                // The pump calling this is the one being removed; let it finish.
                if let Some(removed) = live.remove(agent_id) {
                    if let Some(listener) = removed.listener {
                        listener.abort();
                    }
                }
                true
            }
            _ => false,
        }
    }

    /// Claim the pairing-code refresh slot for `agent_id`. Returns false if a
    /// refresh was already started within `window`.
    pub fn try_begin_refresh(&self, agent_id: &str, window: Duration) -> bool {
        let now = Instant::now();
        let mut refreshes = self.refreshes.lock().unwrap_or_else(|e| e.into_inner());
        match refreshes.get(agent_id) {
            Some(last) if now.duration_since(*last) < window => false,
            _ => {
                refreshes.insert(agent_id.to_string(), now);
                true
            }
        }
    }

    pub fn forget_refresh(&self, agent_id: &str) {
        self.refreshes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(agent_id);
    }
}
