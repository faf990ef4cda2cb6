//! Process-wide shared state: the global memory budget for buffered sends and
//! the id allocators used by both sides of the tunnel.

use std::{
    cell::Cell,
    path::{Path, PathBuf},
    rc::Rc,
    time::Instant,
};

/// Default cap on the total amount of send data buffered in memory across all
/// connections before new buffers start spilling to disk.
pub const DEFAULT_GLOBAL_MEMORY_LIMIT: u64 = 128 * 1024 * 1024;

/// Data handler ids start well above zero so they are easy to tell apart from
/// control connection ids in logs and on the wire.
const FIRST_DATA_HANDLER_ID: u16 = 10000;

/// Tracks how much send data is currently buffered in memory, process-wide.
///
/// A buffer is only accounted here while it sits in a connection's in-memory
/// send queue; spilled buffers live on disk and are not counted. `acquire` is
/// only called after `would_exceed` returned false, so `used() <= max()` holds
/// at all times.
pub struct MemoryBudget {
    used: Cell<u64>,
    max: Cell<u64>,
}

impl MemoryBudget {
    fn new(max: u64) -> Self {
        MemoryBudget {
            used: Cell::new(0),
            max: Cell::new(max),
        }
    }

    pub fn used(&self) -> u64 {
        self.used.get()
    }

    pub fn max(&self) -> u64 {
        self.max.get()
    }

    pub fn set_max(&self, max: u64) {
        self.max.set(max);
    }

    pub fn would_exceed(&self, additional: usize) -> bool {
        self.used.get() + additional as u64 > self.max.get()
    }

    pub fn acquire(&self, amount: usize) {
        self.used.set(self.used.get() + amount as u64);
    }

    pub fn release(&self, amount: u64) {
        self.used.set(self.used.get().saturating_sub(amount));
    }
}

/// Composition root handed (by `Rc`) to every component that needs ids, the
/// memory budget or the spill directory. Lives as long as the process.
pub struct Runtime {
    memory: MemoryBudget,
    next_connection_id: Cell<u32>,
    next_ctrl_id: Cell<u16>,
    next_session_id: Cell<u32>,
    next_handler_id: Cell<u16>,
    spill_dir: PathBuf,
    started_at: Instant,
}

impl Runtime {
    pub fn new(spill_dir: PathBuf) -> Rc<Self> {
        Rc::new(Runtime {
            memory: MemoryBudget::new(DEFAULT_GLOBAL_MEMORY_LIMIT),
            next_connection_id: Cell::new(1),
            next_ctrl_id: Cell::new(1),
            next_session_id: Cell::new(1),
            next_handler_id: Cell::new(FIRST_DATA_HANDLER_ID),
            spill_dir,
            started_at: Instant::now(),
        })
    }

    pub fn memory(&self) -> &MemoryBudget {
        &self.memory
    }

    pub fn spill_dir(&self) -> &Path {
        &self.spill_dir
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Id for a freshly accepted or dialed connection, used in logs and as the
    /// file-cache name component.
    pub fn next_connection_id(&self) -> u32 {
        let id = self.next_connection_id.get();
        self.next_connection_id.set(id.wrapping_add(1).max(1));
        id
    }

    /// Wire id assigned to a control connection when it syncs.
    pub fn next_ctrl_id(&self) -> u16 {
        let id = self.next_ctrl_id.get();
        self.next_ctrl_id.set(id.wrapping_add(1).max(1));
        id
    }

    /// Session ids are allocated by the server when a connection is accepted
    /// on a forward port.
    pub fn next_session_id(&self) -> u32 {
        let id = self.next_session_id.get();
        self.next_session_id.set(id.wrapping_add(1).max(1));
        id
    }

    /// Id used to match a fresh data connection to the session that requested
    /// it. Wraps back to the starting value rather than into the low range.
    pub fn next_handler_id(&self) -> u16 {
        let id = self.next_handler_id.get();
        let next = id.wrapping_add(1);
        self.next_handler_id.set(if next < FIRST_DATA_HANDLER_ID {
            FIRST_DATA_HANDLER_ID
        } else {
            next
        });
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_accounting() {
        let budget = MemoryBudget::new(100);
        assert!(!budget.would_exceed(100));
        assert!(budget.would_exceed(101));

        budget.acquire(60);
        assert_eq!(budget.used(), 60);
        assert!(budget.would_exceed(41));
        assert!(!budget.would_exceed(40));

        budget.release(60);
        assert_eq!(budget.used(), 0);
        budget.release(10);
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn handler_ids_stay_in_range() {
        let runtime = Runtime::new(std::env::temp_dir());
        let first = runtime.next_handler_id();
        assert_eq!(first, 10000);
        assert_eq!(runtime.next_handler_id(), 10001);
    }
}
