//! Port allocation for launched tool servers.

use std::collections::BTreeSet;
use std::net::TcpListener;
use std::sync::Mutex;

use crate::error::ToolError;

/// Hands out ports from a configured window, lowest free first.
///
/// Freeness is verified by actually binding before the port is recorded, so
/// two servers can never be handed the same port even if something outside
/// the window squats on part of it.
pub struct PortAllocator {
    lo: u16,
    hi: u16,
    allocated: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(lo: u16, hi: u16) -> Self {
        Self {
            lo,
            hi,
            allocated: Mutex::new(BTreeSet::new()),
        }
    }

    /// Allocate the lowest free port in the window.
    pub fn allocate(&self) -> Result<u16, ToolError> {
        let mut allocated = self.allocated.lock().unwrap_or_else(|e| e.into_inner());
        for port in self.lo..=self.hi {
            if allocated.contains(&port) {
                continue;
            }
            // A successful bind proves the port is free right now; the
            // listener is dropped immediately and the reservation lives in
            // the allocated set from here on.
            if TcpListener::bind(("127.0.0.1", port)).is_ok() {
                allocated.insert(port);
                return Ok(port);
            }
        }
        Err(ToolError::PortExhausted {
            lo: self.lo,
            hi: self.hi,
        })
    }

    /// Reserve a specific port (snapshot restore path). Falls back to a
    /// fresh allocation if the port is taken.
    pub fn reserve(&self, port: u16) -> Result<u16, ToolError> {
        {
            let mut allocated = self.allocated.lock().unwrap_or_else(|e| e.into_inner());
            if (self.lo..=self.hi).contains(&port)
                && !allocated.contains(&port)
                && TcpListener::bind(("127.0.0.1", port)).is_ok()
            {
                allocated.insert(port);
                return Ok(port);
            }
        }
        self.allocate()
    }

    /// Return a port to the pool.
    pub fn release(&self, port: u16) {
        self.allocated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&port);
    }

    /// Number of ports currently handed out.
    pub fn in_use(&self) -> usize {
        self.allocated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
