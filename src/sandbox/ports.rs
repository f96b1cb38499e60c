//! Port allocation for backend processes.

use std::net::{Ipv4Addr, TcpListener};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

use super::LaunchError;
use crate::config::PortsConfig;

/// Hands out ports from an increasing counter. A number is never handed out
/// twice during the lifetime of the allocator.
#[derive(Debug)]
pub struct PortAllocator {
    next: AtomicU32,
    verify_free: bool,
    max_attempts: u16,
}

impl PortAllocator {
    pub fn new(config: &PortsConfig) -> Self {
        Self {
            next: AtomicU32::new(u32::from(config.base)),
            verify_free: config.verify_free,
            max_attempts: config.max_attempts,
        }
    }

    /// Next port for a spawn.
    ///
    /// With `verify_free`, each candidate is bound once on loopback and
    /// skipped if something already holds it.
    pub fn next_port(&self) -> Result<u16, LaunchError> {
        let attempts = u32::from(self.max_attempts).max(1);
        let mut last = 0;

        for _ in 0..attempts {
            last = self.next.fetch_add(1, Ordering::SeqCst);
            let Ok(port) = u16::try_from(last) else {
                return Err(LaunchError::ports_exhausted(last));
            };
            if !self.verify_free || is_port_available(port) {
                return Ok(port);
            }
            debug!(port, "Port in use, skipping");
        }

        Err(LaunchError::ports_exhausted(last))
    }
}

fn is_port_available(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(base: u16, verify_free: bool) -> PortAllocator {
        PortAllocator::new(&PortsConfig {
            base,
            verify_free,
            max_attempts: 10,
        })
    }

    #[test]
    fn test_ports_increase_from_base() {
        let ports = allocator(9000, false);
        assert_eq!(ports.next_port().unwrap(), 9000);
        assert_eq!(ports.next_port().unwrap(), 9001);
        assert_eq!(ports.next_port().unwrap(), 9002);
    }

    #[test]
    fn test_busy_port_is_skipped() {
        let held = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let busy = held.local_addr().unwrap().port();
        if busy == u16::MAX {
            return;
        }

        let ports = allocator(busy, true);
        let port = ports.next_port().unwrap();
        assert_ne!(port, busy);
        assert!(port > busy);
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let ports = allocator(u16::MAX, false);
        assert_eq!(ports.next_port().unwrap(), u16::MAX);
        let err = ports.next_port().unwrap_err();
        assert!(err.is_ports_exhausted());
        // And stays exhausted
        assert!(ports.next_port().is_err());
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let ports = std::sync::Arc::new(allocator(20000, false));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ports = ports.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| ports.next_port().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u16> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total);
    }
}
