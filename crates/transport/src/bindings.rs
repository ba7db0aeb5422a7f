//! Port allocation for backends that expose a socket.
//!
//! Ports are searched downward from a starting value: the allocator returns the
//! highest port at or below `start` that is neither bound on the host nor
//! currently reserved by this allocator. Reservations are released when the
//! returned [`PortReservation`] is dropped.
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use eyre::Result;

/// Host-level "is this port in use" check
pub trait PortProbe: Send + Sync + 'static {
    fn is_bound(&self, port: u16) -> bool;
}

/// Probes by attempting to bind the port on all interfaces
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl PortProbe for SystemProbe {
    fn is_bound(&self, port: u16) -> bool {
        TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_err()
    }
}

/// Readiness check for a process that should start listening on loopback.
///
/// Connecting sees a listener as soon as it accepts, whichever interface it
/// bound, without ever holding the port itself.
#[derive(Debug, Clone, Copy)]
pub struct ListeningProbe {
    pub connect_timeout: Duration,
}

impl Default for ListeningProbe {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(50),
        }
    }
}

impl PortProbe for ListeningProbe {
    fn is_bound(&self, port: u16) -> bool {
        let address = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        TcpStream::connect_timeout(&address, self.connect_timeout).is_ok()
    }
}

/// Shared allocator handle; clones share the same reservation table.
#[derive(Clone)]
pub struct PortAllocator {
    reserved: Arc<Mutex<HashSet<u16>>>,
    probe: Arc<dyn PortProbe>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortAllocator")
            .field("reserved", &self.reserved)
            .finish_non_exhaustive()
    }
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::with_probe(SystemProbe)
    }

    pub fn with_probe(probe: impl PortProbe) -> Self {
        Self {
            reserved: Arc::new(Mutex::new(HashSet::new())),
            probe: Arc::new(probe),
        }
    }

    /// Reserve the highest free port `<= start`.
    ///
    /// Fails when every port down to 1 is taken.
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn allocate(&self, start: u16) -> Result<PortReservation> {
        let mut reserved = self
            .reserved
            .lock()
            .map_err(|_| eyre::eyre!("port reservation table poisoned"))?;

        let mut port = start;
        while port > 0 {
            if !reserved.contains(&port) && !self.probe.is_bound(port) {
                reserved.insert(port);
                tracing::debug!(%port, "reserved port");
                return Ok(PortReservation {
                    port,
                    reserved: Arc::clone(&self.reserved),
                });
            }
            tracing::trace!(%port, "port in use");
            port -= 1;
        }

        eyre::bail!("no free port at or below {start}")
    }

    /// Number of ports currently held by live reservations.
    pub fn reserved_count(&self) -> usize {
        self.reserved.lock().map(|r| r.len()).unwrap_or_default()
    }
}

/// A port held for one backend; released on drop.
#[derive(Debug)]
pub struct PortReservation {
    port: u16,
    reserved: Arc<Mutex<HashSet<u16>>>,
}

impl PortReservation {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        if let Ok(mut reserved) = self.reserved.lock() {
            reserved.remove(&self.port);
            tracing::debug!(port = %self.port, "released port");
        }
    }
}
