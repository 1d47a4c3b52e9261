//! Host port allocation for starting executions
//!
//! Allocation is probe-based: the live host is the authoritative record of
//! which ports are taken, so there is no persistent claim table. The probe
//! order is randomised to reduce collisions when several executions start
//! concurrently; the engine handles the residual race by retrying the
//! container start with a fresh port.

use crate::host::HostDriver;
use rand::seq::SliceRandom;
use shared::OrchestratorError;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct PortAllocator {
    host: Arc<dyn HostDriver>,
    range_start: u16,
    range_end: u16,
}

impl PortAllocator {
    pub fn new(host: Arc<dyn HostDriver>, range_start: u16, range_end: u16) -> Self {
        Self {
            host,
            range_start,
            range_end,
        }
    }

    /// Pick a free port from the configured range
    ///
    /// A candidate passes when no container publishes it and no socket on
    /// the host listens on it. Returns an exhaustion error when every port
    /// in the range is taken.
    pub async fn allocate(&self) -> Result<u16, OrchestratorError> {
        let mut candidates: Vec<u16> = (self.range_start..=self.range_end).collect();
        candidates.shuffle(&mut rand::rng());

        // One container listing serves the whole scan; a failed listing is
        // treated as empty and the socket probe decides alone.
        let published = match self.host.published_ports().await {
            Ok(ports) => ports,
            Err(e) => {
                warn!(error = %e, "Could not list published container ports");
                Vec::new()
            }
        };

        for port in candidates {
            if published.contains(&port) {
                debug!(port, "Port is published by a container, trying the next one");
                continue;
            }
            match self.host.probe_port_listening(port).await {
                Ok(false) => {
                    debug!(port, "Allocated host port");
                    return Ok(port);
                }
                Ok(true) => {
                    debug!(port, "Port is in use, trying the next one");
                }
                Err(e) => {
                    warn!(port, error = %e, "Port probe failed, skipping port");
                }
            }
        }

        Err(OrchestratorError::Exhaustion(format!(
            "no free port in {}-{}",
            self.range_start, self.range_end
        )))
    }

    /// Release hook for a previously allocated port
    ///
    /// Allocation state lives in the live host, so there is nothing to undo
    /// here; the next probe will see the port as free once the container is
    /// gone.
    pub fn release(&self, port: u16) {
        debug!(port, "Released host port");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fake::FakeHost;

    fn allocator(host: Arc<FakeHost>, start: u16, end: u16) -> PortAllocator {
        PortAllocator::new(host, start, end)
    }

    #[tokio::test]
    async fn test_allocates_only_free_ports() {
        let host = Arc::new(FakeHost::new());
        host.add_published_port(50000);
        host.mark_listening(50001);
        let ports = allocator(Arc::clone(&host), 50000, 50002);

        // 50000 is published and 50001 is listening, so only 50002 remains.
        assert_eq!(ports.allocate().await.unwrap(), 50002);
    }

    #[tokio::test]
    async fn test_exhaustion_when_range_full() {
        let host = Arc::new(FakeHost::new());
        host.mark_listening(50000);
        host.mark_listening(50001);
        host.mark_listening(50002);
        let ports = allocator(Arc::clone(&host), 50000, 50002);

        let err = ports.allocate().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Exhaustion(_)));
        assert!(err.to_string().contains("50000-50002"));
    }

    #[tokio::test]
    async fn test_sequential_allocations_are_distinct() {
        let host = Arc::new(FakeHost::new());
        let ports = allocator(Arc::clone(&host), 50000, 50004);

        let mut allocated = Vec::new();
        for _ in 0..5 {
            let port = ports.allocate().await.unwrap();
            assert!(
                !allocated.contains(&port),
                "port {} allocated twice",
                port
            );
            // Starting a container would publish the port; simulate the bind.
            host.mark_listening(port);
            allocated.push(port);
        }
        assert_eq!(allocated.len(), 5);
    }
}
