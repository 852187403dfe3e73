use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::debug;

use crate::error::TunnelError;
use crate::probe::{Availability, PortProbe};

/// First port handed out when the caller lets us pick.
pub const FIRST_AUTO_PORT: u16 = 2049;

static SHARED: OnceLock<PortAllocator> = OnceLock::new();

/// Hands out local ports from a counter that only moves forward.
///
/// Clones share the counter, so every controller built from
/// [`PortAllocator::shared`] draws from the same sequence and no two of them
/// are ever offered the same candidate.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    next: Arc<AtomicU32>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(FIRST_AUTO_PORT)
    }
}

impl PortAllocator {
    /// Port 0 is never handed out; a seed of 0 starts at 1.
    pub fn new(first: u16) -> Self {
        Self {
            next: Arc::new(AtomicU32::new(u32::from(first.max(1)))),
        }
    }

    /// The process-wide allocator.
    pub fn shared() -> Self {
        SHARED.get_or_init(PortAllocator::default).clone()
    }

    pub fn reset(&self, first: u16) {
        self.next.store(u32::from(first.max(1)), Ordering::SeqCst);
    }

    fn next_candidate(&self) -> Option<u16> {
        let candidate = self.next.fetch_add(1, Ordering::SeqCst);
        u16::try_from(candidate).ok()
    }

    /// Returns `requested` untouched when it is non-zero. Otherwise takes
    /// candidates from the counter until the probe stops reporting them as in use.
    pub async fn resolve(
        &self,
        requested: u16,
        probe: Option<&dyn PortProbe>,
    ) -> Result<u16, TunnelError> {
        if requested != 0 {
            return Ok(requested);
        }

        loop {
            let port = self.next_candidate().ok_or(TunnelError::PortRangeExhausted)?;
            let Some(probe) = probe else {
                return Ok(port);
            };
            match probe.check(port).await.map_err(TunnelError::Probe)? {
                Availability::InUse => debug!("local port {} is in use, trying the next one", port),
                Availability::Free | Availability::Unknown => return Ok(port),
            }
        }
    }
}
