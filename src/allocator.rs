//! External port allocation
//!
//! Ports are reserved by the same registry insert that establishes
//! per-(user, challenge) exclusivity. The allocator only proposes candidates;
//! the partial unique index on `external_port` decides who gets a port.

use crate::config::PortRange;
use crate::error::{InstanceError, InstanceResult, RegistryError};
use crate::models::Instance;
use crate::registry::Registry;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Random draws attempted before falling back to a scan of the range
const RANDOM_DRAWS: usize = 16;

pub struct PortAllocator {
    range: PortRange,
    max_attempts: u32,
    rng: Mutex<StdRng>,
}

impl PortAllocator {
    pub fn new(range: PortRange, max_attempts: u32) -> Self {
        Self {
            range,
            max_attempts: max_attempts.max(1),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Allocator with a deterministic candidate sequence
    pub fn with_seed(range: PortRange, max_attempts: u32, seed: u64) -> Self {
        Self {
            range,
            max_attempts: max_attempts.max(1),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn exhausted(&self) -> InstanceError {
        InstanceError::AllocationExhausted {
            low: self.range.low,
            high: self.range.high,
        }
    }

    /// Pick a port outside `occupied`
    pub fn pick(&self, occupied: &HashSet<u16>) -> InstanceResult<u16> {
        let mut rng = self.rng.lock();
        pick_port(self.range, occupied, &mut *rng).ok_or_else(|| self.exhausted())
    }

    /// Insert the instance built by `draft` for some free port
    ///
    /// `draft` receives the candidate port and returns the record to insert.
    /// A lost port race retries with the port excluded; a lost exclusivity
    /// race returns `Conflict` with the winning instance.
    pub async fn reserve<F>(&self, registry: &dyn Registry, draft: F) -> InstanceResult<Instance>
    where
        F: Fn(u16) -> Instance + Send + Sync,
    {
        let mut excluded = HashSet::new();

        for attempt in 1..=self.max_attempts {
            let mut occupied = registry.occupied_ports().await?;
            occupied.extend(excluded.iter().copied());
            let port = self.pick(&occupied)?;
            let instance = draft(port);

            match registry.insert_instance(&instance).await {
                Ok(()) => {
                    debug!(
                        "Reserved port {} for instance {} (attempt {})",
                        port, instance.id, attempt
                    );
                    return Ok(instance);
                }
                Err(RegistryError::PortTaken(taken)) => {
                    debug!("Port {} taken concurrently, retrying", taken);
                    excluded.insert(taken);
                }
                Err(RegistryError::PairConflict {
                    user_id,
                    challenge_id,
                }) => {
                    match registry.find_active_instance(user_id, challenge_id).await? {
                        Some(existing) => return Err(InstanceError::conflict(existing)),
                        // winner already left the non-terminal set
                        None => continue,
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(
            "Port reservation gave up after {} attempts in {}-{}",
            self.max_attempts, self.range.low, self.range.high
        );
        Err(self.exhausted())
    }
}

/// Random draws, then a scan from a random offset; `None` when every port is
/// occupied
pub fn pick_port<R: Rng + ?Sized>(
    range: PortRange,
    occupied: &HashSet<u16>,
    rng: &mut R,
) -> Option<u16> {
    if range.is_empty() {
        return None;
    }

    for _ in 0..RANDOM_DRAWS {
        let port = rng.gen_range(range.low..=range.high);
        if !occupied.contains(&port) {
            return Some(port);
        }
    }

    let len = range.len();
    let offset = rng.gen_range(0..len);
    (0..len)
        .map(|i| range.low + ((offset + i) % len) as u16)
        .find(|port| !occupied.contains(port))
}
