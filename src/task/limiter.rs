// src/task/limiter.rs

//! The global resource limiter.
//!
//! A weighted counting semaphore bounding how many heavy operations
//! (sandboxed builds, cache queries) run at once. Acquisition is FIFO;
//! a requested weight larger than the capacity is clamped to it, so a
//! single heavyweight caller can never deadlock against the limit alone.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

/// Base period between "still waiting" diagnostics while blocked.
const REPORT_PERIOD: Duration = Duration::from_secs(180);

/// Process-wide weighted semaphore.
pub struct ResourceLimiter {
    sem: Arc<Semaphore>,
    capacity: u32,
}

impl ResourceLimiter {
    pub fn new(capacity: u32) -> Self {
        let capacity = capacity.max(1);
        ResourceLimiter {
            sem: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Currently available weight; diagnostic only.
    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }

    /// Block until `weight` units are available, then deduct them.
    ///
    /// While blocked, logs a diagnostic every few minutes; the period gets a
    /// small per-holder jitter so a convoy of waiting tasks does not report
    /// in lockstep.
    pub async fn acquire(&self, holder: &str, weight: u32) -> Result<LimiterLease> {
        let weight = weight.clamp(1, self.capacity);
        debug!(holder = %holder, weight, "acquiring limiter");

        let started = Instant::now();
        let period = REPORT_PERIOD - Duration::from_secs(10) + jitter_for(holder);
        let acquire = self.sem.clone().acquire_many_owned(weight);
        tokio::pin!(acquire);

        loop {
            tokio::select! {
                permit = &mut acquire => {
                    let permit = permit.context("resource limiter closed")?;
                    debug!(holder = %holder, weight, "acquired limiter");
                    return Ok(LimiterLease {
                        _permit: permit,
                        weight,
                    });
                }
                _ = tokio::time::sleep(period) => {
                    info!(
                        holder = %holder,
                        weight,
                        elapsed = ?started.elapsed(),
                        "still waiting for the resource limiter"
                    );
                }
            }
        }
    }
}

/// Jitter in `0..=20` seconds, stable per holder name.
fn jitter_for(holder: &str) -> Duration {
    let mut hasher = DefaultHasher::new();
    holder.hash(&mut hasher);
    Duration::from_secs(hasher.finish() % 21)
}

/// A held share of the limiter; dropping it returns the acquired weight.
pub struct LimiterLease {
    _permit: OwnedSemaphorePermit,
    weight: u32,
}

impl LimiterLease {
    pub fn weight(&self) -> u32 {
        self.weight
    }
}
