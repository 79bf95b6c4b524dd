//! Tunable constants for a `Bus` and the `ControlPanel` façade above it.
//!
//! Pulling these into a `BusConfig` seam, rather than hardcoding them into
//! the poll loop body, means a caller that wants a different cadence or
//! timeout doesn't need to touch `bus.rs`. The defaults below are the fixed
//! values this protocol's poll cadence and timeouts have always used — this
//! is a seam for future configurability, not a change in default behavior.

use std::time::Duration;

use crate::device::OFFLINE_THRESHOLD;

/// Per-`Bus` tunables. `StartConnection` accepts an optional `BusConfig`,
/// defaulting to [`BusConfig::default`] when absent.
#[derive(Debug, Clone, Copy)]
pub struct BusConfig {
    /// Target time between poll cycles.
    pub poll_interval: Duration,
    /// How long the Bus waits for a reply to a single outbound frame
    /// before treating it as a miss.
    pub reply_window: Duration,
    /// Consecutive misses before a device is marked offline.
    pub offline_threshold: u32,
    /// Default deadline for `ControlPanel::send_command`.
    pub command_timeout: Duration,
    /// Default deadline for `ControlPanel::get_piv_data`.
    pub piv_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            reply_window: Duration::from_millis(200),
            offline_threshold: OFFLINE_THRESHOLD,
            command_timeout: Duration::from_secs(5),
            piv_timeout: Duration::from_secs(5),
        }
    }
}
