//! Migration throttling.
//!
//! The currency is time: the budget accumulates microseconds as the clock
//! ticks and converts them to migration bytes through the configured
//! maximum rate. Going over the threshold once is allowed (any single
//! buffer must be movable regardless of size); the resulting debt then
//! stalls optional migrations until elapsed time repays it. This is a
//! fairness heuristic, not an accounting ledger.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use tracing::trace;

use talon_mem::{MemDomain, MoveStats, PlacementBackend};

/// Cap on accumulated credit. Bounds burstiness: full-rate migration
/// requires submissions at most 200 ms apart.
const US_UPPER_BOUND: i64 = 200_000;

/// Absolute free-VRAM floor above which initial fills are fast-tracked.
const FREE_VRAM_FAST_FILL_BYTES: u64 = 128 << 20;

/// Time source for the budget. Injected so tests control elapsed time.
pub trait Clock: Send + Sync {
    fn now_us(&self) -> i64;
}

/// Wall-clock microseconds since the first use in this process.
#[derive(Debug, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_us(&self) -> i64 {
        static ORIGIN: OnceLock<Instant> = OnceLock::new();
        let origin = *ORIGIN.get_or_init(Instant::now);
        Instant::now().duration_since(origin).as_micros() as i64
    }
}

/// Hand-advanced clock for tests and simulation.
#[derive(Debug, Default)]
pub struct ManualClock {
    us: AtomicI64,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn advance_us(&self, us: i64) {
        self.us.fetch_add(us, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> i64 {
        self.us.load(Ordering::SeqCst)
    }
}

/// How many bytes of migration the current submission may spend.
///
/// Zero means "no optional moves"; it never blocks placing a buffer that
/// has no valid current placement, which the reservation engine handles by
/// always permitting the fallback domain set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveThreshold {
    pub max_bytes: u64,
    pub max_visible_bytes: u64,
}

#[derive(Debug)]
struct BudgetState {
    accum_us: i64,
    accum_us_vis: i64,
    last_update_us: i64,
}

/// Process-wide migration budget (Budget State).
///
/// One instance per device, constructed at device initialization and
/// destroyed only at teardown. Every concurrent submission mutates it
/// under the single internal lock.
pub struct MigrationBudget {
    /// log2 of the maximum migration rate in bytes per microsecond
    /// (equivalently MB/s). Zero disables migration throttle credit
    /// entirely.
    log2_max_rate: u32,
    /// Integrated devices share VRAM with the host: reset credit on a
    /// mostly-free pool instead of fast-filling it.
    integrated: bool,
    clock: Arc<dyn Clock>,
    state: Mutex<BudgetState>,
}

impl std::fmt::Debug for MigrationBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationBudget")
            .field("log2_max_rate", &self.log2_max_rate)
            .field("integrated", &self.integrated)
            .finish_non_exhaustive()
    }
}

impl MigrationBudget {
    pub fn new(log2_max_rate: u32, integrated: bool, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_us();
        Self {
            log2_max_rate,
            integrated,
            clock,
            state: Mutex::new(BudgetState {
                accum_us: 0,
                accum_us_vis: 0,
                last_update_us: now,
            }),
        }
    }

    fn us_to_bytes(&self, us: i64) -> u64 {
        if us <= 0 || self.log2_max_rate == 0 {
            return 0;
        }
        (us as u64) << self.log2_max_rate
    }

    fn bytes_to_us(&self, bytes: u64) -> i64 {
        if self.log2_max_rate == 0 {
            return 0;
        }
        (bytes >> self.log2_max_rate) as i64
    }

    /// How many migration bytes the next submission may spend right now.
    ///
    /// Accumulates elapsed time into credit (capped), opportunistically
    /// tops the credit up when the VRAM pool has substantial free space so
    /// moderately full pools still fill quickly, and converts the credit
    /// to bytes. The visible-VRAM sub-budget gets the same treatment when
    /// VRAM is not fully CPU-visible.
    pub fn threshold(&self, placement: &dyn PlacementBackend) -> MoveThreshold {
        if self.log2_max_rate == 0 {
            return MoveThreshold::default();
        }

        let vram = placement.domain_stats(MemDomain::VRAM);
        let free_vram = vram.free_bytes();

        let mut state = self.state.lock().unwrap();

        let now_us = self.clock.now_us();
        let increment_us = now_us - state.last_update_us;
        state.last_update_us = now_us;
        state.accum_us = (state.accum_us + increment_us).min(US_UPPER_BOUND);

        // Avoid a low-performance window right after userspace frees a lot
        // of VRAM (or a big buffer forced mass evictions): with 128 MiB or
        // an eighth of the pool free, start filling immediately.
        if free_vram >= FREE_VRAM_FAST_FILL_BYTES || free_vram >= vram.total_bytes / 8 {
            let min_us = if self.integrated {
                0
            } else {
                self.bytes_to_us(free_vram / 4)
            };
            state.accum_us = state.accum_us.max(min_us);
        }

        let max_bytes = self.us_to_bytes(state.accum_us);

        let max_visible_bytes = match placement.visible_vram_stats() {
            // Fully visible VRAM needs no separate sub-budget.
            None => 0,
            Some(vis) => {
                if vis.used_bytes < vis.total_bytes {
                    let free_vis = vis.total_bytes - vis.used_bytes;
                    state.accum_us_vis =
                        (state.accum_us_vis + increment_us).min(US_UPPER_BOUND);
                    if free_vis >= vis.total_bytes / 2 {
                        state.accum_us_vis =
                            state.accum_us_vis.max(self.bytes_to_us(free_vis / 2));
                    }
                }
                self.us_to_bytes(state.accum_us_vis)
            }
        };

        trace!(
            accum_us = state.accum_us,
            accum_us_vis = state.accum_us_vis,
            max_bytes,
            max_visible_bytes,
            "migration threshold"
        );

        MoveThreshold {
            max_bytes,
            max_visible_bytes,
        }
    }

    /// Debit the budget by what a submission actually migrated. May drive
    /// the counters negative; the debt throttles later submissions until
    /// elapsed time repays it.
    pub fn report_moved(&self, moved: MoveStats) {
        let mut state = self.state.lock().unwrap();
        state.accum_us -= self.bytes_to_us(moved.bytes_moved);
        state.accum_us_vis -= self.bytes_to_us(moved.bytes_moved_visible);
    }
}
