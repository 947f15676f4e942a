// Transaction manager
// Runs speculative regions to completion over the word-based STM

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::Backoff;
use parking_lot::RwLock;

use crate::stm::{Abort, TxResult, Txn};

/// The single capability the assembler needs from a concurrency runtime:
/// run a region until it commits.
///
/// The body may be executed many times. It must not have side effects
/// outside of the transaction other than ones that are safe to repeat.
/// Regions do not nest.
pub trait Transaction: Sync {
    fn run<'env, T, F>(&self, body: F) -> T
    where
        F: FnMut(&mut Txn<'env>) -> TxResult<T>;

    /// Commit and abort counters, for managers that keep them.
    fn stats(&self) -> TmStatsSnapshot {
        TmStatsSnapshot::default()
    }
}

/// Which execution paths [`HybridTm`] may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TmMode {
    /// Bounded optimistic fast path, then the software path
    #[default]
    Hybrid,
    /// Software path only
    Software,
    /// Every region holds the global gate exclusively
    Serial,
}

impl fmt::Display for TmMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TmMode::Hybrid => write!(f, "hybrid"),
            TmMode::Software => write!(f, "software"),
            TmMode::Serial => write!(f, "serial"),
        }
    }
}

impl FromStr for TmMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hybrid" => Ok(TmMode::Hybrid),
            "software" | "stm" => Ok(TmMode::Software),
            "serial" => Ok(TmMode::Serial),
            other => Err(format!(
                "unknown transaction mode '{other}' (expected hybrid, software or serial)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TmConfig {
    pub mode: TmMode,
    /// Fast-path attempts before falling back to the software path
    pub fast_retry_budget: u32,
    /// Consecutive software-path aborts before a region escalates to serial
    pub serial_escalation_threshold: u32,
}

impl Default for TmConfig {
    fn default() -> Self {
        TmConfig {
            mode: TmMode::Hybrid,
            fast_retry_budget: 4,
            serial_escalation_threshold: 64,
        }
    }
}

#[derive(Debug, Default)]
struct TmStats {
    fast_commits: AtomicU64,
    fast_aborts: AtomicU64,
    software_commits: AtomicU64,
    software_aborts: AtomicU64,
    serial_commits: AtomicU64,
    serial_aborts: AtomicU64,
}

#[inline]
fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Point-in-time copy of a manager's commit and abort counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TmStatsSnapshot {
    pub fast_commits: u64,
    pub fast_aborts: u64,
    pub software_commits: u64,
    pub software_aborts: u64,
    pub serial_commits: u64,
    pub serial_aborts: u64,
}

impl TmStatsSnapshot {
    pub fn commits(&self) -> u64 {
        self.fast_commits + self.software_commits + self.serial_commits
    }

    pub fn aborts(&self) -> u64 {
        self.fast_aborts + self.software_aborts + self.serial_aborts
    }
}

struct ActiveRegion<'a>(&'a AtomicUsize);

impl<'a> ActiveRegion<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        ActiveRegion(counter)
    }
}

impl Drop for ActiveRegion<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Transaction manager with a fast path, a software path and a serial path.
///
/// - **Fast path**: up to `fast_retry_budget` optimistic attempts without
///   backoff. An attempt is abandoned whenever a software-path region is in
///   flight, the way a hardware region subscribed to a fallback flag would be.
/// - **Software path**: unbounded retries with exponential backoff, running
///   concurrently with other software regions. Announces itself through
///   `software_active`.
/// - **Serial path**: holds `gate` exclusively, so the attempt cannot
///   conflict. Used for [`TmMode::Serial`] and for starving software regions.
pub struct HybridTm {
    config: TmConfig,
    gate: RwLock<()>,
    software_active: AtomicUsize,
    stats: TmStats,
}

impl HybridTm {
    pub fn new(config: TmConfig) -> Self {
        HybridTm {
            config,
            gate: RwLock::new(()),
            software_active: AtomicUsize::new(0),
            stats: TmStats::default(),
        }
    }

    pub fn config(&self) -> &TmConfig {
        &self.config
    }

    fn run_fast<'env, T, F>(&self, body: &mut F) -> Option<T>
    where
        F: FnMut(&mut Txn<'env>) -> TxResult<T>,
    {
        let mut txn = Txn::begin();
        for attempt in 0..self.config.fast_retry_budget {
            if self.software_active.load(Ordering::Acquire) > 0 {
                break;
            }
            let Some(_shared) = self.gate.try_read() else {
                break;
            };
            if attempt > 0 {
                txn.reset();
            }

            let outcome = body(&mut txn).and_then(|value| {
                if self.software_active.load(Ordering::Acquire) > 0 {
                    return Err(Abort::Conflict);
                }
                txn.commit().map(|()| value)
            });
            match outcome {
                Ok(value) => {
                    bump(&self.stats.fast_commits);
                    return Some(value);
                }
                Err(_) => bump(&self.stats.fast_aborts),
            }
        }
        None
    }

    fn run_software<'env, T, F>(&self, body: &mut F) -> T
    where
        F: FnMut(&mut Txn<'env>) -> TxResult<T>,
    {
        let _active = ActiveRegion::enter(&self.software_active);
        let backoff = Backoff::new();
        let mut txn = Txn::begin();
        let mut aborts = 0u32;

        loop {
            if aborts >= self.config.serial_escalation_threshold {
                tracing::debug!(aborts, "software region escalating to serial execution");
                return self.run_serial(body);
            }
            if aborts > 0 {
                txn.reset();
            }

            let outcome = {
                let _shared = self.gate.read();
                body(&mut txn).and_then(|value| txn.commit().map(|()| value))
            };
            match outcome {
                Ok(value) => {
                    bump(&self.stats.software_commits);
                    return value;
                }
                Err(abort) => {
                    bump(&self.stats.software_aborts);
                    aborts += 1;
                    if abort == Abort::Conflict {
                        backoff.snooze();
                    }
                }
            }
        }
    }

    fn run_serial<'env, T, F>(&self, body: &mut F) -> T
    where
        F: FnMut(&mut Txn<'env>) -> TxResult<T>,
    {
        let _exclusive = self.gate.write();
        let mut txn = Txn::begin();
        loop {
            match body(&mut txn).and_then(|value| txn.commit().map(|()| value)) {
                Ok(value) => {
                    bump(&self.stats.serial_commits);
                    return value;
                }
                Err(_) => {
                    bump(&self.stats.serial_aborts);
                    txn.reset();
                }
            }
        }
    }
}

impl Default for HybridTm {
    fn default() -> Self {
        HybridTm::new(TmConfig::default())
    }
}

impl fmt::Debug for HybridTm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridTm")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Transaction for HybridTm {
    fn run<'env, T, F>(&self, mut body: F) -> T
    where
        F: FnMut(&mut Txn<'env>) -> TxResult<T>,
    {
        match self.config.mode {
            TmMode::Serial => return self.run_serial(&mut body),
            TmMode::Hybrid => {
                if let Some(value) = self.run_fast(&mut body) {
                    return value;
                }
            }
            TmMode::Software => {}
        }
        self.run_software(&mut body)
    }

    fn stats(&self) -> TmStatsSnapshot {
        let s = &self.stats;
        TmStatsSnapshot {
            fast_commits: s.fast_commits.load(Ordering::Relaxed),
            fast_aborts: s.fast_aborts.load(Ordering::Relaxed),
            software_commits: s.software_commits.load(Ordering::Relaxed),
            software_aborts: s.software_aborts.load(Ordering::Relaxed),
            serial_commits: s.serial_commits.load(Ordering::Relaxed),
            serial_aborts: s.serial_aborts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stm::{Access, TVar};

    fn managers() -> Vec<HybridTm> {
        [TmMode::Hybrid, TmMode::Software, TmMode::Serial]
            .into_iter()
            .map(|mode| {
                HybridTm::new(TmConfig {
                    mode,
                    ..Default::default()
                })
            })
            .collect()
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("hybrid".parse::<TmMode>(), Ok(TmMode::Hybrid));
        assert_eq!("STM".parse::<TmMode>(), Ok(TmMode::Software));
        assert_eq!(" serial ".parse::<TmMode>(), Ok(TmMode::Serial));
        assert!("htm".parse::<TmMode>().is_err());
        assert_eq!(TmMode::Software.to_string(), "software");
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        const THREADS: usize = 4;
        const PER_THREAD: u64 = 2_000;

        for tm in managers() {
            let counter = TVar::new(0u64);
            std::thread::scope(|scope| {
                for _ in 0..THREADS {
                    scope.spawn(|| {
                        for _ in 0..PER_THREAD {
                            tm.run(|tx| {
                                let value = tx.read(&counter)?;
                                tx.write(&counter, value + 1)
                            });
                        }
                    });
                }
            });
            assert_eq!(counter.load_direct(), THREADS as u64 * PER_THREAD);
            assert_eq!(tm.stats().commits(), THREADS as u64 * PER_THREAD);
        }
    }

    #[test]
    fn test_transfers_preserve_total() {
        const ACCOUNTS: usize = 8;
        const TOTAL: u64 = 800;

        let tm = HybridTm::default();
        let accounts: Vec<TVar<u64>> = (0..ACCOUNTS).map(|_| TVar::new(TOTAL / 8)).collect();

        std::thread::scope(|scope| {
            for worker in 0..4usize {
                let tm = &tm;
                let accounts = &accounts;
                scope.spawn(move || {
                    for round in 0..500usize {
                        let from = (worker + round) % ACCOUNTS;
                        let to = (worker * 3 + round * 5 + 1) % ACCOUNTS;
                        tm.run(|tx| {
                            let available = tx.read(&accounts[from])?;
                            if available == 0 || from == to {
                                return Ok(());
                            }
                            let target = tx.read(&accounts[to])?;
                            tx.write(&accounts[from], available - 1)?;
                            tx.write(&accounts[to], target + 1)
                        });
                        let observed: u64 = tm.run(|tx| {
                            let mut sum = 0;
                            for account in accounts {
                                sum += tx.read(account)?;
                            }
                            Ok(sum)
                        });
                        assert_eq!(observed, TOTAL);
                    }
                });
            }
        });

        let total: u64 = accounts.iter().map(TVar::load_direct).sum();
        assert_eq!(total, TOTAL);
    }

    #[test]
    fn test_explicit_restart_reruns_region() {
        let tm = HybridTm::default();
        let flag = TVar::new(false);
        let mut attempts = 0;
        let result = tm.run(|tx| {
            attempts += 1;
            if attempts < 3 {
                return tx.restart();
            }
            tx.write(&flag, true)?;
            Ok(attempts)
        });
        assert_eq!(result, 3);
        assert!(flag.load_direct());
    }

    #[test]
    fn test_starving_software_region_escalates() {
        let tm = HybridTm::new(TmConfig {
            mode: TmMode::Software,
            fast_retry_budget: 0,
            serial_escalation_threshold: 3,
        });
        let mut attempts = 0;
        let result = tm.run(|tx| {
            attempts += 1;
            if attempts <= 5 {
                return tx.restart();
            }
            Ok(attempts)
        });
        assert_eq!(result, 6);

        let stats = tm.stats();
        assert_eq!(stats.software_aborts, 3);
        assert_eq!(stats.serial_aborts, 2);
        assert_eq!(stats.serial_commits, 1);
        assert_eq!(stats.fast_commits, 0);
    }
}
