// Phase plan for the assembly worker pool
// Every worker walks the same plan and meets the others at a barrier after each phase

/// One barrier-delimited step of an assembly run.
///
/// Phases run in plan order:
/// - **Dedup**: insert raw segments into the unique set (all workers)
/// - **Census**: count unique segments and check the dedup result (leader)
/// - **IndexBuild**: claim construct entries and fill the prefix tables (all workers)
/// - **Match**: link chain tails to chain heads overlapping by `substring_length` (all workers)
/// - **Compact**: rehash remaining tails for the next pass and shorten the
///   skip-chain (leader, only between passes)
/// - **Finalize**: walk the chains into the output sequence (leader)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Dedup,
    Census,
    IndexBuild,
    Match { substring_length: usize },
    Compact { substring_length: usize },
    Finalize,
}

/// Which workers execute a phase body. Everyone still waits at the barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    AllWorkers,
    Leader,
}

impl Phase {
    pub fn schedule(&self) -> Schedule {
        match self {
            Phase::Dedup | Phase::IndexBuild | Phase::Match { .. } => Schedule::AllWorkers,
            Phase::Census | Phase::Compact { .. } | Phase::Finalize => Schedule::Leader,
        }
    }

    /// Whether `worker_id` executes this phase's body
    #[inline]
    pub fn runs_on(&self, worker_id: usize) -> bool {
        match self.schedule() {
            Schedule::AllWorkers => true,
            Schedule::Leader => worker_id == 0,
        }
    }
}

/// Plan for segments of `segment_length` symbols.
///
/// Match passes go from `segment_length - 1` down to 1. A compaction follows
/// every pass except the last, since nothing reads the skip-chain after it.
pub fn phase_plan(segment_length: usize) -> Vec<Phase> {
    let mut plan = vec![Phase::Dedup, Phase::Census, Phase::IndexBuild];
    for substring_length in (1..segment_length).rev() {
        plan.push(Phase::Match { substring_length });
        if substring_length > 1 {
            plan.push(Phase::Compact { substring_length });
        }
    }
    plan.push(Phase::Finalize);
    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_for_four_symbol_segments() {
        assert_eq!(
            phase_plan(4),
            vec![
                Phase::Dedup,
                Phase::Census,
                Phase::IndexBuild,
                Phase::Match { substring_length: 3 },
                Phase::Compact { substring_length: 3 },
                Phase::Match { substring_length: 2 },
                Phase::Compact { substring_length: 2 },
                Phase::Match { substring_length: 1 },
                Phase::Finalize,
            ]
        );
    }

    #[test]
    fn test_single_symbol_segments_skip_matching() {
        assert_eq!(
            phase_plan(1),
            vec![Phase::Dedup, Phase::Census, Phase::IndexBuild, Phase::Finalize]
        );
    }

    #[test]
    fn test_schedules() {
        assert!(Phase::Dedup.runs_on(3));
        assert!(Phase::Match { substring_length: 2 }.runs_on(1));
        assert!(Phase::Finalize.runs_on(0));
        assert!(!Phase::Census.runs_on(1));
        assert!(!Phase::Compact { substring_length: 2 }.runs_on(2));
    }
}
