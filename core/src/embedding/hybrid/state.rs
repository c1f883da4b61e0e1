//! The classification state machine of the hybrid embedding.
//!
//! ```text
//! Collecting --window elapsed--> Classified --interval elapsed | p_dup exceeded--> Recollecting
//!                                    ^                                               |
//!                                    +-----------------window elapsed----------------+
//! ```
//!
//! Every transition first checks that all GPUs report the same iteration.

use crate::distributed::agree_on_iteration;
use crate::error::{EmbeddingError, Result};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HybridPhase {
    /// No classification yet; every key takes the partitioned path.
    Collecting,
    /// The frequent set is fixed.
    Classified,
    /// The previous frequent set stays in use while new statistics are gathered.
    Recollecting,
}

/// What the caller must do after an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Stay,
    /// Classify from the collected statistics.
    Classify,
    /// Drop the statistics and start a new window.
    StartCollecting,
}

#[derive(Debug, Clone)]
pub struct PhaseMachine {
    phase: HybridPhase,
    window: u64,
    reclassify_interval: u64,
    phase_start: u64,
    dup_exceeded: bool,
}

impl PhaseMachine {
    /// `window` iterations of statistics per classification; `reclassify_interval` of 0
    /// disables periodic reclassification.
    pub fn new(window: usize, reclassify_interval: usize) -> Result<Self> {
        if window == 0 {
            return Err(EmbeddingError::wrong_input(
                "num_iterations_statistics must be positive",
            ));
        }
        Ok(Self {
            phase: HybridPhase::Collecting,
            window: window as u64,
            reclassify_interval: reclassify_interval as u64,
            phase_start: 0,
            dup_exceeded: false,
        })
    }

    pub fn phase(&self) -> HybridPhase {
        self.phase
    }

    /// Whether statistics are being gathered.
    pub fn is_collecting(&self) -> bool {
        matches!(
            self.phase,
            HybridPhase::Collecting | HybridPhase::Recollecting
        )
    }

    /// Requests reclassification because the infrequent path duplicated too many requests.
    /// Only meaningful once a frequent set exists.
    pub fn flag_duplication(&mut self) {
        if self.phase == HybridPhase::Classified {
            self.dup_exceeded = true;
        }
    }

    /// Advances after an iteration. `observed` holds the iteration count of every GPU.
    pub fn end_iteration(&mut self, observed: &[u64]) -> Result<Transition> {
        let iteration = agree_on_iteration(observed)?;
        let elapsed = iteration.saturating_sub(self.phase_start);
        let transition = match self.phase {
            HybridPhase::Collecting | HybridPhase::Recollecting if elapsed >= self.window => {
                self.enter(HybridPhase::Classified, iteration);
                Transition::Classify
            }
            HybridPhase::Classified
                if self.dup_exceeded
                    || (self.reclassify_interval > 0 && elapsed >= self.reclassify_interval) =>
            {
                let reason = if self.dup_exceeded { "duplication" } else { "interval" };
                self.enter(HybridPhase::Recollecting, iteration);
                info!(iteration, reason, "hybrid embedding collecting new statistics");
                Transition::StartCollecting
            }
            _ => Transition::Stay,
        };
        Ok(transition)
    }

    fn enter(&mut self, phase: HybridPhase, iteration: u64) {
        self.phase = phase;
        self.phase_start = iteration;
        self.dup_exceeded = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_then_interval() {
        let mut m = PhaseMachine::new(2, 3).unwrap();
        assert_eq!(m.end_iteration(&[1, 1]).unwrap(), Transition::Stay);
        assert_eq!(m.end_iteration(&[2, 2]).unwrap(), Transition::Classify);
        assert_eq!(m.phase(), HybridPhase::Classified);
        assert!(!m.is_collecting());
        assert_eq!(m.end_iteration(&[3, 3]).unwrap(), Transition::Stay);
        assert_eq!(m.end_iteration(&[4, 4]).unwrap(), Transition::Stay);
        assert_eq!(m.end_iteration(&[5, 5]).unwrap(), Transition::StartCollecting);
        assert!(m.is_collecting());
        assert_eq!(m.end_iteration(&[6, 6]).unwrap(), Transition::Stay);
        assert_eq!(m.end_iteration(&[7, 7]).unwrap(), Transition::Classify);
    }

    #[test]
    fn test_duplication_flag() {
        let mut m = PhaseMachine::new(1, 0).unwrap();
        // ignored before the first classification
        m.flag_duplication();
        assert_eq!(m.end_iteration(&[1]).unwrap(), Transition::Classify);
        assert_eq!(m.end_iteration(&[2]).unwrap(), Transition::Stay);
        m.flag_duplication();
        assert_eq!(m.end_iteration(&[3]).unwrap(), Transition::StartCollecting);
    }

    #[test]
    fn test_divergent_iterations_fail() {
        let mut m = PhaseMachine::new(1, 0).unwrap();
        assert!(m.end_iteration(&[1, 2]).is_err());
        assert_eq!(m.phase(), HybridPhase::Collecting);
        assert!(PhaseMachine::new(0, 0).is_err());
    }
}
