//! Quorum and acceptance policy.

use sapphire_core::defaults;

/// When a set of submissions is good enough to close an image.
#[derive(Debug, Clone)]
pub struct ConsensusPolicy {
    /// Submissions required before consensus is evaluated.
    pub quorum: usize,
    /// Parseable qualified submissions required for acceptance.
    pub min_qualified: usize,
    /// Largest allowed center deviation, as a fraction of the consensus
    /// region's width (x axis) or height (y axis).
    pub tolerance: f64,
    /// Evaluate after every submission.
    pub evaluate_on_submit: bool,
}

impl Default for ConsensusPolicy {
    fn default() -> Self {
        Self {
            quorum: defaults::CONSENSUS_QUORUM,
            min_qualified: defaults::CONSENSUS_MIN_QUALIFIED,
            tolerance: defaults::CONSENSUS_TOLERANCE,
            evaluate_on_submit: true,
        }
    }
}

impl ConsensusPolicy {
    /// Load policy from environment variables.
    ///
    /// - `CONSENSUS_QUORUM`: submissions per image (default: 3)
    /// - `CONSENSUS_MIN_QUALIFIED`: qualified submissions to accept (default: 2)
    /// - `CONSENSUS_TOLERANCE`: allowed center deviation (default: 0.5)
    pub fn from_env() -> Self {
        let quorum = std::env::var("CONSENSUS_QUORUM")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::CONSENSUS_QUORUM)
            .max(1);

        let min_qualified = std::env::var("CONSENSUS_MIN_QUALIFIED")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::CONSENSUS_MIN_QUALIFIED)
            .max(1);

        let tolerance = std::env::var("CONSENSUS_TOLERANCE")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|t| t.is_finite() && *t >= 0.0)
            .unwrap_or(defaults::CONSENSUS_TOLERANCE);

        Self {
            quorum,
            min_qualified,
            tolerance,
            evaluate_on_submit: true,
        }
    }

    pub fn with_quorum(mut self, quorum: usize) -> Self {
        self.quorum = quorum;
        self
    }

    pub fn with_min_qualified(mut self, min_qualified: usize) -> Self {
        self.min_qualified = min_qualified;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Enable or disable evaluation after each submission.
    pub fn with_evaluate_on_submit(mut self, enabled: bool) -> Self {
        self.evaluate_on_submit = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = ConsensusPolicy::default();
        assert_eq!(policy.quorum, 3);
        assert_eq!(policy.min_qualified, 2);
        assert_eq!(policy.tolerance, 0.5);
        assert!(policy.evaluate_on_submit);
    }

    #[test]
    fn test_policy_builder() {
        let policy = ConsensusPolicy::default()
            .with_quorum(5)
            .with_min_qualified(4)
            .with_tolerance(0.25)
            .with_evaluate_on_submit(false);

        assert_eq!(policy.quorum, 5);
        assert_eq!(policy.min_qualified, 4);
        assert_eq!(policy.tolerance, 0.25);
        assert!(!policy.evaluate_on_submit);
    }
}
