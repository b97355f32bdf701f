//! Run-level configuration shared by every algorithm family.

use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use crate::error::{DiapError, Result};

/// Bit mask selecting optional outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct ResultsToCompute(u32);

impl ResultsToCompute {
    pub const NONE: ResultsToCompute = ResultsToCompute(0);
    pub const ASSIGNMENTS: ResultsToCompute = ResultsToCompute(1);
    pub const OBJECTIVE_FUNCTION: ResultsToCompute = ResultsToCompute(1 << 1);
    pub const CORE_INDICES: ResultsToCompute = ResultsToCompute(1 << 2);
    pub const ALL: ResultsToCompute = ResultsToCompute(0b111);

    pub fn from_bits(bits: u32) -> Result<Self> {
        if bits & !Self::ALL.0 != 0 {
            return Err(DiapError::InvalidConfig(format!(
                "results_to_compute has unknown bits {:#b}",
                bits & !Self::ALL.0
            )));
        }
        Ok(Self(bits))
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: ResultsToCompute) -> bool {
        self.0 & other.0 == other.0
    }
}

impl TryFrom<u32> for ResultsToCompute {
    type Error = DiapError;

    fn try_from(bits: u32) -> Result<Self> {
        Self::from_bits(bits)
    }
}

impl From<ResultsToCompute> for u32 {
    fn from(mask: ResultsToCompute) -> u32 {
        mask.0
    }
}

impl Default for ResultsToCompute {
    fn default() -> Self {
        Self::OBJECTIVE_FUNCTION
    }
}

impl BitOr for ResultsToCompute {
    type Output = ResultsToCompute;

    fn bitor(self, rhs: Self) -> Self::Output {
        ResultsToCompute(self.0 | rhs.0)
    }
}

/// What to do when a shard fails permanently during a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ShardFailurePolicy {
    /// Abort the run.
    #[default]
    Fatal,
    /// Retire the shard and continue with the others.
    Degrade,
}

impl fmt::Display for ShardFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardFailurePolicy::Fatal => write!(f, "fatal"),
            ShardFailurePolicy::Degrade => write!(f, "degrade"),
        }
    }
}

/// Termination knobs for an iterative run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminationConfig {
    /// Hard cap on rounds; reaching it is a normal termination.
    pub max_iterations: u32,
    /// Algorithm-specific threshold compared against a merge measure.
    pub convergence_threshold: f64,
    pub results_to_compute: ResultsToCompute,
    pub shard_failure: ShardFailurePolicy,
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            max_iterations: 300,
            convergence_threshold: 1e-4,
            results_to_compute: ResultsToCompute::default(),
            shard_failure: ShardFailurePolicy::default(),
        }
    }
}

impl TerminationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(DiapError::InvalidConfig(
                "max_iterations must be at least 1".into(),
            ));
        }
        if !self.convergence_threshold.is_finite() || self.convergence_threshold < 0.0 {
            return Err(DiapError::InvalidConfig(
                "convergence_threshold must be a non-negative finite number".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_mask_combines_and_rejects_unknown_bits() {
        let mask = ResultsToCompute::ASSIGNMENTS | ResultsToCompute::CORE_INDICES;
        assert!(mask.contains(ResultsToCompute::ASSIGNMENTS));
        assert!(!mask.contains(ResultsToCompute::OBJECTIVE_FUNCTION));
        assert_eq!(ResultsToCompute::from_bits(mask.bits()).expect("valid"), mask);
        assert!(ResultsToCompute::from_bits(1 << 9).is_err());
    }

    #[test]
    fn termination_config_loads_from_partial_json() {
        let config: TerminationConfig =
            serde_json::from_str(r#"{ "max_iterations": 10, "shard_failure": "degrade" }"#)
                .expect("parse");
        assert_eq!(config.max_iterations, 10);
        assert_eq!(config.shard_failure, ShardFailurePolicy::Degrade);
        assert_eq!(config.convergence_threshold, 1e-4);
        config.validate().expect("valid");

        let zero = TerminationConfig {
            max_iterations: 0,
            ..TerminationConfig::default()
        };
        assert!(matches!(zero.validate(), Err(DiapError::InvalidConfig(_))));
    }

    #[test]
    fn unknown_output_bits_in_json_are_rejected() {
        let parsed = serde_json::from_str::<TerminationConfig>(r#"{ "results_to_compute": 512 }"#);
        let err = parsed.expect_err("bit 9 is not an output");
        assert!(err.to_string().contains("unknown bits"), "{err}");

        let config: TerminationConfig =
            serde_json::from_str(r#"{ "results_to_compute": 5 }"#).expect("parse");
        assert_eq!(
            config.results_to_compute,
            ResultsToCompute::ASSIGNMENTS | ResultsToCompute::CORE_INDICES
        );
        let echoed = serde_json::to_string(&config.results_to_compute).expect("serialize");
        assert_eq!(echoed, "5");
    }
}
