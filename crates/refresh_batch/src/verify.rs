//! Final row-count check for a batched mutation.

use serde::Serialize;
use tracing::warn;

use crate::error::{MutationError, MutationResult};
use crate::spec::ExecutionMode;

/// Outcome of comparing the expected and actual affected-row totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Verdict {
    Match,
    /// Simulated runs report mismatches without failing: nothing was
    /// written and the table may have drifted since the caller counted it.
    MismatchTolerated { expected: u64, actual: u64 },
}

pub struct VerificationGate;

impl VerificationGate {
    pub fn verify(expected: u64, actual: u64, mode: ExecutionMode) -> MutationResult<Verdict> {
        if expected == actual {
            return Ok(Verdict::Match);
        }
        match mode {
            ExecutionMode::Apply => Err(MutationError::RowCountMismatch { expected, actual }),
            ExecutionMode::Simulate => {
                warn!(
                    expected,
                    actual, "dry run row count differs from expected; continuing"
                );
                Ok(Verdict::MismatchTolerated { expected, actual })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_counts_pass_in_both_modes() {
        for mode in [ExecutionMode::Apply, ExecutionMode::Simulate] {
            assert_eq!(VerificationGate::verify(3, 3, mode).unwrap(), Verdict::Match);
        }
    }

    #[test]
    fn mismatch_is_fatal_when_applying() {
        let err = VerificationGate::verify(2, 3, ExecutionMode::Apply).unwrap_err();
        assert!(matches!(
            err,
            MutationError::RowCountMismatch {
                expected: 2,
                actual: 3
            }
        ));
    }

    #[test]
    fn mismatch_is_a_warning_when_simulating() {
        let verdict = VerificationGate::verify(2, 3, ExecutionMode::Simulate).unwrap();
        assert_eq!(
            verdict,
            Verdict::MismatchTolerated {
                expected: 2,
                actual: 3
            }
        );
    }
}
