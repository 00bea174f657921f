//! Cost gate deciding between in-place patching and a full rewrite.
//!
//! The estimate works on block counts alone:
//!
//! ```text
//! appending = |N - C|
//! replacing = C - copy_total
//! cost      = replacing * 2 + appending      accept iff cost <= N
//! ```
//!
//! Replaced blocks count twice because their old bytes stay in the scratch
//! area until the patch commits. With variable-sized blocks this would have to
//! use byte sizes instead of counts.

use crate::error::IneligibleReason;
use crate::state::PullState;
use crate::trace;

/// Block-count estimate produced by the admission heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionEstimate {
    /// Blocks added or removed.
    pub appending: usize,
    /// Current blocks whose content will not be reused by an intra-file copy.
    pub replacing: usize,
    /// `replacing * 2 + appending`.
    pub estimated_cost: usize,
    /// Target block count; the cost of writing the file fresh.
    pub budget: usize,
}

impl AdmissionEstimate {
    /// Computes the estimate for `current` and `target` block counts.
    #[must_use]
    pub const fn compute(current: usize, target: usize, copy_total: usize) -> Self {
        let appending = target.abs_diff(current);
        let replacing = current.saturating_sub(copy_total);
        Self {
            appending,
            replacing,
            estimated_cost: replacing.saturating_mul(2).saturating_add(appending),
            budget: target,
        }
    }

    /// Reports whether patching in place is no more expensive than a rewrite.
    #[must_use]
    pub const fn accepts(&self) -> bool {
        self.estimated_cost <= self.budget
    }
}

/// Evaluates the heuristic, returning the estimate when the file is accepted.
pub fn evaluate(state: &PullState) -> Result<AdmissionEstimate, IneligibleReason> {
    let (current, target, copy_total) = state.counts();
    let Some(current) = current else {
        trace::admission_rejected(state.key(), None);
        return Err(IneligibleReason::NoCurrentFile);
    };

    let estimate = AdmissionEstimate::compute(current, target, copy_total);
    if estimate.accepts() {
        trace::admission_accepted(state.key(), &estimate);
        Ok(estimate)
    } else {
        trace::admission_rejected(state.key(), Some(&estimate));
        Err(IneligibleReason::CostExceeded {
            estimated: estimate.estimated_cost,
            budget: estimate.budget,
        })
    }
}

/// Returns `true` when `state` should be updated in place.
///
/// Always `false` when no current file exists.
#[must_use]
pub fn should_update_in_place(state: &PullState) -> bool {
    evaluate(state).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::FileKey;
    use blocks::FileVersion;
    use proptest::prelude::*;

    fn state(current: Option<&[u8]>, target: &[u8]) -> PullState {
        PullState::new(
            FileKey::new("folder", "file"),
            current.map(|data| FileVersion::from_bytes(data, 1).expect("hash")),
            FileVersion::from_bytes(target, 1).expect("hash"),
        )
    }

    #[test]
    fn swap_with_one_new_block_is_accepted() {
        let state = state(Some(b"abcd"), b"acbe");
        state.set_copy_total(3);
        let estimate = evaluate(&state).expect("accepted");
        assert_eq!(estimate.appending, 0);
        assert_eq!(estimate.replacing, 1);
        assert_eq!(estimate.estimated_cost, 2);
        assert!(should_update_in_place(&state));
    }

    #[test]
    fn mostly_new_content_is_rejected() {
        let state = state(Some(b"ab"), b"ABCDEFGHIJKLMNOPQRST");
        assert_eq!(
            evaluate(&state),
            Err(IneligibleReason::CostExceeded {
                estimated: 22,
                budget: 20
            })
        );
        assert!(!should_update_in_place(&state));
    }

    #[test]
    fn missing_current_file_is_rejected() {
        let state = state(None, b"abc");
        state.set_copy_total(3);
        assert_eq!(evaluate(&state), Err(IneligibleReason::NoCurrentFile));
    }

    #[test]
    fn shrinking_counts_removed_blocks() {
        let estimate = AdmissionEstimate::compute(10, 6, 6);
        assert_eq!(estimate.appending, 4);
        assert_eq!(estimate.replacing, 4);
        assert!(!estimate.accepts());
    }

    proptest! {
        #[test]
        fn matches_closed_form(
            current in 0usize..200,
            target in 0usize..200,
            copy_seed in 0usize..=200,
        ) {
            let copy_total = if current == 0 { 0 } else { copy_seed % (current + 1) };
            let estimate = AdmissionEstimate::compute(current, target, copy_total);
            let expected = (current - copy_total) * 2 + current.abs_diff(target) <= target;
            prop_assert_eq!(estimate.accepts(), expected);
        }

        #[test]
        fn no_current_is_never_accepted(target in 0usize..64, copy_total in 0usize..64) {
            let state = PullState::new(
                FileKey::new("folder", "file"),
                None,
                FileVersion::from_bytes(&vec![7u8; target], 1).expect("hash"),
            );
            state.set_copy_total(copy_total);
            prop_assert!(!should_update_in_place(&state));
        }
    }
}
