//! Post-action verification by fingerprint comparison.

use serde::{Deserialize, Serialize};

use super::conversation::Verification;
use crate::actions::Expectation;
use crate::capture::Fingerprint;

/// Verification thresholds, in Hamming distance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Minimum distance for a screen to count as changed.
    pub change_threshold: u32,
    /// Text entry passes while the screen stays within this distance.
    pub text_entry_max_distance: u32,
    /// A cache replay must land this close to the recorded post-fingerprint.
    pub replay_tolerance: u32,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            change_threshold: 2,
            text_entry_max_distance: 24,
            replay_tolerance: 10,
        }
    }
}

impl VerifyConfig {
    pub fn with_change_threshold(mut self, threshold: u32) -> Self {
        self.change_threshold = threshold;
        self
    }

    pub fn with_replay_tolerance(mut self, tolerance: u32) -> Self {
        self.replay_tolerance = tolerance;
        self
    }
}

/// Judge an executed action from the frames before and after it.
///
/// `expected_post` is only set for cache replays.
pub fn verify(
    expectation: Expectation,
    pre: Fingerprint,
    post: Fingerprint,
    expected_post: Option<Fingerprint>,
    config: &VerifyConfig,
) -> Verification {
    let distance = pre.distance(post);
    let passed = match expectation {
        Expectation::Unverifiable => return Verification::Skipped,
        Expectation::ScreenChanged => distance >= config.change_threshold,
        Expectation::MinorChange => distance <= config.text_entry_max_distance,
    };
    if !passed {
        return Verification::Failed;
    }
    match expected_post {
        Some(expected) if expected.distance(post) > config.replay_tolerance => {
            Verification::Failed
        }
        _ => Verification::Passed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAME: Fingerprint = Fingerprint(0);
    const FAR: Fingerprint = Fingerprint(u64::MAX);

    #[test]
    fn test_screen_change_required_for_pointer_actions() {
        let cfg = VerifyConfig::default();
        assert_eq!(
            verify(Expectation::ScreenChanged, SAME, FAR, None, &cfg),
            Verification::Passed
        );
        assert_eq!(
            verify(Expectation::ScreenChanged, SAME, Fingerprint(1), None, &cfg),
            Verification::Failed
        );
    }

    #[test]
    fn test_text_entry_tolerates_small_or_no_change() {
        let cfg = VerifyConfig::default();
        assert_eq!(
            verify(Expectation::MinorChange, SAME, SAME, None, &cfg),
            Verification::Passed
        );
        assert_eq!(
            verify(Expectation::MinorChange, SAME, FAR, None, &cfg),
            Verification::Failed
        );
    }

    #[test]
    fn test_unverifiable_is_skipped() {
        let cfg = VerifyConfig::default();
        assert_eq!(
            verify(Expectation::Unverifiable, SAME, SAME, Some(FAR), &cfg),
            Verification::Skipped
        );
    }

    #[test]
    fn test_replay_must_reach_recorded_screen() {
        let cfg = VerifyConfig::default();
        assert_eq!(
            verify(Expectation::ScreenChanged, SAME, FAR, Some(FAR), &cfg),
            Verification::Passed
        );
        // changed, but not to the screen seen when the entry was recorded
        assert_eq!(
            verify(
                Expectation::ScreenChanged,
                SAME,
                Fingerprint(0xffff_ffff),
                Some(FAR),
                &cfg
            ),
            Verification::Failed
        );
    }
}
