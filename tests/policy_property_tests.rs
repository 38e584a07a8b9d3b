//! Property tests for the pure decision rules: delivery status aggregation,
//! retry backoff shaping, and result flag derivation.
//!
//! Testing library/framework: proptest over the crate's policy functions.
//! No ledgers, no runtime; these rules must hold for any input.

use std::time::Duration;

use proptest::prelude::*;

use labflow::dispatch::{ChannelResolution, ReportDeliveryStatus, RetryPolicy};
use labflow::lifecycle::{FlagLevel, ReferenceRange};

fn resolution_strategy() -> impl Strategy<Value = ChannelResolution> {
    prop_oneof![
        Just(ChannelResolution::Unresolved),
        Just(ChannelResolution::Delivered),
        Just(ChannelResolution::Failed),
    ]
}

proptest! {
    /// The aggregate is terminal exactly when every channel is terminal,
    /// and an empty channel set never reads as terminal.
    #[test]
    fn aggregate_is_terminal_iff_every_channel_resolved(
        resolutions in prop::collection::vec(resolution_strategy(), 0..8),
    ) {
        let status = ReportDeliveryStatus::aggregate(resolutions.clone());
        let unresolved = resolutions
            .iter()
            .any(|r| matches!(r, ChannelResolution::Unresolved));
        prop_assert_eq!(
            status.is_terminal(),
            !resolutions.is_empty() && !unresolved
        );
    }

    /// Terminal aggregates follow the channel mix: all delivered, all
    /// failed, or one of each kind present.
    #[test]
    fn aggregate_reflects_the_terminal_mix(
        delivered in 0usize..5,
        failed in 0usize..5,
    ) {
        prop_assume!(delivered + failed > 0);
        let resolutions = std::iter::repeat(ChannelResolution::Delivered)
            .take(delivered)
            .chain(std::iter::repeat(ChannelResolution::Failed).take(failed));
        let expected = if failed == 0 {
            ReportDeliveryStatus::Delivered
        } else if delivered == 0 {
            ReportDeliveryStatus::Failed
        } else {
            ReportDeliveryStatus::Partial
        };
        prop_assert_eq!(ReportDeliveryStatus::aggregate(resolutions), expected);
    }

    /// Channel order never changes the aggregate.
    #[test]
    fn aggregate_ignores_channel_order(
        mut resolutions in prop::collection::vec(resolution_strategy(), 1..8),
        rotation in 0usize..8,
    ) {
        let baseline = ReportDeliveryStatus::aggregate(resolutions.clone());
        let len = resolutions.len();
        resolutions.rotate_left(rotation % len);
        prop_assert_eq!(ReportDeliveryStatus::aggregate(resolutions), baseline);
    }

    /// Without jitter the delay doubles per failure until the cap and never
    /// exceeds it, whatever the attempt number.
    #[test]
    fn backoff_doubles_up_to_the_cap(
        base_secs in 1u64..=120,
        failed_attempt in 1u32..=64,
    ) {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(base_secs),
            max_delay: Duration::from_secs(base_secs * 32),
            jitter: false,
        };
        let delay = policy.delay_after(failed_attempt);
        prop_assert!(delay >= policy.base_delay);
        prop_assert!(delay <= policy.max_delay);
        if failed_attempt > 1 {
            let previous = policy.delay_after(failed_attempt - 1);
            prop_assert!(delay >= previous);
            if previous < policy.max_delay {
                prop_assert_eq!(delay, previous * 2);
            }
        }
    }

    /// Jitter only ever shortens the delay, and by at most half.
    #[test]
    fn jitter_shortens_by_at_most_half(
        base_secs in 1u64..=120,
        failed_attempt in 1u32..=8,
    ) {
        let exact = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(base_secs),
            max_delay: Duration::from_secs(base_secs * 32),
            jitter: false,
        };
        let jittered = RetryPolicy {
            jitter: true,
            ..exact.clone()
        };
        let ceiling = exact.delay_after(failed_attempt);
        let delay = jittered.delay_after(failed_attempt);
        prop_assert!(delay <= ceiling);
        prop_assert!(delay.as_secs_f64() >= ceiling.as_secs_f64() * 0.5 * 0.999);
    }

    /// Every value inside the reference range is Normal; everything outside
    /// is flagged on the correct side, Critical once it is more than two
    /// range spans beyond the bound.
    #[test]
    fn flags_partition_the_number_line(
        low in -500.0f64..500.0,
        span in 0.1f64..200.0,
        value in -5_000.0f64..5_000.0,
    ) {
        let range = ReferenceRange { low, high: low + span };
        let span = range.high - range.low;
        let flag = range.flag_for(value);
        if value >= range.low && value <= range.high {
            prop_assert_eq!(flag, FlagLevel::Normal);
        } else if value > range.high {
            if value > range.high + 2.0 * span {
                prop_assert_eq!(flag, FlagLevel::Critical);
            } else {
                prop_assert_eq!(flag, FlagLevel::High);
            }
        } else if value < range.low - 2.0 * span {
            prop_assert_eq!(flag, FlagLevel::Critical);
        } else {
            prop_assert_eq!(flag, FlagLevel::Low);
        }
        if flag != FlagLevel::Normal {
            prop_assert!(value < range.low || value > range.high);
        }
    }
}
