//! Host buffer size selection against device constraints.

use crate::device::BufferSizeRange;
use crate::error::{Error, Result};
use crate::options::BufferSizePolicy;

/// Granularity value meaning valid sizes are powers of two.
pub const GRANULARITY_POWER_OF_TWO: i32 = -1;

/// Select the host buffer frame count.
///
/// With `user_frames` given the result is always an exact multiple of it;
/// without, the target latency is quantized into the device's range. The
/// `PreferredOnly` policy bypasses selection entirely.
pub fn select(
    target_latency_frames: usize,
    user_frames: Option<usize>,
    range: &BufferSizeRange,
    policy: BufferSizePolicy,
) -> Result<usize> {
    if policy == BufferSizePolicy::PreferredOnly {
        return Ok(range.preferred);
    }
    match user_frames {
        None | Some(0) => Ok(select_unspecified(target_latency_frames, range)),
        Some(frames) => select_specified(target_latency_frames, frames, range),
    }
}

/// Choose a size from the target latency alone. Always yields a valid value.
fn select_unspecified(target: usize, range: &BufferSizeRange) -> usize {
    if target <= range.min {
        return range.min;
    }
    if target >= range.max {
        return range.max;
    }
    match range.granularity {
        0 => range.preferred,
        GRANULARITY_POWER_OF_TWO => target.next_power_of_two().clamp(range.min, range.max),
        granularity => {
            let step = granularity as usize;
            let rounded = target.div_ceil(step) * step;
            rounded.clamp(range.min, range.max)
        }
    }
}

/// Choose a size that is an exact multiple of `user_frames`.
///
/// Candidates are walked in ascending order; the first multiple at or above
/// the target wins, otherwise the largest multiple below it.
fn select_specified(target: usize, user_frames: usize, range: &BufferSizeRange) -> Result<usize> {
    debug_assert!(user_frames != 0);

    let mut result = None;
    match range.granularity {
        0 => {
            if range.preferred % user_frames == 0 {
                result = Some(range.preferred);
            }
        }
        GRANULARITY_POWER_OF_TWO => {
            let mut x = range.min;
            while x <= range.max {
                if x % user_frames == 0 {
                    result = Some(x);
                    if x >= target {
                        break;
                    }
                }
                match x.checked_mul(2) {
                    Some(next) => x = next,
                    None => break,
                }
            }
        }
        granularity => {
            let step = granularity as usize;
            let mut x = range.min;
            while x <= range.max {
                if x % user_frames == 0 {
                    result = Some(x);
                    if x >= target {
                        break;
                    }
                }
                match x.checked_add(step) {
                    Some(next) => x = next,
                    None => break,
                }
            }
        }
    }

    result.ok_or(Error::NoCompatibleBufferSize {
        min: range.min,
        max: range.max,
        user_frames,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pow2_range() -> BufferSizeRange {
        BufferSizeRange {
            min: 64,
            max: 4096,
            preferred: 256,
            granularity: GRANULARITY_POWER_OF_TWO,
        }
    }

    fn stepped_range() -> BufferSizeRange {
        BufferSizeRange {
            min: 96,
            max: 960,
            preferred: 480,
            granularity: 96,
        }
    }

    fn fixed_range() -> BufferSizeRange {
        BufferSizeRange {
            min: 512,
            max: 512,
            preferred: 512,
            granularity: 0,
        }
    }

    #[test]
    fn unspecified_clamps_to_range() {
        let range = pow2_range();
        assert_eq!(select_unspecified(1, &range), 64);
        assert_eq!(select_unspecified(100_000, &range), 4096);
    }

    #[test]
    fn unspecified_rounds_to_power_of_two() {
        let range = pow2_range();
        assert_eq!(select_unspecified(300, &range), 512);
        assert_eq!(select_unspecified(512, &range), 512);
        assert_eq!(select_unspecified(513, &range), 1024);
    }

    #[test]
    fn unspecified_rounds_to_granularity_step() {
        let range = stepped_range();
        assert_eq!(select_unspecified(100, &range), 192);
        assert_eq!(select_unspecified(192, &range), 192);
        assert_eq!(select_unspecified(700, &range), 768);
    }

    #[test]
    fn unspecified_fixed_size_returns_preferred() {
        // min < target < max cannot happen for a truly fixed range, but a
        // buggy driver can report min/max wider than preferred.
        let range = BufferSizeRange {
            min: 128,
            max: 1024,
            preferred: 512,
            granularity: 0,
        };
        assert_eq!(select_unspecified(300, &range), 512);
    }

    #[test]
    fn specified_prefers_first_multiple_at_or_above_target() {
        let range = pow2_range();
        assert_eq!(select(600, Some(128), &range, BufferSizePolicy::Latency).unwrap(), 1024);
        assert_eq!(select(100, Some(64), &range, BufferSizePolicy::Latency).unwrap(), 128);
    }

    #[test]
    fn specified_falls_back_to_largest_below_target() {
        let range = stepped_range();
        // Multiples of 192 in {96, 192, ..., 960} top out at 960.
        assert_eq!(
            select(10_000, Some(192), &range, BufferSizePolicy::Latency).unwrap(),
            960
        );
    }

    #[test]
    fn specified_fails_when_no_multiple_exists() {
        let range = pow2_range();
        assert!(matches!(
            select(256, Some(192), &range, BufferSizePolicy::Latency),
            Err(Error::NoCompatibleBufferSize { .. })
        ));
    }

    #[test]
    fn specified_fixed_size_requires_divisibility() {
        let range = fixed_range();
        assert_eq!(select(0, Some(128), &range, BufferSizePolicy::Latency).unwrap(), 512);
        assert!(select(0, Some(384), &range, BufferSizePolicy::Latency).is_err());
    }

    #[test]
    fn preferred_only_policy_ignores_everything() {
        let range = pow2_range();
        assert_eq!(
            select(4096, Some(192), &range, BufferSizePolicy::PreferredOnly).unwrap(),
            256
        );
    }

    #[test]
    fn selection_is_idempotent_and_in_range() {
        let ranges = [pow2_range(), stepped_range(), fixed_range()];
        for range in &ranges {
            for target in [0usize, 64, 200, 500, 1000, 5000] {
                let a = select_unspecified(target, range);
                let b = select_unspecified(target, range);
                assert_eq!(a, b);
                assert!(a >= range.min && a <= range.max);
            }
        }
        for target in [0usize, 100, 512, 3000] {
            for user in [64usize, 128, 256] {
                if let Ok(frames) = select(target, Some(user), &pow2_range(), BufferSizePolicy::Latency) {
                    assert_eq!(frames % user, 0);
                    assert!(frames >= 64 && frames <= 4096);
                }
            }
        }
    }
}
