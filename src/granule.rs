// Pure Rust Ogg Opus container reader
//
// Copyright (c) 2016 est31 <MTest31@outlook.com>
// and contributors. All rights reserved.
// Licensed under MIT license, or Apache 2 license,
// at your option. Please see the LICENSE file
// attached to this source distribution for details.

/*!
Overflow-safe arithmetic on Ogg granule positions.

A granule position (GP) is a 64-bit quantity used both as a per-page timestamp and, at
value `-1`, as a tombstone meaning "no packet completed on this page". Treated as a
timestamp, the domain wraps: `0 .. i64::MAX, i64::MIN .. -2` is the ordered sequence, with
`-1` excluded (it sits exactly at the wrap seam between `-2` and `0`). These three
primitives are the only place GP arithmetic is permitted; every other module combines
timestamps by calling into this one.
*/

use crate::error::{Error, Result};

/// The reserved "no granule position yet" marker.
pub const INVALID: i64 = -1;

/// Returns whether `gp` is the reserved invalid marker.
pub fn is_invalid(gp: i64) -> bool {
    gp == INVALID
}

fn check_defined(gp: i64) -> Result<()> {
    if is_invalid(gp) {
        Err(Error::BadTimestamp("granule position is the invalid marker (-1)"))
    } else {
        Ok(())
    }
}

/// Adds a (possibly negative) sample delta to a granule position.
///
/// Succeeds across the `i64::MAX -> i64::MIN` boundary (that wrap is the normal one this
/// domain expects). Fails only if the result would step onto, or pass through, the
/// forbidden `-1` value. The delta is a full `i64` rather than the `i32` per-packet
/// durations alone would need, since the seek engine also uses this to add whole PCM
/// offsets (which routinely exceed `i32::MAX` samples) to a link's `pcm_start`.
pub fn add(src: i64, delta: i64) -> Result<i64> {
    check_defined(src)?;

    let src_rank = src as u64 as i128;
    let forbidden_rank = u64::MAX as i128; // rank of -1
    let delta = delta as i128;

    if delta >= 0 {
        // Forward distance from src to the forbidden rank, wrapping through the 2^64 ring.
        let fwd = (forbidden_rank - src_rank).rem_euclid(1i128 << 64);
        if fwd <= delta {
            return Err(Error::BadTimestamp(
                "granule position addition would step onto or past the invalid marker",
            ));
        }
    } else {
        // Backward distance from src to the forbidden rank.
        let bwd = (src_rank - forbidden_rank).rem_euclid(1i128 << 64);
        if bwd <= -delta {
            return Err(Error::BadTimestamp(
                "granule position subtraction would step onto or past the invalid marker",
            ));
        }
    }

    let new_rank = (src_rank + delta).rem_euclid(1i128 << 64);
    Ok(new_rank as u64 as i64)
}

/// Returns the signed distance `a - b`, accounting for the wraparound order of the domain.
///
/// Fails iff the true distance between `a` and `b` (taking the wraparound into account)
/// does not fit in a signed 64-bit integer; this only happens for pairs that are
/// implausibly far apart (more than half the domain), which in practice means corrupt
/// input, not a legitimate pair of timestamps from one continuous stream.
pub fn diff(a: i64, b: i64) -> Result<i64> {
    check_defined(a)?;
    check_defined(b)?;

    let overflow = || Error::BadTimestamp("granule position difference overflows i64");

    if (a < 0) == (b < 0) {
        // Same half of the domain: the direct difference always fits.
        return Ok((a as i128 - b as i128) as i64);
    }

    if a < 0 {
        // `a` has wrapped past i64::MAX into negative territory but `b` has not: the
        // distance is positive, going b -> i64::MAX -> i64::MIN -> a.
        let to_max = i64::MAX as i128 - b as i128;
        let from_min = a as i128 - i64::MIN as i128;
        let total = to_max + 1 + from_min;
        if total > i64::MAX as i128 {
            return Err(overflow());
        }
        Ok(total as i64)
    } else {
        // `b` has wrapped but `a` has not: the distance is negative, symmetric to above.
        let to_max = i64::MAX as i128 - a as i128;
        let from_min = b as i128 - i64::MIN as i128;
        let total = to_max + 1 + from_min;
        if total > i64::MAX as i128 {
            return Err(overflow());
        }
        Ok(-(total as i64))
    }
}

/// Total order over the wrapping domain (excluding `-1`, which is rejected).
///
/// Returns `-1`, `0`, or `1` as `a` compares less than, equal to, or greater than `b`.
pub fn cmp(a: i64, b: i64) -> Result<i32> {
    check_defined(a)?;
    check_defined(b)?;

    if a < 0 {
        if b >= 0 {
            return Ok(1);
        }
        // Both negative: fall through to the direct comparison below.
    } else if b < 0 {
        return Ok(-1);
    }
    Ok(match a.cmp(&b) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_rejected_everywhere() {
        assert!(add(INVALID, 10).is_err());
        assert!(diff(INVALID, 0).is_err());
        assert!(diff(0, INVALID).is_err());
        assert!(cmp(INVALID, 0).is_err());
        assert!(cmp(0, INVALID).is_err());
    }

    #[test]
    fn add_then_subtract_round_trips() {
        let x = 1_000_000i64;
        let r = add(x, 48_000).unwrap();
        assert_eq!(r, x + 48_000);
        assert_eq!(add(r, -48_000).unwrap(), x);
    }

    #[test]
    fn add_refuses_to_land_on_or_pass_invalid() {
        // Landing exactly on -1.
        assert!(add(-4, 3).is_err());
        // Passing through -1 without landing on it exactly.
        assert!(add(-4, 4).is_err());
        // Just short of -1 is fine.
        assert!(add(-4, 2).is_ok());
    }

    #[test]
    fn diff_antisymmetric() {
        let a = 1_000i64;
        let b = 2_000i64;
        assert_eq!(diff(a, b).unwrap(), -diff(b, a).unwrap());
    }

    #[test]
    fn cmp_is_total_order() {
        assert_eq!(cmp(5, 10).unwrap(), -1);
        assert_eq!(cmp(10, 5).unwrap(), 1);
        assert_eq!(cmp(10, 10).unwrap(), 0);
    }

    #[test]
    fn wraps_across_positive_negative_boundary() {
        let near_max = i64::MAX - 10;
        let r = add(near_max, 20).unwrap();
        assert!(r < 0);
        assert_ne!(r, INVALID);
        assert_eq!(diff(r, near_max).unwrap(), 20);
    }

    #[test]
    fn diff_across_wrap_seam_matches_step_count() {
        let b = i64::MAX - 2;
        let a = i64::MIN + 3;
        // b -> MAX-1 -> MAX -> MIN -> MIN+1 -> MIN+2 -> MIN+3(=a): 6 steps.
        assert_eq!(diff(a, b).unwrap(), 6);
        assert_eq!(cmp(a, b).unwrap(), 1);
    }
}
