//! Roller policy evaluation.
//!
//! Maximum thresholds are mandatory: a segment at or past any non-zero
//! maximum must be sealed. Minimum thresholds are advisory: once all of
//! them hold, a segment may be sealed if the caller signals pressure
//! (for example a quiet topic that should not stay open forever).

use serde::Serialize;

use sliced_state::{RollerLimits, SegmentStats, TxError, TxResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SealReason {
    MaxBytes,
    MaxAge,
    MaxCount,
    /// Minima met and the caller asked for a seal.
    Advisory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollDecision {
    Keep,
    Seal(SealReason),
}

impl RollDecision {
    pub fn is_seal(&self) -> bool {
        matches!(self, RollDecision::Seal(_))
    }
}

/// Minima must not exceed their non-zero maxima.
pub fn validate_limits(limits: &RollerLimits) -> TxResult<()> {
    let pairs = [
        ("bytes", limits.min_bytes, limits.max_bytes),
        ("age", limits.min_age_ms, limits.max_age_ms),
        ("count", limits.min_count, limits.max_count),
    ];
    for (what, min, max) in pairs {
        if max > 0 && min > max {
            return Err(TxError::InvalidCommand(format!(
                "min {what} {min} exceeds max {max}"
            )));
        }
    }
    Ok(())
}

/// Evaluate a segment that has been open for `age_ms`.
pub fn evaluate(
    limits: &RollerLimits,
    stats: &SegmentStats,
    age_ms: u64,
    pressure: bool,
) -> RollDecision {
    if reached(stats.size, limits.max_bytes) {
        return RollDecision::Seal(SealReason::MaxBytes);
    }
    if reached(age_ms, limits.max_age_ms) {
        return RollDecision::Seal(SealReason::MaxAge);
    }
    if reached(stats.count, limits.max_count) {
        return RollDecision::Seal(SealReason::MaxCount);
    }
    let minima_met = stats.size >= limits.min_bytes
        && age_ms >= limits.min_age_ms
        && stats.count >= limits.min_count;
    // An empty segment is never sealed on advice alone.
    if pressure && minima_met && stats.count > 0 {
        return RollDecision::Seal(SealReason::Advisory);
    }
    RollDecision::Keep
}

fn reached(value: u64, max: u64) -> bool {
    max > 0 && value >= max
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> RollerLimits {
        RollerLimits {
            min_bytes: 100,
            min_age_ms: 1_000,
            min_count: 10,
            max_bytes: 1_000,
            max_age_ms: 60_000,
            max_count: 100,
        }
    }

    fn stats(count: u64, size: u64) -> SegmentStats {
        SegmentStats {
            count,
            size,
            ..Default::default()
        }
    }

    #[test]
    fn maxima_are_mandatory() {
        let l = limits();
        assert_eq!(
            evaluate(&l, &stats(1, 1_000), 0, false),
            RollDecision::Seal(SealReason::MaxBytes)
        );
        assert_eq!(
            evaluate(&l, &stats(1, 1), 60_000, false),
            RollDecision::Seal(SealReason::MaxAge)
        );
        assert_eq!(
            evaluate(&l, &stats(100, 1), 0, false),
            RollDecision::Seal(SealReason::MaxCount)
        );
        assert_eq!(evaluate(&l, &stats(99, 999), 59_999, false), RollDecision::Keep);
    }

    #[test]
    fn minima_need_pressure() {
        let l = limits();
        assert_eq!(evaluate(&l, &stats(10, 100), 1_000, false), RollDecision::Keep);
        assert_eq!(
            evaluate(&l, &stats(10, 100), 1_000, true),
            RollDecision::Seal(SealReason::Advisory)
        );
        assert_eq!(evaluate(&l, &stats(9, 100), 1_000, true), RollDecision::Keep);
    }

    #[test]
    fn zero_maxima_mean_unlimited() {
        let l = RollerLimits::default();
        assert_eq!(evaluate(&l, &stats(1_000_000, u64::MAX), u64::MAX, false), RollDecision::Keep);
        assert!(evaluate(&l, &stats(1, 1), 0, true).is_seal());
        assert!(!evaluate(&l, &stats(0, 0), 0, true).is_seal());
    }

    #[test]
    fn limits_validation() {
        validate_limits(&limits()).unwrap();
        let bad = RollerLimits {
            min_count: 200,
            ..limits()
        };
        assert!(validate_limits(&bad).is_err());
        let unlimited = RollerLimits {
            min_count: 200,
            max_count: 0,
            ..limits()
        };
        validate_limits(&unlimited).unwrap();
    }
}
