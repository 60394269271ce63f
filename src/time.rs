//! The liveness predicate.
//!
//! Every expiry decision in the library goes through [`is_live`], with the
//! same fixed tolerance, regardless of whether `now` came from the storage
//! substrate or the calling process. Keeping the policy in one function makes
//! cleanup behaviour auditable: a record is live exactly when
//! `now < expires_at + tolerance`.

/// Returns `true` while a record whose lease ends at `expires_at_ms` should
/// still be treated as held, given `now_ms` from the backend's time
/// authority.
///
/// `tolerance_ms` absorbs bounded clock skew between clients that share a
/// client-time backend. Callers pass [`crate::constants::TOLERANCE_MS`]; the
/// parameter exists so the predicate itself stays a pure function.
pub fn is_live(now_ms: i64, expires_at_ms: i64, tolerance_ms: i64) -> bool {
    now_ms < expires_at_ms + tolerance_ms
}

/// Current wall-clock time in unix milliseconds, for client-time backends.
pub(crate) fn wall_clock_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_before_expiry() {
        assert!(is_live(1_000, 2_000, 1_000));
    }

    #[test]
    fn live_inside_tolerance_window() {
        // Expired on paper, but within the skew allowance.
        assert!(is_live(2_500, 2_000, 1_000));
        assert!(is_live(2_999, 2_000, 1_000));
    }

    #[test]
    fn dead_at_tolerance_boundary() {
        assert!(!is_live(3_000, 2_000, 1_000));
        assert!(!is_live(3_001, 2_000, 1_000));
    }

    #[test]
    fn zero_tolerance_expires_exactly_at_deadline() {
        assert!(is_live(1_999, 2_000, 0));
        assert!(!is_live(2_000, 2_000, 0));
    }

    #[test]
    fn wall_clock_is_plausible() {
        // 2020-01-01 in unix millis; any sane clock is past this.
        assert!(wall_clock_ms() > 1_577_836_800_000);
    }
}
