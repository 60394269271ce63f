//! Property tests for the pure core: identifier shape, fence formatting,
//! storage-key derivation, backoff and jitter bounds, and the liveness
//! predicate.

use proptest::prelude::*;

use syncguard::engine::{apply_jitter, base_delay_ms};
use syncguard::keys::{derive_fence_key, derive_storage_key, format_fence, generate_lock_id, hash_key};
use syncguard::time::is_live;
use syncguard::validate::validate_lock_id;
use syncguard::{Backoff, Jitter};

const FENCE_CEILING: u64 = 900_000_000_000_000;

proptest! {
    // ---- fence formatting ----

    #[test]
    fn fence_is_always_15_digits(value in 1u64..=FENCE_CEILING) {
        let formatted = format_fence(value).unwrap();
        prop_assert_eq!(formatted.len(), 15);
        prop_assert!(formatted.bytes().all(|b| b.is_ascii_digit()));
        prop_assert_eq!(formatted.parse::<u64>().unwrap(), value);
    }

    #[test]
    fn fence_lexicographic_order_matches_numeric(a in 1u64..=FENCE_CEILING, b in 1u64..=FENCE_CEILING) {
        let fa = format_fence(a).unwrap();
        let fb = format_fence(b).unwrap();
        prop_assert_eq!(fa.cmp(&fb), a.cmp(&b));
    }

    #[test]
    fn fence_beyond_ceiling_always_errors(value in FENCE_CEILING + 1..u64::MAX) {
        prop_assert!(format_fence(value).is_err());
    }

    // ---- backoff ----

    #[test]
    fn fixed_backoff_never_grows(delay in 1u64..100_000, attempt in 0u32..64) {
        prop_assert_eq!(base_delay_ms(delay, attempt, Backoff::Fixed), delay);
    }

    #[test]
    fn exponential_backoff_is_base_times_power_of_two(delay in 1u64..10_000, attempt in 0u32..20) {
        prop_assert_eq!(
            base_delay_ms(delay, attempt, Backoff::Exponential),
            delay * (1u64 << attempt)
        );
    }

    #[test]
    fn exponential_backoff_is_monotonic(delay in 1u64..10_000, attempt in 0u32..62) {
        prop_assert!(
            base_delay_ms(delay, attempt + 1, Backoff::Exponential)
                >= base_delay_ms(delay, attempt, Backoff::Exponential)
        );
    }

    // ---- jitter bounds ----

    #[test]
    fn no_jitter_is_exact(base in 0u64..10_000_000, unit in 0f64..1f64) {
        prop_assert_eq!(apply_jitter(base, Jitter::None, unit), base);
    }

    #[test]
    fn full_jitter_stays_in_zero_to_base(base in 1u64..10_000_000, unit in 0f64..1f64) {
        let jittered = apply_jitter(base, Jitter::Full, unit);
        prop_assert!(jittered < base.max(1));
    }

    #[test]
    fn equal_jitter_stays_in_half_to_base(base in 2u64..10_000_000, unit in 0f64..1f64) {
        let jittered = apply_jitter(base, Jitter::Equal, unit);
        prop_assert!(jittered >= base / 2);
        prop_assert!(jittered <= base);
    }

    // ---- liveness predicate ----

    #[test]
    fn liveness_boundary_is_exact(expires in 0i64..i64::MAX / 4, tolerance in 0i64..100_000) {
        prop_assert!(is_live(expires + tolerance - 1, expires, tolerance));
        prop_assert!(!is_live(expires + tolerance, expires, tolerance));
    }

    // ---- storage keys ----

    #[test]
    fn storage_keys_always_fit_the_budget(key in ".{1,400}") {
        let storage = derive_storage_key("locks", &key, 512, 8).unwrap();
        prop_assert!(storage.len() + 8 <= 512);
        prop_assert!(storage.starts_with("locks:"));
        // Deterministic.
        prop_assert_eq!(&storage, &derive_storage_key("locks", &key, 512, 8).unwrap());
        // Fence key derivation also fits and is stable.
        let fence = derive_fence_key("locks", &storage, 512, 0).unwrap();
        prop_assert!(fence.len() <= 512);
        prop_assert_eq!(&fence, &derive_fence_key("locks", &storage, 512, 0).unwrap());
    }

    #[test]
    fn distinct_short_keys_never_collide(a in "[a-z]{1,40}", b in "[a-z]{1,40}") {
        prop_assume!(a != b);
        let ka = derive_storage_key("locks", &a, 512, 8).unwrap();
        let kb = derive_storage_key("locks", &b, 512, 8).unwrap();
        prop_assert_ne!(ka, kb);
    }

    #[test]
    fn key_hash_shape_holds_for_any_input(key in ".{0,200}") {
        let digest = hash_key(&key);
        prop_assert_eq!(digest.len(), 24);
        prop_assert!(digest.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
    }

    // ---- lock ID gate ----

    #[test]
    fn arbitrary_strings_rarely_validate(candidate in ".{0,40}") {
        let well_formed = candidate.len() == 22
            && candidate.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        prop_assert_eq!(validate_lock_id(&candidate).is_ok(), well_formed);
    }
}

#[test]
fn generated_lock_ids_always_validate() {
    for _ in 0..256 {
        let id = generate_lock_id();
        assert_eq!(id.len(), 22);
        validate_lock_id(&id).unwrap();
    }
}

#[test]
fn generated_lock_ids_do_not_repeat() {
    let mut seen = std::collections::HashSet::new();
    for _ in 0..1_000 {
        assert!(seen.insert(generate_lock_id()));
    }
}
