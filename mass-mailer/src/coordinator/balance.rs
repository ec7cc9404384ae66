//! Fair-share computation for range substitution.

/// How many more non-working ranges this worker should take over (positive)
/// or give back (negative).
///
/// `ceil(non_working / working) - substituted_by_me`. Ceiling division keeps
/// the pool from oscillating: a worker holding its fair share never releases,
/// and when every live worker acts on the same snapshot their combined
/// positive factors cover all unsubstituted ranges.
pub fn compute_balance_factor(
    non_working: usize,
    working: usize,
    substituted_by_me: usize,
) -> i64 {
    if working == 0 {
        return 0;
    }
    non_working.div_ceil(working) as i64 - substituted_by_me as i64
}
