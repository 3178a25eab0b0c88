//! The power-of-two time-bucket grid shared by the segment tree (spec §3).
//!
//! Every bucket boundary is a multiple of `10 * 2^L` seconds for some
//! level `L` in `[0, MAX_LEVEL]`; a bucket at level `L` spans `10 * 2^L`
//! seconds.

/// Highest segment-tree level. Fixed at 20: `10 * 2^20` seconds is
/// roughly 332 years, comfortably exceeding the "a few years at L=14"
/// floor named in spec.md. Changing this value is an on-disk format
/// break: it is baked into every persisted segment file.
pub const MAX_LEVEL: u8 = 20;

/// Duration in seconds of a bucket at the given level.
pub fn bucket_duration(level: u8) -> u64 {
    10u64 << level
}

/// Scale `value` by `numerator / denominator` using banker's rounding
/// (round-half-to-even), used wherever a sample count is apportioned by
/// a partial-overlap ratio (spec §4.E, §4.G). Exact for `numerator ==
/// denominator`.
pub fn round_half_even(value: u64, numerator: u64, denominator: u64) -> u64 {
    debug_assert!(denominator > 0, "denominator must be positive");
    let product = value as u128 * numerator as u128;
    let denom = denominator as u128;
    let quotient = product / denom;
    let remainder = product % denom;
    let twice = remainder * 2;
    let rounded = match twice.cmp(&denom) {
        std::cmp::Ordering::Less => quotient,
        std::cmp::Ordering::Greater => quotient + 1,
        std::cmp::Ordering::Equal => {
            if quotient % 2 == 0 {
                quotient
            } else {
                quotient + 1
            }
        }
    };
    rounded as u64
}

/// Round a half-open `[t0, t1)` outward to the level-0 grid (10s): `t0`
/// down, `t1` up, so the range tiles exactly into aligned buckets with
/// no leftover remainder. Required before any range reaches
/// [`Segment::put`] or [`Segment::delete`], whose bucket decomposition
/// assumes an aligned, exactly-covering span. Guarantees `t1 > t0`.
pub fn round_range_to_grid(t0: u64, t1: u64) -> (u64, u64) {
    let unit = bucket_duration(0);
    let start = (t0 / unit) * unit;
    let end = ((t1 + unit - 1) / unit) * unit;
    let end = end.max(start + unit);
    (start, end)
}
