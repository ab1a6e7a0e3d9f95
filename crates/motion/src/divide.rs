//! Period-inverse helper for step timing.
//!
//! The step generator converts step rates into timer periods through a
//! `0x0100_0000 / d` reciprocal. On any target with a hardware divider
//! that is a single instruction — [`period_inverse`] — and the software
//! Newton–Raphson path exists only as a specialization for cores without
//! one. Both return identical results for every non-zero divisor.

/// The fixed-point dividend, `2^24`.
pub const PERIOD_ONE: u32 = 1 << 24;

/// `0x0100_0000 / d` using the hardware divider.
#[inline]
pub fn period_inverse(d: u32) -> u32 {
    debug_assert!(d != 0);
    PERIOD_ONE / d
}

/// `0x0100_0000 / d` without a divide instruction.
///
/// Normalizes the divisor into `[2^31, 2^32)`, seeds the classic
/// `48/17 − 32/17·D` linear reciprocal estimate in 2.30 fixed point, and
/// refines it with four Newton–Raphson rounds (`x ← x·(2 − D·x)`), which
/// is enough for the full 24-bit quotient. A final compare-and-step
/// repairs any last-bit quantization against the exact quotient.
pub fn period_inverse_soft(d: u32) -> u32 {
    debug_assert!(d != 0);

    let lz = d.leading_zeros();
    let dn = (d as u64) << lz; // divisor normalized into [2^31, 2^32)

    const C1: u64 = 3_031_741_621; // 48/17 in Q30
    const C2: u64 = 2_021_161_080; // 32/17 in Q30
    let mut x: u64 = C1 - ((C2 * dn) >> 32);
    for _ in 0..4 {
        let dx = (dn * x) >> 32; // D·x, Q30
        x = (x * ((1u64 << 31) - dx)) >> 30;
    }

    // 1/d = x·2^lz / 2^62, so 2^24/d = (x << lz) >> 38.
    let mut q = ((x << lz) >> 38) as u32;
    while (q as u64 + 1) * d as u64 <= PERIOD_ONE as u64 {
        q += 1;
    }
    while (q as u64) * (d as u64) > PERIOD_ONE as u64 {
        q -= 1;
    }
    q
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_path_matches_hardware_division_over_a_sweep() {
        for d in 1..=20_000u32 {
            assert_eq!(period_inverse_soft(d), period_inverse(d), "d = {d}");
        }
    }

    #[test]
    fn soft_path_matches_on_powers_of_two_and_extremes() {
        for shift in 0..32 {
            let d = 1u32 << shift;
            assert_eq!(period_inverse_soft(d), period_inverse(d), "d = 2^{shift}");
        }
        for d in [3, PERIOD_ONE - 1, PERIOD_ONE, PERIOD_ONE + 1, u32::MAX - 1, u32::MAX] {
            assert_eq!(period_inverse_soft(d), period_inverse(d), "d = {d}");
        }
    }

    #[test]
    fn soft_path_matches_on_scattered_large_divisors() {
        // Weyl sequence covering the full u32 range without an RNG.
        let mut d: u32 = 0x9e37_79b9;
        for _ in 0..20_000 {
            d = d.wrapping_mul(0x0001_0003).wrapping_add(0x9e37_79b9);
            let v = d.max(1);
            assert_eq!(period_inverse_soft(v), period_inverse(v), "d = {v}");
        }
    }

    #[test]
    fn typical_step_rates() {
        // 8000 steps/s at a 1 MHz step timer: 2^24/8000 = 2097, and the
        // rounded fixed-point period recovers the exact 125 ticks.
        assert_eq!(period_inverse(8000), 2097);
        let ticks = (1_000_000u64 * period_inverse(8000) as u64 + (1 << 23)) >> 24;
        assert_eq!(ticks, 125);
    }
}
