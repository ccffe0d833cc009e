//! Vectorised arbitrage pre-scan.
//!
//! The predicate `yes_ask + no_ask < 100` is evaluated in integer cents,
//! eight `(yes, no)` pairs per 128-bit lane. Survivor indices are decoded
//! from the comparison mask and handed to the full per-event detector.
//! A scalar path covers non-x86 targets and serves as the reference
//! implementation for tests.

/// Sentinel ask used to pad partial lanes; never produces a survivor.
const PAD: u16 = 100;

/// Threshold in cents: arbitrage requires the sum strictly below this.
const THRESHOLD: i16 = 100;

/// Indices where `yes_asks[i] + no_asks[i] < 100`.
///
/// Both slices must be the same length. Ask values are cents in 0..=100.
#[must_use]
pub fn scan_arbitrage_pairs(yes_asks: &[u16], no_asks: &[u16]) -> Vec<usize> {
    assert_eq!(yes_asks.len(), no_asks.len(), "mismatched scan inputs");

    #[cfg(target_arch = "x86_64")]
    {
        scan_sse2(yes_asks, no_asks)
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        scan_scalar(yes_asks, no_asks)
    }
}

#[allow(dead_code)]
fn scan_scalar(yes_asks: &[u16], no_asks: &[u16]) -> Vec<usize> {
    yes_asks
        .iter()
        .zip(no_asks)
        .enumerate()
        .filter(|(_, (&y, &n))| i32::from(y) + i32::from(n) < i32::from(THRESHOLD))
        .map(|(i, _)| i)
        .collect()
}

#[cfg(target_arch = "x86_64")]
fn scan_sse2(yes_asks: &[u16], no_asks: &[u16]) -> Vec<usize> {
    use std::arch::x86_64::{
        __m128i, _mm_add_epi16, _mm_cmplt_epi16, _mm_loadu_si128, _mm_movemask_epi8,
        _mm_set1_epi16,
    };

    let len = yes_asks.len();
    let mut survivors = Vec::new();
    let mut i = 0;

    // SSE2 is baseline on x86_64; the signed compare is valid because ask
    // sums are bounded by 200, far below i16::MAX.
    unsafe {
        let threshold = _mm_set1_epi16(THRESHOLD);

        while i + 8 <= len {
            let yes = _mm_loadu_si128(yes_asks.as_ptr().add(i).cast::<__m128i>());
            let no = _mm_loadu_si128(no_asks.as_ptr().add(i).cast::<__m128i>());
            let sum = _mm_add_epi16(yes, no);
            let lt = _mm_cmplt_epi16(sum, threshold);
            let mask = _mm_movemask_epi8(lt) as u32;

            if mask != 0 {
                for lane in 0..8 {
                    // Each 16-bit lane contributes two mask bits.
                    if mask & (0b11 << (lane * 2)) != 0 {
                        survivors.push(i + lane);
                    }
                }
            }
            i += 8;
        }
    }

    // Tail: fewer than eight remaining pairs.
    for (offset, (&y, &n)) in yes_asks[i..].iter().zip(&no_asks[i..]).enumerate() {
        if i32::from(y) + i32::from(n) < i32::from(THRESHOLD) {
            survivors.push(i + offset);
        }
    }

    survivors
}

/// Pad a probe list to a full lane width with non-matching sentinels.
#[must_use]
pub fn pad_to_lanes(mut asks: Vec<u16>) -> Vec<u16> {
    let rem = asks.len() % 8;
    if rem != 0 {
        asks.resize(asks.len() + (8 - rem), PAD);
    }
    asks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_inequality_at_one_dollar() {
        // 45 + 55 = 100: no arbitrage. 45 + 54 = 99: one-cent profit.
        assert_eq!(scan_arbitrage_pairs(&[45], &[55]), Vec::<usize>::new());
        assert_eq!(scan_arbitrage_pairs(&[45], &[54]), vec![0]);
    }

    #[test]
    fn finds_survivors_across_lanes() {
        let yes: Vec<u16> = vec![45, 50, 60, 30, 99, 48, 51, 20, 44, 70];
        let no: Vec<u16> = vec![53, 51, 42, 60, 2, 53, 48, 75, 54, 29];
        // sums:               98, 101, 102, 90, 101, 101, 99, 95, 98, 99
        assert_eq!(scan_arbitrage_pairs(&yes, &no), vec![0, 3, 6, 7, 8, 9]);
    }

    #[test]
    fn simd_matches_scalar_reference() {
        // Deterministic pseudo-random prices covering several full lanes.
        let mut seed = 0x2545_F491u32;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            (seed % 101) as u16
        };
        let yes: Vec<u16> = (0..257).map(|_| next()).collect();
        let no: Vec<u16> = (0..257).map(|_| next()).collect();

        assert_eq!(scan_arbitrage_pairs(&yes, &no), scan_scalar(&yes, &no));
    }

    #[test]
    fn padding_never_survives() {
        let yes = pad_to_lanes(vec![45, 46]);
        let no = pad_to_lanes(vec![54, 56]);
        assert_eq!(yes.len(), 8);
        assert_eq!(scan_arbitrage_pairs(&yes, &no), vec![0]);
    }

    #[test]
    fn empty_input() {
        assert!(scan_arbitrage_pairs(&[], &[]).is_empty());
    }
}
