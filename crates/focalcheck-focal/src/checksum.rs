//! Adler-32 rolling checksum.

use parking_lot::Mutex;

/// Largest prime below 2^16.
pub const MOD_ADLER: u32 = 65_521;

/// Largest run of bytes that can be summed before `b` may overflow a `u32`.
pub const NMAX: usize = 5552;

/// Bytes summed between modulo reductions. Values outside `1..=NMAX` are
/// clamped. The result never depends on this value, only the work done.
pub static BLOCK_LEN: Mutex<usize> = parking_lot::const_mutex(NMAX);

/// Incremental Adler-32 state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Adler32 {
    a: u32,
    b: u32,
}

impl Default for Adler32 {
    fn default() -> Self {
        Self { a: 1, b: 0 }
    }
}

impl Adler32 {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from a previously finished checksum.
    #[must_use]
    pub fn from_checksum(sum: u32) -> Self {
        Self {
            a: sum & 0xffff,
            b: sum >> 16,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        let block = (*BLOCK_LEN.lock()).clamp(1, NMAX);
        for chunk in data.chunks(block) {
            for &byte in chunk {
                self.a += u32::from(byte);
                self.b += self.a;
            }
            self.a %= MOD_ADLER;
            self.b %= MOD_ADLER;
        }
    }

    #[must_use]
    pub fn checksum(&self) -> u32 {
        (self.b << 16) | self.a
    }
}

/// One-shot Adler-32 of `data`.
#[must_use]
pub fn adler32(data: &[u8]) -> u32 {
    let mut state = Adler32::new();
    state.update(data);
    state.checksum()
}

/// Checksum of `A ++ B` given `adler32(A)`, `adler32(B)` and `B.len()`.
#[must_use]
pub fn combine(adler1: u32, adler2: u32, len2: u64) -> u32 {
    let base = u64::from(MOD_ADLER);
    let rem = len2 % base;
    let mut sum1 = u64::from(adler1 & 0xffff);
    let mut sum2 = (rem * sum1) % base;
    sum1 += u64::from(adler2 & 0xffff) + base - 1;
    sum2 += u64::from(adler1 >> 16) + u64::from(adler2 >> 16) + base - rem;
    if sum1 >= base {
        sum1 -= base;
    }
    if sum1 >= base {
        sum1 -= base;
    }
    if sum2 >= base << 1 {
        sum2 -= base << 1;
    }
    if sum2 >= base {
        sum2 -= base;
    }
    // Both sums are now below MOD_ADLER.
    ((sum2 as u32) << 16) | sum1 as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        assert_eq!(adler32(b""), 1);
        assert_eq!(adler32(b"abc"), 0x024d_0127);
        assert_eq!(adler32(b"Wikipedia"), 0x11e6_0398);
    }

    #[test]
    fn incremental_matches_one_shot() {
        let data: Vec<u8> = (0..20_000u32).map(|i| (i * 31 % 251) as u8).collect();
        let mut state = Adler32::new();
        for piece in data.chunks(777) {
            state.update(piece);
        }
        assert_eq!(state.checksum(), adler32(&data));

        let resumed = {
            let mut s = Adler32::from_checksum(adler32(&data[..5000]));
            s.update(&data[5000..]);
            s.checksum()
        };
        assert_eq!(resumed, adler32(&data));
    }

    #[test]
    fn worst_case_block_does_not_overflow() {
        let data = vec![0xffu8; NMAX * 3 + 17];
        let naive = data.iter().fold((1u64, 0u64), |(a, b), &x| {
            let a = (a + u64::from(x)) % u64::from(MOD_ADLER);
            (a, (b + a) % u64::from(MOD_ADLER))
        });
        assert_eq!(adler32(&data), ((naive.1 as u32) << 16) | naive.0 as u32);
    }

    #[test]
    fn combine_matches_concatenation() {
        let (left, right) = (b"focal routine ".as_slice(), b"under test".as_slice());
        let whole = [left, right].concat();
        assert_eq!(
            combine(adler32(left), adler32(right), right.len() as u64),
            adler32(&whole)
        );
        assert_eq!(combine(adler32(left), 1, 0), adler32(left));
    }
}
