//! Cryptographic entropy source for delay sampling.
//!
//! Delays must be unpredictable to an observer modeling input timing, so
//! they are drawn from `/dev/urandom` rather than a seeded PRNG. The file
//! is opened once at startup and held for the lifetime of the process.

use std::fs::File;
use std::io::{self, Read};

/// Path of the kernel entropy source.
const ENTROPY_SOURCE: &str = "/dev/urandom";

/// A handle to the kernel entropy source.
#[derive(Debug)]
pub struct Entropy {
    source: File,
}

impl Entropy {
    /// Opens the entropy source. The descriptor is close-on-exec.
    pub fn open() -> io::Result<Self> {
        Ok(Self {
            source: File::open(ENTROPY_SOURCE)?,
        })
    }

    /// Returns an integer uniformly distributed on `[lower, upper]`
    /// inclusive.
    ///
    /// Defensive bounds: `lower >= upper` returns `upper`, and a negative
    /// bound returns 0. Biased draws are rejected
    /// (`raw >= u64::MAX - u64::MAX % range`), and the range arithmetic is
    /// carried out in `u64` so it cannot overflow.
    pub fn uniform(&mut self, lower: i64, upper: i64) -> io::Result<i64> {
        if lower >= upper {
            return Ok(upper);
        }
        if lower < 0 || upper < 0 {
            return Ok(0);
        }

        let range = (upper as u64 - lower as u64) + 1;
        let limit = u64::MAX - u64::MAX % range;
        let mut buf = [0u8; 8];
        let raw = loop {
            self.source.read_exact(&mut buf)?;
            let candidate = u64::from_ne_bytes(buf);
            if candidate < limit {
                break candidate;
            }
        };

        // raw % range < 2^63, so the sum stays within i64.
        Ok(lower + (raw % range) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degenerate_interval_returns_value() {
        let mut entropy = Entropy::open().unwrap();
        assert_eq!(entropy.uniform(7, 7).unwrap(), 7);
        assert_eq!(entropy.uniform(0, 0).unwrap(), 0);
    }

    #[test]
    fn test_inverted_interval_returns_upper() {
        let mut entropy = Entropy::open().unwrap();
        assert_eq!(entropy.uniform(8, 7).unwrap(), 7);
    }

    #[test]
    fn test_negative_bounds_return_zero() {
        let mut entropy = Entropy::open().unwrap();
        assert_eq!(entropy.uniform(-5, 10).unwrap(), 0);
        assert_eq!(entropy.uniform(-10, -5).unwrap(), 0);
    }

    #[test]
    fn test_draws_stay_in_bounds() {
        let mut entropy = Entropy::open().unwrap();
        for _ in 0..512 {
            let value = entropy.uniform(3, 9).unwrap();
            assert!((3..=9).contains(&value));
        }
    }

    #[test]
    fn test_small_range_hits_both_endpoints() {
        let mut entropy = Entropy::open().unwrap();
        let mut seen = [false; 2];
        for _ in 0..256 {
            match entropy.uniform(0, 1).unwrap() {
                0 => seen[0] = true,
                1 => seen[1] = true,
                other => panic!("out of range: {other}"),
            }
        }
        assert!(seen[0] && seen[1]);
    }
}
