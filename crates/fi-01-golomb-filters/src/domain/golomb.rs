//! # Golomb-Rice Coded Sets (BIP 158)
//!
//! Probabilistic set membership over byte strings.
//!
//! ## Algorithm
//!
//! 1. Deduplicate the items and count them as `N`
//! 2. SipHash-2-4 every item with the 16-byte filter key
//! 3. Map each hash into `[0, N * 2^P)` with a 128-bit multiply
//! 4. Sort the values and Golomb-Rice code consecutive deltas:
//!    quotient in unary (`q` ones then a zero), remainder in `P` bits
//!
//! Bits are packed most-significant first. Matching walks the decoded
//! stream once, so a lookup costs `O(N)` and never allocates.

use std::collections::BTreeSet;
use std::hash::Hasher;

use bitvec::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use siphasher::sip::SipHasher24;

use crate::error::FilterError;

/// Default Golomb-Rice parameter, giving a false positive rate near 2^-20.
pub const DEFAULT_P: u8 = 20;

/// Largest supported Golomb-Rice parameter.
pub const MAX_P: u8 = 32;

/// SipHash key: the first 16 bytes of a block hash.
pub type FilterKey = [u8; 16];

/// Double SHA-256, the content key of a filter's encoded data.
pub fn hash256(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(Sha256::digest(bytes)).into()
}

/// Golomb-Rice coded probabilistic set.
///
/// Immutable once built. `n == 0` is the empty filter, which matches
/// nothing.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GolombRiceFilter {
    n: u32,
    p: u8,
    bit_len: u32,
    data: Vec<u8>,
}

impl GolombRiceFilter {
    /// Build a filter over the distinct `items`.
    ///
    /// Output is a pure function of `(key, p, set(items))`.
    pub fn build<I>(key: &FilterKey, p: u8, items: I) -> Result<Self, FilterError>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        check_parameter(p)?;

        let items: Vec<I::Item> = items.into_iter().collect();
        let unique: BTreeSet<&[u8]> = items.iter().map(AsRef::as_ref).collect();
        let n = u32::try_from(unique.len()).map_err(|_| FilterError::TooManyItems {
            count: unique.len(),
            max: u32::MAX as usize,
        })?;
        if n == 0 {
            return Ok(Self::empty(p));
        }

        let range = (n as u64) << p;
        let mut values: Vec<u64> = unique
            .iter()
            .map(|item| hash_to_range(key, item, range))
            .collect();
        values.sort_unstable();

        let mut bits: BitVec<u8, Msb0> = BitVec::with_capacity(values.len() * (p as usize + 2));
        let mut prev = 0u64;
        for value in values {
            write_delta(&mut bits, value - prev, p);
            prev = value;
        }

        let bit_len = u32::try_from(bits.len()).map_err(|_| FilterError::TooManyItems {
            count: unique.len(),
            max: u32::MAX as usize / (p as usize + 1),
        })?;
        bits.set_uninitialized(false);

        Ok(Self {
            n,
            p,
            bit_len,
            data: bits.into_vec(),
        })
    }

    /// The empty filter for parameter `p`.
    pub fn empty(p: u8) -> Self {
        Self {
            n: 0,
            p,
            bit_len: 0,
            data: Vec::new(),
        }
    }

    /// Reassemble a filter from its stored parts.
    pub fn from_parts(n: u32, p: u8, bit_len: u32, data: Vec<u8>) -> Result<Self, FilterError> {
        check_parameter(p)?;
        if data.len() != bytes_for_bits(bit_len) {
            return Err(FilterError::BitLengthMismatch {
                bit_len,
                bytes: data.len(),
            });
        }
        if n == 0 && bit_len != 0 {
            return Err(FilterError::NonEmptyBitstream { bit_len });
        }
        Ok(Self {
            n,
            p,
            bit_len,
            data,
        })
    }

    pub fn n(&self) -> u32 {
        self.n
    }

    pub fn p(&self) -> u8 {
        self.p
    }

    /// Number of meaningful bits in `data`.
    pub fn bit_len(&self) -> u32 {
        self.bit_len
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// `hash256` of the encoded data.
    pub fn content_hash(&self) -> [u8; 32] {
        hash256(&self.data)
    }

    /// Expected false positive rate of a single lookup.
    pub fn false_positive_rate(&self) -> f64 {
        1.0 / (1u64 << self.p) as f64
    }

    /// Probable membership test.
    ///
    /// `false` is exact. `true` is wrong with probability about `2^-P`.
    pub fn matches(&self, key: &FilterKey, item: &[u8]) -> bool {
        if self.n == 0 {
            return false;
        }
        let target = hash_to_range(key, item, self.range());
        for value in self.values() {
            if value == target {
                return true;
            }
            if value > target {
                return false;
            }
        }
        false
    }

    /// True if any of `items` probably belongs to the set.
    ///
    /// Probes are sorted and merged against the stream in one pass.
    pub fn matches_any<I>(&self, key: &FilterKey, items: I) -> bool
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        if self.n == 0 {
            return false;
        }
        let range = self.range();
        let mut targets: Vec<u64> = items
            .into_iter()
            .map(|item| hash_to_range(key, item.as_ref(), range))
            .collect();
        if targets.is_empty() {
            return false;
        }
        targets.sort_unstable();
        targets.dedup();

        let mut targets = targets.into_iter().peekable();
        for value in self.values() {
            while let Some(&target) = targets.peek() {
                if target < value {
                    targets.next();
                } else {
                    break;
                }
            }
            match targets.peek() {
                Some(&target) if target == value => return true,
                Some(_) => {}
                None => return false,
            }
        }
        false
    }

    /// Decoded absolute values in ascending order.
    fn values(&self) -> Values<'_> {
        let bits = self.data.view_bits::<Msb0>();
        let bits = bits.get(..self.bit_len as usize).unwrap_or(BitSlice::empty());
        Values {
            bits,
            pos: 0,
            remaining: self.n,
            p: self.p as usize,
            acc: 0,
        }
    }

    fn range(&self) -> u64 {
        (self.n as u64) << self.p
    }
}

/// Streaming decoder over a filter's bitstream.
struct Values<'a> {
    bits: &'a BitSlice<u8, Msb0>,
    pos: usize,
    remaining: u32,
    p: usize,
    acc: u64,
}

impl Values<'_> {
    fn read_unary(&mut self) -> Option<u64> {
        let rest = self.bits.get(self.pos..)?;
        let ones = rest.first_zero()?;
        self.pos += ones + 1;
        Some(ones as u64)
    }

    fn read_remainder(&mut self) -> Option<u64> {
        let end = self.pos + self.p;
        let chunk = self.bits.get(self.pos..end)?;
        self.pos = end;
        Some(chunk.load_be::<u64>())
    }
}

impl Iterator for Values<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.remaining == 0 {
            return None;
        }
        // A truncated stream just ends the iteration.
        let q = self.read_unary()?;
        let r = self.read_remainder()?;
        self.remaining -= 1;
        self.acc = self.acc.wrapping_add((q << self.p) | r);
        Some(self.acc)
    }
}

fn check_parameter(p: u8) -> Result<(), FilterError> {
    if p == 0 || p > MAX_P {
        return Err(FilterError::InvalidParameter { p });
    }
    Ok(())
}

fn write_delta(bits: &mut BitVec<u8, Msb0>, delta: u64, p: u8) {
    let q = (delta >> p) as usize;
    bits.resize(bits.len() + q, true);
    bits.push(false);

    let remainder = delta & ((1u64 << p) - 1);
    let be = remainder.to_be_bytes();
    bits.extend_from_bitslice(&be.view_bits::<Msb0>()[64 - p as usize..]);
}

/// SipHash-2-4 the item, then fast-range reduce into `[0, range)`.
fn hash_to_range(key: &FilterKey, item: &[u8], range: u64) -> u64 {
    let mut hasher = SipHasher24::new_with_key(key);
    hasher.write(item);
    let hash = hasher.finish();
    ((hash as u128 * range as u128) >> 64) as u64
}

pub(crate) fn bytes_for_bits(bit_len: u32) -> usize {
    (bit_len as usize).div_ceil(8)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: FilterKey = [0u8; 16];

    #[test]
    fn test_empty_filter() {
        let filter = GolombRiceFilter::build(&KEY, DEFAULT_P, Vec::<Vec<u8>>::new()).unwrap();

        assert!(filter.is_empty());
        assert_eq!(filter.bit_len(), 0);
        assert!(filter.data().is_empty());
        assert!(!filter.matches(&KEY, b"anything"));
        assert!(!filter.matches_any(&KEY, [b"a", b"b"]));
    }

    #[test]
    fn test_single_witness_key_hash() {
        let item = [0x42u8; 20];
        let filter = GolombRiceFilter::build(&KEY, DEFAULT_P, [item]).unwrap();

        assert_eq!(filter.n(), 1);
        assert!(filter.matches(&KEY, &item));
        assert!(!filter.matches(&KEY, &[0x17u8; 20]));
    }

    #[test]
    fn test_duplicates_are_counted_once() {
        let filter =
            GolombRiceFilter::build(&KEY, DEFAULT_P, [&b"same"[..], b"same", b"other"]).unwrap();
        assert_eq!(filter.n(), 2);
    }

    #[test]
    fn test_order_does_not_change_output() {
        let a = GolombRiceFilter::build(&KEY, DEFAULT_P, [&b"one"[..], b"two", b"three"]).unwrap();
        let b = GolombRiceFilter::build(&KEY, DEFAULT_P, [&b"three"[..], b"one", b"two"]).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_key_changes_output() {
        let other_key = [7u8; 16];
        let items = [&b"script_a"[..], b"script_b"];
        let a = GolombRiceFilter::build(&KEY, DEFAULT_P, items).unwrap();
        let b = GolombRiceFilter::build(&other_key, DEFAULT_P, items).unwrap();

        assert_ne!(a.data(), b.data());
        assert!(b.matches(&other_key, b"script_a"));
    }

    #[test]
    fn test_bit_length_is_exact() {
        let filter = GolombRiceFilter::build(&KEY, 8, [&b"x"[..]]).unwrap();
        // A single delta below 2^P: one terminating zero plus 8 remainder bits.
        assert_eq!(filter.bit_len(), 9);
        assert_eq!(filter.data().len(), bytes_for_bits(filter.bit_len()));
    }

    #[test]
    fn test_matches_any() {
        let filter =
            GolombRiceFilter::build(&KEY, DEFAULT_P, [&b"alpha"[..], b"beta", b"gamma"]).unwrap();

        assert!(filter.matches_any(&KEY, [&b"nope"[..], b"beta"]));
        assert!(!filter.matches_any(&KEY, [&b"nope"[..], b"nada"]));
        assert!(!filter.matches_any(&KEY, Vec::<&[u8]>::new()));
    }

    #[test]
    fn test_invalid_parameter() {
        assert_eq!(
            GolombRiceFilter::build(&KEY, 0, [b"x"]),
            Err(FilterError::InvalidParameter { p: 0 })
        );
        assert_eq!(
            GolombRiceFilter::build(&KEY, 33, [b"x"]),
            Err(FilterError::InvalidParameter { p: 33 })
        );
    }

    #[test]
    fn test_from_parts_validates_lengths() {
        let filter = GolombRiceFilter::build(&KEY, DEFAULT_P, [&b"a"[..], b"b"]).unwrap();
        let rebuilt = GolombRiceFilter::from_parts(
            filter.n(),
            filter.p(),
            filter.bit_len(),
            filter.data().to_vec(),
        )
        .unwrap();
        assert_eq!(rebuilt, filter);

        let err = GolombRiceFilter::from_parts(2, DEFAULT_P, 80, vec![0u8; 3]).unwrap_err();
        assert!(matches!(err, FilterError::BitLengthMismatch { .. }));

        let err = GolombRiceFilter::from_parts(0, DEFAULT_P, 8, vec![0u8; 1]).unwrap_err();
        assert!(matches!(err, FilterError::NonEmptyBitstream { .. }));
    }

    #[test]
    fn test_truncated_stream_does_not_panic() {
        let filter = GolombRiceFilter::build(&KEY, DEFAULT_P, [&b"a"[..], b"b", b"c"]).unwrap();
        // Claim more elements than the stream holds.
        let lying = GolombRiceFilter::from_parts(
            filter.n() + 10,
            filter.p(),
            filter.bit_len(),
            filter.data().to_vec(),
        )
        .unwrap();

        let _ = lying.matches(&KEY, b"a");
        let _ = lying.matches_any(&KEY, [&b"b"[..], b"zzz"]);
    }

    #[test]
    fn test_hash256_known_vector() {
        // hash256 of the empty string.
        assert_eq!(
            hex::encode(hash256(b"")),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }
}
