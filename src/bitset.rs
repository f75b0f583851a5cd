//! Multi-word bitmask used to encode splits over a taxon namespace.
//!
//! # Overview
//! Each bit position corresponds to the index a taxon received when it was
//! registered in the [`TaxonNamespace`](crate::taxon::TaxonNamespace).
//! A split is stored as the set of taxa on one side of an edge.
//!
//! # Example
//! For a namespace [A, B, C, D] mapped to indices [0, 1, 2, 3]:
//! - Split {A, C} → bitset `0b0101` (bits 0 and 2 set)
//! - Split {B, C, D} → bitset `0b1110` (bits 1, 2, 3 set)
//!
//! # Ordering
//! Bitsets compare as unsigned integers (most significant word first), so
//! `min(split, complement)` picks the numerically smaller half.

use std::cmp::Ordering;
use std::fmt;

/// A bitset over taxon indices.
///
/// Internally stores bits in `Vec<u64>` words to support arbitrarily large
/// namespaces. Word 0 holds indices 0..64, word 1 holds 64..128 and so on.
/// All bitsets built against one namespace have the same number of words.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Default)]
pub struct Bitset(pub Vec<u64>);

impl Bitset {
    /// Creates a new bitset with all bits set to 0.
    ///
    /// # Parameters
    /// - `words`: Number of u64 words needed. Calculate as `(num_taxa + 63) / 64`
    ///
    /// # Example
    /// ```
    /// # use sumtrees::bitset::Bitset;
    /// let bs = Bitset::zeros(2);
    /// assert_eq!(bs.0.len(), 2);
    /// assert!(bs.is_empty());
    /// ```
    pub fn zeros(words: usize) -> Self {
        Bitset(vec![0u64; words])
    }

    /// Number of words needed to hold `bits` bits (at least one).
    pub fn words_for(bits: usize) -> usize {
        bits.div_ceil(64).max(1)
    }

    /// A bitset with only `idx` set.
    pub fn singleton(words: usize, idx: usize) -> Self {
        let mut bs = Bitset::zeros(words);
        bs.set(idx);
        bs
    }

    /// A bitset with the lowest `bits` bits set.
    ///
    /// ```
    /// # use sumtrees::bitset::Bitset;
    /// assert_eq!(Bitset::full(1, 4).0[0], 0b1111);
    /// ```
    pub fn full(words: usize, bits: usize) -> Self {
        let mut bs = Bitset::zeros(words);
        for idx in 0..bits {
            bs.set(idx);
        }
        bs
    }

    /// Builds a single-word bitset from an integer. Mostly handy in tests.
    pub fn from_u64(value: u64) -> Self {
        Bitset(vec![value])
    }

    /// Sets the bit at the given index to 1.
    ///
    /// ```
    /// # use sumtrees::bitset::Bitset;
    /// let mut bs = Bitset::zeros(1);
    /// bs.set(0);
    /// bs.set(5);
    /// assert_eq!(bs.0[0], 0b00100001);
    /// ```
    #[inline]
    pub fn set(&mut self, idx: usize) {
        let word = idx >> 6; // Equivalent to idx / 64
        let bit = idx & 63; // Equivalent to idx % 64
        if word >= self.0.len() {
            self.0.resize(word + 1, 0);
        }
        self.0[word] |= 1u64 << bit;
    }

    /// Returns whether the bit at `idx` is set.
    #[inline]
    pub fn contains(&self, idx: usize) -> bool {
        let word = idx >> 6;
        let bit = idx & 63;
        self.0.get(word).is_some_and(|w| w & (1u64 << bit) != 0)
    }

    /// Performs bitwise OR with another bitset (union operation).
    ///
    /// ```
    /// # use sumtrees::bitset::Bitset;
    /// let mut left = Bitset::from_u64(0b01);
    /// left.or_assign(&Bitset::from_u64(0b10));
    /// assert_eq!(left.0[0], 0b11);
    /// ```
    #[inline]
    pub fn or_assign(&mut self, other: &Bitset) {
        if other.0.len() > self.0.len() {
            self.0.resize(other.0.len(), 0);
        }
        for (a, b) in self.0.iter_mut().zip(&other.0) {
            *a |= *b;
        }
    }

    /// Intersection of two bitsets.
    pub fn and(&self, other: &Bitset) -> Bitset {
        Bitset(
            self.0
                .iter()
                .enumerate()
                .map(|(i, a)| a & other.0.get(i).copied().unwrap_or(0))
                .collect(),
        )
    }

    /// Symmetric difference of two bitsets.
    pub fn xor(&self, other: &Bitset) -> Bitset {
        let len = self.0.len().max(other.0.len());
        Bitset(
            (0..len)
                .map(|i| self.0.get(i).copied().unwrap_or(0) ^ other.0.get(i).copied().unwrap_or(0))
                .collect(),
        )
    }

    /// The taxa of `mask` that are not in `self`.
    ///
    /// ```
    /// # use sumtrees::bitset::Bitset;
    /// let mask = Bitset::from_u64(0b1111);
    /// assert_eq!(Bitset::from_u64(0b0011).complement_within(&mask), Bitset::from_u64(0b1100));
    /// ```
    pub fn complement_within(&self, mask: &Bitset) -> Bitset {
        Bitset(
            mask.0
                .iter()
                .enumerate()
                .map(|(i, m)| m & !self.0.get(i).copied().unwrap_or(0))
                .collect(),
        )
    }

    /// Counts the number of set bits (population count).
    ///
    /// ```
    /// # use sumtrees::bitset::Bitset;
    /// assert_eq!(Bitset::from_u64(0b100101).count_ones(), 3);
    /// ```
    #[inline]
    pub fn count_ones(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    /// True if every bit of `self` is also set in `other`.
    pub fn is_subset_of(&self, other: &Bitset) -> bool {
        self.0
            .iter()
            .enumerate()
            .all(|(i, a)| a & !other.0.get(i).copied().unwrap_or(0) == 0)
    }

    /// True if `self` and `other` share no bit.
    pub fn is_disjoint(&self, other: &Bitset) -> bool {
        self.0.iter().zip(&other.0).all(|(a, b)| a & b == 0)
    }

    /// Index of the lowest set bit, if any.
    pub fn lowest_set_index(&self) -> Option<usize> {
        self.0
            .iter()
            .enumerate()
            .find(|(_, w)| **w != 0)
            .map(|(i, w)| i * 64 + w.trailing_zeros() as usize)
    }

    /// Iterates over the indices of set bits in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().enumerate().flat_map(|(i, &word)| {
            let mut w = word;
            std::iter::from_fn(move || {
                if w == 0 {
                    return None;
                }
                let bit = w.trailing_zeros() as usize;
                w &= w - 1;
                Some(i * 64 + bit)
            })
        })
    }
}

impl Ord for Bitset {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        for i in (0..len).rev() {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.0.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

impl PartialOrd for Bitset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Bitset {
    /// Hexadecimal, most significant word first.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut words = self.0.iter().rev().skip_while(|w| **w == 0).peekable();
        if words.peek().is_none() {
            return write!(f, "0x0");
        }
        write!(f, "0x")?;
        let mut first = true;
        for w in words {
            if first {
                write!(f, "{w:x}")?;
                first = false;
            } else {
                write!(f, "{w:016x}")?;
            }
        }
        Ok(())
    }
}
