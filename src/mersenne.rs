//! # Mersenne: Big-Integer Modular Engine
//!
//! Arbitrary-precision primitives for the Lucas–Lehmer recurrence, built on
//! GMP through [`rug`].
//!
//! ## Fast Reduction
//!
//! For M = 2^p − 1 we have 2^p ≡ 1 (mod M), so splitting x at bit p into
//! `x = hi·2^p + lo` gives `x ≡ hi + lo (mod M)`. Folding repeatedly shrinks
//! the value by ~p bits per pass using only shifts, masks, and one addition,
//! which is far cheaper than a generic division. A squared residue (< 2^2p)
//! needs at most two folds plus a final `== M` correction.
//!
//! The generic [`square_mod`] / [`sub2_mod`] functions use plain Euclidean
//! remainder and serve as the reference the fast path is verified against.
//!
//! ## Decimal Rendering
//!
//! The decimal expansion of a Mersenne prime is shipped to the coordinator in
//! fixed-size fragments ([`VALUE_CHUNK_LEN`] characters) because the transport
//! bounds message size. Concatenating the fragments in order, without
//! separators, reproduces the exact base-10 string.

use rug::ops::RemRounding;
use rug::Integer;
use sha2::{Digest, Sha256};

/// Maximum length of one decimal fragment in a prime report.
pub const VALUE_CHUNK_LEN: usize = 1000;

/// M = 2^p − 1.
pub fn pow2_minus_one(p: u32) -> Integer {
    (Integer::from(1u32) << p) - 1u32
}

/// Reference modular squaring: x² mod m (Euclidean, always non-negative).
pub fn square_mod(x: &Integer, m: &Integer) -> Integer {
    let mut sq = x.clone();
    sq.square_mut();
    sq.rem_euc(m)
}

/// Reference modular subtraction: (x − 2) mod m (Euclidean, always non-negative).
pub fn sub2_mod(x: &Integer, m: &Integer) -> Integer {
    Integer::from(x - 2u32).rem_euc(m)
}

/// Reduce a non-negative `x` modulo 2^p − 1 in place by folding at bit p.
pub fn reduce_mersenne(x: &mut Integer, p: u32) {
    debug_assert!(*x >= 0u32, "reduce_mersenne expects a non-negative value");
    while x.significant_bits() > p {
        let hi = Integer::from(&*x >> p);
        x.keep_bits_mut(p);
        *x += hi;
    }
    // x < 2^p now; the only value left to fold is M itself.
    if x.significant_bits() == p && x.count_ones() == Some(p) {
        *x = Integer::new();
    }
}

/// Modulus 2^p − 1 with the Mersenne-specific fast reduction.
///
/// Residues handled here must already lie in `[0, M)`.
#[derive(Debug, Clone)]
pub struct MersenneModulus {
    p: u32,
    m: Integer,
}

impl MersenneModulus {
    pub fn new(p: u32) -> Self {
        MersenneModulus {
            p,
            m: pow2_minus_one(p),
        }
    }

    pub fn exponent(&self) -> u32 {
        self.p
    }

    pub fn value(&self) -> &Integer {
        &self.m
    }

    /// s ← s² mod M.
    pub fn square_mod(&self, s: &mut Integer) {
        s.square_mut();
        reduce_mersenne(s, self.p);
    }

    /// s ← (s − 2) mod M.
    pub fn sub2_mod(&self, s: &mut Integer) {
        if *s < 2u32 {
            *s += &self.m;
        }
        *s -= 2u32;
    }

    /// One Lucas–Lehmer step: s ← (s² − 2) mod M.
    pub fn ll_step(&self, s: &mut Integer) {
        self.square_mod(s);
        self.sub2_mod(s);
    }
}

/// Decimal fragments whose in-order concatenation is the base-10 form of `x`.
pub fn to_decimal_chunks(x: &Integer, chunk_len: usize) -> Vec<String> {
    chunk_decimal(&x.to_string_radix(10), chunk_len)
}

fn chunk_decimal(decimal: &str, chunk_len: usize) -> Vec<String> {
    let step = chunk_len.max(1);
    // Decimal strings are ASCII, so every byte offset is a char boundary.
    (0..decimal.len())
        .step_by(step)
        .map(|start| decimal[start..(start + step).min(decimal.len())].to_string())
        .collect()
}

/// Number of decimal digits of `x` (sign excluded; zero has one digit).
pub fn digit_count(x: &Integer) -> u64 {
    let decimal = x.to_string_radix(10);
    decimal.trim_start_matches('-').len() as u64
}

/// Lowercase hex SHA-256 over the canonical decimal bytes.
pub fn value_digest(decimal: &str) -> String {
    format!("{:x}", Sha256::digest(decimal.as_bytes()))
}

/// Everything a prime report needs about 2^p − 1, from a single decimal conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimeValue {
    pub digit_count: u64,
    pub chunks: Vec<String>,
    pub digest: String,
}

impl PrimeValue {
    pub fn of_mersenne(p: u32) -> Self {
        Self::of(&pow2_minus_one(p))
    }

    pub fn of(x: &Integer) -> Self {
        let decimal = x.to_string_radix(10);
        PrimeValue {
            digit_count: decimal.trim_start_matches('-').len() as u64,
            digest: value_digest(&decimal),
            chunks: chunk_decimal(&decimal, VALUE_CHUNK_LEN),
        }
    }

    /// Reassemble the full decimal string.
    pub fn decimal(&self) -> String {
        self.chunks.concat()
    }
}
