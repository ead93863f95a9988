//! # Key derivation module
//!
//! This module derives deterministic per-field secrets from the master
//! password using Argon2id, re-encoded over the base62 alphabet

use num_bigint::BigUint;
use sha2::{Digest, Sha256};

// -----------------------------------------------------------------------------
// Constants

pub const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// minimum raw hash length, independently of the requested field length
pub const MIN_HASH_LEN: usize = 64;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to build argon2id parameters, {0}")]
    Params(argon2::Error),
    #[error("failed to compute argon2id hash, {0}")]
    Hash(argon2::Error),
}

// -----------------------------------------------------------------------------
// Params structure

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct Params {
    pub time_cost: u32,
    /// memory cost in kibibytes
    pub memory_cost: u32,
    pub parallelism: u32,
}

impl From<&crate::svc::cfg::Argon2> for Params {
    fn from(cfg: &crate::svc::cfg::Argon2) -> Self {
        Self {
            time_cost: cfg.time_cost,
            memory_cost: cfg.memory_cost,
            parallelism: cfg.parallelism,
        }
    }
}

// -----------------------------------------------------------------------------
// helpers

/// derive a secret of exactly `length` base62 characters for the given
/// identifier (`<namespace>/<name>`) and field name.
///
/// The salt is the SHA-256 digest of `<field>:<identifier>`, which makes the
/// derivation a pure function of the master password and the argon2
/// parameters.
pub fn derive(
    master: &str,
    params: &Params,
    identifier: &str,
    field: &str,
    length: usize,
) -> Result<String, Error> {
    let salt = Sha256::digest(format!("{}:{}", field, identifier).as_bytes());
    let hash_len = MIN_HASH_LEN.max(length * 2);

    let argon = argon2::Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon2::Params::new(
            params.memory_cost,
            params.time_cost,
            params.parallelism,
            Some(hash_len),
        )
        .map_err(Error::Params)?,
    );

    let mut raw = vec![0u8; hash_len];
    argon
        .hash_password_into(master.as_bytes(), &salt, &mut raw)
        .map_err(Error::Hash)?;

    Ok(to_base62(&raw, length))
}

/// re-express the raw hash, read as a big-endian unbounded integer, in base62
/// and keep the `length` low-order digits (zero padded when the integer runs
/// out of digits first).
pub fn to_base62(data: &[u8], length: usize) -> String {
    let mut num = BigUint::from_bytes_be(data);
    let base = BigUint::from(62u32);
    let zero = BigUint::default();

    if num == zero {
        return String::from_utf8(vec![ALPHABET[0]; length]).expect("alphabet to be valid ascii");
    }

    let mut digits = Vec::with_capacity(length);
    while num > zero && digits.len() < length {
        let remainder = (&num % &base).iter_u32_digits().next().unwrap_or(0) as usize;
        num /= &base;
        digits.push(ALPHABET[remainder]);
    }

    while digits.len() < length {
        digits.push(ALPHABET[0]);
    }

    digits.reverse();
    String::from_utf8(digits).expect("alphabet to be valid ascii")
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    // small enough to keep the test suite fast, still valid argon2id input
    const PARAMS: Params = Params {
        time_cost: 1,
        memory_cost: 64,
        parallelism: 1,
    };

    #[test]
    fn derivation_is_deterministic() {
        let a = derive("hunter2", &PARAMS, "ns/app", "token", 24).unwrap();
        let b = derive("hunter2", &PARAMS, "ns/app", "token", 24).unwrap();

        assert_eq!(a, b);
    }

    #[test]
    fn derivation_depends_on_every_input() {
        let reference = derive("hunter2", &PARAMS, "ns/app", "token", 24).unwrap();

        assert_ne!(
            reference,
            derive("hunter3", &PARAMS, "ns/app", "token", 24).unwrap()
        );
        assert_ne!(
            reference,
            derive("hunter2", &PARAMS, "ns/other", "token", 24).unwrap()
        );
        assert_ne!(
            reference,
            derive("hunter2", &PARAMS, "ns/app", "password", 24).unwrap()
        );
    }

    #[test]
    fn derived_value_has_requested_length_and_alphabet() {
        for length in [1, 8, 24, 63, 100] {
            let value = derive("hunter2", &PARAMS, "ns/app", "token", length).unwrap();

            assert_eq!(value.len(), length);
            assert!(value.bytes().all(|b| ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn base62_zero_is_all_zero_digits() {
        assert_eq!(to_base62(&[0u8; 16], 5), "00000");
    }

    #[test]
    fn base62_keeps_low_order_digits() {
        // 62^3 + 2*62 + 3 = 238455; its digits are 1, 0, 2, 3 but only the
        // last three are kept when the requested length is 3
        let value = 238_455u32.to_be_bytes();

        assert_eq!(to_base62(&value, 4), "1023");
        assert_eq!(to_base62(&value, 3), "023");
    }

    #[test]
    fn base62_pads_short_integers_on_the_left() {
        // 61 is a single digit 'z'
        assert_eq!(to_base62(&[61u8], 4), "000z");
    }
}
