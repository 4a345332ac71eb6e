// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::bigint::{BigInt, ParseBigIntError};

/// Fixed-point precision, in bits, of the Q.128 values used by reward and power estimates.
pub const PRECISION: u64 = 128;

/// Parses a list of decimal strings into big integers.
pub fn poly_parse(coefs: &[&str]) -> Result<Vec<BigInt>, ParseBigIntError> {
    coefs.iter().map(|c| c.parse()).collect()
}

/// Evaluates a polynomial with Q.128 coefficients at Q.128 `x` using Horner's method.
/// Coefficients are ordered from the highest power down.
pub fn poly_val(poly: &[BigInt], x: &BigInt) -> BigInt {
    let mut res = BigInt::default();

    for coef in poly {
        res = ((res * x) >> PRECISION) + coef;
    }
    res
}
