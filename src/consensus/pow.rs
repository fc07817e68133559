//! Proof-of-work targets, block work and difficulty retargeting
//!
//! Targets are 256-bit unsigned integers carried in headers in the compact
//! "bits" form. Block hashes are compared against them as little-endian
//! integers.

use crate::consensus::params::ChainParams;
use crate::core::chain::Chain;
use crate::crypto::Hash256;
use num_bigint::BigUint;
use primitive_types::U256;
use thiserror::Error;

/// Proof-of-work errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PowError {
    #[error("Compact target {0:#010x} is negative")]
    Negative(u32),
    #[error("Compact target {0:#010x} overflows 256 bits")]
    Overflow(u32),
    #[error("Compact target {0:#010x} is zero")]
    Zero(u32),
    #[error("Target {0:#010x} is easier than the proof-of-work limit")]
    AboveLimit(u32),
    #[error("Block hash {0} exceeds its declared target")]
    HashAboveDeclaredTarget(Hash256),
    #[error("Block hash {0} exceeds the required target")]
    HashAboveRequiredTarget(Hash256),
    #[error("Missing ancestor at height {0} for retarget")]
    MissingAncestor(u32),
}

// =============================================================================
// Compact form
// =============================================================================

/// Expand compact bits into a 256-bit target
pub fn target_from_compact(bits: u32) -> Result<U256, PowError> {
    let size = bits >> 24;
    let word = bits & 0x007f_ffff;

    if word != 0 && bits & 0x0080_0000 != 0 {
        return Err(PowError::Negative(bits));
    }
    if word != 0 && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32)) {
        return Err(PowError::Overflow(bits));
    }

    let target = if size <= 3 {
        U256::from(word >> (8 * (3 - size)))
    } else {
        U256::from(word) << (8 * (size - 3) as usize)
    };
    Ok(target)
}

/// Compress a 256-bit target into compact bits
pub fn target_to_compact(target: U256) -> u32 {
    if target.is_zero() {
        return 0;
    }

    let mut size = target.bits().div_ceil(8) as u32;
    let mut compact = if size <= 3 {
        target.low_u32() << (8 * (3 - size))
    } else {
        (target >> (8 * (size - 3) as usize)).low_u32()
    };

    // The mantissa's top bit is a sign bit
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn hash_to_u256(hash: &Hash256) -> U256 {
    U256::from_little_endian(hash.as_bytes())
}

fn u256_to_biguint(value: U256) -> BigUint {
    let mut bytes = [0u8; 32];
    value.to_big_endian(&mut bytes);
    BigUint::from_bytes_be(&bytes)
}

// =============================================================================
// Work
// =============================================================================

/// Expected number of hashes to meet `bits`: `2^256 / (target + 1)`.
///
/// Invalid or zero targets carry no work.
pub fn block_work(bits: u32) -> BigUint {
    let target = match target_from_compact(bits) {
        Ok(target) if !target.is_zero() => target,
        _ => return BigUint::default(),
    };
    let one = U256::one();
    // 2^256 / (t + 1) == (~t / (t + 1)) + 1, and t + 1 cannot overflow below
    // because a compact target never reaches 2^256 - 1
    u256_to_biguint((!target / (target + one)) + one)
}

// =============================================================================
// Validation
// =============================================================================

/// Check a header hash against its declared bits and the bits the chain requires
pub fn check_proof_of_work(
    hash: &Hash256,
    declared_bits: u32,
    required_bits: u32,
    params: &ChainParams,
) -> Result<(), PowError> {
    let declared = target_from_compact(declared_bits)?;
    if declared.is_zero() {
        return Err(PowError::Zero(declared_bits));
    }
    let limit = target_from_compact(params.pow_limit_bits)?;
    if declared > limit {
        return Err(PowError::AboveLimit(declared_bits));
    }

    let value = hash_to_u256(hash);
    if value > declared {
        return Err(PowError::HashAboveDeclaredTarget(*hash));
    }

    let required = target_from_compact(required_bits)?;
    if value > required {
        return Err(PowError::HashAboveRequiredTarget(*hash));
    }

    Ok(())
}

/// New target after an interval that took `actual_timespan` seconds
pub fn retarget(prev_bits: u32, actual_timespan: i64, params: &ChainParams) -> Result<u32, PowError> {
    let timespan = params.target_timespan as i64;
    let actual = actual_timespan.clamp(timespan / 4, timespan * 4);

    let limit = target_from_compact(params.pow_limit_bits)?;
    let target = target_from_compact(prev_bits)?
        .checked_mul(U256::from(actual as u64))
        .map(|scaled| scaled / U256::from(timespan as u64))
        .unwrap_or(limit);

    Ok(target_to_compact(target.min(limit)))
}

/// Bits required of the block extending `chain`
pub fn next_required_bits(chain: &Chain, params: &ChainParams) -> Result<u32, PowError> {
    let tip = chain.tip();
    let next_height = tip.height + 1;

    if params.no_retargeting || next_height % params.retarget_interval != 0 {
        return Ok(tip.header.bits);
    }

    let first_height = next_height - params.retarget_interval;
    let first = chain
        .get(first_height)
        .ok_or(PowError::MissingAncestor(first_height))?;
    let actual = tip.header.time as i64 - first.header.time as i64;

    let bits = retarget(tip.header.bits, actual, params)?;
    log::debug!(
        "Retarget at height {}: {:#010x} -> {:#010x} (timespan {}s)",
        next_height,
        tip.header.bits,
        bits,
        actual
    );
    Ok(bits)
}
