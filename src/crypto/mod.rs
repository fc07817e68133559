//! Cryptographic utilities for the chain state
//!
//! This module provides:
//! - SHA-256 / double SHA-256 hashing
//! - The `Hash256` identity type
//! - Merkle root calculations

pub mod hash;
pub mod merkle;

pub use hash::{double_sha256, sha256, Hash256, HashParseError};
pub use merkle::{calculate_merkle_root, merkle_combine, merkle_root_with_mutation};
