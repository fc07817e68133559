//! Script verification
//!
//! Script semantics are outside the chain state: validation only asks an
//! oracle whether an input's unlocking script satisfies the locking script of
//! the output it spends. `StandardScriptVerifier` understands the handful of
//! templates used by locally built chains; anything else is rejected.

use crate::core::transaction::Transaction;
use crate::crypto::{double_sha256, Hash256};
use thiserror::Error;

// =============================================================================
// Opcodes
// =============================================================================

pub const OP_TRUE: u8 = 0x51;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_HASH256: u8 = 0xaa;
pub const OP_EQUAL: u8 = 0x87;

/// Script-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("Output is provably unspendable")]
    Unspendable,
    #[error("Unlocking script is not a single push")]
    MalformedUnlock,
    #[error("Hash lock preimage mismatch")]
    PreimageMismatch,
    #[error("Unsupported locking script")]
    UnsupportedScript,
}

/// Oracle deciding whether an input may spend a previous output
pub trait ScriptVerifier: Send + Sync {
    /// `combined_script` is the unlocking script followed by the locking script
    fn verify_script(
        &self,
        block_hash: &Hash256,
        tx_index: u32,
        prev_output_script: &[u8],
        tx: &Transaction,
        input_index: usize,
        combined_script: &[u8],
    ) -> bool;
}

/// Accepts every script
#[derive(Debug, Clone, Copy, Default)]
pub struct NullScriptVerifier;

impl ScriptVerifier for NullScriptVerifier {
    fn verify_script(
        &self,
        _block_hash: &Hash256,
        _tx_index: u32,
        _prev_output_script: &[u8],
        _tx: &Transaction,
        _input_index: usize,
        _combined_script: &[u8],
    ) -> bool {
        true
    }
}

// =============================================================================
// Standard templates
// =============================================================================

/// Locking script requiring the preimage of `hash`
pub fn hash_lock_script(hash: &Hash256) -> Vec<u8> {
    let mut script = Vec::with_capacity(35);
    script.push(OP_HASH256);
    script.push(32);
    script.extend_from_slice(hash.as_bytes());
    script.push(OP_EQUAL);
    script
}

/// Unlocking script pushing `preimage`
pub fn push_script(preimage: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(preimage.len() + 1);
    script.push(preimage.len() as u8);
    script.extend_from_slice(preimage);
    script
}

/// Verifier for anyone-can-spend, `OP_RETURN` and hash-lock outputs
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardScriptVerifier;

impl StandardScriptVerifier {
    pub fn check(&self, script_sig: &[u8], script_pubkey: &[u8]) -> Result<(), ScriptError> {
        match script_pubkey {
            [] | [OP_TRUE] => Ok(()),
            [OP_RETURN, ..] => Err(ScriptError::Unspendable),
            [OP_HASH256, 32, hash @ .., OP_EQUAL] if hash.len() == 32 => {
                let preimage = match script_sig {
                    [len, rest @ ..] if *len as usize == rest.len() && *len < 0x4c => rest,
                    _ => return Err(ScriptError::MalformedUnlock),
                };
                if double_sha256(preimage).as_bytes().as_slice() == hash {
                    Ok(())
                } else {
                    Err(ScriptError::PreimageMismatch)
                }
            }
            _ => Err(ScriptError::UnsupportedScript),
        }
    }
}

impl ScriptVerifier for StandardScriptVerifier {
    fn verify_script(
        &self,
        block_hash: &Hash256,
        tx_index: u32,
        prev_output_script: &[u8],
        tx: &Transaction,
        input_index: usize,
        _combined_script: &[u8],
    ) -> bool {
        let Some(input) = tx.inputs().get(input_index) else {
            return false;
        };
        match self.check(&input.script_sig, prev_output_script) {
            Ok(()) => true,
            Err(e) => {
                log::debug!(
                    "Script check failed in block {} tx {} input {}: {}",
                    block_hash,
                    tx_index,
                    input_index,
                    e
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anyone_can_spend() {
        let verifier = StandardScriptVerifier;
        assert!(verifier.check(&[], &[OP_TRUE]).is_ok());
        assert!(verifier.check(&[1, 2], &[]).is_ok());
    }

    #[test]
    fn test_op_return_unspendable() {
        let verifier = StandardScriptVerifier;
        assert_eq!(
            verifier.check(&[], &[OP_RETURN, 1, 0]),
            Err(ScriptError::Unspendable)
        );
    }

    #[test]
    fn test_hash_lock() {
        let verifier = StandardScriptVerifier;
        let lock = hash_lock_script(&double_sha256(b"secret"));

        assert!(verifier.check(&push_script(b"secret"), &lock).is_ok());
        assert_eq!(
            verifier.check(&push_script(b"guess"), &lock),
            Err(ScriptError::PreimageMismatch)
        );
        assert_eq!(
            verifier.check(&[9, 1], &lock),
            Err(ScriptError::MalformedUnlock)
        );
    }

    #[test]
    fn test_unknown_template_rejected() {
        let verifier = StandardScriptVerifier;
        assert_eq!(
            verifier.check(&[], &[0x76, 0xa9]),
            Err(ScriptError::UnsupportedScript)
        );
    }
}
