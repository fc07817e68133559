//! Transaction handling for the chain state
//!
//! Implements the UTXO transaction model: inputs reference previous outputs
//! by `TxOutputKey`, outputs carry a value and a locking script. The hash of a
//! transaction is the double SHA-256 of its canonical encoding and is computed
//! once, when the value is built.

use crate::core::encoding::{Decoder, Encoder, EncodingError};
use crate::core::unspent::TxOutputKey;
use crate::crypto::{double_sha256, Hash256};
use serde::{Deserialize, Serialize};

// =============================================================================
// Constants
// =============================================================================

/// Current transaction version
pub const TX_VERSION: u32 = 1;

/// Sequence number that disables locktime
pub const SEQUENCE_FINAL: u32 = 0xFFFFFFFF;

/// Serde helper storing scripts and raw bytes as hex strings
pub(crate) mod hex_bytes {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(de::Error::custom)
    }
}

// =============================================================================
// Transaction Input
// =============================================================================

/// Transaction input (reference to a previous output)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxInput {
    /// Output being spent
    pub previous_output: TxOutputKey,
    /// Unlocking script
    #[serde(with = "hex_bytes")]
    pub script_sig: Vec<u8>,
    #[serde(default = "default_sequence")]
    pub sequence: u32,
}

fn default_sequence() -> u32 {
    SEQUENCE_FINAL
}

impl TxInput {
    pub fn new(previous_output: TxOutputKey, script_sig: Vec<u8>) -> Self {
        Self {
            previous_output,
            script_sig,
            sequence: SEQUENCE_FINAL,
        }
    }
}

// =============================================================================
// Transaction Output
// =============================================================================

/// Transaction output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxOutput {
    /// Amount in base units
    pub value: u64,
    /// Locking script
    #[serde(with = "hex_bytes")]
    pub script_pubkey: Vec<u8>,
}

impl TxOutput {
    pub fn new(value: u64, script_pubkey: Vec<u8>) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }
}

// =============================================================================
// Transaction
// =============================================================================

/// Plain transaction fields, the serialized form of a `Transaction`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionData {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    #[serde(default)]
    pub lock_time: u32,
}

/// An immutable transaction with its cached hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "TransactionData", into = "TransactionData")]
pub struct Transaction {
    version: u32,
    inputs: Vec<TxInput>,
    outputs: Vec<TxOutput>,
    lock_time: u32,
    hash: Hash256,
}

impl Transaction {
    pub fn new(version: u32, inputs: Vec<TxInput>, outputs: Vec<TxOutput>, lock_time: u32) -> Self {
        let mut tx = Self {
            version,
            inputs,
            outputs,
            lock_time,
            hash: Hash256::ZERO,
        };
        tx.hash = double_sha256(&tx.to_bytes());
        tx
    }

    /// Build a coinbase paying `value` to `script_pubkey`.
    ///
    /// The height is pushed into the unlocking script so coinbases of
    /// different blocks never share a hash.
    pub fn coinbase(height: u32, value: u64, script_pubkey: Vec<u8>) -> Self {
        let mut script_sig = vec![4u8];
        script_sig.extend_from_slice(&height.to_le_bytes());

        Self::new(
            TX_VERSION,
            vec![TxInput::new(TxOutputKey::null(), script_sig)],
            vec![TxOutput::new(value, script_pubkey)],
            0,
        )
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn inputs(&self) -> &[TxInput] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TxOutput] {
        &self.outputs
    }

    pub fn lock_time(&self) -> u32 {
        self.lock_time
    }

    pub fn hash(&self) -> Hash256 {
        self.hash
    }

    /// A coinbase has exactly one input, spending the null key
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    /// Sum of output values, `None` on overflow
    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, output| acc.checked_add(output.value))
    }

    /// Canonical byte encoding
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(
            10 + self.inputs.len() * 41 + self.outputs.len() * 9,
        );
        encoder.write_u32_le(self.version);

        encoder.write_var_int(self.inputs.len() as u64);
        for input in &self.inputs {
            encoder.write_bytes(input.previous_output.tx_hash.as_bytes());
            encoder.write_u32_le(input.previous_output.output_index);
            encoder.write_var_bytes(&input.script_sig);
            encoder.write_u32_le(input.sequence);
        }

        encoder.write_var_int(self.outputs.len() as u64);
        for output in &self.outputs {
            encoder.write_u64_le(output.value);
            encoder.write_var_bytes(&output.script_pubkey);
        }

        encoder.write_u32_le(self.lock_time);
        encoder.into_inner()
    }

    /// Decode from the canonical encoding; the whole slice must be consumed
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EncodingError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_u32_le()?;

        let input_count = decoder.read_length()?;
        let mut inputs = Vec::with_capacity(input_count.min(1024));
        for _ in 0..input_count {
            let tx_hash = Hash256::from_bytes(decoder.read_array32()?);
            let output_index = decoder.read_u32_le()?;
            let script_sig = decoder.read_var_bytes()?;
            let sequence = decoder.read_u32_le()?;
            inputs.push(TxInput {
                previous_output: TxOutputKey::new(tx_hash, output_index),
                script_sig,
                sequence,
            });
        }

        let output_count = decoder.read_length()?;
        let mut outputs = Vec::with_capacity(output_count.min(1024));
        for _ in 0..output_count {
            let value = decoder.read_u64_le()?;
            let script_pubkey = decoder.read_var_bytes()?;
            outputs.push(TxOutput {
                value,
                script_pubkey,
            });
        }

        let lock_time = decoder.read_u32_le()?;
        decoder.finish()?;

        Ok(Self::new(version, inputs, outputs, lock_time))
    }
}

impl From<TransactionData> for Transaction {
    fn from(data: TransactionData) -> Self {
        Self::new(data.version, data.inputs, data.outputs, data.lock_time)
    }
}

impl From<Transaction> for TransactionData {
    fn from(tx: Transaction) -> Self {
        Self {
            version: tx.version,
            inputs: tx.inputs,
            outputs: tx.outputs,
            lock_time: tx.lock_time,
        }
    }
}
