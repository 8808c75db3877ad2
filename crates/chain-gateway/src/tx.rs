//! Wire form of an outgoing transaction.
//!
//! The server signs a canonical JSON body and ships it hex-encoded to the
//! node client. Chain-native serialization happens inside the full node
//! integration, which is outside this crate.

use crate::GatewayError;
use common_types::{CoinType, TxOutput};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTransaction {
    pub chain: CoinType,
    /// Outpoint ids of the spent UTXOs, in selection order.
    pub inputs: Vec<String>,
    pub outputs: Vec<TxOutput>,
    /// One signature per input, over [`RawTransaction::signing_payload`].
    pub signatures: Vec<String>,
}

impl RawTransaction {
    /// The bytes each input signs: inputs and outputs, not the signatures.
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        for input in &self.inputs {
            payload.extend_from_slice(input.as_bytes());
            payload.push(b'|');
        }
        for output in &self.outputs {
            payload.extend_from_slice(output.address.as_bytes());
            payload.extend_from_slice(&output.amount.to_be_bytes());
        }
        payload
    }

    pub fn txid(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.signing_payload());
        hex::encode(hasher.finalize())
    }

    pub fn encode(&self) -> Result<String, GatewayError> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| GatewayError::InvalidInput(format!("unencodable transaction: {}", e)))?;
        Ok(hex::encode(bytes))
    }

    pub fn decode(raw: &str) -> Result<Self, GatewayError> {
        let bytes = hex::decode(raw)
            .map_err(|_| GatewayError::InvalidInput("transaction is not hex".to_string()))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| GatewayError::InvalidInput(format!("undecodable transaction: {}", e)))
    }
}
