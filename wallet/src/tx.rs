use serde::Serialize;
use sha3::{Digest, Keccak256};

use kale_common::model::{BlockIndex, Stroops};

use crate::{keys, ChainError};

// Transaction envelopes are canonical JSON; the RPC node re-derives the
// digest from the envelope it receives, so field order must be stable
// (serde serializes struct fields in declaration order).

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Plant {
        block_index: BlockIndex,
        stake: Stroops,
    },
    Work {
        block_index: BlockIndex,
        nonce: u64,
        hash: String,
    },
    Harvest {
        block_index: BlockIndex,
    },
    Transfer {
        destination: String,
        amount: Stroops,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct TxEnvelope {
    pub source: String,
    pub sequence: u64,
    pub fee: Stroops,
    // Binds signatures to one network
    pub network_passphrase: String,
    pub contract_id: String,
    pub operation: Operation,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignedTx {
    #[serde(flatten)]
    pub envelope: TxEnvelope,
    pub signature: String,
    // Local digest, also the hash the RPC reports back on success
    pub hash: String,
}

#[derive(Debug, Clone)]
pub struct TxBuilder {
    network_passphrase: String,
    contract_id: String,
    base_fee: Stroops,
}

impl TxBuilder {
    pub const DEFAULT_BASE_FEE: Stroops = 100;

    pub fn new(network_passphrase: String, contract_id: String) -> Self {
        Self {
            network_passphrase,
            contract_id,
            base_fee: Self::DEFAULT_BASE_FEE,
        }
    }

    pub fn with_base_fee(mut self, fee: Stroops) -> Self {
        self.base_fee = fee;
        self
    }

    pub fn build(
        &self,
        secret: &str,
        sequence: u64,
        operation: Operation,
    ) -> Result<SignedTx, ChainError> {
        let envelope = TxEnvelope {
            source: keys::public_of_secret(secret)?,
            sequence,
            fee: self.base_fee,
            network_passphrase: self.network_passphrase.clone(),
            contract_id: self.contract_id.clone(),
            operation,
        };

        let digest = envelope_digest(&envelope)?;
        let signature = keys::sign_digest(secret, &digest)?;

        Ok(SignedTx {
            envelope,
            signature,
            hash: hex::encode(digest),
        })
    }
}

fn envelope_digest(envelope: &TxEnvelope) -> Result<[u8; 32], ChainError> {
    let bytes = serde_json::to_vec(envelope)
        .map_err(|e| ChainError::BadRequest(format!("unserializable envelope: {e}")))?;
    let mut hasher = Keccak256::new();
    hasher.update(&bytes);
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate;

    fn builder() -> TxBuilder {
        TxBuilder::new("Test Pool Network ; 2026".into(), "CKALECONTRACT".into())
    }

    #[test]
    fn signed_tx_carries_source_and_hash() {
        let wallet = generate();
        let tx = builder()
            .build(
                &wallet.secret,
                7,
                Operation::Plant {
                    block_index: 42,
                    stake: 1_000_000,
                },
            )
            .unwrap();
        assert_eq!(tx.envelope.source, wallet.public);
        assert_eq!(tx.envelope.sequence, 7);
        assert_eq!(tx.hash.len(), 64);
        assert_eq!(tx.signature.len(), 128);
    }

    #[test]
    fn digest_changes_with_sequence() {
        let wallet = generate();
        let op = || Operation::Harvest { block_index: 9 };
        let a = builder().build(&wallet.secret, 1, op()).unwrap();
        let b = builder().build(&wallet.secret, 2, op()).unwrap();
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn operations_serialize_with_type_tag() {
        let wallet = generate();
        let tx = builder()
            .build(
                &wallet.secret,
                1,
                Operation::Transfer {
                    destination: "GDEST".into(),
                    amount: 5,
                },
            )
            .unwrap();
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["operation"]["type"], "transfer");
        assert_eq!(json["operation"]["amount"], 5);
        assert!(json["signature"].is_string());
    }
}
