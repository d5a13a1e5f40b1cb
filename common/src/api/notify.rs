use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::strkey;
use crate::difficulty::ENTROPY_SIZE;
use crate::model::{BlockIndex, Stroops};

// Wire format of the Discoverer -> Executor notification. Receipt is
// idempotent per blockIndex: a duplicate overwrites the in-memory
// schedule for that block.

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlantedFarmersPayload {
    pub block_index: BlockIndex,
    // 32 bytes, hex encoded
    pub entropy: String,
    // Unix seconds of the block, the anchor for work timing
    pub block_timestamp: u64,
    pub planted_farmers: Vec<PlantedFarmerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlantedFarmerEntry {
    pub farmer_id: Uuid,
    pub custodial_wallet: String,
    pub custodial_secret_key: String,
    // Stroops as a decimal string; kept out of JSON number space
    pub stake_amount: String,
    pub planting_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyResponse {
    pub success: bool,
    pub farmers_scheduled: usize,
}

// Structured error body returned by the executor on rejected requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("entropy must be {expected} hex characters, got {actual}")]
    BadEntropy { expected: usize, actual: usize },

    #[error("farmer {0} has an invalid custodial wallet")]
    BadWallet(Uuid),

    #[error("farmer {0} has an unparseable stake amount")]
    BadStake(Uuid),

    #[error("empty planted farmer set")]
    Empty,
}

impl PlantedFarmerEntry {
    pub fn stake_stroops(&self) -> Option<Stroops> {
        self.stake_amount.parse().ok()
    }
}

impl PlantedFarmersPayload {
    // Boundary validation: malformed notifications are rejected with a
    // 400 before any of their content reaches business logic.
    pub fn validate(&self) -> Result<(), PayloadError> {
        let expected = ENTROPY_SIZE * 2;
        if self.entropy.len() != expected || hex::decode(&self.entropy).is_err() {
            return Err(PayloadError::BadEntropy {
                expected,
                actual: self.entropy.len(),
            });
        }
        if self.planted_farmers.is_empty() {
            return Err(PayloadError::Empty);
        }
        for entry in &self.planted_farmers {
            if !strkey::is_valid_public(&entry.custodial_wallet) {
                return Err(PayloadError::BadWallet(entry.farmer_id));
            }
            if entry.stake_stroops().is_none() {
                return Err(PayloadError::BadStake(entry.farmer_id));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::strkey::encode_public;

    fn sample_payload() -> PlantedFarmersPayload {
        PlantedFarmersPayload {
            block_index: 42,
            entropy: "ab".repeat(32),
            block_timestamp: 1_700_000_000,
            planted_farmers: vec![PlantedFarmerEntry {
                farmer_id: Uuid::new_v4(),
                custodial_wallet: encode_public(&[5u8; 32]),
                custodial_secret_key: "SSEED".into(),
                stake_amount: "2500000".into(),
                planting_time: Utc::now(),
            }],
        }
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(sample_payload()).unwrap();
        assert!(json.get("blockIndex").is_some());
        assert!(json.get("blockTimestamp").is_some());
        let farmer = &json["plantedFarmers"][0];
        assert!(farmer.get("farmerId").is_some());
        assert!(farmer.get("custodialSecretKey").is_some());
        assert!(farmer.get("stakeAmount").is_some());
    }

    #[test]
    fn valid_payload_passes() {
        assert!(sample_payload().validate().is_ok());
    }

    #[test]
    fn bad_entropy_rejected() {
        let mut payload = sample_payload();
        payload.entropy = "zz".repeat(32);
        assert!(matches!(payload.validate(), Err(PayloadError::BadEntropy { .. })));
        payload.entropy = "ab".into();
        assert!(matches!(payload.validate(), Err(PayloadError::BadEntropy { .. })));
    }

    #[test]
    fn bad_wallet_rejected() {
        let mut payload = sample_payload();
        payload.planted_farmers[0].custodial_wallet = "not-a-wallet".into();
        assert!(matches!(payload.validate(), Err(PayloadError::BadWallet(_))));
    }

    #[test]
    fn bad_stake_rejected() {
        let mut payload = sample_payload();
        payload.planted_farmers[0].stake_amount = "12.5".into();
        assert!(matches!(payload.validate(), Err(PayloadError::BadStake(_))));
    }

    #[test]
    fn stake_parses_to_stroops() {
        assert_eq!(sample_payload().planted_farmers[0].stake_stroops(), Some(2_500_000));
    }
}
