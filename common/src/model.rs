use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};
use uuid::Uuid;

// Smallest unit of the native asset; 1 KALE = 10^7 stroops.
// Money never leaves integer space.
pub type Stroops = u64;
// Monotonically increasing identifier of one proof-of-work round.
pub type BlockIndex = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Registered,
    Verified,
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FarmerStatus {
    WalletCreated,
    Funded,
    ActiveInPool,
    Exiting,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PoolerStatus {
    Active,
    Full,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Pending,
    Active,
    Exiting,
    Completed,
}

// Forward-only lifecycle of one block operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Discovered,
    PlantingCompleted,
    WorkCompleted,
    Completed,
    Failed,
}

impl BlockStatus {
    // Ordinal used to refuse backwards transitions
    pub fn rank(self) -> u8 {
        match self {
            BlockStatus::Discovered => 0,
            BlockStatus::PlantingCompleted => 1,
            BlockStatus::WorkCompleted => 2,
            BlockStatus::Completed => 3,
            BlockStatus::Failed => 4,
        }
    }
}

// Outcome of a single per-farmer chain attempt (plant, work or harvest row)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Processing,
    Completed,
    Failed,
    Cancelled,
}

// The three outbound transfers of one exit settlement, paid in this order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PayoutLeg {
    Farmer,
    Pooler,
    Platform,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub external_wallet: Option<String>,
    pub status: UserStatus,
    pub created_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Farmer {
    pub id: Uuid,
    pub user_id: Uuid,
    pub custodial_public_key: String,
    // XChaCha20Poly1305 ciphertext of the S... seed, hex encoded.
    // The plaintext seed exists only transiently in memory for signing.
    pub custodial_secret_enc: String,
    pub payout_wallet_address: Option<String>,
    pub status: FarmerStatus,
    pub current_balance: Stroops,
    pub is_funded: bool,
    // Set after an insufficient_funds failure; cleared by the re-check task
    pub needs_funding_check: bool,
    pub funded_at: Option<DateTime<Utc>>,
    pub joined_pool_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pooler {
    pub id: Uuid,
    pub name: String,
    pub reward_bps: u32,
    pub max_farmers: u32,
    pub current_farmers: u32,
    pub status: PoolerStatus,
    pub api_endpoint: String,
    pub api_key: String,
    // Destination of the pooler share in exit settlements
    pub payout_wallet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolContract {
    pub id: Uuid,
    pub farmer_id: Uuid,
    pub pooler_id: Uuid,
    // Fraction of the base stake this farmer commits, in basis points
    pub stake_bps: u32,
    // Harvest cadence in blocks, 1..=20
    pub harvest_interval: u32,
    // Farmer's fraction of net rewards, in basis points
    pub reward_split_bps: u32,
    pub platform_fee_bps: u32,
    pub status: ContractStatus,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub exit_requested_at: Option<DateTime<Utc>>,
    // Opaque to the core; stored and returned as-is
    pub contract_terms: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockOperation {
    pub id: Uuid,
    pub block_index: BlockIndex,
    pub pooler_id: Uuid,
    pub status: BlockStatus,
    // 32 bytes, hex encoded
    pub entropy: String,
    pub block_age_secs: u64,
    pub plantable: bool,
    pub min_zeros: u32,
    pub max_zeros: u32,
    pub min_stake: Stroops,
    pub max_stake: Stroops,
    pub total_farmers: u32,
    pub successful_plants: u32,
    pub successful_works: u32,
    pub successful_harvests: u32,
    pub total_staked: Stroops,
    pub total_rewards: Stroops,
    pub discovered_at: DateTime<Utc>,
    pub plant_requested_at: Option<DateTime<Utc>>,
    pub plant_completed_at: Option<DateTime<Utc>>,
    pub work_completed_at: Option<DateTime<Utc>>,
}

// Discovery-time snapshot of a block, fed to the idempotent upsert
#[derive(Debug, Clone)]
pub struct NewBlockOperation {
    pub block_index: BlockIndex,
    pub pooler_id: Uuid,
    pub entropy: String,
    pub block_age_secs: u64,
    pub plantable: bool,
    pub min_zeros: u32,
    pub max_zeros: u32,
    pub min_stake: Stroops,
    pub max_stake: Stroops,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Planting {
    pub id: Uuid,
    pub block_index: BlockIndex,
    pub farmer_id: Uuid,
    pub pooler_id: Uuid,
    pub custodial_wallet: String,
    pub stake_amount: Stroops,
    pub transaction_hash: Option<String>,
    pub status: AttemptStatus,
    pub error_message: Option<String>,
    pub planted_at: DateTime<Utc>,
}

impl Planting {
    pub fn success(
        block_index: BlockIndex,
        farmer_id: Uuid,
        pooler_id: Uuid,
        custodial_wallet: String,
        stake_amount: Stroops,
        tx_hash: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            block_index,
            farmer_id,
            pooler_id,
            custodial_wallet,
            stake_amount,
            transaction_hash: Some(tx_hash),
            status: AttemptStatus::Success,
            error_message: None,
            planted_at: Utc::now(),
        }
    }

    pub fn failed(
        block_index: BlockIndex,
        farmer_id: Uuid,
        pooler_id: Uuid,
        custodial_wallet: String,
        stake_amount: Stroops,
        error: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            block_index,
            farmer_id,
            pooler_id,
            custodial_wallet,
            stake_amount,
            transaction_hash: None,
            status: AttemptStatus::Failed,
            error_message: Some(error),
            planted_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Work {
    pub id: Uuid,
    pub block_index: BlockIndex,
    pub farmer_id: Uuid,
    pub nonce: u64,
    pub hash: String,
    // Leading hex zeros of the found hash
    pub zeros: u32,
    // How far the hash exceeded the required difficulty
    pub gap: u32,
    pub transaction_hash: Option<String>,
    pub status: AttemptStatus,
    pub error_message: Option<String>,
    // All recoveries exhausted; the farmer is owed compensation
    pub compensation_required: bool,
    pub worked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Harvest {
    pub id: Uuid,
    pub block_index: BlockIndex,
    pub farmer_id: Uuid,
    pub reward_amount: Stroops,
    pub transaction_hash: Option<String>,
    pub status: AttemptStatus,
    pub error_message: Option<String>,
    pub included_in_exit: bool,
    pub exit_split_id: Option<Uuid>,
    pub harvested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitSplit {
    pub id: Uuid,
    pub farmer_id: Uuid,
    pub pooler_id: Uuid,
    pub contract_id: Uuid,
    pub total_rewards: Stroops,
    pub farmer_share: Stroops,
    pub pooler_share: Stroops,
    pub platform_fee: Stroops,
    pub reward_split_bps: u32,
    pub platform_fee_bps: u32,
    pub farmer_external_wallet: String,
    pub farmer_custodial_wallet: String,
    pub pooler_wallet: String,
    pub platform_wallet: String,
    pub farmer_tx_hash: Option<String>,
    pub pooler_tx_hash: Option<String>,
    pub platform_tx_hash: Option<String>,
    pub status: ExitStatus,
    pub retry_count: u32,
    pub blocks_included: u32,
    pub harvests_included: u32,
    pub initiated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_reason: Option<String>,
}

impl ExitSplit {
    pub fn leg_hash(&self, leg: PayoutLeg) -> Option<&str> {
        match leg {
            PayoutLeg::Farmer => self.farmer_tx_hash.as_deref(),
            PayoutLeg::Pooler => self.pooler_tx_hash.as_deref(),
            PayoutLeg::Platform => self.platform_tx_hash.as_deref(),
        }
    }

    pub fn leg_destination(&self, leg: PayoutLeg) -> &str {
        match leg {
            PayoutLeg::Farmer => &self.farmer_external_wallet,
            PayoutLeg::Pooler => &self.pooler_wallet,
            PayoutLeg::Platform => &self.platform_wallet,
        }
    }

    pub fn leg_amount(&self, leg: PayoutLeg) -> Stroops {
        match leg {
            PayoutLeg::Farmer => self.farmer_share,
            PayoutLeg::Pooler => self.pooler_share,
            PayoutLeg::Platform => self.platform_fee,
        }
    }
}

// Append-only trail of everything that happened to an exit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitAuditLog {
    pub id: Uuid,
    pub exit_split_id: Uuid,
    pub action: String,
    pub old_status: Option<ExitStatus>,
    pub new_status: Option<ExitStatus>,
    pub details: Value,
    pub performed_by: Option<String>,
    pub performed_at: DateTime<Utc>,
}

impl ExitAuditLog {
    pub fn new(exit_split_id: Uuid, action: impl Into<String>, details: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            exit_split_id,
            action: action.into(),
            old_status: None,
            new_status: None,
            details,
            performed_by: None,
            performed_at: Utc::now(),
        }
    }

    pub fn transition(mut self, old: ExitStatus, new: ExitStatus) -> Self {
        self.old_status = Some(old);
        self.new_status = Some(new);
        self
    }
}

// Farmer joined with its live contract, as returned by the eligibility query
#[derive(Debug, Clone)]
pub struct EligibleFarmer {
    pub farmer: Farmer,
    pub contract: PoolContract,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        assert_eq!(BlockStatus::PlantingCompleted.to_string(), "planting_completed");
        assert_eq!(
            "planting_completed".parse::<BlockStatus>().ok(),
            Some(BlockStatus::PlantingCompleted)
        );
        assert_eq!(
            "active_in_pool".parse::<FarmerStatus>().ok(),
            Some(FarmerStatus::ActiveInPool)
        );
        assert_eq!("processing".parse::<ExitStatus>().ok(), Some(ExitStatus::Processing));
    }

    #[test]
    fn block_status_ranks_forward() {
        assert!(BlockStatus::Discovered.rank() < BlockStatus::PlantingCompleted.rank());
        assert!(BlockStatus::PlantingCompleted.rank() < BlockStatus::WorkCompleted.rank());
        assert!(BlockStatus::WorkCompleted.rank() < BlockStatus::Completed.rank());
    }

    #[test]
    fn exit_split_leg_accessors() {
        let split = ExitSplit {
            id: Uuid::new_v4(),
            farmer_id: Uuid::new_v4(),
            pooler_id: Uuid::new_v4(),
            contract_id: Uuid::new_v4(),
            total_rewards: 100,
            farmer_share: 70,
            pooler_share: 25,
            platform_fee: 5,
            reward_split_bps: 7000,
            platform_fee_bps: 500,
            farmer_external_wallet: "GFARMER".into(),
            farmer_custodial_wallet: "GCUSTODIAL".into(),
            pooler_wallet: "GPOOLER".into(),
            platform_wallet: "GPLATFORM".into(),
            farmer_tx_hash: Some("abc".into()),
            pooler_tx_hash: None,
            platform_tx_hash: None,
            status: ExitStatus::Processing,
            retry_count: 0,
            blocks_included: 2,
            harvests_included: 3,
            initiated_at: Utc::now(),
            completed_at: None,
            exit_reason: None,
        };
        assert_eq!(split.leg_hash(PayoutLeg::Farmer), Some("abc"));
        assert_eq!(split.leg_hash(PayoutLeg::Pooler), None);
        assert_eq!(split.leg_amount(PayoutLeg::Platform), 5);
        assert_eq!(split.leg_destination(PayoutLeg::Pooler), "GPOOLER");
    }
}
