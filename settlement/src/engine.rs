use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use log::info;
use serde_json::json;
use uuid::Uuid;

use kale_common::config::MIN_EXIT_STROOPS;
use kale_common::crypto::strkey;
use kale_common::model::{ContractStatus, ExitAuditLog, ExitSplit, ExitStatus};
use kale_storage::PoolStore;

use crate::split::split_rewards;
use crate::SettlementError;

#[derive(Debug, Clone)]
pub struct ExitRequest {
    pub farmer_id: Uuid,
    pub external_wallet: String,
    // true: the caller drives the payout right away instead of leaving it
    // to the background runner's next claim cycle
    pub immediate: bool,
    pub reason: Option<String>,
}

// Turns accumulated harvests into a persisted three-way split. The split
// row, the harvest marking and the farmer/contract transitions land in
// one storage transaction; payment is the payout runner's job.
pub struct SettlementEngine {
    store: Arc<dyn PoolStore>,
    platform_wallet: String,
}

impl SettlementEngine {
    pub fn new(store: Arc<dyn PoolStore>, platform_wallet: String) -> Self {
        Self {
            store,
            platform_wallet,
        }
    }

    pub async fn initiate_exit(&self, request: ExitRequest) -> Result<ExitSplit, SettlementError> {
        let farmer = self
            .store
            .farmer_by_id(request.farmer_id)
            .await?
            .ok_or(SettlementError::UnknownFarmer)?;

        let contract = self
            .store
            .live_contract_for_farmer(farmer.id)
            .await?
            .filter(|c| c.status == ContractStatus::Active)
            .ok_or(SettlementError::NoActiveContract)?;

        if self.store.processing_exit_for_farmer(farmer.id).await?.is_some() {
            return Err(SettlementError::ExitInProgress);
        }

        if !strkey::is_valid_public(&request.external_wallet) {
            return Err(SettlementError::InvalidWallet);
        }

        let harvests = self.store.unexited_harvests(farmer.id).await?;
        let total: u64 = harvests.iter().map(|h| h.reward_amount).sum();
        if total < MIN_EXIT_STROOPS {
            return Err(SettlementError::BelowMinimum {
                total,
                minimum: MIN_EXIT_STROOPS,
            });
        }

        let blocks: BTreeSet<u64> = harvests.iter().map(|h| h.block_index).collect();
        let first_harvest = harvests.iter().map(|h| h.harvested_at).min();
        let last_harvest = harvests.iter().map(|h| h.harvested_at).max();

        let outcome = split_rewards(total, contract.platform_fee_bps, contract.reward_split_bps)?;

        let pooler = self
            .store
            .pooler_by_id(contract.pooler_id)
            .await?
            .ok_or(SettlementError::UnknownPooler)?;

        let split = ExitSplit {
            id: Uuid::new_v4(),
            farmer_id: farmer.id,
            pooler_id: pooler.id,
            contract_id: contract.id,
            total_rewards: outcome.total,
            farmer_share: outcome.farmer_share,
            pooler_share: outcome.pooler_share,
            platform_fee: outcome.platform_fee,
            reward_split_bps: contract.reward_split_bps,
            platform_fee_bps: contract.platform_fee_bps,
            farmer_external_wallet: request.external_wallet.clone(),
            farmer_custodial_wallet: farmer.custodial_public_key.clone(),
            pooler_wallet: pooler.payout_wallet.clone(),
            platform_wallet: self.platform_wallet.clone(),
            farmer_tx_hash: None,
            pooler_tx_hash: None,
            platform_tx_hash: None,
            status: ExitStatus::Processing,
            retry_count: 0,
            blocks_included: blocks.len() as u32,
            harvests_included: harvests.len() as u32,
            initiated_at: Utc::now(),
            completed_at: None,
            exit_reason: request.reason.clone(),
        };

        let harvest_ids: Vec<Uuid> = harvests.iter().map(|h| h.id).collect();
        let audit = ExitAuditLog::new(
            split.id,
            "initiated",
            json!({
                "total_rewards": total,
                "farmer_share": outcome.farmer_share,
                "pooler_share": outcome.pooler_share,
                "platform_fee": outcome.platform_fee,
                "harvests_included": harvests.len(),
                "blocks_included": blocks.len(),
                "first_harvest_at": first_harvest,
                "last_harvest_at": last_harvest,
                "immediate": request.immediate,
                "reason": request.reason,
            }),
        );

        self.store
            .create_exit_split(&split, &harvest_ids, &audit)
            .await?;

        info!(
            "exit {} initiated for farmer {}: {} stroops over {} harvests ({} blocks)",
            split.id,
            farmer.id,
            total,
            harvests.len(),
            blocks.len()
        );

        Ok(split)
    }
}
