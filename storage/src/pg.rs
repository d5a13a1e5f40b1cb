use std::str::FromStr;

use async_trait::async_trait;
use log::warn;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use kale_common::model::{
    BlockIndex, BlockOperation, ContractStatus, EligibleFarmer, ExitAuditLog, ExitSplit, Farmer,
    FarmerStatus, Harvest, NewBlockOperation, PayoutLeg, Planting, PoolContract, Pooler, Stroops,
    Work,
};

use crate::{PoolStore, StoreError};

// Postgres backend. Uniqueness and the split conservation rule are
// enforced by the schema itself, so a second process racing the same
// write loses cleanly at the database instead of corrupting state.

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row"),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.to_string())
            }
            other => StoreError::Database(other.to_string()),
        }
    }
}

fn parse_enum<T: FromStr>(raw: &str, what: &'static str) -> Result<T, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Corrupt(format!("{what}: {raw}")))
}

fn map_farmer(row: &PgRow) -> Result<Farmer, StoreError> {
    Ok(Farmer {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        custodial_public_key: row.try_get("custodial_public_key")?,
        custodial_secret_enc: row.try_get("custodial_secret_enc")?,
        payout_wallet_address: row.try_get("payout_wallet_address")?,
        status: parse_enum(row.try_get::<String, _>("status")?.as_str(), "farmer status")?,
        current_balance: row.try_get::<i64, _>("current_balance")? as Stroops,
        is_funded: row.try_get("is_funded")?,
        needs_funding_check: row.try_get("needs_funding_check")?,
        funded_at: row.try_get("funded_at")?,
        joined_pool_at: row.try_get("joined_pool_at")?,
    })
}

fn map_pooler(row: &PgRow) -> Result<Pooler, StoreError> {
    Ok(Pooler {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        reward_bps: row.try_get::<i32, _>("reward_bps")? as u32,
        max_farmers: row.try_get::<i32, _>("max_farmers")? as u32,
        current_farmers: row.try_get::<i32, _>("current_farmers")? as u32,
        status: parse_enum(row.try_get::<String, _>("status")?.as_str(), "pooler status")?,
        api_endpoint: row.try_get("api_endpoint")?,
        api_key: row.try_get("api_key")?,
        payout_wallet: row.try_get("payout_wallet")?,
    })
}

fn map_contract(row: &PgRow) -> Result<PoolContract, StoreError> {
    Ok(PoolContract {
        id: row.try_get("id")?,
        farmer_id: row.try_get("farmer_id")?,
        pooler_id: row.try_get("pooler_id")?,
        stake_bps: row.try_get::<i32, _>("stake_bps")? as u32,
        harvest_interval: row.try_get::<i32, _>("harvest_interval")? as u32,
        reward_split_bps: row.try_get::<i32, _>("reward_split_bps")? as u32,
        platform_fee_bps: row.try_get::<i32, _>("platform_fee_bps")? as u32,
        status: parse_enum(row.try_get::<String, _>("status")?.as_str(), "contract status")?,
        created_at: row.try_get("created_at")?,
        confirmed_at: row.try_get("confirmed_at")?,
        exit_requested_at: row.try_get("exit_requested_at")?,
        contract_terms: row.try_get("contract_terms")?,
    })
}

fn map_block(row: &PgRow) -> Result<BlockOperation, StoreError> {
    Ok(BlockOperation {
        id: row.try_get("id")?,
        block_index: row.try_get::<i64, _>("block_index")? as BlockIndex,
        pooler_id: row.try_get("pooler_id")?,
        status: parse_enum(row.try_get::<String, _>("status")?.as_str(), "block status")?,
        entropy: row.try_get("entropy")?,
        block_age_secs: row.try_get::<i64, _>("block_age_secs")? as u64,
        plantable: row.try_get("plantable")?,
        min_zeros: row.try_get::<i32, _>("min_zeros")? as u32,
        max_zeros: row.try_get::<i32, _>("max_zeros")? as u32,
        min_stake: row.try_get::<i64, _>("min_stake")? as Stroops,
        max_stake: row.try_get::<i64, _>("max_stake")? as Stroops,
        total_farmers: row.try_get::<i32, _>("total_farmers")? as u32,
        successful_plants: row.try_get::<i32, _>("successful_plants")? as u32,
        successful_works: row.try_get::<i32, _>("successful_works")? as u32,
        successful_harvests: row.try_get::<i32, _>("successful_harvests")? as u32,
        total_staked: row.try_get::<i64, _>("total_staked")? as Stroops,
        total_rewards: row.try_get::<i64, _>("total_rewards")? as Stroops,
        discovered_at: row.try_get("discovered_at")?,
        plant_requested_at: row.try_get("plant_requested_at")?,
        plant_completed_at: row.try_get("plant_completed_at")?,
        work_completed_at: row.try_get("work_completed_at")?,
    })
}

fn map_planting(row: &PgRow) -> Result<Planting, StoreError> {
    Ok(Planting {
        id: row.try_get("id")?,
        block_index: row.try_get::<i64, _>("block_index")? as BlockIndex,
        farmer_id: row.try_get("farmer_id")?,
        pooler_id: row.try_get("pooler_id")?,
        custodial_wallet: row.try_get("custodial_wallet")?,
        stake_amount: row.try_get::<i64, _>("stake_amount")? as Stroops,
        transaction_hash: row.try_get("transaction_hash")?,
        status: parse_enum(row.try_get::<String, _>("status")?.as_str(), "planting status")?,
        error_message: row.try_get("error_message")?,
        planted_at: row.try_get("planted_at")?,
    })
}

fn map_work(row: &PgRow) -> Result<Work, StoreError> {
    Ok(Work {
        id: row.try_get("id")?,
        block_index: row.try_get::<i64, _>("block_index")? as BlockIndex,
        farmer_id: row.try_get("farmer_id")?,
        nonce: row.try_get::<i64, _>("nonce")? as u64,
        hash: row.try_get("hash")?,
        zeros: row.try_get::<i32, _>("zeros")? as u32,
        gap: row.try_get::<i32, _>("gap")? as u32,
        transaction_hash: row.try_get("transaction_hash")?,
        status: parse_enum(row.try_get::<String, _>("status")?.as_str(), "work status")?,
        error_message: row.try_get("error_message")?,
        compensation_required: row.try_get("compensation_required")?,
        worked_at: row.try_get("worked_at")?,
    })
}

fn map_harvest(row: &PgRow) -> Result<Harvest, StoreError> {
    Ok(Harvest {
        id: row.try_get("id")?,
        block_index: row.try_get::<i64, _>("block_index")? as BlockIndex,
        farmer_id: row.try_get("farmer_id")?,
        reward_amount: row.try_get::<i64, _>("reward_amount")? as Stroops,
        transaction_hash: row.try_get("transaction_hash")?,
        status: parse_enum(row.try_get::<String, _>("status")?.as_str(), "harvest status")?,
        error_message: row.try_get("error_message")?,
        included_in_exit: row.try_get("included_in_exit")?,
        exit_split_id: row.try_get("exit_split_id")?,
        harvested_at: row.try_get("harvested_at")?,
    })
}

fn map_exit(row: &PgRow) -> Result<ExitSplit, StoreError> {
    Ok(ExitSplit {
        id: row.try_get("id")?,
        farmer_id: row.try_get("farmer_id")?,
        pooler_id: row.try_get("pooler_id")?,
        contract_id: row.try_get("contract_id")?,
        total_rewards: row.try_get::<i64, _>("total_rewards")? as Stroops,
        farmer_share: row.try_get::<i64, _>("farmer_share")? as Stroops,
        pooler_share: row.try_get::<i64, _>("pooler_share")? as Stroops,
        platform_fee: row.try_get::<i64, _>("platform_fee")? as Stroops,
        reward_split_bps: row.try_get::<i32, _>("reward_split_bps")? as u32,
        platform_fee_bps: row.try_get::<i32, _>("platform_fee_bps")? as u32,
        farmer_external_wallet: row.try_get("farmer_external_wallet")?,
        farmer_custodial_wallet: row.try_get("farmer_custodial_wallet")?,
        pooler_wallet: row.try_get("pooler_wallet")?,
        platform_wallet: row.try_get("platform_wallet")?,
        farmer_tx_hash: row.try_get("farmer_tx_hash")?,
        pooler_tx_hash: row.try_get("pooler_tx_hash")?,
        platform_tx_hash: row.try_get("platform_tx_hash")?,
        status: parse_enum(row.try_get::<String, _>("status")?.as_str(), "exit status")?,
        retry_count: row.try_get::<i32, _>("retry_count")? as u32,
        blocks_included: row.try_get::<i32, _>("blocks_included")? as u32,
        harvests_included: row.try_get::<i32, _>("harvests_included")? as u32,
        initiated_at: row.try_get("initiated_at")?,
        completed_at: row.try_get("completed_at")?,
        exit_reason: row.try_get("exit_reason")?,
    })
}

fn map_audit(row: &PgRow) -> Result<ExitAuditLog, StoreError> {
    let old_status: Option<String> = row.try_get("old_status")?;
    let new_status: Option<String> = row.try_get("new_status")?;
    Ok(ExitAuditLog {
        id: row.try_get("id")?,
        exit_split_id: row.try_get("exit_split_id")?,
        action: row.try_get("action")?,
        old_status: old_status
            .map(|s| parse_enum(&s, "audit old status"))
            .transpose()?,
        new_status: new_status
            .map(|s| parse_enum(&s, "audit new status"))
            .transpose()?,
        details: row.try_get("details")?,
        performed_by: row.try_get("performed_by")?,
        performed_at: row.try_get("performed_at")?,
    })
}

#[async_trait]
impl PoolStore for PgStore {
    async fn farmer_by_id(&self, id: Uuid) -> Result<Option<Farmer>, StoreError> {
        let row = sqlx::query("SELECT * FROM farmers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_farmer).transpose()
    }

    async fn eligible_farmers(&self, pooler_id: Uuid) -> Result<Vec<EligibleFarmer>, StoreError> {
        let rows = sqlx::query(
            "SELECT f.*, \
                    c.id AS c_id, c.farmer_id AS c_farmer_id, c.pooler_id AS c_pooler_id, \
                    c.stake_bps AS c_stake_bps, c.harvest_interval AS c_harvest_interval, \
                    c.reward_split_bps AS c_reward_split_bps, c.platform_fee_bps AS c_platform_fee_bps, \
                    c.status AS c_status, c.created_at AS c_created_at, c.confirmed_at AS c_confirmed_at, \
                    c.exit_requested_at AS c_exit_requested_at, c.contract_terms AS c_contract_terms \
             FROM farmers f \
             JOIN pool_contracts c ON c.farmer_id = f.id AND c.status = 'active' \
             WHERE f.status = 'active_in_pool' AND f.is_funded AND c.pooler_id = $1 \
             ORDER BY f.id",
        )
        .bind(pooler_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(EligibleFarmer {
                    farmer: map_farmer(row)?,
                    contract: PoolContract {
                        id: row.try_get("c_id")?,
                        farmer_id: row.try_get("c_farmer_id")?,
                        pooler_id: row.try_get("c_pooler_id")?,
                        stake_bps: row.try_get::<i32, _>("c_stake_bps")? as u32,
                        harvest_interval: row.try_get::<i32, _>("c_harvest_interval")? as u32,
                        reward_split_bps: row.try_get::<i32, _>("c_reward_split_bps")? as u32,
                        platform_fee_bps: row.try_get::<i32, _>("c_platform_fee_bps")? as u32,
                        status: parse_enum(
                            row.try_get::<String, _>("c_status")?.as_str(),
                            "contract status",
                        )?,
                        created_at: row.try_get("c_created_at")?,
                        confirmed_at: row.try_get("c_confirmed_at")?,
                        exit_requested_at: row.try_get("c_exit_requested_at")?,
                        contract_terms: row.try_get("c_contract_terms")?,
                    },
                })
            })
            .collect()
    }

    async fn update_farmer_balance(
        &self,
        id: Uuid,
        balance: Stroops,
        is_funded: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE farmers SET current_balance = $2, is_funded = $3, \
                    needs_funding_check = FALSE, \
                    funded_at = CASE WHEN $3 AND funded_at IS NULL THEN now() ELSE funded_at END \
             WHERE id = $1",
        )
        .bind(id)
        .bind(balance as i64)
        .bind(is_funded)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn add_farmer_reward(&self, id: Uuid, reward: Stroops) -> Result<(), StoreError> {
        sqlx::query("UPDATE farmers SET current_balance = current_balance + $2 WHERE id = $1")
            .bind(id)
            .bind(reward as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_farmer_status(&self, id: Uuid, status: FarmerStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE farmers SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn flag_funding_recheck(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE farmers SET needs_funding_check = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn farmers_for_funding_check(&self) -> Result<Vec<Farmer>, StoreError> {
        let rows = sqlx::query("SELECT * FROM farmers WHERE needs_funding_check ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_farmer).collect()
    }

    async fn pooler_by_id(&self, id: Uuid) -> Result<Option<Pooler>, StoreError> {
        let row = sqlx::query("SELECT * FROM poolers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_pooler).transpose()
    }

    async fn live_contract_for_farmer(
        &self,
        farmer_id: Uuid,
    ) -> Result<Option<PoolContract>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM pool_contracts \
             WHERE farmer_id = $1 AND status IN ('pending', 'active', 'exiting')",
        )
        .bind(farmer_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_contract).transpose()
    }

    async fn set_contract_status(
        &self,
        id: Uuid,
        status: ContractStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE pool_contracts SET status = $2, \
                    exit_requested_at = CASE WHEN $2 = 'exiting' THEN now() ELSE exit_requested_at END \
             WHERE id = $1",
        )
        .bind(id)
        .bind(status.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_block_operation(
        &self,
        new: &NewBlockOperation,
    ) -> Result<(BlockOperation, bool), StoreError> {
        // xmax = 0 only holds for a freshly inserted tuple
        let row = sqlx::query(
            "INSERT INTO block_operations \
                (id, block_index, pooler_id, entropy, block_age_secs, plantable, \
                 min_zeros, max_zeros, min_stake, max_stake) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (block_index) DO UPDATE SET \
                entropy = EXCLUDED.entropy, \
                block_age_secs = EXCLUDED.block_age_secs, \
                plantable = EXCLUDED.plantable, \
                min_zeros = EXCLUDED.min_zeros, \
                max_zeros = EXCLUDED.max_zeros, \
                min_stake = EXCLUDED.min_stake, \
                max_stake = EXCLUDED.max_stake \
             RETURNING *, (xmax = 0) AS inserted",
        )
        .bind(Uuid::new_v4())
        .bind(new.block_index as i64)
        .bind(new.pooler_id)
        .bind(&new.entropy)
        .bind(new.block_age_secs as i64)
        .bind(new.plantable)
        .bind(new.min_zeros as i32)
        .bind(new.max_zeros as i32)
        .bind(new.min_stake as i64)
        .bind(new.max_stake as i64)
        .fetch_one(&self.pool)
        .await?;

        let inserted: bool = row.try_get("inserted")?;
        Ok((map_block(&row)?, inserted))
    }

    async fn block_operation_by_index(
        &self,
        block_index: BlockIndex,
    ) -> Result<Option<BlockOperation>, StoreError> {
        let row = sqlx::query("SELECT * FROM block_operations WHERE block_index = $1")
            .bind(block_index as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_block).transpose()
    }

    async fn mark_plant_requested(&self, block_index: BlockIndex) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE block_operations SET plant_requested_at = now() \
             WHERE block_index = $1 AND plant_requested_at IS NULL",
        )
        .bind(block_index as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_block_empty(&self, block_index: BlockIndex) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE block_operations SET status = 'completed', total_farmers = 0 \
             WHERE block_index = $1 AND status = 'discovered'",
        )
        .bind(block_index as i64)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            warn!("block {block_index} not in discovered state, empty completion skipped");
        }
        Ok(())
    }

    async fn fail_block(&self, block_index: BlockIndex, reason: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE block_operations SET status = 'failed', failure_reason = $2 \
             WHERE block_index = $1 AND status NOT IN ('completed', 'failed')",
        )
        .bind(block_index as i64)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_plant_summary(
        &self,
        block_index: BlockIndex,
        total_farmers: u32,
        successful_plants: u32,
        total_staked: Stroops,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE block_operations SET \
                status = 'planting_completed', \
                total_farmers = $2, successful_plants = $3, total_staked = $4, \
                plant_completed_at = now() \
             WHERE block_index = $1 AND status = 'discovered'",
        )
        .bind(block_index as i64)
        .bind(total_farmers as i32)
        .bind(successful_plants as i32)
        .bind(total_staked as i64)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            warn!("block {block_index} already past discovery, plant summary skipped");
        }
        Ok(())
    }

    async fn record_work_summary(
        &self,
        block_index: BlockIndex,
        successful_works: u32,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE block_operations SET \
                status = 'work_completed', successful_works = $2, work_completed_at = now() \
             WHERE block_index = $1 AND status = 'planting_completed'",
        )
        .bind(block_index as i64)
        .bind(successful_works as i32)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            warn!("block {block_index} not awaiting work, work summary skipped");
        }
        Ok(())
    }

    async fn record_harvest_summary(
        &self,
        block_index: BlockIndex,
        successful_harvests: u32,
        total_rewards: Stroops,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE block_operations SET \
                status = 'completed', \
                successful_harvests = successful_harvests + $2, \
                total_rewards = total_rewards + $3 \
             WHERE block_index = $1 AND status = 'work_completed'",
        )
        .bind(block_index as i64)
        .bind(successful_harvests as i32)
        .bind(total_rewards as i64)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            warn!("block {block_index} not awaiting harvest, harvest summary skipped");
        }
        Ok(())
    }

    async fn record_planting(&self, planting: &Planting) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO plantings \
                (id, block_index, farmer_id, pooler_id, custodial_wallet, stake_amount, \
                 transaction_hash, status, error_message, planted_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (block_index, farmer_id) DO NOTHING",
        )
        .bind(planting.id)
        .bind(planting.block_index as i64)
        .bind(planting.farmer_id)
        .bind(planting.pooler_id)
        .bind(&planting.custodial_wallet)
        .bind(planting.stake_amount as i64)
        .bind(&planting.transaction_hash)
        .bind(planting.status.to_string())
        .bind(&planting.error_message)
        .bind(planting.planted_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn successful_planting(
        &self,
        block_index: BlockIndex,
        farmer_id: Uuid,
    ) -> Result<Option<Planting>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM plantings \
             WHERE block_index = $1 AND farmer_id = $2 AND status = 'success'",
        )
        .bind(block_index as i64)
        .bind(farmer_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_planting).transpose()
    }

    async fn plantings_for_block(
        &self,
        block_index: BlockIndex,
    ) -> Result<Vec<Planting>, StoreError> {
        let rows = sqlx::query("SELECT * FROM plantings WHERE block_index = $1 ORDER BY farmer_id")
            .bind(block_index as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_planting).collect()
    }

    async fn record_work(&self, work: &Work) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO works \
                (id, block_index, farmer_id, nonce, hash, zeros, gap, transaction_hash, \
                 status, error_message, compensation_required, worked_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (block_index, farmer_id) DO NOTHING",
        )
        .bind(work.id)
        .bind(work.block_index as i64)
        .bind(work.farmer_id)
        .bind(work.nonce as i64)
        .bind(&work.hash)
        .bind(work.zeros as i32)
        .bind(work.gap as i32)
        .bind(&work.transaction_hash)
        .bind(work.status.to_string())
        .bind(&work.error_message)
        .bind(work.compensation_required)
        .bind(work.worked_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn works_for_block(&self, block_index: BlockIndex) -> Result<Vec<Work>, StoreError> {
        let rows = sqlx::query("SELECT * FROM works WHERE block_index = $1 ORDER BY farmer_id")
            .bind(block_index as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_work).collect()
    }

    async fn unharvested_work_blocks(
        &self,
        farmer_id: Uuid,
        up_to: BlockIndex,
    ) -> Result<Vec<BlockIndex>, StoreError> {
        let rows = sqlx::query(
            "SELECT w.block_index FROM works w \
             WHERE w.farmer_id = $1 AND w.status = 'success' AND w.block_index <= $2 \
               AND NOT EXISTS (SELECT 1 FROM harvests h \
                               WHERE h.farmer_id = w.farmer_id \
                                 AND h.block_index = w.block_index \
                                 AND h.status = 'success') \
             ORDER BY w.block_index",
        )
        .bind(farmer_id)
        .bind(up_to as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Ok(row.try_get::<i64, _>("block_index")? as BlockIndex))
            .collect()
    }

    async fn record_harvest(&self, harvest: &Harvest) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO harvests \
                (id, block_index, farmer_id, reward_amount, transaction_hash, status, \
                 error_message, included_in_exit, exit_split_id, harvested_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (block_index, farmer_id) DO NOTHING",
        )
        .bind(harvest.id)
        .bind(harvest.block_index as i64)
        .bind(harvest.farmer_id)
        .bind(harvest.reward_amount as i64)
        .bind(&harvest.transaction_hash)
        .bind(harvest.status.to_string())
        .bind(&harvest.error_message)
        .bind(harvest.included_in_exit)
        .bind(harvest.exit_split_id)
        .bind(harvest.harvested_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn last_harvest_index(&self, farmer_id: Uuid) -> Result<Option<BlockIndex>, StoreError> {
        let row = sqlx::query(
            "SELECT max(block_index) AS last FROM harvests \
             WHERE farmer_id = $1 AND status = 'success'",
        )
        .bind(farmer_id)
        .fetch_one(&self.pool)
        .await?;
        let last: Option<i64> = row.try_get("last")?;
        Ok(last.map(|v| v as BlockIndex))
    }

    async fn unexited_harvests(&self, farmer_id: Uuid) -> Result<Vec<Harvest>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM harvests \
             WHERE farmer_id = $1 AND status = 'success' AND included_in_exit = FALSE \
             ORDER BY block_index",
        )
        .bind(farmer_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_harvest).collect()
    }

    async fn processing_exit_for_farmer(
        &self,
        farmer_id: Uuid,
    ) -> Result<Option<ExitSplit>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM exit_splits WHERE farmer_id = $1 AND status = 'processing'",
        )
        .bind(farmer_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_exit).transpose()
    }

    async fn create_exit_split(
        &self,
        split: &ExitSplit,
        harvest_ids: &[Uuid],
        audit: &ExitAuditLog,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO exit_splits \
                (id, farmer_id, pooler_id, contract_id, total_rewards, farmer_share, \
                 pooler_share, platform_fee, reward_split_bps, platform_fee_bps, \
                 farmer_external_wallet, farmer_custodial_wallet, pooler_wallet, platform_wallet, \
                 status, retry_count, blocks_included, harvests_included, initiated_at, exit_reason) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, \
                     $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)",
        )
        .bind(split.id)
        .bind(split.farmer_id)
        .bind(split.pooler_id)
        .bind(split.contract_id)
        .bind(split.total_rewards as i64)
        .bind(split.farmer_share as i64)
        .bind(split.pooler_share as i64)
        .bind(split.platform_fee as i64)
        .bind(split.reward_split_bps as i32)
        .bind(split.platform_fee_bps as i32)
        .bind(&split.farmer_external_wallet)
        .bind(&split.farmer_custodial_wallet)
        .bind(&split.pooler_wallet)
        .bind(&split.platform_wallet)
        .bind(split.status.to_string())
        .bind(split.retry_count as i32)
        .bind(split.blocks_included as i32)
        .bind(split.harvests_included as i32)
        .bind(split.initiated_at)
        .bind(&split.exit_reason)
        .execute(&mut *tx)
        .await?;

        let marked = sqlx::query(
            "UPDATE harvests SET included_in_exit = TRUE, exit_split_id = $1 \
             WHERE id = ANY($2) AND included_in_exit = FALSE",
        )
        .bind(split.id)
        .bind(harvest_ids)
        .execute(&mut *tx)
        .await?;
        if marked.rows_affected() != harvest_ids.len() as u64 {
            // another exit raced us to one of these harvests
            return Err(StoreError::Conflict(format!(
                "only {} of {} harvests could be marked for exit {}",
                marked.rows_affected(),
                harvest_ids.len(),
                split.id
            )));
        }

        sqlx::query(
            "UPDATE pool_contracts SET status = 'exiting', exit_requested_at = now() WHERE id = $1",
        )
        .bind(split.contract_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE farmers SET status = 'exiting' WHERE id = $1")
            .bind(split.farmer_id)
            .execute(&mut *tx)
            .await?;

        insert_audit(&mut tx, audit).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn claim_pending_exits(
        &self,
        limit: usize,
        lease_secs: u64,
    ) -> Result<Vec<ExitSplit>, StoreError> {
        let rows = sqlx::query(
            "UPDATE exit_splits SET claimed_at = now() \
             WHERE id IN (SELECT id FROM exit_splits \
                          WHERE status = 'processing' \
                            AND (claimed_at IS NULL \
                                 OR claimed_at < now() - make_interval(secs => $2)) \
                          ORDER BY initiated_at \
                          LIMIT $1 \
                          FOR UPDATE SKIP LOCKED) \
             RETURNING *",
        )
        .bind(limit as i64)
        .bind(lease_secs as f64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_exit).collect()
    }

    async fn update_exit_leg(
        &self,
        id: Uuid,
        leg: PayoutLeg,
        tx_hash: &str,
    ) -> Result<(), StoreError> {
        let column = match leg {
            PayoutLeg::Farmer => "farmer_tx_hash",
            PayoutLeg::Pooler => "pooler_tx_hash",
            PayoutLeg::Platform => "platform_tx_hash",
        };
        let query = format!("UPDATE exit_splits SET {column} = $2 WHERE id = $1 AND {column} IS NULL");
        sqlx::query(&query)
            .bind(id)
            .bind(tx_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn bump_exit_retry(&self, id: Uuid) -> Result<u32, StoreError> {
        let row = sqlx::query(
            "UPDATE exit_splits SET retry_count = retry_count + 1 WHERE id = $1 \
             RETURNING retry_count",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i32, _>("retry_count")? as u32)
    }

    async fn complete_exit(
        &self,
        split: &ExitSplit,
        audit: &ExitAuditLog,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE exit_splits SET status = 'completed', completed_at = now() \
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(split.id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "exit {} is not processing",
                split.id
            )));
        }

        sqlx::query("UPDATE pool_contracts SET status = 'completed' WHERE id = $1")
            .bind(split.contract_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE farmers SET status = 'exited' WHERE id = $1")
            .bind(split.farmer_id)
            .execute(&mut *tx)
            .await?;

        insert_audit(&mut tx, audit).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn fail_exit(
        &self,
        id: Uuid,
        details: &str,
        audit: &ExitAuditLog,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE exit_splits SET status = 'failed', failure_details = $2 \
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .bind(details)
        .execute(&mut *tx)
        .await?;

        insert_audit(&mut tx, audit).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn append_audit(&self, entry: &ExitAuditLog) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        insert_audit(&mut tx, entry).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn audit_for_exit(&self, exit_split_id: Uuid) -> Result<Vec<ExitAuditLog>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM exit_audit_log WHERE exit_split_id = $1 ORDER BY performed_at, id",
        )
        .bind(exit_split_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_audit).collect()
    }
}

async fn insert_audit(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    entry: &ExitAuditLog,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO exit_audit_log \
            (id, exit_split_id, action, old_status, new_status, details, performed_by, performed_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(entry.id)
    .bind(entry.exit_split_id)
    .bind(&entry.action)
    .bind(entry.old_status.map(|s| s.to_string()))
    .bind(entry.new_status.map(|s| s.to_string()))
    .bind(&entry.details)
    .bind(&entry.performed_by)
    .bind(entry.performed_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
