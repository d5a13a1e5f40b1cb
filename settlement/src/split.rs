use thiserror::Error;

use kale_common::config::BPS_SCALE;
use kale_common::model::Stroops;

// The three-way reward split. Everything is integer arithmetic in basis
// points; shares are floored and the remainders flow to the next layer
// (fee remainder into net, farmer remainder into the pooler share), so
// the components always reconstruct the exact total.

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SplitError {
    #[error("rate {0} exceeds {BPS_SCALE} basis points")]
    RateOutOfRange(u32),

    #[error("split components sum to {sum}, expected {total}")]
    Imbalance { sum: Stroops, total: Stroops },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitOutcome {
    pub total: Stroops,
    pub platform_fee: Stroops,
    pub farmer_share: Stroops,
    pub pooler_share: Stroops,
}

pub fn split_rewards(
    total: Stroops,
    platform_fee_bps: u32,
    reward_split_bps: u32,
) -> Result<SplitOutcome, SplitError> {
    if platform_fee_bps > BPS_SCALE {
        return Err(SplitError::RateOutOfRange(platform_fee_bps));
    }
    if reward_split_bps > BPS_SCALE {
        return Err(SplitError::RateOutOfRange(reward_split_bps));
    }

    let platform_fee = mul_bps(total, platform_fee_bps);
    let net = total - platform_fee;
    let farmer_share = mul_bps(net, reward_split_bps);
    let pooler_share = net - farmer_share;

    let outcome = SplitOutcome {
        total,
        platform_fee,
        farmer_share,
        pooler_share,
    };

    // cheap to recheck, fatal to get wrong
    let sum = platform_fee + farmer_share + pooler_share;
    if sum != total {
        return Err(SplitError::Imbalance { sum, total });
    }
    Ok(outcome)
}

fn mul_bps(amount: Stroops, bps: u32) -> Stroops {
    ((amount as u128 * bps as u128) / BPS_SCALE as u128) as Stroops
}

// Configuration boundary only: contracts arriving with fractional rates
// are converted once and stay basis points from then on.
pub fn bps_from_ratio(ratio: f64) -> u32 {
    (ratio * BPS_SCALE as f64).round() as u32
}
