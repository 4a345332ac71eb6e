// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::cmp;

use fil_actors_runtime::network::EPOCHS_IN_DAY;
use fil_actors_runtime::reward::math::PRECISION;
use fil_actors_runtime::reward::{smooth, FilterEstimate};
use fil_actors_runtime::runtime::{Policy, Ratio};
use fvm_shared::bigint::{BigInt, Integer};
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::StoragePower;
use num_traits::Zero;

/// Length of a projection expressed as a ratio of days.
fn projection_period(factor: Ratio) -> ChainEpoch {
    EPOCHS_IN_DAY * factor.numerator as i64 / factor.denominator as i64
}

/// The projected block reward a sector would earn over some period.
/// Also known as "BR(t)".
/// BR(t) = ProjectedRewardFraction(t) * SectorQualityAdjustedPower
/// ProjectedRewardFraction(t) is the sum of estimated reward over estimated total power
/// over all epochs in the projection period [t t+projectionDuration]
pub fn expected_reward_for_power(
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    qa_sector_power: &StoragePower,
    projection_duration: ChainEpoch,
) -> TokenAmount {
    let network_qa_power_smoothed = network_qa_power_estimate.estimate();

    if network_qa_power_smoothed.is_zero() {
        return TokenAmount::from_atto(reward_estimate.estimate());
    }

    let expected_reward_for_proving_period = smooth::extrapolated_cum_sum_of_ratio(
        projection_duration,
        0,
        reward_estimate,
        network_qa_power_estimate,
    );
    let br128 = qa_sector_power * expected_reward_for_proving_period; // Q.0 * Q.128 => Q.128
    TokenAmount::from_atto(cmp::max(br128 >> PRECISION, BigInt::zero()))
}

/// The penalty for a sector being faulty for one more deadline, having been declared
/// ahead of time. Paid every proving period the sector stays faulty.
pub fn pledge_penalty_for_declared_fault(
    policy: &Policy,
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    qa_sector_power: &StoragePower,
) -> TokenAmount {
    expected_reward_for_power(
        reward_estimate,
        network_qa_power_estimate,
        qa_sector_power,
        projection_period(policy.declared_fault_factor),
    )
}

/// The penalty for a sector found faulty without prior declaration, either by a missed
/// deadline or a skip in a PoSt.
pub fn pledge_penalty_for_undeclared_fault(
    policy: &Policy,
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    qa_sector_power: &StoragePower,
) -> TokenAmount {
    expected_reward_for_power(
        reward_estimate,
        network_qa_power_estimate,
        qa_sector_power,
        projection_period(policy.undeclared_fault_factor),
    )
}

/// Penalty for terminating a sector before its scheduled expiration.
/// The greater of the undeclared fault penalty and the sector's storage pledge plus half
/// its age in expected day rewards, the age being capped at the termination lifetime cap.
#[allow(clippy::too_many_arguments)]
pub fn pledge_penalty_for_termination(
    policy: &Policy,
    day_reward_at_activation: &TokenAmount,
    twenty_day_reward_at_activation: &TokenAmount,
    sector_age: ChainEpoch,
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    qa_sector_power: &StoragePower,
) -> TokenAmount {
    let capped_sector_age =
        cmp::min(sector_age / 2, policy.termination_lifetime_cap * EPOCHS_IN_DAY);

    let age_reward = TokenAmount::from_atto(
        (day_reward_at_activation.atto() * BigInt::from(capped_sector_age))
            .div_floor(&BigInt::from(EPOCHS_IN_DAY)),
    );

    cmp::max(
        pledge_penalty_for_undeclared_fault(
            policy,
            reward_estimate,
            network_qa_power_estimate,
            qa_sector_power,
        ),
        twenty_day_reward_at_activation.clone() + age_reward,
    )
}

/// Computes the PreCommit deposit given sector qa weight and current network conditions.
/// PreCommit Deposit = BR(PreCommitDepositProjectionPeriod)
pub fn pre_commit_deposit_for_power(
    policy: &Policy,
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    qa_sector_power: &StoragePower,
) -> TokenAmount {
    expected_reward_for_power(
        reward_estimate,
        network_qa_power_estimate,
        qa_sector_power,
        policy.pre_commit_deposit_projection_period,
    )
}

/// Computes the pledge requirement for committing new quality-adjusted power to the network, given
/// the current network total and baseline power, per-epoch reward, and circulating token supply.
/// The pledge comprises two parts:
/// - storage pledge, aka IP base: a multiple of the reward expected to be earned by newly-committed power
/// - consensus pledge, aka additional IP: a pro-rata fraction of the circulating money supply
///
/// IP = IPBase(t) + AdditionalIP(t)
/// IPBase(t) = BR(t, InitialPledgeProjectionPeriod)
/// AdditionalIP(t) = LockTarget(t)*PledgeShare(t)
/// LockTarget = (LockTargetFactorNum / LockTargetFactorDenom) * FILCirculatingSupply(t)
/// PledgeShare(t) = sectorQAPower / max(BaselinePower(t), NetworkQAPower(t))
///
/// The result is capped at `initial_pledge_max_per_byte` times the sector's power.
pub fn initial_pledge_for_power(
    policy: &Policy,
    qa_power: &StoragePower,
    baseline_power: &StoragePower,
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    circulating_supply: &TokenAmount,
) -> TokenAmount {
    let ip_base = expected_reward_for_power(
        reward_estimate,
        network_qa_power_estimate,
        qa_power,
        policy.initial_pledge_projection_period,
    );

    let lock_target_num = circulating_supply.atto() * policy.initial_pledge_lock_target.numerator;
    let lock_target_denom = policy.initial_pledge_lock_target.denominator;
    let network_qa_power = network_qa_power_estimate.estimate();
    let pledge_share_denom = cmp::max(cmp::max(&network_qa_power, baseline_power), qa_power);

    let additional_ip_num = lock_target_num * qa_power;
    let additional_ip_denom = pledge_share_denom * lock_target_denom;
    let additional_ip = if additional_ip_denom.is_zero() {
        BigInt::zero()
    } else {
        additional_ip_num.div_floor(&additional_ip_denom)
    };

    let nominal_pledge = ip_base + TokenAmount::from_atto(additional_ip);
    let space_race_pledge_cap =
        TokenAmount::from_atto(BigInt::from(policy.initial_pledge_max_per_byte) * qa_power);

    cmp::min(nominal_pledge, space_race_pledge_cap)
}

/// Share of the offending miner's balance paid to the reporter of a consensus fault.
/// The share starts small and grows geometrically with the age of the fault, up to a maximum.
pub fn reward_for_consensus_slash_report(
    policy: &Policy,
    elapsed_epoch: ChainEpoch,
    collateral: &TokenAmount,
) -> TokenAmount {
    let elapsed = elapsed_epoch.max(0) as u32;
    let growth = policy.consensus_fault_reporter_share_growth_rate;
    let initial = policy.consensus_fault_reporter_initial_share;
    let max_share = policy.consensus_fault_reporter_max_share;

    let slasher_share_numerator = BigInt::from(growth.numerator).pow(elapsed);
    let slasher_share_denominator = BigInt::from(growth.denominator).pow(elapsed);

    let num = slasher_share_numerator * initial.numerator * collateral.atto();
    let denom = slasher_share_denominator * initial.denominator;

    let max_num = collateral.atto() * max_share.numerator;
    cmp::min(
        TokenAmount::from_atto(num.div_floor(&denom)),
        TokenAmount::from_atto(max_num.div_floor(&BigInt::from(max_share.denominator))),
    )
}
