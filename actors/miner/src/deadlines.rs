// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use anyhow::anyhow;
use fil_actors_runtime::runtime::Policy;
use fil_actors_runtime::Array;
use fvm_ipld_blockstore::Blockstore;
use fvm_shared::clock::{ChainEpoch, QuantSpec};
use fvm_shared::sector::SectorNumber;

use super::{DeadlineInfo, Deadlines, Partition};

/// Returns deadline-related calculations for a deadline in some proving period and the current epoch.
pub fn new_deadline_info(
    policy: &Policy,
    proving_period_start: ChainEpoch,
    deadline_idx: u64,
    current_epoch: ChainEpoch,
) -> DeadlineInfo {
    DeadlineInfo::from_policy(policy, proving_period_start, deadline_idx, current_epoch)
}

/// Calculates the deadline at some epoch for a proving period and returns the deadline-related calculations.
/// Once the period has fully elapsed the index is the deadline count, a zero-width sentinel.
pub fn compute_proving_period_deadline(
    policy: &Policy,
    period_start: ChainEpoch,
    current_epoch: ChainEpoch,
) -> DeadlineInfo {
    let period_progress = current_epoch - period_start;
    if period_progress >= policy.wpost_proving_period {
        // Proving period has completely elapsed.
        return new_deadline_info(
            policy,
            period_start,
            policy.wpost_period_deadlines,
            current_epoch,
        );
    }

    let deadline_idx = if period_progress < 0 {
        // Period not yet started.
        0
    } else {
        (period_progress / policy.wpost_challenge_window) as u64
    };

    new_deadline_info(policy, period_start, deadline_idx, current_epoch)
}

/// Computes deadline information for a fault or recovery declaration.
/// If the deadline has not yet elapsed, the declaration is taken as being for the current proving period.
/// If the deadline has elapsed, it's instead taken as being for the next proving period after the current epoch.
pub fn declaration_deadline_info(
    policy: &Policy,
    period_start: ChainEpoch,
    deadline_idx: u64,
    current_epoch: ChainEpoch,
) -> anyhow::Result<DeadlineInfo> {
    if deadline_idx >= policy.wpost_period_deadlines {
        return Err(anyhow!(
            "invalid deadline {}, must be < {}",
            deadline_idx,
            policy.wpost_period_deadlines
        ));
    }

    Ok(new_deadline_info(policy, period_start, deadline_idx, current_epoch).next_not_elapsed())
}

/// Checks that a fault or recovery declaration at a specific deadline is outside the exclusion window for the deadline.
pub fn validate_fr_declaration_deadline(deadline: &DeadlineInfo) -> anyhow::Result<()> {
    if deadline.fault_cutoff_passed() {
        Err(anyhow!("late fault or recovery declaration at {:?}", deadline))
    } else {
        Ok(())
    }
}

/// Returns true if the deadline at the given index is currently mutable.
pub fn deadline_is_mutable(
    policy: &Policy,
    proving_period_start: ChainEpoch,
    deadline_idx: u64,
    current_epoch: ChainEpoch,
) -> bool {
    // Get the next non-elapsed deadline (i.e., the next time we care about
    // mutations to the deadline).
    let deadline_info =
        new_deadline_info(policy, proving_period_start, deadline_idx, current_epoch)
            .next_not_elapsed();

    // Ensure that the current epoch is at least one challenge window before
    // that deadline opens.
    current_epoch < deadline_info.open - policy.wpost_challenge_window
}

/// Quantization used for every queue belonging to a deadline: keys round up to the deadline's last epoch.
pub fn quant_spec_for_deadline(policy: &Policy, di: &DeadlineInfo) -> QuantSpec {
    QuantSpec { unit: policy.wpost_proving_period, offset: di.last() }
}

impl Deadlines {
    /// Returns the deadline and partition index for a sector number.
    /// Returns an error if the sector number is not tracked by `self`.
    pub fn find_sector<BS: Blockstore>(
        &self,
        policy: &Policy,
        store: &BS,
        sector_number: SectorNumber,
    ) -> anyhow::Result<(u64, u64)> {
        for i in 0..self.due.len() {
            let deadline_idx = i as u64;
            let deadline = self.load_deadline(policy, store, deadline_idx)?;
            let partitions = Array::<Partition, _>::load(&deadline.partitions, store)?;

            let mut partition_idx = None;

            partitions.for_each_while(|i, partition| {
                if partition.sectors.get(sector_number) {
                    partition_idx = Some(i);
                    Ok(false)
                } else {
                    Ok(true)
                }
            })?;

            if let Some(partition_idx) = partition_idx {
                return Ok((deadline_idx, partition_idx));
            }
        }

        Err(anyhow!("sector {} not due at any deadline", sector_number))
    }
}
