// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::{iter, mem};

use fvm_ipld_encoding::tuple::*;
use fvm_shared::clock::{ChainEpoch, QuantSpec};
use fvm_shared::econ::TokenAmount;
use itertools::{EitherOrBoth, Itertools};
use num_traits::Zero;

use fil_actors_runtime::runtime::VestSpec;

// Represents miner funds that will vest at the given epoch.
#[derive(Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple, Clone)]
pub struct VestingFund {
    pub epoch: ChainEpoch,
    pub amount: TokenAmount,
}

/// Represents the vesting table state for the miner.
/// It is a slice of (VestingEpoch, VestingAmount).
/// The slice will always be sorted by the VestingEpoch.
#[derive(Serialize_tuple, Deserialize_tuple, Default, Debug, Clone)]
pub struct VestingFunds {
    pub funds: Vec<VestingFund>,
}

impl VestingFunds {
    pub fn new() -> Self {
        Default::default()
    }

    /// Removes and sums every entry that vested strictly before the current epoch.
    pub fn unlock_vested_funds(&mut self, current_epoch: ChainEpoch) -> TokenAmount {
        let i = self
            .funds
            .iter()
            .position(|fund| fund.epoch >= current_epoch)
            .unwrap_or(self.funds.len());
        self.funds.drain(..i).map(|f| f.amount).sum()
    }

    /// Adds a linear vesting schedule for `vesting_sum` to the table, quantized to
    /// `spec.quantization` aligned with the proving period start. Entries landing on an
    /// existing epoch are merged into it.
    pub fn add_locked_funds(
        &mut self,
        current_epoch: ChainEpoch,
        vesting_sum: &TokenAmount,
        proving_period_start: ChainEpoch,
        spec: &VestSpec,
    ) {
        // Nothing unlocks at the start, this is just the start of the clock.
        let vest_begin = current_epoch + spec.initial_delay;
        let quant = QuantSpec { unit: spec.quantization, offset: proving_period_start };

        let mut vested_so_far = TokenAmount::zero();
        let mut epoch = vest_begin;

        let new_funds = iter::from_fn(|| {
            if vested_so_far >= *vesting_sum {
                return None;
            }

            epoch += spec.step_duration;

            let vest_epoch = quant.quantize_up(epoch);

            let elapsed = vest_epoch - vest_begin;
            let target_vest = if elapsed < spec.vest_period {
                // Linear vesting
                (vesting_sum * elapsed).div_floor(spec.vest_period)
            } else {
                vesting_sum.clone()
            };

            let vest_this_time = &target_vest - &vested_so_far;
            vested_so_far = target_vest;

            Some(VestingFund { epoch: vest_epoch, amount: vest_this_time })
        })
        // Consecutive steps may quantize to the same epoch.
        .coalesce(|a, b| {
            if a.epoch == b.epoch {
                Ok(VestingFund { epoch: a.epoch, amount: a.amount + b.amount })
            } else {
                Err((a, b))
            }
        });

        let old_funds = mem::take(&mut self.funds);

        self.funds = old_funds
            .into_iter()
            .merge_join_by(new_funds, |a, b| a.epoch.cmp(&b.epoch))
            .map(|item| match item {
                EitherOrBoth::Left(a) => a,
                EitherOrBoth::Right(b) => b,
                EitherOrBoth::Both(a, b) => {
                    VestingFund { epoch: a.epoch, amount: a.amount + b.amount }
                }
            })
            .filter(|fund| !fund.amount.is_zero())
            .collect();
    }

    /// Unlocks unvested funds so that the sum of the unlocked funds is as close as possible
    /// to the target, without exceeding it. Only entries at or after the current epoch are
    /// drawn from, earliest first. Returns the amount unlocked.
    pub fn unlock_unvested_funds(
        &mut self,
        current_epoch: ChainEpoch,
        target: &TokenAmount,
    ) -> TokenAmount {
        let mut amount_unlocked = TokenAmount::zero();
        let mut last_index_to_remove: Option<usize> = None;
        let mut start_index_for_remove = 0;

        for (i, vf) in self.funds.iter_mut().enumerate() {
            if &amount_unlocked >= target {
                break;
            }

            if vf.epoch >= current_epoch {
                let unlock_amount = std::cmp::min(target - &amount_unlocked, vf.amount.clone());
                amount_unlocked += &unlock_amount;
                let new_amount = &vf.amount - &unlock_amount;

                if new_amount.is_zero() {
                    last_index_to_remove = Some(i);
                } else {
                    vf.amount = new_amount;
                }
            } else {
                start_index_for_remove = i + 1;
            }
        }

        // Entries fully drawn down are contiguous, starting at the first unvested entry.
        if let Some(last) = last_index_to_remove {
            self.funds.drain(start_index_for_remove..=last);
        }

        amount_unlocked
    }

    /// Sum of every entry still in the table.
    pub fn total(&self) -> TokenAmount {
        self.funds.iter().map(|f| &f.amount).sum()
    }
}
