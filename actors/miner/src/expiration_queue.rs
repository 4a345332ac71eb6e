// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, Context};
use cid::Cid;
use fil_actors_runtime::{ActorDowncast, Array};
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::tuple::*;
use fvm_shared::clock::{ChainEpoch, QuantSpec};
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::{SectorNumber, SectorSize};
use num_traits::{Signed, Zero};

use super::{power_for_sector, PowerPair, SectorOnChainInfo};

/// ExpirationSet is a collection of sector numbers that are expiring, either due to
/// expected "on-time" expiration at the end of their life, or unexpected "early" termination
/// due to being faulty for too long consecutively.
/// Note that there is not a direct correspondence between on-time sectors and active power;
/// a sector may be faulty but expiring on-time if it faults just prior to expected termination.
/// Early sectors are always faulty, and active power always represents on-time sectors.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, Default, PartialEq)]
pub struct ExpirationSet {
    /// Sectors expiring "on time" at the end of their committed life
    pub on_time_sectors: BitField,
    /// Sectors expiring "early" due to being faulty for too long
    pub early_sectors: BitField,
    /// Pledge total for the on-time sectors
    pub on_time_pledge: TokenAmount,
    /// Power that is currently active (not faulty)
    pub active_power: PowerPair,
    /// Power that is currently faulty
    pub faulty_power: PowerPair,
}

impl ExpirationSet {
    pub fn empty() -> Self {
        Default::default()
    }

    /// Adds sectors and power to the expiration set in place.
    pub fn add(
        &mut self,
        on_time_sectors: &BitField,
        early_sectors: &BitField,
        on_time_pledge: &TokenAmount,
        active_power: &PowerPair,
        faulty_power: &PowerPair,
    ) -> anyhow::Result<()> {
        self.on_time_sectors |= on_time_sectors;
        self.early_sectors |= early_sectors;
        self.on_time_pledge += on_time_pledge;
        self.active_power += active_power;
        self.faulty_power += faulty_power;

        self.validate_state()
    }

    /// Removes sectors and power from the expiration set in place.
    pub fn remove(
        &mut self,
        on_time_sectors: &BitField,
        early_sectors: &BitField,
        on_time_pledge: &TokenAmount,
        active_power: &PowerPair,
        faulty_power: &PowerPair,
    ) -> anyhow::Result<()> {
        // Check for sector intersection. This could be cheaper with a combined intersection/difference method used below.
        if !self.on_time_sectors.contains_all(on_time_sectors) {
            return Err(anyhow!(
                "removing on-time sectors {:?} not contained in {:?}",
                on_time_sectors,
                self.on_time_sectors
            ));
        }
        if !self.early_sectors.contains_all(early_sectors) {
            return Err(anyhow!(
                "removing early sectors {:?} not contained in {:?}",
                early_sectors,
                self.early_sectors
            ));
        }

        self.on_time_sectors -= on_time_sectors;
        self.early_sectors -= early_sectors;
        self.on_time_pledge -= on_time_pledge;
        self.active_power -= active_power;
        self.faulty_power -= faulty_power;

        self.validate_state()
    }

    /// A set is empty if it has no sectors.
    /// The power and pledge are not checked, but expected to be zero.
    pub fn is_empty(&self) -> bool {
        self.on_time_sectors.is_empty() && self.early_sectors.is_empty()
    }

    /// Counts all sectors in the expiration set.
    pub fn len(&self) -> u64 {
        self.on_time_sectors.len() + self.early_sectors.len()
    }

    /// Pledge and power never go negative; a negative value here means the queue and the
    /// sectors it was built from have diverged.
    pub fn validate_state(&self) -> anyhow::Result<()> {
        if self.on_time_pledge.is_negative() {
            return Err(anyhow!("expiration set left with negative pledge: {:?}", self));
        }
        if self.active_power.raw.is_negative() || self.active_power.qa.is_negative() {
            return Err(anyhow!("expiration set left with negative active power: {:?}", self));
        }
        if self.faulty_power.raw.is_negative() || self.faulty_power.qa.is_negative() {
            return Err(anyhow!("expiration set left with negative faulty power: {:?}", self));
        }
        Ok(())
    }
}

/// A queue of expiration sets by epoch, representing the on-time or early termination epoch for a collection of sectors.
/// Wraps an AMT[ChainEpoch]*ExpirationSet.
/// Keys in the queue are quantized (upwards), modulo some offset, to reduce the cardinality of keys.
pub struct ExpirationQueue<'db, BS> {
    pub amt: Array<'db, ExpirationSet, BS>,
    pub quant: QuantSpec,
}

impl<'db, BS: Blockstore> ExpirationQueue<'db, BS> {
    /// Loads a queue root.
    ///
    /// Epochs provided to subsequent method calls will be quantized upwards to quanta mod offsetSeed before being
    /// written to/read from queue entries.
    pub fn new(store: &'db BS, root: &Cid, quant: QuantSpec) -> anyhow::Result<Self> {
        let amt = Array::load(root, store)
            .map_err(|e| e.downcast_wrap(format!("failed to load expiration queue {}", root)))?;
        Ok(Self { amt, quant })
    }

    /// Adds a collection of sectors to their on-time target expiration entries (quantized).
    /// The sectors are assumed to be active (non-faulty).
    /// Returns the sector numbers, power, and pledge added.
    pub fn add_active_sectors<'a>(
        &mut self,
        sectors: impl IntoIterator<Item = &'a SectorOnChainInfo>,
        sector_size: SectorSize,
    ) -> anyhow::Result<(BitField, PowerPair, TokenAmount)> {
        let mut total_power = PowerPair::zero();
        let mut total_pledge = TokenAmount::zero();
        let mut total_sectors = Vec::<BitField>::new();

        for group in group_sectors_by_expiration(sector_size, sectors, self.quant) {
            let sector_numbers = BitField::try_from_bits(group.sectors.iter().copied())?;

            self.add(
                group.epoch,
                &sector_numbers,
                &BitField::new(),
                &group.power,
                &PowerPair::zero(),
                &group.pledge,
            )
            .context("failed to record new sector expirations")?;

            total_sectors.push(sector_numbers);
            total_power += &group.power;
            total_pledge += &group.pledge;
        }

        let sector_numbers = BitField::union(total_sectors.iter());
        Ok((sector_numbers, total_power, total_pledge))
    }

    /// Reschedules some sectors to a new (quantized) expiration epoch.
    /// The sectors being rescheduled are assumed to be not faulty, and hence are removed from and re-scheduled for on-time
    /// rather than early expiration.
    /// The sectors' power and pledge are assumed not to change, despite the new expiration.
    pub fn reschedule_expirations(
        &mut self,
        new_expiration: ChainEpoch,
        sectors: &[SectorOnChainInfo],
        sector_size: SectorSize,
    ) -> anyhow::Result<()> {
        if sectors.is_empty() {
            return Ok(());
        }

        let (sector_numbers, power, pledge) = self
            .remove_active_sectors(sectors, sector_size)
            .context("failed to remove sector expirations")?;

        self.add(
            new_expiration,
            &sector_numbers,
            &BitField::new(),
            &power,
            &PowerPair::zero(),
            &pledge,
        )
        .context("failed to record new sector expirations")?;

        Ok(())
    }

    /// Re-schedules sectors to expire at an early expiration epoch (quantized), if they wouldn't expire before then anyway.
    /// The sectors must not be currently faulty, so must be registered as expiring on-time rather than early.
    /// The pledge for the now-early sectors is removed from the queue.
    /// Returns the total power represented by the sectors.
    pub fn reschedule_as_faults(
        &mut self,
        new_expiration: ChainEpoch,
        sectors: &[SectorOnChainInfo],
        sector_size: SectorSize,
    ) -> anyhow::Result<PowerPair> {
        let mut sectors_total = Vec::<u64>::new();
        let mut expiring_power = PowerPair::zero();
        let mut rescheduled_power = PowerPair::zero();
        let fault_epoch = self.quant.quantize_up(new_expiration);

        // Group sectors by their target expiration, then remove from existing queue entries according to those groups.
        for group in group_sectors_by_expiration(sector_size, sectors, self.quant) {
            let mut expiration_set = self.must_get(group.epoch)?;

            if group.epoch <= fault_epoch {
                // Don't reschedule sectors that are already due to expire on-time before the fault-driven expiration,
                // but do represent their power as now faulty.
                // Their pledge remains as "on-time".
                expiration_set.active_power -= &group.power;
                expiration_set.faulty_power += &group.power;
                expiring_power += &group.power;
            } else {
                // Remove sectors from on-time expiry and active power.
                let sectors_bitfield = BitField::try_from_bits(group.sectors.iter().copied())?;
                expiration_set.on_time_sectors -= &sectors_bitfield;
                expiration_set.on_time_pledge -= &group.pledge;
                expiration_set.active_power -= &group.power;

                // Accumulate the sectors and power removed.
                sectors_total.extend_from_slice(&group.sectors);
                rescheduled_power += &group.power;
            }

            expiration_set.validate_state()?;
            self.must_update_or_delete(group.epoch, expiration_set)?;
        }

        if !sectors_total.is_empty() {
            // Add sectors to new expiration as early-terminating and faulty.
            sectors_total.sort_unstable();
            let early_sectors = BitField::try_from_bits(sectors_total)?;
            self.add(
                new_expiration,
                &BitField::new(),
                &early_sectors,
                &PowerPair::zero(),
                &rescheduled_power,
                &TokenAmount::zero(),
            )?;
        }

        Ok(&rescheduled_power + &expiring_power)
    }

    /// Re-schedules *all* sectors to expire at an early expiration epoch, if they wouldn't expire before then anyway.
    pub fn reschedule_all_as_faults(&mut self, fault_expiration: ChainEpoch) -> anyhow::Result<()> {
        let mut rescheduled_epochs = Vec::<u64>::new();
        let mut rescheduled_sectors = BitField::new();
        let mut rescheduled_power = PowerPair::zero();
        let mut updated = Vec::<(u64, ExpirationSet)>::new();
        let fault_epoch = self.quant.quantize_up(fault_expiration);

        self.amt.for_each(|e, expiration_set| {
            let epoch = e as ChainEpoch;
            if epoch <= fault_epoch {
                // Regardless of whether the sectors were expiring on-time or early, all the power is now faulty.
                // Pledge is still on-time.
                let mut expiration_set = expiration_set.clone();
                expiration_set.faulty_power += &expiration_set.active_power;
                expiration_set.active_power = PowerPair::zero();
                updated.push((e, expiration_set));
            } else {
                rescheduled_epochs.push(e);
                rescheduled_sectors |= &expiration_set.on_time_sectors;
                rescheduled_sectors |= &expiration_set.early_sectors;
                rescheduled_power += &expiration_set.active_power;
                rescheduled_power += &expiration_set.faulty_power;
            }
            Ok(())
        })?;

        for (key, expiration_set) in updated {
            self.amt.set(key, expiration_set)?;
        }

        // If we didn't reschedule anything, we're done.
        if rescheduled_epochs.is_empty() {
            return Ok(());
        }

        // Add rescheduled sectors to new expiration as early-terminating and faulty.
        self.add(
            fault_expiration,
            &BitField::new(),
            &rescheduled_sectors,
            &PowerPair::zero(),
            &rescheduled_power,
            &TokenAmount::zero(),
        )?;

        // Trim the rescheduled epochs from the queue.
        self.amt.batch_delete(rescheduled_epochs, true)?;

        Ok(())
    }

    /// Removes sectors from any queue entries in which they appear that are earlier then their scheduled expiration epoch,
    /// and schedules them at their expected termination epoch.
    /// Pledge for the sectors is re-added as on-time.
    /// Power for the sectors is changed from faulty to active (whether rescheduled or not).
    /// Returns the newly-recovered power. Fails if any sectors are not found in the queue.
    pub fn reschedule_recovered(
        &mut self,
        sectors: Vec<SectorOnChainInfo>,
        sector_size: SectorSize,
    ) -> anyhow::Result<PowerPair> {
        let mut remaining: BTreeSet<SectorNumber> =
            sectors.iter().map(|sector| sector.sector_number).collect();

        // Traverse the expiration queue once to find each recovering sector and remove it from early/faulty there.
        // We expect this to find all recovering sectors within the first FaultMaxAge/WPoStProvingPeriod entries
        // (i.e. 14 for 14-day faults), but if something has gone wrong it's safer not to fail if that's not met.
        let mut sectors_rescheduled = Vec::<&SectorOnChainInfo>::new();
        let mut recovered_power = PowerPair::zero();

        self.traverse_mutate(|_epoch, expiration_set| {
            let mut changed = false;
            for sector in &sectors {
                let sector_number = sector.sector_number;
                let power = power_for_sector(sector_size, sector);
                let found = if expiration_set.on_time_sectors.get(sector_number) {
                    // If the sector expires on-time at this epoch, leave it here but change faulty power to active.
                    // The pledge is already part of the on-time pledge at this entry.
                    expiration_set.faulty_power -= &power;
                    expiration_set.active_power += &power;
                    true
                } else if expiration_set.early_sectors.get(sector_number) {
                    // If the sector expires early at this epoch, remove it for re-scheduling.
                    // It's not part of the on-time pledge number here.
                    expiration_set.early_sectors.unset(sector_number);
                    expiration_set.faulty_power -= &power;
                    sectors_rescheduled.push(sector);
                    true
                } else {
                    false
                };

                if found {
                    recovered_power += &power;
                    remaining.remove(&sector_number);
                    changed = true;
                }
            }

            expiration_set.validate_state()?;
            Ok((changed, !remaining.is_empty()))
        })?;

        if !remaining.is_empty() {
            return Err(anyhow!("sectors not found in expiration queue: {:?}", remaining));
        }

        // Re-schedule the removed sectors to their target expiration.
        self.add_active_sectors(sectors_rescheduled, sector_size)?;

        Ok(recovered_power)
    }

    /// Removes some sectors and adds some others.
    /// The sectors being replaced must not be faulty, so must be scheduled for on-time rather than early expiration.
    /// The sectors added are assumed to be not faulty.
    /// Returns the old a new sector number bitfields, and delta to power and pledge, new minus old.
    pub fn replace_sectors(
        &mut self,
        old_sectors: &[SectorOnChainInfo],
        new_sectors: &[SectorOnChainInfo],
        sector_size: SectorSize,
    ) -> anyhow::Result<(BitField, BitField, PowerPair, TokenAmount)> {
        let (old_sector_numbers, old_power, old_pledge) = self
            .remove_active_sectors(old_sectors, sector_size)
            .context("failed to remove replaced sectors")?;

        let (new_sector_numbers, new_power, new_pledge) = self
            .add_active_sectors(new_sectors, sector_size)
            .context("failed to add replacement sectors")?;

        Ok((
            old_sector_numbers,
            new_sector_numbers,
            &new_power - &old_power,
            new_pledge - old_pledge,
        ))
    }

    /// Remove some sectors from the queue.
    /// The sectors may be active or faulty, and scheduled either for on-time or early termination.
    /// Returns the aggregate of removed sectors and power, and recovering power.
    /// Fails if any sectors are not found in the queue.
    pub fn remove_sectors(
        &mut self,
        sectors: &[SectorOnChainInfo],
        faults: &BitField,
        recovering: &BitField,
        sector_size: SectorSize,
    ) -> anyhow::Result<(ExpirationSet, PowerPair)> {
        let mut remaining: BTreeSet<SectorNumber> =
            sectors.iter().map(|sector| sector.sector_number).collect();

        let mut removed = ExpirationSet::empty();
        let mut recovering_power = PowerPair::zero();

        // Split into faulty and non-faulty. We process non-faulty sectors first
        // because they always expire on-time so we know where to find them.
        let mut non_faulty_sectors = Vec::<SectorOnChainInfo>::new();
        let mut faulty_sectors = Vec::<&SectorOnChainInfo>::new();

        for sector in sectors {
            if faults.get(sector.sector_number) {
                faulty_sectors.push(sector);
                continue;
            }
            non_faulty_sectors.push(sector.clone());
            // remove them from "remaining", we're going to process them below.
            remaining.remove(&sector.sector_number);
        }

        // Remove non-faulty sectors.
        let (removed_sector_numbers, removed_power, removed_pledge) = self
            .remove_active_sectors(&non_faulty_sectors, sector_size)
            .context("failed to remove on-time recoveries")?;
        removed.on_time_sectors = removed_sector_numbers;
        removed.active_power = removed_power;
        removed.on_time_pledge = removed_pledge;

        // Finally, remove faulty sectors (on time and not). These sectors can
        // only appear within the first 14 days (fault max age). Given that this
        // queue is quantized, we should be able to stop traversing the queue
        // after 14 entries.
        self.traverse_mutate(|_epoch, expiration_set| {
            let mut changed = false;
            for sector in &faulty_sectors {
                let sector_number = sector.sector_number;
                let mut found = false;

                if expiration_set.on_time_sectors.get(sector_number) {
                    found = true;
                    expiration_set.on_time_sectors.unset(sector_number);
                    removed.on_time_sectors.set(sector_number);
                    expiration_set.on_time_pledge -= &sector.initial_pledge;
                    removed.on_time_pledge += &sector.initial_pledge;
                } else if expiration_set.early_sectors.get(sector_number) {
                    found = true;
                    expiration_set.early_sectors.unset(sector_number);
                    removed.early_sectors.set(sector_number);
                }

                if found {
                    let power = power_for_sector(sector_size, sector);
                    if faults.get(sector_number) {
                        expiration_set.faulty_power -= &power;
                        removed.faulty_power += &power;
                    } else {
                        expiration_set.active_power -= &power;
                        removed.active_power += &power;
                    }

                    if recovering.get(sector_number) {
                        recovering_power += &power;
                    }

                    remaining.remove(&sector_number);
                    changed = true;
                }
            }

            expiration_set.validate_state()?;
            Ok((changed, !remaining.is_empty()))
        })?;

        if !remaining.is_empty() {
            return Err(anyhow!("sectors not found in expiration queue: {:?}", remaining));
        }

        Ok((removed, recovering_power))
    }

    /// Removes and aggregates entries from the queue up to and including some epoch.
    pub fn pop_until(&mut self, until: ChainEpoch) -> anyhow::Result<ExpirationSet> {
        let mut popped = ExpirationSet::empty();
        let mut popped_keys = Vec::<u64>::new();

        self.amt.for_each_while(|i, this_value| {
            if i as ChainEpoch > until {
                return Ok(false);
            }
            popped_keys.push(i);
            popped.on_time_sectors |= &this_value.on_time_sectors;
            popped.early_sectors |= &this_value.early_sectors;
            popped.active_power += &this_value.active_power;
            popped.faulty_power += &this_value.faulty_power;
            popped.on_time_pledge += &this_value.on_time_pledge;
            Ok(true)
        })?;

        self.amt.batch_delete(popped_keys, true)?;
        Ok(popped)
    }

    fn add(
        &mut self,
        raw_epoch: ChainEpoch,
        on_time_sectors: &BitField,
        early_sectors: &BitField,
        active_power: &PowerPair,
        faulty_power: &PowerPair,
        pledge: &TokenAmount,
    ) -> anyhow::Result<()> {
        let epoch = self.quant.quantize_up(raw_epoch);
        let mut expiration_set = self.may_get(epoch)?;

        expiration_set
            .add(on_time_sectors, early_sectors, pledge, active_power, faulty_power)
            .with_context(|| format!("failed to add expiration values for epoch {}", epoch))?;

        self.must_update(epoch, expiration_set)
    }

    fn remove(
        &mut self,
        raw_epoch: ChainEpoch,
        on_time_sectors: &BitField,
        early_sectors: &BitField,
        active_power: &PowerPair,
        faulty_power: &PowerPair,
        pledge: &TokenAmount,
    ) -> anyhow::Result<()> {
        let epoch = self.quant.quantize_up(raw_epoch);
        let mut expiration_set = self.must_get(epoch)?;

        expiration_set
            .remove(on_time_sectors, early_sectors, pledge, active_power, faulty_power)
            .with_context(|| {
                format!("failed to remove expiration values for queue epoch {}", epoch)
            })?;

        self.must_update_or_delete(epoch, expiration_set)
    }

    fn remove_active_sectors(
        &mut self,
        sectors: &[SectorOnChainInfo],
        sector_size: SectorSize,
    ) -> anyhow::Result<(BitField, PowerPair, TokenAmount)> {
        let mut removed_sector_numbers = Vec::<u64>::new();
        let mut removed_power = PowerPair::zero();
        let mut removed_pledge = TokenAmount::zero();

        // Group sectors by their expiration, then remove from existing queue entries according to those groups.
        for group in group_sectors_by_expiration(sector_size, sectors, self.quant) {
            let sectors_bitfield = BitField::try_from_bits(group.sectors.iter().copied())?;
            self.remove(
                group.epoch,
                &sectors_bitfield,
                &BitField::new(),
                &group.power,
                &PowerPair::zero(),
                &group.pledge,
            )?;

            removed_sector_numbers.extend(&group.sectors);
            removed_power += &group.power;
            removed_pledge += &group.pledge;
        }

        removed_sector_numbers.sort_unstable();
        let removed_sector_numbers = BitField::try_from_bits(removed_sector_numbers)?;
        Ok((removed_sector_numbers, removed_power, removed_pledge))
    }

    /// Traverses the entire queue with a callback function that may mutate entries.
    /// Iff the function returns that it changed an entry, the new entry will be re-written in the queue. Any changed
    /// entries that become empty are removed after iteration completes.
    fn traverse_mutate<F>(&mut self, mut f: F) -> anyhow::Result<()>
    where
        F: FnMut(ChainEpoch, &mut ExpirationSet) -> anyhow::Result<(bool, bool)>,
    {
        let mut changed_entries = Vec::<(u64, ExpirationSet)>::new();

        self.amt.for_each_while(|epoch, expiration_set| {
            let mut expiration_set = expiration_set.clone();
            let (changed, keep_going) = f(epoch as ChainEpoch, &mut expiration_set)?;
            if changed {
                changed_entries.push((epoch, expiration_set));
            }
            Ok(keep_going)
        })?;

        let mut epochs_emptied = Vec::<u64>::new();
        for (epoch, expiration_set) in changed_entries {
            if expiration_set.is_empty() {
                epochs_emptied.push(epoch);
            } else {
                self.amt.set(epoch, expiration_set)?;
            }
        }

        self.amt.batch_delete(epochs_emptied, true)?;
        Ok(())
    }

    fn may_get(&self, key: ChainEpoch) -> anyhow::Result<ExpirationSet> {
        Ok(self
            .amt
            .get(epoch_key(key)?)
            .map_err(|e| e.downcast_wrap(format!("failed to lookup queue epoch {}", key)))?
            .cloned()
            .unwrap_or_default())
    }

    fn must_get(&self, key: ChainEpoch) -> anyhow::Result<ExpirationSet> {
        self.amt
            .get(epoch_key(key)?)
            .map_err(|e| e.downcast_wrap(format!("failed to lookup queue epoch {}", key)))?
            .cloned()
            .ok_or_else(|| anyhow!("missing expected expiration set at epoch {}", key))
    }

    fn must_update(
        &mut self,
        epoch: ChainEpoch,
        expiration_set: ExpirationSet,
    ) -> anyhow::Result<()> {
        self.amt
            .set(epoch_key(epoch)?, expiration_set)
            .map_err(|e| e.downcast_wrap(format!("failed to set queue epoch {}", epoch)))
    }

    /// Since this might delete the node, it's not safe for use inside an iteration.
    fn must_update_or_delete(
        &mut self,
        epoch: ChainEpoch,
        expiration_set: ExpirationSet,
    ) -> anyhow::Result<()> {
        if expiration_set.is_empty() {
            self.amt
                .delete(epoch_key(epoch)?)
                .map_err(|e| e.downcast_wrap(format!("failed to delete queue epoch {}", epoch)))?;
        } else {
            self.must_update(epoch, expiration_set)?;
        }
        Ok(())
    }
}

fn epoch_key(epoch: ChainEpoch) -> anyhow::Result<u64> {
    u64::try_from(epoch).map_err(|_| anyhow!("negative expiration queue epoch {}", epoch))
}

#[derive(Debug)]
struct SectorEpochSet {
    epoch: ChainEpoch,
    sectors: Vec<u64>,
    power: PowerPair,
    pledge: TokenAmount,
}

/// Takes a slice of sector infos and returns sector info sets grouped and
/// sorted by expiration epoch, quantized.
///
/// Note: While the result is sorted by epoch, the order of per-epoch sectors is maintained.
fn group_sectors_by_expiration<'a>(
    sector_size: SectorSize,
    sectors: impl IntoIterator<Item = &'a SectorOnChainInfo>,
    quant: QuantSpec,
) -> Vec<SectorEpochSet> {
    let mut sectors_by_expiration = BTreeMap::<ChainEpoch, Vec<&SectorOnChainInfo>>::new();

    for sector in sectors {
        let q_expiration = quant.quantize_up(sector.expiration);
        sectors_by_expiration.entry(q_expiration).or_default().push(sector);
    }

    sectors_by_expiration
        .into_iter()
        .map(|(expiration, epoch_sectors)| {
            let mut sector_numbers = Vec::<u64>::with_capacity(epoch_sectors.len());
            let mut total_power = PowerPair::zero();
            let mut total_pledge = TokenAmount::zero();

            for sector in epoch_sectors {
                sector_numbers.push(sector.sector_number);
                total_power += &power_for_sector(sector_size, sector);
                total_pledge += &sector.initial_pledge;
            }

            sector_numbers.sort_unstable();
            SectorEpochSet {
                epoch: expiration,
                sectors: sector_numbers,
                power: total_power,
                pledge: total_pledge,
            }
        })
        .collect()
}
