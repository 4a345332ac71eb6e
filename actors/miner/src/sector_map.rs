// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeMap;

use anyhow::anyhow;
use fil_actors_runtime::runtime::Policy;
use fvm_ipld_bitfield::BitField;

/// Maps deadlines to partition maps.
/// Keys are kept ordered so every walk visits deadlines in index order.
#[derive(Default, Debug)]
pub struct DeadlineSectorMap(BTreeMap<u64, PartitionSectorMap>);

impl DeadlineSectorMap {
    pub fn new() -> Self {
        Default::default()
    }

    /// Check validates all bitfields and counts the number of partitions & sectors
    /// contained within the map, and returns an error if they exceed the given
    /// maximums.
    pub fn check(&self, max_partitions: u64, max_sectors: u64) -> anyhow::Result<()> {
        let (partition_count, sector_count) =
            self.count().map_err(|e| anyhow!("failed to count sectors: {:?}", e))?;

        if partition_count > max_partitions {
            return Err(anyhow!("too many partitions {}, max {}", partition_count, max_partitions));
        }

        if sector_count > max_sectors {
            return Err(anyhow!("too many sectors {}, max {}", sector_count, max_sectors));
        }

        Ok(())
    }

    /// Counts the number of partitions & sectors within the map.
    pub fn count(&self) -> anyhow::Result<(/* partitions */ u64, /* sectors */ u64)> {
        self.0.iter().try_fold((0_u64, 0_u64), |(partitions, sectors), (deadline_idx, pm)| {
            let (partition_count, sector_count) = pm
                .count()
                .map_err(|e| anyhow!("when counting deadline {}: {:?}", deadline_idx, e))?;
            Ok((
                partitions
                    .checked_add(partition_count)
                    .ok_or_else(|| anyhow!("integer overflow when counting partitions"))?,
                sectors
                    .checked_add(sector_count)
                    .ok_or_else(|| anyhow!("integer overflow when counting sectors"))?,
            ))
        })
    }

    /// Records the given sector bitfield at the given deadline/partition index.
    pub fn add(
        &mut self,
        policy: &Policy,
        deadline_idx: u64,
        partition_idx: u64,
        sector_numbers: &BitField,
    ) -> anyhow::Result<()> {
        if deadline_idx >= policy.wpost_period_deadlines {
            return Err(anyhow!("invalid deadline {}", deadline_idx));
        }

        self.0.entry(deadline_idx).or_default().add(partition_idx, sector_numbers)
    }

    /// Records the given sectors at the given deadline/partition index.
    pub fn add_values(
        &mut self,
        policy: &Policy,
        deadline_idx: u64,
        partition_idx: u64,
        sector_numbers: &[u64],
    ) -> anyhow::Result<()> {
        let mut sorted = sector_numbers.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let bf = BitField::try_from_bits(sorted)
            .map_err(|e| anyhow!("failed to build sector bitfield: {}", e))?;
        self.add(policy, deadline_idx, partition_idx, &bf)
    }

    /// Returns a sorted vec of deadlines in the map.
    pub fn deadlines(&self) -> Vec<u64> {
        self.0.keys().copied().collect()
    }

    /// Walks the deadlines in deadline order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &PartitionSectorMap)> + '_ {
        self.0.iter().map(|(&i, pm)| (i, pm))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Maps partitions to sector bitfields.
#[derive(Default, Debug, Clone)]
pub struct PartitionSectorMap(BTreeMap<u64, BitField>);

impl PartitionSectorMap {
    /// Records the given sectors at the given partition.
    pub fn add_values(
        &mut self,
        partition_idx: u64,
        mut sector_numbers: Vec<u64>,
    ) -> anyhow::Result<()> {
        sector_numbers.sort_unstable();
        sector_numbers.dedup();
        let bf = BitField::try_from_bits(sector_numbers)
            .map_err(|e| anyhow!("failed to build sector bitfield: {}", e))?;
        self.add(partition_idx, &bf)
    }

    /// Records the given sector bitfield at the given partition index, merging
    /// it with any existing bitfields if necessary.
    pub fn add(&mut self, partition_idx: u64, sector_numbers: &BitField) -> anyhow::Result<()> {
        self.0
            .entry(partition_idx)
            .and_modify(|old_sector_numbers| *old_sector_numbers |= sector_numbers)
            .or_insert_with(|| sector_numbers.clone());
        Ok(())
    }

    /// Counts the number of partitions & sectors within the map.
    pub fn count(&self) -> anyhow::Result<(/* partitions */ u64, /* sectors */ u64)> {
        let sectors = self.0.values().try_fold(0_u64, |sectors, bf| {
            sectors
                .checked_add(bf.len())
                .ok_or_else(|| anyhow!("integer overflow when counting sectors"))
        })?;
        Ok((self.0.len() as u64, sectors))
    }

    /// Returns a sorted vec of partitions in the map.
    pub fn partitions(&self) -> Vec<u64> {
        self.0.keys().copied().collect()
    }

    /// Walks the partitions in the map, in order of increasing index.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &BitField)> + '_ {
        self.0.iter().map(|(&i, bf)| (i, bf))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
