// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use anyhow::anyhow;
use fil_actors_runtime::runtime::Policy;

use super::{Deadline, SectorOnChainInfo};

struct DeadlineAssignmentInfo {
    index: usize,
    total_sectors: u64,
}

impl DeadlineAssignmentInfo {
    fn partitions(&self, partition_size: u64) -> u64 {
        (self.total_sectors + partition_size - 1) / partition_size
    }

    /// Number of sectors that fit before the open partition is full, zero when every
    /// partition is full.
    fn gap(&self, partition_size: u64) -> u64 {
        match self.total_sectors % partition_size {
            0 => 0,
            used => partition_size - used,
        }
    }
}

/// The first deadline never receives new sectors, leaving a miner a full challenge window to
/// prepare before any newly assigned sector is due.
const FIRST_ASSIGNABLE_DEADLINE: usize = 1;

/// Assigns partitions to deadlines.
///
/// Deadlines that are `None` are not assignable; the caller passes `None` for any deadline
/// that isn't currently mutable. The first deadline is skipped regardless.
///
/// Open partitions are topped up first, in deadline order. The remaining sectors are then
/// handed out a full partition at a time to whichever deadline has the fewest partitions,
/// lowest index first on ties.
pub fn assign_deadlines(
    policy: &Policy,
    partition_size: u64,
    deadlines: &[Option<Deadline>],
    sectors: Vec<SectorOnChainInfo>,
) -> anyhow::Result<Vec<Vec<SectorOnChainInfo>>> {
    if partition_size == 0 {
        return Err(anyhow!("partition size must be positive"));
    }

    let mut infos: Vec<DeadlineAssignmentInfo> = deadlines
        .iter()
        .enumerate()
        .skip(FIRST_ASSIGNABLE_DEADLINE)
        .filter_map(|(index, deadline)| {
            deadline
                .as_ref()
                .map(|dl| DeadlineAssignmentInfo { index, total_sectors: dl.total_sectors })
        })
        .collect();

    if infos.is_empty() && !sectors.is_empty() {
        return Err(anyhow!("no assignable deadlines for {} new sectors", sectors.len()));
    }

    let mut changes = vec![Vec::new(); policy.wpost_period_deadlines as usize];
    let mut remaining = sectors.into_iter().peekable();

    // Fill open partitions.
    for info in infos.iter_mut() {
        if remaining.peek().is_none() {
            break;
        }
        let gap = info.gap(partition_size);
        for sector in remaining.by_ref().take(gap as usize) {
            changes[info.index].push(sector);
            info.total_sectors += 1;
        }
    }

    // Add whole partitions to the least loaded deadlines.
    infos.sort_by_key(|info| (info.partitions(partition_size), info.index));
    while remaining.peek().is_some() {
        let target = &mut infos[0];
        for sector in remaining.by_ref().take(partition_size as usize) {
            changes[target.index].push(sector);
            target.total_sectors += 1;
        }
        // Only the head moved; the rest is still ordered.
        infos.sort_by_key(|info| (info.partitions(partition_size), info.index));
    }

    Ok(changes)
}
