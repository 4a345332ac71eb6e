// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fil_actor_miner::{
    power_for_sectors, ExpirationQueue, ExpirationSet, PowerPair, SectorOnChainInfo,
};
use fil_actors_runtime::Array;
use fvm_ipld_blockstore::MemoryBlockstore;
use fvm_shared::clock::{ChainEpoch, QuantSpec, NO_QUANTIZATION};
use fvm_shared::econ::TokenAmount;
use num_traits::Zero;
use fvm_shared::sector::{SectorNumber, SectorSize};

mod util;
use util::*;

const SECTOR_SIZE: SectorSize = SectorSize::_2KiB;

fn test_sector(sector_number: SectorNumber, expiration: ChainEpoch) -> SectorOnChainInfo {
    SectorOnChainInfo {
        sector_number,
        expiration,
        initial_pledge: TokenAmount::from_atto(100 * sector_number),
        ..Default::default()
    }
}

/// Sectors 1-6 expiring in pairs at epochs 9, 13 and 17.
fn sectors() -> Vec<SectorOnChainInfo> {
    vec![
        test_sector(1, 9),
        test_sector(2, 9),
        test_sector(3, 13),
        test_sector(4, 13),
        test_sector(5, 17),
        test_sector(6, 17),
    ]
}

fn pick(all: &[SectorOnChainInfo], numbers: &[SectorNumber]) -> Vec<SectorOnChainInfo> {
    all.iter().filter(|s| numbers.contains(&s.sector_number)).cloned().collect()
}

fn power(all: &[SectorOnChainInfo], numbers: &[SectorNumber]) -> PowerPair {
    power_for_sectors(SECTOR_SIZE, &pick(all, numbers))
}

fn pledge(numbers: &[SectorNumber]) -> TokenAmount {
    TokenAmount::from_atto(numbers.iter().map(|n| 100 * n).sum::<u64>())
}

fn empty_queue(store: &MemoryBlockstore, quant: QuantSpec) -> ExpirationQueue<MemoryBlockstore> {
    let root = Array::<ExpirationSet, _>::new(store).flush().unwrap();
    ExpirationQueue::new(store, &root, quant).unwrap()
}

fn entries(queue: &ExpirationQueue<MemoryBlockstore>) -> Vec<(ChainEpoch, ExpirationSet)> {
    let mut out = Vec::new();
    queue
        .amt
        .for_each(|epoch, set| {
            out.push((epoch as ChainEpoch, set.clone()));
            Ok(())
        })
        .unwrap();
    out
}

fn epochs(queue: &ExpirationQueue<MemoryBlockstore>) -> Vec<ChainEpoch> {
    entries(queue).into_iter().map(|(epoch, _)| epoch).collect()
}

fn assert_set(
    set: &ExpirationSet,
    on_time: &[u64],
    early: &[u64],
    on_time_pledge: TokenAmount,
    active_power: PowerPair,
    faulty_power: PowerPair,
) {
    assert_bitfield_equals(&set.on_time_sectors, on_time);
    assert_bitfield_equals(&set.early_sectors, early);
    assert_eq!(on_time_pledge, set.on_time_pledge);
    assert_eq!(active_power, set.active_power);
    assert_eq!(faulty_power, set.faulty_power);
}

#[test]
fn added_sectors_are_grouped_by_expiration() {
    let store = MemoryBlockstore::default();
    let mut queue = empty_queue(&store, NO_QUANTIZATION);
    let all = sectors();

    let (numbers, total_power, total_pledge) =
        queue.add_active_sectors(&all, SECTOR_SIZE).unwrap();
    assert_bitfield_equals(&numbers, &[1, 2, 3, 4, 5, 6]);
    assert_eq!(power(&all, &[1, 2, 3, 4, 5, 6]), total_power);
    assert_eq!(pledge(&[1, 2, 3, 4, 5, 6]), total_pledge);

    let entries = entries(&queue);
    assert_eq!(vec![9, 13, 17], entries.iter().map(|(e, _)| *e).collect::<Vec<_>>());
    assert_set(
        &entries[0].1,
        &[1, 2],
        &[],
        pledge(&[1, 2]),
        power(&all, &[1, 2]),
        PowerPair::zero(),
    );
    assert_set(
        &entries[2].1,
        &[5, 6],
        &[],
        pledge(&[5, 6]),
        power(&all, &[5, 6]),
        PowerPair::zero(),
    );
}

#[test]
fn removing_every_added_sector_empties_the_queue() {
    let store = MemoryBlockstore::default();
    let mut queue = empty_queue(&store, NO_QUANTIZATION);
    let all = sectors();
    queue.add_active_sectors(&all, SECTOR_SIZE).unwrap();

    let (removed, recovering_power) = queue
        .remove_sectors(&all, &make_bitfield(&[]), &make_bitfield(&[]), SECTOR_SIZE)
        .unwrap();
    assert_set(
        &removed,
        &[1, 2, 3, 4, 5, 6],
        &[],
        pledge(&[1, 2, 3, 4, 5, 6]),
        power(&all, &[1, 2, 3, 4, 5, 6]),
        PowerPair::zero(),
    );
    assert!(recovering_power.is_zero());

    // Emptied entries are deleted rather than left as zero-valued sets.
    assert!(entries(&queue).is_empty());
}

#[test]
fn faults_move_to_early_expiration_unless_expiring_sooner() {
    let store = MemoryBlockstore::default();
    let mut queue = empty_queue(&store, NO_QUANTIZATION);
    let all = sectors();
    queue.add_active_sectors(&all, SECTOR_SIZE).unwrap();

    let faulty_power =
        queue.reschedule_as_faults(12, &pick(&all, &[1, 3, 5]), SECTOR_SIZE).unwrap();
    assert_eq!(power(&all, &[1, 3, 5]), faulty_power);

    let entries = entries(&queue);
    assert_eq!(vec![9, 12, 13, 17], entries.iter().map(|(e, _)| *e).collect::<Vec<_>>());

    // Sector 1 already expires before the fault deadline: it stays on time but its power is faulty.
    assert_set(
        &entries[0].1,
        &[1, 2],
        &[],
        pledge(&[1, 2]),
        power(&all, &[2]),
        power(&all, &[1]),
    );
    // Sectors 3 and 5 are rescheduled early and carry no on-time pledge there.
    assert_set(
        &entries[1].1,
        &[],
        &[3, 5],
        TokenAmount::zero(),
        PowerPair::zero(),
        power(&all, &[3, 5]),
    );
    assert_set(&entries[2].1, &[4], &[], pledge(&[4]), power(&all, &[4]), PowerPair::zero());
    assert_set(&entries[3].1, &[6], &[], pledge(&[6]), power(&all, &[6]), PowerPair::zero());
}

#[test]
fn recovery_restores_the_original_schedule() {
    let store = MemoryBlockstore::default();
    let mut queue = empty_queue(&store, NO_QUANTIZATION);
    let all = sectors();
    queue.add_active_sectors(&all, SECTOR_SIZE).unwrap();
    let original = entries(&queue);

    queue.reschedule_as_faults(12, &pick(&all, &[1, 3, 5]), SECTOR_SIZE).unwrap();
    let recovered = queue.reschedule_recovered(pick(&all, &[1, 3, 5]), SECTOR_SIZE).unwrap();
    assert_eq!(power(&all, &[1, 3, 5]), recovered);

    let restored = entries(&queue);
    assert_eq!(vec![9, 13, 17], restored.iter().map(|(e, _)| *e).collect::<Vec<_>>());
    for ((_, want), (_, got)) in original.iter().zip(restored.iter()) {
        let on_time: Vec<u64> = want.on_time_sectors.iter().collect();
        assert_set(
            got,
            &on_time,
            &[],
            want.on_time_pledge.clone(),
            want.active_power.clone(),
            PowerPair::zero(),
        );
    }
}

#[test]
fn recovering_an_unscheduled_sector_fails() {
    let store = MemoryBlockstore::default();
    let mut queue = empty_queue(&store, NO_QUANTIZATION);
    let all = sectors();
    queue.add_active_sectors(&pick(&all, &[1, 2]), SECTOR_SIZE).unwrap();

    let err = queue.reschedule_recovered(pick(&all, &[3]), SECTOR_SIZE).unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[test]
fn removes_faulty_and_active_sectors_with_recovering_power() {
    let store = MemoryBlockstore::default();
    let mut queue = empty_queue(&store, NO_QUANTIZATION);
    let all = sectors();
    queue.add_active_sectors(&all, SECTOR_SIZE).unwrap();
    queue.reschedule_as_faults(12, &pick(&all, &[3]), SECTOR_SIZE).unwrap();

    let (removed, recovering_power) = queue
        .remove_sectors(
            &pick(&all, &[3, 4]),
            &make_bitfield(&[3]),
            &make_bitfield(&[3]),
            SECTOR_SIZE,
        )
        .unwrap();
    assert_set(&removed, &[4], &[3], pledge(&[4]), power(&all, &[4]), power(&all, &[3]));
    assert_eq!(power(&all, &[3]), recovering_power);

    assert_eq!(vec![9, 17], epochs(&queue));
}

#[test]
fn removing_an_unknown_faulty_sector_fails() {
    let store = MemoryBlockstore::default();
    let mut queue = empty_queue(&store, NO_QUANTIZATION);
    let all = sectors();
    queue.add_active_sectors(&pick(&all, &[1, 2]), SECTOR_SIZE).unwrap();

    let err = queue
        .remove_sectors(&pick(&all, &[5]), &make_bitfield(&[5]), &make_bitfield(&[]), SECTOR_SIZE)
        .unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[test]
fn replaces_sectors() {
    let store = MemoryBlockstore::default();
    let mut queue = empty_queue(&store, NO_QUANTIZATION);
    let all = sectors();
    queue.add_active_sectors(&pick(&all, &[1, 3]), SECTOR_SIZE).unwrap();

    let replacement = test_sector(7, 17);
    let (old, new, power_delta, pledge_delta) = queue
        .replace_sectors(&pick(&all, &[1]), &[replacement.clone()], SECTOR_SIZE)
        .unwrap();
    assert_bitfield_equals(&old, &[1]);
    assert_bitfield_equals(&new, &[7]);
    assert_eq!(
        &power_for_sectors(SECTOR_SIZE, &[replacement]) - &power(&all, &[1]),
        power_delta
    );
    assert_eq!(pledge(&[7]) - pledge(&[1]), pledge_delta);

    // The entry at 9 held only sector 1 and is gone.
    assert_eq!(vec![13, 17], epochs(&queue));
}

#[test]
fn pops_quantized_entries_in_order() {
    let store = MemoryBlockstore::default();
    // Keys land on 3, 8, 13, 18, ...
    let mut queue = empty_queue(&store, QuantSpec { unit: 5, offset: 3 });
    let all = vec![test_sector(1, 6), test_sector(2, 8), test_sector(3, 11), test_sector(4, 15)];
    queue.add_active_sectors(&all, SECTOR_SIZE).unwrap();
    assert_eq!(vec![8, 13, 18], epochs(&queue));

    // Epoch 12 is before the quantized key 13, so only the first entry is due.
    let popped = queue.pop_until(12).unwrap();
    assert_set(&popped, &[1, 2], &[], pledge(&[1, 2]), power(&all, &[1, 2]), PowerPair::zero());
    assert_eq!(vec![13, 18], epochs(&queue));

    let popped = queue.pop_until(13).unwrap();
    assert_bitfield_equals(&popped.on_time_sectors, &[3]);
    assert_eq!(vec![18], epochs(&queue));

    assert!(queue.pop_until(17).unwrap().is_empty());
    assert_eq!(vec![18], epochs(&queue));
}
