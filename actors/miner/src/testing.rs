// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeMap;

use fil_actors_runtime::runtime::Policy;
use fil_actors_runtime::{make_map_with_root, parse_uint_key, MessageAccumulator};
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::CborStore;
use fvm_shared::clock::{ChainEpoch, QuantSpec, NO_QUANTIZATION};
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::{SectorNumber, SectorSize};
use num_traits::{Signed, Zero};

use crate::{
    power_for_sectors, BitFieldQueue, Deadline, ExpirationQueue, MinerInfo, Partition, PowerPair,
    SectorOnChainInfo, SectorPreCommitOnChainInfo, Sectors, State,
};

pub struct StateSummary {
    pub live_power: PowerPair,
    pub active_power: PowerPair,
    pub faulty_power: PowerPair,
    pub seal_proof_type: fvm_shared::sector::RegisteredSealProof,
}

impl Default for StateSummary {
    fn default() -> Self {
        StateSummary {
            live_power: PowerPair::zero(),
            active_power: PowerPair::zero(),
            faulty_power: PowerPair::zero(),
            seal_proof_type: fvm_shared::sector::RegisteredSealProof::Invalid(0),
        }
    }
}

/// Checks internal invariants of the miner state.
pub fn check_state_invariants<BS: Blockstore>(
    policy: &Policy,
    state: &State,
    store: &BS,
    balance: &TokenAmount,
) -> (StateSummary, MessageAccumulator) {
    let acc = MessageAccumulator::default();
    let sector_size;

    let mut miner_summary = StateSummary::default();

    // load data from linked structures
    match state.get_info(store) {
        Ok(info) => {
            miner_summary.seal_proof_type = info.seal_proof_type;
            sector_size = info.sector_size;
            check_miner_info(&info, &acc);
        }
        Err(e) => {
            // Stop here, it's too hard to make other useful checks.
            acc.add(format!("error loading miner info: {e}"));
            return (miner_summary, acc);
        }
    };

    check_miner_balances(state, store, balance, &acc);

    let allocated_sectors = match store.get_cbor::<BitField>(&state.allocated_sectors) {
        Ok(Some(allocated_sectors)) => allocated_sectors,
        Ok(None) => {
            acc.add(format!(
                "allocated sectors bitfield not found at {}",
                state.allocated_sectors
            ));
            BitField::new()
        }
        Err(e) => {
            acc.add(format!("error loading allocated sector bitfield: {e}"));
            BitField::new()
        }
    };

    check_precommits(policy, state, store, &allocated_sectors, &acc);

    let mut all_sectors: BTreeMap<SectorNumber, SectorOnChainInfo> = BTreeMap::new();
    match Sectors::load(store, &state.sectors) {
        Ok(sectors) => {
            let ret = sectors.amt.for_each(|sector_number, sector| {
                all_sectors.insert(sector_number, sector.clone());
                acc.require(
                    allocated_sectors.get(sector_number),
                    format!("on chain sector's sector number has not been allocated {sector_number}"),
                );
                acc.require(
                    sector.activation <= sector.expiration,
                    format!(
                        "sector {sector_number} expires at {} before activation {}",
                        sector.expiration, sector.activation
                    ),
                );
                Ok(())
            });

            acc.require_no_error(ret, "error iterating sectors");
        }
        Err(e) => acc.add(format!("error loading sectors: {e}")),
    };

    // check deadlines
    acc.require(
        state.current_deadline < policy.wpost_period_deadlines,
        format!(
            "current deadline index is greater than deadlines per period({}): {}",
            policy.wpost_period_deadlines, state.current_deadline
        ),
    );

    match state.load_deadlines(store) {
        Ok(deadlines) => {
            let ret = deadlines.for_each(policy, store, |deadline_index, deadline| {
                let acc = acc.with_prefix(format!("deadline {deadline_index}: "));
                let quant = state.quant_spec_for_deadline(policy, deadline_index);
                let deadline_summary = DeadlineStateSummary::check_deadline_state_invariants(
                    &deadline,
                    store,
                    quant,
                    sector_size,
                    &all_sectors,
                    &acc,
                );

                miner_summary.live_power += &deadline_summary.live_power;
                miner_summary.active_power += &deadline_summary.active_power;
                miner_summary.faulty_power += &deadline_summary.faulty_power;
                Ok(())
            });

            acc.require_no_error(ret, "error iterating deadlines");
        }
        Err(e) => {
            acc.add(format!("error loading deadlines: {e}"));
        }
    };

    (miner_summary, acc)
}

fn check_miner_info(info: &MinerInfo, acc: &MessageAccumulator) {
    acc.require(
        info.owner.protocol() == fvm_shared::address::Protocol::ID,
        format!("owner address {} is not an ID address", info.owner),
    );
    acc.require(
        info.worker.protocol() == fvm_shared::address::Protocol::ID,
        format!("worker address {} is not an ID address", info.worker),
    );
    info.control_addresses.iter().for_each(|address| {
        acc.require(
            address.protocol() == fvm_shared::address::Protocol::ID,
            format!("control address {} is not an ID address", address),
        )
    });

    if let Some(pending_worker_key) = &info.pending_worker_key {
        acc.require(
            pending_worker_key.new_worker.protocol() == fvm_shared::address::Protocol::ID,
            format!(
                "pending worker address {} is not an ID address",
                pending_worker_key.new_worker
            ),
        );
        acc.require(
            pending_worker_key.new_worker != info.worker,
            format!(
                "pending worker key {} is same as existing worker {}",
                pending_worker_key.new_worker, info.worker
            ),
        );
    }

    match info.seal_proof_type.sector_size() {
        Ok(sector_size) => acc.require(
            info.sector_size == sector_size,
            format!(
                "sector size {} is wrong for seal proof type {:?}: {}",
                info.sector_size as u64, info.seal_proof_type, sector_size as u64
            ),
        ),
        Err(e) => acc.add(format!("invalid seal proof type {:?}: {e}", info.seal_proof_type)),
    }

    match info.seal_proof_type.window_post_partitions_sector() {
        Ok(partition_sectors) => acc.require(
            info.window_post_partition_sectors == partition_sectors,
            format!(
                "miner partition sectors {} does not match partition sectors {} for seal proof type {:?}",
                info.window_post_partition_sectors, partition_sectors, info.seal_proof_type
            ),
        ),
        Err(e) => acc.add(format!("invalid seal proof type {:?}: {e}", info.seal_proof_type)),
    }
}

fn check_miner_balances<BS: Blockstore>(
    state: &State,
    store: &BS,
    balance: &TokenAmount,
    acc: &MessageAccumulator,
) {
    acc.require(
        !balance.is_negative(),
        format!("miner actor balance is less than zero: {balance}"),
    );
    acc.require(
        !state.locked_funds.is_negative(),
        format!("miner locked funds is less than zero: {}", state.locked_funds),
    );
    acc.require(
        !state.pre_commit_deposits.is_negative(),
        format!("miner precommit deposit is less than zero: {}", state.pre_commit_deposits),
    );
    acc.require(
        !state.initial_pledge_requirement.is_negative(),
        format!(
            "miner initial pledge requirement is less than zero: {}",
            state.initial_pledge_requirement
        ),
    );
    acc.require(
        balance >= &(&state.pre_commit_deposits + &state.locked_funds),
        format!(
            "miner balance {balance} below deposits {} plus locked funds {}",
            state.pre_commit_deposits, state.locked_funds
        ),
    );

    match state.load_vesting_funds(store) {
        Ok(funds) => {
            // the vesting table is kept sorted and holds no empty entries
            let mut last_epoch = ChainEpoch::MIN;
            for fund in &funds.funds {
                acc.require(
                    fund.epoch > last_epoch,
                    format!("vesting table entries out of order at {}", fund.epoch),
                );
                acc.require(
                    fund.amount.is_positive(),
                    format!("non-positive vesting amount {} at {}", fund.amount, fund.epoch),
                );
                last_epoch = fund.epoch;
            }

            acc.require(
                funds.total() == state.locked_funds,
                format!(
                    "locked funds {} is not sum of vesting table entries {}",
                    state.locked_funds,
                    funds.total()
                ),
            );
        }
        Err(e) => acc.add(format!("error loading vesting funds: {e}")),
    };
}

fn check_precommits<BS: Blockstore>(
    policy: &Policy,
    state: &State,
    store: &BS,
    allocated_sectors: &BitField,
    acc: &MessageAccumulator,
) {
    let quant = state.quant_spec_every_deadline(policy);

    // invert pre-commit expiry queue into a lookup by sector number
    let mut expire_epochs: BTreeMap<SectorNumber, ChainEpoch> = BTreeMap::new();
    match BitFieldQueue::new(store, &state.pre_committed_sectors_expiry, quant) {
        Ok(queue) => {
            let ret = queue.amt.for_each(|epoch, expiration_bitfield| {
                let epoch = epoch as ChainEpoch;
                let quantized = quant.quantize_up(epoch);
                acc.require(
                    quantized == epoch,
                    format!("precommit expiration {epoch} is not quantized"),
                );

                expiration_bitfield.iter().for_each(|sector_number| {
                    expire_epochs.insert(sector_number, epoch);
                });

                Ok(())
            });

            acc.require_no_error(ret, "error iterating pre-commit expiry queue");
        }
        Err(e) => {
            acc.add(format!("error loading precommit queue: {e}"));
        }
    };

    let mut precommit_total = TokenAmount::zero();

    let precommitted_sectors =
        make_map_with_root::<_, SectorPreCommitOnChainInfo>(&state.pre_committed_sectors, store);

    match precommitted_sectors {
        Ok(precommitted_sectors) => {
            let ret = precommitted_sectors.for_each(|key, precommit| {
                let sector_number = match parse_uint_key(key) {
                    Ok(sector_number) => sector_number,
                    Err(e) => {
                        acc.add(format!("error parsing pre-commit key as uint: {e}"));
                        return Ok(());
                    }
                };

                acc.require(
                    allocated_sectors.get(sector_number),
                    format!("pre-committed sector number has not been allocated {sector_number}"),
                );

                acc.require(
                    expire_epochs.contains_key(&sector_number),
                    format!("no expiry for pre-commit at {}", precommit.pre_commit_epoch),
                );

                precommit_total += &precommit.pre_commit_deposit;
                Ok(())
            });

            acc.require_no_error(ret, "error iterating pre-committed sectors");
        }
        Err(e) => {
            acc.add(format!("error loading precommitted_sectors: {e}"));
        }
    };

    acc.require(
        state.pre_commit_deposits == precommit_total,
        format!(
            "sum of precommit deposits {} does not equal recorded precommit deposit {}",
            precommit_total, state.pre_commit_deposits
        ),
    );
}

pub struct DeadlineStateSummary {
    pub all_sectors: BitField,
    pub live_sectors: BitField,
    pub faulty_sectors: BitField,
    pub recovering_sectors: BitField,
    pub terminated_sectors: BitField,
    pub live_power: PowerPair,
    pub active_power: PowerPair,
    pub faulty_power: PowerPair,
}

impl DeadlineStateSummary {
    pub fn check_deadline_state_invariants<BS: Blockstore>(
        deadline: &Deadline,
        store: &BS,
        quant: QuantSpec,
        sector_size: SectorSize,
        sectors: &BTreeMap<SectorNumber, SectorOnChainInfo>,
        acc: &MessageAccumulator,
    ) -> DeadlineStateSummary {
        // load linked structures
        let partitions = match deadline.partitions_amt(store) {
            Ok(partitions) => partitions,
            Err(e) => {
                // Hard to do any useful checks.
                acc.add(format!("error loading partitions: {e}"));
                return DeadlineStateSummary::empty();
            }
        };

        let mut all_sectors = Vec::<BitField>::new();
        let mut all_live_sectors = Vec::<BitField>::new();
        let mut all_faulty_sectors = Vec::<BitField>::new();
        let mut all_recovering_sectors = Vec::<BitField>::new();
        let mut all_terminated_sectors = Vec::<BitField>::new();
        let mut all_live_power = PowerPair::zero();
        let mut all_active_power = PowerPair::zero();
        let mut all_faulty_power = PowerPair::zero();

        let mut partition_count = 0;

        // check partitions
        let mut partitions_with_expirations: BTreeMap<ChainEpoch, Vec<u64>> = BTreeMap::new();
        let mut partitions_with_early_terminations = BitField::new();
        let ret = partitions.for_each(|index, partition| {
            // check sequential partitions
            acc.require(
                index == partition_count,
                format!("Non-sequential partitions, expected index {partition_count}, found {index}"),
            );
            partition_count += 1;

            let acc = acc.with_prefix(format!("partition {index}"));
            let summary = PartitionStateSummary::check_partition_state_invariants(
                partition,
                store,
                quant,
                sector_size,
                sectors,
                &acc,
            );

            acc.require(
                !summary.all_sectors.contains_any(&BitField::union(&all_sectors)),
                format!("duplicate sector in partition {index}"),
            );

            summary.expiration_epochs.iter().for_each(|&epoch| {
                partitions_with_expirations.entry(epoch).or_default().push(index);
            });

            if summary.early_termination_count > 0 {
                partitions_with_early_terminations.set(index);
            }

            all_sectors.push(summary.all_sectors);
            all_live_sectors.push(summary.live_sectors);
            all_faulty_sectors.push(summary.faulty_sectors);
            all_recovering_sectors.push(summary.recovering_sectors);
            all_terminated_sectors.push(summary.terminated_sectors);
            all_live_power += &summary.live_power;
            all_active_power += &summary.active_power;
            all_faulty_power += &summary.faulty_power;

            Ok(())
        });
        acc.require_no_error(ret, "error iterating partitions");

        // Check invariants on partitions proven.
        if let Some(last_proof) = deadline.post_submissions.last() {
            acc.require(
                partition_count >= (last_proof + 1),
                format!("expected at least {} partitions, found {partition_count}", last_proof + 1),
            );
            acc.require(
                deadline.live_sectors > 0,
                "expected at least one live sector when partitions have been proven",
            );
        }

        // Check partitions snapshot to make sure we take the snapshot after
        // dealing with recovering power and unproven power.
        acc.require(
            deadline.faulty_power == all_faulty_power,
            format!(
                "deadline faulty power {:?} != partitions total {:?}",
                deadline.faulty_power, all_faulty_power
            ),
        );

        // Validate partition expiration queue contains an entry for each partition and epoch
        // with an expiration. The queue may be a superset of partitions with expirations
        // because we never remove from it.
        match BitFieldQueue::new(store, &deadline.expirations_epochs, quant) {
            Ok(expiration_queue) => {
                for (epoch, expiring_idx) in partitions_with_expirations {
                    match expiration_queue.amt.get(epoch as u64) {
                        Ok(Some(expiration_bitfield)) => {
                            for partition in expiring_idx {
                                acc.require(
                                    expiration_bitfield.get(partition),
                                    format!(
                                        "expected partition {partition} to be present in deadline expiration queue at epoch {epoch}"
                                    ),
                                );
                            }
                        }
                        Ok(None) => {
                            acc.add(format!(
                                "expected to find partition expiration entry at epoch {epoch}"
                            ));
                        }
                        Err(e) => {
                            acc.add(format!("error fetching expiration bitfield: {e}"));
                        }
                    }
                }
            }
            Err(e) => {
                acc.add(format!("error loading expiration queue: {e}"));
            }
        }

        // Validate the early termination queue contains exactly the partitions with early terminations.
        acc.require(
            partitions_with_early_terminations == deadline.early_terminations,
            "deadline early terminations doesn't match expected partitions",
        );

        let all_sectors = BitField::union(&all_sectors);
        let all_live_sectors = BitField::union(&all_live_sectors);

        acc.require(
            deadline.total_sectors == all_sectors.len(),
            format!(
                "deadline total sectors {} != partitions count {}",
                deadline.total_sectors,
                all_sectors.len()
            ),
        );
        acc.require(
            deadline.live_sectors == all_live_sectors.len(),
            format!(
                "deadline live sectors {} != partitions count {}",
                deadline.live_sectors,
                all_live_sectors.len()
            ),
        );

        DeadlineStateSummary {
            all_sectors,
            live_sectors: all_live_sectors,
            faulty_sectors: BitField::union(&all_faulty_sectors),
            recovering_sectors: BitField::union(&all_recovering_sectors),
            terminated_sectors: BitField::union(&all_terminated_sectors),
            live_power: all_live_power,
            active_power: all_active_power,
            faulty_power: all_faulty_power,
        }
    }

    fn empty() -> Self {
        Self {
            all_sectors: BitField::new(),
            live_sectors: BitField::new(),
            faulty_sectors: BitField::new(),
            recovering_sectors: BitField::new(),
            terminated_sectors: BitField::new(),
            live_power: PowerPair::zero(),
            active_power: PowerPair::zero(),
            faulty_power: PowerPair::zero(),
        }
    }
}

pub struct PartitionStateSummary {
    pub all_sectors: BitField,
    pub live_sectors: BitField,
    pub faulty_sectors: BitField,
    pub recovering_sectors: BitField,
    pub terminated_sectors: BitField,
    pub live_power: PowerPair,
    pub active_power: PowerPair,
    pub faulty_power: PowerPair,
    pub recovering_power: PowerPair,
    // Epochs at which some sector is scheduled to expire.
    pub expiration_epochs: Vec<ChainEpoch>,
    pub early_termination_count: usize,
}

impl PartitionStateSummary {
    pub fn check_partition_state_invariants<BS: Blockstore>(
        partition: &Partition,
        store: &BS,
        quant: QuantSpec,
        sector_size: SectorSize,
        sectors_map: &BTreeMap<SectorNumber, SectorOnChainInfo>,
        acc: &MessageAccumulator,
    ) -> Self {
        let live = partition.live_sectors();
        let active = partition.active_sectors();

        // live contains all active sectors
        require_contains_all(&live, &active, acc, "live does not contain active");

        // Live contains all faults.
        require_contains_all(&live, &partition.faults, acc, "live does not contain faults");

        // Live contains all recoveries.
        require_contains_all(&live, &partition.recoveries, acc, "live does not contain recoveries");

        // Active contains no faults
        require_contains_none(&active, &partition.faults, acc, "active includes faults");

        // Ensure all sectors are accounted for
        require_contains_all(
            &partition.sectors,
            &partition.terminated,
            acc,
            "sectors does not contain terminated",
        );
        require_contains_all(&partition.faults, &partition.recoveries, acc, "faults does not contain recoveries");
        require_contains_none(&live, &partition.terminated, acc, "live includes terminations");

        // Validate power
        let mut live_power = PowerPair::zero();
        let mut faulty_power = PowerPair::zero();
        let mut recovering_power = PowerPair::zero();

        match select_sectors_map(sectors_map, &live) {
            Ok(live_sectors) => {
                live_power = power_for_sectors(sector_size, &live_sectors);
                acc.require(
                    partition.live_power == live_power,
                    format!("live power was {:?}, expected {:?}", partition.live_power, live_power),
                );
            }
            Err(e) => acc.add(format!("error loading live sectors: {e}")),
        }

        match select_sectors_map(sectors_map, &partition.faults) {
            Ok(fault_sectors) => {
                faulty_power = power_for_sectors(sector_size, &fault_sectors);
                acc.require(
                    partition.faulty_power == faulty_power,
                    format!("faulty power was {:?}, expected {:?}", partition.faulty_power, faulty_power),
                );
            }
            Err(e) => acc.add(format!("error loading faulty sectors: {e}")),
        }

        match select_sectors_map(sectors_map, &partition.recoveries) {
            Ok(recovering_sectors) => {
                recovering_power = power_for_sectors(sector_size, &recovering_sectors);
                acc.require(
                    partition.recovering_power == recovering_power,
                    format!(
                        "recovering power was {:?}, expected {:?}",
                        partition.recovering_power, recovering_power
                    ),
                );
            }
            Err(e) => acc.add(format!("error loading recovering sectors: {e}")),
        }

        let active_power = &live_power - &faulty_power;

        // Validate the expiration queue.
        let mut expiration_epochs = Vec::new();
        match ExpirationQueue::new(store, &partition.expirations_epochs, quant) {
            Ok(expiration_queue) => {
                let queue_summary = ExpirationQueueStateSummary::check_expiration_queue(
                    &expiration_queue,
                    &live,
                    &partition.faults,
                    quant,
                    sector_size,
                    sectors_map,
                    acc,
                );

                expiration_epochs = queue_summary.expiration_epochs;
                // check the queue is compatible with partition fields
                let queue_sectors =
                    BitField::union([&queue_summary.on_time_sectors, &queue_summary.early_sectors]);
                require_equal(&live, &queue_sectors, acc, "live does not equal all expirations");
            }
            Err(e) => acc.add(format!("error loading expiration_queue: {e}")),
        };

        // Validate the early termination queue.
        let early_termination_count =
            match BitFieldQueue::new(store, &partition.early_terminated, NO_QUANTIZATION) {
                Ok(queue) => check_early_termination_queue(queue, &partition.terminated, acc),
                Err(e) => {
                    acc.add(format!("error loading early termination queue: {e}"));
                    0
                }
            };

        PartitionStateSummary {
            all_sectors: partition.sectors.clone(),
            live_sectors: live,
            faulty_sectors: partition.faults.clone(),
            recovering_sectors: partition.recoveries.clone(),
            terminated_sectors: partition.terminated.clone(),
            live_power,
            active_power,
            faulty_power,
            recovering_power,
            expiration_epochs,
            early_termination_count,
        }
    }
}

struct ExpirationQueueStateSummary {
    pub on_time_sectors: BitField,
    pub early_sectors: BitField,
    pub active_power: PowerPair,
    pub faulty_power: PowerPair,
    pub on_time_pledge: TokenAmount,
    pub expiration_epochs: Vec<ChainEpoch>,
}

impl ExpirationQueueStateSummary {
    // Checks the expiration queue for consistency.
    fn check_expiration_queue<BS: Blockstore>(
        expiration_queue: &ExpirationQueue<BS>,
        live: &BitField,
        partition_faults: &BitField,
        quant: QuantSpec,
        sector_size: SectorSize,
        sectors: &BTreeMap<SectorNumber, SectorOnChainInfo>,
        acc: &MessageAccumulator,
    ) -> Self {
        let mut seen_sectors: BTreeMap<SectorNumber, ChainEpoch> = BTreeMap::new();
        let mut all_on_time = Vec::<BitField>::new();
        let mut all_early = Vec::<BitField>::new();
        let mut expiration_epochs = Vec::<ChainEpoch>::new();
        let mut all_active_power = PowerPair::zero();
        let mut all_faulty_power = PowerPair::zero();
        let mut all_on_time_pledge = TokenAmount::zero();

        let ret = expiration_queue.amt.for_each(|epoch, expiration_set| {
            let epoch = epoch as ChainEpoch;
            let acc = acc.with_prefix(format!("expiration epoch {epoch}: "));
            let quant_up = quant.quantize_up(epoch);
            acc.require(quant_up == epoch, format!("expiration queue key {epoch} is not quantized, expected {quant_up}"));

            expiration_epochs.push(epoch);

            let mut on_time_sectors_pledge = TokenAmount::zero();
            for sector_number in expiration_set.on_time_sectors.iter() {
                // check sectors are present only once
                if let Some(&seen_epoch) = seen_sectors.get(&sector_number) {
                    acc.add(format!("sector {sector_number} in expiration queue at {epoch} also seen at {seen_epoch}"));
                } else {
                    seen_sectors.insert(sector_number, epoch);
                }

                // check expiring sectors are still alive
                if let Some(sector) = sectors.get(&sector_number) {
                    let target = quant.quantize_up(sector.expiration);
                    acc.require(epoch == target, format!("invalid expiration {epoch} for sector {sector_number}, expected {target}"));
                    on_time_sectors_pledge += &sector.initial_pledge;
                } else {
                    acc.add(format!("on time expiration sector {sector_number} isn't live"));
                }
            }

            for sector_number in expiration_set.early_sectors.iter() {
                // check sectors are present only once
                if let Some(&seen_epoch) = seen_sectors.get(&sector_number) {
                    acc.add(format!("sector {sector_number} in expiration queue at {epoch} also seen at {seen_epoch}"));
                } else {
                    seen_sectors.insert(sector_number, epoch);
                }

                // check early sectors are faulty
                acc.require(partition_faults.get(sector_number), format!("sector {sector_number} expiring early but not faulty"));

                // check expiring sectors are still alive
                if let Some(sector) = sectors.get(&sector_number) {
                    let target = quant.quantize_up(sector.expiration);
                    acc.require(epoch < target, format!("invalid early expiration {epoch} for sector {sector_number}, expected < {target}"));
                } else {
                    acc.add(format!("on time expiration sector {sector_number} isn't live"));
                }
            }

            // validate power and pledge
            let all = &expiration_set.on_time_sectors | &expiration_set.early_sectors;
            let all_active = &all - partition_faults;
            let all_faulty = &all & partition_faults;

            match select_sectors_map(sectors, &all_active) {
                Ok(active) => {
                    let active_sectors_power = power_for_sectors(sector_size, &active);
                    acc.require(expiration_set.active_power == active_sectors_power, format!("active power recorded {:?} doesn't match computed {:?}", expiration_set.active_power, active_sectors_power));
                }
                Err(e) => acc.add(format!("error loading active sectors: {e}")),
            }

            match select_sectors_map(sectors, &all_faulty) {
                Ok(faulty) => {
                    let faulty_sectors_power = power_for_sectors(sector_size, &faulty);
                    acc.require(expiration_set.faulty_power == faulty_sectors_power, format!("faulty power recorded {:?} doesn't match computed {:?}", expiration_set.faulty_power, faulty_sectors_power));
                }
                Err(e) => acc.add(format!("error loading faulty sectors: {e}")),
            }

            acc.require(expiration_set.on_time_pledge == on_time_sectors_pledge, format!("on time pledge recorded {} doesn't match computed: {}", expiration_set.on_time_pledge, on_time_sectors_pledge));

            all_on_time.push(expiration_set.on_time_sectors.clone());
            all_early.push(expiration_set.early_sectors.clone());
            all_active_power += &expiration_set.active_power;
            all_faulty_power += &expiration_set.faulty_power;
            all_on_time_pledge += &expiration_set.on_time_pledge;

            Ok(())
        });
        acc.require_no_error(ret, "error iterating expiration queue");

        let union_on_time = BitField::union(&all_on_time);
        let union_early = BitField::union(&all_early);

        // every live sector is scheduled exactly once
        require_contains_all(live, &union_on_time, acc, "live does not contain on-time expirations");
        require_contains_all(live, &union_early, acc, "live does not contain early expirations");

        Self {
            on_time_sectors: union_on_time,
            early_sectors: union_early,
            active_power: all_active_power,
            faulty_power: all_faulty_power,
            on_time_pledge: all_on_time_pledge,
            expiration_epochs,
        }
    }
}

// Returns the number of sectors queued for early termination, checking each is terminated.
fn check_early_termination_queue<BS: Blockstore>(
    early_queue: BitFieldQueue<BS>,
    terminated: &BitField,
    acc: &MessageAccumulator,
) -> usize {
    let mut seen: BTreeMap<u64, ()> = BTreeMap::new();
    let mut seen_bitfield = Vec::<BitField>::new();

    let iter_result = early_queue.amt.for_each(|epoch, bitfield| {
        let acc = acc.with_prefix(format!("early termination epoch {epoch}: "));
        for i in bitfield.iter() {
            acc.require(!seen.contains_key(&i), format!("sector {i} in early termination queue twice"));
            seen.insert(i, ());
        }

        seen_bitfield.push(bitfield.clone());

        Ok(())
    });

    acc.require_no_error(iter_result, "error iterating early termination bitfield");

    require_contains_all(
        terminated,
        &BitField::union(&seen_bitfield),
        acc,
        "terminated sectors missing early termination entry",
    );

    seen.len()
}

// Selects a subset of sectors from a map by sector number.
// Returns an error if any sector is missing.
fn select_sectors_map(
    sectors: &BTreeMap<SectorNumber, SectorOnChainInfo>,
    include: &BitField,
) -> anyhow::Result<Vec<SectorOnChainInfo>> {
    include
        .iter()
        .map(|sector_number| {
            sectors
                .get(&sector_number)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("can't find sector: {sector_number}"))
        })
        .collect()
}

fn require_contains_all(
    superset: &BitField,
    subset: &BitField,
    acc: &MessageAccumulator,
    error_msg: &str,
) {
    if !superset.contains_all(subset) {
        acc.add(format!("{error_msg}: {subset:?}, {superset:?}"));
    }
}

fn require_contains_none(
    superset: &BitField,
    subset: &BitField,
    acc: &MessageAccumulator,
    error_msg: &str,
) {
    if superset.contains_any(subset) {
        acc.add(format!("{error_msg}: {subset:?}, {superset:?}"));
    }
}

fn require_equal(a: &BitField, b: &BitField, acc: &MessageAccumulator, error_msg: &str) {
    require_contains_all(a, b, acc, error_msg);
    require_contains_all(b, a, acc, error_msg);
}
