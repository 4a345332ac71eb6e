// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::cmp;
use std::collections::BTreeMap;

use anyhow::Error;
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use cid::multihash::Code::Blake2b256;
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::ipld_block::IpldBlock;
use fvm_ipld_encoding::{BytesDe, CborStore, RawBytes};
use fvm_shared::address::{Address, Payload, Protocol};
use fvm_shared::clock::ChainEpoch;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::randomness::Randomness;
use fvm_shared::sector::{
    PoStProof, RegisteredSealProof, SealVerifyInfo, SectorID, SectorInfo, SectorNumber,
    WindowPoStVerifyInfo, MAX_SECTOR_NUMBER,
};
use fvm_shared::{ActorID, METHOD_CONSTRUCTOR, METHOD_SEND};
use log::{info, warn};
use num_derive::FromPrimitive;
use num_traits::Zero;

use fil_actors_runtime::network::EPOCHS_IN_DAY;
use fil_actors_runtime::runtime::builtins::{Type, CALLER_TYPES_SIGNABLE};
use fil_actors_runtime::runtime::{ActorCode, DomainSeparationTag, Policy, Runtime};
use fil_actors_runtime::{
    actor_dispatch, actor_error, deserialize_block, extract_send_result, ActorDowncast,
    ActorError, BURNT_FUNDS_ACTOR_ADDR, INIT_ACTOR_ADDR, REWARD_ACTOR_ADDR,
    STORAGE_MARKET_ACTOR_ADDR, STORAGE_POWER_ACTOR_ADDR,
};

pub use bitfield_queue::*;
pub use deadline_assignment::*;
pub use deadline_info::*;
pub use deadline_state::*;
pub use deadlines::*;
pub use expiration_queue::*;
pub use monies::*;
pub use partition_state::*;
pub use policy::*;
pub use sector_map::*;
pub use sectors::*;
pub use state::*;
pub use termination::*;
pub use types::*;
pub use vesting_state::*;

mod bitfield_queue;
mod deadline_assignment;
mod deadline_info;
mod deadline_state;
mod deadlines;
mod expiration_queue;
#[doc(hidden)]
pub mod ext;
mod monies;
mod partition_state;
mod policy;
mod sector_map;
mod sectors;
mod state;
mod termination;
pub mod testing;
mod types;
mod vesting_state;

/// Storage Miner actor methods available
#[derive(FromPrimitive)]
#[repr(u64)]
pub enum Method {
    Constructor = METHOD_CONSTRUCTOR,
    ControlAddresses = 2,
    ChangeWorkerAddress = 3,
    ChangePeerID = 4,
    SubmitWindowedPoSt = 5,
    PreCommitSector = 6,
    ProveCommitSector = 7,
    ExtendSectorExpiration = 8,
    TerminateSectors = 9,
    DeclareFaults = 10,
    DeclareFaultsRecovered = 11,
    OnDeferredCronEvent = 12,
    CheckSectorProven = 13,
    AddLockedFund = 14,
    ReportConsensusFault = 15,
    WithdrawBalance = 16,
    ConfirmSectorProofsValid = 17,
    ChangeMultiaddrs = 18,
    CompactSectorNumbers = 20,
}

// The first 1000 actor-specific codes are left open for user error, i.e. things that might
// actually happen without programming error in the actor code.
pub const ERR_BALANCE_INVARIANTS_BROKEN: ExitCode = ExitCode::new(1000);

/// Maximum number of deal ids sent to the market in a single termination notification.
pub const DEAL_TERMINATION_BATCH: usize = 8192;

/// Miner Actor
pub struct Actor;

impl Actor {
    pub fn constructor(
        rt: &impl Runtime,
        params: MinerConstructorParams,
    ) -> Result<(), ActorError> {
        rt.validate_immediate_caller_is(std::iter::once(&INIT_ACTOR_ADDR))?;

        check_control_addresses(rt.policy(), &params.control_addresses)?;
        check_peer_info(rt.policy(), &params.peer_id, &params.multi_addresses)?;

        if !can_pre_commit_seal_proof(rt.policy(), params.seal_proof_type) {
            return Err(actor_error!(
                illegal_argument,
                "proof type {:?} not allowed for new miner actors",
                params.seal_proof_type
            ));
        }

        let owner = resolve_control_address(rt, params.owner)?;
        let worker = resolve_worker_address(rt, params.worker)?;
        let control_addresses: Vec<_> = params
            .control_addresses
            .into_iter()
            .map(|address| resolve_control_address(rt, address))
            .collect::<Result<_, _>>()?;

        let policy = rt.policy();
        let current_epoch = rt.curr_epoch();
        let blake2b = |b: &[u8]| rt.hash_blake2b(b);
        let offset =
            assign_proving_period_offset(policy, rt.message().receiver(), current_epoch, blake2b)
                .map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_SERIALIZATION,
                        "failed to assign proving period offset",
                    )
                })?;

        let period_start = next_proving_period_start(policy, current_epoch, offset);
        if period_start <= current_epoch {
            return Err(actor_error!(
                illegal_state,
                "computed proving period start {} not after current epoch {}",
                period_start,
                current_epoch
            ));
        }

        let info = MinerInfo::new(
            owner,
            Address::new_id(worker),
            control_addresses,
            params.peer_id,
            params.multi_addresses,
            params.seal_proof_type,
        )?;
        let info_cid = rt.store().put_cbor(&info, Blake2b256).map_err(|e| {
            e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to store miner info")
        })?;

        let st = State::new(policy, rt.store(), info_cid, period_start).map_err(|e| {
            e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to construct state")
        })?;
        rt.create(&st)?;

        // The first cron call fires the epoch before the first full proving period starts.
        enroll_cron_event(
            rt,
            period_start - 1,
            CronEventPayload { event_type: CRON_EVENT_PROVING_DEADLINE },
        )?;

        Ok(())
    }

    /// Returns the "controlling" addresses: the owner, the worker, and all control addresses
    fn control_addresses(rt: &impl Runtime) -> Result<GetControlAddressesReturn, ActorError> {
        rt.validate_immediate_caller_accept_any()?;
        let state: State = rt.state()?;
        let info = get_miner_info(rt.store(), &state)?;
        Ok(GetControlAddressesReturn {
            owner: info.owner,
            worker: info.worker,
            control_addresses: info.control_addresses,
        })
    }

    /// Stages a worker key change, effective after the key change delay, and replaces the
    /// control addresses immediately.
    fn change_worker_address(
        rt: &impl Runtime,
        params: ChangeWorkerAddressParams,
    ) -> Result<(), ActorError> {
        check_control_addresses(rt.policy(), &params.new_control_addresses)?;

        let new_worker = Address::new_id(resolve_worker_address(rt, params.new_worker)?);
        let control_addresses: Vec<Address> = params
            .new_control_addresses
            .into_iter()
            .map(|address| resolve_control_address(rt, address))
            .collect::<Result<_, _>>()?;

        let effective_at = rt.transaction(|state: &mut State, rt| {
            let mut info = get_miner_info(rt.store(), state)?;

            // Only the owner may change the worker and control addresses.
            rt.validate_immediate_caller_is(std::iter::once(&info.owner))?;

            info.control_addresses = control_addresses;

            // This may replace another pending key change.
            let mut effective_at = None;
            if new_worker != info.worker {
                let epoch = rt.curr_epoch() + rt.policy().worker_key_change_delay;
                info.pending_worker_key =
                    Some(WorkerKeyChange { new_worker, effective_at: epoch });
                effective_at = Some(epoch);
            }

            state.save_info(rt.store(), &info).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "could not save miner info")
            })?;

            Ok(effective_at)
        })?;

        // Control addresses changed above; only the worker change is deferred.
        if let Some(epoch) = effective_at {
            enroll_cron_event(
                rt,
                epoch,
                CronEventPayload { event_type: CRON_EVENT_WORKER_KEY_CHANGE },
            )?;
        }

        Ok(())
    }

    fn change_peer_id(rt: &impl Runtime, params: ChangePeerIDParams) -> Result<(), ActorError> {
        check_peer_info(rt.policy(), &params.new_id, &[])?;

        rt.transaction(|state: &mut State, rt| {
            let mut info = get_miner_info(rt.store(), state)?;

            rt.validate_immediate_caller_is(
                info.control_addresses.iter().chain(&[info.owner, info.worker]),
            )?;

            info.peer_id = params.new_id;
            state.save_info(rt.store(), &info).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "could not save miner info")
            })?;

            Ok(())
        })?;
        Ok(())
    }

    fn change_multiaddresses(
        rt: &impl Runtime,
        params: ChangeMultiaddrsParams,
    ) -> Result<(), ActorError> {
        check_peer_info(rt.policy(), &[], &params.new_multi_addrs)?;

        rt.transaction(|state: &mut State, rt| {
            let mut info = get_miner_info(rt.store(), state)?;

            rt.validate_immediate_caller_is(
                info.control_addresses.iter().chain(&[info.owner, info.worker]),
            )?;

            info.multi_address = params.new_multi_addrs;
            state.save_info(rt.store(), &info).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "could not save miner info")
            })?;

            Ok(())
        })?;
        Ok(())
    }

    /// Invoked by miner's worker address to submit their fallback post
    fn submit_windowed_post(
        rt: &impl Runtime,
        params: SubmitWindowedPoStParams,
    ) -> Result<(), ActorError> {
        let current_epoch = rt.curr_epoch();
        {
            let policy = rt.policy();
            if params.deadline >= policy.wpost_period_deadlines {
                return Err(actor_error!(
                    illegal_argument,
                    "invalid deadline {} of {}",
                    params.deadline,
                    policy.wpost_period_deadlines
                ));
            }

            // The chain commit must be in the past, but not too far back.
            if params.chain_commit_epoch >= current_epoch {
                return Err(actor_error!(
                    illegal_argument,
                    "PoSt chain commitment {} must be in the past",
                    params.chain_commit_epoch
                ));
            }

            if params.chain_commit_epoch < current_epoch - policy.wpost_max_chain_commit_age {
                return Err(actor_error!(
                    illegal_argument,
                    "PoSt chain commitment {} too far in the past, must be after {}",
                    params.chain_commit_epoch,
                    current_epoch - policy.wpost_max_chain_commit_age
                ));
            }
        }

        let comm_rand = rt.get_randomness_from_tickets(
            DomainSeparationTag::PoStChainCommit,
            params.chain_commit_epoch,
            &[],
        )?;
        if Randomness(comm_rand.into()) != params.chain_commit_rand {
            return Err(actor_error!(illegal_argument, "post commit randomness mismatched"));
        }

        let reward_stats = request_current_epoch_block_reward(rt)?;
        let power_total = request_current_total_power(rt)?;

        let (post_result, penalty_total, pledge_delta) =
            rt.transaction(|state: &mut State, rt| {
                let info = get_miner_info(rt.store(), state)?;

                rt.validate_immediate_caller_is(
                    info.control_addresses.iter().chain(&[info.worker, info.owner]),
                )?;

                let policy = rt.policy();
                let store = rt.store();

                // Validate that the miner didn't try to prove too many partitions at once.
                let submission_partition_limit =
                    load_partitions_sectors_max(policy, info.window_post_partition_sectors);
                if params.partitions.len() as u64 > submission_partition_limit {
                    return Err(actor_error!(
                        illegal_argument,
                        "too many partitions {}, limit {}",
                        params.partitions.len(),
                        submission_partition_limit
                    ));
                }

                let current_deadline = state.deadline_info(policy, current_epoch);

                // The miner may only submit a proof for the current deadline.
                if !current_deadline.is_open() {
                    return Err(actor_error!(
                        illegal_state,
                        "proving period {} not yet open at {}",
                        current_deadline.period_start,
                        current_epoch
                    ));
                }
                if params.deadline != current_deadline.index {
                    return Err(actor_error!(
                        illegal_argument,
                        "invalid deadline {} at epoch {}, expected {}",
                        params.deadline,
                        current_epoch,
                        current_deadline.index
                    ));
                }

                let sectors = Sectors::load(store, &state.sectors).map_err(|e| {
                    e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to load sectors")
                })?;

                let mut deadlines = state.load_deadlines(store)?;
                let mut deadline =
                    deadlines.load_deadline(policy, store, params.deadline).map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!("failed to load deadline {}", params.deadline),
                        )
                    })?;

                // Record proven sectors/partitions, returning updates to power and the final set of sectors
                // proven/skipped. The proof itself is checked below, and the deadline is only saved
                // if it verifies.
                let fault_expiration = current_deadline.last() + policy.fault_max_age;
                let post_result = deadline
                    .record_proven_sectors(
                        store,
                        &sectors,
                        info.sector_size,
                        current_deadline.quant_spec(),
                        fault_expiration,
                        &params.partitions,
                    )
                    .map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!(
                                "failed to process post submission for deadline {}",
                                params.deadline
                            ),
                        )
                    })?;

                // Known-faulty sectors are substituted with a known-good one.
                let sector_infos = state
                    .load_sector_infos_for_proof(
                        store,
                        &post_result.sectors,
                        &post_result.ignored_sectors,
                    )
                    .map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            "failed to load proven sector info",
                        )
                    })?;

                // Skip verification if all sectors are faults.
                // The call still succeeds so the miner can declare a whole partition as skipped.
                if !sector_infos.is_empty() {
                    verify_windowed_post(
                        rt,
                        current_deadline.challenge,
                        &sector_infos,
                        params.proofs.clone(),
                    )?;
                }

                // Skipped faults and retracted recoveries pay the undeclared fee now, less the
                // declared fee charged at deadline end. Recovered sectors pay the declared fee
                // for the faulty period that just closed.
                let penalty_power = post_result.penalty_power();
                let undeclared_penalty_target = pledge_penalty_for_undeclared_fault(
                    policy,
                    &reward_stats.this_epoch_reward_smoothed,
                    &power_total.quality_adj_power_smoothed,
                    &penalty_power.qa,
                ) - pledge_penalty_for_declared_fault(
                    policy,
                    &reward_stats.this_epoch_reward_smoothed,
                    &power_total.quality_adj_power_smoothed,
                    &penalty_power.qa,
                );
                let declared_penalty_target = pledge_penalty_for_declared_fault(
                    policy,
                    &reward_stats.this_epoch_reward_smoothed,
                    &power_total.quality_adj_power_smoothed,
                    &post_result.recovered_power.qa,
                );
                let penalty_target = undeclared_penalty_target + declared_penalty_target;

                let unlocked_balance =
                    state.get_unlocked_balance(&rt.current_balance()).map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            "failed to compute unlocked balance",
                        )
                    })?;
                let (penalty_from_vesting, penalty_from_balance) = state
                    .penalize_funds_in_priority_order(
                        store,
                        current_epoch,
                        &penalty_target,
                        &unlocked_balance,
                    )
                    .map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!("failed to unlock penalty for {:?}", penalty_power),
                        )
                    })?;
                let penalty_total = &penalty_from_vesting + penalty_from_balance;
                let pledge_delta = -penalty_from_vesting;

                deadlines.update_deadline(policy, store, params.deadline, &deadline).map_err(
                    |e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!("failed to update deadline {}", params.deadline),
                        )
                    },
                )?;

                state.save_deadlines(store, deadlines).map_err(|e| {
                    e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to save deadlines")
                })?;

                state
                    .check_balance_invariants(&rt.current_balance())
                    .map_err(balance_invariants_broken)?;

                Ok((post_result, penalty_total, pledge_delta))
            })?;

        // Restore power for recovered sectors. Remove power for new faults.
        request_update_power(rt, post_result.power_delta())?;
        // Burn penalties.
        burn_funds(rt, penalty_total)?;
        notify_pledge_changed(rt, &pledge_delta)?;

        Ok(())
    }

    /// Proposals must be posted on chain via sma.PublishStorageDeals before PreCommitSector.
    /// Optimization: PreCommitSector could contain a list of deals that are not published yet.
    fn pre_commit_sector(
        rt: &impl Runtime,
        params: PreCommitSectorParams,
    ) -> Result<(), ActorError> {
        let curr_epoch = rt.curr_epoch();
        let policy = rt.policy();

        if !can_pre_commit_seal_proof(policy, params.seal_proof) {
            return Err(actor_error!(
                illegal_argument,
                "unsupported seal proof type {:?}",
                params.seal_proof
            ));
        }
        if params.sector_number > MAX_SECTOR_NUMBER {
            return Err(actor_error!(
                illegal_argument,
                "sector number {} out of range 0..(2^63-1)",
                params.sector_number
            ));
        }
        if !is_sealed_sector(&params.sealed_cid) {
            return Err(actor_error!(illegal_argument, "sealed CID had wrong prefix"));
        }
        if params.seal_rand_epoch >= curr_epoch {
            return Err(actor_error!(
                illegal_argument,
                "seal challenge epoch {} must be before now {}",
                params.seal_rand_epoch,
                curr_epoch
            ));
        }

        let max_seal_duration =
            max_prove_commit_duration(policy, params.seal_proof).ok_or_else(|| {
                actor_error!(
                    illegal_argument,
                    "no max seal duration set for proof type: {:?}",
                    params.seal_proof
                )
            })?;
        let challenge_earliest = seal_challenge_earliest(policy, curr_epoch, max_seal_duration);
        if params.seal_rand_epoch < challenge_earliest {
            return Err(actor_error!(
                illegal_argument,
                "seal challenge epoch {} too old, must be after {}",
                params.seal_rand_epoch,
                challenge_earliest
            ));
        }

        // Require sector lifetime meets minimum by assuming activation happens at last epoch permitted for seal proof.
        // This could make sector maximum lifetime validation more lenient if the maximum sector limit isn't hit first.
        if params.expiration <= curr_epoch {
            return Err(actor_error!(
                illegal_argument,
                "sector expiration {} must be after now ({})",
                params.expiration,
                curr_epoch
            ));
        }

        if params.replace_capacity && params.deal_ids.is_empty() {
            return Err(actor_error!(
                illegal_argument,
                "cannot replace sector without committing deals"
            ));
        }
        if params.replace_sector_deadline >= policy.wpost_period_deadlines {
            return Err(actor_error!(
                illegal_argument,
                "invalid deadline {}",
                params.replace_sector_deadline
            ));
        }
        if params.replace_sector_number > MAX_SECTOR_NUMBER {
            return Err(actor_error!(
                illegal_argument,
                "invalid sector number {}",
                params.replace_sector_number
            ));
        }

        // gather information from other actors
        let reward_stats = request_current_epoch_block_reward(rt)?;
        let power_total = request_current_total_power(rt)?;
        let deal_weight = request_deal_weight(rt, &params.deal_ids, curr_epoch, params.expiration)?;

        let newly_vested = rt.transaction(|state: &mut State, rt| {
            let info = get_miner_info(rt.store(), state)?;

            rt.validate_immediate_caller_is(
                info.control_addresses.iter().chain(&[info.worker, info.owner]),
            )?;

            let policy = rt.policy();
            let store = rt.store();

            if params.seal_proof != info.seal_proof_type {
                return Err(actor_error!(
                    illegal_argument,
                    "sector seal proof {:?} must match miner seal proof type {:?}",
                    params.seal_proof,
                    info.seal_proof_type
                ));
            }

            let deal_count_max = sector_deals_max(policy, info.sector_size);
            if params.deal_ids.len() as u64 > deal_count_max {
                return Err(actor_error!(
                    illegal_argument,
                    "too many deals for sector {} > {}",
                    params.deal_ids.len(),
                    deal_count_max
                ));
            }

            state.allocate_sector_number(store, params.sector_number)?;

            let pre_committed = state
                .get_precommitted_sector(store, params.sector_number)
                .map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        format!("failed to check pre-commit {}", params.sector_number),
                    )
                })?;
            if pre_committed.is_some() {
                return Err(actor_error!(
                    illegal_state,
                    "sector {} already pre-committed",
                    params.sector_number
                ));
            }

            let sector_found =
                state.has_sector_number(store, params.sector_number).map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        format!("failed to check sector {}", params.sector_number),
                    )
                })?;
            if sector_found {
                return Err(actor_error!(
                    illegal_state,
                    "sector {} already committed",
                    params.sector_number
                ));
            }

            validate_expiration(
                rt,
                curr_epoch + max_seal_duration,
                params.expiration,
                params.seal_proof,
            )?;

            let mut deposit_minimum = TokenAmount::zero();
            if params.replace_capacity {
                let replace_sector = validate_replace_sector(policy, store, state, &params)?;
                // Note the replaced sector's initial pledge as a lower bound for the new sector's deposit
                deposit_minimum = replace_sector.initial_pledge;
            }

            let newly_vested = state
                .unlock_vested_funds(store, curr_epoch)
                .map_err(|e| {
                    e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to vest funds")
                })?;
            let available_balance =
                state.get_available_balance(&rt.current_balance()).map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        "failed to calculate available balance",
                    )
                })?;

            let duration = params.expiration - curr_epoch;
            let sector_weight = qa_power_for_weight(
                info.sector_size,
                duration,
                &deal_weight.deal_weight,
                &deal_weight.verified_deal_weight,
            );
            let deposit_req = cmp::max(
                pre_commit_deposit_for_power(
                    policy,
                    &reward_stats.this_epoch_reward_smoothed,
                    &power_total.quality_adj_power_smoothed,
                    &sector_weight,
                ),
                deposit_minimum,
            );
            if available_balance < deposit_req {
                return Err(actor_error!(
                    insufficient_funds,
                    "insufficient funds for pre-commit deposit: {}",
                    deposit_req
                ));
            }

            state.add_pre_commit_deposit(&deposit_req).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to add pre-commit deposit")
            })?;
            state
                .check_balance_invariants(&rt.current_balance())
                .map_err(balance_invariants_broken)?;

            let sector_number = params.sector_number;
            state
                .put_precommitted_sector(
                    store,
                    SectorPreCommitOnChainInfo {
                        info: params,
                        pre_commit_deposit: deposit_req,
                        pre_commit_epoch: curr_epoch,
                        deal_weight: deal_weight.deal_weight,
                        verified_deal_weight: deal_weight.verified_deal_weight,
                    },
                )
                .map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        format!("failed to write pre-committed sector {}", sector_number),
                    )
                })?;

            // add precommit expiry to the queue
            let expiry_bound = curr_epoch + max_seal_duration + 1;
            state.add_pre_commit_expiry(policy, store, expiry_bound, sector_number).map_err(
                |e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        "failed to add pre-commit expiry to queue",
                    )
                },
            )?;

            Ok(newly_vested)
        })?;

        notify_pledge_changed(rt, &-newly_vested)?;
        Ok(())
    }

    /// Checks state of the corresponding sector pre-commitment, then schedules the proof to be verified in bulk
    /// by the power actor.
    /// If valid, the power actor will call ConfirmSectorProofsValid at the end of the same epoch as this message.
    fn prove_commit_sector(
        rt: &impl Runtime,
        params: ProveCommitSectorParams,
    ) -> Result<(), ActorError> {
        rt.validate_immediate_caller_accept_any()?;

        let state: State = rt.state()?;

        // Locked funds must cover the initial pledge requirement. Vesting is not recomputed here,
        // it is at most one proving period stale.
        let meets_pledge =
            state.meets_initial_pledge_condition(&rt.current_balance()).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to check pledge")
            })?;
        if !meets_pledge {
            return Err(actor_error!(
                insufficient_funds,
                "unlocked balance does not cover initial pledge requirement {}",
                state.initial_pledge_requirement
            ));
        }

        let sector_number = params.sector_number;
        let precommit = state
            .get_precommitted_sector(rt.store(), sector_number)
            .map_err(|e| {
                e.downcast_default(
                    ExitCode::USR_ILLEGAL_STATE,
                    format!("failed to load pre-committed sector {}", sector_number),
                )
            })?
            .ok_or_else(|| actor_error!(not_found, "no pre-committed sector {}", sector_number))?;

        let max_seal_duration = max_prove_commit_duration(rt.policy(), precommit.info.seal_proof)
            .ok_or_else(|| {
                actor_error!(
                    illegal_state,
                    "no max seal duration for proof type: {:?}",
                    precommit.info.seal_proof
                )
            })?;
        let prove_commit_due = precommit.pre_commit_epoch + max_seal_duration;
        if rt.curr_epoch() > prove_commit_due {
            return Err(actor_error!(
                illegal_argument,
                "commitment proof for {} too late at {}, due {}",
                sector_number,
                rt.curr_epoch(),
                prove_commit_due
            ));
        }

        let svi = get_verify_info(
            rt,
            SealVerifyParams {
                sealed_cid: precommit.info.sealed_cid,
                interactive_epoch: precommit.pre_commit_epoch
                    + rt.policy().pre_commit_challenge_delay,
                seal_rand_epoch: precommit.info.seal_rand_epoch,
                proof: params.proof.into(),
                deal_ids: precommit.info.deal_ids.clone(),
                sector_number: precommit.info.sector_number,
                registered_seal_proof: precommit.info.seal_proof,
                max_seal_duration,
            },
        )?;

        extract_send_result(rt.send(
            &STORAGE_POWER_ACTOR_ADDR,
            ext::power::SUBMIT_POREP_FOR_BULK_VERIFY_METHOD,
            IpldBlock::serialize_cbor(&svi)?,
            TokenAmount::zero(),
        ))
        .map_err(|e| e.wrap("failed to submit proof for bulk verification"))?;

        Ok(())
    }

    fn confirm_sector_proofs_valid(
        rt: &impl Runtime,
        params: ConfirmSectorProofsParams,
    ) -> Result<(), ActorError> {
        rt.validate_immediate_caller_is(std::iter::once(&STORAGE_POWER_ACTOR_ADDR))?;

        // get network stats from other actors
        let reward_stats = request_current_epoch_block_reward(rt)?;
        let power_total = request_current_total_power(rt)?;
        let circulating_supply = rt.total_fil_circ_supply();

        let state: State = rt.state()?;
        let info = get_miner_info(rt.store(), &state)?;

        // This skips missing pre-commits.
        let precommitted_sectors =
            state.find_precommitted_sectors(rt.store(), &params.sectors).map_err(|e| {
                e.downcast_default(
                    ExitCode::USR_ILLEGAL_STATE,
                    "failed to load pre-committed sectors",
                )
            })?;

        // Committed-capacity sectors licensed for early removal by new sectors being proven.
        let mut replace_sectors = DeadlineSectorMap::new();
        // Pre-commits for new sectors.
        let mut pre_commits = Vec::<SectorPreCommitOnChainInfo>::new();

        for precommit in precommitted_sectors {
            if !precommit.info.deal_ids.is_empty() {
                // Check (and activate) storage deals associated to sector. Drop the sector if
                // activation fails.
                let res = extract_send_result(rt.send(
                    &STORAGE_MARKET_ACTOR_ADDR,
                    ext::market::ACTIVATE_DEALS_METHOD,
                    IpldBlock::serialize_cbor(&ext::market::ActivateDealsParams {
                        deal_ids: precommit.info.deal_ids.clone(),
                        sector_expiry: precommit.info.expiration,
                    })?,
                    TokenAmount::zero(),
                ));
                if let Err(e) = res {
                    info!(
                        "failed to activate deals on sector {}, dropping from prove commit set: {}",
                        precommit.info.sector_number,
                        e.msg()
                    );
                    continue;
                }
            }

            if precommit.info.replace_capacity {
                replace_sectors
                    .add_values(
                        rt.policy(),
                        precommit.info.replace_sector_deadline,
                        precommit.info.replace_sector_partition,
                        &[precommit.info.replace_sector_number],
                    )
                    .map_err(|e| {
                        actor_error!(
                            illegal_argument,
                            "failed to record sectors for replacement: {}",
                            e
                        )
                    })?;
            }

            pre_commits.push(precommit);
        }

        // When all prove commits have failed abort early
        if pre_commits.is_empty() {
            return Err(actor_error!(illegal_argument, "all prove commits failed to validate"));
        }

        let (new_power, total_pledge, newly_vested) = rt.transaction(|state: &mut State, rt| {
            let policy = rt.policy();
            let store = rt.store();
            let activation = rt.curr_epoch();

            // Schedule expiration for replaced sectors to the end of their next deadline window.
            // They can't be removed right now because we want to challenge them immediately before termination.
            state
                .reschedule_sector_expirations(
                    policy,
                    store,
                    activation,
                    info.sector_size,
                    &replace_sectors,
                )
                .map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        "failed to replace sector expirations",
                    )
                })?;

            let mut new_sector_numbers = Vec::<SectorNumber>::with_capacity(pre_commits.len());
            let mut new_sectors = Vec::<SectorOnChainInfo>::with_capacity(pre_commits.len());
            let mut total_pledge = TokenAmount::zero();
            let mut deposit_to_unlock = TokenAmount::zero();

            for precommit in pre_commits {
                let duration = precommit.info.expiration - activation;

                // This should have been caught in precommit, but don't let other sectors fail because of it.
                if duration < policy.min_sector_expiration {
                    warn!(
                        "precommit {} has lifetime {} less than minimum {}. ignoring",
                        precommit.info.sector_number, duration, policy.min_sector_expiration
                    );
                    continue;
                }

                let power = qa_power_for_weight(
                    info.sector_size,
                    duration,
                    &precommit.deal_weight,
                    &precommit.verified_deal_weight,
                );
                let day_reward = expected_reward_for_power(
                    &reward_stats.this_epoch_reward_smoothed,
                    &power_total.quality_adj_power_smoothed,
                    &power,
                    EPOCHS_IN_DAY,
                );
                // The storage pledge is recorded for use in computing the penalty if this sector is terminated
                // before its declared expiration.
                let storage_pledge = expected_reward_for_power(
                    &reward_stats.this_epoch_reward_smoothed,
                    &power_total.quality_adj_power_smoothed,
                    &power,
                    policy.initial_pledge_projection_period,
                );
                let initial_pledge = initial_pledge_for_power(
                    policy,
                    &power,
                    &reward_stats.this_epoch_baseline_power,
                    &reward_stats.this_epoch_reward_smoothed,
                    &power_total.quality_adj_power_smoothed,
                    &circulating_supply,
                );

                total_pledge += &initial_pledge;
                deposit_to_unlock += &precommit.pre_commit_deposit;

                new_sector_numbers.push(precommit.info.sector_number);
                new_sectors.push(SectorOnChainInfo {
                    sector_number: precommit.info.sector_number,
                    seal_proof: precommit.info.seal_proof,
                    sealed_cid: precommit.info.sealed_cid,
                    deal_ids: precommit.info.deal_ids,
                    activation,
                    expiration: precommit.info.expiration,
                    deal_weight: precommit.deal_weight,
                    verified_deal_weight: precommit.verified_deal_weight,
                    initial_pledge,
                    expected_day_reward: day_reward,
                    expected_storage_pledge: storage_pledge,
                });
            }

            state.put_sectors(store, new_sectors.clone()).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to put new sectors")
            })?;

            state.delete_precommitted_sectors(store, &new_sector_numbers).map_err(|e| {
                e.downcast_default(
                    ExitCode::USR_ILLEGAL_STATE,
                    "failed to delete precommited sectors",
                )
            })?;

            let new_power = state
                .assign_sectors_to_deadlines(
                    policy,
                    store,
                    activation,
                    new_sectors,
                    info.window_post_partition_sectors,
                    info.sector_size,
                )
                .map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        "failed to assign new sectors to deadlines",
                    )
                })?;

            // Add sector and pledge lock-up to miner state
            let newly_vested = state
                .unlock_vested_funds(store, activation)
                .map_err(|e| {
                    e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to vest new funds")
                })?;

            // Unlock deposit for successful proofs, make it available for lock-up as initial pledge.
            state.add_pre_commit_deposit(&-deposit_to_unlock).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to add pre-commit deposit")
            })?;

            let available_balance =
                state.get_available_balance(&rt.current_balance()).map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        "failed to calculate available balance",
                    )
                })?;
            if available_balance < total_pledge {
                return Err(actor_error!(
                    insufficient_funds,
                    "insufficient funds for aggregate initial pledge requirement {}, available: {}",
                    total_pledge,
                    available_balance
                ));
            }

            state.add_initial_pledge_requirement(&total_pledge).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to add initial pledge")
            })?;

            state
                .check_balance_invariants(&rt.current_balance())
                .map_err(balance_invariants_broken)?;

            Ok((new_power, total_pledge, newly_vested))
        })?;

        // Request power and pledge update for activated sector.
        request_update_power(rt, new_power)?;
        notify_pledge_changed(rt, &(total_pledge - newly_vested))?;

        Ok(())
    }

    fn check_sector_proven(
        rt: &impl Runtime,
        params: CheckSectorProvenParams,
    ) -> Result<(), ActorError> {
        rt.validate_immediate_caller_accept_any()?;

        let st: State = rt.state()?;
        let sector_number = params.sector_number;

        match st.get_sector(rt.store(), sector_number) {
            Err(e) => Err(actor_error!(
                illegal_state,
                "failed to load proven sector {}: {}",
                sector_number,
                e
            )),
            Ok(None) => Err(actor_error!(not_found, "sector {} not proven", sector_number)),
            Ok(Some(_sector)) => Ok(()),
        }
    }

    /// Changes the expiration epoch for a sector to a new, later one.
    /// The sector must not be terminated or faulty.
    /// The sector's power is recomputed for the new expiration.
    fn extend_sector_expiration(
        rt: &impl Runtime,
        params: ExtendSectorExpirationParams,
    ) -> Result<(), ActorError> {
        {
            let policy = rt.policy();
            if params.extensions.len() as u64 > policy.declarations_max {
                return Err(actor_error!(
                    illegal_argument,
                    "too many declarations {}, max {}",
                    params.extensions.len(),
                    policy.declarations_max
                ));
            }

            // limit the number of sectors declared at once
            let mut sector_count: u64 = 0;
            for decl in &params.extensions {
                if decl.deadline >= policy.wpost_period_deadlines {
                    return Err(actor_error!(
                        illegal_argument,
                        "deadline {} not in range 0..{}",
                        decl.deadline,
                        policy.wpost_period_deadlines
                    ));
                }

                sector_count = sector_count.checked_add(decl.sectors.len()).ok_or_else(|| {
                    actor_error!(illegal_argument, "sector count overflow in extension")
                })?;
            }

            if sector_count > policy.addressed_sectors_max {
                return Err(actor_error!(
                    illegal_argument,
                    "too many sectors for declaration {}, max {}",
                    sector_count,
                    policy.addressed_sectors_max
                ));
            }
        }

        let (power_delta, pledge_delta) = rt.transaction(|state: &mut State, rt| {
            let info = get_miner_info(rt.store(), state)?;

            rt.validate_immediate_caller_is(
                info.control_addresses.iter().chain(&[info.worker, info.owner]),
            )?;

            let policy = rt.policy();
            let store = rt.store();

            let mut deadlines = state.load_deadlines(store)?;

            // Group declarations by deadline, and remember iteration order.
            let mut decls_by_deadline = BTreeMap::<u64, Vec<&ExpirationExtension>>::new();
            let mut deadlines_to_load = Vec::<u64>::new();
            for decl in &params.extensions {
                decls_by_deadline
                    .entry(decl.deadline)
                    .or_insert_with(|| {
                        deadlines_to_load.push(decl.deadline);
                        Vec::new()
                    })
                    .push(decl);
            }

            let mut sectors = Sectors::load(store, &state.sectors).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to load sectors array")
            })?;

            let mut power_delta = PowerPair::zero();
            let mut pledge_delta = TokenAmount::zero();

            for deadline_idx in deadlines_to_load {
                let mut deadline =
                    deadlines.load_deadline(policy, store, deadline_idx).map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!("failed to load deadline {}", deadline_idx),
                        )
                    })?;

                let mut partitions = deadline.partitions_amt(store).map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        format!("failed to load partitions for deadline {}", deadline_idx),
                    )
                })?;

                let quant = state.quant_spec_for_deadline(policy, deadline_idx);

                for decl in decls_by_deadline.get(&deadline_idx).into_iter().flatten() {
                    let mut partition = partitions
                        .get(decl.partition)
                        .map_err(|e| {
                            e.downcast_default(
                                ExitCode::USR_ILLEGAL_STATE,
                                format!(
                                    "failed to load deadline {} partition {}",
                                    deadline_idx, decl.partition
                                ),
                            )
                        })?
                        .cloned()
                        .ok_or_else(|| {
                            actor_error!(
                                not_found,
                                "no such deadline {} partition {}",
                                deadline_idx,
                                decl.partition
                            )
                        })?;

                    let old_sectors = sectors.load_sector(&decl.sectors)?;
                    let mut new_sectors = Vec::with_capacity(old_sectors.len());
                    for sector in &old_sectors {
                        if decl.new_expiration < sector.expiration {
                            return Err(actor_error!(
                                illegal_argument,
                                "cannot reduce sector {} expiration to {} from {}",
                                sector.sector_number,
                                decl.new_expiration,
                                sector.expiration
                            ));
                        }
                        validate_expiration(
                            rt,
                            sector.activation,
                            decl.new_expiration,
                            sector.seal_proof,
                        )?;

                        let mut new_sector = sector.clone();
                        new_sector.expiration = decl.new_expiration;
                        new_sectors.push(new_sector);
                    }

                    // Overwrite sector infos.
                    sectors.store(new_sectors.clone()).map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!("failed to update sectors {:?}", decl.sectors),
                        )
                    })?;

                    // Remove old sectors from partition and assign new sectors.
                    let (partition_power_delta, partition_pledge_delta) = partition
                        .replace_sectors(store, &old_sectors, &new_sectors, info.sector_size, quant)
                        .map_err(|e| {
                            e.downcast_default(
                                ExitCode::USR_ILLEGAL_STATE,
                                format!("failed to replace sector expirations at {}", deadline_idx),
                            )
                        })?;

                    power_delta += &partition_power_delta;
                    // Expected to be zero, pledge is not recomputed on extension.
                    pledge_delta += partition_pledge_delta;

                    partitions.set(decl.partition, partition).map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!(
                                "failed to save deadline {} partition {}",
                                deadline_idx, decl.partition
                            ),
                        )
                    })?;
                }

                deadline.partitions = partitions.flush().map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        format!("failed to save partitions for deadline {}", deadline_idx),
                    )
                })?;

                deadlines.update_deadline(policy, store, deadline_idx, &deadline).map_err(
                    |e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!("failed to save deadline {}", deadline_idx),
                        )
                    },
                )?;
            }

            state.sectors = sectors.amt.flush().map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to save sectors")
            })?;
            state.save_deadlines(store, deadlines).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to save deadlines")
            })?;

            Ok((power_delta, pledge_delta))
        })?;

        request_update_power(rt, power_delta)?;
        notify_pledge_changed(rt, &pledge_delta)?;

        Ok(())
    }

    /// Marks some sectors as terminated at the present epoch, earlier than their
    /// scheduled termination, and adds these sectors to the early termination queue.
    /// This method then processes up to AddressedSectorsMax sectors and
    /// AddressedPartitionsMax partitions from the early termination queue,
    /// releasing any pledge collateral owed to the power actor, and
    /// notifying the market actor of terminated deals.
    ///
    /// If there are more sectors than the limit in the queue, a cron callback is
    /// scheduled to process the rest, and `done` is false in the return value.
    fn terminate_sectors(
        rt: &impl Runtime,
        params: TerminateSectorsParams,
    ) -> Result<TerminateSectorsReturn, ActorError> {
        // Note: this cannot terminate pre-committed but un-proven sectors.
        // They must be allowed to expire (and deposit burnt).

        let mut to_process = DeadlineSectorMap::new();

        for term in params.terminations {
            let deadline = term.deadline;
            let partition = term.partition;

            to_process.add(rt.policy(), deadline, partition, &term.sectors).map_err(|e| {
                actor_error!(
                    illegal_argument,
                    "failed to process deadline {}, partition {}: {}",
                    deadline,
                    partition,
                    e
                )
            })?;
        }

        {
            let policy = rt.policy();
            to_process
                .check(policy.addressed_partitions_max, policy.addressed_sectors_max)
                .map_err(|e| {
                    actor_error!(illegal_argument, "cannot process requested parameters: {}", e)
                })?;
        }

        let (had_early_terminations, power_delta) = rt.transaction(|state: &mut State, rt| {
            let had_early_terminations = have_pending_early_terminations(state);

            let info = get_miner_info(rt.store(), state)?;

            rt.validate_immediate_caller_is(
                info.control_addresses.iter().chain(&[info.worker, info.owner]),
            )?;

            let policy = rt.policy();
            let store = rt.store();
            let curr_epoch = rt.curr_epoch();
            let mut power_delta = PowerPair::zero();

            let mut deadlines = state.load_deadlines(store)?;

            // We're only reading the sectors, so there's no need to save this back.
            // However, we still want to avoid re-loading this array per-partition.
            let sectors = Sectors::load(store, &state.sectors).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to load sectors")
            })?;

            for (deadline_idx, partition_sectors) in to_process.iter() {
                let quant = state.quant_spec_for_deadline(policy, deadline_idx);
                let mut deadline =
                    deadlines.load_deadline(policy, store, deadline_idx).map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!("failed to load deadline {}", deadline_idx),
                        )
                    })?;

                let removed_power = deadline
                    .terminate_sectors(
                        store,
                        &sectors,
                        curr_epoch,
                        partition_sectors,
                        info.sector_size,
                        quant,
                    )
                    .map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!("failed to terminate sectors in deadline {}", deadline_idx),
                        )
                    })?;

                state.early_terminations.set(deadline_idx);
                power_delta -= &removed_power;

                deadlines.update_deadline(policy, store, deadline_idx, &deadline).map_err(
                    |e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!("failed to update deadline {}", deadline_idx),
                        )
                    },
                )?;
            }

            state.save_deadlines(store, deadlines).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to save deadlines")
            })?;

            state
                .check_balance_invariants(&rt.current_balance())
                .map_err(balance_invariants_broken)?;

            Ok((had_early_terminations, power_delta))
        })?;

        // Now, try to process these sectors.
        let more = process_early_terminations(rt)?;
        if more && !had_early_terminations {
            // We have remaining terminations, and we didn't _previously_
            // have early terminations to process, schedule a cron job.
            // NOTE: This isn't quite correct. If we repeatedly fill, empty,
            // fill, and empty, the queue, we'll keep scheduling new cron
            // jobs. However, in practice, that shouldn't be all that bad.
            schedule_early_termination_work(rt)?;
        }

        request_update_power(rt, power_delta)?;
        Ok(TerminateSectorsReturn { done: !more })
    }

    fn declare_faults(rt: &impl Runtime, params: DeclareFaultsParams) -> Result<(), ActorError> {
        {
            let policy = rt.policy();
            if params.faults.len() as u64 > policy.declarations_max {
                return Err(actor_error!(
                    illegal_argument,
                    "too many fault declarations for a single message: {} > {}",
                    params.faults.len(),
                    policy.declarations_max
                ));
            }
        }

        let mut to_process = DeadlineSectorMap::new();

        for term in params.faults {
            let deadline = term.deadline;
            let partition = term.partition;

            to_process.add(rt.policy(), deadline, partition, &term.sectors).map_err(|e| {
                actor_error!(
                    illegal_argument,
                    "failed to process deadline {}, partition {}: {}",
                    deadline,
                    partition,
                    e
                )
            })?;
        }

        {
            let policy = rt.policy();
            to_process
                .check(policy.addressed_partitions_max, policy.addressed_sectors_max)
                .map_err(|e| {
                    actor_error!(illegal_argument, "cannot process requested parameters: {}", e)
                })?;
        }

        let new_fault_power_total = rt.transaction(|state: &mut State, rt| {
            let info = get_miner_info(rt.store(), state)?;

            rt.validate_immediate_caller_is(
                info.control_addresses.iter().chain(&[info.worker, info.owner]),
            )?;

            let policy = rt.policy();
            let store = rt.store();
            let curr_epoch = rt.curr_epoch();

            let mut deadlines = state.load_deadlines(store)?;

            let sectors = Sectors::load(store, &state.sectors).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to load sectors array")
            })?;

            let mut new_fault_power_total = PowerPair::zero();
            for (deadline_idx, partition_map) in to_process.iter() {
                let target_deadline = declaration_deadline_info(
                    policy,
                    state.proving_period_start,
                    deadline_idx,
                    curr_epoch,
                )
                .map_err(|e| {
                    actor_error!(
                        illegal_argument,
                        "invalid fault declaration deadline {}: {}",
                        deadline_idx,
                        e
                    )
                })?;

                validate_fr_declaration_deadline(&target_deadline).map_err(|e| {
                    actor_error!(
                        illegal_argument,
                        "failed fault declaration at deadline {}: {}",
                        deadline_idx,
                        e
                    )
                })?;

                let mut deadline =
                    deadlines.load_deadline(policy, store, deadline_idx).map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!("failed to load deadline {}", deadline_idx),
                        )
                    })?;

                let fault_expiration_epoch = target_deadline.last() + policy.fault_max_age;

                let deadline_power_delta = deadline
                    .record_faults(
                        store,
                        &sectors,
                        info.sector_size,
                        target_deadline.quant_spec(),
                        fault_expiration_epoch,
                        partition_map,
                    )
                    .map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!("failed to declare faults for deadline {}", deadline_idx),
                        )
                    })?;

                deadlines.update_deadline(policy, store, deadline_idx, &deadline).map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        format!("failed to store deadline {} partitions", deadline_idx),
                    )
                })?;

                new_fault_power_total += &deadline_power_delta;
            }

            state.save_deadlines(store, deadlines).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to save deadlines")
            })?;

            state
                .check_balance_invariants(&rt.current_balance())
                .map_err(balance_invariants_broken)?;

            Ok(new_fault_power_total)
        })?;

        // Remove power for new faulty sectors.
        // Payment of penalty for declared faults is deferred to the deadline cron.
        request_update_power(rt, -new_fault_power_total)?;

        Ok(())
    }

    fn declare_faults_recovered(
        rt: &impl Runtime,
        params: DeclareFaultsRecoveredParams,
    ) -> Result<(), ActorError> {
        {
            let policy = rt.policy();
            if params.recoveries.len() as u64 > policy.declarations_max {
                return Err(actor_error!(
                    illegal_argument,
                    "too many recovery declarations for a single message: {} > {}",
                    params.recoveries.len(),
                    policy.declarations_max
                ));
            }
        }

        let mut to_process = DeadlineSectorMap::new();

        for term in params.recoveries {
            let deadline = term.deadline;
            let partition = term.partition;

            to_process.add(rt.policy(), deadline, partition, &term.sectors).map_err(|e| {
                actor_error!(
                    illegal_argument,
                    "failed to process deadline {}, partition {}: {}",
                    deadline,
                    partition,
                    e
                )
            })?;
        }

        {
            let policy = rt.policy();
            to_process
                .check(policy.addressed_partitions_max, policy.addressed_sectors_max)
                .map_err(|e| {
                    actor_error!(illegal_argument, "cannot process requested parameters: {}", e)
                })?;
        }

        rt.transaction(|state: &mut State, rt| {
            let info = get_miner_info(rt.store(), state)?;

            rt.validate_immediate_caller_is(
                info.control_addresses.iter().chain(&[info.worker, info.owner]),
            )?;

            let policy = rt.policy();
            let store = rt.store();
            let curr_epoch = rt.curr_epoch();

            let mut deadlines = state.load_deadlines(store)?;

            let sectors = Sectors::load(store, &state.sectors).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to load sectors array")
            })?;

            for (deadline_idx, partition_map) in to_process.iter() {
                let target_deadline = declaration_deadline_info(
                    policy,
                    state.proving_period_start,
                    deadline_idx,
                    curr_epoch,
                )
                .map_err(|e| {
                    actor_error!(
                        illegal_argument,
                        "invalid recovery declaration deadline {}: {}",
                        deadline_idx,
                        e
                    )
                })?;

                validate_fr_declaration_deadline(&target_deadline).map_err(|e| {
                    actor_error!(
                        illegal_argument,
                        "failed recovery declaration at deadline {}: {}",
                        deadline_idx,
                        e
                    )
                })?;

                let mut deadline =
                    deadlines.load_deadline(policy, store, deadline_idx).map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!("failed to load deadline {}", deadline_idx),
                        )
                    })?;

                deadline
                    .declare_faults_recovered(store, &sectors, info.sector_size, partition_map)
                    .map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!("failed to declare recoveries for deadline {}", deadline_idx),
                        )
                    })?;

                deadlines.update_deadline(policy, store, deadline_idx, &deadline).map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        format!("failed to store deadline {}", deadline_idx),
                    )
                })?;
            }

            state.save_deadlines(store, deadlines).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to save deadlines")
            })?;

            Ok(())
        })?;

        // Power is not restored yet, but when the recovered sectors are successfully PoSted.
        Ok(())
    }

    fn compact_sector_numbers(
        rt: &impl Runtime,
        params: CompactSectorNumbersParams,
    ) -> Result<(), ActorError> {
        let last_sector_number = params
            .mask_sector_numbers
            .last()
            .ok_or_else(|| actor_error!(illegal_argument, "invalid mask bitfield"))?;

        if last_sector_number > MAX_SECTOR_NUMBER {
            return Err(actor_error!(
                illegal_argument,
                "masked sector number {} exceeded max sector number",
                last_sector_number
            ));
        }

        rt.transaction(|state: &mut State, rt| {
            let info = get_miner_info(rt.store(), state)?;

            rt.validate_immediate_caller_is(
                info.control_addresses.iter().chain(&[info.worker, info.owner]),
            )?;

            state.mask_sector_numbers(rt.store(), &params.mask_sector_numbers)
        })?;

        Ok(())
    }

    /// Locks up some amount of the miner's unlocked balance (including funds received alongside the invoking message).
    fn add_locked_fund(rt: &impl Runtime, params: AddLockedFundParams) -> Result<(), ActorError> {
        let amount_to_lock = params.amount;
        if amount_to_lock.is_negative() {
            return Err(actor_error!(
                illegal_argument,
                "cannot lock up a negative amount of funds"
            ));
        }

        let newly_vested = rt.transaction(|state: &mut State, rt| {
            let info = get_miner_info(rt.store(), state)?;

            rt.validate_immediate_caller_is(
                info.control_addresses
                    .iter()
                    .chain(&[info.owner, info.worker, REWARD_ACTOR_ADDR]),
            )?;

            // This may lock up unlocked balance that was covering the initial pledge requirement.
            let unlocked_balance =
                state.get_unlocked_balance(&rt.current_balance()).map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        "failed to compute unlocked balance",
                    )
                })?;
            if unlocked_balance < amount_to_lock {
                return Err(actor_error!(
                    insufficient_funds,
                    "insufficient funds to lock, available: {}, requested: {}",
                    unlocked_balance,
                    amount_to_lock
                ));
            }

            let newly_vested = state
                .add_locked_funds(
                    rt.store(),
                    rt.curr_epoch(),
                    &amount_to_lock,
                    &rt.policy().reward_vesting_spec,
                )
                .map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        "failed to lock funds in vesting table",
                    )
                })?;

            state
                .check_balance_invariants(&rt.current_balance())
                .map_err(balance_invariants_broken)?;
            Ok(newly_vested)
        })?;

        notify_pledge_changed(rt, &(amount_to_lock - newly_vested))?;
        Ok(())
    }

    fn report_consensus_fault(
        rt: &impl Runtime,
        params: ReportConsensusFaultParams,
    ) -> Result<(), ActorError> {
        // Note: only the first reporter of any fault is rewarded.
        // Subsequent invocations fail because the target miner has been removed.
        rt.validate_immediate_caller_type(CALLER_TYPES_SIGNABLE.iter())?;
        let reporter = rt.message().caller();

        let fault = rt
            .verify_consensus_fault(&params.header1, &params.header2, &params.header_extra)
            .map_err(|e| e.downcast_default(ExitCode::USR_ILLEGAL_ARGUMENT, "fault not verified"))?
            .ok_or_else(|| actor_error!(illegal_argument, "No consensus fault found"))?;
        if fault.target != rt.message().receiver() {
            return Err(actor_error!(
                illegal_argument,
                "fault by {} reported to miner {}",
                fault.target,
                rt.message().receiver()
            ));
        }

        // Elapsed since the fault (i.e. since the higher of the two blocks)
        let fault_age = rt.curr_epoch() - fault.epoch;
        if fault_age <= 0 {
            return Err(actor_error!(
                illegal_argument,
                "invalid fault epoch {} ahead of current {}",
                fault.epoch,
                rt.curr_epoch()
            ));
        }

        // Reward reporter with a share of the miner's current balance.
        let slasher_reward =
            reward_for_consensus_slash_report(rt.policy(), fault_age, &rt.current_balance());
        extract_send_result(rt.send(&reporter, METHOD_SEND, None, slasher_reward))
            .map_err(|e| e.wrap("failed to reward reporter"))?;

        let state: State = rt.state()?;

        // Notify power actor with lock-up total being removed.
        extract_send_result(rt.send(
            &STORAGE_POWER_ACTOR_ADDR,
            ext::power::ON_CONSENSUS_FAULT_METHOD,
            IpldBlock::serialize_cbor(&state.locked_funds)?,
            TokenAmount::zero(),
        ))
        .map_err(|e| e.wrap("failed to notify power actor on consensus fault"))?;

        // close deals and burn funds
        terminate_miner(rt, &state)
    }

    fn withdraw_balance(
        rt: &impl Runtime,
        params: WithdrawBalanceParams,
    ) -> Result<WithdrawBalanceReturn, ActorError> {
        if params.amount_requested.is_negative() {
            return Err(actor_error!(
                illegal_argument,
                "negative fund requested for withdrawal: {}",
                params.amount_requested
            ));
        }

        let (info, newly_vested, amount_withdrawn) = rt.transaction(|state: &mut State, rt| {
            let info = get_miner_info(rt.store(), state)?;

            // Only the owner is allowed to withdraw the balance as it belongs to/is controlled by the owner
            // and not the worker.
            rt.validate_immediate_caller_is(std::iter::once(&info.owner))?;

            // Ensure we don't have any pending terminations.
            if have_pending_early_terminations(state) {
                return Err(actor_error!(
                    forbidden,
                    "cannot withdraw funds while {} deadlines have terminated sectors with outstanding fees",
                    state.early_terminations.len()
                ));
            }

            // Unlock vested funds so we can spend them.
            let newly_vested =
                state.unlock_vested_funds(rt.store(), rt.curr_epoch()).map_err(|e| {
                    e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to vest fund")
                })?;

            let available_balance =
                state.get_available_balance(&rt.current_balance()).map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        "failed to calculate available balance",
                    )
                })?;
            if available_balance.is_negative() {
                return Err(actor_error!(
                    insufficient_funds,
                    "available balance {} is negative, initial pledge requirement not met",
                    available_balance
                ));
            }

            let amount_withdrawn = cmp::min(&available_balance, &params.amount_requested).clone();

            Ok((info, newly_vested, amount_withdrawn))
        })?;

        if amount_withdrawn.is_positive() {
            extract_send_result(rt.send(
                &info.owner,
                METHOD_SEND,
                None,
                amount_withdrawn.clone(),
            ))?;
        }

        notify_pledge_changed(rt, &-newly_vested)?;

        let state: State = rt.state()?;
        state.check_balance_invariants(&rt.current_balance()).map_err(balance_invariants_broken)?;

        Ok(WithdrawBalanceReturn { amount_withdrawn })
    }

    fn on_deferred_cron_event(
        rt: &impl Runtime,
        payload: CronEventPayload,
    ) -> Result<(), ActorError> {
        rt.validate_immediate_caller_is(std::iter::once(&STORAGE_POWER_ACTOR_ADDR))?;

        match payload.event_type {
            CRON_EVENT_PROVING_DEADLINE => handle_proving_deadline(rt)?,
            CRON_EVENT_WORKER_KEY_CHANGE => commit_worker_key_change(rt)?,
            CRON_EVENT_PROCESS_EARLY_TERMINATIONS => {
                if process_early_terminations(rt)? {
                    schedule_early_termination_work(rt)?
                }
            }
            _ => {
                warn!("onDeferredCronEvent invalid event type: {}", payload.event_type);
            }
        };

        Ok(())
    }
}

/// Inputs to seal proof verification, gathered from the pre-commitment being proven.
struct SealVerifyParams {
    sealed_cid: Cid,
    interactive_epoch: ChainEpoch,
    seal_rand_epoch: ChainEpoch,
    proof: Vec<u8>,
    deal_ids: Vec<DealID>,
    sector_number: SectorNumber,
    registered_seal_proof: RegisteredSealProof,
    max_seal_duration: ChainEpoch,
}

fn get_verify_info(
    rt: &impl Runtime,
    params: SealVerifyParams,
) -> Result<SealVerifyInfo, ActorError> {
    if rt.curr_epoch() <= params.interactive_epoch {
        return Err(actor_error!(forbidden, "too early to prove sector"));
    }

    let challenge_earliest =
        seal_challenge_earliest(rt.policy(), rt.curr_epoch(), params.max_seal_duration);
    if params.seal_rand_epoch < challenge_earliest {
        return Err(actor_error!(
            illegal_argument,
            "seal epoch {} too old, expected >= {}",
            params.seal_rand_epoch,
            challenge_earliest
        ));
    }

    let commd = request_unsealed_sector_cid(rt, params.registered_seal_proof, &params.deal_ids)?;

    let miner_actor_id = receiver_id(rt)?;
    let entropy = fvm_ipld_encoding::to_vec(&rt.message().receiver())?;

    let randomness = rt.get_randomness_from_tickets(
        DomainSeparationTag::SealRandomness,
        params.seal_rand_epoch,
        &entropy,
    )?;
    let interactive_randomness = rt.get_randomness_from_beacon(
        DomainSeparationTag::InteractiveSealChallengeSeed,
        params.interactive_epoch,
        &entropy,
    )?;

    Ok(SealVerifyInfo {
        registered_proof: params.registered_seal_proof,
        sector_id: SectorID { miner: miner_actor_id, number: params.sector_number },
        deal_ids: params.deal_ids,
        randomness: Randomness(randomness.into()),
        interactive_randomness: Randomness(interactive_randomness.into()),
        proof: params.proof,
        sealed_cid: params.sealed_cid,
        unsealed_cid: commd,
    })
}

/// Requests the storage market actor compute the unsealed sector CID from a sector's deals.
fn request_unsealed_sector_cid(
    rt: &impl Runtime,
    sector_type: RegisteredSealProof,
    deal_ids: &[DealID],
) -> Result<Cid, ActorError> {
    let ret: ext::market::ComputeDataCommitmentReturn =
        deserialize_block(extract_send_result(rt.send(
            &STORAGE_MARKET_ACTOR_ADDR,
            ext::market::COMPUTE_DATA_COMMITMENT_METHOD,
            IpldBlock::serialize_cbor(&ext::market::ComputeDataCommitmentParams {
                deal_ids: deal_ids.to_vec(),
                sector_type,
            })?,
            TokenAmount::zero(),
        ))
        .map_err(|e| {
            e.wrap(format!("failed request for unsealed sector CID for deals {:?}", deal_ids))
        })?)?;
    Ok(ret.commd)
}

/// Requests the deal weights of a sector's deals from the market actor. Sectors without deals
/// have zero weight.
fn request_deal_weight(
    rt: &impl Runtime,
    deal_ids: &[DealID],
    sector_start: ChainEpoch,
    sector_expiry: ChainEpoch,
) -> Result<ext::market::VerifyDealsForActivationReturn, ActorError> {
    if deal_ids.is_empty() {
        return Ok(Default::default());
    }

    deserialize_block(
        extract_send_result(rt.send(
            &STORAGE_MARKET_ACTOR_ADDR,
            ext::market::VERIFY_DEALS_FOR_ACTIVATION_METHOD,
            IpldBlock::serialize_cbor(&ext::market::VerifyDealsForActivationParams {
                deal_ids: deal_ids.to_vec(),
                sector_expiry,
                sector_start,
            })?,
            TokenAmount::zero(),
        ))
        .map_err(|e| e.wrap("failed to verify deals and get deal weight"))?,
    )
}

fn process_early_terminations(rt: &impl Runtime) -> Result</* more */ bool, ActorError> {
    // The current epoch reward and power are used to compute the fee, rather than those at
    // the termination epoch.
    let reward_stats = request_current_epoch_block_reward(rt)?;
    let power_total = request_current_total_power(rt)?;

    let (result, more, deals_to_terminate, penalty, pledge_delta) =
        rt.transaction(|state: &mut State, rt| {
            let store = rt.store();
            let policy = rt.policy();

            let (result, more) = state
                .pop_early_terminations(
                    policy,
                    store,
                    policy.addressed_partitions_max,
                    policy.addressed_sectors_max,
                )
                .map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        "failed to pop early terminations",
                    )
                })?;

            // Nothing to do, don't waste any time.
            // This can happen if we end up processing early terminations
            // before the cron callback fires.
            if result.is_empty() {
                return Ok((result, more, Vec::new(), TokenAmount::zero(), TokenAmount::zero()));
            }

            let info = get_miner_info(store, state)?;
            let sectors = Sectors::load(store, &state.sectors).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to load sectors array")
            })?;

            let mut total_initial_pledge = TokenAmount::zero();
            let mut deals_to_terminate =
                Vec::<ext::market::OnMinerSectorsTerminateParams>::with_capacity(
                    result.sectors.len(),
                );
            let mut penalty = TokenAmount::zero();

            for (epoch, sector_numbers) in result.iter() {
                let sectors = sectors
                    .load_sector(sector_numbers)
                    .map_err(|e| e.wrap("failed to load sector infos"))?;

                // estimate ~one deal per sector.
                let mut deal_ids = Vec::<DealID>::with_capacity(sectors.len());
                for sector in sectors {
                    penalty += pledge_penalty_for_termination(
                        policy,
                        &sector.expected_day_reward,
                        &sector.expected_storage_pledge,
                        epoch - sector.activation,
                        &reward_stats.this_epoch_reward_smoothed,
                        &power_total.quality_adj_power_smoothed,
                        &qa_power_for_sector(info.sector_size, &sector),
                    );
                    deal_ids.extend(sector.deal_ids);
                    total_initial_pledge += sector.initial_pledge;
                }

                deals_to_terminate
                    .push(ext::market::OnMinerSectorsTerminateParams { epoch, deal_ids });
            }

            // Remove pledge requirement.
            state.add_initial_pledge_requirement(&-total_initial_pledge.clone()).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to remove initial pledge")
            })?;
            let mut pledge_delta = -total_initial_pledge;

            // Use unlocked pledge to pay the penalty, vesting funds first.
            let unlocked_balance =
                state.get_unlocked_balance(&rt.current_balance()).map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        "failed to compute unlocked balance",
                    )
                })?;
            let (penalty_from_vesting, penalty_from_balance) = state
                .penalize_funds_in_priority_order(
                    store,
                    rt.curr_epoch(),
                    &penalty,
                    &unlocked_balance,
                )
                .map_err(|e| {
                    e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to unlock penalty")
                })?;

            penalty = &penalty_from_vesting + penalty_from_balance;
            pledge_delta -= penalty_from_vesting;

            state
                .check_balance_invariants(&rt.current_balance())
                .map_err(balance_invariants_broken)?;
            Ok((result, more, deals_to_terminate, penalty, pledge_delta))
        })?;

    // We didn't do anything, abort.
    if result.is_empty() {
        info!("no early terminations (maybe cron callback hasn't happened yet?)");
        return Ok(more);
    }

    // Burn penalty.
    log::debug!(
        "storage provider {} penalized {} for sector termination",
        rt.message().receiver(),
        penalty
    );
    burn_funds(rt, penalty)?;

    // Return pledge.
    notify_pledge_changed(rt, &pledge_delta)?;

    // Terminate deals.
    for params in deals_to_terminate {
        request_terminate_deals(rt, params.epoch, params.deal_ids)?;
    }

    // reschedule cron worker, if necessary.
    Ok(more)
}

/// Invoked at the end of the last epoch for each proving deadline.
fn handle_proving_deadline(rt: &impl Runtime) -> Result<(), ActorError> {
    let curr_epoch = rt.curr_epoch();

    let reward_stats = request_current_epoch_block_reward(rt)?;
    let power_total = request_current_total_power(rt)?;
    let reward_smoothed = &reward_stats.this_epoch_reward_smoothed;
    let power_smoothed = &power_total.quality_adj_power_smoothed;

    let mut had_early_terminations = false;

    let mut power_delta_total = PowerPair::zero();
    let mut penalty_total = TokenAmount::zero();
    let mut pledge_delta_total = TokenAmount::zero();

    let state: State = rt.transaction(|state: &mut State, rt| {
        let policy = rt.policy();
        let store = rt.store();

        // Vest locked funds.
        // This happens first so that any subsequent penalties are taken
        // from locked vesting funds before funds free this epoch.
        let newly_vested = state
            .unlock_vested_funds(store, curr_epoch)
            .map_err(|e| e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to vest funds"))?;
        pledge_delta_total -= newly_vested;

        // Expire pre-committed sectors.
        let deposit_to_burn =
            state.expire_pre_commits(policy, store, curr_epoch).map_err(|e| {
                e.downcast_default(
                    ExitCode::USR_ILLEGAL_STATE,
                    "failed to expire pre-committed sectors",
                )
            })?;
        log::debug!(
            "storage provider {} penalized {} for expired pre commits",
            rt.message().receiver(),
            deposit_to_burn
        );
        penalty_total += deposit_to_burn;

        // Record whether or not we _had_ early terminations in the queue before this method.
        // That way, don't re-schedule a cron callback if one is already scheduled.
        had_early_terminations = have_pending_early_terminations(state);

        // The cron actor is not invoked on epochs with empty tipsets, so the current epoch may be
        // slightly past the final epoch of the deadline. This is also invoked once before the
        // first proving period starts, which is detected by !period_started().
        let dl_info = state.deadline_info(policy, curr_epoch);
        if !dl_info.period_started() {
            // Skip checking faults on the first, incomplete period.
            return Ok(state.clone());
        }

        let mut deadlines = state.load_deadlines(store)?;
        let mut deadline = deadlines.load_deadline(policy, store, dl_info.index).map_err(|e| {
            e.downcast_default(
                ExitCode::USR_ILLEGAL_STATE,
                format!("failed to load deadline {}", dl_info.index),
            )
        })?;
        let quant = dl_info.quant_spec();
        let mut unlocked_balance =
            state.get_unlocked_balance(&rt.current_balance()).map_err(|e| {
                e.downcast_default(
                    ExitCode::USR_ILLEGAL_STATE,
                    "failed to compute unlocked balance",
                )
            })?;

        {
            // Detect and penalize missing proofs.
            let fault_expiration = dl_info.last() + policy.fault_max_age;
            let (new_faulty_power, failed_recovery_power) =
                deadline.process_deadline_end(store, quant, fault_expiration).map_err(|e| {
                    e.wrap(format!("failed to process end of deadline {}", dl_info.index))
                })?;

            power_delta_total -= &new_faulty_power;

            // Undeclared faults pay the undeclared fee, less the ongoing fee charged just below.
            let penalize_power_total = &new_faulty_power.qa + &failed_recovery_power.qa;
            let penalty_target = pledge_penalty_for_undeclared_fault(
                policy,
                reward_smoothed,
                power_smoothed,
                &penalize_power_total,
            ) - pledge_penalty_for_declared_fault(
                policy,
                reward_smoothed,
                power_smoothed,
                &penalize_power_total,
            );
            let (penalty_from_vesting, penalty_from_balance) = state
                .penalize_funds_in_priority_order(
                    store,
                    curr_epoch,
                    &penalty_target,
                    &unlocked_balance,
                )
                .map_err(|e| {
                    e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to unlock penalty")
                })?;
            unlocked_balance -= &penalty_from_balance;
            pledge_delta_total -= &penalty_from_vesting;
            penalty_total += penalty_from_vesting + penalty_from_balance;
        }
        {
            // Penalize ongoing faults, including any power that was just faulted from missing a PoSt.
            let penalty_target = pledge_penalty_for_declared_fault(
                policy,
                reward_smoothed,
                power_smoothed,
                &deadline.faulty_power.qa,
            );
            let (penalty_from_vesting, penalty_from_balance) = state
                .penalize_funds_in_priority_order(
                    store,
                    curr_epoch,
                    &penalty_target,
                    &unlocked_balance,
                )
                .map_err(|e| {
                    e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to unlock penalty")
                })?;
            pledge_delta_total -= &penalty_from_vesting;
            penalty_total += penalty_from_vesting + penalty_from_balance;
        }
        {
            // Expire sectors that are due, either for on-time expiration or "early" faulty-for-too-long.
            let expired = deadline.pop_expired_sectors(store, dl_info.last(), quant).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to load expired sectors")
            })?;

            // Release pledge requirements for the sectors expiring on-time.
            // Pledge for the sectors expiring early is retained to support the termination fee that will be assessed
            // when the early termination is processed.
            pledge_delta_total -= &expired.on_time_pledge;
            state.add_initial_pledge_requirement(&-expired.on_time_pledge.clone()).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to reduce initial pledge")
            })?;

            // Record reduction in power of the amount of expiring active power.
            // Faulty power has already been lost, so the amount expiring can be excluded from the delta.
            power_delta_total -= &expired.active_power;

            // Record deadlines with early terminations. While this
            // bitfield is non-empty, the miner is locked until they
            // pay the fee.
            if !expired.early_sectors.is_empty() {
                state.early_terminations.set(dl_info.index);
            }
        }

        // Save new deadline state.
        deadlines.update_deadline(policy, store, dl_info.index, &deadline).map_err(|e| {
            e.downcast_default(
                ExitCode::USR_ILLEGAL_STATE,
                format!("failed to update deadline {}", dl_info.index),
            )
        })?;
        state.save_deadlines(store, deadlines).map_err(|e| {
            e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to save deadlines")
        })?;

        // Increment current deadline, and proving period if necessary.
        state.current_deadline = (state.current_deadline + 1) % policy.wpost_period_deadlines;
        if state.current_deadline == 0 {
            state.proving_period_start += policy.wpost_proving_period;
        }

        state
            .check_balance_invariants(&rt.current_balance())
            .map_err(balance_invariants_broken)?;
        Ok(state.clone())
    })?;

    // Remove power for new faults, and burn penalties.
    request_update_power(rt, power_delta_total)?;
    burn_funds(rt, penalty_total)?;
    notify_pledge_changed(rt, &pledge_delta_total)?;

    // Schedule cron callback for next deadline's last epoch.
    let new_deadline_info = state.deadline_info(rt.policy(), curr_epoch);
    enroll_cron_event(
        rt,
        new_deadline_info.last(),
        CronEventPayload { event_type: CRON_EVENT_PROVING_DEADLINE },
    )?;

    // Record whether or not we _have_ early terminations now.
    let has_early_terminations = have_pending_early_terminations(&state);

    // If we didn't have pending early terminations before, but we do now,
    // handle them at the next epoch.
    if !had_early_terminations && has_early_terminations {
        // First, try to process some of these terminations.
        if process_early_terminations(rt)? {
            // If that doesn't work, just defer till the next epoch.
            schedule_early_termination_work(rt)?;
        }

        // Note: _don't_ process early terminations if we had a cron
        // callback already scheduled. In that case, we'll already have
        // processed AddressedSectorsMax terminations this epoch.
    }

    Ok(())
}

fn commit_worker_key_change(rt: &impl Runtime) -> Result<(), ActorError> {
    rt.transaction(|state: &mut State, rt| {
        let mut info = get_miner_info(rt.store(), state)?;

        // A previously scheduled key change could have been replaced with a new key change request
        // scheduled in the future. This case should be treated as a no-op.
        let pending_worker_key = match &info.pending_worker_key {
            Some(key) if key.effective_at <= rt.curr_epoch() => key.clone(),
            _ => return Ok(()),
        };

        info.worker = pending_worker_key.new_worker;
        info.pending_worker_key = None;

        state.save_info(rt.store(), &info).map_err(|e| {
            e.downcast_default(ExitCode::USR_SERIALIZATION, "failed to save miner info")
        })
    })
}

/// Check expiry is exactly *the epoch before* the start of a proving period.
fn validate_expiration(
    rt: &impl Runtime,
    activation: ChainEpoch,
    expiration: ChainEpoch,
    seal_proof: RegisteredSealProof,
) -> Result<(), ActorError> {
    let policy = rt.policy();

    // expiration cannot be less than minimum after activation
    if expiration - activation < policy.min_sector_expiration {
        return Err(actor_error!(
            illegal_argument,
            "invalid expiration {}, total sector lifetime ({}) must exceed {} after activation {}",
            expiration,
            expiration - activation,
            policy.min_sector_expiration,
            activation
        ));
    }

    // expiration cannot exceed MaxSectorExpirationExtension from now
    if expiration > rt.curr_epoch() + policy.max_sector_expiration_extension {
        return Err(actor_error!(
            illegal_argument,
            "invalid expiration {}, cannot be more than {} past current epoch {}",
            expiration,
            policy.max_sector_expiration_extension,
            rt.curr_epoch()
        ));
    }

    // total sector lifetime cannot exceed SectorMaximumLifetime for the sector's seal proof
    let max_lifetime = seal_proof_sector_maximum_lifetime(seal_proof).ok_or_else(|| {
        actor_error!(illegal_state, "unrecognized seal proof type {:?}", seal_proof)
    })?;
    if expiration - activation > max_lifetime {
        return Err(actor_error!(
            illegal_argument,
            "invalid expiration {}, total sector lifetime ({}) cannot exceed {} after activation {}",
            expiration,
            expiration - activation,
            max_lifetime,
            activation
        ));
    }

    Ok(())
}

fn validate_replace_sector<BS: Blockstore>(
    policy: &Policy,
    store: &BS,
    state: &State,
    params: &SectorPreCommitInfo,
) -> Result<SectorOnChainInfo, ActorError> {
    let replace_sector = state
        .get_sector(store, params.replace_sector_number)
        .map_err(|e| {
            e.downcast_default(
                ExitCode::USR_ILLEGAL_STATE,
                format!("failed to load sector {}", params.replace_sector_number),
            )
        })?
        .ok_or_else(|| {
            actor_error!(not_found, "no such sector {} to replace", params.replace_sector_number)
        })?;

    if !replace_sector.deal_ids.is_empty() {
        return Err(actor_error!(
            illegal_argument,
            "cannot replace sector {} which has deals",
            params.replace_sector_number
        ));
    }
    if params.seal_proof != replace_sector.seal_proof {
        return Err(actor_error!(
            illegal_argument,
            "cannot replace sector {} seal proof {:?} with seal proof {:?}",
            params.replace_sector_number,
            replace_sector.seal_proof,
            params.seal_proof
        ));
    }
    if params.expiration < replace_sector.expiration {
        return Err(actor_error!(
            illegal_argument,
            "cannot replace sector {} expiration {} with sooner expiration {}",
            params.replace_sector_number,
            replace_sector.expiration,
            params.expiration
        ));
    }

    state
        .check_sector_health(
            policy,
            store,
            params.replace_sector_deadline,
            params.replace_sector_partition,
            params.replace_sector_number,
        )
        .map_err(|e| {
            e.downcast_default(
                ExitCode::USR_ILLEGAL_STATE,
                format!("failed to replace sector {}", params.replace_sector_number),
            )
        })?;

    Ok(replace_sector)
}

fn enroll_cron_event(
    rt: &impl Runtime,
    event_epoch: ChainEpoch,
    cb: CronEventPayload,
) -> Result<(), ActorError> {
    let payload = RawBytes::serialize(&cb)?;
    let ser_params =
        IpldBlock::serialize_cbor(&ext::power::EnrollCronEventParams { event_epoch, payload })?;
    extract_send_result(rt.send(
        &STORAGE_POWER_ACTOR_ADDR,
        ext::power::ENROLL_CRON_EVENT_METHOD,
        ser_params,
        TokenAmount::zero(),
    ))?;

    Ok(())
}

fn request_update_power(rt: &impl Runtime, delta: PowerPair) -> Result<(), ActorError> {
    if delta.is_zero() {
        return Ok(());
    }

    let delta_clone = delta.clone();

    extract_send_result(rt.send(
        &STORAGE_POWER_ACTOR_ADDR,
        ext::power::UPDATE_CLAIMED_POWER_METHOD,
        IpldBlock::serialize_cbor(&ext::power::UpdateClaimedPowerParams {
            raw_byte_delta: delta.raw,
            quality_adjusted_delta: delta.qa,
        })?,
        TokenAmount::zero(),
    ))
    .map_err(|e| e.wrap(format!("failed to update power with {:?}", delta_clone)))?;

    Ok(())
}

fn request_terminate_deals(
    rt: &impl Runtime,
    epoch: ChainEpoch,
    deal_ids: Vec<DealID>,
) -> Result<(), ActorError> {
    for chunk in deal_ids.chunks(DEAL_TERMINATION_BATCH) {
        extract_send_result(rt.send(
            &STORAGE_MARKET_ACTOR_ADDR,
            ext::market::ON_MINER_SECTORS_TERMINATE_METHOD,
            IpldBlock::serialize_cbor(&ext::market::OnMinerSectorsTerminateParams {
                epoch,
                deal_ids: chunk.to_vec(),
            })?,
            TokenAmount::zero(),
        ))
        .map_err(|e| e.wrap("failed to terminate deals"))?;
    }

    Ok(())
}

/// Closes down this miner by terminating all its deals and burning its funds.
fn terminate_miner(rt: &impl Runtime, state: &State) -> Result<(), ActorError> {
    let mut deal_ids = Vec::<DealID>::new();
    state
        .for_each_sector(rt.store(), |sector| {
            deal_ids.extend_from_slice(&sector.deal_ids);
            Ok(())
        })
        .map_err(|e| {
            e.downcast_default(
                ExitCode::USR_ILLEGAL_STATE,
                "failed to traverse sectors for termination",
            )
        })?;

    request_terminate_deals(rt, rt.curr_epoch(), deal_ids)?;

    // Delete the actor and burn all remaining funds
    rt.delete_actor(&BURNT_FUNDS_ACTOR_ADDR)
}

fn schedule_early_termination_work(rt: &impl Runtime) -> Result<(), ActorError> {
    info!("scheduling early terminations with cron...");
    enroll_cron_event(
        rt,
        rt.curr_epoch() + 1,
        CronEventPayload { event_type: CRON_EVENT_PROCESS_EARLY_TERMINATIONS },
    )
}

fn have_pending_early_terminations(state: &State) -> bool {
    !state.early_terminations.is_empty()
}

fn receiver_id(rt: &impl Runtime) -> Result<ActorID, ActorError> {
    match rt.message().receiver().payload() {
        Payload::ID(id) => Ok(*id),
        _ => Err(actor_error!(
            illegal_state,
            "runtime provided bad receiver address {}",
            rt.message().receiver()
        )),
    }
}

/// Verifies a window PoSt, aborting with `USR_ILLEGAL_ARGUMENT` if the proof is invalid.
fn verify_windowed_post(
    rt: &impl Runtime,
    challenge_epoch: ChainEpoch,
    sectors: &[SectorOnChainInfo],
    proofs: Vec<PoStProof>,
) -> Result<(), ActorError> {
    let miner_actor_id = receiver_id(rt)?;

    // Regenerate challenge randomness, which must match that generated for the proof.
    let entropy = fvm_ipld_encoding::to_vec(&rt.message().receiver())?;
    let randomness = rt.get_randomness_from_beacon(
        DomainSeparationTag::WindowedPoStChallengeSeed,
        challenge_epoch,
        &entropy,
    )?;

    let challenged_sectors = sectors
        .iter()
        .map(|s| SectorInfo {
            proof: s.seal_proof,
            sector_number: s.sector_number,
            sealed_cid: s.sealed_cid,
        })
        .collect();

    // get public inputs
    let pv_info = WindowPoStVerifyInfo {
        randomness: Randomness(randomness.into()),
        proofs,
        challenged_sectors,
        prover: miner_actor_id,
    };

    // verify the post proof
    rt.verify_post(&pv_info).map_err(|e| {
        e.downcast_default(ExitCode::USR_ILLEGAL_ARGUMENT, "invalid PoSt")
    })
}

/// Requests the current epoch target block reward from the reward actor.
/// return value includes reward, smoothed estimate of reward, and baseline power
fn request_current_epoch_block_reward(
    rt: &impl Runtime,
) -> Result<ext::reward::ThisEpochRewardReturn, ActorError> {
    deserialize_block(
        extract_send_result(rt.send(
            &REWARD_ACTOR_ADDR,
            ext::reward::THIS_EPOCH_REWARD_METHOD,
            Default::default(),
            TokenAmount::zero(),
        ))
        .map_err(|e| e.wrap("failed to check epoch baseline power"))?,
    )
}

/// Requests the current network total power and pledge from the power actor.
fn request_current_total_power(
    rt: &impl Runtime,
) -> Result<ext::power::CurrentTotalPowerReturn, ActorError> {
    deserialize_block(
        extract_send_result(rt.send(
            &STORAGE_POWER_ACTOR_ADDR,
            ext::power::CURRENT_TOTAL_POWER_METHOD,
            Default::default(),
            TokenAmount::zero(),
        ))
        .map_err(|e| e.wrap("failed to check current power"))?,
    )
}

/// Resolves an address to an ID address and verifies that it is address of an account or multisig actor.
fn resolve_control_address(rt: &impl Runtime, raw: Address) -> Result<Address, ActorError> {
    let resolved = rt
        .resolve_address(&raw)
        .ok_or_else(|| actor_error!(illegal_argument, "unable to resolve address: {}", raw))?;

    let owner_code = rt
        .get_actor_code_cid(&resolved)
        .ok_or_else(|| actor_error!(illegal_argument, "no code for address: {}", resolved))?;

    let is_principal = rt
        .resolve_builtin_actor_type(&owner_code)
        .map(|t| CALLER_TYPES_SIGNABLE.contains(&t))
        .unwrap_or(false);
    if !is_principal {
        return Err(actor_error!(
            illegal_argument,
            "owner actor type must be a principal, was {}",
            owner_code
        ));
    }

    Ok(Address::new_id(resolved))
}

/// Resolves an address to an ID address and verifies that it is address of an account actor with an associated BLS key.
/// The worker must be BLS since the worker key will be used alongside a BLS-VRF.
fn resolve_worker_address(rt: &impl Runtime, raw: Address) -> Result<ActorID, ActorError> {
    let resolved = rt
        .resolve_address(&raw)
        .ok_or_else(|| actor_error!(illegal_argument, "unable to resolve address: {}", raw))?;

    let worker_code = rt
        .get_actor_code_cid(&resolved)
        .ok_or_else(|| actor_error!(illegal_argument, "no code for address: {}", resolved))?;
    if rt.resolve_builtin_actor_type(&worker_code) != Some(Type::Account) {
        return Err(actor_error!(
            illegal_argument,
            "worker actor type must be an account, was {}",
            worker_code
        ));
    }

    if raw.protocol() != Protocol::BLS {
        let pub_key: Address = deserialize_block(extract_send_result(rt.send(
            &Address::new_id(resolved),
            ext::account::PUBKEY_ADDRESS_METHOD,
            None,
            TokenAmount::zero(),
        ))?)?;
        if pub_key.protocol() != Protocol::BLS {
            return Err(actor_error!(
                illegal_argument,
                "worker account {} must have BLS pubkey, was {}",
                resolved,
                pub_key.protocol()
            ));
        }
    }
    Ok(resolved)
}

fn burn_funds(rt: &impl Runtime, amount: TokenAmount) -> Result<(), ActorError> {
    log::debug!("storage provider {} burning {}", rt.message().receiver(), amount);
    if amount.is_positive() {
        extract_send_result(rt.send(&BURNT_FUNDS_ACTOR_ADDR, METHOD_SEND, None, amount))?;
    }
    Ok(())
}

fn notify_pledge_changed(rt: &impl Runtime, pledge_delta: &TokenAmount) -> Result<(), ActorError> {
    if !pledge_delta.is_zero() {
        extract_send_result(rt.send(
            &STORAGE_POWER_ACTOR_ADDR,
            ext::power::UPDATE_PLEDGE_TOTAL_METHOD,
            IpldBlock::serialize_cbor(pledge_delta)?,
            TokenAmount::zero(),
        ))?;
    }
    Ok(())
}

/// Assigns proving period offset randomly in the range [0, WPoStProvingPeriod) by hashing
/// the actor's address and current epoch.
fn assign_proving_period_offset(
    policy: &Policy,
    addr: Address,
    current_epoch: ChainEpoch,
    blake2b: impl FnOnce(&[u8]) -> [u8; 32],
) -> anyhow::Result<ChainEpoch> {
    let mut my_addr = fvm_ipld_encoding::to_vec(&addr)?;
    my_addr.write_i64::<BigEndian>(current_epoch)?;

    let digest = blake2b(&my_addr);

    let mut offset: u64 = BigEndian::read_u64(&digest);
    offset %= policy.wpost_proving_period as u64;

    // Conversion from i64 to u64 is safe because it's % WPOST_PROVING_PERIOD which is i64
    Ok(offset as ChainEpoch)
}

/// Computes the epoch at which a proving period should start such that it is greater than the current epoch, and
/// has a defined offset from being an exact multiple of WPoStProvingPeriod.
/// A miner is exempt from Window PoSt until the first full proving period starts.
fn next_proving_period_start(
    policy: &Policy,
    current_epoch: ChainEpoch,
    offset: ChainEpoch,
) -> ChainEpoch {
    let curr_modulus = current_epoch % policy.wpost_proving_period;

    let period_progress = if curr_modulus >= offset {
        curr_modulus - offset
    } else {
        policy.wpost_proving_period - (offset - curr_modulus)
    };

    current_epoch - period_progress + policy.wpost_proving_period
}

fn get_miner_info<BS>(store: &BS, state: &State) -> Result<MinerInfo, ActorError>
where
    BS: Blockstore,
{
    state
        .get_info(store)
        .map_err(|e| e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "could not read miner info"))
}

fn check_control_addresses(policy: &Policy, control_addrs: &[Address]) -> Result<(), ActorError> {
    if control_addrs.len() > policy.max_control_addresses {
        return Err(actor_error!(
            illegal_argument,
            "control addresses length {} exceeds max control addresses length {}",
            control_addrs.len(),
            policy.max_control_addresses
        ));
    }

    Ok(())
}

fn check_peer_info(
    policy: &Policy,
    peer_id: &[u8],
    multiaddrs: &[BytesDe],
) -> Result<(), ActorError> {
    if peer_id.len() > policy.max_peer_id_length {
        return Err(actor_error!(
            illegal_argument,
            "peer ID size of {} exceeds maximum size of {}",
            peer_id.len(),
            policy.max_peer_id_length
        ));
    }

    let mut total_size = 0;
    for ma in multiaddrs {
        if ma.0.is_empty() {
            return Err(actor_error!(illegal_argument, "invalid empty multiaddr"));
        }
        total_size += ma.0.len();
    }

    if total_size > policy.max_multiaddr_data {
        return Err(actor_error!(
            illegal_argument,
            "multiaddr size of {} exceeds maximum of {}",
            total_size,
            policy.max_multiaddr_data
        ));
    }

    Ok(())
}

fn balance_invariants_broken(e: Error) -> ActorError {
    ActorError::unchecked(
        ERR_BALANCE_INVARIANTS_BROKEN,
        format!("balance invariants broken: {}", e),
    )
}

impl ActorCode for Actor {
    type Methods = Method;

    fn name() -> &'static str {
        "StorageMiner"
    }

    actor_dispatch! {
        Constructor => constructor,
        ControlAddresses => control_addresses,
        ChangeWorkerAddress => change_worker_address,
        ChangePeerID => change_peer_id,
        SubmitWindowedPoSt => submit_windowed_post,
        PreCommitSector => pre_commit_sector,
        ProveCommitSector => prove_commit_sector,
        ExtendSectorExpiration => extend_sector_expiration,
        TerminateSectors => terminate_sectors,
        DeclareFaults => declare_faults,
        DeclareFaultsRecovered => declare_faults_recovered,
        OnDeferredCronEvent => on_deferred_cron_event,
        CheckSectorProven => check_sector_proven,
        AddLockedFund => add_locked_fund,
        ReportConsensusFault => report_consensus_fault,
        WithdrawBalance => withdraw_balance,
        ConfirmSectorProofsValid => confirm_sector_proofs_valid,
        ChangeMultiaddrs => change_multiaddresses,
        CompactSectorNumbers => compact_sector_numbers,
    }
}
