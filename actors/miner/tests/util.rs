// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};

use fil_actor_miner::ext::account::PUBKEY_ADDRESS_METHOD;
use fil_actor_miner::ext::market::{
    ActivateDealsParams, ComputeDataCommitmentParams, ComputeDataCommitmentReturn,
    OnMinerSectorsTerminateParams, VerifyDealsForActivationParams, VerifyDealsForActivationReturn,
    ACTIVATE_DEALS_METHOD, COMPUTE_DATA_COMMITMENT_METHOD, ON_MINER_SECTORS_TERMINATE_METHOD,
    VERIFY_DEALS_FOR_ACTIVATION_METHOD,
};
use fil_actor_miner::ext::power::{
    CurrentTotalPowerReturn, EnrollCronEventParams, UpdateClaimedPowerParams,
    CURRENT_TOTAL_POWER_METHOD, ENROLL_CRON_EVENT_METHOD, ON_CONSENSUS_FAULT_METHOD,
    SUBMIT_POREP_FOR_BULK_VERIFY_METHOD, UPDATE_CLAIMED_POWER_METHOD, UPDATE_PLEDGE_TOTAL_METHOD,
};
use fil_actor_miner::testing::check_state_invariants;
use fil_actor_miner::{
    initial_pledge_for_power, pledge_penalty_for_termination, power_for_sectors,
    qa_power_for_sector, qa_power_for_weight, reward_for_consensus_slash_report, Actor,
    AddLockedFundParams, ChangeMultiaddrsParams, ChangePeerIDParams, ChangeWorkerAddressParams,
    CompactSectorNumbersParams, ConfirmSectorProofsParams, CronEventPayload, Deadline,
    DeadlineInfo, DeclareFaultsParams, DeclareFaultsRecoveredParams, ExpirationExtension,
    ExtendSectorExpirationParams, FaultDeclaration, GetControlAddressesReturn, Method,
    MinerConstructorParams, Partition, PoStPartition, PowerPair, PreCommitSectorParams,
    ProveCommitSectorParams, RecoveryDeclaration, ReportConsensusFaultParams, SectorOnChainInfo,
    SectorPreCommitOnChainInfo, State, SubmitWindowedPoStParams, TerminateSectorsParams,
    TerminateSectorsReturn, TerminationDeclaration, WithdrawBalanceParams, WithdrawBalanceReturn,
    CRON_EVENT_PROVING_DEADLINE, CRON_EVENT_WORKER_KEY_CHANGE,
};
use fil_actors_runtime::reward::{FilterEstimate, ThisEpochRewardReturn, THIS_EPOCH_REWARD_METHOD};
use fil_actors_runtime::runtime::builtins::Type;
use fil_actors_runtime::runtime::DomainSeparationTag;
use fil_actors_runtime::test_utils::*;
use fil_actors_runtime::{
    ActorError, DealWeight, BURNT_FUNDS_ACTOR_ADDR, INIT_ACTOR_ADDR, REWARD_ACTOR_ADDR,
    STORAGE_MARKET_ACTOR_ADDR, STORAGE_POWER_ACTOR_ADDR,
};
use fvm_ipld_bitfield::BitField;
use fvm_ipld_encoding::ipld_block::IpldBlock;
use fvm_ipld_encoding::{BytesDe, RawBytes};
use fvm_shared::address::{Address, Protocol};
use fvm_shared::bigint::BigInt;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::consensus::ConsensusFault;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::randomness::Randomness;
use fvm_shared::sector::{
    PoStProof, RegisteredPoStProof, RegisteredSealProof, SealVerifyInfo, SectorID, SectorInfo,
    SectorNumber, SectorSize, StoragePower, WindowPoStVerifyInfo,
};
use fvm_shared::METHOD_SEND;
use num_traits::Zero;

pub const RECEIVER_ID: u64 = 1000;
/// Offset that puts the first proving period start at epoch 1000 for a miner built at epoch 0.
pub const PERIOD_OFFSET: ChainEpoch = 1000;
/// Sector lifetime used by most tests, in proving periods past the current one.
pub const DEFAULT_SECTOR_EXPIRATION: i64 = 220;
pub const TEST_RANDOMNESS: [u8; 32] = [7u8; 32];

pub fn big_balance() -> TokenAmount {
    TokenAmount::from_whole(1_000_000)
}

pub struct ActorHarness {
    pub receiver: Address,
    pub owner: Address,
    pub worker: Address,
    pub worker_key: Address,

    pub control_addrs: Vec<Address>,

    pub seal_proof_type: RegisteredSealProof,
    pub window_post_proof_type: RegisteredPoStProof,
    pub sector_size: SectorSize,
    pub partition_size: u64,
    pub period_offset: ChainEpoch,
    pub next_sector_no: SectorNumber,

    pub network_pledge: TokenAmount,
    pub network_raw_power: StoragePower,
    pub network_qa_power: StoragePower,
    pub baseline_power: StoragePower,

    pub epoch_reward_smooth: FilterEstimate,
    pub epoch_qa_power_smooth: FilterEstimate,
}

impl ActorHarness {
    pub fn new(proving_period_offset: ChainEpoch) -> ActorHarness {
        let owner = Address::new_id(100);
        let worker = Address::new_id(101);
        let control_addrs = vec![Address::new_id(999), Address::new_id(998), Address::new_id(997)];
        let worker_key = new_bls_addr(0);
        let receiver = Address::new_id(RECEIVER_ID);
        let rwd = BigInt::from(10_000_000_000_000_000_000i128);
        let pwr = StoragePower::from(1i128 << 50);
        let proof_type = RegisteredSealProof::StackedDRG32GiBV1P1;

        ActorHarness {
            receiver,
            owner,
            worker,
            worker_key,
            control_addrs,

            seal_proof_type: proof_type,
            window_post_proof_type: proof_type.registered_window_post_proof().unwrap(),
            sector_size: proof_type.sector_size().unwrap(),
            partition_size: proof_type.window_post_partitions_sector().unwrap(),

            period_offset: proving_period_offset,
            next_sector_no: 0,

            network_pledge: TokenAmount::from_atto(rwd.clone() * 1000),
            network_raw_power: pwr.clone(),
            network_qa_power: pwr.clone(),
            baseline_power: pwr.clone(),

            epoch_reward_smooth: FilterEstimate::new(rwd, BigInt::zero()),
            epoch_qa_power_smooth: FilterEstimate::new(pwr, BigInt::zero()),
        }
    }

    pub fn new_runtime(&self) -> MockRuntime {
        init_logging();
        let mut rt = MockRuntime {
            receiver: self.receiver,
            hash_func: fixed_hasher(self.period_offset),
            ..Default::default()
        };
        rt.policy.valid_pre_commit_proof_type.insert(self.seal_proof_type);

        rt.set_address_actor_type(self.owner, *ACCOUNT_ACTOR_CODE_ID);
        rt.set_address_actor_type(self.worker, *ACCOUNT_ACTOR_CODE_ID);
        for addr in &self.control_addrs {
            rt.set_address_actor_type(*addr, *ACCOUNT_ACTOR_CODE_ID);
        }
        rt.add_id_address(self.worker_key, self.worker);
        rt.set_balance(big_balance());

        rt
    }

    pub fn get_state(&self, rt: &MockRuntime) -> State {
        rt.get_state::<State>()
    }

    pub fn check_state(&self, rt: &MockRuntime) {
        let (_, acc) =
            check_state_invariants(&rt.policy, &self.get_state(rt), &rt.store, &rt.get_balance());
        acc.assert_empty();
    }

    pub fn construct_and_verify(&self, rt: &MockRuntime) {
        let params = MinerConstructorParams {
            owner: self.owner,
            worker: self.worker,
            control_addresses: self.control_addrs.clone(),
            seal_proof_type: self.seal_proof_type,
            peer_id: vec![0],
            multi_addresses: vec![],
        };

        rt.set_caller(*INIT_ACTOR_CODE_ID, INIT_ACTOR_ADDR);
        rt.expect_validate_caller_addr(vec![INIT_ACTOR_ADDR]);
        // Worker is an ID address, so its key is looked up.
        rt.expect_send_simple(
            self.worker,
            PUBKEY_ADDRESS_METHOD,
            None,
            TokenAmount::zero(),
            IpldBlock::serialize_cbor(&self.worker_key).unwrap(),
            ExitCode::OK,
        );

        let period_start = next_period_start(&rt.policy, *rt.epoch.borrow(), self.period_offset);
        self.expect_enroll_cron(rt, period_start - 1, CRON_EVENT_PROVING_DEADLINE);

        let result = rt
            .call::<Actor>(
                Method::Constructor as u64,
                IpldBlock::serialize_cbor(&params).unwrap(),
            )
            .unwrap();
        expect_empty(result);
        rt.verify();
    }

    pub fn get_control_addresses(&self, rt: &MockRuntime) -> (Address, Address, Vec<Address>) {
        rt.expect_validate_caller_any();

        let result = rt.call::<Actor>(Method::ControlAddresses as u64, None).unwrap();
        rt.verify();

        let value = result.unwrap().deserialize::<GetControlAddressesReturn>().unwrap();
        (value.owner, value.worker, value.control_addresses)
    }

    pub fn caller_addrs(&self) -> Vec<Address> {
        let mut caller_addrs = self.control_addrs.clone();
        caller_addrs.push(self.worker);
        caller_addrs.push(self.owner);
        caller_addrs
    }

    /// Addresses accepted for peer info changes, which list the owner ahead of the worker.
    pub fn info_caller_addrs(&self) -> Vec<Address> {
        let mut caller_addrs = self.control_addrs.clone();
        caller_addrs.push(self.owner);
        caller_addrs.push(self.worker);
        caller_addrs
    }

    pub fn change_worker_address(
        &self,
        rt: &MockRuntime,
        new_worker: Address,
        new_worker_key: Address,
        new_control_addrs: Vec<Address>,
    ) -> Result<Option<IpldBlock>, ActorError> {
        rt.set_address_actor_type(new_worker, *ACCOUNT_ACTOR_CODE_ID);
        if new_worker.protocol() != Protocol::BLS {
            rt.expect_send_simple(
                new_worker,
                PUBKEY_ADDRESS_METHOD,
                None,
                TokenAmount::zero(),
                IpldBlock::serialize_cbor(&new_worker_key).unwrap(),
                ExitCode::OK,
            );
        }

        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.owner);
        rt.expect_validate_caller_addr(vec![self.owner]);

        let state = self.get_state(rt);
        let info = state.get_info(&rt.store).unwrap();
        if new_worker != info.worker {
            let effective_at = *rt.epoch.borrow() + rt.policy.worker_key_change_delay;
            self.expect_enroll_cron(rt, effective_at, CRON_EVENT_WORKER_KEY_CHANGE);
        }

        let params = ChangeWorkerAddressParams {
            new_worker,
            new_control_addresses: new_control_addrs,
        };
        let result = rt.call::<Actor>(
            Method::ChangeWorkerAddress as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        );
        rt.verify();
        result
    }

    pub fn confirm_worker_key_change(&self, rt: &MockRuntime) {
        self.on_cron_event(rt, CRON_EVENT_WORKER_KEY_CHANGE).unwrap();
        rt.verify();
    }

    pub fn on_cron_event(
        &self,
        rt: &MockRuntime,
        event_type: i64,
    ) -> Result<Option<IpldBlock>, ActorError> {
        rt.set_caller(*POWER_ACTOR_CODE_ID, STORAGE_POWER_ACTOR_ADDR);
        rt.expect_validate_caller_addr(vec![STORAGE_POWER_ACTOR_ADDR]);
        rt.call::<Actor>(
            Method::OnDeferredCronEvent as u64,
            IpldBlock::serialize_cbor(&CronEventPayload { event_type }).unwrap(),
        )
    }

    pub fn set_peer_id(&self, rt: &MockRuntime, new_id: Vec<u8>) {
        let params = ChangePeerIDParams { new_id: new_id.clone() };

        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
        rt.expect_validate_caller_addr(self.info_caller_addrs());

        let result = rt
            .call::<Actor>(Method::ChangePeerID as u64, IpldBlock::serialize_cbor(&params).unwrap())
            .unwrap();
        expect_empty(result);
        rt.verify();

        let state = self.get_state(rt);
        let info = state.get_info(&rt.store).unwrap();
        assert_eq!(new_id, info.peer_id);
    }

    pub fn set_peer_id_fail(&self, rt: &MockRuntime, new_id: Vec<u8>) {
        let params = ChangePeerIDParams { new_id };

        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
        let result = rt.call::<Actor>(
            Method::ChangePeerID as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        );
        expect_abort(ExitCode::USR_ILLEGAL_ARGUMENT, result);
        rt.reset();
    }

    pub fn set_multiaddr(&self, rt: &MockRuntime, new_multiaddrs: Vec<BytesDe>) {
        let params = ChangeMultiaddrsParams { new_multi_addrs: new_multiaddrs.clone() };

        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
        rt.expect_validate_caller_addr(self.info_caller_addrs());

        let result = rt
            .call::<Actor>(
                Method::ChangeMultiaddrs as u64,
                IpldBlock::serialize_cbor(&params).unwrap(),
            )
            .unwrap();
        expect_empty(result);
        rt.verify();

        let state = self.get_state(rt);
        let info = state.get_info(&rt.store).unwrap();
        assert_eq!(new_multiaddrs, info.multi_address);
    }

    pub fn set_multiaddr_fail(&self, rt: &MockRuntime, new_multiaddrs: Vec<BytesDe>) {
        let params = ChangeMultiaddrsParams { new_multi_addrs: new_multiaddrs };

        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
        let result = rt.call::<Actor>(
            Method::ChangeMultiaddrs as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        );
        expect_abort(ExitCode::USR_ILLEGAL_ARGUMENT, result);
        rt.reset();
    }

    pub fn expect_query_network_info(&self, rt: &MockRuntime) {
        let current_power = CurrentTotalPowerReturn {
            raw_byte_power: self.network_raw_power.clone(),
            quality_adj_power: self.network_qa_power.clone(),
            pledge_collateral: self.network_pledge.clone(),
            quality_adj_power_smoothed: self.epoch_qa_power_smooth.clone(),
        };
        let current_reward = ThisEpochRewardReturn {
            this_epoch_reward: TokenAmount::from_atto(self.epoch_reward_smooth.estimate()),
            this_epoch_reward_smoothed: self.epoch_reward_smooth.clone(),
            this_epoch_baseline_power: self.baseline_power.clone(),
        };

        rt.expect_send_simple(
            REWARD_ACTOR_ADDR,
            THIS_EPOCH_REWARD_METHOD,
            None,
            TokenAmount::zero(),
            IpldBlock::serialize_cbor(&current_reward).unwrap(),
            ExitCode::OK,
        );
        rt.expect_send_simple(
            STORAGE_POWER_ACTOR_ADDR,
            CURRENT_TOTAL_POWER_METHOD,
            None,
            TokenAmount::zero(),
            IpldBlock::serialize_cbor(&current_power).unwrap(),
            ExitCode::OK,
        );
    }

    pub fn expect_update_power(&self, rt: &MockRuntime, delta: &PowerPair) {
        if delta.is_zero() {
            return;
        }
        let params = UpdateClaimedPowerParams {
            raw_byte_delta: delta.raw.clone(),
            quality_adjusted_delta: delta.qa.clone(),
        };
        rt.expect_send_simple(
            STORAGE_POWER_ACTOR_ADDR,
            UPDATE_CLAIMED_POWER_METHOD,
            IpldBlock::serialize_cbor(&params).unwrap(),
            TokenAmount::zero(),
            None,
            ExitCode::OK,
        );
    }

    pub fn expect_update_pledge(&self, rt: &MockRuntime, delta: &TokenAmount) {
        if delta.is_zero() {
            return;
        }
        rt.expect_send_simple(
            STORAGE_POWER_ACTOR_ADDR,
            UPDATE_PLEDGE_TOTAL_METHOD,
            IpldBlock::serialize_cbor(delta).unwrap(),
            TokenAmount::zero(),
            None,
            ExitCode::OK,
        );
    }

    pub fn expect_burn(&self, rt: &MockRuntime, amount: &TokenAmount) {
        if !amount.is_positive() {
            return;
        }
        rt.expect_send_simple(
            BURNT_FUNDS_ACTOR_ADDR,
            METHOD_SEND,
            None,
            amount.clone(),
            None,
            ExitCode::OK,
        );
    }

    pub fn expect_enroll_cron(&self, rt: &MockRuntime, event_epoch: ChainEpoch, event_type: i64) {
        let params = EnrollCronEventParams {
            event_epoch,
            payload: RawBytes::serialize(&CronEventPayload { event_type }).unwrap(),
        };
        rt.expect_send_simple(
            STORAGE_POWER_ACTOR_ADDR,
            ENROLL_CRON_EVENT_METHOD,
            IpldBlock::serialize_cbor(&params).unwrap(),
            TokenAmount::zero(),
            None,
            ExitCode::OK,
        );
    }

    pub fn expect_terminate_deals(
        &self,
        rt: &MockRuntime,
        epoch: ChainEpoch,
        deal_ids: Vec<DealID>,
    ) {
        if deal_ids.is_empty() {
            return;
        }
        rt.expect_send_simple(
            STORAGE_MARKET_ACTOR_ADDR,
            ON_MINER_SECTORS_TERMINATE_METHOD,
            IpldBlock::serialize_cbor(&OnMinerSectorsTerminateParams { epoch, deal_ids }).unwrap(),
            TokenAmount::zero(),
            None,
            ExitCode::OK,
        );
    }

    /// Funds vesting at the current epoch, which the next vesting call unlocks.
    pub fn immediately_vesting_funds(&self, rt: &MockRuntime) -> TokenAmount {
        let state = self.get_state(rt);
        state.check_vested_funds(&rt.store, *rt.epoch.borrow()).unwrap()
    }

    pub fn next_sector_no(&mut self) -> SectorNumber {
        let n = self.next_sector_no;
        self.next_sector_no += 1;
        n
    }

    pub fn make_pre_commit_params(
        &self,
        sector_no: SectorNumber,
        challenge: ChainEpoch,
        expiration: ChainEpoch,
        deal_ids: Vec<DealID>,
    ) -> PreCommitSectorParams {
        PreCommitSectorParams {
            seal_proof: self.seal_proof_type,
            sector_number: sector_no,
            sealed_cid: make_sealed_cid(format!("commr-{}", sector_no).as_bytes()),
            seal_rand_epoch: challenge,
            deal_ids,
            expiration,
            ..Default::default()
        }
    }

    pub fn make_prove_commit_params(&self, sector_no: SectorNumber) -> ProveCommitSectorParams {
        ProveCommitSectorParams { sector_number: sector_no, proof: RawBytes::new(vec![0u8; 192]) }
    }

    pub fn pre_commit_sector_raw(
        &self,
        rt: &MockRuntime,
        params: PreCommitSectorParams,
        cfg: PreCommitConfig,
    ) -> Result<Option<IpldBlock>, ActorError> {
        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
        rt.expect_validate_caller_addr(self.caller_addrs());

        self.expect_query_network_info(rt);
        if !params.deal_ids.is_empty() {
            let verify_params = VerifyDealsForActivationParams {
                deal_ids: params.deal_ids.clone(),
                sector_expiry: params.expiration,
                sector_start: *rt.epoch.borrow(),
            };
            let verify_return = VerifyDealsForActivationReturn {
                deal_weight: cfg.deal_weight,
                verified_deal_weight: cfg.verified_deal_weight,
            };
            rt.expect_send_simple(
                STORAGE_MARKET_ACTOR_ADDR,
                VERIFY_DEALS_FOR_ACTIVATION_METHOD,
                IpldBlock::serialize_cbor(&verify_params).unwrap(),
                TokenAmount::zero(),
                IpldBlock::serialize_cbor(&verify_return).unwrap(),
                ExitCode::OK,
            );
        }

        let vested = self.immediately_vesting_funds(rt);
        self.expect_update_pledge(rt, &-vested);

        let result = rt.call::<Actor>(
            Method::PreCommitSector as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        );
        if result.is_err() {
            rt.reset();
        }
        result
    }

    pub fn pre_commit_sector(
        &self,
        rt: &MockRuntime,
        params: PreCommitSectorParams,
        cfg: PreCommitConfig,
    ) -> SectorPreCommitOnChainInfo {
        let sector_number = params.sector_number;
        let result = self.pre_commit_sector_raw(rt, params, cfg).unwrap();
        expect_empty(result);
        rt.verify();

        self.get_precommit(rt, sector_number)
    }

    pub fn get_precommit(
        &self,
        rt: &MockRuntime,
        sector_number: SectorNumber,
    ) -> SectorPreCommitOnChainInfo {
        let state = self.get_state(rt);
        state.get_precommitted_sector(&rt.store, sector_number).unwrap().unwrap()
    }

    pub fn has_precommit(&self, rt: &MockRuntime, sector_number: SectorNumber) -> bool {
        let state = self.get_state(rt);
        state.get_precommitted_sector(&rt.store, sector_number).unwrap().is_some()
    }

    pub fn prove_commit_sector(
        &self,
        rt: &MockRuntime,
        pc: &SectorPreCommitOnChainInfo,
        params: ProveCommitSectorParams,
    ) -> Result<Option<IpldBlock>, ActorError> {
        let commd = make_piece_cid(b"commd");
        let seal_rand = TEST_RANDOMNESS;
        let seal_int_rand = TEST_RANDOMNESS;
        let interactive_epoch = pc.pre_commit_epoch + rt.policy.pre_commit_challenge_delay;

        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
        rt.expect_validate_caller_any();

        let cdc_params = ComputeDataCommitmentParams {
            deal_ids: pc.info.deal_ids.clone(),
            sector_type: pc.info.seal_proof,
        };
        rt.expect_send_simple(
            STORAGE_MARKET_ACTOR_ADDR,
            COMPUTE_DATA_COMMITMENT_METHOD,
            IpldBlock::serialize_cbor(&cdc_params).unwrap(),
            TokenAmount::zero(),
            IpldBlock::serialize_cbor(&ComputeDataCommitmentReturn { commd }).unwrap(),
            ExitCode::OK,
        );

        let entropy = fvm_ipld_encoding::to_vec(&self.receiver).unwrap();
        rt.expect_get_randomness_from_tickets(
            DomainSeparationTag::SealRandomness,
            pc.info.seal_rand_epoch,
            entropy.clone(),
            seal_rand,
        );
        rt.expect_get_randomness_from_beacon(
            DomainSeparationTag::InteractiveSealChallengeSeed,
            interactive_epoch,
            entropy,
            seal_int_rand,
        );

        let seal = SealVerifyInfo {
            registered_proof: pc.info.seal_proof,
            sector_id: SectorID { miner: RECEIVER_ID, number: pc.info.sector_number },
            deal_ids: pc.info.deal_ids.clone(),
            randomness: Randomness(seal_rand.into()),
            interactive_randomness: Randomness(seal_int_rand.into()),
            proof: params.proof.clone().into(),
            sealed_cid: pc.info.sealed_cid,
            unsealed_cid: commd,
        };
        rt.expect_send_simple(
            STORAGE_POWER_ACTOR_ADDR,
            SUBMIT_POREP_FOR_BULK_VERIFY_METHOD,
            IpldBlock::serialize_cbor(&seal).unwrap(),
            TokenAmount::zero(),
            None,
            ExitCode::OK,
        );

        let result = rt.call::<Actor>(
            Method::ProveCommitSector as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        );
        if result.is_err() {
            rt.reset();
        }
        result
    }

    pub fn confirm_sector_proofs_valid(
        &self,
        rt: &MockRuntime,
        cfg: ProveCommitConfig,
        pcs: &[SectorPreCommitOnChainInfo],
    ) -> Result<Option<IpldBlock>, ActorError> {
        rt.set_caller(*POWER_ACTOR_CODE_ID, STORAGE_POWER_ACTOR_ADDR);
        rt.expect_validate_caller_addr(vec![STORAGE_POWER_ACTOR_ADDR]);
        self.expect_query_network_info(rt);

        let mut valid_pcs = Vec::new();
        for pc in pcs {
            if !pc.info.deal_ids.is_empty() {
                let exit = cfg
                    .activate_deals_exit
                    .get(&pc.info.sector_number)
                    .copied()
                    .unwrap_or(ExitCode::OK);
                let params = ActivateDealsParams {
                    deal_ids: pc.info.deal_ids.clone(),
                    sector_expiry: pc.info.expiration,
                };
                rt.expect_send_simple(
                    STORAGE_MARKET_ACTOR_ADDR,
                    ACTIVATE_DEALS_METHOD,
                    IpldBlock::serialize_cbor(&params).unwrap(),
                    TokenAmount::zero(),
                    None,
                    exit,
                );
                if exit != ExitCode::OK {
                    continue;
                }
            }
            valid_pcs.push(pc);
        }

        if !valid_pcs.is_empty() {
            let activation = *rt.epoch.borrow();
            let circulating_supply = rt.circulating_supply.borrow().clone();
            let mut expected_pledge = TokenAmount::zero();
            let mut expected_power = PowerPair::zero();
            for pc in valid_pcs {
                let duration = pc.info.expiration - activation;
                if duration < rt.policy.min_sector_expiration {
                    continue;
                }
                let qa = qa_power_for_weight(
                    self.sector_size,
                    duration,
                    &pc.deal_weight,
                    &pc.verified_deal_weight,
                );
                expected_pledge += initial_pledge_for_power(
                    &rt.policy,
                    &qa,
                    &self.baseline_power,
                    &self.epoch_reward_smooth,
                    &self.epoch_qa_power_smooth,
                    &circulating_supply,
                );
                expected_power += &PowerPair::new(BigInt::from(self.sector_size as u64), qa);
            }

            self.expect_update_power(rt, &expected_power);
            let vested = self.immediately_vesting_funds(rt);
            self.expect_update_pledge(rt, &(expected_pledge - vested));
        }

        let params = ConfirmSectorProofsParams {
            sectors: pcs.iter().map(|pc| pc.info.sector_number).collect(),
        };
        let result = rt.call::<Actor>(
            Method::ConfirmSectorProofsValid as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        );
        if result.is_err() {
            rt.reset();
        }
        result
    }

    pub fn prove_commit_sector_and_confirm(
        &self,
        rt: &MockRuntime,
        pc: &SectorPreCommitOnChainInfo,
        params: ProveCommitSectorParams,
        cfg: ProveCommitConfig,
    ) -> SectorOnChainInfo {
        let sector_number = params.sector_number;
        let result = self.prove_commit_sector(rt, pc, params).unwrap();
        expect_empty(result);
        rt.verify();

        let result = self.confirm_sector_proofs_valid(rt, cfg, &[pc.clone()]).unwrap();
        expect_empty(result);
        rt.verify();

        self.get_sector(rt, sector_number)
    }

    /// Pre-commits and proves `num_sectors` sectors, all expiring `lifetime_periods` proving
    /// periods after the current one. Deal ids are taken in order from `deal_ids`, missing
    /// entries meaning no deals.
    pub fn commit_and_prove_sectors(
        &mut self,
        rt: &MockRuntime,
        num_sectors: usize,
        lifetime_periods: i64,
        deal_ids: Vec<Vec<DealID>>,
    ) -> Vec<SectorOnChainInfo> {
        let precommit_epoch = *rt.epoch.borrow();
        let deadline = self.deadline(rt);
        let expiration =
            deadline.period_end() + lifetime_periods * rt.policy.wpost_proving_period;

        let mut precommits = Vec::with_capacity(num_sectors);
        for i in 0..num_sectors {
            let sector_no = self.next_sector_no();
            let sector_deals = deal_ids.get(i).cloned().unwrap_or_default();
            let params = self.make_pre_commit_params(
                sector_no,
                precommit_epoch - 1,
                expiration,
                sector_deals,
            );
            let precommit = self.pre_commit_sector(rt, params, PreCommitConfig::default());
            precommits.push(precommit);
        }

        self.advance_to_epoch_with_cron(
            rt,
            precommit_epoch + rt.policy.pre_commit_challenge_delay + 1,
        );

        let mut info = Vec::with_capacity(num_sectors);
        for pc in precommits {
            let sector = self.prove_commit_sector_and_confirm(
                rt,
                &pc,
                self.make_prove_commit_params(pc.info.sector_number),
                ProveCommitConfig::empty(),
            );
            info.push(sector);
        }
        rt.reset();
        info
    }

    pub fn check_sector_proven(
        &self,
        rt: &MockRuntime,
        sector_number: SectorNumber,
    ) -> Result<Option<IpldBlock>, ActorError> {
        rt.expect_validate_caller_any();
        let params = fil_actor_miner::CheckSectorProvenParams { sector_number };
        let result = rt.call::<Actor>(
            Method::CheckSectorProven as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        );
        rt.verify();
        result
    }

    pub fn get_sector(&self, rt: &MockRuntime, sector_number: SectorNumber) -> SectorOnChainInfo {
        let state = self.get_state(rt);
        state.get_sector(&rt.store, sector_number).unwrap().unwrap()
    }

    pub fn deadline(&self, rt: &MockRuntime) -> DeadlineInfo {
        let state = self.get_state(rt);
        state.deadline_info(&rt.policy, *rt.epoch.borrow())
    }

    pub fn get_deadline(&self, rt: &MockRuntime, deadline_idx: u64) -> Deadline {
        let state = self.get_state(rt);
        let deadlines = state.load_deadlines(&rt.store).unwrap();
        deadlines.load_deadline(&rt.policy, &rt.store, deadline_idx).unwrap()
    }

    pub fn get_partition(
        &self,
        rt: &MockRuntime,
        deadline_idx: u64,
        partition_idx: u64,
    ) -> Partition {
        let deadline = self.get_deadline(rt, deadline_idx);
        deadline.load_partition(&rt.store, partition_idx).unwrap()
    }

    pub fn find_sector(&self, rt: &MockRuntime, sector_number: SectorNumber) -> (u64, u64) {
        let state = self.get_state(rt);
        state.find_sector(&rt.policy, &rt.store, sector_number).unwrap()
    }

    /// Runs deadline crons until the current deadline contains `epoch`, then moves to it.
    pub fn advance_to_epoch_with_cron(&self, rt: &MockRuntime, epoch: ChainEpoch) {
        let mut deadline = self.deadline(rt);
        while deadline.last() < epoch {
            self.advance_deadline(rt, CronConfig::empty());
            deadline = self.deadline(rt);
        }
        rt.set_epoch(epoch);
    }

    /// Advances to the open epoch of the given deadline index, running the crons in between.
    pub fn advance_to_deadline(&self, rt: &MockRuntime, deadline_idx: u64) -> DeadlineInfo {
        let mut deadline = self.deadline(rt);
        while deadline.index != deadline_idx || !deadline.period_started() {
            deadline = self.advance_deadline(rt, CronConfig::empty());
        }
        deadline
    }

    /// Runs the cron callback that closes the current deadline and moves the clock to the
    /// opening of the next one. Before the first period starts this is the single cron that
    /// fires the epoch before the period.
    pub fn advance_deadline(&self, rt: &MockRuntime, mut cfg: CronConfig) -> DeadlineInfo {
        let deadline = self.deadline(rt);
        let current = *rt.epoch.borrow();

        if deadline.period_started() {
            rt.set_epoch(std::cmp::max(deadline.last(), current));
            cfg.expected_enrollment = deadline.last() + rt.policy.wpost_challenge_window;
            self.on_deadline_cron(rt, cfg);
            let now = *rt.epoch.borrow();
            rt.set_epoch(std::cmp::max(deadline.next_open(), now));
        } else {
            // The first cron leaves the deadline index alone, so deadline 0 comes next.
            rt.set_epoch(deadline.period_start - 1);
            cfg.expected_enrollment = deadline.last();
            self.on_deadline_cron(rt, cfg);
            rt.set_epoch(deadline.open);
        }
        self.deadline(rt)
    }

    pub fn on_deadline_cron(&self, rt: &MockRuntime, cfg: CronConfig) {
        rt.set_caller(*POWER_ACTOR_CODE_ID, STORAGE_POWER_ACTOR_ADDR);
        rt.expect_validate_caller_addr(vec![STORAGE_POWER_ACTOR_ADDR]);

        self.expect_query_network_info(rt);
        let vested = self.immediately_vesting_funds(rt);

        self.expect_update_power(rt, &cfg.expected_power_delta);
        self.expect_burn(rt, &cfg.expected_penalty);
        self.expect_update_pledge(rt, &(cfg.expected_pledge_delta - vested));
        self.expect_enroll_cron(rt, cfg.expected_enrollment, CRON_EVENT_PROVING_DEADLINE);

        let result = rt
            .call::<Actor>(
                Method::OnDeferredCronEvent as u64,
                IpldBlock::serialize_cbor(&CronEventPayload {
                    event_type: CRON_EVENT_PROVING_DEADLINE,
                })
                .unwrap(),
            )
            .unwrap();
        expect_empty(result);
        rt.verify();
    }

    pub fn submit_window_post(
        &self,
        rt: &MockRuntime,
        deadline: &DeadlineInfo,
        partitions: Vec<PoStPartition>,
        infos: Vec<SectorOnChainInfo>,
        cfg: PoStConfig,
    ) {
        let result = self.submit_window_post_raw(rt, deadline, partitions, infos, cfg).unwrap();
        expect_empty(result);
        rt.verify();
    }

    pub fn submit_window_post_raw(
        &self,
        rt: &MockRuntime,
        deadline: &DeadlineInfo,
        partitions: Vec<PoStPartition>,
        infos: Vec<SectorOnChainInfo>,
        cfg: PoStConfig,
    ) -> Result<Option<IpldBlock>, ActorError> {
        let chain_commit_epoch = deadline.challenge;
        let chain_commit_rand = match cfg.chain_randomness {
            Some(r) => Randomness(r.into()),
            None => Randomness(TEST_RANDOMNESS.into()),
        };
        rt.expect_get_randomness_from_tickets(
            DomainSeparationTag::PoStChainCommit,
            chain_commit_epoch,
            Vec::new(),
            TEST_RANDOMNESS,
        );

        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
        self.expect_query_network_info(rt);
        rt.expect_validate_caller_addr(self.caller_addrs());

        let proofs = make_post_proofs(self.window_post_proof_type);
        if !infos.is_empty() {
            let entropy = fvm_ipld_encoding::to_vec(&self.receiver).unwrap();
            rt.expect_get_randomness_from_beacon(
                DomainSeparationTag::WindowedPoStChallengeSeed,
                deadline.challenge,
                entropy,
                TEST_RANDOMNESS,
            );

            let challenged_sectors = infos
                .iter()
                .map(|s| SectorInfo {
                    proof: s.seal_proof,
                    sector_number: s.sector_number,
                    sealed_cid: s.sealed_cid,
                })
                .collect();
            let verify_info = WindowPoStVerifyInfo {
                randomness: Randomness(TEST_RANDOMNESS.into()),
                proofs: proofs.clone(),
                challenged_sectors,
                prover: RECEIVER_ID,
            };
            rt.expect_verify_post(verify_info, cfg.verification_exit.unwrap_or(ExitCode::OK));
        }

        if let Some(power_delta) = &cfg.expected_power_delta {
            self.expect_update_power(rt, power_delta);
        }
        self.expect_burn(rt, &cfg.expected_penalty);
        self.expect_update_pledge(rt, &cfg.expected_pledge_delta);

        let params = SubmitWindowedPoStParams {
            deadline: deadline.index,
            partitions,
            proofs,
            chain_commit_epoch,
            chain_commit_rand,
        };
        let result = rt.call::<Actor>(
            Method::SubmitWindowedPoSt as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        );
        if result.is_err() {
            rt.reset();
        }
        result
    }

    pub fn declare_faults(
        &self,
        rt: &MockRuntime,
        fault_sector_infos: &[SectorOnChainInfo],
    ) -> PowerPair {
        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
        rt.expect_validate_caller_addr(self.caller_addrs());

        let expected_delta = -power_for_sectors(self.sector_size, fault_sector_infos);
        self.expect_update_power(rt, &expected_delta);

        let faults = self
            .group_by_partition(rt, fault_sector_infos.iter().map(|s| s.sector_number))
            .into_iter()
            .map(|((deadline, partition), sectors)| FaultDeclaration {
                deadline,
                partition,
                sectors,
            })
            .collect();
        let params = DeclareFaultsParams { faults };

        let result = rt
            .call::<Actor>(
                Method::DeclareFaults as u64,
                IpldBlock::serialize_cbor(&params).unwrap(),
            )
            .unwrap();
        expect_empty(result);
        rt.verify();

        expected_delta
    }

    pub fn declare_recoveries(
        &self,
        rt: &MockRuntime,
        deadline: u64,
        partition: u64,
        sectors: BitField,
    ) -> Result<Option<IpldBlock>, ActorError> {
        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
        rt.expect_validate_caller_addr(self.caller_addrs());

        let params = DeclareFaultsRecoveredParams {
            recoveries: vec![RecoveryDeclaration { deadline, partition, sectors }],
        };
        let result = rt.call::<Actor>(
            Method::DeclareFaultsRecovered as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        );
        if result.is_err() {
            rt.reset();
        } else {
            rt.verify();
        }
        result
    }

    pub fn termination_fee(&self, rt: &MockRuntime, sector: &SectorOnChainInfo) -> TokenAmount {
        pledge_penalty_for_termination(
            &rt.policy,
            &sector.expected_day_reward,
            &sector.expected_storage_pledge,
            *rt.epoch.borrow() - sector.activation,
            &self.epoch_reward_smooth,
            &self.epoch_qa_power_smooth,
            &qa_power_for_sector(self.sector_size, sector),
        )
    }

    /// Terminates active sectors with no pending terminations, expecting the fee to be
    /// paid from the unlocked balance.
    pub fn terminate_sectors(
        &self,
        rt: &MockRuntime,
        sectors: &[SectorOnChainInfo],
        expected_fee: TokenAmount,
    ) -> (PowerPair, TokenAmount) {
        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
        rt.expect_validate_caller_addr(self.caller_addrs());

        let mut deal_ids = Vec::new();
        let mut pledge_delta = TokenAmount::zero();
        for sector in sectors {
            deal_ids.extend(sector.deal_ids.iter().copied());
            pledge_delta -= &sector.initial_pledge;
        }
        let power_delta = -power_for_sectors(self.sector_size, sectors);

        self.expect_query_network_info(rt);
        self.expect_burn(rt, &expected_fee);
        self.expect_update_pledge(rt, &pledge_delta);
        self.expect_terminate_deals(rt, *rt.epoch.borrow(), deal_ids);
        self.expect_update_power(rt, &power_delta);

        let terminations = self
            .group_by_partition(rt, sectors.iter().map(|s| s.sector_number))
            .into_iter()
            .map(|((deadline, partition), sectors)| TerminationDeclaration {
                deadline,
                partition,
                sectors,
            })
            .collect();
        let params = TerminateSectorsParams { terminations };

        let ret = rt
            .call::<Actor>(
                Method::TerminateSectors as u64,
                IpldBlock::serialize_cbor(&params).unwrap(),
            )
            .unwrap()
            .unwrap()
            .deserialize::<TerminateSectorsReturn>()
            .unwrap();
        assert!(ret.done);
        rt.verify();

        (power_delta, pledge_delta)
    }

    pub fn extend_sectors(
        &self,
        rt: &MockRuntime,
        extensions: Vec<ExpirationExtension>,
        expected_power_delta: &PowerPair,
    ) -> Result<Option<IpldBlock>, ActorError> {
        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
        rt.expect_validate_caller_addr(self.caller_addrs());
        self.expect_update_power(rt, expected_power_delta);

        let params = ExtendSectorExpirationParams { extensions };
        let result = rt.call::<Actor>(
            Method::ExtendSectorExpiration as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        );
        if result.is_err() {
            rt.reset();
        } else {
            rt.verify();
        }
        result
    }

    pub fn compact_sector_numbers(
        &self,
        rt: &MockRuntime,
        caller: Address,
        mask: BitField,
    ) -> Result<Option<IpldBlock>, ActorError> {
        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, caller);
        rt.expect_validate_caller_addr(self.caller_addrs());

        let params = CompactSectorNumbersParams { mask_sector_numbers: mask };
        let result = rt.call::<Actor>(
            Method::CompactSectorNumbers as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        );
        if result.is_err() {
            rt.reset();
        } else {
            rt.verify();
        }
        result
    }

    pub fn withdraw_funds(
        &self,
        rt: &MockRuntime,
        amount_requested: &TokenAmount,
        expected_withdrawn: &TokenAmount,
    ) {
        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.owner);
        rt.expect_validate_caller_addr(vec![self.owner]);

        if expected_withdrawn.is_positive() {
            rt.expect_send_simple(
                self.owner,
                METHOD_SEND,
                None,
                expected_withdrawn.clone(),
                None,
                ExitCode::OK,
            );
        }
        let vested = self.immediately_vesting_funds(rt);
        self.expect_update_pledge(rt, &-vested);

        let params = WithdrawBalanceParams { amount_requested: amount_requested.clone() };
        let ret = rt
            .call::<Actor>(
                Method::WithdrawBalance as u64,
                IpldBlock::serialize_cbor(&params).unwrap(),
            )
            .unwrap()
            .unwrap()
            .deserialize::<WithdrawBalanceReturn>()
            .unwrap();
        assert_eq!(*expected_withdrawn, ret.amount_withdrawn);
        rt.verify();
    }

    /// Locks `amount`, sent along by the reward actor, in the vesting table.
    pub fn add_locked_fund(&self, rt: &MockRuntime, amount: TokenAmount) {
        rt.set_caller(*REWARD_ACTOR_CODE_ID, REWARD_ACTOR_ADDR);
        rt.set_received(amount.clone());
        rt.add_balance(amount.clone());

        let mut allowed = self.control_addrs.clone();
        allowed.extend([self.owner, self.worker, REWARD_ACTOR_ADDR]);
        rt.expect_validate_caller_addr(allowed);

        let vested = self.immediately_vesting_funds(rt);
        self.expect_update_pledge(rt, &(amount.clone() - vested));

        let result = rt
            .call::<Actor>(
                Method::AddLockedFund as u64,
                IpldBlock::serialize_cbor(&AddLockedFundParams { amount }).unwrap(),
            )
            .unwrap();
        expect_empty(result);
        rt.verify();
        rt.set_received(TokenAmount::zero());
    }

    pub fn report_consensus_fault(
        &self,
        rt: &MockRuntime,
        from: Address,
        fault: ConsensusFault,
    ) {
        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, from);
        rt.expect_validate_caller_type(vec![Type::Account, Type::Multisig]);

        let params = ReportConsensusFaultParams {
            header1: vec![1],
            header2: vec![2],
            header_extra: vec![],
        };
        rt.expect_verify_consensus_fault(
            params.header1.clone(),
            params.header2.clone(),
            params.header_extra.clone(),
            Some(fault.clone()),
            ExitCode::OK,
        );

        let age = *rt.epoch.borrow() - fault.epoch;
        let reward = reward_for_consensus_slash_report(&rt.policy, age, &rt.get_balance());
        rt.expect_send_simple(from, METHOD_SEND, None, reward, None, ExitCode::OK);

        let state = self.get_state(rt);
        rt.expect_send_simple(
            STORAGE_POWER_ACTOR_ADDR,
            ON_CONSENSUS_FAULT_METHOD,
            IpldBlock::serialize_cbor(&state.locked_funds).unwrap(),
            TokenAmount::zero(),
            None,
            ExitCode::OK,
        );

        let mut deal_ids = Vec::new();
        state
            .for_each_sector(&rt.store, |sector| {
                deal_ids.extend_from_slice(&sector.deal_ids);
                Ok(())
            })
            .unwrap();
        self.expect_terminate_deals(rt, *rt.epoch.borrow(), deal_ids);
        rt.expect_delete_actor(BURNT_FUNDS_ACTOR_ADDR);

        let result = rt
            .call::<Actor>(
                Method::ReportConsensusFault as u64,
                IpldBlock::serialize_cbor(&params).unwrap(),
            )
            .unwrap();
        expect_empty(result);
        rt.verify();
    }

    fn group_by_partition(
        &self,
        rt: &MockRuntime,
        sector_numbers: impl Iterator<Item = SectorNumber>,
    ) -> BTreeMap<(u64, u64), BitField> {
        let mut grouped = BTreeMap::<(u64, u64), Vec<u64>>::new();
        for sector_number in sector_numbers {
            let location = self.find_sector(rt, sector_number);
            grouped.entry(location).or_default().push(sector_number);
        }
        grouped
            .into_iter()
            .map(|(location, numbers)| (location, BitField::try_from_bits(numbers).unwrap()))
            .collect()
    }
}

#[derive(Default)]
pub struct PreCommitConfig {
    pub deal_weight: DealWeight,
    pub verified_deal_weight: DealWeight,
}

impl PreCommitConfig {
    pub fn empty() -> PreCommitConfig {
        Default::default()
    }
}

#[derive(Default)]
pub struct ProveCommitConfig {
    pub activate_deals_exit: HashMap<SectorNumber, ExitCode>,
}

impl ProveCommitConfig {
    pub fn empty() -> ProveCommitConfig {
        Default::default()
    }
}

#[derive(Default)]
pub struct PoStConfig {
    pub chain_randomness: Option<[u8; 32]>,
    pub expected_power_delta: Option<PowerPair>,
    pub expected_penalty: TokenAmount,
    pub expected_pledge_delta: TokenAmount,
    pub verification_exit: Option<ExitCode>,
}

impl PoStConfig {
    pub fn empty() -> PoStConfig {
        Default::default()
    }

    pub fn with_expected_power_delta(pwr: &PowerPair) -> PoStConfig {
        PoStConfig { expected_power_delta: Some(pwr.clone()), ..Default::default() }
    }

    pub fn with_randomness(rand: [u8; 32]) -> PoStConfig {
        PoStConfig { chain_randomness: Some(rand), ..Default::default() }
    }
}

#[derive(Default)]
pub struct CronConfig {
    pub expected_enrollment: ChainEpoch,
    pub expected_power_delta: PowerPair,
    pub expected_penalty: TokenAmount,
    /// Pledge change apart from vesting, which is computed from state.
    pub expected_pledge_delta: TokenAmount,
}

impl CronConfig {
    pub fn empty() -> CronConfig {
        Default::default()
    }
}

pub fn next_period_start(
    policy: &fil_actors_runtime::runtime::Policy,
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

pub fn make_post_proofs(proof_type: RegisteredPoStProof) -> Vec<PoStProof> {
    vec![PoStProof { post_proof: proof_type, proof_bytes: b"proof1".to_vec() }]
}

pub fn make_bitfield(bits: &[u64]) -> BitField {
    BitField::try_from_bits(bits.iter().copied()).unwrap()
}

pub fn assert_bitfield_equals(bf: &BitField, bits: &[u64]) {
    let mut rbf = BitField::new();
    for bit in bits {
        rbf.set(*bit);
    }
    assert!(bf == &rbf, "expected {:?}, got {:?}", bits, bf.iter().collect::<Vec<_>>());
}

pub fn sector_power(h: &ActorHarness, sectors: &[SectorOnChainInfo]) -> PowerPair {
    power_for_sectors(h.sector_size, sectors)
}

/// Hash function that returns the offset in the first eight bytes, big-endian, so the
/// miner's proving period offset is predictable.
fn fixed_hasher(offset: ChainEpoch) -> Box<dyn Fn(&[u8]) -> [u8; 32]> {
    let hash = move |_: &[u8]| -> [u8; 32] {
        let mut result = [0u8; 32];
        result[..8].copy_from_slice(&(offset as u64).to_be_bytes());
        result
    };
    Box::new(hash)
}
