// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fil_actor_miner::{reward_for_consensus_slash_report, Actor, Method, ReportConsensusFaultParams};
use fil_actors_runtime::runtime::builtins::Type;
use fil_actors_runtime::test_utils::*;
use fvm_ipld_encoding::ipld_block::IpldBlock;
use fvm_shared::address::Address;
use fvm_shared::consensus::{ConsensusFault, ConsensusFaultType};
use fvm_shared::error::ExitCode;

mod util;
use util::*;

fn setup() -> (ActorHarness, MockRuntime) {
    let h = ActorHarness::new(PERIOD_OFFSET);
    let rt = h.new_runtime();
    h.construct_and_verify(&rt);
    (h, rt)
}

fn reporter() -> Address {
    Address::new_id(1234)
}

fn report_raw(
    rt: &MockRuntime,
    fault: Option<ConsensusFault>,
) -> Result<Option<IpldBlock>, fil_actors_runtime::ActorError> {
    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, reporter());
    rt.expect_validate_caller_type(vec![Type::Account, Type::Multisig]);

    let params =
        ReportConsensusFaultParams { header1: vec![1], header2: vec![2], header_extra: vec![] };
    rt.expect_verify_consensus_fault(
        params.header1.clone(),
        params.header2.clone(),
        params.header_extra.clone(),
        fault,
        ExitCode::OK,
    );
    let result = rt.call::<Actor>(
        Method::ReportConsensusFault as u64,
        IpldBlock::serialize_cbor(&params).unwrap(),
    );
    rt.reset();
    result
}

#[test]
fn report_pays_reporter_and_removes_miner() {
    let (h, rt) = setup();
    rt.set_epoch(10);

    let fault = ConsensusFault {
        target: h.receiver,
        epoch: 9,
        fault_type: ConsensusFaultType::DoubleForkMining,
    };
    h.report_consensus_fault(&rt, reporter(), fault);
}

#[test]
fn report_terminates_deals_of_all_sectors() {
    let (mut h, rt) = setup();
    rt.set_epoch(1);
    h.commit_and_prove_sectors(&rt, 2, DEFAULT_SECTOR_EXPIRATION, vec![vec![10], vec![11, 12]]);

    // Locked funds are handed to the power actor.
    h.add_locked_fund(&rt, fvm_shared::econ::TokenAmount::from_whole(1));

    let fault = ConsensusFault {
        target: h.receiver,
        epoch: *rt.epoch.borrow() - 1,
        fault_type: ConsensusFaultType::ParentGrinding,
    };
    h.report_consensus_fault(&rt, reporter(), fault);
}

#[test]
fn reporter_share_grows_with_fault_age() {
    let rt = MockRuntime::default();
    let balance = big_balance();
    let young = reward_for_consensus_slash_report(&rt.policy, 1, &balance);
    let old = reward_for_consensus_slash_report(&rt.policy, 100, &balance);
    assert!(young.is_positive());
    assert!(old > young);
    assert!(old <= balance);
}

#[test]
fn missing_fault_is_rejected() {
    let (_, rt) = setup();
    rt.set_epoch(1);
    expect_abort_contains_message(
        ExitCode::USR_ILLEGAL_ARGUMENT,
        "No consensus fault found",
        report_raw(&rt, None),
    );
}

#[test]
fn mistargeted_report_is_rejected() {
    let (_, rt) = setup();
    rt.set_epoch(10);
    let fault = ConsensusFault {
        target: Address::new_id(4321),
        epoch: 9,
        fault_type: ConsensusFaultType::DoubleForkMining,
    };
    expect_abort_contains_message(
        ExitCode::USR_ILLEGAL_ARGUMENT,
        "reported to miner",
        report_raw(&rt, Some(fault)),
    );
}

#[test]
fn fault_from_the_future_is_rejected() {
    let (h, rt) = setup();
    rt.set_epoch(10);
    let fault = ConsensusFault {
        target: h.receiver,
        epoch: 10,
        fault_type: ConsensusFaultType::TimeOffsetMining,
    };
    expect_abort_contains_message(
        ExitCode::USR_ILLEGAL_ARGUMENT,
        "invalid fault epoch",
        report_raw(&rt, Some(fault)),
    );
    h.check_state(&rt);
}
