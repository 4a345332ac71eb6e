// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fil_actor_miner::ext::account::PUBKEY_ADDRESS_METHOD;
use fil_actor_miner::{Actor, ChangeWorkerAddressParams, Method, CRON_EVENT_WORKER_KEY_CHANGE};
use fil_actors_runtime::test_utils::*;
use fvm_ipld_encoding::ipld_block::IpldBlock;
use fvm_shared::address::Address;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use num_traits::Zero;

mod util;
use util::*;

fn setup() -> (ActorHarness, MockRuntime) {
    let h = ActorHarness::new(PERIOD_OFFSET);
    let rt = h.new_runtime();
    h.construct_and_verify(&rt);
    (h, rt)
}

#[test]
fn get_addresses() {
    let (h, rt) = setup();

    let (owner, worker, control_addrs) = h.get_control_addresses(&rt);
    assert_eq!(h.owner, owner);
    assert_eq!(h.worker, worker);
    assert_eq!(h.control_addrs, control_addrs);

    h.check_state(&rt);
}

#[test]
fn worker_change_takes_effect_after_delay() {
    let (h, rt) = setup();
    rt.set_epoch(100);

    let new_worker = Address::new_id(501);
    let new_worker_key = new_bls_addr(2);
    let result =
        h.change_worker_address(&rt, new_worker, new_worker_key, h.control_addrs.clone()).unwrap();
    expect_empty(result);

    let effective_at = 100 + rt.policy.worker_key_change_delay;
    let info = h.get_state(&rt).get_info(&rt.store).unwrap();
    assert_eq!(h.worker, info.worker);
    let pending = info.pending_worker_key.unwrap();
    assert_eq!(new_worker, pending.new_worker);
    assert_eq!(effective_at, pending.effective_at);

    // A callback before the change is due leaves the pending key in place.
    rt.set_epoch(effective_at - 1);
    h.confirm_worker_key_change(&rt);
    let info = h.get_state(&rt).get_info(&rt.store).unwrap();
    assert_eq!(h.worker, info.worker);
    assert!(info.pending_worker_key.is_some());

    rt.set_epoch(effective_at);
    h.confirm_worker_key_change(&rt);
    let info = h.get_state(&rt).get_info(&rt.store).unwrap();
    assert_eq!(new_worker, info.worker);
    assert!(info.pending_worker_key.is_none());

    let (_, worker, _) = h.get_control_addresses(&rt);
    assert_eq!(new_worker, worker);
    h.check_state(&rt);
}

#[test]
fn later_worker_change_replaces_pending_change() {
    let (h, rt) = setup();
    rt.set_epoch(100);

    let first = Address::new_id(501);
    h.change_worker_address(&rt, first, new_bls_addr(2), h.control_addrs.clone()).unwrap();

    rt.set_epoch(200);
    let second = Address::new_id(502);
    h.change_worker_address(&rt, second, new_bls_addr(3), h.control_addrs.clone()).unwrap();

    // The first callback is now early for the replacement change.
    rt.set_epoch(100 + rt.policy.worker_key_change_delay);
    h.confirm_worker_key_change(&rt);
    assert_eq!(h.worker, h.get_state(&rt).get_info(&rt.store).unwrap().worker);

    rt.set_epoch(200 + rt.policy.worker_key_change_delay);
    h.confirm_worker_key_change(&rt);
    assert_eq!(second, h.get_state(&rt).get_info(&rt.store).unwrap().worker);
}

#[test]
fn control_addresses_change_immediately() {
    let (h, rt) = setup();

    let new_control = Address::new_id(601);
    rt.set_address_actor_type(new_control, *MULTISIG_ACTOR_CODE_ID);

    // Same worker, so nothing is scheduled.
    let result = h.change_worker_address(&rt, h.worker, h.worker_key, vec![new_control]).unwrap();
    expect_empty(result);

    let (_, worker, control_addrs) = h.get_control_addresses(&rt);
    assert_eq!(h.worker, worker);
    assert_eq!(vec![new_control], control_addrs);
    assert!(h.get_state(&rt).get_info(&rt.store).unwrap().pending_worker_key.is_none());
    h.check_state(&rt);
}

#[test]
fn clearing_control_addresses() {
    let (h, rt) = setup();

    h.change_worker_address(&rt, h.worker, h.worker_key, vec![]).unwrap();
    let (_, _, control_addrs) = h.get_control_addresses(&rt);
    assert!(control_addrs.is_empty());
}

#[test]
fn fails_if_control_address_is_not_principal() {
    let (h, rt) = setup();

    let bad_control = Address::new_id(602);
    rt.set_address_actor_type(bad_control, *MINER_ACTOR_CODE_ID);

    rt.expect_send_simple(
        h.worker,
        PUBKEY_ADDRESS_METHOD,
        None,
        TokenAmount::zero(),
        IpldBlock::serialize_cbor(&h.worker_key).unwrap(),
        ExitCode::OK,
    );
    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.owner);
    let params = ChangeWorkerAddressParams {
        new_worker: h.worker,
        new_control_addresses: vec![bad_control],
    };
    expect_abort_contains_message(
        ExitCode::USR_ILLEGAL_ARGUMENT,
        "must be a principal",
        rt.call::<Actor>(
            Method::ChangeWorkerAddress as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        ),
    );
    rt.verify();
}

#[test]
fn only_owner_can_change_worker() {
    let (h, rt) = setup();

    let new_worker = Address::new_id(501);
    rt.set_address_actor_type(new_worker, *ACCOUNT_ACTOR_CODE_ID);
    rt.expect_send_simple(
        new_worker,
        PUBKEY_ADDRESS_METHOD,
        None,
        TokenAmount::zero(),
        IpldBlock::serialize_cbor(&new_bls_addr(2)).unwrap(),
        ExitCode::OK,
    );

    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.worker);
    rt.expect_validate_caller_addr(vec![h.owner]);
    let params = ChangeWorkerAddressParams { new_worker, new_control_addresses: vec![] };
    expect_abort(
        ExitCode::USR_FORBIDDEN,
        rt.call::<Actor>(
            Method::ChangeWorkerAddress as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        ),
    );
    rt.verify();

    let info = h.get_state(&rt).get_info(&rt.store).unwrap();
    assert!(info.pending_worker_key.is_none());
    assert_eq!(h.control_addrs, info.control_addresses);
}

#[test]
fn unknown_cron_event_is_ignored() {
    let (h, rt) = setup();

    let result = h.on_cron_event(&rt, 42).unwrap();
    expect_empty(result);
    rt.verify();

    // A key change callback with nothing pending is also a no-op.
    let result = h.on_cron_event(&rt, CRON_EVENT_WORKER_KEY_CHANGE).unwrap();
    expect_empty(result);
    rt.verify();
    h.check_state(&rt);
}
