// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fil_actor_miner::{Actor, Method, WithdrawBalanceParams};
use fil_actors_runtime::test_utils::*;
use fvm_ipld_encoding::ipld_block::IpldBlock;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use num_traits::Zero;

mod util;
use util::*;

fn withdraw_raw(
    h: &ActorHarness,
    rt: &MockRuntime,
    caller: fvm_shared::address::Address,
    amount: TokenAmount,
) -> Result<Option<IpldBlock>, fil_actors_runtime::ActorError> {
    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, caller);
    rt.expect_validate_caller_addr(vec![h.owner]);
    let params = WithdrawBalanceParams { amount_requested: amount };
    let result = rt.call::<Actor>(
        Method::WithdrawBalance as u64,
        IpldBlock::serialize_cbor(&params).unwrap(),
    );
    rt.reset();
    result
}

#[test]
fn happy_path_withdraws_all_funds() {
    let h = ActorHarness::new(PERIOD_OFFSET);
    let rt = h.new_runtime();
    h.construct_and_verify(&rt);

    let balance = rt.get_balance();
    h.withdraw_funds(&rt, &balance, &balance);
    assert!(rt.get_balance().is_zero());
    h.check_state(&rt);
}

#[test]
fn withdraws_less_than_requested_when_balance_is_short() {
    let h = ActorHarness::new(PERIOD_OFFSET);
    let rt = h.new_runtime();
    h.construct_and_verify(&rt);

    let balance = rt.get_balance();
    h.withdraw_funds(&rt, &(&balance * 2), &balance);
    h.check_state(&rt);
}

#[test]
fn pledge_and_pre_commit_deposits_are_not_withdrawable() {
    let mut h = ActorHarness::new(PERIOD_OFFSET);
    let rt = h.new_runtime();
    h.construct_and_verify(&rt);
    rt.set_epoch(1);

    h.commit_and_prove_sectors(&rt, 1, DEFAULT_SECTOR_EXPIRATION, vec![]);

    // A second sector stays pre-committed.
    let expiration = h.deadline(&rt).period_end()
        + DEFAULT_SECTOR_EXPIRATION * rt.policy.wpost_proving_period;
    let sector_no = h.next_sector_no();
    let challenge = *rt.epoch.borrow() - 1;
    h.pre_commit_sector(
        &rt,
        h.make_pre_commit_params(sector_no, challenge, expiration, vec![]),
        PreCommitConfig::empty(),
    );

    let state = h.get_state(&rt);
    assert!(state.initial_pledge_requirement.is_positive());
    assert!(state.pre_commit_deposits.is_positive());

    let expected = rt.get_balance()
        - &state.initial_pledge_requirement
        - &state.pre_commit_deposits
        - &state.locked_funds;
    h.withdraw_funds(&rt, &big_balance(), &expected);

    let state = h.get_state(&rt);
    assert_eq!(
        &state.initial_pledge_requirement + &state.pre_commit_deposits,
        rt.get_balance()
    );
    h.check_state(&rt);
}

#[test]
fn vested_funds_become_withdrawable() {
    let h = ActorHarness::new(PERIOD_OFFSET);
    let rt = h.new_runtime();
    h.construct_and_verify(&rt);

    let locked = TokenAmount::from_whole(100);
    h.add_locked_fund(&rt, locked.clone());
    assert_eq!(locked, h.get_state(&rt).locked_funds);

    let free = rt.get_balance() - &locked;

    // The first vesting step lands one day in, quantized to the proving period.
    rt.set_epoch(PERIOD_OFFSET + rt.policy.wpost_proving_period + 1);
    let vested = h.immediately_vesting_funds(&rt);
    assert!(vested.is_positive());
    assert!(vested < locked);

    h.withdraw_funds(&rt, &big_balance(), &(&free + &vested));
    let state = h.get_state(&rt);
    assert_eq!(&locked - &vested, state.locked_funds);
    assert_eq!(state.locked_funds, rt.get_balance());
    h.check_state(&rt);
}

#[test]
fn withdrawal_is_forbidden_while_early_terminations_are_pending() {
    let h = ActorHarness::new(PERIOD_OFFSET);
    let rt = h.new_runtime();
    h.construct_and_verify(&rt);

    let mut state = h.get_state(&rt);
    state.early_terminations.set(0);
    rt.replace_state(&state);

    expect_abort_contains_message(
        ExitCode::USR_FORBIDDEN,
        "cannot withdraw funds while 1 deadlines have terminated sectors",
        withdraw_raw(&h, &rt, h.owner, TokenAmount::from_atto(1)),
    );
}

#[test]
fn negative_withdrawal_is_rejected() {
    let h = ActorHarness::new(PERIOD_OFFSET);
    let rt = h.new_runtime();
    h.construct_and_verify(&rt);

    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.owner);
    let params = WithdrawBalanceParams { amount_requested: TokenAmount::from_atto(-1) };
    expect_abort(
        ExitCode::USR_ILLEGAL_ARGUMENT,
        rt.call::<Actor>(
            Method::WithdrawBalance as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        ),
    );
    rt.reset();
}

#[test]
fn only_owner_can_withdraw() {
    let h = ActorHarness::new(PERIOD_OFFSET);
    let rt = h.new_runtime();
    h.construct_and_verify(&rt);

    expect_abort(
        ExitCode::USR_FORBIDDEN,
        withdraw_raw(&h, &rt, h.worker, TokenAmount::from_atto(1)),
    );
    h.check_state(&rt);
}
