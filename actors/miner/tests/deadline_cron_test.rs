// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fil_actor_miner::{
    pledge_penalty_for_declared_fault, Actor, CronEventPayload, Method,
    CRON_EVENT_PROVING_DEADLINE,
};
use fil_actors_runtime::test_utils::*;
use fil_actors_runtime::STORAGE_POWER_ACTOR_ADDR;
use fvm_ipld_encoding::ipld_block::IpldBlock;
use fvm_shared::econ::TokenAmount;

mod util;
use util::*;

#[test]
fn first_cron_only_reschedules() {
    let h = ActorHarness::new(PERIOD_OFFSET);
    let rt = h.new_runtime();
    h.construct_and_verify(&rt);

    let dl = h.advance_deadline(&rt, CronConfig::empty());
    assert_eq!(0, dl.index);
    assert_eq!(PERIOD_OFFSET, dl.period_start);
    assert_eq!(PERIOD_OFFSET, *rt.epoch.borrow());

    let state = h.get_state(&rt);
    assert_eq!(0, state.current_deadline);
    assert_eq!(PERIOD_OFFSET, state.proving_period_start);
    h.check_state(&rt);
}

#[test]
fn cron_advances_through_the_proving_period() {
    let h = ActorHarness::new(PERIOD_OFFSET);
    let rt = h.new_runtime();
    h.construct_and_verify(&rt);

    h.advance_deadline(&rt, CronConfig::empty());
    for expected in 1..rt.policy.wpost_period_deadlines {
        let dl = h.advance_deadline(&rt, CronConfig::empty());
        assert_eq!(expected, dl.index);
        assert_eq!(expected, h.get_state(&rt).current_deadline);
    }

    // The last deadline's cron rolls over into the next period.
    let dl = h.advance_deadline(&rt, CronConfig::empty());
    assert_eq!(0, dl.index);
    assert_eq!(
        PERIOD_OFFSET + rt.policy.wpost_proving_period,
        h.get_state(&rt).proving_period_start
    );
    h.check_state(&rt);
}

#[test]
fn expired_pre_commit_burns_its_deposit() {
    let mut h = ActorHarness::new(PERIOD_OFFSET);
    let rt = h.new_runtime();
    h.construct_and_verify(&rt);
    rt.set_epoch(1);

    let expiration = h.deadline(&rt).period_end()
        + DEFAULT_SECTOR_EXPIRATION * rt.policy.wpost_proving_period;
    let sector_no = h.next_sector_no();
    let precommit = h.pre_commit_sector(
        &rt,
        h.make_pre_commit_params(sector_no, 0, expiration, vec![]),
        PreCommitConfig::empty(),
    );
    let deposit = precommit.pre_commit_deposit.clone();
    assert_eq!(deposit, h.get_state(&rt).pre_commit_deposits);

    // Expiry is one epoch past the prove-commit window, rounded up to a deadline boundary.
    let expiry = h
        .get_state(&rt)
        .quant_spec_every_deadline(&rt.policy)
        .quantize_up(1 + rt.policy.max_prove_commit_duration + 1);
    h.advance_deadline(&rt, CronConfig::empty());
    while h.deadline(&rt).last() < expiry {
        h.advance_deadline(&rt, CronConfig::empty());
        assert!(h.has_precommit(&rt, sector_no));
    }

    h.advance_deadline(&rt, CronConfig { expected_penalty: deposit, ..CronConfig::empty() });
    assert!(!h.has_precommit(&rt, sector_no));
    assert!(h.get_state(&rt).pre_commit_deposits.is_zero());
    h.check_state(&rt);
}

#[test]
fn cron_unlocks_vested_funds() {
    let h = ActorHarness::new(PERIOD_OFFSET);
    let rt = h.new_runtime();
    h.construct_and_verify(&rt);

    let locked = TokenAmount::from_whole(100);
    h.add_locked_fund(&rt, locked.clone());

    // The first tranche vests one day after the period start; the cron pledge update
    // accounts for it.
    h.advance_to_epoch_with_cron(&rt, PERIOD_OFFSET + 2 * rt.policy.wpost_proving_period);
    let state = h.get_state(&rt);
    assert!(state.locked_funds < locked);
    assert!(state.locked_funds.is_positive());
    h.check_state(&rt);
}

#[test]
fn sector_faulty_for_too_long_is_terminated() {
    let mut h = ActorHarness::new(PERIOD_OFFSET);
    let rt = h.new_runtime();
    h.construct_and_verify(&rt);
    rt.set_epoch(1);

    let sector = h.commit_and_prove_sectors(&rt, 1, DEFAULT_SECTOR_EXPIRATION, vec![]).remove(0);
    let power = sector_power(&h, &[sector.clone()]);
    h.declare_faults(&rt, &[sector.clone()]);

    let ongoing_fee = pledge_penalty_for_declared_fault(
        &rt.policy,
        &h.epoch_reward_smooth,
        &h.epoch_qa_power_smooth,
        &power.qa,
    );

    // The fault expires at the end of deadline 1, fault_max_age after it was first declared.
    let periods = rt.policy.fault_max_age / rt.policy.wpost_proving_period;
    let expiry_period_start = PERIOD_OFFSET + periods * rt.policy.wpost_proving_period;

    h.advance_deadline(&rt, CronConfig::empty());
    loop {
        let dl = h.deadline(&rt);
        if dl.index == 1 && dl.period_start == expiry_period_start {
            break;
        }
        let cfg = if dl.index == 1 {
            CronConfig { expected_penalty: ongoing_fee.clone(), ..CronConfig::empty() }
        } else {
            CronConfig::empty()
        };
        h.advance_deadline(&rt, cfg);
    }
    assert!(h.get_state(&rt).early_terminations.is_empty());

    // The final cron charges the ongoing fee, expires the sector and immediately processes the
    // early termination it produced.
    let dl = h.deadline(&rt);
    rt.set_epoch(dl.last());
    let termination_fee = h.termination_fee(&rt, &sector);

    rt.set_caller(*POWER_ACTOR_CODE_ID, STORAGE_POWER_ACTOR_ADDR);
    rt.expect_validate_caller_addr(vec![STORAGE_POWER_ACTOR_ADDR]);
    h.expect_query_network_info(&rt);
    h.expect_burn(&rt, &ongoing_fee);
    h.expect_enroll_cron(
        &rt,
        dl.last() + rt.policy.wpost_challenge_window,
        CRON_EVENT_PROVING_DEADLINE,
    );
    h.expect_query_network_info(&rt);
    h.expect_burn(&rt, &termination_fee);
    h.expect_update_pledge(&rt, &-sector.initial_pledge.clone());

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

    let state = h.get_state(&rt);
    assert!(state.early_terminations.is_empty());
    assert!(state.initial_pledge_requirement.is_zero());

    let partition = h.get_partition(&rt, 1, 0);
    assert_bitfield_equals(&partition.terminated, &[sector.sector_number]);
    assert!(partition.faults.is_empty());
    assert!(partition.faulty_power.is_zero());
    assert!(partition.live_power.is_zero());
    h.check_state(&rt);
}
