// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fil_actor_miner::{VestingFund, VestingFunds};
use fil_actors_runtime::runtime::{Policy, VestSpec};
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use num_traits::Zero;
use test_case::test_case;

const SPEC: VestSpec =
    VestSpec { initial_delay: 0, vest_period: 10, step_duration: 2, quantization: 1 };

fn fund(epoch: ChainEpoch, amount: i64) -> VestingFund {
    VestingFund { epoch, amount: TokenAmount::from_atto(amount) }
}

fn table(funds: &[(ChainEpoch, i64)]) -> VestingFunds {
    VestingFunds { funds: funds.iter().map(|&(e, a)| fund(e, a)).collect() }
}

#[test]
fn linear_vesting_in_steps() {
    let mut vf = VestingFunds::new();
    vf.add_locked_funds(0, &TokenAmount::from_atto(100), 0, &SPEC);
    assert_eq!(table(&[(2, 20), (4, 20), (6, 20), (8, 20), (10, 20)]).funds, vf.funds);
    assert_eq!(TokenAmount::from_atto(100), vf.total());
}

#[test]
fn initial_delay_postpones_vesting() {
    let spec = VestSpec { initial_delay: 5, ..SPEC };
    let mut vf = VestingFunds::new();
    vf.add_locked_funds(0, &TokenAmount::from_atto(100), 0, &spec);
    assert_eq!(table(&[(7, 20), (9, 20), (11, 20), (13, 20), (15, 20)]).funds, vf.funds);
}

#[test]
fn quantization_merges_steps() {
    let spec = VestSpec { quantization: 4, ..SPEC };
    let mut vf = VestingFunds::new();
    vf.add_locked_funds(0, &TokenAmount::from_atto(100), 0, &spec);
    // Steps at 2 and 4 both land on 4, 6 and 8 on 8; the last step vests the remainder.
    assert_eq!(table(&[(4, 40), (8, 40), (12, 20)]).funds, vf.funds);
}

#[test]
fn additions_merge_into_existing_entries() {
    let mut vf = VestingFunds::new();
    vf.add_locked_funds(0, &TokenAmount::from_atto(100), 0, &SPEC);
    vf.add_locked_funds(2, &TokenAmount::from_atto(50), 0, &SPEC);
    assert_eq!(
        table(&[(2, 20), (4, 30), (6, 30), (8, 30), (10, 30), (12, 10)]).funds,
        vf.funds
    );
    assert_eq!(TokenAmount::from_atto(150), vf.total());
}

#[test]
fn unlock_vested_takes_entries_strictly_before_epoch() {
    let mut vf = table(&[(2, 20), (4, 20), (6, 20)]);

    assert!(vf.unlock_vested_funds(2).is_zero());
    assert_eq!(TokenAmount::from_atto(20), vf.unlock_vested_funds(3));
    assert_eq!(TokenAmount::from_atto(40), vf.unlock_vested_funds(100));
    assert!(vf.funds.is_empty());
}

#[test]
fn unlock_unvested_draws_from_soonest_entries() {
    let mut vf = table(&[(2, 20), (4, 20), (6, 20), (8, 20)]);

    // The entry at epoch 2 has vested and is left alone.
    let unlocked = vf.unlock_unvested_funds(3, &TokenAmount::from_atto(30));
    assert_eq!(TokenAmount::from_atto(30), unlocked);
    assert_eq!(table(&[(2, 20), (6, 10), (8, 20)]).funds, vf.funds);
}

#[test]
fn unlock_unvested_is_capped_by_the_table() {
    let mut vf = table(&[(2, 20), (4, 20)]);
    let unlocked = vf.unlock_unvested_funds(0, &TokenAmount::from_atto(1000));
    assert_eq!(TokenAmount::from_atto(40), unlocked);
    assert!(vf.funds.is_empty());
}

#[test]
fn unlock_unvested_with_zero_target_is_noop() {
    let mut vf = table(&[(2, 20)]);
    assert!(vf.unlock_unvested_funds(0, &TokenAmount::zero()).is_zero());
    assert_eq!(table(&[(2, 20)]).funds, vf.funds);
}

#[test_case(1, 0, 0; "one atto")]
#[test_case(179, 1234, 1000; "fewer atto than steps")]
#[test_case(1_000_000_007, 5000, 1000; "prime amount")]
#[test_case(1_000_000_000_000_000_000, 86_400, 2879; "one FIL")]
fn reward_vesting_releases_exactly_the_locked_amount(
    amount: i64,
    curr: ChainEpoch,
    period_start: ChainEpoch,
) {
    let spec = Policy::default().reward_vesting_spec;
    let amount = TokenAmount::from_atto(amount);
    let mut vf = VestingFunds::new();
    vf.add_locked_funds(curr, &amount, period_start, &spec);
    assert_eq!(amount, vf.total());

    let epochs: Vec<ChainEpoch> = vf.funds.iter().map(|f| f.epoch).collect();
    assert!(epochs.windows(2).all(|w| w[0] < w[1]));
    assert!(vf.funds.iter().all(|f| f.epoch > curr && f.amount > TokenAmount::zero()));
    let last = *epochs.last().unwrap();
    assert!(last >= curr + spec.vest_period);

    let mut unlocked = TokenAmount::zero();
    for epoch in curr..=last + 1 {
        unlocked += vf.unlock_vested_funds(epoch);
    }
    assert_eq!(amount, unlocked);
    assert!(vf.funds.is_empty());
}
