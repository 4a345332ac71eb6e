// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fil_actor_miner::{
    compute_proving_period_deadline, deadline_is_mutable, declaration_deadline_info,
    new_deadline_info, validate_fr_declaration_deadline,
};
use fil_actors_runtime::runtime::Policy;
use fvm_shared::clock::ChainEpoch;
use test_case::test_case;

const PERIOD_START: ChainEpoch = 1000;

#[test]
fn pre_open_deadlines() {
    let policy = Policy::default();
    // Current is before the period opens.
    let curr = PERIOD_START - 1;
    let info = compute_proving_period_deadline(&policy, PERIOD_START, curr);
    assert_eq!(0, info.index);
    assert!(!info.period_started());
    assert!(!info.is_open());
    assert!(!info.has_elapsed());
    assert_eq!(PERIOD_START, info.open);
    assert_eq!(PERIOD_START + policy.wpost_challenge_window, info.close);
    assert_eq!(PERIOD_START - policy.wpost_challenge_lookback, info.challenge);
    assert_eq!(PERIOD_START - policy.fault_declaration_cutoff, info.fault_cutoff);
}

#[test]
fn offset_zero_first_deadline() {
    let policy = Policy::default();
    let info = compute_proving_period_deadline(&policy, PERIOD_START, PERIOD_START);
    assert_eq!(0, info.index);
    assert!(info.period_started());
    assert!(info.is_open());
    assert_eq!(PERIOD_START + policy.wpost_challenge_window - 1, info.last());
    assert_eq!(PERIOD_START + policy.wpost_proving_period - 1, info.period_end());
}

#[test_case(0; "first epoch")]
#[test_case(59; "last epoch of first deadline")]
#[test_case(60; "first epoch of second deadline")]
#[test_case(2879; "last epoch of the period")]
fn deadline_index_follows_progress(progress: ChainEpoch) {
    let policy = Policy::default();
    let info = compute_proving_period_deadline(&policy, PERIOD_START, PERIOD_START + progress);
    assert_eq!((progress / policy.wpost_challenge_window) as u64, info.index);
    assert!(info.is_open());
}

#[test]
fn period_expired() {
    let policy = Policy::default();
    let curr = PERIOD_START + policy.wpost_proving_period;
    let info = compute_proving_period_deadline(&policy, PERIOD_START, curr);
    assert_eq!(policy.wpost_period_deadlines, info.index);
    assert!(info.period_started());
    assert!(info.period_elapsed());
    assert!(!info.is_open());
    assert!(info.has_elapsed());
    assert_eq!(curr, info.open);
    assert_eq!(curr, info.close);
}

#[test]
fn next_not_elapsed_skips_whole_periods() {
    let policy = Policy::default();
    let curr = PERIOD_START + 5 * policy.wpost_proving_period;
    let info = new_deadline_info(&policy, PERIOD_START, 3, curr);
    assert!(info.has_elapsed());

    let next = info.next_not_elapsed();
    assert_eq!(3, next.index);
    assert!(!next.has_elapsed());
    assert_eq!(PERIOD_START + 5 * policy.wpost_proving_period, next.period_start);
}

#[test]
fn declaration_targets_next_instance_once_elapsed() {
    let policy = Policy::default();
    let curr = PERIOD_START + 2 * policy.wpost_challenge_window;

    // Deadline 1 has already closed in this period.
    let info = declaration_deadline_info(&policy, PERIOD_START, 1, curr).unwrap();
    assert_eq!(PERIOD_START + policy.wpost_proving_period, info.period_start);
    assert!(validate_fr_declaration_deadline(&info).is_ok());

    // Deadline 2 is open, so its fault cutoff has passed.
    let info = declaration_deadline_info(&policy, PERIOD_START, 2, curr).unwrap();
    assert_eq!(PERIOD_START, info.period_start);
    assert!(validate_fr_declaration_deadline(&info).is_err());

    let out_of_range = policy.wpost_period_deadlines;
    assert!(declaration_deadline_info(&policy, PERIOD_START, out_of_range, curr).is_err());
}

#[test]
fn deadline_mutability() {
    let policy = Policy::default();
    let window = policy.wpost_challenge_window;

    // The open deadline and the one after it are immutable.
    let curr = PERIOD_START + 10 * window;
    assert!(!deadline_is_mutable(&policy, PERIOD_START, 10, curr));
    assert!(!deadline_is_mutable(&policy, PERIOD_START, 11, curr));
    assert!(deadline_is_mutable(&policy, PERIOD_START, 12, curr));

    // A closed deadline is mutable until a window before its next opening.
    assert!(deadline_is_mutable(&policy, PERIOD_START, 9, curr));
}

#[test]
fn quantization_rounds_to_deadline_end() {
    let policy = Policy::default();
    let info = new_deadline_info(&policy, PERIOD_START, 4, PERIOD_START);
    let quant = info.quant_spec();
    assert_eq!(info.last(), quant.quantize_up(info.last()));
    assert_eq!(info.last() + policy.wpost_proving_period, quant.quantize_up(info.last() + 1));
    assert_eq!(info.last(), quant.quantize_up(info.last() - policy.wpost_proving_period + 1));
}

#[test_case(0, PERIOD_START - 1; "before the first period")]
#[test_case(0, PERIOD_START + 59; "open")]
#[test_case(1, PERIOD_START + 60 * 3; "just elapsed")]
#[test_case(47, PERIOD_START + 2880 * 4 + 17; "several periods late")]
#[test_case(12, PERIOD_START + 12 * 60 + 60; "at its close")]
#[test_case(30, PERIOD_START + 30 * 60 - 1; "one epoch before open")]
fn deadline_info_is_ordered_and_next_instance_is_stable(index: u64, curr: ChainEpoch) {
    let policy = Policy::default();
    let info = new_deadline_info(&policy, PERIOD_START, index, curr);
    assert!(info.challenge < info.open);
    assert!(info.fault_cutoff < info.open);
    assert_eq!(policy.wpost_challenge_window, info.close - info.open);

    let next = info.next_not_elapsed();
    assert_eq!(index, next.index);
    assert!(!next.has_elapsed());
    assert_eq!(next, next.next_not_elapsed());
    assert_eq!(0, (next.period_start - info.period_start) % policy.wpost_proving_period);
    assert!(next.challenge < next.open && next.fault_cutoff < next.open && next.open < next.close);
    if info.has_elapsed() {
        // The instance one period earlier has elapsed, so no period was skipped.
        assert!(next.close - policy.wpost_proving_period <= curr);
    } else {
        assert_eq!(info, next);
    }
}
