// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::address::Address;

// ID addresses of the singleton actors a miner exchanges messages with.

/// Creates miners; the only caller allowed to construct one.
pub const INIT_ACTOR_ADDR: Address = Address::new_id(1);

/// Pays block rewards into the miner's vesting table.
pub const REWARD_ACTOR_ADDR: Address = Address::new_id(2);

/// Tracks claimed power, fires deferred cron events and receives pledge deltas.
pub const STORAGE_POWER_ACTOR_ADDR: Address = Address::new_id(4);

/// Holds deals, computes deal weights and unsealed CIDs.
pub const STORAGE_MARKET_ACTOR_ADDR: Address = Address::new_id(5);

/// Sink for penalties and fees.
pub const BURNT_FUNDS_ACTOR_ADDR: Address = Address::new_id(99);
