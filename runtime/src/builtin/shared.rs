// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

/// Bit width of every HAMT the miner keeps, e.g. the pre-committed sectors.
pub const HAMT_BIT_WIDTH: u32 = 5;
