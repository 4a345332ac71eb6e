// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

mod filter_estimate;
mod smooth_func;

pub use filter_estimate::*;
pub use smooth_func::*;
