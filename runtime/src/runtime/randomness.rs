// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use num_derive::FromPrimitive;
use serde_repr::*;

/// Personalization mixed into every randomness draw, so that draws for different purposes at
/// the same epoch never coincide.
#[derive(PartialEq, Eq, Copy, Clone, FromPrimitive, Debug, Hash, Deserialize_repr, Serialize_repr)]
#[repr(i64)]
pub enum DomainSeparationTag {
    TicketProduction = 1,
    ElectionProofProduction = 2,
    WinningPoStChallengeSeed = 3,
    /// Challenge for a window PoSt, drawn from the beacon at the deadline's challenge epoch.
    WindowedPoStChallengeSeed = 4,
    /// Seal ticket, drawn from the chain at the pre-commit's seal epoch.
    SealRandomness = 5,
    /// Seal challenge, drawn from the beacon at the pre-commit's seed epoch.
    InteractiveSealChallengeSeed = 6,
    WindowPoStDeadlineAssignment = 7,
    MarketDealCronSeed = 8,
    /// Ticket a window PoSt commits to, binding it to a chain.
    PoStChainCommit = 9,
}
