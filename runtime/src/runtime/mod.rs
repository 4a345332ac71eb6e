// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::ipld_block::IpldBlock;
use fvm_ipld_encoding::CborStore;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::consensus::ConsensusFault;
use fvm_shared::econ::TokenAmount;
use fvm_shared::randomness::RANDOMNESS_LENGTH;
use fvm_shared::sector::{SealVerifyInfo, WindowPoStVerifyInfo};
use fvm_shared::{ActorID, MethodNum, Response};
use multihash::Code;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use self::actor_code::*;
pub use self::empty::{make_identity_cid, EMPTY_ARR_CID};
pub use self::policy::*;
pub use self::randomness::DomainSeparationTag;
use crate::runtime::builtins::Type;
use crate::{actor_error, ActorError, SendError};

mod actor_code;
pub mod builtins;
mod empty;
pub mod policy;
mod randomness;

/// The host interface a miner method runs against: message context, chain randomness,
/// the state root, sends to other actors and proof verification.
pub trait Runtime: Primitives + Verifier + RuntimePolicy {
    type Blockstore: Blockstore;

    fn message(&self) -> &dyn MessageInfo;

    /// The current chain epoch. Genesis is epoch zero.
    fn curr_epoch(&self) -> ChainEpoch;

    /// Caller checks. Every exported method performs exactly one of these before returning.
    fn validate_immediate_caller_accept_any(&self) -> Result<(), ActorError>;
    fn validate_immediate_caller_is<'a, I>(&self, addresses: I) -> Result<(), ActorError>
    where
        I: IntoIterator<Item = &'a Address>;
    fn validate_immediate_caller_type<'a, I>(&self, types: I) -> Result<(), ActorError>
    where
        I: IntoIterator<Item = &'a Type>;

    /// Balance of the receiver, including any value received with the current message.
    fn current_balance(&self) -> TokenAmount;

    /// Resolves any address to its ID form, or `None` if no such actor exists.
    fn resolve_address(&self, address: &Address) -> Option<ActorID>;

    fn get_actor_code_cid(&self, id: &ActorID) -> Option<Cid>;

    /// Maps a code CID onto the built-in actor type it implements.
    fn resolve_builtin_actor_type(&self, code_id: &Cid) -> Option<Type>;

    /// Fork-dependent randomness from the ticket chain at `rand_epoch`.
    fn get_randomness_from_tickets(
        &self,
        personalization: DomainSeparationTag,
        rand_epoch: ChainEpoch,
        entropy: &[u8],
    ) -> Result<[u8; RANDOMNESS_LENGTH], ActorError>;

    /// Unbiasable randomness from the drand beacon at `rand_epoch`.
    fn get_randomness_from_beacon(
        &self,
        personalization: DomainSeparationTag,
        rand_epoch: ChainEpoch,
        entropy: &[u8],
    ) -> Result<[u8; RANDOMNESS_LENGTH], ActorError>;

    /// Stores the initial state object. Fails if the actor already has state.
    fn create<T: Serialize>(&self, obj: &T) -> Result<(), ActorError> {
        let root = self.get_state_root()?;
        if root != *EMPTY_ARR_CID {
            return Err(actor_error!(illegal_state; "actor state already initialized at {}", root));
        }
        let new_root = self.store().put_cbor(obj, Code::Blake2b256).map_err(|e| {
            actor_error!(illegal_argument; "failed to write initial actor state: {}", e)
        })?;
        self.set_state_root(&new_root)
    }

    /// Loads a read-only copy of the receiver's state.
    fn state<T: DeserializeOwned>(&self) -> Result<T, ActorError> {
        self.store()
            .get_cbor(&self.get_state_root()?)
            .map_err(|e| actor_error!(illegal_state; "failed to load actor state: {}", e))?
            .ok_or_else(|| actor_error!(illegal_state; "actor state root not found"))
    }

    fn get_state_root(&self) -> Result<Cid, ActorError>;

    fn set_state_root(&self, root: &Cid) -> Result<(), ActorError>;

    /// Loads the state, hands it to `f` and stores the result as the new state root if `f`
    /// succeeds. Sends are forbidden while `f` runs.
    fn transaction<S, RT, F>(&self, f: F) -> Result<RT, ActorError>
    where
        S: Serialize + DeserializeOwned,
        F: FnOnce(&mut S, &Self) -> Result<RT, ActorError>;

    fn store(&self) -> &Self::Blockstore;

    /// Sends a message with attached value. A callee abort is reported in the response's exit
    /// code; `SendError` means the message could not be delivered at all.
    fn send(
        &self,
        to: &Address,
        method: MethodNum,
        params: Option<IpldBlock>,
        value: TokenAmount,
    ) -> Result<Response, SendError>;

    /// Removes the receiver from the state tree, sending its remaining balance to `beneficiary`.
    fn delete_actor(&self, beneficiary: &Address) -> Result<(), ActorError>;

    /// Tokens in circulation at the start of the current epoch. Feeds the consensus share
    /// of the initial pledge.
    fn total_fil_circ_supply(&self) -> TokenAmount;
}

pub trait MessageInfo {
    /// The immediate caller, always an ID address.
    fn caller(&self) -> Address;

    /// The miner's own ID address.
    fn receiver(&self) -> Address;

    /// Value attached to the message, already credited to `current_balance()`.
    fn value_received(&self) -> TokenAmount;
}

pub trait Primitives {
    /// Blake2b with a 256 bit digest.
    fn hash_blake2b(&self, data: &[u8]) -> [u8; 32];
}

/// Proof checks provided by the host.
pub trait Verifier {
    fn verify_seal(&self, vi: &SealVerifyInfo) -> Result<(), anyhow::Error>;

    fn verify_post(&self, verify_info: &WindowPoStVerifyInfo) -> Result<(), anyhow::Error>;

    /// Checks whether two (or, for parent grinding, three) serialized block headers prove
    /// a consensus fault. `Ok(None)` means they don't.
    fn verify_consensus_fault(
        &self,
        h1: &[u8],
        h2: &[u8],
        extra: &[u8],
    ) -> Result<Option<ConsensusFault>, anyhow::Error>;
}
