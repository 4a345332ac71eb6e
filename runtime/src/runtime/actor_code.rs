// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_ipld_encoding::ipld_block::IpldBlock;
use fvm_shared::MethodNum;

use crate::runtime::Runtime;
use crate::ActorError;

/// Interface for invoking methods on an Actor
pub trait ActorCode {
    type Methods;

    /// A name for the actor type, used in debugging.
    fn name() -> &'static str;

    /// Invokes method with runtime on the actor's code. Method number will match one
    /// defined by the Actor, and parameters will be serialized and used in execution
    fn invoke_method<RT>(
        rt: &RT,
        method: MethodNum,
        args: Option<IpldBlock>,
    ) -> Result<Option<IpldBlock>, ActorError>
    where
        RT: Runtime,
        RT::Blockstore: Clone;
}
