// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::marker::PhantomData;

use castaway::cast;
use fvm_ipld_encoding::ipld_block::IpldBlock;
use serde::{Deserialize, Serialize};

use crate::ActorError;

/// Maps method numbers onto actor functions.
///
/// ```ignore
/// impl ActorCode for Actor {
///     type Methods = Method;
///     actor_dispatch! {
///         Constructor => constructor,
///         WithdrawBalance => withdraw_balance,
///     }
/// }
/// ```
///
/// Each function takes the runtime and, optionally, one deserializable parameter.
/// Unknown method numbers abort with `USR_UNHANDLED_MESSAGE`.
#[macro_export]
macro_rules! actor_dispatch {
    ($($method:ident => $func:ident,)*) => {
        fn invoke_method<RT>(
            rt: &RT,
            method: fvm_shared::MethodNum,
            args: Option<fvm_ipld_encoding::ipld_block::IpldBlock>,
        ) -> Result<Option<fvm_ipld_encoding::ipld_block::IpldBlock>, $crate::ActorError>
        where
            RT: $crate::runtime::Runtime,
            RT::Blockstore: Clone,
        {
            match <Self::Methods as num_traits::FromPrimitive>::from_u64(method) {
                $(Some(Self::Methods::$method) => $crate::dispatch(rt, Self::$func, &args),)*
                None => Err($crate::actor_error!(unhandled_message; "invalid method: {}", method)),
            }
        }
    };
}

pub trait Dispatch<'de, RT> {
    fn call(self, rt: &RT, args: &'de Option<IpldBlock>) -> Result<Option<IpldBlock>, ActorError>;
}

/// Wraps an actor function; `A` is `()` for parameterless methods and `(P,)` otherwise.
pub struct Dispatcher<F, A> {
    func: F,
    _marker: PhantomData<fn(A)>,
}

/// Deserializes the parameters, calls the method and serializes its return.
/// Methods returning `()` produce no return block.
#[doc(hidden)]
pub fn dispatch<'de, F, A, RT>(
    rt: &RT,
    func: F,
    arg: &'de Option<IpldBlock>,
) -> Result<Option<IpldBlock>, ActorError>
where
    Dispatcher<F, A>: Dispatch<'de, RT>,
{
    Dispatcher { func, _marker: PhantomData }.call(rt, arg)
}

fn return_block<T: Serialize>(v: T) -> Result<Option<IpldBlock>, ActorError> {
    if cast!(&v, &()).is_ok() {
        return Ok(None);
    }
    Ok(IpldBlock::serialize_cbor(&v)?)
}

impl<'de, F, R, RT> Dispatch<'de, RT> for Dispatcher<F, ()>
where
    F: FnOnce(&RT) -> Result<R, ActorError>,
    R: Serialize,
{
    fn call(self, rt: &RT, args: &'de Option<IpldBlock>) -> Result<Option<IpldBlock>, ActorError> {
        if args.is_some() {
            return Err(ActorError::illegal_argument("method expects no arguments".into()));
        }
        return_block((self.func)(rt)?)
    }
}

impl<'de, F, A, R, RT> Dispatch<'de, RT> for Dispatcher<F, (A,)>
where
    F: FnOnce(&RT, A) -> Result<R, ActorError>,
    A: Deserialize<'de>,
    R: Serialize,
{
    fn call(self, rt: &RT, args: &'de Option<IpldBlock>) -> Result<Option<IpldBlock>, ActorError> {
        let arg = args
            .as_ref()
            .ok_or_else(|| ActorError::illegal_argument("method expects arguments".into()))?;
        return_block((self.func)(rt, arg.deserialize()?)?)
    }
}
