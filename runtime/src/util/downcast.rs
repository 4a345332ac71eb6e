// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use anyhow::anyhow;
use fvm_ipld_amt::Error as AmtError;
use fvm_ipld_hamt::Error as HamtError;
use fvm_shared::error::ExitCode;

use crate::ActorError;

/// Trait to allow multiple error types to be able to be downcasted into an `ActorError`.
pub trait ActorDowncast {
    /// Downcast a dynamic std Error into an `ActorError`. If the error cannot be downcasted
    /// into an ActorError automatically, use the provided `ExitCode` to generate a new error.
    fn downcast_default(self, default_exit_code: ExitCode, msg: impl AsRef<str>) -> ActorError;

    /// Wrap the error with a message, without overwriting an exit code.
    fn downcast_wrap(self, msg: impl AsRef<str>) -> anyhow::Error;
}

impl ActorDowncast for anyhow::Error {
    fn downcast_default(self, default_exit_code: ExitCode, msg: impl AsRef<str>) -> ActorError {
        match downcast_util(self) {
            Ok(actor_error) => actor_error.wrap(msg),
            Err(other) => {
                ActorError::unchecked(default_exit_code, format!("{}: {}", msg.as_ref(), other))
            }
        }
    }

    fn downcast_wrap(self, msg: impl AsRef<str>) -> anyhow::Error {
        match downcast_util(self) {
            Ok(actor_error) => anyhow!(actor_error.wrap(msg)),
            Err(other) => anyhow!("{}: {}", msg.as_ref(), other),
        }
    }
}

impl ActorDowncast for AmtError {
    fn downcast_default(self, default_exit_code: ExitCode, msg: impl AsRef<str>) -> ActorError {
        anyhow::Error::from(self).downcast_default(default_exit_code, msg)
    }

    fn downcast_wrap(self, msg: impl AsRef<str>) -> anyhow::Error {
        anyhow::Error::from(self).downcast_wrap(msg)
    }
}

impl ActorDowncast for HamtError {
    fn downcast_default(self, default_exit_code: ExitCode, msg: impl AsRef<str>) -> ActorError {
        anyhow::Error::from(self).downcast_default(default_exit_code, msg)
    }

    fn downcast_wrap(self, msg: impl AsRef<str>) -> anyhow::Error {
        anyhow::Error::from(self).downcast_wrap(msg)
    }
}

/// Attempts to downcast a `Box<dyn std::error::Error>` into an actor error.
/// Returns `Ok` with the actor error if it can be downcasted automatically
/// and returns `Err` with the original error if it cannot.
///
/// Errors raised inside AMT or HAMT traversal callbacks arrive wrapped in the
/// collection's `Dynamic` variant; those are unwrapped first.
fn downcast_util(error: anyhow::Error) -> anyhow::Result<ActorError> {
    let error = match error.downcast::<ActorError>() {
        Ok(actor_err) => return Ok(actor_err),
        Err(other) => other,
    };

    let error = match error.downcast::<AmtError>() {
        Ok(AmtError::Dynamic(inner)) => return downcast_util(inner),
        Ok(other) => return Err(anyhow!(other)),
        Err(other) => other,
    };

    match error.downcast::<HamtError>() {
        Ok(HamtError::Dynamic(inner)) => downcast_util(inner),
        Ok(other) => Err(anyhow!(other)),
        Err(other) => Err(other),
    }
}
