// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt::Display;

use fvm_shared::error::{ErrorNumber, ExitCode};
use thiserror::Error;

/// The abort returned by a miner method: an exit code and a message for debugging.
/// Any state mutation made by the failed method is discarded by the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("ActorError(exit_code: {exit_code:?}, msg: {msg})")]
pub struct ActorError {
    exit_code: ExitCode,
    msg: String,
}

impl ActorError {
    /// Builds an error with an arbitrary code, without checking it is a user code.
    pub fn unchecked(code: ExitCode, msg: String) -> Self {
        Self { exit_code: code, msg }
    }

    /// Propagates the exit code of a failed send. System codes cannot be raised by an
    /// actor, so they are mapped onto user codes.
    pub fn checked(code: ExitCode, msg: String) -> Self {
        let exit_code = match code {
            ExitCode::SYS_MISSING_RETURN
            | ExitCode::SYS_ILLEGAL_INSTRUCTION
            | ExitCode::SYS_ILLEGAL_EXIT_CODE => ExitCode::USR_UNSPECIFIED,
            code if code.is_system_error() => ExitCode::USR_ASSERTION_FAILED,
            code => code,
        };
        Self { exit_code, msg }
    }

    pub fn illegal_argument(msg: String) -> Self {
        Self::unchecked(ExitCode::USR_ILLEGAL_ARGUMENT, msg)
    }
    pub fn not_found(msg: String) -> Self {
        Self::unchecked(ExitCode::USR_NOT_FOUND, msg)
    }
    pub fn forbidden(msg: String) -> Self {
        Self::unchecked(ExitCode::USR_FORBIDDEN, msg)
    }
    pub fn insufficient_funds(msg: String) -> Self {
        Self::unchecked(ExitCode::USR_INSUFFICIENT_FUNDS, msg)
    }
    pub fn illegal_state(msg: String) -> Self {
        Self::unchecked(ExitCode::USR_ILLEGAL_STATE, msg)
    }
    pub fn unhandled_message(msg: String) -> Self {
        Self::unchecked(ExitCode::USR_UNHANDLED_MESSAGE, msg)
    }
    pub fn assertion_failed(msg: String) -> Self {
        Self::unchecked(ExitCode::USR_ASSERTION_FAILED, msg)
    }

    pub fn exit_code(&self) -> ExitCode {
        self.exit_code
    }

    pub fn msg(&self) -> &str {
        &self.msg
    }

    /// Prefixes the message, keeping the exit code.
    pub fn wrap(mut self, msg: impl AsRef<str>) -> Self {
        self.msg = format!("{}: {}", msg.as_ref(), self.msg);
        self
    }
}

/// Malformed parameters or state abort with `USR_SERIALIZATION`.
impl From<fvm_ipld_encoding::Error> for ActorError {
    fn from(e: fvm_ipld_encoding::Error) -> Self {
        Self::unchecked(ExitCode::USR_SERIALIZATION, e.to_string())
    }
}

/// An error returned by the runtime when a send could not be delivered at all, as opposed to
/// the callee aborting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("send failed with error number {0}")]
pub struct SendError(pub ErrorNumber);

impl From<SendError> for ActorError {
    fn from(e: SendError) -> Self {
        let code = match e.0 {
            ErrorNumber::InsufficientFunds => ExitCode::USR_INSUFFICIENT_FUNDS,
            ErrorNumber::NotFound => ExitCode::USR_NOT_FOUND,
            _ => ExitCode::USR_ASSERTION_FAILED,
        };
        Self::unchecked(code, e.to_string())
    }
}

/// Builds an [`ActorError`] from a constructor name and a message:
/// `actor_error!(forbidden; "caller {} is not the owner", caller)`.
#[macro_export]
macro_rules! actor_error {
    ( $code:ident; $msg:expr ) => { $crate::ActorError::$code($msg.to_string()) };

    ( $code:ident; $msg:literal $(, $ex:expr)+ ) => {
        $crate::ActorError::$code(format!($msg, $($ex,)*))
    };

    ( $code:ident, $msg:expr ) => { $crate::actor_error!($code; $msg) };

    ( $code:ident, $msg:literal $(, $ex:expr)+ ) => {
        $crate::actor_error!($code; $msg $(, $ex)*)
    };
}

/// Adds context to an actor error's message.
pub trait ActorContext<T> {
    fn context<C>(self, context: C) -> Result<T, ActorError>
    where
        C: Display + 'static;

    fn with_context<C, F>(self, f: F) -> Result<T, ActorError>
    where
        C: Display + 'static,
        F: FnOnce() -> C;
}

impl<T> ActorContext<T> for Result<T, ActorError> {
    fn context<C>(self, context: C) -> Result<T, ActorError>
    where
        C: Display + 'static,
    {
        self.map_err(|err| err.wrap(context.to_string()))
    }

    fn with_context<C, F>(self, f: F) -> Result<T, ActorError>
    where
        C: Display + 'static,
        F: FnOnce() -> C,
    {
        self.map_err(|err| err.wrap(f().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use fvm_shared::error::{ErrorNumber, ExitCode};

    use super::*;

    #[test]
    fn system_codes_from_sends_become_user_codes() {
        let err = ActorError::checked(ExitCode::SYS_MISSING_RETURN, "no return".into());
        assert_eq!(ExitCode::USR_UNSPECIFIED, err.exit_code());
        let err = ActorError::checked(ExitCode::SYS_OUT_OF_GAS, "gas".into());
        assert_eq!(ExitCode::USR_ASSERTION_FAILED, err.exit_code());
        let err = ActorError::checked(ExitCode::USR_FORBIDDEN, "forbidden".into());
        assert_eq!(ExitCode::USR_FORBIDDEN, err.exit_code());
    }

    #[test]
    fn undeliverable_sends_map_to_user_codes() {
        let err: ActorError = SendError(ErrorNumber::InsufficientFunds).into();
        assert_eq!(ExitCode::USR_INSUFFICIENT_FUNDS, err.exit_code());
        let err: ActorError = SendError(ErrorNumber::IllegalOperation).into();
        assert_eq!(ExitCode::USR_ASSERTION_FAILED, err.exit_code());
    }

    #[test]
    fn context_prefixes_message() {
        let res: Result<(), _> = Err(actor_error!(not_found; "sector {} missing", 7));
        let err = res.context("loading sectors").unwrap_err();
        assert_eq!(ExitCode::USR_NOT_FOUND, err.exit_code());
        assert_eq!("loading sectors: sector 7 missing", err.msg());
    }
}
