//! Object Proxy
//!
//! Exposes process-local objects to remote callers:
//!
//! - [`RemoteObject`]: the trait a target implements, with its declared
//!   [`Interface`]
//! - [`ProxyServer`]: serves registered targets on a reply endpoint
//! - [`ProxyClient`]: forwards calls and property reads to a server
//!
//! # Error Mapping
//!
//! | Where it fails                      | Caller sees                       |
//! |-------------------------------------|-----------------------------------|
//! | unknown name, bad arguments         | `Remote` with a dispatch kind     |
//! | target returns `TargetError`        | `Remote` with the target's kind   |
//! | target panics                       | `Remote` with kind `Panic`        |
//! | undecodable request                 | no reply; retries, then `Offline` |
//! | server down                         | `Request(Offline)`                |

mod client;
mod dispatch;
mod server;
mod target;

use thiserror::Error;

pub use client::{Call, Member, ProxyClient};
pub use dispatch::{bind_arguments, dispatch, DispatchError, TargetRegistry};
pub use server::{ProxyServer, ServerStats, DEFAULT_POLL_INTERVAL};
pub use target::{
    Arguments, Interface, MemberKind, MethodSpec, Param, RemoteObject, TargetError, ValueKind,
};

use crate::messages::RemoteError;
use crate::reliable::RequestError;
use crate::transport::TransportError;

/// Errors seen by proxy users
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The remote side reported a failure
    #[error("Remote error {0}")]
    Remote(#[from] RemoteError),

    /// The request never got an answer, or could not be sent
    #[error(transparent)]
    Request(#[from] RequestError),

    /// Binding or other socket setup failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The target's interface does not declare this name
    #[error("No member named '{0}'")]
    UnknownMember(String),

    /// A reply value did not have the expected shape
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),
}

impl ProxyError {
    /// Remote failure kind, if this is a remote error
    #[must_use]
    pub fn remote_kind(&self) -> Option<&str> {
        match self {
            Self::Remote(remote) => Some(&remote.kind),
            _ => None,
        }
    }
}
