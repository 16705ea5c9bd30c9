//! Wire Messages
//!
//! Envelopes exchanged over the bus. All of them are plain serde records
//! carried in checksummed frames (see [`crate::transport::frame`]); argument
//! and return values are JSON values, never serialized object graphs, so
//! decoding a message can't run code.
//!
//! # Envelopes
//!
//! - [`InvocationRequest`]: caller → proxy server
//! - [`InvocationReply`]: proxy server → caller, exactly one per request
//! - [`BroadcastMessage`]: publisher → every subscriber
//!
//! Every envelope carries [`WIRE_VERSION`]; peers reject versions they do
//! not speak.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::transport::TransportError;

/// Protocol version spoken by this build
pub const WIRE_VERSION: u16 = 1;

/// Keyword arguments, ordered by name
pub type Kwargs = BTreeMap<String, Value>;

/// Correlation id tying a reply to its request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    /// Generate a fresh random id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reject envelopes from an incompatible protocol version
///
/// # Errors
///
/// Returns [`TransportError::UnsupportedVersion`] if `found` differs from
/// [`WIRE_VERSION`].
pub fn check_version(found: u16) -> Result<(), TransportError> {
    if found == WIRE_VERSION {
        Ok(())
    } else {
        Err(TransportError::UnsupportedVersion {
            found,
            expected: WIRE_VERSION,
        })
    }
}

// ============================================================================
// Invocation
// ============================================================================

/// What the caller wants done with the named member
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationKind {
    /// Invoke a method with arguments
    Call,
    /// Read a property
    Get,
    /// Fetch the target's interface description
    Describe,
}

impl fmt::Display for InvocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Call => "call",
            Self::Get => "get",
            Self::Describe => "describe",
        };
        f.write_str(name)
    }
}

/// A remote invocation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    /// Protocol version
    pub version: u16,
    /// Correlation id, echoed in the reply
    pub id: RequestId,
    /// Registered target to dispatch to (`None` = the default target)
    #[serde(default)]
    pub target_ref: Option<String>,
    /// Operation requested
    pub kind: InvocationKind,
    /// Method or property name (empty for `Describe`)
    pub command: String,
    /// Positional arguments
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments
    #[serde(default)]
    pub kwargs: Kwargs,
}

impl InvocationRequest {
    /// Request to call `method`
    #[must_use]
    pub fn call(method: impl Into<String>, args: Vec<Value>, kwargs: Kwargs) -> Self {
        Self {
            version: WIRE_VERSION,
            id: RequestId::new(),
            target_ref: None,
            kind: InvocationKind::Call,
            command: method.into(),
            args,
            kwargs,
        }
    }

    /// Request to read `property`
    #[must_use]
    pub fn get(property: impl Into<String>) -> Self {
        Self {
            kind: InvocationKind::Get,
            ..Self::call(property, Vec::new(), Kwargs::new())
        }
    }

    /// Request for the target's interface
    #[must_use]
    pub fn describe() -> Self {
        Self {
            kind: InvocationKind::Describe,
            ..Self::call(String::new(), Vec::new(), Kwargs::new())
        }
    }

    /// Address a specific registered target
    #[must_use]
    pub fn with_target(mut self, target: Option<String>) -> Self {
        self.target_ref = target;
        self
    }
}

/// Error information carried back to the caller
///
/// `kind` names the failure (`UnknownMember`, `BadArguments`, or whatever
/// kind the target itself reported) and is preserved end to end so the
/// caller can branch on it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    /// Failure kind
    pub kind: String,
    /// Human-readable message
    pub message: String,
    /// Diagnostic trace captured on the server
    pub trace: String,
}

/// Result of an invocation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// The invocation succeeded
    Ok {
        /// Return value or property value
        value: Value,
    },
    /// The invocation failed
    Err {
        /// What went wrong
        error: RemoteError,
    },
}

/// Reply to an [`InvocationRequest`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvocationReply {
    /// Protocol version
    pub version: u16,
    /// Id of the request being answered
    pub id: RequestId,
    /// Success value or error information
    pub outcome: Outcome,
}

impl InvocationReply {
    /// Successful reply to `id`
    #[must_use]
    pub fn ok(id: RequestId, value: Value) -> Self {
        Self {
            version: WIRE_VERSION,
            id,
            outcome: Outcome::Ok { value },
        }
    }

    /// Failed reply to `id`
    #[must_use]
    pub fn err(id: RequestId, error: RemoteError) -> Self {
        Self {
            version: WIRE_VERSION,
            id,
            outcome: Outcome::Err { error },
        }
    }

    /// Whether the invocation succeeded
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, Outcome::Ok { .. })
    }

    /// Unwrap into a plain `Result`
    ///
    /// # Errors
    ///
    /// Returns the [`RemoteError`] if the invocation failed.
    pub fn into_result(self) -> Result<Value, RemoteError> {
        match self.outcome {
            Outcome::Ok { value } => Ok(value),
            Outcome::Err { error } => Err(error),
        }
    }
}

// ============================================================================
// Broadcast
// ============================================================================

/// One broadcast notification
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    /// Protocol version
    pub version: u16,
    /// Topic-like label chosen by the publisher
    pub header: String,
    /// Arbitrary structured payload
    pub payload: Value,
}

impl BroadcastMessage {
    /// Build a message with the current wire version
    #[must_use]
    pub fn new(header: impl Into<String>, payload: Value) -> Self {
        Self {
            version: WIRE_VERSION,
            header: header.into(),
            payload,
        }
    }

    /// Deserialize the payload into a concrete type
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::SerializationError`] if the payload does not
    /// have the shape of `T`.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| TransportError::SerializationError(e.to_string()))
    }
}
