//! Object Proxy Client
//!
//! Stands in for a target living in another process. Calls and property
//! reads become [`InvocationRequest`]s sent through a [`ReliableClient`];
//! replies are unwrapped into values or into [`ProxyError::Remote`] carrying
//! the kind and message the target raised.
//!
//! Calls are awaited one at a time (`&mut self`), which matches the
//! lock-step contract of the server socket.
//!
//! # Example
//!
//! ```ignore
//! let mut log = ProxyClient::connect(address, RetryPolicy::default()).await?;
//! let run = log.method("start_run").send().await?;
//! log.method("log").arg("temperature").arg(21.5).send().await?;
//! let running: bool = log.get_as("running").await?;
//! ```

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error};

use super::target::{Interface, MemberKind};
use super::ProxyError;
use crate::messages::{InvocationReply, InvocationRequest, Kwargs, WIRE_VERSION};
use crate::reliable::{ReliableClient, RequestStats, RetryPolicy};
use crate::transport::Address;

/// Client-side stand-in for a remote target
#[derive(Debug)]
pub struct ProxyClient {
    inner: ReliableClient,
    target: Option<String>,
    interface: Option<Interface>,
}

impl ProxyClient {
    /// Connect to the proxy server at `endpoint`
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Request`] if the retry policy or endpoint is
    /// unusable. An unreachable server is not an error here.
    pub async fn connect(endpoint: Address, policy: RetryPolicy) -> Result<Self, ProxyError> {
        let inner = ReliableClient::connect(endpoint, policy).await?;
        Ok(Self {
            inner,
            target: None,
            interface: None,
        })
    }

    /// Address a specific registered target instead of the default one
    #[must_use]
    pub fn with_target(mut self, id: impl Into<String>) -> Self {
        self.target = Some(id.into());
        self.interface = None;
        self
    }

    /// Target id requests are addressed to, if any
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// Server endpoint
    #[must_use]
    pub fn endpoint(&self) -> &Address {
        self.inner.endpoint()
    }

    /// Transport counters
    #[must_use]
    pub fn stats(&self) -> RequestStats {
        self.inner.stats()
    }

    /// Send one request and unwrap its reply
    ///
    /// The request is addressed to this client's target.
    ///
    /// # Errors
    ///
    /// - [`ProxyError::Remote`] if the server reported a failure
    /// - [`ProxyError::Request`] if the server never answered
    pub async fn invoke(&mut self, request: InvocationRequest) -> Result<Value, ProxyError> {
        let request = request.with_target(self.target.clone());
        let id = request.id;

        debug!(id = %id, kind = %request.kind, command = %request.command, "Invoking");

        let reply: InvocationReply = self
            .inner
            .request_matching(&request, |reply: &InvocationReply| {
                reply.id == id && reply.version == WIRE_VERSION
            })
            .await?;

        reply.into_result().map_err(|remote| {
            error!(
                command = %request.command,
                kind = %remote.kind,
                message = %remote.message,
                trace = %remote.trace,
                "Remote invocation failed"
            );
            ProxyError::Remote(remote)
        })
    }

    /// Call `method` with positional and keyword arguments
    ///
    /// # Errors
    ///
    /// Same as [`ProxyClient::invoke`].
    pub async fn call(
        &mut self,
        method: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<Value, ProxyError> {
        self.invoke(InvocationRequest::call(method, args, kwargs))
            .await
    }

    /// Call `method` and convert the result
    ///
    /// # Errors
    ///
    /// Same as [`ProxyClient::invoke`], plus [`ProxyError::UnexpectedReply`]
    /// if the result does not convert to `T`.
    pub async fn call_as<T: DeserializeOwned>(
        &mut self,
        method: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<T, ProxyError> {
        let value = self.call(method, args, kwargs).await?;
        convert(method, value)
    }

    /// Read `property`
    ///
    /// # Errors
    ///
    /// Same as [`ProxyClient::invoke`].
    pub async fn get(&mut self, property: &str) -> Result<Value, ProxyError> {
        self.invoke(InvocationRequest::get(property)).await
    }

    /// Read `property` and convert it
    ///
    /// # Errors
    ///
    /// Same as [`ProxyClient::call_as`].
    pub async fn get_as<T: DeserializeOwned>(&mut self, property: &str) -> Result<T, ProxyError> {
        let value = self.get(property).await?;
        convert(property, value)
    }

    /// The target's interface, fetched once and cached
    ///
    /// # Errors
    ///
    /// Same as [`ProxyClient::call_as`].
    pub async fn interface(&mut self) -> Result<&Interface, ProxyError> {
        if self.interface.is_none() {
            let value = self.invoke(InvocationRequest::describe()).await?;
            let interface: Interface = convert("describe", value)?;
            debug!(
                name = %interface.name,
                methods = interface.methods.len(),
                properties = interface.properties.len(),
                "Cached remote interface"
            );
            self.interface = Some(interface);
        }

        self.interface
            .as_ref()
            .ok_or_else(|| ProxyError::UnexpectedReply("interface not cached".to_string()))
    }

    /// Drop the cached interface so the next use fetches it again
    pub fn refresh_interface(&mut self) {
        self.interface = None;
    }

    /// Resolve `name` the way attribute access would
    ///
    /// A property is read immediately and its value returned. A method
    /// yields a [`Call`] that forwards the invocation when sent.
    ///
    /// # Errors
    ///
    /// - [`ProxyError::UnknownMember`] if the interface does not declare
    ///   `name`
    /// - anything [`ProxyClient::get`] returns, for properties
    pub async fn member(&mut self, name: &str) -> Result<Member<'_>, ProxyError> {
        let kind = self.interface().await?.member_kind(name);

        match kind {
            Some(MemberKind::Property) => self.get(name).await.map(Member::Value),
            Some(MemberKind::Method) => Ok(Member::Method(self.method(name))),
            None => Err(ProxyError::UnknownMember(name.to_string())),
        }
    }

    /// Start building a call to `method`
    pub fn method(&mut self, method: &str) -> Call<'_> {
        Call {
            client: self,
            method: method.to_string(),
            args: Vec::new(),
            kwargs: Kwargs::new(),
        }
    }

    /// Release the connection
    pub fn close(self) {
        self.inner.close();
    }
}

/// A resolved member of a remote target
#[derive(Debug)]
pub enum Member<'a> {
    /// Current value of a property
    Value(Value),
    /// A method, ready to be called
    Method(Call<'a>),
}

/// Builder for one remote method call
#[derive(Debug)]
#[must_use = "a call does nothing until sent"]
pub struct Call<'a> {
    client: &'a mut ProxyClient,
    method: String,
    args: Vec<Value>,
    kwargs: Kwargs,
}

impl Call<'_> {
    /// Method being called
    #[must_use]
    pub fn name(&self) -> &str {
        &self.method
    }

    /// Append a positional argument
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Append several positional arguments
    pub fn args<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    /// Set a keyword argument
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Perform the call
    ///
    /// # Errors
    ///
    /// Same as [`ProxyClient::invoke`].
    pub async fn send(self) -> Result<Value, ProxyError> {
        self.client.call(&self.method, self.args, self.kwargs).await
    }

    /// Perform the call and convert the result
    ///
    /// # Errors
    ///
    /// Same as [`ProxyClient::call_as`].
    pub async fn send_as<T: DeserializeOwned>(self) -> Result<T, ProxyError> {
        self.client
            .call_as(&self.method, self.args, self.kwargs)
            .await
    }
}

fn convert<T: DeserializeOwned>(what: &str, value: Value) -> Result<T, ProxyError> {
    serde_json::from_value(value)
        .map_err(|e| ProxyError::UnexpectedReply(format!("{what}: {e}")))
}
