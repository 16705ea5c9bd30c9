//! Request Dispatch
//!
//! Turns one [`InvocationRequest`] into exactly one [`InvocationReply`].
//! Nothing that goes wrong here escapes as a Rust error: unknown names, bad
//! arguments, target failures and even panics inside a target all become
//! the `Err` outcome of the reply, so the server loop always has something
//! to send back.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use super::target::{Arguments, MemberKind, MethodSpec, RemoteObject, TargetError};
use crate::messages::{InvocationKind, InvocationReply, InvocationRequest, Kwargs, RemoteError};

/// Id shown for the default target in diagnostics
const DEFAULT_TARGET: &str = "<default>";

/// The request could not be matched to something the target offers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// No target under that id (or no targets at all)
    #[error("no target registered as '{0}'")]
    UnknownTarget(String),

    /// The target declares no such member
    #[error("'{target}' has no member '{member}'")]
    UnknownMember {
        /// Target id
        target: String,
        /// Requested name
        member: String,
    },

    /// A property was called like a method
    #[error("'{member}' on '{target}' is a property, not a method")]
    NotCallable {
        /// Target id
        target: String,
        /// Requested name
        member: String,
    },

    /// A method was read like a property
    #[error("'{member}' on '{target}' is a method, not a property")]
    NotAProperty {
        /// Target id
        target: String,
        /// Requested name
        member: String,
    },

    /// Arguments do not fit the method's parameters
    #[error("bad arguments for '{method}': {reason}")]
    BadArguments {
        /// Method name
        method: String,
        /// What did not fit
        reason: String,
    },
}

impl DispatchError {
    /// Kind name carried in the reply
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownTarget(_) => "UnknownTarget",
            Self::UnknownMember { .. } => "UnknownMember",
            Self::NotCallable { .. } => "NotCallable",
            Self::NotAProperty { .. } => "NotAProperty",
            Self::BadArguments { .. } => "BadArguments",
        }
    }

    fn bad_arguments(method: &str, reason: impl Into<String>) -> Self {
        Self::BadArguments {
            method: method.to_string(),
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Registered targets in registration order
#[derive(Default)]
pub struct TargetRegistry {
    entries: Vec<(String, Box<dyn RemoteObject>)>,
}

impl TargetRegistry {
    /// An empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `target` under `id`
    ///
    /// An existing entry with the same id is replaced in place, keeping its
    /// position. Returns `true` if something was replaced.
    pub fn insert(&mut self, id: String, target: Box<dyn RemoteObject>) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|(existing, _)| *existing == id) {
            entry.1 = target;
            true
        } else {
            self.entries.push((id, target));
            false
        }
    }

    /// Unregister `id`; returns whether it was present
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(existing, _)| existing != id);
        self.entries.len() != before
    }

    /// Registered ids in order
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Number of registered targets
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the target for `target_ref`; `None` means the first registered
    ///
    /// # Errors
    ///
    /// [`DispatchError::UnknownTarget`] if there is no such target.
    pub fn resolve(
        &mut self,
        target_ref: Option<&str>,
    ) -> Result<(&str, &mut dyn RemoteObject), DispatchError> {
        let entry = match target_ref {
            Some(id) => self.entries.iter_mut().find(|(existing, _)| existing == id),
            None => self.entries.first_mut(),
        };

        match entry {
            Some((id, target)) => Ok((id.as_str(), target.as_mut())),
            None => Err(DispatchError::UnknownTarget(
                target_ref.unwrap_or(DEFAULT_TARGET).to_string(),
            )),
        }
    }
}

// ============================================================================
// Argument Binding
// ============================================================================

/// Bind positional and keyword arguments to `spec`'s parameters
///
/// # Errors
///
/// [`DispatchError::BadArguments`] for too many positionals, unknown or
/// duplicate keywords, missing required parameters and kind mismatches.
pub fn bind_arguments(
    spec: &MethodSpec,
    args: &[Value],
    kwargs: &Kwargs,
) -> Result<Arguments, DispatchError> {
    if args.len() > spec.params.len() {
        return Err(DispatchError::bad_arguments(
            &spec.name,
            format!(
                "takes {} positional arguments but {} were given",
                spec.params.len(),
                args.len()
            ),
        ));
    }

    if let Some(unknown) = kwargs
        .keys()
        .find(|k| !spec.params.iter().any(|p| &p.name == *k))
    {
        return Err(DispatchError::bad_arguments(
            &spec.name,
            format!("unexpected keyword argument '{unknown}'"),
        ));
    }

    let mut bound = BTreeMap::new();
    for (index, param) in spec.params.iter().enumerate() {
        let positional = args.get(index);
        let keyword = kwargs.get(&param.name);

        let value = match (positional, keyword) {
            (Some(_), Some(_)) => {
                return Err(DispatchError::bad_arguments(
                    &spec.name,
                    format!("got multiple values for '{}'", param.name),
                ));
            }
            (Some(v), None) | (None, Some(v)) => v.clone(),
            (None, None) if param.required => {
                return Err(DispatchError::bad_arguments(
                    &spec.name,
                    format!("missing required argument '{}'", param.name),
                ));
            }
            (None, None) => param.default.clone(),
        };

        // Defaults are trusted; only caller-supplied values are checked
        let supplied = positional.is_some() || keyword.is_some();
        if supplied && !param.kind.accepts(&value) {
            return Err(DispatchError::bad_arguments(
                &spec.name,
                format!("'{}' must be {}, got {value}", param.name, param.kind),
            ));
        }

        bound.insert(param.name.clone(), value);
    }

    Ok(Arguments::from_map(bound))
}

// ============================================================================
// Dispatch
// ============================================================================

enum Failure {
    Dispatch(DispatchError),
    Target(TargetError),
    Panic(String),
}

impl Failure {
    fn kind(&self) -> String {
        match self {
            Self::Dispatch(e) => e.kind().to_string(),
            Self::Target(e) => e.kind.clone(),
            Self::Panic(_) => "Panic".to_string(),
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Dispatch(e) => e.to_string(),
            Self::Target(e) => e.message.clone(),
            Self::Panic(message) => message.clone(),
        }
    }
}

impl From<DispatchError> for Failure {
    fn from(e: DispatchError) -> Self {
        Self::Dispatch(e)
    }
}

/// Execute `request` against `registry` and build its reply
pub fn dispatch(registry: &mut TargetRegistry, request: &InvocationRequest) -> InvocationReply {
    let target_label = request.target_ref.as_deref().unwrap_or(DEFAULT_TARGET).to_string();

    match invoke(registry, request) {
        Ok(value) => {
            debug!(
                target_id = %target_label,
                kind = %request.kind,
                command = %request.command,
                "Invocation succeeded"
            );
            InvocationReply::ok(request.id, value)
        }
        Err(failure) => {
            let kind = failure.kind();
            let message = failure.message();
            warn!(
                target_id = %target_label,
                kind = %request.kind,
                command = %request.command,
                error_kind = %kind,
                error = %message,
                "Invocation failed"
            );

            let trace = build_trace(&target_label, request, &kind, &message);
            InvocationReply::err(
                request.id,
                RemoteError {
                    kind,
                    message,
                    trace,
                },
            )
        }
    }
}

fn invoke(registry: &mut TargetRegistry, request: &InvocationRequest) -> Result<Value, Failure> {
    let (id, target) = registry.resolve(request.target_ref.as_deref())?;
    // Interfaces are target code too; a panic there must not escape
    let interface = guarded(|| Ok(target.interface()))?;
    let command = request.command.as_str();

    match request.kind {
        InvocationKind::Describe => serde_json::to_value(&interface)
            .map_err(|e| Failure::Target(TargetError::new("SerializationError", e.to_string()))),

        InvocationKind::Get => match interface.member_kind(command) {
            Some(MemberKind::Property) => guarded(|| target.get(command)),
            Some(MemberKind::Method) => Err(DispatchError::NotAProperty {
                target: id.to_string(),
                member: command.to_string(),
            }
            .into()),
            None => Err(unknown_member(id, command)),
        },

        InvocationKind::Call => match interface.member_kind(command) {
            Some(MemberKind::Method) => {
                let spec = interface
                    .find_method(command)
                    .ok_or_else(|| unknown_member(id, command))?;
                let args = bind_arguments(spec, &request.args, &request.kwargs)?;
                guarded(|| target.call(command, &args))
            }
            Some(MemberKind::Property) => Err(DispatchError::NotCallable {
                target: id.to_string(),
                member: command.to_string(),
            }
            .into()),
            None => Err(unknown_member(id, command)),
        },
    }
}

fn unknown_member(target: &str, member: &str) -> Failure {
    Failure::Dispatch(DispatchError::UnknownMember {
        target: target.to_string(),
        member: member.to_string(),
    })
}

/// Run target code, turning a panic into a reportable failure
fn guarded<T, F>(f: F) -> Result<T, Failure>
where
    F: FnOnce() -> Result<T, TargetError>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result.map_err(Failure::Target),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "target panicked".to_string());
            Err(Failure::Panic(message))
        }
    }
}

fn build_trace(target: &str, request: &InvocationRequest, kind: &str, message: &str) -> String {
    let mut trace = format!(
        "{kind}: {message}\n  in {} '{}' on target '{target}' (request {})",
        request.kind, request.command, request.id
    );

    let backtrace = Backtrace::capture();
    if backtrace.status() == BacktraceStatus::Captured {
        trace.push_str("\nserver backtrace:\n");
        trace.push_str(&backtrace.to_string());
    }
    trace
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::target::{Interface, Param, ValueKind};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Counter {
        count: i64,
    }

    impl RemoteObject for Counter {
        fn interface(&self) -> Interface {
            Interface::new("Counter")
                .with_method(
                    MethodSpec::new("add")
                        .with_param(Param::required("n", ValueKind::Integer))
                        .with_param(Param::optional("times", ValueKind::Integer, json!(1))),
                )
                .with_method(MethodSpec::new("fail"))
                .with_method(MethodSpec::new("explode"))
                .with_property("count")
        }

        fn call(&mut self, method: &str, args: &Arguments) -> Result<Value, TargetError> {
            match method {
                "add" => {
                    let n: i64 = args.get("n")?;
                    let times: i64 = args.get("times")?;
                    self.count += n * times;
                    Ok(json!(self.count))
                }
                "fail" => Err(TargetError::value_error("nope")),
                "explode" => panic!("boom"),
                other => Err(TargetError::new("Unreachable", other)),
            }
        }

        fn get(&self, property: &str) -> Result<Value, TargetError> {
            match property {
                "count" => Ok(json!(self.count)),
                other => Err(TargetError::new("Unreachable", other)),
            }
        }
    }

    fn registry() -> TargetRegistry {
        let mut registry = TargetRegistry::new();
        registry.insert("counter".into(), Box::new(Counter { count: 0 }));
        registry
    }

    fn error_kind(reply: InvocationReply) -> String {
        reply.into_result().unwrap_err().kind
    }

    #[test]
    fn test_call_and_get() {
        let mut registry = registry();

        let reply = dispatch(
            &mut registry,
            &InvocationRequest::call("add", vec![json!(2)], Kwargs::new()),
        );
        assert_eq!(reply.into_result(), Ok(json!(2)));

        let mut kwargs = Kwargs::new();
        kwargs.insert("times".into(), json!(3));
        let reply = dispatch(
            &mut registry,
            &InvocationRequest::call("add", vec![json!(1)], kwargs),
        );
        assert_eq!(reply.into_result(), Ok(json!(5)));

        let reply = dispatch(&mut registry, &InvocationRequest::get("count"));
        assert_eq!(reply.into_result(), Ok(json!(5)));
    }

    #[test]
    fn test_reply_echoes_request_id() {
        let mut registry = registry();
        let request = InvocationRequest::get("count");
        assert_eq!(dispatch(&mut registry, &request).id, request.id);
    }

    #[test]
    fn test_describe_returns_interface() {
        let mut registry = registry();
        let value = dispatch(&mut registry, &InvocationRequest::describe())
            .into_result()
            .unwrap();

        let iface: Interface = serde_json::from_value(value).unwrap();
        assert_eq!(iface.name, "Counter");
        assert!(iface.has_property("count"));
    }

    #[test]
    fn test_member_errors() {
        let mut registry = registry();

        let reply = dispatch(
            &mut registry,
            &InvocationRequest::call("missing", vec![], Kwargs::new()),
        );
        assert_eq!(error_kind(reply), "UnknownMember");

        let reply = dispatch(
            &mut registry,
            &InvocationRequest::call("count", vec![], Kwargs::new()),
        );
        assert_eq!(error_kind(reply), "NotCallable");

        let reply = dispatch(&mut registry, &InvocationRequest::get("add"));
        assert_eq!(error_kind(reply), "NotAProperty");
    }

    #[test]
    fn test_target_error_kind_preserved() {
        let mut registry = registry();
        let reply = dispatch(
            &mut registry,
            &InvocationRequest::call("fail", vec![], Kwargs::new()),
        );

        let error = reply.into_result().unwrap_err();
        assert_eq!(error.kind, "ValueError");
        assert_eq!(error.message, "nope");
        assert!(error.trace.contains("'fail'"));
        assert!(error.trace.contains("counter") || error.trace.contains(DEFAULT_TARGET));
    }

    #[test]
    fn test_panic_is_contained() {
        let mut registry = registry();
        let reply = dispatch(
            &mut registry,
            &InvocationRequest::call("explode", vec![], Kwargs::new()),
        );

        let error = reply.into_result().unwrap_err();
        assert_eq!(error.kind, "Panic");
        assert_eq!(error.message, "boom");

        // The target is still usable afterwards
        let reply = dispatch(&mut registry, &InvocationRequest::get("count"));
        assert!(reply.is_ok());
    }

    struct BrokenInterface;

    impl RemoteObject for BrokenInterface {
        fn interface(&self) -> Interface {
            panic!("interface unavailable")
        }

        fn call(&mut self, _method: &str, _args: &Arguments) -> Result<Value, TargetError> {
            Ok(Value::Null)
        }

        fn get(&self, _property: &str) -> Result<Value, TargetError> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn test_interface_panic_is_contained() {
        let mut registry = registry();
        registry.insert("broken".into(), Box::new(BrokenInterface));

        for request in [
            InvocationRequest::get("x"),
            InvocationRequest::call("x", vec![], Kwargs::new()),
            InvocationRequest::describe(),
        ] {
            let reply = dispatch(&mut registry, &request.with_target(Some("broken".into())));
            let error = reply.into_result().unwrap_err();
            assert_eq!(error.kind, "Panic");
            assert_eq!(error.message, "interface unavailable");
        }

        // Healthy targets in the same registry keep answering
        let reply = dispatch(&mut registry, &InvocationRequest::get("count"));
        assert_eq!(reply.into_result(), Ok(json!(0)));
    }

    #[test]
    fn test_bind_arguments_rejections() {
        let spec = MethodSpec::new("m")
            .with_param(Param::required("a", ValueKind::Integer))
            .with_param(Param::optional("b", ValueKind::String, json!("x")));

        let too_many = bind_arguments(&spec, &[json!(1), json!("y"), json!(3)], &Kwargs::new());
        assert!(matches!(too_many, Err(DispatchError::BadArguments { .. })));

        let missing = bind_arguments(&spec, &[], &Kwargs::new());
        assert!(matches!(missing, Err(DispatchError::BadArguments { .. })));

        let wrong_kind = bind_arguments(&spec, &[json!("one")], &Kwargs::new());
        assert!(matches!(wrong_kind, Err(DispatchError::BadArguments { .. })));

        let mut kwargs = Kwargs::new();
        kwargs.insert("a".into(), json!(2));
        let twice = bind_arguments(&spec, &[json!(1)], &kwargs);
        assert!(matches!(twice, Err(DispatchError::BadArguments { .. })));

        let mut kwargs = Kwargs::new();
        kwargs.insert("zzz".into(), json!(2));
        let unknown = bind_arguments(&spec, &[json!(1)], &kwargs);
        assert!(matches!(unknown, Err(DispatchError::BadArguments { .. })));
    }

    #[test]
    fn test_bind_arguments_fills_defaults() {
        let spec = MethodSpec::new("m")
            .with_param(Param::required("a", ValueKind::Integer))
            .with_param(Param::optional("b", ValueKind::String, json!("x")));

        let args = bind_arguments(&spec, &[json!(1)], &Kwargs::new()).unwrap();
        assert_eq!(args.value("a"), Some(&json!(1)));
        assert_eq!(args.value("b"), Some(&json!("x")));
    }

    #[test]
    fn test_registry_targets() {
        let mut registry = TargetRegistry::new();
        assert!(matches!(
            registry.resolve(None),
            Err(DispatchError::UnknownTarget(_))
        ));

        registry.insert("first".into(), Box::new(Counter { count: 1 }));
        registry.insert("second".into(), Box::new(Counter { count: 2 }));

        // Default is the first registration
        let (id, _) = registry.resolve(None).unwrap();
        assert_eq!(id, "first");

        // Replacing keeps the position
        assert!(registry.insert("first".into(), Box::new(Counter { count: 10 })));
        assert_eq!(registry.ids(), vec!["first".to_string(), "second".to_string()]);

        let reply = dispatch(
            &mut registry,
            &InvocationRequest::get("count").with_target(Some("second".into())),
        );
        assert_eq!(reply.into_result(), Ok(json!(2)));

        let reply = dispatch(&mut registry, &InvocationRequest::get("count"));
        assert_eq!(reply.into_result(), Ok(json!(10)));

        let reply = dispatch(
            &mut registry,
            &InvocationRequest::get("count").with_target(Some("third".into())),
        );
        assert_eq!(error_kind(reply), "UnknownTarget");

        assert!(registry.remove("second"));
        assert!(!registry.remove("second"));
        assert_eq!(registry.len(), 1);
    }
}
