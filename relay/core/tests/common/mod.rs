//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::time::Duration;

use serde_json::{json, Value};

use relay_core::{
    Address, Arguments, Interface, MethodSpec, Param, ProxyServer, RemoteObject, RetryPolicy,
    TargetError, ValueKind,
};

/// Poll interval used by test servers; short so shutdown is quick
pub const TEST_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Let a fresh subscription reach the publisher before publishing
pub const SUBSCRIBE_SETTLE: Duration = Duration::from_millis(250);

/// A small arithmetic target with one property and one failing method
#[derive(Debug, Default)]
pub struct Calculator {
    pub label: String,
    pub calls: u64,
}

impl Calculator {
    pub fn named(label: &str) -> Self {
        Self {
            label: label.to_string(),
            calls: 0,
        }
    }
}

impl RemoteObject for Calculator {
    fn interface(&self) -> Interface {
        Interface::new("Calculator")
            .with_method(
                MethodSpec::new("add")
                    .with_param(Param::required("a", ValueKind::Number))
                    .with_param(Param::optional("b", ValueKind::Number, json!(0))),
            )
            .with_method(
                MethodSpec::new("divide")
                    .with_param(Param::required("a", ValueKind::Number))
                    .with_param(Param::required("b", ValueKind::Number)),
            )
            .with_method(
                MethodSpec::new("echo").with_param(Param::optional("value", ValueKind::Any, Value::Null)),
            )
            .with_method(MethodSpec::new("crash"))
            .with_property("label")
            .with_property("calls")
    }

    fn call(&mut self, method: &str, args: &Arguments) -> Result<Value, TargetError> {
        self.calls += 1;
        match method {
            "add" => {
                let a: f64 = args.get("a")?;
                let b: f64 = args.get("b")?;
                Ok(json!(a + b))
            }
            "divide" => {
                let a: f64 = args.get("a")?;
                let b: f64 = args.get("b")?;
                if b == 0.0 {
                    return Err(TargetError::new("ZeroDivisionError", "division by zero"));
                }
                Ok(json!(a / b))
            }
            "echo" => Ok(args.value("value").cloned().unwrap_or(Value::Null)),
            "crash" => panic!("calculator crashed"),
            other => Err(TargetError::new("Unreachable", other)),
        }
    }

    fn get(&self, property: &str) -> Result<Value, TargetError> {
        match property {
            "label" => Ok(json!(self.label)),
            "calls" => Ok(json!(self.calls)),
            other => Err(TargetError::new("Unreachable", other)),
        }
    }
}

/// Retry policy with short, explicit timings
pub fn policy(timeout_ms: u64, max_retries: u32) -> RetryPolicy {
    RetryPolicy::default()
        .with_timeout(Duration::from_millis(timeout_ms))
        .with_max_retries(max_retries)
        .with_connect_timeout(Duration::from_millis(500))
}

/// A localhost port with nothing listening on it
pub fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Proxy server on an ephemeral port serving one calculator as `calc`
pub async fn calculator_server() -> ProxyServer {
    let server = ProxyServer::bind(&Address::localhost(0), TEST_POLL_INTERVAL)
        .await
        .unwrap();
    server.add("calc", Calculator::named("main"));
    server
}
