//! Experiment Log
//!
//! The demo target served by `relay-daemon serve`. It records key/value
//! measurements grouped into numbered runs of one session, and hands every
//! recorded entry to an optional notifier so the daemon can broadcast it.

use std::path::{Path, PathBuf};

use chrono::Local;
use rand::Rng;
use relay_core::{Arguments, Interface, MethodSpec, Param, RemoteObject, TargetError, ValueKind};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Directory name format for a session, one per daemon start
const SESSION_DIR_FORMAT: &str = "%Y-%m-%d_%H:%M:%S";

/// One recorded measurement
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Run the entry belongs to (1-based)
    pub run: u64,
    /// Measurement name
    pub key: String,
    /// Measured value
    pub value: Value,
    /// Local wall-clock time the entry was recorded (RFC 3339)
    pub recorded_at: String,
}

/// Session-scoped measurement log
#[derive(Debug)]
pub struct ExperimentLog {
    session_id: Uuid,
    session_path: PathBuf,
    seed: u64,
    running: bool,
    run_count: u64,
    entries: Vec<LogEntry>,
    notifier: Option<mpsc::UnboundedSender<LogEntry>>,
}

impl ExperimentLog {
    /// Start a new session under `base_dir` with a random seed
    pub fn new(base_dir: &Path) -> Self {
        Self::with_seed(base_dir, rand::thread_rng().gen())
    }

    /// Start a new session with a fixed seed
    pub fn with_seed(base_dir: &Path, seed: u64) -> Self {
        let session_path = base_dir.join(Local::now().format(SESSION_DIR_FORMAT).to_string());
        let session_id = Uuid::new_v4();

        info!(session_id = %session_id, path = ?session_path, seed, "Experiment session created");

        Self {
            session_id,
            session_path,
            seed,
            running: false,
            run_count: 0,
            entries: Vec::new(),
            notifier: None,
        }
    }

    /// Forward every recorded entry to `notifier`
    #[must_use]
    pub fn with_notifier(mut self, notifier: mpsc::UnboundedSender<LogEntry>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    fn start_run(&mut self) -> Result<Value, TargetError> {
        if self.running {
            return Err(TargetError::state_error(format!(
                "run {} is still in progress",
                self.run_count
            )));
        }

        self.run_count += 1;
        self.running = true;
        info!(run = self.run_count, "Run started");
        Ok(json!(self.run_count))
    }

    fn stop_run(&mut self) -> Result<Value, TargetError> {
        if !self.running {
            return Err(TargetError::state_error("no run in progress"));
        }

        self.running = false;
        let recorded = self
            .entries
            .iter()
            .filter(|e| e.run == self.run_count)
            .count();
        info!(run = self.run_count, recorded, "Run stopped");
        Ok(json!(self.run_count))
    }

    fn log(&mut self, args: &Arguments) -> Result<Value, TargetError> {
        let key: String = args.get("key")?;
        if key.trim().is_empty() {
            return Err(TargetError::value_error("key must not be empty"));
        }
        if !self.running {
            return Err(TargetError::state_error("no run in progress"));
        }

        let entry = LogEntry {
            run: self.run_count,
            key,
            value: args.value("value").cloned().unwrap_or(Value::Null),
            recorded_at: Local::now().to_rfc3339(),
        };
        debug!(run = entry.run, key = %entry.key, "Entry recorded");

        let closed = self
            .notifier
            .as_ref()
            .is_some_and(|notifier| notifier.send(entry.clone()).is_err());
        if closed {
            warn!("Entry notifier closed, broadcasts stop here");
            self.notifier = None;
        }

        self.entries.push(entry);
        Ok(json!(self.entries.len()))
    }

    fn entries(&self, args: &Arguments) -> Result<Value, TargetError> {
        let limit: Option<usize> = args.get_opt("limit")?;
        let skip = limit.map_or(0, |n| self.entries.len().saturating_sub(n));

        serde_json::to_value(&self.entries[skip..])
            .map_err(|e| TargetError::new("SerializationError", e.to_string()))
    }

    fn clear(&mut self) -> Value {
        let removed = self.entries.len();
        self.entries.clear();
        info!(removed, "Entries cleared");
        json!(removed)
    }
}

impl RemoteObject for ExperimentLog {
    fn interface(&self) -> Interface {
        Interface::new("ExperimentLog")
            .with_method(MethodSpec::new("start_run"))
            .with_method(MethodSpec::new("stop_run"))
            .with_method(
                MethodSpec::new("log")
                    .with_param(Param::required("key", ValueKind::String))
                    .with_param(Param::required("value", ValueKind::Any)),
            )
            .with_method(
                MethodSpec::new("entries").with_param(Param::optional(
                    "limit",
                    ValueKind::Integer,
                    Value::Null,
                )),
            )
            .with_method(MethodSpec::new("clear"))
            .with_property("session_id")
            .with_property("session_path")
            .with_property("running")
            .with_property("run_count")
            .with_property("seed")
    }

    fn call(&mut self, method: &str, args: &Arguments) -> Result<Value, TargetError> {
        match method {
            "start_run" => self.start_run(),
            "stop_run" => self.stop_run(),
            "log" => self.log(args),
            "entries" => self.entries(args),
            "clear" => Ok(self.clear()),
            other => Err(TargetError::new(
                "AttributeError",
                format!("no method '{other}'"),
            )),
        }
    }

    fn get(&self, property: &str) -> Result<Value, TargetError> {
        match property {
            "session_id" => Ok(json!(self.session_id.to_string())),
            "session_path" => Ok(json!(self.session_path.display().to_string())),
            "running" => Ok(json!(self.running)),
            "run_count" => Ok(json!(self.run_count)),
            "seed" => Ok(json!(self.seed)),
            other => Err(TargetError::new(
                "AttributeError",
                format!("no property '{other}'"),
            )),
        }
    }
}
