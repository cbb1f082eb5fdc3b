//! Audit events
//!
//! Every connection, login and gated command produces one structured
//! [`AuditEvent`]. Where the events end up is the sink's business; the
//! default sink hands them to `tracing` under the `audit` target.

use std::fmt;
use std::net::IpAddr;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{info, warn};

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Connect,
    Disconnect,
    ConnectionRefused,
    LoginSucceeded,
    LoginFailed,
    Command,
    FileReceived,
    IncompleteFileReceived,
}

/// How it ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure(String),
    Denied(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Failure(why) => write!(f, "failure: {}", why),
            Outcome::Denied(why) => write!(f, "denied: {}", why),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    pub kind: AuditKind,
    pub remote: IpAddr,
    pub identity: Option<String>,
    /// Verb name for commands, e.g. `"STOR"`
    pub verb: Option<&'static str>,
    pub target: Option<String>,
    pub outcome: Outcome,
}

impl AuditEvent {
    pub fn new(kind: AuditKind, remote: IpAddr, outcome: Outcome) -> Self {
        Self {
            kind,
            remote,
            identity: None,
            verb: None,
            target: None,
            outcome,
        }
    }

    pub fn identity(mut self, identity: Option<&str>) -> Self {
        self.identity = identity.map(str::to_string);
        self
    }

    pub fn verb(mut self, verb: &'static str) -> Self {
        self.verb = Some(verb);
        self
    }

    pub fn target(mut self, target: impl fmt::Display) -> Self {
        self.target = Some(target.to_string());
        self
    }
}

/// Destination for audit events
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes events through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        let identity = event.identity.as_deref().unwrap_or("-");
        let verb = event.verb.unwrap_or("-");
        let target = event.target.as_deref().unwrap_or("-");

        if event.outcome.is_success() {
            info!(
                target: "audit",
                kind = ?event.kind,
                remote = %event.remote,
                identity,
                verb,
                path = target,
                outcome = %event.outcome,
                "audit"
            );
        } else {
            warn!(
                target: "audit",
                kind = ?event.kind,
                remote = %event.remote,
                identity,
                verb,
                path = target,
                outcome = %event.outcome,
                "audit"
            );
        }
    }
}

/// Keeps events in memory, for inspection in tests
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
