//! Access Gate
//!
//! Every command a session issues passes through [`Gate::dispatch`] before
//! it may touch the file system:
//!
//! ```text
//!   command ──► classify ──► passthrough ───────────────────────► handler
//!                  │
//!                  ├──► retrieve ──► deny "download not permitted"
//!                  │
//!                  └──► mutating ──► path ──► whitelist ──► blacklist ──► handler
//!                                     │          │             │
//!                                     └──────────┴─────────────┴──► deny (553)
//! ```
//!
//! Checks run in order and the first failure wins. A denied command never
//! polls the handler future, so nothing reaches the file system. Mutating
//! and denied commands each produce exactly one audit event.

use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::audit::{AuditEvent, AuditKind, AuditSink, Outcome};
use crate::policy::{AccessPolicy, Permissions};
use crate::protocol::{codes, Reply};

/// Message returned for every retrieve attempt
pub const DOWNLOAD_DENIED: &str = "Permission denied: download not permitted";

/// Commands the gate knows how to classify
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Store,
    Append,
    MakeDirectory,
    RemoveDirectory,
    Delete,
    RenameFrom,
    RenameTo,
    Retrieve,
    List,
    Size,
    ChangeDirectory,
    PrintDirectory,
}

/// How the gate treats a verb
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Changes server state; evaluated against the policy
    Mutating,
    /// Refused before any evaluation
    AlwaysDenied,
    /// Forwarded without checks
    Passthrough,
}

impl Verb {
    pub fn name(self) -> &'static str {
        match self {
            Verb::Store => "STOR",
            Verb::Append => "APPE",
            Verb::MakeDirectory => "MKD",
            Verb::RemoveDirectory => "RMD",
            Verb::Delete => "DELE",
            Verb::RenameFrom => "RNFR",
            Verb::RenameTo => "RNTO",
            Verb::Retrieve => "RETR",
            Verb::List => "LIST",
            Verb::Size => "SIZE",
            Verb::ChangeDirectory => "CWD",
            Verb::PrintDirectory => "PWD",
        }
    }

    pub fn class(self) -> CommandClass {
        match self {
            Verb::Store
            | Verb::Append
            | Verb::MakeDirectory
            | Verb::RemoveDirectory
            | Verb::Delete
            | Verb::RenameFrom
            | Verb::RenameTo => CommandClass::Mutating,
            Verb::Retrieve => CommandClass::AlwaysDenied,
            Verb::List | Verb::Size | Verb::ChangeDirectory | Verb::PrintDirectory => {
                CommandClass::Passthrough
            }
        }
    }

    /// Reply code the handler sends when a mutating verb succeeds
    pub fn success_code(self) -> Option<u16> {
        match self {
            Verb::Store | Verb::Append => Some(codes::TRANSFER_COMPLETE),
            Verb::MakeDirectory => Some(codes::PATH_CREATED),
            Verb::RemoveDirectory | Verb::Delete | Verb::RenameTo => Some(codes::ACTION_OK),
            Verb::RenameFrom => Some(codes::PENDING),
            _ => None,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Who is on the other end of a session
///
/// Owned by the session task; the gate only reads it.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub remote: IpAddr,
    pub identity: Option<String>,
    pub permissions: Permissions,
}

impl SessionContext {
    /// A connection that has not logged in yet
    pub fn anonymous(remote: IpAddr) -> Self {
        Self {
            remote,
            identity: None,
            permissions: Permissions::empty(),
        }
    }
}

/// A command as the gate sees it
#[derive(Debug, Clone, Copy)]
pub struct Command<'a> {
    pub verb: Verb,
    /// Absolute file-system path the command would act on
    pub target: &'a Path,
    pub session: &'a SessionContext,
}

/// Why a command was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub check: &'static str,
    pub message: String,
}

impl Denial {
    pub fn new(check: &'static str, message: impl Into<String>) -> Self {
        Self {
            check,
            message: message.into(),
        }
    }

    pub fn to_reply(&self) -> Reply {
        Reply::new(codes::NOT_PERMITTED, self.message.clone())
    }
}

/// One stage of the gate's pipeline
pub trait PolicyCheck: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, command: &Command<'_>, policy: &AccessPolicy) -> Result<(), Denial>;
}

/// Target must resolve inside the allowed root
#[derive(Debug, Default)]
pub struct PathContainment;

impl PolicyCheck for PathContainment {
    fn name(&self) -> &'static str {
        "path"
    }

    fn check(&self, command: &Command<'_>, policy: &AccessPolicy) -> Result<(), Denial> {
        if policy.is_path_allowed(command.target) {
            Ok(())
        } else {
            Err(Denial::new(self.name(), "Permission denied"))
        }
    }
}

/// Remote address must be whitelisted
#[derive(Debug, Default)]
pub struct IpWhitelist;

impl PolicyCheck for IpWhitelist {
    fn name(&self) -> &'static str {
        "whitelist"
    }

    fn check(&self, command: &Command<'_>, policy: &AccessPolicy) -> Result<(), Denial> {
        if policy.is_whitelisted(command.session.remote) {
            Ok(())
        } else {
            Err(Denial::new(
                self.name(),
                "Permission denied: IP not in whitelist",
            ))
        }
    }
}

/// Remote address must not be blacklisted
#[derive(Debug, Default)]
pub struct IpBlacklist;

impl PolicyCheck for IpBlacklist {
    fn name(&self) -> &'static str {
        "blacklist"
    }

    fn check(&self, command: &Command<'_>, policy: &AccessPolicy) -> Result<(), Denial> {
        if policy.is_blacklisted(command.session.remote) {
            Err(Denial::new(self.name(), "Permission denied: IP in blacklist"))
        } else {
            Ok(())
        }
    }
}

/// Path containment, then whitelist, then blacklist
pub fn default_checks() -> Vec<Box<dyn PolicyCheck>> {
    vec![
        Box::new(PathContainment),
        Box::new(IpWhitelist),
        Box::new(IpBlacklist),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Forward,
    Deny(Denial),
}

pub struct Gate {
    policy: Arc<AccessPolicy>,
    checks: Vec<Box<dyn PolicyCheck>>,
    audit: Arc<dyn AuditSink>,
}

impl Gate {
    pub fn new(policy: Arc<AccessPolicy>, audit: Arc<dyn AuditSink>) -> Self {
        Self::with_checks(policy, default_checks(), audit)
    }

    /// Build a gate with a custom pipeline, evaluated in order
    pub fn with_checks(
        policy: Arc<AccessPolicy>,
        checks: Vec<Box<dyn PolicyCheck>>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            policy,
            checks,
            audit,
        }
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    pub fn audit(&self) -> &dyn AuditSink {
        self.audit.as_ref()
    }

    /// Decide a command without forwarding or auditing it
    pub fn evaluate(&self, command: &Command<'_>) -> Verdict {
        match command.verb.class() {
            CommandClass::Passthrough => Verdict::Forward,
            CommandClass::AlwaysDenied => Verdict::Deny(Denial::new("retrieve", DOWNLOAD_DENIED)),
            CommandClass::Mutating => self
                .checks
                .iter()
                .find_map(|check| check.check(command, &self.policy).err())
                .map_or(Verdict::Forward, Verdict::Deny),
        }
    }

    /// Evaluate `command` and, if allowed, await `forward` for the reply.
    ///
    /// `forward` is only polled when the command passes; a denied command
    /// gets a 553 reply and the future is dropped untouched.
    pub async fn dispatch<F>(&self, command: &Command<'_>, forward: F) -> Reply
    where
        F: Future<Output = Reply>,
    {
        let verb = command.verb;

        match self.evaluate(command) {
            Verdict::Deny(denial) => {
                debug!(
                    "{} {} denied by {} check",
                    verb,
                    command.target.display(),
                    denial.check
                );
                self.record(command, Outcome::Denied(denial.message.clone()));
                denial.to_reply()
            }
            Verdict::Forward if verb.class() == CommandClass::Passthrough => forward.await,
            Verdict::Forward => {
                let reply = forward.await;
                let outcome = if Some(reply.code) == verb.success_code() {
                    Outcome::Success
                } else {
                    Outcome::Failure(reply.to_string())
                };
                self.record(command, outcome);
                reply
            }
        }
    }

    /// Connection-time check: blacklisted addresses are refused outright.
    pub fn admit(&self, remote: IpAddr) -> Result<(), Reply> {
        if self.policy.is_blacklisted(remote) {
            let reply = Reply::new(codes::NOT_LOGGED_IN, "Permission denied: IP in blacklist");
            self.audit.record(AuditEvent::new(
                AuditKind::ConnectionRefused,
                remote,
                Outcome::Denied(reply.message.clone()),
            ));
            return Err(reply);
        }
        Ok(())
    }

    fn record(&self, command: &Command<'_>, outcome: Outcome) {
        self.audit.record(
            AuditEvent::new(AuditKind::Command, command.session.remote, outcome)
                .identity(command.session.identity.as_deref())
                .verb(command.verb.name())
                .target(command.target.display()),
        );
    }
}
