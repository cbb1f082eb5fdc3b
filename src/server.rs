//! File transfer server
//!
//! ```text
//!   accept ──► admission limits ──► TLS (optional) ──► blacklist check ──► 220
//!                    │                                       │
//!                    └──► 421, close                         └──► 530, close
//!
//!   session loop:  request ──► login? ──► Gate ──► local file system ──► reply
//! ```
//!
//! Each session runs on its own task and handles requests strictly in
//! order. Mutating commands reach the file system only through
//! [`Gate::dispatch`]; the user's capability profile is enforced after the
//! gate lets a command through.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use anyhow::{Context, Result};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEvent, AuditKind, AuditSink, Outcome};
use crate::config::{Accounts, ServerSettings};
use crate::gate::{Command, Gate, SessionContext, Verb, DOWNLOAD_DENIED};
use crate::limits::{Admission, ConnectionLimits, Refusal};
use crate::policy::Permissions;
use crate::protocol::{
    codes, FileInfo, EntryKind, MessageFramer, ProtocolError, Reply, Request, Response,
    StreamingHasher, CHUNK_SIZE,
};
use crate::remote::normalize_remote;
use crate::tls::{BoxedStream, ServerTlsConfig, ServerTransport};

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;
pub const DEFAULT_MAX_CONNECTIONS_PER_IP: usize = 5;

/// Failed logins before the session is closed
const MAX_LOGIN_ATTEMPTS: u32 = 3;

pub struct Server {
    gate: Gate,
    accounts: Accounts,
    limits: ConnectionLimits,
    transport: ServerTransport,
    session_timeout: Duration,
}

impl Server {
    pub fn new(gate: Gate, accounts: Accounts) -> Self {
        Self {
            gate,
            accounts,
            limits: ConnectionLimits::new(DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_CONNECTIONS_PER_IP),
            transport: ServerTransport::plain(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
        }
    }

    /// Build everything from a settings file's values
    pub fn from_settings(settings: &ServerSettings, audit: Arc<dyn AuditSink>) -> Result<Self> {
        let policy = settings.access_policy()?;
        let gate = Gate::new(Arc::new(policy), audit);

        let transport = match ServerTlsConfig::from_settings(&settings.tls)? {
            Some(config) => ServerTransport::tls(config),
            None => ServerTransport::plain(),
        };

        Ok(Self::new(gate, settings.accounts()?)
            .with_transport(transport)
            .with_limits(settings.max_connections, settings.max_connections_per_ip)
            .with_timeout(settings.session_timeout()))
    }

    pub fn with_transport(mut self, transport: ServerTransport) -> Self {
        self.transport = transport;
        self
    }

    /// 0 means unlimited for either limit
    pub fn with_limits(mut self, max_connections: usize, max_per_ip: usize) -> Self {
        self.limits = ConnectionLimits::new(max_connections, max_per_ip);
        self
    }

    pub fn with_timeout(mut self, session_timeout: Duration) -> Self {
        self.session_timeout = session_timeout;
        self
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    pub async fn bind<A: ToSocketAddrs + std::fmt::Debug>(self, addr: A) -> Result<BoundServer> {
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {:?}", addr))?;

        Ok(BoundServer {
            server: Arc::new(self),
            listener,
        })
    }

    /// Bind and serve until the process ends
    pub async fn run<A: ToSocketAddrs + std::fmt::Debug>(self, addr: A) -> Result<()> {
        self.bind(addr).await?.run().await
    }
}

/// A server with its listening socket open
pub struct BoundServer {
    server: Arc<Server>,
    listener: TcpListener,
}

impl BoundServer {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> Result<()> {
        info!(
            "🔒 Listening on {} ({})",
            self.local_addr()?,
            if self.server.transport.is_tls() { "TLS" } else { "plain TCP" }
        );
        info!("📁 Allowed root: {:?}", self.server.gate.policy().allowed_root());

        loop {
            let (tcp_stream, peer_addr) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let admission = self.server.limits.admit(peer_addr.ip());
            let server = self.server.clone();

            tokio::spawn(async move {
                match handle_connection(server, tcp_stream, peer_addr, admission).await {
                    Ok(()) => debug!("Connection from {} closed normally", peer_addr),
                    Err(e) => warn!("Connection from {} error: {}", peer_addr, e),
                }
            });
        }
    }
}

struct Wire {
    reader: BufReader<ReadHalf<BoxedStream>>,
    writer: BufWriter<WriteHalf<BoxedStream>>,
    /// Longest silence tolerated from the client, between commands or chunks
    idle_timeout: Duration,
    /// Set when a data stream was cut off mid-transfer; the session must close
    broken: bool,
}

impl Wire {
    fn new(stream: BoxedStream, idle_timeout: Duration) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            idle_timeout,
            broken: false,
        }
    }

    async fn send(&mut self, response: impl Into<Response>) -> Result<(), ProtocolError> {
        MessageFramer::write_message(&mut self.writer, &response.into()).await
    }
}

async fn handle_connection<S>(
    server: Arc<Server>,
    stream: S,
    peer: SocketAddr,
    admission: Result<Admission, Refusal>,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    info!("📥 New connection from {}", peer);
    let remote = peer.ip().to_canonical();
    let audit = server.gate.audit();

    let stream = match timeout(server.session_timeout, server.transport.accept(stream)).await {
        Ok(result) => result?,
        Err(_) => {
            warn!("Handshake with {} timed out", peer);
            return Ok(());
        }
    };
    let mut wire = Wire::new(stream, server.session_timeout);

    let _admission = match admission {
        Ok(admission) => admission,
        Err(refusal) => {
            warn!("Refusing {}: {}", peer, refusal);
            audit.record(AuditEvent::new(
                AuditKind::ConnectionRefused,
                remote,
                Outcome::Denied(refusal.to_string()),
            ));
            return wire.send(refusal.to_reply()).await;
        }
    };

    if let Err(reply) = server.gate.admit(remote) {
        warn!("Refusing blacklisted {}", peer);
        return wire.send(reply).await;
    }

    audit.record(AuditEvent::new(AuditKind::Connect, remote, Outcome::Success));
    wire.send(Reply::new(codes::SERVICE_READY, "Gated file transfer server ready."))
        .await?;

    let mut session = Session::new(server.clone(), peer, wire);
    let result = session.run().await;

    audit.record(
        AuditEvent::new(AuditKind::Disconnect, remote, Outcome::Success)
            .identity(session.context.identity.as_deref()),
    );
    result
}

enum Flow {
    Continue,
    Close,
}

struct Session {
    server: Arc<Server>,
    peer: SocketAddr,
    context: SessionContext,
    files: SessionFiles,
    wire: Wire,
    failed_logins: u32,
}

impl Session {
    fn new(server: Arc<Server>, peer: SocketAddr, wire: Wire) -> Self {
        let home = server.gate.policy().allowed_root().to_path_buf();
        Self {
            server,
            peer,
            context: SessionContext::anonymous(peer.ip().to_canonical()),
            files: SessionFiles::new(home),
            wire,
            failed_logins: 0,
        }
    }

    async fn run(&mut self) -> Result<(), ProtocolError> {
        loop {
            let read = MessageFramer::read_message::<_, Request>(&mut self.wire.reader);
            let request = match timeout(self.wire.idle_timeout, read).await {
                Err(_) => {
                    info!("⏱️  Session with {} idle too long", self.peer);
                    return self
                        .wire
                        .send(Reply::new(
                            codes::SERVICE_UNAVAILABLE,
                            "Control connection timed out.",
                        ))
                        .await;
                }
                Ok(Err(e)) if e.is_disconnect() => {
                    info!("Client {} disconnected", self.peer);
                    return Ok(());
                }
                Ok(Err(e)) => return Err(e),
                Ok(Ok(request)) => request,
            };

            if let Flow::Close = self.handle(request).await? {
                return Ok(());
            }
            if self.wire.broken {
                info!("Closing session with {} after an aborted transfer", self.peer);
                return Ok(());
            }
        }
    }

    async fn handle(&mut self, request: Request) -> Result<Flow, ProtocolError> {
        match request {
            Request::Quit => {
                self.wire.send(Reply::new(codes::GOODBYE, "Goodbye.")).await?;
                Ok(Flow::Close)
            }
            Request::Login { username, password } => self.login(&username, &password).await,
            _ if self.context.identity.is_none() => {
                self.wire
                    .send(Reply::new(codes::NOT_LOGGED_IN, "Log in first."))
                    .await?;
                Ok(Flow::Continue)
            }
            request => {
                self.command(&request).await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn login(&mut self, username: &str, password: &str) -> Result<Flow, ProtocolError> {
        let server = self.server.clone();
        let remote = self.context.remote;

        match server.accounts.authenticate(username, password) {
            Some(account) => {
                info!("🔑 {} logged in from {}", account.username, self.peer);
                self.context = SessionContext {
                    remote,
                    identity: Some(account.username.clone()),
                    permissions: account.permissions,
                };
                self.files = SessionFiles::new(account.home.clone());
                self.failed_logins = 0;

                server.gate.audit().record(
                    AuditEvent::new(AuditKind::LoginSucceeded, remote, Outcome::Success)
                        .identity(Some(username)),
                );
                self.wire
                    .send(Reply::new(codes::LOGGED_IN, "Login successful."))
                    .await?;
                Ok(Flow::Continue)
            }
            None => {
                self.failed_logins += 1;
                warn!("Failed login for {:?} from {}", username, self.peer);

                server.gate.audit().record(
                    AuditEvent::new(
                        AuditKind::LoginFailed,
                        remote,
                        Outcome::Failure("Authentication failed.".into()),
                    )
                    .identity(Some(username)),
                );
                self.wire
                    .send(Reply::new(codes::NOT_LOGGED_IN, "Authentication failed."))
                    .await?;

                if self.failed_logins >= MAX_LOGIN_ATTEMPTS {
                    Ok(Flow::Close)
                } else {
                    Ok(Flow::Continue)
                }
            }
        }
    }

    async fn command(&mut self, request: &Request) -> Result<(), ProtocolError> {
        let Some((verb, path)) = classify(request) else {
            return self
                .wire
                .send(Reply::new(codes::BAD_SEQUENCE, "Bad sequence of commands."))
                .await;
        };

        if verb != Verb::RenameTo {
            self.files.pending_rename = None;
        }

        let (virtual_path, target) = self.files.resolve(path);
        debug!("{} {} -> {:?} from {}", verb, virtual_path, target, self.peer);

        let Session {
            server,
            context,
            files,
            wire,
            ..
        } = self;
        let context = &*context;
        let command = Command {
            verb,
            target: &target,
            session: context,
        };

        let handler = files.execute(verb, &virtual_path, &target, context, wire, server.gate.audit());
        let response = gated(&server.gate, &command, handler).await;
        wire.send(response).await
    }
}

/// Run `handler` behind the gate, keeping non-reply responses intact
async fn gated<F>(gate: &Gate, command: &Command<'_>, handler: F) -> Response
where
    F: Future<Output = Response>,
{
    let mut body = None;
    let reply = gate
        .dispatch(command, async {
            match handler.await {
                Response::Reply(reply) => reply,
                other => {
                    body = Some(other);
                    Reply::new(codes::OK, "OK")
                }
            }
        })
        .await;
    body.unwrap_or(Response::Reply(reply))
}

fn classify(request: &Request) -> Option<(Verb, &str)> {
    let classified = match request {
        Request::Store { path } => (Verb::Store, path.as_str()),
        Request::Append { path } => (Verb::Append, path.as_str()),
        Request::Retrieve { path } => (Verb::Retrieve, path.as_str()),
        Request::List { path } => (Verb::List, path.as_deref().unwrap_or(".")),
        Request::Size { path } => (Verb::Size, path.as_str()),
        Request::MakeDirectory { path } => (Verb::MakeDirectory, path.as_str()),
        Request::RemoveDirectory { path } => (Verb::RemoveDirectory, path.as_str()),
        Request::Delete { path } => (Verb::Delete, path.as_str()),
        Request::RenameFrom { path } => (Verb::RenameFrom, path.as_str()),
        Request::RenameTo { path } => (Verb::RenameTo, path.as_str()),
        Request::ChangeDirectory { path } => (Verb::ChangeDirectory, path.as_str()),
        Request::PrintDirectory => (Verb::PrintDirectory, "."),
        Request::Login { .. } | Request::Quit => return None,
    };
    Some(classified)
}

fn required_permission(verb: Verb) -> Permissions {
    match verb {
        Verb::Store => Permissions::UPLOAD,
        Verb::Append => Permissions::APPEND,
        Verb::MakeDirectory => Permissions::MAKE_DIR,
        Verb::RemoveDirectory | Verb::Delete => Permissions::DELETE,
        Verb::RenameFrom | Verb::RenameTo => Permissions::RENAME,
        Verb::Retrieve => Permissions::DOWNLOAD,
        Verb::List | Verb::Size => Permissions::LIST,
        Verb::ChangeDirectory => Permissions::CHANGE_DIR,
        Verb::PrintDirectory => Permissions::empty(),
    }
}

fn fs_error(e: io::Error) -> Reply {
    let message = match e.kind() {
        io::ErrorKind::NotFound => "No such file or directory.".to_string(),
        io::ErrorKind::AlreadyExists => "File exists.".to_string(),
        io::ErrorKind::PermissionDenied => "Permission denied.".to_string(),
        _ => e.to_string(),
    };
    Reply::new(codes::ACTION_FAILED, message)
}

/// Per-session view of the local file system
///
/// Client paths are virtual: `/` is the user's home directory and `..`
/// cannot climb above it. Symbolic links are not resolved here; the gate
/// does that when it checks containment.
struct SessionFiles {
    home: PathBuf,
    cwd: String,
    pending_rename: Option<PathBuf>,
}

impl SessionFiles {
    fn new(home: PathBuf) -> Self {
        Self {
            home,
            cwd: "/".to_string(),
            pending_rename: None,
        }
    }

    fn resolve(&self, path: &str) -> (String, PathBuf) {
        let virtual_path = normalize_remote(&self.cwd, path);
        let relative = virtual_path.trim_start_matches('/');
        let target = if relative.is_empty() {
            self.home.clone()
        } else {
            self.home.join(relative)
        };
        (virtual_path, target)
    }

    async fn execute(
        &mut self,
        verb: Verb,
        virtual_path: &str,
        target: &Path,
        session: &SessionContext,
        wire: &mut Wire,
        audit: &dyn AuditSink,
    ) -> Response {
        if !session.permissions.contains(required_permission(verb)) {
            return Reply::new(codes::ACTION_FAILED, "Not enough privileges.").into();
        }

        let reply = match verb {
            Verb::Store => receive(verb, target, false, session, wire, audit).await,
            Verb::Append => receive(verb, target, true, session, wire, audit).await,
            Verb::Retrieve => Reply::new(codes::NOT_PERMITTED, DOWNLOAD_DENIED),
            Verb::List => return list(target).await,
            Verb::Size => match fs::metadata(target).await {
                Ok(metadata) if metadata.is_file() => {
                    return Response::Size {
                        bytes: metadata.len(),
                    }
                }
                Ok(_) => Reply::new(codes::ACTION_FAILED, "Not a regular file."),
                Err(e) => fs_error(e),
            },
            Verb::MakeDirectory => match fs::create_dir(target).await {
                Ok(()) => Reply::new(
                    codes::PATH_CREATED,
                    format!("\"{}\" directory created.", virtual_path),
                ),
                Err(e) => fs_error(e),
            },
            Verb::RemoveDirectory => match fs::remove_dir(target).await {
                Ok(()) => Reply::new(codes::ACTION_OK, "Directory removed."),
                Err(e) => fs_error(e),
            },
            Verb::Delete => match fs::remove_file(target).await {
                Ok(()) => Reply::new(codes::ACTION_OK, "File removed."),
                Err(e) => fs_error(e),
            },
            Verb::RenameFrom => match fs::symlink_metadata(target).await {
                Ok(_) => {
                    self.pending_rename = Some(target.to_path_buf());
                    Reply::new(codes::PENDING, "Ready for destination name.")
                }
                Err(e) => fs_error(e),
            },
            Verb::RenameTo => match self.pending_rename.take() {
                Some(from) => match fs::rename(&from, target).await {
                    Ok(()) => Reply::new(codes::ACTION_OK, "Renaming ok."),
                    Err(e) => fs_error(e),
                },
                None => Reply::new(
                    codes::BAD_SEQUENCE,
                    "Bad sequence of commands: use RNFR first.",
                ),
            },
            Verb::ChangeDirectory => match fs::metadata(target).await {
                Ok(metadata) if metadata.is_dir() => {
                    self.cwd = virtual_path.to_string();
                    Reply::new(
                        codes::ACTION_OK,
                        format!("\"{}\" is the current directory.", self.cwd),
                    )
                }
                Ok(_) => Reply::new(codes::ACTION_FAILED, "Not a directory."),
                Err(e) => fs_error(e),
            },
            Verb::PrintDirectory => Reply::new(
                codes::PATH_CREATED,
                format!("\"{}\" is the current directory.", self.cwd),
            ),
        };

        reply.into()
    }
}

/// Receive a data stream into `target`.
///
/// Each chunk must arrive within the idle timeout. On any failure a stored
/// file is removed (an appended one is left as is) and an incomplete-file
/// audit event is recorded. A stream that was cut off or went silent marks
/// the wire broken.
async fn receive(
    verb: Verb,
    target: &Path,
    append: bool,
    session: &SessionContext,
    wire: &mut Wire,
    audit: &dyn AuditSink,
) -> Reply {
    let opened = if append {
        OpenOptions::new().create(true).append(true).open(target).await
    } else {
        File::create(target).await
    };
    let file = match opened {
        Ok(file) => file,
        Err(e) => return fs_error(e),
    };

    if let Err(e) = wire
        .send(Reply::new(codes::DATA_READY, "Ready to receive data."))
        .await
    {
        return Reply::new(codes::TRANSFER_ABORTED, format!("Transfer aborted: {}", e));
    }

    let mut writer = BufWriter::new(file);
    let mut hasher = StreamingHasher::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    // Keep draining after a local write error so the stream stays in sync
    let mut write_error = None;

    let received = loop {
        let read = MessageFramer::read_data(&mut wire.reader, &mut buffer);
        match timeout(wire.idle_timeout, read).await {
            Err(_) => break Err("data stream timed out".to_string()),
            Ok(Err(e)) => break Err(e.to_string()),
            Ok(Ok(0)) => break Ok(()),
            Ok(Ok(n)) => {
                hasher.update(&buffer[..n]);
                if write_error.is_none() {
                    if let Err(e) = writer.write_all(&buffer[..n]).await {
                        write_error = Some(e);
                    }
                }
            }
        }
    };
    if received.is_err() {
        wire.broken = true;
    }
    let flushed = match write_error {
        Some(e) => Err(e),
        None => writer.flush().await,
    };
    drop(writer);

    let event = |kind: AuditKind, outcome: Outcome| {
        AuditEvent::new(kind, session.remote, outcome)
            .identity(session.identity.as_deref())
            .verb(verb.name())
            .target(target.display())
    };

    let failure = match (received, flushed) {
        (Err(e), _) => Some((codes::TRANSFER_ABORTED, format!("Transfer aborted: {}", e))),
        (Ok(()), Err(e)) => Some((codes::LOCAL_ERROR, format!("Write failed: {}", e))),
        (Ok(()), Ok(())) => None,
    };

    if let Some((code, message)) = failure {
        warn!("⚠️  Incomplete file {:?}: {}", target, message);
        if !append {
            if let Err(e) = fs::remove_file(target).await {
                warn!("Could not remove incomplete file {:?}: {}", target, e);
            }
        }
        audit.record(event(
            AuditKind::IncompleteFileReceived,
            Outcome::Failure(message.clone()),
        ));
        return Reply::new(code, message);
    }

    let bytes = hasher.bytes_processed();
    let digest = hasher.finalize();
    info!("✅ File received: {:?} ({} bytes, sha256 {})", target, bytes, digest);
    audit.record(event(AuditKind::FileReceived, Outcome::Success));

    Reply::new(
        codes::TRANSFER_COMPLETE,
        format!("Transfer complete: {} bytes.", bytes),
    )
}

async fn list(target: &Path) -> Response {
    let metadata = match fs::metadata(target).await {
        Ok(metadata) => metadata,
        Err(e) => return fs_error(e).into(),
    };

    if !metadata.is_dir() {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        return Response::Listing {
            entries: vec![file_info(name, &metadata)],
        };
    }

    let mut dir = match fs::read_dir(target).await {
        Ok(dir) => dir,
        Err(e) => return fs_error(e).into(),
    };

    let mut entries = Vec::new();
    loop {
        let entry = match dir.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!("Listing of {:?} cut short: {}", target, e);
                break;
            }
        };
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("Skipping {:?} in listing: {}", entry.path(), e);
                continue;
            }
        };
        entries.push(file_info(
            entry.file_name().to_string_lossy().into_owned(),
            &metadata,
        ));
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    Response::Listing { entries }
}

fn file_info(name: String, metadata: &std::fs::Metadata) -> FileInfo {
    let modified = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs());

    FileInfo {
        name,
        kind: if metadata.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        },
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        modified,
    }
}
