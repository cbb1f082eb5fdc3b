//! File transfer client
//!
//! A [`Client`] knows where the server is and how to reach it; each call to
//! [`Client::connect`] opens an independent, logged-in [`ClientSession`].
//! Sessions implement [`RemoteFs`], so the transfer engine drives them the
//! same way it drives any other remote.
//!
//! ```text
//! Client                                    Server
//!   |-------- TCP connect ------------------>|
//!   |======== TLS handshake (optional) ======|
//!   |<------------------------- 220 Ready ---|
//!   |-------- Login ------------------------>|
//!   |<------------------------ 230 / 530 ----|
//!   |          ... verbs ...                 |
//!   |-------- Quit ------------------------->|
//!   |<-------------------------- 221 Bye ----|
//! ```
//!
//! Concurrent transfers each get their own session via [`spawn_transfer`];
//! nothing is shared between them except the client's settings.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cipher::CipherContext;
use crate::config::ClientSettings;
use crate::progress::ProgressSink;
use crate::protocol::{codes, FileInfo, MessageFramer, ProtocolError, Reply, Request, Response, CHUNK_SIZE};
use crate::remote::{ByteSink, ByteSource, RemoteError, RemoteFs};
use crate::tls::{BoxedStream, ClientTlsConfig, ClientTransport};
use crate::transfer::{
    download_directory, download_file, upload_directory, upload_file, MirrorReport,
    TransferError, TransferReport,
};

/// Client configuration
pub struct ClientConfig {
    /// `host:port` of the server
    pub server_addr: String,
    pub transport: ClientTransport,
    pub username: String,
    pub password: String,
}

impl ClientConfig {
    pub fn from_settings(settings: &ClientSettings) -> Result<Self> {
        let transport = match ClientTlsConfig::from_settings(settings)? {
            Some(config) => ClientTransport::tls(config),
            None => ClientTransport::plain(),
        };

        Ok(Self {
            server_addr: settings.server_addr(),
            transport,
            username: settings.user.clone(),
            password: settings.password.clone(),
        })
    }
}

/// Cheap to clone; clones share the configuration
#[derive(Clone)]
pub struct Client {
    config: Arc<ClientConfig>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Open a new connection and log in
    pub async fn connect(&self) -> Result<ClientSession> {
        let config = &self.config;
        info!("🔗 Connecting to {}...", config.server_addr);

        let tcp_stream = TcpStream::connect(&config.server_addr)
            .await
            .with_context(|| format!("Failed to connect to {}", config.server_addr))?;
        debug!("TCP connection established");

        let stream = config
            .transport
            .connect(tcp_stream)
            .await
            .context("TLS handshake failed")?;
        if config.transport.is_tls() {
            info!("🔐 TLS connection established");
        }

        let mut session = ClientSession::handshake(stream)
            .await
            .context("Server refused the connection")?;
        session
            .login(&config.username, &config.password)
            .await
            .with_context(|| format!("Login as {:?} failed", config.username))?;

        info!("🔑 Logged in as {}", config.username);
        Ok(session)
    }
}

fn expect(reply: Reply, code: u16) -> Result<Reply, RemoteError> {
    if reply.code == code {
        Ok(reply)
    } else {
        Err(RemoteError::Rejected(reply))
    }
}

fn unexpected(response: Response) -> RemoteError {
    match response {
        Response::Reply(reply) => RemoteError::Rejected(reply),
        other => ProtocolError::UnexpectedResponse(format!("{:?}", other)).into(),
    }
}

/// Path between the first pair of double quotes, as in `257 "/dir" ...`
fn quoted_path(message: &str) -> Option<&str> {
    let start = message.find('"')? + 1;
    let len = message[start..].find('"')?;
    Some(&message[start..start + len])
}

/// One logged-in connection
pub struct ClientSession {
    reader: BufReader<ReadHalf<BoxedStream>>,
    writer: BufWriter<WriteHalf<BoxedStream>>,
    /// Set when a data stream broke off mid-transfer; the framing can no
    /// longer be trusted
    broken: bool,
}

impl ClientSession {
    /// Take over an established stream and read the server greeting
    pub async fn handshake(stream: BoxedStream) -> Result<Self, RemoteError> {
        let (reader, writer) = tokio::io::split(stream);
        let mut session = Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            broken: false,
        };

        let greeting = expect(session.read_reply().await?, codes::SERVICE_READY)?;
        debug!("Server greeting: {}", greeting);
        Ok(session)
    }

    pub async fn login(&mut self, username: &str, password: &str) -> Result<(), RemoteError> {
        let request = Request::Login {
            username: username.to_string(),
            password: password.to_string(),
        };
        self.command(&request, codes::LOGGED_IN).await.map(drop)
    }

    pub async fn current_directory(&mut self) -> Result<String, RemoteError> {
        let reply = self
            .command(&Request::PrintDirectory, codes::PATH_CREATED)
            .await?;
        quoted_path(&reply.message)
            .map(str::to_string)
            .ok_or_else(|| ProtocolError::UnexpectedResponse(reply.to_string()).into())
    }

    pub async fn change_directory(&mut self, path: &str) -> Result<(), RemoteError> {
        let request = Request::ChangeDirectory {
            path: path.to_string(),
        };
        self.command(&request, codes::ACTION_OK).await.map(drop)
    }

    /// Say goodbye and close the connection
    pub async fn quit(mut self) -> Result<(), RemoteError> {
        if self.broken {
            debug!("Skipping QUIT on a broken session");
            return Ok(());
        }
        self.command(&Request::Quit, codes::GOODBYE).await?;
        self.writer.shutdown().await?;
        Ok(())
    }

    async fn send(&mut self, request: &Request) -> Result<(), ProtocolError> {
        MessageFramer::write_message(&mut self.writer, request).await
    }

    async fn receive(&mut self) -> Result<Response, ProtocolError> {
        MessageFramer::read_message(&mut self.reader).await
    }

    async fn read_reply(&mut self) -> Result<Reply, RemoteError> {
        match self.receive().await? {
            Response::Reply(reply) => Ok(reply),
            other => Err(ProtocolError::UnexpectedResponse(format!("{:?}", other)).into()),
        }
    }

    async fn command(&mut self, request: &Request, code: u16) -> Result<Reply, RemoteError> {
        self.send(request).await?;
        expect(self.read_reply().await?, code)
    }

    async fn send_stream(
        &mut self,
        request: Request,
        source: &mut dyn ByteSource,
    ) -> Result<u64, RemoteError> {
        self.command(&request, codes::DATA_READY).await?;

        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut sent = 0u64;
        loop {
            let n = match source.read_chunk(&mut buffer).await {
                Ok(n) => n,
                Err(e) => {
                    self.broken = true;
                    return Err(e.into());
                }
            };
            if n == 0 {
                break;
            }
            if let Err(e) = MessageFramer::write_data(&mut self.writer, &buffer[..n]).await {
                self.broken = true;
                return Err(e.into());
            }
            sent += n as u64;
        }
        MessageFramer::write_end_marker(&mut self.writer).await?;

        expect(self.read_reply().await?, codes::TRANSFER_COMPLETE)?;
        Ok(sent)
    }
}

#[async_trait]
impl RemoteFs for ClientSession {
    async fn store(&mut self, path: &str, source: &mut dyn ByteSource) -> Result<u64, RemoteError> {
        let request = Request::Store {
            path: path.to_string(),
        };
        self.send_stream(request, source).await
    }

    async fn append(
        &mut self,
        path: &str,
        source: &mut dyn ByteSource,
    ) -> Result<u64, RemoteError> {
        let request = Request::Append {
            path: path.to_string(),
        };
        self.send_stream(request, source).await
    }

    async fn retrieve(&mut self, path: &str, sink: &mut dyn ByteSink) -> Result<u64, RemoteError> {
        let request = Request::Retrieve {
            path: path.to_string(),
        };
        self.command(&request, codes::DATA_READY).await?;

        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut received = 0u64;
        loop {
            let n = match MessageFramer::read_data(&mut self.reader, &mut buffer).await {
                Ok(n) => n,
                Err(e) => {
                    self.broken = true;
                    return Err(e.into());
                }
            };
            if n == 0 {
                break;
            }
            if let Err(e) = sink.write_chunk(&buffer[..n]).await {
                self.broken = true;
                return Err(e.into());
            }
            received += n as u64;
        }

        expect(self.read_reply().await?, codes::TRANSFER_COMPLETE)?;
        Ok(received)
    }

    async fn list(&mut self, path: &str) -> Result<Vec<FileInfo>, RemoteError> {
        let request = Request::List {
            path: Some(path.to_string()),
        };
        self.send(&request).await?;
        match self.receive().await? {
            Response::Listing { entries } => Ok(entries),
            other => Err(unexpected(other)),
        }
    }

    async fn size(&mut self, path: &str) -> Result<u64, RemoteError> {
        let request = Request::Size {
            path: path.to_string(),
        };
        self.send(&request).await?;
        match self.receive().await? {
            Response::Size { bytes } => Ok(bytes),
            other => Err(unexpected(other)),
        }
    }

    async fn make_directory(&mut self, path: &str) -> Result<(), RemoteError> {
        let request = Request::MakeDirectory {
            path: path.to_string(),
        };
        self.command(&request, codes::PATH_CREATED).await.map(drop)
    }

    async fn remove_directory(&mut self, path: &str) -> Result<(), RemoteError> {
        let request = Request::RemoveDirectory {
            path: path.to_string(),
        };
        self.command(&request, codes::ACTION_OK).await.map(drop)
    }

    async fn delete(&mut self, path: &str) -> Result<(), RemoteError> {
        let request = Request::Delete {
            path: path.to_string(),
        };
        self.command(&request, codes::ACTION_OK).await.map(drop)
    }

    async fn rename(&mut self, from: &str, to: &str) -> Result<(), RemoteError> {
        let rnfr = Request::RenameFrom {
            path: from.to_string(),
        };
        self.command(&rnfr, codes::PENDING).await?;

        let rnto = Request::RenameTo {
            path: to.to_string(),
        };
        self.command(&rnto, codes::ACTION_OK).await.map(drop)
    }
}

/// A unit of work for one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferJob {
    Upload { local: PathBuf, remote: String },
    Download { remote: String, local_dir: PathBuf },
    UploadDirectory { local: PathBuf, remote: String },
    DownloadDirectory { remote: String, local: PathBuf },
}

impl fmt::Display for TransferJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferJob::Upload { local, remote } => {
                write!(f, "upload {} -> {}", local.display(), remote)
            }
            TransferJob::Download { remote, local_dir } => {
                write!(f, "download {} -> {}", remote, local_dir.display())
            }
            TransferJob::UploadDirectory { local, remote } => {
                write!(f, "upload directory {} -> {}", local.display(), remote)
            }
            TransferJob::DownloadDirectory { remote, local } => {
                write!(f, "download directory {} -> {}", remote, local.display())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    File(TransferReport),
    Mirror(MirrorReport),
}

impl JobOutcome {
    pub fn bytes(&self) -> u64 {
        match self {
            JobOutcome::File(report) => report.bytes,
            JobOutcome::Mirror(report) => report.bytes,
        }
    }
}

/// Run `job` over an existing connection
pub async fn run_job<C>(
    conn: &mut C,
    job: &TransferJob,
    cipher: &CipherContext,
    progress: &dyn ProgressSink,
) -> Result<JobOutcome, TransferError>
where
    C: RemoteFs + ?Sized,
{
    let outcome = match job {
        TransferJob::Upload { local, remote } => {
            JobOutcome::File(upload_file(conn, local, remote, cipher, progress).await?)
        }
        TransferJob::Download { remote, local_dir } => {
            JobOutcome::File(download_file(conn, remote, local_dir, cipher, progress).await?)
        }
        TransferJob::UploadDirectory { local, remote } => {
            JobOutcome::Mirror(upload_directory(conn, local, remote, cipher, progress).await?)
        }
        TransferJob::DownloadDirectory { remote, local } => {
            JobOutcome::Mirror(download_directory(conn, remote, local, cipher, progress).await?)
        }
    };
    Ok(outcome)
}

/// Run `job` on its own task over its own connection.
///
/// Jobs never share a session, so any number may run at once; a failure in
/// one leaves the others alone.
pub fn spawn_transfer(
    client: Client,
    job: TransferJob,
    cipher: CipherContext,
    progress: Arc<dyn ProgressSink>,
) -> JoinHandle<Result<JobOutcome>> {
    tokio::spawn(async move {
        let mut session = client.connect().await?;
        let outcome = run_job(&mut session, &job, &cipher, progress.as_ref()).await;

        if let Err(e) = session.quit().await {
            warn!("Closing session after {} failed: {}", job, e);
        }

        outcome.with_context(|| format!("{} failed", job))
    })
}
