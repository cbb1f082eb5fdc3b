//! Gated File Transfer CLI - Main Entry Point
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              gft CLI                                     │
//! │  ┌──────┐ ┌────────┐ ┌────────┐ ┌────────────┐ ┌──────────┐ ┌─────────┐ │
//! │  │ cert │ │ server │ │ upload │ │ upload-dir │ │ download │ │  list   │ │
//! │  └──────┘ └────────┘ └────────┘ └────────────┘ └──────────┘ └─────────┘ │
//! │                                    │                                     │
//! │  ┌─────────────────────────────────────────────────────────────────────┐│
//! │  │  Client: transfer engine ─► cipher ─► progress     (task per job)   ││
//! │  │  Server: limits ─► gate ─► local file system       (task per conn)  ││
//! │  └─────────────────────────────────────────────────────────────────────┘│
//! │                                    │                                     │
//! │  ┌─────────────────────────────────────────────────────────────────────┐│
//! │  │  Protocol framing over TCP, optionally inside TLS (rustls)          ││
//! │  └─────────────────────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar};
use tokio::task::JoinHandle;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use gated_file_transfer::audit::TracingAuditSink;
use gated_file_transfer::client::{spawn_transfer, Client, ClientConfig, JobOutcome, TransferJob};
use gated_file_transfer::config::{ClientSettings, ServerSettings};
use gated_file_transfer::progress::{format_size, format_timestamp, BarProgress};
use gated_file_transfer::remote::RemoteFs;
use gated_file_transfer::server::Server;
use gated_file_transfer::tls::{generate_self_signed_cert, save_cert_and_key};
use gated_file_transfer::walker::{join_remote, remote_basename};

/// Gated File Transfer CLI
///
/// Uploads files and directory trees to a write-mostly server that only
/// accepts changes inside its allowed root from whitelisted addresses.
#[derive(Parser)]
#[command(name = "gft")]
#[command(author = "Maksim Vialykh")]
#[command(version = "0.1.0")]
#[command(about = "Gated file transfer client and server", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Certificate management commands
    Cert {
        #[command(subcommand)]
        action: CertCommands,
    },

    /// Start the server
    Server {
        /// Server settings file (TOML)
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Upload files, each over its own connection
    Upload {
        #[command(flatten)]
        conn: ConnectionArgs,

        /// Remote directory to upload into
        #[arg(short, long, default_value = "/")]
        remote_dir: String,

        /// Local files to upload
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Mirror a local directory tree to the server
    UploadDir {
        #[command(flatten)]
        conn: ConnectionArgs,

        /// Local directory
        local: PathBuf,

        /// Remote directory (defaults to /<local directory name>)
        remote: Option<String>,
    },

    /// Download files, each over its own connection
    Download {
        #[command(flatten)]
        conn: ConnectionArgs,

        /// Local directory to save into
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// Remote file names
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Mirror a remote directory tree locally
    DownloadDir {
        #[command(flatten)]
        conn: ConnectionArgs,

        /// Remote directory
        remote: String,

        /// Local directory (defaults to the remote directory's name)
        local: Option<PathBuf>,
    },

    /// List a remote directory
    List {
        #[command(flatten)]
        conn: ConnectionArgs,

        /// Directory path to list
        path: Option<String>,
    },
}

#[derive(Subcommand)]
enum CertCommands {
    /// Generate a self-signed certificate for testing
    Generate {
        /// Output directory for certificate and key
        #[arg(short, long, default_value = "./certs")]
        output: PathBuf,

        /// Common name for the certificate
        #[arg(long, default_value = "localhost")]
        cn: String,

        /// Additional DNS names (comma-separated)
        #[arg(long)]
        dns: Option<String>,

        /// Additional IP addresses (comma-separated)
        #[arg(long)]
        ip: Option<String>,
    },
}

/// Connection options; each one overrides the settings file
#[derive(Args)]
struct ConnectionArgs {
    /// Client settings file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server host
    #[arg(long)]
    host: Option<String>,

    /// Server port
    #[arg(short, long)]
    port: Option<u16>,

    /// User name
    #[arg(short, long)]
    user: Option<String>,

    /// Password
    #[arg(long)]
    password: Option<String>,

    /// Connect over TLS
    #[arg(long)]
    tls: bool,

    /// Path to CA certificate for server verification (implies --tls)
    #[arg(long)]
    ca: Option<PathBuf>,

    /// Server hostname for TLS verification
    #[arg(long)]
    hostname: Option<String>,

    /// Skip certificate verification (INSECURE!)
    #[arg(long)]
    insecure: bool,

    /// Transform file contents with this key (XOR, not real encryption)
    #[arg(long)]
    encrypt_key: Option<String>,
}

impl ConnectionArgs {
    fn settings(&self) -> Result<ClientSettings> {
        let mut settings = match &self.config {
            Some(path) => ClientSettings::load(path)?,
            None => ClientSettings::default(),
        };

        if let Some(host) = &self.host {
            settings.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(user) = &self.user {
            settings.user = user.clone();
        }
        if let Some(password) = &self.password {
            settings.password = password.clone();
        }

        if self.tls || self.insecure || self.ca.is_some() {
            settings.tls.enabled = true;
        }
        if let Some(ca) = &self.ca {
            settings.tls.ca = Some(ca.clone());
        }
        if let Some(hostname) = &self.hostname {
            settings.tls.hostname = Some(hostname.clone());
        }
        if self.insecure {
            settings.tls.insecure = true;
        }

        if let Some(key) = &self.encrypt_key {
            settings.encryption.enabled = true;
            settings.encryption.key = key.clone();
        }

        settings.validate()?;
        Ok(settings)
    }

    fn client(&self) -> Result<(Client, ClientSettings)> {
        let settings = self.settings()?;
        let client = Client::new(ClientConfig::from_settings(&settings)?);
        Ok((client, settings))
    }
}

fn init_logging(level: Level) -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = cli.verbose;

    // Server settings pick the log level, so they are read first
    if let Commands::Server { config } = &cli.command {
        let settings = ServerSettings::load(config)
            .with_context(|| format!("Failed to load server settings from {:?}", config))?;
        init_logging(if verbose {
            Level::DEBUG
        } else {
            settings.log_level()?
        })?;
        return run_server(settings).await;
    }

    init_logging(if verbose { Level::DEBUG } else { Level::INFO })?;

    match cli.command {
        Commands::Cert { action } => handle_cert_command(action),
        Commands::Server { .. } => unreachable!("server command returns above"),
        Commands::Upload {
            conn,
            remote_dir,
            files,
        } => run_upload(conn, &remote_dir, files).await,
        Commands::UploadDir {
            conn,
            local,
            remote,
        } => run_upload_dir(conn, local, remote).await,
        Commands::Download {
            conn,
            output,
            names,
        } => run_download(conn, output, names).await,
        Commands::DownloadDir {
            conn,
            remote,
            local,
        } => run_download_dir(conn, remote, local).await,
        Commands::List { conn, path } => run_list(conn, path.as_deref()).await,
    }
}

fn handle_cert_command(action: CertCommands) -> Result<()> {
    match action {
        CertCommands::Generate {
            output,
            cn,
            dns,
            ip,
        } => {
            info!("🔐 Generating self-signed certificate...");

            let dns_names: Vec<String> = dns
                .as_deref()
                .map(|s| s.split(',').map(|x| x.trim().to_string()).collect())
                .unwrap_or_else(|| vec![cn.clone()]);
            let dns_refs: Vec<&str> = dns_names.iter().map(|s| s.as_str()).collect();

            let ip_addrs: Vec<std::net::IpAddr> = match ip.as_deref() {
                Some(list) => list
                    .split(',')
                    .map(|ip| {
                        ip.trim()
                            .parse()
                            .with_context(|| format!("Invalid IP address: {:?}", ip))
                    })
                    .collect::<Result<_>>()?,
                None => vec![std::net::IpAddr::from([127, 0, 0, 1])],
            };

            let cert = generate_self_signed_cert(&cn, &dns_refs, &ip_addrs)?;

            std::fs::create_dir_all(&output)
                .with_context(|| format!("Failed to create {:?}", output))?;

            let cert_path = output.join("cert.pem");
            let key_path = output.join("key.pem");
            save_cert_and_key(&cert.cert_pem, &cert.key_pem, &cert_path, &key_path)?;

            info!("✅ Certificate generated successfully!");
            info!("   Certificate: {:?}", cert_path);
            info!("   Private key: {:?}", key_path);
            info!("");
            info!("📝 Usage (settings files):");
            info!("   Server: [tls] enabled = true, cert = {:?}, key = {:?}", cert_path, key_path);
            info!("   Client: gft upload --ca {:?} <files>", cert_path);

            Ok(())
        }
    }
}

async fn run_server(settings: ServerSettings) -> Result<()> {
    info!("🚀 Starting gated file transfer server...");

    if settings.encryption.enabled {
        info!("🔏 Clients transform file contents; files are stored exactly as received");
    }

    let addr = settings.bind_addr();
    let server = Server::from_settings(&settings, Arc::new(TracingAuditSink))?;
    server.run(addr).await
}

type Pending = Vec<(String, Arc<BarProgress>, JoinHandle<Result<JobOutcome>>)>;

fn progress_bar(bars: &MultiProgress, label: &str) -> Arc<BarProgress> {
    Arc::new(BarProgress::from_bar(
        bars.add(ProgressBar::new_spinner()),
        label.to_string(),
    ))
}

/// Wait for every job; fail if any of them did
async fn finish_all(pending: Pending) -> Result<()> {
    let total = pending.len();
    let mut failures = 0;

    for (label, bar, handle) in pending {
        match handle.await {
            Ok(Ok(outcome)) => {
                bar.finish(format!("✅ {} ({})", label, format_size(outcome.bytes())));
            }
            Ok(Err(e)) => {
                bar.abandon(format!("❌ {}", label));
                error!("{:#}", e);
                failures += 1;
            }
            Err(e) => {
                bar.abandon(format!("❌ {}", label));
                error!("Transfer task for {} failed: {}", label, e);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        bail!("{} of {} transfers failed", failures, total);
    }
    Ok(())
}

async fn run_upload(conn: ConnectionArgs, remote_dir: &str, files: Vec<PathBuf>) -> Result<()> {
    let (client, settings) = conn.client()?;
    let cipher = settings.encryption.cipher();
    let bars = MultiProgress::new();

    let mut pending = Pending::new();
    for local in files {
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("Not a file name: {:?}", local))?;
        let remote = join_remote(remote_dir, &name);

        let bar = progress_bar(&bars, &name);
        let job = TransferJob::Upload { local, remote };
        let handle = spawn_transfer(client.clone(), job, cipher.clone(), bar.clone());
        pending.push((name, bar, handle));
    }

    finish_all(pending).await
}

async fn run_upload_dir(conn: ConnectionArgs, local: PathBuf, remote: Option<String>) -> Result<()> {
    let (client, settings) = conn.client()?;

    let remote = match remote {
        Some(remote) => remote,
        None => {
            let name = local
                .canonicalize()
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .ok_or_else(|| anyhow!("Cannot name a remote directory after {:?}", local))?;
            join_remote("/", &name)
        }
    };

    let bars = MultiProgress::new();
    let label = format!("{} -> {}", local.display(), remote);
    let bar = progress_bar(&bars, &label);
    let job = TransferJob::UploadDirectory { local, remote };
    let handle = spawn_transfer(client, job, settings.encryption.cipher(), bar.clone());

    finish_all(vec![(label, bar, handle)]).await
}

async fn run_download(conn: ConnectionArgs, output: PathBuf, names: Vec<String>) -> Result<()> {
    let (client, settings) = conn.client()?;
    let cipher = settings.encryption.cipher();
    let bars = MultiProgress::new();

    let mut pending = Pending::new();
    for remote in names {
        let bar = progress_bar(&bars, &remote);
        let job = TransferJob::Download {
            remote: remote.clone(),
            local_dir: output.clone(),
        };
        let handle = spawn_transfer(client.clone(), job, cipher.clone(), bar.clone());
        pending.push((remote, bar, handle));
    }

    finish_all(pending).await
}

async fn run_download_dir(conn: ConnectionArgs, remote: String, local: Option<PathBuf>) -> Result<()> {
    let (client, settings) = conn.client()?;

    let local = match local {
        Some(local) => local,
        None => remote_basename(&remote)
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("Cannot name a local directory after {:?}", remote))?,
    };

    let bars = MultiProgress::new();
    let label = format!("{} -> {}", remote, local.display());
    let bar = progress_bar(&bars, &label);
    let job = TransferJob::DownloadDirectory { remote, local };
    let handle = spawn_transfer(client, job, settings.encryption.cipher(), bar.clone());

    finish_all(vec![(label, bar, handle)]).await
}

async fn run_list(conn: ConnectionArgs, path: Option<&str>) -> Result<()> {
    let (client, _) = conn.client()?;
    let mut session = client.connect().await?;

    let path = path.unwrap_or(".");
    let files = session
        .list(path)
        .await
        .with_context(|| format!("Failed to list {}", path))?;
    session.quit().await?;

    if files.is_empty() {
        info!("📁 No files found");
        return Ok(());
    }

    info!("📁 Files in {}:", path);
    println!();
    println!("{:<40} {:>12} {:>18}", "Name", "Size", "Modified");
    println!("{:-<72}", "");

    for file in files {
        let size = if file.is_directory() {
            "<DIR>".to_string()
        } else {
            format_size(file.size)
        };

        let modified = file
            .modified
            .map(format_timestamp)
            .unwrap_or_else(|| "-".to_string());

        let name = if file.is_directory() {
            format!("{}/", file.name)
        } else {
            file.name
        };

        println!("{:<40} {:>12} {:>18}", name, size, modified);
    }

    Ok(())
}
