//! Settings files
//!
//! Both sides read a TOML file once at start-up and work from the parsed,
//! immutable values afterwards. Relative paths in a file are taken relative
//! to the directory holding that file.
//!
//! ```toml
//! bind_host = "0.0.0.0"
//! port = 2121
//! allowed_root = "/srv/drop"
//! ip_whitelist = ["127.0.0.1", "10.0.0.0/8"]
//! ip_blacklist = ["10.6.6.6"]
//!
//! [[users]]
//! username = "uploader"
//! password = "secret"
//! permissions = "elamw"
//!
//! [tls]
//! enabled = true
//! cert = "certs/cert.pem"
//! key = "certs/key.pem"
//!
//! [encryption]
//! enabled = true
//! key = "shared secret"
//! ```

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::Level;

use crate::cipher::CipherContext;
use crate::policy::{AccessPolicy, AddressList, Permissions, PolicyError};

pub const DEFAULT_PORT: u16 = 2121;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read settings file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid settings file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid settings: {0}")]
    Invalid(String),

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_permissions() -> String {
    "elradfmw".to_string()
}

fn default_max_connections() -> usize {
    256
}

fn default_max_connections_per_ip() -> usize {
    5
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserSettings {
    pub username: String,
    pub password: String,
    /// Letters from `"elradfmw"`
    #[serde(default = "default_permissions")]
    pub permissions: String,
    /// Directory the user lands in; defaults to `allowed_root`
    #[serde(default)]
    pub home: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerTlsSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert: Option<PathBuf>,
    #[serde(default)]
    pub key: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EncryptionSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub key: String,
}

impl EncryptionSettings {
    pub fn cipher(&self) -> CipherContext {
        CipherContext::from_settings(self.enabled, &self.key)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.key.is_empty() {
            return Err(ConfigError::Invalid(
                "encryption is enabled but no key is set".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub bind_host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub users: Vec<UserSettings>,
    /// Mutating commands may only touch this directory and below
    pub allowed_root: PathBuf,
    #[serde(default)]
    pub ip_whitelist: Vec<String>,
    #[serde(default)]
    pub ip_blacklist: Vec<String>,
    #[serde(default)]
    pub tls: ServerTlsSettings,
    /// 0 = unlimited
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// 0 = unlimited
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub encryption: EncryptionSettings,
}

impl ServerSettings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut settings: ServerSettings =
            toml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        settings.rebase_paths(base_dir(path));
        settings.validate()?;
        Ok(settings)
    }

    fn rebase_paths(&mut self, base: &Path) {
        self.allowed_root = join_base(base, &self.allowed_root);
        for user in &mut self.users {
            if let Some(home) = &mut user.home {
                *home = join_base(base, home);
            }
        }
        if let Some(cert) = &mut self.tls.cert {
            *cert = join_base(base, cert);
        }
        if let Some(key) = &mut self.tls.key {
            *key = join_base(base, key);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.users.is_empty() {
            return Err(ConfigError::Invalid("at least one [[users]] entry is required".into()));
        }
        for user in &self.users {
            if user.username.is_empty() {
                return Err(ConfigError::Invalid("user with empty username".into()));
            }
            Permissions::parse(&user.permissions)?;
        }
        if self.tls.enabled && (self.tls.cert.is_none() || self.tls.key.is_none()) {
            return Err(ConfigError::Invalid(
                "tls is enabled but cert or key is missing".into(),
            ));
        }
        self.log_level()?;
        self.encryption.validate()?;
        AddressList::parse(&self.ip_whitelist)?;
        AddressList::parse(&self.ip_blacklist)?;
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn log_level(&self) -> Result<Level, ConfigError> {
        self.log_level
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("unknown log level {:?}", self.log_level)))
    }

    /// Build the shared policy. The allowed root must exist.
    pub fn access_policy(&self) -> Result<AccessPolicy, ConfigError> {
        Ok(AccessPolicy::new(
            &self.allowed_root,
            AddressList::parse(&self.ip_whitelist)?,
            AddressList::parse(&self.ip_blacklist)?,
        )?)
    }

    pub fn accounts(&self) -> Result<Accounts, ConfigError> {
        let mut accounts = HashMap::new();
        for user in &self.users {
            let account = Account {
                username: user.username.clone(),
                password: user.password.clone(),
                permissions: Permissions::parse(&user.permissions)?,
                home: user.home.clone().unwrap_or_else(|| self.allowed_root.clone()),
            };
            if accounts.insert(user.username.clone(), account).is_some() {
                return Err(ConfigError::Invalid(format!(
                    "duplicate user {:?}",
                    user.username
                )));
            }
        }
        Ok(Accounts { accounts })
    }
}

/// A user the server will accept
#[derive(Debug, Clone)]
pub struct Account {
    pub username: String,
    password: String,
    pub permissions: Permissions,
    pub home: PathBuf,
}

impl Account {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        permissions: Permissions,
        home: impl Into<PathBuf>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            permissions,
            home: home.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Accounts {
    accounts: HashMap<String, Account>,
}

impl Accounts {
    pub fn new(list: impl IntoIterator<Item = Account>) -> Self {
        Self {
            accounts: list
                .into_iter()
                .map(|account| (account.username.clone(), account))
                .collect(),
        }
    }

    /// The account for `username` if `password` matches
    pub fn authenticate(&self, username: &str, password: &str) -> Option<&Account> {
        self.accounts
            .get(username)
            .filter(|account| account.password == password)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientTlsSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Name to verify the server certificate against; defaults to `host`
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub ca: Option<PathBuf>,
    #[serde(default)]
    pub insecure: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub tls: ClientTlsSettings,
    #[serde(default)]
    pub encryption: EncryptionSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: String::new(),
            password: String::new(),
            tls: ClientTlsSettings::default(),
            encryption: EncryptionSettings::default(),
        }
    }
}

impl ClientSettings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut settings: ClientSettings =
            toml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if let Some(ca) = &mut settings.tls.ca {
            *ca = join_base(base_dir(path), ca);
        }
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user.is_empty() {
            return Err(ConfigError::Invalid("no user given".into()));
        }
        self.encryption.validate()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tls_hostname(&self) -> &str {
        self.tls.hostname.as_deref().unwrap_or(&self.host)
    }
}

fn base_dir(path: &Path) -> &Path {
    path.parent().unwrap_or_else(|| Path::new("."))
}

fn join_base(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
