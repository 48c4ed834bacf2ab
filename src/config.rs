use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

pub const DEFAULT_REDIS_PORT: u16 = 6379;
pub const DEFAULT_MAX_POOL_SIZE: usize = 20;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("connection string has no endpoint")]
    MissingEndpoint,
    #[error("invalid endpoint {0:?}: expected host:port")]
    InvalidEndpoint(String),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
    #[error("max_pool_size must be at least 1")]
    PoolSizeOutOfRange,
    #[error("username requires a password")]
    MissingPassword,
    #[error("options are frozen after first use")]
    Frozen,
    #[error("no configuration registered under name {0:?}")]
    UnknownName(String),
}

/// Protocol version selection. `Unknown` lets the handshake negotiate RESP3
/// and fall back; a pinned version skips negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RespVersion {
    #[default]
    Unknown,
    Two,
    Three,
}

/// Where to connect. Name endpoints are resolved through DNS on every
/// connect; IP endpoints connect directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    Name(String),
    Ip(IpAddr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: Host,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: &str, port: u16) -> Self {
        let host = match host.parse::<IpAddr>() {
            Ok(ip) => Host::Ip(ip),
            Err(_) => Host::Name(host.to_string()),
        };
        Self { host, port }
    }

    pub fn host_str(&self) -> String {
        match &self.host {
            Host::Name(name) => name.clone(),
            Host::Ip(ip) => ip.to_string(),
        }
    }

    /// Parse `host:port` (port required). IPv6 addresses use the bracketed
    /// `[addr]:port` form.
    pub fn parse(item: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidEndpoint(item.to_string());
        let (host, port) = item.rsplit_once(':').ok_or_else(invalid)?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Name(name) => write!(f, "{name}:{}", self.port),
            Host::Ip(IpAddr::V6(ip)) => write!(f, "[{ip}]:{}", self.port),
            Host::Ip(ip) => write!(f, "{ip}:{}", self.port),
        }
    }
}

/// The validated options record consumed by the pool and its connections.
///
/// Mutable while being assembled; the pool freezes its copy on first use and
/// every setter refuses edits from then on.
#[derive(Debug)]
pub struct RedisOptions {
    endpoints: Vec<Endpoint>,
    username: Option<String>,
    password: Option<String>,
    client_name: Option<String>,
    no_delay: bool,
    allocate_receive_buffer_on_demand: bool,
    max_pool_size: usize,
    resp_version: RespVersion,
    /// `Key=value` items we do not interpret, preserved in order.
    unknown_items: Vec<(String, String)>,
    frozen: AtomicBool,
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            username: None,
            password: None,
            client_name: None,
            no_delay: true,
            allocate_receive_buffer_on_demand: true,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            resp_version: RespVersion::Unknown,
            unknown_items: Vec::new(),
            frozen: AtomicBool::new(false),
        }
    }
}

impl Clone for RedisOptions {
    fn clone(&self) -> Self {
        Self {
            endpoints: self.endpoints.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            client_name: self.client_name.clone(),
            no_delay: self.no_delay,
            allocate_receive_buffer_on_demand: self.allocate_receive_buffer_on_demand,
            max_pool_size: self.max_pool_size,
            resp_version: self.resp_version,
            unknown_items: self.unknown_items.clone(),
            frozen: AtomicBool::new(self.frozen.load(Ordering::Relaxed)),
        }
    }
}

impl RedisOptions {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoints: vec![endpoint],
            ..Self::default()
        }
    }

    /// Parse the comma-separated connection-string form: each item is either
    /// `host:port` or a case-insensitive `Key=value`. Extra endpoints and
    /// unknown keys are preserved but do not alter behavior.
    pub fn from_connection_string(input: &str) -> Result<Self, ConfigError> {
        let mut options = Self::default();
        for item in input.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            if let Some((key, value)) = item.split_once('=') {
                let key = key.trim();
                let value = value.trim();
                if key.eq_ignore_ascii_case("maxpoolsize") {
                    let size = value.parse::<usize>().map_err(|_| ConfigError::InvalidValue {
                        key: key.to_string(),
                        value: value.to_string(),
                    })?;
                    options.max_pool_size = size;
                } else {
                    options
                        .unknown_items
                        .push((key.to_string(), value.to_string()));
                }
            } else {
                options.endpoints.push(Endpoint::parse(item)?);
            }
        }
        if options.endpoints.is_empty() {
            return Err(ConfigError::MissingEndpoint);
        }
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::MissingEndpoint);
        }
        if self.max_pool_size == 0 {
            return Err(ConfigError::PoolSizeOutOfRange);
        }
        if self.username.is_some() && self.password.is_none() {
            return Err(ConfigError::MissingPassword);
        }
        Ok(())
    }

    /// The endpoint connections are made to. Extra endpoints are retained
    /// but not used.
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoints.first()
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }

    pub fn no_delay(&self) -> bool {
        self.no_delay
    }

    pub fn allocate_receive_buffer_on_demand(&self) -> bool {
        self.allocate_receive_buffer_on_demand
    }

    pub fn max_pool_size(&self) -> usize {
        self.max_pool_size
    }

    pub fn resp_version(&self) -> RespVersion {
        self.resp_version
    }

    pub fn unknown_items(&self) -> &[(String, String)] {
        &self.unknown_items
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Flip the immutable flag. Called by the pool when the record is first
    /// used; there is no way back.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    fn editable(&self) -> Result<(), ConfigError> {
        if self.is_frozen() {
            Err(ConfigError::Frozen)
        } else {
            Ok(())
        }
    }

    pub fn set_credentials(
        &mut self,
        username: Option<String>,
        password: String,
    ) -> Result<(), ConfigError> {
        self.editable()?;
        self.username = username;
        self.password = Some(password);
        Ok(())
    }

    pub fn set_client_name(&mut self, name: String) -> Result<(), ConfigError> {
        self.editable()?;
        self.client_name = Some(name);
        Ok(())
    }

    pub fn set_no_delay(&mut self, value: bool) -> Result<(), ConfigError> {
        self.editable()?;
        self.no_delay = value;
        Ok(())
    }

    pub fn set_allocate_receive_buffer_on_demand(&mut self, value: bool) -> Result<(), ConfigError> {
        self.editable()?;
        self.allocate_receive_buffer_on_demand = value;
        Ok(())
    }

    pub fn set_max_pool_size(&mut self, size: usize) -> Result<(), ConfigError> {
        self.editable()?;
        if size == 0 {
            return Err(ConfigError::PoolSizeOutOfRange);
        }
        self.max_pool_size = size;
        Ok(())
    }

    pub fn set_resp_version(&mut self, version: RespVersion) -> Result<(), ConfigError> {
        self.editable()?;
        self.resp_version = version;
        Ok(())
    }
}
