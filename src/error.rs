//! Error types for tn3270r
//!
//! Parse errors, protocol violations and transport failures each have their
//! own enum, wrapped by [`TN3270Error`]. Operator errors (typing into a
//! protected field and the like) are not Rust errors; they live in the
//! keyboard lock state.

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Top-level error type for tn3270r operations
#[derive(Debug)]
pub enum TN3270Error {
    /// Transport errors
    Network(NetworkError),
    /// Telnet / TN3270E negotiation errors
    Telnet(TelnetError),
    /// Host name, hosts file and recent file errors
    Host(HostError),
    /// Configuration errors
    Config(ConfigError),
}

/// Transport related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Connection refused by remote host
    ConnectionRefused { host: String, port: u16 },
    /// Connection timeout
    Timeout { host: String, port: u16, timeout_seconds: u64 },
    /// DNS resolution failure
    DnsResolution { host: String },
    /// Connection lost during operation
    ConnectionLost { reason: String },
    /// Invalid network address
    InvalidAddress { address: String },
    /// TLS setup, handshake or verification failure
    TlsError { message: String },
}

/// Session-fatal negotiation outcomes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelnetError {
    /// Every LU in the list was rejected during TN3270E negotiation
    LuRejected { reason: String },
    /// Terminal-type negotiation ran out of LUs to try
    LuListExhausted,
    /// The association target was rejected
    AssociateRejected { reason: String },
    /// The host refused our device type
    DeviceTypeRejected { reason: String },
    /// STARTTLS reply was malformed
    TlsNegotiationFailure,
    /// An association was requested but the host does not do TN3270E.
    /// Unlike the other variants this ends the process, not just the
    /// connection.
    AssociationUnsupported,
}

impl TelnetError {
    /// Whether the controller should exit rather than disconnect
    pub fn is_fatal(&self) -> bool {
        matches!(self, TelnetError::AssociationUnsupported)
    }
}

/// Host name grammar and host file errors
#[derive(Debug)]
pub enum HostError {
    /// Malformed host name
    Syntax(String),
    /// Nothing left after trimming
    EmptyHostname,
    /// Already connected or connecting
    AlreadyConnected,
    /// Reading the hosts file failed
    HostsFileIo(io::Error),
    /// Reading or writing the recent connections file failed
    RecentFileIo(io::Error),
}

/// Configuration errors
#[derive(Debug)]
pub enum ConfigError {
    /// Invalid configuration parameter
    InvalidParameter { parameter: String, value: String, reason: String },
    /// Configuration file error
    FileError { path: String, error: String },
    /// JSON serialization or parse failure
    Json(String),
}

impl fmt::Display for TN3270Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TN3270Error::Network(err) => write!(f, "Network error: {err}"),
            TN3270Error::Telnet(err) => write!(f, "Telnet error: {err}"),
            TN3270Error::Host(err) => write!(f, "{err}"),
            TN3270Error::Config(err) => write!(f, "Configuration error: {err}"),
        }
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::ConnectionRefused { host, port } => write!(f, "Connection refused to {host}:{port}"),
            NetworkError::Timeout { host, port, timeout_seconds } => {
                write!(f, "Connection timeout to {host}:{port} after {timeout_seconds}s")
            }
            NetworkError::DnsResolution { host } => write!(f, "DNS resolution failed for {host}"),
            NetworkError::ConnectionLost { reason } => write!(f, "Connection lost: {reason}"),
            NetworkError::InvalidAddress { address } => write!(f, "Invalid network address: {address}"),
            NetworkError::TlsError { message } => write!(f, "SSL/TLS error: {message}"),
        }
    }
}

impl fmt::Display for TelnetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelnetError::LuRejected { reason } => write!(f, "Cannot connect to specified LU: {reason}"),
            TelnetError::LuListExhausted => write!(f, "Cannot connect to specified LU"),
            TelnetError::AssociateRejected { reason } => {
                write!(f, "Cannot associate with specified LU: {reason}")
            }
            TelnetError::DeviceTypeRejected { reason } => {
                write!(f, "Device type rejected, cannot connect: {reason}")
            }
            TelnetError::TlsNegotiationFailure => write!(f, "TLS negotiation failure"),
            TelnetError::AssociationUnsupported => {
                write!(f, "Host does not support TN3270E, cannot associate with specified LU")
            }
        }
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::Syntax(msg) => write!(f, "Hostname syntax error: {msg}"),
            HostError::EmptyHostname => write!(f, "Invalid (empty) hostname"),
            HostError::AlreadyConnected => write!(f, "Already connected"),
            HostError::HostsFileIo(err) => write!(f, "Hosts file error: {err}"),
            HostError::RecentFileIo(err) => write!(f, "Recent connections file error: {err}"),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidParameter { parameter, value, reason } => {
                write!(f, "Invalid configuration parameter '{parameter}' = '{value}': {reason}")
            }
            ConfigError::FileError { path, error } => write!(f, "Configuration file error '{path}': {error}"),
            ConfigError::Json(msg) => write!(f, "Invalid configuration JSON: {msg}"),
        }
    }
}

impl StdError for TN3270Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            TN3270Error::Network(err) => Some(err),
            TN3270Error::Telnet(err) => Some(err),
            TN3270Error::Host(err) => Some(err),
            TN3270Error::Config(err) => Some(err),
        }
    }
}

impl StdError for NetworkError {}
impl StdError for TelnetError {}
impl StdError for ConfigError {}

impl StdError for HostError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            HostError::HostsFileIo(err) | HostError::RecentFileIo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<NetworkError> for TN3270Error {
    fn from(err: NetworkError) -> Self {
        TN3270Error::Network(err)
    }
}

impl From<TelnetError> for TN3270Error {
    fn from(err: TelnetError) -> Self {
        TN3270Error::Telnet(err)
    }
}

impl From<HostError> for TN3270Error {
    fn from(err: HostError) -> Self {
        TN3270Error::Host(err)
    }
}

impl From<ConfigError> for TN3270Error {
    fn from(err: ConfigError) -> Self {
        TN3270Error::Config(err)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Json(err.to_string())
    }
}

// Transport failures arrive as io::Error
impl From<io::Error> for NetworkError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => NetworkError::ConnectionRefused {
                host: "unknown".to_string(),
                port: 0,
            },
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => NetworkError::Timeout {
                host: "unknown".to_string(),
                port: 0,
                timeout_seconds: 30,
            },
            io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset => NetworkError::ConnectionLost {
                reason: err.to_string(),
            },
            _ => NetworkError::ConnectionLost {
                reason: format!("IO Error: {err}"),
            },
        }
    }
}

impl From<io::Error> for TN3270Error {
    fn from(err: io::Error) -> Self {
        TN3270Error::Network(NetworkError::from(err))
    }
}

/// Result type alias for tn3270r operations
pub type TN3270Result<T> = Result<T, TN3270Error>;

/// Specialized result types for different components
pub type NetworkResult<T> = Result<T, NetworkError>;
pub type TelnetResult<T> = Result<T, TelnetError>;
pub type HostResult<T> = Result<T, HostError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
