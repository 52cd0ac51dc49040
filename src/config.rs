//! Session configuration for tn3270r
//!
//! Settings live in a flat property map with dotted keys (`keyboard.typeahead`,
//! `connection.port`, ...), persisted as JSON. Listeners are told about every
//! change. [`EmulatorOptions`] is the typed snapshot the controller and the
//! keyboard engine consume.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::keyboard::KeyboardOptions;
use crate::lib3270::display::ScreenSize;
use crate::network::TlsSettings;
use crate::telnet_negotiation::NegotiatorConfig;

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChangeEvent {
    pub property_name: String,
    pub old_value: Option<ConfigValue>,
    pub new_value: Option<ConfigValue>,
}

/// Configuration change listener trait
pub trait ConfigChangeListener: Send + Sync {
    fn on_config_changed(&mut self, event: &ConfigChangeEvent);
}

/// Supported configuration value types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ConfigValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    StringArray(Vec<String>),
}

impl ConfigValue {
    pub fn as_string(&self) -> Option<&str> {
        match self {
            ConfigValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ConfigValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ConfigValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            ConfigValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_string_array(&self) -> Option<&Vec<String>> {
        match self {
            ConfigValue::StringArray(arr) => Some(arr),
            _ => None,
        }
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        ConfigValue::String(value)
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::String(value.to_string())
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        ConfigValue::Integer(value)
    }
}

impl From<f64> for ConfigValue {
    fn from(value: f64) -> Self {
        ConfigValue::Float(value)
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Boolean(value)
    }
}

impl From<Vec<String>> for ConfigValue {
    fn from(value: Vec<String>) -> Self {
        ConfigValue::StringArray(value)
    }
}

/// Per-user data directory, `~/.config/tn3270r` or the platform equivalent
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("tn3270r"))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Property-based session configuration
pub struct SessionConfig {
    properties: HashMap<String, ConfigValue>,
    listeners: Vec<Box<dyn ConfigChangeListener>>,
    session_name: String,
    config_resource: String,
}

impl SessionConfig {
    /// Create a new configuration instance
    pub fn new(config_resource: String, session_name: String) -> Self {
        let mut config = Self {
            properties: HashMap::new(),
            listeners: Vec::new(),
            session_name,
            config_resource,
        };
        config.set_defaults();
        config
    }

    fn set_defaults(&mut self) {
        let dir = config_dir();
        let defaults: [(&str, ConfigValue); 17] = [
            // Terminal
            ("terminal.type", "IBM-3278-2".into()),
            ("terminal.model", 2i64.into()),
            ("terminal.dbcs", false.into()),
            // Connection
            ("connection.port", 23i64.into()),
            ("connection.tls.caBundlePath", "".into()),
            ("connection.connectTimeoutSecs", 30i64.into()),
            // Keyboard
            ("keyboard.typeahead", true.into()),
            ("keyboard.oerrLock", true.into()),
            ("keyboard.numericLock", false.into()),
            ("keyboard.blankFill", false.into()),
            ("keyboard.unlockDelay", true.into()),
            ("keyboard.unlockDelayMs", 350i64.into()),
            // Session
            ("session.reconnect", false.into()),
            ("session.once", false.into()),
            ("session.loginMacro", "".into()),
            // Files
            ("files.hosts", dir.join("ibm_hosts").to_string_lossy().into_owned().into()),
            ("files.recent", dir.join("recent").to_string_lossy().into_owned().into()),
        ];
        for (key, value) in defaults {
            self.properties.insert(key.to_string(), value);
        }
    }

    /// Get configuration property as string
    pub fn get_string_property(&self, key: &str) -> Option<String> {
        self.properties.get(key).and_then(|v| v.as_string().map(|s| s.to_string()))
    }

    /// Get configuration property as string with default
    pub fn get_string_property_or(&self, key: &str, default: &str) -> String {
        self.get_string_property(key).unwrap_or_else(|| default.to_string())
    }

    /// Get configuration property as integer
    pub fn get_int_property(&self, key: &str) -> Option<i64> {
        self.properties.get(key).and_then(|v| v.as_integer())
    }

    /// Get configuration property as integer with default
    pub fn get_int_property_or(&self, key: &str, default: i64) -> i64 {
        self.get_int_property(key).unwrap_or(default)
    }

    /// Get configuration property as float
    pub fn get_float_property(&self, key: &str) -> Option<f64> {
        self.properties.get(key).and_then(|v| v.as_float())
    }

    /// Get configuration property as boolean
    pub fn get_boolean_property(&self, key: &str) -> Option<bool> {
        self.properties.get(key).and_then(|v| v.as_boolean())
    }

    /// Get configuration property as boolean with default
    pub fn get_boolean_property_or(&self, key: &str, default: bool) -> bool {
        self.get_boolean_property(key).unwrap_or(default)
    }

    pub fn get_string_array_property(&self, key: &str) -> Option<&Vec<String>> {
        self.properties.get(key).and_then(|v| v.as_string_array())
    }

    /// Set configuration property and fire change event
    pub fn set_property<T: Into<ConfigValue>>(&mut self, key: &str, value: T) {
        let new_value = value.into();
        let old_value = self.properties.insert(key.to_string(), new_value.clone());
        self.fire_change_event(&ConfigChangeEvent {
            property_name: key.to_string(),
            old_value,
            new_value: Some(new_value),
        });
    }

    /// Add a configuration change listener
    pub fn add_listener(&mut self, listener: Box<dyn ConfigChangeListener>) {
        self.listeners.push(listener);
    }

    fn fire_change_event(&mut self, event: &ConfigChangeEvent) {
        for listener in &mut self.listeners {
            listener.on_config_changed(event);
        }
    }

    pub fn get_session_name(&self) -> &str {
        &self.session_name
    }

    pub fn get_config_resource(&self) -> &str {
        &self.config_resource
    }

    /// Serialize configuration to JSON
    pub fn to_json(&self) -> ConfigResult<String> {
        Ok(serde_json::to_string_pretty(&self.properties)?)
    }

    /// Merge properties from JSON, firing a change event for each
    pub fn from_json(&mut self, json: &str) -> ConfigResult<()> {
        let loaded: HashMap<String, ConfigValue> = serde_json::from_str(json)?;
        for (key, value) in loaded {
            self.set_property(&key, value);
        }
        Ok(())
    }

    pub fn get_all_keys(&self) -> Vec<String> {
        self.properties.keys().cloned().collect()
    }

    pub fn has_property(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }

    /// Remove property and fire change event
    pub fn remove_property(&mut self, key: &str) -> Option<ConfigValue> {
        let old_value = self.properties.remove(key)?;
        self.fire_change_event(&ConfigChangeEvent {
            property_name: key.to_string(),
            old_value: Some(old_value.clone()),
            new_value: None,
        });
        Some(old_value)
    }
}

/// Typed runtime options built from a [`SessionConfig`]
#[derive(Debug, Clone, PartialEq)]
pub struct EmulatorOptions {
    pub term_type: String,
    pub screen_size: ScreenSize,
    pub dbcs: bool,
    pub port: u16,
    pub connect_timeout: Duration,
    pub tls: TlsSettings,
    pub keyboard: KeyboardOptions,
    pub reconnect: bool,
    pub once: bool,
    pub login_macro: Option<String>,
    pub hosts_file: Option<PathBuf>,
    pub recent_file: Option<PathBuf>,
}

impl Default for EmulatorOptions {
    fn default() -> Self {
        Self {
            term_type: "IBM-3278-2".to_string(),
            screen_size: ScreenSize::Model2,
            dbcs: false,
            port: 23,
            connect_timeout: Duration::from_secs(30),
            tls: TlsSettings::default(),
            keyboard: KeyboardOptions::default(),
            reconnect: false,
            once: false,
            login_macro: None,
            hosts_file: None,
            recent_file: None,
        }
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

fn invalid(parameter: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidParameter {
        parameter: parameter.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

impl EmulatorOptions {
    pub fn from_config(config: &SessionConfig) -> ConfigResult<Self> {
        let model = config.get_int_property_or("terminal.model", 2);
        let screen_size =
            ScreenSize::from_model(model).ok_or_else(|| invalid("terminal.model", model, "model must be 2-5"))?;

        let port = config.get_int_property_or("connection.port", 23);
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| invalid("connection.port", port, "port must be 1-65535"))?;

        let timeout = config.get_int_property_or("connection.connectTimeoutSecs", 30);
        if timeout <= 0 {
            return Err(invalid("connection.connectTimeoutSecs", timeout, "must be positive"));
        }

        let delay_ms = config.get_int_property_or("keyboard.unlockDelayMs", 350);
        if delay_ms < 0 {
            return Err(invalid("keyboard.unlockDelayMs", delay_ms, "must not be negative"));
        }

        let term_type = config.get_string_property_or("terminal.type", "IBM-3278-2");
        if term_type.trim().is_empty() {
            return Err(invalid("terminal.type", &term_type, "must not be empty"));
        }

        Ok(Self {
            term_type,
            screen_size,
            dbcs: config.get_boolean_property_or("terminal.dbcs", false),
            port,
            connect_timeout: Duration::from_secs(timeout as u64),
            tls: TlsSettings {
                ca_bundle_path: non_empty(config.get_string_property_or("connection.tls.caBundlePath", ""))
                    .map(PathBuf::from),
            },
            keyboard: KeyboardOptions {
                typeahead: config.get_boolean_property_or("keyboard.typeahead", true),
                oerr_lock: config.get_boolean_property_or("keyboard.oerrLock", true),
                numeric_lock: config.get_boolean_property_or("keyboard.numericLock", false),
                blank_fill: config.get_boolean_property_or("keyboard.blankFill", false),
                unlock_delay: config.get_boolean_property_or("keyboard.unlockDelay", true),
                unlock_delay_ms: delay_ms as u64,
            },
            reconnect: config.get_boolean_property_or("session.reconnect", false),
            once: config.get_boolean_property_or("session.once", false),
            login_macro: non_empty(config.get_string_property_or("session.loginMacro", "")),
            hosts_file: non_empty(config.get_string_property_or("files.hosts", "")).map(PathBuf::from),
            recent_file: non_empty(config.get_string_property_or("files.recent", "")).map(PathBuf::from),
        })
    }

    /// Negotiation parameters for one connection
    pub fn negotiator_config(&self, lu_names: Option<String>, std_ds: bool, non_tn3270e: bool) -> NegotiatorConfig {
        NegotiatorConfig {
            term_type: self.term_type.clone(),
            std_ds,
            non_tn3270e,
            lu_names,
            assoc: None,
            tls_available: true,
        }
    }
}

/// Thread-safe configuration wrapper
pub type SharedSessionConfig = Arc<Mutex<SessionConfig>>;

pub fn create_shared_config(config_resource: String, session_name: String) -> SharedSessionConfig {
    Arc::new(Mutex::new(SessionConfig::new(config_resource, session_name)))
}

/// Config file location: `TN3270R_CONFIG`, then the platform config
/// directory, then `./session.json`
pub fn default_config_path() -> PathBuf {
    if let Ok(p) = std::env::var("TN3270R_CONFIG") {
        return PathBuf::from(p);
    }
    match dirs::config_dir() {
        Some(dir) => dir.join("tn3270r").join("session.json"),
        None => PathBuf::from("session.json"),
    }
}

/// Load the configuration from disk if present; defaults otherwise
pub fn load_shared_config(session_name: String) -> SharedSessionConfig {
    let path = default_config_path();
    let shared = create_shared_config(path.to_string_lossy().into_owned(), session_name);

    if let Ok(mut file) = fs::File::open(&path) {
        let mut buf = String::new();
        if let Err(e) = file.read_to_string(&mut buf) {
            warn!("Failed to read config file {}: {}", path.display(), e);
            return shared;
        }
        if let Ok(mut cfg) = shared.lock() {
            if let Err(e) = cfg.from_json(&buf) {
                warn!("Failed to parse config file {}: {}", path.display(), e);
            }
        }
    }

    shared
}

/// Save the configuration to its `config_resource` path
pub fn save_shared_config(shared: &SharedSessionConfig) -> io::Result<()> {
    let (path, json) = {
        let cfg = shared
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "configuration lock poisoned"))?;
        let json = cfg
            .to_json()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        (PathBuf::from(cfg.get_config_resource()), json)
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut f = fs::File::create(&path)?;
    f.write_all(json.as_bytes())?;
    Ok(())
}
