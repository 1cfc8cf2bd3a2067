//! Connection and broker configuration.
//!
//! Protocol constants live on [`RpcConfig`]. The serde structs describe a
//! client session ([`ClientConfig`]) and a broker ([`BrokerConfig`]); the
//! broker binary loads the latter from a JSON file.

use crate::error::{Result, ShvError};
use crate::node::AccessLevel;
use serde::{Deserialize, Serialize};
use shv_chainpack::ProtocolType;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// RPC protocol and transport constants.
pub struct RpcConfig;

impl RpcConfig {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 3755;

    /// Path of the broker's own methods.
    pub const BROKER_APP_PATH: &'static str = ".broker/app";

    /// Largest frame payload accepted from a peer (16MB).
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

    // Timeouts
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_IDLE_WATCHDOG: Duration = Duration::from_secs(180);
    pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
    /// A single frame write stalled this long closes the connection.
    pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

    // Channel sizes
    pub const INBOUND_CHANNEL_CAPACITY: usize = 64;
    pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;
    pub const MAX_PENDING_CALLS: usize = 4096;
    pub const SIGNAL_CHANNEL_CAPACITY: usize = 256;

    /// Random bytes in a login nonce.
    pub const NONCE_BYTES: usize = 16;

    pub const MAX_CONNECTIONS: usize = 256;
}

/// Password transport used by `login`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoginType {
    #[serde(rename = "PLAIN")]
    Plain,
    #[default]
    #[serde(rename = "SHA256")]
    Sha256,
}

impl LoginType {
    pub fn as_str(self) -> &'static str {
        match self {
            LoginType::Plain => "PLAIN",
            LoginType::Sha256 => "SHA256",
        }
    }
}

/// Device identity announced at login.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<String>,
}

/// Settings of one client session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub login_type: LoginType,
    #[serde(default)]
    pub protocol: ProtocolType,
    #[serde(default)]
    pub device: Option<DeviceOptions>,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Idle timeout the broker should apply to this session.
    #[serde(default)]
    pub idle_watchdog_secs: Option<u64>,
    /// Ping period; zero disables the heartbeat.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

fn default_host() -> String {
    RpcConfig::DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    RpcConfig::DEFAULT_PORT
}

fn default_call_timeout_ms() -> u64 {
    RpcConfig::DEFAULT_CALL_TIMEOUT.as_millis() as u64
}

fn default_heartbeat_secs() -> u64 {
    RpcConfig::DEFAULT_HEARTBEAT_INTERVAL.as_secs()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: String::new(),
            password: String::new(),
            login_type: LoginType::default(),
            protocol: ProtocolType::default(),
            device: None,
            call_timeout_ms: default_call_timeout_ms(),
            idle_watchdog_secs: None,
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_login_type(mut self, login_type: LoginType) -> Self {
        self.login_type = login_type;
        self
    }

    pub fn with_protocol(mut self, protocol: ProtocolType) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_device(
        mut self,
        device_id: impl Into<String>,
        mount_point: Option<&str>,
    ) -> Self {
        self.device = Some(DeviceOptions {
            device_id: Some(device_id.into()),
            mount_point: mount_point.map(str::to_string),
        });
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_idle_watchdog(mut self, timeout: Duration) -> Self {
        self.idle_watchdog_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn with_heartbeat(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_secs = interval.map(|d| d.as_secs().max(1)).unwrap_or(0);
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_secs > 0).then(|| Duration::from_secs(self.heartbeat_secs))
    }
}

/// Credentials and access of one broker user.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    pub password: String,
    #[serde(default)]
    pub access: AccessLevel,
}

impl UserConfig {
    const REDACTED: &'static str = "<redacted>";
}

impl std::fmt::Debug for UserConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserConfig")
            .field("password", &Self::REDACTED)
            .field("access", &self.access)
            .finish()
    }
}

/// Broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Idle timeout for sessions that do not request one at login.
    #[serde(default = "default_idle_watchdog_secs")]
    pub idle_watchdog_secs: u64,
    #[serde(default)]
    pub users: BTreeMap<String, UserConfig>,
}

fn default_app_name() -> String {
    "shv-broker".to_string()
}

fn default_max_connections() -> usize {
    RpcConfig::MAX_CONNECTIONS
}

fn default_handshake_timeout_secs() -> u64 {
    RpcConfig::HANDSHAKE_TIMEOUT.as_secs()
}

fn default_idle_watchdog_secs() -> u64 {
    RpcConfig::DEFAULT_IDLE_WATCHDOG.as_secs()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            app_name: default_app_name(),
            device_id: None,
            max_connections: default_max_connections(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            idle_watchdog_secs: default_idle_watchdog_secs(),
            users: BTreeMap::new(),
        }
    }
}

impl BrokerConfig {
    /// Copy with every password replaced, for printing.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        for user in config.users.values_mut() {
            user.password = UserConfig::REDACTED.to_string();
        }
        config
    }

    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Load a broker configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ShvError::Config {
            message: format!("Failed to read {}: {}", path.display(), e),
        })?;
        serde_json::from_str(&text).map_err(|e| ShvError::Config {
            message: format!("Invalid broker config {}: {}", path.display(), e),
        })
    }

    pub fn with_user(
        mut self,
        name: impl Into<String>,
        password: impl Into<String>,
        access: AccessLevel,
    ) -> Self {
        self.users.insert(
            name.into(),
            UserConfig {
                password: password.into(),
                access,
            },
        );
        self
    }

    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_idle_watchdog(mut self, timeout: Duration) -> Self {
        self.idle_watchdog_secs = timeout.as_secs().max(1);
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn idle_watchdog(&self) -> Duration {
        Duration::from_secs(self.idle_watchdog_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_client_defaults() {
        let config = ClientConfig::new("localhost", 3755).with_user("admin", "secret");
        assert_eq!(config.address(), "localhost:3755");
        assert_eq!(config.login_type, LoginType::Sha256);
        assert_eq!(config.call_timeout(), RpcConfig::DEFAULT_CALL_TIMEOUT);
        assert_eq!(config.heartbeat_interval(), Some(Duration::from_secs(60)));
        assert_eq!(config.with_heartbeat(None).heartbeat_interval(), None);
    }

    #[test]
    fn test_broker_config_from_json_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "port": 3756,
                "maxConnections": 8,
                "users": {{
                    "admin": {{ "password": "admin!", "access": "su" }},
                    "viewer": {{ "password": "view" }}
                }}
            }}"#
        )
        .unwrap();

        let config = BrokerConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.port, 3756);
        assert_eq!(config.host, RpcConfig::DEFAULT_HOST);
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.users["admin"].access, AccessLevel::Admin);
        assert_eq!(config.users["viewer"].access, AccessLevel::Read);
    }

    #[test]
    fn test_redacted_config_hides_passwords() {
        let config =
            BrokerConfig::new("127.0.0.1", 0).with_user("admin", "s3cret", AccessLevel::Admin);
        let printed = serde_json::to_string(&config.redacted()).unwrap();
        assert!(!printed.contains("s3cret"));
        assert!(printed.contains("admin"));
        assert!(!format!("{:?}", config).contains("s3cret"));
        assert_eq!(config.users["admin"].password, "s3cret");
    }

    #[test]
    fn test_broker_config_rejects_invalid_json() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            BrokerConfig::from_json_file(file.path()),
            Err(ShvError::Config { .. })
        ));
    }

    #[test]
    fn test_device_options_serde_names() {
        let options = DeviceOptions {
            device_id: Some("pump-1".to_string()),
            mount_point: Some("test/pump".to_string()),
        };
        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["deviceId"], "pump-1");
        assert_eq!(json["mountPoint"], "test/pump");
    }
}
