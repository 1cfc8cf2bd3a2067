//! Session handshake.
//!
//! ```text
//! client                                  broker
//!   ── hello ───────────────────────────────▶
//!   ◀──────────────────── {"nonce": "..."} ──
//!   ── login {"login": {...}, "options": {...}} ▶
//!   ◀─────────────── {"clientId": n} / error ──
//! ```
//!
//! With `SHA256` the password field carries
//! `hex(sha256(nonce + hex(sha256(password))))`; with `PLAIN` it is sent as
//! is.

use super::frame::RpcStream;
use crate::config::{ClientConfig, DeviceOptions, LoginType, RpcConfig};
use crate::error::{Result, ShvError};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shv_chainpack::codec::json::{from_json_value, to_json_value};
use shv_chainpack::rpc::method;
use shv_chainpack::{
    ErrorCode, Map, ProtocolType, RpcError, RpcMessage, RpcRequest, RpcResponse, RpcValue,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

const HELLO_REQUEST_ID: i64 = 1;
const LOGIN_REQUEST_ID: i64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginCredentials {
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(rename = "type", default)]
    pub login_type: LoginType,
}

impl LoginCredentials {
    /// Check the credentials against the stored plain-text password.
    pub fn verify(&self, nonce: &str, password: &str) -> bool {
        match self.login_type {
            LoginType::Plain => self.password == password,
            LoginType::Sha256 => self.password == login_hash(nonce, password),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceOptions>,
    #[serde(
        rename = "idleWatchDogTimeOut",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub idle_watchdog_secs: Option<u64>,
}

/// Params of the `login` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub login: LoginCredentials,
    #[serde(default)]
    pub options: LoginOptions,
}

impl LoginRequest {
    /// Login params for `config`, hashing the password with `nonce` when
    /// SHA256 is selected.
    pub fn from_config(config: &ClientConfig, nonce: &str) -> Self {
        let password = match config.login_type {
            LoginType::Plain => config.password.clone(),
            LoginType::Sha256 => login_hash(nonce, &config.password),
        };
        Self {
            login: LoginCredentials {
                user: config.user.clone(),
                password,
                login_type: config.login_type,
            },
            options: LoginOptions {
                device: config.device.clone(),
                idle_watchdog_secs: config.idle_watchdog_secs,
            },
        }
    }

    pub fn to_rpc_value(&self) -> Result<RpcValue> {
        Ok(from_json_value(&serde_json::to_value(self)?)?)
    }

    pub fn from_rpc_value(value: &RpcValue) -> Result<Self> {
        serde_json::from_value(to_json_value(value))
            .map_err(|e| ShvError::invalid_params(format!("Invalid login params: {}", e)))
    }
}

/// `hex(sha256(nonce + hex(sha256(password))))`
pub fn login_hash(nonce: &str, password: &str) -> String {
    let password_hash = hex::encode(Sha256::digest(password.as_bytes()));
    let mut hasher = Sha256::new();
    hasher.update(nonce.as_bytes());
    hasher.update(password_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Fresh random nonce, hex encoded.
pub fn make_nonce() -> String {
    let mut bytes = [0u8; RpcConfig::NONCE_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Client side of the handshake. Returns the client id the broker assigned.
pub async fn client_login<S>(rpc: &mut RpcStream<S>, config: &ClientConfig) -> Result<i64>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = RpcRequest::new("", method::HELLO, None, HELLO_REQUEST_ID);
    let result = exchange(rpc, hello).await?;
    let nonce = result
        .get("nonce")
        .and_then(RpcValue::as_str)
        .ok_or_else(|| ShvError::LoginFailed {
            message: "hello response carries no nonce".to_string(),
        })?
        .to_string();

    let params = LoginRequest::from_config(config, &nonce).to_rpc_value()?;
    let login = RpcRequest::new("", method::LOGIN, Some(params), LOGIN_REQUEST_ID);
    let result = exchange(rpc, login).await?;
    let client_id = result
        .get("clientId")
        .and_then(RpcValue::as_int)
        .unwrap_or(0);
    debug!("Logged in as '{}' with client id {}", config.user, client_id);
    Ok(client_id)
}

async fn exchange<S>(rpc: &mut RpcStream<S>, request: RpcRequest) -> Result<RpcValue>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request_id = request.request_id;
    let name = request.method.clone();
    rpc.send(&request.into()).await?;
    loop {
        match rpc.recv().await? {
            (RpcMessage::Response(response), _) if response.request_id == request_id => {
                return response.result.map_err(|e| ShvError::LoginFailed {
                    message: format!("{} rejected: {}", name, e),
                });
            }
            (other, _) => debug!("Ignoring {:?} during handshake", other.request_id()),
        }
    }
}

/// A login the server has read but not yet answered.
#[derive(Debug, Clone)]
pub struct PendingLogin {
    pub request_id: i64,
    pub request: LoginRequest,
    pub nonce: String,
    pub protocol: ProtocolType,
}

impl PendingLogin {
    pub fn user(&self) -> &str {
        &self.request.login.user
    }

    pub fn verify(&self, password: &str) -> bool {
        self.request.login.verify(&self.nonce, password)
    }
}

/// Server side of the handshake up to the login request.
///
/// The protocol of the `hello` frame becomes the protocol of the session.
pub async fn accept_login<S>(rpc: &mut RpcStream<S>) -> Result<PendingLogin>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (message, protocol) = rpc.recv().await?;
    rpc.set_protocol(protocol);
    let hello = expect_request(rpc, message, method::HELLO).await?;

    let nonce = make_nonce();
    let mut result = Map::new();
    result.insert("nonce".to_string(), RpcValue::from(nonce.as_str()));
    rpc.send(&RpcResponse::for_request(&hello, Ok(RpcValue::from(result))).into())
        .await?;

    let (message, _) = rpc.recv().await?;
    let login = expect_request(rpc, message, method::LOGIN).await?;
    let params = login.params.clone().unwrap_or_default();
    let request = match LoginRequest::from_rpc_value(&params) {
        Ok(request) => request,
        Err(e) => {
            let error = e.to_rpc_error();
            rpc.send(&RpcResponse::for_request(&login, Err(error)).into())
                .await?;
            return Err(e);
        }
    };

    Ok(PendingLogin {
        request_id: login.request_id,
        request,
        nonce,
        protocol,
    })
}

async fn expect_request<S>(
    rpc: &mut RpcStream<S>,
    message: RpcMessage,
    expected: &str,
) -> Result<RpcRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match message {
        RpcMessage::Request(request) if request.method == expected => Ok(request),
        RpcMessage::Request(request) => {
            let error = RpcError::new(
                ErrorCode::InvalidRequest,
                format!("Expected '{}', got '{}'", expected, request.method),
            );
            rpc.send(&RpcResponse::for_request(&request, Err(error.clone())).into())
                .await?;
            Err(ShvError::LoginFailed {
                message: error.message,
            })
        }
        _ => Err(ShvError::LoginFailed {
            message: format!("Expected '{}' request", expected),
        }),
    }
}

/// Answer a pending login with the assigned client id or an error.
pub async fn finish_login<S>(
    rpc: &mut RpcStream<S>,
    pending: &PendingLogin,
    outcome: std::result::Result<i64, RpcError>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = outcome.map(|client_id| {
        let mut map = Map::new();
        map.insert("clientId".to_string(), RpcValue::from(client_id));
        RpcValue::from(map)
    });
    rpc.send(&RpcResponse::new(pending.request_id, result).into())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_hash_known_value() {
        assert_eq!(
            login_hash("abc", "secret"),
            "5b9b6b3be20e7bab626c57b4c5d1255eea7a34933088c4b7abff8acff1eafb89"
        );
        assert_ne!(login_hash("abc", "secret"), login_hash("abd", "secret"));
    }

    #[test]
    fn test_nonce_is_random_hex() {
        let a = make_nonce();
        assert_eq!(a.len(), RpcConfig::NONCE_BYTES * 2);
        assert!(a.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(a, make_nonce());
    }

    #[test]
    fn test_verify_both_login_types() {
        let config = ClientConfig::default().with_user("admin", "admin!");
        let sha = LoginRequest::from_config(&config, "n0nce");
        assert!(sha.login.verify("n0nce", "admin!"));
        assert!(!sha.login.verify("other", "admin!"));

        let plain = LoginRequest::from_config(&config.with_login_type(LoginType::Plain), "x");
        assert_eq!(plain.login.password, "admin!");
        assert!(plain.login.verify("ignored", "admin!"));
    }

    #[test]
    fn test_login_request_value_roundtrip() {
        let config = ClientConfig::default()
            .with_user("dev", "pw")
            .with_device("pump-1", Some("test/pump"))
            .with_idle_watchdog(std::time::Duration::from_secs(30));
        let request = LoginRequest::from_config(&config, "nonce");
        let value = request.to_rpc_value().unwrap();
        assert_eq!(
            value
                .get("login")
                .and_then(|l| l.get("type"))
                .and_then(RpcValue::as_str),
            Some("SHA256")
        );
        assert_eq!(LoginRequest::from_rpc_value(&value).unwrap(), request);
    }

    #[test]
    fn test_invalid_login_params() {
        let err = LoginRequest::from_rpc_value(&RpcValue::from(5)).unwrap_err();
        assert!(matches!(err, ShvError::InvalidParams { .. }));
    }

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let (a, b) = tokio::io::duplex(4096);
        let config = ClientConfig::default().with_user("admin", "admin!");

        let server = tokio::spawn(async move {
            let mut rpc = RpcStream::new(b, ProtocolType::ChainPack);
            let pending = accept_login(&mut rpc).await.unwrap();
            let outcome = if pending.user() == "admin" && pending.verify("admin!") {
                Ok(17)
            } else {
                Err(RpcError::new(ErrorCode::PermissionDenied, "bad password"))
            };
            finish_login(&mut rpc, &pending, outcome).await.unwrap();
            pending.protocol
        });

        let mut rpc = RpcStream::new(a, ProtocolType::Cpon);
        let client_id = client_login(&mut rpc, &config).await.unwrap();
        assert_eq!(client_id, 17);
        assert_eq!(server.await.unwrap(), ProtocolType::Cpon);
    }

    #[tokio::test]
    async fn test_handshake_rejects_bad_password() {
        let (a, b) = tokio::io::duplex(4096);
        let config = ClientConfig::default().with_user("admin", "wrong");

        tokio::spawn(async move {
            let mut rpc = RpcStream::new(b, ProtocolType::ChainPack);
            let pending = accept_login(&mut rpc).await.unwrap();
            let outcome = if pending.verify("admin!") {
                Ok(1)
            } else {
                Err(RpcError::new(ErrorCode::PermissionDenied, "bad password"))
            };
            finish_login(&mut rpc, &pending, outcome).await.unwrap();
        });

        let mut rpc = RpcStream::new(a, ProtocolType::ChainPack);
        let err = client_login(&mut rpc, &config).await.unwrap_err();
        assert!(matches!(err, ShvError::LoginFailed { .. }));
    }

    #[tokio::test]
    async fn test_login_before_hello_is_rejected() {
        let (a, b) = tokio::io::duplex(4096);
        let server = tokio::spawn(async move {
            let mut rpc = RpcStream::new(b, ProtocolType::ChainPack);
            accept_login(&mut rpc).await
        });

        let mut rpc = RpcStream::new(a, ProtocolType::ChainPack);
        rpc.send(&RpcRequest::new("", "login", None, 1).into())
            .await
            .unwrap();
        let (RpcMessage::Response(response), _) = rpc.recv().await.unwrap() else {
            panic!("expected response");
        };
        assert_eq!(response.result.unwrap_err().code, ErrorCode::InvalidRequest);
        assert!(server.await.unwrap().is_err());
    }
}
