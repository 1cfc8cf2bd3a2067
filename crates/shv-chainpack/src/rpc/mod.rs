//! RPC message layer.

mod error;
mod jsonrpc;
mod message;
mod tunnel_handle;

pub use error::{ErrorCode, RpcError};
pub use jsonrpc::{decode_message, encode_message, from_json_rpc, to_json_rpc};
pub use message::{
    make_error_response, make_request, make_response, make_signal, parse_message, RpcMessage,
    RpcRequest, RpcResponse, RpcSignal,
};
pub use tunnel_handle::TunnelHandle;

use crate::value::RpcValue;

/// Well-known method names.
pub mod method {
    pub const HELLO: &str = "hello";
    pub const LOGIN: &str = "login";
    pub const DIR: &str = "dir";
    pub const LS: &str = "ls";
    pub const PING: &str = "ping";
    pub const ECHO: &str = "echo";
    pub const APP_NAME: &str = "appName";
    pub const DEVICE_ID: &str = "deviceId";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const OPEN_TUNNEL: &str = "openTunnel";
    pub const CLOSE_TUNNEL: &str = "closeTunnel";
    pub const CHNG: &str = "chng";
}

/// Join two path fragments with a single `/`, ignoring empty parts.
pub fn join_shv_path(a: &str, b: &str) -> String {
    let a = a.trim_matches('/');
    let b = b.trim_matches('/');
    match (a.is_empty(), b.is_empty()) {
        (true, _) => b.to_string(),
        (_, true) => a.to_string(),
        _ => format!("{}/{}", a, b),
    }
}

/// Path segments with empty segments dropped.
pub fn split_shv_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Caller ids arrive either as a single Int or as a List of Ints.
pub(crate) fn caller_ids_from_value(value: &RpcValue) -> Vec<i64> {
    if let Some(id) = value.as_int() {
        return vec![id];
    }
    value
        .as_list()
        .map(|ids| ids.iter().filter_map(RpcValue::as_int).collect())
        .unwrap_or_default()
}

pub(crate) fn caller_ids_to_value(ids: &[i64]) -> RpcValue {
    RpcValue::from(ids.iter().copied().map(RpcValue::from).collect::<Vec<_>>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_shv_path() {
        assert_eq!(join_shv_path("", "a/b"), "a/b");
        assert_eq!(join_shv_path("a/", "/b"), "a/b");
        assert_eq!(join_shv_path("a", ""), "a");
    }

    #[test]
    fn test_split_shv_path() {
        assert_eq!(split_shv_path("/a//b/"), vec!["a", "b"]);
        assert!(split_shv_path("").is_empty());
    }
}
