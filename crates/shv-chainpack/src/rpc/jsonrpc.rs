//! JSON-RPC 2.0 envelope for RPC messages.
//!
//! ```json
//! {"jsonrpc":"2.0","id":42,"method":"get","params":…,"shvPath":"a/b",
//!  "callerId":[3],"tunnelHandle":…,"accessGrant":"rd"}
//! {"jsonrpc":"2.0","id":42,"result":…}
//! {"jsonrpc":"2.0","id":42,"error":{"code":-32601,"message":"…"}}
//! ```
//!
//! Parameters and results use the value JSON mapping of
//! [`crate::codec::json`]; error codes are translated with
//! [`ErrorCode::to_json_rpc_code`].

use super::error::{ErrorCode, RpcError};
use super::message::{parse_message, RpcMessage, RpcRequest, RpcResponse, RpcSignal};
use super::tunnel_handle::TunnelHandle;
use crate::codec::{self, json, ProtocolType};
use crate::error::{ChainPackError, Result};
use crate::value::RpcValue;
use serde_json::{Map as JsonMap, Value as Json};

const JSONRPC_VERSION: &str = "2.0";

pub fn to_json_rpc(message: &RpcMessage) -> Json {
    let mut obj = JsonMap::new();
    obj.insert("jsonrpc".into(), Json::from(JSONRPC_VERSION));
    match message {
        RpcMessage::Request(req) => {
            obj.insert("id".into(), Json::from(req.request_id));
            obj.insert("method".into(), Json::from(req.method.as_str()));
            if let Some(params) = &req.params {
                obj.insert("params".into(), json::to_json_value(params));
            }
            if !req.shv_path.is_empty() {
                obj.insert("shvPath".into(), Json::from(req.shv_path.as_str()));
            }
            if !req.caller_ids.is_empty() {
                obj.insert("callerId".into(), Json::from(req.caller_ids.clone()));
            }
            if let Some(handle) = &req.tunnel_handle {
                obj.insert(
                    "tunnelHandle".into(),
                    json::to_json_value(&handle.to_rpc_value()),
                );
            }
            if let Some(grant) = &req.access_grant {
                obj.insert("accessGrant".into(), Json::from(grant.as_str()));
            }
        }
        RpcMessage::Response(resp) => {
            obj.insert("id".into(), Json::from(resp.request_id));
            match &resp.result {
                Ok(result) => {
                    obj.insert("result".into(), json::to_json_value(result));
                }
                Err(error) => {
                    let mut err = JsonMap::new();
                    err.insert("code".into(), Json::from(error.code.to_json_rpc_code()));
                    err.insert("message".into(), Json::from(error.message.as_str()));
                    obj.insert("error".into(), Json::Object(err));
                }
            }
            if !resp.caller_ids.is_empty() {
                obj.insert("callerId".into(), Json::from(resp.caller_ids.clone()));
            }
        }
        RpcMessage::Signal(sig) => {
            obj.insert("method".into(), Json::from(sig.method.as_str()));
            if let Some(params) = &sig.params {
                obj.insert("params".into(), json::to_json_value(params));
            }
            if !sig.shv_path.is_empty() {
                obj.insert("shvPath".into(), Json::from(sig.shv_path.as_str()));
            }
        }
    }
    Json::Object(obj)
}

pub fn from_json_rpc(envelope: &Json) -> Result<RpcMessage> {
    let obj = envelope
        .as_object()
        .ok_or_else(|| ChainPackError::malformed_message("JSON-RPC envelope must be an object"))?;

    let id = match obj.get("id") {
        None | Some(Json::Null) => None,
        Some(id) => Some(
            id.as_i64()
                .ok_or_else(|| ChainPackError::malformed_message("id must be an integer"))?,
        ),
    };
    let method = match obj.get("method") {
        None => None,
        Some(m) => Some(
            m.as_str()
                .ok_or_else(|| ChainPackError::malformed_message("method must be a string"))?
                .to_string(),
        ),
    };
    let params = obj.get("params").map(json::from_json_value).transpose()?;
    let shv_path = obj
        .get("shvPath")
        .and_then(Json::as_str)
        .unwrap_or_default()
        .to_string();
    let caller_ids = match obj.get("callerId") {
        None | Some(Json::Null) => Vec::new(),
        Some(Json::Array(ids)) => ids.iter().filter_map(Json::as_i64).collect(),
        Some(id) => id.as_i64().into_iter().collect(),
    };

    match (id, method) {
        (Some(request_id), Some(method)) => {
            let tunnel_handle = match obj.get("tunnelHandle") {
                None | Some(Json::Null) => None,
                Some(h) => Some(
                    TunnelHandle::from_rpc_value(&json::from_json_value(h)?).ok_or_else(|| {
                        ChainPackError::malformed_message("invalid tunnelHandle")
                    })?,
                ),
            };
            let access_grant = obj
                .get("accessGrant")
                .and_then(Json::as_str)
                .map(str::to_string);
            Ok(RpcMessage::Request(RpcRequest {
                request_id,
                shv_path,
                method,
                params,
                caller_ids,
                tunnel_handle,
                access_grant,
            }))
        }
        (Some(request_id), None) => {
            let result = match (obj.get("result"), obj.get("error")) {
                (Some(result), None) => Ok(json::from_json_value(result)?),
                (None, Some(error)) => Err(error_from_json(error)?),
                _ => {
                    return Err(ChainPackError::malformed_message(
                        "response needs exactly one of result and error",
                    ))
                }
            };
            Ok(RpcMessage::Response(RpcResponse {
                request_id,
                result,
                caller_ids,
            }))
        }
        (None, Some(method)) => Ok(RpcMessage::Signal(RpcSignal {
            shv_path,
            method,
            params,
        })),
        (None, None) => Err(ChainPackError::malformed_message(
            "neither id nor method present",
        )),
    }
}

fn error_from_json(error: &Json) -> Result<RpcError> {
    let code = error
        .get("code")
        .and_then(Json::as_i64)
        .ok_or_else(|| ChainPackError::malformed_message("error.code must be an integer"))?;
    let message = error
        .get("message")
        .and_then(Json::as_str)
        .unwrap_or_default();
    Ok(RpcError::new(ErrorCode::from_json_rpc_code(code), message))
}

/// Serialize a message value for the given wire protocol.
pub fn encode_message(message: &RpcValue, protocol: ProtocolType) -> Result<Vec<u8>> {
    match protocol {
        ProtocolType::JsonRpc => {
            let parsed = parse_message(message)?;
            Ok(serde_json::to_vec(&to_json_rpc(&parsed))?)
        }
        other => Ok(codec::encode(message, other)),
    }
}

/// Deserialize a message value from the given wire protocol. For JSON-RPC the
/// envelope is validated; for the other protocols only the value is decoded.
pub fn decode_message(data: &[u8], protocol: ProtocolType) -> Result<RpcValue> {
    match protocol {
        ProtocolType::JsonRpc => {
            let envelope = json::parse_json(data).map_err(|e| match e {
                ChainPackError::Json { message, .. } => ChainPackError::malformed(message, 0),
                other => other,
            })?;
            Ok(from_json_rpc(&envelope)?.to_rpc_value())
        }
        other => codec::decode(data, other),
    }
}
