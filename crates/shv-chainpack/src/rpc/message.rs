//! Requests, responses and signals.
//!
//! On the wire every message is an IMap keyed by the `RpcMessage` meta type:
//!
//! - Request: `requestId` + `method` (+ `shvPath`, `params`, `callerIds`,
//!   `tunnelHandle`, `accessGrant`)
//! - Response: `requestId` + exactly one of `result` / `error` (+ `callerIds`)
//! - Signal: `method` without `requestId` (+ `shvPath`, `params`)

use super::error::{ErrorCode, RpcError};
use super::tunnel_handle::TunnelHandle;
use super::{caller_ids_from_value, caller_ids_to_value};
use crate::error::{ChainPackError, Result};
use crate::meta::builtin::{self, rpc_message as key};
use crate::value::{IMap, MetaData, RpcValue};

#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub request_id: i64,
    pub shv_path: String,
    pub method: String,
    pub params: Option<RpcValue>,
    /// Ids of the connections the request travelled through, oldest first.
    pub caller_ids: Vec<i64>,
    pub tunnel_handle: Option<TunnelHandle>,
    pub access_grant: Option<String>,
}

impl RpcRequest {
    pub fn new(
        shv_path: impl Into<String>,
        method: impl Into<String>,
        params: Option<RpcValue>,
        request_id: i64,
    ) -> Self {
        Self {
            request_id,
            shv_path: shv_path.into(),
            method: method.into(),
            params,
            caller_ids: Vec::new(),
            tunnel_handle: None,
            access_grant: None,
        }
    }

    pub fn with_caller_ids(mut self, caller_ids: Vec<i64>) -> Self {
        self.caller_ids = caller_ids;
        self
    }

    pub fn with_tunnel_handle(mut self, handle: TunnelHandle) -> Self {
        self.tunnel_handle = Some(handle);
        self
    }

    pub fn with_access_grant(mut self, grant: impl Into<String>) -> Self {
        self.access_grant = Some(grant.into());
        self
    }

    pub fn to_rpc_value(&self) -> RpcValue {
        let mut imap = IMap::new();
        imap.insert(key::REQUEST_ID, RpcValue::from(self.request_id));
        imap.insert(key::METHOD, RpcValue::from(self.method.as_str()));
        if !self.shv_path.is_empty() {
            imap.insert(key::SHV_PATH, RpcValue::from(self.shv_path.as_str()));
        }
        if let Some(params) = &self.params {
            imap.insert(key::PARAMS, params.clone());
        }
        if !self.caller_ids.is_empty() {
            imap.insert(key::CALLER_IDS, caller_ids_to_value(&self.caller_ids));
        }
        if let Some(handle) = &self.tunnel_handle {
            imap.insert(key::TUNNEL_HANDLE, handle.to_rpc_value());
        }
        if let Some(grant) = &self.access_grant {
            imap.insert(key::ACCESS_GRANT, RpcValue::from(grant.as_str()));
        }
        message_value(imap)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    pub request_id: i64,
    pub result: std::result::Result<RpcValue, RpcError>,
    pub caller_ids: Vec<i64>,
}

impl RpcResponse {
    pub fn new(request_id: i64, result: std::result::Result<RpcValue, RpcError>) -> Self {
        Self {
            request_id,
            result,
            caller_ids: Vec::new(),
        }
    }

    /// Response addressed back along the request's caller chain.
    pub fn for_request(
        request: &RpcRequest,
        result: std::result::Result<RpcValue, RpcError>,
    ) -> Self {
        Self {
            request_id: request.request_id,
            result,
            caller_ids: request.caller_ids.clone(),
        }
    }

    pub fn with_caller_ids(mut self, caller_ids: Vec<i64>) -> Self {
        self.caller_ids = caller_ids;
        self
    }

    pub fn is_error(&self) -> bool {
        self.result.is_err()
    }

    pub fn to_rpc_value(&self) -> RpcValue {
        let mut imap = IMap::new();
        imap.insert(key::REQUEST_ID, RpcValue::from(self.request_id));
        match &self.result {
            Ok(result) => imap.insert(key::RESULT, result.clone()),
            Err(error) => imap.insert(key::ERROR, error.to_rpc_value()),
        };
        if !self.caller_ids.is_empty() {
            imap.insert(key::CALLER_IDS, caller_ids_to_value(&self.caller_ids));
        }
        message_value(imap)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcSignal {
    pub shv_path: String,
    pub method: String,
    pub params: Option<RpcValue>,
}

impl RpcSignal {
    pub fn new(
        shv_path: impl Into<String>,
        method: impl Into<String>,
        params: Option<RpcValue>,
    ) -> Self {
        Self {
            shv_path: shv_path.into(),
            method: method.into(),
            params,
        }
    }

    pub fn to_rpc_value(&self) -> RpcValue {
        let mut imap = IMap::new();
        imap.insert(key::METHOD, RpcValue::from(self.method.as_str()));
        if !self.shv_path.is_empty() {
            imap.insert(key::SHV_PATH, RpcValue::from(self.shv_path.as_str()));
        }
        if let Some(params) = &self.params {
            imap.insert(key::PARAMS, params.clone());
        }
        message_value(imap)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Request(RpcRequest),
    Response(RpcResponse),
    Signal(RpcSignal),
}

impl RpcMessage {
    pub fn to_rpc_value(&self) -> RpcValue {
        match self {
            RpcMessage::Request(r) => r.to_rpc_value(),
            RpcMessage::Response(r) => r.to_rpc_value(),
            RpcMessage::Signal(s) => s.to_rpc_value(),
        }
    }

    pub fn request_id(&self) -> Option<i64> {
        match self {
            RpcMessage::Request(r) => Some(r.request_id),
            RpcMessage::Response(r) => Some(r.request_id),
            RpcMessage::Signal(_) => None,
        }
    }
}

impl From<RpcRequest> for RpcMessage {
    fn from(value: RpcRequest) -> Self {
        RpcMessage::Request(value)
    }
}

impl From<RpcResponse> for RpcMessage {
    fn from(value: RpcResponse) -> Self {
        RpcMessage::Response(value)
    }
}

impl From<RpcSignal> for RpcMessage {
    fn from(value: RpcSignal) -> Self {
        RpcMessage::Signal(value)
    }
}

fn message_value(imap: IMap) -> RpcValue {
    let descriptor = builtin::rpc_message();
    RpcValue::from(imap).with_meta(MetaData::with_meta_type(
        descriptor.namespace_id(),
        descriptor.type_id(),
    ))
}

/// Classify a decoded value as a request, response or signal.
///
/// Missing metadata is accepted; metadata naming another meta type, a non-IMap
/// value or an IMap fitting none of the three shapes is
/// [`ChainPackError::MalformedMessage`].
pub fn parse_message(value: &RpcValue) -> Result<RpcMessage> {
    if let Some(meta) = value.meta() {
        if let Some(type_id) = meta.meta_type_id() {
            let ns = meta.meta_type_namespace_id();
            if (ns, type_id) != (builtin::NAMESPACE_ID, key::TYPE_ID) {
                return Err(ChainPackError::malformed_message(format!(
                    "unexpected meta type ({}, {})",
                    ns, type_id
                )));
            }
        }
    }
    let imap = value.as_imap().ok_or_else(|| {
        ChainPackError::malformed_message(format!("expected IMap, got {}", value.type_name()))
    })?;

    let request_id = match imap.get(&key::REQUEST_ID) {
        Some(id) => Some(
            id.as_int()
                .ok_or_else(|| ChainPackError::malformed_message("requestId must be Int"))?,
        ),
        None => None,
    };
    let method = match imap.get(&key::METHOD) {
        Some(m) => Some(
            m.as_str()
                .ok_or_else(|| ChainPackError::malformed_message("method must be String"))?
                .to_string(),
        ),
        None => None,
    };
    let shv_path = match imap.get(&key::SHV_PATH) {
        Some(p) => p
            .as_str()
            .ok_or_else(|| ChainPackError::malformed_message("shvPath must be String"))?
            .to_string(),
        None => String::new(),
    };
    let params = imap.get(&key::PARAMS).cloned();
    let caller_ids = imap
        .get(&key::CALLER_IDS)
        .map(caller_ids_from_value)
        .unwrap_or_default();

    match (request_id, method) {
        (Some(request_id), Some(method)) => {
            let tunnel_handle = match imap.get(&key::TUNNEL_HANDLE) {
                Some(h) => Some(TunnelHandle::from_rpc_value(h).ok_or_else(|| {
                    ChainPackError::malformed_message("invalid tunnelHandle")
                })?),
                None => None,
            };
            let access_grant = imap
                .get(&key::ACCESS_GRANT)
                .and_then(RpcValue::as_str)
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
            let result = match (imap.get(&key::RESULT), imap.get(&key::ERROR)) {
                (Some(result), None) => Ok(result.clone()),
                (None, Some(error)) => Err(RpcError::from_rpc_value(error)
                    .ok_or_else(|| ChainPackError::malformed_message("invalid error record"))?),
                (Some(_), Some(_)) => {
                    return Err(ChainPackError::malformed_message(
                        "response carries both result and error",
                    ))
                }
                (None, None) => {
                    return Err(ChainPackError::malformed_message(
                        "response carries neither result nor error",
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
            "neither requestId nor method present",
        )),
    }
}

pub fn make_request(
    shv_path: &str,
    method: &str,
    params: Option<RpcValue>,
    request_id: i64,
) -> RpcValue {
    RpcRequest::new(shv_path, method, params, request_id).to_rpc_value()
}

pub fn make_response(request_id: i64, result: RpcValue) -> RpcValue {
    RpcResponse::new(request_id, Ok(result)).to_rpc_value()
}

pub fn make_error_response(request_id: i64, code: ErrorCode, message: &str) -> RpcValue {
    RpcResponse::new(request_id, Err(RpcError::new(code, message))).to_rpc_value()
}

pub fn make_signal(shv_path: &str, method: &str, params: Option<RpcValue>) -> RpcValue {
    RpcSignal::new(shv_path, method, params).to_rpc_value()
}
