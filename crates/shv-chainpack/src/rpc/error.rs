//! RPC error codes and the error record carried in responses.

use crate::meta::builtin::{self, rpc_error};
use crate::value::{IMap, MetaData, RpcValue};
use std::fmt;

/// Numeric error code of an error response. The code drives handling; the
/// message is diagnostic only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    ParseError,
    Timeout,
    Abort,
    MethodCallException,
    PermissionDenied,
    PathNotFound,
    ConnectionClosed,
    /// Application-defined, `>= 32`.
    User(i64),
    Unknown(i64),
}

impl ErrorCode {
    pub const USER_CODE_BASE: i64 = 32;

    pub fn code(self) -> i64 {
        match self {
            ErrorCode::InvalidRequest => 1,
            ErrorCode::MethodNotFound => 2,
            ErrorCode::InvalidParams => 3,
            ErrorCode::InternalError => 4,
            ErrorCode::ParseError => 5,
            ErrorCode::Timeout => 6,
            ErrorCode::Abort => 7,
            ErrorCode::MethodCallException => 8,
            ErrorCode::PermissionDenied => 9,
            ErrorCode::PathNotFound => 10,
            ErrorCode::ConnectionClosed => 11,
            ErrorCode::User(n) | ErrorCode::Unknown(n) => n,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            1 => ErrorCode::InvalidRequest,
            2 => ErrorCode::MethodNotFound,
            3 => ErrorCode::InvalidParams,
            4 => ErrorCode::InternalError,
            5 => ErrorCode::ParseError,
            6 => ErrorCode::Timeout,
            7 => ErrorCode::Abort,
            8 => ErrorCode::MethodCallException,
            9 => ErrorCode::PermissionDenied,
            10 => ErrorCode::PathNotFound,
            11 => ErrorCode::ConnectionClosed,
            n if n >= Self::USER_CODE_BASE => ErrorCode::User(n),
            n => ErrorCode::Unknown(n),
        }
    }

    /// Code as seen by JSON-RPC 2.0 peers.
    ///
    /// - -32600 .. -32603, -32700: the standard JSON-RPC codes
    /// - -32006 .. -32011: the remaining built-in codes as `-32000 - code`
    /// - user codes unchanged
    pub fn to_json_rpc_code(self) -> i64 {
        match self {
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::ParseError => -32700,
            ErrorCode::User(n) | ErrorCode::Unknown(n) => n,
            other => -32000 - other.code(),
        }
    }

    pub fn from_json_rpc_code(code: i64) -> Self {
        match code {
            -32600 => ErrorCode::InvalidRequest,
            -32601 => ErrorCode::MethodNotFound,
            -32602 => ErrorCode::InvalidParams,
            -32603 => ErrorCode::InternalError,
            -32700 => ErrorCode::ParseError,
            -32011..=-32006 => Self::from_code(-32000 - code),
            n => Self::from_code(n),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::User(n) => write!(f, "UserCode({})", n),
            ErrorCode::Unknown(n) => write!(f, "Unknown({})", n),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Error record of an error response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// IMap `{1: code, 2: message}` tagged with the `RpcError` meta type.
    pub fn to_rpc_value(&self) -> RpcValue {
        let descriptor = builtin::rpc_error();
        let mut imap = IMap::new();
        imap.insert(rpc_error::CODE, RpcValue::from(self.code.code()));
        if !self.message.is_empty() {
            imap.insert(rpc_error::MESSAGE, RpcValue::from(self.message.as_str()));
        }
        RpcValue::from(imap).with_meta(MetaData::with_meta_type(
            descriptor.namespace_id(),
            descriptor.type_id(),
        ))
    }

    /// Accepts the IMap form, with or without metadata, and the
    /// `{"code", "message"}` Map form some peers send.
    pub fn from_rpc_value(value: &RpcValue) -> Option<Self> {
        let (code, message) = if let Some(imap) = value.as_imap() {
            (
                imap.get(&rpc_error::CODE).and_then(RpcValue::as_int)?,
                imap.get(&rpc_error::MESSAGE).and_then(RpcValue::as_str),
            )
        } else {
            (
                value.get("code").and_then(RpcValue::as_int)?,
                value.get("message").and_then(RpcValue::as_str),
            )
        };
        Some(Self::new(
            ErrorCode::from_code(code),
            message.unwrap_or_default(),
        ))
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}
