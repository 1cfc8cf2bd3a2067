//! SHV ChainPack - value model, codecs and RPC messages.
//!
//! This crate provides the protocol-level building blocks of an SHV system
//! without any I/O:
//!
//! - [`RpcValue`], a dynamic value with optional [`MetaData`]
//! - the ChainPack, Cpon and JSON codecs in [`codec`]
//! - the process-wide [`meta`] type registry
//! - requests, responses, signals and the JSON-RPC envelope in [`rpc`]
//!
//! # Example
//!
//! ```rust
//! use shv_chainpack::rpc::{make_request, parse_message, RpcMessage};
//! use shv_chainpack::{codec, ProtocolType, RpcValue};
//!
//! let request = make_request("sensors/t1", "get", None, 1);
//! let bytes = codec::encode(&request, ProtocolType::ChainPack);
//! let decoded = codec::decode(&bytes, ProtocolType::ChainPack).unwrap();
//! assert!(matches!(parse_message(&decoded), Ok(RpcMessage::Request(_))));
//! assert_eq!(RpcValue::from(1u64).to_cpon(), "1u");
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod meta;
pub mod rpc;
pub mod value;

pub use codec::{decode, encode, ProtocolType};
pub use config::CodecConfig;
pub use error::{ChainPackError, Result};
pub use meta::{MetaType, MetaTypeRegistry};
pub use rpc::{ErrorCode, RpcError, RpcMessage, RpcRequest, RpcResponse, RpcSignal, TunnelHandle};
pub use value::{DateTime, Decimal, IMap, List, Map, MetaData, MetaKey, RpcValue, Value};
