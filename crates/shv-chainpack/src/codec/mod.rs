//! Value codecs.
//!
//! - [`chainpack`]: compact binary
//! - [`cpon`]: text
//! - [`json`]: JSON with `$`-tagged wrappers for non-JSON types

pub mod chainpack;
pub mod cpon;
pub mod json;

use crate::error::{ChainPackError, Result};
use crate::value::RpcValue;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire format of a value or message. The discriminant is the protocol byte
/// carried in every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ProtocolType {
    #[default]
    ChainPack = 1,
    Cpon = 2,
    JsonRpc = 3,
}

impl ProtocolType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(ProtocolType::ChainPack),
            2 => Some(ProtocolType::Cpon),
            3 => Some(ProtocolType::JsonRpc),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProtocolType::ChainPack => "ChainPack",
            ProtocolType::Cpon => "Cpon",
            ProtocolType::JsonRpc => "JsonRpc",
        })
    }
}

impl std::str::FromStr for ProtocolType {
    type Err = ChainPackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "chainpack" => Ok(ProtocolType::ChainPack),
            "cpon" => Ok(ProtocolType::Cpon),
            "jsonrpc" | "json" => Ok(ProtocolType::JsonRpc),
            _ => Err(ChainPackError::Other(format!("unknown protocol type '{}'", s))),
        }
    }
}

/// Encode a plain value. For RPC messages on the `JsonRpc` wire use
/// [`crate::rpc::encode_message`], which produces a JSON-RPC envelope.
pub fn encode(value: &RpcValue, format: ProtocolType) -> Vec<u8> {
    match format {
        ProtocolType::ChainPack => chainpack::to_chainpack(value),
        ProtocolType::Cpon => cpon::to_cpon(value).into_bytes(),
        ProtocolType::JsonRpc => json::to_json(value).into_bytes(),
    }
}

pub fn decode(data: &[u8], format: ProtocolType) -> Result<RpcValue> {
    match format {
        ProtocolType::ChainPack => chainpack::from_chainpack(data),
        ProtocolType::Cpon | ProtocolType::JsonRpc => {
            let text = std::str::from_utf8(data).map_err(|e| {
                ChainPackError::malformed("text is not UTF-8", e.valid_up_to())
            })?;
            if format == ProtocolType::Cpon {
                cpon::from_cpon(text)
            } else {
                json::from_json(text).map_err(|e| match e {
                    ChainPackError::Json { message, .. } => ChainPackError::malformed(message, 0),
                    other => other,
                })
            }
        }
    }
}

impl RpcValue {
    pub fn to_chainpack(&self) -> Vec<u8> {
        chainpack::to_chainpack(self)
    }

    pub fn from_chainpack(data: &[u8]) -> Result<Self> {
        chainpack::from_chainpack(data)
    }

    pub fn to_cpon(&self) -> String {
        cpon::to_cpon(self)
    }

    pub fn from_cpon(text: &str) -> Result<Self> {
        cpon::from_cpon(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{DateTime, Decimal, IMap, Map, MetaData};

    fn sample() -> RpcValue {
        let mut map = Map::new();
        map.insert("blob".to_string(), RpcValue::from(vec![0u8, 1, 255]));
        map.insert(
            "when".to_string(),
            RpcValue::from(DateTime::from_epoch_msec_tz(1_600_000_000_123, -90)),
        );
        map.insert("price".to_string(), RpcValue::from(Decimal::new(-1999, -2)));
        map.insert("count".to_string(), RpcValue::from(u64::MAX));
        map.insert("nan".to_string(), RpcValue::from(f64::NAN));
        let imap = IMap::from([
            (1, RpcValue::from("login")),
            (2, RpcValue::from(map)),
            (3, RpcValue::from(vec![RpcValue::null(), RpcValue::from(false)])),
        ]);
        RpcValue::from(imap).with_meta(MetaData::with_meta_type(0, 1))
    }

    #[test]
    fn test_roundtrip_all_formats() {
        let value = sample();
        for format in [ProtocolType::ChainPack, ProtocolType::Cpon, ProtocolType::JsonRpc] {
            let bytes = encode(&value, format);
            assert_eq!(decode(&bytes, format).unwrap(), value, "{format}");
        }
    }

    #[test]
    fn test_cross_format() {
        let value = sample();
        let from_binary = decode(&encode(&value, ProtocolType::ChainPack), ProtocolType::ChainPack)
            .unwrap();
        let via_text = decode(&encode(&from_binary, ProtocolType::Cpon), ProtocolType::Cpon)
            .unwrap();
        assert_eq!(via_text, value);
    }

    #[test]
    fn test_protocol_byte() {
        assert_eq!(ProtocolType::from_u8(2), Some(ProtocolType::Cpon));
        assert_eq!(ProtocolType::from_u8(0), None);
        assert_eq!(ProtocolType::JsonRpc.as_u8(), 3);
        assert_eq!("cpon".parse::<ProtocolType>().unwrap(), ProtocolType::Cpon);
    }

    #[test]
    fn test_invalid_utf8_text_is_malformed() {
        let err = decode(&[b'"', 0xff, b'"'], ProtocolType::Cpon).unwrap_err();
        assert!(err.is_malformed());
    }
}
