//! JSON mapping of values.
//!
//! Null, Bool, Int, finite Double, String, List and Map are native JSON.
//! Everything JSON cannot carry is wrapped in a single-key object whose key
//! starts with `$`:
//!
//! | value | JSON |
//! |---|---|
//! | UInt | `{"$uint":42}` |
//! | Decimal | `{"$decimal":[12345,-2]}` |
//! | DateTime | `{"$datetime":"2018-02-02T00:00:00Z"}` |
//! | Blob | `{"$blob":"0a1b"}` |
//! | IMap | `{"$imap":{"1":…}}` |
//! | NaN / ±inf | `{"$double":"nan"}` |
//! | Map with a `$` key | `{"$map":{…}}` |
//! | MetaData | `{"$meta":[[1,1],["unit","V"]],"$value":…}` |

use crate::config::CodecConfig;
use crate::error::{ChainPackError, Result};
use crate::value::{DateTime, Decimal, IMap, List, Map, MetaData, MetaKey, RpcValue, Value};
use serde::Deserialize;
use serde_json::{json, Number, Value as Json};

const UINT: &str = "$uint";
const DECIMAL: &str = "$decimal";
const DATETIME: &str = "$datetime";
const BLOB: &str = "$blob";
const IMAP: &str = "$imap";
const DOUBLE: &str = "$double";
const MAP: &str = "$map";
const META: &str = "$meta";
const VALUE: &str = "$value";

/// One value level takes at most three JSON levels (`$meta` entries).
const MAX_JSON_DEPTH: usize = (CodecConfig::MAX_NESTING_DEPTH + 1) * 3;

pub fn to_json(value: &RpcValue) -> String {
    to_json_value(value).to_string()
}

pub fn from_json(text: &str) -> Result<RpcValue> {
    from_json_value(&parse_json(text.as_bytes())?)
}

/// Parse JSON text without serde_json's own recursion limit.
///
/// Nesting is checked up front against what the deepest allowed value needs,
/// so deeply nested input fails before the parser recurses into it.
pub fn parse_json(data: &[u8]) -> Result<Json> {
    let depth = json_depth(data);
    if depth > MAX_JSON_DEPTH {
        return Err(malformed(format!(
            "JSON nesting depth {} exceeds {}",
            depth, MAX_JSON_DEPTH
        )));
    }
    let mut deserializer = serde_json::Deserializer::from_slice(data);
    deserializer.disable_recursion_limit();
    let json = Json::deserialize(&mut deserializer)?;
    deserializer.end()?;
    Ok(json)
}

/// Deepest `[`/`{` nesting outside of strings.
fn json_depth(data: &[u8]) -> usize {
    let mut depth = 0usize;
    let mut max = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for &byte in data {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'[' | b'{' => {
                depth += 1;
                max = max.max(depth);
            }
            b']' | b'}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    max
}

pub fn to_json_value(value: &RpcValue) -> Json {
    let plain = plain_to_json(value.value());
    match value.meta() {
        Some(meta) => {
            let entries: Vec<Json> = meta
                .iter()
                .map(|(key, v)| {
                    let key = match key {
                        MetaKey::Int(k) => Json::from(*k),
                        MetaKey::Str(k) => Json::from(k.as_str()),
                    };
                    Json::Array(vec![key, to_json_value(v)])
                })
                .collect();
            json!({ META: entries, VALUE: plain })
        }
        None => plain,
    }
}

fn plain_to_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(n) => Json::from(*n),
        Value::UInt(n) => json!({ UINT: n }),
        Value::Double(d) => match Number::from_f64(*d) {
            Some(n) => Json::Number(n),
            None => {
                let text = if d.is_nan() {
                    "nan"
                } else if *d > 0.0 {
                    "inf"
                } else {
                    "-inf"
                };
                json!({ DOUBLE: text })
            }
        },
        Value::Decimal(d) => json!({ DECIMAL: [d.mantissa(), d.exponent()] }),
        Value::DateTime(dt) => json!({ DATETIME: dt.to_iso_string() }),
        Value::String(s) => Json::String(s.clone()),
        Value::Blob(b) => json!({ BLOB: hex::encode(b) }),
        Value::List(items) => Json::Array(items.iter().map(to_json_value).collect()),
        Value::Map(map) => {
            let object: serde_json::Map<String, Json> = map
                .iter()
                .map(|(k, v)| (k.clone(), to_json_value(v)))
                .collect();
            if map.keys().any(|k| k.starts_with('$')) {
                json!({ MAP: object })
            } else {
                Json::Object(object)
            }
        }
        Value::IMap(map) => {
            let object: serde_json::Map<String, Json> = map
                .iter()
                .map(|(k, v)| (k.to_string(), to_json_value(v)))
                .collect();
            json!({ IMAP: object })
        }
    }
}

pub fn from_json_value(json: &Json) -> Result<RpcValue> {
    value_from_json(json, 0)
}

/// `depth` counts the containers around `json`.
fn value_from_json(json: &Json, depth: usize) -> Result<RpcValue> {
    let value = match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => number_to_value(n)?,
        Json::String(s) => Value::String(s.clone()),
        Json::Array(items) => {
            let depth = enter(depth)?;
            Value::List(
                items
                    .iter()
                    .map(|item| value_from_json(item, depth))
                    .collect::<Result<List>>()?,
            )
        }
        Json::Object(object) => return object_to_value(object, depth),
    };
    Ok(RpcValue::new(value))
}

fn enter(depth: usize) -> Result<usize> {
    let depth = depth + 1;
    if depth > CodecConfig::MAX_NESTING_DEPTH {
        return Err(malformed(format!(
            "nesting depth exceeds {}",
            CodecConfig::MAX_NESTING_DEPTH
        )));
    }
    Ok(depth)
}

fn number_to_value(n: &Number) -> Result<Value> {
    if let Some(i) = n.as_i64() {
        Ok(Value::Int(i))
    } else if let Some(u) = n.as_u64() {
        Ok(Value::UInt(u))
    } else if let Some(f) = n.as_f64() {
        Ok(Value::Double(f))
    } else {
        Err(malformed(format!("unsupported number {}", n)))
    }
}

fn object_to_value(object: &serde_json::Map<String, Json>, depth: usize) -> Result<RpcValue> {
    if object.len() == 2 {
        if let (Some(meta), Some(value)) = (object.get(META), object.get(VALUE)) {
            let mut value = value_from_json(value, depth)?;
            if value.meta().is_some() {
                return Err(malformed("metadata on metadata"));
            }
            value.set_meta(Some(meta_from_json(meta, depth)?));
            return Ok(value);
        }
    }
    if object.len() == 1 {
        if let Some((key, inner)) = object.iter().next() {
            if key.starts_with('$') {
                return wrapped_to_value(key, inner, depth).map(RpcValue::new);
            }
        }
    }
    plain_map(object, depth).map(|m| RpcValue::new(Value::Map(m)))
}

fn wrapped_to_value(key: &str, inner: &Json, depth: usize) -> Result<Value> {
    match key {
        UINT => inner
            .as_u64()
            .map(Value::UInt)
            .ok_or_else(|| malformed("$uint expects a non-negative integer")),
        DECIMAL => {
            let parts = inner
                .as_array()
                .filter(|a| a.len() == 2)
                .ok_or_else(|| malformed("$decimal expects [mantissa, exponent]"))?;
            let mantissa = parts[0]
                .as_i64()
                .ok_or_else(|| malformed("$decimal mantissa must be an integer"))?;
            let exponent = parts[1]
                .as_i64()
                .and_then(|e| i32::try_from(e).ok())
                .ok_or_else(|| malformed("$decimal exponent must be an integer"))?;
            Ok(Value::Decimal(Decimal::new(mantissa, exponent)))
        }
        DATETIME => inner
            .as_str()
            .and_then(DateTime::parse_iso)
            .map(Value::DateTime)
            .ok_or_else(|| malformed("$datetime expects an ISO-8601 string")),
        BLOB => inner
            .as_str()
            .and_then(|s| hex::decode(s).ok())
            .map(Value::Blob)
            .ok_or_else(|| malformed("$blob expects a hex string")),
        DOUBLE => match inner.as_str() {
            Some("nan") => Ok(Value::Double(f64::NAN)),
            Some("inf") => Ok(Value::Double(f64::INFINITY)),
            Some("-inf") => Ok(Value::Double(f64::NEG_INFINITY)),
            _ => Err(malformed("$double expects nan, inf or -inf")),
        },
        IMAP => {
            let object = inner
                .as_object()
                .ok_or_else(|| malformed("$imap expects an object"))?;
            let depth = enter(depth)?;
            let mut map = IMap::new();
            for (k, v) in object {
                let key: i64 = k
                    .parse()
                    .map_err(|_| malformed(format!("$imap key '{}' is not an integer", k)))?;
                map.insert(key, value_from_json(v, depth)?);
            }
            Ok(Value::IMap(map))
        }
        MAP => inner
            .as_object()
            .ok_or_else(|| malformed("$map expects an object"))
            .and_then(|object| plain_map(object, depth))
            .map(Value::Map),
        // Unknown `$` keys are ordinary single-entry maps.
        _ => {
            let mut map = Map::new();
            map.insert(key.to_string(), value_from_json(inner, enter(depth)?)?);
            Ok(Value::Map(map))
        }
    }
}

fn plain_map(object: &serde_json::Map<String, Json>, depth: usize) -> Result<Map> {
    let depth = enter(depth)?;
    object
        .iter()
        .map(|(k, v)| Ok((k.clone(), value_from_json(v, depth)?)))
        .collect()
}

fn meta_from_json(json: &Json, depth: usize) -> Result<MetaData> {
    let entries = json
        .as_array()
        .ok_or_else(|| malformed("$meta expects a list of [key, value] pairs"))?;
    let mut meta = MetaData::new();
    for entry in entries {
        let pair = entry
            .as_array()
            .filter(|p| p.len() == 2)
            .ok_or_else(|| malformed("$meta entry must be [key, value]"))?;
        let key = match &pair[0] {
            Json::String(s) => MetaKey::Str(s.clone()),
            other => MetaKey::Int(
                other
                    .as_i64()
                    .ok_or_else(|| malformed("$meta key must be an integer or a string"))?,
            ),
        };
        meta.insert(key, value_from_json(&pair[1], enter(depth)?)?);
    }
    Ok(meta)
}

fn malformed(message: impl Into<String>) -> ChainPackError {
    ChainPackError::malformed(message, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_values_stay_native() {
        let mut map = Map::new();
        map.insert("n".to_string(), RpcValue::from(-3));
        map.insert("s".to_string(), RpcValue::from("x"));
        map.insert("d".to_string(), RpcValue::from(0.5));
        let value = RpcValue::from(map);
        assert_eq!(to_json(&value), r#"{"d":0.5,"n":-3,"s":"x"}"#);
        assert_eq!(from_json(&to_json(&value)).unwrap(), value);
    }

    #[test]
    fn test_wrapped_values() {
        assert_eq!(to_json(&RpcValue::from(7u64)), r#"{"$uint":7}"#);
        assert_eq!(
            to_json(&RpcValue::from(Decimal::new(12345, -2))),
            r#"{"$decimal":[12345,-2]}"#
        );
        assert_eq!(to_json(&RpcValue::from(f64::INFINITY)), r#"{"$double":"inf"}"#);
        let imap = RpcValue::from(IMap::from([(1, RpcValue::from(true))]));
        assert_eq!(to_json(&imap), r#"{"$imap":{"1":true}}"#);
        assert_eq!(from_json(r#"{"$imap":{"1":true}}"#).unwrap(), imap);
    }

    #[test]
    fn test_dollar_keyed_map_is_escaped() {
        let mut map = Map::new();
        map.insert("$uint".to_string(), RpcValue::from(1));
        let value = RpcValue::from(map);
        let text = to_json(&value);
        assert_eq!(text, r#"{"$map":{"$uint":1}}"#);
        assert_eq!(from_json(&text).unwrap(), value);
    }

    #[test]
    fn test_meta_roundtrip() {
        let mut meta = MetaData::with_meta_type(0, 1);
        meta.insert("unit", "V");
        let value = RpcValue::from(IMap::from([(1, RpcValue::from("ping"))])).with_meta(meta);
        let text = to_json(&value);
        assert!(text.contains(r#""$meta":[[1,1],["unit","V"]]"#));
        assert_eq!(from_json(&text).unwrap(), value);
    }

    #[test]
    fn test_large_integer_decodes_as_uint() {
        assert_eq!(
            from_json("18446744073709551615").unwrap(),
            RpcValue::from(u64::MAX)
        );
    }

    #[test]
    fn test_bad_wrappers_are_malformed() {
        assert!(from_json(r#"{"$uint":-1}"#).is_err());
        assert!(from_json(r#"{"$blob":"zz"}"#).is_err());
        assert!(from_json(r#"{"$decimal":[1]}"#).is_err());
    }

    fn nested_imaps(depth: usize) -> RpcValue {
        let mut value = RpcValue::from(1);
        for _ in 0..depth {
            value = RpcValue::from(IMap::from([(1, value)]));
        }
        value
    }

    #[test]
    fn test_deep_values_roundtrip() {
        let value = nested_imaps(200);
        assert_eq!(from_json(&to_json(&value)).unwrap(), value);

        let deepest = nested_imaps(CodecConfig::MAX_NESTING_DEPTH);
        assert_eq!(from_json(&to_json(&deepest)).unwrap(), deepest);
    }

    #[test]
    fn test_nesting_limit_is_enforced() {
        let too_deep = nested_imaps(CodecConfig::MAX_NESTING_DEPTH + 1);
        assert!(from_json(&to_json(&too_deep)).is_err());

        let brackets = "[".repeat(100_000) + &"]".repeat(100_000);
        assert!(from_json(&brackets).is_err());
    }

    #[test]
    fn test_brackets_inside_strings_do_not_count() {
        let text = format!(r#"["{}"]"#, "[".repeat(10_000));
        assert_eq!(
            from_json(&text).unwrap().as_list().map(|l| l.len()),
            Some(1)
        );
    }
}
