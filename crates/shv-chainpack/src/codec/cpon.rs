//! Cpon, the human-readable text form of ChainPack values.
//!
//! ```text
//! null true false            Null, Bool
//! -12 0x1f                   Int
//! 12u                        UInt
//! 1.5 1e300 nan inf -inf     Double
//! 123.45n 12e2n              Decimal
//! "a\n\x01\u00e9"            String
//! x"0a1b" b"\x0a\x1b"        Blob
//! d"2018-02-02T00:00:00Z"    DateTime
//! [1,2]  {"k":1}  i{1:2}     List, Map, IMap
//! <1:1,"unit":"V">value      MetaData prefix
//! ```
//!
//! Commas, colons, whitespace and `//` / `/* */` comments between tokens are
//! insignificant.

use crate::config::CodecConfig;
use crate::error::{ChainPackError, Result};
use crate::value::{DateTime, Decimal, IMap, List, Map, MetaData, MetaKey, RpcValue, Value};
use std::fmt::Write as _;

/// Compact single-line Cpon.
pub fn to_cpon(value: &RpcValue) -> String {
    let mut writer = CponWriter::new(None);
    writer.write(value);
    writer.finish()
}

/// Multi-line Cpon, one container item per line.
pub fn to_cpon_pretty(value: &RpcValue) -> String {
    let mut writer = CponWriter::new(Some(CodecConfig::CPON_INDENT));
    writer.write(value);
    writer.finish()
}

/// Parse exactly one value; anything but insignificant text afterwards is
/// malformed.
pub fn from_cpon(text: &str) -> Result<RpcValue> {
    let mut reader = CponReader::new(text.as_bytes());
    let value = reader.read()?;
    reader.skip_insignificant()?;
    if reader.pos < reader.src.len() {
        return Err(ChainPackError::malformed("trailing characters", reader.pos));
    }
    Ok(value)
}

pub struct CponWriter<'a> {
    out: String,
    indent: Option<&'a str>,
    level: usize,
}

impl<'a> CponWriter<'a> {
    pub fn new(indent: Option<&'a str>) -> Self {
        Self {
            out: String::new(),
            indent,
            level: 0,
        }
    }

    pub fn finish(self) -> String {
        self.out
    }

    pub fn write(&mut self, value: &RpcValue) {
        if let Some(meta) = value.meta() {
            self.write_meta(meta);
        }
        self.write_value(value.value());
    }

    fn write_meta(&mut self, meta: &MetaData) {
        self.out.push('<');
        for (i, (key, value)) in meta.iter().enumerate() {
            if i > 0 {
                self.out.push(',');
            }
            match key {
                MetaKey::Int(k) => {
                    let _ = write!(self.out, "{}", k);
                }
                MetaKey::Str(k) => write_string(&mut self.out, k),
            }
            self.out.push(':');
            self.write(value);
        }
        self.out.push('>');
    }

    fn write_value(&mut self, value: &Value) {
        match value {
            Value::Null => self.out.push_str("null"),
            Value::Bool(b) => self.out.push_str(if *b { "true" } else { "false" }),
            Value::Int(n) => {
                let _ = write!(self.out, "{}", n);
            }
            Value::UInt(n) => {
                let _ = write!(self.out, "{}u", n);
            }
            Value::Double(d) => write_double(&mut self.out, *d),
            Value::Decimal(d) => {
                let _ = write!(self.out, "{}n", d);
            }
            Value::DateTime(dt) => {
                let _ = write!(self.out, "d\"{}\"", dt.to_iso_string());
            }
            Value::String(s) => write_string(&mut self.out, s),
            Value::Blob(b) => {
                let _ = write!(self.out, "x\"{}\"", hex::encode(b));
            }
            Value::List(items) => {
                self.out.push('[');
                for (i, item) in items.iter().enumerate() {
                    self.item_separator(i);
                    self.write(item);
                }
                self.close(!items.is_empty(), ']');
            }
            Value::Map(map) => {
                self.out.push('{');
                for (i, (key, item)) in map.iter().enumerate() {
                    self.item_separator(i);
                    write_string(&mut self.out, key);
                    self.out.push(':');
                    self.write(item);
                }
                self.close(!map.is_empty(), '}');
            }
            Value::IMap(map) => {
                self.out.push_str("i{");
                for (i, (key, item)) in map.iter().enumerate() {
                    self.item_separator(i);
                    let _ = write!(self.out, "{}:", key);
                    self.write(item);
                }
                self.close(!map.is_empty(), '}');
            }
        }
    }

    fn item_separator(&mut self, index: usize) {
        if index > 0 {
            self.out.push(',');
        }
        if let Some(indent) = self.indent {
            if index == 0 {
                self.level += 1;
            }
            self.out.push('\n');
            for _ in 0..self.level {
                self.out.push_str(indent);
            }
        }
    }

    fn close(&mut self, had_items: bool, bracket: char) {
        if let (Some(indent), true) = (self.indent, had_items) {
            self.level -= 1;
            self.out.push('\n');
            for _ in 0..self.level {
                self.out.push_str(indent);
            }
        }
        self.out.push(bracket);
    }
}

fn write_double(out: &mut String, d: f64) {
    if d.is_nan() {
        out.push_str("nan");
    } else if d.is_infinite() {
        out.push_str(if d > 0.0 { "inf" } else { "-inf" });
    } else {
        // Debug formatting always carries a '.' or an exponent.
        let _ = write!(out, "{:?}", d);
    }
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\0' => out.push_str("\\0"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

pub struct CponReader<'a> {
    src: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> CponReader<'a> {
    pub fn new(src: &'a [u8]) -> Self {
        Self {
            src,
            pos: 0,
            depth: 0,
        }
    }

    pub fn read(&mut self) -> Result<RpcValue> {
        self.skip_insignificant()?;
        if self.peek() == Some(b'<') {
            self.pos += 1;
            self.enter()?;
            let meta = self.read_meta_body()?;
            self.skip_insignificant()?;
            if self.peek() == Some(b'<') {
                return Err(ChainPackError::malformed("metadata on metadata", self.pos));
            }
            let value = self.read_value()?;
            self.leave();
            return Ok(RpcValue::new(value).with_meta(meta));
        }
        Ok(RpcValue::new(self.read_value()?))
    }

    fn read_meta_body(&mut self) -> Result<MetaData> {
        let mut meta = MetaData::new();
        loop {
            self.skip_insignificant()?;
            if self.eat(b'>') {
                return Ok(meta);
            }
            let key_at = self.pos;
            let key = self.read()?;
            let key = match key.value() {
                Value::String(s) => MetaKey::Str(s.clone()),
                _ => MetaKey::Int(key.as_int().ok_or_else(|| {
                    ChainPackError::malformed("metadata key must be Int or String", key_at)
                })?),
            };
            let value = self.read()?;
            meta.insert(key, value);
        }
    }

    fn read_value(&mut self) -> Result<Value> {
        self.skip_insignificant()?;
        let Some(c) = self.peek() else {
            return Err(self.error("unexpected end of input"));
        };
        match c {
            b'[' => {
                self.pos += 1;
                self.enter()?;
                let mut items = List::new();
                loop {
                    self.skip_insignificant()?;
                    if self.eat(b']') {
                        break;
                    }
                    items.push(self.read()?);
                }
                self.leave();
                Ok(Value::List(items))
            }
            b'{' => {
                self.pos += 1;
                self.enter()?;
                let mut map = Map::new();
                loop {
                    self.skip_insignificant()?;
                    if self.eat(b'}') {
                        break;
                    }
                    let key_at = self.pos;
                    let key = match self.read()?.into_value() {
                        Value::String(s) => s,
                        other => {
                            return Err(ChainPackError::malformed(
                                format!("Map key must be String, got {}", other.type_name()),
                                key_at,
                            ))
                        }
                    };
                    let value = self.read()?;
                    map.insert(key, value);
                }
                self.leave();
                Ok(Value::Map(map))
            }
            b'i' if self.src.get(self.pos + 1) == Some(&b'{') => {
                self.pos += 2;
                self.enter()?;
                let mut map = IMap::new();
                loop {
                    self.skip_insignificant()?;
                    if self.eat(b'}') {
                        break;
                    }
                    let key_at = self.pos;
                    let key = self
                        .read()?
                        .as_int()
                        .ok_or_else(|| ChainPackError::malformed("IMap key must be Int", key_at))?;
                    let value = self.read()?;
                    map.insert(key, value);
                }
                self.leave();
                Ok(Value::IMap(map))
            }
            b'"' => Ok(Value::String(self.read_string()?)),
            b'x' if self.src.get(self.pos + 1) == Some(&b'"') => {
                self.pos += 1;
                let at = self.pos;
                let text = self.read_string()?;
                hex::decode(text.as_bytes())
                    .map(Value::Blob)
                    .map_err(|_| ChainPackError::malformed("invalid hex blob", at))
            }
            b'b' if self.src.get(self.pos + 1) == Some(&b'"') => {
                self.pos += 1;
                Ok(Value::Blob(self.read_quoted_bytes()?))
            }
            b'd' if self.src.get(self.pos + 1) == Some(&b'"') => {
                self.pos += 1;
                let at = self.pos;
                let text = self.read_string()?;
                DateTime::parse_iso(&text)
                    .map(Value::DateTime)
                    .ok_or_else(|| ChainPackError::malformed("invalid DateTime", at))
            }
            b'-' | b'0'..=b'9' => self.read_number(),
            b'a'..=b'z' => self.read_keyword(),
            _ => Err(self.error(format!("unexpected character '{}'", c as char))),
        }
    }

    fn read_keyword(&mut self) -> Result<Value> {
        let start = self.pos;
        while matches!(self.peek(), Some(b'a'..=b'z')) {
            self.pos += 1;
        }
        match &self.src[start..self.pos] {
            b"null" => Ok(Value::Null),
            b"true" => Ok(Value::Bool(true)),
            b"false" => Ok(Value::Bool(false)),
            b"nan" => Ok(Value::Double(f64::NAN)),
            b"inf" => Ok(Value::Double(f64::INFINITY)),
            _ => Err(ChainPackError::malformed("unknown keyword", start)),
        }
    }

    fn read_number(&mut self) -> Result<Value> {
        let start = self.pos;
        let negative = self.eat(b'-');
        if self.src[self.pos..].starts_with(b"inf") {
            self.pos += 3;
            return Ok(Value::Double(f64::NEG_INFINITY));
        }

        if self.src[self.pos..].starts_with(b"0x") {
            self.pos += 2;
            let digits_at = self.pos;
            while matches!(self.peek(), Some(c) if c.is_ascii_hexdigit()) {
                self.pos += 1;
            }
            let digits = ascii(&self.src[digits_at..self.pos]);
            let magnitude = u128::from_str_radix(digits, 16)
                .map_err(|_| ChainPackError::malformed("invalid hex number", start))?;
            let unsigned = self.eat(b'u');
            return integer_value(magnitude, negative, unsigned, start);
        }

        let int_at = self.pos;
        self.skip_digits();
        let int_digits = ascii(&self.src[int_at..self.pos]);
        let mut frac_digits = "";
        if self.eat(b'.') {
            let frac_at = self.pos;
            self.skip_digits();
            frac_digits = ascii(&self.src[frac_at..self.pos]);
        }
        let mut exponent: Option<i64> = None;
        if matches!(self.peek(), Some(b'e' | b'E')) {
            self.pos += 1;
            let exp_at = self.pos;
            if matches!(self.peek(), Some(b'+' | b'-')) {
                self.pos += 1;
            }
            self.skip_digits();
            exponent = Some(
                ascii(&self.src[exp_at..self.pos])
                    .parse()
                    .map_err(|_| ChainPackError::malformed("invalid exponent", exp_at))?,
            );
        }
        if int_digits.is_empty() && frac_digits.is_empty() {
            return Err(ChainPackError::malformed("invalid number", start));
        }
        let has_point = self.src[int_at..self.pos].contains(&b'.');

        if self.eat(b'n') {
            let digits = format!("{}{}", int_digits, frac_digits);
            let magnitude: u128 = digits
                .parse()
                .map_err(|_| ChainPackError::malformed("Decimal mantissa overflow", start))?;
            let mantissa = signed(magnitude, negative)
                .ok_or_else(|| ChainPackError::malformed("Decimal mantissa overflow", start))?;
            let exponent = exponent
                .unwrap_or(0)
                .checked_sub(frac_digits.len() as i64)
                .and_then(|e| i32::try_from(e).ok())
                .ok_or_else(|| ChainPackError::malformed("Decimal exponent overflow", start))?;
            return Ok(Value::Decimal(Decimal::new(mantissa, exponent)));
        }

        if has_point || exponent.is_some() {
            return ascii(&self.src[start..self.pos])
                .parse::<f64>()
                .map(Value::Double)
                .map_err(|_| ChainPackError::malformed("invalid Double", start));
        }

        let magnitude: u128 = int_digits
            .parse()
            .map_err(|_| ChainPackError::malformed("integer overflow", start))?;
        let unsigned = self.eat(b'u');
        integer_value(magnitude, negative, unsigned, start)
    }

    fn read_string(&mut self) -> Result<String> {
        let at = self.pos;
        let bytes = self.read_quoted_bytes()?;
        String::from_utf8(bytes).map_err(|_| ChainPackError::malformed("String is not UTF-8", at))
    }

    /// Reads `"..."` starting at the opening quote, resolving escapes.
    fn read_quoted_bytes(&mut self) -> Result<Vec<u8>> {
        if !self.eat(b'"') {
            return Err(self.error("expected '\"'"));
        }
        let mut out = Vec::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(self.error("unterminated string"));
            };
            self.pos += 1;
            match c {
                b'"' => return Ok(out),
                b'\\' => {
                    let Some(e) = self.peek() else {
                        return Err(self.error("unterminated escape"));
                    };
                    self.pos += 1;
                    match e {
                        b'\\' => out.push(b'\\'),
                        b'"' => out.push(b'"'),
                        b'n' => out.push(b'\n'),
                        b'r' => out.push(b'\r'),
                        b't' => out.push(b'\t'),
                        b'0' => out.push(0),
                        b'x' => out.push(self.read_hex_escape(2)? as u8),
                        b'u' => {
                            let at = self.pos;
                            let code = self.read_hex_escape(4)?;
                            let ch = char::from_u32(code)
                                .ok_or_else(|| ChainPackError::malformed("invalid \\u escape", at))?;
                            let mut buf = [0u8; 4];
                            out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                        }
                        other => out.push(other),
                    }
                }
                c => out.push(c),
            }
        }
    }

    fn read_hex_escape(&mut self, len: usize) -> Result<u32> {
        let at = self.pos;
        let digits = self
            .src
            .get(at..at + len)
            .ok_or_else(|| ChainPackError::malformed("truncated escape", at))?;
        let value = u32::from_str_radix(ascii(digits), 16)
            .map_err(|_| ChainPackError::malformed("invalid hex escape", at))?;
        self.pos += len;
        Ok(value)
    }

    /// Skips whitespace, separators and comments.
    pub fn skip_insignificant(&mut self) -> Result<()> {
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\n' | b'\r' | b',' | b':') => self.pos += 1,
                Some(b'/') => match self.src.get(self.pos + 1) {
                    Some(b'/') => {
                        while !matches!(self.peek(), None | Some(b'\n')) {
                            self.pos += 1;
                        }
                    }
                    Some(b'*') => {
                        let at = self.pos;
                        self.pos += 2;
                        loop {
                            if self.pos + 1 >= self.src.len() {
                                return Err(ChainPackError::malformed("unterminated comment", at));
                            }
                            if &self.src[self.pos..self.pos + 2] == b"*/" {
                                self.pos += 2;
                                break;
                            }
                            self.pos += 1;
                        }
                    }
                    _ => return Err(self.error("unexpected '/'")),
                },
                _ => return Ok(()),
            }
        }
    }

    fn skip_digits(&mut self) {
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn eat(&mut self, c: u8) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > CodecConfig::MAX_NESTING_DEPTH {
            return Err(self.error("nesting too deep"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn error(&self, message: impl Into<String>) -> ChainPackError {
        ChainPackError::malformed(message, self.pos)
    }
}

/// The slices handed in here only ever contain ASCII matched by the scanner.
fn ascii(bytes: &[u8]) -> &str {
    std::str::from_utf8(bytes).unwrap_or_default()
}

fn signed(magnitude: u128, negative: bool) -> Option<i64> {
    let value = if negative {
        -(i128::try_from(magnitude).ok()?)
    } else {
        i128::try_from(magnitude).ok()?
    };
    i64::try_from(value).ok()
}

fn integer_value(magnitude: u128, negative: bool, unsigned: bool, at: usize) -> Result<Value> {
    if unsigned {
        if negative {
            return Err(ChainPackError::malformed("negative UInt", at));
        }
        return u64::try_from(magnitude)
            .map(Value::UInt)
            .map_err(|_| ChainPackError::malformed("UInt overflow", at));
    }
    if let Some(n) = signed(magnitude, negative) {
        return Ok(Value::Int(n));
    }
    // Positive literals beyond i64 are still representable as UInt.
    match (negative, u64::try_from(magnitude)) {
        (false, Ok(n)) => Ok(Value::UInt(n)),
        _ => Err(ChainPackError::malformed("integer overflow", at)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> RpcValue {
        from_cpon(text).unwrap()
    }

    #[test]
    fn test_scalars() {
        assert_eq!(parse("null"), RpcValue::null());
        assert_eq!(parse("true"), RpcValue::from(true));
        assert_eq!(parse("-12"), RpcValue::from(-12));
        assert_eq!(parse("0x1f"), RpcValue::from(31));
        assert_eq!(parse("12u"), RpcValue::from(12u64));
        assert_eq!(parse("1.5"), RpcValue::from(1.5));
        assert_eq!(parse("1e300"), RpcValue::from(1e300));
        assert_eq!(parse("-inf"), RpcValue::from(f64::NEG_INFINITY));
        assert_eq!(parse("123.45n"), RpcValue::from(Decimal::new(12345, -2)));
        assert_eq!(parse("12e2n"), RpcValue::from(Decimal::new(12, 2)));
    }

    #[test]
    fn test_write_scalars() {
        assert_eq!(to_cpon(&RpcValue::from(12u64)), "12u");
        assert_eq!(to_cpon(&RpcValue::from(1.0)), "1.0");
        assert_eq!(to_cpon(&RpcValue::from(f64::NAN)), "nan");
        assert_eq!(to_cpon(&RpcValue::from(Decimal::new(5, -3))), "0.005n");
        assert_eq!(to_cpon(&RpcValue::from(vec![0x0au8, 0x1b])), "x\"0a1b\"");
    }

    #[test]
    fn test_string_escapes() {
        let value = RpcValue::from("a\"b\\c\n\u{1}é");
        let text = to_cpon(&value);
        assert_eq!(text, "\"a\\\"b\\\\c\\n\\x01é\"");
        assert_eq!(parse(&text), value);
        assert_eq!(parse("\"\\u00e9\""), RpcValue::from("é"));
    }

    #[test]
    fn test_containers_and_meta() {
        let text = r#"<1:1,"unit":"V">i{1:"login",2:i{10:"alice"}}"#;
        let value = parse(text);
        assert_eq!(value.meta().and_then(|m| m.meta_type_id()), Some(1));
        assert_eq!(
            value.meta().and_then(|m| m.get("unit")).and_then(RpcValue::as_str),
            Some("V")
        );
        assert_eq!(to_cpon(&value), text);
    }

    #[test]
    fn test_comments_and_trailing_commas() {
        let value = parse("/* list */ [1, 2, // two\n 3,]");
        assert_eq!(
            value,
            RpcValue::from(vec![RpcValue::from(1), RpcValue::from(2), RpcValue::from(3)])
        );
    }

    #[test]
    fn test_datetime_and_blob_forms() {
        let value = parse(r#"[d"2018-02-02T00:00:00Z", b"\x0aA"]"#);
        let list = value.as_list().unwrap();
        assert_eq!(
            list[0].as_datetime(),
            Some(DateTime::from_epoch_msec(CodecConfig::SHV_EPOCH_MSEC))
        );
        assert_eq!(list[1].as_blob(), Some(&[0x0a, b'A'][..]));
    }

    #[test]
    fn test_pretty_output_parses_back() {
        let value = parse(r#"{"a":[1,2,{}],"b":i{1:[]}}"#);
        let pretty = to_cpon_pretty(&value);
        assert!(pretty.contains('\n'));
        assert_eq!(parse(&pretty), value);
    }

    #[test]
    fn test_errors() {
        assert!(from_cpon("[1, 2").is_err());
        assert!(from_cpon("\"open").is_err());
        assert!(from_cpon("1 2").is_err());
        assert!(from_cpon("-1u").is_err());
        assert!(from_cpon("{1:2}").is_err());
        assert!(from_cpon("maybe").is_err());
    }

    #[test]
    fn test_integer_edges() {
        assert_eq!(parse("-9223372036854775808"), RpcValue::from(i64::MIN));
        assert_eq!(parse("18446744073709551615"), RpcValue::from(u64::MAX));
        assert!(from_cpon("18446744073709551616").is_err());
    }

    #[test]
    fn test_extreme_decimal_exponents_stay_compact() {
        let value = parse("1e-200000000n");
        assert_eq!(value, RpcValue::from(Decimal::new(1, -200_000_000)));
        let text = to_cpon(&value);
        assert_eq!(text, "1e-200000000n");
        assert_eq!(parse(&text), value);

        let value = RpcValue::from(Decimal::new(-42, i32::MIN));
        assert_eq!(parse(&to_cpon(&value)), value);
    }
}
