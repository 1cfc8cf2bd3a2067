//! ChainPack binary codec.
//!
//! Every value starts with one type byte. Small non-negative integers are
//! packed into that byte directly (`0..=63` UInt, `64..=127` Int), everything
//! else is a tag followed by its data. Containers are terminated by
//! [`tag::TERM`]; metadata is a `META_MAP` container immediately preceding the
//! value it decorates.
//!
//! Integers use a variable-length big-endian encoding whose length is carried
//! in the leading bits of the first byte:
//!
//! ```text
//! 0xxxxxxx                      7 bits
//! 10xxxxxx +1 byte             14 bits
//! 110xxxxx +2 bytes            21 bits
//! 1110xxxx +3 bytes            28 bits
//! 1111nnnn +(n+4) bytes        (n+4)*8 bits
//! ```
//!
//! Signed integers are sign-magnitude with the sign in the highest data bit.

use crate::config::CodecConfig;
use crate::error::{ChainPackError, Result};
use crate::value::{DateTime, Decimal, IMap, List, Map, MetaData, MetaKey, RpcValue, Value};
use std::io::{self, Read, Write};

/// Type bytes.
pub mod tag {
    pub const TINY_INT_BASE: u8 = 64;
    pub const NULL: u8 = 128;
    pub const UINT: u8 = 129;
    pub const INT: u8 = 130;
    pub const DOUBLE: u8 = 131;
    pub const BLOB: u8 = 133;
    pub const STRING: u8 = 134;
    pub const DATETIME_EPOCH_DEPR: u8 = 135;
    pub const LIST: u8 = 136;
    pub const MAP: u8 = 137;
    pub const IMAP: u8 = 138;
    pub const META_MAP: u8 = 139;
    pub const DECIMAL: u8 = 140;
    pub const DATETIME: u8 = 141;
    pub const CSTRING: u8 = 142;
    pub const FALSE: u8 = 253;
    pub const TRUE: u8 = 254;
    pub const TERM: u8 = 255;
}

/// Encode a value into a fresh buffer.
pub fn to_chainpack(value: &RpcValue) -> Vec<u8> {
    let mut out = Vec::new();
    // Writing into a Vec cannot fail.
    let _ = ChainPackWriter::new(&mut out).write(value);
    out
}

/// Decode exactly one value; trailing bytes are malformed input.
pub fn from_chainpack(data: &[u8]) -> Result<RpcValue> {
    let mut reader = ChainPackReader::new(data);
    let value = reader.read()?;
    if reader.position() != data.len() {
        return Err(ChainPackError::malformed(
            format!("{} trailing bytes", data.len() - reader.position()),
            reader.position(),
        ));
    }
    Ok(value)
}

/// Total byte count (first byte included) of the unsigned integer data whose
/// first byte is `head`.
pub fn uint_data_size(head: u8) -> usize {
    if head & 0x80 == 0 {
        1
    } else if head & 0x40 == 0 {
        2
    } else if head & 0x20 == 0 {
        3
    } else if head & 0x10 == 0 {
        4
    } else {
        usize::from(head & 0x0f) + 5
    }
}

/// Append unsigned integer data (no type byte) to `out`.
pub fn write_uint_data<W: Write>(out: &mut W, n: u64) -> io::Result<()> {
    let n = u128::from(n);
    write_uint_data_bits(out, n, significant_bits(n))
}

fn significant_bits(n: u128) -> u32 {
    128 - n.leading_zeros()
}

fn bytes_needed(bit_len: u32) -> usize {
    if bit_len <= 28 {
        (bit_len.max(1) - 1) as usize / 7 + 1
    } else {
        (bit_len - 1) as usize / 8 + 2
    }
}

/// Position of the sign bit for a value of `bit_len` significant bits.
fn sign_bit_position(bit_len: u32) -> u32 {
    let byte_cnt = bytes_needed(bit_len) as u32;
    if bit_len <= 28 {
        byte_cnt * 7 - 1
    } else {
        (byte_cnt - 1) * 8 - 1
    }
}

fn write_uint_data_bits<W: Write>(out: &mut W, mut n: u128, bit_len: u32) -> io::Result<()> {
    let byte_cnt = bytes_needed(bit_len);
    let mut bytes = [0u8; 20];
    for i in (0..byte_cnt).rev() {
        bytes[i] = (n & 0xff) as u8;
        n >>= 8;
    }
    if bit_len <= 28 {
        let mask = (0xf0u32 << (4 - byte_cnt)) as u8;
        bytes[0] &= !mask;
        bytes[0] |= mask << 1;
    } else {
        bytes[0] = 0xf0 | (byte_cnt - 5) as u8;
    }
    out.write_all(&bytes[..byte_cnt])
}

fn write_int_data<W: Write>(out: &mut W, n: i64) -> io::Result<()> {
    let mut magnitude = u128::from(n.unsigned_abs());
    let bit_len = significant_bits(magnitude) + 1;
    if n < 0 {
        magnitude |= 1u128 << sign_bit_position(bit_len);
    }
    write_uint_data_bits(out, magnitude, bit_len)
}

/// Streaming ChainPack encoder.
pub struct ChainPackWriter<W: Write> {
    out: W,
}

impl<W: Write> ChainPackWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn write(&mut self, value: &RpcValue) -> io::Result<()> {
        if let Some(meta) = value.meta() {
            self.write_meta(meta)?;
        }
        self.write_value(value.value())
    }

    fn write_meta(&mut self, meta: &MetaData) -> io::Result<()> {
        self.put(tag::META_MAP)?;
        for (key, value) in meta.iter() {
            match key {
                MetaKey::Int(k) => self.write_int(*k)?,
                MetaKey::Str(k) => self.write_string(k)?,
            }
            self.write(value)?;
        }
        self.put(tag::TERM)
    }

    fn write_value(&mut self, value: &Value) -> io::Result<()> {
        match value {
            Value::Null => self.put(tag::NULL),
            Value::Bool(b) => self.put(if *b { tag::TRUE } else { tag::FALSE }),
            Value::Int(n) => self.write_int(*n),
            Value::UInt(n) => {
                if *n < 64 {
                    self.put(*n as u8)
                } else {
                    self.put(tag::UINT)?;
                    write_uint_data(&mut self.out, *n)
                }
            }
            Value::Double(d) => {
                self.put(tag::DOUBLE)?;
                self.out.write_all(&d.to_le_bytes())
            }
            Value::Decimal(d) => {
                self.put(tag::DECIMAL)?;
                write_int_data(&mut self.out, d.mantissa())?;
                write_int_data(&mut self.out, i64::from(d.exponent()))
            }
            Value::DateTime(dt) => {
                self.put(tag::DATETIME)?;
                write_int_data(&mut self.out, pack_datetime(dt))
            }
            Value::String(s) => self.write_string(s),
            Value::Blob(b) => {
                self.put(tag::BLOB)?;
                write_uint_data(&mut self.out, b.len() as u64)?;
                self.out.write_all(b)
            }
            Value::List(items) => {
                self.put(tag::LIST)?;
                for item in items {
                    self.write(item)?;
                }
                self.put(tag::TERM)
            }
            Value::Map(map) => {
                self.put(tag::MAP)?;
                for (key, item) in map {
                    self.write_string(key)?;
                    self.write(item)?;
                }
                self.put(tag::TERM)
            }
            Value::IMap(map) => {
                self.put(tag::IMAP)?;
                for (key, item) in map {
                    self.write_int(*key)?;
                    self.write(item)?;
                }
                self.put(tag::TERM)
            }
        }
    }

    fn write_int(&mut self, n: i64) -> io::Result<()> {
        if (0..64).contains(&n) {
            self.put(tag::TINY_INT_BASE + n as u8)
        } else {
            self.put(tag::INT)?;
            write_int_data(&mut self.out, n)
        }
    }

    fn write_string(&mut self, s: &str) -> io::Result<()> {
        self.put(tag::STRING)?;
        write_uint_data(&mut self.out, s.len() as u64)?;
        self.out.write_all(s.as_bytes())
    }

    fn put(&mut self, byte: u8) -> io::Result<()> {
        self.out.write_all(&[byte])
    }
}

fn pack_datetime(dt: &DateTime) -> i64 {
    let mut msecs = dt.epoch_msec() - CodecConfig::SHV_EPOCH_MSEC;
    let offset = dt.utc_offset_quarters();
    let has_msec = msecs % 1000 != 0;
    if !has_msec {
        msecs /= 1000;
    }
    if offset != 0 {
        msecs <<= 7;
        msecs |= i64::from(offset) & 0x7f;
    }
    msecs <<= 2;
    if offset != 0 {
        msecs |= 1;
    }
    if !has_msec {
        msecs |= 2;
    }
    msecs
}

/// Streaming ChainPack decoder over any [`Read`].
pub struct ChainPackReader<R: Read> {
    input: R,
    peeked: Option<u8>,
    position: usize,
    depth: usize,
}

impl<R: Read> ChainPackReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            peeked: None,
            position: 0,
            depth: 0,
        }
    }

    /// Number of bytes consumed so far.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn read(&mut self) -> Result<RpcValue> {
        let head = self.next_byte()?;
        if head == tag::META_MAP {
            self.enter()?;
            let meta = self.read_meta_body()?;
            let at = self.position;
            let head = self.next_byte()?;
            if head == tag::META_MAP {
                return Err(ChainPackError::malformed("metadata on metadata", at));
            }
            let value = self.read_value(head)?;
            self.leave();
            return Ok(RpcValue::new(value).with_meta(meta));
        }
        Ok(RpcValue::new(self.read_value(head)?))
    }

    /// Unsigned integer data without a type byte.
    pub fn read_uint_data(&mut self) -> Result<u64> {
        let at = self.position;
        let (n, _) = self.read_uint_data_bits()?;
        u64::try_from(n).map_err(|_| ChainPackError::malformed("UInt overflow", at))
    }

    fn read_uint_data_bits(&mut self) -> Result<(u128, u32)> {
        let at = self.position;
        let head = self.next_byte()?;
        let (extra, first, bit_len) = if head & 0x80 == 0 {
            (0, head & 0x7f, 7)
        } else if head & 0x40 == 0 {
            (1, head & 0x3f, 14)
        } else if head & 0x20 == 0 {
            (2, head & 0x1f, 21)
        } else if head & 0x10 == 0 {
            (3, head & 0x0f, 28)
        } else {
            let extra = u32::from(head & 0x0f) + 4;
            (extra, 0, extra * 8)
        };
        if extra > 16 {
            return Err(ChainPackError::malformed("integer data too long", at));
        }
        let mut n = u128::from(first);
        for _ in 0..extra {
            n = (n << 8) | u128::from(self.next_byte()?);
        }
        Ok((n, bit_len))
    }

    fn read_int_data(&mut self) -> Result<i64> {
        let at = self.position;
        let (mut n, bit_len) = self.read_uint_data_bits()?;
        let sign_mask = 1u128 << (bit_len - 1);
        let negative = n & sign_mask != 0;
        n &= !sign_mask;
        let signed = if negative { -(n as i128) } else { n as i128 };
        i64::try_from(signed).map_err(|_| ChainPackError::malformed("Int overflow", at))
    }

    fn read_value(&mut self, head: u8) -> Result<Value> {
        let at = self.position.saturating_sub(1);
        let value = match head {
            0..=63 => Value::UInt(u64::from(head)),
            64..=127 => Value::Int(i64::from(head - tag::TINY_INT_BASE)),
            tag::NULL => Value::Null,
            tag::TRUE => Value::Bool(true),
            tag::FALSE => Value::Bool(false),
            tag::UINT => Value::UInt(self.read_uint_data()?),
            tag::INT => Value::Int(self.read_int_data()?),
            tag::DOUBLE => {
                let mut bytes = [0u8; 8];
                self.read_exact(&mut bytes)?;
                Value::Double(f64::from_le_bytes(bytes))
            }
            tag::DECIMAL => {
                let mantissa = self.read_int_data()?;
                let exp_at = self.position;
                let exponent = i32::try_from(self.read_int_data()?)
                    .map_err(|_| ChainPackError::malformed("Decimal exponent overflow", exp_at))?;
                Value::Decimal(Decimal::new(mantissa, exponent))
            }
            tag::DATETIME => {
                let packed = self.read_int_data()?;
                Value::DateTime(unpack_datetime(packed, at)?)
            }
            tag::DATETIME_EPOCH_DEPR => {
                let msecs = self.read_int_data()?;
                Value::DateTime(
                    DateTime::try_from_epoch_msec_tz(msecs, 0)
                        .ok_or_else(|| ChainPackError::malformed("DateTime out of range", at))?,
                )
            }
            tag::STRING => Value::String(self.read_string_body()?),
            tag::CSTRING => Value::String(self.read_cstring_body()?),
            tag::BLOB => {
                let len = self.read_length()?;
                Value::Blob(self.read_vec(len)?)
            }
            tag::LIST => {
                self.enter()?;
                let mut items = List::new();
                while !self.at_term()? {
                    items.push(self.read()?);
                }
                self.leave();
                Value::List(items)
            }
            tag::MAP => {
                self.enter()?;
                let mut map = Map::new();
                while !self.at_term()? {
                    let key_at = self.position;
                    let key = match self.read()?.into_value() {
                        Value::String(s) => s,
                        other => {
                            return Err(ChainPackError::malformed(
                                format!("Map key must be String, got {}", other.type_name()),
                                key_at,
                            ))
                        }
                    };
                    map.insert(key, self.read()?);
                }
                self.leave();
                Value::Map(map)
            }
            tag::IMAP => {
                self.enter()?;
                let mut map = IMap::new();
                while !self.at_term()? {
                    let key_at = self.position;
                    let key = self.read()?.as_int().ok_or_else(|| {
                        ChainPackError::malformed("IMap key must be Int", key_at)
                    })?;
                    map.insert(key, self.read()?);
                }
                self.leave();
                Value::IMap(map)
            }
            tag::META_MAP => {
                return Err(ChainPackError::malformed("unexpected metadata", at));
            }
            tag::TERM => return Err(ChainPackError::malformed("unexpected TERM", at)),
            other => {
                return Err(ChainPackError::malformed(
                    format!("unknown type byte {}", other),
                    at,
                ))
            }
        };
        Ok(value)
    }

    fn read_meta_body(&mut self) -> Result<MetaData> {
        let mut meta = MetaData::new();
        while !self.at_term()? {
            let key_at = self.position;
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
        Ok(meta)
    }

    fn read_string_body(&mut self) -> Result<String> {
        let at = self.position;
        let len = self.read_length()?;
        let data = self.read_vec(len)?;
        String::from_utf8(data).map_err(|_| ChainPackError::malformed("String is not UTF-8", at))
    }

    fn read_cstring_body(&mut self) -> Result<String> {
        let at = self.position;
        let mut data = Vec::new();
        loop {
            match self.next_byte()? {
                0 => break,
                b'\\' => match self.next_byte()? {
                    b'\\' => data.push(b'\\'),
                    b'0' => data.push(0),
                    other => data.push(other),
                },
                b => data.push(b),
            }
        }
        String::from_utf8(data).map_err(|_| ChainPackError::malformed("CString is not UTF-8", at))
    }

    fn read_length(&mut self) -> Result<usize> {
        let at = self.position;
        let len = self.read_uint_data()?;
        usize::try_from(len).map_err(|_| ChainPackError::malformed("length overflow", at))
    }

    /// Consumes the TERM byte when present.
    fn at_term(&mut self) -> Result<bool> {
        if self.peek_byte()? == tag::TERM {
            self.next_byte()?;
            return Ok(true);
        }
        Ok(false)
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > CodecConfig::MAX_NESTING_DEPTH {
            return Err(ChainPackError::malformed(
                "nesting too deep",
                self.position,
            ));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn peek_byte(&mut self) -> Result<u8> {
        if let Some(b) = self.peeked {
            return Ok(b);
        }
        let mut buf = [0u8; 1];
        self.fill(&mut buf)?;
        self.peeked = Some(buf[0]);
        Ok(buf[0])
    }

    fn next_byte(&mut self) -> Result<u8> {
        let b = self.peek_byte()?;
        self.peeked = None;
        self.position += 1;
        Ok(b)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut start = 0;
        if let Some(b) = self.peeked.take() {
            buf[0] = b;
            start = 1;
        }
        self.fill(&mut buf[start..])?;
        self.position += buf.len();
        Ok(())
    }

    /// Reads `len` bytes without trusting `len` for the allocation size.
    fn read_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let at = self.position;
        let mut data = Vec::with_capacity(len.min(64 * 1024));
        if len > 0 {
            if let Some(b) = self.peeked.take() {
                data.push(b);
            }
        }
        let remaining = (len - data.len()) as u64;
        (&mut self.input).take(remaining).read_to_end(&mut data)?;
        if data.len() != len {
            return Err(ChainPackError::malformed(
                "unexpected end of data",
                at + data.len(),
            ));
        }
        self.position += len;
        Ok(data)
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        self.input.read_exact(buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                ChainPackError::malformed("unexpected end of data", self.position)
            } else {
                e.into()
            }
        })
    }
}

fn unpack_datetime(packed: i64, at: usize) -> Result<DateTime> {
    let has_offset = packed & 1 != 0;
    let has_no_msec = packed & 2 != 0;
    let mut d = packed >> 2;
    let mut offset_quarters = 0i64;
    if has_offset {
        offset_quarters = d & 0x7f;
        if offset_quarters & 0x40 != 0 {
            offset_quarters -= 128;
        }
        d >>= 7;
    }
    if has_no_msec {
        d = d
            .checked_mul(1000)
            .ok_or_else(|| ChainPackError::malformed("DateTime out of range", at))?;
    }
    let msecs = d
        .checked_add(CodecConfig::SHV_EPOCH_MSEC)
        .ok_or_else(|| ChainPackError::malformed("DateTime out of range", at))?;
    DateTime::try_from_epoch_msec_tz(msecs, offset_quarters as i32 * 15)
        .ok_or_else(|| ChainPackError::malformed("DateTime out of range", at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::MetaData;

    fn pack(value: impl Into<RpcValue>) -> Vec<u8> {
        to_chainpack(&value.into())
    }

    #[test]
    fn test_tiny_values() {
        assert_eq!(pack(5u64), vec![5]);
        assert_eq!(pack(5), vec![69]);
        assert_eq!(pack(63u64), vec![63]);
        assert_eq!(pack(()), vec![tag::NULL]);
        assert_eq!(pack(true), vec![tag::TRUE]);
    }

    #[test]
    fn test_uint_prefix_forms() {
        assert_eq!(pack(64u64), vec![tag::UINT, 0x40]);
        assert_eq!(pack(127u64), vec![tag::UINT, 0x7f]);
        assert_eq!(pack(128u64), vec![tag::UINT, 0x80, 0x80]);
        assert_eq!(pack(0x3fffu64), vec![tag::UINT, 0xbf, 0xff]);
        assert_eq!(pack(0x4000u64), vec![tag::UINT, 0xc0, 0x40, 0x00]);
        assert_eq!(
            pack(u64::MAX),
            vec![tag::UINT, 0xf4, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]
        );
    }

    #[test]
    fn test_int_sign_magnitude() {
        assert_eq!(pack(-1), vec![tag::INT, 0x41]);
        assert_eq!(pack(64), vec![tag::INT, 0x80, 0x40]);
        assert_eq!(pack(-64), vec![tag::INT, 0xa0, 0x40]);
        for n in [i64::MIN, i64::MIN + 1, -1_000_000_007, i64::MAX] {
            let bytes = pack(n);
            assert_eq!(from_chainpack(&bytes).unwrap(), RpcValue::from(n), "{n}");
        }
    }

    #[test]
    fn test_double_is_little_endian() {
        let bytes = pack(1.5);
        assert_eq!(bytes[0], tag::DOUBLE);
        assert_eq!(&bytes[1..], &1.5f64.to_le_bytes());
    }

    #[test]
    fn test_datetime_packing() {
        // SHV epoch, whole seconds, no offset: (0 << 2) | 2
        let dt = DateTime::from_epoch_msec(CodecConfig::SHV_EPOCH_MSEC);
        assert_eq!(pack(dt), vec![tag::DATETIME, 0x02]);

        for (msec, offset) in [
            (CodecConfig::SHV_EPOCH_MSEC + 1, 0),
            (CodecConfig::SHV_EPOCH_MSEC - 1, -60),
            (0, 945),
            (CodecConfig::MIN_EPOCH_MSEC, -960),
            (CodecConfig::MAX_EPOCH_MSEC, 120),
        ] {
            let dt = DateTime::from_epoch_msec_tz(msec, offset);
            let decoded = from_chainpack(&pack(dt)).unwrap();
            assert_eq!(decoded.as_datetime(), Some(dt), "{msec} {offset}");
        }
    }

    #[test]
    fn test_meta_prefix() {
        let value = RpcValue::from(IMap::from([(1, RpcValue::from("x"))]))
            .with_meta(MetaData::with_meta_type(0, 1));
        let bytes = to_chainpack(&value);
        assert_eq!(&bytes[..4], &[tag::META_MAP, 65, 65, tag::TERM]);
        assert_eq!(from_chainpack(&bytes).unwrap(), value);
    }

    #[test]
    fn test_cstring_decode() {
        let bytes = [tag::CSTRING, b'a', b'\\', b'\\', b'b', 0];
        assert_eq!(from_chainpack(&bytes).unwrap(), RpcValue::from("a\\b"));
    }

    #[test]
    fn test_truncated_input_is_malformed() {
        let bytes = pack("hello");
        let err = from_chainpack(&bytes[..3]).unwrap_err();
        assert!(matches!(err, ChainPackError::MalformedData { .. }));
    }

    #[test]
    fn test_trailing_bytes_are_malformed() {
        let err = from_chainpack(&[1, 2]).unwrap_err();
        assert!(matches!(err, ChainPackError::MalformedData { offset: 1, .. }));
    }

    #[test]
    fn test_nesting_limit() {
        let depth = CodecConfig::MAX_NESTING_DEPTH + 1;
        let mut bytes = vec![tag::LIST; depth];
        bytes.extend(std::iter::repeat(tag::TERM).take(depth));
        assert!(from_chainpack(&bytes).is_err());

        let ok = CodecConfig::MAX_NESTING_DEPTH;
        let mut bytes = vec![tag::LIST; ok];
        bytes.extend(std::iter::repeat(tag::TERM).take(ok));
        assert!(from_chainpack(&bytes).is_ok());
    }

    #[test]
    fn test_map_key_type_enforced() {
        let bytes = [tag::MAP, 1, 2, tag::TERM];
        assert!(from_chainpack(&bytes).is_err());
    }

    #[test]
    fn test_streaming_reader_reads_consecutive_values() {
        let mut data = pack("first");
        data.extend(pack(42));
        let mut reader = ChainPackReader::new(std::io::Cursor::new(data));
        assert_eq!(reader.read().unwrap(), RpcValue::from("first"));
        assert_eq!(reader.read().unwrap(), RpcValue::from(42));
    }

    #[test]
    fn test_uint_data_size() {
        let mut buf = Vec::new();
        write_uint_data(&mut buf, 1 << 40).unwrap();
        assert_eq!(uint_data_size(buf[0]), buf.len());
        let mut reader = ChainPackReader::new(&buf[..]);
        assert_eq!(reader.read_uint_data().unwrap(), 1 << 40);
    }
}
