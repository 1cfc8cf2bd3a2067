//! Codec limits and format constants.

/// Configuration for the value codecs.
pub struct CodecConfig;

impl CodecConfig {
    /// Deepest container/metadata nesting a reader accepts.
    pub const MAX_NESTING_DEPTH: usize = 256;

    /// 2018-02-02T00:00:00Z, the zero point of ChainPack date-times.
    pub const SHV_EPOCH_MSEC: i64 = 1_517_529_600_000;

    /// 0001-01-01T00:00:00.000Z
    pub const MIN_EPOCH_MSEC: i64 = -62_135_596_800_000;
    /// 9999-12-31T23:59:59.999Z
    pub const MAX_EPOCH_MSEC: i64 = 253_402_300_799_999;

    /// UTC offsets are carried in quarter hours as a 7-bit two's complement.
    pub const MIN_UTC_OFFSET_QUARTERS: i32 = -64;
    pub const MAX_UTC_OFFSET_QUARTERS: i32 = 63;

    /// Indentation used by the pretty Cpon writer.
    pub const CPON_INDENT: &'static str = "\t";
}
