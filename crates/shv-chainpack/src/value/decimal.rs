//! Exact decimal value: `mantissa * 10^exponent`.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Decimal {
    mantissa: i64,
    exponent: i32,
}

impl Decimal {
    pub fn new(mantissa: i64, exponent: i32) -> Self {
        Self { mantissa, exponent }
    }

    pub fn mantissa(&self) -> i64 {
        self.mantissa
    }

    pub fn exponent(&self) -> i32 {
        self.exponent
    }

    /// Lossy conversion for display and arithmetic.
    pub fn to_f64(&self) -> f64 {
        self.mantissa as f64 * 10f64.powi(self.exponent)
    }
}

/// Leading zeros plain notation may add after the decimal point.
const MAX_PLAIN_ZEROS: usize = 20;

/// Plain decimal notation for small negative exponents (`-0.005`, `12.50`),
/// `<mantissa>e<exponent>` otherwise (`12e2`, `1e-300`). Mantissa and
/// exponent survive a parse of this text unchanged.
impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = self.mantissa.unsigned_abs().to_string();
        let frac_len = self.exponent.unsigned_abs() as usize;
        if self.exponent > 0 || frac_len > digits.len() + MAX_PLAIN_ZEROS {
            return write!(f, "{}e{}", self.mantissa, self.exponent);
        }
        if self.mantissa < 0 {
            f.write_str("-")?;
        }
        if self.exponent == 0 {
            return f.write_str(&digits);
        }
        let padded = if digits.len() <= frac_len {
            format!("{}{}", "0".repeat(frac_len + 1 - digits.len()), digits)
        } else {
            digits
        };
        let (int_part, frac_part) = padded.split_at(padded.len() - frac_len);
        write!(f, "{}.{}", int_part, frac_part)
    }
}
