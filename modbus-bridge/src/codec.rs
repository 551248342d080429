//! Conversion between 16-bit register words and typed values.
//!
//! Everything here is pure: no I/O, no retries. A value of width `W`
//! occupies `ceil(W / 16)` consecutive registers. The [`Encoding`] of an
//! endpoint decides which register carries the most significant word
//! ([`WordOrder`]) and which byte of each register is the high byte
//! ([`ByteOrder`]). Registers arrive from the transport in wire order
//! (big-endian within each register), so `ByteOrder::Big` is the identity.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Invalid register length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Byte order within a single register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    /// High byte first (Modbus wire order).
    #[default]
    Big,
    /// Low byte first.
    Little,
}

/// Order of the registers that make up a multi-register value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WordOrder {
    /// Most significant word in the first register.
    #[default]
    #[serde(rename = "high", alias = "high_first")]
    HighFirst,
    /// Most significant word in the last register.
    #[serde(rename = "low", alias = "low_first")]
    LowFirst,
}

/// Byte and word order used to interpret an endpoint's registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Encoding {
    pub byte_order: ByteOrder,
    pub word_order: WordOrder,
}

impl Encoding {
    pub const fn new(byte_order: ByteOrder, word_order: WordOrder) -> Self {
        Self {
            byte_order,
            word_order,
        }
    }

    /// Apply the byte order to one register. The swap is its own inverse.
    fn swap(&self, word: u16) -> u16 {
        match self.byte_order {
            ByteOrder::Big => word,
            ByteOrder::Little => word.swap_bytes(),
        }
    }

    /// Fold registers into the low bits of a `u64`, most significant word first.
    fn assemble(&self, words: &[u16]) -> u64 {
        let fold = |acc: u64, word: &u16| (acc << 16) | u64::from(self.swap(*word));
        match self.word_order {
            WordOrder::HighFirst => words.iter().fold(0, fold),
            WordOrder::LowFirst => words.iter().rev().fold(0, fold),
        }
    }

    /// Split the low `count * 16` bits of `bits` into registers.
    fn disassemble(&self, bits: u64, count: usize) -> Vec<u16> {
        let mut words: Vec<u16> = (0..count)
            .rev()
            .map(|i| self.swap((bits >> (16 * i)) as u16))
            .collect();
        if self.word_order == WordOrder::LowFirst {
            words.reverse();
        }
        words
    }
}

fn check_len(words: &[u16], expected: usize) -> Result<(), CodecError> {
    if words.len() == expected {
        Ok(())
    } else {
        Err(CodecError::InvalidLength {
            expected,
            actual: words.len(),
        })
    }
}

/// A value stored in one or more consecutive registers.
pub trait RegisterValue: Copy + Sized {
    /// Number of registers the value occupies.
    const WORDS: usize;

    /// Decode from exactly [`Self::WORDS`] registers.
    fn decode(words: &[u16], encoding: Encoding) -> Result<Self, CodecError>;

    /// Encode into [`Self::WORDS`] registers.
    fn encode(self, encoding: Encoding) -> Vec<u16>;
}

// 8-bit values live in the low byte of one register; the high byte is
// dropped on decode and zero on encode.
macro_rules! impl_integer {
    ($($ty:ty => $unsigned:ty, $words:expr);* $(;)?) => {
        $(
            impl RegisterValue for $ty {
                const WORDS: usize = $words;

                fn decode(words: &[u16], encoding: Encoding) -> Result<Self, CodecError> {
                    check_len(words, Self::WORDS)?;
                    Ok(encoding.assemble(words) as $unsigned as $ty)
                }

                fn encode(self, encoding: Encoding) -> Vec<u16> {
                    encoding.disassemble(self as $unsigned as u64, Self::WORDS)
                }
            }
        )*
    };
}

impl_integer! {
    u8 => u8, 1;
    i8 => u8, 1;
    u16 => u16, 1;
    i16 => u16, 1;
    u32 => u32, 2;
    i32 => u32, 2;
    u64 => u64, 4;
    i64 => u64, 4;
}

impl RegisterValue for f32 {
    const WORDS: usize = 2;

    fn decode(words: &[u16], encoding: Encoding) -> Result<Self, CodecError> {
        check_len(words, Self::WORDS)?;
        Ok(f32::from_bits(encoding.assemble(words) as u32))
    }

    fn encode(self, encoding: Encoding) -> Vec<u16> {
        encoding.disassemble(u64::from(self.to_bits()), Self::WORDS)
    }
}

impl RegisterValue for f64 {
    const WORDS: usize = 4;

    fn decode(words: &[u16], encoding: Encoding) -> Result<Self, CodecError> {
        check_len(words, Self::WORDS)?;
        Ok(f64::from_bits(encoding.assemble(words)))
    }

    fn encode(self, encoding: Encoding) -> Vec<u16> {
        encoding.disassemble(self.to_bits(), Self::WORDS)
    }
}

/// Registers as bytes after applying the endpoint's byte order.
pub fn registers_to_bytes(words: &[u16], encoding: Encoding) -> Vec<u8> {
    words
        .iter()
        .flat_map(|w| encoding.swap(*w).to_be_bytes())
        .collect()
}

/// Registers as bytes exactly as they came off the wire.
pub fn registers_to_raw_bytes(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

/// Scalar types selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarType {
    Uint8,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Uint64,
    Int64,
    Float32,
    Float64,
}

impl ScalarType {
    /// Number of registers a value of this type occupies.
    pub fn words(&self) -> usize {
        match self {
            ScalarType::Uint8 | ScalarType::Int8 | ScalarType::Uint16 | ScalarType::Int16 => 1,
            ScalarType::Uint32 | ScalarType::Int32 | ScalarType::Float32 => 2,
            ScalarType::Uint64 | ScalarType::Int64 | ScalarType::Float64 => 4,
        }
    }

    /// Decode registers into a value of this type.
    pub fn decode(&self, words: &[u16], encoding: Encoding) -> Result<ScalarValue, CodecError> {
        Ok(match self {
            ScalarType::Uint8 => ScalarValue::U8(u8::decode(words, encoding)?),
            ScalarType::Int8 => ScalarValue::I8(i8::decode(words, encoding)?),
            ScalarType::Uint16 => ScalarValue::U16(u16::decode(words, encoding)?),
            ScalarType::Int16 => ScalarValue::I16(i16::decode(words, encoding)?),
            ScalarType::Uint32 => ScalarValue::U32(u32::decode(words, encoding)?),
            ScalarType::Int32 => ScalarValue::I32(i32::decode(words, encoding)?),
            ScalarType::Uint64 => ScalarValue::U64(u64::decode(words, encoding)?),
            ScalarType::Int64 => ScalarValue::I64(i64::decode(words, encoding)?),
            ScalarType::Float32 => ScalarValue::F32(f32::decode(words, encoding)?),
            ScalarType::Float64 => ScalarValue::F64(f64::decode(words, encoding)?),
        })
    }

    /// Convert an integer into this type, truncating like an `as` cast.
    pub fn from_i64(&self, value: i64) -> ScalarValue {
        match self {
            ScalarType::Uint8 => ScalarValue::U8(value as u8),
            ScalarType::Int8 => ScalarValue::I8(value as i8),
            ScalarType::Uint16 => ScalarValue::U16(value as u16),
            ScalarType::Int16 => ScalarValue::I16(value as i16),
            ScalarType::Uint32 => ScalarValue::U32(value as u32),
            ScalarType::Int32 => ScalarValue::I32(value as i32),
            ScalarType::Uint64 => ScalarValue::U64(value as u64),
            ScalarType::Int64 => ScalarValue::I64(value),
            ScalarType::Float32 => ScalarValue::F32(value as f32),
            ScalarType::Float64 => ScalarValue::F64(value as f64),
        }
    }
}

/// A decoded scalar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ScalarValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl ScalarValue {
    /// Encode into registers.
    pub fn encode(&self, encoding: Encoding) -> Vec<u16> {
        match *self {
            ScalarValue::U8(v) => v.encode(encoding),
            ScalarValue::I8(v) => v.encode(encoding),
            ScalarValue::U16(v) => v.encode(encoding),
            ScalarValue::I16(v) => v.encode(encoding),
            ScalarValue::U32(v) => v.encode(encoding),
            ScalarValue::I32(v) => v.encode(encoding),
            ScalarValue::U64(v) => v.encode(encoding),
            ScalarValue::I64(v) => v.encode(encoding),
            ScalarValue::F32(v) => v.encode(encoding),
            ScalarValue::F64(v) => v.encode(encoding),
        }
    }

    /// Lossy conversion used for analog readings.
    pub fn as_f64(&self) -> f64 {
        match *self {
            ScalarValue::U8(v) => f64::from(v),
            ScalarValue::I8(v) => f64::from(v),
            ScalarValue::U16(v) => f64::from(v),
            ScalarValue::I16(v) => f64::from(v),
            ScalarValue::U32(v) => f64::from(v),
            ScalarValue::I32(v) => f64::from(v),
            ScalarValue::U64(v) => v as f64,
            ScalarValue::I64(v) => v as f64,
            ScalarValue::F32(v) => f64::from(v),
            ScalarValue::F64(v) => v,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_ENCODINGS: [Encoding; 4] = [
        Encoding::new(ByteOrder::Big, WordOrder::HighFirst),
        Encoding::new(ByteOrder::Big, WordOrder::LowFirst),
        Encoding::new(ByteOrder::Little, WordOrder::HighFirst),
        Encoding::new(ByteOrder::Little, WordOrder::LowFirst),
    ];

    fn assert_roundtrip<T: RegisterValue + PartialEq + std::fmt::Debug>(values: &[T]) {
        for encoding in ALL_ENCODINGS {
            for &value in values {
                let words = value.encode(encoding);
                assert_eq!(words.len(), T::WORDS);
                assert_eq!(T::decode(&words, encoding), Ok(value), "{:?}", encoding);
            }
        }
    }

    #[test]
    fn test_u32_word_order() {
        let words = [0x0001, 0x0002];
        let high = Encoding::new(ByteOrder::Big, WordOrder::HighFirst);
        let low = Encoding::new(ByteOrder::Big, WordOrder::LowFirst);

        assert_eq!(u32::decode(&words, high), Ok(0x0001_0002));
        assert_eq!(u32::decode(&words, low), Ok(0x0002_0001));
    }

    #[test]
    fn test_byte_order_swaps_within_register() {
        let little = Encoding::new(ByteOrder::Little, WordOrder::HighFirst);
        assert_eq!(u16::decode(&[0x1234], little), Ok(0x3412));
        assert_eq!(0x1234u16.encode(little), vec![0x3412]);
    }

    #[test]
    fn test_u64_layout() {
        let high = Encoding::default();
        assert_eq!(
            0x0102_0304_0506_0708u64.encode(high),
            vec![0x0102, 0x0304, 0x0506, 0x0708]
        );

        let low = Encoding::new(ByteOrder::Big, WordOrder::LowFirst);
        assert_eq!(
            0x0102_0304_0506_0708u64.encode(low),
            vec![0x0708, 0x0506, 0x0304, 0x0102]
        );
    }

    #[test]
    fn test_eight_bit_uses_low_byte() {
        let encoding = Encoding::default();
        assert_eq!(u8::decode(&[0xAB12], encoding), Ok(0x12));
        assert_eq!(i8::decode(&[0x00FF], encoding), Ok(-1));
        assert_eq!(0xFFu8.encode(encoding), vec![0x00FF]);
        assert_eq!((-1i8).encode(encoding), vec![0x00FF]);
    }

    #[test]
    fn test_roundtrip_boundaries() {
        assert_roundtrip(&[0u8, 1, u8::MAX]);
        assert_roundtrip(&[0i8, -1, i8::MIN, i8::MAX]);
        assert_roundtrip(&[0u16, 1, u16::MAX]);
        assert_roundtrip(&[0i16, -1, i16::MIN, i16::MAX]);
        assert_roundtrip(&[0u32, 1, 0x0001_0002, u32::MAX]);
        assert_roundtrip(&[0i32, -1, i32::MIN, i32::MAX]);
        assert_roundtrip(&[0u64, 1, u64::MAX]);
        assert_roundtrip(&[0i64, -1, i64::MIN, i64::MAX]);
        assert_roundtrip(&[0.0f32, -1.5, f32::MIN, f32::MAX, 123.456]);
        assert_roundtrip(&[0.0f64, -1.5, f64::MIN, f64::MAX, std::f64::consts::PI]);
    }

    #[test]
    fn test_f32_ieee_layout() {
        // 123.456 = 0x42F6E979
        let value = f32::decode(&[0x42F6, 0xE979], Encoding::default()).unwrap();
        assert!((value - 123.456).abs() < 0.001);
    }

    #[test]
    fn test_invalid_length() {
        let encoding = Encoding::default();
        assert_eq!(
            u32::decode(&[1], encoding),
            Err(CodecError::InvalidLength {
                expected: 2,
                actual: 1
            })
        );
        assert!(f64::decode(&[1, 2, 3], encoding).is_err());
        assert!(u16::decode(&[], encoding).is_err());
    }

    #[test]
    fn test_bytes_and_raw_bytes() {
        let words = [0x1234, 0xABCD];
        let little = Encoding::new(ByteOrder::Little, WordOrder::HighFirst);

        assert_eq!(registers_to_raw_bytes(&words), vec![0x12, 0x34, 0xAB, 0xCD]);
        assert_eq!(
            registers_to_bytes(&words, Encoding::default()),
            vec![0x12, 0x34, 0xAB, 0xCD]
        );
        assert_eq!(
            registers_to_bytes(&words, little),
            vec![0x34, 0x12, 0xCD, 0xAB]
        );
    }

    #[test]
    fn test_scalar_type_dispatch() {
        let encoding = Encoding::default();
        assert_eq!(ScalarType::Float64.words(), 4);
        assert_eq!(
            ScalarType::Int16.decode(&[0xFFFE], encoding),
            Ok(ScalarValue::I16(-2))
        );
        assert_eq!(
            ScalarType::Uint32.from_i64(70000).encode(encoding),
            vec![0x0001, 0x1170]
        );
        assert_eq!(ScalarValue::I32(-7).as_f64(), -7.0);
    }

    #[test]
    fn test_scalar_type_serde_names() {
        let ty: ScalarType = serde_json::from_str("\"float32\"").unwrap();
        assert_eq!(ty, ScalarType::Float32);
        let order: WordOrder = serde_json::from_str("\"low\"").unwrap();
        assert_eq!(order, WordOrder::LowFirst);
        let order: ByteOrder = serde_json::from_str("\"little\"").unwrap();
        assert_eq!(order, ByteOrder::Little);
    }
}
