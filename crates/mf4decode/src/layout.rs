//! Where a channel's raw field sits inside a record and how to read it.

use crate::blocks::{
    ChannelDescription, DataType, CHANNEL_TYPE_VARIABLE_LENGTH, CHANNEL_TYPE_VIRTUAL_DATA,
    CHANNEL_TYPE_VIRTUAL_MASTER,
};
use crate::error::{Error, LayoutError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
    /// Only valid for fields without endianness (single bytes, strings).
    Undefined,
}

impl ByteOrder {
    pub const fn host() -> Self {
        if cfg!(target_endian = "little") {
            ByteOrder::LittleEndian
        } else {
            ByteOrder::BigEndian
        }
    }
}

/// Machine representation a raw field is reinterpreted as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeType {
    Unsigned,
    Signed,
    Float32,
    Float64,
    AnsiString,
    ByteArray,
    NotNative,
}

impl NativeType {
    fn name(self) -> &'static str {
        match self {
            NativeType::Unsigned => "unsigned",
            NativeType::Signed => "signed",
            NativeType::Float32 => "float32",
            NativeType::Float64 => "float64",
            NativeType::AnsiString => "ansi string",
            NativeType::ByteArray => "byte array",
            NativeType::NotNative => "not native",
        }
    }
}

/// The word read from the record for every sample of a numeric channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeWord {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl NativeWord {
    pub const fn bytes(self) -> usize {
        match self {
            NativeWord::U8 | NativeWord::I8 => 1,
            NativeWord::U16 | NativeWord::I16 => 2,
            NativeWord::U32 | NativeWord::I32 | NativeWord::F32 => 4,
            NativeWord::U64 | NativeWord::I64 | NativeWord::F64 => 8,
        }
    }
}

/// Raw bit/byte extraction descriptor of one channel.
///
/// Immutable: `mask` and `shift` are derived from the bit range at
/// construction, and a different bit range means a different layout (see
/// [`RawLayout::with_bit_range`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawLayout {
    stride: u32,
    byte_offset: u32,
    bit_offset: u8,
    bit_length: u32,
    byte_order: ByteOrder,
    native_type: NativeType,
    mask: u64,
    shift: u32,
}

impl RawLayout {
    /// `byte_offset` counts from the start of the record, including any record
    /// id prefix.
    pub fn new(
        stride: u32,
        byte_offset: u32,
        bit_offset: u8,
        bit_length: u32,
        byte_order: ByteOrder,
        native_type: NativeType,
    ) -> Result<Self, LayoutError> {
        if bit_length == 0 {
            return Err(LayoutError::EmptyBitRange);
        }
        let end_bit = bit_offset as u32 + bit_length;

        let (mask, shift) = match native_type {
            NativeType::Unsigned | NativeType::Signed => {
                if end_bit > 64 {
                    return Err(LayoutError::BitRangeTooWide { bit_offset, bit_length });
                }
                let needs_order = end_bit > 8;
                if needs_order && byte_order == ByteOrder::Undefined {
                    return Err(LayoutError::ByteOrder {
                        native_type: native_type.name(),
                        byte_order,
                    });
                }
                ((u64::MAX >> (64 - bit_length)) << bit_offset, bit_offset as u32)
            }
            NativeType::Float32 | NativeType::Float64 => {
                if bit_offset != 0 {
                    return Err(LayoutError::FloatBitOffset(bit_offset));
                }
                let width = if native_type == NativeType::Float32 { 32 } else { 64 };
                if bit_length != width {
                    return Err(LayoutError::FloatWidth(bit_length));
                }
                if byte_order == ByteOrder::Undefined {
                    return Err(LayoutError::ByteOrder {
                        native_type: native_type.name(),
                        byte_order,
                    });
                }
                (u64::MAX >> (64 - bit_length), 0)
            }
            NativeType::AnsiString | NativeType::ByteArray => {
                if byte_order != ByteOrder::Undefined {
                    return Err(LayoutError::ByteOrder {
                        native_type: native_type.name(),
                        byte_order,
                    });
                }
                (u64::MAX, 0)
            }
            NativeType::NotNative => (u64::MAX, 0),
        };

        let required = end_bit.div_ceil(8);
        if byte_offset as u64 + required as u64 > stride as u64 {
            return Err(LayoutError::Stride { stride, byte_offset, required });
        }

        Ok(Self {
            stride,
            byte_offset,
            bit_offset,
            bit_length,
            byte_order,
            native_type,
            mask,
            shift,
        })
    }

    /// Builds the layout of a `##CN` block, folding the record id prefix into
    /// the byte offset.
    pub fn from_channel(channel: &ChannelDescription) -> Result<Self> {
        match channel.channel_type {
            CHANNEL_TYPE_VARIABLE_LENGTH => {
                return Err(Error::unsupported("variable length channel", &[]))
            }
            CHANNEL_TYPE_VIRTUAL_MASTER | CHANNEL_TYPE_VIRTUAL_DATA => {
                return Err(Error::unsupported("virtual channel", &[]))
            }
            _ => {}
        }

        let (native_type, byte_order) = match channel.data_type {
            DataType::UintLe => (NativeType::Unsigned, ByteOrder::LittleEndian),
            DataType::UintBe => (NativeType::Unsigned, ByteOrder::BigEndian),
            DataType::IntLe => (NativeType::Signed, ByteOrder::LittleEndian),
            DataType::IntBe => (NativeType::Signed, ByteOrder::BigEndian),
            DataType::FloatLe => match channel.bit_count {
                32 => (NativeType::Float32, ByteOrder::LittleEndian),
                64 => (NativeType::Float64, ByteOrder::LittleEndian),
                other => return Err(LayoutError::FloatWidth(other).into()),
            },
            DataType::StringAscii => (NativeType::AnsiString, ByteOrder::Undefined),
            DataType::ByteArray => (NativeType::ByteArray, ByteOrder::Undefined),
            other => return Err(Error::unsupported_type(other)),
        };

        let byte_offset = channel
            .byte_offset
            .checked_add(channel.record_id_size as u32)
            .ok_or(LayoutError::Stride {
                stride: channel.record_length,
                byte_offset: channel.byte_offset,
                required: channel.record_id_size as u32,
            })?;

        Ok(Self::new(
            channel.record_length,
            byte_offset,
            channel.bit_offset,
            channel.bit_count,
            byte_order,
            native_type,
        )?)
    }

    /// Same field position with a different bit range.
    pub fn with_bit_range(&self, bit_offset: u8, bit_length: u32) -> Result<Self, LayoutError> {
        Self::new(
            self.stride,
            self.byte_offset,
            bit_offset,
            bit_length,
            self.byte_order,
            self.native_type,
        )
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn total_byte_offset(&self) -> u32 {
        self.byte_offset
    }

    pub fn bit_offset(&self) -> u8 {
        self.bit_offset
    }

    pub fn bit_length(&self) -> u32 {
        self.bit_length
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn native_type(&self) -> NativeType {
        self.native_type
    }

    /// Bits of the field within the word read at the field's byte offset.
    pub fn mask(&self) -> u64 {
        self.mask
    }

    pub fn shift(&self) -> u32 {
        self.shift
    }

    /// The word the decode kernel reads per sample, `None` for fields that
    /// have no numeric representation.
    pub fn native_word(&self) -> Option<NativeWord> {
        let end_bit = self.bit_offset as u32 + self.bit_length;
        match self.native_type {
            NativeType::Unsigned => Some(match end_bit {
                0..=8 => NativeWord::U8,
                9..=16 => NativeWord::U16,
                17..=32 => NativeWord::U32,
                _ => NativeWord::U64,
            }),
            NativeType::Signed => Some(match end_bit {
                0..=8 => NativeWord::I8,
                9..=16 => NativeWord::I16,
                17..=32 => NativeWord::I32,
                _ => NativeWord::I64,
            }),
            NativeType::Float32 => Some(NativeWord::F32),
            NativeType::Float64 => Some(NativeWord::F64),
            NativeType::AnsiString | NativeType::ByteArray | NativeType::NotNative => None,
        }
    }

    /// Whether words can be read in host byte order without swapping.
    pub fn is_same_endianness(&self) -> bool {
        match self.native_word() {
            Some(word) if word.bytes() == 1 => true,
            _ => self.byte_order == ByteOrder::host(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unsigned(byte_offset: u32, bit_offset: u8, bit_length: u32) -> RawLayout {
        RawLayout::new(8, byte_offset, bit_offset, bit_length, ByteOrder::LittleEndian, NativeType::Unsigned)
            .unwrap()
    }

    #[test]
    fn test_nibble_mask_and_shift() {
        let layout = unsigned(0, 4, 4);
        assert_eq!(layout.mask(), 0b1111_0000);
        assert_eq!(layout.shift(), 4);
        assert_eq!((0b1010_0101u64 & layout.mask()) >> layout.shift(), 0b1010);
        assert_eq!(layout.native_word(), Some(NativeWord::U8));
    }

    #[test]
    fn test_full_width_mask() {
        let layout = unsigned(0, 0, 64);
        assert_eq!(layout.mask(), u64::MAX);
        assert_eq!(layout.native_word(), Some(NativeWord::U64));
    }

    #[test]
    fn test_native_word_covers_bit_range() {
        assert_eq!(unsigned(0, 3, 13).native_word(), Some(NativeWord::U16));
        assert_eq!(unsigned(0, 4, 13).native_word(), Some(NativeWord::U32));
        assert_eq!(unsigned(0, 0, 33).native_word(), Some(NativeWord::U64));
        let signed = RawLayout::new(8, 0, 0, 12, ByteOrder::LittleEndian, NativeType::Signed).unwrap();
        assert_eq!(signed.native_word(), Some(NativeWord::I16));
    }

    #[test]
    fn test_bit_range_validation() {
        let wide = RawLayout::new(16, 0, 4, 61, ByteOrder::LittleEndian, NativeType::Unsigned);
        assert_eq!(wide, Err(LayoutError::BitRangeTooWide { bit_offset: 4, bit_length: 61 }));

        let empty = RawLayout::new(8, 0, 0, 0, ByteOrder::LittleEndian, NativeType::Unsigned);
        assert_eq!(empty, Err(LayoutError::EmptyBitRange));

        let outside = RawLayout::new(8, 7, 0, 16, ByteOrder::LittleEndian, NativeType::Unsigned);
        assert_eq!(outside, Err(LayoutError::Stride { stride: 8, byte_offset: 7, required: 2 }));
    }

    #[test]
    fn test_byte_order_validation() {
        assert!(RawLayout::new(8, 0, 0, 8, ByteOrder::Undefined, NativeType::Unsigned).is_ok());
        assert!(matches!(
            RawLayout::new(8, 0, 0, 16, ByteOrder::Undefined, NativeType::Unsigned),
            Err(LayoutError::ByteOrder { .. })
        ));
        assert!(matches!(
            RawLayout::new(8, 0, 0, 32, ByteOrder::Undefined, NativeType::Float32),
            Err(LayoutError::ByteOrder { .. })
        ));
        assert!(matches!(
            RawLayout::new(8, 0, 0, 64, ByteOrder::LittleEndian, NativeType::AnsiString),
            Err(LayoutError::ByteOrder { .. })
        ));
    }

    #[test]
    fn test_float_validation() {
        assert_eq!(
            RawLayout::new(8, 0, 2, 32, ByteOrder::LittleEndian, NativeType::Float32),
            Err(LayoutError::FloatBitOffset(2))
        );
        assert_eq!(
            RawLayout::new(8, 0, 0, 32, ByteOrder::LittleEndian, NativeType::Float64),
            Err(LayoutError::FloatWidth(32))
        );
    }

    #[test]
    fn test_with_bit_range_recomputes_mask() {
        let layout = unsigned(2, 0, 8);
        let narrowed = layout.with_bit_range(2, 3).unwrap();
        assert_eq!(narrowed.mask(), 0b0001_1100);
        assert_eq!(narrowed.shift(), 2);
        assert_eq!(narrowed.total_byte_offset(), 2);
        assert_eq!(layout.mask(), 0xFF);
    }

    #[test]
    fn test_from_channel_folds_record_id() {
        let channel = ChannelDescription::new("speed", DataType::UintLe, 2, 16, 9).with_record_id_size(1);
        let layout = RawLayout::from_channel(&channel).unwrap();
        assert_eq!(layout.total_byte_offset(), 3);
        assert_eq!(layout.stride(), 9);
        assert_eq!(layout.byte_order(), ByteOrder::LittleEndian);
        assert_eq!(layout.native_word(), Some(NativeWord::U16));
    }

    #[test]
    fn test_from_channel_types() {
        let float = ChannelDescription::new("t", DataType::FloatLe, 0, 64, 8);
        assert_eq!(RawLayout::from_channel(&float).unwrap().native_type(), NativeType::Float64);

        let half = ChannelDescription::new("h", DataType::FloatLe, 0, 16, 8);
        assert!(matches!(
            RawLayout::from_channel(&half),
            Err(Error::Layout(LayoutError::FloatWidth(16)))
        ));

        let text = ChannelDescription::new("s", DataType::StringAscii, 0, 64, 8);
        let text = RawLayout::from_channel(&text).unwrap();
        assert_eq!(text.native_type(), NativeType::AnsiString);
        assert_eq!(text.native_word(), None);

        let big_float = ChannelDescription::new("b", DataType::FloatBe, 0, 32, 8);
        assert!(RawLayout::from_channel(&big_float).unwrap_err().is_unsupported());

        let mut vlsd = ChannelDescription::new("v", DataType::ByteArray, 0, 64, 8);
        vlsd.channel_type = CHANNEL_TYPE_VARIABLE_LENGTH;
        assert!(RawLayout::from_channel(&vlsd).unwrap_err().is_unsupported());
    }

    #[test]
    fn test_endianness_against_host() {
        let big = RawLayout::new(8, 0, 0, 16, ByteOrder::BigEndian, NativeType::Unsigned).unwrap();
        let little = unsigned(0, 0, 16);
        assert_eq!(big.is_same_endianness(), ByteOrder::host() == ByteOrder::BigEndian);
        assert_eq!(little.is_same_endianness(), ByteOrder::host() == ByteOrder::LittleEndian);

        let byte = RawLayout::new(8, 0, 0, 8, ByteOrder::BigEndian, NativeType::Unsigned).unwrap();
        assert!(byte.is_same_endianness());
    }
}
