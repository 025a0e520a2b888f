//! Channel and conversion metadata as handed over by the block-graph reader.
//!
//! Nothing in here touches a file. The reader that walks `##CN`/`##CC`/`##TX`
//! blocks fills these structures in; the codes implement [`BinRead`] so they
//! can be read straight out of block bytes.

use std::sync::Arc;

use binrw::BinRead;
use thiserror::Error;

/// Typed address of a block in the file.
///
/// For conversions the address doubles as the identity of the definition: two
/// channels sharing a `##CC` block share one cache entry.
pub struct Link<T>(pub u64, std::marker::PhantomData<T>);

impl<T> Clone for Link<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Link<T> {}

impl<T> PartialEq for Link<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T> Eq for Link<T> {}

impl<T> std::hash::Hash for Link<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl<T> Link<T> {
    pub fn get(&self) -> u64 { self.0 }
}

impl<T> From<u64> for Link<T> {
    fn from(val: u64) -> Self {
        Link(val, std::marker::PhantomData)
    }
}

impl<T> std::fmt::Debug for Link<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Link<{}>(0x{:X})", std::any::type_name::<T>(), self.0)
    }
}

impl<T> std::fmt::Display for Link<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown {what} code {code}")]
pub struct UnknownCode {
    pub what: &'static str,
    pub code: u8,
}

fn read_code<R, T>(reader: &mut R, endian: binrw::Endian) -> binrw::BinResult<T>
where
    R: binrw::io::Read + binrw::io::Seek,
    T: TryFrom<u8, Error = UnknownCode>,
{
    let val = u8::read_options(reader, endian, ())?;
    T::try_from(val).map_err(|_| binrw::Error::BadMagic {
        pos: reader.stream_position().unwrap_or(0),
        found: Box::new(val),
    })
}

/// `cn_data_type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    UintLe = 0,
    UintBe = 1,
    IntLe = 2,
    IntBe = 3,
    FloatLe = 4,
    FloatBe = 5,
    StringAscii = 6,
    StringUtf8 = 7,
    StringUtf16Le = 8,
    StringUtf16Be = 9,
    ByteArray = 10,
    MimeSample = 11,
    MimeStream = 12,
    CanOpenDate = 13,
    CanOpenTime = 14,
    ComplexLe = 15,
    ComplexBe = 16,
}

impl TryFrom<u8> for DataType {
    type Error = UnknownCode;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        match val {
            0 => Ok(DataType::UintLe),
            1 => Ok(DataType::UintBe),
            2 => Ok(DataType::IntLe),
            3 => Ok(DataType::IntBe),
            4 => Ok(DataType::FloatLe),
            5 => Ok(DataType::FloatBe),
            6 => Ok(DataType::StringAscii),
            7 => Ok(DataType::StringUtf8),
            8 => Ok(DataType::StringUtf16Le),
            9 => Ok(DataType::StringUtf16Be),
            10 => Ok(DataType::ByteArray),
            11 => Ok(DataType::MimeSample),
            12 => Ok(DataType::MimeStream),
            13 => Ok(DataType::CanOpenDate),
            14 => Ok(DataType::CanOpenTime),
            15 => Ok(DataType::ComplexLe),
            16 => Ok(DataType::ComplexBe),
            code => Err(UnknownCode { what: "data type", code }),
        }
    }
}

impl BinRead for DataType {
    type Args<'a> = ();

    fn read_options<R: binrw::io::Read + binrw::io::Seek>(
        reader: &mut R,
        endian: binrw::Endian,
        (): Self::Args<'_>,
    ) -> binrw::BinResult<Self> {
        read_code(reader, endian)
    }
}

/// `cc_type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversionType {
    OneToOne = 0,
    Linear = 1,
    Rational = 2,
    Algebraic = 3,
    ValueToValueTableWithInterpolation = 4,
    ValueToValueTableWithoutInterpolation = 5,
    ValueRangeToValueTable = 6,
    ValueToTextOrScale = 7,
    ValueRangeToTextOrScale = 8,
    TextToValue = 9,
    TextToText = 10,
    BitfieldText = 11,
}

impl TryFrom<u8> for ConversionType {
    type Error = UnknownCode;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        match val {
            0 => Ok(ConversionType::OneToOne),
            1 => Ok(ConversionType::Linear),
            2 => Ok(ConversionType::Rational),
            3 => Ok(ConversionType::Algebraic),
            4 => Ok(ConversionType::ValueToValueTableWithInterpolation),
            5 => Ok(ConversionType::ValueToValueTableWithoutInterpolation),
            6 => Ok(ConversionType::ValueRangeToValueTable),
            7 => Ok(ConversionType::ValueToTextOrScale),
            8 => Ok(ConversionType::ValueRangeToTextOrScale),
            9 => Ok(ConversionType::TextToValue),
            10 => Ok(ConversionType::TextToText),
            11 => Ok(ConversionType::BitfieldText),
            code => Err(UnknownCode { what: "conversion type", code }),
        }
    }
}

impl BinRead for ConversionType {
    type Args<'a> = ();

    fn read_options<R: binrw::io::Read + binrw::io::Seek>(
        reader: &mut R,
        endian: binrw::Endian,
        (): Self::Args<'_>,
    ) -> binrw::BinResult<Self> {
        read_code(reader, endian)
    }
}

/// `cn_type` value of a variable length signal data channel.
pub const CHANNEL_TYPE_VARIABLE_LENGTH: u8 = 1;
/// `cn_type` value of a virtual master channel.
pub const CHANNEL_TYPE_VIRTUAL_MASTER: u8 = 3;
/// `cn_type` value of a virtual data channel.
pub const CHANNEL_TYPE_VIRTUAL_DATA: u8 = 6;

/// Everything the engine needs to know about one `##CN` block and its
/// enclosing channel group.
#[derive(Debug, Clone)]
pub struct ChannelDescription {
    pub name: String,
    pub channel_type: u8,
    pub data_type: DataType,
    pub bit_offset: u8,
    pub byte_offset: u32,
    pub bit_count: u32,
    /// Bytes from one record of the group to the next, record id included.
    pub record_length: u32,
    /// Size of the record id prefix of the data group (`dg_rec_id_size`).
    pub record_id_size: u8,
    pub conversion: Option<Arc<ConversionDefinition>>,
}

impl ChannelDescription {
    /// A fixed length channel without conversion.
    pub fn new(
        name: impl Into<String>,
        data_type: DataType,
        byte_offset: u32,
        bit_count: u32,
        record_length: u32,
    ) -> Self {
        Self {
            name: name.into(),
            channel_type: 0,
            data_type,
            bit_offset: 0,
            byte_offset,
            bit_count,
            record_length,
            record_id_size: 0,
            conversion: None,
        }
    }

    pub fn with_bit_offset(mut self, bit_offset: u8) -> Self {
        self.bit_offset = bit_offset;
        self
    }

    pub fn with_record_id_size(mut self, record_id_size: u8) -> Self {
        self.record_id_size = record_id_size;
        self
    }

    pub fn with_conversion(mut self, conversion: Arc<ConversionDefinition>) -> Self {
        self.conversion = Some(conversion);
        self
    }
}

/// A reference held by a `##CC` block.
#[derive(Debug, Clone)]
pub enum ConversionOrText {
    Conversion(Arc<ConversionDefinition>),
    Text(String),
}

/// A parsed `##CC` block.
///
/// `refs` keeps the file order of `cc_ref`; nil links are `None`.
#[derive(Debug, Clone)]
pub struct ConversionDefinition {
    pub link: Link<ConversionDefinition>,
    pub conversion_type: ConversionType,
    pub values: Vec<f64>,
    pub refs: Vec<Option<ConversionOrText>>,
}

impl ConversionDefinition {
    pub fn new(address: u64, conversion_type: ConversionType, values: Vec<f64>) -> Self {
        Self {
            link: Link::from(address),
            conversion_type,
            values,
            refs: Vec::new(),
        }
    }

    pub fn with_refs(mut self, refs: Vec<Option<ConversionOrText>>) -> Self {
        self.refs = refs;
        self
    }

    pub fn linear(address: u64, offset: f64, scale: f64) -> Self {
        Self::new(address, ConversionType::Linear, vec![offset, scale])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binrw::io::Cursor;

    #[test]
    fn test_data_type_codes() {
        let mut cursor = Cursor::new(vec![0x00, 0x03, 0x04, 0x10]);
        assert_eq!(DataType::read_le(&mut cursor).unwrap(), DataType::UintLe);
        assert_eq!(DataType::read_le(&mut cursor).unwrap(), DataType::IntBe);
        assert_eq!(DataType::read_le(&mut cursor).unwrap(), DataType::FloatLe);
        assert_eq!(DataType::read_le(&mut cursor).unwrap(), DataType::ComplexBe);
    }

    #[test]
    fn test_unknown_codes_are_rejected() {
        let mut cursor = Cursor::new(vec![0x11]);
        assert!(matches!(
            DataType::read_le(&mut cursor),
            Err(binrw::Error::BadMagic { .. })
        ));
        assert_eq!(
            ConversionType::try_from(12),
            Err(UnknownCode { what: "conversion type", code: 12 })
        );
    }

    #[test]
    fn test_conversion_type_codes() {
        let mut cursor = Cursor::new(vec![0x01, 0x07, 0x0B]);
        assert_eq!(ConversionType::read_le(&mut cursor).unwrap(), ConversionType::Linear);
        assert_eq!(
            ConversionType::read_le(&mut cursor).unwrap(),
            ConversionType::ValueToTextOrScale
        );
        assert_eq!(ConversionType::read_le(&mut cursor).unwrap(), ConversionType::BitfieldText);
    }

    #[test]
    fn test_link_identity() {
        let a = Link::<ConversionDefinition>::from(0x1A0);
        assert_eq!(a, Link::from(0x1A0));
        assert_eq!(a.to_string(), "0x1A0");
    }
}
