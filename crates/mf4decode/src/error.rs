use thiserror::Error;

use crate::blocks::{ConversionDefinition, DataType, Link};
use crate::layout::ByteOrder;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while building decode specs, allocating buffers or decoding.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Layout(#[from] LayoutError),

    /// Conversion or data type the engine cannot turn into physical values.
    #[error("unsupported conversion {kind} (parameters: {parameters:?})")]
    UnsupportedConversion {
        kind: String,
        parameters: Vec<f64>,
    },

    #[error(transparent)]
    UnsupportedChannel(#[from] UnsupportedChannel),

    #[error("malformed conversion block at {link}: {reason}")]
    MalformedConversion {
        link: Link<ConversionDefinition>,
        reason: String,
    },

    /// A path that valid upstream metadata can never reach.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(&'static str),

    #[error("raw buffer too short: need {required} bytes, have {available}")]
    Bounds { required: u64, available: u64 },

    #[error("sample window {start}..{end} exceeds buffer length {length}")]
    Window { start: u64, end: u64, length: usize },

    #[error("cannot allocate a buffer of {length} samples")]
    Allocation { length: usize },
}

/// A channel layout that contradicts itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("bit length must be at least 1")]
    EmptyBitRange,
    #[error("bit range {bit_offset}+{bit_length} does not fit in a 64-bit word")]
    BitRangeTooWide { bit_offset: u8, bit_length: u32 },
    #[error("floating point field with bit offset {0}")]
    FloatBitOffset(u8),
    #[error("unsupported floating point width: {0} bits")]
    FloatWidth(u32),
    #[error("{native_type} field cannot have byte order {byte_order:?}")]
    ByteOrder {
        native_type: &'static str,
        byte_order: ByteOrder,
    },
    #[error("record stride {stride} cannot hold {required} bytes at offset {byte_offset}")]
    Stride {
        stride: u32,
        byte_offset: u32,
        required: u32,
    },
}

/// No buffer strategy exists for a channel's layout/conversion combination.
#[derive(Debug, Clone, Error)]
#[error(
    "no sample buffer for channel '{channel}' ({data_type:?}, {byte_order:?}, {conversion}). \
     The author does not have access to a file using this feature. \
     Please create an issue and attach a sample file."
)]
pub struct UnsupportedChannel {
    pub channel: String,
    pub data_type: DataType,
    pub byte_order: ByteOrder,
    pub conversion: String,
}

impl Error {
    pub(crate) fn unsupported(kind: impl Into<String>, parameters: &[f64]) -> Self {
        Error::UnsupportedConversion {
            kind: kind.into(),
            parameters: parameters.to_vec(),
        }
    }

    pub(crate) fn unsupported_type(data_type: DataType) -> Self {
        Error::unsupported(format!("data type {data_type:?}"), &[])
    }

    pub(crate) fn malformed(link: Link<ConversionDefinition>, reason: impl Into<String>) -> Self {
        Error::MalformedConversion {
            link,
            reason: reason.into(),
        }
    }

    /// Whether this error is a capability gap rather than bad input.
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedConversion { .. } | Error::UnsupportedChannel(_)
        )
    }
}
