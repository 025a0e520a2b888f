//! Channel decode engine for ASAM MDF4 measurement files.
//!
//! Turns the metadata of a `##CN` block and its conversion chain into a
//! compact decode spec, and decodes fixed-length records into `f64` sample
//! buffers with one bounds check per window.

mod blocks;
mod buffer;
mod channel;
mod conversion;
mod error;
mod kernel;
mod layout;

use std::sync::Arc;

use tracing::debug;

pub use crate::blocks::*;
pub use crate::buffer::{Backing, BufferOptions, SampleBuffer, SampleBufferFactory, DEFAULT_NATIVE_THRESHOLD};
pub use crate::channel::{Channel, ChannelDecodeSpec};
pub use crate::conversion::{
    ConversionCache, ConversionResolver, ConversionRule, DisplayRule, LookupTable, ResolvedConversion, Unsupported,
};
pub use crate::error::{Error, LayoutError, Result, UnsupportedChannel};
pub use crate::layout::{ByteOrder, NativeType, NativeWord, RawLayout};

/// An open measurement file as far as decoding is concerned.
///
/// Owns the conversion cache shared by all of its channels and the buffer
/// factory. Closing or dropping the document empties the cache for good;
/// channels that outlive it still resolve their conversions, uncached.
#[derive(Debug, Default)]
pub struct Document {
    resolver: ConversionResolver,
    buffers: SampleBufferFactory,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: BufferOptions) -> Self {
        Self {
            resolver: ConversionResolver::default(),
            buffers: SampleBufferFactory::new(options),
        }
    }

    pub fn channel(&self, description: ChannelDescription) -> Arc<Channel> {
        Arc::new(Channel::new(description, self.resolver.clone()))
    }

    pub fn create_buffer(
        &self,
        channel: &Arc<Channel>,
        length: usize,
        suppress_conversion: bool,
    ) -> Result<SampleBuffer> {
        self.buffers.allocate(channel, length, suppress_conversion)
    }

    pub fn conversion_cache(&self) -> &ConversionCache {
        self.resolver.cache()
    }

    pub fn buffer_factory(&self) -> &SampleBufferFactory {
        &self.buffers
    }

    pub fn close(self) {}
}

impl Drop for Document {
    fn drop(&mut self) {
        let cache = self.resolver.cache();
        debug!(entries = cache.len(), computed = cache.computed(), "closing document");
        cache.close();
    }
}
