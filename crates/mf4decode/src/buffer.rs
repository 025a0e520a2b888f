//! Sample buffers: the decoded `f64` values of one channel.
//!
//! A buffer is allocated once for a channel and filled window by window with
//! [`SampleBuffer::update`] as record data arrives. Large buffers live in a
//! zeroed block taken straight from the global allocator; the choice is made
//! by [`BufferOptions::native_threshold`].

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::slice;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::channel::Channel;
use crate::error::{Error, Result, UnsupportedChannel};
use crate::kernel::DecodeKernel;

/// Buffers of at least this many samples use native storage by default.
pub const DEFAULT_NATIVE_THRESHOLD: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferOptions {
    /// Minimum length, in samples, for which native storage is used.
    pub native_threshold: usize,
}

impl Default for BufferOptions {
    fn default() -> Self {
        let native_threshold = if cfg!(feature = "native-buffers") {
            0
        } else {
            DEFAULT_NATIVE_THRESHOLD
        };
        Self { native_threshold }
    }
}

/// Where the samples of a buffer are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    Heap,
    Native,
}

/// Picks a decode strategy and storage for a channel.
#[derive(Debug, Clone, Default)]
pub struct SampleBufferFactory {
    options: BufferOptions,
}

impl SampleBufferFactory {
    pub fn new(options: BufferOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &BufferOptions {
        &self.options
    }

    /// Allocates a zeroed buffer of `length` samples for `channel`.
    ///
    /// Only fields with a native word in host byte order and a linear
    /// conversion have a strategy. With `suppress_conversion` the buffer holds
    /// raw values and the conversion rule is not consulted.
    pub fn allocate(
        &self,
        channel: &Arc<Channel>,
        length: usize,
        suppress_conversion: bool,
    ) -> Result<SampleBuffer> {
        let spec = channel.decoder_spec()?;
        let raw = spec.raw_layout();
        let linear = if suppress_conversion {
            Some((1.0, 0.0))
        } else {
            spec.conversion().as_linear()
        };

        let (scale, offset) = match (raw.native_word(), linear) {
            (Some(_), Some(linear)) if raw.is_same_endianness() => linear,
            _ => {
                let err = UnsupportedChannel {
                    channel: channel.name().to_owned(),
                    data_type: channel.description().data_type,
                    byte_order: raw.byte_order(),
                    conversion: spec.conversion().to_string(),
                };
                warn!(channel = %channel, error = %err, "no buffer strategy");
                return Err(err.into());
            }
        };

        let storage = if length >= self.options.native_threshold {
            Storage::Native(NativeBlock::new(length)?)
        } else {
            Storage::Heap(vec![0.0; length])
        };
        debug!(
            channel = %channel,
            length,
            backing = ?storage.backing(),
            word = ?raw.native_word(),
            "sample buffer allocated"
        );

        Ok(SampleBuffer {
            channel: Arc::clone(channel),
            storage,
            kernel: DecodeKernel::new(*raw, scale, offset),
        })
    }
}

/// Decoded values of one channel.
///
/// The buffer owns its storage; dropping it (or calling
/// [`SampleBuffer::release`]) frees the storage exactly once.
#[derive(Debug)]
pub struct SampleBuffer {
    channel: Arc<Channel>,
    storage: Storage,
    kernel: DecodeKernel,
}

impl SampleBuffer {
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn len(&self) -> usize {
        self.values().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn backing(&self) -> Backing {
        self.storage.backing()
    }

    pub fn values(&self) -> &[f64] {
        self.storage.as_slice()
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        self.storage.as_mut_slice()
    }

    /// Makes subsequent updates store raw values.
    pub fn disable_conversion(&mut self) {
        self.kernel.disable_conversion();
    }

    /// Decodes `sample_count` records of `raw`, starting at record
    /// `sample_start`, into the same positions of this buffer.
    ///
    /// Record `i` starts at `offset + stride * i`. The whole window is
    /// checked against `raw` before anything is written.
    pub fn update(&mut self, raw: &[u8], offset: u64, sample_start: u32, sample_count: u32) -> Result<()> {
        trace!(
            channel = %self.channel,
            offset,
            sample_start,
            sample_count,
            stride = self.kernel.layout().stride(),
            "decoding window"
        );
        self.kernel
            .update(self.storage.as_mut_slice(), raw, offset, sample_start, sample_count)
    }

    /// Copies native storage out, or hands over the heap vector.
    pub fn into_vec(self) -> Vec<f64> {
        match self.storage {
            Storage::Heap(values) => values,
            Storage::Native(block) => block.as_slice().to_vec(),
        }
    }

    /// Frees the storage now.
    pub fn release(self) {
        trace!(channel = %self.channel, backing = ?self.backing(), "sample buffer released");
    }
}

#[derive(Debug)]
enum Storage {
    Heap(Vec<f64>),
    Native(NativeBlock),
}

impl Storage {
    fn backing(&self) -> Backing {
        match self {
            Storage::Heap(_) => Backing::Heap,
            Storage::Native(_) => Backing::Native,
        }
    }

    fn as_slice(&self) -> &[f64] {
        match self {
            Storage::Heap(values) => values,
            Storage::Native(block) => block.as_slice(),
        }
    }

    fn as_mut_slice(&mut self) -> &mut [f64] {
        match self {
            Storage::Heap(values) => values,
            Storage::Native(block) => block.as_mut_slice(),
        }
    }
}

/// Zeroed `f64` block from the global allocator, freed on drop.
struct NativeBlock {
    ptr: NonNull<f64>,
    len: usize,
}

// SAFETY: the block is uniquely owned like a `Box<[f64]>`.
unsafe impl Send for NativeBlock {}
unsafe impl Sync for NativeBlock {}

impl NativeBlock {
    fn new(len: usize) -> Result<Self> {
        if len == 0 {
            return Ok(Self { ptr: NonNull::dangling(), len });
        }
        let layout = Layout::array::<f64>(len).map_err(|_| Error::Allocation { length: len })?;
        // SAFETY: `layout` has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) }.cast::<f64>();
        let ptr = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Ok(Self { ptr, len })
    }

    fn as_slice(&self) -> &[f64] {
        // SAFETY: `ptr` is valid for `len` initialized elements (all-zero bits is 0.0).
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [f64] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for NativeBlock {
    fn drop(&mut self) {
        if self.len == 0 {
            return;
        }
        if let Ok(layout) = Layout::array::<f64>(self.len) {
            // SAFETY: allocated in `new` with this exact layout.
            unsafe { alloc::dealloc(self.ptr.as_ptr().cast::<u8>(), layout) };
        }
    }
}

impl std::fmt::Debug for NativeBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeBlock").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::{ChannelDescription, ConversionDefinition, ConversionType, DataType};
    use crate::conversion::ConversionResolver;

    fn channel(description: ChannelDescription) -> Arc<Channel> {
        Arc::new(Channel::new(description, ConversionResolver::default()))
    }

    fn always_native() -> SampleBufferFactory {
        SampleBufferFactory::new(BufferOptions { native_threshold: 0 })
    }

    fn never_native() -> SampleBufferFactory {
        SampleBufferFactory::new(BufferOptions { native_threshold: usize::MAX })
    }

    #[test]
    fn test_backing_threshold() {
        let ch = channel(ChannelDescription::new("Counter", DataType::UintLe, 0, 8, 1));
        let factory = SampleBufferFactory::new(BufferOptions { native_threshold: 4 });
        assert_eq!(factory.allocate(&ch, 3, false).unwrap().backing(), Backing::Heap);
        assert_eq!(factory.allocate(&ch, 4, false).unwrap().backing(), Backing::Native);
    }

    #[test]
    fn test_buffers_start_zeroed() {
        let ch = channel(ChannelDescription::new("Counter", DataType::UintLe, 0, 8, 1));
        for factory in [always_native(), never_native()] {
            let buffer = factory.allocate(&ch, 16, false).unwrap();
            assert_eq!(buffer.len(), 16);
            assert!(buffer.values().iter().all(|&v| v == 0.0));
        }
    }

    #[test]
    fn test_empty_native_buffer() {
        let ch = channel(ChannelDescription::new("Counter", DataType::UintLe, 0, 8, 1));
        let mut buffer = always_native().allocate(&ch, 0, false).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(buffer.backing(), Backing::Native);
        buffer.update(&[], 0, 0, 0).unwrap();
        buffer.release();
    }

    #[test]
    fn test_native_and_heap_agree() {
        let description = ChannelDescription::new("Pressure", DataType::IntLe, 1, 16, 3)
            .with_conversion(Arc::new(ConversionDefinition::linear(0x10, 1.0, 0.5)));
        let ch = channel(description);
        let raw: Vec<u8> = (0i16..32)
            .map(|v| v * -3)
            .flat_map(|v| {
                let [lo, hi] = v.to_le_bytes();
                [0xEE, lo, hi]
            })
            .collect();

        let mut heap = never_native().allocate(&ch, 32, false).unwrap();
        let mut native = always_native().allocate(&ch, 32, false).unwrap();
        heap.update(&raw, 0, 0, 32).unwrap();
        native.update(&raw, 0, 0, 32).unwrap();

        assert_eq!(heap.values(), native.values());
        assert_eq!(native.values()[3], -9.0 * 0.5 + 1.0);
        assert_eq!(native.into_vec(), heap.into_vec());
    }

    #[test]
    fn test_values_mut() {
        let ch = channel(ChannelDescription::new("Counter", DataType::UintLe, 0, 8, 1));
        let mut buffer = always_native().allocate(&ch, 2, false).unwrap();
        buffer.values_mut()[1] = 4.5;
        assert_eq!(buffer.values(), &[0.0, 4.5]);
    }

    #[test]
    fn test_disable_conversion() {
        let description = ChannelDescription::new("Voltage", DataType::UintLe, 0, 8, 1)
            .with_conversion(Arc::new(ConversionDefinition::linear(0x10, 0.0, 2.0)));
        let ch = channel(description);
        let mut buffer = never_native().allocate(&ch, 2, false).unwrap();
        buffer.update(&[3, 4], 0, 0, 1).unwrap();
        buffer.disable_conversion();
        buffer.update(&[3, 4], 0, 1, 1).unwrap();
        assert_eq!(buffer.values(), &[6.0, 4.0]);
    }

    #[test]
    fn test_rational_needs_suppression() {
        let description = ChannelDescription::new("Ratio", DataType::UintLe, 0, 8, 1).with_conversion(
            Arc::new(ConversionDefinition::new(
                0x20,
                ConversionType::Rational,
                vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0],
            )),
        );
        let ch = channel(description);
        let factory = never_native();
        assert!(matches!(
            factory.allocate(&ch, 1, false),
            Err(Error::UnsupportedChannel(_))
        ));

        let mut buffer = factory.allocate(&ch, 1, true).unwrap();
        buffer.update(&[9], 0, 0, 1).unwrap();
        assert_eq!(buffer.values(), &[9.0]);
    }

    #[test]
    fn test_foreign_byte_order_is_unsupported() {
        let foreign = if cfg!(target_endian = "little") {
            DataType::UintBe
        } else {
            DataType::UintLe
        };
        let ch = channel(ChannelDescription::new("Swapped", foreign, 0, 16, 2));
        let err = never_native().allocate(&ch, 1, true).unwrap_err();
        assert!(err.is_unsupported());
        assert!(err.to_string().contains("Swapped"));

        // single byte fields have no byte order to disagree on
        let ch = channel(ChannelDescription::new("Byte", foreign, 0, 8, 1));
        assert!(never_native().allocate(&ch, 1, false).is_ok());
    }

    #[test]
    fn test_non_numeric_fields_have_no_strategy() {
        let ch = channel(ChannelDescription::new("Vin", DataType::StringAscii, 0, 136, 17));
        assert!(matches!(
            never_native().allocate(&ch, 1, true),
            Err(Error::UnsupportedChannel(_))
        ));
    }
}
