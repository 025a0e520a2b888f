use std::fmt;

use once_cell::race::OnceBox;
use tracing::debug;

use crate::blocks::ChannelDescription;
use crate::conversion::{ConversionResolver, ConversionRule, DisplayRule};
use crate::error::Result;
use crate::layout::RawLayout;

/// Everything a sample buffer needs to decode one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelDecodeSpec {
    raw: RawLayout,
    conversion: ConversionRule,
    display: DisplayRule,
}

impl ChannelDecodeSpec {
    pub fn new(raw: RawLayout, conversion: ConversionRule, display: DisplayRule) -> Self {
        Self { raw, conversion, display }
    }

    pub fn raw_layout(&self) -> &RawLayout {
        &self.raw
    }

    pub fn conversion(&self) -> &ConversionRule {
        &self.conversion
    }

    pub fn display(&self) -> &DisplayRule {
        &self.display
    }
}

/// A channel of an open document.
///
/// The decode spec is built on first use. Concurrent first calls may each
/// build one; a single result is published and every caller sees it.
/// Failures are not memoized.
pub struct Channel {
    description: ChannelDescription,
    resolver: ConversionResolver,
    spec: OnceBox<ChannelDecodeSpec>,
}

impl Channel {
    pub fn new(description: ChannelDescription, resolver: ConversionResolver) -> Self {
        Self {
            description,
            resolver,
            spec: OnceBox::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.description.name
    }

    pub fn description(&self) -> &ChannelDescription {
        &self.description
    }

    pub fn decoder_spec(&self) -> Result<&ChannelDecodeSpec> {
        self.spec
            .get_or_try_init(|| self.create_decoder_spec().map(Box::new))
    }

    fn create_decoder_spec(&self) -> Result<ChannelDecodeSpec> {
        let raw = RawLayout::from_channel(&self.description)?;
        let (conversion, display) = self
            .resolver
            .resolve(self.description.conversion.as_deref())?;
        debug!(
            channel = %self.description.name,
            word = ?raw.native_word(),
            conversion = %conversion,
            "decode spec created"
        );
        Ok(ChannelDecodeSpec::new(raw, conversion, display))
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("description", &self.description)
            .field("spec", &self.spec.get())
            .finish()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description.name)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::blocks::{ConversionDefinition, ConversionType, DataType, CHANNEL_TYPE_VARIABLE_LENGTH};
    use crate::error::Error;
    use crate::layout::NativeWord;

    fn channel(description: ChannelDescription) -> Channel {
        Channel::new(description, ConversionResolver::default())
    }

    #[test]
    fn test_decoder_spec() {
        let description = ChannelDescription::new("EngineTemp", DataType::UintLe, 2, 16, 9)
            .with_record_id_size(1)
            .with_conversion(Arc::new(ConversionDefinition::linear(0x40, -40.0, 0.1)));
        let ch = channel(description);
        let spec = ch.decoder_spec().unwrap();

        assert_eq!(spec.raw_layout().total_byte_offset(), 3);
        assert_eq!(spec.raw_layout().native_word(), Some(NativeWord::U16));
        assert_eq!(spec.conversion(), &ConversionRule::Linear { scale: 0.1, offset: -40.0 });
        assert_eq!(spec.display(), &DisplayRule::None);
        assert_eq!(ch.to_string(), "EngineTemp");
    }

    #[test]
    fn test_decoder_spec_is_memoized() {
        let ch = channel(ChannelDescription::new("Speed", DataType::FloatLe, 0, 64, 8));
        let first = ch.decoder_spec().unwrap() as *const ChannelDecodeSpec;
        let second = ch.decoder_spec().unwrap() as *const ChannelDecodeSpec;
        assert_eq!(first, second);
    }

    #[test]
    fn test_concurrent_first_access_converges() {
        let ch = channel(ChannelDescription::new("Rpm", DataType::IntLe, 0, 32, 4));
        let specs: Vec<usize> = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| ch.decoder_spec().unwrap() as *const ChannelDecodeSpec as usize))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(specs.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_errors_are_not_memoized() {
        let description = ChannelDescription::new("Gear", DataType::UintLe, 0, 8, 1).with_conversion(
            Arc::new(ConversionDefinition::new(0x80, ConversionType::Algebraic, vec![])),
        );
        let ch = channel(description);
        assert!(matches!(ch.decoder_spec(), Err(Error::UnsupportedConversion { .. })));
        assert!(matches!(ch.decoder_spec(), Err(Error::UnsupportedConversion { .. })));
    }

    #[test]
    fn test_unsupported_channels() {
        let mut vlsd = ChannelDescription::new("Payload", DataType::ByteArray, 0, 64, 8);
        vlsd.channel_type = CHANNEL_TYPE_VARIABLE_LENGTH;
        assert!(channel(vlsd).decoder_spec().unwrap_err().is_unsupported());

        let utf8 = ChannelDescription::new("Comment", DataType::StringUtf8, 0, 64, 8);
        assert!(channel(utf8).decoder_spec().unwrap_err().is_unsupported());

        let half = ChannelDescription::new("Half", DataType::FloatLe, 0, 16, 2);
        assert!(matches!(channel(half).decoder_spec(), Err(Error::Layout(_))));
    }
}
