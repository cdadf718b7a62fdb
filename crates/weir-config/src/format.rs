//! Media format tables.

use serde::{Deserialize, Serialize};
use weir_core::{DataFormat, Interleaving, MediaFormat};

use crate::error::ConfigError;

/// Payload encoding as written in TOML.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataFormatConfig {
    /// Linear PCM.
    #[default]
    Pcm,
    /// Compressed frames in PCM framing.
    Packetized,
    /// Raw compressed bitstream.
    RawCompressed,
    /// Raw compressed data, one buffer per channel.
    DeinterleavedRaw,
}

/// Channel layout as written in TOML.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InterleavingConfig {
    /// Samples of all channels alternate.
    #[default]
    Interleaved,
    /// Channels in equal slices of one buffer.
    DeinterleavedPacked,
    /// One buffer per channel, each with its own length.
    DeinterleavedUnpacked,
    /// One buffer per channel, length on channel 0 only.
    DeinterleavedUnpackedV2,
}

/// Port media format.
///
/// # TOML Format
///
/// ```toml
/// [module.format]
/// channels = 2
/// sample_rate = 48000
/// bytes_per_sample = 2
/// interleaving = "deinterleaved_packed"
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FormatConfig {
    /// Payload encoding.
    #[serde(default)]
    pub data: DataFormatConfig,

    /// Channel layout.
    #[serde(default)]
    pub interleaving: InterleavingConfig,

    /// Channel count.
    #[serde(default = "default_channels")]
    pub channels: u16,

    /// Frames per second.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// PCM word size in bytes.
    #[serde(default = "default_bytes_per_sample")]
    pub bytes_per_sample: u16,
}

fn default_channels() -> u16 {
    2
}

fn default_sample_rate() -> u32 {
    48000
}

fn default_bytes_per_sample() -> u16 {
    2
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            data: DataFormatConfig::Pcm,
            interleaving: InterleavingConfig::Interleaved,
            channels: default_channels(),
            sample_rate: default_sample_rate(),
            bytes_per_sample: default_bytes_per_sample(),
        }
    }
}

impl FormatConfig {
    /// Interleaved PCM.
    pub fn pcm(channels: u16, sample_rate: u32, bytes_per_sample: u16) -> Self {
        Self {
            channels,
            sample_rate,
            bytes_per_sample,
            ..Self::default()
        }
    }

    /// Set the channel layout.
    pub fn with_interleaving(mut self, interleaving: InterleavingConfig) -> Self {
        self.interleaving = interleaving;
        self
    }

    /// Converts to an engine format, rejecting formats that cannot carry data.
    pub fn to_media_format(&self, port: &str) -> Result<MediaFormat, ConfigError> {
        let fmt = MediaFormat::from(*self);
        if !fmt.is_valid() {
            return Err(ConfigError::invalid_format(
                port,
                "channels, sample_rate and bytes_per_sample must be non-zero",
            ));
        }
        if fmt.num_channels > 32 {
            return Err(ConfigError::invalid_format(port, "more than 32 channels"));
        }
        Ok(fmt)
    }
}

impl From<FormatConfig> for MediaFormat {
    fn from(c: FormatConfig) -> Self {
        let data_format = match c.data {
            DataFormatConfig::Pcm => DataFormat::Pcm,
            DataFormatConfig::Packetized => DataFormat::Packetized,
            DataFormatConfig::RawCompressed => DataFormat::RawCompressed,
            DataFormatConfig::DeinterleavedRaw => DataFormat::DeinterleavedRaw,
        };
        let interleaving = match c.interleaving {
            InterleavingConfig::Interleaved => Interleaving::Interleaved,
            InterleavingConfig::DeinterleavedPacked => Interleaving::DeinterleavedPacked,
            InterleavingConfig::DeinterleavedUnpacked => Interleaving::DeinterleavedUnpacked,
            InterleavingConfig::DeinterleavedUnpackedV2 => Interleaving::DeinterleavedUnpackedV2,
        };
        MediaFormat::pcm(c.channels, c.sample_rate, c.bytes_per_sample)
            .with_interleaving(interleaving)
            .with_data_format(data_format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let fmt: FormatConfig = toml::from_str("channels = 1").unwrap();
        assert_eq!(fmt.channels, 1);
        assert_eq!(fmt.sample_rate, 48000);
        assert_eq!(fmt.bytes_per_sample, 2);
        assert_eq!(fmt.interleaving, InterleavingConfig::Interleaved);
    }

    #[test]
    fn layout_names_are_snake_case() {
        let fmt: FormatConfig = toml::from_str(r#"interleaving = "deinterleaved_unpacked_v2""#).unwrap();
        let mf = fmt.to_media_format("m:in0").unwrap();
        assert_eq!(mf.interleaving, Interleaving::DeinterleavedUnpackedV2);
        assert_eq!(mf.bufs_num(), 2);
    }

    #[test]
    fn zero_rate_is_rejected() {
        let fmt = FormatConfig::pcm(2, 0, 2);
        let err = fmt.to_media_format("m:out0").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFormat { ref port, .. } if port == "m:out0"));
    }

    #[test]
    fn raw_compressed_needs_no_rate() {
        let fmt = FormatConfig {
            data: DataFormatConfig::RawCompressed,
            sample_rate: 0,
            ..FormatConfig::default()
        };
        assert!(fmt.to_media_format("m:in0").is_ok());
    }
}
