//! Media format descriptors and byte/time conversion.
//!
//! A [`MediaFormat`] is a small `Copy` value. Ports take a copy of the
//! upstream format when it propagates; nothing shares format storage.

/// Payload encoding carried by a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataFormat {
    /// Linear PCM samples.
    #[default]
    Pcm,
    /// Compressed frames packetized over PCM framing.
    Packetized,
    /// Raw compressed bitstream.
    RawCompressed,
    /// Raw compressed data carried in one buffer per channel.
    DeinterleavedRaw,
}

impl DataFormat {
    /// Whether byte counts map linearly to time.
    pub fn is_pcm_or_packetized(self) -> bool {
        matches!(self, Self::Pcm | Self::Packetized)
    }
}

/// Channel arrangement of PCM data in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interleaving {
    /// Samples of all channels alternate in one buffer.
    #[default]
    Interleaved,
    /// One buffer; channel `c` occupies the `c`-th equal slice.
    DeinterleavedPacked,
    /// One buffer per channel; every channel reports its own length.
    DeinterleavedUnpacked,
    /// One buffer per channel; only channel 0 carries the length.
    DeinterleavedUnpackedV2,
}

impl Interleaving {
    /// Whether each channel lives in its own buffer view.
    pub fn is_unpacked(self) -> bool {
        matches!(self, Self::DeinterleavedUnpacked | Self::DeinterleavedUnpackedV2)
    }
}

/// Port media format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaFormat {
    /// Payload encoding.
    pub data_format: DataFormat,
    /// Channel layout (meaningful for PCM and packetized data).
    pub interleaving: Interleaving,
    /// Channel count.
    pub num_channels: u16,
    /// Frames per second.
    pub sample_rate: u32,
    /// Bytes per sample (PCM word size).
    pub bytes_per_sample: u16,
}

impl Default for MediaFormat {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

const NS_PER_SEC: u64 = 1_000_000_000;
const NS_PER_US: u64 = 1_000;

impl MediaFormat {
    /// Format that has not been negotiated yet.
    pub const UNKNOWN: Self = Self {
        data_format: DataFormat::Pcm,
        interleaving: Interleaving::Interleaved,
        num_channels: 0,
        sample_rate: 0,
        bytes_per_sample: 0,
    };

    /// Interleaved PCM shorthand.
    pub const fn pcm(num_channels: u16, sample_rate: u32, bytes_per_sample: u16) -> Self {
        Self {
            data_format: DataFormat::Pcm,
            interleaving: Interleaving::Interleaved,
            num_channels,
            sample_rate,
            bytes_per_sample,
        }
    }

    /// Returns a copy with a different channel layout.
    pub const fn with_interleaving(mut self, interleaving: Interleaving) -> Self {
        self.interleaving = interleaving;
        self
    }

    /// Returns a copy with a different payload encoding.
    pub const fn with_data_format(mut self, data_format: DataFormat) -> Self {
        self.data_format = data_format;
        self
    }

    /// Whether the format has been negotiated.
    pub fn is_valid(&self) -> bool {
        match self.data_format {
            DataFormat::Pcm | DataFormat::Packetized => {
                self.num_channels > 0 && self.sample_rate > 0 && self.bytes_per_sample > 0
            }
            DataFormat::RawCompressed => true,
            DataFormat::DeinterleavedRaw => self.num_channels > 0,
        }
    }

    /// PCM with more than one channel in a non-interleaved layout.
    pub fn is_deinterleaved_multichannel_pcm(&self) -> bool {
        self.data_format.is_pcm_or_packetized()
            && self.num_channels > 1
            && self.interleaving != Interleaving::Interleaved
    }

    /// PCM/packetized in one of the unpacked layouts.
    pub fn is_pcm_unpacked(&self) -> bool {
        self.data_format.is_pcm_or_packetized() && self.interleaving.is_unpacked()
    }

    /// PCM/packetized in the deinterleaved-packed layout with several channels.
    pub fn is_deinterleaved_packed(&self) -> bool {
        self.data_format.is_pcm_or_packetized()
            && self.interleaving == Interleaving::DeinterleavedPacked
            && self.num_channels > 1
    }

    /// Number of buffer views a port with this format carries.
    pub fn bufs_num(&self) -> usize {
        if self.is_pcm_unpacked() || self.data_format == DataFormat::DeinterleavedRaw {
            usize::from(self.num_channels.max(1))
        } else {
            1
        }
    }

    /// Bytes of one multi-channel sample frame.
    pub fn bytes_per_frame(&self) -> u32 {
        u32::from(self.bytes_per_sample) * u32::from(self.num_channels)
    }

    /// Per-buffer length converted to per-channel length.
    pub fn len_per_buf_to_per_ch(&self, len_per_buf: u32) -> u32 {
        if self.bufs_num() > 1 || self.num_channels == 0 {
            len_per_buf
        } else {
            len_per_buf / u32::from(self.num_channels)
        }
    }

    /// Duration of `bytes` across all channels, carrying sub-microsecond
    /// remainders in `frac_ns`.
    pub fn bytes_to_us(&self, bytes: u64, frac_ns: Option<&mut u64>) -> u64 {
        let bytes_per_sec = u64::from(self.sample_rate) * u64::from(self.bytes_per_frame());
        Self::to_us(bytes, bytes_per_sec, frac_ns)
    }

    /// Duration of `bytes` of a single channel.
    pub fn bytes_per_ch_to_us(&self, bytes: u64, frac_ns: Option<&mut u64>) -> u64 {
        let bytes_per_sec = u64::from(self.sample_rate) * u64::from(self.bytes_per_sample);
        Self::to_us(bytes, bytes_per_sec, frac_ns)
    }

    /// Bytes of a single channel covering `us` microseconds.
    pub fn us_to_bytes_per_ch(&self, us: u64) -> u64 {
        let samples = us * u64::from(self.sample_rate) / 1_000_000;
        samples * u64::from(self.bytes_per_sample)
    }

    /// Duration of a per-buffer length, honoring the layout.
    pub fn len_per_buf_to_us(&self, len_per_buf: u32, frac_ns: Option<&mut u64>) -> u64 {
        if !self.data_format.is_pcm_or_packetized() {
            return 0;
        }
        if self.is_pcm_unpacked() {
            self.bytes_per_ch_to_us(u64::from(len_per_buf), frac_ns)
        } else {
            self.bytes_to_us(u64::from(len_per_buf), frac_ns)
        }
    }

    fn to_us(bytes: u64, bytes_per_sec: u64, frac_ns: Option<&mut u64>) -> u64 {
        if bytes_per_sec == 0 {
            return 0;
        }
        let mut ns = bytes * NS_PER_SEC / bytes_per_sec;
        if let Some(carry) = frac_ns {
            ns += *carry;
            *carry = ns % NS_PER_US;
        }
        ns / NS_PER_US
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_format_is_invalid() {
        assert!(!MediaFormat::default().is_valid());
        assert!(MediaFormat::pcm(2, 48_000, 2).is_valid());
    }

    #[test]
    fn bufs_num_follows_layout() {
        let base = MediaFormat::pcm(4, 48_000, 2);
        assert_eq!(base.bufs_num(), 1);
        assert_eq!(base.with_interleaving(Interleaving::DeinterleavedPacked).bufs_num(), 1);
        assert_eq!(base.with_interleaving(Interleaving::DeinterleavedUnpacked).bufs_num(), 4);
        assert_eq!(base.with_data_format(DataFormat::DeinterleavedRaw).bufs_num(), 4);
    }

    #[test]
    fn one_ms_of_stereo_16bit() {
        let fmt = MediaFormat::pcm(2, 48_000, 2);
        // 48 frames * 4 bytes = 1 ms
        assert_eq!(fmt.bytes_to_us(192, None), 1_000);
        assert_eq!(fmt.bytes_per_ch_to_us(96, None), 1_000);
        assert_eq!(fmt.us_to_bytes_per_ch(1_000), 96);
    }

    #[test]
    fn fractional_carry_accumulates() {
        // One frame at 44.1 kHz is 22.675.. us.
        let fmt = MediaFormat::pcm(1, 44_100, 2);
        let mut carry = 0;
        let total: u64 = (0..441).map(|_| fmt.bytes_to_us(2, Some(&mut carry))).sum();
        assert!((9_999..=10_000).contains(&total), "got {total}");

        let truncated: u64 = (0..441).map(|_| fmt.bytes_to_us(2, None)).sum();
        assert!(truncated < total);
    }

    #[test]
    fn raw_has_no_duration() {
        let raw = MediaFormat::pcm(2, 48_000, 2).with_data_format(DataFormat::RawCompressed);
        assert_eq!(raw.len_per_buf_to_us(1_000, None), 0);
    }
}
