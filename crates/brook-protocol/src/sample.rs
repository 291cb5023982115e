//! Sample format arithmetic.
//!
//! Pure helpers for describing PCM data: byte and frame sizes, rate and
//! channel validation, and textual formatting. Nothing here touches the
//! wire or the connection core.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum number of channels in a sample specification.
pub const CHANNELS_MAX: u8 = 32;

/// Maximum sample rate in Hz.
pub const RATE_MAX: u32 = 48_000 * 4;

/// PCM sample formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// Unsigned 8 bit PCM.
    U8,
    /// 8 bit a-Law.
    ALaw,
    /// 8 bit mu-Law.
    ULaw,
    /// Signed 16 bit PCM, little endian.
    S16Le,
    /// Signed 16 bit PCM, big endian.
    S16Be,
    /// 32 bit IEEE floating point PCM in [-1.0, 1.0], little endian.
    Float32Le,
    /// 32 bit IEEE floating point PCM in [-1.0, 1.0], big endian.
    Float32Be,
    /// Signed 32 bit PCM, little endian.
    S32Le,
    /// Signed 32 bit PCM, big endian.
    S32Be,
}

impl SampleFormat {
    /// Size of a single sample in bytes.
    pub const fn size(self) -> usize {
        match self {
            SampleFormat::U8 | SampleFormat::ALaw | SampleFormat::ULaw => 1,
            SampleFormat::S16Le | SampleFormat::S16Be => 2,
            SampleFormat::Float32Le
            | SampleFormat::Float32Be
            | SampleFormat::S32Le
            | SampleFormat::S32Be => 4,
        }
    }

    /// Canonical lowercase name.
    pub const fn name(self) -> &'static str {
        match self {
            SampleFormat::U8 => "u8",
            SampleFormat::ALaw => "alaw",
            SampleFormat::ULaw => "ulaw",
            SampleFormat::S16Le => "s16le",
            SampleFormat::S16Be => "s16be",
            SampleFormat::Float32Le => "float32le",
            SampleFormat::Float32Be => "float32be",
            SampleFormat::S32Le => "s32le",
            SampleFormat::S32Be => "s32be",
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SampleFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "u8" => Ok(SampleFormat::U8),
            "alaw" => Ok(SampleFormat::ALaw),
            "ulaw" | "mulaw" => Ok(SampleFormat::ULaw),
            "s16le" | "s16" => Ok(SampleFormat::S16Le),
            "s16be" => Ok(SampleFormat::S16Be),
            "float32le" | "float32" | "f32le" => Ok(SampleFormat::Float32Le),
            "float32be" | "f32be" => Ok(SampleFormat::Float32Be),
            "s32le" | "s32" => Ok(SampleFormat::S32Le),
            "s32be" => Ok(SampleFormat::S32Be),
            other => Err(format!("unknown sample format: {}", other)),
        }
    }
}

/// A complete sample specification: format, rate and channel count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleSpec {
    pub format: SampleFormat,
    /// Sample rate in Hz.
    pub rate: u32,
    pub channels: u8,
}

impl SampleSpec {
    pub const fn new(format: SampleFormat, rate: u32, channels: u8) -> Self {
        Self {
            format,
            rate,
            channels,
        }
    }

    /// True when rate and channel count are within protocol limits.
    pub const fn valid(&self) -> bool {
        self.rate > 0 && self.rate <= RATE_MAX && self.channels > 0 && self.channels <= CHANNELS_MAX
    }

    /// Size of one frame (one sample per channel) in bytes.
    pub const fn frame_size(&self) -> usize {
        self.format.size() * self.channels as usize
    }

    /// Number of bytes one second of audio occupies.
    pub const fn bytes_per_second(&self) -> usize {
        self.frame_size() * self.rate as usize
    }

    /// Playback time of a buffer of `bytes` bytes.
    pub fn bytes_to_duration(&self, bytes: usize) -> Duration {
        let per_second = self.bytes_per_second();
        if per_second == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos((bytes as u64).saturating_mul(1_000_000_000) / per_second as u64)
    }

    /// Number of bytes needed to play for `duration`, rounded down to a
    /// whole frame.
    pub fn duration_to_bytes(&self, duration: Duration) -> usize {
        let bytes = (duration.as_nanos() * self.bytes_per_second() as u128 / 1_000_000_000) as usize;
        let frame = self.frame_size();
        if frame == 0 { 0 } else { bytes - bytes % frame }
    }
}

impl fmt::Display for SampleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}ch {}Hz", self.format, self.channels, self.rate)
    }
}
