//! Stream format descriptions.

use audioloop_ipc::SourceKind;

use crate::{BYTES_PER_SAMPLE, SAMPLE_RATE};

/// Channel layout of a PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLayout {
    Mono,
    Stereo,
}

impl ChannelLayout {
    /// Number of interleaved channels.
    pub fn channel_count(self) -> usize {
        match self {
            Self::Mono => 1,
            Self::Stereo => 2,
        }
    }
}

/// Sample encoding. Only signed 16-bit little-endian PCM is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleFormat {
    #[default]
    Pcm16,
}

/// Format of one capture or playback endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioStreamSpec {
    pub sample_rate: u32,
    pub channel_layout: ChannelLayout,
    pub sample_format: SampleFormat,
}

impl AudioStreamSpec {
    pub fn new(sample_rate: u32, channel_layout: ChannelLayout) -> Self {
        Self {
            sample_rate,
            channel_layout,
            sample_format: SampleFormat::Pcm16,
        }
    }

    /// Stereo input used for system playback capture.
    pub fn system_capture() -> Self {
        Self::new(SAMPLE_RATE, ChannelLayout::Stereo)
    }

    /// Mono input used for the microphone.
    pub fn mic_capture() -> Self {
        Self::new(SAMPLE_RATE, ChannelLayout::Mono)
    }

    /// Stereo output used by the sink.
    pub fn playback() -> Self {
        Self::new(SAMPLE_RATE, ChannelLayout::Stereo)
    }

    /// Native input format of a capture source.
    pub fn for_source(kind: SourceKind) -> Self {
        match kind {
            SourceKind::SystemCapture => Self::system_capture(),
            SourceKind::MicCapture => Self::mic_capture(),
        }
    }

    /// Same layout at a different sample rate.
    pub fn with_sample_rate(self, sample_rate: u32) -> Self {
        Self {
            sample_rate,
            ..self
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channel_layout.channel_count()
    }

    /// Bytes per frame: `2 × channel_count` for PCM16.
    pub fn bytes_per_frame(&self) -> usize {
        BYTES_PER_SAMPLE * self.channel_count()
    }

    /// Whole frames contained in `bytes`; a trailing partial frame is ignored.
    pub fn frames_in(&self, bytes: usize) -> usize {
        bytes / self.bytes_per_frame()
    }

    /// Bytes needed to hold `frames` frames.
    pub fn bytes_for(&self, frames: usize) -> usize {
        frames * self.bytes_per_frame()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_per_frame() {
        assert_eq!(AudioStreamSpec::system_capture().bytes_per_frame(), 4);
        assert_eq!(AudioStreamSpec::mic_capture().bytes_per_frame(), 2);
        assert_eq!(AudioStreamSpec::playback().bytes_per_frame(), 4);
    }

    #[test]
    fn test_partial_frames_are_dropped() {
        let stereo = AudioStreamSpec::system_capture();
        assert_eq!(stereo.frames_in(10), 2);
        assert_eq!(stereo.frames_in(3), 0);
        assert_eq!(AudioStreamSpec::mic_capture().frames_in(7), 3);
    }

    #[test]
    fn test_endpoint_rates() {
        assert_eq!(AudioStreamSpec::playback().sample_rate, 44_100);
        assert_eq!(
            AudioStreamSpec::for_source(SourceKind::MicCapture).channel_layout,
            ChannelLayout::Mono
        );
        assert_eq!(
            AudioStreamSpec::mic_capture().with_sample_rate(48_000).sample_rate,
            48_000
        );
    }
}
