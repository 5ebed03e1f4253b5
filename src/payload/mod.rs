//! Sensor Payload Format (version 4)
//!
//! Decodes the packed little-endian sample buffers produced by the wearable
//! devices once the collector's zstd compression has been removed.
//!
//! Layout:
//!
//! ```text
//! header   version(1) | channel_count(1) | reserved(2)
//!          channel_count x [ name(8) | electrode_type(1) | reserved(1) ]
//! samples  channel_count x i16   signals
//!          3 x i16               accelerometer
//!          3 x i16               gyroscope
//!          channel_count x u8    impedance
//! ```
//!
//! Electrode type `3` marks the stimulus/trigger channel.

pub mod triggers;

pub use triggers::{extract_triggers, PayloadChunk, TriggerExtraction};

use thiserror::Error;

/// Only supported payload revision
pub const PAYLOAD_VERSION: u8 = 0x04;

/// version + channel_count + reserved
pub const HEADER_BASE_SIZE: usize = 4;

/// name(8) + type(1) + reserved(1)
pub const CHANNEL_DESCRIPTOR_SIZE: usize = 10;

/// Fixed per-sample IMU block: 3 x i16 accel + 3 x i16 gyro
pub const IMU_BLOCK_SIZE: usize = 12;

/// Payload decoding errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload too short for header: {0} bytes")]
    TooShort(usize),

    #[error("unsupported payload version {0} (expected 4)")]
    UnsupportedVersion(u8),

    #[error("payload too short for electrode config: expected {expected} bytes, got {actual}")]
    TruncatedDescriptors { expected: usize, actual: usize },
}

/// Electrode kind carried in each channel descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Eeg,
    Emg,
    Eog,
    /// Digital stimulus marker channel
    Stim,
    Misc,
}

impl ChannelKind {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => ChannelKind::Eeg,
            1 => ChannelKind::Emg,
            2 => ChannelKind::Eog,
            3 => ChannelKind::Stim,
            _ => ChannelKind::Misc,
        }
    }
}

/// One decoded channel descriptor
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ChannelDescriptor {
    pub name: String,
    pub kind: ChannelKind,
}

/// Decoded header of a version 4 payload
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PayloadHeader {
    pub version: u8,
    pub channels: Vec<ChannelDescriptor>,
    /// Index of the trigger channel; the last stim descriptor wins
    pub trigger_channel: Option<usize>,
    /// Offset of the first sample
    pub header_size: usize,
}

impl PayloadHeader {
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Bytes per sample: signals + IMU + impedance
    pub fn sample_stride(&self) -> usize {
        sample_stride(self.channel_count())
    }
}

/// Bytes per sample for `channel_count` channels
pub fn sample_stride(channel_count: usize) -> usize {
    channel_count * 2 + IMU_BLOCK_SIZE + channel_count
}

/// Parse the header and channel descriptor table.
pub fn parse_header(data: &[u8]) -> Result<PayloadHeader, PayloadError> {
    if data.len() < HEADER_BASE_SIZE {
        return Err(PayloadError::TooShort(data.len()));
    }

    let version = data[0];
    if version != PAYLOAD_VERSION {
        return Err(PayloadError::UnsupportedVersion(version));
    }

    let channel_count = data[1] as usize;
    let header_size = HEADER_BASE_SIZE + channel_count * CHANNEL_DESCRIPTOR_SIZE;
    if data.len() < header_size {
        return Err(PayloadError::TruncatedDescriptors {
            expected: header_size,
            actual: data.len(),
        });
    }

    let mut channels = Vec::with_capacity(channel_count);
    let mut trigger_channel = None;
    for (idx, descriptor) in data[HEADER_BASE_SIZE..header_size]
        .chunks_exact(CHANNEL_DESCRIPTOR_SIZE)
        .enumerate()
    {
        let name_bytes = &descriptor[..8];
        let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(8);
        let kind = ChannelKind::from_code(descriptor[8]);
        if kind == ChannelKind::Stim {
            trigger_channel = Some(idx);
        }
        channels.push(ChannelDescriptor {
            name: String::from_utf8_lossy(&name_bytes[..name_len]).into_owned(),
            kind,
        });
    }

    Ok(PayloadHeader {
        version,
        channels,
        trigger_channel,
        header_size,
    })
}

/// Decoded view over a payload's sample block.
pub struct SampleView<'a> {
    header: PayloadHeader,
    samples: &'a [u8],
}

impl<'a> SampleView<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, PayloadError> {
        let header = parse_header(data)?;
        let samples = &data[header.header_size..];
        Ok(Self { header, samples })
    }

    pub fn header(&self) -> &PayloadHeader {
        &self.header
    }

    /// Whole samples present; a trailing partial sample is ignored.
    pub fn sample_count(&self) -> usize {
        self.samples.len() / self.header.sample_stride()
    }

    /// Signed 16-bit value of `channel` at sample `index`.
    pub fn channel_value(&self, index: usize, channel: usize) -> Option<i16> {
        if channel >= self.header.channel_count() || index >= self.sample_count() {
            return None;
        }
        let offset = index * self.header.sample_stride() + channel * 2;
        let bytes = self.samples.get(offset..offset + 2)?;
        Some(i16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Trigger channel samples in order, empty when the payload has none.
    pub fn trigger_values(&self) -> impl Iterator<Item = i16> + '_ {
        let count = match self.header.trigger_channel {
            Some(_) => self.sample_count(),
            None => 0,
        };
        let channel = self.header.trigger_channel.unwrap_or(0);
        (0..count).filter_map(move |i| self.channel_value(i, channel))
    }
}

/// Build a version 4 payload. Used by tests and the `inspect` tooling fixtures.
pub fn encode_payload(channels: &[(&str, u8)], samples: &[Vec<i16>]) -> Vec<u8> {
    let n = channels.len();
    let mut out = Vec::with_capacity(
        HEADER_BASE_SIZE + n * CHANNEL_DESCRIPTOR_SIZE + samples.len() * sample_stride(n),
    );
    out.push(PAYLOAD_VERSION);
    out.push(n as u8);
    out.extend_from_slice(&[0, 0]);
    for (name, kind) in channels {
        let mut name_buf = [0u8; 8];
        let bytes = name.as_bytes();
        let len = bytes.len().min(8);
        name_buf[..len].copy_from_slice(&bytes[..len]);
        out.extend_from_slice(&name_buf);
        out.push(*kind);
        out.push(0);
    }
    for sample in samples {
        for ch in 0..n {
            let value = sample.get(ch).copied().unwrap_or(0);
            out.extend_from_slice(&value.to_le_bytes());
        }
        out.extend_from_slice(&[0u8; IMU_BLOCK_SIZE]);
        out.extend(std::iter::repeat(0u8).take(n));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stride_matches_layout() {
        // 8 channels: 16 signal bytes + 12 IMU + 8 impedance
        assert_eq!(sample_stride(8), 36);
        assert_eq!(sample_stride(0), 12);
    }

    #[test]
    fn test_parse_header_channels() {
        let payload = encode_payload(&[("Fp1", 0), ("TRIG", 3), ("EMG-L", 1)], &[]);
        let header = parse_header(&payload).unwrap();
        assert_eq!(header.channel_count(), 3);
        assert_eq!(header.channels[0].name, "Fp1");
        assert_eq!(header.channels[1].kind, ChannelKind::Stim);
        assert_eq!(header.channels[2].kind, ChannelKind::Emg);
        assert_eq!(header.trigger_channel, Some(1));
        assert_eq!(header.header_size, 4 + 30);
    }

    #[test]
    fn test_last_trigger_channel_wins() {
        let payload = encode_payload(&[("T1", 3), ("Cz", 0), ("T2", 3)], &[]);
        assert_eq!(parse_header(&payload).unwrap().trigger_channel, Some(2));
    }

    #[test]
    fn test_rejects_short_and_unknown_versions() {
        assert_eq!(parse_header(&[4, 1]), Err(PayloadError::TooShort(2)));
        assert_eq!(
            parse_header(&[3, 0, 0, 0]),
            Err(PayloadError::UnsupportedVersion(3))
        );
        assert_eq!(
            parse_header(&[4, 2, 0, 0, 1, 2, 3]),
            Err(PayloadError::TruncatedDescriptors { expected: 24, actual: 7 })
        );
    }

    #[test]
    fn test_sample_view_reads_signed_values() {
        let payload = encode_payload(
            &[("Cz", 0), ("TRIG", 3)],
            &[vec![-5, 0], vec![12, 7], vec![-32768, 0]],
        );
        let mut truncated = payload.clone();
        truncated.extend_from_slice(&[1, 2, 3]); // partial trailing sample

        let view = SampleView::parse(&truncated).unwrap();
        assert_eq!(view.sample_count(), 3);
        assert_eq!(view.channel_value(0, 0), Some(-5));
        assert_eq!(view.channel_value(2, 0), Some(-32768));
        assert_eq!(view.channel_value(3, 0), None);
        assert_eq!(view.trigger_values().collect::<Vec<_>>(), vec![0, 7, 0]);
    }

    #[test]
    fn test_no_trigger_channel_yields_no_values() {
        let payload = encode_payload(&[("Cz", 0)], &[vec![1], vec![2]]);
        let view = SampleView::parse(&payload).unwrap();
        assert_eq!(view.trigger_values().count(), 0);
    }
}
