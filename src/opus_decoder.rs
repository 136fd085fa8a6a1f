// Pure Rust Ogg Opus container reader
//
// Copyright (c) 2016 est31 <MTest31@outlook.com>
// and contributors. All rights reserved.
// Licensed under MIT license, or Apache 2 license,
// at your option. Please see the LICENSE file
// attached to this source distribution for details.

/*!
The external Opus packet decoder collaborator.

Everything above this module speaks in terms of the [`PacketDecoder`] trait; the only
concrete implementation wraps libopus's multistream decoder via the `opus` crate. The trait
exists so the decode driver and sample pump can be exercised in tests without linking libopus.
*/

use crate::error::{Error, Result};
use crate::header::OpusHead;

/// 48 kHz is the only rate Opus ever decodes to internally; input sample rate in `OpusHead`
/// is informational only (RFC 7845 §5.1).
pub const DECODE_SAMPLE_RATE: u32 = 48_000;

/// A decoder that turns Opus packets into PCM, matching one link's channel mapping.
///
/// Implementations decode one packet at a time; concealment for lost packets is requested by
/// passing an empty slice, per the underlying `opus` crate's convention.
pub trait PacketDecoder {
    /// Decodes one packet to interleaved 16-bit PCM, returning the number of samples produced
    /// per channel. `packet` may be empty to request loss concealment.
    fn decode(&mut self, packet: &[u8], output: &mut [i16]) -> Result<usize>;

    /// As [`decode`](PacketDecoder::decode), but producing interleaved `f32` PCM.
    fn decode_float(&mut self, packet: &[u8], output: &mut [f32]) -> Result<usize>;

    /// The number of interleaved output channels this decoder was built for.
    fn channel_count(&self) -> usize;

    /// Resets decoder state for reuse with a link whose mapping is unchanged (as judged by
    /// [`decoder_matches`]), re-applying the new link's output gain.
    fn reset_for(&mut self, head: &OpusHead) -> Result<()>;
}

/// Whether an existing decoder can be reset in place for a new link, or must be rebuilt
/// (spec.md §4.F `make_decode_ready`): identical iff stream count, coupled count, channel
/// count, and channel mapping all match.
pub fn decoder_matches(head: &OpusHead, other: &OpusHead) -> bool {
    head.stream_count == other.stream_count
        && head.coupled_count == other.coupled_count
        && head.channel_count == other.channel_count
        && head.mapping == other.mapping
}

/// A [`PacketDecoder`] backed by libopus's multistream decoder.
pub struct OpusMultistreamDecoder {
    inner: opus::MSDecoder,
    channels: usize,
}

impl OpusMultistreamDecoder {
    /// Builds a decoder matching `head`'s channel mapping and applies its output gain.
    pub fn new(head: &OpusHead) -> Result<Self> {
        let mapping: Vec<u8> = head.mapping.iter().copied().collect();
        let inner = opus::MSDecoder::new(
            DECODE_SAMPLE_RATE,
            head.stream_count,
            head.coupled_count,
            &mapping,
        )
        .map_err(|_| Error::Fault)?;
        let mut decoder =
            OpusMultistreamDecoder { inner, channels: head.channel_count as usize };
        decoder.set_gain(head.output_gain)?;
        Ok(decoder)
    }

    /// Applies a Q7.8 dB output gain, as carried in `OpusHead::output_gain`.
    ///
    /// libopus's `OPUS_SET_GAIN` takes Q8 dB directly, which is the same fixed-point scale
    /// `OpusHead` already uses, so the value passes through unconverted.
    fn set_gain(&mut self, gain_q78: i16) -> Result<()> {
        self.inner.set_gain(gain_q78 as i32).map_err(|_| Error::Fault)
    }
}

impl PacketDecoder for OpusMultistreamDecoder {
    fn decode(&mut self, packet: &[u8], output: &mut [i16]) -> Result<usize> {
        self.inner.decode(packet, output, false).map_err(|_| Error::BadPacket)
    }

    fn decode_float(&mut self, packet: &[u8], output: &mut [f32]) -> Result<usize> {
        self.inner.decode_float(packet, output, false).map_err(|_| Error::BadPacket)
    }

    fn channel_count(&self) -> usize {
        self.channels
    }

    fn reset_for(&mut self, head: &OpusHead) -> Result<()> {
        self.set_gain(head.output_gain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(stream_count: u8, coupled_count: u8, channel_count: u8, mapping: &[u8]) -> OpusHead {
        OpusHead {
            version: 0,
            channel_count,
            pre_skip: 0,
            input_sample_rate: 48000,
            output_gain: 0,
            mapping_family: if stream_count > 1 { 1 } else { 0 },
            stream_count,
            coupled_count,
            mapping: mapping.iter().copied().collect(),
        }
    }

    #[test]
    fn decoder_matches_identical_mapping() {
        let a = head(1, 1, 2, &[0, 1]);
        let b = head(1, 1, 2, &[0, 1]);
        assert!(decoder_matches(&a, &b));
    }

    #[test]
    fn decoder_matches_rejects_different_mapping() {
        let a = head(1, 1, 2, &[0, 1]);
        let b = head(2, 0, 2, &[0, 1]);
        assert!(!decoder_matches(&a, &b));
    }
}
