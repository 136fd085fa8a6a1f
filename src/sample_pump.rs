// Pure Rust Ogg Opus container reader
//
// Copyright (c) 2016 est31 <MTest31@outlook.com>
// and contributors. All rights reserved.
// Licensed under MIT license, or Apache 2 license,
// at your option. Please see the LICENSE file
// attached to this source distribution for details.

/*!
Decodes staged packets into PCM and hands it to the caller (spec.md §4.H).

Every packet is decoded at its full, untrimmed duration into an internal scratch buffer;
end-trimming, pre-skip, and post-seek discard are all applied afterwards by adjusting where
in that buffer delivery starts, never by asking the decoder for fewer samples than it
produced. Sixteen-bit output additionally runs the scratch floats through a triangular-dithered,
noise-shaped quantizer before handing samples to the caller.
*/

use crate::decoder::{DecodeDriver, ReadyState};
use crate::error::{Error, Result};
use crate::granule;
use crate::link::Link;
use crate::opus_decoder::DECODE_SAMPLE_RATE;
use crate::page_reader::PageReader;

/// The longest an Opus packet is ever allowed to decode to (120 ms at 48 kHz).
const MAX_PACKET_SAMPLES: usize = 120 * 48;

/// Post-seek/pre-skip discard never keeps muting dither past this many consecutive silent
/// samples; past it, digital silence is delivered as true zeros instead of quiet noise.
const DITHER_MUTE_LIMIT: u32 = 65;

/// Output scale for the noise-shaped quantizer; keeps the attenuated peak just under full
/// scale so the filter's worst-case overshoot still can't clip (see `quantize_into`).
const OP_GAIN: f32 = 32753.0;
const OP_PRNG_GAIN: f32 = 1.0 / 4_294_967_295.0;

/// 48 kHz noise-shaping filter coefficients (Sebastian Gesemann's LAME-ATH-derived design).
const FCOEF_B: [f32; 4] = [2.2374, -0.7339, -0.1251, -0.6033];
const FCOEF_A: [f32; 4] = [0.9030, 0.0116, -0.5853, -0.2571];

fn op_rand(seed: u32) -> u32 {
    seed.wrapping_mul(96_314_165).wrapping_add(907_633_515)
}

/// Average bitrate in bits per second given a byte and sample count, or `None` if `samples`
/// isn't positive. Uses an `i128` intermediate rather than the original's manual overflow
/// branches; the final result is clamped to `i32::MAX` either way.
pub(crate) fn calc_bitrate(bytes: u64, samples: i64) -> Option<i32> {
    if samples <= 0 {
        return None;
    }
    let num = bytes as i128 * DECODE_SAMPLE_RATE as i128 * 8 + (samples as i128 >> 1);
    let rate = num / samples as i128;
    Some(rate.min(i32::MAX as i128) as i32)
}

enum Delivery {
    Ready,
    Eof,
}

/// Owns the scratch PCM buffer, dither/noise-shaping state, and bitrate counters for one
/// stream. One instance lives for the whole lifetime of a reader; it notices link changes
/// itself and re-seeds accordingly.
pub struct SamplePump {
    scratch: Vec<f32>,
    pos: usize,
    len: usize,
    channels: usize,
    serialno: Option<u32>,
    bytes_tracked: u64,
    samples_tracked: u64,
    dither_seed: u32,
    dither_mute: u32,
    dither_a: Vec<f32>,
    dither_b: Vec<f32>,
}

impl SamplePump {
    pub fn new() -> Self {
        SamplePump {
            scratch: Vec::new(),
            pos: 0,
            len: 0,
            channels: 0,
            serialno: None,
            bytes_tracked: 0,
            samples_tracked: 0,
            dither_seed: 0,
            dither_mute: DITHER_MUTE_LIMIT,
            dither_a: Vec::new(),
            dither_b: Vec::new(),
        }
    }

    /// Drops any buffered PCM and forgets which link it was decoding for, without touching the
    /// bitrate counters. Used whenever the driver's staged packets are invalidated out from
    /// under it (raw seeks, page seeks) so the next packet re-seeds dither state cleanly.
    pub fn reset(&mut self) {
        self.pos = 0;
        self.len = 0;
        self.serialno = None;
    }

    /// Samples per channel still sitting in the scratch buffer, not yet delivered to a caller.
    pub(crate) fn buffered(&self) -> usize {
        self.len - self.pos
    }

    /// Zeroes the running bitrate counters. Called at open and after every seek, matching the
    /// instantaneous-bitrate counters' reset-on-discontinuity semantics (spec.md §4.G/§6).
    pub fn reset_bitrate_counters(&mut self) {
        self.bytes_tracked = 0;
        self.samples_tracked = 0;
    }

    /// Bits per second delivered since the last call, or `None` if nothing has been delivered
    /// yet. Resets the counters on every call, per spec.md §6 `bitrate_instant`.
    pub fn bitrate_instant(&mut self) -> Option<i32> {
        let rate = calc_bitrate(self.bytes_tracked, self.samples_tracked as i64);
        self.bytes_tracked = 0;
        self.samples_tracked = 0;
        rate
    }

    fn ensure_link(&mut self, serialno: u32, channels: usize) {
        if self.serialno == Some(serialno) && self.channels == channels {
            return;
        }
        self.channels = channels;
        self.serialno = Some(serialno);
        self.pos = 0;
        self.len = 0;
        self.scratch.clear();
        self.scratch.resize(channels * MAX_PACKET_SAMPLES, 0.0);
        self.dither_seed = serialno;
        self.dither_mute = DITHER_MUTE_LIMIT;
        self.dither_a = vec![0.0; channels * 4];
        self.dither_b = vec![0.0; channels * 4];
    }

    /// Decodes one already-popped packet into the scratch buffer, applying end-trimming and
    /// the running pre-skip/post-seek discard, and updates the bitrate counters for the
    /// samples that survive.
    fn decode_packet(
        &mut self,
        driver: &mut DecodeDriver,
        serialno: u32,
        pkt: crate::decoder::StagedPacket,
        prev_gp: Option<i64>,
    ) -> Result<()> {
        let decoder = driver.decoder_mut().ok_or(Error::Impossible)?;
        self.ensure_link(serialno, decoder.channel_count());

        let duration = pkt.duration as i64;
        let trimmed = if pkt.is_link_end {
            match prev_gp {
                Some(p) => {
                    if granule::cmp(pkt.granule_position, p)? <= 0 {
                        0
                    } else {
                        granule::diff(pkt.granule_position, p)?.clamp(0, duration)
                    }
                }
                None => duration,
            }
        } else {
            duration
        };

        let channels = self.channels.max(1);
        let cap = channels * MAX_PACKET_SAMPLES;
        if self.scratch.len() < cap {
            self.scratch.resize(cap, 0.0);
        }
        decoder.decode_float(&pkt.data, &mut self.scratch[..cap])?;

        let trimmed = trimmed as usize;
        let discard = (driver.cur_discard_count as usize).min(trimmed);
        driver.cur_discard_count -= discard as u32;
        self.pos = discard;
        self.len = trimmed;

        self.bytes_tracked += pkt.data.len() as u64;
        self.samples_tracked += (self.len - self.pos) as u64;
        Ok(())
    }

    /// Ensures the scratch buffer has deliverable samples (or the stream is exhausted),
    /// decoding packets and fetching pages as needed. Mirrors the original's `op_read_native`
    /// pump loop, minus the direct-into-caller-buffer fast path for the i16 API (handled
    /// separately by `quantize_into`, which always reads from the scratch buffer so the
    /// noise-shaping filter sees every sample in delivery order).
    /// Fetches and stages pages until PCM is ready or the stream ends. A hole is surfaced to
    /// the caller once (spec.md §7: the only non-fatal error `read`/`read_float` ever return);
    /// calling again resumes the fetch loop from where it left off rather than re-raising it.
    fn fill(
        &mut self,
        reader: &mut PageReader,
        links: &mut Vec<Link>,
        cur: &mut usize,
        driver: &mut DecodeDriver,
    ) -> Result<Delivery> {
        loop {
            if driver.state() == ReadyState::InitSet {
                if self.pos < self.len {
                    return Ok(Delivery::Ready);
                }
                if driver.has_staged() {
                    let prev_gp = driver.prev_packet_gp();
                    let pkt = driver.pop_staged().expect("has_staged just checked");
                    let serialno = links[*cur].serialno;
                    self.decode_packet(driver, serialno, pkt, prev_gp)?;
                    continue;
                }
            }
            match driver.fetch_and_process_page(reader, links, cur, true, true) {
                Ok(()) => {
                    self.bytes_tracked += driver.take_page_header_bytes();
                    continue;
                }
                Err(Error::Hole) => return Err(Error::Hole),
                Err(Error::Eof) => return Ok(Delivery::Eof),
                Err(e) => return Err(e),
            }
        }
    }

    /// Delivers interleaved `f32` PCM, decoding and fetching as needed. Returns the number of
    /// samples per channel written to `out` (0 at end of stream).
    pub fn read_float(
        &mut self,
        reader: &mut PageReader,
        links: &mut Vec<Link>,
        cur: &mut usize,
        driver: &mut DecodeDriver,
        out: &mut [f32],
    ) -> Result<usize> {
        match self.fill(reader, links, cur, driver)? {
            Delivery::Eof => Ok(0),
            Delivery::Ready => {
                let channels = self.channels.max(1);
                let avail = self.len - self.pos;
                let n = avail.min(out.len() / channels);
                let src_start = self.pos * channels;
                out[..n * channels].copy_from_slice(&self.scratch[src_start..src_start + n * channels]);
                self.pos += n;
                Ok(n)
            }
        }
    }

    /// Delivers interleaved, dithered, noise-shaped 16-bit PCM. Returns the number of samples
    /// per channel written to `out` (0 at end of stream).
    pub fn read(
        &mut self,
        reader: &mut PageReader,
        links: &mut Vec<Link>,
        cur: &mut usize,
        driver: &mut DecodeDriver,
        out: &mut [i16],
    ) -> Result<usize> {
        match self.fill(reader, links, cur, driver)? {
            Delivery::Eof => Ok(0),
            Delivery::Ready => {
                let channels = self.channels.max(1);
                let avail = self.len - self.pos;
                let n = avail.min(out.len() / channels);
                let start = self.pos;
                self.quantize_into(start, n, &mut out[..n * channels]);
                self.pos += n;
                Ok(n)
            }
        }
    }

    /// Sixteen-bit quantization with full triangular dither and fourth-order IIR noise
    /// shaping, adapted from opusdec (Greg Maxwell); the shaping filters are Sebastian
    /// Gesemann's. Runs only over samples actually being delivered, in delivery order, so the
    /// filter state is continuous across packets and seeks never replay history into it.
    fn quantize_into(&mut self, start: usize, n: usize, out: &mut [i16]) {
        let channels = self.channels.max(1);
        if self.dither_mute > 64 {
            self.dither_a.iter_mut().for_each(|v| *v = 0.0);
        }
        let mut seed = self.dither_seed;
        let mut mute = self.dither_mute;
        for i in 0..n {
            let mut silent = true;
            for ci in 0..channels {
                let idx = (start + i) * channels + ci;
                let s_orig = self.scratch[idx];
                if s_orig != 0.0 {
                    silent = false;
                }
                let mut s = s_orig * OP_GAIN;

                let mut err = 0.0f32;
                for j in 0..4 {
                    err += FCOEF_B[j] * self.dither_b[ci * 4 + j] - FCOEF_A[j] * self.dither_a[ci * 4 + j];
                }
                for j in (0..3).rev() {
                    self.dither_a[ci * 4 + j + 1] = self.dither_a[ci * 4 + j];
                }
                for j in (0..3).rev() {
                    self.dither_b[ci * 4 + j + 1] = self.dither_b[ci * 4 + j];
                }
                self.dither_a[ci * 4] = err;
                s -= err;

                let r = if mute > 16 {
                    0.0
                } else {
                    seed = op_rand(seed);
                    let r1 = seed as f32 * OP_PRNG_GAIN;
                    seed = op_rand(seed);
                    let r2 = seed as f32 * OP_PRNG_GAIN;
                    r1 - r2
                };

                let si = (s + r).clamp(-32768.0, 32767.0).round();
                out[i * channels + ci] = si as i16;
                self.dither_b[ci * 4] = if mute > 16 { 0.0 } else { (si - s).clamp(-1.5, 1.5) };
            }
            mute += 1;
            if !silent {
                mute = 0;
            }
        }
        self.dither_seed = seed;
        self.dither_mute = mute.min(DITHER_MUTE_LIMIT);
    }
}

impl Default for SamplePump {
    fn default() -> Self {
        Self::new()
    }
}
