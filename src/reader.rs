// Pure Rust Ogg Opus container reader
//
// Copyright (c) 2016 est31 <MTest31@outlook.com>
// and contributors. All rights reserved.
// Licensed under MIT license, or Apache 2 license,
// at your option. Please see the LICENSE file
// attached to this source distribution for details.

/*!
The public reader: ties the byte source, page reader, header fetcher, link enumerator,
decode driver, seek engine, and sample pump together into the one type callers hold
(spec.md §6).

Everything here is bookkeeping: a [`PageReader`] borrows the owned byte source for the
duration of a single call and is discarded afterward, since nothing below this module needs
to hold onto one across calls. The reader's own `offset` field is the only piece of state
that survives between calls in its place.
*/

use crate::byte_source::{ByteSource, MemorySource};
use crate::decoder::DecodeDriver;
use crate::error::{Error, Result};
use crate::granule;
use crate::header::{self, OpusHead, OpusTags};
use crate::link::{self, Link};
use crate::page_reader::{Boundary, PageReader};
use crate::sample_pump::{self, SamplePump};
use crate::seek;
use crate::timestamp;

/// Pre-open sniff: `Ok(())` iff `bytes` begins with an Ogg page whose first packet parses as
/// a valid Opus identification header. Does not build a reader or touch anything else.
pub fn test(bytes: &[u8]) -> Result<()> {
    let mut src = MemorySource::new(bytes);
    let mut reader = PageReader::new(&mut src, 0);
    let page = reader.get_next_page(Boundary::Unbounded)?;
    if !page.header.is_first_page || page.num_packets() == 0 || !page.packet_complete[0] {
        return Err(Error::NotFormat);
    }
    OpusHead::parse(page.packet_data(0))?;
    Ok(())
}

/// Opens `src` with full link enumeration (equivalent to spec.md §6's `open`).
pub fn open<T: ByteSource>(src: T) -> Result<OggOpusReader<T>> {
    OpenOptions::new().open(src)
}

/// Opens `src` without enumerating the link table beyond the first link (spec.md §6's
/// `test_open`): returns as soon as the first link's headers are parsed.
pub fn test_open<T: ByteSource>(src: T) -> Result<OggOpusReader<T>> {
    OpenOptions::new().eager_link_enumeration(false).open(src)
}

/// Configures the one open-time choice this crate exposes: whether to eagerly walk the whole
/// link table via bisection, or stop after the first link's headers (spec.md §6 `open` vs.
/// `test_open`; spec.md §9's two-phase open).
#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    eager_link_enumeration: bool,
}

impl OpenOptions {
    pub fn new() -> Self {
        OpenOptions { eager_link_enumeration: true }
    }

    /// When `false`, `open` behaves like [`test_open`]. Ignored (treated as `false`) for a
    /// source that cannot seek, since link enumeration needs bisection.
    pub fn eager_link_enumeration(mut self, yes: bool) -> Self {
        self.eager_link_enumeration = yes;
        self
    }

    /// Parses the first link's headers and, if `src` is seekable and eager enumeration is
    /// enabled, walks the rest of the link table. On any failure `src` is simply dropped with
    /// the `Err`, matching spec.md §9's "byte source must not be auto-closed": the caller
    /// never received a reader to close in the first place.
    pub fn open<T: ByteSource>(&self, mut src: T) -> Result<OggOpusReader<T>> {
        let seekable = src.is_seekable();

        let (links, enumerated, offset) = {
            let mut reader = PageReader::new(&mut src, 0);
            let first_bos = reader.get_next_page(Boundary::Unbounded)?;
            if !first_bos.header.is_first_page {
                return Err(Error::NotFormat);
            }
            let (headers, data_offset) = header::fetch_link_header_group(&mut reader, first_bos)?;
            let pre_skip = headers.head.pre_skip as i64;
            let initial = timestamp::find_initial_pcm_offset(&mut reader, headers.serial, pre_skip)?;
            reader.seek_to(data_offset)?;

            let first_link = Link {
                offset: 0,
                data_offset,
                end_offset: 0,
                serialno: headers.serial,
                head: headers.head,
                tags: headers.tags,
                pcm_start: initial.pcm_start,
                pcm_end: 0,
                other_bos_serials: headers.other_bos_serials,
            };

            if seekable && self.eager_link_enumeration {
                let links = link::enumerate_links(&mut reader, first_link, initial.empty)?;
                reader.seek_to(links[0].data_offset)?;
                (links, true, reader.offset())
            } else {
                (vec![first_link], false, reader.offset())
            }
        };

        Ok(OggOpusReader {
            src,
            offset,
            links,
            cur: 0,
            driver: DecodeDriver::new(),
            pump: SamplePump::new(),
            seekable,
            enumerated,
        })
    }
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// An opened Ogg Opus stream (spec.md §3 "stream state" / §6).
///
/// Owns the byte source for its whole lifetime; dropping it releases the source normally.
/// Use [`into_inner`](Self::into_inner) to get the source back instead, e.g. to reuse a
/// buffer or close a file handle explicitly.
pub struct OggOpusReader<T: ByteSource> {
    src: T,
    offset: u64,
    links: Vec<Link>,
    cur: usize,
    driver: DecodeDriver,
    pump: SamplePump,
    seekable: bool,
    /// Whether the full link table was walked at open time. `false` after `test_open` (or
    /// after `open` on a non-seekable source): only link 0's (partial) headers are known.
    enumerated: bool,
}

impl<T: ByteSource> OggOpusReader<T> {
    fn require_seekable(&self) -> Result<()> {
        if self.seekable {
            Ok(())
        } else {
            Err(Error::NotSeekable)
        }
    }

    fn require_enumerated(&self) -> Result<()> {
        if self.enumerated {
            Ok(())
        } else {
            Err(Error::InvalidArgument(
                "operation requires a fully enumerated link table; open with eager link enumeration",
            ))
        }
    }

    fn link(&self, li: usize) -> Result<&Link> {
        self.links.get(li).ok_or(Error::InvalidArgument("link index out of range"))
    }

    /// Releases ownership of the byte source without running any of its own teardown beyond
    /// what dropping `Self`'s other fields does.
    pub fn into_inner(self) -> T {
        self.src
    }

    /// Whether the underlying byte source supports seeking; many operations below require it.
    pub fn seekable(&self) -> bool {
        self.seekable
    }

    /// The number of links known so far: 1 until a fully enumerated open, the true count after.
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// The index of the link the next `read`/`read_float` call will deliver from.
    pub fn current_link(&self) -> usize {
        self.cur
    }

    pub fn serialno(&self, li: usize) -> Result<u32> {
        Ok(self.link(li)?.serialno)
    }

    pub fn channel_count(&self, li: usize) -> Result<usize> {
        Ok(self.link(li)?.head.channel_count as usize)
    }

    pub fn head(&self, li: usize) -> Result<&OpusHead> {
        Ok(&self.link(li)?.head)
    }

    pub fn tags(&self, li: usize) -> Result<&OpusTags> {
        Ok(&self.link(li)?.tags)
    }

    /// Bytes spanned by link `li`, or by the whole stream when `li` is `None`.
    pub fn raw_total(&self, li: Option<usize>) -> Result<u64> {
        self.require_seekable()?;
        self.require_enumerated()?;
        match li {
            Some(i) => {
                let link = self.link(i)?;
                Ok(link.end_offset - link.offset)
            }
            None => {
                let first = self.links.first().ok_or(Error::Fault)?;
                let last = self.links.last().ok_or(Error::Fault)?;
                Ok(last.end_offset - first.offset)
            }
        }
    }

    /// Playable sample count of link `li`, or of the whole (possibly chained) stream when
    /// `li` is `None`.
    pub fn pcm_total(&self, li: Option<usize>) -> Result<i64> {
        self.require_seekable()?;
        self.require_enumerated()?;
        match li {
            Some(i) => self.link(i)?.playable_duration(),
            None => {
                let mut total = 0i64;
                for link in &self.links {
                    total = total
                        .checked_add(link.playable_duration()?)
                        .ok_or(Error::BadTimestamp("total pcm duration overflows i64"))?;
                }
                Ok(total)
            }
        }
    }

    /// Average bitrate of link `li` (or the whole stream), computed from its byte and sample
    /// totals; `None` if the duration is zero. See [`bitrate_instant`](Self::bitrate_instant)
    /// for a running, resettable measurement instead.
    pub fn bitrate(&self, li: Option<usize>) -> Result<Option<i32>> {
        let bytes = self.raw_total(li)?;
        let samples = self.pcm_total(li)?;
        Ok(sample_pump::calc_bitrate(bytes, samples))
    }

    /// Bits per second delivered since the last call (or since open/seek), resetting the
    /// running counters (spec.md §4.H/§6).
    pub fn bitrate_instant(&mut self) -> Option<i32> {
        self.pump.bitrate_instant()
    }

    /// The current byte offset in the underlying source.
    pub fn raw_tell(&self) -> u64 {
        self.offset
    }

    /// The current position in PCM samples from the start of the (possibly chained) stream.
    ///
    /// Grounded on reconstructing the position from `prev_packet_gp`, adjusted by samples
    /// already buffered ahead of it and samples still queued for discard, rather than
    /// tracking a running PCM counter directly; this is exactly the quantity the sample pump
    /// would stand at once its buffered samples are all delivered.
    pub fn pcm_tell(&mut self) -> Result<i64> {
        self.require_seekable()?;
        self.require_enumerated()?;
        let link = self.link(self.cur)?;
        let prev_gp = self.driver.prev_packet_gp().unwrap_or(link.pcm_start);
        let nbuffered = self.pump.buffered() as i64;
        let discard = self.driver.cur_discard_count as i64;
        let gp = granule::add(prev_gp, discard - nbuffered).unwrap_or(link.pcm_end);
        seek::pcm_offset_for_granulepos(&self.links, self.cur, gp)
    }

    /// Repositions the byte source to an arbitrary byte offset and resumes decoding from
    /// whatever page follows (spec.md §4.G `raw_seek`).
    pub fn raw_seek(&mut self, pos: u64) -> Result<()> {
        self.require_seekable()?;
        self.require_enumerated()?;
        let mut reader = PageReader::new(&mut self.src, self.offset);
        seek::raw_seek(&mut reader, &mut self.links, &mut self.cur, &mut self.driver, pos)?;
        self.offset = reader.offset();
        self.pump.reset();
        self.pump.reset_bitrate_counters();
        Ok(())
    }

    /// Page-granular seek: lands on the highest-granule page at or before `pcm_offset`
    /// (spec.md §4.G `pcm_seek_page`). Returns the link landed in.
    pub fn pcm_seek_page(&mut self, pcm_offset: i64) -> Result<usize> {
        self.require_seekable()?;
        self.require_enumerated()?;
        let mut reader = PageReader::new(&mut self.src, self.offset);
        let li = seek::pcm_seek_page(&mut reader, &mut self.links, &mut self.driver, pcm_offset)?;
        self.offset = reader.offset();
        self.cur = li;
        self.pump.reset();
        self.pump.reset_bitrate_counters();
        Ok(li)
    }

    /// Sample-accurate seek (spec.md §4.G `pcm_seek`). Returns the link landed in.
    pub fn pcm_seek(&mut self, pcm_offset: i64) -> Result<usize> {
        self.require_seekable()?;
        self.require_enumerated()?;
        let mut reader = PageReader::new(&mut self.src, self.offset);
        let li = seek::pcm_seek(&mut reader, &mut self.links, &mut self.driver, pcm_offset)?;
        self.offset = reader.offset();
        self.cur = li;
        self.pump.reset();
        self.pump.reset_bitrate_counters();
        Ok(li)
    }

    /// Delivers interleaved, dithered, noise-shaped 16-bit PCM into `out`. Returns the number
    /// of samples per channel written (`0` at end of stream); [`current_link`](Self::current_link)
    /// reports which link they came from.
    pub fn read(&mut self, out: &mut [i16]) -> Result<usize> {
        let mut reader = PageReader::new(&mut self.src, self.offset);
        let n = self.pump.read(&mut reader, &mut self.links, &mut self.cur, &mut self.driver, out)?;
        self.offset = reader.offset();
        Ok(n)
    }

    /// As [`read`](Self::read), but delivers interleaved `f32` PCM without quantization.
    pub fn read_float(&mut self, out: &mut [f32]) -> Result<usize> {
        let mut reader = PageReader::new(&mut self.src, self.offset);
        let n =
            self.pump.read_float(&mut reader, &mut self.links, &mut self.cur, &mut self.driver, out)?;
        self.offset = reader.offset();
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::test_support::build_page;

    fn opus_head(channels: u8, pre_skip: u16) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"OpusHead");
        buf.push(0);
        buf.push(channels);
        buf.extend_from_slice(&pre_skip.to_le_bytes());
        buf.extend_from_slice(&48000u32.to_le_bytes());
        buf.extend_from_slice(&0i16.to_le_bytes());
        buf.push(0);
        buf
    }

    fn opus_tags() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"OpusTags");
        let vendor = b"test";
        buf.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
        buf.extend_from_slice(vendor);
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf
    }

    // 20 ms mono frame, config 1 code 0: 20 * 48 = 960 samples.
    fn audio_packet() -> Vec<u8> {
        vec![1 << 3]
    }

    fn single_link_stream(pre_skip: u16) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend(build_page(-1, 7, 0, true, false, false, &[&opus_head(1, pre_skip)]));
        bytes.extend(build_page(-1, 7, 1, false, false, false, &[&opus_tags()]));
        let start_gp = pre_skip as i64 + 960;
        bytes.extend(build_page(start_gp, 7, 2, false, true, false, &[&audio_packet()]));
        bytes
    }

    #[test]
    fn test_sniffs_a_valid_opus_head() {
        let bytes = single_link_stream(0);
        assert!(test(&bytes).is_ok());
    }

    #[test]
    fn test_rejects_non_ogg_bytes() {
        assert!(matches!(test(b"not ogg at all"), Err(Error::Eof) | Err(Error::NotFormat)));
    }

    #[test]
    fn open_parses_headers_and_reports_pcm_total() {
        let bytes = single_link_stream(0);
        let src = MemorySource::new(bytes);
        let reader = open(src).unwrap();

        assert_eq!(reader.link_count(), 1);
        assert_eq!(reader.serialno(0).unwrap(), 7);
        assert_eq!(reader.channel_count(0).unwrap(), 1);
        assert_eq!(reader.pcm_total(None).unwrap(), 960);
        assert_eq!(reader.pcm_total(Some(0)).unwrap(), 960);
    }

    #[test]
    fn test_open_does_not_enumerate() {
        let bytes = single_link_stream(0);
        let src = MemorySource::new(bytes);
        let reader = test_open(src).unwrap();

        assert_eq!(reader.link_count(), 1);
        assert!(matches!(reader.pcm_total(None), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn non_seekable_source_rejects_seeking() {
        let bytes = single_link_stream(0);
        let src = crate::byte_source::StreamSource::new(&bytes[..]);
        let reader = open(src).unwrap();

        assert!(!reader.seekable());
        assert!(matches!(reader.raw_seek(0), Err(Error::NotSeekable)));
    }
}
