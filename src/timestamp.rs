// Pure Rust Ogg Opus container reader
//
// Copyright (c) 2016 est31 <MTest31@outlook.com>
// and contributors. All rights reserved.
// Licensed under MIT license, or Apache 2 license,
// at your option. Please see the LICENSE file
// attached to this source distribution for details.

/*!
Per-packet duration accounting and granule-position assignment.

This module knows how to read an Opus packet's duration from its TOC byte alone (the
decoder is never consulted for this), how to stitch packet fragments that straddle a page
boundary back into whole packets, and how to locate the first and last audible sample of a
link from its pages. Everything here operates on one link's pages at a time; the caller
(the link enumerator or the decode driver) supplies them in order.
*/

use crate::error::{Error, Result};
use crate::granule;
use crate::page::Page;
use crate::page_reader::{Boundary, PageReader};

/// One 2.5/5/10/20/40/60 ms Opus frame duration in 48 kHz samples, indexed by the 5-bit TOC
/// configuration number (RFC 6716 §3.1, the table on page 14).
#[rustfmt::skip]
const CONFIGURATION_FRAME_DURATION: [u32; 32] = [
    10 * 48, 20 * 48, 40 * 48, 60 * 48,
    10 * 48, 20 * 48, 40 * 48, 60 * 48,
    10 * 48, 20 * 48, 40 * 48, 60 * 48,
    10 * 48, 20 * 48,
    10 * 48, 20 * 48,
    (2.5 * 48.0) as u32, 5 * 48, 10 * 48, 20 * 48,
    (2.5 * 48.0) as u32, 5 * 48, 10 * 48, 20 * 48,
    (2.5 * 48.0) as u32, 5 * 48, 10 * 48, 20 * 48,
    (2.5 * 48.0) as u32, 5 * 48, 10 * 48, 20 * 48,
];

/// The largest a single Opus packet may legally decode to: 120 ms at 48 kHz.
pub const MAX_PACKET_DURATION: u32 = 120 * 48;

/// Returns the decoded duration of an Opus packet in 48 kHz samples, or `None` if the TOC
/// byte (or, for code 3 packets, the following frame-count byte) is malformed.
///
/// This never invokes the decoder; it only interprets the TOC byte per RFC 6716 §3.1.
pub fn packet_duration(packet: &[u8]) -> Option<u32> {
    let toc = *packet.first()?;
    let config = (toc >> 3) as usize;
    let frame_duration = CONFIGURATION_FRAME_DURATION[config];
    let code = toc & 0b11;
    let num_frames: u32 = match code {
        0 => 1,
        1 | 2 => 2,
        3 => {
            let count_byte = *packet.get(1)?;
            (count_byte & 0b0011_1111) as u32
        }
        _ => unreachable!("masked to 2 bits"),
    };
    if num_frames == 0 {
        return None;
    }
    let total = frame_duration.checked_mul(num_frames)?;
    if total > MAX_PACKET_DURATION {
        return None;
    }
    Some(total)
}

/// A packet completed by [`PacketAssembler::submit_page`].
#[derive(Debug, Clone)]
pub struct CompletedPacket {
    pub data: Vec<u8>,
    /// `None` when the TOC byte failed validation; the packet is still handed to the
    /// decoder (which may itself reject it), but it contributes nothing to duration sums.
    pub duration: Option<u32>,
}

/// Stitches packet fragments spanning page boundaries back into whole packets.
///
/// This is the "framing assembler" spec.md treats as opaque: it has no notion of links,
/// serial numbers, or bisection, only of one logical stream's fragment continuity.
#[derive(Default)]
pub struct PacketAssembler {
    pending: Vec<u8>,
    have_pending: bool,
}

impl PacketAssembler {
    pub fn new() -> Self {
        PacketAssembler::default()
    }

    /// Discards any partially-assembled packet. Used after a hole or a seek, where the next
    /// page is known not to continue whatever was pending.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.have_pending = false;
    }

    /// Whether a packet fragment is currently buffered, awaiting its terminating segment.
    pub fn have_pending(&self) -> bool {
        self.have_pending
    }

    /// Submits one page (already known to belong to the stream being assembled) and returns
    /// the packets it completed, in order.
    ///
    /// Fails with [`Error::Hole`] if the page's continuation flag disagrees with whether a
    /// packet was actually pending (a lost page between this one and the last).
    pub fn submit_page(&mut self, page: &Page) -> Result<Vec<CompletedPacket>> {
        let mismatched = page.header.is_continuation != self.have_pending;
        if mismatched {
            self.reset();
        }

        let mut out = Vec::with_capacity(page.num_packets());
        // If the page falsely claims to continue a packet we have nothing buffered for,
        // its first fragment can never be completed correctly; drop it. If it does *not*
        // continue but we had something pending, that pending data is simply abandoned by
        // the `reset()` above and we start clean from this page's first fragment.
        let skip_first = mismatched && page.header.is_continuation;
        for i in 0..page.num_packets() {
            if i == 0 && skip_first {
                continue;
            }
            self.pending.extend_from_slice(page.packet_data(i));
            if page.packet_complete[i] {
                let data = std::mem::take(&mut self.pending);
                let duration = packet_duration(&data);
                out.push(CompletedPacket { data, duration });
                self.have_pending = false;
            } else {
                self.have_pending = true;
            }
        }
        if mismatched {
            return Err(Error::Hole);
        }
        Ok(out)
    }
}

/// The result of locating a link's first audible sample (spec.md §4.D
/// `find_initial_pcm_offset`).
pub struct InitialPcmOffset {
    pub pcm_start: i64,
    /// Set when the link turned out to carry no audio at all (EOF or the next link's BOS
    /// was reached before any packet completed, and `pre_skip == 0`).
    pub empty: bool,
}

/// Reads pages forward from the reader's current position (assumed to be a link's
/// `data_offset`) until the first page with a completed audio packet is found, and derives
/// `pcm_start` from it.
///
/// On return, the reader has been advanced past the page used to compute `pcm_start`;
/// callers that still need to decode from `data_offset` must seek back there.
pub fn find_initial_pcm_offset(reader: &mut PageReader, serial: u32, pre_skip: i64) -> Result<InitialPcmOffset> {
    let mut assembler = PacketAssembler::new();
    loop {
        let page = match reader.get_next_page(Boundary::Unbounded) {
            Ok(p) => p,
            Err(Error::Eof) => {
                return finish_empty(pre_skip);
            }
            Err(e) => return Err(e),
        };

        if page.header.is_first_page && page.header.serial != serial {
            // The next link's BOS arrived before any audio packet of this one completed.
            return finish_empty(pre_skip);
        }
        if page.header.serial != serial {
            continue;
        }

        let packets = assembler.submit_page(&page)?;
        if packets.is_empty() {
            continue;
        }
        let g = page.header.granule_position;
        if granule::is_invalid(g) {
            // Liberal handling of the documented open question: a page with no granule
            // position yet doesn't let us anchor pcm_start, so keep scanning forward.
            continue;
        }
        let total_duration: i64 =
            packets.iter().filter_map(|p| p.duration).map(|d| d as i64).sum();

        // This is deliberately plain i128 arithmetic, not `granule::add`: what's being
        // detected here is "the page's audio starts before sample 0", a link-local
        // underflow, not the wraparound `granule` funnels timestamp addition through.
        let raw = g as i128 - total_duration as i128;
        if raw < 0 {
            if page.header.is_last_page {
                if granule::cmp(g, pre_skip)? >= 0 {
                    return Ok(InitialPcmOffset { pcm_start: 0, empty: false });
                }
                return Err(Error::BadTimestamp(
                    "end-trimmed link's granule position is smaller than its pre-skip",
                ));
            }
            return Err(Error::BadTimestamp(
                "page granule position minus completed packet duration underflows",
            ));
        }
        return Ok(InitialPcmOffset { pcm_start: raw as i64, empty: false });
    }
}

/// Locates the last page belonging to `serial` at or before `end_offset` via the reverse
/// page search, and returns its granule position as the link's `pcm_end` (spec.md §4.D
/// `find_final_pcm_offset`).
///
/// Leaves the reader positioned just past the page it found.
pub fn find_final_pcm_offset(
    reader: &mut PageReader,
    end_offset: u64,
    serial: u32,
    known_serials: &std::collections::HashSet<u32>,
) -> Result<i64> {
    reader.seek_to(end_offset)?;
    let page = reader.get_prev_page_matching(serial, known_serials)?;
    if granule::is_invalid(page.header.granule_position) {
        return Err(Error::BadTimestamp("link's final page carries no granule position"));
    }
    Ok(page.header.granule_position)
}

fn finish_empty(pre_skip: i64) -> Result<InitialPcmOffset> {
    if pre_skip > 0 {
        return Err(Error::BadTimestamp("link has pre-skip but no audio packet was found"));
    }
    Ok(InitialPcmOffset { pcm_start: 0, empty: true })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toc(config: u8, code: u8) -> u8 {
        (config << 3) | code
    }

    #[test]
    fn duration_of_simple_configs() {
        assert_eq!(packet_duration(&[toc(0, 0)]), Some(10 * 48));
        assert_eq!(packet_duration(&[toc(3, 1)]), Some(2 * 60 * 48));
    }

    #[test]
    fn duration_of_code_3_uses_frame_count_byte() {
        let packet = [toc(0, 3), 4];
        assert_eq!(packet_duration(&packet), Some(4 * 10 * 48));
    }

    #[test]
    fn rejects_empty_packet() {
        assert_eq!(packet_duration(&[]), None);
    }

    #[test]
    fn rejects_code_3_missing_count_byte() {
        assert_eq!(packet_duration(&[toc(0, 3)]), None);
    }

    #[test]
    fn assembler_stitches_a_packet_split_across_two_pages() {
        use crate::page::test_support::{build_page, build_page_with_trailing_continuation};

        // A 255-byte fragment on page 1 that continues onto page 2, followed by a small
        // completing fragment there.
        let first_fragment = vec![7u8; 255];
        let second_fragment = vec![toc(0, 0), 9, 9];
        let mut whole_packet = first_fragment.clone();
        whole_packet.extend_from_slice(&second_fragment);

        let page1_bytes =
            build_page_with_trailing_continuation(-1, 1, 0, true, false, &[], &first_fragment);
        let mut assembler = PacketAssembler::new();
        let mut src = crate::byte_source::MemorySource::new(page1_bytes);
        let page1 = crate::page::read_page(&mut src).unwrap();
        let completed = assembler.submit_page(&page1).unwrap();
        assert!(completed.is_empty());

        let page2_bytes = build_page(1234, 1, 1, false, false, true, &[&second_fragment]);
        let mut src2 = crate::byte_source::MemorySource::new(page2_bytes);
        let page2 = crate::page::read_page(&mut src2).unwrap();
        let completed2 = assembler.submit_page(&page2).unwrap();
        assert_eq!(completed2.len(), 1);
        assert_eq!(completed2[0].data, whole_packet);
    }

    #[test]
    fn assembler_reports_a_hole_on_continuation_mismatch() {
        use crate::page::test_support::build_page;
        let mut assembler = PacketAssembler::new();
        // A continuation page with nothing pending: the fragment it opens with is lost.
        let page_bytes = build_page(100, 1, 5, false, false, true, &[b"orphaned tail"]);
        let mut src = crate::byte_source::MemorySource::new(page_bytes);
        let page = crate::page::read_page(&mut src).unwrap();
        assert!(matches!(assembler.submit_page(&page), Err(Error::Hole)));
    }
}
