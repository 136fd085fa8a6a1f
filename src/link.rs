// Pure Rust Ogg Opus container reader
//
// Copyright (c) 2016 est31 <MTest31@outlook.com>
// and contributors. All rights reserved.
// Licensed under MIT license, or Apache 2 license,
// at your option. Please see the LICENSE file
// attached to this source distribution for details.

/*!
Chained-link discovery.

A chained Ogg Opus file concatenates several independent logical streams end to end. This
module finds them all from a seekable byte source without reading the whole file: it starts
from the file's last page and bisects backward, locating each link's boundary in
`O(log(file_bytes / page))` probes rather than scanning every page.
*/

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::granule;
use crate::header::{self, OpusHead, OpusTags};
use crate::page::Page;
use crate::page_reader::{Boundary, PageReader, PAGE_MAX};
use crate::timestamp;

/// One logical Opus stream within a (possibly chained) file.
#[derive(Debug, Clone)]
pub struct Link {
    pub offset: u64,
    pub data_offset: u64,
    pub end_offset: u64,
    pub serialno: u32,
    pub head: OpusHead,
    pub tags: OpusTags,
    pub pcm_start: i64,
    pub pcm_end: i64,
    /// Serials of other BOS-group passengers at this link's start, kept so their pages can
    /// be recognized and skipped rather than mistaken for holes.
    pub other_bos_serials: HashSet<u32>,
}

impl Link {
    fn serial_set(&self) -> HashSet<u32> {
        let mut set = self.other_bos_serials.clone();
        set.insert(self.serialno);
        set
    }

    /// `diff(pcm_end, pcm_start) - pre_skip`, the number of samples this link actually plays.
    pub fn playable_duration(&self) -> Result<i64> {
        let span = granule::diff(self.pcm_end, self.pcm_start)?;
        span.checked_sub(self.head.pre_skip as i64)
            .filter(|&d| d >= 0)
            .ok_or(Error::BadTimestamp("link plays less than its own pre-skip"))
    }
}

/// A page seen to belong to a later link during bisection, retained only for the current
/// round's diagnostics; spec.md §4.E describes this list as reused across the whole
/// enumeration, but restarting the reverse search per link (below) is simpler and no worse
/// asymptotically, so the list never grows past the handful of pages one link's bisection
/// touches.
struct SeekRecord {
    offset: u64,
    size: u64,
    serial: u32,
}

const MAX_SEEK_RECORDS: usize = 64;

/// Discovers every link in a chained stream, starting from the already-parsed first link.
///
/// `first_link`'s `pcm_end` is a placeholder; it, like every other link's, is finalized here.
/// `first_link_empty` is the `empty` flag `timestamp::find_initial_pcm_offset` returned when
/// `first_link` was built (spec.md §4.D: a link with no audio packets at all). The reader's
/// position on return is unspecified; callers reposition before resuming decoding.
pub fn enumerate_links(reader: &mut PageReader, first_link: Link, first_link_empty: bool) -> Result<Vec<Link>> {
    let file_len = reader.len()?;
    reader.seek_to(file_len)?;
    let trailing = reader.get_last_page()?;

    let mut links = Vec::new();
    let mut current = first_link;
    let mut current_empty = first_link_empty;

    loop {
        let known_serials = current.serial_set();
        let is_last = known_serials.contains(&trailing.header.serial);

        if current_empty {
            // The only pages carrying this serial are header pages with no granule position
            // (granule_position = -1), so find_final_pcm_offset would find none to scan back
            // to and fail with BadTimestamp. Short-circuit per spec.md §4.D instead.
            current.pcm_start = 0;
            current.pcm_end = 0;
            current.end_offset = current.data_offset;
        } else if is_last {
            // No later link: this is the last one in the file. Re-derive pcm_end from
            // `current.serialno`'s own last page rather than trusting `trailing` directly,
            // since it may belong to a BOS-group passenger rather than the chosen stream.
            current.pcm_end =
                timestamp::find_final_pcm_offset(reader, file_len, current.serialno, &known_serials)?;
            current.end_offset = file_len;
        }

        if is_last {
            current.playable_duration()?;
            links.push(current);
            return Ok(links);
        }

        let next_bos = bisect_for_next_link(reader, &known_serials, current.data_offset, trailing.offset)?;

        if !current_empty {
            current.end_offset = next_bos.offset;
            current.pcm_end =
                timestamp::find_final_pcm_offset(reader, next_bos.offset, current.serialno, &known_serials)?;
        }
        current.playable_duration()?;
        links.push(current);

        reader.seek_to(next_bos.offset)?;
        let bos_page = reader.get_next_page(Boundary::Unbounded)?;
        let (headers, data_offset) = header::fetch_link_header_group(reader, bos_page)?;
        let pre_skip = headers.head.pre_skip as i64;
        let initial = timestamp::find_initial_pcm_offset(reader, headers.serial, pre_skip)?;
        reader.seek_to(data_offset)?;

        current_empty = initial.empty;
        current = Link {
            offset: next_bos.offset,
            data_offset,
            end_offset: 0,
            serialno: headers.serial,
            head: headers.head,
            tags: headers.tags,
            pcm_start: initial.pcm_start,
            pcm_end: 0,
            other_bos_serials: headers.other_bos_serials,
        };
    }
}

/// Bisects `[searched, end_searched)` for the first page of a later link, per spec.md §4.E.
///
/// `end_searched` is known to belong to a later link (it is the offset of a page whose serial
/// is foreign to `known_serials`); `searched` is known to belong to the current link. The
/// search narrows until the gap is under one page, at which point `bisect` collapses to
/// `searched` and the scan becomes sequential: the first foreign page found that way is
/// necessarily the next link's BOS page, since Ogg links begin immediately where the last one
/// ends, with no gap between them.
fn bisect_for_next_link(
    reader: &mut PageReader,
    known_serials: &HashSet<u32>,
    mut searched: u64,
    mut end_searched: u64,
) -> Result<Page> {
    let mut records: Vec<SeekRecord> = Vec::new();

    loop {
        if searched >= end_searched {
            return Err(Error::BadLink(
                "no later-link page found before the established boundary",
            ));
        }
        let gap = end_searched - searched;
        let bisect = if gap < PAGE_MAX { searched } else { searched + gap / 2 };

        reader.seek_to(bisect)?;
        let page = reader.get_next_page(Boundary::Unbounded)?;

        if known_serials.contains(&page.header.serial) {
            searched = reader.offset();
            continue;
        }

        if records.len() == MAX_SEEK_RECORDS {
            records.remove(0);
        }
        records.push(SeekRecord { offset: page.offset, size: page.len, serial: page.header.serial });

        end_searched = bisect;
        if bisect == searched || end_searched - searched < PAGE_MAX {
            return Ok(page);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_source::MemorySource;
    use crate::page::test_support::build_page;

    fn opus_head(channels: u8, pre_skip: u16) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"OpusHead");
        buf.push(0);
        buf.push(channels);
        buf.extend_from_slice(&pre_skip.to_le_bytes());
        buf.extend_from_slice(&48000u32.to_le_bytes());
        buf.extend_from_slice(&0i16.to_le_bytes());
        buf.push(0); // mapping family 0
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

    // A 20 ms frame (config 1, code 0): 20 * 48 = 960 samples.
    fn audio_packet() -> Vec<u8> {
        vec![1 << 3]
    }

    /// Builds the byte stream for one simple mono link: BOS/head, tags, one audio page, one
    /// EOS audio page. Returns the bytes and the offset of the first audio page (`data_offset`)
    /// relative to the start of this link's bytes.
    fn build_link_bytes(serial: u32, seq_start: u32) -> (Vec<u8>, u64) {
        let mut bytes = Vec::new();
        bytes.extend(build_page(-1, serial, seq_start, true, false, false, &[&opus_head(1, 0)]));
        bytes.extend(build_page(-1, serial, seq_start + 1, false, false, false, &[&opus_tags()]));
        let data_offset = bytes.len() as u64;
        bytes.extend(build_page(960, serial, seq_start + 2, false, false, false, &[&audio_packet()]));
        bytes.extend(build_page(1920, serial, seq_start + 3, false, true, false, &[&audio_packet()]));
        (bytes, data_offset)
    }

    #[test]
    fn enumerates_two_chained_links() {
        let (bytes_a, data_offset_a) = build_link_bytes(1, 0);
        let (bytes_b, _data_offset_b) = build_link_bytes(2, 0);

        let mut all_bytes = bytes_a.clone();
        all_bytes.extend(bytes_b);

        let first_link = Link {
            offset: 0,
            data_offset: data_offset_a,
            end_offset: 0,
            serialno: 1,
            head: OpusHead::parse(&opus_head(1, 0)).unwrap(),
            tags: OpusTags::parse(&opus_tags()).unwrap(),
            pcm_start: 0,
            pcm_end: 0,
            other_bos_serials: HashSet::new(),
        };

        let mut src = MemorySource::new(all_bytes);
        let mut reader = PageReader::new(&mut src, data_offset_a);
        let links = enumerate_links(&mut reader, first_link, false).unwrap();

        assert_eq!(links.len(), 2);
        assert_eq!(links[0].serialno, 1);
        assert_eq!(links[0].pcm_start, 0);
        assert_eq!(links[0].pcm_end, 1920);
        assert_eq!(links[0].offset, 0);
        assert_eq!(links[1].serialno, 2);
        assert_eq!(links[1].pcm_start, 0);
        assert_eq!(links[1].pcm_end, 1920);
        assert_eq!(links[1].offset, bytes_a.len() as u64);
    }
}
