// Pure Rust Ogg Opus container reader
//
// Copyright (c) 2016 est31 <MTest31@outlook.com>
// and contributors. All rights reserved.
// Licensed under MIT license, or Apache 2 license,
// at your option. Please see the LICENSE file
// attached to this source distribution for details.

/*!
Byte-granular, page-granular, and sample-accurate seeking (spec.md §4.G).

Everything here assumes a seekable byte source and a fully enumerated link table. The decode
driver does the actual page fetching and packet staging; this module only repositions the
byte source and tells the driver where it landed.
*/

use crate::decoder::DecodeDriver;
use crate::error::{Error, Result};
use crate::granule;
use crate::link::Link;
use crate::page_reader::{Boundary, PageReader, PAGE_MAX};

/// Samples of post-seek decoder settle time discarded after every seek (80 ms at 48 kHz).
const SETTLE_WINDOW: i64 = 80 * 48;

/// Finds the link whose byte range contains `pos`, clamping to the last link if `pos` lands
/// at or past the end of the file.
fn link_for_byte_offset(links: &[Link], pos: u64) -> usize {
    links
        .iter()
        .position(|l| pos < l.end_offset)
        .unwrap_or(links.len().saturating_sub(1))
}

/// Repositions the byte source to an arbitrary byte offset and resumes decoding from
/// whatever page follows.
///
/// Unlike the page and sample-accurate seeks, this does not know in advance which link it
/// will land in, so it demotes the driver back to `Opened` and lets `fetch_and_process_page`
/// rediscover everything from the landing page.
pub fn raw_seek(
    reader: &mut PageReader,
    links: &mut Vec<Link>,
    cur: &mut usize,
    driver: &mut DecodeDriver,
    pos: u64,
) -> Result<()> {
    let file_len = reader.len()?;
    if pos > file_len {
        return Err(Error::InvalidArgument("raw seek offset past end of file"));
    }

    driver.reset_for_seek();
    *cur = link_for_byte_offset(links, pos);
    driver.demote_to_opened();
    reader.seek_to(pos)?;

    loop {
        match driver.fetch_and_process_page(reader, links, cur, true, true) {
            Ok(()) => return Ok(()),
            Err(Error::Hole) => continue,
            Err(Error::Eof) => {
                let last = links.len() - 1;
                *cur = last;
                driver.reset_for_page_seek(links[last].pcm_end, 0);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}

/// Converts a PCM offset relative to the start of the whole (possibly chained) stream into
/// a granule position within one link, plus that link's index.
pub fn granulepos_for_pcm_offset(links: &[Link], mut pcm_offset: i64) -> Result<(i64, usize)> {
    if pcm_offset < 0 {
        return Err(Error::InvalidArgument("pcm offset is negative"));
    }
    for (li, link) in links.iter().enumerate() {
        let pre_skip = link.head.pre_skip as i64;
        let duration = link.playable_duration()?;
        if pcm_offset < duration {
            let gp = granule::add(link.pcm_start, pcm_offset + pre_skip)?;
            return Ok((gp, li));
        }
        pcm_offset -= duration;
    }
    Err(Error::InvalidArgument("pcm offset past end of stream"))
}

/// Converts a granule position within link `li` back into a PCM offset relative to the start
/// of the whole stream; the inverse of [`granulepos_for_pcm_offset`]. Used by `pcm_tell`.
pub fn pcm_offset_for_granulepos(links: &[Link], li: usize, gp: i64) -> Result<i64> {
    let mut pcm_offset = 0i64;
    for link in &links[..li] {
        pcm_offset += link.playable_duration()?;
    }
    let link = &links[li];
    let gp = if granule::cmp(gp, link.pcm_end)? > 0 { link.pcm_end } else { gp };
    if granule::cmp(gp, link.pcm_start)? > 0 {
        let delta = granule::diff(gp, link.pcm_start)?;
        let pre_skip = link.head.pre_skip as i64;
        pcm_offset += (delta - pre_skip).max(0);
    }
    Ok(pcm_offset)
}

/// Rescales `x` from the range `[0, from]` onto `[0, to]`.
///
/// A 64×64→64 fractional multiply, computed as two 63-iteration binary-shift passes (one to
/// turn `x / from` into a 63-bit fixed-point fraction, one to apply that fraction to `to`)
/// rather than via a 128-bit intermediate, per spec.md §4.G. `from` and `to` must be positive.
fn rescale(x: i64, from: i64, to: i64) -> i64 {
    if x >= from {
        return to;
    }
    if x <= 0 {
        return 0;
    }

    let mut x = x;
    let mut frac: i64 = 0;
    for _ in 0..63 {
        frac <<= 1;
        if x >= from >> 1 {
            x -= from - x;
            frac |= 1;
        } else {
            x <<= 1;
        }
    }

    let mut ret: i64 = 0;
    for _ in 0..63 {
        if frac & 1 != 0 {
            ret = (ret & to & 1) + (ret >> 1) + (to >> 1);
        } else {
            ret >>= 1;
        }
        frac >>= 1;
    }
    ret
}

/// Bisects link `li`'s byte range for the highest-granule-position page at or before
/// `target_gp`, repositions the reader there, and primes the driver to resume decoding from
/// it (the bisection half of spec.md §4.G `pcm_seek_page`).
fn seek_to_granulepos_in_link(
    reader: &mut PageReader,
    links: &mut Vec<Link>,
    driver: &mut DecodeDriver,
    target_gp: i64,
    li: usize,
) -> Result<()> {
    let (serial, pcm_start_link, pcm_end_link, pre_skip, data_offset, end_offset) = {
        let link = &links[li];
        (
            link.serialno,
            link.pcm_start,
            link.pcm_end,
            link.head.pre_skip as i64,
            link.data_offset,
            link.end_offset,
        )
    };

    // Back off 80 ms for pre-roll room; clamp to the link's own start if that underflows.
    let target_gp = granule::add(target_gp, -SETTLE_WINDOW).unwrap_or(pcm_start_link);
    let pcm_pre_skip = granule::add(pcm_start_link, pre_skip)?;

    let mut begin = data_offset;
    let mut end = if granule::cmp(target_gp, pcm_pre_skip)? < 0 { begin } else { end_offset };

    let mut best = begin;
    let mut best_gp = pcm_start_link;
    let mut pcm_start = pcm_start_link;
    let mut pcm_end = pcm_end_link;

    while end > begin {
        let chunk = PAGE_MAX;
        let bisect = if end - begin < chunk {
            begin
        } else {
            let diff = granule::diff(target_gp, pcm_start)?;
            let span = granule::diff(pcm_end, pcm_start)?.max(1);
            let guess = begin + rescale(diff, span, (end - begin) as i64) as u64;
            guess.saturating_sub(chunk).max(begin)
        };

        reader.seek_to(bisect)?;
        let found = loop {
            let limit = end.saturating_sub(reader.offset());
            match reader.get_next_page(Boundary::Limited(limit)) {
                Ok(page) if page.header.serial == serial => {
                    if granule::is_invalid(page.header.granule_position) {
                        continue;
                    }
                    break Some(page);
                }
                Ok(_) => continue,
                Err(Error::Eof) => break None,
                Err(e) => return Err(e),
            }
        };

        match found {
            None => {
                if bisect <= begin {
                    break;
                }
                end = bisect;
            }
            Some(page) => {
                let gp = page.header.granule_position;
                if granule::cmp(gp, target_gp)? < 0 {
                    begin = page.offset + page.len;
                    if granule::cmp(pcm_start, gp)? <= 0 {
                        best = begin;
                        best_gp = gp;
                        pcm_start = gp;
                    }
                } else {
                    if page.offset <= begin {
                        end = begin;
                        break;
                    }
                    end = page.offset;
                    if granule::cmp(pcm_end, gp)? > 0 {
                        pcm_end = gp;
                    }
                }
            }
        }
    }

    reader.seek_to(best)?;

    let into_pre_skip = granule::diff(best_gp, pcm_start_link)?;
    let remaining_pre_skip = (pre_skip - into_pre_skip).max(0);
    let discard = remaining_pre_skip.max(SETTLE_WINDOW) as u32;

    driver.reset_for_page_seek(best_gp, discard);
    let mut cur = li;
    match driver.fetch_and_process_page(reader, links, &mut cur, true, false) {
        Ok(()) => Ok(()),
        Err(Error::Hole) => Err(Error::BadLink("hole encountered while settling into a seek target")),
        Err(Error::Eof) => Err(Error::BadLink("seek landed past the link's last page")),
        Err(e) => Err(e),
    }
}

/// Page-granular seek: lands on the highest-granule page at or before the target PCM offset,
/// with the usual 80 ms post-seek discard queued (spec.md §4.G `pcm_seek_page`).
pub fn pcm_seek_page(
    reader: &mut PageReader,
    links: &mut Vec<Link>,
    driver: &mut DecodeDriver,
    pcm_offset: i64,
) -> Result<usize> {
    let (target_gp, li) = granulepos_for_pcm_offset(links, pcm_offset)?;
    seek_to_granulepos_in_link(reader, links, driver, target_gp, li)?;
    Ok(li)
}

/// Sample-accurate seek: `pcm_seek_page` followed by skipping whole staged packets until one
/// reaches or passes the target, leaving the remainder as a precise discard count so the next
/// delivery trims exactly to the requested sample (spec.md §4.G `pcm_seek`).
pub fn pcm_seek(
    reader: &mut PageReader,
    links: &mut Vec<Link>,
    driver: &mut DecodeDriver,
    pcm_offset: i64,
) -> Result<usize> {
    let (target_gp, li) = granulepos_for_pcm_offset(links, pcm_offset)?;
    seek_to_granulepos_in_link(reader, links, driver, target_gp, li)?;

    let pcm_start = links[li].pcm_start;
    let pre_skip = links[li].head.pre_skip as i64;
    let into_link = granule::diff(target_gp, pcm_start)?;
    let skip = if into_link <= pre_skip { 0 } else { (into_link - SETTLE_WINDOW).max(0) };

    loop {
        loop {
            let next_gp = match driver.peek_staged() {
                Some(pkt) => pkt.granule_position,
                None => break,
            };
            if granule::diff(next_gp, pcm_start)? > skip {
                break;
            }
            driver.pop_staged();
        }
        if driver.has_staged() {
            break;
        }
        let mut cur = li;
        loop {
            match driver.fetch_and_process_page(reader, links, &mut cur, true, false) {
                Ok(()) => break,
                Err(Error::Hole) => continue,
                Err(_) => {
                    return Err(Error::BadLink("ran out of packets while skipping toward a seek target"))
                }
            }
        }
    }

    let diff = granule::diff(driver.prev_packet_gp().unwrap_or(pcm_start), pcm_start)?;
    if diff > skip {
        return Err(Error::BadLink("sample-accurate seek skipped past its own target"));
    }
    driver.cur_discard_count = (into_link - diff) as u32;
    Ok(li)
}
