// Pure Rust Ogg Opus container reader
//
// Copyright (c) 2016 est31 <MTest31@outlook.com>
// and contributors. All rights reserved.
// Licensed under MIT license, or Apache 2 license,
// at your option. Please see the LICENSE file
// attached to this source distribution for details.

/*!
The framing assembler: Ogg page capture, CRC validation, and lacing.

This module has no notion of logical streams, links, or bisection; it only knows how to
locate the next `OggS` capture pattern in a byte source, validate a page's CRC, and split
its body into packet-length fragments via the lacing (segment) table. Everything else in
the crate is built on top of the raw pages this module hands back.
*/

use byteorder::{ByteOrder, LittleEndian};
use crc::{Algorithm, Crc};
use log::{debug, warn};

use crate::byte_source::ByteSource;
use crate::error::{Error, Result};

const CAPTURE_PATTERN: [u8; 4] = *b"OggS";
const HEADER_SIZE: usize = 27;
const MAX_SEGMENTS: usize = 255;
pub const MAX_PAGE_SIZE: usize = HEADER_SIZE + MAX_SEGMENTS + MAX_SEGMENTS * 255;

/// The CRC-32 variant used by the Ogg container format: polynomial `0x04c11db7`, no
/// reflection, zero initial value and zero final xor. This matches none of the catalog
/// algorithms bundled with the `crc` crate, so it is declared directly.
const OGG_CRC: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x04c1_1db7,
    init: 0x0000_0000,
    refin: false,
    refout: false,
    xorout: 0x0000_0000,
    check: 0x0000_0000,
    residue: 0x0000_0000,
};

fn crc32(bytes: &[u8]) -> u32 {
    let crc = Crc::<u32>::new(&OGG_CRC);
    crc.checksum(bytes)
}

/// The fixed-size fields of an Ogg page header.
#[derive(Debug, Clone, Copy)]
pub struct PageHeader {
    pub granule_position: i64,
    pub serial: u32,
    pub sequence: u32,
    pub is_continuation: bool,
    pub is_first_page: bool,
    pub is_last_page: bool,
}

/// A single, validated Ogg page read from a byte source.
#[derive(Debug, Clone)]
pub struct Page {
    pub header: PageHeader,
    /// Byte offset, from the start of the byte source, of this page's capture pattern.
    pub offset: u64,
    /// Total length in bytes of this page, header and body included.
    pub len: u64,
    /// Lengths, in bytes, of each packet fragment completed or begun on this page.
    pub packet_lens: Vec<u16>,
    /// `true` for each entry in `packet_lens` that represents a complete packet (a lacing
    /// value < 255 terminated the segment run); `false` means the packet continues onto
    /// the next page.
    pub packet_complete: Vec<bool>,
    body: Vec<u8>,
}

impl Page {
    /// Bytes of header and segment table overhead, i.e. everything but the packet bodies.
    /// Used for bitrate tracking, which counts page overhead separately from packet payload.
    pub fn header_len(&self) -> u64 {
        self.len - self.body.len() as u64
    }

    /// Returns the raw bytes of the `i`th packet fragment on this page.
    pub fn packet_data(&self, i: usize) -> &[u8] {
        let start: usize = self.packet_lens[..i].iter().map(|&l| l as usize).sum();
        let end = start + self.packet_lens[i] as usize;
        &self.body[start..end]
    }

    /// The number of packet fragments (complete or not) on this page.
    pub fn num_packets(&self) -> usize {
        self.packet_lens.len()
    }
}

/// Synchronizes `src` to the next Ogg page capture pattern, leaving the source positioned
/// at the first byte after it. Returns the offset at which the capture pattern began.
fn sync_to_capture(src: &mut dyn ByteSource) -> Result<u64> {
    let mut window = [0u8; 4];
    src.read_exact(&mut window)?;
    loop {
        if window == CAPTURE_PATTERN {
            let after = src.tell()?;
            return Ok(after - 4);
        }
        let mut next = [0u8; 1];
        let n = src.read(&mut next)?;
        if n == 0 {
            return Err(Error::Eof);
        }
        window.copy_within(1..4, 0);
        window[3] = next[0];
    }
}

/// Reads one Ogg page starting at the next capture pattern found in `src`.
///
/// On a CRC mismatch or malformed segment table, returns [`Error::Hole`] rather than
/// aborting the source; the caller decides whether to resynchronize and retry. [`Error::Eof`]
/// means the source was exhausted before a full page could be read.
pub fn read_page(src: &mut dyn ByteSource) -> Result<Page> {
    let offset = sync_to_capture(src)?;

    let mut header_rest = [0u8; HEADER_SIZE - 4];
    src.read_exact(&mut header_rest)?;

    let version = header_rest[0];
    if version != 0 {
        return Err(Error::BadHeader("unsupported Ogg stream structure version"));
    }
    let flags = header_rest[1];
    if flags & !0x07 != 0 {
        return Err(Error::Hole);
    }
    let granule_position = LittleEndian::read_i64(&header_rest[2..10]);
    let serial = LittleEndian::read_u32(&header_rest[10..14]);
    let sequence = LittleEndian::read_u32(&header_rest[14..18]);
    let crc_field = LittleEndian::read_u32(&header_rest[18..22]);
    let n_segments = header_rest[22] as usize;

    let mut segment_table = [0u8; MAX_SEGMENTS];
    src.read_exact(&mut segment_table[..n_segments])?;

    let mut packet_lens = Vec::new();
    let mut packet_complete = Vec::new();
    let mut body_len = 0usize;
    let mut run = 0u32;
    for &seg in &segment_table[..n_segments] {
        run += seg as u32;
        body_len += seg as usize;
        if seg < 255 {
            packet_lens.push(run as u16);
            packet_complete.push(true);
            run = 0;
        }
    }
    if run > 0 {
        packet_lens.push(run as u16);
        packet_complete.push(false);
    }

    let mut body = vec![0u8; body_len];
    src.read_exact(&mut body)?;

    let mut crc_buf = Vec::with_capacity(HEADER_SIZE + n_segments + body_len);
    crc_buf.extend_from_slice(&CAPTURE_PATTERN);
    crc_buf.extend_from_slice(&header_rest[..18]);
    crc_buf.extend_from_slice(&[0u8; 4]); // the CRC field itself is zeroed for the computation
    crc_buf.push(n_segments as u8);
    crc_buf.extend_from_slice(&segment_table[..n_segments]);
    crc_buf.extend_from_slice(&body);

    let computed = crc32(&crc_buf);
    if computed != crc_field {
        warn!(
            "page at offset {} failed crc check: expected {:#010x}, computed {:#010x}",
            offset, crc_field, computed
        );
        return Err(Error::Hole);
    }

    let len = (HEADER_SIZE + n_segments + body_len) as u64;
    debug!(
        "read page at {}: serial={:#010x} sequence={} granule_position={} len={}",
        offset, serial, sequence, granule_position, len
    );

    Ok(Page {
        header: PageHeader {
            granule_position,
            serial,
            sequence,
            is_continuation: flags & 0x01 != 0,
            is_first_page: flags & 0x02 != 0,
            is_last_page: flags & 0x04 != 0,
        },
        offset,
        len,
        packet_lens,
        packet_complete,
        body,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Builds the raw bytes of a single Ogg page from a header and the packets carried on it.
    ///
    /// `packets` are the complete packets to lace onto this page; no packet here may be left
    /// incomplete. This is test scaffolding used across the crate's unit tests to construct
    /// synthetic Ogg Opus byte streams without a real encoder.
    pub fn build_page(
        granule_position: i64,
        serial: u32,
        sequence: u32,
        is_first_page: bool,
        is_last_page: bool,
        is_continuation: bool,
        packets: &[&[u8]],
    ) -> Vec<u8> {
        let mut segment_table = Vec::new();
        let mut body = Vec::new();
        for packet in packets {
            let mut remaining = packet.len();
            while remaining >= 255 {
                segment_table.push(255u8);
                remaining -= 255;
            }
            segment_table.push(remaining as u8);
            body.extend_from_slice(packet);
        }

        let mut flags = 0u8;
        if is_continuation {
            flags |= 0x01;
        }
        if is_first_page {
            flags |= 0x02;
        }
        if is_last_page {
            flags |= 0x04;
        }

        let mut buf = Vec::new();
        buf.extend_from_slice(&CAPTURE_PATTERN);
        buf.push(0); // version
        buf.push(flags);
        let mut gp_buf = [0u8; 8];
        LittleEndian::write_i64(&mut gp_buf, granule_position);
        buf.extend_from_slice(&gp_buf);
        let mut serial_buf = [0u8; 4];
        LittleEndian::write_u32(&mut serial_buf, serial);
        buf.extend_from_slice(&serial_buf);
        let mut seq_buf = [0u8; 4];
        LittleEndian::write_u32(&mut seq_buf, sequence);
        buf.extend_from_slice(&seq_buf);
        buf.extend_from_slice(&[0u8; 4]); // crc placeholder
        buf.push(segment_table.len() as u8);
        buf.extend_from_slice(&segment_table);
        buf.extend_from_slice(&body);

        let crc = crc32(&buf);
        let mut crc_buf = [0u8; 4];
        LittleEndian::write_u32(&mut crc_buf, crc);
        buf[22..26].copy_from_slice(&crc_buf);
        buf
    }

    /// Like [`build_page`], but leaves the final packet's last segment unterminated (a full
    /// 255-byte segment with nothing following), so the packet continues onto the next page.
    pub fn build_page_with_trailing_continuation(
        granule_position: i64,
        serial: u32,
        sequence: u32,
        is_first_page: bool,
        is_continuation: bool,
        complete_packets: &[&[u8]],
        trailing_fragment: &[u8],
    ) -> Vec<u8> {
        let mut segment_table = Vec::new();
        let mut body = Vec::new();
        for packet in complete_packets {
            let mut remaining = packet.len();
            while remaining >= 255 {
                segment_table.push(255u8);
                remaining -= 255;
            }
            segment_table.push(remaining as u8);
            body.extend_from_slice(packet);
        }
        // The trailing fragment must end on a 255-byte segment so the page's lacing table
        // leaves it marked incomplete.
        assert!(!trailing_fragment.is_empty() && trailing_fragment.len() % 255 == 0);
        for chunk in trailing_fragment.chunks(255) {
            segment_table.push(255u8);
            body.extend_from_slice(chunk);
        }

        let mut flags = 0u8;
        if is_continuation {
            flags |= 0x01;
        }
        if is_first_page {
            flags |= 0x02;
        }

        let mut buf = Vec::new();
        buf.extend_from_slice(&CAPTURE_PATTERN);
        buf.push(0);
        buf.push(flags);
        let mut gp_buf = [0u8; 8];
        LittleEndian::write_i64(&mut gp_buf, granule_position);
        buf.extend_from_slice(&gp_buf);
        let mut serial_buf = [0u8; 4];
        LittleEndian::write_u32(&mut serial_buf, serial);
        buf.extend_from_slice(&serial_buf);
        let mut seq_buf = [0u8; 4];
        LittleEndian::write_u32(&mut seq_buf, sequence);
        buf.extend_from_slice(&seq_buf);
        buf.extend_from_slice(&[0u8; 4]);
        buf.push(segment_table.len() as u8);
        buf.extend_from_slice(&segment_table);
        buf.extend_from_slice(&body);

        let crc = crc32(&buf);
        let mut crc_buf = [0u8; 4];
        LittleEndian::write_u32(&mut crc_buf, crc);
        buf[22..26].copy_from_slice(&crc_buf);
        buf
    }
}
