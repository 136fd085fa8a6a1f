// Pure Rust Ogg Opus container reader
//
// Copyright (c) 2016 est31 <MTest31@outlook.com>
// and contributors. All rights reserved.
// Licensed under MIT license, or Apache 2 license,
// at your option. Please see the LICENSE file
// attached to this source distribution for details.

/*!
Parsing of the Opus identification and comment header packets.

These are pure functions over packet byte buffers; they know nothing about pages, links, or
the byte source. The link header fetcher (`link` module) is responsible for assembling the
right packets and handing them here.
*/

use std::collections::HashSet;
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use tinyvec::ArrayVec;

use crate::error::{Error, Result};
use crate::page::Page;
use crate::page_reader::{Boundary, PageReader};
use crate::timestamp::PacketAssembler;

const IDENTIFICATION_MAGIC: &[u8; 8] = b"OpusHead";
const COMMENT_MAGIC: &[u8; 8] = b"OpusTags";
const MIN_IDENTIFICATION_LEN: usize = 19;
const MAX_CHANNELS: usize = 255;

/// The parsed Opus identification header (`OpusHead`) for one link.
#[derive(Debug, Clone)]
pub struct OpusHead {
    pub version: u8,
    pub channel_count: u8,
    pub pre_skip: u16,
    pub input_sample_rate: u32,
    pub output_gain: i16,
    pub mapping_family: u8,
    pub stream_count: u8,
    pub coupled_count: u8,
    /// Maps output channel `i` to a decoded stream channel. Length equals `channel_count`.
    pub mapping: ArrayVec<[u8; MAX_CHANNELS]>,
}

impl OpusHead {
    /// Parses an `OpusHead` packet.
    ///
    /// Channel mapping family 0 (RTP: mono or stereo, no explicit table) is synthesized into
    /// an explicit one- or two-channel mapping internally (RFC 7845 §5.1.1), so every caller
    /// of this parser sees the same `(stream_count, coupled_count, mapping)` shape the
    /// multistream decoder constructor expects, regardless of which family produced it.
    pub fn parse(packet: &[u8]) -> Result<Self> {
        if packet.len() < MIN_IDENTIFICATION_LEN {
            return Err(Error::BadHeader("identification packet too short"));
        }
        if &packet[..8] != IDENTIFICATION_MAGIC {
            return Err(Error::NotFormat);
        }

        let mut r = Cursor::new(&packet[8..]);
        let version = r.read_u8()?;
        if version >> 4 != 0 {
            return Err(Error::BadHeader("unsupported Opus mapping version"));
        }

        let channel_count = r.read_u8()?;
        if channel_count == 0 {
            return Err(Error::BadHeader("zero channel count"));
        }
        let pre_skip = r.read_u16::<LittleEndian>()?;
        let input_sample_rate = r.read_u32::<LittleEndian>()?;
        let output_gain = r.read_i16::<LittleEndian>()?;
        let mapping_family = r.read_u8()?;

        let (stream_count, coupled_count, mapping) = match mapping_family {
            0 => {
                if channel_count > 2 {
                    return Err(Error::BadHeader("mapping family 0 supports at most 2 channels"));
                }
                let coupled_count = if channel_count == 2 { 1 } else { 0 };
                let mut mapping = ArrayVec::new();
                for ch in 0..channel_count {
                    mapping.push(ch);
                }
                (1u8, coupled_count, mapping)
            }
            _ => {
                let stream_count = r.read_u8()?;
                if stream_count == 0 {
                    return Err(Error::BadHeader("zero stream count"));
                }
                let coupled_count = r.read_u8()?;
                if coupled_count > stream_count {
                    return Err(Error::BadHeader("coupled count exceeds stream count"));
                }
                let mut mapping = ArrayVec::new();
                for _ in 0..channel_count {
                    let entry = r.read_u8()?;
                    if entry != 255 && entry as u16 >= (stream_count as u16 + coupled_count as u16)
                    {
                        return Err(Error::BadHeader("channel mapping entry out of range"));
                    }
                    mapping.push(entry);
                }
                (stream_count, coupled_count, mapping)
            }
        };

        Ok(OpusHead {
            version,
            channel_count,
            pre_skip,
            input_sample_rate,
            output_gain,
            mapping_family,
            stream_count,
            coupled_count,
            mapping,
        })
    }
}

/// The parsed Opus comment header (`OpusTags`) for one link.
#[derive(Debug, Clone)]
pub struct OpusTags {
    pub vendor: String,
    pub comments: Vec<String>,
}

impl OpusTags {
    /// Parses an `OpusTags` packet.
    pub fn parse(packet: &[u8]) -> Result<Self> {
        if packet.len() < 8 {
            return Err(Error::BadHeader("comment packet too short"));
        }
        if &packet[..8] != COMMENT_MAGIC {
            return Err(Error::NotFormat);
        }

        let mut r = Cursor::new(&packet[8..]);
        let vendor = read_length_prefixed_string(&mut r)?;

        let comment_count = r.read_u32::<LittleEndian>()?;
        let mut comments = Vec::with_capacity(comment_count as usize);
        for _ in 0..comment_count {
            comments.push(read_length_prefixed_string(&mut r)?);
        }

        Ok(OpusTags { vendor, comments })
    }

    /// Finds the value of the first comment whose key matches `key`, case-insensitively.
    pub fn comment(&self, key: &str) -> Option<&str> {
        self.comments.iter().find_map(|c| {
            let (k, v) = c.split_once('=')?;
            k.eq_ignore_ascii_case(key).then_some(v)
        })
    }
}

fn read_length_prefixed_string(r: &mut Cursor<&[u8]>) -> Result<String> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).map_err(|_| Error::BadHeader("truncated comment string"))?;
    String::from_utf8(buf).map_err(|_| Error::BadHeader("comment string is not valid UTF-8"))
}

/// The two header packets and bookkeeping needed to start decoding one link, as produced by
/// [`fetch_link_header_group`].
pub struct LinkHeaders {
    pub serial: u32,
    pub head: OpusHead,
    pub tags: OpusTags,
    /// Serial numbers of other BOS pages seen in the same group, so the caller can recognize
    /// and skip their pages without mistaking them for holes.
    pub other_bos_serials: HashSet<u32>,
}

/// Reads a chained-stream's header page group starting from its first BOS page, returning the
/// parsed headers of the chosen (first-parseable) logical stream and the byte offset where its
/// audio data begins.
///
/// Ogg allows multiple logical streams to multiplex their BOS pages at the start of a link
/// (grouping); every other stream in the group is only ever a passenger here; spec.md §4.C
/// requires picking the first one whose identification header parses as Opus and ignoring the
/// others. A `BadHeader` page after grouping has ended (a further BOS page, a hole in the
/// chosen serial's sequence, or a comment header that isn't alone on its page) aborts the link.
pub fn fetch_link_header_group(
    reader: &mut PageReader,
    first_bos: Page,
) -> Result<(LinkHeaders, u64)> {
    let mut bos_serials = HashSet::new();
    bos_serials.insert(first_bos.header.serial);

    let mut chosen: Option<(u32, OpusHead)> = None;
    if first_bos.num_packets() >= 1 && first_bos.packet_complete[0] {
        if let Ok(head) = OpusHead::parse(first_bos.packet_data(0)) {
            chosen = Some((first_bos.header.serial, head));
        }
    }

    loop {
        let page = reader.get_next_page(Boundary::Unbounded)?;
        if page.header.is_first_page {
            if !bos_serials.insert(page.header.serial) {
                return Err(Error::BadHeader("duplicate BOS serial in header group"));
            }
            if chosen.is_none() && page.num_packets() >= 1 && page.packet_complete[0] {
                if let Ok(head) = OpusHead::parse(page.packet_data(0)) {
                    chosen = Some((page.header.serial, head));
                }
            }
            continue;
        }

        let (serial, head) =
            chosen.ok_or(Error::BadHeader("header group ended without an OpusHead"))?;
        return finish_group(reader, page, serial, head, bos_serials);
    }
}

/// Reads forward from the first non-BOS page of a header group until the chosen serial's
/// comment packet completes, verifying it is alone on its page.
fn finish_group(
    reader: &mut PageReader,
    mut page: Page,
    serial: u32,
    head: OpusHead,
    other_bos_serials: HashSet<u32>,
) -> Result<(LinkHeaders, u64)> {
    let mut assembler = PacketAssembler::new();
    let mut expected_seq: Option<u32> = None;

    loop {
        if page.header.is_first_page {
            return Err(Error::BadHeader("BOS page reappeared mid header group"));
        }
        if page.header.serial == serial {
            if let Some(expected) = expected_seq {
                if page.header.sequence != expected {
                    return Err(Error::BadHeader("hole in comment header page sequence"));
                }
            }
            expected_seq = Some(page.header.sequence.wrapping_add(1));

            let packets = assembler.submit_page(&page)?;
            if !packets.is_empty() {
                if packets.len() != 1 || assembler.have_pending() {
                    return Err(Error::BadHeader(
                        "comment header packet did not end alone at a page boundary",
                    ));
                }
                let tags = OpusTags::parse(&packets[0].data)?;
                return Ok((
                    LinkHeaders { serial, head, tags, other_bos_serials },
                    reader.offset(),
                ));
            }
        }
        // Pages belonging to other group members are passengers; they carry no comment
        // header for the chosen stream and are skipped without hole tracking.
        page = reader.get_next_page(Boundary::Unbounded)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_head_family0(channels: u8) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(IDENTIFICATION_MAGIC);
        buf.push(0); // version
        buf.push(channels);
        buf.extend_from_slice(&312u16.to_le_bytes());
        buf.extend_from_slice(&48000u32.to_le_bytes());
        buf.extend_from_slice(&0i16.to_le_bytes());
        buf.push(0); // mapping family
        buf
    }

    #[test]
    fn parses_family_zero_stereo() {
        let packet = sample_head_family0(2);
        let head = OpusHead::parse(&packet).unwrap();
        assert_eq!(head.channel_count, 2);
        assert_eq!(head.pre_skip, 312);
        assert_eq!(head.stream_count, 1);
        assert_eq!(head.coupled_count, 1);
        assert_eq!(head.mapping.as_slice(), &[0, 1]);
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut packet = sample_head_family0(1);
        packet[0] = b'X';
        assert!(matches!(OpusHead::parse(&packet), Err(Error::NotFormat)));
    }

    #[test]
    fn rejects_zero_channels() {
        let packet = sample_head_family0(0);
        assert!(matches!(OpusHead::parse(&packet), Err(Error::BadHeader(_))));
    }

    #[test]
    fn parses_family_one_with_explicit_mapping() {
        let mut buf = Vec::new();
        buf.extend_from_slice(IDENTIFICATION_MAGIC);
        buf.push(0);
        buf.push(3); // channels
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&48000u32.to_le_bytes());
        buf.extend_from_slice(&0i16.to_le_bytes());
        buf.push(1); // mapping family
        buf.push(2); // stream count
        buf.push(1); // coupled count
        buf.extend_from_slice(&[0, 1, 2]);

        let head = OpusHead::parse(&buf).unwrap();
        assert_eq!(head.stream_count, 2);
        assert_eq!(head.coupled_count, 1);
        assert_eq!(head.mapping.as_slice(), &[0, 1, 2]);
    }

    #[test]
    fn parses_tags_and_looks_up_comments() {
        let mut buf = Vec::new();
        buf.extend_from_slice(COMMENT_MAGIC);
        let vendor = b"test encoder";
        buf.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
        buf.extend_from_slice(vendor);
        buf.extend_from_slice(&1u32.to_le_bytes());
        let comment = b"ARTIST=Test Artist";
        buf.extend_from_slice(&(comment.len() as u32).to_le_bytes());
        buf.extend_from_slice(comment);

        let tags = OpusTags::parse(&buf).unwrap();
        assert_eq!(tags.vendor, "test encoder");
        assert_eq!(tags.comment("artist"), Some("Test Artist"));
        assert_eq!(tags.comment("missing"), None);
    }
}
