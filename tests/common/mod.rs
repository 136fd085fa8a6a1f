//! Synthetic Ogg Opus byte-stream construction shared by the integration tests.
//!
//! Mirrors `oggopus::page::test_support::build_page` (the crate's own unit-test helper), but
//! reimplemented from scratch: integration tests under `tests/` only see the crate's public
//! API, not its `#[cfg(test)]`-gated internals.

use byteorder::{ByteOrder, LittleEndian};
use crc::{Algorithm, Crc};

const CAPTURE_PATTERN: [u8; 4] = *b"OggS";

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
    Crc::<u32>::new(&OGG_CRC).checksum(bytes)
}

/// Builds one complete Ogg page from a pre-laid-out segment table and body. This is the only
/// way to build a page carrying an unterminated trailing packet (a segment table ending in
/// `255`), which `build_page` below can't express since every packet it's given is complete.
#[allow(clippy::too_many_arguments)]
pub fn build_page_raw(
    granule_position: i64,
    serial: u32,
    sequence: u32,
    is_first_page: bool,
    is_last_page: bool,
    is_continuation: bool,
    segment_table: &[u8],
    body: &[u8],
) -> Vec<u8> {
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
    buf.push(0); // stream structure version
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
    buf.extend_from_slice(&[0u8; 4]); // CRC placeholder
    buf.push(segment_table.len() as u8);
    buf.extend_from_slice(segment_table);
    buf.extend_from_slice(body);

    let crc = crc32(&buf);
    let mut crc_buf = [0u8; 4];
    LittleEndian::write_u32(&mut crc_buf, crc);
    buf[22..26].copy_from_slice(&crc_buf);
    buf
}

/// Builds one complete Ogg page out of whole packets (no packet on it may be left
/// unterminated).
#[allow(clippy::too_many_arguments)]
pub fn build_page(
    granule_position: i64,
    serial: u32,
    sequence: u32,
    is_first_page: bool,
    is_last_page: bool,
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
    build_page_raw(granule_position, serial, sequence, is_first_page, is_last_page, false, &segment_table, &body)
}

pub fn opus_head(channels: u8, pre_skip: u16) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"OpusHead");
    buf.push(0); // version
    buf.push(channels);
    buf.extend_from_slice(&pre_skip.to_le_bytes());
    buf.extend_from_slice(&48000u32.to_le_bytes());
    buf.extend_from_slice(&0i16.to_le_bytes()); // output gain
    buf.push(0); // mapping family 0
    buf
}

pub fn opus_tags() -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"OpusTags");
    let vendor = b"oggopus integration test";
    buf.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
    buf.extend_from_slice(vendor);
    buf.extend_from_slice(&0u32.to_le_bytes()); // zero comments
    buf
}

/// A single 20 ms frame packet (config 1, code 0): decodes to `20 * 48 = 960` samples.
pub fn audio_packet_20ms() -> Vec<u8> {
    vec![1 << 3]
}

/// Builds a minimal single-link stream: BOS/head, tags, then `audio_pages` 20 ms audio pages
/// (the last one carrying the EOS flag), starting at granule position `pre_skip + 960`.
pub fn single_link_stream(channels: u8, pre_skip: u16, audio_pages: u32) -> Vec<u8> {
    single_link_stream_with_serial(7, channels, pre_skip, audio_pages, true)
}

/// As [`single_link_stream`], but with an explicit serial number and control over whether the
/// final page carries the EOS flag (a truncated file never does).
pub fn single_link_stream_with_serial(
    serial: u32,
    channels: u8,
    pre_skip: u16,
    audio_pages: u32,
    eos: bool,
) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend(build_page(-1, serial, 0, true, false, &[&opus_head(channels, pre_skip)]));
    bytes.extend(build_page(-1, serial, 1, false, false, &[&opus_tags()]));
    for i in 0..audio_pages {
        let gp = pre_skip as i64 + 960 * (i as i64 + 1);
        let is_last = eos && i + 1 == audio_pages;
        bytes.extend(build_page(gp, serial, 2 + i, false, is_last, &[&audio_packet_20ms()]));
    }
    bytes
}

/// Builds a two-audio-page single-link stream whose `pcm_start` sits near `i64::MAX`: the
/// first audio page establishes it with an ordinary (non-wrapped) granule position, and the
/// second, final page's granule position has wrapped through the `i64::MAX -> i64::MIN` seam
/// (spec.md §8 scenario 6's "wraps into negative territory mid-link").
pub fn wrapping_single_link_stream(channels: u8) -> Vec<u8> {
    let pcm_start = i64::MAX - 1440;
    let first_gp = pcm_start + 960;
    let last_gp = oggopus::granule::add(first_gp, 960).expect("960 more samples past first_gp wraps legally");
    assert!(last_gp < 0, "the test fixture must actually cross the wrap seam");

    let mut bytes = Vec::new();
    bytes.extend(build_page(-1, 9, 0, true, false, &[&opus_head(channels, 0)]));
    bytes.extend(build_page(-1, 9, 1, false, false, &[&opus_tags()]));
    bytes.extend(build_page(first_gp, 9, 2, false, false, &[&audio_packet_20ms()]));
    bytes.extend(build_page(last_gp, 9, 3, false, true, &[&audio_packet_20ms()]));
    bytes
}

/// Builds a single-link stream where the third page leaves a packet unterminated and the page
/// that would have completed it is missing entirely: the next page to arrive starts a fresh,
/// non-continuation packet while the assembler still expects a continuation. Submitting that
/// page trips `Error::Hole` (spec.md §8 scenario 3, "a page is corrupted/missing mid-stream").
/// A normal recovery page follows so callers can keep reading past the hole.
pub fn corrupted_middle_page_stream(channels: u8, pre_skip: u16) -> Vec<u8> {
    let serial = 11;
    let mut bytes = Vec::new();
    bytes.extend(build_page(-1, serial, 0, true, false, &[&opus_head(channels, pre_skip)]));
    bytes.extend(build_page(-1, serial, 1, false, false, &[&opus_tags()]));

    // A fragment page: one packet started, segment table ends in 255, nothing completes it.
    let frag_gp = pre_skip as i64 + 960;
    bytes.extend(build_page_raw(frag_gp, serial, 2, false, false, false, &[255], &[0u8; 255]));

    // The page that would carry the rest of that packet never arrives; this page starts a new,
    // non-continuation packet instead, which is exactly the mismatch `submit_page` treats as a
    // hole.
    let recovered_gp = frag_gp + 960;
    bytes.extend(build_page(recovered_gp, serial, 3, false, false, &[&audio_packet_20ms()]));

    let final_gp = recovered_gp + 960;
    bytes.extend(build_page(final_gp, serial, 4, false, true, &[&audio_packet_20ms()]));
    bytes
}
