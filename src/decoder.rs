// Pure Rust Ogg Opus container reader
//
// Copyright (c) 2016 est31 <MTest31@outlook.com>
// and contributors. All rights reserved.
// Licensed under MIT license, or Apache 2 license,
// at your option. Please see the LICENSE file
// attached to this source distribution for details.

/*!
The decode driver: the state machine that turns pages into staged, timestamped packets.

This is spec.md §4.F's `fetch_and_process_page`. It knows about links, serials, and the
framing assembler, but nothing about PCM sample buffers or pre-skip discard counts past the
point of recording how much the sample pump still owes; the pump (`sample_pump` module) reads
the staged packets this module produces and feeds them to the decoder.
*/

use std::collections::HashSet;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::granule;
use crate::header::{self, OpusHead};
use crate::link::Link;
use crate::opus_decoder::{decoder_matches, OpusMultistreamDecoder, PacketDecoder};
use crate::page_reader::{Boundary, PageReader};
use crate::timestamp::{self, PacketAssembler};

/// The four monotonically increasing readiness states of spec.md §4.F.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    /// Byte source attached and framing initialized.
    Opened,
    /// Headers of the first link parsed, but full link structure not yet enumerated.
    PartOpen,
    /// Current link's serial committed; decoder not yet built or reset for it.
    StreamSet,
    /// Decoder matches the current link and is ready to produce samples.
    InitSet,
}

/// One packet ready for decoding, with its assigned granule position.
#[derive(Debug, Clone)]
pub struct StagedPacket {
    pub data: Vec<u8>,
    /// This packet's own ending granule position (forward-accumulated from the link's
    /// `pcm_start`), already clear of the `-1` tombstone.
    pub granule_position: i64,
    pub duration: u32,
    /// Set on the packet the end-trimming logic decided actually ends the link; the sample
    /// pump trims its tail to match the link's declared `pcm_end`.
    pub is_link_end: bool,
}

/// Drives page fetching and packet staging for one stream. Holds no PCM buffers; the sample
/// pump owns those.
pub struct DecodeDriver {
    state: ReadyState,
    assembler: PacketAssembler,
    staged: Vec<StagedPacket>,
    staged_pos: usize,
    prev_packet_gp: Option<i64>,
    /// Samples the sample pump still must discard from the front of the next delivered
    /// packet: pre-skip at a link's start, or the post-seek 80 ms settle window.
    pub cur_discard_count: u32,
    decoder: Option<Box<dyn PacketDecoder>>,
    /// The head the current `decoder` was built from, so a later link can be compared
    /// against it via [`decoder_matches`] instead of always rebuilding.
    decoder_head: Option<OpusHead>,
    /// Header and segment-table bytes of pages accepted since the last
    /// [`take_page_header_bytes`](Self::take_page_header_bytes) call; packet body bytes are
    /// counted separately by the sample pump when it consumes each packet.
    page_header_bytes: u64,
}

impl DecodeDriver {
    pub fn new() -> Self {
        DecodeDriver {
            state: ReadyState::Opened,
            assembler: PacketAssembler::new(),
            staged: Vec::new(),
            staged_pos: 0,
            prev_packet_gp: None,
            cur_discard_count: 0,
            decoder: None,
            decoder_head: None,
            page_header_bytes: 0,
        }
    }

    /// Drains the page-header byte accumulator, resetting it to zero.
    pub fn take_page_header_bytes(&mut self) -> u64 {
        std::mem::take(&mut self.page_header_bytes)
    }

    pub fn state(&self) -> ReadyState {
        self.state
    }

    pub fn decoder_mut(&mut self) -> Option<&mut dyn PacketDecoder> {
        self.decoder.as_deref_mut()
    }

    /// Drops staged packets and the assembler's pending fragment, and forgets `prev_packet_gp`
    /// so the next page re-derives it. Used after a raw seek, where the landing page's context
    /// is unknown ahead of time.
    pub fn reset_for_seek(&mut self) {
        self.assembler.reset();
        self.staged.clear();
        self.staged_pos = 0;
        self.prev_packet_gp = None;
    }

    /// As [`reset_for_seek`](Self::reset_for_seek), but immediately pins `prev_packet_gp` to a
    /// known value and commits to the given link index and discard count. Used by the page and
    /// sample-accurate seeks (spec.md §4.G), which already know exactly which page they landed
    /// on and how many leading samples to discard.
    pub fn reset_for_page_seek(&mut self, gp: i64, discard_count: u32) {
        self.assembler.reset();
        self.staged.clear();
        self.staged_pos = 0;
        self.prev_packet_gp = Some(gp);
        self.cur_discard_count = discard_count;
        self.state = ReadyState::StreamSet;
    }

    /// Forces the ready state back to [`ReadyState::Opened`], e.g. after a raw seek, so the next
    /// `fetch_and_process_page` rebuilds everything from the page it lands on.
    pub fn demote_to_opened(&mut self) {
        self.state = ReadyState::Opened;
    }

    /// Pops the next staged packet, if any remain from the most recent
    /// `fetch_and_process_page` call.
    ///
    /// As a side effect, becomes the new [`prev_packet_gp`](Self::prev_packet_gp): the sample
    /// pump reads that accessor *before* calling this to get the granule position the popped
    /// packet's end-trimming must be measured against, matching spec.md §4.H.
    pub fn pop_staged(&mut self) -> Option<StagedPacket> {
        if self.staged_pos < self.staged.len() {
            let pkt = self.staged[self.staged_pos].clone();
            self.staged_pos += 1;
            self.prev_packet_gp = Some(pkt.granule_position);
            Some(pkt)
        } else {
            None
        }
    }

    pub fn has_staged(&self) -> bool {
        self.staged_pos < self.staged.len()
    }

    /// Looks at the next staged packet without popping it. Used by the sample-accurate seek,
    /// which needs to decide whether a packet is worth skipping before committing to it.
    pub fn peek_staged(&self) -> Option<&StagedPacket> {
        self.staged.get(self.staged_pos)
    }

    /// The granule position immediately preceding the next not-yet-popped staged packet.
    pub fn prev_packet_gp(&self) -> Option<i64> {
        self.prev_packet_gp
    }

    /// The workhorse loop of spec.md §4.F.
    ///
    /// `links` is the full link table (populated at open time for seekable sources); `cur` is
    /// the index of the link currently being read, updated in place when a link boundary is
    /// crossed. `allow_read` mirrors a `CacheOnly` vs. unbounded page fetch; `allow_span`
    /// controls whether crossing into the next link is permitted or reported as `Eof`.
    pub fn fetch_and_process_page(
        &mut self,
        reader: &mut PageReader,
        links: &mut Vec<Link>,
        cur: &mut usize,
        allow_read: bool,
        allow_span: bool,
    ) -> Result<()> {
        if self.has_staged() {
            return Ok(());
        }

        loop {
            let boundary = if allow_read { Boundary::Unbounded } else { Boundary::CacheOnly };
            let page = reader.get_next_page(boundary)?;

            let link = &links[*cur];
            let known = link.serial_set_including(link.serialno);

            // The current link's own BOS page, seen again: a raw seek landed at or before its
            // header group rather than its audio. The header bytes aren't a packet; skip
            // straight to the already-known data offset instead of handing them to the
            // assembler (spec.md §8 scenario 5, raw_seek(0) replaying from the file start).
            if page.header.is_first_page && page.header.serial == link.serialno {
                let data_offset = link.data_offset;
                reader.seek_to(data_offset)?;
                self.state = ReadyState::Opened;
                self.assembler.reset();
                self.prev_packet_gp = None;
                self.state = ReadyState::StreamSet;
                continue;
            }

            if page.header.serial != link.serialno {
                if page.header.is_first_page {
                    if !allow_span {
                        return Err(Error::Eof);
                    }
                    *cur += 1;
                    if *cur >= links.len() {
                        let (headers, data_offset) =
                            header::fetch_link_header_group(reader, page)?;
                        let pre_skip = headers.head.pre_skip as i64;
                        let initial =
                            timestamp::find_initial_pcm_offset(reader, headers.serial, pre_skip)?;
                        reader.seek_to(data_offset)?;
                        links.push(Link {
                            offset: 0,
                            data_offset,
                            end_offset: 0,
                            serialno: headers.serial,
                            head: headers.head,
                            tags: headers.tags,
                            pcm_start: initial.pcm_start,
                            pcm_end: 0,
                            other_bos_serials: headers.other_bos_serials,
                        });
                    }
                    self.state = ReadyState::Opened;
                    self.assembler.reset();
                    self.prev_packet_gp = None;
                    self.state = ReadyState::StreamSet;
                    continue;
                }
                if known.contains(&page.header.serial) {
                    // A BOS-group passenger stream; not a hole, just not ours.
                    continue;
                }
                debug!("ignoring foreign non-BOS page with serial {:#010x}", page.header.serial);
                continue;
            }

            if self.state < ReadyState::StreamSet {
                self.state = ReadyState::StreamSet;
            }
            if self.state == ReadyState::StreamSet {
                let link = &links[*cur];
                // We're at or before this link's data_offset: its pcm_start and pre_skip are
                // already known from header parsing (or link enumeration), so seed
                // prev_packet_gp/cur_discard_count directly instead of falling through to the
                // post-seek reconstruction below, which would otherwise misread this page (e.g.
                // discarding scenario 1's lone EOS audio page entirely).
                if self.prev_packet_gp.is_none() && page.offset <= link.data_offset {
                    self.prev_packet_gp = Some(link.pcm_start);
                    self.cur_discard_count = link.head.pre_skip as u32;
                }
                self.make_decode_ready(&links[*cur].head)?;
            }

            let is_eos = page.header.is_last_page;
            let page_gp = page.header.granule_position;
            self.page_header_bytes += page.header_len();

            let packets = match self.assembler.submit_page(&page) {
                Ok(p) => p,
                Err(Error::Hole) => {
                    warn!("hole in packet sequence at reader offset {}", reader.offset());
                    return Err(Error::Hole);
                }
                Err(e) => return Err(e),
            };
            if packets.is_empty() {
                continue;
            }

            if self.prev_packet_gp.is_none() {
                let total: i64 =
                    packets.iter().filter_map(|p| p.duration).map(|d| d as i64).sum();
                if granule::is_invalid(page_gp) {
                    return Err(Error::BadTimestamp("first page after seek has no granule position"));
                }
                let start = (page_gp as i128 - total as i128).max(0) as i64;
                self.prev_packet_gp = Some(start);

                let link = &links[*cur];
                let pre_skip = link.head.pre_skip as i64;
                let into_link = granule::diff(start, link.pcm_start).unwrap_or(pre_skip);
                let remaining_pre_skip = (pre_skip - into_link).max(0);
                const SETTLE_WINDOW: i64 = 80 * 48; // 80 ms at 48 kHz
                self.cur_discard_count = remaining_pre_skip.max(SETTLE_WINDOW) as u32;
                if is_eos {
                    continue;
                }
            }

            // Stage every packet with its forward-accumulated granule position; on an EOS
            // page, the packet whose accumulated position reaches or passes the page's
            // declared end is the link's last audible one (spec.md §4.F end-trimming), and
            // anything the page claims to hold after it doesn't exist.
            //
            // `gp` is a local accumulator seeded from `prev_packet_gp` (the position of the
            // last packet actually *delivered*, or the freshly reconstructed link-start
            // position); it must NOT be written back to `self.prev_packet_gp` here, since
            // packets staged now may not be popped (and thus "previous" to the next one) until
            // later calls into `pop_staged` — see spec.md §4.H's per-packet end-trimming, which
            // needs the true delivery-order previous granule position, not the page's last one.
            let mut gp = self.prev_packet_gp.expect("just initialized above if it was None");
            for pkt in &packets {
                let duration = pkt.duration.unwrap_or(0);
                gp = granule::add(gp, duration as i64)?;
                let is_link_end = is_eos && granule::cmp(gp, page_gp)? >= 0;
                self.staged.push(StagedPacket {
                    data: pkt.data.clone(),
                    granule_position: gp,
                    duration,
                    is_link_end,
                });
                if is_link_end {
                    break;
                }
            }

            if !self.staged.is_empty() {
                return Ok(());
            }
        }
    }

    fn make_decode_ready(&mut self, head: &OpusHead) -> Result<()> {
        let reusable = match (&mut self.decoder, &self.decoder_head) {
            (Some(existing), Some(built_for)) if decoder_matches(built_for, head) => {
                existing.reset_for(head)?;
                true
            }
            _ => false,
        };
        if !reusable {
            self.decoder = Some(Box::new(OpusMultistreamDecoder::new(head)?));
        }
        self.decoder_head = Some(head.clone());
        self.state = ReadyState::InitSet;
        Ok(())
    }
}

impl Default for DecodeDriver {
    fn default() -> Self {
        Self::new()
    }
}

trait SerialSet {
    fn serial_set_including(&self, serial: u32) -> HashSet<u32>;
}

impl SerialSet for Link {
    fn serial_set_including(&self, serial: u32) -> HashSet<u32> {
        let mut set = self.other_bos_serials.clone();
        set.insert(serial);
        set
    }
}
