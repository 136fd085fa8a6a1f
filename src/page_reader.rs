// Pure Rust Ogg Opus container reader
//
// Copyright (c) 2016 est31 <MTest31@outlook.com>
// and contributors. All rights reserved.
// Licensed under MIT license, or Apache 2 license,
// at your option. Please see the LICENSE file
// attached to this source distribution for details.

/*!
Forward and backward page acquisition on top of a byte source.

This is the only place that walks the byte source directly; everything above it (header
fetching, link enumeration, seeking) asks for pages by offset or by "next" and never touches
the source itself. Holes (resync failures, bad CRCs) are swallowed here and counted against
the read boundary rather than propagated, per the framing assembler's contract.
*/

use std::collections::HashSet;

use log::debug;

use crate::byte_source::ByteSource;
use crate::error::{Error, Result};
use crate::page::{self, Page, MAX_PAGE_SIZE};

/// Largest possible Ogg page, used as the minimum chunk size for the backward search.
pub const PAGE_MAX: u64 = MAX_PAGE_SIZE as u64;

const BACKWARD_SEARCH_START: u64 = 65536;
const BACKWARD_SEARCH_CAP: u64 = 1024 * 1024;

/// A `boundary` argument controlling how far [`PageReader::get_next_page`] may read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// Read as far as necessary.
    Unbounded,
    /// Do not read any further bytes from the source; only a page found by resyncing within
    /// bytes already returned by earlier reads can satisfy the request.
    CacheOnly,
    /// Read at most `n` more bytes from the source's current offset.
    Limited(u64),
}

/// Reads Ogg pages out of a [`ByteSource`], tracking the current byte offset.
pub struct PageReader<'a> {
    src: &'a mut dyn ByteSource,
    offset: u64,
}

impl<'a> PageReader<'a> {
    pub fn new(src: &'a mut dyn ByteSource, offset: u64) -> Self {
        PageReader { src, offset }
    }

    /// The current byte offset, i.e. the position just past the last page returned.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The total length of the underlying byte source.
    pub fn len(&mut self) -> Result<u64> {
        self.src.len()
    }

    /// Repositions the source, zeroing any resync state. Used by raw seeks and by the link
    /// enumerator's bisection probes.
    pub fn seek_to(&mut self, offset: u64) -> Result<()> {
        self.src.seek(offset)?;
        self.offset = offset;
        Ok(())
    }

    /// Reads the next page, skipping holes, bounded by `boundary`.
    ///
    /// Returns `Ok(page)` on success. A `CacheOnly` boundary with nothing already
    /// resynchronizable returns [`Error::Eof`] immediately without touching the source
    /// further (this reader has no read-ahead buffer of its own to serve from).
    pub fn get_next_page(&mut self, boundary: Boundary) -> Result<Page> {
        if boundary == Boundary::CacheOnly {
            return Err(Error::Eof);
        }
        let start = self.offset;
        let limit = match boundary {
            Boundary::Limited(n) => Some(start + n),
            _ => None,
        };

        loop {
            if let Some(limit) = limit {
                if self.offset >= limit {
                    return Err(Error::Eof);
                }
            }
            match page::read_page(self.src) {
                Ok(page) => {
                    self.offset = page.offset + page.len;
                    return Ok(page);
                }
                Err(Error::Hole) => {
                    debug!("hole while scanning for next page at offset {}", self.offset);
                    self.offset = self.src.tell()?;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Searches backward from the current offset for the very last page in the source,
    /// regardless of serial. Used once by the link enumerator to learn the file's true end.
    pub fn get_last_page(&mut self) -> Result<Page> {
        let end = self.offset;
        let mut chunk = BACKWARD_SEARCH_START.max(PAGE_MAX);

        loop {
            let begin = end.saturating_sub(chunk);
            self.seek_to(begin)?;

            let mut last: Option<Page> = None;
            loop {
                if self.offset >= end {
                    break;
                }
                match page::read_page(self.src) {
                    Ok(page) => {
                        if page.offset + page.len > end {
                            break;
                        }
                        self.offset = page.offset + page.len;
                        last = Some(page);
                    }
                    Err(Error::Hole) => {
                        self.offset = self.src.tell()?;
                        continue;
                    }
                    Err(Error::Eof) => break,
                    Err(e) => return Err(e),
                }
            }

            if let Some(page) = last {
                return Ok(page);
            }
            if begin == 0 {
                return Err(Error::BadLink("reverse page search reached offset 0 without a page"));
            }
            chunk = (chunk * 2).min(BACKWARD_SEARCH_CAP).max(chunk + PAGE_MAX);
        }
    }

    /// Searches backward from the current offset for the last page whose serial is either
    /// `preferred_serial` or, failing that, any serial in `known_serials`.
    ///
    /// Chunks grow exponentially (65536 bytes, doubling, capped at 1 MiB, never smaller than
    /// one maximal page) until a qualifying page is found. Fails with [`Error::BadLink`] if
    /// the search reaches offset 0 without ever finding a page.
    pub fn get_prev_page_matching(
        &mut self,
        preferred_serial: u32,
        known_serials: &HashSet<u32>,
    ) -> Result<Page> {
        let end = self.offset;
        let mut chunk = BACKWARD_SEARCH_START.max(PAGE_MAX);

        loop {
            let begin = end.saturating_sub(chunk);
            self.seek_to(begin)?;

            let mut preferred_hit: Option<Page> = None;
            let mut any_hit: Option<Page> = None;

            loop {
                if self.offset >= end {
                    break;
                }
                match page::read_page(self.src) {
                    Ok(page) => {
                        if page.offset + page.len > end {
                            break;
                        }
                        self.offset = page.offset + page.len;
                        if page.header.serial == preferred_serial {
                            preferred_hit = Some(page);
                        } else if known_serials.contains(&page.header.serial) {
                            // A foreign page invalidates a preferred hit found earlier in
                            // this chunk: the search has crossed into a different link.
                            preferred_hit = None;
                            any_hit = Some(page);
                        } else {
                            any_hit = Some(page);
                        }
                    }
                    Err(Error::Hole) => {
                        self.offset = self.src.tell()?;
                        continue;
                    }
                    Err(Error::Eof) => break,
                    Err(e) => return Err(e),
                }
            }

            if let Some(page) = preferred_hit.or(any_hit) {
                return Ok(page);
            }

            if begin == 0 {
                return Err(Error::BadLink("reverse page search reached offset 0 without a page"));
            }
            chunk = (chunk * 2).min(BACKWARD_SEARCH_CAP).max(chunk + PAGE_MAX);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_source::MemorySource;
    use crate::page::test_support::build_page;

    fn stream(pages: &[Vec<u8>]) -> Vec<u8> {
        pages.concat()
    }

    #[test]
    fn get_next_page_skips_a_corrupted_page() {
        let mut good_a = build_page(100, 1, 0, true, false, false, &[b"a"]);
        let mut bad = build_page(200, 1, 1, false, false, false, &[b"b"]);
        let last = bad.len() - 1;
        bad[last] ^= 0xff;
        let good_b = build_page(300, 1, 2, false, false, false, &[b"c"]);

        let mut bytes = Vec::new();
        bytes.append(&mut good_a);
        bytes.append(&mut bad);
        bytes.extend_from_slice(&good_b);

        let mut src = MemorySource::new(bytes);
        let mut reader = PageReader::new(&mut src, 0);
        let p1 = reader.get_next_page(Boundary::Unbounded).unwrap();
        assert_eq!(p1.header.granule_position, 100);
        let p2 = reader.get_next_page(Boundary::Unbounded).unwrap();
        assert_eq!(p2.header.granule_position, 300);
    }

    #[test]
    fn get_prev_page_matching_finds_the_preferred_serial() {
        let pages = vec![
            build_page(10, 1, 0, true, false, false, &[b"a"]),
            build_page(20, 2, 0, true, false, false, &[b"x"]),
            build_page(30, 1, 1, false, true, false, &[b"b"]),
        ];
        let bytes = stream(&pages);
        let end = bytes.len() as u64;
        let mut src = MemorySource::new(bytes);
        let mut reader = PageReader::new(&mut src, end);
        let mut serials = HashSet::new();
        serials.insert(1);
        serials.insert(2);
        let page = reader.get_prev_page_matching(1, &serials).unwrap();
        assert_eq!(page.header.serial, 1);
        assert_eq!(page.header.granule_position, 30);
    }

    #[test]
    fn get_last_page_ignores_serial() {
        let pages = vec![
            build_page(10, 1, 0, true, false, false, &[b"a"]),
            build_page(20, 2, 0, true, false, false, &[b"x"]),
            build_page(30, 1, 1, false, true, false, &[b"b"]),
        ];
        let bytes = stream(&pages);
        let end = bytes.len() as u64;
        let mut src = MemorySource::new(bytes);
        let mut reader = PageReader::new(&mut src, end);
        let page = reader.get_last_page().unwrap();
        assert_eq!(page.header.granule_position, 30);
    }

    #[test]
    fn get_prev_page_matching_fails_at_offset_zero() {
        let mut src = MemorySource::new(Vec::<u8>::new());
        let mut reader = PageReader::new(&mut src, 0);
        let serials = HashSet::new();
        assert!(matches!(
            reader.get_prev_page_matching(1, &serials),
            Err(Error::BadLink(_))
        ));
    }
}
