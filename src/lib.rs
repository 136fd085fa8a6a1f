// Pure Rust Ogg Opus container reader
//
// Copyright (c) 2016 est31 <MTest31@outlook.com>
// and contributors. All rights reserved.
// Licensed under MIT license, or Apache 2 license,
// at your option. Please see the LICENSE file
// attached to this source distribution for details.

#![forbid(unsafe_code)]
#![cfg_attr(test, deny(warnings))]

/*!
A pure Rust container-layer reader for Ogg-encapsulated Opus streams.

Given a byte source, [`reader::OggOpusReader`] exposes stream validation, header/tag
inspection, link enumeration for chained streams, sample-accurate and page-granular
seeking, and PCM decoding to either 16-bit integer or 32-bit float output. The actual Opus
packet decoding is delegated to libopus through the [`opus_decoder`] module; this crate's
job is everything around it: Ogg framing, chained-link discovery, granule-position
arithmetic, and seeking.

```no_run
use oggopus::byte_source::FileSource;
use oggopus::reader;

# fn main() -> Result<(), Box<dyn std::error::Error>> {
let src = FileSource::open("audio.opus")?;
let mut stream = reader::open(src)?;
let mut buf = vec![0i16; 4096 * stream.channel_count(0)?];
while stream.read(&mut buf)? > 0 {
    // process decoded PCM
}
# Ok(())
# }
```
*/

pub mod byte_source;
pub mod decoder;
pub mod error;
pub mod granule;
pub mod header;
pub mod link;
pub mod opus_decoder;
pub mod page;
pub mod page_reader;
pub mod reader;
pub mod sample_pump;
pub mod seek;
pub mod timestamp;

pub use error::Error;
pub use header::{OpusHead, OpusTags};
pub use link::Link;
pub use reader::{open, test, test_open, OggOpusReader, OpenOptions};
