// Pure Rust Ogg Opus container reader
//
// Copyright (c) 2016 est31 <MTest31@outlook.com>
// and contributors. All rights reserved.
// Licensed under MIT license, or Apache 2 license,
// at your option. Please see the LICENSE file
// attached to this source distribution for details.

//! Dumps decoded PCM from an Ogg Opus file to stdout, so it can be piped straight into
//! something that plays raw audio, e.g.:
//! `cargo run --example player -- in.opus | aplay -f S16_LE -c 2 -r 48000`

use std::env;
use std::fs::File;
use std::io::{self, Write};

use oggopus::byte_source::FileSource;
use oggopus::reader;

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let file_path = env::args().nth(1).expect("No arg found. Please specify a file to open.");
    eprintln!("Opening file: {}", file_path);
    let src = FileSource::open(file_path)?;
    let mut stream = reader::open(src)?;

    eprintln!("Link count: {}", stream.link_count());
    let channels = stream.channel_count(0)?;
    let head = stream.head(0)?;
    eprintln!(
        "Channels: {}, input sample rate: {}, pre-skip: {}",
        channels, head.input_sample_rate, head.pre_skip
    );
    if let Some(bitrate) = stream.bitrate(None)? {
        eprintln!("Average bitrate: {} bps", bitrate);
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut buf = vec![0i16; 4096 * channels];
    let mut bytes = Vec::with_capacity(buf.len() * 2);
    let mut total = 0i64;
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        bytes.clear();
        for sample in &buf[..n * channels] {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        out.write_all(&bytes)?;
        total += n as i64;
    }
    eprintln!("Decoded {} samples per channel.", total);
    Ok(())
}
