// Pure Rust Ogg Opus container reader
//
// Copyright (c) 2016 est31 <MTest31@outlook.com>
// and contributors. All rights reserved.
// Licensed under MIT license, or Apache 2 license,
// at your option. Please see the LICENSE file
// attached to this source distribution for details.

//! Demonstrates driving the reader over a byte source that randomly reports
//! `io::ErrorKind::WouldBlock`, the pattern a non-blocking transport (a socket, a pipe with
//! `O_NONBLOCK`) would need. The crate has no async runtime of its own (spec.md §5): a
//! caller wanting asynchrony wraps its own non-blocking source and retries on `WouldBlock`
//! through the ordinary three-value read contract.

use std::env;
use std::fs::File;
use std::io::{self, Read};
use std::time::Instant;

use oggopus::byte_source::{ByteSource, FileSource};
use oggopus::error::Error;
use oggopus::reader;

/// Wraps a seekable reader so that roughly half its reads fail with `WouldBlock`.
struct Flaky<T> {
    inner: FileSource<T>,
}

impl<T: Read + io::Seek> ByteSource for Flaky<T> {
    fn read(&mut self, buf: &mut [u8]) -> oggopus::error::Result<usize> {
        if rand::random() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "would block").into());
        }
        self.inner.read(buf)
    }

    fn seek(&mut self, offset: u64) -> oggopus::error::Result<u64> {
        self.inner.seek(offset)
    }

    fn tell(&mut self) -> oggopus::error::Result<u64> {
        self.inner.tell()
    }

    fn len(&mut self) -> oggopus::error::Result<u64> {
        self.inner.len()
    }

    fn is_seekable(&self) -> bool {
        self.inner.is_seekable()
    }
}

/// Retries an operation until it stops reporting `WouldBlock`.
macro_rules! continue_trying {
    ($e:expr) => {
        loop {
            match $e {
                Ok(val) => break val,
                Err(Error::Read(ref err)) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err.into()),
            }
        }
    };
}

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let file_path = env::args().nth(1).expect("No arg found. Please specify a file to open.");
    println!("Opening file: {}", file_path);
    let f = File::open(file_path)?;
    let src = Flaky { inner: FileSource::new(f) };

    let mut stream = continue_trying!(reader::open(src));
    println!("Sample rate: {}", stream.head(0)?.input_sample_rate);

    let channels = stream.channel_count(0)?;
    let mut buf = vec![0i16; 4096 * channels];
    let mut n = 0u64;
    let mut total_samples = 0i64;
    let start_decode_time = Instant::now();
    loop {
        let samples = continue_trying!(stream.read(&mut buf));
        if samples == 0 {
            println!("Seems to be the end.");
            break;
        }
        n += 1;
        total_samples += samples as i64;
    }
    let decode_duration = Instant::now() - start_decode_time;
    let rate = stream.head(0)?.input_sample_rate as f64;
    println!("The piece is {} s long ({} packets).", total_samples as f64 / rate, n);
    println!("Decoded in {} s.", decode_duration.as_secs_f64());

    Ok(())
}
