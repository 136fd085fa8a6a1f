// Pure Rust Ogg Opus container reader
//
// Copyright (c) 2016 est31 <MTest31@outlook.com>
// and contributors. All rights reserved.
// Licensed under MIT license, or Apache 2 license,
// at your option. Please see the LICENSE file
// attached to this source distribution for details.

use std::env;
use std::time::Instant;

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
    println!("Opening file: {}", file_path);
    let src = FileSource::open(file_path)?;
    let mut stream = reader::open(src)?;

    let mut buf = vec![0i16; 4096 * 8];
    let mut n = 0u64;
    let mut total_samples = 0i64;
    let start_decode_time = Instant::now();
    loop {
        let samples = stream.read(&mut buf)?;
        if samples == 0 {
            break;
        }
        n += 1;
        total_samples += samples as i64;
    }
    let decode_duration = Instant::now() - start_decode_time;
    let rate = stream.head(0)?.input_sample_rate as f64;
    println!(
        "The piece is {} s long ({} packets, {} links).",
        total_samples as f64 / rate,
        n,
        stream.link_count()
    );
    println!("Decoded in {} s.", decode_duration.as_secs_f64());

    Ok(())
}
