//! Ray-sphere intersection rendered as a P2 image.
//!
//! Traces one ray per pixel against a unit sphere, producing 255 on hit and
//! 0 on miss: a filled disc on a black background. The whole image is a
//! single fused kernel over width * height lanes.

use std::io::Write as _;

use wavefront::demos;
use wavefront::runtime;

const WIDTH: usize = 1024;
const HEIGHT: usize = 1024;

fn main() {
    env_logger::init();
    runtime::init();

    let pixels = demos::render_disc(WIDTH, HEIGHT);

    let path = std::env::args().nth(1).unwrap_or_else(|| "raydisc.pgm".to_string());
    let mut out = std::io::BufWriter::new(std::fs::File::create(&path).expect("create output"));
    writeln!(out, "P2\n{} {}\n255", WIDTH, HEIGHT).unwrap();
    for row in pixels.chunks(WIDTH) {
        let line: Vec<String> = row.iter().map(|p| p.to_string()).collect();
        writeln!(out, "{}", line.join(" ")).unwrap();
    }
    drop(out);

    let lit_count = pixels.iter().filter(|&&p| p != 0).count();
    println!("wrote {} ({} lit pixels)", path, lit_count);

    runtime::destroy();
}
