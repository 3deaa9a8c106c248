//! Stand-in generation worker for tests.
//!
//! Speaks the worker protocol on stdin/stdout: reads 16-byte requests
//! (big-endian `x, y, z, seed`) and answers each with a length-prefixed
//! 65536-byte chunk of big-endian block ids, the byte order the real
//! worker writes. The terrain is flat: stone below y=8, one layer of
//! grass or dirt (picked from the coordinates and seed) at y=8, air above.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

const SIZE: usize = 32;
const GROUND: usize = 8;

fn generate(x: i32, z: i32, seed: i32) -> Vec<u8> {
    let top: u16 = if (x ^ z ^ seed) & 1 == 0 { 2 } else { 3 };
    let mut out = Vec::with_capacity(SIZE * SIZE * SIZE * 2);
    for _lx in 0..SIZE {
        for ly in 0..SIZE {
            for _lz in 0..SIZE {
                let block: u16 = match ly {
                    y if y < GROUND => 1,
                    GROUND => top,
                    _ => 0,
                };
                out.extend_from_slice(&block.to_be_bytes());
            }
        }
    }
    out
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::io::Result<()> {
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut req = [0u8; 16];
    loop {
        match stdin.read_exact(&mut req).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
        let field = |i: usize| i32::from_be_bytes([req[i], req[i + 1], req[i + 2], req[i + 3]]);
        let (x, _y, z, seed) = (field(0), field(4), field(8), field(12));
        eprintln!("stub_worker: chunk ({x}, {z}) seed {seed}");

        let payload = generate(x, z, seed);
        stdout.write_all(&(payload.len() as u32).to_be_bytes()).await?;
        stdout.write_all(&payload).await?;
        stdout.flush().await?;
    }
}
