//! Concrete format implementations
//!
//! Four formats, each exercising a different part of the codec engine:
//!
//! | Format  | Container       | Layers            | Extras                      |
//! |---------|-----------------|-------------------|-----------------------------|
//! | `rsz`   | ZIP             | PNG entries       | plain G-Code program        |
//! | `rsgz`  | ZIP             | PNG entries       | RSA-encrypted G-Code        |
//! | `cxdlp` | packed binary   | coordinate lines  | CRC32 / additive checksum   |
//! | `phz`   | packed binary   | grey7 runs        | keyed XOR stream cipher     |

pub mod cxdlp;
pub mod phz;
pub mod rsgz;
pub mod rsz;

pub use cxdlp::CxdlpCodec;
pub use phz::PhzCodec;
pub use rsgz::RsgzCodec;
pub use rsz::RszCodec;

use std::io::Read;
use std::path::Path;

/// Read the first `len` bytes of a file for a magic probe.
pub(crate) fn read_prefix(path: &Path, len: usize) -> std::io::Result<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}
