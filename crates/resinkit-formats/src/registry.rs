//! Format registry
//!
//! A process-wide, read-only table of every supported format: extension,
//! description, visibility and the codec that implements it. Multiple
//! formats may register the same extension; the content probe decides
//! which one actually handles a given file.
//!
//! The table is initialized once as static data and never mutated, so it
//! is safe to consult from any thread without locking.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use resinkit_core::error::{FormatError, Result};
use resinkit_core::pipeline::ProgressToken;
use resinkit_core::JobDocument;

use crate::codec::{DecodeOptions, FormatCodec};
use crate::formats::{CxdlpCodec, PhzCodec, RsgzCodec, RszCodec};

/// Identifier of a concrete format implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormatType {
    /// ZIP archive with a plaintext G-Code program.
    Rsz,
    /// ZIP archive with an RSA-encrypted G-Code program.
    Rsgz,
    /// Big-endian packed binary with coordinate-line layers.
    Cxdlp,
    /// Little-endian keyed binary with grey7 RLE layers.
    Phz,
}

impl FormatType {
    /// Stable lowercase name, as accepted on the command line.
    pub fn name(self) -> &'static str {
        match self {
            FormatType::Rsz => "rsz",
            FormatType::Rsgz => "rsgz",
            FormatType::Cxdlp => "cxdlp",
            FormatType::Phz => "phz",
        }
    }

    /// Look a format up by its stable name.
    pub fn from_name(name: &str) -> Option<FormatType> {
        match name.to_ascii_lowercase().as_str() {
            "rsz" => Some(FormatType::Rsz),
            "rsgz" => Some(FormatType::Rsgz),
            "cxdlp" => Some(FormatType::Cxdlp),
            "phz" => Some(FormatType::Phz),
            _ => None,
        }
    }
}

/// One registry entry mapping a filename extension to a format.
#[derive(Debug, Clone, Copy)]
pub struct FormatDescriptor {
    /// The format handling this extension.
    pub format_type: FormatType,
    /// Filename extension, lowercase, without the dot.
    pub extension: &'static str,
    /// Human-readable description for pickers.
    pub description: &'static str,
    /// Whether file pickers should offer this entry. Hidden entries exist
    /// for formats that share another format's extension.
    pub visible: bool,
}

/// The static, ordered registry. Order matters: when formats share an
/// extension, probes run in this order and the first match wins.
pub static FORMATS: &[FormatDescriptor] = &[
    FormatDescriptor {
        format_type: FormatType::Rsz,
        extension: "rsz",
        description: "ZIP archive with G-Code program",
        visible: true,
    },
    FormatDescriptor {
        format_type: FormatType::Rsgz,
        extension: "rsz",
        description: "ZIP archive with encrypted G-Code (shared extension)",
        visible: false,
    },
    FormatDescriptor {
        format_type: FormatType::Rsgz,
        extension: "rsgz",
        description: "ZIP archive with encrypted G-Code",
        visible: true,
    },
    FormatDescriptor {
        format_type: FormatType::Cxdlp,
        extension: "cxdlp",
        description: "Packed binary with line-coordinate layers",
        visible: true,
    },
    FormatDescriptor {
        format_type: FormatType::Phz,
        extension: "phz",
        description: "Keyed binary with 7-bit grey layers",
        visible: true,
    },
];

static RSZ_CODEC: RszCodec = RszCodec;
static RSGZ_CODEC: RsgzCodec = RsgzCodec;
static CXDLP_CODEC: CxdlpCodec = CxdlpCodec;
static PHZ_CODEC: PhzCodec = PhzCodec;

/// The codec implementing a format.
pub fn codec_for(format_type: FormatType) -> &'static dyn FormatCodec {
    match format_type {
        FormatType::Rsz => &RSZ_CODEC,
        FormatType::Rsgz => &RSGZ_CODEC,
        FormatType::Cxdlp => &CXDLP_CODEC,
        FormatType::Phz => &PHZ_CODEC,
    }
}

/// Registry entries claiming the given extension, in registry order.
pub fn formats_for_extension(extension: &str) -> Vec<&'static FormatDescriptor> {
    let extension = extension.to_ascii_lowercase();
    FORMATS
        .iter()
        .filter(|d| d.extension == extension)
        .collect()
}

/// Resolve the codec for a file: extension candidates first, content
/// probe to disambiguate.
pub fn probe(path: &Path) -> Result<&'static dyn FormatCodec> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    let candidates = formats_for_extension(extension);
    for descriptor in &candidates {
        let codec = codec_for(descriptor.format_type);
        if codec.can_process(path) {
            debug!(
                format = descriptor.format_type.name(),
                path = %path.display(),
                "content probe matched"
            );
            return Ok(codec);
        }
    }
    Err(FormatError::UnknownFormat {
        path: path.display().to_string(),
    }
    .into())
}

/// Decode a file, resolving its format through the registry.
pub fn decode_file(
    path: &Path,
    options: DecodeOptions,
    progress: &ProgressToken,
) -> Result<JobDocument> {
    if !path.is_file() {
        return Err(FormatError::UnknownFormat {
            path: path.display().to_string(),
        }
        .into());
    }
    probe(path)?.decode(path, options, progress)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_is_ordered_and_complete() {
        for format in [
            FormatType::Rsz,
            FormatType::Rsgz,
            FormatType::Cxdlp,
            FormatType::Phz,
        ] {
            assert!(FORMATS.iter().any(|d| d.format_type == format));
            assert_eq!(codec_for(format).format_type(), format);
        }
    }

    #[test]
    fn test_shared_extension_candidates() {
        let candidates = formats_for_extension("rsz");
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].format_type, FormatType::Rsz);
        assert_eq!(candidates[1].format_type, FormatType::Rsgz);
    }

    #[test]
    fn test_format_names_round_trip() {
        for format in [
            FormatType::Rsz,
            FormatType::Rsgz,
            FormatType::Cxdlp,
            FormatType::Phz,
        ] {
            assert_eq!(FormatType::from_name(format.name()), Some(format));
        }
        assert_eq!(FormatType::from_name("ctb"), None);
    }

    #[test]
    fn test_unknown_extension_fails() {
        let err = probe(Path::new("/nonexistent/file.xyz")).unwrap_err();
        assert!(matches!(
            err,
            resinkit_core::Error::Format(FormatError::UnknownFormat { .. })
        ));
    }
}
