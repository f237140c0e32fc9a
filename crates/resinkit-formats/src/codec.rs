//! Format codec abstraction
//!
//! Each concrete format implements [`FormatCodec`]: a content probe, a
//! decode path, an encode path and an in-place partial save. Dispatch is
//! static over a fixed set of implementations; there is no inheritance
//! and no per-format subclassing of the document.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use resinkit_core::error::{FormatError, Result};
use resinkit_core::params::Capabilities;
use resinkit_core::pipeline::ProgressToken;
use resinkit_core::JobDocument;

use crate::registry::FormatType;

/// Options for a decode call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DecodeOptions {
    /// Read headers and the per-layer metadata table only, skipping layer
    /// pixel payloads. A partially decoded document cannot be re-encoded.
    pub partial: bool,
    /// Worker budget for the parallel layer phase; `0` uses the available
    /// core count.
    pub max_workers: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            partial: false,
            max_workers: 0,
        }
    }
}

/// Options for an encode call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EncodeOptions {
    /// Worker budget for the parallel layer phase; `0` uses the available
    /// core count.
    pub max_workers: usize,
    /// Stream-cipher seed for formats that support payload encryption.
    /// `0` writes the plaintext variant; formats without a cipher ignore
    /// this.
    pub encryption_seed: u32,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            max_workers: 0,
            encryption_seed: 0,
        }
    }
}

/// One concrete file format implementation.
pub trait FormatCodec: Sync {
    /// The format this codec implements.
    fn format_type(&self) -> FormatType;

    /// Capability flags and supported parameter sets.
    fn capabilities(&self) -> &'static Capabilities;

    /// File versions this codec can read and write, oldest first.
    fn allowed_versions(&self) -> &'static [u32];

    /// Content probe: whether this codec can decode the file at `path`.
    ///
    /// Reads a few bytes (or archive entry names) to disambiguate formats
    /// sharing an extension. Never fails; unreadable files probe false.
    fn can_process(&self, path: &Path) -> bool;

    /// Decode a file into a fresh document.
    fn decode(&self, path: &Path, options: DecodeOptions, progress: &ProgressToken)
        -> Result<JobDocument>;

    /// Encode a document to `path`.
    ///
    /// Implementations write through [`write_atomically`], so a failed or
    /// cancelled encode never replaces an existing file.
    fn encode(
        &self,
        document: &mut JobDocument,
        path: &Path,
        options: EncodeOptions,
        progress: &ProgressToken,
    ) -> Result<()>;

    /// Rewrite only the in-place-patchable regions (parameter header,
    /// per-layer metadata) of an existing file, leaving layer pixel
    /// payloads untouched.
    fn partial_save(&self, document: &JobDocument, path: &Path) -> Result<()>;

    /// The version written when the document's version is not in the
    /// allowed set: the last (newest) allowed one.
    fn default_version(&self) -> u32 {
        *self
            .allowed_versions()
            .last()
            .expect("codec declares at least one version")
    }

    /// Clamp a document's version into the allowed set.
    fn resolve_version(&self, version: u32) -> u32 {
        if self.allowed_versions().contains(&version) {
            version
        } else {
            if version != 0 {
                warn!(
                    version,
                    fallback = self.default_version(),
                    "version not allowed for format, falling back"
                );
            }
            self.default_version()
        }
    }
}

impl std::fmt::Debug for dyn FormatCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FormatCodec({:?})", self.format_type())
    }
}

/// Validate an explicitly requested file version against a codec's
/// declared set. Unlike the decode-time fallback, an out-of-set request
/// is fatal.
pub fn require_version(codec: &dyn FormatCodec, version: u32) -> Result<u32> {
    if codec.allowed_versions().contains(&version) {
        Ok(version)
    } else {
        Err(FormatError::UnsupportedVersion {
            version,
            allowed: codec.allowed_versions().to_vec(),
        }
        .into())
    }
}

/// Guard checks shared by every encode implementation.
pub fn check_full_document(document: &JobDocument, operation: &str) -> Result<()> {
    if document.is_partial() {
        return Err(FormatError::PartialDocument {
            operation: operation.to_string(),
        }
        .into());
    }
    Ok(())
}

/// Write a file through a temporary sibling and an atomic rename.
///
/// `produce` receives the temporary path. On success the temporary file
/// replaces `path`; on any error (including cancellation) the original
/// file is left untouched and the temporary file is removed.
pub fn write_atomically<F>(path: &Path, produce: F) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    let temp = temp_sibling(path);
    match produce(&temp) {
        Ok(()) => {
            fs::rename(&temp, path)?;
            Ok(())
        }
        Err(error) => {
            let _ = fs::remove_file(&temp);
            Err(error)
        }
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use resinkit_core::Error;

    #[test]
    fn test_atomic_write_success() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.bin");
        write_atomically(&target, |temp| {
            fs::write(temp, b"payload")?;
            Ok(())
        })
        .unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"payload");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_atomic_write_failure_keeps_original() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.bin");
        fs::write(&target, b"original").unwrap();
        let result = write_atomically(&target, |temp| {
            fs::write(temp, b"partial")?;
            Err(Error::other("encode exploded"))
        });
        assert!(result.is_err());
        assert_eq!(fs::read(&target).unwrap(), b"original");
        // the temporary was cleaned up
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
