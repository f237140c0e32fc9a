//! RSGZ archive format
//!
//! The encrypted sibling of the RSZ archive: same ZIP container, same
//! preview and layer PNG entries, but the G-Code program is stored as a
//! record stream in `run.gcode.enc` instead of plaintext. Command lines
//! are RSA-encrypted in fixed 64-byte blocks; comment and blank lines
//! (which carry the `;key:value` metadata the decoder needs) pass through
//! as length-framed plaintext records.
//!
//! The absence of the plain `run.gcode` entry is what routes a file here
//! when both formats share an extension.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use tracing::info;
use zip::write::SimpleFileOptions;
use zip::ZipArchive;

use resinkit_core::error::{FormatError, IntegrityError, Result};
use resinkit_core::params::Capabilities;
use resinkit_core::pipeline::ProgressToken;
use resinkit_core::JobDocument;

use crate::codec::{DecodeOptions, EncodeOptions, FormatCodec};
use crate::crypto::{decrypt_gcode_line, encrypt_gcode_line, RSA_BLOCK_LEN};
use crate::registry::FormatType;

use super::rsz;

/// The encrypted program entry; its presence identifies this format.
pub const GCODE_ENTRY: &str = "run.gcode.enc";

/// Record kind: plaintext comment/blank line.
const RECORD_PLAIN: u8 = 0;
/// Record kind: one RSA-encrypted command line.
const RECORD_CIPHER: u8 = 1;

const ALLOWED_VERSIONS: &[u32] = &[1];

/// Codec for the RSA-encrypted ZIP+G-Code archive format.
pub struct RsgzCodec;

/// Serialize a program into the encrypted record stream.
pub(crate) fn encrypt_program(text: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for (number, line) in text.lines().enumerate() {
        if line.is_empty() || line.starts_with(';') {
            out.push(RECORD_PLAIN);
            out.extend_from_slice(&(line.len() as u32).to_le_bytes());
            out.extend_from_slice(line.as_bytes());
        } else {
            let block = encrypt_gcode_line(line, number + 1)?;
            out.push(RECORD_CIPHER);
            out.extend_from_slice(&(RSA_BLOCK_LEN as u32).to_le_bytes());
            out.extend_from_slice(&block);
        }
    }
    Ok(out)
}

/// Reassemble the program text from the encrypted record stream.
pub(crate) fn decrypt_program(data: &[u8]) -> Result<String> {
    let mut lines: Vec<String> = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        if pos + 5 > data.len() {
            return Err(IntegrityError::InvalidBlock {
                reason: "truncated record header in encrypted program".to_string(),
            }
            .into());
        }
        let kind = data[pos];
        let len = u32::from_le_bytes([data[pos + 1], data[pos + 2], data[pos + 3], data[pos + 4]])
            as usize;
        pos += 5;
        if pos + len > data.len() {
            return Err(IntegrityError::InvalidBlock {
                reason: "truncated record payload in encrypted program".to_string(),
            }
            .into());
        }
        let payload = &data[pos..pos + len];
        pos += len;
        match kind {
            RECORD_PLAIN => {
                lines.push(String::from_utf8_lossy(payload).into_owned());
            }
            RECORD_CIPHER => {
                lines.push(decrypt_gcode_line(payload)?);
            }
            other => {
                return Err(IntegrityError::InvalidBlock {
                    reason: format!("unknown record kind {other} in encrypted program"),
                }
                .into());
            }
        }
    }
    let mut text = lines.join("\n");
    text.push('\n');
    Ok(text)
}

impl FormatCodec for RsgzCodec {
    fn format_type(&self) -> FormatType {
        FormatType::Rsgz
    }

    fn capabilities(&self) -> &'static Capabilities {
        // The encrypted archive shares the plain archive's capability set.
        &rsz::CAPABILITIES
    }

    fn allowed_versions(&self) -> &'static [u32] {
        ALLOWED_VERSIONS
    }

    fn can_process(&self, path: &Path) -> bool {
        let Ok(file) = File::open(path) else {
            return false;
        };
        let Ok(mut archive) = ZipArchive::new(file) else {
            return false;
        };
        let found = archive.by_name(GCODE_ENTRY).is_ok();
        found
    }

    fn decode(
        &self,
        path: &Path,
        options: DecodeOptions,
        progress: &ProgressToken,
    ) -> Result<JobDocument> {
        let doc = rsz::decode_archive(*self.capabilities(), path, options, progress, |archive| {
            let bytes = rsz::zip_entry_bytes(archive, GCODE_ENTRY)?;
            decrypt_program(&bytes)
        })?;
        info!(layers = doc.layer_count(), "decoded rsgz archive");
        Ok(doc)
    }

    fn encode(
        &self,
        document: &mut JobDocument,
        path: &Path,
        options: EncodeOptions,
        progress: &ProgressToken,
    ) -> Result<()> {
        rsz::encode_archive(document, path, options, progress, |writer, text| {
            let records = encrypt_program(text)?;
            writer
                .start_file(GCODE_ENTRY, SimpleFileOptions::default())
                .map_err(rsz::zip_error)?;
            writer.write_all(&records)?;
            Ok(())
        })?;
        info!(layers = document.layer_count(), path = %path.display(), "encoded rsgz archive");
        Ok(())
    }

    fn partial_save(&self, document: &JobDocument, path: &Path) -> Result<()> {
        if document.pixels_dirty() {
            return Err(FormatError::PartialSaveInvalidated.into());
        }
        let mut document = document.clone();
        let text = rsz::current_gcode(&mut document);
        let records = encrypt_program(&text)?;
        let source = File::open(path)?;
        let mut archive = ZipArchive::new(source).map_err(rsz::zip_error)?;
        crate::codec::write_atomically(path, |temp| {
            let mut writer = zip::ZipWriter::new(File::create(temp)?);
            writer
                .start_file(GCODE_ENTRY, SimpleFileOptions::default())
                .map_err(rsz::zip_error)?;
            writer.write_all(&records)?;
            for index in 0..archive.len() {
                let entry = archive.by_index_raw(index).map_err(rsz::zip_error)?;
                if entry.name() == GCODE_ENTRY {
                    continue;
                }
                writer.raw_copy_file(entry).map_err(rsz::zip_error)?;
            }
            writer.finish().map_err(rsz::zip_error)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_record_round_trip() {
        let text = ";machineName:secure\n;layerCount:0\nG21\nG90\nM106 S0\n;END_GCODE\n";
        let records = encrypt_program(text).unwrap();
        let restored = decrypt_program(&records).unwrap();
        assert_eq!(restored, text);
    }

    #[test]
    fn test_command_lines_are_not_plaintext() {
        let text = "G1 Z5.000 F60\n";
        let records = encrypt_program(text).unwrap();
        assert_eq!(records[0], RECORD_CIPHER);
        let window: Vec<u8> = records.to_vec();
        assert!(!window
            .windows(text.trim().len())
            .any(|w| w == text.trim().as_bytes()));
    }

    #[test]
    fn test_comment_lines_stay_readable() {
        let text = ";exposureTime:7.00\n";
        let records = encrypt_program(text).unwrap();
        assert_eq!(records[0], RECORD_PLAIN);
        assert!(records
            .windows(text.trim().len())
            .any(|w| w == text.trim().as_bytes()));
    }

    #[test]
    fn test_truncated_stream_rejected() {
        let text = "G1 Z5.0 F60\n";
        let mut records = encrypt_program(text).unwrap();
        records.truncate(records.len() - 1);
        assert!(decrypt_program(&records).is_err());
    }
}
