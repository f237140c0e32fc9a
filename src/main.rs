use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use resinkit::{
    codec_for, convert_document, decode_file, init_logging, DecodeOptions, EncodeOptions,
    FormatType, ProgressToken,
};

/// Read, inspect and convert masked-SLA resin printer job files.
#[derive(Parser)]
#[command(name = "resinkit", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a file's global parameters as JSON
    Inspect {
        /// The job file to inspect
        file: PathBuf,
        /// Skip layer payloads and read metadata only
        #[arg(long)]
        partial: bool,
    },
    /// Convert a job file into another format
    Convert {
        /// The source job file
        input: PathBuf,
        /// The destination path; its extension picks the target format
        /// unless --format is given
        output: PathBuf,
        /// Target format name (rsz, rsgz, cxdlp, phz)
        #[arg(long)]
        format: Option<String>,
        /// Target file version; must be in the format's allowed set
        #[arg(long)]
        file_version: Option<u32>,
        /// Stream-cipher seed for formats with payload encryption
        #[arg(long, default_value_t = 0)]
        seed: u32,
        /// Worker thread budget (0 = all cores)
        #[arg(long, default_value_t = 0)]
        workers: usize,
    },
    /// Extract every layer of a job file as PNG images
    Extract {
        /// The job file to extract
        file: PathBuf,
        /// Output directory for the layer images
        dir: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    init_logging()?;
    let cli = Cli::parse();
    let progress = ProgressToken::new();

    match cli.command {
        Command::Inspect { file, partial } => {
            let options = DecodeOptions {
                partial,
                ..DecodeOptions::default()
            };
            let doc = decode_file(&file, options, &progress)
                .with_context(|| format!("decoding {}", file.display()))?;
            println!("{}", serde_json::to_string_pretty(&doc.summary())?);
        }
        Command::Convert {
            input,
            output,
            format,
            file_version,
            seed,
            workers,
        } => {
            let target = match format {
                Some(name) => FormatType::from_name(&name)
                    .with_context(|| format!("unknown format '{name}'"))?,
                None => {
                    let extension = output
                        .extension()
                        .and_then(|e| e.to_str())
                        .unwrap_or_default();
                    FormatType::from_name(extension)
                        .with_context(|| format!("no format for extension '{extension}'"))?
                }
            };
            let options = DecodeOptions {
                max_workers: workers,
                ..DecodeOptions::default()
            };
            let mut doc = decode_file(&input, options, &progress)
                .with_context(|| format!("decoding {}", input.display()))?;
            if let Some(version) = file_version {
                doc.version = resinkit_formats::require_version(codec_for(target), version)?;
            }
            let encode_options = EncodeOptions {
                max_workers: workers,
                encryption_seed: seed,
            };
            convert_document(&doc, target, &output, encode_options, &progress)
                .with_context(|| format!("converting to {}", output.display()))?;
            println!("wrote {}", output.display());
        }
        Command::Extract { file, dir } => {
            let doc = decode_file(&file, DecodeOptions::default(), &progress)
                .with_context(|| format!("decoding {}", file.display()))?;
            std::fs::create_dir_all(&dir)?;
            for layer in doc.layers() {
                let Some(raster) = layer.raster() else {
                    bail!("layer {} has no decoded raster", layer.index());
                };
                let image = image::GrayImage::from_raw(
                    raster.width(),
                    raster.height(),
                    raster.pixels().to_vec(),
                )
                .context("raster buffer does not match its dimensions")?;
                image.save(dir.join(format!("layer_{:05}.png", layer.index())))?;
            }
            println!("extracted {} layers to {}", doc.layer_count(), dir.display());
        }
    }

    Ok(())
}
