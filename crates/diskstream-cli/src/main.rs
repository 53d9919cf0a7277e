//! diskstream CLI - convert virtual disk images between formats.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::debug;

use diskstream_core::convert::{CompressionLevel, Converter, ImageReader, ImageWriter};
use diskstream_core::qcow2::Qcow2Reader;
use diskstream_core::raw::{RawReader, RawWriter};
use diskstream_core::transport::{FileSink, FileSource};
use diskstream_core::vmdk::{VmdkStreamReader, VmdkStreamWriter};

/// Convert disk images between RAW, stream-optimized VMDK and QCOW2.
#[derive(Parser)]
#[command(name = "diskstream")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a disk image to another format.
    Convert {
        /// Source image path.
        src: PathBuf,

        /// Destination image path.
        dst: PathBuf,

        /// Source format.
        #[arg(long, value_enum)]
        src_fmt: SourceFormat,

        /// Destination format.
        #[arg(long, value_enum, default_value = "raw")]
        dst_fmt: DestFormat,

        /// Preallocate the destination file when the capacity is known.
        #[arg(long)]
        prealloc: bool,

        /// Compression level for VMDK output.
        #[arg(short, long, value_enum, default_value = "balanced")]
        compression: CompressionArg,

        /// Suppress progress output.
        #[arg(short, long)]
        quiet: bool,
    },

    /// Probe an image file and print its geometry.
    Info {
        /// Path to the image file.
        file: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SourceFormat {
    Raw,
    Vmdk,
    Qcow2,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DestFormat {
    Raw,
    Vmdk,
}

/// Compression level argument mapping.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CompressionArg {
    /// Fast compression (zlib level 1).
    Fast,
    /// Balanced compression (zlib level 6).
    Balanced,
    /// Maximum compression (zlib level 9).
    Max,
}

impl From<CompressionArg> for CompressionLevel {
    fn from(arg: CompressionArg) -> Self {
        match arg {
            CompressionArg::Fast => CompressionLevel::Fast,
            CompressionArg::Balanced => CompressionLevel::Balanced,
            CompressionArg::Max => CompressionLevel::Max,
        }
    }
}

fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Convert {
            src,
            dst,
            src_fmt,
            dst_fmt,
            prealloc,
            compression,
            quiet,
        } => run_convert(&src, &dst, src_fmt, dst_fmt, prealloc, compression.into(), quiet),
        Commands::Info { file } => show_info(&file),
    }
}

fn build_reader(path: &Path, format: SourceFormat) -> Result<Box<dyn ImageReader>> {
    let source = FileSource::open(path)
        .with_context(|| format!("failed to open source '{}'", path.display()))?;
    Ok(match format {
        SourceFormat::Raw => Box::new(RawReader::new(source)),
        SourceFormat::Vmdk => Box::new(VmdkStreamReader::new(source)),
        SourceFormat::Qcow2 => Box::new(Qcow2Reader::new(source)),
    })
}

fn build_writer(
    path: &Path,
    format: DestFormat,
    prealloc: bool,
    compression: CompressionLevel,
) -> Result<Box<dyn ImageWriter>> {
    let sink = FileSink::create(path)
        .with_context(|| format!("failed to create destination '{}'", path.display()))?;
    Ok(match format {
        DestFormat::Raw => Box::new(RawWriter::new(sink, prealloc)),
        DestFormat::Vmdk => {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "disk.vmdk".to_string());
            Box::new(VmdkStreamWriter::new(sink, file_name, compression))
        }
    })
}

fn run_convert(
    src: &Path,
    dst: &Path,
    src_fmt: SourceFormat,
    dst_fmt: DestFormat,
    prealloc: bool,
    compression: CompressionLevel,
    quiet: bool,
) -> Result<()> {
    let reader = build_reader(src, src_fmt)?;
    let writer = build_writer(dst, dst_fmt, prealloc, compression)?;

    if !quiet {
        println!(
            "Converting {} ({:?}) -> {} ({:?})",
            src.display(),
            src_fmt,
            dst.display(),
            dst_fmt
        );
    }

    let progress_bar = if quiet {
        None
    } else {
        let pb = ProgressBar::new(0);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})")?
            .progress_chars("#>-");
        pb.set_style(style);
        Some(pb)
    };

    let mut converter = Converter::new(reader, writer);
    if let Some(pb) = progress_bar.clone() {
        converter = converter.with_progress(Box::new(move |progress| {
            if pb.length() != Some(progress.capacity) {
                pb.set_length(progress.capacity);
            }
            pb.set_position(progress.written.min(progress.capacity));
        }));
    }

    let start = Instant::now();
    let summary = converter.run()?;
    let elapsed = start.elapsed();

    if let Some(pb) = progress_bar {
        pb.finish_and_clear();
    }
    debug!(?elapsed, "conversion finished");

    if !quiet {
        println!("Conversion successful");
        println!("Written:  {} ({} bytes)", format_bytes(summary.written), summary.written);
        println!(
            "Capacity: {} ({} bytes)",
            format_bytes(summary.capacity),
            summary.capacity
        );
        println!("Elapsed:  {:.2?}", elapsed);
    }
    Ok(())
}

fn show_info(file: &Path) -> Result<()> {
    let source = FileSource::open(file)
        .with_context(|| format!("failed to open '{}'", file.display()))?;

    // Sniff the magic: VMDK is little-endian "KDMV" at offset 0, QCOW2
    // is big-endian "QFI\xfb".
    let magic = {
        use diskstream_core::transport::ByteSource;
        let mut buf = [0u8; 4];
        let access = source.random_access().expect("files support random read");
        access
            .read_exact_at(0, &mut buf)
            .context("failed to read image magic")?;
        buf
    };

    println!("Image Information");
    println!("=================");
    println!("Path:     {}", file.display());

    if magic == *b"KDMV" {
        let mut reader = VmdkStreamReader::new(source);
        reader.open().context("failed to parse VMDK header")?;
        println!("Format:   streamOptimized VMDK");
        println!("Capacity: {}", format_bytes(reader.capacity_bytes()));
        println!("Grain:    {}", format_bytes(reader.block_bytes() as u64));
    } else if magic == [0x51, 0x46, 0x49, 0xFB] {
        let mut reader = Qcow2Reader::new(source);
        reader.open().context("failed to parse QCOW2 header")?;
        println!("Format:   QCOW2 v3");
        println!("Capacity: {}", format_bytes(reader.capacity_bytes()));
    } else {
        bail!("unrecognized image magic {:02X?}", magic);
    }
    Ok(())
}

/// Format bytes as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
