//! batchfx CLI entrypoint.
//!
//! ```bash
//! batchfx run --input a.raw --input b.raw --out-pattern out_{i}.raw \
//!     --effect gain --strength 0.5 --width 64 --height 64
//! batchfx chain --input a.raw --input b.raw --out-pattern out_{i}.raw \
//!     --first passthru --second passthru --width 64 --height 64
//! batchfx formats --width 1920 --height 1080 --json
//! ```
//!
//! Inputs are headerless raw-frame files: frames of the configured geometry
//! concatenated back to back, one file per stream.  Every input file of one
//! invocation must share that geometry.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};

use batchfx_core::host::HostEngine;
use batchfx_core::image::{ComponentType, Layout, MemSpace, PixelFormat};
use batchfx_core::{Error, ImageDesc, Result};
use batchfx_pipeline::{
    BatchPipeline, ChainConfig, ChainedPipeline, EffectSetup, Frame, FrameGeometry, FrameSink,
    FrameSource, PipelineConfig, RunSummary,
};

#[derive(Parser, Debug)]
#[command(
    name = "batchfx",
    version,
    about = "Batched multi-stream effect runner",
    arg_required_else_help = true,
    after_help = "Examples:\n  batchfx run --input a.raw --input b.raw --out-pattern out_{i}.raw --effect gain --strength 0.5 --width 64 --height 64\n  batchfx formats --width 1920 --height 1080 --json"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one batched effect over N interleaved raw-frame streams.
    Run(RunArgs),
    /// Run two chained effects with a format conversion between them.
    Chain(ChainArgs),
    /// List supported pixel formats and per-frame byte sizes.
    Formats(FormatsArgs),
}

#[derive(Args, Debug, Clone)]
struct SharedStreamArgs {
    /// Input raw-frame file; repeat once per stream.
    #[arg(short = 'i', long = "input", required = true)]
    input: Vec<PathBuf>,

    /// Output path pattern; `{i}` is replaced with the stream index.
    #[arg(short = 'o', long = "out-pattern")]
    out_pattern: String,

    /// Frame width in pixels.
    #[arg(long = "width")]
    width: u32,

    /// Frame height in pixels.
    #[arg(long = "height")]
    height: u32,

    /// Frame pixel format.
    #[arg(long = "format", value_enum, default_value_t = FormatArg::Bgr)]
    format: FormatArg,

    /// Batch size to request from the effect (defaults to stream count).
    #[arg(short = 'b', long = "batch-size")]
    batch: Option<u32>,

    /// Emit a JSON run summary to stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    #[command(flatten)]
    shared: SharedStreamArgs,

    /// Effect selector.
    #[arg(short = 'e', long = "effect")]
    effect: String,

    /// Directory containing the effect's model files.
    #[arg(long = "model-dir")]
    model_dir: Option<String>,

    /// Effect strength in [0, 1].
    #[arg(long = "strength")]
    strength: Option<f32>,

    /// Effect-specific integer mode.
    #[arg(long = "mode")]
    mode: Option<u32>,

    /// Treat the effect as stateless (no per-stream recurrent state).
    #[arg(long = "stateless", default_value_t = false)]
    stateless: bool,

    /// Run the effect over normalized planar floats instead of the frame
    /// format.
    #[arg(long = "float-planar", default_value_t = false)]
    float_planar: bool,
}

#[derive(Args, Debug, Clone)]
struct ChainArgs {
    #[command(flatten)]
    shared: SharedStreamArgs,

    /// First effect selector (runs over planar floats).
    #[arg(long = "first")]
    first: String,

    /// Second effect selector (runs over chunky 8-bit RGBA).
    #[arg(long = "second")]
    second: String,

    /// Model directory for the first effect.
    #[arg(long = "first-model-dir")]
    first_model_dir: Option<String>,

    /// Model directory for the second effect.
    #[arg(long = "second-model-dir")]
    second_model_dir: Option<String>,

    /// First effect strength in [0, 1].
    #[arg(long = "first-strength")]
    first_strength: Option<f32>,

    /// Second effect strength in [0, 1].
    #[arg(long = "second-strength")]
    second_strength: Option<f32>,

    /// Allocate per-stream recurrent state for the first effect.
    #[arg(long = "stateful-first", default_value_t = false)]
    stateful_first: bool,
}

#[derive(Args, Debug, Clone)]
struct FormatsArgs {
    /// Frame width used for the size column.
    #[arg(long = "width", default_value_t = 1920)]
    width: u32,

    /// Frame height used for the size column.
    #[arg(long = "height", default_value_t = 1080)]
    height: u32,

    /// Emit the listing as JSON.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    #[value(name = "y")]
    Y,
    #[value(name = "bgr")]
    Bgr,
    #[value(name = "rgb")]
    Rgb,
    #[value(name = "bgra")]
    Bgra,
    #[value(name = "rgba")]
    Rgba,
}

impl FormatArg {
    fn pixel_format(self) -> PixelFormat {
        match self {
            FormatArg::Y => PixelFormat::Y,
            FormatArg::Bgr => PixelFormat::Bgr,
            FormatArg::Rgb => PixelFormat::Rgb,
            FormatArg::Bgra => PixelFormat::Bgra,
            FormatArg::Rgba => PixelFormat::Rgba,
        }
    }
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => run_effect(args),
        Commands::Chain(args) => run_chain(args),
        Commands::Formats(args) => run_formats(args),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            tracing::error!(error = %err, code = err.error_code(), "command failed");
            std::process::exit(err.error_code() as i32);
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

// ─── Raw-frame file I/O ──────────────────────────────────────────────────────

/// Reads fixed-size frames from a headerless raw file.
struct RawFileSource {
    reader: BufReader<File>,
    desc: ImageDesc,
    frame_bytes: usize,
    path: PathBuf,
}

impl RawFileSource {
    fn open(path: &Path, desc: ImageDesc) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::Read(format!("cannot open {}: {e}", path.display())))?;
        Ok(Self {
            reader: BufReader::new(file),
            desc,
            frame_bytes: desc.total_bytes()?,
            path: path.to_path_buf(),
        })
    }
}

impl FrameSource for RawFileSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut data = vec![0u8; self.frame_bytes];
        let mut filled = 0;
        while filled < self.frame_bytes {
            let n = self
                .reader
                .read(&mut data[filled..])
                .map_err(|e| Error::Read(format!("{}: {e}", self.path.display())))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        match filled {
            0 => Ok(None),
            n if n == self.frame_bytes => Ok(Some(Frame {
                desc: self.desc,
                data,
            })),
            n => Err(Error::Read(format!(
                "{}: trailing partial frame of {n} bytes (frame size is {})",
                self.path.display(),
                self.frame_bytes
            ))),
        }
    }
}

/// Appends frames to a headerless raw file.
struct RawFileSink {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl RawFileSink {
    fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .map_err(|e| Error::Write(format!("cannot create {}: {e}", path.display())))?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
        })
    }
}

impl FrameSink for RawFileSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.writer
            .write_all(&frame.data)
            .map_err(|e| Error::Write(format!("{}: {e}", self.path.display())))
    }
}

impl Drop for RawFileSink {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::warn!(path = %self.path.display(), error = %e, "flush on drop failed");
        }
    }
}

/// Cancellation flag raised by Ctrl-C.  The run loop observes it at the
/// next batch boundary, so the batch in flight completes and sinks flush.
fn cancel_flag() -> Arc<AtomicBool> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    if let Err(e) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    }) {
        tracing::warn!(error = %e, "no interrupt handler; run is uninterruptible");
    }
    cancel
}

fn output_path(pattern: &str, stream: usize) -> PathBuf {
    PathBuf::from(pattern.replace("{i}", &stream.to_string()))
}

fn open_streams(
    shared: &SharedStreamArgs,
    frame: &FrameGeometry,
) -> Result<(Vec<Box<dyn FrameSource>>, Vec<Box<dyn FrameSink>>)> {
    let desc = frame.host_desc()?;
    let mut sources: Vec<Box<dyn FrameSource>> = Vec::with_capacity(shared.input.len());
    let mut sinks: Vec<Box<dyn FrameSink>> = Vec::with_capacity(shared.input.len());
    for (i, path) in shared.input.iter().enumerate() {
        sources.push(Box::new(RawFileSource::open(path, desc)?));
        sinks.push(Box::new(RawFileSink::create(&output_path(
            &shared.out_pattern,
            i,
        ))?));
    }
    Ok((sources, sinks))
}

fn frame_geometry(shared: &SharedStreamArgs) -> FrameGeometry {
    FrameGeometry {
        width: shared.width,
        height: shared.height,
        format: shared.format.pixel_format(),
        component: ComponentType::U8,
        layout: Layout::Chunky,
    }
}

fn emit_summary(command: &str, streams: usize, summary: &RunSummary, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::json!({
                "command": command,
                "ok": true,
                "streams": streams,
                "batches": summary.batches,
                "frames": summary.frames,
                "cancelled": summary.cancelled,
            })
        );
    } else {
        println!(
            "{command}: ok streams={streams} batches={} frames={} cancelled={}",
            summary.batches, summary.frames, summary.cancelled
        );
    }
}

// ─── Commands ────────────────────────────────────────────────────────────────

fn run_effect(args: RunArgs) -> Result<()> {
    let num_streams = args.shared.input.len();
    let frame = frame_geometry(&args.shared);
    let float_planar = args.float_planar.then(|| {
        frame.with_format(frame.format, ComponentType::F32, Layout::Planar)
    });
    let cfg = PipelineConfig {
        effect: args.effect.clone(),
        model_dir: args.model_dir.clone(),
        batch_size: args.shared.batch.unwrap_or(num_streams as u32),
        strength: args.strength,
        mode: args.mode,
        frame,
        effect_frame: float_planar,
        stateful: !args.stateless,
        input_scale: if args.float_planar { 1.0 / 255.0 } else { 1.0 },
        output_scale: if args.float_planar { 255.0 } else { 1.0 },
    };

    let mut engine = HostEngine::new();
    let (mut sources, mut sinks) = open_streams(&args.shared, &cfg.frame)?;
    let mut pipeline = BatchPipeline::new(&mut engine, &cfg, num_streams)?;
    let cancel = cancel_flag();
    let run_result = pipeline.run(&mut engine, &mut sources, &mut sinks, &cancel);
    let shutdown_result = pipeline.shutdown(&mut engine);
    let summary = run_result?;
    shutdown_result?;

    emit_summary("run", num_streams, &summary, args.shared.json);
    Ok(())
}

fn run_chain(args: ChainArgs) -> Result<()> {
    let num_streams = args.shared.input.len();
    let frame = frame_geometry(&args.shared);
    let batch_size = args.shared.batch.unwrap_or(num_streams as u32);
    let cfg = ChainConfig {
        first: EffectSetup {
            selector: args.first.clone(),
            model_dir: args.first_model_dir.clone(),
            batch_size,
            strength: args.first_strength,
            mode: None,
        },
        second: EffectSetup {
            selector: args.second.clone(),
            model_dir: args.second_model_dir.clone(),
            batch_size,
            strength: args.second_strength,
            mode: None,
        },
        frame,
        first_frame: frame.with_format(frame.format, ComponentType::F32, Layout::Planar),
        second_frame: frame.with_format(PixelFormat::Rgba, ComponentType::U8, Layout::Chunky),
        batch_size,
        stateful_first: args.stateful_first,
        input_scale: 1.0 / 255.0,
        inter_scale: 255.0,
        output_scale: 1.0,
    };

    let mut engine = HostEngine::new();
    let (mut sources, mut sinks) = open_streams(&args.shared, &cfg.frame)?;
    let mut pipeline = ChainedPipeline::new(&mut engine, &cfg, num_streams)?;
    let cancel = cancel_flag();
    let run_result = pipeline.run(&mut engine, &mut sources, &mut sinks, &cancel);
    let shutdown_result = pipeline.shutdown(&mut engine);
    let summary = run_result?;
    shutdown_result?;

    emit_summary("chain", num_streams, &summary, args.shared.json);
    Ok(())
}

fn run_formats(args: FormatsArgs) -> Result<()> {
    let combos = [
        (PixelFormat::Y, ComponentType::U8, Layout::Chunky),
        (PixelFormat::A, ComponentType::U8, Layout::Chunky),
        (PixelFormat::Bgr, ComponentType::U8, Layout::Chunky),
        (PixelFormat::Rgb, ComponentType::U8, Layout::Chunky),
        (PixelFormat::Bgra, ComponentType::U8, Layout::Chunky),
        (PixelFormat::Rgba, ComponentType::U8, Layout::Chunky),
        (PixelFormat::Bgr, ComponentType::F32, Layout::Chunky),
        (PixelFormat::Bgr, ComponentType::F32, Layout::Planar),
        (PixelFormat::Rgb, ComponentType::F32, Layout::Planar),
        (PixelFormat::Yuv444, ComponentType::U8, Layout::Planar),
        (PixelFormat::Yuv422, ComponentType::U8, Layout::Planar),
        (PixelFormat::Yuv420, ComponentType::U8, Layout::Planar),
    ];

    let mut rows = Vec::new();
    for (format, component, layout) in combos {
        let desc = match ImageDesc::new(args.width, args.height, format, component, layout, MemSpace::Host, 1) {
            Ok(desc) => desc,
            // Geometry does not admit this format (e.g. odd width for 4:2:0).
            Err(_) => continue,
        };
        rows.push((format, component, layout, desc.total_bytes()?));
    }

    if args.json {
        let entries: Vec<_> = rows
            .iter()
            .map(|(f, c, l, bytes)| {
                serde_json::json!({
                    "format": format!("{f:?}"),
                    "component": format!("{c:?}"),
                    "layout": format!("{l:?}"),
                    "frame_bytes": bytes,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::json!({
                "command": "formats",
                "width": args.width,
                "height": args.height,
                "formats": entries,
            })
        );
    } else {
        println!("formats: {}x{}", args.width, args.height);
        for (f, c, l, bytes) in &rows {
            println!("format={f:?} component={c:?} layout={l:?} frame_bytes={bytes}");
        }
    }
    Ok(())
}
