//! Convert Linux `perf script` output to a Chrome trace timeline.
//!
//! # Usage
//!
//! ```bash
//! perf record -g -o perf.data -- ./myapp
//! perf script -i perf.data | perf_to_trace -o trace.json
//! perf_to_trace perf.txt.zst -o trace.json.gz --idle-gap-ms 50
//! ```
//!
//! Open the result in <https://ui.perfetto.dev> or `chrome://tracing`.
//!
//! Ctrl-C stops at the next sample and still writes a complete trace. While
//! blocked on input that has gone quiet (an idle pipe) that takes effect only
//! once more input arrives; a second Ctrl-C exits immediately.

use clap::Parser;
use env_logger::Env;
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use perftrace::pipeline::DEFAULT_IDLE_GAP_NS;
use perftrace::{Converter, ConverterConfig, Summary};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Conventional status for a process stopped by SIGINT.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "perf_to_trace")]
#[command(about = "Convert perf script output to a Chrome trace timeline")]
#[command(version)]
struct Args {
    /// Input file from `perf script` (`-` or omitted for stdin; .gz and .zst are decompressed)
    input: Option<PathBuf>,

    /// Output trace file (defaults to stdout; .gz is compressed)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Close a thread's spans after this many milliseconds without a sample (0 disables)
    #[arg(long, value_name = "MS", default_value_t = DEFAULT_IDLE_GAP_NS / 1_000_000)]
    idle_gap_ms: u64,

    /// Start the timeline at zero instead of the capture's clock
    #[arg(long)]
    relative_time: bool,

    /// Print the run summary as JSON on stderr
    #[arg(long)]
    summary_json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn config(&self) -> ConverterConfig {
        ConverterConfig {
            idle_gap_ns: match self.idle_gap_ms {
                0 => None,
                ms => Some(ms.saturating_mul(1_000_000)),
            },
            relative_time: self.relative_time,
        }
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

fn open_input(path: Option<&Path>) -> io::Result<Box<dyn BufRead>> {
    let path = match path {
        None => return Ok(Box::new(BufReader::new(io::stdin()))),
        Some(p) if p == Path::new("-") => return Ok(Box::new(BufReader::new(io::stdin()))),
        Some(p) => p,
    };

    let file = File::open(path).map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("failed to open input file '{}': {e}", path.display()),
        )
    })?;

    if has_extension(path, "gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else if has_extension(path, "zst") {
        Ok(Box::new(BufReader::new(zstd::Decoder::new(file)?)))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Where the trace goes.
enum Sink {
    Stdout(BufWriter<io::Stdout>),
    File(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Sink {
    fn create(path: Option<&Path>) -> io::Result<Self> {
        let Some(path) = path else {
            return Ok(Sink::Stdout(BufWriter::new(io::stdout())));
        };

        let file = File::create(path).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("failed to create output file '{}': {e}", path.display()),
            )
        })?;
        let writer = BufWriter::new(file);

        if has_extension(path, "gz") {
            Ok(Sink::Gzip(GzEncoder::new(writer, Compression::default())))
        } else {
            Ok(Sink::File(writer))
        }
    }

    /// Flush buffers and write any compression trailer.
    fn finish(self) -> io::Result<()> {
        match self {
            Sink::Stdout(mut w) => w.flush(),
            Sink::File(mut w) => w.flush(),
            Sink::Gzip(encoder) => encoder.finish()?.flush(),
        }
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Stdout(w) => w.write(buf),
            Sink::File(w) => w.write(buf),
            Sink::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Stdout(w) => w.flush(),
            Sink::File(w) => w.flush(),
            Sink::Gzip(w) => w.flush(),
        }
    }
}

fn report(summary: &Summary) {
    let d = &summary.diagnostics;
    if !d.is_clean() {
        log::warn!(
            "dropped {} records ({} malformed, {} empty, {} out of order)",
            d.total_dropped(),
            d.malformed_records,
            d.empty_samples,
            d.out_of_order_samples
        );
    }
    log::info!(
        "{} samples -> {} spans on {} threads",
        summary.samples,
        summary.spans,
        summary.threads
    );
}

/// Record a Ctrl-C. Returns true when a stop was already pending.
fn request_stop(stop: &AtomicBool) -> bool {
    stop.swap(true, Ordering::SeqCst)
}

fn run(args: Args) -> Result<Summary, Box<dyn std::error::Error>> {
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            if request_stop(&stop) {
                std::process::exit(i32::from(EXIT_INTERRUPTED));
            }
        })
        .map_err(|e| format!("failed to install Ctrl+C handler: {e}"))?;
    }

    let input = open_input(args.input.as_deref())?;
    let mut sink = Sink::create(args.output.as_deref())?;

    let summary = Converter::new(args.config())
        .with_stop_flag(stop)
        .convert(input, &mut sink)?;
    sink.finish()?;

    report(&summary);
    if args.summary_json {
        eprintln!("{}", serde_json::to_string(&summary)?);
    }

    if let Some(output) = &args.output {
        log::info!("wrote '{}'", output.display());
    }

    Ok(summary)
}

fn main() -> ExitCode {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    match run(args) {
        Ok(summary) if summary.interrupted => ExitCode::from(EXIT_INTERRUPTED),
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
