use std::env;
use std::fs::File;
use std::io::BufReader;
use std::process::ExitCode;
use trace_event::TraceFile;

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();

    if args.len() != 2 {
        eprintln!("Usage: {} <trace.json>", args[0]);
        return ExitCode::from(2);
    }

    let path = &args[1];

    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening '{}': {}", path, e);
            return ExitCode::FAILURE;
        }
    };

    let trace = match TraceFile::parse(BufReader::new(file)) {
        Ok(trace) => trace,
        Err(e) => {
            eprintln!("Invalid trace file '{}': {}", path, e);
            return ExitCode::FAILURE;
        }
    };

    match trace.validate() {
        Ok(stats) => {
            println!("Valid trace: {}", path);
            println!("  Events: {}", trace.events.len());
            println!("  Metadata records: {}", stats.metadata);
            println!("  Intervals: {}", stats.intervals);
            println!("  Threads: {}", stats.threads);
            println!("  Max depth: {}", stats.max_depth);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Inconsistent trace '{}': {}", path, e);
            ExitCode::FAILURE
        }
    }
}
