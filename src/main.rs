//! CLI entry point (§4.7/§6.1): parses flags, initializes logging, and runs
//! the Fan-out Engine until a fatal error or process signal ends it.

use std::process::ExitCode;

use clap::Parser;
use n2k_aggregator::{Engine, EngineConfig, OutputMode, DEFAULT_PORT};
use tracing_subscriber::EnvFilter;

/// A single-process aggregation and fan-out server for decoded NMEA 2000
/// JSON records arriving on standard input.
#[derive(Parser, Debug)]
#[command(name = "n2kd", version, about)]
struct Cli {
    /// Verbose (debug) logging.
    #[arg(short = 'd', long = "debug", conflicts_with = "quiet")]
    debug: bool,

    /// Errors-only logging.
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,

    /// Copy client-written records to standard output and loop them back
    /// into the record parser as if they had arrived on standard input.
    #[arg(short = 'o', long = "output-copy", conflicts_with = "discard_output")]
    output_copy: bool,

    /// Discard client-written records instead of writing them to standard
    /// output.
    #[arg(short = 'r', long = "discard-output")]
    discard_output: bool,

    /// JSON port; the NMEA 0183 port is always this value plus one.
    #[arg(short = 'p', long = "port", default_value_t = DEFAULT_PORT)]
    port: u16,
}

impl Cli {
    fn output_mode(&self) -> OutputMode {
        if self.output_copy {
            OutputMode::Copy
        } else if self.discard_output {
            OutputMode::Sink
        } else {
            OutputMode::Stream
        }
    }

    fn log_directive(&self) -> &'static str {
        if self.debug {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            "info"
        }
    }
}

fn init_logging(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_directive()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    let config = EngineConfig {
        json_port: cli.port,
        output_mode: cli.output_mode(),
    };

    let mut engine = match Engine::new(config) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!(error = %e, "failed to start engine");
            return ExitCode::from(e.exit_code() as u8);
        }
    };

    if let Err(e) = engine.run() {
        tracing::error!(error = %e, "engine terminated");
        return ExitCode::from(e.exit_code() as u8);
    }

    ExitCode::SUCCESS
}
