//! payg-generate - print pay as you go codes for a key

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use clap::error::ErrorKind;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use payg::credit::codes::{calculate_code, format_code};
use payg::{Period, SharedKey};

/// Success.
const EXIT_OK: u8 = 0;
/// Error parsing command line options.
const EXIT_INVALID_OPTIONS: u8 = 1;
/// Command failed.
const EXIT_FAILED: u8 = 2;

/// Generate one or more pay as you go codes
#[derive(Parser)]
#[command(name = "payg-generate")]
#[command(version)]
struct Cli {
    /// Only print error messages
    #[arg(short, long)]
    quiet: bool,

    /// List the available periods
    #[arg(short, long)]
    list_periods: bool,

    /// File containing the shared key
    #[arg(value_name = "KEY-FILENAME", required_unless_present = "list_periods")]
    key_file: Option<PathBuf>,

    /// Period each code is worth, e.g. 1d (see --list-periods)
    #[arg(value_name = "PERIOD", required_unless_present = "list_periods")]
    period: Option<String>,

    /// Counter N or inclusive range A-B; all 256 codes if omitted
    #[arg(value_name = "COUNTER")]
    counter: Option<String>,
}

fn parse_counter_range(s: &str) -> Result<(u8, u8), String> {
    let parse = |part: &str| {
        part.parse::<u8>()
            .map_err(|e| format!("Invalid counter ‘{part}’: {e}"))
    };

    match s.split_once('-') {
        Some((first, last)) => {
            let (first, last) = (parse(first)?, parse(last)?);
            if first > last {
                return Err(format!("Invalid counter range ‘{s}’"));
            }
            Ok((first, last))
        }
        None => {
            let counter = parse(s)?;
            Ok((counter, counter))
        }
    }
}

fn list_periods(quiet: bool) {
    if !quiet {
        println!("Available periods:");
    }
    for period in Period::ALL {
        if quiet {
            println!("{period}");
        } else {
            println!(" • {period} — {}", period.description());
        }
    }
}

fn run(cli: Cli) -> u8 {
    let program = "payg-generate";

    if cli.list_periods {
        list_periods(cli.quiet);
        return EXIT_OK;
    }

    let (Some(key_file), Some(period)) = (cli.key_file, cli.period) else {
        eprintln!("{program}: A KEY-FILENAME and PERIOD are required");
        return EXIT_INVALID_OPTIONS;
    };

    let period: Period = match period.parse() {
        Ok(period) => period,
        Err(_) => {
            eprintln!("{program}: Invalid period ‘{period}’.");
            return EXIT_INVALID_OPTIONS;
        }
    };

    let key = match std::fs::read(&key_file) {
        Ok(key) => key,
        Err(e) => {
            eprintln!("{program}: Error opening {}: {e}", key_file.display());
            return EXIT_INVALID_OPTIONS;
        }
    };
    if let Ok(shared) = SharedKey::new(key.as_slice()) {
        debug!(key = ?shared, %period, "Generating codes");
    }

    let (first, last) = match cli.counter.as_deref().map(parse_counter_range) {
        None => (0, u8::MAX),
        Some(Ok(range)) => range,
        Some(Err(message)) => {
            eprintln!("{program}: {message}");
            return EXIT_INVALID_OPTIONS;
        }
    };

    for counter in first..=last {
        match calculate_code(period, counter, &key) {
            Ok(code) => println!("{}", format_code(code)),
            Err(e) => {
                eprintln!("{program}: {e}");
                return EXIT_FAILED;
            }
        }
    }

    EXIT_OK
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "payg=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::from(EXIT_OK);
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(EXIT_INVALID_OPTIONS);
        }
    };

    ExitCode::from(run(cli))
}
