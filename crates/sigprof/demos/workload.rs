//! Profiles a small synthetic workload: two summing loops of different cost
//! and a short sleeper. The report is written when the process exits.
//!
//! ```sh
//! cargo run --example workload -- -t cpu -i 0.005
//! cargo run --example workload -- -o profile.txt -u &
//! kill -USR1 $!
//! ```

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::Parser;
use sigprof::session::configuration::parse_interval_secs;
use sigprof::{Configuration, DumpSignal, Output, ReportFormat, Session, TimerTarget};

#[derive(Parser, Debug)]
#[command(name = "workload")]
#[command(about = "Run a synthetic workload under the sampling profiler", long_about = None)]
struct Cli {
    /// Save report to <OUTFILE> instead of stderr
    #[arg(short, long, value_name = "OUTFILE")]
    outfile: Option<PathBuf>,

    /// Write a report on SIGUSR1
    #[arg(short = 'u', long = "user1")]
    user1: bool,

    /// Write a report on SIGUSR2
    #[arg(short = 'U', long = "user2")]
    user2: bool,

    /// Timer interval in seconds
    #[arg(short, long, default_value_t = 0.01)]
    interval: f64,

    /// Timer type used (cpu, user or real)
    #[arg(short, long, default_value = "real")]
    timer: TimerTarget,

    /// Report format (text or json)
    #[arg(long, default_value = "text")]
    format: ReportFormat,

    /// Rounds of the workload to run
    #[arg(long, default_value_t = 1000)]
    iterations: usize,
}

#[inline(never)]
fn test1() -> u64 {
    (0..1000u64).map(std::hint::black_box).sum()
}

#[inline(never)]
fn test2() -> u64 {
    (0..10000u64).map(std::hint::black_box).sum()
}

#[inline(never)]
fn sleeper() {
    thread::sleep(Duration::from_millis(10));
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut dump_signals = vec![];
    if cli.user1 {
        dump_signals.push(DumpSignal::Usr1);
    }
    if cli.user2 {
        dump_signals.push(DumpSignal::Usr2);
    }

    let configuration = Configuration {
        timer: cli.timer,
        interval: parse_interval_secs(cli.interval)?,
        output: cli.outfile.map_or(Output::Stderr, Output::File),
        format: cli.format,
        dump_signals,
        report_at_exit: true,
        ..Configuration::default()
    };
    let mut session = Session::new(configuration)?;
    session.start()?;

    let mut total = 0u64;
    for _ in 0..cli.iterations {
        total = total.wrapping_add(test1());
        total = total.wrapping_add(test2());
        sleeper();
    }
    std::hint::black_box(total);

    session.stop();
    Ok(())
}
