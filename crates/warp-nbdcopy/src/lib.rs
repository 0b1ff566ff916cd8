//! warp-nbdcopy library exports
//!
//! Argument parsing and the copy driver live here so they can be tested
//! without spawning the binary.

use std::io;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use warp_nbd::{Copier, CopyConfig, CopyReport, Handle, HandleConfig};

/// Destination argument meaning standard output
pub const STDOUT: &str = "-";

#[derive(Parser, Debug)]
#[command(name = "warp-nbdcopy")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Source URI (nbd://host[:port]/export or nbd+unix:///export?socket=PATH)
    pub source: String,

    /// Destination URI, or `-` for standard output
    pub destination: String,

    /// Bytes per read request
    #[arg(long, default_value_t = 256 * 1024, value_parser = clap::value_parser!(u32).range(1..))]
    pub request_size: u32,

    /// Maximum reads in flight
    #[arg(long, default_value_t = 16, value_parser = parse_requests)]
    pub requests: usize,

    /// Skip the final flush on the destination
    #[arg(long)]
    pub no_flush: bool,
}

fn parse_requests(value: &str) -> std::result::Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

impl Cli {
    /// Copy settings selected by the flags
    pub fn copy_config(&self) -> CopyConfig {
        let config = CopyConfig::new()
            .request_size(self.request_size)
            .max_in_flight(self.requests);
        if self.no_flush {
            config.no_flush()
        } else {
            config
        }
    }

    /// Default log level for the `-v` count, used when `RUST_LOG` is unset
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }

    /// Whether the copy goes to standard output
    pub fn to_stdout(&self) -> bool {
        self.destination == STDOUT
    }
}

fn open(uri: &str, name: &str) -> Result<Handle> {
    let mut handle = Handle::new(HandleConfig::new().name(name));
    handle
        .connect_uri(uri)
        .with_context(|| format!("failed to connect to {}", uri))?;
    Ok(handle)
}

/// Open both ends, run the copy and shut the connections down
pub fn run(cli: &Cli) -> Result<CopyReport> {
    if cli.source == STDOUT {
        bail!("source must be an NBD URI");
    }
    let copier = Copier::new(cli.copy_config());
    let mut src = open(&cli.source, "src")?;

    let report = if cli.to_stdout() {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        copier
            .copy_to_writer(&mut src, &mut out)
            .context("copy to standard output failed")?
    } else {
        let mut dst = open(&cli.destination, "dst")?;
        let report = copier
            .copy_to_handle(&mut src, &mut dst)
            .with_context(|| format!("copy to {} failed", cli.destination))?;
        dst.shutdown().context("destination shutdown failed")?;
        report
    };
    src.shutdown().context("source shutdown failed")?;

    info!(
        bytes = report.bytes_written,
        requests = report.requests,
        reordered = report.reordered_completions,
        "copy complete"
    );
    Ok(report)
}
