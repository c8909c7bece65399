use std::path::PathBuf;

use clap::{Parser, ValueHint};

use crate::downtime::{ALL, FACTORY, parse_time};

// Common CLI options
#[derive(Parser)]
pub struct CommonOpts {
    /// Enables more detailed log output
    #[arg(
        long,
        env = "GWMS_DEBUG",
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub debug: bool,

    /// Appends log output to this file instead of stderr
    #[arg(
        long,
        value_hint = ValueHint::FilePath,
        env = "GWMS_LOG_FILE",
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub log_file: Option<PathBuf>,
}

// Root CLI options
#[derive(Parser)]
#[command(
    author,
    about,
    version(crate::GWMS_VERSION),
    disable_help_subcommand(true),
    help_expected(true)
)]
pub struct RootOptions {
    #[clap(flatten)]
    pub common: CommonOpts,

    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Parser)]
pub enum SubCommand {
    /// Controls a Frontend
    Frontend(FrontendOpts),
    /// Controls a Factory
    Factory(FactoryOpts),
    /// Manages the downtime windows of a Factory
    Downtime(DowntimeOpts),
    /// Generates the Entry key pair and a signing secret
    Keygen(KeygenOpts),
}

#[derive(Parser)]
pub struct WorkDirArg {
    /// Working directory with the configuration and the pid file
    #[arg(value_hint = ValueHint::DirPath)]
    pub workdir: PathBuf,
}

#[derive(Parser)]
pub struct FrontendOpts {
    #[clap(subcommand)]
    pub subcmd: FrontendCommand,
}

#[derive(Parser)]
pub enum FrontendCommand {
    /// Runs the Frontend loop in the foreground
    Start(FrontendStartOpts),
    /// Stops a running Frontend
    Stop(WorkDirArg),
    /// Validates the configuration and makes a running Frontend reload it
    Reconfig(WorkDirArg),
}

#[derive(Parser)]
pub struct FrontendStartOpts {
    #[clap(flatten)]
    pub workdir: WorkDirArg,

    /// Runs only this group
    #[arg(long)]
    pub group: Option<String>,
}

#[derive(Parser)]
pub struct FactoryOpts {
    #[clap(subcommand)]
    pub subcmd: FactoryCommand,
}

#[derive(Parser)]
pub enum FactoryCommand {
    /// Runs the Factory loop in the foreground
    Start(WorkDirArg),
    /// Stops a running Factory
    Stop(FactoryStopOpts),
    /// Validates the configuration and makes a running Factory reload it
    Reconfig(WorkDirArg),
}

#[derive(Parser)]
pub struct FactoryStopOpts {
    #[clap(flatten)]
    pub workdir: WorkDirArg,

    /// Kills the process instead of letting it withdraw its ads
    #[arg(long)]
    pub force: bool,
}

#[derive(Parser)]
pub struct DowntimeOpts {
    #[clap(subcommand)]
    pub subcmd: DowntimeCommand,
}

#[derive(Parser)]
pub enum DowntimeCommand {
    /// Adds a downtime window
    Add(DowntimeArgs),
    /// Ends the matching windows at `--start`
    Remove(DowntimeArgs),
    /// Prints whether a downtime is active at `--start`
    Check(DowntimeArgs),
}

#[derive(Parser)]
pub struct DowntimeArgs {
    /// Downtime file of the Factory
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub file: PathBuf,

    /// Start of the window (RFC-3339), now if omitted
    #[arg(long, value_parser = parse_time)]
    pub start: Option<i64>,

    /// End of the window (RFC-3339) or `None` for an open-ended window
    #[arg(long, value_parser = parse_end)]
    pub end: Option<EndTime>,

    /// Entry name, `factory` for the whole Factory or `all` for every Entry
    #[arg(long, default_value = FACTORY, value_parser = parse_selector)]
    pub entry: String,

    /// Frontend name or `all`
    #[arg(long, default_value = ALL, value_parser = parse_selector)]
    pub frontend: String,

    /// Security class or `all`
    #[arg(long, default_value = ALL, value_parser = parse_selector)]
    pub security_class: String,

    /// Comment stored with the window
    #[arg(long)]
    pub comment: Option<String>,
}

/// `--end` value: a time or an explicitly open window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndTime {
    At(i64),
    Open,
}

impl EndTime {
    pub fn epoch(self) -> Option<i64> {
        match self {
            EndTime::At(time) => Some(time),
            EndTime::Open => None,
        }
    }
}

fn parse_end(value: &str) -> crate::Result<EndTime> {
    if value.eq_ignore_ascii_case("none") {
        Ok(EndTime::Open)
    } else {
        parse_time(value).map(EndTime::At)
    }
}

/// Normalizes the `all` wildcard.
fn parse_selector(value: &str) -> Result<String, String> {
    if value.is_empty() || value.contains(char::is_whitespace) {
        return Err(format!("`{value}` is not a valid name"));
    }
    if value.eq_ignore_ascii_case(ALL) {
        Ok(ALL.to_string())
    } else {
        Ok(value.to_string())
    }
}

#[derive(Parser)]
pub struct KeygenOpts {
    #[clap(flatten)]
    pub workdir: WorkDirArg,

    /// Size of the RSA key in bits
    #[arg(long, default_value_t = 2048)]
    pub bits: usize,

    /// Id of the signing secret
    #[arg(long, default_value = "main-key")]
    pub key_id: String,

    /// Replaces existing key files
    #[arg(long)]
    pub overwrite: bool,
}
