use std::future::Future;
use std::io::ErrorKind;
use std::path::Path;
use std::rc::Rc;

use anyhow::{Context, bail};
use clap::{CommandFactory, FromArgMatches};
use colored::Colorize;
use nix::sys::signal::Signal;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tokio::task::LocalSet;

use glideinwms::classad::CondorTransport;
use glideinwms::common::cli::{
    CommonOpts, DowntimeArgs, DowntimeCommand, DowntimeOpts, FactoryCommand, FactoryOpts,
    FactoryStopOpts, FrontendCommand, FrontendOpts, FrontendStartOpts, KeygenOpts, RootOptions,
    SubCommand, WorkDirArg,
};
use glideinwms::common::config::load_config;
use glideinwms::common::setup::setup_logging;
use glideinwms::common::utils::fs::create_private_file;
use glideinwms::common::utils::time::now_epoch;
use glideinwms::common::workdir::WorkDir;
use glideinwms::crypto::{EntryKeyPair, SigningKey};
use glideinwms::downtime::{ALL, DowntimeFile, DowntimePeriod, format_time};
use glideinwms::factory::{FactoryConfig, FactoryOptions, FactorySnapshot, create_factory_service};
use glideinwms::frontend::{
    FrontendConfig, FrontendOptions, FrontendSnapshot, create_frontend_service,
};
use glideinwms::stats::{FanOutSink, JsonLinesSink, LogStatsSink, StatsSink};
use glideinwms::submit::CondorSubmitBackend;

const ENTRY_KEY_FILE: &str = "entry_key.pem";
const SUBMIT_DIR: &str = "submit";

/// How a successful command ends.
enum Outcome {
    Done,
    /// Nothing to act on, e.g. the process is not running.
    Soft,
}

impl Outcome {
    fn exit_code(&self) -> i32 {
        match self {
            Outcome::Done => 0,
            Outcome::Soft => 2,
        }
    }
}

/// Forwards SIGINT, SIGTERM and SIGHUP to the control loop.
struct SignalThread {
    signal_thread: Option<std::thread::JoinHandle<()>>,
    signal_handle: signal_hook::iterator::Handle,
}

impl SignalThread {
    fn new(sender: UnboundedSender<i32>) -> anyhow::Result<Self> {
        let mut signals =
            Signals::new([SIGINT, SIGTERM, SIGHUP]).context("Cannot create signal set")?;
        let signal_handle = signals.handle();
        let signal_thread = std::thread::spawn(move || {
            for signal in &mut signals {
                log::debug!("Received signal {signal}");
                if sender.send(signal).is_err() {
                    break;
                }
            }
        });
        Ok(Self {
            signal_handle,
            signal_thread: Some(signal_thread),
        })
    }
}

impl Drop for SignalThread {
    fn drop(&mut self) {
        self.signal_handle.close();
        if let Some(thread) = self.signal_thread.take() {
            if thread.join().is_err() {
                log::error!("Signal thread crashed");
            }
        }
    }
}

/// Runs a control loop until it ends. SIGHUP reloads the configuration, SIGINT and SIGTERM
/// let the loop withdraw its ads and stop.
async fn run_until_stopped<R>(
    process: impl Future<Output = ()>,
    reconfigure: impl Fn() -> R,
    stop: impl Fn(),
) -> anyhow::Result<Outcome>
where
    R: Future<Output = glideinwms::Result<()>> + 'static,
{
    let (sender, mut receiver) = unbounded_channel();
    let _signal_thread = SignalThread::new(sender)?;
    let local = LocalSet::new();
    local
        .run_until(async move {
            let mut process = std::pin::pin!(process);
            loop {
                tokio::select! {
                    _ = &mut process => break,
                    Some(signal) = receiver.recv() => {
                        if signal == SIGHUP {
                            let response = reconfigure();
                            tokio::task::spawn_local(async move {
                                match response.await {
                                    Ok(()) => log::info!("Configuration reloaded"),
                                    Err(error) => log::error!("Reconfiguration failed: {error}"),
                                }
                            });
                        } else {
                            log::info!("Stop requested");
                            stop();
                        }
                    }
                }
            }
        })
        .await;
    Ok(Outcome::Done)
}

fn open_workdir(arg: &WorkDirArg) -> anyhow::Result<WorkDir> {
    WorkDir::open(&arg.workdir)
        .with_context(|| format!("Cannot open working directory {}", arg.workdir.display()))
}

fn stats_sink(workdir: &WorkDir) -> anyhow::Result<Rc<dyn StatsSink>> {
    let path = workdir.stats_file();
    let file = JsonLinesSink::create_or_append(&path)
        .with_context(|| format!("Cannot open stats file {}", path.display()))?;
    Ok(Rc::new(FanOutSink::new(vec![
        Box::new(LogStatsSink),
        Box::new(file),
    ])))
}

fn send_signal(workdir: &WorkDir, signal: Signal) -> anyhow::Result<Outcome> {
    if workdir.signal_process(signal)? {
        Ok(Outcome::Done)
    } else {
        log::warn!("No process is running in {}", workdir.directory().display());
        Ok(Outcome::Soft)
    }
}

// Commands

async fn command_frontend_start(opts: FrontendStartOpts) -> anyhow::Result<Outcome> {
    let workdir = open_workdir(&opts.workdir)?;
    let Some(_pid_file) = workdir.acquire_pid_file()? else {
        return Ok(Outcome::Soft);
    };
    log::info!("Starting Frontend {}", glideinwms::GWMS_VERSION);
    let config: FrontendConfig = load_config(&workdir.frontend_config())?;
    let (service, process) = create_frontend_service(FrontendOptions {
        transport: Rc::new(CondorTransport::new(config.query_timeout)),
        stats: stats_sink(&workdir)?,
        only_group: opts.group,
        workdir,
    })?;
    run_until_stopped(process, || service.reconfigure(), || service.stop()).await
}

fn command_frontend_reconfig(opts: WorkDirArg) -> anyhow::Result<Outcome> {
    let workdir = open_workdir(&opts)?;
    let config: FrontendConfig = load_config(&workdir.frontend_config())?;
    FrontendSnapshot::load(&workdir, config, None)?;
    send_signal(&workdir, Signal::SIGHUP)
}

async fn command_factory_start(opts: WorkDirArg) -> anyhow::Result<Outcome> {
    let workdir = open_workdir(&opts)?;
    let Some(_pid_file) = workdir.acquire_pid_file()? else {
        return Ok(Outcome::Soft);
    };
    log::info!("Starting Factory {}", glideinwms::GWMS_VERSION);
    let config: FactoryConfig = load_config(&workdir.factory_config())?;
    let backend = CondorSubmitBackend::new(
        workdir.resolve(&config.pilot_executable),
        workdir.state_dir().join(SUBMIT_DIR),
        config.submit_timeout,
    );
    let (service, process) = create_factory_service(FactoryOptions {
        transport: Rc::new(CondorTransport::new(config.query_timeout)),
        backend: Rc::new(backend),
        stats: stats_sink(&workdir)?,
        workdir,
    })?;
    run_until_stopped(process, || service.reconfigure(), || service.stop()).await
}

fn command_factory_stop(opts: FactoryStopOpts) -> anyhow::Result<Outcome> {
    let workdir = open_workdir(&opts.workdir)?;
    if !opts.force {
        return send_signal(&workdir, Signal::SIGTERM);
    }
    let outcome = send_signal(&workdir, Signal::SIGKILL)?;
    // A killed process cannot clean up after itself
    if let Outcome::Done = outcome {
        match std::fs::remove_file(workdir.pid_file()) {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => log::warn!("Cannot remove pid file: {error}"),
        }
    }
    Ok(outcome)
}

fn command_factory_reconfig(opts: WorkDirArg) -> anyhow::Result<Outcome> {
    let workdir = open_workdir(&opts)?;
    let config: FactoryConfig = load_config(&workdir.factory_config())?;
    FactorySnapshot::load(&workdir, config)?;
    send_signal(&workdir, Signal::SIGHUP)
}

fn selector(value: &str) -> Option<&str> {
    (value != ALL).then_some(value)
}

fn command_downtime(opts: DowntimeOpts) -> anyhow::Result<Outcome> {
    match opts.subcmd {
        DowntimeCommand::Add(args) => downtime_add(args),
        DowntimeCommand::Remove(args) => downtime_remove(args),
        DowntimeCommand::Check(args) => downtime_check(args),
    }
}

fn downtime_add(args: DowntimeArgs) -> anyhow::Result<Outcome> {
    let start = args.start.unwrap_or_else(now_epoch);
    let end = args.end.and_then(|end| end.epoch());
    if end.is_some_and(|end| end <= start) {
        bail!("The window ends before it starts");
    }
    let period = DowntimePeriod {
        start,
        end,
        entry: args.entry,
        frontend: args.frontend,
        security_class: args.security_class,
        comment: args.comment,
    };
    DowntimeFile::new(args.file).add_period(&period)?;
    println!("Added downtime: {}", period.to_line());
    Ok(Outcome::Done)
}

fn downtime_remove(args: DowntimeArgs) -> anyhow::Result<Outcome> {
    let at = args.start.unwrap_or_else(now_epoch);
    let closed = DowntimeFile::new(args.file).end_downtime(
        at,
        &args.entry,
        &args.frontend,
        &args.security_class,
    )?;
    if closed == 0 {
        println!("No open downtime matches");
        return Ok(Outcome::Soft);
    }
    println!("Ended {closed} downtime window(s) at {}", format_time(at));
    Ok(Outcome::Done)
}

fn downtime_check(args: DowntimeArgs) -> anyhow::Result<Outcome> {
    let at = args.start.unwrap_or_else(now_epoch);
    let file = DowntimeFile::new(args.file);
    for (line, error) in &file.read_all()?.malformed {
        println!("{} line {line}: {error}", "Malformed".yellow());
    }
    match file.check(
        &args.entry,
        selector(&args.frontend),
        selector(&args.security_class),
        at,
    )? {
        Some(comment) if comment.is_empty() => println!("{}", "In downtime".red()),
        Some(comment) => println!("{}: {comment}", "In downtime".red()),
        None => println!("{}", "Not in downtime".green()),
    }
    Ok(Outcome::Done)
}

fn write_new_file(
    path: &Path,
    overwrite: bool,
    write: impl FnOnce(&Path) -> glideinwms::Result<()>,
) -> anyhow::Result<()> {
    if path.exists() {
        if !overwrite {
            bail!(
                "{} already exists, use --overwrite to replace it",
                path.display()
            );
        }
        std::fs::remove_file(path)?;
    }
    write(path).with_context(|| format!("Cannot write {}", path.display()))
}

fn command_keygen(opts: KeygenOpts) -> anyhow::Result<Outcome> {
    let workdir = open_workdir(&opts.workdir)?;
    let key_path = workdir.resolve(ENTRY_KEY_FILE);
    let key = EntryKeyPair::generate(opts.bits)?;
    write_new_file(&key_path, opts.overwrite, |path| key.save(path))?;
    println!(
        "Entry key {} written to {}",
        key.public().id().bold(),
        key_path.display()
    );

    let secret_path = workdir.resolve(format!("{}.key", opts.key_id));
    let secret = SigningKey::generate(&opts.key_id)?;
    write_new_file(&secret_path, opts.overwrite, |path| {
        create_private_file(path, secret.to_hex().as_bytes())
    })?;
    println!(
        "Signing secret {} written to {}",
        secret.id().bold(),
        secret_path.display()
    );
    Ok(Outcome::Done)
}

fn init_logging(common: &CommonOpts) {
    if let Err(error) = setup_logging(common.debug, common.log_file.as_deref()) {
        eprintln!("Cannot open the log file: {error}");
        std::process::exit(1);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> glideinwms::Result<()> {
    let matches = RootOptions::command().get_matches();
    let top_opts = match RootOptions::from_arg_matches(&matches) {
        Ok(opts) => opts,
        Err(error) => error.exit(),
    };

    init_logging(&top_opts.common);

    let result = match top_opts.subcmd {
        SubCommand::Frontend(FrontendOpts {
            subcmd: FrontendCommand::Start(opts),
        }) => command_frontend_start(opts).await,
        SubCommand::Frontend(FrontendOpts {
            subcmd: FrontendCommand::Stop(opts),
        }) => open_workdir(&opts).and_then(|workdir| send_signal(&workdir, Signal::SIGTERM)),
        SubCommand::Frontend(FrontendOpts {
            subcmd: FrontendCommand::Reconfig(opts),
        }) => command_frontend_reconfig(opts),
        SubCommand::Factory(FactoryOpts {
            subcmd: FactoryCommand::Start(opts),
        }) => command_factory_start(opts).await,
        SubCommand::Factory(FactoryOpts {
            subcmd: FactoryCommand::Stop(opts),
        }) => command_factory_stop(opts),
        SubCommand::Factory(FactoryOpts {
            subcmd: FactoryCommand::Reconfig(opts),
        }) => command_factory_reconfig(opts),
        SubCommand::Downtime(opts) => command_downtime(opts),
        SubCommand::Keygen(opts) => command_keygen(opts),
    };

    match result {
        Ok(Outcome::Done) => Ok(()),
        Ok(outcome) => std::process::exit(outcome.exit_code()),
        Err(error) => {
            log::error!("{error:?}");
            std::process::exit(1);
        }
    }
}
