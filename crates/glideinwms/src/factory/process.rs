use std::collections::BTreeSet;
use std::future::Future;
use std::rc::Rc;

use classad::Transport;
use tokio::time::{Interval, MissedTickBehavior};

use crate::common::config::ConfigSource;
use crate::common::rpc::{ResponseToken, RpcReceiver, RpcSender, initiate_request, make_rpc_queue};
use crate::common::utils::time::now_epoch;
use crate::common::workdir::WorkDir;
use crate::factory::config::{FactoryConfig, FactorySnapshot};
use crate::factory::iteration::{FactoryContext, FactoryState, run_factory_iteration, withdraw};
use crate::stats::StatsSink;
use crate::submit::{ScheddRegistry, SubmitBackend};

/// Downtime windows that ended longer ago are dropped from the file at start.
const DOWNTIME_RETENTION_SECS: i64 = 30 * 24 * 3600;

#[derive(Debug)]
pub enum FactoryMessage {
    /// Re-reads the configuration file now.
    Reconfigure(ResponseToken<crate::Result<()>>),
    /// Withdraws all published ads and ends the loop.
    Stop,
}

pub struct FactoryService {
    sender: RpcSender<FactoryMessage>,
}

impl FactoryService {
    pub fn reconfigure(&self) -> impl Future<Output = crate::Result<()>> + use<> {
        let fut = initiate_request(|token| self.sender.send(FactoryMessage::Reconfigure(token)));
        async move {
            fut.await.unwrap_or_else(|_| {
                Err(crate::common::error::GwmsError::GenericError(
                    "Factory loop is not running".to_string(),
                ))
            })
        }
    }

    pub fn stop(&self) {
        let _ = self.sender.send(FactoryMessage::Stop);
    }
}

pub struct FactoryOptions {
    pub workdir: WorkDir,
    pub transport: Rc<dyn Transport>,
    pub backend: Rc<dyn SubmitBackend>,
    pub stats: Rc<dyn StatsSink>,
}

struct FactoryProcess {
    options: FactoryOptions,
    source: ConfigSource<FactoryConfig>,
    snapshot: FactorySnapshot,
    state: FactoryState,
    registry: ScheddRegistry,
    start_time: i64,
}

impl FactoryProcess {
    /// Asks the backend of every schedd to reload its own configuration.
    async fn reconfigure_schedds(&self) {
        let schedds: BTreeSet<&str> = self
            .snapshot
            .entries
            .iter()
            .map(|entry| entry.config.schedd.as_str())
            .collect();
        for schedd in schedds {
            if let Err(error) = self.options.backend.reconfigure(schedd).await {
                log::warn!("Cannot reconfigure schedd {schedd}: {error:#}");
            }
        }
    }

    /// Applies the configuration file if it changed. On error the running configuration is
    /// kept.
    async fn reload(&mut self) -> crate::Result<bool> {
        let Some(config) = self.source.reload()? else {
            return Ok(false);
        };
        let snapshot = match FactorySnapshot::load(&self.options.workdir, config) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                self.source.invalidate();
                return Err(error);
            }
        };
        if snapshot.config.max_submits_per_cycle != self.registry.max_submits_per_cycle() {
            self.registry = ScheddRegistry::new(snapshot.config.max_submits_per_cycle);
        }
        self.state.reconfigure(&snapshot);
        log::info!(
            "Configuration loaded from {}: {} entr(y/ies)",
            self.source.path().display(),
            snapshot.entries.len()
        );
        self.snapshot = snapshot;
        self.reconfigure_schedds().await;
        Ok(true)
    }

    async fn iterate(&mut self) {
        let ctx = FactoryContext {
            transport: self.options.transport.as_ref(),
            backend: self.options.backend.as_ref(),
            registry: &self.registry,
            stats: self.options.stats.as_ref(),
            start_time: self.start_time,
        };
        run_factory_iteration(&self.snapshot, &mut self.state, &ctx).await;
    }
}

fn make_interval(snapshot: &FactorySnapshot) -> Interval {
    let mut interval = tokio::time::interval(snapshot.loop_delay);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn factory_process(mut process: FactoryProcess, mut receiver: RpcReceiver<FactoryMessage>) {
    let mut interval = make_interval(&process.snapshot);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let loop_delay = process.snapshot.loop_delay;
                match process.reload().await {
                    Ok(true) if process.snapshot.loop_delay != loop_delay => {
                        interval = make_interval(&process.snapshot);
                        interval.tick().await;
                    }
                    Ok(_) => {}
                    Err(error) => log::error!("Keeping the previous configuration: {error}"),
                }
                process.iterate().await;
            }
            message = receiver.recv() => {
                match message {
                    None | Some(FactoryMessage::Stop) => break,
                    Some(FactoryMessage::Reconfigure(token)) => {
                        process.source.invalidate();
                        let result = process.reload().await.map(|_| ());
                        if result.is_ok() && interval.period() != process.snapshot.loop_delay {
                            interval = make_interval(&process.snapshot);
                        }
                        token.respond(result);
                    }
                }
            }
        }
    }
    log::info!("Factory is stopping, withdrawing published ads");
    let failures = withdraw(
        &process.snapshot,
        &mut process.state,
        process.options.transport.as_ref(),
    )
    .await;
    if failures > 0 {
        log::warn!("{failures} ad(s) could not be invalidated");
    }
}

/// Loads the configuration and creates the Factory loop. Configuration errors are returned
/// here; later ones only keep the previous configuration running.
pub fn create_factory_service(
    options: FactoryOptions,
) -> crate::Result<(FactoryService, impl Future<Output = ()>)> {
    let mut source = ConfigSource::<FactoryConfig>::new(options.workdir.factory_config());
    let Some(config) = source.reload()? else {
        return crate::common::error::config_error("Configuration was not loaded".to_string());
    };
    let snapshot = FactorySnapshot::load(&options.workdir, config)?;
    match snapshot
        .downtime
        .purge_old_periods(now_epoch() - DOWNTIME_RETENTION_SECS)
    {
        Ok(0) => {}
        Ok(purged) => log::info!("Purged {purged} old downtime window(s)"),
        Err(error) => log::warn!("Cannot purge old downtime windows: {error}"),
    }
    log::info!(
        "Factory {} starting with {} entr(y/ies), loop delay {}",
        snapshot.config.factory_name,
        snapshot.entries.len(),
        humantime::format_duration(snapshot.loop_delay)
    );
    let process = FactoryProcess {
        registry: ScheddRegistry::new(snapshot.config.max_submits_per_cycle),
        state: FactoryState::new(&snapshot),
        options,
        source,
        snapshot,
        start_time: now_epoch(),
    };
    let (sender, receiver) = make_rpc_queue();
    Ok((FactoryService { sender }, factory_process(process, receiver)))
}
