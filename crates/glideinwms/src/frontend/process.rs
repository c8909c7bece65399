use std::collections::BTreeMap;
use std::future::Future;
use std::rc::Rc;

use classad::Transport;
use futures::future::join_all;
use tokio::time::{Interval, MissedTickBehavior};

use crate::common::config::ConfigSource;
use crate::common::rpc::{ResponseToken, RpcReceiver, RpcSender, initiate_request, make_rpc_queue};
use crate::common::utils::time::now_epoch;
use crate::common::workdir::WorkDir;
use crate::credentials::CredentialStore;
use crate::frontend::config::{FrontendConfig, FrontendSnapshot};
use crate::frontend::iteration::{GroupContext, GroupState, run_group_iteration, withdraw};
use crate::stats::StatsSink;

#[derive(Debug)]
pub enum FrontendMessage {
    /// Re-reads the configuration file now.
    Reconfigure(ResponseToken<crate::Result<()>>),
    /// Withdraws all published ads and ends the loop.
    Stop,
}

pub struct FrontendService {
    sender: RpcSender<FrontendMessage>,
}

impl FrontendService {
    pub fn reconfigure(&self) -> impl Future<Output = crate::Result<()>> + use<> {
        let fut = initiate_request(|token| self.sender.send(FrontendMessage::Reconfigure(token)));
        async move {
            fut.await.unwrap_or_else(|_| {
                Err(crate::common::error::GwmsError::GenericError(
                    "Frontend loop is not running".to_string(),
                ))
            })
        }
    }

    pub fn stop(&self) {
        let _ = self.sender.send(FrontendMessage::Stop);
    }
}

pub struct FrontendOptions {
    pub workdir: WorkDir,
    /// Runs only this group.
    pub only_group: Option<String>,
    pub transport: Rc<dyn Transport>,
    pub stats: Rc<dyn StatsSink>,
}

struct GroupRuntime {
    state: GroupState,
    credentials: CredentialStore,
}

struct FrontendProcess {
    options: FrontendOptions,
    source: ConfigSource<FrontendConfig>,
    snapshot: FrontendSnapshot,
    groups: BTreeMap<String, GroupRuntime>,
    start_time: i64,
}

impl FrontendProcess {
    /// Builds the runtime of every group of `snapshot`. Groups that already run keep their
    /// state.
    fn prepare_groups(
        snapshot: &FrontendSnapshot,
        previous: &mut BTreeMap<String, GroupRuntime>,
    ) -> crate::Result<BTreeMap<String, GroupRuntime>> {
        let mut groups = BTreeMap::new();
        for group in &snapshot.groups {
            let credentials = group.credential_store(snapshot.config.generator_timeout)?;
            let state = match previous.remove(group.name()) {
                Some(mut runtime) => {
                    runtime.state.reconfigure(snapshot);
                    runtime.state
                }
                None => GroupState::new(snapshot, group),
            };
            groups.insert(group.name().to_string(), GroupRuntime { state, credentials });
        }
        Ok(groups)
    }

    /// Applies the configuration file if it changed. On error the running configuration is
    /// kept.
    async fn reload(&mut self) -> crate::Result<bool> {
        let Some(config) = self.source.reload()? else {
            return Ok(false);
        };
        let snapshot =
            FrontendSnapshot::load(&self.options.workdir, config, self.options.only_group.as_deref());
        let snapshot = match snapshot {
            Ok(snapshot) => snapshot,
            Err(error) => {
                self.source.invalidate();
                return Err(error);
            }
        };
        let mut previous = std::mem::take(&mut self.groups);
        let groups = match Self::prepare_groups(&snapshot, &mut previous) {
            Ok(groups) => groups,
            Err(error) => {
                self.groups = previous;
                self.source.invalidate();
                return Err(error);
            }
        };
        for (name, mut runtime) in previous {
            log::info!("Group {name} was removed from the configuration, withdrawing its ads");
            withdraw(&self.snapshot, &mut runtime.state, self.options.transport.as_ref()).await;
        }
        log::info!(
            "Configuration loaded from {}: {} group(s)",
            self.source.path().display(),
            groups.len()
        );
        self.snapshot = snapshot;
        self.groups = groups;
        Ok(true)
    }

    async fn iterate(&mut self) {
        let FrontendProcess {
            options,
            snapshot,
            groups,
            start_time,
            ..
        } = self;
        let snapshot: &FrontendSnapshot = snapshot;
        let start_time = *start_time;
        let transport = options.transport.as_ref();
        let stats = options.stats.as_ref();
        let iterations = groups.iter_mut().filter_map(|(name, runtime)| {
            let group = snapshot.group(name)?;
            let GroupRuntime { state, credentials } = runtime;
            Some(async move {
                let ctx = GroupContext {
                    transport,
                    credentials,
                    stats,
                    start_time,
                };
                run_group_iteration(snapshot, group, state, &ctx).await
            })
        });
        join_all(iterations).await;
    }

    async fn withdraw_all(&mut self) {
        for (name, runtime) in self.groups.iter_mut() {
            let failures =
                withdraw(&self.snapshot, &mut runtime.state, self.options.transport.as_ref()).await;
            if failures > 0 {
                log::warn!("Group {name}: {failures} ad(s) could not be invalidated");
            }
        }
    }
}

fn make_interval(snapshot: &FrontendSnapshot) -> Interval {
    let mut interval = tokio::time::interval(snapshot.loop_delay);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn frontend_process(mut process: FrontendProcess, mut receiver: RpcReceiver<FrontendMessage>) {
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
                    None | Some(FrontendMessage::Stop) => break,
                    Some(FrontendMessage::Reconfigure(token)) => {
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
    log::info!("Frontend is stopping, withdrawing published ads");
    process.withdraw_all().await;
}

/// Loads the configuration and creates the Frontend loop. Configuration errors are returned
/// here; later ones only keep the previous configuration running.
pub fn create_frontend_service(
    options: FrontendOptions,
) -> crate::Result<(FrontendService, impl Future<Output = ()>)> {
    let mut source = ConfigSource::<FrontendConfig>::new(options.workdir.frontend_config());
    let Some(config) = source.reload()? else {
        return crate::common::error::config_error("Configuration was not loaded".to_string());
    };
    let snapshot = FrontendSnapshot::load(&options.workdir, config, options.only_group.as_deref())?;
    let groups = FrontendProcess::prepare_groups(&snapshot, &mut BTreeMap::new())?;
    log::info!(
        "Frontend {} starting with {} group(s), loop delay {}",
        snapshot.config.frontend_name,
        groups.len(),
        humantime::format_duration(snapshot.loop_delay)
    );
    let process = FrontendProcess {
        options,
        source,
        snapshot,
        groups,
        start_time: now_epoch(),
    };
    let (sender, receiver) = make_rpc_queue();
    Ok((
        FrontendService { sender },
        frontend_process(process, receiver),
    ))
}
