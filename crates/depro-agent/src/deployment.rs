//! The per-deployment control loop.
//!
//! Two watchers long-poll the KV tree: one over the set of version keys, one
//! over the `current` pointer. Their diffs dispatch versions onto four task
//! channels (register, deploy, rollout, clean), each drained by its own
//! consumer task. The loop runs until process shutdown; watcher exit closes
//! the channels and the consumers drain out.

use crate::config::DeploymentConfig;
use crate::version::{Version, VersionContext};
use depro_core::shutdown::Shutdown;
use depro_core::{Result, VersionState};
use depro_kv::{KvStore, Session};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Back-off before re-polling after a KV error. The wait-index is kept, so
/// nothing is missed across the retry.
const KV_RETRY_DELAY: Duration = Duration::from_secs(5);

type VersionMap = Arc<Mutex<HashMap<String, Arc<Version>>>>;

pub struct Deployment {
    config: DeploymentConfig,
    agent_name: String,
    store: Arc<dyn KvStore>,
    shutdown: Shutdown,
}

impl Deployment {
    pub fn new(
        config: DeploymentConfig,
        agent_name: String,
        store: Arc<dyn KvStore>,
        shutdown: Shutdown,
    ) -> Deployment {
        Deployment {
            config,
            agent_name,
            store,
            shutdown,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Run the loop until shutdown. Returns early only when the session
    /// cannot be established.
    pub async fn run(&self) -> Result<()> {
        let session = Arc::new(Session::create(Arc::clone(&self.store), &self.config.id).await?);
        let versions: VersionMap = Arc::new(Mutex::new(HashMap::new()));
        let ctx = Arc::new(VersionContext {
            config: self.config.clone(),
            agent_name: self.agent_name.clone(),
            store: Arc::clone(&self.store),
            shutdown: self.shutdown.clone(),
        });

        let (register_tx, register_rx) = mpsc::channel(1);
        let (deploy_tx, deploy_rx) = mpsc::channel(1);
        let (rollout_tx, rollout_rx) = mpsc::channel(1);
        let (clean_tx, clean_rx) = mpsc::channel(1);

        let consumers = vec![
            tokio::spawn(register_consumer(
                register_rx,
                Arc::clone(&session),
                Arc::clone(&versions),
            )),
            tokio::spawn(deploy_consumer(
                deploy_rx,
                rollout_tx.clone(),
                self.config.clone(),
            )),
            tokio::spawn(rollout_consumer(rollout_rx, Arc::clone(&versions))),
            tokio::spawn(clean_consumer(clean_rx, Arc::clone(&versions))),
        ];

        let dispatch = Arc::new(Dispatch {
            ctx,
            versions: Arc::clone(&versions),
            register_tx,
            deploy_tx,
            rollout_tx,
            clean_tx,
        });

        let versions_watcher = tokio::spawn(watch_versions(
            Arc::clone(&self.store),
            self.config.clone(),
            self.shutdown.clone(),
            Arc::clone(&dispatch),
        ));
        let current_watcher = tokio::spawn(watch_current(
            Arc::clone(&self.store),
            self.config.clone(),
            self.shutdown.clone(),
            Arc::clone(&dispatch),
        ));

        let _ = versions_watcher.await;
        let _ = current_watcher.await;

        // The watchers were the only external holders of the task channel
        // senders; dropping the dispatcher closes them and the consumers
        // drain out.
        drop(dispatch);
        for consumer in consumers {
            let _ = consumer.await;
        }

        session.close().await;
        Ok(())
    }
}

/// The watcher-side view: owns the task channel senders and the version map.
struct Dispatch {
    ctx: Arc<VersionContext>,
    versions: VersionMap,
    register_tx: mpsc::Sender<Arc<Version>>,
    deploy_tx: mpsc::Sender<Arc<Version>>,
    rollout_tx: mpsc::Sender<Arc<Version>>,
    clean_tx: mpsc::Sender<Arc<Version>>,
}

impl Dispatch {
    /// Look up or create the version, dispatching a registration for new
    /// ones.
    async fn ensure_version(&self, id: &str) -> Arc<Version> {
        let (version, created) = {
            let mut map = self.versions.lock().unwrap();
            match map.get(id) {
                Some(version) => (Arc::clone(version), false),
                None => {
                    let version = Version::new(Arc::clone(&self.ctx), id);
                    map.insert(id.to_string(), Arc::clone(&version));
                    (version, true)
                }
            }
        };
        if created {
            let _ = self.register_tx.send(Arc::clone(&version)).await;
        }
        version
    }

    async fn diff_versions(&self, old: &[String], new: &[String]) {
        for id in old.iter().filter(|id| !new.contains(*id)) {
            debug!(version = %id, "Version key removed");
            let version = self.versions.lock().unwrap().get(id).cloned();
            if let Some(version) = version {
                let _ = self.clean_tx.send(version).await;
            }
        }

        for id in new.iter().filter(|id| !old.contains(*id)) {
            debug!(version = %id, "Version key appeared");
            let version = self.ensure_version(id).await;

            if version.exists() {
                if version.id == current_version(&self.ctx.config.path) {
                    let _ = self.rollout_tx.send(version).await;
                } else {
                    // Survived a restart but is not current; the deploy
                    // script is not re-run.
                    version.set_state(VersionState::Available, false).await;
                }
            } else {
                let _ = self.deploy_tx.send(version).await;
            }
        }
    }

    async fn diff_current(&self, old: &str, new: &str) {
        if old == new || new.is_empty() {
            return;
        }
        info!(version = %new, "Rollout requested");

        let version = self.ensure_version(new).await;
        if version.exists() {
            let _ = self.rollout_tx.send(version).await;
        } else {
            // The deploy consumer chains into a rollout once the deploy
            // completes and the id matches the local current version.
            let _ = self.deploy_tx.send(version).await;
        }
    }
}

/// The node's current version according to `<path>/current`; empty when the
/// file does not exist yet.
fn current_version(path: &Path) -> String {
    match std::fs::read_to_string(path.join("current")) {
        Ok(contents) => contents.trim().to_string(),
        Err(_) => String::new(),
    }
}

async fn fetch_versions(
    store: &Arc<dyn KvStore>,
    prefix: &str,
    since: u64,
) -> Result<(Vec<String>, u64)> {
    let list_prefix = format!("{}/", prefix.trim_matches('/'));
    let (keys, index) = store.keys(&list_prefix, "/", since).await?;

    let ids = keys
        .iter()
        .filter_map(|key| {
            let id = key.strip_prefix(&list_prefix)?.trim_matches('/');
            if id.is_empty() || id == "current" {
                None
            } else {
                Some(id.to_string())
            }
        })
        .collect();
    Ok((ids, index))
}

async fn fetch_current(
    store: &Arc<dyn KvStore>,
    prefix: &str,
    since: u64,
) -> Result<(String, u64)> {
    let key = format!("{}/current", prefix.trim_matches('/'));
    let (pair, index) = store.get(&key, since).await?;
    Ok((pair.map(|p| p.value).unwrap_or_default(), index))
}

async fn watch_versions(
    store: Arc<dyn KvStore>,
    config: DeploymentConfig,
    mut shutdown: Shutdown,
    dispatch: Arc<Dispatch>,
) {
    let mut known: Vec<String> = Vec::new();
    let mut last_index = 0u64;

    while !shutdown.is_shutdown() {
        let fetched = tokio::select! {
            _ = shutdown.recv() => break,
            res = fetch_versions(&store, &config.prefix, last_index) => res,
        };

        match fetched {
            Ok((new, index)) => {
                last_index = index;
                dispatch.diff_versions(&known, &new).await;
                known = new;
            }
            Err(e) => {
                warn!(deployment = %config.id, error = %e, "Version watch failed, retrying");
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(KV_RETRY_DELAY) => {}
                }
            }
        }
    }
}

async fn watch_current(
    store: Arc<dyn KvStore>,
    config: DeploymentConfig,
    mut shutdown: Shutdown,
    dispatch: Arc<Dispatch>,
) {
    // Seeded from local disk: together with the KV pointer this decides
    // whether an observation rolls out or only deploys.
    let mut current = current_version(&config.path);
    let mut last_index = 0u64;

    while !shutdown.is_shutdown() {
        let fetched = tokio::select! {
            _ = shutdown.recv() => break,
            res = fetch_current(&store, &config.prefix, last_index) => res,
        };

        match fetched {
            Ok((new, index)) => {
                last_index = index;
                dispatch.diff_current(&current, &new).await;
                current = new;
            }
            Err(e) => {
                warn!(deployment = %config.id, error = %e, "Current-version watch failed, retrying");
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(KV_RETRY_DELAY) => {}
                }
            }
        }
    }
}

async fn register_consumer(
    mut rx: mpsc::Receiver<Arc<Version>>,
    session: Arc<Session>,
    versions: VersionMap,
) {
    while let Some(version) = rx.recv().await {
        let session = Arc::clone(&session);
        let versions = Arc::clone(&versions);
        tokio::spawn(async move {
            let id = version.id.clone();
            if let Err(e) = version.register(session).await {
                error!(version = %id, error = %e, "Version not registered");
            }
            // The server entry is gone either way; forget the version so a
            // later watcher firing can recreate it.
            let mut map = versions.lock().unwrap();
            if map.get(&id).is_some_and(|v| Arc::ptr_eq(v, &version)) {
                map.remove(&id);
            }
        });
    }
}

async fn deploy_consumer(
    mut rx: mpsc::Receiver<Arc<Version>>,
    rollout_tx: mpsc::Sender<Arc<Version>>,
    config: DeploymentConfig,
) {
    while let Some(version) = rx.recv().await {
        if !version.exists() {
            match version.deploy().await {
                Ok(output) => {
                    info!(deployment = %config.id, version = %version.id, "Version deployed");
                    if !output.is_empty() {
                        debug!(version = %version.id, %output, "Deploy output");
                    }
                }
                Err(e) => {
                    error!(deployment = %config.id, version = %version.id, error = %e, "Version deployment failed");
                }
            }
        }

        // Deployed just now and already selected: chain into a rollout.
        if version.id == current_version(&config.path) {
            let _ = rollout_tx.send(version).await;
        }
    }
}

async fn rollout_consumer(mut rx: mpsc::Receiver<Arc<Version>>, versions: VersionMap) {
    while let Some(version) = rx.recv().await {
        match version.rollout().await {
            Ok(output) => {
                info!(version = %version.id, "Version rolled out");
                if !output.is_empty() {
                    debug!(version = %version.id, %output, "Rollout output");
                }
            }
            Err(e) => {
                error!(version = %version.id, error = %e, "Version rollout failed");
            }
        }

        // Every other on-disk version steps back to available.
        let others: Vec<Arc<Version>> = versions
            .lock()
            .unwrap()
            .values()
            .filter(|other| !Arc::ptr_eq(other, &version))
            .cloned()
            .collect();
        for other in others {
            if other.exists() {
                other.set_state(VersionState::Available, true).await;
            }
        }
    }
}

async fn clean_consumer(mut rx: mpsc::Receiver<Arc<Version>>, versions: VersionMap) {
    while let Some(version) = rx.recv().await {
        match version.clean().await {
            Ok(_) => info!(version = %version.id, "Version removed"),
            Err(e) => error!(version = %version.id, error = %e, "Version cleanup failed"),
        }

        let mut map = versions.lock().unwrap();
        if map.get(&version.id).is_some_and(|v| Arc::ptr_eq(v, &version)) {
            map.remove(&version.id);
        }
    }
}
