//! The per-(deployment, version) state machine.
//!
//! A version exists for every id observed on local disk or in the KV tree.
//! Its customer publishes the machine's state under the agent's session;
//! deploy/rollout/clean run the configured scripts and move the machine
//! through `deploying → available → starting → active`, with `failed`
//! reachable from any working state.

use crate::config::DeploymentConfig;
use crate::executor::Executor;
use depro_core::shutdown::Shutdown;
use depro_core::{Result, VersionState};
use depro_kv::{KvStore, Session};
use depro_waiter::Customer;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// The slice of deployment state a version reads. Deployments own their
/// versions by id; versions never point back at the deployment.
pub struct VersionContext {
    pub config: DeploymentConfig,
    pub agent_name: String,
    pub store: Arc<dyn KvStore>,
    pub shutdown: Shutdown,
}

pub struct Version {
    pub id: String,
    ctx: Arc<VersionContext>,
    customer: Customer,
    state_tx: Mutex<Option<mpsc::Sender<String>>>,
    last_state: Mutex<VersionState>,
}

impl Version {
    pub fn new(ctx: Arc<VersionContext>, id: &str) -> Arc<Version> {
        let (state_tx, state_rx) = mpsc::channel(1);
        let customer = Customer::new(
            Arc::clone(&ctx.store),
            &ctx.config.version_prefix(id),
            &ctx.agent_name,
            state_rx,
        );

        Arc::new(Version {
            id: id.to_string(),
            ctx,
            customer,
            state_tx: Mutex::new(Some(state_tx)),
            last_state: Mutex::new(VersionState::Unregistered),
        })
    }

    pub fn full_path(&self) -> PathBuf {
        self.ctx.config.full_path(&self.id)
    }

    /// Whether this version is present on local disk. The directory is
    /// authoritative for "exists on this node".
    pub fn exists(&self) -> bool {
        self.full_path().is_dir()
    }

    pub fn last_state(&self) -> VersionState {
        *self.last_state.lock().unwrap()
    }

    /// Whether the state channel has been closed and the customer released.
    pub fn is_closed(&self) -> bool {
        self.state_tx.lock().unwrap().is_none()
    }

    /// Publish a state transition. Lossy publication drops the value when
    /// nobody can take it right now and is used for transient states that
    /// may fire before a consumer exists; definitive transitions block until
    /// delivered.
    pub(crate) async fn set_state(&self, state: VersionState, lossy: bool) {
        debug!(version = %self.id, state = %state, "State change");

        let tx = self.state_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            if lossy {
                let _ = tx.try_send(state.as_str().to_string());
            } else if tx.send(state.as_str().to_string()).await.is_err() {
                debug!(version = %self.id, "State channel closed, dropping transition");
            }
        }

        *self.last_state.lock().unwrap() = state;
    }

    /// Recreate the version directory and run the deploy script. The
    /// decision whether a deploy must happen is the deployment loop's; this
    /// always recreates and re-runs.
    pub async fn deploy(&self) -> Result<String> {
        self.set_state(VersionState::Deploying, true).await;

        let mut output = format!("Preparing directory '{}'\n", self.full_path().display());
        if let Err(e) = self.recreate_directory().await {
            self.set_state(VersionState::Failed, false).await;
            return Err(e);
        }

        if !self.ctx.config.deploy.is_empty() {
            match self.executor().run(&self.ctx.config.deploy).await {
                Ok(out) => output.push_str(&out),
                Err(e) => {
                    self.set_state(VersionState::Failed, false).await;
                    return Err(e);
                }
            }
        }

        self.set_state(VersionState::Available, false).await;
        Ok(output)
    }

    /// Run the rollout script and make this the node's current version.
    pub async fn rollout(&self) -> Result<String> {
        self.set_state(VersionState::Starting, true).await;

        let output = match self.executor().run(&self.ctx.config.rollout).await {
            Ok(out) => out,
            Err(e) => {
                self.set_state(VersionState::Failed, false).await;
                return Err(e);
            }
        };

        let current = self.ctx.config.full_path("").join("current");
        if let Err(e) = tokio::fs::write(&current, &self.id).await {
            self.set_state(VersionState::Failed, false).await;
            return Err(e.into());
        }

        self.set_state(VersionState::Active, false).await;
        Ok(output)
    }

    /// Run the clean script (best effort), remove the version directory and
    /// release the customer entry.
    pub async fn clean(&self) -> Result<String> {
        let mut output = String::new();

        if !self.ctx.config.clean.is_empty() {
            match self.executor().run(&self.ctx.config.clean).await {
                Ok(out) => output.push_str(&out),
                Err(e) => warn!(version = %self.id, error = %e, "Clean script failed"),
            }
        }

        self.remove_directory().await?;
        self.shutdown_channels();
        Ok(output)
    }

    /// Publish this version's entry on the server and keep it current until
    /// the session ends or the version is closed. A watchdog closes the
    /// version when the process shuts down.
    pub async fn register(self: &Arc<Self>, session: Arc<Session>) -> Result<()> {
        info!(version = %self.id, deployment = %self.ctx.config.id, "Registering");

        let (done_tx, done_rx) = oneshot::channel::<()>();
        let watchdog = {
            let version = Arc::clone(self);
            let mut shutdown = version.ctx.shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.recv() => version.shutdown_channels(),
                    _ = done_rx => {}
                }
            })
        };

        let result = self.customer.run(&session).await;

        drop(done_tx);
        let _ = watchdog.await;
        self.shutdown_channels();

        match &result {
            Ok(()) => info!(version = %self.id, "Deregistered"),
            Err(e) => warn!(version = %self.id, error = %e, "Registration ended"),
        }
        result
    }

    /// Close the state channel; the customer drains and releases its entry.
    pub(crate) fn shutdown_channels(&self) {
        if self.state_tx.lock().unwrap().take().is_some() {
            debug!(version = %self.id, "Shutting down");
        }
    }

    fn executor(&self) -> Executor {
        let config = &self.ctx.config;
        let mut environment = HashMap::new();
        environment.insert("VERSION".to_string(), self.id.clone());
        environment.insert("AGENT_NAME".to_string(), self.ctx.agent_name.clone());
        environment.insert("DEPLOYMENT_ID".to_string(), config.id.clone());
        environment.insert("DEPLOYMENT_PREFIX".to_string(), config.prefix.clone());
        environment.insert(
            "DEPLOYMENT_PATH".to_string(),
            config.path.display().to_string(),
        );

        Executor::new(config.shell(), self.full_path(), environment)
    }

    async fn recreate_directory(&self) -> Result<()> {
        self.remove_directory().await?;
        tokio::fs::create_dir_all(self.full_path()).await?;
        Ok(())
    }

    async fn remove_directory(&self) -> Result<()> {
        let path = self.full_path();
        if path.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depro_core::Error;
    use depro_kv::MemoryStore;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Harness {
        store: Arc<MemoryStore>,
        session: Arc<Session>,
        version: Arc<Version>,
        registration: tokio::task::JoinHandle<Result<()>>,
        _root: tempfile::TempDir,
        _shutdown_tx: tokio::sync::watch::Sender<bool>,
    }

    impl Harness {
        async fn new(id: &str, config_tweak: impl FnOnce(&mut DeploymentConfig)) -> Harness {
            let root = tempfile::tempdir().unwrap();
            let store = MemoryStore::with_wait_time(Duration::from_millis(50));
            let session = Arc::new(Session::create(store.clone(), "test").await.unwrap());
            let (shutdown_tx, shutdown) = Shutdown::channel();

            let mut config = DeploymentConfig {
                id: "myapp".to_string(),
                path: root.path().to_path_buf(),
                prefix: "deploy/myapp".to_string(),
                ..DeploymentConfig::default()
            };
            config_tweak(&mut config);

            let ctx = Arc::new(VersionContext {
                config,
                agent_name: "node1".to_string(),
                store: store.clone(),
                shutdown,
            });
            let version = Version::new(ctx, id);

            let registration = {
                let version = Arc::clone(&version);
                let session = Arc::clone(&session);
                tokio::spawn(async move { version.register(session).await })
            };

            // Wait for the entry to appear before exercising the machine.
            Harness::await_state(&store, id, "unregistered").await;

            Harness {
                store,
                session,
                version,
                registration,
                _root: root,
                _shutdown_tx: shutdown_tx,
            }
        }

        async fn await_state(store: &Arc<MemoryStore>, id: &str, expected: &str) {
            let key = format!("deploy/myapp/{}/node1", id);
            let mut index = 0;
            let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
            loop {
                let (pair, next) = store.get(&key, index).await.unwrap();
                if pair.as_ref().map(|p| p.value.as_str()) == Some(expected) {
                    return;
                }
                index = next;
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "timed out waiting for {key} to become '{expected}'"
                );
            }
        }

        async fn finish(self) {
            self.version.shutdown_channels();
            let _ = timeout(Duration::from_secs(1), self.registration)
                .await
                .expect("registration should end once the channel closes");
            self.session.close().await;
        }
    }

    #[tokio::test]
    async fn deploy_publishes_available_and_creates_the_directory() {
        let harness = Harness::new("v1", |c| {
            c.deploy = vec!["echo deployed > marker".to_string()];
        })
        .await;

        let output = harness.version.deploy().await.unwrap();
        assert!(output.starts_with("Preparing directory"));
        assert!(harness.version.exists());
        assert!(harness.version.full_path().join("marker").is_file());

        Harness::await_state(&harness.store, "v1", "available").await;
        assert_eq!(harness.version.last_state(), VersionState::Available);

        harness.finish().await;
    }

    #[tokio::test]
    async fn failing_deploy_publishes_failed() {
        let harness = Harness::new("v1", |c| {
            c.deploy = vec!["echo sad".to_string(), "exit 1".to_string()];
        })
        .await;

        let err = harness.version.deploy().await.unwrap_err();
        assert!(matches!(err, Error::Script { code: 1, .. }));

        Harness::await_state(&harness.store, "v1", "failed").await;
        assert_eq!(harness.version.last_state(), VersionState::Failed);

        harness.finish().await;
    }

    #[tokio::test]
    async fn rollout_goes_active_and_records_the_current_version() {
        let harness = Harness::new("v2", |c| {
            c.rollout = vec!["echo starting".to_string()];
        })
        .await;

        harness.version.deploy().await.unwrap();
        harness.version.rollout().await.unwrap();

        Harness::await_state(&harness.store, "v2", "active").await;
        let current =
            std::fs::read_to_string(harness.version.ctx.config.full_path("").join("current"))
                .unwrap();
        assert_eq!(current, "v2");

        harness.finish().await;
    }

    #[tokio::test]
    async fn clean_removes_the_directory_and_releases_the_entry() {
        let harness = Harness::new("v3", |_| {}).await;

        harness.version.deploy().await.unwrap();
        assert!(harness.version.exists());

        harness.version.clean().await.unwrap();
        assert!(!harness.version.exists());
        assert!(harness.version.is_closed());

        // The customer drains, deletes the entry and registration returns.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let (pair, _) = harness.store.get("deploy/myapp/v3/node1", 0).await.unwrap();
            if pair.is_none() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        harness.finish().await;
    }
}
