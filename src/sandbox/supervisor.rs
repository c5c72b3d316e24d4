use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::handle::{SandboxHandle, SandboxSpec};
use super::runtime::SandboxRuntime;
use crate::errors::{SandboxError, SandboxResult};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Upper bound on a single `create` call.
    pub creation_timeout: Duration,
    /// How long a sandbox gets between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
    /// Maximum number of live sandboxes.
    pub max_sandboxes: usize,
    /// Environment variable that carries the client's credential.
    pub credential_env: String,
    /// Extra environment injected into every sandbox.
    pub extra_env: Vec<(String, String)>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            creation_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(5),
            max_sandboxes: 64,
            credential_env: "CMUX_API_KEY".to_string(),
            extra_env: Vec::new(),
        }
    }
}

/// Identity injected into a new sandbox.
#[derive(Debug, Clone, Default)]
pub struct SandboxCredentials {
    pub credential: String,
    pub client_id: Option<String>,
}

/// Creates, tracks and destroys sandboxes for one relay process.
pub struct SandboxSupervisor {
    runtime: Arc<dyn SandboxRuntime>,
    config: SupervisorConfig,
    live: DashMap<String, SandboxHandle>,
    /// Slots taken by live sandboxes plus creations in flight.
    reserved: AtomicUsize,
    healthy: AtomicBool,
}

impl SandboxSupervisor {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, config: SupervisorConfig) -> Self {
        Self {
            runtime,
            config,
            live: DashMap::new(),
            reserved: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn runtime_name(&self) -> &'static str {
        self.runtime.name()
    }

    /// Start a new sandbox with the client's credential and identity injected
    /// into its environment.
    pub async fn create(
        &self,
        credentials: &SandboxCredentials,
        env: Vec<(String, String)>,
    ) -> SandboxResult<SandboxHandle> {
        if !self.is_healthy() {
            return Err(SandboxError::Unavailable(format!(
                "{} runtime failed its last health check",
                self.runtime.name()
            )));
        }
        self.reserve_slot()?;

        let id = Uuid::new_v4().to_string();
        let env = self.sandbox_env(&id, credentials, env);
        let spec = SandboxSpec { env: env.clone() };

        // Dropping the launch future on timeout kills anything it spawned.
        let launched =
            match tokio::time::timeout(self.config.creation_timeout, self.runtime.launch(&id, &spec))
                .await
            {
                Ok(Ok(launched)) => launched,
                Ok(Err(e)) => {
                    self.release_slot();
                    error!("[sandbox:{}] Creation failed: {}", id, e);
                    return Err(e);
                }
                Err(_) => {
                    self.release_slot();
                    error!(
                        "[sandbox:{}] Creation timed out after {:?}",
                        id, self.config.creation_timeout
                    );
                    return Err(SandboxError::Timeout(self.config.creation_timeout));
                }
            };

        let handle = SandboxHandle::new(id.clone(), self.runtime.name(), launched, env);
        self.live.insert(id.clone(), handle.clone());
        info!(
            "[sandbox:{}] Created ({} runtime, {} live)",
            id,
            self.runtime.name(),
            self.live.len()
        );
        Ok(handle)
    }

    /// Tear a sandbox down. Idempotent: safe to call twice, concurrently, or
    /// on a sandbox whose processes already died.
    pub async fn destroy(&self, handle: &SandboxHandle) {
        if handle.shutdown(self.config.stop_grace).await && self.live.remove(handle.id()).is_some()
        {
            self.release_slot();
        }
    }

    /// Probe the runtime and remember the result. While unhealthy, `create`
    /// is refused; existing sandboxes are left alone.
    pub async fn health_check(&self) -> bool {
        let healthy = self.runtime.health_check().await;
        let was = self.healthy.swap(healthy, Ordering::AcqRel);
        if was != healthy {
            if healthy {
                info!("{} runtime is healthy again", self.runtime.name());
            } else {
                warn!(
                    "{} runtime is unhealthy; refusing new sandboxes",
                    self.runtime.name()
                );
            }
        }
        healthy
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Run [`Self::health_check`] every `interval` until `cancel` fires.
    pub fn spawn_health_monitor(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; startup already checked.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        supervisor.health_check().await;
                    }
                }
            }
            debug!("Health monitor stopped");
        })
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Destroy every live sandbox.
    pub async fn shutdown(&self) {
        let handles: Vec<SandboxHandle> =
            self.live.iter().map(|entry| entry.value().clone()).collect();
        if handles.is_empty() {
            return;
        }
        info!("Destroying {} live sandbox(es)", handles.len());
        join_all(handles.iter().map(|handle| self.destroy(handle))).await;
    }

    fn reserve_slot(&self) -> SandboxResult<()> {
        let max = self.config.max_sandboxes;
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|n| SandboxError::ResourcesExhausted(format!("{n} of {max} sandboxes in use")))
    }

    fn release_slot(&self) {
        let _ = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn sandbox_env(
        &self,
        id: &str,
        credentials: &SandboxCredentials,
        extra: Vec<(String, String)>,
    ) -> Vec<(String, String)> {
        let mut env = self.config.extra_env.clone();
        env.extend(extra);
        env.push(("CMUX_SANDBOX_ID".to_string(), id.to_string()));
        if !credentials.credential.is_empty() {
            env.push((
                self.config.credential_env.clone(),
                credentials.credential.clone(),
            ));
        }
        if let Some(client_id) = &credentials.client_id {
            env.push(("CMUX_CLIENT_ID".to_string(), client_id.clone()));
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{HostRuntime, LaunchedSandbox};
    use async_trait::async_trait;

    struct FlakyRuntime {
        healthy: AtomicBool,
        launch_delay: Duration,
    }

    #[async_trait]
    impl SandboxRuntime for FlakyRuntime {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn launch(&self, _id: &str, _spec: &SandboxSpec) -> SandboxResult<LaunchedSandbox> {
            tokio::time::sleep(self.launch_delay).await;
            Ok(LaunchedSandbox {
                keeper: None,
                entry: Vec::new(),
                cwd: std::env::temp_dir(),
                owned_dir: None,
            })
        }

        async fn health_check(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    fn host_supervisor(max_sandboxes: usize) -> SandboxSupervisor {
        SandboxSupervisor::new(
            Arc::new(HostRuntime::default()),
            SupervisorConfig {
                max_sandboxes,
                stop_grace: Duration::from_millis(100),
                ..Default::default()
            },
        )
    }

    fn credentials() -> SandboxCredentials {
        SandboxCredentials {
            credential: "secret".to_string(),
            client_id: Some("alice".to_string()),
        }
    }

    #[tokio::test]
    async fn create_injects_credentials() {
        let supervisor = host_supervisor(4);
        let handle = supervisor
            .create(&credentials(), vec![("EXTRA".into(), "1".into())])
            .await
            .unwrap();

        let env = handle.env();
        let get = |key: &str| {
            env.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("CMUX_API_KEY"), Some("secret"));
        assert_eq!(get("CMUX_CLIENT_ID"), Some("alice"));
        assert_eq!(get("CMUX_SANDBOX_ID"), Some(handle.id()));
        assert_eq!(get("EXTRA"), Some("1"));
        assert_eq!(supervisor.live_count(), 1);
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_frees_slot() {
        let supervisor = Arc::new(host_supervisor(1));
        let handle = supervisor.create(&credentials(), Vec::new()).await.unwrap();

        let err = supervisor.create(&credentials(), Vec::new()).await.unwrap_err();
        assert!(matches!(err, SandboxError::ResourcesExhausted(_)));

        tokio::join!(supervisor.destroy(&handle), supervisor.destroy(&handle));
        supervisor.destroy(&handle).await;
        assert!(handle.is_destroyed());
        assert_eq!(supervisor.live_count(), 0);

        supervisor.create(&credentials(), Vec::new()).await.unwrap();
    }

    #[tokio::test]
    async fn unhealthy_runtime_refuses_creation() {
        let runtime = Arc::new(FlakyRuntime {
            healthy: AtomicBool::new(true),
            launch_delay: Duration::ZERO,
        });
        let supervisor = SandboxSupervisor::new(runtime.clone(), SupervisorConfig::default());
        let existing = supervisor.create(&credentials(), Vec::new()).await.unwrap();

        runtime.healthy.store(false, Ordering::SeqCst);
        assert!(!supervisor.health_check().await);
        let err = supervisor.create(&credentials(), Vec::new()).await.unwrap_err();
        assert!(matches!(err, SandboxError::Unavailable(_)));
        assert!(existing.is_ready());

        runtime.healthy.store(true, Ordering::SeqCst);
        assert!(supervisor.health_check().await);
        supervisor.create(&credentials(), Vec::new()).await.unwrap();
    }

    #[tokio::test]
    async fn creation_times_out() {
        let supervisor = SandboxSupervisor::new(
            Arc::new(FlakyRuntime {
                healthy: AtomicBool::new(true),
                launch_delay: Duration::from_secs(10),
            }),
            SupervisorConfig {
                creation_timeout: Duration::from_millis(50),
                max_sandboxes: 1,
                ..Default::default()
            },
        );
        let err = supervisor.create(&credentials(), Vec::new()).await.unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)));
        assert_eq!(supervisor.live_count(), 0);
        assert_eq!(supervisor.reserved.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shutdown_destroys_everything() {
        let supervisor = host_supervisor(8);
        let a = supervisor.create(&credentials(), Vec::new()).await.unwrap();
        let b = supervisor.create(&credentials(), Vec::new()).await.unwrap();
        supervisor.shutdown().await;
        assert!(a.is_destroyed() && b.is_destroyed());
        assert_eq!(supervisor.live_count(), 0);
    }
}
