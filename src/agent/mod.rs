use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::eviction::CacheEvictor;
use crate::cache::BeaconCache;
use crate::config::{Config, RuntimeSettings};
use crate::protocol::beacon::Beacon;
use crate::protocol::client::DefaultHttpClientProvider;
use crate::providers::{
    DefaultSessionIdProvider, DefaultThreadIdProvider, SessionIdProvider, SystemTimingProvider,
    ThreadIdProvider, TimingProvider,
};
use crate::sender::registry::SessionRegistry;
use crate::sender::BeaconSender;
use crate::session::Session;

/// The embeddable monitoring agent: wires the beacon cache, the eviction
/// worker and the sending worker, and hands out sessions.
///
/// Built from a validated [`Config`]; [`Agent::start`] spawns the background
/// workers and must be called from within a tokio runtime. After
/// [`Agent::stop`] the agent only hands out inert sessions.
pub struct Agent {
    cfg: Arc<Config>,
    settings: Arc<RuntimeSettings>,
    cache: Arc<BeaconCache>,
    timing: Arc<dyn TimingProvider>,
    threads: Arc<dyn ThreadIdProvider>,
    session_ids: Arc<dyn SessionIdProvider>,
    registry: Arc<SessionRegistry>,
    sender: BeaconSender<DefaultHttpClientProvider>,
    evictor: CacheEvictor,
    evictor_cancel: CancellationToken,
    shutdown: AtomicBool,
}

impl Agent {
    pub fn new(mut cfg: Config) -> Result<Self> {
        cfg.validate()?;

        if cfg.device_id == 0 {
            cfg.device_id = rand::thread_rng().gen_range(1..=u64::MAX);
            info!(device_id = cfg.device_id, "no device id configured, generated one");
        }

        let provider = DefaultHttpClientProvider::new(&cfg)?;

        let cfg = Arc::new(cfg);
        let settings = Arc::new(RuntimeSettings::new());
        let cache = Arc::new(BeaconCache::new());
        let timing: Arc<dyn TimingProvider> = Arc::new(SystemTimingProvider::new());
        let threads: Arc<dyn ThreadIdProvider> = Arc::new(DefaultThreadIdProvider);
        let session_ids: Arc<dyn SessionIdProvider> = Arc::new(DefaultSessionIdProvider::new());
        let registry = Arc::new(SessionRegistry::new());

        let sender = BeaconSender::new(
            provider,
            Arc::clone(&timing),
            Arc::clone(&settings),
            Arc::clone(&registry),
            cfg.server_flavor.supports_time_sync(),
        );

        let evictor = CacheEvictor::new(Arc::clone(&cache), Arc::clone(&timing), cfg.cache.clone());

        Ok(Self {
            cfg,
            settings,
            cache,
            timing,
            threads,
            session_ids,
            registry,
            sender,
            evictor,
            evictor_cancel: CancellationToken::new(),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Spawn the eviction and sending workers.
    pub fn start(&mut self) {
        self.evictor.start(self.evictor_cancel.child_token());
        self.sender.initialize();

        info!(
            application = %self.cfg.application_id,
            endpoint = %self.cfg.endpoint_url,
            "agent started",
        );
    }

    /// Wait until the sender finished initialization against the cluster.
    pub async fn wait_for_init(&self) -> bool {
        self.sender.wait_for_init().await
    }

    /// Like [`Agent::wait_for_init`] with an upper bound.
    pub async fn wait_for_init_timeout(&self, timeout: Duration) -> bool {
        self.sender.wait_for_init_timeout(timeout).await
    }

    /// Open a new session. After shutdown an inert session is returned that
    /// accepts every call and records nothing.
    pub fn create_session(&self) -> Session {
        if self.shutdown.load(Ordering::SeqCst) {
            return Session::inert();
        }

        let beacon = Arc::new(Beacon::new(
            Arc::clone(&self.cache),
            Arc::clone(&self.cfg),
            Arc::clone(&self.settings),
            Arc::clone(&self.timing),
            Arc::clone(&self.threads),
            self.session_ids.next_id(),
        ));

        let session = Session::new(beacon, Arc::clone(&self.registry));
        session.start();
        self.sender.start_session(&session);

        session
    }

    /// Shut down: drain the sender through flush into terminal, then stop
    /// the eviction worker. Idempotent.
    pub async fn stop(&mut self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("agent stopping");

        self.sender.shutdown().await;

        self.evictor_cancel.cancel();
        self.evictor.stop().await;

        info!("agent stopped");
    }
}
