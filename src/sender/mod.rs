pub mod context;
pub mod registry;
pub mod states;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RuntimeSettings;
use crate::protocol::client::HttpClientProvider;
use crate::providers::TimingProvider;
use crate::session::Session;

use self::context::BeaconSendingContext;
use self::registry::SessionRegistry;

/// Owns the background worker driving the sending state machine.
///
/// [`BeaconSender::initialize`] spawns the worker; it runs until the state
/// machine reaches its terminal state, which [`BeaconSender::shutdown`]
/// triggers cooperatively (the last tick flushes all remaining sessions).
pub struct BeaconSender<P: HttpClientProvider + Send + 'static> {
    provider: Option<P>,
    timing: Arc<dyn TimingProvider>,
    settings: Arc<RuntimeSettings>,
    registry: Arc<SessionRegistry>,
    time_sync_supported: bool,

    shutdown: Arc<AtomicBool>,
    cancel: CancellationToken,
    init_tx: Option<watch::Sender<Option<bool>>>,
    init_rx: watch::Receiver<Option<bool>>,
    worker: Option<tokio::task::JoinHandle<()>>,
}

impl<P: HttpClientProvider + Send + 'static> BeaconSender<P> {
    pub fn new(
        provider: P,
        timing: Arc<dyn TimingProvider>,
        settings: Arc<RuntimeSettings>,
        registry: Arc<SessionRegistry>,
        time_sync_supported: bool,
    ) -> Self {
        let (init_tx, init_rx) = watch::channel(None);

        Self {
            provider: Some(provider),
            timing,
            settings,
            registry,
            time_sync_supported,
            shutdown: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            init_tx: Some(init_tx),
            init_rx,
            worker: None,
        }
    }

    /// Spawn the sending worker. Subsequent calls are no-ops.
    pub fn initialize(&mut self) {
        let (Some(provider), Some(init_tx)) = (self.provider.take(), self.init_tx.take()) else {
            return;
        };

        let mut ctx = BeaconSendingContext::new(
            provider,
            Arc::clone(&self.timing),
            Arc::clone(&self.settings),
            Arc::clone(&self.registry),
            self.time_sync_supported,
            Arc::clone(&self.shutdown),
            self.cancel.clone(),
            init_tx,
        );

        self.worker = Some(tokio::spawn(async move {
            info!("beacon sender started");

            while !ctx.is_in_terminal_state() {
                ctx.execute_current_state().await;
            }

            debug!("beacon sender stopped");
        }));
    }

    /// Block until initialization finished; true on success, false when it
    /// failed or was aborted by shutdown.
    pub async fn wait_for_init(&self) -> bool {
        let mut rx = self.init_rx.clone();
        let result = match rx.wait_for(|value| value.is_some()).await {
            Ok(value) => *value == Some(true),
            // Worker gone without releasing the latch.
            Err(_) => false,
        };
        result
    }

    /// Like [`BeaconSender::wait_for_init`], giving up after `timeout`.
    pub async fn wait_for_init_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_for_init())
            .await
            .unwrap_or(false)
    }

    /// Whether initialization completed successfully.
    pub fn is_initialized(&self) -> bool {
        *self.init_rx.borrow() == Some(true)
    }

    /// Request cooperative shutdown and wait for the worker to drain through
    /// flush into the terminal state.
    pub async fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.cancel.cancel();

        if let Some(worker) = self.worker.take() {
            if worker.await.is_err() {
                warn!("beacon sender worker failed");
            }
        }
    }

    /// Register a freshly started session for configuration and sending.
    pub fn start_session(&self, session: &Session) {
        self.registry.put(session.clone());
    }

    /// Mark a session finished so the next capture-on tick transmits it.
    pub fn finish_session(&self, session: &Session) {
        self.registry.finish_session(session.session_id());
    }
}
