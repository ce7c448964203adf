//! Host side of the worker lifecycle.
//!
//! The host registers worker versions, dispatches their install and activate
//! events, waits for the work those events were extended with, and routes
//! fetches from controlled pages to the active worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pwa_common::with_timeout;
use pwa_net::{Fetcher, Request, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::events::{ActivateEvent, ExtendableEvent, FetchEvent, InstallEvent, ServiceWorkerHandlers};
use crate::ServiceWorkerError;

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Initial state, script loaded.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}

/// A service worker instance.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Script URL.
    pub script_url: Url,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Error message if install failed.
    pub error: Option<String>,

    /// Time of last state change.
    pub state_changed_at: Instant,
}

impl ServiceWorker {
    /// Create a new service worker.
    pub fn new(script_url: Url) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            script_url,
            state: ServiceWorkerState::Parsed,
            error: None,
            state_changed_at: Instant::now(),
        }
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// Whether fetches from controlled pages are routed to this worker.
    /// An activating worker already controls the scope.
    pub fn handles_fetches(&self) -> bool {
        matches!(
            self.state,
            ServiceWorkerState::Activating | ServiceWorkerState::Activated
        )
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceWorkerEvent {
    /// State changed.
    StateChange {
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A new version started installing.
    UpdateFound { script_url: Url },
    /// A worker took control of the scope.
    ControllerChange { worker_id: ServiceWorkerId },
}

// ==================== Registration ====================

struct WorkerSlot {
    worker: ServiceWorker,
    handlers: Arc<dyn ServiceWorkerHandlers>,
}

#[derive(Default)]
struct Registration {
    installing: Option<WorkerSlot>,
    waiting: Option<WorkerSlot>,
    active: Option<WorkerSlot>,
}

// ==================== Host ====================

/// Registers workers for one scope and dispatches their events.
pub struct ServiceWorkerHost {
    scope: Url,
    network: Arc<dyn Fetcher>,
    registration: RwLock<Registration>,
    event_timeout: Option<Duration>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerHost {
    /// Create a host for a scope.
    pub fn new(
        scope: Url,
        network: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                scope,
                network,
                registration: RwLock::new(Registration::default()),
                event_timeout: None,
                event_tx,
            },
            event_rx,
        )
    }

    /// Bound how long an extended event may take to settle.
    pub fn with_event_timeout(mut self, timeout: Duration) -> Self {
        self.event_timeout = Some(timeout);
        self
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    /// Install a new worker version and, when allowed, activate it.
    ///
    /// The worker activates straight away if its install handler called
    /// `skip_waiting` or nothing is active yet; otherwise it is left waiting.
    pub async fn register(
        &self,
        script_url: &str,
        handlers: Arc<dyn ServiceWorkerHandlers>,
    ) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let script_url = self
            .scope
            .join(script_url)
            .map_err(|e| ServiceWorkerError::Config(format!("invalid script URL: {e}")))?;

        let mut worker = ServiceWorker::new(script_url.clone());
        let id = worker.id;
        self.emit(ServiceWorkerEvent::UpdateFound { script_url });
        self.transition(&mut worker, ServiceWorkerState::Installing);

        let mut event = InstallEvent::new();
        handlers.on_install(&mut event);
        let skip_waiting = event.skip_waiting_requested();

        {
            let mut registration = self.registration.write().await;
            if let Some(mut previous) = registration.installing.take() {
                self.transition(&mut previous.worker, ServiceWorkerState::Redundant);
            }
            registration.installing = Some(WorkerSlot { worker, handlers });
        }

        let outcome = self.settle(event.into_extendable()).await;

        let mut registration = self.registration.write().await;
        let is_current = registration
            .installing
            .as_ref()
            .is_some_and(|slot| slot.worker.id == id);
        let slot = if is_current {
            registration.installing.take()
        } else {
            None
        };
        let Some(mut slot) = slot else {
            return Err(ServiceWorkerError::StateError(
                "install superseded by a newer registration".to_string(),
            ));
        };

        if let Err(e) = outcome {
            error!(worker = ?id, error = %e, "Install failed");
            slot.worker.error = Some(e.to_string());
            self.transition(&mut slot.worker, ServiceWorkerState::Redundant);
            return Err(e);
        }

        self.transition(&mut slot.worker, ServiceWorkerState::Installed);
        if let Some(mut previous) = registration.waiting.replace(slot) {
            self.transition(&mut previous.worker, ServiceWorkerState::Redundant);
        }
        let has_active = registration.active.is_some();
        drop(registration);

        if skip_waiting || !has_active {
            self.activate_waiting().await?;
        } else {
            info!(worker = ?id, "Installed, waiting for activation");
        }

        Ok(id)
    }

    /// Promote the waiting worker, if any, and run its activate event.
    ///
    /// A failed activate event is logged; the worker still takes control.
    pub async fn activate_waiting(&self) -> Result<bool, ServiceWorkerError> {
        let handlers = {
            let mut registration = self.registration.write().await;
            let Some(mut slot) = registration.waiting.take() else {
                return Ok(false);
            };
            if let Some(mut old) = registration.active.take() {
                self.transition(&mut old.worker, ServiceWorkerState::Redundant);
            }
            self.transition(&mut slot.worker, ServiceWorkerState::Activating);
            let handlers = Arc::clone(&slot.handlers);
            registration.active = Some(slot);
            handlers
        };

        let mut event = ActivateEvent::new();
        handlers.on_activate(&mut event);
        let outcome = self.settle(event.into_extendable()).await;

        let mut registration = self.registration.write().await;
        let Some(slot) = registration.active.as_mut() else {
            return Ok(false);
        };
        if let Err(e) = outcome {
            warn!(worker = ?slot.worker.id, error = %e, "Activate event failed");
        }
        self.transition(&mut slot.worker, ServiceWorkerState::Activated);
        let worker_id = slot.worker.id;
        drop(registration);

        info!(worker = ?worker_id, "Worker activated");
        self.emit(ServiceWorkerEvent::ControllerChange { worker_id });
        Ok(true)
    }

    /// Route a request from a controlled page.
    ///
    /// Requests outside the scope, or made while nothing is active, go
    /// straight to the network. A worker that does not respond leaves the
    /// request to the network as well.
    pub async fn fetch(&self, request: Request) -> Result<Response, ServiceWorkerError> {
        let handlers = if self.in_scope(&request.url) {
            let registration = self.registration.read().await;
            registration
                .active
                .as_ref()
                .filter(|slot| slot.worker.handles_fetches())
                .map(|slot| Arc::clone(&slot.handlers))
        } else {
            None
        };

        let Some(handlers) = handlers else {
            return Ok(self.network.fetch(request).await?);
        };

        let mut event = FetchEvent::new(request);
        handlers.on_fetch(&mut event);
        let (request, pending) = event.into_parts();

        match pending {
            Some(response) => match self.event_timeout {
                Some(timeout) => with_timeout(timeout, || response).await?,
                None => response.await,
            },
            None => {
                debug!(url = %request.url, "No response from worker, using network");
                Ok(self.network.fetch(request).await?)
            }
        }
    }

    /// Mark every worker redundant and forget them.
    pub async fn unregister(&self) -> bool {
        let mut registration = self.registration.write().await;
        let mut found = false;
        for mut slot in [
            registration.installing.take(),
            registration.waiting.take(),
            registration.active.take(),
        ]
        .into_iter()
        .flatten()
        {
            self.transition(&mut slot.worker, ServiceWorkerState::Redundant);
            found = true;
        }
        found
    }

    /// The worker controlling the scope.
    pub async fn active(&self) -> Option<ServiceWorker> {
        let registration = self.registration.read().await;
        registration.active.as_ref().map(|slot| slot.worker.clone())
    }

    /// The installed worker waiting to take control.
    pub async fn waiting(&self) -> Option<ServiceWorker> {
        let registration = self.registration.read().await;
        registration.waiting.as_ref().map(|slot| slot.worker.clone())
    }

    fn in_scope(&self, url: &Url) -> bool {
        url.as_str().starts_with(self.scope.as_str())
    }

    async fn settle(&self, event: ExtendableEvent) -> Result<(), ServiceWorkerError> {
        match self.event_timeout {
            Some(timeout) => with_timeout(timeout, || event.settle()).await?,
            None => event.settle().await,
        }
    }

    fn transition(&self, worker: &mut ServiceWorker, state: ServiceWorkerState) {
        debug!(worker = ?worker.id, from = ?worker.state, to = ?state, "State change");
        worker.set_state(state);
        self.emit(ServiceWorkerEvent::StateChange {
            worker_id: worker.id,
            new_state: state,
        });
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        let _ = self.event_tx.send(event);
    }
}
