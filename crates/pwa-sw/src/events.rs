//! Lifecycle and fetch events dispatched by the host.

use std::future::Future;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use pwa_net::{Request, Response};

use crate::ServiceWorkerError;

/// Handlers a worker registers with its host.
///
/// Each handler runs synchronously and hands any asynchronous work back to
/// the host through the event (`wait_until` / `respond_with`). A handler
/// that does nothing leaves the host default in place.
pub trait ServiceWorkerHandlers: Send + Sync {
    fn on_install(&self, _event: &mut InstallEvent) {}

    fn on_activate(&self, _event: &mut ActivateEvent) {}

    fn on_fetch(&self, _event: &mut FetchEvent) {}
}

// ==================== Extendable Event ====================

/// An event whose completion can be extended by pending work.
#[derive(Default)]
pub struct ExtendableEvent {
    pending: Vec<BoxFuture<'static, Result<(), ServiceWorkerError>>>,
}

impl ExtendableEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the event alive until `work` settles.
    pub fn wait_until<F>(&mut self, work: F)
    where
        F: Future<Output = Result<(), ServiceWorkerError>> + Send + 'static,
    {
        self.pending.push(work.boxed());
    }

    /// Number of registered extensions.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Wait for every extension. All of them run to completion; the first
    /// failure is reported.
    pub async fn settle(self) -> Result<(), ServiceWorkerError> {
        join_all(self.pending)
            .await
            .into_iter()
            .collect::<Result<Vec<()>, _>>()
            .map(|_| ())
    }
}

/// Dispatched once when a new worker version installs.
#[derive(Default)]
pub struct InstallEvent {
    extendable: ExtendableEvent,
    skip_waiting: bool,
}

impl InstallEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait_until<F>(&mut self, work: F)
    where
        F: Future<Output = Result<(), ServiceWorkerError>> + Send + 'static,
    {
        self.extendable.wait_until(work);
    }

    /// Activate as soon as install finishes instead of waiting for the
    /// current worker to stop controlling pages.
    pub fn skip_waiting(&mut self) {
        self.skip_waiting = true;
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting
    }

    pub fn into_extendable(self) -> ExtendableEvent {
        self.extendable
    }
}

/// Dispatched when a worker takes control.
#[derive(Default)]
pub struct ActivateEvent {
    extendable: ExtendableEvent,
}

impl ActivateEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait_until<F>(&mut self, work: F)
    where
        F: Future<Output = Result<(), ServiceWorkerError>> + Send + 'static,
    {
        self.extendable.wait_until(work);
    }

    pub fn into_extendable(self) -> ExtendableEvent {
        self.extendable
    }
}

// ==================== Fetch Event ====================

/// A request intercepted from a controlled page.
pub struct FetchEvent {
    request: Request,
    response: Option<BoxFuture<'static, Result<Response, ServiceWorkerError>>>,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            response: None,
        }
    }

    /// The intercepted request.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Supply the response. May be called once.
    pub fn respond_with<F>(&mut self, response: F) -> Result<(), ServiceWorkerError>
    where
        F: Future<Output = Result<Response, ServiceWorkerError>> + Send + 'static,
    {
        if self.response.is_some() {
            return Err(ServiceWorkerError::StateError(
                "respond_with already called".to_string(),
            ));
        }
        self.response = Some(response.boxed());
        Ok(())
    }

    pub fn has_response(&self) -> bool {
        self.response.is_some()
    }

    /// Split into the request and the handler's response, if any.
    pub fn into_parts(
        self,
    ) -> (
        Request,
        Option<BoxFuture<'static, Result<Response, ServiceWorkerError>>>,
    ) {
        (self.request, self.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use url::Url;

    #[tokio::test]
    async fn test_settle_runs_every_extension() {
        let done = Arc::new(AtomicUsize::new(0));
        let mut event = ExtendableEvent::new();

        for _ in 0..3 {
            let done = Arc::clone(&done);
            event.wait_until(async move {
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        assert_eq!(event.pending(), 3);

        event.settle().await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_settle_reports_failure_after_all_finish() {
        let done = Arc::new(AtomicUsize::new(0));
        let mut event = ExtendableEvent::new();

        event.wait_until(async { Err(ServiceWorkerError::StateError("boom".into())) });
        let counter = Arc::clone(&done);
        event.wait_until(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(event.settle().await.is_err());
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_event_settles() {
        assert!(ExtendableEvent::new().settle().await.is_ok());
    }

    #[test]
    fn test_skip_waiting() {
        let mut event = InstallEvent::new();
        assert!(!event.skip_waiting_requested());
        event.skip_waiting();
        assert!(event.skip_waiting_requested());
    }

    #[tokio::test]
    async fn test_respond_with_twice_fails() {
        let url = Url::parse("https://example.com/page/").unwrap();
        let mut event = FetchEvent::new(Request::get(url.clone()));
        let response = Response::new(url, StatusCode::OK, "page");

        let first = response.clone();
        event.respond_with(async move { Ok(first) }).unwrap();
        let second = event.respond_with(async move { Ok(response) });
        assert!(matches!(second, Err(ServiceWorkerError::StateError(_))));

        let (request, pending) = event.into_parts();
        assert_eq!(request.url.path(), "/page/");
        let body = pending.unwrap().await.unwrap();
        assert_eq!(body.text().unwrap(), "page");
    }
}
