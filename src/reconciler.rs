//! The Endpoints discoverer run loop.
//!
//! Waits for every cache to sync, then reconciles one queued key at a time
//! until cancelled: a missing Endpoints object yields a tombstone group, an
//! existing one a freshly built group.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use crate::builder::{Caches, build_target_group};
use crate::error::{Error, Result};
use crate::key::ResourceKey;
use crate::metrics::EventMetrics;
use crate::queue::WorkQueue;
use crate::router::ChangeRouter;
use crate::target_group::{TargetGroup, endpoints_source};

const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Discovers scrape targets from Endpoints objects.
pub struct EndpointsDiscovery {
    caches: Caches,
    queue: Arc<WorkQueue<ResourceKey>>,
    router: Arc<ChangeRouter>,
    sync_timeout: Option<Duration>,
}

impl EndpointsDiscovery {
    /// Creates a discoverer over `caches`, counting routed events in `metrics`.
    #[must_use]
    pub fn new(caches: Caches, metrics: Arc<dyn EventMetrics>) -> Self {
        let queue = Arc::new(WorkQueue::new());
        let router = Arc::new(ChangeRouter::new(
            caches.endpoints.clone(),
            queue.clone(),
            metrics,
        ));

        Self {
            caches,
            queue,
            router,
            sync_timeout: None,
        }
    }

    /// Gives up if the caches have not synced within `timeout`.
    #[must_use]
    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = Some(timeout);
        self
    }

    /// The router that cache notifications must be delivered to.
    #[must_use]
    pub fn router(&self) -> Arc<ChangeRouter> {
        self.router.clone()
    }

    /// Runs until `cancel` fires or the receiving side of `tx` is dropped.
    ///
    /// Delivery on `tx` may wait for the receiver; reconciliation waits with it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheSync`] if the caches did not sync within the
    /// configured timeout. Cancellation is not an error.
    pub async fn run(&self, cancel: CancellationToken, tx: Sender<TargetGroup>) -> Result<()> {
        let synced = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            synced = self.wait_for_sync() => synced,
        };

        if !synced {
            tracing::error!("endpoints informer unable to sync cache");
            return Err(Error::CacheSync);
        }

        tracing::debug!("endpoints caches synced, starting reconciliation");

        tokio::select! {
            () = cancel.cancelled() => {}
            () = self.worker(&tx) => {}
        }

        self.queue.shut_down();
        Ok(())
    }

    /// Returns `false` if the sync timeout elapsed first.
    async fn wait_for_sync(&self) -> bool {
        let poll = async {
            let mut interval = tokio::time::interval(SYNC_POLL_INTERVAL);
            while !self.caches.has_synced() {
                interval.tick().await;
            }
        };

        match self.sync_timeout {
            Some(timeout) => tokio::time::timeout(timeout, poll).await.is_ok(),
            None => {
                poll.await;
                true
            }
        }
    }

    async fn worker(&self, tx: &Sender<TargetGroup>) {
        while self.process(tx).await {}
    }

    /// Handles one queued key. Returns `false` when the loop should stop.
    async fn process(&self, tx: &Sender<TargetGroup>) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let group = self.reconcile(&key);
        self.queue.done(&key);

        let Some(group) = group else {
            return true;
        };

        if tx.send(group).await.is_err() {
            tracing::warn!("target group channel closed, stopping endpoints discovery");
            return false;
        }

        true
    }

    fn reconcile(&self, key: &ResourceKey) -> Option<TargetGroup> {
        let (namespace, name) = match key.split() {
            Ok(parts) => parts,
            Err(e) => {
                tracing::error!(%key, "splitting key failed: {e}");
                return None;
            }
        };

        match self.caches.endpoints.get(key) {
            Ok(Some(eps)) => {
                tracing::debug!(%key, "building target group");
                Some(build_target_group(&self.caches, &eps))
            }
            Ok(None) => {
                tracing::debug!(%key, "endpoints gone, sending tombstone");
                Some(TargetGroup::tombstone(endpoints_source(namespace, name)))
            }
            Err(e) => {
                tracing::error!(%key, "getting object from store failed: {e}");
                None
            }
        }
    }
}
