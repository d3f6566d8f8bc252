use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::types::{GroupCommitRequest, ShutdownToken};
use super::watermark::AckWatermark;

/// Interval between service passes when no request arrives.
const IDLE_TICK: Duration = Duration::from_millis(10);

/// Wait between re-checks of one unsatisfied request.
const RECHECK_WAIT: Duration = Duration::from_millis(1000);

/// Parks producers until the ack watermark passes their offset.
///
/// Producers enqueue requests on `ingress`; the service loop swaps the
/// ingress list against a working list so producers never block on the
/// service's processing. Each request is re-checked against the watermark a
/// bounded number of times before timing out.
pub struct GroupTransferService {
    watermark: Arc<AckWatermark>,
    ingress: Mutex<Vec<GroupCommitRequest>>,
    wakeup: Notify,
    max_rechecks: u32,
    token: ShutdownToken,
}

impl GroupTransferService {
    pub fn new(watermark: Arc<AckWatermark>, sync_flush_timeout_ms: u64) -> Arc<Self> {
        // One bounded wait per recheck; the configured timeout is the total.
        let max_rechecks = (sync_flush_timeout_ms / RECHECK_WAIT.as_millis() as u64).max(1) as u32;
        Arc::new(Self {
            watermark,
            ingress: Mutex::new(Vec::new()),
            wakeup: Notify::new(),
            max_rechecks,
            token: ShutdownToken::new(),
        })
    }

    /// Non-blocking enqueue from a producer thread.
    pub fn put_request(&self, request: GroupCommitRequest) {
        self.ingress.lock().push(request);
        self.wakeup.notify_one();
    }

    pub fn start(self: &Arc<Self>) {
        let service = Arc::clone(self);
        tokio::spawn(service.run());
    }

    pub fn shutdown(&self) {
        self.token.shutdown();
        self.wakeup.notify_one();
    }

    async fn run(self: Arc<Self>) {
        info!("group transfer service started");

        let mut working: Vec<GroupCommitRequest> = Vec::new();
        while !self.token.is_shutdown() {
            let _ = tokio::time::timeout(IDLE_TICK, self.wakeup.notified()).await;

            std::mem::swap(&mut working, &mut *self.ingress.lock());
            if working.is_empty() {
                continue;
            }

            debug!("processing {} group commit requests", working.len());
            for request in working.drain(..) {
                self.wait_transfer(request).await;
            }
        }

        // Anything still queued at shutdown resolves as timed out.
        working.extend(self.ingress.lock().drain(..));
        for request in working.drain(..) {
            request.complete(false);
        }

        info!("group transfer service stopped");
    }

    async fn wait_transfer(&self, request: GroupCommitRequest) {
        let mut transfer_ok = self.watermark.current() >= request.next_offset;

        let mut recheck = 0;
        while !transfer_ok && recheck < self.max_rechecks && !self.token.is_shutdown() {
            self.watermark.wait_for_advance(RECHECK_WAIT).await;
            transfer_ok = self.watermark.current() >= request.next_offset;
            recheck += 1;
        }

        if !transfer_ok {
            warn!(
                "transfer to slave timed out waiting for offset {}",
                request.next_offset
            );
        }

        request.complete(transfer_ok);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn service_with_timeout(timeout_ms: u64) -> (Arc<GroupTransferService>, Arc<AckWatermark>) {
        let watermark = Arc::new(AckWatermark::new());
        let service = GroupTransferService::new(Arc::clone(&watermark), timeout_ms);
        service.start();
        (service, watermark)
    }

    #[tokio::test]
    async fn test_request_already_satisfied() {
        let (service, watermark) = service_with_timeout(5000);
        watermark.advance_to(100);

        let (request, done) = GroupCommitRequest::new(80);
        service.put_request(request);

        let ok = tokio::time::timeout(Duration::from_secs(1), done)
            .await
            .unwrap()
            .unwrap();
        assert!(ok);
        service.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_request_satisfied_by_later_advance() {
        let (service, watermark) = service_with_timeout(5000);
        watermark.advance_to(50);

        let (request, done) = GroupCommitRequest::new(80);
        service.put_request(request);

        tokio::time::sleep(Duration::from_millis(100)).await;
        watermark.advance_to(80);

        let started = Instant::now();
        let ok = tokio::time::timeout(Duration::from_secs(3), done)
            .await
            .unwrap()
            .unwrap();
        assert!(ok);
        // The wakeup follows the advance within one re-check interval.
        assert!(started.elapsed() < Duration::from_secs(2));
        service.shutdown();
    }

    #[tokio::test]
    async fn test_request_times_out() {
        // One-second budget keeps the test short: a single recheck.
        let (service, watermark) = service_with_timeout(1000);
        watermark.advance_to(50);

        let (request, done) = GroupCommitRequest::new(80);
        service.put_request(request);

        let ok = tokio::time::timeout(Duration::from_secs(5), done)
            .await
            .unwrap()
            .unwrap();
        assert!(!ok);
        service.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_fails_queued_requests() {
        let watermark = Arc::new(AckWatermark::new());
        let service = GroupTransferService::new(Arc::clone(&watermark), 5000);

        // Enqueue before the loop ever runs, then start and stop.
        let (request, done) = GroupCommitRequest::new(80);
        service.put_request(request);
        service.start();
        service.shutdown();

        let ok = tokio::time::timeout(Duration::from_secs(3), done)
            .await
            .unwrap()
            .unwrap();
        assert!(!ok);
    }
}
