//! Fleet-scale minting and deregistration.
//!
//! One task per device, bounded by a semaphore. A failed item is logged and
//! counted; it never cancels its siblings. Cancellation stops new items
//! from starting and lets in-flight ones finish.

use crate::device::IotDevice;
use crate::provisioning::DeviceRegistry;
use crate::supply_chain::IotCompany;
use serde::Serialize;
use skytrust_core::{BulkConfig, Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Counters shared with every worker.
#[derive(Debug, Default)]
pub struct BulkProgress {
    pub started: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
}

/// Point-in-time copy of [`BulkProgress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl BulkProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            started: self.started.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }

    fn start(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn succeed(&self) {
        self.succeeded.fetch_add(1, Ordering::SeqCst);
    }

    fn fail(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Cloneable stop request for bulk operations.
#[derive(Clone)]
pub struct CancelSignal {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once cancelled.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // Sender lives in self, so the channel cannot close here
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

async fn next_permit(semaphore: &Arc<Semaphore>, cancel: &CancelSignal) -> Option<OwnedSemaphorePermit> {
    if cancel.is_cancelled() {
        return None;
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        permit = semaphore.clone().acquire_owned() => permit.ok(),
    }
}

fn semaphore_for(config: &BulkConfig) -> Result<Arc<Semaphore>> {
    if config.concurrency == 0 {
        return Err(Error::Configuration(
            "bulk.concurrency must be positive".to_string(),
        ));
    }
    Ok(Arc::new(Semaphore::new(config.concurrency)))
}

/// Make up to `count` devices through `company`.
///
/// Returns every device that was made. A device the hub did not assign is
/// still returned, so its key can be retried or disposed, but it counts as
/// failed. Errors are only counted.
pub async fn mint_devices(
    company: Arc<IotCompany>,
    count: usize,
    endpoint: &str,
    scope_id: &str,
    config: &BulkConfig,
    cancel: &CancelSignal,
    progress: Arc<BulkProgress>,
) -> Result<Vec<IotDevice>> {
    let semaphore = semaphore_for(config)?;
    let mut tasks = JoinSet::new();

    for index in 0..count {
        let permit = match next_permit(&semaphore, cancel).await {
            Some(permit) => permit,
            None => {
                info!(spawned = index, requested = count, "Minting cancelled");
                break;
            }
        };
        progress.start();

        let company = company.clone();
        let progress = progress.clone();
        let endpoint = endpoint.to_string();
        let scope_id = scope_id.to_string();
        tasks.spawn(async move {
            let _permit = permit;
            match company.make_device(&endpoint, &scope_id).await {
                Ok(device) if device.is_ready() => {
                    progress.succeed();
                    Some(device)
                }
                Ok(device) => {
                    warn!(
                        index,
                        device_id = %device.device_id(),
                        state = ?device.provisioning_state(),
                        "Device not assigned"
                    );
                    progress.fail();
                    Some(device)
                }
                Err(e) => {
                    warn!(index, error = %e, "Device mint failed");
                    progress.fail();
                    None
                }
            }
        });
    }

    let mut devices = Vec::with_capacity(count);
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Some(device)) => devices.push(device),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Mint task aborted");
                progress.fail();
            }
        }
    }

    let snapshot = progress.snapshot();
    info!(
        started = snapshot.started,
        succeeded = snapshot.succeeded,
        failed = snapshot.failed,
        "Bulk mint complete"
    );
    Ok(devices)
}

/// Page through `registry` and remove every device.
///
/// A device that is already gone counts as removed. A failed page listing
/// stops the walk and is returned after in-flight removals finish.
pub async fn deregister_devices(
    registry: Arc<dyn DeviceRegistry>,
    config: &BulkConfig,
    cancel: &CancelSignal,
    progress: Arc<BulkProgress>,
) -> Result<()> {
    let semaphore = semaphore_for(config)?;
    let mut tasks = JoinSet::new();
    let mut continuation = None;

    let walk = loop {
        if cancel.is_cancelled() {
            info!("Deregistration cancelled");
            break Ok(());
        }
        let page = match registry.list_devices(config.page_size, continuation.take()).await {
            Ok(page) => page,
            Err(e) => break Err(e),
        };

        for device_id in page.device_ids {
            let permit = match next_permit(&semaphore, cancel).await {
                Some(permit) => permit,
                None => break,
            };
            progress.start();

            let registry = registry.clone();
            let progress = progress.clone();
            tasks.spawn(async move {
                let _permit = permit;
                match registry.remove_device(&device_id).await {
                    Ok(()) => progress.succeed(),
                    Err(e) if e.is_not_found() => progress.succeed(),
                    Err(e) => {
                        warn!(device_id = %device_id, error = %e, "Device removal failed");
                        progress.fail();
                    }
                }
            });
        }

        match page.continuation {
            Some(next) => continuation = Some(next),
            None => break Ok(()),
        }
    };

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Removal task aborted");
            progress.fail();
        }
    }

    let snapshot = progress.snapshot();
    info!(
        started = snapshot.started,
        succeeded = snapshot.succeeded,
        failed = snapshot.failed,
        "Bulk deregistration complete"
    );
    walk
}
