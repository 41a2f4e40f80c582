//! Fleet enrollment record lifecycle.
//!
//! # State Transitions
//!
//! ```text
//! Absent
//!     ↓ (create)
//! Enabled
//!     ↓ (delete)
//! Absent
//!     ↓ (create, bound to the latest root)
//! Enabled
//! ```
//!
//! Devices may only be made while the record is Enabled.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skytrust_core::{Error, Result};
use skytrust_crypto::Certificate;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Enrollment record status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnrollmentStatus {
    Absent,
    Enabled,
    Disabled,
}

/// Group enrollment bound to an attestation root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentRecord {
    pub name: String,
    /// Public-only root that devices chain up to
    pub attestation_root: Certificate,
    pub status: EnrollmentStatus,
}

/// Remote owner of enrollment records.
#[async_trait]
pub trait EnrollmentService: Send + Sync {
    /// `CollaboratorNotFound` when no record named `name` exists.
    async fn get_enrollment_record(&self, name: &str) -> Result<EnrollmentRecord>;

    /// Create or replace the record, requesting Enabled.
    async fn create_or_update_enrollment_record(
        &self,
        name: &str,
        attestation_root: &Certificate,
    ) -> Result<EnrollmentRecord>;

    /// `CollaboratorNotFound` when the record is already gone.
    async fn delete_enrollment_record(&self, record: &EnrollmentRecord) -> Result<()>;
}

pub struct EnrollmentOrchestrator {
    service: Arc<dyn EnrollmentService>,
    name: String,
    // one lifecycle operation at a time
    op_lock: Mutex<()>,
    status: RwLock<EnrollmentStatus>,
    ready: AtomicBool,
}

impl EnrollmentOrchestrator {
    pub fn new(service: Arc<dyn EnrollmentService>, name: impl Into<String>) -> Self {
        Self {
            service,
            name: name.into(),
            op_lock: Mutex::new(()),
            status: RwLock::new(EnrollmentStatus::Absent),
            ready: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace any existing record with one bound to `attestation_root`.
    ///
    /// Returns whether the new record is Enabled.
    pub async fn clean_up_and_create(&self, attestation_root: &Certificate) -> Result<bool> {
        let _op = self.op_lock.lock().await;
        self.ready.store(false, Ordering::SeqCst);

        match self.service.get_enrollment_record(&self.name).await {
            Ok(existing) => {
                info!(enrollment = %self.name, status = ?existing.status, "Removing previous enrollment");
                self.delete_record(&existing).await?;
            }
            Err(e) if e.is_not_found() => {
                info!(enrollment = %self.name, "No previous enrollment");
            }
            Err(e) => {
                warn!(enrollment = %self.name, error = %e, "Enrollment lookup failed");
                return Err(e);
            }
        }
        self.set_status(EnrollmentStatus::Absent);

        let record = self
            .service
            .create_or_update_enrollment_record(&self.name, attestation_root)
            .await
            .map_err(|e| {
                warn!(enrollment = %self.name, error = %e, "Enrollment creation failed");
                e
            })?;
        self.set_status(record.status);

        let ready = record.status == EnrollmentStatus::Enabled;
        self.ready.store(ready, Ordering::SeqCst);
        info!(
            enrollment = %self.name,
            root = %attestation_root.subject(),
            status = ?record.status,
            ready,
            "STATUS: EnrollmentOrchestrator :: Record created :: ACTIVE"
        );
        Ok(ready)
    }

    /// Remove the current record, if any.
    pub async fn delete(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.ready.store(false, Ordering::SeqCst);

        match self.service.get_enrollment_record(&self.name).await {
            Ok(existing) => self.delete_record(&existing).await?,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.set_status(EnrollmentStatus::Absent);
        info!(enrollment = %self.name, "Enrollment deleted");
        Ok(())
    }

    pub fn status(&self) -> EnrollmentStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn delete_record(&self, record: &EnrollmentRecord) -> Result<()> {
        match self.service.delete_enrollment_record(record).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                warn!(enrollment = %self.name, error = %e, "Enrollment deletion failed");
                Err(e)
            }
        }
    }

    fn set_status(&self, status: EnrollmentStatus) {
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = status;
    }
}

/// Require an Enabled enrollment.
pub(crate) fn ensure_ready(orchestrator: &EnrollmentOrchestrator) -> Result<()> {
    if orchestrator.is_ready() {
        Ok(())
    } else {
        Err(Error::NotReady(format!(
            "enrollment {} is not enabled",
            orchestrator.name()
        )))
    }
}
