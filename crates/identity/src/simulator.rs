//! In-process collaborators.
//!
//! [`LocalEnrollmentService`] keeps enrollment records in memory.
//! [`LocalProvisioningHub`] registers devices whose chain ends at the
//! enrolled root, verifies device message signatures and lists registered
//! devices. Both support one-shot failure injection.

use crate::enrollment::{EnrollmentRecord, EnrollmentService, EnrollmentStatus};
use crate::provisioning::{
    DeviceCredential, DevicePage, DeviceRegistry, MessagingService, ProvisioningResult,
    RegistrationService, RegistrationStatus,
};
use crate::supply_chain::Collaborators;
use crate::trust_store::TrustStore;
use async_trait::async_trait;
use skytrust_core::{Error, Result};
use skytrust_crypto::{Certificate, ChainPolicy, ChainValidator};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// One-shot injected failure.
#[derive(Default)]
struct FailureSwitch(Mutex<Option<String>>);

impl FailureSwitch {
    fn arm(&self, message: &str) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.to_string());
    }

    fn check(&self) -> Result<()> {
        match self.0.lock().unwrap_or_else(|e| e.into_inner()).take() {
            Some(message) => Err(Error::CollaboratorFailure(message)),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct LocalEnrollmentService {
    records: RwLock<HashMap<String, EnrollmentRecord>>,
    failure: FailureSwitch,
    create_disabled: AtomicBool,
    delete_calls: AtomicUsize,
}

impl LocalEnrollmentService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call with `CollaboratorFailure(message)`.
    pub fn fail_next(&self, message: &str) {
        self.failure.arm(message);
    }

    /// Create new records as Disabled instead of Enabled.
    pub fn create_disabled(&self, disabled: bool) {
        self.create_disabled.store(disabled, Ordering::SeqCst);
    }

    pub fn record_count(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnrollmentService for LocalEnrollmentService {
    async fn get_enrollment_record(&self, name: &str) -> Result<EnrollmentRecord> {
        self.failure.check()?;
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| Error::CollaboratorNotFound(format!("enrollment {}", name)))
    }

    async fn create_or_update_enrollment_record(
        &self,
        name: &str,
        attestation_root: &Certificate,
    ) -> Result<EnrollmentRecord> {
        self.failure.check()?;
        let status = if self.create_disabled.load(Ordering::SeqCst) {
            EnrollmentStatus::Disabled
        } else {
            EnrollmentStatus::Enabled
        };
        let record = EnrollmentRecord {
            name: name.to_string(),
            attestation_root: attestation_root.clone(),
            status,
        };
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), record.clone());
        debug!(enrollment = %name, ?status, "Local enrollment stored");
        Ok(record)
    }

    async fn delete_enrollment_record(&self, record: &EnrollmentRecord) -> Result<()> {
        self.failure.check()?;
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&record.name)
            .map(|_| ())
            .ok_or_else(|| Error::CollaboratorNotFound(format!("enrollment {}", record.name)))
    }
}

/// Message accepted by the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub device_id: String,
    pub hub: String,
    pub payload: Vec<u8>,
}

pub struct LocalProvisioningHub {
    enrollment: Arc<dyn EnrollmentService>,
    enrollment_name: String,
    hub_name: String,
    devices: RwLock<BTreeMap<String, Certificate>>,
    messages: Mutex<Vec<ReceivedMessage>>,
    failure: FailureSwitch,
}

impl LocalProvisioningHub {
    /// Admit devices chaining to the root of enrollment `enrollment_name`
    /// and assign them to `hub_name`.
    pub fn new(
        enrollment: Arc<dyn EnrollmentService>,
        enrollment_name: impl Into<String>,
        hub_name: impl Into<String>,
    ) -> Self {
        Self {
            enrollment,
            enrollment_name: enrollment_name.into(),
            hub_name: hub_name.into(),
            devices: RwLock::new(BTreeMap::new()),
            messages: Mutex::new(Vec::new()),
            failure: FailureSwitch::default(),
        }
    }

    pub fn hub_name(&self) -> &str {
        &self.hub_name
    }

    /// Fail the next hub call with `CollaboratorFailure(message)`.
    pub fn fail_next(&self, message: &str) {
        self.failure.arm(message);
    }

    pub fn registered_devices(&self) -> Vec<String> {
        self.devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn messages(&self) -> Vec<ReceivedMessage> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn enrolled_root(&self) -> Result<Option<Certificate>> {
        match self
            .enrollment
            .get_enrollment_record(&self.enrollment_name)
            .await
        {
            Ok(record) if record.status == EnrollmentStatus::Enabled => {
                Ok(Some(record.attestation_root))
            }
            Ok(_) => Ok(None),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn rejected(device_id: String, reason: &str) -> ProvisioningResult {
        warn!(device_id = %device_id, reason, "Registration rejected");
        ProvisioningResult {
            device_id,
            assigned_hub: None,
            status: RegistrationStatus::Failed,
        }
    }
}

#[async_trait]
impl RegistrationService for LocalProvisioningHub {
    async fn register(
        &self,
        endpoint: &str,
        scope_id: &str,
        leaf: &Certificate,
        chain: &[Certificate],
    ) -> Result<ProvisioningResult> {
        self.failure.check()?;
        let device_id = leaf
            .common_name()
            .map(str::to_string)
            .ok_or_else(|| Error::InvalidRequest(format!("{} has no common name", leaf.subject())))?;

        let root = match self.enrolled_root().await? {
            Some(root) => root,
            None => return Ok(Self::rejected(device_id, "no enabled enrollment")),
        };
        if !leaf.has_client_auth() {
            return Ok(Self::rejected(device_id, "leaf lacks clientAuth"));
        }

        let mut presented = chain.to_vec();
        presented.push(leaf.clone());
        if let Err(e) = ChainValidator::new(ChainPolicy::pinned(&root)).validate(&presented) {
            return Ok(Self::rejected(device_id, &e.to_string()));
        }

        self.devices
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device_id.clone(), leaf.clone());
        info!(
            device_id = %device_id,
            hub = %self.hub_name,
            endpoint,
            scope_id,
            "Device assigned"
        );
        Ok(ProvisioningResult {
            device_id,
            assigned_hub: Some(self.hub_name.clone()),
            status: RegistrationStatus::Assigned,
        })
    }
}

#[async_trait]
impl MessagingService for LocalProvisioningHub {
    async fn send(&self, credential: &DeviceCredential, payload: &[u8]) -> Result<()> {
        self.failure.check()?;
        let registered = self
            .devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&credential.device_id)
            .cloned()
            .ok_or_else(|| {
                Error::CollaboratorFailure(format!("unknown device {}", credential.device_id))
            })?;

        if registered != credential.certificate {
            return Err(Error::CollaboratorFailure(format!(
                "certificate mismatch for {}",
                credential.device_id
            )));
        }
        registered
            .public_key()
            .verify(payload, &credential.signature)
            .map_err(|e| {
                Error::CollaboratorFailure(format!(
                    "signature rejected for {}: {}",
                    credential.device_id, e
                ))
            })?;

        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ReceivedMessage {
                device_id: credential.device_id.clone(),
                hub: credential.hub.clone(),
                payload: payload.to_vec(),
            });
        Ok(())
    }
}

#[async_trait]
impl DeviceRegistry for LocalProvisioningHub {
    async fn list_devices(
        &self,
        page_size: usize,
        continuation: Option<String>,
    ) -> Result<DevicePage> {
        self.failure.check()?;
        if page_size == 0 {
            return Err(Error::InvalidRequest("page size must be positive".to_string()));
        }

        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        let start = match continuation {
            Some(last) => Bound::Excluded(last),
            None => Bound::Unbounded,
        };
        let mut remaining = devices.range((start, Bound::Unbounded)).map(|(id, _)| id);
        let device_ids: Vec<String> = remaining.by_ref().take(page_size).cloned().collect();
        let continuation = match remaining.next() {
            Some(_) => device_ids.last().cloned(),
            None => None,
        };
        Ok(DevicePage {
            device_ids,
            continuation,
        })
    }

    async fn remove_device(&self, device_id: &str) -> Result<()> {
        self.failure.check()?;
        let removed = self
            .devices
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(device_id);
        match removed {
            Some(_) => {
                debug!(device_id, "Device removed");
                Ok(())
            }
            None => Err(Error::CollaboratorNotFound(format!("device {}", device_id))),
        }
    }
}

/// Enrollment service and hub sharing one record store.
pub struct LocalCollaborators {
    pub enrollment: Arc<LocalEnrollmentService>,
    pub hub: Arc<LocalProvisioningHub>,
}

impl LocalCollaborators {
    pub fn new(enrollment_name: &str, hub_name: &str) -> Self {
        let enrollment = Arc::new(LocalEnrollmentService::new());
        let hub = Arc::new(LocalProvisioningHub::new(
            enrollment.clone(),
            enrollment_name,
            hub_name,
        ));
        info!(enrollment = %enrollment_name, hub = %hub_name, "Using local collaborators");
        Self { enrollment, hub }
    }

    pub fn collaborators(&self, trust_store: Arc<dyn TrustStore>) -> Collaborators {
        Collaborators {
            enrollment: self.enrollment.clone(),
            registration: self.hub.clone(),
            messaging: self.hub.clone(),
            registry: self.hub.clone(),
            trust_store,
        }
    }
}
