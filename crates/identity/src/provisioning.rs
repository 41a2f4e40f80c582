//! Device registration against the provisioning service.
//!
//! # State Transitions
//!
//! ```text
//! NotProvisioned
//!     ↓ (provision)
//! Registering
//!     ↓
//! Assigned | Unassigned | Failed
//! ```
//!
//! Only an Assigned device may authenticate and send messages. Every
//! transition is kept in a bounded audit history.

use crate::hsm::DeviceHsm;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skytrust_core::{Error, Result};
use skytrust_crypto::Certificate;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Maximum number of state transitions to track in history.
const MAX_HISTORY_SIZE: usize = 100;

/// Registration status reported by the provisioning service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationStatus {
    Unassigned,
    Assigning,
    Assigned,
    Failed,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningResult {
    pub device_id: String,
    pub assigned_hub: Option<String>,
    pub status: RegistrationStatus,
}

/// Provisioning state of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisioningState {
    NotProvisioned,
    Registering {
        endpoint: String,
        scope_id: String,
    },
    Assigned {
        device_id: String,
        hub: String,
    },
    /// Registered but not (yet) assigned, or disabled by the service
    Unassigned {
        device_id: String,
        status: RegistrationStatus,
    },
    Failed {
        error: String,
    },
}

/// Record of a state transition for audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from_state: String,
    pub to_state: String,
    /// Milliseconds since the epoch
    pub timestamp: u64,
    pub reason: Option<String>,
    /// BLAKE3 of `from->to;timestamp`
    pub transition_hash: Vec<u8>,
}

/// Proof of identity attached to every device message.
#[derive(Debug, Clone)]
pub struct DeviceCredential {
    pub device_id: String,
    pub hub: String,
    /// Public-only leaf
    pub certificate: Certificate,
    /// Leaf-key signature over the payload
    pub signature: Vec<u8>,
}

#[async_trait]
pub trait RegistrationService: Send + Sync {
    /// Register a device presenting `leaf` and its root-first `chain`.
    async fn register(
        &self,
        endpoint: &str,
        scope_id: &str,
        leaf: &Certificate,
        chain: &[Certificate],
    ) -> Result<ProvisioningResult>;
}

#[async_trait]
pub trait MessagingService: Send + Sync {
    async fn send(&self, credential: &DeviceCredential, payload: &[u8]) -> Result<()>;
}

/// One page of registered device ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DevicePage {
    pub device_ids: Vec<String>,
    /// Token for the next page; `None` on the last page
    pub continuation: Option<String>,
}

/// Service-side view of registered devices.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn list_devices(&self, page_size: usize, continuation: Option<String>)
        -> Result<DevicePage>;

    async fn remove_device(&self, device_id: &str) -> Result<()>;
}

pub struct DeviceProvisioningActor {
    registration: Arc<dyn RegistrationService>,
    state: ProvisioningState,
    history: VecDeque<StateTransition>,
    result: Option<ProvisioningResult>,
}

impl DeviceProvisioningActor {
    pub fn new(registration: Arc<dyn RegistrationService>) -> Self {
        Self {
            registration,
            state: ProvisioningState::NotProvisioned,
            history: VecDeque::with_capacity(MAX_HISTORY_SIZE),
            result: None,
        }
    }

    pub fn state(&self) -> &ProvisioningState {
        &self.state
    }

    pub fn history(&self) -> &VecDeque<StateTransition> {
        &self.history
    }

    pub fn result(&self) -> Option<&ProvisioningResult> {
        self.result.as_ref()
    }

    pub fn is_assigned(&self) -> bool {
        matches!(self.state, ProvisioningState::Assigned { .. })
    }

    /// Register the device whose leaf is installed in `hsm`.
    pub async fn provision(
        &mut self,
        hsm: &DeviceHsm,
        endpoint: &str,
        scope_id: &str,
    ) -> Result<ProvisioningResult> {
        let (leaf, chain) = match (hsm.leaf_certificate(), hsm.chain()) {
            (Some(leaf), Some(chain)) => (leaf, chain),
            _ => {
                return Err(Error::NotReady(format!(
                    "{} has no installed certificate",
                    hsm.unique_device_id()
                )))
            }
        };

        self.transition(
            ProvisioningState::Registering {
                endpoint: endpoint.to_string(),
                scope_id: scope_id.to_string(),
            },
            Some(format!("Registering {}", hsm.unique_device_id())),
        );

        let result = match self
            .registration
            .register(endpoint, scope_id, leaf, chain)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!(device_id = %hsm.unique_device_id(), error = %e, "Registration failed");
                self.transition(
                    ProvisioningState::Failed {
                        error: e.to_string(),
                    },
                    Some("Registration service error".to_string()),
                );
                return Err(e);
            }
        };

        let next = match (&result.status, &result.assigned_hub) {
            (RegistrationStatus::Assigned, Some(hub)) => ProvisioningState::Assigned {
                device_id: result.device_id.clone(),
                hub: hub.clone(),
            },
            (RegistrationStatus::Failed, _) => ProvisioningState::Failed {
                error: format!("registration of {} failed", result.device_id),
            },
            (status, _) => ProvisioningState::Unassigned {
                device_id: result.device_id.clone(),
                status: *status,
            },
        };
        self.transition(next, Some(format!("Registration status {:?}", result.status)));

        info!(
            device_id = %result.device_id,
            hub = ?result.assigned_hub,
            status = ?result.status,
            "STATUS: DeviceProvisioningActor :: Registered :: ACTIVE"
        );
        self.result = Some(result.clone());
        Ok(result)
    }

    /// Sign `payload` with the device key and send it with the device
    /// credential.
    pub async fn authenticate_and_communicate(
        &self,
        hsm: &DeviceHsm,
        messaging: &dyn MessagingService,
        payload: &[u8],
    ) -> Result<()> {
        let (device_id, hub) = match &self.state {
            ProvisioningState::Assigned { device_id, hub } => (device_id.clone(), hub.clone()),
            other => {
                return Err(Error::NotReady(format!(
                    "{} is not assigned ({:?})",
                    hsm.unique_device_id(),
                    other
                )))
            }
        };

        let credential = hsm.execute_with_signing_key(|leaf| {
            Ok(DeviceCredential {
                device_id,
                hub,
                certificate: leaf.public_certificate().clone(),
                signature: leaf.sign(payload)?,
            })
        })?;

        messaging.send(&credential, payload).await?;
        info!(
            device_id = %credential.device_id,
            hub = %credential.hub,
            bytes = payload.len(),
            "Device message sent"
        );
        Ok(())
    }

    fn transition(&mut self, new_state: ProvisioningState, reason: Option<String>) {
        let now = current_timestamp();
        let from_state = format!("{:?}", self.state);
        let to_state = format!("{:?}", new_state);
        let transition_hash = blake3::hash(format!("{}->{};{}", from_state, to_state, now).as_bytes())
            .as_bytes()
            .to_vec();

        self.state = new_state;
        if self.history.len() >= MAX_HISTORY_SIZE {
            self.history.pop_front();
        }
        self.history.push_back(StateTransition {
            from_state,
            to_state,
            timestamp: now,
            reason,
            transition_hash,
        });
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{LocalEnrollmentService, LocalProvisioningHub};
    use crate::trust_store::InMemoryTrustStore;
    use skytrust_core::{HashAlgorithm, KeyAlgorithm};
    use skytrust_crypto::{CertRequestEngine, CertificateWithKey, DistinguishedName, SecretKey};

    struct Fixture {
        hub: Arc<LocalProvisioningHub>,
        hsm: DeviceHsm,
    }

    async fn fixture(enroll: bool) -> Fixture {
        let engine = CertRequestEngine::new();
        let key = SecretKey::generate(KeyAlgorithm::EcdsaP256).unwrap();
        let request = engine
            .create_request(
                DistinguishedName::new("Root CA").with_organization("Fabrikam"),
                key.public_key(),
                HashAlgorithm::Sha256,
                true,
                None,
            )
            .unwrap();
        let root: CertificateWithKey = engine.self_sign(&request, key, 365).unwrap();

        let enrollment = Arc::new(LocalEnrollmentService::new());
        if enroll {
            use crate::enrollment::EnrollmentService;
            enrollment
                .create_or_update_enrollment_record("fleet", root.public_certificate())
                .await
                .unwrap();
        }
        let hub = Arc::new(LocalProvisioningHub::new(enrollment, "fleet", "hub-0"));

        let mut hsm = DeviceHsm::new(KeyAlgorithm::EcdsaP256, Arc::new(InMemoryTrustStore::new()))
            .unwrap();
        let leaf_request = engine
            .create_request(
                DistinguishedName::new(hsm.unique_device_id()).with_organization("Fabrikam"),
                hsm.public_key(),
                HashAlgorithm::Sha256,
                false,
                None,
            )
            .unwrap();
        let leaf = engine.issue(&leaf_request, &root, 30).unwrap();
        hsm.store_certificate(leaf, vec![root.public_certificate().clone()])
            .unwrap();

        Fixture { hub, hsm }
    }

    #[tokio::test]
    async fn test_provision_assigns_and_records_history() {
        let f = fixture(true).await;
        let mut actor = DeviceProvisioningActor::new(f.hub.clone());

        let result = actor.provision(&f.hsm, "global.example", "0ne0001").await.unwrap();
        assert_eq!(result.status, RegistrationStatus::Assigned);
        assert_eq!(result.device_id, f.hsm.unique_device_id());
        assert_eq!(result.assigned_hub.as_deref(), Some("hub-0"));
        assert!(actor.is_assigned());

        assert_eq!(actor.history().len(), 2);
        let first = &actor.history()[0];
        assert!(first.from_state.starts_with("NotProvisioned"));
        assert!(first.to_state.starts_with("Registering"));
        assert_eq!(first.transition_hash.len(), 32);
    }

    #[tokio::test]
    async fn test_send_requires_assignment() {
        let f = fixture(true).await;
        let actor = DeviceProvisioningActor::new(f.hub.clone());

        let err = actor
            .authenticate_and_communicate(&f.hsm, f.hub.as_ref(), b"hello")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotReady(_)));
        assert!(f.hub.messages().is_empty());
    }

    #[tokio::test]
    async fn test_signed_message_reaches_hub() {
        let f = fixture(true).await;
        let mut actor = DeviceProvisioningActor::new(f.hub.clone());
        actor.provision(&f.hsm, "global.example", "0ne0001").await.unwrap();

        actor
            .authenticate_and_communicate(&f.hsm, f.hub.as_ref(), b"hello")
            .await
            .unwrap();
        let messages = f.hub.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].device_id, f.hsm.unique_device_id());
        assert_eq!(messages[0].payload, b"hello".to_vec());
    }

    #[tokio::test]
    async fn test_unenrolled_root_fails_registration() {
        let f = fixture(false).await;
        let mut actor = DeviceProvisioningActor::new(f.hub.clone());

        let result = actor.provision(&f.hsm, "global.example", "0ne0001").await.unwrap();
        assert_eq!(result.status, RegistrationStatus::Failed);
        assert!(matches!(actor.state(), ProvisioningState::Failed { .. }));
        assert!(!actor.is_assigned());
    }

    #[tokio::test]
    async fn test_collaborator_error_moves_to_failed() {
        let f = fixture(true).await;
        f.hub.fail_next("hub offline");
        let mut actor = DeviceProvisioningActor::new(f.hub.clone());

        let err = actor
            .provision(&f.hsm, "global.example", "0ne0001")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(actor.state(), ProvisioningState::Failed { .. }));
        assert!(actor.result().is_none());
    }

    #[tokio::test]
    async fn test_provision_without_certificate_is_not_ready() {
        let f = fixture(true).await;
        let hsm = DeviceHsm::new(KeyAlgorithm::EcdsaP256, Arc::new(InMemoryTrustStore::new()))
            .unwrap();
        let mut actor = DeviceProvisioningActor::new(f.hub.clone());

        assert!(matches!(
            actor.provision(&hsm, "global.example", "0ne0001").await,
            Err(Error::NotReady(_))
        ));
        assert_eq!(actor.state(), &ProvisioningState::NotProvisioned);
    }

    #[test]
    fn test_history_is_bounded() {
        struct Never;
        #[async_trait]
        impl RegistrationService for Never {
            async fn register(
                &self,
                _: &str,
                _: &str,
                _: &Certificate,
                _: &[Certificate],
            ) -> Result<ProvisioningResult> {
                Err(Error::CollaboratorFailure("unused".into()))
            }
        }

        let mut actor = DeviceProvisioningActor::new(Arc::new(Never));
        for i in 0..(MAX_HISTORY_SIZE + 5) {
            actor.transition(
                ProvisioningState::Failed {
                    error: i.to_string(),
                },
                None,
            );
        }
        assert_eq!(actor.history().len(), MAX_HISTORY_SIZE);
        assert!(actor.history()[0].to_state.contains("\"5\""));
    }
}
