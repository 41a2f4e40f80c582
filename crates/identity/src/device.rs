//! A manufactured device: its HSM plus its provisioning actor.

use crate::hsm::DeviceHsm;
use crate::provisioning::{
    DeviceProvisioningActor, MessagingService, ProvisioningResult, ProvisioningState,
};
use skytrust_core::Result;
use std::sync::Arc;
use tracing::info;

pub struct IotDevice {
    hsm: DeviceHsm,
    actor: DeviceProvisioningActor,
    messaging: Arc<dyn MessagingService>,
}

impl IotDevice {
    pub fn new(
        hsm: DeviceHsm,
        actor: DeviceProvisioningActor,
        messaging: Arc<dyn MessagingService>,
    ) -> Self {
        Self {
            hsm,
            actor,
            messaging,
        }
    }

    pub fn device_id(&self) -> &str {
        self.hsm.unique_device_id()
    }

    pub fn hsm(&self) -> &DeviceHsm {
        &self.hsm
    }

    pub(crate) fn hsm_mut(&mut self) -> &mut DeviceHsm {
        &mut self.hsm
    }

    pub fn provisioning_state(&self) -> &ProvisioningState {
        self.actor.state()
    }

    /// Register with the provisioning service using the installed leaf.
    pub async fn provision(&mut self, endpoint: &str, scope_id: &str) -> Result<ProvisioningResult> {
        self.actor.provision(&self.hsm, endpoint, scope_id).await
    }

    /// Send a signed `payload` to the assigned hub.
    pub async fn authenticate_and_send(&self, payload: &[u8]) -> Result<()> {
        self.actor
            .authenticate_and_communicate(&self.hsm, self.messaging.as_ref(), payload)
            .await
    }

    /// Installed and assigned to a hub.
    pub fn is_ready(&self) -> bool {
        self.hsm.is_installed() && self.actor.is_assigned()
    }

    pub fn dispose(&mut self) {
        if !self.hsm.is_disposed() {
            info!(device_id = %self.device_id(), "Disposing device");
        }
        self.hsm.dispose();
    }
}
