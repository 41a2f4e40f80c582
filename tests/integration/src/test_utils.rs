//! Test utilities for chain-of-trust integration tests

use skytrust_core::SupplyChainConfig;
use skytrust_identity::{InMemoryTrustStore, LocalCollaborators, SupplyChain, TrustStore};
use std::path::PathBuf;
use std::sync::Arc;

pub const TEST_ENDPOINT: &str = "global.azure-devices-provisioning.net";
pub const TEST_SCOPE: &str = "0ne000F1E2D";
pub const TEST_ENROLLMENT: &str = "contoso-fleet";
pub const TEST_HUB: &str = "contoso-hub";

/// Default configuration with the provisioning fields a build requires.
pub fn test_config() -> SupplyChainConfig {
    let mut config = SupplyChainConfig::default();
    config.provisioning.id_scope = TEST_SCOPE.to_string();
    config.provisioning.enrollment_group_id = TEST_ENROLLMENT.to_string();
    config
}

/// Test fixture for a supply chain wired to local collaborators
pub struct TestFleet {
    pub chain: SupplyChain,
    pub local: LocalCollaborators,
    pub store: Arc<dyn TrustStore>,
}

impl TestFleet {
    pub fn new(config: &SupplyChainConfig) -> Self {
        Self::with_store(config, Arc::new(InMemoryTrustStore::new()))
    }

    pub fn with_store(config: &SupplyChainConfig, store: Arc<dyn TrustStore>) -> Self {
        let local = LocalCollaborators::new(&config.provisioning.enrollment_group_id, TEST_HUB);
        let chain = SupplyChain::build(config, local.collaborators(store.clone()))
            .expect("Failed to build supply chain");
        Self { chain, local, store }
    }

    /// Build with [`test_config`] and create the enrollment.
    pub async fn enrolled() -> Self {
        let fleet = Self::new(&test_config());
        let ready = fleet
            .chain
            .company()
            .clean_up_and_create_enrollment()
            .await
            .expect("Failed to create enrollment");
        assert!(ready, "enrollment should be enabled");
        fleet
    }
}

/// Unique scratch directory under the system temp dir.
pub fn temp_dir(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("skytrust-{}-{}", label, uuid::Uuid::new_v4()))
}
