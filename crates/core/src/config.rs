//! Configuration management for SkyTrust.
//!
//! Settings load from a JSON file, then provisioning values may be
//! overridden from the environment. `validate` must pass before any
//! authority is constructed; missing settings are fatal.

use crate::error::{Error, Result};
use crate::types::{HashAlgorithm, KeyAlgorithm};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_CONNECTION_STRING: &str = "SKYTRUST_PROVISIONING_CONNECTION_STRING";
pub const ENV_GLOBAL_ENDPOINT: &str = "SKYTRUST_GLOBAL_ENDPOINT";
pub const ENV_ID_SCOPE: &str = "SKYTRUST_ID_SCOPE";
pub const ENV_ENROLLMENT_GROUP_ID: &str = "SKYTRUST_ENROLLMENT_GROUP_ID";
pub const ENV_ORGANIZATION: &str = "SKYTRUST_ORGANIZATION";

/// Top-level settings for the three-tier issuance hierarchy and onboarding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplyChainConfig {
    /// Root authority owner
    #[serde(default = "default_company_name")]
    pub company_name: String,

    /// First intermediate, which manufactures devices
    #[serde(default = "default_integrator_name")]
    pub hardware_integrator_name: String,

    /// Second intermediate, which installs device certificates
    #[serde(default = "default_deployer_name")]
    pub deployer_name: String,

    /// `O=` attribute stamped on every certificate in the fleet
    #[serde(default = "default_organization")]
    pub organization: String,

    #[serde(default)]
    pub provisioning: ProvisioningConfig,

    #[serde(default)]
    pub validity: ValidityConfig,

    #[serde(default)]
    pub keys: KeyConfig,

    /// Upper bound on parent links followed when collecting a chain
    #[serde(default = "default_max_chain_depth")]
    pub max_chain_depth: usize,

    #[serde(default)]
    pub bulk: BulkConfig,

    /// Directory-backed trust store; in-memory when absent
    #[serde(default)]
    pub trust_store_dir: Option<PathBuf>,
}

/// Provisioning service coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    /// Service-side credential; only needed for remote collaborators
    #[serde(default)]
    pub connection_string: Option<String>,

    #[serde(default = "default_global_endpoint")]
    pub global_endpoint: String,

    #[serde(default)]
    pub id_scope: String,

    #[serde(default)]
    pub enrollment_group_id: String,
}

/// Validity periods, in days, per issuance level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidityConfig {
    #[serde(default = "default_root_self_signed_days")]
    pub root_self_signed_days: u32,

    /// Root signing an intermediate (and proof-of-possession certificates)
    #[serde(default = "default_root_issued_days")]
    pub root_issued_days: u32,

    /// Integrator signing the deployer
    #[serde(default = "default_integrator_issued_days")]
    pub integrator_issued_days: u32,

    /// Deployer signing device leaves
    #[serde(default = "default_deployer_issued_days")]
    pub deployer_issued_days: u32,
}

/// Key algorithm and digest for one role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyProfile {
    pub algorithm: KeyAlgorithm,
    pub hash: HashAlgorithm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    #[serde(default = "default_root_profile")]
    pub root: KeyProfile,

    #[serde(default = "default_intermediate_profile")]
    pub intermediate: KeyProfile,

    #[serde(default = "default_device_profile")]
    pub device: KeyProfile,

    /// PKCS#8 PEM for an imported root key (required for RSA roots)
    #[serde(default)]
    pub root_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkConfig {
    /// Maximum devices processed at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Registry page size for mass deletion
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_company_name() -> String {
    "Fabrikam Drone IoT Company".to_string()
}

fn default_integrator_name() -> String {
    "Fabrikam Drone Factory".to_string()
}

fn default_deployer_name() -> String {
    "Fabrikam IoT Device Technician".to_string()
}

fn default_organization() -> String {
    "Fabrikam Drone Delivery".to_string()
}

fn default_global_endpoint() -> String {
    "global.azure-devices-provisioning.net".to_string()
}

fn default_max_chain_depth() -> usize {
    8
}

fn default_root_self_signed_days() -> u32 {
    10_000
}

fn default_root_issued_days() -> u32 {
    1504
}

fn default_integrator_issued_days() -> u32 {
    476
}

fn default_deployer_issued_days() -> u32 {
    30
}

fn default_root_profile() -> KeyProfile {
    KeyProfile {
        algorithm: KeyAlgorithm::EcdsaP384,
        hash: HashAlgorithm::Sha384,
    }
}

fn default_intermediate_profile() -> KeyProfile {
    KeyProfile {
        algorithm: KeyAlgorithm::EcdsaP384,
        hash: HashAlgorithm::Sha384,
    }
}

fn default_device_profile() -> KeyProfile {
    KeyProfile {
        algorithm: KeyAlgorithm::EcdsaP256,
        hash: HashAlgorithm::Sha256,
    }
}

fn default_concurrency() -> usize {
    8
}

fn default_page_size() -> usize {
    100
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            connection_string: None,
            global_endpoint: default_global_endpoint(),
            id_scope: String::new(),
            enrollment_group_id: String::new(),
        }
    }
}

impl Default for ValidityConfig {
    fn default() -> Self {
        Self {
            root_self_signed_days: default_root_self_signed_days(),
            root_issued_days: default_root_issued_days(),
            integrator_issued_days: default_integrator_issued_days(),
            deployer_issued_days: default_deployer_issued_days(),
        }
    }
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            root: default_root_profile(),
            intermediate: default_intermediate_profile(),
            device: default_device_profile(),
            root_key_path: None,
        }
    }
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            page_size: default_page_size(),
        }
    }
}

impl Default for SupplyChainConfig {
    fn default() -> Self {
        Self {
            company_name: default_company_name(),
            hardware_integrator_name: default_integrator_name(),
            deployer_name: default_deployer_name(),
            organization: default_organization(),
            provisioning: ProvisioningConfig::default(),
            validity: ValidityConfig::default(),
            keys: KeyConfig::default(),
            max_chain_depth: default_max_chain_depth(),
            bulk: BulkConfig::default(),
            trust_store_dir: None,
        }
    }
}

impl SupplyChainConfig {
    /// Load configuration from a JSON file. Does not validate.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::Configuration(format!("Failed to parse configuration: {}", e)))
    }

    /// Override provisioning settings from `SKYTRUST_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Override from an arbitrary lookup; empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(ENV_CONNECTION_STRING) {
            self.provisioning.connection_string = Some(v);
        }
        if let Some(v) = get(ENV_GLOBAL_ENDPOINT) {
            self.provisioning.global_endpoint = v;
        }
        if let Some(v) = get(ENV_ID_SCOPE) {
            self.provisioning.id_scope = v;
        }
        if let Some(v) = get(ENV_ENROLLMENT_GROUP_ID) {
            self.provisioning.enrollment_group_id = v;
        }
        if let Some(v) = get(ENV_ORGANIZATION) {
            self.organization = v;
        }
    }

    /// Fail fast on missing or inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        require("company_name", &self.company_name)?;
        require("hardware_integrator_name", &self.hardware_integrator_name)?;
        require("deployer_name", &self.deployer_name)?;
        require("organization", &self.organization)?;
        require("provisioning.global_endpoint", &self.provisioning.global_endpoint)?;
        require("provisioning.id_scope", &self.provisioning.id_scope)?;
        require(
            "provisioning.enrollment_group_id",
            &self.provisioning.enrollment_group_id,
        )?;

        let v = &self.validity;
        for (field, days) in [
            ("validity.root_self_signed_days", v.root_self_signed_days),
            ("validity.root_issued_days", v.root_issued_days),
            ("validity.integrator_issued_days", v.integrator_issued_days),
            ("validity.deployer_issued_days", v.deployer_issued_days),
        ] {
            if days == 0 {
                return Err(Error::Configuration(format!("{} must be positive", field)));
            }
        }
        if v.root_issued_days > v.root_self_signed_days {
            return Err(Error::Configuration(
                "validity.root_issued_days must not exceed validity.root_self_signed_days"
                    .to_string(),
            ));
        }
        if v.deployer_issued_days > v.integrator_issued_days
            || v.integrator_issued_days > v.root_issued_days
        {
            return Err(Error::Configuration(
                "validity must shrink toward the leaf: root_issued_days >= integrator_issued_days >= deployer_issued_days"
                    .to_string(),
            ));
        }

        for (role, profile) in [
            ("keys.root", &self.keys.root),
            ("keys.intermediate", &self.keys.intermediate),
            ("keys.device", &self.keys.device),
        ] {
            if !profile.algorithm.is_certificate_capable() {
                return Err(Error::Configuration(format!(
                    "{}: {} keys cannot hold certificates",
                    role, profile.algorithm
                )));
            }
            if !profile.algorithm.supports_hash(profile.hash) {
                return Err(Error::Configuration(format!(
                    "{}: {} keys cannot sign with {}",
                    role, profile.algorithm, profile.hash
                )));
            }
        }
        if self.keys.root.algorithm == KeyAlgorithm::Rsa && self.keys.root_key_path.is_none() {
            return Err(Error::Configuration(
                "keys.root_key_path is required for an RSA root".to_string(),
            ));
        }
        for (role, profile) in [
            ("keys.intermediate", &self.keys.intermediate),
            ("keys.device", &self.keys.device),
        ] {
            if profile.algorithm == KeyAlgorithm::Rsa {
                return Err(Error::Configuration(format!(
                    "{}: RSA keys can only be imported for the root",
                    role
                )));
            }
        }

        if self.max_chain_depth == 0 {
            return Err(Error::Configuration(
                "max_chain_depth must be positive".to_string(),
            ));
        }
        if self.bulk.concurrency == 0 || self.bulk.page_size == 0 {
            return Err(Error::Configuration(
                "bulk.concurrency and bulk.page_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Configuration(format!("{} is required", field)));
    }
    Ok(())
}
