//! Supply-chain roles built on the authority hierarchy.
//!
//! ```text
//! IotCompany           (root)
//!   └─ HardwareIntegrator   (intermediate, manufactures devices)
//!        └─ Deployer        (intermediate, installs device leaves)
//!             └─ device leaf
//! ```
//!
//! The company owns the fleet enrollment and refuses to make devices until
//! it is Enabled. The integrator creates each device HSM and hands it to
//! the deployer, which issues the leaf, installs it with the chain and
//! provisions the device.

use crate::device::IotDevice;
use crate::enrollment::{ensure_ready, EnrollmentOrchestrator, EnrollmentService};
use crate::hsm::DeviceHsm;
use crate::pki::{AuthorityHierarchy, AuthorityId, RootAuthority, SelfSign};
use crate::provisioning::{
    DeviceProvisioningActor, DeviceRegistry, MessagingService, ProvisioningResult,
    RegistrationService,
};
use crate::trust_store::TrustStore;
use async_trait::async_trait;
use skytrust_core::{Error, KeyAlgorithm, KeyConfig, KeyProfile, Result, SupplyChainConfig};
use skytrust_crypto::{CertRequestEngine, Certificate, DistinguishedName, SecretKey};
use std::sync::Arc;
use tracing::info;

/// External services the supply chain talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub enrollment: Arc<dyn EnrollmentService>,
    pub registration: Arc<dyn RegistrationService>,
    pub messaging: Arc<dyn MessagingService>,
    pub registry: Arc<dyn DeviceRegistry>,
    pub trust_store: Arc<dyn TrustStore>,
}

/// Produces provisioned devices.
#[async_trait]
pub trait DeviceManufacturer: Send + Sync {
    async fn manufacture(&self, endpoint: &str, scope_id: &str) -> Result<IotDevice>;
}

pub fn root_subject(name: &str, organization: &str) -> DistinguishedName {
    DistinguishedName::new(format!("{} Root CA Certificate (Test Use Only)", name))
        .with_organization(organization)
}

pub fn intermediate_subject(name: &str, organization: &str) -> DistinguishedName {
    DistinguishedName::new(format!(
        "{} Intermediate CA Certificate (Test Use Only)",
        name
    ))
    .with_organization(organization)
}

/// Installs device leaves issued by the deepest intermediate.
pub struct Deployer {
    hierarchy: Arc<AuthorityHierarchy>,
    authority: AuthorityId,
    organization: String,
    device_profile: KeyProfile,
    engine: CertRequestEngine,
}

impl Deployer {
    pub fn new(
        hierarchy: Arc<AuthorityHierarchy>,
        authority: AuthorityId,
        organization: impl Into<String>,
        device_profile: KeyProfile,
    ) -> Self {
        Self {
            hierarchy,
            authority,
            organization: organization.into(),
            device_profile,
            engine: CertRequestEngine::new(),
        }
    }

    /// Issue, install and provision a leaf for `device`.
    pub async fn install(
        &self,
        device: &mut IotDevice,
        endpoint: &str,
        scope_id: &str,
    ) -> Result<ProvisioningResult> {
        let subject =
            DistinguishedName::new(device.device_id()).with_organization(&self.organization);
        let request = self.engine.create_request(
            subject,
            device.hsm().public_key(),
            self.device_profile.hash,
            false,
            None,
        )?;
        let leaf = self.hierarchy.sign(self.authority, &request)?;
        let chain = self.hierarchy.collect_chain(self.authority)?;

        info!(
            device_id = %device.device_id(),
            serial = %leaf.serial_hex(),
            chain_len = chain.len(),
            "Device leaf issued"
        );
        device.hsm_mut().store_certificate(leaf, chain)?;
        device.provision(endpoint, scope_id).await
    }
}

/// Creates device HSMs and hands them to the deployer.
pub struct HardwareIntegrator {
    authority: AuthorityId,
    deployer: Deployer,
    device_algorithm: KeyAlgorithm,
    trust_store: Arc<dyn TrustStore>,
    registration: Arc<dyn RegistrationService>,
    messaging: Arc<dyn MessagingService>,
}

impl HardwareIntegrator {
    pub fn new(
        authority: AuthorityId,
        deployer: Deployer,
        device_algorithm: KeyAlgorithm,
        collaborators: &Collaborators,
    ) -> Self {
        Self {
            authority,
            deployer,
            device_algorithm,
            trust_store: collaborators.trust_store.clone(),
            registration: collaborators.registration.clone(),
            messaging: collaborators.messaging.clone(),
        }
    }

    pub fn authority(&self) -> AuthorityId {
        self.authority
    }

    pub fn deployer(&self) -> &Deployer {
        &self.deployer
    }
}

#[async_trait]
impl DeviceManufacturer for HardwareIntegrator {
    async fn manufacture(&self, endpoint: &str, scope_id: &str) -> Result<IotDevice> {
        let hsm = DeviceHsm::new(self.device_algorithm, self.trust_store.clone())?;
        let actor = DeviceProvisioningActor::new(self.registration.clone());
        let mut device = IotDevice::new(hsm, actor, self.messaging.clone());

        self.deployer.install(&mut device, endpoint, scope_id).await?;
        Ok(device)
    }
}

/// Root owner of the fleet.
pub struct IotCompany {
    root: AuthorityId,
    hierarchy: Arc<AuthorityHierarchy>,
    orchestrator: EnrollmentOrchestrator,
    manufacturer: Arc<dyn DeviceManufacturer>,
    organization: String,
    proof_profile: KeyProfile,
    engine: CertRequestEngine,
}

impl IotCompany {
    pub fn new(
        root: AuthorityId,
        hierarchy: Arc<AuthorityHierarchy>,
        orchestrator: EnrollmentOrchestrator,
        manufacturer: Arc<dyn DeviceManufacturer>,
        organization: impl Into<String>,
        proof_profile: KeyProfile,
    ) -> Self {
        Self {
            root,
            hierarchy,
            orchestrator,
            manufacturer,
            organization: organization.into(),
            proof_profile,
            engine: CertRequestEngine::new(),
        }
    }

    pub fn organization(&self) -> &str {
        &self.organization
    }

    pub fn orchestrator(&self) -> &EnrollmentOrchestrator {
        &self.orchestrator
    }

    /// Public-only root certificate.
    pub fn root_certificate(&self) -> Result<Certificate> {
        Ok(self
            .hierarchy
            .signer(self.root)?
            .exposed_certificate()
            .clone())
    }

    /// Replace the fleet enrollment with one bound to the root.
    pub async fn clean_up_and_create_enrollment(&self) -> Result<bool> {
        let root = self.root_certificate()?;
        self.orchestrator.clean_up_and_create(&root).await
    }

    /// Make one provisioned device. Requires an Enabled enrollment.
    pub async fn make_device(&self, endpoint: &str, scope_id: &str) -> Result<IotDevice> {
        ensure_ready(&self.orchestrator)?;
        self.manufacturer.manufacture(endpoint, scope_id).await
    }

    /// Root certificate as PEM, for upload to the provisioning service.
    pub fn export_root_pem(&self) -> Result<String> {
        Ok(self.root_certificate()?.to_pem())
    }

    /// PEM certificate `CN=<verification_code>` signed by the root, proving
    /// possession of the root key.
    pub fn generate_proof_of_possession(&self, verification_code: &str) -> Result<String> {
        let key = SecretKey::generate(self.proof_profile.algorithm)?;
        let subject =
            DistinguishedName::new(verification_code).with_organization(&self.organization);
        let request = self.engine.create_request(
            subject,
            key.public_key(),
            self.proof_profile.hash,
            false,
            None,
        )?;
        let certificate = self.hierarchy.sign(self.root, &request)?;
        info!(
            serial = %certificate.serial_hex(),
            "Proof-of-possession certificate issued"
        );
        Ok(certificate.to_pem())
    }

    /// Fresh self-signed root certificate over the existing root key.
    pub fn renew_root_certificate(&self) -> Result<Certificate> {
        self.hierarchy.root(self.root)?.self_sign_new_certificate()
    }
}

/// The assembled hierarchy and its roles.
pub struct SupplyChain {
    company: Arc<IotCompany>,
    hierarchy: Arc<AuthorityHierarchy>,
    root: AuthorityId,
    integrator: AuthorityId,
    deployer: AuthorityId,
    collaborators: Collaborators,
}

impl SupplyChain {
    /// Validate `config` and build root, integrator and deployer in order.
    pub fn build(config: &SupplyChainConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let org = &config.organization;
        let validity = &config.validity;

        let root_key = load_root_key(&config.keys)?;
        let mut hierarchy = AuthorityHierarchy::new(config.max_chain_depth);
        let root = hierarchy.add_root(RootAuthority::new(
            &config.company_name,
            root_subject(&config.company_name, org),
            root_key,
            config.keys.root.hash,
            validity.root_self_signed_days,
            validity.root_issued_days,
        )?);
        let integrator = hierarchy.add_intermediate(
            root,
            &config.hardware_integrator_name,
            intermediate_subject(&config.hardware_integrator_name, org),
            &config.keys.intermediate,
            validity.integrator_issued_days,
        )?;
        let deployer = hierarchy.add_intermediate(
            integrator,
            &config.deployer_name,
            intermediate_subject(&config.deployer_name, org),
            &config.keys.intermediate,
            validity.deployer_issued_days,
        )?;
        let hierarchy = Arc::new(hierarchy);

        let manufacturer = Arc::new(HardwareIntegrator::new(
            integrator,
            Deployer::new(hierarchy.clone(), deployer, org, config.keys.device.clone()),
            config.keys.device.algorithm,
            &collaborators,
        ));
        let orchestrator = EnrollmentOrchestrator::new(
            collaborators.enrollment.clone(),
            &config.provisioning.enrollment_group_id,
        );
        let company = Arc::new(IotCompany::new(
            root,
            hierarchy.clone(),
            orchestrator,
            manufacturer,
            org,
            config.keys.device.clone(),
        ));

        info!(
            company = %config.company_name,
            integrator = %config.hardware_integrator_name,
            deployer = %config.deployer_name,
            depth = hierarchy.len() - 1,
            "STATUS: SupplyChain :: Hierarchy built :: ACTIVE"
        );
        Ok(Self {
            company,
            hierarchy,
            root,
            integrator,
            deployer,
            collaborators,
        })
    }

    pub fn company(&self) -> &Arc<IotCompany> {
        &self.company
    }

    pub fn hierarchy(&self) -> &AuthorityHierarchy {
        &self.hierarchy
    }

    pub fn root(&self) -> AuthorityId {
        self.root
    }

    pub fn integrator(&self) -> AuthorityId {
        self.integrator
    }

    pub fn deployer(&self) -> AuthorityId {
        self.deployer
    }

    pub fn registry(&self) -> Arc<dyn DeviceRegistry> {
        self.collaborators.registry.clone()
    }

    pub fn trust_store(&self) -> &Arc<dyn TrustStore> {
        &self.collaborators.trust_store
    }

    /// Remove client certificates of this organization from the trust store.
    pub fn clean_trust_store(&self) -> Result<usize> {
        self.collaborators
            .trust_store
            .remove_by_organization(self.company.organization())
    }

    /// Release every authority key.
    pub fn dispose(&self) {
        self.hierarchy.dispose();
    }
}

fn load_root_key(keys: &KeyConfig) -> Result<SecretKey> {
    let expected = keys.root.algorithm;
    match &keys.root_key_path {
        Some(path) => {
            let pem = std::fs::read_to_string(path).map_err(|e| {
                Error::Configuration(format!(
                    "Failed to read root key {}: {}",
                    path.display(),
                    e
                ))
            })?;
            let key = SecretKey::from_pkcs8_pem(&pem)?;
            if key.algorithm() != expected {
                return Err(Error::Configuration(format!(
                    "root key at {} is {}, configured algorithm is {}",
                    path.display(),
                    key.algorithm(),
                    expected
                )));
            }
            info!(path = %path.display(), algorithm = %expected, "Root key imported");
            Ok(key)
        }
        None if expected == KeyAlgorithm::Rsa => Err(Error::Configuration(
            "keys.root_key_path is required for RSA roots".to_string(),
        )),
        None => SecretKey::generate(expected),
    }
}
