//! Device identity and fleet onboarding for SkyTrust.
//!
//! This crate builds the chain of trust that admits a drone to the fleet:
//! a root authority and two intermediates issue a leaf for every device
//! key, a software HSM custodies that key, and enrollment plus provisioning
//! collaborators decide whether the device may talk to its hub.
//!
//! # Core Concepts
//!
//! - **Authority hierarchy** ([`pki`]): root and intermediates in an arena,
//!   parents referenced by index, chains collected root first
//! - **Device HSM** ([`hsm`]): the only holder of a device private key
//! - **Enrollment** ([`enrollment`]): fleet record bound to the root; devices
//!   are made only while it is Enabled
//! - **Provisioning** ([`provisioning`]): registration with the leaf as proof
//!   of identity, then signed messaging once Assigned
//! - **Supply chain** ([`supply_chain`]): company, hardware integrator and
//!   deployer roles on top of the hierarchy
//!
//! # Security Model
//!
//! - Authorities and HSMs hand out public-only certificates; key-bound work
//!   happens inside closures that borrow the with-key form
//! - Trust stores never receive private key bytes
//! - Disposal is idempotent and also runs on drop, zeroizing key material

pub mod bulk;
pub mod device;
pub mod enrollment;
pub mod hsm;
pub mod pki;
pub mod provisioning;
pub mod simulator;
pub mod supply_chain;
pub mod trust_store;

pub use bulk::{deregister_devices, mint_devices, BulkProgress, CancelSignal, ProgressSnapshot};
pub use device::IotDevice;
pub use enrollment::{EnrollmentOrchestrator, EnrollmentRecord, EnrollmentService, EnrollmentStatus};
pub use hsm::DeviceHsm;
pub use pki::{AuthorityHierarchy, AuthorityId, IntermediateAuthority, RootAuthority, SelfSign, Signer};
pub use provisioning::{
    DeviceCredential, DevicePage, DeviceProvisioningActor, DeviceRegistry, MessagingService,
    ProvisioningResult, ProvisioningState, RegistrationService, RegistrationStatus,
    StateTransition,
};
pub use simulator::{LocalCollaborators, LocalEnrollmentService, LocalProvisioningHub, ReceivedMessage};
pub use supply_chain::{
    Collaborators, Deployer, DeviceManufacturer, HardwareIntegrator, IotCompany, SupplyChain,
};
pub use trust_store::{DirectoryTrustStore, InMemoryTrustStore, StoreEntry, StoreRole, TrustStore};

// Re-export core types for convenience
pub use skytrust_core::{Error, Result};
