//! Core functionality shared by the SkyTrust chain-of-trust crates.
//!
//! This crate provides the error kinds, configuration model, algorithm
//! identifiers and logging setup used by `skytrust-crypto`,
//! `skytrust-identity` and the `skytrust-node` service.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::{BulkConfig, KeyConfig, KeyProfile, ProvisioningConfig, SupplyChainConfig, ValidityConfig};
pub use error::{Error, Result};
pub use types::{HashAlgorithm, KeyAlgorithm};
