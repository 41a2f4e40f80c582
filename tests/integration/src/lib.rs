//! Integration tests for the SkyTrust chain of trust
//!
//! This test suite validates:
//! - Root, integrator, deployer and device leaf issued as one verifiable chain
//! - Validity windows anchored on the root's notBefore
//! - Bulk minting and deregistration against the local provisioning hub
//! - Cancellation of bulk work

pub mod test_utils;

#[cfg(test)]
mod chain_of_trust_tests;
