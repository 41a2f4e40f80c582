//! End-to-End Chain of Trust Integration Tests
//!
//! This test suite validates the complete onboarding workflow:
//! 1. SupplyChain builds root, hardware integrator and deployer authorities
//! 2. Enrollment binds the root to the provisioning service
//! 3. Devices receive a leaf and an issuing chain that validate pinned to the root
//! 4. Provisioned devices send signed messages to their hub
//! 5. Bulk minting and deregistration keep accurate counters and honor cancellation

use crate::test_utils::{test_config, TestFleet, TEST_ENDPOINT, TEST_HUB, TEST_SCOPE};
use skytrust_core::{BulkConfig, Error};
use skytrust_crypto::{Certificate, ChainPolicy, ChainValidator};
use skytrust_identity::{
    deregister_devices, mint_devices, BulkProgress, CancelSignal, ProgressSnapshot,
    ProvisioningState,
};
use std::sync::Arc;
use time::Duration;

fn bulk(concurrency: usize, page_size: usize) -> BulkConfig {
    BulkConfig {
        concurrency,
        page_size,
    }
}

#[tokio::test]
async fn test_end_to_end_chain_of_trust() {
    // Initialize tracing only if not already initialized
    let _ = tracing_subscriber::fmt::try_init();

    // Step 1: Build the hierarchy and enroll its root
    tracing::info!("Step 1: Building supply chain and enrollment");
    let fleet = TestFleet::enrolled().await;
    let company = fleet.chain.company();
    let root = company.root_certificate().expect("Failed to read root");
    assert!(root.is_self_issued());
    let expected_cn = format!(
        "{} Root CA Certificate (Test Use Only)",
        test_config().company_name
    );
    assert_eq!(root.common_name(), Some(expected_cn.as_str()));

    // Step 2: Make a device through the integrator and deployer
    tracing::info!("Step 2: Making device");
    let device = company
        .make_device(TEST_ENDPOINT, TEST_SCOPE)
        .await
        .expect("Failed to make device");
    assert!(device.is_ready());
    assert!(device.device_id().starts_with("device-"));
    match device.provisioning_state() {
        ProvisioningState::Assigned { device_id, hub } => {
            assert_eq!(device_id, device.device_id());
            assert_eq!(hub, TEST_HUB);
        }
        other => panic!("Expected Assigned, got {:?}", other),
    }

    // Step 3: Inspect the issued chain
    tracing::info!("Step 3: Validating issued chain");
    let hsm = device.hsm();
    let leaf = hsm.leaf_certificate().expect("Leaf not installed");
    let issuing = hsm.chain().expect("Chain not installed");
    assert_eq!(issuing.len(), 3);
    assert_eq!(issuing[0], root);
    assert_eq!(issuing[1].issuer(), root.subject());
    assert_eq!(issuing[2].issuer(), issuing[1].subject());
    assert_eq!(leaf.issuer(), issuing[2].subject());
    assert!(issuing.iter().all(Certificate::is_ca));
    assert!(!leaf.is_ca());
    assert!(!leaf.has_private_key());
    assert!(hsm
        .execute_with_signing_key(|with_key| Ok(with_key.has_private_key()))
        .expect("Failed to borrow signing key"));
    assert!(leaf.has_client_auth());
    assert_eq!(leaf.common_name(), Some(device.device_id()));
    assert_eq!(leaf.organization(), root.organization());

    let mut full = issuing.to_vec();
    full.push(leaf.clone());
    let report = ChainValidator::new(ChainPolicy::pinned(&root))
        .validate(&full)
        .expect("Failed to validate device chain");
    assert_eq!(report.length, 4);
    assert!(report.trusted_root);
    assert_eq!(report.leaf_subject, leaf.subject());

    // Step 4: Signed message reaches the hub
    tracing::info!("Step 4: Sending signed telemetry");
    let payload = serde_json::to_vec(&serde_json::json!({
        "device_id": device.device_id(),
        "battery_pct": 87,
    }))
    .expect("Failed to serialize payload");
    device
        .authenticate_and_send(&payload)
        .await
        .expect("Failed to send telemetry");

    let messages = fleet.local.hub.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].device_id, device.device_id());
    assert_eq!(messages[0].hub, TEST_HUB);
    let received: serde_json::Value =
        serde_json::from_slice(&messages[0].payload).expect("Failed to parse payload");
    assert_eq!(received["battery_pct"], 87);

    tracing::info!("✅ End-to-end chain of trust test passed");
}

#[tokio::test]
async fn test_validity_windows_start_at_root_not_before() {
    let _ = tracing_subscriber::fmt::try_init();
    let config = test_config();
    let fleet = TestFleet::enrolled().await;
    let device = fleet
        .chain
        .company()
        .make_device(TEST_ENDPOINT, TEST_SCOPE)
        .await
        .expect("Failed to make device");

    let issuing = device.hsm().chain().expect("Chain not installed");
    let leaf = device.hsm().leaf_certificate().expect("Leaf not installed");
    let root = &issuing[0];
    let anchor = root.not_before();
    let days = |n: u32| Duration::days(i64::from(n));

    assert_eq!(
        root.not_after() - anchor,
        days(config.validity.root_self_signed_days)
    );
    assert_eq!(issuing[1].not_before(), anchor);
    assert_eq!(
        issuing[1].not_after() - anchor,
        days(config.validity.root_issued_days)
    );
    assert_eq!(issuing[2].not_before(), anchor);
    assert_eq!(
        issuing[2].not_after() - anchor,
        days(config.validity.integrator_issued_days)
    );
    assert_eq!(leaf.not_before(), anchor);
    assert_eq!(
        leaf.not_after() - anchor,
        days(config.validity.deployer_issued_days)
    );

    // Past the leaf window the chain no longer validates
    let mut full = issuing.to_vec();
    full.push(leaf.clone());
    let later = leaf.not_after() + Duration::days(1);
    match ChainValidator::new(ChainPolicy::pinned(root).at(later)).validate(&full) {
        Err(Error::ChainValidation(_)) => {}
        other => panic!("Expected expired chain, got {:?}", other),
    }
}

#[tokio::test]
async fn test_disposed_hierarchy_cannot_issue() {
    let _ = tracing_subscriber::fmt::try_init();
    let fleet = TestFleet::enrolled().await;
    fleet.chain.dispose();
    fleet.chain.dispose();

    match fleet
        .chain
        .company()
        .make_device(TEST_ENDPOINT, TEST_SCOPE)
        .await
    {
        Err(Error::InvalidRequest(message)) => assert!(message.contains("disposed")),
        Err(e) => panic!("Expected InvalidRequest, got {}", e),
        Ok(_) => panic!("Disposed hierarchy issued a device"),
    }
    assert!(fleet.local.hub.registered_devices().is_empty());

    // The public root stays readable after disposal
    assert!(fleet.chain.company().export_root_pem().is_ok());
}

#[tokio::test]
async fn test_bulk_mint_and_deregister_fleet() {
    let _ = tracing_subscriber::fmt::try_init();
    let fleet = TestFleet::enrolled().await;
    let config = bulk(3, 2);

    let minted = Arc::new(BulkProgress::new());
    let mut devices = mint_devices(
        fleet.chain.company().clone(),
        6,
        TEST_ENDPOINT,
        TEST_SCOPE,
        &config,
        &CancelSignal::new(),
        minted.clone(),
    )
    .await
    .expect("Failed to mint devices");

    assert_eq!(devices.len(), 6);
    assert_eq!(
        minted.snapshot(),
        ProgressSnapshot {
            started: 6,
            succeeded: 6,
            failed: 0,
        }
    );
    assert!(devices.iter().all(|device| device.is_ready()));

    let mut registered = fleet.local.hub.registered_devices();
    let mut ids: Vec<String> = devices.iter().map(|d| d.device_id().to_string()).collect();
    registered.sort();
    ids.sort();
    assert_eq!(registered, ids);

    let removed = Arc::new(BulkProgress::new());
    deregister_devices(
        fleet.chain.registry(),
        &config,
        &CancelSignal::new(),
        removed.clone(),
    )
    .await
    .expect("Failed to deregister devices");

    assert_eq!(removed.snapshot().succeeded, 6);
    assert_eq!(removed.snapshot().failed, 0);
    assert!(fleet.local.hub.registered_devices().is_empty());

    for device in devices.iter_mut() {
        device.dispose();
        assert!(device.hsm().is_disposed());
    }
}

#[tokio::test]
async fn test_mint_before_enrollment_counts_failures() {
    let _ = tracing_subscriber::fmt::try_init();
    let fleet = TestFleet::new(&test_config());
    let progress = Arc::new(BulkProgress::new());

    let devices = mint_devices(
        fleet.chain.company().clone(),
        3,
        TEST_ENDPOINT,
        TEST_SCOPE,
        &bulk(2, 10),
        &CancelSignal::new(),
        progress.clone(),
    )
    .await
    .expect("Bulk mint should report failures through counters");

    assert!(devices.is_empty());
    assert_eq!(
        progress.snapshot(),
        ProgressSnapshot {
            started: 3,
            succeeded: 0,
            failed: 3,
        }
    );
    assert!(fleet.local.hub.registered_devices().is_empty());
}

#[tokio::test]
async fn test_cancelled_bulk_work_starts_nothing() {
    let _ = tracing_subscriber::fmt::try_init();
    let fleet = TestFleet::enrolled().await;
    let cancel = CancelSignal::new();
    cancel.cancel();
    assert!(cancel.is_cancelled());

    let minted = Arc::new(BulkProgress::new());
    let devices = mint_devices(
        fleet.chain.company().clone(),
        5,
        TEST_ENDPOINT,
        TEST_SCOPE,
        &bulk(2, 10),
        &cancel,
        minted.clone(),
    )
    .await
    .expect("Cancelled mint should still return");
    assert!(devices.is_empty());
    assert_eq!(minted.snapshot().started, 0);

    // Make one device so deregistration has something it must leave alone
    fleet
        .chain
        .company()
        .make_device(TEST_ENDPOINT, TEST_SCOPE)
        .await
        .expect("Failed to make device");

    let removed = Arc::new(BulkProgress::new());
    deregister_devices(fleet.chain.registry(), &bulk(2, 10), &cancel, removed.clone())
        .await
        .expect("Cancelled deregistration should still return");
    assert_eq!(removed.snapshot().started, 0);
    assert_eq!(fleet.local.hub.registered_devices().len(), 1);
}

#[tokio::test]
async fn test_zero_concurrency_is_rejected() {
    let _ = tracing_subscriber::fmt::try_init();
    let fleet = TestFleet::enrolled().await;

    let result = mint_devices(
        fleet.chain.company().clone(),
        1,
        TEST_ENDPOINT,
        TEST_SCOPE,
        &bulk(0, 10),
        &CancelSignal::new(),
        Arc::new(BulkProgress::new()),
    )
    .await;
    match result {
        Err(Error::Configuration(_)) => {}
        Err(e) => panic!("Expected configuration error, got {}", e),
        Ok(_) => panic!("Zero concurrency was accepted"),
    }
}
