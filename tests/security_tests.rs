//! Security gate tests
//!
//! Policy enforcement through the full load path: ban lists, origins,
//! permission validation, trust tiers, and the marketplace install
//! boundary.

mod common;

use common::*;
use std::collections::HashMap;

use modhost::{ModuleError, ModuleState, Permission, RawManifest, TrustTier};

#[tokio::test]
async fn banned_module_never_loads() {
    let fixture = RuntimeFixture::with_config(|config| {
        config.security.banned_modules.insert("evil".to_string());
    });
    fixture.add_module("evil", "1.0.0", "");

    let err = fixture.manager.load("evil").await.unwrap_err();
    assert!(matches!(err, ModuleError::SecurityRejection(_)));
    assert!(fixture.manager.snapshot("evil").await.is_none());
}

#[tokio::test]
async fn ban_added_after_startup_applies_to_next_load() {
    let fixture = RuntimeFixture::new();
    fixture.add_module("late-ban", "1.0.0", "");

    fixture.manager.update_policy(|policy| {
        policy.banned_modules.insert("late-ban".to_string());
    });

    let err = fixture.manager.load("late-ban").await.unwrap_err();
    assert!(matches!(err, ModuleError::SecurityRejection(_)));
}

#[tokio::test]
async fn unknown_permission_rejected_at_validation() {
    let fixture = RuntimeFixture::new();
    fixture.write_manifest(
        "greedy",
        "1.0.0",
        "permissions = [\"network\", \"rule_the_world\"]\n",
    );
    fixture.register_mock("greedy", MockBehavior::default());

    // The invalid manifest never becomes a candidate, so the load cannot
    // find it; it is never passed through with a default grant.
    let err = fixture.manager.load("greedy").await.unwrap_err();
    assert!(matches!(err, ModuleError::ModuleNotFound(_)));
}

#[tokio::test]
async fn dangerous_permissions_derive_strict_tier() {
    let fixture = RuntimeFixture::new();
    fixture.add_module("fs-tool", "1.0.0", "permissions = [\"filesystem\"]\n");
    fixture.add_module("quiet", "1.0.0", "permissions = [\"network\"]\n");

    fixture.manager.load("fs-tool").await.unwrap();
    fixture.manager.load("quiet").await.unwrap();

    let fs_tool = fixture.manager.snapshot("fs-tool").await.unwrap();
    assert_eq!(fs_tool.tier, TrustTier::Strict);
    assert_eq!(fs_tool.granted, vec![Permission::Filesystem]);

    let quiet = fixture.manager.snapshot("quiet").await.unwrap();
    assert_eq!(quiet.tier, TrustTier::Moderate);
}

#[tokio::test]
async fn trusted_listing_overrides_dangerous_tier() {
    let fixture = RuntimeFixture::with_config(|config| {
        config.security.trusted_modules.insert("core-ext".to_string());
    });
    fixture.add_module("core-ext", "1.0.0", "permissions = [\"process_control\"]\n");

    fixture.manager.load("core-ext").await.unwrap();
    let snapshot = fixture.manager.snapshot("core-ext").await.unwrap();
    assert_eq!(snapshot.tier, TrustTier::Trusted);
}

#[tokio::test]
async fn untrusted_origin_is_rejected() {
    let fixture = RuntimeFixture::with_config(|config| {
        config
            .security
            .trusted_origins
            .insert("https://modules.example".to_string());
    });
    fixture.write_manifest(
        "imported",
        "1.0.0",
        "origin = \"https://elsewhere.example\"\n",
    );
    fixture.register_mock("imported", MockBehavior::default());

    let err = fixture.manager.load("imported").await.unwrap_err();
    assert!(matches!(err, ModuleError::SecurityRejection(_)));
}

#[tokio::test]
async fn install_package_scans_supplied_source() {
    let fixture = RuntimeFixture::new();
    let raw = RawManifest::from_toml_str(
        "name = \"sneaky\"\nversion = \"1.0.0\"\nentry = \"factory:sneaky\"\n",
    )
    .unwrap();

    let err = fixture
        .manager
        .install_package(
            raw,
            Some("fn main() { std::process::exit(0); }".to_string()),
            None,
            HashMap::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ModuleError::SecurityRejection(_)));
}

#[tokio::test]
async fn installed_package_loads_like_a_local_module() {
    let fixture = RuntimeFixture::new();
    fixture.register_mock("remote", MockBehavior::default());

    let raw = RawManifest::from_toml_str(
        "name = \"remote\"\nversion = \"1.0.0\"\nentry = \"factory:remote\"\n",
    )
    .unwrap();
    fixture
        .manager
        .install_package(raw, None, None, HashMap::new())
        .await
        .unwrap();

    fixture.manager.load("remote").await.unwrap();
    assert_eq!(
        fixture.manager.module_state("remote").await,
        Some(ModuleState::Running)
    );
}

#[tokio::test]
async fn install_package_verifies_artifact_digest() {
    let fixture = RuntimeFixture::new();
    let payload = b"module payload bytes";
    let digest = {
        use sha2::Digest;
        hex::encode(sha2::Sha256::digest(payload))
    };

    let manifest_toml = format!(
        "name = \"signed\"\nversion = \"1.0.0\"\nentry = \"factory:signed\"\nsha256 = \"{}\"\n",
        digest
    );

    let raw = RawManifest::from_toml_str(&manifest_toml).unwrap();
    fixture
        .manager
        .install_package(raw, None, Some(payload), HashMap::new())
        .await
        .unwrap();

    let raw = RawManifest::from_toml_str(&manifest_toml).unwrap();
    let err = fixture
        .manager
        .install_package(raw, None, Some(b"tampered payload"), HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ModuleError::SecurityRejection(_)));
}
