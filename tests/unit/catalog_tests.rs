/// Integration catalog and package registry
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use mcp_broker::registry::split_package_ref;
use mcp_broker::*;
use tempfile::NamedTempFile;
use tokio_test::{assert_err, assert_ok};

fn github_manifest() -> IntegrationManifest {
    serde_json::from_value(serde_json::json!({
        "name": "@modelcontextprotocol/server-github",
        "version": "0.6.2",
        "runtime": "node",
        "command": "npx",
        "args": ["-y", "@modelcontextprotocol/server-github@0.6.2"],
        "envVars": [
            {"name": "GITHUB_PERSONAL_ACCESS_TOKEN", "description": "token"},
            {"name": "GITHUB_API_URL", "description": "API root", "default": "https://api.github.com"}
        ]
    }))
    .unwrap()
}

#[tokio::test]
async fn test_catalog_persists_across_reopen() {
    let temp_file = NamedTempFile::new().expect("Failed to create temp file");
    let env = BTreeMap::from([("GITHUB_PERSONAL_ACCESS_TOKEN".to_string(), "ghp_x".to_string())]);

    let installed = {
        let repository = SqliteIntegrationsRepository::open(temp_file.path()).unwrap();
        repository.install(github_manifest(), env.clone()).await.unwrap()
    };

    let repository = SqliteIntegrationsRepository::open(temp_file.path()).unwrap();
    let listed = repository.list().await.unwrap();
    assert_eq!(listed, vec![installed.clone()]);
    assert_eq!(listed[0].env, env);

    let removed = repository.uninstall(&installed.id).await.unwrap();
    assert_eq!(removed.id, installed.id);
    assert!(repository.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_install_rejects_duplicates_and_unknown_ids() {
    let repository = SqliteIntegrationsRepository::open_in_memory().unwrap();
    assert_ok!(repository.install(github_manifest(), BTreeMap::new()).await);

    let err = assert_err!(repository.install(github_manifest(), BTreeMap::new()).await);
    assert!(matches!(err, RepositoryError::AlreadyInstalled { .. }));

    let err = assert_err!(repository.uninstall("missing").await);
    assert!(matches!(err, RepositoryError::NotFound { .. }));
}

#[tokio::test]
async fn test_subscribers_see_changes_until_unsubscribed() {
    let repository = SqliteIntegrationsRepository::open_in_memory().unwrap();
    let seen: Arc<Mutex<Vec<(ChangeKind, String)>>> = Arc::new(Mutex::new(Vec::new()));

    let subscription = {
        let seen = seen.clone();
        repository.subscribe(Arc::new(move |event: &IntegrationsChangedEvent| {
            seen.lock()
                .unwrap()
                .push((event.kind, event.integration.manifest.name.clone()));
        }))
    };

    let installed = repository.install(github_manifest(), BTreeMap::new()).await.unwrap();
    repository.uninstall(&installed.id).await.unwrap();

    subscription.unsubscribe();
    subscription.unsubscribe();
    assert!(!subscription.is_active());
    repository.install(github_manifest(), BTreeMap::new()).await.unwrap();

    let name = "@modelcontextprotocol/server-github".to_string();
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(ChangeKind::Added, name.clone()), (ChangeKind::Removed, name)]
    );
}

#[test]
fn test_installed_environment_overlays_defaults() {
    let env = BTreeMap::from([
        ("GITHUB_API_URL".to_string(), "https://ghe.example.com".to_string()),
        ("EXTRA".to_string(), "1".to_string()),
    ]);
    let integration = InstalledIntegration::new(github_manifest(), env);

    let resolved = integration.resolved_env();
    assert_eq!(resolved["GITHUB_API_URL"], "https://ghe.example.com");
    assert_eq!(resolved["EXTRA"], "1");
    assert_eq!(integration.missing_env(), vec!["GITHUB_PERSONAL_ACCESS_TOKEN"]);

    let description = integration.server_description();
    assert_eq!(description.runtime, "node");
    assert_eq!(description.command, "npx");
    assert_eq!(description.env, resolved);
}

#[tokio::test]
async fn test_bundled_registry_resolves_package_refs() {
    let registry = BundledRegistry::new().unwrap();

    let (name, version) = split_package_ref("@modelcontextprotocol/server-filesystem@0.6.2");
    let manifest = registry.manifest(name, version).await.unwrap();
    assert_eq!(manifest.name, "@modelcontextprotocol/server-filesystem");
    assert_eq!(manifest.version, "0.6.2");
    assert!(Runtime::parse(&manifest.runtime).is_ok());

    let err = registry
        .manifest("@modelcontextprotocol/server-filesystem", Some("9.9.9"))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::NotFound { .. }));
    assert!(err.to_string().contains("@9.9.9"));
}

#[tokio::test]
async fn test_bundled_packages_all_have_valid_runtimes() {
    let registry = BundledRegistry::new().unwrap();
    for package in registry.packages() {
        assert!(
            Runtime::parse(&package.runtime).is_ok(),
            "{} has runtime {:?}",
            package.name,
            package.runtime
        );
    }
}
