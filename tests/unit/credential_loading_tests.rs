//! API key loading with env-var fallback.
//!
//! These tests mutate process-global env vars and run serially.

use pml_mediator::config::GlobalConfig;

fn make_config() -> (tempfile::TempDir, GlobalConfig) {
    let temp = tempfile::tempdir().expect("tempdir");
    let toml = format!(
        "workspace_root = '{}'\n[cloud]\nurl = \"https://pml.example.com\"\n[worker]\ncommand = \"deno\"\n",
        temp.path().to_str().expect("utf8 path")
    );
    let config = GlobalConfig::from_toml_str(&toml).expect("config parses");
    (temp, config)
}

#[tokio::test]
#[serial_test::serial]
async fn api_key_falls_back_to_env_var() {
    let (_temp, mut config) = make_config();
    std::env::set_var("PML_API_KEY", "pml-test-key");

    config.load_credentials().await.expect("credentials load");

    std::env::remove_var("PML_API_KEY");
    assert_eq!(config.cloud.api_key.as_deref(), Some("pml-test-key"));
}

#[tokio::test]
#[serial_test::serial]
async fn missing_api_key_is_not_an_error() {
    let (_temp, mut config) = make_config();
    std::env::remove_var("PML_API_KEY");

    config.load_credentials().await.expect("credentials load");

    assert!(config.cloud.api_key.is_none());
}

#[tokio::test]
#[serial_test::serial]
async fn empty_api_key_env_var_is_ignored() {
    let (_temp, mut config) = make_config();
    std::env::set_var("PML_API_KEY", "");

    config.load_credentials().await.expect("credentials load");

    std::env::remove_var("PML_API_KEY");
    assert!(config.cloud.api_key.is_none());
}
