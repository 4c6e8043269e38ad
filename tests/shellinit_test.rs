mod common;

use common::{backends, options, profile, FakeCompose, ScriptedHttp};
use elastic_package::error::Error;
use elastic_package::stack::shellinit::{shell_init, InitConfig, AVAILABLE_SHELLS};
use elastic_package::stack::{Lifecycle, StackConfig, StackConfigStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn remote_config() -> InitConfig {
    InitConfig {
        elasticsearch_api_key: String::new(),
        elasticsearch_host: "https://es.example.com:443".to_string(),
        elasticsearch_username: "elastic".to_string(),
        elasticsearch_password: "p4ss".to_string(),
        kibana_host: "https://kb.example.com:443".to_string(),
        ca_cert_path: String::new(),
    }
}

#[test]
fn bash_exports_every_variable() {
    let output = shell_init(&remote_config(), "bash").unwrap();
    assert_eq!(
        output,
        "export ELASTIC_PACKAGE_ELASTICSEARCH_API_KEY=\n\
         export ELASTIC_PACKAGE_ELASTICSEARCH_HOST=https://es.example.com:443\n\
         export ELASTIC_PACKAGE_ELASTICSEARCH_USERNAME=elastic\n\
         export ELASTIC_PACKAGE_ELASTICSEARCH_PASSWORD=p4ss\n\
         export ELASTIC_PACKAGE_KIBANA_HOST=https://kb.example.com:443\n\
         export ELASTIC_PACKAGE_CA_CERT="
    );
}

#[test]
fn fish_and_powershell_syntax() {
    let fish = shell_init(&remote_config(), "fish").unwrap();
    assert!(fish
        .lines()
        .any(|l| l == "set -x ELASTIC_PACKAGE_ELASTICSEARCH_PASSWORD p4ss;"));

    let pwsh = shell_init(&remote_config(), "powershell").unwrap();
    assert!(pwsh
        .lines()
        .any(|l| l == "$Env:ELASTIC_PACKAGE_KIBANA_HOST=\"https://kb.example.com:443\";"));
}

#[test]
fn every_listed_shell_is_supported() {
    for shell in AVAILABLE_SHELLS {
        let output = shell_init(&InitConfig::default(), shell).unwrap();
        assert_eq!(output.lines().count(), 6, "{}", shell);
    }
    assert!(matches!(
        shell_init(&InitConfig::default(), "tcsh"),
        Err(Error::UnknownShell(shell)) if shell == "tcsh"
    ));
}

#[test]
fn without_record_local_defaults_are_exported() {
    let dir = tempfile::tempdir().unwrap();
    let config = StackConfigStore::new(&profile(dir.path(), "")).load().unwrap();
    let output = shell_init(&InitConfig::from(&config), "sh").unwrap();
    assert!(output.contains("export ELASTIC_PACKAGE_ELASTICSEARCH_HOST=https://127.0.0.1:9200"));
    assert!(output.contains("export ELASTIC_PACKAGE_KIBANA_HOST=https://127.0.0.1:5601"));
    assert!(output.contains("export ELASTIC_PACKAGE_CA_CERT=\n") || output.ends_with("ELASTIC_PACKAGE_CA_CERT="));
}

#[tokio::test]
async fn exports_follow_the_booted_stack() {
    let dir = tempfile::tempdir().unwrap();
    let compose = Arc::new(FakeCompose::default());
    let lifecycle = Lifecycle::new(backends(&compose, &ScriptedHttp::unreachable(), &[]));
    let options = options(profile(dir.path(), ""));
    lifecycle
        .boot_up(&CancellationToken::new(), &options, None)
        .await
        .unwrap();

    let config: StackConfig = StackConfigStore::new(&options.profile).load().unwrap();
    let init = InitConfig::from(&config);
    assert_eq!(init.elasticsearch_password, "changeme");
    let output = shell_init(&init, "zsh").unwrap();
    let ca = dir.path().join("certs/ca-cert.pem");
    assert!(output.ends_with(&format!("export ELASTIC_PACKAGE_CA_CERT={}", ca.display())));
}
