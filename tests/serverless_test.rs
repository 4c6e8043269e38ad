mod common;

use common::{backends, json, options, profile, FakeCompose, ScriptedHttp};
use elastic_package::client::ResourceResponse;
use elastic_package::error::Error;
use elastic_package::stack::serverless::{API_KEY_ENV, PARAM_PROJECT_ID, PARAM_PROJECT_TYPE};
use elastic_package::stack::{Lifecycle, Provider, StackConfig, StackConfigStore};
use reqwest::Method;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const PROJECT_PATH: &str = "/api/v1/serverless/projects/observability/4f1c";

fn store_serverless_record(profile: &elastic_package::Profile) {
    let mut config = StackConfig {
        provider: Some(Provider::Serverless),
        elasticsearch_host: "https://4f1c.es.eu-west-1.aws.elastic.cloud".to_string(),
        kibana_host: "https://4f1c.kb.eu-west-1.aws.elastic.cloud".to_string(),
        elasticsearch_username: "admin".to_string(),
        elasticsearch_password: "s3cret".to_string(),
        ..Default::default()
    };
    config.set_param(PARAM_PROJECT_ID, "4f1c");
    config.set_param(PARAM_PROJECT_TYPE, "observability");
    StackConfigStore::new(profile).store(&config).unwrap();
}

#[tokio::test]
async fn tear_down_of_deleted_project_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let compose = Arc::new(FakeCompose::default());
    let http = ScriptedHttp::new(|_, request| {
        assert_eq!(request.path, PROJECT_PATH);
        ResourceResponse::new(404, "{}")
    });
    let lifecycle = Lifecycle::new(backends(&compose, &http, &[(API_KEY_ENV, "essu_key")]));
    let options = options(profile(dir.path(), ""));
    store_serverless_record(&options.profile);
    let ctx = CancellationToken::new();

    lifecycle.tear_down(&ctx, &options, None).await.unwrap();
    assert_eq!(
        StackConfigStore::new(&options.profile).load().unwrap().provider,
        None
    );

    // Nothing recorded any more, so the project API is not asked again.
    lifecycle
        .tear_down(&ctx, &options, Some(Provider::Serverless))
        .await
        .unwrap();
    assert_eq!(http.requests().len(), 1);
    assert_eq!(compose.count("down"), 2);
    assert_eq!(compose.projects.lock()[0], "elastic-package-stack");
}

#[tokio::test]
async fn tear_down_deletes_existing_project() {
    let dir = tempfile::tempdir().unwrap();
    let compose = Arc::new(FakeCompose::default());
    let http = ScriptedHttp::new(|_, request| {
        if request.method == Method::GET {
            json(
                200,
                serde_json::json!({
                    "id": "4f1c",
                    "name": "elastic-package-test-default",
                    "type": "observability",
                    "region_id": "aws-eu-west-1"
                }),
            )
        } else if request.method == Method::DELETE {
            ResourceResponse::new(200, "{}")
        } else {
            ResourceResponse::new(405, "")
        }
    });
    let lifecycle = Lifecycle::new(backends(&compose, &http, &[(API_KEY_ENV, "essu_key")]));
    let options = options(profile(dir.path(), ""));
    store_serverless_record(&options.profile);

    lifecycle
        .tear_down(&CancellationToken::new(), &options, None)
        .await
        .unwrap();

    assert_eq!(
        http.requests(),
        vec![
            format!("GET https://cloud.elastic.co{}", PROJECT_PATH),
            format!("DELETE https://cloud.elastic.co{}", PROJECT_PATH),
        ]
    );
}

#[tokio::test]
async fn failed_tear_down_keeps_the_record() {
    let dir = tempfile::tempdir().unwrap();
    let compose = Arc::new(FakeCompose::default());
    let lifecycle = Lifecycle::new(backends(&compose, &ScriptedHttp::unreachable(), &[]));
    let options = options(profile(dir.path(), ""));
    store_serverless_record(&options.profile);

    let err = lifecycle
        .tear_down(&CancellationToken::new(), &options, None)
        .await
        .unwrap_err();

    assert!(matches!(&err, Error::MissingEnv(name) if name == API_KEY_ENV), "{}", err);
    let config = StackConfigStore::new(&options.profile).load().unwrap();
    assert_eq!(config.provider, Some(Provider::Serverless));
    assert_eq!(config.param(PARAM_PROJECT_ID), Some("4f1c"));
}

#[tokio::test]
async fn status_without_project_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let compose = Arc::new(FakeCompose::default());
    let http = ScriptedHttp::new(|_, _| ResourceResponse::new(404, "{}"));
    let lifecycle = Lifecycle::new(backends(&compose, &http, &[(API_KEY_ENV, "essu_key")]));
    let options = options(profile(dir.path(), ""));
    store_serverless_record(&options.profile);

    let err = lifecycle
        .status(&CancellationToken::new(), &options)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnavailableStack(_)), "{}", err);
}

#[tokio::test]
async fn update_is_not_implemented() {
    let dir = tempfile::tempdir().unwrap();
    let compose = Arc::new(FakeCompose::default());
    let lifecycle = Lifecycle::new(backends(&compose, &ScriptedHttp::unreachable(), &[]));
    let options = options(profile(dir.path(), ""));
    store_serverless_record(&options.profile);

    let err = lifecycle
        .update(&CancellationToken::new(), &options, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::NotImplemented {
            provider: "serverless",
            ..
        }
    ));
}

#[tokio::test]
async fn created_project_is_recorded_before_credentials_reset() {
    let dir = tempfile::tempdir().unwrap();
    let compose = Arc::new(FakeCompose::default());
    let project = serde_json::json!({
        "id": "4f1c",
        "name": "elastic-package-test-default",
        "type": "observability",
        "region_id": "aws-eu-west-1"
    });
    let http = ScriptedHttp::new(move |_, request| {
        if request.method == Method::POST && request.path == "/api/v1/serverless/projects/observability" {
            json(201, project.clone())
        } else if request.method == Method::POST {
            ResourceResponse::new(500, "credentials backend unavailable")
        } else if request.method == Method::GET && request.path == PROJECT_PATH {
            json(200, project.clone())
        } else if request.method == Method::DELETE {
            ResourceResponse::new(200, "{}")
        } else {
            ResourceResponse::new(404, "{}")
        }
    });
    let lifecycle = Lifecycle::new(backends(&compose, &http, &[(API_KEY_ENV, "essu_key")]));
    let options = options(profile(dir.path(), ""));
    let ctx = CancellationToken::new();

    lifecycle
        .boot_up(&ctx, &options, Some(Provider::Serverless))
        .await
        .unwrap_err();

    let config = StackConfigStore::new(&options.profile).load().unwrap();
    assert_eq!(config.provider, Some(Provider::Serverless));
    assert_eq!(config.param(PARAM_PROJECT_ID), Some("4f1c"));
    assert_eq!(config.param(PARAM_PROJECT_TYPE), Some("observability"));

    lifecycle.tear_down(&ctx, &options, None).await.unwrap();
    assert!(http
        .requests()
        .contains(&format!("DELETE https://cloud.elastic.co{}", PROJECT_PATH)));
    assert_eq!(
        StackConfigStore::new(&options.profile).load().unwrap().provider,
        None
    );
}
