mod common;

use common::{backends, json, options, profile, FakeCompose, ScriptedHttp};
use elastic_package::client::ResourceResponse;
use elastic_package::stack::cloud::{
    API_KEY_ENV, DEFAULT_HOST, PARAM_DEPLOYMENT_ID, PARAM_GEOIP_EXTENSION_ID, PARAM_REF_ID,
};
use elastic_package::stack::{Lifecycle, Provider, StackConfig, StackConfigStore};
use parking_lot::Mutex;
use reqwest::Method;
use serde_json::{json as value, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const DEPLOYMENT_PATH: &str = "/api/v1/deployments/d1";
const ES_HOST: &str = "https://d1.es.europe-west3.gcp.cloud.es.io";
const KIBANA_HOST: &str = "https://d1.kb.europe-west3.gcp.cloud.es.io";

fn store_cloud_record(profile: &elastic_package::Profile, extension: Option<&str>) {
    let mut config = StackConfig {
        provider: Some(Provider::Cloud),
        elasticsearch_host: ES_HOST.to_string(),
        kibana_host: KIBANA_HOST.to_string(),
        elasticsearch_username: "elastic".to_string(),
        elasticsearch_password: "s3cret".to_string(),
        ..Default::default()
    };
    config.set_param(PARAM_DEPLOYMENT_ID, "d1");
    config.set_param(PARAM_REF_ID, "main-elasticsearch");
    if let Some(extension) = extension {
        config.set_param(PARAM_GEOIP_EXTENSION_ID, extension);
    }
    StackConfigStore::new(profile).store(&config).unwrap();
}

/// Running deployment whose hot tier has `memory` MB in `zones` zones.
fn deployment(memory: i64, zones: i64) -> Value {
    value!({
        "id": "d1",
        "name": "elastic-package-test-default",
        "resources": {
            "elasticsearch": [{
                "ref_id": "main-elasticsearch",
                "region": "gcp-europe-west3",
                "info": {
                    "metadata": {"service_url": ES_HOST},
                    "plan_info": {"current": {"plan": {
                        "cluster_topology": [
                            {"id": "hot_content", "zone_count": zones, "size": {"value": memory, "resource": "memory"}}
                        ],
                        "elasticsearch": {"version": "8.17.0"}
                    }}}
                }
            }],
            "kibana": [{
                "ref_id": "main-kibana",
                "info": {"metadata": {"service_url": KIBANA_HOST}, "plan_info": {}}
            }]
        }
    })
}

/// Answers the deployment API for an existing deployment, records update
/// bodies and fails anything else.
fn existing_deployment(memory: i64, zones: i64, updates: Arc<Mutex<Vec<Value>>>) -> Arc<ScriptedHttp> {
    ScriptedHttp::new(move |address, request| {
        if address != DEFAULT_HOST || !request.path.starts_with(DEPLOYMENT_PATH) {
            return ResourceResponse::new(500, "unavailable");
        }
        match request.method {
            Method::GET => json(200, deployment(memory, zones)),
            Method::PUT => {
                updates.lock().push(request.body.clone().unwrap_or_default());
                json(200, value!({"id": "d1"}))
            }
            _ => ResourceResponse::new(405, ""),
        }
    })
}

#[tokio::test]
async fn existing_deployment_is_resized_to_the_profile_settings() {
    let dir = tempfile::tempdir().unwrap();
    let compose = Arc::new(FakeCompose::default());
    let updates = Arc::new(Mutex::new(Vec::new()));
    let http = existing_deployment(4096, 1, updates.clone());
    let lifecycle = Lifecycle::new(backends(&compose, &http, &[(API_KEY_ENV, "ec_key")]));
    let options = options(profile(
        dir.path(),
        "stack.cloud.memory_size: 8192\nstack.cloud.zone_count: 2\n",
    ));
    store_cloud_record(&options.profile, None);

    // Kibana is not scripted, so boot stops at the enrollment token.
    let err = lifecycle
        .boot_up(&CancellationToken::new(), &options, Some(Provider::Cloud))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("enrollment token"), "{}", err);

    let updates = updates.lock();
    assert_eq!(updates.len(), 1);
    let resized = &updates[0]["resources"]["elasticsearch"][0];
    assert_eq!(resized["ref_id"], "main-elasticsearch");
    assert_eq!(resized["region"], "gcp-europe-west3");
    assert_eq!(resized["plan"]["cluster_topology"][0]["size"]["value"], 8192);
    assert_eq!(resized["plan"]["cluster_topology"][0]["zone_count"], 2);
    assert_eq!(updates[0]["prune_orphans"], false);
    assert!(http
        .requests()
        .contains(&format!("PUT {}{}", DEFAULT_HOST, DEPLOYMENT_PATH)));
}

#[tokio::test]
async fn deployment_with_requested_size_is_not_updated() {
    let dir = tempfile::tempdir().unwrap();
    let compose = Arc::new(FakeCompose::default());
    let updates = Arc::new(Mutex::new(Vec::new()));
    let http = existing_deployment(4096, 1, updates.clone());
    let lifecycle = Lifecycle::new(backends(&compose, &http, &[(API_KEY_ENV, "ec_key")]));
    let options = options(profile(dir.path(), ""));
    store_cloud_record(&options.profile, None);

    lifecycle
        .boot_up(&CancellationToken::new(), &options, Some(Provider::Cloud))
        .await
        .unwrap_err();

    assert!(updates.lock().is_empty());
    assert!(http.requests().iter().all(|r| !r.starts_with("PUT")));
}

#[tokio::test]
async fn new_deployment_gets_the_geoip_bundle() {
    let dir = tempfile::tempdir().unwrap();
    let geoip = dir.path().join("stack").join("ingest-geoip");
    std::fs::create_dir_all(&geoip).unwrap();
    std::fs::write(geoip.join("GeoLite2-City.mmdb"), "city").unwrap();

    let compose = Arc::new(FakeCompose::default());
    let updates = Arc::new(Mutex::new(Vec::new()));
    let uploads = Arc::new(Mutex::new(Vec::new()));
    let http = {
        let updates = updates.clone();
        let uploads = uploads.clone();
        ScriptedHttp::new(move |address, request| {
            let path = request.path.as_str();
            match (address, &request.method) {
                (DEFAULT_HOST, &Method::GET) if path.starts_with("/api/v1/deployments/templates/") => json(
                    200,
                    value!({"deployment_template": {"resources": {"elasticsearch": [{
                        "region": "gcp-europe-west3",
                        "plan": {"cluster_topology": [{"id": "hot_content", "zone_count": 1}], "elasticsearch": {}}
                    }]}}}),
                ),
                (DEFAULT_HOST, &Method::POST) if path == "/api/v1/deployments" => json(
                    201,
                    value!({"id": "d1", "alias": "ep-test", "resources": [{
                        "kind": "elasticsearch",
                        "ref_id": "main-elasticsearch",
                        "credentials": {"username": "elastic", "password": "s3cret"}
                    }]}),
                ),
                (DEFAULT_HOST, &Method::GET) if path.starts_with(DEPLOYMENT_PATH) => json(200, deployment(4096, 1)),
                (DEFAULT_HOST, &Method::POST) if path == "/api/v1/deployments/extensions" => {
                    json(201, value!({"id": "ext-1", "name": request.body.as_ref().unwrap()["name"]}))
                }
                (DEFAULT_HOST, &Method::PUT) if path == "/api/v1/deployments/extensions/ext-1" => {
                    uploads.lock().push(request.file.clone().unwrap());
                    json(
                        200,
                        value!({"id": "ext-1", "name": "elastic-package-default-geoip", "url": "repo://ext-1"}),
                    )
                }
                (DEFAULT_HOST, &Method::PUT) if path == DEPLOYMENT_PATH => {
                    updates.lock().push(request.body.clone().unwrap());
                    json(200, value!({"id": "d1"}))
                }
                (KIBANA_HOST, &Method::GET) if path == "/api/fleet/fleet_server_hosts" => json(
                    200,
                    value!({"items": [{"is_default": true, "host_urls": ["https://d1.fleet.europe-west3.gcp.cloud.es.io:443"]}]}),
                ),
                (KIBANA_HOST, &Method::POST) if path == "/api/fleet/agent_policies" => json(
                    200,
                    value!({"item": {"id": "elastic-agent-managed-ep", "name": "Elastic-Agent (elastic-package)"}}),
                ),
                (ES_HOST, &Method::PUT) if path == "/_cluster/settings" => json(200, value!({"acknowledged": true})),
                _ => ResourceResponse::new(500, "unavailable"),
            }
        })
    };
    let lifecycle = Lifecycle::new(backends(&compose, &http, &[(API_KEY_ENV, "ec_key")]));
    let options = options(profile(dir.path(), ""));

    let err = lifecycle
        .boot_up(&CancellationToken::new(), &options, Some(Provider::Cloud))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("enrollment token"), "{}", err);

    let config = StackConfigStore::new(&options.profile).load().unwrap();
    assert_eq!(config.param(PARAM_GEOIP_EXTENSION_ID), Some("ext-1"));

    let uploads = uploads.lock();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].field, "file");
    let bundle = zip::ZipArchive::new(std::io::Cursor::new(uploads[0].content.clone())).unwrap();
    assert_eq!(
        bundle.file_names().collect::<Vec<_>>(),
        vec!["ingest-geoip/GeoLite2-City.mmdb"]
    );

    let updates = updates.lock();
    let plan = &updates[0]["resources"]["elasticsearch"][0]["plan"];
    assert_eq!(plan["elasticsearch"]["user_bundles"][0]["url"], "repo://ext-1");
    assert_eq!(plan["elasticsearch"]["user_bundles"][0]["elasticsearch_version"], "8.17.0");
    assert_eq!(plan["deployment_template"]["id"], "gcp-general-purpose-v5");

    let requests = http.requests();
    let position = |request: String| requests.iter().position(|r| *r == request).unwrap();
    assert!(
        position(format!("PUT {}/_cluster/settings", ES_HOST))
            < position(format!("POST {}/api/v1/deployments/extensions", DEFAULT_HOST))
    );
}

#[tokio::test]
async fn tear_down_deletes_recorded_geoip_extension() {
    let dir = tempfile::tempdir().unwrap();
    let compose = Arc::new(FakeCompose::default());
    let http = ScriptedHttp::new(|_, request| match (&request.method, request.path.as_str()) {
        (&Method::GET, path) if path.starts_with(DEPLOYMENT_PATH) => json(200, deployment(4096, 1)),
        (&Method::POST, "/api/v1/deployments/d1/_shutdown?skip_snapshot=true") => json(200, value!({})),
        (&Method::DELETE, "/api/v1/deployments/extensions/ext-1") => ResourceResponse::new(200, "{}"),
        _ => ResourceResponse::new(405, ""),
    });
    let lifecycle = Lifecycle::new(backends(&compose, &http, &[(API_KEY_ENV, "ec_key")]));
    let options = options(profile(dir.path(), ""));
    store_cloud_record(&options.profile, Some("ext-1"));

    lifecycle
        .tear_down(&CancellationToken::new(), &options, None)
        .await
        .unwrap();

    let requests = http.requests();
    assert!(requests.contains(&format!(
        "POST {}/api/v1/deployments/d1/_shutdown?skip_snapshot=true",
        DEFAULT_HOST
    )));
    assert!(requests.contains(&format!(
        "DELETE {}/api/v1/deployments/extensions/ext-1",
        DEFAULT_HOST
    )));
    assert_eq!(
        StackConfigStore::new(&options.profile).load().unwrap().provider,
        None
    );
}
