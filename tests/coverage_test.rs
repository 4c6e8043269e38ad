//! Pipeline coverage from source files and node stats.

mod common;

use common::{ScriptedHttp, ScriptedHttpFactory};
use elastic_package::client::{ClientFactory, ClientSpec, ResourceResponse};
use elastic_package::coverage::{
    self, nodestats, processors::processors_from_json, CoverageFormat, CoverageOptions,
};
use elastic_package::error::Error;
use proptest::prelude::*;
use std::path::Path;
use tokio_util::sync::CancellationToken;

const DEFAULT_YML: &str = r#"---
description: Pipeline for test logs
processors:
  - set:
      field: event.kind
      value: event
  - grok:
      field: message
      patterns:
        - "%{WORD:verb}"
      if: ctx.message != null
  - remove:
      field: temp
      ignore_missing: true
on_failure:
  - set:
      field: error.message
      value: "{{ _ingest.on_failure_message }}"
"#;

const ACCESS_JSON: &str = r#"{
  "description": "access logs",
  "processors": [
    {
      "rename": {
        "field": "a",
        "target_field": "b"
      }
    },
    { "lowercase": { "field": "b", "tag": "lower-b" } }
  ]
}
"#;

const NODE_STATS: &str = r#"{
  "nodes": {
    "n1": {
      "ingest": {
        "pipelines": {
          "default-1700000000": {
            "count": 10, "time_in_millis": 4, "current": 0, "failed": 0,
            "processors": [
              {"set": {"type": "set", "stats": {"count": 10, "time_in_millis": 1, "current": 0, "failed": 0}}},
              {"grok": {"type": "conditional", "stats": {"count": 0, "time_in_millis": 0, "current": 0, "failed": 0}}},
              {"compound": {"type": "compound", "stats": {"count": 10, "time_in_millis": 0, "current": 0, "failed": 0}}},
              {"remove": {"type": "remove", "stats": {"count": 10, "time_in_millis": 1, "current": 0, "failed": 0}}}
            ]
          },
          "access-logs-1700000000": {
            "count": 3, "time_in_millis": 1, "current": 0, "failed": 0,
            "processors": [
              {"rename": {"type": "rename", "stats": {"count": 3, "time_in_millis": 0, "current": 0, "failed": 0}}},
              {"lowercase:lower-b": {"type": "lowercase", "stats": {"count": 0, "time_in_millis": 0, "current": 0, "failed": 0}}}
            ]
          },
          "logs-generic-default-1.0.0": {"count": 0, "processors": []}
        }
      }
    }
  }
}"#;

fn write_pipelines(dir: &Path) {
    std::fs::write(dir.join("default.yml"), DEFAULT_YML).unwrap();
    std::fs::write(dir.join("access-logs.json"), ACCESS_JSON).unwrap();
    std::fs::write(dir.join("README.md"), "not a pipeline").unwrap();
}

async fn node_stats(body: &'static str) -> nodestats::NodePipelines {
    let http = ScriptedHttp::new(move |_, request| {
        assert_eq!(request.path, nodestats::NODE_STATS_PATH);
        ResourceResponse::new(200, body)
    });
    let client = ScriptedHttpFactory(http.clone())
        .client(ClientSpec::new("https://127.0.0.1:9200"))
        .unwrap();
    let pipelines = nodestats::fetch_node_pipelines(&CancellationToken::new(), client.as_ref())
        .await
        .unwrap();
    assert_eq!(http.requests().len(), 1);
    pipelines
}

#[tokio::test]
async fn cobertura_report_from_installed_pipelines() {
    let dir = tempfile::tempdir().unwrap();
    write_pipelines(dir.path());
    let installed = node_stats(NODE_STATS).await;

    let mut pipelines = coverage::load_pipelines(dir.path()).unwrap();
    assert_eq!(
        pipelines.iter().map(|p| p.file_name()).collect::<Vec<_>>(),
        vec!["access-logs.json", "default.yml"]
    );
    coverage::resolve_installed_names(&mut pipelines, installed.names(), None).unwrap();
    let names: Vec<String> = pipelines.iter().map(|p| p.name.clone()).collect();
    assert_eq!(names, vec!["access-logs-1700000000", "default-1700000000"]);

    let stats = installed.stats(&names).unwrap();
    let options = CoverageOptions::new(CoverageFormat::Cobertura, "test.logs", dir.path());
    let report = coverage::pipeline_coverage(&options, &pipelines, &stats).unwrap();

    // default.yml: set 4-6 and remove 12-14 hit, grok 7-11 not.
    // access-logs.json: rename 5-9 hit, lowercase 10 not.
    assert_eq!(report.lines_valid(), 17);
    assert_eq!(report.lines_covered(), 11);

    let xml = report.to_xml();
    assert!(xml.contains(r#"<package name="test.logs""#), "{}", xml);
    assert!(xml.contains(r#"<class name="default" filename="default.yml""#), "{}", xml);
    assert!(xml.contains(r#"<class name="access-logs" filename="access-logs.json""#), "{}", xml);
    assert!(xml.contains(r#"<method name="lowercase" signature="lower-b""#), "{}", xml);
    assert!(xml.contains(r#"<line number="7" hits="0"></line>"#), "{}", xml);
    assert!(xml.contains(r#"<line number="4" hits="10"></line>"#), "{}", xml);
    assert!(xml.contains(r#"lines-covered="11" lines-valid="17""#), "{}", xml);
}

#[tokio::test]
async fn generic_report_lists_every_line() {
    let dir = tempfile::tempdir().unwrap();
    write_pipelines(dir.path());
    let installed = node_stats(NODE_STATS).await;

    let mut pipelines = coverage::load_pipelines(dir.path()).unwrap();
    coverage::resolve_installed_names(&mut pipelines, installed.names(), Some("1700000000")).unwrap();
    let names: Vec<String> = pipelines.iter().map(|p| p.name.clone()).collect();
    let stats = installed.stats(&names).unwrap();
    let options = CoverageOptions::new(CoverageFormat::Generic, "test.logs", dir.path());
    let report = coverage::pipeline_coverage(&options, &pipelines, &stats).unwrap();

    assert_eq!(report.lines_valid(), 17);
    assert_eq!(report.lines_covered(), 11);
    let xml = report.to_xml();
    assert!(xml.starts_with("<?xml"));
    assert!(xml.contains(r#"<coverage version="1">"#));
    let default_path = dir.path().join("default.yml");
    assert!(xml.contains(&format!(r#"<file path="{}">"#, default_path.display())), "{}", xml);
    assert!(xml.contains(r#"<lineToCover lineNumber="4" covered="true">"#));
    assert!(xml.contains(r#"<lineToCover lineNumber="11" covered="false">"#));
}

#[tokio::test]
async fn changed_source_is_reported_as_drift() {
    let dir = tempfile::tempdir().unwrap();
    write_pipelines(dir.path());
    // One processor more in the source than in the installed pipeline.
    let changed = DEFAULT_YML.replace(
        "on_failure:",
        "  - lowercase:\n      field: verb\non_failure:",
    );
    std::fs::write(dir.path().join("default.yml"), changed).unwrap();
    let installed = node_stats(NODE_STATS).await;

    let mut pipelines = coverage::load_pipelines(dir.path()).unwrap();
    coverage::resolve_installed_names(&mut pipelines, installed.names(), None).unwrap();
    let names: Vec<String> = pipelines.iter().map(|p| p.name.clone()).collect();
    let stats = installed.stats(&names).unwrap();
    let options = CoverageOptions::new(CoverageFormat::Cobertura, "test.logs", dir.path());

    let err = coverage::pipeline_coverage(&options, &pipelines, &stats).unwrap_err();
    assert!(matches!(&err, Error::CoverageDrift(msg) if msg.contains("src:4 stats:3")), "{}", err);
    assert!(err.suggestion().is_some());
}

#[tokio::test]
async fn pipelines_missing_from_the_node_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    write_pipelines(dir.path());
    std::fs::write(dir.path().join("extra.yml"), "processors: []\n").unwrap();
    let installed = node_stats(NODE_STATS).await;

    let mut pipelines = coverage::load_pipelines(dir.path()).unwrap();
    let err = coverage::resolve_installed_names(&mut pipelines, installed.names(), None).unwrap_err();
    assert!(matches!(&err, Error::PipelineNotInstalled(name) if name == "extra"), "{}", err);

    let err = installed
        .stats(&["extra-1700000000".to_string(), "default-1700000000".to_string()])
        .unwrap_err();
    assert!(matches!(&err, Error::PipelineNotInstalled(names) if names == "extra-1700000000"));
}

fn json_pipeline(processors: &[(String, usize)]) -> String {
    let entries: Vec<String> = processors
        .iter()
        .map(|(kind, fields)| {
            let body: Vec<String> = (0..*fields)
                .map(|i| format!("        \"f{}\": \"v{}\"", i, i))
                .collect();
            format!("    {{\n      \"{}\": {{\n{}\n      }}\n    }}", kind, body.join(",\n"))
        })
        .collect();
    format!("{{\n  \"processors\": [\n{}\n  ]\n}}\n", entries.join(",\n"))
}

proptest! {
    #[test]
    fn json_spans_follow_the_layout(
        processors in prop::collection::vec(("[a-z]{1,8}", 1usize..4), 1..6)
    ) {
        let content = json_pipeline(&processors);
        let parsed = processors_from_json("generated", content.as_bytes()).unwrap();
        prop_assert_eq!(parsed.len(), processors.len());

        // Entry i starts after the header, the earlier entries and its own
        // opening brace; each entry is fields + 4 lines.
        let mut first = 4;
        for (processor, (kind, fields)) in parsed.iter().zip(&processors) {
            prop_assert_eq!(&processor.processor_type, kind);
            prop_assert_eq!(processor.first_line, first);
            prop_assert_eq!(processor.last_line, first + fields + 2);
            first += fields + 4;
        }
    }
}
