//! Ingest pipeline statistics from the nodes stats API.

use crate::client::{ResourceClient, ResourceRequest};
use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

pub const NODE_STATS_PATH: &str = "/_nodes/stats/ingest?filter_path=nodes.*.ingest.pipelines";

/// Type reported for processors that wrap others, such as `foreach` or
/// `on_failure` chains.
pub const COMPOUND_TYPE: &str = "compound";
/// Type reported for processors with an `if` condition.
pub const CONDITIONAL_TYPE: &str = "conditional";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StatsRecord {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub current: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub time_in_millis: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorStats {
    /// Processor name from the entry key, without the tag suffix.
    pub processor_type: String,
    /// Whatever followed the first `:` of the key, usually the tag.
    pub extra: Option<String>,
    pub conditional: bool,
    pub stats: StatsRecord,
}

impl ProcessorStats {
    pub fn is_compound(&self) -> bool {
        self.processor_type == COMPOUND_TYPE
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub stats: StatsRecord,
    pub processors: Vec<ProcessorStats>,
}

pub type PipelineStatsMap = BTreeMap<String, PipelineStats>;

#[derive(Deserialize)]
struct NodesResponse {
    #[serde(default)]
    nodes: BTreeMap<String, NodeEntry>,
}

#[derive(Deserialize)]
struct NodeEntry {
    #[serde(default)]
    ingest: IngestEntry,
}

#[derive(Default, Deserialize)]
struct IngestEntry {
    #[serde(default)]
    pipelines: BTreeMap<String, PipelineEntry>,
}

#[derive(Clone, Deserialize)]
struct PipelineEntry {
    #[serde(flatten)]
    stats: StatsRecord,
    #[serde(default)]
    processors: Vec<BTreeMap<String, ProcessorEntry>>,
}

#[derive(Clone, Deserialize)]
struct ProcessorEntry {
    #[serde(rename = "type")]
    processor_type: String,
    #[serde(default)]
    stats: StatsRecord,
}

/// Pipelines known to the single node of a test cluster.
pub struct NodePipelines {
    pipelines: BTreeMap<String, PipelineEntry>,
}

impl NodePipelines {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let response: NodesResponse = serde_json::from_slice(body)
            .map_err(|e| Error::NodeStats(format!("failed to decode response: {}", e)))?;
        if response.nodes.len() != 1 {
            return Err(Error::NodeStats(format!(
                "need exactly one Elasticsearch node in stats response (got {})",
                response.nodes.len()
            )));
        }
        let pipelines = response
            .nodes
            .into_values()
            .next()
            .map(|node| node.ingest.pipelines)
            .unwrap_or_default();
        Ok(NodePipelines { pipelines })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pipelines.keys().map(String::as_str)
    }

    /// Stats of the named pipelines. Every missing pipeline is reported in
    /// a single error.
    pub fn stats(&self, names: &[String]) -> Result<PipelineStatsMap> {
        let missing: Vec<&str> = names
            .iter()
            .filter(|n| !self.pipelines.contains_key(n.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(Error::PipelineNotInstalled(missing.join(", ")));
        }

        let mut result = PipelineStatsMap::new();
        for name in names {
            let entry = &self.pipelines[name.as_str()];
            let processors = entry
                .processors
                .iter()
                .enumerate()
                .map(|(idx, p)| processor_stats(name, idx, p))
                .collect::<Result<Vec<_>>>()?;
            result.insert(
                name.clone(),
                PipelineStats {
                    stats: entry.stats.clone(),
                    processors,
                },
            );
        }
        Ok(result)
    }
}

fn processor_stats(pipeline: &str, idx: usize, entry: &BTreeMap<String, ProcessorEntry>) -> Result<ProcessorStats> {
    let mut entries = entry.iter();
    let (Some((key, processor)), None) = (entries.next(), entries.next()) else {
        return Err(Error::NodeStats(format!(
            "processor {} of pipeline {} has {} keys, expected a single-key map",
            idx,
            pipeline,
            entry.len()
        )));
    };
    let (processor_type, extra) = match key.split_once(':') {
        Some((t, extra)) => (t, Some(extra.to_string())),
        None => (key.as_str(), None),
    };
    let conditional = processor.processor_type == CONDITIONAL_TYPE;
    if processor.processor_type != processor_type && !conditional {
        return Err(Error::NodeStats(format!(
            "processor {} of pipeline {} has type {} but key {}",
            idx, pipeline, processor.processor_type, key
        )));
    }
    Ok(ProcessorStats {
        processor_type: processor_type.to_string(),
        extra,
        conditional,
        stats: processor.stats.clone(),
    })
}

pub async fn fetch_node_pipelines(ctx: &CancellationToken, client: &dyn ResourceClient) -> Result<NodePipelines> {
    let response = client
        .send(ctx, ResourceRequest::get(NODE_STATS_PATH))
        .await?
        .expect(&[200], "failed to get node stats")?;
    NodePipelines::parse(&response.body)
}
