//! Line coverage of ingest pipelines.
//!
//! Source processors are paired by position with the per-processor hit
//! counts Elasticsearch reports for the installed pipeline. Every line of a
//! processor's configuration block gets that processor's hit count.

pub mod nodestats;
pub mod processors;
pub mod report;

pub use nodestats::{NodePipelines, PipelineStats, PipelineStatsMap, ProcessorStats};
pub use processors::{offsets_to_line_numbers, Processor};
pub use report::CoverageReport;

use crate::error::{Error, Result};
use report::{
    CoberturaClass, CoberturaCoverage, CoberturaMethod, CoberturaPackage, GenericCoverage, GenericFile, LineHits,
    LineToCover,
};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const PIPELINE_EXTENSIONS: &[&str] = &["yml", "yaml", "json"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CoverageFormat {
    #[default]
    Cobertura,
    Generic,
}

impl FromStr for CoverageFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cobertura" => Ok(CoverageFormat::Cobertura),
            "generic" => Ok(CoverageFormat::Generic),
            other => Err(Error::Config(format!(
                "unknown coverage format '{}' (expected cobertura or generic)",
                other
            ))),
        }
    }
}

impl fmt::Display for CoverageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoverageFormat::Cobertura => write!(f, "cobertura"),
            CoverageFormat::Generic => write!(f, "generic"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineFormat {
    Yaml,
    Json,
}

/// Removes the per-run suffix from an installed pipeline name.
pub fn strip_nonce(name: &str) -> &str {
    match name.rfind('-') {
        Some(idx) => &name[..idx],
        None => name,
    }
}

/// A pipeline source file and the name it is installed under.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub name: String,
    pub path: PathBuf,
    pub format: PipelineFormat,
    pub content: String,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, content: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let format = match path.extension().and_then(|e| e.to_str()) {
            Some("yml") | Some("yaml") => PipelineFormat::Yaml,
            Some("json") => PipelineFormat::Json,
            _ => {
                return Err(Error::Config(format!(
                    "unsupported pipeline file {} (expected .yml, .yaml or .json)",
                    path.display()
                )))
            }
        };
        Ok(Pipeline {
            name: name.into(),
            path,
            format,
            content: content.into(),
        })
    }

    /// Name without the per-run suffix.
    pub fn original_name(&self) -> &str {
        strip_nonce(&self.name)
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn processors(&self) -> Result<Vec<Processor>> {
        match self.format {
            PipelineFormat::Yaml => processors::processors_from_yaml(&self.name, &self.content),
            PipelineFormat::Json => processors::processors_from_json(&self.name, self.content.as_bytes()),
        }
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Pipeline files of a directory, sorted by name. Each gets its file stem
/// as name until the installed one is known.
pub fn load_pipelines(dir: &Path) -> Result<Vec<Pipeline>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::from(e).context(format!("failed to read pipelines directory {}", dir.display())))?;
    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let supported = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| PIPELINE_EXTENSIONS.contains(&e));
        if path.is_file() && supported {
            paths.push(path);
        }
    }
    paths.sort();

    let mut pipelines = Vec::with_capacity(paths.len());
    for path in paths {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::from(e).context(format!("failed to read pipeline {}", path.display())))?;
        pipelines.push(Pipeline::new(file_stem(&path), path, content)?);
    }
    tracing::debug!(dir = %dir.display(), count = pipelines.len(), "loaded pipeline sources");
    Ok(pipelines)
}

/// Sets the installed name of each pipeline: `<stem>-<nonce>` when the nonce
/// is known, otherwise the only installed pipeline whose name without nonce
/// is the stem.
pub fn resolve_installed_names<'a>(
    pipelines: &mut [Pipeline],
    installed: impl IntoIterator<Item = &'a str>,
    nonce: Option<&str>,
) -> Result<()> {
    let installed: Vec<&str> = installed.into_iter().collect();
    for pipeline in pipelines.iter_mut() {
        let stem = file_stem(&pipeline.path);
        if let Some(nonce) = nonce {
            pipeline.name = format!("{}-{}", stem, nonce);
            continue;
        }
        let candidates: Vec<&&str> = installed
            .iter()
            .filter(|name| name.contains('-') && strip_nonce(name) == stem)
            .collect();
        match candidates.as_slice() {
            [name] => pipeline.name = name.to_string(),
            [] => return Err(Error::PipelineNotInstalled(stem)),
            many => {
                return Err(Error::Config(format!(
                    "pipeline {} is installed more than once ({}), pass the test run nonce",
                    stem,
                    many.iter().map(|n| **n).collect::<Vec<_>>().join(", ")
                )))
            }
        }
    }
    Ok(())
}

/// Hit count of each source processor. Compound entries of the stats are
/// skipped; what remains must pair one to one, by type, with the source.
pub fn align_processors(pipeline: &str, source: &[Processor], stats: &PipelineStats) -> Result<Vec<u64>> {
    let runtime: Vec<&ProcessorStats> = stats.processors.iter().filter(|p| !p.is_compound()).collect();
    if runtime.len() != source.len() {
        return Err(Error::CoverageDrift(format!(
            "processor count mismatch for pipeline {} (src:{} stats:{})",
            pipeline,
            source.len(),
            runtime.len()
        )));
    }
    source
        .iter()
        .zip(&runtime)
        .enumerate()
        .map(|(idx, (src, rt))| {
            if src.processor_type == rt.processor_type {
                Ok(rt.stats.count)
            } else {
                Err(Error::CoverageDrift(format!(
                    "processor type mismatch for pipeline {} processor {} (src:{} stats:{})",
                    pipeline, idx, src.processor_type, rt.processor_type
                )))
            }
        })
        .collect()
}

/// Where and how to report.
#[derive(Debug, Clone)]
pub struct CoverageOptions {
    pub format: CoverageFormat,
    /// Report package, usually the data stream under test.
    pub package: String,
    /// Directory the pipeline paths are reported relative to.
    pub base_path: PathBuf,
    pub test_type: String,
    pub timestamp: i64,
}

impl CoverageOptions {
    pub fn new(format: CoverageFormat, package: impl Into<String>, base_path: impl Into<PathBuf>) -> Self {
        CoverageOptions {
            format,
            package: package.into(),
            base_path: base_path.into(),
            test_type: "pipeline".to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

struct PipelineCoverage<'a> {
    pipeline: &'a Pipeline,
    processors: Vec<(Processor, u64)>,
}

impl PipelineCoverage<'_> {
    fn lines(&self) -> impl Iterator<Item = LineHits> + '_ {
        self.processors
            .iter()
            .flat_map(|(p, hits)| p.lines().map(move |number| LineHits { number, hits: *hits }))
    }
}

fn relative_path(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

/// Builds the coverage report of installed pipelines from their sources and
/// runtime stats.
pub fn pipeline_coverage(
    options: &CoverageOptions,
    pipelines: &[Pipeline],
    stats: &PipelineStatsMap,
) -> Result<CoverageReport> {
    let mut covered = Vec::with_capacity(pipelines.len());
    for pipeline in pipelines {
        let pipeline_stats = stats
            .get(&pipeline.name)
            .ok_or_else(|| Error::PipelineNotInstalled(pipeline.name.clone()))?;
        let processors = pipeline.processors()?;
        let hits = align_processors(&pipeline.name, &processors, pipeline_stats)?;
        tracing::debug!(
            pipeline = %pipeline.name,
            processors = processors.len(),
            "aligned pipeline processors with stats"
        );
        covered.push(PipelineCoverage {
            pipeline,
            processors: processors.into_iter().zip(hits).collect(),
        });
    }

    let report = match options.format {
        CoverageFormat::Cobertura => CoverageReport::Cobertura(cobertura(options, &covered)),
        CoverageFormat::Generic => CoverageReport::Generic(generic(options, &covered)),
    };
    tracing::info!(
        format = %options.format,
        lines_valid = report.lines_valid(),
        lines_covered = report.lines_covered(),
        "computed pipeline coverage"
    );
    Ok(report)
}

fn cobertura(options: &CoverageOptions, covered: &[PipelineCoverage<'_>]) -> CoberturaCoverage {
    let classes = covered
        .iter()
        .map(|c| CoberturaClass {
            name: c.pipeline.original_name().to_string(),
            filename: relative_path(&c.pipeline.path, &options.base_path),
            methods: c
                .processors
                .iter()
                .map(|(p, hits)| CoberturaMethod {
                    name: p.processor_type.clone(),
                    signature: p.tag.clone().unwrap_or_default(),
                    lines: p.lines().map(|number| LineHits { number, hits: *hits }).collect(),
                })
                .collect(),
            lines: c.lines().collect(),
        })
        .collect();
    CoberturaCoverage {
        sources: vec![options.base_path.to_string_lossy().into_owned()],
        packages: vec![CoberturaPackage {
            name: options.package.clone(),
            classes,
        }],
        timestamp: options.timestamp,
    }
}

fn generic(options: &CoverageOptions, covered: &[PipelineCoverage<'_>]) -> GenericCoverage {
    GenericCoverage {
        test_type: options.test_type.clone(),
        files: covered
            .iter()
            .map(|c| GenericFile {
                path: c.pipeline.path.to_string_lossy().into_owned(),
                lines: c
                    .lines()
                    .map(|l| LineToCover {
                        line_number: l.number,
                        covered: l.hits > 0,
                    })
                    .collect(),
            })
            .collect(),
    }
}
