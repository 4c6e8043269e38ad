use super::{interrupt_token, Workspace};
use crate::cli::CoverageArgs;
use anyhow::{bail, Context};
use elastic_package::coverage::{self, nodestats, CoverageFormat, CoverageOptions};
use elastic_package::output::UserOutput;
use elastic_package::stack::shellinit::{
    CA_CERT_ENV, ELASTICSEARCH_API_KEY_ENV, ELASTICSEARCH_PASSWORD_ENV, ELASTICSEARCH_USERNAME_ENV,
};
use elastic_package::stack::{Backends, StackConfigStore};

pub async fn run_coverage(args: CoverageArgs, profile: Option<&str>, out: &dyn UserOutput) -> anyhow::Result<()> {
    let format: CoverageFormat = args.format.parse()?;
    let mut pipelines = coverage::load_pipelines(&args.pipelines)?;
    if pipelines.is_empty() {
        bail!("no pipeline sources found in {}", args.pipelines.display());
    }

    let workspace = Workspace::load(profile)?;
    let backends = Backends::system();
    let mut config = StackConfigStore::new(&workspace.profile)
        .load()
        .context("failed to load stack configuration")?;
    if let Some(host) = args.elasticsearch_host {
        config.elasticsearch_host = host;
        for (env, value) in [
            (ELASTICSEARCH_API_KEY_ENV, &mut config.elasticsearch_api_key),
            (ELASTICSEARCH_USERNAME_ENV, &mut config.elasticsearch_username),
            (ELASTICSEARCH_PASSWORD_ENV, &mut config.elasticsearch_password),
            (CA_CERT_ENV, &mut config.ca_cert_file),
        ] {
            if let Some(v) = backends.env(env) {
                *value = v;
            }
        }
    }

    let ctx = interrupt_token();
    let client = backends.elasticsearch(&config)?;
    let installed = nodestats::fetch_node_pipelines(&ctx, client.as_ref()).await?;
    coverage::resolve_installed_names(&mut pipelines, installed.names(), args.nonce.as_deref())?;
    for pipeline in &pipelines {
        tracing::debug!(file = %pipeline.file_name(), installed = %pipeline.name, "matched pipeline");
    }
    let names: Vec<String> = pipelines.iter().map(|p| p.name.clone()).collect();
    let stats = installed.stats(&names)?;

    let package = match args.package {
        Some(package) => package,
        None => args
            .pipelines
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "pipelines".to_string()),
    };
    let options = CoverageOptions::new(format, package, &args.pipelines);
    let report = coverage::pipeline_coverage(&options, &pipelines, &stats)?;
    let xml = report.to_xml();

    match args.output {
        Some(path) => {
            std::fs::write(&path, xml).with_context(|| format!("failed to write {}", path.display()))?;
            out.message(&format!(
                "{} of {} pipeline lines covered, report written to {}",
                report.lines_covered(),
                report.lines_valid(),
                path.display()
            ));
        }
        None => out.document(&xml),
    }
    Ok(())
}
