use super::{interrupt_token, Workspace};
use crate::cli::{StackArgs, StackCommands};
use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use elastic_package::install::DEFAULT_STACK_VERSION;
use elastic_package::output::{render_table, UserOutput};
use elastic_package::stack::shellinit::{self, InitConfig};
use elastic_package::stack::{Backends, DumpOptions, Lifecycle, Options, Provider, StackConfigStore};
use std::collections::BTreeMap;
use std::sync::Arc;

pub async fn run_stack(
    cmd: StackCommands,
    profile: Option<&str>,
    out: Arc<dyn UserOutput>,
) -> anyhow::Result<()> {
    let workspace = Workspace::load(profile)?;
    let lifecycle = Lifecycle::new(Backends::system());
    let ctx = interrupt_token();

    match cmd {
        StackCommands::Up {
            services,
            daemon,
            stack,
        } => {
            let declared = parse_provider(&stack)?;
            let options = options(&workspace, &stack, services, daemon, out.clone())?;
            out.message(&format!(
                "Boot up the Elastic stack (profile {}, version {})",
                options.profile.name(),
                options.stack_version
            ));
            lifecycle.boot_up(&ctx, &options, declared).await?;
            out.message("Done");
        }
        StackCommands::Down { stack } => {
            let declared = parse_provider(&stack)?;
            let options = options(&workspace, &stack, Vec::new(), false, out.clone())?;
            out.message("Take down the Elastic stack");
            lifecycle.tear_down(&ctx, &options, declared).await?;
            out.message("Done");
        }
        StackCommands::Update { stack } => {
            let declared = parse_provider(&stack)?;
            let options = options(&workspace, &stack, Vec::new(), false, out.clone())?;
            out.message("Update the Elastic stack");
            lifecycle.update(&ctx, &options, declared).await?;
            out.message("Done");
        }
        StackCommands::Status { version } => {
            let stack = StackArgs {
                version,
                provider: None,
                parameters: Vec::new(),
            };
            let options = options(&workspace, &stack, Vec::new(), false, out.clone())?;
            let statuses = lifecycle.status(&ctx, &options).await?;
            if statuses.is_empty() {
                out.message("There are no service containers");
                return Ok(());
            }
            let rows: Vec<Vec<String>> = statuses
                .into_iter()
                .map(|s| vec![s.name, s.version, s.status])
                .collect();
            out.document(&render_table(&["SERVICE", "VERSION", "STATUS"], &rows));
        }
        StackCommands::Dump {
            output,
            since,
            services,
        } => {
            let since = since.as_deref().map(parse_since).transpose()?;
            let options = DumpOptions {
                profile: workspace.profile.clone(),
                output: Some(output.clone()),
                services,
                since,
            };
            out.message("Dump Elastic stack data");
            let results = lifecycle.dump(&ctx, &options).await?;
            for result in &results {
                if let Some(file) = &result.logs_file {
                    tracing::debug!(service = %result.service_name, file = %file.display(), "dumped logs");
                }
            }
            out.message(&format!(
                "Logs of {} service(s) written to {}",
                results.len(),
                output.display()
            ));
        }
        StackCommands::Shellinit { shell } => {
            let shell = match shell {
                Some(shell) => shell,
                None => shellinit::detect_shell()?,
            };
            // Without a record these are the local compose defaults.
            let config = StackConfigStore::new(&workspace.profile)
                .load()
                .context("failed to load stack configuration")?;
            out.document(&shellinit::shell_init(&InitConfig::from(&config), &shell)?);
            tracing::debug!(help = shellinit::help_text(&shell), "shell init rendered");
        }
    }

    Ok(())
}

fn parse_provider(stack: &StackArgs) -> anyhow::Result<Option<Provider>> {
    Ok(stack.provider.as_deref().map(str::parse).transpose()?)
}

fn parse_parameters(raw: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    let mut parameters = BTreeMap::new();
    for item in raw {
        let Some((key, value)) = item.split_once('=') else {
            bail!("invalid parameter '{}', expected key=value", item);
        };
        parameters.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(parameters)
}

fn parse_since(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    let since = DateTime::parse_from_rfc3339(raw).with_context(|| format!("invalid --since value '{}'", raw))?;
    Ok(since.with_timezone(&Utc))
}

fn options(
    workspace: &Workspace,
    stack: &StackArgs,
    services: Vec<String>,
    daemon_mode: bool,
    output: Arc<dyn UserOutput>,
) -> anyhow::Result<Options> {
    Ok(Options {
        profile: workspace.profile.clone(),
        stack_version: stack
            .version
            .clone()
            .unwrap_or_else(|| DEFAULT_STACK_VERSION.to_string()),
        services,
        daemon_mode,
        parameters: parse_parameters(&stack.parameters)?,
        app_config: workspace.app_config.clone(),
        output,
    })
}
