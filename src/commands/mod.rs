mod coverage;
mod stack;

pub use coverage::run_coverage;
pub use stack::run_stack;

use anyhow::Context;
use elastic_package::install::ApplicationConfiguration;
use elastic_package::profile::{self, Profile};
use tokio_util::sync::CancellationToken;

/// Application configuration and the selected profile.
pub struct Workspace {
    pub app_config: ApplicationConfiguration,
    pub profile: Profile,
}

impl Workspace {
    pub fn load(profile_name: Option<&str>) -> anyhow::Result<Self> {
        let data_home = profile::data_home()?;
        let app_config = ApplicationConfiguration::load(&data_home)?;
        let name = match profile_name {
            Some(name) => name.to_string(),
            None => app_config.current_profile(),
        };
        let profile = Profile::load(&data_home, &name).with_context(|| format!("failed to load profile {}", name))?;
        tracing::debug!(profile = %name, data_home = %data_home.display(), "loaded profile");
        Ok(Workspace {
            app_config,
            profile,
        })
    }
}

/// Token cancelled on Ctrl+C.
pub fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, cancelling");
            cancel.cancel();
        }
    });
    token
}
