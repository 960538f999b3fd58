//! Provider adapters.
//!
//! The executor talks to the outside world only through [`ProviderAdapter`].
//! Two adapters ship with the crate: a deterministic in-process simulation
//! and a generic JSON-over-HTTP client.

mod adapter;
mod http;
mod simulated;

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::config::{ConfigParser, ProviderConfig, ProviderKind};
use crate::error::{ConfigError, Result, TerraceError};

pub use adapter::{
    glob_to_regex, Image, ImageQuery, ProviderAdapter, ProviderOperation, ProviderResponse,
    ResolvedResource,
};
pub use http::HttpProvider;
pub use simulated::{
    inventory_path, ProviderCall, SimulatedObject, SimulatedProvider, SIMULATED_ACCOUNT,
    SIMULATED_INVENTORY_FILE,
};

/// Builds the adapter selected by the configuration.
///
/// The simulated adapter persists its inventory at `provider.path`, or in
/// `state_dir` when no path is configured.
///
/// # Errors
///
/// Returns a configuration error if the http adapter has no endpoint or the
/// token is missing, and a provider error if the simulated inventory is
/// unreadable.
pub fn from_config(
    config: &ProviderConfig,
    region: Option<&str>,
    state_dir: &Path,
) -> Result<Arc<dyn ProviderAdapter>> {
    match config.kind {
        ProviderKind::Simulated => {
            let path = config
                .path
                .as_ref()
                .map_or_else(|| inventory_path(state_dir), Into::into);
            info!("Using simulated provider ({})", path.display());
            let mut provider = SimulatedProvider::persistent(path)?;
            if let Some(region) = region {
                provider = provider.with_region(region);
            }
            Ok(Arc::new(provider))
        }
        ProviderKind::Http => {
            let endpoint = config.endpoint.as_deref().ok_or_else(|| {
                TerraceError::Config(ConfigError::validation(
                    "http provider requires an endpoint",
                    "provider.endpoint",
                ))
            })?;
            let token = ConfigParser::provider_token()?;
            info!("Using HTTP provider at {endpoint}");
            let provider = match config.timeout_secs {
                Some(secs) => HttpProvider::with_timeout(endpoint, &token, secs)?,
                None => HttpProvider::new(endpoint, &token)?,
            };
            Ok(Arc::new(provider))
        }
    }
}
