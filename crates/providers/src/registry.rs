//! Provider registry — name → adapter factory.
//!
//! Nodes reference providers by name; the registry resolves the name
//! against the configured provider table and builds the matching
//! adapter variant. Names starting with `mock` resolve to the built-in
//! mock transport even without configuration (dev + test path), so a
//! fresh daemon can run offline demos.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use ag_domain::config::{ProviderConfig, ProviderTransport};
use ag_domain::error::{Error, Result};

use crate::api::ApiAdapter;
use crate::cli_stateful::CliStatefulAdapter;
use crate::cli_stream_json::CliStreamJsonAdapter;
use crate::mock::{MockAdapter, MockScript};
use crate::traits::{EventSink, ProviderAdapter};

pub struct ProviderRegistry {
    providers: HashMap<String, ProviderConfig>,
    /// One shared script per mock provider name.
    mock_scripts: Mutex<HashMap<String, Arc<MockScript>>>,
}

impl ProviderRegistry {
    pub fn from_config(providers: &HashMap<String, ProviderConfig>) -> Self {
        Self {
            providers: providers.clone(),
            mock_scripts: Mutex::new(HashMap::new()),
        }
    }

    pub fn empty() -> Self {
        Self::from_config(&HashMap::new())
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Resolve a provider name to its configuration. Unknown names
    /// prefixed `mock` fall back to the built-in mock transport.
    pub fn config_for(&self, name: &str) -> Result<ProviderConfig> {
        if let Some(config) = self.providers.get(name) {
            return Ok(config.clone());
        }
        if name.starts_with("mock") {
            return Ok(ProviderConfig {
                transport: ProviderTransport::Mock,
                ..Default::default()
            });
        }
        Err(Error::not_found("provider", name))
    }

    /// The scripted-turn queue for a mock provider (tests push turns
    /// here before driving nodes).
    pub fn mock_script(&self, name: &str) -> Arc<MockScript> {
        self.mock_scripts
            .lock()
            .entry(name.to_owned())
            .or_default()
            .clone()
    }

    /// Build the adapter for a provider name, wiring its event sink.
    pub fn build(&self, name: &str, events: EventSink) -> Result<Arc<dyn ProviderAdapter>> {
        let config = self.config_for(name)?;
        let adapter: Arc<dyn ProviderAdapter> = match config.transport {
            ProviderTransport::Cli if config.stateful_streaming => {
                Arc::new(CliStatefulAdapter::new(name, config, events))
            }
            ProviderTransport::Cli => Arc::new(CliStreamJsonAdapter::new(name, config, events)),
            ProviderTransport::Api => Arc::new(ApiAdapter::new(name, config, events)),
            ProviderTransport::Mock => {
                Arc::new(MockAdapter::new(config, events, self.mock_script(name)))
            }
        };
        Ok(adapter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn registry_with(name: &str, config: ProviderConfig) -> ProviderRegistry {
        ProviderRegistry::from_config(&HashMap::from([(name.to_owned(), config)]))
    }

    #[test]
    fn unknown_provider_is_not_found() {
        let registry = ProviderRegistry::empty();
        assert!(matches!(
            registry.config_for("claude"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn mock_names_fall_back_to_mock_transport() {
        let registry = ProviderRegistry::empty();
        let config = registry.config_for("mock2").unwrap();
        assert_eq!(config.transport, ProviderTransport::Mock);
    }

    #[test]
    fn configured_name_wins_over_fallback() {
        let config = ProviderConfig {
            transport: ProviderTransport::Mock,
            stateful_streaming: true,
            ..Default::default()
        };
        let registry = registry_with("mock", config);
        assert!(registry.config_for("mock").unwrap().stateful_streaming);
    }

    #[test]
    fn mock_script_is_shared_per_name() {
        let registry = ProviderRegistry::empty();
        let a = registry.mock_script("mock");
        let b = registry.mock_script("mock");
        a.push(crate::mock::MockTurn::text("x"));
        assert_eq!(b.remaining(), 1);
        assert_eq!(registry.mock_script("mock2").remaining(), 0);
    }

    #[tokio::test]
    async fn build_selects_adapter_by_transport() {
        let (tx, _rx) = mpsc::channel(8);
        let cli = ProviderConfig {
            transport: ProviderTransport::Cli,
            command: Some("assistant".into()),
            stateful_streaming: true,
            ..Default::default()
        };
        let registry = registry_with("assistant", cli);
        let adapter = registry.build("assistant", tx.clone()).unwrap();
        assert!(adapter.supports_resume());

        let adapter = registry.build("mock", tx).unwrap();
        assert!(!adapter.supports_resume());
    }
}
