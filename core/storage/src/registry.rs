//! Provider registry and process-wide storage mode.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::provider::StorageProvider;
use snapmatch_common::{Error, Result};

/// Provider name that selects local-only operation.
pub const LOCAL_ONLY: &str = "local";

/// Factory function type for creating providers.
pub type ProviderFactory = Box<dyn Fn(Value) -> Result<Arc<dyn StorageProvider>> + Send + Sync>;

/// Registry for storage provider factories.
///
/// Maps a configured provider name to a constructor taking the flat settings
/// map. New backends are added with [`register`](Self::register) without
/// touching any caller.
pub struct ProviderRegistry {
    factories: BTreeMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with the built-in providers: `memory`, `gdrive`, `gcs`, `s3`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.insert(
            "memory",
            Box::new(|_| Ok(Arc::new(crate::memory::MemoryProvider::new()))),
        );
        registry.insert("gdrive", Box::new(crate::gdrive::create_gdrive_provider));
        registry.insert("gcs", Box::new(crate::gcs::create_gcs_provider));
        registry.insert("s3", Box::new(crate::s3::create_s3_provider));
        registry
    }

    fn insert(&mut self, name: &str, factory: ProviderFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Register a provider factory.
    ///
    /// # Errors
    /// - `AlreadyExists` if the name is taken
    /// - `InvalidInput` for the reserved name `local`
    pub fn register(&mut self, name: impl Into<String>, factory: ProviderFactory) -> Result<()> {
        let name = name.into();
        if name == LOCAL_ONLY {
            return Err(Error::InvalidInput(format!(
                "Provider name '{}' is reserved",
                LOCAL_ONLY
            )));
        }
        if self.factories.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Provider '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Build a provider without initializing it.
    ///
    /// # Errors
    /// - `Configuration` if the name is unknown or the settings are invalid
    pub fn resolve(&self, name: &str, settings: Value) -> Result<Arc<dyn StorageProvider>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            Error::Configuration(format!(
                "Unknown storage provider '{}' (known: {}, {})",
                name,
                LOCAL_ONLY,
                self.providers().join(", ")
            ))
        })?;
        factory(settings)
    }

    /// Build a provider and establish its session.
    pub async fn connect(&self, name: &str, settings: Value) -> Result<Arc<dyn StorageProvider>> {
        let provider = self.resolve(name, settings)?;
        provider.initialize().await?;
        Ok(provider)
    }

    /// Registered provider names, sorted.
    pub fn providers(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn has_provider(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with default providers.
pub fn create_default_registry() -> ProviderRegistry {
    ProviderRegistry::with_defaults()
}

fn default_required() -> bool {
    true
}

/// Storage section of the application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Registered provider name, or `local`.
    pub provider: String,
    /// When false, a provider that fails to connect degrades to local-only.
    #[serde(default = "default_required")]
    pub required: bool,
    /// Flat provider-specific settings.
    #[serde(default)]
    pub settings: Value,
}

impl StorageConfig {
    pub fn local_only() -> Self {
        Self {
            provider: LOCAL_ONLY.to_string(),
            required: false,
            settings: Value::Null,
        }
    }
}

/// Process-wide storage mode, decided once at startup.
#[derive(Clone)]
pub enum StorageMode {
    /// Objects are stored remotely and mirrored locally.
    Remote(Arc<dyn StorageProvider>),
    /// Only the local mirror is used.
    LocalOnly,
}

impl StorageMode {
    /// Resolve and connect the configured provider.
    ///
    /// Unknown providers and invalid settings are always fatal. A provider
    /// that fails to connect is fatal when `required`, otherwise the process
    /// continues local-only.
    pub async fn connect(registry: &ProviderRegistry, config: &StorageConfig) -> Result<Self> {
        if config.provider == LOCAL_ONLY {
            info!("Storage mode: local only");
            return Ok(Self::LocalOnly);
        }

        let provider = registry.resolve(&config.provider, config.settings.clone())?;
        match provider.initialize().await {
            Ok(()) => {
                info!(provider = provider.name(), "Storage mode: remote");
                Ok(Self::Remote(provider))
            }
            Err(e) if !config.required => {
                warn!(provider = %config.provider, error = %e, "Remote storage unavailable, continuing local only");
                Ok(Self::LocalOnly)
            }
            Err(e) => Err(e),
        }
    }

    pub fn provider(&self) -> Option<&Arc<dyn StorageProvider>> {
        match self {
            Self::Remote(provider) => Some(provider),
            Self::LocalOnly => None,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}

impl fmt::Debug for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote(provider) => f.debug_tuple("Remote").field(&provider.name()).finish(),
            Self::LocalOnly => f.write_str("LocalOnly"),
        }
    }
}
