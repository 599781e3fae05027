//! Provider registry: resolves `"provider/model"` ids to provider instances.
//!
//! Providers are registered as factories and instantiated lazily the first
//! time a model id naming them is resolved. Instances are cached, so each
//! factory runs at most once until it is overridden.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use bigtalk_core::error::{Error, Result};
use bigtalk_core::provider::Provider;
use tracing::{debug, info, warn};

/// Creates a provider on first use.
pub type ProviderFactory = Arc<dyn Fn() -> Arc<dyn Provider> + Send + Sync>;

/// Routes model ids to the correct provider.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: RwLock<HashMap<String, ProviderFactory>>,
    instances: Mutex<HashMap<String, Arc<dyn Provider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider factory under `name`.
    ///
    /// Registering a name twice is an error unless `override_existing` is set,
    /// in which case the factory is replaced and any cached instance evicted.
    pub fn add_provider<F>(&self, name: impl Into<String>, factory: F, override_existing: bool) -> Result<()>
    where
        F: Fn() -> Arc<dyn Provider> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut factories = self.factories.write().unwrap_or_else(|e| e.into_inner());

        if factories.contains_key(&name) {
            if !override_existing {
                return Err(Error::config(format!(
                    "Provider \"{name}\" is already registered"
                )));
            }
            let evicted = self
                .instances
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&name);
            debug!(provider = %name, evicted = evicted.is_some(), "Overriding provider factory");
        }

        factories.insert(name, Arc::new(factory));
        Ok(())
    }

    /// Register an already constructed provider.
    pub fn register(&self, name: impl Into<String>, provider: Arc<dyn Provider>) -> Result<()> {
        self.add_provider(name, move || Arc::clone(&provider), false)
    }

    /// Resolve `"provider/model-name"` into the provider and the bare model name.
    ///
    /// The id is split on the first `/`, so model names may contain slashes
    /// themselves (`"openrouter/anthropic/claude-sonnet-4"`).
    pub fn resolve(&self, model_id: &str) -> Result<(Arc<dyn Provider>, String)> {
        let (provider_name, model_name) = split_model_id(model_id)?;
        let provider = self.get_or_create(provider_name)?;
        Ok((provider, model_name.to_string()))
    }

    /// Get the (possibly freshly created) provider registered under `name`.
    pub fn get_or_create(&self, name: &str) -> Result<Arc<dyn Provider>> {
        if let Some(existing) = self
            .instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
        {
            return Ok(Arc::clone(existing));
        }

        let factory = self
            .factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned();
        let Some(factory) = factory else {
            return Err(Error::config(format!(
                "Provider \"{name}\" is not supported (registered: {})",
                self.names().join(", ")
            )));
        };

        let created = factory();
        info!(provider = %name, "Instantiated provider");

        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        Ok(Arc::clone(
            instances.entry(name.to_string()).or_insert(created),
        ))
    }

    /// Whether the provider registered under `name` has been instantiated.
    pub fn is_instantiated(&self, name: &str) -> bool {
        self.instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    /// List all registered provider names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Close every instantiated provider and drop the cache.
    ///
    /// All providers are closed even if some fail; the first failure is returned.
    pub async fn close(&self) -> Result<()> {
        let instances: Vec<(String, Arc<dyn Provider>)> = self
            .instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();

        let mut first_error = None;
        for (name, provider) in instances {
            if let Err(e) = provider.close().await {
                warn!(provider = %name, error = %e, "Failed to close provider");
                first_error.get_or_insert(Error::Provider(e));
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

/// Split `"provider/model"` on the first `/`.
pub fn split_model_id(model_id: &str) -> Result<(&str, &str)> {
    match model_id.split_once('/') {
        Some((provider, model)) if !provider.is_empty() && !model.is_empty() => {
            Ok((provider, model))
        }
        _ => Err(Error::config(format!(
            "Expected format 'provider/model', got '{model_id}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedProvider;
    use bigtalk_core::message::Message;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_factory(counter: Arc<AtomicUsize>) -> impl Fn() -> Arc<dyn Provider> + Send + Sync {
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(ScriptedProvider::new("test", vec![Message::assistant("hi")])) as Arc<dyn Provider>
        }
    }

    #[test]
    fn split_on_first_slash() {
        assert_eq!(split_model_id("test/test-4").unwrap(), ("test", "test-4"));
        assert_eq!(
            split_model_id("openrouter/anthropic/claude").unwrap(),
            ("openrouter", "anthropic/claude")
        );
    }

    #[test]
    fn bad_format_is_config_error() {
        for bad in ["bad-format", "/model", "provider/", ""] {
            let err = split_model_id(bad).unwrap_err();
            assert!(matches!(err, Error::Config { .. }), "{bad}");
            assert!(err.to_string().contains("Expected format"));
        }
    }

    #[test]
    fn lazy_instantiation_and_reuse() {
        let registry = ProviderRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .add_provider("reuse", counting_factory(calls.clone()), false)
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!registry.is_instantiated("reuse"));

        let (_, model) = registry.resolve("reuse/m1").unwrap();
        assert_eq!(model, "m1");
        registry.resolve("reuse/m2").unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_instantiated("reuse"));
    }

    #[test]
    fn unknown_provider_is_config_error() {
        let registry = ProviderRegistry::new();
        let err = registry.resolve("unknown/model").err().unwrap();
        assert!(matches!(err, Error::Config { .. }));
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn unknown_provider_lists_registered_names() {
        let registry = ProviderRegistry::new();
        registry.register("alpha", Arc::new(ScriptedProvider::new("a", vec![]))).unwrap();
        registry.register("beta", Arc::new(ScriptedProvider::new("b", vec![]))).unwrap();

        let err = registry.get_or_create("gamma").err().unwrap();
        assert!(err.to_string().contains("(registered: alpha, beta)"));
    }

    #[test]
    fn unknown_lookups_survive_concurrent_registration() {
        let registry = ProviderRegistry::new();
        registry.register("base", Arc::new(ScriptedProvider::new("b", vec![]))).unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..500 {
                    registry
                        .add_provider("churn", counting_factory(Arc::default()), true)
                        .unwrap();
                }
            });
            for _ in 0..500 {
                assert!(registry.get_or_create("missing").is_err());
            }
        });

        assert_eq!(registry.names(), ["base", "churn"]);
    }

    #[test]
    fn duplicate_registration_rejected() {
        let registry = ProviderRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .add_provider("dup", counting_factory(calls.clone()), false)
            .unwrap();
        let err = registry
            .add_provider("dup", counting_factory(calls), false)
            .unwrap_err();
        assert!(err.to_string().contains("\"dup\" is already registered"));
    }

    #[test]
    fn override_evicts_cached_instance() {
        let registry = ProviderRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        registry
            .add_provider("my_llm", counting_factory(first.clone()), false)
            .unwrap();
        registry.resolve("my_llm/m").unwrap();
        assert!(registry.is_instantiated("my_llm"));

        registry
            .add_provider("my_llm", counting_factory(second.clone()), true)
            .unwrap();
        assert!(!registry.is_instantiated("my_llm"));

        registry.resolve("my_llm/m").unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_reaches_every_instantiated_provider() {
        let registry = ProviderRegistry::new();
        let p1 = Arc::new(ScriptedProvider::new("p1", vec![]));
        let p2 = Arc::new(ScriptedProvider::new("p2", vec![]));
        let p3 = Arc::new(ScriptedProvider::new("p3", vec![]));
        registry.register("p1", p1.clone()).unwrap();
        registry.register("p2", p2.clone()).unwrap();
        registry.register("p3", p3.clone()).unwrap();

        registry.resolve("p1/m").unwrap();
        registry.resolve("p2/m").unwrap();
        registry.close().await.unwrap();

        assert!(p1.is_closed());
        assert!(p2.is_closed());
        // Never instantiated, so never closed
        assert!(!p3.is_closed());
        assert!(!registry.is_instantiated("p1"));
    }

    #[test]
    fn names_are_sorted() {
        let registry = ProviderRegistry::new();
        registry.register("zeta", Arc::new(ScriptedProvider::new("z", vec![]))).unwrap();
        registry.register("alpha", Arc::new(ScriptedProvider::new("a", vec![]))).unwrap();
        assert_eq!(registry.names(), ["alpha", "zeta"]);
    }
}
