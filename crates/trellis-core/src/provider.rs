//! Service providers and the registry scripts reach them through.
//!
//! A [`ServiceProvider`] owns one namespace (`random`, `http`, an OpenAPI
//! import alias, ...) and answers `namespace.method(args)` calls. The
//! interpreter depends only on this trait; [`ServiceRegistry`] maps
//! namespace names to providers and reports anything it cannot route as
//! [`ProviderError::NotSupported`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::value::Value;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("{namespace}.{method} is not supported")]
    NotSupported { namespace: String, method: String },

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    Failed(String),
}

/// Evaluated call arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    pub positional: Vec<Value>,
    pub named: BTreeMap<String, Value>,
}

impl CallArgs {
    pub fn new(positional: Vec<Value>, named: BTreeMap<String, Value>) -> Self {
        Self { positional, named }
    }

    pub fn positional(positional: Vec<Value>) -> Self {
        Self {
            positional,
            named: BTreeMap::new(),
        }
    }

    /// The argument at `index`, or the named argument `name`.
    pub fn get(&self, index: usize, name: &str) -> Option<&Value> {
        self.positional.get(index).or_else(|| self.named.get(name))
    }

    pub fn named(&self, name: &str) -> Option<&Value> {
        self.named.get(name)
    }

    pub fn len(&self) -> usize {
        self.positional.len() + self.named.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn require_str(&self, index: usize, name: &str) -> Result<&str, ProviderError> {
        match self.get(index, name) {
            Some(Value::String(s)) => Ok(s),
            Some(other) => Err(ProviderError::InvalidArguments(format!(
                "'{}' must be a string, got {}",
                name,
                other.type_name()
            ))),
            None => Err(ProviderError::InvalidArguments(format!("missing argument '{}'", name))),
        }
    }

    pub fn optional_i64(&self, index: usize, name: &str) -> Result<Option<i64>, ProviderError> {
        match self.get(index, name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value.as_i64().map(Some).ok_or_else(|| {
                ProviderError::InvalidArguments(format!("'{}' must be an integer, got {}", name, value.type_name()))
            }),
        }
    }
}

/// A namespace of callable services.
#[async_trait]
pub trait ServiceProvider: Send + Sync {
    /// The namespace this provider answers for.
    fn namespace(&self) -> &str;

    /// Every method name this provider accepts.
    fn methods(&self) -> Vec<String>;

    fn supports(&self, method: &str) -> bool {
        self.methods().iter().any(|m| m == method)
    }

    async fn invoke(&self, method: &str, args: CallArgs) -> Result<Value, ProviderError>;

    /// Whether results are HTTP responses that should become `response`.
    fn records_response(&self) -> bool {
        false
    }
}

#[derive(Default)]
pub struct ServiceRegistry {
    providers: HashMap<String, Arc<dyn ServiceProvider>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `provider` under its namespace, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn ServiceProvider>) {
        self.providers.insert(provider.namespace().to_string(), provider);
    }

    pub fn get(&self, namespace: &str) -> Option<&Arc<dyn ServiceProvider>> {
        self.providers.get(namespace)
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.providers.contains_key(namespace)
    }

    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn invoke(&self, namespace: &str, method: &str, args: CallArgs) -> Result<Value, ProviderError> {
        let not_supported = || ProviderError::NotSupported {
            namespace: namespace.to_string(),
            method: method.to_string(),
        };
        let provider = self.providers.get(namespace).ok_or_else(not_supported)?;
        if !provider.supports(method) {
            return Err(not_supported());
        }
        provider.invoke(method, args).await
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("namespaces", &self.namespaces())
            .finish()
    }
}
