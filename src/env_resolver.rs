use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::{SecretProviderConfig, TargetServerConfig, TransportConfig};
use crate::environment::Environment;
use crate::error::ConfigError;

/// Variables a child server inherits from the proxy's own environment.
/// Everything else must be configured explicitly.
pub const DEFAULT_INHERITED_VARS: &[&str] = &[
    "HOME",
    "LANG",
    "LC_ALL",
    "LOGNAME",
    "PATH",
    "SHELL",
    "SYSTEMROOT",
    "TERM",
    "TMPDIR",
    "TZ",
    "USER",
    "USERPROFILE",
];

/// Backend behind one named provider in a server's `secret_providers` block.
/// `lookup` distinguishes a missing key from a failing backend; the error
/// string describes the backend condition and never carries a secret value.
pub trait SecretSource: Send + Sync {
    fn lookup(&self, key: &str) -> Result<Option<String>, String>;
}

/// Secrets the operator has placed in the OS keychain: one entry per key
/// under the provider's configured service name.
pub struct KeyringSecrets {
    service: String,
}

impl KeyringSecrets {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl SecretSource for KeyringSecrets {
    fn lookup(&self, key: &str) -> Result<Option<String>, String> {
        let entry = keyring::Entry::new(&self.service, key).map_err(|err| err.to_string())?;
        match entry.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(err.to_string()),
        }
    }
}

/// Fixed-map source, the secrets counterpart of `MapEnvironment`.
#[derive(Default, Clone)]
pub struct StaticSecrets(pub HashMap<String, String>);

impl StaticSecrets {
    pub fn new<I, K, V>(secrets: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            secrets
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl SecretSource for StaticSecrets {
    fn lookup(&self, key: &str) -> Result<Option<String>, String> {
        Ok(self.0.get(key).cloned())
    }
}

/// Computes the outgoing environment for one server: an inherited allow-list,
/// overlaid with the configured entries after `${provider:key}` expansion.
/// Failure messages name the variable and provider, never the secret value.
pub struct EnvResolver<'a> {
    env: &'a dyn Environment,
    sources: HashMap<String, Arc<dyn SecretSource>>,
    env_aliases: HashSet<String>,
}

impl<'a> EnvResolver<'a> {
    pub fn new(env: &'a dyn Environment) -> Self {
        Self {
            env,
            sources: HashMap::new(),
            env_aliases: HashSet::from(["env".to_string()]),
        }
    }

    pub fn from_config(
        env: &'a dyn Environment,
        providers: &HashMap<String, SecretProviderConfig>,
    ) -> Self {
        let mut resolver = Self::new(env);
        for (name, config) in providers {
            match config {
                SecretProviderConfig::Env => {
                    resolver.env_aliases.insert(name.clone());
                }
                SecretProviderConfig::Keyring { service } => {
                    resolver
                        .sources
                        .insert(name.clone(), Arc::new(KeyringSecrets::new(service.clone())));
                }
            }
        }
        resolver
    }

    /// Override or add a provider backend, used to inject fakes in tests.
    pub fn with_source(mut self, name: &str, source: Arc<dyn SecretSource>) -> Self {
        self.sources.insert(name.to_string(), source);
        self
    }

    pub fn resolve(
        &self,
        server: &TargetServerConfig,
    ) -> Result<HashMap<String, String>, ConfigError> {
        let mut out = HashMap::new();
        for var in DEFAULT_INHERITED_VARS {
            if let Some(value) = self.env.var(var) {
                out.insert((*var).to_string(), value);
            }
        }
        for (key, value) in &server.env {
            out.insert(key.clone(), self.expand(value)?);
        }
        if let TransportConfig::Stdio { env, .. } = &server.transport {
            for (key, value) in env {
                out.insert(key.clone(), self.expand(value)?);
            }
        }
        Ok(out)
    }

    /// Replace every `${provider:key}` occurrence in `value`. Text without
    /// a provider separator passes through untouched.
    pub fn expand(&self, value: &str) -> Result<String, ConfigError> {
        let mut out = String::new();
        let mut rest = value;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                return Err(ConfigError::InvalidArgument(
                    "unterminated secret reference".into(),
                ));
            };
            let reference = &after[..end];
            match reference.split_once(':') {
                Some((provider, key)) => out.push_str(&self.lookup(provider, key)?),
                None => {
                    // plain ${...} is not ours to interpret
                    out.push_str("${");
                    out.push_str(reference);
                    out.push('}');
                }
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn lookup(&self, provider: &str, key: &str) -> Result<String, ConfigError> {
        if self.env_aliases.contains(provider) {
            return self.env.var(key).ok_or_else(|| {
                ConfigError::InvalidArgument(format!("environment variable {key} is not set"))
            });
        }
        let source = self.sources.get(provider).ok_or_else(|| {
            ConfigError::InvalidArgument(format!("unknown secret provider {provider}"))
        })?;
        match source.lookup(key) {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(ConfigError::InvalidArgument(format!(
                "secret {key} not found in provider {provider}"
            ))),
            Err(err) => {
                tracing::warn!(target = "config", provider = %provider, key = %key, error = %err,
                               "secret provider lookup failed");
                Err(ConfigError::InvalidArgument(format!(
                    "secret provider {provider} failed while reading {key}"
                )))
            }
        }
    }
}
