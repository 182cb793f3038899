//! Resolution of a pack's `required_env` names into values.

use std::collections::BTreeMap;

/// Looks up secrets by name. Absent names are simply missing from the
/// returned map; the caller decides whether that is an error.
pub trait SecretResolver: Send + Sync {
    fn resolve(&self, names: &[String]) -> BTreeMap<String, String>;
}

/// Reads secrets from the process environment, optionally under a prefix
/// (`PACKRUN_SECRET_API_TOKEN` for `API_TOKEN` with prefix
/// `PACKRUN_SECRET_`).
#[derive(Debug, Clone, Default)]
pub struct EnvSecretResolver {
    prefix: String,
}

impl EnvSecretResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl SecretResolver for EnvSecretResolver {
    fn resolve(&self, names: &[String]) -> BTreeMap<String, String> {
        names
            .iter()
            .filter_map(|name| {
                std::env::var(format!("{}{}", self.prefix, name))
                    .ok()
                    .map(|value| (name.clone(), value))
            })
            .collect()
    }
}

/// Fixed set of secrets.
#[derive(Debug, Clone, Default)]
pub struct StaticSecretResolver {
    values: BTreeMap<String, String>,
}

impl StaticSecretResolver {
    pub fn new<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl SecretResolver for StaticSecretResolver {
    fn resolve(&self, names: &[String]) -> BTreeMap<String, String> {
        names
            .iter()
            .filter_map(|name| self.values.get(name).map(|v| (name.clone(), v.clone())))
            .collect()
    }
}
