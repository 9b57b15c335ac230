use std::collections::HashMap;

/// Process-environment lookups behind a port so tests never mutate the real
/// environment of the test runner.
pub trait Environment: Send + Sync {
    fn var(&self, key: &str) -> Option<String>;
}

#[derive(Default, Clone)]
pub struct OsEnvironment;

impl Environment for OsEnvironment {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Fixed-map environment for tests.
#[derive(Default, Clone)]
pub struct MapEnvironment(pub HashMap<String, String>);

impl MapEnvironment {
    pub fn new<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl Environment for MapEnvironment {
    fn var(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }
}

/// Truthiness rule used for flags like `CI`.
pub fn is_truthy(value: &str) -> bool {
    !matches!(value.trim(), "" | "0" | "false" | "no" | "off")
}
