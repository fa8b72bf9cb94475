use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Prefix of variables injected by the supervisor itself
pub const RESERVED_ENV_PREFIX: &str = "FLOTILLA_";

/// Validated, immutable environment attached to an instance at creation
///
/// Cloning is cheap; the same environment is reused for every restart of the
/// instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct InstanceEnv {
    vars: Arc<BTreeMap<String, String>>,
}

impl InstanceEnv {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut map = BTreeMap::new();
        for (key, value) in vars {
            let key = key.into();
            let value = value.into();
            validate_var(&key, &value)?;
            map.insert(key, value);
        }

        Ok(Self { vars: Arc::new(map) })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

fn validate_var(key: &str, value: &str) -> Result<(), ConfigError> {
    if key.is_empty() {
        return Err(ConfigError::Validation(
            "environment variable name must not be empty".to_string(),
        ));
    }

    if key.contains('=') || key.contains('\0') {
        return Err(ConfigError::Validation(format!(
            "invalid environment variable name: {:?}",
            key
        )));
    }

    if key.starts_with(RESERVED_ENV_PREFIX) {
        return Err(ConfigError::Validation(format!(
            "environment variable {} uses the reserved {} prefix",
            key, RESERVED_ENV_PREFIX
        )));
    }

    if value.contains('\0') {
        return Err(ConfigError::Validation(format!(
            "value of environment variable {} contains a NUL byte",
            key
        )));
    }

    Ok(())
}

impl TryFrom<BTreeMap<String, String>> for InstanceEnv {
    type Error = ConfigError;

    fn try_from(map: BTreeMap<String, String>) -> Result<Self, Self::Error> {
        Self::new(map)
    }
}

impl TryFrom<HashMap<String, String>> for InstanceEnv {
    type Error = ConfigError;

    fn try_from(map: HashMap<String, String>) -> Result<Self, Self::Error> {
        Self::new(map)
    }
}

impl From<InstanceEnv> for BTreeMap<String, String> {
    fn from(env: InstanceEnv) -> Self {
        (*env.vars).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_env() {
        let env = InstanceEnv::new([("API_URL", "http://localhost"), ("MODE", "fast")]).unwrap();
        assert_eq!(env.len(), 2);
        assert_eq!(env.get("MODE"), Some("fast"));
        assert_eq!(env.get("MISSING"), None);
    }

    #[test]
    fn test_rejects_bad_names() {
        assert!(InstanceEnv::new([("", "x")]).is_err());
        assert!(InstanceEnv::new([("A=B", "x")]).is_err());
        assert!(InstanceEnv::new([("FLOTILLA_INSTANCE_ID", "x")]).is_err());
    }

    #[test]
    fn test_rejects_nul_values() {
        assert!(InstanceEnv::new([("KEY", "a\0b")]).is_err());
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: InstanceEnv = serde_json::from_str(r#"{"KEY":"value"}"#).unwrap();
        assert_eq!(ok.get("KEY"), Some("value"));

        let bad: Result<InstanceEnv, _> = serde_json::from_str(r#"{"FLOTILLA_X":"value"}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_iteration_is_sorted() {
        let env = InstanceEnv::new([("B", "2"), ("A", "1")]).unwrap();
        let keys: Vec<&str> = env.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["A", "B"]);
    }
}
