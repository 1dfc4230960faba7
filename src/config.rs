use std::collections::BTreeMap;
use std::sync::LazyLock;

use figment::{Figment, providers::{Env, Format, Yaml}};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_NAME_LEN: usize = 63;
const MAX_PREFIX_LEN: usize = 253;

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]$").expect("name regex is valid")
});

static DNS_SUBDOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("dns subdomain regex is valid")
});

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid policy configuration: {}", .0.join("; "))]
    InvalidPolicy(Vec<String>),
}

fn default_listen_addr() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_tls_cert_path() -> String {
    "/certs/tls.crt".to_string()
}

fn default_tls_key_path() -> String {
    "/certs/tls.key".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_exempt_namespaces() -> Vec<String> {
    vec!["kube-system".to_string(), "kube-public".to_string()]
}

fn default_required_labels() -> Vec<String> {
    vec!["team".to_string()]
}

fn default_inject_labels() -> BTreeMap<String, String> {
    BTreeMap::from([("team".to_string(), "ops".to_string())])
}

fn default_validate_key() -> String {
    "k8s-ac-test/validate".to_string()
}

fn default_mutate_key() -> String {
    "k8s-ac-test/mutate".to_string()
}

fn default_status_key() -> String {
    "k8s-ac-test/status".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_tls_cert_path")]
    pub tls_cert_path: String,
    #[serde(default = "default_tls_key_path")]
    pub tls_key_path: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub policy: PolicyConfig,
}

/// The label-compliance policy. Loaded once at startup and shared read-only
/// by every admission request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_exempt_namespaces")]
    pub exempt_namespaces: Vec<String>,
    #[serde(default = "default_required_labels")]
    pub required_labels: Vec<String>,
    #[serde(default = "default_inject_labels")]
    pub inject_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: AnnotationKeys,
}

/// Annotation keys that steer the policy on individual objects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationKeys {
    /// Opt-out switch for validation.
    #[serde(default = "default_validate_key")]
    pub validate: String,
    /// Opt-out switch for mutation.
    #[serde(default = "default_mutate_key")]
    pub mutate: String,
    /// Marker written by a successful mutation.
    #[serde(default = "default_status_key")]
    pub status: String,
}

impl Default for AnnotationKeys {
    fn default() -> Self {
        Self {
            validate: default_validate_key(),
            mutate: default_mutate_key(),
            status: default_status_key(),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            exempt_namespaces: default_exempt_namespaces(),
            required_labels: default_required_labels(),
            inject_labels: default_inject_labels(),
            annotations: AnnotationKeys::default(),
        }
    }
}

impl PolicyConfig {
    pub fn is_exempt(&self, namespace: &str) -> bool {
        self.exempt_namespaces.iter().any(|ns| ns == namespace)
    }

    /// Checks every configured key and injected value against Kubernetes
    /// naming rules, collecting all problems instead of stopping at the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        for key in &self.required_labels {
            if let Err(e) = check_qualified_name(key) {
                problems.push(format!("required label '{key}': {e}"));
            }
        }

        for (key, value) in &self.inject_labels {
            if let Err(e) = check_qualified_name(key) {
                problems.push(format!("injected label '{key}': {e}"));
            }
            if let Err(e) = check_label_value(value) {
                problems.push(format!("injected label '{key}' value '{value}': {e}"));
            }
        }

        let keys = &self.annotations;
        for (role, key) in [
            ("validate", &keys.validate),
            ("mutate", &keys.mutate),
            ("status", &keys.status),
        ] {
            if let Err(e) = check_qualified_name(key) {
                problems.push(format!("{role} annotation '{key}': {e}"));
            }
        }

        if keys.status == keys.validate || keys.status == keys.mutate {
            problems.push(format!(
                "status annotation '{}' must differ from the opt-out annotations",
                keys.status
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::InvalidPolicy(problems))
        }
    }
}

fn check_qualified_name(key: &str) -> Result<(), String> {
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };

    if let Some(prefix) = prefix {
        if prefix.is_empty() || prefix.len() > MAX_PREFIX_LEN || !DNS_SUBDOMAIN_RE.is_match(prefix) {
            return Err(format!("prefix '{prefix}' is not a valid DNS subdomain"));
        }
    }
    if name.is_empty() || name.len() > MAX_NAME_LEN || !NAME_RE.is_match(name) {
        return Err(format!("name '{name}' is not a valid qualified name"));
    }
    Ok(())
}

fn check_label_value(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > MAX_NAME_LEN || !NAME_RE.is_match(value) {
        return Err("not a valid label value".to_string());
    }
    Ok(())
}

impl WebhookConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("WEBHOOK_").split("__"))
            .extract()
            .map_err(Box::new)?;
        config.policy.validate()?;
        Ok(config)
    }

    /// Replaces the port of `listen_addr`, keeping its host.
    pub fn set_port(&mut self, port: u16) {
        let host = self
            .listen_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or("0.0.0.0");
        self.listen_addr = format!("{host}:{port}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config: WebhookConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8443");
        assert_eq!(config.policy.exempt_namespaces, vec!["kube-system", "kube-public"]);
        assert_eq!(config.policy.required_labels, vec!["team"]);
        assert_eq!(config.policy.inject_labels.get("team").map(String::as_str), Some("ops"));
        assert_eq!(config.policy.annotations.status, "k8s-ac-test/status");
        assert!(config.policy.validate().is_ok());
    }

    #[test]
    fn test_partial_policy_keeps_other_defaults() {
        let yaml = r#"
policy:
  exempt_namespaces: [infra]
  annotations:
    mutate: example.com/mutate
"#;
        let config: WebhookConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.policy.is_exempt("infra"));
        assert!(!config.policy.is_exempt("kube-system"));
        assert_eq!(config.policy.annotations.mutate, "example.com/mutate");
        assert_eq!(config.policy.annotations.validate, "k8s-ac-test/validate");
    }

    #[test]
    fn test_validate_collects_all_problems() {
        let mut policy = PolicyConfig::default();
        policy.required_labels.push("-bad".to_string());
        policy
            .inject_labels
            .insert("Bad_Prefix.io/app".to_string(), "has space".to_string());
        policy.annotations.status = policy.annotations.mutate.clone();

        match policy.validate() {
            Err(ConfigError::InvalidPolicy(problems)) => assert_eq!(problems.len(), 4),
            other => panic!("expected invalid policy, got {other:?}"),
        }
    }

    #[test]
    fn test_check_qualified_name() {
        assert!(check_qualified_name("team").is_ok());
        assert!(check_qualified_name("app.kubernetes.io/name").is_ok());
        assert!(check_qualified_name("k8s-ac-test/status").is_ok());
        assert!(check_qualified_name("").is_err());
        assert!(check_qualified_name("/name").is_err());
        assert!(check_qualified_name("prefix/").is_err());
        assert!(check_qualified_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_set_port() {
        let mut config: WebhookConfig = serde_yaml::from_str("listen_addr: 127.0.0.1:443").unwrap();
        config.set_port(9443);
        assert_eq!(config.listen_addr, "127.0.0.1:9443");
    }
}
