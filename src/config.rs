use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{BridgeError, BridgeResult};

/// One `inputs` entry for a network: a regex matched against the text a
/// back-end wants from the user (e.g. a 2FA code) and the prompt template
/// shown in the service room while the input is pending.
#[derive(Debug, Clone, Deserialize)]
pub struct InputConfig {
    pub pattern: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Key into the back-end registry (`create_clients`), e.g. "purple" or "skype".
    pub client: String,
    /// Short tag embedded as the mxid local part's leading segment, e.g. "xmpp".
    pub prefix: String,
    /// Regex with named captures `user`/`host`/(optional) `resource`, matched
    /// against an external contact string to build its mxid.
    pub ext_pattern: String,
    /// Template rebuilding the external contact string from `ext_pattern`'s
    /// captures, e.g. "{user}@{host}".
    pub ext_format: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub use_auth_token: bool,
    #[serde(default)]
    pub sync_contacts_profiles_changes: bool,
    #[serde(default)]
    pub inputs: Vec<InputConfig>,
    /// Recognized value: "html2text". Unknown values log a misconfiguration
    /// and fall through to the raw body.
    #[serde(default)]
    pub convert_to_text: Option<String>,
    /// Recognized value: "markdown".
    #[serde(default)]
    pub convert_from_text: Option<String>,
    /// `formatted_body` format tag this network's messages carry, e.g.
    /// "org.matrix.custom.html".
    #[serde(default)]
    pub format: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpFrontendConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    pub hs_as_token: String,
}

fn default_bind() -> String {
    "127.0.0.1:8090".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub hs_server: String,
    pub hs_host: String,
    pub hs_access_token: String,
    pub service_localpart: String,
    pub service_display_name: String,
    #[serde(default)]
    pub networks: HashMap<String, NetworkConfig>,
    pub http_frontend: HttpFrontendConfig,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    #[serde(default = "default_presence_refresh_secs")]
    pub presence_refresh_secs: u64,
    #[serde(default = "default_retry_secs")]
    pub offline_retry_secs: u64,
    /// Regex list with `{hs_host}` substitution; a matching sender is denied
    /// even if it also matches `users_whitelist`.
    #[serde(default)]
    pub users_blacklist: Vec<String>,
    /// Regex list with `{hs_host}` substitution; an empty list allows every
    /// sender not caught by `users_blacklist`.
    #[serde(default)]
    pub users_whitelist: Vec<String>,
}

fn default_db_path() -> String {
    "pumaduct.db".to_string()
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_presence_refresh_secs() -> u64 {
    600
}

fn default_retry_secs() -> u64 {
    60
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| BridgeError::internal(format!("reading config: {e}")))?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> BridgeResult<Self> {
        let config: Config = serde_yaml::from_str(text)
            .map_err(|e| BridgeError::bad_argument(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> BridgeResult<()> {
        for (network, net_conf) in &self.networks {
            if net_conf.client.trim().is_empty() {
                return Err(BridgeError::bad_argument(format!(
                    "network '{network}' is missing a client key"
                )));
            }
            regex::Regex::new(&net_conf.ext_pattern).map_err(|e| {
                BridgeError::bad_argument(format!(
                    "network '{network}' has an invalid ext_pattern '{}': {e}",
                    net_conf.ext_pattern
                ))
            })?;
            for input in &net_conf.inputs {
                regex::Regex::new(&input.pattern).map_err(|e| {
                    BridgeError::bad_argument(format!(
                        "network '{network}' has an invalid input pattern '{}': {e}",
                        input.pattern
                    ))
                })?;
            }
        }
        for pattern in self.users_blacklist.iter().chain(self.users_whitelist.iter()) {
            let substituted = pattern.replace("{hs_host}", &self.hs_host);
            regex::Regex::new(&substituted).map_err(|e| {
                BridgeError::bad_argument(format!("invalid access-control pattern '{pattern}': {e}"))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let yaml = r#"
hs_server: "https://matrix.example.org"
hs_host: "example.org"
hs_access_token: "as_token"
service_localpart: "pumaduct"
service_display_name: "PuMaDuct"
http_frontend:
  hs_as_token: "hs_token"
networks:
  jabber:
    client: purple
    prefix: jabber
    ext_pattern: "^((?P<user>[^@]+)@)?(?P<host>[^/@]+)(/(?P<resource>.*))?$"
    ext_format: "{user}@{host}"
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.hs_host, "example.org");
        assert!(config.networks["jabber"].enabled);
        assert_eq!(config.db_path, "pumaduct.db");
    }

    #[test]
    fn rejects_network_without_client() {
        let yaml = r#"
hs_server: "https://matrix.example.org"
hs_host: "example.org"
hs_access_token: "as_token"
service_localpart: "pumaduct"
service_display_name: "PuMaDuct"
http_frontend:
  hs_as_token: "hs_token"
networks:
  jabber:
    client: ""
    prefix: jabber
    ext_pattern: "^((?P<user>[^@]+)@)?(?P<host>[^/@]+)(/(?P<resource>.*))?$"
    ext_format: "{user}@{host}"
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn rejects_invalid_ext_pattern() {
        let yaml = r#"
hs_server: "https://matrix.example.org"
hs_host: "example.org"
hs_access_token: "as_token"
service_localpart: "pumaduct"
service_display_name: "PuMaDuct"
http_frontend:
  hs_as_token: "hs_token"
networks:
  jabber:
    client: purple
    prefix: jabber
    ext_pattern: "("
    ext_format: "{user}@{host}"
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }
}
