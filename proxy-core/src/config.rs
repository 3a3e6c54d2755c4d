use std::path::Path;

use serde::Deserialize;

use crate::error::{ProxyError, Result};

/// Top-level configuration, loaded once at startup from YAML and never mutated
/// afterward. Mirrors the schema in the external-interfaces section verbatim.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub schema: SchemaConfig,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    pub cms: CmsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub listen_address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub address: String,
}

/// How the descriptor registry is populated: a pre-compiled `FileDescriptorSet`
/// on disk, or live gRPC Server Reflection against the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaMethod {
    Pb,
    Reflect,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaConfig {
    pub method: SchemaMethod,
    #[serde(default)]
    pub pb_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteMode {
    PassThru,
    InspectOuter,
    InspectVerifySign,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvelopeConfig {
    #[serde(default)]
    pub payload_field: String,
    #[serde(default)]
    pub type_url_field: String,
    #[serde(default)]
    pub client_sig_field: String,
    #[serde(default)]
    pub proxy_sig_field: String,
    #[serde(default)]
    pub metadata_field: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    #[serde(rename = "match")]
    pub pattern: String,
    pub mode: RouteMode,
    #[serde(default)]
    pub envelope: EnvelopeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CmsConfig {
    #[serde(default)]
    pub client_trust_store: Option<String>,
    #[serde(default)]
    pub proxy_private_key: Option<String>,
    #[serde(default)]
    pub proxy_certificate: Option<String>,
}

impl Config {
    /// Read and parse a YAML config file. Validates the schema-method/pb-path
    /// pairing up front so a missing `pb_path` under `method: pb` is reported
    /// as a config error rather than surfacing later as a descriptor error.
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("reading {}: {e}", path.display())))?;
        let config: Config = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.schema.method == SchemaMethod::Pb && self.schema.pb_path.is_none() {
            return Err(ProxyError::Config(
                "schema.pb_path is required when schema.method = pb".into(),
            ));
        }
        Ok(())
    }
}
