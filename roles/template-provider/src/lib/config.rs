//! ## Configuration Module
//!
//! Defines [`TemplateProviderConfig`], deserialized from TOML. All options
//! default to the values a stock deployment would use; keys are generated
//! at startup when not pinned in the file.

use std::path::{Path, PathBuf};

use secp256k1::{Keypair, Secp256k1, SecretKey};

use crate::error::{TpError, TpResult};

/// Default TCP port the provider listens on.
pub const DEFAULT_SV2_PORT: u16 = 8336;

/// Default template refresh interval in seconds.
pub const DEFAULT_SV2_INTERVAL: u64 = 30;

/// Default minimum fee delta, in satoshis, below which intra-block template
/// updates are suppressed.
pub const DEFAULT_SV2_FEE_DELTA: i64 = 1000;

/// Protocol version this provider speaks.
pub const DEFAULT_SV2_PROTOCOL_VERSION: u16 = 2;

/// Default certificate lifetime: 52 weeks.
pub const DEFAULT_CERT_VALIDITY_SECS: u64 = 31_449_600;

/// Configuration for the Template Provider.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct TemplateProviderConfig {
    /// TCP port to bind on all interfaces.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Protocol version announced in `SetupConnection.Success`.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u16,
    /// Optional feature flags announced in `SetupConnection.Success`.
    #[serde(default)]
    pub optional_features: u32,
    /// Coinbase space reserved for clients that have not sent their own
    /// `CoinbaseOutputDataSize` yet.
    #[serde(default)]
    pub default_coinbase_tx_additional_output_size: u32,
    /// Whether templates default to the future-template flow.
    #[serde(default = "default_future_templates")]
    pub default_future_templates: bool,
    /// Minimum fee increase, in satoshis, for intra-block template updates.
    #[serde(default = "default_fee_delta")]
    pub minimum_fee_delta: i64,
    /// Seconds between mempool-driven template refreshes.
    #[serde(default = "default_interval")]
    pub template_interval_secs: u64,
    /// Lifetime of the certificate signed at startup.
    #[serde(default = "default_cert_validity")]
    pub cert_validity_secs: u64,
    /// Hex-encoded 32-byte static secret key; generated when absent.
    #[serde(default)]
    pub static_key: Option<String>,
    /// Hex-encoded 32-byte authority secret key used to sign the
    /// certificate; generated when absent.
    #[serde(default)]
    pub authority_secret_key: Option<String>,
    /// Optional log file, in addition to stdout.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_port() -> u16 {
    DEFAULT_SV2_PORT
}

fn default_protocol_version() -> u16 {
    DEFAULT_SV2_PROTOCOL_VERSION
}

fn default_future_templates() -> bool {
    true
}

fn default_fee_delta() -> i64 {
    DEFAULT_SV2_FEE_DELTA
}

fn default_interval() -> u64 {
    DEFAULT_SV2_INTERVAL
}

fn default_cert_validity() -> u64 {
    DEFAULT_CERT_VALIDITY_SECS
}

impl Default for TemplateProviderConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            protocol_version: default_protocol_version(),
            optional_features: 0,
            default_coinbase_tx_additional_output_size: 0,
            default_future_templates: default_future_templates(),
            minimum_fee_delta: default_fee_delta(),
            template_interval_secs: default_interval(),
            cert_validity_secs: default_cert_validity(),
            static_key: None,
            authority_secret_key: None,
            log_file: None,
        }
    }
}

impl TemplateProviderConfig {
    /// Loads the configuration from a TOML file.
    pub fn from_file(path: &Path) -> TpResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| TpError::Config(e.to_string()))
    }

    /// The configured static key, or a freshly generated one.
    pub fn static_key(&self) -> TpResult<SecretKey> {
        match &self.static_key {
            Some(hex_key) => parse_secret_key(hex_key),
            None => Ok(tp_noise::generate_key().secret_key()),
        }
    }

    /// The configured authority keypair, or a freshly generated one.
    pub fn authority_keypair(&self) -> TpResult<Keypair> {
        match &self.authority_secret_key {
            Some(hex_key) => {
                let secret = parse_secret_key(hex_key)?;
                Ok(Keypair::from_secret_key(&Secp256k1::new(), &secret))
            }
            None => Ok(tp_noise::generate_key()),
        }
    }
}

fn parse_secret_key(hex_key: &str) -> TpResult<SecretKey> {
    let bytes = hex::decode(hex_key.trim())?;
    SecretKey::from_slice(&bytes).map_err(TpError::from)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: TemplateProviderConfig = toml::from_str("").unwrap();
        assert_eq!(config.port, DEFAULT_SV2_PORT);
        assert_eq!(config.protocol_version, 2);
        assert_eq!(config.minimum_fee_delta, DEFAULT_SV2_FEE_DELTA);
        assert_eq!(config.template_interval_secs, DEFAULT_SV2_INTERVAL);
        assert!(config.static_key.is_none());
    }

    #[test]
    fn keys_parse_from_hex() {
        let config: TemplateProviderConfig = toml::from_str(
            r#"
            port = 18447
            minimum_fee_delta = 5
            static_key = "1111111111111111111111111111111111111111111111111111111111111111"
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 18447);
        assert_eq!(config.minimum_fee_delta, 5);
        let key = config.static_key().unwrap();
        assert_eq!(key.secret_bytes(), [0x11u8; 32]);
    }

    #[test]
    fn invalid_key_is_rejected() {
        let config = TemplateProviderConfig {
            static_key: Some("zz".into()),
            ..Default::default()
        };
        assert!(matches!(
            config.static_key(),
            Err(TpError::KeyEncoding(_))
        ));
    }
}
