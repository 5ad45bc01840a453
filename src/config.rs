//! Static configuration of both parties.
//!
//! Loaded from environment variables (a `.env` file is read first when present).
//! Endpoints, key paths and time tolerances are required.

use std::{net::SocketAddr, path::PathBuf, time::Duration as StdDuration};

use reqwest::Url;
use time::Duration;

use crate::{credentials::CredentialStore, SamlError};

const DEFAULT_SESSION_IDLE_SECS: u64 = 1800;

/// Service provider configuration.
#[derive(Debug, Clone)]
pub struct SpConfig {
    pub entity_id: String,
    /// Scheme, host and port the SP is reached on; goto URLs are built from it.
    pub base_url: String,
    pub consumer_url: String,
    pub idp_entity_id: String,
    pub idp_sso_url: String,
    pub idp_artifact_resolution_url: String,
    pub private_key: PathBuf,
    pub idp_public_key: PathBuf,
    pub clock_skew: Duration,
    pub resolve_timeout: StdDuration,
    pub session_idle: StdDuration,
    pub bind_addr: SocketAddr,
}

/// Identity provider configuration.
#[derive(Debug, Clone)]
pub struct IdpConfig {
    pub entity_id: String,
    pub sso_url: String,
    pub artifact_resolution_url: String,
    /// Index of the resolution endpoint, carried inside every artifact.
    pub endpoint_index: u16,
    pub sp_entity_id: String,
    pub sp_consumer_url: String,
    pub private_key: PathBuf,
    pub sp_public_key: PathBuf,
    pub clock_skew: Duration,
    pub assertion_lifetime: Duration,
    pub artifact_ttl: StdDuration,
    /// Attributes released about the (placeholder) authenticated user.
    pub attributes: Vec<(String, String)>,
    pub bind_addr: SocketAddr,
}

impl SpConfig {
    pub fn from_env() -> Result<Self, SamlError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SamlError> {
        let env = Env(&lookup);
        Ok(SpConfig {
            entity_id: env.required("SP_ENTITY_ID")?,
            base_url: env.url("SP_BASE_URL")?.trim_end_matches('/').to_string(),
            consumer_url: env.url("SP_CONSUMER_URL")?,
            idp_entity_id: env.required("IDP_ENTITY_ID")?,
            idp_sso_url: env.url("IDP_SSO_URL")?,
            idp_artifact_resolution_url: env.url("IDP_ARTIFACT_RESOLUTION_URL")?,
            private_key: env.required("SP_PRIVATE_KEY")?.into(),
            idp_public_key: env.required("IDP_PUBLIC_KEY")?.into(),
            clock_skew: env.duration("SAML_CLOCK_SKEW_SECS")?,
            resolve_timeout: StdDuration::from_secs(env.seconds("SP_RESOLVE_TIMEOUT_SECS")?),
            session_idle: StdDuration::from_secs(
                env.optional_seconds("SP_SESSION_IDLE_SECS")?
                    .unwrap_or(DEFAULT_SESSION_IDLE_SECS),
            ),
            bind_addr: env.socket_addr("SP_BIND_ADDR", "127.0.0.1:8080")?,
        })
    }

    pub fn credentials(&self) -> Result<CredentialStore, SamlError> {
        CredentialStore::load(
            &self.entity_id,
            &self.private_key,
            &self.idp_entity_id,
            &self.idp_public_key,
        )
    }
}

impl IdpConfig {
    pub fn from_env() -> Result<Self, SamlError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SamlError> {
        let env = Env(&lookup);
        Ok(IdpConfig {
            entity_id: env.required("IDP_ENTITY_ID")?,
            sso_url: env.url("IDP_SSO_URL")?,
            artifact_resolution_url: env.url("IDP_ARTIFACT_RESOLUTION_URL")?,
            endpoint_index: env
                .optional("IDP_ARTIFACT_ENDPOINT_INDEX")
                .map(|index| {
                    index.parse().map_err(|_| {
                        SamlError::Configuration(format!(
                            "IDP_ARTIFACT_ENDPOINT_INDEX is not a u16: {index:?}"
                        ))
                    })
                })
                .transpose()?
                .unwrap_or(0),
            sp_entity_id: env.required("SP_ENTITY_ID")?,
            sp_consumer_url: env.url("SP_CONSUMER_URL")?,
            private_key: env.required("IDP_PRIVATE_KEY")?.into(),
            sp_public_key: env.required("SP_PUBLIC_KEY")?.into(),
            clock_skew: env.duration("SAML_CLOCK_SKEW_SECS")?,
            assertion_lifetime: env.duration("IDP_ASSERTION_LIFETIME_SECS")?,
            artifact_ttl: StdDuration::from_secs(env.seconds("IDP_ARTIFACT_TTL_SECS")?),
            attributes: parse_attributes(
                &env.optional("IDP_USER_ATTRIBUTES")
                    .unwrap_or_else(|| "username=bob,telephone=999999999".to_string()),
            )?,
            bind_addr: env.socket_addr("IDP_BIND_ADDR", "127.0.0.1:9090")?,
        })
    }

    pub fn credentials(&self) -> Result<CredentialStore, SamlError> {
        CredentialStore::load(
            &self.entity_id,
            &self.private_key,
            &self.sp_entity_id,
            &self.sp_public_key,
        )
    }
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, SamlError> {
        self.optional(key)
            .ok_or_else(|| SamlError::Configuration(format!("{key} is required")))
    }

    fn url(&self, key: &str) -> Result<String, SamlError> {
        let value = self.required(key)?;
        Url::parse(&value)
            .map_err(|e| SamlError::Configuration(format!("{key} is not a valid URL: {e}")))?;
        Ok(value)
    }

    fn optional_seconds(&self, key: &str) -> Result<Option<u64>, SamlError> {
        self.optional(key)
            .map(|value| {
                value.parse().map_err(|_| {
                    SamlError::Configuration(format!("{key} must be whole seconds, got {value:?}"))
                })
            })
            .transpose()
    }

    fn seconds(&self, key: &str) -> Result<u64, SamlError> {
        self.optional_seconds(key)?.ok_or_else(|| {
            SamlError::Configuration(format!("{key} is required and has no default"))
        })
    }

    fn duration(&self, key: &str) -> Result<Duration, SamlError> {
        i64::try_from(self.seconds(key)?)
            .map(Duration::seconds)
            .map_err(|_| SamlError::Configuration(format!("{key} is out of range")))
    }

    fn socket_addr(&self, key: &str, default: &str) -> Result<SocketAddr, SamlError> {
        let value = self.optional(key).unwrap_or_else(|| default.to_string());
        value
            .parse()
            .map_err(|e| SamlError::Configuration(format!("{key}: {e}")))
    }
}

fn parse_attributes(input: &str) -> Result<Vec<(String, String)>, SamlError> {
    input
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            pair.split_once('=')
                .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
                .ok_or_else(|| {
                    SamlError::Configuration(format!("attribute {pair:?} is not name=value"))
                })
        })
        .collect()
}
