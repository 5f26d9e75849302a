//! Deployment models

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::HangarError;
use crate::utils::generate_uuid;

/// Lifecycle status of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Idle,
    Configuring,
    Provisioning,
    Starting,
    Healthy,
    Stopped,
    Error,
    Restarting,
}

impl DeploymentStatus {
    pub const ALL: [DeploymentStatus; 8] = [
        DeploymentStatus::Idle,
        DeploymentStatus::Configuring,
        DeploymentStatus::Provisioning,
        DeploymentStatus::Starting,
        DeploymentStatus::Healthy,
        DeploymentStatus::Stopped,
        DeploymentStatus::Error,
        DeploymentStatus::Restarting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Idle => "idle",
            DeploymentStatus::Configuring => "configuring",
            DeploymentStatus::Provisioning => "provisioning",
            DeploymentStatus::Starting => "starting",
            DeploymentStatus::Healthy => "healthy",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Error => "error",
            DeploymentStatus::Restarting => "restarting",
        }
    }

    /// Terminal statuses hold no port reservation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Idle | DeploymentStatus::Stopped | DeploymentStatus::Error
        )
    }

    /// Statuses in which the provisioning step label is cleared.
    pub fn is_stable(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Idle
                | DeploymentStatus::Healthy
                | DeploymentStatus::Stopped
                | DeploymentStatus::Error
        )
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credential fields of a deployment.
///
/// In a stored [`Deployment`] every present field holds a sealed token
/// (`nonce:tag:ciphertext`); after `open_fields` they hold plaintext.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretFields {
    /// Bearer token the agent gateway inside the container expects
    pub gateway_token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anthropic_api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openai_api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gemini_api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openrouter_api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram_bot_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discord_bot_token: Option<String>,
}

impl SecretFields {
    /// Names of every credential field, in declaration order.
    pub const FIELD_NAMES: [&'static str; 7] = [
        "gateway_token",
        "anthropic_api_key",
        "openai_api_key",
        "gemini_api_key",
        "openrouter_api_key",
        "telegram_bot_token",
        "discord_bot_token",
    ];

    /// Apply `f` to every present field, producing a new set of fields.
    pub fn try_map<E, F>(&self, mut f: F) -> Result<SecretFields, E>
    where
        F: FnMut(&'static str, &str) -> Result<String, E>,
    {
        let mut optional = |name: &'static str, value: &Option<String>| -> Result<Option<String>, E> {
            value.as_deref().map(|v| f(name, v)).transpose()
        };

        let anthropic_api_key = optional("anthropic_api_key", &self.anthropic_api_key)?;
        let openai_api_key = optional("openai_api_key", &self.openai_api_key)?;
        let gemini_api_key = optional("gemini_api_key", &self.gemini_api_key)?;
        let openrouter_api_key = optional("openrouter_api_key", &self.openrouter_api_key)?;
        let telegram_bot_token = optional("telegram_bot_token", &self.telegram_bot_token)?;
        let discord_bot_token = optional("discord_bot_token", &self.discord_bot_token)?;

        Ok(SecretFields {
            gateway_token: f("gateway_token", &self.gateway_token)?,
            anthropic_api_key,
            openai_api_key,
            gemini_api_key,
            openrouter_api_key,
            telegram_bot_token,
            discord_bot_token,
        })
    }

    /// Look up the API key belonging to a model provider.
    pub fn provider_key(&self, provider: Provider) -> Option<&str> {
        match provider {
            Provider::Anthropic => self.anthropic_api_key.as_deref(),
            Provider::OpenAi => self.openai_api_key.as_deref(),
            Provider::Google => self.gemini_api_key.as_deref(),
            Provider::OpenRouter => self.openrouter_api_key.as_deref(),
        }
    }
}

impl fmt::Debug for SecretFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mask = |v: &Option<String>| v.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("SecretFields")
            .field("gateway_token", &"[REDACTED]")
            .field("anthropic_api_key", &mask(&self.anthropic_api_key))
            .field("openai_api_key", &mask(&self.openai_api_key))
            .field("gemini_api_key", &mask(&self.gemini_api_key))
            .field("openrouter_api_key", &mask(&self.openrouter_api_key))
            .field("telegram_bot_token", &mask(&self.telegram_bot_token))
            .field("discord_bot_token", &mask(&self.discord_bot_token))
            .finish()
    }
}

/// Model provider supported by the agent image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
    Google,
    #[serde(rename = "openrouter")]
    OpenRouter,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::OpenAi => "openai",
            Provider::Google => "google",
            Provider::OpenRouter => "openrouter",
        }
    }

    /// Environment variable the agent reads the provider key from
    pub fn env_var(&self) -> &'static str {
        match self {
            Provider::Anthropic => "ANTHROPIC_API_KEY",
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::Google => "GEMINI_API_KEY",
            Provider::OpenRouter => "OPENROUTER_API_KEY",
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = HangarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "anthropic" => Ok(Provider::Anthropic),
            "openai" => Ok(Provider::OpenAi),
            "google" | "gemini" => Ok(Provider::Google),
            "openrouter" => Ok(Provider::OpenRouter),
            other => Err(HangarError::ValidationError(format!(
                "Unknown model provider '{}'. Supported: anthropic, openai, google, openrouter",
                other
            ))),
        }
    }
}

/// Model chosen for a deployment, written as `provider/model`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelection {
    pub provider: Provider,
    pub model: String,
}

impl ModelSelection {
    /// Check that the secrets carry a key for this model's provider.
    pub fn validate_against(&self, secrets: &SecretFields) -> Result<(), HangarError> {
        match secrets.provider_key(self.provider) {
            Some(key) if !key.trim().is_empty() => Ok(()),
            _ => Err(HangarError::ValidationError(format!(
                "Model {} requires a {} API key",
                self,
                self.provider.as_str()
            ))),
        }
    }
}

impl std::str::FromStr for ModelSelection {
    type Err = HangarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (provider, model) = s.split_once('/').ok_or_else(|| {
            HangarError::ValidationError(format!(
                "Model '{}' must be written as provider/model",
                s
            ))
        })?;
        if model.trim().is_empty() {
            return Err(HangarError::ValidationError(format!(
                "Model '{}' is missing a model name",
                s
            )));
        }
        Ok(Self {
            provider: provider.parse()?,
            model: model.to_string(),
        })
    }
}

impl fmt::Display for ModelSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider.as_str(), self.model)
    }
}

/// Model and prompt configuration passed through to the container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Free-form settings forwarded verbatim
    #[serde(default)]
    pub extra: serde_json::Value,
}

/// One tenant agent instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub owner_id: String,
    pub subdomain: String,
    pub status: DeploymentStatus,

    #[serde(default)]
    pub container_ref: Option<String>,

    #[serde(default)]
    pub internal_port: Option<u16>,

    /// Sealed credential fields
    pub secrets: SecretFields,

    #[serde(default)]
    pub runtime_config: RuntimeConfig,

    #[serde(default)]
    pub provisioning_step: Option<String>,

    #[serde(default)]
    pub error_message: Option<String>,

    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    /// Create a new idle deployment
    pub fn new(
        owner_id: impl Into<String>,
        subdomain: impl Into<String>,
        secrets: SecretFields,
        runtime_config: RuntimeConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: generate_uuid(),
            owner_id: owner_id.into(),
            subdomain: subdomain.into(),
            status: DeploymentStatus::Idle,
            container_ref: None,
            internal_port: None,
            secrets,
            runtime_config,
            provisioning_step: None,
            error_message: None,
            last_heartbeat: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Input for creating a deployment
#[derive(Debug, Clone)]
pub struct DeploymentDraft {
    pub owner_id: String,
    pub subdomain: String,
    /// Plaintext credentials; sealed before they reach the store
    pub secrets: SecretFields,
    pub runtime_config: RuntimeConfig,
}
