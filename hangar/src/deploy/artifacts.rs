//! Generated configuration written for each deployment.
//!
//! The deployment-scoped tree is bind-mounted into the container, so every
//! file here is created owner-only (0600 files, 0700 directories).

use serde_json::{json, Value};
use tracing::debug;

use crate::errors::HangarError;
use crate::models::deployment::{Deployment, ModelSelection, SecretFields};
use crate::storage::layout::DeploymentLayout;

/// Where the config directory is mounted inside the container
pub const CONFIG_MOUNT: &str = "/home/agent/.config/agent";

/// Where the workspace directory is mounted inside the container
pub const WORKSPACE_MOUNT: &str = "/home/agent/workspace";

/// Application config read by the agent at boot. Carries no credentials.
pub fn agent_config(
    deployment: &Deployment,
    secrets: &SecretFields,
    model: &ModelSelection,
    service_port: u16,
) -> Value {
    json!({
        "deployment_id": deployment.id,
        "subdomain": deployment.subdomain,
        "gateway": {
            "bind": "0.0.0.0",
            "port": service_port,
            "auth": { "mode": "token" },
        },
        "agent": {
            "provider": model.provider.as_str(),
            "model": model.model,
            "system_prompt": deployment.runtime_config.system_prompt,
            "workspace": WORKSPACE_MOUNT,
        },
        "channels": {
            "telegram": { "enabled": secrets.telegram_bot_token.is_some() },
            "discord": { "enabled": secrets.discord_bot_token.is_some() },
        },
        "extra": deployment.runtime_config.extra,
    })
}

/// Environment injected into the container
pub fn container_env(
    secrets: &SecretFields,
    model: &ModelSelection,
    service_port: u16,
) -> Vec<(String, String)> {
    let mut env = vec![
        ("AGENT_GATEWAY_TOKEN".to_string(), secrets.gateway_token.clone()),
        ("AGENT_GATEWAY_PORT".to_string(), service_port.to_string()),
        ("AGENT_MODEL".to_string(), model.to_string()),
        ("AGENT_CONFIG_DIR".to_string(), CONFIG_MOUNT.to_string()),
    ];
    if let Some(key) = secrets.provider_key(model.provider) {
        env.push((model.provider.env_var().to_string(), key.to_string()));
    }
    if let Some(token) = &secrets.telegram_bot_token {
        env.push(("TELEGRAM_BOT_TOKEN".to_string(), token.clone()));
    }
    if let Some(token) = &secrets.discord_bot_token {
        env.push(("DISCORD_BOT_TOKEN".to_string(), token.clone()));
    }
    env
}

/// Write the config file and the selected provider's credential file.
pub async fn write_artifacts(
    layout: &DeploymentLayout,
    deployment: &Deployment,
    secrets: &SecretFields,
    model: &ModelSelection,
    service_port: u16,
) -> Result<(), HangarError> {
    layout.root().create_private().await?;
    layout.config_dir().create_private().await?;
    layout.credentials_dir().create_private().await?;
    layout.workspace_dir().create_private().await?;

    let config = agent_config(deployment, secrets, model, service_port);
    layout.agent_config_file().write_json_private(&config).await?;

    let api_key = secrets.provider_key(model.provider).ok_or_else(|| {
        HangarError::ValidationError(format!(
            "Model {} requires a {} API key",
            model,
            model.provider.as_str()
        ))
    })?;
    let credential = json!({
        "provider": model.provider.as_str(),
        "api_key": api_key,
    });
    layout
        .credential_file(model.provider.as_str())
        .write_json_private(&credential)
        .await?;

    debug!(
        deployment_id = %deployment.id,
        path = %layout.root().path().display(),
        "Wrote deployment artifacts"
    );
    Ok(())
}
