use crate::model::AgentSettings;
use crate::settings;
use crate::vault::Vault;

const SETTINGS_KEY: &str = "sentinel.settings";

pub fn load_settings(vault: &Vault) -> anyhow::Result<AgentSettings> {
    let loaded = if let Some(bytes) = vault.get(SETTINGS_KEY)? {
        serde_json::from_slice(&bytes)?
    } else {
        AgentSettings::default()
    };
    settings::validate(&loaded)?;
    Ok(loaded)
}

pub fn save_settings(vault: &mut Vault, agent_settings: &AgentSettings) -> anyhow::Result<()> {
    settings::validate(agent_settings)?;
    let data = serde_json::to_vec(agent_settings)?;
    vault.set(SETTINGS_KEY, &data)?;
    Ok(())
}
