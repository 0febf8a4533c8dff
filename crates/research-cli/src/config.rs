use acquisition::AcquisitionConfig;
use anyhow::Context;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "./research.json";

// File (if any), then ACQ_* environment overrides; flags are applied by the caller
pub fn load(path: Option<&Path>) -> anyhow::Result<AcquisitionConfig> {
    let explicit = path.is_some();
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut config = if path.exists() {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))?
    } else if explicit {
        anyhow::bail!("config file {} does not exist", path.display());
    } else {
        AcquisitionConfig::default()
    };

    config.apply_env();
    Ok(config)
}
