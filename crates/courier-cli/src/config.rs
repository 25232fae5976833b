//! Config file loading for the `courier` binary

use anyhow::{Context, Result, anyhow};
use courier_core::CourierConfig;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// `~/.courier/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".courier").join("config.toml"))
}

/// Load the config at `path`, or the default location when `path` is None.
///
/// A missing default file yields the built-in defaults; a missing explicit
/// file is an error.
pub fn load_config(path: Option<&Path>) -> Result<CourierConfig> {
    let (path, explicit) = match path {
        Some(p) => (expand_home(p), true),
        None => match default_config_path() {
            Some(p) => (p, false),
            None => {
                debug!("No home directory; using default config");
                return Ok(CourierConfig::default());
            }
        },
    };

    if !path.exists() {
        if explicit {
            return Err(anyhow!("Config file not found: {}", path.display()));
        }
        debug!("No config at {}; using defaults", path.display());
        return Ok(CourierConfig::default());
    }

    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let expanded = expand_env(&raw)?;
    let config: CourierConfig = toml::from_str(&expanded)
        .with_context(|| format!("Failed to parse config {}", path.display()))?;
    debug!(
        "Loaded config from {} ({} known agent(s))",
        path.display(),
        config.agents.known_urls.len()
    );
    Ok(config)
}

/// Replace `${NAME}` with the value of environment variable NAME.
///
/// Unset variables are left in place and logged.
pub fn expand_env(text: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| anyhow!("Invalid regex: {}", e))?;

    let expanded = re.replace_all(text, |caps: &regex::Captures| {
        let name = &caps[1];
        match std::env::var(name) {
            Ok(value) => value,
            Err(_) => {
                warn!("Environment variable '{}' is not set", name);
                caps[0].to_string()
            }
        }
    });
    Ok(expanded.into_owned())
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    path.to_path_buf()
}
