use anyhow::{Context, Result};
use bebop_core::control::DroneConfig;
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAME: &str = "bebop.toml";

pub fn default_config_path() -> Result<PathBuf> {
    let proj = ProjectDirs::from("io", "bebop-rs", "Bebop")
        .context("could not determine platform config directory")?;
    Ok(proj.config_dir().join(CONFIG_FILE_NAME))
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;
    }
    Ok(())
}

/// Load the config at `path`, falling back to defaults when it does not exist.
///
/// Values the link cannot run with (zero timeouts or queue sizes, an empty
/// device address) are rejected here rather than when the link starts.
pub fn load(path: &Path) -> Result<DroneConfig> {
    if !path.exists() {
        return Ok(DroneConfig::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    parse(&raw).with_context(|| format!("invalid config: {}", path.display()))
}

/// Parse and validate a TOML config
pub fn parse(raw: &str) -> Result<DroneConfig> {
    let cfg: DroneConfig = toml::from_str(raw).context("failed to parse TOML")?;
    cfg.validate()?;
    Ok(cfg)
}

/// Write `cfg` to `path`; an invalid config is never written
pub fn save(path: &Path, cfg: &DroneConfig, overwrite: bool) -> Result<()> {
    cfg.validate().context("refusing to write an invalid config")?;
    if path.exists() && !overwrite {
        anyhow::bail!(
            "config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    ensure_parent_dir(path)?;
    let raw = toml::to_string_pretty(cfg).context("failed to serialize config to TOML")?;
    fs::write(path, raw).with_context(|| format!("failed to write config: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn scratch_path(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .subsec_nanos();
        std::env::temp_dir()
            .join(format!("bebop-config-test-{name}-{nanos}"))
            .join(CONFIG_FILE_NAME)
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let cfg = load(&scratch_path("missing")).unwrap();
        assert_eq!(cfg.c2d_port, 54321);
    }

    #[test]
    fn test_save_and_load() {
        let path = scratch_path("roundtrip");
        let cfg = DroneConfig {
            device_addr: "10.1.1.1".to_string(),
            heartbeat_interval: Duration::from_millis(40),
            ..Default::default()
        };

        save(&path, &cfg, false).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.device_addr, "10.1.1.1");
        assert_eq!(loaded.heartbeat_interval, Duration::from_millis(40));

        assert!(save(&path, &cfg, false).is_err());
        save(&path, &cfg, true).unwrap();

        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn test_parse_partial_file() {
        let cfg = parse("device_addr = \"10.0.0.9\"\nheartbeat_interval = \"40ms\"\n").unwrap();
        assert_eq!(cfg.device_addr, "10.0.0.9");
        assert_eq!(cfg.heartbeat_interval, Duration::from_millis(40));
        assert_eq!(cfg.discovery_port, 44444);
    }

    #[test]
    fn test_load_rejects_zero_heartbeat_interval() {
        let path = scratch_path("zero-interval");
        ensure_parent_dir(&path).unwrap();
        fs::write(&path, "heartbeat_interval = \"0s\"\n").unwrap();

        let err = load(&path).unwrap_err();
        let chain = format!("{err:#}");
        assert!(chain.contains("heartbeat_interval"), "{chain}");

        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn test_save_rejects_invalid_config() {
        let path = scratch_path("invalid-save");
        let cfg = DroneConfig {
            write_timeout: Duration::ZERO,
            ..Default::default()
        };

        assert!(save(&path, &cfg, true).is_err());
        assert!(!path.exists());
    }
}
