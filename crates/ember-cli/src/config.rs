//! Locating, loading, and writing agent configuration files.
//!
//! The config path is resolved in order: explicit CLI argument,
//! `$EMBER_CONFIG`, then `./ember.toml`.  After parsing, `EMBER_*`
//! environment variables override a handful of deployment-specific fields
//! and the result is validated before anything is constructed.

use std::fs;
use std::path::{Path, PathBuf};

use ember_runtime::AgentConfig;
use ember_types::EmberError;

pub const DEFAULT_FILE: &str = "ember.toml";

/// A runnable starting point: simulated inputs and actuators, a local
/// Ollama model.
pub const STARTER: &str = r#"name = "ember"
persona = """
You are Ember, a small indoor robot. You can talk and drive slowly.
Keep people safe and prefer doing nothing over guessing."""

[timing]
tick_interval_ms = 1000
tick_deadline_ms = 4000
inference_timeout_ms = 3000

[inference]
base_url = "http://localhost:11434"
model = "llama3"

[telemetry]
port = 9870

[[inputs]]
id = "microphone"
kind = "scripted"
texts = ["Someone says: hello robot!", "(silence)", "Someone says: please come here."]
min_interval_ms = 2000

[[inputs]]
id = "front_camera"
kind = "sim_camera"
description = "a hallway with a person standing two metres ahead"
min_interval_ms = 500
max_age_ms = 1500
required = true

[[plugins]]
id = "speaker"
kind = "sim"

[[plugins]]
id = "base"
kind = "sim"
latency_ms = 50

[[actions]]
name = "speak"
description = "Say one sentence out loud"
target = "speaker"
params = [{ name = "text", kind = { type = "string", max_len = 200 } }]

[[actions]]
name = "move"
description = "Drive with a body-frame velocity in m/s and rad/s"
target = "base"
params = [
  { name = "x", kind = { type = "number", min = -0.5, max = 0.5 } },
  { name = "theta", kind = { type = "number", min = -1.0, max = 1.0 }, required = false },
]

[[actions]]
name = "stop"
description = "Stop the base immediately"
target = "base"
idempotent = true

[[safety.param_limits]]
action = "move"
param = "x"
max_abs = 0.3
"#;

/// Pick the config file to load.
pub fn resolve_path(arg: Option<&str>) -> PathBuf {
    resolve_path_with(arg, std::env::var("EMBER_CONFIG").ok())
}

pub(crate) fn resolve_path_with(arg: Option<&str>, env: Option<String>) -> PathBuf {
    arg.map(PathBuf::from)
        .or_else(|| env.filter(|v| !v.trim().is_empty()).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_FILE))
}

/// Read, override, and validate the config at `path`.
///
/// # Errors
///
/// [`EmberError::Configuration`] if the file is missing, unreadable, not
/// valid TOML, or fails [`AgentConfig::validate`].
pub fn load_from(path: &Path) -> Result<AgentConfig, EmberError> {
    let raw = fs::read_to_string(path).map_err(|e| {
        EmberError::Configuration(format!("failed to read {}: {e}", path.display()))
    })?;
    let mut cfg = AgentConfig::from_toml(&raw)?;
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

/// Apply `EMBER_*` environment overrides.
///
/// | Variable | Field |
/// |---|---|
/// | `EMBER_LLM_URL` | `inference.base_url` |
/// | `EMBER_MODEL` | `inference.model` |
/// | `EMBER_API_KEY` | `inference.api_key` |
/// | `EMBER_TELEMETRY_PORT` | `telemetry.port` (`0` or `off` disables) |
/// | `EMBER_TICK_INTERVAL_MS` | `timing.tick_interval_ms` |
pub fn apply_env_overrides(cfg: &mut AgentConfig) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

pub(crate) fn apply_overrides(cfg: &mut AgentConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("EMBER_LLM_URL") {
        cfg.inference.base_url = v;
    }
    if let Some(v) = lookup("EMBER_MODEL") {
        cfg.inference.model = v;
    }
    if let Some(v) = lookup("EMBER_API_KEY").filter(|v| !v.is_empty()) {
        cfg.inference.set_api_key(v);
    }
    if let Some(v) = lookup("EMBER_TELEMETRY_PORT") {
        match v.trim() {
            "0" | "off" => cfg.telemetry.port = None,
            other => {
                if let Ok(port) = other.parse::<u16>() {
                    cfg.telemetry.port = Some(port);
                }
            }
        }
    }
    if let Some(v) = lookup("EMBER_TICK_INTERVAL_MS")
        && let Ok(ms) = v.trim().parse::<u64>()
    {
        cfg.timing.tick_interval_ms = ms;
    }
}

/// Write [`STARTER`] to `path`, refusing to overwrite an existing file.
/// On Unix the file is created owner-only since it may later hold an API
/// key.
///
/// # Errors
///
/// [`EmberError::Configuration`] if the file exists or cannot be written.
pub fn write_starter(path: &Path) -> Result<(), EmberError> {
    if path.exists() {
        return Err(EmberError::Configuration(format!(
            "{} already exists",
            path.display()
        )));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| {
            EmberError::Configuration(format!("failed to create {}: {e}", parent.display()))
        })?;
    }
    let fail = |e: std::io::Error| {
        EmberError::Configuration(format!("failed to write {}: {e}", path.display()))
    };
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(STARTER.as_bytes()))
            .map_err(fail)?;
    }
    #[cfg(not(unix))]
    fs::write(path, STARTER).map_err(fail)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn path_resolution_order() {
        assert_eq!(
            resolve_path_with(Some("a.toml"), Some("b.toml".into())),
            PathBuf::from("a.toml")
        );
        assert_eq!(resolve_path_with(None, Some("b.toml".into())), PathBuf::from("b.toml"));
        assert_eq!(resolve_path_with(None, Some("  ".into())), PathBuf::from(DEFAULT_FILE));
        assert_eq!(resolve_path_with(None, None), PathBuf::from(DEFAULT_FILE));
    }

    #[test]
    fn starter_config_is_valid() {
        let cfg = AgentConfig::from_toml(STARTER).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.inputs.len(), 2);
        assert_eq!(cfg.plugins.len(), 2);
        assert_eq!(cfg.vocabulary().unwrap().len(), 3);
    }

    #[test]
    fn overrides_replace_endpoint_and_ports() {
        let mut cfg = AgentConfig::from_toml(STARTER).unwrap();
        apply_overrides(
            &mut cfg,
            env(&[
                ("EMBER_LLM_URL", "http://gpu-box:8000"),
                ("EMBER_MODEL", "qwen2.5"),
                ("EMBER_API_KEY", "sk-test"),
                ("EMBER_TELEMETRY_PORT", "9999"),
                ("EMBER_TICK_INTERVAL_MS", "250"),
            ]),
        );
        assert_eq!(cfg.inference.base_url, "http://gpu-box:8000");
        assert_eq!(cfg.inference.model, "qwen2.5");
        assert_eq!(cfg.inference.api_key(), Some("sk-test"));
        assert_eq!(cfg.telemetry.port, Some(9999));
        assert_eq!(cfg.timing.tick_interval_ms, 250);
        assert!(!format!("{cfg:?}").contains("sk-test"));
    }

    #[test]
    fn invalid_overrides_are_ignored_and_off_disables_telemetry() {
        let mut cfg = AgentConfig::from_toml(STARTER).unwrap();
        apply_overrides(
            &mut cfg,
            env(&[("EMBER_TICK_INTERVAL_MS", "soon"), ("EMBER_TELEMETRY_PORT", "not-a-port")]),
        );
        assert_eq!(cfg.timing.tick_interval_ms, 1000);
        assert_eq!(cfg.telemetry.port, Some(9870));

        apply_overrides(&mut cfg, env(&[("EMBER_TELEMETRY_PORT", "off")]));
        assert_eq!(cfg.telemetry.port, None);
    }

    #[test]
    fn write_then_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("robots").join("ember.toml");
        write_starter(&path).expect("write");
        let cfg = load_from(&path).expect("load");
        assert_eq!(cfg.actions.len(), 3);

        let err = write_starter(&path).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[cfg(unix)]
    #[test]
    fn starter_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("ember.toml");
        write_starter(&path).expect("write");
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn missing_or_invalid_files_are_configuration_errors() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let missing = load_from(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, EmberError::Configuration(_)));

        let path = dir.path().join("bad.toml");
        fs::write(&path, "name = \"x\"\n[timing]\ntick_interval_ms = 0\n").unwrap();
        let invalid = load_from(&path).unwrap_err();
        assert!(invalid.to_string().contains("tick_interval_ms"));
    }
}
