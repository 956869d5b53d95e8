use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    schema::SwitchyardConfig,
};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "switchyard.toml",
    "switchyard.yaml",
    "switchyard.yml",
    "switchyard.json",
];

/// Load config from the given path. The format follows the file extension.
pub fn load_config(path: &Path) -> Result<SwitchyardConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
    parse_config(&raw, ext)
}

/// Parse config text in the format named by `ext` (`toml`, `yaml`, `yml`, `json`).
pub fn parse_config(raw: &str, ext: &str) -> Result<SwitchyardConfig> {
    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        other => Err(Error::UnsupportedFormat(other.to_string())),
    }
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./switchyard.{toml,yaml,yml,json}`
/// 2. `<user config dir>/switchyard/switchyard.{toml,yaml,yml,json}`
///
/// Returns `SwitchyardConfig::default()` if nothing is found or the file
/// fails to parse.
pub fn discover_and_load() -> SwitchyardConfig {
    let Some(path) = find_config_file(Path::new("."), config_dir().as_deref()) else {
        debug!("no config file found, using defaults");
        return SwitchyardConfig::default();
    };
    debug!(path = %path.display(), "loading config");
    load_config(&path).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
        SwitchyardConfig::default()
    })
}

/// Returns the user-global config directory.
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "switchyard").map(|d| d.config_dir().to_path_buf())
}

fn find_config_file(local: &Path, global: Option<&Path>) -> Option<PathBuf> {
    std::iter::once(local)
        .chain(global)
        .flat_map(|dir| CONFIG_FILENAMES.iter().map(move |name| dir.join(name)))
        .find(|p| p.exists())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case("toml", "[dispatch]\ntool_timeout_secs = 5\n")]
    #[case("yaml", "dispatch:\n  tool_timeout_secs: 5\n")]
    #[case("json", r#"{"dispatch": {"tool_timeout_secs": 5}}"#)]
    fn parses_each_format(#[case] ext: &str, #[case] raw: &str) {
        let cfg = parse_config(raw, ext).unwrap();
        assert_eq!(cfg.dispatch.tool_timeout_secs, 5);
        assert_eq!(cfg.dispatch.retrieval_timeout_secs, 10);
    }

    #[test]
    fn unsupported_extension() {
        assert!(matches!(
            parse_config("", "ini"),
            Err(Error::UnsupportedFormat(ext)) if ext == "ini"
        ));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchyard.toml");
        std::fs::write(
            &path,
            r#"
[dispatch.circuit_breaker]
threshold = 5
enabled = true

[handlers]
disabled = ["console"]
"#,
        )
        .unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.dispatch.circuit_breaker.threshold, 5);
        assert!(cfg.dispatch.circuit_breaker.enabled);
        assert!(!cfg.handlers.is_enabled("console"));
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = load_config(Path::new("/nonexistent/switchyard.toml")).unwrap_err();
        assert!(matches!(err, Error::Read { .. }));
    }

    #[test]
    fn local_file_wins_over_global() {
        let local = tempfile::tempdir().unwrap();
        let global = tempfile::tempdir().unwrap();
        std::fs::write(global.path().join("switchyard.toml"), "").unwrap();
        assert_eq!(
            find_config_file(local.path(), Some(global.path())),
            Some(global.path().join("switchyard.toml"))
        );

        std::fs::write(local.path().join("switchyard.json"), "{}").unwrap();
        assert_eq!(
            find_config_file(local.path(), Some(global.path())),
            Some(local.path().join("switchyard.json"))
        );
    }
}
