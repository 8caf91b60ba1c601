//! XDG layer: the `[env]` table of `$XDG_CONFIG_HOME/<app>/config.toml`.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::ConfigError;

fn config_home() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return Some(PathBuf::from(xdg));
        }
    }
    dirs::config_dir()
}

fn xdg_config_path(app_name: &str) -> Option<PathBuf> {
    let path = config_home()?.join(app_name).join("config.toml");
    path.exists().then_some(path)
}

#[derive(serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    env: HashMap<String, String>,
}

/// Loads the XDG layer's key-value pairs. A missing file or empty `[env]`
/// section is an empty map; read and parse failures carry the path.
pub fn load_env_map(app_name: &str) -> Result<HashMap<String, String>, ConfigError> {
    let Some(path) = xdg_config_path(app_name) else {
        return Ok(HashMap::new());
    };
    let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    let config: ConfigFile =
        toml::from_str(&content).map_err(|source| ConfigError::Toml { path, source })?;
    Ok(config.env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    // XDG_CONFIG_HOME is process-global; serialize the tests that touch it.
    static XDG_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn with_xdg_home<T>(dir: &std::path::Path, f: impl FnOnce() -> T) -> T {
        let _guard = XDG_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let prev = env::var("XDG_CONFIG_HOME").ok();
        env::set_var("XDG_CONFIG_HOME", dir);
        let out = f();
        match prev {
            Some(p) => env::set_var("XDG_CONFIG_HOME", p),
            None => env::remove_var("XDG_CONFIG_HOME"),
        }
        out
    }

    #[test]
    fn missing_config_returns_empty_map() {
        let map = load_env_map("skein-xdg-test-nonexistent").unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn reads_env_table() {
        let dir = tempfile::tempdir().unwrap();
        let app_dir = dir.path().join("skein-test");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(app_dir.join("config.toml"), "[env]\nFOO = \"from_toml\"\n").unwrap();

        let map = with_xdg_home(dir.path(), || load_env_map("skein-test")).unwrap();
        assert_eq!(map.get("FOO"), Some(&"from_toml".to_string()));
    }

    #[test]
    fn invalid_toml_error_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let app_dir = dir.path().join("skein-bad");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(app_dir.join("config.toml"), "not toml [[[\n").unwrap();

        let result = with_xdg_home(dir.path(), || load_env_map("skein-bad"));
        match result {
            Err(ConfigError::Toml { path, .. }) => {
                assert!(path.ends_with("skein-bad/config.toml"));
            }
            other => panic!("expected a toml parse error, got {:?}", other.map(|_| ())),
        }
    }
}
