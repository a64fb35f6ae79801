//! 起動設定
//!
//! 環境変数（非推奨名へのフォールバック付き）とフリート設定ファイルの読み込み。

use fleet_router_common::{
    config::FleetConfig,
    error::{CommonError, CommonResult},
};
use std::path::{Path, PathBuf};

/// 待受ホストの環境変数
pub const HOST_ENV: &str = "FLEET_ROUTER_HOST";
/// 待受ポートの環境変数
pub const PORT_ENV: &str = "FLEET_ROUTER_PORT";
/// フリート設定ファイルの環境変数
pub const CONFIG_ENV: &str = "FLEET_ROUTER_CONFIG";

const LEGACY_HOST_ENV: &str = "ROUTER_HOST";
const LEGACY_PORT_ENV: &str = "ROUTER_PORT";
const LEGACY_CONFIG_ENV: &str = "FLEET_CONFIG";

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_CONFIG_FILE: &str = "fleet.json";

/// Get an environment variable with fallback to a deprecated name
///
/// If only the deprecated name is set, its value is returned and a
/// deprecation warning is logged.
///
/// # Example
/// ```
/// use fleet_router::config::get_env_with_fallback;
///
/// let port = get_env_with_fallback("FLEET_ROUTER_PORT", "ROUTER_PORT");
/// ```
pub fn get_env_with_fallback(new_name: &str, old_name: &str) -> Option<String> {
    if let Ok(val) = std::env::var(new_name) {
        return Some(val);
    }
    if let Ok(val) = std::env::var(old_name) {
        tracing::warn!(
            "Environment variable '{}' is deprecated, use '{}' instead",
            old_name,
            new_name
        );
        return Some(val);
    }
    None
}

/// Same as [`get_env_with_fallback`], returning `default` when neither is set
pub fn get_env_with_fallback_or(new_name: &str, old_name: &str, default: &str) -> String {
    get_env_with_fallback(new_name, old_name).unwrap_or_else(|| default.to_string())
}

/// Same as [`get_env_with_fallback`], parsed; `default` when unset or unparseable
pub fn get_env_with_fallback_parse<T: std::str::FromStr>(
    new_name: &str,
    old_name: &str,
    default: T,
) -> T {
    get_env_with_fallback(new_name, old_name)
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// サーバー起動設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// 待受ホスト
    pub host: String,
    /// 待受ポート
    pub port: u16,
    /// フリート設定ファイル
    pub config_path: PathBuf,
}

impl ServerConfig {
    /// 環境変数から読み込む
    pub fn from_env() -> Self {
        Self {
            host: get_env_with_fallback_or(HOST_ENV, LEGACY_HOST_ENV, DEFAULT_HOST),
            port: get_env_with_fallback_parse(PORT_ENV, LEGACY_PORT_ENV, DEFAULT_PORT),
            config_path: PathBuf::from(get_env_with_fallback_or(
                CONFIG_ENV,
                LEGACY_CONFIG_ENV,
                DEFAULT_CONFIG_FILE,
            )),
        }
    }

    /// バインドアドレス
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// フリート設定ファイル（JSON）を読み込み、検証する
pub fn load_fleet_config(path: &Path) -> CommonResult<FleetConfig> {
    let json = std::fs::read_to_string(path).map_err(|e| {
        CommonError::Config(format!("failed to read {}: {}", path.display(), e))
    })?;
    FleetConfig::from_json(&json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    #[serial]
    fn test_get_env_with_fallback_new_name() {
        std::env::set_var("TEST_FLEET_NEW_VAR", "new_value");
        std::env::remove_var("TEST_FLEET_OLD_VAR");

        let result = get_env_with_fallback("TEST_FLEET_NEW_VAR", "TEST_FLEET_OLD_VAR");
        assert_eq!(result, Some("new_value".to_string()));

        std::env::remove_var("TEST_FLEET_NEW_VAR");
    }

    #[test]
    #[serial]
    fn test_get_env_with_fallback_old_name() {
        std::env::remove_var("TEST_FLEET_NEW_VAR2");
        std::env::set_var("TEST_FLEET_OLD_VAR2", "old_value");

        let result = get_env_with_fallback("TEST_FLEET_NEW_VAR2", "TEST_FLEET_OLD_VAR2");
        assert_eq!(result, Some("old_value".to_string()));

        std::env::remove_var("TEST_FLEET_OLD_VAR2");
    }

    #[test]
    #[serial]
    fn test_get_env_with_fallback_parse_invalid_uses_default() {
        std::env::set_var("TEST_FLEET_NEW_VAR3", "not-a-port");

        let result: u16 = get_env_with_fallback_parse("TEST_FLEET_NEW_VAR3", "TEST_FLEET_OLD_VAR3", 3000);
        assert_eq!(result, 3000);

        std::env::remove_var("TEST_FLEET_NEW_VAR3");
    }

    #[test]
    #[serial]
    fn test_server_config_from_env() {
        for var in [
            HOST_ENV,
            PORT_ENV,
            CONFIG_ENV,
            LEGACY_HOST_ENV,
            LEGACY_PORT_ENV,
            LEGACY_CONFIG_ENV,
        ] {
            std::env::remove_var(var);
        }
        let defaults = ServerConfig::from_env();
        assert_eq!(defaults.bind_addr(), "0.0.0.0:8080");
        assert_eq!(defaults.config_path, PathBuf::from("fleet.json"));

        std::env::set_var(LEGACY_PORT_ENV, "9000");
        std::env::set_var(HOST_ENV, "127.0.0.1");
        std::env::set_var(CONFIG_ENV, "/etc/fleet-router/fleet.json");
        let config = ServerConfig::from_env();
        assert_eq!(config.bind_addr(), "127.0.0.1:9000");
        assert_eq!(
            config.config_path,
            PathBuf::from("/etc/fleet-router/fleet.json")
        );

        std::env::remove_var(LEGACY_PORT_ENV);
        std::env::remove_var(HOST_ENV);
        std::env::remove_var(CONFIG_ENV);
    }

    #[test]
    fn test_load_fleet_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"backends": [{{"name": "a", "host": "10.0.0.5", "port": 8001, "model_id": "llama"}}]}}"#
        )
        .unwrap();

        let config = load_fleet_config(file.path()).unwrap();
        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.backends[0].address(), "10.0.0.5:8001");
    }

    #[test]
    fn test_load_fleet_config_errors() {
        assert!(load_fleet_config(Path::new("/nonexistent/fleet.json")).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        assert!(load_fleet_config(file.path()).is_err());
    }
}
