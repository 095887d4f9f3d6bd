//! Configuration loading.
//!
//! - [`types`]: the YAML schema
//! - [`validate`]: reference checks and group ordering
//! - [`build`]: turning a validated config into proxies, groups, providers and routes

mod build;
mod types;
mod validate;

pub use build::{LoadedConfig, build_config};
pub use types::*;
pub use validate::validate_config;

/// Loads configuration files from the provided paths and merges them in order.
pub async fn load_configs(args: &[String]) -> std::io::Result<Config> {
    let mut merged = Config::default();
    for config_filename in args {
        let config_bytes = match tokio::fs::read(config_filename).await {
            Ok(b) => b,
            Err(e) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Could not read config file {config_filename}: {e}"),
                ));
            }
        };

        let config_str = match String::from_utf8(config_bytes) {
            Ok(s) => s,
            Err(e) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Could not parse config file {config_filename} as UTF8: {e}"),
                ));
            }
        };

        // An empty file is an empty config.
        if config_str.trim().is_empty() {
            continue;
        }

        let config = match serde_yaml::from_str::<Config>(&config_str) {
            Ok(c) => c,
            Err(e) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Could not parse config file {config_filename} as config YAML: {e}"),
                ));
            }
        };
        merged.merge(config);
    }

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_and_merge_files() {
        let dir = std::env::temp_dir();
        let first = dir.join(format!("burrow-load-a-{}.yaml", std::process::id()));
        let second = dir.join(format!("burrow-load-b-{}.yaml", std::process::id()));
        let empty = dir.join(format!("burrow-load-c-{}.yaml", std::process::id()));
        tokio::fs::write(&first, "proxies:\n  - name: r\n    type: reject\n")
            .await
            .unwrap();
        tokio::fs::write(&second, "rules:\n  - MATCH,r\n").await.unwrap();
        tokio::fs::write(&empty, "\n").await.unwrap();

        let paths: Vec<String> = [&first, &second, &empty]
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        let config = load_configs(&paths).await.unwrap();
        assert_eq!(config.proxies.len(), 1);
        assert_eq!(config.rules, vec!["MATCH,r"]);
        validate_config(&config).unwrap();

        for path in [first, second, empty] {
            let _ = tokio::fs::remove_file(path).await;
        }
    }

    #[tokio::test]
    async fn test_missing_file() {
        let err = load_configs(&["/nonexistent/burrow.yaml".to_string()])
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Could not read config file"));
    }
}
