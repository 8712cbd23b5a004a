//! Configuration loading from disk.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::infra::InfraDocument;
use crate::config::resolve::{resolve_all, ResolvedConfig};
use crate::config::schema::FleetConfig;
use crate::config::secrets::EnvSource;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {}", join(.0))]
    Validation(Vec<ValidationError>),

    #[error("cannot resolve infrastructure configuration: {}", join(.0))]
    Resolution(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ConfigError {
    /// Field-level problems, if this error carries any.
    pub fn field_errors(&self) -> &[ValidationError] {
        match self {
            ConfigError::Validation(e) | ConfigError::Resolution(e) => e,
            _ => &[],
        }
    }
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<FleetConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config: FleetConfig = toml::from_str(&content).map_err(|source| ConfigError::Toml {
        path: path.to_path_buf(),
        source,
    })?;

    if let Some(dir) = path.parent() {
        config.resolve_paths(dir);
    }

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Parse the JSON infrastructure document. Indirections stay unresolved.
pub fn load_infra_document(path: &Path) -> Result<InfraDocument, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    InfraDocument::from_json(&content).map_err(|source| ConfigError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Load, validate and resolve everything needed to start the fleet.
///
/// A missing `infra_config` means an empty document.
pub fn load_resolved(path: &Path, env: &dyn EnvSource) -> Result<ResolvedConfig, ConfigError> {
    let fleet = load_config(path)?;
    let doc = match &fleet.infra_config {
        Some(p) => load_infra_document(p)?,
        None => InfraDocument::default(),
    };
    resolve_all(fleet, &doc, env).map_err(ConfigError::Resolution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_and_resolves_relative_infra() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "infra.json",
            r#"{"secrets": {"Key": {"$env": "APP_KEY"}}}"#,
        );
        let config = write(
            dir.path(),
            "fleetd.toml",
            r#"
            infra_config = "infra.json"
            [[services]]
            name = "blog"
            command = "./blog"
            "#,
        );
        let env: HashMap<String, String> = [("APP_KEY".to_string(), "v".to_string())].into();

        let resolved = load_resolved(&config, &env).unwrap();
        assert_eq!(resolved.infra.secrets["Key"].expose(), "v");
        assert_eq!(resolved.hosted_services(), vec!["blog"]);
    }

    #[test]
    fn reports_unresolved_secret_with_path() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "infra.json", r#"{"secrets": {"Key": {"$env": "MISSING"}}}"#);
        let config = write(dir.path(), "fleetd.toml", r#"infra_config = "infra.json""#);

        let err = load_resolved(&config, &HashMap::new()).unwrap_err();
        assert!(matches!(err, ConfigError::Resolution(_)));
        assert_eq!(err.field_errors()[0].path, "secrets.Key");
        assert!(err.to_string().contains("MISSING"));
    }

    #[test]
    fn syntax_errors_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = write(dir.path(), "fleetd.toml", "services = 3");
        let err = load_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::Toml { .. }));
        assert!(err.to_string().contains("fleetd.toml"));
    }
}
