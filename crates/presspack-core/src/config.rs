use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Loader options that control specifier resolution per execution context.
///
/// The host build tool is responsible for locating and parsing its own
/// configuration file; this struct is only the typed shape it deserializes
/// into before constructing a [`crate::LoaderSession`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoaderConfig {
    /// Project root directory; anchors package resolution for specifiers
    /// that escape the bundle graph.
    #[serde(default = "default_project_root")]
    pub project_root: PathBuf,

    /// Extra package-export conditions applied when resolving under the
    /// "client" execution context.
    #[serde(default)]
    pub client_conditions: Vec<String>,

    /// Extra package-export conditions applied when resolving under the
    /// "server" execution context.
    #[serde(default)]
    pub server_conditions: Vec<String>,
}

fn default_project_root() -> PathBuf {
    PathBuf::from(".")
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            project_root: default_project_root(),
            client_conditions: Vec::new(),
            server_conditions: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config: LoaderConfig = serde_json::from_str("{}").unwrap();

        assert_eq!(config.project_root, PathBuf::from("."));
        assert!(config.client_conditions.is_empty());
        assert!(config.server_conditions.is_empty());
    }

    #[test]
    fn test_camel_case_field_names() {
        let config: LoaderConfig = serde_json::from_str(
            r#"{
                "projectRoot": "/srv/site",
                "serverConditions": ["react-server"]
            }"#,
        )
        .unwrap();

        assert_eq!(config.project_root, PathBuf::from("/srv/site"));
        assert_eq!(config.server_conditions, vec!["react-server".to_string()]);
        assert!(config.client_conditions.is_empty());
    }

    #[test]
    fn test_round_trip() {
        let config = LoaderConfig {
            project_root: PathBuf::from("/app"),
            client_conditions: vec!["browser".into()],
            server_conditions: vec!["react-server".into()],
        };

        let text = serde_json::to_string(&config).unwrap();
        assert!(text.contains("projectRoot"));

        let back: LoaderConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.client_conditions, config.client_conditions);
    }
}
