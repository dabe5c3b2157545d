//! JSON config loading.
//!
//! Every artifact config is first read into a generic key-value mapping and
//! then converted into the explicit config struct of the component it
//! configures.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::ArtifactError;

/// Read a JSON document into a key-value mapping.
pub fn load(path: &Path) -> Result<Map<String, Value>, ArtifactError> {
    let content = std::fs::read_to_string(path).map_err(|source| ArtifactError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let value: Value = serde_json::from_str(&content).map_err(|source| ArtifactError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    match value {
        Value::Object(map) => Ok(map),
        other => Err(ArtifactError::Invalid {
            path: path.to_path_buf(),
            message: format!("expected a JSON object, found {}", json_kind(&other)),
        }),
    }
}

/// Read a JSON document and convert it into a typed config.
pub fn load_as<T: DeserializeOwned>(path: &Path) -> Result<T, ArtifactError> {
    let map = load(path)?;
    from_mapping(map, path)
}

/// Convert an already-loaded mapping into a typed config.
pub fn from_mapping<T: DeserializeOwned>(
    map: Map<String, Value>,
    path: &Path,
) -> Result<T, ArtifactError> {
    serde_json::from_value(Value::Object(map)).map_err(|e| ArtifactError::Invalid {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn test_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("generation.json");
        let original = json!({
            "max_length": 16,
            "num_beams": 4,
            "do_sample": false,
            "image_mean": [0.5, 0.5, 0.5],
            "nested": { "bos_token": "<|endoftext|>" }
        });
        std::fs::write(&path, serde_json::to_string_pretty(&original).unwrap()).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(Value::Object(loaded), original);
    }

    #[test]
    fn test_load_missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, ArtifactError::Read { .. }));
    }

    #[test]
    fn test_load_malformed_json_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{\"max_length\": 16,").unwrap();

        let err = load(&path).unwrap_err();
        assert!(matches!(err, ArtifactError::Parse { .. }));
    }

    #[test]
    fn test_load_non_object_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.json");
        std::fs::write(&path, "[1, 2, 3]").unwrap();

        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("an array"));
    }

    #[test]
    fn test_load_as_type_mismatch_is_invalid() {
        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Resize {
            size: u32,
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sized.json");
        std::fs::write(&path, r#"{"size": "large"}"#).unwrap();

        let err = load_as::<Resize>(&path).unwrap_err();
        assert!(matches!(err, ArtifactError::Invalid { .. }));
    }
}
