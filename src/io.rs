use std::path::PathBuf;

use thiserror::Error;

use crate::model::KineticModel;

/// Loads a kinetic model from a JSON file.
///
/// The serialization is lossless: rate-law bindings, parameter roles,
/// initial values and explicit `Undefined` sentinels all survive a
/// load/save/load round trip unchanged.
///
/// # Errors
///
/// * [`IOError::FileNotFound`] when the file cannot be opened
/// * [`IOError::JsonParseError`] when the contents are not a valid model
pub fn load_model(path: impl Into<PathBuf>) -> Result<KineticModel, IOError> {
    let path = path.into();
    let file = std::fs::File::open(path).map_err(IOError::FileNotFound)?;
    serde_json::from_reader(file).map_err(IOError::JsonParseError)
}

/// Saves a kinetic model to a JSON file (pretty-printed).
pub fn save_model(path: impl Into<PathBuf>, model: &KineticModel) -> Result<(), IOError> {
    let path = path.into();
    let file = std::fs::File::create(path).map_err(IOError::FileNotFound)?;
    serde_json::to_writer_pretty(file, model).map_err(IOError::JsonParseError)
}

/// Errors raised by model file I/O.
#[derive(Error, Debug)]
pub enum IOError {
    #[error("file not found: {0}")]
    FileNotFound(#[from] std::io::Error),

    #[error("failed to parse JSON: {0}")]
    JsonParseError(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo;
    use crate::model::QuantityValue;

    #[test]
    fn round_trip_preserves_bindings_and_initial_values() {
        let model = demo::phospho_network();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");

        save_model(&path, &model).unwrap();
        let restored = load_model(&path).unwrap();

        assert_eq!(model.name, restored.name);
        assert_eq!(model.species.len(), restored.species.len());
        for (a, b) in model.reactions.iter().zip(&restored.reactions) {
            assert_eq!(a.kinetic_law.function_id, b.kinetic_law.function_id);
            assert_eq!(a.kinetic_law.bindings, b.kinetic_law.bindings);
        }
        for (a, b) in model.quantities.iter().zip(&restored.quantities) {
            assert_eq!(a.initial_value, b.initial_value);
        }

        // a second round trip is byte-identical
        let json_a = serde_json::to_string(&restored).unwrap();
        let json_b =
            serde_json::to_string(&serde_json::from_str::<KineticModel>(&json_a).unwrap()).unwrap();
        assert_eq!(json_a, json_b);
    }

    #[test]
    fn undefined_sentinels_survive_io() {
        let mut model = demo::phospho_network();
        model.quantities[0].initial_value = QuantityValue::Undefined;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        save_model(&path, &model).unwrap();
        let restored = load_model(&path).unwrap();

        assert_eq!(
            restored.quantities[0].initial_value,
            QuantityValue::Undefined
        );
    }

    #[test]
    fn missing_file_is_reported() {
        assert!(matches!(
            load_model("/definitely/not/here.json"),
            Err(IOError::FileNotFound(_))
        ));
    }
}
