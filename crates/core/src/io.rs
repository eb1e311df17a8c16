//! Field load/save collaborator
//!
//! Fields are persisted as JSON documents holding the quantity name, unit,
//! dimension coordinates, attributes and data array. Loading re-validates the
//! coordinate/data invariants so a hand-edited file cannot smuggle in a
//! malformed field.

use crate::error::{Error, Result};
use crate::field::Field;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Load a field from a JSON file.
///
/// # Errors
/// [`Error::Load`] if the file cannot be read, [`Error::Serialization`] if
/// it does not parse, [`Error::ShapeMismatch`] if coordinates and data
/// disagree.
pub fn load_field<P: AsRef<Path>>(path: P) -> Result<Field> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|source| Error::Load {
        path: path.to_path_buf(),
        source,
    })?;
    let field: Field = serde_json::from_str(&contents).map_err(|source| Error::Serialization {
        path: path.to_path_buf(),
        source,
    })?;
    field.validate()?;
    debug!(
        path = %path.display(),
        name = field.name(),
        shape = ?field.shape(),
        "Loaded field"
    );
    Ok(field)
}

/// Save a field to a JSON file, replacing any existing file.
pub fn save_field<P: AsRef<Path>>(field: &Field, path: P) -> Result<()> {
    let path = path.as_ref();
    let contents = serde_json::to_string(field).map_err(|source| Error::Serialization {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, contents).map_err(|source| Error::Save {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), name = field.name(), "Saved field");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{DimCoord, REALIZATION};

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("nwp_post_io_{}_{name}", std::process::id()))
    }

    #[test]
    fn test_save_and_load_preserves_metadata() {
        let coords = vec![
            DimCoord::index(REALIZATION, 2),
            DimCoord::new("y", "m", vec![0.0, 2000.0]),
        ];
        let field = Field::from_values("air_temperature", "K", coords, vec![280.0, 281.5, 279.0, 282.25])
            .unwrap()
            .with_attribute("source", "unit-test");

        let path = temp_path("round_trip.json");
        save_field(&field, &path).unwrap();
        let loaded = load_field(&path).unwrap();
        assert_eq!(loaded, field);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_missing_file_is_load_error() {
        let err = load_field(temp_path("does_not_exist.json")).unwrap_err();
        assert!(matches!(err, Error::Load { .. }));
        assert!(err.to_string().contains("does_not_exist.json"));
    }

    #[test]
    fn test_garbage_file_is_serialization_error() {
        let path = temp_path("garbage.json");
        fs::write(&path, "{not json").unwrap();
        let err = load_field(&path).unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));
        let _ = fs::remove_file(&path);
    }
}
