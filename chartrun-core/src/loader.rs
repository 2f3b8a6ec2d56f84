//! Document loading.

use crate::document::Document;
use crate::error::CoreError;
use serde_json::Value;
use std::fs;
use std::path::Path;

/// Converts SCXML markup into the canonical scjson tree.
pub trait DocumentConverter {
    fn convert(&self, xml: &str, path: &Path) -> Result<Value, CoreError>;
}

/// Loads a document from disk.
///
/// SCXML input (`xml`, or a `.scxml` extension) goes through `converter`;
/// without one it fails with [`CoreError::XmlUnsupported`]. External
/// references in the document resolve against the file's directory.
pub fn load_document(
    path: &Path,
    xml: bool,
    converter: Option<&dyn DocumentConverter>,
) -> Result<Document, CoreError> {
    let text = fs::read_to_string(path).map_err(|source| CoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let is_xml = xml
        || path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("scxml"));

    let tree = if is_xml {
        match converter {
            Some(converter) => converter.convert(&text, path)?,
            None => {
                return Err(CoreError::XmlUnsupported {
                    path: path.display().to_string(),
                })
            }
        }
    } else {
        serde_json::from_str(&text)?
    };

    let doc = Document::from_value(&tree)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    tracing::debug!(
        "loaded {} ({} nodes)",
        path.display(),
        doc.len()
    );

    Ok(doc.with_base_dir(base))
}

/// Reads a JSON value referenced by a `src` attribute.
pub(crate) fn load_value(src: &str, base_dir: Option<&Path>) -> Result<Value, CoreError> {
    let src = src.strip_prefix("file:").unwrap_or(src);
    let path = match base_dir {
        Some(base) => base.join(src),
        None => Path::new(src).to_path_buf(),
    };
    let text = fs::read_to_string(&path).map_err(|source| CoreError::Io { path, source })?;
    Ok(serde_json::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    struct FixedConverter;

    impl DocumentConverter for FixedConverter {
        fn convert(&self, _xml: &str, _path: &Path) -> Result<Value, CoreError> {
            Ok(json!({"state": [{"id": "converted"}]}))
        }
    }

    #[test]
    fn test_load_json_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chart.scjson");
        fs::write(&path, r#"{"state": [{"id": "a"}, {"id": "b"}]}"#).unwrap();

        let doc = load_document(&path, false, None).unwrap();
        assert!(doc.lookup("b").is_some());
        assert_eq!(doc.base_dir(), Some(dir.path()));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        let err = load_document(&dir.path().join("nope.json"), false, None).unwrap_err();
        assert!(matches!(err, CoreError::Io { .. }));
        assert!(err.is_load_error());
    }

    #[test]
    fn test_bad_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{not json").unwrap();

        let err = load_document(&path, false, None).unwrap_err();
        assert_eq!(err.error_code(), "BAD_JSON");
    }

    #[test]
    fn test_xml_requires_converter() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chart.scxml");
        fs::write(&path, "<scxml/>").unwrap();

        let err = load_document(&path, false, None).unwrap_err();
        assert!(matches!(err, CoreError::XmlUnsupported { .. }));

        let doc = load_document(&path, false, Some(&FixedConverter)).unwrap();
        assert!(doc.lookup("converted").is_some());
    }

    #[test]
    fn test_load_value_relative_to_base() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("data.json"), r#"{"n": 1}"#).unwrap();

        let value = load_value("data.json", Some(dir.path())).unwrap();
        assert_eq!(value, json!({"n": 1}));
        assert!(load_value("missing.json", Some(dir.path())).is_err());
    }
}
