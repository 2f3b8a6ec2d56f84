//! Invocation records.

use crate::document::{Document, InvokeDef, NodeId};
use crate::error::CoreError;
use crate::expr::{Expr, Scope};
use crate::interpreter::Interpreter;
use crate::loader::load_value;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;

/// Invocation lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InvokeStatus {
    /// Started, not yet finalized.
    Active,
    /// Finalized after completion.
    Done,
    /// Canceled because its owning state exited.
    Canceled,
}

/// A started invocation. Records are kept after completion for inspection.
#[derive(Debug)]
pub struct InvocationRecord {
    pub id: String,
    /// State that owns the `<invoke>`.
    pub owner: NodeId,
    /// Position of the `<invoke>` under its owner.
    pub index: usize,
    pub status: InvokeStatus,
    pub autoforward: bool,
    pub(crate) child: Option<Box<Interpreter>>,
}

impl InvocationRecord {
    pub fn is_active(&self) -> bool {
        self.status == InvokeStatus::Active
    }

    /// The child interpreter, for `scxml` invocations that loaded.
    pub fn child(&self) -> Option<&Interpreter> {
        self.child.as_deref()
    }

    /// Whether events may still be routed to the child.
    pub fn accepts_events(&self) -> bool {
        self.status != InvokeStatus::Canceled && self.child.is_some()
    }
}

/// Builds the child document of an `scxml` invocation from inline
/// `<content>`, `src` or `srcexpr`.
pub(crate) fn child_document(
    def: &InvokeDef,
    scope: &dyn Scope,
    base_dir: Option<&Path>,
) -> Result<Document, CoreError> {
    if let Some(content) = &def.content {
        let tree = match &content.expr {
            Some(expr) => Expr::parse_value(expr).evaluate(scope),
            None => content.value.clone(),
        };
        let tree = match tree {
            Value::String(text) => serde_json::from_str(&text)?,
            other => other,
        };
        return document_from_tree(tree, base_dir);
    }

    let src = match (&def.src, &def.srcexpr) {
        (Some(src), _) => Some(src.clone()),
        (None, Some(expr)) => match Expr::parse_value(expr).evaluate(scope) {
            Value::String(s) => Some(s),
            _ => None,
        },
        (None, None) => None,
    };
    match src {
        Some(src) => {
            let tree = load_value(&src, base_dir)?;
            let nested = base_dir.map(|base| {
                base.join(&src)
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| base.to_path_buf())
            });
            document_from_tree(tree, nested.as_deref())
        }
        None => Err(CoreError::InvalidDocument {
            reason: "invoke has neither content nor src".to_string(),
        }),
    }
}

fn document_from_tree(tree: Value, base_dir: Option<&Path>) -> Result<Document, CoreError> {
    // Inline content may wrap the chart in an `scxml` element
    let tree = match tree {
        Value::Object(mut map) if map.contains_key("scxml") => {
            map.remove("scxml").unwrap_or(Value::Null)
        }
        other => other,
    };
    let doc = Document::from_value(&tree)?;
    Ok(match base_dir {
        Some(dir) => doc.with_base_dir(dir),
        None => doc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Content;
    use serde_json::{json, Map};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_inline_content() {
        let def = InvokeDef {
            content: Some(Content {
                expr: None,
                value: json!({"scxml": {"state": [{"id": "child"}]}}),
            }),
            ..Default::default()
        };
        let doc = child_document(&def, &Map::new(), None).unwrap();
        assert!(doc.lookup("child").is_some());
    }

    #[test]
    fn test_content_expr() {
        let mut data = Map::new();
        data.insert("chart".into(), json!({"state": [{"id": "dynamic"}]}));
        let def = InvokeDef {
            content: Some(Content {
                expr: Some("chart".into()),
                value: Value::Null,
            }),
            ..Default::default()
        };
        let doc = child_document(&def, &data, None).unwrap();
        assert!(doc.lookup("dynamic").is_some());
    }

    #[test]
    fn test_src_relative_to_base() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(
            dir.path().join("sub/child.json"),
            r#"{"state": [{"id": "from_file"}]}"#,
        )
        .unwrap();

        let def = InvokeDef {
            src: Some("sub/child.json".into()),
            ..Default::default()
        };
        let doc = child_document(&def, &Map::new(), Some(dir.path())).unwrap();
        assert!(doc.lookup("from_file").is_some());
        assert_eq!(doc.base_dir(), Some(dir.path().join("sub").as_path()));
    }

    #[test]
    fn test_missing_source() {
        let def = InvokeDef::default();
        assert!(child_document(&def, &Map::new(), None).is_err());

        let def = InvokeDef {
            src: Some("nowhere.json".into()),
            ..Default::default()
        };
        let err = child_document(&def, &Map::new(), None).unwrap_err();
        assert!(matches!(err, CoreError::Io { .. }));
    }
}
