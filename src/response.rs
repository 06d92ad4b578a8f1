//! Wire shape of one incremental delivery unit.

use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::Value;

use crate::json_ext::Path;

/// One out-of-band deferred piece of a response.
///
/// `path` addresses the graft position in the base result with response keys
/// and list indices; `label` echoes the defer label when one was declared.
/// The producer sets `is_final` on the last unit of the stream, which may be
/// an otherwise empty marker.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncrementalPatch {
    #[serde(default, skip_serializing_if = "Path::is_empty")]
    pub path: Path,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(default)]
    pub data: Value,

    #[serde(default)]
    pub is_final: bool,
}

impl IncrementalPatch {
    pub fn new(path: Path, data: Value) -> Self {
        Self {
            path,
            label: None,
            data,
            is_final: false,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn and_final(mut self) -> Self {
        self.is_final = true;
        self
    }

    /// A bare end-of-stream marker carrying no data.
    pub fn final_marker() -> Self {
        Self {
            path: Path::empty(),
            label: None,
            data: Value::Null,
            is_final: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;
    use crate::json_ext::PathElement;

    #[test]
    fn serializes_in_camel_case() {
        let patch = IncrementalPatch::new(
            Path(vec![
                PathElement::Key("computers".to_owned()),
                PathElement::Index(0),
            ]),
            json!({"screen": {"resolution": "4K"}}),
        )
        .with_label("screens")
        .and_final();

        let serialized = serde_json::to_value(&patch).expect("patch serializes");
        assert_eq!(
            serialized,
            serde_json::json!({
                "path": ["computers", 0],
                "label": "screens",
                "data": {"screen": {"resolution": "4K"}},
                "isFinal": true,
            })
        );
    }

    #[test]
    fn deserializes_with_defaults() {
        let patch: IncrementalPatch =
            serde_json::from_str(r#"{"data": {"a": 1}}"#).expect("patch deserializes");
        assert_eq!(patch.path, Path::empty());
        assert_eq!(patch.label, None);
        assert!(!patch.is_final);
    }

    #[test]
    fn final_marker_round_trips() {
        let marker = IncrementalPatch::final_marker();
        let serialized = serde_json::to_string(&marker).expect("marker serializes");
        let back: IncrementalPatch = serde_json::from_str(&serialized).expect("marker parses");
        assert_eq!(marker, back);
    }
}
