//! Incremental delivery: grafts deferred payload parts onto a base decoded
//! result as they arrive.
//!
//! The merger owns exactly one mutable result tree. Patches must be applied
//! in arrival order; a patch rejected before grafting leaves the tree and the
//! pending set untouched, so the caller may keep waiting or abandon the
//! operation.

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json_bytes::Value;

use crate::canonical::CanonicalField;
use crate::canonical::CanonicalSelection;
use crate::canonical::CompiledOperation;
use crate::codec::Decoded;
use crate::codec::Decoder;
use crate::codec::DeferSite;
use crate::codec::ScalarRegistry;
use crate::error::DecodeError;
use crate::error::PatchError;
use crate::field_type::FieldType;
use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::json_ext::PathElement;
use crate::json_ext::ValueExt;
use crate::response::IncrementalPatch;
use crate::schema::Schema;

/// Applies a stream of incremental patches onto a base decoded result.
///
/// Deferred parts are keyed by runtime path plus label. Labels are discovered
/// incrementally: grafting a patch that itself contains nested deferred parts
/// adds those to the pending set at that time.
#[derive(Debug)]
pub struct IncrementalMerger {
    operation: Arc<CompiledOperation>,
    variables: Object,
    data: Value,
    errors: Vec<DecodeError>,
    pending: IndexMap<(Path, Option<String>), DeferSite>,
    complete: bool,
}

impl IncrementalMerger {
    /// Decode the base payload and seed the pending set with every deferred
    /// part the base decode skipped. An operation without active deferrals
    /// starts out already complete.
    pub fn new(
        operation: Arc<CompiledOperation>,
        schema: &Schema,
        data: &Object,
        variables: &Object,
        scalars: &ScalarRegistry,
    ) -> Result<Self, DecodeError> {
        let variables = operation.prepare_variables(schema, variables)?;
        let decoded = operation.decode(schema, data, &variables, scalars)?;
        let pending: IndexMap<_, _> = decoded
            .pending
            .into_iter()
            .map(|defer| ((defer.path, defer.label), defer.site))
            .collect();
        Ok(Self {
            operation,
            variables,
            data: decoded.data,
            errors: decoded.errors,
            complete: pending.is_empty(),
            pending,
        })
    }

    /// Apply one patch. Returns the decode errors met while decoding the
    /// patch data. `DuplicatePatch` and `UnresolvablePatchPath` mean the
    /// patch was not applied; `IncompleteDelivery` is raised after the graft
    /// already landed, and any decode errors that graft produced remain
    /// retrievable through [`errors`](Self::errors).
    pub fn apply(
        &mut self,
        schema: &Schema,
        patch: &IncrementalPatch,
        scalars: &ScalarRegistry,
    ) -> Result<Vec<DecodeError>, PatchError> {
        if self.complete {
            return Err(PatchError::DuplicatePatch {
                path: patch.path.clone(),
                label: patch.label.clone(),
            });
        }

        let is_marker = patch.path.is_empty() && patch.label.is_none() && patch.data.is_null();
        let errors = if is_marker {
            Vec::new()
        } else {
            self.graft(schema, patch, scalars)?
        };

        if patch.is_final {
            if self.pending.is_empty() {
                self.complete = true;
            } else {
                return Err(PatchError::IncompleteDelivery {
                    pending: self
                        .pending
                        .keys()
                        .map(|(path, label)| match label {
                            Some(label) => label.clone(),
                            None => path.to_string(),
                        })
                        .collect(),
                });
            }
        }
        Ok(errors)
    }

    fn graft(
        &mut self,
        schema: &Schema,
        patch: &IncrementalPatch,
        scalars: &ScalarRegistry,
    ) -> Result<Vec<DecodeError>, PatchError> {
        let key = (patch.path.clone(), patch.label.clone());
        let Some(site) = self.pending.get(&key).copied() else {
            // An already-applied part resolves in the tree; anything else is
            // a path the base result never had.
            return if self.data.get_path(&patch.path).is_some() {
                Err(PatchError::DuplicatePatch {
                    path: patch.path.clone(),
                    label: patch.label.clone(),
                })
            } else {
                Err(PatchError::UnresolvablePatchPath {
                    path: patch.path.clone(),
                })
            };
        };

        let decoded = match site {
            DeferSite::Field => self.graft_field(schema, patch, scalars)?,
            DeferSite::Fragment => self.graft_fragment(schema, patch, scalars)?,
        };
        self.pending.shift_remove(&key);
        for defer in decoded.pending {
            self.pending
                .insert((defer.path, defer.label), defer.site);
        }
        self.errors.extend(decoded.errors.iter().cloned());
        Ok(decoded.errors)
    }

    fn graft_field(
        &mut self,
        schema: &Schema,
        patch: &IncrementalPatch,
        scalars: &ScalarRegistry,
    ) -> Result<Decoded, PatchError> {
        let unresolvable = || PatchError::UnresolvablePatchPath {
            path: patch.path.clone(),
        };
        let Some(PathElement::Key(field_key)) = patch.path.last().cloned() else {
            return Err(unresolvable());
        };
        let parent_path = patch.path.parent();
        let field = find_field(self.operation.root(), &patch.path).ok_or_else(unresolvable)?;
        match self.data.get_path(&parent_path) {
            Some(Value::Object(_)) => {}
            _ => return Err(unresolvable()),
        }

        let mut decoder = Decoder::new(
            schema,
            self.operation.fallback(),
            &self.variables,
            scalars,
            patch.path.clone(),
        );
        let value = decoder.decode_value(&field.field_type, field, &patch.data);
        let failed = value.is_err();
        let decoded = decoder.finish(value.unwrap_or(Value::Null));

        if failed && field.field_type.is_non_null() {
            // The base decode never leaves a null at a non-null position;
            // the failure invalidates the nearest nullable ancestor instead.
            self.null_nearest_nullable(&parent_path);
        } else if let Some(Value::Object(parent)) = self.data.get_path_mut(&parent_path) {
            parent.insert(field_key.as_str(), decoded.data.clone());
        }
        Ok(decoded)
    }

    /// Null out the innermost nullable position along `path`. With only
    /// non-null positions on the way up the whole result becomes null.
    fn null_nearest_nullable(&mut self, path: &Path) {
        let mut positions = Vec::new();
        let mut selection = Some(self.operation.root());
        let mut ty: Option<&FieldType> = None;
        let mut prefix = Path::empty();
        for element in path.iter() {
            match element {
                PathElement::Key(key) => {
                    let Some(field) = selection.and_then(|level| lookup(level, key)) else {
                        break;
                    };
                    ty = Some(&field.field_type);
                    selection = field.selection.as_ref();
                    prefix.push(PathElement::Key(key.clone()));
                    positions.push((prefix.clone(), !field.field_type.is_non_null()));
                }
                PathElement::Index(index) => {
                    ty = ty.and_then(list_item_type);
                    prefix.push(PathElement::Index(*index));
                    let nullable = ty.is_none_or(|ty| !ty.is_non_null());
                    positions.push((prefix.clone(), nullable));
                }
            }
        }
        for (position, nullable) in positions.into_iter().rev() {
            if !nullable {
                continue;
            }
            if let Some(target) = self.data.get_path_mut(&position) {
                *target = Value::Null;
                return;
            }
        }
        self.data = Value::Null;
    }

    fn graft_fragment(
        &mut self,
        schema: &Schema,
        patch: &IncrementalPatch,
        scalars: &ScalarRegistry,
    ) -> Result<Decoded, PatchError> {
        let unresolvable = || PatchError::UnresolvablePatchPath {
            path: patch.path.clone(),
        };
        let selection =
            find_selection(self.operation.root(), &patch.path).ok_or_else(unresolvable)?;
        // Unlabeled deferred fragments at one level share a patch key, so a
        // single patch delivers the union of their selections.
        let fragments: Vec<_> = selection
            .fragments
            .iter()
            .filter(|fragment| {
                fragment
                    .deferral
                    .as_ref()
                    .is_some_and(|deferral| deferral.label == patch.label)
            })
            .collect();
        if fragments.is_empty() {
            return Err(unresolvable());
        }
        match self.data.get_path(&patch.path) {
            Some(Value::Object(_)) => {}
            _ => return Err(unresolvable()),
        }
        let Value::Object(input) = &patch.data else {
            return Err(unresolvable());
        };

        let mut decoder = Decoder::new(
            schema,
            self.operation.fallback(),
            &self.variables,
            scalars,
            patch.path.clone(),
        );
        let mut output = Object::default();
        let mut failed = false;
        for fragment in &fragments {
            if decoder
                .decode_selection(&fragment.selection, input, &mut output)
                .is_err()
            {
                failed = true;
                break;
            }
        }
        let data = if failed {
            Value::Null
        } else {
            Value::Object(output)
        };
        let decoded = decoder.finish(data);

        if let Some(target) = self.data.get_path_mut(&patch.path) {
            target.deep_merge(decoded.data.clone());
        }
        Ok(decoded)
    }

    /// The result as decoded so far, with still-pending parts absent.
    pub fn current_result(&self) -> &Value {
        &self.data
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Errors accumulated by the base decode and every applied patch.
    pub fn errors(&self) -> &[DecodeError] {
        &self.errors
    }

    pub fn pending(&self) -> impl Iterator<Item = (&Path, Option<&str>)> {
        self.pending
            .keys()
            .map(|(path, label)| (path, label.as_deref()))
    }

    pub fn into_result(self) -> (Value, Vec<DecodeError>) {
        (self.data, self.errors)
    }
}

/// Walk the canonical tree along the key components of a runtime path,
/// searching each level's fields and, failing that, its self-sufficient
/// fragment shapes.
fn find_field<'a>(root: &'a CanonicalSelection, path: &Path) -> Option<&'a CanonicalField> {
    let mut selection = root;
    let mut found = None;
    for element in path.iter() {
        let PathElement::Key(key) = element else {
            continue;
        };
        let field = lookup(selection, key)?;
        found = Some(field);
        if let Some(nested) = &field.selection {
            selection = nested;
        }
    }
    found
}

fn find_selection<'a>(root: &'a CanonicalSelection, path: &Path) -> Option<&'a CanonicalSelection> {
    let mut selection = root;
    for element in path.iter() {
        let PathElement::Key(key) = element else {
            continue;
        };
        selection = lookup(selection, key)?.selection.as_ref()?;
    }
    Some(selection)
}

fn list_item_type(ty: &FieldType) -> Option<&FieldType> {
    match ty {
        FieldType::NonNull(inner) => list_item_type(inner),
        FieldType::List(inner) => Some(inner),
        _ => None,
    }
}

fn lookup<'a>(selection: &'a CanonicalSelection, key: &str) -> Option<&'a CanonicalField> {
    if let Some(field) = selection.field(key) {
        return Some(field);
    }
    selection
        .fragments
        .iter()
        .find_map(|fragment| lookup(&fragment.selection, key))
}

#[cfg(test)]
mod tests {
    use apollo_compiler::ExecutableDocument;
    use pretty_assertions::assert_eq;
    use serde_json_bytes::json;
    use test_log::test;

    use super::*;
    use crate::canonical::CompileOptions;
    use crate::canonical::PolymorphicFallback;

    const SCHEMA: &str = r#"
        directive @defer(label: String, if: Boolean! = true) on FRAGMENT_SPREAD | INLINE_FRAGMENT | FIELD

        type Screen {
            resolution: String!
            refreshRate: Int
        }

        type Computer {
            id: ID!
            cpu: String
            screen: Screen
            monitor: Screen!
        }

        type Query {
            computers: [Computer!]!
        }
    "#;

    fn merger(query: &str, payload: Value) -> (Schema, IncrementalMerger) {
        let schema = Schema::parse(SCHEMA).expect("schema parses");
        let document =
            ExecutableDocument::parse_and_validate(schema.definitions(), query, "query.graphql")
                .expect("query parses and validates");
        let operation = CompiledOperation::compile(&schema, &document, None, CompileOptions {
            fallback: PolymorphicFallback::BaseSelection,
        })
        .expect("operation compiles");
        let Value::Object(data) = payload else {
            panic!("payload must be an object");
        };
        let merger = IncrementalMerger::new(
            Arc::new(operation),
            &schema,
            &data,
            &Object::default(),
            &ScalarRegistry::new(),
        )
        .expect("base payload decodes");
        (schema, merger)
    }

    fn pending_paths(merger: &IncrementalMerger) -> Vec<String> {
        merger.pending().map(|(path, _)| path.to_string()).collect()
    }

    #[test]
    fn operations_without_deferrals_start_complete() {
        let (_schema, merger) = merger(
            "{ computers { id } }",
            json!({ "computers": [{ "id": "c0" }] }),
        );
        assert!(merger.is_complete());
        assert!(merger.errors().is_empty());
        assert_eq!(
            merger.current_result(),
            &json!({ "computers": [{ "id": "c0" }] }),
        );
    }

    #[test]
    fn deferred_field_patch_completes_the_result() {
        let (schema, mut merger) = merger(
            "{ computers { id screen @defer { resolution } } }",
            json!({ "computers": [{ "id": "c0" }] }),
        );
        assert!(!merger.is_complete());
        assert_eq!(pending_paths(&merger), ["/computers/0/screen"]);

        let patch = IncrementalPatch::new(
            Path::from("/computers/0/screen"),
            json!({ "resolution": "4K" }),
        )
        .and_final();
        let errors = merger
            .apply(&schema, &patch, &ScalarRegistry::new())
            .expect("patch applies");
        assert!(errors.is_empty());
        assert!(merger.is_complete());
        assert_eq!(
            merger.current_result(),
            &json!({ "computers": [{ "id": "c0", "screen": { "resolution": "4K" } }] }),
        );
    }

    #[test]
    fn deferred_fragment_patch_merges_under_its_label() {
        let (schema, mut merger) = merger(
            r#"{ computers { id ... on Computer @defer(label: "specs") { cpu } } }"#,
            json!({ "computers": [{ "id": "c0" }] }),
        );
        let pending: Vec<_> = merger.pending().collect();
        assert_eq!(pending, [(&Path::from("/computers/0"), Some("specs"))]);

        // The fragment is self-sufficient, so its payload repeats the parent
        // fields alongside its own.
        let patch = IncrementalPatch::new(
            Path::from("/computers/0"),
            json!({ "id": "c0", "cpu": "x86" }),
        )
        .with_label("specs")
        .and_final();
        let errors = merger
            .apply(&schema, &patch, &ScalarRegistry::new())
            .expect("patch applies");
        assert!(errors.is_empty());
        assert!(merger.is_complete());
        assert_eq!(
            merger.current_result(),
            &json!({ "computers": [{ "id": "c0", "cpu": "x86" }] }),
        );
    }

    #[test]
    fn nested_deferrals_are_discovered_while_grafting() {
        let (schema, mut merger) = merger(
            r#"{
                computers {
                    id
                    screen @defer(label: "outer") {
                        resolution
                        refreshRate @defer(label: "inner")
                    }
                }
            }"#,
            json!({ "computers": [{ "id": "c0" }] }),
        );
        assert_eq!(pending_paths(&merger), ["/computers/0/screen"]);

        let outer = IncrementalPatch::new(
            Path::from("/computers/0/screen"),
            json!({ "resolution": "4K" }),
        )
        .with_label("outer");
        merger
            .apply(&schema, &outer, &ScalarRegistry::new())
            .expect("outer patch applies");
        assert!(!merger.is_complete());
        assert_eq!(pending_paths(&merger), ["/computers/0/screen/refreshRate"]);

        let inner = IncrementalPatch::new(Path::from("/computers/0/screen/refreshRate"), json!(60))
            .with_label("inner")
            .and_final();
        merger
            .apply(&schema, &inner, &ScalarRegistry::new())
            .expect("inner patch applies");
        assert!(merger.is_complete());
        assert_eq!(
            merger.current_result(),
            &json!({
                "computers": [{
                    "id": "c0",
                    "screen": { "resolution": "4K", "refreshRate": 60 },
                }],
            }),
        );
    }

    #[test]
    fn patch_data_errors_are_reported_but_still_grafted() {
        let (schema, mut merger) = merger(
            "{ computers { id screen @defer { resolution } } }",
            json!({ "computers": [{ "id": "c0" }] }),
        );

        let patch = IncrementalPatch::new(
            Path::from("/computers/0/screen"),
            json!({ "resolution": null }),
        );
        let errors = merger
            .apply(&schema, &patch, &ScalarRegistry::new())
            .expect("patch applies");
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].path(),
            Some(&Path::from("/computers/0/screen/resolution")),
        );
        assert_eq!(
            merger.current_result(),
            &json!({ "computers": [{ "id": "c0", "screen": null }] }),
        );
    }

    #[test]
    fn failed_non_null_graft_bubbles_to_a_nullable_ancestor() {
        let (schema, mut merger) = merger(
            "{ computers { id screen { refreshRate resolution @defer } } }",
            json!({ "computers": [{ "id": "c0", "screen": { "refreshRate": 60 } }] }),
        );
        assert_eq!(pending_paths(&merger), ["/computers/0/screen/resolution"]);

        let patch =
            IncrementalPatch::new(Path::from("/computers/0/screen/resolution"), json!(null));
        let errors = merger
            .apply(&schema, &patch, &ScalarRegistry::new())
            .expect("patch applies");
        assert_eq!(errors, [DecodeError::NonNullViolation {
            path: Path::from("/computers/0/screen/resolution"),
        }]);
        // resolution is non-null, so the null lands on screen instead.
        assert_eq!(
            merger.current_result(),
            &json!({ "computers": [{ "id": "c0", "screen": null }] }),
        );
    }

    #[test]
    fn failed_non_null_graft_without_nullable_ancestors_nulls_the_result() {
        let (schema, mut merger) = merger(
            "{ computers { id monitor @defer { resolution } } }",
            json!({ "computers": [{ "id": "c0" }] }),
        );
        let patch = IncrementalPatch::new(
            Path::from("/computers/0/monitor"),
            json!({ "resolution": null }),
        );
        let errors = merger
            .apply(&schema, &patch, &ScalarRegistry::new())
            .expect("patch applies");
        assert_eq!(errors, [DecodeError::NonNullViolation {
            path: Path::from("/computers/0/monitor/resolution"),
        }]);
        assert_eq!(merger.current_result(), &Value::Null);
    }

    #[test]
    fn unlabeled_sibling_deferrals_share_one_pending_part() {
        let (schema, mut merger) = merger(
            r#"{
                computers {
                    id
                    ... on Computer @defer { cpu }
                    ... on Computer @defer { screen { resolution } }
                }
            }"#,
            json!({ "computers": [{ "id": "c0" }] }),
        );
        let pending: Vec<_> = merger.pending().collect();
        assert_eq!(pending, [(&Path::from("/computers/0"), None)]);

        let patch = IncrementalPatch::new(
            Path::from("/computers/0"),
            json!({ "id": "c0", "cpu": "x86", "screen": { "resolution": "4K" } }),
        )
        .and_final();
        let errors = merger
            .apply(&schema, &patch, &ScalarRegistry::new())
            .expect("patch applies");
        assert!(errors.is_empty());
        assert!(merger.is_complete());
        assert_eq!(
            merger.current_result(),
            &json!({
                "computers": [{ "id": "c0", "cpu": "x86", "screen": { "resolution": "4K" } }],
            }),
        );
    }

    #[test]
    fn a_rejected_final_patch_keeps_its_grafted_data() {
        let (schema, mut merger) = merger(
            r#"{
                computers {
                    id
                    cpu @defer(label: "cpus")
                    screen @defer(label: "screens") { resolution }
                }
            }"#,
            json!({ "computers": [{ "id": "c0" }] }),
        );
        let patch = IncrementalPatch::new(
            Path::from("/computers/0/screen"),
            json!({ "resolution": "4K" }),
        )
        .with_label("screens")
        .and_final();
        let error = merger
            .apply(&schema, &patch, &ScalarRegistry::new())
            .expect_err("another part is still outstanding");
        assert_eq!(error, PatchError::IncompleteDelivery {
            pending: vec!["cpus".to_owned()],
        });
        assert!(!merger.is_complete());
        assert_eq!(pending_paths(&merger), ["/computers/0/cpu"]);
        assert_eq!(
            merger.current_result(),
            &json!({ "computers": [{ "id": "c0", "screen": { "resolution": "4K" } }] }),
        );
    }

    #[test]
    fn reapplying_a_grafted_patch_is_a_duplicate() {
        let (schema, mut merger) = merger(
            "{ computers { id screen @defer { resolution } } }",
            json!({ "computers": [{ "id": "c0" }] }),
        );
        let patch = IncrementalPatch::new(
            Path::from("/computers/0/screen"),
            json!({ "resolution": "4K" }),
        );
        merger
            .apply(&schema, &patch, &ScalarRegistry::new())
            .expect("first application succeeds");
        let error = merger
            .apply(&schema, &patch, &ScalarRegistry::new())
            .expect_err("second application is rejected");
        assert_eq!(error, PatchError::DuplicatePatch {
            path: Path::from("/computers/0/screen"),
            label: None,
        });
    }

    #[test]
    fn unknown_patch_paths_are_rejected() {
        let (schema, mut merger) = merger(
            "{ computers { id screen @defer { resolution } } }",
            json!({ "computers": [{ "id": "c0" }] }),
        );
        let patch = IncrementalPatch::new(Path::from("/widgets/0"), json!({ "resolution": "4K" }));
        let error = merger
            .apply(&schema, &patch, &ScalarRegistry::new())
            .expect_err("path never existed");
        assert_eq!(error, PatchError::UnresolvablePatchPath {
            path: Path::from("/widgets/0"),
        });
    }

    #[test]
    fn a_final_patch_with_parts_still_pending_is_rejected() {
        let (schema, mut merger) = merger(
            r#"{ computers { id screen @defer(label: "screens") { resolution } } }"#,
            json!({ "computers": [{ "id": "c0" }] }),
        );
        let error = merger
            .apply(&schema, &IncrementalPatch::final_marker(), &ScalarRegistry::new())
            .expect_err("a deferred part is still outstanding");
        assert_eq!(error, PatchError::IncompleteDelivery {
            pending: vec!["screens".to_owned()],
        });
        assert!(!merger.is_complete());
    }

    #[test]
    fn a_final_marker_after_the_last_patch_completes() {
        let (schema, mut merger) = merger(
            "{ computers { id screen @defer { resolution } } }",
            json!({ "computers": [{ "id": "c0" }] }),
        );
        let patch = IncrementalPatch::new(
            Path::from("/computers/0/screen"),
            json!({ "resolution": "4K" }),
        );
        merger
            .apply(&schema, &patch, &ScalarRegistry::new())
            .expect("patch applies");
        assert!(!merger.is_complete());
        merger
            .apply(&schema, &IncrementalPatch::final_marker(), &ScalarRegistry::new())
            .expect("marker closes the stream");
        assert!(merger.is_complete());

        let error = merger
            .apply(&schema, &patch, &ScalarRegistry::new())
            .expect_err("the stream is closed");
        assert!(matches!(error, PatchError::DuplicatePatch { .. }));
    }
}
