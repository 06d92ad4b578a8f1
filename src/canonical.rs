//! Canonical field trees: the merged, immutable output of compiling one
//! operation, consumed many times by the codec and the incremental merger.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;

use apollo_compiler::ExecutableDocument;
use apollo_compiler::ast;
use apollo_compiler::validation::Valid;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Value;

use crate::error::CompileError;
use crate::field_type::FieldType;
use crate::fragments::Fragment;
use crate::fragments::Fragments;
use crate::json_ext::Path;
use crate::json_ext::PathElement;
use crate::merge::merge_fields;
use crate::merge::merge_fragments;
use crate::schema::Schema;
use crate::selection::Argument;
use crate::selection::Deferral;
use crate::selection::IncludeSkip;
use crate::selection::Selection;

/// Where a field occurrence was contributed from. Grows under merge, never
/// shrinks, and lets consumers disambiguate name collisions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// Selected directly in the operation body.
    Operation,
    /// Selected through the named fragment.
    Fragment(String),
    /// Selected through an inline fragment with this type condition.
    InlineFragment(String),
}

/// Synthetic identity of one fragment occurrence, usable to reach that
/// fragment's data without re-traversing the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FragmentHandle(u32);

/// Resolved accessor data for one [`FragmentHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentAccessor {
    pub name: Option<String>,
    pub type_condition: String,
    /// Response-key path from the operation root to the fragment's position.
    pub path: Path,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalField {
    /// Alias if given, else the schema field name. Unique among siblings.
    pub response_key: ByteString,
    pub name: ByteString,
    pub field_type: FieldType,
    pub arguments: Vec<Argument>,
    /// `None` for scalar and enum leaves.
    pub selection: Option<CanonicalSelection>,
    pub include_skip: IncludeSkip,
    pub deferral: Option<Deferral>,
    pub origins: BTreeSet<Origin>,
    /// Handles of the fragments this field belongs to.
    pub accessors: BTreeSet<FragmentHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalFragment {
    /// `None` for inline fragments.
    pub name: Option<String>,
    pub type_condition: String,
    pub handles: BTreeSet<FragmentHandle>,
    pub selection: CanonicalSelection,
    pub include_skip: IncludeSkip,
    pub deferral: Option<Deferral>,
}

impl CanonicalFragment {
    /// Whether any object valid at a position typed `level_ty` necessarily
    /// satisfies this fragment's type condition. Such fragments are not
    /// polymorphic variants: their fields are hoisted into the enclosing
    /// field list at compile time unless deferred or conditional.
    pub fn applies_unconditionally(&self, schema: &Schema, level_ty: &str) -> bool {
        self.type_condition == level_ty || schema.is_subtype(&self.type_condition, level_ty)
    }

    pub(crate) fn hoistable(&self, schema: &Schema, level_ty: &str) -> bool {
        self.deferral.is_none()
            && self.include_skip == IncludeSkip::default()
            && self.applies_unconditionally(schema, level_ty)
    }
}

/// One level of the canonical tree: merged fields in first-occurrence order
/// plus the fragments applying at this level.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CanonicalSelection {
    pub ty: String,
    pub fields: Vec<CanonicalField>,
    pub fragments: Vec<CanonicalFragment>,
    index: HashMap<ByteString, usize>,
}

impl CanonicalSelection {
    pub(crate) fn new(
        ty: String,
        fields: Vec<CanonicalField>,
        fragments: Vec<CanonicalFragment>,
    ) -> Self {
        Self {
            ty,
            fields,
            fragments,
            index: HashMap::new(),
        }
    }

    /// Position lookup by response key, built once at freeze time.
    pub fn field(&self, response_key: &str) -> Option<&CanonicalField> {
        self.index
            .get(response_key)
            .and_then(|position| self.fields.get(*position))
    }

    fn freeze(&mut self, accessors: &mut HashMap<FragmentHandle, Path>, path: &mut Path) {
        self.index = self
            .fields
            .iter()
            .enumerate()
            .map(|(position, field)| (field.response_key.clone(), position))
            .collect();
        for field in &mut self.fields {
            if let Some(selection) = &mut field.selection {
                path.push(PathElement::Key(field.response_key.as_str().to_owned()));
                selection.freeze(accessors, path);
                path.pop();
            }
        }
        for fragment in &mut self.fragments {
            for handle in &fragment.handles {
                accessors.insert(*handle, path.clone());
            }
            fragment.selection.freeze(accessors, path);
        }
    }
}

/// How the codec treats an object whose concrete type matches none of the
/// available fragment variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolymorphicFallback {
    /// Decode the level's own merged fields and ignore all variants.
    BaseSelection,
    /// Fail the object with an unhandled type condition error.
    Deny,
}

/// Per-tree compilation choices. There is deliberately no default: every
/// caller states what an unmatched concrete type means for its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    pub fallback: PolymorphicFallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    #[default]
    Query,
    Mutation,
    Subscription,
}

impl From<ast::OperationType> for OperationKind {
    fn from(operation_type: ast::OperationType) -> Self {
        match operation_type {
            ast::OperationType::Query => OperationKind::Query,
            ast::OperationType::Mutation => OperationKind::Mutation,
            ast::OperationType::Subscription => OperationKind::Subscription,
        }
    }
}

/// A declared operation variable.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableSpec {
    pub name: String,
    pub ty: FieldType,
    pub default: Option<Value>,
}

/// The merged, immutable tree for one operation. Built once, then shared by
/// any number of concurrent decode and encode calls.
#[derive(Debug, Clone)]
pub struct CompiledOperation {
    name: Option<String>,
    kind: OperationKind,
    root: CanonicalSelection,
    variables: Vec<VariableSpec>,
    fallback: PolymorphicFallback,
    accessors: HashMap<FragmentHandle, FragmentAccessor>,
}

impl CompiledOperation {
    /// Compile one operation of `document` into its canonical tree.
    ///
    /// Merge conflicts, duplicate defer labels and schema mismatches are all
    /// fatal here; no partial tree is ever produced.
    #[tracing::instrument(level = "debug", skip_all, fields(operation = ?operation_name))]
    pub fn compile(
        schema: &Schema,
        document: &Valid<ExecutableDocument>,
        operation_name: Option<&str>,
        options: CompileOptions,
    ) -> Result<Self, CompileError> {
        let operation = document.operations.get(operation_name).map_err(|_| {
            CompileError::UnknownOperation(operation_name.unwrap_or_default().to_owned())
        })?;
        let fragments = Fragments::from_executable(document, schema)?;
        let root_type = operation.selection_set.ty.as_str().to_owned();

        let mut path = Path::empty();
        let selections = operation
            .selection_set
            .selections
            .iter()
            .filter_map(|selection| {
                Selection::from_executable(selection, &root_type, schema, 0, &mut path, &fragments)
                    .transpose()
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut compiler = Compiler {
            schema,
            fragments: &fragments,
            labels: HashSet::new(),
            next_handle: 0,
            fragment_meta: HashMap::new(),
            path: Path::empty(),
        };
        let mut root = compiler.collect(&selections, &root_type, &Origin::Operation)?;

        let variables = operation
            .variables
            .iter()
            .map(|variable| VariableSpec {
                name: variable.name.as_str().to_owned(),
                ty: FieldType::from(&*variable.ty),
                default: variable
                    .default_value
                    .as_ref()
                    .map(|value| crate::selection::parse_literal(value)),
            })
            .collect();

        let mut paths = HashMap::new();
        root.freeze(&mut paths, &mut Path::empty());
        let accessors = compiler
            .fragment_meta
            .into_iter()
            .filter_map(|(handle, (name, type_condition))| {
                let path = paths.get(&handle)?.clone();
                Some((
                    handle,
                    FragmentAccessor {
                        name,
                        type_condition,
                        path,
                    },
                ))
            })
            .collect();

        Ok(Self {
            name: operation.name.as_ref().map(|name| name.as_str().to_owned()),
            kind: OperationKind::from(operation.operation_type),
            root,
            variables,
            fallback: options.fallback,
            accessors,
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn root(&self) -> &CanonicalSelection {
        &self.root
    }

    pub fn variables(&self) -> &[VariableSpec] {
        &self.variables
    }

    pub(crate) fn fallback(&self) -> PolymorphicFallback {
        self.fallback
    }

    pub fn accessor(&self, handle: FragmentHandle) -> Option<&FragmentAccessor> {
        self.accessors.get(&handle)
    }

    pub fn accessors(&self) -> impl Iterator<Item = (FragmentHandle, &FragmentAccessor)> {
        self.accessors.iter().map(|(handle, accessor)| (*handle, accessor))
    }
}

struct Compiler<'a> {
    schema: &'a Schema,
    fragments: &'a Fragments,
    labels: HashSet<String>,
    next_handle: u32,
    fragment_meta: HashMap<FragmentHandle, (Option<String>, String)>,
    path: Path,
}

impl Compiler<'_> {
    /// Fold one level of parsed selections into merged canonical form. The
    /// final fragment pass re-pushes the level's complete field list so every
    /// fragment ends up self-sufficient.
    fn collect(
        &mut self,
        selections: &[Selection],
        ty: &str,
        origin: &Origin,
    ) -> Result<CanonicalSelection, CompileError> {
        let mut fields: Vec<CanonicalField> = Vec::new();
        let mut fragments: Vec<CanonicalFragment> = Vec::new();

        for selection in selections {
            match selection {
                Selection::Field { .. } => {
                    let field = self.field(selection, ty, origin)?;
                    fields = merge_fields(fields, vec![field], &self.path)?;
                }
                Selection::InlineFragment {
                    type_condition,
                    selection_set,
                    include_skip,
                    deferral,
                    ..
                } => {
                    self.register_deferral(deferral)?;
                    let inner =
                        self.collect(selection_set, type_condition, &Origin::InlineFragment(type_condition.clone()))?;
                    let fragment = CanonicalFragment {
                        name: None,
                        type_condition: type_condition.clone(),
                        handles: BTreeSet::from([self.handle(None, type_condition)]),
                        selection: inner,
                        include_skip: include_skip.clone(),
                        deferral: deferral.clone(),
                    };
                    fragments = merge_fragments(fragments, &fields, vec![fragment], &self.path)?;
                }
                Selection::FragmentSpread {
                    name,
                    include_skip,
                    deferral,
                    ..
                } => {
                    let definitions = self.fragments;
                    let Fragment {
                        type_condition,
                        selection_set,
                    } = definitions
                        .get(name)
                        .ok_or_else(|| CompileError::UnknownFragment(name.clone()))?;
                    // The spread may have been parsed before its definition,
                    // so the captured type condition is filled in here.
                    let deferral = deferral.clone().map(|deferral| Deferral {
                        type_condition: deferral
                            .type_condition
                            .or_else(|| Some(type_condition.clone())),
                        ..deferral
                    });
                    self.register_deferral(&deferral)?;
                    let handle = self.handle(Some(name.clone()), type_condition);
                    let mut inner = self.collect(
                        selection_set,
                        type_condition,
                        &Origin::Fragment(name.clone()),
                    )?;
                    for field in &mut inner.fields {
                        field.accessors.insert(handle);
                    }
                    let fragment = CanonicalFragment {
                        name: Some(name.clone()),
                        type_condition: type_condition.clone(),
                        handles: BTreeSet::from([handle]),
                        selection: inner,
                        include_skip: include_skip.clone(),
                        deferral,
                    };
                    fragments = merge_fragments(fragments, &fields, vec![fragment], &self.path)?;
                }
            }
        }

        // Fragments that necessarily apply contribute their fields to the
        // level's own list; the re-push afterwards keeps every fragment a
        // superset of the grown parent list.
        for fragment in &fragments {
            if fragment.hoistable(self.schema, ty) {
                fields = merge_fields(fields, fragment.selection.fields.clone(), &self.path)?;
            }
        }
        let fragments = merge_fragments(fragments, &fields, Vec::new(), &self.path)?;
        Ok(CanonicalSelection::new(ty.to_owned(), fields, fragments))
    }

    fn field(
        &mut self,
        selection: &Selection,
        parent_type: &str,
        origin: &Origin,
    ) -> Result<CanonicalField, CompileError> {
        let Selection::Field {
            name,
            alias,
            arguments,
            selection_set,
            field_type,
            include_skip,
            deferral,
        } = selection
        else {
            unreachable!("field() is only called on field selections");
        };
        self.register_deferral(deferral)?;
        let response_key = alias.clone().unwrap_or_else(|| name.clone());

        let selection = match selection_set {
            None => None,
            Some(children) => {
                let inner_type = field_type.inner_type_name().unwrap_or(parent_type);
                self.path
                    .push(PathElement::Key(response_key.as_str().to_owned()));
                let collected = self.collect(children, inner_type, origin);
                self.path.pop();
                Some(collected?)
            }
        };

        let mut arguments = arguments.clone();
        arguments.sort_by(|a, b| a.name.as_str().cmp(b.name.as_str()));

        Ok(CanonicalField {
            response_key,
            name: name.clone(),
            field_type: field_type.clone(),
            arguments,
            selection,
            include_skip: include_skip.clone(),
            deferral: deferral.clone(),
            origins: BTreeSet::from([origin.clone()]),
            accessors: BTreeSet::new(),
        })
    }

    fn handle(&mut self, name: Option<String>, type_condition: &str) -> FragmentHandle {
        let handle = FragmentHandle(self.next_handle);
        self.next_handle += 1;
        self.fragment_meta
            .insert(handle, (name, type_condition.to_owned()));
        handle
    }

    /// Labels are registered per occurrence as deferrals enter the tree, so a
    /// labeled deferral reached twice within one operation is rejected.
    fn register_deferral(&mut self, deferral: &Option<Deferral>) -> Result<(), CompileError> {
        if let Some(Deferral {
            label: Some(label), ..
        }) = deferral
            && !self.labels.insert(label.clone())
        {
            return Err(CompileError::DuplicateDeferLabel {
                label: label.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use apollo_compiler::ExecutableDocument;
    use test_log::test;

    use super::*;
    use crate::selection::ArgumentValue;

    const SCHEMA: &str = r#"
        directive @defer(label: String, if: Boolean! = true) on FRAGMENT_SPREAD | INLINE_FRAGMENT | FIELD

        interface Character {
            id: ID!
            name: String!
        }

        type Human implements Character {
            id: ID!
            name: String!
            height: Float
        }

        type Droid implements Character {
            id: ID!
            name: String!
            primaryFunction: String
        }

        type Computer {
            id: ID!
            cpu: String
            name: String
        }

        type Query {
            computers(first: Int): [Computer!]!
            hero: Character
        }
    "#;

    fn compile(query: &str) -> Result<CompiledOperation, CompileError> {
        let schema = Schema::parse(SCHEMA).expect("schema parses");
        let document =
            ExecutableDocument::parse_and_validate(schema.definitions(), query, "query.graphql")
                .expect("query parses and validates");
        CompiledOperation::compile(&schema, &document, None, CompileOptions {
            fallback: PolymorphicFallback::BaseSelection,
        })
    }

    fn response_keys(selection: &CanonicalSelection) -> Vec<&str> {
        selection
            .fields
            .iter()
            .map(|field| field.response_key.as_str())
            .collect()
    }

    #[test]
    fn sibling_fragments_merge_in_first_occurrence_order() {
        let operation = compile(
            "{ computers { ...Ids ...Cpus } }
            fragment Ids on Computer { id }
            fragment Cpus on Computer { id cpu }",
        )
        .expect("operation compiles");

        let computers = operation.root().field("computers").expect("field exists");
        let selection = computers.selection.as_ref().expect("has a sub-selection");
        assert_eq!(response_keys(selection), vec!["id", "cpu"]);

        let id = selection.field("id").expect("id merged");
        assert_eq!(
            id.origins,
            BTreeSet::from([
                Origin::Fragment("Ids".to_owned()),
                Origin::Fragment("Cpus".to_owned()),
            ])
        );
        let cpu = selection.field("cpu").expect("cpu merged");
        assert_eq!(cpu.origins, BTreeSet::from([Origin::Fragment("Cpus".to_owned())]));
    }

    #[test]
    fn fragments_stay_supersets_of_their_parent_selection() {
        let operation = compile(
            "{ computers { id ...Cpus name } }
            fragment Cpus on Computer { cpu }",
        )
        .expect("operation compiles");

        let selection = operation
            .root()
            .field("computers")
            .and_then(|field| field.selection.as_ref())
            .expect("computers has a sub-selection");
        assert_eq!(response_keys(selection), vec!["id", "name", "cpu"]);

        // The parent gained `name` after the spread, and the re-push still
        // carried it into the fragment.
        let fragment = &selection.fragments[0];
        let keys = response_keys(&fragment.selection);
        for parent_key in response_keys(selection) {
            assert!(keys.contains(&parent_key), "fragment is missing {parent_key}");
        }
    }

    /// Parses without document validation, so the merge engine itself is
    /// what rejects the conflicting selections.
    fn compile_unvalidated(query: &str) -> Result<CompiledOperation, CompileError> {
        let schema = Schema::parse(SCHEMA).expect("schema parses");
        let document = ExecutableDocument::parse(schema.definitions(), query, "query.graphql")
            .expect("query parses");
        let document = Valid::assume_valid(document);
        CompiledOperation::compile(&schema, &document, None, CompileOptions {
            fallback: PolymorphicFallback::BaseSelection,
        })
    }

    #[test]
    fn same_key_different_schema_fields_conflict() {
        let error = compile_unvalidated("{ computers { field: id } computers { field: cpu } }")
            .expect_err("merge must conflict");
        assert!(
            matches!(&error, CompileError::FieldMergeConflict { key, .. } if key == "field"),
            "unexpected error: {error:?}",
        );
    }

    #[test]
    fn same_field_different_arguments_conflict() {
        let error =
            compile_unvalidated("{ computers(first: 1) { id } computers(first: 2) { id } }")
                .expect_err("merge must conflict");
        assert!(
            matches!(&error, CompileError::FieldMergeConflict { key, reason, .. }
                if key == "computers" && reason.contains("argument")),
            "unexpected error: {error:?}",
        );
    }

    #[test]
    fn duplicate_defer_labels_fail_compilation() {
        let error = compile(
            r#"{
                hero {
                    ... on Human @defer(label: "a") { height }
                    ... on Droid @defer(label: "a") { primaryFunction }
                }
            }"#,
        )
        .expect_err("labels must be unique");
        assert_eq!(
            error,
            CompileError::DuplicateDeferLabel {
                label: "a".to_owned(),
            }
        );
    }

    #[test]
    fn unknown_operation_name_is_reported() {
        let schema = Schema::parse(SCHEMA).expect("schema parses");
        let document = ExecutableDocument::parse_and_validate(
            schema.definitions(),
            "query Named { hero { id name } }",
            "query.graphql",
        )
        .expect("query parses and validates");
        let error = CompiledOperation::compile(&schema, &document, Some("Other"), CompileOptions {
            fallback: PolymorphicFallback::Deny,
        })
        .expect_err("operation does not exist");
        assert_eq!(error, CompileError::UnknownOperation("Other".to_owned()));
    }

    #[test]
    fn arguments_keep_literals_and_variable_references() {
        let operation = compile("query Q($n: Int) { computers(first: $n) { id } }")
            .expect("operation compiles");
        let computers = operation.root().field("computers").expect("field exists");
        assert_eq!(computers.arguments.len(), 1);
        assert_eq!(computers.arguments[0].name.as_str(), "first");
        assert_eq!(
            computers.arguments[0].value,
            ArgumentValue::Variable("n".to_owned())
        );
        assert_eq!(operation.variables().len(), 1);
        assert_eq!(operation.variables()[0].name, "n");
    }

    #[test]
    fn accessors_resolve_fragment_positions() {
        let operation = compile(
            "{ computers { ...Cpus } }
            fragment Cpus on Computer { cpu }",
        )
        .expect("operation compiles");

        let accessors: Vec<_> = operation.accessors().collect();
        assert_eq!(accessors.len(), 1);
        let (handle, accessor) = accessors[0];
        assert_eq!(accessor.name.as_deref(), Some("Cpus"));
        assert_eq!(accessor.type_condition, "Computer");
        assert_eq!(accessor.path, Path::from("/computers"));
        assert_eq!(operation.accessor(handle), Some(accessor));

        let fragment = operation
            .root()
            .field("computers")
            .and_then(|field| field.selection.as_ref())
            .map(|selection| &selection.fragments[0])
            .expect("fragment survives merge");
        assert!(fragment.handles.contains(&handle));
        let cpu = fragment.selection.field("cpu").expect("cpu resolved");
        assert!(cpu.accessors.contains(&handle));
    }

    #[test]
    fn unselectable_fields_fail_with_the_field_path() {
        let error = compile_unvalidated("{ computers { id wattage } }")
            .expect_err("field does not exist");
        assert_eq!(error, CompileError::SchemaMismatch {
            parent: "Computer".to_owned(),
            field: "wattage".to_owned(),
            path: Path::from("/computers/wattage"),
        });
    }
}
