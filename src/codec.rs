//! Response codec: decodes keyed payloads against a canonical tree and
//! re-encodes value trees in canonical key order.
//!
//! Decoding walks the tree, not the input, so output key order always matches
//! first-occurrence order in the merged operation. A failing field invalidates
//! its enclosing object up to the nearest nullable position; the error is
//! accumulated with its full path instead of aborting the whole payload.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json_bytes::Value;

use crate::TYPENAME;
use crate::canonical::CanonicalField;
use crate::canonical::CanonicalSelection;
use crate::canonical::CompiledOperation;
use crate::canonical::PolymorphicFallback;
use crate::error::DecodeError;
use crate::field_type::FieldType;
use crate::field_type::InvalidValue;
use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::json_ext::PathElement;
use crate::schema::Schema;
use crate::selection::IncludeSkip;

type CoercionFn = dyn Fn(&Value) -> Result<Value, String> + Send + Sync;

/// Named custom scalar coercions. Scalars without a registered coercion pass
/// through unchanged.
#[derive(Clone, Default)]
pub struct ScalarRegistry {
    coercions: HashMap<String, Arc<CoercionFn>>,
}

impl ScalarRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, scalar_name: impl Into<String>, coercion: F)
    where
        F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.coercions.insert(scalar_name.into(), Arc::new(coercion));
    }

    fn coerce(&self, scalar_name: &str, value: &Value) -> Result<Value, String> {
        match self.coercions.get(scalar_name) {
            Some(coercion) => coercion(value),
            None => Ok(value.clone()),
        }
    }
}

impl std::fmt::Debug for ScalarRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScalarRegistry")
            .field("scalars", &self.coercions.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Whether a pending deferral sits on a field or on a whole fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeferSite {
    Field,
    Fragment,
}

/// One deferred part discovered while decoding, identified by the runtime
/// path (including list indices) where its data will later be grafted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDefer {
    pub path: Path,
    pub label: Option<String>,
    pub(crate) site: DeferSite,
}

/// The outcome of decoding one payload: the decoded tree, the errors met on
/// the way, and the deferred parts that were skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub data: Value,
    pub errors: Vec<DecodeError>,
    pub pending: Vec<PendingDefer>,
}

impl CompiledOperation {
    /// Decode one keyed payload against this operation's canonical tree.
    ///
    /// Returns `Err` only for variable preflight failures; everything else is
    /// reported through [`Decoded::errors`].
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn decode(
        &self,
        schema: &Schema,
        data: &Object,
        variables: &Object,
        scalars: &ScalarRegistry,
    ) -> Result<Decoded, DecodeError> {
        let variables = self.prepare_variables(schema, variables)?;
        let mut decoder = Decoder::new(schema, self.fallback(), &variables, scalars, Path::empty());
        let mut output = Object::default();
        let data = match decoder.decode_selection(self.root(), data, &mut output) {
            Ok(()) => Value::Object(output),
            Err(InvalidValue) => Value::Null,
        };
        Ok(decoder.finish(data))
    }

    /// Re-serialize a decoded value tree, emitting keys in canonical order
    /// regardless of how the input object was populated. Keys absent from the
    /// input (deferred parts not yet delivered) are omitted without error.
    pub fn encode(
        &self,
        schema: &Schema,
        value: &Object,
        variables: &Object,
    ) -> Result<Value, DecodeError> {
        let variables = self.prepare_variables(schema, variables)?;
        let encoder = Encoder {
            schema,
            variables: &variables,
        };
        let mut output = Object::default();
        encoder.encode_selection(self.root(), value, &mut output);
        Ok(Value::Object(output))
    }

    /// Check supplied variables against the operation's declarations and fill
    /// in declared defaults, before any decode or encode begins.
    pub(crate) fn prepare_variables(
        &self,
        schema: &Schema,
        supplied: &Object,
    ) -> Result<Object, DecodeError> {
        let mut resolved = supplied.clone();
        for spec in self.variables() {
            match supplied.get(spec.name.as_str()) {
                Some(value) => {
                    spec.ty
                        .validate_input_value(value, schema)
                        .map_err(|_| DecodeError::InvalidVariable {
                            name: spec.name.clone(),
                            ty: spec.ty.to_string(),
                        })?;
                }
                None => match &spec.default {
                    Some(default) => {
                        resolved.insert(spec.name.as_str(), default.clone());
                    }
                    None if spec.ty.is_non_null() => {
                        return Err(DecodeError::MissingVariable {
                            name: spec.name.clone(),
                        });
                    }
                    None => {}
                },
            }
        }
        Ok(resolved)
    }
}

pub(crate) struct Decoder<'a> {
    schema: &'a Schema,
    fallback: PolymorphicFallback,
    variables: &'a Object,
    scalars: &'a ScalarRegistry,
    errors: Vec<DecodeError>,
    pending: Vec<PendingDefer>,
    path: Path,
}

impl<'a> Decoder<'a> {
    pub(crate) fn new(
        schema: &'a Schema,
        fallback: PolymorphicFallback,
        variables: &'a Object,
        scalars: &'a ScalarRegistry,
        path: Path,
    ) -> Self {
        Self {
            schema,
            fallback,
            variables,
            scalars,
            errors: Vec::new(),
            pending: Vec::new(),
            path,
        }
    }

    pub(crate) fn finish(self, data: Value) -> Decoded {
        Decoded {
            data,
            errors: self.errors,
            pending: self.pending,
        }
    }

    /// Decode one tree level. The level's own merged fields (including those
    /// hoisted from unconditional fragments) decode first; remaining
    /// fragments are either deferred, conditionally included, or polymorphic
    /// variants dispatched on the concrete type.
    pub(crate) fn decode_selection(
        &mut self,
        selection: &CanonicalSelection,
        input: &Object,
        output: &mut Object,
    ) -> Result<(), InvalidValue> {
        self.decode_fields(selection, input, output)?;
        if selection.fragments.is_empty() {
            return Ok(());
        }

        let mut variants = Vec::new();
        for fragment in &selection.fragments {
            if !fragment.applies_unconditionally(self.schema, &selection.ty) {
                variants.push(fragment);
                continue;
            }
            if let Some(deferral) = &fragment.deferral {
                if deferral.is_active(self.variables) {
                    self.pending.push(PendingDefer {
                        path: self.path.clone(),
                        label: deferral.label.clone(),
                        site: DeferSite::Fragment,
                    });
                } else if !fragment.include_skip.should_skip(self.variables) {
                    self.decode_selection(&fragment.selection, input, output)?;
                }
            } else if fragment.include_skip != IncludeSkip::default() {
                // Conditionally included, so not hoisted at compile time.
                if !fragment.include_skip.should_skip(self.variables) {
                    self.decode_selection(&fragment.selection, input, output)?;
                }
            }
            // Anything else was hoisted into the field list above.
        }
        if variants.is_empty() {
            return Ok(());
        }

        let type_name = input
            .get(TYPENAME)
            .and_then(|value| value.as_str())
            .map(|name| name.to_owned())
            .or_else(|| {
                self.schema
                    .is_concrete_object(&selection.ty)
                    .then(|| selection.ty.clone())
            });
        let Some(type_name) = type_name else {
            return self.unmatched_variant(selection.ty.clone());
        };

        let mut matched = false;
        for fragment in variants {
            if fragment.type_condition != type_name
                && !self.schema.is_subtype(&fragment.type_condition, &type_name)
            {
                continue;
            }
            // A variant disabled by skip/include still handles its type;
            // it just contributes nothing.
            matched = true;
            if fragment.include_skip.should_skip(self.variables) {
                continue;
            }
            if let Some(deferral) = &fragment.deferral
                && deferral.is_active(self.variables)
            {
                self.pending.push(PendingDefer {
                    path: self.path.clone(),
                    label: deferral.label.clone(),
                    site: DeferSite::Fragment,
                });
                continue;
            }
            self.decode_selection(&fragment.selection, input, output)?;
        }
        if !matched {
            return self.unmatched_variant(type_name);
        }
        Ok(())
    }

    /// No polymorphic variant handles the concrete type; the compiled
    /// fallback decides whether the base fields stand alone or the object
    /// fails.
    fn unmatched_variant(&mut self, type_name: String) -> Result<(), InvalidValue> {
        match self.fallback {
            PolymorphicFallback::BaseSelection => Ok(()),
            PolymorphicFallback::Deny => {
                self.errors.push(DecodeError::UnhandledTypeCondition {
                    type_name,
                    path: self.path.clone(),
                });
                Err(InvalidValue)
            }
        }
    }

    fn decode_fields(
        &mut self,
        selection: &CanonicalSelection,
        input: &Object,
        output: &mut Object,
    ) -> Result<(), InvalidValue> {
        for field in &selection.fields {
            if field.include_skip.should_skip(self.variables) {
                continue;
            }
            let key = field.response_key.as_str();
            if let Some(deferral) = &field.deferral
                && deferral.is_active(self.variables)
            {
                self.pending.push(PendingDefer {
                    path: self.path.join(PathElement::Key(key.to_owned())),
                    label: deferral.label.clone(),
                    site: DeferSite::Field,
                });
                continue;
            }
            match input.get(key) {
                None if field.name.as_str() == TYPENAME => {
                    if self.schema.is_concrete_object(&selection.ty) {
                        output.insert(key, Value::String(selection.ty.as_str().into()));
                    } else {
                        output.insert(key, Value::Null);
                    }
                }
                None => {
                    if field.field_type.is_non_null() {
                        self.errors.push(DecodeError::MissingRequiredField {
                            field: key.to_owned(),
                            path: self.path.clone(),
                        });
                        return Err(InvalidValue);
                    }
                    output.insert(key, Value::Null);
                }
                Some(value) => {
                    self.path.push(PathElement::Key(key.to_owned()));
                    let decoded = self.decode_value(&field.field_type, field, value);
                    self.path.pop();
                    match decoded {
                        Ok(value) => {
                            output.insert(key, value);
                        }
                        Err(InvalidValue) => {
                            if field.field_type.is_non_null() {
                                return Err(InvalidValue);
                            }
                            output.insert(key, Value::Null);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn decode_value(
        &mut self,
        ty: &FieldType,
        field: &CanonicalField,
        value: &Value,
    ) -> Result<Value, InvalidValue> {
        match ty {
            FieldType::NonNull(inner) => {
                if value.is_null() {
                    self.errors.push(DecodeError::NonNullViolation {
                        path: self.path.clone(),
                    });
                    Err(InvalidValue)
                } else {
                    self.decode_value(inner, field, value)
                }
            }
            FieldType::List(inner) => match value {
                Value::Null => Ok(Value::Null),
                Value::Array(items) => {
                    let mut decoded = Vec::with_capacity(items.len());
                    for (position, item) in items.iter().enumerate() {
                        self.path.push(PathElement::Index(position));
                        let element = self.decode_value(inner, field, item);
                        self.path.pop();
                        match element {
                            Ok(value) => decoded.push(value),
                            Err(InvalidValue) => {
                                if inner.is_non_null() {
                                    return Err(InvalidValue);
                                }
                                decoded.push(Value::Null);
                            }
                        }
                    }
                    Ok(Value::Array(decoded))
                }
                _ => self.shape_error("a list"),
            },
            _ if value.is_null() => Ok(Value::Null),
            _ => match &field.selection {
                Some(selection) => match value {
                    Value::Object(input) => {
                        let mut output = Object::default();
                        self.decode_selection(selection, input, &mut output)?;
                        Ok(Value::Object(output))
                    }
                    _ => self.shape_error("an object"),
                },
                None => self.decode_leaf(ty, value),
            },
        }
    }

    fn decode_leaf(&mut self, ty: &FieldType, value: &Value) -> Result<Value, InvalidValue> {
        match ty {
            FieldType::String => match value {
                Value::String(_) => Ok(value.clone()),
                _ => self.shape_error("a string"),
            },
            FieldType::Id => match value {
                Value::String(_) => Ok(value.clone()),
                Value::Number(number) if number.is_i64() || number.is_u64() => Ok(value.clone()),
                _ => self.shape_error("an ID"),
            },
            FieldType::Int => match value {
                Value::Number(number) if number.is_i64() || number.is_u64() => Ok(value.clone()),
                _ => self.shape_error("an Int"),
            },
            FieldType::Float => match value {
                Value::Number(_) => Ok(value.clone()),
                _ => self.shape_error("a Float"),
            },
            FieldType::Boolean => match value {
                Value::Bool(_) => Ok(value.clone()),
                _ => self.shape_error("a Boolean"),
            },
            FieldType::Named(name) if self.schema.is_enum(name) => match value {
                Value::String(member) if self.schema.enum_contains(name, member.as_str()) => {
                    Ok(value.clone())
                }
                _ => self.shape_error(&format!("a value of enum '{name}'")),
            },
            FieldType::Named(name) if self.schema.is_custom_scalar(name) => {
                match self.scalars.coerce(name, value) {
                    Ok(coerced) => Ok(coerced),
                    Err(reason) => {
                        self.errors.push(DecodeError::ScalarCoercion {
                            name: name.clone(),
                            path: self.path.clone(),
                            reason,
                        });
                        Err(InvalidValue)
                    }
                }
            }
            // A composite type without a sub-selection does not survive
            // document validation, so anything left passes through.
            _ => Ok(value.clone()),
        }
    }

    fn shape_error(&mut self, expected: &str) -> Result<Value, InvalidValue> {
        self.errors.push(DecodeError::InvalidValueShape {
            expected: expected.to_owned(),
            path: self.path.clone(),
        });
        Err(InvalidValue)
    }
}

/// Canonical-order projection of an already-decoded tree. Keys the input does
/// not have are skipped, which is what lets partially-delivered results with
/// pending deferred parts serialize cleanly.
struct Encoder<'a> {
    schema: &'a Schema,
    variables: &'a Object,
}

impl Encoder<'_> {
    fn encode_selection(&self, selection: &CanonicalSelection, input: &Object, output: &mut Object) {
        self.encode_fields(selection, input, output);
        if selection.fragments.is_empty() {
            return;
        }
        let mut variants = Vec::new();
        for fragment in &selection.fragments {
            if !fragment.applies_unconditionally(self.schema, &selection.ty) {
                variants.push(fragment);
            } else if fragment.deferral.is_some() || fragment.include_skip != IncludeSkip::default()
            {
                // Not hoisted into the field list; emit whatever of it the
                // input actually has.
                self.encode_selection(&fragment.selection, input, output);
            }
        }
        if variants.is_empty() {
            return;
        }
        let type_name = input
            .get(TYPENAME)
            .and_then(|value| value.as_str())
            .map(|name| name.to_owned())
            .or_else(|| {
                self.schema
                    .is_concrete_object(&selection.ty)
                    .then(|| selection.ty.clone())
            });
        let Some(type_name) = type_name else {
            return;
        };
        for fragment in variants {
            if fragment.type_condition == type_name
                || self.schema.is_subtype(&fragment.type_condition, &type_name)
            {
                self.encode_selection(&fragment.selection, input, output);
            }
        }
    }

    fn encode_fields(&self, selection: &CanonicalSelection, input: &Object, output: &mut Object) {
        for field in &selection.fields {
            if field.include_skip.should_skip(self.variables) {
                continue;
            }
            let key = field.response_key.as_str();
            let Some(value) = input.get(key) else {
                continue;
            };
            if output.contains_key(key) {
                continue;
            }
            output.insert(key, self.encode_value(&field.field_type, field, value));
        }
    }

    fn encode_value(&self, ty: &FieldType, field: &CanonicalField, value: &Value) -> Value {
        match ty {
            FieldType::NonNull(inner) => self.encode_value(inner, field, value),
            FieldType::List(inner) => match value {
                Value::Array(items) => Value::Array(
                    items
                        .iter()
                        .map(|item| self.encode_value(inner, field, item))
                        .collect(),
                ),
                other => other.clone(),
            },
            _ => match (&field.selection, value) {
                (Some(selection), Value::Object(input)) => {
                    let mut output = Object::default();
                    self.encode_selection(selection, input, &mut output);
                    Value::Object(output)
                }
                _ => value.clone(),
            },
        }
    }
}
