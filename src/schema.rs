//! Schema type graph, as supplied by the schema-loading collaborator.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use apollo_compiler::schema::ExtendedType;
use apollo_compiler::schema::FieldLookupError;
use apollo_compiler::validation::Valid;

use crate::error::CompileError;
use crate::field_type::FieldType;

const BUILTIN_SCALARS: [&str; 5] = ["Int", "Float", "String", "Boolean", "ID"];

/// A validated schema plus the lookup tables the compiler and codec need:
/// custom scalar names, enum value sets, and type-relationship queries.
#[derive(Debug, Clone)]
pub struct Schema {
    definitions: Arc<Valid<apollo_compiler::Schema>>,
    custom_scalars: HashSet<String>,
    enums: HashMap<String, HashSet<String>>,
}

impl Schema {
    pub fn new(definitions: Valid<apollo_compiler::Schema>) -> Self {
        let mut custom_scalars = HashSet::new();
        let mut enums = HashMap::new();
        for (name, ty) in definitions.types.iter() {
            match ty {
                ExtendedType::Scalar(_) => {
                    if !BUILTIN_SCALARS.contains(&name.as_str()) {
                        custom_scalars.insert(name.as_str().to_owned());
                    }
                }
                ExtendedType::Enum(enum_ty) => {
                    enums.insert(
                        name.as_str().to_owned(),
                        enum_ty
                            .values
                            .keys()
                            .map(|value| value.as_str().to_owned())
                            .collect(),
                    );
                }
                _ => {}
            }
        }
        Self {
            definitions: Arc::new(definitions),
            custom_scalars,
            enums,
        }
    }

    /// Parse and validate an SDL string. Convenience for tests and small
    /// tools; production collaborators usually hand over an already
    /// validated schema through [`Schema::new`].
    pub fn parse(sdl: &str) -> Result<Self, CompileError> {
        let definitions = apollo_compiler::Schema::parse_and_validate(sdl, "schema.graphql")
            .map_err(|invalid| CompileError::InvalidSchema(invalid.errors.to_string()))?;
        Ok(Self::new(definitions))
    }

    pub fn definitions(&self) -> &Valid<apollo_compiler::Schema> {
        &self.definitions
    }

    /// Resolve a field selected on `parent_type`, returning its schema name
    /// and resolved type reference.
    pub(crate) fn field_type(
        &self,
        parent_type: &str,
        field_name: &str,
    ) -> Result<FieldType, FieldLookupError<'_>> {
        self.definitions
            .type_field(parent_type, field_name)
            .map(|definition| FieldType::from(&definition.ty))
    }

    pub(crate) fn is_subtype(&self, abstract_type: &str, maybe_subtype: &str) -> bool {
        self.definitions.is_subtype(abstract_type, maybe_subtype)
    }

    pub(crate) fn is_interface(&self, abstract_type: &str) -> bool {
        self.definitions.get_interface(abstract_type).is_some()
    }

    fn is_implementation(&self, interface: &str, implementor: &str) -> bool {
        self.definitions
            .get_object(implementor)
            .map(|object| object.implements_interfaces.contains(interface))
            .unwrap_or(false)
    }

    /// An object type is a usable discriminator on its own; interfaces and
    /// unions need a `__typename` value from the payload.
    pub(crate) fn is_concrete_object(&self, type_name: &str) -> bool {
        self.definitions.get_object(type_name).is_some()
    }

    pub(crate) fn is_custom_scalar(&self, type_name: &str) -> bool {
        self.custom_scalars.contains(type_name)
    }

    pub(crate) fn is_enum(&self, type_name: &str) -> bool {
        self.enums.contains_key(type_name)
    }

    pub(crate) fn enum_contains(&self, type_name: &str, value: &str) -> bool {
        self.enums
            .get(type_name)
            .map(|values| values.contains(value))
            .unwrap_or(false)
    }

    // given two types, returns the one that implements the other, if applicable
    pub(crate) fn most_precise<'f>(&self, a: &'f str, b: &'f str) -> Option<&'f str> {
        if a == b {
            return Some(a);
        }
        if self.is_subtype(a, b) || self.is_implementation(a, b) {
            Some(b)
        } else if self.is_subtype(b, a) || self.is_implementation(b, a) {
            Some(a)
        } else {
            // No relationship between a and b
            None
        }
    }
}
