use apollo_compiler::ast;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::Value;

use crate::schema::Schema;

/// Sentinel for a value that does not conform to its expected type. The
/// position and reason are reported separately; this only drives null
/// propagation up to the nearest nullable parent.
#[derive(Debug)]
pub(crate) struct InvalidValue;

// Primitives are taken from scalars: https://spec.graphql.org/draft/#sec-Scalars
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    /// Named type {0}
    Named(String),
    /// List type {0}
    List(Box<FieldType>),
    /// Non null type {0}
    NonNull(Box<FieldType>),
    /// String
    String,
    /// Int
    Int,
    /// Float
    Float,
    /// Id
    Id,
    /// Boolean
    Boolean,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::Named(ty) => write!(f, "{ty}"),
            FieldType::List(ty) => write!(f, "[{ty}]"),
            FieldType::NonNull(ty) => write!(f, "{ty}!"),
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Id => write!(f, "ID"),
            FieldType::Boolean => write!(f, "Boolean"),
        }
    }
}

impl FieldType {
    // This function validates input values according to the graphql specification.
    // Each of the values are validated against the "input coercion" rules.
    pub(crate) fn validate_input_value(
        &self,
        value: &Value,
        schema: &Schema,
    ) -> Result<(), InvalidValue> {
        match (self, value) {
            (FieldType::String, Value::String(_)) => Ok(()),
            // Spec: https://spec.graphql.org/June2018/#sec-Int
            (FieldType::Int, maybe_int) => {
                if maybe_int == &Value::Null || is_valid_int_input(maybe_int) {
                    Ok(())
                } else {
                    Err(InvalidValue)
                }
            }
            // Spec: https://spec.graphql.org/draft/#sec-Float.Input-Coercion
            (FieldType::Float, maybe_float) => {
                if maybe_float == &Value::Null || is_valid_float_input(maybe_float) {
                    Ok(())
                } else {
                    Err(InvalidValue)
                }
            }
            // The ID type is serialized in the same way as a String, but in
            // practice an Int works too.
            (FieldType::Id, Value::String(_)) => Ok(()),
            (FieldType::Id, maybe_int) => {
                if maybe_int == &Value::Null || is_valid_int_input(maybe_int) {
                    Ok(())
                } else {
                    Err(InvalidValue)
                }
            }
            (FieldType::Boolean, Value::Bool(_)) => Ok(()),
            (FieldType::List(inner_ty), Value::Array(vec)) => vec
                .iter()
                .try_for_each(|x| inner_ty.validate_input_value(x, schema)),
            // For coercion from single value to list
            (FieldType::List(inner_ty), val) if val != &Value::Null => {
                inner_ty.validate_input_value(val, schema)
            }
            (FieldType::NonNull(inner_ty), value) => {
                if value.is_null() {
                    Err(InvalidValue)
                } else {
                    inner_ty.validate_input_value(value, schema)
                }
            }
            (FieldType::Named(name), _)
                if schema.is_custom_scalar(name) || schema.is_enum(name) =>
            {
                Ok(())
            }
            // NOTE: graphql's types are all optional by default
            (_, Value::Null) => Ok(()),
            // Input object structure is the schema validator's concern; only
            // require that the value is an object at all.
            (FieldType::Named(_), value) => {
                if value.is_object() {
                    Ok(())
                } else {
                    Err(InvalidValue)
                }
            }
            _ => Err(InvalidValue),
        }
    }

    /// return the name of the type on which selections happen
    ///
    /// Example if we get the field `list: [User!]!`, it will return "User"
    pub(crate) fn inner_type_name(&self) -> Option<&str> {
        match self {
            FieldType::Named(name) => Some(name.as_str()),
            FieldType::List(inner) | FieldType::NonNull(inner) => inner.inner_type_name(),
            FieldType::String
            | FieldType::Int
            | FieldType::Float
            | FieldType::Id
            | FieldType::Boolean => None,
        }
    }

    pub(crate) fn is_non_null(&self) -> bool {
        matches!(self, FieldType::NonNull(_))
    }

    /// Number of list layers wrapping the innermost named type.
    pub fn list_depth(&self) -> usize {
        match self {
            FieldType::List(inner) => 1 + inner.list_depth(),
            FieldType::NonNull(inner) => inner.list_depth(),
            _ => 0,
        }
    }
}

fn is_valid_int_input(value: &Value) -> bool {
    value
        .as_i64()
        .map(|i| i32::try_from(i).is_ok())
        .or_else(|| value.as_u64().map(|i| i32::try_from(i).is_ok()))
        .unwrap_or(false)
}

fn is_valid_float_input(value: &Value) -> bool {
    value.is_i64() || value.is_u64() || value.as_f64().is_some()
}

impl From<&'_ ast::Type> for FieldType {
    fn from(ty: &'_ ast::Type) -> Self {
        match ty {
            ast::Type::Named(name) => named_type(name.as_str()),
            ast::Type::NonNullNamed(name) => Self::NonNull(Box::new(named_type(name.as_str()))),
            ast::Type::List(inner) => Self::List(Box::new(Self::from(&**inner))),
            ast::Type::NonNullList(inner) => {
                Self::NonNull(Box::new(Self::List(Box::new(Self::from(&**inner)))))
            }
        }
    }
}

fn named_type(name: &str) -> FieldType {
    match name {
        "String" => FieldType::String,
        "Int" => FieldType::Int,
        "Float" => FieldType::Float,
        "ID" => FieldType::Id,
        "Boolean" => FieldType::Boolean,
        _ => FieldType::Named(name.to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> ast::Type {
        let doc = apollo_compiler::ast::Document::parse(
            format!("type Query {{ f: {source} }}"),
            "test.graphql",
        )
        .expect("valid type");
        let ast::Definition::ObjectTypeDefinition(def) = &doc.definitions[0] else {
            panic!("expected an object type definition");
        };
        def.fields[0].ty.clone()
    }

    #[test]
    fn converts_wrapped_types() {
        assert_eq!(FieldType::from(&parse("String")), FieldType::String);
        assert_eq!(
            FieldType::from(&parse("[User!]!")),
            FieldType::NonNull(Box::new(FieldType::List(Box::new(FieldType::NonNull(
                Box::new(FieldType::Named("User".to_string()))
            )))))
        );
    }

    #[test]
    fn reports_inner_name_and_depth() {
        let ty = FieldType::from(&parse("[[User]!]"));
        assert_eq!(ty.inner_type_name(), Some("User"));
        assert_eq!(ty.list_depth(), 2);
        assert!(!ty.is_non_null());
        assert!(FieldType::from(&parse("Int!")).is_non_null());
    }
}
