//! Selection model: typed fields, fragment spreads and inline fragments as
//! parsed from the document, before any merging.

use apollo_compiler::executable;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Value;

use crate::TYPENAME;
use crate::error::CompileError;
use crate::field_type::FieldType;
use crate::fragments::Fragments;
use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::json_ext::PathElement;
use crate::schema::Schema;

pub(crate) const DEFER_DIRECTIVE_NAME: &str = "defer";
pub(crate) const DEFER_LABEL_ARGUMENT: &str = "label";
pub(crate) const DEFER_IF_ARGUMENT: &str = "if";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Selection {
    Field {
        name: ByteString,
        alias: Option<ByteString>,
        arguments: Vec<Argument>,
        selection_set: Option<Vec<Selection>>,
        field_type: FieldType,
        include_skip: IncludeSkip,
        deferral: Option<Deferral>,
    },
    InlineFragment {
        // Optional in the language but filled with the current type if not specified
        type_condition: String,
        include_skip: IncludeSkip,
        deferral: Option<Deferral>,
        known_type: Option<String>,
        selection_set: Vec<Selection>,
    },
    FragmentSpread {
        name: String,
        known_type: Option<String>,
        include_skip: IncludeSkip,
        deferral: Option<Deferral>,
    },
}

/// A deferred delivery marker, as captured from a `@defer` directive. The
/// `if` condition stays a static annotation until decode time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Deferral {
    pub label: Option<String>,
    pub type_condition: Option<String>,
    pub condition: Condition,
}

/// An argument attached to a field, either a literal value or a reference to
/// an operation variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Argument {
    pub name: ByteString,
    pub value: ArgumentValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgumentValue {
    Literal(Value),
    Variable(String),
}

impl Selection {
    pub(crate) fn from_executable(
        selection: &executable::Selection,
        current_type: &str,
        schema: &Schema,
        mut count: usize,
        path: &mut Path,
        fragments: &Fragments,
    ) -> Result<Option<Self>, CompileError> {
        // The RECURSION_LIMIT is chosen to be:
        //   < # expected to cause stack overflow &&
        //   > # expected in a legitimate query
        const RECURSION_LIMIT: usize = 512;
        if count > RECURSION_LIMIT {
            tracing::error!("selection processing recursion limit({RECURSION_LIMIT}) exceeded");
            return Err(CompileError::RecursionLimitExceeded);
        }
        count += 1;
        Ok(match selection {
            // Spec: https://spec.graphql.org/draft/#Field
            executable::Selection::Field(field) => {
                let include_skip = IncludeSkip::parse(&field.directives);
                if include_skip.statically_skipped() {
                    return Ok(None);
                }
                let deferral = parse_defer(&field.directives, None);
                let name = field.name.as_str();
                let field_type = if name == TYPENAME {
                    FieldType::String
                } else {
                    schema.field_type(current_type, name).map_err(|_| {
                        CompileError::SchemaMismatch {
                            parent: current_type.to_owned(),
                            field: name.to_owned(),
                            path: path.join(PathElement::Key(
                                field.response_key().as_str().to_owned(),
                            )),
                        }
                    })?
                };

                let alias = field.alias.as_ref().map(|x| x.as_str().into());
                let arguments = field
                    .arguments
                    .iter()
                    .map(|argument| Argument {
                        name: argument.name.as_str().into(),
                        value: parse_value(&argument.value),
                    })
                    .collect();

                let selection_set = if field.selection_set.selections.is_empty() {
                    None
                } else {
                    path.push(PathElement::Key(field.response_key().as_str().to_owned()));
                    let inner_type = field_type.inner_type_name().unwrap_or(current_type);
                    let selections = field
                        .selection_set
                        .selections
                        .iter()
                        .filter_map(|selection| {
                            Selection::from_executable(
                                selection, inner_type, schema, count, path, fragments,
                            )
                            .transpose()
                        })
                        .collect::<Result<_, _>>();
                    path.pop();
                    Some(selections?)
                };

                Some(Self::Field {
                    alias,
                    name: name.into(),
                    arguments,
                    selection_set,
                    field_type,
                    include_skip,
                    deferral,
                })
            }
            // Spec: https://spec.graphql.org/draft/#InlineFragment
            executable::Selection::InlineFragment(inline_fragment) => {
                let include_skip = IncludeSkip::parse(&inline_fragment.directives);
                if include_skip.statically_skipped() {
                    return Ok(None);
                }

                let type_condition = inline_fragment
                    .type_condition
                    .as_ref()
                    .map(|s| s.as_str())
                    .unwrap_or(current_type)
                    .to_owned();
                let deferral =
                    parse_defer(&inline_fragment.directives, Some(type_condition.clone()));

                let fragment_type = &type_condition;

                // If the type condition is an interface and the current type
                // implements it, the current type is the more precise one to
                // resolve nested selections against.
                let relevant_type = if schema.is_interface(type_condition.as_str()) {
                    let relevant_type = schema.most_precise(current_type, fragment_type);
                    relevant_type.unwrap_or(fragment_type)
                } else {
                    fragment_type
                };

                let selection_set: Vec<Selection> = inline_fragment
                    .selection_set
                    .selections
                    .iter()
                    .filter_map(|selection| {
                        Selection::from_executable(
                            selection,
                            relevant_type,
                            schema,
                            count,
                            path,
                            fragments,
                        )
                        .transpose()
                    })
                    .collect::<Result<_, _>>()?;

                let known_type = Some(inline_fragment.selection_set.ty.as_str().to_owned());

                // Can be empty with a statically skipped selection set
                if selection_set.is_empty() {
                    return Ok(None);
                }

                Some(Self::InlineFragment {
                    type_condition,
                    selection_set,
                    include_skip,
                    deferral,
                    known_type,
                })
            }
            // Spec: https://spec.graphql.org/draft/#FragmentSpread
            executable::Selection::FragmentSpread(fragment_spread) => {
                let include_skip = IncludeSkip::parse(&fragment_spread.directives);
                if include_skip.statically_skipped() {
                    return Ok(None);
                }
                let name = fragment_spread.fragment_name.as_str().to_owned();
                let deferral = parse_defer(
                    &fragment_spread.directives,
                    fragments.get(&name).map(|f| f.type_condition.clone()),
                );
                // Can be empty with a statically skipped selection set
                if fragments
                    .get(&name)
                    .map(|f| f.selection_set.is_empty())
                    .unwrap_or_default()
                {
                    return Ok(None);
                }

                Some(Self::FragmentSpread {
                    name,
                    known_type: Some(current_type.to_owned()),
                    include_skip,
                    deferral,
                })
            }
        })
    }

}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IncludeSkip {
    include: Condition,
    skip: Condition,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Condition {
    Yes,
    No,
    Variable(String),
}

/// Capture a `@defer` directive. A statically disabled deferral
/// (`if: false` literal) never produces a marker.
fn parse_defer(
    directives: &executable::DirectiveList,
    type_condition: Option<String>,
) -> Option<Deferral> {
    let directive = directives.get(DEFER_DIRECTIVE_NAME)?;
    let condition = directive
        .specified_argument_by_name(DEFER_IF_ARGUMENT)
        .and_then(|value| Condition::parse_argument(value))
        .unwrap_or(Condition::Yes);
    if condition == Condition::No {
        return None;
    }
    let label = directive
        .specified_argument_by_name(DEFER_LABEL_ARGUMENT)
        .and_then(|value| value.as_str())
        .map(|label| label.to_owned());
    Some(Deferral {
        label,
        type_condition,
        condition,
    })
}

impl IncludeSkip {
    pub(crate) fn parse(directives: &executable::DirectiveList) -> Self {
        let include = directives
            .get("include")
            .and_then(|directive| {
                directive
                    .specified_argument_by_name("if")
                    .and_then(|value| Condition::parse_argument(value))
            })
            .unwrap_or(Condition::Yes);
        let skip = directives
            .get("skip")
            .and_then(|directive| {
                directive
                    .specified_argument_by_name("if")
                    .and_then(|value| Condition::parse_argument(value))
            })
            .unwrap_or(Condition::No);
        Self { include, skip }
    }

    pub(crate) fn statically_skipped(&self) -> bool {
        matches!(self.skip, Condition::Yes) || matches!(self.include, Condition::No)
    }

    pub(crate) fn should_skip(&self, variables: &Object) -> bool {
        // Using .unwrap_or is legit here because variable preflight has
        // already checked that conditions can resolve.
        self.skip.eval(variables).unwrap_or(false) || !self.include.eval(variables).unwrap_or(true)
    }
}

impl Default for IncludeSkip {
    fn default() -> Self {
        Self {
            include: Condition::Yes,
            skip: Condition::No,
        }
    }
}

impl Condition {
    pub(crate) fn parse_argument(value: &executable::Value) -> Option<Self> {
        match value {
            executable::Value::Boolean(true) => Some(Condition::Yes),
            executable::Value::Boolean(false) => Some(Condition::No),
            executable::Value::Variable(variable) => {
                Some(Condition::Variable(variable.as_str().to_owned()))
            }
            _ => None,
        }
    }

    pub(crate) fn eval(&self, variables: &Object) -> Option<bool> {
        match self {
            Condition::Yes => Some(true),
            Condition::No => Some(false),
            Condition::Variable(variable_name) => variables
                .get(variable_name.as_str())
                .and_then(|v| v.as_bool()),
        }
    }
}

impl Deferral {
    /// Whether this deferral is active under the supplied variables. An
    /// unresolvable condition variable counts as active, matching the
    /// directive's `if` default.
    pub(crate) fn is_active(&self, variables: &Object) -> bool {
        self.condition.eval(variables).unwrap_or(true)
    }
}

/// Convert a document value into a payload value, keeping variable
/// references symbolic.
pub(crate) fn parse_value(value: &executable::Value) -> ArgumentValue {
    match value {
        executable::Value::Variable(name) => ArgumentValue::Variable(name.as_str().to_owned()),
        other => ArgumentValue::Literal(parse_literal(other)),
    }
}

pub(crate) fn parse_literal(value: &executable::Value) -> Value {
    match value {
        executable::Value::Null | executable::Value::Variable(_) => Value::Null,
        executable::Value::Enum(name) => name.as_str().to_string().into(),
        executable::Value::String(s) => s.to_string().into(),
        executable::Value::Boolean(b) => Value::Bool(*b),
        executable::Value::Int(i) => {
            let s = i.to_string();
            s.parse::<i64>()
                .ok()
                .map(Into::into)
                .or_else(|| s.parse::<u64>().ok().map(Into::into))
                .unwrap_or(Value::Null)
        }
        executable::Value::Float(f) => f
            .try_to_f64()
            .ok()
            .map(Into::into)
            .unwrap_or(Value::Null),
        executable::Value::List(values) => Value::Array(
            values
                .iter()
                .map(|value| parse_literal(value))
                .collect(),
        ),
        executable::Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(name, value)| (name.as_str().into(), parse_literal(value)))
                .collect(),
        ),
    }
}
