//! Merge engine: unifies sibling fields and fragments that target the same
//! response key into one canonical list.
//!
//! Inputs are consumed by value and never mutated in place; matched entries
//! from the second list are tracked by taking them out of an option slot so
//! the first-occurrence order of response keys stays bit-exact.

use crate::canonical::CanonicalField;
use crate::canonical::CanonicalFragment;
use crate::canonical::CanonicalSelection;
use crate::error::CompileError;
use crate::json_ext::Path;
use crate::json_ext::PathElement;

/// Merge two sibling field lists. Fields of `a` keep their positions, fields
/// of `b` either merge into their match or append after, in `b`'s order.
pub(crate) fn merge_fields(
    a: Vec<CanonicalField>,
    b: Vec<CanonicalField>,
    path: &Path,
) -> Result<Vec<CanonicalField>, CompileError> {
    if b.is_empty() {
        return Ok(a);
    }
    let mut pool: Vec<Option<CanonicalField>> = b.into_iter().map(Some).collect();
    let mut merged = Vec::with_capacity(a.len() + pool.len());
    for field in a {
        let candidate = pool.iter_mut().find_map(|slot| {
            slot.take_if(|other| other.response_key == field.response_key)
        });
        match candidate {
            Some(other) => merged.push(merge_field(field, other, path)?),
            None => merged.push(field),
        }
    }
    merged.extend(pool.into_iter().flatten());
    Ok(merged)
}

fn merge_field(
    a: CanonicalField,
    b: CanonicalField,
    path: &Path,
) -> Result<CanonicalField, CompileError> {
    let conflict = |reason: &str| CompileError::FieldMergeConflict {
        key: a.response_key.as_str().to_owned(),
        path: path.join(PathElement::Key(a.response_key.as_str().to_owned())),
        reason: reason.to_owned(),
    };
    if a.name != b.name {
        return Err(conflict(&format!(
            "response key maps to both schema fields '{}' and '{}'",
            a.name.as_str(),
            b.name.as_str()
        )));
    }
    if a.field_type != b.field_type {
        return Err(conflict(&format!(
            "response key resolves to both '{}' and '{}'",
            a.field_type, b.field_type
        )));
    }
    if a.arguments != b.arguments {
        return Err(conflict("incompatible argument sets"));
    }
    let deferral = match (a.deferral, b.deferral) {
        (Some(left), Some(right)) => {
            if left != right {
                return Err(conflict("field is deferred twice with different labels"));
            }
            Some(left)
        }
        (left, right) => left.or(right),
    };

    let mut origins = a.origins;
    origins.extend(b.origins);
    let mut accessors = a.accessors;
    accessors.extend(b.accessors);

    let selection = match (a.selection, b.selection) {
        (None, None) => None,
        (Some(left), Some(right)) => {
            let child_path = path.join(PathElement::Key(a.response_key.as_str().to_owned()));
            let fields = merge_fields(left.fields, right.fields, &child_path)?;
            let fragments =
                merge_fragments(left.fragments, &fields, right.fragments, &child_path)?;
            Some(CanonicalSelection::new(left.ty, fields, fragments))
        }
        (Some(_), None) | (None, Some(_)) => {
            return Err(conflict("response key is both a leaf and an object"));
        }
    };

    Ok(CanonicalField {
        response_key: a.response_key,
        name: a.name,
        field_type: a.field_type,
        arguments: a.arguments,
        selection,
        include_skip: a.include_skip,
        deferral,
        origins,
        accessors,
    })
}

/// Merge sibling fragment lists and re-push the level's merged fields into
/// every fragment so each stays a self-sufficient decode shape.
///
/// Named fragments match by name; inline fragments never match each other and
/// are appended, each keeping its own type condition.
pub(crate) fn merge_fragments(
    existing: Vec<CanonicalFragment>,
    parent_fields: &[CanonicalField],
    incoming: Vec<CanonicalFragment>,
    path: &Path,
) -> Result<Vec<CanonicalFragment>, CompileError> {
    let mut pool: Vec<Option<CanonicalFragment>> = incoming.into_iter().map(Some).collect();
    let mut merged = Vec::with_capacity(existing.len() + pool.len());

    for fragment in existing {
        let candidate = match &fragment.name {
            Some(name) => pool.iter_mut().find_map(|slot| {
                slot.take_if(|other| other.name.as_deref() == Some(name.as_str()))
            }),
            None => None,
        };
        match candidate {
            Some(other) => merged.push(merge_fragment(fragment, other, parent_fields, path)?),
            None => merged.push(push_parent_fields(fragment, parent_fields, path)?),
        }
    }
    for fragment in pool.into_iter().flatten() {
        merged.push(push_parent_fields(fragment, parent_fields, path)?);
    }
    Ok(merged)
}

fn merge_fragment(
    existing: CanonicalFragment,
    incoming: CanonicalFragment,
    parent_fields: &[CanonicalField],
    path: &Path,
) -> Result<CanonicalFragment, CompileError> {
    let name = existing.name.clone().unwrap_or_default();
    if existing.type_condition != incoming.type_condition {
        return Err(CompileError::FragmentMergeConflict {
            name,
            reason: format!(
                "type conditions '{}' and '{}' differ",
                existing.type_condition, incoming.type_condition
            ),
        });
    }
    let deferral = match (existing.deferral, incoming.deferral) {
        (Some(left), Some(right)) => {
            if left != right {
                return Err(CompileError::FragmentMergeConflict {
                    name,
                    reason: "fragment is deferred twice with different labels".to_owned(),
                });
            }
            Some(left)
        }
        (left, right) => left.or(right),
    };

    let fields = merge_fields(existing.selection.fields, incoming.selection.fields, path)?;
    let fields = merge_fields(fields, parent_fields.to_vec(), path)?;
    let fragments = merge_fragments(
        existing.selection.fragments,
        &fields,
        incoming.selection.fragments,
        path,
    )?;

    let mut handles = existing.handles;
    handles.extend(incoming.handles);

    Ok(CanonicalFragment {
        name: existing.name,
        type_condition: existing.type_condition,
        handles,
        selection: CanonicalSelection::new(existing.selection.ty, fields, fragments),
        include_skip: existing.include_skip,
        deferral,
    })
}

// The parent field set may have grown since this fragment was built, so it is
// pushed down again on every merge step.
fn push_parent_fields(
    fragment: CanonicalFragment,
    parent_fields: &[CanonicalField],
    path: &Path,
) -> Result<CanonicalFragment, CompileError> {
    if parent_fields.is_empty() {
        return Ok(fragment);
    }
    let fields = merge_fields(fragment.selection.fields, parent_fields.to_vec(), path)?;
    let fragments = merge_fragments(fragment.selection.fragments, &fields, Vec::new(), path)?;
    Ok(CanonicalFragment {
        selection: CanonicalSelection::new(fragment.selection.ty, fields, fragments),
        ..fragment
    })
}
