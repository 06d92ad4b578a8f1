use std::collections::HashMap;

use apollo_compiler::ExecutableDocument;

use crate::error::CompileError;
use crate::json_ext::Path;
use crate::schema::Schema;
use crate::selection::Selection;

/// Named fragment definitions, keyed by fragment name.
#[derive(Debug, Default)]
pub(crate) struct Fragments {
    map: HashMap<String, Fragment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Fragment {
    pub(crate) type_condition: String,
    pub(crate) selection_set: Vec<Selection>,
}

impl Fragments {
    pub(crate) fn from_executable(
        document: &ExecutableDocument,
        schema: &Schema,
    ) -> Result<Self, CompileError> {
        let mut fragments = Fragments::default();
        // Fragment definitions may spread each other (validation rules out
        // cycles), so each definition is parsed against the full set.
        for (name, fragment) in document.fragments.iter() {
            let type_condition = fragment.selection_set.ty.as_str().to_owned();
            let mut path = Path::empty();

            let selection_set = fragment
                .selection_set
                .selections
                .iter()
                .filter_map(|selection| {
                    Selection::from_executable(
                        selection,
                        &type_condition,
                        schema,
                        0,
                        &mut path,
                        &fragments,
                    )
                    .transpose()
                })
                .collect::<Result<_, _>>()?;

            fragments.map.insert(
                name.as_str().to_owned(),
                Fragment {
                    type_condition,
                    selection_set,
                },
            );
        }
        Ok(fragments)
    }

    pub(crate) fn get(&self, key: impl AsRef<str>) -> Option<&Fragment> {
        self.map.get(key.as_ref())
    }
}
