//! Error taxonomy.
//!
//! Compile-time errors are fatal: there is no partial canonical tree.
//! Decode-time errors abort the enclosing object only and accumulate next to
//! the decoded data. Patch errors abort a single patch application.

use displaydoc::Display;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::json_ext::Path;

/// Errors raised while compiling an operation document into a canonical tree.
#[derive(Error, Debug, Display, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CompileError {
    /// selection processing recursion limit exceeded
    RecursionLimitExceeded,

    /// schema failed to parse or validate: {0}
    InvalidSchema(String),

    /// Unknown operation named "{0}"
    UnknownOperation(String),

    /// spread of unknown fragment '{0}'
    UnknownFragment(String),

    /// cannot select field '{field}' on type '{parent}' at path '{path}'
    SchemaMismatch {
        /// The enclosing type the lookup was performed on.
        parent: String,
        /// The schema field name that failed to resolve.
        field: String,
        /// Response-key path of the failing field.
        path: Path,
    },

    /// fields for response key '{key}' at path '{path}' cannot be merged: {reason}
    FieldMergeConflict {
        key: String,
        path: Path,
        reason: String,
    },

    /// fragment '{name}' cannot be merged: {reason}
    FragmentMergeConflict { name: String, reason: String },

    /// duplicate defer label '{label}' within one operation
    DuplicateDeferLabel { label: String },
}

/// Errors raised while decoding or encoding one payload against a canonical
/// tree. Each carries the full path to the failing position.
#[derive(Error, Debug, Display, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum DecodeError {
    /// custom scalar '{name}' rejected the value at path '{path}': {reason}
    ScalarCoercion {
        name: String,
        path: Path,
        reason: String,
    },

    /// cannot return null for non-nullable field at path '{path}'
    NonNullViolation { path: Path },

    /// no fragment variant handles concrete type '{type_name}' at path '{path}'
    UnhandledTypeCondition { type_name: String, path: Path },

    /// required field '{field}' is missing from the payload at path '{path}'
    MissingRequiredField { field: String, path: Path },

    /// variable '{name}' is not provided and has no default value
    MissingVariable { name: String },

    /// variable '{name}' does not satisfy its declared type '{ty}'
    InvalidVariable { name: String, ty: String },

    /// expected {expected} at path '{path}'
    InvalidValueShape { expected: String, path: Path },
}

impl DecodeError {
    /// The path to the failing position, when the error has one.
    pub fn path(&self) -> Option<&Path> {
        match self {
            DecodeError::ScalarCoercion { path, .. }
            | DecodeError::NonNullViolation { path }
            | DecodeError::UnhandledTypeCondition { path, .. }
            | DecodeError::MissingRequiredField { path, .. }
            | DecodeError::InvalidValueShape { path, .. } => Some(path),
            DecodeError::MissingVariable { .. } | DecodeError::InvalidVariable { .. } => None,
        }
    }
}

/// Errors raised while applying incremental patches to a base result.
#[derive(Error, Debug, Display, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PatchError {
    /// patch path '{path}' does not resolve into the base result
    UnresolvablePatchPath { path: Path },

    /// patch labeled {label:?} at path '{path}' was already applied or is unknown
    DuplicatePatch { path: Path, label: Option<String> },

    /// delivery ended while parts are still pending: {pending:?}
    IncompleteDelivery { pending: Vec<String> },
}
