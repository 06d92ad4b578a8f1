//! Compiles operation documents into merged canonical field trees and uses
//! them to decode, encode and incrementally assemble response payloads.
//!
//! An operation is compiled once into a [`CompiledOperation`]: overlapping
//! selections contributed by fragments and type conditions are unified into
//! one immutable tree per operation. That tree then drives any number of
//! concurrent [`CompiledOperation::decode`] and [`CompiledOperation::encode`]
//! calls, and seeds an [`IncrementalMerger`] when parts of the response are
//! deferred and delivered as out-of-band patches.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]
#![warn(unreachable_pub)]

pub mod canonical;
pub mod codec;
pub mod error;
mod field_type;
mod fragments;
pub mod incremental;
pub mod json_ext;
mod merge;
pub mod response;
pub mod schema;
mod selection;

pub use canonical::CompileOptions;
pub use canonical::CompiledOperation;
pub use canonical::PolymorphicFallback;
pub use codec::Decoded;
pub use codec::PendingDefer;
pub use codec::ScalarRegistry;
pub use error::CompileError;
pub use error::DecodeError;
pub use error::PatchError;
pub use field_type::FieldType;
pub use incremental::IncrementalMerger;
pub use response::IncrementalPatch;
pub use schema::Schema;
pub use selection::Argument;
pub use selection::ArgumentValue;
pub use selection::Condition;
pub use selection::Deferral;
pub use selection::IncludeSkip;

pub(crate) const TYPENAME: &str = "__typename";
