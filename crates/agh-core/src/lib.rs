//! Shared building blocks for the grading helper: the record codec, the
//! metadata store, the anonymizer and filesystem helpers.

pub mod anonymizer;
pub mod codec;
pub mod error;
pub mod fs;
pub mod metadata;

pub use codec::{Field, FieldKind, Record};
pub use error::{AghError, Result};
pub use metadata::{KeyPath, Metadata};
