#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]
//! Analysis walks arbitrary JSON documents and the expression IR, classifies
//! values as static or dynamic, converts host expressions into CEL templates,
//! and validates compositions before anything reaches a serializer or a
//! cluster.

pub mod analyzer;
pub mod validate;

pub use analyzer::{Analyzed, FactoryContext, StatusPartition, Target};
pub use validate::Strictness;

/// Error enumerates the authoring failures this crate detects.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// UnknownResource indicates a reference to an undeclared id.
    #[error("reference to unknown resource {id:?} (field path {path:?})")]
    UnknownResource {
        /// The undeclared id.
        id: String,
        /// The field path of the offending reference.
        path: String,
    },
    /// Reference wraps a field-path violation.
    #[error(transparent)]
    Reference(#[from] api::reference::Error),
    /// Template wraps a CEL template parse failure.
    #[error(transparent)]
    Template(#[from] api::expr::Error),
    /// InvalidResourceId indicates an id outside the camelCase grammar.
    #[error("invalid resource id {id:?}; try {suggestion:?}")]
    InvalidResourceId {
        /// The offending id.
        id: String,
        /// A grammar-conforming repair.
        suggestion: String,
    },
    /// InvalidCompositionName indicates a name with no usable RFC 1123
    /// projection.
    #[error("invalid composition name {name:?}: {reason}")]
    InvalidCompositionName {
        /// The offending name.
        name: String,
        /// Why the projection failed.
        reason: String,
    },
    /// StatusShape indicates a status mapping that is not an object.
    #[error("status mapping must be an object, got {0}")]
    StatusShape(String),
}

impl Error {
    /// Kind reports the wire-level error kind string.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownResource { .. } => "UnknownResource",
            Self::Reference(_) => "InvalidFieldPath",
            Self::Template(_) => "SerializationError",
            Self::InvalidResourceId { .. } => "InvalidResourceId",
            Self::InvalidCompositionName { .. } => "InvalidCompositionName",
            Self::StatusShape(_) => "StatusPartitionError",
        }
    }
}

/// Result typedef for analysis.
pub type Result<T, E = Error> = std::result::Result<T, E>;
