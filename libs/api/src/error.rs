//! Error types for identifiers and resource handling.

use thiserror::Error;

use crate::ResourceKind;

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID has an invalid prefix.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ID is missing the underscore separator.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The ULID portion of the ID is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

/// Errors raised while building or decoding API objects.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The task payload could not be decoded.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A required field was empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// The object has not been persisted yet and carries no uid.
    #[error("{kind} {name} has no uid")]
    MissingUid { kind: ResourceKind, name: String },

    /// The object already has a different controlling owner.
    #[error("object {name} is already controlled by {kind} {owner}")]
    AlreadyOwned {
        name: String,
        kind: ResourceKind,
        owner: String,
    },

    /// Owner and dependent live in different namespaces.
    #[error("cross-namespace owner reference: owner in '{owner}', dependent in '{dependent}'")]
    CrossNamespaceOwner { owner: String, dependent: String },

    /// The resource kind name is unknown.
    #[error("unknown resource kind: {0}")]
    UnknownKind(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
