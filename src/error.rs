//! Error types for loaders, registries and the resolution driver.

use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use thiserror::Error;

use crate::key::Key;

/// A failure reported by a batch function. It is reference counted so that
/// the single failure of a window can be handed to every handle pending in
/// that window.
#[derive(Debug, Clone)]
pub struct FetchError(Arc<dyn StdError + Send + Sync>);

impl FetchError {
    pub fn new<E: StdError + Send + Sync + 'static>(error: E) -> Self {
        Self(Arc::new(error))
    }

    /// Create a FetchError from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        let boxed: Box<dyn StdError + Send + Sync> = message.into().into();
        Self(boxed.into())
    }

    /// Check whether two FetchErrors are the same shared failure.
    pub fn same_failure(&self, other: &FetchError) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Display for FetchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl StdError for FetchError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}

/// Programmer or configuration defects. These are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("unknown relation `{name}`")]
    UnknownRelation { name: String },

    #[error("relation `{name}` does not produce values of type `{expected}`")]
    RelationType {
        name: String,
        expected: &'static str,
    },

    #[error("relation `{name}` is registered more than once")]
    DuplicateRelation { name: String },

    #[error("invalid relation name `{name}`: only ASCII letters, digits and `_` are allowed")]
    InvalidRelationName { name: String },

    #[error("invalid setting {name}={value:?}: {reason}")]
    InvalidSetting {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// The outcome of a failed load, or of a failed field resolution.
///
/// A key with no backing row is *not* an error; it resolves successfully to
/// `None` (one-to-one) or an empty list (one-to-many).
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// The batch fetch for a window failed. Every handle pending in that
    /// window observes the same error.
    #[error("batch fetch for relation `{relation}` failed: {source}")]
    BatchFetch {
        relation: &'static str,
        #[source]
        source: FetchError,
    },

    /// A batch function returned a result set that did not cover this key.
    #[error("batch result for relation `{}` has no value for key {key}", .key.relation())]
    MissingValue { key: Key },

    #[error("request was cancelled")]
    RequestCancelled,

    #[error("type `{type_name}` has no field `{field}`")]
    UnknownField {
        type_name: &'static str,
        field: String,
    },

    #[error("invalid argument for field `{field}`: {reason}")]
    InvalidArgument { field: String, reason: String },

    /// A resolver's own backend call failed outside of any batch window.
    #[error("field `{field}` failed: {source}")]
    Upstream {
        field: String,
        #[source]
        source: FetchError,
    },
}

impl Error {
    /// Check if this error is the shared failure of a batch fetch.
    pub fn is_batch_fetch(&self) -> bool {
        matches!(self, Error::BatchFetch { .. })
    }
}
