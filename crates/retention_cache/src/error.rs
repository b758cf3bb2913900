// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types for cache key encoding.

use std::fmt::{self, Display};

/// The reason a value could not be encoded into a [`CacheKey`](crate::CacheKey).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum EncodeErrorKind {
    /// The value refers back to itself while it is still being encoded.
    Circular,

    /// A map key is not string-like (string, char, bool, integer or unit variant).
    UnsupportedKey,

    /// The value's own `Serialize` implementation reported an error.
    #[default]
    Custom,
}

impl Display for EncodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Circular => f.write_str("converting circular structure"),
            Self::UnsupportedKey => f.write_str("map key must be string-like"),
            Self::Custom => f.write_str("serialization failed"),
        }
    }
}

/// Raised when a parameter value has no canonical key encoding.
///
/// Key encoding is the only fallible step of a cache lookup. A circular parameter is a
/// programming error in the shape of the key, so the cache makes no attempt to recover.
///
/// # Examples
///
/// ```
/// use std::cell::RefCell;
/// use std::rc::Rc;
///
/// use retention_cache::{EncodeErrorKind, encode_key};
///
/// #[derive(serde::Serialize)]
/// struct Node {
///     next: Option<Rc<RefCell<Node>>>,
/// }
///
/// let node = Rc::new(RefCell::new(Node { next: None }));
/// node.borrow_mut().next = Some(Rc::clone(&node));
///
/// let error = encode_key(&node).unwrap_err();
/// assert_eq!(error.kind(), EncodeErrorKind::Circular);
/// # node.borrow_mut().next = None;
/// ```
#[ohno::error]
#[display("cannot encode cache key: {kind}")]
pub struct EncodeError {
    kind: EncodeErrorKind,
}

impl EncodeError {
    pub(crate) fn circular() -> Self {
        Self::new(EncodeErrorKind::Circular)
    }

    pub(crate) fn unsupported_key(found: &'static str) -> Self {
        Self::caused_by(EncodeErrorKind::UnsupportedKey, format!("found {found}"))
    }

    /// Returns the reason encoding failed.
    #[must_use]
    pub fn kind(&self) -> EncodeErrorKind {
        self.kind
    }

    /// Returns `true` if the value contained a reference cycle.
    #[must_use]
    pub fn is_circular(&self) -> bool {
        self.kind == EncodeErrorKind::Circular
    }
}

impl serde::ser::Error for EncodeError {
    fn custom<T: Display>(msg: T) -> Self {
        Self::caused_by(EncodeErrorKind::Custom, msg.to_string())
    }
}
