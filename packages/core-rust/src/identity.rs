//! Message type identity: the stable name + optional namespace prefix that
//! every route is derived from.
//!
//! Message shapes declare their identity statically through [`MessageType`]
//! instead of relying on runtime type names, so renaming a Rust type never
//! silently changes the queues it is delivered to.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RoutingError
// ---------------------------------------------------------------------------

/// Errors from validating a message type identity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("message type name must not be empty")]
    EmptyName,
    #[error("message type name {name:?} must start with an ASCII letter and contain only ASCII letters, digits or '_'")]
    InvalidName { name: String },
    #[error("message name prefix {prefix:?} may only contain ASCII letters, digits, '-', '_' or inner '.'")]
    InvalidPrefix { prefix: String },
}

// ---------------------------------------------------------------------------
// MessageTypeIdentity
// ---------------------------------------------------------------------------

/// The stable identity of a message shape.
///
/// Two identities with the same name and prefix resolve to the same routes;
/// that is the only supported form of aliasing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageTypeIdentity {
    name: String,
    prefix: Option<String>,
}

impl MessageTypeIdentity {
    /// Creates an identity without validation.
    ///
    /// Use [`MessageTypeIdentity::try_new`] for names that come from outside
    /// the program; statically declared names are checked once at registration.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prefix: None,
        }
    }

    /// Creates a validated identity.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError`] if the name is empty or not an identifier.
    pub fn try_new(name: impl Into<String>) -> Result<Self, RoutingError> {
        let identity = Self::new(name);
        identity.validate()?;
        Ok(identity)
    }

    /// Attaches a namespace prefix. Blank prefixes are dropped; others are trimmed.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl AsRef<str>) -> Self {
        let trimmed = prefix.as_ref().trim();
        self.prefix = (!trimmed.is_empty()).then(|| trimmed.to_string());
        self
    }

    /// Attaches an optional prefix (convenience for `Option<&str>` constants).
    #[must_use]
    pub fn with_optional_prefix(self, prefix: Option<&str>) -> Self {
        match prefix {
            Some(p) => self.with_prefix(p),
            None => self,
        }
    }

    /// The declared name, e.g. `OrderCreated`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The normalised prefix, if any.
    #[must_use]
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Checks that the identity can be turned into a well-formed route name.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError`] describing the first problem found.
    pub fn validate(&self) -> Result<(), RoutingError> {
        let mut chars = self.name.chars();
        let Some(first) = chars.next() else {
            return Err(RoutingError::EmptyName);
        };
        if !first.is_ascii_alphabetic() || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(RoutingError::InvalidName {
                name: self.name.clone(),
            });
        }
        if let Some(prefix) = &self.prefix {
            let valid_chars = prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
            if !valid_chars || prefix.starts_with('.') || prefix.ends_with('.') {
                return Err(RoutingError::InvalidPrefix {
                    prefix: prefix.clone(),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for MessageTypeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.prefix {
            Some(prefix) => write!(f, "{prefix}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

// ---------------------------------------------------------------------------
// Message traits
// ---------------------------------------------------------------------------

/// Static identity declaration for a message shape.
///
/// ```
/// use courier_core::MessageType;
///
/// struct OrderCreated;
///
/// impl MessageType for OrderCreated {
///     const NAME: &'static str = "OrderCreated";
///     const PREFIX: Option<&'static str> = Some("sales");
/// }
///
/// assert_eq!(OrderCreated::identity().to_string(), "sales.OrderCreated");
/// ```
pub trait MessageType {
    /// Declared message name in `PascalCase`.
    const NAME: &'static str;
    /// Optional namespace prefix.
    const PREFIX: Option<&'static str> = None;

    /// The identity built from `NAME` and `PREFIX`.
    #[must_use]
    fn identity() -> MessageTypeIdentity {
        MessageTypeIdentity::new(Self::NAME).with_optional_prefix(Self::PREFIX)
    }
}

/// A message that can travel through the bus.
pub trait Message: MessageType + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Application-level correlation id carried by the message, if any.
    ///
    /// Used as the second-priority idempotency key source.
    fn correlation_id(&self) -> Option<Uuid> {
        None
    }
}

/// A message answered with exactly one response.
pub trait Request: Message {
    /// The response shape.
    type Response: Message;
}

// ---------------------------------------------------------------------------
// MessageHeader
// ---------------------------------------------------------------------------

/// Base fields an application message can embed to carry its own identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeader {
    pub correlation_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

impl MessageHeader {
    /// Fresh header with a random correlation id and the current time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            timestamp: Utc::now(),
        }
    }
}

impl Default for MessageHeader {
    fn default() -> Self {
        Self::new()
    }
}
