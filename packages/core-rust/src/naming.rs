//! Route naming: `[prefix.]<kebab-case-name>.<pattern-suffix>`.
//!
//! Naming is a pure function of (identity, pattern). It performs no I/O and
//! cannot fail for an identity that passed [`MessageTypeIdentity::validate`].

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::identity::{MessageType, MessageTypeIdentity};
use crate::pattern::DeliveryPattern;

static WORD_BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("([a-z0-9])([A-Z])").expect("word boundary pattern is valid"));

/// Converts `PascalCase` to kebab-case: `OrderCreatedMessage` -> `order-created-message`.
///
/// A separator is inserted between a lowercase letter or digit and a following
/// uppercase letter, then the whole string is lowercased. Runs of capitals are
/// kept together (`HTTPRequest` -> `httprequest`).
#[must_use]
pub fn kebab_case(name: &str) -> String {
    WORD_BOUNDARY.replace_all(name, "$1-$2").to_lowercase()
}

// ---------------------------------------------------------------------------
// RouteName
// ---------------------------------------------------------------------------

/// Canonical queue/exchange name for an (identity, pattern) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteName(String);

impl RouteName {
    /// Resolves the route name for an identity and pattern.
    #[must_use]
    pub fn resolve(identity: &MessageTypeIdentity, pattern: DeliveryPattern) -> Self {
        let base = kebab_case(identity.name());
        let head = match identity.prefix() {
            Some(prefix) => format!("{}.{base}", prefix.to_lowercase()),
            None => base,
        };
        Self(format!("{head}.{}", pattern.suffix()))
    }

    /// Resolves the route name for a statically declared message type.
    #[must_use]
    pub fn for_type<T: MessageType>(pattern: DeliveryPattern) -> Self {
        Self::resolve(&T::identity(), pattern)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The suffix token this route ends with.
    #[must_use]
    pub fn suffix(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or_default()
    }
}

impl fmt::Display for RouteName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RouteName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Free-function form of [`RouteName::resolve`].
#[must_use]
pub fn route_name(identity: &MessageTypeIdentity, pattern: DeliveryPattern) -> RouteName {
    RouteName::resolve(identity, pattern)
}

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

/// Whether a route is addressed as a queue or as an exchange/topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressingMode {
    Queue,
    Exchange,
}

/// Opaque broker address, rendered as `queue:<name>` or `exchange:<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Address {
    Queue(String),
    Exchange(String),
}

impl Address {
    /// Builds the address of a route in the given addressing mode.
    #[must_use]
    pub fn for_route(route: &RouteName, mode: AddressingMode) -> Self {
        match mode {
            AddressingMode::Queue => Self::Queue(route.to_string()),
            AddressingMode::Exchange => Self::Exchange(route.to_string()),
        }
    }

    /// Exchange address of a route; the mode producers and consumers share.
    #[must_use]
    pub fn exchange(route: &RouteName) -> Self {
        Self::for_route(route, AddressingMode::Exchange)
    }

    /// Queue address by raw queue name.
    #[must_use]
    pub fn queue(name: impl Into<String>) -> Self {
        Self::Queue(name.into())
    }

    /// The name part without the scheme.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Queue(name) | Self::Exchange(name) => name,
        }
    }

    #[must_use]
    pub fn mode(&self) -> AddressingMode {
        match self {
            Self::Queue(_) => AddressingMode::Queue,
            Self::Exchange(_) => AddressingMode::Exchange,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue(name) => write!(f, "queue:{name}"),
            Self::Exchange(name) => write!(f, "exchange:{name}"),
        }
    }
}

/// Error parsing an [`Address`] string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid address {0:?}: expected queue:<name> or exchange:<name>")]
pub struct AddressParseError(pub String);

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("queue", name)) if !name.is_empty() => Ok(Self::Queue(name.to_string())),
            Some(("exchange", name)) if !name.is_empty() => Ok(Self::Exchange(name.to_string())),
            _ => Err(AddressParseError(s.to_string())),
        }
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

impl TryFrom<String> for Address {
    type Error = AddressParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
