use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Separates the scope (owning store) from the local part of a scoped
/// [`MeshObjectIdentifier`].
const SCOPE_SEPARATOR: char = '#';

/// Network location of a MeshBase.
///
/// Used both to name a local store and, for networked stores, to name the
/// peer a proxy talks to. Must be non-empty and must not contain whitespace
/// or the `#` scope separator.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MeshBaseIdentifier(String);

impl MeshBaseIdentifier {
    /// Parse and validate a store identifier.
    pub fn parse(s: &str) -> Result<Self, TypeError> {
        let invalid = |reason: &str| TypeError::InvalidMeshBaseIdentifier {
            input: s.to_string(),
            reason: reason.to_string(),
        };
        if s.is_empty() {
            return Err(invalid("empty"));
        }
        if s.contains(SCOPE_SEPARATOR) {
            return Err(invalid("contains '#'"));
        }
        if s.chars().any(char::is_whitespace) {
            return Err(invalid("contains whitespace"));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for MeshBaseIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MeshBaseIdentifier({})", self.0)
    }
}

impl fmt::Display for MeshBaseIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MeshBaseIdentifier {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for MeshBaseIdentifier {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<MeshBaseIdentifier> for String {
    fn from(id: MeshBaseIdentifier) -> Self {
        id.0
    }
}

/// Identifies a MeshObject.
///
/// An identifier has a local part and, in networked stores, the identifier of
/// the store the object was created in (its scope). The external form is
/// `scope#local`, or just `local` when unscoped. The empty local part denotes
/// the home object of a store.
///
/// Identifiers are totally ordered (scope first, then local part). The order
/// is stable across processes, which lets two-endpoint operations acquire
/// per-object locks in a canonical order.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MeshObjectIdentifier {
    scope: Option<MeshBaseIdentifier>,
    local: String,
}

impl MeshObjectIdentifier {
    /// Create an unscoped identifier from a local name.
    pub fn new(local: impl Into<String>) -> Result<Self, TypeError> {
        let local = local.into();
        validate_local(&local)?;
        Ok(Self { scope: None, local })
    }

    /// Create an identifier scoped to the given store.
    pub fn scoped(scope: MeshBaseIdentifier, local: impl Into<String>) -> Result<Self, TypeError> {
        let local = local.into();
        validate_local(&local)?;
        Ok(Self {
            scope: Some(scope),
            local,
        })
    }

    /// Create a fresh, unique identifier (UUID v7, time-ordered).
    pub fn generate(scope: Option<MeshBaseIdentifier>) -> Self {
        Self {
            scope,
            local: uuid::Uuid::now_v7().to_string(),
        }
    }

    /// The identifier of the home object, optionally scoped.
    pub fn home(scope: Option<MeshBaseIdentifier>) -> Self {
        Self {
            scope,
            local: String::new(),
        }
    }

    /// Parse the external form produced by [`Display`](fmt::Display).
    pub fn parse(s: &str) -> Result<Self, TypeError> {
        match s.split_once(SCOPE_SEPARATOR) {
            Some((scope, local)) => {
                let scope = MeshBaseIdentifier::parse(scope).map_err(|e| {
                    TypeError::InvalidIdentifier {
                        input: s.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                Self::scoped(scope, local)
            }
            None => Self::new(s),
        }
    }

    /// The store this identifier is scoped to, if any.
    pub fn scope(&self) -> Option<&MeshBaseIdentifier> {
        self.scope.as_ref()
    }

    /// The local part of the identifier.
    pub fn local(&self) -> &str {
        &self.local
    }

    /// Returns `true` if this identifies the home object of a store.
    pub fn is_home(&self) -> bool {
        self.local.is_empty()
    }
}

fn validate_local(local: &str) -> Result<(), TypeError> {
    if local.chars().any(char::is_whitespace) {
        return Err(TypeError::InvalidIdentifier {
            input: local.to_string(),
            reason: "contains whitespace".into(),
        });
    }
    if local.contains(SCOPE_SEPARATOR) {
        return Err(TypeError::InvalidIdentifier {
            input: local.to_string(),
            reason: "local part contains '#'".into(),
        });
    }
    Ok(())
}

impl fmt::Debug for MeshObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MeshObjectIdentifier({self})")
    }
}

impl fmt::Display for MeshObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{scope}{SCOPE_SEPARATOR}{}", self.local),
            None => f.write_str(&self.local),
        }
    }
}

impl FromStr for MeshObjectIdentifier {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for MeshObjectIdentifier {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<MeshObjectIdentifier> for String {
    fn from(id: MeshObjectIdentifier) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn base(s: &str) -> MeshBaseIdentifier {
        MeshBaseIdentifier::parse(s).unwrap()
    }

    #[test]
    fn unscoped_roundtrip() {
        let id = MeshObjectIdentifier::new("alice").unwrap();
        assert_eq!(id.to_string(), "alice");
        assert_eq!(MeshObjectIdentifier::parse("alice").unwrap(), id);
        assert!(id.scope().is_none());
    }

    #[test]
    fn scoped_roundtrip() {
        let id = MeshObjectIdentifier::scoped(base("http://example.org/a/"), "bob").unwrap();
        assert_eq!(id.to_string(), "http://example.org/a/#bob");
        let parsed = MeshObjectIdentifier::parse(&id.to_string()).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.scope().unwrap().as_str(), "http://example.org/a/");
    }

    #[test]
    fn home_identifiers() {
        let unscoped = MeshObjectIdentifier::home(None);
        assert!(unscoped.is_home());
        assert_eq!(MeshObjectIdentifier::parse("").unwrap(), unscoped);

        let scoped = MeshObjectIdentifier::home(Some(base("store-a")));
        assert_eq!(scoped.to_string(), "store-a#");
        assert_eq!(MeshObjectIdentifier::parse("store-a#").unwrap(), scoped);
    }

    #[test]
    fn generated_identifiers_are_unique() {
        let a = MeshObjectIdentifier::generate(None);
        let b = MeshObjectIdentifier::generate(None);
        assert_ne!(a, b);
        assert!(!a.is_home());
    }

    #[test]
    fn whitespace_is_rejected() {
        assert!(MeshObjectIdentifier::new("a b").is_err());
        assert!(MeshBaseIdentifier::parse("a b").is_err());
        assert!(MeshBaseIdentifier::parse("").is_err());
    }

    #[test]
    fn local_part_cannot_contain_separator() {
        assert!(MeshObjectIdentifier::new("a#b").is_err());
        assert!(MeshObjectIdentifier::parse("s#a#b").is_err());
    }

    #[test]
    fn ordering_is_scope_first() {
        let a = MeshObjectIdentifier::scoped(base("a"), "z").unwrap();
        let b = MeshObjectIdentifier::scoped(base("b"), "a").unwrap();
        assert!(a < b);
        let unscoped = MeshObjectIdentifier::new("zzz").unwrap();
        assert!(unscoped < a);
    }

    #[test]
    fn serde_uses_external_form() {
        let id = MeshObjectIdentifier::scoped(base("s"), "x").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"s#x\"");
        let parsed: MeshObjectIdentifier = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    proptest! {
        #[test]
        fn parse_format_roundtrip(
            scope in proptest::option::of("[a-z][a-z0-9:/._-]{0,20}"),
            local in "[A-Za-z0-9._-]{0,24}",
        ) {
            let id = match scope {
                Some(s) => MeshObjectIdentifier::scoped(base(&s), local).unwrap(),
                None => MeshObjectIdentifier::new(local).unwrap(),
            };
            prop_assert_eq!(MeshObjectIdentifier::parse(&id.to_string()).unwrap(), id);
        }
    }
}
