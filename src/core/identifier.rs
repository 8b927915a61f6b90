use super::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Primary-key value of an entity instance.
///
/// A composite identifier keeps its components sorted by name, so two
/// composites built from the same parts in any order compare and hash equal.
/// Components may themselves be composite: a dependent keyed by an owner with
/// an embedded id nests the owner's key under the association name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Identifier {
    Scalar(Value),
    Composite(Vec<(String, Identifier)>),
}

impl Identifier {
    pub fn scalar(value: impl Into<Value>) -> Self {
        Self::Scalar(value.into())
    }

    /// Builds a composite identifier; a later component with the same name
    /// replaces an earlier one.
    pub fn composite<I, K>(parts: I) -> Self
    where
        I: IntoIterator<Item = (K, Identifier)>,
        K: Into<String>,
    {
        let mut components: Vec<(String, Identifier)> = Vec::new();
        for (name, part) in parts {
            let name = name.into();
            match components.iter_mut().find(|(existing, _)| *existing == name) {
                Some(slot) => slot.1 = part,
                None => components.push((name, part)),
            }
        }
        components.sort_by(|a, b| a.0.cmp(&b.0));
        Self::Composite(components)
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            Self::Scalar(v) => Some(v),
            Self::Composite(_) => None,
        }
    }

    pub fn component(&self, name: &str) -> Option<&Identifier> {
        match self {
            Self::Scalar(_) => None,
            Self::Composite(parts) => parts.iter().find(|(n, _)| n == name).map(|(_, id)| id),
        }
    }

    pub fn component_names(&self) -> Vec<&str> {
        match self {
            Self::Scalar(_) => Vec::new(),
            Self::Composite(parts) => parts.iter().map(|(n, _)| n.as_str()).collect(),
        }
    }

    /// An identifier is complete when no scalar inside it is NULL.
    pub fn is_complete(&self) -> bool {
        match self {
            Self::Scalar(v) => !v.is_null(),
            Self::Composite(parts) => !parts.is_empty() && parts.iter().all(|(_, id)| id.is_complete()),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(v) => write!(f, "{}", v),
            Self::Composite(parts) => {
                write!(f, "(")?;
                for (i, (name, id)) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}={}", name, id)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<Value> for Identifier {
    fn from(v: Value) -> Self {
        Self::Scalar(v)
    }
}

impl From<i64> for Identifier {
    fn from(i: i64) -> Self {
        Self::Scalar(Value::Integer(i))
    }
}

impl From<i32> for Identifier {
    fn from(i: i32) -> Self {
        Self::Scalar(Value::Integer(i as i64))
    }
}

impl From<&str> for Identifier {
    fn from(s: &str) -> Self {
        Self::Scalar(Value::Text(s.to_string()))
    }
}

impl From<String> for Identifier {
    fn from(s: String) -> Self {
        Self::Scalar(Value::Text(s))
    }
}

impl From<uuid::Uuid> for Identifier {
    fn from(u: uuid::Uuid) -> Self {
        Self::Scalar(Value::Uuid(u))
    }
}

/// Identity-map key: hierarchy root entity name plus identifier.
///
/// Keys always name the root of the inheritance hierarchy so that looking an
/// instance up through any of its supertypes lands on the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    root: String,
    id: Identifier,
}

impl EntityKey {
    pub fn new(root: impl Into<String>, id: impl Into<Identifier>) -> Self {
        Self {
            root: root.into(),
            id: id.into(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn id(&self) -> &Identifier {
        &self.id
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.root, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_is_order_independent() {
        let a = Identifier::composite([("name", Identifier::from("Joe")), ("emp", Identifier::from(1))]);
        let b = Identifier::composite([("emp", Identifier::from(1)), ("name", Identifier::from("Joe"))]);
        assert_eq!(a, b);
        assert_eq!(a.component_names(), vec!["emp", "name"]);
        assert_eq!(a.to_string(), "(emp=1, name=Joe)");
    }

    #[test]
    fn test_nested_composite() {
        let owner = Identifier::composite([("first", Identifier::from("Ann")), ("last", Identifier::from("Lee"))]);
        let dependent = Identifier::composite([("emp", owner.clone()), ("name", Identifier::from("Bo"))]);
        assert_eq!(dependent.component("emp"), Some(&owner));
        assert!(dependent.is_complete());
    }

    #[test]
    fn test_incomplete_identifier() {
        assert!(!Identifier::Scalar(Value::Null).is_complete());
        let partial = Identifier::composite([("a", Identifier::from(1)), ("b", Identifier::Scalar(Value::Null))]);
        assert!(!partial.is_complete());
        assert!(!Identifier::Composite(Vec::new()).is_complete());
    }

    #[test]
    fn test_entity_key_display() {
        let key = EntityKey::new("Person", 7);
        assert_eq!(key.to_string(), "Person#7");
        assert_eq!(key.root(), "Person");
    }
}
