//! Variable and scope identities.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Signal,
    Data,
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::Signal => f.write_str("signal"),
            Namespace::Data => f.write_str("data"),
        }
    }
}

/// A reference by name within a namespace, before scope resolution.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub namespace: Namespace,
}

impl Variable {
    pub fn signal(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Namespace::Signal,
        }
    }

    pub fn data(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Namespace::Data,
        }
    }

    pub fn scoped(self, scope: Scope) -> ScopedVariable {
        ScopedVariable {
            variable: self,
            scope,
        }
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

/// Address of a nested group instance; the empty scope is the top level.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(Vec<u32>);

impl Scope {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn new(path: Vec<u32>) -> Self {
        Self(path)
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }

    pub fn child(&self, index: u32) -> Self {
        let mut path = self.0.clone();
        path.push(index);
        Self(path)
    }

    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// This scope followed by each enclosing scope up to the root.
    pub fn ancestors(&self) -> impl Iterator<Item = Scope> + '_ {
        (0..=self.0.len()).rev().map(move |n| Scope(self.0[..n].to_vec()))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl From<Vec<u32>> for Scope {
    fn from(path: Vec<u32>) -> Self {
        Self(path)
    }
}

/// A variable together with the scope that defines it.
///
/// This is the identity used by the comm plan, by chart-state updates, and
/// by callers requesting specific outputs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScopedVariable {
    #[serde(flatten)]
    pub variable: Variable,
    pub scope: Scope,
}

impl ScopedVariable {
    pub fn name(&self) -> &str {
        &self.variable.name
    }

    pub fn namespace(&self) -> Namespace {
        self.variable.namespace
    }
}

impl fmt::Display for ScopedVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.variable, self.scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestors_walk_up_to_root() {
        let scope = Scope::new(vec![1, 0]);
        let chain: Vec<_> = scope.ancestors().collect();
        assert_eq!(
            chain,
            vec![Scope::new(vec![1, 0]), Scope::new(vec![1]), Scope::root()]
        );
        assert_eq!(Scope::root().ancestors().count(), 1);
    }

    #[test]
    fn same_name_different_scope_is_distinct() {
        let a = Variable::data("table").scoped(Scope::root());
        let b = Variable::data("table").scoped(Scope::new(vec![0]));
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "data:table@[]");
    }

    #[test]
    fn serializes_flat() {
        let v = Variable::signal("maxbins").scoped(Scope::new(vec![2]));
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"name": "maxbins", "namespace": "signal", "scope": [2]})
        );
    }
}
