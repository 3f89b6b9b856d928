use std::collections::BTreeSet;
use std::fmt;

/// A Distribution token scope: `<type>:<name>:<action>[,<action>…]`.
///
/// Resource names may themselves contain colons (registry host:port
/// prefixes), so parsing splits the type off the front and the action
/// list off the back.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Scope {
    pub resource_type: String,
    pub resource_name: String,
    pub actions: BTreeSet<String>,
}

impl Scope {
    pub fn repository(name: impl Into<String>, actions: &str) -> Self {
        Self {
            resource_type: "repository".to_string(),
            resource_name: name.into(),
            actions: split_actions(actions),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (resource_type, rest) = raw.split_once(':')?;
        let (resource_name, actions) = rest.rsplit_once(':')?;
        if resource_type.is_empty() || resource_name.is_empty() || actions.is_empty() {
            return None;
        }
        Some(Self {
            resource_type: resource_type.to_string(),
            resource_name: resource_name.to_string(),
            actions: split_actions(actions),
        })
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let actions = self
            .actions
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "{}:{}:{}", self.resource_type, self.resource_name, actions)
    }
}

fn split_actions(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// Cache key for a scope set: sorted, space-joined canonical strings.
/// Two requests needing the same scopes in different order share one key.
pub fn cache_key(scopes: &[Scope]) -> String {
    let mut rendered: Vec<String> = scopes.iter().map(ToString::to_string).collect();
    rendered.sort();
    rendered.dedup();
    rendered.join(" ")
}

#[cfg(test)]
mod tests {
    use super::{Scope, cache_key};

    #[test]
    fn parses_repository_scope() {
        let scope = Scope::parse("repository:project/alpine:pull,push").expect("scope");
        assert_eq!(scope.resource_type, "repository");
        assert_eq!(scope.resource_name, "project/alpine");
        assert!(scope.actions.contains("pull"));
        assert!(scope.actions.contains("push"));
    }

    #[test]
    fn parses_name_with_port() {
        let scope = Scope::parse("repository:registry.local:5000/alpine:pull").expect("scope");
        assert_eq!(scope.resource_name, "registry.local:5000/alpine");
    }

    #[test]
    fn rejects_malformed_scope() {
        assert!(Scope::parse("repository").is_none());
        assert!(Scope::parse("repository:name").is_none());
        assert!(Scope::parse(":name:pull").is_none());
        assert!(Scope::parse("repository::pull").is_none());
    }

    #[test]
    fn display_round_trips() {
        let raw = "registry:catalog:*";
        assert_eq!(Scope::parse(raw).expect("scope").to_string(), raw);
    }

    #[test]
    fn display_sorts_actions() {
        let scope = Scope::repository("p/r", "push,pull");
        assert_eq!(scope.to_string(), "repository:p/r:pull,push");
    }

    #[test]
    fn cache_key_is_order_independent() {
        let a = Scope::repository("p/a", "pull");
        let b = Scope::repository("p/b", "push");
        assert_eq!(cache_key(&[a.clone(), b.clone()]), cache_key(&[b, a]));
    }

    #[test]
    fn cache_key_of_empty_set_is_empty() {
        assert_eq!(cache_key(&[]), "");
    }
}
