// Cache invalidation after successful mutations.
// Rules map a method and endpoint pattern to the entries a mutation makes stale.

use std::sync::Arc;

use reqwest::Method;
use serde::{Deserialize, Serialize};

use crate::cache::{CacheStore, ContextField, RequestContext, is_under_prefix};

/// How a rule's pattern is compared with the mutated endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "match", content = "pattern", rename_all = "snake_case")]
pub enum EndpointPattern {
    Exact(String),
    Prefix(String),
}

impl EndpointPattern {
    pub fn matches(&self, endpoint: &str) -> bool {
        let endpoint = endpoint.split('?').next().unwrap_or(endpoint);
        match self {
            EndpointPattern::Exact(pattern) => endpoint == pattern,
            EndpointPattern::Prefix(prefix) => is_under_prefix(endpoint, prefix),
        }
    }
}

/// What to evict when a rule fires.
///
/// `scope` lists the mutation context fields an entry must share to be
/// evicted. Fields the mutation leaves unset do not narrow the eviction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvalidationTarget {
    /// Entries fetched from endpoints under `prefix`.
    Prefix {
        prefix: String,
        #[serde(default)]
        scope: Vec<ContextField>,
    },
    /// Every entry belonging to the scoped context, whatever its endpoint.
    Context { scope: Vec<ContextField> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationRule {
    /// Only mutations with this method fire the rule; `None` means any.
    #[serde(default, with = "method_serde")]
    pub method: Option<Method>,
    pub endpoint: EndpointPattern,
    pub targets: Vec<InvalidationTarget>,
}

impl InvalidationRule {
    pub fn new(method: Option<Method>, endpoint: EndpointPattern) -> Self {
        Self {
            method,
            endpoint,
            targets: Vec::new(),
        }
    }

    /// Evict entries under `prefix` that share `scope` with the mutation.
    pub fn evict_prefix(mut self, prefix: impl Into<String>, scope: &[ContextField]) -> Self {
        self.targets.push(InvalidationTarget::Prefix {
            prefix: prefix.into(),
            scope: scope.to_vec(),
        });
        self
    }

    /// Evict every entry sharing `scope` with the mutation.
    pub fn evict_context(mut self, scope: &[ContextField]) -> Self {
        self.targets.push(InvalidationTarget::Context {
            scope: scope.to_vec(),
        });
        self
    }

    pub fn applies_to(&self, method: &Method, endpoint: &str) -> bool {
        self.method.as_ref().is_none_or(|m| m == method) && self.endpoint.matches(endpoint)
    }
}

#[derive(Clone)]
pub struct InvalidationEngine {
    store: Arc<dyn CacheStore>,
    rules: Vec<InvalidationRule>,
}

impl std::fmt::Debug for InvalidationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationEngine")
            .field("rules", &self.rules)
            .finish()
    }
}

impl InvalidationEngine {
    pub fn new(store: Arc<dyn CacheStore>, rules: Vec<InvalidationRule>) -> Self {
        Self { store, rules }
    }

    pub fn rules(&self) -> &[InvalidationRule] {
        &self.rules
    }

    /// Evict what a successful mutation made stale, returning the count.
    ///
    /// Mutations without a matching rule evict nothing; their cached reads
    /// age out on their own TTL.
    pub fn invalidate(&self, method: &Method, endpoint: &str, context: &RequestContext) -> usize {
        let mut matched = false;
        let mut evicted = 0;

        for rule in self.rules.iter().filter(|r| r.applies_to(method, endpoint)) {
            matched = true;
            for target in &rule.targets {
                evicted += self.apply(target, context);
            }
        }

        if matched {
            tracing::info!(%method, endpoint, evicted, "invalidated cache after mutation");
        } else {
            tracing::debug!(%method, endpoint, "no invalidation rule for mutation");
        }
        evicted
    }

    fn apply(&self, target: &InvalidationTarget, context: &RequestContext) -> usize {
        match target {
            InvalidationTarget::Prefix { prefix, scope } => {
                let filter = context.project(scope);
                if filter.is_empty() {
                    self.store.delete_by_prefix(prefix)
                } else {
                    self.store.delete_matching(prefix, &filter)
                }
            }
            InvalidationTarget::Context { scope } => {
                self.store.delete_by_context(&context.project(scope))
            }
        }
    }
}

mod method_serde {
    use reqwest::Method;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(method: &Option<Method>, s: S) -> Result<S::Ok, S::Error> {
        match method {
            Some(m) => s.serialize_some(m.as_str()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Method>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|name| {
                Method::from_bytes(name.to_ascii_uppercase().as_bytes())
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    use crate::cache::{CacheEntry, MemoryStore, QueryParams, RequestKey};

    fn seed(store: &MemoryStore, endpoint: &str, ctx: RequestContext) -> RequestKey {
        let key = RequestKey::new(endpoint, &QueryParams::new(), &ctx);
        store.set(CacheEntry::new(
            key.clone(),
            endpoint,
            json!([]),
            Utc::now(),
            Duration::from_secs(60),
            ctx,
        ));
        key
    }

    fn things_rule() -> InvalidationRule {
        InvalidationRule::new(Some(Method::POST), EndpointPattern::Exact("/things".into()))
            .evict_prefix("/things", &[ContextField::InstituteId])
    }

    #[test]
    fn test_pattern_matching() {
        assert!(EndpointPattern::Exact("/things".into()).matches("/things"));
        assert!(EndpointPattern::Exact("/things".into()).matches("/things?draft=1"));
        assert!(!EndpointPattern::Exact("/things".into()).matches("/things/1"));
        assert!(EndpointPattern::Prefix("/things".into()).matches("/things/1"));
        assert!(!EndpointPattern::Prefix("/things".into()).matches("/thingsettings"));
    }

    #[test]
    fn test_prefix_eviction_stops_at_segment_boundary() {
        let store = Arc::new(MemoryStore::new());
        let things = seed(&store, "/things", RequestContext::new().institute("I"));
        let settings = seed(&store, "/thingsettings", RequestContext::new().institute("I"));

        let engine = InvalidationEngine::new(store.clone(), vec![things_rule()]);
        let evicted = engine.invalidate(&Method::POST, "/things", &RequestContext::new().institute("I"));

        assert_eq!(evicted, 1);
        assert!(store.get(&things).is_none());
        assert!(store.get(&settings).is_some());
    }

    #[test]
    fn test_evicts_only_matching_institute() {
        let store = Arc::new(MemoryStore::new());
        let i1 = seed(&store, "/things", RequestContext::new().institute("I"));
        let i1_page = seed(&store, "/things/7", RequestContext::new().institute("I"));
        let i2 = seed(&store, "/things", RequestContext::new().institute("J"));
        let other = seed(&store, "/classes", RequestContext::new().institute("I"));

        let engine = InvalidationEngine::new(store.clone(), vec![things_rule()]);
        let evicted = engine.invalidate(
            &Method::POST,
            "/things",
            &RequestContext::new().institute("I").user("u1"),
        );

        assert_eq!(evicted, 2);
        assert!(store.get(&i1).is_none());
        assert!(store.get(&i1_page).is_none());
        assert!(store.get(&i2).is_some());
        assert!(store.get(&other).is_some());
    }

    #[test]
    fn test_method_must_match() {
        let store = Arc::new(MemoryStore::new());
        let key = seed(&store, "/things", RequestContext::new().institute("I"));
        let engine = InvalidationEngine::new(store.clone(), vec![things_rule()]);

        assert_eq!(
            engine.invalidate(&Method::DELETE, "/things", &RequestContext::new().institute("I")),
            0
        );
        assert!(store.get(&key).is_some());
    }

    #[test]
    fn test_unmatched_mutation_is_noop() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "/things", RequestContext::new());
        let engine = InvalidationEngine::new(store.clone(), Vec::new());
        assert_eq!(engine.invalidate(&Method::PUT, "/unknown", &RequestContext::new()), 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_context_target() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "/profile", RequestContext::new().user("u1"));
        seed(&store, "/classes", RequestContext::new().user("u1"));
        seed(&store, "/profile", RequestContext::new().user("u2"));

        let rule = InvalidationRule::new(None, EndpointPattern::Prefix("/profile".into()))
            .evict_context(&[ContextField::UserId]);
        let engine = InvalidationEngine::new(store.clone(), vec![rule]);

        assert_eq!(
            engine.invalidate(&Method::PATCH, "/profile", &RequestContext::new().user("u1")),
            2
        );
        assert_eq!(store.len(), 1);
        // Without a user in the mutation context nothing is evicted.
        assert_eq!(engine.invalidate(&Method::PATCH, "/profile", &RequestContext::new()), 0);
    }

    #[test]
    fn test_rules_deserialize() {
        let rules: Vec<InvalidationRule> = serde_json::from_value(json!([
            {
                "method": "post",
                "endpoint": {"match": "prefix", "pattern": "/subjects"},
                "targets": [
                    {"kind": "prefix", "prefix": "/subjects", "scope": ["instituteId"]},
                    {"kind": "context", "scope": ["classId"]}
                ]
            }
        ]))
        .unwrap();

        assert_eq!(rules[0].method, Some(Method::POST));
        assert_eq!(rules[0].endpoint, EndpointPattern::Prefix("/subjects".into()));
        assert_eq!(rules[0].targets.len(), 2);
    }
}
