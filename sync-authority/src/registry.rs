//! The default write-concern registry: indexes concerns by
//! `(change_type, class_name)`, enforces the conflict-detection rule at
//! registration time, and implements [`FragmentWriter`] — the trait the
//! authority side holds as `Arc<dyn FragmentWriter>` rather than a
//! concrete backend.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use sync_core::{FragmentReply, FragmentType, SyncFragment, WireError};

use crate::concern::{constrain_matches, ConcernContext, DefaultVerdict, WriteConcern};
use crate::error::AuthorityError;

/// `apply_sync_fragments_for_scope(scope, fragments)` (§4.H): one
/// [`FragmentReply`] per input fragment, in order.
#[async_trait]
pub trait FragmentWriter: Send + Sync {
    async fn apply_sync_fragments_for_scope(
        &self,
        scope: Uuid,
        fragments: &[SyncFragment],
    ) -> Vec<FragmentReply>;
}

pub struct ConcernRegistry {
    by_key: HashMap<(FragmentType, String), Vec<Arc<dyn WriteConcern>>>,
    scope_defaults: HashMap<Uuid, DefaultVerdict>,
    global_default: DefaultVerdict,
}

impl ConcernRegistry {
    pub fn new(global_default: DefaultVerdict) -> Self {
        Self {
            by_key: HashMap::new(),
            scope_defaults: HashMap::new(),
            global_default,
        }
    }

    pub fn set_scope_default(&mut self, scope: Uuid, default: DefaultVerdict) {
        self.scope_defaults.insert(scope, default);
    }

    /// Register a concern for `(change_type, class_name)`. Rejects the
    /// registration if an already-registered concern claims an
    /// overlapping key with an indistinguishable `constrain` value
    /// (§4.H: "two concerns claiming the same key without differing
    /// `constrain` values, or with equal constrain values, are
    /// rejected").
    pub fn register(
        &mut self,
        change_type: FragmentType,
        class_name: impl Into<String>,
        concern: Arc<dyn WriteConcern>,
    ) -> Result<(), AuthorityError> {
        let class_name = class_name.into();
        let key = (change_type, class_name.clone());
        let existing = self.by_key.entry(key).or_default();

        for other in existing.iter() {
            for claimed in concern.when() {
                if other.when().iter().any(|k| k == claimed) && other.constrain() == concern.constrain() {
                    return Err(AuthorityError::ConflictingConcern {
                        change_type,
                        class_name,
                        key: claimed.clone(),
                    });
                }
            }
        }

        existing.push(concern);
        Ok(())
    }

    /// Evaluate every concern matching `fragment` and combine their
    /// verdicts per §4.H SUPPLEMENT: conjunction on `accepted`, merged
    /// `modifications` (later registration wins on key collision, which
    /// cannot happen between two *accepted* registrations since
    /// overlapping-key conflicts are rejected up front).
    async fn evaluate_fragment(&self, scope: Uuid, fragment: &SyncFragment) -> FragmentReply {
        let key = (fragment.fragment_type, fragment.cls_name.clone());
        let fragment_keys: HashSet<String> = fragment.keys().into_iter().collect();

        let matched: Vec<&Arc<dyn WriteConcern>> = self
            .by_key
            .get(&key)
            .into_iter()
            .flatten()
            .filter(|c| {
                c.when().iter().any(|k| fragment_keys.contains(k))
                    && constrain_matches(c.constrain(), fragment)
            })
            .collect();

        if matched.is_empty() {
            let default = self
                .scope_defaults
                .get(&scope)
                .copied()
                .unwrap_or(self.global_default);
            return to_reply(default.outcome());
        }

        let ctx = ConcernContext {
            change_type: fragment.fragment_type,
            class_name: &fragment.cls_name,
            fragment,
            existing_properties: None,
        };

        let mut accepted = true;
        let mut modifications = BTreeMap::new();
        let mut reasons = Vec::new();
        for concern in matched {
            let outcome = concern.evaluate(&ctx).await;
            if !outcome.accepted {
                accepted = false;
                if let Some(reason) = outcome.reason {
                    reasons.push(reason);
                }
            }
            modifications.extend(outcome.modifications);
        }

        FragmentReply {
            accepted,
            modifications: if modifications.is_empty() {
                None
            } else {
                Some(modifications)
            },
            error: if accepted {
                None
            } else {
                Some(WireError::new(
                    if reasons.is_empty() {
                        "denied by write concern".to_string()
                    } else {
                        reasons.join("; ")
                    },
                    Some("CouldNotApplySyncMessage"),
                ))
            },
        }
    }
}

fn to_reply(outcome: crate::concern::ConcernOutcome) -> FragmentReply {
    FragmentReply {
        accepted: outcome.accepted,
        modifications: if outcome.modifications.is_empty() {
            None
        } else {
            Some(outcome.modifications)
        },
        error: outcome
            .reason
            .map(|r| WireError::new(r, Some("CouldNotApplySyncMessage"))),
    }
}

#[async_trait]
impl FragmentWriter for ConcernRegistry {
    async fn apply_sync_fragments_for_scope(
        &self,
        scope: Uuid,
        fragments: &[SyncFragment],
    ) -> Vec<FragmentReply> {
        let mut replies = Vec::with_capacity(fragments.len());
        for fragment in fragments {
            replies.push(self.evaluate_fragment(scope, fragment).await);
        }
        replies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concern::ConcernOutcome;
    use serde_json::json;
    use std::collections::BTreeMap as Map;
    use sync_core::FragmentType;

    struct AcceptKey(Vec<String>, Map<String, serde_json::Value>);

    #[async_trait]
    impl WriteConcern for AcceptKey {
        fn when(&self) -> &[String] {
            &self.0
        }
        fn constrain(&self) -> &Map<String, serde_json::Value> {
            &self.1
        }
        async fn evaluate(&self, _ctx: &ConcernContext<'_>) -> ConcernOutcome {
            ConcernOutcome::accept()
        }
    }

    struct DenyKey(Vec<String>);

    #[async_trait]
    impl WriteConcern for DenyKey {
        fn when(&self) -> &[String] {
            &self.0
        }
        async fn evaluate(&self, _ctx: &ConcernContext<'_>) -> ConcernOutcome {
            ConcernOutcome::deny("nope")
        }
    }

    #[test]
    fn conflicting_same_key_no_constrain_rejected() {
        let mut registry = ConcernRegistry::new(DefaultVerdict::Accept);
        registry
            .register(
                FragmentType::Change,
                "Model",
                Arc::new(AcceptKey(vec!["status".into()], Map::new())),
            )
            .unwrap();
        let err = registry
            .register(
                FragmentType::Change,
                "Model",
                Arc::new(DenyKey(vec!["status".into()])),
            )
            .unwrap_err();
        assert!(matches!(err, AuthorityError::ConflictingConcern { .. }));
    }

    #[test]
    fn differing_constrain_on_same_key_allowed() {
        let mut registry = ConcernRegistry::new(DefaultVerdict::Accept);
        registry
            .register(
                FragmentType::Change,
                "Model",
                Arc::new(AcceptKey(
                    vec!["status".into()],
                    Map::from([("status".to_string(), json!("open"))]),
                )),
            )
            .unwrap();
        registry
            .register(
                FragmentType::Change,
                "Model",
                Arc::new(AcceptKey(
                    vec!["status".into()],
                    Map::from([("status".to_string(), json!("closed"))]),
                )),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn unmatched_fragment_falls_back_to_default() {
        let registry = ConcernRegistry::new(DefaultVerdict::Deny);
        let fragment = SyncFragment::new_change(Uuid::new_v4(), "Model");
        let reply = registry.evaluate_fragment(Uuid::new_v4(), &fragment).await;
        assert!(!reply.accepted);
    }

    #[tokio::test]
    async fn matched_concern_denial_produces_rejected_reply() {
        let mut registry = ConcernRegistry::new(DefaultVerdict::Accept);
        registry
            .register(
                FragmentType::Change,
                "Model",
                Arc::new(DenyKey(vec!["name".into()])),
            )
            .unwrap();
        let mut fragment = SyncFragment::new_change(Uuid::new_v4(), "Model");
        fragment.update_value_from_model(
            "name",
            &sync_core::Value::String("b".into()),
            &sync_core::Value::String("a".into()),
        );
        let reply = registry.evaluate_fragment(Uuid::new_v4(), &fragment).await;
        assert!(!reply.accepted);
        assert!(reply.error.is_some());
    }
}
