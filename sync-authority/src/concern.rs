//! The `WriteConcern` trait (§4.H): one authority-side rule that claims a
//! set of property keys on a `(change_type, class_name)` pair and decides
//! whether a fragment touching them is accepted.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value as Json;
use sync_core::{FragmentType, SyncFragment};

/// The fragment under evaluation, plus enough context for a concern to
/// decide. `existing_properties` is the object's current (pre-fragment)
/// state when the authority's store exposes it — `None` for an `Add`
/// fragment, since there is no prior state to consult.
pub struct ConcernContext<'a> {
    pub change_type: FragmentType,
    pub class_name: &'a str,
    pub fragment: &'a SyncFragment,
    pub existing_properties: Option<&'a BTreeMap<String, Json>>,
}

/// A concern's verdict on the keys it claims. `modifications` carries
/// only the keys this concern rewrites; the registry merges verdicts
/// from every matched concern (§4.H SUPPLEMENT).
#[derive(Debug, Clone, Default)]
pub struct ConcernOutcome {
    pub accepted: bool,
    pub modifications: BTreeMap<String, Json>,
    pub reason: Option<String>,
}

impl ConcernOutcome {
    pub fn accept() -> Self {
        Self {
            accepted: true,
            modifications: BTreeMap::new(),
            reason: None,
        }
    }

    pub fn accept_with(modifications: BTreeMap<String, Json>) -> Self {
        Self {
            accepted: true,
            modifications,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            modifications: BTreeMap::new(),
            reason: Some(reason.into()),
        }
    }
}

/// One registered write concern (§4.H). `when` names the keys it claims;
/// `constrain` disambiguates it from another concern claiming the same
/// keys on the same `(change_type, class_name)` — two concerns may only
/// share a key if their `constrain` maps differ.
#[async_trait]
pub trait WriteConcern: Send + Sync {
    fn when(&self) -> &[String];

    fn constrain(&self) -> &BTreeMap<String, Json> {
        static EMPTY: BTreeMap<String, Json> = BTreeMap::new();
        &EMPTY
    }

    async fn evaluate(&self, ctx: &ConcernContext<'_>) -> ConcernOutcome;
}

/// Whether `constrain` further narrows applicability: when present, the
/// concern only applies if every `(key, value)` pair matches the
/// fragment's own property value for that key (§4.H SUPPLEMENT — the
/// `constrain` map "disambiguates two concerns on the same key").
pub fn constrain_matches(constrain: &BTreeMap<String, Json>, fragment: &SyncFragment) -> bool {
    if constrain.is_empty() {
        return true;
    }
    let Some(properties) = &fragment.properties else {
        return false;
    };
    constrain
        .iter()
        .all(|(key, expected)| properties.get(key) == Some(expected))
}

/// The fallback verdict applied when no registered concern claims any key
/// touched by a fragment (§4.H: "the per-scope or global default concern
/// applies").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultVerdict {
    Accept,
    Deny,
}

impl DefaultVerdict {
    pub fn outcome(self) -> ConcernOutcome {
        match self {
            DefaultVerdict::Accept => ConcernOutcome::accept(),
            DefaultVerdict::Deny => ConcernOutcome::deny("denied by default write concern"),
        }
    }
}
