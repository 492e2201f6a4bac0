//! Idempotency guard for mutation requests.
//!
//! Each request is reduced to an idempotency key and a marker:
//!
//! - the **key** identifies the logical request. With a client-supplied token
//!   it is derived from the operation and the token; otherwise from the
//!   operation and the canonical body.
//! - the **marker** is the fingerprint of the operation and canonical body.
//!   It is the value stored under the key, so a token replayed with a
//!   different payload can be told apart from a plain retry.
//!
//! Admission is a single conditional write (`set_if_absent`) of the marker
//! under the key. The first writer is admitted; everyone else inside the TTL
//! window is rejected. Requests retried after the TTL are admitted again.

use crate::fingerprint::{canonical_json, fingerprint, Fingerprint};
use crate::store::{millis, KeyValueStore, StoreError};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Store namespace for idempotency markers.
const IDEMPOTENCY_PREFIX: &str = "idem:";

/// Longest accepted client idempotency token.
pub const MAX_TOKEN_LEN: usize = 256;

/// What to do when the store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Refuse the request. No risk of applying a mutation twice.
    #[default]
    FailClosed,
    /// Admit the request without a deduplication guarantee.
    FailOpen,
}

/// Whether the caller's source identity is part of a server-derived key.
///
/// `Payload` treats identical bodies from different clients as duplicates.
/// `Client` scopes deduplication per source address, which avoids false
/// positives across clients at the cost of a larger key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyScope {
    #[default]
    Payload,
    Client,
}

#[derive(Debug, Clone)]
pub struct GuardSettings {
    pub ttl: Duration,
    pub failure_policy: FailurePolicy,
    pub key_scope: KeyScope,
    /// Top-level body fields dropped before fingerprinting.
    pub volatile_fields: Vec<String>,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            ttl: crate::DEFAULT_TTL,
            failure_policy: FailurePolicy::default(),
            key_scope: KeyScope::default(),
            volatile_fields: default_volatile_fields(),
        }
    }
}

pub fn default_volatile_fields() -> Vec<String> {
    ["timestamp", "nonce", "request_id"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardError {
    #[error("malformed input: {0}")]
    MalformedInput(String),
}

/// The parts of a mutation request that identify it.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    method: String,
    route: String,
    body: Value,
    source: Option<String>,
    token: Option<String>,
}

impl RequestDescriptor {
    pub fn new(method: impl Into<String>, route: impl Into<String>, body: Value) -> Self {
        Self {
            method: method.into(),
            route: route.into(),
            body,
            source: None,
            token: None,
        }
    }

    /// Build from a raw body. An empty body is `null`; anything else must be JSON.
    pub fn from_body_bytes(
        method: impl Into<String>,
        route: impl Into<String>,
        body: &[u8],
    ) -> Result<Self, GuardError> {
        let body = if body.iter().all(u8::is_ascii_whitespace) {
            Value::Null
        } else {
            serde_json::from_slice(body)
                .map_err(|e| GuardError::MalformedInput(format!("body is not valid JSON: {e}")))?
        };
        Ok(Self::new(method, route, body))
    }

    /// Caller identity, such as the client address.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Client-supplied idempotency token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    fn validate(&self) -> Result<(), GuardError> {
        if self.method.is_empty() || !self.method.bytes().all(|b| b.is_ascii_alphabetic()) {
            return Err(GuardError::MalformedInput(format!(
                "invalid method {:?}",
                self.method
            )));
        }
        if !self.route.starts_with('/') {
            return Err(GuardError::MalformedInput(format!(
                "route must start with '/', got {:?}",
                self.route
            )));
        }
        if let Some(token) = &self.token {
            if token.is_empty() || token.len() > MAX_TOKEN_LEN {
                return Err(GuardError::MalformedInput(format!(
                    "idempotency token must be 1-{MAX_TOKEN_LEN} characters"
                )));
            }
            if token.chars().any(char::is_control) {
                return Err(GuardError::MalformedInput(
                    "idempotency token contains control characters".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// `METHOD /route` with the method upper-cased and any trailing slash dropped.
    fn operation(&self) -> String {
        let route = match self.route.trim_end_matches('/') {
            "" => "/",
            r => r,
        };
        format!("{} {}", self.method.to_ascii_uppercase(), route)
    }
}

/// Key under which a request's marker is stored.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(Fingerprint);

impl IdempotencyKey {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    fn store_key(&self) -> String {
        format!("{IDEMPOTENCY_PREFIX}{}", self.0)
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Same request already admitted inside the TTL window.
    Duplicate,
    /// Token already used for a request with a different payload.
    TokenReused,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::Duplicate => "duplicate",
            RejectReason::TokenReused => "token_reused",
        }
    }
}

/// Outcome of [`IdempotencyGuard::guard`]. Produced per request, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    /// Execute the mutation. Exactly one caller per key and window sees this
    /// (unless the store lacks a conditional set, or `FailOpen` applied).
    /// `marker` is what was written under the key; pass it to
    /// [`IdempotencyGuard::release`].
    Admitted {
        key: IdempotencyKey,
        marker: Fingerprint,
    },
    /// Do not execute; report the reason to the client.
    Rejected {
        key: IdempotencyKey,
        reason: RejectReason,
    },
    /// The store could not be consulted and the policy is `FailClosed`.
    StoreUnavailable { key: IdempotencyKey },
}

impl GuardDecision {
    pub fn key(&self) -> &IdempotencyKey {
        match self {
            GuardDecision::Admitted { key, .. }
            | GuardDecision::Rejected { key, .. }
            | GuardDecision::StoreUnavailable { key } => key,
        }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self, GuardDecision::Admitted { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            GuardDecision::Admitted { .. } => "admitted",
            GuardDecision::Rejected { reason, .. } => reason.as_str(),
            GuardDecision::StoreUnavailable { .. } => "store_unavailable",
        }
    }
}

/// Snapshot of guard counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GuardStats {
    pub admitted: u64,
    pub duplicates: u64,
    pub token_reuses: u64,
    pub unavailable: u64,
    pub admitted_unguarded: u64,
    pub released: u64,
}

#[derive(Default)]
struct Counters {
    admitted: AtomicU64,
    duplicates: AtomicU64,
    token_reuses: AtomicU64,
    unavailable: AtomicU64,
    admitted_unguarded: AtomicU64,
    released: AtomicU64,
}

enum Check {
    Admitted,
    Rejected(RejectReason),
}

/// Deduplicates mutation requests through the shared store.
///
/// Holds no per-request state; every instance of the service that shares
/// the store shares the deduplication window.
pub struct IdempotencyGuard {
    store: Arc<dyn KeyValueStore>,
    ttl_ms: AtomicU64,
    failure_policy: FailurePolicy,
    key_scope: KeyScope,
    volatile_fields: Vec<String>,
    counters: Counters,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn KeyValueStore>, settings: GuardSettings) -> Self {
        tracing::info!(
            store = store.name(),
            ttl_ms = millis(settings.ttl),
            failure_policy = ?settings.failure_policy,
            key_scope = ?settings.key_scope,
            volatile_fields = ?settings.volatile_fields,
            "idempotency guard initialized"
        );
        Self {
            store,
            ttl_ms: AtomicU64::new(millis(settings.ttl)),
            failure_policy: settings.failure_policy,
            key_scope: settings.key_scope,
            volatile_fields: settings.volatile_fields,
            counters: Counters::default(),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms.load(Ordering::Relaxed))
    }

    /// Change the protection window for subsequent admissions.
    pub fn set_ttl(&self, ttl: Duration) {
        self.ttl_ms.store(millis(ttl), Ordering::Relaxed);
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    pub fn key_scope(&self) -> KeyScope {
        self.key_scope
    }

    /// Decide whether `request` may be executed.
    ///
    /// Malformed descriptors fail before the store is touched. Store failures
    /// never surface as errors; they become a decision per the failure policy.
    pub async fn guard(&self, request: &RequestDescriptor) -> Result<GuardDecision, GuardError> {
        request.validate()?;

        let (key, marker) = self.derive(request);
        let store_key = key.store_key();

        let decision = match self.check(&store_key, &marker).await {
            Ok(Check::Admitted) => {
                self.counters.admitted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "request admitted");
                GuardDecision::Admitted { key, marker }
            }
            Ok(Check::Rejected(reason)) => {
                let counter = match reason {
                    RejectReason::Duplicate => &self.counters.duplicates,
                    RejectReason::TokenReused => &self.counters.token_reuses,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                tracing::info!(key = %key, reason = reason.as_str(), "request rejected");
                GuardDecision::Rejected { key, reason }
            }
            Err(e) => match self.failure_policy {
                FailurePolicy::FailClosed => {
                    self.counters.unavailable.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(key = %key, op = "set_if_absent", error = %e, "idempotency check failed, rejecting");
                    GuardDecision::StoreUnavailable { key }
                }
                FailurePolicy::FailOpen => {
                    self.counters.admitted_unguarded.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(key = %key, op = "set_if_absent", error = %e, "idempotency check failed, admitting without deduplication");
                    GuardDecision::Admitted { key, marker }
                }
            },
        };

        Ok(decision)
    }

    /// Forget an admitted key so the same request can be retried, e.g.
    /// after the mutation itself failed.
    ///
    /// Only deletes while the stored marker is still `marker`, so a key that
    /// expired and was taken by a different request is left alone. The read
    /// and the delete are separate calls; an expiry landing between them can
    /// still remove a newer marker.
    pub async fn release(
        &self,
        key: &IdempotencyKey,
        marker: &Fingerprint,
    ) -> Result<bool, StoreError> {
        let store_key = key.store_key();
        let removed = match self.store.get(&store_key).await? {
            Some(current) if current == marker.as_str() => self.store.delete(&store_key).await?,
            _ => false,
        };
        if removed {
            self.counters.released.fetch_add(1, Ordering::Relaxed);
        }
        tracing::debug!(key = %key, removed, "idempotency key released");
        Ok(removed)
    }

    pub fn stats(&self) -> GuardStats {
        GuardStats {
            admitted: self.counters.admitted.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            token_reuses: self.counters.token_reuses.load(Ordering::Relaxed),
            unavailable: self.counters.unavailable.load(Ordering::Relaxed),
            admitted_unguarded: self.counters.admitted_unguarded.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
        }
    }

    /// Conditionally write the marker. If the key is taken, compare markers.
    async fn check(&self, store_key: &str, marker: &Fingerprint) -> Result<Check, StoreError> {
        let value = Bytes::copy_from_slice(marker.as_str().as_bytes());
        let ttl = self.ttl();

        // A second round only happens when the entry expired between the
        // conditional set and the read.
        for _ in 0..2 {
            if self.store.set_if_absent(store_key, value.clone(), ttl).await? {
                return Ok(Check::Admitted);
            }
            match self.store.get(store_key).await? {
                Some(existing) if existing == marker.as_str() => {
                    return Ok(Check::Rejected(RejectReason::Duplicate))
                }
                Some(_) => return Ok(Check::Rejected(RejectReason::TokenReused)),
                None => continue,
            }
        }
        Ok(Check::Rejected(RejectReason::Duplicate))
    }

    fn derive(&self, request: &RequestDescriptor) -> (IdempotencyKey, Fingerprint) {
        let operation = request.operation();
        let body = canonical_json(&self.strip_volatile(&request.body));

        let marker = fingerprint(&[
            ("operation", operation.as_bytes()),
            ("body", body.as_slice()),
        ]);

        let mut fields: Vec<(&str, &[u8])> = vec![("operation", operation.as_bytes())];
        match &request.token {
            Some(token) => fields.push(("token", token.as_bytes())),
            None => fields.push(("body", body.as_slice())),
        }
        if self.key_scope == KeyScope::Client {
            let source = request.source.as_deref().unwrap_or_default();
            fields.push(("source", source.as_bytes()));
        }

        (IdempotencyKey(fingerprint(&fields)), marker)
    }

    fn strip_volatile(&self, body: &Value) -> Value {
        match body {
            Value::Object(map) if !self.volatile_fields.is_empty() => Value::Object(
                map.iter()
                    .filter(|(k, _)| !self.volatile_fields.iter().any(|v| v == *k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}
