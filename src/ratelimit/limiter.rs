//! Core limiter: policy check, rule matching and counting for one request.

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use super::clock::{Clock, SystemClock};
use super::counter::CounterStore;
use super::descriptor::{ClientKey, CounterKey, RequestDescriptor};
use super::policy::{PolicyDecision, PolicyEntry, PolicyTable};
use super::rules::{Rule, RuleScope, RuleSet};
use crate::config::LimitsConfig;
use crate::error::Result;

/// What to do when the limiter cannot reach a verdict from its rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Let the request through
    #[default]
    Open,
    /// Reject the request
    Closed,
}

/// Limiter behaviour switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterOptions {
    /// Applied when no rule matches a request
    #[serde(default)]
    pub unmatched: FailMode,
    /// Applied when the counter store fails
    #[serde(default)]
    pub store_failure: FailMode,
}

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    /// Client is on the allow list
    Bypassed,
    /// Client is on the deny list
    Denied,
    /// No rule applies to the request
    Unmatched,
    /// Every matched rule had quota left
    WithinLimit,
    /// A matched rule ran out of quota
    OverLimit,
    /// The counter store failed and the store failure mode is closed
    StoreUnavailable,
}

/// Result of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Why
    pub reason: DecisionReason,
    /// How long a rejected client should wait
    pub retry_after: Option<Duration>,
    /// The rejecting rule, or the rule with the least quota left
    pub matched_rule: Option<Rule>,
    /// Limit of `matched_rule`
    pub limit: Option<u64>,
    /// Requests left in the window of `matched_rule`
    pub remaining: Option<u64>,
    /// Time until the window of `matched_rule` closes
    pub reset_after: Option<Duration>,
}

impl Decision {
    fn without_rule(allowed: bool, reason: DecisionReason) -> Self {
        Self {
            allowed,
            reason,
            retry_after: None,
            matched_rule: None,
            limit: None,
            remaining: None,
            reset_after: None,
        }
    }

    fn with_rule(
        allowed: bool,
        reason: DecisionReason,
        rule: &Rule,
        remaining: u64,
        reset_after: Duration,
    ) -> Self {
        Self {
            allowed,
            reason,
            retry_after: (!allowed).then_some(reset_after),
            matched_rule: Some(rule.clone()),
            limit: Some(rule.limit()),
            remaining: Some(remaining),
            reset_after: Some(reset_after),
        }
    }

    /// Response headers describing the quota of the matched rule.
    ///
    /// Empty when no rule was evaluated.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = Vec::new();
        if let (Some(rule), Some(remaining), Some(reset_after)) =
            (&self.matched_rule, self.remaining, self.reset_after)
        {
            let reset_at = chrono::Duration::from_std(reset_after)
                .ok()
                .and_then(|d| Utc::now().checked_add_signed(d))
                .unwrap_or_else(Utc::now);

            headers.push(("X-Rate-Limit-Limit", rule.period_label().to_string()));
            headers.push(("X-Rate-Limit-Remaining", remaining.to_string()));
            headers.push(("X-Rate-Limit-Reset", reset_at.to_rfc3339()));
        }
        if let Some(retry_after) = self.retry_after {
            headers.push(("Retry-After", ceil_secs(retry_after).to_string()));
        }
        headers
    }

    /// Body text for a rejection caused by an exhausted quota.
    pub fn quota_message(&self) -> Option<String> {
        match (&self.reason, &self.matched_rule) {
            (DecisionReason::OverLimit, Some(rule)) => Some(format!(
                "API calls quota exceeded! maximum admitted {} per {}.",
                rule.limit(),
                rule.period_label()
            )),
            _ => None,
        }
    }
}

/// Round a duration up to whole seconds.
pub fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

/// Rules and policies that are always replaced together.
///
/// A check reads one snapshot and uses it throughout, so it never sees new
/// rules paired with old policies or the other way round.
#[derive(Debug, Default)]
pub struct LimitsSnapshot {
    rules: Arc<RuleSet>,
    policies: Arc<PolicyTable>,
}

impl LimitsSnapshot {
    /// Pair a rule set with a policy table.
    pub fn new(rules: RuleSet, policies: PolicyTable) -> Self {
        Self {
            rules: Arc::new(rules),
            policies: Arc::new(policies),
        }
    }

    /// Validate a whole limits file.
    pub fn from_config(limits: &LimitsConfig) -> Result<Self> {
        let rules = RuleSet::from_configs(&limits.rules, &limits.endpoint_whitelist)?;
        let policies = PolicyTable::build(limits.policies.clone())?;
        Ok(Self::new(rules, policies))
    }

    /// Rule set of this snapshot.
    pub fn rules(&self) -> &Arc<RuleSet> {
        &self.rules
    }

    /// Policy table of this snapshot.
    pub fn policies(&self) -> &Arc<PolicyTable> {
        &self.policies
    }

    fn with_policies(&self, policies: PolicyTable) -> Self {
        Self {
            rules: self.rules.clone(),
            policies: Arc::new(policies),
        }
    }
}

/// The rate limiter engine.
///
/// Rules and policies are held as one immutable snapshot behind a single
/// lock and swapped whole on reload or policy update; counters live in a
/// pluggable [`CounterStore`]. The limiter is `Send + Sync` and meant to be
/// shared behind an `Arc`.
pub struct Limiter {
    limits: RwLock<Arc<LimitsSnapshot>>,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    options: LimiterOptions,
}

impl Limiter {
    /// Create a limiter over the given rules, policies and store.
    pub fn new(rules: RuleSet, policies: PolicyTable, store: Arc<dyn CounterStore>) -> Self {
        Self {
            limits: RwLock::new(Arc::new(LimitsSnapshot::new(rules, policies))),
            store,
            clock: Arc::new(SystemClock),
            options: LimiterOptions::default(),
        }
    }

    /// Build a limiter from a parsed limits file.
    pub fn from_config(limits: &LimitsConfig, store: Arc<dyn CounterStore>) -> Result<Self> {
        let snapshot = LimitsSnapshot::from_config(limits)?;
        info!(
            rules = snapshot.rules.len(),
            policies = snapshot.policies.len(),
            "Rate limiter configured"
        );
        Ok(Self {
            limits: RwLock::new(Arc::new(snapshot)),
            store,
            clock: Arc::new(SystemClock),
            options: LimiterOptions::default(),
        })
    }

    /// Use a different time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use different failure modes.
    pub fn with_options(mut self, options: LimiterOptions) -> Self {
        self.options = options;
        self
    }

    /// Check a request given as its parts.
    pub async fn check_limit(&self, client: impl Into<ClientKey>, path: &str, method: &str) -> Decision {
        self.check(&RequestDescriptor::new(client, path, method)).await
    }

    /// Decide whether a request may proceed, counting it against every
    /// matching rule.
    pub async fn check(&self, request: &RequestDescriptor) -> Decision {
        let now = self.clock.now();
        trace!(request = %request, "Checking rate limit");

        let limits = self.snapshot();
        let policy = limits.policies.resolve(&request.client);
        trace!(client = %request.client, policy = ?policy, "Resolved client policy");

        match policy {
            PolicyDecision::Deny => {
                debug!(client = %request.client, "Client denied by policy");
                Decision::without_rule(false, DecisionReason::Denied)
            }
            PolicyDecision::Allow => {
                trace!(client = %request.client, "Client bypasses rate limits");
                Decision::without_rule(true, DecisionReason::Bypassed)
            }
            _ if limits.rules.is_whitelisted(&request.method, &request.path) => {
                trace!(request = %request, "Endpoint is whitelisted");
                Decision::without_rule(true, DecisionReason::Bypassed)
            }
            PolicyDecision::UseRule(rule) => {
                if rule.matches(request) {
                    self.evaluate(request, &[&rule], now).await
                } else {
                    self.unmatched(request)
                }
            }
            PolicyDecision::None => {
                let matched = limits.rules.matching(request);
                if matched.is_empty() {
                    self.unmatched(request)
                } else {
                    self.evaluate(request, &matched, now).await
                }
            }
        }
    }

    /// Count the request against each rule, most specific first, and stop at
    /// the first rule that is over its limit.
    async fn evaluate(&self, request: &RequestDescriptor, rules: &[&Rule], now: Instant) -> Decision {
        let mut tightest: Option<(&Rule, u64, Duration)> = None;

        for &rule in rules {
            let key = counter_key(&request.client, rule);

            let (remaining, reset_after) = match self.store.increment_and_check(&key, rule, now).await {
                Ok(snapshot) => {
                    let reset_after = snapshot.remaining_window(now);
                    trace!(key = %key, count = snapshot.count, limit = rule.limit(), "Rule evaluated");

                    if snapshot.count > rule.limit() {
                        debug!(
                            client = %request.client,
                            rule = %rule.id(),
                            count = snapshot.count,
                            limit = rule.limit(),
                            retry_after_ms = u64::try_from(reset_after.as_millis()).unwrap_or(u64::MAX),
                            "Rate limit exceeded"
                        );
                        return Decision::with_rule(false, DecisionReason::OverLimit, rule, 0, reset_after);
                    }
                    (rule.limit() - snapshot.count, reset_after)
                }
                Err(e) => match self.options.store_failure {
                    FailMode::Open => {
                        warn!(
                            error = %e,
                            key = %key,
                            "Counter store unavailable, failing open"
                        );
                        (rule.limit(), rule.period())
                    }
                    FailMode::Closed => {
                        warn!(
                            error = %e,
                            key = %key,
                            "Counter store unavailable, failing closed"
                        );
                        return Decision::with_rule(
                            false,
                            DecisionReason::StoreUnavailable,
                            rule,
                            0,
                            rule.period(),
                        );
                    }
                },
            };

            if tightest.map_or(true, |(_, least, _)| remaining < least) {
                tightest = Some((rule, remaining, reset_after));
            }
        }

        match tightest {
            Some((rule, remaining, reset_after)) => {
                Decision::with_rule(true, DecisionReason::WithinLimit, rule, remaining, reset_after)
            }
            None => self.unmatched(request),
        }
    }

    fn unmatched(&self, request: &RequestDescriptor) -> Decision {
        match self.options.unmatched {
            FailMode::Open => {
                trace!(request = %request, "No rule matched, allowing");
                Decision::without_rule(true, DecisionReason::Unmatched)
            }
            FailMode::Closed => {
                warn!(request = %request, "No rule matched, rejecting");
                Decision::without_rule(false, DecisionReason::Unmatched)
            }
        }
    }

    /// Clear the counters a request would be counted against.
    ///
    /// Returns how many counters were reset.
    pub async fn reset_client(&self, request: &RequestDescriptor) -> Result<usize> {
        let limits = self.snapshot();
        let keys: Vec<CounterKey> = match limits.policies.resolve(&request.client) {
            PolicyDecision::UseRule(rule) if rule.matches(request) => {
                vec![counter_key(&request.client, &rule)]
            }
            PolicyDecision::None => limits
                .rules
                .matching(request)
                .into_iter()
                .map(|rule| counter_key(&request.client, rule))
                .collect(),
            _ => Vec::new(),
        };

        for key in &keys {
            self.store.reset(key).await?;
        }
        info!(request = %request, counters = keys.len(), "Counters reset");
        Ok(keys.len())
    }

    /// Validate a new limits file and swap it in.
    ///
    /// Nothing changes if any rule or policy is invalid. Rules and policies
    /// are replaced in one step.
    pub fn reload(&self, limits: &LimitsConfig) -> Result<()> {
        let snapshot = LimitsSnapshot::from_config(limits)?;

        let rule_count = snapshot.rules.len();
        let policy_count = snapshot.policies.len();
        *self.limits.write() = Arc::new(snapshot);

        info!(rules = rule_count, policies = policy_count, "Rate limit configuration reloaded");
        Ok(())
    }

    /// Add a client policy, or replace the existing one for the same client.
    pub fn upsert_policy(&self, entry: PolicyEntry) -> Result<()> {
        let mut limits = self.limits.write();
        let client = entry.client.clone();
        let policies = limits.policies.with_entry(entry)?;
        *limits = Arc::new(limits.with_policies(policies));
        info!(client = %client, "Client policy updated");
        Ok(())
    }

    /// Remove the policy for a client. Returns whether one existed.
    pub fn remove_policy(&self, client: &str) -> Result<bool> {
        let mut limits = self.limits.write();
        let Some(policies) = limits.policies.without_client(client)? else {
            return Ok(false);
        };
        *limits = Arc::new(limits.with_policies(policies));
        info!(client = %client, "Client policy removed");
        Ok(true)
    }

    /// Replace every client policy, keeping the rules.
    pub fn replace_policies(&self, entries: Vec<PolicyEntry>) -> Result<()> {
        let policies = PolicyTable::build(entries)?;
        let mut limits = self.limits.write();
        info!(policies = policies.len(), "Replacing client policies");
        *limits = Arc::new(limits.with_policies(policies));
        Ok(())
    }

    /// Current rules and policies.
    pub fn snapshot(&self) -> Arc<LimitsSnapshot> {
        self.limits.read().clone()
    }

    /// Current rule set.
    pub fn rules(&self) -> Arc<RuleSet> {
        self.snapshot().rules.clone()
    }

    /// Current client policies, in declaration order.
    pub fn policy_entries(&self) -> Vec<PolicyEntry> {
        self.snapshot().policies.entries().to_vec()
    }

    /// Counter store.
    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    /// Time source.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Failure modes in effect.
    pub fn options(&self) -> LimiterOptions {
        self.options
    }
}

fn counter_key(client: &ClientKey, rule: &Rule) -> CounterKey {
    match rule.scope() {
        RuleScope::PerClient => CounterKey::per_client(client.clone(), rule.id().clone()),
        RuleScope::Global => CounterKey::global(rule.id().clone()),
    }
}
