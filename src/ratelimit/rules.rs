//! Rate limit rules and request matching.
//!
//! Rules are declared against endpoint patterns of the form `verb:path`,
//! where either half may be a wildcard and the path may end in `/*` to cover a
//! whole subtree. A loaded [`RuleSet`] is immutable and keeps its rules sorted
//! from most to least specific, so matching is a single ordered scan.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::descriptor::RequestDescriptor;
use crate::error::{RatewardenError, Result};

/// Rule definition as written in the limits file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Endpoint pattern, e.g. `get:/api/*`, `/api/test` or `*`
    pub endpoint: String,
    /// Window length, e.g. `1s`, `15m`, `12h`, `7d`
    pub period: String,
    /// Number of requests admitted per window
    pub limit: u64,
    /// Whether the counter is shared by all clients or kept per client
    #[serde(default)]
    pub scope: RuleScope,
}

impl RuleConfig {
    /// Shorthand constructor for a per-client rule.
    pub fn new(endpoint: impl Into<String>, period: impl Into<String>, limit: u64) -> Self {
        Self {
            endpoint: endpoint.into(),
            period: period.into(),
            limit,
            scope: RuleScope::PerClient,
        }
    }

    /// Builder-style scope setter.
    pub fn with_scope(mut self, scope: RuleScope) -> Self {
        self.scope = scope;
        self
    }
}

/// Counter scope of a rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    /// One counter shared by every client
    Global,
    /// One counter per client key
    #[default]
    PerClient,
}

impl fmt::Display for RuleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleScope::Global => f.write_str("global"),
            RuleScope::PerClient => f.write_str("per_client"),
        }
    }
}

/// Time unit accepted in period strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "s" => Some(TimeUnit::Second),
            "m" => Some(TimeUnit::Minute),
            "h" => Some(TimeUnit::Hour),
            "d" => Some(TimeUnit::Day),
            _ => None,
        }
    }

    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// Longest accepted rule period.
pub const MAX_PERIOD: Duration = Duration::from_secs(365 * 86400);

/// Parse a period string such as `30s` or `1h`.
///
/// Periods must be between one second and [`MAX_PERIOD`].
pub fn parse_period(period: &str) -> Result<Duration> {
    let period = period.trim().to_ascii_lowercase();
    let split = period
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| RatewardenError::Config(format!("Period '{}' has no unit", period)))?;
    let (amount, suffix) = period.split_at(split);

    let amount: u64 = amount
        .parse()
        .map_err(|_| RatewardenError::Config(format!("Invalid period amount in '{}'", period)))?;
    let unit = TimeUnit::from_suffix(suffix)
        .ok_or_else(|| RatewardenError::Config(format!("Invalid period unit in '{}'", period)))?;

    if amount == 0 {
        return Err(RatewardenError::Config(format!(
            "Period '{}' must be greater than zero",
            period
        )));
    }

    unit.duration()
        .as_secs()
        .checked_mul(amount)
        .map(Duration::from_secs)
        .filter(|duration| *duration <= MAX_PERIOD)
        .ok_or_else(|| {
            RatewardenError::Config(format!(
                "Period '{}' is longer than {} days",
                period,
                MAX_PERIOD.as_secs() / 86400
            ))
        })
}

/// Path half of an endpoint pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathPattern {
    /// `*`: every path
    Any,
    /// `/a/b`: exactly this path
    Exact(String),
    /// `/a/*`: `/a` itself and everything below it
    Prefix(String),
}

impl PathPattern {
    fn parse(path: &str) -> Result<Self> {
        if path == "*" {
            return Ok(PathPattern::Any);
        }
        let path = if path.len() > 1 {
            path.trim_end_matches('/')
        } else {
            path
        };
        if !path.starts_with('/') {
            return Err(RatewardenError::Config(format!(
                "Path pattern '{}' must start with '/' or be '*'",
                path
            )));
        }

        match path.strip_suffix("/*") {
            Some(base) if !base.contains('*') => Ok(PathPattern::Prefix(normalize_path(base))),
            Some(_) => Err(wildcard_error(path)),
            None if path.contains('*') => Err(wildcard_error(path)),
            None => Ok(PathPattern::Exact(normalize_path(path))),
        }
    }

    fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Any => true,
            PathPattern::Exact(exact) => exact == path,
            PathPattern::Prefix(base) => {
                path == base
                    || (path.len() > base.len()
                        && path.starts_with(base.as_str())
                        && path.as_bytes()[base.len()] == b'/')
            }
        }
    }

    fn literal_len(&self) -> usize {
        match self {
            PathPattern::Any => 0,
            PathPattern::Exact(p) | PathPattern::Prefix(p) => p.len(),
        }
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathPattern::Any => f.write_str("*"),
            PathPattern::Exact(p) => f.write_str(p),
            PathPattern::Prefix(p) => write!(f, "{}/*", p),
        }
    }
}

fn wildcard_error(path: &str) -> RatewardenError {
    RatewardenError::Config(format!(
        "Path pattern '{}' may only use '*' as its final segment",
        path
    ))
}

/// Lowercase and drop a trailing slash, keeping the root as `/`.
pub(crate) fn normalize_path(path: &str) -> String {
    let lowered = path.to_ascii_lowercase();
    match lowered.trim_end_matches('/') {
        "" if lowered.starts_with('/') => "/".to_string(),
        trimmed => trimmed.to_string(),
    }
}

/// How precisely a pattern pins down a request.
///
/// Compared field by field: a longer literal path beats a shorter one, an
/// exact path beats a prefix of the same length, and an exact verb beats `*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Specificity {
    pub literal_len: usize,
    pub exact_path: bool,
    pub exact_verb: bool,
}

/// A parsed `verb:path` pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointPattern {
    /// Lowercase verb, `None` for any verb
    pub verb: Option<String>,
    /// Path matcher
    pub path: PathPattern,
}

impl EndpointPattern {
    /// Parse an endpoint pattern.
    pub fn parse(pattern: &str) -> Result<Self> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(RatewardenError::Config("Endpoint pattern is empty".to_string()));
        }

        let (verb, path) = match pattern.split_once(':') {
            Some((verb, path)) => (verb.trim(), path.trim()),
            None if pattern == "*" => ("*", "*"),
            None => ("*", pattern),
        };

        let verb = match verb {
            "*" => None,
            v if !v.is_empty() && v.chars().all(|c| c.is_ascii_alphabetic()) => {
                Some(v.to_ascii_lowercase())
            }
            v => {
                return Err(RatewardenError::Config(format!(
                    "Invalid verb '{}' in endpoint pattern '{}'",
                    v, pattern
                )))
            }
        };

        Ok(Self {
            verb,
            path: PathPattern::parse(path)?,
        })
    }

    /// Check whether a normalized method and path match this pattern.
    fn matches_normalized(&self, method: &str, path: &str) -> bool {
        let verb_matches = match &self.verb {
            Some(v) => v == method,
            None => true,
        };
        verb_matches && self.path.matches(path)
    }

    /// Check whether a request matches this pattern.
    pub fn matches(&self, method: &str, path: &str) -> bool {
        self.matches_normalized(&method.to_ascii_lowercase(), &normalize_path(path))
    }

    /// Specificity of this pattern.
    pub fn specificity(&self) -> Specificity {
        Specificity {
            literal_len: self.path.literal_len(),
            exact_path: matches!(self.path, PathPattern::Exact(_)),
            exact_verb: self.verb.is_some(),
        }
    }
}

impl fmt::Display for EndpointPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.verb.as_deref().unwrap_or("*"), self.path)
    }
}

/// Stable identity of a rule, used to key counters.
///
/// Built from the normalized pattern, period and scope, so the same rule keeps
/// its counters across a configuration reload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(Arc<str>);

impl RuleId {
    /// The raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RuleId {
    fn from(id: &str) -> Self {
        Self(Arc::from(id))
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated rate limit rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    id: RuleId,
    pattern: EndpointPattern,
    period: Duration,
    period_label: String,
    limit: u64,
    scope: RuleScope,
}

impl Rule {
    /// Validate a rule definition.
    pub fn from_config(config: &RuleConfig) -> Result<Self> {
        let pattern = EndpointPattern::parse(&config.endpoint)?;
        let period = parse_period(&config.period)?;
        if config.limit == 0 {
            return Err(RatewardenError::Config(format!(
                "Rule '{}' must admit at least one request per period",
                config.endpoint
            )));
        }

        let period_label = config.period.trim().to_ascii_lowercase();
        let id = RuleId(Arc::from(format!(
            "{}|{}|{}",
            pattern, period_label, config.scope
        )));

        Ok(Self {
            id,
            pattern,
            period,
            period_label,
            limit: config.limit,
            scope: config.scope,
        })
    }

    /// Stable rule identity.
    pub fn id(&self) -> &RuleId {
        &self.id
    }

    /// Endpoint pattern.
    pub fn pattern(&self) -> &EndpointPattern {
        &self.pattern
    }

    /// Window length.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Window length as written, e.g. `1m`.
    pub fn period_label(&self) -> &str {
        &self.period_label
    }

    /// Requests admitted per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Counter scope.
    pub fn scope(&self) -> RuleScope {
        self.scope
    }

    /// Check whether a request falls under this rule.
    pub fn matches(&self, request: &RequestDescriptor) -> bool {
        self.pattern.matches(&request.method, &request.path)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} per {} ({})",
            self.pattern, self.limit, self.period_label, self.scope
        )
    }
}

/// An immutable, specificity-ordered table of rules.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
    whitelist: Vec<EndpointPattern>,
}

impl RuleSet {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate rule definitions and build the lookup table.
    ///
    /// Fails on the first malformed pattern or period, and on any two rules
    /// that share the same pattern and scope.
    pub fn from_configs(configs: &[RuleConfig], whitelist: &[String]) -> Result<Self> {
        let mut seen = HashSet::with_capacity(configs.len());
        let mut rules = Vec::with_capacity(configs.len());

        for config in configs {
            let rule = Rule::from_config(config)?;
            if !seen.insert((rule.pattern.clone(), rule.scope)) {
                return Err(RatewardenError::Config(format!(
                    "Duplicate rule for '{}' ({})",
                    rule.pattern, rule.scope
                )));
            }
            rules.push(rule);
        }

        // Stable sort, so equally specific rules keep declaration order.
        rules.sort_by(|a, b| compare_specificity(b, a));

        let whitelist = whitelist
            .iter()
            .map(|pattern| EndpointPattern::parse(pattern))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { rules, whitelist })
    }

    /// Find the rules that apply to a request, most specific first.
    ///
    /// Returns an empty list when nothing matches or the endpoint is
    /// whitelisted.
    pub fn matching(&self, request: &RequestDescriptor) -> Vec<&Rule> {
        let method = request.method.to_ascii_lowercase();
        let path = normalize_path(&request.path);

        if self
            .whitelist
            .iter()
            .any(|pattern| pattern.matches_normalized(&method, &path))
        {
            return Vec::new();
        }

        self.rules
            .iter()
            .filter(|rule| rule.pattern.matches_normalized(&method, &path))
            .collect()
    }

    /// Check whether an endpoint is exempt from all rules.
    pub fn is_whitelisted(&self, method: &str, path: &str) -> bool {
        self.whitelist.iter().any(|pattern| pattern.matches(method, path))
    }

    /// All rules, most specific first.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Shortest window among all rules.
    pub fn shortest_period(&self) -> Option<Duration> {
        self.rules.iter().map(Rule::period).min()
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the set holds no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn compare_specificity(a: &Rule, b: &Rule) -> Ordering {
    a.pattern.specificity().cmp(&b.pattern.specificity())
}
