use ratewarden::config::LimitsConfig;
use ratewarden::ratelimit::{
    ClientKey, CounterKey, CounterStore, DecisionReason, ExpirySweeper, Limiter, ManualClock,
    MemoryCounterStore, PolicyAction, PolicyEntry, RequestDescriptor, RuleConfig, RuleScope,
    RuleSet,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

fn limiter_with(limits: &LimitsConfig) -> (Arc<Limiter>, Arc<MemoryCounterStore>, ManualClock) {
    let store = Arc::new(MemoryCounterStore::new());
    let clock = ManualClock::default();
    let limiter = assert_ok!(Limiter::from_config(limits, store.clone()))
        .with_clock(Arc::new(clock.clone()));
    (Arc::new(limiter), store, clock)
}

fn rules(rules: Vec<RuleConfig>) -> LimitsConfig {
    LimitsConfig {
        rules,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_api_prefix_five_per_minute() {
    let (limiter, _store, clock) = limiter_with(&rules(vec![RuleConfig::new("/api/*", "60s", 5)]));

    for _ in 0..5 {
        let decision = limiter.check_limit("A", "/api/test", "GET").await;
        assert!(decision.allowed);
        clock.advance(Duration::from_secs(2));
    }

    // Ten seconds into the window
    let decision = limiter.check_limit("A", "/api/test", "GET").await;
    assert!(!decision.allowed);
    assert_eq!(decision.reason, DecisionReason::OverLimit);
    assert_eq!(decision.retry_after, Some(Duration::from_secs(50)));
    assert_eq!(decision.remaining, Some(0));

    let headers = decision.headers();
    assert!(headers.contains(&("Retry-After", "50".to_string())));
    assert!(headers.contains(&("X-Rate-Limit-Limit", "60s".to_string())));

    // Paths outside the prefix are not limited
    let decision = limiter.check_limit("A", "/apiary", "GET").await;
    assert!(decision.allowed);
    assert_eq!(decision.reason, DecisionReason::Unmatched);
}

#[tokio::test]
async fn test_denied_client_creates_no_counter() {
    let limits = LimitsConfig {
        rules: vec![
            RuleConfig::new("*", "1s", 100),
            RuleConfig::new("/api/*", "1m", 100).with_scope(RuleScope::Global),
        ],
        policies: vec![PolicyEntry::new("B", PolicyAction::Deny)],
        endpoint_whitelist: Vec::new(),
    };
    let (limiter, store, _clock) = limiter_with(&limits);

    for (path, method) in [("/api/test", "GET"), ("/", "POST"), ("/other", "DELETE")] {
        let decision = limiter.check_limit("B", path, method).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DecisionReason::Denied);
        assert!(decision.matched_rule.is_none());
    }
    assert!(store.is_empty());

    assert!(limiter.check_limit("C", "/api/test", "GET").await.allowed);
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn test_sweep_after_expiry_starts_fresh_window() {
    let (limiter, store, clock) = limiter_with(&rules(vec![RuleConfig::new("*", "10s", 3)]));
    let rule = limiter.rules().rules()[0].clone();
    let key = CounterKey::per_client(ClientKey::new("A"), rule.id().clone());
    let sweeper = ExpirySweeper::new(store.clone(), limiter.clock(), Duration::from_secs(10));

    for _ in 0..3 {
        assert!(limiter.check_limit("A", "/", "GET").await.allowed);
    }
    assert_eq!(store.get(&key).map(|entry| entry.count()), Some(3));

    clock.advance(Duration::from_secs(9));
    assert_eq!(sweeper.sweep_once().await, 0);

    clock.advance(Duration::from_secs(1));
    assert_eq!(sweeper.sweep_once().await, 1);
    assert!(store.get(&key).is_none());

    let decision = limiter.check_limit("A", "/", "GET").await;
    assert!(decision.allowed);
    assert_eq!(decision.remaining, Some(2));
    assert_eq!(store.get(&key).map(|entry| entry.count()), Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_are_counted_exactly() {
    let (limiter, store, _clock) = limiter_with(&rules(vec![RuleConfig::new("*", "1m", 50)]));
    let rule = limiter.rules().rules()[0].clone();

    let tasks: Vec<_> = (0..200)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.check_limit("A", "/", "GET").await.allowed })
        })
        .collect();

    let mut allowed = 0;
    for task in futures::future::join_all(tasks).await {
        if task.unwrap() {
            allowed += 1;
        }
    }

    assert_eq!(allowed, 50);
    let key = CounterKey::per_client(ClientKey::new("A"), rule.id().clone());
    assert_eq!(store.get(&key).map(|entry| entry.count()), Some(200));
}

#[test]
fn test_rule_order_is_independent_of_declaration_order() {
    let configs = vec![
        RuleConfig::new("*", "1m", 1),
        RuleConfig::new("/api/*", "1m", 2),
        RuleConfig::new("/api/users", "1m", 3),
        RuleConfig::new("get:/api/users", "1m", 4),
    ];
    let mut reversed = configs.clone();
    reversed.reverse();

    let limits_of = |set: &RuleSet| set.rules().iter().map(|rule| rule.limit()).collect::<Vec<_>>();
    let forward = assert_ok!(RuleSet::from_configs(&configs, &[]));
    let backward = assert_ok!(RuleSet::from_configs(&reversed, &[]));

    assert_eq!(limits_of(&forward), vec![4, 3, 2, 1]);
    assert_eq!(limits_of(&forward), limits_of(&backward));

    let request = RequestDescriptor::new("A", "/api/users", "GET");
    let matched: Vec<u64> = forward.matching(&request).iter().map(|rule| rule.limit()).collect();
    assert_eq!(matched, vec![4, 3, 2, 1]);

    let request = RequestDescriptor::new("A", "/api/users", "POST");
    let matched: Vec<u64> = forward.matching(&request).iter().map(|rule| rule.limit()).collect();
    assert_eq!(matched, vec![3, 2, 1]);
}

#[tokio::test]
async fn test_reload_from_yaml_applies_new_policies() {
    let (limiter, _store, _clock) = limiter_with(&rules(vec![RuleConfig::new("*", "1m", 1)]));
    assert!(limiter.check_limit("10.1.2.3", "/", "GET").await.allowed);
    assert!(!limiter.check_limit("10.1.2.3", "/", "GET").await.allowed);

    let limits = assert_ok!(LimitsConfig::from_yaml(
        r#"
rules:
  - endpoint: "*"
    period: 1m
    limit: 1
policies:
  - client: 10.0.0.0/8
    action: allow
"#,
    ));
    assert_ok!(limiter.reload(&limits));

    let decision = limiter.check_limit("10.1.2.3", "/", "GET").await;
    assert!(decision.allowed);
    assert_eq!(decision.reason, DecisionReason::Bypassed);
}
