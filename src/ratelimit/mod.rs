//! Rate limiting logic and state management.

mod clock;
mod counter;
mod descriptor;
mod limiter;
mod policy;
pub mod redis;
mod rules;
mod sweeper;

pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{CounterEntry, CounterSnapshot, CounterStore, MemoryCounterStore, StoreError};
pub use descriptor::{ClientKey, CounterKey, RequestDescriptor};
pub use limiter::{
    ceil_secs, Decision, DecisionReason, FailMode, Limiter, LimiterOptions, LimitsSnapshot,
};
pub use policy::{PolicyAction, PolicyDecision, PolicyEntry, PolicyTable};
pub use self::redis::RedisCounterStore;
pub use rules::{
    parse_period, EndpointPattern, PathPattern, Rule, RuleConfig, RuleId, RuleScope, RuleSet,
    Specificity, TimeUnit, MAX_PERIOD,
};
pub use sweeper::{ExpirySweeper, MIN_SWEEP_INTERVAL};
