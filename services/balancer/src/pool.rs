//! Instance pool with failure backoff.
//!
//! Instances are either *active* (eligible for immediate selection) or
//! *retrying* (backed off after a failure, ordered by the time they become
//! eligible again). Each failure schedules a retry after the current
//! interval and multiplies the interval for next time; an instance that
//! keeps failing past `max_failures` is abandoned until it reappears in a
//! membership update.
//!
//! Selection is uniformly random among active instances. When none are
//! active, a random retrying instance is offered instead, so degraded
//! traffic still flows.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use ferry_model::Instance;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Default delay before a failed instance is retried.
pub const DEFAULT_BASE_INTERVAL: Duration = Duration::from_secs(1);

/// Default growth of the retry delay per failure.
pub const DEFAULT_BACKOFF_FACTOR: u32 = 2;

/// Default consecutive failures tolerated before abandonment.
pub const DEFAULT_MAX_FAILURES: u32 = 8;

/// Default period of the reactivation timer.
pub const DEFAULT_REACTIVATE_EVERY: Duration = Duration::from_secs(1);

/// Upper bound on any single retry delay.
const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Retry delay after the first failure.
    pub base_interval: Duration,
    /// Multiplier applied to the delay on each failure.
    pub factor: u32,
    /// Consecutive failures after which an instance is abandoned.
    pub max_failures: u32,
    /// How often retrying instances are checked for reactivation.
    pub reactivate_every: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            base_interval: DEFAULT_BASE_INTERVAL,
            factor: DEFAULT_BACKOFF_FACTOR,
            max_failures: DEFAULT_MAX_FAILURES,
            reactivate_every: DEFAULT_REACTIVATE_EVERY,
        }
    }
}

/// Where an instance currently sits in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Active,
    Retrying,
    Abandoned,
}

#[derive(Debug)]
struct Entry {
    state: InstanceState,
    /// Delay used by the next failure.
    retry_interval: Duration,
    /// Failures since the last success.
    failures: u32,
    retry_at: Option<Instant>,
}

impl Entry {
    fn fresh(base: Duration) -> Self {
        Self {
            state: InstanceState::Active,
            retry_interval: base,
            failures: 0,
            retry_at: None,
        }
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Scheduled {
    at: Instant,
    instance: Instance,
}

#[derive(Debug, Default)]
struct PoolState {
    /// Every member of the latest update, abandoned ones included.
    entries: HashMap<Instance, Entry>,
    active: Vec<Instance>,
    retry: BinaryHeap<Reverse<Scheduled>>,
}

/// Backend instances of one service.
///
/// Shared by every connection task of the service's forwarder and by the
/// reactivation timer.
#[derive(Debug)]
pub struct InstancePool {
    service: String,
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl InstancePool {
    /// Create an empty pool.
    pub fn new(service: impl Into<String>, config: PoolConfig) -> Self {
        Self {
            service: service.into(),
            config,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Replace pool membership.
    ///
    /// Instances present before and after keep their backoff state.
    /// Abandoned instances that are still listed start over as new.
    pub fn update_instances(&self, instances: &[Instance]) {
        let wanted: HashSet<&Instance> = instances.iter().collect();
        let mut state = self.lock();

        state.entries.retain(|inst, _| wanted.contains(inst));
        state.active.retain(|inst| wanted.contains(inst));
        state.retry.retain(|Reverse(s)| wanted.contains(&s.instance));

        let base = self.config.base_interval;
        let PoolState {
            entries, active, ..
        } = &mut *state;
        for inst in instances {
            match entries.get_mut(inst) {
                Some(entry) if entry.state == InstanceState::Abandoned => {
                    *entry = Entry::fresh(base);
                    active.push(inst.clone());
                }
                Some(_) => {}
                None => {
                    entries.insert(inst.clone(), Entry::fresh(base));
                    active.push(inst.clone());
                }
            }
        }

        debug!(
            service = %self.service,
            active = state.active.len(),
            retrying = state.retry.len(),
            "Updated instance pool"
        );
    }

    /// Choose an instance for a new connection.
    ///
    /// An active instance with failures on record is failed again right
    /// away, so concurrent callers move on to other instances until the
    /// caller that picked it reports success.
    pub fn pick_instance(&self) -> Option<Instance> {
        let mut rng = rand::rng();
        let mut state = self.lock();

        if !state.active.is_empty() {
            let idx = rng.random_range(0..state.active.len());
            let inst = state.active[idx].clone();
            let failing = state
                .entries
                .get(&inst)
                .is_some_and(|entry| entry.failures > 0);
            if failing {
                self.fail_locked(&mut state, &inst, Instant::now());
            }
            return Some(inst);
        }

        if state.retry.is_empty() {
            return None;
        }

        let idx = rng.random_range(0..state.retry.len());
        state
            .retry
            .iter()
            .nth(idx)
            .map(|Reverse(s)| s.instance.clone())
    }

    /// Record a successful connection to `inst`.
    pub fn succeeded(&self, inst: &Instance) {
        let mut state = self.lock();
        let base = self.config.base_interval;

        let Some(entry) = state.entries.get_mut(inst) else {
            return;
        };
        let previous = entry.state;
        entry.state = InstanceState::Active;
        entry.retry_interval = base;
        entry.failures = 0;
        entry.retry_at = None;

        match previous {
            InstanceState::Active => {}
            InstanceState::Retrying => {
                state.retry.retain(|Reverse(s)| &s.instance != inst);
                state.active.push(inst.clone());
            }
            InstanceState::Abandoned => {
                state.active.push(inst.clone());
            }
        }
    }

    /// Record a failed connection to `inst`.
    ///
    /// Only active instances move; failing one that is already retrying
    /// is a no-op.
    pub fn failed(&self, inst: &Instance) {
        self.failed_at(inst, Instant::now());
    }

    pub(crate) fn failed_at(&self, inst: &Instance, now: Instant) {
        let mut state = self.lock();
        self.fail_locked(&mut state, inst, now);
    }

    /// Move every retrying instance due at or before `now` back to active.
    ///
    /// Reactivated instances keep their grown interval and failure count,
    /// so another failure backs them off further.
    pub fn reactivate_retries(&self, now: Instant) -> usize {
        let mut state = self.lock();
        let mut reactivated = 0;

        while state
            .retry
            .peek()
            .is_some_and(|Reverse(s)| s.at <= now)
        {
            let Some(Reverse(scheduled)) = state.retry.pop() else {
                break;
            };
            if let Some(entry) = state.entries.get_mut(&scheduled.instance) {
                entry.state = InstanceState::Active;
                entry.retry_at = None;
            }
            state.active.push(scheduled.instance);
            reactivated += 1;
        }

        if reactivated > 0 {
            debug!(service = %self.service, reactivated, "Reactivated instances");
        }
        reactivated
    }

    /// Run [`reactivate_retries`](Self::reactivate_retries) periodically
    /// until `shutdown` fires.
    pub fn spawn_reactivation(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.reactivate_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.reactivate_retries(Instant::now());
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!(service = %pool.service, "Reactivation timer stopped");
        })
    }

    /// Members that are active or retrying.
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.active.len() + state.retry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_len(&self) -> usize {
        self.lock().active.len()
    }

    pub fn retry_len(&self) -> usize {
        self.lock().retry.len()
    }

    /// True when `inst` is active or retrying.
    pub fn contains(&self, inst: &Instance) -> bool {
        matches!(
            self.state_of(inst),
            Some(InstanceState::Active | InstanceState::Retrying)
        )
    }

    /// State of `inst`, or `None` if it is not a member.
    pub fn state_of(&self, inst: &Instance) -> Option<InstanceState> {
        self.lock().entries.get(inst).map(|entry| entry.state)
    }

    /// Delay the next failure of `inst` would schedule.
    pub fn retry_interval(&self, inst: &Instance) -> Option<Duration> {
        self.lock().entries.get(inst).map(|entry| entry.retry_interval)
    }

    /// When a retrying `inst` becomes eligible again.
    pub fn retry_at(&self, inst: &Instance) -> Option<Instant> {
        self.lock().entries.get(inst).and_then(|entry| entry.retry_at)
    }

    fn fail_locked(&self, state: &mut PoolState, inst: &Instance, now: Instant) {
        let Some(entry) = state.entries.get_mut(inst) else {
            return;
        };
        if entry.state != InstanceState::Active {
            return;
        }

        entry.failures += 1;
        if entry.failures > self.config.max_failures {
            entry.state = InstanceState::Abandoned;
            entry.retry_at = None;
            state.active.retain(|a| a != inst);
            info!(
                service = %self.service,
                instance = %inst,
                failures = self.config.max_failures,
                "Abandoning instance until it is rediscovered"
            );
            return;
        }

        let delay = entry.retry_interval;
        let at = now + delay;
        entry.state = InstanceState::Retrying;
        entry.retry_at = Some(at);
        entry.retry_interval = delay
            .checked_mul(self.config.factor)
            .map_or(MAX_RETRY_INTERVAL, |d| d.min(MAX_RETRY_INTERVAL));

        state.active.retain(|a| a != inst);
        state.retry.push(Reverse(Scheduled {
            at,
            instance: inst.clone(),
        }));

        warn!(
            service = %self.service,
            instance = %inst,
            retry_in_ms = delay.as_millis() as u64,
            "Instance failed, backing off"
        );
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn inst(n: u16) -> Instance {
        Instance::new(
            format!("inst-{}", n),
            format!("10.0.0.{}:8080", n).parse().unwrap(),
        )
    }

    fn pool() -> InstancePool {
        InstancePool::new("svc", PoolConfig::default())
    }

    #[test]
    fn test_pick_from_empty_pool() {
        assert!(pool().pick_instance().is_none());
    }

    #[test]
    fn test_new_instances_start_active() {
        let pool = pool();
        pool.update_instances(&[inst(1), inst(2)]);
        assert_eq!(pool.active_len(), 2);
        assert_eq!(pool.retry_len(), 0);
        assert_eq!(pool.retry_interval(&inst(1)), Some(DEFAULT_BASE_INTERVAL));
    }

    #[test]
    fn test_update_preserves_retry_state() {
        let pool = pool();
        pool.update_instances(&[inst(1), inst(2)]);
        pool.failed(&inst(1));

        pool.update_instances(&[inst(1), inst(2), inst(3)]);
        assert_eq!(pool.state_of(&inst(1)), Some(InstanceState::Retrying));
        assert_eq!(pool.retry_interval(&inst(1)), Some(DEFAULT_BASE_INTERVAL * 2));
        assert_eq!(pool.active_len(), 2);
    }

    #[test]
    fn test_update_removes_absent_instances() {
        let pool = pool();
        pool.update_instances(&[inst(1), inst(2)]);
        pool.failed(&inst(2));

        pool.update_instances(&[inst(1)]);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.retry_len(), 0);
        assert!(pool.state_of(&inst(2)).is_none());

        pool.update_instances(&[]);
        assert!(pool.is_empty());
        assert!(pool.pick_instance().is_none());
    }

    #[test]
    fn test_failed_schedules_retry() {
        let pool = pool();
        pool.update_instances(&[inst(1)]);

        let now = Instant::now();
        pool.failed_at(&inst(1), now);
        assert_eq!(pool.state_of(&inst(1)), Some(InstanceState::Retrying));
        assert_eq!(pool.retry_at(&inst(1)), Some(now + DEFAULT_BASE_INTERVAL));
        assert_eq!(pool.active_len(), 0);
    }

    #[test]
    fn test_failed_on_retrying_instance_is_noop() {
        let pool = pool();
        pool.update_instances(&[inst(1)]);
        let now = Instant::now();
        pool.failed_at(&inst(1), now);
        pool.failed_at(&inst(1), now + Duration::from_millis(10));

        assert_eq!(pool.retry_len(), 1);
        assert_eq!(pool.retry_at(&inst(1)), Some(now + DEFAULT_BASE_INTERVAL));
        assert_eq!(pool.retry_interval(&inst(1)), Some(DEFAULT_BASE_INTERVAL * 2));
    }

    #[test]
    fn test_backoff_grows_by_factor() {
        let pool = pool();
        pool.update_instances(&[inst(1)]);

        let mut now = Instant::now();
        for k in 0..DEFAULT_MAX_FAILURES {
            pool.failed_at(&inst(1), now);
            let expected = DEFAULT_BASE_INTERVAL * DEFAULT_BACKOFF_FACTOR.pow(k);
            assert_eq!(pool.retry_at(&inst(1)), Some(now + expected));
            assert_eq!(
                pool.retry_interval(&inst(1)),
                Some(DEFAULT_BASE_INTERVAL * DEFAULT_BACKOFF_FACTOR.pow(k + 1))
            );

            now += expected;
            assert_eq!(pool.reactivate_retries(now), 1);
        }

        pool.failed_at(&inst(1), now);
        assert_eq!(pool.state_of(&inst(1)), Some(InstanceState::Abandoned));
        assert!(pool.is_empty());
        assert!(pool.pick_instance().is_none());
    }

    #[test]
    fn test_abandoned_instance_returns_on_update() {
        let config = PoolConfig {
            max_failures: 0,
            ..PoolConfig::default()
        };
        let pool = InstancePool::new("svc", config);
        pool.update_instances(&[inst(1)]);
        pool.failed(&inst(1));
        assert_eq!(pool.state_of(&inst(1)), Some(InstanceState::Abandoned));

        pool.update_instances(&[inst(1)]);
        assert_eq!(pool.state_of(&inst(1)), Some(InstanceState::Active));
        assert_eq!(pool.retry_interval(&inst(1)), Some(DEFAULT_BASE_INTERVAL));
    }

    #[test]
    fn test_succeeded_moves_retrying_to_active() {
        let pool = pool();
        pool.update_instances(&[inst(1)]);
        pool.failed(&inst(1));
        pool.succeeded(&inst(1));

        assert_eq!(pool.state_of(&inst(1)), Some(InstanceState::Active));
        assert_eq!(pool.retry_len(), 0);
        assert_eq!(pool.active_len(), 1);
        assert_eq!(pool.retry_interval(&inst(1)), Some(DEFAULT_BASE_INTERVAL));
    }

    #[test]
    fn test_succeeded_ignores_unknown_instance() {
        let pool = pool();
        pool.succeeded(&inst(9));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_reactivate_only_due_instances() {
        let pool = pool();
        pool.update_instances(&[inst(1), inst(2)]);
        let now = Instant::now();
        pool.failed_at(&inst(1), now);
        pool.failed_at(&inst(2), now + Duration::from_secs(5));

        assert_eq!(pool.reactivate_retries(now + Duration::from_secs(1)), 1);
        assert_eq!(pool.state_of(&inst(1)), Some(InstanceState::Active));
        assert_eq!(pool.state_of(&inst(2)), Some(InstanceState::Retrying));
    }

    #[test]
    fn test_pick_prefers_active_over_retrying() {
        let pool = pool();
        pool.update_instances(&[inst(1), inst(2)]);
        pool.failed(&inst(2));

        for _ in 0..100 {
            let picked = pool.pick_instance().unwrap();
            assert_eq!(picked, inst(1));
            pool.succeeded(&picked);
        }
        assert_eq!(pool.state_of(&inst(2)), Some(InstanceState::Retrying));
    }

    #[test]
    fn test_pick_falls_back_to_retrying() {
        let pool = pool();
        pool.update_instances(&[inst(1), inst(2)]);
        let now = Instant::now();
        pool.failed_at(&inst(1), now);
        pool.failed_at(&inst(2), now);

        let mut seen = HashSet::new();
        for _ in 0..200 {
            seen.insert(pool.pick_instance().unwrap());
        }
        assert_eq!(seen.len(), 2, "fallback should spread across retrying instances");
        assert_eq!(pool.retry_at(&inst(1)), Some(now + DEFAULT_BASE_INTERVAL));
    }

    #[test]
    fn test_pick_prefails_recovering_instance() {
        let pool = pool();
        pool.update_instances(&[inst(1)]);
        let now = Instant::now();
        pool.failed_at(&inst(1), now);
        pool.reactivate_retries(now + DEFAULT_BASE_INTERVAL);

        assert_eq!(pool.pick_instance(), Some(inst(1)));
        assert_eq!(pool.state_of(&inst(1)), Some(InstanceState::Retrying));

        // The caller's success undoes the speculative failure.
        pool.succeeded(&inst(1));
        assert_eq!(pool.state_of(&inst(1)), Some(InstanceState::Active));
        assert_eq!(pool.pick_instance(), Some(inst(1)));
        assert_eq!(pool.state_of(&inst(1)), Some(InstanceState::Active));
    }

    #[tokio::test]
    async fn test_reactivation_timer() {
        let config = PoolConfig {
            base_interval: Duration::from_millis(20),
            reactivate_every: Duration::from_millis(10),
            ..PoolConfig::default()
        };
        let pool = Arc::new(InstancePool::new("svc", config));
        pool.update_instances(&[inst(1)]);
        pool.failed(&inst(1));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let timer = pool.spawn_reactivation(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.state_of(&inst(1)), Some(InstanceState::Active));

        shutdown_tx.send(true).unwrap();
        timer.await.unwrap();
    }

    #[derive(Debug, Clone)]
    enum Op {
        Update(Vec<u16>),
        Fail(u16),
        Succeed(u16),
        Reactivate(u64),
        Pick,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            proptest::collection::vec(0u16..6, 0..6).prop_map(Op::Update),
            (0u16..6).prop_map(Op::Fail),
            (0u16..6).prop_map(Op::Succeed),
            (0u64..10).prop_map(Op::Reactivate),
            Just(Op::Pick),
        ]
    }

    proptest! {
        #[test]
        fn prop_members_live_in_exactly_one_collection(
            ops in proptest::collection::vec(op(), 1..64)
        ) {
            let config = PoolConfig { max_failures: 1_000, ..PoolConfig::default() };
            let pool = InstancePool::new("svc", config);
            let start = Instant::now();
            let mut members: HashSet<Instance> = HashSet::new();

            for op in ops {
                match op {
                    Op::Update(ids) => {
                        let list: Vec<Instance> = ids.iter().map(|&n| inst(n)).collect();
                        pool.update_instances(&list);
                        members = list.into_iter().collect();
                    }
                    Op::Fail(n) => pool.failed(&inst(n)),
                    Op::Succeed(n) => pool.succeeded(&inst(n)),
                    Op::Reactivate(secs) => {
                        pool.reactivate_retries(start + Duration::from_secs(secs));
                    }
                    Op::Pick => {
                        if let Some(picked) = pool.pick_instance() {
                            prop_assert!(members.contains(&picked));
                        }
                    }
                }

                let state = pool.lock();
                for m in &members {
                    let in_active = state.active.iter().filter(|a| *a == m).count();
                    let in_retry = state.retry.iter().filter(|Reverse(s)| &s.instance == m).count();
                    prop_assert_eq!(
                        in_active + in_retry,
                        1,
                        "{} in {} active, {} retry",
                        m,
                        in_active,
                        in_retry
                    );
                    let expected = if in_active == 1 {
                        InstanceState::Active
                    } else {
                        InstanceState::Retrying
                    };
                    prop_assert_eq!(state.entries.get(m).map(|e| e.state), Some(expected));
                }
                prop_assert_eq!(state.entries.len(), members.len());
                prop_assert!(state.active.iter().all(|a| members.contains(a)));
                prop_assert!(state.retry.iter().all(|Reverse(s)| members.contains(&s.instance)));
            }
        }
    }
}
