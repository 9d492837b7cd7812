//! Recent-claims database: tracks a rolling giveaway total and per-prefix
//! claim cooldowns under a single mutex.
//!
//! Two independent structures share one lock:
//! - `claims` / `total`: a FIFO of `(time, amount)` within the rolling
//!   `rate_period` window, used to cap the overall giveaway rate.
//! - `intervals` / `heap`: a map from variable-length IP-prefixes (1..=8
//!   bytes) to a cooldown deadline, with a keyed min-heap on deadlines for
//!   amortized expiry. See `purge_intervals` for how stale duplicate heap
//!   entries (which `check_add_intervals` can legitimately create) are
//!   tolerated without corrupting the map.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

struct ClaimRecord {
    t: DateTime<Utc>,
    amount: f64,
}

struct Inner {
    claims: VecDeque<ClaimRecord>,
    total: f64,
    intervals: HashMap<Vec<u8>, DateTime<Utc>>,
    heap: BinaryHeap<Reverse<(DateTime<Utc>, Vec<u8>)>>,
}

/// Recent-claims database. `ip_claim_interval` and `rate_period` are fixed
/// at construction, matching the Go source's `RCDB` struct fields.
pub struct RCDB {
    pub ip_claim_interval: Duration,
    pub rate_period: Duration,
    inner: Mutex<Inner>,
}

fn div16(d: Duration) -> Duration {
    Duration::nanoseconds(d.num_nanoseconds().unwrap_or(0) / 16)
}

impl RCDB {
    pub fn new(ip_claim_interval: Duration, rate_period: Duration) -> Self {
        RCDB {
            ip_claim_interval,
            rate_period,
            inner: Mutex::new(Inner {
                claims: VecDeque::new(),
                total: 0.0,
                intervals: HashMap::new(),
                heap: BinaryHeap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("RCDB mutex poisoned")
    }

    fn purge_claims(inner: &mut Inner, before: DateTime<Utc>) {
        while let Some(front) = inner.claims.front() {
            if front.t < before {
                inner.total -= inner.claims.pop_front().expect("front just checked").amount;
            } else {
                break;
            }
        }
        if inner.claims.is_empty() {
            inner.total = 0.0;
        }
    }

    /// Drops heap/map entries whose deadline has passed. A popped heap node
    /// whose `(prefix, deadline)` no longer matches the authoritative map
    /// entry (because a later reservation replaced it) is simply discarded;
    /// only a node that still matches the map is allowed to delete it. See
    /// DESIGN.md for why this differs from a literal line-for-line port.
    fn purge_intervals(inner: &mut Inner, now: DateTime<Utc>) {
        while let Some(Reverse((deadline, _))) = inner.heap.peek() {
            if *deadline > now {
                break;
            }
            let Reverse((deadline, prefix)) = inner.heap.pop().expect("peek just checked");
            if let Some(&current) = inner.intervals.get(&prefix) {
                if current <= deadline {
                    inner.intervals.remove(&prefix);
                }
            }
        }
    }

    /// Appends a claim. Should only be called after a wallet send has
    /// actually succeeded (invariant I4); reservations made by
    /// `check_add_intervals` and not followed by `add_claim` must instead
    /// be released via `del_intervals`.
    pub fn add_claim(&self, now: DateTime<Utc>, t: DateTime<Utc>, amount: f64) {
        let mut inner = self.lock();
        Self::purge_claims(&mut inner, now - self.rate_period);
        inner.claims.push_back(ClaimRecord { t, amount });
        inner.total += amount;
    }

    /// Returns the rolling total over the configured `rate_period`.
    pub fn period_total(&self, now: DateTime<Utc>) -> f64 {
        let mut inner = self.lock();
        Self::purge_claims(&mut inner, now - self.rate_period);
        inner.total
    }

    /// Atomically checks whether a claim from `key` should be allowed now,
    /// and if so, reserves a cooldown for every prefix length on the ladder.
    /// Returns `None` if the claim must be refused.
    pub fn check_add_intervals(&self, key: [u8; 8], now: DateTime<Utc>) -> Option<Vec<DateTime<Utc>>> {
        let mut inner = self.lock();
        Self::purge_intervals(&mut inner, now);
        for l in (1..=8).rev() {
            if let Some(&deadline) = inner.intervals.get(&key[..l]) {
                if deadline > now {
                    return None;
                }
            }
        }
        let mut reservations = Vec::new();
        let mut d = self.ip_claim_interval;
        for l in (1..=8).rev() {
            if d <= Duration::seconds(1) {
                break;
            }
            let deadline = now + d;
            let prefix = key[..l].to_vec();
            inner.intervals.insert(prefix.clone(), deadline);
            inner.heap.push(Reverse((deadline, prefix)));
            reservations.push(deadline);
            d = div16(d);
        }
        Some(reservations)
    }

    /// Returns the soonest time at which `key` may claim again, or the
    /// epoch-equivalent "zero" time if it may claim now.
    pub fn check_interval(&self, key: [u8; 8], now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut inner = self.lock();
        Self::purge_intervals(&mut inner, now);
        let mut max: Option<DateTime<Utc>> = None;
        for l in (1..=8).rev() {
            if let Some(&deadline) = inner.intervals.get(&key[..l]) {
                max = Some(match max {
                    Some(cur) if cur >= deadline => cur,
                    _ => deadline,
                });
            }
        }
        max
    }

    /// Releases reservations previously obtained from `check_add_intervals`,
    /// for every prefix whose stored deadline has not been extended past
    /// the value the caller was given (an intervening reservation wins).
    pub fn del_intervals(&self, key: [u8; 8], reservations: &[DateTime<Utc>]) {
        let mut inner = self.lock();
        for (i, &t1) in reservations.iter().enumerate() {
            let l = 8 - i;
            let prefix = &key[..l];
            if let Some(&current) = inner.intervals.get(prefix) {
                if current <= t1 {
                    inner.intervals.remove(prefix);
                }
            }
        }
    }

    /// Rebuilds RCDB state from a claim-log replay. Records older than
    /// `now - rate_period` are dropped from the rolling total; every record
    /// still seeds interval cooldowns that have not yet elapsed.
    pub fn add_from_log<I>(&self, records: I, now: DateTime<Utc>)
    where
        I: IntoIterator<Item = (DateTime<Utc>, [u8; 16], f64)>,
    {
        let mut inner = self.lock();
        let cutoff = now - self.rate_period;
        inner.claims.clear();
        inner.total = 0.0;
        inner.intervals.clear();
        inner.heap.clear();

        let mut claims: Vec<ClaimRecord> = Vec::new();
        for (t, ip, amount) in records {
            if t > cutoff {
                claims.push(ClaimRecord { t, amount });
                inner.total += amount;
            }
            let key = crate::clientaddr::rl_key(std::net::Ipv6Addr::from(ip));
            let mut d = self.ip_claim_interval;
            for l in (1..=8).rev() {
                if d <= Duration::seconds(1) {
                    break;
                }
                let deadline = t + d;
                if now >= deadline {
                    break;
                }
                let prefix = key[..l].to_vec();
                let keep_existing = inner
                    .intervals
                    .get(&prefix)
                    .is_some_and(|&existing| deadline < existing);
                if !keep_existing {
                    inner.intervals.insert(prefix, deadline);
                }
                d = div16(d);
            }
        }
        claims.sort_by_key(|r| r.t);
        inner.claims = claims.into();
        inner.heap = inner
            .intervals
            .iter()
            .map(|(prefix, &deadline)| Reverse((deadline, prefix.clone())))
            .collect();
    }
}
