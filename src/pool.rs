//! Connection pool with admission control.
//!
//! Idle connections are kept per [`PartitionKey`]. Every physical connection
//! owned by the engine holds a slot, counted both in total and per partition.
//! A slot is reserved with [`ConnectionPool::preempt`] before a connection is
//! opened, and freed when the connection is closed or handed off by an
//! upgrade. Idle connections keep their slot.
//!
//! ```text
//!  preempt ──▶ Slot ──attach──▶ Leased ──release──▶ idle ──try_acquire──▶ Leased
//!               │                  │                 │
//!             abort/drop         drop/detach       expiry/destroy
//!               ▼                  ▼                 ▼
//!                           slot freed
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::{Config, Connection, Error, PartitionKey};

/// Order in which idle connections are handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeaseStrategy {
    /// Most recently released first. Those are the least likely to have been
    /// closed by the peer.
    #[default]
    Lifo,
    /// Least recently released first, spreading load over connections.
    Fifo,
}

#[derive(Debug, Clone)]
struct PoolConfig {
    max_connections: Option<usize>,
    max_per_partition: Option<usize>,
    max_idle_per_partition: Option<usize>,
    idle_timeout: Duration,
    ttl: Option<Duration>,
    lease_strategy: LeaseStrategy,
}

impl From<&Config> for PoolConfig {
    fn from(c: &Config) -> Self {
        PoolConfig {
            max_connections: c.max_connections,
            max_per_partition: c.max_connections_per_partition,
            max_idle_per_partition: c.max_idle_per_partition,
            idle_timeout: c.pooled_connection_idle_timeout,
            ttl: c.connection_ttl,
            lease_strategy: c.lease_strategy,
        }
    }
}

/// Pool of connections, shared between all requests of a client.
///
/// Cloning gives another handle to the same pool.
pub struct ConnectionPool<C: Connection> {
    inner: Arc<PoolInner<C>>,
}

struct PoolInner<C> {
    config: PoolConfig,
    partitions: DashMap<PartitionKey, Arc<Partition<C>>>,
    open_total: AtomicUsize,
    closed: AtomicBool,
}

struct Partition<C> {
    key: PartitionKey,
    state: Mutex<PartitionState<C>>,
}

struct PartitionState<C> {
    idle: VecDeque<IdleConnection<C>>,
    open: usize,
}

struct IdleConnection<C> {
    conn: C,
    created: Instant,
    idle_since: Instant,
}

/// Open and idle connection counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections holding a slot, idle or leased.
    pub open: usize,
    /// Idle connections.
    pub idle: usize,
    /// Counts per partition.
    pub partitions: HashMap<PartitionKey, PartitionStats>,
}

/// Counts of one partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionStats {
    /// Connections holding a slot, idle or leased.
    pub open: usize,
    /// Idle connections.
    pub idle: usize,
}

impl<C: Connection> ConnectionPool<C> {
    /// Creates a pool with the limits in `config`.
    pub fn new(config: &Config) -> Self {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                config: config.into(),
                partitions: DashMap::new(),
                open_total: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Whether [`ConnectionPool::destroy`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }
        Ok(())
    }

    fn partition(&self, key: &PartitionKey) -> Arc<Partition<C>> {
        if let Some(p) = self.inner.partitions.get(key) {
            return p.clone();
        }
        self.inner
            .partitions
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Partition {
                    key: key.clone(),
                    state: Mutex::new(PartitionState {
                        idle: VecDeque::new(),
                        open: 0,
                    }),
                })
            })
            .clone()
    }

    // Snapshot so no map shard lock is held while a partition is locked.
    fn all_partitions(&self) -> Vec<Arc<Partition<C>>> {
        self.inner
            .partitions
            .iter()
            .map(|e| e.value().clone())
            .collect()
    }

    fn is_usable(&self, idle: &IdleConnection<C>, now: Instant) -> bool {
        if !idle.conn.is_open() {
            trace!("Discard remotely closed connection");
            return false;
        }
        if now.saturating_duration_since(idle.idle_since) >= self.inner.config.idle_timeout {
            trace!("Discard connection idle past timeout");
            return false;
        }
        !self.is_past_ttl(idle.created, now)
    }

    fn is_past_ttl(&self, created: Instant, now: Instant) -> bool {
        match self.inner.config.ttl {
            Some(ttl) if now.saturating_duration_since(created) >= ttl => {
                trace!("Discard connection past ttl");
                true
            }
            _ => false,
        }
    }

    /// Lease an idle connection for `key`.
    ///
    /// Stale connections found on the way are closed and their slots freed.
    pub fn try_acquire(&self, key: &PartitionKey) -> Result<Option<Leased<C>>, Error> {
        self.check_open()?;

        let Some(partition) = self.inner.partitions.get(key).map(|p| p.clone()) else {
            return Ok(None);
        };

        let now = Instant::now();
        let mut discarded = Vec::new();

        let found = {
            let mut state = partition.state.lock();
            loop {
                let next = match self.inner.config.lease_strategy {
                    LeaseStrategy::Lifo => state.idle.pop_front(),
                    LeaseStrategy::Fifo => state.idle.pop_back(),
                };
                let Some(idle) = next else {
                    break None;
                };
                if self.is_usable(&idle, now) {
                    break Some(idle);
                }
                state.open -= 1;
                discarded.push(idle.conn);
            }
        };

        self.close_discarded(discarded);

        Ok(found.map(|idle| {
            debug!("Lease pooled connection: {}", key);
            Leased {
                pool: self.clone(),
                partition,
                conn: Some(idle.conn),
                created: idle.created,
                reused: true,
            }
        }))
    }

    /// Reserve a slot for a new connection to `key`.
    ///
    /// Fails fast when a limit is reached. When only the total limit is
    /// reached, the idle connection idle for longest, across all partitions,
    /// is closed to make room.
    pub fn preempt(&self, key: &PartitionKey) -> Result<Slot<C>, Error> {
        self.check_open()?;

        let partition = self.partition(key);

        {
            let mut state = partition.state.lock();
            if let Some(max) = self.inner.config.max_per_partition {
                if state.open >= max {
                    debug!("Reject connection to {}: {} per partition", key, max);
                    return Err(Error::TooManyConnectionsPerPartition(max));
                }
            }
            state.open += 1;
        }

        if let Err(e) = self.reserve_total() {
            partition.state.lock().open -= 1;
            return Err(e);
        }

        trace!("Preempted slot: {}", key);

        Ok(Slot {
            pool: self.clone(),
            partition,
            armed: true,
        })
    }

    fn reserve_total(&self) -> Result<(), Error> {
        let total = &self.inner.open_total;

        let Some(max) = self.inner.config.max_connections else {
            total.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        };

        loop {
            let current = total.load(Ordering::SeqCst);
            if current < max {
                if total
                    .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return Ok(());
                }
                continue;
            }

            // The evicted connection's slot in the total is taken over as is.
            if self.evict_oldest_idle() {
                return Ok(());
            }

            debug!("Reject connection: {} in total", max);
            return Err(Error::TooManyConnections(max));
        }
    }

    fn evict_oldest_idle(&self) -> bool {
        // Idle lists are newest first, the back of each is its oldest.
        loop {
            let oldest = self
                .all_partitions()
                .into_iter()
                .filter_map(|p| {
                    let since = p.state.lock().idle.back().map(|i| i.idle_since)?;
                    Some((since, p))
                })
                .min_by_key(|(since, _)| *since);

            let Some((since, partition)) = oldest else {
                return false;
            };

            let evicted = {
                let mut state = partition.state.lock();
                match state.idle.back() {
                    // Leased or evicted concurrently, look again.
                    Some(i) if i.idle_since == since => {}
                    _ => continue,
                }
                state.open -= 1;
                state.idle.pop_back()
            };

            if let Some(mut idle) = evicted {
                debug!("Evict idle connection: {}", partition.key);
                idle.conn.close();
                return true;
            }
        }
    }

    /// Return a connection after a completed exchange.
    ///
    /// The connection is pooled if `keep_alive`, the pool is open, the
    /// connection is usable and the partition has room for another idle
    /// connection. Otherwise it is closed. Returns whether it was pooled.
    pub fn release(&self, mut leased: Leased<C>, keep_alive: bool) -> bool {
        let Some(conn) = leased.conn.take() else {
            return false;
        };
        let partition = leased.partition.clone();
        let created = leased.created;
        let now = Instant::now();

        if !keep_alive || !conn.is_open() || self.is_past_ttl(created, now) {
            self.discard(&partition, conn);
            return false;
        }

        let rejected = {
            let mut state = partition.state.lock();
            let full = self
                .inner
                .config
                .max_idle_per_partition
                .map(|max| state.idle.len() >= max)
                .unwrap_or(false);

            // Checked under the lock so a concurrent destroy never misses it.
            if self.is_closed() || full {
                Some(conn)
            } else {
                state.idle.push_front(IdleConnection {
                    conn,
                    created,
                    idle_since: now,
                });
                None
            }
        };

        match rejected {
            Some(conn) => {
                self.discard(&partition, conn);
                false
            }
            None => {
                debug!("Pooled connection: {}", partition.key);
                true
            }
        }
    }

    fn discard(&self, partition: &Partition<C>, mut conn: C) {
        trace!("Close connection: {}", partition.key);
        conn.close();
        partition.state.lock().open -= 1;
        self.inner.open_total.fetch_sub(1, Ordering::SeqCst);
    }

    fn free_slot(&self, partition: &Partition<C>) {
        partition.state.lock().open -= 1;
        self.inner.open_total.fetch_sub(1, Ordering::SeqCst);
    }

    // Slots of the connections must already be freed in the partitions.
    fn close_discarded(&self, discarded: Vec<C>) {
        for mut conn in discarded {
            conn.close();
            self.inner.open_total.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn drain(&self, partition: &Partition<C>, keep: impl Fn(&IdleConnection<C>) -> bool) -> usize {
        let discarded: Vec<C> = {
            let mut state = partition.state.lock();
            let (kept, gone): (VecDeque<_>, VecDeque<_>) =
                std::mem::take(&mut state.idle).into_iter().partition(|i| keep(i));
            state.idle = kept;
            state.open -= gone.len();
            gone.into_iter().map(|i| i.conn).collect()
        };
        let n = discarded.len();
        self.close_discarded(discarded);
        n
    }

    /// Close idle connections past their idle timeout or ttl, or closed by
    /// the peer. Returns the number closed.
    pub fn close_expired(&self) -> usize {
        let now = Instant::now();
        self.all_partitions()
            .iter()
            .map(|p| self.drain(p, |i| self.is_usable(i, now)))
            .sum()
    }

    /// Close all idle connections of partitions matching `predicate`.
    pub fn flush_partitions(&self, predicate: impl Fn(&PartitionKey) -> bool) -> usize {
        self.all_partitions()
            .iter()
            .filter(|p| predicate(&p.key))
            .map(|p| self.drain(p, |_| false))
            .sum()
    }

    /// Close all idle connections and refuse any further use.
    ///
    /// Leased connections are closed when they are released.
    pub fn destroy(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let n = self.flush_partitions(|_| true);
        debug!("Pool destroyed, closed {} idle connections", n);
    }

    /// Current counts.
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        for p in self.all_partitions() {
            let state = p.state.lock();
            let ps = PartitionStats {
                open: state.open,
                idle: state.idle.len(),
            };
            stats.open += ps.open;
            stats.idle += ps.idle;
            stats.partitions.insert(p.key.clone(), ps);
        }
        stats
    }

    /// Idle connections counted per `host:port`.
    pub fn idle_count_per_host(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for p in self.all_partitions() {
            let idle = p.state.lock().idle.len();
            if idle > 0 {
                let host = format!("{}:{}", p.key.host(), p.key.port());
                *counts.entry(host).or_insert(0) += idle;
            }
        }
        counts
    }

    /// Periodically close expired idle connections.
    ///
    /// The task stops once the pool is destroyed or dropped.
    pub fn spawn_cleaner(&self, period: Duration) -> JoinHandle<()> {
        let weak: Weak<PoolInner<C>> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                interval.tick().await;

                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let pool = ConnectionPool { inner };
                if pool.is_closed() {
                    break;
                }

                let n = pool.close_expired();
                if n > 0 {
                    debug!("Cleaner closed {} idle connections", n);
                }
            }

            trace!("Pool cleaner stopped");
        })
    }
}

impl<C: Connection> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        ConnectionPool {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connection> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("open", &self.inner.open_total.load(Ordering::Relaxed))
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A reserved slot for a connection being opened.
///
/// Dropping the slot without [`Slot::attach`] frees it.
pub struct Slot<C: Connection> {
    pool: ConnectionPool<C>,
    partition: Arc<Partition<C>>,
    armed: bool,
}

impl<C: Connection> Slot<C> {
    /// The connection was opened, it now holds the slot.
    pub fn attach(mut self, conn: C) -> Leased<C> {
        self.armed = false;
        Leased {
            pool: self.pool.clone(),
            partition: self.partition.clone(),
            conn: Some(conn),
            created: Instant::now(),
            reused: false,
        }
    }

    /// The connection was never opened. Same as dropping the slot.
    pub fn abort(self) {}
}

impl<C: Connection> Drop for Slot<C> {
    fn drop(&mut self) {
        if self.armed {
            trace!("Abort preempted slot: {}", self.partition.key);
            self.pool.free_slot(&self.partition);
        }
    }
}

/// A connection leased by one Attempt.
///
/// Dropping it closes the connection and frees its slot. Use
/// [`ConnectionPool::release`] to offer it back to the pool.
pub struct Leased<C: Connection> {
    pool: ConnectionPool<C>,
    partition: Arc<Partition<C>>,
    conn: Option<C>,
    created: Instant,
    reused: bool,
}

impl<C: Connection> Leased<C> {
    /// Whether the connection came from the pool rather than being new.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Partition the connection belongs to.
    pub fn partition(&self) -> &PartitionKey {
        &self.partition.key
    }

    /// Take the connection out of the pool's accounting, freeing its slot.
    pub fn detach(mut self) -> C {
        // Only the consuming methods take the connection.
        let conn = self.conn.take().expect("leased connection present");
        self.pool.free_slot(&self.partition);
        conn
    }
}

impl<C: Connection> Deref for Leased<C> {
    type Target = C;

    fn deref(&self) -> &C {
        // Only the consuming methods take the connection.
        self.conn.as_ref().expect("leased connection present")
    }
}

impl<C: Connection> DerefMut for Leased<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("leased connection present")
    }
}

impl<C: Connection> Drop for Leased<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.discard(&self.partition, conn);
        }
    }
}

impl<C: Connection> fmt::Debug for Leased<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Leased")
            .field("partition", &self.partition.key)
            .field("reused", &self.reused)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use bytes::Bytes;

    use crate::{RequestHead, ResponseEvent};

    static IDS: AtomicUsize = AtomicUsize::new(0);

    struct TestConn {
        id: usize,
        open: Arc<AtomicBool>,
        closes: Arc<AtomicUsize>,
    }

    impl TestConn {
        fn new() -> Self {
            TestConn {
                id: IDS.fetch_add(1, Ordering::SeqCst),
                open: Arc::new(AtomicBool::new(true)),
                closes: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Connection for TestConn {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
        fn remote_addr(&self) -> SocketAddr {
            "127.0.0.1:80".parse().unwrap()
        }
        fn is_secure(&self) -> bool {
            false
        }
        async fn write_head(&mut self, _: &RequestHead) -> Result<(), Error> {
            Ok(())
        }
        async fn write_body(&mut self, _: Bytes) -> Result<(), Error> {
            Ok(())
        }
        async fn finish_request(&mut self) -> Result<(), Error> {
            Ok(())
        }
        async fn read_event(&mut self) -> Result<ResponseEvent, Error> {
            Ok(ResponseEvent::End)
        }
        fn close(&mut self) {
            self.open.store(false, Ordering::SeqCst);
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn key(host: &str) -> PartitionKey {
        let uri = format!("http://{}/", host).parse().unwrap();
        PartitionKey::new(&uri, None, None).unwrap()
    }

    fn pool(config: Config) -> ConnectionPool<TestConn> {
        ConnectionPool::new(&config)
    }

    fn open(pool: &ConnectionPool<TestConn>, k: &PartitionKey) -> Leased<TestConn> {
        pool.preempt(k).unwrap().attach(TestConn::new())
    }

    #[tokio::test]
    async fn reuse_same_partition_only() {
        let pool = pool(Config::default());
        let a = key("a.test");
        let b = key("b.test");

        let leased = open(&pool, &a);
        let id = leased.id;
        assert!(!leased.is_reused());
        assert!(pool.release(leased, true));

        assert!(pool.try_acquire(&b).unwrap().is_none());

        let again = pool.try_acquire(&a).unwrap().unwrap();
        assert_eq!(again.id, id);
        assert!(again.is_reused());
        assert_eq!(again.partition(), &a);
    }

    #[tokio::test]
    async fn per_partition_limit() {
        let pool = pool(Config::default().max_connections_per_partition(1));
        let a = key("a.test");

        let slot = pool.preempt(&a).unwrap();
        assert_eq!(
            pool.preempt(&a).err(),
            Some(Error::TooManyConnectionsPerPartition(1))
        );
        // Other partitions are unaffected.
        let _other = pool.preempt(&key("b.test")).unwrap();

        slot.abort();
        let _slot = pool.preempt(&a).unwrap();
    }

    #[tokio::test]
    async fn total_limit() {
        let pool = pool(Config::default().max_connections(2));
        let _a = open(&pool, &key("a.test"));
        let _b = open(&pool, &key("b.test"));
        assert_eq!(
            pool.preempt(&key("c.test")).err(),
            Some(Error::TooManyConnections(2))
        );
        // The partition count was rolled back.
        assert_eq!(pool.stats().partitions[&key("c.test")].open, 0);
    }

    #[tokio::test]
    async fn total_limit_evicts_idle() {
        let pool = pool(Config::default().max_connections(1));
        let a = open(&pool, &key("a.test"));
        let closes = a.closes.clone();
        assert!(pool.release(a, true));

        let _b = open(&pool, &key("b.test"));
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        let stats = pool.stats();
        assert_eq!(stats.open, 1);
        assert_eq!(stats.idle, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn total_limit_evicts_longest_idle() {
        let pool = pool(Config::default().max_connections(3));

        let mut closes = Vec::new();
        for host in ["a.test", "b.test", "c.test"] {
            let leased = open(&pool, &key(host));
            closes.push((host, leased.closes.clone()));
            assert!(pool.release(leased, true));
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        // b.test is now the longest idle.
        let a = pool.try_acquire(&key("a.test")).unwrap().unwrap();
        assert!(pool.release(a, true));

        let _d = open(&pool, &key("d.test"));

        let closed: Vec<_> = closes
            .iter()
            .filter(|(_, c)| c.load(Ordering::SeqCst) == 1)
            .map(|(h, _)| *h)
            .collect();
        assert_eq!(closed, vec!["b.test"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_preempt_never_overshoots() {
        let pool = pool(Config::default().max_connections_per_partition(3));
        let a = key("a.test");

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let pool = pool.clone();
            let a = a.clone();
            tasks.push(tokio::spawn(async move { pool.preempt(&a).ok() }));
        }

        let mut slots = Vec::new();
        for t in tasks {
            if let Some(slot) = t.await.unwrap() {
                slots.push(slot);
            }
        }

        assert_eq!(slots.len(), 3);
        assert_eq!(pool.stats().open, 3);

        drop(slots);
        assert_eq!(pool.stats().open, 0);
    }

    #[tokio::test]
    async fn remotely_closed_is_discarded() {
        let pool = pool(Config::default());
        let a = key("a.test");
        let leased = open(&pool, &a);
        let flag = leased.open.clone();
        pool.release(leased, true);

        flag.store(false, Ordering::SeqCst);

        assert!(pool.try_acquire(&a).unwrap().is_none());
        assert_eq!(pool.stats().open, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_discards() {
        let config = Config::default().pooled_connection_idle_timeout(Duration::from_secs(5));
        let pool = pool(config);
        let a = key("a.test");
        pool.release(open(&pool, &a), true);

        tokio::time::advance(Duration::from_secs(6)).await;

        assert!(pool.try_acquire(&a).unwrap().is_none());
        assert_eq!(pool.stats().open, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_discards_on_release() {
        let config = Config::default().connection_ttl(Some(Duration::from_secs(5)));
        let pool = pool(config);
        let leased = open(&pool, &key("a.test"));

        tokio::time::advance(Duration::from_secs(6)).await;

        assert!(!pool.release(leased, true));
        assert_eq!(pool.stats().open, 0);
    }

    #[tokio::test]
    async fn lease_order() {
        for (strategy, expect_first) in [(LeaseStrategy::Lifo, 1), (LeaseStrategy::Fifo, 0)] {
            let pool = pool(Config::default().lease_strategy(strategy));
            let a = key("a.test");
            let first = open(&pool, &a);
            let second = open(&pool, &a);
            let ids = [first.id, second.id];
            pool.release(first, true);
            pool.release(second, true);

            let got = pool.try_acquire(&a).unwrap().unwrap();
            assert_eq!(got.id, ids[expect_first]);
        }
    }

    #[tokio::test]
    async fn idle_soft_cap() {
        let pool = pool(Config::default().max_idle_per_partition(1));
        let a = key("a.test");
        let first = open(&pool, &a);
        let second = open(&pool, &a);
        let closes = second.closes.clone();

        assert!(pool.release(first, true));
        assert!(!pool.release(second, true));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().open, 1);
    }

    #[tokio::test]
    async fn no_keep_alive_closes() {
        let pool = pool(Config::default());
        let leased = open(&pool, &key("a.test"));
        let closes = leased.closes.clone();
        assert!(!pool.release(leased, false));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().open, 0);
    }

    #[tokio::test]
    async fn destroy_closes_and_refuses() {
        let pool = pool(Config::default());
        let a = key("a.test");
        let idle = open(&pool, &a);
        let idle_closes = idle.closes.clone();
        pool.release(idle, true);
        let leased = open(&pool, &a);

        pool.destroy();
        pool.destroy();

        assert_eq!(idle_closes.load(Ordering::SeqCst), 1);
        assert_eq!(pool.try_acquire(&a).err(), Some(Error::PoolClosed));
        assert_eq!(pool.preempt(&a).err(), Some(Error::PoolClosed));

        assert!(!pool.release(leased, true));
        assert_eq!(pool.stats().open, 0);
    }

    #[tokio::test]
    async fn drop_leased_frees_slot_once() {
        let pool = pool(Config::default().max_connections(1));
        let leased = open(&pool, &key("a.test"));
        let closes = leased.closes.clone();
        drop(leased);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().open, 0);
        let _again = pool.preempt(&key("a.test")).unwrap();
    }

    #[tokio::test]
    async fn detach_frees_slot_without_close() {
        let pool = pool(Config::default());
        let leased = open(&pool, &key("a.test"));
        let conn = leased.detach();
        assert!(conn.is_open());
        assert_eq!(pool.stats().open, 0);
    }

    #[tokio::test]
    async fn flush_matching_partitions() {
        let pool = pool(Config::default());
        pool.release(open(&pool, &key("a.test")), true);
        pool.release(open(&pool, &key("b.test")), true);

        assert_eq!(pool.idle_count_per_host().len(), 2);
        assert_eq!(pool.flush_partitions(|k| k.host() == "a.test"), 1);

        let counts = pool.idle_count_per_host();
        assert_eq!(counts.get("b.test:80"), Some(&1));
        assert_eq!(counts.get("a.test:80"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn cleaner_closes_expired() {
        let config = Config::default().pooled_connection_idle_timeout(Duration::from_secs(5));
        let pool = pool(config);
        let leased = open(&pool, &key("a.test"));
        let closes = leased.closes.clone();
        pool.release(leased, true);

        let cleaner = pool.spawn_cleaner(Duration::from_secs(1));

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().open, 0);

        pool.destroy();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(cleaner.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn cleaner_stops_when_pool_dropped() {
        let pool = pool(Config::default());
        let cleaner = pool.spawn_cleaner(Duration::from_secs(1));
        drop(pool);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(cleaner.is_finished());
    }
}
