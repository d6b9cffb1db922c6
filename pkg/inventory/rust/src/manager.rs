// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Runs every registered collector on a shared tick, merges their partial
//! results into one snapshot, cross-references it and publishes it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::collector::Collector;
use crate::context::Context;
use crate::errors::Error;
use crate::model::{AggregatedData, CollectionResult, ContainerInfo, Pid};

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Collectors registered, loop not started.
    Created,
    Running,
    /// The loop observed cancellation and returned.
    Stopped,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerState::Created => write!(f, "created"),
            ManagerState::Running => write!(f, "running"),
            ManagerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// A bounded stream of snapshots. Updates are dropped, never queued without
/// bound, when the receiver falls behind.
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<Arc<AggregatedData>>,
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    senders: Vec<(u64, mpsc::Sender<Arc<AggregatedData>>)>,
}

pub struct Manager {
    collectors: Vec<Arc<dyn Collector>>,
    interval: Duration,
    tick_timeout: Duration,
    subscriber_capacity: usize,
    latest: RwLock<Arc<AggregatedData>>,
    subscribers: Mutex<Subscribers>,
    state: Mutex<ManagerState>,
}

impl Manager {
    /// Creates a manager ticking every `interval`. Each tick is abandoned
    /// after `interval` unless `with_tick_timeout` says otherwise.
    pub fn new(interval: Duration) -> Self {
        Manager {
            collectors: Vec::new(),
            interval,
            tick_timeout: interval,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            latest: RwLock::new(Arc::new(AggregatedData::empty(OffsetDateTime::now_utc()))),
            subscribers: Mutex::new(Subscribers::default()),
            state: Mutex::new(ManagerState::Created),
        }
    }

    pub fn with_tick_timeout(mut self, timeout: Duration) -> Self {
        self.tick_timeout = timeout;
        self
    }

    pub fn with_subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity.max(1);
        self
    }

    pub fn register(&mut self, collector: Arc<dyn Collector>) {
        info!(
            "Registered collector {} (preferred interval {:?}, running every {:?})",
            collector.name(),
            collector.interval(),
            self.interval
        );
        self.collectors.push(collector);
    }

    pub fn collector_names(&self) -> Vec<String> {
        self.collectors
            .iter()
            .map(|collector| collector.name().to_string())
            .collect()
    }

    pub fn state(&self) -> ManagerState {
        *lock(&self.state)
    }

    fn set_state(&self, next: ManagerState) {
        let mut state = lock(&self.state);
        if *state != next {
            debug!("Manager state {} -> {}", *state, next);
            *state = next;
        }
    }

    /// The most recent snapshot. Before the first tick this is an empty
    /// snapshot.
    pub fn latest(&self) -> Arc<AggregatedData> {
        match self.latest.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.subscriber_capacity);
        let mut subscribers = lock(&self.subscribers);
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        subscribers.senders.push((id, sender));
        debug!("Subscriber {id} added");
        Subscription { id, receiver }
    }

    /// Removes a subscriber, closing its channel. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: u64) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.senders.retain(|(sid, _)| *sid != id);
        debug!("Subscriber {id} removed");
    }

    /// Runs the collection loop until `ctx` is canceled: one collection right
    /// away, then one per interval. Missed ticks are skipped.
    pub async fn run(&self, ctx: &Context) {
        self.set_state(ManagerState::Running);
        info!(
            "Starting collection loop with {} collectors every {:?}",
            self.collectors.len(),
            self.interval
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = ctx.done() => break,
                _ = ticker.tick() => {
                    self.collect(ctx).await;
                }
            }
        }

        self.set_state(ManagerState::Stopped);
        info!("Collection loop stopped");
    }

    /// Runs one tick: fan out, merge, enrich, store and publish.
    pub async fn collect(&self, ctx: &Context) -> Arc<AggregatedData> {
        let started = Instant::now();
        let timestamp = OffsetDateTime::now_utc();
        let results = self.fan_out(ctx).await;

        let mut data = merge(timestamp, results);
        enrich(&mut data);
        let data = Arc::new(data);

        match self.latest.write() {
            Ok(mut guard) => *guard = Arc::clone(&data),
            Err(poisoned) => *poisoned.into_inner() = Arc::clone(&data),
        }
        self.publish(&data);

        debug!(
            "Collection took {:?}: {} processes, {} ports, {} units, {} containers, {} pods",
            started.elapsed(),
            data.processes.len(),
            data.ports.len(),
            data.systemd_units.len(),
            data.containers.len(),
            data.pods.len()
        );
        data
    }

    /// Runs every collector concurrently under a per-tick deadline and
    /// returns the successful results in registration order.
    async fn fan_out(&self, ctx: &Context) -> Vec<CollectionResult> {
        let tick = ctx.with_timeout(self.tick_timeout);
        let (sender, mut receiver) = mpsc::channel(self.collectors.len().max(1));

        let mut handles = Vec::with_capacity(self.collectors.len());
        for (index, collector) in self.collectors.iter().enumerate() {
            let collector = Arc::clone(collector);
            let sender = sender.clone();
            let tick = tick.clone();
            let handle = tokio::spawn(async move {
                let result = tick
                    .run(collector.collect(&tick))
                    .await
                    .and_then(|result| result);
                let _ = sender.send((index, result)).await;
            });
            handles.push((collector_name(&self.collectors, index), handle));
        }
        drop(sender);

        let mut results: Vec<(usize, CollectionResult)> = Vec::with_capacity(handles.len());
        while let Some((index, result)) = receiver.recv().await {
            let name = collector_name(&self.collectors, index);
            match result {
                Ok(result) => results.push((index, result)),
                Err(Error::Cancelled) => {
                    warn!("[{name}] collection abandoned: deadline exceeded or canceled")
                }
                Err(e) => warn!("[{name}] collection failed: {e}"),
            }
        }

        // Every sender is gone, so every task has finished or unwound.
        for (name, handle) in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!("[{name}] collector panicked");
                } else {
                    warn!("[{name}] collector task failed: {e}");
                }
            }
        }

        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, result)| result).collect()
    }

    fn publish(&self, data: &Arc<AggregatedData>) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.senders.retain(|(id, sender)| {
            match sender.try_send(Arc::clone(data)) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("Subscriber {id} is behind, dropping update");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Subscriber {id} is gone");
                    false
                }
            }
        });
    }
}

fn collector_name(collectors: &[Arc<dyn Collector>], index: usize) -> String {
    collectors
        .get(index)
        .map(|collector| collector.name().to_string())
        .unwrap_or_default()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Concatenates partial results in order. The first system record wins.
pub fn merge(
    timestamp: OffsetDateTime,
    results: impl IntoIterator<Item = CollectionResult>,
) -> AggregatedData {
    let mut data = AggregatedData::empty(timestamp);
    for result in results {
        data.processes.extend(result.processes);
        data.ports.extend(result.ports);
        if data.system.is_none() {
            data.system = result.system;
        }
        data.systemd_units.extend(result.systemd_units);
        data.containers.extend(result.containers);
        data.pods.extend(result.pods);
    }
    data
}

/// Attaches container and systemd unit context to processes and ports that
/// share a pid with a container's main process or a unit's main process.
pub fn enrich(data: &mut AggregatedData) {
    let by_container: HashMap<Pid, &ContainerInfo> = data
        .containers
        .iter()
        .filter(|container| container.pid > 0)
        .map(|container| (container.pid, container))
        .collect();

    let by_unit: HashMap<Pid, &str> = data
        .systemd_units
        .iter()
        .filter(|unit| unit.main_pid > 0)
        .filter_map(|unit| Some((Pid::try_from(unit.main_pid).ok()?, unit.name.as_str())))
        .collect();

    for process in data.processes.iter_mut() {
        if let Some(container) = by_container.get(&process.pid) {
            process.container_id = container.id.clone();
            process.container_name = container.name.clone();
            process.pod_name = container.pod_name.clone();
            process.pod_namespace = container.pod_namespace.clone();
        }
        if let Some(unit) = by_unit.get(&process.pid) {
            process.systemd_unit = unit.to_string();
        }
    }

    for port in data.ports.iter_mut() {
        if let Some(container) = by_container.get(&port.pid) {
            port.container_id = container.id.clone();
            port.container_name = container.name.clone();
            port.container_image = container.image.clone();
            port.pod_name = container.pod_name.clone();
            port.pod_namespace = container.pod_namespace.clone();
        }
        if let Some(unit) = by_unit.get(&port.pid) {
            port.systemd_unit = unit.to_string();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::panic)]
mod tests {
    use super::*;
    use crate::model::{PortInfo, ProcessInfo, Protocol, SystemInfo, SystemdUnitInfo};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use time::macros::datetime;

    enum Behavior {
        Succeed(CollectionResult),
        Fail,
        Panic,
        Hang,
    }

    struct MockCollector {
        name: &'static str,
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl MockCollector {
        fn new(name: &'static str, behavior: Behavior) -> Arc<Self> {
            Arc::new(MockCollector {
                name,
                behavior,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Collector for MockCollector {
        fn name(&self) -> &str {
            self.name
        }

        fn interval(&self) -> Duration {
            Duration::from_secs(1)
        }

        async fn collect(&self, _ctx: &Context) -> Result<CollectionResult, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Succeed(result) => Ok(result.clone()),
                Behavior::Fail => Err(Error::unavailable("mock", "boom")),
                Behavior::Panic => panic!("collector bug"),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(CollectionResult::default())
                }
            }
        }
    }

    fn process(pid: Pid, name: &str) -> ProcessInfo {
        ProcessInfo {
            pid,
            name: name.to_string(),
            ..ProcessInfo::default()
        }
    }

    fn processes(pids: &[Pid]) -> CollectionResult {
        CollectionResult {
            processes: pids.iter().map(|pid| process(*pid, "p")).collect(),
            ..CollectionResult::default()
        }
    }

    fn system(hostname: &str) -> CollectionResult {
        CollectionResult {
            system: Some(SystemInfo {
                hostname: hostname.to_string(),
                ..SystemInfo::default()
            }),
            ..CollectionResult::default()
        }
    }

    #[test]
    fn test_merge_nothing() {
        let data = merge(datetime!(2024-01-01 0:00 UTC), Vec::new());
        assert!(data.processes.is_empty());
        assert!(data.ports.is_empty());
        assert!(data.systemd_units.is_empty());
        assert!(data.containers.is_empty());
        assert!(data.pods.is_empty());
        assert!(data.system.is_none());
    }

    #[test]
    fn test_merge_first_system_wins() {
        let data = merge(
            datetime!(2024-01-01 0:00 UTC),
            vec![processes(&[1]), system("first"), system("second"), processes(&[2, 3])],
        );
        assert_eq!(data.system.unwrap().hostname, "first");
        let pids: Vec<Pid> = data.processes.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![1, 2, 3]);
    }

    #[test]
    fn test_enrich_by_pid() {
        let mut data = AggregatedData::empty(datetime!(2024-01-01 0:00 UTC));
        data.processes = vec![process(100, "app"), process(200, "sshd"), process(300, "other")];
        data.ports = vec![
            PortInfo {
                pid: 100,
                ..PortInfo::new(Protocol::Tcp, "0.0.0.0", 8080)
            },
            PortInfo {
                pid: 200,
                ..PortInfo::new(Protocol::Tcp, "0.0.0.0", 22)
            },
        ];
        data.containers = vec![ContainerInfo {
            id: "abcdef123456".to_string(),
            name: "web".to_string(),
            image: "nginx:1.25".to_string(),
            pid: 100,
            pod_name: "web-0".to_string(),
            pod_namespace: "default".to_string(),
            ..ContainerInfo::default()
        }];
        data.systemd_units = vec![SystemdUnitInfo {
            name: "sshd.service".to_string(),
            main_pid: 200,
            ..SystemdUnitInfo::default()
        }];

        enrich(&mut data);

        let app = &data.processes[0];
        assert_eq!(app.container_id, "abcdef123456");
        assert_eq!(app.container_name, "web");
        assert_eq!(app.pod_name, "web-0");
        assert_eq!(app.pod_namespace, "default");
        assert!(app.systemd_unit.is_empty());

        let sshd = &data.processes[1];
        assert_eq!(sshd.systemd_unit, "sshd.service");
        assert!(sshd.container_id.is_empty());
        assert!(sshd.container_name.is_empty());

        let other = &data.processes[2];
        assert!(other.container_id.is_empty());
        assert!(other.systemd_unit.is_empty());

        assert_eq!(data.ports[0].container_image, "nginx:1.25");
        assert_eq!(data.ports[0].container_name, "web");
        assert_eq!(data.ports[1].systemd_unit, "sshd.service");
        assert!(data.ports[1].container_id.is_empty());
    }

    #[test]
    fn test_enrich_ignores_zero_pids() {
        let mut data = AggregatedData::empty(datetime!(2024-01-01 0:00 UTC));
        data.ports = vec![PortInfo::new(Protocol::Udp, "0.0.0.0", 68)];
        data.containers = vec![ContainerInfo {
            id: "stopped00000".to_string(),
            ..ContainerInfo::default()
        }];
        data.systemd_units = vec![SystemdUnitInfo {
            name: "idle.service".to_string(),
            ..SystemdUnitInfo::default()
        }];

        enrich(&mut data);
        assert!(data.ports[0].container_id.is_empty());
        assert!(data.ports[0].systemd_unit.is_empty());
    }

    #[tokio::test]
    async fn test_failing_collector_is_isolated() {
        let mut manager = Manager::new(Duration::from_secs(10));
        manager.register(MockCollector::new("procs", Behavior::Succeed(processes(&[1, 2]))));
        manager.register(MockCollector::new("broken", Behavior::Fail));
        manager.register(MockCollector::new("system", Behavior::Succeed(system("host"))));

        for _ in 0..3 {
            let data = manager.collect(&Context::background()).await;
            assert_eq!(data.processes.len(), 2);
            assert_eq!(data.system.as_ref().unwrap().hostname, "host");
        }
    }

    #[tokio::test]
    async fn test_panicking_collector_is_isolated() {
        let mut manager = Manager::new(Duration::from_secs(10));
        manager.register(MockCollector::new("buggy", Behavior::Panic));
        manager.register(MockCollector::new("procs", Behavior::Succeed(processes(&[7]))));

        let data = manager.collect(&Context::background()).await;
        assert_eq!(data.processes.len(), 1);
        assert_eq!(data.processes[0].pid, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_collector_is_abandoned() {
        let mut manager =
            Manager::new(Duration::from_secs(10)).with_tick_timeout(Duration::from_secs(2));
        manager.register(MockCollector::new("slow", Behavior::Hang));
        manager.register(MockCollector::new("system", Behavior::Succeed(system("host"))));

        let data = manager.collect(&Context::background()).await;
        assert!(data.system.is_some());
    }

    #[tokio::test]
    async fn test_results_keep_registration_order() {
        let mut manager = Manager::new(Duration::from_secs(10));
        manager.register(MockCollector::new("system-a", Behavior::Succeed(system("a"))));
        manager.register(MockCollector::new("system-b", Behavior::Succeed(system("b"))));

        for _ in 0..5 {
            let data = manager.collect(&Context::background()).await;
            assert_eq!(data.system.as_ref().unwrap().hostname, "a");
        }
    }

    #[tokio::test]
    async fn test_latest_is_replaced() {
        let mut manager = Manager::new(Duration::from_secs(10));
        manager.register(MockCollector::new("procs", Behavior::Succeed(processes(&[1]))));

        assert!(manager.latest().processes.is_empty());
        let data = manager.collect(&Context::background()).await;
        assert!(Arc::ptr_eq(&data, &manager.latest()));
        assert_eq!(manager.latest().processes.len(), 1);
    }

    #[tokio::test]
    async fn test_full_subscriber_does_not_block() {
        let mut manager =
            Manager::new(Duration::from_secs(10)).with_subscriber_capacity(1);
        manager.register(MockCollector::new("procs", Behavior::Succeed(processes(&[1]))));
        let mut subscription = manager.subscribe();

        let first = manager.collect(&Context::background()).await;
        // The queue is full now; these must return without a reader.
        tokio::time::timeout(Duration::from_secs(5), async {
            manager.collect(&Context::background()).await;
            manager.collect(&Context::background()).await;
        })
        .await
        .unwrap();

        let received = subscription.receiver.recv().await.unwrap();
        assert!(Arc::ptr_eq(&received, &first));
        assert!(subscription.receiver.try_recv().is_err());

        let later = manager.collect(&Context::background()).await;
        let received = subscription.receiver.recv().await.unwrap();
        assert!(Arc::ptr_eq(&received, &later));
        assert!(received.timestamp >= first.timestamp);
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_channel() {
        let manager = Manager::new(Duration::from_secs(10));
        let mut subscription = manager.subscribe();
        let other = manager.subscribe();
        assert_ne!(subscription.id, other.id);

        manager.unsubscribe(subscription.id);
        assert!(subscription.receiver.recv().await.is_none());

        // Dropped receivers are pruned on the next publish.
        drop(other);
        manager.collect(&Context::background()).await;
        assert!(lock(&manager.subscribers).senders.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unsubscribe_while_publishing() {
        let mut manager = Manager::new(Duration::from_secs(10)).with_subscriber_capacity(2);
        manager.register(MockCollector::new("procs", Behavior::Succeed(processes(&[1, 2]))));
        let manager = Arc::new(manager);
        let subscriptions: Vec<Subscription> = (0..32).map(|_| manager.subscribe()).collect();
        let ids: Vec<u64> = subscriptions.iter().map(|s| s.id).collect();

        let publisher = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                for _ in 0..64 {
                    manager.collect(&Context::background()).await;
                }
            })
        };
        let remover = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                for id in ids {
                    manager.unsubscribe(id);
                    tokio::task::yield_now().await;
                }
            })
        };

        tokio::time::timeout(Duration::from_secs(10), async {
            publisher.await.unwrap();
            remover.await.unwrap();
        })
        .await
        .unwrap();

        assert!(lock(&manager.subscribers).senders.is_empty());
        for mut subscription in subscriptions {
            // Whatever was queued before removal drains, then the channel ends.
            let mut received = 0;
            while subscription.receiver.recv().await.is_some() {
                received += 1;
            }
            assert!(received <= 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_canceled() {
        let collector = MockCollector::new("procs", Behavior::Succeed(processes(&[1])));
        let mut manager = Manager::new(Duration::from_secs(10));
        manager.register(collector.clone());
        let manager = Arc::new(manager);
        assert_eq!(manager.state(), ManagerState::Created);

        let ctx = Context::background();
        let task = {
            let manager = Arc::clone(&manager);
            let ctx = ctx.clone();
            tokio::spawn(async move { manager.run(&ctx).await })
        };

        // Initial collection plus two ticks.
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(manager.state(), ManagerState::Running);
        assert_eq!(collector.calls.load(Ordering::SeqCst), 3);

        ctx.cancel();
        task.await.unwrap();
        assert_eq!(manager.state(), ManagerState::Stopped);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(collector.calls.load(Ordering::SeqCst), 3);
    }
}
