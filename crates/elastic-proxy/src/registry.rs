//! Registry of connected workers

use crate::error::{ProxyError, Result};
use elastic_mux::{Link, LinkId};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::debug;

/// A registered worker: its link and when it registered.
#[derive(Debug, Clone)]
pub struct WorkerLink {
    link: Link,
    registered_at: Instant,
}

impl WorkerLink {
    pub fn new(link: Link) -> Self {
        Self {
            link,
            registered_at: Instant::now(),
        }
    }

    pub fn id(&self) -> LinkId {
        self.link.id()
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.link.remote_addr()
    }

    /// Sessions currently carried by this worker
    pub fn session_count(&self) -> usize {
        self.link.channel_count()
    }

    pub fn is_connected(&self) -> bool {
        !self.link.is_closed()
    }

    pub fn uptime(&self) -> Duration {
        self.registered_at.elapsed()
    }
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone)]
pub struct WorkerSummary {
    pub id: LinkId,
    pub remote_addr: Option<SocketAddr>,
    pub sessions: usize,
    pub uptime: Duration,
}

#[derive(Default)]
struct Inner {
    workers: Vec<WorkerLink>,
    cursor: usize,
}

/// Set of registered workers, selected round-robin.
///
/// Membership only changes through [`WorkerRegistry::add_worker`] and
/// [`WorkerRegistry::remove_worker`]. A member whose link has closed stays
/// listed until removed but is no longer eligible.
#[derive(Default)]
pub struct WorkerRegistry {
    inner: Mutex<Inner>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_worker(&self, worker: WorkerLink) -> Result<()> {
        let mut inner = self.inner.lock();
        let id = worker.id();
        if inner.workers.iter().any(|w| w.id() == id) {
            return Err(ProxyError::DuplicateWorker(id));
        }
        inner.workers.push(worker);
        debug!("Worker {} added, {} registered", id, inner.workers.len());
        Ok(())
    }

    /// Remove a worker; returns whether it was registered.
    pub fn remove_worker(&self, id: &LinkId) -> bool {
        let mut inner = self.inner.lock();
        let Some(index) = inner.workers.iter().position(|w| w.id() == *id) else {
            return false;
        };
        inner.workers.remove(index);
        if index < inner.cursor {
            inner.cursor -= 1;
        }
        debug!("Worker {} removed, {} registered", id, inner.workers.len());
        true
    }

    /// Number of eligible workers: registered and with an open link.
    pub fn count(&self) -> usize {
        self.inner
            .lock()
            .workers
            .iter()
            .filter(|w| w.is_connected())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Pick the next worker whose link is still open.
    ///
    /// Closed links are skipped but stay registered until their owner
    /// removes them. Returns `None` if no registered link is usable.
    pub fn select(&self) -> Option<WorkerLink> {
        let mut inner = self.inner.lock();
        let len = inner.workers.len();
        for _ in 0..len {
            let index = inner.cursor % len;
            inner.cursor = (index + 1) % len;
            let worker = &inner.workers[index];
            if worker.is_connected() {
                return Some(worker.clone());
            }
        }
        None
    }

    pub fn workers(&self) -> Vec<WorkerSummary> {
        self.inner
            .lock()
            .workers
            .iter()
            .map(|w| WorkerSummary {
                id: w.id(),
                remote_addr: w.remote_addr(),
                sessions: w.session_count(),
                uptime: w.uptime(),
            })
            .collect()
    }

    /// Close every registered link. Used at shutdown.
    pub fn close_all(&self) {
        for worker in self.inner.lock().workers.iter() {
            worker.link().close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use elastic_mux::LinkConfig;
    use proptest::prelude::*;
    use tokio::io::DuplexStream;

    fn worker() -> (WorkerLink, DuplexStream) {
        let (a, b) = tokio::io::duplex(1024);
        let (link, _events) = Link::spawn(a, None, LinkConfig::acceptor());
        (WorkerLink::new(link), b)
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_rejected() {
        let registry = WorkerRegistry::new();
        let (w, _peer) = worker();

        registry.add_worker(w.clone()).unwrap();
        assert!(matches!(
            registry.add_worker(w.clone()),
            Err(ProxyError::DuplicateWorker(_))
        ));
        assert_eq!(registry.count(), 1);

        assert!(registry.remove_worker(&w.id()));
        assert!(!registry.remove_worker(&w.id()));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_select_round_robins() {
        let registry = WorkerRegistry::new();
        let (a, _pa) = worker();
        let (b, _pb) = worker();
        let (c, _pc) = worker();
        for w in [&a, &b, &c] {
            registry.add_worker(w.clone()).unwrap();
        }

        let picked: Vec<LinkId> = (0..6).map(|_| registry.select().unwrap().id()).collect();
        assert_eq!(
            picked,
            vec![a.id(), b.id(), c.id(), a.id(), b.id(), c.id()]
        );
    }

    #[tokio::test]
    async fn test_select_skips_closed_links() {
        let registry = WorkerRegistry::new();
        let (a, _pa) = worker();
        let (b, _pb) = worker();
        registry.add_worker(a.clone()).unwrap();
        registry.add_worker(b.clone()).unwrap();

        a.link().close();
        for _ in 0..3 {
            assert_eq!(registry.select().unwrap().id(), b.id());
        }

        assert_eq!(registry.count(), 1);

        b.link().close();
        assert!(registry.select().is_none());
        assert_eq!(registry.count(), 0);
        assert!(registry.is_empty());
        // Closed links stay listed until their owner removes them.
        assert_eq!(registry.workers().len(), 2);
        assert!(registry.remove_worker(&a.id()));
    }

    #[tokio::test]
    async fn test_empty_registry_selects_nothing() {
        let registry = WorkerRegistry::new();
        assert!(registry.select().is_none());
        assert!(registry.workers().is_empty());
    }

    #[tokio::test]
    async fn test_removal_keeps_rotation_fair() {
        let registry = WorkerRegistry::new();
        let (a, _pa) = worker();
        let (b, _pb) = worker();
        let (c, _pc) = worker();
        for w in [&a, &b, &c] {
            registry.add_worker(w.clone()).unwrap();
        }

        assert_eq!(registry.select().unwrap().id(), a.id());
        assert_eq!(registry.select().unwrap().id(), b.id());
        registry.remove_worker(&a.id());
        assert_eq!(registry.select().unwrap().id(), c.id());
        assert_eq!(registry.select().unwrap().id(), b.id());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(usize),
        Remove(usize),
        Select,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..5usize).prop_map(Op::Add),
            (0..5usize).prop_map(Op::Remove),
            Just(Op::Select),
        ]
    }

    proptest! {
        #[test]
        fn prop_count_is_adds_minus_removes(ops in prop::collection::vec(op(), 0..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let _guard = runtime.enter();

            let pool: Vec<(WorkerLink, DuplexStream)> = (0..5).map(|_| worker()).collect();
            let registry = WorkerRegistry::new();
            let mut members = std::collections::HashSet::new();

            for op in ops {
                match op {
                    Op::Add(i) => {
                        let added = registry.add_worker(pool[i].0.clone()).is_ok();
                        prop_assert_eq!(added, members.insert(i));
                    }
                    Op::Remove(i) => {
                        let removed = registry.remove_worker(&pool[i].0.id());
                        prop_assert_eq!(removed, members.remove(&i));
                    }
                    Op::Select => {
                        let selected = registry.select();
                        prop_assert_eq!(selected.is_some(), !members.is_empty());
                        if let Some(worker) = selected {
                            let index = pool.iter().position(|(w, _)| w.id() == worker.id());
                            prop_assert!(index.map_or(false, |i| members.contains(&i)));
                        }
                    }
                }
                prop_assert_eq!(registry.count(), members.len());
            }
        }
    }
}
