//! Post-commit segment provisioning.
//!
//! Consumes committed events and does the file work they imply: a new
//! segment gets its file, a deleted topic releases its segments. The log
//! is never rolled back; transient failures are retried with exponential
//! backoff until they succeed or the node shuts down.
//!
//! Every file job runs in its own task, so one segment stuck in backoff
//! never holds up another. Jobs for the same segment run in order, and a
//! delete stops a create that is still retrying. If the event stream
//! lags, the provisioner reconciles against the latest committed
//! snapshot instead.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use sliced_core::SegmentId;
use sliced_state::{ClusterState, ErrorClass, Event, Segment};

use crate::blob::{BlobError, BlobStore};

/// Exponential backoff: doubles on each failure up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    current: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            current: initial,
            max,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn fail(&mut self) -> Duration {
        let delay = self.current;
        self.failures += 1;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[derive(Debug, Clone)]
enum Job {
    Create(Segment),
    Delete(Segment),
}

impl Job {
    fn name(&self) -> &'static str {
        match self {
            Job::Create(_) => "create",
            Job::Delete(_) => "delete",
        }
    }

    fn segment(&self) -> &Segment {
        match self {
            Job::Create(s) | Job::Delete(s) => s,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    initial: Duration,
    max: Duration,
    /// Failures after which retries are logged at error level.
    alert_after: u32,
}

struct Inflight {
    ticket: u64,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct Provisioner<B> {
    store: Arc<B>,
    policy: RetryPolicy,
    /// Segments whose files this node holds or is creating.
    known: BTreeMap<SegmentId, Segment>,
    inflight: BTreeMap<SegmentId, Inflight>,
    tickets: u64,
    done_tx: mpsc::UnboundedSender<(SegmentId, u64)>,
    done_rx: mpsc::UnboundedReceiver<(SegmentId, u64)>,
}

impl<B: BlobStore + 'static> Provisioner<B> {
    pub fn new(store: Arc<B>, initial_backoff: Duration, max_backoff: Duration, alert_after: u32) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            store,
            policy: RetryPolicy {
                initial: initial_backoff,
                max: max_backoff,
                alert_after,
            },
            known: BTreeMap::new(),
            inflight: BTreeMap::new(),
            tickets: 0,
            done_tx,
            done_rx,
        }
    }

    /// Jobs that have not finished yet.
    pub fn pending(&self) -> usize {
        self.inflight.len()
    }

    /// Run until shutdown. Starts from the latest snapshot, then follows
    /// the event stream. Once the stream closes, waits for outstanding
    /// jobs; shutdown abandons them.
    pub async fn run(
        mut self,
        mut events: broadcast::Receiver<Event>,
        snapshots: watch::Receiver<Arc<ClusterState>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("segment provisioner started");
        let state = snapshots.borrow().clone();
        self.reconcile(&state);
        loop {
            tokio::select! {
                received = events.recv() => {
                    if !self.receive(received, &snapshots) {
                        break;
                    }
                }
                Some((segment_id, ticket)) = self.done_rx.recv() => {
                    self.finished(segment_id, ticket);
                }
                _ = shutdown.changed() => {
                    self.abort_all();
                    info!("segment provisioner shutting down");
                    return;
                }
            }
        }
        self.drain(&mut shutdown).await;
        info!("segment provisioner shutting down");
    }

    /// Take one item off the event stream. Returns false once it closed.
    fn receive(
        &mut self,
        received: Result<Event, RecvError>,
        snapshots: &watch::Receiver<Arc<ClusterState>>,
    ) -> bool {
        match received {
            Ok(event) => self.handle(&event),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "segment provisioner lagged behind the log, reconciling");
                let state = snapshots.borrow().clone();
                self.reconcile(&state);
            }
            Err(RecvError::Closed) => return false,
        }
        true
    }

    /// Start the file work one committed event implies.
    pub fn handle(&mut self, event: &Event) {
        match event {
            Event::SegmentCreated { segment } => {
                if self.known.insert(segment.id, segment.clone()).is_none() {
                    self.spawn(Job::Create(segment.clone()));
                }
            }
            Event::TopicDeleted { topic_id, segments } => {
                debug!(topic_id, count = segments.len(), "releasing topic segments");
                for segment in segments {
                    self.known.remove(&segment.id);
                    self.spawn(Job::Delete(segment.clone()));
                }
            }
            _ => {}
        }
    }

    /// Bring files in line with `state`: create missing unsealed segments
    /// and release segments the state no longer holds. Returns the number
    /// of jobs started.
    pub fn reconcile(&mut self, state: &ClusterState) -> usize {
        let mut started = 0;
        for segment in state.segments.values() {
            if self.known.contains_key(&segment.id) {
                continue;
            }
            self.known.insert(segment.id, segment.clone());
            if !segment.sealed {
                self.spawn(Job::Create(segment.clone()));
                started += 1;
            }
        }
        let gone: Vec<SegmentId> = self
            .known
            .keys()
            .filter(|id| !state.segments.contains_key(id))
            .copied()
            .collect();
        for id in gone {
            if let Some(segment) = self.known.remove(&id) {
                self.spawn(Job::Delete(segment));
                started += 1;
            }
        }
        debug!(started, known = self.known.len(), "segment files reconciled");
        started
    }

    /// Wait for every job to finish, unless shutdown comes first.
    pub async fn drain(&mut self, shutdown: &mut watch::Receiver<bool>) {
        while !self.inflight.is_empty() {
            tokio::select! {
                Some((segment_id, ticket)) = self.done_rx.recv() => {
                    self.finished(segment_id, ticket);
                }
                _ = shutdown.changed() => {
                    self.abort_all();
                    return;
                }
            }
        }
    }

    fn spawn(&mut self, job: Job) {
        let segment_id = job.segment().id;
        self.tickets += 1;
        let ticket = self.tickets;
        // A newer job supersedes the older one, which stops retrying and
        // is waited for so the two never touch the file at once.
        let previous = self.inflight.remove(&segment_id).map(|prev| {
            let _ = prev.cancel.send(true);
            prev.handle
        });
        let (cancel, cancelled) = watch::channel(false);
        let store = Arc::clone(&self.store);
        let policy = self.policy;
        let done = self.done_tx.clone();
        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            retry(store.as_ref(), policy, &job, cancelled).await;
            let _ = done.send((segment_id, ticket));
        });
        self.inflight.insert(
            segment_id,
            Inflight {
                ticket,
                cancel,
                handle,
            },
        );
    }

    fn finished(&mut self, segment_id: SegmentId, ticket: u64) {
        if self
            .inflight
            .get(&segment_id)
            .is_some_and(|job| job.ticket == ticket)
        {
            self.inflight.remove(&segment_id);
        }
    }

    fn abort_all(&mut self) {
        for (_, job) in std::mem::take(&mut self.inflight) {
            job.handle.abort();
        }
    }
}

async fn attempt<B: BlobStore + ?Sized>(store: &B, job: &Job) -> Result<(), BlobError> {
    match job {
        Job::Create(s) => store.create(&s.path, &s.header).await,
        Job::Delete(s) => store.delete(&s.path).await,
    }
}

/// Retry `job` until it succeeds, fails permanently, or is cancelled.
/// Returns whether it succeeded.
async fn retry<B: BlobStore + ?Sized>(
    store: &B,
    policy: RetryPolicy,
    job: &Job,
    mut cancelled: watch::Receiver<bool>,
) -> bool {
    let mut backoff = Backoff::new(policy.initial, policy.max);
    let segment = job.segment();
    loop {
        let err = match attempt(store, job).await {
            Ok(()) => return true,
            Err(e) => e,
        };
        if err.class() == ErrorClass::Fatal {
            error!(
                job = job.name(),
                segment_id = segment.id,
                path = %segment.path,
                error = %err,
                "segment provisioning failed permanently"
            );
            return false;
        }
        let delay = backoff.fail();
        if backoff.failures() >= policy.alert_after {
            error!(
                job = job.name(),
                segment_id = segment.id,
                failures = backoff.failures(),
                error = %err,
                "segment provisioning keeps failing"
            );
        } else {
            warn!(
                job = job.name(),
                segment_id = segment.id,
                ?delay,
                error = %err,
                "segment provisioning failed, retrying"
            );
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancelled.changed() => {
                debug!(job = job.name(), segment_id = segment.id, "superseded, retries stopped");
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::blob::{BlobResult, LocalBlobStore};
    use sliced_state::{Hash, PathKind, SegmentHeader, SegmentPath, SegmentStats, SliceId};

    fn segment(id: u64) -> Segment {
        Segment {
            id,
            topic_id: 4,
            slice: SliceId::new(1, 0),
            path: SegmentPath {
                name: format!("4/{id}.seg"),
                volume_id: "v0".into(),
                drive: "d0".into(),
                kind: PathKind::Local,
            },
            header: SegmentHeader {
                timestamp: 1_000,
                topic_id: 4,
                log_id: id,
                start_index: 0,
            },
            stats: SegmentStats::default(),
            sealed: false,
        }
    }

    fn policy(initial_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy {
            initial: Duration::from_millis(initial_ms),
            max: Duration::from_millis(max_ms),
            alert_after: 2,
        }
    }

    /// Fails the first `failures` creates with an io error, and every
    /// create of `stuck`.
    struct Flaky {
        failures: AtomicU32,
        stuck: Option<String>,
        created: Mutex<Vec<String>>,
        deleted: Mutex<Vec<String>>,
    }

    impl Flaky {
        fn new(failures: u32, stuck: Option<&str>) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                stuck: stuck.map(str::to_string),
                created: Mutex::new(Vec::new()),
                deleted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl BlobStore for Flaky {
        async fn create(&self, path: &SegmentPath, _: &SegmentHeader) -> BlobResult<()> {
            let stuck = self.stuck.as_deref() == Some(path.name.as_str());
            if stuck
                || self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(BlobError::Io {
                    path: path.to_string(),
                    source: std::io::Error::other("disk busy"),
                });
            }
            self.created.lock().unwrap().push(path.name.clone());
            Ok(())
        }

        async fn append(&self, _: &SegmentPath, _: &[u8]) -> BlobResult<()> {
            Ok(())
        }

        async fn read(&self, _: &SegmentPath) -> BlobResult<Vec<u8>> {
            Ok(Vec::new())
        }

        async fn delete(&self, path: &SegmentPath) -> BlobResult<()> {
            self.deleted.lock().unwrap().push(path.name.clone());
            Ok(())
        }

        async fn verify(&self, _: &SegmentPath, _: &Hash) -> BlobResult<()> {
            Ok(())
        }
    }

    async fn settle<B: BlobStore + 'static>(provisioner: &mut Provisioner<B>) {
        let (_keep, mut shutdown) = watch::channel(false);
        tokio::time::timeout(Duration::from_secs(5), provisioner.drain(&mut shutdown))
            .await
            .unwrap();
    }

    #[test]
    fn backoff_doubles_up_to_max() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(b.fail(), Duration::from_millis(100));
        assert_eq!(b.fail(), Duration::from_millis(200));
        assert_eq!(b.fail(), Duration::from_millis(350));
        assert_eq!(b.fail(), Duration::from_millis(350));
        assert_eq!(b.failures(), 4);
        b.reset();
        assert_eq!(b.fail(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let store = Flaky::new(3, None);
        let (_cancel, cancelled) = watch::channel(false);
        assert!(retry(&store, policy(1, 4), &Job::Create(segment(9)), cancelled).await);
        assert_eq!(*store.created.lock().unwrap(), vec!["4/9.seg".to_string()]);
        assert_eq!(store.failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_interrupts_retries() {
        let store = Flaky::new(u32::MAX, None);
        let (cancel, cancelled) = watch::channel(false);
        let job = Job::Create(segment(9));
        let retrying = retry(&store, policy(60_000, 60_000), &job, cancelled);
        cancel.send(true).unwrap();
        assert!(!retrying.await);
    }

    #[tokio::test]
    async fn a_stuck_segment_does_not_hold_up_others() {
        let store = Arc::new(Flaky::new(0, Some("4/1.seg")));
        let mut provisioner =
            Provisioner::new(Arc::clone(&store), Duration::from_secs(60), Duration::from_secs(60), 5);
        provisioner.handle(&Event::SegmentCreated { segment: segment(1) });
        provisioner.handle(&Event::SegmentCreated { segment: segment(2) });

        for _ in 0..200 {
            if !store.created.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*store.created.lock().unwrap(), vec!["4/2.seg".to_string()]);
        assert!(provisioner.pending() >= 1);

        // Deleting the stuck segment stops its create and releases it.
        provisioner.handle(&Event::TopicDeleted {
            topic_id: 4,
            segments: vec![segment(1)],
        });
        settle(&mut provisioner).await;
        assert_eq!(provisioner.pending(), 0);
        assert_eq!(*store.deleted.lock().unwrap(), vec!["4/1.seg".to_string()]);
    }

    #[tokio::test]
    async fn lag_falls_back_to_the_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalBlobStore::new(dir.path()));
        let mut provisioner =
            Provisioner::new(Arc::clone(&store), Duration::from_millis(1), Duration::from_millis(4), 5);

        // Segment 1 was provisioned before the lag; the log then deleted it
        // and created 2 and 3, but those events were lost.
        provisioner.handle(&Event::SegmentCreated { segment: segment(1) });
        settle(&mut provisioner).await;
        assert!(dir.path().join("v0/d0/4/1.seg").exists());

        let mut state = ClusterState::default();
        for id in [2, 3] {
            state.segments.insert(id, segment(id));
        }
        let mut sealed = segment(4);
        sealed.sealed = true;
        state.segments.insert(4, sealed);
        let (_snapshots_tx, snapshots) = watch::channel(Arc::new(state));

        assert!(provisioner.receive(Err(RecvError::Lagged(7)), &snapshots));
        settle(&mut provisioner).await;
        assert!(!dir.path().join("v0/d0/4/1.seg").exists());
        assert!(dir.path().join("v0/d0/4/2.seg").exists());
        assert!(dir.path().join("v0/d0/4/3.seg").exists());
        assert!(!dir.path().join("v0/d0/4/4.seg").exists());

        // A late event for a segment already reconciled starts nothing.
        provisioner.handle(&Event::SegmentCreated { segment: segment(2) });
        assert_eq!(provisioner.pending(), 0);
        assert!(!provisioner.receive(Err(RecvError::Closed), &snapshots));
    }

    #[tokio::test]
    async fn run_creates_and_releases_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalBlobStore::new(dir.path()));
        let provisioner =
            Provisioner::new(store.clone(), Duration::from_millis(1), Duration::from_millis(4), 5);
        // Room for one event: the receiver lags and must recover.
        let (events_tx, events_rx) = broadcast::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut state = ClusterState::default();
        state.segments.insert(2, segment(2));
        let (_snapshots_tx, snapshots) = watch::channel(Arc::new(state));

        events_tx
            .send(Event::SegmentCreated {
                segment: segment(1),
            })
            .unwrap();
        events_tx
            .send(Event::SegmentCreated {
                segment: segment(2),
            })
            .unwrap();
        events_tx
            .send(Event::TopicDeleted {
                topic_id: 4,
                segments: vec![segment(1)],
            })
            .unwrap();
        drop(events_tx);

        tokio::time::timeout(
            Duration::from_secs(5),
            provisioner.run(events_rx, snapshots, shutdown_rx),
        )
        .await
        .unwrap();
        drop(shutdown_tx);

        assert!(!dir.path().join("v0/d0/4/1.seg").exists());
        assert!(dir.path().join("v0/d0/4/2.seg").exists());
    }
}
