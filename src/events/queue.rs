use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

type Job = BoxFuture<'static, ()>;

/// Runs jobs that share a key one after another, in submission order.
/// Jobs under different keys run concurrently.
#[derive(Clone)]
pub struct KeyedQueue {
    lanes: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>>,
    tracker: TaskTracker,
}

impl KeyedQueue {
    pub fn new() -> Self {
        Self {
            lanes: Arc::new(Mutex::new(HashMap::new())),
            tracker: TaskTracker::new(),
        }
    }

    pub fn enqueue<F>(&self, key: &str, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut lanes = self.lanes.lock();
        let mut job: Job = Box::pin(job);
        if let Some(lane) = lanes.get(key) {
            match lane.send(job) {
                Ok(()) => return,
                // The lane's worker died with a panicking job; start a new one.
                Err(mpsc::error::SendError(returned)) => job = returned,
            }
        }

        let (lane, mut jobs) = mpsc::unbounded_channel::<Job>();
        self.tracker.spawn(async move {
            while let Some(job) = jobs.recv().await {
                job.await;
            }
        });
        if lane.send(job).is_ok() {
            lanes.insert(key.to_string(), lane);
        }
    }

    /// Number of keys that have received work since the last drain.
    pub fn lanes(&self) -> usize {
        self.lanes.lock().len()
    }

    /// Waits until every job enqueued so far has finished.
    pub async fn drain(&self) {
        self.lanes.lock().clear();
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

impl Default for KeyedQueue {
    fn default() -> Self {
        Self::new()
    }
}
