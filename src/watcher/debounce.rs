use std::collections::HashMap;
use std::future::poll_fn;
use std::path::PathBuf;
use std::time::Duration;

use tokio_util::time::DelayQueue;
use tokio_util::time::delay_queue::Key;

use crate::event::FileEvent;

/// One pending timer per path. A new event for a pending path restarts its timer and
/// replaces the held event, so the latest event wins.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    queue: DelayQueue<PathBuf>,
    pending: HashMap<PathBuf, (Key, FileEvent)>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            queue: DelayQueue::new(),
            pending: HashMap::new(),
        }
    }

    pub fn push(&mut self, event: FileEvent) {
        match self.pending.get_mut(&event.path) {
            Some((key, held)) => {
                self.queue.reset(key, self.delay);
                *held = event;
            }
            None => {
                let key = self.queue.insert(event.path.clone(), self.delay);
                self.pending.insert(event.path.clone(), (key, event));
            }
        }
    }

    /// Wait for the next quiescent path. Resolves to `None` immediately when nothing is
    /// pending, so callers should guard on [`Debouncer::is_empty`].
    pub async fn next_expired(&mut self) -> Option<FileEvent> {
        loop {
            let expired = poll_fn(|cx| self.queue.poll_expired(cx)).await?;
            if let Some((_, event)) = self.pending.remove(expired.get_ref()) {
                return Some(event);
            }
        }
    }

    /// Drop every pending timer and its held event.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
