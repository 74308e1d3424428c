// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use async_channel::{Receiver, Sender};
use thiserror::Error;

use crate::job_engine::task::TaskId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full ({0} entries)")]
    Capacity(usize),
    #[error("no queued entry with id {0}")]
    NotFound(TaskId),
}

#[derive(Debug)]
struct Entries<T> {
    items: VecDeque<(TaskId, T)>,
    capacity: usize,
    last_id: TaskId,
}

/// Bounded FIFO whose entries can also be removed by id.
///
/// A single consumer waits in [`TaskQueue::pop`]. Producers ring a one-slot
/// doorbell channel after appending; the doorbell only says "look again", the
/// entries themselves are always re-checked under the lock.
#[derive(Debug)]
pub struct TaskQueue<T> {
    entries: Mutex<Entries<T>>,
    doorbell_tx: Sender<()>,
    doorbell_rx: Receiver<()>,
}

impl<T> TaskQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (doorbell_tx, doorbell_rx) = async_channel::bounded(1);
        Self {
            entries: Mutex::new(Entries {
                items: VecDeque::with_capacity(capacity),
                capacity,
                last_id: 0,
            }),
            doorbell_tx,
            doorbell_rx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries<T>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends the item built by `make` for the next id.
    pub fn push_with(&self, make: impl FnOnce(TaskId) -> T) -> Result<TaskId, QueueError> {
        let id = {
            let mut entries = self.lock();
            if entries.items.len() >= entries.capacity {
                return Err(QueueError::Capacity(entries.capacity));
            }
            entries.last_id += 1;
            let id = entries.last_id;
            entries.items.push_back((id, make(id)));
            id
        };
        // full means a wake-up is already pending
        let _ = self.doorbell_tx.try_send(());
        Ok(id)
    }

    pub fn push(&self, item: T) -> Result<TaskId, QueueError> {
        self.push_with(|_| item)
    }

    /// Waits until an entry is available and returns the oldest one.
    pub async fn pop(&self) -> (TaskId, T) {
        loop {
            if let Some(entry) = self.try_pop() {
                return entry;
            }
            // Both channel ends live in `self`, so recv cannot fail while we wait.
            // A wake-up may be stale after `clear`; the loop re-checks.
            let _ = self.doorbell_rx.recv().await;
        }
    }

    pub fn try_pop(&self) -> Option<(TaskId, T)> {
        self.lock().items.pop_front()
    }

    pub fn remove(&self, id: TaskId) -> Result<T, QueueError> {
        let mut entries = self.lock();
        let position = entries
            .items
            .iter()
            .position(|(entry_id, _)| *entry_id == id)
            .ok_or(QueueError::NotFound(id))?;
        let (_, item) = entries
            .items
            .remove(position)
            .ok_or(QueueError::NotFound(id))?;
        Ok(item)
    }

    /// Drops all pending entries. Ids keep counting from where they were.
    pub fn clear(&self) {
        self.lock().items.clear();
        while self.doorbell_rx.try_recv().is_ok() {}
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }
}

impl<T: Clone> TaskQueue<T> {
    pub fn snapshot(&self) -> Vec<(TaskId, T)> {
        self.lock().items.iter().cloned().collect()
    }
}
