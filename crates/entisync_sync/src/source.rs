//! Pull-based delivery of remote entities.
//!
//! A [`RemoteSource`] hands out remote entities in chunks. Attaching one
//! with [`EntitySync::pull_from`] switches the engine to streaming and
//! requests a new chunk whenever the engine reports room for more.

use crate::engine::EntitySync;
use crate::state::SyncEvent;
use entisync_core::{CoreResult, Task};
use entisync_protocol::RemoteEntity;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

/// One chunk handed out by a [`RemoteSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Part of the complete remote set.
    Full {
        /// Remote entities.
        entities: Vec<RemoteEntity>,
        /// Whether this is the last chunk.
        done: bool,
    },
    /// Part of the changes since the last run.
    Incremental {
        /// Added or changed entities.
        changed: Vec<RemoteEntity>,
        /// Removed entities.
        removed: Vec<RemoteEntity>,
        /// Whether this is the last chunk.
        done: bool,
    },
}

impl Delivery {
    /// Creates a full chunk with more to follow.
    pub fn full(entities: Vec<RemoteEntity>) -> Self {
        Self::Full {
            entities,
            done: false,
        }
    }

    /// Creates an incremental chunk with more to follow.
    pub fn incremental(changed: Vec<RemoteEntity>, removed: Vec<RemoteEntity>) -> Self {
        Self::Incremental {
            changed,
            removed,
            done: false,
        }
    }

    /// Marks the chunk as the last one.
    #[must_use]
    pub fn last(mut self) -> Self {
        match &mut self {
            Self::Full { done, .. } | Self::Incremental { done, .. } => *done = true,
        }
        self
    }

    /// Returns true if no chunk follows.
    pub fn is_last(&self) -> bool {
        match self {
            Self::Full { done, .. } | Self::Incremental { done, .. } => *done,
        }
    }

    /// Returns the number of entities in the chunk.
    pub fn len(&self) -> usize {
        match self {
            Self::Full { entities, .. } => entities.len(),
            Self::Incremental {
                changed, removed, ..
            } => changed.len() + removed.len(),
        }
    }

    /// Returns true if the chunk carries no entity.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Producer of remote entities.
pub trait RemoteSource {
    /// Requests the next chunk holding at most `capacity` entities.
    ///
    /// Failing the task aborts the sync with that error.
    fn next_batch(&mut self, capacity: usize) -> Task<Delivery>;
}

/// A [`RemoteSource`] serving entities held in memory.
#[derive(Debug, Clone)]
pub struct VecSource {
    incremental: bool,
    changed: VecDeque<RemoteEntity>,
    removed: VecDeque<RemoteEntity>,
    requests: usize,
}

impl VecSource {
    /// Serves `entities` as a full delivery.
    pub fn full(entities: Vec<RemoteEntity>) -> Self {
        Self {
            incremental: false,
            changed: entities.into(),
            removed: VecDeque::new(),
            requests: 0,
        }
    }

    /// Serves `changed` then `removed` as an incremental delivery.
    pub fn incremental(changed: Vec<RemoteEntity>, removed: Vec<RemoteEntity>) -> Self {
        Self {
            incremental: true,
            changed: changed.into(),
            removed: removed.into(),
            requests: 0,
        }
    }

    /// Returns the number of chunks requested so far.
    pub fn requests(&self) -> usize {
        self.requests
    }

    /// Returns the number of entities not handed out yet.
    pub fn remaining(&self) -> usize {
        self.changed.len() + self.removed.len()
    }
}

impl RemoteSource for VecSource {
    fn next_batch(&mut self, capacity: usize) -> Task<Delivery> {
        self.requests += 1;
        let take_changed = capacity.min(self.changed.len());
        let changed: Vec<RemoteEntity> = self.changed.drain(..take_changed).collect();
        let take_removed = (capacity - take_changed).min(self.removed.len());
        let removed: Vec<RemoteEntity> = self.removed.drain(..take_removed).collect();

        let delivery = if self.incremental {
            Delivery::incremental(changed, removed)
        } else {
            Delivery::full(changed)
        };
        if self.remaining() == 0 {
            Task::ready(delivery.last())
        } else {
            Task::ready(delivery)
        }
    }
}

struct Puller {
    engine: EntitySync,
    source: RefCell<Box<dyn RemoteSource>>,
    in_flight: Cell<bool>,
    exhausted: Cell<bool>,
}

impl Puller {
    fn pull(self: &Rc<Self>, capacity: usize) {
        if capacity == 0 || self.in_flight.get() || self.exhausted.get() {
            return;
        }
        if self.engine.is_finished() {
            return;
        }
        self.in_flight.set(true);
        tracing::trace!(capacity, "requesting remote entities");
        let request = self.source.borrow_mut().next_batch(capacity);
        let puller = Rc::clone(self);
        request.then_result(move |result| puller.delivered(result));
    }

    fn delivered(self: &Rc<Self>, result: CoreResult<Delivery>) {
        self.in_flight.set(false);
        if self.engine.is_finished() {
            return;
        }
        let delivery = match result {
            Ok(delivery) => delivery,
            Err(error) => {
                tracing::warn!(%error, "remote source failed");
                self.exhausted.set(true);
                self.engine.abort(error);
                return;
            }
        };

        let last = delivery.is_last();
        let fed = match delivery {
            Delivery::Full { entities, .. } => self.engine.feed_full(entities),
            Delivery::Incremental {
                changed, removed, ..
            } => self.engine.feed_incremental(changed, removed),
        };
        let fed = fed.and_then(|()| if last { self.engine.delivery_done() } else { Ok(()) });
        if let Err(error) = fed {
            tracing::debug!(%error, "delivery rejected");
            self.exhausted.set(true);
            return;
        }
        if last {
            self.exhausted.set(true);
            return;
        }

        // The engine only asks for more after applying a full batch.
        let room = self
            .engine
            .batch_size()
            .saturating_sub(self.engine.queued());
        if room > 0 {
            let puller = Rc::clone(self);
            self.engine
                .job()
                .session()
                .event_loop()
                .post(move || puller.pull(room));
        }
    }
}

impl EntitySync {
    /// Pulls remote entities from `source` until it reports its last chunk.
    ///
    /// Switches the engine to streaming delivery. A failing request aborts
    /// the run with the request's error.
    pub fn pull_from<S>(&self, source: S)
    where
        S: RemoteSource + 'static,
    {
        self.set_streaming(true);
        let puller = Rc::new(Puller {
            engine: self.clone(),
            source: RefCell::new(Box::new(source)),
            in_flight: Cell::new(false),
            exhausted: Cell::new(false),
        });

        let listener = Rc::clone(&puller);
        self.subscribe(move |event| {
            if let SyncEvent::ReadyForNextBatch(capacity) = event {
                listener.pull(*capacity);
            }
        });
        puller.pull(self.batch_size());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entities(rids: &[&str]) -> Vec<RemoteEntity> {
        rids.iter().map(|rid| RemoteEntity::with_rid(*rid)).collect()
    }

    fn take(source: &mut VecSource, capacity: usize) -> Delivery {
        let request = source.next_batch(capacity);
        let delivered = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&delivered);
        request.then_result(move |result| *slot.borrow_mut() = result.ok());
        let delivery = delivered.borrow_mut().take();
        delivery.expect("vec source answers synchronously")
    }

    #[test]
    fn test_full_source_serves_chunks() {
        let mut source = VecSource::full(entities(&["a", "b", "c"]));
        let first = take(&mut source, 2);
        assert_eq!(first.len(), 2);
        assert!(!first.is_last());

        let second = take(&mut source, 2);
        assert_eq!(second, Delivery::full(entities(&["c"])).last());
        assert_eq!(source.requests(), 2);
        assert_eq!(source.remaining(), 0);
    }

    #[test]
    fn test_incremental_source_serves_changes_first() {
        let mut source = VecSource::incremental(entities(&["a"]), entities(&["x", "y"]));
        assert_eq!(
            take(&mut source, 2),
            Delivery::incremental(entities(&["a"]), entities(&["x"]))
        );
        assert_eq!(
            take(&mut source, 2),
            Delivery::incremental(vec![], entities(&["y"])).last()
        );
    }

    #[test]
    fn test_empty_source_is_immediately_done() {
        let mut source = VecSource::full(vec![]);
        let delivery = take(&mut source, 10);
        assert!(delivery.is_last());
        assert!(delivery.is_empty());
    }
}
