//! Lock-free work queue / serializer (C1).
//!
//! A single-consumer, multi-producer FIFO of opaque work items and an
//! atomic pending counter. To enqueue: push the item, then bump the
//! counter. If the pre-increment value was zero, the enqueuer becomes the
//! *drainer*: it repeatedly pops and runs items, counting how many it ran,
//! then atomically subtracts that count from the counter; if the result is
//! still nonzero, it keeps draining. Other producers never block — they
//! only ever push and increment.
//!
//! Work items here are futures rather than plain closures: the request/
//! response engine's `Start` item needs to `.await` a link (re)attach and a
//! send before its slot's state can be decided, and the whole point of
//! running it on the drainer is that those actions are serialized against
//! every other queued item without anyone holding a lock across them. The
//! drainer itself runs as a spawned task so that `enqueue` works uniformly
//! whether the caller is inside async code or a synchronous AMQP delivery
//! callback (§4.2).
//!
//! Contract: work bodies must be total — a panicking item is caught and
//! dropped by the drainer, never retried. Work bodies may enqueue further
//! items; those are picked up by the current drainer before it exits.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use futures::FutureExt;

type BoxedWork = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

struct Inner {
    items: SegQueue<BoxedWork>,
    pending: AtomicUsize,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        WorkQueue {
            inner: Arc::new(Inner {
                items: SegQueue::new(),
                pending: AtomicUsize::new(0),
            }),
        }
    }

    /// Enqueues `item`. If this call observes the pending count transition
    /// from zero, it spawns the drain loop; otherwise it trusts whichever
    /// task is already draining to reach `item` before exiting.
    pub fn enqueue<F>(&self, item: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.items.push(Box::pin(item));
        if self.inner.pending.fetch_add(1, Ordering::AcqRel) == 0 {
            tokio::spawn(Self::drain(self.inner.clone()));
        }
    }

    async fn drain(inner: Arc<Inner>) {
        loop {
            let mut executed = 0usize;
            while let Some(item) = inner.items.pop() {
                // Work bodies must be total; a panicking item must not take
                // down the drainer or strand items queued behind it.
                let _ = std::panic::AssertUnwindSafe(item).catch_unwind().await;
                executed += 1;
            }
            if executed == 0 {
                break;
            }
            if inner.pending.fetch_sub(executed, Ordering::AcqRel) == executed {
                break;
            }
            // Items landed while we were draining (or raced just under us);
            // keep going until the counter genuinely reaches zero.
        }
    }
}
