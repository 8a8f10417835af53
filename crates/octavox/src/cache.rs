//! Bounded bag of pending work for the tree build.
//!
//! Not a FIFO: a background task drains submissions into an output channel
//! opportunistically, so dispatch order is arbitrary. The octree's final
//! layout does not depend on it, only on the parent-patching protocol.

use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};

/// Concurrent work queue with `submit` / `take` / `shutdown`. Channel
/// capacity is proportional to the worker count; `submit` blocks while the
/// inbox is saturated and an internal pending set holds the backlog.
pub struct NodeCache<T> {
    in_tx: Sender<T>,
    out_rx: Receiver<T>,
    shutdown_tx: Sender<()>,
}

impl<T: Send + 'static> NodeCache<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (in_tx, in_rx) = bounded::<T>(capacity);
        let (out_tx, out_rx) = bounded::<T>(capacity);
        // The shutdown lane is separate from the inbox so the signal cannot
        // be lost behind queued submissions.
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        thread::spawn(move || drain(in_rx, out_tx, shutdown_rx));

        NodeCache {
            in_tx,
            out_rx,
            shutdown_tx,
        }
    }

    /// Hand a node to the cache. Returns false if the cache has shut down.
    pub fn submit(&self, node: T) -> bool {
        self.in_tx.send(node).is_ok()
    }

    /// Blocks for the next pending node; `None` once the cache has shut
    /// down.
    pub fn take(&self) -> Option<T> {
        self.out_rx.recv().ok()
    }

    /// Close the output channel. Pending nodes are discarded; blocked
    /// takers observe `None`. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.try_send(());
    }
}

fn drain<T>(in_rx: Receiver<T>, out_tx: Sender<T>, shutdown_rx: Receiver<()>) {
    let mut pending: Vec<T> = Vec::new();
    loop {
        if pending.is_empty() {
            crossbeam_channel::select! {
                recv(shutdown_rx) -> _ => return,
                recv(in_rx) -> msg => match msg {
                    Ok(node) => pending.push(node),
                    Err(_) => return,
                },
            }
        } else {
            crossbeam_channel::select! {
                recv(shutdown_rx) -> _ => return,
                recv(in_rx) -> msg => match msg {
                    Ok(node) => pending.push(node),
                    Err(_) => return,
                },
                // The message expression only runs if this arm is chosen.
                send(out_tx, pending.pop().expect("pending is non-empty")) -> res => {
                    if res.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::{Duration, Instant};

    #[test]
    fn submitted_nodes_come_back_in_some_order() {
        let cache = NodeCache::new(4);
        for i in 0..32u32 {
            assert!(cache.submit(i));
        }

        let mut seen = HashSet::new();
        for _ in 0..32 {
            seen.insert(cache.take().expect("cache closed early"));
        }
        assert_eq!(seen, (0..32).collect());
    }

    #[test]
    fn shutdown_closes_the_output_channel() {
        let cache: NodeCache<u32> = NodeCache::new(2);
        cache.submit(1);
        cache.shutdown();
        cache.shutdown(); // idempotent

        // After shutdown every take eventually observes a closed channel.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match cache.take() {
                None => break,
                Some(_) => assert!(Instant::now() < deadline, "cache never closed"),
            }
        }
    }

    #[test]
    fn shutdown_is_not_lost_behind_a_full_inbox() {
        let cache = NodeCache::new(1);
        for i in 0..4u32 {
            cache.submit(i);
        }
        cache.shutdown();

        let deadline = Instant::now() + Duration::from_secs(5);
        while cache.take().is_some() {
            assert!(Instant::now() < deadline, "shutdown signal was dropped");
        }
    }

    #[test]
    fn takers_across_threads_drain_everything() {
        let cache = std::sync::Arc::new(NodeCache::new(3));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            handles.push(thread::spawn(move || {
                (0..25)
                    .map(|_| cache.take().expect("cache closed early"))
                    .collect::<Vec<u32>>()
            }));
        }

        for i in 0..100u32 {
            assert!(cache.submit(i));
        }

        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        cache.shutdown();

        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }
}
