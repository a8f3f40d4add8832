//! A lock-free, insertion-ordered list of in-flight log allocations.
//!
//! Pushing happens at the newest end with a single CAS, and the push
//! invokes a caller-supplied callback against the previous newest node
//! before the CAS is attempted. The callback derives the new node's LSN
//! range from its predecessor's, so range assignment and list membership
//! are jointly atomic: whichever thread wins the CAS derived from the true
//! predecessor, and ranges come out contiguous, gap-free, and
//! non-overlapping under any contention.
//!
//! Releasing a node only marks it dead in place. Dead nodes at the oldest
//! end are physically unlinked by whichever thread happens past, a plain
//! head-pointer CAS; an interior dead node stays put until everything
//! older than it has died. The list always retains at least one node
//! (possibly dead), so the newest node's `next_lsn_offset` is always
//! available as the log tip. Node memory is reclaimed through
//! crossbeam-epoch once no reader can still observe it.

#![allow(unsafe_code)]

use std::fmt::{self, Debug};
use std::sync::atomic::{
    AtomicBool, AtomicU64,
    Ordering::{Acquire, Relaxed, Release},
};

use crossbeam_epoch::{unprotected, Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;

use crate::{debug_delay, LsnOffset};

/// Tag placed on the newest node's null next-pointer when the list has
/// been terminally killed at shutdown. A pusher's CAS against an untagged
/// null can never succeed past it.
const KILLED: usize = 1;

/// One in-flight allocation: the LSN range it owns and its liveness.
/// Owned by the allocating client from insertion until release or
/// discard; other threads may only read it while it is reachable.
pub(crate) struct BlockNode {
    lsn_offset: AtomicU64,
    next_lsn_offset: AtomicU64,
    dead: AtomicBool,
    next: Atomic<BlockNode>,
}

impl BlockNode {
    fn empty() -> BlockNode {
        BlockNode {
            lsn_offset: AtomicU64::new(0),
            next_lsn_offset: AtomicU64::new(0),
            dead: AtomicBool::new(false),
            next: Atomic::null(),
        }
    }

    pub(crate) fn lsn_offset(&self) -> LsnOffset {
        self.lsn_offset.load(Acquire)
    }

    pub(crate) fn next_lsn_offset(&self) -> LsnOffset {
        self.next_lsn_offset.load(Acquire)
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(Acquire)
    }
}

pub(crate) struct BlockList {
    head: CachePadded<Atomic<BlockNode>>,
    tail: CachePadded<Atomic<BlockNode>>,
}

impl BlockList {
    /// Construct a list primed with a single dead node whose range is the
    /// empty range at `initial_offset`, so the first real push has a
    /// predecessor to derive its LSN from.
    pub(crate) fn new(initial_offset: LsnOffset) -> BlockList {
        let primed = BlockNode {
            lsn_offset: AtomicU64::new(initial_offset),
            next_lsn_offset: AtomicU64::new(initial_offset),
            dead: AtomicBool::new(true),
            next: Atomic::null(),
        };
        let shared =
            Owned::new(primed).into_shared(unsafe { unprotected() });
        BlockList {
            head: CachePadded::new(Atomic::from(shared)),
            tail: CachePadded::new(Atomic::from(shared)),
        }
    }

    /// Append a node at the newest end. `derive` is called with the
    /// current newest node and returns the `(lsn_offset, next_lsn_offset)`
    /// pair for the new node; it runs again on every CAS retry so the
    /// winning derivation is always against the true predecessor.
    ///
    /// Returns `None` iff the list has been killed.
    pub(crate) fn push_with<'g, F>(
        &self,
        derive: F,
        guard: &'g Guard,
    ) -> Option<&'g BlockNode>
    where
        F: Fn(&BlockNode) -> (LsnOffset, LsnOffset),
    {
        let mut node = Owned::new(BlockNode::empty());
        loop {
            debug_delay();
            let tail = self.tail.load(Acquire, guard);
            let t = unsafe { tail.deref() };
            let next = t.next.load(Acquire, guard);
            if !next.is_null() {
                // the tail hint lags; help it along
                let _ = self.tail.compare_exchange(
                    tail, next, Release, Relaxed, guard,
                );
                continue;
            }
            if next.tag() == KILLED {
                return None;
            }

            let (lsn_offset, next_lsn_offset) = derive(t);
            node.lsn_offset.store(lsn_offset, Relaxed);
            node.next_lsn_offset.store(next_lsn_offset, Relaxed);

            match t.next.compare_exchange(
                Shared::null(),
                node,
                Release,
                Relaxed,
                guard,
            ) {
                Ok(new) => {
                    let _ = self.tail.compare_exchange(
                        tail, new, Release, Relaxed, guard,
                    );
                    return Some(unsafe { new.deref() });
                }
                Err(e) => node = e.new,
            }
        }
    }

    /// The most recently inserted node, live or dead. Never fails: the
    /// list is never empty.
    pub(crate) fn newest<'g>(&self, guard: &'g Guard) -> &'g BlockNode {
        loop {
            debug_delay();
            let tail = self.tail.load(Acquire, guard);
            let t = unsafe { tail.deref() };
            let next = t.next.load(Acquire, guard);
            if next.is_null() {
                return t;
            }
            let _ = self
                .tail
                .compare_exchange(tail, next, Release, Relaxed, guard);
        }
    }

    /// Mark `node` dead and opportunistically unlink any dead run at the
    /// oldest end. O(1) on the common path.
    pub(crate) fn remove_fast(&self, node: &BlockNode, guard: &Guard) {
        debug_delay();
        node.dead.store(true, Release);
        self.collect(guard);
    }

    /// Like `remove_fast`, but additionally kills the list iff `node` is
    /// still the newest node and no push has raced in. Returns whether
    /// the kill took; either way the node ends up dead.
    pub(crate) fn remove_and_kill(
        &self,
        node: &BlockNode,
        guard: &Guard,
    ) -> bool {
        debug_delay();
        let killed = node
            .next
            .compare_exchange(
                Shared::null(),
                Shared::null().with_tag(KILLED),
                Release,
                Relaxed,
                guard,
            )
            .is_ok();
        node.dead.store(true, Release);
        self.collect(guard);
        killed
    }

    /// Physically unlink dead nodes at the oldest end. The newest node is
    /// always retained, dead or not, so the log tip stays readable.
    pub(crate) fn collect(&self, guard: &Guard) {
        loop {
            debug_delay();
            let head = self.head.load(Acquire, guard);
            let h = unsafe { head.deref() };
            if !h.is_dead() {
                return;
            }
            let next = h.next.load(Acquire, guard);
            if next.is_null() {
                return;
            }
            // never leave the tail hint pointing at an unlinked node
            let tail = self.tail.load(Acquire, guard);
            if tail == head {
                let _ = self.tail.compare_exchange(
                    tail, next, Release, Relaxed, guard,
                );
            }
            if self
                .head
                .compare_exchange(head, next, Release, Relaxed, guard)
                .is_ok()
            {
                unsafe { guard.defer_destroy(head) };
            }
        }
    }

    /// Iterate live nodes, oldest first.
    pub(crate) fn iter_live<'g>(&self, guard: &'g Guard) -> LiveIter<'g> {
        LiveIter { cursor: self.head.load(Acquire, guard), guard }
    }

    /// The oldest node the allocator has not yet released, if any.
    pub(crate) fn oldest_live<'g>(
        &self,
        guard: &'g Guard,
    ) -> Option<&'g BlockNode> {
        self.iter_live(guard).next()
    }
}

pub(crate) struct LiveIter<'g> {
    cursor: Shared<'g, BlockNode>,
    guard: &'g Guard,
}

impl<'g> Iterator for LiveIter<'g> {
    type Item = &'g BlockNode;

    fn next(&mut self) -> Option<&'g BlockNode> {
        while !self.cursor.is_null() {
            let node = unsafe { self.cursor.deref() };
            self.cursor = node.next.load(Acquire, self.guard);
            if !node.is_dead() {
                return Some(node);
            }
        }
        None
    }
}

impl Debug for BlockList {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = crossbeam_epoch::pin();
        formatter.write_str("BlockList [")?;
        let mut written = false;
        for node in self.iter_live(&guard) {
            if written {
                formatter.write_str(", ")?;
            }
            write!(
                formatter,
                "{}..{}",
                node.lsn_offset(),
                node.next_lsn_offset()
            )?;
            written = true;
        }
        formatter.write_str("]")
    }
}

impl Drop for BlockList {
    fn drop(&mut self) {
        unsafe {
            let guard = unprotected();
            let mut cursor = self.head.load(Relaxed, guard);
            while !cursor.is_null() {
                let node = cursor.into_owned();
                cursor = node.next.load(Relaxed, guard);
                drop(node);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    use crossbeam_epoch::pin;

    fn push_sized<'g>(
        list: &BlockList,
        nbytes: u64,
        guard: &'g Guard,
    ) -> &'g BlockNode {
        list.push_with(
            |prev| {
                let lo = prev.next_lsn_offset();
                (lo, lo + nbytes)
            },
            guard,
        )
        .expect("list unexpectedly killed")
    }

    #[test]
    fn ranges_partition_under_contention() {
        let list = Arc::new(BlockList::new(0));
        let n_threads = 8;
        let per_thread = 200;

        let mut handles = vec![];
        for tid in 0..n_threads {
            let list = list.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("pusher-{}", tid))
                    .spawn(move || {
                        let mut ranges = vec![];
                        for _ in 0..per_thread {
                            let guard = pin();
                            let node = push_sized(&list, 32, &guard);
                            ranges.push((
                                node.lsn_offset(),
                                node.next_lsn_offset(),
                            ));
                            list.remove_fast(node, &guard);
                        }
                        ranges
                    })
                    .unwrap(),
            );
        }

        let mut all: Vec<_> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();

        assert_eq!(all.len(), n_threads * per_thread);
        let mut expected = 0;
        for (lo, hi) in all {
            assert_eq!(lo, expected);
            assert_eq!(hi, lo + 32);
            expected = hi;
        }

        let guard = pin();
        assert_eq!(
            list.newest(&guard).next_lsn_offset(),
            (n_threads * per_thread) as u64 * 32
        );
    }

    #[test]
    fn dead_prefix_unlinks_up_to_oldest_live() {
        let list = BlockList::new(0);
        let guard = pin();
        let a = push_sized(&list, 10, &guard);
        let b = push_sized(&list, 10, &guard);
        let c = push_sized(&list, 10, &guard);

        assert_eq!(list.oldest_live(&guard).unwrap().lsn_offset(), 0);

        // releasing out of order leaves b dead in place
        list.remove_fast(b, &guard);
        assert_eq!(list.oldest_live(&guard).unwrap().lsn_offset(), 0);

        list.remove_fast(a, &guard);
        assert_eq!(list.oldest_live(&guard).unwrap().lsn_offset(), 20);

        list.remove_fast(c, &guard);
        assert!(list.oldest_live(&guard).is_none());
        assert_eq!(list.newest(&guard).next_lsn_offset(), 30);
    }

    #[test]
    fn kill_rejects_future_pushes() {
        let list = BlockList::new(64);
        let guard = pin();
        let probe = list
            .push_with(
                |prev| {
                    let o = prev.next_lsn_offset();
                    (o, o)
                },
                &guard,
            )
            .unwrap();

        assert!(list.remove_and_kill(probe, &guard));
        assert!(list
            .push_with(|prev| {
                let o = prev.next_lsn_offset();
                (o, o + 8)
            }, &guard)
            .is_none());
    }

    #[test]
    fn kill_loses_to_a_raced_push() {
        let list = BlockList::new(0);
        let guard = pin();
        let probe = push_sized(&list, 0, &guard);
        let racer = push_sized(&list, 16, &guard);

        assert!(!list.remove_and_kill(probe, &guard));
        // the kill still marked the probe dead
        assert!(probe.is_dead());
        assert_eq!(list.oldest_live(&guard).unwrap().lsn_offset(), 0);
        assert_eq!(racer.next_lsn_offset(), 16);

        // the list remains usable
        list.remove_fast(racer, &guard);
        assert!(push_sized(&list, 8, &guard).lsn_offset() == 16);
    }
}
