//! Partition registry: a concurrent list of partitions ordered newest first.

use crate::partition::SharedPartition;
use crate::{Result, StrataError};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// An ordered list of partitions, descending by minimum timestamp (newest
/// first). Minimum-timestamp ties are rejected: every partition owns a
/// disjoint slice of time.
///
/// Readers traverse lock-free against mutation: nodes are immutable once
/// linked except for their atomic-under-RwLock `next` pointers, so an
/// iterator never observes a dangling successor. A single mutation lock
/// serializes insert/remove/swap.
pub struct PartitionList {
    head: RwLock<Option<Arc<PartitionNode>>>,
    mutation_lock: Mutex<()>,
    num_partitions: AtomicUsize,
}

struct PartitionNode {
    partition: SharedPartition,
    next: RwLock<Option<Arc<PartitionNode>>>,
}

impl PartitionList {
    /// Creates a new empty partition list.
    pub fn new() -> Self {
        Self {
            head: RwLock::new(None),
            mutation_lock: Mutex::new(()),
            num_partitions: AtomicUsize::new(0),
        }
    }

    /// Inserts a partition in order. Fails with `PartitionExists` when a
    /// partition with the same minimum timestamp is already present.
    pub fn insert(&self, partition: SharedPartition) -> Result<()> {
        let _mutation_guard = self.mutation_lock.lock();
        let min = partition.min_timestamp();

        let head = self.head.read().clone();

        // New head?
        match &head {
            None => {
                let node = Arc::new(PartitionNode {
                    partition,
                    next: RwLock::new(None),
                });
                *self.head.write() = Some(node);
                self.num_partitions.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
            Some(head_node) => {
                let head_min = head_node.partition.min_timestamp();
                if head_min == min {
                    return Err(StrataError::PartitionExists { min_timestamp: min });
                }
                if head_min < min {
                    let node = Arc::new(PartitionNode {
                        partition,
                        next: RwLock::new(Some(Arc::clone(head_node))),
                    });
                    *self.head.write() = Some(node);
                    self.num_partitions.fetch_add(1, Ordering::SeqCst);
                    return Ok(());
                }
            }
        }

        // Walk until the successor is older than the new partition.
        let mut current = head.unwrap();
        loop {
            let next = current.next.read().clone();
            match next {
                None => {
                    let node = Arc::new(PartitionNode {
                        partition,
                        next: RwLock::new(None),
                    });
                    *current.next.write() = Some(node);
                    self.num_partitions.fetch_add(1, Ordering::SeqCst);
                    return Ok(());
                }
                Some(next_node) => {
                    let next_min = next_node.partition.min_timestamp();
                    if next_min == min {
                        return Err(StrataError::PartitionExists { min_timestamp: min });
                    }
                    if next_min < min {
                        let node = Arc::new(PartitionNode {
                            partition,
                            next: RwLock::new(Some(Arc::clone(&next_node))),
                        });
                        *current.next.write() = Some(node);
                        self.num_partitions.fetch_add(1, Ordering::SeqCst);
                        return Ok(());
                    }
                    current = next_node;
                }
            }
        }
    }

    /// Removes a partition from the list. The caller keeps ownership of the
    /// partition and decides whether to destroy it.
    pub fn remove(&self, target: &SharedPartition) -> Result<()> {
        let _mutation_guard = self.mutation_lock.lock();

        let mut head = self.head.write();
        if let Some(head_node) = head.clone() {
            if Self::same_partition(&head_node.partition, target) {
                *head = head_node.next.read().clone();
                self.num_partitions.fetch_sub(1, Ordering::SeqCst);
                return Ok(());
            }
        }

        let mut current = head.clone();
        drop(head);

        while let Some(node) = current {
            let next = node.next.read().clone();

            if let Some(next_node) = &next {
                if Self::same_partition(&next_node.partition, target) {
                    let successor = next_node.next.read().clone();
                    *node.next.write() = successor;
                    self.num_partitions.fetch_sub(1, Ordering::SeqCst);
                    return Ok(());
                }
            }

            current = next;
        }

        Err(StrataError::PartitionNotFound)
    }

    /// Structurally replaces `old` with `new` at the same position. This is
    /// the linearization point of compaction: readers entering after the
    /// swap observe only the new partition. The replacement must cover the
    /// same window, so its minimum timestamp must equal the old one's.
    pub fn swap(&self, old: &SharedPartition, new: SharedPartition) -> Result<()> {
        let _mutation_guard = self.mutation_lock.lock();

        if new.min_timestamp() != old.min_timestamp() {
            return Err(StrataError::PartitionNotFound);
        }

        let mut head = self.head.write();
        if let Some(head_node) = head.clone() {
            if Self::same_partition(&head_node.partition, old) {
                let node = Arc::new(PartitionNode {
                    partition: new,
                    next: RwLock::new(head_node.next.read().clone()),
                });
                *head = Some(node);
                return Ok(());
            }
        }

        let mut current = head.clone();
        drop(head);

        while let Some(node) = current {
            let next = node.next.read().clone();

            if let Some(next_node) = &next {
                if Self::same_partition(&next_node.partition, old) {
                    let replacement = Arc::new(PartitionNode {
                        partition: new,
                        next: RwLock::new(next_node.next.read().clone()),
                    });
                    *node.next.write() = Some(replacement);
                    return Ok(());
                }
            }

            current = next;
        }

        Err(StrataError::PartitionNotFound)
    }

    /// Returns the number of partitions.
    pub fn size(&self) -> usize {
        self.num_partitions.load(Ordering::SeqCst)
    }

    /// Creates a forward-only iterator over the partitions, newest first.
    pub fn iter(&self) -> PartitionIterator {
        PartitionIterator {
            current: self.head.read().clone(),
        }
    }

    fn same_partition(a: &SharedPartition, b: &SharedPartition) -> bool {
        Arc::ptr_eq(a, b)
    }
}

impl Default for PartitionList {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over partitions in the list, newest first.
pub struct PartitionIterator {
    current: Option<Arc<PartitionNode>>,
}

impl Iterator for PartitionIterator {
    type Item = SharedPartition;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current.take()?;
        let partition = Arc::clone(&node.partition);
        self.current = node.next.read().clone();
        Some(partition)
    }
}
