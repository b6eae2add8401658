//! Adaptive priority queue: an in-memory heap that spills sorted runs to
//! disk once it hits the memory cap.
//!
//! This is the one structure that lets the pipeline run beyond RAM. All
//! public operations do bounded in-memory work; the external state is a
//! set of priority-sorted run streams whose heads are merged with the
//! live heap on every extraction.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};

use log::debug;

use super::{Record, Stream};
use crate::config::Config;
use crate::error::VoxResult;

/// A record with a totally ordered priority.
pub trait Prioritized: Record {
    /// The ordering key; smaller extracts first.
    type Priority: Ord + Copy;
    /// This record's key.
    fn priority(&self) -> Self::Priority;
}

struct Entry<T: Prioritized> {
    prio: T::Priority,
    /// Insertion sequence; keeps equal priorities FIFO.
    seq: u64,
    item: T,
}

impl<T: Prioritized> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.prio == other.prio && self.seq == other.seq
    }
}

impl<T: Prioritized> Eq for Entry<T> {}

impl<T: Prioritized> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Prioritized> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.prio.cmp(&other.prio).then(self.seq.cmp(&other.seq))
    }
}

struct Run<T: Prioritized> {
    stream: Stream<T>,
    head: Option<T>,
}

/// Adaptive priority queue over records.
pub struct PQueue<T: Prioritized> {
    heap: BinaryHeap<Reverse<Entry<T>>>,
    runs: Vec<Run<T>>,
    dir: PathBuf,
    /// Heap size at which the queue migrates a run to disk.
    cap_items: usize,
    seq: u64,
    len: u64,
}

impl<T: Prioritized> PQueue<T> {
    /// A queue honoring the configured memory cap; spill files land in
    /// the stream temp directory.
    pub fn new(config: &Config) -> VoxResult<Self> {
        let dir = config.stream_tmpdir()?.clone();
        let cap_items = (config.memory_limit / T::SIZE).max(16);
        Ok(Self::with_capacity(&dir, cap_items))
    }

    /// A queue with an explicit in-memory item cap.
    #[must_use]
    pub fn with_capacity(dir: &Path, cap_items: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            runs: Vec::new(),
            dir: dir.to_path_buf(),
            cap_items: cap_items.max(16),
            seq: 0,
            len: 0,
        }
    }

    /// Items currently queued, across the heap and all runs.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// O(log n) insert; amortises the occasional run spill over the
    /// inserts that filled the heap.
    pub fn insert(&mut self, item: T) -> VoxResult<()> {
        if self.heap.len() >= self.cap_items {
            self.spill()?;
        }
        self.heap.push(Reverse(Entry { prio: item.priority(), seq: self.seq, item }));
        self.seq += 1;
        self.len += 1;
        Ok(())
    }

    fn spill(&mut self) -> VoxResult<()> {
        debug!("priority queue spilling {} items to disk", self.heap.len());
        let mut run = Stream::new(&self.dir)?;
        while let Some(Reverse(entry)) = self.heap.pop() {
            run.push(&entry.item)?;
        }
        run.rewind()?;
        let head = run.next()?;
        self.runs.push(Run { stream: run, head });
        Ok(())
    }

    fn min_source(&self) -> Option<MinSource<T::Priority>> {
        let mut best: Option<MinSource<T::Priority>> = None;
        if let Some(Reverse(entry)) = self.heap.peek() {
            best = Some(MinSource::Heap(entry.prio));
        }
        for (k, run) in self.runs.iter().enumerate() {
            if let Some(head) = &run.head {
                let prio = head.priority();
                let better = match &best {
                    None => true,
                    Some(MinSource::Heap(p) | MinSource::Run(_, p)) => prio < *p,
                };
                if better {
                    best = Some(MinSource::Run(k, prio));
                }
            }
        }
        best
    }

    /// Smallest-priority item without removing it.
    pub fn min(&mut self) -> Option<T> {
        match self.min_source()? {
            MinSource::Heap(_) => self.heap.peek().map(|Reverse(e)| e.item),
            MinSource::Run(k, _) => self.runs[k].head,
        }
    }

    /// Removes and returns the smallest-priority item.
    pub fn extract_min(&mut self) -> VoxResult<Option<T>> {
        let source = self.min_source();
        let taken = match source {
            None => None,
            Some(MinSource::Heap(_)) => self.heap.pop().map(|Reverse(e)| e.item),
            Some(MinSource::Run(k, _)) => {
                let run = &mut self.runs[k];
                let head = run.head.take();
                run.head = run.stream.next()?;
                head
            }
        };
        if taken.is_some() {
            self.len -= 1;
        }
        Ok(taken)
    }

    /// Removes every item sharing the current minimum priority and
    /// returns them, heap items first in insertion order.
    pub fn extract_all_min(&mut self) -> VoxResult<Vec<T>> {
        let Some(first) = self.extract_min()? else {
            return Ok(Vec::new());
        };
        let prio = first.priority();
        let mut out = vec![first];
        while let Some(next) = self.min() {
            if next.priority() != prio {
                break;
            }
            if let Some(item) = self.extract_min()? {
                out.push(item);
            }
        }
        Ok(out)
    }
}

enum MinSource<P> {
    Heap(P),
    Run(usize, P),
}
