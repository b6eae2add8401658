//! External merge sort over record streams.

use std::cmp::Ordering;
use std::path::Path;

use log::debug;

use super::{Record, Stream};
use crate::error::VoxResult;

struct Run<T: Record> {
    stream: Stream<T>,
    head: Option<T>,
}

impl<T: Record> Run<T> {
    fn advance(&mut self) -> VoxResult<Option<T>> {
        let taken = self.head.take();
        self.head = self.stream.next()?;
        Ok(taken)
    }
}

/// Sorts a stream with the caller's comparator, spilling sorted runs when
/// the in-memory chunk would exceed `memory` bytes. The source stream is
/// consumed (its backing file dies with it).
pub fn sort_stream<T, F>(
    mut src: Stream<T>,
    dir: &Path,
    memory: usize,
    mut cmp: F,
) -> VoxResult<Stream<T>>
where
    T: Record,
    F: FnMut(&T, &T) -> Ordering,
{
    let chunk_cap = (memory / T::SIZE).max(1024);
    src.rewind()?;

    let mut runs: Vec<Run<T>> = Vec::new();
    let mut chunk: Vec<T> = Vec::with_capacity(chunk_cap.min(1 << 20));
    loop {
        let item = src.next()?;
        if let Some(item) = item {
            chunk.push(item);
        }
        if chunk.len() >= chunk_cap || (item.is_none() && !chunk.is_empty()) {
            chunk.sort_by(&mut cmp);
            let mut run = Stream::new(dir)?;
            for v in &chunk {
                run.push(v)?;
            }
            run.rewind()?;
            let head = run.next()?;
            runs.push(Run { stream: run, head });
            chunk.clear();
        }
        if item.is_none() {
            break;
        }
    }
    drop(src);
    debug!("external sort: {} run(s)", runs.len());

    // Selection merge over the run heads. Runs stay sequential on disk;
    // the head scan is linear in the run count.
    let mut out = Stream::new(dir)?;
    loop {
        let mut best: Option<usize> = None;
        for (k, run) in runs.iter().enumerate() {
            let Some(head) = &run.head else { continue };
            best = match best {
                None => Some(k),
                Some(b) => {
                    // `cmp` may be a closure over &mut state; borrow the
                    // heads out before calling it.
                    let other = runs[b].head.as_ref().map(|h| cmp(head, h));
                    if other == Some(Ordering::Less) { Some(k) } else { Some(b) }
                }
            };
        }
        match best {
            None => break,
            Some(k) => {
                if let Some(item) = runs[k].advance()? {
                    out.push(&item)?;
                }
            }
        }
    }
    Ok(out)
}
