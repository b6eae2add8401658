//! Run statistics recorder for the pipeline phases.
//!
//! Components log their progress and aggregate counts here; the recorder
//! mirrors everything to the `log` facade and, when the caller asked for
//! a stats file, appends it there as well.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use log::info;

use crate::error::VoxResult;

/// Sink for pipeline progress and counters.
pub struct StatsRecorder {
    out: Option<BufWriter<File>>,
    started: Instant,
}

impl StatsRecorder {
    /// A recorder writing to `path`, or log-only when `None`.
    pub fn new(path: Option<&Path>) -> VoxResult<Self> {
        let out = path.map(File::create).transpose()?.map(BufWriter::new);
        Ok(Self { out, started: Instant::now() })
    }

    fn line(&mut self, text: &str) {
        info!("{text}");
        if let Some(out) = &mut self.out {
            let elapsed = self.started.elapsed().as_secs_f64();
            // Stats files are advisory; an unwritable one must not kill
            // the run.
            let _ = writeln!(out, "[{elapsed:9.3}] {text}");
        }
    }

    /// Free-form phase marker.
    pub fn comment(&mut self, text: &str) {
        self.line(text);
    }

    /// Records a named count (stream lengths, label totals).
    pub fn record_count(&mut self, what: &str, n: u64) {
        self.line(&format!("{what} = {n}"));
    }

    /// Pushes buffered lines to disk.
    pub fn flush(&mut self) {
        if let Some(out) = &mut self.out {
            let _ = out.flush();
        }
    }
}

impl Drop for StatsRecorder {
    fn drop(&mut self) {
        self.flush();
    }
}
