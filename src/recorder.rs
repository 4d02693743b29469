use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write as _};
use std::path::Path;

use anyhow::Context as _;
use serde::Serialize;

use crate::types::now_ms;

// Telemetry volume is a heartbeat every few seconds; the age trigger is the
// one that fires in practice.
const FLUSH_AFTER_LINES: usize = 50;
const FLUSH_AFTER_MS: u64 = 1_000;

/// Append-only JSONL writer for telemetry rows, one serialized value per
/// line.
pub struct JsonlAppender {
    out: BufWriter<File>,
    unflushed: usize,
    last_flush_ms: u64,
}

impl JsonlAppender {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open jsonl {}", path.display()))?;
        Ok(Self {
            out: BufWriter::new(file),
            unflushed: 0,
            last_flush_ms: now_ms(),
        })
    }

    /// Serialize `row` onto its own line, flushing once enough lines or
    /// enough time has accumulated.
    pub fn append<T: Serialize>(&mut self, row: &T) -> anyhow::Result<()> {
        let line = serde_json::to_string(row).context("serialize jsonl row")?;
        self.out.write_all(line.as_bytes())?;
        self.out.write_all(b"\n")?;
        self.unflushed += 1;

        let stale = now_ms().saturating_sub(self.last_flush_ms) >= FLUSH_AFTER_MS;
        if self.unflushed >= FLUSH_AFTER_LINES || stale {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        self.out.flush().context("flush jsonl")?;
        self.unflushed = 0;
        self.last_flush_ms = now_ms();
        Ok(())
    }

    /// Flush and fsync; called on shutdown so the tail survives the exit.
    pub fn flush_and_sync(&mut self) -> anyhow::Result<()> {
        self.flush()?;
        self.out.get_ref().sync_all().context("sync jsonl")?;
        Ok(())
    }
}
