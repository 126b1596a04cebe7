//! Sequential reading of one split.
//!
//! A [`SplitReader`] owns exactly one log cursor, opened lazily on the first
//! call to [`SplitReader::next`] and released as soon as the split is
//! exhausted, fails, is closed, or the reader is dropped.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use tracing::{debug, warn};

use crate::batch::RowBatchBuilder;
use crate::config::KafkaConfig;
use crate::decoder::DecodeErrorPolicy;
use crate::error::{KafkaError, Result};
use crate::log::{LogCursor, LogError, LogRecord, LogService};
use crate::retry::{pause, Backoff, RetryPolicy, Sleeper, TokioSleeper};
use crate::split::KafkaSplit;
use crate::types::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// No cursor opened yet.
    Unopened,
    /// The next record is at or after this offset.
    Positioned(i64),
    Exhausted,
    Failed,
    Closed,
}

impl ReaderState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ReaderState::Exhausted | ReaderState::Failed | ReaderState::Closed)
    }
}

#[derive(Debug, Clone)]
pub struct ReaderOptions {
    pub fetch_max_records: usize,
    pub retry: RetryPolicy,
    pub sleeper: Arc<dyn Sleeper>,
}

impl ReaderOptions {
    pub fn from_config(config: &KafkaConfig) -> Self {
        Self {
            fetch_max_records: config.fetch_max_records,
            retry: config.retry_policy(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self::from_config(&KafkaConfig::default())
    }
}

/// Releases its cursor exactly once, on [`CursorGuard::release`] or drop.
#[derive(Default)]
pub struct CursorGuard {
    cursor: Option<Box<dyn LogCursor>>,
}

impl CursorGuard {
    pub fn new(cursor: Box<dyn LogCursor>) -> Self {
        Self { cursor: Some(cursor) }
    }

    pub fn is_held(&self) -> bool {
        self.cursor.is_some()
    }

    fn get(&mut self) -> Option<&mut Box<dyn LogCursor>> {
        self.cursor.as_mut()
    }

    pub fn release(&mut self) {
        if let Some(mut cursor) = self.cursor.take() {
            cursor.close();
        }
    }
}

impl Drop for CursorGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for CursorGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorGuard").field("held", &self.is_held()).finish()
    }
}

/// Produces the rows of one split in offset order.
#[derive(Debug)]
pub struct SplitReader {
    split: KafkaSplit,
    log: Arc<dyn LogService>,
    options: ReaderOptions,
    state: ReaderState,
    cursor: CursorGuard,
    buffer: VecDeque<LogRecord>,
}

impl SplitReader {
    /// Creates a reader for `split`. No log resources are taken until the
    /// first call to `next`.
    pub fn open(split: KafkaSplit, log: Arc<dyn LogService>, options: ReaderOptions) -> Self {
        Self {
            split,
            log,
            options,
            state: ReaderState::Unopened,
            cursor: CursorGuard::default(),
            buffer: VecDeque::new(),
        }
    }

    pub fn split(&self) -> &KafkaSplit {
        &self.split
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Whether the reader currently holds a log cursor.
    pub fn holds_cursor(&self) -> bool {
        self.cursor.is_held()
    }

    /// Next decoded row, or `None` once the split is exhausted or closed.
    pub async fn next(&mut self) -> Result<Option<Row>> {
        loop {
            match self.state {
                ReaderState::Exhausted | ReaderState::Closed => return Ok(None),
                ReaderState::Failed => {
                    return Err(KafkaError::ReaderFailed { split: self.split.to_string() })
                }
                ReaderState::Unopened | ReaderState::Positioned(_) => {}
            }
            if self.split.context.is_cancelled() {
                return Err(self.cancelled());
            }

            let Some(record) = self.next_record().await? else {
                return Ok(None);
            };
            let ctx = &self.split.context;
            ctx.metrics.record_read();
            match ctx.binding.decode_row(&record, self.split.start, self.split.end) {
                Ok(row) => {
                    ctx.metrics.row_produced();
                    return Ok(Some(row));
                }
                Err(source) => match ctx.binding.on_decode_error {
                    DecodeErrorPolicy::Skip => {
                        ctx.metrics.record_skipped();
                        warn!(split = %self.split, offset = record.offset, error = %source, "skipping undecodable record");
                    }
                    DecodeErrorPolicy::Fail => {
                        self.fail();
                        return Err(KafkaError::Decode {
                            split: self.split.to_string(),
                            offset: record.offset,
                            source,
                        });
                    }
                },
            }
        }
    }

    /// Reads up to `max_rows` rows into one batch through `builder`.
    pub async fn next_batch(
        &mut self,
        builder: &mut RowBatchBuilder,
        max_rows: usize,
    ) -> Result<Option<RecordBatch>> {
        while builder.len() < max_rows {
            match self.next().await? {
                Some(row) => builder.append(row)?,
                None => break,
            }
        }
        if builder.is_empty() {
            return Ok(None);
        }
        Ok(Some(builder.finish()?))
    }

    /// A batch builder over this reader's table; `projection` holds column
    /// indices.
    pub fn batch_builder(&self, projection: Option<&[usize]>, capacity: usize) -> Result<RowBatchBuilder> {
        Ok(RowBatchBuilder::new(&self.split.context.binding.columns, projection, capacity)?)
    }

    /// Stops reading and releases the cursor. Safe to call more than once.
    pub fn close(&mut self) {
        if !self.state.is_terminal() {
            self.state = ReaderState::Closed;
        }
        self.cursor.release();
        self.buffer.clear();
    }

    async fn next_record(&mut self) -> Result<Option<LogRecord>> {
        loop {
            let position = match self.state {
                ReaderState::Unopened => self.split.start,
                ReaderState::Positioned(offset) => offset,
                _ => return Ok(None),
            };

            while let Some(record) = self.buffer.pop_front() {
                if record.offset < position {
                    continue;
                }
                if record.offset >= self.split.end {
                    self.finish();
                    return Ok(None);
                }
                self.state = ReaderState::Positioned(record.offset + 1);
                return Ok(Some(record));
            }

            if position >= self.split.end {
                self.finish();
                return Ok(None);
            }
            let records = self.fetch(position).await?;
            if records.is_empty() {
                // Nothing at or after the position: the rest of the range was
                // removed by retention.
                self.finish();
                return Ok(None);
            }
            self.buffer.extend(records);
            self.state = ReaderState::Positioned(position);
        }
    }

    async fn fetch(&mut self, position: i64) -> Result<Vec<LogRecord>> {
        let remaining = usize::try_from(self.split.end - position).unwrap_or(usize::MAX);
        let max_records = self.options.fetch_max_records.min(remaining).max(1);
        let mut backoff = Backoff::new(self.options.retry);
        loop {
            if !self.cursor.is_held() {
                match self
                    .log
                    .open_cursor(&self.split.topic, self.split.partition, position)
                    .await
                {
                    Ok(cursor) => {
                        debug!(split = %self.split, position, "opened cursor");
                        self.cursor = CursorGuard::new(cursor);
                    }
                    Err(err) => {
                        self.handle_log_error(&mut backoff, err).await?;
                        continue;
                    }
                }
            }

            let result = match self.cursor.get() {
                Some(cursor) => cursor.fetch(max_records).await,
                None => continue,
            };
            match result {
                Ok(records) => {
                    debug!(
                        split = %self.split,
                        partition = self.split.partition,
                        position,
                        records = records.len(),
                        "fetched records"
                    );
                    return Ok(records);
                }
                Err(err) => self.handle_log_error(&mut backoff, err).await?,
            }
        }
    }

    /// Waits out a retryable failure, or turns it into the reader's terminal
    /// error.
    async fn handle_log_error(&mut self, backoff: &mut Backoff, err: LogError) -> Result<()> {
        match backoff.on_failure() {
            Some(delay) if err.is_retryable() => {
                self.split.context.metrics.retried();
                warn!(
                    split = %self.split,
                    attempt = backoff.attempts(),
                    ?delay,
                    error = %err,
                    "transient log failure, retrying"
                );
                let cancel = self.split.context.cancel.clone();
                if pause(self.options.sleeper.as_ref(), &cancel, delay).await {
                    Ok(())
                } else {
                    Err(self.cancelled())
                }
            }
            _ => {
                self.fail();
                Err(KafkaError::FatalSplitFailure {
                    split: self.split.to_string(),
                    attempts: backoff.attempts(),
                    source: err,
                })
            }
        }
    }

    fn finish(&mut self) {
        self.state = ReaderState::Exhausted;
        self.cursor.release();
        self.buffer.clear();
        self.split.context.metrics.split_completed();
        debug!(split = %self.split, "split exhausted");
    }

    fn fail(&mut self) {
        self.state = ReaderState::Failed;
        self.cursor.release();
        self.buffer.clear();
        self.split.context.metrics.split_failed();
    }

    fn cancelled(&mut self) -> KafkaError {
        self.close();
        debug!(split = %self.split, "split cancelled");
        KafkaError::Cancelled(self.split.to_string())
    }
}
