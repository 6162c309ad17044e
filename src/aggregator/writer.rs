//! Buffered, deduplicating record writer

use crate::aggregator::record::{render_row, Column, Record};
use crate::aggregator::{AggregatorStats, IngestOutcome};
use crate::storage::{RecordSink, StorageError, StorageResult};
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How often the flush loop checks its triggers
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct Counters {
    total_received: u64,
    total_written: u64,
    duplicates_skipped: u64,
    write_operations: u64,
    errors: u64,
    by_target_key: BTreeMap<String, u64>,
    by_session: BTreeMap<String, u64>,
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Receives records from sessions and writes them to the sink in batches
///
/// A batch is flushed when the buffer reaches `buffer_size` records, or when
/// it is non-empty and `write_interval` has passed since the last successful
/// flush. A failed flush puts the batch back at the front of the buffer.
pub struct DataAggregator {
    sink: Arc<dyn RecordSink>,
    columns: Vec<Column>,
    buffer_size: usize,
    write_interval: Duration,
    seen: Mutex<HashSet<(String, String)>>,
    buffer: Mutex<Vec<Record>>,
    last_flush: Mutex<Instant>,
    /// Serializes flushes so batches reach the sink in order
    flush_lock: Mutex<()>,
    counters: Mutex<Counters>,
    shutdown: CancellationToken,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl DataAggregator {
    /// Creates an aggregator and initializes the sink
    ///
    /// # Arguments
    ///
    /// * `sink` - Append-only destination
    /// * `columns` - Columns to populate; the others are written empty
    /// * `buffer_size` - Record count that triggers a flush
    /// * `write_interval` - Maximum age of a non-empty buffer
    ///
    /// # Returns
    ///
    /// * `Ok(DataAggregator)` - Sink ready for appends
    /// * `Err(StorageError)` - Sink could not be initialized; this is fatal
    pub fn new(
        sink: Arc<dyn RecordSink>,
        columns: Vec<Column>,
        buffer_size: usize,
        write_interval: Duration,
    ) -> StorageResult<Self> {
        if sink.initialize()? {
            tracing::info!("Created record sink at {}", sink.location());
        } else {
            tracing::info!("Appending to existing record sink at {}", sink.location());
        }

        Ok(Self {
            sink,
            columns,
            buffer_size: buffer_size.max(1),
            write_interval,
            seen: Mutex::new(HashSet::new()),
            buffer: Mutex::new(Vec::new()),
            last_flush: Mutex::new(Instant::now()),
            flush_lock: Mutex::new(()),
            counters: Mutex::new(Counters::default()),
            shutdown: CancellationToken::new(),
            writer: Mutex::new(None),
        })
    }

    /// Accepts records produced by `session_id`
    ///
    /// Each record's (title, target_key) pair is checked and claimed in one
    /// step, so the first session to deliver a record wins and later copies
    /// are counted as duplicates.
    pub fn ingest(&self, records: Vec<Record>, session_id: &str) -> IngestOutcome {
        let mut outcome = IngestOutcome::default();
        let now = Utc::now();
        let mut accepted = Vec::with_capacity(records.len());

        {
            let mut seen = relock(&self.seen);
            for mut record in records {
                if !seen.insert(record.dedup_key()) {
                    tracing::debug!(title = %record.title, target = %record.target_key, "Skipping duplicate");
                    outcome.duplicates += 1;
                    continue;
                }
                record.processed_at = Some(now);
                accepted.push(record);
            }
        }

        outcome.accepted = accepted.len();

        {
            let mut counters = relock(&self.counters);
            counters.duplicates_skipped += outcome.duplicates as u64;
            counters.total_received += outcome.accepted as u64;
            for record in &accepted {
                *counters
                    .by_target_key
                    .entry(record.target_key.clone())
                    .or_insert(0) += 1;
            }
            if outcome.accepted > 0 {
                *counters
                    .by_session
                    .entry(session_id.to_string())
                    .or_insert(0) += outcome.accepted as u64;
            }
        }

        relock(&self.buffer).extend(accepted);

        tracing::info!(
            session = %session_id,
            accepted = outcome.accepted,
            duplicates = outcome.duplicates,
            "Ingested records"
        );
        outcome
    }

    /// Records waiting to be flushed
    pub fn buffered(&self) -> usize {
        relock(&self.buffer).len()
    }

    /// True when either flush trigger has fired
    fn should_flush(&self) -> bool {
        let buffered = self.buffered();
        if buffered == 0 {
            return false;
        }
        buffered >= self.buffer_size || relock(&self.last_flush).elapsed() >= self.write_interval
    }

    /// Writes the whole buffer to the sink
    ///
    /// # Returns
    ///
    /// * `Ok(n)` - Number of records written (0 when the buffer was empty)
    /// * `Err(StorageError)` - The sink refused the batch; records were put back
    pub fn flush(&self) -> StorageResult<usize> {
        let _guard = relock(&self.flush_lock);

        let batch = std::mem::take(&mut *relock(&self.buffer));
        if batch.is_empty() {
            return Ok(0);
        }

        let rows: Vec<Vec<String>> = batch
            .iter()
            .map(|record| render_row(record, &self.columns))
            .collect();

        match self.sink.append(&rows) {
            Ok(written) => {
                *relock(&self.last_flush) = Instant::now();
                let total = {
                    let mut counters = relock(&self.counters);
                    counters.total_written += written as u64;
                    counters.write_operations += 1;
                    counters.total_written
                };
                tracing::info!("Wrote {} records to sink (total: {})", written, total);
                Ok(written)
            }
            Err(e) => {
                relock(&self.counters).errors += 1;
                let mut buffer = relock(&self.buffer);
                let newer = std::mem::replace(&mut *buffer, batch);
                buffer.extend(newer);
                tracing::error!("Failed to write {} records: {}", rows.len(), e);
                Err(e)
            }
        }
    }

    /// Flushes everything buffered right now
    pub fn drain(&self) -> StorageResult<usize> {
        self.flush()
    }

    /// Runs `flush` on the blocking pool so the sink's I/O stays off the
    /// runtime threads
    pub async fn flush_blocking(self: &Arc<Self>) -> StorageResult<usize> {
        let aggregator = Arc::clone(self);
        match tokio::task::spawn_blocking(move || aggregator.flush()).await {
            Ok(result) => result,
            Err(e) => Err(StorageError::Unavailable(format!(
                "flush task ended abnormally: {}",
                e
            ))),
        }
    }

    /// Starts the background flush loop
    ///
    /// Calling this again while the loop is running has no effect.
    pub fn start(self: &Arc<Self>) {
        let mut writer = relock(&self.writer);
        if writer.is_some() {
            return;
        }

        let aggregator = Arc::clone(self);
        *writer = Some(tokio::spawn(aggregator.flush_loop()));
        tracing::info!("Started record writer");
    }

    async fn flush_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if self.should_flush() {
                        // Errors are counted and logged by flush; the batch stays buffered
                        let _ = self.flush_blocking().await;
                    }
                }
            }
        }
        tracing::debug!("Record writer loop exited");
    }

    /// Stops the flush loop and writes whatever is still buffered
    pub async fn stop(self: &Arc<Self>) -> StorageResult<usize> {
        self.shutdown.cancel();
        let handle = relock(&self.writer).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("Record writer task ended abnormally: {}", e);
            }
        }

        let written = self.flush_blocking().await?;
        tracing::info!("Record writer stopped");
        Ok(written)
    }

    /// Builds a snapshot of aggregator counters
    pub fn stats(&self) -> AggregatorStats {
        let buffer_size = self.buffered();
        let counters = relock(&self.counters);
        AggregatorStats {
            total_received: counters.total_received,
            total_written: counters.total_written,
            buffer_size,
            duplicates_skipped: counters.duplicates_skipped,
            write_operations: counters.write_operations,
            errors: counters.errors,
            by_target_key: counters.by_target_key.clone(),
            by_session: counters.by_session.clone(),
            sink_location: self.sink.location(),
        }
    }

    /// The most recently written rows, as column name / value pairs
    pub fn sample(&self, limit: usize) -> StorageResult<Vec<Vec<(&'static str, String)>>> {
        let rows = self.sink.recent(limit)?;
        Ok(rows
            .into_iter()
            .map(|row| {
                Column::ALL
                    .iter()
                    .map(|c| c.name())
                    .zip(row)
                    .collect()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteRecordSink;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn record(title: &str, target: &str) -> Record {
        let mut r = Record::new(title, target);
        r.price = "£10.00".to_string();
        r
    }

    fn records(n: usize, target: &str) -> Vec<Record> {
        (0..n).map(|i| record(&format!("Book {}", i), target)).collect()
    }

    fn aggregator(
        buffer_size: usize,
        write_interval: Duration,
    ) -> (Arc<DataAggregator>, Arc<SqliteRecordSink>) {
        let sink = Arc::new(SqliteRecordSink::open_in_memory().unwrap());
        let agg = DataAggregator::new(sink.clone(), Column::ALL.to_vec(), buffer_size, write_interval)
            .unwrap();
        (Arc::new(agg), sink)
    }

    /// Sink that can be switched into a failing state
    struct FlakySink {
        inner: SqliteRecordSink,
        failing: AtomicBool,
    }

    impl RecordSink for FlakySink {
        fn initialize(&self) -> StorageResult<bool> {
            self.inner.initialize()
        }

        fn append(&self, rows: &[Vec<String>]) -> StorageResult<usize> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StorageError::Unavailable("disk full".to_string()));
            }
            self.inner.append(rows)
        }

        fn count(&self) -> StorageResult<u64> {
            self.inner.count()
        }

        fn recent(&self, limit: usize) -> StorageResult<Vec<Vec<String>>> {
            self.inner.recent(limit)
        }

        fn location(&self) -> String {
            "flaky".to_string()
        }
    }

    #[test]
    fn test_duplicate_is_written_once() {
        let (agg, sink) = aggregator(50, Duration::from_secs(30));

        let first = agg.ingest(vec![record("Sharp Objects", "Mystery")], "mystery-1");
        let second = agg.ingest(vec![record("Sharp Objects", "Mystery")], "mystery-2");
        assert_eq!(first.accepted, 1);
        assert_eq!(second.duplicates, 1);

        agg.flush().unwrap();
        assert_eq!(sink.count().unwrap(), 1);

        let stats = agg.stats();
        assert_eq!(stats.duplicates_skipped, 1);
        assert_eq!(stats.total_received, 1);
        assert_eq!(stats.by_session.get("mystery-1"), Some(&1));
        assert_eq!(stats.by_session.get("mystery-2"), None);
    }

    #[test]
    fn test_same_title_different_target_is_not_duplicate() {
        let (agg, _) = aggregator(50, Duration::from_secs(30));
        let outcome = agg.ingest(
            vec![record("Sharp Objects", "Mystery"), record("Sharp Objects", "Fiction")],
            "s",
        );
        assert_eq!(outcome.accepted, 2);
        assert_eq!(outcome.duplicates, 0);
    }

    #[test]
    fn test_ingest_stamps_processed_at_and_counts_targets() {
        let (agg, _) = aggregator(50, Duration::from_secs(30));
        agg.ingest(records(3, "Fiction"), "fiction-1");
        agg.ingest(records(2, "Mystery"), "mystery-1");

        let buffer = relock(&agg.buffer);
        assert!(buffer.iter().all(|r| r.processed_at.is_some()));
        drop(buffer);

        let stats = agg.stats();
        assert_eq!(stats.by_target_key["Fiction"], 3);
        assert_eq!(stats.by_target_key["Mystery"], 2);
        assert_eq!(stats.buffer_size, 5);
    }

    #[test]
    fn test_flush_empty_buffer_is_noop() {
        let (agg, _) = aggregator(50, Duration::from_secs(30));
        assert_eq!(agg.flush().unwrap(), 0);
        assert_eq!(agg.stats().write_operations, 0);
    }

    #[test]
    fn test_failed_flush_rebuffers_in_order() {
        let sink = Arc::new(FlakySink {
            inner: SqliteRecordSink::open_in_memory().unwrap(),
            failing: AtomicBool::new(true),
        });
        let agg = DataAggregator::new(sink.clone(), Column::ALL.to_vec(), 50, Duration::from_secs(30))
            .unwrap();

        agg.ingest(vec![record("first", "Fiction")], "s");
        assert!(agg.flush().is_err());
        agg.ingest(vec![record("second", "Fiction")], "s");

        {
            let buffer = relock(&agg.buffer);
            let titles: Vec<&str> = buffer.iter().map(|r| r.title.as_str()).collect();
            assert_eq!(titles, vec!["first", "second"]);
        }
        assert_eq!(agg.stats().errors, 1);

        sink.failing.store(false, Ordering::SeqCst);
        assert_eq!(agg.flush().unwrap(), 2);

        let recent = sink.recent(10).unwrap();
        assert_eq!(recent[0][0], "first");
        assert_eq!(recent[1][0], "second");
        assert_eq!(agg.stats().total_written, 2);
    }

    #[test]
    fn test_unconfigured_columns_written_empty() {
        let sink = Arc::new(SqliteRecordSink::open_in_memory().unwrap());
        let agg = DataAggregator::new(
            sink.clone(),
            vec![Column::Title, Column::TargetKey],
            50,
            Duration::from_secs(30),
        )
        .unwrap();

        agg.ingest(vec![record("Tipping the Velvet", "Historical Fiction")], "s");
        agg.flush().unwrap();

        let sample = agg.sample(1).unwrap();
        let row: BTreeMap<&str, String> = sample[0].iter().cloned().collect();
        assert_eq!(row["title"], "Tipping the Velvet");
        assert_eq!(row["target_key"], "Historical Fiction");
        assert_eq!(row["price"], "");
    }

    #[tokio::test]
    async fn test_size_trigger_flushes_before_interval() {
        let (agg, sink) = aggregator(50, Duration::from_secs(30));
        agg.start();

        agg.ingest(records(50, "Fiction"), "s");
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(sink.count().unwrap(), 50);
        assert_eq!(agg.stats().write_operations, 1);
        agg.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_below_size_waits_for_interval() {
        let (agg, sink) = aggregator(50, Duration::from_millis(500));
        agg.start();

        agg.ingest(records(1, "Fiction"), "s");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.count().unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(sink.count().unwrap(), 1);
        agg.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_drains_buffer() {
        let (agg, sink) = aggregator(50, Duration::from_secs(30));
        agg.start();
        agg.ingest(records(7, "Poetry"), "s");

        assert_eq!(agg.stop().await.unwrap(), 7);
        assert_eq!(sink.count().unwrap(), 7);
        assert_eq!(agg.stats().buffer_size, 0);
    }

    #[tokio::test]
    async fn test_flush_runs_off_the_runtime_thread() {
        struct SlowSink(SqliteRecordSink);

        impl RecordSink for SlowSink {
            fn initialize(&self) -> StorageResult<bool> {
                self.0.initialize()
            }
            fn append(&self, rows: &[Vec<String>]) -> StorageResult<usize> {
                std::thread::sleep(Duration::from_millis(300));
                self.0.append(rows)
            }
            fn count(&self) -> StorageResult<u64> {
                self.0.count()
            }
            fn recent(&self, limit: usize) -> StorageResult<Vec<Vec<String>>> {
                self.0.recent(limit)
            }
            fn location(&self) -> String {
                self.0.location()
            }
        }

        let sink = Arc::new(SlowSink(SqliteRecordSink::open_in_memory().unwrap()));
        let agg = Arc::new(
            DataAggregator::new(sink.clone(), Column::ALL.to_vec(), 50, Duration::from_secs(30))
                .unwrap(),
        );
        agg.ingest(records(3, "Fiction"), "s");

        let started = std::time::Instant::now();
        let flush = tokio::spawn({
            let agg = Arc::clone(&agg);
            async move { agg.flush_blocking().await }
        });

        // The single runtime thread stays free while the sink is busy
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(started.elapsed() < Duration::from_millis(200));

        assert_eq!(flush.await.unwrap().unwrap(), 3);
        assert_eq!(sink.count().unwrap(), 3);
    }

    #[test]
    fn test_sink_initialize_failure_is_fatal() {
        struct BrokenSink;

        impl RecordSink for BrokenSink {
            fn initialize(&self) -> StorageResult<bool> {
                Err(StorageError::SchemaMismatch {
                    expected: "title,price".to_string(),
                    found: "title".to_string(),
                })
            }
            fn append(&self, _rows: &[Vec<String>]) -> StorageResult<usize> {
                Ok(0)
            }
            fn count(&self) -> StorageResult<u64> {
                Ok(0)
            }
            fn recent(&self, _limit: usize) -> StorageResult<Vec<Vec<String>>> {
                Ok(Vec::new())
            }
            fn location(&self) -> String {
                "broken".to_string()
            }
        }

        let result = DataAggregator::new(
            Arc::new(BrokenSink),
            Column::ALL.to_vec(),
            10,
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(StorageError::SchemaMismatch { .. })));
    }
}
