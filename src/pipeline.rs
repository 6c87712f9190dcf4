//! Pipeline coordinator: fans reader tasks into one encode path and one
//! sink path, with checkpointed skip, batch flushing, and drain.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::{Semaphore, mpsc};
use tracing::{error, info, warn};

use crate::error::PipelineError;
use crate::models::{ChunkItem, ChunkKey, EmbeddingRow, PipelineConfig};
use crate::services::{EmbeddingSink, Encoder, TokenChunker};
use crate::sources::{
    CorpusLocation, SourceHandle, SourceStats, local, process_source_lines, s3::S3Client,
};
use crate::utils::retry::{RetryConfig, with_retry};

/// Consecutive encoder failures tolerated before the run aborts.
const MAX_ENCODER_FAILURES: u32 = 3;

/// Totals reported at the end of every run, success or partial failure.
#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    pub sources: u64,
    pub chunks_embedded: u64,
    pub chunks_skipped: u64,
    pub records_processed: u64,
    pub records_empty: u64,
    pub lines_failed: u64,
    pub failed_batches: u64,
    pub dropped_encode_batches: u64,
    pub elapsed_secs: f64,
}

impl RunSummary {
    pub fn throughput(&self) -> f64 {
        if self.elapsed_secs > 0.0 {
            self.chunks_embedded as f64 / self.elapsed_secs
        } else {
            0.0
        }
    }

    fn absorb(&mut self, stats: SourceStats) {
        self.records_processed += stats.records_processed;
        self.records_empty += stats.records_empty;
        self.lines_failed += stats.lines_failed;
    }
}

/// What a run produced. A fatal encoder error still carries the summary of
/// everything committed before the abort.
pub struct RunOutcome {
    pub summary: RunSummary,
    pub fatal: Option<PipelineError>,
}

pub struct Pipeline {
    config: PipelineConfig,
    encoder: Arc<dyn Encoder>,
    sink: Arc<dyn EmbeddingSink>,
    shutdown: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        encoder: Arc<dyn Encoder>,
        sink: Arc<dyn EmbeddingSink>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            encoder,
            sink,
            shutdown,
        }
    }

    /// Run the full pipeline over one corpus.
    ///
    /// Setup failures (no sources, checkpoint load) return `Err`; everything
    /// after that point is reported through the outcome so the summary of
    /// committed work is never lost.
    pub async fn run(
        &self,
        corpus: &CorpusLocation,
        chunker: Arc<TokenChunker>,
    ) -> Result<RunOutcome, PipelineError> {
        let started = Instant::now();

        // DISCOVER_SOURCES
        let s3_client: Option<Arc<S3Client>> = match corpus {
            CorpusLocation::S3 { bucket, prefix } => {
                Some(Arc::new(S3Client::new(bucket, prefix)?))
            }
            CorpusLocation::Glob(_) => None,
        };

        let handles: Vec<SourceHandle> = match (&corpus, &s3_client) {
            (CorpusLocation::Glob(pattern), _) => local::discover(pattern)?
                .into_iter()
                .map(SourceHandle::File)
                .collect(),
            (CorpusLocation::S3 { .. }, Some(client)) => {
                with_retry(&RetryConfig::default(), "list objects", || {
                    client.list_jsonl_keys()
                })
                .await?
                .into_iter()
                .map(SourceHandle::Object)
                .collect()
            }
            (CorpusLocation::S3 { .. }, None) => Vec::new(),
        };

        if handles.is_empty() {
            return Err(PipelineError::NoSources(corpus.to_string()));
        }
        info!("discovered {} sources in {}", handles.len(), corpus);

        let processed: HashSet<ChunkKey> = if self.config.resume {
            self.sink.load_processed().await?
        } else {
            HashSet::new()
        };

        let source_count = handles.len() as u64;

        // STREAM: reader pool feeding a bounded channel.
        let (tx, rx) = mpsc::channel::<ChunkItem>(self.config.encode_batch.max(1) * 2);
        let semaphore = Arc::new(Semaphore::new(self.config.worker_count()));

        let mut readers = Vec::with_capacity(handles.len());
        for handle in handles {
            let tx = tx.clone();
            let semaphore = semaphore.clone();
            let chunker = chunker.clone();
            let s3 = s3_client.clone();
            let shutdown = self.shutdown.clone();
            readers.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return SourceStats::default();
                };
                if shutdown.load(Ordering::SeqCst) {
                    return SourceStats::default();
                }
                read_source(handle, chunker, tx, s3).await
            }));
        }
        drop(tx);

        let (mut summary, fatal) = self.consume(rx, processed).await;
        summary.sources = source_count;

        for reader in readers {
            match reader.await {
                Ok(stats) => summary.absorb(stats),
                Err(e) => warn!("reader task panicked: {}", e),
            }
        }

        summary.elapsed_secs = started.elapsed().as_secs_f64();
        Ok(RunOutcome { summary, fatal })
    }

    /// The single consumer loop: pull chunks, skip checkpointed keys, cut
    /// FIFO encode batches, buffer rows, flush the sink at its threshold,
    /// and drain both partial batches at end-of-stream.
    async fn consume(
        &self,
        mut rx: mpsc::Receiver<ChunkItem>,
        mut processed: HashSet<ChunkKey>,
    ) -> (RunSummary, Option<PipelineError>) {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {pos} chunks encoded ({per_sec})")
                .unwrap(),
        );

        let mut summary = RunSummary::default();
        let mut pending: Vec<ChunkItem> = Vec::with_capacity(self.config.encode_batch);
        let mut sink_buffer: Vec<EmbeddingRow> = Vec::with_capacity(self.config.sink_batch);
        let mut encoder_failures = 0u32;
        let mut fatal: Option<PipelineError> = None;

        loop {
            let item = tokio::select! {
                item = rx.recv() => item,
                _ = tokio::time::sleep(Duration::from_millis(250)) => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        warn!("interrupt received, stopping intake");
                        break;
                    }
                    continue;
                }
            };
            let Some(item) = item else {
                break; // all readers finished
            };
            if self.shutdown.load(Ordering::SeqCst) {
                warn!("interrupt received, stopping intake");
                break;
            }

            if processed.contains(&item.key()) {
                summary.chunks_skipped += 1;
                continue;
            }
            pending.push(item);

            if pending.len() >= self.config.encode_batch {
                let batch: Vec<ChunkItem> = pending.drain(..self.config.encode_batch).collect();
                if let Err(e) = self
                    .encode_into(batch, &mut sink_buffer, &pb, &mut encoder_failures, &mut summary)
                    .await
                {
                    fatal = Some(e);
                    break;
                }
                if sink_buffer.len() >= self.config.sink_batch {
                    self.flush_sink(&mut sink_buffer, &mut processed, &mut summary)
                        .await;
                }
            }
        }

        // Unblock any reader parked on a full channel.
        drop(rx);
        let interrupted = self.shutdown.load(Ordering::SeqCst);

        // DRAIN: the final partial encode batch is still encoded, unless the
        // run is aborting (interrupt or fatal encoder), in which case only
        // already-computed vectors are flushed.
        if fatal.is_none() && !interrupted {
            while !pending.is_empty() {
                let take = pending.len().min(self.config.encode_batch);
                let batch: Vec<ChunkItem> = pending.drain(..take).collect();
                if let Err(e) = self
                    .encode_into(batch, &mut sink_buffer, &pb, &mut encoder_failures, &mut summary)
                    .await
                {
                    fatal = Some(e);
                    break;
                }
            }
        }
        self.flush_sink(&mut sink_buffer, &mut processed, &mut summary)
            .await;

        pb.finish_and_clear();
        (summary, fatal)
    }

    /// Encode one FIFO batch and append the rows to the sink buffer. A
    /// failed batch is dropped; repeated consecutive failures are fatal.
    async fn encode_into(
        &self,
        batch: Vec<ChunkItem>,
        sink_buffer: &mut Vec<EmbeddingRow>,
        pb: &ProgressBar,
        failures: &mut u32,
        summary: &mut RunSummary,
    ) -> Result<(), PipelineError> {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();

        match self.encoder.encode(&texts).await {
            Ok(vectors) => {
                if vectors.len() != batch.len() {
                    *failures += 1;
                    summary.dropped_encode_batches += 1;
                    error!(
                        "encoder returned {} vectors for {} inputs, dropping batch",
                        vectors.len(),
                        batch.len()
                    );
                } else {
                    *failures = 0;
                    pb.inc(batch.len() as u64);
                    for (item, embedding) in batch.into_iter().zip(vectors) {
                        sink_buffer.push(EmbeddingRow {
                            url: item.url,
                            chunk_id: item.chunk_id,
                            embedding,
                        });
                    }
                }
            }
            Err(e) => {
                *failures += 1;
                summary.dropped_encode_batches += 1;
                error!("encoder failed on a batch of {}: {}", texts.len(), e);
            }
        }

        if *failures >= MAX_ENCODER_FAILURES {
            return Err(PipelineError::EncoderFailing(*failures));
        }
        Ok(())
    }

    /// Commit the sink buffer in one transaction. Only after a successful
    /// commit are the keys marked processed; a failed batch is rolled back,
    /// tallied, and dropped so the run can continue.
    async fn flush_sink(
        &self,
        sink_buffer: &mut Vec<EmbeddingRow>,
        processed: &mut HashSet<ChunkKey>,
        summary: &mut RunSummary,
    ) {
        if sink_buffer.is_empty() {
            return;
        }
        let rows = std::mem::take(sink_buffer);
        match self.sink.upsert(&rows).await {
            Ok(committed) => {
                summary.chunks_embedded += committed as u64;
                for row in rows {
                    processed.insert((row.url, row.chunk_id));
                }
            }
            Err(e) => {
                summary.failed_batches += 1;
                error!(
                    "sink batch of {} rows failed and was dropped: {}",
                    rows.len(),
                    e
                );
            }
        }
    }
}

/// Read one source to completion, sending its chunks into the channel.
/// Whole-source failures are logged and yield zero chunks; they never take
/// down the run.
async fn read_source(
    handle: SourceHandle,
    chunker: Arc<TokenChunker>,
    tx: mpsc::Sender<ChunkItem>,
    s3: Option<Arc<S3Client>>,
) -> SourceStats {
    match handle {
        SourceHandle::File(path) => {
            let name = path.display().to_string();
            let result = tokio::task::spawn_blocking(move || {
                let lines = match local::read_lines(&path) {
                    Ok(lines) => lines,
                    Err(e) => {
                        error!("source {} failed: {}", path.display(), e);
                        return SourceStats::default();
                    }
                };
                process_source_lines(&name, lines, |text| chunker.chunk(text), &tx)
            })
            .await;
            result.unwrap_or_else(|e| {
                error!("reader thread failed: {}", e);
                SourceStats::default()
            })
        }
        SourceHandle::Object(key) => {
            let Some(client) = s3 else {
                return SourceStats::default();
            };
            let body = with_retry(&RetryConfig::default(), "fetch object", || {
                client.fetch(&key)
            })
            .await;
            let body = match body {
                Ok(body) => body,
                Err(e) => {
                    error!("source s3:{} failed: {}", key, e);
                    return SourceStats::default();
                }
            };
            let name = format!("s3:{key}");
            let result = tokio::task::spawn_blocking(move || {
                let lines = body.lines().map(|l| Ok::<_, std::io::Error>(l.to_string()));
                process_source_lines(&name, lines, |text| chunker.chunk(text), &tx)
            })
            .await;
            result.unwrap_or_else(|e| {
                error!("reader thread failed: {}", e);
                SourceStats::default()
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;

    use crate::error::{ModelError, StoreError};

    /// Encoder fake: records batch sizes, optionally fails the first N calls.
    struct FakeEncoder {
        batches: Mutex<Vec<usize>>,
        fail_first: AtomicU32,
    }

    impl FakeEncoder {
        fn new(fail_first: u32) -> Self {
            Self {
                batches: Mutex::new(Vec::new()),
                fail_first: AtomicU32::new(fail_first),
            }
        }
    }

    #[async_trait]
    impl Encoder for FakeEncoder {
        fn dimension(&self) -> usize {
            2
        }

        async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ModelError::InferenceError("boom".to_string()));
            }
            self.batches.lock().unwrap().push(texts.len());
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    /// Sink fake: collects committed rows, optionally fails the first N calls.
    struct FakeSink {
        rows: Mutex<Vec<EmbeddingRow>>,
        preloaded: HashSet<ChunkKey>,
        fail_first: AtomicU32,
    }

    impl FakeSink {
        fn new() -> Self {
            Self {
                rows: Mutex::new(Vec::new()),
                preloaded: HashSet::new(),
                fail_first: AtomicU32::new(0),
            }
        }

        fn with_processed(keys: &[(&str, i32)]) -> Self {
            let mut sink = Self::new();
            sink.preloaded = keys
                .iter()
                .map(|(url, id)| (url.to_string(), *id))
                .collect();
            sink
        }

        fn failing_first(n: u32) -> Self {
            let sink = Self::new();
            sink.fail_first.store(n, Ordering::SeqCst);
            sink
        }

        fn committed(&self) -> Vec<(String, i32)> {
            self.rows
                .lock()
                .unwrap()
                .iter()
                .map(|r| (r.url.clone(), r.chunk_id))
                .collect()
        }
    }

    #[async_trait]
    impl EmbeddingSink for FakeSink {
        async fn load_processed(&self) -> Result<HashSet<ChunkKey>, StoreError> {
            Ok(self.preloaded.clone())
        }

        async fn upsert(&self, rows: &[EmbeddingRow]) -> Result<usize, StoreError> {
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::UpsertError("write conflict".to_string()));
            }
            self.rows.lock().unwrap().extend_from_slice(rows);
            Ok(rows.len())
        }
    }

    fn item(url: &str, chunk_id: i32) -> ChunkItem {
        ChunkItem {
            url: url.to_string(),
            chunk_id,
            text: format!("{url}#{chunk_id}"),
        }
    }

    fn pipeline_with(
        encoder: Arc<FakeEncoder>,
        sink: Arc<FakeSink>,
        encode_batch: usize,
        sink_batch: usize,
    ) -> Pipeline {
        let config = PipelineConfig {
            encode_batch,
            sink_batch,
            workers: 1,
            resume: true,
        };
        Pipeline::new(config, encoder, sink, Arc::new(AtomicBool::new(false)))
    }

    async fn feed_and_consume(
        pipeline: &Pipeline,
        sink: &FakeSink,
        items: Vec<ChunkItem>,
    ) -> (RunSummary, Option<PipelineError>) {
        let (tx, rx) = mpsc::channel(64);
        for item in items {
            tx.send(item).await.unwrap();
        }
        drop(tx);
        let processed = sink.load_processed().await.unwrap();
        pipeline.consume(rx, processed).await
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn checkpointed_chunks_are_skipped_not_reembedded() {
        let encoder = Arc::new(FakeEncoder::new(0));
        let sink = Arc::new(FakeSink::with_processed(&[("http://a", 0)]));
        let pipeline = pipeline_with(encoder.clone(), sink.clone(), 1, 1);

        let (summary, fatal) = feed_and_consume(
            &pipeline,
            &sink,
            vec![item("http://a", 0), item("http://a", 1)],
        )
        .await;

        assert!(fatal.is_none());
        assert_eq!(summary.chunks_skipped, 1);
        assert_eq!(summary.chunks_embedded, 1);
        assert_eq!(sink.committed(), vec![("http://a".to_string(), 1)]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn batches_are_cut_fifo_at_exact_size() {
        let encoder = Arc::new(FakeEncoder::new(0));
        let sink = Arc::new(FakeSink::new());
        let pipeline = pipeline_with(encoder.clone(), sink.clone(), 2, 100);

        let items: Vec<ChunkItem> = (0..5).map(|i| item("http://a", i)).collect();
        let (summary, fatal) = feed_and_consume(&pipeline, &sink, items).await;

        assert!(fatal.is_none());
        // Two full batches in STREAM, the remainder encoded in DRAIN.
        assert_eq!(*encoder.batches.lock().unwrap(), vec![2, 2, 1]);
        assert_eq!(summary.chunks_embedded, 5);
        // Order preserved end to end.
        let ids: Vec<i32> = sink.committed().iter().map(|(_, id)| *id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn partial_batches_are_flushed_at_end_of_stream() {
        let encoder = Arc::new(FakeEncoder::new(0));
        let sink = Arc::new(FakeSink::new());
        // Thresholds far above the item count: everything rides the drain.
        let pipeline = pipeline_with(encoder.clone(), sink.clone(), 100, 100);

        let items: Vec<ChunkItem> = (0..3).map(|i| item("http://a", i)).collect();
        let (summary, fatal) = feed_and_consume(&pipeline, &sink, items).await;

        assert!(fatal.is_none());
        assert_eq!(summary.chunks_embedded, 3);
        assert_eq!(sink.committed().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_sink_batch_is_dropped_and_run_continues() {
        let encoder = Arc::new(FakeEncoder::new(0));
        let sink = Arc::new(FakeSink::failing_first(1));
        let pipeline = pipeline_with(encoder.clone(), sink.clone(), 1, 1);

        let items: Vec<ChunkItem> = (0..3).map(|i| item("http://a", i)).collect();
        let (summary, fatal) = feed_and_consume(&pipeline, &sink, items).await;

        assert!(fatal.is_none());
        assert_eq!(summary.failed_batches, 1);
        assert_eq!(summary.chunks_embedded, 2);
        assert_eq!(sink.committed().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn repeated_encoder_failure_is_fatal() {
        let encoder = Arc::new(FakeEncoder::new(u32::MAX));
        let sink = Arc::new(FakeSink::new());
        let pipeline = pipeline_with(encoder.clone(), sink.clone(), 1, 100);

        let items: Vec<ChunkItem> = (0..10).map(|i| item("http://a", i)).collect();
        let (summary, fatal) = feed_and_consume(&pipeline, &sink, items).await;

        assert!(matches!(fatal, Some(PipelineError::EncoderFailing(_))));
        assert_eq!(summary.chunks_embedded, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn one_encoder_failure_drops_batch_but_run_recovers() {
        let encoder = Arc::new(FakeEncoder::new(1));
        let sink = Arc::new(FakeSink::new());
        let pipeline = pipeline_with(encoder.clone(), sink.clone(), 1, 100);

        let items: Vec<ChunkItem> = (0..4).map(|i| item("http://a", i)).collect();
        let (summary, fatal) = feed_and_consume(&pipeline, &sink, items).await;

        assert!(fatal.is_none());
        // First batch lost to the failure, the rest committed.
        assert_eq!(summary.chunks_embedded, 3);
        assert_eq!(summary.dropped_encode_batches, 1);
        assert_eq!(summary.failed_batches, 0);
    }
}
