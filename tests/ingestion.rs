//! End-to-end checks of the batch ingestion routine against scripted providers.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use supportbot::document::Metadata;
use supportbot::{
    ingest_documents, Document, Embedder, IngestConfig, IngestError, IngestReport,
    LocalVectorStore, MetadataValue, SearchHit, Sleeper, VectorStore,
};

/// Fails the calls whose 0-based numbers are listed, otherwise echoes a vector per text.
struct ScriptedEmbedder {
    failing_calls: HashSet<usize>,
    calls: Cell<usize>,
    seen: RefCell<Vec<Vec<String>>>,
}

impl ScriptedEmbedder {
    fn failing_on(calls: impl IntoIterator<Item = usize>) -> Self {
        Self {
            failing_calls: calls.into_iter().collect(),
            calls: Cell::new(0),
            seen: RefCell::new(Vec::new()),
        }
    }

    fn reliable() -> Self {
        Self::failing_on([])
    }
}

impl Embedder for ScriptedEmbedder {
    fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let call = self.calls.get();
        self.calls.set(call + 1);
        self.seen
            .borrow_mut()
            .push(texts.iter().map(|t| t.to_string()).collect());
        if self.failing_calls.contains(&call) {
            bail!("503 service unavailable (call {call})");
        }
        Ok(texts
            .iter()
            .map(|t| vec![t.len() as f32, 1.0])
            .collect())
    }
}

/// Keeps every `add` call verbatim.
#[derive(Default)]
struct RecordingStore {
    adds: Vec<(Vec<String>, Vec<Vec<f32>>, Vec<Metadata>, Vec<String>)>,
    fail_on_add: Option<usize>,
}

impl VectorStore for RecordingStore {
    fn add(
        &mut self,
        ids: &[String],
        vectors: &[Vec<f32>],
        metadatas: &[Metadata],
        texts: &[String],
    ) -> Result<()> {
        if self.fail_on_add == Some(self.adds.len()) {
            bail!("disk full");
        }
        self.adds.push((
            ids.to_vec(),
            vectors.to_vec(),
            metadatas.to_vec(),
            texts.to_vec(),
        ));
        Ok(())
    }

    fn similarity_search(&self, _query: &[f32], _k: usize) -> Result<Vec<SearchHit>> {
        Ok(Vec::new())
    }

    fn len(&self) -> usize {
        self.adds.iter().map(|add| add.0.len()).sum()
    }
}

#[derive(Default)]
struct RecordingSleeper {
    waits: RefCell<Vec<Duration>>,
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.waits.borrow_mut().push(duration);
    }
}

/// Formatted log events and sleeps, in the order they happened.
#[derive(Clone, Default)]
struct Timeline(Arc<Mutex<Vec<String>>>);

impl io::Write for Timeline {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().push(String::from_utf8_lossy(buf).into_owned());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Sleeper for Timeline {
    fn sleep(&self, duration: Duration) {
        self.0.lock().push(format!("sleep {}s", duration.as_secs()));
    }
}

fn documents(n: usize) -> Vec<Document> {
    (0..n)
        .map(|i| {
            Document::new(format!("document number {i}"))
                .with_metadata("source", format!("doc-{i}.txt"))
        })
        .collect()
}

fn config(batch_size: usize) -> IngestConfig {
    IngestConfig::new(batch_size, 3, Duration::from_secs(2)).unwrap()
}

#[test]
fn scenario_450_documents_with_flaky_second_batch() {
    let docs = documents(450);
    // Call 0 is batch 0; calls 1 and 2 are batch 1 failing twice; call 3 succeeds.
    let embedder = ScriptedEmbedder::failing_on([1, 2]);
    let mut store = RecordingStore::default();
    let sleeper = RecordingSleeper::default();

    let report = ingest_documents(&docs, &embedder, &mut store, &config(200), &sleeper).unwrap();

    assert_eq!(
        report,
        IngestReport {
            batches: 3,
            documents: 450,
            retries: 2
        }
    );
    let sizes: Vec<_> = store.adds.iter().map(|add| add.0.len()).collect();
    assert_eq!(sizes, vec![200, 200, 50]);
    assert_eq!(
        *sleeper.waits.borrow(),
        vec![Duration::from_secs(2), Duration::from_secs(4)]
    );
    assert_eq!(embedder.calls.get(), 5);
}

#[test]
fn retries_resend_the_same_batch() {
    let docs = documents(5);
    let embedder = ScriptedEmbedder::failing_on([0]);
    let mut store = RecordingStore::default();
    let sleeper = RecordingSleeper::default();

    ingest_documents(&docs, &embedder, &mut store, &config(5), &sleeper).unwrap();

    let seen = embedder.seen.borrow();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], seen[1]);
    // Ids are assigned once per batch, not once per attempt.
    assert_eq!(store.adds.len(), 1);
    let ids: HashSet<_> = store.adds[0].0.iter().collect();
    assert_eq!(ids.len(), 5);
}

#[test]
fn records_stay_positionally_aligned() {
    let docs = documents(7);
    let embedder = ScriptedEmbedder::reliable();
    let mut store = RecordingStore::default();

    ingest_documents(
        &docs,
        &embedder,
        &mut store,
        &config(3),
        &RecordingSleeper::default(),
    )
    .unwrap();

    let mut flattened = Vec::new();
    for (ids, vectors, metadatas, texts) in &store.adds {
        assert_eq!(ids.len(), vectors.len());
        assert_eq!(ids.len(), metadatas.len());
        assert_eq!(ids.len(), texts.len());
        for ((vector, metadata), text) in vectors.iter().zip(metadatas).zip(texts) {
            assert_eq!(vector[0], text.len() as f32);
            let source = metadata["source"].to_string();
            let n: usize = text.rsplit(' ').next().unwrap().parse().unwrap();
            assert_eq!(source, format!("doc-{n}.txt"));
            flattened.push(text.clone());
        }
    }
    let expected: Vec<_> = docs.iter().map(|d| d.text.clone()).collect();
    assert_eq!(flattened, expected);
}

#[test]
fn exhausted_retries_stop_the_run() {
    let docs = documents(6);
    // Batch 0 succeeds on call 0; batch 1 fails on calls 1, 2, 3.
    let embedder = ScriptedEmbedder::failing_on([1, 2, 3]);
    let mut store = RecordingStore::default();
    let sleeper = RecordingSleeper::default();

    let err = ingest_documents(&docs, &embedder, &mut store, &config(2), &sleeper).unwrap_err();

    match &err {
        IngestError::RetriesExhausted {
            batch_index,
            attempts,
            source,
        } => {
            assert_eq!(*batch_index, 1);
            assert_eq!(*attempts, 3);
            assert!(source.to_string().contains("call 3"));
        }
        other => panic!("expected exhausted retries, got {other:?}"),
    }
    assert_eq!(err.batch_index(), Some(1));
    assert_eq!(store.adds.len(), 1, "first batch stays committed");
    assert_eq!(embedder.calls.get(), 4, "batch 2 never attempted");
    assert_eq!(
        *sleeper.waits.borrow(),
        vec![Duration::from_secs(2), Duration::from_secs(4)]
    );
}

#[test]
fn singleton_batches_follow_the_same_path() {
    let docs = documents(3);
    let embedder = ScriptedEmbedder::failing_on([1]);
    let mut store = RecordingStore::default();
    let sleeper = RecordingSleeper::default();

    let report = ingest_documents(&docs, &embedder, &mut store, &config(1), &sleeper).unwrap();

    assert_eq!(report.batches, 3);
    assert_eq!(report.retries, 1);
    assert_eq!(*sleeper.waits.borrow(), vec![Duration::from_secs(2)]);
    assert!(store.adds.iter().all(|add| add.0.len() == 1));
}

#[test]
fn short_provider_response_is_retried() {
    struct DropsLast {
        calls: Cell<usize>,
    }

    impl Embedder for DropsLast {
        fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
            let call = self.calls.get();
            self.calls.set(call + 1);
            let keep = if call == 0 { texts.len() - 1 } else { texts.len() };
            Ok(texts.iter().take(keep).map(|_| vec![1.0]).collect())
        }
    }

    let docs = documents(4);
    let embedder = DropsLast {
        calls: Cell::new(0),
    };
    let mut store = RecordingStore::default();
    let report = ingest_documents(
        &docs,
        &embedder,
        &mut store,
        &config(4),
        &RecordingSleeper::default(),
    )
    .unwrap();
    assert_eq!(report.retries, 1);
    assert_eq!(store.adds[0].1.len(), 4);
}

#[test]
fn store_failures_are_not_retried() {
    let docs = documents(4);
    let embedder = ScriptedEmbedder::reliable();
    let mut store = RecordingStore {
        fail_on_add: Some(1),
        ..Default::default()
    };
    let sleeper = RecordingSleeper::default();

    let err = ingest_documents(&docs, &embedder, &mut store, &config(2), &sleeper).unwrap_err();

    assert!(matches!(err, IngestError::StoreWrite { batch_index: 1, .. }));
    assert!(sleeper.waits.borrow().is_empty());
    assert_eq!(embedder.calls.get(), 2);
    assert_eq!(store.adds.len(), 1);
}

#[test]
fn empty_input_is_a_no_op() {
    let embedder = ScriptedEmbedder::reliable();
    let mut store = RecordingStore::default();
    let report = ingest_documents(
        &[],
        &embedder,
        &mut store,
        &IngestConfig::default(),
        &RecordingSleeper::default(),
    )
    .unwrap();
    assert_eq!(report, IngestReport::default());
    assert_eq!(embedder.calls.get(), 0);
}

#[test]
fn invalid_config_rejected_before_any_call() {
    let embedder = ScriptedEmbedder::reliable();
    let mut store = RecordingStore::default();
    let config = IngestConfig {
        batch_size: 0,
        ..IngestConfig::default()
    };
    let err = ingest_documents(
        &documents(2),
        &embedder,
        &mut store,
        &config,
        &RecordingSleeper::default(),
    )
    .unwrap_err();
    assert!(matches!(err, IngestError::InvalidConfig(_)));
    assert_eq!(embedder.calls.get(), 0);
}

#[test]
fn ingested_collection_is_searchable_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let docs = vec![
        Document::new("a").with_metadata("source", "short.txt"),
        Document::new("a much longer support answer").with_metadata("source", "long.txt"),
    ];
    {
        let mut store = LocalVectorStore::open(dir.path()).unwrap();
        ingest_documents(
            &docs,
            &ScriptedEmbedder::reliable(),
            &mut store,
            &config(1),
            &RecordingSleeper::default(),
        )
        .unwrap();
    }

    let store = LocalVectorStore::open(dir.path()).unwrap();
    assert_eq!(store.len(), 2);
    let hits = store.similarity_search(&[28.0, 1.0], 1).unwrap();
    assert_eq!(hits[0].metadata["source"], MetadataValue::from("long.txt"));
}

#[test]
fn warning_precedes_each_retry_sleep() {
    let docs = documents(3);
    let embedder = ScriptedEmbedder::failing_on([1, 2]);
    let mut store = RecordingStore::default();
    let timeline = Timeline::default();
    let writer = timeline.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();

    let report = tracing::subscriber::with_default(subscriber, || {
        ingest_documents(&docs, &embedder, &mut store, &config(2), &timeline)
    })
    .unwrap();
    assert_eq!(report.retries, 2);

    let entries = timeline.0.lock().clone();
    assert_eq!(entries.len(), 4, "{entries:#?}");
    assert!(entries[0].contains("WARN"), "{}", entries[0]);
    assert!(entries[0].contains("embedding failed"), "{}", entries[0]);
    assert!(entries[0].contains("retrying in 2.0s"), "{}", entries[0]);
    assert_eq!(entries[1], "sleep 2s");
    assert!(entries[2].contains("retrying in 4.0s"), "{}", entries[2]);
    assert_eq!(entries[3], "sleep 4s");
}
