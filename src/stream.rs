//! Streaming batch API: emit each input's result as soon as it is done.
//!
//! ## Why stream?
//!
//! A batch of scanned PDFs can take minutes. A stream lets callers show
//! results immediately, write exports incrementally or stop early, instead
//! of waiting for [`DocumentPipeline::process_batch`] to return everything.
//!
//! Inputs are processed one at a time, in order, exactly as the eager batch
//! does: the stream only changes when the caller sees each item.

use crate::convert::{notify_item, DocumentPipeline};
use crate::output::BatchItem;
use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;
use tracing::info;

/// A boxed stream of batch items.
pub type ItemStream = Pin<Box<dyn Stream<Item = BatchItem> + Send>>;

/// Process `paths` lazily, yielding one [`BatchItem`] per input in input
/// order. Failed inputs are yielded too, with their errors recorded.
pub fn process_stream(pipeline: Arc<DocumentPipeline>, paths: Vec<PathBuf>) -> ItemStream {
    let total = paths.len();
    info!("Starting streaming batch of {total} inputs");
    if let Some(ref cb) = pipeline.config().progress_callback {
        cb.on_batch_start(total);
    }

    let s = stream::iter(paths.into_iter().enumerate()).then(move |(index, path)| {
        let pipeline = Arc::clone(&pipeline);
        async move {
            let cb = pipeline.config().progress_callback.clone();
            if let Some(ref cb) = cb {
                cb.on_item_start(index, total, &crate::pipeline::input::display_name(&path));
            }
            let item = pipeline.process_file(&path).await;
            notify_item(cb.as_ref(), index, total, &item);
            item
        }
    });
    Box::pin(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NlpConfig, PipelineConfig};
    use crate::progress::ProcessingProgressCallback;
    use crate::recognition::EngineRouter;
    use crate::schema::StructureSchema;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct Errors(AtomicUsize);

    impl ProcessingProgressCallback for Errors {
        fn on_item_error(&self, _index: usize, _total: usize, _name: &str, _error: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn yields_every_input_in_order() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.png");
        let b = dir.path().join("b.png");
        std::fs::write(&b, b"not an image").unwrap();

        let errors = Arc::new(Errors::default());
        let config = PipelineConfig::builder()
            .nlp(NlpConfig {
                enabled: false,
                ..NlpConfig::default()
            })
            .progress_callback(errors.clone())
            .build()
            .unwrap();
        let router = Arc::new(EngineRouter::tesseract_default().unwrap());
        let pipeline = Arc::new(DocumentPipeline::new(router, StructureSchema::default(), config).unwrap());

        let items: Vec<BatchItem> = process_stream(pipeline, vec![a, b]).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].source_name, "a.png");
        assert_eq!(items[0].errors[0].kind, "input");
        assert_eq!(items[1].errors[0].kind, "normalization");
        assert_eq!(errors.0.load(Ordering::SeqCst), 2);
    }
}
