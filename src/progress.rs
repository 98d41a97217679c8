//! Progress-callback trait for batch processing events.
//!
//! Inject an [`Arc<dyn ProcessingProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the pipeline works through inputs and PDF pages.
//!
//! # Why callbacks instead of channels?
//!
//! Callers can forward events to a channel, a WebSocket or a terminal
//! progress bar without the library knowing how the host application
//! communicates. The trait is `Send + Sync` because a pipeline is shared
//! between tasks.
//!
//! # Example
//!
//! ```rust
//! use edgequake_docstruct::{PipelineConfig, ProcessingProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     failed: AtomicUsize,
//! }
//!
//! impl ProcessingProgressCallback for CountingCallback {
//!     fn on_item_error(&self, index: usize, total: usize, name: &str, error: &str) {
//!         self.failed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("[{}/{}] {} failed: {}", index + 1, total, name, error);
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { failed: AtomicUsize::new(0) });
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(counter as Arc<dyn ProcessingProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the pipeline as it processes a batch.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Indices are 0-based positions in the batch; page
/// numbers are 1-based.
pub trait ProcessingProgressCallback: Send + Sync {
    /// Called once before the first input is read.
    fn on_batch_start(&self, total: usize) {
        let _ = total;
    }

    /// Called before an input is read.
    fn on_item_start(&self, index: usize, total: usize, name: &str) {
        let _ = (index, total, name);
    }

    /// Called after one image or PDF page has been recognized and structured.
    ///
    /// # Arguments
    /// * `page`     — 1-indexed page for PDF inputs, `None` for images
    /// * `coverage` — field coverage, `None` when structuring is disabled
    fn on_page_complete(&self, name: &str, page: Option<usize>, coverage: Option<f64>) {
        let _ = (name, page, coverage);
    }

    /// Called when an input produced at least one result and no errors.
    fn on_item_complete(&self, index: usize, total: usize, name: &str, results: usize) {
        let _ = (index, total, name, results);
    }

    /// Called when an input, or any page of it, failed.
    fn on_item_error(&self, index: usize, total: usize, name: &str, error: &str) {
        let _ = (index, total, name, error);
    }

    /// Called once after every input has been attempted.
    fn on_batch_complete(&self, total: usize, successful: usize) {
        let _ = (total, successful);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ProcessingProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn ProcessingProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        items: AtomicUsize,
        pages: AtomicUsize,
        errors: AtomicUsize,
        successful: AtomicUsize,
    }

    impl ProcessingProgressCallback for TrackingCallback {
        fn on_item_start(&self, _index: usize, _total: usize, _name: &str) {
            self.items.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_complete(&self, _name: &str, _page: Option<usize>, _coverage: Option<f64>) {
            self.pages.fetch_add(1, Ordering::SeqCst);
        }

        fn on_item_error(&self, _index: usize, _total: usize, _name: &str, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_batch_complete(&self, _total: usize, successful: usize) {
            self.successful.store(successful, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_batch_start(2);
        cb.on_item_start(0, 2, "a.png");
        cb.on_page_complete("a.png", None, Some(50.0));
        cb.on_item_complete(0, 2, "a.png", 1);
        cb.on_item_error(1, 2, "b.pdf", "engine unavailable");
        cb.on_batch_complete(2, 1);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        tracker.on_batch_start(2);
        tracker.on_item_start(0, 2, "scan.pdf");
        tracker.on_page_complete("scan.pdf", Some(1), Some(100.0));
        tracker.on_page_complete("scan.pdf", Some(2), None);
        tracker.on_item_start(1, 2, "broken.png");
        tracker.on_item_error(1, 2, "broken.png", "decode failed");
        tracker.on_batch_complete(2, 1);

        assert_eq!(tracker.items.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.pages.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.successful.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_batch_start(10);
        cb.on_item_start(0, 10, "x");
    }
}
