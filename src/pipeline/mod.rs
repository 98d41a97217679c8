//! Pipeline stages for document structuring.
//!
//! Each submodule implements exactly one transformation step. Keeping stages
//! separate makes each independently testable and lets us swap one (a
//! different skew estimator, another model provider) without touching the
//! others.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ normalize ──▶ encode ──▶ [recognition] ──▶ postprocess ──▶ llm
//! (sniff)   (pdfium)   (deskew,      (PNG)       (engine router)   (clean text)    (structuring
//!                       binarize)                                                    provider)
//! ```
//!
//! 1. [`input`]     — read a file and classify it as PDF or image by magic bytes
//! 2. [`render`]    — rasterise selected PDF pages; runs in `spawn_blocking`
//!    because pdfium is not async-safe
//! 3. [`normalize`] — skew correction, then denoise, contrast, binarization and
//!    overlay suppression for engines that want a binary page
//! 4. [`encode`]    — PNG-encode the normalized image for the engine
//! 5. [`postprocess`] — deterministic text cleaning before structuring
//! 6. [`llm`]       — the structuring provider seam and response decoding; the
//!    only stage here with network I/O

pub mod encode;
pub mod input;
pub mod llm;
pub mod normalize;
pub mod postprocess;
pub mod render;
