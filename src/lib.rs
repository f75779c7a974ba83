//! BrandLens: a multi-page brand-strategy site backed by a three-stage
//! text-generation pipeline.
//!
//! The library holds the page router, per-visitor session state, the
//! generation pipeline and its cleanup filter. The `web` feature adds the
//! axum front end.

pub mod cleanup;
pub mod config;
pub mod generator;
pub mod page;
pub mod pipeline;
pub mod prompt;
pub mod session;
pub mod state;
#[cfg(feature = "web")]
pub mod web;

pub use page::Page;
pub use pipeline::{Pipeline, PipelineReport, Stage, StageOutput};
pub use session::SessionStore;
pub use state::{Action, FormSubmission, SessionState, Theme, reduce};
