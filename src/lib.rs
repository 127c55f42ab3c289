//! docstream: a streaming document-to-structured-records engine.
//!
//! The engine ingests heterogeneous documents (PDFs, images, audio, office
//! formats, ZIP archives), normalizes each to Markdown, extracts fields
//! conforming to a named schema through an LLM provider, and streams results
//! to the caller as they complete. Results are cached by content hash, runs
//! are recorded in an append-only ledger, and uploaded files are tracked by
//! a reference-counted lifecycle manager.
//!
//! The crate is the engine only. An HTTP layer (or the bundled CLI) owns the
//! transport; [`sse`] provides the wire framing it needs.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use docstream::{
//!     config::Config,
//!     convert::FileEntry,
//!     engine::Engine,
//!     pipeline::ProcessRequest,
//!     provider::Providers,
//! };
//! use futures::StreamExt as _;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let engine = Engine::new(Config::default(), Providers::openai()?)?;
//! engine.start().await?;
//!
//! let mut events = engine.process(ProcessRequest {
//!     files: vec![FileEntry::direct("invoice.pdf")],
//!     schema_key: "invoice".to_string(),
//!     instructions: String::new(),
//!     model_id: None,
//!     run_id: None,
//! })?;
//! while let Some(event) = events.next().await {
//!     print!("{}", docstream::sse::frame(&event));
//! }
//! engine.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod async_utils;
pub mod cache;
pub mod config;
pub mod convert;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod events;
pub mod extract;
pub mod ledger;
pub mod lifecycle;
pub mod pipeline;
pub mod prelude;
pub mod provider;
mod retry;
pub mod schema;
pub mod sse;
pub mod summarize;
pub mod tokens;
pub mod ui;
