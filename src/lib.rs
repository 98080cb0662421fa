#![forbid(unsafe_code)]
//! Incremental build orchestrator for static-site asset pipelines.
//!
//! The library owns the wiring between external file transforms: a task
//! graph with explicit prerequisites, a watch coordinator mapping file
//! change events to task runs, a build cache with first-class eviction,
//! an idempotent cache-busting pass for emitted HTML, and a preview
//! server with live reload.
//!
//! The transforms themselves (templating, CSS bundling, minification,
//! image optimization) are supplied by the user as opaque actions; the
//! crate guarantees their ordering, isolation of failures, and the
//! watch → rebuild → reload loop around them.
//!
//! # Example
//!
//! ```rust,no_run
//! use bellows::{AssetClass, PathMap, Pipeline, Task, WatchRule};
//!
//! fn main() -> anyhow::Result<()> {
//!     let paths = PathMap::design()
//!         .class(AssetClass::Pages, ["src/pages/*.pug"], "build")
//!         .class(AssetClass::Styles, ["src/components/**/*.pcss"], "build/styles.min.css")
//!         .class(AssetClass::Images, ["src/images/**/*.png"], "build/images")
//!         .inputs(AssetClass::Html, ["build/*.html"])
//!         .finish()?;
//!
//!     let pipeline = Pipeline::design()
//!         .paths(paths)
//!         .task(Task::new("pages", |_ctx| {
//!             // render templates...
//!             Ok(())
//!         }).class(AssetClass::Pages))
//!         .task(
//!             Task::new("cache", bellows::bust_outputs)
//!                 .after(["pages"])
//!                 .class(AssetClass::Html),
//!         )
//!         .rule(WatchRule::new("src/pages/*.pug", ["pages", "cache"]))
//!         .rule(
//!             WatchRule::new("src/images/*.png", ["images"])
//!                 .class(AssetClass::Images),
//!         )
//!         .finish()?;
//!
//!     bellows::cli::run(&pipeline)
//! }
//! ```

mod bust;
mod cache;
#[cfg(all(feature = "live", feature = "server"))]
pub mod cli;
mod error;
mod events;
mod graph;
mod hash;
mod logging;
mod paths;
mod pipeline;
#[cfg(all(feature = "live", feature = "server"))]
mod serve;
mod task;
#[cfg(feature = "live")]
mod watch;

pub use crate::bust::bust_outputs;
pub use crate::cache::{BuildCache, CACHE_FILE, CacheEntry};
pub use crate::error::*;
pub use crate::events::{Broadcaster, Rebuild};
pub use crate::graph::TaskGraph;
pub use crate::hash::Hash32;
pub use crate::paths::{AssetClass, PathMap, PathMapBuilder};
pub use crate::pipeline::{Pipeline, PipelineBuilder};
#[cfg(all(feature = "live", feature = "server"))]
pub use crate::serve::{DEFAULT_PORT, ServeOptions};
pub use crate::task::{
    RunReport, Task, TaskContext, TaskOutcome, TaskResult, TaskStatus, TransformError,
};
#[cfg(feature = "live")]
pub use crate::watch::WatchRule;

/// Whether the pipeline is performing a one-shot build or running inside
/// the watch loop. Actions can use this to, say, skip minification while
/// iterating locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Run every task once and stop.
    Build,
    /// Keep the process alive and rebuild on file changes.
    Watch,
}
