//! # kiln-build
//!
//! Multi-stage container image builder.
//!
//! A build descriptor (Dockerfile-style text) is parsed into a graph of
//! stages. Stages run in dependency order, independent stages in parallel,
//! and every RUN/COPY result is stored in a content-addressed layer cache
//! keyed by the chain of instructions that produced it. The target stage's
//! layers and runtime settings are finally packaged into a deterministic
//! image manifest.
//!
//! ```no_run
//! use kiln_build::{BuildRequest, Builder, CancelToken, LayerCache};
//!
//! # async fn run() -> kiln_common::KilnResult<()> {
//! let cache = LayerCache::open("/var/cache/kiln")?;
//! let builder = Builder::new(cache);
//! let outcome = builder
//!     .build(BuildRequest::from_file("Dockerfile"), &CancelToken::new())
//!     .await?;
//! println!("{}", outcome.digest);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod build;
pub mod cache;
pub mod cancel;
pub mod cli;
pub mod config;
pub mod descriptor;
pub mod events;
pub mod executor;
pub mod graph;
pub mod instruction;
pub mod packager;
pub mod runner;
pub mod snapshot;
pub mod state;

pub use build::{BuildOutcome, BuildRequest, BuildStats, Builder};
pub use cache::{CacheKey, CacheOutcome, Layer, LayerCache};
pub use cancel::CancelToken;
pub use config::KilnConfig;
pub use descriptor::{Descriptor, parse_descriptor};
pub use events::{BuildEvent, EventBus};
pub use executor::{ExecutionReport, Executor, ExecutorOptions, ResolvedStage, StageConfig};
pub use graph::{Stage, StageGraph, StageId};
pub use instruction::Instruction;
pub use packager::{ImageManifest, ImagePackager};
pub use runner::{CommandRunner, HostRunner, RetryPolicy, RunRequest};
pub use state::BuildPhase;
