//! Build driver.
//!
//! [`Builder::build`] walks a build through its phases: parse the descriptor
//! and validate the stage graph, execute the stages the target needs, then
//! package the target into an image manifest. Phase changes are published on
//! the builder's [`EventBus`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kiln_common::{BuildId, Digest, KilnError, KilnResult};

use crate::cache::LayerCache;
use crate::cancel::CancelToken;
use crate::descriptor::{BuildArgs, Descriptor, parse_descriptor};
use crate::events::{BuildEvent, EventBus};
use crate::executor::{Executor, ExecutorOptions, default_parallelism};
use crate::graph::StageGraph;
use crate::packager::{ImageManifest, ImagePackager};
use crate::runner::{CommandRunner, HostRunner, RetryPolicy};
use crate::state::BuildPhase;

/// Where the descriptor comes from.
#[derive(Debug, Clone)]
pub enum DescriptorSource {
    /// A descriptor file.
    File(PathBuf),
    /// Descriptor text.
    Text(String),
}

/// A single build invocation.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// The descriptor.
    pub descriptor: DescriptorSource,
    /// Build context for COPY.
    pub context_dir: PathBuf,
    /// Stage to build; the last stage when unset.
    pub target: Option<String>,
    /// Skip cache lookups.
    pub no_cache: bool,
    /// `ARG` overrides.
    pub build_args: BuildArgs,
}

impl BuildRequest {
    /// Build from a descriptor file; the context defaults to its directory.
    #[must_use]
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let context_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), PathBuf::from);
        Self {
            descriptor: DescriptorSource::File(path),
            context_dir,
            target: None,
            no_cache: false,
            build_args: BuildArgs::new(),
        }
    }

    /// Build from descriptor text.
    #[must_use]
    pub fn from_text(text: impl Into<String>, context_dir: impl Into<PathBuf>) -> Self {
        Self {
            descriptor: DescriptorSource::Text(text.into()),
            context_dir: context_dir.into(),
            target: None,
            no_cache: false,
            build_args: BuildArgs::new(),
        }
    }

    /// Set the build context.
    #[must_use]
    pub fn with_context(mut self, dir: impl Into<PathBuf>) -> Self {
        self.context_dir = dir.into();
        self
    }

    /// Set the target stage.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Skip cache lookups.
    #[must_use]
    pub const fn with_no_cache(mut self, no_cache: bool) -> Self {
        self.no_cache = no_cache;
        self
    }

    /// Override an `ARG`.
    #[must_use]
    pub fn with_build_arg(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.build_args.insert(name.into(), value.into());
        self
    }
}

/// Counters for a finished build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildStats {
    /// Stages executed.
    pub stages: usize,
    /// Layers in the image.
    pub layers: usize,
    /// Filesystem instructions served from the cache.
    pub cache_hits: usize,
    /// Filesystem instructions executed.
    pub cache_misses: usize,
    /// Wall-clock time.
    pub duration: Duration,
}

/// A successful build.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    /// Build identifier.
    pub build_id: BuildId,
    /// The image manifest.
    pub manifest: ImageManifest,
    /// Digest of the manifest's canonical JSON.
    pub digest: Digest,
    /// Counters.
    pub stats: BuildStats,
}

/// Image builder.
pub struct Builder {
    cache: LayerCache,
    runner: Arc<dyn CommandRunner>,
    packager: ImagePackager,
    max_parallel: usize,
    retry: RetryPolicy,
    work_dir: Option<PathBuf>,
    events: EventBus,
}

impl Builder {
    /// Builder that runs commands on the host.
    #[must_use]
    pub fn new(cache: LayerCache) -> Self {
        Self {
            cache,
            runner: Arc::new(HostRunner::new()),
            packager: ImagePackager::new(),
            max_parallel: default_parallelism(),
            retry: RetryPolicy::default(),
            work_dir: None,
            events: EventBus::new(),
        }
    }

    /// Use a different command runner.
    #[must_use]
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Limit concurrently executing stages.
    #[must_use]
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Set the RUN retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Create stage root filesystems under `dir`.
    #[must_use]
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// Use a different packager.
    #[must_use]
    pub fn with_packager(mut self, packager: ImagePackager) -> Self {
        self.packager = packager;
        self
    }

    /// Event bus for this builder's builds.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// The layer cache.
    #[must_use]
    pub const fn cache(&self) -> &LayerCache {
        &self.cache
    }

    /// Run a build to completion.
    ///
    /// # Errors
    ///
    /// Parse and graph errors are returned before anything executes.
    /// Execution failures are reported as [`KilnError::BuildFailed`];
    /// a target without an entrypoint as [`KilnError::IncompleteImage`].
    pub async fn build(
        &self,
        request: BuildRequest,
        cancel: &CancelToken,
    ) -> KilnResult<BuildOutcome> {
        let started = Instant::now();
        let mut phase = PhaseTracker::new(BuildId::generate(), self.events.clone());
        tracing::info!(build = %phase.build, "Build started");

        let result = self.run_phases(&request, cancel, &mut phase).await;

        if let Err(e) = self.cache.flush() {
            tracing::warn!(error = %e, "Failed to persist layer cache");
        }

        match result {
            Ok((manifest, digest, stats)) => {
                phase.advance(BuildPhase::Complete);
                let stats = BuildStats {
                    duration: started.elapsed(),
                    ..stats
                };
                tracing::info!(
                    build = %phase.build,
                    digest = %digest,
                    layers = stats.layers,
                    cache_hits = stats.cache_hits,
                    duration_ms = u64::try_from(stats.duration.as_millis()).unwrap_or(u64::MAX),
                    "Build complete"
                );
                Ok(BuildOutcome {
                    build_id: phase.build,
                    manifest,
                    digest,
                    stats,
                })
            }
            Err(e) => {
                phase.fail();
                tracing::error!(build = %phase.build, error = %e, "Build failed");
                Err(e)
            }
        }
    }

    async fn run_phases(
        &self,
        request: &BuildRequest,
        cancel: &CancelToken,
        phase: &mut PhaseTracker,
    ) -> KilnResult<(ImageManifest, Digest, BuildStats)> {
        phase.advance(BuildPhase::Parsing);
        let descriptor = match &request.descriptor {
            DescriptorSource::File(path) => Descriptor::from_file(path, &request.build_args)?,
            DescriptorSource::Text(text) => parse_descriptor(text, &request.build_args)?,
        };
        let graph = Arc::new(StageGraph::build(descriptor)?);
        let target = graph.resolve_target(request.target.as_deref())?;

        phase.advance(BuildPhase::Scheduled);
        let order: Vec<&str> = graph
            .closure(target)
            .into_iter()
            .map(|id| graph.stage(id).name.as_str())
            .collect();
        tracing::info!(order = ?order, "Scheduled stages");

        if cancel.is_cancelled() {
            return Err(KilnError::Cancelled);
        }

        phase.advance(BuildPhase::Executing);
        let executor = Executor::new(
            self.cache.clone(),
            self.runner.clone(),
            ExecutorOptions {
                max_parallel: self.max_parallel,
                no_cache: request.no_cache,
                retry: self.retry,
                context_dir: request.context_dir.clone(),
                work_dir: self.work_dir.clone(),
            },
        );
        let report = executor
            .execute(graph.clone(), target, cancel, &self.events)
            .await?;

        phase.advance(BuildPhase::Packaging);
        let manifest = self
            .packager
            .package(&report.target.config, &report.layers)?;
        let digest = manifest.digest()?;

        let stats = BuildStats {
            stages: report.stages.len(),
            layers: manifest.layers.len(),
            cache_hits: report.cache_hits(),
            cache_misses: report.cache_misses(),
            duration: Duration::ZERO,
        };
        Ok((manifest, digest, stats))
    }
}

/// Current phase plus publication of changes.
struct PhaseTracker {
    build: BuildId,
    phase: BuildPhase,
    events: EventBus,
}

impl PhaseTracker {
    const fn new(build: BuildId, events: EventBus) -> Self {
        Self {
            build,
            phase: BuildPhase::Pending,
            events,
        }
    }

    fn advance(&mut self, next: BuildPhase) {
        if !self.phase.can_transition_to(next) {
            tracing::warn!(from = %self.phase, to = %next, "Ignoring invalid phase transition");
            return;
        }
        tracing::debug!(build = %self.build, from = %self.phase, to = %next, "Phase change");
        self.phase = next;
        self.events.publish(BuildEvent::PhaseChanged {
            build: self.build.to_string(),
            phase: next,
        });
    }

    /// Move to `Failed` unless the build already finished.
    fn fail(&mut self) {
        if !self.phase.is_terminal() {
            self.advance(BuildPhase::Failed);
        }
    }
}
