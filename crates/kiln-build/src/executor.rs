//! Stage execution.
//!
//! Every stage in the target's dependency closure becomes one shared future.
//! A stage first awaits the futures of the stages it needs, then takes a
//! slot from the parallelism semaphore and runs its instructions in order.
//! Independent stages therefore run concurrently, and a failure only
//! affects the stages that (transitively) need the failed one.
//!
//! Each stage works on a private root filesystem in a temporary directory.
//! Metadata instructions update the stage config and advance the chain key.
//! RUN and COPY go through the [`LayerCache`]: on a hit the cached archive
//! is unpacked onto the root filesystem, on a miss the instruction executes
//! and the resulting filesystem diff becomes a new layer.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared, join_all};
use kiln_common::{Digest, KilnError, KilnResult, StageFailure, StageFailureCause};
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::cache::{CacheKey, CacheOutcome, Layer, LayerCache};
use crate::cancel::CancelToken;
use crate::events::{BuildEvent, EventBus};
use crate::graph::{Stage, StageBase, StageGraph, StageId};
use crate::instruction::{CopyInstruction, Healthcheck, Instruction, PortSpec};
use crate::runner::{
    CommandRunner, RetryOutcome, RetryPolicy, RunRequest, resolve_in_rootfs, run_with_retry,
};
use crate::snapshot::{self, Checkpoint, Snapshot};

/// Executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Maximum stages executing at once.
    pub max_parallel: usize,
    /// Skip cache lookups. Results are still stored.
    pub no_cache: bool,
    /// Retry policy for RUN.
    pub retry: RetryPolicy,
    /// Build context for COPY without `--from`.
    pub context_dir: PathBuf,
    /// Parent directory for stage root filesystems; system temp if unset.
    pub work_dir: Option<PathBuf>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            max_parallel: default_parallelism(),
            no_cache: false,
            retry: RetryPolicy::default(),
            context_dir: PathBuf::from("."),
            work_dir: None,
        }
    }
}

/// Number of available CPUs, at least 1.
#[must_use]
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

/// Image configuration accumulated by a stage's metadata instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageConfig {
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// User, if set.
    pub user: Option<String>,
    /// Absolute working directory.
    pub workdir: String,
    /// Entrypoint argv.
    pub entrypoint: Option<Vec<String>>,
    /// Default command argv.
    pub cmd: Option<Vec<String>>,
    /// Exposed ports.
    pub exposed_ports: BTreeSet<PortSpec>,
    /// Health check.
    pub healthcheck: Option<Healthcheck>,
    /// Labels.
    pub labels: BTreeMap<String, String>,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            env: BTreeMap::new(),
            user: None,
            workdir: "/".to_string(),
            entrypoint: None,
            cmd: None,
            exposed_ports: BTreeSet::new(),
            healthcheck: None,
            labels: BTreeMap::new(),
        }
    }
}

/// A successfully built stage.
#[derive(Debug)]
pub struct ResolvedStage {
    /// Stage id.
    pub id: StageId,
    /// Stage name.
    pub name: String,
    /// Final configuration.
    pub config: StageConfig,
    /// Layers produced by this stage's own instructions.
    pub layers: Vec<Layer>,
    /// Chain key after the last instruction.
    pub chain: CacheKey,
    /// Filesystem instructions served from the cache.
    pub cache_hits: usize,
    /// Filesystem instructions executed.
    pub cache_misses: usize,
    rootfs: TempDir,
}

impl ResolvedStage {
    /// The stage's final root filesystem. Removed when the stage is dropped.
    #[must_use]
    pub fn rootfs(&self) -> &Path {
        self.rootfs.path()
    }
}

/// Result of a successful execution.
#[derive(Debug)]
pub struct ExecutionReport {
    /// The target stage.
    pub target: Arc<ResolvedStage>,
    /// Every stage that was built, in build order.
    pub stages: Vec<Arc<ResolvedStage>>,
    /// Image layers: each built stage's own layers in build order, keeping
    /// the first occurrence of each digest.
    pub layers: Vec<Layer>,
}

impl ExecutionReport {
    /// Filesystem instructions served from the cache.
    #[must_use]
    pub fn cache_hits(&self) -> usize {
        self.stages.iter().map(|s| s.cache_hits).sum()
    }

    /// Filesystem instructions executed.
    #[must_use]
    pub fn cache_misses(&self) -> usize {
        self.stages.iter().map(|s| s.cache_misses).sum()
    }
}

type StageFuture = Shared<BoxFuture<'static, Result<Arc<ResolvedStage>, StageFailure>>>;

/// Executes stage graphs.
pub struct Executor {
    cache: LayerCache,
    runner: Arc<dyn CommandRunner>,
    options: Arc<ExecutorOptions>,
}

impl Executor {
    /// Create an executor.
    #[must_use]
    pub fn new(cache: LayerCache, runner: Arc<dyn CommandRunner>, options: ExecutorOptions) -> Self {
        Self {
            cache,
            runner,
            options: Arc::new(options),
        }
    }

    /// Build `target` and everything it needs.
    ///
    /// Waits for every started stage to finish or fail before returning.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::BuildFailed`] listing every stage that failed or
    /// was skipped, or [`KilnError::Cancelled`] if the build was cancelled
    /// and nothing failed on its own.
    pub async fn execute(
        &self,
        graph: Arc<StageGraph>,
        target: StageId,
        cancel: &CancelToken,
        events: &EventBus,
    ) -> KilnResult<ExecutionReport> {
        let closure = graph.closure(target);
        let semaphore = Arc::new(Semaphore::new(self.options.max_parallel.max(1)));
        let context = StageContext {
            graph: graph.clone(),
            cache: self.cache.clone(),
            runner: self.runner.clone(),
            options: self.options.clone(),
            cancel: cancel.clone(),
            events: events.clone(),
        };

        tracing::info!(
            target_stage = %graph.stage(target).name,
            stages = closure.len(),
            max_parallel = self.options.max_parallel,
            "Executing stages"
        );

        let mut futures: HashMap<StageId, StageFuture> = HashMap::new();
        let mut tasks = JoinSet::new();
        for &id in &closure {
            let deps: Vec<(StageId, StageFuture)> = graph
                .dependencies(id)
                .iter()
                .filter_map(|dep| futures.get(dep).map(|f| (*dep, f.clone())))
                .collect();
            let future = context
                .clone()
                .stage_task(id, deps, semaphore.clone())
                .boxed()
                .shared();
            tasks.spawn(future.clone());
            futures.insert(id, future);
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Stage task aborted");
            }
        }

        let mut stages = Vec::with_capacity(closure.len());
        let mut failures = Vec::new();
        for &id in &closure {
            let outcome = futures.get(&id).and_then(|f| f.peek().cloned());
            match outcome {
                Some(Ok(stage)) => stages.push(stage),
                Some(Err(failure)) => failures.push(failure),
                None => failures.push(StageFailure::failed(
                    graph.stage(id).name.clone(),
                    KilnError::Internal {
                        message: "stage task did not complete".to_string(),
                    },
                )),
            }
        }

        if !failures.is_empty() {
            let only_cancelled = failures.iter().all(|f| {
                matches!(
                    f.cause,
                    StageFailureCause::Cancelled | StageFailureCause::DependencyFailed { .. }
                )
            }) && cancel.is_cancelled();
            if only_cancelled {
                return Err(KilnError::Cancelled);
            }
            return Err(KilnError::BuildFailed { failures });
        }

        let target_stage = stages
            .iter()
            .find(|s| s.id == target)
            .cloned()
            .ok_or_else(|| KilnError::Internal {
                message: "target stage missing from results".to_string(),
            })?;
        let mut seen = HashSet::new();
        let layers = stages
            .iter()
            .flat_map(|s| s.layers.iter())
            .filter(|layer| seen.insert(layer.digest.clone()))
            .cloned()
            .collect();

        Ok(ExecutionReport {
            target: target_stage,
            stages,
            layers,
        })
    }
}

/// Everything a stage task needs; cheap to clone.
#[derive(Clone)]
struct StageContext {
    graph: Arc<StageGraph>,
    cache: LayerCache,
    runner: Arc<dyn CommandRunner>,
    options: Arc<ExecutorOptions>,
    cancel: CancelToken,
    events: EventBus,
}

/// Mutable state while a stage runs.
struct StageState {
    rootfs: TempDir,
    config: StageConfig,
    chain: CacheKey,
    layers: Vec<Layer>,
    cmd_inherited: bool,
    cache_hits: usize,
    cache_misses: usize,
}

impl StageContext {
    async fn stage_task(
        self,
        id: StageId,
        deps: Vec<(StageId, StageFuture)>,
        semaphore: Arc<Semaphore>,
    ) -> Result<Arc<ResolvedStage>, StageFailure> {
        let name = self.graph.stage(id).name.clone();

        let (dep_ids, dep_futures): (Vec<StageId>, Vec<StageFuture>) = deps.into_iter().unzip();
        let mut resolved = HashMap::new();
        for (dep, outcome) in dep_ids.into_iter().zip(join_all(dep_futures).await) {
            match outcome {
                Ok(stage) => {
                    resolved.insert(dep, stage);
                }
                Err(failure) if matches!(failure.cause, StageFailureCause::Cancelled) => {
                    self.events
                        .publish(BuildEvent::StageCancelled { stage: name.clone() });
                    return Err(StageFailure::cancelled(name));
                }
                Err(failure) => {
                    tracing::warn!(stage = %name, dependency = %failure.stage, "Skipping stage");
                    self.events.publish(BuildEvent::StageSkipped {
                        stage: name.clone(),
                        dependency: failure.stage.clone(),
                    });
                    return Err(StageFailure::skipped(name, failure.stage));
                }
            }
        }

        let Ok(_permit) = semaphore.acquire_owned().await else {
            return Err(StageFailure::cancelled(name));
        };
        if self.cancel.is_cancelled() {
            self.events
                .publish(BuildEvent::StageCancelled { stage: name.clone() });
            return Err(StageFailure::cancelled(name));
        }

        self.events
            .publish(BuildEvent::StageStarted { stage: name.clone() });
        tracing::info!(stage = %name, "Stage started");

        match self.build_stage(id, &resolved).await {
            Ok(stage) => {
                tracing::info!(
                    stage = %name,
                    layers = stage.layers.len(),
                    cache_hits = stage.cache_hits,
                    "Stage completed"
                );
                self.events.publish(BuildEvent::StageCompleted {
                    stage: name,
                    layers: stage.layers.len(),
                });
                Ok(Arc::new(stage))
            }
            Err(KilnError::Cancelled) => {
                tracing::info!(stage = %name, "Stage cancelled");
                self.events
                    .publish(BuildEvent::StageCancelled { stage: name.clone() });
                Err(StageFailure::cancelled(name))
            }
            Err(e) => {
                tracing::error!(stage = %name, error = %e, "Stage failed");
                self.events.publish(BuildEvent::StageFailed {
                    stage: name.clone(),
                    error: e.to_string(),
                });
                Err(StageFailure::failed(name, e))
            }
        }
    }

    async fn build_stage(
        &self,
        id: StageId,
        deps: &HashMap<StageId, Arc<ResolvedStage>>,
    ) -> KilnResult<ResolvedStage> {
        let stage = self.graph.stage(id);
        let work_dir = self.options.work_dir.clone();
        let rootfs = blocking(move || -> std::io::Result<TempDir> {
            match work_dir {
                Some(dir) => {
                    std::fs::create_dir_all(&dir)?;
                    tempfile::Builder::new()
                        .prefix("kiln-stage-")
                        .tempdir_in(dir)
                }
                None => tempfile::Builder::new().prefix("kiln-stage-").tempdir(),
            }
        })
        .await?;

        let mut state = match &stage.base {
            StageBase::Scratch => StageState::fresh(rootfs, CacheKey::for_base("scratch")),
            StageBase::Image(reference) => StageState::fresh(rootfs, CacheKey::for_base(reference)),
            StageBase::Stage(base) => {
                let base = deps.get(base).ok_or_else(|| KilnError::Internal {
                    message: format!("base stage {base} was not built"),
                })?;
                let src = base.rootfs().to_path_buf();
                let dst = rootfs.path().to_path_buf();
                blocking(move || snapshot::copy_tree(&src, &dst)).await?;
                StageState {
                    rootfs,
                    config: base.config.clone(),
                    chain: base.chain.clone(),
                    layers: Vec::new(),
                    cmd_inherited: base.config.cmd.is_some(),
                    cache_hits: 0,
                    cache_misses: 0,
                }
            }
        };

        for (index, instruction) in stage.instructions.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(KilnError::Cancelled);
            }
            self.events.publish(BuildEvent::InstructionStarted {
                stage: stage.name.clone(),
                index,
                instruction: instruction.to_string(),
            });
            tracing::debug!(stage = %stage.name, step = index + 1, %instruction, "Instruction");

            match instruction {
                Instruction::Run(_) | Instruction::Copy(_) => {
                    self.filesystem_step(stage, &mut state, instruction, deps)
                        .await?;
                }
                Instruction::Env(vars) => {
                    state.config.env.extend(vars.iter().cloned());
                    state.advance(instruction);
                }
                Instruction::User(user) => {
                    state.config.user = Some(user.clone());
                    state.advance(instruction);
                }
                Instruction::Workdir(dir) => {
                    state.config.workdir = resolve_in_rootfs(Path::new("/"), &state.config.workdir, dir)
                        .display()
                        .to_string();
                    state.advance(instruction);
                }
                Instruction::Healthcheck(check) => {
                    state.config.healthcheck = Some(check.clone());
                    state.advance(instruction);
                }
                Instruction::Entrypoint(command) => {
                    state.config.entrypoint = Some(command.argv());
                    // An inherited CMD does not apply to a new entrypoint.
                    if state.cmd_inherited {
                        state.config.cmd = None;
                        state.cmd_inherited = false;
                    }
                    state.advance(instruction);
                }
                Instruction::Cmd(command) => {
                    state.config.cmd = Some(command.argv());
                    state.cmd_inherited = false;
                    state.advance(instruction);
                }
                Instruction::Expose(ports) => {
                    state.config.exposed_ports.extend(ports.iter().copied());
                    state.advance(instruction);
                }
                Instruction::Label(labels) => {
                    state.config.labels.extend(labels.iter().cloned());
                    state.advance(instruction);
                }
            }
        }

        Ok(ResolvedStage {
            id,
            name: stage.name.clone(),
            config: state.config,
            layers: state.layers,
            chain: state.chain,
            cache_hits: state.cache_hits,
            cache_misses: state.cache_misses,
            rootfs: state.rootfs,
        })
    }

    async fn filesystem_step(
        &self,
        stage: &Stage,
        state: &mut StageState,
        instruction: &Instruction,
        deps: &HashMap<StageId, Arc<ResolvedStage>>,
    ) -> KilnResult<()> {
        let created_by = instruction.to_string();
        let source = match instruction {
            Instruction::Copy(copy) => {
                Some(self.copy_source(stage, copy, deps, &created_by).await?)
            }
            _ => None,
        };
        let key = state.chain.chain(instruction, source.as_ref().map(|s| &s.material));
        let rootfs = state.rootfs.path().to_path_buf();

        let compute = || async {
            let before = {
                let rootfs = rootfs.clone();
                blocking(move || Snapshot::capture(&rootfs)).await?
            };
            match instruction {
                Instruction::Run(command) => {
                    // Retries start again from the filesystem as it was before the first attempt.
                    let checkpoint = if self.options.retry.attempts > 1 {
                        let rootfs = rootfs.clone();
                        let before = before.clone();
                        Some(Arc::new(
                            blocking(move || Checkpoint::save(&rootfs, before)).await?,
                        ))
                    } else {
                        None
                    };
                    self.run_command(
                        stage,
                        &state.config,
                        &rootfs,
                        command.argv(),
                        &created_by,
                        checkpoint,
                    )
                    .await?;
                }
                Instruction::Copy(copy) => {
                    let Some(source) = source.clone() else {
                        return Err(KilnError::Internal {
                            message: "COPY without resolved sources".to_string(),
                        });
                    };
                    let dest = resolve_in_rootfs(&rootfs, &state.config.workdir, &copy.destination);
                    let force_dir = copy.destination.ends_with('/') || copy.destination == ".";
                    blocking(move || copy_into(&source.paths, &dest, force_dir))
                        .await
                        .map_err(|e| instruction_error(&stage.name, &created_by, e))?;
                }
                _ => {}
            }
            let rootfs = rootfs.clone();
            blocking(move || -> std::io::Result<_> {
                let after = Snapshot::capture(&rootfs)?;
                snapshot::pack_changes(&rootfs, &Snapshot::diff(&before, &after))
            })
            .await
        };

        let (layer, outcome) = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(KilnError::Cancelled),
            result = self.cache.get_or_compute(&key, &created_by, !self.options.no_cache, compute) => result?,
        };

        if outcome == CacheOutcome::Computed {
            state.cache_misses += 1;
        } else {
            let cache = self.cache.clone();
            let cached = layer.clone();
            let rootfs = rootfs.clone();
            blocking(move || -> KilnResult<()> {
                let bytes = cache.artifact(&cached)?;
                snapshot::apply_artifact(&rootfs, &bytes)?;
                Ok(())
            })
            .await?;
            state.cache_hits += 1;
        }

        tracing::debug!(
            stage = %stage.name,
            layer = %layer.digest.short(),
            cached = outcome == CacheOutcome::Hit,
            "Layer ready"
        );
        self.events.publish(BuildEvent::LayerReady {
            stage: stage.name.clone(),
            digest: layer.digest.to_string(),
            cached: outcome == CacheOutcome::Hit,
        });

        state.layers.push(layer);
        state.chain = key;
        Ok(())
    }

    async fn run_command(
        &self,
        stage: &Stage,
        config: &StageConfig,
        rootfs: &Path,
        argv: Vec<String>,
        created_by: &str,
        checkpoint: Option<Arc<Checkpoint>>,
    ) -> KilnResult<()> {
        let request = RunRequest {
            argv,
            env: config.env.clone(),
            rootfs: rootfs.to_path_buf(),
            workdir: config.workdir.clone(),
            user: config.user.clone(),
        };
        let restore = || {
            let checkpoint = checkpoint.clone();
            let rootfs = rootfs.to_path_buf();
            async move {
                let Some(checkpoint) = checkpoint else {
                    return Ok(());
                };
                tracing::debug!(stage = %stage.name, "Restoring filesystem before retry");
                tokio::task::spawn_blocking(move || checkpoint.restore(&rootfs))
                    .await
                    .map_err(std::io::Error::other)?
            }
        };
        let outcome = run_with_retry(
            self.runner.as_ref(),
            &request,
            self.options.retry,
            &self.cancel,
            restore,
        )
        .await;
        match outcome {
            RetryOutcome::Succeeded => Ok(()),
            RetryOutcome::Cancelled => Err(KilnError::Cancelled),
            RetryOutcome::Failed(failure) => {
                Err(instruction_error(&stage.name, created_by, failure))
            }
        }
    }

    /// Expand COPY sources and compute the content they contribute to the
    /// cache key. Walks the sources off the runtime threads.
    async fn copy_source(
        &self,
        stage: &Stage,
        copy: &CopyInstruction,
        deps: &HashMap<StageId, Arc<ResolvedStage>>,
        created_by: &str,
    ) -> KilnResult<CopySource> {
        let (root, from_stage) = match &copy.from {
            Some(reference) => {
                let source = self
                    .graph
                    .lookup(reference)
                    .and_then(|id| deps.get(&id))
                    .ok_or_else(|| KilnError::UnknownStageReference {
                        stage: stage.name.clone(),
                        reference: reference.clone(),
                    })?;
                (source.rootfs().to_path_buf(), Some(source))
            }
            None => (self.options.context_dir.clone(), None),
        };

        let stage_material = from_stage.map(|source| source.chain.digest().clone());
        let patterns = copy.sources.clone();
        let stage_name = stage.name.clone();
        let instruction = created_by.to_string();

        blocking(move || -> KilnResult<CopySource> {
            let fail = |e: std::io::Error| instruction_error(&stage_name, &instruction, e);
            let mut paths = Vec::new();
            for pattern in &patterns {
                let matches = expand_glob(&resolve_in_rootfs(&root, "/", pattern)).map_err(fail)?;
                if matches.is_empty() {
                    return Err(fail(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("no source files match '{pattern}'"),
                    )));
                }
                paths.extend(matches);
            }

            let material = match stage_material {
                Some(material) => material,
                None => snapshot::content_digest(&root, &paths).map_err(fail)?,
            };
            Ok(CopySource { paths, material })
        })
        .await
    }
}

impl StageState {
    fn fresh(rootfs: TempDir, chain: CacheKey) -> Self {
        Self {
            rootfs,
            config: StageConfig::default(),
            chain,
            layers: Vec::new(),
            cmd_inherited: false,
            cache_hits: 0,
            cache_misses: 0,
        }
    }

    fn advance(&mut self, instruction: &Instruction) {
        self.chain = self.chain.chain(instruction, None);
    }
}

#[derive(Debug, Clone)]
struct CopySource {
    paths: Vec<PathBuf>,
    material: Digest,
}

fn instruction_error(
    stage: &str,
    instruction: &str,
    source: impl std::error::Error + Send + Sync + 'static,
) -> KilnError {
    KilnError::InstructionExecution {
        stage: stage.to_string(),
        instruction: instruction.to_string(),
        source: Box::new(source),
    }
}

fn expand_glob(pattern: &Path) -> std::io::Result<Vec<PathBuf>> {
    let text = pattern.to_string_lossy();
    if !text.contains(['*', '?', '[']) {
        return Ok(if std::fs::symlink_metadata(pattern).is_ok() {
            vec![pattern.to_path_buf()]
        } else {
            Vec::new()
        });
    }
    let mut matches = Vec::new();
    for entry in glob::glob(&text).map_err(std::io::Error::other)? {
        matches.push(entry.map_err(std::io::Error::other)?);
    }
    matches.sort();
    Ok(matches)
}

/// Copy `sources` to `dest` with Dockerfile semantics: a directory source
/// contributes its contents, and `dest` is a directory when it ends in `/`,
/// already is one, or there are several sources.
fn copy_into(sources: &[PathBuf], dest: &Path, force_dir: bool) -> std::io::Result<()> {
    let dest_is_dir = force_dir || sources.len() > 1 || dest.is_dir();
    for source in sources {
        let target = if std::fs::metadata(source).is_ok_and(|m| m.is_dir()) {
            dest.to_path_buf()
        } else if dest_is_dir {
            match source.file_name() {
                Some(name) => dest.join(name),
                None => dest.to_path_buf(),
            }
        } else {
            dest.to_path_buf()
        };
        snapshot::copy_tree(source, &target)?;
    }
    Ok(())
}

async fn blocking<T, E, F>(f: F) -> KilnResult<T>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<KilnError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| KilnError::Internal {
            message: format!("blocking task failed: {e}"),
        })?
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{BuildArgs, parse_descriptor};
    use crate::runner::HostRunner;
    use crate::snapshot::LayerArtifact;

    fn pack_tree(root: &Path) -> LayerArtifact {
        let changes = Snapshot::diff(&Snapshot::default(), &Snapshot::capture(root).unwrap());
        snapshot::pack_changes(root, &changes).unwrap()
    }

    fn graph(text: &str) -> Arc<StageGraph> {
        Arc::new(StageGraph::build(parse_descriptor(text, &BuildArgs::new()).unwrap()).unwrap())
    }

    fn executor(context: &Path) -> Executor {
        Executor::new(
            LayerCache::in_memory(),
            Arc::new(HostRunner::new()),
            ExecutorOptions {
                context_dir: context.to_path_buf(),
                ..ExecutorOptions::default()
            },
        )
    }

    #[tokio::test]
    async fn metadata_builds_config() {
        let context = TempDir::new().unwrap();
        let graph = graph(
            "FROM alpine\nENV A=1\nWORKDIR /srv\nWORKDIR web\nUSER app\nEXPOSE 80\nCMD [\"serve\"]\nENTRYPOINT [\"run\"]",
        );
        let report = executor(context.path())
            .execute(graph, 0, &CancelToken::new(), &EventBus::new())
            .await
            .unwrap();
        let config = &report.target.config;
        assert_eq!(config.workdir, "/srv/web");
        assert_eq!(config.user.as_deref(), Some("app"));
        assert_eq!(config.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(config.entrypoint, Some(vec!["run".to_string()]));
        assert_eq!(config.cmd, Some(vec!["serve".to_string()]));
        assert!(report.layers.is_empty());
    }

    #[tokio::test]
    async fn inherited_cmd_is_reset_by_entrypoint() {
        let context = TempDir::new().unwrap();
        let graph = graph("FROM a AS base\nCMD [\"old\"]\nFROM base\nENTRYPOINT [\"new\"]");
        let report = executor(context.path())
            .execute(graph, 1, &CancelToken::new(), &EventBus::new())
            .await
            .unwrap();
        assert_eq!(report.target.config.cmd, None);
    }

    #[tokio::test]
    async fn copy_from_context_and_stage() {
        let context = TempDir::new().unwrap();
        std::fs::create_dir_all(context.path().join("src")).unwrap();
        std::fs::write(context.path().join("src/main.txt"), "main").unwrap();
        std::fs::write(context.path().join("pom.xml"), "<project/>").unwrap();

        let graph = graph(
            "FROM scratch AS builder\nWORKDIR /app\nCOPY pom.xml .\nCOPY src ./src\nRUN cat src/main.txt > out.jar\n\
             FROM scratch\nWORKDIR /app\nCOPY --from=builder /app/*.jar app.jar\nENTRYPOINT [\"app\"]",
        );
        let report = executor(context.path())
            .execute(graph, 1, &CancelToken::new(), &EventBus::new())
            .await
            .unwrap();

        let rootfs = report.target.rootfs();
        assert_eq!(std::fs::read_to_string(rootfs.join("app/app.jar")).unwrap(), "main");
        let builder = &report.stages[0];
        assert_eq!(
            std::fs::read_to_string(builder.rootfs().join("app/pom.xml")).unwrap(),
            "<project/>"
        );
        assert!(builder.rootfs().join("app/src/main.txt").is_file());
        assert_eq!(report.layers.len(), 4);
    }

    #[tokio::test]
    async fn cache_hit_reproduces_filesystem() {
        let context = TempDir::new().unwrap();
        let cache = LayerCache::in_memory();
        let text = "FROM scratch\nRUN mkdir -p data && echo hi > data/f";
        let run = |cache: LayerCache| {
            let context = context.path().to_path_buf();
            async move {
                Executor::new(
                    cache,
                    Arc::new(HostRunner::new()),
                    ExecutorOptions {
                        context_dir: context,
                        ..ExecutorOptions::default()
                    },
                )
                .execute(graph(text), 0, &CancelToken::new(), &EventBus::new())
                .await
                .unwrap()
            }
        };

        let first = run(cache.clone()).await;
        let second = run(cache).await;
        assert_eq!(first.cache_misses(), 1);
        assert_eq!(second.cache_hits(), 1);
        assert_eq!(
            pack_tree(first.target.rootfs()).digest,
            pack_tree(second.target.rootfs()).digest
        );
    }

    #[tokio::test]
    async fn missing_copy_source_fails_stage() {
        let context = TempDir::new().unwrap();
        let graph = graph("FROM scratch\nCOPY nothing.txt /");
        let err = executor(context.path())
            .execute(graph, 0, &CancelToken::new(), &EventBus::new())
            .await
            .unwrap_err();
        match err {
            KilnError::BuildFailed { failures } => {
                assert_eq!(failures.len(), 1);
                assert!(matches!(
                    &failures[0].cause,
                    StageFailureCause::Failed(e) if matches!(**e, KilnError::InstructionExecution { .. })
                ));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn copy_into_semantics() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        std::fs::write(src.path().join("a.txt"), "a").unwrap();
        std::fs::write(src.path().join("b.txt"), "b").unwrap();

        copy_into(&[src.path().join("a.txt")], &dst.path().join("renamed"), false).unwrap();
        assert!(dst.path().join("renamed").is_file());

        copy_into(
            &[src.path().join("a.txt"), src.path().join("b.txt")],
            &dst.path().join("many"),
            false,
        )
        .unwrap();
        assert!(dst.path().join("many/a.txt").is_file());
        assert!(dst.path().join("many/b.txt").is_file());

        copy_into(&[src.path().to_path_buf()], &dst.path().join("tree"), false).unwrap();
        assert!(dst.path().join("tree/a.txt").is_file());
    }
}
