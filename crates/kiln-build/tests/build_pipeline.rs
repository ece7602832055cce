//! End-to-end builds through `Builder` with real host commands.
use std::collections::HashSet;
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kiln_build::runner::RunFailure;
use kiln_build::{
    BuildEvent, BuildPhase, BuildRequest, Builder, CancelToken, CommandRunner, HostRunner,
    LayerCache, RetryPolicy, RunRequest,
};
use kiln_common::{KilnError, StageFailureCause};
use tempfile::TempDir;
use tokio::sync::Notify;

const PIPELINE: &str = r#"
FROM alpine:3.19 AS builder
WORKDIR /src
COPY app.txt .
RUN mkdir -p out && cp app.txt out/app.jar

FROM eclipse-temurin:21-jre AS runtime
WORKDIR /app
COPY --from=builder /src/out/app.jar app.jar
ENV JAVA_OPTS="-Xmx256m"
EXPOSE 8080
ENTRYPOINT ["java", "-jar", "app.jar"]
"#;

/// Host runner that counts executions.
#[derive(Default)]
struct CountingRunner {
    runs: AtomicUsize,
}

impl CountingRunner {
    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandRunner for CountingRunner {
    async fn run(&self, request: &RunRequest) -> Result<(), RunFailure> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        HostRunner::new().run(request).await
    }
}

/// Runs every command, but reports the first run as failed after leaving a
/// stray file behind.
#[derive(Default)]
struct FlakyRunner {
    runs: AtomicUsize,
}

#[async_trait]
impl CommandRunner for FlakyRunner {
    async fn run(&self, request: &RunRequest) -> Result<(), RunFailure> {
        let first = self.runs.fetch_add(1, Ordering::SeqCst) == 0;
        HostRunner::new().run(request).await?;
        if first {
            tokio::fs::write(request.rootfs.join("partial.log"), "attempt 1")
                .await
                .map_err(|source| RunFailure::Spawn {
                    program: "flaky".into(),
                    source,
                })?;
            return Err(RunFailure::Exit {
                code: Some(1),
                stderr: "connection reset".into(),
            });
        }
        Ok(())
    }
}

/// Signals when a command starts, then never finishes.
#[derive(Default)]
struct HangingRunner {
    started: Notify,
}

#[async_trait]
impl CommandRunner for HangingRunner {
    async fn run(&self, _request: &RunRequest) -> Result<(), RunFailure> {
        self.started.notify_one();
        std::future::pending().await
    }
}

fn context() -> Result<TempDir, Box<dyn Error>> {
    let dir = TempDir::new()?;
    std::fs::write(dir.path().join("app.txt"), "compiled service")?;
    Ok(dir)
}

fn builder(cache: &LayerCache, runner: Arc<dyn CommandRunner>, work: &Path) -> Builder {
    Builder::new(cache.clone())
        .with_runner(runner)
        .with_work_dir(work)
}

#[tokio::test]
async fn multi_stage_build_combines_layers() -> Result<(), Box<dyn Error>> {
    let ctx = context()?;
    let work = TempDir::new()?;
    let cache = LayerCache::in_memory();
    let runner = Arc::new(CountingRunner::default());

    let outcome = builder(&cache, runner.clone(), work.path())
        .build(BuildRequest::from_text(PIPELINE, ctx.path()), &CancelToken::new())
        .await?;

    // builder: COPY + RUN, runtime: COPY
    assert_eq!(outcome.manifest.layers.len(), 3);
    assert_eq!(outcome.stats.layers, 3);
    assert_eq!(outcome.stats.stages, 2);
    assert_eq!(outcome.stats.cache_misses, 3);
    assert_eq!(runner.runs(), 1);

    let config = &outcome.manifest.config;
    assert_eq!(config.entrypoint, vec!["java", "-jar", "app.jar"]);
    assert_eq!(config.working_dir, "/app");
    assert_eq!(config.env, vec!["JAVA_OPTS=-Xmx256m"]);
    assert!(config.exposed_ports.contains_key("8080/tcp"));
    assert_eq!(outcome.manifest.layers[1].created_by, "RUN mkdir -p out && cp app.txt out/app.jar");
    assert_eq!(cache.stats().entries, 3);
    Ok(())
}

#[tokio::test]
async fn rebuild_is_served_from_cache() -> Result<(), Box<dyn Error>> {
    let ctx = context()?;
    let work = TempDir::new()?;
    let cache = LayerCache::in_memory();

    let first = builder(&cache, Arc::new(CountingRunner::default()), work.path())
        .build(BuildRequest::from_text(PIPELINE, ctx.path()), &CancelToken::new())
        .await?;

    let runner = Arc::new(CountingRunner::default());
    let second = builder(&cache, runner.clone(), work.path())
        .build(BuildRequest::from_text(PIPELINE, ctx.path()), &CancelToken::new())
        .await?;

    assert_eq!(runner.runs(), 0);
    assert_eq!(second.stats.cache_hits, 3);
    assert_eq!(second.stats.cache_misses, 0);
    assert_eq!(first.digest, second.digest);
    assert_eq!(
        first.manifest.to_canonical_json()?,
        second.manifest.to_canonical_json()?
    );
    Ok(())
}

#[tokio::test]
async fn changed_context_invalidates_dependent_layers() -> Result<(), Box<dyn Error>> {
    let ctx = context()?;
    let work = TempDir::new()?;
    let cache = LayerCache::in_memory();

    let first = builder(&cache, Arc::new(CountingRunner::default()), work.path())
        .build(BuildRequest::from_text(PIPELINE, ctx.path()), &CancelToken::new())
        .await?;

    std::fs::write(ctx.path().join("app.txt"), "patched service")?;
    let runner = Arc::new(CountingRunner::default());
    let second = builder(&cache, runner.clone(), work.path())
        .build(BuildRequest::from_text(PIPELINE, ctx.path()), &CancelToken::new())
        .await?;

    assert_eq!(runner.runs(), 1);
    assert_eq!(second.stats.cache_hits, 0);
    assert_ne!(first.digest, second.digest);
    Ok(())
}

#[tokio::test]
async fn no_cache_recomputes_every_layer() -> Result<(), Box<dyn Error>> {
    let ctx = context()?;
    let work = TempDir::new()?;
    let cache = LayerCache::in_memory();

    builder(&cache, Arc::new(CountingRunner::default()), work.path())
        .build(BuildRequest::from_text(PIPELINE, ctx.path()), &CancelToken::new())
        .await?;

    let runner = Arc::new(CountingRunner::default());
    let outcome = builder(&cache, runner.clone(), work.path())
        .build(
            BuildRequest::from_text(PIPELINE, ctx.path()).with_no_cache(true),
            &CancelToken::new(),
        )
        .await?;

    assert_eq!(runner.runs(), 1);
    assert_eq!(outcome.stats.cache_hits, 0);
    Ok(())
}

#[tokio::test]
async fn target_selects_an_earlier_stage() -> Result<(), Box<dyn Error>> {
    let descriptor = "FROM scratch AS tools\nRUN echo hi > hi.txt\nENTRYPOINT [\"/hi\"]\n\
                      FROM scratch AS app\nRUN exit 1\n";
    let work = TempDir::new()?;
    let runner = Arc::new(CountingRunner::default());

    let outcome = builder(&LayerCache::in_memory(), runner.clone(), work.path())
        .build(
            BuildRequest::from_text(descriptor, work.path()).with_target("tools"),
            &CancelToken::new(),
        )
        .await?;

    assert_eq!(runner.runs(), 1);
    assert_eq!(outcome.stats.stages, 1);
    assert_eq!(outcome.manifest.config.entrypoint, vec!["/hi"]);
    Ok(())
}

#[tokio::test]
async fn failed_stage_is_isolated() -> Result<(), Box<dyn Error>> {
    let descriptor = r#"
FROM scratch AS broken
RUN echo "no compiler" >&2; exit 3

FROM scratch AS sibling
RUN echo ok > ok.txt

FROM scratch AS final
COPY --from=broken /bin/app /app
COPY --from=sibling /ok.txt /ok.txt
ENTRYPOINT ["/app"]
"#;
    let work = TempDir::new()?;
    let cache = LayerCache::in_memory();
    let builder = builder(&cache, Arc::new(CountingRunner::default()), work.path());
    let mut events = builder.events().subscribe();

    let err = builder
        .build(BuildRequest::from_text(descriptor, work.path()), &CancelToken::new())
        .await
        .unwrap_err();

    let KilnError::BuildFailed { failures } = err else {
        panic!("expected BuildFailed, got {err:?}");
    };
    assert_eq!(failures.len(), 2);

    let broken = failures.iter().find(|f| f.stage == "broken").unwrap();
    let StageFailureCause::Failed(cause) = &broken.cause else {
        panic!("broken should have failed on its own");
    };
    let KilnError::InstructionExecution { instruction, source, .. } = cause.as_ref() else {
        panic!("expected an instruction error, got {cause:?}");
    };
    assert!(instruction.starts_with("RUN echo"));
    let message = source.to_string();
    assert!(message.contains("exited with code 3"), "{message}");
    assert!(message.contains("no compiler"), "{message}");

    let skipped = failures.iter().find(|f| f.stage == "final").unwrap();
    assert!(matches!(
        &skipped.cause,
        StageFailureCause::DependencyFailed { dependency } if dependency == "broken"
    ));

    // The independent sibling still finished and cached its layer.
    assert_eq!(cache.stats().entries, 1);

    let mut phases = Vec::new();
    let mut completed = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            BuildEvent::PhaseChanged { phase, .. } => phases.push(phase),
            BuildEvent::StageCompleted { stage, .. } => completed.push(stage),
            _ => {}
        }
    }
    assert_eq!(completed, vec!["sibling"]);
    assert_eq!(phases.last(), Some(&BuildPhase::Failed));
    assert!(!phases.contains(&BuildPhase::Packaging));
    Ok(())
}

#[tokio::test]
async fn unknown_reference_fails_before_execution() -> Result<(), Box<dyn Error>> {
    let descriptor = "FROM scratch AS app\nRUN touch x\nCOPY --from=missing /out /out\n";
    let work = TempDir::new()?;
    let runner = Arc::new(CountingRunner::default());

    let err = builder(&LayerCache::in_memory(), runner.clone(), work.path())
        .build(BuildRequest::from_text(descriptor, work.path()), &CancelToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        KilnError::UnknownStageReference { ref stage, ref reference } if stage == "app" && reference == "missing"
    ));
    assert_eq!(runner.runs(), 0);
    Ok(())
}

#[tokio::test]
async fn cyclic_descriptor_is_rejected() -> Result<(), Box<dyn Error>> {
    let descriptor = "FROM scratch AS a\nCOPY --from=b /x /x\nFROM scratch AS b\nCOPY --from=a /y /y\n";
    let work = TempDir::new()?;
    let runner = Arc::new(CountingRunner::default());

    let err = builder(&LayerCache::in_memory(), runner.clone(), work.path())
        .build(BuildRequest::from_text(descriptor, work.path()), &CancelToken::new())
        .await
        .unwrap_err();

    let KilnError::Cycle { stages } = err else {
        panic!("expected a cycle, got {err:?}");
    };
    assert!(stages.contains(&"a".to_string()));
    assert!(stages.contains(&"b".to_string()));
    assert_eq!(runner.runs(), 0);
    Ok(())
}

#[tokio::test]
async fn cancellation_discards_partial_layers() -> Result<(), Box<dyn Error>> {
    let descriptor = "FROM scratch AS slow\nRUN echo first > a\nRUN sleep 600\nENTRYPOINT [\"/a\"]\n";
    let work = TempDir::new()?;
    let cache = LayerCache::in_memory();
    let runner = Arc::new(HangingRunner::default());
    let builder = builder(&cache, runner.clone(), work.path());
    let cancel = CancelToken::new();

    let build = builder.build(BuildRequest::from_text(descriptor, work.path()), &cancel);
    let trigger = async {
        runner.started.notified().await;
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(build, trigger);

    assert!(matches!(result, Err(KilnError::Cancelled)), "{result:?}");
    assert_eq!(cache.stats().entries, 0);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn persistent_cache_survives_reopen() -> Result<(), Box<dyn Error>> {
    let ctx = context()?;
    let work = TempDir::new()?;
    let cache_dir = TempDir::new()?;

    let first = builder(
        &LayerCache::open(cache_dir.path())?,
        Arc::new(CountingRunner::default()),
        work.path(),
    )
    .build(BuildRequest::from_text(PIPELINE, ctx.path()), &CancelToken::new())
    .await?;

    let reopened = LayerCache::open(cache_dir.path())?;
    assert_eq!(reopened.stats().entries, 3);

    let runner = Arc::new(CountingRunner::default());
    let second = builder(&reopened, runner.clone(), work.path())
        .build(BuildRequest::from_text(PIPELINE, ctx.path()), &CancelToken::new())
        .await?;

    assert_eq!(runner.runs(), 0);
    assert_eq!(first.digest, second.digest);
    Ok(())
}

#[tokio::test]
async fn retry_starts_from_the_filesystem_before_the_run() -> Result<(), Box<dyn Error>> {
    let descriptor = "FROM scratch AS app\nRUN mkdir out && echo ok > out/state\nENTRYPOINT [\"/out/state\"]\n";
    let work = TempDir::new()?;
    let cache = LayerCache::in_memory();
    let runner = Arc::new(FlakyRunner::default());

    let outcome = builder(&cache, runner.clone(), work.path())
        .with_retry(RetryPolicy {
            attempts: 2,
            backoff: Duration::from_millis(1),
        })
        .build(BuildRequest::from_text(descriptor, work.path()), &CancelToken::new())
        .await?;

    assert_eq!(runner.runs.load(Ordering::SeqCst), 2);
    assert_eq!(outcome.manifest.layers.len(), 1);

    let entries = cache.entries();
    let bytes = cache.artifact(&entries[0].1.layer)?;
    let mut paths = Vec::new();
    for entry in tar::Archive::new(bytes.as_slice()).entries()? {
        let path = entry?.path()?.to_string_lossy().trim_end_matches('/').to_string();
        paths.push(path);
    }
    assert_eq!(paths, ["out", "out/state"]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_builds_share_one_execution() -> Result<(), Box<dyn Error>> {
    let ctx = context()?;
    let work = TempDir::new()?;
    let cache = LayerCache::in_memory();
    let runner = Arc::new(CountingRunner::default());
    let cancel = CancelToken::new();

    let first = builder(&cache, runner.clone(), work.path());
    let second = builder(&cache, runner.clone(), work.path());
    let (a, b) = tokio::join!(
        first.build(BuildRequest::from_text(PIPELINE, ctx.path()), &cancel),
        second.build(BuildRequest::from_text(PIPELINE, ctx.path()), &cancel),
    );
    let (a, b) = (a?, b?);

    assert_eq!(runner.runs(), 1);
    assert_eq!(a.stats.cache_misses + b.stats.cache_misses, 3);
    assert_eq!(a.manifest.to_canonical_json()?, b.manifest.to_canonical_json()?);
    assert_eq!(cache.stats().entries, 3);
    Ok(())
}

#[tokio::test]
async fn independent_caches_produce_identical_manifests() -> Result<(), Box<dyn Error>> {
    let ctx = context()?;
    let mut manifests = Vec::new();
    for _ in 0..2 {
        let work = TempDir::new()?;
        let outcome = builder(
            &LayerCache::in_memory(),
            Arc::new(CountingRunner::default()),
            work.path(),
        )
        .build(BuildRequest::from_text(PIPELINE, ctx.path()), &CancelToken::new())
        .await?;
        assert_eq!(outcome.stats.cache_hits, 0);
        manifests.push((outcome.manifest.to_canonical_json()?, outcome.digest));
    }

    assert_eq!(manifests[0], manifests[1]);
    Ok(())
}

#[tokio::test]
async fn shared_layers_appear_once_in_the_image() -> Result<(), Box<dyn Error>> {
    let descriptor = r#"
FROM alpine:3.19 AS left
RUN echo shared > shared.txt

FROM alpine:3.19 AS right
RUN echo shared > shared.txt

FROM scratch AS app
COPY --from=left /shared.txt left.txt
COPY --from=right /shared.txt right.txt
ENTRYPOINT ["/left.txt"]
"#;
    let work = TempDir::new()?;
    let runner = Arc::new(CountingRunner::default());

    let outcome = builder(&LayerCache::in_memory(), runner.clone(), work.path())
        .build(BuildRequest::from_text(descriptor, work.path()), &CancelToken::new())
        .await?;

    assert_eq!(runner.runs(), 1);
    let digests: Vec<_> = outcome.manifest.layers.iter().map(|l| &l.digest).collect();
    assert_eq!(digests.len(), 3);
    assert_eq!(digests.iter().collect::<HashSet<_>>().len(), 3);
    assert_eq!(outcome.manifest.layers[0].created_by, "RUN echo shared > shared.txt");
    Ok(())
}
