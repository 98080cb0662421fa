//! The pipeline: one value owning the task graph, the path table, the
//! build cache and the rebuilt-event channel.
//!
//! Declared through [`Pipeline::design`], then driven by one of the entry
//! operations: [`build`](Pipeline::build) runs every task once,
//! [`watch`](Pipeline::watch) builds and then rebuilds on changes, and
//! [`serve`](Pipeline::serve) additionally hosts the output directory
//! with live reload.

use std::sync::Mutex;

use camino::Utf8PathBuf;

use crate::Mode;
use crate::cache::{BuildCache, CACHE_FILE};
use crate::error::{BellowsError, ConfigError};
use crate::events::Broadcaster;
use crate::graph::TaskGraph;
use crate::paths::PathMap;
use crate::task::{RunReport, Task, TaskContext};
#[cfg(all(feature = "live", feature = "server"))]
use crate::serve::{PreviewServer, ServeOptions};
#[cfg(feature = "live")]
use crate::watch::{WatchCoordinator, WatchRule};

pub struct Pipeline {
    graph: TaskGraph,
    paths: PathMap,
    out_dir: Utf8PathBuf,
    cache_file: Utf8PathBuf,
    cache: Mutex<BuildCache>,
    events: Broadcaster,
    #[cfg(feature = "live")]
    rules: Vec<WatchRule>,
}

impl Pipeline {
    pub fn design() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Access to the rebuilt-event channel, mostly useful for tooling
    /// built on top of the pipeline.
    pub fn events(&self) -> &Broadcaster {
        &self.events
    }

    /// Run every registered task once.
    ///
    /// Resolves with the run report even when tasks failed; the caller
    /// decides whether that is fatal.
    pub fn build(&self) -> Result<RunReport, BellowsError> {
        crate::logging::init();
        self.prime_cache()?;

        let report = self.run_all(Mode::Build, None);
        self.persist_cache();

        Ok(report)
    }

    /// Build once, then watch the configured patterns and rebuild on
    /// every change until the process exits.
    #[cfg(feature = "live")]
    pub fn watch(&self) -> Result<(), BellowsError> {
        crate::logging::init();
        self.watch_with(None)
    }

    /// Start the preview server and, once it is listening, enter watch
    /// mode.
    #[cfg(all(feature = "live", feature = "server"))]
    pub fn serve(&self, options: ServeOptions) -> Result<(), BellowsError> {
        crate::logging::init();

        let server = PreviewServer::start(&self.out_dir, options, self.events.subscribe())?;

        self.watch_with(Some(server.ws_port))
    }

    #[cfg(feature = "live")]
    fn watch_with(&self, reload_port: Option<u16>) -> Result<(), BellowsError> {
        use crate::error::WatchError;
        use std::env;

        self.prime_cache()?;

        tracing::info!("running initial build...");
        self.run_all(Mode::Watch, reload_port);
        self.persist_cache();

        let project_root = env::current_dir()
            .map_err(WatchError::Io)
            .and_then(|dir| {
                Utf8PathBuf::try_from(dir)
                    .map_err(|e| WatchError::Io(e.into_io_error()))
            })?;

        let coordinator = WatchCoordinator::new(
            &self.graph,
            &self.paths,
            &self.cache,
            &self.events,
            &self.rules,
            self.out_dir.clone(),
            project_root,
            self.cache_file.clone(),
            reload_port,
        )?;

        tracing::info!("initial build complete, watching for changes...");
        coordinator.run()?;

        Ok(())
    }

    fn run_all(&self, mode: Mode, reload_port: Option<u16>) -> RunReport {
        let ctx = TaskContext {
            mode,
            reload_port,
            out_dir: &self.out_dir,
            paths: &self.paths,
            cache: &self.cache,
        };

        self.graph.run_all(&ctx, &self.events)
    }

    fn prime_cache(&self) -> Result<(), BellowsError> {
        let loaded = BuildCache::load(&self.cache_file)?;
        *self.cache.lock().unwrap() = loaded;
        Ok(())
    }

    fn persist_cache(&self) {
        let cache = self.cache.lock().unwrap();
        if let Err(e) = cache.save(&self.cache_file) {
            tracing::warn!("couldn't persist the build cache: {e}");
        }
    }
}

pub struct PipelineBuilder {
    tasks: Vec<Task>,
    paths: PathMap,
    out_dir: Utf8PathBuf,
    cache_file: Utf8PathBuf,
    #[cfg(feature = "live")]
    rules: Vec<WatchRule>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self {
            tasks: Vec::new(),
            paths: PathMap::default(),
            out_dir: Utf8PathBuf::from("build"),
            cache_file: Utf8PathBuf::from(CACHE_FILE),
            #[cfg(feature = "live")]
            rules: Vec::new(),
        }
    }
}

impl PipelineBuilder {
    pub fn paths(mut self, paths: PathMap) -> Self {
        self.paths = paths;
        self
    }

    /// Directory served by the preview server. Defaults to `build`.
    pub fn output(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.out_dir = dir.into();
        self
    }

    pub fn cache_file(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.cache_file = path.into();
        self
    }

    pub fn task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    #[cfg(feature = "live")]
    pub fn rule(mut self, rule: WatchRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn finish(self) -> Result<Pipeline, ConfigError> {
        let graph = TaskGraph::assemble(self.tasks)?;

        Ok(Pipeline {
            graph,
            paths: self.paths,
            out_dir: self.out_dir,
            cache_file: self.cache_file,
            cache: Mutex::new(BuildCache::default()),
            events: Broadcaster::new(),
            #[cfg(feature = "live")]
            rules: self.rules,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::AssetClass;
    use crate::task::TaskStatus;
    use std::fs;

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn build_runs_tasks_and_persists_the_cache() {
        let (_guard, dir) = tempdir();
        let out = dir.join("build");
        fs::create_dir_all(&out).unwrap();

        let bundle = out.join("styles.min.css");
        let pipeline = Pipeline::design()
            .output(out.clone())
            .cache_file(dir.join(".cache/fingerprints.bin"))
            .task(
                Task::new("styles", move |_| {
                    fs::write(&bundle, ".btn{}")?;
                    Ok(())
                })
                .class(AssetClass::Styles),
            )
            .finish()
            .unwrap();

        let report = pipeline.build().unwrap();

        assert!(report.is_success());
        assert_eq!(
            fs::read_to_string(out.join("styles.min.css")).unwrap(),
            ".btn{}"
        );
        assert!(dir.join(".cache/fingerprints.bin").exists());
    }

    #[test]
    fn build_reports_failures_without_erroring() {
        let (_guard, dir) = tempdir();

        let pipeline = Pipeline::design()
            .cache_file(dir.join(".cache/fingerprints.bin"))
            .task(Task::new("pages", |_| {
                anyhow::bail!("template is malformed")
            }))
            .finish()
            .unwrap();

        let report = pipeline.build().unwrap();

        assert!(!report.is_success());
        assert!(matches!(
            report.status_of("pages"),
            Some(TaskStatus::Failed { .. })
        ));
    }

    #[test]
    fn empty_pages_glob_builds_cleanly() {
        let (_guard, dir) = tempdir();
        fs::create_dir_all(dir.join("src/pages")).unwrap();

        let paths = PathMap::design()
            .class(
                AssetClass::Pages,
                [dir.join("src/pages/*.pug").to_string()],
                dir.join("build"),
            )
            .finish()
            .unwrap();

        let pipeline = Pipeline::design()
            .paths(paths)
            .cache_file(dir.join(".cache/fingerprints.bin"))
            .task(Task::new("pages", |ctx| {
                // Render every matched page; an empty match renders
                // nothing and succeeds.
                for _page in ctx.paths.matches(AssetClass::Pages)? {
                    unreachable!("no pages exist");
                }
                Ok(())
            }))
            .finish()
            .unwrap();

        let report = pipeline.build().unwrap();
        assert!(report.is_success());
    }

    #[test]
    fn actions_see_the_shared_cache() {
        let (_guard, dir) = tempdir();
        let source = dir.join("src/images/logo.png");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::write(&source, b"png bytes").unwrap();

        let key: Utf8PathBuf = source.clone();
        let pipeline = Pipeline::design()
            .cache_file(dir.join(".cache/fingerprints.bin"))
            .task(Task::new("images", move |ctx| {
                let mut cache = ctx.cache.lock().unwrap();
                cache.update(&key)?;
                Ok(())
            }))
            .finish()
            .unwrap();

        pipeline.build().unwrap();
        assert!(pipeline.cache.lock().unwrap().contains(&source));
    }
}
