//! The watch coordinator: maps filesystem change events to task runs.
//!
//! Each rule associates one glob pattern with an ordered list of tasks.
//! Events are handled one at a time and are deliberately *not* debounced;
//! every change triggers its own independent run. Deletions are special
//! cased for the images class only: the corresponding generated file is
//! removed and the build cache entry evicted, so a re-added file is
//! treated as novel. Deletions for every other class publish a plain
//! reload.

use std::fs;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use notify::{EventKind, RecursiveMode, Watcher};

use crate::Mode;
use crate::cache::BuildCache;
use crate::error::WatchError;
use crate::events::{Broadcaster, Rebuild};
use crate::graph::TaskGraph;
use crate::paths::{AssetClass, PathMap};
use crate::task::TaskContext;

/// A (glob pattern → ordered task list) association. Lives for the whole
/// watch session.
#[derive(Debug, Clone)]
pub struct WatchRule {
    pub(crate) pattern: String,
    pub(crate) tasks: Vec<String>,
    pub(crate) class: Option<AssetClass>,
}

impl WatchRule {
    /// A rule with an empty task list publishes a reload without running
    /// anything, which is how plain HTML changes are wired.
    pub fn new(
        pattern: impl Into<String>,
        tasks: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            tasks: tasks.into_iter().map(Into::into).collect(),
            class: None,
        }
    }

    pub fn class(mut self, class: AssetClass) -> Self {
        self.class = Some(class);
        self
    }
}

#[derive(Debug)]
struct CompiledRule {
    root: Utf8PathBuf,
    pattern: Pattern,
    tasks: Vec<String>,
    class: Option<AssetClass>,
}

#[derive(Debug)]
pub(crate) struct WatchCoordinator<'a> {
    graph: &'a TaskGraph,
    paths: &'a PathMap,
    cache: &'a Mutex<BuildCache>,
    events: &'a Broadcaster,
    rules: Vec<CompiledRule>,
    out_dir: Utf8PathBuf,
    project_root: Utf8PathBuf,
    cache_file: Utf8PathBuf,
    reload_port: Option<u16>,
}

impl<'a> WatchCoordinator<'a> {
    pub(crate) fn new(
        graph: &'a TaskGraph,
        paths: &'a PathMap,
        cache: &'a Mutex<BuildCache>,
        events: &'a Broadcaster,
        rules: &[WatchRule],
        out_dir: Utf8PathBuf,
        project_root: Utf8PathBuf,
        cache_file: Utf8PathBuf,
        reload_port: Option<u16>,
    ) -> Result<Self, WatchError> {
        let mut compiled = Vec::with_capacity(rules.len());

        for rule in rules {
            for task in &rule.tasks {
                if !graph.contains(task) {
                    return Err(WatchError::UnknownTask(task.clone()));
                }
            }

            let (root, pattern) =
                resolve_rule_root(&rule.pattern).map_err(|e| WatchError::Root {
                    pattern: rule.pattern.clone(),
                    message: e.to_string(),
                })?;

            compiled.push(CompiledRule {
                root,
                pattern,
                tasks: rule.tasks.clone(),
                class: rule.class,
            });
        }

        Ok(Self {
            graph,
            paths,
            cache,
            events,
            rules: compiled,
            out_dir,
            project_root,
            cache_file,
            reload_port,
        })
    }

    /// Subscribe to the filesystem and dispatch events until the process
    /// exits. Errors inside a triggered run never break the loop.
    pub(crate) fn run(&self) -> Result<(), WatchError> {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut watcher = notify::recommended_watcher(tx)?;

        let roots = collapse_roots(self.rules.iter().map(|rule| rule.root.clone()).collect());
        for root in &roots {
            tracing::info!("watching {root}");
            watcher.watch(root.as_std_path(), RecursiveMode::Recursive)?;
        }

        while let Ok(result) = rx.recv() {
            match result {
                Ok(event) => self.handle_event(&event),
                Err(e) => tracing::error!("watch error: {e}"),
            }
        }

        Ok(())
    }

    fn handle_event(&self, event: &notify::Event) {
        let removed = match event.kind {
            EventKind::Create(..) | EventKind::Modify(..) => false,
            EventKind::Remove(..) => true,
            _ => return,
        };

        for path in &event.paths {
            let Some(path) = Utf8Path::from_path(path) else {
                tracing::error!("non UTF-8 path in watch event: {path:?}");
                continue;
            };

            if removed {
                self.handle_removed(path);
            } else {
                self.handle_changed(path);
            }
        }
    }

    fn handle_changed(&self, path: &Utf8Path) {
        let mut tasks: Vec<&str> = Vec::new();
        let mut reload_only = false;

        for rule in self.matching_rules(path) {
            if rule.tasks.is_empty() {
                reload_only = true;
            }
            for task in &rule.tasks {
                if !tasks.contains(&task.as_str()) {
                    tasks.push(task);
                }
            }
        }

        if !tasks.is_empty() {
            tracing::info!("change detected in {path}, running {tasks:?}");

            let ctx = TaskContext {
                mode: Mode::Watch,
                reload_port: self.reload_port,
                out_dir: &self.out_dir,
                paths: self.paths,
                cache: self.cache,
            };

            match self.graph.run(&tasks, &ctx, self.events) {
                Ok(report) if report.is_success() => self.save_cache(),
                // Failures are already logged at the task boundary; the
                // next event still gets a fresh, independent run.
                Ok(_) => {}
                Err(e) => tracing::error!("couldn't run tasks: {e}"),
            }
        }

        if reload_only {
            self.events.publish(Rebuild::Reload);
        }
    }

    pub(crate) fn handle_removed(&self, path: &Utf8Path) {
        for rule in self.matching_rules(path) {
            match rule.class {
                Some(AssetClass::Images) => self.remove_generated_image(path, rule),
                // Deletions for other classes intentionally have no
                // compensating delete, matching the documented behavior.
                _ => self.events.publish(Rebuild::Reload),
            }
        }
    }

    fn remove_generated_image(&self, path: &Utf8Path, rule: &CompiledRule) {
        let source = path
            .strip_prefix(&self.project_root)
            .map(ToOwned::to_owned)
            .unwrap_or_else(|_| path.to_owned());

        let entry = {
            let mut cache = self.cache.lock().unwrap();
            cache.evict(&source).or_else(|| cache.evict(path))
        };

        let generated = entry.and_then(|entry| entry.output).or_else(|| {
            let rel = path.strip_prefix(&rule.root).ok()?;
            Some(self.paths.output(AssetClass::Images)?.join(rel))
        });

        if let Some(generated) = generated {
            match fs::remove_file(&generated) {
                Ok(()) => tracing::info!("removed generated {generated}"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::error!("couldn't remove {generated}: {e}"),
            }
        }

        self.save_cache();
        self.events.publish(Rebuild::Reload);
    }

    fn matching_rules(&self, path: &Utf8Path) -> impl Iterator<Item = &CompiledRule> {
        self.rules
            .iter()
            .filter(|rule| rule.pattern.matches_path(path.as_std_path()))
    }

    fn save_cache(&self) {
        let cache = self.cache.lock().unwrap();
        if let Err(e) = cache.save(&self.cache_file) {
            tracing::warn!("couldn't persist the build cache: {e}");
        }
    }
}

/// Splits a glob string into a canonicalized static root path (for
/// watching) and a compiled absolute Pattern (for matching).
fn resolve_rule_root(glob_str: &str) -> anyhow::Result<(Utf8PathBuf, Pattern)> {
    let path = Utf8Path::new(glob_str);

    // Split the path into a static root and the dynamic suffix holding
    // the wildcards.
    let components: Vec<_> = path.components().collect();
    let split_idx = components
        .iter()
        .position(|c| c.as_str().contains(['*', '?', '[']))
        .unwrap_or(components.len());

    let root_part: Utf8PathBuf = components.iter().take(split_idx).collect();
    let suffix_part: Utf8PathBuf = components.iter().skip(split_idx).collect();

    // The static root must exist on disk.
    let absolute_root = root_part.canonicalize_utf8()?;

    let (watch_root, match_pattern) = if suffix_part.as_str().is_empty() {
        if absolute_root.is_file() {
            // A concrete file gets its parent watched, so atomic
            // replace-writes are still caught.
            let parent = absolute_root
                .parent()
                .unwrap_or(&absolute_root)
                .to_path_buf();
            (parent, absolute_root.into_string())
        } else {
            // A bare directory rule matches everything beneath it.
            let pattern = format!("{absolute_root}/**");
            (absolute_root, pattern)
        }
    } else {
        let pattern = absolute_root.join(&suffix_part).into_string();
        (absolute_root, pattern)
    };

    let pattern = Pattern::new(&match_pattern)?;

    Ok((watch_root, pattern))
}

/// Reduces a set of watch roots to the minimal set. Watches are
/// recursive, so a root covered by an earlier root is redundant.
fn collapse_roots(roots: Vec<Utf8PathBuf>) -> Vec<Utf8PathBuf> {
    let mut roots = roots;
    roots.sort();
    roots.dedup();

    let mut collapsed: Vec<Utf8PathBuf> = Vec::new();
    for root in roots {
        if let Some(last) = collapsed.last()
            && root.starts_with(last)
        {
            continue;
        }
        collapsed.push(root);
    }

    collapsed
}
