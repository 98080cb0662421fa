//! The task graph and its parallel scheduler.
//!
//! Tasks are nodes in a petgraph DAG with prerequisite edges. A run
//! executes the requested tasks plus their transitive prerequisites, each
//! exactly once, issuing independent tasks concurrently on the rayon pool.
//! The scheduler keeps a dependency count per node, seeds every node whose
//! count is zero, and unlocks dependents as results arrive over a channel.
//!
//! A failing action never aborts the run or the process. Its transitive
//! dependents are skipped, and the report records which task originated
//! the failure.

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use crossbeam_channel::unbounded;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};

use crate::error::ConfigError;
use crate::events::{Broadcaster, Rebuild};
use crate::task::{RunReport, Task, TaskContext, TaskOutcome, TaskStatus, TransformError};

#[derive(Debug)]
pub struct TaskGraph {
    graph: DiGraph<Task, ()>,
    index: HashMap<String, NodeIndex>,
}

impl TaskGraph {
    /// Wire registered tasks into a DAG. Duplicate names, unknown
    /// prerequisite references and prerequisite cycles are configuration
    /// errors; none of them can surface later at run time.
    pub(crate) fn assemble(tasks: Vec<Task>) -> Result<Self, ConfigError> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for task in tasks {
            if index.contains_key(&task.name) {
                return Err(ConfigError::DuplicateTask(task.name));
            }

            let name = task.name.clone();
            let node = graph.add_node(task);
            index.insert(name, node);
        }

        let mut edges = Vec::new();
        for node in graph.node_indices() {
            let task = &graph[node];
            for prerequisite in &task.prerequisites {
                let dep = index.get(prerequisite).copied().ok_or_else(|| {
                    ConfigError::UnknownPrerequisite {
                        task: task.name.clone(),
                        prerequisite: prerequisite.clone(),
                    }
                })?;
                edges.push((dep, node));
            }
        }

        for (dep, node) in edges {
            graph.add_edge(dep, node, ());
        }

        toposort(&graph, None)
            .map_err(|cycle| ConfigError::Cycle(graph[cycle.node_id()].name.clone()))?;

        Ok(Self { graph, index })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.graph.node_weights().map(|task| task.name.as_str())
    }

    /// Run every registered task once.
    pub fn run_all(&self, ctx: &TaskContext, events: &Broadcaster) -> RunReport {
        let names: Vec<&str> = self.task_names().collect();
        // Names come from the graph itself, resolution cannot fail.
        self.run(&names, ctx, events).unwrap()
    }

    /// Execute the named tasks and, transitively, their prerequisites.
    ///
    /// Resolves with a [`RunReport`] even when actions fail; only a
    /// reference to an unknown task name is an error.
    pub fn run(
        &self,
        names: &[&str],
        ctx: &TaskContext,
        events: &Broadcaster,
    ) -> Result<RunReport, ConfigError> {
        let mut requested = Vec::new();
        for name in names {
            let node = self
                .index
                .get(*name)
                .copied()
                .ok_or_else(|| ConfigError::UnknownTask(name.to_string()))?;
            requested.push(node);
        }

        // The reached set: requested nodes plus transitive prerequisites.
        let reversed = Reversed(&self.graph);
        let mut reached = HashSet::new();
        for &start in &requested {
            let mut dfs = Dfs::new(reversed, start);
            while let Some(nx) = dfs.next(reversed) {
                reached.insert(nx);
            }
        }

        let total = reached.len();
        if total == 0 {
            return Ok(RunReport::default());
        }

        let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
        for edge in self.graph.raw_edges() {
            if reached.contains(&edge.source()) && reached.contains(&edge.target()) {
                dependents
                    .entry(edge.source())
                    .or_default()
                    .push(edge.target());
            }
        }

        let mut pending: HashMap<NodeIndex, usize> = reached
            .iter()
            .map(|&node| {
                let count = self
                    .graph
                    .neighbors_directed(node, Direction::Incoming)
                    .filter(|dep| reached.contains(dep))
                    .count();
                (node, count)
            })
            .collect();

        let mp = MultiProgress::new();
        let main_pb = mp.add(ProgressBar::new(total as u64));
        main_pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .expect("invalid progress bar template")
                .progress_chars("=>-"),
        );
        main_pb.set_message("Running tasks...");

        let spinner_style = ProgressStyle::default_spinner()
            .template("{spinner:.blue} {msg}")
            .expect("invalid progress bar template");

        let mut statuses: HashMap<NodeIndex, TaskStatus> = HashMap::new();
        let mut completed = 0usize;

        let (result_tx, result_rx) = unbounded::<(NodeIndex, anyhow::Result<()>)>();

        // in_place_scope keeps the recv loop below on the calling thread;
        // a plain scope would run it on a pool worker and starve a
        // single-threaded pool.
        rayon::in_place_scope(|s| {
            let spawn_task = |node: NodeIndex| {
                let task = self.graph[node].clone();
                let sender = result_tx.clone();
                let mp = mp.clone();
                let style = spinner_style.clone();

                s.spawn(move |_| {
                    let pb = mp.add(ProgressBar::new_spinner());
                    pb.set_style(style);
                    pb.set_message(task.name().to_string());
                    pb.enable_steady_tick(Duration::from_millis(100));

                    // A panicking action must still produce a result, or
                    // the recv loop would wait on it forever.
                    let result = catch_unwind(AssertUnwindSafe(|| task.run(ctx)))
                        .unwrap_or_else(|payload| {
                            Err(anyhow::anyhow!("panicked: {}", panic_message(&*payload)))
                        });

                    pb.finish_and_clear();
                    sender.send((node, result)).unwrap();
                });
            };

            let mut ready: VecDeque<NodeIndex> = reached
                .iter()
                .copied()
                .filter(|node| pending[node] == 0)
                .collect();

            while completed < total {
                while let Some(node) = ready.pop_front() {
                    // A prerequisite that failed or was itself skipped
                    // poisons this node; surface the originating task.
                    let blocked = self
                        .graph
                        .neighbors_directed(node, Direction::Incoming)
                        .filter(|dep| reached.contains(dep))
                        .find_map(|dep| match statuses.get(&dep) {
                            Some(TaskStatus::Failed { .. }) => {
                                Some(self.graph[dep].name().to_string())
                            }
                            Some(TaskStatus::Skipped { failed }) => Some(failed.clone()),
                            _ => None,
                        });

                    match blocked {
                        Some(failed) => {
                            tracing::warn!(
                                task = %self.graph[node].name(),
                                "skipped, prerequisite '{failed}' failed"
                            );
                            statuses.insert(node, TaskStatus::Skipped { failed });
                            completed += 1;
                            main_pb.inc(1);
                            unlock_dependents(node, &dependents, &mut pending, &mut ready);
                        }
                        None => spawn_task(node),
                    }
                }

                if completed >= total {
                    break;
                }

                let (node, result) = result_rx.recv().expect("scheduler channel closed");
                let status = match result {
                    Ok(()) => {
                        if let Some(class) = self.graph[node].class {
                            events.publish(Rebuild::Class(class));
                        }
                        TaskStatus::Succeeded
                    }
                    Err(error) => {
                        let (unit, message) = match error.downcast_ref::<TransformError>() {
                            Some(err) => (err.unit.clone(), err.message.clone()),
                            None => (self.graph[node].name().to_string(), format!("{error:#}")),
                        };

                        tracing::error!(task = %self.graph[node].name(), unit = %unit, "{message}");
                        // Terminal bell, the failure should be audible.
                        eprint!("\x07");

                        TaskStatus::Failed { unit, message }
                    }
                };

                statuses.insert(node, status);
                completed += 1;
                main_pb.inc(1);
                unlock_dependents(node, &dependents, &mut pending, &mut ready);
            }
        });

        main_pb.finish_and_clear();

        // Report in dependency order for deterministic output.
        let order = toposort(&self.graph, None).expect("graph was validated acyclic");
        let outcomes = order
            .into_iter()
            .filter(|node| reached.contains(node))
            .map(|node| TaskOutcome {
                task: self.graph[node].name().to_string(),
                status: statuses.remove(&node).expect("every reached task resolved"),
            })
            .collect();

        Ok(RunReport { outcomes })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn unlock_dependents(
    node: NodeIndex,
    dependents: &HashMap<NodeIndex, Vec<NodeIndex>>,
    pending: &mut HashMap<NodeIndex, usize>,
    ready: &mut VecDeque<NodeIndex>,
) {
    let Some(next) = dependents.get(&node) else {
        return;
    };

    for &dep in next {
        if let Some(count) = pending.get_mut(&dep) {
            *count -= 1;
            if *count == 0 {
                ready.push_back(dep);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Mode;
    use crate::cache::BuildCache;
    use crate::paths::PathMap;
    use camino::Utf8Path;
    use std::sync::{Arc, Mutex};

    fn empty_context() -> TaskContext<'static> {
        // Tests only need a context outliving one run; leaking keeps the
        // signatures simple.
        TaskContext {
            mode: Mode::Build,
            reload_port: None,
            out_dir: Utf8Path::new("build"),
            paths: Box::leak(Box::new(PathMap::default())),
            cache: Box::leak(Box::new(Mutex::new(BuildCache::default()))),
        }
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> Task {
        let log = log.clone();
        Task::new(name, move |_| {
            log.lock().unwrap().push(name.to_string());
            Ok(())
        })
    }

    #[test]
    fn runs_each_task_exactly_once_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = TaskGraph::assemble(vec![
            recorder(&log, "pages"),
            recorder(&log, "cache").after(["pages"]),
            recorder(&log, "reload").after(["cache"]),
        ])
        .unwrap();

        let ctx = empty_context();
        let report = graph.run(&["reload"], &ctx, &Broadcaster::new()).unwrap();

        assert!(report.is_success());
        let log = log.lock().unwrap();
        assert_eq!(*log, vec!["pages", "cache", "reload"]);
    }

    #[test]
    fn requested_subset_only_reaches_prerequisites() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = TaskGraph::assemble(vec![
            recorder(&log, "styles"),
            recorder(&log, "scripts"),
        ])
        .unwrap();

        let ctx = empty_context();
        let report = graph.run(&["styles"], &ctx, &Broadcaster::new()).unwrap();

        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["styles"]);
    }

    #[test]
    fn failure_skips_transitive_dependents() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = TaskGraph::assemble(vec![
            Task::new("pages", |_| anyhow::bail!("template is malformed")),
            recorder(&log, "cache").after(["pages"]),
            recorder(&log, "reload").after(["cache"]),
            recorder(&log, "styles"),
        ])
        .unwrap();

        let ctx = empty_context();
        let report = graph.run_all(&ctx, &Broadcaster::new());

        assert!(matches!(
            report.status_of("pages"),
            Some(TaskStatus::Failed { .. })
        ));
        // Both dependents name the originating failure.
        assert_eq!(
            report.status_of("cache"),
            Some(&TaskStatus::Skipped {
                failed: "pages".to_string()
            })
        );
        assert_eq!(
            report.status_of("reload"),
            Some(&TaskStatus::Skipped {
                failed: "pages".to_string()
            })
        );
        // An unrelated task still runs to completion.
        assert_eq!(report.status_of("styles"), Some(&TaskStatus::Succeeded));
        assert_eq!(*log.lock().unwrap(), vec!["styles"]);
    }

    #[test]
    fn transform_unit_is_surfaced_in_failures() {
        let graph = TaskGraph::assemble(vec![Task::new("pages", |_| {
            Err(TransformError::new("pug", "unexpected token on line 3").into())
        })])
        .unwrap();

        let ctx = empty_context();
        let report = graph.run_all(&ctx, &Broadcaster::new());

        match report.status_of("pages") {
            Some(TaskStatus::Failed { unit, message }) => {
                assert_eq!(unit, "pug");
                assert!(message.contains("unexpected token"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn panicking_action_fails_without_stalling_the_run() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = TaskGraph::assemble(vec![
            Task::new("pages", |_| panic!("template engine blew up")),
            recorder(&log, "cache").after(["pages"]),
            recorder(&log, "styles"),
        ])
        .unwrap();

        let ctx = empty_context();
        let report = graph.run_all(&ctx, &Broadcaster::new());

        match report.status_of("pages") {
            Some(TaskStatus::Failed { message, .. }) => {
                assert!(message.contains("blew up"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(
            report.status_of("cache"),
            Some(&TaskStatus::Skipped {
                failed: "pages".to_string()
            })
        );
        assert_eq!(report.status_of("styles"), Some(&TaskStatus::Succeeded));
    }

    #[test]
    fn success_publishes_rebuilt_events() {
        use crate::paths::AssetClass;

        let graph = TaskGraph::assemble(vec![
            Task::new("styles", |_| Ok(())).class(AssetClass::Styles),
        ])
        .unwrap();

        let ctx = empty_context();
        let broadcaster = Broadcaster::new();
        let rx = broadcaster.subscribe();

        graph.run_all(&ctx, &broadcaster);

        assert_eq!(rx.try_recv().unwrap(), Rebuild::Class(AssetClass::Styles));
    }

    #[test]
    fn cycle_is_a_configuration_error() {
        let err = TaskGraph::assemble(vec![
            Task::new("a", |_| Ok(())).after(["b"]),
            Task::new("b", |_| Ok(())).after(["a"]),
        ])
        .unwrap_err();

        assert!(matches!(err, ConfigError::Cycle(_)));
    }

    #[test]
    fn unknown_prerequisite_is_rejected() {
        let err = TaskGraph::assemble(vec![Task::new("cache", |_| Ok(())).after(["pages"])])
            .unwrap_err();

        assert!(matches!(err, ConfigError::UnknownPrerequisite { .. }));
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let err = TaskGraph::assemble(vec![
            Task::new("styles", |_| Ok(())),
            Task::new("styles", |_| Ok(())),
        ])
        .unwrap_err();

        assert!(matches!(err, ConfigError::DuplicateTask(_)));
    }

    #[test]
    fn unknown_run_target_is_rejected() {
        let graph = TaskGraph::assemble(vec![Task::new("styles", |_| Ok(()))]).unwrap();

        let ctx = empty_context();
        let err = graph
            .run(&["fonts"], &ctx, &Broadcaster::new())
            .unwrap_err();

        assert!(matches!(err, ConfigError::UnknownTask(_)));
    }
}
