use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BellowsError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Error while running the task graph:\n{0}")]
    Build(#[from] BuildError),

    #[error("Error in the build cache:\n{0}")]
    Cache(#[from] CacheError),

    #[cfg(feature = "live")]
    #[error("Error while watching for file changes:\n{0}")]
    Watch(#[from] WatchError),

    #[cfg(feature = "server")]
    #[error("Error while serving the preview:\n{0}")]
    Serve(#[from] ServeError),
}

/// Errors in the pipeline declaration itself. These are never recoverable
/// and fail the entire run at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Task '{0}' is declared more than once")]
    DuplicateTask(String),

    #[error("Task '{task}' lists unknown prerequisite '{prerequisite}'")]
    UnknownPrerequisite { task: String, prerequisite: String },

    #[error("Task '{0}' is part of a prerequisite cycle")]
    Cycle(String),

    #[error("Unknown task '{0}'")]
    UnknownTask(String),

    #[error("Asset classes '{first}' and '{second}' both claim output path '{path}'")]
    OutputCollision {
        first: &'static str,
        second: &'static str,
        path: Utf8PathBuf,
    },

    #[error("Couldn't compile glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Couldn't run glob.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't decode the cache manifest.\n{0}")]
    Decode(String),

    #[error("Couldn't encode the cache manifest.\n{0}")]
    Encode(String),
}

#[cfg(feature = "live")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Notify(#[from] notify::Error),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("Watch rule references unknown task '{0}'")]
    UnknownTask(String),

    #[error("Couldn't resolve watch root for pattern '{pattern}'.\n{message}")]
    Root { pattern: String, message: String },
}

#[cfg(feature = "server")]
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("No free port in {start}..{end}")]
    NoFreePort { start: u16, end: u16 },

    #[error(transparent)]
    Bind(#[from] std::io::Error),
}
