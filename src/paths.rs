//! The table mapping semantic asset classes to filesystem globs.
//!
//! Every transform task reads one class worth of inputs and writes into the
//! class output target. Output targets must be disjoint between classes,
//! otherwise two concurrently running transforms could race on the same
//! file.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::ConfigError;

/// Semantic class of source assets handled by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AssetClass {
    Pages,
    Styles,
    Scripts,
    Images,
    Fonts,
    Html,
}

impl AssetClass {
    pub fn name(self) -> &'static str {
        match self {
            AssetClass::Pages => "pages",
            AssetClass::Styles => "styles",
            AssetClass::Scripts => "scripts",
            AssetClass::Images => "images",
            AssetClass::Fonts => "fonts",
            AssetClass::Html => "html",
        }
    }
}

impl std::fmt::Display for AssetClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
struct ClassPaths {
    sources: Vec<String>,
    /// Absent for classes that rewrite their inputs in place.
    output: Option<Utf8PathBuf>,
}

/// Input globs and output target for each asset class.
///
/// Constructed through [`PathMap::design`], which validates every glob and
/// rejects two classes claiming the same output path.
#[derive(Debug, Clone, Default)]
pub struct PathMap {
    entries: BTreeMap<AssetClass, ClassPaths>,
}

impl PathMap {
    pub fn design() -> PathMapBuilder {
        PathMapBuilder::default()
    }

    /// Output target of a class, if it has one configured.
    pub fn output(&self, class: AssetClass) -> Option<&Utf8Path> {
        self.entries.get(&class).and_then(|e| e.output.as_deref())
    }

    /// Input glob patterns of a class.
    pub fn sources(&self, class: AssetClass) -> &[String] {
        self.entries
            .get(&class)
            .map(|e| e.sources.as_slice())
            .unwrap_or(&[])
    }

    /// Expand the input globs of a class into the current set of files.
    ///
    /// An empty match is a well defined empty set, not an error.
    pub fn matches(&self, class: AssetClass) -> Result<Vec<Utf8PathBuf>, crate::BuildError> {
        let mut files = Vec::new();

        for pattern in self.sources(class) {
            for entry in glob::glob(pattern).map_err(ConfigError::GlobPattern)? {
                let path = Utf8PathBuf::try_from(entry?)?;
                if path.is_file() {
                    files.push(path);
                }
            }
        }

        files.sort();
        Ok(files)
    }
}

#[derive(Debug, Default)]
pub struct PathMapBuilder {
    entries: Vec<(AssetClass, ClassPaths)>,
}

impl PathMapBuilder {
    pub fn class(
        mut self,
        class: AssetClass,
        sources: impl IntoIterator<Item = impl Into<String>>,
        output: impl Into<Utf8PathBuf>,
    ) -> Self {
        self.entries.push((
            class,
            ClassPaths {
                sources: sources.into_iter().map(Into::into).collect(),
                output: Some(output.into()),
            },
        ));
        self
    }

    /// Register input globs for a class without an output target, for
    /// classes whose transform rewrites the matched files in place.
    pub fn inputs(
        mut self,
        class: AssetClass,
        sources: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.entries.push((
            class,
            ClassPaths {
                sources: sources.into_iter().map(Into::into).collect(),
                output: None,
            },
        ));
        self
    }

    pub fn finish(self) -> Result<PathMap, ConfigError> {
        let mut entries = BTreeMap::new();

        for (class, paths) in self.entries {
            for source in &paths.sources {
                // Compiling the pattern up front catches malformed globs at
                // configuration time.
                glob::Pattern::new(source)?;
            }

            if let Some(output) = &paths.output {
                for (other, prior) in &entries {
                    let prior: &ClassPaths = prior;
                    if prior.output.as_ref() == Some(output) {
                        return Err(ConfigError::OutputCollision {
                            first: AssetClass::name(*other),
                            second: class.name(),
                            path: output.clone(),
                        });
                    }
                }
            }

            entries.insert(class, paths);
        }

        Ok(PathMap { entries })
    }
}
