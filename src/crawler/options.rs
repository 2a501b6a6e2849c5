use std::path::{Path, PathBuf};

use glob::Pattern;
use walkdir::DirEntry;

/// What the crawler leaves out and whether it adds placeholder ancestors.
#[derive(Debug, Clone, Default)]
pub struct CrawlOptions {
    /// Matched against entry names, not full paths.
    pub exclude: Vec<Pattern>,
    pub include_hidden: bool,
    /// Emit every ancestor of a root as a synthetic directory node.
    pub synthesize_ancestors: bool,
    /// Absolute paths never crawled (the index's own data directory).
    pub skip_paths: Vec<PathBuf>,
}

impl CrawlOptions {
    pub fn new(patterns: &[String], include_hidden: bool) -> Result<Self, glob::PatternError> {
        let exclude = patterns
            .iter()
            .map(|p| Pattern::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            exclude,
            include_hidden,
            ..Self::default()
        })
    }

    pub fn with_synthesized_ancestors(mut self, enabled: bool) -> Self {
        self.synthesize_ancestors = enabled;
        self
    }

    /// Never descend into `path`. Resolved now so it compares against
    /// canonical crawl paths.
    pub fn skipping(mut self, path: &Path) -> Self {
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        self.skip_paths.push(path);
        self
    }

    pub(super) fn excludes(&self, entry: &DirEntry) -> bool {
        let name = entry.file_name().to_string_lossy();
        if !self.include_hidden && name.starts_with('.') {
            return true;
        }
        if self.exclude.iter().any(|p| p.matches(&name)) {
            return true;
        }
        self.skip_paths.iter().any(|p| p == entry.path())
    }
}
