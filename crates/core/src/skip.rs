//! Entry filters applied by discovery before a path becomes a task.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;

/// Decides whether discovery ignores a path. Skipped directories are not
/// descended into; skipped files are never counted as discovered.
pub trait SkipPredicate: Send + Sync {
    fn should_skip(&self, path: &Path, is_dir: bool) -> bool;
}

impl<F> SkipPredicate for F
where
    F: Fn(&Path, bool) -> bool + Send + Sync,
{
    fn should_skip(&self, path: &Path, is_dir: bool) -> bool {
        self(path, is_dir)
    }
}

/// Exclude globs plus the hidden-entry rule.
#[derive(Debug, Clone)]
pub struct GlobSkipPredicate {
    excludes: GlobSet,
    include_hidden: bool,
}

impl GlobSkipPredicate {
    pub fn new(patterns: &[String], include_hidden: bool) -> Result<Self, globset::Error> {
        Ok(Self {
            excludes: build_globset(patterns)?,
            include_hidden,
        })
    }
}

impl Default for GlobSkipPredicate {
    fn default() -> Self {
        Self {
            excludes: GlobSet::empty(),
            include_hidden: false,
        }
    }
}

impl SkipPredicate for GlobSkipPredicate {
    fn should_skip(&self, path: &Path, _is_dir: bool) -> bool {
        if is_excluded(path, &self.excludes) {
            return true;
        }
        !self.include_hidden && is_hidden(path)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pat in patterns {
        builder.add(Glob::new(pat)?);
    }
    builder.build()
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

fn is_excluded(path: &Path, excludes: &GlobSet) -> bool {
    excludes.is_match(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hidden_entries_are_skipped_unless_included() {
        let skip = GlobSkipPredicate::default();
        assert!(skip.should_skip(Path::new("/data/.git"), true));
        assert!(skip.should_skip(Path::new("/data/.DS_Store"), false));
        assert!(!skip.should_skip(Path::new("/data/notes.txt"), false));

        let keep_hidden = GlobSkipPredicate::new(&[], true).unwrap();
        assert!(!keep_hidden.should_skip(Path::new("/data/.env"), false));
    }

    #[test]
    fn exclude_globs_match_full_paths() {
        let skip =
            GlobSkipPredicate::new(&["**/node_modules".into(), "**/*.tmp".into()], false).unwrap();
        assert!(skip.should_skip(Path::new("/w/app/node_modules"), true));
        assert!(skip.should_skip(Path::new("/w/scratch.tmp"), false));
        assert!(!skip.should_skip(Path::new("/w/app/main.rs"), false));
    }

    #[test]
    fn closures_are_predicates() {
        let only_dirs = |_: &Path, is_dir: bool| is_dir;
        assert!(only_dirs.should_skip(Path::new("x"), true));
        assert!(!only_dirs.should_skip(Path::new("x"), false));
    }

    #[test]
    fn bad_pattern_is_an_error() {
        assert!(GlobSkipPredicate::new(&["a[".into()], false).is_err());
    }
}
