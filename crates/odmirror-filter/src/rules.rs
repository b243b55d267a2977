//! Configured skip rules: `skip_dir`, `skip_file`, dotfiles, size limit.
//!
//! Glob patterns are compiled once at pipeline construction. A directory
//! pattern matches either the entry name, the whole drive-relative path,
//! or the path with its leading `/` stripped, so users can write both
//! `node_modules` and `/Projects/node_modules`.

use glob::{MatchOptions, Pattern};

/// Compiled skip rules.
#[derive(Debug)]
pub struct SkipRules {
    dir_patterns: Vec<Pattern>,
    file_patterns: Vec<Pattern>,
    pub skip_dotfiles: bool,
    pub skip_symlinks: bool,
    /// Bytes; files strictly larger are excluded.
    pub skip_size: Option<u64>,
    pub check_nosync: bool,
}

fn match_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    }
}

impl SkipRules {
    pub fn compile(
        skip_dir: &[String],
        skip_file: &[String],
        skip_dotfiles: bool,
        skip_symlinks: bool,
        skip_size: Option<u64>,
        check_nosync: bool,
    ) -> Result<Self, String> {
        let compile_all = |sources: &[String]| -> Result<Vec<Pattern>, String> {
            sources
                .iter()
                .map(|s| {
                    Pattern::new(s.trim_start_matches('/'))
                        .map_err(|e| format!("bad pattern '{s}': {e}"))
                })
                .collect()
        };

        Ok(Self {
            dir_patterns: compile_all(skip_dir)?,
            file_patterns: compile_all(skip_file)?,
            skip_dotfiles,
            skip_symlinks,
            skip_size,
            check_nosync,
        })
    }

    /// Whether a directory at `path` (drive-relative, `/`-prefixed) is
    /// excluded. Returns the matching pattern for diagnostics.
    pub fn dir_excluded(&self, path: &str) -> Option<String> {
        Self::match_any(&self.dir_patterns, path)
    }

    /// Whether a file at `path` is excluded by name pattern.
    pub fn file_excluded(&self, path: &str) -> Option<String> {
        Self::match_any(&self.file_patterns, path)
    }

    fn match_any(patterns: &[Pattern], path: &str) -> Option<String> {
        let relative = path.trim_start_matches('/');
        let name = relative.rsplit('/').next().unwrap_or(relative);
        let options = match_options();

        for pattern in patterns {
            if pattern.matches_with(name, options) || pattern.matches_with(relative, options) {
                return Some(pattern.as_str().to_string());
            }
        }
        None
    }

    /// Leading-dot check on the entry name.
    pub fn is_dotfile(path: &str) -> bool {
        path.trim_start_matches('/')
            .rsplit('/')
            .next()
            .map(|name| name.starts_with('.'))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(dirs: &[&str], files: &[&str]) -> SkipRules {
        SkipRules::compile(
            &dirs.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            &files.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            false,
            false,
            None,
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_dir_pattern_matches_name_anywhere() {
        let r = rules(&["node_modules"], &[]);
        assert!(r.dir_excluded("/node_modules").is_some());
        assert!(r.dir_excluded("/Projects/web/node_modules").is_some());
        assert!(r.dir_excluded("/Projects/web/src").is_none());
    }

    #[test]
    fn test_dir_pattern_with_root_anchor() {
        let r = rules(&["/Archive/Old*"], &[]);
        assert!(r.dir_excluded("/Archive/Old-2019").is_some());
        // The anchored pattern also matches by full relative path only.
        assert!(r.dir_excluded("/Other/Archive").is_none());
    }

    #[test]
    fn test_file_patterns() {
        let r = rules(&[], &["*.tmp", "~*"]);
        assert!(r.file_excluded("/A/job.tmp").is_some());
        assert!(r.file_excluded("/A/~lock").is_some());
        assert!(r.file_excluded("/A/report.txt").is_none());
    }

    #[test]
    fn test_bad_pattern_is_an_error() {
        let result = SkipRules::compile(
            &["[".to_string()],
            &[],
            false,
            false,
            None,
            false,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_dotfile_detection() {
        assert!(SkipRules::is_dotfile("/A/.hidden"));
        assert!(SkipRules::is_dotfile("/.config"));
        assert!(!SkipRules::is_dotfile("/A/visible"));
        assert!(!SkipRules::is_dotfile("/A/not.hidden"));
    }
}
