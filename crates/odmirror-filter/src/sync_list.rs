//! Selective-sync inclusion list.
//!
//! When a sync list is configured, only matching paths synchronise.
//! Rule syntax, one rule per entry:
//!
//! - `/Documents/Work`   — anchored: the subtree under that exact path;
//! - `Music`             — anywhere: a segment sequence matching at any
//!   depth (`/Music`, `/Media/Music`, ...);
//! - `!/Documents/Junk`  — negated: matching paths are excluded even when
//!   a broader rule includes them;
//! - glob characters (`*`, `?`, `[...]`) are allowed per segment.
//!
//! Rules are evaluated in order; the first matching rule decides. A path
//! matching no rule is excluded, but a directory that is an ancestor of an
//! anchored rule — or any directory at all while an anywhere rule exists —
//! reports [`SyncListDecision::DescendOnly`]: the scanner must still walk
//! it because an included subtree may start below.

use glob::{MatchOptions, Pattern};

/// Outcome of evaluating one path against the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncListDecision {
    /// The path synchronises.
    Include,
    /// The path does not synchronise and nothing below it can.
    Exclude,
    /// The path itself does not synchronise, but the scanner must descend
    /// because a rule could match a descendant.
    DescendOnly,
}

#[derive(Debug)]
struct SyncRule {
    negated: bool,
    anchored: bool,
    segments: Vec<Pattern>,
}

/// Compiled sync list.
#[derive(Debug, Default)]
pub struct SyncList {
    rules: Vec<SyncRule>,
    has_anywhere_include: bool,
}

fn match_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

fn split_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

impl SyncList {
    /// Compiles the configured entries. Blank lines and `#` comments are
    /// ignored.
    pub fn compile(entries: &[String]) -> Result<Self, String> {
        let mut rules = Vec::new();
        let mut has_anywhere_include = false;

        for raw in entries {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (negated, rest) = match line.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, line),
            };
            let anchored = rest.starts_with('/');
            let body = rest.trim_start_matches('/').trim_end_matches('/');
            if body.is_empty() {
                continue;
            }

            let segments = split_segments(body)
                .into_iter()
                .map(|s| Pattern::new(s).map_err(|e| format!("bad sync_list entry '{raw}': {e}")))
                .collect::<Result<Vec<_>, _>>()?;

            if !negated && !anchored {
                has_anywhere_include = true;
            }

            rules.push(SyncRule {
                negated,
                anchored,
                segments,
            });
        }

        Ok(Self {
            rules,
            has_anywhere_include,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluates a drive-relative path (`/A/B/c.txt`).
    pub fn evaluate(&self, path: &str, is_dir: bool) -> SyncListDecision {
        let segments = split_segments(path);

        for rule in &self.rules {
            if rule.matches(&segments) {
                return if rule.negated {
                    SyncListDecision::Exclude
                } else {
                    SyncListDecision::Include
                };
            }
        }

        if is_dir && self.could_match_descendant(&segments) {
            SyncListDecision::DescendOnly
        } else {
            SyncListDecision::Exclude
        }
    }

    /// Whether some rule could still match below a directory whose path
    /// segments are given. True for any directory while an anywhere
    /// inclusion exists, or when the directory is a proper ancestor of an
    /// anchored inclusion.
    fn could_match_descendant(&self, dir_segments: &[&str]) -> bool {
        if self.has_anywhere_include {
            return true;
        }
        let options = match_options();
        self.rules.iter().any(|rule| {
            !rule.negated
                && rule.anchored
                && rule.segments.len() > dir_segments.len()
                && rule
                    .segments
                    .iter()
                    .zip(dir_segments.iter())
                    .all(|(p, s)| p.matches_with(s, options))
        })
    }
}

impl SyncRule {
    /// A rule matches a path when the rule's segment sequence aligns with
    /// the path segments — from the root for anchored rules, from any
    /// depth for anywhere rules — and the path lies at or below the
    /// matched position.
    fn matches(&self, path_segments: &[&str]) -> bool {
        let options = match_options();
        let n = self.segments.len();
        if path_segments.len() < n {
            return false;
        }

        let starts: Vec<usize> = if self.anchored {
            vec![0]
        } else {
            (0..=path_segments.len() - n).collect()
        };

        starts.into_iter().any(|start| {
            self.segments
                .iter()
                .zip(path_segments[start..].iter())
                .all(|(p, s)| p.matches_with(s, options))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(entries: &[&str]) -> SyncList {
        SyncList::compile(&entries.iter().map(|s| s.to_string()).collect::<Vec<_>>()).unwrap()
    }

    #[test]
    fn test_anchored_include() {
        let l = list(&["/Documents/Work"]);
        assert_eq!(l.evaluate("/Documents/Work", true), SyncListDecision::Include);
        assert_eq!(
            l.evaluate("/Documents/Work/q1/report.txt", false),
            SyncListDecision::Include
        );
        assert_eq!(
            l.evaluate("/Documents/Personal", true),
            SyncListDecision::Exclude
        );
    }

    #[test]
    fn test_ancestor_of_anchored_rule_descends() {
        let l = list(&["/Documents/Work"]);
        assert_eq!(l.evaluate("/Documents", true), SyncListDecision::DescendOnly);
        // Files never get DescendOnly.
        assert_eq!(l.evaluate("/Documents", false), SyncListDecision::Exclude);
    }

    #[test]
    fn test_anywhere_rule_forces_descent_everywhere() {
        let l = list(&["Music"]);
        assert_eq!(l.evaluate("/Media/Music", true), SyncListDecision::Include);
        assert_eq!(
            l.evaluate("/Media/Music/album/track.mp3", false),
            SyncListDecision::Include
        );
        // Any directory might contain a Music subtree.
        assert_eq!(l.evaluate("/Backups", true), SyncListDecision::DescendOnly);
        assert_eq!(
            l.evaluate("/Backups/readme.txt", false),
            SyncListDecision::Exclude
        );
    }

    #[test]
    fn test_negated_rule_wins_in_order() {
        let l = list(&["!/Documents/Work/scratch", "/Documents/Work"]);
        assert_eq!(
            l.evaluate("/Documents/Work/scratch", true),
            SyncListDecision::Exclude
        );
        assert_eq!(
            l.evaluate("/Documents/Work/report.txt", false),
            SyncListDecision::Include
        );
    }

    #[test]
    fn test_globs_per_segment() {
        let l = list(&["/Projects/*/src"]);
        assert_eq!(
            l.evaluate("/Projects/web/src/main.rs", false),
            SyncListDecision::Include
        );
        assert_eq!(
            l.evaluate("/Projects/web/docs", true),
            SyncListDecision::Exclude
        );
        assert_eq!(l.evaluate("/Projects/web", true), SyncListDecision::DescendOnly);
    }

    #[test]
    fn test_comments_and_blanks_ignored() {
        let l = list(&["# media", "", "Music"]);
        assert!(!l.is_empty());
        assert_eq!(l.evaluate("/Music", true), SyncListDecision::Include);
    }

    #[test]
    fn test_empty_list() {
        let l = list(&[]);
        assert!(l.is_empty());
    }
}
