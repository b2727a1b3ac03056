use regex::Regex;

use crate::{SyncError, SyncResult};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IgnoreResult {
    ignored: bool,
    deletable: bool,
}

impl IgnoreResult {
    pub const NOT_IGNORED: IgnoreResult = IgnoreResult {
        ignored: false,
        deletable: false,
    };

    pub fn new(ignored: bool, deletable: bool) -> Self {
        Self { ignored, deletable }
    }

    pub fn is_ignored(&self) -> bool {
        self.ignored
    }

    /// Ignored, but may be removed when it stands in the way of a delete.
    pub fn is_deletable(&self) -> bool {
        self.ignored && self.deletable
    }
}

pub trait IgnoreMatcher: Send + Sync {
    fn match_path(&self, name: &str) -> IgnoreResult;
}

struct IgnorePattern {
    regex: Regex,
    include: bool,
    deletable: bool,
}

/// Line based ignore patterns. First matching line wins.
///
/// - `#` starts a comment line
/// - `!` re-includes what the pattern matches
/// - `(?d)` marks matches as deletable
/// - a leading `/` anchors the pattern at the folder root, otherwise it
///   matches at any depth
/// - `**` matches across directories, `*` and `?` within one name
#[derive(Default)]
pub struct IgnorePatterns {
    patterns: Vec<IgnorePattern>,
}

impl IgnorePatterns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(content: &str) -> SyncResult<Self> {
        let mut patterns = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            patterns.push(Self::compile_line(line)?);
        }
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    fn compile_line(line: &str) -> SyncResult<IgnorePattern> {
        let mut rest = line;
        let mut include = false;
        let mut deletable = false;
        loop {
            if let Some(r) = rest.strip_prefix('!') {
                include = true;
                rest = r;
            } else if let Some(r) = rest.strip_prefix("(?d)") {
                deletable = true;
                rest = r;
            } else {
                break;
            }
        }

        let (anchored, glob) = match rest.strip_prefix('/') {
            Some(g) => (true, g),
            None => (false, rest),
        };
        let glob = glob.trim_end_matches('/');
        if glob.is_empty() {
            return Err(SyncError::InvalidData(format!(
                "empty ignore pattern: {}",
                line
            )));
        }

        let body = Self::glob_to_regex(glob);
        let prefix = if anchored { "^" } else { "^(?:.*/)?" };
        let source = format!("{}{}(?:/.*)?$", prefix, body);
        let regex = Regex::new(&source)
            .map_err(|e| SyncError::InvalidData(format!("bad ignore pattern {}: {}", line, e)))?;
        Ok(IgnorePattern {
            regex,
            include,
            deletable,
        })
    }

    fn glob_to_regex(glob: &str) -> String {
        let mut out = String::with_capacity(glob.len() * 2);
        let chars: Vec<char> = glob.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            match chars[i] {
                '*' if chars.get(i + 1) == Some(&'*') => {
                    out.push_str(".*");
                    i += 1;
                }
                '*' => out.push_str("[^/]*"),
                '?' => out.push_str("[^/]"),
                c => out.push_str(&regex::escape(&c.to_string())),
            }
            i += 1;
        }
        out
    }
}

impl IgnoreMatcher for IgnorePatterns {
    fn match_path(&self, name: &str) -> IgnoreResult {
        let name = name.trim_start_matches('/');
        for pattern in self.patterns.iter() {
            if pattern.regex.is_match(name) {
                if pattern.include {
                    return IgnoreResult::NOT_IGNORED;
                }
                return IgnoreResult::new(true, pattern.deletable);
            }
        }
        IgnoreResult::NOT_IGNORED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_rules() {
        let ignores = IgnorePatterns::parse(
            "# comment\n\
             !keep.log\n\
             *.log\n\
             (?d).DS_Store\n\
             /build\n\
             cache/**/tmp\n",
        )
        .unwrap();

        assert!(ignores.match_path("a.log").is_ignored());
        assert!(ignores.match_path("dir/a.log").is_ignored());
        assert!(!ignores.match_path("a.log").is_deletable());
        assert!(!ignores.match_path("keep.log").is_ignored());

        let ds = ignores.match_path("photos/.DS_Store");
        assert!(ds.is_ignored());
        assert!(ds.is_deletable());

        assert!(ignores.match_path("build").is_ignored());
        assert!(ignores.match_path("build/out.o").is_ignored());
        assert!(!ignores.match_path("src/build").is_ignored());

        assert!(ignores.match_path("cache/a/b/tmp").is_ignored());
        assert!(!ignores.match_path("a.txt").is_ignored());
    }

    #[test]
    fn test_empty_pattern_rejected() {
        assert!(IgnorePatterns::parse("/\n").is_err());
        assert!(IgnorePatterns::parse("").unwrap().is_empty());
    }
}
