//! `.dockerignore`-style exclude-pattern matching: glob segments with `*`,
//! `**`, and leading `!` negation, evaluated against a path relative to the
//! context root.

#[derive(Debug, Clone)]
struct Pattern {
    negate: bool,
    segments: Vec<String>,
    anchored: bool,
}

/// The combined set of explicit excludes and a parsed `.dockerignore`,
/// evaluated in file order so later patterns (including negations) win.
#[derive(Debug, Clone, Default)]
pub struct ExcludeFilter {
    patterns: Vec<Pattern>,
}

impl ExcludeFilter {
    #[must_use]
    pub fn new(explicit_excludes: &[String], dockerignore: Option<&str>) -> Self {
        let mut patterns: Vec<Pattern> = explicit_excludes.iter().map(|p| parse_pattern(p)).collect();
        if let Some(text) = dockerignore {
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                patterns.push(parse_pattern(line));
            }
        }
        Self { patterns }
    }

    /// Whether `relative_path` (slash-separated, relative to the context
    /// root) should be excluded from the build context.
    #[must_use]
    pub fn is_excluded(&self, relative_path: &str) -> bool {
        let path_segments: Vec<&str> = relative_path.split('/').filter(|s| !s.is_empty()).collect();
        let mut excluded = false;
        for pattern in &self.patterns {
            if matches(pattern, &path_segments) {
                excluded = !pattern.negate;
            }
        }
        excluded
    }
}

fn parse_pattern(raw: &str) -> Pattern {
    let (negate, rest) = match raw.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let anchored = rest.starts_with('/');
    let trimmed = rest.trim_start_matches('/');
    let segments = trimmed.split('/').map(str::to_owned).collect();
    Pattern { negate, segments, anchored }
}

fn matches(pattern: &Pattern, path_segments: &[&str]) -> bool {
    if pattern.anchored {
        return match_segments(&pattern.segments, path_segments);
    }
    // Unanchored patterns may match starting at any suffix of the path.
    (0..=path_segments.len()).any(|start| match_segments(&pattern.segments, &path_segments[start..]))
}

fn match_segments(pattern: &[String], path: &[&str]) -> bool {
    match (pattern.first(), path.first()) {
        (None, None) => true,
        (None, Some(_)) => false,
        (Some(p), _) if p == "**" => {
            if pattern.len() == 1 {
                return true;
            }
            (0..=path.len()).any(|skip| match_segments(&pattern[1..], &path[skip..]))
        }
        (Some(_), None) => false,
        (Some(p), Some(seg)) => glob_segment_matches(p, seg) && match_segments(&pattern[1..], &path[1..]),
    }
}

fn glob_segment_matches(glob: &str, segment: &str) -> bool {
    fn go(g: &[u8], s: &[u8]) -> bool {
        if g.is_empty() {
            return s.is_empty();
        }
        if g[0] == b'*' {
            return go(&g[1..], s) || (!s.is_empty() && go(g, &s[1..]));
        }
        if g[0] == b'?' {
            return !s.is_empty() && go(&g[1..], &s[1..]);
        }
        !s.is_empty() && g[0] == s[0] && go(&g[1..], &s[1..])
    }
    go(glob.as_bytes(), segment.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_file_exclude() {
        let f = ExcludeFilter::new(&["target".to_owned()], None);
        assert!(f.is_excluded("target"));
        assert!(f.is_excluded("nested/target"));
        assert!(!f.is_excluded("targetfile"));
    }

    #[test]
    fn wildcard_extension_exclude() {
        let f = ExcludeFilter::new(&["*.log".to_owned()], None);
        assert!(f.is_excluded("build.log"));
        assert!(f.is_excluded("logs/build.log"));
        assert!(!f.is_excluded("build.logx"));
    }

    #[test]
    fn double_star_matches_any_depth() {
        let f = ExcludeFilter::new(&["**/node_modules".to_owned()], None);
        assert!(f.is_excluded("node_modules"));
        assert!(f.is_excluded("a/b/node_modules"));
    }

    #[test]
    fn negation_overrides_earlier_exclude() {
        let f = ExcludeFilter::new(&["*.md".to_owned(), "!README.md".to_owned()], None);
        assert!(f.is_excluded("CHANGELOG.md"));
        assert!(!f.is_excluded("README.md"));
    }

    #[test]
    fn dockerignore_comments_and_blanks_are_skipped() {
        let f = ExcludeFilter::new(&[], Some("# comment\n\n*.tmp\n"));
        assert!(f.is_excluded("scratch.tmp"));
        assert!(!f.is_excluded("keep.txt"));
    }
}
