//! Path globbing and tool-name patterns
//!
//! Path patterns operate on `/`-separated segments: `*` matches exactly one
//! segment, `**` matches zero or more segments, everything else matches
//! literally. Tool patterns are single strings where a trailing `*` matches
//! any suffix.

/// Per-segment specificity weights. A literal segment always outweighs any
/// number of wildcard segments at the same depth.
const WEIGHT_LITERAL: u32 = 10;
const WEIGHT_STAR: u32 = 1;
const WEIGHT_DOUBLE_STAR: u32 = 0;

/// Match a segment glob against a path
pub fn glob_match(pattern: &str, path: &str) -> bool {
    let pat: Vec<&str> = pattern.split('/').collect();
    let segments: Vec<&str> = path.split('/').collect();
    match_segments(&pat, &segments)
}

fn match_segments(pat: &[&str], path: &[&str]) -> bool {
    match pat.first() {
        None => path.is_empty(),
        Some(&"**") => (0..=path.len()).any(|skip| match_segments(&pat[1..], &path[skip..])),
        Some(&"*") => !path.is_empty() && match_segments(&pat[1..], &path[1..]),
        Some(literal) => path.first() == Some(literal) && match_segments(&pat[1..], &path[1..]),
    }
}

/// Deterministic scalar ordering globs by how narrowly they match.
/// Summed per segment: literal 10, `*` 1, `**` 0.
pub fn glob_specificity(pattern: &str) -> u32 {
    pattern
        .split('/')
        .map(|segment| match segment {
            "**" => WEIGHT_DOUBLE_STAR,
            "*" => WEIGHT_STAR,
            _ => WEIGHT_LITERAL,
        })
        .sum()
}

/// Match a tool-name pattern. `*` alone matches everything; a trailing `*`
/// matches any suffix; anything else is a literal comparison.
pub fn tool_pattern_match(pattern: &str, tool_name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => tool_name.starts_with(prefix),
        None => pattern == tool_name,
    }
}

/// True when any pattern in the list matches
pub fn any_tool_pattern_match(patterns: &[String], tool_name: &str) -> bool {
    patterns.iter().any(|p| tool_pattern_match(p, tool_name))
}

/// Tool specificity of a rule: the count of fully-literal patterns
pub fn tool_specificity(patterns: &[String]) -> u32 {
    patterns.iter().filter(|p| !p.contains('*')).count() as u32
}
