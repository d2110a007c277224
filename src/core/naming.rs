#![forbid(unsafe_code)]

use std::path::{Component, Path};

/// Derives a backing file name from a task title: alphanumerics, spaces, `-` and `_`
/// survive, spaces become `_`, everything is lowercased.
#[must_use]
pub fn task_file_name(title: &str) -> Option<String> {
    let kept: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    let stem = kept.trim().replace(' ', "_").to_lowercase();
    if stem.is_empty() {
        return None;
    }
    Some(format!("{stem}.md"))
}

/// Joins an optional sub-directory and a file name into an index-style relative path.
#[must_use]
pub fn join_relative(directory: Option<&str>, file_name: &str) -> String {
    match directory.map(|d| d.trim().trim_matches('/')) {
        Some(dir) if !dir.is_empty() => format!("{dir}/{file_name}"),
        _ => file_name.to_owned(),
    }
}

/// Deterministic multiplexer session name for a task. Uses the whole id so tasks
/// sharing an id prefix never share a session.
#[must_use]
pub fn session_name(prefix: &str, task_id: &str) -> String {
    sanitize_session(&format!("{prefix}_{task_id}"))
}

#[must_use]
pub fn sanitize_session(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        // tmux treats '.' and ':' as target separators.
        if c == '.' || c == ':' || c.is_whitespace() || c.is_control() {
            out.push('-');
            continue;
        }
        out.push(c);
    }
    out
}

/// True when `path` is relative and never escapes its root.
#[must_use]
pub fn is_safe_relative(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Relative path rendered with `/` separators regardless of platform.
#[must_use]
pub fn to_slash(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Rejects identifiers that could be used to build paths outside their directory.
pub fn validate_id(id: &str) -> Result<(), String> {
    if id.trim().is_empty() {
        return Err("id is required".to_owned());
    }
    if id.contains('/') || id.contains('\\') {
        return Err(format!("invalid id '{id}': must not contain path separators"));
    }
    if id.contains("..") {
        return Err(format!("invalid id '{id}': must not contain '..'"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_from_titles() {
        assert_eq!(
            task_file_name("Implement user authentication").as_deref(),
            Some("implement_user_authentication.md")
        );
        assert_eq!(
            task_file_name("Fix: crash (v2)!  ").as_deref(),
            Some("fix_crash_v2.md")
        );
        assert_eq!(task_file_name("???"), None);
        assert_eq!(join_relative(Some("backend/"), "a.md"), "backend/a.md");
        assert_eq!(join_relative(Some(""), "a.md"), "a.md");
        assert_eq!(join_relative(None, "a.md"), "a.md");
    }

    #[test]
    fn session_names_are_tmux_safe() {
        assert_eq!(
            session_name("taskhub", "3f2a9c1d-aaaa-bbbb"),
            "taskhub_3f2a9c1d-aaaa-bbbb"
        );
        assert_eq!(session_name("hub", "a.b:c"), "hub_a-b-c");
    }

    #[test]
    fn ids_sharing_a_prefix_get_distinct_sessions() {
        assert_ne!(
            session_name("taskhub", "3f2a9c1d-aaaa-0001"),
            session_name("taskhub", "3f2a9c1d-aaaa-0002")
        );
    }

    #[test]
    fn relative_paths_cannot_escape() {
        assert!(is_safe_relative("a/b.md"));
        assert!(is_safe_relative("./b.md"));
        assert!(!is_safe_relative("../b.md"));
        assert!(!is_safe_relative("/etc/passwd"));
        assert!(!is_safe_relative(""));
        assert!(validate_id("abc-123").is_ok());
        assert!(validate_id("../x").is_err());
    }
}
