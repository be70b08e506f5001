//! Path admission for container-internal entries.
//!
//! Only root-level files and files exactly one directory deep are imported.
//! Anything nested deeper is skipped without being read.

/// Maximum number of cleaned path segments an entry may have.
pub const MAX_PATH_DEPTH: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Entry is importable; `leaf` is its last path segment.
    Accept { leaf: String },
    /// Nothing left after cleaning (directory marker, blank name).
    RejectEmpty,
    /// More segments than the policy allows.
    RejectTooDeep { depth: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    max_depth: usize,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            max_depth: MAX_PATH_DEPTH,
        }
    }
}

impl AdmissionPolicy {
    pub fn with_max_depth(max_depth: usize) -> Self {
        Self {
            max_depth: max_depth.max(1),
        }
    }

    /// Split on `/` or the platform separator, trim each segment, drop the
    /// empty ones, then check the remaining depth.
    pub fn admit(&self, raw_path: &str) -> Admission {
        let mut segments = clean_segments(raw_path);
        match segments.len() {
            0 => Admission::RejectEmpty,
            depth if depth > self.max_depth => Admission::RejectTooDeep { depth },
            _ => match segments.pop() {
                Some(leaf) => Admission::Accept { leaf },
                None => Admission::RejectEmpty,
            },
        }
    }
}

fn clean_segments(raw_path: &str) -> Vec<String> {
    raw_path
        .split(|c| c == '/' || c == std::path::MAIN_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_of(path: &str) -> Option<String> {
        match AdmissionPolicy::default().admit(path) {
            Admission::Accept { leaf } => Some(leaf),
            _ => None,
        }
    }

    #[test]
    fn admits_root_and_one_directory_deep() {
        assert_eq!(leaf_of("readme.txt").as_deref(), Some("readme.txt"));
        assert_eq!(leaf_of("docs/readme.txt").as_deref(), Some("readme.txt"));
        assert_eq!(leaf_of(" docs / notes.md ").as_deref(), Some("notes.md"));
    }

    #[test]
    fn empty_segments_collapse() {
        assert_eq!(leaf_of("/docs//a.txt").as_deref(), Some("a.txt"));
        assert_eq!(leaf_of("docs/a.txt/").as_deref(), Some("a.txt"));
        assert_eq!(leaf_of("//a.txt").as_deref(), Some("a.txt"));
    }

    #[test]
    fn rejects_empty_paths() {
        let policy = AdmissionPolicy::default();
        for path in ["", "   ", "/", "//", " / / "] {
            assert_eq!(policy.admit(path), Admission::RejectEmpty, "{path:?}");
        }
    }

    #[test]
    fn rejects_two_or_more_directories() {
        let policy = AdmissionPolicy::default();
        assert_eq!(
            policy.admit("a/b/c.txt"),
            Admission::RejectTooDeep { depth: 3 }
        );
        assert_eq!(
            policy.admit("a/b/c/d/e.txt"),
            Admission::RejectTooDeep { depth: 5 }
        );
    }

    #[test]
    fn depth_is_overridable() {
        let policy = AdmissionPolicy::with_max_depth(3);
        assert!(matches!(policy.admit("a/b/c.txt"), Admission::Accept { .. }));
        assert!(matches!(
            policy.admit("a/b/c/d.txt"),
            Admission::RejectTooDeep { depth: 4 }
        ));
        let floor = AdmissionPolicy::with_max_depth(0);
        assert!(matches!(floor.admit("a.txt"), Admission::Accept { .. }));
        assert!(matches!(
            floor.admit("a/b.txt"),
            Admission::RejectTooDeep { depth: 2 }
        ));
    }
}
