use anyhow::bail;

/// A normalized, `/`-separated path inside a repository tree.
///
/// Leading, trailing and repeated separators as well as `.` segments are
/// dropped; `..` is rejected. The root directory has no segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RepoPath {
    segments: Vec<String>,
}

impl RepoPath {
    /// Parse a path naming a file; the root is not a valid file path.
    pub fn try_parse(path: &str) -> anyhow::Result<Self> {
        let parsed = Self::try_parse_dir(path)?;
        if parsed.is_root() {
            bail!("path is empty");
        }
        Ok(parsed)
    }

    /// Parse a path naming a directory; an empty path is the root.
    pub fn try_parse_dir(path: &str) -> anyhow::Result<Self> {
        let mut segments = Vec::new();
        for segment in path.split('/') {
            match segment {
                "" | "." => continue,
                ".." => bail!("path escapes the repository"),
                segment if segment.contains('\0') => bail!("path contains a NUL byte"),
                segment => segments.push(segment.to_string()),
            }
        }

        Ok(Self { segments })
    }

    pub fn root() -> Self {
        Self::default()
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Directory segments, everything but the final name.
    pub fn parent_segments(&self) -> &[String] {
        match self.segments.split_last() {
            Some((_, parents)) => parents,
            None => &[],
        }
    }

    pub fn file_name(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    pub fn join(&self, name: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Self { segments }
    }
}

impl std::fmt::Display for RepoPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn redundant_separators_are_dropped() {
        let path = RepoPath::try_parse("/docs//./guide/intro.md/").unwrap();

        assert_eq!(path.to_string(), "docs/guide/intro.md");
        assert_eq!(path.parent_segments(), ["docs", "guide"]);
        assert_eq!(path.file_name(), "intro.md");
    }

    #[test]
    fn parent_references_are_rejected() {
        assert!(RepoPath::try_parse("docs/../secret").is_err());
    }

    #[test]
    fn root_is_only_a_directory() {
        assert!(RepoPath::try_parse("/").is_err());
        assert!(RepoPath::try_parse_dir("/").unwrap().is_root());
    }

    proptest! {
        #[test]
        fn display_parses_back(segments in proptest::collection::vec("[a-z0-9_.-]{1,8}", 1..5)) {
            prop_assume!(segments.iter().all(|s| s != "." && s != ".."));
            let path = RepoPath::try_parse(&segments.join("/")).unwrap();
            prop_assert_eq!(RepoPath::try_parse(&path.to_string()).unwrap(), path);
        }
    }
}
