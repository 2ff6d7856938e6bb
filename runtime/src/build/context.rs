//! Build context loading (`.dockerignore`) and `COPY` semantics.

use std::path::Path;

use dockling_core::error::{DocklingError, Result};
use glob::{MatchOptions, Pattern};
use sha2::{Digest as _, Sha256};

use crate::layer::diff::{join, normalize};
use crate::layer::{Node, Snapshot};

const IGNORE_FILE: &str = ".dockerignore";

/// Files available to `COPY` during a build.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    snapshot: Snapshot,
}

impl BuildContext {
    /// Load a context directory, dropping paths matched by `.dockerignore`.
    pub fn load(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(DocklingError::not_found(
                "build context",
                dir.display().to_string(),
            ));
        }

        let captured = Snapshot::capture(dir)?;
        let rules = match std::fs::read_to_string(dir.join(IGNORE_FILE)) {
            Ok(text) => IgnoreRules::parse(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => IgnoreRules::default(),
            Err(e) => return Err(e.into()),
        };

        let mut snapshot = Snapshot::new();
        let mut ignored = 0usize;
        for (path, node) in captured.iter() {
            if rules.is_ignored(path) {
                ignored += 1;
                continue;
            }
            snapshot.insert(path, node.clone())?;
        }
        tracing::debug!(
            context = %dir.display(),
            entries = snapshot.len(),
            ignored,
            "Loaded build context"
        );
        Ok(Self { snapshot })
    }

    /// Context backed by an in-memory tree.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self { snapshot }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }
}

/// Parsed `.dockerignore` rules. The last matching rule wins.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    rules: Vec<(Pattern, bool)>,
}

impl IgnoreRules {
    pub fn parse(text: &str) -> Result<Self> {
        let mut rules = Vec::new();
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (raw, negated) = match line.strip_prefix('!') {
                Some(rest) => (rest.trim(), true),
                None => (line, false),
            };
            let normalized = normalize(raw);
            if normalized.is_empty() {
                continue;
            }
            let pattern = compile(&normalized).map_err(|e| {
                DocklingError::Other(format!("invalid {} pattern '{}': {}", IGNORE_FILE, raw, e))
            })?;
            rules.push((pattern, negated));
        }
        Ok(Self { rules })
    }

    /// Whether `path` (or one of its ancestors) is excluded.
    pub fn is_ignored(&self, path: &str) -> bool {
        let mut ignored = false;
        for (pattern, negated) in &self.rules {
            if matches_self_or_ancestor(pattern, path) {
                ignored = !negated;
            }
        }
        ignored
    }
}

fn matches_self_or_ancestor(pattern: &Pattern, path: &str) -> bool {
    let mut candidate = path;
    loop {
        if pattern.matches_with(candidate, MATCH_OPTIONS) {
            return true;
        }
        match candidate.rsplit_once('/') {
            Some((parent, _)) => candidate = parent,
            None => return false,
        }
    }
}

/// `*` and `?` stay within one path component, `**` spans components.
const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

fn compile(pattern: &str) -> std::result::Result<Pattern, glob::PatternError> {
    Pattern::new(pattern)
}

fn has_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Resolve `path` against a working directory (absolute paths win).
pub fn resolve_in(workdir: &str, path: &str) -> String {
    if path.starts_with('/') {
        normalize(path)
    } else {
        join(&normalize(workdir), path)
    }
}

/// Expand `COPY` source patterns against a source tree.
pub fn resolve_sources(source: &Snapshot, patterns: &[String]) -> Result<Vec<String>> {
    let mut paths = Vec::new();
    for pattern in patterns {
        let normalized = normalize(pattern);
        if normalized.is_empty() {
            paths.push(normalized);
            continue;
        }
        if has_glob(&normalized) {
            let matcher = compile(&normalized).map_err(|e| {
                DocklingError::Other(format!("invalid COPY pattern '{}': {}", pattern, e))
            })?;
            let before = paths.len();
            paths.extend(
                source
                    .iter()
                    .filter(|(path, _)| matcher.matches_with(path, MATCH_OPTIONS))
                    .map(|(path, _)| path.clone()),
            );
            if paths.len() == before {
                return Err(DocklingError::Other(format!(
                    "no source files were specified by '{}'",
                    pattern
                )));
            }
        } else if source.get(&normalized).is_some() {
            paths.push(normalized);
        } else {
            return Err(DocklingError::Other(format!(
                "COPY source '{}' not found",
                pattern
            )));
        }
    }
    Ok(paths)
}

/// Digest of everything the given source paths cover.
pub fn sources_digest(source: &Snapshot, paths: &[String]) -> String {
    let mut hasher = Sha256::new();
    for path in paths {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(source.digest_under(path).as_bytes());
        hasher.update([b'\n']);
    }
    hex::encode(hasher.finalize())
}

/// Copy resolved source paths into `target` at `dest` (relative to `workdir`).
///
/// Directories contribute their contents, not themselves. A destination
/// ending in `/`, an existing directory, or multiple sources make `dest`
/// a directory.
pub fn copy_into(
    target: &mut Snapshot,
    source: &Snapshot,
    paths: &[String],
    dest: &str,
    workdir: &str,
) -> Result<()> {
    let dest_abs = resolve_in(workdir, dest);
    let dest_is_dir = dest.ends_with('/')
        || dest == "."
        || paths.len() > 1
        || target.get(&dest_abs).is_some_and(Node::is_dir);

    for path in paths {
        let is_dir = path.is_empty() || source.get(path).is_some_and(Node::is_dir);
        if is_dir {
            target.mkdir_all(&dest_abs)?;
            let prefix_len = if path.is_empty() { 0 } else { path.len() + 1 };
            for (entry, node) in source.descendants(path) {
                target.insert(&join(&dest_abs, &entry[prefix_len..]), node.clone())?;
            }
            continue;
        }

        let node = source
            .get(path)
            .ok_or_else(|| DocklingError::Other(format!("COPY source '{}' not found", path)))?;
        let file_name = path.rsplit('/').next().unwrap_or(path);
        let target_path = if dest_is_dir {
            join(&dest_abs, file_name)
        } else {
            dest_abs.clone()
        };
        target.insert(&target_path, node.clone())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tree() -> Snapshot {
        let mut s = Snapshot::new();
        s.write_file("src/main.rs", "fn main() {}", 0o644).unwrap();
        s.write_file("src/lib.rs", "", 0o644).unwrap();
        s.write_file("run.sh", "#!/bin/sh", 0o755).unwrap();
        s.write_file("README.md", "docs", 0o644).unwrap();
        s
    }

    fn glob_match(pattern: &str, text: &str) -> bool {
        compile(pattern).is_ok_and(|p| p.matches_with(text, MATCH_OPTIONS))
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*.md", "README.md"));
        assert!(!glob_match("*.md", "docs/README.md"));
        assert!(glob_match("**/*.md", "docs/README.md"));
        assert!(glob_match("**/*.md", "README.md"));
        assert!(glob_match("src/?ain.rs", "src/main.rs"));
        assert!(!glob_match("src/*", "src"));
        assert!(glob_match("target", "target"));
        assert!(glob_match("src/[lm]*.rs", "src/main.rs"));
    }

    #[test]
    fn test_glob_match_stays_fast_on_stacked_wildcards() {
        let long = format!("{}b", "a/".repeat(40));
        let started = std::time::Instant::now();
        assert!(!glob_match("**/**/**/**/*a", &long));
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_patterns_are_rejected() {
        assert!(IgnoreRules::parse("[unclosed\n").is_err());
        let err = resolve_sources(&tree(), &["src/[".to_string()]).unwrap_err();
        assert!(err.to_string().contains("invalid COPY pattern"), "{}", err);
    }

    #[test]
    fn test_ignore_rules_with_negation() {
        let rules = IgnoreRules::parse("# comment\ntarget\n*.log\n!keep.log\n/secrets/\n").unwrap();
        assert!(rules.is_ignored("target"));
        assert!(rules.is_ignored("target/debug/app"));
        assert!(rules.is_ignored("build.log"));
        assert!(!rules.is_ignored("keep.log"));
        assert!(rules.is_ignored("secrets/key"));
        assert!(!rules.is_ignored("src/main.rs"));
    }

    #[test]
    fn test_load_honours_dockerignore() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(".dockerignore"), "target\n*.tmp\n").unwrap();
        std::fs::create_dir_all(tmp.path().join("target/debug")).unwrap();
        std::fs::write(tmp.path().join("target/debug/app"), "bin").unwrap();
        std::fs::write(tmp.path().join("scratch.tmp"), "x").unwrap();
        std::fs::write(tmp.path().join("app.py"), "print('hi')").unwrap();

        let ctx = BuildContext::load(tmp.path()).unwrap();
        assert!(ctx.snapshot().get("app.py").is_some());
        assert!(ctx.snapshot().get("target").is_none());
        assert!(ctx.snapshot().get("target/debug/app").is_none());
        assert!(ctx.snapshot().get("scratch.tmp").is_none());
    }

    #[test]
    fn test_load_missing_dir() {
        let err = BuildContext::load(Path::new("/nonexistent/ctx")).unwrap_err();
        assert!(matches!(err, DocklingError::NotFound { .. }));
    }

    #[test]
    fn test_copy_file_to_dir_and_rename() {
        let src = tree();
        let mut target = Snapshot::new();
        let paths = resolve_sources(&src, &["run.sh".to_string()]).unwrap();

        copy_into(&mut target, &src, &paths, "/usr/local/bin/", "/").unwrap();
        assert!(target.get("usr/local/bin/run.sh").is_some());

        copy_into(&mut target, &src, &paths, "entry.sh", "/app").unwrap();
        assert_eq!(
            target.get("app/entry.sh"),
            Some(&Node::file("#!/bin/sh", 0o755))
        );
    }

    #[test]
    fn test_copy_directory_contents_and_dot() {
        let src = tree();
        let mut target = Snapshot::new();

        let paths = resolve_sources(&src, &["src".to_string()]).unwrap();
        copy_into(&mut target, &src, &paths, "/app/src", "/").unwrap();
        assert!(target.get("app/src/main.rs").is_some());

        let mut whole = Snapshot::new();
        let paths = resolve_sources(&src, &[".".to_string()]).unwrap();
        copy_into(&mut whole, &src, &paths, ".", "/srv").unwrap();
        assert!(whole.get("srv/README.md").is_some());
        assert!(whole.get("srv/src/lib.rs").is_some());
    }

    #[test]
    fn test_copy_glob_and_missing_source() {
        let src = tree();
        let paths = resolve_sources(&src, &["src/*.rs".to_string()]).unwrap();
        assert_eq!(paths, vec!["src/lib.rs".to_string(), "src/main.rs".to_string()]);

        assert!(resolve_sources(&src, &["nope.txt".to_string()]).is_err());
        assert!(resolve_sources(&src, &["*.java".to_string()]).is_err());
    }

    #[test]
    fn test_sources_digest_changes_with_content() {
        let a = tree();
        let mut b = tree();
        let paths = vec!["src".to_string()];
        assert_eq!(sources_digest(&a, &paths), sources_digest(&b, &paths));

        b.write_file("src/main.rs", "fn main() { panic!() }", 0o644).unwrap();
        assert_ne!(sources_digest(&a, &paths), sources_digest(&b, &paths));
        let readme = vec!["README.md".to_string()];
        assert_eq!(sources_digest(&a, &readme), sources_digest(&b, &readme));
    }
}
