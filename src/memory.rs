use anyhow::{Context, Result};
use std::path::PathBuf;

/// Hard cap on a stored memory entry, including the truncation marker.
const ENTRY_CAP: usize = 500;

const TRUNCATED_PREFIX: &str = "[truncated] ";

/// Normalize an entry for storage. Entries within the cap pass through
/// untouched; oversized entries are collapsed to a single line, cut at the
/// cap, and marked.
pub fn compact_entry(content: &str) -> String {
    if content.chars().count() <= ENTRY_CAP {
        return content.to_string();
    }

    let single_line = content.replace(['\n', '\r'], " ");
    let room = ENTRY_CAP - TRUNCATED_PREFIX.chars().count();
    let cut: String = single_line.chars().take(room).collect();
    format!("{TRUNCATED_PREFIX}{cut}")
}

/// Long-term memory: an append-only text file, one entry per line.
///
/// `remember` appends; `forget` rewrites the file without the matching
/// lines. Concurrent runs are not supported.
pub struct MemoryStore {
    path: PathBuf,
}

impl MemoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn remember(&self, content: &str) -> Result<()> {
        let entry = compact_entry(content);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let mut existing = std::fs::read_to_string(&self.path).unwrap_or_default();
        if !existing.is_empty() && !existing.ends_with('\n') {
            existing.push('\n');
        }
        existing.push_str(&entry);
        existing.push('\n');
        std::fs::write(&self.path, existing)
            .with_context(|| format!("writing memory file {}", self.path.display()))?;
        tracing::debug!(len = entry.len(), "memory entry stored");
        Ok(())
    }

    pub fn forget(&self, content: &str) -> Result<()> {
        let needle = content.trim();
        if needle.is_empty() {
            return Ok(());
        }
        let existing = std::fs::read_to_string(&self.path).unwrap_or_default();
        let kept: Vec<&str> = existing
            .lines()
            .filter(|line| !line.contains(needle))
            .collect();
        let mut rewritten = kept.join("\n");
        if !rewritten.is_empty() {
            rewritten.push('\n');
        }
        std::fs::write(&self.path, rewritten)
            .with_context(|| format!("rewriting memory file {}", self.path.display()))?;
        Ok(())
    }

    /// All stored entries, in insertion order.
    pub fn entries(&self) -> Vec<String> {
        std::fs::read_to_string(&self.path)
            .unwrap_or_default()
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> MemoryStore {
        MemoryStore::new(tmp.path().join("memory.txt"))
    }

    #[test]
    fn compact_entry_short_passthrough() {
        assert_eq!(compact_entry("likes rust"), "likes rust");
    }

    #[test]
    fn compact_entry_short_multiline_preserved() {
        assert_eq!(compact_entry("a\nb"), "a\nb");
    }

    #[test]
    fn compact_entry_caps_length() {
        let long = "x".repeat(2000);
        let compacted = compact_entry(&long);
        assert!(compacted.chars().count() <= 500);
        assert!(compacted.starts_with("[truncated] "));
    }

    #[test]
    fn compact_entry_oversized_is_single_line() {
        let long = "line one\n".repeat(100);
        let compacted = compact_entry(&long);
        assert!(!compacted.contains('\n'));
        assert!(compacted.chars().count() <= 500);
    }

    #[test]
    fn remember_appends_entries() {
        let tmp = TempDir::new().unwrap();
        let mem = store(&tmp);
        mem.remember("first fact").unwrap();
        mem.remember("second fact").unwrap();
        assert_eq!(mem.entries(), vec!["first fact", "second fact"]);
    }

    #[test]
    fn forget_drops_matching_lines() {
        let tmp = TempDir::new().unwrap();
        let mem = store(&tmp);
        mem.remember("keep this").unwrap();
        mem.remember("drop this one").unwrap();
        mem.remember("keep that").unwrap();
        mem.forget("drop this").unwrap();
        assert_eq!(mem.entries(), vec!["keep this", "keep that"]);
    }

    #[test]
    fn forget_empty_needle_is_noop() {
        let tmp = TempDir::new().unwrap();
        let mem = store(&tmp);
        mem.remember("something").unwrap();
        mem.forget("   ").unwrap();
        assert_eq!(mem.entries(), vec!["something"]);
    }

    #[test]
    fn forget_on_missing_file_is_ok() {
        let tmp = TempDir::new().unwrap();
        let mem = store(&tmp);
        mem.forget("anything").unwrap();
        assert!(mem.entries().is_empty());
    }
}
