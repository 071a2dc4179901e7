//! Config-content resolution.
//!
//! The execution plan references config files by name; the loader that knows
//! where those files live is an external collaborator. The executor only
//! needs this narrow contract: name in, text content out.

use async_trait::async_trait;
use indexmap::IndexMap;

/// Resolves named config-file references to their textual content on demand.
///
/// Used by the ConfigValues substitution pass and by the executor when it
/// materializes a step's declared config files.
#[async_trait]
pub trait ConfigResolver: Send + Sync {
    async fn content(&self, name: &str) -> anyhow::Result<String>;
}

/// In-memory resolver backed by a name → content table.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigResolver {
    files: IndexMap<String, String>,
}

impl MemoryConfigResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.insert(name.into(), content.into());
        self
    }
}

#[async_trait]
impl ConfigResolver for MemoryConfigResolver {
    async fn content(&self, name: &str) -> anyhow::Result<String> {
        self.files
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown config file '{}'", name))
    }
}

/// Resolver that reads config files relative to a base directory.
#[derive(Debug, Clone)]
pub struct DirConfigResolver {
    base: std::path::PathBuf,
}

impl DirConfigResolver {
    pub fn new(base: impl Into<std::path::PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

#[async_trait]
impl ConfigResolver for DirConfigResolver {
    async fn content(&self, name: &str) -> anyhow::Result<String> {
        let path = self.base.join(name);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {}", path.display(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_resolver_returns_content() {
        let resolver = MemoryConfigResolver::new().with_file("app.yaml", "key: value");
        assert_eq!(resolver.content("app.yaml").await.unwrap(), "key: value");
    }

    #[tokio::test]
    async fn test_memory_resolver_unknown_name_fails() {
        let resolver = MemoryConfigResolver::new();
        let err = resolver.content("missing.txt").await.unwrap_err();
        assert!(err.to_string().contains("missing.txt"));
    }

    #[tokio::test]
    async fn test_dir_resolver_reads_from_base() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cfg.ini"), "a=1").unwrap();
        let resolver = DirConfigResolver::new(dir.path());
        assert_eq!(resolver.content("cfg.ini").await.unwrap(), "a=1");
    }
}
