use crate::error::{ErrorKind, Result};
use crate::inner::{InnerCache, TrimReport};
use exn::ResultExt;
use mediacache_config::{CategoryConfig, Config};
use mediacache_storage::EntryKey;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Decides how many bytes of disk a category may use.
pub trait BudgetPolicy: Send + Sync {
    fn budget(&self, category: &str, config: &CategoryConfig, total: u64) -> u64;
}

/// Gives each category its configured percentage of the total budget.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShareOfTotal;

impl BudgetPolicy for ShareOfTotal {
    fn budget(&self, _category: &str, config: &CategoryConfig, total: u64) -> u64 {
        let share = u64::from(config.share.min(100));
        total / 100 * share + total % 100 * share / 100
    }
}

/// Size and budget of one category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryStats {
    pub name: String,
    pub dir: PathBuf,
    pub size: u64,
    pub max_size: u64,
    /// Entries memory currently knows to be completely downloaded. Starts at
    /// zero and fills up as entries are looked at.
    pub known_downloaded: usize,
}

/// All categories of the media cache, addressed by name.
///
/// Each category is an independent [`InnerCache`] in its own directory below
/// the configured root. Asking for a category that isn't configured logs a
/// warning and behaves like a miss.
#[derive(Clone)]
pub struct Cache {
    categories: BTreeMap<String, InnerCache>,
}

impl Cache {
    /// Open every configured category, splitting the budget by share.
    pub async fn open(config: &Config) -> Result<Self> {
        Self::open_with(config, &ShareOfTotal).await
    }

    pub async fn open_with(config: &Config, policy: &dyn BudgetPolicy) -> Result<Self> {
        config.validate().or_raise(|| ErrorKind::Config)?;
        let mut categories = BTreeMap::new();
        for (name, category) in &config.categories {
            let budget = policy.budget(name, category, config.total_budget);
            let cache = InnerCache::open(name, config.root.join(name), config.trim_settings(budget)).await?;
            categories.insert(name.clone(), cache);
        }
        tracing::info!(root = %config.root.display(), categories = categories.len(), "Opened media cache");
        Ok(Self { categories })
    }

    pub fn category(&self, name: &str) -> Option<&InnerCache> {
        let cache = self.categories.get(name);
        if cache.is_none() {
            tracing::warn!(category = name, "Unknown cache category");
        }
        cache
    }

    pub fn categories(&self) -> impl Iterator<Item = &InnerCache> {
        self.categories.values()
    }

    pub async fn get_or_null(&self, category: &str, url: &str) -> Option<PathBuf> {
        self.category(category)?.get_or_null(url).await
    }

    pub async fn get_or_create(&self, category: &str, url: &str) -> Option<PathBuf> {
        self.category(category)?.get_or_create(url).await
    }

    pub async fn get_chunk(&self, category: &str, start: u64, end: u64, url: &str) -> Option<PathBuf> {
        self.category(category)?.get_chunk(start, end, url).await
    }

    pub async fn get_or_create_chunk(&self, category: &str, start: u64, end: u64, url: &str) -> Option<PathBuf> {
        self.category(category)?.get_or_create_chunk(start, end, url).await
    }

    pub fn exists_in_memory(&self, category: &str, url: &str) -> bool {
        self.category(category).is_some_and(|cache| cache.exists_in_memory(url))
    }

    pub async fn exists_on_disk(&self, category: &str, url: &str) -> bool {
        match self.category(category) {
            Some(cache) => cache.exists_on_disk(url).await,
            None => false,
        }
    }

    /// Record that the data file at `path` is complete, and account for its
    /// size (which may start a trim).
    pub async fn mark_downloaded(&self, category: &str, path: impl AsRef<Path>) -> bool {
        let Some(cache) = self.category(category) else {
            return false;
        };
        match cache.mark_downloaded(path).await {
            Some(0) => true,
            Some(added) => {
                cache.file_was_added(added);
                true
            },
            None => false,
        }
    }

    pub async fn delete(&self, category: &str, url: &str) -> bool {
        match self.category(category) {
            Some(cache) => cache.delete(&EntryKey::from_url(url)).await,
            None => false,
        }
    }

    pub async fn delete_path(&self, category: &str, path: impl AsRef<Path>) -> bool {
        match self.category(category) {
            Some(cache) => cache.delete_path(path).await,
            None => false,
        }
    }

    /// Empty one category.
    pub async fn clear(&self, category: &str) {
        if let Some(cache) = self.category(category) {
            cache.clear_all().await;
        }
    }

    /// Empty every category.
    pub async fn clear_all(&self) {
        for cache in self.categories.values() {
            cache.clear_all().await;
        }
    }

    pub async fn manual_trim(&self, category: &str) -> Option<TrimReport> {
        Some(self.category(category)?.manual_trim().await)
    }

    /// Approximate size of a category, or `0` if there is no such category.
    pub fn size(&self, category: &str) -> u64 {
        self.category(category).map_or(0, InnerCache::size)
    }

    pub fn max_size(&self, category: &str) -> u64 {
        self.category(category).map_or(0, InnerCache::max_size)
    }

    pub fn total_size(&self) -> u64 {
        self.categories.values().map(InnerCache::size).sum()
    }

    pub fn total_max_size(&self) -> u64 {
        self.categories.values().map(InnerCache::max_size).sum()
    }

    pub fn stats(&self) -> Vec<CategoryStats> {
        self.categories
            .values()
            .map(|cache| CategoryStats {
                name: cache.name().to_string(),
                dir: cache.files_dir().to_path_buf(),
                size: cache.size(),
                max_size: cache.max_size(),
                known_downloaded: cache.known_entries().1,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config(root: &Path) -> Config {
        Config { root: root.to_path_buf(), total_budget: 1000, ..Config::default() }
    }

    #[rstest]
    #[case(1000, 70, 700)]
    #[case(1000, 0, 0)]
    #[case(99, 50, 49)]
    #[case(u64::MAX, 100, u64::MAX)]
    fn test_share_of_total(#[case] total: u64, #[case] share: u8, #[case] expected: u64) {
        assert_eq!(ShareOfTotal.budget("x", &CategoryConfig { share }, total), expected);
    }

    struct Fixed(u64);
    impl BudgetPolicy for Fixed {
        fn budget(&self, _: &str, _: &CategoryConfig, _: u64) -> u64 {
            self.0
        }
    }

    #[tokio::test]
    async fn test_open_lays_out_categories() {
        let temp = tempfile::tempdir().unwrap();
        let cache = Cache::open(&config(temp.path())).await.unwrap();
        assert_eq!(cache.max_size("images"), 700);
        assert_eq!(cache.max_size("videos"), 300);
        assert_eq!(cache.total_max_size(), 1000);
        assert!(temp.path().join("images/files").is_dir());
        assert!(temp.path().join("videos/chunks").is_dir());
        let names: Vec<_> = cache.stats().into_iter().map(|stats| stats.name).collect();
        assert_eq!(names, ["images", "videos"]);
    }

    #[tokio::test]
    async fn test_open_with_policy() {
        let temp = tempfile::tempdir().unwrap();
        let cache = Cache::open_with(&config(temp.path()), &Fixed(42)).await.unwrap();
        assert_eq!(cache.max_size("images"), 42);
        assert_eq!(cache.total_max_size(), 84);
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let mut config = config(Path::new("relative"));
        config.root = PathBuf::from("relative");
        let err = Cache::open(&config).await.err().unwrap();
        assert!(matches!(&*err, ErrorKind::Config));
    }

    #[tokio::test]
    async fn test_unknown_category_is_a_miss() {
        let temp = tempfile::tempdir().unwrap();
        let cache = Cache::open(&config(temp.path())).await.unwrap();
        assert_eq!(cache.get_or_create("music", "http://x/a.mp3").await, None);
        assert_eq!(cache.get_or_null("music", "http://x/a.mp3").await, None);
        assert_eq!(cache.get_or_create_chunk("music", 0, 1, "http://x/a.mp3").await, None);
        assert!(!cache.exists_on_disk("music", "http://x/a.mp3").await);
        assert!(!cache.exists_in_memory("music", "http://x/a.mp3"));
        assert!(!cache.mark_downloaded("music", temp.path().join("x.cache")).await);
        assert!(!cache.delete("music", "http://x/a.mp3").await);
        assert_eq!(cache.manual_trim("music").await, None);
        assert_eq!(cache.size("music"), 0);
        assert_eq!(cache.max_size("music"), 0);
    }

    #[tokio::test]
    async fn test_categories_are_separate() {
        let temp = tempfile::tempdir().unwrap();
        let cache = Cache::open(&config(temp.path())).await.unwrap();
        let url = "http://x/a.png";
        let path = cache.get_or_create("images", url).await.unwrap();
        std::fs::write(&path, vec![0u8; 10]).unwrap();
        assert!(cache.mark_downloaded("images", &path).await);
        assert!(cache.exists_on_disk("images", url).await);
        assert!(!cache.exists_on_disk("videos", url).await);
        // A path of another category isn't accepted.
        assert!(!cache.mark_downloaded("videos", &path).await);
        assert!(path.exists());
        assert_eq!(cache.size("images"), 10);
        assert_eq!(cache.total_size(), 10);
        cache.clear("images").await;
        assert_eq!(cache.total_size(), 0);
    }
}
