use crate::clock::{Clock, SystemClock};
use crate::error::LinkError;
use crate::model::{LinkRecord, LinkSummary};
use crate::store::{KeyValueStore, StorageError};
use crate::utils::{generate_id, normalize_url, sanitize_alias};
use chrono::Duration;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub const STORAGE_KEY: &str = "url_shortener_data";
pub const RETENTION_DAYS: i64 = 3;
pub const ID_LENGTH: usize = 5;
const ID_GENERATION_ATTEMPTS: usize = 5;
const TOP_LINKS: usize = 5;

pub fn retention_window() -> Duration {
    Duration::days(RETENTION_DAYS)
}

/// Owns every short link, persisted as one JSON array under [`STORAGE_KEY`].
///
/// Each mutating call reads the whole collection, changes it and writes it
/// back. Those read-modify-write transactions are serialized by an internal
/// writer lock, so concurrent callers inside one process never lose updates.
/// Readers do not take the lock.
pub struct LinkRegistry<S, C = SystemClock> {
    store: S,
    clock: C,
    base_url: String,
    reserved_ids: Vec<String>,
    writer: Mutex<()>,
}

impl<S: KeyValueStore> LinkRegistry<S> {
    pub fn new(store: S, base_url: &str) -> Self {
        Self::with_clock(store, SystemClock, base_url)
    }
}

impl<S: KeyValueStore, C: Clock> LinkRegistry<S, C> {
    pub fn with_clock(store: S, clock: C, base_url: &str) -> Self {
        Self {
            store,
            clock,
            base_url: base_url.trim_end_matches('/').to_string(),
            reserved_ids: Vec::new(),
            writer: Mutex::new(()),
        }
    }

    /// Ids that can never be handed out, e.g. paths the host routes itself.
    pub fn reserve_ids<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.reserved_ids.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn create(
        &self,
        original_url: &str,
        custom_alias: Option<&str>,
    ) -> Result<LinkRecord, LinkError> {
        let original_url = normalize_url(original_url)?;
        let custom_name = custom_alias.map(str::trim).filter(|alias| !alias.is_empty());

        let _writer = self.begin_write();
        let mut links = self.load_for_write()?;
        let id = match custom_name {
            Some(alias) => {
                let id = sanitize_alias(alias);
                if id.is_empty() {
                    return Err(LinkError::InvalidAlias(alias.to_string()));
                }
                if self.is_taken(&links, &id) {
                    return Err(LinkError::AliasTaken(id));
                }
                id
            }
            None => self.unique_id(&links)?,
        };

        let created_at = self.clock.now();
        let link = LinkRecord {
            short_url: format!("{}/{}", self.base_url, id),
            id,
            original_url,
            clicks: 0,
            created_at,
            expires_at: created_at + retention_window(),
            custom_name: custom_name.map(str::to_string),
        };
        links.push(link.clone());
        self.save(&links)?;
        tracing::info!("Created short link {} -> {}", link.id, link.original_url);
        Ok(link)
    }

    pub fn resolve(&self, id: &str) -> Option<LinkRecord> {
        self.load().into_iter().find(|link| link.id == id)
    }

    /// Strips this registry's origin from `short_url` and resolves the remaining id.
    pub fn resolve_short_url(&self, short_url: &str) -> Option<LinkRecord> {
        self.id_from_short_url(short_url)
            .and_then(|id| self.resolve(id))
    }

    pub fn id_from_short_url<'a>(&self, short_url: &'a str) -> Option<&'a str> {
        short_url
            .strip_prefix(self.base_url.as_str())?
            .strip_prefix('/')
            .map(|id| id.trim_end_matches('/'))
            .filter(|id| !id.is_empty() && !id.contains('/'))
    }

    pub fn is_expired(&self, link: &LinkRecord) -> bool {
        link.is_expired_at(self.clock.now())
    }

    pub fn increment_clicks(&self, id: &str) -> Result<(), LinkError> {
        let _writer = self.begin_write();
        let mut links = self.load_for_write()?;
        let Some(link) = links.iter_mut().find(|link| link.id == id) else {
            tracing::debug!("Ignoring click for unknown link {}", id);
            return Ok(());
        };
        link.clicks = link.clicks.saturating_add(1);
        self.save(&links)
    }

    /// Every record in storage (insertion) order.
    pub fn list_all(&self) -> Vec<LinkRecord> {
        self.load()
    }

    /// Newest first.
    pub fn list_recent(&self, limit: usize) -> Vec<LinkRecord> {
        let mut links = self.load();
        links.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        links.truncate(limit);
        links
    }

    pub fn summary(&self) -> LinkSummary {
        let links = self.load();
        let now = self.clock.now();
        let total_clicks: u64 = links.iter().map(|link| link.clicks).sum();
        let average_clicks = if links.is_empty() {
            0.0
        } else {
            total_clicks as f64 / links.len() as f64
        };
        let mut top_links = links.clone();
        top_links.sort_by(|a, b| b.clicks.cmp(&a.clicks));
        top_links.truncate(TOP_LINKS);

        LinkSummary {
            total_links: links.len(),
            active_links: links.iter().filter(|link| !link.is_expired_at(now)).count(),
            total_clicks,
            average_clicks,
            top_links,
        }
    }

    /// Drops every expired record and returns how many went. Storage is only
    /// rewritten when something was removed.
    pub fn sweep_expired(&self) -> Result<usize, LinkError> {
        let _writer = self.begin_write();
        let mut links = self.load_for_write()?;
        let now = self.clock.now();
        let before = links.len();
        links.retain(|link| !link.is_expired_at(now));
        let removed = before - links.len();
        if removed > 0 {
            self.save(&links)?;
            tracing::info!("Removed {} expired links", removed);
        }
        Ok(removed)
    }

    /// Returns whether a record with `id` existed.
    pub fn delete_by_id(&self, id: &str) -> Result<bool, LinkError> {
        let _writer = self.begin_write();
        let mut links = self.load_for_write()?;
        let before = links.len();
        links.retain(|link| link.id != id);
        self.save(&links)?;
        Ok(links.len() < before)
    }

    fn begin_write(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_taken(&self, links: &[LinkRecord], id: &str) -> bool {
        links.iter().any(|link| link.id == id) || self.reserved_ids.iter().any(|reserved| reserved == id)
    }

    fn unique_id(&self, links: &[LinkRecord]) -> Result<String, LinkError> {
        for _ in 1..=ID_GENERATION_ATTEMPTS {
            let id = generate_id(ID_LENGTH);
            if !self.is_taken(links, &id) {
                return Ok(id);
            }
        }
        tracing::error!("Exhausted all retries of generating a unique id");
        Err(LinkError::IdSpaceExhausted(ID_GENERATION_ATTEMPTS))
    }

    // Readers see unreadable storage as empty.
    fn load(&self) -> Vec<LinkRecord> {
        self.load_for_write().unwrap_or_else(|err| {
            tracing::warn!("Error getting links from storage: {}", err);
            Vec::new()
        })
    }

    // Malformed data counts as an empty collection; a failed read aborts the transaction.
    fn load_for_write(&self) -> Result<Vec<LinkRecord>, LinkError> {
        let Some(stored) = self.store.get(STORAGE_KEY)? else {
            return Ok(Vec::new());
        };
        Ok(serde_json::from_str(&stored).unwrap_or_else(|err| {
            tracing::warn!("Discarding malformed link data: {}", err);
            Vec::new()
        }))
    }

    fn save(&self, links: &[LinkRecord]) -> Result<(), LinkError> {
        let encoded = serde_json::to_string(links).map_err(StorageError::from)?;
        self.store.set(STORAGE_KEY, &encoded).map_err(|err| {
            tracing::error!("Error saving links to storage: {}", err);
            LinkError::from(err)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use url::Url;

    const BASE_URL: &str = "https://sho.rt";

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ))
    }

    fn registry() -> (LinkRegistry<MemoryStore, Arc<ManualClock>>, Arc<ManualClock>) {
        let clock = clock();
        (
            LinkRegistry::with_clock(MemoryStore::new(), clock.clone(), BASE_URL),
            clock,
        )
    }

    #[derive(Default)]
    struct CountingStore {
        inner: MemoryStore,
        writes: AtomicUsize,
    }

    impl KeyValueStore for CountingStore {
        fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.set(key, value)
        }
    }

    #[derive(Default)]
    struct UnreadableStore {
        inner: MemoryStore,
        reads_fail: AtomicBool,
    }

    impl KeyValueStore for UnreadableStore {
        fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            if self.reads_fail.load(Ordering::SeqCst) {
                return Err(io::Error::from(io::ErrorKind::PermissionDenied).into());
            }
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
            self.inner.set(key, value)
        }
    }

    #[test]
    fn creates_links_with_fresh_counters_and_retention_window() {
        let (registry, clock) = registry();
        let link = registry.create("https://example.com/a?b=c", None).unwrap();

        assert!(Url::parse(&link.original_url).is_ok());
        assert_eq!(link.clicks, 0);
        assert_eq!(link.id.len(), ID_LENGTH);
        assert_eq!(link.short_url, format!("{BASE_URL}/{}", link.id));
        assert_eq!(link.created_at, clock.now());
        assert_eq!(link.expires_at - link.created_at, Duration::days(3));
        assert_eq!(link.custom_name, None);
    }

    #[test]
    fn normalizes_urls_without_scheme() {
        let (registry, _) = registry();
        let link = registry.create("example.com/page", None).unwrap();
        assert_eq!(link.original_url, "https://example.com/page");
    }

    #[test]
    fn rejects_invalid_urls_without_writing() {
        let store = Arc::new(CountingStore::default());
        let registry = LinkRegistry::new(store.clone(), BASE_URL);
        assert!(matches!(
            registry.create("http://", None),
            Err(LinkError::InvalidUrl(_))
        ));
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
        assert!(registry.list_all().is_empty());
    }

    #[test]
    fn resolves_created_links_by_id_and_short_url() {
        let (registry, _) = registry();
        let link = registry.create("https://example.com", None).unwrap();

        assert_eq!(registry.resolve(&link.id), Some(link.clone()));
        assert_eq!(registry.resolve_short_url(&link.short_url), Some(link.clone()));
        assert_eq!(
            registry.resolve_short_url(&format!("{}/", link.short_url)),
            Some(link)
        );
        assert_eq!(registry.resolve("missing"), None);
        assert_eq!(registry.resolve_short_url("https://elsewhere.io/abc"), None);
    }

    #[test]
    fn custom_aliases_are_sanitized_and_keep_the_typed_name() {
        let (registry, _) = registry();
        let link = registry.create("https://example.com", Some("  My Demo! ")).unwrap();
        assert_eq!(link.id, "my-demo");
        assert_eq!(link.short_url, "https://sho.rt/my-demo");
        assert_eq!(link.custom_name.as_deref(), Some("My Demo!"));
    }

    #[test]
    fn blank_alias_falls_back_to_random_id() {
        let (registry, _) = registry();
        let link = registry.create("https://example.com", Some("   ")).unwrap();
        assert_eq!(link.id.len(), ID_LENGTH);
        assert_eq!(link.custom_name, None);
    }

    #[test]
    fn alias_without_usable_characters_is_rejected() {
        let (registry, _) = registry();
        assert!(matches!(
            registry.create("https://example.com", Some("!!!")),
            Err(LinkError::InvalidAlias(alias)) if alias == "!!!"
        ));
    }

    #[test]
    fn duplicate_alias_is_rejected_and_first_record_kept() {
        let (registry, _) = registry();
        let first = registry.create("https://example.com/one", Some("demo")).unwrap();

        let second = registry.create("https://example.com/two", Some("demo"));
        assert!(matches!(second, Err(LinkError::AliasTaken(id)) if id == "demo"));
        assert_eq!(registry.list_all(), vec![first]);
    }

    #[test]
    fn reserved_ids_count_as_taken() {
        let registry = LinkRegistry::new(MemoryStore::new(), BASE_URL).reserve_ids(["links"]);
        assert!(matches!(
            registry.create("https://example.com", Some("Links")),
            Err(LinkError::AliasTaken(_))
        ));
    }

    #[test]
    fn counts_clicks_and_ignores_unknown_ids() {
        let (registry, _) = registry();
        let link = registry.create("https://example.com", None).unwrap();
        for _ in 0..4 {
            registry.increment_clicks(&link.id).unwrap();
        }
        registry.increment_clicks("missing").unwrap();

        assert_eq!(registry.resolve(&link.id).unwrap().clicks, 4);
        assert_eq!(registry.list_all().len(), 1);
    }

    #[test]
    fn concurrent_clicks_are_not_lost() {
        let (registry, _) = registry();
        let link = registry.create("https://example.com", None).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..25 {
                        registry.increment_clicks(&link.id).unwrap();
                    }
                });
            }
        });

        assert_eq!(registry.resolve(&link.id).unwrap().clicks, 200);
    }

    #[test]
    fn expiry_is_measured_against_the_clock() {
        let (registry, clock) = registry();
        let link = registry.create("https://example.com", None).unwrap();

        clock.advance(Duration::days(3));
        assert!(!registry.is_expired(&link));
        clock.advance(Duration::milliseconds(1));
        assert!(registry.is_expired(&link));
    }

    #[test]
    fn sweep_removes_exactly_the_expired_links() {
        let (registry, clock) = registry();
        let old = registry.create("https://example.com/old", None).unwrap();
        clock.advance(Duration::days(2));
        let young = registry.create("https://example.com/young", None).unwrap();
        clock.advance(Duration::days(1) + Duration::seconds(1));

        assert_eq!(registry.sweep_expired().unwrap(), 1);
        assert_eq!(registry.resolve(&old.id), None);
        assert_eq!(registry.list_all(), vec![young]);
        assert_eq!(registry.sweep_expired().unwrap(), 0);
    }

    #[test]
    fn sweep_only_writes_when_something_expired() {
        let store = Arc::new(CountingStore::default());
        let clock = clock();
        let registry = LinkRegistry::with_clock(store.clone(), clock.clone(), BASE_URL);
        registry.create("https://example.com", None).unwrap();
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);

        registry.sweep_expired().unwrap();
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);

        clock.advance(Duration::days(4));
        registry.sweep_expired().unwrap();
        assert_eq!(store.writes.load(Ordering::SeqCst), 2);
        assert!(registry.list_all().is_empty());
    }

    #[test]
    fn list_keeps_insertion_order_after_deletes() {
        let (registry, clock) = registry();
        let ids: Vec<String> = (0..5)
            .map(|n| {
                clock.advance(Duration::minutes(1));
                registry
                    .create(&format!("https://example.com/{n}"), None)
                    .unwrap()
                    .id
            })
            .collect();

        assert!(registry.delete_by_id(&ids[1]).unwrap());
        assert!(registry.delete_by_id(&ids[3]).unwrap());
        assert!(!registry.delete_by_id("missing").unwrap());

        let remaining: Vec<String> = registry.list_all().into_iter().map(|link| link.id).collect();
        assert_eq!(remaining, vec![ids[0].clone(), ids[2].clone(), ids[4].clone()]);
    }

    #[test]
    fn recent_links_are_newest_first() {
        let (registry, clock) = registry();
        let first = registry.create("https://example.com/1", Some("first")).unwrap();
        clock.advance(Duration::hours(1));
        let second = registry.create("https://example.com/2", Some("second")).unwrap();
        clock.advance(Duration::hours(1));
        let third = registry.create("https://example.com/3", Some("third")).unwrap();

        assert_eq!(registry.list_recent(2), vec![third.clone(), second.clone()]);
        assert_eq!(registry.list_recent(10), vec![third, second, first]);
    }

    #[test]
    fn summary_aggregates_clicks_and_activity() {
        let (registry, clock) = registry();
        assert_eq!(registry.summary().average_clicks, 0.0);

        let stale = registry.create("https://example.com/stale", Some("stale")).unwrap();
        clock.advance(Duration::days(2));
        let busy = registry.create("https://example.com/busy", Some("busy")).unwrap();
        for _ in 0..3 {
            registry.increment_clicks(&busy.id).unwrap();
        }
        registry.increment_clicks(&stale.id).unwrap();
        clock.advance(Duration::days(2));

        let summary = registry.summary();
        assert_eq!(summary.total_links, 2);
        assert_eq!(summary.active_links, 1);
        assert_eq!(summary.total_clicks, 4);
        assert_eq!(summary.average_clicks, 2.0);
        let top: Vec<&str> = summary.top_links.iter().map(|link| link.id.as_str()).collect();
        assert_eq!(top, vec!["busy", "stale"]);
    }

    #[test]
    fn malformed_storage_reads_as_empty_and_heals_on_write() {
        let store = Arc::new(MemoryStore::new());
        store.set(STORAGE_KEY, "{not json").unwrap();
        let registry = LinkRegistry::new(store.clone(), BASE_URL);

        assert!(registry.list_all().is_empty());
        assert_eq!(registry.resolve("anything"), None);

        let link = registry.create("https://example.com", None).unwrap();
        let stored: Vec<LinkRecord> =
            serde_json::from_str(&store.get(STORAGE_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(stored, vec![link]);
    }

    #[test]
    fn failed_writes_surface_as_persistence_errors_and_leave_state_alone() {
        let store = Arc::new(MemoryStore::with_quota(400));
        let registry = LinkRegistry::new(store.clone(), BASE_URL);
        let first = registry.create("https://example.com", None).unwrap();

        let err = registry
            .create(&format!("https://example.com/{}", "x".repeat(400)), None)
            .unwrap_err();
        assert!(matches!(
            err,
            LinkError::Persistence(StorageError::QuotaExceeded { .. })
        ));
        assert_eq!(registry.list_all(), vec![first]);
    }

    #[test]
    fn failed_reads_abort_writes_instead_of_overwriting_links() {
        let store = Arc::new(UnreadableStore::default());
        let clock = clock();
        let registry = LinkRegistry::with_clock(store.clone(), clock.clone(), BASE_URL);
        let kept: Vec<LinkRecord> = (0..3)
            .map(|n| registry.create(&format!("https://example.com/{n}"), None).unwrap())
            .collect();

        store.reads_fail.store(true, Ordering::SeqCst);
        assert!(registry.list_all().is_empty());
        assert!(matches!(
            registry.create("https://example.com/new", None),
            Err(LinkError::Persistence(StorageError::Io(_)))
        ));
        assert!(registry.increment_clicks(&kept[0].id).is_err());
        assert!(registry.delete_by_id(&kept[1].id).is_err());
        clock.advance(Duration::days(4));
        assert!(registry.sweep_expired().is_err());

        store.reads_fail.store(false, Ordering::SeqCst);
        assert_eq!(registry.list_all(), kept);
    }
}
