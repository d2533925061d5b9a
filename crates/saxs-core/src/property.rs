//! Per-instrument property cache with staleness and health categories.
//!
//! Each instrument registers a static table of [`PropertySpec`]s at
//! construction time: name, declared type, categorizer, refresh interval and
//! staleness timeout. The generic [`PropertyCache`] consults that table.
//!
//! # Reads
//!
//! [`PropertyCache::get`] returns the cached `(value, category)` immediately
//! when the entry is younger than its staleness timeout. Otherwise it forces a
//! refresh through the bound [`Refresh`] implementation, bounded by the same
//! timeout. A failed or timed-out refresh stores `(None, Unknown)`; `get`
//! itself never returns an error.
//!
//! # Writes
//!
//! [`PropertyCache::update`] compares against the stored pair. An unchanged
//! pair only advances the timestamp. A change posts, in order,
//! `PropertyChanged` and then `PropertyError` or `PropertyWarning` if the new
//! category asks for it. The map lock is released before anything is posted;
//! a separate publish lock spans the store and the posts, so notifications
//! for a property reach the run loop in the order its changes were stored.
//!
//! # Polling
//!
//! [`PropertyCache::spawn_poller`] refreshes every property whose refresh
//! interval has elapsed. The interval is advisory; the staleness timeout is the
//! hard bound enforced by `get`.

use crate::error::CoreResult;
use crate::notify::{Event, Notifier};
use crate::value::{Category, Value};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Staleness timeout for properties created without a registered spec.
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(1);

/// Smallest staleness timeout accepted; also bounds a forced refresh.
const MIN_STALENESS: Duration = Duration::from_millis(10);

// =============================================================================
// Declarations
// =============================================================================

/// Declared type of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Accept any value (lazily created properties).
    Any,
    /// `Value::Bool`
    Bool,
    /// `Value::Int`
    Int,
    /// `Value::Float`; integers are widened.
    Float,
    /// `Value::Text`
    Text,
    /// `Value::Timestamp`
    Timestamp,
    /// `Value::List`
    List,
}

impl ValueKind {
    /// Convert `value` to this kind, or `None` if it does not fit.
    pub fn coerce(self, value: Value) -> Option<Value> {
        match (self, value) {
            (ValueKind::Any, v) => Some(v),
            (ValueKind::Bool, v @ Value::Bool(_)) => Some(v),
            (ValueKind::Int, v @ Value::Int(_)) => Some(v),
            (ValueKind::Float, v @ Value::Float(_)) => Some(v),
            (ValueKind::Float, Value::Int(i)) => Some(Value::Float(i as f64)),
            (ValueKind::Text, v @ Value::Text(_)) => Some(v),
            (ValueKind::Timestamp, v @ Value::Timestamp(_)) => Some(v),
            (ValueKind::List, v @ Value::List(_)) => Some(v),
            _ => None,
        }
    }
}

/// Maps a raw value to its health category.
pub type Categorizer = Arc<dyn Fn(&Value) -> Category + Send + Sync>;

/// Static description of one cached property.
#[derive(Clone)]
pub struct PropertySpec {
    name: String,
    kind: ValueKind,
    refresh_interval: Option<Duration>,
    staleness_timeout: Duration,
    categorizer: Option<Categorizer>,
}

impl fmt::Debug for PropertySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertySpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("refresh_interval", &self.refresh_interval)
            .field("staleness_timeout", &self.staleness_timeout)
            .field("categorizer", &self.categorizer.is_some())
            .finish()
    }
}

impl PropertySpec {
    /// New spec with the default staleness timeout and no background refresh.
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            refresh_interval: None,
            staleness_timeout: DEFAULT_STALENESS,
            categorizer: None,
        }
    }

    /// Ask the poller to refresh this property every `interval`.
    pub fn refresh_every(mut self, interval: Duration) -> Self {
        self.refresh_interval = Some(interval);
        self
    }

    /// Force a refresh on `get` once the entry is older than `timeout`.
    pub fn stale_after(mut self, timeout: Duration) -> Self {
        self.staleness_timeout = timeout.max(MIN_STALENESS);
        self
    }

    /// Install a categorizer. Without one, booleans map to `Yes`/`No` and
    /// everything else to `Normal`.
    pub fn categorize_with<F>(mut self, categorizer: F) -> Self
    where
        F: Fn(&Value) -> Category + Send + Sync + 'static,
    {
        self.categorizer = Some(Arc::new(categorizer));
        self
    }

    /// Property name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared type.
    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Advisory background refresh interval.
    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh_interval
    }

    /// Hard bound past which `get` refreshes.
    pub fn staleness_timeout(&self) -> Duration {
        self.staleness_timeout
    }

    /// Category for `value` under this spec.
    pub fn categorize(&self, value: &Value) -> Category {
        match &self.categorizer {
            Some(categorizer) => categorizer(value),
            None => Category::default_for(value),
        }
    }
}

// =============================================================================
// Refresh
// =============================================================================

/// Fetches a fresh value for a property from the instrument.
///
/// Implemented by device drivers. Implementations may call
/// [`PropertyCache::update`] for sibling properties decoded from the same
/// reply; the value returned is stored for `name` by the cache.
#[async_trait]
pub trait Refresh: Send + Sync {
    /// Query the instrument for `name`.
    async fn refresh(&self, name: &str) -> CoreResult<Value>;
}

// =============================================================================
// Cache
// =============================================================================

/// Snapshot of one cached property.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Last known value, `None` if never read or the last refresh failed.
    pub value: Option<Value>,
    /// Health category of `value`.
    pub category: Category,
    /// When the entry was last refreshed.
    pub refreshed_at: Option<Instant>,
}

impl Reading {
    fn unknown() -> Self {
        Self {
            value: None,
            category: Category::Unknown,
            refreshed_at: None,
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: Option<Value>,
    category: Category,
    refreshed_at: Instant,
    last_error: Option<String>,
}

struct CacheInner {
    notifier: Notifier,
    specs: RwLock<HashMap<String, PropertySpec>>,
    order: RwLock<Vec<String>>,
    entries: Mutex<HashMap<String, Entry>>,
    publish: Mutex<()>,
    refresher: RwLock<Option<Weak<dyn Refresh>>>,
}

/// Per-instrument property map. Cloning shares the cache.
#[derive(Clone)]
pub struct PropertyCache {
    inner: Arc<CacheInner>,
}

impl fmt::Debug for PropertyCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyCache")
            .field("instrument", &self.inner.notifier.instrument())
            .field("entries", &self.inner.entries.lock().len())
            .finish()
    }
}

impl PropertyCache {
    /// Create an empty cache that posts through `notifier`.
    pub fn new(notifier: Notifier) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                notifier,
                specs: RwLock::new(HashMap::new()),
                order: RwLock::new(Vec::new()),
                entries: Mutex::new(HashMap::new()),
                publish: Mutex::new(()),
                refresher: RwLock::new(None),
            }),
        }
    }

    /// Notifier used for change, error and warning events.
    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    /// Register (or replace) a property spec.
    pub fn register(&self, spec: PropertySpec) {
        let name = spec.name.clone();
        if self.inner.specs.write().insert(name.clone(), spec).is_none() {
            self.inner.order.write().push(name);
        }
    }

    /// Register several specs.
    pub fn register_all(&self, specs: impl IntoIterator<Item = PropertySpec>) {
        for spec in specs {
            self.register(spec);
        }
    }

    /// Bind the refresher. The cache keeps only a weak reference.
    pub fn bind<R: Refresh + 'static>(&self, refresher: &Arc<R>) {
        let weak: Weak<dyn Refresh> = Arc::downgrade(refresher) as Weak<dyn Refresh>;
        *self.inner.refresher.write() = Some(weak);
    }

    /// Registered property names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.inner.order.read().clone()
    }

    /// Spec for `name`, creating a default one for unregistered names.
    pub fn spec(&self, name: &str) -> PropertySpec {
        if let Some(spec) = self.inner.specs.read().get(name) {
            return spec.clone();
        }
        let spec = PropertySpec::new(name, ValueKind::Any);
        self.register(spec.clone());
        spec
    }

    /// Cached reading without refreshing. `None` if the property was never
    /// stored.
    pub fn peek(&self, name: &str) -> Option<Reading> {
        self.inner.entries.lock().get(name).map(|e| Reading {
            value: e.value.clone(),
            category: e.category,
            refreshed_at: Some(e.refreshed_at),
        })
    }

    /// Error text from the last failed refresh of `name`, if any.
    pub fn last_error(&self, name: &str) -> Option<String> {
        self.inner
            .entries
            .lock()
            .get(name)
            .and_then(|e| e.last_error.clone())
    }

    /// Current `(value, category)`, refreshing first if missing or stale.
    pub async fn get(&self, name: &str) -> Reading {
        let spec = self.spec(name);
        let fresh = {
            let entries = self.inner.entries.lock();
            entries.get(name).and_then(|e| {
                (e.refreshed_at.elapsed() <= spec.staleness_timeout).then(|| Reading {
                    value: e.value.clone(),
                    category: e.category,
                    refreshed_at: Some(e.refreshed_at),
                })
            })
        };
        match fresh {
            Some(reading) => reading,
            None => self.refresh_with(&spec).await,
        }
    }

    /// Refresh `name` now, regardless of age.
    pub async fn refresh(&self, name: &str) -> Reading {
        let spec = self.spec(name);
        self.refresh_with(&spec).await
    }

    async fn refresh_with(&self, spec: &PropertySpec) -> Reading {
        let refresher = self.inner.refresher.read().as_ref().and_then(Weak::upgrade);
        let outcome = match refresher {
            Some(refresher) => {
                match tokio::time::timeout(spec.staleness_timeout, refresher.refresh(&spec.name))
                    .await
                {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!(
                        "refresh did not complete within {:?}",
                        spec.staleness_timeout
                    )),
                }
            }
            None => Err("no refresher bound".to_string()),
        };

        match outcome {
            Ok(value) => {
                self.store(&spec.name, value);
            }
            Err(reason) => {
                tracing::debug!(
                    instrument = %self.inner.notifier.instrument(),
                    property = %spec.name,
                    %reason,
                    "Property refresh failed"
                );
                self.update(&spec.name, None, Category::Unknown);
                if let Some(entry) = self.inner.entries.lock().get_mut(&spec.name) {
                    entry.last_error = Some(reason);
                }
            }
        }
        self.peek(&spec.name).unwrap_or_else(Reading::unknown)
    }

    /// Store a raw value, converting and categorizing it per its declaration.
    ///
    /// Returns true when the stored pair changed.
    pub fn store(&self, name: &str, value: Value) -> bool {
        let spec = self.spec(name);
        match spec.kind.coerce(value) {
            Some(value) => {
                let category = spec.categorize(&value);
                self.update(name, Some(value), category)
            }
            None => {
                tracing::warn!(
                    instrument = %self.inner.notifier.instrument(),
                    property = %name,
                    expected = ?spec.kind,
                    "Value does not match declared type"
                );
                self.update(name, None, Category::Unknown)
            }
        }
    }

    /// Store `(value, category)` and notify on change.
    ///
    /// Returns true when the stored pair changed.
    pub fn update(&self, name: &str, value: Option<Value>, category: Category) -> bool {
        // Held until the posts below are queued
        let _publishing = self.inner.publish.lock();
        let now = Instant::now();
        {
            let mut entries = self.inner.entries.lock();
            match entries.get_mut(name) {
                Some(entry) if entry.value == value && entry.category == category => {
                    entry.refreshed_at = now;
                    return false;
                }
                Some(entry) => {
                    entry.value = value.clone();
                    entry.category = category;
                    entry.refreshed_at = now;
                    if entry.value.is_some() {
                        entry.last_error = None;
                    }
                }
                None => {
                    entries.insert(
                        name.to_string(),
                        Entry {
                            value: value.clone(),
                            category,
                            refreshed_at: now,
                            last_error: None,
                        },
                    );
                }
            }
        }

        let instrument = self.inner.notifier.instrument().to_string();
        self.inner.notifier.emit(Event::PropertyChanged {
            instrument: instrument.clone(),
            name: name.to_string(),
            value,
            category,
        });
        match category {
            Category::Error => self.inner.notifier.emit(Event::PropertyError {
                instrument,
                name: name.to_string(),
            }),
            Category::Warning => self.inner.notifier.emit(Event::PropertyWarning {
                instrument,
                name: name.to_string(),
            }),
            _ => {}
        }
        true
    }

    /// Mark `name` stale so the next `get` refreshes it.
    pub fn invalidate(&self, name: &str) {
        let spec = self.spec(name);
        if let Some(entry) = self.inner.entries.lock().get_mut(name) {
            if let Some(past) = Instant::now().checked_sub(spec.staleness_timeout * 2) {
                entry.refreshed_at = past;
            }
        }
    }

    /// Names whose refresh interval has elapsed (or that were never read).
    pub fn due(&self) -> Vec<String> {
        let specs = self.inner.specs.read();
        let order = self.inner.order.read();
        let entries = self.inner.entries.lock();
        order
            .iter()
            .filter_map(|name| {
                let interval = specs.get(name)?.refresh_interval?;
                match entries.get(name) {
                    Some(e) if e.refreshed_at.elapsed() < interval => None,
                    _ => Some(name.clone()),
                }
            })
            .collect()
    }

    /// Spawn the background poller. It checks `stop` once per `tick` and
    /// refreshes every due property in registration order.
    pub fn spawn_poller(&self, stop: Arc<AtomicBool>, tick: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        let instrument = self.inner.notifier.instrument().to_string();
        tokio::spawn(async move {
            tracing::debug!(instrument = %instrument, ?tick, "Property poller started");
            while !stop.load(Ordering::SeqCst) {
                for name in cache.due() {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    cache.refresh(&name).await;
                }
                tokio::time::sleep(tick).await;
            }
            tracing::debug!(instrument = %instrument, "Property poller stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::notify::{Marshaler, RunLoop};
    use std::sync::atomic::AtomicUsize;

    fn cache() -> (PropertyCache, RunLoop, Arc<parking_lot::Mutex<Vec<Event>>>) {
        let (marshaler, run_loop) = Marshaler::channel();
        let notifier = Notifier::new("genix", marshaler);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        notifier.subscribe(move |e| sink.lock().push(e.clone()));
        (PropertyCache::new(notifier), run_loop, seen)
    }

    struct Counting {
        calls: AtomicUsize,
        value: f64,
    }

    #[async_trait]
    impl Refresh for Counting {
        async fn refresh(&self, _name: &str) -> CoreResult<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Float(self.value))
        }
    }

    struct Hanging;

    #[async_trait]
    impl Refresh for Hanging {
        async fn refresh(&self, _name: &str) -> CoreResult<Value> {
            futures::future::pending::<()>().await;
            Ok(Value::Bool(true))
        }
    }

    struct Failing;

    #[async_trait]
    impl Refresh for Failing {
        async fn refresh(&self, name: &str) -> CoreResult<Value> {
            Err(CoreError::timeout("genix", name, Duration::from_millis(1)))
        }
    }

    #[tokio::test]
    async fn test_category_transition_notifications() {
        let (cache, mut run_loop, seen) = cache();

        cache.update("fault", Some(Value::Bool(true)), Category::Error);
        cache.update("fault", Some(Value::Bool(true)), Category::Error);
        run_loop.dispatch_pending().await;
        {
            let events = seen.lock();
            let errors = events
                .iter()
                .filter(|e| matches!(e, Event::PropertyError { .. }))
                .count();
            let changes = events
                .iter()
                .filter(|e| matches!(e, Event::PropertyChanged { .. }))
                .count();
            assert_eq!(errors, 1);
            assert_eq!(changes, 1);
            // Changed is posted before error
            assert!(matches!(events[0], Event::PropertyChanged { .. }));
            assert!(matches!(events[1], Event::PropertyError { .. }));
        }

        seen.lock().clear();
        cache.update("fault", Some(Value::Bool(false)), Category::Ok);
        run_loop.dispatch_pending().await;
        let events = seen.lock();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            Event::PropertyChanged { category: Category::Ok, .. }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_deliver_last_value_last() {
        let (cache, mut run_loop, seen) = cache();

        std::thread::scope(|scope| {
            for writer in 0..4i64 {
                let cache = cache.clone();
                scope.spawn(move || {
                    for step in 0..500i64 {
                        let value = Value::Int(writer * 1000 + step);
                        cache.update("ht", Some(value), Category::Normal);
                    }
                });
            }
        });
        run_loop.dispatch_pending().await;

        let cached = cache.peek("ht").unwrap().value;
        let events = seen.lock();
        let last = events.iter().rev().find_map(|e| match e {
            Event::PropertyChanged { value, .. } => Some(value.clone()),
            _ => None,
        });
        assert_eq!(last, Some(cached));
        let changes = events
            .iter()
            .filter(|e| matches!(e, Event::PropertyChanged { .. }))
            .count();
        assert_eq!(changes, 2000);
    }

    #[tokio::test]
    async fn test_warning_notification() {
        let (cache, mut run_loop, seen) = cache();
        cache.update("pressure", Some(Value::Float(0.5)), Category::Warning);
        run_loop.dispatch_pending().await;
        let events = seen.lock();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], Event::PropertyWarning { .. }));
    }

    #[tokio::test]
    async fn test_fresh_entry_not_refreshed() {
        let (cache, _run_loop, _) = cache();
        cache.register(PropertySpec::new("ht", ValueKind::Float).stale_after(Duration::from_secs(60)));
        let refresher = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            value: 30.0,
        });
        cache.bind(&refresher);

        let first = cache.get("ht").await;
        assert_eq!(first.value, Some(Value::Float(30.0)));
        assert_eq!(first.category, Category::Normal);
        let second = cache.get("ht").await;
        assert_eq!(second.value, Some(Value::Float(30.0)));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_entry_refreshed() {
        let (cache, _run_loop, _) = cache();
        cache.register(PropertySpec::new("ht", ValueKind::Float).stale_after(Duration::from_millis(20)));
        let refresher = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            value: 30.0,
        });
        cache.bind(&refresher);

        cache.get("ht").await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        cache.get("ht").await;
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);

        cache.invalidate("ht");
        cache.get("ht").await;
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_hanging_refresh_bounded_by_staleness() {
        let (cache, _run_loop, _) = cache();
        let staleness = Duration::from_millis(50);
        cache.register(PropertySpec::new("shutter", ValueKind::Bool).stale_after(staleness));
        let refresher = Arc::new(Hanging);
        cache.bind(&refresher);

        let start = std::time::Instant::now();
        let reading = cache.get("shutter").await;
        assert!(start.elapsed() < staleness * 4);
        assert_eq!(reading.value, None);
        assert_eq!(reading.category, Category::Unknown);
        assert!(cache.last_error("shutter").is_some());
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_entry_unknown() {
        let (cache, _run_loop, _) = cache();
        cache.update("ht", Some(Value::Float(1.0)), Category::Normal);
        let refresher = Arc::new(Failing);
        cache.bind(&refresher);

        let reading = cache.refresh("ht").await;
        assert_eq!(reading.category, Category::Unknown);
        assert!(cache.peek("ht").is_some());
    }

    #[tokio::test]
    async fn test_store_coerces_and_categorizes() {
        let (cache, _run_loop, _) = cache();
        cache.register(
            PropertySpec::new("current", ValueKind::Float)
                .categorize_with(|v| match v.as_f64() {
                    Some(x) if x > 1.0 => Category::Warning,
                    Some(_) => Category::Ok,
                    None => Category::Unknown,
                }),
        );
        cache.store("current", Value::Int(2));
        let reading = cache.peek("current").unwrap();
        assert_eq!(reading.value, Some(Value::Float(2.0)));
        assert_eq!(reading.category, Category::Warning);

        cache.store("current", Value::Text("bogus".into()));
        assert_eq!(cache.peek("current").unwrap().category, Category::Unknown);

        // Lazily created properties use the default categorizer
        cache.store("interlock", Value::Bool(true));
        assert_eq!(cache.peek("interlock").unwrap().category, Category::Yes);
    }

    #[tokio::test]
    async fn test_poller_refreshes_due_properties() {
        let (cache, _run_loop, _) = cache();
        cache.register(
            PropertySpec::new("ht", ValueKind::Float).refresh_every(Duration::from_millis(10)),
        );
        cache.register(PropertySpec::new("manual", ValueKind::Float));
        let refresher = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            value: 1.0,
        });
        cache.bind(&refresher);

        let stop = Arc::new(AtomicBool::new(false));
        let handle = cache.spawn_poller(stop.clone(), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(60)).await;
        stop.store(true, Ordering::SeqCst);
        handle.await.unwrap();

        assert!(refresher.calls.load(Ordering::SeqCst) >= 2);
        assert!(cache.peek("manual").is_none());
    }
}
