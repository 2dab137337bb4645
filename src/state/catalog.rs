/// Catalog synchronization
///
/// `CatalogSync` owns the displayed product list and keeps it consistent
/// with the backend. Every path that can change the catalog (explicit
/// `load`, local mutations, backend change events) ends up as a request on
/// one reload queue served by a single worker task:
///
/// - requests queued while a fetch is in flight are drained together and
///   served by exactly one follow-up fetch
/// - a snapshot is only ever replaced whole, after a successful fetch
/// - a failed fetch keeps the previous snapshot and records the error
///
/// Must be constructed inside a Tokio runtime.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use arc_swap::ArcSwap;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::ProductBackend;
use super::data::{CatalogSnapshot, Product, ProductFields, ProductRecord};
use super::events::{ChangeEvent, ChangeFeed, ChangeKind};
use crate::config::SyncConfig;
use crate::error::CatalogError;
use crate::storage::UrlResolver;

type ReloadResult = Result<Arc<CatalogSnapshot>, CatalogError>;

/// Where the reload worker currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Loading,
}

#[derive(Debug)]
struct SyncStatus {
    state: SyncState,
    last_error: Option<CatalogError>,
}

/// One entry on the reload queue; `reply` is `None` for fire-and-forget
struct ReloadRequest {
    reply: Option<oneshot::Sender<ReloadResult>>,
}

/// State shared between the handle and the worker
struct Shared {
    backend: Arc<dyn ProductBackend>,
    resolver: UrlResolver,
    snapshot: ArcSwap<CatalogSnapshot>,
    published: watch::Sender<Arc<CatalogSnapshot>>,
    changes: broadcast::Sender<ChangeEvent>,
    status: Mutex<SyncStatus>,
}

impl Shared {
    fn set_state(&self, state: SyncState) {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state = state;
    }

    fn materialize(&self, record: ProductRecord) -> Product {
        let url = self.resolver.resolve(record.image_key.as_deref());
        Product::from_record(record, url)
    }

    /// Fetch, resolve and publish one snapshot
    async fn reload(&self) -> ReloadResult {
        self.set_state(SyncState::Loading);
        let started = Instant::now();

        let outcome = match self.backend.list_products().await {
            Ok(records) => {
                let generation = self.snapshot.load().generation() + 1;
                let products = records
                    .into_iter()
                    .map(|record| self.materialize(record))
                    .collect();

                let snapshot = Arc::new(CatalogSnapshot::new(products, generation));
                self.snapshot.store(Arc::clone(&snapshot));
                self.published.send_replace(Arc::clone(&snapshot));

                info!(
                    products = snapshot.len(),
                    generation,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "catalog reloaded"
                );
                Ok(snapshot)
            }
            Err(err) => {
                let err = CatalogError::fetch(err);
                warn!(error = %err, "catalog reload failed, keeping previous snapshot");
                Err(err)
            }
        };

        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        status.state = SyncState::Idle;
        status.last_error = outcome.as_ref().err().cloned();
        outcome
    }
}

/// Single consumer of the reload queue
async fn run_reload_worker(shared: Arc<Shared>, mut requests: mpsc::UnboundedReceiver<ReloadRequest>) {
    while let Some(first) = requests.recv().await {
        let mut waiters: Vec<_> = first.reply.into_iter().collect();

        // Everything queued up to now is answered by the same fetch
        let mut coalesced = 0usize;
        while let Ok(next) = requests.try_recv() {
            waiters.extend(next.reply);
            coalesced += 1;
        }
        if coalesced > 0 {
            debug!(coalesced, "coalesced reload requests");
        }

        let outcome = shared.reload().await;
        for waiter in waiters {
            // The caller may have stopped waiting; the reload still counts
            let _ = waiter.send(outcome.clone());
        }
    }

    debug!("catalog reload worker stopped");
}

/// Handle to a running change handler
///
/// Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes"]
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The catalog as the UI sees it
pub struct CatalogSync {
    shared: Arc<Shared>,
    requests: mpsc::UnboundedSender<ReloadRequest>,
    feed_listener: Option<Subscription>,
}

impl CatalogSync {
    pub fn new(backend: Arc<dyn ProductBackend>, resolver: UrlResolver, config: &SyncConfig) -> Self {
        let initial = Arc::new(CatalogSnapshot::default());
        let (published, _) = watch::channel(Arc::clone(&initial));
        let (changes, _) = broadcast::channel(config.event_capacity.max(1));

        let shared = Arc::new(Shared {
            backend,
            resolver,
            snapshot: ArcSwap::new(initial),
            published,
            changes,
            status: Mutex::new(SyncStatus {
                state: SyncState::Idle,
                last_error: None,
            }),
        });

        let (requests, queue) = mpsc::unbounded_channel();
        tokio::spawn(run_reload_worker(Arc::clone(&shared), queue));

        Self {
            shared,
            requests,
            feed_listener: None,
        }
    }

    /// Reload whenever the backend reports a change
    ///
    /// Replaces any previously attached feed.
    pub fn with_change_feed(mut self, feed: &dyn ChangeFeed) -> Self {
        let mut events = feed.subscribe();
        let shared = Arc::clone(&self.shared);
        let requests = self.requests.clone();

        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        debug!(kind = ?event.kind, product_id = ?event.product_id, "backend change received");
                        let _ = shared.changes.send(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Missed events only matter as "something changed"
                        warn!(missed, "change feed lagged, reloading");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }

                if requests.send(ReloadRequest { reply: None }).is_err() {
                    break;
                }
            }
            debug!("change feed listener stopped");
        });

        self.feed_listener = Some(Subscription { task });
        self
    }

    /// The current snapshot; cheap, never blocks on a reload
    pub fn current_snapshot(&self) -> Arc<CatalogSnapshot> {
        self.shared.snapshot.load_full()
    }

    /// Receiver that observes every newly published snapshot
    pub fn snapshots(&self) -> watch::Receiver<Arc<CatalogSnapshot>> {
        self.shared.published.subscribe()
    }

    pub fn state(&self) -> SyncState {
        self.shared
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Error of the most recent reload, cleared by the next success
    pub fn last_error(&self) -> Option<CatalogError> {
        self.shared
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_error
            .clone()
    }

    /// Fetch the full catalog and publish it
    ///
    /// The request is queued as soon as this is called, not when the future
    /// is first polled. If a fetch is already running, this waits for the
    /// follow-up fetch that starts after it.
    pub fn load(&self) -> impl Future<Output = ReloadResult> + Send + 'static {
        let (reply, receiver) = oneshot::channel();
        let queued = self
            .requests
            .send(ReloadRequest { reply: Some(reply) })
            .is_ok();

        async move {
            if !queued {
                return Err(CatalogError::Closed);
            }
            receiver.await.map_err(|_| CatalogError::Closed)?
        }
    }

    /// Queue a reload without waiting for it
    pub fn request_reload(&self) -> bool {
        self.requests.send(ReloadRequest { reply: None }).is_ok()
    }

    /// Fetch one product directly from the backend, resolved for display
    pub async fn fetch_product(&self, id: i64) -> Result<Product, CatalogError> {
        let record = self
            .shared
            .backend
            .get_product(id)
            .await
            .map_err(CatalogError::fetch)?;
        Ok(self.shared.materialize(record))
    }

    pub async fn create(&self, fields: ProductFields) -> Result<ProductRecord, CatalogError> {
        let fields = checked(fields)?;
        let record = self
            .shared
            .backend
            .insert_product(&fields)
            .await
            .map_err(CatalogError::backend)?;

        info!(product_id = record.id, name = %record.name, "product created");
        self.notify(ChangeEvent::local(ChangeKind::Insert, record.id));
        Ok(record)
    }

    pub async fn update(&self, id: i64, fields: ProductFields) -> Result<(), CatalogError> {
        let fields = checked(fields)?;
        self.shared
            .backend
            .update_product(id, &fields)
            .await
            .map_err(CatalogError::backend)?;

        info!(product_id = id, "product updated");
        self.notify(ChangeEvent::local(ChangeKind::Update, id));
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<(), CatalogError> {
        self.shared
            .backend
            .delete_product(id)
            .await
            .map_err(CatalogError::backend)?;

        info!(product_id = id, "product deleted");
        self.notify(ChangeEvent::local(ChangeKind::Delete, id));
        Ok(())
    }

    /// Run `handler` for every change notification, local or from the backend
    ///
    /// Handlers run on their own task, in delivery order.
    pub fn subscribe_to_changes<F>(&self, mut handler: F) -> Subscription
    where
        F: FnMut(&ChangeEvent) + Send + 'static,
    {
        let mut events = self.shared.changes.subscribe();

        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => handler(&event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "change handler lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Subscription { task }
    }

    /// Synthesized notification for a local mutation
    fn notify(&self, event: ChangeEvent) {
        // No handlers registered is fine
        let _ = self.shared.changes.send(event);
        if !self.request_reload() {
            warn!("catalog reload worker stopped, change not reloaded");
        }
    }
}

impl std::fmt::Debug for CatalogSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.current_snapshot();
        f.debug_struct("CatalogSync")
            .field("products", &snapshot.len())
            .field("generation", &snapshot.generation())
            .field("state", &self.state())
            .field("has_change_feed", &self.feed_listener.is_some())
            .finish()
    }
}

fn checked(fields: ProductFields) -> Result<ProductFields, CatalogError> {
    let fields = fields.normalized();
    fields.validate()?;
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use crate::error::BackendError;
    use crate::state::events::{ChangeBus, ChangeOrigin};
    use crate::storage::testing::MemoryStore;

    type Gate = (oneshot::Sender<()>, oneshot::Receiver<()>);

    /// Scriptable backend: can fail, and can hold the next list call open
    #[derive(Default)]
    struct FakeBackend {
        records: Mutex<Vec<ProductRecord>>,
        next_id: AtomicI64,
        list_calls: AtomicUsize,
        inserts: AtomicUsize,
        listing_now: AtomicUsize,
        max_listing: AtomicUsize,
        fail_reads: AtomicBool,
        fail_writes: AtomicBool,
        gate: Mutex<Option<Gate>>,
    }

    impl FakeBackend {
        fn seed(&self, fields: ProductFields) -> ProductRecord {
            let record = ProductRecord {
                id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
                name: fields.name,
                price: fields.price,
                description: fields.description,
                stock: fields.stock,
                image_key: fields.image_key,
                created_at: Utc::now(),
            };
            self.records.lock().unwrap().push(record.clone());
            record
        }

        /// Block the next `list_products` until the returned sender fires
        fn hold_next_list(&self) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
            let (started_tx, started_rx) = oneshot::channel();
            let (release_tx, release_rx) = oneshot::channel();
            *self.gate.lock().unwrap() = Some((started_tx, release_rx));
            (started_rx, release_tx)
        }

        fn list_calls(&self) -> usize {
            self.list_calls.load(Ordering::SeqCst)
        }

        fn unavailable() -> BackendError {
            BackendError::Unavailable("connection refused".into())
        }
    }

    #[async_trait]
    impl ProductBackend for FakeBackend {
        async fn list_products(&self) -> Result<Vec<ProductRecord>, BackendError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            let now = self.listing_now.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_listing.fetch_max(now, Ordering::SeqCst);

            let gate = self.gate.lock().unwrap().take();
            if let Some((started, release)) = gate {
                let _ = started.send(());
                let _ = release.await;
            }

            self.listing_now.fetch_sub(1, Ordering::SeqCst);
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(Self::unavailable());
            }

            let mut records = self.records.lock().unwrap().clone();
            records.reverse();
            Ok(records)
        }

        async fn get_product(&self, id: i64) -> Result<ProductRecord, BackendError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(Self::unavailable());
            }
            self.records
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.id == id)
                .cloned()
                .ok_or(BackendError::NotFound(id))
        }

        async fn insert_product(&self, fields: &ProductFields) -> Result<ProductRecord, BackendError> {
            self.inserts.fetch_add(1, Ordering::SeqCst);
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(Self::unavailable());
            }
            Ok(self.seed(fields.clone()))
        }

        async fn update_product(&self, id: i64, fields: &ProductFields) -> Result<(), BackendError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(Self::unavailable());
            }
            let mut records = self.records.lock().unwrap();
            let record = records
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or(BackendError::NotFound(id))?;
            record.name = fields.name.clone();
            record.price = fields.price;
            record.description = fields.description.clone();
            record.stock = fields.stock;
            record.image_key = fields.image_key.clone();
            Ok(())
        }

        async fn delete_product(&self, id: i64) -> Result<(), BackendError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(Self::unavailable());
            }
            let mut records = self.records.lock().unwrap();
            let before = records.len();
            records.retain(|r| r.id != id);
            if records.len() == before {
                return Err(BackendError::NotFound(id));
            }
            Ok(())
        }
    }

    fn catalog(backend: Arc<FakeBackend>) -> (CatalogSync, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        let resolver = UrlResolver::new(store.clone(), "assets/no-image.png");
        (CatalogSync::new(backend, resolver, &SyncConfig::default()), store)
    }

    async fn next_snapshot(rx: &mut watch::Receiver<Arc<CatalogSnapshot>>) -> Arc<CatalogSnapshot> {
        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .expect("timed out waiting for a snapshot")
            .unwrap();
        rx.borrow_and_update().clone()
    }

    #[tokio::test]
    async fn test_starts_empty_and_idle() {
        let (sync, _) = catalog(Arc::new(FakeBackend::default()));
        assert!(sync.current_snapshot().is_empty());
        assert_eq!(sync.current_snapshot().generation(), 0);
        assert_eq!(sync.state(), SyncState::Idle);
        assert!(sync.last_error().is_none());
    }

    #[tokio::test]
    async fn test_load_resolves_image_keys() {
        let backend = Arc::new(FakeBackend::default());
        backend.seed(ProductFields::new("Mate", 4.5, 3).with_image_key("products/mate.jpg"));
        backend.seed(ProductFields::new("Bombilla", 9.0, 1));
        let (sync, store) = catalog(backend);

        let snapshot = sync.load().await.unwrap();
        assert_eq!(snapshot.generation(), 1);

        let names: Vec<&str> = snapshot.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Bombilla", "Mate"]);

        let bombilla = &snapshot.products()[0];
        assert_eq!(bombilla.image_url, "assets/no-image.png");

        let mate = &snapshot.products()[1];
        assert_eq!(mate.image_url, "https://cdn.test/storage/products/mate.jpg");
        assert_eq!(mate.image_key.as_deref(), Some("products/mate.jpg"));

        // Second load hits the URL cache
        sync.load().await.unwrap();
        assert_eq!(store.url_lookups(), 1);
        assert_eq!(sync.current_snapshot().generation(), 2);
    }

    #[tokio::test]
    async fn test_created_product_appears_once() {
        let backend = Arc::new(FakeBackend::default());
        let (sync, _) = catalog(backend.clone());

        let record = sync
            .create(ProductFields::new(" Termo ", 30.0, 2).with_description("1L"))
            .await
            .unwrap();
        assert_eq!(record.name, "Termo");

        let snapshot = sync.load().await.unwrap();
        assert_eq!(snapshot.iter().filter(|p| p.id == record.id).count(), 1);
        assert_eq!(snapshot.get(record.id).unwrap().description.as_deref(), Some("1L"));
    }

    #[tokio::test]
    async fn test_validation_fails_before_backend() {
        let backend = Arc::new(FakeBackend::default());
        let (sync, _) = catalog(backend.clone());

        let err = sync.create(ProductFields::new("Mate", -1.0, 1)).await.unwrap_err();
        assert!(err.is_validation());

        let err = sync.update(1, ProductFields::new("", 1.0, 1)).await.unwrap_err();
        assert!(err.is_validation());

        assert_eq!(backend.inserts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_backend_write_failure_is_reported() {
        let backend = Arc::new(FakeBackend::default());
        let (sync, _) = catalog(backend.clone());
        let changes = sync.snapshots();

        backend.fail_writes.store(true, Ordering::SeqCst);
        let err = sync.create(ProductFields::new("Mate", 1.0, 1)).await.unwrap_err();
        assert!(matches!(err, CatalogError::BackendFailed(_)));

        let err = sync.delete(42).await.unwrap_err();
        assert!(matches!(err, CatalogError::BackendFailed(_)));

        // Failed mutations don't trigger reloads
        tokio::task::yield_now().await;
        assert_eq!(backend.list_calls(), 0);
        assert!(!changes.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_snapshot() {
        let backend = Arc::new(FakeBackend::default());
        backend.seed(ProductFields::new("Mate", 4.5, 3));
        let (sync, _) = catalog(backend.clone());

        let good = sync.load().await.unwrap();

        backend.fail_reads.store(true, Ordering::SeqCst);
        let err = sync.load().await.unwrap_err();
        assert!(matches!(err, CatalogError::FetchFailed(_)));

        assert_eq!(sync.current_snapshot(), good);
        assert_eq!(sync.state(), SyncState::Idle);
        assert!(matches!(sync.last_error(), Some(CatalogError::FetchFailed(_))));

        backend.fail_reads.store(false, Ordering::SeqCst);
        sync.load().await.unwrap();
        assert!(sync.last_error().is_none());
    }

    #[tokio::test]
    async fn test_reloads_coalesce_while_in_flight() {
        let backend = Arc::new(FakeBackend::default());
        let (sync, _) = catalog(backend.clone());
        let (started, release) = backend.hold_next_list();

        let first = tokio::spawn(sync.load());
        started.await.unwrap();
        assert_eq!(sync.state(), SyncState::Loading);

        // Both queued while the first fetch is held open
        let second = tokio::spawn(sync.load());
        let third = tokio::spawn(sync.load());

        release.send(()).unwrap();
        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        let third = third.await.unwrap().unwrap();

        assert_eq!(backend.list_calls(), 2);
        assert_eq!(backend.max_listing.load(Ordering::SeqCst), 1);
        assert_eq!(first.generation(), 1);
        assert_eq!(second.generation(), 2);
        assert!(Arc::ptr_eq(&second, &third));
    }

    #[tokio::test]
    async fn test_local_mutation_notifies_and_reloads() {
        let backend = Arc::new(FakeBackend::default());
        let (sync, _) = catalog(backend.clone());

        let (tx, mut seen) = mpsc::unbounded_channel();
        let _subscription = sync.subscribe_to_changes(move |event| {
            let _ = tx.send(event.clone());
        });
        let mut snapshots = sync.snapshots();

        let record = sync.create(ProductFields::new("Mate", 4.5, 3)).await.unwrap();

        let event = seen.recv().await.unwrap();
        assert_eq!(event, ChangeEvent::local(ChangeKind::Insert, record.id));

        let snapshot = next_snapshot(&mut snapshots).await;
        assert!(snapshot.get(record.id).is_some());
    }

    #[tokio::test]
    async fn test_backend_event_triggers_reload() {
        let backend = Arc::new(FakeBackend::default());
        let bus = ChangeBus::new(8);
        let (sync, _) = catalog(backend.clone());
        let sync = sync.with_change_feed(&bus);

        let (tx, mut seen) = mpsc::unbounded_channel();
        let _subscription = sync.subscribe_to_changes(move |event| {
            let _ = tx.send(event.clone());
        });
        let mut snapshots = sync.snapshots();

        // Another admin inserts directly
        let record = backend.seed(ProductFields::new("Yerba", 6.0, 8));
        bus.publish(ChangeEvent::backend(ChangeKind::Insert, Some(record.id)));

        let event = seen.recv().await.unwrap();
        assert_eq!(event.origin, ChangeOrigin::Backend);

        let snapshot = next_snapshot(&mut snapshots).await;
        assert_eq!(snapshot.get(record.id).unwrap().name, "Yerba");
    }

    #[tokio::test]
    async fn test_unsubscribed_handler_stops() {
        let backend = Arc::new(FakeBackend::default());
        let (sync, _) = catalog(backend.clone());

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let subscription = sync.subscribe_to_changes(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(subscription.is_active());
        subscription.unsubscribe();

        sync.create(ProductFields::new("Mate", 4.5, 3)).await.unwrap();
        sync.load().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_update_and_delete_reach_snapshot() {
        let backend = Arc::new(FakeBackend::default());
        let record = backend.seed(ProductFields::new("Mate", 4.5, 3));
        let (sync, _) = catalog(backend.clone());

        let mut fields = ProductFields::from(&record);
        fields.stock = 0;
        sync.update(record.id, fields).await.unwrap();
        let snapshot = sync.load().await.unwrap();
        assert!(!snapshot.get(record.id).unwrap().in_stock());

        sync.delete(record.id).await.unwrap();
        assert!(sync.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_product_resolves_url() {
        let backend = Arc::new(FakeBackend::default());
        let record = backend.seed(ProductFields::new("Mate", 4.5, 3).with_image_key("m.png"));
        let (sync, _) = catalog(backend);

        let product = sync.fetch_product(record.id).await.unwrap();
        assert_eq!(product.image_url, "https://cdn.test/storage/products/m.png");

        assert!(matches!(
            sync.fetch_product(999).await,
            Err(CatalogError::FetchFailed(_))
        ));
    }
}
