//! Marker state cache - the observable snapshot every screen reads
//!
//! Every mutation goes through the repository first and then reloads the full
//! marker list, so after a successful call the snapshot is exactly what the
//! store holds. Snapshots are replaced wholesale, never edited in place.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::intake::{ImageIntake, ImagePicker};
use crate::marker::{Marker, MarkerUpdate, NewImage, NewMarker};
use crate::repository::MarkerRepo;
use crate::{Cause, Error, Result};

pub const DEFAULT_MARKER_TITLE: &str = "New marker";
pub const DEFAULT_MARKER_DESCRIPTION: &str = "Marker description";

pub type SubscriptionId = u64;

type Listener = Box<dyn FnMut(&MarkersState) + Send>;

#[derive(Default)]
struct Listeners {
    entries: Vec<(SubscriptionId, Listener)>,
    /// Ids taken out of `entries` for the running notification round
    in_flight: Vec<SubscriptionId>,
    /// In-flight ids unsubscribed during the round
    removed: Vec<SubscriptionId>,
    notifying: bool,
}

/// One published snapshot
#[derive(Debug, Clone, Default)]
pub struct MarkersState {
    pub markers: Vec<Marker>,
    /// Latest failure, until cleared or replaced by the next operation
    pub error: Option<Error>,
    pub is_loading: bool,
    pub is_initialized: bool,
}

impl MarkersState {
    pub fn marker(&self, id: &str) -> Option<&Marker> {
        self.markers.iter().find(|marker| marker.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.marker(id).is_some()
    }
}

/// Values used for omitted or blank title/description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerDefaults {
    pub title: String,
    pub description: String,
}

impl Default for MarkerDefaults {
    fn default() -> Self {
        Self {
            title: DEFAULT_MARKER_TITLE.to_string(),
            description: DEFAULT_MARKER_DESCRIPTION.to_string(),
        }
    }
}

pub struct MarkerCache {
    repo: Arc<dyn MarkerRepo>,
    defaults: MarkerDefaults,
    state: RwLock<Arc<MarkersState>>,
    /// Never held while a listener runs
    listeners: Mutex<Listeners>,
    next_subscription: AtomicU64,
    /// Serializes initialization and mutations
    writer: tokio::sync::Mutex<()>,
}

impl MarkerCache {
    pub fn new(repo: Arc<dyn MarkerRepo>) -> Self {
        Self::with_defaults(repo, MarkerDefaults::default())
    }

    pub fn with_defaults(repo: Arc<dyn MarkerRepo>, defaults: MarkerDefaults) -> Self {
        Self {
            repo,
            defaults,
            state: RwLock::new(Arc::new(MarkersState::default())),
            listeners: Mutex::new(Listeners::default()),
            next_subscription: AtomicU64::new(1),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    pub fn defaults(&self) -> &MarkerDefaults {
        &self.defaults
    }

    /// Prepare the store and load all markers. Runs once; later calls
    /// (including concurrent ones) return immediately after the first
    /// successful run. A failed run can be retried.
    pub async fn initialize(&self) -> bool {
        if self.snapshot().is_initialized {
            return true;
        }
        let _writer = self.writer.lock().await;
        if self.snapshot().is_initialized {
            return true;
        }

        self.begin();
        let loaded = match self.repo.initialize().await {
            Ok(()) => self.repo.get_all_markers().await,
            Err(e) => Err(e),
        };

        match loaded {
            Ok(markers) => {
                tracing::info!("Marker cache initialized with {} markers", markers.len());
                self.publish(|_| MarkersState {
                    markers,
                    error: None,
                    is_loading: false,
                    is_initialized: true,
                });
                true
            }
            Err(e) => {
                tracing::error!("Marker cache initialization failed: {}", e);
                self.fail(Error::MarkerLoadFailed(e.into()));
                false
            }
        }
    }

    /// Replace the snapshot with a fresh read of every marker
    pub async fn reload(&self) -> bool {
        let _writer = self.writer.lock().await;
        self.begin();
        match self.repo.get_all_markers().await {
            Ok(markers) => {
                self.commit(markers);
                true
            }
            Err(e) => {
                tracing::error!("Marker reload failed: {}", e);
                self.fail(Error::MarkerLoadFailed(e.into()));
                false
            }
        }
    }

    /// Create a marker. Blank or missing title/description get the defaults.
    /// Returns the new id, or `None` with the error recorded.
    pub async fn add_marker(&self, data: NewMarker) -> Option<String> {
        if let Err(msg) = data.coordinate.validate() {
            self.fail(Error::MarkerAddFailed(Cause::Message(msg)));
            return None;
        }

        let data = NewMarker {
            coordinate: data.coordinate,
            title: Some(or_default(data.title, &self.defaults.title)),
            description: Some(or_default(data.description, &self.defaults.description)),
        };
        let repo = Arc::clone(&self.repo);
        self.mutate("add marker", None, || async move {
            repo.create_marker(&data)
                .await
                .map_err(|e| Error::MarkerAddFailed(e.into()))
        })
        .await
    }

    /// Edit title and/or description. A blank title falls back to the default.
    pub async fn update_marker(&self, id: &str, update: MarkerUpdate) -> bool {
        let update = MarkerUpdate {
            title: update
                .title
                .map(|title| or_default(Some(title), &self.defaults.title)),
            description: update.description,
        };
        let repo = Arc::clone(&self.repo);
        self.mutate("update marker", Some(id), || async move {
            repo.update_marker(id, &update)
                .await
                .map_err(|e| Error::MarkerUpdateFailed(e.into()))
        })
        .await
        .is_some()
    }

    /// Delete a marker with its images. Unknown ids fail without touching the store.
    pub async fn remove_marker(&self, id: &str) -> bool {
        let repo = Arc::clone(&self.repo);
        self.mutate("remove marker", Some(id), || async move {
            repo.delete_marker(id)
                .await
                .map_err(|e| Error::MarkerDeleteFailed(e.into()))
        })
        .await
        .is_some()
    }

    pub async fn attach_image(&self, marker_id: &str, image: &NewImage) -> bool {
        let repo = Arc::clone(&self.repo);
        self.mutate("attach image", Some(marker_id), || async move {
            repo.add_image_to_marker(marker_id, image)
                .await
                .map_err(|e| Error::ImageAttachFailed(e.into()))
        })
        .await
        .is_some()
    }

    pub async fn detach_image(&self, marker_id: &str, image_id: &str) -> bool {
        let repo = Arc::clone(&self.repo);
        self.mutate("detach image", Some(marker_id), || async move {
            repo.remove_image_from_marker(image_id)
                .await
                .map_err(|e| Error::ImageDeleteFailed(e.into()))
        })
        .await
        .is_some()
    }

    /// Run the picker and attach the result. Cancelling is not an error and
    /// leaves the state alone.
    pub async fn pick_and_attach_image(
        &self,
        marker_id: &str,
        intake: &ImageIntake,
        picker: &dyn ImagePicker,
    ) -> bool {
        if !self.snapshot().contains(marker_id) {
            self.fail(Error::MarkerNotFound(marker_id.to_string()));
            return false;
        }

        match intake.acquire(picker).await {
            Ok(Some(image)) => self.attach_image(marker_id, &image).await,
            Ok(None) => false,
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    pub fn get_marker(&self, id: &str) -> Option<Marker> {
        self.snapshot().marker(id).cloned()
    }

    pub fn markers(&self) -> Vec<Marker> {
        self.snapshot().markers.clone()
    }

    /// Current snapshot. Cheap; the returned value never changes.
    pub fn snapshot(&self) -> Arc<MarkersState> {
        Arc::clone(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn error(&self) -> Option<Error> {
        self.snapshot().error.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.snapshot().is_loading
    }

    pub fn is_initialized(&self) -> bool {
        self.snapshot().is_initialized
    }

    /// Dismiss the current error. Markers and the loading flag are left as is.
    pub fn clear_error(&self) {
        if self.snapshot().error.is_none() {
            return;
        }
        self.publish(|state| MarkersState {
            error: None,
            ..state.clone()
        });
    }

    /// Forget the snapshot and the initialized flag. Storage is not touched.
    pub fn reset(&self) {
        self.publish(|_| MarkersState::default());
    }

    /// Call `listener` with every new snapshot
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: FnMut(&MarkersState) + Send + 'static,
    {
        let mut listeners = self.lock_listeners();
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        listeners.entries.push((id, Box::new(listener)));
        id
    }

    /// Call `on_change` only when the value picked by `selector` changes
    pub fn subscribe_with<T, S, F>(&self, selector: S, mut on_change: F) -> SubscriptionId
    where
        T: PartialEq + Send + 'static,
        S: Fn(&MarkersState) -> T + Send + 'static,
        F: FnMut(&T) + Send + 'static,
    {
        let mut listeners = self.lock_listeners();
        let mut last = selector(&self.snapshot());
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        listeners.entries.push((
            id,
            Box::new(move |state: &MarkersState| {
                let next = selector(state);
                if next != last {
                    on_change(&next);
                    last = next;
                }
            }),
        ));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.lock_listeners();
        let before = listeners.entries.len();
        listeners.entries.retain(|(existing, _)| *existing != id);
        if listeners.entries.len() != before {
            return true;
        }
        if listeners.in_flight.contains(&id) && !listeners.removed.contains(&id) {
            listeners.removed.push(id);
            return true;
        }
        false
    }

    /// Shared mutation path: not-found check, pending, durable write, full
    /// reload, then commit or fail.
    async fn mutate<T, F, Fut>(&self, action: &str, marker_id: Option<&str>, work: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _writer = self.writer.lock().await;

        if let Some(id) = marker_id {
            if !self.snapshot().contains(id) {
                tracing::debug!("Cannot {}: marker {} not in snapshot", action, id);
                self.fail(Error::MarkerNotFound(id.to_string()));
                return None;
            }
        }

        self.begin();
        let value = match work().await {
            Ok(value) => value,
            Err(e) => {
                tracing::error!("Failed to {}: {}", action, e);
                self.fail(e);
                return None;
            }
        };

        match self.repo.get_all_markers().await {
            Ok(markers) => {
                tracing::debug!("{} committed, {} markers", action, markers.len());
                self.commit(markers);
                Some(value)
            }
            Err(e) => {
                tracing::error!("Reload after {} failed: {}", action, e);
                self.fail(Error::MarkerLoadFailed(e.into()));
                None
            }
        }
    }

    fn begin(&self) {
        self.publish(|state| MarkersState {
            error: None,
            is_loading: true,
            ..state.clone()
        });
    }

    fn commit(&self, markers: Vec<Marker>) {
        self.publish(|state| MarkersState {
            markers,
            error: None,
            is_loading: false,
            is_initialized: state.is_initialized,
        });
    }

    fn fail(&self, error: Error) {
        self.publish(|state| MarkersState {
            error: Some(error),
            is_loading: false,
            ..state.clone()
        });
    }

    fn publish(&self, update: impl FnOnce(&MarkersState) -> MarkersState) {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let next = Arc::new(update(&state));
            *state = next;
        }
        self.notify();
    }

    /// Deliver the current snapshot to every listener with no lock held, so
    /// listeners may call back into the cache. A snapshot published while a
    /// round is running (from a listener or another thread) is delivered by
    /// the next round of that same loop.
    fn notify(&self) {
        let mut listeners = self.lock_listeners();
        if listeners.notifying {
            return;
        }
        listeners.notifying = true;

        loop {
            let delivered = self.snapshot();
            let mut round = std::mem::take(&mut listeners.entries);
            listeners.in_flight = round.iter().map(|(id, _)| *id).collect();
            drop(listeners);

            for (_, listener) in round.iter_mut() {
                listener(&delivered);
            }

            listeners = self.lock_listeners();
            let removed = std::mem::take(&mut listeners.removed);
            listeners.in_flight.clear();
            round.retain(|(id, _)| !removed.contains(id));
            let added = std::mem::replace(&mut listeners.entries, round);
            listeners.entries.extend(added);

            if Arc::ptr_eq(&delivered, &self.snapshot()) {
                listeners.notifying = false;
                return;
            }
        }
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn or_default(value: Option<String>, default: &str) -> String {
    match value {
        Some(value) if !value.trim().is_empty() => value,
        _ => default.to_string(),
    }
}
