//! # Model Manager
//!
//! Owns every Whisper instance in the process and hands out leases to them.
//!
//! ## Key Features:
//! - **Load once, reuse**: one resident instance per `(model, device)` key
//! - **Single-flight**: concurrent requests for a key wait for one load
//! - **Device fallback**: an accelerated device that fails to initialise is
//!   retried once on the CPU, recorded, and skipped for the rest of the process
//! - **LRU eviction**: with a `max_resident_models` ceiling, the least recently
//!   used idle model is dropped before a new one is loaded, again once the load
//!   finishes, and whenever the last lease on a model is released
//!
//! ## Rust Concepts Used:
//! - **`tokio::sync::OnceCell`**: `get_or_try_init` runs exactly one initialiser
//!   at a time and leaves the cell empty when it fails, so a later request
//!   simply tries again
//! - **RAII leases**: `ModelHandle` bumps an atomic counter on creation and
//!   decrements it in `Drop`; eviction never touches a model with leases
//! - **`std::sync::Mutex` for the slot map**: it is only held for map and
//!   counter updates, never across an `.await`, so `Drop` can take it too

use crate::device::ComputeDevice;
use crate::error::{CoreResult, TranscriptionError};
use crate::transcription::model::SpeechModel;
use crate::transcription::profile::ModelSize;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, MutexGuard};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{debug, info, warn};

/// Number of fallback events kept for diagnostics.
const FALLBACK_HISTORY: usize = 32;

const FAILED_EARLIER: &str = "accelerated device failed earlier in this process";

/// Identity of a resident model.
pub type ModelKey = (ModelSize, ComputeDevice);

/// Why a loader could not produce a model.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoadError {
    /// The device itself could not be brought up. Worth retrying elsewhere.
    #[error("device initialisation failed: {0}")]
    DeviceInit(String),

    /// Anything else: missing weights, corrupt files, out of memory.
    #[error("{0}")]
    Load(String),
}

/// Produces model instances. Production code downloads and builds Whisper;
/// tests plug in fakes.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(
        &self,
        model: ModelSize,
        device: ComputeDevice,
    ) -> Result<Box<dyn SpeechModel>, LoadError>;
}

/// A model instance bound to a device.
pub struct LoadedModel {
    pub model: ModelSize,
    pub device: ComputeDevice,
    instance: Mutex<Box<dyn SpeechModel>>,
    loaded_at: DateTime<Utc>,
    last_used_at: std::sync::Mutex<DateTime<Utc>>,
    last_used_tick: AtomicU64,
    active_leases: AtomicUsize,
    requests_served: AtomicU64,
}

impl LoadedModel {
    fn new(
        model: ModelSize,
        device: ComputeDevice,
        instance: Box<dyn SpeechModel>,
        tick: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            model,
            device,
            instance: Mutex::new(instance),
            loaded_at: now,
            last_used_at: std::sync::Mutex::new(now),
            last_used_tick: AtomicU64::new(tick),
            active_leases: AtomicUsize::new(0),
            requests_served: AtomicU64::new(0),
        }
    }

    /// Run `f` with exclusive access to the instance. Blocks the thread, so
    /// call it from `spawn_blocking`.
    pub fn with_instance_blocking<T>(&self, f: impl FnOnce(&mut dyn SpeechModel) -> T) -> T {
        let mut guard = self.instance.blocking_lock();
        f(guard.as_mut())
    }

    fn last_used(&self) -> DateTime<Utc> {
        match self.last_used_at.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn touch(&self, tick: u64) {
        self.last_used_tick.store(tick, Ordering::SeqCst);
        match self.last_used_at.lock() {
            Ok(mut guard) => *guard = Utc::now(),
            Err(poisoned) => *poisoned.into_inner() = Utc::now(),
        }
    }

    fn is_idle(&self) -> bool {
        self.active_leases.load(Ordering::SeqCst) == 0
    }
}

/// A lease on a resident model. The model cannot be evicted while any
/// handle to it is alive.
pub struct ModelHandle {
    loaded: Arc<LoadedModel>,
    requested_device: ComputeDevice,
    residency: Arc<Residency>,
}

impl ModelHandle {
    pub fn model_size(&self) -> ModelSize {
        self.loaded.model
    }

    /// Device the model actually runs on.
    pub fn device(&self) -> ComputeDevice {
        self.loaded.device
    }

    pub fn requested_device(&self) -> ComputeDevice {
        self.requested_device
    }

    /// True when the preferred device could not be used.
    pub fn fell_back(&self) -> bool {
        self.requested_device != self.loaded.device
    }

    /// Shared reference for blocking inference threads.
    pub fn loaded(&self) -> Arc<LoadedModel> {
        Arc::clone(&self.loaded)
    }
}

impl Drop for ModelHandle {
    fn drop(&mut self) {
        if self.loaded.active_leases.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.residency.trim();
        }
    }
}

/// A recorded accelerated-to-CPU fallback.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackEvent {
    pub model: ModelSize,
    pub from: ComputeDevice,
    pub to: ComputeDevice,
    pub cause: String,
    pub at: DateTime<Utc>,
}

/// Diagnostic snapshot of one resident model.
#[derive(Debug, Clone, Serialize)]
pub struct ResidentModel {
    pub model: ModelSize,
    pub device: ComputeDevice,
    pub loaded_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub active_leases: usize,
    pub requests_served: u64,
}

#[derive(Default)]
struct Slot {
    cell: OnceCell<Arc<LoadedModel>>,
    /// Acquisitions between finding the slot and holding a lease
    waiters: AtomicUsize,
}

impl Slot {
    fn is_idle(&self, loaded: &LoadedModel) -> bool {
        loaded.is_idle() && self.waiters.load(Ordering::SeqCst) == 0
    }

    fn is_loading(&self) -> bool {
        self.cell.get().is_none() && self.waiters.load(Ordering::SeqCst) > 0
    }
}

type SlotMap = HashMap<ModelKey, Arc<Slot>>;

/// Registers interest in a slot for as long as it lives, so the slot cannot
/// be evicted between its load finishing and the caller taking a lease.
struct Waiting(Arc<Slot>);

impl Drop for Waiting {
    fn drop(&mut self) {
        self.0.waiters.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Resident slots and the ceiling, shared with every handle.
struct Residency {
    slots: std::sync::Mutex<SlotMap>,
    max_resident: Option<usize>,
}

impl Residency {
    // Slot bookkeeping survives a panic elsewhere, so a poisoned lock is
    // still usable.
    fn lock(&self) -> MutexGuard<'_, SlotMap> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Evict idle models over the ceiling. Called after a load completes and
    /// when the last lease on a model goes away.
    fn trim(&self) {
        let Some(max) = self.max_resident else {
            return;
        };
        let mut slots = self.lock();
        if !evict_idle(&mut slots, max, None, 0) {
            debug!(max_resident = max, "Resident ceiling exceeded until a model is released");
        }
    }
}

/// Evict least recently used idle models until the models other than `keep`,
/// plus those still loading, plus `reserve` fit under `max`. Returns false
/// when only models in use are left to evict.
fn evict_idle(slots: &mut SlotMap, max: usize, keep: Option<ModelKey>, reserve: usize) -> bool {
    loop {
        let mut loading = 0;
        let mut resident: Vec<(ModelKey, Arc<Slot>, Arc<LoadedModel>)> = Vec::new();
        for (key, slot) in slots.iter() {
            if Some(*key) == keep {
                continue;
            }
            match slot.cell.get() {
                Some(loaded) => resident.push((*key, Arc::clone(slot), Arc::clone(loaded))),
                None if slot.is_loading() => loading += 1,
                None => {}
            }
        }

        if resident.len() + loading + reserve <= max {
            return true;
        }

        let victim = resident
            .iter()
            .filter(|(_, slot, loaded)| slot.is_idle(loaded))
            .min_by_key(|(_, _, loaded)| loaded.last_used_tick.load(Ordering::SeqCst))
            .map(|(key, _, _)| *key);

        match victim {
            Some(key) => {
                slots.remove(&key);
                info!(model = %key.0, device = %key.1, "Evicted least recently used model");
            }
            None => return false,
        }
    }
}

/// Process-wide owner of loaded models.
pub struct ModelManager {
    loader: Arc<dyn ModelLoader>,
    residency: Arc<Residency>,
    accelerated_failed: AtomicBool,
    fallbacks: RwLock<VecDeque<FallbackEvent>>,
    clock: AtomicU64,
}

impl ModelManager {
    /// Create a manager. `max_resident = None` never evicts.
    pub fn new(loader: Arc<dyn ModelLoader>, max_resident: Option<usize>) -> Self {
        Self {
            loader,
            residency: Arc::new(Residency {
                slots: std::sync::Mutex::new(HashMap::new()),
                max_resident,
            }),
            accelerated_failed: AtomicBool::new(false),
            fallbacks: RwLock::new(VecDeque::with_capacity(FALLBACK_HISTORY)),
            clock: AtomicU64::new(0),
        }
    }

    /// Get a lease on `model`, loading it first if needed.
    ///
    /// ## Device policy:
    /// 1. An accelerated instance that is already resident is always reused
    /// 2. Otherwise the accelerated device is tried unless it failed before
    /// 3. A device initialisation failure falls back to the CPU exactly once
    /// 4. Generic load failures are not retried on another device
    ///
    /// Every acquisition that ends up on the CPU instead of the accelerated
    /// device is recorded as a `FallbackEvent`.
    pub async fn acquire(
        &self,
        model: ModelSize,
        preferred: ComputeDevice,
    ) -> CoreResult<ModelHandle> {
        if preferred == ComputeDevice::Accelerated {
            if let Some(handle) = self.lease_resident((model, ComputeDevice::Accelerated), preferred)
            {
                return Ok(handle);
            }

            if !self.accelerated_failed.load(Ordering::SeqCst) {
                match self.load_and_lease(model, ComputeDevice::Accelerated, preferred).await {
                    Ok(handle) => return Ok(handle),
                    Err(LoadError::DeviceInit(cause)) => {
                        self.record_fallback(model, cause).await;
                    }
                    Err(LoadError::Load(cause)) => {
                        return Err(TranscriptionError::ModelLoadFailure(format!(
                            "{} on {}: {}",
                            model, preferred, cause
                        )));
                    }
                }
            } else {
                debug!(model = %model, "Accelerated device unavailable, using CPU");
                self.record_fallback(model, FAILED_EARLIER.to_string()).await;
            }
        }

        self.load_and_lease(model, ComputeDevice::Cpu, preferred)
            .await
            .map_err(|e| TranscriptionError::ModelLoadFailure(format!("{} on cpu: {}", model, e)))
    }

    /// Models currently in memory.
    pub async fn resident_models(&self) -> Vec<ResidentModel> {
        let mut models: Vec<ResidentModel> = self
            .residency
            .lock()
            .values()
            .filter_map(|slot| slot.cell.get())
            .map(|loaded| ResidentModel {
                model: loaded.model,
                device: loaded.device,
                loaded_at: loaded.loaded_at,
                last_used: loaded.last_used(),
                active_leases: loaded.active_leases.load(Ordering::SeqCst),
                requests_served: loaded.requests_served.load(Ordering::SeqCst),
            })
            .collect();
        models.sort_by_key(|m| (m.model, m.device.as_str()));
        models
    }

    /// Most recent fallbacks, oldest first.
    pub async fn fallback_events(&self) -> Vec<FallbackEvent> {
        self.fallbacks.read().await.iter().cloned().collect()
    }

    /// Whether an accelerated device is still considered usable.
    pub fn accelerated_usable(&self) -> bool {
        !self.accelerated_failed.load(Ordering::SeqCst)
    }

    /// Lease `key` if it is already loaded.
    fn lease_resident(&self, key: ModelKey, requested: ComputeDevice) -> Option<ModelHandle> {
        let slots = self.residency.lock();
        let loaded = slots.get(&key).and_then(|slot| slot.cell.get().cloned())?;
        Some(self.lease(loaded, requested))
    }

    async fn load_and_lease(
        &self,
        model: ModelSize,
        device: ComputeDevice,
        requested: ComputeDevice,
    ) -> Result<ModelHandle, LoadError> {
        let key = (model, device);
        let waiting = {
            let mut slots = self.residency.lock();
            let slot = Arc::clone(slots.entry(key).or_default());
            slot.waiters.fetch_add(1, Ordering::SeqCst);
            Waiting(slot)
        };

        let loaded = waiting
            .0
            .cell
            .get_or_try_init(|| async {
                // a waiter that lost the race against a failed device init
                if device == ComputeDevice::Accelerated
                    && self.accelerated_failed.load(Ordering::SeqCst)
                {
                    return Err(LoadError::DeviceInit(FAILED_EARLIER.to_string()));
                }

                self.make_room(key);

                info!(model = %model, device = %device, "Loading model");
                let started = Instant::now();
                let instance = self.loader.load(model, device).await.map_err(|e| {
                    warn!(model = %model, device = %device, "Model load failed: {}", e);
                    e
                })?;
                info!(
                    model = %model,
                    device = %device,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Model loaded"
                );

                let tick = self.clock.load(Ordering::SeqCst);
                Ok(Arc::new(LoadedModel::new(model, device, instance, tick)))
            })
            .await
            .map(Arc::clone)?;

        let handle = {
            let _slots = self.residency.lock();
            self.lease(loaded, requested)
        };
        drop(waiting);

        // loads that ran side by side may have pushed the set over the ceiling
        self.residency.trim();
        Ok(handle)
    }

    /// Evict idle models until one more fits under the ceiling.
    fn make_room(&self, incoming: ModelKey) {
        let Some(max) = self.residency.max_resident else {
            return;
        };

        let mut slots = self.residency.lock();
        if !evict_idle(&mut slots, max, Some(incoming), 1) {
            warn!(
                model = %incoming.0,
                device = %incoming.1,
                max_resident = max,
                "Every resident model is in use, exceeding the resident ceiling"
            );
        }
    }

    /// Take a lease. Callers hold the slot lock so eviction never sees the
    /// model idle in between.
    fn lease(&self, loaded: Arc<LoadedModel>, requested_device: ComputeDevice) -> ModelHandle {
        let tick = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        loaded.active_leases.fetch_add(1, Ordering::SeqCst);
        loaded.requests_served.fetch_add(1, Ordering::SeqCst);
        loaded.touch(tick);
        ModelHandle {
            loaded,
            requested_device,
            residency: Arc::clone(&self.residency),
        }
    }

    async fn record_fallback(&self, model: ModelSize, cause: String) {
        if !self.accelerated_failed.swap(true, Ordering::SeqCst) {
            warn!(
                model = %model,
                cause = %cause,
                "Accelerated device failed to initialise, falling back to CPU"
            );
        }

        let mut events = self.fallbacks.write().await;
        if events.len() == FALLBACK_HISTORY {
            events.pop_front();
        }
        events.push_back(FallbackEvent {
            model,
            from: ComputeDevice::Accelerated,
            to: ComputeDevice::Cpu,
            cause,
            at: Utc::now(),
        });
    }
}
