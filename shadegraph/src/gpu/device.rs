//! Process-wide shared GPU device.
//!
//! The device, queue, pipeline caches and the dispatch-serialization lock
//! live in one [`SharedGpu`] singleton. A capacity-one lock guards all GPU
//! work so overlapping runs never interleave bind-group validation. On
//! device loss the cached singleton is invalidated and the next
//! acquisition requests a fresh adapter; tests reset between suites via
//! [`reset_shared_gpu`].

use crate::core::error::{ShadeError, ShadeResult};
use crate::gpu::cache::ShaderCaches;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

static SHARED: Mutex<Option<Arc<SharedGpu>>> = Mutex::new(None);

/// The shared device plus everything scoped to its lifetime.
pub struct SharedGpu {
    /// The wgpu device.
    pub device: wgpu::Device,
    /// Its submission queue.
    pub queue: wgpu::Queue,
    pub(crate) caches: Mutex<ShaderCaches>,
    serialize: Mutex<()>,
    lost: Arc<AtomicBool>,
}

impl std::fmt::Debug for SharedGpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedGpu")
            .field("lost", &self.is_lost())
            .finish()
    }
}

impl SharedGpu {
    /// Takes the dispatch-serialization lock. Acquisition is first-come;
    /// a poisoned lock (a panicking test) is recovered rather than
    /// propagated.
    pub(crate) fn acquire(&self) -> MutexGuard<'_, ()> {
        self.serialize.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True once the device reported loss.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }
}

/// Returns the shared device, acquiring one on first use or after loss.
pub async fn shared_gpu() -> ShadeResult<Arc<SharedGpu>> {
    if let Some(gpu) = SHARED.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
        if !gpu.is_lost() {
            return Ok(gpu.clone());
        }
        log::warn!("shared GPU device was lost, re-acquiring");
    }

    let instance = wgpu::Instance::default();
    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions::default())
        .await
        .ok_or_else(|| ShadeError::Gpu("no suitable GPU adapter available".to_string()))?;
    log::debug!("acquired adapter: {:?}", adapter.get_info());

    let (device, queue) = adapter
        .request_device(
            &wgpu::DeviceDescriptor {
                label: Some("shadegraph"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
                memory_hints: wgpu::MemoryHints::default(),
            },
            None,
        )
        .await
        .map_err(|e| ShadeError::Gpu(format!("device request failed: {e}")))?;

    let lost = Arc::new(AtomicBool::new(false));
    {
        let lost = lost.clone();
        device.set_device_lost_callback(move |reason, message| {
            log::error!("GPU device lost ({reason:?}): {message}");
            lost.store(true, Ordering::Release);
        });
    }
    device.on_uncaptured_error(Box::new(|error| {
        log::error!("uncaptured wgpu error: {error}");
    }));

    let gpu = Arc::new(SharedGpu {
        device,
        queue,
        caches: Mutex::new(ShaderCaches::default()),
        serialize: Mutex::new(()),
        lost,
    });
    *SHARED.lock().unwrap_or_else(|e| e.into_inner()) = Some(gpu.clone());
    Ok(gpu)
}

/// Drops the cached device so the next [`shared_gpu`] re-acquires one.
/// Compiled modules and pipelines go with it.
pub fn reset_shared_gpu() {
    *SHARED.lock().unwrap_or_else(|e| e.into_inner()) = None;
}
