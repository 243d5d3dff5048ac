//! Ownership of the three result surfaces between the compute and graphics sides.

use crate::backend::{ComputeBackend, HostMirrors, gpu::SharedSurfaces};
use crate::error::{DeviceError, DeviceStage};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(2);

/// How the graphics side gets at the result surfaces. Chosen once per engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharingMode {
    /// Graphics binds the compute buffers directly.
    Shared,
    /// Compute buffers are private; `finish` reads them back into host mirrors.
    Mirrored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceOwner {
    Free,
    Compute,
    Graphics,
}

/// The single synchronisation point between the two execution contexts.
#[derive(Debug)]
pub struct SurfaceLock {
    owner: Mutex<SurfaceOwner>,
    released: Condvar,
}

impl Default for SurfaceLock {
    fn default() -> Self {
        Self {
            owner: Mutex::new(SurfaceOwner::Free),
            released: Condvar::new(),
        }
    }
}

impl SurfaceLock {
    pub fn owner(&self) -> SurfaceOwner {
        *self.owner.lock()
    }

    fn acquire_compute(&self, timeout: Duration) -> Result<(), DeviceError> {
        let deadline = Instant::now() + timeout;
        let mut owner = self.owner.lock();
        loop {
            match *owner {
                SurfaceOwner::Free => {
                    *owner = SurfaceOwner::Compute;
                    return Ok(());
                }
                SurfaceOwner::Compute => {
                    return Err(DeviceError::new(
                        DeviceStage::Acquire,
                        "surfaces already held by compute",
                    ));
                }
                SurfaceOwner::Graphics => {
                    if self.released.wait_until(&mut owner, deadline).timed_out()
                        && *owner == SurfaceOwner::Graphics
                    {
                        return Err(DeviceError::new(
                            DeviceStage::Acquire,
                            "timed out waiting for graphics to release the surfaces",
                        ));
                    }
                }
            }
        }
    }

    fn release_compute(&self) -> Result<(), DeviceError> {
        let mut owner = self.owner.lock();
        if *owner != SurfaceOwner::Compute {
            return Err(DeviceError::new(
                DeviceStage::Release,
                format!("release while surfaces are {:?}", *owner),
            ));
        }
        *owner = SurfaceOwner::Free;
        drop(owner);
        self.released.notify_all();
        Ok(())
    }

    /// Graphics-side access, `None` while compute holds the surfaces.
    pub fn read(&self) -> Option<GraphicsAccess<'_>> {
        let mut owner = self.owner.lock();
        (*owner == SurfaceOwner::Free).then(|| {
            *owner = SurfaceOwner::Graphics;
            GraphicsAccess { lock: self }
        })
    }
}

/// Held by the graphics side while it samples the surfaces.
#[derive(Debug)]
pub struct GraphicsAccess<'a> {
    lock: &'a SurfaceLock,
}

impl Drop for GraphicsAccess<'_> {
    fn drop(&mut self) {
        *self.lock.owner.lock() = SurfaceOwner::Free;
        self.lock.released.notify_all();
    }
}

#[derive(Debug)]
pub struct SurfaceBroker {
    mode: SharingMode,
    lock: Arc<SurfaceLock>,
    held: bool,
    acquisitions: u64,
    mirrors: HostMirrors,
    shared: Option<SharedSurfaces>,
}

impl SurfaceBroker {
    /// Falls back to `Mirrored` when `Shared` is requested but the backend cannot share.
    pub fn new(mode: SharingMode, backend: &dyn ComputeBackend) -> Self {
        let mode = match mode {
            SharingMode::Shared if backend.can_share() => SharingMode::Shared,
            _ => SharingMode::Mirrored,
        };
        let shared = match mode {
            SharingMode::Shared => backend.shared_surfaces(),
            SharingMode::Mirrored => None,
        };
        info!("[broker] {} surfaces on {}", mode.describe(), backend.name());
        Self {
            mode,
            lock: Arc::new(SurfaceLock::default()),
            held: false,
            acquisitions: 0,
            mirrors: HostMirrors::new(),
            shared,
        }
    }

    pub fn mode(&self) -> SharingMode {
        self.mode
    }

    pub fn sharing(&self) -> bool {
        self.mode == SharingMode::Shared
    }

    pub fn held(&self) -> bool {
        self.held
    }

    pub fn acquisitions(&self) -> u64 {
        self.acquisitions
    }

    pub fn lock(&self) -> Arc<SurfaceLock> {
        Arc::clone(&self.lock)
    }

    pub fn mirrors(&self) -> &HostMirrors {
        &self.mirrors
    }

    pub fn shared_surfaces(&self) -> Option<&SharedSurfaces> {
        self.shared.as_ref()
    }

    /// Takes the surfaces for compute writes. Never nests.
    pub fn acquire(&mut self, backend: &mut dyn ComputeBackend) -> Result<(), DeviceError> {
        if self.held {
            return Err(DeviceError::new(
                DeviceStage::Acquire,
                "acquire without an intervening release",
            ));
        }
        self.lock.acquire_compute(ACQUIRE_TIMEOUT)?;
        if let Err(err) = backend.acquire_surfaces() {
            let _ = self.lock.release_compute();
            return Err(err);
        }
        self.held = true;
        self.acquisitions += 1;
        Ok(())
    }

    /// Hands the surfaces back to graphics. The lock is given up even if the
    /// backend reports an error, so graphics never waits on a dead batch.
    pub fn release(&mut self, backend: &mut dyn ComputeBackend) -> Result<(), DeviceError> {
        if !self.held {
            return Err(DeviceError::new(
                DeviceStage::Release,
                "release without a matching acquire",
            ));
        }
        let result = backend.release_surfaces();
        self.held = false;
        self.lock.release_compute()?;
        result
    }

    /// Brings the host mirrors up to date. Returns whether they changed.
    pub fn refresh(&mut self, backend: &mut dyn ComputeBackend) -> Result<bool, DeviceError> {
        if self.sharing() {
            return Ok(false);
        }
        backend.read_back(&mut self.mirrors)?;
        debug!("[broker] mirrors refreshed");
        Ok(true)
    }
}

impl SharingMode {
    fn describe(self) -> &'static str {
        match self {
            SharingMode::Shared => "shared",
            SharingMode::Mirrored => "mirrored",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::HostBackend;
    use std::thread;

    #[test]
    fn host_backend_falls_back_to_mirrored() {
        let backend = HostBackend::new();
        let broker = SurfaceBroker::new(SharingMode::Shared, &backend);
        assert_eq!(broker.mode(), SharingMode::Mirrored);
        assert!(broker.shared_surfaces().is_none());
    }

    #[test]
    fn acquire_and_release_pair() {
        let mut backend = HostBackend::new();
        let mut broker = SurfaceBroker::new(SharingMode::Mirrored, &backend);
        broker.acquire(&mut backend).unwrap();
        assert_eq!(broker.lock().owner(), SurfaceOwner::Compute);
        assert_eq!(
            broker.acquire(&mut backend).unwrap_err().stage,
            DeviceStage::Acquire
        );
        broker.release(&mut backend).unwrap();
        assert_eq!(broker.lock().owner(), SurfaceOwner::Free);
        assert_eq!(
            broker.release(&mut backend).unwrap_err().stage,
            DeviceStage::Release
        );
        assert_eq!(broker.acquisitions(), 1);
    }

    #[test]
    fn graphics_cannot_read_while_compute_holds() {
        let mut backend = HostBackend::new();
        let mut broker = SurfaceBroker::new(SharingMode::Mirrored, &backend);
        broker.acquire(&mut backend).unwrap();
        assert!(broker.lock().read().is_none());
        broker.release(&mut backend).unwrap();
        assert!(broker.lock().read().is_some());
    }

    #[test]
    fn compute_waits_for_graphics_release() {
        let mut backend = HostBackend::new();
        let mut broker = SurfaceBroker::new(SharingMode::Mirrored, &backend);
        let lock = broker.lock();
        let reader = thread::spawn(move || {
            let access = lock.read().unwrap();
            thread::sleep(Duration::from_millis(50));
            drop(access);
        });
        // give the reader time to take the surfaces
        while broker.lock().owner() != SurfaceOwner::Graphics {
            thread::yield_now();
        }
        broker.acquire(&mut backend).unwrap();
        assert_eq!(broker.lock().owner(), SurfaceOwner::Compute);
        reader.join().unwrap();
    }

    #[test]
    fn compute_wait_is_bounded_while_graphics_keeps_reading() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let lock = Arc::new(SurfaceLock::default());
        let stop = Arc::new(AtomicBool::new(false));
        let churn = {
            let lock = Arc::clone(&lock);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    if let Some(access) = lock.read() {
                        thread::sleep(Duration::from_millis(5));
                        drop(access);
                    }
                }
            })
        };
        while lock.owner() != SurfaceOwner::Graphics {
            thread::yield_now();
        }

        let started = Instant::now();
        let acquired = lock.acquire_compute(Duration::from_millis(100));
        let waited = started.elapsed();
        stop.store(true, Ordering::Release);
        churn.join().unwrap();

        assert!(waited < Duration::from_secs(1), "waited {waited:?}");
        if acquired.is_ok() {
            lock.release_compute().unwrap();
        } else {
            assert_eq!(acquired.unwrap_err().stage, DeviceStage::Acquire);
        }
        assert_eq!(lock.owner(), SurfaceOwner::Free);
    }

    #[test]
    fn mirrored_refresh_reads_back() {
        let mut backend = HostBackend::new();
        let mut broker = SurfaceBroker::new(SharingMode::Mirrored, &backend);
        assert!(broker.refresh(&mut backend).unwrap());
        assert!(broker.mirrors().is_baseline());
    }
}
