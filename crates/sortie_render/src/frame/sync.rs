use std::collections::VecDeque;
use std::sync::Arc;

use sortie_core::device::{DeviceResult, Fence, GpuDevice, Semaphore};

/// Recycling queues of fences and semaphores.
///
/// Fences handed back through [`Self::free_fence`] must already be reset.
pub struct SyncObjectPool {
    device: Arc<dyn GpuDevice>,
    fences: VecDeque<Fence>,
    semaphores: VecDeque<Semaphore>,
    created_fences: usize,
    created_semaphores: usize,
}

impl SyncObjectPool {
    #[must_use]
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self {
            device,
            fences: VecDeque::new(),
            semaphores: VecDeque::new(),
            created_fences: 0,
            created_semaphores: 0,
        }
    }

    /// An unsignaled fence, recycled when possible.
    pub fn acquire_fence(&mut self) -> DeviceResult<Fence> {
        if let Some(fence) = self.fences.pop_front() {
            return Ok(fence);
        }
        let fence = self.device.create_fence(false)?;
        self.created_fences += 1;
        Ok(fence)
    }

    pub fn acquire_semaphore(&mut self) -> DeviceResult<Semaphore> {
        if let Some(semaphore) = self.semaphores.pop_front() {
            return Ok(semaphore);
        }
        let semaphore = self.device.create_semaphore()?;
        self.created_semaphores += 1;
        Ok(semaphore)
    }

    pub fn free_fence(&mut self, fence: Fence) {
        self.fences.push_back(fence);
    }

    pub fn free_semaphore(&mut self, semaphore: Semaphore) {
        self.semaphores.push_back(semaphore);
    }

    #[must_use]
    pub fn available_fences(&self) -> usize {
        self.fences.len()
    }

    #[must_use]
    pub fn available_semaphores(&self) -> usize {
        self.semaphores.len()
    }

    /// Total fences ever created by this pool.
    #[must_use]
    pub fn created_fences(&self) -> usize {
        self.created_fences
    }

    #[must_use]
    pub fn created_semaphores(&self) -> usize {
        self.created_semaphores
    }

    /// Destroys every queued fence and semaphore.
    pub fn destroy_all(&mut self) {
        for fence in self.fences.drain(..) {
            self.device.destroy_fence(fence);
        }
        for semaphore in self.semaphores.drain(..) {
            self.device.destroy_semaphore(semaphore);
        }
    }
}

impl Drop for SyncObjectPool {
    fn drop(&mut self) {
        self.destroy_all();
    }
}
