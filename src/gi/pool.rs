//! Fixed-capacity surfel pool, global counters and the spawn candidate
//! buffer.

use std::sync::atomic::{AtomicU32, Ordering};

use super::data::{
    GiCounters, SpawnCandidate, Surfel, FRAME_COUNTERS_OFFSET, FRAME_COUNTERS_SIZE, INDIRECT_ARGS_SIZE,
};

/// One `vec4<f32>` mean per surfel
const MEAN_SNAPSHOT_STRIDE: u64 = 16;

/// GPU surfel pool and the buffers the spawn path appends through
pub struct SurfelPool {
    max_surfels: u32,
    candidate_capacity: u32,
    surfels: wgpu::Buffer,
    /// Surfel means as of the start of the irradiance pass (vec4 per surfel)
    mean_snapshot: wgpu::Buffer,
    counters: wgpu::Buffer,
    candidates: wgpu::Buffer,
    indirect_args: wgpu::Buffer,
}

impl SurfelPool {
    pub fn new(device: &wgpu::Device, max_surfels: u32, candidate_capacity: u32) -> Self {
        let surfels = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("surfel_pool"),
            size: max_surfels.max(1) as u64 * std::mem::size_of::<Surfel>() as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let mean_snapshot = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("surfel_mean_snapshot"),
            size: max_surfels.max(1) as u64 * MEAN_SNAPSHOT_STRIDE,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let counters = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gi_counters"),
            size: std::mem::size_of::<GiCounters>() as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let indirect_args = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gi_indirect_args"),
            size: INDIRECT_ARGS_SIZE,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::INDIRECT | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let pool = Self {
            max_surfels,
            candidate_capacity,
            candidates: Self::create_candidates(device, candidate_capacity),
            surfels,
            mean_snapshot,
            counters,
            indirect_args,
        };
        log::info!(
            "Surfel pool: {} surfels ({:.2} MB), {} spawn candidates",
            max_surfels,
            pool.memory_bytes() as f64 / (1024.0 * 1024.0),
            candidate_capacity
        );
        pool
    }

    fn create_candidates(device: &wgpu::Device, capacity: u32) -> wgpu::Buffer {
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("spawn_candidates"),
            size: capacity.max(1) as u64 * std::mem::size_of::<SpawnCandidate>() as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        })
    }

    /// Reallocate the candidate buffer for a new screen size
    pub fn resize_candidates(&mut self, device: &wgpu::Device, capacity: u32) {
        if capacity != self.candidate_capacity {
            self.candidates = Self::create_candidates(device, capacity);
            self.candidate_capacity = capacity;
            log::debug!("Spawn candidate buffer resized to {}", capacity);
        }
    }

    pub fn max_surfels(&self) -> u32 {
        self.max_surfels
    }

    pub fn candidate_capacity(&self) -> u32 {
        self.candidate_capacity
    }

    pub fn surfels(&self) -> &wgpu::Buffer {
        &self.surfels
    }

    pub fn mean_snapshot(&self) -> &wgpu::Buffer {
        &self.mean_snapshot
    }

    pub fn counters(&self) -> &wgpu::Buffer {
        &self.counters
    }

    pub fn candidates(&self) -> &wgpu::Buffer {
        &self.candidates
    }

    pub fn indirect_args(&self) -> &wgpu::Buffer {
        &self.indirect_args
    }

    /// Zero the candidate, dropped and spawned counters; `surfel_count` persists
    pub fn clear_frame_counters(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.clear_buffer(&self.counters, FRAME_COUNTERS_OFFSET, Some(FRAME_COUNTERS_SIZE));
    }

    /// Empty the pool: every counter and surfel record back to zero
    pub fn reset(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.clear_buffer(&self.counters, 0, None);
        encoder.clear_buffer(&self.surfels, 0, None);
    }

    /// Surfel Data footprint, including the irradiance snapshot
    pub fn memory_bytes(&self) -> u64 {
        self.surfels.size() + self.mean_snapshot.size()
    }
}

/// CPU surfel pool with the same capped atomic reservation as the GPU
pub struct HostSurfelPool {
    max_surfels: u32,
    surfels: Vec<Surfel>,
    surfel_count: AtomicU32,
    candidate_count: AtomicU32,
    dropped_spawns: AtomicU32,
    spawned: AtomicU32,
}

impl HostSurfelPool {
    pub fn new(max_surfels: u32) -> Self {
        Self {
            max_surfels,
            surfels: Vec::new(),
            surfel_count: AtomicU32::new(0),
            candidate_count: AtomicU32::new(0),
            dropped_spawns: AtomicU32::new(0),
            spawned: AtomicU32::new(0),
        }
    }

    pub fn max_surfels(&self) -> u32 {
        self.max_surfels
    }

    /// Live surfels, indexed by pool slot
    pub fn surfels(&self) -> &[Surfel] {
        &self.surfels
    }

    pub fn surfels_mut(&mut self) -> &mut [Surfel] {
        &mut self.surfels
    }

    pub fn len(&self) -> u32 {
        self.surfel_count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim the next free slot, or `None` once the pool is full.
    /// The counter never passes `max_surfels`, even transiently.
    pub fn try_reserve(&self) -> Option<u32> {
        let max = self.max_surfels;
        self.surfel_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| (count < max).then_some(count + 1))
            .ok()
    }

    /// Append slot for a candidate, or `None` past `capacity`
    pub fn try_append_candidate(&self, capacity: u32) -> Option<u32> {
        let slot = self.candidate_count.fetch_add(1, Ordering::Relaxed);
        if slot >= capacity {
            self.record_dropped();
            return None;
        }
        Some(slot)
    }

    pub fn record_dropped(&self) {
        self.dropped_spawns.fetch_add(1, Ordering::Relaxed);
    }

    /// Store surfels into the slots `try_reserve` handed out
    pub fn commit(&mut self, spawned: Vec<(u32, Surfel)>) {
        let count = self.len() as usize;
        self.surfels.resize(count, Surfel::default());
        self.spawned.fetch_add(spawned.len() as u32, Ordering::Relaxed);
        for (slot, surfel) in spawned {
            self.surfels[slot as usize] = surfel;
        }
    }

    pub fn counters(&self) -> GiCounters {
        GiCounters {
            surfel_count: self.surfel_count.load(Ordering::Acquire),
            candidate_count: self.candidate_count.load(Ordering::Relaxed),
            dropped_spawns: self.dropped_spawns.load(Ordering::Relaxed),
            spawned: self.spawned.load(Ordering::Relaxed),
        }
    }

    pub fn clear_frame_counters(&self) {
        self.candidate_count.store(0, Ordering::Relaxed);
        self.dropped_spawns.store(0, Ordering::Relaxed);
        self.spawned.store(0, Ordering::Relaxed);
    }

    pub fn reset(&mut self) {
        self.clear_frame_counters();
        self.surfel_count.store(0, Ordering::Release);
        self.surfels.clear();
    }

    pub fn memory_bytes(&self) -> u64 {
        self.max_surfels as u64 * std::mem::size_of::<Surfel>() as u64
    }
}
