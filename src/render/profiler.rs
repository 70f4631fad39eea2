//! GPU profiling of the GI stages using wgpu timestamp queries

/// Per-stage GPU timing data (in milliseconds)
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct GiTimings {
    pub coverage_ms: f32,
    pub spawn_ms: f32,
    pub grid_ms: f32,
    pub irradiance_ms: f32,
    pub resolve_ms: f32,
    pub total_gpu_ms: f32,
}

/// Timed stages, in frame order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GiStage {
    Coverage = 0,
    Spawn = 1,
    Grid = 2,
    Irradiance = 3,
    Resolve = 4,
}

/// Where in a multi-pass stage a compute pass sits
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageSpan {
    /// Stage is a single pass
    Whole,
    /// First pass of a stage (writes the begin timestamp)
    Begin,
    /// Last pass of a stage (writes the end timestamp)
    End,
}

const NUM_STAGES: u32 = 5;
const TIMESTAMPS_PER_STAGE: u32 = 2; // begin + end
const TOTAL_TIMESTAMPS: u32 = NUM_STAGES * TIMESTAMPS_PER_STAGE;

/// GPU profiler using timestamp queries
pub struct GpuProfiler {
    enabled: bool,
    query_set: wgpu::QuerySet,
    resolve_buffer: wgpu::Buffer,
    read_buffer: wgpu::Buffer,
    timestamp_period: f32,
    latest_timings: GiTimings,
    frame_timings: std::collections::VecDeque<GiTimings>,
    max_history: usize,
}

impl GpuProfiler {
    /// Returns `None` when the device was created without `TIMESTAMP_QUERY`
    pub fn new(device: &wgpu::Device, queue: &wgpu::Queue) -> Option<Self> {
        if !device.features().contains(wgpu::Features::TIMESTAMP_QUERY) {
            log::info!("Timestamp queries unavailable, GI profiling disabled");
            return None;
        }

        let query_set = device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some("gi_profiler_queries"),
            ty: wgpu::QueryType::Timestamp,
            count: TOTAL_TIMESTAMPS,
        });

        let buffer_size = (TOTAL_TIMESTAMPS as u64) * std::mem::size_of::<u64>() as u64;

        let resolve_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gi_profiler_resolve"),
            size: buffer_size,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let read_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gi_profiler_read"),
            size: buffer_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Some(Self {
            enabled: true,
            query_set,
            resolve_buffer,
            read_buffer,
            timestamp_period: queue.get_timestamp_period(),
            latest_timings: GiTimings::default(),
            frame_timings: std::collections::VecDeque::new(),
            max_history: 60,
        })
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Timestamp writes for a compute pass belonging to `stage`
    pub fn timestamp_writes(&self, stage: GiStage, span: StageSpan) -> Option<wgpu::ComputePassTimestampWrites<'_>> {
        if !self.enabled {
            return None;
        }
        let base = stage as u32 * TIMESTAMPS_PER_STAGE;
        let (begin, end) = match span {
            StageSpan::Whole => (Some(base), Some(base + 1)),
            StageSpan::Begin => (Some(base), None),
            StageSpan::End => (None, Some(base + 1)),
        };
        Some(wgpu::ComputePassTimestampWrites {
            query_set: &self.query_set,
            beginning_of_pass_write_index: begin,
            end_of_pass_write_index: end,
        })
    }

    /// Resolve queries and copy to readable buffer. Call after all passes, before submit.
    pub fn resolve(&self, encoder: &mut wgpu::CommandEncoder) {
        if !self.enabled {
            return;
        }
        encoder.resolve_query_set(&self.query_set, 0..TOTAL_TIMESTAMPS, &self.resolve_buffer, 0);
        encoder.copy_buffer_to_buffer(
            &self.resolve_buffer, 0,
            &self.read_buffer, 0,
            (TOTAL_TIMESTAMPS as u64) * std::mem::size_of::<u64>() as u64,
        );
    }

    /// Read back the last submitted frame's timestamps (blocks on the device)
    pub fn read_results(&mut self, device: &wgpu::Device) {
        if !self.enabled {
            return;
        }

        let buffer_slice = self.read_buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });

        device.poll(wgpu::PollType::Wait { submission_index: None, timeout: None }).ok();

        if let Ok(Ok(())) = rx.try_recv() {
            let data = buffer_slice.get_mapped_range();
            let timestamps: &[u64] = bytemuck::cast_slice(&data);

            if timestamps.len() >= TOTAL_TIMESTAMPS as usize {
                let timings = timings_from_ticks(timestamps, self.timestamp_period);
                self.frame_timings.push_back(timings);
                if self.frame_timings.len() > self.max_history {
                    self.frame_timings.pop_front();
                }
                self.latest_timings = timings;
            }

            drop(data);
            self.read_buffer.unmap();
        }
    }

    pub fn latest_timings(&self) -> GiTimings {
        self.latest_timings
    }

    /// Averaged timings over the history window
    pub fn average_timings(&self) -> GiTimings {
        average(self.frame_timings.iter())
    }
}

fn timings_from_ticks(timestamps: &[u64], ns_per_tick: f32) -> GiTimings {
    let ns_per_tick = ns_per_tick as f64;
    let ms = |begin: u64, end: u64| -> f32 {
        ((end.wrapping_sub(begin)) as f64 * ns_per_tick / 1_000_000.0) as f32
    };
    GiTimings {
        coverage_ms: ms(timestamps[0], timestamps[1]),
        spawn_ms: ms(timestamps[2], timestamps[3]),
        grid_ms: ms(timestamps[4], timestamps[5]),
        irradiance_ms: ms(timestamps[6], timestamps[7]),
        resolve_ms: ms(timestamps[8], timestamps[9]),
        total_gpu_ms: ms(timestamps[0], timestamps[9]),
    }
}

fn average<'a>(timings: impl ExactSizeIterator<Item = &'a GiTimings>) -> GiTimings {
    let n = timings.len();
    if n == 0 {
        return GiTimings::default();
    }
    let mut avg = GiTimings::default();
    for t in timings {
        avg.coverage_ms += t.coverage_ms;
        avg.spawn_ms += t.spawn_ms;
        avg.grid_ms += t.grid_ms;
        avg.irradiance_ms += t.irradiance_ms;
        avg.resolve_ms += t.resolve_ms;
        avg.total_gpu_ms += t.total_gpu_ms;
    }
    let n = n as f32;
    avg.coverage_ms /= n;
    avg.spawn_ms /= n;
    avg.grid_ms /= n;
    avg.irradiance_ms /= n;
    avg.resolve_ms /= n;
    avg.total_gpu_ms /= n;
    avg
}
