//! surfel-gi - headless frame runner
//!
//! Renders the Cornell box G-buffer, runs the GI frame on the GPU (or the
//! CPU mirror with `--cpu`) and writes the selected output as PNG. With
//! `--debug-port` the GI configuration can be changed remotely while frames
//! keep running.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Duration, Instant};

use surfel_gi::core::camera::Camera;
use surfel_gi::core::logging;
use surfel_gi::core::types::{Result, Vec3};
use surfel_gi::gi::{FrameInput, GiConfig, GiStats, GlobalIllumination, HostGi, VisualizeMode};
use surfel_gi::render::readback;
use surfel_gi::render::texture::{GBuffer, GBufferImage};
use surfel_gi::render::GpuContext;
use surfel_gi::scene::{render_gbuffer, Scene, SceneBuffer, SceneConfig};

/// State shared between the frame loop and the debug server
#[derive(Default)]
struct SharedDebugState {
    // Config as last applied by the frame loop (read by GetConfig / Set*)
    config: GiConfig,

    // Overrides (set by debug handler, consumed by frame loop)
    pending_config: Option<GiConfig>,
    reset_requested: bool,
    capture_requested: bool,

    // Updated by frame loop
    stats: surfel_gi_debug::GiStatsInfo,
    capture_data: Option<(u32, u32, String)>,
}

fn lock_state(state: &StdMutex<SharedDebugState>) -> MutexGuard<'_, SharedDebugState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct AppDebugHandler {
    state: Arc<StdMutex<SharedDebugState>>,
}

impl AppDebugHandler {
    /// Edit the newest config (pending or applied) and queue it for the next frame
    fn update_config(&self, description: String, edit: impl FnOnce(&mut GiConfig)) -> surfel_gi_debug::DebugResponse {
        let mut s = lock_state(&self.state);
        let mut config = s.pending_config.clone().unwrap_or_else(|| s.config.clone());
        edit(&mut config);
        if let Err(e) = config.validate() {
            return surfel_gi_debug::DebugResponse::error(e.to_string());
        }
        s.pending_config = Some(config);
        surfel_gi_debug::DebugResponse::updated(description)
    }
}

impl surfel_gi_debug::DebugHandler for AppDebugHandler {
    fn handle_command(&mut self, cmd: surfel_gi_debug::DebugCommand) -> surfel_gi_debug::DebugResponse {
        use surfel_gi_debug::*;

        match cmd {
            DebugCommand::Ping => DebugResponse::pong(),

            DebugCommand::GetGiStats => {
                let s = lock_state(&self.state);
                DebugResponse::ok(ResponseData::GiStats(s.stats.clone()))
            }

            DebugCommand::GetConfig => {
                let s = lock_state(&self.state);
                match serde_json::to_value(&s.config) {
                    Ok(config) => DebugResponse::ok(ResponseData::Config { config }),
                    Err(e) => DebugResponse::error(format!("Failed to encode config: {}", e)),
                }
            }

            DebugCommand::SetMaxSurfels { max_surfels } => {
                self.update_config(format!("max_surfels={} (resets GI)", max_surfels), |c| {
                    c.max_surfels = max_surfels;
                })
            }

            DebugCommand::SetSpawnChance { chance } => {
                self.update_config(format!("spawn_chance={}", chance), |c| c.spawn_chance = chance)
            }

            DebugCommand::SetRayBudget { budget } => {
                self.update_config(format!("ray_budget={}", budget), |c| c.ray_budget = budget)
            }

            DebugCommand::SetToggles { time_driven_updates, multi_bounce, apply_gi } => {
                let mut changes = Vec::new();
                if let Some(v) = time_driven_updates {
                    changes.push(format!("time_driven_updates={}", v));
                }
                if let Some(v) = multi_bounce {
                    changes.push(format!("multi_bounce={}", v));
                }
                if let Some(v) = apply_gi {
                    changes.push(format!("apply_gi={}", v));
                }
                self.update_config(changes.join(", "), |c| {
                    if let Some(v) = time_driven_updates {
                        c.time_driven_updates = v;
                    }
                    if let Some(v) = multi_bounce {
                        c.multi_bounce = v;
                    }
                    if let Some(v) = apply_gi {
                        c.apply_gi = v;
                    }
                })
            }

            DebugCommand::SetBlur { enabled, radius, sigma } => {
                let description = format!("blur enabled={:?} radius={:?} sigma={:?}", enabled, radius, sigma);
                self.update_config(description, |c| {
                    if let Some(v) = enabled {
                        c.blur.enabled = v;
                    }
                    if let Some(v) = radius {
                        c.blur.radius = v;
                    }
                    if let Some(v) = sigma {
                        c.blur.sigma = v;
                    }
                })
            }

            DebugCommand::SetVisualization { mode } => match VisualizeMode::parse(&mode) {
                Some(visualize) => self.update_config(format!("visualize={:?}", visualize), |c| c.visualize = visualize),
                None => DebugResponse::error(format!(
                    "Unknown visualization '{}' (gi_map, coverage, irradiance, surfels, none)",
                    mode
                )),
            },

            DebugCommand::ResetGi => {
                lock_state(&self.state).reset_requested = true;
                DebugResponse::updated("GI reset requested")
            }

            DebugCommand::CaptureOutput => {
                // Request capture
                {
                    let mut s = lock_state(&self.state);
                    s.capture_requested = true;
                    s.capture_data = None;
                }

                // Poll for result (up to 5 seconds, host frames are slow)
                for _ in 0..500 {
                    std::thread::sleep(Duration::from_millis(10));
                    let mut s = lock_state(&self.state);
                    if let Some((width, height, png_base64)) = s.capture_data.take() {
                        s.capture_requested = false;
                        return DebugResponse::ok(ResponseData::Capture { width, height, png_base64 });
                    }
                }

                lock_state(&self.state).capture_requested = false;
                DebugResponse::error("Capture timed out")
            }
        }
    }
}

fn stats_info(stats: &GiStats) -> surfel_gi_debug::GiStatsInfo {
    surfel_gi_debug::GiStatsInfo {
        frame_index: stats.frame_index,
        surfel_count: stats.counters.surfel_count,
        max_surfels: stats.max_surfels,
        candidate_count: stats.counters.candidate_count,
        spawned_last_frame: stats.counters.spawned,
        dropped_spawns: stats.counters.dropped_spawns,
        surfel_memory_mb: stats.surfel_memory_mb(),
        grid_dimension: stats.grid_dimension,
    }
}

/// GPU resources for one scene
struct GpuRunner {
    gpu: GpuContext,
    gi: GlobalIllumination,
    gbuffer: GBuffer,
    scene_buffer: SceneBuffer,
}

/// Where the GI frame runs
enum Backend {
    Gpu(Box<GpuRunner>),
    Host { gi: HostGi, last: Option<Vec<u8>> },
}

impl Backend {
    fn new(cpu: bool, config: GiConfig, scene: &Scene, image: &GBufferImage) -> Result<Self> {
        if cpu {
            log::info!("Running GI on the CPU");
            return Ok(Self::Host { gi: HostGi::new(config)?, last: None });
        }

        let gpu = GpuContext::headless()?;
        let gi = GlobalIllumination::new(&gpu.device, &gpu.queue, config, image.width, image.height)?;
        let gbuffer = GBuffer::from_image(&gpu.device, &gpu.queue, image);
        let layout = SceneBuffer::create_bind_group_layout(&gpu.device);
        let scene_buffer = SceneBuffer::new(&gpu.device, &gpu.queue, &layout, scene);
        log::info!("Scene uploaded: {} primitives", scene_buffer.primitive_count());
        Ok(Self::Gpu(Box::new(GpuRunner { gpu, gi, gbuffer, scene_buffer })))
    }

    fn config(&self) -> &GiConfig {
        match self {
            Self::Gpu(runner) => runner.gi.config(),
            Self::Host { gi, .. } => gi.config(),
        }
    }

    fn set_config(&mut self, config: GiConfig) -> Result<()> {
        match self {
            Self::Gpu(runner) => runner.gi.set_config(config),
            Self::Host { gi, .. } => gi.set_config(config),
        }
    }

    fn reset_gi(&mut self) {
        match self {
            Self::Gpu(runner) => runner.gi.reset_gi(),
            Self::Host { gi, .. } => gi.reset_gi(),
        }
    }

    /// Push the scene's current sun and sky to the GPU (the host path reads `scene` directly)
    fn update_lighting(&self, scene: &Scene) {
        if let Self::Gpu(runner) = self {
            runner.scene_buffer.update_lighting(&runner.gpu.queue, scene);
        }
    }

    fn set_profiling(&mut self, enabled: bool) {
        if let Self::Gpu(runner) = self {
            runner.gi.set_profiling(enabled);
        }
    }

    /// Read back the last frame's stage timings into the profiler history (blocks)
    fn collect_timings(&mut self) {
        if let Self::Gpu(runner) = self {
            runner.gi.read_timings();
        }
    }

    fn run_frame(&mut self, input: &FrameInput<'_>, image: &GBufferImage, scene: &Scene) -> Result<()> {
        match self {
            Self::Gpu(runner) => {
                let mut encoder = runner.gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("gi_frame"),
                });
                runner.gi.generate_gi_map(&mut encoder, &runner.gpu.queue, input, &runner.gbuffer, &runner.scene_buffer)?;
                runner.gpu.queue.submit(std::iter::once(encoder.finish()));
            }
            Self::Host { gi, last } => {
                let frame = gi.generate_gi_map(input, image, scene);
                *last = Some(frame.to_rgba8(gi.config().visualize));
            }
        }
        Ok(())
    }

    fn stats(&self) -> Result<GiStats> {
        match self {
            Self::Gpu(runner) => runner.gi.stats(),
            Self::Host { gi, .. } => Ok(gi.stats()),
        }
    }

    /// Block until every submitted GI frame has finished
    fn wait_idle(&self) -> Result<()> {
        match self {
            Self::Gpu(runner) => runner.gpu.wait_idle(),
            Self::Host { .. } => Ok(()),
        }
    }

    /// Selected output of the last frame as RGBA8
    fn output_rgba8(&self) -> Result<Vec<u8>> {
        match self {
            Self::Gpu(runner) => runner.gi.read_output_rgba8(),
            Self::Host { last, .. } => Ok(last.clone().unwrap_or_default()),
        }
    }

    fn log_timings(&self) {
        if let Self::Gpu(runner) = self
            && let Some(profiler) = runner.gi.profiler()
        {
            let t = profiler.average_timings();
            log::info!(
                "GPU timings (avg): coverage {:.3}ms, spawn {:.3}ms, grid {:.3}ms, irradiance {:.3}ms, resolve {:.3}ms (total {:.3}ms)",
                t.coverage_ms,
                t.spawn_ms,
                t.grid_ms,
                t.irradiance_ms,
                t.resolve_ms,
                t.total_gpu_ms
            );
        }
    }
}

/// Apply requests queued by the debug handler and publish fresh state
fn sync_debug_state(state: &StdMutex<SharedDebugState>, backend: &mut Backend) {
    let (pending, reset) = {
        let mut s = lock_state(state);
        (s.pending_config.take(), std::mem::take(&mut s.reset_requested))
    };
    if let Some(config) = pending
        && let Err(e) = backend.set_config(config)
    {
        log::error!("Rejected GI config from debug client: {}", e);
    }
    if reset {
        backend.reset_gi();
    }
    lock_state(state).config = backend.config().clone();
}

fn publish_frame(state: &StdMutex<SharedDebugState>, backend: &Backend, width: u32, height: u32) {
    let capture_requested = {
        let mut s = lock_state(state);
        match backend.stats() {
            Ok(stats) => s.stats = stats_info(&stats),
            Err(e) => log::warn!("Failed to read GI stats: {}", e),
        }
        s.capture_requested
    };
    if !capture_requested {
        return;
    }
    let capture = backend
        .output_rgba8()
        .and_then(|rgba8| readback::png_base64(&rgba8, width, height));
    match capture {
        Ok(png) => lock_state(state).capture_data = Some((width, height, png)),
        Err(e) => log::error!("Capture failed: {}", e),
    }
}

fn write_output(backend: &Backend, dir: &Path, frame: u64, width: u32, height: u32) -> Result<()> {
    let mode = backend.config().visualize;
    let name = format!("frame_{:04}_{:?}.png", frame, mode).to_lowercase();
    readback::write_png(&dir.join(name), &backend.output_rgba8()?, width, height)
}

fn run(args: &[String]) -> Result<()> {
    let config = match parse_str_arg(args, "--config") {
        Some(path) => {
            log::info!("Loading GI config from {}", path);
            GiConfig::load(Path::new(&path))?
        }
        None => GiConfig::default(),
    };
    let frames = parse_u32_arg(args, "--frames").unwrap_or(16);
    let width = parse_u32_arg(args, "--width").unwrap_or(640);
    let height = parse_u32_arg(args, "--height").unwrap_or(480);
    let output = PathBuf::from(parse_str_arg(args, "--output").unwrap_or_else(|| "output".into()));
    let cpu = args.iter().any(|a| a == "--cpu");
    let sun_speed = parse_f32_arg(args, "--sun-speed").unwrap_or(0.0);
    let profile = args.iter().any(|a| a == "--profile");
    let debug_port = args
        .iter()
        .any(|a| a == "--debug-port")
        .then(|| parse_u16_arg(args, "--debug-port").unwrap_or(surfel_gi_debug::DEFAULT_PORT));

    std::fs::create_dir_all(&output)?;

    let mut scene = Scene::cornell_box(SceneConfig::default());
    let base_time_of_day = scene.lighting.time_of_day;
    let mut camera = Camera::look_at(Vec3::new(0.0, 0.0, 11.0), Vec3::ZERO, Vec3::Y);
    camera.set_aspect(width as f32, height as f32);

    let start = Instant::now();
    let image = render_gbuffer(&scene, &camera, width, height);
    log::info!("G-buffer {}x{} rendered in {:.1}ms", width, height, start.elapsed().as_secs_f32() * 1000.0);

    let mut backend = Backend::new(cpu, config, &scene, &image)?;
    backend.set_profiling(profile);

    let debug_state = Arc::new(StdMutex::new(SharedDebugState {
        config: backend.config().clone(),
        ..Default::default()
    }));
    if let Some(port) = debug_port {
        start_debug_server(debug_state.clone(), port);
    }

    // With a debug client attached, --frames 0 runs until killed
    let mut frame: u64 = 0;
    while (frames == 0 && debug_port.is_some()) || frame < frames as u64 {
        sync_debug_state(&debug_state, &mut backend);

        let time = start.elapsed().as_secs_f32();
        if sun_speed != 0.0 {
            scene.lighting.time_of_day = (base_time_of_day + sun_speed * time).rem_euclid(24.0);
            backend.update_lighting(&scene);
        }

        let input = FrameInput { camera: &camera, time };
        let frame_start = Instant::now();
        backend.run_frame(&input, &image, &scene)?;

        // Counter readback blocks on the GPU
        if log::log_enabled!(log::Level::Debug) {
            let stats = backend.stats()?;
            log::debug!(
                "Frame {}: {} surfels, {} spawned, {} dropped ({:.1}ms)",
                frame,
                stats.counters.surfel_count,
                stats.counters.spawned,
                stats.counters.dropped_spawns,
                frame_start.elapsed().as_secs_f32() * 1000.0
            );
        }

        if profile {
            backend.collect_timings();
        }
        if debug_port.is_some() {
            publish_frame(&debug_state, &backend, width, height);
        }
        frame += 1;
    }

    if frames > 0 {
        backend.wait_idle()?;
        if profile {
            backend.log_timings();
        }
        write_output(&backend, &output, frame, width, height)?;
        let stats = backend.stats()?;
        log::info!(
            "Done: {} frames, {}/{} surfels ({:.1}MB), {:.2}s",
            frame,
            stats.counters.surfel_count,
            stats.max_surfels,
            stats.surfel_memory_mb(),
            start.elapsed().as_secs_f32()
        );
    }
    Ok(())
}

/// Serve the debug protocol from a background tokio runtime
fn start_debug_server(state: Arc<StdMutex<SharedDebugState>>, port: u16) {
    std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => {
                log::error!("Failed to create tokio runtime: {}", e);
                return;
            }
        };
        rt.block_on(async {
            let handler = Arc::new(tokio::sync::Mutex::new(AppDebugHandler { state }));
            let _server = surfel_gi_debug::DebugServer::start(handler, port);
            log::info!("Debug server started on port {}", port);
            // Keep runtime alive forever
            loop {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        });
    });
}

fn main() {
    logging::init();
    log::info!("surfel-gi starting...");

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return;
    }

    if let Err(e) = run(&args) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn print_usage() {
    println!("Usage: surfel-gi [options]");
    println!();
    println!("  --config <file.json>   GI configuration (defaults if omitted)");
    println!("  --frames <n>           Frames to run (default 16, 0 = forever with --debug-port)");
    println!("  --width <px>           Output width (default 640)");
    println!("  --height <px>          Output height (default 480)");
    println!("  --output <dir>         Directory for PNG output (default ./output)");
    println!("  --cpu                  Run the CPU mirror instead of the GPU");
    println!("  --sun-speed <h/s>      Animate the sun (hours of day per second)");
    println!("  --profile              Collect per-stage GPU timings every frame");
    println!("  --debug-port <port>    Serve the JSON debug protocol (default port {})", surfel_gi_debug::DEFAULT_PORT);
}

fn parse_u32_arg(args: &[String], flag: &str) -> Option<u32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_f32_arg(args: &[String], flag: &str) -> Option<f32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_u16_arg(args: &[String], flag: &str) -> Option<u16> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use surfel_gi_debug::{DebugCommand, DebugHandler, DebugResponse, ResponseData};

    fn handler() -> AppDebugHandler {
        AppDebugHandler { state: Arc::new(StdMutex::new(SharedDebugState::default())) }
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args() {
        let a = args(&["surfel-gi", "--frames", "8", "--output", "out", "--debug-port", "9750"]);
        assert_eq!(parse_u32_arg(&a, "--frames"), Some(8));
        assert_eq!(parse_str_arg(&a, "--output").as_deref(), Some("out"));
        assert_eq!(parse_u16_arg(&a, "--debug-port"), Some(9750));
        assert_eq!(parse_u32_arg(&a, "--width"), None);
        assert_eq!(parse_u32_arg(&args(&["surfel-gi", "--frames"]), "--frames"), None);
    }

    #[test]
    fn test_set_commands_queue_config() {
        let mut h = handler();
        h.handle_command(DebugCommand::SetSpawnChance { chance: 0.75 });
        h.handle_command(DebugCommand::SetBlur { enabled: Some(false), radius: None, sigma: Some(3.0) });

        let s = lock_state(&h.state);
        let pending = s.pending_config.as_ref().unwrap();
        assert_eq!(pending.spawn_chance, 0.75);
        assert!(!pending.blur.enabled);
        assert_eq!(pending.blur.sigma, 3.0);
        assert_eq!(pending.blur.radius, GiConfig::default().blur.radius);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut h = handler();
        let response = h.handle_command(DebugCommand::SetSpawnChance { chance: 2.0 });
        assert!(matches!(response, DebugResponse::Error { .. }));
        assert!(lock_state(&h.state).pending_config.is_none());

        let response = h.handle_command(DebugCommand::SetVisualization { mode: "wireframe".into() });
        assert!(matches!(response, DebugResponse::Error { .. }));
    }

    #[test]
    fn test_host_backend_applies_debug_requests() {
        let h = handler();
        let config = GiConfig { max_surfels: 256, spawn_chance: 1.0, ..Default::default() };
        let mut scene = Scene::cornell_box(SceneConfig::default());
    let base_time_of_day = scene.lighting.time_of_day;
        let camera = Camera::look_at(Vec3::new(0.0, 0.0, 11.0), Vec3::ZERO, Vec3::Y);
        let image = render_gbuffer(&scene, &camera, 32, 32);
        let mut backend = Backend::new(true, config, &scene, &image).unwrap();

        let input = FrameInput { camera: &camera, time: 0.0 };
        backend.run_frame(&input, &image, &scene).unwrap();
        publish_frame(&h.state, &backend, 32, 32);
        assert_eq!(lock_state(&h.state).stats.frame_index, 1);
        assert!(lock_state(&h.state).stats.surfel_count > 0);

        let mut h2 = AppDebugHandler { state: h.state.clone() };
        h2.handle_command(DebugCommand::SetMaxSurfels { max_surfels: 128 });
        sync_debug_state(&h.state, &mut backend);
        assert_eq!(backend.config().max_surfels, 128);
        assert_eq!(backend.stats().unwrap().counters.surfel_count, 0);

        backend.run_frame(&input, &image, &scene).unwrap();
        h2.handle_command(DebugCommand::ResetGi);
        sync_debug_state(&h.state, &mut backend);
        assert_eq!(backend.stats().unwrap().frame_index, 0);

        let response = h2.handle_command(DebugCommand::GetConfig);
        match response {
            DebugResponse::Ok { data: ResponseData::Config { config } } => {
                assert_eq!(config["max_surfels"], 128);
            }
            other => panic!("unexpected response {:?}", other),
        }
    }
}
