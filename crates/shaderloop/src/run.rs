use std::path::Path;
use std::thread;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use image::RgbaImage;
use loopconfig::LoopConfig;
use renderer::{
    BoxedTimeSource, FrameOrchestrator, GpuPowerPreference, RequestQueue, RuntimeRequest,
    ShaderError, SteppedTimeSource, SystemTimeSource, UniformValue, WgpuBackend,
};
use tracing_subscriber::EnvFilter;

use crate::cli::{CheckArgs, RunArgs};
use crate::paths::AppPaths;
use crate::session::SessionPlan;
use crate::watch::{FileWatcher, WatchedFile};

type Orchestrator = FrameOrchestrator<WgpuBackend>;

/// Identity the built-in checkerboard renders under when no shader is given.
const DEFAULT_IDENTITY: &str = "default";

pub fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

pub fn run(args: RunArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let plan = SessionPlan::resolve(args, config)?;
    tracing::debug!(?plan, "resolved session");

    let mut gpu = WgpuBackend::new(plan.power).context("failed to initialise the GPU")?;
    tracing::info!(adapter = %gpu.adapter_profile(), "gpu ready");
    if gpu.adapter_profile().is_software() {
        tracing::warn!("rendering on a software adapter; expect low frame rates");
    }

    let mut orchestrator =
        Orchestrator::new(&mut gpu).context("failed to create the renderer core")?;
    let result = drive(&mut gpu, &mut orchestrator, &plan);
    orchestrator.teardown(&mut gpu);
    let (textures, programs, targets) = gpu.live_resources();
    tracing::debug!(textures, programs, targets, "gpu resources after teardown");
    result
}

pub fn check(args: CheckArgs) -> Result<()> {
    let mut gpu = WgpuBackend::new(GpuPowerPreference::Low)
        .context("failed to initialise the GPU")?;
    let mut orchestrator =
        Orchestrator::new(&mut gpu).context("failed to create the renderer core")?;
    let identity = shader_identity(&args.shader);
    let result = orchestrator.load_shader_file(&mut gpu, identity, &args.shader);
    orchestrator.teardown(&mut gpu);

    match result {
        Ok(log) => {
            println!("{}: ok", args.shader.display());
            if !log.trim().is_empty() {
                println!("{}", log.trim_end());
            }
            Ok(())
        }
        Err(ShaderError::Io { source, .. }) => Err(source)
            .with_context(|| format!("failed to read shader {}", args.shader.display())),
        Err(err) => {
            eprintln!("{err}");
            if let ShaderError::Include { source, .. } = &err {
                eprintln!("{source}");
            }
            bail!("{} failed to compile", args.shader.display())
        }
    }
}

pub fn print_paths() -> Result<()> {
    let paths = AppPaths::discover()?;
    let config_file = paths.config_file();
    println!("Configuration:");
    println!("  config dir:  {}", paths.config_dir().display());
    println!(
        "  config file: {} ({})",
        config_file.display(),
        if config_file.exists() { "present" } else { "missing" }
    );
    Ok(())
}

/// An explicit `--config` must exist; the default location is optional.
fn load_config(explicit: Option<&Path>) -> Result<Option<LoopConfig>> {
    if let Some(path) = explicit {
        let config = LoopConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?;
        return Ok(Some(config));
    }

    let default_path = AppPaths::discover()?.config_file();
    if !default_path.exists() {
        return Ok(None);
    }
    let config = LoopConfig::load(&default_path)
        .with_context(|| format!("failed to load config {}", default_path.display()))?;
    tracing::debug!(path = %default_path.display(), "loaded default config");
    Ok(Some(config))
}

fn shader_identity(path: &Path) -> String {
    path.display().to_string()
}

fn drive(gpu: &mut WgpuBackend, orchestrator: &mut Orchestrator, plan: &SessionPlan) -> Result<()> {
    let (width, height) = plan.size;
    orchestrator
        .update_surface_size(gpu, width, height)
        .context("failed to allocate the feedback surface")?;

    let identity = match &plan.shader {
        Some(path) => {
            let identity = shader_identity(path);
            match orchestrator.load_shader_file(gpu, identity.clone(), path) {
                Ok(log) => tracing::debug!(identity = %identity, log = %log, "shader compiled"),
                Err(ShaderError::Io { source, .. }) => {
                    return Err(source)
                        .with_context(|| format!("failed to read shader {}", path.display()));
                }
                Err(err) => tracing::error!(
                    error = %err,
                    log = %err.log(),
                    "shader failed to build; rendering the default shader"
                ),
            }
            identity
        }
        None => DEFAULT_IDENTITY.to_string(),
    };
    orchestrator.activate_shader(gpu, &identity);

    for (name, path) in &plan.textures {
        if !orchestrator.add_texture(gpu, name.clone(), path) {
            tracing::warn!(texture = %name, path = %path.display(), "texture skipped");
        }
    }

    let queue = RequestQueue::new();
    let watcher = if plan.watch {
        Some(FileWatcher::spawn(
            watched_files(plan, &identity),
            plan.watch_interval,
            queue.sender(),
        )?)
    } else {
        None
    };

    let mut time: BoxedTimeSource = if plan.watch {
        Box::new(SystemTimeSource::new())
    } else {
        Box::new(SteppedTimeSource::new(0.0, plan.frame_rate))
    };
    let frame_interval = plan.frame_interval();
    let mut capture: Option<RgbaImage> = None;
    let mut frame: u32 = 0;

    while plan.frames == 0 || frame < plan.frames {
        let started = Instant::now();
        orchestrator
            .apply_requests(gpu, &queue)
            .context("failed to apply queued requests")?;

        let sample = time.sample();
        orchestrator.set_uniform(gpu, "iTime", sample.seconds)?;
        orchestrator.set_uniform(gpu, "iFrame", UniformValue::Int(sample.frame_index as i32))?;
        orchestrator.set_uniform(gpu, "iResolution", (width as f32, height as f32, 1.0_f32))?;
        for (name, value) in &plan.uniforms {
            orchestrator.set_uniform(gpu, name, *value)?;
        }

        orchestrator
            .update(gpu)
            .with_context(|| format!("frame {frame} failed to render"))?;

        let last = plan.frames != 0 && frame + 1 == plan.frames;
        if last && plan.export.is_some() {
            orchestrator.composite(gpu, width, height)?;
            capture = Some(orchestrator.screenshot(gpu)?);
            orchestrator.swap_buffers();
        } else {
            orchestrator.draw(gpu, width, height)?;
        }

        tracing::trace!(
            frame,
            gpu_ms = orchestrator.update_time().as_secs_f64() * 1000.0,
            "frame rendered"
        );
        frame = frame.saturating_add(1);

        if plan.watch {
            thread::sleep(frame_interval.saturating_sub(started.elapsed()));
        }
    }

    if let Some(watcher) = watcher {
        watcher.stop();
    }

    if let (Some(image), Some(path)) = (capture, plan.export.as_ref()) {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        image
            .save_with_format(path, image::ImageFormat::Png)
            .with_context(|| format!("failed to write screenshot to {}", path.display()))?;
        tracing::info!(path = %path.display(), frames = frame, "screenshot exported");
    }

    Ok(())
}

fn watched_files(plan: &SessionPlan, identity: &str) -> Vec<WatchedFile> {
    let shader = plan.shader.iter().map(|path| WatchedFile {
        path: path.clone(),
        request: RuntimeRequest::ReloadShader {
            identity: identity.to_string(),
            path: path.clone(),
        },
    });
    let textures = plan.textures.iter().map(|(name, path)| WatchedFile {
        path: path.clone(),
        request: RuntimeRequest::AddTexture {
            identity: name.clone(),
            path: path.clone(),
        },
    });
    shader.chain(textures).collect()
}
