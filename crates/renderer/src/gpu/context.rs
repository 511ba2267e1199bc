use anyhow::{Context as AnyhowContext, Result};

use crate::runtime::AbortFlag;
use crate::types::{BackendChoice, GpuErrorPolicy, RenderSize};

/// Identity of the adapter the context was created on, for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterProfile {
    pub name: String,
    pub backend: wgpu::Backend,
    pub device_type: wgpu::DeviceType,
    pub driver: String,
    pub driver_info: String,
}

impl AdapterProfile {
    fn from_wgpu(info: &wgpu::AdapterInfo) -> Self {
        Self {
            name: info.name.clone(),
            backend: info.backend,
            device_type: info.device_type,
            driver: info.driver.clone(),
            driver_info: info.driver_info.clone(),
        }
    }

    pub fn is_software(&self) -> bool {
        matches!(self.device_type, wgpu::DeviceType::Cpu)
    }
}

/// Headless device and queue. No surface is created; every frame goes into
/// an offscreen render target.
pub(crate) struct HeadlessContext {
    pub _instance: wgpu::Instance,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_profile: AdapterProfile,
}

impl HeadlessContext {
    pub(crate) fn new(
        backend: BackendChoice,
        size: RenderSize,
        policy: GpuErrorPolicy,
        abort: AbortFlag,
    ) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: backend.to_wgpu(),
            flags: wgpu::InstanceFlags::default(),
            memory_budget_thresholds: wgpu::MemoryBudgetThresholds::default(),
            backend_options: wgpu::BackendOptions::default(),
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .with_context(|| format!("failed to find a headless GPU adapter for backend {backend}"))?;

        let adapter_profile = AdapterProfile::from_wgpu(&adapter.get_info());
        tracing::info!(
            name = %adapter_profile.name,
            backend = ?adapter_profile.backend,
            device_type = ?adapter_profile.device_type,
            driver = %adapter_profile.driver,
            driver_info = %adapter_profile.driver_info,
            software = adapter_profile.is_software(),
            "selected GPU adapter"
        );

        let limits = adapter.limits();
        let max_dimension = limits.max_texture_dimension_2d;
        if size.width > max_dimension || size.height > max_dimension {
            anyhow::bail!(
                "GPU max texture dimension is {max_dimension}, requested render target is {size}"
            );
        }

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("toyframe device"),
            required_features: wgpu::Features::empty(),
            required_limits: limits,
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .context("failed to create GPU device")?;

        install_error_handlers(&device, policy, abort);

        Ok(Self {
            _instance: instance,
            device,
            queue,
            adapter_profile,
        })
    }

    /// Blocks until every submission has retired.
    pub(crate) fn wait_idle(&self) {
        if let Err(err) = self.device.poll(wgpu::PollType::Wait) {
            tracing::warn!(error = %err, "failed to wait for GPU idle");
        }
    }
}

/// Routes asynchronous device errors through the configured policy. Device
/// loss always stops the loop.
fn install_error_handlers(device: &wgpu::Device, policy: GpuErrorPolicy, abort: AbortFlag) {
    let error_abort = abort.clone();
    device.on_uncaptured_error(Box::new(move |error: wgpu::Error| match policy {
        GpuErrorPolicy::Ignore => tracing::debug!(%error, "GPU error ignored"),
        GpuErrorPolicy::Warn => tracing::warn!(%error, "GPU error"),
        GpuErrorPolicy::Abort => {
            tracing::error!(%error, "GPU error; stopping render loop");
            error_abort.raise();
        }
    }));

    device.set_device_lost_callback(move |reason, message| {
        tracing::error!(?reason, %message, "GPU device lost");
        abort.raise();
    });
}
