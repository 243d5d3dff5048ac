//! Compute device discovery and capability scoring.

use crate::error::EngineError;
use iced_wgpu::wgpu;
use std::fmt;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

pub const GPU_BONUS: u32 = 1000;
pub const SHARING_BONUS: u32 = 500;
pub const VENDOR_BONUS: u32 = 500;
/// Memory bonus ceiling, in KiB of local memory.
pub const MEMORY_BONUS_CAP: u32 = 256;

/// Workgroup memory the FFT kernel needs for one 1024-point transform.
const FFT_WORKGROUP_BYTES: u32 = 8 * 1024;

static ADVANCED_COMPUTE: OnceLock<bool> = OnceLock::new();

/// Whether the selected device offers the full compute path. Written once per process.
pub fn advanced_compute() -> bool {
    ADVANCED_COMPUTE.get().copied().unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Gpu,
    Cpu,
    Other,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceKind::Gpu => "GPU",
            DeviceKind::Cpu => "CPU",
            DeviceKind::Other => "other",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Result buffers can be bound directly by the graphics side.
    pub shared_buffers: bool,
    /// Compute shaders with enough workgroup resources for the FFT kernel.
    pub compute: bool,
    pub atomics: bool,
    pub images: bool,
}

impl Capabilities {
    /// At least one adequate path for the histogram accumulation.
    pub fn qualifies(&self) -> bool {
        (self.compute && self.atomics) || self.images
    }
}

/// One enumerated compute device. Never mutated after discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCandidate {
    pub platform: usize,
    pub device: usize,
    pub kind: DeviceKind,
    pub vendor: String,
    pub vendor_id: u32,
    pub name: String,
    /// Local memory in bytes.
    pub local_mem: u64,
    pub caps: Capabilities,
}

impl DeviceCandidate {
    /// Zero-copy sharing needs a GPU that advertises it; CPU devices never qualify.
    pub fn supports_sharing(&self) -> bool {
        self.kind == DeviceKind::Gpu && self.caps.shared_buffers
    }
}

/// Vendors that earn a scoring bonus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorPolicy {
    pub preferred: Vec<u32>,
}

impl Default for VendorPolicy {
    fn default() -> Self {
        // NVIDIA, AMD
        Self {
            preferred: vec![0x10de, 0x1002],
        }
    }
}

impl VendorPolicy {
    pub fn none() -> Self {
        Self {
            preferred: Vec::new(),
        }
    }

    pub fn prefers(&self, vendor_id: u32) -> bool {
        self.preferred.contains(&vendor_id)
    }
}

/// Explicit `platform:device` selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceOverride {
    pub platform: usize,
    pub device: usize,
}

impl DeviceOverride {
    pub fn parse(value: &str) -> Option<Self> {
        let (platform, device) = value.trim().split_once(':')?;
        Some(Self {
            platform: platform.trim().parse().ok()?,
            device: device.trim().parse().ok()?,
        })
    }
}

/// `None` means the device is rejected.
pub fn score(candidate: &DeviceCandidate, policy: &VendorPolicy) -> Option<u32> {
    if !candidate.caps.qualifies() {
        return None;
    }
    let mut score = 0;
    if candidate.kind == DeviceKind::Gpu {
        score += GPU_BONUS;
        if candidate.caps.shared_buffers {
            score += SHARING_BONUS;
        }
    }
    if policy.prefers(candidate.vendor_id) {
        score += VENDOR_BONUS;
    }
    let kib = u32::try_from(candidate.local_mem >> 10).unwrap_or(u32::MAX);
    Some(score + kib.min(MEMORY_BONUS_CAP))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub index: usize,
    pub candidate: DeviceCandidate,
    pub score: Option<u32>,
    pub forced: bool,
}

impl Selection {
    pub fn sharing(&self) -> bool {
        self.candidate.supports_sharing()
    }
}

/// Picks the device to run on. Every candidate is scored and logged first,
/// even when `forced` names one explicitly.
pub fn select(
    candidates: &[DeviceCandidate],
    policy: &VendorPolicy,
    forced: Option<&str>,
) -> Result<Selection, EngineError> {
    let scores: Vec<Option<u32>> = candidates.iter().map(|c| score(c, policy)).collect();
    for (candidate, score) in candidates.iter().zip(&scores) {
        debug!(
            "[device] {}:{} {} '{}' ({}) caps={:?} score={}",
            candidate.platform,
            candidate.device,
            candidate.kind,
            candidate.name,
            candidate.vendor,
            candidate.caps,
            score.map_or_else(|| "rejected".to_string(), |s| s.to_string()),
        );
    }

    if let Some(raw) = forced {
        match DeviceOverride::parse(raw) {
            Some(wanted) => {
                let hit = candidates
                    .iter()
                    .position(|c| c.platform == wanted.platform && c.device == wanted.device);
                match hit {
                    Some(index) => {
                        if scores[index].is_none() {
                            warn!(
                                "[device] forced device {raw} lacks the minimum compute features"
                            );
                        }
                        return Ok(record(Selection {
                            index,
                            candidate: candidates[index].clone(),
                            score: scores[index],
                            forced: true,
                        }));
                    }
                    None => warn!("[device] forced device {raw} does not exist, scoring instead"),
                }
            }
            None => warn!("[device] malformed device override '{raw}', scoring instead"),
        }
    }

    let mut best: Option<(usize, u32)> = None;
    for (index, score) in scores.iter().enumerate() {
        if let Some(score) = *score
            && best.is_none_or(|(_, top)| score > top)
        {
            best = Some((index, score));
        }
    }

    let (index, score) = best.ok_or(EngineError::NoSuitableDevice)?;
    Ok(record(Selection {
        index,
        candidate: candidates[index].clone(),
        score: Some(score),
        forced: false,
    }))
}

fn record(selection: Selection) -> Selection {
    let caps = selection.candidate.caps;
    let _ = ADVANCED_COMPUTE.set(caps.compute && caps.atomics);
    info!(
        "[device] selected {}:{} '{}' ({}, sharing {})",
        selection.candidate.platform,
        selection.candidate.device,
        selection.candidate.name,
        selection.candidate.kind,
        if selection.sharing() { "on" } else { "off" },
    );
    selection
}

/// How to open a discovered device.
#[derive(Debug, Clone)]
pub enum DeviceHandle {
    Host,
    Wgpu(wgpu::Adapter),
}

#[derive(Debug, Clone)]
pub struct Discovered {
    pub candidate: DeviceCandidate,
    pub handle: DeviceHandle,
}

/// Platform 0 is the host FFT; each wgpu backend with adapters gets the next index.
pub fn discover(instance: &wgpu::Instance) -> Vec<Discovered> {
    let mut found = vec![Discovered {
        candidate: host_candidate(),
        handle: DeviceHandle::Host,
    }];

    let backends = [
        wgpu::Backends::VULKAN,
        wgpu::Backends::METAL,
        wgpu::Backends::DX12,
        wgpu::Backends::GL,
    ];
    let mut platform = 1;
    for backend in backends {
        let adapters = instance.enumerate_adapters(backend);
        if adapters.is_empty() {
            continue;
        }
        for (device, adapter) in adapters.into_iter().enumerate() {
            found.push(Discovered {
                candidate: adapter_candidate(&adapter, platform, device),
                handle: DeviceHandle::Wgpu(adapter),
            });
        }
        platform += 1;
    }
    found
}

pub fn host_candidate() -> DeviceCandidate {
    DeviceCandidate {
        platform: 0,
        device: 0,
        kind: DeviceKind::Cpu,
        vendor: "host".into(),
        vendor_id: 0,
        name: "rustfft".into(),
        local_mem: 32 * 1024,
        caps: Capabilities {
            shared_buffers: false,
            compute: true,
            atomics: true,
            images: true,
        },
    }
}

fn adapter_candidate(adapter: &wgpu::Adapter, platform: usize, device: usize) -> DeviceCandidate {
    let info = adapter.get_info();
    let limits = adapter.limits();
    let flags = adapter.get_downlevel_capabilities().flags;

    let kind = match info.device_type {
        wgpu::DeviceType::DiscreteGpu
        | wgpu::DeviceType::IntegratedGpu
        | wgpu::DeviceType::VirtualGpu => DeviceKind::Gpu,
        wgpu::DeviceType::Cpu => DeviceKind::Cpu,
        wgpu::DeviceType::Other => DeviceKind::Other,
    };
    let compute = flags.contains(wgpu::DownlevelFlags::COMPUTE_SHADERS)
        && limits.max_compute_workgroup_size_x >= 256
        && limits.max_compute_invocations_per_workgroup >= 256;
    let caps = Capabilities {
        shared_buffers: flags.contains(wgpu::DownlevelFlags::VERTEX_STORAGE)
            && flags.contains(wgpu::DownlevelFlags::FRAGMENT_STORAGE)
            && limits.max_storage_buffers_per_shader_stage >= 5,
        compute,
        atomics: compute && limits.max_compute_workgroup_storage_size >= FFT_WORKGROUP_BYTES,
        images: limits.max_texture_dimension_2d >= 1024
            && flags.contains(wgpu::DownlevelFlags::COMPUTE_SHADERS),
    };

    DeviceCandidate {
        platform,
        device,
        kind,
        vendor: vendor_name(info.vendor).to_string(),
        vendor_id: info.vendor,
        name: info.name,
        local_mem: u64::from(limits.max_compute_workgroup_storage_size),
        caps,
    }
}

fn vendor_name(id: u32) -> &'static str {
    match id {
        0x10de => "NVIDIA",
        0x1002 => "AMD",
        0x8086 => "Intel",
        0x106b => "Apple",
        0x13b5 => "ARM",
        0x5143 => "Qualcomm",
        _ => "unknown",
    }
}
