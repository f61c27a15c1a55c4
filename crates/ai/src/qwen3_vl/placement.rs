//! Where the weights go and in which precision.
//!
//! The plan is computed from [`Settings`] without touching any hardware, so the
//! policy can be checked on any machine. [`LoadPlan::placement`] then picks a
//! concrete device for a given weight footprint.

use crate::settings::Settings;
use anyhow::{anyhow, bail};
use candle_core::{DType, Device};
use std::{fmt, str::FromStr};

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl Placement {
    pub fn device(&self) -> anyhow::Result<Device> {
        let device = match *self {
            Placement::Cpu => Device::Cpu,
            Placement::Cuda(ordinal) => Device::new_cuda(ordinal)?,
            Placement::Metal(ordinal) => Device::new_metal(ordinal)?,
        };
        Ok(device)
    }

    pub fn is_accelerator(&self) -> bool {
        !matches!(self, Placement::Cpu)
    }

    /// First accelerator candle can open on this machine, if any.
    pub fn detect_accelerator() -> Option<Placement> {
        if candle_core::utils::cuda_is_available() {
            Some(Placement::Cuda(0))
        } else if candle_core::utils::metal_is_available() {
            Some(Placement::Metal(0))
        } else {
            None
        }
    }
}

impl FromStr for Placement {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        let (kind, ordinal) = match s.split_once(':') {
            Some((kind, ordinal)) => {
                let ordinal = ordinal
                    .parse::<usize>()
                    .map_err(|_| anyhow!("invalid device ordinal in {:?}", s))?;
                (kind, ordinal)
            }
            None => (s.as_str(), 0),
        };

        match kind {
            "cpu" if ordinal == 0 => Ok(Placement::Cpu),
            "cuda" => Ok(Placement::Cuda(ordinal)),
            "metal" | "mps" => Ok(Placement::Metal(ordinal)),
            _ => bail!("unsupported device: {:?}", s),
        }
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::Cpu => write!(f, "cpu"),
            Placement::Cuda(ordinal) => write!(f, "cuda:{}", ordinal),
            Placement::Metal(ordinal) => write!(f, "metal:{}", ordinal),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMap {
    /// Every weight on one device.
    Explicit(Placement),
    /// Prefer the accelerator while the weights fit `accelerator_bytes`, else fall
    /// back to host memory (never disk) when `offload_to_host` is set.
    Auto {
        accelerator_bytes: u64,
        host_bytes: u64,
        offload_to_host: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Int8Config {
    /// Activations above this magnitude stay in 16-bit.
    pub threshold: f32,
    pub keep_fp16_weights: bool,
}

impl Default for Int8Config {
    fn default() -> Self {
        Self {
            threshold: 6.0,
            keep_fp16_weights: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadPlan {
    pub device_map: DeviceMap,
    pub dtype: DType,
    pub quantization: Option<Int8Config>,
    pub attn_implementation: Option<String>,
}

impl LoadPlan {
    pub fn from_settings(settings: &Settings, cuda_available: bool) -> anyhow::Result<Self> {
        let device_map = match settings.device.as_deref() {
            Some(device) => DeviceMap::Explicit(device.parse()?),
            None => DeviceMap::Auto {
                accelerator_bytes: settings.accelerator_memory_gib * GIB,
                host_bytes: settings.host_memory_gib * GIB,
                offload_to_host: true,
            },
        };

        // f16/bf16 produce inf/nan with this model family, so full precision is the
        // default. The quantized path computes in f16 instead.
        let (dtype, quantization) = if settings.use_8bit_quantization && cuda_available {
            (DType::F16, Some(Int8Config::default()))
        } else {
            (DType::F32, None)
        };

        Ok(Self {
            device_map,
            dtype,
            quantization,
            attn_implementation: settings.attn_implementation.clone(),
        })
    }

    /// Chooses the device for weights that occupy `weight_bytes` at the plan dtype.
    pub fn placement(
        &self,
        weight_bytes: u64,
        accelerator: Option<Placement>,
    ) -> anyhow::Result<Placement> {
        match &self.device_map {
            DeviceMap::Explicit(placement) => Ok(*placement),
            DeviceMap::Auto {
                accelerator_bytes,
                host_bytes,
                offload_to_host,
            } => {
                if let Some(accelerator) = accelerator {
                    if weight_bytes <= *accelerator_bytes {
                        return Ok(accelerator);
                    }
                    if !offload_to_host {
                        bail!(
                            "model needs {:.1} GiB but {} is limited to {:.1} GiB",
                            as_gib(weight_bytes),
                            accelerator,
                            as_gib(*accelerator_bytes)
                        );
                    }
                    tracing::warn!(
                        "model needs {:.1} GiB, more than the {:.1} GiB allowed on {}, offloading to host memory",
                        as_gib(weight_bytes),
                        as_gib(*accelerator_bytes),
                        accelerator
                    );
                }

                if weight_bytes <= *host_bytes {
                    Ok(Placement::Cpu)
                } else {
                    bail!(
                        "model needs {:.1} GiB but host memory is limited to {:.1} GiB",
                        as_gib(weight_bytes),
                        as_gib(*host_bytes)
                    )
                }
            }
        }
    }
}

fn as_gib(bytes: u64) -> f64 {
    bytes as f64 / GIB as f64
}
