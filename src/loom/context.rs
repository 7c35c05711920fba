use std::str::FromStr;

use derive_more::Display;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid context string: {0}")]
pub struct ContextError(String);

/// The kind of an execution locus.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Device {
    #[default]
    #[display("cpu")]
    Cpu,
    /// Host memory pinned for fast device transfers.
    #[display("cpu_pinned")]
    CpuPinned,
    /// A compute device driven through an ordered command stream.
    #[display("gpu")]
    Gpu,
}

impl Device {
    /// The device kind kernels are selected by. Pinned host memory runs host kernels.
    #[inline]
    pub fn mask(self) -> Device {
        match self {
            Device::Cpu | Device::CpuPinned => Device::Cpu,
            Device::Gpu => Device::Gpu,
        }
    }

    /// Returns `true` if work on this device must drain a stream before completing.
    #[inline]
    pub fn is_streaming(self) -> bool {
        matches!(self, Device::Gpu)
    }
}

/// An execution context: a device kind plus the index of the device.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[display("{device}({id})")]
pub struct Context {
    pub device: Device,
    pub id: usize,
}

impl Context {
    #[inline]
    pub const fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            id: 0,
        }
    }

    #[inline]
    pub const fn cpu_pinned() -> Self {
        Self {
            device: Device::CpuPinned,
            id: 0,
        }
    }

    #[inline]
    pub const fn gpu(id: usize) -> Self {
        Self {
            device: Device::Gpu,
            id,
        }
    }
}

impl FromStr for Context {
    type Err = ContextError;

    /// Parses `cpu(0)`, `gpu(1)`, `cpu_pinned(0)` or a bare device name meaning index 0.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ContextError(s.to_string());
        let trimmed = s.trim();
        let (name, id) = match trimmed.split_once('(') {
            Some((name, rest)) => {
                let id = rest.strip_suffix(')').ok_or_else(err)?;
                let id = id.trim().parse::<usize>().map_err(|_| err())?;
                (name.trim(), id)
            }
            None => (trimmed, 0),
        };
        let device = match name {
            "cpu" => Device::Cpu,
            "cpu_pinned" => Device::CpuPinned,
            "gpu" => Device::Gpu,
            _ => return Err(err()),
        };
        Ok(Self { device, id })
    }
}
