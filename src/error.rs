use std::fmt;
use thiserror::Error;

/// Where in a batch a device call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStage {
    Upload,
    Fft,
    Acquire,
    Display,
    Release,
    ReadBack,
    Drain,
    Clear,
    Render,
}

impl fmt::Display for DeviceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceStage::Upload => "upload",
            DeviceStage::Fft => "fft",
            DeviceStage::Acquire => "acquire",
            DeviceStage::Display => "display",
            DeviceStage::Release => "release",
            DeviceStage::ReadBack => "read-back",
            DeviceStage::Drain => "drain",
            DeviceStage::Clear => "clear",
            DeviceStage::Render => "render",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{stage} failed: {message}")]
pub struct DeviceError {
    pub stage: DeviceStage,
    pub message: String,
}

impl DeviceError {
    pub fn new(stage: DeviceStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("no suitable compute device found")]
    NoSuitableDevice,
    #[error("engine initialisation failed: {0}")]
    Initialization(String),
    #[error("failed to build '{name}':\n{log}")]
    ShaderBuild { name: String, log: String },
    #[error("resource '{0}' not found")]
    ResourceMissing(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
    #[error("device lost after {failures} consecutive failures")]
    DeviceLost { failures: u32 },
}

impl EngineError {
    /// Fatal errors mean the engine cannot come up at all.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::NoSuitableDevice
                | EngineError::Initialization(_)
                | EngineError::ShaderBuild { .. }
                | EngineError::ResourceMissing(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_fatal_errors() {
        assert!(EngineError::NoSuitableDevice.is_fatal());
        assert!(EngineError::ResourceMissing("fft.wgsl".into()).is_fatal());
        assert!(!EngineError::InvalidArgument("len".into()).is_fatal());
        let device: EngineError = DeviceError::new(DeviceStage::Fft, "lost").into();
        assert!(!device.is_fatal());
        assert_eq!(device.to_string(), "device error: fft failed: lost");
    }
}
