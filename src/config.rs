//! Runtime configuration for a kernel dispatch
//!
//! Every field has a default so an empty JSON object is a valid config.
//!
//! ```json
//! {
//!   "application_name": "Compute Shader Demo",
//!   "entry_point": "main",
//!   "workgroup_size": 256,
//!   "dispatch_timeout_ms": 5000,
//!   "enable_validation": false
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatch::WORKGROUP_SIZE;
use crate::error::{ComputeError, Result};

/// Knobs for instance creation, pipeline build and host waits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// Reported to the driver in VkApplicationInfo
    pub application_name: String,

    /// Kernel entry point handed to the pipeline builder
    pub entry_point: String,

    /// Threads per workgroup along x. Fixed by the kernel's local_size_x, so
    /// only [`WORKGROUP_SIZE`] is accepted; kept for config files that state it.
    pub workgroup_size: u32,

    /// Upper bound on the host wait for a dispatch's completion signal
    pub dispatch_timeout_ms: u64,

    /// Enable VK_LAYER_KHRONOS_validation and route its messages to `log`
    pub enable_validation: bool,

    /// Requested Vulkan API version as (major, minor)
    pub api_version: (u32, u32),
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            application_name: "Compute Shader Demo".to_string(),
            entry_point: "main".to_string(),
            workgroup_size: WORKGROUP_SIZE,
            dispatch_timeout_ms: 5_000,
            enable_validation: false,
            api_version: (1, 0),
        }
    }
}

impl ComputeConfig {
    /// Parse a config from JSON text and validate it.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| ComputeError::Config(format!("malformed JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ComputeError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_json_str(&text)?;
        log::info!("Loaded compute config from {}", path.display());
        Ok(config)
    }

    /// Reject values the dispatch core cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.workgroup_size != WORKGROUP_SIZE {
            return Err(ComputeError::Config(format!(
                "workgroup_size {} does not match the kernel's local_size_x ({})",
                self.workgroup_size, WORKGROUP_SIZE
            )));
        }
        if self.entry_point.is_empty() {
            return Err(ComputeError::Config("entry_point must not be empty".to_string()));
        }
        if self.entry_point.contains('\0') {
            return Err(ComputeError::Config("entry_point contains a NUL byte".to_string()));
        }
        if self.dispatch_timeout_ms == 0 {
            return Err(ComputeError::Config("dispatch_timeout_ms must be positive".to_string()));
        }
        Ok(())
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    /// Encoded for VkApplicationInfo::api_version.
    pub fn vk_api_version(&self) -> u32 {
        ash::vk::make_api_version(0, self.api_version.0, self.api_version.1, 0)
    }
}
