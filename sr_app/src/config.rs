//! Layered configuration.
//!
//! Every stage has a config struct whose `Default` holds the documented
//! defaults and a section name in `storyreel.toml`. On top of the defaults
//! go that section of `storyreel.toml` in the working directory and then
//! `STORYREEL_{SECTION}__*` environment variables. Command-line flags are
//! applied last by each binary.
//!
//! ```toml
//! [audio]
//! voice = "en-GB-RyanNeural"
//!
//! [image.resources]
//! headroom_mb = 1024
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sr_gpu::{MIB, NvidiaSmi, ResourcePolicy};

use crate::StageError;
use crate::logging::LogFormat;

pub const CONFIG_FILE: &str = "storyreel.toml";
pub const ENV_PREFIX: &str = "STORYREEL_";

/// A stage's configuration struct.
pub trait StageConfig: Serialize + DeserializeOwned + Default {
    /// Table in `storyreel.toml` holding this stage's settings.
    const SECTION: &'static str;

    fn log_format(&self) -> LogFormat;
}

/// Build the provider stack for `C`, reading `file` for the TOML layer.
///
/// Nested keys use a double underscore in the environment, e.g.
/// `STORYREEL_IMAGE__RESOURCES__HEADROOM_MB=1024`.
pub fn figment<C: StageConfig>(file: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::default(C::SECTION, C::default()))
        .merge(Toml::file(file))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Load `C` from defaults, `storyreel.toml` and the environment.
///
/// # Errors
/// `StageError::Config` when a layer holds a value of the wrong type.
pub fn load<C: StageConfig>() -> Result<C, StageError> {
    load_from(Path::new(CONFIG_FILE))
}

/// # Errors
/// `StageError::Config` when a layer holds a value of the wrong type.
pub fn load_from<C: StageConfig>(file: &Path) -> Result<C, StageError> {
    figment::<C>(file)
        .extract_inner(C::SECTION)
        .map_err(|err| StageError::Config(Box::new(err)))
}

/// Memory policy settings for stages that load a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub headroom_mb: u64,
    pub require_accelerator: bool,
    pub reclaim_tolerance_mb: u64,
    pub poll_interval_ms: u64,
    pub cleanup_timeout_secs: u64,
    /// Program used to read accelerator memory.
    pub telemetry_program: String,
    pub device: u32,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        let policy = ResourcePolicy::default();
        Self {
            headroom_mb: policy.headroom_bytes / MIB,
            require_accelerator: policy.require_accelerator,
            reclaim_tolerance_mb: policy.reclaim_tolerance_bytes / MIB,
            poll_interval_ms: u64::try_from(policy.poll_interval.as_millis())
                .unwrap_or(u64::MAX),
            cleanup_timeout_secs: policy.cleanup_timeout.as_secs(),
            telemetry_program: "nvidia-smi".to_string(),
            device: 0,
        }
    }
}

impl ResourceConfig {
    pub const fn policy(&self) -> ResourcePolicy {
        ResourcePolicy {
            headroom_bytes: self.headroom_mb.saturating_mul(MIB),
            require_accelerator: self.require_accelerator,
            reclaim_tolerance_bytes: self.reclaim_tolerance_mb.saturating_mul(MIB),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            cleanup_timeout: Duration::from_secs(self.cleanup_timeout_secs),
        }
    }

    pub fn telemetry(&self) -> NvidiaSmi {
        NvidiaSmi::new(self.telemetry_program.clone(), self.device)
    }
}
