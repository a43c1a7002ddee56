//! Plugin configuration, read from the environment or supplied by the host.

use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::spec::{OpError, OpResult};

static GLOBAL_CONFIG: OnceLock<PluginConfig> = OnceLock::new();

pub const DEVICE_ENV: &str = "ACCELOP_DEVICE";
pub const CUTENSOR_LIB_ENV: &str = "ACCELOP_CUTENSOR_LIB";
pub const CHECK_PERMUTATION_ENV: &str = "ACCELOP_CHECK_PERMUTATION";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Accelerator ordinal to open.
    pub device_ordinal: i32,
    /// Explicit cuTENSOR shared library, bypassing the default search list.
    pub cutensor_library: Option<PathBuf>,
    /// Validate permutations read from device tensors before launching.
    pub check_runtime_permutation: bool,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            device_ordinal: 0,
            cutensor_library: None,
            check_runtime_permutation: true,
        }
    }
}

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn non_empty_var(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

impl PluginConfig {
    /// Reads overrides from `ACCELOP_*` variables on top of the defaults.
    ///
    /// Unparseable device ordinals fall back to the default with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = non_empty_var(DEVICE_ENV) {
            match value.trim().parse::<i32>() {
                Ok(ordinal) => config.device_ordinal = ordinal,
                Err(_) => tracing::warn!(
                    "ignoring {DEVICE_ENV}={value:?}: not an integer device ordinal"
                ),
            }
        }
        if let Some(value) = non_empty_var(CUTENSOR_LIB_ENV) {
            config.cutensor_library = Some(PathBuf::from(value));
        }
        if let Some(value) = non_empty_var(CHECK_PERMUTATION_ENV) {
            config.check_runtime_permutation = parse_bool(&value);
        }
        config
    }

    /// Process-wide configuration, read from the environment once.
    pub fn global() -> &'static PluginConfig {
        GLOBAL_CONFIG.get_or_init(Self::from_env)
    }

    pub fn from_json_str(src: &str) -> OpResult<Self> {
        serde_json::from_str(src)
            .map_err(|err| OpError::invalid_graph(format!("invalid plugin config: {err}")))
    }
}
