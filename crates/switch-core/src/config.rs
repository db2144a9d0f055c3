use std::path::Path;
use std::time::Duration;

use rvoip_media_core::dtmf::{DEFAULT_EMULATE_DTMF_DURATION_MS, MIN_DTMF_DURATION_MS, MIN_DTMF_GAP_MS};
use rvoip_media_core::jitter::JitterBufferConfig;
use serde::{Deserialize, Serialize};

use crate::bridge::features::validate_feature_codes;
use crate::error::{Result, SwitchError};

/// Switching core configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    /// General channel settings
    pub general: GeneralConfig,

    /// DTMF timing and detection
    pub dtmf: DtmfConfig,

    /// In-call feature codes
    pub features: FeaturesConfig,

    /// Call parking
    pub parking: ParkingConfig,

    /// Jitter buffer used by technologies that request one
    pub jitter: JitterBufferConfig,

    /// Logging setup
    pub logging: LogConfig,
}

/// General channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Generator pacing cadence in milliseconds
    pub generator_cadence_ms: u64,

    /// Queue length above which frames are pruned
    pub queue_max_frames: usize,

    /// Queued voice frames above which frames are pruned
    pub queue_max_voice_frames: usize,

    /// Most frames removed by one pruning pass
    pub queue_prune_frames: usize,

    /// Dialplan context new channels start in
    pub default_context: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            generator_cadence_ms: 20,
            queue_max_frames: 128,
            queue_max_voice_frames: 96,
            queue_prune_frames: 64,
            default_context: "default".to_string(),
        }
    }
}

/// DTMF configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DtmfConfig {
    /// Shortest digit reported downstream (ms)
    pub min_duration_ms: u32,

    /// Shortest silence between two digits (ms)
    pub min_gap_ms: u32,

    /// Duration assumed for digits reported without one (ms)
    pub default_duration_ms: u32,

    /// Run in-band detection on received audio by default
    pub inband_detection: bool,
}

impl Default for DtmfConfig {
    fn default() -> Self {
        Self {
            min_duration_ms: MIN_DTMF_DURATION_MS,
            min_gap_ms: MIN_DTMF_GAP_MS,
            default_duration_ms: DEFAULT_EMULATE_DTMF_DURATION_MS,
            inband_detection: false,
        }
    }
}

/// Who may activate a dynamic feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivatedBy {
    Caller,
    Callee,
    Both,
}

/// Which party a dynamic feature acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivateOn {
    /// The party that dialled the code
    #[serde(rename = "self")]
    SelfParty,
    /// The other party of the bridge
    Peer,
}

/// A dynamic feature binding; the operation itself is registered in code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicFeatureConfig {
    pub name: String,
    pub code: String,
    pub activated_by: ActivatedBy,
    pub activate_on: ActivateOn,
}

/// Feature code configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    /// Time allowed between digits of a feature code (ms)
    pub feature_digit_timeout_ms: u64,

    /// Time allowed to dial a blind transfer target (ms)
    pub transfer_digit_timeout_ms: u64,

    /// Blind transfer code, empty to disable
    pub blindxfer: String,

    /// Disconnect code, empty to disable
    pub disconnect: String,

    /// Park the peer, empty to disable
    pub parkcall: String,

    /// Pick up a ringing call in the activator's pickup group, empty to disable
    pub pickup: String,

    /// Attended transfer code, empty to disable
    pub atxfer: String,

    /// Channel driver that dials attended transfer targets as `exten@context`
    pub atxfer_tech: String,

    /// How long an attended transfer target may take to answer (ms)
    pub atxfer_dial_timeout_ms: u64,

    /// Application features
    pub dynamic: Vec<DynamicFeatureConfig>,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            feature_digit_timeout_ms: 1000,
            transfer_digit_timeout_ms: 3000,
            blindxfer: "#".to_string(),
            disconnect: "*".to_string(),
            parkcall: String::new(),
            pickup: String::new(),
            atxfer: String::new(),
            atxfer_tech: "Local".to_string(),
            atxfer_dial_timeout_ms: 30_000,
            dynamic: Vec::new(),
        }
    }
}

impl FeaturesConfig {
    pub fn feature_digit_timeout(&self) -> Duration {
        Duration::from_millis(self.feature_digit_timeout_ms)
    }

    pub fn transfer_digit_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_digit_timeout_ms)
    }

    pub fn atxfer_dial_timeout(&self) -> Duration {
        Duration::from_millis(self.atxfer_dial_timeout_ms)
    }

    /// All enabled (name, code) pairs, builtin ones first
    pub fn codes(&self) -> Vec<(&str, &str)> {
        let builtin = [
            ("blindxfer", self.blindxfer.as_str()),
            ("disconnect", self.disconnect.as_str()),
            ("parkcall", self.parkcall.as_str()),
            ("pickup", self.pickup.as_str()),
            ("atxfer", self.atxfer.as_str()),
        ];
        builtin
            .into_iter()
            .filter(|(_, code)| !code.is_empty())
            .chain(self.dynamic.iter().map(|d| (d.name.as_str(), d.code.as_str())))
            .collect()
    }
}

/// Parking lot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParkingConfig {
    /// Lot name, used in holding channel names and logs
    pub name: String,

    /// First parking slot
    pub first_slot: u32,

    /// Last parking slot
    pub last_slot: u32,

    /// How long a call may stay parked (ms)
    pub park_time_ms: u64,
}

impl Default for ParkingConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            first_slot: 701,
            last_slot: 750,
            park_time_ms: 45_000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level directive, overridden by RUST_LOG
    pub level: String,

    /// Emit JSON lines
    pub json: bool,

    /// Include file and line information
    pub file_info: bool,

    /// Log span enter/exit events
    pub log_spans: bool,

    /// Application name logged at startup
    pub app_name: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file_info: false,
            log_spans: false,
            app_name: "rvoip-switch".to_string(),
        }
    }
}

impl SwitchConfig {
    /// Parse a TOML document; missing sections take their defaults
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: SwitchConfig =
            toml::from_str(s).map_err(|e| SwitchError::config(format!("invalid TOML: {}", e)))?;
        config.validate().map_err(SwitchError::config)?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.general.generator_cadence_ms == 0 {
            return Err("generator_cadence_ms must be greater than 0".to_string());
        }

        if self.general.queue_max_frames == 0 || self.general.queue_max_voice_frames == 0 {
            return Err("queue limits must be greater than 0".to_string());
        }

        if self.general.queue_prune_frames == 0 {
            return Err("queue_prune_frames must be greater than 0".to_string());
        }

        if self.dtmf.min_duration_ms == 0 {
            return Err("dtmf.min_duration_ms must be greater than 0".to_string());
        }

        if self.jitter.upper_threshold == 0 {
            return Err("jitter.upper_threshold must be greater than 0".to_string());
        }

        if self.features.feature_digit_timeout_ms == 0 {
            return Err("feature_digit_timeout_ms must be greater than 0".to_string());
        }

        if self.parking.first_slot > self.parking.last_slot {
            return Err(format!(
                "parking slot range {}-{} is empty",
                self.parking.first_slot, self.parking.last_slot
            ));
        }

        validate_feature_codes(&self.features.codes())?;

        Ok(())
    }
}
