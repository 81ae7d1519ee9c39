//! Session configuration.
//!
//! Layered the same way as the rest of the workspace: built-in defaults,
//! then an optional TOML file (`INSPEX_CONFIG`, default `config/inspex.toml`),
//! then `INSPEX__*` environment variables. The `GEMINI_API_KEY`,
//! `GEMINI_MODEL` and `GEMINI_VOICE` variables seed the defaults so an
//! existing `.env` keeps working.

use crate::error::VoiceResult;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-12-2025";
pub const DEFAULT_VOICE: &str = "Charon";
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

const DEFAULT_SYSTEM_PROMPT: &str = "\
You are an AI inspection assistant for CAT heavy equipment.

FLOW:
1. When the user describes damage or mentions a component, call run_inspection immediately.
   The inspection takes 30-60 seconds. Tell the user
   \"Running the inspection now, this will take about 30 seconds\" and WAIT
   patiently for the tool response. Do NOT call the tool again.

2. After getting inspection results, read each finding with its NUMBER, severity, and issue.
   Then ask: \"Would you like to correct or remove any findings before I save them?\"

3. If the inspector wants to change something, call edit_findings for each change.
   After editing, read back the updated findings and ask again if they look correct.

4. When the inspector confirms the findings are correct, ask:
   \"Should I save these findings to the task database?\"
   Call report_anomalies with confirmed=true or confirmed=false.

5. After reporting, tell the user what parts are needed and ask:
   \"Should I check inventory and order replacement parts?\"
   Call order_parts with confirmed=true or confirmed=false.

Keep responses short and clear.";

/// How uplink audio is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UplinkMode {
    /// `realtimeInput.mediaChunks` JSON with base64 PCM
    Json,
    /// Raw PCM binary frames (relay shortcut)
    Binary,
}

/// Equipment and task the session is scoped to.
#[derive(Debug, Clone, Deserialize)]
pub struct EquipmentContext {
    pub equipment_id: String,
    pub equipment_model: String,
    pub task_id: i64,
    pub inspection_id: i64,
}

impl Default for EquipmentContext {
    fn default() -> Self {
        Self {
            equipment_id: "CAT-320-002".to_string(),
            equipment_model: "CAT 320 Excavator".to_string(),
            task_id: 1,
            inspection_id: 5,
        }
    }
}

/// Where the inspection tools send their requests.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the vision inspection service
    pub inspect_base_url: String,
    /// Explicit inspect endpoint, tried before the derived candidates
    pub inspect_url: Option<String>,
    /// Base URL of the task/report API
    pub api_base_url: String,
    pub inspect_timeout_secs: u64,
    pub submit_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            inspect_base_url: "http://127.0.0.1:8080".to_string(),
            inspect_url: None,
            api_base_url: "http://127.0.0.1:8000".to_string(),
            inspect_timeout_secs: 180,
            submit_timeout_secs: 15,
        }
    }
}

/// Configuration for a live voice session
#[derive(Debug, Clone, Deserialize)]
pub struct LiveConfig {
    pub api_key: String,
    pub model: String,
    pub voice: String,
    /// WebSocket endpoint without the `key` query parameter
    pub endpoint: String,
    pub response_modalities: Vec<String>,
    /// Overrides the built-in assistant prompt when set
    pub system_prompt: Option<String>,

    pub send_queue_capacity: usize,
    pub settle_delay_ms: u64,
    pub setup_timeout_secs: u64,
    /// How long stop() waits for the end-of-session message to flush
    pub stop_timeout_ms: u64,
    pub uplink_mode: UplinkMode,
    pub mute_during_tool_calls: bool,
    pub tool_response_max_bytes: usize,

    pub equipment: EquipmentContext,
    pub backend: BackendConfig,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            response_modalities: vec!["AUDIO".to_string()],
            system_prompt: None,
            send_queue_capacity: 60,
            settle_delay_ms: 900,
            setup_timeout_secs: 15,
            stop_timeout_ms: 2000,
            uplink_mode: UplinkMode::Json,
            mute_during_tool_calls: true,
            tool_response_max_bytes: 2000,
            equipment: EquipmentContext::default(),
            backend: BackendConfig::default(),
        }
    }
}

impl LiveConfig {
    /// Load from defaults, optional file, and environment.
    pub fn load() -> VoiceResult<Self> {
        let config_path =
            std::env::var("INSPEX_CONFIG").unwrap_or_else(|_| "config/inspex.toml".to_string());
        Self::load_from(Path::new(&config_path))
    }

    /// Same as [`LiveConfig::load`] with an explicit settings file. A
    /// missing file is skipped.
    pub fn load_from(path: &Path) -> VoiceResult<Self> {
        let d = Self::default();
        let eq = &d.equipment;
        let be = &d.backend;

        let builder = config::Config::builder()
            .set_default("api_key", std::env::var("GEMINI_API_KEY").unwrap_or_default())?
            .set_default("model", std::env::var("GEMINI_MODEL").unwrap_or(d.model.clone()))?
            .set_default("voice", std::env::var("GEMINI_VOICE").unwrap_or(d.voice.clone()))?
            .set_default("endpoint", d.endpoint.clone())?
            .set_default("response_modalities", d.response_modalities.clone())?
            .set_default("send_queue_capacity", d.send_queue_capacity as i64)?
            .set_default("settle_delay_ms", d.settle_delay_ms as i64)?
            .set_default("setup_timeout_secs", d.setup_timeout_secs as i64)?
            .set_default("stop_timeout_ms", d.stop_timeout_ms as i64)?
            .set_default("uplink_mode", "json")?
            .set_default("mute_during_tool_calls", d.mute_during_tool_calls)?
            .set_default("tool_response_max_bytes", d.tool_response_max_bytes as i64)?
            .set_default("equipment.equipment_id", eq.equipment_id.clone())?
            .set_default("equipment.equipment_model", eq.equipment_model.clone())?
            .set_default("equipment.task_id", eq.task_id)?
            .set_default("equipment.inspection_id", eq.inspection_id)?
            .set_default(
                "backend.inspect_base_url",
                std::env::var("INSPEX_BASE_URL").unwrap_or(be.inspect_base_url.clone()),
            )?
            .set_default(
                "backend.api_base_url",
                std::env::var("API_BASE_URL").unwrap_or(be.api_base_url.clone()),
            )?
            .set_default("backend.inspect_timeout_secs", be.inspect_timeout_secs as i64)?
            .set_default("backend.submit_timeout_secs", be.submit_timeout_secs as i64)?;

        let builder = match std::env::var("INSPEX_INSPECT_URL") {
            Ok(url) if !url.trim().is_empty() => {
                builder.set_default("backend.inspect_url", url.trim().to_string())?
            }
            _ => builder,
        };

        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("INSPEX").separator("__"))
            .build()?;

        Ok(built.try_deserialize()?)
    }

    /// Full endpoint URL including the API key.
    pub fn endpoint_url(&self) -> String {
        if self.api_key.is_empty() {
            self.endpoint.clone()
        } else {
            format!("{}?key={}", self.endpoint, self.api_key)
        }
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// System instruction sent in the setup descriptor, with the current
    /// equipment context appended.
    pub fn system_prompt(&self) -> String {
        let base = self.system_prompt.as_deref().unwrap_or(DEFAULT_SYSTEM_PROMPT);
        format!(
            "{}\nCurrent equipment: {}, task_id={}, inspection_id={}.\n",
            base.trim_end(),
            self.equipment.equipment_id,
            self.equipment.task_id,
            self.equipment.inspection_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LiveConfig::default();
        assert_eq!(config.send_queue_capacity, 60);
        assert_eq!(config.settle_delay(), Duration::from_millis(900));
        assert_eq!(config.setup_timeout(), Duration::from_secs(15));
        assert_eq!(config.uplink_mode, UplinkMode::Json);
        assert_eq!(config.voice, "Charon");
    }

    #[test]
    fn test_endpoint_url_appends_key() {
        let config = LiveConfig {
            api_key: "abc".to_string(),
            endpoint: "wss://example.test/live".to_string(),
            ..Default::default()
        };
        assert_eq!(config.endpoint_url(), "wss://example.test/live?key=abc");

        let keyless = LiveConfig {
            endpoint: "ws://127.0.0.1:8001/ws/live".to_string(),
            ..Default::default()
        };
        assert_eq!(keyless.endpoint_url(), "ws://127.0.0.1:8001/ws/live");
    }

    #[test]
    fn test_system_prompt_carries_equipment_context() {
        let mut config = LiveConfig::default();
        config.equipment.equipment_id = "CAT-950-117".to_string();
        config.equipment.inspection_id = 42;
        let prompt = config.system_prompt();
        assert!(prompt.contains("run_inspection"));
        assert!(prompt.contains("CAT-950-117"));
        assert!(prompt.contains("inspection_id=42"));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = LiveConfig::load_from(Path::new("does/not/exist.toml")).unwrap();
        assert_eq!(config.send_queue_capacity, 60);
        assert_eq!(config.tool_response_max_bytes, 2000);
        assert_eq!(config.backend.submit_timeout_secs, 15);
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("inspex-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "settle_delay_ms = 600\nuplink_mode = \"binary\"\n\n[equipment]\nequipment_id = \"CAT-950-117\"\n",
        )
        .unwrap();

        let config = LiveConfig::load_from(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(config.settle_delay(), Duration::from_millis(600));
        assert_eq!(config.uplink_mode, UplinkMode::Binary);
        assert_eq!(config.equipment.equipment_id, "CAT-950-117");
        assert_eq!(config.equipment.inspection_id, 5);
        assert_eq!(config.send_queue_capacity, 60);
    }
}
