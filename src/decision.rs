//! Remote decision service client.
//!
//! The service is an OpenAI-compatible chat-completions endpoint asked to
//! return a strict JSON decision document. The response is treated as an
//! untrusted, best-effort oracle: everything is validated against the closed
//! equipment set before it can influence physical state. Unknown equipment
//! identifiers are dropped with a warning, never fatal; a batch with zero
//! actions is a valid "no changes" answer.

use std::time::Duration;

use chrono::{Local, Timelike};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::DecisionSettings;
use crate::equipment::EquipmentId;
use crate::error::DecisionError;
use crate::models::{DecisionAction, DecisionBatch, SensorSnapshot};

const SYSTEM_PROMPT: &str = "You are a greenhouse automation assistant. You analyze greenhouse \
     sensor readings and recommend equipment control actions that maintain optimal growing \
     conditions. Always answer with a single JSON object.";

/// Seam the orchestrator is written against; the production implementation
/// is [`DecisionClient`].
#[allow(async_fn_in_trait)]
pub trait DecisionService {
    async fn request_decision(
        &self,
        snapshot: &SensorSnapshot,
        recent_warnings: &[String],
    ) -> Result<DecisionBatch, DecisionError>;
}

pub struct DecisionClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl DecisionClient {
    pub fn new(settings: DecisionSettings) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key,
            model: settings.model,
            timeout: settings.timeout,
        })
    }
}

impl DecisionService for DecisionClient {
    async fn request_decision(
        &self,
        snapshot: &SensorSnapshot,
        recent_warnings: &[String],
    ) -> Result<DecisionBatch, DecisionError> {
        let hour = Local::now().hour();
        let prompt = build_user_prompt(snapshot, time_of_day_context(hour), recent_warnings);
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": prompt },
            ],
            "response_format": { "type": "json_object" },
        });
        let url = format!("{}/chat/completions", self.base_url);
        debug!(model = %self.model, "requesting decision");

        let send = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();
        // Belt and braces: reqwest carries its own timeout, but a stalled
        // remote must never stall the control loop.
        let response = match tokio::time::timeout(self.timeout, send).await {
            Err(_) => return Err(DecisionError::Timeout),
            Ok(Err(e)) if e.is_timeout() => return Err(DecisionError::Timeout),
            Ok(Err(e)) => {
                return Err(DecisionError::Unreachable {
                    detail: e.to_string(),
                })
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(DecisionError::ServiceError {
                status: status.as_u16(),
            });
        }

        let envelope: ChatCompletion = response.json().await.map_err(|e| {
            DecisionError::SchemaError {
                detail: format!("invalid completion envelope: {e}"),
            }
        })?;
        let content = envelope
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| DecisionError::SchemaError {
                detail: "completion has no choices".into(),
            })?
            .message
            .content;

        parse_decision(&content)
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

/// Raw decision document before validation. Missing arrays are empty, not
/// errors; unknown top-level fields are ignored. `reason` must be present on
/// every action (empty is fine).
#[derive(Debug, Deserialize)]
struct RawDecision {
    #[serde(default)]
    analysis: String,
    #[serde(default)]
    actions: Vec<RawAction>,
    #[serde(default)]
    warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawAction {
    equipment: String,
    state: bool,
    reason: String,
}

/// Parse and validate the decision document carried in the completion
/// content.
pub fn parse_decision(content: &str) -> Result<DecisionBatch, DecisionError> {
    let raw: RawDecision =
        serde_json::from_str(content).map_err(|e| DecisionError::SchemaError {
            detail: e.to_string(),
        })?;

    let mut actions = Vec::with_capacity(raw.actions.len());
    for action in raw.actions {
        match EquipmentId::from_wire_name(&action.equipment) {
            Some(equipment) => actions.push(DecisionAction {
                equipment,
                desired_state: action.state,
                reason: action.reason,
            }),
            None => warn!(
                equipment = %action.equipment,
                "decision names unknown equipment, dropping entry"
            ),
        }
    }

    Ok(DecisionBatch {
        analysis: raw.analysis,
        actions,
        warnings: raw.warnings,
    })
}

pub(crate) fn time_of_day_context(hour: u32) -> &'static str {
    match hour {
        6..=11 => "It is currently morning.",
        12..=17 => "It is currently midday/afternoon.",
        _ => "It is currently evening/night.",
    }
}

fn build_user_prompt(
    snapshot: &SensorSnapshot,
    time_context: &str,
    recent_warnings: &[String],
) -> String {
    let warnings_block = if recent_warnings.is_empty() {
        "none".to_string()
    } else {
        recent_warnings
            .iter()
            .map(|w| format!("- {w}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "Greenhouse sensor readings:\n\
         Light level: {light:.1}\n\
         CO2 level: {co2:.1} ppm\n\
         Soil moisture: {soil:.1} %\n\
         Air humidity: {humidity:.1} %\n\
         Temperature: {temp:.1} C\n\
         \n\
         {time_context}\n\
         \n\
         Warnings from the previous cycle:\n{warnings_block}\n\
         \n\
         Optimal greenhouse conditions:\n\
         - Temperature: 20-28 C\n\
         - Air humidity: 60-80 %\n\
         - Soil moisture: 70-90 %\n\
         - CO2: 800-1200 ppm\n\
         - Light: high in the morning/midday hours, low in the evening\n\
         \n\
         Analyze the state of the greenhouse and recommend actions. You can \
         control the following equipment (true=on, false=off): Havalandırma \
         (ventilation), Gölgelendirme (shading), Isıtıcı (heater), Nemlendirici \
         (humidifier), Sulama (irrigation), Drenaj (drainage), CO2_Tupu (CO2 \
         valve), Led (supplemental lighting).\n\
         \n\
         Answer with JSON of this exact shape:\n\
         {{\"analysis\": \"current state analysis\", \
         \"actions\": [{{\"equipment\": \"equipment name\", \"state\": true, \
         \"reason\": \"why\"}}], \
         \"warnings\": [\"potential problems in the greenhouse\"]}}",
        light = snapshot.light_level,
        co2 = snapshot.co2_ppm,
        soil = snapshot.soil_moisture_pct,
        humidity = snapshot.air_humidity_pct,
        temp = snapshot.temperature_c,
    )
}
