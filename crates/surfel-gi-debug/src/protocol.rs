//! Debug protocol - JSON command/response definitions

use serde::{Deserialize, Serialize};

/// Commands sent from a client to the debug server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "params")]
pub enum DebugCommand {
    /// Get surfel pool / spawn statistics
    GetGiStats,
    /// Get the current GI configuration
    GetConfig,
    /// Change pool capacity (forces a full GI reset)
    SetMaxSurfels { max_surfels: u32 },
    /// Set spawn probability for under-covered tiles (0.0-1.0)
    SetSpawnChance { chance: f32 },
    /// Set the per-frame ray budget
    SetRayBudget { budget: u32 },
    /// Set boolean toggles (only specified fields are updated)
    SetToggles {
        #[serde(skip_serializing_if = "Option::is_none")]
        time_driven_updates: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        multi_bounce: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        apply_gi: Option<bool>,
    },
    /// Set blur parameters (only specified fields are updated)
    SetBlur {
        #[serde(skip_serializing_if = "Option::is_none")]
        enabled: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        radius: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sigma: Option<f32>,
    },
    /// Select the output visualization (gi_map, coverage, irradiance, surfels, none)
    SetVisualization { mode: String },
    /// Clear the surfel pool and world structure
    ResetGi,
    /// Capture the current output texture (returns base64 PNG)
    CaptureOutput,
    /// Ping (health check)
    Ping,
}

/// Responses from debug server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum DebugResponse {
    #[serde(rename = "ok")]
    Ok { data: ResponseData },
    #[serde(rename = "error")]
    Error { message: String },
}

/// Response data variants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseData {
    None,
    Pong { message: String },
    GiStats(GiStatsInfo),
    Config { config: serde_json::Value },
    ParamsUpdated { description: String },
    Capture {
        width: u32,
        height: u32,
        png_base64: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GiStatsInfo {
    pub frame_index: u64,
    pub surfel_count: u32,
    pub max_surfels: u32,
    pub candidate_count: u32,
    pub spawned_last_frame: u32,
    pub dropped_spawns: u32,
    pub surfel_memory_mb: f32,
    pub grid_dimension: u32,
}

impl DebugResponse {
    pub fn ok(data: ResponseData) -> Self {
        Self::Ok { data }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self::Error {
            message: msg.into(),
        }
    }

    pub fn pong() -> Self {
        Self::ok(ResponseData::Pong {
            message: "pong".into(),
        })
    }

    pub fn none() -> Self {
        Self::ok(ResponseData::None)
    }

    pub fn updated(description: impl Into<String>) -> Self {
        Self::ok(ResponseData::ParamsUpdated {
            description: description.into(),
        })
    }
}
