use serde::{Deserialize, Serialize};

/// Result of a successful generation run.
///
/// Produced by a pipeline executor, cached on the job (so a re-delivered job can
/// be answered without recontacting providers) and copied onto the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationOutput {
    pub result_url: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// Media duration in seconds (0 for still images).
    #[serde(default)]
    pub duration_secs: f64,
}

impl GenerationOutput {
    pub fn new(result_url: impl Into<String>) -> Self {
        Self {
            result_url: result_url.into(),
            thumbnail: None,
            title: None,
            duration_secs: 0.0,
        }
    }

    pub fn with_thumbnail(mut self, thumbnail: impl Into<String>) -> Self {
        self.thumbnail = Some(thumbnail.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_duration(mut self, duration_secs: f64) -> Self {
        self.duration_secs = duration_secs;
        self
    }
}
