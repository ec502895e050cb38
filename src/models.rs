use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct StreamRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub format_id: String,
}

/// What a single encoding carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    Complete,
    VideoOnly,
    AudioOnly,
    /// Placeholder entry letting the tool pick on its own.
    Auto,
}

impl FormatKind {
    pub fn note(self) -> &'static str {
        match self {
            FormatKind::Complete => "Complete",
            FormatKind::VideoOnly => "Video only (audio merged)",
            FormatKind::AudioOnly => "Audio only",
            FormatKind::Auto => "Auto selected",
        }
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct FormatDescriptor {
    pub format_id: String,
    #[serde(rename = "ext")]
    pub extension: String,
    pub resolution: String,
    pub note: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesize: Option<String>,
    #[serde(skip)]
    pub kind: FormatKind,
}

impl FormatDescriptor {
    pub const AUTO_ID: &'static str = "best";

    pub fn auto() -> Self {
        Self {
            format_id: Self::AUTO_ID.to_string(),
            extension: "mp4".to_string(),
            resolution: "Best available".to_string(),
            note: FormatKind::Auto.note().to_string(),
            filesize: None,
            kind: FormatKind::Auto,
        }
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct AnalyzeResponse {
    pub title: String,
    pub formats: Vec<FormatDescriptor>,
}

impl AnalyzeResponse {
    pub fn find_format(&self, format_id: &str) -> Option<&FormatDescriptor> {
        self.formats.iter().find(|f| f.format_id == format_id)
    }
}
