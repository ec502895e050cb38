use url::Url;

use crate::models::{FormatDescriptor, FormatKind};

/// Single pre-muxed stream. DASH-split audio/video from these sources played
/// back silent or as a black screen.
pub const PREMUXED_EXPR: &str = "best";
/// Best separate video+audio remuxed together, else best combined stream.
pub const MERGED_EXPR: &str = "bestvideo+bestaudio/best";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Facebook,
    Instagram,
    TikTok,
    YouTube,
    Other,
}

const PLATFORM_DOMAINS: &[(Platform, &[&str])] = &[
    (Platform::Facebook, &["facebook.com", "fb.watch", "fb.com"]),
    (Platform::Instagram, &["instagram.com"]),
    (Platform::TikTok, &["tiktok.com"]),
    (
        Platform::YouTube,
        &["youtube.com", "youtu.be", "youtube-nocookie.com"],
    ),
];

impl Platform {
    /// Classify a URL by hostname. Anything unparseable is `Other`.
    pub fn detect(url: &str) -> Self {
        let host = match Url::parse(url.trim()) {
            Ok(parsed) => parsed.host_str().unwrap_or("").to_lowercase(),
            Err(_) => return Platform::Other,
        };

        PLATFORM_DOMAINS
            .iter()
            .find(|(_, domains)| {
                domains
                    .iter()
                    .any(|d| host == *d || host.ends_with(&format!(".{}", d)))
            })
            .map(|(platform, _)| *platform)
            .unwrap_or(Platform::Other)
    }

    pub fn format_expression(self) -> &'static str {
        match self {
            Platform::Facebook | Platform::Instagram | Platform::TikTok => PREMUXED_EXPR,
            Platform::YouTube | Platform::Other => MERGED_EXPR,
        }
    }

    fn premuxed(self) -> bool {
        self.format_expression() == PREMUXED_EXPR
    }
}

/// Format expression for a URL's source platform.
pub fn format_expression(url: &str) -> &'static str {
    Platform::detect(url).format_expression()
}

/// Expression handed to the tool when streaming one particular encoding from
/// `platform`. The result always yields a single muxed audio+video output.
pub fn stream_selection(platform: Platform, format: &FormatDescriptor) -> String {
    match format.kind {
        FormatKind::Auto => platform.format_expression().to_string(),
        FormatKind::Complete => format.format_id.clone(),
        _ if platform.premuxed() => platform.format_expression().to_string(),
        FormatKind::VideoOnly => format!("{}+bestaudio/best", format.format_id),
        FormatKind::AudioOnly => format!("bestvideo+{}/best", format.format_id),
    }
}
