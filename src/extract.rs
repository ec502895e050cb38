use std::io::ErrorKind;
use std::process::Stdio;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tokio::process::Command;
use url::Url;

use crate::config::ServerConfig;
use crate::error::ValidationError;
use crate::models::{AnalyzeResponse, FormatDescriptor, FormatKind};

// ── Constants ────────────────────────────────────────────────────────────────

const UNTITLED: &str = "Untitled";
const DEFAULT_EXT: &str = "mp4";
const SIZE_UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];

const UNAVAILABLE_NEEDLES: &[&str] = &[
    "private video",
    "video is private",
    "video unavailable",
    "not available in your country",
    "geo restrict",
    "has been removed",
    "sign in to confirm",
    "login required",
];

// ── Lazy static regexes ──────────────────────────────────────────────────────

static UNSAFE_FILENAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s.-]").unwrap());

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("Unsupported URL: {0}")]
    Unsupported(String),
    #[error("Content unavailable: {0}")]
    Unavailable(String),
    #[error("Extraction timed out after {0}s")]
    Timeout(u64),
    #[error("{0}")]
    Launch(String),
    #[error("Extraction failed: {0}")]
    ToolFailed(String),
    #[error("Extraction tool returned unreadable output: {0}")]
    InvalidOutput(String),
}

// ── Tool output (subset of the info JSON) ────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ToolInfo {
    title: Option<String>,
    #[serde(default)]
    formats: Vec<ToolFormat>,
}

#[derive(Debug, Deserialize)]
struct ToolFormat {
    format_id: Option<String>,
    ext: Option<String>,
    height: Option<u32>,
    resolution: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
}

impl ToolFormat {
    /// Missing codec fields mean "unknown", which the tool treats as present.
    fn kind(&self) -> Option<FormatKind> {
        let video = self.vcodec.as_deref() != Some("none");
        let audio = self.acodec.as_deref() != Some("none");
        match (video, audio) {
            (true, true) => Some(FormatKind::Complete),
            (true, false) => Some(FormatKind::VideoOnly),
            (false, true) => Some(FormatKind::AudioOnly),
            (false, false) => None,
        }
    }
}

// ── Public API ───────────────────────────────────────────────────────────────

/// Ask the extraction tool for the title and encodings behind `url`.
///
/// The tool runs in info-only mode and is killed if it outlives the
/// configured timeout.
pub async fn analyze(config: &ServerConfig, url: &str) -> Result<AnalyzeResponse, ExtractionError> {
    let mut cmd = tool_command(config);
    cmd.args(["-J", "--no-playlist", "--no-warnings", url]);

    let output = tokio::time::timeout(config.analyze_timeout(), cmd.output())
        .await
        .map_err(|_| {
            tracing::warn!(url, timeout = config.analyze_timeout_secs, "extraction timed out");
            ExtractionError::Timeout(config.analyze_timeout_secs)
        })?
        .map_err(|e| ExtractionError::Launch(launch_error(config, &e)))?;

    if !output.status.success() {
        let message = tool_error_message(&output.stderr)
            .unwrap_or_else(|| format!("extraction tool exited with {}", output.status));
        tracing::warn!(url, %message, "extraction failed");
        return Err(classify_failure(message));
    }

    let response = parse_info(&output.stdout)?;
    tracing::info!(url, formats = response.formats.len(), "analyzed");
    Ok(response)
}

/// Base invocation of the extraction tool with the configured leading args.
///
/// On unix the tool leads its own process group, so the ffmpeg it spawns for
/// merging can be killed along with it.
pub fn tool_command(config: &ServerConfig) -> Command {
    let mut cmd = Command::new(&config.ytdlp_path);
    cmd.args(&config.ytdlp_extra_args)
        .stdin(Stdio::null())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

pub fn launch_error(config: &ServerConfig, err: &std::io::Error) -> String {
    if err.kind() == ErrorKind::NotFound {
        format!(
            "Extraction tool not found at {}",
            config.ytdlp_path.display()
        )
    } else {
        format!("Could not run extraction tool: {}", err)
    }
}

// ── URL validation ───────────────────────────────────────────────────────────

pub fn validate_url(config: &ServerConfig, url: &str) -> Result<Url, ValidationError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(ValidationError::MissingUrl);
    }
    let parsed = Url::parse(url).map_err(|_| ValidationError::InvalidUrl)?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ValidationError::InvalidUrl);
    }
    let host = match parsed.host_str() {
        Some(host) if !host.is_empty() => host,
        _ => return Err(ValidationError::InvalidUrl),
    };
    if !config.domain_allowed(host) {
        return Err(ValidationError::DomainNotAllowed);
    }
    Ok(parsed)
}

// ── Output parsing ───────────────────────────────────────────────────────────

pub fn parse_info(stdout: &[u8]) -> Result<AnalyzeResponse, ExtractionError> {
    let info: ToolInfo = serde_json::from_slice(stdout)
        .map_err(|e| ExtractionError::InvalidOutput(e.to_string()))?;

    let mut formats: Vec<FormatDescriptor> = Vec::new();
    for raw in &info.formats {
        let Some(descriptor) = describe_format(raw) else {
            continue;
        };
        if formats.iter().any(|f| f.format_id == descriptor.format_id) {
            continue;
        }
        formats.push(descriptor);
    }

    if formats.is_empty() {
        formats.push(FormatDescriptor::auto());
    }

    let title = info
        .title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| UNTITLED.to_string());

    Ok(AnalyzeResponse { title, formats })
}

fn describe_format(raw: &ToolFormat) -> Option<FormatDescriptor> {
    let format_id = raw.format_id.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
    let kind = raw.kind()?;

    let resolution = match (raw.height, kind) {
        (Some(height), _) if height > 0 => format!("{}p", height),
        (_, FormatKind::AudioOnly) => "audio only".to_string(),
        _ => raw
            .resolution
            .clone()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "unknown".to_string()),
    };

    Some(FormatDescriptor {
        format_id: format_id.to_string(),
        extension: raw.ext.clone().unwrap_or_else(|| DEFAULT_EXT.to_string()),
        resolution,
        note: kind.note().to_string(),
        filesize: format_filesize(raw.filesize.or(raw.filesize_approx)),
        kind,
    })
}

pub fn format_filesize(size: Option<f64>) -> Option<String> {
    let mut size = size.filter(|s| *s > 0.0)?;
    for unit in SIZE_UNITS {
        if size < 1024.0 {
            return Some(format!("{:.2} {}", size, unit));
        }
        size /= 1024.0;
    }
    Some(format!("{:.2} PB", size))
}

// ── Tool diagnostics ─────────────────────────────────────────────────────────

/// Last `ERROR:` line of the tool's stderr, else its last non-empty line.
pub fn tool_error_message(stderr: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    let line: &str = lines
        .iter()
        .rev()
        .find(|line| line.starts_with("ERROR:"))
        .or_else(|| lines.last())
        .copied()?;

    let message = line.strip_prefix("ERROR:").unwrap_or(line).trim();
    if message.is_empty() {
        None
    } else {
        Some(message.to_string())
    }
}

fn classify_failure(message: String) -> ExtractionError {
    let lower = message.to_lowercase();
    if lower.contains("unsupported url") {
        ExtractionError::Unsupported(message)
    } else if UNAVAILABLE_NEEDLES.iter().any(|n| lower.contains(n)) {
        ExtractionError::Unavailable(message)
    } else {
        ExtractionError::ToolFailed(message)
    }
}

// ── Download naming ──────────────────────────────────────────────────────────

/// ASCII-only file stem usable inside a Content-Disposition header.
pub fn safe_filename(title: &str) -> String {
    let cleaned = UNSAFE_FILENAME_RE.replace_all(title, "");
    let ascii: String = cleaned.chars().filter(|c| c.is_ascii()).collect();
    let name = ascii.split_whitespace().collect::<Vec<_>>().join(" ");
    if name.is_empty() {
        "media".to_string()
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{fake_tool, info_json};
    use std::time::{Duration, Instant};

    const SAMPLE_INFO: &str = r#"{
        "title": "Sample clip",
        "formats": [
            {"format_id": "sb0", "ext": "mhtml", "vcodec": "none", "acodec": "none", "resolution": "48x27"},
            {"format_id": "140", "ext": "m4a", "vcodec": "none", "acodec": "mp4a.40.2", "filesize": 3355443},
            {"format_id": "18", "ext": "mp4", "height": 360, "vcodec": "avc1.42001E", "acodec": "mp4a.40.2", "filesize_approx": 10485760},
            {"format_id": "137", "ext": "mp4", "height": 1080, "vcodec": "avc1.640028", "acodec": "none"},
            {"format_id": "hls-fallback", "ext": "mp4", "resolution": "multiple"},
            {"format_id": "18", "ext": "mp4", "height": 360},
            {"ext": "mp4", "height": 720}
        ]
    }"#;

    #[test]
    fn test_parse_info() {
        let response = parse_info(SAMPLE_INFO.as_bytes()).unwrap();
        assert_eq!(response.title, "Sample clip");

        let ids: Vec<&str> = response.formats.iter().map(|f| f.format_id.as_str()).collect();
        assert_eq!(ids, vec!["140", "18", "137", "hls-fallback"]);

        let audio = &response.formats[0];
        assert_eq!(audio.resolution, "audio only");
        assert_eq!(audio.note, "Audio only");
        assert_eq!(audio.extension, "m4a");
        assert_eq!(audio.filesize.as_deref(), Some("3.20 MB"));

        let complete = &response.formats[1];
        assert_eq!(complete.resolution, "360p");
        assert_eq!(complete.note, "Complete");
        assert_eq!(complete.filesize.as_deref(), Some("10.00 MB"));

        let video = &response.formats[2];
        assert_eq!(video.resolution, "1080p");
        assert_eq!(video.kind, FormatKind::VideoOnly);
        assert!(video.filesize.is_none());

        assert_eq!(response.formats[3].resolution, "multiple");
        assert_eq!(response.formats[3].kind, FormatKind::Complete);
    }

    #[test]
    fn test_parse_info_without_formats() {
        let response = parse_info(br#"{"title": "  "}"#).unwrap();
        assert_eq!(response.title, "Untitled");
        assert_eq!(response.formats.len(), 1);
        assert_eq!(response.formats[0].format_id, "best");
        assert_eq!(response.formats[0].resolution, "Best available");
    }

    #[test]
    fn test_parse_info_rejects_garbage() {
        assert!(matches!(
            parse_info(b"<html>nope</html>"),
            Err(ExtractionError::InvalidOutput(_))
        ));
    }

    #[test]
    fn test_format_filesize() {
        assert_eq!(format_filesize(None), None);
        assert_eq!(format_filesize(Some(0.0)), None);
        assert_eq!(format_filesize(Some(512.0)).as_deref(), Some("512.00 B"));
        assert_eq!(format_filesize(Some(1536.0)).as_deref(), Some("1.50 KB"));
        assert_eq!(
            format_filesize(Some(3.0 * 1024f64.powi(3))).as_deref(),
            Some("3.00 GB")
        );
        assert_eq!(
            format_filesize(Some(2.0 * 1024f64.powi(5))).as_deref(),
            Some("2.00 PB")
        );
    }

    #[test]
    fn test_tool_error_message() {
        let stderr = b"[youtube] X: Downloading webpage\nERROR: [youtube] X: Private video. Sign in\n\n";
        assert_eq!(
            tool_error_message(stderr).as_deref(),
            Some("[youtube] X: Private video. Sign in")
        );
        assert_eq!(
            tool_error_message(b"Traceback...\nKeyError: 'x'\n").as_deref(),
            Some("KeyError: 'x'")
        );
        assert_eq!(tool_error_message(b"  \n"), None);
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure("[generic] Unsupported URL: https://x".into()),
            ExtractionError::Unsupported(_)
        ));
        assert!(matches!(
            classify_failure("[youtube] abc: Video unavailable".into()),
            ExtractionError::Unavailable(_)
        ));
        assert!(matches!(
            classify_failure("Unable to download webpage: timed out".into()),
            ExtractionError::ToolFailed(_)
        ));
    }

    #[test]
    fn test_validate_url() {
        let config = ServerConfig::default();
        assert!(validate_url(&config, "https://youtube.com/watch?v=X").is_ok());
        assert!(validate_url(&config, "  http://example.com/v  ").is_ok());
        assert!(matches!(validate_url(&config, ""), Err(ValidationError::MissingUrl)));
        assert!(matches!(validate_url(&config, "   "), Err(ValidationError::MissingUrl)));
        assert!(matches!(validate_url(&config, "youtube.com/watch"), Err(ValidationError::InvalidUrl)));
        assert!(matches!(validate_url(&config, "ftp://host/file"), Err(ValidationError::InvalidUrl)));
        assert!(matches!(validate_url(&config, "file:///etc/passwd"), Err(ValidationError::InvalidUrl)));

        let restricted = ServerConfig {
            allowed_domains: vec!["tiktok.com".into()],
            ..ServerConfig::default()
        };
        assert!(validate_url(&restricted, "https://www.tiktok.com/@a/video/1").is_ok());
        assert!(matches!(
            validate_url(&restricted, "https://vimeo.com/1"),
            Err(ValidationError::DomainNotAllowed)
        ));
    }

    #[test]
    fn test_safe_filename() {
        assert_eq!(safe_filename("My: \"Video\" / Part 1?"), "My Video Part 1");
        assert_eq!(safe_filename("clip-01.final"), "clip-01.final");
        assert_eq!(safe_filename("Café\tnoir\n"), "Caf noir");
        assert_eq!(safe_filename("日本語"), "media");
        assert_eq!(safe_filename(""), "media");
    }

    #[tokio::test]
    async fn test_analyze_runs_tool() {
        let tool = fake_tool(&info_json(SAMPLE_INFO), "exit 0");
        let response = analyze(&tool.config, "https://youtube.com/watch?v=X")
            .await
            .unwrap();
        assert_eq!(response.title, "Sample clip");
        assert!(!response.formats.is_empty());
        assert!(response.formats.iter().all(|f| !f.format_id.is_empty()));
    }

    #[tokio::test]
    async fn test_analyze_reports_tool_failure() {
        let tool = fake_tool(
            "echo 'ERROR: [generic] Unsupported URL: https://example.com/x' >&2\nexit 1",
            "exit 0",
        );
        let err = analyze(&tool.config, "https://example.com/x").await.unwrap_err();
        assert!(matches!(err, ExtractionError::Unsupported(_)));
        assert!(err.to_string().contains("Unsupported URL"));

        let tool = fake_tool("exit 2", "exit 0");
        let err = analyze(&tool.config, "https://example.com/x").await.unwrap_err();
        assert!(matches!(err, ExtractionError::ToolFailed(ref m) if m.contains("exit")));
    }

    #[tokio::test]
    async fn test_analyze_unparseable_output() {
        let tool = fake_tool("echo 'not json'", "exit 0");
        let err = analyze(&tool.config, "https://youtube.com/watch?v=X")
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidOutput(_)));
    }

    #[tokio::test]
    async fn test_analyze_times_out() {
        let mut tool = fake_tool("exec sleep 30", "exit 0");
        tool.config.analyze_timeout_secs = 1;

        let started = Instant::now();
        let err = analyze(&tool.config, "https://youtube.com/watch?v=X")
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Timeout(1)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_analyze_missing_tool() {
        let config = ServerConfig {
            ytdlp_path: "/nonexistent/yt-dlp".into(),
            ..ServerConfig::default()
        };
        let err = analyze(&config, "https://youtube.com/watch?v=X")
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Launch(ref m) if m.contains("not found")));
    }
}
