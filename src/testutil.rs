//! Scripted stand-in for the extraction tool.

use std::path::PathBuf;
#[cfg(target_os = "linux")]
use std::time::Duration;

use tempfile::TempDir;

use crate::config::ServerConfig;

pub struct FakeTool {
    _dir: TempDir,
    pub config: ServerConfig,
}

/// `info` runs when the tool is asked for metadata (`-J`), `stream`
/// otherwise. Both are shell snippets; the script is run through `/bin/sh`
/// so nothing needs to be made executable.
pub fn fake_tool(info: &str, stream: &str) -> FakeTool {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("yt-dlp.sh");
    let body = format!(
        "#!/bin/sh\nfor arg in \"$@\"; do\nif [ \"$arg\" = \"-J\" ]; then\n{}\nexit 0\nfi\ndone\n{}\n",
        info, stream
    );
    std::fs::write(&script, body).unwrap();

    let config = ServerConfig {
        ytdlp_path: PathBuf::from("/bin/sh"),
        ytdlp_extra_args: vec![script.to_string_lossy().into_owned()],
        ..ServerConfig::default()
    };

    FakeTool {
        _dir: dir,
        config,
    }
}

/// Snippet printing `json` verbatim.
pub fn info_json(json: &str) -> String {
    format!("cat <<'JSON'\n{}\nJSON", json)
}

/// Poll until `pid` is gone or a zombie, up to `limit`.
#[cfg(target_os = "linux")]
pub async fn wait_for_exit(pid: u32, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if !process_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // state follows the parenthesised command name
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .map(|state| state != "Z" && state != "X")
            .unwrap_or(false),
        Err(_) => false,
    }
}
