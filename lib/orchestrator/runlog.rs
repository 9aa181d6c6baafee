use chrono::Utc;
use tokio::fs;

use crate::config::OrchestratorConfig;

use super::TaskResult;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Writes the per-run log artifact for an owner, best-effort.
///
/// Records timestamp, duration, exit code, the changed-file list and the tail
/// of the captured output under an owner-scoped directory. Failures are
/// logged and never affect the task outcome.
pub(crate) async fn write_run_log(config: &OrchestratorConfig, owner: &str, result: &TaskResult) {
    let now = Utc::now();
    let dir = config.log_dir().join(sanitize_owner(owner));
    let path = dir.join(format!("run-{}.log", now.format("%Y%m%dT%H%M%S%3fZ")));

    let mut contents = String::new();
    contents.push_str(&format!("time: {}\n", now.to_rfc3339()));
    contents.push_str(&format!("duration_ms: {}\n", result.get_duration_ms()));
    contents.push_str(&format!("exit_code: {}\n", result.get_exit_code()));
    contents.push_str(&format!(
        "files_changed: {}\n",
        result.get_files_changed().join(", ")
    ));
    contents.push_str("--- output tail ---\n");
    contents.push_str(output_tail(result.get_output(), *config.get_log_tail_bytes()));

    if let Err(e) = fs::create_dir_all(&dir).await {
        tracing::warn!("failed to create run log dir {}: {}", dir.display(), e);
        return;
    }
    if let Err(e) = fs::write(&path, contents).await {
        tracing::warn!("failed to write run log {}: {}", path.display(), e);
    }
}

/// Maps an opaque owner id onto a safe directory name.
fn sanitize_owner(owner: &str) -> String {
    owner
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Returns at most the last `max_bytes` of `output`, on a char boundary.
fn output_tail(output: &str, max_bytes: usize) -> &str {
    if output.len() <= max_bytes {
        return output;
    }

    let mut start = output.len() - max_bytes;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    &output[start..]
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runlog_owner_sanitization() {
        assert_eq!(sanitize_owner("alice"), "alice");
        assert_eq!(sanitize_owner("group/chat:42"), "group_chat_42");
    }

    #[test]
    fn test_runlog_output_tail_respects_char_boundaries() {
        assert_eq!(output_tail("hello", 10), "hello");
        assert_eq!(output_tail("hello world", 5), "world");

        // Multi-byte char straddling the cut is dropped, not split.
        let s = "aé";
        let tail = output_tail(s, 1);
        assert!(tail.is_empty() || tail.is_char_boundary(0));
    }
}
