//! Rebuilding the runtime's transcript for a resumed run.

use anyhow::{Context, Result, bail};
use enclave_protocol::{ResumeState, SessionId, SessionStorePort};
use tracing::debug;

/// Load what the runtime needs to continue `session_id`, or `None` for a
/// session that has never produced a transcript.
///
/// Fails while pending-tool markers remain: the transcript would end in a
/// tool call with no result.
pub async fn load_resume_state(
    store: &dyn SessionStorePort,
    session_id: &SessionId,
) -> Result<Option<ResumeState>> {
    let Some(sdk_session_id) = store
        .runtime_session_id(session_id)
        .await
        .context("failed reading runtime session id")?
    else {
        return Ok(None);
    };

    let entries = store
        .list(session_id)
        .await
        .context("failed listing session entries")?;
    let pending = entries
        .iter()
        .filter(|entry| entry.pending_tool_call().is_some())
        .count();
    if pending > 0 {
        bail!("session {session_id} has {pending} tool call(s) awaiting approval results");
    }

    let lines: Vec<String> = entries
        .iter()
        .filter_map(|entry| entry.transcript_line())
        .collect();
    if lines.is_empty() {
        return Ok(None);
    }
    debug!(session_id = %session_id, lines = lines.len(), "rebuilt resume transcript");

    Ok(Some(ResumeState {
        sdk_session_id,
        sdk_session_data: lines.join("\n"),
    }))
}
