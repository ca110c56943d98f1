use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use enclave_protocol::{
    AppendOutcome, LineId, PortError, PortResult, SessionEntry, SessionId, SessionStorePort,
    ToolResultEntry,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, instrument};

/// Session log per session: `<root>/sessions/<session_id>.jsonl`, one
/// [`SessionEntry`] per line, plus `<session_id>.meta.json` for the runtime's
/// internal session id and the ids of lines a rewrite removed.
///
/// Writes to one session are serialized by a per-session async mutex;
/// different sessions never contend.
#[derive(Debug)]
pub struct FileSessionStore {
    root: PathBuf,
    write_locks: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
    line_ids: Mutex<HashMap<SessionId, HashSet<LineId>>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sdk_session_id: Option<String>,
    /// Removed by a rewrite. A replay of one of these is still a duplicate.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    dropped_line_ids: BTreeSet<LineId>,
}

/// Where the result for one paused call lands in the rewritten log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResultSlot {
    /// In place of the runtime's interrupted-result placeholder.
    Placeholder(usize),
    /// Right after the line carrying the matching `tool_use`.
    AfterToolUse(usize),
    /// Where the pending marker was.
    Marker,
}

/// A runtime line whose `tool_result` blocks only answer calls that are
/// about to get real results.
fn is_placeholder(entry: &SessionEntry, pending: &HashSet<String>) -> bool {
    if entry.pending_tool_call().is_some() {
        return false;
    }
    let answered = entry.answered_tool_call_ids();
    !answered.is_empty() && answered.iter().all(|id| pending.contains(*id))
}

/// The result of a call must follow its `tool_use`, which the runtime may
/// flush after the approval request that created the marker.
fn result_slots(entries: &[SessionEntry], pending: &HashSet<String>) -> HashMap<String, ResultSlot> {
    let mut tool_use: HashMap<&str, usize> = HashMap::new();
    let mut placeholder: HashMap<&str, usize> = HashMap::new();
    for (index, entry) in entries.iter().enumerate() {
        if entry.pending_tool_call().is_some() {
            continue;
        }
        for id in entry.proposed_tool_call_ids() {
            if pending.contains(id) {
                tool_use.entry(id).or_insert(index);
            }
        }
        if is_placeholder(entry, pending) {
            for id in entry.answered_tool_call_ids() {
                placeholder.entry(id).or_insert(index);
            }
        }
    }
    pending
        .iter()
        .map(|id| {
            let slot = match (placeholder.get(id.as_str()), tool_use.get(id.as_str())) {
                (Some(&at), Some(&used)) if at > used => ResultSlot::Placeholder(at),
                (Some(&at), None) => ResultSlot::Placeholder(at),
                (_, Some(&used)) => ResultSlot::AfterToolUse(used),
                (None, None) => ResultSlot::Marker,
            };
            (id.clone(), slot)
        })
        .collect()
}

impl FileSessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_locks: Mutex::new(HashMap::new()),
            line_ids: Mutex::new(HashMap::new()),
        }
    }

    fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    fn log_path(&self, session_id: &SessionId) -> PortResult<PathBuf> {
        session_id.validate()?;
        Ok(self.sessions_dir().join(format!("{session_id}.jsonl")))
    }

    fn meta_path(&self, session_id: &SessionId) -> PortResult<PathBuf> {
        session_id.validate()?;
        Ok(self.sessions_dir().join(format!("{session_id}.meta.json")))
    }

    async fn ensure_dir(&self) -> PortResult<()> {
        let dir = self.sessions_dir();
        fs::create_dir_all(&dir)
            .await
            .map_err(|error| PortError::Io(format!("failed to create sessions dir {dir:?}: {error}")))
    }

    fn lock_for(&self, session_id: &SessionId) -> Arc<tokio::sync::Mutex<()>> {
        let mut guard = self.write_locks.lock();
        guard
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn read_entries(path: &Path) -> PortResult<Vec<SessionEntry>> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let file = OpenOptions::new().read(true).open(path).await?;
        let mut reader = BufReader::new(file).lines();
        let mut entries = Vec::new();
        while let Some(line) = reader.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let entry: SessionEntry = serde_json::from_str(&line).map_err(|error| {
                PortError::Serialization(format!("failed parsing session entry in {path:?}: {error}"))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Replace `path` with `contents` via a sibling temp file and rename.
    async fn write_atomic(path: &Path, contents: &[u8]) -> PortResult<()> {
        let tmp = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn is_known_line(&self, session_id: &SessionId, line_id: &LineId) -> PortResult<bool> {
        let cached = self.line_ids.lock().get(session_id).map(|ids| ids.contains(line_id));
        if let Some(known) = cached {
            return Ok(known);
        }
        let mut ids: HashSet<LineId> = Self::read_entries(&self.log_path(session_id)?)
            .await?
            .into_iter()
            .map(|entry| entry.line_id)
            .collect();
        ids.extend(Self::read_meta(&self.meta_path(session_id)?).await?.dropped_line_ids);
        let known = ids.contains(line_id);
        self.line_ids.lock().insert(session_id.clone(), ids);
        Ok(known)
    }

    async fn read_meta(path: &Path) -> PortResult<SessionMeta> {
        match fs::read(path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(SessionMeta::default()),
            Err(error) => Err(error.into()),
        }
    }
}

#[async_trait]
impl SessionStorePort for FileSessionStore {
    #[instrument(skip(self, entry), fields(session_id = %session_id, line_id = %entry.line_id))]
    async fn append(&self, session_id: &SessionId, entry: SessionEntry) -> PortResult<AppendOutcome> {
        let path = self.log_path(session_id)?;
        self.ensure_dir().await?;

        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        if self.is_known_line(session_id, &entry.line_id).await? {
            debug!("duplicate session line skipped");
            return Ok(AppendOutcome::Duplicate);
        }

        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|error| PortError::Io(format!("failed opening session log {path:?}: {error}")))?;
        file.write_all(&line).await?;
        file.flush().await?;

        self.line_ids
            .lock()
            .entry(session_id.clone())
            .or_default()
            .insert(entry.line_id);
        debug!("session entry appended");
        Ok(AppendOutcome::Appended)
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    async fn list(&self, session_id: &SessionId) -> PortResult<Vec<SessionEntry>> {
        let path = self.log_path(session_id)?;
        let entries = Self::read_entries(&path).await?;
        debug!(count = entries.len(), "session entries loaded");
        Ok(entries)
    }

    #[instrument(skip(self, results), fields(session_id = %session_id, results = results.len()))]
    async fn replace_pending_with_results(
        &self,
        session_id: &SessionId,
        results: Vec<ToolResultEntry>,
    ) -> PortResult<usize> {
        let path = self.log_path(session_id)?;
        let meta_path = self.meta_path(session_id)?;

        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let entries = Self::read_entries(&path).await?;
        let mut meta = Self::read_meta(&meta_path).await?;
        let sdk_session_id = meta.sdk_session_id.clone();
        let mut by_call: HashMap<&str, &ToolResultEntry> = results
            .iter()
            .map(|result| (result.tool_call_id.as_str(), result))
            .collect();

        let pending: HashSet<String> = entries
            .iter()
            .filter_map(|entry| entry.pending_tool_call())
            .filter(|call| by_call.contains_key(call.id.as_str()))
            .map(|call| call.id.to_string())
            .collect();
        if pending.is_empty() {
            debug!("no pending tool markers matched");
            return Ok(0);
        }
        let slots = result_slots(&entries, &pending);

        let mut rewritten = Vec::with_capacity(entries.len());
        let mut dropped = Vec::new();
        let mut replaced = 0;
        for (index, entry) in entries.into_iter().enumerate() {
            if let Some(call) = entry.pending_tool_call() {
                if !pending.contains(call.id.as_str()) {
                    rewritten.push(entry);
                } else if slots.get(call.id.as_str()) == Some(&ResultSlot::Marker)
                    && let Some(result) = by_call.remove(call.id.as_str())
                {
                    rewritten.push(SessionEntry::tool_result(result, sdk_session_id.as_deref()));
                    replaced += 1;
                }
                continue;
            }
            if is_placeholder(&entry, &pending) {
                for id in entry.answered_tool_call_ids() {
                    if slots.get(id) == Some(&ResultSlot::Placeholder(index))
                        && let Some(result) = by_call.remove(id)
                    {
                        rewritten.push(SessionEntry::tool_result(result, sdk_session_id.as_deref()));
                        replaced += 1;
                    }
                }
                debug!(line_id = %entry.line_id, "dropping interrupted tool result placeholder");
                dropped.push(entry.line_id);
                continue;
            }
            let answered_here: Vec<String> = entry
                .proposed_tool_call_ids()
                .into_iter()
                .filter(|id| slots.get(*id) == Some(&ResultSlot::AfterToolUse(index)))
                .map(str::to_owned)
                .collect();
            rewritten.push(entry);
            for id in answered_here {
                if let Some(result) = by_call.remove(id.as_str()) {
                    rewritten.push(SessionEntry::tool_result(result, sdk_session_id.as_deref()));
                    replaced += 1;
                }
            }
        }

        // Tombstones land before the log rewrite so a dropped id is always known.
        if !dropped.is_empty() {
            meta.dropped_line_ids.extend(dropped);
            Self::write_atomic(&meta_path, &serde_json::to_vec(&meta)?).await?;
        }

        let mut contents = Vec::new();
        for entry in &rewritten {
            contents.extend(serde_json::to_vec(entry)?);
            contents.push(b'\n');
        }
        Self::write_atomic(&path, &contents).await?;

        let mut known: HashSet<LineId> = rewritten.into_iter().map(|entry| entry.line_id).collect();
        known.extend(meta.dropped_line_ids);
        self.line_ids.lock().insert(session_id.clone(), known);
        debug!(replaced, "pending tool markers replaced with results");
        Ok(replaced)
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    async fn set_runtime_session_id(&self, session_id: &SessionId, sdk_session_id: &str) -> PortResult<bool> {
        let path = self.meta_path(session_id)?;
        self.ensure_dir().await?;

        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let mut meta = Self::read_meta(&path).await?;
        if meta.sdk_session_id.as_deref() == Some(sdk_session_id) {
            return Ok(false);
        }
        meta.sdk_session_id = Some(sdk_session_id.to_owned());
        Self::write_atomic(&path, &serde_json::to_vec(&meta)?).await?;
        debug!(sdk_session_id, "runtime session id recorded");
        Ok(true)
    }

    async fn runtime_session_id(&self, session_id: &SessionId) -> PortResult<Option<String>> {
        let path = self.meta_path(session_id)?;
        Ok(Self::read_meta(&path).await?.sdk_session_id)
    }
}
