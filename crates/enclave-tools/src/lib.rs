//! Execution of tool calls that paused for approval.
//!
//! A run that hit an approval gate leaves one pending-tool marker per paused
//! call in the session. Once a human has decided, [`ApprovedToolRunner`]
//! executes the approved calls, synthesizes results for the denied ones, and
//! swaps the markers for those results in a single store operation so the
//! next resumed run sees a consistent transcript.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use enclave_approval::{
    ApprovalDecision, ApprovalError, ApprovalLedger, ApprovalRecord, ApprovalState, ToolTarget,
    classify_tool,
};
use enclave_protocol::{
    ActionLock, ActionResolverPort, EventChannelPort, HeartbeatDetails, HeartbeatPort, SessionId,
    SessionStorePort, ToolCallContent, ToolCallId, ToolExecutionClaims, ToolResultEntry,
    UnifiedStreamEvent,
};
use enclave_tokens::TokenAuthority;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

const UNDECIDED_REASON: &str = "no approval decision was recorded for this tool call";

#[derive(Debug, Clone)]
pub struct ToolRunnerConfig {
    /// Lifetime of the tool-execution token minted for this activity.
    pub token_ttl: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for ToolRunnerConfig {
    fn default() -> Self {
        Self {
            token_ttl: Duration::from_secs(15 * 60),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionReport {
    /// One result per paused call, in the order the calls were requested.
    pub results: Vec<ToolResultEntry>,
    pub executed: usize,
    pub denied: usize,
    /// Decisions naming calls with no pending marker.
    pub skipped: Vec<ToolCallId>,
    /// Markers swapped for results in the store.
    pub replaced: usize,
    /// `jti` of the tool-execution token the approved calls ran under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
}

#[derive(Clone)]
pub struct ApprovedToolRunner {
    store: Arc<dyn SessionStorePort>,
    resolver: Arc<dyn ActionResolverPort>,
    events: Arc<dyn EventChannelPort>,
    heartbeat: Arc<dyn HeartbeatPort>,
    tokens: Arc<TokenAuthority>,
    config: ToolRunnerConfig,
}

impl ApprovedToolRunner {
    pub fn new(
        store: Arc<dyn SessionStorePort>,
        resolver: Arc<dyn ActionResolverPort>,
        events: Arc<dyn EventChannelPort>,
        heartbeat: Arc<dyn HeartbeatPort>,
        tokens: Arc<TokenAuthority>,
        config: ToolRunnerConfig,
    ) -> Self {
        Self {
            store,
            resolver,
            events,
            heartbeat,
            tokens,
            config,
        }
    }

    /// Apply `decisions` to the session's paused tool calls.
    ///
    /// Safe to re-deliver: once the markers are replaced, a repeated call
    /// finds nothing pending and executes nothing.
    #[instrument(skip(self, claims, decisions), fields(session_id = %session_id, decisions = decisions.len()))]
    pub async fn execute(
        &self,
        session_id: &SessionId,
        claims: &ToolExecutionClaims,
        decisions: Vec<ApprovalDecision>,
    ) -> Result<ToolExecutionReport> {
        if claims.session_id != *session_id {
            bail!(
                "tool execution claims are for session {}, not {session_id}",
                claims.session_id
            );
        }
        let started = Instant::now();

        let pending = self.pending_calls(session_id).await?;
        let mut ledger = ApprovalLedger::from_pending(pending);
        let mut report = ToolExecutionReport::default();

        for decision in decisions {
            let tool_call_id = decision.tool_call_id.clone();
            match ledger.decide(decision) {
                Ok(_) => {}
                Err(ApprovalError::UnknownToolCall(_)) => {
                    debug!(tool_call_id = %tool_call_id, "no pending marker, skipping decision");
                    report.skipped.push(tool_call_id);
                }
                Err(error) => warn!(error = %error, "ignoring conflicting decision"),
            }
        }
        let undecided = ledger.deny_undecided(UNDECIDED_REASON);
        if undecided > 0 {
            warn!(undecided, "denying paused tool calls without a decision");
        }
        if ledger.is_empty() {
            info!("no paused tool calls");
            return Ok(report);
        }

        let approved: Vec<ApprovalRecord> = ledger
            .in_state(ApprovalState::ApprovedQueued)
            .cloned()
            .collect();
        let mut outputs = Vec::with_capacity(approved.len());
        if !approved.is_empty() {
            let (token_id, claims) = self.fresh_claims(claims)?;
            report.token_id = Some(token_id);
            let lock = self.resolve_lock(&approved, &claims).await?;
            for record in &approved {
                let result = self
                    .run_approved(session_id, record, &claims, &lock, started)
                    .await;
                ledger
                    .mark_executed(&record.tool_call.id)
                    .context("approved call changed state during execution")?;
                outputs.push(result);
            }
        }

        for record in ledger.records() {
            match record.state {
                ApprovalState::Executed => {
                    if let Some(result) = outputs
                        .iter()
                        .find(|result| result.tool_call_id == record.tool_call.id)
                    {
                        report.results.push(result.clone());
                        report.executed += 1;
                    }
                }
                ApprovalState::Denied => {
                    report.results.push(denial_result(record));
                    report.denied += 1;
                }
                ApprovalState::PendingApproval | ApprovalState::ApprovedQueued => {}
            }
        }

        report.replaced = match self
            .store
            .replace_pending_with_results(session_id, report.results.clone())
            .await
        {
            Ok(replaced) => replaced,
            Err(source) => {
                // The markers survive, so re-delivering the decisions would
                // run these calls again.
                let executed: Vec<&str> = outputs
                    .iter()
                    .map(|result| result.tool_call_id.as_str())
                    .collect();
                error!(error = %source, executed = ?executed, "tool results not persisted after execution");
                return Err(anyhow::Error::new(source).context(format!(
                    "failed writing tool results into the session; already executed: [{}]",
                    executed.join(", ")
                )));
            }
        };
        self.publish_results(session_id, &report.results).await;

        info!(
            executed = report.executed,
            denied = report.denied,
            replaced = report.replaced,
            "approved tool calls applied"
        );
        Ok(report)
    }

    async fn pending_calls(&self, session_id: &SessionId) -> Result<Vec<ToolCallContent>> {
        let entries = self
            .store
            .list(session_id)
            .await
            .context("failed listing session entries")?;
        Ok(entries
            .iter()
            .filter_map(|entry| entry.pending_tool_call().cloned())
            .collect())
    }

    /// Mint a new token for this activity. The one issued to the paused run
    /// may have expired while the call waited on a human.
    ///
    /// The claims handed to the resolver are the ones decoded from this
    /// token, so every execution is authorized by a token that verified now.
    fn fresh_claims(&self, claims: &ToolExecutionClaims) -> Result<(String, ToolExecutionClaims)> {
        let token = self
            .tokens
            .mint_tool_token(claims, self.config.token_ttl)
            .context("failed minting tool-execution token")?;
        let verified = self
            .tokens
            .verify_tool_token(&token)
            .context("freshly minted tool-execution token did not verify")?;
        debug!(jti = %verified.registered.jti, exp = verified.registered.exp, "minted tool-execution token");
        Ok((verified.registered.jti, verified.claims))
    }

    async fn resolve_lock(
        &self,
        approved: &[ApprovalRecord],
        claims: &ToolExecutionClaims,
    ) -> Result<ActionLock> {
        let mut action_names: Vec<String> = approved
            .iter()
            .filter_map(|record| match classify_tool(&record.tool_call.name) {
                ToolTarget::Action(name) if claims.allows_action(&name) => Some(name),
                _ => None,
            })
            .collect();
        action_names.sort();
        action_names.dedup();
        if action_names.is_empty() {
            return Ok(ActionLock::default());
        }
        self.resolver
            .resolve(&action_names)
            .await
            .context("failed resolving approved actions")
    }

    #[instrument(skip_all, fields(tool_call_id = %record.tool_call.id, tool = %record.tool_call.name))]
    async fn run_approved(
        &self,
        session_id: &SessionId,
        record: &ApprovalRecord,
        claims: &ToolExecutionClaims,
        lock: &ActionLock,
        started: Instant,
    ) -> ToolResultEntry {
        let call = &record.tool_call;
        let target = classify_tool(&call.name);
        if !target.is_allowed_by(claims) {
            warn!(target = target.name(), "approved tool is not permitted by the session claims");
            return ToolResultEntry {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                output: Value::String(format!(
                    "Tool {} is not permitted for this session",
                    target.name()
                )),
                is_error: true,
            };
        }

        let execution = self.resolver.execute(
            target.name(),
            record.effective_input().clone(),
            claims,
            lock,
        );
        tokio::pin!(execution);
        let mut ticker =
            tokio::time::interval(self.config.heartbeat_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        let outcome = loop {
            tokio::select! {
                outcome = &mut execution => break outcome,
                _ = ticker.tick() => {
                    self.heartbeat.heartbeat(HeartbeatDetails {
                        session_id: session_id.clone(),
                        phase: format!("executing {}", target.name()),
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });
                }
            }
        };

        match outcome {
            Ok(output) => {
                debug!("approved tool executed");
                ToolResultEntry {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    output,
                    is_error: false,
                }
            }
            Err(error) => {
                warn!(error = %error, "approved tool failed");
                ToolResultEntry {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    output: Value::String(format!("Tool execution failed: {error}")),
                    is_error: true,
                }
            }
        }
    }

    async fn publish_results(&self, session_id: &SessionId, results: &[ToolResultEntry]) {
        let sink = match self.events.open(session_id).await {
            Ok(sink) => sink,
            Err(error) => {
                warn!(error = %error, "failed opening event channel for tool results");
                return;
            }
        };
        for result in results {
            let event = UnifiedStreamEvent::tool_result(
                result.tool_call_id.clone(),
                result.tool_name.clone(),
                result.output.clone(),
                result.is_error,
            );
            if let Err(error) = sink.append(&event).await {
                warn!(error = %error, tool_call_id = %result.tool_call_id, "failed publishing tool result");
            }
        }
    }
}

fn denial_result(record: &ApprovalRecord) -> ToolResultEntry {
    let message = match record.denial_reason() {
        Some(reason) => format!("Tool call denied: {reason}"),
        None => "Tool call denied by the user".to_owned(),
    };
    ToolResultEntry {
        tool_call_id: record.tool_call.id.clone(),
        tool_name: record.tool_call.name.clone(),
        output: Value::String(message),
        is_error: true,
    }
}
