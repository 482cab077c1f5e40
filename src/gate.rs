//! Permission gate
//!
//! Decides whether a tool call may run. AutoAllow and Deny resolve
//! immediately; AskHost sends a `tool/permission` request to the host and
//! parks the call in a pending table keyed by session and call id until the
//! host answers,
//! the session is cancelled, or the approval timeout elapses (→ Deny).
//!
//! Whoever removes the pending entry owns the resolution, so each approval
//! resolves exactly once even when an answer races the timeout.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::permissions::Decision;
use crate::protocol::PermissionOutcome;
use crate::session::{SessionMode, SessionPolicy};
use crate::tools::{ToolCall, ToolDescriptor};

/// What the host is asked to approve
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub session_id: String,
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
}

/// The host's answer and the id of the request it answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAnswer {
    pub outcome: PermissionOutcome,
    pub correlation_id: Option<String>,
}

/// Channel to the host for approval round trips.
#[async_trait]
pub trait HostApprover: Send + Sync {
    /// Ask the host and wait for its answer. An error means the host could
    /// not be asked; the call is denied.
    async fn ask(&self, request: ApprovalRequest) -> anyhow::Result<HostAnswer>;
}

/// Result of gating one call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyDecision {
    pub tool_name: String,
    pub decision: Decision,
    /// Id of the host response that settled an Ask
    pub correlation_id: Option<String>,
    pub reason: Option<String>,
    /// Host chose `allow_always`
    pub remember: bool,
}

impl PolicyDecision {
    fn new(tool_name: &str, decision: Decision) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            decision,
            correlation_id: None,
            reason: None,
            remember: false,
        }
    }

    fn denied(tool_name: &str, reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::new(tool_name, Decision::Deny)
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }
}

#[derive(Debug)]
enum Resolution {
    Host(HostAnswer),
    Unreachable(String),
    Cancelled,
}

#[derive(Debug)]
struct PendingApproval {
    tool_name: String,
    requested_at: Instant,
    tx: oneshot::Sender<Resolution>,
}

/// Call ids restart in every session, so approvals are keyed by both.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ApprovalKey {
    session_id: String,
    call_id: String,
}

impl ApprovalKey {
    fn new(session_id: &str, call_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            call_id: call_id.to_string(),
        }
    }
}

type PendingTable = Arc<Mutex<HashMap<ApprovalKey, PendingApproval>>>;

fn lock(table: &PendingTable) -> MutexGuard<'_, HashMap<ApprovalKey, PendingApproval>> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Remove the entry and deliver `resolution`; false if already settled.
fn settle(table: &PendingTable, key: &ApprovalKey, resolution: Resolution) -> bool {
    let Some(entry) = lock(table).remove(key) else {
        return false;
    };
    tracing::debug!(
        session_id = %key.session_id,
        call_id = %key.call_id,
        tool = %entry.tool_name,
        waited_ms = entry.requested_at.elapsed().as_millis() as u64,
        "Approval settled"
    );
    let _ = entry.tx.send(resolution);
    true
}

pub struct PermissionGate {
    approver: Arc<dyn HostApprover>,
    approval_timeout: Duration,
    pending: PendingTable,
}

impl std::fmt::Debug for PermissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionGate")
            .field("approval_timeout", &self.approval_timeout)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl PermissionGate {
    pub fn new(approver: Arc<dyn HostApprover>, approval_timeout: Duration) -> Self {
        Self {
            approver,
            approval_timeout,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn approval_timeout(&self) -> Duration {
        self.approval_timeout
    }

    /// Effective decision without contacting the host: policy rules override
    /// the descriptor tier, and auto-approve mode turns Ask into Allow.
    pub fn classify(
        &self,
        descriptor: &ToolDescriptor,
        call: &ToolCall,
        policy: &SessionPolicy,
    ) -> Decision {
        let tier = policy
            .rules
            .evaluate(&call.name, &call.arguments)
            .unwrap_or(descriptor.tier);
        match Decision::from(tier) {
            Decision::Ask if policy.mode == SessionMode::AutoApprove => Decision::Allow,
            decision => decision,
        }
    }

    /// Gate one call, asking the host when needed.
    pub async fn evaluate(
        &self,
        descriptor: &ToolDescriptor,
        call: &ToolCall,
        session_id: &str,
        policy: &SessionPolicy,
        cancel: &CancellationToken,
    ) -> PolicyDecision {
        match self.classify(descriptor, call, policy) {
            Decision::Ask => self.request_approval(call, session_id, cancel).await,
            Decision::Deny => PolicyDecision::denied(&call.name, "denied by policy"),
            Decision::Allow => PolicyDecision::new(&call.name, Decision::Allow),
        }
    }

    /// Round-trip an approval request and wait for its single resolution.
    pub async fn request_approval(
        &self,
        call: &ToolCall,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> PolicyDecision {
        let key = ApprovalKey::new(session_id, &call.id);
        let (tx, mut rx) = oneshot::channel();
        let replaced = lock(&self.pending).insert(
            key.clone(),
            PendingApproval {
                tool_name: call.name.clone(),
                requested_at: Instant::now(),
                tx,
            },
        );
        if replaced.is_some() {
            tracing::warn!(session_id, call_id = %call.id, "Replaced a pending approval");
        }
        tracing::info!(
            name: "a3s.permission.request",
            session_id,
            call_id = %call.id,
            tool = %call.name,
            "Awaiting host approval"
        );

        let request = ApprovalRequest {
            session_id: session_id.to_string(),
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
        };
        let approver = self.approver.clone();
        let table = self.pending.clone();
        let forward_key = key.clone();
        let forward = tokio::spawn(async move {
            let resolution = match approver.ask(request).await {
                Ok(answer) => Resolution::Host(answer),
                Err(e) => Resolution::Unreachable(e.to_string()),
            };
            settle(&table, &forward_key, resolution);
        });

        enum Wake {
            Settled(Result<Resolution, oneshot::error::RecvError>),
            TimedOut,
            Cancelled,
        }
        let wake = tokio::select! {
            r = &mut rx => Wake::Settled(r),
            _ = tokio::time::sleep(self.approval_timeout) => Wake::TimedOut,
            _ = cancel.cancelled() => Wake::Cancelled,
        };

        let decision = match wake {
            Wake::Settled(r) => self.decide(call, r.unwrap_or(Resolution::Cancelled)),
            Wake::TimedOut => {
                if lock(&self.pending).remove(&key).is_some() {
                    tracing::warn!(
                        name: "a3s.permission.timeout",
                        session_id,
                        call_id = %call.id,
                        timeout_ms = self.approval_timeout.as_millis() as u64,
                        "Approval timed out, denying"
                    );
                    PolicyDecision::denied(&call.name, "approval timed out")
                } else {
                    // an answer won the race; it is already in the channel
                    self.decide(call, rx.await.unwrap_or(Resolution::Cancelled))
                }
            }
            Wake::Cancelled => {
                if lock(&self.pending).remove(&key).is_some() {
                    PolicyDecision::denied(&call.name, "session cancelled")
                } else {
                    self.decide(call, rx.await.unwrap_or(Resolution::Cancelled))
                }
            }
        };
        forward.abort();
        decision
    }

    fn decide(&self, call: &ToolCall, resolution: Resolution) -> PolicyDecision {
        match resolution {
            Resolution::Host(answer) => {
                let mut decision = if answer.outcome.is_allow() {
                    PolicyDecision::new(&call.name, Decision::Allow)
                } else {
                    let reason = format!("host answered {:?}", answer.outcome);
                    PolicyDecision::denied(&call.name, reason)
                };
                decision.remember = answer.outcome == PermissionOutcome::AllowAlways;
                decision.correlation_id = answer.correlation_id;
                decision
            }
            Resolution::Unreachable(e) => {
                tracing::warn!(call_id = %call.id, error = %e, "Approval request failed");
                PolicyDecision::denied(&call.name, format!("host unreachable: {}", e))
            }
            Resolution::Cancelled => PolicyDecision::denied(&call.name, "approval cancelled"),
        }
    }

    /// Settle a pending approval from an out-of-band host message.
    pub fn resolve(&self, session_id: &str, call_id: &str, outcome: PermissionOutcome) -> bool {
        settle(
            &self.pending,
            &ApprovalKey::new(session_id, call_id),
            Resolution::Host(HostAnswer {
                outcome,
                correlation_id: None,
            }),
        )
    }

    /// Deny every pending approval of a session. Returns how many were pending.
    pub fn cancel_session(&self, session_id: &str) -> usize {
        let keys: Vec<ApprovalKey> = lock(&self.pending)
            .keys()
            .filter(|key| key.session_id == session_id)
            .cloned()
            .collect();
        keys.iter()
            .filter(|key| settle(&self.pending, key, Resolution::Cancelled))
            .count()
    }

    pub fn is_pending(&self, session_id: &str, call_id: &str) -> bool {
        lock(&self.pending).contains_key(&ApprovalKey::new(session_id, call_id))
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::{PermissionPolicy, PermissionTier};
    use crate::tools::{handler_fn, ToolOutput};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Never answers; counts how often it was asked.
    struct SilentHost {
        asked: AtomicUsize,
    }

    #[async_trait]
    impl HostApprover for SilentHost {
        async fn ask(&self, _request: ApprovalRequest) -> anyhow::Result<HostAnswer> {
            self.asked.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    struct AnsweringHost(PermissionOutcome);

    #[async_trait]
    impl HostApprover for AnsweringHost {
        async fn ask(&self, request: ApprovalRequest) -> anyhow::Result<HostAnswer> {
            Ok(HostAnswer {
                outcome: self.0,
                correlation_id: Some(format!("req-{}", request.call_id)),
            })
        }
    }

    struct BrokenHost;

    #[async_trait]
    impl HostApprover for BrokenHost {
        async fn ask(&self, _request: ApprovalRequest) -> anyhow::Result<HostAnswer> {
            anyhow::bail!("transport closed")
        }
    }

    fn descriptor(tier: PermissionTier) -> ToolDescriptor {
        ToolDescriptor::new(
            "run_cmd",
            handler_fn(|_args, _ctx| async { Ok(ToolOutput::success("")) }),
        )
        .with_tier(tier)
    }

    fn call(id: &str) -> ToolCall {
        ToolCall::new(id, "run_cmd", json!({"command": "ls"}))
    }

    fn policy(mode: SessionMode, rules: PermissionPolicy) -> SessionPolicy {
        SessionPolicy { mode, rules }
    }

    // ========================================================================
    // Classification
    // ========================================================================

    #[test]
    fn test_classify_tiers_and_overrides() {
        let gate = PermissionGate::new(Arc::new(BrokenHost), Duration::from_secs(1));
        let plain = policy(SessionMode::ApprovalRequired, PermissionPolicy::new());
        let classify =
            |tier, policy: &SessionPolicy| gate.classify(&descriptor(tier), &call("c"), policy);

        assert_eq!(classify(PermissionTier::AutoAllow, &plain), Decision::Allow);
        assert_eq!(classify(PermissionTier::Deny, &plain), Decision::Deny);
        assert_eq!(classify(PermissionTier::AskHost, &plain), Decision::Ask);

        let auto = policy(SessionMode::AutoApprove, PermissionPolicy::new());
        assert_eq!(classify(PermissionTier::AskHost, &auto), Decision::Allow);
        assert_eq!(classify(PermissionTier::Deny, &auto), Decision::Deny);

        let rules = policy(SessionMode::AutoApprove, PermissionPolicy::new().deny("run_cmd(ls)"));
        assert_eq!(classify(PermissionTier::AutoAllow, &rules), Decision::Deny);
    }

    #[tokio::test]
    async fn test_auto_tiers_never_contact_host() {
        let host = Arc::new(SilentHost { asked: AtomicUsize::new(0) });
        let gate = PermissionGate::new(host.clone(), Duration::from_secs(1));
        let plain = policy(SessionMode::ApprovalRequired, PermissionPolicy::new());
        let token = CancellationToken::new();

        let allow = gate
            .evaluate(&descriptor(PermissionTier::AutoAllow), &call("c1"), "s", &plain, &token)
            .await;
        assert!(allow.is_allowed());
        let deny = gate
            .evaluate(&descriptor(PermissionTier::Deny), &call("c2"), "s", &plain, &token)
            .await;
        assert_eq!(deny.decision, Decision::Deny);
        assert_eq!(host.asked.load(Ordering::SeqCst), 0);
    }

    // ========================================================================
    // Host round trip
    // ========================================================================

    #[tokio::test]
    async fn test_host_answers() {
        let plain = policy(SessionMode::ApprovalRequired, PermissionPolicy::new());
        let token = CancellationToken::new();

        let host = Arc::new(AnsweringHost(PermissionOutcome::AllowAlways));
        let gate = PermissionGate::new(host, Duration::from_secs(5));
        let d = gate
            .evaluate(&descriptor(PermissionTier::AskHost), &call("call_1"), "s", &plain, &token)
            .await;
        assert!(d.is_allowed());
        assert!(d.remember);
        assert_eq!(d.correlation_id.as_deref(), Some("req-call_1"));
        assert_eq!(gate.pending_count(), 0);

        let host = Arc::new(AnsweringHost(PermissionOutcome::RejectOnce));
        let gate = PermissionGate::new(host, Duration::from_secs(5));
        let d = gate
            .evaluate(&descriptor(PermissionTier::AskHost), &call("call_2"), "s", &plain, &token)
            .await;
        assert_eq!(d.decision, Decision::Deny);
        assert!(!d.remember);
    }

    #[tokio::test]
    async fn test_unreachable_host_denies() {
        let gate = PermissionGate::new(Arc::new(BrokenHost), Duration::from_secs(5));
        let d = gate
            .request_approval(&call("call_1"), "s", &CancellationToken::new())
            .await;
        assert_eq!(d.decision, Decision::Deny);
        assert!(d.reason.unwrap().contains("transport closed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_denies_exactly_once_and_not_earlier() {
        let host = Arc::new(SilentHost { asked: AtomicUsize::new(0) });
        let gate = Arc::new(PermissionGate::new(host.clone(), Duration::from_secs(30)));

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.request_approval(&call("call_1"), "s", &CancellationToken::new())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(29_900)).await;
        assert!(gate.is_pending("s", "call_1"));
        assert!(!waiter.is_finished());

        let decision = waiter.await.unwrap();
        assert_eq!(decision.decision, Decision::Deny);
        assert_eq!(decision.reason.as_deref(), Some("approval timed out"));
        assert_eq!(host.asked.load(Ordering::SeqCst), 1);

        // a late answer finds nothing to resolve
        assert!(!gate.resolve("s", "call_1", PermissionOutcome::AllowOnce));
        assert_eq!(gate.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_band_resolve() {
        let gate = Arc::new(PermissionGate::new(
            Arc::new(SilentHost { asked: AtomicUsize::new(0) }),
            Duration::from_secs(30),
        ));
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.request_approval(&call("call_5"), "s", &CancellationToken::new())
                    .await
            })
        };
        while !gate.is_pending("s", "call_5") {
            tokio::task::yield_now().await;
        }
        assert!(!gate.resolve("other", "call_5", PermissionOutcome::AllowOnce));
        assert!(gate.resolve("s", "call_5", PermissionOutcome::AllowOnce));
        assert!(!gate.resolve("s", "call_5", PermissionOutcome::RejectOnce));
        assert!(waiter.await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_cancel_session_denies_only_that_session() {
        let gate = Arc::new(PermissionGate::new(
            Arc::new(SilentHost { asked: AtomicUsize::new(0) }),
            Duration::from_secs(30),
        ));
        let spawn = |id: &'static str, session: &'static str| {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.request_approval(&call(id), session, &CancellationToken::new())
                    .await
            })
        };
        let a = spawn("call_a", "s1");
        let b = spawn("call_b", "s2");
        while gate.pending_count() < 2 {
            tokio::task::yield_now().await;
        }

        assert_eq!(gate.cancel_session("s1"), 1);
        assert_eq!(a.await.unwrap().decision, Decision::Deny);
        assert!(gate.is_pending("s2", "call_b"));

        gate.resolve("s2", "call_b", PermissionOutcome::AllowOnce);
        assert!(b.await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_same_call_id_in_two_sessions_stays_separate() {
        let host = Arc::new(SilentHost { asked: AtomicUsize::new(0) });
        let gate = Arc::new(PermissionGate::new(host.clone(), Duration::from_secs(30)));
        let spawn = |session: &'static str| {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.request_approval(&call("call_1"), session, &CancellationToken::new())
                    .await
            })
        };
        let a = spawn("session-a");
        while !gate.is_pending("session-a", "call_1") {
            tokio::task::yield_now().await;
        }
        let b = spawn("session-b");
        while gate.pending_count() < 2 {
            tokio::task::yield_now().await;
        }

        // the second request must not displace the first
        assert!(gate.is_pending("session-a", "call_1"));
        assert!(!a.is_finished());

        assert!(gate.resolve("session-b", "call_1", PermissionOutcome::AllowOnce));
        assert!(b.await.unwrap().is_allowed());
        assert!(gate.is_pending("session-a", "call_1"));

        assert!(gate.resolve("session-a", "call_1", PermissionOutcome::RejectOnce));
        let decision = a.await.unwrap();
        assert_eq!(decision.decision, Decision::Deny);
        assert_eq!(decision.reason.as_deref(), Some("host answered RejectOnce"));
        assert_eq!(host.asked.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_token_denies() {
        let gate = PermissionGate::new(
            Arc::new(SilentHost { asked: AtomicUsize::new(0) }),
            Duration::from_secs(30),
        );
        let token = CancellationToken::new();
        token.cancel();
        let d = gate.request_approval(&call("call_1"), "s", &token).await;
        assert_eq!(d.decision, Decision::Deny);
        assert_eq!(gate.pending_count(), 0);
    }
}
