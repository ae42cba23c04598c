//! Risk classification and the approval gateway.
//!
//! Every tool call is classified into a [`RiskTier`] by fixed rule tables:
//! pattern tables for shell and git commands, a capability table for
//! filesystem tools, and per-tool overrides. The active [`RiskPolicy`] maps
//! the tier to a [`Gate`]: run it, ask the user, or block it outright.
//! Deny patterns block regardless of policy.
//!
//! A gated call parks in `Approving` until [`ApprovalGateway::decide`] is
//! called with the request id published on the control channel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event::{AgentEvent, EventBus};
use crate::executor::ToolCall;

/// Risk classification of a tool call.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    /// Read-only, no side effects.
    Safe,
    /// Narrow, easily reversible side effects.
    Low,
    /// Mutating but contained.
    Medium,
    /// Destructive or hard to reverse.
    High,
    /// Potentially catastrophic.
    Critical,
}

impl std::fmt::Display for RiskTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Safe => "safe",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// How aggressively the gateway asks for human decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskPolicy {
    /// Ask from `medium` up.
    Strict,
    /// Ask from `high` up.
    #[default]
    Normal,
    /// Ask only for `critical`.
    Permissive,
}

impl RiskPolicy {
    /// Map a tier to a gate under this policy.
    #[must_use]
    pub fn gate(self, tier: RiskTier) -> Gate {
        let ask_from = match self {
            Self::Strict => RiskTier::Medium,
            Self::Normal => RiskTier::High,
            Self::Permissive => RiskTier::Critical,
        };
        if tier >= ask_from {
            Gate::RequireUser
        } else {
            Gate::Allow
        }
    }
}

/// The gateway's verdict for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    /// Run without asking.
    Allow,
    /// Park until the user decides.
    RequireUser,
    /// Never run; the reason explains which rule fired.
    Block(String),
}

/// A resolved user decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Whether the call may proceed.
    pub approved: bool,
    /// Optional reason given by the decider.
    pub reason: Option<String>,
}

/// Filesystem capability classes for capability-based tool rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FsCapability {
    Read,
    Write,
    Delete,
}

impl FsCapability {
    const fn tier(self) -> RiskTier {
        match self {
            Self::Read => RiskTier::Low,
            Self::Write => RiskTier::Medium,
            Self::Delete => RiskTier::High,
        }
    }
}

/// Convert a simple shell glob pattern to a [`Regex`].
/// Only `*` (match anything) and `?` (match one char) are supported.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

fn compile(table: &[(&str, RiskTier)]) -> Vec<(Regex, RiskTier)> {
    table
        .iter()
        .filter_map(|(p, tier)| glob_to_regex(p).map(|re| (re, *tier)))
        .collect()
}

/// Fixed rule tables mapping tool calls to risk tiers.
///
/// Built once at process start; the gateway never mutates them.
pub struct RiskRules {
    shell: Vec<(Regex, RiskTier)>,
    git: Vec<(Regex, RiskTier)>,
    deny: Vec<Regex>,
    fs: HashMap<&'static str, FsCapability>,
    overrides: HashMap<String, RiskTier>,
}

impl std::fmt::Debug for RiskRules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskRules")
            .field("shell_rules", &self.shell.len())
            .field("git_rules", &self.git.len())
            .field("deny_rules", &self.deny.len())
            .field("overrides", &self.overrides.len())
            .finish()
    }
}

impl Default for RiskRules {
    fn default() -> Self {
        let shell = compile(&[
            ("cat *", RiskTier::Safe),
            ("ls", RiskTier::Safe),
            ("ls *", RiskTier::Safe),
            ("pwd", RiskTier::Safe),
            ("echo *", RiskTier::Safe),
            ("head *", RiskTier::Safe),
            ("tail *", RiskTier::Safe),
            ("grep *", RiskTier::Low),
            ("find *", RiskTier::Low),
            ("wc *", RiskTier::Low),
            ("mkdir *", RiskTier::Medium),
            ("touch *", RiskTier::Medium),
            ("cp *", RiskTier::Medium),
            ("mv *", RiskTier::Medium),
            ("chmod *", RiskTier::High),
            ("rm -r*", RiskTier::Critical),
            ("rm -f*", RiskTier::Critical),
            ("rm *", RiskTier::High),
            ("sudo *", RiskTier::Critical),
            ("curl *", RiskTier::Medium),
        ]);
        let git = compile(&[
            ("git status*", RiskTier::Safe),
            ("git log*", RiskTier::Safe),
            ("git diff*", RiskTier::Safe),
            ("git show*", RiskTier::Safe),
            ("git branch*", RiskTier::Low),
            ("git add *", RiskTier::Low),
            ("git commit*", RiskTier::Low),
            ("git checkout*", RiskTier::Medium),
            ("git merge*", RiskTier::Medium),
            ("git stash*", RiskTier::Medium),
            ("git push --force*", RiskTier::Critical),
            ("git push -f*", RiskTier::Critical),
            ("git reset --hard*", RiskTier::Critical),
            ("git clean*", RiskTier::Critical),
            ("git push*", RiskTier::High),
            ("git rebase*", RiskTier::High),
        ]);
        let deny = ["rm -rf /", "rm -fr /", "mkfs*", "dd *of=/dev/*", ":(){*"]
            .iter()
            .filter_map(|p| glob_to_regex(p))
            .collect();
        let fs = HashMap::from([
            ("read_file", FsCapability::Read),
            ("list", FsCapability::Read),
            ("list_dir", FsCapability::Read),
            ("stat", FsCapability::Read),
            ("glob", FsCapability::Read),
            ("write_file", FsCapability::Write),
            ("create_dir", FsCapability::Write),
            ("append_file", FsCapability::Write),
            ("delete_file", FsCapability::Delete),
            ("remove_dir", FsCapability::Delete),
        ]);
        Self {
            shell,
            git,
            deny,
            fs,
            overrides: HashMap::new(),
        }
    }
}

impl RiskRules {
    /// Add a per-tool tier override.
    #[must_use]
    pub fn with_override(mut self, tool: impl Into<String>, tier: RiskTier) -> Self {
        self.overrides.insert(tool.into(), tier);
        self
    }

    fn command_of(arguments: &Value) -> Option<&str> {
        arguments
            .get("command")
            .or_else(|| arguments.get("cmd"))
            .and_then(Value::as_str)
    }

    /// Check the deny table; returns the matched command when denied.
    #[must_use]
    pub fn denied(&self, name: &str, arguments: &Value) -> Option<String> {
        if !matches!(name, "shell" | "bash" | "sh" | "exec" | "git") {
            return None;
        }
        let command = Self::command_of(arguments)?;
        self.deny
            .iter()
            .any(|re| re.is_match(command))
            .then(|| command.to_string())
    }

    /// Classify a call into a tier.
    ///
    /// Order: explicit override, handler-declared tier, shell/git pattern
    /// tables, filesystem capability table, then `medium` as the fallback
    /// for unknown tools.
    #[must_use]
    pub fn classify(&self, name: &str, arguments: &Value, declared: Option<RiskTier>) -> RiskTier {
        if let Some(tier) = self.overrides.get(name) {
            return *tier;
        }
        if let Some(tier) = declared {
            return tier;
        }
        if matches!(name, "shell" | "bash" | "sh" | "exec" | "git")
            && let Some(command) = Self::command_of(arguments)
        {
            let table = if name == "git" || command.starts_with("git ") {
                &self.git
            } else {
                &self.shell
            };
            for (re, tier) in table {
                if re.is_match(command) {
                    return *tier;
                }
            }
            return RiskTier::High;
        }
        if let Some(cap) = self.fs.get(name) {
            return cap.tier();
        }
        RiskTier::Medium
    }
}

/// Publisher seam for approval traffic.
///
/// The default implementation publishes on the owning agent's control
/// channel; alternative transports (RPC, queues) live outside the core.
#[async_trait]
pub trait ApprovalTransport: Send + Sync {
    /// Announce that a call needs a decision.
    async fn publish_required(&self, agent_id: &str, request: &ApprovalRequest);

    /// Announce a resolved decision.
    async fn publish_decided(
        &self,
        agent_id: &str,
        request_id: &str,
        approved: bool,
        reason: Option<String>,
    );
}

/// A pending approval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Fresh id to pass back to `decide`.
    pub request_id: String,
    /// The call awaiting a decision.
    pub call: ToolCall,
    /// Why approval is required.
    pub reason: String,
    /// Non-binding hints for the decider.
    pub recommendations: Vec<String>,
}

/// Bus-backed [`ApprovalTransport`].
#[derive(Debug)]
pub struct BusApprovalTransport {
    bus: Arc<EventBus>,
}

impl BusApprovalTransport {
    /// Create a transport publishing on `bus`.
    #[must_use]
    pub const fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl ApprovalTransport for BusApprovalTransport {
    async fn publish_required(&self, agent_id: &str, request: &ApprovalRequest) {
        self.bus
            .publish(
                agent_id,
                AgentEvent::PermissionRequired {
                    request_id: request.request_id.clone(),
                    call: request.call.clone(),
                    reason: request.reason.clone(),
                    recommendations: request.recommendations.clone(),
                },
            )
            .await;
    }

    async fn publish_decided(
        &self,
        agent_id: &str,
        request_id: &str,
        approved: bool,
        reason: Option<String>,
    ) {
        self.bus
            .publish(
                agent_id,
                AgentEvent::PermissionDecided {
                    request_id: request_id.to_string(),
                    approved,
                    reason,
                },
            )
            .await;
    }
}

struct PendingRequest {
    agent_id: String,
    tx: oneshot::Sender<Decision>,
}

/// Gates tool calls on risk policy and user decisions.
///
/// The rule set is fixed at construction. Pending requests resolve through
/// [`decide`](Self::decide); deciding the same request twice is a typed
/// error and leaves the state machine unchanged.
pub struct ApprovalGateway {
    rules: RiskRules,
    policy: RiskPolicy,
    transport: Arc<dyn ApprovalTransport>,
    pending: std::sync::Mutex<HashMap<String, PendingRequest>>,
    decided: std::sync::Mutex<HashSet<String>>,
}

impl std::fmt::Debug for ApprovalGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalGateway")
            .field("policy", &self.policy)
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

impl ApprovalGateway {
    /// Create a gateway with the given rules, policy, and transport.
    #[must_use]
    pub fn new(rules: RiskRules, policy: RiskPolicy, transport: Arc<dyn ApprovalTransport>) -> Self {
        Self {
            rules,
            policy,
            transport,
            pending: std::sync::Mutex::new(HashMap::new()),
            decided: std::sync::Mutex::new(HashSet::new()),
        }
    }

    /// The active risk policy.
    #[must_use]
    pub const fn policy(&self) -> RiskPolicy {
        self.policy
    }

    /// Classify a call and map it through the policy.
    #[must_use]
    pub fn assess(&self, call: &ToolCall, declared: Option<RiskTier>) -> Gate {
        if let Some(command) = self.rules.denied(&call.name, &call.arguments) {
            return Gate::Block(format!("'{command}' matches a deny rule"));
        }
        let tier = self.rules.classify(&call.name, &call.arguments, declared);
        self.policy.gate(tier)
    }

    /// The tier a call classifies into, for reporting.
    #[must_use]
    pub fn tier(&self, call: &ToolCall, declared: Option<RiskTier>) -> RiskTier {
        self.rules.classify(&call.name, &call.arguments, declared)
    }

    /// Publish a `PermissionRequired` event and wait for the decision.
    ///
    /// Returns [`Error::Cancelled`] if `ctx` is cancelled first; the pending
    /// request is discarded in that case.
    pub async fn request_approval(
        &self,
        agent_id: &str,
        call: &ToolCall,
        declared: Option<RiskTier>,
        ctx: &CancellationToken,
    ) -> Result<Decision> {
        let tier = self.tier(call, declared);
        let request_id = Uuid::new_v4().simple().to_string();
        let request = ApprovalRequest {
            request_id: request_id.clone(),
            call: call.clone(),
            reason: format!("tool '{}' is tier {tier} under the active policy", call.name),
            recommendations: vec![format!("review arguments of '{}'", call.name)],
        };

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(
                request_id.clone(),
                PendingRequest {
                    agent_id: agent_id.to_string(),
                    tx,
                },
            );
        self.transport.publish_required(agent_id, &request).await;

        tokio::select! {
            () = ctx.cancelled() => {
                self.pending
                    .lock()
                    .expect("pending map poisoned")
                    .remove(&request_id);
                Err(Error::Cancelled)
            }
            decision = rx => decision.map_err(|_| Error::Cancelled),
        }
    }

    /// Resolve a pending request.
    ///
    /// Publishes `PermissionDecided` and unblocks the parked call. A second
    /// call for the same id returns [`Error::AlreadyDecided`]; an unknown id
    /// returns [`Error::RequestNotFound`].
    pub async fn decide(
        &self,
        request_id: &str,
        approved: bool,
        reason: Option<String>,
    ) -> Result<()> {
        let pending = {
            let mut map = self.pending.lock().expect("pending map poisoned");
            map.remove(request_id)
        };
        let Some(PendingRequest { agent_id, tx }) = pending else {
            let decided = self.decided.lock().expect("decided set poisoned");
            if decided.contains(request_id) {
                return Err(Error::AlreadyDecided(request_id.to_string()));
            }
            return Err(Error::RequestNotFound(request_id.to_string()));
        };
        self.decided
            .lock()
            .expect("decided set poisoned")
            .insert(request_id.to_string());
        self.transport
            .publish_decided(&agent_id, request_id, approved, reason.clone())
            .await;
        let _ = tx.send(Decision { approved, reason });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall::new(name, args)
    }

    fn gateway(policy: RiskPolicy) -> ApprovalGateway {
        let bus = Arc::new(EventBus::default());
        ApprovalGateway::new(
            RiskRules::default(),
            policy,
            Arc::new(BusApprovalTransport::new(bus)),
        )
    }

    #[test]
    fn shell_read_commands_are_safe() {
        let rules = RiskRules::default();
        let args = json!({ "command": "cat /etc/hosts" });
        assert_eq!(rules.classify("shell", &args, None), RiskTier::Safe);
        let args = json!({ "command": "ls /tmp" });
        assert_eq!(rules.classify("shell", &args, None), RiskTier::Safe);
    }

    #[test]
    fn recursive_rm_is_critical() {
        let rules = RiskRules::default();
        let args = json!({ "command": "rm -rf /tmp/x" });
        assert_eq!(rules.classify("shell", &args, None), RiskTier::Critical);
    }

    #[test]
    fn git_patterns_take_the_git_table() {
        let rules = RiskRules::default();
        let args = json!({ "command": "git status" });
        assert_eq!(rules.classify("shell", &args, None), RiskTier::Safe);
        let args = json!({ "command": "git push --force origin main" });
        assert_eq!(rules.classify("git", &args, None), RiskTier::Critical);
    }

    #[test]
    fn fs_capabilities_map_to_tiers() {
        let rules = RiskRules::default();
        assert_eq!(rules.classify("read_file", &json!({}), None), RiskTier::Low);
        assert_eq!(
            rules.classify("write_file", &json!({}), None),
            RiskTier::Medium
        );
        assert_eq!(
            rules.classify("delete_file", &json!({}), None),
            RiskTier::High
        );
    }

    #[test]
    fn unknown_tool_defaults_to_medium() {
        let rules = RiskRules::default();
        assert_eq!(rules.classify("teleport", &json!({}), None), RiskTier::Medium);
    }

    #[test]
    fn override_beats_declared_and_tables() {
        let rules = RiskRules::default().with_override("read_file", RiskTier::Critical);
        assert_eq!(
            rules.classify("read_file", &json!({}), Some(RiskTier::Safe)),
            RiskTier::Critical
        );
    }

    #[test]
    fn deny_rule_blocks_regardless_of_policy() {
        let gw = gateway(RiskPolicy::Permissive);
        let c = call("shell", json!({ "command": "rm -rf /" }));
        assert!(matches!(gw.assess(&c, None), Gate::Block(_)));
    }

    #[test]
    fn strict_policy_asks_from_medium() {
        let gw = gateway(RiskPolicy::Strict);
        let low = call("shell", json!({ "command": "grep foo bar.txt" }));
        assert_eq!(gw.assess(&low, None), Gate::Allow);
        let medium = call("write_file", json!({ "path": "/tmp/a" }));
        assert_eq!(gw.assess(&medium, None), Gate::RequireUser);
    }

    #[test]
    fn normal_policy_allows_medium() {
        let gw = gateway(RiskPolicy::Normal);
        let medium = call("write_file", json!({ "path": "/tmp/a" }));
        assert_eq!(gw.assess(&medium, None), Gate::Allow);
        let high = call("delete_file", json!({ "path": "/tmp/a" }));
        assert_eq!(gw.assess(&high, None), Gate::RequireUser);
    }

    #[tokio::test]
    async fn request_resolves_on_decide() {
        let gw = Arc::new(gateway(RiskPolicy::Strict));
        let c = call("write_file", json!({ "path": "/tmp/a" }));
        let ctx = CancellationToken::new();

        let gw2 = Arc::clone(&gw);
        let c2 = c.clone();
        let ctx2 = ctx.clone();
        let waiter =
            tokio::spawn(async move { gw2.request_approval("a1", &c2, None, &ctx2).await });

        // Wait for the request to register, then approve it.
        let request_id = loop {
            let id = {
                let map = gw.pending.lock().expect("pending map");
                map.keys().next().cloned()
            };
            if let Some(id) = id {
                break id;
            }
            tokio::task::yield_now().await;
        };
        gw.decide(&request_id, true, Some("go ahead".into()))
            .await
            .expect("decide succeeds");

        let decision = waiter.await.expect("join").expect("decision");
        assert!(decision.approved);
        assert_eq!(decision.reason.as_deref(), Some("go ahead"));

        // Second decide for the same id is a typed error.
        let err = gw.decide(&request_id, false, None).await.expect_err("dup");
        assert!(matches!(err, Error::AlreadyDecided(_)));
    }

    #[tokio::test]
    async fn unknown_request_is_not_found() {
        let gw = gateway(RiskPolicy::Strict);
        let err = gw.decide("ghost", true, None).await.expect_err("unknown");
        assert!(matches!(err, Error::RequestNotFound(_)));
    }

    #[tokio::test]
    async fn cancelled_request_returns_cancelled() {
        let gw = Arc::new(gateway(RiskPolicy::Strict));
        let c = call("write_file", json!({ "path": "/tmp/a" }));
        let ctx = CancellationToken::new();
        ctx.cancel();
        let err = gw
            .request_approval("a1", &c, None, &ctx)
            .await
            .expect_err("cancelled");
        assert!(err.is_cancelled());
    }
}
