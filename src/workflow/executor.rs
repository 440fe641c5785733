//! Workflow executor: triage, draft, approval gate, execute, persist.
//!
//! `start` runs an email until it finishes or reaches a dangerous action.
//! A dangerous action is checkpointed and the call returns
//! [`ExecutionOutcome::Suspended`]. `resume` (or `cancel`) consumes that
//! checkpoint exactly once and carries the workflow to its end.
//!
//! Every terminal outcome writes exactly one `email_history` row.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{Error, WorkflowError};
use crate::learning::PatternLearner;
use crate::pipeline::classifier::Classifier;
use crate::pipeline::drafter::Drafter;
use crate::pipeline::types::{Classification, EmailRecord, PendingAction};
use crate::store::model::{
    FeedbackRecord, FullContext, InteractionRecord, InteractionStatus, SenderUpdate,
    TriageCorrection,
};
use crate::store::traits::{CheckpointStore, MemoryStore};
use crate::tools::ToolRegistry;
use crate::workflow::approval::ApprovalPolicy;
use crate::workflow::checkpoint::Checkpoint;
use crate::workflow::events::{ApprovalDecision, PendingApproval, WorkflowEvent};
use crate::workflow::state::{ExecutionResult, HumanDecision, HumanEdit, Step, WorkflowState};

/// Longest accepted conversation id.
pub const MAX_CONVERSATION_ID_LEN: usize = 128;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Result of driving a workflow as far as it can go.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// The workflow reached its end.
    Completed {
        result: ExecutionResult,
        state: Box<WorkflowState>,
    },
    /// Waiting at the Approval Gate. A checkpoint has been persisted.
    Suspended { pending: PendingApproval },
    /// The workflow could not produce an action.
    Failed { error: String },
}

impl ExecutionOutcome {
    pub fn result(&self) -> Option<&ExecutionResult> {
        match self {
            Self::Completed { result, .. } => Some(result),
            _ => None,
        }
    }

    pub fn state(&self) -> Option<&WorkflowState> {
        match self {
            Self::Completed { state, .. } => Some(state),
            _ => None,
        }
    }

    pub fn pending(&self) -> Option<&PendingApproval> {
        match self {
            Self::Suspended { pending } => Some(pending),
            _ => None,
        }
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended { .. })
    }
}

/// Check a conversation id: non-empty, bounded, `[A-Za-z0-9._:@-]` only.
pub fn validate_conversation_id(id: &str) -> Result<(), WorkflowError> {
    let ok = !id.is_empty()
        && id.len() <= MAX_CONVERSATION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '@' | '-'));
    if ok {
        Ok(())
    } else {
        Err(WorkflowError::InvalidConversationId(id.to_string()))
    }
}

/// Removes a conversation from the in-flight set when dropped.
struct InFlight<'a> {
    set: &'a StdMutex<HashSet<String>>,
    id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Arguments chosen for execution after applying any human edit.
struct ResolvedArgs {
    args: serde_json::Map<String, serde_json::Value>,
    /// Draft text before and after, when an edit actually took effect.
    edited_draft: Option<(String, String)>,
}

/// Drives emails through the workflow.
pub struct WorkflowExecutor {
    memory: Arc<dyn MemoryStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    tools: Arc<ToolRegistry>,
    classifier: Arc<dyn Classifier>,
    drafter: Arc<dyn Drafter>,
    learner: PatternLearner,
    policy: ApprovalPolicy,
    events: broadcast::Sender<WorkflowEvent>,
    in_flight: StdMutex<HashSet<String>>,
}

impl WorkflowExecutor {
    pub fn new(
        memory: Arc<dyn MemoryStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        tools: Arc<ToolRegistry>,
        classifier: Arc<dyn Classifier>,
        drafter: Arc<dyn Drafter>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            learner: PatternLearner::new(memory.clone()),
            memory,
            checkpoints,
            tools,
            classifier,
            drafter,
            policy: ApprovalPolicy::default(),
            events,
            in_flight: StdMutex::new(HashSet::new()),
        }
    }

    pub fn with_approval_policy(mut self, policy: ApprovalPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// How many recent corrections triage-override promotion considers.
    pub fn with_correction_window(mut self, window: usize) -> Self {
        self.learner = PatternLearner::new(self.memory.clone()).with_correction_window(window);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    pub fn approval_policy(&self) -> &ApprovalPolicy {
        &self.policy
    }

    // ── Public contract ─────────────────────────────────────────────

    /// Run a new email through the workflow.
    pub async fn start(&self, email: EmailRecord) -> Result<ExecutionOutcome, Error> {
        let conversation_id = email.conversation_key();
        validate_conversation_id(&conversation_id)?;
        let _guard = self.claim(&conversation_id)?;

        if self
            .checkpoints
            .load_checkpoint(&conversation_id)
            .await?
            .is_some()
        {
            return Err(WorkflowError::ConversationBusy(conversation_id).into());
        }

        info!(
            conversation_id = %conversation_id,
            email_id = %email.id,
            from = %email.from,
            "Workflow started"
        );
        let mut state = WorkflowState::new(conversation_id, email);

        let context = self.load_context(&mut state).await;
        self.triage(&mut state, &context).await;

        match state.classification {
            Some(Classification::Act) => {}
            Some(Classification::Ignore) => {
                let result = ExecutionResult::skipped(format!("Ignored: {}", state.reasoning));
                return Ok(self.finish(state, result, InteractionStatus::Ignored).await);
            }
            _ => {
                let _ = self.events.send(WorkflowEvent::Escalated {
                    conversation_id: state.conversation_id.clone(),
                    email_id: state.email.id.clone(),
                    from: state.email.from.clone(),
                    subject: state.email.subject.clone(),
                    reasoning: state.reasoning.clone(),
                });
                let result = ExecutionResult::skipped(format!("Escalated: {}", state.reasoning));
                return Ok(self.finish(state, result, InteractionStatus::Escalated).await);
            }
        }

        state.enter(Step::Draft, "");
        let action = match self.drafter.draft(&state.email, &context).await {
            Ok(action) => action,
            Err(e) => {
                warn!(conversation_id = %state.conversation_id, error = %e, "Drafting failed");
                let error = format!("Draft failed: {e}");
                state.note(error.clone());
                self.finish(state, ExecutionResult::failed(error.clone()), InteractionStatus::Failed)
                    .await;
                return Ok(ExecutionOutcome::Failed { error });
            }
        };
        debug!(
            conversation_id = %state.conversation_id,
            action = %action.action_type,
            "Drafted"
        );
        state.pending_action = Some(action);

        self.approval_gate(state).await
    }

    /// Apply a human decision to a suspended workflow. The checkpoint is
    /// consumed; a second resume fails with `AlreadyResumed`.
    pub async fn resume(
        &self,
        conversation_id: &str,
        decision: ApprovalDecision,
    ) -> Result<ExecutionOutcome, Error> {
        validate_conversation_id(conversation_id)?;
        if decision.decision == HumanDecision::Edit && decision.edit.is_none() {
            return Err(WorkflowError::MissingEdit(conversation_id.to_string()).into());
        }
        let _guard = self.claim(conversation_id)?;

        let mut state = self
            .take_suspended(conversation_id, decision.decision.as_str())
            .await?;
        info!(
            conversation_id,
            decision = %decision.decision,
            "Workflow resumed"
        );
        state.enter(Step::Resumed, format!("decision: {}", decision.decision));
        state.requires_approval = false;
        state.human_decision = Some(decision.decision);
        state.human_edit = decision.edit;

        match decision.decision {
            HumanDecision::Deny => {
                let result = ExecutionResult::skipped("Denied by user");
                Ok(self.finish(*state, result, InteractionStatus::Denied).await)
            }
            HumanDecision::Approve | HumanDecision::Edit => Ok(self.execute(*state).await),
        }
    }

    /// Discard a suspended workflow as denied, e.g. on approval timeout.
    pub async fn cancel(&self, conversation_id: &str, reason: &str) -> Result<ExecutionOutcome, Error> {
        validate_conversation_id(conversation_id)?;
        let _guard = self.claim(conversation_id)?;

        let mut state = self
            .take_suspended(conversation_id, &format!("cancel:{reason}"))
            .await?;
        info!(conversation_id, reason, "Workflow cancelled");
        state.enter(Step::Resumed, format!("cancelled: {reason}"));
        state.requires_approval = false;
        state.human_decision = Some(HumanDecision::Deny);

        let result = ExecutionResult::skipped(format!("Denied: {reason}"));
        Ok(self.finish(*state, result, InteractionStatus::Denied).await)
    }

    /// Record a human triage correction. Returns the sender override if this
    /// correction promoted one.
    pub async fn correct_triage(
        &self,
        correction: TriageCorrection,
    ) -> Result<Option<Classification>, Error> {
        Ok(self.learner.record_triage_correction(&correction).await?)
    }

    /// Workflows currently waiting at the Approval Gate, oldest first.
    pub async fn pending(&self) -> Result<Vec<PendingApproval>, Error> {
        let stored = self.checkpoints.list_checkpoints().await?;
        let mut pending = Vec::with_capacity(stored.len());
        for row in &stored {
            match Checkpoint::decode(row) {
                Ok(cp) => {
                    if let Some(action) = &cp.state.pending_action {
                        pending.push(PendingApproval::from_action(&cp.conversation_id, action));
                    }
                }
                Err(e) => warn!(conversation_id = %row.conversation_id, error = %e, "Skipping checkpoint"),
            }
        }
        Ok(pending)
    }

    // ── Steps ───────────────────────────────────────────────────────

    fn claim(&self, conversation_id: &str) -> Result<InFlight<'_>, WorkflowError> {
        let mut set = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(conversation_id.to_string()) {
            return Err(WorkflowError::ConversationBusy(conversation_id.to_string()));
        }
        Ok(InFlight {
            set: &self.in_flight,
            id: conversation_id.to_string(),
        })
    }

    /// Memory is an optimization: any store failure yields an empty context.
    async fn load_context(&self, state: &mut WorkflowState) -> FullContext {
        state.enter(Step::LoadContext, "");
        match self.memory.get_full_context(&state.email.sender_key()).await {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(
                    conversation_id = %state.conversation_id,
                    error = %e,
                    "Memory store unavailable, continuing with empty context"
                );
                state.note(format!("memory unavailable: {e}"));
                FullContext::default()
            }
        }
    }

    /// Sender override first, then the classifier. Fails closed to escalate.
    async fn triage(&self, state: &mut WorkflowState, context: &FullContext) {
        state.enter(Step::Triage, "");

        if let Some(decision) = context.sender.as_ref().and_then(|s| s.triage_override) {
            info!(
                conversation_id = %state.conversation_id,
                decision = %decision,
                "Applying learned triage override"
            );
            state.classification = Some(decision);
            state.reasoning = format!("Learned override for {}", state.email.sender_key());
            state.note("override");
            return;
        }

        match self.classifier.classify(&state.email, context).await {
            Ok(decision) => {
                info!(
                    conversation_id = %state.conversation_id,
                    classifier = self.classifier.name(),
                    decision = %decision.decision,
                    "Triaged"
                );
                state.classification = Some(decision.decision);
                state.reasoning = decision.reasoning;
            }
            Err(e) => {
                warn!(
                    conversation_id = %state.conversation_id,
                    error = %e,
                    "Classification failed, escalating"
                );
                state.classification = Some(Classification::Escalate);
                state.reasoning = format!("Classification failed: {e}");
                state.note("classification failure");
            }
        }
    }

    async fn approval_gate(&self, mut state: WorkflowState) -> Result<ExecutionOutcome, Error> {
        state.enter(Step::ApprovalGate, "");
        let Some(action) = state.pending_action.clone() else {
            let error = "No pending action at approval gate".to_string();
            self.finish(state, ExecutionResult::failed(error.clone()), InteractionStatus::Failed)
                .await;
            return Ok(ExecutionOutcome::Failed { error });
        };

        if !self.policy.requires_approval(&action.action_type) {
            debug!(
                conversation_id = %state.conversation_id,
                action = %action.action_type,
                "Safe action auto-approved"
            );
            state.requires_approval = false;
            state.human_decision = Some(HumanDecision::Approve);
            state.note("auto-approved");
            return Ok(self.execute(state).await);
        }

        state.requires_approval = true;
        state.enter(Step::Suspended, "");
        let pending = PendingApproval::from_action(&state.conversation_id, &action);

        let saved = match Checkpoint::new(state.clone()).encode() {
            Ok(stored) => self.checkpoints.save_checkpoint(&stored).await,
            Err(e) => Err(e),
        };
        if let Err(e) = saved {
            warn!(conversation_id = %state.conversation_id, error = %e, "Checkpoint save failed");
            let error = format!("Could not checkpoint: {e}");
            state.note(error.clone());
            self.finish(state, ExecutionResult::failed(error.clone()), InteractionStatus::Failed)
                .await;
            return Ok(ExecutionOutcome::Failed { error });
        }

        info!(
            conversation_id = %pending.conversation_id,
            action = %pending.action_type,
            "Awaiting approval"
        );
        let _ = self.events.send(WorkflowEvent::ApprovalRequested(pending.clone()));
        Ok(ExecutionOutcome::Suspended { pending })
    }

    /// Consume the checkpoint for `conversation_id`.
    async fn take_suspended(
        &self,
        conversation_id: &str,
        resolution: &str,
    ) -> Result<Box<WorkflowState>, Error> {
        let Some(stored) = self
            .checkpoints
            .take_checkpoint(conversation_id, resolution)
            .await?
        else {
            return Err(match self.checkpoints.resolution(conversation_id).await? {
                Some(_) => WorkflowError::AlreadyResumed(conversation_id.to_string()),
                None => WorkflowError::UnknownConversation(conversation_id.to_string()),
            }
            .into());
        };

        match Checkpoint::decode(&stored) {
            Ok(cp) => Ok(Box::new(cp.state)),
            Err(e) => {
                warn!(conversation_id, error = %e, "Discarding corrupt checkpoint");
                let record = InteractionRecord {
                    email_id: String::new(),
                    conversation_id: conversation_id.to_string(),
                    from: String::new(),
                    subject: String::new(),
                    decision: None,
                    action_taken: None,
                    human_approved: None,
                    status: InteractionStatus::Failed,
                    detail: e.to_string(),
                    timestamp: Utc::now(),
                };
                if let Err(db) = self.memory.record_interaction(&record).await {
                    warn!(conversation_id, error = %db, "Failed to record corrupt checkpoint");
                }
                Err(e.into())
            }
        }
    }

    /// Pick the arguments to run: the edit if it fits the tool's schema,
    /// otherwise the original arguments.
    async fn resolve_args(&self, state: &mut WorkflowState, action: &PendingAction) -> ResolvedArgs {
        let original = ResolvedArgs {
            args: action.args.clone(),
            edited_draft: None,
        };
        if state.human_decision != Some(HumanDecision::Edit) {
            return original;
        }
        let Some(edit) = state.human_edit.clone() else {
            return original;
        };

        let candidate = match edit {
            HumanEdit::Args(args) => Ok(args),
            HumanEdit::Body(text) => match action.draft_field() {
                Some(field) => {
                    let mut args = action.args.clone();
                    args.insert(field.to_string(), text.into());
                    Ok(args)
                }
                None => Err(format!("{} has no draft text field", action.action_type)),
            },
        };
        let checked = match candidate {
            Ok(args) => self
                .tools
                .validate_args(&action.action_type, &serde_json::Value::Object(args.clone()))
                .await
                .map(|_| args)
                .map_err(|e| e.to_string()),
            Err(reason) => Err(reason),
        };

        match checked {
            Ok(args) => {
                let edited = PendingAction::new(action.action_type.clone(), args.clone(), "");
                let edited_draft = match (action.draft_text(), edited.draft_text()) {
                    (Some(before), Some(after)) => Some((before.to_string(), after.to_string())),
                    _ => None,
                };
                state.note("edit applied");
                ResolvedArgs { args, edited_draft }
            }
            Err(reason) => {
                warn!(
                    conversation_id = %state.conversation_id,
                    action = %action.action_type,
                    reason = %reason,
                    "Edited arguments do not fit the tool, executing original arguments"
                );
                state.note(format!("argument mismatch: {reason}; executed original arguments"));
                original
            }
        }
    }

    async fn execute(&self, mut state: WorkflowState) -> ExecutionOutcome {
        state.enter(Step::Execute, "");
        let Some(action) = state.pending_action.clone() else {
            let result = ExecutionResult::failed("No pending action to execute");
            return self.finish(state, result, InteractionStatus::Failed).await;
        };

        let resolved = self.resolve_args(&mut state, &action).await;
        let outcome = self
            .tools
            .invoke(&action.action_type, serde_json::Value::Object(resolved.args))
            .await;

        let (result, status) = match outcome {
            Ok(output) => (ExecutionResult::success(output.content), InteractionStatus::Executed),
            Err(e) => {
                warn!(
                    conversation_id = %state.conversation_id,
                    action = %action.action_type,
                    error = %e,
                    "Tool invocation failed"
                );
                (ExecutionResult::failed(e.to_string()), InteractionStatus::Failed)
            }
        };

        // A human edit is preference signal even when the send itself failed.
        let edit_note = match resolved.edited_draft {
            Some((before, after)) => self.learn_from_edit(&state, &action, &before, &after).await,
            None => None,
        };

        self.finish_with_note(state, result, status, edit_note).await
    }

    /// Feed an applied edit to the learner. Failures only log. Returns the
    /// sender note to attach when the edit changed anything.
    async fn learn_from_edit(
        &self,
        state: &WorkflowState,
        action: &PendingAction,
        original: &str,
        edited: &str,
    ) -> Option<String> {
        if original.trim().is_empty() || edited.trim().is_empty() || original == edited {
            return None;
        }
        let email = &state.email;
        let feedback = FeedbackRecord {
            email_id: email.id.clone(),
            from: email.sender_key(),
            subject: email.subject.clone(),
            original_draft: original.to_string(),
            edited_draft: edited.to_string(),
            note: String::new(),
            action: action.action_type.clone(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.memory.record_feedback(&feedback).await {
            warn!(conversation_id = %state.conversation_id, error = %e, "Failed to record feedback");
        }
        match self.learner.learn(original, edited).await {
            Ok(patterns) => debug!(
                conversation_id = %state.conversation_id,
                learned = patterns.len(),
                "Edit learned"
            ),
            Err(e) => warn!(conversation_id = %state.conversation_id, error = %e, "Learning failed"),
        }
        Some(format!("User edited response: '{}'", email.subject))
    }

    async fn finish(
        &self,
        state: WorkflowState,
        result: ExecutionResult,
        status: InteractionStatus,
    ) -> ExecutionOutcome {
        self.finish_with_note(state, result, status, None).await
    }

    /// Persist and end. The single place that writes `email_history`, and
    /// the single sender-context write per processed email.
    async fn finish_with_note(
        &self,
        mut state: WorkflowState,
        result: ExecutionResult,
        status: InteractionStatus,
        sender_note: Option<String>,
    ) -> ExecutionOutcome {
        state.enter(Step::Persist, "");
        state.execution_result = Some(result.clone());

        // Only a decision delivered through resume is a human one.
        let human_approved = match state.human_decision {
            Some(HumanDecision::Deny) => Some(false),
            Some(_) if state.history_contains(Step::Resumed) => Some(true),
            _ => None,
        };
        let record = InteractionRecord {
            email_id: state.email.id.clone(),
            conversation_id: state.conversation_id.clone(),
            from: state.email.sender_key(),
            subject: state.email.subject.clone(),
            decision: state.classification,
            action_taken: state.pending_action.as_ref().map(|a| a.action_type.clone()),
            human_approved,
            status,
            detail: result.output.clone(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.memory.record_interaction(&record).await {
            warn!(conversation_id = %state.conversation_id, error = %e, "Failed to record interaction");
            state.note(format!("history write failed: {e}"));
        }

        if status != InteractionStatus::Ignored {
            let update = SenderUpdate {
                name: state.email.from_name.clone(),
                ..Default::default()
            };
            if let Err(e) = self
                .memory
                .upsert_sender_context(&state.email.sender_key(), &update, sender_note.as_deref())
                .await
            {
                warn!(conversation_id = %state.conversation_id, error = %e, "Failed to update sender");
            }
        }

        state.enter(Step::End, "");
        info!(
            conversation_id = %state.conversation_id,
            status = %status,
            "Workflow finished"
        );
        let _ = self.events.send(WorkflowEvent::Completed {
            conversation_id: state.conversation_id.clone(),
            classification: state.classification,
            result: result.clone(),
        });
        ExecutionOutcome::Completed {
            result,
            state: Box::new(state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::error::{ClassificationError, DatabaseError, DraftError, LlmError};
    use crate::pipeline::rules::RulesClassifier;
    use crate::pipeline::types::TriageDecision;
    use crate::retry::RetryPolicy;
    use crate::store::{CheckpointResolution, LibSqlBackend, StoredCheckpoint};
    use crate::tools::builtin::{
        CheckCalendarTool, InMemoryCalendar, OutboxMailer, SendEmailReplyTool,
    };
    use crate::workflow::state::ExecutionStatus;

    struct FixedClassifier {
        decision: Option<Classification>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Classifier for FixedClassifier {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn classify(
            &self,
            _email: &EmailRecord,
            _context: &FullContext,
        ) -> Result<TriageDecision, ClassificationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.decision {
                Some(d) => Ok(TriageDecision::new(d, "fixed")),
                None => Err(ClassificationError::Llm(LlmError::RequestFailed {
                    provider: "test".into(),
                    reason: "down".into(),
                })),
            }
        }
    }

    struct FixedDrafter(PendingAction);

    #[async_trait]
    impl Drafter for FixedDrafter {
        async fn draft(
            &self,
            _email: &EmailRecord,
            _context: &FullContext,
        ) -> Result<PendingAction, DraftError> {
            Ok(self.0.clone())
        }
    }

    fn reply_action() -> PendingAction {
        PendingAction::new(
            "send_email_reply",
            serde_json::json!({"to": "sam@example.com", "subject": "Re: Deck", "body": "Hi Sam, attached. Best regards"})
                .as_object()
                .cloned()
                .unwrap(),
            "reply to sam",
        )
    }

    struct Harness {
        executor: WorkflowExecutor,
        store: Arc<LibSqlBackend>,
        outbox: Arc<OutboxMailer>,
        classifier: Arc<FixedClassifier>,
    }

    async fn harness(decision: Option<Classification>, action: PendingAction) -> Harness {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let outbox = Arc::new(OutboxMailer::new());
        let tools = Arc::new(ToolRegistry::new().with_retry_policy(RetryPolicy::none()));
        tools
            .register(Arc::new(SendEmailReplyTool::new(outbox.clone())))
            .await;
        tools
            .register(Arc::new(CheckCalendarTool::new(Arc::new(InMemoryCalendar::new()))))
            .await;
        let classifier = Arc::new(FixedClassifier {
            decision,
            calls: AtomicU32::new(0),
        });
        let executor = WorkflowExecutor::new(
            store.clone(),
            store.clone(),
            tools,
            classifier.clone(),
            Arc::new(FixedDrafter(action)),
        );
        Harness {
            executor,
            store,
            outbox,
            classifier,
        }
    }

    fn email(id: &str) -> EmailRecord {
        EmailRecord::new(id, "sam@example.com", "me@example.com", "Deck", "Could you send the deck?")
    }

    #[tokio::test]
    async fn dangerous_action_suspends_and_resume_executes_once() {
        let h = harness(Some(Classification::Act), reply_action()).await;
        let outcome = h.executor.start(email("m-1")).await.unwrap();
        let pending = outcome.pending().cloned().unwrap();
        assert_eq!(pending.conversation_id, "conv-m-1");
        assert!(h.outbox.sent().await.is_empty());

        let done = h
            .executor
            .resume("conv-m-1", ApprovalDecision::approve())
            .await
            .unwrap();
        assert_eq!(done.result().unwrap().status, ExecutionStatus::Success);

        let again = h.executor.resume("conv-m-1", ApprovalDecision::approve()).await;
        assert!(matches!(again, Err(Error::Workflow(WorkflowError::AlreadyResumed(_)))));
        assert_eq!(h.outbox.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_conversation_is_rejected() {
        let h = harness(Some(Classification::Act), reply_action()).await;
        let err = h.executor.resume("conv-nope", ApprovalDecision::approve()).await;
        assert!(matches!(err, Err(Error::Workflow(WorkflowError::UnknownConversation(_)))));
    }

    #[tokio::test]
    async fn safe_action_never_checkpoints() {
        let action = PendingAction::new(
            "check_calendar",
            serde_json::json!({"day": "2025-03-10"}).as_object().cloned().unwrap(),
            "check",
        );
        let h = harness(Some(Classification::Act), action).await;
        let outcome = h.executor.start(email("m-2")).await.unwrap();
        let state = outcome.state().unwrap();
        assert!(!state.requires_approval);
        assert_eq!(state.human_decision, Some(HumanDecision::Approve));
        assert_eq!(outcome.result().unwrap().status, ExecutionStatus::Success);
        assert!(h.store.list_checkpoints().await.unwrap().is_empty());
        assert!(h.store.resolution("conv-m-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn classifier_failure_escalates() {
        let h = harness(None, reply_action()).await;
        let mut events = h.executor.subscribe();
        let outcome = h.executor.start(email("m-3")).await.unwrap();
        let state = outcome.state().unwrap();
        assert_eq!(state.classification, Some(Classification::Escalate));
        assert!(matches!(events.recv().await.unwrap(), WorkflowEvent::Escalated { .. }));

        let history = h.store.sender_history("sam@example.com", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, InteractionStatus::Escalated);
    }

    #[tokio::test]
    async fn ignore_records_history_without_drafting() {
        let h = harness(Some(Classification::Ignore), reply_action()).await;
        let outcome = h.executor.start(email("m-4")).await.unwrap();
        assert_eq!(outcome.result().unwrap().status, ExecutionStatus::Skipped);
        assert!(outcome.state().unwrap().pending_action.is_none());
        let history = h.store.sender_history("sam@example.com", 10).await.unwrap();
        assert_eq!(history[0].status, InteractionStatus::Ignored);
    }

    #[tokio::test]
    async fn mismatched_edit_runs_original_args() {
        let h = harness(Some(Classification::Act), reply_action()).await;
        h.executor.start(email("m-5")).await.unwrap();

        let edit = ApprovalDecision::edit_args(serde_json::json!({
            "attendees": ["sam@example.com"],
            "start_time": "10:00"
        }));
        let outcome = h.executor.resume("conv-m-5", edit).await.unwrap();
        assert_eq!(outcome.result().unwrap().status, ExecutionStatus::Success);
        assert!(outcome.state().unwrap().history_mentions("argument mismatch"));
        assert_eq!(h.outbox.sent().await[0].body, "Hi Sam, attached. Best regards");
    }

    #[tokio::test]
    async fn body_edit_is_sent_and_learned() {
        let h = harness(Some(Classification::Act), reply_action()).await;
        h.executor.start(email("m-6")).await.unwrap();

        let outcome = h
            .executor
            .resume("conv-m-6", ApprovalDecision::edit_body("Attached."))
            .await
            .unwrap();
        assert_eq!(outcome.result().unwrap().status, ExecutionStatus::Success);
        assert_eq!(h.outbox.sent().await[0].body, "Attached.");

        let prefs = h.store.get_preferences().await.unwrap();
        assert!(prefs.contains_key("no_greetings"));
        assert_eq!(h.store.recent_feedback(5).await.unwrap().len(), 1);
        let sender = h.store.get_sender_context("sam@example.com").await.unwrap().unwrap();
        assert!(sender.notes.iter().any(|n| n.contains("User edited response")));
    }

    #[tokio::test]
    async fn resumed_approval_clears_the_flag_and_records_the_human() {
        let h = harness(Some(Classification::Act), reply_action()).await;
        h.executor.start(email("m-11")).await.unwrap();
        let pending = h.store.load_checkpoint("conv-m-11").await.unwrap().unwrap();
        let suspended = Checkpoint::decode(&pending).unwrap().state;
        assert!(suspended.requires_approval);

        let outcome = h
            .executor
            .resume("conv-m-11", ApprovalDecision::approve())
            .await
            .unwrap();
        let state = outcome.state().unwrap();
        assert!(!state.requires_approval);
        assert!(state.history_is_consistent());
        let history = h.store.sender_history("sam@example.com", 10).await.unwrap();
        assert_eq!(history[0].human_approved, Some(true));
    }

    #[tokio::test]
    async fn auto_approved_action_has_no_human_verdict() {
        let action = PendingAction::new(
            "check_calendar",
            serde_json::json!({"day": "2025-03-10"}).as_object().cloned().unwrap(),
            "check",
        );
        let h = harness(Some(Classification::Act), action).await;
        h.executor.start(email("m-12")).await.unwrap();
        let history = h.store.sender_history("sam@example.com", 10).await.unwrap();
        assert_eq!(history[0].human_approved, None);
    }

    #[tokio::test]
    async fn edited_send_counts_one_interaction() {
        let h = harness(Some(Classification::Act), reply_action()).await;
        h.executor.start(email("m-13")).await.unwrap();
        h.executor
            .resume("conv-m-13", ApprovalDecision::edit_body("Attached."))
            .await
            .unwrap();

        let sender = h.store.get_sender_context("sam@example.com").await.unwrap().unwrap();
        assert_eq!(sender.interaction_count, 1);
        assert_eq!(sender.notes, vec!["User edited response: 'Deck'".to_string()]);
    }

    #[tokio::test]
    async fn edit_is_learned_even_when_the_send_fails() {
        let h = harness(Some(Classification::Act), reply_action()).await;
        h.executor.start(email("m-14")).await.unwrap();
        h.outbox.throttle_next(5);

        let outcome = h
            .executor
            .resume("conv-m-14", ApprovalDecision::edit_body("Attached."))
            .await
            .unwrap();
        assert_eq!(outcome.result().unwrap().status, ExecutionStatus::Failed);
        assert!(h.outbox.sent().await.is_empty());

        let feedback = h.store.recent_feedback(5).await.unwrap();
        assert_eq!(feedback.len(), 1);
        assert_eq!(feedback[0].edited_draft, "Attached.");
        assert!(h.store.get_preferences().await.unwrap().contains_key("no_greetings"));
        let history = h.store.sender_history("sam@example.com", 10).await.unwrap();
        assert_eq!(history[0].status, InteractionStatus::Failed);
    }

    /// Checkpoint store that cannot save.
    struct UnwritableCheckpoints(Arc<LibSqlBackend>);

    #[async_trait]
    impl CheckpointStore for UnwritableCheckpoints {
        async fn save_checkpoint(&self, _checkpoint: &StoredCheckpoint) -> Result<(), DatabaseError> {
            Err(DatabaseError::Query("disk full".into()))
        }

        async fn load_checkpoint(
            &self,
            conversation_id: &str,
        ) -> Result<Option<StoredCheckpoint>, DatabaseError> {
            self.0.load_checkpoint(conversation_id).await
        }

        async fn take_checkpoint(
            &self,
            conversation_id: &str,
            resolution: &str,
        ) -> Result<Option<StoredCheckpoint>, DatabaseError> {
            self.0.take_checkpoint(conversation_id, resolution).await
        }

        async fn resolution(
            &self,
            conversation_id: &str,
        ) -> Result<Option<CheckpointResolution>, DatabaseError> {
            self.0.resolution(conversation_id).await
        }

        async fn list_checkpoints(&self) -> Result<Vec<StoredCheckpoint>, DatabaseError> {
            self.0.list_checkpoints().await
        }
    }

    #[tokio::test]
    async fn failed_checkpoint_save_fails_along_the_graph() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let outbox = Arc::new(OutboxMailer::new());
        let tools = Arc::new(ToolRegistry::new());
        tools
            .register(Arc::new(SendEmailReplyTool::new(outbox.clone())))
            .await;
        let executor = WorkflowExecutor::new(
            store.clone(),
            Arc::new(UnwritableCheckpoints(store.clone())),
            tools,
            Arc::new(FixedClassifier {
                decision: Some(Classification::Act),
                calls: AtomicU32::new(0),
            }),
            Arc::new(FixedDrafter(reply_action())),
        );
        let mut events = executor.subscribe();

        let outcome = executor.start(email("m-15")).await.unwrap();
        let ExecutionOutcome::Failed { error } = outcome else {
            panic!("expected a failed outcome");
        };
        assert!(error.contains("disk full"));
        assert!(outbox.sent().await.is_empty());

        let WorkflowEvent::Completed { result, .. } = events.recv().await.unwrap() else {
            panic!("expected a completion event");
        };
        assert_eq!(result.status, ExecutionStatus::Failed);
        let history = store.sender_history("sam@example.com", 10).await.unwrap();
        assert_eq!(history[0].status, InteractionStatus::Failed);
    }

    #[tokio::test]
    async fn deny_records_denied_and_sends_nothing() {
        let h = harness(Some(Classification::Act), reply_action()).await;
        h.executor.start(email("m-7")).await.unwrap();
        let outcome = h
            .executor
            .resume("conv-m-7", ApprovalDecision::deny())
            .await
            .unwrap();
        assert_eq!(outcome.result().unwrap().status, ExecutionStatus::Skipped);
        assert!(h.outbox.sent().await.is_empty());
        let history = h.store.sender_history("sam@example.com", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, InteractionStatus::Denied);
        assert_eq!(history[0].human_approved, Some(false));
    }

    #[tokio::test]
    async fn override_skips_classifier() {
        let h = harness(Some(Classification::Act), reply_action()).await;
        for _ in 0..3 {
            h.executor
                .correct_triage(TriageCorrection::new(
                    "sam@example.com",
                    "Deck",
                    Classification::Ignore,
                    Classification::Escalate,
                    "important",
                ))
                .await
                .unwrap();
        }
        let outcome = h.executor.start(email("m-8")).await.unwrap();
        assert_eq!(
            outcome.state().unwrap().classification,
            Some(Classification::Escalate)
        );
        assert_eq!(h.classifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn start_rejects_bad_conversation_id_and_duplicates() {
        let h = harness(Some(Classification::Act), reply_action()).await;
        let bad = email("m-9").with_conversation_id("has spaces/and slashes");
        assert!(matches!(
            h.executor.start(bad).await,
            Err(Error::Workflow(WorkflowError::InvalidConversationId(_)))
        ));

        h.executor.start(email("m-10")).await.unwrap();
        assert!(matches!(
            h.executor.start(email("m-10")).await,
            Err(Error::Workflow(WorkflowError::ConversationBusy(_)))
        ));
    }

    #[tokio::test]
    async fn rules_classifier_plugs_in() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let executor = WorkflowExecutor::new(
            store.clone(),
            store.clone(),
            Arc::new(ToolRegistry::new()),
            Arc::new(RulesClassifier::default_rules()),
            Arc::new(FixedDrafter(reply_action())),
        );
        let spam = EmailRecord::new("s-1", "noreply@shop.com", "me@x.com", "Sale", "Buy now");
        let outcome = executor.start(spam).await.unwrap();
        assert_eq!(outcome.state().unwrap().classification, Some(Classification::Ignore));
    }

    #[test]
    fn conversation_id_rules() {
        assert!(validate_conversation_id("conv-abc@x.com").is_ok());
        assert!(validate_conversation_id("").is_err());
        assert!(validate_conversation_id("a b").is_err());
        assert!(validate_conversation_id(&"x".repeat(129)).is_err());
    }
}
