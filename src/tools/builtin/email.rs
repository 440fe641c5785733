//! Email tools: reply, forward, delete, draft, and history search.
//!
//! Sending goes through a [`Mailer`]. `SmtpMailer` talks SMTP via lettre;
//! `OutboxMailer` keeps everything in memory for dry runs and tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::SmtpConfig;
use crate::error::TransportError;
use crate::store::traits::MemoryStore;
use crate::tools::tool::{Tool, ToolError, ToolOutput, require_str};

/// A message ready to hand to a mail transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Message id this one answers or forwards.
    pub in_reply_to: Option<String>,
}

/// Outbound mail transport.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Deliver a message, returning a transport-assigned id.
    async fn send(&self, email: &OutgoingEmail) -> Result<String, TransportError>;

    /// Remove a message from the mailbox.
    async fn delete(&self, email_id: &str) -> Result<(), TransportError>;
}

// ── SMTP ────────────────────────────────────────────────────────────

/// Mailer backed by an SMTP relay.
pub struct SmtpMailer {
    config: SmtpConfig,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }
}

fn build_message(from: &str, email: &OutgoingEmail) -> Result<Message, TransportError> {
    let from: Mailbox = from.parse().map_err(|e| TransportError::InvalidAddress {
        address: from.to_string(),
        reason: format!("{e}"),
    })?;
    let to: Mailbox = email.to.parse().map_err(|e| TransportError::InvalidAddress {
        address: email.to.clone(),
        reason: format!("{e}"),
    })?;

    let mut builder = Message::builder().from(from).to(to).subject(email.subject.as_str());
    if let Some(id) = &email.in_reply_to {
        builder = builder.in_reply_to(id.clone());
    }
    builder
        .body(email.body.clone())
        .map_err(|e| TransportError::Failed {
            service: "smtp".into(),
            reason: format!("Failed to build email: {e}"),
        })
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<String, TransportError> {
        let message = build_message(&self.config.from_address, email)?;
        let config = self.config.clone();

        // lettre's SmtpTransport is blocking.
        tokio::task::spawn_blocking(move || -> Result<String, TransportError> {
            let creds = Credentials::new(
                config.username.clone(),
                config.password.expose_secret().to_string(),
            );
            let transport = SmtpTransport::relay(&config.host)
                .map_err(|e| TransportError::Failed {
                    service: "smtp".into(),
                    reason: format!("SMTP relay error: {e}"),
                })?
                .port(config.port)
                .credentials(creds)
                .build();

            let response = transport.send(&message).map_err(|e| {
                // 4xx replies (421, 450, 451) are how relays throttle.
                if e.is_transient() {
                    TransportError::RateLimited {
                        service: "smtp".into(),
                        retry_after: None,
                    }
                } else {
                    TransportError::Failed {
                        service: "smtp".into(),
                        reason: format!("SMTP send failed: {e}"),
                    }
                }
            })?;
            Ok(response
                .message()
                .collect::<Vec<_>>()
                .join(" "))
        })
        .await
        .map_err(|e| TransportError::Failed {
            service: "smtp".into(),
            reason: format!("SMTP task panicked: {e}"),
        })?
    }

    async fn delete(&self, email_id: &str) -> Result<(), TransportError> {
        Err(TransportError::Failed {
            service: "smtp".into(),
            reason: format!("cannot delete {email_id}: SMTP has no mailbox access"),
        })
    }
}

// ── Outbox ──────────────────────────────────────────────────────────

/// In-memory mailer that records what would have been sent.
#[derive(Default)]
pub struct OutboxMailer {
    sent: Mutex<Vec<OutgoingEmail>>,
    deleted: Mutex<Vec<String>>,
    throttle_remaining: AtomicU32,
}

impl OutboxMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the next `n` sends with a rate-limit error.
    pub fn throttle_next(&self, n: u32) {
        self.throttle_remaining.store(n, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().await.clone()
    }

    pub async fn deleted(&self) -> Vec<String> {
        self.deleted.lock().await.clone()
    }
}

#[async_trait]
impl Mailer for OutboxMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<String, TransportError> {
        let throttled = self
            .throttle_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if throttled {
            return Err(TransportError::RateLimited {
                service: "outbox".into(),
                retry_after: None,
            });
        }

        let mut sent = self.sent.lock().await;
        sent.push(email.clone());
        Ok(format!("outbox-{}", sent.len()))
    }

    async fn delete(&self, email_id: &str) -> Result<(), TransportError> {
        self.deleted.lock().await.push(email_id.to_string());
        Ok(())
    }
}

// ── send_email_reply ────────────────────────────────────────────────

/// Sends a reply. Dangerous.
pub struct SendEmailReplyTool {
    mailer: Arc<dyn Mailer>,
}

impl SendEmailReplyTool {
    pub const NAME: &'static str = "send_email_reply";

    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl Tool for SendEmailReplyTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Send an email reply. The recipient sees it immediately."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "to": {"type": "string", "description": "Recipient address"},
                "subject": {"type": "string"},
                "body": {"type": "string", "description": "Full reply text"},
                "in_reply_to": {"type": "string", "description": "Message id being answered"}
            },
            "required": ["to", "subject", "body"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let email = OutgoingEmail {
            to: require_str(Self::NAME, &params, "to")?.to_string(),
            subject: require_str(Self::NAME, &params, "subject")?.to_string(),
            body: require_str(Self::NAME, &params, "body")?.to_string(),
            in_reply_to: params
                .get("in_reply_to")
                .and_then(|v| v.as_str())
                .map(String::from),
        };

        let id = self
            .mailer
            .send(&email)
            .await
            .map_err(|e| e.into_tool_error(Self::NAME))?;
        info!(to = %email.to, subject = %email.subject, "Reply sent");
        Ok(ToolOutput::text(
            format!("Email sent to {} ({id})", email.to),
            start.elapsed(),
        ))
    }
}

// ── forward_email ───────────────────────────────────────────────────

/// Forwards a received message to another address. Dangerous.
pub struct ForwardEmailTool {
    mailer: Arc<dyn Mailer>,
}

impl ForwardEmailTool {
    pub const NAME: &'static str = "forward_email";

    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl Tool for ForwardEmailTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Forward a received email to another recipient with an optional comment."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "email_id": {"type": "string", "description": "Message id to forward"},
                "to": {"type": "string"},
                "subject": {"type": "string"},
                "comment": {"type": "string"}
            },
            "required": ["email_id", "to"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let email_id = require_str(Self::NAME, &params, "email_id")?;
        let to = require_str(Self::NAME, &params, "to")?;
        let subject = params
            .get("subject")
            .and_then(|v| v.as_str())
            .unwrap_or(email_id);
        let comment = params.get("comment").and_then(|v| v.as_str()).unwrap_or("");

        let email = OutgoingEmail {
            to: to.to_string(),
            subject: format!("Fwd: {subject}"),
            body: format!("{comment}\n\n---------- Forwarded message {email_id} ----------")
                .trim_start()
                .to_string(),
            in_reply_to: Some(email_id.to_string()),
        };
        self.mailer
            .send(&email)
            .await
            .map_err(|e| e.into_tool_error(Self::NAME))?;
        info!(email_id, to, "Email forwarded");
        Ok(ToolOutput::text(
            format!("Forwarded {email_id} to {to}"),
            start.elapsed(),
        ))
    }
}

// ── delete_email ────────────────────────────────────────────────────

/// Deletes a message from the mailbox. Dangerous.
pub struct DeleteEmailTool {
    mailer: Arc<dyn Mailer>,
}

impl DeleteEmailTool {
    pub const NAME: &'static str = "delete_email";

    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl Tool for DeleteEmailTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Delete an email from the mailbox."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "email_id": {"type": "string"}
            },
            "required": ["email_id"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let email_id = require_str(Self::NAME, &params, "email_id")?;
        self.mailer
            .delete(email_id)
            .await
            .map_err(|e| e.into_tool_error(Self::NAME))?;
        info!(email_id, "Email deleted");
        Ok(ToolOutput::text(format!("Deleted {email_id}"), start.elapsed()))
    }
}

// ── draft_email_reply ───────────────────────────────────────────────

/// Produces a reply draft without sending it. Safe.
pub struct DraftEmailReplyTool;

impl DraftEmailReplyTool {
    pub const NAME: &'static str = "draft_email_reply";
}

#[async_trait]
impl Tool for DraftEmailReplyTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Prepare a reply draft for the user to send later. Nothing leaves the mailbox."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "to": {"type": "string"},
                "subject": {"type": "string"},
                "body": {"type": "string"}
            },
            "required": ["to", "body"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let to = require_str(Self::NAME, &params, "to")?;
        let body = require_str(Self::NAME, &params, "body")?;
        let subject = params.get("subject").and_then(|v| v.as_str()).unwrap_or("");
        Ok(ToolOutput::text(
            format!("Draft for {to}\nSubject: {subject}\n\n{body}"),
            start.elapsed(),
        ))
    }
}

// ── search_past_emails ──────────────────────────────────────────────

const SEARCH_DEFAULT_LIMIT: u64 = 5;
const SEARCH_MAX_LIMIT: u64 = 20;

/// Searches the interaction history in the memory store. Safe.
pub struct SearchPastEmailsTool {
    store: Arc<dyn MemoryStore>,
}

impl SearchPastEmailsTool {
    pub const NAME: &'static str = "search_past_emails";

    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for SearchPastEmailsTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Search previously handled emails by subject or outcome, optionally for one sender."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "sender": {"type": "string"},
                "limit": {"type": "integer", "description": "Max results (default 5, max 20)"}
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let query = require_str(Self::NAME, &params, "query")?;
        let sender = params.get("sender").and_then(|v| v.as_str());
        let limit = params
            .get("limit")
            .and_then(|v| v.as_u64())
            .unwrap_or(SEARCH_DEFAULT_LIMIT)
            .min(SEARCH_MAX_LIMIT) as usize;

        let rows = self
            .store
            .search_history(query, sender, limit)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                name: Self::NAME.to_string(),
                reason: format!("Search failed: {e}"),
            })?;

        if rows.is_empty() {
            return Ok(ToolOutput::text(
                format!("No past emails match '{query}'"),
                start.elapsed(),
            ));
        }
        let lines: Vec<String> = rows
            .iter()
            .map(|r| {
                format!(
                    "- {} | {} | {} | {}",
                    r.timestamp.format("%Y-%m-%d"),
                    r.from,
                    r.subject,
                    r.status
                )
            })
            .collect();
        Ok(ToolOutput::text(lines.join("\n"), start.elapsed()))
    }
}
