use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mail_steward::config::{AgentConfig, SmtpConfig};
use mail_steward::pipeline::{
    Classification, Classifier, Drafter, EmailRecord, RulesClassifier, TemplateDrafter, parse_eml,
};
use mail_steward::store::{LibSqlBackend, TriageCorrection};
use mail_steward::tools::ToolRegistry;
use mail_steward::tools::builtin::{
    InMemoryCalendar, Mailer, OutboxMailer, SmtpMailer, register_builtin_tools,
};
use mail_steward::workflow::{
    ApprovalDecision, DecisionSource, ExecutionOutcome, HumanDecision, PendingApproval,
    WorkflowExecutor, run_interactive,
};

const USAGE: &str = "\
usage:
  mail-steward process <email.eml|email.json|->   triage one email, asking before risky actions
  mail-steward pending                            list workflows waiting for approval
  mail-steward resume <conversation-id> <approve|deny>
  mail-steward correct <sender> <original> <corrected> [reason]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    let config = AgentConfig::from_env()?;
    let _log_guard = init_tracing(&config);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    eprintln!("📬 mail-steward v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());

    let store = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("opening database at {}", config.db_path.display()))?,
    );

    let mailer: Arc<dyn Mailer> = match SmtpConfig::from_env() {
        Some(smtp) => {
            eprintln!("   Mail: SMTP via {}:{}", smtp.host, smtp.port);
            Arc::new(SmtpMailer::new(smtp))
        }
        None => {
            eprintln!("   Mail: outbox only (EMAIL_SMTP_HOST not set)");
            Arc::new(OutboxMailer::new())
        }
    };

    let tools = Arc::new(ToolRegistry::new().with_retry_policy(config.retry));
    register_builtin_tools(
        &tools,
        mailer,
        Arc::new(InMemoryCalendar::new()),
        store.clone(),
    )
    .await;

    let (classifier, drafter) = build_pipeline(&config, &tools).await?;
    let executor = WorkflowExecutor::new(store.clone(), store.clone(), tools, classifier, drafter)
        .with_approval_policy(config.approval.clone())
        .with_correction_window(config.correction_window);

    match command.as_str() {
        "process" => {
            let email = read_email(args.get(1).map(String::as_str)).await?;
            let source = StdinDecisions::new();
            let outcome =
                run_interactive(&executor, email, &source, config.approval_timeout).await?;
            report(&outcome);
        }
        "pending" => {
            let pending = executor.pending().await?;
            if pending.is_empty() {
                println!("No workflows awaiting approval.");
            }
            for p in pending {
                println!("{}  {}  {}", p.conversation_id, p.action_type, p.preview);
            }
        }
        "resume" => {
            let (Some(conversation_id), Some(raw)) = (args.get(1), args.get(2)) else {
                bail!("resume needs a conversation id and a decision\n{USAGE}");
            };
            let decision = match raw.parse::<HumanDecision>().map_err(|e| anyhow!(e))? {
                HumanDecision::Approve => ApprovalDecision::approve(),
                HumanDecision::Deny => ApprovalDecision::deny(),
                HumanDecision::Edit => bail!("edit is only available interactively"),
            };
            let outcome = executor.resume(conversation_id, decision).await?;
            report(&outcome);
        }
        "correct" => {
            let (Some(sender), Some(original), Some(corrected)) =
                (args.get(1), args.get(2), args.get(3))
            else {
                bail!("correct needs a sender and two classifications\n{USAGE}");
            };
            let original: Classification = original.parse().map_err(|e| anyhow!("{e}"))?;
            let corrected: Classification = corrected.parse().map_err(|e| anyhow!("{e}"))?;
            let reason = args.get(4).cloned().unwrap_or_default();
            let correction = TriageCorrection::new(sender, "", original, corrected, reason);
            match executor.correct_triage(correction).await? {
                Some(promoted) => println!("Learned: always {promoted} mail from {sender}"),
                None => println!("Correction recorded."),
            }
        }
        other => bail!("unknown command '{other}'\n{USAGE}"),
    }

    Ok(())
}

/// Stderr logging, plus a daily rolling file when a log dir is configured.
fn init_tracing(config: &AgentConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mail-steward.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

#[cfg(feature = "rig")]
async fn build_pipeline(
    config: &AgentConfig,
    tools: &ToolRegistry,
) -> anyhow::Result<(Arc<dyn Classifier>, Arc<dyn Drafter>)> {
    use mail_steward::llm::{LlmBackend, LlmConfig, create_provider};
    use mail_steward::pipeline::{LlmClassifier, LlmDrafter};

    let Some(api_key) = config.api_key.clone() else {
        return Ok(offline_pipeline());
    };
    let llm = create_provider(&LlmConfig {
        backend: LlmBackend::Anthropic,
        api_key,
        model: config.model.clone(),
    })?;
    eprintln!("   Model: {}", config.model);
    let classifier = LlmClassifier::new(llm.clone()).with_retry_policy(config.retry);
    let drafter = LlmDrafter::new(llm, tools.tool_definitions().await)
        .with_retry_policy(config.retry);
    Ok((Arc::new(classifier), Arc::new(drafter)))
}

#[cfg(not(feature = "rig"))]
async fn build_pipeline(
    config: &AgentConfig,
    _tools: &ToolRegistry,
) -> anyhow::Result<(Arc<dyn Classifier>, Arc<dyn Drafter>)> {
    if config.api_key.is_some() {
        tracing::warn!("ANTHROPIC_API_KEY is set but the binary was built without the `rig` feature");
    }
    Ok(offline_pipeline())
}

fn offline_pipeline() -> (Arc<dyn Classifier>, Arc<dyn Drafter>) {
    eprintln!("   Model: none (rules classifier, template drafter)");
    (
        Arc::new(RulesClassifier::default_rules()),
        Arc::new(TemplateDrafter::new()),
    )
}

/// Load an email from a path, or stdin for `-`. JSON records and raw
/// RFC 5322 messages are both accepted.
async fn read_email(path: Option<&str>) -> anyhow::Result<EmailRecord> {
    let raw = match path {
        None | Some("-") => {
            let mut buf = Vec::new();
            tokio::io::stdin().read_to_end(&mut buf).await?;
            buf
        }
        Some(p) => tokio::fs::read(Path::new(p))
            .await
            .with_context(|| format!("reading {p}"))?,
    };

    let looks_json = raw
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{');
    if looks_json {
        return serde_json::from_slice(&raw).context("parsing email JSON");
    }
    parse_eml(&raw).ok_or_else(|| anyhow!("could not parse message"))
}

fn report(outcome: &ExecutionOutcome) {
    match outcome {
        ExecutionOutcome::Completed { result, state } => {
            let class = state
                .classification
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".into());
            println!("[{class}] {:?}: {}", result.status, result.output);
        }
        ExecutionOutcome::Suspended { pending } => {
            println!(
                "Awaiting approval: {} ({})",
                pending.conversation_id, pending.action_type
            );
        }
        ExecutionOutcome::Failed { error } => println!("Failed: {error}"),
    }
}

/// Reads approval decisions from the terminal.
struct StdinDecisions {
    lines: Mutex<Lines<BufReader<Stdin>>>,
}

impl StdinDecisions {
    fn new() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }
}

#[async_trait]
impl DecisionSource for StdinDecisions {
    async fn next_decision(&self, pending: &PendingApproval) -> Option<ApprovalDecision> {
        eprintln!("\n── Approval needed: {} ──", pending.action_type);
        eprintln!("{}\n", pending.preview);
        eprintln!("{}\n", pending.argument_summary);

        let mut lines = self.lines.lock().await;
        loop {
            eprint!("[a]pprove / [d]eny / [e]dit > ");
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => {
                    tracing::error!("Error reading stdin: {}", e);
                    return None;
                }
            };
            match line.parse::<HumanDecision>() {
                Ok(HumanDecision::Approve) => return Some(ApprovalDecision::approve()),
                Ok(HumanDecision::Deny) => return Some(ApprovalDecision::deny()),
                Ok(HumanDecision::Edit) => {
                    eprint!("New text > ");
                    let body = lines.next_line().await.ok().flatten()?;
                    return Some(ApprovalDecision::edit_body(body));
                }
                Err(e) => eprintln!("{e}"),
            }
        }
    }
}
