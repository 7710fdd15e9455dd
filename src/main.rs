mod anthropic;
mod cleaning;
mod cli;
mod collaborators;
mod config;
mod contract;
mod document;
mod error;
mod executor;
mod logging;
mod orchestrator;
mod registry;
mod router;
mod state_machine;
mod ui;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use crate::anthropic::{AnthropicClient, MessageSender};
use crate::cli::{Cli, Command};
use crate::collaborators::{
    AnthropicExtractor, AnthropicValidator, Collaborators, Extractor, FileStore, InMemoryStore,
    KeywordPolicyRetriever, PatternExtractor, RuleValidator, Store, Validator,
};
use crate::config::{IntakeConfig, ValidatorMode};
use crate::contract::ContractPayload;
use crate::executor::{PipelineExecutor, ResponseStatus};
use crate::orchestrator::ContractOrchestrator;
use crate::registry::IdempotencyRegistry;
use crate::router::Router;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = IntakeConfig::load(cli.config.as_deref())?;

    let level = if cli.verbose { "debug" } else { config.log_level.as_str() };
    logging::init(level, config.log_format);

    if let Command::Demo = cli.command {
        return run_demo(&config).await;
    }

    let store: Arc<dyn Store> = Arc::new(
        FileStore::open(&config.store_path)
            .await
            .with_context(|| format!("opening store {}", config.store_path.display()))?,
    );
    let executor = start_executor(&config, build_collaborators(&config, store)?);

    let result = dispatch(&executor, cli.command, cli.json).await;
    executor.shutdown().await;
    result
}

/// Pick the extractor and validator for the configured mode.
fn build_collaborators(config: &IntakeConfig, store: Arc<dyn Store>) -> Result<Collaborators> {
    let retriever = KeywordPolicyRetriever::from_dir(&config.policy_dir, config.retrieval_k)?;
    info!(chunks = retriever.chunk_count(), k = config.retrieval_k, "policy corpus ready");
    let rules: Arc<dyn Validator> = Arc::new(RuleValidator::new(config.policy_threshold));

    let (extractor, validator): (Arc<dyn Extractor>, Arc<dyn Validator>) = if config.has_api_key() {
        let client = AnthropicClient::new(
            config.api_key.clone(),
            Duration::from_secs(config.llm_timeout_secs),
        )
        .context("building Anthropic client")?;
        let sender: Arc<dyn MessageSender> = Arc::new(client);
        let validator: Arc<dyn Validator> = match config.validator {
            ValidatorMode::Llm => Arc::new(AnthropicValidator::new(
                sender.clone(),
                config.validation_model.clone(),
            )),
            ValidatorMode::Rules => rules,
        };
        info!(model = %config.extraction_model, validator = ?config.validator, "using Anthropic extraction");
        (
            Arc::new(AnthropicExtractor::new(sender, config.extraction_model.clone())),
            validator,
        )
    } else {
        info!("no API key configured, using offline pattern extraction and rule validation");
        (Arc::new(PatternExtractor), rules)
    };

    Ok(Collaborators {
        extractor,
        validator,
        retriever: Arc::new(retriever),
        store,
    })
}

fn start_executor(config: &IntakeConfig, collaborators: Collaborators) -> PipelineExecutor {
    let router = Router::new(config.confidence_threshold, config.policy_threshold);
    let orchestrator = Arc::new(ContractOrchestrator::new(
        collaborators,
        router,
        config.pipeline_settings(),
    ));
    let registry = Arc::new(IdempotencyRegistry::new(config.idempotency_enabled));
    info!(idempotency = registry.is_enabled(), "registry ready");
    PipelineExecutor::start(orchestrator, registry, config.executor_config())
}

async fn dispatch(executor: &PipelineExecutor, command: Command, json: bool) -> Result<()> {
    match command {
        Command::Process {
            file,
            sender,
            subject,
            key,
            timeout,
        } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let payload = ContractPayload::new(sender, subject, file_name(&file), bytes);
            process(executor, payload, key.as_deref(), timeout.map(Duration::from_secs), json).await?;
        }
        Command::ReviewQueue { limit, offset } => {
            let items = executor.list_review_queue(limit, offset).await?;
            if json {
                ui::print_json(&items);
            } else {
                ui::print_review_queue(&items);
            }
        }
        Command::Approved { limit, offset } => {
            let records = executor.list_approved(limit, offset).await?;
            if json {
                ui::print_json(&records);
            } else {
                ui::print_contracts(&records);
            }
        }
        Command::Approve { contract_id } => {
            let record = executor.approve(&contract_id).await?;
            ui::print_contract(&record);
        }
        Command::Reject { contract_id } => {
            let record = executor.reject(&contract_id).await?;
            ui::print_contract(&record);
        }
        Command::Show { contract_id } => {
            let record = executor.contract(&contract_id).await?;
            ui::print_contract(&record);
        }
        Command::Logs { limit, offset } => {
            let entries = executor.list_logs(limit, offset).await?;
            if json {
                ui::print_json(&entries);
            } else {
                ui::print_logs(&entries);
            }
        }
        Command::Demo => {}
    }
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload.pdf".to_string())
}

/// Submit one payload and print the response. A deferred response is
/// followed until the job reaches a terminal state.
async fn process(
    executor: &PipelineExecutor,
    payload: ContractPayload,
    key: Option<&str>,
    timeout: Option<Duration>,
    json: bool,
) -> Result<()> {
    let progress = ui::SubmissionProgress::start(&payload.filename);
    let response = match executor.submit(payload, key, timeout).await {
        Ok(response) => response,
        Err(e) => {
            progress.abort(&e.to_string());
            return Err(e.into());
        }
    };

    if json {
        progress.finish_quiet();
        ui::print_json(&response);
    } else {
        progress.finish(&response);
    }

    if response.status != ResponseStatus::Accepted {
        return Ok(());
    }

    let waiting = ui::SubmissionProgress::start(&response.contract_id);
    waiting.set_message(format!("Waiting for job {}", response.contract_id));
    loop {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let Some(view) = executor.lookup(&response.contract_id).await? else {
            waiting.finish_quiet();
            break;
        };
        if view.status.is_terminal() {
            waiting.finish_quiet();
            if json {
                ui::print_json(&view);
            } else {
                ui::print_job(&view);
            }
            break;
        }
    }
    Ok(())
}

/// Three offline scenarios against an in-memory store: a clean low-value
/// contract, a high-value contract, and a corrupted upload. A repeated
/// submission shows the idempotent join.
async fn run_demo(config: &IntakeConfig) -> Result<()> {
    let collaborators = Collaborators {
        extractor: Arc::new(PatternExtractor),
        validator: Arc::new(RuleValidator::new(config.policy_threshold)),
        retriever: Arc::new(KeywordPolicyRetriever::builtin(config.retrieval_k)),
        store: Arc::new(InMemoryStore::new()),
    };
    let executor = start_executor(config, collaborators);

    let scenarios: [(&str, &str, Vec<u8>); 3] = [
        (
            "Clean low-value contract",
            "acme-msa.pdf",
            document::minimal_pdf(&[
                "Master Services Agreement",
                "Vendor: Acme Holdings",
                "Effective Date: January 1, 2026",
                "Expiration Date: December 31, 2026",
                "Total Value: $70,000 USD",
                "Payment Terms: Net 30",
            ])?,
        ),
        (
            "High-value contract",
            "globex-license.pdf",
            document::minimal_pdf(&[
                "Enterprise License Agreement",
                "Vendor: Globex Corporation",
                "Effective Date: 2026-02-01",
                "Expiration Date: 2029-01-31",
                "Total Value: $750,000",
                "Auto-Renewal: yes",
            ])?,
        ),
        (
            "Corrupted upload",
            "scan.pdf",
            b"this is not a PDF document".to_vec(),
        ),
    ];

    for (title, filename, bytes) in scenarios {
        ui::print_heading(title);
        let payload = ContractPayload::new("demo@localhost", title, filename, bytes);
        process(&executor, payload, Some(filename), None, false).await?;
    }

    ui::print_heading("Duplicate delivery of the first contract");
    let again = ContractPayload::new("demo@localhost", "retry", "acme-msa.pdf", Vec::new());
    process(&executor, again, Some("acme-msa.pdf"), None, false).await?;

    ui::print_heading("Review queue");
    ui::print_review_queue(&executor.list_review_queue(20, 0).await?);

    executor.shutdown().await;
    Ok(())
}
