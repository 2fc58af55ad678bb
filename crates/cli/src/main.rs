//! Command-line driver.
//!
//! Usage: `scholarqa [--config settings.toml] <question...>`
//!
//! Submits one question, prints steps as they finish and dumps the final
//! task state document as JSON. The production ingress is an external HTTP
//! layer over the same `TaskService`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use scholarqa_config::Settings;
use scholarqa_core::TaskStatus;
use scholarqa_tasks::{build_service, SubmitRequest};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (config_path, query) = parse_args()?;
    let settings = Settings::load(config_path.as_deref()).context("loading settings")?;
    let service = build_service(settings).context("building service")?;

    let doc = service
        .submit(SubmitRequest {
            query,
            user_id: "cli".to_string(),
            opt_in: false,
            feedback_toggle: false,
        })
        .await
        .context("submitting task")?;
    tracing::info!(task_id = %doc.task_id, estimate = %doc.estimated_time, "task submitted");

    let mut printed_steps = 0;
    loop {
        let doc = service.poll(&doc.task_id).await.context("polling task")?;
        while printed_steps < doc.steps.len()
            && doc.steps[printed_steps].end_timestamp.is_some()
        {
            println!("done: {}", doc.steps[printed_steps].description);
            printed_steps += 1;
        }

        if doc.task_status.is_terminal() {
            println!("{}", serde_json::to_string_pretty(&doc)?);
            if doc.task_status != TaskStatus::Complete {
                bail!(
                    "task ended as {}: {}",
                    doc.task_status,
                    doc.detail.unwrap_or_default()
                );
            }
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

fn parse_args() -> Result<(Option<PathBuf>, String)> {
    let mut args = std::env::args().skip(1).peekable();
    let mut config_path = None;
    let mut query_words = Vec::new();

    while let Some(arg) = args.next() {
        if arg == "--config" {
            let path = args
                .next()
                .context("--config requires a path argument")?;
            config_path = Some(PathBuf::from(path));
        } else {
            query_words.push(arg);
        }
    }

    if query_words.is_empty() {
        bail!("usage: scholarqa [--config settings.toml] <question...>");
    }
    Ok((config_path, query_words.join(" ")))
}
