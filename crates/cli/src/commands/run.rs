//! `toolrelay run`: Autonomous free-text decision loop.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use toolrelay_agent::{FreeTextAgent, OrchestratorError};
use uuid::Uuid;

use super::build_runtime;

pub async fn run(
    goal: String,
    max_iterations: Option<u32>,
    delay_ms: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = build_runtime()?;
    let config = &runtime.config;

    let mut agent = FreeTextAgent::new(
        runtime.provider.clone(),
        runtime.catalog.clone(),
        runtime.debug.clone(),
        runtime.model.clone(),
    )
    .with_config(&config.free_text)
    .with_context_config(&config.context)
    .with_loop_guard(config.loop_guard.clone())
    .with_temperature(config.default_temperature)
    .with_max_tokens(config.default_max_tokens)
    .with_model_timeout(Duration::from_secs(config.orchestrator.model_timeout_secs));

    if let Some(max) = max_iterations {
        agent = agent.with_max_iterations(max);
    }
    if let Some(ms) = delay_ms {
        agent = agent.with_decision_delay(Duration::from_millis(ms));
    }

    let cancel = CancellationToken::new();
    agent.set_cancellation(cancel.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n  Stopping...");
            cancel.cancel();
        }
    });

    let session_id = Uuid::new_v4().to_string();
    println!();
    println!("  Goal:   {goal}");
    println!("  Model:  {}", runtime.model);
    println!();

    match agent.run(&session_id, &goal).await {
        Ok(outcome) => {
            println!("{}", outcome.answer);
            println!();
            println!(
                "  {} decisions, {} tool calls",
                outcome.iterations, outcome.tool_calls
            );
        }
        Err(OrchestratorError::Aborted { message, .. }) => {
            println!("{message}");
        }
        Err(e) => return Err(e.into()),
    }

    let stats = runtime.debug.stats();
    println!(
        "  {} events, {} tokens",
        stats.total_events, stats.tokens.total_tokens
    );
    Ok(())
}
