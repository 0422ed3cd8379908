// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Two run modes share one binary: an Agent Client Protocol server over
//! stdio, and a headless single-turn CLI. See `cli::Cli::wants_acp_server`
//! for how the choice is made.

mod cli;
mod output;
mod permission_cli;

use std::io::Read as _;
use std::process::ExitCode;
use std::sync::Arc;

use agent_client_protocol::AgentSideConnection;
use clap::Parser;
use tokio_util::compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crush_acp::CrushAgent;
use crush_bootstrap::RuntimeContext;
use crush_coordinator::{Coordinator, CoordinatorError, QueueMode};
use crush_store::{FinishReason, Role};

use cli::{Cli, OutputFormat};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to start the async runtime");

    if cli.wants_acp_server() {
        // The ACP `Agent` trait is `?Send` (it holds `Rc`-ish per-session
        // state in `crush-acp`'s translators), so the server loop must run
        // inside a `LocalSet` rather than `tokio::spawn`.
        let local = tokio::task::LocalSet::new();
        local.block_on(&runtime, run_acp_server(cli))
    } else {
        runtime.block_on(run_headless_turn(cli))
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

/// Build the shared pieces both run modes need: layered config (with
/// `--config`/`--model`/`--yolo` overrides applied), the model provider, and
/// auto-detected runtime context.
fn bootstrap(cli: &Cli) -> anyhow::Result<(Arc<crush_config::Config>, Arc<dyn crush_model::ModelProvider>)> {
    let mut config = crush_config::load(cli.config.as_deref())?;
    if let Some(spec) = &cli.model {
        config.model = crush_model::resolve_model_cfg(&config.model, spec);
    }
    if cli.yolo {
        config.permission.yolo_mode = true;
    }
    let model = crush_model::from_config(&config.model)?;
    Ok((Arc::new(config), Arc::from(model)))
}

// ─── ACP server ────────────────────────────────────────────────────────────

async fn run_acp_server(cli: Cli) -> ExitCode {
    let (config, model) = match bootstrap(&cli) {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, "failed to start: configuration or model provider error");
            return ExitCode::from(3);
        }
    };

    let runtime_ctx = RuntimeContext::auto_detect();
    let coordinator = match Coordinator::open(config, model, runtime_ctx, QueueMode::Interrupt, None) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to open session/message store");
            return ExitCode::from(3);
        }
    };

    let stdin = tokio::io::stdin().compat();
    let stdout = tokio::io::stdout().compat_write();

    // `AgentSideConnection` needs the `Client` handle it itself becomes once
    // constructed before `CrushAgent` can be built (the agent forwards
    // permission requests and session updates through it) — so the agent is
    // constructed from inside the factory closure the connection invokes
    // with its own handle, the same inversion `ClientSideConnection` avoids
    // on the editor side by handing its `Client` impl in up front.
    let (conn, io_fut) = AgentSideConnection::new(
        move |client| CrushAgent::new(coordinator.clone(), client),
        stdout,
        stdin,
        |fut| {
            tokio::task::spawn_local(fut);
        },
    );
    let _conn = conn;

    match io_fut.await {
        Ok(()) => {
            info!("acp connection closed");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "acp connection error");
            ExitCode::FAILURE
        }
    }
}

// ─── Headless single turn ──────────────────────────────────────────────────

async fn run_headless_turn(cli: Cli) -> ExitCode {
    let (config, model) = match bootstrap(&cli) {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, "failed to start: configuration or model provider error");
            return ExitCode::from(3);
        }
    };

    let prompt = match resolve_prompt(&cli).await {
        Some(p) => p,
        None => {
            error!("no prompt given on the command line or piped on stdin");
            return ExitCode::from(2);
        }
    };

    let runtime_ctx = RuntimeContext::auto_detect();
    let coordinator = match Coordinator::open(config.clone(), model, runtime_ctx, QueueMode::Queue, None) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to open session/message store");
            return ExitCode::from(3);
        }
    };

    if !config.permission.yolo_mode {
        permission_cli::spawn(coordinator.arbiter().clone());
    }

    let session = match resolve_session(&coordinator, &cli, &prompt).await {
        Ok(s) => s,
        Err(code) => return code,
    };

    if cli.mode != crush_config::AgentMode::Agent {
        coordinator.set_mode(&session.id, cli.mode).await;
    }

    let mut message_sub = coordinator.messages().subscribe();
    let start = std::time::Instant::now();

    let run_rx = if let Some(fork_point) = &cli.fork_at {
        match coordinator.resume_from(&session.id, fork_point, prompt.clone()).await {
            Ok(rx) => rx,
            Err(e) => {
                error!(error = %e, "failed to fork session at requested message");
                return exit_code_for(&e);
            }
        }
    } else {
        coordinator.run(session.id.clone(), prompt.clone()).await
    };

    let streaming = output::streams_incrementally(cli.format);
    let mut last_text = String::new();
    let mut turn_count = 0usize;

    let outcome = tokio::select! {
        result = run_rx => result,
        _ = tokio::signal::ctrl_c() => {
            coordinator.cancel(&session.id).await;
            Err(CoordinatorError::Cancelled)
        }
    };

    // Drain whatever landed in the message store while the turn ran so
    // `text`/`stream-json` can print incrementally-observed content even
    // though we only awaited the final result above. This is a best-effort
    // catch-up pass over whatever is still buffered in the subscription.
    while let Ok(Some(event)) = tokio::time::timeout(std::time::Duration::from_millis(1), message_sub.recv()).await {
        if event.payload.session_id != session.id {
            continue;
        }
        turn_count += 1;
        if streaming {
            print_stream_event(cli.format, &event.payload);
        }
        if event.payload.role == Role::Assistant {
            last_text = output::assistant_text(&event.payload.parts);
        }
    }

    let duration_ms = start.elapsed().as_millis();

    match outcome {
        Ok(turn) => {
            let messages = coordinator.messages().list(&session.id).await.unwrap_or_default();
            if let Some(assistant) = messages.iter().rev().find(|m| m.role == Role::Assistant) {
                last_text = output::assistant_text(&assistant.parts);
            }
            let truncated = turn.finish_reason == FinishReason::MaxTokens;
            emit_final(
                cli.format,
                &session.id,
                &config.model.provider,
                &config.model.name,
                &prompt,
                &last_text,
                &turn,
                duration_ms,
                turn_count,
                "success",
                None,
                None,
                truncated,
            );
            ExitCode::SUCCESS
        }
        Err(CoordinatorError::Cancelled) => {
            emit_error(cli.format, &session.id, &config, &prompt, duration_ms, turn_count, "interrupted", "cancelled by user");
            ExitCode::from(130)
        }
        Err(e) => {
            let code = exit_code_for(&e);
            emit_error(cli.format, &session.id, &config, &prompt, duration_ms, turn_count, "error", &e.to_string());
            code
        }
    }
}

fn exit_code_for(err: &CoordinatorError) -> ExitCode {
    match err {
        CoordinatorError::SessionNotFound(_) => ExitCode::from(2),
        CoordinatorError::Cancelled => ExitCode::from(130),
        CoordinatorError::Store(_) | CoordinatorError::Model(_) | CoordinatorError::Superseded => ExitCode::from(1),
    }
}

async fn resolve_prompt(cli: &Cli) -> Option<String> {
    if let Some(p) = &cli.prompt {
        return Some(p.clone());
    }
    tokio::task::spawn_blocking(|| {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).ok()?;
        let trimmed = buf.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
    .await
    .ok()
    .flatten()
}

async fn resolve_session(
    coordinator: &Arc<Coordinator>,
    cli: &Cli,
    prompt: &str,
) -> Result<crush_store::Session, ExitCode> {
    if let Some(id) = &cli.session {
        return match coordinator.sessions().get(id).await {
            Ok(Some(session)) => Ok(session),
            Ok(None) => {
                error!(session = %id, "no such session");
                Err(ExitCode::from(2))
            }
            Err(e) => {
                error!(error = %e, "store error resolving --session");
                Err(ExitCode::from(1))
            }
        };
    }
    let title = prompt.chars().take(60).collect::<String>();
    coordinator.sessions().create(title).await.map_err(|e| {
        error!(error = %e, "failed to create session");
        ExitCode::from(1)
    })
}

fn print_stream_event(format: OutputFormat, message: &crush_store::Message) {
    match format {
        OutputFormat::StreamJson => {
            println!("{}", output::stream_json_line("message", &message.id, message.role, &message.parts));
        }
        OutputFormat::Text => {
            if message.role == Role::Assistant {
                print!("{}", output::assistant_text(&message.parts));
                let _ = std::io::Write::flush(&mut std::io::stdout());
            }
        }
        _ => {}
    }
}

#[allow(clippy::too_many_arguments)]
fn emit_final(
    format: OutputFormat,
    session_id: &str,
    provider: &str,
    model: &str,
    prompt: &str,
    output_text: &str,
    turn: &crush_coordinator::TurnOutcome,
    duration_ms: u128,
    turn_count: usize,
    status: &str,
    error: Option<&str>,
    error_code: Option<&str>,
    truncated: bool,
) {
    match format {
        OutputFormat::Raw => println!("{output_text}"),
        OutputFormat::Text => {
            // The incremental drain above already streamed assistant text;
            // a trailing newline closes it out cleanly.
            println!();
        }
        OutputFormat::Json | OutputFormat::StreamJson => {
            let session_stub = crush_store::Session {
                id: session_id.to_string(),
                parent_id: None,
                title: String::new(),
                summary_message_id: None,
                prompt_tokens: 0,
                completion_tokens: 0,
                cache_read_tokens: 0,
                cache_write_tokens: 0,
                cost: turn.cost,
                todos: Vec::new(),
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            };
            let result = output::turn_result_json(
                &session_stub,
                turn,
                model,
                provider,
                prompt,
                output_text,
                duration_ms,
                turn_count,
                status,
                error,
                error_code,
                truncated,
            );
            println!("{}", serde_json::to_string_pretty(&result).unwrap_or_default());
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn emit_error(
    format: OutputFormat,
    session_id: &str,
    config: &crush_config::Config,
    prompt: &str,
    duration_ms: u128,
    turn_count: usize,
    status: &str,
    message: &str,
) {
    let stub = crush_coordinator::TurnOutcome {
        session_id: session_id.to_string(),
        assistant_message_id: String::new(),
        finish_reason: FinishReason::Error,
        tool_call_count: 0,
        input_tokens: 0,
        output_tokens: 0,
        cache_read_tokens: 0,
        cache_write_tokens: 0,
        cost: 0.0,
    };
    emit_final(
        format,
        session_id,
        &config.model.provider,
        &config.model.name,
        prompt,
        "",
        &stub,
        duration_ms,
        turn_count,
        status,
        Some(message),
        Some(status),
        false,
    );
}
