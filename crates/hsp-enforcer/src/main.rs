mod cli;
mod config;
mod event_source;
mod reload;
mod signals;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info};

use audit_log::AuditSink;
use hsp_engine::lifecycle::{self, PolicyLifecycle};
use hsp_engine::{AlertEmitter, AuditMode, DecisionEngine, Enforcer, RuleIndex};

use crate::cli::Cli;
use crate::event_source::{EventSource, VerdictLine};

/// Queue depth for policy commands.
const LIFECYCLE_BUFFER: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args.
    let cli = Cli::parse();

    // 2. Load config, then merge CLI overrides.
    let mut cfg = config::load(&cli.config)?;

    if let Some(ref dir) = cli.policy_dir {
        cfg.policy_dir = dir.clone();
    }
    if let Some(ref path) = cli.audit_log {
        cfg.audit.log_path = path.clone();
    }
    if cli.audit_all {
        cfg.audit.mode = AuditMode::All;
    }
    let Some(posture) = cli.default_posture.or(cfg.enforcement.default_posture) else {
        bail!(
            "no default posture configured: set enforcement.default_posture in {} \
             or pass --default-posture allow|block",
            cli.config.display()
        );
    };

    // 3. Init tracing-subscriber with JSON format.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();

    let host_name = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    info!(
        config_file = %cli.config.display(),
        policy_dir = %cfg.policy_dir.display(),
        posture = ?posture,
        audit_mode = ?cfg.audit.mode,
        host = %host_name,
        "hsp-enforcer starting"
    );

    // 4. Start the alert stream.
    let (sink, audit_handle) = AuditSink::start(&cfg.audit.log_path, cfg.audit.buffer)
        .await
        .context("failed to start audit logger")?;

    // 5. Start the lifecycle manager and load policies through it.
    let index = Arc::new(RuleIndex::new());
    let (policies, lifecycle_task) =
        lifecycle::spawn(PolicyLifecycle::new(Arc::clone(&index)), LIFECYCLE_BUFFER);

    reload::sync_policy_dir(&policies, &cfg.policy_dir).await?;

    let status = policies.status().await?;
    info!(
        policies = status.len(),
        rules = index.snapshot().len(),
        "policy set loaded"
    );

    // 6. Wire the enforcement path.
    let enforcer = Enforcer::new(
        DecisionEngine::new(Arc::clone(&index), posture),
        AlertEmitter::new(sink.clone(), cfg.audit.mode, host_name),
    );

    // 7. Replay events until the input ends or we are told to stop. SIGHUP
    // re-syncs the policy directory without interrupting decisions.
    let mut signals = signals::install()?;
    let mut source = EventSource::open(cli.events.as_deref()).await?;
    let mut decided = 0usize;
    let mut blocked = 0usize;
    let mut failure = None;

    loop {
        tokio::select! {
            next = source.next_event() => {
                let Some((line, event)) = next? else {
                    break;
                };
                let verdict = enforcer.enforce(&event);
                decided += 1;
                if verdict.is_block() {
                    blocked += 1;
                }
                let out = serde_json::to_string(&VerdictLine::new(line, &event, &verdict))
                    .context("failed to encode verdict")?;
                println!("{out}");
            }
            _ = signals.shutdown.recv() => break,
            Some(()) = signals.reload.recv() => {
                match reload::sync_policy_dir(&policies, &cfg.policy_dir).await {
                    Ok(_) => {}
                    Err(e) if reload::is_fatal(&e) => {
                        failure = Some(e);
                        break;
                    }
                    Err(e) => {
                        error!(error = %format!("{e:#}"), "policy reload failed; current policies stay active");
                    }
                }
            }
        }
    }

    // 8. Shut down: drain policies, then flush the alert stream.
    info!(
        decided,
        blocked,
        skipped = source.skipped(),
        alerts_queued = sink.stats().queued(),
        alerts_dropped = sink.stats().dropped(),
        "hsp-enforcer shutting down"
    );

    drop(policies);
    let lifecycle = lifecycle_task
        .await
        .context("lifecycle manager panicked")?;
    for policy in lifecycle.status() {
        info!(policy = %policy.name, state = %policy.state, rules = policy.rules, "final policy state");
    }

    drop(enforcer);
    let stats = sink.stats_handle();
    drop(sink);
    audit_handle.await.context("audit writer panicked")?;
    info!(
        alerts_written = stats.queued().saturating_sub(stats.lost()),
        alerts_lost = stats.lost(),
        "alert stream flushed"
    );

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
