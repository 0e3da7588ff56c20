//! Paywall Decider: evaluates one host event against a campaign file and
//! prints the presentation outcome as JSON.

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use paywall_assignments::{EventSinkPostback, JsonFileAssignmentPersistence};
use paywall_core::event_bus::{DecisionEvent, EventSink};
use paywall_core::types::EventData;
use paywall_core::{AppConfig, PassableValue};
use paywall_presentation::{Collaborators, DecisionContext, FileConfigFetcher, PresentationRequest};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "paywall-decider")]
#[command(about = "Decide whether a host event should present a paywall")]
#[command(version)]
struct Cli {
    /// Optional TOML settings file
    #[arg(long, env = "PAYWALL_DECIDER__CONFIG_FILE")]
    config: Option<String>,

    /// Campaign model JSON (triggers, paywalls, server assignments)
    #[arg(long, env = "PAYWALL_DECIDER__CAMPAIGN")]
    campaign: String,

    /// Host event to evaluate
    #[arg(long, conflicts_with = "paywall")]
    event: Option<String>,

    /// Present a specific paywall, skipping rules and assignment
    #[arg(long)]
    paywall: Option<String>,

    /// Event parameter as key=value; values parse as JSON when possible
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, PassableValue)>,

    /// User attribute as key=value; values parse as JSON when possible
    #[arg(long = "attr", value_parser = parse_param)]
    attributes: Vec<(String, PassableValue)>,

    /// Device locale (overrides config)
    #[arg(long, env = "PAYWALL_DECIDER__DEVICE__LOCALE")]
    locale: Option<String>,

    /// Confirmed assignment store (overrides config)
    #[arg(long, env = "PAYWALL_DECIDER__ASSIGNMENTS__STORE_PATH")]
    assignments: Option<String>,

    /// Seed for variant draws (overrides config)
    #[arg(long)]
    seed: Option<u64>,

    /// Treat the user as an active subscriber
    #[arg(long, default_value_t = false)]
    subscribed: bool,

    /// Present even to active subscribers
    #[arg(long, default_value_t = false)]
    ignore_subscription: bool,

    /// Debug preview: bypass the subscription gate and the response cache
    #[arg(long, default_value_t = false)]
    preview: bool,

    /// Evaluate without confirming assignments or recording occurrences
    #[arg(long, default_value_t = false)]
    speculative: bool,

    /// Preload active treatment paywalls after loading the campaign
    #[arg(long, default_value_t = false)]
    preload: bool,

    /// Clear stored assignments before evaluating
    #[arg(long, default_value_t = false)]
    reset: bool,
}

fn parse_param(raw: &str) -> Result<(String, PassableValue), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    let value = serde_json::from_str::<serde_json::Value>(value)
        .map(PassableValue::from)
        .unwrap_or_else(|_| PassableValue::from(value));
    Ok((key.to_string(), value))
}

/// Forwards decision events to the log.
struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: DecisionEvent) {
        info!(
            event_type = ?event.event_type,
            event_name = event.event_name.as_deref().unwrap_or("-"),
            experiment_id = event.experiment_id.as_deref().unwrap_or("-"),
            variant_id = event.variant_id.as_deref().unwrap_or("-"),
            paywall_id = event.paywall_id.as_deref().unwrap_or("-"),
            "Decision event"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "paywall_decider=info,paywall_presentation=info".into()),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load_from(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(locale) = cli.locale {
        config.device.locale = locale;
    }
    if let Some(path) = cli.assignments {
        config.assignments.store_path = path;
    }
    if cli.seed.is_some() {
        config.assignments.seed = cli.seed;
    }
    if cli.preview {
        config.debug.preview = true;
    }
    if cli.preload {
        config.cache.preload = true;
    }

    info!(
        campaign = %cli.campaign,
        locale = %config.device.locale,
        store = %config.assignments.store_path,
        "Configuration loaded"
    );

    let request = match (cli.event, cli.paywall) {
        (Some(name), None) => {
            let mut event = EventData::new(name);
            event.parameters.extend(cli.params);
            PresentationRequest::for_event(event)
        }
        (None, Some(identifier)) => PresentationRequest::for_paywall(identifier),
        _ => bail!("exactly one of --event or --paywall is required"),
    };
    let request = if cli.ignore_subscription {
        request.ignoring_subscription_status()
    } else {
        request
    };
    let request = if cli.speculative {
        request.speculative()
    } else {
        request
    };

    let events: Arc<dyn EventSink> = Arc::new(LogSink);
    let mut collaborators = Collaborators::in_memory(Arc::new(FileConfigFetcher::new(&cli.campaign)));
    collaborators.persistence = Arc::new(JsonFileAssignmentPersistence::new(
        &config.assignments.store_path,
    ));
    collaborators.postback = Arc::new(EventSinkPostback::new(events.clone()));
    collaborators.events = events;

    let ctx = DecisionContext::new(config, collaborators)
        .await
        .context("failed to open assignment store")?;
    if cli.reset {
        ctx.reset().await.context("failed to reset assignments")?;
    }
    ctx.refresh()
        .await
        .with_context(|| format!("failed to load campaign {}", cli.campaign))?;

    ctx.set_subscribed(cli.subscribed);
    for (key, value) in cli.attributes {
        ctx.set_user_attribute(key, value);
    }

    let outcome = ctx.present(&request).await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    ctx.assignments.flush_postbacks().await;
    Ok(())
}
