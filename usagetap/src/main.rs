use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use log::warn;
use serde_json::json;
use tokio::io::AsyncReadExt;
use usagetap::{Value, provider, settings::Settings, telemetry, usage};

mod smoke;

#[derive(Debug, Parser)]
#[command(name = "usagetap", version, about = "Usage tracking for AI provider clients")]
struct Opt {
    /// Verbose output
    #[clap(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the built-in smoke checks against mock clients
    Smoke,
    /// Print the provider tag for a client module path
    Detect {
        /// Module path, e.g. `anthropic.client`
        identity: String,
    },
    /// Print the usage extracted from a JSON response
    Normalize {
        /// Provider whose configured rules apply
        #[arg(long, default_value = provider::UNKNOWN_PROVIDER)]
        provider: String,
        /// JSON file, or `-` for stdin
        input: String,
    },
}

async fn read_input(input: &str) -> Result<String> {
    if input == "-" {
        let mut buf = String::new();
        tokio::io::stdin()
            .read_to_string(&mut buf)
            .await
            .context("Failed to read stdin")?;
        Ok(buf)
    } else {
        std::fs::read_to_string(input).with_context(|| format!("Failed to read {}", input))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        if opt.verbose { "info" } else { "warn" }
    ))
    .init();

    let settings = Settings::new().unwrap_or_else(|e| {
        warn!("Ignoring invalid settings: {}", e);
        Settings::default()
    });
    if let Err(e) = telemetry::init_metrics_with_endpoint(settings.otel_exporter_otlp_endpoint.as_deref()) {
        warn!("Metrics export disabled: {:#}", e);
    }

    let result = match opt.command {
        Command::Smoke => {
            if smoke::run().await {
                Ok(())
            } else {
                Err(anyhow::anyhow!("smoke checks failed"))
            }
        }
        Command::Detect { identity } => {
            println!("{}", provider::provider_for_origin(provider::provider_table(), &identity));
            Ok(())
        }
        Command::Normalize { provider, input } => normalize(&provider, &input).await,
    };

    telemetry::shutdown_metrics();
    result
}

async fn normalize(provider: &str, input: &str) -> Result<()> {
    let raw = read_input(input).await?;
    let response: serde_json::Value =
        serde_json::from_str(&raw).context("Input is not valid JSON")?;
    if !response.is_object() {
        bail!("Expected a JSON object response");
    }

    let response = Value::Data(response);
    let output = json!({
        "provider": provider,
        "model": usage::response_model(&response, provider),
        "usage": usage::normalize(&response, provider),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
