//! Self-contained smoke checks run by `usagetap smoke`.

use std::sync::Arc;

use anyhow::{Result, bail, ensure};
use log::info;
use serde_json::json;
use usagetap::{
    Args, CallError, MemorySink, Metadata, Object, Record, TapOptions, UsageEvent, UsageRecord,
    UsageSink, Value, WrappedClient, context, provider, usage,
};

fn mock_provider() -> Arc<dyn Object> {
    Record::new("TestProvider")
        .origin("smoke.provider")
        .method("generate", |args: Args| async move {
            if args.get("customer_id").is_some() || args.get("metadata").is_some() {
                return Err(CallError::msg(
                    "TypeError",
                    "generate() got an unexpected keyword argument",
                ));
            }
            Ok(Value::Data(json!({
                "text": "response",
                "usage": {"prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30}
            })))
        })
        .method("explode", |_args: Args| async {
            Err::<Value, _>(CallError::msg("Exception", "API Error"))
        })
        .into_object()
}

struct RefusingSink;

impl UsageSink for RefusingSink {
    fn report_usage(&self, _event: UsageEvent) -> Result<()> {
        bail!("collector unreachable")
    }
}

async fn check_wrapping() -> Result<()> {
    let sink = Arc::new(MemorySink::new());
    let client = WrappedClient::wrap(mock_provider(), TapOptions::default(), sink.clone());

    let response = client
        .call("generate", Args::new().arg("test prompt").customer_id("smoke-customer"))
        .await?;
    ensure!(
        response.path("text").and_then(|t| t.as_str().map(str::to_string)).as_deref()
            == Some("response"),
        "response was altered by the proxy"
    );

    let events = sink.events();
    ensure!(events.len() == 1, "expected one event, got {}", events.len());
    ensure!(
        events[0].customer_id.as_deref() == Some("smoke-customer"),
        "customer id not recorded"
    );
    ensure!(events[0].total_tokens == 30, "usage not recorded");
    Ok(())
}

async fn check_provider_detection() -> Result<()> {
    let table = provider::provider_table();
    for (origin, expected) in [
        ("openai.client", "openai"),
        ("anthropic.client", "anthropic"),
        ("google.generativeai", "google"),
        ("cohere.client", "cohere"),
        ("unknown.module", "unknown"),
    ] {
        let client = Record::new("MockProvider").origin(origin);
        let detected = provider::detect_provider_with(table, &client, None, true);
        ensure!(detected == expected, "{origin}: expected {expected}, got {detected}");
    }
    Ok(())
}

async fn check_context_scopes() -> Result<()> {
    context::clear_customer();
    {
        let _scope = context::enter_customer_scope("context-customer");
        ensure!(
            context::customer().as_deref() == Some("context-customer"),
            "customer scope not entered"
        );
    }
    ensure!(context::customer().is_none(), "customer scope not restored");

    let mut metadata = Metadata::new();
    metadata.insert("test".to_string(), json!("value"));
    context::with_metadata_scope(metadata, || {
        ensure!(context::metadata()["test"] == "value", "metadata scope not entered");
        Ok(())
    })?;
    ensure!(context::metadata().is_empty(), "metadata scope not restored");
    Ok(())
}

async fn check_usage_extraction() -> Result<()> {
    let cases = [
        (
            json!({"usage": {"prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30}}),
            UsageRecord::new(10, 20, Some(30)),
        ),
        (
            json!({"usage": {"input_tokens": 15, "output_tokens": 25}}),
            UsageRecord::new(15, 25, None),
        ),
        (
            json!({"usage": {"billed_units": {"input_tokens": 5, "output_tokens": 10}}}),
            UsageRecord::new(5, 10, None),
        ),
    ];
    for (response, expected) in cases {
        let found = usage::normalize(&Value::Data(response), "unknown");
        ensure!(found == Some(expected), "expected {expected:?}, got {found:?}");
    }
    Ok(())
}

async fn check_error_resilience() -> Result<()> {
    let sink = Arc::new(MemorySink::new());
    let client = WrappedClient::wrap(mock_provider(), TapOptions::default(), sink.clone());
    match client.call("explode", Args::new()).await {
        Ok(_) => bail!("failing method returned a value"),
        Err(e) => ensure!(e.kind() == "Exception", "error kind changed to {}", e.kind()),
    }
    ensure!(
        sink.events().first().is_some_and(|e| e.error_occurred),
        "failure not recorded"
    );

    let refusing = WrappedClient::wrap(mock_provider(), TapOptions::default(), Arc::new(RefusingSink));
    refusing.call("generate", Args::new()).await?;
    Ok(())
}

/// Run every check, printing one line per check. Returns whether all passed.
pub async fn run() -> bool {
    println!("usagetap smoke test");

    let checks: [(&str, Result<()>); 5] = [
        ("method wrapping", check_wrapping().await),
        ("provider detection", check_provider_detection().await),
        ("context scopes", check_context_scopes().await),
        ("usage extraction", check_usage_extraction().await),
        ("error resilience", check_error_resilience().await),
    ];

    let total = checks.len();
    let mut passed = 0;
    for (i, (name, result)) in checks.into_iter().enumerate() {
        match result {
            Ok(()) => {
                passed += 1;
                println!("[{}/{}] {} ... ok", i + 1, total, name);
            }
            Err(e) => println!("[{}/{}] {} ... FAILED: {:#}", i + 1, total, name, e),
        }
    }

    info!("Smoke test finished: {}/{} passed", passed, total);
    println!("{passed}/{total} checks passed");
    passed == total
}
