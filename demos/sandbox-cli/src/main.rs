//! Command-line driver for a remote sandbox.
//!
//! Run with: cargo run -p sandbox-cli -- <config.json> <command> [args...]
//!
//! Commands:
//!   code <source>                      evaluate code in the sandbox
//!   call <module> <function> [args...] call an exported function
//!   exec <shell command>               run a shell command in the sandbox
//!   upload <local> <remote>            copy a file to the host
//!   download <remote> <local>          copy a file from the host

use std::{sync::Arc, time::Duration};

use anyhow::{Context, bail};
use futures::StreamExt;
use remote_sandbox_core::LogStore;
use remote_sandbox_session::{SandboxClient, SandboxConfig};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long buffered log lines get to print after the session closes.
const LOG_DRAIN: Duration = Duration::from_secs(2);

const USAGE: &str = "usage: sandbox-cli <config.json> <code|call|exec|upload|download> [args...]";

/// Arguments that are not valid JSON are passed as strings.
fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn print_value(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn dispatch(client: &SandboxClient, command: &str, rest: &[String]) -> anyhow::Result<()> {
    match (command, rest) {
        ("code", [source]) => print_value(&client.run_code(source).await?),
        ("call", [module, function, args @ ..]) => {
            let args = args.iter().map(|a| parse_arg(a)).collect();
            print_value(&client.call_function(module, function, args).await?)
        }
        ("exec", words) if !words.is_empty() => {
            let output = client.run_command(&words.join(" ")).await?;
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            Ok(())
        }
        ("upload", [local, remote]) => {
            client.upload_file(local, remote).await?;
            tracing::info!("Uploaded {local} to {remote}");
            Ok(())
        }
        ("download", [remote, local]) => {
            client.download_file(remote, local).await?;
            tracing::info!("Downloaded {remote} to {local}");
            Ok(())
        }
        _ => bail!(USAGE),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [config_path, command, rest @ ..] = args.as_slice() else {
        bail!(USAGE);
    };

    let config = SandboxConfig::from_file(config_path)
        .with_context(|| format!("Failed to load {config_path}"))?;
    let client = SandboxClient::ssh(config);

    let logs = Arc::new(LogStore::new());
    client.set_log_sink(logs.clone());
    let mut stream = logs.history_plus_stream();
    let mut printer = tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            eprintln!("[remote {}] {}", event.level, event.message());
        }
    });

    let result = match client.connect().await {
        Ok(()) => dispatch(&client, command, rest).await,
        Err(err) => Err(err.into()),
    };
    client.disconnect().await;

    // The stream ends once the last store handle is gone.
    drop(client);
    drop(logs);
    if tokio::time::timeout(LOG_DRAIN, &mut printer).await.is_err() {
        printer.abort();
    }

    result
}
