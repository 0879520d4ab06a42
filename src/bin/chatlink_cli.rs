//! chatlink-cli: inspect the model catalog, send a chat request, show key usage.
//!
//! Usage:
//!   chatlink-cli models [--refresh]
//!   chatlink-cli chat <model> <prompt> [--stream]
//!   chatlink-cli key

use anyhow::Context;
use chatlink::{ChatClient, ChatClientBuilder, ChatMessage, ChatRequest, Error, ErrorKind, StreamFragment};
use futures::StreamExt;
use std::io::Write;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let filter = EnvFilter::try_from_env("CHATLINK_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let result = match args[1].as_str() {
        "models" => cmd_models(&args[2..]).await,
        "chat" => cmd_chat(&args[2..]).await,
        "key" => cmd_key().await,
        "version" | "--version" | "-V" => {
            println!("chatlink-cli {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        if let Some(hint) = e.downcast_ref::<Error>().and_then(guidance) {
            eprintln!("hint: {hint}");
        }
        std::process::exit(2);
    }
}

fn print_usage() {
    println!(
        r#"chatlink-cli: resilient chat client for LLM aggregation APIs

USAGE:
    chatlink-cli <COMMAND> [OPTIONS]

COMMANDS:
    models [--refresh]              List models, cheapest first
    chat <model> <prompt> [--stream]
                                    Send one user message and print the reply
    key                             Show usage and limits of the API key
    version                         Show version information
    help                            Show this help message

ENVIRONMENT:
    OPENROUTER_API_KEY              API key (the OS keyring is tried first)
    CHATLINK_BASE_URL               API base URL
    CHATLINK_LOG                    Log filter (default: warn)"#
    );
}

/// What the operator should do about an error, when there is something to do.
fn guidance(err: &Error) -> Option<String> {
    match err.kind()? {
        ErrorKind::Authentication => {
            Some("set OPENROUTER_API_KEY or store a new key in the OS keyring".to_string())
        }
        ErrorKind::RateLimit { retry_after } => Some(format!(
            "rate limited, try again in {}s",
            retry_after.as_secs().max(1)
        )),
        ErrorKind::ModelUnavailable => {
            Some("run `chatlink-cli models` to pick an available model".to_string())
        }
        _ => None,
    }
}

async fn client() -> anyhow::Result<ChatClient> {
    ChatClientBuilder::new()
        .build()
        .await
        .context("failed to initialize client")
}

async fn cmd_models(args: &[String]) -> anyhow::Result<()> {
    let refresh = args.iter().any(|a| a == "--refresh");
    let client = client().await?;
    let mut models = client.models(refresh).await?;
    models.sort_by(|a, b| a.unit_cost().total_cmp(&b.unit_cost()).then_with(|| a.id.cmp(&b.id)));

    println!("{:<48} {:>9} {:>14}  CAPABILITIES", "MODEL", "CONTEXT", "$/1M TOKENS");
    for m in &models {
        let cost = if m.pricing.is_known() {
            format!("{:.4}", m.unit_cost() * 1_000_000.0)
        } else {
            "-".to_string()
        };
        let caps: Vec<String> = m.capabilities.iter().map(|c| c.to_string()).collect();
        println!("{:<48} {:>9} {:>14}  {}", m.id, m.context_length, cost, caps.join(","));
    }
    println!("\n{} models", models.len());
    Ok(())
}

async fn cmd_chat(args: &[String]) -> anyhow::Result<()> {
    let stream = args.iter().any(|a| a == "--stream");
    let positional: Vec<&String> = args.iter().filter(|a| !a.starts_with("--")).collect();
    let (model, prompt) = match positional.as_slice() {
        [model, prompt, ..] => (model.as_str(), prompt.as_str()),
        _ => anyhow::bail!("usage: chatlink-cli chat <model> <prompt> [--stream]"),
    };

    let client = client().await?;
    let request = ChatRequest::new(model, vec![ChatMessage::user(prompt)]);

    if !stream {
        let response = client.chat(&request).await?;
        println!("{}", response.content());
        eprintln!(
            "[{} tokens: {} prompt, {} completion]",
            response.usage.total_tokens, response.usage.prompt_tokens, response.usage.completion_tokens
        );
        return Ok(());
    }

    let mut fragments = client.chat_stream(&request).await?;
    let mut stdout = std::io::stdout();
    while let Some(fragment) = fragments.next().await {
        match fragment? {
            StreamFragment::Delta { content, .. } => {
                write!(stdout, "{content}")?;
                stdout.flush()?;
            }
            StreamFragment::Done { usage } => {
                writeln!(stdout)?;
                if let Some(u) = usage {
                    eprintln!("[{} tokens]", u.total_tokens);
                }
            }
        }
    }
    Ok(())
}

async fn cmd_key() -> anyhow::Result<()> {
    let client = client().await?;
    let info = client.key_info().await?;
    println!("label:      {}", info.label);
    println!("usage:      {:.4}", info.usage);
    match (info.limit, info.remaining()) {
        (Some(limit), Some(remaining)) => {
            println!("limit:      {limit:.4}");
            println!("remaining:  {remaining:.4}");
        }
        _ => println!("limit:      unlimited"),
    }
    println!("free tier:  {}", info.is_free_tier);
    if let Some(rl) = info.rate_limit {
        println!("rate limit: {} requests / {}", rl.requests, rl.interval);
    }
    Ok(())
}
