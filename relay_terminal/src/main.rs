use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use relay_core::relay::markers::Utf8Decoder;
use serde_json::{Value, json};
use std::io::Write;
use tokio::io::AsyncBufReadExt;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(author, version, about = "Chat with a running relay from the terminal", long_about = None)]
struct Args {
    /// Host the relay listens on
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port the relay listens on
    #[arg(short, long, default_value_t = 3000)]
    port: u16,

    /// Model key forwarded as options.model
    #[arg(short, long)]
    model: Option<String>,

    /// Sampling temperature forwarded as options.temperature
    #[arg(short, long)]
    temperature: Option<f64>,

    /// Optional system prompt placed before the first user turn
    #[arg(short, long)]
    system: Option<String>,
}

type HttpClient = Client<HttpConnector, Full<Bytes>>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let endpoint = format!("http://{}:{}/generate", args.host, args.port);
    let client: HttpClient = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

    let mut chat: Vec<Value> = Vec::new();
    if let Some(system) = &args.system {
        chat.push(json!({"role": "system", "content": system}));
    }
    let mut options = serde_json::Map::new();
    if let Some(model) = &args.model {
        options.insert("model".to_string(), json!(model));
    }
    if let Some(t) = args.temperature {
        options.insert("temperature".to_string(), json!(t));
    }

    println!("Talking to {} (Ctrl+C to quit)", endpoint);
    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut line = String::new();

    loop {
        print!("> ");
        let _ = std::io::stdout().flush();
        line.clear();

        let read = tokio::select! {
            res = stdin.read_line(&mut line) => res.context("Failed to read stdin")?,
            _ = signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        };
        if read == 0 {
            break; // EOF
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        chat.push(json!({"role": "user", "content": input}));
        let request = json!({"chat": chat, "options": options});

        let reply = tokio::select! {
            res = send(&client, &endpoint, &request) => res,
            _ = signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        };
        match reply {
            Ok(text) => chat.push(json!({"role": "assistant", "content": text})),
            Err(e) => {
                eprintln!("\n{:#}", e);
                // keep the history consistent: the unanswered turn is dropped
                chat.pop();
            }
        }
    }

    Ok(())
}

/// Posts one request and prints the reply as it streams in.
async fn send(client: &HttpClient, endpoint: &str, request: &Value) -> Result<String> {
    let req = Request::builder()
        .method(Method::POST)
        .uri(endpoint)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(request.to_string())))?;
    let res = client
        .request(req)
        .await
        .context("Failed to connect to relay")?;

    let status = res.status();
    let mut body = res.into_body();
    if status != StatusCode::OK {
        let bytes = body.collect().await?.to_bytes();
        anyhow::bail!("relay answered {}: {}", status, error_message(&bytes));
    }

    let mut reply = String::new();
    let mut decoder = Utf8Decoder::default();
    while let Some(frame) = body.frame().await {
        let frame = frame.context("Reply stream ended abnormally")?;
        let Ok(data) = frame.into_data() else {
            continue;
        };
        let text = decoder.decode(&data);
        print!("{}", text);
        let _ = std::io::stdout().flush();
        reply.push_str(&text);
    }
    if let Some(tail) = decoder.finish() {
        print!("{}", tail);
        reply.push_str(&tail);
    }
    println!();
    Ok(reply)
}

/// The relay reports failures as `{"error": "..."}`; anything else is shown raw.
fn error_message(body: &[u8]) -> String {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_prefers_json_error_field() {
        assert_eq!(
            error_message(br#"{"error":"status: 503, error: busy"}"#),
            "status: 503, error: busy"
        );
        assert_eq!(error_message(b"Not Found"), "Not Found");
    }

    #[test]
    fn args_parse_short_flags() {
        let args = Args::parse_from(["relay_terminal", "-p", "8080", "-m", "gpt-4o", "-t", "0"]);
        assert_eq!(args.port, 8080);
        assert_eq!(args.model.as_deref(), Some("gpt-4o"));
        assert_eq!(args.temperature, Some(0.0));
        assert_eq!(args.host, "127.0.0.1");
    }
}
