//! Reference tool server speaking the default wire format over stdio.
//!
//! Reads one JSON request per line from stdin and answers on stdout.
//! Requests are handled concurrently, so slow calls answer out of order.
//! Logs go to stderr.
//!
//! Tools:
//!
//! - `echo`: answer with the arguments
//! - `sleep`: `{ms, value}`: wait, then answer with `value`
//! - `hang`: never answer
//! - `crash`: `{code}`: exit the process
//! - `stderr`: `{line}`: write a line to stderr
//! - `noise`: write a non-JSON line to stdout, then echo
//! - `split`: echo, written in two chunks
//! - `initialize`: handshake
//! - `tools/list`: the tool catalog
//!
//! Flags:
//!   --exit-immediately   exit with status 3 before reading anything
//!   --ignore-eof         keep running after stdin closes
//!
//! Usage:
//!   RUST_LOG=debug tw-reference-server

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use tw_client::codec::{Codec, Request};
use tw_client::error::RemoteError;
use tw_domain::config::WireFormat;

const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Pause between the two halves of a `split` answer.
const SPLIT_PAUSE: Duration = Duration::from_millis(20);

/// Chunks written back to back, with a pause and flush between them.
type Output = mpsc::UnboundedSender<Vec<Vec<u8>>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let flags: Vec<String> = std::env::args().skip(1).collect();
    let has_flag = |name: &str| flags.iter().any(|f| f == name);

    if has_flag("--exit-immediately") {
        tracing::warn!("exiting immediately as requested");
        std::process::exit(3);
    }
    let ignore_eof = has_flag("--ignore-eof");

    let codec = Arc::new(Codec::new(WireFormat::default(), MAX_FRAME_BYTES));
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(rx));

    tracing::info!(pid = std::process::id(), "reference tool server ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match codec.decode_request(line.as_bytes()) {
            Ok(request) => {
                tokio::spawn(handle(codec.clone(), tx.clone(), request));
            }
            Err(e) => tracing::warn!(error = %e, "ignoring undecodable request"),
        }
    }

    if ignore_eof {
        tracing::info!("stdin closed, ignoring");
        std::future::pending::<()>().await;
    }

    tracing::info!("stdin closed, exiting");
    Ok(())
}

async fn write_loop(mut rx: mpsc::UnboundedReceiver<Vec<Vec<u8>>>) {
    let mut stdout = tokio::io::stdout();
    while let Some(chunks) = rx.recv().await {
        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(SPLIT_PAUSE).await;
            }
            let written = match stdout.write_all(chunk).await {
                Ok(()) => stdout.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                tracing::error!(error = %e, "stdout write failed");
                return;
            }
        }
    }
}

async fn handle(codec: Arc<Codec>, out: Output, request: Request) {
    let Some(id) = request.id else {
        tracing::debug!(tool = %request.tool, "notification received");
        return;
    };
    tracing::debug!(id, tool = %request.tool, "request received");

    let args = request.arguments;
    let mut chunks = Vec::new();
    let outcome = match request.tool.as_str() {
        "echo" => Ok(args),
        "sleep" => {
            let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(args.get("value").cloned().unwrap_or(Value::Null))
        }
        "hang" => {
            std::future::pending::<()>().await;
            return;
        }
        "crash" => {
            let code = args.get("code").and_then(Value::as_i64).unwrap_or(1) as i32;
            tracing::error!(code, "crashing on request");
            std::process::exit(code);
        }
        "stderr" => {
            let line = args.get("line").and_then(Value::as_str).unwrap_or_default();
            eprintln!("{line}");
            Ok(json!({ "written": true }))
        }
        "noise" => {
            chunks.push(b"this line is not a protocol record\n".to_vec());
            Ok(args)
        }
        "split" => Ok(args),
        "initialize" => Ok(json!({
            "server": "tw-reference-server",
            "version": env!("CARGO_PKG_VERSION"),
        })),
        "tools/list" => Ok(json!({
            "tools": ["echo", "sleep", "hang", "crash", "stderr", "noise", "split"],
        })),
        _ => Err(RemoteError {
            kind: "NotFound".into(),
            message: "no such tool".into(),
            data: None,
        }),
    };

    let frame = match codec.encode_response(id, &outcome) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!(id, error = %e, "failed to encode response");
            return;
        }
    };
    if request.tool == "split" {
        let (head, tail) = frame.split_at(frame.len() / 2);
        chunks.push(head.to_vec());
        chunks.push(tail.to_vec());
    } else {
        chunks.push(frame);
    }
    let _ = out.send(chunks);
}
