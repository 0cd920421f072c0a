use std::sync::Arc;

use anyhow::Context as _;
use ticketbridge_mcp::{JsonRpcResponse, McpDispatcher};
use tokio::io::{AsyncBufReadExt as _, AsyncWrite, AsyncWriteExt as _, BufReader};
use tracing::{info, warn};

use crate::app::parse_message;

/// One implicit session per process on stdio.
const STDIO_SESSION: &str = "stdio";

/// Serve newline-delimited JSON-RPC on stdin/stdout until EOF.
pub async fn run_stdio(dispatcher: Arc<McpDispatcher>) -> anyhow::Result<()> {
    info!("serving MCP on stdio");
    let stdin = BufReader::new(tokio::io::stdin());
    serve_lines(dispatcher, stdin, tokio::io::stdout()).await?;
    info!("stdin closed");
    Ok(())
}

pub async fn serve_lines<R, W>(
    dispatcher: Arc<McpDispatcher>,
    mut reader: R,
    mut writer: W,
) -> anyhow::Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await.context("read stdin")? == 0 {
            break;
        }
        // A bad line is answered like bad JSON; the stream stays open.
        let line = match std::str::from_utf8(&buf) {
            Ok(l) => l.trim(),
            Err(e) => {
                warn!(error = %e, "stdio line is not valid UTF-8");
                write_jsonrpc(&mut writer, &JsonRpcResponse::parse_error(e.to_string())).await?;
                continue;
            }
        };
        if line.is_empty() {
            continue;
        }
        let resp = match parse_message(line) {
            Ok(msg) => dispatcher.handle_message(Some(STDIO_SESSION), msg).await,
            Err(resp) => Some(resp),
        };
        if let Some(resp) = resp {
            write_jsonrpc(&mut writer, &resp).await?;
        }
    }
    dispatcher.end_session(STDIO_SESSION).await;
    Ok(())
}

async fn write_jsonrpc<W: AsyncWrite + Unpin>(
    writer: &mut W,
    resp: &JsonRpcResponse,
) -> anyhow::Result<()> {
    let out = serde_json::to_string(resp)?;
    writer.write_all(out.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
