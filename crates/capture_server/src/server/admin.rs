//! Read-only JSON introspection over plain HTTP.
//!
//! * `GET /debug/stats` - server counters
//! * `GET /debug/rooms` - one summary per live room

use crate::server::ServerContext;
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error};

const MAX_REQUEST_BYTES: usize = 8 * 1024;

pub async fn serve(listener: TcpListener, ctx: Arc<ServerContext>) {
    let mut shutdown = ctx.subscribe_shutdown();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(async move {
                        if let Err(e) = handle(stream, &ctx).await {
                            debug!("Admin request from {} failed: {}", addr, e);
                        }
                    });
                }
                Err(e) => error!("Admin accept failed: {}", e),
            },
            _ = shutdown.recv() => break,
        }
    }
}

async fn handle(mut stream: TcpStream, ctx: &ServerContext) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_REQUEST_BYTES {
            return write_response(&mut stream, 431, "{\"error\":\"request too large\"}").await;
        }
    }

    let head = String::from_utf8_lossy(&buf);
    let target = head.split_whitespace().nth(1).unwrap_or("/");
    let path = target.split('?').next().unwrap_or(target);

    let (status, body) = match path {
        "/debug/stats" => (200, to_json(&ctx.stats_snapshot())),
        "/debug/rooms" => (200, to_json(&ctx.rooms.summaries())),
        _ => (404, "{\"error\":\"not found\"}".to_string()),
    };
    write_response(&mut stream, status, &body).await
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
}

async fn write_response(stream: &mut TcpStream, status: u16, body: &str) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        _ => "Request Header Fields Too Large",
    };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}
