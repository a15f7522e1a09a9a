//! HTTP front door: plain responses and the WebSocket upgrade.
//!
//! The request head is inspected with `peek` so that the bytes are still in
//! the socket when tungstenite performs the actual handshake.

use super::WsConnection;
use crate::error::{ConnectionError, GameError};
use crate::game::{GridSize, RoomId};
use std::io::{self, ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Largest request head accepted before the upgrade.
pub const MAX_HEAD_BYTES: usize = 8 * 1024;

pub const WELCOME_BODY: &str = "Welcome to Game Server!";

/// Path that accepts WebSocket upgrades.
pub const WEBSOCKET_PATH: &str = "/websocket";

/// Room parameters carried by the upgrade URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub room: RoomId,
    pub players: Option<usize>,
    pub grid: Option<GridSize>,
}

impl UpgradeRequest {
    /// Parses `room=<id>&players=<n>&grid=s|l`. Unknown keys are ignored.
    pub fn from_query(query: &str) -> Result<Self, String> {
        let mut room = None;
        let mut players = None;
        let mut grid = None;

        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "room" => {
                    room = Some(RoomId::parse(value).map_err(|e: GameError| e.to_string())?);
                }
                "players" => {
                    let count = value
                        .parse::<usize>()
                        .map_err(|_| format!("Invalid player count '{value}'"))?;
                    players = Some(count);
                }
                "grid" => {
                    let size = GridSize::parse(value)
                        .ok_or_else(|| format!("Invalid grid size '{value}'"))?;
                    grid = Some(size);
                }
                _ => {}
            }
        }

        let room = room.ok_or_else(|| "Missing room parameter".to_string())?;
        Ok(Self {
            room,
            players,
            grid,
        })
    }
}

/// What happened to an accepted TCP stream.
pub enum UpgradeOutcome {
    /// The stream is now a WebSocket bound for `request.room`.
    Upgraded {
        connection: WsConnection,
        request: UpgradeRequest,
    },
    /// A plain HTTP response was written and the stream is done.
    Answered { status: u16, path: String },
}

#[derive(Debug, PartialEq, Eq)]
struct RequestHead {
    len: usize,
    method: String,
    path: String,
    query: String,
    websocket: bool,
}

/// Serves one freshly accepted stream, blocking for at most `timeout` while
/// the request head arrives.
pub fn accept_client(mut stream: TcpStream, timeout: Duration) -> Result<UpgradeOutcome, ConnectionError> {
    stream.set_read_timeout(Some(timeout))?;

    let head = match read_head(&stream, timeout)? {
        Some(head) => head,
        None => {
            respond(&mut stream, 431, "Request header too large")?;
            return Ok(UpgradeOutcome::Answered {
                status: 431,
                path: String::new(),
            });
        }
    };
    debug!(method = %head.method, path = %head.path, websocket = head.websocket, "HTTP request");

    if head.method != "GET" {
        return answer(stream, &head, 405, "Method not allowed");
    }

    match head.path.as_str() {
        "/" => answer(stream, &head, 200, WELCOME_BODY),
        WEBSOCKET_PATH => {
            let request = match UpgradeRequest::from_query(&head.query) {
                Ok(request) if head.websocket => request,
                Ok(_) => return answer(stream, &head, 400, "Expected a WebSocket upgrade"),
                Err(reason) => return answer(stream, &head, 400, &reason),
            };

            let socket = tungstenite::accept(stream)
                .map_err(|e| ConnectionError::Handshake(e.to_string()))?;
            let connection = WsConnection::new(socket)?;
            Ok(UpgradeOutcome::Upgraded {
                connection,
                request,
            })
        }
        _ => answer(stream, &head, 404, "Not found"),
    }
}

/// Writes a minimal `text/plain` response and closes the write side.
pub fn respond(stream: &mut TcpStream, status: u16, body: &str) -> Result<(), ConnectionError> {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason_phrase(status),
        body.len(),
        body
    );
    stream.write_all(response.as_bytes())?;
    stream.flush()?;
    let _ = stream.shutdown(std::net::Shutdown::Write);
    Ok(())
}

fn answer(
    mut stream: TcpStream,
    head: &RequestHead,
    status: u16,
    body: &str,
) -> Result<UpgradeOutcome, ConnectionError> {
    if status >= 400 {
        warn!(status, path = %head.path, reason = body, "Rejected HTTP request");
    }
    // Unread request bytes would turn the close into a reset.
    io::copy(&mut (&stream).take(head.len as u64), &mut io::sink())?;
    respond(&mut stream, status, body)?;
    Ok(UpgradeOutcome::Answered {
        status,
        path: head.path.clone(),
    })
}

/// Peeks until the end of the request head. `None` means the head exceeded
/// [`MAX_HEAD_BYTES`].
fn read_head(stream: &TcpStream, timeout: Duration) -> Result<Option<RequestHead>, ConnectionError> {
    let deadline = Instant::now() + timeout;
    let mut buf = vec![0u8; MAX_HEAD_BYTES];
    let mut seen = 0;

    loop {
        let n = match stream.peek(&mut buf) {
            Ok(0) => return Err(ConnectionError::Closed),
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(ConnectionError::Handshake("Timed out waiting for request".to_string()));
            }
            Err(e) => return Err(ConnectionError::Io(e)),
        };

        if let Some(end) = find_head_end(&buf[..n]) {
            let text = String::from_utf8_lossy(&buf[..end]);
            return parse_head(&text)
                .map(|head| Some(RequestHead { len: end, ..head }))
                .ok_or_else(|| ConnectionError::Handshake("Malformed request line".to_string()));
        }
        if n == buf.len() {
            return Ok(None);
        }
        if Instant::now() >= deadline {
            return Err(ConnectionError::Handshake("Timed out waiting for request".to_string()));
        }
        if n == seen {
            std::thread::sleep(Duration::from_millis(5));
        }
        seen = n;
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

fn parse_head(text: &str) -> Option<RequestHead> {
    let mut lines = text.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let target = request_line.next()?;
    request_line.next()?;

    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    let websocket = lines.any(|line| {
        line.split_once(':').map_or(false, |(name, value)| {
            name.trim().eq_ignore_ascii_case("upgrade") && value.trim().eq_ignore_ascii_case("websocket")
        })
    });

    Some(RequestHead {
        len: text.len(),
        method,
        path: path.to_string(),
        query: query.to_string(),
        websocket,
    })
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        431 => "Request Header Fields Too Large",
        503 => "Service Unavailable",
        _ => "Error",
    }
}
