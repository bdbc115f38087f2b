//! TCP front end: reads RESP2 command arrays off a socket and feeds them to
//! [`dispatch_command`]. Kept deliberately thin (spec.md §1 Non-goals: this
//! core is a library-first engine, not a hardened network service) — no TLS,
//! no auth, no per-connection rate limiting. One task per connection.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::dispatch::dispatch_command;
use crate::metrics::Metrics;
use crate::protocol::{resp_error, RespError, RespParser};
use crate::server::Server;

const READ_CHUNK: usize = 8 * 1024;

pub async fn handle_connection(mut socket: TcpStream, server: Arc<Server>, metrics: Arc<Metrics>) {
    let peer = socket.peer_addr().ok();
    let mut parser = RespParser::new();
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        let command = loop {
            match parser.parse(&mut buf) {
                Ok(Some(args)) => break Some(args),
                Ok(None) => {}
                Err(RespError::Protocol) => {
                    let _ = socket.write_all(&resp_error("protocol error")).await;
                    return;
                }
            }
            let mut chunk = [0u8; READ_CHUNK];
            match socket.read(&mut chunk).await {
                Ok(0) => break None,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) => {
                    warn!(?peer, error = %e, "connection read error");
                    return;
                }
            }
        };

        let Some(args) = command else {
            debug!(?peer, "connection closed");
            return;
        };
        if args.is_empty() {
            continue;
        }

        metrics.record_request_start();
        let started = std::time::Instant::now();
        let response = dispatch_command(&args, &server);
        let is_error = response.first() == Some(&b'-');
        if is_error {
            metrics.record_error();
        }
        metrics.record_request_end(started.elapsed());

        if socket.write_all(&response).await.is_err() {
            return;
        }
    }
}
