//! One-shot authorizing connection.
//!
//! When an inbound stream offers a key and there is no outbound stream to
//! relay the verification over, the gateway dials the remote's
//! authoritative server itself, asks it to verify the key, and pushes the
//! verdict back to the waiting receiving connection. The connection
//! carries only dialback traffic and closes as soon as the answer lands.

use crate::config::GatewayConfig;
use crate::connection::{event_from_frame, read_chunk, ByteSource, StreamEvent};
use crate::context::SessionContext;
use fedgate_core::xml::StanzaBuffer;
use fedgate_core::{wire, FedError, FedResult};
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Dial the authoritative server, verify one key, report the verdict over
/// the receiving connection registered under `origin_pair` (the stream the
/// offer arrived on, not necessarily the offered domain pair).
pub async fn run_authorizing(
    cfg: GatewayConfig,
    ctx: Arc<SessionContext>,
    origin_pair: String,
    local: String,
    remote: String,
    stream_id: String,
    key: String,
) -> FedResult<()> {
    let addr = (cfg.connect_host.as_str(), cfg.connect_port);
    debug!(%remote, "dialing authoritative server for verification");
    let tcp = TcpStream::connect(addr).await?;
    let mut source = ByteSource::Plain(tcp);
    let mut buffer = StanzaBuffer::new();
    let mut read_buf = vec![0u8; 4096];

    source
        .write_all(wire::stream_open(&local, &remote, None).as_bytes())
        .await?;

    let mut sent_request = false;
    loop {
        let n = read_chunk(&mut source, cfg.socket_timeout, &mut read_buf).await?;
        if n == 0 {
            return Err(FedError::Protocol(
                "authoritative server closed the connection".into(),
            ));
        }
        buffer.feed(&read_buf[..n]);

        while let Some(frame) = buffer.next_frame()? {
            match event_from_frame(frame)? {
                StreamEvent::Open(_) if !sent_request => {
                    sent_request = true;
                    let req = wire::dialback_verify_request(&local, &remote, &stream_id, &key);
                    source.write_all(req.as_bytes()).await?;
                }
                StreamEvent::Element(e)
                    if e.local_name() == "verify" && e.attr("type").is_some() =>
                {
                    let valid = e.attr("type") == Some("valid");
                    let answer = wire::dialback_result_answer(&local, &remote, valid);
                    if let Some(handle) = ctx.receiving_for(&origin_pair) {
                        let _ = handle.writer.send(answer).await;
                    }
                    if valid {
                        info!(%remote, "domain verified via authorizing connection");
                        ctx.mark_verified(&remote);
                    }
                    let _ = source.write_all(wire::stream_close().as_bytes()).await;
                    source.shutdown().await;
                    return Ok(());
                }
                StreamEvent::Close => {
                    return Err(FedError::Protocol(
                        "stream closed before verify answer".into(),
                    ));
                }
                // Features and anything else on this throwaway stream.
                other => {
                    debug!(?other, "ignoring event on authorizing stream");
                }
            }
        }
    }
}
