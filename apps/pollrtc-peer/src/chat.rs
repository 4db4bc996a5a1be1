use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use pollrtc::{
    CoordinatorState, HttpSignalingTransport, HttpTransportConfig, Payload, PeerConfig,
    SignalingCoordinator, SignalingEvent, SignalingEventReceiver, WebRtcPeer,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use crate::cli::ConnectArgs;

/// Joins the session described by `args` and bridges stdin/stdout onto the
/// data channel until the channel closes, stdin ends or Ctrl-C.
pub async fn run(args: ConnectArgs) -> Result<()> {
    let config = args.signaling_config();
    config.validate()?;

    let mut http = HttpTransportConfig::new(config.base_url.clone()).lenient(args.lenient);
    if let Some(timeout) = args.request_timeout() {
        http = http.with_request_timeout(timeout);
    }
    let transport = HttpSignalingTransport::new(http)?;

    let peer_config = if args.no_stun {
        PeerConfig::localhost()
    } else {
        PeerConfig::from_env()
    };
    let peer = WebRtcPeer::new(peer_config)
        .await
        .context("creating peer connection")?;

    let (coordinator, mut events) =
        SignalingCoordinator::new(config, Arc::new(peer), Arc::new(transport))?;
    join(&coordinator).await?;

    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    drive(&coordinator, &mut events, stdin, &mut stdout, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

/// Connects `coordinator`. On failure the coordinator is closed, releasing
/// the peer connection, before the error is returned.
pub async fn join(coordinator: &SignalingCoordinator) -> Result<()> {
    if let Err(err) = coordinator.connect().await {
        coordinator.close().await;
        return Err(anyhow::Error::new(err).context("joining rendezvous session"));
    }
    info!(
        role = %coordinator.role(),
        session = %coordinator.session_id(),
        "joined session"
    );
    Ok(())
}

/// Pumps coordinator events to `output` and `input` lines into the data
/// channel. Events win over input so an `Open` is reported before the
/// first line is sent. Always closes the coordinator on the way out.
pub async fn drive<R, W, S>(
    coordinator: &SignalingCoordinator,
    events: &mut SignalingEventReceiver,
    input: R,
    output: &mut W,
    shutdown: S,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    S: Future<Output = ()>,
{
    let result = pump(coordinator, events, input, output, shutdown).await;
    coordinator.close().await;
    output.flush().await?;
    result
}

async fn pump<R, W, S>(
    coordinator: &SignalingCoordinator,
    events: &mut SignalingEventReceiver,
    input: R,
    output: &mut W,
    shutdown: S,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut lines = input.lines();
    loop {
        tokio::select! {
            biased;
            event = events.recv() => {
                let Some(event) = event else {
                    return Ok(());
                };
                match event {
                    SignalingEvent::Open => {
                        let line = format!("* connected as {}\n", coordinator.role());
                        output.write_all(line.as_bytes()).await?;
                    }
                    SignalingEvent::Message(payload) => {
                        output.write_all(render(&payload).as_bytes()).await?;
                    }
                    SignalingEvent::Close => {
                        output.write_all(b"* channel closed\n").await?;
                        return Ok(());
                    }
                    SignalingEvent::Error(err) => {
                        output.write_all(format!("! {err}\n").as_bytes()).await?;
                        if coordinator.state() == CoordinatorState::Failed {
                            return Ok(());
                        }
                    }
                    SignalingEvent::StateChanged(state) => {
                        debug!(?state, "coordinator state");
                    }
                }
                output.flush().await?;
            }
            _ = &mut shutdown => {
                debug!("shutdown requested");
                return Ok(());
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("input closed");
                    return Ok(());
                };
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                if !coordinator.send(line).await {
                    output.write_all(b"! channel not open, message dropped\n").await?;
                    output.flush().await?;
                }
            }
        }
    }
}

fn render(payload: &Payload) -> String {
    match payload {
        Payload::Text(text) => format!("< {text}\n"),
        Payload::Binary(bytes) => format!("< [{} bytes]\n", bytes.len()),
    }
}
