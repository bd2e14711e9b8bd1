use anyhow::{Context, Result};
use bebop_core::control::{DroneConfig, LinkHealth};
use bebop_core::transport::{Streams, Transport};
use bebop_core::{discovery, Command};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

pub type LogFn = Box<dyn Fn(String) + Send + Sync + 'static>;

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Discover the device and bring the link up
async fn connect(mut cfg: DroneConfig, log: &LogFn) -> Result<(Transport, Streams)> {
    log(format!(
        "Connecting to {}:{} (d2c_port={})",
        cfg.device_addr, cfg.discovery_port, cfg.d2c_port
    ));

    let response = discovery::discover(&cfg)
        .await
        .context("discovery handshake failed")?;
    response.apply(&mut cfg);
    log(format!("Discovery complete: c2d_port={}", cfg.c2d_port));

    let (transport, streams) = Transport::start(&cfg)
        .await
        .context("failed to start transport")?;
    log(format!(
        "Link up: local={} device={}",
        transport.local_addr(),
        transport.remote_addr()
    ));
    Ok((transport, streams))
}

/// Whether the stop flag is set or its sender is gone
fn stop_signalled(
    changed: Result<(), watch::error::RecvError>,
    stop: &watch::Receiver<bool>,
) -> bool {
    changed.is_err() || *stop.borrow()
}

/// Stream video and log link health until stop is requested
pub async fn run_client(
    cfg: DroneConfig,
    video_out: Option<PathBuf>,
    mut stop: watch::Receiver<bool>,
    log: LogFn,
) -> Result<()> {
    let (transport, mut streams) = connect(cfg, &log).await?;

    let mut sink: Option<File> = match video_out {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .with_context(|| format!("failed to open video output: {}", path.display()))?;
            log(format!("Writing video to {}", path.display()));
            Some(file)
        }
        None => None,
    };

    transport
        .send_command(Command::VideoEnable(true))
        .await
        .context("failed to enable video streaming")?;

    let mut health_tick = tokio::time::interval(HEALTH_LOG_INTERVAL);
    health_tick.tick().await;

    loop {
        tokio::select! {
            frame = streams.video.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                if frame.key_frame {
                    log(format!("Key frame {} ({} bytes)", frame.frame_number, frame.data.len()));
                } else {
                    tracing::trace!(frame = frame.frame_number, len = frame.data.len(), "video frame");
                }
                if let Some(file) = sink.as_mut() {
                    file.write_all(&frame.data)
                        .await
                        .context("failed to write video frame")?;
                }
            }
            telemetry = streams.telemetry.recv() => {
                let Some(frame) = telemetry else {
                    break;
                };
                tracing::debug!(
                    channel = frame.channel_id,
                    seq = frame.seq,
                    len = frame.payload.len(),
                    "telemetry"
                );
            }
            _ = health_tick.tick() => {
                log(describe_health(&transport.health()));
            }
            changed = stop.changed() => {
                if stop_signalled(changed, &stop) {
                    log("Stop requested".to_string());
                    break;
                }
            }
        }
    }

    if let Some(mut file) = sink {
        file.flush().await.context("failed to flush video output")?;
    }

    let health = transport.health();
    transport.shutdown().await.context("transport shutdown failed")?;
    log(describe_health(&health));
    log("Disconnected".to_string());
    Ok(())
}

/// Take off, hover for `hover`, then land.
///
/// A stop request during the hover lands immediately.
pub async fn run_takeoff(
    cfg: DroneConfig,
    hover: Duration,
    mut stop: watch::Receiver<bool>,
    log: LogFn,
) -> Result<()> {
    let (transport, _streams) = connect(cfg, &log).await?;

    transport.send_command(Command::HullProtection(true)).await?;
    transport.send_command(Command::TakeOff).await?;
    log(format!("Take off, hovering for {hover:?}"));

    let sleep = tokio::time::sleep(hover);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => break,
            changed = stop.changed() => {
                if stop_signalled(changed, &stop) {
                    log("Stop requested, landing now".to_string());
                    break;
                }
            }
        }
    }

    transport.commands().stop();
    transport.send_command(Command::Landing).await?;
    log("Landing".to_string());

    transport.shutdown().await.context("transport shutdown failed")?;
    Ok(())
}

fn describe_health(health: &LinkHealth) -> String {
    format!(
        "Health: sent={} recv={} malformed={} write_failures={} read_timeouts={} \
         dropped(outbound={} telemetry={}) video(frames={} incomplete={} malformed={} \
         waiting_for_iframe={} backpressure={})",
        health.datagrams_sent,
        health.datagrams_received,
        health.malformed_frames,
        health.write_failures,
        health.read_timeouts,
        health.outbound_dropped,
        health.telemetry_dropped,
        health.video.frames_emitted,
        health.video.dropped_incomplete,
        health.video.dropped_malformed,
        health.video.dropped_waiting_for_iframe,
        health.video.dropped_backpressure,
    )
}
