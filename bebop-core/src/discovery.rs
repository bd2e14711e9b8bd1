//! Discovery handshake.
//!
//! Before the UDP link starts, the controller opens a short-lived TCP
//! connection to the device, announces the local ports it will listen on as
//! a single JSON document, and reads back the device's JSON answer. The
//! device terminates its answer with a NUL byte.

use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::control::DroneConfig;

/// Upper bound on the size of the device's answer
const MAX_RESPONSE_SIZE: usize = 10240;

const CONTROLLER_TYPE: &str = "computer";

/// Discovery errors
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Discovery timed out after {0:?}")]
    Timeout(Duration),

    #[error("Device rejected connection with status {0}")]
    Rejected(i32),

    #[error("Response too large: {0} bytes")]
    ResponseTooLarge(usize),
}

/// Announcement sent by the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub controller_type: String,
    pub controller_name: String,
    pub d2c_port: u16,
    pub arstream2_client_stream_port: u16,
    pub arstream2_client_control_port: u16,
}

impl DiscoveryRequest {
    /// Build the announcement for `config`
    pub fn from_config(config: &DroneConfig) -> Self {
        Self {
            controller_type: CONTROLLER_TYPE.to_string(),
            controller_name: config.controller_name.clone(),
            d2c_port: config.d2c_port,
            arstream2_client_stream_port: config.stream_port,
            arstream2_client_control_port: config.stream_control_port,
        }
    }
}

/// Answer sent by the device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    /// Zero when the connection is accepted
    #[serde(default)]
    pub status: i32,
    /// Port the device wants commands on, if different from the default
    #[serde(default)]
    pub c2d_port: Option<u16>,
    #[serde(default)]
    pub c2d_update_port: Option<u16>,
    #[serde(default)]
    pub c2d_user_port: Option<u16>,
    #[serde(default)]
    pub arstream_fragment_size: Option<u32>,
    #[serde(default)]
    pub arstream_fragment_maximum_number: Option<u32>,
    #[serde(default)]
    pub arstream_max_ack_interval: Option<i32>,
}

impl DiscoveryResponse {
    /// Apply negotiated values to `config`
    pub fn apply(&self, config: &mut DroneConfig) {
        if let Some(port) = self.c2d_port {
            config.c2d_port = port;
        }
    }
}

/// Run the discovery handshake against the device in `config`.
///
/// The whole exchange is bounded by `config.connect_timeout`. Any failure is
/// fatal to connection establishment.
pub async fn discover(config: &DroneConfig) -> Result<DiscoveryResponse, DiscoveryError> {
    let addr = format!("{}:{}", config.device_addr, config.discovery_port);
    let request = DiscoveryRequest::from_config(config);

    let response = tokio::time::timeout(config.connect_timeout, handshake(&addr, &request))
        .await
        .map_err(|_| DiscoveryError::Timeout(config.connect_timeout))??;

    if response.status != 0 {
        return Err(DiscoveryError::Rejected(response.status));
    }

    tracing::info!(
        %addr,
        c2d_port = ?response.c2d_port,
        fragment_size = ?response.arstream_fragment_size,
        "discovery complete"
    );
    Ok(response)
}

async fn handshake(
    addr: &str,
    request: &DiscoveryRequest,
) -> Result<DiscoveryResponse, DiscoveryError> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(&serde_json::to_vec(request)?).await?;

    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Ok(response) = parse_response(&buf) {
            let _ = stream.shutdown().await;
            return Ok(response);
        }
        if buf.len() > MAX_RESPONSE_SIZE {
            return Err(DiscoveryError::ResponseTooLarge(buf.len()));
        }
    }

    // Peer closed: whatever arrived must be a complete answer
    Ok(parse_response(&buf)?)
}

/// Parse the device answer, ignoring NUL terminators and surrounding whitespace
pub fn parse_response(buf: &[u8]) -> Result<DiscoveryResponse, serde_json::Error> {
    let end = buf
        .iter()
        .rposition(|b| *b != 0 && !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    serde_json::from_slice(&buf[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn fake_device(answer: &'static [u8]) -> (u16, tokio::task::JoinHandle<DiscoveryRequest>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
        let port = listener.local_addr().expect("local addr").port();

        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.expect("accept failed");
            let mut buf = Vec::new();
            let mut chunk = [0u8; 512];
            let request = loop {
                let n = sock.read(&mut chunk).await.expect("read failed");
                buf.extend_from_slice(&chunk[..n]);
                if let Ok(req) = serde_json::from_slice::<DiscoveryRequest>(&buf) {
                    break req;
                }
                assert!(n > 0, "controller closed before sending a request");
            };
            sock.write_all(answer).await.expect("write failed");
            request
        });

        (port, handle)
    }

    fn config(port: u16) -> DroneConfig {
        DroneConfig {
            device_addr: "127.0.0.1".to_string(),
            discovery_port: port,
            d2c_port: 43999,
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_response_strips_nul() {
        let response = parse_response(b"{\"status\":0,\"c2d_port\":54321}\0\n")
            .expect("parse failed");
        assert_eq!(response.status, 0);
        assert_eq!(response.c2d_port, Some(54321));
    }

    #[test]
    fn test_apply_overrides_c2d_port() {
        let mut config = DroneConfig::default();
        let response = DiscoveryResponse {
            c2d_port: Some(60000),
            ..Default::default()
        };
        response.apply(&mut config);
        assert_eq!(config.c2d_port, 60000);

        DiscoveryResponse::default().apply(&mut config);
        assert_eq!(config.c2d_port, 60000);
    }

    #[tokio::test]
    async fn test_discover_announces_ports() {
        let (port, device) = fake_device(
            b"{\"status\":0,\"c2d_port\":54322,\"arstream_fragment_size\":65000}\0",
        )
        .await;

        let response = discover(&config(port)).await.expect("discover failed");
        assert_eq!(response.c2d_port, Some(54322));
        assert_eq!(response.arstream_fragment_size, Some(65000));

        let request = device.await.expect("device task panicked");
        assert_eq!(request.controller_type, "computer");
        assert_eq!(request.d2c_port, 43999);
        assert_eq!(request.arstream2_client_stream_port, 55004);
        assert_eq!(request.arstream2_client_control_port, 55005);
    }

    #[tokio::test]
    async fn test_discover_rejected() {
        let (port, _device) = fake_device(b"{\"status\":-1}\0").await;

        let result = discover(&config(port)).await;
        assert!(matches!(result, Err(DiscoveryError::Rejected(-1))));
    }

    #[tokio::test]
    async fn test_discover_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
        let port = listener.local_addr().expect("local addr").port();
        let _silent = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.expect("accept failed");
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(sock);
        });

        let config = DroneConfig {
            connect_timeout: Duration::from_millis(100),
            ..config(port)
        };
        let result = discover(&config).await;
        assert!(matches!(result, Err(DiscoveryError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_discover_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
        let port = listener.local_addr().expect("local addr").port();
        drop(listener);

        let result = discover(&config(port)).await;
        assert!(matches!(result, Err(DiscoveryError::Io(_))));
    }
}
