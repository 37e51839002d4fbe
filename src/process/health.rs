//! Health check functionality for service processes.

use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

use crate::error::Result;

const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Services answer either `{"success": true}` or `{"status": "healthy"}`;
/// other fields, whatever their type, are ignored.
pub(super) fn is_healthy(body: &Value) -> bool {
    body.get("success") == Some(&Value::Bool(true))
        || body.get("status").and_then(Value::as_str) == Some("healthy")
}

/// HTTP client used for readiness and self-identification probes.
pub fn health_client() -> Result<Client> {
    Ok(Client::builder()
        .timeout(HEALTH_REQUEST_TIMEOUT)
        .no_proxy()
        .build()?)
}

/// Check the health endpoint of a service listening on `port`.
pub async fn check_health(client: &Client, port: u16, path: &str) -> bool {
    let url = format!("http://127.0.0.1:{}{}", port, path);

    match fetch_health(client, &url).await {
        Ok(healthy) => healthy,
        Err(e) => {
            log::debug!("Health probe {} failed: {}", url, e);
            false
        }
    }
}

async fn fetch_health(client: &Client, url: &str) -> Result<bool> {
    let resp = client.get(url).send().await?;
    if !resp.status().is_success() {
        return Ok(false);
    }
    let body = resp.bytes().await?;
    let value: Value = serde_json::from_slice(&body)?;
    Ok(is_healthy(&value))
}

/// Minimal HTTP responder for health tests.
#[cfg(test)]
pub(crate) mod testing {
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Serve `body` with `status` on every request to `127.0.0.1:<port>`.
    pub(crate) async fn serve(port: u16, status: u16, body: &'static str) -> JoinHandle<()> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::testing::serve;
    use super::*;

    fn healthy(body: &str) -> bool {
        is_healthy(&serde_json::from_str(body).unwrap())
    }

    #[test]
    fn accepts_both_payload_shapes() {
        assert!(healthy(r#"{"success": true}"#));
        assert!(healthy(r#"{"status": "healthy", "uptime": 12}"#));
    }

    #[test]
    fn unrelated_field_types_do_not_matter() {
        assert!(healthy(r#"{"success": true, "status": 200}"#));
        assert!(healthy(r#"{"success": "yes", "status": "healthy"}"#));
        assert!(healthy(r#"{"status": "healthy", "success": null}"#));
    }

    #[test]
    fn rejects_other_payloads() {
        assert!(!healthy(r#"{"success": false}"#));
        assert!(!healthy(r#"{"success": "true"}"#));
        assert!(!healthy(r#"{"status": "ok"}"#));
        assert!(!healthy(r#"[{"success": true}]"#));
        assert!(!healthy("{}"));
    }

    #[tokio::test]
    async fn healthy_live_endpoint() {
        let port = portpicker::pick_unused_port().unwrap();
        let server = serve(port, 200, r#"{"status":"healthy"}"#).await;
        let client = health_client().unwrap();

        assert!(check_health(&client, port, "/health").await);
        server.abort();
    }

    #[tokio::test]
    async fn live_endpoint_with_mixed_field_types() {
        let port = portpicker::pick_unused_port().unwrap();
        let server = serve(port, 200, r#"{"success":true,"status":200}"#).await;
        let client = health_client().unwrap();

        assert!(check_health(&client, port, "/api/health").await);
        server.abort();
    }

    #[tokio::test]
    async fn non_success_status_is_unhealthy() {
        let port = portpicker::pick_unused_port().unwrap();
        let server = serve(port, 503, r#"{"success":true}"#).await;
        let client = health_client().unwrap();

        assert!(!check_health(&client, port, "/api/health").await);
        server.abort();
    }

    #[tokio::test]
    async fn foreign_payload_is_unhealthy() {
        let port = portpicker::pick_unused_port().unwrap();
        let server = serve(port, 200, "<html>hello</html>").await;
        let client = health_client().unwrap();

        assert!(!check_health(&client, port, "/health").await);
        server.abort();
    }

    #[tokio::test]
    async fn closed_port_is_unhealthy() {
        let port = portpicker::pick_unused_port().unwrap();
        let client = health_client().unwrap();
        assert!(!check_health(&client, port, "/health").await);
    }
}
