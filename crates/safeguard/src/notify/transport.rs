//! Notification transports.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use super::{AlertMessage, NotificationTransport};
use crate::config::{NotifyConfig, TransportKind};
use crate::contact::{ContactId, EmergencyContact};
use crate::error::{Error, Result};
use crate::session::SessionId;

/// Build the transport named in the configuration.
///
/// # Errors
///
/// Returns an error if the HTTP client cannot be built or no endpoint is set.
pub fn transport_from_config(config: &NotifyConfig) -> Result<Arc<dyn NotificationTransport>> {
    let transport: Arc<dyn NotificationTransport> = match config.transport {
        TransportKind::Log => Arc::new(LogTransport),
        TransportKind::Http => {
            let endpoint = config.endpoint.clone().ok_or_else(|| Error::ConfigValidation {
                message: "notify.endpoint is required for the http transport".to_string(),
            })?;
            Arc::new(HttpTransport::new(
                endpoint,
                Duration::from_millis(config.timeout_ms),
            )?)
        }
    };
    info!(transport = transport.name(), "Notification transport selected");
    Ok(transport)
}

/// Writes alerts to the log instead of sending them anywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTransport;

#[async_trait::async_trait]
impl NotificationTransport for LogTransport {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, contact: &EmergencyContact, message: &AlertMessage) -> Result<()> {
        info!(
            session = %message.session_id,
            contact = %contact.id,
            phone = %contact.phone_number,
            text = %message.text_for(contact),
            "SOS alert"
        );
        Ok(())
    }
}

/// JSON body posted to the messaging backend.
#[derive(Debug, Serialize)]
struct AlertPayload<'a> {
    session_id: SessionId,
    contact_id: ContactId,
    phone_number: &'a str,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    maps_url: Option<String>,
}

impl<'a> AlertPayload<'a> {
    fn new(contact: &'a EmergencyContact, message: &AlertMessage) -> Self {
        Self {
            session_id: message.session_id,
            contact_id: contact.id,
            phone_number: &contact.phone_number,
            text: message.text_for(contact),
            latitude: message.location.map(|l| l.latitude),
            longitude: message.location.map(|l| l.longitude),
            maps_url: message.location.map(|l| l.maps_url()),
        }
    }
}

/// Posts alerts to a messaging backend, one request per contact.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    /// Create a transport posting to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    /// The backend URL.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait::async_trait]
impl NotificationTransport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn send(&self, contact: &EmergencyContact, message: &AlertMessage) -> Result<()> {
        let payload = AlertPayload::new(contact, message);
        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::notification_failed(
                contact.id,
                format!("messaging backend returned {status}"),
            ));
        }
        debug!(contact = %contact.id, %status, "Alert accepted by messaging backend");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::NewContact;
    use crate::location::LocationSample;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    fn contact() -> EmergencyContact {
        EmergencyContact::from_draft(ContactId(3), &NewContact::new("Ana", "+34 600"))
    }

    /// Read one HTTP request, headers and body, and return the body.
    async fn read_request(socket: &mut TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return String::new();
            }
            data.extend_from_slice(&buf[..n]);
            let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let headers = String::from_utf8_lossy(&data[..end]).to_ascii_lowercase();
            let length = headers
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if data.len() >= end + 4 + length {
                return String::from_utf8_lossy(&data[end + 4..end + 4 + length]).to_string();
            }
        }
    }

    /// Serve a single request with `status_line`, returning the request body.
    async fn serve_once(status_line: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}/sos", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let body = read_request(&mut socket).await;
            let response =
                format!("HTTP/1.1 {status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            body
        });
        (endpoint, server)
    }

    #[test]
    fn test_payload_with_location() {
        let contact = contact();
        let message = AlertMessage::new(SessionId(1), "Bo", Some(LocationSample::now(1.0, 2.0)));

        let json = serde_json::to_value(AlertPayload::new(&contact, &message)).unwrap();
        assert_eq!(json["session_id"], 1);
        assert_eq!(json["contact_id"], 3);
        assert_eq!(json["phone_number"], "+34 600");
        assert_eq!(json["latitude"], 1.0);
        assert!(json["maps_url"].as_str().unwrap().contains("maps.google.com"));
    }

    #[test]
    fn test_payload_without_location_omits_coordinates() {
        let contact = contact();
        let message = AlertMessage::new(SessionId(1), "Bo", None);

        let json = serde_json::to_value(AlertPayload::new(&contact, &message)).unwrap();
        assert!(json.get("latitude").is_none());
        assert!(json.get("maps_url").is_none());
    }

    #[tokio::test]
    async fn test_log_transport_always_succeeds() {
        let message = AlertMessage::new(SessionId(1), "Bo", None);
        assert!(LogTransport.send(&contact(), &message).await.is_ok());
    }

    #[test]
    fn test_transport_from_config() {
        let config = NotifyConfig::default();
        assert_eq!(transport_from_config(&config).unwrap().name(), "log");

        let config = NotifyConfig {
            transport: TransportKind::Http,
            endpoint: Some("http://127.0.0.1:9/sos".to_string()),
            ..NotifyConfig::default()
        };
        assert_eq!(transport_from_config(&config).unwrap().name(), "http");
    }

    #[tokio::test]
    async fn test_http_transport_error_status_fails_contact() {
        let (endpoint, server) = serve_once("500 Internal Server Error").await;
        let transport = HttpTransport::new(endpoint, Duration::from_secs(2)).unwrap();
        let message = AlertMessage::new(SessionId(1), "Bo", None);

        let err = transport.send(&contact(), &message).await.unwrap_err();

        assert!(matches!(
            err,
            Error::NotificationFailed {
                contact_id: ContactId(3),
                ..
            }
        ));
        assert!(err.to_string().contains("500"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_http_transport_posts_alert_payload() {
        let (endpoint, server) = serve_once("200 OK").await;
        let transport = HttpTransport::new(endpoint, Duration::from_secs(2)).unwrap();
        let message = AlertMessage::new(SessionId(1), "Bo", Some(LocationSample::now(1.0, 2.0)));

        transport.send(&contact(), &message).await.unwrap();

        let body: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(body["contact_id"], 3);
        assert_eq!(body["phone_number"], "+34 600");
        assert_eq!(body["latitude"], 1.0);
    }

    #[tokio::test]
    async fn test_http_transport_unreachable_backend_fails() {
        let transport =
            HttpTransport::new("http://127.0.0.1:9/sos", Duration::from_millis(200)).unwrap();
        let message = AlertMessage::new(SessionId(1), "Bo", None);
        assert!(transport.send(&contact(), &message).await.is_err());
    }
}
