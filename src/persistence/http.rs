/// REST client for the persistence API
///
/// Endpoints used:
/// - `GET  {base}/gateways/{id}`
/// - `GET  {base}/sensors?gatewayId={id}`
/// - `GET  {base}/sensors?serial={s1},{s2},...`
/// - `POST {base}/sensors/discover` with `{ sensors, equipmentId }`
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::{
    DiscoverSensorsRequest, DiscoverSensorsResponse, GatewayRecord, SensorAssociation, SensorRecord,
    SensorRegistry,
};
use crate::config::PersistenceConfig;
use crate::errors::GatewayError;
use crate::gateway::GatewayId;
use crate::logger::{self, LogTag};
use crate::telemetry::SensorSerial;

pub struct HttpSensorRegistry {
    client: Client,
    base_url: String,
}

impl HttpSensorRegistry {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, GatewayError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        url::Url::parse(&base_url)
            .map_err(|e| GatewayError::Config(format!("Invalid persistence base URL '{}': {}", base_url, e)))?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Ok(Self { client, base_url })
    }

    pub fn from_config(config: &PersistenceConfig) -> Result<Self, GatewayError> {
        Self::new(config.base_url.clone(), Duration::from_secs(config.request_timeout_secs))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn read_json<T: DeserializeOwned>(&self, response: Response, what: &str) -> Result<T, GatewayError> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(GatewayError::persistence(format!("{} not found", what)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::persistence(format!(
                "{} request failed with status {}: {}",
                what,
                status,
                body.trim()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| GatewayError::persistence(format!("Failed to parse {} response: {}", what, e)))
    }
}

#[async_trait]
impl SensorRegistry for HttpSensorRegistry {
    async fn gateway(&self, id: &GatewayId) -> Result<GatewayRecord, GatewayError> {
        let url = format!("{}/gateways/{}", self.base_url, id);
        logger::debug(LogTag::Persistence, &format!("GET {}", url));

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| GatewayError::persistence(format!("Gateway request failed: {}", e)))?;

        self.read_json(response, &format!("gateway {}", id)).await
    }

    async fn sensors(&self, gateway_id: &GatewayId) -> Result<Vec<SensorRecord>, GatewayError> {
        let url = format!("{}/sensors", self.base_url);
        logger::debug(
            LogTag::Persistence,
            &format!("GET {}?gatewayId={}", url, gateway_id),
        );

        let response = self
            .client
            .get(&url)
            .query(&[("gatewayId", gateway_id.as_str())])
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| GatewayError::persistence(format!("Sensor list request failed: {}", e)))?;

        let sensors: Vec<SensorRecord> = self
            .read_json(response, &format!("sensors of gateway {}", gateway_id))
            .await?;
        logger::verbose(
            LogTag::Persistence,
            &format!("Gateway {} has {} registered sensors", gateway_id, sensors.len()),
        );
        Ok(sensors)
    }

    async fn sensors_by_serial(&self, serials: &[SensorSerial]) -> Result<Vec<SensorRecord>, GatewayError> {
        if serials.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/sensors", self.base_url);
        let joined = serials
            .iter()
            .map(|serial| serial.to_string())
            .collect::<Vec<_>>()
            .join(",");
        logger::debug(LogTag::Persistence, &format!("GET {}?serial={}", url, joined));

        let response = self
            .client
            .get(&url)
            .query(&[("serial", joined.as_str())])
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| GatewayError::persistence(format!("Sensor lookup request failed: {}", e)))?;

        let sensors: Vec<SensorRecord> = self.read_json(response, "sensor lookup").await?;
        // Backends may ignore the filter and return everything
        Ok(sensors
            .into_iter()
            .filter(|record| serials.contains(&record.serial))
            .collect())
    }

    async fn discover_sensors(
        &self,
        equipment_id: &str,
        sensors: &[SensorAssociation],
    ) -> Result<DiscoverSensorsResponse, GatewayError> {
        let url = format!("{}/sensors/discover", self.base_url);
        logger::info(
            LogTag::Persistence,
            &format!(
                "Submitting {} sensors for equipment {}",
                sensors.len(),
                equipment_id
            ),
        );

        let response = self
            .client
            .post(&url)
            .header("Accept", "application/json")
            .json(&DiscoverSensorsRequest { sensors, equipment_id })
            .send()
            .await
            .map_err(|e| GatewayError::persistence(format!("Sensor submission failed: {}", e)))?;

        let result: DiscoverSensorsResponse = self
            .read_json(response, &format!("equipment {}", equipment_id))
            .await?;
        if !result.errors.is_empty() {
            logger::warning(
                LogTag::Persistence,
                &format!(
                    "Equipment {}: {} created, {} rejected",
                    equipment_id,
                    result.created.len(),
                    result.errors.len()
                ),
            );
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Answer exactly one HTTP request and hand back its raw text
    async fn serve_once(status: &'static str, body: String) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];

            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.ok();
            let _ = tx.send(String::from_utf8_lossy(&request).to_string());
        });

        (format!("http://{}/api", addr), rx)
    }

    #[tokio::test]
    async fn test_gateway_lookup() {
        let body = json!({
            "id": "gw-1",
            "name": "Line 3",
            "url": "ws://10.0.0.5:8080/ws",
            "username": "admin",
            "password": "secret"
        })
        .to_string();
        let (base, request) = serve_once("200 OK", body).await;
        let registry = HttpSensorRegistry::new(base, Duration::from_secs(5)).unwrap();

        let record = registry.gateway(&GatewayId::new("gw-1")).await.unwrap();
        assert_eq!(record.url, "ws://10.0.0.5:8080/ws");
        assert!(request.await.unwrap().starts_with("GET /api/gateways/gw-1 "));
    }

    #[tokio::test]
    async fn test_sensor_list_uses_gateway_query() {
        let body = json!([{"id": 1, "serial": "1001"}, {"id": 2, "serial": 1002, "gatewayId": "gw-1"}]).to_string();
        let (base, request) = serve_once("200 OK", body).await;
        let registry = HttpSensorRegistry::new(format!("{}/", base), Duration::from_secs(5)).unwrap();

        let sensors = registry.sensors(&GatewayId::new("gw-1")).await.unwrap();
        assert_eq!(sensors.iter().map(|s| s.serial).collect::<Vec<_>>(), vec![1001, 1002]);
        assert!(request.await.unwrap().starts_with("GET /api/sensors?gatewayId=gw-1 "));
    }

    #[tokio::test]
    async fn test_serial_lookup_spans_gateways() {
        let body = json!([
            {"id": 7, "serial": 1001, "gatewayId": "gw-other"},
            {"id": 8, "serial": "1002"},
            {"id": 9, "serial": 5555}
        ])
        .to_string();
        let (base, request) = serve_once("200 OK", body).await;
        let registry = HttpSensorRegistry::new(base, Duration::from_secs(5)).unwrap();

        let found = registry.sensors_by_serial(&[1001, 1002]).await.unwrap();
        assert_eq!(found.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["7", "8"]);
        assert!(request.await.unwrap().starts_with("GET /api/sensors?serial=1001%2C1002 "));

        assert!(registry.sensors_by_serial(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_discover_posts_batch_and_reads_partial_errors() {
        let body = json!({
            "created": [{"id": "s-1", "serial": 1001, "equipmentId": "eq-1"}],
            "errors": [{"serial": "1002", "message": "serial already registered"}]
        })
        .to_string();
        let (base, request) = serve_once("201 Created", body).await;
        let registry = HttpSensorRegistry::new(base, Duration::from_secs(5)).unwrap();

        let association = SensorAssociation {
            serial: 1001,
            equipment_id: "eq-1".into(),
            name: "Motor DE".into(),
            gateway_id: Some("gw-1".into()),
            part_number: None,
            hardware_version: None,
            firmware_version: None,
            access_point: None,
            read_rate: None,
            read_period: None,
            samples: None,
            g_mode: None,
            freq_mode: None,
        };
        let result = registry
            .discover_sensors("eq-1", &[association])
            .await
            .unwrap();
        assert_eq!(result.created.len(), 1);
        assert_eq!(result.errors[0].serial, 1002);

        let raw = request.await.unwrap();
        assert!(raw.starts_with("POST /api/sensors/discover "));
        assert!(raw.contains("\"equipmentId\":\"eq-1\""));
        assert!(raw.contains("\"gatewayId\":\"gw-1\""));
    }

    #[tokio::test]
    async fn test_http_failures_map_to_persistence_errors() {
        let (base, _request) = serve_once("404 Not Found", "{}".into()).await;
        let registry = HttpSensorRegistry::new(base, Duration::from_secs(5)).unwrap();
        let err = registry.gateway(&GatewayId::new("missing")).await.unwrap_err();
        assert_eq!(err, GatewayError::Persistence("gateway missing not found".into()));

        let (base, _request) = serve_once("500 Internal Server Error", "{\"error\":\"db down\"}".into()).await;
        let registry = HttpSensorRegistry::new(base, Duration::from_secs(5)).unwrap();
        match registry.sensors(&GatewayId::new("gw-1")).await {
            Err(GatewayError::Persistence(message)) => {
                assert!(message.contains("500"));
                assert!(message.contains("db down"));
            }
            other => panic!("expected persistence error, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_invalid_base_url() {
        assert!(matches!(
            HttpSensorRegistry::new("not a url", Duration::from_secs(1)),
            Err(GatewayError::Config(_))
        ));
    }
}
