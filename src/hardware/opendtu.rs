//! HTTP gateway to the OpenDTU device that manages the battery inverter.
//!
//! Two concerns: reading the live battery measurements (DC voltage per
//! channel, battery-to-grid power) and switching the inverter's Dynamic
//! Power Limiter on or off. All requests use basic auth and a hard 2 s
//! timeout; a failed request leaves the last known measurements in place and
//! is retried implicitly on the next controller iteration.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::domain::InverterPort;

const HTTP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct ValueNode {
    v: f32,
}

#[derive(Debug, Deserialize)]
struct DcChannel {
    #[serde(rename = "Voltage")]
    voltage: ValueNode,
}

#[derive(Debug, Deserialize)]
struct LiveInverter {
    #[serde(rename = "DC")]
    dc: HashMap<String, DcChannel>,
}

#[derive(Debug, Deserialize)]
struct LiveTotal {
    #[serde(rename = "Power")]
    power: ValueNode,
}

/// Subset of `/api/livedata/status` this controller cares about.
#[derive(Debug, Deserialize)]
struct LiveDataResponse {
    inverters: Vec<LiveInverter>,
    total: LiveTotal,
}

#[derive(Debug, Deserialize)]
struct PowerLimiterStatus {
    enabled: bool,
}

#[derive(Debug, Default)]
struct InverterState {
    battery_voltage: f32,
    battery_to_grid_power: f32,
    dpl_enabled: bool,
    last_fetch_failed: bool,
}

pub struct OpenDtuClient {
    http: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
    inverter_id: String,
    start_discharge_voltage: f32,
    stop_discharge_voltage: f32,
    state: Mutex<InverterState>,
}

impl OpenDtuClient {
    pub fn new(cfg: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build OpenDTU HTTP client")?;

        Ok(Self {
            http,
            base_url: format!("http://{}", cfg.opendtu_hostname),
            user: cfg.opendtu_admin_user.clone(),
            password: cfg.opendtu_admin_password.clone(),
            inverter_id: cfg.opendtu_battery_inverter_id.clone(),
            start_discharge_voltage: cfg.opendtu_start_discharge_voltage,
            stop_discharge_voltage: cfg.opendtu_stop_discharge_voltage,
            state: Mutex::new(InverterState::default()),
        })
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    /// Query whether the DPL is currently active, once at startup, so the
    /// FSM starts from the device's actual state.
    pub async fn fetch_initial_dpl_state(&self) {
        let url = format!("{}/api/powerlimiter/status", self.base_url);
        let status: Option<PowerLimiterStatus> = self.get_json(&url).await;
        match status {
            Some(status) => self.state.lock().dpl_enabled = status.enabled,
            None => warn!("failed to fetch initial power limiter state"),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Option<T> {
        let response = self
            .http
            .get(url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                warn!(url, "HTTP GET request timed out");
                return None;
            }
            Err(e) => {
                warn!(url, error = %e, "HTTP GET request failed");
                return None;
            }
        };

        match response.error_for_status() {
            Ok(response) => match response.json().await {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    warn!(url, error = %e, "failed to decode OpenDTU response");
                    None
                }
            },
            Err(e) => {
                warn!(url, error = %e, "OpenDTU returned an error status");
                None
            }
        }
    }

    async fn post_dpl_config(&self, enabled: bool) {
        let url = format!("{}/api/powerlimiter/config", self.base_url);
        let result = self
            .http
            .post(&url)
            .basic_auth(&self.user, Some(&self.password))
            .form(&[("data", self.dpl_payload(enabled))])
            .send()
            .await;

        match result {
            Ok(response) => {
                if let Err(e) = response.error_for_status() {
                    warn!(error = %e, "power limiter config request rejected");
                }
            }
            Err(e) if e.is_timeout() => warn!("HTTP POST request timed out"),
            Err(e) => warn!(error = %e, "HTTP POST request failed"),
        }

        // mirror the commanded state; a lost request surfaces on the next
        // status fetch
        self.state.lock().dpl_enabled = enabled;
    }

    /// DPL configuration document. Tuning values are fixed; only the enable
    /// flag and the configured discharge voltage window vary.
    fn dpl_payload(&self, enabled: bool) -> String {
        serde_json::json!({
            "enabled": enabled,
            "verbose_logging": false,
            "solar_passthrough_enabled": false,
            "is_inverter_behind_powermeter": true,
            "inverter_id": 0,
            "inverter_channel_id": 0,
            "target_power_consumption": 5,
            "target_power_consumption_hysteresis": 5,
            "lower_power_limit": 30,
            "upper_power_limit": 800,
            "battery_soc_start_threshold": 80,
            "battery_soc_stop_threshold": 20,
            "voltage_start_threshold": one_decimal(self.start_discharge_voltage),
            "voltage_stop_threshold": one_decimal(self.stop_discharge_voltage),
            "voltage_load_correction_factor": 0.0015,
            "inverter_restart_hour": 0
        })
        .to_string()
    }
}

/// The DPL API expects the voltage thresholds with one decimal.
fn one_decimal(v: f32) -> f64 {
    (f64::from(v) * 10.0).round() / 10.0
}

#[async_trait]
impl InverterPort for OpenDtuClient {
    async fn fetch_current_state(&self) {
        let url = format!(
            "{}/api/livedata/status?inv={}",
            self.base_url, self.inverter_id
        );

        let Some(live) = self.get_json::<LiveDataResponse>(&url).await else {
            let mut state = self.state.lock();
            if !state.last_fetch_failed {
                warn!("failed to fetch current inverter status");
                state.last_fetch_failed = true;
            }
            return;
        };

        let Some(inverter) = live.inverters.first() else {
            warn!("inverter status response contains no inverters");
            return;
        };
        let (Some(ch0), Some(ch1)) = (inverter.dc.get("0"), inverter.dc.get("1")) else {
            warn!("inverter status response misses DC channel voltages");
            return;
        };

        let mut state = self.state.lock();
        if state.last_fetch_failed {
            state.last_fetch_failed = false;
            info!("fetched inverter status again after connection issues");
        }
        // both DC channels hang off the same battery, average them
        state.battery_voltage = (ch0.voltage.v + ch1.voltage.v) / 2.0;
        state.battery_to_grid_power = live.total.power.v;
        debug!(
            battery_voltage = state.battery_voltage,
            battery_to_grid_power = state.battery_to_grid_power,
            "refreshed inverter state"
        );
    }

    async fn enable_dpl(&self) {
        info!("requesting to enable the dynamic power limiter");
        self.post_dpl_config(true).await;
    }

    async fn disable_dpl(&self) {
        info!("requesting to disable the dynamic power limiter");
        self.post_dpl_config(false).await;
    }

    fn battery_voltage(&self) -> f32 {
        self.state.lock().battery_voltage
    }

    fn battery_to_grid_power(&self) -> f32 {
        self.state.lock().battery_to_grid_power
    }

    fn dpl_enabled(&self) -> bool {
        self.state.lock().dpl_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{basic_auth, body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> OpenDtuClient {
        let cfg = Config {
            opendtu_admin_user: "admin".into(),
            opendtu_admin_password: "secret".into(),
            opendtu_battery_inverter_id: "116180200123".into(),
            opendtu_start_discharge_voltage: 50.2,
            opendtu_stop_discharge_voltage: 48.6,
            ..Config::default()
        };
        OpenDtuClient::new(&cfg)
            .unwrap()
            .with_base_url(server.uri())
    }

    fn livedata_body(v0: f32, v1: f32, power: f32) -> serde_json::Value {
        serde_json::json!({
            "inverters": [{
                "DC": {
                    "0": { "Voltage": { "v": v0 } },
                    "1": { "Voltage": { "v": v1 } }
                }
            }],
            "total": { "Power": { "v": power } }
        })
    }

    #[tokio::test]
    async fn livedata_fetch_averages_both_dc_channels() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/livedata/status"))
            .and(query_param("inv", "116180200123"))
            .and(basic_auth("admin", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(livedata_body(50.0, 51.0, 123.4)))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        client.fetch_current_state().await;

        assert_eq!(client.battery_voltage(), 50.5);
        assert_eq!(client.battery_to_grid_power(), 123.4);
    }

    #[tokio::test]
    async fn failed_fetch_keeps_last_known_values() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/livedata/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(livedata_body(49.0, 49.4, 10.0)))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        client.fetch_current_state().await;
        assert_eq!(client.battery_voltage(), 49.2);

        server.reset().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        client.fetch_current_state().await;
        assert_eq!(client.battery_voltage(), 49.2);
        assert_eq!(client.battery_to_grid_power(), 10.0);
    }

    #[tokio::test]
    async fn dpl_toggle_posts_form_encoded_config() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/powerlimiter/config"))
            .and(basic_auth("admin", "secret"))
            .and(body_string_contains("data="))
            .and(body_string_contains("%22enabled%22%3Atrue"))
            .and(body_string_contains("%22voltage_start_threshold%22%3A50.2"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        client.enable_dpl().await;
        assert!(client.dpl_enabled());
    }

    #[tokio::test]
    async fn disabling_dpl_uses_configured_thresholds_too() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/powerlimiter/config"))
            .and(body_string_contains("%22enabled%22%3Afalse"))
            .and(body_string_contains("%22voltage_stop_threshold%22%3A48.6"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        client.disable_dpl().await;
        assert!(!client.dpl_enabled());
    }

    #[tokio::test]
    async fn initial_dpl_state_follows_the_device() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/powerlimiter/status"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"enabled": true})),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert!(!client.dpl_enabled());
        client.fetch_initial_dpl_state().await;
        assert!(client.dpl_enabled());
    }
}
