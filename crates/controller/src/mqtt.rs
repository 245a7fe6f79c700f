//! External sample source over MQTT. A numeric payload on the moisture topic
//! becomes a [`Sample`]; temperature and EC topics only refresh the companion
//! values attached to the next moisture sample.

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::ExternalConfig;
use crate::controller::Controller;
use crate::state::Sample;

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TopicKind {
    Moisture,
    Temp,
    Ec,
}

/// Parse a sensor payload into a finite number. Unavailable markers, empty
/// payloads and anything non-numeric yield `None`.
pub(crate) fn parse_external_value(payload: &[u8]) -> Option<f64> {
    let s = String::from_utf8_lossy(payload);
    let s = s.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("unknown") || s.eq_ignore_ascii_case("unavailable") {
        return None;
    }
    s.parse::<f64>().ok().filter(|v| v.is_finite())
}

// ---------------------------------------------------------------------------
// Source state
// ---------------------------------------------------------------------------

/// Maps incoming publishes onto samples, caching companion readings.
#[derive(Debug, Clone)]
pub(crate) struct ExternalSource {
    moisture_topic: String,
    temp_topic: Option<String>,
    ec_topic: Option<String>,
    temp: Option<f64>,
    ec: Option<f64>,
}

impl ExternalSource {
    pub(crate) fn new(cfg: &ExternalConfig) -> Self {
        let nonempty = |t: &Option<String>| {
            t.as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
        };
        Self {
            moisture_topic: cfg.moisture_topic.trim().to_string(),
            temp_topic: nonempty(&cfg.temp_topic),
            ec_topic: nonempty(&cfg.ec_topic),
            temp: None,
            ec: None,
        }
    }

    pub(crate) fn topics(&self) -> Vec<&str> {
        std::iter::once(self.moisture_topic.as_str())
            .chain(self.temp_topic.as_deref())
            .chain(self.ec_topic.as_deref())
            .collect()
    }

    pub(crate) fn classify(&self, topic: &str) -> Option<TopicKind> {
        if topic == self.moisture_topic {
            Some(TopicKind::Moisture)
        } else if self.temp_topic.as_deref() == Some(topic) {
            Some(TopicKind::Temp)
        } else if self.ec_topic.as_deref() == Some(topic) {
            Some(TopicKind::Ec)
        } else {
            None
        }
    }

    /// Apply one publish. Returns a sample only for a valid moisture value.
    pub(crate) fn handle(&mut self, topic: &str, payload: &[u8], now_ms: i64) -> Option<Sample> {
        let kind = self.classify(topic)?;
        let value = parse_external_value(payload)?;
        match kind {
            TopicKind::Temp => {
                self.temp = Some(value);
                None
            }
            TopicKind::Ec => {
                self.ec = Some(value);
                None
            }
            TopicKind::Moisture => Some(Sample {
                t: now_ms,
                moist: Some(value),
                temp: self.temp,
                ec: self.ec,
                ..Sample::default()
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Subscribe to the configured topics and feed moisture samples into the
/// controller. Runs until the task is dropped; reconnects on error.
pub async fn run(cfg: ExternalConfig, controller: Arc<Controller>, clock: Arc<dyn Clock>) {
    let mut source = ExternalSource::new(&cfg);

    let mut opts = MqttOptions::new("irrigation-controller", cfg.host.clone(), cfg.port);
    opts.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(opts, 20);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let Some(sample) = source.handle(&p.topic, &p.payload, clock.now_ms()) else {
                    debug!(topic = %p.topic, "mqtt: publish ignored");
                    continue;
                };
                let accepted = controller.on_external_sample(sample).await;
                debug!(topic = %p.topic, accepted, "mqtt: moisture sample");
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(host = %cfg.host, port = cfg.port, "mqtt connected");
                for topic in source.topics() {
                    if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                        warn!(topic, "mqtt subscribe failed: {e}");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
