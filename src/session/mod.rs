//! Sleep sessions: what the wearable records and what the phone stores
//!
//! The wire payload is a single JSON object `{"fullData": ..., "summary": ...}`
//! produced by [`SleepSession::payload`]. It is one top-level object, so the
//! receiver's structural framing can only complete on its final byte.

pub mod store;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::link::LinkStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartRateSample {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub heart_rate: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementSample {
    pub timestamp: i64,
    /// Acceleration vector length, m/s².
    pub magnitude: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SleepQuality {
    #[serde(rename = "Profundo")]
    Deep,
    #[serde(rename = "Moderado")]
    Moderate,
    #[serde(rename = "Ligero")]
    Light,
}

impl SleepQuality {
    pub fn classify(average_heart_rate: i32, movement_score: f32) -> Self {
        if average_heart_rate < 60 && movement_score < 0.5 {
            SleepQuality::Deep
        } else if average_heart_rate < 70 && movement_score < 1.0 {
            SleepQuality::Moderate
        } else {
            SleepQuality::Light
        }
    }
}

/// Condensed view sent alongside the raw series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Seconds.
    pub duration: i64,
    pub average_heart_rate: i32,
    pub movement_score: f32,
    pub sleep_quality: SleepQuality,
    pub heart_rate_data_points: usize,
    pub movement_data_points: usize,
    pub start_time: i64,
    pub end_time: i64,
}

/// One recorded night.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SleepSession {
    pub start_time: i64,
    pub end_time: i64,
    pub heart_rate_data: Vec<HeartRateSample>,
    pub movement_data: Vec<MovementSample>,
}

/// The object written over the link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPayload {
    pub full_data: SleepSession,
    pub summary: SessionSummary,
}

impl SessionPayload {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl SleepSession {
    pub fn new(start_time: i64) -> Self {
        Self {
            start_time,
            end_time: 0,
            heart_rate_data: Vec::new(),
            movement_data: Vec::new(),
        }
    }

    /// Integer mean, truncated; 0 without samples.
    pub fn average_heart_rate(&self) -> i32 {
        if self.heart_rate_data.is_empty() {
            return 0;
        }
        let total: i64 = self.heart_rate_data.iter().map(|s| s.heart_rate as i64).sum();
        (total / self.heart_rate_data.len() as i64) as i32
    }

    /// Mean movement magnitude; 0 without samples.
    pub fn movement_score(&self) -> f32 {
        if self.movement_data.is_empty() {
            return 0.0;
        }
        let total: f64 = self.movement_data.iter().map(|s| s.magnitude as f64).sum();
        (total / self.movement_data.len() as f64) as f32
    }

    pub fn sleep_quality(&self) -> SleepQuality {
        SleepQuality::classify(self.average_heart_rate(), self.movement_score())
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            duration: (self.end_time - self.start_time) / 1000,
            average_heart_rate: self.average_heart_rate(),
            movement_score: self.movement_score(),
            sleep_quality: self.sleep_quality(),
            heart_rate_data_points: self.heart_rate_data.len(),
            movement_data_points: self.movement_data.len(),
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }

    pub fn payload(&self) -> SessionPayload {
        SessionPayload {
            full_data: self.clone(),
            summary: self.summary(),
        }
    }
}

/// Collects sensor readings into a [`SleepSession`].
///
/// Heart-rate readings are also published live as
/// [`LinkStatus::HeartRateSample`] when a status channel is attached.
pub struct SessionRecorder {
    session: SleepSession,
    live: Option<broadcast::Sender<LinkStatus>>,
}

impl SessionRecorder {
    pub fn start(start_time: i64) -> Self {
        log::info!("Sleep session started at {}", start_time);
        Self {
            session: SleepSession::new(start_time),
            live: None,
        }
    }

    pub fn start_now() -> Self {
        Self::start(Utc::now().timestamp_millis())
    }

    pub fn with_live_status(mut self, live: broadcast::Sender<LinkStatus>) -> Self {
        self.live = Some(live);
        self
    }

    pub fn record_heart_rate(&mut self, timestamp: i64, bpm: i32) {
        log::debug!("Heart rate: {} bpm", bpm);
        self.session.heart_rate_data.push(HeartRateSample {
            timestamp,
            heart_rate: bpm,
        });
        if let Some(live) = &self.live {
            let _ = live.send(LinkStatus::HeartRateSample {
                bpm,
                timestamp_ms: timestamp,
            });
        }
    }

    /// Record one accelerometer reading as its magnitude.
    pub fn record_acceleration(&mut self, timestamp: i64, x: f32, y: f32, z: f32) {
        let magnitude = (x * x + y * y + z * z).sqrt();
        log::trace!("Accelerometer x:{} y:{} z:{} magnitude:{}", x, y, z, magnitude);
        self.session.movement_data.push(MovementSample {
            timestamp,
            magnitude,
        });
    }

    pub fn session(&self) -> &SleepSession {
        &self.session
    }

    pub fn finish(mut self, end_time: i64) -> SleepSession {
        self.session.end_time = end_time;
        log::info!(
            "Sleep session finished: {} heart-rate and {} movement samples",
            self.session.heart_rate_data.len(),
            self.session.movement_data.len()
        );
        self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(rates: &[i32], magnitudes: &[f32]) -> SleepSession {
        let mut recorder = SessionRecorder::start(1_000);
        for (i, bpm) in rates.iter().enumerate() {
            recorder.record_heart_rate(1_000 + i as i64, *bpm);
        }
        for (i, m) in magnitudes.iter().enumerate() {
            recorder.record_acceleration(1_000 + i as i64, *m, 0.0, 0.0);
        }
        recorder.finish(3_601_000)
    }

    #[test]
    fn test_quality_thresholds() {
        assert_eq!(session(&[55, 58], &[0.2]).sleep_quality(), SleepQuality::Deep);
        assert_eq!(session(&[65], &[0.7]).sleep_quality(), SleepQuality::Moderate);
        // Low heart rate alone is not enough.
        assert_eq!(session(&[50], &[0.9]).sleep_quality(), SleepQuality::Moderate);
        assert_eq!(session(&[75], &[0.1]).sleep_quality(), SleepQuality::Light);
        // No samples counts as deep sleep: both averages are zero.
        assert_eq!(session(&[], &[]).sleep_quality(), SleepQuality::Deep);
    }

    #[test]
    fn test_average_heart_rate_truncates() {
        assert_eq!(session(&[60, 61], &[]).average_heart_rate(), 60);
    }

    #[test]
    fn test_acceleration_magnitude() {
        let mut recorder = SessionRecorder::start(0);
        recorder.record_acceleration(5, 3.0, 4.0, 0.0);
        assert_eq!(recorder.session().movement_data[0].magnitude, 5.0);
    }

    #[test]
    fn test_summary_fields() {
        let summary = session(&[58, 62], &[0.3, 0.5]).summary();
        assert_eq!(summary.duration, 3600);
        assert_eq!(summary.average_heart_rate, 60);
        assert_eq!(summary.heart_rate_data_points, 2);
        assert_eq!(summary.movement_data_points, 2);
        assert_eq!(summary.start_time, 1_000);
        assert_eq!(summary.end_time, 3_601_000);
    }

    #[test]
    fn test_payload_wire_shape() {
        let bytes = session(&[58], &[0.2]).payload().to_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["summary"]["sleepQuality"], "Profundo");
        assert_eq!(value["summary"]["heartRateDataPoints"], 1);
        assert_eq!(value["fullData"]["heartRateData"][0]["heartRate"], 58);
        assert!(value["fullData"]["movementData"][0]["magnitude"].is_number());
        // Only the final byte closes the top-level object.
        assert_eq!(bytes.last(), Some(&b'}'));
    }

    #[tokio::test]
    async fn test_recorder_publishes_live_heart_rate() {
        let (tx, mut rx) = broadcast::channel(4);
        let mut recorder = SessionRecorder::start(0).with_live_status(tx);
        recorder.record_heart_rate(42, 57);
        assert_eq!(
            rx.recv().await.unwrap(),
            LinkStatus::HeartRateSample {
                bpm: 57,
                timestamp_ms: 42
            }
        );
    }
}
