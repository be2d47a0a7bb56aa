// Zenoh-backed sensor capabilities
//
// Both sources drain their subscriber without blocking; a poll with nothing
// queued is simply "no new data".

use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use tracing::warn;
use zenoh::handlers::FifoChannelHandler;
use zenoh::pubsub::Subscriber;
use zenoh::sample::Sample;

use crate::drive::VisionMeasurement;
use crate::geometry::Orientation;
use crate::hardware::{HardwareError, Imu, Result, VisionSource};
use crate::messages::{ImuSample, VisionSample};

pub type SampleSubscriber = Subscriber<FifoChannelHandler<Sample>>;

/// IMU readings older than this are treated as unavailable
pub const IMU_TIMEOUT: Duration = Duration::from_millis(500);

pub fn parse_sample<T: DeserializeOwned>(source_name: &str, payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| HardwareError::InvalidSample {
        source_name: source_name.to_string(),
        reason: e.to_string(),
    })
}

/// Parse every queued sample and keep the newest valid one
fn drain_latest<T: DeserializeOwned>(
    subscriber: &SampleSubscriber,
    source_name: &str,
) -> Result<Option<T>> {
    let mut latest = None;
    loop {
        match subscriber.try_recv() {
            Ok(Some(sample)) => {
                let payload = sample.payload().to_bytes();
                match parse_sample(source_name, &payload) {
                    Ok(value) => latest = Some(value),
                    Err(e) => warn!("{}", e),
                }
            }
            Ok(None) => break,
            Err(e) => {
                return Err(HardwareError::Unavailable {
                    device: format!("{} ({})", source_name, e),
                });
            }
        }
    }
    Ok(latest)
}

fn validate_vision(sample: &VisionSample) -> Result<()> {
    let values = [sample.x, sample.y, sample.heading_deg, sample.latency_ms];
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(HardwareError::InvalidSample {
            source_name: "vision".to_string(),
            reason: format!("non-finite values in {:?}", sample),
        })
    }
}

/// Vision poses published by an external pipeline
pub struct ZenohVisionSource {
    subscriber: SampleSubscriber,
}

impl ZenohVisionSource {
    pub fn new(subscriber: SampleSubscriber) -> Self {
        Self { subscriber }
    }
}

impl VisionSource for ZenohVisionSource {
    fn poll(&mut self, now: f64) -> Result<Option<VisionMeasurement>> {
        match drain_latest::<VisionSample>(&self.subscriber, "vision")? {
            Some(sample) => {
                validate_vision(&sample)?;
                Ok(Some(sample.into_measurement(now)))
            }
            None => Ok(None),
        }
    }
}

/// Last IMU reading and when it arrived
#[derive(Debug, Clone)]
pub struct ImuCache {
    latest: Option<(Orientation, Instant)>,
    timeout: Duration,
}

impl ImuCache {
    pub fn new(timeout: Duration) -> Self {
        Self { latest: None, timeout }
    }

    pub fn update(&mut self, sample: ImuSample, received_at: Instant) {
        self.latest = Some((sample.into(), received_at));
    }

    pub fn current(&self, now: Instant) -> Result<Orientation> {
        match self.latest {
            Some((orientation, at)) if now.saturating_duration_since(at) <= self.timeout => {
                Ok(orientation)
            }
            Some(_) => Err(HardwareError::Unavailable {
                device: "IMU (stale)".to_string(),
            }),
            None => Err(HardwareError::Unavailable {
                device: "IMU (no samples yet)".to_string(),
            }),
        }
    }
}

/// Orientation published by an external IMU node
pub struct ZenohImu {
    subscriber: SampleSubscriber,
    cache: ImuCache,
    offset: Orientation,
}

impl ZenohImu {
    pub fn new(subscriber: SampleSubscriber) -> Self {
        Self {
            subscriber,
            cache: ImuCache::new(IMU_TIMEOUT),
            offset: Orientation::default(),
        }
    }
}

impl Imu for ZenohImu {
    fn raw_orientation(&mut self) -> Result<Orientation> {
        if let Some(sample) = drain_latest::<ImuSample>(&self.subscriber, "imu")? {
            self.cache.update(sample, Instant::now());
        }
        self.cache.current(Instant::now())
    }

    fn offset(&self) -> Orientation {
        self.offset
    }

    fn set_offset(&mut self, offset: Orientation) {
        self.offset = offset;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vision_sample() {
        let payload = br#"{"x": 1.0, "y": 2.0, "heading_deg": 45.0, "latency_ms": 30.0,
                           "std_devs": {"x": 0.5, "y": 0.5, "heading": 0.9}}"#;
        let sample: VisionSample = parse_sample("vision", payload).unwrap();
        assert_eq!(sample.std_devs.unwrap().heading, 0.9);
        validate_vision(&sample).unwrap();
    }

    #[test]
    fn test_parse_garbage_is_invalid_sample() {
        let result = parse_sample::<ImuSample>("imu", b"not json");
        assert!(matches!(result, Err(HardwareError::InvalidSample { .. })));
    }

    #[test]
    fn test_imu_cache_goes_stale() {
        let mut cache = ImuCache::new(Duration::from_millis(100));
        let start = Instant::now();
        assert!(cache.current(start).is_err());

        cache.update(
            ImuSample {
                yaw_deg: 90.0,
                pitch_deg: 0.0,
                roll_deg: 0.0,
            },
            start,
        );
        let orientation = cache.current(start + Duration::from_millis(50)).unwrap();
        assert!((orientation.yaw - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
        assert!(cache.current(start + Duration::from_millis(150)).is_err());
    }
}
