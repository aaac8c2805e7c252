//! Stream merger: joins every GPS fix with the nearest barometer and IMU
//! samples, classifies it and keeps the significant ones.

use std::fs;
use std::future::Future;

use chrono::Local;
use log::{debug, info, warn};
use serde::Serialize;

use crate::archive::Archiver;
use crate::bus::{BusMessage, MessageBus, Publisher, Subscription};
use crate::classifier::{FixSummary, TrackQualityClassifier};
use crate::config::{Config, MergerConfig};
use crate::error::MergeError;
use crate::filters::altitude::STANDARD_GRAVITY;
use crate::filters::{AltitudeKalmanFilter, AttitudeEstimator};
use crate::grid;
use crate::history::HistoryBuffer;
use crate::store::LogStore;
use crate::types::{
    BarometricSample, CombinedInertialBarometric, GpsSample, InertialSample, Overlay, SensorSample, Topic,
    TrackPoint, TrackStatus, Vec3, IMU_PRESSURE, TRANSFER_DATA,
};

/// Message and outcome counters, summarized at shutdown.
#[derive(Clone, Debug, Default, Serialize)]
pub struct MergerStats {
    pub gps: u64,
    pub barometer: u64,
    pub imu: u64,
    pub imu_barometer: u64,
    /// Messages dropped as malformed or incomplete
    pub rejected: u64,
    pub accepted: u64,
    pub persisted: u64,
    pub store_errors: u64,
    /// Samples evicted from full histories
    pub evicted: u64,
}

impl MergerStats {
    fn count(&mut self, topic: Topic) {
        match topic {
            Topic::Gps => self.gps += 1,
            Topic::Barometer => self.barometer += 1,
            Topic::Imu => self.imu += 1,
            Topic::ImuBarometer => self.imu_barometer += 1,
        }
    }
}

/// One subscription over all input topics, in arrival order.
pub fn subscribe_inputs(bus: &MessageBus) -> Subscription {
    bus.subscribe(Topic::INPUTS.iter().map(Topic::as_str))
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

pub struct StreamMerger<S, P> {
    config: MergerConfig,
    classifier: TrackQualityClassifier,
    altitude: AltitudeKalmanFilter,
    attitude: AttitudeEstimator,
    barometer: HistoryBuffer<BarometricSample>,
    imu: HistoryBuffer<InertialSample>,
    imu_barometer: HistoryBuffer<CombinedInertialBarometric>,
    /// Gravity-included specific force along the vertical [m/s²]
    latest_vertical_acceleration: Option<f64>,
    archiver: Archiver<S>,
    publisher: P,
    stats: MergerStats,
}

impl<S: LogStore, P: Publisher> StreamMerger<S, P> {
    pub fn new(config: &Config, archiver: Archiver<S>, publisher: P) -> Self {
        let capacity = config.merger.history_capacity;
        Self {
            config: config.merger.clone(),
            classifier: TrackQualityClassifier::new(config.classifier.clone()),
            altitude: AltitudeKalmanFilter::new(config.altitude.clone()),
            attitude: AttitudeEstimator::new(config.attitude.clone()),
            barometer: HistoryBuffer::new(capacity),
            imu: HistoryBuffer::new(capacity),
            imu_barometer: HistoryBuffer::new(capacity),
            latest_vertical_acceleration: None,
            archiver,
            publisher,
            stats: MergerStats::default(),
        }
    }

    pub fn classifier(&self) -> &TrackQualityClassifier {
        &self.classifier
    }

    pub fn archiver(&self) -> &Archiver<S> {
        &self.archiver
    }

    pub fn stats(&self) -> MergerStats {
        MergerStats {
            evicted: self.barometer.dropped() + self.imu.dropped() + self.imu_barometer.dropped(),
            ..self.stats.clone()
        }
    }

    /// Samples waiting in the history of `topic`; always 0 for GPS.
    pub fn pending(&self, topic: Topic) -> usize {
        match topic {
            Topic::Gps => 0,
            Topic::Barometer => self.barometer.len(),
            Topic::Imu => self.imu.len(),
            Topic::ImuBarometer => self.imu_barometer.len(),
        }
    }

    /// Process one bus message. Returns the track point when a fix was accepted.
    pub fn handle_message(&mut self, message: &BusMessage) -> Result<Option<TrackPoint>, MergeError> {
        let topic =
            Topic::from_name(&message.channel).ok_or_else(|| MergeError::UnknownTopic(message.channel.clone()))?;
        self.stats.count(topic);

        let sample = SensorSample::parse(topic, &message.data).map_err(|source| MergeError::Malformed { topic, source })?;
        match sample {
            SensorSample::Barometric(mut sample) => {
                self.fuse_altitude(&mut sample);
                self.barometer.push(sample);
                self.publish_imu_pressure()?;
                Ok(None)
            }
            SensorSample::Inertial(mut sample) => {
                self.fuse_attitude(&mut sample);
                self.imu.push(sample);
                Ok(None)
            }
            SensorSample::Combined(mut sample) => {
                self.fuse_attitude(&mut sample.inertial);
                self.fuse_altitude(&mut sample.barometric);
                self.imu_barometer.push(sample);
                Ok(None)
            }
            SensorSample::Gps(fix) => self.on_fix(fix),
        }
    }

    /// Replace roll/pitch/yaw and vertical acceleration with the filtered attitude.
    fn fuse_attitude(&mut self, sample: &mut InertialSample) {
        if let Some(raw) = sample.raw_acceleration {
            let gyro = sample.gyro.map(Vec3::from);
            let magnetometer = sample.raw_magnetometer.map(Vec3::from);
            match self.attitude.update(sample.i_utc, Vec3::from(raw), gyro, magnetometer) {
                Some(estimate) => {
                    sample.roll = round_to(estimate.roll.to_degrees(), 2);
                    sample.pitch = round_to(estimate.pitch.to_degrees(), 2);
                    sample.yaw = estimate.yaw.map(|yaw| round_to(yaw.to_degrees(), 2));
                    sample.vertical_acceleration = Some(round_to(estimate.vertical_acceleration, 3));
                }
                None => debug!("degenerate acceleration at {:.3}, attitude unchanged", sample.i_utc),
            }
        }
        if let Some(acceleration) = sample.vertical_acceleration {
            self.latest_vertical_acceleration = Some(acceleration);
        }
    }

    fn fuse_altitude(&mut self, sample: &mut BarometricSample) {
        let altitude = self.altitude.altitude_of(sample.pressure);
        let acceleration = self
            .latest_vertical_acceleration
            .map_or(0.0, |a| a - STANDARD_GRAVITY);
        if let Some(estimate) = self.altitude.step(sample.p_utc, altitude, acceleration) {
            sample.fused_altitude = Some(round_to(estimate.altitude, 2));
            sample.vertical_speed = Some(round_to(estimate.vertical_speed, 3));
        }
    }

    fn publish_imu_pressure(&self) -> Result<(), MergeError> {
        let (Some(barometric), Some(inertial)) = (self.barometer.latest(), self.imu.latest()) else {
            return Ok(());
        };
        let mut joined = TrackPoint::default();
        barometric.overlay_onto(&mut joined)?;
        inertial.overlay_onto(&mut joined)?;
        self.publisher.publish(IMU_PRESSURE, &joined.to_json());
        Ok(())
    }

    fn on_fix(&mut self, fix: GpsSample) -> Result<Option<TrackPoint>, MergeError> {
        let utc = fix.utc.ok_or(MergeError::MissingField {
            topic: Topic::Gps,
            field: "utc",
        })?;
        let mut point = TrackPoint::from_gps(&fix)?;

        let threshold = utc - self.config.tolerance;
        if let Some(sample) = self.barometer.advance_until(threshold) {
            sample.overlay_onto(&mut point)?;
        }
        if let Some(sample) = self.imu.advance_until(threshold) {
            sample.overlay_onto(&mut point)?;
        }
        if let Some(sample) = self.imu_barometer.advance_until(threshold) {
            sample.overlay_onto(&mut point)?;
        }

        let summary = FixSummary {
            utc,
            location: (fix.lat, fix.lon),
            pressure: point.get_f64("pressure"),
        };
        let (status, accepted) = self.classifier.evaluate(&summary);
        debug!("fix {:.2} status {}", utc, status.code());
        if !accepted {
            return Ok(None);
        }

        self.decorate(&mut point, &fix, status);
        self.stats.accepted += 1;
        self.publisher.publish(TRANSFER_DATA, &point.to_json());

        match self.archiver.append(&point) {
            Ok(dataset) => {
                self.stats.persisted += 1;
                debug!("stored fix {:.2} in {}", utc, dataset);
            }
            Err(e) => {
                self.stats.store_errors += 1;
                warn!("Failed to store fix {:.2}: {}", utc, e);
            }
        }
        Ok(Some(point))
    }

    fn decorate(&self, point: &mut TrackPoint, fix: &GpsSample, status: TrackStatus) {
        point.insert("my_status", status.code());
        // NaN becomes JSON null
        let pos_error = fix.hdop.map_or(f64::NAN, |hdop| round_to(hdop * self.config.h_uere, 2));
        point.insert("pos_error", pos_error);
        if let Some(utm) = grid::to_utm(fix.lat, fix.lon) {
            point.insert("utm", utm.to_string());
            point.insert("mgrs", utm.to_mgrs().to_string());
        }
        if let Some(temperature) = self.cpu_temperature() {
            point.insert("rpi_temperature", temperature);
        }
        point.insert("localtime", Local::now().format("%Y-%m-%d %H:%M:%S").to_string());
        if point.hostname().is_none() {
            if let Some(hostname) = &self.config.hostname {
                point.insert("hostname", hostname.as_str());
            }
        }
    }

    /// SoC temperature [°C] from the thermal zone, which reports millidegrees.
    fn cpu_temperature(&self) -> Option<f64> {
        if !self.config.read_cpu_temperature {
            return None;
        }
        let text = fs::read_to_string(&self.config.thermal_zone).ok()?;
        let millidegrees: f64 = text.trim().parse().ok()?;
        Some(round_to(millidegrees / 1000.0, 1))
    }

    /// Consume `subscription` until `shutdown` resolves or the bus is closed.
    ///
    /// Shutdown is checked before every message, so it takes effect once the
    /// message in hand is done; a closed bus is drained first.
    pub async fn run<F>(&mut self, mut subscription: Subscription, shutdown: F) -> MergerStats
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!("merging topics {:?}", subscription.topics());
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                message = subscription.recv() => match message {
                    Some(message) => self.dispatch(&message),
                    None => break,
                },
            }
        }
        subscription.unsubscribe();

        let stats = self.stats();
        info!(
            "merger stopped: {} fixes, {} accepted, {} stored, {} rejected, {} store errors, {} evicted",
            stats.gps, stats.accepted, stats.persisted, stats.rejected, stats.store_errors, stats.evicted
        );
        stats
    }

    fn dispatch(&mut self, message: &BusMessage) {
        match self.handle_message(message) {
            Ok(_) => {}
            Err(MergeError::UnknownTopic(topic)) => debug!("ignoring message on {}", topic),
            Err(e) => {
                self.stats.rejected += 1;
                warn!("{}", e);
            }
        }
    }
}
