//! Fusion and stream-merge core of a GPS/barometer/IMU field logger.
//!
//! Sensor samples arrive on bus topics, get filtered (attitude, altitude),
//! time-aligned against each GPS fix and classified; significant fixes are
//! published and appended to a per-device, per-day log that can be archived.

pub mod archive;
pub mod bus;
pub mod classifier;
pub mod config;
pub mod error;
pub mod filters;
pub mod geo;
pub mod grid;
pub mod history;
pub mod merger;
pub mod store;
pub mod types;

pub use archive::{Archiver, DatasetId};
pub use bus::{BusMessage, MessageBus, Publisher, Subscription};
pub use classifier::{ClassifierConfig, TrackQualityClassifier};
pub use config::Config;
pub use merger::StreamMerger;
pub use store::{JsonLinesStore, LogStore, MemoryStore};
