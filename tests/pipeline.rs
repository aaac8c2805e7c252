use std::fs;

use gps_tracker_rs::archive::{track_length, DatasetId, DEFAULT_SEGMENT_GAP};
use gps_tracker_rs::merger::subscribe_inputs;
use gps_tracker_rs::types::TRANSFER_DATA;
use gps_tracker_rs::{Archiver, Config, JsonLinesStore, LogStore, MessageBus, Publisher, StreamMerger};
use serde_json::{json, Value};

// 2024-03-01T12:00:00Z
const T0: f64 = 1_709_294_400.0;

fn publish(bus: &MessageBus, topic: &str, data: Value) {
    bus.publish(topic, &data.to_string());
}

#[tokio::test]
async fn test_merge_persist_and_archive() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.merger.read_cpu_temperature = false;
    config.storage.live_dir = dir.path().join("live");
    config.storage.archive_dir = dir.path().join("archive");

    let store = JsonLinesStore::open(&config.storage.live_dir).unwrap();
    let archiver = Archiver::new(store, &config.storage.archive_dir);
    let bus = MessageBus::new();
    let outputs = MessageBus::new();
    let subscription = subscribe_inputs(&bus);
    let mut output = outputs.subscribe([TRANSFER_DATA]);
    let mut merger = StreamMerger::new(&config, archiver, outputs.clone());

    for i in 0..10 {
        let t = T0 + i as f64;
        publish(
            &bus,
            "imu_barometer",
            json!({"i_utc": t - 0.01, "p_utc": t - 0.01, "pressure": 100_000.0 - i as f64,
                   "temperature": 21.0, "raw_acceleration": [0.0, 0.0, 9.81], "gyro": [0.0, 0.0, 0.0]}),
        );
        // walking north, ~5.5 m per fix
        publish(
            &bus,
            "gps",
            json!({"utc": t, "lat": 48.0 + i as f64 * 0.00005, "lon": 11.0, "alt": 520.0,
                   "hdop": 1.1, "mode": 3, "hostname": "rover", "ecefx": 4_000_000.0}),
        );
    }
    publish(&bus, "gps", json!({"lat": 48.0, "lon": 11.0}));
    bus.close();

    let stats = merger.run(subscription, std::future::pending()).await;
    assert_eq!(stats.gps, 11);
    assert_eq!(stats.rejected, 1);

    let mut published = Vec::new();
    while let Some(message) = output.try_recv() {
        published.push(serde_json::from_str::<Value>(&message.data).unwrap());
    }
    assert_eq!(published.len() as u64, stats.accepted);
    assert_eq!(published[0]["my_status"], json!(3));
    // cold start, then every second fix is more than 8 m away
    assert_eq!(published.len(), 5);
    assert!(published.iter().all(|p| p["roll"] == json!(0.0)));
    assert!(published[1]["fused_altitude"].is_number());

    let id: DatasetId = "tracking_rover_20240301".parse().unwrap();
    let archiver = merger.archiver();
    let live = archiver.store().range(&id.key()).unwrap();
    assert_eq!(live.len(), 5);
    assert!(!live[0].contains("ecefx"));

    let outcome = archiver.move_to_archive(&id).unwrap();
    assert!(outcome.deleted);
    assert_eq!(outcome.entries, 5);
    let text = fs::read_to_string(&outcome.path).unwrap();
    let rows: Vec<Value> = serde_json::from_str(&text).unwrap();
    assert_eq!(rows.first().unwrap()["utc"], json!(T0));
    // five accepted fixes 0.0001° apart
    let length = track_length(&rows, DEFAULT_SEGMENT_GAP);
    assert!((length - 4.0 * 0.0001f64.to_radians() * 6_370_000.0).abs() < 0.05);
    assert!(archiver.available_datasets("tracking", "*").unwrap().is_empty());
    assert_eq!(archiver.archived_datasets("tracking", "202403*").unwrap(), vec![id.clone()]);

    // second run is a no-op
    let again = archiver.move_to_archive(&id).unwrap();
    assert!(!again.deleted);
    assert_eq!(fs::read_to_string(&outcome.path).unwrap(), text);
}
