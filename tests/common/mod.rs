#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use color_eyre::Result;
use meter_eol::{
    config::Config,
    events::Events,
    jobs::JobRegistry,
    meter::MeterInfo,
    mock::{MockMeter, MockTransport},
    robot::{RobotEventQueue, RobotEvents},
    store::MemoryStore,
};
use serde_json::json;
use tokio::time::timeout;

pub const METER: &str = "10.0.0.1";

pub struct Rig {
    pub registry: JobRegistry,
    pub transport: MockTransport,
    pub meter: Arc<MockMeter>,
    pub store: Arc<MemoryStore>,
    pub robot: Arc<RobotEventQueue>,
}

pub fn config() -> Config {
    Config {
        save_logs: false,
        min_delays: false,
        poll_interval_ms: 5,
        listener_join_timeout_ms: 1000,
        ..Default::default()
    }
}

/// A registry with a single mocked meter, stored under database id 7.
pub fn rig() -> Rig {
    rig_with(MeterInfo::default())
}

/// Like [`rig`], for a meter with the given modules.
pub fn rig_with(info: MeterInfo) -> Rig {
    let transport = MockTransport::new();
    let store = Arc::new(MemoryStore::new());
    let robot = Arc::new(RobotEventQueue::default());
    let meter = Arc::new(MockMeter::new(METER, info).with_db_id(7));

    let registry = JobRegistry::new(
        config(),
        Events::default(),
        store.clone(),
        Arc::new(transport.clone()),
        Some(robot.clone() as Arc<dyn RobotEvents>),
    );
    registry.add_meter(meter.clone());

    Rig {
        registry,
        transport,
        meter,
        store,
        robot,
    }
}

/// A meter with firmware for the given modules, e.g. `PRINTER`.
pub fn meter_info(meter_type: &str, modules: &[&str]) -> MeterInfo {
    MeterInfo {
        meter_type: meter_type.into(),
        firmwares: modules
            .iter()
            .map(|module| (module.to_string(), "1.0".to_string()))
            .collect(),
    }
}

/// A key press as the meter logs it.
pub fn key_press(key: &str) -> String {
    journal(&format!("KEY_PRESSED: {key}, isAutoRepeat=false, from KEY_PAD_2"))
}

/// A journal line as `journalctl -o json` prints it.
pub fn journal(message: &str) -> String {
    json!({"_HOSTNAME": "mock-meter", "MESSAGE": message}).to_string()
}

pub fn kwargs(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("kwargs must be an object, got {other}"),
    }
}

/// Wait for the meter to be ready again, or give up.
pub async fn finish(rig: &Rig) -> Result<()> {
    timeout(Duration::from_secs(10), rig.registry.wait(METER)).await?;
    Ok(())
}
