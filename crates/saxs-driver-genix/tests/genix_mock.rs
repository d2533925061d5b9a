//! Generator driver against a simulated register-bus controller.
//!
//! Run with: `cargo test -p saxs-driver-genix --test genix_mock`

use parking_lot::Mutex;
use saxs_core::testing::{serve_modbus, MockConnector, ModbusImage};
use saxs_core::{
    Category, ConnectionConfig, ConnectionStatus, CoreError, Event, Instrument, InstrumentContext,
    Marshaler, RunLoop, Value,
};
use saxs_driver_genix::registers::{command, STATUS_FLAGS, STATUS_START};
use saxs_driver_genix::{GeneratorState, GenixDriver, GenixSettings};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    driver: Arc<GenixDriver>,
    image: Arc<Mutex<ModbusImage>>,
    run_loop: RunLoop,
}

fn set_flags(image: &mut ModbusImage, set: &[&str]) {
    for (i, name) in STATUS_FLAGS.iter().enumerate() {
        image.coils[usize::from(STATUS_START) + i] = set.contains(name);
    }
}

fn coil(image: &Mutex<ModbusImage>, index: u16) -> bool {
    image.lock().coils[usize::from(index)]
}

/// Generator at full power, remote mode, all interlocks fine.
fn running() -> ModbusImage {
    let mut image = ModbusImage {
        input_registers: vec![0; 64],
        coils: vec![false; 300],
    };
    image.input_registers[50] = 5000;
    image.input_registers[51] = 60;
    image.input_registers[54] = 3150;
    image.input_registers[55] = 1234;
    set_flags(
        &mut image,
        &[
            "remote_mode",
            "xrays_on",
            "shutter_closed",
            "interlock_ok",
            "vacuum_ok",
            "water_flow_ok",
            "tube_temperature_ok",
            "distributor_ok",
            "tube_power_ok",
        ],
    );
    image
}

fn start(image: ModbusImage, settings: GenixSettings) -> Harness {
    let (marshaler, run_loop) = Marshaler::channel();
    let connector = Arc::new(MockConnector::new());
    let image = Arc::new(Mutex::new(image));
    serve_modbus(connector.add_device(), image.clone());

    let mut config = ConnectionConfig::new("genix:502");
    config.read_timeout = Duration::from_millis(300);
    let ctx = InstrumentContext {
        name: "genix".into(),
        connection: config,
        connector,
        marshaler,
    };
    Harness {
        driver: GenixDriver::new(ctx, settings),
        image,
        run_loop,
    }
}

#[tokio::test]
async fn test_connect_publishes_flags_and_state() {
    let h = start(running(), GenixSettings::default());
    h.driver.connect().await.unwrap();
    assert_eq!(h.driver.status(), ConnectionStatus::Idle);

    let interlock = h.driver.cache().peek("interlock_ok").unwrap();
    assert_eq!(interlock.value, Some(Value::Bool(true)));
    assert_eq!(interlock.category, Category::Ok);

    assert_eq!(h.driver.state().await.unwrap(), GeneratorState::Idle);
    assert_eq!(
        h.driver.get("state").await.value,
        Some(Value::Text("Idle".into()))
    );
    assert_eq!(h.driver.get("ht").await.value, Some(Value::Float(50.0)));
    assert_eq!(h.driver.get("current").await.value, Some(Value::Float(0.6)));
    assert_eq!(h.driver.get("tube_time").await.value, Some(Value::Int(1234)));
}

#[tokio::test]
async fn test_local_mode_is_refused() {
    let mut image = running();
    set_flags(&mut image, &["xrays_on", "interlock_ok"]);
    let h = start(image, GenixSettings::default());
    let err = h.driver.connect().await.unwrap_err();
    assert!(err.to_string().contains("local mode"), "{err}");
    assert_eq!(h.driver.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_shutter_commands_pulse_their_coils() {
    let h = start(running(), GenixSettings::default());
    h.driver.connect().await.unwrap();

    h.driver.open_shutter().await.unwrap();
    assert!(coil(&h.image, command::SHUTTER_OPEN));

    h.driver.set("shutter_open", Value::Bool(false)).await.unwrap();
    assert!(coil(&h.image, command::SHUTTER_CLOSE));

    let err = h.driver.set("shutter_open", Value::Int(1)).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_broken_interlock_blocks_shutter() {
    let mut image = running();
    set_flags(&mut image, &["remote_mode", "xrays_on", "shutter_closed"]);
    let h = start(image, GenixSettings::default());
    h.driver.connect().await.unwrap();

    let err = h.driver.open_shutter().await.unwrap_err();
    assert!(matches!(err, CoreError::DeviceRejected { .. }));
    assert!(!coil(&h.image, command::SHUTTER_OPEN));
    assert_eq!(
        h.driver.cache().peek("interlock_ok").unwrap().category,
        Category::Error
    );
}

#[tokio::test]
async fn test_power_down_reaching_zero_reads_as_xrays_off() {
    let h = start(running(), GenixSettings::default());
    h.driver.connect().await.unwrap();

    {
        let mut image = h.image.lock();
        set_flags(&mut image, &["remote_mode", "xrays_on", "powering_down", "interlock_ok"]);
        image.input_registers[50] = 1200;
        image.input_registers[51] = 10;
    }
    assert_eq!(h.driver.state().await.unwrap(), GeneratorState::PoweringDown);

    {
        let mut image = h.image.lock();
        image.input_registers[50] = 0;
        image.input_registers[51] = 0;
    }
    assert_eq!(h.driver.state().await.unwrap(), GeneratorState::XRaysOff);
    assert_eq!(
        h.driver.cache().peek("state").and_then(|r| r.value),
        Some(Value::Text("X-rays off".into()))
    );
}

#[tokio::test]
async fn test_fault_raises_property_error() {
    let mut h = start(running(), GenixSettings::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    h.driver.notifier().subscribe(move |e| sink.lock().push(e.clone()));
    h.driver.connect().await.unwrap();

    {
        let mut image = h.image.lock();
        image.coils[usize::from(STATUS_START) + 15] = true;
    }
    h.driver.read_status().await.unwrap();
    h.run_loop.dispatch_pending().await;

    let events = seen.lock().clone();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::PropertyError { name, .. } if name == "fault")));
}

#[tokio::test]
async fn test_disconnect_closes_open_shutter() {
    let mut image = running();
    set_flags(
        &mut image,
        &["remote_mode", "xrays_on", "shutter_open", "interlock_ok"],
    );
    let h = start(image, GenixSettings::default());
    h.driver.connect().await.unwrap();
    h.driver.disconnect(true).await.unwrap();
    assert!(coil(&h.image, command::SHUTTER_CLOSE));
    assert_eq!(h.driver.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_disconnect_leaves_shutter_when_configured() {
    let mut image = running();
    set_flags(&mut image, &["remote_mode", "xrays_on", "shutter_open"]);
    let settings = GenixSettings {
        close_shutter_on_disconnect: false,
        ..GenixSettings::default()
    };
    let h = start(image, settings);
    h.driver.connect().await.unwrap();
    h.driver.disconnect(true).await.unwrap();
    assert!(!coil(&h.image, command::SHUTTER_CLOSE));
}
