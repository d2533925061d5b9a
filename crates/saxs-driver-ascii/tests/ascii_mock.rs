//! Gauge and circulator drivers against scripted line devices.
//!
//! Run with: `cargo test -p saxs-driver-ascii --test ascii_mock`

use parking_lot::Mutex;
use saxs_core::testing::{MockConnector, MockDevice};
use saxs_core::{
    Category, ConnectionConfig, ConnectionStatus, CoreError, Event, Instrument, InstrumentContext,
    Marshaler, RetryPolicy, RunLoop, Value,
};
use saxs_driver_ascii::{
    CirculatorDriver, CirculatorSettings, GaugeDriver, GaugeSettings,
};
use std::sync::Arc;
use std::time::Duration;

/// Answer every CR-terminated line through `respond`, appending CR LF.
fn serve_lines<F>(device: MockDevice, received: Arc<Mutex<Vec<String>>>, mut respond: F)
where
    F: FnMut(&str) -> Option<String> + Send + 'static,
{
    let mut partial = Vec::new();
    device.serve(move |chunk| {
        partial.extend_from_slice(chunk);
        let mut replies = Vec::new();
        while let Some(end) = partial.iter().position(|b| *b == b'\r') {
            let line: Vec<u8> = partial.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line).trim_end().to_string();
            received.lock().push(line.clone());
            if let Some(reply) = respond(&line) {
                replies.push(format!("{reply}\r\n").into_bytes());
            }
        }
        replies
    });
}

fn context(name: &str, connector: Arc<MockConnector>, marshaler: Marshaler) -> InstrumentContext {
    let mut config = ConnectionConfig::new(format!("{name}:4001"));
    config.read_timeout = Duration::from_millis(300);
    config.retry = RetryPolicy::none();
    InstrumentContext {
        name: name.into(),
        connection: config,
        connector,
        marshaler,
    }
}

// =============================================================================
// Vacuum gauge
// =============================================================================

struct Gauge {
    model: &'static str,
    unit: &'static str,
    reading: Arc<Mutex<String>>,
}

impl Gauge {
    fn respond(&self, line: &str) -> Option<String> {
        Some(match line {
            "001T" => format!("001T {}", self.model),
            "001U" => format!("001U {}", self.unit),
            "001M" => format!("001M{}", self.reading.lock()),
            _ => "NAK1".into(),
        })
    }
}

struct GaugeHarness {
    driver: Arc<GaugeDriver>,
    reading: Arc<Mutex<String>>,
    run_loop: RunLoop,
}

fn gauge(model: &'static str, unit: &'static str) -> GaugeHarness {
    let (marshaler, run_loop) = Marshaler::channel();
    let connector = Arc::new(MockConnector::new());
    let reading = Arc::new(Mutex::new("100020".to_string()));
    let device = Gauge {
        model,
        unit,
        reading: reading.clone(),
    };
    serve_lines(
        connector.add_device(),
        Arc::new(Mutex::new(Vec::new())),
        move |line| device.respond(line),
    );
    let driver = GaugeDriver::new(context("gauge", connector, marshaler), GaugeSettings::default())
        .unwrap();
    GaugeHarness {
        driver,
        reading,
        run_loop,
    }
}

#[tokio::test]
async fn test_gauge_identifies_and_reads_pressure() {
    let h = gauge("TPG201", "mbar");
    h.driver.connect().await.unwrap();
    assert_eq!(h.driver.status(), ConnectionStatus::Idle);
    assert_eq!(
        h.driver.cache().peek("model").and_then(|r| r.value),
        Some(Value::Text("TPG201".into()))
    );

    let pressure = h.driver.pressure().await.unwrap();
    assert!((pressure - 1e-3).abs() < 1e-12);
    let reading = h.driver.cache().peek("pressure").unwrap();
    assert_eq!(reading.category, Category::Ok);
}

#[tokio::test]
async fn test_gauge_refuses_foreign_model_and_wrong_unit() {
    let h = gauge("XGS600", "mbar");
    let err = h.driver.connect().await.unwrap_err();
    assert!(err.to_string().contains("XGS600"), "{err}");

    let h = gauge("TPG201", "Torr");
    let err = h.driver.connect().await.unwrap_err();
    assert!(err.to_string().contains("Torr"), "{err}");
    assert_eq!(h.driver.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_gauge_pressure_thresholds_raise_events() {
    let mut h = gauge("TPG201", "mbar");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    h.driver.notifier().subscribe(move |e| sink.lock().push(e.clone()));
    h.driver.connect().await.unwrap();

    *h.reading.lock() = "500023".into();
    assert_eq!(h.driver.pressure().await.unwrap(), 5.0);
    *h.reading.lock() = "101326".into();
    h.driver.pressure().await.unwrap();
    h.run_loop.dispatch_pending().await;

    let events = seen.lock().clone();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::PropertyWarning { name, .. } if name == "pressure")));
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::PropertyError { name, .. } if name == "pressure")));
}

#[tokio::test]
async fn test_gauge_sensor_status_replaces_reading() {
    let h = gauge("TPG201", "mbar");
    h.driver.connect().await.unwrap();
    *h.reading.lock() = "SE".into();

    let err = h.driver.pressure().await.unwrap_err();
    assert!(matches!(err, CoreError::DeviceRejected { .. }), "{err:?}");
    let sensor = h.driver.cache().peek("sensor").unwrap();
    assert_eq!(sensor.value, Some(Value::Text("sensor error".into())));
    assert_eq!(sensor.category, Category::Error);

    *h.reading.lock() = "OR".into();
    let reading = h.driver.get("sensor").await;
    assert_eq!(reading.value, Some(Value::Text("over range".into())));
    assert_eq!(reading.category, Category::Warning);
}

// =============================================================================
// Circulator
// =============================================================================

#[derive(Default)]
struct Bath {
    temperature: f64,
    setpoint: f64,
    running: bool,
    status: String,
}

impl Bath {
    fn respond(&mut self, line: &str) -> Option<String> {
        let words: Vec<&str> = line.split_whitespace().collect();
        Some(match words.as_slice() {
            ["VER"] => "1P/H 2.05$".into(),
            ["IN", "PV", "1"] => format!("{:.2}$", self.temperature),
            ["IN", "SP", "1"] => format!("{:.2}$", self.setpoint),
            ["OUT", "SP", "1", value] => match value.parse::<f64>() {
                Ok(v) => {
                    self.setpoint = v;
                    "$".into()
                }
                Err(_) => "F123".into(),
            },
            ["IN", "MODE", "5"] => format!("{}$", u8::from(self.running)),
            ["OUT", "MODE", "5", flag] => {
                self.running = *flag == "1";
                "$".into()
            }
            ["IN", "STATUS"] => format!("{}$", self.status),
            _ => "F001".into(),
        })
    }
}

struct BathHarness {
    driver: Arc<CirculatorDriver>,
    bath: Arc<Mutex<Bath>>,
    received: Arc<Mutex<Vec<String>>>,
    _run_loop: RunLoop,
}

fn circulator() -> BathHarness {
    let (marshaler, run_loop) = Marshaler::channel();
    let connector = Arc::new(MockConnector::new());
    let bath = Arc::new(Mutex::new(Bath {
        temperature: 24.9,
        setpoint: 25.0,
        status: "000000".into(),
        ..Bath::default()
    }));
    let received = Arc::new(Mutex::new(Vec::new()));
    let state = bath.clone();
    serve_lines(connector.add_device(), received.clone(), move |line| {
        state.lock().respond(line)
    });
    let driver = CirculatorDriver::new(
        context("bath", connector, marshaler),
        CirculatorSettings::default(),
    )
    .unwrap();
    BathHarness {
        driver,
        bath,
        received,
        _run_loop: run_loop,
    }
}

#[tokio::test]
async fn test_circulator_connect_reads_version_and_setpoint() {
    let h = circulator();
    h.driver.connect().await.unwrap();
    assert_eq!(
        h.driver.cache().peek("version").and_then(|r| r.value),
        Some(Value::Text("1P/H 2.05".into()))
    );
    assert_eq!(
        h.driver.cache().peek("setpoint").and_then(|r| r.value),
        Some(Value::Float(25.0))
    );
    let received = h.received.lock().clone();
    assert_eq!(&received[..2], &["VER".to_string(), "IN SP 1".to_string()]);
}

#[tokio::test]
async fn test_circulator_deviation_follows_setpoint() {
    let h = circulator();
    h.driver.connect().await.unwrap();

    h.driver.temperature().await.unwrap();
    assert_eq!(
        h.driver.cache().peek("deviation").unwrap().category,
        Category::Ok
    );

    h.driver.set("setpoint", Value::Float(40.0)).await.unwrap();
    assert_eq!(h.bath.lock().setpoint, 40.0);
    h.driver.temperature().await.unwrap();
    let deviation = h.driver.cache().peek("deviation").unwrap();
    assert_eq!(deviation.category, Category::Warning);
    assert!(h.received.lock().iter().any(|l| l == "OUT SP 1 40.00"));
}

#[tokio::test]
async fn test_circulator_setpoint_limits_and_refusals() {
    let h = circulator();
    h.driver.connect().await.unwrap();

    let err = h.driver.set_setpoint(150.0).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidArgument(_)));
    assert!(!h.received.lock().iter().any(|l| l.starts_with("OUT SP")));

    let err = h.driver.set("pump", Value::Bool(true)).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_circulator_start_and_alarm() {
    let h = circulator();
    h.driver.connect().await.unwrap();

    h.driver.set("running", Value::Bool(true)).await.unwrap();
    assert!(h.bath.lock().running);
    assert_eq!(
        h.driver.cache().peek("running").and_then(|r| r.value),
        Some(Value::Bool(true))
    );

    assert!(!h.driver.alarm().await.unwrap());
    h.bath.lock().status = "000100".into();
    assert!(h.driver.alarm().await.unwrap());
    assert_eq!(h.driver.cache().peek("alarm").unwrap().category, Category::Error);
}
