//! Camserver command table and property declarations.
//!
//! Context tags used by the server:
//!
//! | Context | Replies to                                   |
//! |---------|----------------------------------------------|
//! | 5       | `Df` (free disk space, kB)                   |
//! | 7       | exposure completion (asynchronous)           |
//! | 10      | `imgpath`                                    |
//! | 13      | `K` (kill exposure)                          |
//! | 15      | settings and exposure start                  |
//! | 24      | `version`                                    |
//! | 215     | `THread` (temperature/humidity telemetry)    |

use regex::Regex;
use saxs_core::protocol::line::{
    CommandSpec, CommandTable, Envelope, FieldType, ReplyPattern, Status,
};
use saxs_core::{Category, PropertySpec, Value, ValueKind};
use std::collections::HashMap;
use std::time::Duration;

/// Context of exposure-completion messages.
pub const CONTEXT_EXPOSURE_DONE: u32 = 7;

/// Format of the exposure start timestamp.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Gain names accepted by `SetThreshold`.
pub const GAINS: &[&str] = &["lowG", "midG", "highG", "uhighG"];

/// Any `ERR` reply on `context` carries the server's complaint.
fn error_reply(context: u32) -> Result<ReplyPattern, regex::Error> {
    Ok(ReplyPattern::new(context, r"(?s)^(?P<error>.*)$")?.with_status(Status::Err))
}

/// Build the camserver command table.
pub fn command_table() -> Result<CommandTable, regex::Error> {
    let mut telemetry_fields = HashMap::new();
    telemetry_fields.insert("channel".to_string(), FieldType::Int);
    telemetry_fields.insert("temperature".to_string(), FieldType::Float);
    telemetry_fields.insert("humidity".to_string(), FieldType::Float);

    Ok(CommandTable::new(Envelope::ContextStatus)
        .with(
            CommandSpec::new("version")
                .reply(ReplyPattern::new(24, r"^Code release:\s*(?P<version>\S.*)$")?)
                .reply(error_reply(24)?),
        )
        .with(
            CommandSpec::new("ExpTime")
                .reply(ReplyPattern::new(
                    15,
                    r"^Exposure time set to: (?P<exptime>[\d.]+) sec\.?$",
                )?)
                .reply(error_reply(15)?)
                .field("exptime", FieldType::Float),
        )
        .with(
            CommandSpec::new("ExpPeriod")
                .reply(ReplyPattern::new(
                    15,
                    r"^Exposure period set to: (?P<expperiod>[\d.]+) sec\.?$",
                )?)
                .reply(error_reply(15)?)
                .field("expperiod", FieldType::Float),
        )
        .with(
            CommandSpec::new("NImages")
                .reply(ReplyPattern::new(15, r"^N images set to: (?P<nimages>\d+)$")?)
                .reply(error_reply(15)?)
                .field("nimages", FieldType::Int),
        )
        .with(
            CommandSpec::new("Exposure")
                .reply(ReplyPattern::new(
                    15,
                    r"^Starting (?P<exptime>[\d.]+) second background: (?P<starttime>\S+)$",
                )?)
                .reply(
                    ReplyPattern::new(CONTEXT_EXPOSURE_DONE, r"^(?P<lastimage>/\S+)$")?
                        .with_status(Status::Ok),
                )
                .reply(error_reply(15)?)
                .reply(error_reply(CONTEXT_EXPOSURE_DONE)?)
                .field("exptime", FieldType::Float)
                .field("starttime", FieldType::Timestamp(TIMESTAMP_FORMAT.to_string())),
        )
        .with(
            CommandSpec::new("SetThreshold")
                .reply(ReplyPattern::new(
                    15,
                    r"^Settings: (?P<gain>\w+) gain; threshold: (?P<threshold>\d+) eV",
                )?)
                .reply(
                    ReplyPattern::new(15, r"^/tmp/setthreshold\.cmd$")?
                        .default_value("gain", "unchanged")
                        .default_value("threshold", -1i64),
                )
                .reply(
                    ReplyPattern::new(15, r"^Threshold has not been set")?
                        .default_value("gain", "unset")
                        .default_value("threshold", -1i64),
                )
                .reply(error_reply(15)?)
                .field("threshold", FieldType::Int),
        )
        .with(
            CommandSpec::new("THread")
                .reply(ReplyPattern::new(215, r"(?s)^(?P<channels>.*Channel.*)$")?)
                .reply(error_reply(215)?)
                .field(
                    "channels",
                    FieldType::List {
                        item: Regex::new(
                            r"Channel (?P<channel>\d+): Temperature = (?P<temperature>-?[\d.]+)C, Rel\. Humidity = (?P<humidity>[\d.]+)%",
                        )?,
                        fields: telemetry_fields,
                    },
                ),
        )
        .with(
            CommandSpec::new("imgpath")
                .reply(ReplyPattern::new(10, r"^(?P<imgpath>/\S*)$")?)
                .reply(error_reply(10)?),
        )
        .with(
            CommandSpec::new("Df")
                .reply(ReplyPattern::new(5, r"^(?P<diskfree>\d+)$")?)
                .reply(error_reply(5)?)
                .field("diskfree", FieldType::Int),
        )
        .with(
            CommandSpec::new("K")
                .reply(ReplyPattern::new(13, r"^kill$")?)
                .reply(error_reply(13)?),
        ))
}

/// Command that refreshes `property`, if any.
pub fn refresh_command(property: &str) -> Option<&'static str> {
    match property {
        "version" => Some("version"),
        "exptime" => Some("ExpTime"),
        "expperiod" => Some("ExpPeriod"),
        "nimages" => Some("NImages"),
        "threshold" | "gain" => Some("SetThreshold"),
        "imgpath" => Some("imgpath"),
        "diskfree" => Some("Df"),
        p if p.starts_with("temperature") || p.starts_with("humidity") => Some("THread"),
        _ => None,
    }
}

fn bands(value: &Value, warning: f64, error: f64) -> Category {
    match value.as_f64() {
        Some(v) if v >= error => Category::Error,
        Some(v) if v >= warning => Category::Warning,
        Some(_) => Category::Ok,
        None => Category::Unknown,
    }
}

/// Static property table.
pub fn properties(
    telemetry_channels: u32,
    telemetry_interval: Duration,
    diskfree_interval: Duration,
) -> Vec<PropertySpec> {
    let mut specs = vec![
        PropertySpec::new("version", ValueKind::Text),
        PropertySpec::new("exptime", ValueKind::Float),
        PropertySpec::new("expperiod", ValueKind::Float),
        PropertySpec::new("nimages", ValueKind::Int),
        PropertySpec::new("threshold", ValueKind::Int),
        PropertySpec::new("gain", ValueKind::Text),
        PropertySpec::new("imgpath", ValueKind::Text),
        PropertySpec::new("lastimage", ValueKind::Text),
        PropertySpec::new("starttime", ValueKind::Timestamp),
        PropertySpec::new("diskfree", ValueKind::Int)
            .refresh_every(diskfree_interval)
            .stale_after(Duration::from_secs(2))
            .categorize_with(|v| match v.as_int() {
                Some(kb) if kb < 1_000_000 => Category::Error,
                Some(kb) if kb < 5_000_000 => Category::Warning,
                Some(_) => Category::Ok,
                None => Category::Unknown,
            }),
    ];
    for channel in 0..telemetry_channels {
        specs.push(
            PropertySpec::new(format!("temperature{channel}"), ValueKind::Float)
                .refresh_every(telemetry_interval)
                .stale_after(Duration::from_secs(2))
                .categorize_with(|v| bands(v, 35.0, 40.0)),
        );
        specs.push(
            PropertySpec::new(format!("humidity{channel}"), ValueKind::Float)
                .refresh_every(telemetry_interval)
                .stale_after(Duration::from_secs(2))
                .categorize_with(|v| bands(v, 30.0, 50.0)),
        );
    }
    specs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_builds() {
        let table = command_table().unwrap();
        for name in ["version", "ExpTime", "Exposure", "THread", "Df", "K"] {
            assert!(table.get(name).is_some(), "{name} missing");
        }
    }

    #[test]
    fn test_version_reply() {
        let table = command_table().unwrap();
        let reply = table
            .dispatch("24 OK Code release:  tvx-7.3.13-121212", Some("version"))
            .unwrap()
            .unwrap();
        assert_eq!(reply.text("version"), Some("tvx-7.3.13-121212"));
    }

    #[test]
    fn test_error_reply_is_recognised() {
        let table = command_table().unwrap();
        let reply = table
            .dispatch("15 ERR Illegal exposure time", Some("ExpTime"))
            .unwrap()
            .unwrap();
        assert_eq!(reply.status, Status::Err);
        assert_eq!(reply.text("error"), Some("Illegal exposure time"));
    }

    #[test]
    fn test_exposure_start_and_completion() {
        let table = command_table().unwrap();
        let start = table
            .dispatch(
                "15 OK  Starting 10.000000 second background: 2024-03-01T12:00:00.123",
                Some("Exposure"),
            )
            .unwrap()
            .unwrap();
        assert_eq!(start.float("exptime"), Some(10.0));
        assert!(matches!(start.fields["starttime"], Value::Timestamp(_)));

        let done = table.dispatch("7 OK /data/sample_0001.tif", None).unwrap().unwrap();
        assert_eq!(done.command, "Exposure");
        assert_eq!(done.text("lastimage"), Some("/data/sample_0001.tif"));

        let killed = table.dispatch("7 ERR kill", None).unwrap().unwrap();
        assert_eq!(killed.command, "Exposure");
        assert_eq!(killed.status, Status::Err);
    }

    #[test]
    fn test_telemetry_list() {
        let table = command_table().unwrap();
        let reply = table
            .dispatch(
                "215 OK Channel 0: Temperature = 24.3C, Rel. Humidity = 5.2%\nChannel 1: Temperature = 25.1C, Rel. Humidity = 4.9%\nChannel 2: Temperature = 26.0C, Rel. Humidity = 5.0%",
                Some("THread"),
            )
            .unwrap()
            .unwrap();
        let Some(Value::List(channels)) = reply.fields.get("channels") else {
            panic!("expected a list");
        };
        assert_eq!(channels.len(), 3);
        assert_eq!(channels[1]["temperature"], Value::Float(25.1));
        assert_eq!(channels[2]["channel"], Value::Int(2));
    }

    #[test]
    fn test_refresh_commands() {
        assert_eq!(refresh_command("gain"), Some("SetThreshold"));
        assert_eq!(refresh_command("humidity2"), Some("THread"));
        assert_eq!(refresh_command("lastimage"), None);
    }

    #[test]
    fn test_property_categories() {
        let specs = properties(1, Duration::from_secs(5), Duration::from_secs(30));
        let humidity = specs.iter().find(|s| s.name() == "humidity0").unwrap();
        assert_eq!(humidity.categorize(&Value::Float(12.0)), Category::Ok);
        assert_eq!(humidity.categorize(&Value::Float(35.0)), Category::Warning);
        let disk = specs.iter().find(|s| s.name() == "diskfree").unwrap();
        assert_eq!(disk.categorize(&Value::Int(500_000)), Category::Error);
    }
}
