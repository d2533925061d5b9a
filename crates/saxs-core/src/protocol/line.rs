//! Regex-based command/reply dispatcher for line-oriented ASCII protocols.
//!
//! A [`CommandTable`] maps command names to ordered lists of candidate reply
//! patterns. Every reply shares a common envelope (for the detector server,
//! `<context> <OK|ERR> <body>`); the body is tried against each candidate in
//! declaration order and the **first** structural match wins, so pattern order
//! encodes priority.
//!
//! A pattern's context tag must equal the reply's context. A mismatch is a
//! plain no-match, which is what keeps replies of logically different
//! exchanges sharing one socket apart.
//!
//! Named captures are converted through the command's [`FieldType`] table.
//! Captures absent from a pattern variant take that pattern's defaults.
//!
//! # Example
//!
//! ```rust
//! use saxs_core::protocol::line::{CommandSpec, CommandTable, Envelope, FieldType, ReplyPattern};
//! use saxs_core::value::Value;
//!
//! let table = CommandTable::new(Envelope::ContextStatus).with(
//!     CommandSpec::new("ExpTime")
//!         .reply(ReplyPattern::new(15, r"^Exposure time set to: (?P<exptime>\d+\.\d+) sec\.$").unwrap())
//!         .field("exptime", FieldType::Float),
//! );
//! let reply = table
//!     .dispatch("15 OK Exposure time set to: 10.0000 sec.", Some("ExpTime"))
//!     .unwrap()
//!     .unwrap();
//! assert_eq!(reply.fields["exptime"], Value::Float(10.0));
//! ```

use crate::connection::Match;
use crate::error::ProtocolError;
use crate::value::{Fields, Value};
use chrono::NaiveDateTime;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

const CONTEXT_STATUS_PATTERN: &str =
    r"(?s)^\s*(?P<context>\d+)\s+(?P<status>OK|ERR)\b\s*(?P<body>.*?)\s*$";

static CONTEXT_STATUS: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(CONTEXT_STATUS_PATTERN));

// =============================================================================
// Envelope
// =============================================================================

/// Reply status token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// `OK`
    Ok,
    /// `ERR`
    Err,
}

/// Common framing of every reply body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Envelope {
    /// `<context> <OK|ERR> <body>` (detector server).
    ContextStatus,
    /// The whole message is the body; status is always `Ok`, no context.
    Plain,
}

/// Envelope fields of one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header<'a> {
    /// Numeric context tag, if the envelope carries one.
    pub context: Option<u32>,
    /// Status token.
    pub status: Status,
    /// Remaining body text, trimmed.
    pub body: &'a str,
}

impl Envelope {
    /// Split `raw` into envelope fields and body.
    pub fn parse<'a>(&self, raw: &'a str) -> Result<Header<'a>, ProtocolError> {
        match self {
            Envelope::Plain => Ok(Header {
                context: None,
                status: Status::Ok,
                body: raw.trim(),
            }),
            Envelope::ContextStatus => {
                let envelope = CONTEXT_STATUS
                    .as_ref()
                    .map_err(|e| ProtocolError::Malformed(format!("envelope pattern: {e}")))?;
                let caps = envelope.captures(raw).ok_or_else(|| {
                    ProtocolError::Malformed(format!("missing context/status header: {raw:?}"))
                })?;
                let context = caps["context"].parse::<u32>().map_err(|_| {
                    ProtocolError::Malformed(format!("context tag out of range: {raw:?}"))
                })?;
                let status = if &caps["status"] == "OK" {
                    Status::Ok
                } else {
                    Status::Err
                };
                let body = caps.name("body").map_or("", |m| m.as_str());
                Ok(Header {
                    context: Some(context),
                    status,
                    body,
                })
            }
        }
    }
}

// =============================================================================
// Field types
// =============================================================================

/// Declared type of a named capture.
#[derive(Debug, Clone)]
pub enum FieldType {
    /// Signed integer.
    Int,
    /// Floating point.
    Float,
    /// Text, kept verbatim.
    Text,
    /// Date/time with a `chrono` format string.
    Timestamp(String),
    /// A sub-pattern repeated inside the capture; one map per occurrence.
    List {
        /// Pattern applied repeatedly to the captured span
        item: Regex,
        /// Types of the item pattern's named captures
        fields: HashMap<String, FieldType>,
    },
}

impl FieldType {
    fn label(&self) -> &'static str {
        match self {
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::Text => "string",
            FieldType::Timestamp(_) => "timestamp",
            FieldType::List { .. } => "list",
        }
    }

    /// Convert the raw capture text.
    pub fn convert(&self, field: &str, raw: &str) -> Result<Value, ProtocolError> {
        let bad = || ProtocolError::BadField {
            field: field.to_string(),
            raw: raw.to_string(),
            expected: self.label(),
        };
        match self {
            FieldType::Int => raw.trim().parse::<i64>().map(Value::Int).map_err(|_| bad()),
            FieldType::Float => raw.trim().parse::<f64>().map(Value::Float).map_err(|_| bad()),
            FieldType::Text => Ok(Value::Text(raw.to_string())),
            FieldType::Timestamp(format) => NaiveDateTime::parse_from_str(raw.trim(), format)
                .map(Value::Timestamp)
                .map_err(|_| bad()),
            FieldType::List { item, fields } => {
                let mut items = Vec::new();
                for caps in item.captures_iter(raw) {
                    items.push(convert_captures(item, &caps, fields, &Fields::new())?);
                }
                Ok(Value::List(items))
            }
        }
    }
}

fn convert_captures(
    regex: &Regex,
    caps: &regex::Captures<'_>,
    types: &HashMap<String, FieldType>,
    defaults: &Fields,
) -> Result<Fields, ProtocolError> {
    let mut fields = defaults.clone();
    for name in regex.capture_names().flatten() {
        if let Some(m) = caps.name(name) {
            let value = types
                .get(name)
                .unwrap_or(&FieldType::Text)
                .convert(name, m.as_str())?;
            fields.insert(name.to_string(), value);
        }
    }
    Ok(fields)
}

// =============================================================================
// Reply patterns and commands
// =============================================================================

/// One wording of a reply.
#[derive(Debug, Clone)]
pub struct ReplyPattern {
    context: Option<u32>,
    status: Option<Status>,
    regex: Regex,
    defaults: Fields,
}

impl ReplyPattern {
    /// Pattern expected on `context`. The regex is matched against the body.
    pub fn new(context: u32, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            context: Some(context),
            status: None,
            regex: Regex::new(pattern)?,
            defaults: Fields::new(),
        })
    }

    /// Pattern for envelopes without a context tag.
    pub fn plain(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            context: None,
            status: None,
            regex: Regex::new(pattern)?,
            defaults: Fields::new(),
        })
    }

    /// Only match replies carrying `status`.
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    /// Value for `field` when this wording does not capture it.
    pub fn default_value(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.defaults.insert(field.into(), value.into());
        self
    }

    /// Context tag this pattern belongs to.
    pub fn context(&self) -> Option<u32> {
        self.context
    }

    fn admits(&self, header: &Header<'_>) -> bool {
        if self.context.is_some() && self.context != header.context {
            return false;
        }
        match self.status {
            Some(status) => status == header.status,
            None => true,
        }
    }
}

/// A command and its candidate replies.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    name: String,
    replies: Vec<ReplyPattern>,
    types: HashMap<String, FieldType>,
}

impl CommandSpec {
    /// Command with no reply patterns yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            replies: Vec::new(),
            types: HashMap::new(),
        }
    }

    /// Append a candidate reply. Earlier candidates take priority.
    pub fn reply(mut self, pattern: ReplyPattern) -> Self {
        self.replies.push(pattern);
        self
    }

    /// Declare the type of a named capture. Undeclared captures are text.
    pub fn field(mut self, name: impl Into<String>, kind: FieldType) -> Self {
        self.types.insert(name.into(), kind);
        self
    }

    /// Command name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Candidate reply patterns in priority order.
    pub fn replies(&self) -> &[ReplyPattern] {
        &self.replies
    }

    fn try_match(&self, header: &Header<'_>) -> Result<Option<Fields>, ProtocolError> {
        for pattern in &self.replies {
            if !pattern.admits(header) {
                continue;
            }
            if let Some(caps) = pattern.regex.captures(header.body) {
                return convert_captures(&pattern.regex, &caps, &self.types, &pattern.defaults)
                    .map(Some);
            }
        }
        Ok(None)
    }
}

/// A decoded reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Command whose pattern matched.
    pub command: String,
    /// Context tag of the message.
    pub context: Option<u32>,
    /// Status token.
    pub status: Status,
    /// Typed fields, defaults included.
    pub fields: Fields,
    /// Body text after the envelope.
    pub body: String,
}

impl Reply {
    /// Numeric field as `f64`.
    pub fn float(&self, field: &str) -> Option<f64> {
        self.fields.get(field).and_then(Value::as_f64)
    }

    /// Integer field.
    pub fn int(&self, field: &str) -> Option<i64> {
        self.fields.get(field).and_then(Value::as_int)
    }

    /// Text field.
    pub fn text(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }
}

/// Ordered table of commands sharing one envelope.
#[derive(Debug, Clone)]
pub struct CommandTable {
    envelope: Envelope,
    commands: Vec<CommandSpec>,
}

impl CommandTable {
    /// Empty table.
    pub fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            commands: Vec::new(),
        }
    }

    /// Add a command. Declaration order is the unsolicited search order.
    pub fn with(mut self, command: CommandSpec) -> Self {
        self.commands.push(command);
        self
    }

    /// Look up a command.
    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.iter().find(|c| c.name == name)
    }

    /// Envelope shared by all replies.
    pub fn envelope(&self) -> Envelope {
        self.envelope
    }

    /// Match `raw` against the pending command, or against every command in
    /// declaration order when `pending` is `None`.
    ///
    /// Returns `Ok(None)` on no match (including context mismatch and unknown
    /// pending command names) and an error for a malformed envelope or a
    /// capture that cannot be converted.
    pub fn dispatch(&self, raw: &str, pending: Option<&str>) -> Result<Option<Reply>, ProtocolError> {
        let header = self.envelope.parse(raw)?;
        let candidates: Box<dyn Iterator<Item = &CommandSpec>> = match pending {
            Some(name) => Box::new(self.commands.iter().filter(move |c| c.name == name)),
            None => Box::new(self.commands.iter()),
        };
        for command in candidates {
            if let Some(fields) = command.try_match(&header)? {
                return Ok(Some(Reply {
                    command: command.name.clone(),
                    context: header.context,
                    status: header.status,
                    fields,
                    body: header.body.to_string(),
                }));
            }
        }
        Ok(None)
    }

    /// Matcher for a connection wait: accepts replies to `command`.
    ///
    /// A malformed envelope counts as "not mine" so the message can be tried
    /// by another waiter or reach the unsolicited handler.
    pub fn matcher(table: &Arc<Self>, command: &str) -> impl FnMut(&[u8]) -> Match<Reply> + Send {
        let table = Arc::clone(table);
        let command = command.to_string();
        move |raw: &[u8]| {
            let text = String::from_utf8_lossy(raw);
            match table.dispatch(&text, Some(&command)) {
                Ok(Some(reply)) => Match::Accept(reply),
                Ok(None) | Err(ProtocolError::Malformed(_)) => Match::Reject,
                Err(e) => Match::Fail(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_pattern_compiles() {
        let envelope = CONTEXT_STATUS.as_ref().unwrap();
        assert!(envelope.is_match("7 OK /data/image_0001.tif"));
        assert!(!envelope.is_match("OK without context"));
    }

    fn table() -> CommandTable {
        CommandTable::new(Envelope::ContextStatus)
            .with(
                CommandSpec::new("ExpTime")
                    .reply(
                        ReplyPattern::new(15, r"^Exposure time set to: (?P<exptime>\d+\.\d+) sec\.$")
                            .unwrap(),
                    )
                    .field("exptime", FieldType::Float),
            )
            .with(
                CommandSpec::new("ExposureFinished")
                    .reply(ReplyPattern::new(7, r"^(?P<filename>/\S+)$").unwrap())
                    .field("filename", FieldType::Text),
            )
            .with(
                CommandSpec::new("SetThreshold")
                    .reply(
                        ReplyPattern::new(
                            15,
                            r"^Settings: (?P<gain>\w+) gain; threshold: (?P<threshold>\d+) eV",
                        )
                        .unwrap(),
                    )
                    .reply(
                        ReplyPattern::new(15, r"^/tmp/setthreshold\.cmd$")
                            .unwrap()
                            .default_value("gain", "unchanged")
                            .default_value("threshold", -1i64),
                    )
                    .field("threshold", FieldType::Int),
            )
    }

    #[test]
    fn test_envelope_parsing() {
        let header = Envelope::ContextStatus.parse("15 ERR Illegal value").unwrap();
        assert_eq!(header.context, Some(15));
        assert_eq!(header.status, Status::Err);
        assert_eq!(header.body, "Illegal value");

        assert!(Envelope::ContextStatus.parse("garbage").is_err());
        let plain = Envelope::Plain.parse(" 1.0E-03 \r").unwrap();
        assert_eq!(plain.body, "1.0E-03");
        assert_eq!(plain.context, None);
    }

    #[test]
    fn test_context_mismatch_is_no_match() {
        let t = table();
        let msg = "7 OK Exposure time set to: 1.0000 sec.";
        assert!(t.dispatch(msg, Some("ExpTime")).unwrap().is_none());
    }

    #[test]
    fn test_unsolicited_searches_all_commands() {
        let t = table();
        let reply = t.dispatch("7 OK /data/img_0001.tif", None).unwrap().unwrap();
        assert_eq!(reply.command, "ExposureFinished");
        assert_eq!(reply.text("filename"), Some("/data/img_0001.tif"));
    }

    #[test]
    fn test_defaults_fill_missing_captures() {
        let t = table();
        let reply = t
            .dispatch("15 OK /tmp/setthreshold.cmd", Some("SetThreshold"))
            .unwrap()
            .unwrap();
        assert_eq!(reply.text("gain"), Some("unchanged"));
        assert_eq!(reply.int("threshold"), Some(-1));

        let reply = t
            .dispatch(
                "15 OK Settings: high gain; threshold: 4024 eV; vcmp: 0.654 V",
                Some("SetThreshold"),
            )
            .unwrap()
            .unwrap();
        assert_eq!(reply.text("gain"), Some("high"));
        assert_eq!(reply.int("threshold"), Some(4024));
    }

    #[test]
    fn test_first_match_wins() {
        let t = CommandTable::new(Envelope::Plain).with(
            CommandSpec::new("value")
                .reply(ReplyPattern::plain(r"^(?P<v>\d+)$").unwrap().default_value("kind", "int"))
                .reply(ReplyPattern::plain(r"^(?P<v>[\d.]+)$").unwrap().default_value("kind", "any")),
        );
        let reply = t.dispatch("42", Some("value")).unwrap().unwrap();
        assert_eq!(reply.text("kind"), Some("int"));
        let reply = t.dispatch("4.2", Some("value")).unwrap().unwrap();
        assert_eq!(reply.text("kind"), Some("any"));
    }

    #[test]
    fn test_list_and_timestamp_fields() {
        let item = Regex::new(r"Channel (?P<channel>\d+): Temperature = (?P<temp>[\d.]+)C").unwrap();
        let mut item_types = HashMap::new();
        item_types.insert("channel".to_string(), FieldType::Int);
        item_types.insert("temp".to_string(), FieldType::Float);
        let t = CommandTable::new(Envelope::ContextStatus).with(
            CommandSpec::new("THread")
                .reply(ReplyPattern::new(215, r"(?s)^(?P<channels>.*)$").unwrap())
                .field(
                    "channels",
                    FieldType::List {
                        item,
                        fields: item_types,
                    },
                ),
        );
        let reply = t
            .dispatch(
                "215 OK Channel 0: Temperature = 24.3C, Rel. Humidity = 5.2%\nChannel 1: Temperature = 25.1C, Rel. Humidity = 4.9%",
                None,
            )
            .unwrap()
            .unwrap();
        match &reply.fields["channels"] {
            Value::List(items) => {
                assert_eq!(items.len(), 2);
                assert_eq!(items[1]["channel"], Value::Int(1));
                assert_eq!(items[1]["temp"], Value::Float(25.1));
            }
            other => panic!("expected list, got {other:?}"),
        }

        let ts = FieldType::Timestamp("%Y-%m-%dT%H:%M:%S%.f".into())
            .convert("t", "2013-06-04T10:13:12.123")
            .unwrap();
        assert!(matches!(ts, Value::Timestamp(_)));
    }

    #[test]
    fn test_bad_field_is_error() {
        let t = CommandTable::new(Envelope::Plain).with(
            CommandSpec::new("n")
                .reply(ReplyPattern::plain(r"^(?P<n>\S+)$").unwrap())
                .field("n", FieldType::Int),
        );
        assert!(matches!(
            t.dispatch("abc", Some("n")),
            Err(ProtocolError::BadField { .. })
        ));
    }

    #[test]
    fn test_matcher_rejects_foreign_context() {
        let t = Arc::new(table());
        let mut m = CommandTable::matcher(&t, "ExpTime");
        assert!(matches!(m(b"7 OK /data/x.tif"), Match::Reject));
        assert!(matches!(m(b"not a reply"), Match::Reject));
        assert!(matches!(
            m(b"15 OK Exposure time set to: 10.0000 sec."),
            Match::Accept(_)
        ));
    }
}
