use serde::ser::{SerializeMap, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;
use time::format_description::well_known::Rfc3339;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use crate::storage::FieldStorage;

const TIMESTAMP: &str = "timestamp";
const APPLICATION: &str = "application";
const VERSION: &str = "version";
const HOSTNAME: &str = "hostname";
const LEVEL: &str = "level";
const TARGET: &str = "target";
const MESSAGE: &str = "message";
const FILE: &str = "file";
const LINE: &str = "line";
const SPAN: &str = "span";

const RESERVED_FIELDS: [&str; 10] = [
    TIMESTAMP,
    APPLICATION,
    VERSION,
    HOSTNAME,
    LEVEL,
    TARGET,
    MESSAGE,
    FILE,
    LINE,
    SPAN,
];

/// Writes each event as one JSON object per line.
///
/// Span fields are merged root-to-leaf, so a field set on an inner span
/// shadows the same field on an outer one. Event fields win over both.
pub struct JsonLogLayer<W: for<'a> MakeWriter<'a> + 'static> {
    make_writer: W,
    hostname: String,
    version: String,
    application: String,
}

impl<W: for<'a> MakeWriter<'a> + 'static> JsonLogLayer<W> {
    pub fn new(application: String, version: String, make_writer: W) -> Self {
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        Self::with_hostname(application, version, hostname, make_writer)
    }

    pub fn with_hostname(
        application: String,
        version: String,
        hostname: String,
        make_writer: W,
    ) -> Self {
        Self {
            make_writer,
            hostname,
            version,
            application,
        }
    }

    fn serialize_core_fields(
        &self,
        map_serializer: &mut impl SerializeMap<Error = serde_json::Error>,
        message: &str,
        event: &Event,
    ) -> Result<(), std::io::Error> {
        if let Ok(date) = &time::OffsetDateTime::now_utc().format(&Rfc3339) {
            map_serializer.serialize_entry(TIMESTAMP, date)?;
        }
        map_serializer.serialize_entry(
            LEVEL,
            &event.metadata().level().as_str().to_lowercase(),
        )?;
        map_serializer.serialize_entry(APPLICATION, &self.application)?;
        map_serializer.serialize_entry(VERSION, &self.version)?;
        map_serializer.serialize_entry(HOSTNAME, &self.hostname)?;
        map_serializer.serialize_entry(TARGET, event.metadata().target())?;
        map_serializer.serialize_entry(FILE, &event.metadata().file())?;
        map_serializer.serialize_entry(LINE, &event.metadata().line())?;
        map_serializer.serialize_entry(MESSAGE, &message)?;
        Ok(())
    }

    fn emit(&self, mut buffer: Vec<u8>) -> Result<(), std::io::Error> {
        buffer.write_all(b"\n")?;
        self.make_writer.make_writer().write_all(&buffer)
    }
}

impl<S, W> Layer<S> for JsonLogLayer<W>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'a> MakeWriter<'a> + 'static,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let mut event_fields = FieldStorage::default();
        event.record(&mut event_fields);

        let mut extra: BTreeMap<&'static str, Value> = BTreeMap::new();
        let mut span_name = None;
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope.from_root() {
                span_name = Some(span.name());
                if let Some(storage) = span.extensions().get::<FieldStorage>() {
                    for (key, value) in storage.values() {
                        extra.insert(*key, value.clone());
                    }
                }
            }
        }
        for (key, value) in event_fields.values() {
            extra.insert(*key, value.clone());
        }

        let format = || {
            let mut buffer = Vec::new();

            let mut serializer = serde_json::Serializer::new(&mut buffer);
            let mut map_serializer = serializer.serialize_map(None)?;

            let message = event_fields
                .message()
                .unwrap_or_else(|| event.metadata().target());
            self.serialize_core_fields(&mut map_serializer, message, event)?;
            if let Some(name) = span_name {
                map_serializer.serialize_entry(SPAN, name)?;
            }

            for (key, value) in extra.iter().filter(|(key, _)| !RESERVED_FIELDS.contains(*key)) {
                map_serializer.serialize_entry(key, value)?;
            }

            map_serializer.end()?;
            Ok(buffer)
        };

        let result: std::io::Result<Vec<u8>> = format();
        if let Ok(formatted) = result {
            let _ = self.emit(formatted);
        }
    }
}
