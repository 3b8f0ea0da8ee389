use serde_json::Value;
use std::collections::BTreeMap;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Record};
use tracing::Subscriber;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Field names whose values never reach the output.
pub const REDACTED_FIELDS: [&str; 5] = ["token", "client_token", "password", "secret", "jwt"];
const REDACTED: &str = "<redacted>";

/// Recorded fields of a span or event.
#[derive(Default, Debug, Clone)]
pub struct FieldStorage {
    fields: BTreeMap<&'static str, Value>,
}

impl FieldStorage {
    pub fn values(&self) -> &BTreeMap<&'static str, Value> {
        &self.fields
    }

    pub fn message(&self) -> Option<&str> {
        match self.fields.get("message") {
            Some(Value::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    fn insert(&mut self, field: &Field, value: Value) {
        let name = field.name();
        if REDACTED_FIELDS.contains(&name) {
            self.fields.insert(name, Value::String(REDACTED.to_owned()));
        } else {
            self.fields.insert(name, value);
        }
    }
}

impl Visit for FieldStorage {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.insert(field, Value::String(format!("{:?}", value)));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, Value::String(value.to_owned()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::Number(value.into()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::Bool(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        match serde_json::Number::from_f64(value) {
            Some(number) => self.insert(field, Value::Number(number)),
            None => self.insert(field, Value::String(value.to_string())),
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, Value::String(value.to_string()));
    }
}

/// Layer that stores span fields in extensions for later retrieval
pub struct StorageLayer;

impl<S> Layer<S> for StorageLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &tracing::Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            let mut storage = FieldStorage::default();
            attrs.record(&mut storage);
            span.extensions_mut().insert(storage);
        }
    }

    fn on_record(&self, id: &tracing::Id, values: &Record<'_>, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            if let Some(storage) = span.extensions_mut().get_mut::<FieldStorage>() {
                values.record(storage);
            }
        }
    }
}
