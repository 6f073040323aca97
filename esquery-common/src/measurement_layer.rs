use serde_json::{Map, Value};
use std::{fmt, time::SystemTime};
use tracing::{Subscriber, span};
use tracing_subscriber::{
    Layer,
    fmt::{FmtContext, FormatEvent, FormatFields, format::Writer},
    layer::Context,
    registry::LookupSpan,
};

pub const MEASUREMENT_FIELD: &str = "measurement";
pub const CYCLE_FIELD: &str = "cycle";

/// A tracing layer that propagates the `measurement` and `cycle` fields of pipeline spans down to
/// every child span, so that events emitted deep inside a pipeline can be attributed to it.
#[derive(Default)]
pub struct MeasurementLayer;

impl MeasurementLayer {
    pub fn new() -> Self {
        Self
    }
}

/// Pipeline attribution stored in span extensions.
#[derive(Clone, Debug, Default)]
pub struct PipelineContext {
    pub measurement: Option<String>,
    pub cycle: Option<String>,
}

impl PipelineContext {
    fn is_empty(&self) -> bool {
        self.measurement.is_none() && self.cycle.is_none()
    }

    fn inherit(&mut self, parent: &PipelineContext) {
        if self.measurement.is_none() {
            self.measurement = parent.measurement.clone();
        }
        if self.cycle.is_none() {
            self.cycle = parent.cycle.clone();
        }
    }
}

impl<S> Layer<S> for MeasurementLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };

        let mut context = PipelineContext::default();
        attrs.record(&mut ContextVisitor(&mut context));

        if let Some(parent) = span.parent()
            && let Some(parent_context) = parent.extensions().get::<PipelineContext>()
        {
            context.inherit(parent_context);
        }

        if !context.is_empty() {
            span.extensions_mut().replace(context);
        }
    }
}

struct ContextVisitor<'a>(&'a mut PipelineContext);

impl ContextVisitor<'_> {
    fn set(&mut self, name: &str, value: String) {
        match name {
            MEASUREMENT_FIELD => self.0.measurement = Some(value),
            CYCLE_FIELD => self.0.cycle = Some(value),
            _ => {}
        }
    }
}

impl tracing::field::Visit for ContextVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.set(field.name(), value.to_string());
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.set(field.name(), value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        self.set(field.name(), format!("{value:?}"));
    }
}

/// JSON event formatter that lifts the pipeline attribution of the current span to top-level
/// fields of every log line.
pub struct MeasurementJsonFormat;

impl<S, N> FormatEvent<S, N> for MeasurementJsonFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();
        let mut fields = Map::new();

        fields.insert(
            "timestamp".to_string(),
            Value::String(humantime::format_rfc3339(SystemTime::now()).to_string()),
        );
        fields.insert("level".to_string(), Value::String(meta.level().to_string()));

        if let Some(context) = find_pipeline_context(ctx) {
            if let Some(measurement) = context.measurement {
                fields.insert(MEASUREMENT_FIELD.to_string(), Value::String(measurement));
            }
            if let Some(cycle) = context.cycle {
                fields.insert(CYCLE_FIELD.to_string(), Value::String(cycle));
            }
        }

        event.record(&mut JsonFieldVisitor {
            fields: &mut fields,
        });

        fields.insert(
            "target".to_string(),
            Value::String(meta.target().to_string()),
        );

        let json = serde_json::to_string(&fields).map_err(|_| fmt::Error)?;
        writeln!(writer, "{json}")
    }
}

fn find_pipeline_context<S, N>(ctx: &FmtContext<'_, S, N>) -> Option<PipelineContext>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    let mut span = ctx.lookup_current()?;
    loop {
        if let Some(context) = span.extensions().get::<PipelineContext>() {
            return Some(context.clone());
        }
        span = span.parent()?;
    }
}

struct JsonFieldVisitor<'a> {
    fields: &'a mut Map<String, Value>,
}

impl tracing::field::Visit for JsonFieldVisitor<'_> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        self.fields.insert(
            field.name().to_string(),
            Value::String(format!("{value:?}")),
        );
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.fields
            .insert(field.name().to_string(), Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), Value::Number(value.into()));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), Value::Bool(value));
    }
}
