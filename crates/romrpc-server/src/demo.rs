//! Demo remote types served by the standalone binary.

use romrpc::rom::{
    ClassBuilder, EventEmitter, EventSchema, FactorySchema, MethodSchema, ObjectHandle, ParamDecl,
    ParamType, RomValue, ServerParams, TypeRegistry,
};
use romrpc::RomError;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, PoisonError};

const PAINTS: [&str; 4] = ["red", "green", "blue", "white"];

struct Widget {
    color: Mutex<String>,
}

impl Widget {
    fn color(&self) -> String {
        self.color
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn paint(&self, color: &str) {
        *self.color.lock().unwrap_or_else(PoisonError::into_inner) = color.to_string();
    }
}

struct Counter {
    count: AtomicI64,
    emitter: EventEmitter,
}

struct Pipeline {
    name: String,
    elements: Mutex<Vec<ObjectHandle>>,
}

struct Element {
    kind: String,
    pipeline: ObjectHandle,
}

fn paint_type() -> ParamType {
    ParamType::enumeration("Paint", PAINTS)
}

/// Registry with `Widget`, `Counter`, `Pipeline` and `Element`.
pub fn registry() -> TypeRegistry {
    let mut registry = TypeRegistry::new();
    registry
        .register(
            ClassBuilder::new("Widget")
                .constructor(
                    vec![ParamDecl::required("color", paint_type())],
                    |params, _| {
                        Ok(Widget {
                            color: Mutex::new(params.str("color")?.to_string()),
                        })
                    },
                )
                .method(
                    MethodSchema::new("paint")
                        .param(ParamDecl::required("color", paint_type()))
                        .returns(ParamType::Boolean),
                    |widget: &Widget, params| {
                        widget.paint(params.str("color")?);
                        Ok(RomValue::Bool(true))
                    },
                )
                .method(
                    MethodSchema::new("color").returns(paint_type()),
                    |widget: &Widget, _| Ok(RomValue::enumeration(widget.color())),
                ),
        )
        .register(
            ClassBuilder::new("Counter")
                .constructor(
                    vec![ParamDecl::optional("start", ParamType::Integer)],
                    |params, ctx| {
                        let start = if params.contains("start") {
                            params.i64("start")?
                        } else {
                            0
                        };
                        Ok(Counter {
                            count: AtomicI64::new(start),
                            emitter: ctx.emitter(),
                        })
                    },
                )
                .method(
                    MethodSchema::new("increment")
                        .param(ParamDecl::optional("by", ParamType::Integer))
                        .returns(ParamType::Integer),
                    |counter: &Counter, params| {
                        let by = if params.contains("by") {
                            params.i64("by")?
                        } else {
                            1
                        };
                        let count = counter.count.fetch_add(by, Ordering::SeqCst) + by;
                        counter
                            .emitter
                            .emit("Changed", ServerParams::new().with("count", count))?;
                        Ok(RomValue::Int(count))
                    },
                )
                .method(
                    MethodSchema::new("value").returns(ParamType::Integer),
                    |counter: &Counter, _| Ok(RomValue::Int(counter.count.load(Ordering::SeqCst))),
                )
                .event(
                    EventSchema::new("Changed")
                        .field(ParamDecl::required("count", ParamType::Integer)),
                ),
        )
        .register(
            ClassBuilder::new("Pipeline")
                .constructor(
                    vec![ParamDecl::required("name", ParamType::String)],
                    |params, _| {
                        Ok(Pipeline {
                            name: params.str("name")?.to_string(),
                            elements: Mutex::new(Vec::new()),
                        })
                    },
                )
                .method(
                    MethodSchema::new("name").returns(ParamType::String),
                    |pipeline: &Pipeline, _| Ok(RomValue::String(pipeline.name.clone())),
                )
                .method(
                    MethodSchema::new("add")
                        .param(ParamDecl::required("element", ParamType::object("Element")))
                        .returns(ParamType::Integer),
                    |pipeline: &Pipeline, params| {
                        let element = params.object("element")?.clone();
                        let mut elements = pipeline
                            .elements
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner);
                        elements.push(element);
                        Ok(RomValue::Int(elements.len() as i64))
                    },
                )
                .method(
                    MethodSchema::new("elements")
                        .returns(ParamType::list(ParamType::object("Element"))),
                    |pipeline: &Pipeline, _| {
                        let elements = pipeline
                            .elements
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner);
                        Ok(RomValue::List(
                            elements.iter().cloned().map(RomValue::Object).collect(),
                        ))
                    },
                )
                .factory(FactorySchema::new("element", "Element", "pipeline")),
        )
        .register(
            ClassBuilder::new("Element")
                .constructor(
                    vec![
                        ParamDecl::required("pipeline", ParamType::object("Pipeline")),
                        ParamDecl::required("kind", ParamType::String),
                    ],
                    |params, _| {
                        let kind = params.str("kind")?;
                        if kind.is_empty() {
                            return Err(RomError::protocol("element kind must not be empty"));
                        }
                        Ok(Element {
                            kind: kind.to_string(),
                            pipeline: params.object("pipeline")?.clone(),
                        })
                    },
                )
                .method(
                    MethodSchema::new("kind").returns(ParamType::String),
                    |element: &Element, _| Ok(RomValue::String(element.kind.clone())),
                )
                .method(
                    MethodSchema::new("pipeline").returns(ParamType::object("Pipeline")),
                    |element: &Element, _| Ok(RomValue::Object(element.pipeline.clone())),
                ),
        );
    registry
}
