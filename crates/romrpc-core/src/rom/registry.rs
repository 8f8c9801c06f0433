//! Server-side type registry.
//!
//! The embedding application registers each remote type once at startup: a
//! constructor, a method table and the events it can raise, each with a
//! declared parameter schema. Instances are stored type-erased and
//! downcast back to their concrete type when a method runs.

use super::events::EventEmitter;
use super::flatten::ObjectRef;
use super::schema::{EventSchema, MethodSchema, ParamDecl, RemoteClassSchema, SchemaSet};
use super::value::{ParamMap, RomValue};
use crate::{Result, RomError};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Typed value on the server side.
pub type ServerValue = RomValue<ObjectHandle>;
/// Named parameters on the server side.
pub type ServerParams = ParamMap<ObjectHandle>;

type Instance = Arc<dyn Any + Send + Sync>;
type ConstructorFn = Arc<dyn Fn(ServerParams, &ObjectContext) -> Result<Instance> + Send + Sync>;
type MethodFn = Arc<dyn Fn(&ObjectHandle, ServerParams) -> Result<ServerValue> + Send + Sync>;

/// A live server-side object and its reference.
#[derive(Clone)]
pub struct ObjectHandle {
    reference: String,
    type_name: String,
    instance: Instance,
}

impl ObjectHandle {
    pub(crate) fn new(reference: String, type_name: String, instance: Instance) -> Self {
        Self {
            reference,
            type_name,
            instance,
        }
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The concrete object, if it is a `T`.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Result<Arc<T>> {
        self.instance.clone().downcast::<T>().map_err(|_| {
            RomError::protocol(format!(
                "object {} is not a {}",
                self.reference,
                std::any::type_name::<T>()
            ))
        })
    }
}

impl ObjectRef for ObjectHandle {
    fn object_ref(&self) -> Result<String> {
        Ok(self.reference.clone())
    }
}

impl PartialEq for ObjectHandle {
    fn eq(&self, other: &Self) -> bool {
        self.reference == other.reference
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("reference", &self.reference)
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// What a constructor knows about the object it is building.
pub struct ObjectContext {
    pub(crate) reference: String,
    pub(crate) session_id: String,
    pub(crate) emitter: EventEmitter,
}

impl ObjectContext {
    /// The reference the new object will be stored under.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// The session that asked for the object.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Emitter bound to the new object. Keep it to raise events later.
    pub fn emitter(&self) -> EventEmitter {
        self.emitter.clone()
    }
}

/// One registered type: its schema plus the erased constructor and methods.
pub struct RemoteClass {
    schema: RemoteClassSchema,
    constructor: Option<ConstructorFn>,
    methods: HashMap<String, MethodFn>,
}

impl RemoteClass {
    pub fn schema(&self) -> &RemoteClassSchema {
        &self.schema
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub(crate) fn construct(&self, params: ServerParams, ctx: &ObjectContext) -> Result<Instance> {
        let constructor = self.constructor.as_ref().ok_or_else(|| {
            RomError::protocol(format!("type {} cannot be created", self.schema.name))
        })?;
        constructor(params, ctx)
    }

    pub(crate) fn method(&self, name: &str) -> Result<(&MethodSchema, &MethodFn)> {
        match (self.schema.method(name), self.methods.get(name)) {
            (Some(schema), Some(f)) => Ok((schema, f)),
            _ => Err(RomError::method_not_found(&self.schema.name, name)),
        }
    }
}

/// Declares one remote type for [`TypeRegistry::register`].
pub struct ClassBuilder {
    schema: RemoteClassSchema,
    constructor: Option<ConstructorFn>,
    methods: HashMap<String, MethodFn>,
}

impl ClassBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: RemoteClassSchema::new(name),
            constructor: None,
            methods: HashMap::new(),
        }
    }

    pub fn constructor<T, F>(mut self, params: Vec<ParamDecl>, f: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(ServerParams, &ObjectContext) -> Result<T> + Send + Sync + 'static,
    {
        self.schema = self.schema.with_constructor(params);
        self.constructor = Some(Arc::new(move |params: ServerParams, ctx: &ObjectContext| {
            let instance: Instance = Arc::new(f(params, ctx)?);
            Ok(instance)
        }));
        self
    }

    /// Add a method. `T` is the concrete type the constructor produces.
    pub fn method<T, F>(mut self, schema: MethodSchema, f: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&T, ServerParams) -> Result<ServerValue> + Send + Sync + 'static,
    {
        let name = schema.name.clone();
        self.schema = self.schema.with_method(schema);
        self.methods.insert(
            name,
            Arc::new(move |handle: &ObjectHandle, params: ServerParams| {
                let object = handle.downcast::<T>()?;
                f(&object, params)
            }),
        );
        self
    }

    pub fn event(mut self, event: EventSchema) -> Self {
        self.schema = self.schema.with_event(event);
        self
    }

    pub fn factory(mut self, factory: super::schema::FactorySchema) -> Self {
        self.schema = self.schema.with_factory(factory);
        self
    }

    fn build(self) -> RemoteClass {
        RemoteClass {
            schema: self.schema,
            constructor: self.constructor,
            methods: self.methods,
        }
    }
}

/// Type name to registered class.
#[derive(Default)]
pub struct TypeRegistry {
    classes: HashMap<String, Arc<RemoteClass>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type, replacing any earlier registration of the same name.
    pub fn register(&mut self, class: ClassBuilder) -> &mut Self {
        let class = class.build();
        tracing::debug!("Registered remote type {}", class.name());
        self.classes.insert(class.name().to_string(), Arc::new(class));
        self
    }

    pub fn class(&self, name: &str) -> Option<Arc<RemoteClass>> {
        self.classes.get(name).cloned()
    }

    /// The declared schemas, for clients built in the same process.
    pub fn schemas(&self) -> SchemaSet {
        let mut set = SchemaSet::new();
        for class in self.classes.values() {
            set.insert(class.schema.clone());
        }
        set
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rom::schema::ParamType;
    use std::sync::Mutex;

    struct Lamp {
        on: Mutex<bool>,
    }

    fn lamp_class() -> ClassBuilder {
        ClassBuilder::new("Lamp")
            .constructor(vec![ParamDecl::optional("on", ParamType::Boolean)], |params, _ctx| {
                Ok(Lamp {
                    on: Mutex::new(params.bool("on").unwrap_or(false)),
                })
            })
            .method(
                MethodSchema::new("toggle").returns(ParamType::Boolean),
                |lamp: &Lamp, _params| {
                    let mut on = lamp.on.lock().unwrap();
                    *on = !*on;
                    Ok(RomValue::Bool(*on))
                },
            )
    }

    fn context() -> ObjectContext {
        ObjectContext {
            reference: "1_Lamp".into(),
            session_id: "s".into(),
            emitter: EventEmitter::detached("1_Lamp"),
        }
    }

    #[test]
    fn test_construct_and_dispatch() {
        let mut registry = TypeRegistry::new();
        registry.register(lamp_class());
        let class = registry.class("Lamp").unwrap();

        let instance = class.construct(ServerParams::new(), &context()).unwrap();
        let handle = ObjectHandle::new("1_Lamp".into(), "Lamp".into(), instance);

        let (schema, toggle) = class.method("toggle").unwrap();
        assert_eq!(schema.returns, ParamType::Boolean);
        assert_eq!(toggle(&handle, ServerParams::new()).unwrap(), RomValue::Bool(true));
        assert_eq!(toggle(&handle, ServerParams::new()).unwrap(), RomValue::Bool(false));
    }

    #[test]
    fn test_unknown_method_is_server_object_error() {
        let mut registry = TypeRegistry::new();
        registry.register(lamp_class());
        let class = registry.class("Lamp").unwrap();
        match class.method("dim") {
            Err(RomError::ServerObject { message, .. }) => assert!(message.contains("Lamp.dim")),
            other => panic!("Expected ServerObject, got: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_type_without_constructor_cannot_be_created() {
        let mut registry = TypeRegistry::new();
        registry.register(ClassBuilder::new("Clock"));
        let class = registry.class("Clock").unwrap();
        assert!(matches!(
            class.construct(ServerParams::new(), &context()),
            Err(RomError::Protocol { .. })
        ));
    }

    #[test]
    fn test_downcast_to_wrong_type() {
        let handle = ObjectHandle::new("x".into(), "Lamp".into(), Arc::new(5_u32));
        assert!(handle.downcast::<Lamp>().is_err());
        assert_eq!(*handle.downcast::<u32>().unwrap(), 5);
    }

    #[test]
    fn test_schemas_reflect_registrations() {
        let mut registry = TypeRegistry::new();
        registry.register(lamp_class());
        let schemas = registry.schemas();
        assert!(schemas.class("Lamp").unwrap().method("toggle").is_some());
        assert!(schemas.class("Lamp").unwrap().constructor.is_some());
    }
}
