//! Declared shapes of remote types.
//!
//! Both sides consult the same schema: the server to unflatten arguments and
//! flatten returns, the client to do the reverse. Parameter binding is by
//! name, in declaration order.

use std::collections::HashMap;

/// Shape of a parameter, return value or struct field.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamType {
    /// No value. Only meaningful as a return type.
    Void,
    Boolean,
    Integer,
    Float,
    String,
    Enum {
        name: String,
        constants: Vec<String>,
    },
    /// Reference to a live object of the named type.
    RemoteObject(String),
    List(Box<ParamType>),
    Struct(Vec<ParamDecl>),
    /// Untyped JSON. References are not recognised inside it.
    Any,
}

impl ParamType {
    pub fn enumeration<I, S>(name: impl Into<String>, constants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ParamType::Enum {
            name: name.into(),
            constants: constants.into_iter().map(Into::into).collect(),
        }
    }

    pub fn object(type_name: impl Into<String>) -> Self {
        ParamType::RemoteObject(type_name.into())
    }

    pub fn list(element: ParamType) -> Self {
        ParamType::List(Box::new(element))
    }

    /// Whether a single wire value of this type is a scalar. Scalar targets
    /// are where the unflattener applies its shape leniency.
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            ParamType::Boolean
                | ParamType::Integer
                | ParamType::Float
                | ParamType::String
                | ParamType::Enum { .. }
                | ParamType::RemoteObject(_)
        )
    }

    pub fn describe(&self) -> String {
        match self {
            ParamType::Void => "void".into(),
            ParamType::Boolean => "boolean".into(),
            ParamType::Integer => "integer".into(),
            ParamType::Float => "float".into(),
            ParamType::String => "string".into(),
            ParamType::Enum { name, .. } => format!("enum {}", name),
            ParamType::RemoteObject(t) => format!("reference to {}", t),
            ParamType::List(inner) => format!("list of {}", inner.describe()),
            ParamType::Struct(_) => "struct".into(),
            ParamType::Any => "any".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamDecl {
    pub name: String,
    pub ty: ParamType,
    pub optional: bool,
}

impl ParamDecl {
    pub fn required(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            optional: false,
        }
    }

    pub fn optional(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            optional: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodSchema {
    pub name: String,
    pub params: Vec<ParamDecl>,
    pub returns: ParamType,
}

impl MethodSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            returns: ParamType::Void,
        }
    }

    pub fn param(mut self, decl: ParamDecl) -> Self {
        self.params.push(decl);
        self
    }

    pub fn returns(mut self, ty: ParamType) -> Self {
        self.returns = ty;
        self
    }
}

/// An event a type can raise, with the fields of its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct EventSchema {
    pub name: String,
    pub data: Vec<ParamDecl>,
}

impl EventSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: Vec::new(),
        }
    }

    pub fn field(mut self, decl: ParamDecl) -> Self {
        self.data.push(decl);
        self
    }
}

/// A builder exposed on a parent object that creates `target_type` with the
/// parent passed as `back_ref_param`.
#[derive(Debug, Clone, PartialEq)]
pub struct FactorySchema {
    pub name: String,
    pub target_type: String,
    pub back_ref_param: String,
}

impl FactorySchema {
    pub fn new(
        name: impl Into<String>,
        target_type: impl Into<String>,
        back_ref_param: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target_type: target_type.into(),
            back_ref_param: back_ref_param.into(),
        }
    }
}

/// The declared dispatch table of one remote type.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteClassSchema {
    pub name: String,
    /// `None` when the type cannot be created by clients.
    pub constructor: Option<Vec<ParamDecl>>,
    pub methods: Vec<MethodSchema>,
    pub events: Vec<EventSchema>,
    pub factories: Vec<FactorySchema>,
}

impl RemoteClassSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constructor: None,
            methods: Vec::new(),
            events: Vec::new(),
            factories: Vec::new(),
        }
    }

    pub fn with_constructor(mut self, params: Vec<ParamDecl>) -> Self {
        self.constructor = Some(params);
        self
    }

    pub fn with_method(mut self, method: MethodSchema) -> Self {
        self.methods.retain(|m| m.name != method.name);
        self.methods.push(method);
        self
    }

    pub fn with_event(mut self, event: EventSchema) -> Self {
        self.events.retain(|e| e.name != event.name);
        self.events.push(event);
        self
    }

    pub fn with_factory(mut self, factory: FactorySchema) -> Self {
        self.factories.retain(|f| f.name != factory.name);
        self.factories.push(factory);
        self
    }

    pub fn method(&self, name: &str) -> Option<&MethodSchema> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn event(&self, name: &str) -> Option<&EventSchema> {
        self.events.iter().find(|e| e.name == name)
    }

    pub fn factory(&self, name: &str) -> Option<&FactorySchema> {
        self.factories.iter().find(|f| f.name == name)
    }
}

/// Schemas by type name.
#[derive(Debug, Clone, Default)]
pub struct SchemaSet {
    classes: HashMap<String, RemoteClassSchema>,
}

impl SchemaSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, class: RemoteClassSchema) -> Self {
        self.insert(class);
        self
    }

    pub fn insert(&mut self, class: RemoteClassSchema) {
        self.classes.insert(class.name.clone(), class);
    }

    pub fn class(&self, name: &str) -> Option<&RemoteClassSchema> {
        self.classes.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}
