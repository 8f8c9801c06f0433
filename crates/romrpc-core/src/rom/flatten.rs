//! Marshaling between typed [`RomValue`]s and wire JSON.
//!
//! Flattening turns references into their reference strings and structs into
//! name-keyed objects. Unflattening is driven by the declared [`ParamType`]
//! and resolves reference strings back through a [`ReferenceResolver`].
//!
//! A scalar target that receives an object or an array is coerced: an
//! object's `value` member wins, otherwise the first property or element is
//! taken and a diagnostic is recorded.

use super::schema::{ParamDecl, ParamType};
use super::value::{ParamMap, RomValue};
use crate::config::ProtocolConfig;
use crate::{Result, RomError};
use serde_json::{Map, Number, Value};
use tracing::warn;

/// Something that flattens to a reference string.
pub trait ObjectRef {
    fn object_ref(&self) -> Result<String>;
}

impl ObjectRef for String {
    fn object_ref(&self) -> Result<String> {
        Ok(self.clone())
    }
}

/// Turns reference strings back into this side's object representation.
pub trait ReferenceResolver {
    type Object;

    fn resolve(&self, reference: &str, type_name: &str) -> Result<Self::Object>;
}

/// Flatten one value against its declared type.
pub fn flatten<R: ObjectRef>(value: &RomValue<R>, ty: &ParamType) -> Result<Value> {
    match value {
        RomValue::Null => Ok(Value::Null),
        RomValue::Bool(b) => Ok(Value::Bool(*b)),
        RomValue::Int(i) => Ok(Value::from(*i)),
        RomValue::Float(f) => Number::from_f64(*f)
            .map(Value::Number)
            .ok_or_else(|| RomError::protocol(format!("{} cannot be sent on the wire", f))),
        RomValue::String(s) => Ok(Value::String(s.clone())),
        RomValue::Enum(constant) => {
            if let ParamType::Enum { name, constants } = ty {
                if !constants.iter().any(|c| c == constant) {
                    return Err(RomError::protocol(format!(
                        "'{}' is not a constant of enum {}",
                        constant, name
                    )));
                }
            }
            Ok(Value::String(constant.clone()))
        }
        RomValue::Object(object) => Ok(Value::String(object.object_ref()?)),
        RomValue::List(items) => {
            let element = match ty {
                ParamType::List(inner) => inner.as_ref(),
                _ => &ParamType::Any,
            };
            items
                .iter()
                .map(|item| flatten(item, element))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array)
        }
        RomValue::Struct(map) => match ty {
            ParamType::Struct(decls) => flatten_params(map, decls),
            _ => {
                let mut out = Map::new();
                for (name, v) in map.iter() {
                    out.insert(name.to_string(), flatten(v, &ParamType::Any)?);
                }
                Ok(Value::Object(out))
            }
        },
    }
}

/// Flatten named parameters into a wire object, in declaration order.
///
/// A missing required parameter or an undeclared name is a protocol error.
pub fn flatten_params<R: ObjectRef>(params: &ParamMap<R>, decls: &[ParamDecl]) -> Result<Value> {
    for (name, _) in params.iter() {
        if !decls.iter().any(|d| d.name == name) {
            return Err(RomError::protocol(format!("undeclared parameter '{}'", name)));
        }
    }

    let mut out = Map::new();
    for decl in decls {
        match params.get(&decl.name) {
            Some(RomValue::Null) | None if decl.optional => {}
            Some(RomValue::Null) | None => {
                return Err(RomError::protocol(format!(
                    "missing required parameter '{}'",
                    decl.name
                )));
            }
            Some(value) => {
                out.insert(decl.name.clone(), flatten(value, &decl.ty)?);
            }
        }
    }
    Ok(Value::Object(out))
}

/// Unflattens wire values and collects leniency diagnostics.
pub struct Unflattener<'a, X: ReferenceResolver> {
    resolver: &'a X,
    diagnostics: Vec<String>,
}

impl<'a, X: ReferenceResolver> Unflattener<'a, X> {
    pub fn new(resolver: &'a X) -> Self {
        Self {
            resolver,
            diagnostics: Vec::new(),
        }
    }

    /// Shape coercions applied so far.
    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    pub fn into_diagnostics(self) -> Vec<String> {
        self.diagnostics
    }

    pub fn unflatten(&mut self, value: &Value, ty: &ParamType) -> Result<RomValue<X::Object>> {
        match ty {
            ParamType::Void => return Ok(RomValue::Null),
            ParamType::Any => return Ok(any_value(value)),
            _ => {}
        }
        if value.is_null() {
            return Ok(RomValue::Null);
        }

        if ty.is_scalar() {
            if let Some(picked) = self.pick_scalar(value, ty)? {
                return self.unflatten(picked, ty);
            }
        }

        match (ty, value) {
            (ParamType::Boolean, Value::Bool(b)) => Ok(RomValue::Bool(*b)),
            (ParamType::Integer, Value::Number(n)) => integer(n)
                .map(RomValue::Int)
                .ok_or_else(|| mismatch(ty, value)),
            (ParamType::Float, Value::Number(n)) => n
                .as_f64()
                .map(RomValue::Float)
                .ok_or_else(|| mismatch(ty, value)),
            (ParamType::String, Value::String(s)) => Ok(RomValue::String(s.clone())),
            (ParamType::Enum { name, constants }, Value::String(s)) => {
                if constants.iter().any(|c| c == s) {
                    Ok(RomValue::Enum(s.clone()))
                } else {
                    Err(RomError::protocol(format!(
                        "'{}' is not a constant of enum {}",
                        s, name
                    )))
                }
            }
            (ParamType::RemoteObject(type_name), Value::String(reference)) => self
                .resolver
                .resolve(reference, type_name)
                .map(RomValue::Object),
            (ParamType::List(inner), Value::Array(items)) => items
                .iter()
                .map(|item| self.unflatten(item, inner))
                .collect::<Result<Vec<_>>>()
                .map(RomValue::List),
            (ParamType::Struct(decls), Value::Object(_)) => self
                .unflatten_params(Some(value), decls)
                .map(RomValue::Struct),
            _ => Err(mismatch(ty, value)),
        }
    }

    /// Unflatten a wire params object against declared parameters.
    ///
    /// Absent params read as an empty object. Missing optional parameters are
    /// left out of the map; undeclared names are ignored with a diagnostic.
    pub fn unflatten_params(
        &mut self,
        value: Option<&Value>,
        decls: &[ParamDecl],
    ) -> Result<ParamMap<X::Object>> {
        let empty = Map::new();
        let object = match value {
            None | Some(Value::Null) => &empty,
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(RomError::protocol(format!(
                    "parameters must be an object, got {}",
                    json_kind(other)
                )))
            }
        };

        let mut params = ParamMap::new();
        for decl in decls {
            match object.get(&decl.name) {
                None | Some(Value::Null) if decl.optional => {}
                None | Some(Value::Null) => {
                    return Err(RomError::protocol(format!(
                        "missing required parameter '{}'",
                        decl.name
                    )));
                }
                Some(v) => {
                    let typed = self.unflatten(v, &decl.ty)?;
                    params.insert(decl.name.clone(), typed);
                }
            }
        }

        for name in object.keys() {
            if !decls.iter().any(|d| d.name == *name) {
                self.note(format!("ignored undeclared parameter '{}'", name));
            }
        }
        Ok(params)
    }

    /// For a scalar target, choose which member of a compound wire value to
    /// read. Returns `None` when the value is already scalar.
    fn pick_scalar<'v>(&mut self, value: &'v Value, ty: &ParamType) -> Result<Option<&'v Value>> {
        match value {
            Value::Object(map) => {
                if let Some(inner) = map.get(ProtocolConfig::VALUE_PROPERTY) {
                    return Ok(Some(inner));
                }
                let (name, first) = map.iter().next().ok_or_else(|| {
                    RomError::protocol(format!("empty object where {} expected", ty.describe()))
                })?;
                self.note(format!(
                    "coerced object with {} properties to {} using '{}'",
                    map.len(),
                    ty.describe(),
                    name
                ));
                Ok(Some(first))
            }
            Value::Array(items) => {
                let first = items.first().ok_or_else(|| {
                    RomError::protocol(format!("empty array where {} expected", ty.describe()))
                })?;
                self.note(format!(
                    "coerced array of {} elements to {} using the first",
                    items.len(),
                    ty.describe()
                ));
                Ok(Some(first))
            }
            _ => Ok(None),
        }
    }

    fn note(&mut self, diagnostic: String) {
        warn!("Unflatten leniency: {}", diagnostic);
        self.diagnostics.push(diagnostic);
    }
}

fn integer(n: &Number) -> Option<i64> {
    n.as_i64().or_else(|| {
        n.as_f64()
            .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
            .map(|f| f as i64)
    })
}

fn any_value<R>(value: &Value) -> RomValue<R> {
    match value {
        Value::Null => RomValue::Null,
        Value::Bool(b) => RomValue::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => RomValue::Int(i),
            None => RomValue::Float(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => RomValue::String(s.clone()),
        Value::Array(items) => RomValue::List(items.iter().map(any_value).collect()),
        Value::Object(map) => RomValue::Struct(
            map.iter()
                .map(|(k, v)| (k.clone(), any_value(v)))
                .collect(),
        ),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn mismatch(ty: &ParamType, value: &Value) -> RomError {
    RomError::protocol(format!(
        "expected {}, got {}",
        ty.describe(),
        json_kind(value)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Hands out one shared handle per reference string.
    #[derive(Default)]
    struct Table {
        objects: Mutex<HashMap<String, Arc<String>>>,
    }

    impl ReferenceResolver for Table {
        type Object = Arc<String>;

        fn resolve(&self, reference: &str, _type_name: &str) -> Result<Arc<String>> {
            let mut objects = self.objects.lock().unwrap();
            Ok(objects
                .entry(reference.to_string())
                .or_insert_with(|| Arc::new(reference.to_string()))
                .clone())
        }
    }

    impl ObjectRef for Arc<String> {
        fn object_ref(&self) -> Result<String> {
            Ok(self.as_ref().clone())
        }
    }

    fn state() -> ParamType {
        ParamType::enumeration("State", ["PLAYING", "PAUSED"])
    }

    #[test]
    fn test_flatten_nested_references_and_lists() {
        let table = Table::default();
        let a = table.resolve("a_Element", "Element").unwrap();
        let b = table.resolve("b_Element", "Element").unwrap();

        let params: ParamMap<Arc<String>> = ParamMap::new()
            .with("sink", RomValue::Object(a.clone()))
            .with(
                "chain",
                RomValue::List(vec![RomValue::Object(a), RomValue::Object(b)]),
            )
            .with("state", RomValue::enumeration("PAUSED"));
        let decls = vec![
            ParamDecl::required("sink", ParamType::object("Element")),
            ParamDecl::required("chain", ParamType::list(ParamType::object("Element"))),
            ParamDecl::required("state", state()),
            ParamDecl::optional("label", ParamType::String),
        ];

        let wire = flatten_params(&params, &decls).unwrap();
        assert_eq!(
            wire,
            json!({
                "sink": "a_Element",
                "chain": ["a_Element", "b_Element"],
                "state": "PAUSED"
            })
        );

        let mut un = Unflattener::new(&table);
        let back = un.unflatten_params(Some(&wire), &decls).unwrap();
        assert_eq!(back, params);
        assert!(un.diagnostics().is_empty());

        // Same reference string, same handle.
        let again = un.unflatten(&json!("a_Element"), &ParamType::object("Element")).unwrap();
        assert!(Arc::ptr_eq(
            again.as_object().unwrap(),
            back.object("sink").unwrap()
        ));
    }

    #[test]
    fn test_missing_required_parameter() {
        let decls = vec![ParamDecl::required("color", ParamType::String)];
        let empty: ParamMap<String> = ParamMap::new();
        assert!(matches!(
            flatten_params(&empty, &decls),
            Err(RomError::Protocol { .. })
        ));

        let table = Table::default();
        let mut un = Unflattener::new(&table);
        assert!(matches!(
            un.unflatten_params(Some(&json!({})), &decls),
            Err(RomError::Protocol { .. })
        ));
    }

    #[test]
    fn test_undeclared_parameter_is_rejected_on_flatten() {
        let params: ParamMap<String> = ParamMap::new().with("colour", "red");
        let decls = vec![ParamDecl::optional("color", ParamType::String)];
        assert!(flatten_params(&params, &decls).is_err());
    }

    #[test]
    fn test_unknown_enum_constant() {
        let v: RomValue<String> = RomValue::enumeration("STOPPED");
        assert!(matches!(flatten(&v, &state()), Err(RomError::Protocol { .. })));

        let table = Table::default();
        let mut un = Unflattener::new(&table);
        assert!(matches!(
            un.unflatten(&json!("STOPPED"), &state()),
            Err(RomError::Protocol { .. })
        ));
    }

    #[test]
    fn test_value_member_wins_without_diagnostic() {
        let table = Table::default();
        let mut un = Unflattener::new(&table);
        let v = un
            .unflatten(&json!({"value": true}), &ParamType::Boolean)
            .unwrap();
        assert_eq!(v, RomValue::Bool(true));
        assert!(un.diagnostics().is_empty());
    }

    #[test]
    fn test_first_property_and_element_leniency() {
        let table = Table::default();
        let mut un = Unflattener::new(&table);

        let v = un
            .unflatten(&json!({"width": 640, "height": 480}), &ParamType::Integer)
            .unwrap();
        assert_eq!(v, RomValue::Int(640));

        let v = un
            .unflatten(&json!(["first", "second"]), &ParamType::String)
            .unwrap();
        assert_eq!(v, RomValue::String("first".into()));

        assert_eq!(un.diagnostics().len(), 2);
        assert!(un.diagnostics()[0].contains("width"));
    }

    #[test]
    fn test_empty_compound_for_scalar_is_an_error() {
        let table = Table::default();
        let mut un = Unflattener::new(&table);
        assert!(un.unflatten(&json!({}), &ParamType::Integer).is_err());
        assert!(un.unflatten(&json!([]), &ParamType::Integer).is_err());
    }

    #[test]
    fn test_type_mismatch() {
        let table = Table::default();
        let mut un = Unflattener::new(&table);
        assert!(un.unflatten(&json!("yes"), &ParamType::Boolean).is_err());
        assert!(un.unflatten(&json!(1.5), &ParamType::Integer).is_err());
        assert_eq!(
            un.unflatten(&json!(2.0), &ParamType::Integer).unwrap(),
            RomValue::Int(2)
        );
        assert!(un
            .unflatten(&json!("x"), &ParamType::list(ParamType::String))
            .is_err());
    }

    #[test]
    fn test_undeclared_wire_parameter_is_ignored() {
        let table = Table::default();
        let mut un = Unflattener::new(&table);
        let params = un
            .unflatten_params(
                Some(&json!({"color": "red", "legacy": 1})),
                &[ParamDecl::required("color", ParamType::String)],
            )
            .unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(un.diagnostics().len(), 1);
    }

    #[test]
    fn test_void_and_any() {
        let table = Table::default();
        let mut un = Unflattener::new(&table);
        assert_eq!(
            un.unflatten(&json!({"ignored": 1}), &ParamType::Void).unwrap(),
            RomValue::Null
        );
        let any = un.unflatten(&json!({"n": [1, 2.5]}), &ParamType::Any).unwrap();
        let list = any.as_struct().unwrap().list("n").unwrap();
        assert_eq!(list[0], RomValue::Int(1));
        assert_eq!(list[1], RomValue::Float(2.5));
    }

    #[test]
    fn test_non_finite_float_is_rejected() {
        let v: RomValue<String> = RomValue::Float(f64::NAN);
        assert!(flatten(&v, &ParamType::Float).is_err());
    }
}
