//! Descriptor-driven marshalling of composite records to and from plain JSON
//! trees.
//!
//! Every persisted type implements [`Record`] by listing its fields once, each
//! with an accessor pair and a strategy ([`Scalar`], [`PathStr`],
//! [`PathList`], [`Nested`], [`NestedList`], [`NestedMap`], [`Plain`]). The
//! strategy is part of the field's type, so a list or map of records always
//! names exactly one record type and the compiler checks the pairing.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{AghError, Result};
use crate::fs::{atomic_write_json_pretty, read_json};

/// Semantic type of a declared field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Scalar,
    Path,
    PathList,
    Record(&'static str),
    RecordList(&'static str),
    RecordMap(&'static str),
    Plain,
}

/// A composite type the codec can marshal.
pub trait Record: Default + Sized + 'static {
    /// Name used in error messages and descriptors.
    const NAME: &'static str;

    fn fields() -> Vec<Field<Self>>;

    /// Runs after every field has been decoded.
    fn after_unmarshal(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Encoding rule for one field shape.
pub trait Strategy<T> {
    const KIND: FieldKind;
    fn encode(value: &T) -> Result<Value>;
    fn decode(value: &Value, record: &'static str, field: &str) -> Result<T>;
}

pub struct Scalar;
pub struct PathStr;
pub struct PathList;
pub struct Nested;
pub struct NestedList;
pub struct NestedMap;
pub struct Plain;

fn mismatch(record: &'static str, field: &str, expected: &str, found: &Value) -> AghError {
    AghError::malformed(
        record,
        format!(
            "field `{}` expected {}, found {}",
            field,
            expected,
            value_type_name(found)
        ),
    )
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn serde_encode<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn serde_decode<T: DeserializeOwned>(value: &Value, record: &'static str, field: &str) -> Result<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| AghError::malformed(record, format!("field `{}`: {}", field, e)))
}

impl<T: Serialize + DeserializeOwned> Strategy<T> for Scalar {
    const KIND: FieldKind = FieldKind::Scalar;

    fn encode(value: &T) -> Result<Value> {
        serde_encode(value)
    }

    fn decode(value: &Value, record: &'static str, field: &str) -> Result<T> {
        serde_decode(value, record, field)
    }
}

impl<T: Serialize + DeserializeOwned> Strategy<T> for Plain {
    const KIND: FieldKind = FieldKind::Plain;

    fn encode(value: &T) -> Result<Value> {
        serde_encode(value)
    }

    fn decode(value: &Value, record: &'static str, field: &str) -> Result<T> {
        serde_decode(value, record, field)
    }
}

impl Strategy<PathBuf> for PathStr {
    const KIND: FieldKind = FieldKind::Path;

    fn encode(value: &PathBuf) -> Result<Value> {
        Ok(Value::String(value.to_string_lossy().into_owned()))
    }

    fn decode(value: &Value, record: &'static str, field: &str) -> Result<PathBuf> {
        value
            .as_str()
            .map(PathBuf::from)
            .ok_or_else(|| mismatch(record, field, "a path string", value))
    }
}

impl Strategy<Vec<PathBuf>> for PathList {
    const KIND: FieldKind = FieldKind::PathList;

    fn encode(value: &Vec<PathBuf>) -> Result<Value> {
        value.iter().map(PathStr::encode).collect::<Result<Vec<_>>>().map(Value::Array)
    }

    fn decode(value: &Value, record: &'static str, field: &str) -> Result<Vec<PathBuf>> {
        let items = value
            .as_array()
            .ok_or_else(|| mismatch(record, field, "an array of paths", value))?;
        items
            .iter()
            .map(|item| PathStr::decode(item, record, field))
            .collect()
    }
}

impl<T: Record> Strategy<T> for Nested {
    const KIND: FieldKind = FieldKind::Record(T::NAME);

    fn encode(value: &T) -> Result<Value> {
        marshal(value)
    }

    fn decode(value: &Value, _record: &'static str, _field: &str) -> Result<T> {
        unmarshal(value)
    }
}

impl<T: Record> Strategy<Vec<T>> for NestedList {
    const KIND: FieldKind = FieldKind::RecordList(T::NAME);

    fn encode(value: &Vec<T>) -> Result<Value> {
        value.iter().map(marshal).collect::<Result<Vec<_>>>().map(Value::Array)
    }

    fn decode(value: &Value, record: &'static str, field: &str) -> Result<Vec<T>> {
        let items = value
            .as_array()
            .ok_or_else(|| mismatch(record, field, "an array", value))?;
        items.iter().map(unmarshal).collect()
    }
}

impl<T: Record> Strategy<BTreeMap<String, T>> for NestedMap {
    const KIND: FieldKind = FieldKind::RecordMap(T::NAME);

    fn encode(value: &BTreeMap<String, T>) -> Result<Value> {
        let mut out = Map::new();
        for (key, item) in value {
            out.insert(key.clone(), marshal(item)?);
        }
        Ok(Value::Object(out))
    }

    fn decode(value: &Value, record: &'static str, field: &str) -> Result<BTreeMap<String, T>> {
        let entries = value
            .as_object()
            .ok_or_else(|| mismatch(record, field, "an object", value))?;
        let mut out = BTreeMap::new();
        for (key, item) in entries {
            out.insert(key.clone(), unmarshal(item)?);
        }
        Ok(out)
    }
}

trait Slot<R> {
    fn encode(&self, record: &R) -> Result<Value>;
    fn decode(&self, record: &mut R, field: &str, value: &Value) -> Result<()>;
}

struct Accessor<R, T, S> {
    get: fn(&R) -> &T,
    get_mut: fn(&mut R) -> &mut T,
    _strategy: PhantomData<fn() -> S>,
}

impl<R: Record, T, S: Strategy<T>> Slot<R> for Accessor<R, T, S> {
    fn encode(&self, record: &R) -> Result<Value> {
        S::encode((self.get)(record))
    }

    fn decode(&self, record: &mut R, field: &str, value: &Value) -> Result<()> {
        *(self.get_mut)(record) = S::decode(value, R::NAME, field)?;
        Ok(())
    }
}

/// One entry of a record's descriptor table.
pub struct Field<R> {
    name: &'static str,
    kind: FieldKind,
    required: bool,
    slot: Box<dyn Slot<R>>,
}

impl<R: Record> Field<R> {
    pub fn new<T: 'static, S: Strategy<T> + 'static>(
        name: &'static str,
        get: fn(&R) -> &T,
        get_mut: fn(&mut R) -> &mut T,
    ) -> Self {
        Field {
            name,
            kind: S::KIND,
            required: true,
            slot: Box::new(Accessor::<R, T, S> {
                get,
                get_mut,
                _strategy: PhantomData,
            }),
        }
    }

    pub fn scalar<T: Serialize + DeserializeOwned + 'static>(
        name: &'static str,
        get: fn(&R) -> &T,
        get_mut: fn(&mut R) -> &mut T,
    ) -> Self {
        Self::new::<T, Scalar>(name, get, get_mut)
    }

    pub fn path(
        name: &'static str,
        get: fn(&R) -> &PathBuf,
        get_mut: fn(&mut R) -> &mut PathBuf,
    ) -> Self {
        Self::new::<PathBuf, PathStr>(name, get, get_mut)
    }

    pub fn paths(
        name: &'static str,
        get: fn(&R) -> &Vec<PathBuf>,
        get_mut: fn(&mut R) -> &mut Vec<PathBuf>,
    ) -> Self {
        Self::new::<Vec<PathBuf>, PathList>(name, get, get_mut)
    }

    pub fn record<T: Record>(
        name: &'static str,
        get: fn(&R) -> &T,
        get_mut: fn(&mut R) -> &mut T,
    ) -> Self {
        Self::new::<T, Nested>(name, get, get_mut)
    }

    pub fn record_list<T: Record>(
        name: &'static str,
        get: fn(&R) -> &Vec<T>,
        get_mut: fn(&mut R) -> &mut Vec<T>,
    ) -> Self {
        Self::new::<Vec<T>, NestedList>(name, get, get_mut)
    }

    pub fn record_map<T: Record>(
        name: &'static str,
        get: fn(&R) -> &BTreeMap<String, T>,
        get_mut: fn(&mut R) -> &mut BTreeMap<String, T>,
    ) -> Self {
        Self::new::<BTreeMap<String, T>, NestedMap>(name, get, get_mut)
    }

    pub fn plain<T: Serialize + DeserializeOwned + 'static>(
        name: &'static str,
        get: fn(&R) -> &T,
        get_mut: fn(&mut R) -> &mut T,
    ) -> Self {
        Self::new::<T, Plain>(name, get, get_mut)
    }

    /// Marks the field as optional: absent keys keep the `Default` value.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    pub fn is_required(&self) -> bool {
        self.required
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    pub name: &'static str,
    pub fields: Vec<FieldDescriptor>,
}

pub fn describe<R: Record>() -> TypeDescriptor {
    TypeDescriptor {
        name: R::NAME,
        fields: R::fields()
            .iter()
            .map(|f| FieldDescriptor {
                name: f.name,
                kind: f.kind,
                required: f.required,
            })
            .collect(),
    }
}

pub fn marshal<R: Record>(record: &R) -> Result<Value> {
    let mut out = Map::new();
    for field in R::fields() {
        out.insert(field.name.to_string(), field.slot.encode(record)?);
    }
    Ok(Value::Object(out))
}

pub fn unmarshal<R: Record>(value: &Value) -> Result<R> {
    let object = value.as_object().ok_or_else(|| {
        AghError::malformed(
            R::NAME,
            format!("expected an object, found {}", value_type_name(value)),
        )
    })?;
    let fields = R::fields();
    if let Some(unknown) = object
        .keys()
        .find(|key| !fields.iter().any(|f| f.name == key.as_str()))
    {
        return Err(AghError::malformed(
            R::NAME,
            format!("unknown field `{}`", unknown),
        ));
    }
    let mut record = R::default();
    for field in &fields {
        match object.get(field.name) {
            Some(v) => field.slot.decode(&mut record, field.name, v)?,
            None if field.required => {
                return Err(AghError::malformed(
                    R::NAME,
                    format!("missing required field `{}`", field.name),
                ))
            }
            None => {}
        }
    }
    record.after_unmarshal()?;
    Ok(record)
}

pub fn save<R: Record>(record: &R, path: &Path) -> Result<()> {
    atomic_write_json_pretty(path, &marshal(record)?)
}

pub fn load<R: Record>(path: &Path) -> Result<R> {
    if !path.is_file() {
        return Err(AghError::NotFound(path.display().to_string()));
    }
    unmarshal(&read_json(path)?)
}
