//! A small tree resolution driver.
//!
//! The driver walks a [`Selection`] tree, asking each object to resolve the
//! fields selected on it. Sibling fields and list items are resolved
//! concurrently within a single task, so resolvers that load through the same
//! [`Loader`] before suspending on their handles end up in the same window.

use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    sync::Arc,
};

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::{
    batch::Loader,
    error::Error,
    registry::{Pass, Registry},
};

/// One selected field, with its arguments and the fields selected beneath it.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    name: String,
    args: Map<String, Value>,
    children: Vec<Selection>,
}

impl Selection {
    pub fn field(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Map::new(),
            children: Vec::new(),
        }
    }

    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }

    pub fn select(mut self, children: impl IntoIterator<Item = Selection>) -> Self {
        self.children.extend(children);
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn children(&self) -> &[Selection] {
        &self.children
    }

    /// Decode the argument `name`.
    pub fn parse_arg<T: DeserializeOwned>(&self, name: &str) -> Result<T, Error> {
        let value = self.args.get(name).ok_or_else(|| Error::InvalidArgument {
            field: self.name.clone(),
            reason: format!("missing argument `{}`", name),
        })?;

        T::deserialize(value).map_err(|err| Error::InvalidArgument {
            field: self.name.clone(),
            reason: format!("argument `{}`: {}", name, err),
        })
    }
}

/// The result of resolving one field.
pub enum Resolved {
    Null,
    Value(Value),
    Object(Box<dyn Resolve>),
    List(Vec<Resolved>),
}

impl Resolved {
    pub fn value(value: impl Into<Value>) -> Self {
        Resolved::Value(value.into())
    }

    pub fn object(object: impl Resolve + 'static) -> Self {
        Resolved::Object(Box::new(object))
    }

    /// `Null` if `object` is `None`.
    pub fn optional<T: Resolve + 'static>(object: Option<T>) -> Self {
        object.map_or(Resolved::Null, Resolved::object)
    }

    pub fn list<T: Resolve + 'static>(objects: impl IntoIterator<Item = T>) -> Self {
        Resolved::List(objects.into_iter().map(Resolved::object).collect())
    }
}

impl Debug for Resolved {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Resolved::Null => f.write_str("Null"),
            Resolved::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Resolved::Object(object) => write!(f, "Object({})", object.type_name()),
            Resolved::List(items) => f.debug_tuple("List").field(items).finish(),
        }
    }
}

/// The capability every object type in a schema provides: resolve one of its
/// fields by name.
#[async_trait]
pub trait Resolve: Send + Sync {
    fn type_name(&self) -> &'static str;

    async fn resolve(&self, ctx: &Context, field: &Selection) -> Result<Resolved, Error>;
}

/// The field set of every object type, declared once.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    types: HashMap<&'static str, &'static [&'static str]>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(mut self, type_name: &'static str, fields: &'static [&'static str]) -> Self {
        self.types.insert(type_name, fields);
        self
    }

    pub fn fields(&self, type_name: &str) -> &'static [&'static str] {
        self.types.get(type_name).copied().unwrap_or_default()
    }

    pub fn has_field(&self, type_name: &str, field: &str) -> bool {
        self.fields(type_name).contains(&field)
    }
}

/// Everything a resolver can reach during one pass. Created once per request
/// and never mutated afterwards; clones share the same registry.
#[derive(Debug, Clone)]
pub struct Context {
    registry: Arc<Registry>,
    schema: Arc<Schema>,
}

impl Context {
    pub fn new(registry: Registry, schema: Arc<Schema>) -> Self {
        Self {
            registry: Arc::new(registry),
            schema,
        }
    }

    #[inline]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[inline]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    #[inline]
    pub fn pass(&self) -> &Pass {
        self.registry.pass()
    }

    /// Get the loader for a relation.
    pub fn loader<V: Clone + Send + Sync + 'static>(&self, relation: &str) -> Result<Arc<Loader<V>>, Error> {
        Ok(self.registry.get(relation)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

/// A field that failed to resolve. The field is `null` in the response data.
#[derive(Debug, Clone, Serialize)]
pub struct FieldError {
    pub message: String,
    pub path: Vec<PathSegment>,

    #[serde(skip)]
    pub error: Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub data: Value,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<FieldError>,
}

impl Response {
    /// Follow a path of object keys and array indexes into `data`.
    pub fn pointer(&self, pointer: &str) -> Option<&Value> {
        self.data.pointer(pointer)
    }
}

/// Resolve `selections` against `root`. Field errors don't abort the pass:
/// the failing field is reported in [`Response::errors`] and set to `null`.
pub async fn execute(ctx: &Context, root: &dyn Resolve, selections: &[Selection]) -> Response {
    let errors = Mutex::new(Vec::new());
    let walker = Walker {
        ctx,
        errors: &errors,
    };

    let data = walker.object(root, selections, Vec::new()).await;

    Response {
        data,
        errors: errors.into_inner(),
    }
}

struct Walker<'a> {
    ctx: &'a Context,
    errors: &'a Mutex<Vec<FieldError>>,
}

impl<'a> Walker<'a> {
    fn object<'b>(
        &'b self,
        object: &'b dyn Resolve,
        selections: &'b [Selection],
        path: Vec<PathSegment>,
    ) -> BoxFuture<'b, Value> {
        async move {
            let fields = selections.iter().map(|selection| {
                let mut path = path.clone();
                path.push(PathSegment::Field(selection.name.clone()));
                self.field(object, selection, path)
            });

            let values = join_all(fields).await;

            Value::Object(
                selections
                    .iter()
                    .map(|selection| selection.name.clone())
                    .zip(values)
                    .collect(),
            )
        }
        .boxed()
    }

    async fn field(&self, object: &dyn Resolve, selection: &Selection, path: Vec<PathSegment>) -> Value {
        let result = match self.admit(object, selection) {
            Ok(()) => object.resolve(self.ctx, selection).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(resolved) => self.complete(resolved, selection, path).await,
            Err(err) => {
                self.report(err, path);
                Value::Null
            }
        }
    }

    /// Check that a field may be resolved at all, before calling its resolver.
    fn admit(&self, object: &dyn Resolve, selection: &Selection) -> Result<(), Error> {
        self.ctx.pass().check()?;

        match self.ctx.schema().has_field(object.type_name(), selection.name()) {
            true => Ok(()),
            false => Err(Error::UnknownField {
                type_name: object.type_name(),
                field: selection.name.clone(),
            }),
        }
    }

    fn complete<'b>(&'b self, resolved: Resolved, selection: &'b Selection, path: Vec<PathSegment>) -> BoxFuture<'b, Value> {
        async move {
            match resolved {
                Resolved::Null => Value::Null,
                Resolved::Value(value) => value,
                Resolved::Object(object) => self.object(&*object, selection.children(), path).await,
                Resolved::List(items) => {
                    let items = items.into_iter().enumerate().map(|(index, item)| {
                        let mut path = path.clone();
                        path.push(PathSegment::Index(index));
                        self.complete(item, selection, path)
                    });

                    Value::Array(join_all(items).await)
                }
            }
        }
        .boxed()
    }

    fn report(&self, error: Error, path: Vec<PathSegment>) {
        debug!(?path, %error, "field failed");

        self.errors.lock().push(FieldError {
            message: error.to_string(),
            path,
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Catalog;
    use futures::executor;
    use serde_json::json;

    struct Point {
        x: i64,
    }

    #[async_trait]
    impl Resolve for Point {
        fn type_name(&self) -> &'static str {
            "Point"
        }

        async fn resolve(&self, _ctx: &Context, field: &Selection) -> Result<Resolved, Error> {
            match field.name() {
                "x" => Ok(Resolved::value(self.x)),
                "next" => Ok(Resolved::object(Point { x: self.x + 1 })),
                "range" => {
                    let len: usize = field.parse_arg("len")?;
                    Ok(Resolved::list((0..len as i64).map(|x| Point { x })))
                }
                _ => Err(Error::UnknownField {
                    type_name: "Point",
                    field: field.name().to_owned(),
                }),
            }
        }
    }

    fn context() -> Context {
        let schema = Schema::new().object("Point", &["x", "next", "range"]);
        Context::new(Catalog::default().create(), Arc::new(schema))
    }

    #[test]
    fn resolves_nested_objects_and_lists() {
        let ctx = context();
        let selections = vec![
            Selection::field("x"),
            Selection::field("next").select([Selection::field("next").select([Selection::field("x")])]),
            Selection::field("range").arg("len", 2).select([Selection::field("x")]),
        ];

        let response = executor::block_on(execute(&ctx, &Point { x: 1 }, &selections));

        assert!(response.errors.is_empty());
        assert_eq!(
            response.data,
            json!({
                "x": 1,
                "next": { "next": { "x": 3 } },
                "range": [{ "x": 0 }, { "x": 1 }],
            })
        );
    }

    #[test]
    fn field_errors_are_reported_in_place() {
        let ctx = context();
        let selections = vec![
            Selection::field("x"),
            Selection::field("y"),
            Selection::field("range").select([Selection::field("x")]),
        ];

        let response = executor::block_on(execute(&ctx, &Point { x: 1 }, &selections));

        assert_eq!(response.data, json!({ "x": 1, "y": null, "range": null }));
        assert_eq!(response.errors.len(), 2);
        assert!(matches!(response.errors[0].error, Error::UnknownField { .. }));
        assert_eq!(response.errors[0].path, [PathSegment::Field("y".to_owned())]);
        assert!(matches!(response.errors[1].error, Error::InvalidArgument { .. }));
    }

    #[test]
    fn cancelled_pass_fails_fast() {
        let ctx = context();
        ctx.pass().cancel();

        let response = executor::block_on(execute(&ctx, &Point { x: 1 }, &[Selection::field("x")]));

        assert_eq!(response.data, json!({ "x": null }));
        assert!(matches!(response.errors[0].error, Error::RequestCancelled));
    }
}
