use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use crate::core::{ArcStr, Dynamic};
use crate::error::JobError;
use crate::slug::{Fingerprint, Slug, join};
use crate::task::Job;

/// Everything that flows through the scheduler: job inputs, handler results
/// and settled outputs.
///
/// The variant decides how [`Cx::run`](crate::Cx::run) treats a value: jobs
/// are executed, deferred values are awaited and processed again, and
/// everything else passes through unchanged.
#[derive(Clone, Debug)]
pub enum Value {
    /// Absent result.
    Void,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(ArcStr),
    List(Arc<Vec<Value>>),
    /// A plain keyed structure.
    Map(Arc<BTreeMap<String, Value>>),
    /// An unevaluated job descriptor.
    Job(Job),
    /// A pending result produced outside of the scheduler.
    Deferred(Deferred),
    /// A value overlaid with the fingerprint of the job that produced it.
    Stamped(Stamped),
    /// An opaque value with an identity of its own.
    Entity(Entity),
}

impl Value {
    /// Wraps a future; the scheduler awaits it and processes its result.
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Value::Deferred(Deferred::new(future))
    }

    pub fn list<I>(items: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        Value::List(Arc::new(items.into_iter().map(Into::into).collect()))
    }

    pub fn map<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Map(Arc::new(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    /// Overlays `slug` on this value without touching the original.
    ///
    /// Stamping an already stamped value replaces the overlay, the
    /// underlying value stays shared.
    pub fn stamp(self, slug: Slug) -> Self {
        let original = match self {
            Value::Stamped(stamped) => stamped.0.0.clone(),
            other => other,
        };
        Value::Stamped(Stamped(Arc::new((original, slug))))
    }

    /// The value underneath any fingerprint overlay.
    pub fn unstamped(&self) -> &Value {
        match self {
            Value::Stamped(stamped) => stamped.value(),
            other => other,
        }
    }

    /// The fingerprint this value carries as its own identity, if any.
    ///
    /// Plain data has none: its fingerprint is simply derived from its
    /// content.
    pub fn carried_fingerprint(&self) -> Option<Slug> {
        match self {
            Value::Job(job) => Some(job.fingerprint()),
            Value::Stamped(stamped) => Some(stamped.slug().clone()),
            Value::Entity(entity) => Some(entity.slug().clone()),
            _ => None,
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self.unstamped(), Value::Void)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.unstamped() {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.unstamped() {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self.unstamped() {
            Value::Float(value) => Some(*value),
            Value::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.unstamped() {
            Value::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self.unstamped() {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self.unstamped() {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&Entity> {
        match self.unstamped() {
            Value::Entity(entity) => Some(entity),
            _ => None,
        }
    }

    pub fn as_job(&self) -> Option<&Job> {
        match self {
            Value::Job(job) => Some(job),
            _ => None,
        }
    }

    /// Field lookup on a keyed structure, seen through any overlay.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|map| map.get(key))
    }
}

impl Fingerprint for Value {
    fn fingerprint(&self) -> Slug {
        match self {
            Value::Void => Slug::new("void"),
            Value::Bool(value) => value.fingerprint(),
            Value::Int(value) => value.fingerprint(),
            Value::Float(value) => value.fingerprint(),
            Value::Str(value) => Slug::new(value.clone()),
            Value::List(items) => Slug::list(items.iter()),
            Value::Map(map) => {
                let parts: Vec<_> = map
                    .iter()
                    .map(|(key, value)| Slug::new(format!("{key}:{}", value.fingerprint())))
                    .collect();
                Slug::new(format!("{{{}}}", join(&parts)))
            }
            Value::Job(job) => job.fingerprint(),
            Value::Deferred(deferred) => deferred.fingerprint(),
            Value::Stamped(stamped) => stamped.slug().clone(),
            Value::Entity(entity) => entity.slug().clone(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Void, Value::Void) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Job(a), Value::Job(b)) => a.fingerprint() == b.fingerprint(),
            (Value::Deferred(a), Value::Deferred(b)) => a.id == b.id,
            (Value::Stamped(a), Value::Stamped(b)) => {
                a.slug() == b.slug() && a.value() == b.value()
            }
            (Value::Entity(a), Value::Entity(b)) => a.slug() == b.slug(),
            _ => false,
        }
    }
}

/// A value overlaid with a fingerprint.
///
/// The original value is shared, not copied; accessors on [`Value`] look
/// through the overlay.
#[derive(Clone)]
pub struct Stamped(Arc<(Value, Slug)>);

impl Stamped {
    pub fn value(&self) -> &Value {
        &self.0.0
    }

    pub fn slug(&self) -> &Slug {
        &self.0.1
    }
}

impl Debug for Stamped {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Stamped")
            .field(self.slug())
            .field(self.value())
            .finish()
    }
}

/// An opaque value identified by its fingerprint, optionally carrying a
/// type-erased payload (a semaphore, a file handle, parsed content...).
#[derive(Clone)]
pub struct Entity {
    slug: Slug,
    payload: Option<Dynamic>,
}

impl Entity {
    pub fn new(slug: Slug) -> Self {
        Self {
            slug,
            payload: None,
        }
    }

    pub fn with_payload<T>(slug: Slug, payload: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self {
            slug,
            payload: Some(Arc::new(payload)),
        }
    }

    pub fn slug(&self) -> &Slug {
        &self.slug
    }

    /// Dereferences the payload as `T`.
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.as_ref()?.downcast_ref::<T>()
    }

    /// Shares the payload as `T`.
    pub fn payload_arc<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.payload.clone()?.downcast::<T>().ok()
    }
}

impl Debug for Entity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("slug", &self.slug)
            .field("payload", &self.payload.is_some())
            .finish()
    }
}

impl Fingerprint for Entity {
    fn fingerprint(&self) -> Slug {
        self.slug.clone()
    }
}

pub(crate) type Outcome = Result<Value, JobError>;

static NEXT_DEFERRED: AtomicU64 = AtomicU64::new(0);

/// A pending value produced outside of the scheduler.
///
/// Clones share both the underlying future and the fingerprint
/// `deferred#N`, so the future runs at most once.
#[derive(Clone)]
pub struct Deferred {
    id: u64,
    future: Shared<BoxFuture<'static, Outcome>>,
}

impl Deferred {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            id: NEXT_DEFERRED.fetch_add(1, Ordering::Relaxed),
            future: future.map(|res| res.map_err(JobError::from)).boxed().shared(),
        }
    }

    pub(crate) fn resolve(&self) -> Shared<BoxFuture<'static, Outcome>> {
        self.future.clone()
    }
}

impl Debug for Deferred {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Deferred(#{})", self.id)
    }
}

impl Fingerprint for Deferred {
    fn fingerprint(&self) -> Slug {
        Slug::new(format!("deferred#{}", self.id))
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Void
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

macro_rules! impl_from_int {
    ($($T:ty),*) => {
        $(
            impl From<$T> for Value {
                fn from(value: $T) -> Self {
                    Value::Int(value as i64)
                }
            }
        )*
    };
}

impl_from_int!(i32, i64, u32, usize);

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.into())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value.into())
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(Arc::new(value))
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Value::Map(Arc::new(value))
    }
}

impl From<Job> for Value {
    fn from(value: Job) -> Self {
        Value::Job(value)
    }
}

impl From<Entity> for Value {
    fn from(value: Entity) -> Self {
        Value::Entity(value)
    }
}

impl From<Deferred> for Value {
    fn from(value: Deferred) -> Self {
        Value::Deferred(value)
    }
}

/// A bare fingerprint becomes an entity with no payload.
impl From<Slug> for Value {
    fn from(value: Slug) -> Self {
        Value::Entity(Entity::new(value))
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value as Json;

        match value {
            Json::Null => Value::Void,
            Json::Bool(value) => Value::Bool(value),
            Json::Number(number) => match number.as_i64() {
                Some(int) => Value::Int(int),
                None => number.as_f64().map_or(Value::Void, Value::Float),
            },
            Json::String(value) => Value::from(value),
            Json::Array(items) => Value::list(items),
            Json::Object(map) => Value::map(map.into_iter().map(|(k, v)| (k, Value::from(v)))),
        }
    }
}

impl Value {
    /// Plain JSON view of this value. Values with an identity of their own
    /// are rendered as their fingerprint.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;

        match self {
            Value::Void => Json::Null,
            Value::Bool(value) => Json::Bool(*value),
            Value::Int(value) => Json::from(*value),
            Value::Float(value) => Json::from(*value),
            Value::Str(value) => Json::from(value.as_ref()),
            Value::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => Json::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
            Value::Stamped(stamped) => stamped.value().to_json(),
            Value::Job(_) | Value::Deferred(_) | Value::Entity(_) => {
                Json::String(self.fingerprint().key().to_string())
            }
        }
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Void, Into::into)
    }
}
