//! Handler registry
//!
//! Maps `(kind, name)` to a callback plus the descriptor served by discovery. Registration
//! happens on an owned registry before it is shared; once frozen behind an `Arc` it is only
//! ever read, so lookups need no locking.

use std::{collections::HashMap, fmt, future::Future, sync::Arc};

use futures::{future::BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{HandlerError, RpcError};
use crate::mcp::codec::{Kind, Params};
use crate::mcp::connection::ConnectionHandle;

pub type HandlerResult = Result<Value, HandlerError>;
pub type Callback =
    Arc<dyn Fn(Params, ConnectionHandle) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Wraps an async closure into a [`Callback`].
pub fn callback<F, Fut>(handler: F) -> Callback
where
    F: Fn(Params, ConnectionHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |params, connection| handler(params, connection).boxed())
}

/// An invocation whose target no registered handler claimed.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub kind: HandlerKind,
    pub target: String,
    pub params: Params,
}

pub type FallbackCallback =
    Arc<dyn Fn(Invocation, ConnectionHandle) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Wraps an async closure into a [`FallbackCallback`].
pub fn fallback_callback<F, Fut>(handler: F) -> FallbackCallback
where
    F: Fn(Invocation, ConnectionHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |invocation, connection| handler(invocation, connection).boxed())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    Tool,
    Resource,
    Prompt,
}

impl HandlerKind {
    pub fn from_invocation(kind: Kind) -> Option<Self> {
        match kind {
            Kind::ToolCall => Some(Self::Tool),
            Kind::ResourceRead => Some(Self::Resource),
            Kind::PromptGet => Some(Self::Prompt),
            _ => None,
        }
    }

    pub fn from_listing(kind: Kind) -> Option<Self> {
        match kind {
            Kind::ListTools => Some(Self::Tool),
            Kind::ListResources => Some(Self::Resource),
            Kind::ListPrompts => Some(Self::Prompt),
            _ => None,
        }
    }

    pub fn invocation(self) -> Kind {
        match self {
            Self::Tool => Kind::ToolCall,
            Self::Resource => Kind::ResourceRead,
            Self::Prompt => Kind::PromptGet,
        }
    }

    fn default_return_type(self) -> &'static str {
        match self {
            Self::Tool => "object",
            Self::Resource | Self::Prompt => "string",
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tool => "tool",
            Self::Resource => "resource",
            Self::Prompt => "prompt",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "schema")]
    pub parameters: Map<String, Value>,
    #[serde(default, alias = "type")]
    pub return_type: String,
}

/// Resources are listed as `{name, description, schema, type}`.
#[derive(Serialize)]
struct ResourceListing<'a> {
    name: &'a str,
    description: &'a str,
    schema: &'a Map<String, Value>,
    #[serde(rename = "type")]
    resource_type: &'a str,
}

impl<'a> From<&'a Descriptor> for ResourceListing<'a> {
    fn from(descriptor: &'a Descriptor) -> Self {
        Self {
            name: &descriptor.name,
            description: &descriptor.description,
            schema: &descriptor.parameters,
            resource_type: &descriptor.return_type,
        }
    }
}

impl Descriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            parameters: Map::new(),
            return_type: String::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn parameter(
        mut self,
        name: impl Into<String>,
        value_type: &str,
        description: impl Into<String>,
    ) -> Self {
        self.parameters.insert(
            name.into(),
            serde_json::json!({
                "type": value_type,
                "description": description.into(),
            }),
        );
        self
    }

    pub fn return_type(mut self, return_type: impl Into<String>) -> Self {
        self.return_type = return_type.into();
        self
    }
}

impl From<&str> for Descriptor {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Descriptor {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

#[derive(Clone)]
pub struct HandlerEntry {
    pub kind: HandlerKind,
    pub descriptor: Descriptor,
    pub callback: Callback,
}

impl HandlerEntry {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("kind", &self.kind)
            .field("name", &self.descriptor.name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct HandlerRegistry {
    entries: Vec<HandlerEntry>,
    index: HashMap<(HandlerKind, String), usize>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        kind: HandlerKind,
        descriptor: impl Into<Descriptor>,
        callback: Callback,
    ) -> Result<(), RpcError> {
        let mut descriptor = descriptor.into();
        let name = descriptor.name.trim().to_string();
        if name.is_empty() {
            return Err(RpcError::invalid_params(format!(
                "{kind} handler name must not be empty"
            )));
        }

        let key = (kind, name.clone());
        if self.index.contains_key(&key) {
            return Err(RpcError::DuplicateHandler { kind, name });
        }

        descriptor.name = name;
        if descriptor.return_type.is_empty() {
            descriptor.return_type = kind.default_return_type().to_string();
        }

        self.index.insert(key, self.entries.len());
        self.entries.push(HandlerEntry {
            kind,
            descriptor,
            callback,
        });
        Ok(())
    }

    pub fn lookup(&self, kind: HandlerKind, name: &str) -> Result<&HandlerEntry, RpcError> {
        self.index
            .get(&(kind, name.to_string()))
            .map(|position| &self.entries[*position])
            .ok_or_else(|| RpcError::handler_not_found(kind, name))
    }

    /// Names registered for `kind`, in registration order.
    pub fn list(&self, kind: HandlerKind) -> Vec<&str> {
        self.entries_of(kind).map(HandlerEntry::name).collect()
    }

    pub fn descriptors(&self, kind: HandlerKind) -> Vec<Descriptor> {
        self.entries_of(kind)
            .map(|entry| entry.descriptor.clone())
            .collect()
    }

    /// The discovery payload served for `list_*` requests.
    pub fn listing(&self, kind: HandlerKind) -> Result<Value, serde_json::Error> {
        match kind {
            HandlerKind::Resource => serde_json::to_value(
                self.entries_of(kind)
                    .map(|entry| ResourceListing::from(&entry.descriptor))
                    .collect::<Vec<_>>(),
            ),
            HandlerKind::Tool | HandlerKind::Prompt => {
                serde_json::to_value(self.descriptors(kind))
            }
        }
    }

    pub fn count(&self, kind: HandlerKind) -> usize {
        self.entries_of(kind).count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entries_of(&self, kind: HandlerKind) -> impl Iterator<Item = &HandlerEntry> {
        self.entries.iter().filter(move |entry| entry.kind == kind)
    }
}
