#![forbid(unsafe_code)]

pub mod codes;
pub mod framing;

pub use framing::{DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame};

use serde_json::{Map, Value};
use thiserror::Error;

/// Error returned by typed argument accessors on a [`CommandFrame`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArgError {
	#[error("missing argument: {0}")]
	Missing(String),
	#[error("wrong type for argument: {0}")]
	WrongType(String),
}

/// One inbound frame: `{"command": <string>, ...params}`.
///
/// The full object is kept as the body so handlers can pull their own
/// parameters with the typed accessors below.
#[derive(Debug, Clone)]
pub struct CommandFrame {
	pub command: String,
	pub body: Map<String, Value>,
}

impl CommandFrame {
	/// Parse a single frame from raw JSON text.
	pub fn parse(raw: &str) -> Result<Self, FramingError> {
		let value: Value = serde_json::from_str(raw)?;
		let Value::Object(body) = value else {
			return Err(FramingError::NotAnObject);
		};

		let command = body
			.get("command")
			.and_then(Value::as_str)
			.ok_or(FramingError::MissingCommand)?
			.to_string();

		Ok(Self { command, body })
	}

	pub fn str_arg(&self, name: &str) -> Result<&str, ArgError> {
		match self.body.get(name) {
			None => Err(ArgError::Missing(name.to_string())),
			Some(Value::String(s)) => Ok(s),
			Some(_) => Err(ArgError::WrongType(name.to_string())),
		}
	}

	/// Optional string argument; `null` and absence both mean `None`.
	pub fn opt_str_arg(&self, name: &str) -> Result<Option<&str>, ArgError> {
		match self.body.get(name) {
			None | Some(Value::Null) => Ok(None),
			Some(Value::String(s)) => Ok(Some(s)),
			Some(_) => Err(ArgError::WrongType(name.to_string())),
		}
	}

	pub fn bool_arg(&self, name: &str) -> Result<bool, ArgError> {
		match self.body.get(name) {
			None => Err(ArgError::Missing(name.to_string())),
			Some(Value::Bool(b)) => Ok(*b),
			Some(_) => Err(ArgError::WrongType(name.to_string())),
		}
	}

	pub fn array_arg(&self, name: &str) -> Result<&Vec<Value>, ArgError> {
		match self.body.get(name) {
			None => Err(ArgError::Missing(name.to_string())),
			Some(Value::Array(a)) => Ok(a),
			Some(_) => Err(ArgError::WrongType(name.to_string())),
		}
	}

	pub fn object_arg(&self, name: &str) -> Result<&Map<String, Value>, ArgError> {
		match self.body.get(name) {
			None => Err(ArgError::Missing(name.to_string())),
			Some(Value::Object(o)) => Ok(o),
			Some(_) => Err(ArgError::WrongType(name.to_string())),
		}
	}
}

/// One outbound response frame: `{"code": <int>, ...extra}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
	pub code: i32,
	pub extra: Map<String, Value>,
}

impl ResponseFrame {
	pub fn new(code: i32) -> Self {
		Self {
			code,
			extra: Map::new(),
		}
	}

	pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
		self.extra.insert(key.into(), value);
		self
	}

	pub fn to_value(&self) -> Value {
		let mut body = Map::with_capacity(1 + self.extra.len());
		body.insert("code".to_string(), Value::from(self.code));
		for (k, v) in &self.extra {
			body.insert(k.clone(), v.clone());
		}
		Value::Object(body)
	}
}

/// One outbound event frame: `{"event": <string>, ...extra}`.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFrame {
	pub event: String,
	pub extra: Map<String, Value>,
}

impl EventFrame {
	pub fn new(event: impl Into<String>) -> Self {
		Self {
			event: event.into(),
			extra: Map::new(),
		}
	}

	pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
		self.extra.insert(key.into(), value);
		self
	}

	pub fn to_value(&self) -> Value {
		let mut body = Map::with_capacity(1 + self.extra.len());
		body.insert("event".to_string(), Value::String(self.event.clone()));
		for (k, v) in &self.extra {
			body.insert(k.clone(), v.clone());
		}
		Value::Object(body)
	}
}
