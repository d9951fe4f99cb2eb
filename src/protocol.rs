use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

#[derive(Debug, Deserialize)]
pub struct Request {
	/// Absent for notifications, which get no response.
	#[serde(default)]
	pub id: Option<Value>,
	pub method: String,
	#[serde(default)]
	pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct Response {
	pub jsonrpc: &'static str,
	pub id: Value,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<ErrorObject>,
}

#[derive(Debug, Serialize)]
pub struct ErrorObject {
	pub code: i64,
	pub message: String,
}

impl Response {
	pub fn ok(id: Value, result: Value) -> Self {
		Self {
			jsonrpc: "2.0",
			id,
			result: Some(result),
			error: None
		}
	}

	pub fn err(id: Value, code: i64, message: impl Into<String>) -> Self {
		Self {
			jsonrpc: "2.0",
			id,
			result: None,
			error: Some(ErrorObject {
				code,
				message: message.into()
			})
		}
	}
}
