//! Command payload normalization
//!
//! Producers (local UI, cloud sync, MQTT ingestion) submit commands in a
//! handful of loosely structured shapes. They are normalized here, at the
//! boundary, into a closed set of variants so the queue and buffer only ever
//! carry an opaque payload mapping.

use crate::message::Payload;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors raised while normalizing a raw command
#[derive(Error, Debug, PartialEq)]
pub enum PayloadError {
    #[error("Command payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("Field `{field}` must be {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },

    #[error("Field `{0}` must not be empty")]
    Empty(&'static str),
}

/// A single step of an action sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default, skip_serializing_if = "Payload::is_empty")]
    pub params: Payload,
}

/// Normalized command shapes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandPayload {
    /// Ordered list of robot actions
    Actions { actions: Vec<Action> },
    /// Invocation of a named tool
    Tool {
        tool_name: String,
        #[serde(default)]
        arguments: Payload,
    },
    /// Call routed to an MCP target
    Mcp {
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
        #[serde(default)]
        params: Payload,
    },
    /// Primitive motion/base commands
    BaseCommands { commands: Vec<String> },
    /// Anything else, carried through untouched
    Raw { body: Payload },
}

impl CommandPayload {
    /// Normalize a raw producer payload into one of the known shapes
    pub fn normalize(raw: Value) -> Result<Self, PayloadError> {
        let obj = match raw {
            Value::Object(obj) => obj,
            Value::Null => return Err(PayloadError::NotAnObject("null")),
            Value::Bool(_) => return Err(PayloadError::NotAnObject("a boolean")),
            Value::Number(_) => return Err(PayloadError::NotAnObject("a number")),
            Value::String(_) => return Err(PayloadError::NotAnObject("a string")),
            Value::Array(_) => return Err(PayloadError::NotAnObject("an array")),
        };

        if let Some(actions) = obj.get("actions") {
            return Self::parse_actions(actions);
        }

        if let Some(tool) = obj.get("toolName").or_else(|| obj.get("tool_name")) {
            let tool_name = non_empty_str(tool, "toolName")?;
            let arguments = optional_object(obj.get("arguments"), "arguments")?;
            return Ok(CommandPayload::Tool {
                tool_name,
                arguments,
            });
        }

        if let Some(target) = obj.get("target") {
            let target = non_empty_str(target, "target")?;
            let method = match obj.get("method") {
                None | Some(Value::Null) => None,
                Some(m) => Some(non_empty_str(m, "method")?),
            };
            let params = optional_object(obj.get("params"), "params")?;
            return Ok(CommandPayload::Mcp {
                target,
                method,
                params,
            });
        }

        if let Some(base) = obj.get("base_commands") {
            let list = base.as_array().ok_or(PayloadError::InvalidField {
                field: "base_commands",
                expected: "an array of strings",
            })?;
            let commands = list
                .iter()
                .map(|c| {
                    c.as_str().map(str::to_owned).ok_or(PayloadError::InvalidField {
                        field: "base_commands",
                        expected: "an array of strings",
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            if commands.is_empty() {
                return Err(PayloadError::Empty("base_commands"));
            }
            return Ok(CommandPayload::BaseCommands { commands });
        }

        Ok(CommandPayload::Raw { body: obj })
    }

    fn parse_actions(actions: &Value) -> Result<Self, PayloadError> {
        let invalid = PayloadError::InvalidField {
            field: "actions",
            expected: "an array of objects with a `type`",
        };
        let list = actions.as_array().ok_or(invalid)?;
        if list.is_empty() {
            return Err(PayloadError::Empty("actions"));
        }

        let mut parsed = Vec::with_capacity(list.len());
        for item in list {
            let Some(obj) = item.as_object() else {
                return Err(PayloadError::InvalidField {
                    field: "actions",
                    expected: "an array of objects with a `type`",
                });
            };
            let action_type = match obj.get("type") {
                Some(Value::String(t)) if !t.is_empty() => t.clone(),
                _ => {
                    return Err(PayloadError::InvalidField {
                        field: "actions",
                        expected: "an array of objects with a `type`",
                    })
                }
            };
            let params = obj
                .iter()
                .filter(|(k, _)| k.as_str() != "type")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            parsed.push(Action {
                action_type,
                params,
            });
        }

        Ok(CommandPayload::Actions { actions: parsed })
    }

    /// Short name of the variant, matching the `kind` tag
    pub fn kind(&self) -> &'static str {
        match self {
            CommandPayload::Actions { .. } => "actions",
            CommandPayload::Tool { .. } => "tool",
            CommandPayload::Mcp { .. } => "mcp",
            CommandPayload::BaseCommands { .. } => "base_commands",
            CommandPayload::Raw { .. } => "raw",
        }
    }

    /// Convert into the opaque payload mapping carried by a `Message`
    pub fn into_payload(self) -> Payload {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            // Internally tagged enums of structs always serialize to objects
            _ => Payload::new(),
        }
    }

    /// Recover the normalized shape from a message payload
    pub fn from_payload(payload: &Payload) -> Option<Self> {
        serde_json::from_value(Value::Object(payload.clone())).ok()
    }
}

fn non_empty_str(value: &Value, field: &'static str) -> Result<String, PayloadError> {
    match value {
        Value::String(s) if !s.is_empty() => Ok(s.clone()),
        Value::String(_) => Err(PayloadError::Empty(field)),
        _ => Err(PayloadError::InvalidField {
            field,
            expected: "a string",
        }),
    }
}

fn optional_object(value: Option<&Value>, field: &'static str) -> Result<Payload, PayloadError> {
    match value {
        None | Some(Value::Null) => Ok(Payload::new()),
        Some(Value::Object(obj)) => Ok(obj.clone()),
        Some(_) => Err(PayloadError::InvalidField {
            field,
            expected: "an object",
        }),
    }
}
