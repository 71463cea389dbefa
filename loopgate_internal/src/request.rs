use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A request to run one pre-registered command.
///
/// This is the payload a companion process sends over the binary channel, and the
/// value the URL handler builds from the custom URL it was launched with.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandRequest {
    /// The name of the command to run.
    pub command: String,
    /// Correlation token the browser polls with; `None` for fire-and-forget commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_id: Option<String>,
    /// Named parameters for the command.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl CommandRequest {
    /// Creates a new request without parameters.
    pub fn new(command: impl Into<String>, callback_id: Option<String>) -> Self {
        CommandRequest {
            command: command.into(),
            callback_id,
            parameters: BTreeMap::new(),
        }
    }

    /// Adds a parameter, replacing any earlier value with the same name.
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_optional_fields_default() {
        let r = CommandRequest::from_json(br#"{"command":"echo"}"#).unwrap();
        assert_eq!(r.command, "echo");
        assert_eq!(r.callback_id, None);
        assert!(r.parameters.is_empty());
    }

    #[test]
    fn no_callback_id_is_not_serialized() {
        let r = CommandRequest::new("echo", None).with_parameter("x", "1");
        let json = String::from_utf8(r.to_json().unwrap()).unwrap();
        assert_eq!(json, r#"{"command":"echo","parameters":{"x":"1"}}"#);
    }
}
