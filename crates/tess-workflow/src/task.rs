use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use tess_types::TessError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestType {
    New,
    Partial,
    Pause,
    Resume,
    Stop,
}

/// Unit of work on a flow's queue stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub flow_name: String,
    pub request_id: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub header: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub raw_query: String,
    #[serde(default)]
    pub query: BTreeMap<String, Vec<String>>,
    pub request_type: RequestType,
    /// Which execution cursor of the request a PARTIAL task advances; empty
    /// for the request's first cursor.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cursor: String,
}

impl Task {
    pub fn new(
        flow_name: impl Into<String>,
        request_id: impl Into<String>,
        request_type: RequestType,
    ) -> Self {
        Task {
            flow_name: flow_name.into(),
            request_id: request_id.into(),
            body: String::new(),
            header: BTreeMap::new(),
            raw_query: String::new(),
            query: BTreeMap::new(),
            request_type,
            cursor: String::new(),
        }
    }

    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = cursor.into();
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, TessError> {
        serde_json::to_vec(self).map_err(|e| TessError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TessError> {
        serde_json::from_slice(bytes).map_err(|e| TessError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format() {
        let mut task = Task::new("orders", "r-1", RequestType::Partial);
        task.query.insert("page".into(), vec!["2".into()]);
        let json: serde_json::Value = serde_json::from_slice(&task.encode().unwrap()).unwrap();
        assert_eq!(json["request_type"], "PARTIAL");
        assert_eq!(json["flow_name"], "orders");
        assert_eq!(json["query"]["page"][0], "2");
        assert!(json.get("cursor").is_none());

        let branch = task.with_cursor("a--flow_1_0_up");
        let decoded = Task::decode(&branch.encode().unwrap()).unwrap();
        assert_eq!(decoded.cursor, "a--flow_1_0_up");
    }

    #[test]
    fn minimal_payload_decodes() {
        let task =
            Task::decode(br#"{"flow_name":"orders","request_id":"r-1","request_type":"STOP"}"#).unwrap();
        assert_eq!(task, Task::new("orders", "r-1", RequestType::Stop));
        assert!(matches!(Task::decode(b"not json"), Err(TessError::Codec(_))));
    }
}
