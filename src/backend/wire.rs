use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Host to worker, one JSON line each; a stream ends with exactly one `End`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Frame<T> {
    Item(T),
    End,
}

/// Worker to host: one reply per item, then `End`, or nothing after `Failed` under abort
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Reply<U> {
    Item(U),
    Skipped { item_context: String, cause: String },
    Failed { item_context: String, cause: String },
    End,
}

/// Serialize one message as a newline-terminated JSON line
pub fn encode_line<M: Serialize>(message: &M) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Parse one line, ignoring the trailing newline
pub fn decode_line<M: DeserializeOwned>(line: &str) -> serde_json::Result<M> {
    serde_json::from_str(line.trim_end())
}
