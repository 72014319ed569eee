//! Canonical cell outputs and the classification of iopub traffic into them.

use jupyter_protocol::{JupyterMessageContent, Stdio};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub type MimeBundle = Map<String, Value>;

/// One entry of a cell's output area, in the persisted nbformat shape.
///
/// There is deliberately no `transient` field: routing data such as
/// `display_id` is consumed during accumulation and never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum Output {
    Stream {
        name: String,
        #[serde(deserialize_with = "deserialize_multiline")]
        text: String,
    },
    DisplayData {
        #[serde(default)]
        data: MimeBundle,
        #[serde(default)]
        metadata: MimeBundle,
    },
    ExecuteResult {
        #[serde(default)]
        data: MimeBundle,
        #[serde(default)]
        metadata: MimeBundle,
        #[serde(default)]
        execution_count: Option<i64>,
    },
    Error {
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
}

impl Output {
    pub fn output_type(&self) -> &'static str {
        match self {
            Output::Stream { .. } => "stream",
            Output::DisplayData { .. } => "display_data",
            Output::ExecuteResult { .. } => "execute_result",
            Output::Error { .. } => "error",
        }
    }

    /// The mime bundle of a display or result output.
    pub fn data(&self) -> Option<&MimeBundle> {
        match self {
            Output::DisplayData { data, .. } | Output::ExecuteResult { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn data_mut(&mut self) -> Option<&mut MimeBundle> {
        match self {
            Output::DisplayData { data, .. } | Output::ExecuteResult { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn html(&self) -> Option<String> {
        self.data()
            .and_then(|d| d.get("text/html"))
            .and_then(html_text)
    }
}

/// HTML payloads may be a string or a list of lines.
fn html_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(lines) => lines
            .iter()
            .map(|line| line.as_str())
            .collect::<Option<Vec<_>>>()
            .map(|lines| lines.concat()),
        _ => None,
    }
}

/// Accept stream text as a string or as a list of lines.
fn deserialize_multiline<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Multiline {
        Text(String),
        Lines(Vec<String>),
    }

    Ok(match Multiline::deserialize(deserializer)? {
        Multiline::Text(text) => text,
        Multiline::Lines(lines) => lines.concat(),
    })
}

/// What an iopub message does to a cell's output area.
#[derive(Debug, Clone, PartialEq)]
pub enum IopubAction {
    /// Append a new output; `display_id` registers it for later updates.
    Append {
        output: Output,
        display_id: Option<String>,
    },
    /// Replace every output previously shown under `display_id`.
    Update { display_id: String, output: Output },
    Clear { wait: bool },
    Ignore,
}

/// Classify one iopub message for the output area.
///
/// Order of precedence: output-producing kinds, then `clear_output`, then
/// `update_display_data`; everything else (status, execute_input, comms) is
/// ignored.
pub fn classify_iopub(content: &JupyterMessageContent) -> IopubAction {
    match content {
        JupyterMessageContent::ExecuteResult(result) => IopubAction::Append {
            output: Output::ExecuteResult {
                data: to_bundle(&result.data),
                metadata: to_bundle(&result.metadata),
                execution_count: Some(result.execution_count.0 as i64),
            },
            display_id: None,
        },
        JupyterMessageContent::DisplayData(display) => IopubAction::Append {
            output: Output::DisplayData {
                data: to_bundle(&display.data),
                metadata: to_bundle(&display.metadata),
            },
            display_id: display
                .transient
                .as_ref()
                .and_then(|t| t.display_id.clone()),
        },
        JupyterMessageContent::StreamContent(stream) => IopubAction::Append {
            output: Output::Stream {
                name: match stream.name {
                    Stdio::Stdout => "stdout".to_string(),
                    Stdio::Stderr => "stderr".to_string(),
                },
                text: stream.text.clone(),
            },
            display_id: None,
        },
        JupyterMessageContent::ErrorOutput(error) => IopubAction::Append {
            output: Output::Error {
                ename: error.ename.clone(),
                evalue: error.evalue.clone(),
                traceback: error.traceback.clone(),
            },
            display_id: None,
        },
        JupyterMessageContent::ClearOutput(clear) => IopubAction::Clear { wait: clear.wait },
        JupyterMessageContent::UpdateDisplayData(update) => {
            let output = Output::DisplayData {
                data: to_bundle(&update.data),
                metadata: to_bundle(&update.metadata),
            };
            match update.transient.display_id.clone() {
                Some(display_id) => IopubAction::Update { display_id, output },
                None => IopubAction::Append {
                    output,
                    display_id: None,
                },
            }
        }
        _ => IopubAction::Ignore,
    }
}

fn to_bundle<T: Serialize>(value: &T) -> MimeBundle {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}
