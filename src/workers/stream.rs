//! Line parser for the Claude CLI's `stream-json` output.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

static PROGRESS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<progress>\s*(\d{1,3})%?\s*</progress>").expect("valid progress regex")
});

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    Assistant {
        message: AssistantMessage,
    },
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

/// What one output line means to the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    /// Last `<progress>` value on the line, clamped to 100.
    Progress(u8),
    /// A tool call, described for humans.
    Activity(String),
    Text(String),
    Finished { result: String, is_error: bool },
    Ignored,
}

/// Every `<progress>N</progress>` value in `text`, in order.
pub fn parse_progress(text: &str) -> Vec<u8> {
    PROGRESS_REGEX
        .captures_iter(text)
        .filter_map(|cap| cap.get(1)?.as_str().parse::<u16>().ok())
        .map(|p| p.min(100) as u8)
        .collect()
}

/// Classify one line. Lines that are not stream-json are treated as plain
/// text, so a CLI run without `--output-format stream-json` still reports
/// progress.
pub fn parse_line(line: &str) -> LineEvent {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return LineEvent::Ignored;
    }

    let Some(event) = trimmed
        .starts_with('{')
        .then(|| serde_json::from_str::<StreamEvent>(trimmed).ok())
        .flatten()
    else {
        return text_event(trimmed);
    };

    match event {
        StreamEvent::Assistant { message } => {
            let mut activity = None;
            let mut text = String::new();
            for block in message.content {
                match block {
                    ContentBlock::ToolUse { name, input } => {
                        activity = Some(describe_tool_use(&name, &input));
                    }
                    ContentBlock::Text { text: t } => text.push_str(&t),
                    ContentBlock::Other => {}
                }
            }
            if let Some(percent) = parse_progress(&text).last() {
                LineEvent::Progress(*percent)
            } else if let Some(activity) = activity {
                LineEvent::Activity(activity)
            } else if text.trim().is_empty() {
                LineEvent::Ignored
            } else {
                LineEvent::Text(text.trim().to_string())
            }
        }
        StreamEvent::Result { result, is_error } => LineEvent::Finished {
            result: result.unwrap_or_default(),
            is_error,
        },
        StreamEvent::Other => LineEvent::Ignored,
    }
}

fn text_event(text: &str) -> LineEvent {
    match parse_progress(text).last() {
        Some(percent) => LineEvent::Progress(*percent),
        None => LineEvent::Text(text.to_string()),
    }
}

pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let field = |key: &str| input.get(key).and_then(|v| v.as_str());
    match name {
        "Read" => format!("Reading: {}", field("file_path").unwrap_or("file")),
        "Write" => format!("Creating: {}", field("file_path").unwrap_or("file")),
        "Edit" | "MultiEdit" => format!("Editing: {}", field("file_path").unwrap_or("file")),
        "Bash" => format!(
            "Running: {}",
            crate::util::truncate(field("command").unwrap_or("command"), 40)
        ),
        "Glob" | "Grep" => format!("Searching: {}", field("pattern").unwrap_or("*")),
        _ => name.to_string(),
    }
}
