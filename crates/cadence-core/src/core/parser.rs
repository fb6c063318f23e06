//! Tolerant parser for the model's tagged output.
//!
//! The model writes prose with at most a few tool calls in this shape:
//!
//! ```text
//! I'll read the manifest first.
//! <read_file>
//! <path>Cargo.toml</path>
//! </read_file>
//! ```
//!
//! The whole accumulated text is re-parsed after every stream increment.
//! Parsing is a pure function of the prefix, so a block that was final in a
//! shorter prefix is final, and identical, in every longer one.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::tools::{ParamName, ToolName, ToolParams};

/// A tool call as parsed from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolUse {
    pub name: ToolName,
    pub params: ToolParams,
    pub partial: bool,
}

impl ToolUse {
    pub fn param(&self, name: ParamName) -> Option<&str> {
        self.params.get(&name).map(String::as_str)
    }
}

/// One ordered unit of an assistant message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentBlock {
    Text { content: String, partial: bool },
    ToolUse(ToolUse),
}

impl ContentBlock {
    pub fn is_partial(&self) -> bool {
        match self {
            ContentBlock::Text { partial, .. } => *partial,
            ContentBlock::ToolUse(tool) => tool.partial,
        }
    }

    /// The same block, marked final.
    #[must_use]
    pub fn into_final(self) -> Self {
        match self {
            ContentBlock::Text { content, .. } => ContentBlock::Text {
                content,
                partial: false,
            },
            ContentBlock::ToolUse(tool) => ContentBlock::ToolUse(ToolUse {
                partial: false,
                ..tool
            }),
        }
    }
}

/// `(name, "<name>", "</name>")` for every tool and parameter tag.
struct Tags<T> {
    entries: Vec<(T, String, String)>,
}

impl<T: Copy + PartialEq + fmt::Display> Tags<T> {
    fn new(names: impl IntoIterator<Item = T>) -> Self {
        Self {
            entries: names
                .into_iter()
                .map(|name| (name, format!("<{name}>"), format!("</{name}>")))
                .collect(),
        }
    }

    fn opened_at_end(&self, text: &str) -> Option<T> {
        self.entries
            .iter()
            .find(|(_, open, _)| text.ends_with(open.as_str()))
            .map(|(name, _, _)| *name)
    }

    fn closing(&self, name: T) -> &str {
        self.entries
            .iter()
            .find(|(n, _, _)| *n == name)
            .map_or("", |(_, _, close)| close.as_str())
    }
}

static TOOL_TAGS: LazyLock<Tags<ToolName>> = LazyLock::new(|| Tags::new(ToolName::ALL));
static PARAM_TAGS: LazyLock<Tags<ParamName>> = LazyLock::new(|| Tags::new(ParamName::ALL));

static THINKING_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<thinking>\s?").expect("valid pattern"));
static THINKING_CLOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s?</thinking>").expect("valid pattern"));

/// Matches a partially streamed closing tag of each parameter at the end of
/// its value.
static PARTIAL_CLOSING_TAGS: LazyLock<Vec<(ParamName, Regex)>> = LazyLock::new(|| {
    ParamName::ALL
        .into_iter()
        .map(|param| {
            let optional_chars: String = param
                .as_str()
                .chars()
                .map(|c| format!("(?:{})?", regex::escape(&c.to_string())))
                .collect();
            let pattern = Regex::new(&format!(r"\s?</?{optional_chars}$")).expect("valid pattern");
            (param, pattern)
        })
        .collect()
});

/// Parses accumulated assistant text into ordered blocks.
///
/// At most one block, the last, is partial.
pub fn parse_assistant_message(message: &str) -> Vec<ContentBlock> {
    let tool_tags = &*TOOL_TAGS;
    let param_tags = &*PARAM_TAGS;
    let mut blocks = Vec::new();
    let mut text_start: Option<usize> = None;
    let mut tool: Option<ToolUse> = None;
    let mut tool_start = 0;
    let mut param: Option<ParamName> = None;
    let mut param_start = 0;

    for (i, ch) in message.char_indices() {
        let end = i + ch.len_utf8();
        let accumulated = &message[..end];

        if let Some(current) = tool.as_mut() {
            if let Some(name) = param {
                let value = &message[param_start..end];
                if let Some(value) = value.strip_suffix(param_tags.closing(name)) {
                    current.params.insert(name, value.trim().to_string());
                    param = None;
                }
                continue;
            }

            if message[tool_start..end].ends_with(tool_tags.closing(current.name)) {
                if let Some(mut done) = tool.take() {
                    done.partial = false;
                    blocks.push(ContentBlock::ToolUse(done));
                }
                continue;
            }

            if let Some(name) = param_tags.opened_at_end(accumulated) {
                param = Some(name);
                param_start = end;
            }

            // File contents may themselves contain `</content>`: keep
            // everything between the first opening and the last closing tag.
            if current.name == ToolName::WriteToFile && accumulated.ends_with("</content>") {
                let body = &message[tool_start..end];
                if let (Some(open), Some(close)) = (body.find("<content>"), body.rfind("</content>"))
                {
                    let start = open + "<content>".len();
                    if close > start {
                        current
                            .params
                            .insert(ParamName::Content, body[start..close].trim().to_string());
                    }
                }
            }
            continue;
        }

        if let Some(name) = tool_tags.opened_at_end(accumulated) {
            let tag_len = name.as_str().len() + 2;
            if let Some(start) = text_start.take() {
                blocks.push(ContentBlock::Text {
                    content: message[start..end - tag_len].trim().to_string(),
                    partial: false,
                });
            }
            tool = Some(ToolUse {
                name,
                params: ToolParams::new(),
                partial: true,
            });
            tool_start = end;
            continue;
        }

        text_start.get_or_insert(i);
    }

    if let Some(mut current) = tool {
        if let Some(name) = param {
            current
                .params
                .insert(name, message[param_start..].trim().to_string());
        }
        blocks.push(ContentBlock::ToolUse(current));
    } else if let Some(start) = text_start {
        blocks.push(ContentBlock::Text {
            content: message[start..].trim().to_string(),
            partial: true,
        });
    }

    blocks
}

/// Text as shown to the user: thinking tags removed, and a trailing
/// half-written tag (`<`, `</`, `<read_fi`) cut off.
pub fn display_text(content: &str) -> String {
    let text = THINKING_OPEN.replace_all(content, "");
    let mut text = THINKING_CLOSE.replace_all(&text, "").into_owned();

    if let Some(last_open) = text.rfind('<') {
        let possible_tag = &text[last_open..];
        if !possible_tag.contains('>') {
            let tag_content = possible_tag
                .strip_prefix("</")
                .or_else(|| possible_tag.strip_prefix('<'))
                .unwrap_or(possible_tag)
                .trim();
            let likely_tag_name = !tag_content.is_empty()
                && tag_content
                    .chars()
                    .all(|c| c.is_ascii_alphabetic() || c == '_');
            if possible_tag == "<" || possible_tag == "</" || likely_tag_name {
                text = text[..last_open].trim().to_string();
            }
        }
    }
    text
}

/// Strips a trailing, partially streamed closing tag of `param` from a
/// partial parameter value, e.g. `src/main.rs</pa` → `src/main.rs`.
pub fn remove_closing_tag(param: ParamName, text: &str, partial: bool) -> String {
    if !partial {
        return text.to_string();
    }
    PARTIAL_CLOSING_TAGS
        .iter()
        .find(|(name, _)| *name == param)
        .map_or_else(
            || text.to_string(),
            |(_, pattern)| pattern.replace(text, "").into_owned(),
        )
}
