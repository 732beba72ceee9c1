use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TruncationMode {
    Head,
    HeadTail,
}

/// Renders a tool output payload as a single human-readable preview string.
///
/// Agents report tool output as plain strings, arrays of text blocks, or
/// arbitrary JSON; all three collapse to text before truncation.
pub fn tool_output_preview(output: &Value, max_chars: usize) -> String {
    let text = flatten_output_text(output);
    truncate_chars(text.trim(), max_chars, TruncationMode::Head)
}

pub fn flatten_output_text(output: &Value) -> String {
    match output {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Object(block) => block
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| item.to_string()),
                other => flatten_output_text(other),
            })
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(map) => ["text", "output", "content", "result"]
            .iter()
            .find_map(|key| map.get(*key))
            .map(flatten_output_text)
            .unwrap_or_else(|| output.to_string()),
        other => other.to_string(),
    }
}

pub fn truncate_chars(output: &str, max_chars: usize, mode: TruncationMode) -> String {
    let char_count = output.chars().count();
    if char_count <= max_chars {
        return output.to_string();
    }

    match mode {
        TruncationMode::Head => format!("{}…", take_head(output, max_chars)),
        TruncationMode::HeadTail => {
            let head = max_chars / 2;
            let tail = max_chars.saturating_sub(head);
            format!(
                "{}\n[... {} characters omitted ...]\n{}",
                take_head(output, head),
                char_count.saturating_sub(max_chars),
                take_tail(output, tail)
            )
        }
    }
}

fn take_head(input: &str, char_count: usize) -> String {
    input.chars().take(char_count).collect()
}

fn take_tail(input: &str, char_count: usize) -> String {
    let total = input.chars().count();
    input
        .chars()
        .skip(total.saturating_sub(char_count))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn preview_joins_text_blocks() {
        let output = json!([
            { "type": "text", "text": "first" },
            { "type": "text", "text": "second" }
        ]);
        assert_eq!(tool_output_preview(&output, 100), "first\nsecond");
    }

    #[test]
    fn preview_truncates_on_char_boundaries() {
        let output = json!("héllo wörld");
        assert_eq!(tool_output_preview(&output, 4), "héll…");
    }

    #[test]
    fn head_tail_mode_reports_omitted_count() {
        let output = truncate_chars("abcdefghij", 4, TruncationMode::HeadTail);
        assert!(output.starts_with("ab"));
        assert!(output.ends_with("ij"));
        assert!(output.contains("6 characters omitted"));
    }
}
