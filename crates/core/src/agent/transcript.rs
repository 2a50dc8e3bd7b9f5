/// Parser for the textual protocol used with models that cannot emit
/// structured tool calls:
///
/// ```text
/// Thought: the sign is flipped
/// Action: apply_patch
/// Action Input:
/// --- a/src/calc.py
/// ...
/// ```
///
/// Model output is truncated at the first `Action Input:` payload; anything
/// the model fabricates after an `Observation:` line is discarded. Real
/// observations are inserted by the loop only.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAction {
    pub name: String,
    pub input: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptTurn {
    Action(ParsedAction),
    Final(String),
    Unparseable,
}

/// The portion of the model's output that belongs in the conversation:
/// everything up to the end of the first action input.
pub fn retained_text(text: &str) -> String {
    let mut kept = Vec::new();
    let mut in_input = false;
    for line in text.lines() {
        if line.trim_start().starts_with("Observation:") {
            break;
        }
        if in_input && (line.trim_start().starts_with("Thought:")
            || line.trim_start().starts_with("Action:"))
        {
            break;
        }
        if line.trim_start().starts_with("Action Input:") {
            in_input = true;
        }
        kept.push(line);
    }
    kept.join("\n")
}

pub fn parse_turn(raw: &str) -> TranscriptTurn {
    // Work on the truncated transcript so fabricated observations cannot
    // smuggle in a bogus final answer or second action.
    let retained = retained_text(raw);
    let text = retained.as_str();
    if let Some(idx) = find_marker(text, "Final Answer:") {
        let answer = text[idx + "Final Answer:".len()..].trim().to_string();
        return TranscriptTurn::Final(answer);
    }

    let Some(action_idx) = find_marker(text, "Action:") else {
        return TranscriptTurn::Unparseable;
    };
    let action_line_end = text[action_idx..]
        .find('\n')
        .map(|i| action_idx + i)
        .unwrap_or(text.len());
    let name = text[action_idx + "Action:".len()..action_line_end]
        .trim()
        .to_string();
    if name.is_empty() {
        return TranscriptTurn::Unparseable;
    }

    let input = match find_marker(&text[action_line_end..], "Action Input:") {
        Some(rel) => {
            let start = action_line_end + rel + "Action Input:".len();
            let body = &text[start..];
            let end = body
                .lines()
                .scan(0usize, |offset, line| {
                    let line_start = *offset;
                    *offset += line.len() + 1;
                    Some((line_start, line))
                })
                .find(|(_, line)| {
                    let t = line.trim_start();
                    t.starts_with("Observation:")
                        || t.starts_with("Thought:")
                        || t.starts_with("Action:")
                })
                .map(|(line_start, _)| line_start)
                .unwrap_or(body.len());
            strip_fences(body[..end].trim())
        }
        None => String::new(),
    };

    TranscriptTurn::Action(ParsedAction { name, input })
}

/// Find a marker at the start of a line (ignoring leading whitespace).
fn find_marker(text: &str, marker: &str) -> Option<usize> {
    let mut offset = 0;
    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with(marker) {
            return Some(offset + (line.len() - trimmed.len()));
        }
        offset += line.len() + 1;
    }
    None
}

/// Models like to fence diff payloads in code blocks.
fn strip_fences(input: &str) -> String {
    let trimmed = input.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest
            .split_once('\n')
            .map(|(_, body)| body)
            .unwrap_or(rest);
        if let Some(body) = rest.strip_suffix("```") {
            return body.trim_end().trim_end_matches('\n').to_string();
        }
        return rest.trim_end().to_string();
    }
    trimmed.to_string()
}
