//! Deterministic JSON recovery: code-fence stripping, balanced-span
//! extraction, and the single-pass repair state machine described in
//! spec §4.6 step 4. A pure stage, kept separate from the LLM-recovery
//! stages in `mod.rs` per the "never mix" design note.

/// Strips a leading/trailing Markdown code fence (` ```json ` or ` ``` `),
/// if present.
#[must_use]
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let without_prefix = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed)
        .trim_start();
    without_prefix.strip_suffix("```").unwrap_or(without_prefix).trim_end()
}

/// Finds the first balanced `{...}` or `[...]` span in `text`, respecting
/// string contents (braces inside strings don't count). Returns `None` if
/// no opening bracket is found or the structure never closes (truncated
/// output) — the caller falls back to "from the opening bracket to EOF"
/// and lets [`repair_json`]'s truncation closure handle the rest.
#[must_use]
fn balanced_span(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (idx, ch) in text.char_indices() {
        if idx < start {
            continue;
        }
        if in_string {
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..idx + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Isolates the JSON candidate from a raw model response: strips code
/// fences, then returns either the first balanced bracketed span or,
/// failing that, everything from the first opening bracket to the end of
/// the text (the truncated-output case).
#[must_use]
pub fn extract_candidate(text: &str) -> Option<&str> {
    let stripped = strip_code_fences(text);
    let start = stripped.find(['{', '['])?;
    Some(balanced_span(stripped).unwrap_or_else(|| stripped[start..].trim_end()))
}

/// The deterministic single-pass repair state machine (spec §4.6 step 4):
/// escapes literal control characters inside strings, heuristically
/// escapes quotes that aren't actually closing the string, and closes any
/// brackets left open by truncated model output.
///
/// For any already-valid JSON string `s`, `repair_json(s) == s` — every
/// closing quote in valid JSON is immediately followed (modulo
/// whitespace) by one of `: , } ]` or the end of input, so the heuristic
/// never escapes a quote that was already structural.
#[must_use]
pub fn repair_json(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut output = String::with_capacity(input.len() + 8);
    let mut in_string = false;
    let mut stack: Vec<char> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            match c {
                '\\' => {
                    output.push(c);
                    if i + 1 < chars.len() {
                        output.push(chars[i + 1]);
                        i += 2;
                        continue;
                    }
                }
                '\n' => output.push_str("\\n"),
                '\t' => output.push_str("\\t"),
                '\r' => output.push_str("\\r"),
                '"' => {
                    let mut j = i + 1;
                    while j < chars.len() && chars[j].is_whitespace() {
                        j += 1;
                    }
                    let structural = matches!(chars.get(j), None | Some(':' | ',' | '}' | ']'));
                    if structural {
                        output.push('"');
                        in_string = false;
                    } else {
                        output.push_str("\\\"");
                    }
                }
                other => output.push(other),
            }
        } else {
            match c {
                '"' => {
                    in_string = true;
                    output.push('"');
                }
                '{' | '[' => {
                    stack.push(c);
                    output.push(c);
                }
                '}' | ']' => {
                    stack.pop();
                    output.push(c);
                }
                other => output.push(other),
            }
        }
        i += 1;
    }

    if in_string {
        output.push('"');
    }
    while let Some(open) = stack.pop() {
        output.push(if open == '{' { '}' } else { ']' });
    }

    output
}
