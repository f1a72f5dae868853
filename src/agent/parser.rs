use crate::agent::effects::SpawnResult;
use crate::agent::form::{Form, ToolCall, ToolResult};
use regex::Regex;
use std::collections::VecDeque;
use std::sync::OnceLock;

const TOOLS_OPEN: &str = "<tools>";
const TOOLS_CLOSE: &str = "</tools>";
const TOOL_OPEN: &str = "<tool>";
const TOOL_CLOSE: &str = "</tool>";
const REMEMBER_OPEN: &str = "<remember>";
const REMEMBER_CLOSE: &str = "</remember>";
const FORGET_OPEN: &str = "<forget>";
const FORGET_CLOSE: &str = "</forget>";
pub const SECTION_BEGIN: &str = "<|tool_calls_section_begin|>";
pub const SECTION_END: &str = "<|tool_calls_section_end|>";
const CALL_BEGIN: &str = "<|tool_call_begin|>";
const CALL_ARGUMENT_BEGIN: &str = "<|tool_call_argument_begin|>";
const CALL_END: &str = "<|tool_call_end|>";

/// Everything extracted from one raw LLM response.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    pub tool_calls: Vec<ToolCall>,
    pub remembers: Vec<String>,
    pub forgets: Vec<String>,
    pub clean_text: String,
}

// ── Response scanning ──────────────────────────────────────

enum Region {
    Container,
    Section,
    Remember,
    Forget,
    BareTool,
}

/// Extract tool calls and memory operations from a raw response, in
/// document order. Handles both markup dialects plus bare top-level tags.
pub fn parse_response(text: &str) -> ParsedResponse {
    let mut parsed = ParsedResponse::default();
    let mut clean = String::new();
    let mut rest = text;

    loop {
        let next = [
            (TOOLS_OPEN, Region::Container),
            (SECTION_BEGIN, Region::Section),
            (REMEMBER_OPEN, Region::Remember),
            (FORGET_OPEN, Region::Forget),
            (TOOL_OPEN, Region::BareTool),
        ]
        .into_iter()
        .filter_map(|(marker, region)| rest.find(marker).map(|pos| (pos, marker, region)))
        .min_by_key(|(pos, _, _)| *pos);

        let Some((pos, marker, region)) = next else {
            clean.push_str(rest);
            break;
        };

        clean.push_str(&rest[..pos]);
        let after_open = &rest[pos + marker.len()..];

        rest = match region {
            Region::Container => {
                let (body, remaining) = split_container_body(after_open);
                parse_container_body(body, &mut parsed);
                remaining
            }
            Region::Section => {
                let (body, remaining) = match after_open.find(SECTION_END) {
                    Some(end) => (&after_open[..end], &after_open[end + SECTION_END.len()..]),
                    None => (after_open, ""),
                };
                parse_section_body(body, &mut parsed.tool_calls);
                remaining
            }
            Region::Remember => match after_open.find(REMEMBER_CLOSE) {
                Some(end) => {
                    parsed.remembers.push(after_open[..end].trim().to_string());
                    &after_open[end + REMEMBER_CLOSE.len()..]
                }
                None => {
                    clean.push_str(marker);
                    after_open
                }
            },
            Region::Forget => match after_open.find(FORGET_CLOSE) {
                Some(end) => {
                    parsed.forgets.push(after_open[..end].trim().to_string());
                    &after_open[end + FORGET_CLOSE.len()..]
                }
                None => {
                    clean.push_str(marker);
                    after_open
                }
            },
            Region::BareTool => match after_open.find(TOOL_CLOSE) {
                Some(end) => {
                    if let Some(call) = parse_tool_call(&after_open[..end]) {
                        parsed.tool_calls.push(call);
                    }
                    &after_open[end + TOOL_CLOSE.len()..]
                }
                None => {
                    clean.push_str(marker);
                    after_open
                }
            },
        };
    }

    parsed.clean_text = clean.trim().to_string();
    parsed
}

/// A container body ends at `</tools>`, or at a stray `<tools>` in closing
/// position (observed model behavior), or at end of input.
fn split_container_body(after_open: &str) -> (&str, &str) {
    let close = after_open.find(TOOLS_CLOSE);
    let stray = after_open.find(TOOLS_OPEN);
    match (close, stray) {
        (Some(c), Some(s)) if s < c => (&after_open[..s], &after_open[s + TOOLS_OPEN.len()..]),
        (Some(c), _) => (&after_open[..c], &after_open[c + TOOLS_CLOSE.len()..]),
        (None, Some(s)) => (&after_open[..s], &after_open[s + TOOLS_OPEN.len()..]),
        (None, None) => (after_open, ""),
    }
}

fn parse_container_body(body: &str, parsed: &mut ParsedResponse) {
    let mut rest = body;
    loop {
        let next = [
            (TOOL_OPEN, TOOL_CLOSE, 0usize),
            (REMEMBER_OPEN, REMEMBER_CLOSE, 1),
            (FORGET_OPEN, FORGET_CLOSE, 2),
        ]
        .into_iter()
        .filter_map(|(open, close, kind)| rest.find(open).map(|pos| (pos, open, close, kind)))
        .min_by_key(|(pos, _, _, _)| *pos);

        let Some((pos, open, close, kind)) = next else {
            break;
        };
        let after_open = &rest[pos + open.len()..];
        let Some(end) = after_open.find(close) else {
            break;
        };
        let inner = &after_open[..end];
        match kind {
            0 => {
                if let Some(call) = parse_tool_call(inner) {
                    parsed.tool_calls.push(call);
                }
            }
            1 => parsed.remembers.push(inner.trim().to_string()),
            _ => parsed.forgets.push(inner.trim().to_string()),
        }
        rest = &after_open[end + close.len()..];
    }
}

// ── Alternative dialect ────────────────────────────────────

fn call_header_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:functions\.)?([A-Za-z_][A-Za-z0-9_]*)(?::\d+)?$")
            .expect("call header regex")
    })
}

fn parse_call_header(header: &str) -> String {
    call_header_regex()
        .captures(header)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| header.to_string())
}

/// `<|tool_call_begin|>HEADER<|tool_call_argument_begin|>JSON<|tool_call_end|>`
/// repeated. JSON object values become positional args in key order; a JSON
/// parse failure passes the whole text as a single argument.
fn parse_section_body(body: &str, calls: &mut Vec<ToolCall>) {
    let mut rest = body;
    while let Some(start) = rest.find(CALL_BEGIN) {
        let after_begin = &rest[start + CALL_BEGIN.len()..];
        let Some(arg_pos) = after_begin.find(CALL_ARGUMENT_BEGIN) else {
            break;
        };
        let header = after_begin[..arg_pos].trim();
        let after_args = &after_begin[arg_pos + CALL_ARGUMENT_BEGIN.len()..];
        let Some(end_pos) = after_args.find(CALL_END) else {
            break;
        };
        let json = after_args[..end_pos].trim();

        let raw_args = match serde_json::from_str::<serde_json::Value>(json) {
            Ok(serde_json::Value::Object(map)) => map
                .into_iter()
                .map(|(_, value)| match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect(),
            _ => vec![json.to_string()],
        };

        calls.push(ToolCall::new(parse_call_header(header), raw_args));
        rest = &after_args[end_pos + CALL_END.len()..];
    }
}

// ── Call and argument syntax ───────────────────────────────

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parse `Name(args…)` (or a bare `Name`) from a `<tool>` element body.
pub fn parse_tool_call(inner: &str) -> Option<ToolCall> {
    let trimmed = inner.trim();
    let Some(open) = trimmed.find('(') else {
        return valid_name(trimmed).then(|| ToolCall::new(trimmed, vec![]));
    };
    let name = trimmed[..open].trim();
    if !valid_name(name) {
        return None;
    }
    let args_str = match trimmed.rfind(')') {
        Some(close) if close > open => &trimmed[open + 1..close],
        _ => &trimmed[open + 1..],
    };
    Some(ToolCall::new(name, parse_args(args_str)))
}

/// Strip an optional `name=` / `name:` keyword prefix. Positional order is
/// what counts; the keyword is dropped.
fn skip_kwarg_prefix(chars: &[char], start: usize) -> usize {
    let mut i = start;
    if i >= chars.len() || !(chars[i].is_ascii_alphabetic() || chars[i] == '_') {
        return start;
    }
    while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
        i += 1;
    }
    let mut j = i;
    while j < chars.len() && chars[j] == ' ' {
        j += 1;
    }
    if j < chars.len() && (chars[j] == '=' || chars[j] == ':') {
        j + 1
    } else {
        start
    }
}

/// Comma-separated argument list. Elements are bare (trimmed, up to the
/// next comma) or quoted by `"`, `'`, or a backtick. Inside double quotes
/// `\n`, `\t`, `\\` are interpreted; any other escaped character is emitted
/// literally. Other quote styles treat a backslash as a literal escape of
/// the next character.
pub fn parse_args(input: &str) -> Vec<String> {
    if input.trim().is_empty() {
        return Vec::new();
    }
    let chars: Vec<char> = input.chars().collect();
    let n = chars.len();
    let mut args = Vec::new();
    let mut i = 0;

    loop {
        while i < n && chars[i].is_whitespace() {
            i += 1;
        }
        i = skip_kwarg_prefix(&chars, i);
        while i < n && chars[i] == ' ' {
            i += 1;
        }

        if i < n && matches!(chars[i], '"' | '\'' | '`') {
            let quote = chars[i];
            i += 1;
            let mut value = String::new();
            while i < n {
                let c = chars[i];
                if c == '\\' && i + 1 < n {
                    let next = chars[i + 1];
                    if quote == '"' {
                        match next {
                            'n' => value.push('\n'),
                            't' => value.push('\t'),
                            '\\' => value.push('\\'),
                            other => value.push(other),
                        }
                    } else {
                        value.push(next);
                    }
                    i += 2;
                    continue;
                }
                if c == quote {
                    i += 1;
                    break;
                }
                value.push(c);
                i += 1;
            }
            while i < n && chars[i] != ',' {
                i += 1;
            }
            args.push(value);
        } else {
            let start = i;
            while i < n && chars[i] != ',' {
                i += 1;
            }
            let value: String = chars[start..i].iter().collect();
            args.push(value.trim().to_string());
        }

        if i < n && chars[i] == ',' {
            i += 1;
            continue;
        }
        break;
    }

    args
}

// ── Spawn detection ────────────────────────────────────────

/// POSIX-like word split: single quotes are literal; double-quoted and
/// backtick regions respect backslash escapes.
fn shell_tokens(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut has_content = false;
    let mut quote: Option<char> = None;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some('\'') => {
                if c == '\'' {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            Some(q) => {
                if c == '\\' {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                } else if c == q {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            None => match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    has_content = true;
                }
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                        has_content = true;
                    }
                }
                c if c.is_whitespace() => {
                    if has_content || !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                        has_content = false;
                    }
                }
                other => {
                    current.push(other);
                    has_content = true;
                }
            },
        }
    }
    if has_content || !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// A `Bash` call whose command is `gloop [flags…] --task "…"` is a subagent
/// spawn; the task string is extracted. Anything else stays a regular call.
pub fn detect_spawn(call: &ToolCall) -> Option<String> {
    if call.name != "Bash" {
        return None;
    }
    let command = call.raw_args.first()?;
    let tokens = shell_tokens(command);
    let first = tokens.first()?;
    let basename = first.rsplit('/').next().unwrap_or(first);
    if basename != "gloop" {
        return None;
    }

    let mut iter = tokens.iter().skip(1);
    while let Some(token) = iter.next() {
        if token == "--task" {
            return iter.next().cloned();
        }
        if let Some(task) = token.strip_prefix("--task=") {
            return Some(task.to_string());
        }
    }
    None
}

// ── Result formatting ──────────────────────────────────────

/// The synthetic blob fed back to the model after a tool batch.
pub fn format_tool_results(results: &[ToolResult]) -> String {
    results
        .iter()
        .map(|result| {
            format!(
                "<tool_result name=\"{}\" status=\"{}\">\n{}\n</tool_result>",
                result.name,
                if result.success { "success" } else { "error" },
                result.output
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn spawn_result_blob(result: &SpawnResult) -> String {
    let status = if result.success { "success" } else { "error" };
    let mut body = if result.summary.is_empty() {
        if result.success {
            "Subagent completed with no summary.".to_string()
        } else {
            format!("Subagent failed with exit code {}", result.exit_code)
        }
    } else {
        result.summary.clone()
    };
    if !result.success && !result.stderr.trim().is_empty() {
        body.push('\n');
        body.push_str(result.stderr.trim());
    }
    format!("<tool_result name=\"Bash\" status=\"{status}\">\n{body}\n</tool_result>")
}

// ── Form construction ──────────────────────────────────────

/// Translate a raw response into the next Form: memory operations first
/// (remembers, then forgets), then tool work, then the terminal action.
pub fn parse_to_form(text: &str) -> Form {
    let parsed = parse_response(text);

    let mut forms: Vec<Form> = Vec::new();
    for content in parsed.remembers {
        forms.push(Form::Remember(content, Box::new(Form::Nil)));
    }
    for content in parsed.forgets {
        forms.push(Form::Forget(content, Box::new(Form::Nil)));
    }

    let main = build_main_form(parsed.tool_calls);
    if forms.is_empty() {
        main
    } else {
        forms.push(main);
        Form::seq(forms)
    }
}

fn first_arg_or(call: &ToolCall, default: &str) -> String {
    call.raw_args
        .first()
        .filter(|a| !a.trim().is_empty())
        .cloned()
        .unwrap_or_else(|| default.to_string())
}

fn build_main_form(calls: Vec<ToolCall>) -> Form {
    if calls.is_empty() {
        return Form::Nil;
    }

    // Partition: Reboot preempts, CompleteTask completes, the rest run.
    let mut reboot: Option<String> = None;
    let mut complete: Option<String> = None;
    let mut regular: Vec<ToolCall> = Vec::new();
    for call in calls {
        match call.name.as_str() {
            "Reboot" => {
                if reboot.is_none() {
                    reboot = Some(first_arg_or(&call, "unspecified"));
                }
            }
            "CompleteTask" => {
                if complete.is_none() {
                    complete = Some(first_arg_or(&call, "Task complete"));
                }
            }
            _ => regular.push(call),
        }
    }

    // Reboot wins over CompleteTask; either runs after the regular calls.
    let terminal = match (reboot, complete) {
        (Some(reason), _) => Some(Form::Reboot(reason)),
        (None, Some(summary)) => Some(Form::Done(summary)),
        (None, None) => None,
    };
    if let Some(terminal) = terminal {
        return if regular.is_empty() {
            terminal
        } else {
            Form::Invoke(regular, Box::new(move |_| terminal))
        };
    }

    // Non-terminal: peel off subagent spawns, run plain tools first.
    let mut plain: Vec<ToolCall> = Vec::new();
    let mut spawns: VecDeque<String> = VecDeque::new();
    for call in regular {
        match detect_spawn(&call) {
            Some(task) => spawns.push_back(task),
            None => plain.push(call),
        }
    }

    if spawns.is_empty() {
        return Form::Invoke(
            plain,
            Box::new(|results| Form::Think(format_tool_results(&results))),
        );
    }
    if plain.is_empty() {
        return build_spawn_chain(spawns, Vec::new());
    }
    Form::Invoke(
        plain,
        Box::new(move |results| build_spawn_chain(spawns, vec![format_tool_results(&results)])),
    )
}

/// Right-fold the spawn tasks: each spawn emits its result blob, and the
/// final Think receives every blob in order.
fn build_spawn_chain(mut tasks: VecDeque<String>, blobs: Vec<String>) -> Form {
    match tasks.pop_front() {
        None => Form::Think(blobs.join("\n\n")),
        Some(task) => Form::Spawn(
            task,
            Box::new(move |result| {
                let blob = spawn_result_blob(&result);
                let mut blobs = blobs;
                blobs.push(blob.clone());
                Form::Emit(blob, Box::new(build_spawn_chain(tasks, blobs)))
            }),
        ),
    }
}
