use crate::agent::parser;

/// Opening tags that start a suppressed region.
const OPEN_TAGS: [&str; 4] = [
    "<tools>",
    "<remember>",
    "<forget>",
    parser::SECTION_BEGIN,
];

fn closing_tag(open: &str) -> &'static str {
    match open {
        "<tools>" => "</tools>",
        "<remember>" => "</remember>",
        "<forget>" => "</forget>",
        _ => parser::SECTION_END,
    }
}

/// Tool containers get mid-stream `<tool>` extraction.
fn is_container(open: &str) -> bool {
    open == "<tools>" || open == parser::SECTION_BEGIN
}

/// A complete `<tool>` element observed mid-stream, before execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EarlyTool {
    pub name: String,
    pub preview: String,
}

#[derive(Debug, Default)]
pub struct PushOutput {
    /// Characters cleared for user-visible output.
    pub clean: String,
    /// Tools parsed early from the suppressed region.
    pub tools: Vec<EarlyTool>,
}

#[derive(Clone, Copy)]
enum State {
    Normal,
    /// Saw `<`; accumulating until the text matches or rules out a tag.
    Buffering,
    /// Inside a suppressed region opened by `open_tag`.
    Suppressing { open_tag: &'static str, depth: usize },
}

/// Character-level filter over the LLM delta stream. Suppresses tool and
/// memory markup from user-visible output, fires early tool events for
/// complete `<tool>` blocks inside a container, and survives tags split
/// across arbitrary chunk boundaries.
pub struct StreamFilter {
    state: State,
    buf: String,
    emitted_tools: usize,
}

impl Default for StreamFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamFilter {
    pub fn new() -> Self {
        Self {
            state: State::Normal,
            buf: String::new(),
            emitted_tools: 0,
        }
    }

    pub fn push(&mut self, chunk: &str) -> PushOutput {
        let mut out = PushOutput::default();
        for c in chunk.chars() {
            self.push_char(c, &mut out);
        }
        out
    }

    fn push_char(&mut self, c: char, out: &mut PushOutput) {
        match self.state {
            State::Normal => {
                if c == '<' {
                    self.state = State::Buffering;
                    self.buf.push('<');
                } else {
                    out.clean.push(c);
                }
            }
            State::Buffering => {
                self.buf.push(c);
                if let Some(&tag) = OPEN_TAGS.iter().find(|&&t| t == self.buf) {
                    self.state = State::Suppressing {
                        open_tag: tag,
                        depth: 0,
                    };
                    self.buf.clear();
                    self.emitted_tools = 0;
                } else if !OPEN_TAGS.iter().any(|t| t.starts_with(self.buf.as_str())) {
                    // Not a recognized tag after all; release it.
                    if c == '<' {
                        let released = self.buf.len() - 1;
                        out.clean.push_str(&self.buf[..released]);
                        self.buf.clear();
                        self.buf.push('<');
                    } else {
                        out.clean.push_str(&self.buf);
                        self.buf.clear();
                        self.state = State::Normal;
                    }
                }
            }
            State::Suppressing { open_tag, depth } => {
                self.buf.push(c);
                // Re-opened tag inside the region: the argument text itself
                // contains the markup, so suppression must not end early.
                if self.buf.ends_with(open_tag) {
                    self.state = State::Suppressing {
                        open_tag,
                        depth: depth + 1,
                    };
                } else if self.buf.ends_with(closing_tag(open_tag)) {
                    if depth > 0 {
                        self.state = State::Suppressing {
                            open_tag,
                            depth: depth - 1,
                        };
                    } else {
                        if is_container(open_tag) {
                            self.scan_tools(out);
                        }
                        self.state = State::Normal;
                        self.buf.clear();
                    }
                } else if is_container(open_tag) && self.buf.ends_with("</tool>") {
                    self.scan_tools(out);
                }
            }
        }
    }

    /// Emit `EarlyTool` for each complete `<tool>…</tool>` in the buffer
    /// beyond those already reported.
    fn scan_tools(&mut self, out: &mut PushOutput) {
        let mut count = 0;
        let mut search = 0;
        while let Some(start) = self.buf[search..].find("<tool>") {
            let inner_start = search + start + "<tool>".len();
            let Some(end) = self.buf[inner_start..].find("</tool>") else {
                break;
            };
            let inner = &self.buf[inner_start..inner_start + end];
            count += 1;
            if count > self.emitted_tools {
                if let Some(call) = parser::parse_tool_call(inner) {
                    let preview: String = call
                        .raw_args
                        .first()
                        .map(|a| a.chars().take(60).collect())
                        .unwrap_or_default();
                    out.tools.push(EarlyTool {
                        name: call.name,
                        preview,
                    });
                }
            }
            search = inner_start + end + "</tool>".len();
        }
        self.emitted_tools = self.emitted_tools.max(count);
    }

    /// End of stream: release any half-matched tag as normal text, drop any
    /// still-suppressed region, and reset.
    pub fn flush(&mut self) -> String {
        let released = match self.state {
            State::Buffering => std::mem::take(&mut self.buf),
            _ => {
                self.buf.clear();
                String::new()
            }
        };
        self.state = State::Normal;
        self.emitted_tools = 0;
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(filter: &mut StreamFilter, chunks: &[&str]) -> (String, Vec<EarlyTool>) {
        let mut clean = String::new();
        let mut tools = Vec::new();
        for chunk in chunks {
            let out = filter.push(chunk);
            clean.push_str(&out.clean);
            tools.extend(out.tools);
        }
        clean.push_str(&filter.flush());
        (clean, tools)
    }

    #[test]
    fn plain_text_passes_through_verbatim() {
        let mut filter = StreamFilter::new();
        let (clean, tools) = feed(&mut filter, &["Hello, ", "world!"]);
        assert_eq!(clean, "Hello, world!");
        assert!(tools.is_empty());
    }

    #[test]
    fn angle_brackets_without_tags_pass_through() {
        let mut filter = StreamFilter::new();
        let (clean, _) = feed(&mut filter, &["a < b and x<y>z"]);
        assert_eq!(clean, "a < b and x<y>z");
    }

    #[test]
    fn consecutive_angle_brackets_pass_through() {
        let mut filter = StreamFilter::new();
        let (clean, _) = feed(&mut filter, &["a <<tag"]);
        assert_eq!(clean, "a <<tag");
    }

    #[test]
    fn tools_block_is_suppressed() {
        let mut filter = StreamFilter::new();
        let (clean, tools) = feed(
            &mut filter,
            &["Before. <tools><tool>Echo(\"hi\")</tool></tools> After."],
        );
        assert_eq!(clean, "Before.  After.");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "Echo");
        assert_eq!(tools[0].preview, "hi");
    }

    #[test]
    fn tag_split_across_chunks_still_suppresses() {
        let mut filter = StreamFilter::new();
        let (clean, tools) = feed(
            &mut filter,
            &["Hi <to", "ols><tool>Ec", "ho(\"x\")</to", "ol></tools> bye"],
        );
        assert_eq!(clean, "Hi  bye");
        assert_eq!(tools.len(), 1);
    }

    #[test]
    fn every_tool_fires_one_event() {
        let mut filter = StreamFilter::new();
        let (clean, tools) = feed(
            &mut filter,
            &["<tools><tool>A(\"1\")</tool><tool>B(\"2\")</tool><tool>C(\"3\")</tool></tools>"],
        );
        assert!(clean.is_empty());
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
    }

    #[test]
    fn preview_truncated_to_sixty() {
        let long = "x".repeat(100);
        let mut filter = StreamFilter::new();
        let input = format!("<tools><tool>Echo(\"{long}\")</tool></tools>");
        let (_, tools) = feed(&mut filter, &[&input]);
        assert_eq!(tools[0].preview.chars().count(), 60);
    }

    #[test]
    fn remember_and_forget_suppressed() {
        let mut filter = StreamFilter::new();
        let (clean, tools) = feed(
            &mut filter,
            &["Noted. <remember>tea at 4</remember><forget>coffee</forget> Done."],
        );
        assert_eq!(clean, "Noted.  Done.");
        assert!(tools.is_empty());
    }

    #[test]
    fn sentinel_section_suppressed() {
        let mut filter = StreamFilter::new();
        let input = format!(
            "ok {}<|tool_call_begin|>Echo<|tool_call_argument_begin|>{{}}<|tool_call_end|>{} done",
            parser::SECTION_BEGIN,
            parser::SECTION_END
        );
        let (clean, _) = feed(&mut filter, &[&input]);
        assert_eq!(clean, "ok  done");
    }

    #[test]
    fn nested_open_tag_keeps_suppressing() {
        // A tool argument that itself contains the markup literals.
        let mut filter = StreamFilter::new();
        let input = "<tools><tool>WriteFile(\"p\", \"use <tools> here\")</tool></tools>extra</tools> visible";
        let (clean, _) = feed(&mut filter, &[input]);
        // The inner <tools> bumps depth, so the first </tools> only closes
        // the nested level; text resumes after the second one.
        assert_eq!(clean, " visible");
    }

    #[test]
    fn half_matched_tag_flushes_as_text() {
        let mut filter = StreamFilter::new();
        let (clean, _) = feed(&mut filter, &["ending with <to"]);
        assert_eq!(clean, "ending with <to");
    }

    #[test]
    fn unterminated_region_is_dropped() {
        let mut filter = StreamFilter::new();
        let (clean, _) = feed(&mut filter, &["shown <tools><tool>A(\"1\")</tool>"]);
        assert_eq!(clean, "shown ");
    }

    #[test]
    fn filter_is_reusable_after_flush() {
        let mut filter = StreamFilter::new();
        let (first, _) = feed(&mut filter, &["<tools><tool>A(\"1\")</tool></tools>"]);
        assert!(first.is_empty());
        let (second, tools) = feed(&mut filter, &["back to normal"]);
        assert_eq!(second, "back to normal");
        assert!(tools.is_empty());
    }
}
