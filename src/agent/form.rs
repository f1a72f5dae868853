use crate::agent::effects::SpawnResult;
use std::fmt;

/// One parsed tool invocation. Arguments are positional; named-argument
/// syntax collapses to positional by key order at parse time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub name: String,
    pub raw_args: Vec<String>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, raw_args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            raw_args,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub name: String,
    pub output: String,
    pub success: bool,
}

pub type InvokeCont = Box<dyn FnOnce(Vec<ToolResult>) -> Form + Send>;
pub type BoolCont = Box<dyn FnOnce(bool) -> Form + Send>;
pub type TextCont = Box<dyn FnOnce(String) -> Form + Send>;
pub type SpawnCont = Box<dyn FnOnce(SpawnResult) -> Form + Send>;

/// The next unit of work. Pure data: the evaluator owns all behavior and
/// must dispatch exhaustively, so a new variant cannot be silently ignored.
///
/// Every non-terminal variant carries exactly one successor, possibly
/// computed from a result. `Seq` is associative with `Nil` as identity.
pub enum Form {
    /// Send a user turn and stream the reply.
    Think(String),
    /// Execute tools, then continue with their results.
    Invoke(Vec<ToolCall>, InvokeCont),
    /// Ask the user to approve a dangerous action.
    Confirm(String, BoolCont),
    /// Prompt the user for free-form input.
    Ask(String, TextCont),
    Remember(String, Box<Form>),
    Forget(String, Box<Form>),
    /// Push assistant prose to the UI and continue.
    Emit(String, Box<Form>),
    /// Rebuild the system prompt from registry + memory and install it.
    Refresh,
    /// Persist the session and terminate with the restart signal.
    Reboot(String),
    /// Terminal success.
    Done(String),
    Seq(Vec<Form>),
    Nil,
    Install(String),
    ListTools,
    /// Launch a detached subagent, then continue with its result.
    Spawn(String, SpawnCont),
}

impl Form {
    pub fn tag(&self) -> &'static str {
        match self {
            Form::Think(_) => "Think",
            Form::Invoke(_, _) => "Invoke",
            Form::Confirm(_, _) => "Confirm",
            Form::Ask(_, _) => "Ask",
            Form::Remember(_, _) => "Remember",
            Form::Forget(_, _) => "Forget",
            Form::Emit(_, _) => "Emit",
            Form::Refresh => "Refresh",
            Form::Reboot(_) => "Reboot",
            Form::Done(_) => "Done",
            Form::Seq(_) => "Seq",
            Form::Nil => "Nil",
            Form::Install(_) => "Install",
            Form::ListTools => "ListTools",
            Form::Spawn(_, _) => "Spawn",
        }
    }

    /// `Seq` with its identity collapsed.
    pub fn seq(mut forms: Vec<Form>) -> Form {
        match forms.len() {
            0 => Form::Nil,
            1 => forms.remove(0),
            _ => Form::Seq(forms),
        }
    }
}

impl fmt::Debug for Form {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Form::Think(input) => f.debug_tuple("Think").field(input).finish(),
            Form::Invoke(calls, _) => f.debug_tuple("Invoke").field(calls).finish(),
            Form::Confirm(command, _) => f.debug_tuple("Confirm").field(command).finish(),
            Form::Ask(question, _) => f.debug_tuple("Ask").field(question).finish(),
            Form::Remember(content, next) => {
                f.debug_tuple("Remember").field(content).field(next).finish()
            }
            Form::Forget(content, next) => {
                f.debug_tuple("Forget").field(content).field(next).finish()
            }
            Form::Emit(text, next) => f.debug_tuple("Emit").field(text).field(next).finish(),
            Form::Reboot(reason) => f.debug_tuple("Reboot").field(reason).finish(),
            Form::Done(summary) => f.debug_tuple("Done").field(summary).finish(),
            Form::Seq(forms) => f.debug_tuple("Seq").field(forms).finish(),
            Form::Install(source) => f.debug_tuple("Install").field(source).finish(),
            Form::Spawn(task, _) => f.debug_tuple("Spawn").field(task).finish(),
            Form::Refresh | Form::Nil | Form::ListTools => f.write_str(self.tag()),
        }
    }
}
