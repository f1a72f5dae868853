use crate::tools::ToolRegistry;
use std::fmt::Write;

/// Render the registry as a numbered tool list with argument signatures.
/// Shared by the system prompt and the `/tools` listing.
pub fn render_tool_list(registry: &ToolRegistry) -> String {
    let mut out = String::new();
    for tool in registry.iter() {
        let args = tool
            .arguments()
            .iter()
            .map(|a| a.name.clone())
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(out, "**{}({args})**: {}", tool.name(), tool.description());
        for arg in tool.arguments() {
            if !arg.description.is_empty() {
                let _ = writeln!(out, "  - {}: {}", arg.name, arg.description);
            }
        }
    }
    out
}

/// Build the agent's system prompt from the current registry and memory.
/// Rebuilt and re-installed by the `Refresh` effect whenever either changes.
pub fn build_system_prompt(registry: &ToolRegistry, memory: &[String], model: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "You are gloop, a terminal-resident agent. You work in a loop: read the user's \
         request, call tools until the task is done, then finish.\n\n",
    );
    let _ = writeln!(prompt, "Model: {model}\n");

    prompt.push_str("## Tool Use Protocol\n\n");
    prompt.push_str("To call tools, wrap them in a <tools> block. Arguments are positional:\n\n");
    prompt.push_str("<tools>\n<tool>Bash(\"ls -la\")</tool>\n<tool>WriteFile(\"notes.txt\", \"content\")</tool>\n</tools>\n\n");
    prompt.push_str(
        "Results come back in <tool_result> blocks. Keep calling tools until the task is \
         complete, then call CompleteTask with a one-line summary. Special calls:\n\
         - CompleteTask(\"summary\") ends the task.\n\
         - Reboot(\"reason\") restarts the agent process with fresh code.\n\
         - AskUser(\"question\") asks the user for free-form input.\n\
         - ManageContext(\"instructions\") prunes old conversation history.\n\n",
    );
    prompt.push_str(
        "To persist knowledge across sessions, emit <remember>fact</remember>; to drop a \
         stale fact, emit <forget>fact</forget>.\n\n",
    );

    prompt.push_str("## Available Tools\n\n");
    prompt.push_str(&render_tool_list(registry));

    if !memory.is_empty() {
        prompt.push_str("\n## Memory\n\n");
        for entry in memory {
            let _ = writeln!(prompt, "- {entry}");
        }
    }

    prompt
}

/// System prompt for the context-prune fork: a narrow editor over the outer
/// conversation's message history.
pub fn prune_system_prompt() -> String {
    "You edit another agent's conversation history to reclaim context space. You are \
     given an index of its messages. Inspect entries with ViewMessage(index), then mark \
     stale ones with DeleteMessages(\"i, j, k\"). Message 0 is the system prompt and can \
     never be deleted. Keep the current task goal, recent results, and anything the agent \
     is actively using. When you are done, call CompleteTask with a one-line summary of \
     what you removed.\n\n\
     <tools>\n<tool>ViewMessage(3)</tool>\n</tools>\n"
        .to_string()
}
