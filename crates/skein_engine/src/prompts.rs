//! Prompt assembly for the agent loop's reasoning calls.

use skein_core::tools::ToolDescriptor;

use crate::agent::ActionResult;

pub const REASONING_SYSTEM_PROMPT: &str = r#"You are the planning step of a tool-using agent. Given a goal, the available tools and the actions taken so far, decide the single next step.

Rules:
1. Take at most one action per step.
2. Refer to tools by their qualified name: the "server" field is the server id, the "tool" field is the tool name.
3. If the goal is achieved, or no tool can make further progress, set decision to "complete".
4. If an earlier action failed, adapt the plan instead of repeating it unchanged.
5. "goal_status" is a one-or-two-sentence summary of where the goal stands; on completion it must contain the final answer.

Respond with JSON only:
{"decision": "continue" | "complete", "reasoning": "...", "goal_status": "...", "action": {"server": "...", "tool": "...", "parameters": {...}, "justification": "..."}}

Omit "action" when the decision is "complete"."#;

/// Render the user message for one reasoning call: goal, tool catalog and
/// the full action history so far.
pub fn render_reasoning_prompt(
    goal: &str,
    tools: &[ToolDescriptor],
    history: &[ActionResult],
) -> String {
    let mut prompt = format!("Goal:\n{}\n\nAvailable tools:\n", goal);

    for tool in tools {
        prompt.push_str(&format!(
            "- {} — {}",
            tool.qualified_name(),
            tool.description
        ));
        if !tool.input_schema.required.is_empty() {
            prompt.push_str(&format!(
                " (required: {})",
                tool.input_schema.required.join(", ")
            ));
        }
        prompt.push('\n');
    }

    if history.is_empty() {
        prompt.push_str("\nNo actions taken yet.\n");
    } else {
        prompt.push_str("\nActions so far:\n");
        for action in history {
            prompt.push_str(&format!(
                "[step {}] {}:{} ({}) → {}\n{}\n",
                action.step,
                action.server,
                action.tool,
                if action.success { "ok" } else { "FAILED" },
                action.justification,
                action.result,
            ));
        }
    }

    prompt
}
