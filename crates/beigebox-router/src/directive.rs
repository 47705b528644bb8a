//! Directive parser — user-level routing overrides.
//!
//! Prefix a message with `z: <directive>` to bypass the classifier
//! stages. The prefix is stripped before the message reaches the model;
//! the wire log records the override.
//!
//! Syntax:
//!     z: simple          → force the fast route
//!     z: complex         → force the large route
//!     z: code            → force the code route
//!     z: search          → force web search
//!     z: calc <expr>     → force the calculator (remainder is the input)
//!     z: <model:tag>     → force an exact model
//!     z: help            → list directives
//!     z: complex,search  → directives compose

use tracing::info;

/// Recognized route aliases (directive token → route name).
const ROUTE_ALIASES: &[(&str, &str)] = &[
    ("simple", "fast"),
    ("easy", "fast"),
    ("fast", "fast"),
    ("complex", "large"),
    ("hard", "large"),
    ("large", "large"),
    ("code", "code"),
    ("coding", "code"),
    ("reason", "large"),
    ("reasoning", "large"),
    ("default", "default"),
];

/// Recognized tool directives (directive token → tool name).
const TOOL_DIRECTIVES: &[(&str, &str)] = &[
    ("search", "web_search"),
    ("websearch", "web_search"),
    ("memory", "memory"),
    ("rag", "memory"),
    ("recall", "memory"),
    ("calc", "calculator"),
    ("math", "calculator"),
    ("time", "datetime"),
    ("date", "datetime"),
    ("clock", "datetime"),
    ("sysinfo", "system_info"),
    ("system", "system_info"),
    ("status", "system_info"),
];

pub const HELP_TEXT: &str = "Available z-commands:

  ROUTING
    z: simple/easy/fast    → route to fast model
    z: complex/hard/large  → route to large model
    z: code/coding         → route to code model
    z: <model:tag>         → route to exact model (e.g. llama3:8b)

  TOOLS
    z: search              → force web search
    z: memory/rag/recall   → search past conversations
    z: calc/math <expr>    → evaluate math expression
    z: time/date/clock     → current time and date

  CHAINING
    z: complex,search      → combine multiple directives

  META
    z: help                → show this help";

/// Parsed directive. Ephemeral — applied to the request then dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZCommand {
    /// True if a `z:` prefix was found.
    pub active: bool,
    /// Route name to force ("" = don't override).
    pub route: String,
    /// Exact model to force ("" = use the route).
    pub model: String,
    pub tools: Vec<String>,
    /// Input for tool-only directives (calc expression).
    pub tool_input: String,
    /// The actual user message, prefix stripped.
    pub message: String,
    /// Raw directive token, for the wire log.
    pub raw_directives: String,
    pub is_help: bool,
}

fn lookup(table: &[(&'static str, &'static str)], key: &str) -> Option<&'static str> {
    table.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

/// Parse a user message for a `z:` directive prefix (case-insensitive).
///
/// No prefix → `ZCommand { active: false, message: <original> }`.
pub fn parse_directive(text: &str) -> ZCommand {
    let trimmed = text.trim_start();
    let rest = match strip_z_prefix(trimmed) {
        Some(r) => r.trim_start(),
        None => return ZCommand { message: text.to_string(), ..Default::default() },
    };
    // The directive occupies the first line only; later lines are dropped
    let rest = rest.split('\n').next().unwrap_or(rest).trim_end();

    let (first_token, remaining) = match rest.split_once(char::is_whitespace) {
        Some((head, tail)) => (head, tail.trim_start().to_string()),
        None => (rest, String::new()),
    };
    let first_token = first_token.trim_end_matches(',').to_lowercase();
    if first_token.is_empty() {
        return ZCommand { message: text.to_string(), ..Default::default() };
    }

    if first_token == "help" {
        return ZCommand {
            active: true,
            is_help: true,
            message: HELP_TEXT.to_string(),
            raw_directives: "help".to_string(),
            ..Default::default()
        };
    }

    let mut route = String::new();
    let mut model = String::new();
    let mut tools: Vec<String> = Vec::new();
    let mut tool_input = String::new();
    let mut remaining = remaining;

    for token in first_token.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if let Some(r) = lookup(ROUTE_ALIASES, token) {
            route = r.to_string();
            continue;
        }
        if let Some(tool) = lookup(TOOL_DIRECTIVES, token) {
            tools.push(tool.to_string());
            // For calc, the remainder IS the expression
            if tool == "calculator" && !remaining.is_empty() {
                tool_input = remaining.clone();
            }
            continue;
        }
        if token.contains(':') || token.contains('/') {
            model = token.to_string();
            continue;
        }
        // Unknown directive — it's the start of the actual message
        remaining = if remaining.is_empty() {
            token.to_string()
        } else {
            format!("{token} {remaining}")
        };
    }

    info!(
        directives = %first_token,
        route = %if route.is_empty() { "(none)" } else { &route },
        model = %if model.is_empty() { "(none)" } else { &model },
        ?tools,
        "directive parsed"
    );

    ZCommand {
        active: true,
        route,
        model,
        tools,
        tool_input,
        message: remaining,
        raw_directives: first_token,
        is_help: false,
    }
}

fn strip_z_prefix(text: &str) -> Option<&str> {
    let mut chars = text.chars();
    let z = chars.next()?;
    if z != 'z' && z != 'Z' {
        return None;
    }
    let colon = chars.next()?;
    if colon != ':' {
        return None;
    }
    Some(chars.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_message_is_inactive() {
        let cmd = parse_directive("what is rust?");
        assert!(!cmd.active);
        assert_eq!(cmd.message, "what is rust?");
    }

    #[test]
    fn route_directive_strips_prefix() {
        let cmd = parse_directive("z: code write fizzbuzz");
        assert!(cmd.active);
        assert_eq!(cmd.route, "code");
        assert_eq!(cmd.message, "write fizzbuzz");
    }

    #[test]
    fn prefix_is_case_insensitive() {
        let cmd = parse_directive("Z: complex explain monads");
        assert_eq!(cmd.route, "large");
        assert_eq!(cmd.message, "explain monads");
    }

    #[test]
    fn literal_model_is_detected() {
        let cmd = parse_directive("z: llama3:8b explain quantum entanglement");
        assert_eq!(cmd.model, "llama3:8b");
        assert!(cmd.route.is_empty());
        assert_eq!(cmd.message, "explain quantum entanglement");
    }

    #[test]
    fn directives_compose_with_commas() {
        let cmd = parse_directive("z: complex,search what happened in the news today?");
        assert_eq!(cmd.route, "large");
        assert_eq!(cmd.tools, vec!["web_search".to_string()]);
        assert_eq!(cmd.message, "what happened in the news today?");
    }

    #[test]
    fn calc_consumes_the_remainder_as_input() {
        let cmd = parse_directive("z: calc 2^16 + 3^10");
        assert_eq!(cmd.tools, vec!["calculator".to_string()]);
        assert_eq!(cmd.tool_input, "2^16 + 3^10");
    }

    #[test]
    fn help_short_circuits_with_help_text() {
        let cmd = parse_directive("z: help");
        assert!(cmd.is_help);
        assert_eq!(cmd.message, HELP_TEXT);
    }

    #[test]
    fn unknown_first_token_becomes_the_message() {
        let cmd = parse_directive("z: hello there");
        assert!(cmd.active);
        assert!(cmd.route.is_empty() && cmd.model.is_empty() && cmd.tools.is_empty());
        assert_eq!(cmd.message, "hello there");
    }

    #[test]
    fn multiline_directive_keeps_only_the_first_line() {
        let cmd = parse_directive("z: code write fizzbuzz\nand also make me coffee\nplease");
        assert_eq!(cmd.route, "code");
        assert_eq!(cmd.message, "write fizzbuzz");

        let cmd = parse_directive("z: calc 2^10\nignore this line");
        assert_eq!(cmd.tool_input, "2^10");
        assert!(!cmd.tool_input.contains("ignore"));
    }

    #[test]
    fn stripped_message_never_starts_with_prefix() {
        for input in ["z: code write fizzbuzz", "z: simple hi", "Z: llama3:8b hey"] {
            let cmd = parse_directive(input);
            assert!(cmd.active);
            assert!(!cmd.message.to_lowercase().starts_with("z:"));
        }
    }
}
