// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
/// Built-in slash commands handled synchronously by the engine, before any
/// model call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemCommand {
    /// `/clear` — drop the conversation history of the current session.
    Clear,
    /// `/compact` — force a compaction pass immediately.
    Compact,
}

/// Recognize a system command.  Anything else (including unknown `/name`
/// inputs) is not a system command; unknown slash inputs fall through to
/// the custom-command expansion hook.
pub fn parse_system_command(input: &str) -> Option<SystemCommand> {
    match input.trim() {
        "/clear" => Some(SystemCommand::Clear),
        "/compact" => Some(SystemCommand::Compact),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_clear_and_compact() {
        assert_eq!(parse_system_command("/clear"), Some(SystemCommand::Clear));
        assert_eq!(parse_system_command(" /compact "), Some(SystemCommand::Compact));
    }

    #[test]
    fn other_inputs_are_not_system_commands() {
        assert_eq!(parse_system_command("/unknown"), None);
        assert_eq!(parse_system_command("clear"), None);
        assert_eq!(parse_system_command("/clear the table"), None);
    }
}
