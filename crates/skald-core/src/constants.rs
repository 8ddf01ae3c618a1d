// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Fixed strings that are part of the engine's external contract.  The
//! texts below travel into conversation history and persisted sessions, so
//! changing them changes model behavior across resumed conversations —
//! treat them as frozen.

/// Generic user-interrupt notice appended when a turn is aborted before
/// tool execution.
pub const INTERRUPT_MESSAGE: &str = "[Request interrupted by user]";

/// Interrupt notice appended to the last tool result when the abort lands
/// during a tool batch.
pub const INTERRUPT_MESSAGE_FOR_TOOL_USE: &str =
    "[Request interrupted by user for tool use]";

/// Tool result content when the user rejects a permission request.
pub const REJECT_MESSAGE: &str =
    "The user doesn't want to proceed with this tool use. The tool use was rejected \
     (eg. if it was a file edit, the new_string was NOT written to the file). STOP \
     what you are doing and wait for the user to tell you how to proceed.";

/// Tool result content when a tool call is cancelled for any reason other
/// than an explicit rejection.
pub const CANCEL_MESSAGE: &str =
    "The user doesn't want to take this action right now. STOP what you are doing \
     and wait for the user to tell you how to proceed.";

/// Placeholder rendered when an assistant message carries no text.
pub const NO_CONTENT_MESSAGE: &str = "(no content)";

/// Free-form permission feedback, forwarded to the model as the tool
/// result so it can adjust course.
pub fn custom_feedback_message(feedback: &str) -> String {
    format!(
        "The user doesn't want to proceed with this tool use and gave the following \
         feedback instead:\n{feedback}"
    )
}

/// Notice placed at the head of a compacted history.
pub const COMPACTION_NOTICE: &str =
    "[Context Compression Notice] Earlier conversation history exceeded the context \
     budget and was replaced by the summary in the next message. Treat the summary \
     as the authoritative record of everything that happened before this point.";

/// Notice prepended when summarization failed and history was truncated
/// instead.
pub const TRUNCATION_NOTICE: &str =
    "[Context Truncation Notice] Earlier conversation history exceeded the context \
     budget and could not be summarized; the oldest messages were dropped. Ask the \
     user to restate anything important that is no longer visible.";

/// Summarization instruction used by the compaction engine.  The nine
/// section names are load-bearing: downstream consumers and resumed
/// sessions navigate summaries by these exact headings.
pub const COMPRESSION_PROMPT: &str = "\
Your task is to create a detailed summary of the conversation so far, paying close \
attention to the user's explicit requests and your previous actions. This summary \
will replace the conversation history, so it must be thorough enough that work can \
continue without any loss of direction.

Before writing the summary, review the conversation from start to finish and \
identify every user request, every decision that was made, and the exact state of \
the work in progress. Capture file paths, function signatures, code snippets, \
error messages, and command output verbatim where they matter; paraphrased \
technical detail is a frequent source of rework.

Your summary MUST use exactly the following sections, in this order:

1. Primary Request and Intent: Capture all of the user's explicit requests and \
intents in detail.

2. Key Technical Concepts: List all important technical concepts, technologies, \
and frameworks discussed.

3. Files and Code Sections: Enumerate specific files and code sections examined, \
modified, or created. Include full code snippets where applicable and a note on \
why each file matters.

4. Errors and fixes: List all errors that you ran into, and how you fixed them. \
Pay special attention to specific user feedback that you received.

5. Problem Solving: Document problems solved and any ongoing troubleshooting \
efforts.

6. All user messages: List ALL user messages that are not tool results. These are \
critical for understanding the user's feedback and changing intent.

7. Pending Tasks: Outline any pending tasks that you have explicitly been asked to \
work on.

8. Current Work: Describe in detail precisely what was being worked on immediately \
before this summary request, including file names and code snippets.

9. Optional Next Step: List the next step that you will take that is related to \
the most recent work. IMPORTANT: ensure that this step is DIRECTLY in line with \
the user's most recent explicit request; if the last task was concluded, only list \
a next step if it was explicitly requested.

Output only the summary, with no preamble or closing remarks.";

/// Instruction for the quick-model call that turns a shell command into a
/// permission-key prefix.  The reply contract (`none`,
/// `command_injection_detected`, or a prefix string) is parsed literally.
pub const BASH_PREFIX_PROMPT: &str = "\
Your task is to process Bash commands that an AI coding agent wants to run.

This policy spec defines how to determine the prefix of a Bash command. The \
prefix is the initial portion of the command that identifies which program and \
subcommand is being invoked, without any of its variable arguments. Examples:

- `cat foo.txt` => `cat`
- `git status` => `git status`
- `git diff --stat HEAD` => `git diff`
- `npm run test -- --grep foo` => `npm run`
- `cargo test -p mycrate` => `cargo test`
- `python scripts/gen.py --fast` => `python`

Rules:
1. Reply with ONLY the prefix, with no quotes, backticks, or explanation.
2. If the command consists of a bare program with no subcommand, reply with the \
program name alone.
3. If no meaningful prefix can be determined, reply with the single word: none
4. If the command contains command substitution ($(...), backticks), shell \
variable expansion used to smuggle a different program, output redirection into \
an executable location, or any other attempt to make the displayed command do \
something other than what it appears to do, reply with the single word: \
command_injection_detected

Command to process:";

/// Commands allowed without prompting.  Entries match a whole command or a
/// command followed by further arguments.
pub const SAFE_COMMANDS: &[&str] = &[
    "git status",
    "git diff",
    "git log",
    "git branch",
    "pwd",
    "tree",
    "date",
    "which",
    "ls",
    "find",
    "grep",
    "head",
    "tail",
    "cat",
    "du",
    "wc",
    "echo",
    "env",
    "printenv",
];

/// Executables rejected outright, without prompting.  Mostly network
/// fetchers and browsers the agent has no business spawning.
pub const FORBIDDEN_EXECUTABLES: &[&str] = &[
    "alias", "curl", "curlie", "wget", "axel", "aria2c", "nc", "telnet", "lynx", "w3m",
    "links", "httpie", "xh", "http-prompt", "chrome", "firefox", "safari",
];

// ─── Unit tests ──────────────────────────────────────────────────────────────
