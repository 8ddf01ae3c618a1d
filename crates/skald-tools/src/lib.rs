// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod builtin;
mod registry;
mod schema;
mod tool;

pub use registry::{filter_tools, ToolFilter, ToolRegistry};
pub use schema::validate_against_schema;
pub use tool::{
    ModelTier, PermissionPrompt, ResultRender, Tool, ToolContext, ToolOutput, ToolSchema,
};

pub use builtin::skill::{SkillEntry, SkillRegistry};
