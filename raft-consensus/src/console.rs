//! Line commands accepted by the `node` binary's console.
//!
//! [`ConsoleCommand`] is the operator interface, separate from
//! [`crate::command::CommandPayload`], which is what gets replicated. Only
//! PUT and DEL turn into log entries; GET reads this node's applied state.

use anyhow::{anyhow, Result};

#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    Put { key: String, value: String },
    Get { key: String },
    Delete { key: String },
    Status,
    Help,
    Exit,
}

pub const HELP: &str = "commands: PUT/p <key> <value>, GET/g <key>, DEL/d <key>, STATUS/s, HELP/h, EXIT/e";

impl ConsoleCommand {
    /// Parses one line of input. Command words are case-insensitive and
    /// have single-letter aliases; keys and values are kept verbatim.
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = parts.first() else {
            return Err(anyhow!("empty command"));
        };

        let word = first.to_uppercase();
        let normalized = match word.as_str() {
            "P" => "PUT",
            "G" => "GET",
            "D" | "DELETE" => "DEL",
            "S" => "STATUS",
            "H" => "HELP",
            "E" | "QUIT" => "EXIT",
            other => other,
        };

        match (normalized, parts.len()) {
            ("EXIT", 1) => Ok(ConsoleCommand::Exit),
            ("HELP", 1) => Ok(ConsoleCommand::Help),
            ("STATUS", 1) => Ok(ConsoleCommand::Status),
            ("GET", 2) => Ok(ConsoleCommand::Get {
                key: parts[1].to_string(),
            }),
            ("DEL", 2) => Ok(ConsoleCommand::Delete {
                key: parts[1].to_string(),
            }),
            ("PUT", 3) => Ok(ConsoleCommand::Put {
                key: parts[1].to_string(),
                value: parts[2].to_string(),
            }),
            ("GET", _) => Err(anyhow!("GET requires exactly one argument: GET <key>")),
            ("DEL", _) => Err(anyhow!("DEL requires exactly one argument: DEL <key>")),
            ("PUT", _) => Err(anyhow!("PUT requires exactly two arguments: PUT <key> <value>")),
            ("EXIT" | "HELP" | "STATUS", _) => Err(anyhow!("{normalized} takes no arguments")),
            _ => Err(anyhow!("invalid command. {HELP}")),
        }
    }
}
