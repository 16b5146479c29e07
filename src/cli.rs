//! CLI utilities for rowlink.
//!
//! The utilities present in this module are used by `rowlink_cli` to read queries from a user.
use std::io::{self, BufRead, Write};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("prompt IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("unrecognized command '{0}'")]
    Unrecognized(String),
}

/// Possible commands from a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Exit command `.exit`, or end of input
    Exit,
    /// Blank line
    Empty,
    /// Query text to send to the server
    Query(String),
}

/// Prompt user for a command.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, PromptError>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ")?;
    writer.flush()?;

    if reader.read_line(&mut s)? == 0 {
        return Ok(Command::Exit);
    }

    match s.trim() {
        ".exit" => Ok(Command::Exit),
        "" => Ok(Command::Empty),
        s if !s.starts_with('.') => Ok(Command::Query(s.to_string())),
        s => Err(PromptError::Unrecognized(s.to_string())),
    }
}
