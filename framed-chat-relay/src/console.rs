//! Operator input parsing for the terminal client.
//!
//! One line is one intent:
//! - `@bob see you at noon` sends privately to `bob`
//! - `ALL hello` or plain `hello` goes to everyone
//! - `/quit` (or `quit`) leaves the chat

use anyhow::{Result, anyhow};

use crate::envelope::BROADCAST;

#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Send { destination: String, body: String },
    Quit,
    Empty,
}

impl Input {
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(Input::Empty);
        }
        if is_quit(trimmed) {
            return Ok(Input::Quit);
        }

        let (first, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((first, rest)) => (first, rest.trim()),
            None => (trimmed, ""),
        };

        if let Some(name) = first.strip_prefix('@') {
            if name.is_empty() || rest.is_empty() {
                return Err(anyhow!("private messages look like: @username message"));
            }
            return Ok(Input::Send {
                destination: name.to_string(),
                body: rest.to_string(),
            });
        }

        if first.eq_ignore_ascii_case(BROADCAST) && !rest.is_empty() {
            return Ok(Input::Send {
                destination: BROADCAST.to_string(),
                body: rest.to_string(),
            });
        }

        Ok(Input::Send {
            destination: BROADCAST.to_string(),
            body: trimmed.to_string(),
        })
    }
}

pub fn is_quit(line: &str) -> bool {
    let line = line.trim();
    line.eq_ignore_ascii_case("/quit") || line.eq_ignore_ascii_case("quit")
}
