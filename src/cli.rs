//! Interactive client menu.
//!
//! The utilities present in this module read menu choices and their arguments for the
//! `tinyrpc_cli` binary.
use std::io::{self, BufRead, Write};

use thiserror::Error;

pub const HELP: &str = "\
1 - echo a message
2 - server time
3 - execute a command
4 - calculate an expression
5 - ping
6 - check credentials
t - set thread count
h - help
q - quit";

#[derive(Debug, Error)]
pub enum PromptError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("input closed")]
    Closed,
    #[error("unrecognized command '{0}'")]
    Unrecognized(String),
}

/// Possible commands from a user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Echo,
    Time,
    Exec,
    Calculate,
    Ping,
    Credentials,
    Threads,
    Help,
    Quit,
}

impl TryFrom<&str> for Command {
    type Error = PromptError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.trim() {
            "1" => Ok(Command::Echo),
            "2" => Ok(Command::Time),
            "3" => Ok(Command::Exec),
            "4" => Ok(Command::Calculate),
            "5" => Ok(Command::Ping),
            "6" => Ok(Command::Credentials),
            "t" => Ok(Command::Threads),
            "h" => Ok(Command::Help),
            "q" => Ok(Command::Quit),
            s => Err(PromptError::Unrecognized(s.to_string())),
        }
    }
}

/// Writes `label`, then reads one line without its line ending.
pub fn ask<R, W>(mut reader: R, mut writer: W, label: &str) -> Result<String, PromptError>
where
    R: BufRead,
    W: Write,
{
    write!(writer, "{label}")?;
    writer.flush()?;

    let mut s = String::new();
    if reader.read_line(&mut s)? == 0 {
        return Err(PromptError::Closed);
    }
    Ok(s.trim_end_matches(['\r', '\n']).to_string())
}

/// Prompt user for a menu command.
pub fn prompt<R, W>(reader: R, writer: W) -> Result<Command, PromptError>
where
    R: BufRead,
    W: Write,
{
    let line = ask(reader, writer, "> ")?;
    Command::try_from(line.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_prints_correctly() {
        let input = b"q\n";
        let mut output = Vec::new();

        assert_eq!(prompt(&input[..], &mut output).unwrap(), Command::Quit);
        assert_eq!("> ", String::from_utf8(output).unwrap());
    }

    #[test]
    fn prompt_parses_menu() {
        let cases = [
            ("1", Command::Echo),
            ("2", Command::Time),
            ("3", Command::Exec),
            ("4", Command::Calculate),
            ("5", Command::Ping),
            ("6", Command::Credentials),
            ("t", Command::Threads),
            (" h ", Command::Help),
        ];

        for (input, expected) in cases {
            assert_eq!(Command::try_from(input).unwrap(), expected);
        }
    }

    #[test]
    fn prompt_unrecognized_command() {
        let input = b"x\n";
        let err = prompt(&input[..], Vec::new()).unwrap_err();

        assert_eq!(err.to_string(), "unrecognized command 'x'");
    }

    #[test]
    fn ask_keeps_inner_spaces_and_detects_eof() {
        let mut output = Vec::new();
        let line = ask(&b"ls -la \r\n"[..], &mut output, "command: ").unwrap();

        assert_eq!(line, "ls -la ");
        assert_eq!(output, b"command: ");
        assert!(matches!(
            ask(&b""[..], Vec::new(), "> "),
            Err(PromptError::Closed)
        ));
    }
}
