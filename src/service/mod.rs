//! Remote operation implementations.
//!
//! The dispatch loop only talks to the [`Service`] trait; [`DemoService`] is the implementation
//! the server binary ships with.
pub mod expression;

use std::process::Command;

use chrono::{DateTime, Utc};
use log::{debug, info};

/// Operations a server exposes to its clients.
pub trait Service: Send + Sync + 'static {
    fn ping(&self, value: u64) -> u64;

    fn check_credentials(&self, login: &str, password: &str) -> bool;

    fn echo(&self, text: &str) -> String;

    fn get_time(&self) -> DateTime<Utc>;

    /// Runs `command` and returns its standard output. Failures come back as text.
    fn execute_command(&self, command: &str) -> String;

    fn calculate(&self, expression: &str) -> String;
}

/// Uppercasing echo, shell execution and a single configured login.
#[derive(Debug, Clone, Default)]
pub struct DemoService {
    login: String,
    password: String,
}

impl DemoService {
    pub fn new(login: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            password: password.into(),
        }
    }
}

impl Service for DemoService {
    fn ping(&self, value: u64) -> u64 {
        debug!("ping: {value}");
        value
    }

    fn check_credentials(&self, login: &str, password: &str) -> bool {
        info!("checking credentials for login '{login}'");
        login == self.login && password == self.password
    }

    fn echo(&self, text: &str) -> String {
        text.to_uppercase()
    }

    fn get_time(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn execute_command(&self, command: &str) -> String {
        info!("executing command: {command}");

        #[cfg(windows)]
        let output = Command::new("cmd").args(["/C", command]).output();
        #[cfg(not(windows))]
        let output = Command::new("sh").args(["-c", command]).output();

        match output {
            Ok(output) => String::from_utf8_lossy(&output.stdout).into_owned(),
            Err(e) => format!("Execute command failed: {e}"),
        }
    }

    fn calculate(&self, input: &str) -> String {
        match expression::evaluate(input) {
            Ok(result) => {
                debug!("{input} = {result}");
                result.to_string()
            }
            Err(e) => format!("{input} : error: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_uppercases() {
        assert_eq!(DemoService::default().echo("hello, World"), "HELLO, WORLD");
    }

    #[test]
    fn credentials_must_match_both_fields() {
        let service = DemoService::new("alice", "secret");

        assert!(service.check_credentials("alice", "secret"));
        assert!(!service.check_credentials("alice", "wrong"));
        assert!(!service.check_credentials("bob", "secret"));
    }

    #[test]
    fn ping_returns_value() {
        let service = DemoService::default();
        for value in [0, u64::MAX, 0x1010101010101010] {
            assert_eq!(service.ping(value), value);
        }
    }

    #[test]
    fn execute_command_captures_stdout() {
        let out = DemoService::default().execute_command("echo hi");
        assert!(out.contains("hi"));
    }

    #[test]
    fn calculate_formats_result_or_error() {
        let service = DemoService::default();

        assert_eq!(service.calculate("2 + 3 * 4"), "14");
        assert!(service.calculate("2 +").starts_with("2 + : error:"));
    }
}
