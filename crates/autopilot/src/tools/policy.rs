//! Allow-list for external programs.
//!
//! Commands never go through a shell. A command line is split into argv
//! with simple quoting rules and the program must match an allow-list
//! entry exactly. Anything else fails closed with
//! [`ToolError::PolicyViolation`].

use crate::ToolError;
use std::collections::BTreeSet;

/// Programs a workspace command may run by default.
pub const DEFAULT_ALLOWED_COMMANDS: &[&str] = &[
    "cargo", "rustc", "rustfmt", "ls", "cat", "head", "tail", "wc", "grep", "rg", "find", "diff",
    "echo", "pwd", "make", "npm", "node", "python3", "pytest", "go",
];

/// Characters that would carry shell meaning if the line were handed to a
/// shell. Rejected outside quotes so the model gets a clear error instead of
/// a literal argument.
const SHELL_OPERATORS: &[char] = &[';', '|', '&', '>', '<', '`', '$', '(', ')', '\n'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPolicy {
    allowed: BTreeSet<String>,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_COMMANDS.iter().copied())
    }
}

impl CommandPolicy {
    pub fn new(allowed: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    /// A policy that rejects every command.
    pub fn deny_all() -> Self {
        Self {
            allowed: BTreeSet::new(),
        }
    }

    pub fn is_allowed(&self, program: &str) -> bool {
        self.allowed.contains(program)
    }

    pub fn allowed(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }

    /// Split `command` into argv and check the program against the list.
    pub fn check(&self, command: &str) -> Result<Vec<String>, ToolError> {
        let argv = split_command(command)?;
        let program = argv
            .first()
            .ok_or_else(|| ToolError::policy("empty command"))?;
        if !self.is_allowed(program) {
            return Err(ToolError::policy(format!(
                "program '{program}' is not in the allow-list ({})",
                self.allowed().collect::<Vec<_>>().join(", ")
            )));
        }
        Ok(argv)
    }
}

/// Split a command line on whitespace, honoring single and double quotes.
fn split_command(command: &str) -> Result<Vec<String>, ToolError> {
    let mut argv = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in command.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_token = true;
                }
                c if SHELL_OPERATORS.contains(&c) => {
                    return Err(ToolError::policy(format!(
                        "shell operator '{}' is not supported; commands run without a shell",
                        c.escape_default()
                    )));
                }
                c if c.is_whitespace() => {
                    if in_token {
                        argv.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                c => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }

    if quote.is_some() {
        return Err(ToolError::policy("unterminated quote in command"));
    }
    if in_token {
        argv.push(current);
    }
    Ok(argv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_program_passes() {
        let policy = CommandPolicy::new(["cargo"]);
        assert_eq!(
            policy.check("cargo test --lib").unwrap(),
            vec!["cargo", "test", "--lib"]
        );
    }

    #[test]
    fn unlisted_program_fails_closed() {
        let policy = CommandPolicy::new(["cargo"]);
        let err = policy.check("rm -rf target").unwrap_err();
        assert_eq!(err.kind(), "policy_violation");
        assert!(err.to_string().contains("'rm'"));
    }

    #[test]
    fn path_to_allowed_basename_is_rejected() {
        let policy = CommandPolicy::new(["cargo"]);
        assert!(policy.check("./scripts/cargo build").is_err());
        assert!(policy.check("/usr/bin/cargo build").is_err());
    }

    #[test]
    fn shell_operators_are_rejected() {
        let policy = CommandPolicy::default();
        for cmd in [
            "ls; rm -rf /",
            "cat a | sh",
            "echo x > f",
            "echo $(whoami)",
            "ls && rm x",
        ] {
            assert!(policy.check(cmd).is_err(), "{cmd} should be rejected");
        }
    }

    #[test]
    fn quotes_group_arguments() {
        let policy = CommandPolicy::default();
        assert_eq!(
            policy.check(r#"grep -n "fn main" 'src/a b.rs'"#).unwrap(),
            vec!["grep", "-n", "fn main", "src/a b.rs"]
        );
        // Operators inside quotes are literal.
        assert_eq!(policy.check("echo 'a;b'").unwrap(), vec!["echo", "a;b"]);
        assert_eq!(policy.check("echo ''").unwrap(), vec!["echo", ""]);
    }

    #[test]
    fn malformed_lines_are_rejected() {
        let policy = CommandPolicy::default();
        assert!(policy.check("").is_err());
        assert!(policy.check("   ").is_err());
        assert!(policy.check("echo 'open").is_err());
        assert!(CommandPolicy::deny_all().check("ls").is_err());
    }
}
