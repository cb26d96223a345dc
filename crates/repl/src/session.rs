//! Interactive session state
//!
//! A session keeps one process alive between input lines so that names
//! and functions defined on one line are visible on the next. Lines that
//! leave a block open are buffered until the block is closed or a blank
//! line is entered.

use quill::{Error, Parser, Process, Record, ScriptSystem, SyntaxErrorKind};
use tracing::debug;

pub const SOURCE_NAME: &str = "<repl>";

/// What the session has to say about one line of input.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// The input so far is incomplete.
    More,
    /// Evaluation finished; the result in its quoted form, unless None.
    Value(Option<String>),
    /// Output of a `:` command.
    Message(String),
    /// A syntax error or an uncaught script error.
    Failed(String),
    Quit,
}

pub struct Session {
    process: Process,
    pending: String,
}

impl Session {
    pub fn new(system: &ScriptSystem) -> Self {
        Session {
            process: Process::new(system),
            pending: String::new(),
        }
    }

    pub fn is_continuing(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn submit(&mut self, line: &str) -> Reply {
        if self.pending.is_empty() {
            let trimmed = line.trim();
            if trimmed.starts_with(':') {
                return self.command(trimmed);
            }
            if trimmed.is_empty() {
                return Reply::Value(None);
            }
        }

        let finishing = line.trim().is_empty();
        self.pending.push_str(line);
        self.pending.push('\n');

        let script = match Parser::new(&self.pending).with_path(SOURCE_NAME).parse() {
            Ok(script) => script,
            Err(Error::Syntax {
                kind: SyntaxErrorKind::MissingToken,
                ..
            }) if !finishing => return Reply::More,
            Err(error) => {
                self.pending.clear();
                return Reply::Failed(error.describe());
            }
        };
        self.pending.clear();

        match self.process.evaluate(&script) {
            Ok(value) if value.is_none() => Reply::Value(None),
            Ok(value) => Reply::Value(Some(value.repr())),
            Err(failure) => Reply::Failed(failure.to_string()),
        }
    }

    fn command(&mut self, command: &str) -> Reply {
        match command {
            ":quit" | ":q" => Reply::Quit,
            ":help" | ":h" => Reply::Message(HELP.trim().to_string()),
            ":vars" => {
                let globals = self.process.globals().borrow();
                let lines: Vec<String> = globals
                    .members()
                    .map(|v| format!("{} = {}", v.name(), v.value().repr()))
                    .collect();
                Reply::Message(if lines.is_empty() {
                    "(no variables)".to_string()
                } else {
                    lines.join("\n")
                })
            }
            ":modules" => {
                let modules = self.process.system().loaded_modules();
                Reply::Message(if modules.is_empty() {
                    "(no modules imported)".to_string()
                } else {
                    modules
                        .iter()
                        .map(|(name, path)| format!("{} ({})", name, path))
                        .collect::<Vec<_>>()
                        .join("\n")
                })
            }
            ":reset" => {
                let system = self.process.system().clone();
                self.process = Process::with_globals(&system, Record::new_ref());
                debug!("session reset");
                Reply::Message("Session cleared.".to_string())
            }
            other => Reply::Failed(format!("unknown command '{}' (try :help)", other)),
        }
    }
}

const HELP: &str = r#"
Quill REPL Commands:
  :quit, :q     Exit the REPL
  :vars         Show global variables
  :modules      Show imported script modules
  :reset        Forget every variable and function
  :help, :h     Show this help

Usage:
  - Statements run as soon as they are complete
  - An open block (def, if, for, while, try, record) continues on the next line;
    a blank line ends the input early
  - The value of a final expression is shown in quoted form
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(&ScriptSystem::default())
    }

    #[test]
    fn test_names_persist_between_lines() {
        let mut s = session();
        assert_eq!(s.submit("x = 20"), Reply::Value(None));
        assert_eq!(s.submit("x + 1"), Reply::Value(Some("21".to_string())));
        assert_eq!(s.submit("'a' + 'b'"), Reply::Value(Some("'ab'".to_string())));
    }

    #[test]
    fn test_open_block_continues() {
        let mut s = session();
        assert_eq!(s.submit("def square(n)"), Reply::More);
        assert!(s.is_continuing());
        assert_eq!(s.submit("    return n * n"), Reply::More);
        assert_eq!(s.submit("end"), Reply::Value(None));
        assert!(!s.is_continuing());
        assert_eq!(s.submit("square(7)"), Reply::Value(Some("49".to_string())));
    }

    #[test]
    fn test_record_scope_continues() {
        let mut s = session();
        assert_eq!(s.submit("record Point()"), Reply::More);
        assert_eq!(s.submit("    x = 3"), Reply::More);
        assert_eq!(s.submit("end"), Reply::Value(None));
        assert_eq!(s.submit("Point.x"), Reply::Value(Some("3".to_string())));
    }

    #[test]
    fn test_blank_line_reports_incomplete_input() {
        let mut s = session();
        assert_eq!(s.submit("if True"), Reply::More);
        match s.submit("") {
            Reply::Failed(message) => assert!(message.starts_with("MissingTokenError"), "{}", message),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(!s.is_continuing());
    }

    #[test]
    fn test_failure_keeps_session_usable() {
        let mut s = session();
        match s.submit("y = undefined_name") {
            Reply::Failed(message) => assert!(message.contains("NotFoundError"), "{}", message),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(s.submit("y = 3; y * 3"), Reply::Value(Some("9".to_string())));
    }

    #[test]
    fn test_commands() {
        let mut s = session();
        assert_eq!(s.submit(":vars"), Reply::Message("(no variables)".to_string()));
        s.submit("name = 'quill'");
        assert_eq!(s.submit(":vars"), Reply::Message("name = 'quill'".to_string()));
        assert_eq!(s.submit(":reset"), Reply::Message("Session cleared.".to_string()));
        assert_eq!(s.submit(":vars"), Reply::Message("(no variables)".to_string()));
        assert!(matches!(s.submit(":bogus"), Reply::Failed(_)));
        assert_eq!(s.submit(":q"), Reply::Quit);
    }
}
