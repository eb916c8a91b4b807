use std::io::{self, Read};
use std::path::Path;

use trellis_core::action::{ActionLog, ActionResult, ActionType};

/// Convert JSONL session logs back into `.trl` scripts.
///
/// Conditions and expressions are not recorded, so assertions come back as
/// comments and every argument is a literal.
pub struct LogConverter;

impl LogConverter {
    pub fn convert_file(path: &Path) -> Result<String, io::Error> {
        let content = std::fs::read_to_string(path)?;
        Self::convert_str(&content)
    }

    pub fn convert_stdin() -> Result<String, io::Error> {
        let mut content = String::new();
        io::stdin().read_to_string(&mut content)?;
        Self::convert_str(&content)
    }

    fn convert_str(content: &str) -> Result<String, io::Error> {
        let mut lines = vec![
            "\"\"\"".to_string(),
            "version: 1".to_string(),
            "source: session log".to_string(),
            "\"\"\"".to_string(),
        ];
        let mut extracted = 0;

        for (number, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let log: ActionLog = serde_json::from_str(line).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Invalid JSONL at line {}: {}", number + 1, e),
                )
            })?;

            if matches!(log.action, ActionType::Extract { .. }) {
                extracted += 1;
            }
            if let Some(statement) = Self::action_to_statement(&log.action, extracted) {
                if let ActionResult::Failure(message) = &log.result {
                    if !matches!(log.action, ActionType::Assert { .. }) {
                        lines.push(format!("# failed: {}", single_line(message)));
                    }
                }
                lines.push(statement);
            }
        }

        Ok(lines.join("\n") + "\n")
    }

    /// `extracted` numbers the variables `extract` statements bind.
    fn action_to_statement(action: &ActionType, extracted: usize) -> Option<String> {
        match action {
            ActionType::Navigate { url } => Some(format!("navigate {}", quote(url))),
            ActionType::Click { selector } => Some(format!("click {}", quote(selector))),
            ActionType::Type { selector, text } => {
                Some(format!("type {}, {}", quote(selector), quote(text)))
            }
            ActionType::Select { selector, value } => {
                Some(format!("select {}, {}", quote(selector), quote(value)))
            }
            ActionType::Hover { selector } => Some(format!("hover {}", quote(selector))),
            ActionType::Wait { ms } => Some(format!("wait {}", ms)),
            ActionType::WaitFor { selector, timeout_ms } => {
                Some(format!("wait for {} timeout {}", quote(selector), timeout_ms))
            }
            ActionType::Extract { selector } => {
                Some(format!("extract {} as extracted_{}", quote(selector), extracted))
            }
            ActionType::Screenshot { name: Some(name) } => Some(format!("screenshot {}", quote(name))),
            ActionType::Screenshot { name: None } => Some("screenshot".to_string()),
            ActionType::LogComment { message } => Some(format!("log {}", quote(message))),
            ActionType::Assert { passed, message } => {
                let outcome = if *passed { "passed" } else { "failed" };
                Some(match message {
                    Some(m) => format!("# assert {}: {}", outcome, single_line(m)),
                    None => format!("# assert {}", outcome),
                })
            }
            // Skip session markers
            ActionType::StartSession | ActionType::EndSession => None,
        }
    }
}

/// Quotes `s` as a double-quoted string literal. Braces are escaped so they
/// are not read back as interpolation.
fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '{' => out.push_str("\\{"),
            '}' => out.push_str("\\}"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

fn single_line(s: &str) -> String {
    s.lines().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statement(action: ActionType) -> Option<String> {
        LogConverter::action_to_statement(&action, 1)
    }

    #[test]
    fn test_navigate_to_statement() {
        let action = ActionType::Navigate { url: "http://app.test/login".to_string() };
        assert_eq!(statement(action), Some("navigate \"http://app.test/login\"".to_string()));
    }

    #[test]
    fn test_type_to_statement() {
        let action = ActionType::Type {
            selector: "#user".to_string(),
            text: "alice".to_string(),
        };
        assert_eq!(statement(action), Some("type \"#user\", \"alice\"".to_string()));
    }

    #[test]
    fn test_select_to_statement() {
        let action = ActionType::Select {
            selector: "#country".to_string(),
            value: "NZ".to_string(),
        };
        assert_eq!(statement(action), Some("select \"#country\", \"NZ\"".to_string()));
    }

    #[test]
    fn test_wait_to_statement() {
        assert_eq!(statement(ActionType::Wait { ms: 250 }), Some("wait 250".to_string()));
    }

    #[test]
    fn test_wait_for_to_statement() {
        let action = ActionType::WaitFor {
            selector: "#dashboard".to_string(),
            timeout_ms: 3000,
        };
        assert_eq!(
            statement(action),
            Some("wait for \"#dashboard\" timeout 3000".to_string())
        );
    }

    #[test]
    fn test_extract_binds_numbered_variable() {
        let action = ActionType::Extract { selector: "h1".to_string() };
        assert_eq!(
            LogConverter::action_to_statement(&action, 3),
            Some("extract \"h1\" as extracted_3".to_string())
        );
    }

    #[test]
    fn test_screenshot_to_statement() {
        assert_eq!(
            statement(ActionType::Screenshot { name: Some("home".to_string()) }),
            Some("screenshot \"home\"".to_string())
        );
        assert_eq!(statement(ActionType::Screenshot { name: None }), Some("screenshot".to_string()));
    }

    #[test]
    fn test_assert_becomes_comment() {
        let action = ActionType::Assert {
            passed: false,
            message: Some("landed on dashboard".to_string()),
        };
        assert_eq!(
            statement(action),
            Some("# assert failed: landed on dashboard".to_string())
        );
    }

    #[test]
    fn test_session_actions_skipped() {
        assert!(statement(ActionType::StartSession).is_none());
        assert!(statement(ActionType::EndSession).is_none());
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(quote("{user}"), "\"\\{user\\}\"");
        assert_eq!(quote("a\\b"), "\"a\\\\b\"");
    }

    #[test]
    fn test_convert_jsonl() {
        let entries = [
            ActionLog::new(ActionType::StartSession, ActionResult::Success, None),
            ActionLog::new(
                ActionType::Click { selector: "#go".to_string() },
                ActionResult::Failure("Element not found: #go".to_string()),
                Some(3),
            ),
            ActionLog::new(
                ActionType::LogComment { message: "total {n}".to_string() },
                ActionResult::Success,
                None,
            ),
            ActionLog::new(ActionType::EndSession, ActionResult::Success, None),
        ];
        let jsonl = entries
            .iter()
            .map(|e| serde_json::to_string(e).unwrap())
            .collect::<Vec<_>>()
            .join("\n");

        let script = LogConverter::convert_str(&jsonl).unwrap();
        assert!(script.starts_with("\"\"\"\nversion: 1\n"));
        assert!(script.contains("# failed: Element not found: #go\nclick \"#go\""));
        assert!(script.contains("log \"total \\{n\\}\""));
        assert!(!script.contains("StartSession"));
    }

    #[test]
    fn test_converted_script_parses() {
        let entries = [
            ActionLog::new(
                ActionType::Navigate { url: "http://x.test".to_string() },
                ActionResult::Success,
                None,
            ),
            ActionLog::new(ActionType::Extract { selector: "h1".to_string() }, ActionResult::Success, None),
            ActionLog::new(ActionType::Extract { selector: "h2".to_string() }, ActionResult::Success, None),
            ActionLog::new(
                ActionType::Assert { passed: true, message: None },
                ActionResult::Success,
                None,
            ),
        ];
        let jsonl = entries
            .iter()
            .map(|e| serde_json::to_string(e).unwrap())
            .collect::<Vec<_>>()
            .join("\n");

        let script = LogConverter::convert_str(&jsonl).unwrap();
        let program = trellis_core::parser::parse(&script).unwrap();
        assert_eq!(program.metadata.get("version").map(String::as_str), Some("1"));
        assert!(script.contains("as extracted_2"));
    }

    #[test]
    fn test_invalid_line_reports_position() {
        let err = LogConverter::convert_str("\nnot json").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("line 2"));
    }
}
