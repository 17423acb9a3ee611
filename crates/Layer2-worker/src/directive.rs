//! Secondary command directives
//!
//! The primary command can ask for follow-up commands in the same worker by
//! printing lines of the form `EXEC: <command>`. The prefix is
//! case-sensitive; surrounding whitespace is trimmed and there is no
//! escaping or nesting.

/// Directive prefix
pub const DIRECTIVE_PREFIX: &str = "EXEC:";

/// Extract directive commands from command output, in order of appearance.
pub fn parse_directives(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix(DIRECTIVE_PREFIX))
        .map(str::trim)
        .filter(|command| !command.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_in_order() {
        let output = "line1\nEXEC: echo hi\nline3\nEXEC: false\nline5";
        assert_eq!(parse_directives(output), vec!["echo hi", "false"]);
    }

    #[test]
    fn test_prefix_is_case_sensitive() {
        let output = "exec: rm -rf /\nExec: ls\nEXEC:ls -la";
        assert_eq!(parse_directives(output), vec!["ls -la"]);
    }

    #[test]
    fn test_trims_whitespace() {
        let output = "   EXEC:    pip install requests   \r\n\tEXEC: python script.py";
        assert_eq!(
            parse_directives(output),
            vec!["pip install requests", "python script.py"]
        );
    }

    #[test]
    fn test_ignores_empty_and_inline() {
        let output = "EXEC:\nEXEC:    \nrun EXEC: echo nope\n";
        assert!(parse_directives(output).is_empty());
    }
}
