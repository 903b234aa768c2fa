//! Interpretation of input lines.

/// Display name used when the user enters nothing at the prompt.
pub const DEFAULT_DISPLAY_NAME: &str = "Anonymous";

/// What a single input line asks the session to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `quit` or `exit` (any case, matched by prefix)
    Quit,
    /// Broadcast this text on the chat group
    Say(String),
    /// Blank line, nothing to do
    Empty,
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Command::Empty;
        }

        let lower = line.to_lowercase();
        if lower.starts_with("quit") || lower.starts_with("exit") {
            Command::Quit
        } else {
            Command::Say(line.to_string())
        }
    }
}

/// Display name from the startup prompt, falling back to
/// [`DEFAULT_DISPLAY_NAME`] when the answer is blank.
pub fn display_name(input: &str) -> String {
    match input.trim() {
        "" => DEFAULT_DISPLAY_NAME.to_string(),
        name => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quit_any_case() {
        assert_eq!(Command::parse("quit"), Command::Quit);
        assert_eq!(Command::parse("QUIT"), Command::Quit);
        assert_eq!(Command::parse("Exit"), Command::Quit);
        assert_eq!(Command::parse("  eXiT  \n"), Command::Quit);
    }

    #[test]
    fn test_quit_matched_by_prefix() {
        assert_eq!(Command::parse("quitting time"), Command::Quit);
        assert_eq!(Command::parse("exit now"), Command::Quit);
        assert_eq!(
            Command::parse("I quit"),
            Command::Say("I quit".to_string())
        );
    }

    #[test]
    fn test_message_keeps_case() {
        assert_eq!(
            Command::parse("Hello World\n"),
            Command::Say("Hello World".to_string())
        );
    }

    #[test]
    fn test_blank_line_is_empty() {
        assert_eq!(Command::parse(""), Command::Empty);
        assert_eq!(Command::parse("   \t\n"), Command::Empty);
    }

    #[test]
    fn test_display_name_defaults() {
        assert_eq!(display_name(""), "Anonymous");
        assert_eq!(display_name("  \n"), "Anonymous");
        assert_eq!(display_name(" alice \n"), "alice");
    }
}
