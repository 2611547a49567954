// src/utils/security.rs
//! Input hygiene for peer-controlled strings.

/// Security-related string validation utilities
pub struct StringValidator;

impl StringValidator {
    /// Sanitize a log message to prevent log injection
    pub fn sanitize_log(input: &str) -> String {
        input
            .replace('\n', "\\n")
            .replace('\r', "\\r")
            .replace('\t', "\\t")
    }

    /// Lossily decode and sanitize bytes received from a peer for logging
    pub fn sanitize_bytes(input: &[u8]) -> String {
        Self::sanitize_log(&String::from_utf8_lossy(input))
    }

    /// Whether a string is free of control characters
    pub fn is_printable(input: &str) -> bool {
        !input.chars().any(char::is_control)
    }
}
