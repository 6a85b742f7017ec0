const BEARER_PREFIX: &str = "Bearer ";
const REDACTED: &str = "[REDACTED]";

/// Keeps the first and last four characters of a secret. Anything short enough
/// that those eight characters would reveal most of it is replaced outright.
pub fn redact_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return REDACTED.to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.add_secret(secret);
        self
    }

    pub fn add_secret(&mut self, secret: impl Into<String>) {
        let secret = secret.into();
        if secret.trim().is_empty() || self.secrets.contains(&secret) {
            return;
        }
        self.secrets.push(secret);
        // Longest first so a secret that contains another is replaced whole.
        self.secrets.sort_by_key(|value| std::cmp::Reverse(value.len()));
    }

    pub fn merge(&mut self, other: &Redactor) {
        for secret in &other.secrets {
            self.add_secret(secret.clone());
        }
    }

    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), &redact_token(secret));
            }
        }
        scrub_bearer_tokens(&out)
    }
}

fn scrub_bearer_tokens(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(BEARER_PREFIX) {
        let (head, tail) = rest.split_at(pos + BEARER_PREFIX.len());
        out.push_str(head);
        let end = tail
            .find(|ch: char| ch.is_whitespace() || matches!(ch, '"' | '\'' | ',' | ';'))
            .unwrap_or(tail.len());
        let token = &tail[..end];
        if token.is_empty() || token.contains("...") || token == REDACTED {
            out.push_str(token);
        } else {
            out.push_str(&redact_token(token));
        }
        rest = &tail[end..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_token_keeps_four_characters_each_side() {
        assert_eq!(redact_token("at-1234567890abcd"), "at-1...abcd");
        assert_eq!(redact_token("short"), "[REDACTED]");
        assert_eq!(redact_token("12345678"), "[REDACTED]");
    }

    #[test]
    fn redactor_replaces_registered_secrets() {
        let redactor = Redactor::new().with_secret("ghp_supersecretvalue");
        let text = redactor.redact("token ghp_supersecretvalue rejected");
        assert_eq!(text, "token ghp_...alue rejected");
        assert!(!text.contains("supersecret"));
    }

    #[test]
    fn redactor_scrubs_bearer_headers_it_was_not_told_about() {
        let redactor = Redactor::new();
        let text = redactor.redact("Authorization: Bearer tk-abcdefghijklmnop, retry");
        assert_eq!(text, "Authorization: Bearer tk-a...mnop, retry");
    }

    #[test]
    fn redaction_is_stable_when_applied_twice() {
        let redactor = Redactor::new().with_secret("at-1234567890abcd");
        let once = redactor.redact("Bearer at-1234567890abcd");
        assert_eq!(redactor.redact(&once), once);
    }

    #[test]
    fn blank_secrets_are_ignored() {
        let redactor = Redactor::new().with_secret("   ");
        assert_eq!(redactor.redact("plain text"), "plain text");
    }
}
