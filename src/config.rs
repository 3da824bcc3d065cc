//! Client configuration and validation.

use validator::{Validate, ValidationError};

use crate::error::{ConfigError, ConfigResult};

fn domain_scheme(domain: &str) -> Result<(), ValidationError> {
    if domain.starts_with("http://") || domain.starts_with("https://") {
        Ok(())
    } else {
        Err(ValidationError::new("scheme")
            .with_message(std::borrow::Cow::Borrowed("domain must start with http:// or https://")))
    }
}

/// Configuration for a [`crate::client::DirectLineClient`].
#[derive(Debug, Clone, Validate)]
pub struct ClientConfig {
    /// Initial bearer token.
    #[validate(length(min = 1, message = "token must not be empty"))]
    pub token: String,

    /// Base URL of the chat service, e.g. `https://directline.botframework.com`.
    #[validate(custom(function = "domain_scheme"))]
    pub domain: String,

    /// Resume an existing conversation instead of starting a new one.
    pub conversation_id: Option<String>,

    /// Appended to the `x-ms-bot-agent` header.
    pub bot_agent: Option<String>,
}

impl ClientConfig {
    pub fn new(domain: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            domain: domain.into(),
            conversation_id: None,
            bot_agent: None,
        }
    }

    pub fn with_conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_bot_agent(mut self, bot_agent: impl Into<String>) -> Self {
        self.bot_agent = Some(bot_agent.into());
        self
    }

    pub(crate) fn validated(self) -> ConfigResult<Self> {
        Validate::validate(&self)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_token() {
        let cfg = ClientConfig::new("https://example.com", "");
        assert!(cfg.validated().is_err());
    }

    #[test]
    fn rejects_bad_scheme() {
        let cfg = ClientConfig::new("ftp://example.com", "tok");
        assert!(cfg.validated().is_err());
    }

    #[test]
    fn accepts_valid_config() {
        let cfg = ClientConfig::new("https://example.com", "tok");
        assert!(cfg.validated().is_ok());
    }
}
