use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShopChatError {
    #[error("Catalog load error: {0}")]
    CatalogLoad(String),

    #[error("Completion transport error: {0}")]
    CompletionTransport(String),

    #[error("Completion timed out after {0}s")]
    CompletionTimeout(u64),

    #[error("Completion parse error: {0}")]
    CompletionParse(String),

    #[error("Completion contained no usable text")]
    EmptyCompletion,

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShopChatError {
    /// Failures of the completion call that the caller answers with the fallback reply.
    pub fn is_completion_failure(&self) -> bool {
        matches!(
            self,
            ShopChatError::CompletionTransport(_)
                | ShopChatError::CompletionTimeout(_)
                | ShopChatError::EmptyCompletion
                | ShopChatError::Http(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let e = ShopChatError::CatalogLoad("missing file".into());
        assert_eq!(e.to_string(), "Catalog load error: missing file");

        let e = ShopChatError::CompletionTimeout(25);
        assert_eq!(e.to_string(), "Completion timed out after 25s");

        let e = ShopChatError::EmptyCompletion;
        assert_eq!(e.to_string(), "Completion contained no usable text");

        let e = ShopChatError::Delivery("HTTP 400".into());
        assert_eq!(e.to_string(), "Delivery error: HTTP 400");

        let e = ShopChatError::Config("missing key".into());
        assert_eq!(e.to_string(), "Config error: missing key");
    }

    #[test]
    fn test_completion_failure_grouping() {
        assert!(ShopChatError::CompletionTransport("HTTP 502".into()).is_completion_failure());
        assert!(ShopChatError::CompletionTimeout(25).is_completion_failure());
        assert!(ShopChatError::EmptyCompletion.is_completion_failure());
        assert!(!ShopChatError::CompletionParse("bad json".into()).is_completion_failure());
        assert!(!ShopChatError::Delivery("down".into()).is_completion_failure());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let e: ShopChatError = io_err.into();
        assert!(e.to_string().contains("not found"));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{{invalid").unwrap_err();
        let e: ShopChatError = json_err.into();
        assert!(e.to_string().contains("JSON error"));
    }
}
