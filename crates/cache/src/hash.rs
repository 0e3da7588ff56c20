/// Key segment used when neither a paywall identifier nor an event name is known.
pub const CALLED_MANUALLY: &str = "$called_manually";

/// Builds the coalescer key for a paywall request: `{identifier|event|$called_manually}_{locale}`.
pub fn request_hash(identifier: Option<&str>, event_name: Option<&str>, locale: &str) -> String {
    let subject = identifier.or(event_name).unwrap_or(CALLED_MANUALLY);
    format!("{subject}_{locale}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_hash_format() {
        assert_eq!(request_hash(None, Some("purchase"), "en_US"), "purchase_en_US");
        assert_eq!(request_hash(None, None, "en_US"), "$called_manually_en_US");
        assert_eq!(
            request_hash(Some("pw-annual"), Some("purchase"), "de_DE"),
            "pw-annual_de_DE"
        );
    }
}
