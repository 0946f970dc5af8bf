//! Shared helpers for the gateway crates

/// Minimum token length before a partial token is shown
const MIN_LEN_FOR_PARTIAL_DISPLAY: usize = 8;

/// Characters shown at each end of a masked token
const MASK_VISIBLE_CHARS: usize = 4;

/// Mask a bearer token or API key for log output
///
/// Shows the first 4 and last 4 characters for tokens longer than
/// 8 characters, otherwise `****`.
///
/// # Examples
/// ```
/// use hermes_core::util::mask_token;
/// assert_eq!(mask_token("hm_1234567890abcdef"), "hm_1…cdef");
/// assert_eq!(mask_token("short"), "****");
/// ```
#[must_use]
pub fn mask_token(token: &str) -> String {
    if token.len() <= MIN_LEN_FOR_PARTIAL_DISPLAY {
        return "****".to_string();
    }
    format!(
        "{}…{}",
        &token[..MASK_VISIBLE_CHARS],
        &token[token.len() - MASK_VISIBLE_CHARS..]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_token_long() {
        let masked = mask_token("hm_aabbccddeeff0011");
        assert_eq!(masked, "hm_a…0011");
        assert!(!masked.contains("bbccddee"));
    }

    #[test]
    fn test_mask_token_short() {
        assert_eq!(mask_token("12345678"), "****");
        assert_eq!(mask_token(""), "****");
    }
}
