//! Name normalisation used to match the same artist, track or release across
//! plays that spell it slightly differently.

/// Lowercases, drops a leading "the ", keeps only alphanumerics and whitespace
/// and collapses runs of whitespace.
pub fn normalize_name(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    let without_article = lowered.strip_prefix("the ").unwrap_or(&lowered);
    let cleaned: String = without_article
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_article_and_punctuation() {
        assert_eq!(normalize_name("The Beatles"), "beatles");
        assert_eq!(normalize_name("  AC/DC  "), "acdc");
        assert_eq!(normalize_name("Hello,   World!"), "hello world");
    }

    #[test]
    fn keeps_inner_the() {
        assert_eq!(normalize_name("Rage Against The Machine"), "rage against the machine");
        assert_eq!(normalize_name("Theory"), "theory");
    }

    #[test]
    fn unicode_letters_survive() {
        assert_eq!(normalize_name("Sigur Rós"), "sigur rós");
        assert_eq!(normalize_name("…"), "");
    }
}
