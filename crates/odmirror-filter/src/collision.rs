//! POSIX case-collision detection.
//!
//! The local filesystem is case-sensitive; the remote namespace is not.
//! Before creating a folder online or uploading a new file, the engine
//! lists the parent's children and refuses any candidate whose lowercase
//! name equals an existing sibling's lowercase name while the exact names
//! differ. The engine never merges such items.

/// Returns the first existing sibling that collides with `candidate`
/// case-insensitively without being the same exact name.
pub fn find_case_collision<'a, I>(candidate: &str, siblings: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let candidate_lower = candidate.to_lowercase();
    siblings
        .into_iter()
        .find(|s| *s != candidate && s.to_lowercase() == candidate_lower)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_case_only_difference() {
        let siblings = ["Report.txt", "notes.md"];
        assert_eq!(
            find_case_collision("report.txt", siblings),
            Some("Report.txt")
        );
    }

    #[test]
    fn test_exact_match_is_not_a_collision() {
        let siblings = ["Report.txt"];
        assert_eq!(find_case_collision("Report.txt", siblings), None);
    }

    #[test]
    fn test_distinct_names_pass() {
        let siblings = ["Report.txt", "summary.txt"];
        assert_eq!(find_case_collision("data.csv", siblings), None);
    }

    #[test]
    fn test_unicode_case_folding() {
        let siblings = ["Straße.txt"];
        assert_eq!(
            find_case_collision("straße.txt", siblings),
            Some("Straße.txt")
        );
    }
}
