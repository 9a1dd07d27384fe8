//! File name sanitization for incoming uploads.

use regex::Regex;
use snapmatch_common::layout::IMAGE_EXTENSIONS;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Name used when nothing usable is left of the original.
pub const PLACEHOLDER_NAME: &str = "photo";

/// Longest stem kept, in characters.
const MAX_STEM_CHARS: usize = 100;

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(\.[A-Za-z0-9\-]+)*\.[A-Za-z]{2,}")
        .expect("valid regex")
});

/// Characters rejected by object stores or common filesystems.
static ILLEGAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[<>:"/\\|?*#%{}^~\[\]`'@\p{Cc}]"#).expect("valid regex"));

/// Runs of separators, including the underscores produced above.
static SEPARATOR_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[_\-.\s]{2,}").expect("valid regex"));

/// Clean an uploaded file name so it is safe as both an object key segment
/// and a local file name.
///
/// Applied in order: embedded email addresses are stripped, illegal
/// characters become `_`, separator runs collapse to one `_`, and an empty
/// result becomes [`PLACEHOLDER_NAME`]. The extension is split off after
/// email stripping, cleaned separately and lowercased.
pub fn sanitize_file_name(raw: &str) -> String {
    // Browsers may send a full client-side path.
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);

    let stripped = EMAIL.replace_all(base, "");
    let (stem, extension) = split_extension(&stripped);
    // An address at the end of the name swallows the image extension with it.
    let extension = extension.or_else(|| {
        if stripped.len() == base.len() {
            return None;
        }
        split_extension(base).1.filter(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
    });

    let stem = ILLEGAL.replace_all(stem, "_");
    let stem = SEPARATOR_RUN.replace_all(&stem, "_");
    let stem: String = stem
        .trim_matches(|c: char| c == '_' || c == '-' || c == '.' || c.is_whitespace())
        .chars()
        .take(MAX_STEM_CHARS)
        .collect();
    let stem = if stem.is_empty() {
        PLACEHOLDER_NAME.to_string()
    } else {
        stem
    };

    let extension: Option<String> = extension
        .map(|ext| {
            ext.chars()
                .filter(char::is_ascii_alphanumeric)
                .take(10)
                .collect::<String>()
                .to_ascii_lowercase()
        })
        .filter(|ext| !ext.is_empty());

    match extension {
        Some(ext) => format!("{}.{}", stem, ext),
        None => stem,
    }
}

fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], Some(&name[idx + 1..])),
        _ => (name, None),
    }
}

/// Monotonic prefix source keeping sanitized names unique.
///
/// Seeded from the wall clock so values keep increasing across restarts.
#[derive(Debug)]
pub struct NameSequence {
    next: AtomicU64,
}

impl NameSequence {
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self::starting_at(seed)
    }

    pub fn starting_at(value: u64) -> Self {
        Self {
            next: AtomicU64::new(value),
        }
    }

    pub fn next_value(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Prefix an already sanitized name with the next sequence value.
    pub fn disambiguate(&self, sanitized: &str) -> String {
        format!("{}_{}", self.next_value(), sanitized)
    }
}

impl Default for NameSequence {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use snapmatch_common::StoragePath;

    #[test]
    fn test_plain_name_is_kept() {
        assert_eq!(sanitize_file_name("IMG_1234.JPG"), "IMG_1234.jpg");
        assert_eq!(sanitize_file_name("party night.png"), "party night.png");
    }

    #[test]
    fn test_email_is_stripped() {
        assert_eq!(
            sanitize_file_name("john.doe@example.com_selfie.jpg"),
            "selfie.jpg"
        );
        assert_eq!(sanitize_file_name("me+tag@mail.co.uk.png"), "photo.png");
        assert_eq!(sanitize_file_name("alice@example.com"), "photo");
        assert_eq!(sanitize_file_name("party bob@example.org.JPG"), "party.jpg");
        assert_eq!(sanitize_file_name("IMG_1@x.com.jpeg"), "photo.jpeg");
    }

    #[test]
    fn test_illegal_characters_replaced_and_collapsed() {
        assert_eq!(sanitize_file_name("a<b>c:d.jpg"), "a_b_c_d.jpg");
        assert_eq!(sanitize_file_name("what?? *really*.jpeg"), "what_really.jpeg");
        assert_eq!(sanitize_file_name("a__--..b.webp"), "a_b.webp");
    }

    #[test]
    fn test_client_path_is_dropped() {
        assert_eq!(sanitize_file_name(r"C:\Users\bob\Pictures\me.jpg"), "me.jpg");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
    }

    #[test]
    fn test_empty_becomes_placeholder() {
        assert_eq!(sanitize_file_name(""), "photo");
        assert_eq!(sanitize_file_name("???.jpg"), "photo.jpg");
        assert_eq!(sanitize_file_name(".jpg"), "jpg");
        assert_eq!(sanitize_file_name("..."), "photo");
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let seq = NameSequence::starting_at(41);
        assert_eq!(seq.disambiguate("a.jpg"), "41_a.jpg");
        assert_eq!(seq.disambiguate("a.jpg"), "42_a.jpg");
        assert!(NameSequence::new().next_value() > 1_600_000_000_000);
    }

    proptest! {
        #[test]
        fn prop_result_is_a_safe_path_segment(raw in "\\PC{0,80}") {
            let name = sanitize_file_name(&raw);
            prop_assert!(!name.is_empty());
            prop_assert!(!name.contains('/') && !name.contains('\\') && !name.contains('@'));
            prop_assert!(!name.chars().any(char::is_control));
            prop_assert!(StoragePath::root().join(&name).is_ok());
        }

        #[test]
        fn prop_email_never_survives(
            user in "[a-z0-9.]{1,12}",
            domain in "[a-z]{1,10}",
            tld in "(com|org|net|io)",
        ) {
            let address = format!("{}@{}.{}", user, domain, tld);
            prop_assert_eq!(sanitize_file_name(&address), PLACEHOLDER_NAME);
        }

        #[test]
        fn prop_disambiguated_names_differ(raw in "[a-z]{0,10}\\.jpg") {
            let seq = NameSequence::new();
            let name = sanitize_file_name(&raw);
            prop_assert_ne!(seq.disambiguate(&name), seq.disambiguate(&name));
        }
    }
}
