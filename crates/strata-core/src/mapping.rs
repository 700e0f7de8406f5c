//! Subject to file mapping
//!
//! A subject first resolves to a destination, the identity that owns a
//! database file. Several subjects may share a destination; the default
//! mapping gives every subject its own. The destination is then escaped into
//! a filename that is safe on every filesystem.

/// Extension of every database file under the root
pub const DATABASE_EXTENSION: &str = "sqlite";

/// Deterministic, collision-free subject to filename mapping
pub trait SubjectMapping: Send + Sync {
    /// Canonical on-disk identity of `subject`.
    fn destination(&self, subject: &str) -> String {
        subject.to_string()
    }

    /// Filename (without directory) of the database holding `destination`.
    fn filename(&self, destination: &str) -> String {
        format!("{}.{}", escape(destination), DATABASE_EXTENSION)
    }

    /// Inverse of [`SubjectMapping::filename`]; `None` for foreign files.
    fn destination_from_filename(&self, filename: &str) -> Option<String> {
        let stem = filename.strip_suffix(DATABASE_EXTENSION)?.strip_suffix('.')?;
        unescape(stem)
    }
}

/// One file per subject, named by the escaped subject
#[derive(Debug, Clone, Copy, Default)]
pub struct EscapedFilenames;

impl SubjectMapping for EscapedFilenames {}

/// Groups subjects under their leading path components.
///
/// With `components = 2`, `aff4:/C.1000/fs/os` and `aff4:/C.1000/stats` share
/// the destination `aff4:/C.1000`.
#[derive(Debug, Clone, Copy)]
pub struct PathPrefix {
    pub components: usize,
}

impl PathPrefix {
    pub fn new(components: usize) -> Self {
        Self {
            components: components.max(1),
        }
    }
}

impl SubjectMapping for PathPrefix {
    fn destination(&self, subject: &str) -> String {
        subject
            .split('/')
            .filter(|part| !part.is_empty())
            .take(self.components)
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Percent-escape every byte outside `[A-Za-z0-9_.~-]`.
pub fn escape(input: &str) -> String {
    urlencoding::encode(input).into_owned()
}

/// Reverse [`escape`]. Returns `None` for input `escape` could not produce.
pub fn unescape(input: &str) -> Option<String> {
    let decoded = urlencoding::decode(input).ok()?;
    // only canonical escapes name a destination
    if urlencoding::encode(&decoded) == input {
        Some(decoded.into_owned())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_safe(byte: u8) -> bool {
        byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'.' | b'-' | b'~')
    }

    #[test]
    fn test_escape_is_reversible() {
        for subject in ["aff4:/C.1000/fs/os", "plain", "100%", "", "ünï/ cödé"] {
            let escaped = escape(subject);
            assert!(escaped.bytes().all(|b| is_safe(b) || b == b'%'));
            assert_eq!(unescape(&escaped).as_deref(), Some(subject));
        }
    }

    #[test]
    fn test_unescape_rejects_foreign_names() {
        assert_eq!(unescape("has space"), None);
        assert_eq!(unescape("bad%zz"), None);
        assert_eq!(unescape("lower%2f"), None);
        assert_eq!(unescape("aff4%3A%2FC.1").as_deref(), Some("aff4:/C.1"));
    }

    #[test]
    fn test_escape_distinguishes_percent() {
        assert_ne!(escape("a/b"), escape("a%2Fb"));
    }

    #[test]
    fn test_default_filename_roundtrip() {
        let mapping = EscapedFilenames;
        let destination = mapping.destination("aff4:/C.1000");
        let filename = mapping.filename(&destination);
        assert_eq!(filename, "aff4%3A%2FC.1000.sqlite");
        assert_eq!(
            mapping.destination_from_filename(&filename).as_deref(),
            Some("aff4:/C.1000")
        );
        assert_eq!(mapping.destination_from_filename("notes.txt"), None);
    }

    #[test]
    fn test_path_prefix_groups_subjects() {
        let mapping = PathPrefix::new(2);
        assert_eq!(mapping.destination("aff4:/C.1000/fs/os"), "aff4:/C.1000");
        assert_eq!(mapping.destination("aff4:/C.1000"), "aff4:/C.1000");
        assert_eq!(mapping.destination("aff4:/C.1000/stats"), "aff4:/C.1000");
    }
}
