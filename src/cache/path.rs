use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Encodes a city or institution name as a single, reversible path segment.
/// ASCII alphanumerics, `-` and `_` pass through; every other byte is `%XX`.
#[must_use]
pub fn file_segment(name: &str) -> String {
    if name.is_empty() {
        return "%".to_string();
    }

    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

/// `<root>/<city>/<institution>.<ext>` with both names encoded.
#[must_use]
pub fn scoped_file(root: &Path, city: &str, institution: &str, ext: &str) -> PathBuf {
    root.join(file_segment(city))
        .join(format!("{}.{ext}", file_segment(institution)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_segment_plain() {
        assert_eq!(file_segment("CityA"), "CityA");
        assert_eq!(file_segment("dept_x-1"), "dept_x-1");
    }

    #[test]
    fn test_file_segment_escapes_separators() {
        assert_eq!(file_segment("../etc"), "%2E%2E%2Fetc");
        assert_eq!(file_segment("a b"), "a%20b");
        assert_eq!(file_segment(""), "%");
    }

    #[test]
    fn test_file_segment_non_ascii() {
        assert_eq!(file_segment("São"), "S%C3%A3o");
    }

    #[test]
    fn test_scoped_file() {
        let path = scoped_file(Path::new("/data"), "City A", "Dept/X", "log");
        assert_eq!(path, PathBuf::from("/data/City%20A/Dept%2FX.log"));
    }
}
