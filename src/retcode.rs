//! In-band remote return codes.
//!
//! Remote shells only hand back a byte stream, so the exit status of the remote
//! command is recovered by appending an `echo` of `$?` behind a marker and
//! fishing it back out of stdout.

use memchr::memmem;

/// Marker printed right before the remote exit status.
pub const RC_MAGIC: &str = "XXRETCODE:";

/// Code reported for a host that never produced a return code.
pub const RC_FAILED: i32 = 254;

/// Appends the marker echo to a remote command.
pub fn append_marker(command: &str) -> String {
    format!("{}; echo {}$?", command, RC_MAGIC)
}

/// A stdout line that carried the marker.
#[derive(Debug, PartialEq, Eq)]
pub struct Marked<'a> {
    /// Output that preceded the marker on the same line.
    pub display: &'a [u8],
    /// Parsed exit status, if digits followed the marker.
    pub code: Option<i32>,
}

/// Looks for the marker in a completed line.
pub fn extract(line: &[u8]) -> Option<Marked<'_>> {
    let at = memmem::find(line, RC_MAGIC.as_bytes())?;
    let rest = &line[at + RC_MAGIC.len()..];
    let digits = rest.iter().take_while(|b| b.is_ascii_digit()).count();
    let code = std::str::from_utf8(&rest[..digits])
        .ok()
        .and_then(|s| s.parse::<i32>().ok())
        .filter(|c| (0..=255).contains(c));
    Some(Marked {
        display: &line[..at],
        code,
    })
}

/// Signal number implied by a shell exit status of `128 + signal`.
///
/// This is a heuristic: a command may legitimately exit with such a code.
pub fn killed_by_signal(code: i32) -> Option<i32> {
    if (129..=128 + 64).contains(&code) {
        Some(code - 128)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_marker() {
        assert_eq!(append_marker("uptime"), "uptime; echo XXRETCODE:$?");
    }

    #[test]
    fn test_extract_plain_line() {
        assert!(extract(b"load average: 0.1\n").is_none());
    }

    #[test]
    fn test_extract_marker_only() {
        let marked = extract(b"XXRETCODE:3\n").unwrap();
        assert_eq!(marked.display, b"");
        assert_eq!(marked.code, Some(3));
    }

    #[test]
    fn test_extract_marker_after_partial_output() {
        // Output without a trailing newline lands on the marker's line.
        let marked = extract(b"no newlineXXRETCODE:0\n").unwrap();
        assert_eq!(marked.display, b"no newline");
        assert_eq!(marked.code, Some(0));
    }

    #[test]
    fn test_extract_every_status() {
        for rc in 0..=255 {
            let line = format!("{}{}\n", RC_MAGIC, rc);
            assert_eq!(extract(line.as_bytes()).unwrap().code, Some(rc));
        }
    }

    #[test]
    fn test_extract_garbage_code() {
        assert_eq!(extract(b"XXRETCODE:\n").unwrap().code, None);
        assert_eq!(extract(b"XXRETCODE:999\n").unwrap().code, None);
    }

    #[test]
    fn test_killed_by_signal() {
        assert_eq!(killed_by_signal(0), None);
        assert_eq!(killed_by_signal(128), None);
        assert_eq!(killed_by_signal(137), Some(9));
        assert_eq!(killed_by_signal(143), Some(15));
        assert_eq!(killed_by_signal(254), None);
    }
}
