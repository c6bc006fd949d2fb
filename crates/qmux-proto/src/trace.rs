//! Helpers for frame-level trace output.

use std::fmt::Write as _;

/// Render a byte buffer as colon-delimited hex, the format the frame
/// traces use.
#[must_use]
pub fn str_hex(data: &[u8], delimiter: char) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            out.push(delimiter);
        }
        // Writing into a String cannot fail.
        let _ = write!(out, "{byte:02X}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_with_delimiter() {
        assert_eq!(str_hex(&[0x01, 0x22, 0x00], ':'), "01:22:00");
        assert_eq!(str_hex(&[], ':'), "");
        assert_eq!(str_hex(&[0xAB], ' '), "AB");
    }
}
