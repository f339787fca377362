//! Decoding of PDF text strings (`/T`, `/V`, `/Opt` entries).

/// UTF-16BE when the string carries a byte-order mark, otherwise UTF-8 if
/// valid, otherwise PDFDocEncoding approximated as Latin-1.
pub fn decode_pdf_string(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }

    if bytes.starts_with(&[0xFE, 0xFF]) {
        return decode_utf16be(&bytes[2..]);
    }

    match std::str::from_utf8(bytes) {
        Ok(s) => clean(s),
        Err(_) => clean(&bytes.iter().map(|&b| b as char).collect::<String>()),
    }
}

fn decode_utf16be(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks(2)
        .filter(|c| c.len() == 2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    clean(&String::from_utf16_lossy(&units))
}

fn clean(s: &str) -> String {
    s.chars()
        .filter(|&c| c != '\0' && (c >= ' ' || c == '\t' || c == '\n'))
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf16_with_bom() {
        let bytes = [0xFE, 0xFF, 0x00, b'N', 0x00, b'a', 0x00, b'm', 0x00, b'e'];
        assert_eq!(decode_pdf_string(&bytes), "Name");
    }

    #[test]
    fn latin1_fallback() {
        assert_eq!(decode_pdf_string(&[b'A', 0xE9, b'B']), "AéB");
    }

    #[test]
    fn trims_and_drops_control_chars() {
        assert_eq!(decode_pdf_string(b"  First\x01 Name \0"), "First Name");
    }
}
