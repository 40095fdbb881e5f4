use crate::error::{CubeError, Result};

/// Size of one FITS block in bytes. Headers and data units are padded to a
/// multiple of this.
pub const FITS_BLOCK: usize = 2880;

/// Size of one header card in bytes.
pub const FITS_CARD: usize = 80;

/// A parsed FITS header: the raw cards in file order plus keyed access to
/// their values.
///
/// Only the primary HDU header is represented. Cards keep their original
/// 80-character images so a header can be reserialised byte-exactly.
#[derive(Debug, Clone, Default)]
pub struct Header {
    cards: Vec<String>,
}

impl Header {
    /// Create an empty header.
    pub fn new() -> Self {
        Header { cards: Vec::new() }
    }

    /// Parse a header from the start of `raw`.
    ///
    /// Consumes whole 2880-byte blocks of 80-character cards until the END
    /// card; returns the header and the byte offset where the data unit
    /// begins (the start of the block after the one holding END).
    pub fn parse(raw: &[u8]) -> Result<(Header, usize)> {
        let mut cards = Vec::new();
        let mut offset = 0usize;

        loop {
            if raw.len() < offset + FITS_BLOCK {
                return Err(CubeError::Read(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "header ends without END card",
                )));
            }
            let block = &raw[offset..offset + FITS_BLOCK];
            offset += FITS_BLOCK;

            for card in block.chunks_exact(FITS_CARD) {
                // FITS headers are restricted to printable ASCII.
                let text: String = card.iter().map(|&b| b as char).collect();
                if text.starts_with("END") && text[3..].trim().is_empty() {
                    return Ok((Header { cards }, offset));
                }
                cards.push(text);
            }
        }
    }

    /// Append a card from keyword, formatted value, and optional comment.
    pub fn push(&mut self, keyword: &str, value: &str, comment: Option<&str>) {
        let mut card = format!("{:<8}= {:>20}", keyword, value);
        if let Some(c) = comment {
            card.push_str(" / ");
            card.push_str(c);
        }
        card.truncate(FITS_CARD);
        while card.len() < FITS_CARD {
            card.push(' ');
        }
        self.cards.push(card);
    }

    /// Append a string-valued card (quoted per the FITS grammar).
    pub fn push_str(&mut self, keyword: &str, value: &str, comment: Option<&str>) {
        let quoted = format!("'{:<8}'", value);
        let mut card = format!("{:<8}= {:<20}", keyword, quoted);
        if let Some(c) = comment {
            card.push_str(" / ");
            card.push_str(c);
        }
        card.truncate(FITS_CARD);
        while card.len() < FITS_CARD {
            card.push(' ');
        }
        self.cards.push(card);
    }

    /// Append a floating-point card in the fixed exponential format used
    /// throughout the canonical header.
    pub fn push_f64(&mut self, keyword: &str, value: f64, comment: Option<&str>) {
        self.push(keyword, &format!("{:+20.13E}", value), comment);
    }

    /// Append an integer card.
    pub fn push_i64(&mut self, keyword: &str, value: i64, comment: Option<&str>) {
        self.push(keyword, &format!("{}", value), comment);
    }

    /// Look up the raw value field of a card by keyword.
    ///
    /// Returns the text between the value indicator and the comment slash,
    /// trimmed; string values keep their content with the quotes stripped.
    pub fn value(&self, keyword: &str) -> Option<String> {
        for card in &self.cards {
            let key = card.get(0..8)?.trim_end();
            if key != keyword {
                continue;
            }
            if card.get(8..10) != Some("= ") && card.get(8..9) != Some("=") {
                continue;
            }
            let body = card.get(9..)?;
            let value = match body.find('\'') {
                Some(start) => {
                    // Quoted string: runs to the closing quote.
                    let rest = &body[start + 1..];
                    let end = rest.find('\'').unwrap_or(rest.len());
                    rest[..end].trim_end().to_string()
                }
                None => {
                    let end = body.find('/').unwrap_or(body.len());
                    body[..end].trim().to_string()
                }
            };
            return Some(value);
        }
        None
    }

    /// Look up a card and parse it as f64.
    pub fn value_f64(&self, keyword: &str) -> Option<f64> {
        self.value(keyword).and_then(|v| v.trim().parse().ok())
    }

    /// Look up a card and parse it as i64.
    pub fn value_i64(&self, keyword: &str) -> Option<i64> {
        self.value(keyword).and_then(|v| v.trim().parse().ok())
    }

    /// Serialise to the on-disk form: all cards, an END card, and blank
    /// padding up to the next block boundary.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity((self.cards.len() + 1) * FITS_CARD);
        for card in &self.cards {
            out.extend_from_slice(card.as_bytes());
        }
        out.extend_from_slice(format!("{:<80}", "END").as_bytes());
        while out.len() % FITS_BLOCK != 0 {
            out.push(b' ');
        }
        out
    }

    /// Number of cards (END excluded).
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    /// True when the header holds no cards.
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_with(cards: &[&str]) -> Vec<u8> {
        let mut raw = Vec::new();
        for c in cards {
            raw.extend_from_slice(format!("{:<80}", c).as_bytes());
        }
        raw.extend_from_slice(format!("{:<80}", "END").as_bytes());
        while raw.len() % FITS_BLOCK != 0 {
            raw.push(b' ');
        }
        raw
    }

    #[test]
    fn test_parse_and_lookup() {
        let raw = block_with(&[
            "SIMPLE  =                    T",
            "BITPIX  =                  -32",
            "NAXIS   =                    3",
            "CTYPE1  = 'RA---SIN'",
            "CRVAL1  =  +1.7832500000000E+02",
        ]);
        let (h, data_at) = Header::parse(&raw).unwrap();
        assert_eq!(data_at, FITS_BLOCK);
        assert_eq!(h.value_i64("BITPIX"), Some(-32));
        assert_eq!(h.value_i64("NAXIS"), Some(3));
        assert_eq!(h.value("CTYPE1").as_deref(), Some("RA---SIN"));
        assert!((h.value_f64("CRVAL1").unwrap() - 178.325).abs() < 1e-9);
        assert_eq!(h.value("MISSING"), None);
    }

    #[test]
    fn test_missing_end_is_an_error() {
        let mut raw = Vec::new();
        raw.extend_from_slice(format!("{:<80}", "SIMPLE  =                    T").as_bytes());
        while raw.len() % FITS_BLOCK != 0 {
            raw.push(b' ');
        }
        assert!(Header::parse(&raw).is_err());
    }

    #[test]
    fn test_round_trip_block_multiple() {
        let mut h = Header::new();
        h.push("SIMPLE", "T", Some("Standard FITS"));
        h.push_i64("BITPIX", -32, None);
        h.push_f64("CDELT1", -4.0e-4, None);
        h.push_str("BUNIT", "JY/BEAM", None);
        let bytes = h.to_bytes();
        assert_eq!(bytes.len() % FITS_BLOCK, 0);
        let (back, _) = Header::parse(&bytes).unwrap();
        assert_eq!(back.value_i64("BITPIX"), Some(-32));
        assert_eq!(back.value("BUNIT").as_deref(), Some("JY/BEAM"));
        assert!((back.value_f64("CDELT1").unwrap() + 4.0e-4).abs() < 1e-18);
    }
}
