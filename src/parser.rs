//! Record Parser (§4.3): a byte-fed line accumulator plus the substring-based
//! field extraction described in §6.2.

use crate::store::ExpiryClass;

/// Maximum size of one accumulated input line.
pub const LINE_BUFFER_SIZE: usize = 4096;

/// Secondary-key field names recognized in priority order (§3). The first
/// one found in the line wins — later matches are not consulted.
const SECONDARY_KEY_FIELDS: &[(&str, ExpiryClass)] = &[
    ("Instance", ExpiryClass::Sensor),
    ("Reference", ExpiryClass::Sensor),
    ("Message ID", ExpiryClass::Ais),
    ("User ID", ExpiryClass::Ais),
    ("Proprietary ID", ExpiryClass::Sensor),
];

/// One successfully parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRecord {
    pub src: u8,
    pub dst: u8,
    pub prn: u32,
    pub description: Option<String>,
    pub secondary_key: Option<String>,
    pub matched_class: Option<ExpiryClass>,
}

/// A byte-fed line accumulator owning a fixed-size buffer (§4.3).
#[derive(Debug)]
pub struct LineParser {
    buf: Box<[u8; LINE_BUFFER_SIZE]>,
    len: usize,
}

impl Default for LineParser {
    fn default() -> Self {
        LineParser {
            buf: Box::new([0u8; LINE_BUFFER_SIZE]),
            len: 0,
        }
    }
}

impl LineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one byte. Returns the accumulated line (without its terminating
    /// newline) once a line boundary is reached — either a real `\n`, or the
    /// buffer filling up, in which case the triggering byte is dropped along
    /// with the rest of the oversized line (§4.3: "a line exceeding 4096
    /// bytes loses its tail but still terminates on the next newline").
    pub fn feed_byte(&mut self, byte: u8) -> Option<Vec<u8>> {
        if byte != b'\n' && self.len < self.buf.len() {
            self.buf[self.len] = byte;
            self.len += 1;
            return None;
        }
        let line = self.buf[..self.len].to_vec();
        self.len = 0;
        Some(line)
    }
}

/// Validates and extracts fields from one raw input line (§4.3, §6.2).
/// Returns `None` on any rejection; rejections are silent (debug-logged by
/// the caller).
pub fn parse_line(line: &[u8]) -> Option<ParsedRecord> {
    let text = std::str::from_utf8(line).ok()?;

    if !text.contains("\"fields\":") {
        return None;
    }
    if !text.starts_with("{\"timestamp") {
        return None;
    }
    if !text.ends_with("}}") {
        return None;
    }

    let (src, dst, prn) = extract_src_dst_pgn(text)?;
    if src == 0 || prn == 0 || prn > 131_000 {
        return None;
    }

    let (secondary_key, matched_class) = extract_secondary_key(text);
    let description = extract_description(text);

    Some(ParsedRecord {
        src,
        dst,
        prn,
        description,
        secondary_key,
        matched_class,
    })
}

/// Mirrors the reference's `sscanf(s, "%u\",\"dst\":\"%u\",\"pgn\":\"%u\"")`
/// applied just past a `"src":` marker.
fn extract_src_dst_pgn(text: &str) -> Option<(u8, u8, u32)> {
    let marker = "\"src\":";
    let after = &text[text.find(marker)? + marker.len()..];
    let after = after.strip_prefix('"')?;
    let (src_str, rest) = after.split_once('"')?;
    let rest = rest.strip_prefix(",\"dst\":\"")?;
    let (dst_str, rest) = rest.split_once('"')?;
    let rest = rest.strip_prefix(",\"pgn\":\"")?;
    let (prn_str, _) = rest.split_once('"')?;

    let src: u32 = src_str.parse().ok()?;
    let dst: u32 = dst_str.parse().ok()?;
    let prn: u32 = prn_str.parse().ok()?;
    Some((u8::try_from(src).ok()?, u8::try_from(dst).ok()?, prn))
}

fn extract_description(text: &str) -> Option<String> {
    let marker = "\"description\":";
    let after = &text[text.find(marker)? + marker.len()..];
    let after = after.strip_prefix('"')?;
    let end = after.find('"')?;
    Some(after[..end].to_owned())
}

/// Walks the secondary-key table in priority order; the first field name
/// found in the line wins (§3, §4.3 step 6).
fn extract_secondary_key(text: &str) -> (Option<String>, Option<ExpiryClass>) {
    for (name, class) in SECONDARY_KEY_FIELDS {
        let marker = format!("\"{name}\":");
        if let Some(pos) = text.find(&marker) {
            let after = &text[pos + marker.len()..];
            let after = after.trim_start_matches(['"', ':', ' ']);
            let end = after
                .find(|c: char| c == ' ' || c == '"')
                .unwrap_or(after.len());
            return (Some(after[..end].to_owned()), Some(*class));
        }
    }
    (None, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_parser_splits_on_newline() {
        let mut p = LineParser::new();
        for &b in b"abc" {
            assert!(p.feed_byte(b).is_none());
        }
        assert_eq!(p.feed_byte(b'\n'), Some(b"abc".to_vec()));
    }

    #[test]
    fn line_parser_terminates_on_buffer_full() {
        let mut p = LineParser::new();
        for _ in 0..LINE_BUFFER_SIZE {
            assert!(p.feed_byte(b'x').is_none());
        }
        let line = p.feed_byte(b'x').unwrap();
        assert_eq!(line.len(), LINE_BUFFER_SIZE);
    }

    #[test]
    fn rejects_line_without_fields_marker() {
        let line = br#"{"timestamp":"t","src":"1","dst":"255","pgn":"128267"}}"#;
        assert!(parse_line(line).is_none());
    }

    #[test]
    fn rejects_line_not_starting_with_timestamp() {
        let line = br#"{"bogus":"t","fields":{"src":"1","dst":"255","pgn":"128267"}}"#;
        assert!(parse_line(line).is_none());
    }

    #[test]
    fn rejects_line_not_ending_in_double_brace() {
        let line = br#"{"timestamp":"t","src":"1","dst":"255","pgn":"128267","fields":{}"#;
        assert!(parse_line(line).is_none());
    }

    #[test]
    fn rejects_zero_src_or_out_of_range_pgn() {
        let zero_src = br#"{"timestamp":"t","src":"0","dst":"255","pgn":"128267","fields":{}}"#;
        assert!(parse_line(zero_src).is_none());

        let huge_pgn = br#"{"timestamp":"t","src":"1","dst":"255","pgn":"999999","fields":{}}"#;
        assert!(parse_line(huge_pgn).is_none());
    }

    #[test]
    fn parses_valid_depth_record() {
        let line = br#"{"timestamp":"t","src":"1","dst":"255","pgn":"128267","description":"Water Depth","fields":{"Depth":3.2}}"#;
        let parsed = parse_line(line).unwrap();
        assert_eq!(parsed.src, 1);
        assert_eq!(parsed.dst, 255);
        assert_eq!(parsed.prn, 128267);
        assert_eq!(parsed.description.as_deref(), Some("Water Depth"));
        assert!(parsed.secondary_key.is_none());
    }

    #[test]
    fn extracts_instance_secondary_key_up_to_space_or_quote() {
        // Unquoted numeric value: extraction stops at the next `"` (the one
        // opening `"Voltage"`), not at the comma, so the comma is retained —
        // this mirrors the reference's `strchr(s, ' ')`/`strchr(s, '"')` scan
        // exactly. The quoted form (§8 scenario 3, `"Instance":"0"`) has no
        // such trailing comma since its own closing quote ends the scan.
        let line = br#"{"timestamp":"t","src":"5","dst":"255","pgn":"127508","fields":{"Instance":0,"Voltage":12.1}}"#;
        let parsed = parse_line(line).unwrap();
        assert_eq!(parsed.secondary_key.as_deref(), Some("0,"));
        assert_eq!(parsed.matched_class, Some(ExpiryClass::Sensor));
    }

    #[test]
    fn extracts_ais_message_id_secondary_key() {
        let line = br#"{"timestamp":"t","src":"9","dst":"255","pgn":"129038","fields":{"Message ID":"123456789"}}"#;
        let parsed = parse_line(line).unwrap();
        assert_eq!(parsed.secondary_key.as_deref(), Some("123456789"));
        assert_eq!(parsed.matched_class, Some(ExpiryClass::Ais));
    }

    #[test]
    fn first_matching_field_in_priority_order_wins() {
        // Both Instance and Reference appear; Instance is earlier in the
        // table and should win even though Reference appears first in the
        // line's byte order.
        let line = br#"{"timestamp":"t","src":"1","dst":"255","pgn":"127508","fields":{"Reference":"ref-val","Instance":"7"}}"#;
        let parsed = parse_line(line).unwrap();
        assert_eq!(parsed.secondary_key.as_deref(), Some("7"));
    }
}
