//! Terminal frames exchanged over the data-plane WebSocket.

use crate::errors::{SandboxError, SandboxResult};
use crate::shell::TerminalSize;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Output { data: String },
}

impl ServerFrame {
    pub fn to_json(&self) -> String {
        // A single tagged string field cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Parse one client frame.
///
/// Unknown types, missing fields, and resize dimensions that are not
/// integers in `1..=65535` are all `MalformedFrame`.
pub fn parse_client_frame(text: &str) -> SandboxResult<ClientFrame> {
    let frame: ClientFrame =
        serde_json::from_str(text).map_err(|e| SandboxError::MalformedFrame(e.to_string()))?;
    if let ClientFrame::Resize { cols, rows } = frame {
        if cols == 0 || rows == 0 {
            return Err(SandboxError::MalformedFrame(format!(
                "terminal size {cols}x{rows} out of range"
            )));
        }
    }
    Ok(frame)
}

impl ClientFrame {
    pub fn size(&self) -> Option<TerminalSize> {
        match *self {
            ClientFrame::Resize { cols, rows } => Some(TerminalSize { cols, rows }),
            ClientFrame::Input { .. } => None,
        }
    }
}

/// Incremental UTF-8 decoder for PTY output.
///
/// A multi-byte character split across two reads is held back until it is
/// complete; invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_input_and_resize() {
        assert_eq!(
            parse_client_frame(r#"{"type":"input","data":"ls -la\r"}"#).unwrap(),
            ClientFrame::Input {
                data: "ls -la\r".into()
            }
        );
        let resize = parse_client_frame(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
        assert_eq!(resize.size(), Some(TerminalSize { cols: 120, rows: 40 }));
    }

    #[test]
    fn extra_fields_are_ignored() {
        assert!(parse_client_frame(r#"{"type":"input","data":"x","seq":7}"#).is_ok());
    }

    #[test]
    fn rejects_malformed_frames() {
        for text in [
            "not json",
            "[]",
            r#"{"data":"no type"}"#,
            r#"{"type":"input"}"#,
            r#"{"type":"input","data":42}"#,
            r#"{"type":"output","data":"server only"}"#,
            r#"{"type":"shutdown"}"#,
            r#"{"type":"resize","cols":80}"#,
            r#"{"type":"resize","cols":-1,"rows":24}"#,
            r#"{"type":"resize","cols":80.5,"rows":24}"#,
            r#"{"type":"resize","cols":"80","rows":"24"}"#,
            r#"{"type":"resize","cols":0,"rows":24}"#,
            r#"{"type":"resize","cols":70000,"rows":24}"#,
        ] {
            assert!(
                matches!(parse_client_frame(text), Err(SandboxError::MalformedFrame(_))),
                "{text} should be malformed"
            );
        }
    }

    #[test]
    fn output_frame_shape() {
        let json = ServerFrame::Output {
            data: "hello\r\n".into(),
        }
        .to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "output");
        assert_eq!(value["data"], "hello\r\n");
    }

    #[test]
    fn decoder_carries_split_characters() {
        let mut decoder = Utf8Decoder::default();
        let bytes = "héllo ✓".as_bytes();
        // Split inside the two-byte 'é' and the three-byte '✓'.
        let (a, rest) = bytes.split_at(2);
        let (b, c) = rest.split_at(rest.len() - 1);

        let mut out = decoder.decode(a);
        assert_eq!(out, "h");
        out.push_str(&decoder.decode(b));
        out.push_str(&decoder.decode(c));
        assert_eq!(out, "héllo ✓");
    }

    #[test]
    fn decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{fffd}b");
    }
}
