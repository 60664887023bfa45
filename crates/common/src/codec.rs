//! JSON Lines transport codec
//!
//! One JSON object per line, UTF-8, `\n` terminated. Used on worker stdio and
//! on the daemon socket. Readers split lines themselves (`BufReader::lines`),
//! so a partial trailing line is simply held until its newline arrives.

use crate::error::CodecError;
use crate::types::ProgressRecord;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Serialize `value` as a single newline-terminated line.
pub fn encode_line<T: Serialize>(value: &T) -> Result<String, CodecError> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}

/// Parse one line. Surrounding whitespace (including `\r`) is ignored.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, CodecError> {
    Ok(serde_json::from_str(line.trim())?)
}

/// Parse one line of the result stream.
///
/// Blank lines and records whose `type` this version does not know yield
/// `Ok(None)`. Malformed JSON is an error the caller may log and skip.
pub fn decode_record(line: &str) -> Result<Option<ProgressRecord>, CodecError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let value: serde_json::Value = serde_json::from_str(trimmed)?;
    let known = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .map(|t| ProgressRecord::KNOWN_TYPES.contains(&t))
        .unwrap_or(false);
    if !known {
        return Ok(None);
    }

    Ok(Some(serde_json::from_value(value)?))
}

/// Write one line and flush, so the peer sees records as they are produced.
pub async fn write_line<W, T>(writer: &mut W, value: &T) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let line = encode_line(value)?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HostRecord, LogLine};
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[test]
    fn encoded_line_has_single_newline() {
        let record = ProgressRecord::Log(LogLine::info("multi\nline message"));
        let line = encode_line(&record).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn unknown_and_blank_lines_are_skipped() {
        assert!(decode_record("").unwrap().is_none());
        assert!(decode_record("   \r").unwrap().is_none());
        assert!(decode_record(r#"{"type":"telemetry","x":1}"#).unwrap().is_none());
        assert!(decode_record(r#"{"no_type":true}"#).unwrap().is_none());
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(decode_record("{not json").is_err());
        assert!(decode_line::<ProgressRecord>("[1,2").is_err());
    }

    #[test]
    fn host_record_decodes_with_crlf() {
        let line = "{\"type\":\"host\",\"address\":\"10.0.0.4\",\"discoveredAt\":\"2024-01-01T00:00:00Z\"}\r\n";
        match decode_record(line).unwrap() {
            Some(ProgressRecord::Host(host)) => {
                assert_eq!(host.address.to_string(), "10.0.0.4");
                assert!(host.methods.is_empty());
            }
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_of_lines_decodes_in_order() {
        let (mut tx, rx) = tokio::io::duplex(256);
        let writer = tokio::spawn(async move {
            for i in 1..=3u8 {
                let host = HostRecord::new(std::net::IpAddr::from([10, 0, 0, i]));
                write_line(&mut tx, &ProgressRecord::Host(host)).await.unwrap();
            }
        });

        let mut lines = BufReader::new(rx).lines();
        let mut seen = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            if let Some(ProgressRecord::Host(host)) = decode_record(&line).unwrap() {
                seen.push(host.address.to_string());
            }
        }
        writer.await.unwrap();
        assert_eq!(seen, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    }
}
