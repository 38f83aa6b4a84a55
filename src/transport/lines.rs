use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::Error;

/// Splits incoming bytes on newlines.
///
/// A trailing carriage return is dropped.
/// Bad utf8 is replaced rather than treated as an error,
/// a garbled line is still worth classifying.
#[derive(Debug, Default)]
pub struct LogLineCodec {
    /// How far we have looked for a newline into the buffer.
    cursor: usize,
}

impl LogLineCodec {
    /// A new codec.
    pub fn new() -> Self {
        Self::default()
    }
}

fn lossy(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

impl Decoder for LogLineCodec {
    type Item = String;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let read_to = src.len();

        if let Some(position) = src[self.cursor..read_to]
            .iter()
            .position(|&byte| byte == b'\n')
        {
            // The position is relative to where we started looking.
            let actual_position = self.cursor + position;
            self.cursor = 0;

            let line = src.split_to(actual_position);

            // Skip the newline itself.
            src.advance(1);

            Ok(Some(lossy(&line)))
        } else {
            // Don't look at these bytes again next time.
            self.cursor = read_to;

            Ok(None)
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None if src.is_empty() => Ok(None),
            None => {
                self.cursor = 0;
                let rest = src.split_to(src.len());
                Ok(Some(lossy(&rest)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn partial_lines_wait_for_more() {
        let mut codec = LogLineCodec::new();
        let mut buf = BytesMut::from("MS3[1]: PRINT_TICKET");

        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"_REPLY: result=SUCCEEDED\r\nnext");
        assert_eq!(
            codec.decode(&mut buf).unwrap().as_deref(),
            Some("MS3[1]: PRINT_TICKET_REPLY: result=SUCCEEDED")
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        assert_eq!(codec.decode_eof(&mut buf).unwrap().as_deref(), Some("next"));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn bad_utf8_is_replaced() {
        let mut codec = LogLineCodec::new();
        let mut buf = BytesMut::from(&b"KEY\xffPRESSED\n"[..]);

        let line = codec.decode(&mut buf).unwrap().unwrap();

        assert!(line.starts_with("KEY"));
        assert!(line.ends_with("PRESSED"));
    }

    #[test]
    fn several_lines_at_once() {
        let mut codec = LogLineCodec::new();
        let mut buf = BytesMut::from("one\ntwo\n\nthree\n");

        let mut lines = vec![];
        while let Some(line) = codec.decode(&mut buf).unwrap() {
            lines.push(line);
        }

        assert_eq!(lines, vec!["one", "two", "", "three"]);
    }
}
