use bytes::{Buf, BufMut, Bytes, BytesMut};
use lan_io::tokio_util::codec::{Decoder, Encoder};

use crate::constants::{CODEC_MIN_BUFFER, MAX_FRAME_HEADER_LEN, MESSAGE_SPLITTER};
use crate::error::NetworkError;
use crate::proto::message::{decode_scalar, encode_scalar, ScalarDecode};

/// Frames messages as `splitter (u16 LE) | length (compact scalar) | payload`.
///
/// A frame whose splitter is wrong, whose length prefix is malformed, or whose announced length
/// is zero or above the configured maximum makes the decoder fail with
/// [`NetworkError::StreamInconsistent`]. The stream cannot be resynchronized afterwards, so the
/// owner of the link must dispose it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct MessageCodec {
    max_message_length: usize,
}

impl MessageCodec {
    pub fn new(max_message_length: usize) -> MessageCodec {
        MessageCodec { max_message_length }
    }

    pub fn max_message_length(&self) -> usize {
        self.max_message_length
    }

    /// Checks a message against the configured bound before anything is queued
    pub fn check_length(&self, length: usize) -> Result<(), NetworkError> {
        if length == 0 {
            return Err(NetworkError::InvalidPacket("Empty message"));
        }

        if length > self.max_message_length {
            return Err(NetworkError::MessageTooLong {
                length,
                max: self.max_message_length,
            });
        }

        Ok(())
    }

    /// Appends one frame to `buf`
    pub fn encode_frame(&self, payload: &[u8], buf: &mut BytesMut) -> Result<(), NetworkError> {
        self.check_length(payload.len())?;
        buf.reserve(MAX_FRAME_HEADER_LEN + payload.len());
        buf.put_u16_le(MESSAGE_SPLITTER);
        encode_scalar(payload.len() as u64, buf);
        buf.put_slice(payload);
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Bytes;
    type Error = NetworkError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, NetworkError> {
        if buf.capacity() < CODEC_MIN_BUFFER {
            buf.reserve(CODEC_MIN_BUFFER - buf.capacity());
        }

        if buf.len() < 2 {
            return Ok(None);
        }

        if u16::from_le_bytes([buf[0], buf[1]]) != MESSAGE_SPLITTER {
            return Err(NetworkError::StreamInconsistent("Bad message splitter"));
        }

        let (length, prefix_len) = match decode_scalar(&buf[2..], MAX_FRAME_HEADER_LEN - 2) {
            ScalarDecode::Complete { value, consumed } => (value, consumed),
            ScalarDecode::Incomplete => return Ok(None),
            ScalarDecode::Malformed => {
                return Err(NetworkError::StreamInconsistent("Malformed length prefix"))
            }
        };

        if length == 0 || length > self.max_message_length as u64 {
            return Err(NetworkError::StreamInconsistent(
                "Announced message length out of bounds",
            ));
        }

        let header_len = 2 + prefix_len;
        let frame_len = header_len + length as usize;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(header_len);
        Ok(Some(buf.split_to(length as usize).freeze()))
    }
}

impl Encoder<Bytes> for MessageCodec {
    type Error = NetworkError;

    fn encode(&mut self, data: Bytes, buf: &mut BytesMut) -> Result<(), NetworkError> {
        self.encode_frame(&data, buf)
    }
}

#[cfg(test)]
mod tests {
    use crate::constants::CODEC_BUFFER_CAPACITY;
    use crate::error::NetworkError;
    use crate::proto::codec::MessageCodec;
    use bytes::{BufMut, Bytes, BytesMut};
    use lan_io::tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn frames_survive_arbitrary_chunking() {
        lan_logging::setup_test_log();

        let mut codec = MessageCodec::new(CODEC_BUFFER_CAPACITY);
        let mut wire = BytesMut::new();
        let mut expected = Vec::new();

        for x in 1..300usize {
            let payload = Bytes::from(vec![(x % 255) as u8; x]);
            codec.encode(payload.clone(), &mut wire).unwrap();
            expected.push(payload);
        }

        // feed the stream back a few bytes at a time
        let mut inbound = BytesMut::new();
        let mut decoded = Vec::new();
        for chunk in wire.chunks(7) {
            inbound.put_slice(chunk);
            while let Some(frame) = codec.decode(&mut inbound).unwrap() {
                decoded.push(frame);
            }
        }

        assert_eq!(decoded, expected);
        assert!(inbound.is_empty());
    }

    #[test]
    fn oversize_message_rejected_at_encode_time() {
        let mut codec = MessageCodec::new(16);
        let mut wire = BytesMut::new();
        let err = codec
            .encode(Bytes::from(vec![0u8; 17]), &mut wire)
            .unwrap_err();
        assert!(matches!(err, NetworkError::MessageTooLong { length: 17, max: 16 }));
        assert!(wire.is_empty());
        codec.encode(Bytes::from(vec![0u8; 16]), &mut wire).unwrap();
    }

    #[test]
    fn bad_splitter_is_stream_inconsistent() {
        let mut codec = MessageCodec::new(64);
        let mut inbound = BytesMut::from(&[0x00, 0x01, 0x03, 1, 2, 3][..]);
        assert!(matches!(
            codec.decode(&mut inbound),
            Err(NetworkError::StreamInconsistent(_))
        ));
    }

    #[test]
    fn announced_length_over_bound_is_stream_inconsistent() {
        let mut sender = MessageCodec::new(1024);
        let mut receiver = MessageCodec::new(32);
        let mut wire = BytesMut::new();
        sender.encode(Bytes::from(vec![1u8; 100]), &mut wire).unwrap();
        assert!(matches!(
            receiver.decode(&mut wire),
            Err(NetworkError::StreamInconsistent(_))
        ));
    }

    #[test]
    fn malformed_length_prefix_is_stream_inconsistent() {
        let mut codec = MessageCodec::new(1024);
        let mut inbound = BytesMut::new();
        inbound.put_u16_le(crate::constants::MESSAGE_SPLITTER);
        inbound.put_slice(&[0xFF; 6]);
        assert!(matches!(
            codec.decode(&mut inbound),
            Err(NetworkError::StreamInconsistent(_))
        ));
    }
}
