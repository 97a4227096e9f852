//! JSON line framing spoken between the relay and its subscribers.
//!
//! Every frame is one JSON object terminated by `\n`. Published payloads are
//! opaque to the relay and carried as standard base64 strings.

use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, Lines};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientToRelay {
    Hello { peer_id: String },
    Publish {
        #[serde(with = "base64_payload")]
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayToClient {
    /// Handshake reply listing the peers that were subscribed before us.
    Welcome { peer_id: String, peers: Vec<String> },
    PeerJoined { peer_id: String },
    PeerLeft { peer_id: String },
    Message {
        from: String,
        #[serde(with = "base64_payload")]
        data: Vec<u8>,
    },
    Error { message: String },
}

mod base64_payload {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(D::Error::custom)
    }
}

/// Reads the next frame, skipping blank lines. `None` means end of stream.
///
/// Built on [`Lines::next_line`], so it is safe to race in `select!`.
pub async fn read_frame<R, T>(lines: &mut Lines<R>) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim_end_matches('\r');
        if trimmed.is_empty() {
            continue;
        }

        return serde_json::from_str(trimmed)
            .map(Some)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err));
    }
    Ok(None)
}

pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(frame)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, BufReader};

    use super::*;

    #[tokio::test]
    async fn message_frames_carry_arbitrary_bytes() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = BufReader::new(reader).lines();
        let frame = RelayToClient::Message {
            from: "alice@x1".into(),
            data: vec![0, 159, 146, 150, b'\n'],
        };

        write_frame(&mut writer, &frame).await.expect("write frame");
        let parsed = read_frame::<_, RelayToClient>(&mut reader)
            .await
            .expect("read frame")
            .expect("expected frame");

        assert_eq!(frame, parsed);
    }

    #[test]
    fn payloads_travel_as_base64_strings() {
        let frame = ClientToRelay::Publish {
            data: b"{\"kind\":\"presence\"}".to_vec(),
        };
        let encoded = serde_json::to_value(&frame).expect("encode");
        assert_eq!(
            encoded["data"],
            serde_json::json!("eyJraW5kIjoicHJlc2VuY2UifQ==")
        );

        let decoded: RelayToClient =
            serde_json::from_str(r#"{"type":"message","from":"bob@2","data":"aGk="}"#)
                .expect("decode");
        assert_eq!(
            decoded,
            RelayToClient::Message {
                from: "bob@2".into(),
                data: b"hi".to_vec(),
            }
        );
    }

    #[test]
    fn invalid_base64_payload_is_rejected() {
        let parsed =
            serde_json::from_str::<ClientToRelay>(r#"{"type":"publish","data":"not base64!"}"#);
        assert!(parsed.is_err());
    }

    #[tokio::test]
    async fn blank_lines_are_skipped_and_eof_is_none() {
        let input: &[u8] = b"\n\r\n{\"type\":\"hello\",\"peer_id\":\"bob@1\"}\n";
        let mut reader = BufReader::new(input).lines();

        let hello = read_frame::<_, ClientToRelay>(&mut reader)
            .await
            .expect("read hello");
        assert_eq!(
            hello,
            Some(ClientToRelay::Hello {
                peer_id: "bob@1".into()
            })
        );
        assert_eq!(
            read_frame::<_, ClientToRelay>(&mut reader)
                .await
                .expect("read eof"),
            None
        );
    }

    #[tokio::test]
    async fn malformed_frames_are_invalid_data() {
        let input: &[u8] = b"{\"type\":\"bogus\"}\n";
        let mut reader = BufReader::new(input).lines();
        let err = read_frame::<_, ClientToRelay>(&mut reader)
            .await
            .expect_err("bogus frame");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
