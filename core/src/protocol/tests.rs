//! Protocol tests that exercise the codecs over a real async byte stream.

#[cfg(test)]
mod tests {
    use crate::protocol::*;
    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::{Encoder, FramedRead, FramedWrite};

    fn session_commands() -> Vec<Command> {
        vec![
            Command::Attach {
                topic: "foo".to_string(),
                offset: None,
            },
            Command::Attached {
                topic: "foo".to_string(),
                offset: 10,
            },
            Command::Publish {
                topic: "foo".to_string(),
                seq: 0,
                payload: Bytes::from_static(b"A"),
            },
            Command::Ack { seq: 0 },
            Command::Data {
                topic: "foo".to_string(),
                offset: 15,
                payload: Bytes::from_static(b"A"),
            },
            Command::Detach {
                topic: "foo".to_string(),
            },
            Command::Detached {
                topic: "foo".to_string(),
            },
            Command::Ping { timestamp: -5 },
            Command::Pong { timestamp: -5 },
        ]
    }

    #[tokio::test]
    async fn test_commands_survive_framed_transport() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = FramedWrite::new(client, CommandCodec::default());
        let mut reader = FramedRead::new(server, CommandCodec::default());

        let commands = session_commands();
        let expected = commands.clone();
        let send = tokio::spawn(async move {
            for command in commands {
                writer.send(command).await.unwrap();
            }
        });

        for command in expected {
            assert_eq!(reader.next().await.unwrap().unwrap(), command);
        }
        send.await.unwrap();
    }

    #[tokio::test]
    async fn test_byte_at_a_time_delivery() {
        let mut encoded = bytes::BytesMut::new();
        let mut codec = CommandCodec::default();
        for command in session_commands() {
            codec.encode(command, &mut encoded).unwrap();
        }

        let (mut client, server) = tokio::io::duplex(4);
        let mut reader = FramedRead::new(server, CommandCodec::default());
        let write = tokio::spawn(async move {
            for byte in encoded.iter() {
                client.write_all(&[*byte]).await.unwrap();
            }
        });

        let mut decoded = Vec::new();
        while decoded.len() < session_commands().len() {
            decoded.push(reader.next().await.unwrap().unwrap());
        }
        write.await.unwrap();
        assert_eq!(decoded, session_commands());
    }

    #[test]
    fn test_attach_without_flag_ignores_offset_field() {
        let mut payload = bytes::BytesMut::new();
        bytes::BufMut::put_u16(&mut payload, 0);
        bytes::BufMut::put_u32(&mut payload, 3);
        payload.extend_from_slice(b"foo");
        bytes::BufMut::put_u64(&mut payload, 999);

        let frame = Frame::new(FrameType::Attach.code(), payload.freeze());
        assert_eq!(
            Command::decode(&frame).unwrap(),
            Some(Command::Attach {
                topic: "foo".to_string(),
                offset: None,
            })
        );
    }

    #[test]
    fn test_encoded_payload_matches_payload_len() {
        for command in session_commands() {
            let mut payload = bytes::BytesMut::new();
            command.encode_payload(&mut payload).unwrap();
            assert_eq!(payload.len(), command.payload_len());
        }
    }

    #[test]
    fn test_data_from_message() {
        let message = Message::new("metrics", "cpu=3", 42);
        assert_eq!(
            Command::data(message),
            Command::Data {
                topic: "metrics".to_string(),
                offset: 42,
                payload: Bytes::from_static(b"cpu=3"),
            }
        );
    }

    #[test]
    fn test_timestamp_is_positive() {
        assert!(timestamp_millis() > 0);
    }
}
