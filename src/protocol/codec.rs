//! Async reader and writers for the framing protocol
//!
//! Reading is strictly sequential: one line, then (for audio headers) exactly the
//! declared number of bytes, then the next line.

use std::io::ErrorKind;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::error::ProtocolError;
use super::message::{
    audio_tag, parse_audio_tag, AudioHeader, ClientCommand, ClientId, Framing, ServerMessage,
    MAX_LINE_LEN, MAX_SEGMENT_LEN,
};

/// What a client reads off its connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Any control line except `DATA:`
    Control(ServerMessage),
    /// A complete relayed audio segment
    Audio { sender: ClientId, payload: Vec<u8> },
}

/// What a client puts on its connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Command(ClientCommand),
    Audio(Vec<u8>),
}

impl ClientFrame {
    /// Write the frame using the given framing
    ///
    /// Legacy framing writes audio without any header.
    pub async fn write_to<W>(&self, writer: &mut W, framing: Framing) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        match self {
            ClientFrame::Command(command) => {
                writer
                    .write_all(format!("{}\n", command).as_bytes())
                    .await?;
            }
            ClientFrame::Audio(payload) => {
                if framing == Framing::Tagged {
                    writer
                        .write_all(format!("{}\n", audio_tag(payload.len())).as_bytes())
                        .await?;
                }
                writer.write_all(payload).await?;
            }
        }
        writer.flush().await?;
        Ok(())
    }
}

/// What the server puts on a client connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Line(ServerMessage),
    /// Multi-line text written verbatim (the welcome banner)
    Raw(String),
    Audio {
        sender: ClientId,
        payload: Arc<[u8]>,
    },
}

impl ServerFrame {
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        match self {
            ServerFrame::Line(message) => {
                writer
                    .write_all(format!("{}\n", message).as_bytes())
                    .await?;
            }
            ServerFrame::Raw(text) => {
                writer.write_all(text.as_bytes()).await?;
            }
            ServerFrame::Audio { sender, payload } => {
                let header = ServerMessage::Audio(AudioHeader {
                    sender: *sender,
                    len: payload.len(),
                });
                writer.write_all(format!("{}\n", header).as_bytes()).await?;
                writer.write_all(payload).await?;
            }
        }
        writer.flush().await?;
        Ok(())
    }
}

/// Sequential reader over one connection
pub struct FrameReader<R> {
    inner: R,
}

impl<R> FrameReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read one line without its terminator. `None` means end of stream.
    ///
    /// A final unterminated line before end of stream is still returned.
    pub async fn read_line(&mut self) -> Result<Option<String>, ProtocolError> {
        let mut buf = Vec::new();
        let limit = (MAX_LINE_LEN + 1) as u64;
        let n = (&mut self.inner)
            .take(limit)
            .read_until(b'\n', &mut buf)
            .await?;

        if n == 0 {
            return Ok(None);
        }
        if buf.last() != Some(&b'\n') && buf.len() > MAX_LINE_LEN {
            return Err(ProtocolError::LineTooLong(MAX_LINE_LEN));
        }

        let line = String::from_utf8_lossy(&buf);
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }

    /// Read exactly `len` bytes of audio
    ///
    /// End of stream before the last byte is a `ShortAudioSegment`; the partial
    /// bytes are discarded.
    pub async fn read_segment(&mut self, len: usize) -> Result<Vec<u8>, ProtocolError> {
        if len > MAX_SEGMENT_LEN {
            return Err(ProtocolError::SegmentTooLarge {
                len,
                max: MAX_SEGMENT_LEN,
            });
        }

        let mut payload = vec![0u8; len];
        match self.inner.read_exact(&mut payload).await {
            Ok(_) => Ok(payload),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                Err(ProtocolError::ShortAudioSegment { expected: len })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read whatever is available, up to `max` bytes. `None` means end of stream.
    pub async fn read_chunk(&mut self, max: usize) -> Result<Option<Vec<u8>>, ProtocolError> {
        let available = self.inner.fill_buf().await?;
        if available.is_empty() {
            return Ok(None);
        }

        let n = available.len().min(max.max(1));
        let chunk = available[..n].to_vec();
        self.inner.consume(n);
        Ok(Some(chunk))
    }

    /// Client side: read the next control line or complete audio segment
    pub async fn read_server_event(&mut self) -> Result<Option<ServerEvent>, ProtocolError> {
        let line = match self.read_line().await? {
            Some(line) => line,
            None => return Ok(None),
        };

        match ServerMessage::parse(&line)? {
            ServerMessage::Audio(header) => {
                let payload = self.read_segment(header.len).await?;
                trace!("Read {} audio bytes from sender {}", payload.len(), header.sender);
                Ok(Some(ServerEvent::Audio {
                    sender: header.sender,
                    payload,
                }))
            }
            message => Ok(Some(ServerEvent::Control(message))),
        }
    }

    /// Server side, tagged framing: read the next command or tagged audio segment
    ///
    /// Blank lines are skipped.
    pub async fn read_client_frame(&mut self) -> Result<Option<ClientFrame>, ProtocolError> {
        loop {
            let line = match self.read_line().await? {
                Some(line) => line,
                None => return Ok(None),
            };

            if let Some(len) = parse_audio_tag(&line) {
                let payload = self.read_segment(len?).await?;
                return Ok(Some(ClientFrame::Audio(payload)));
            }
            if let Some(command) = ClientCommand::parse(&line) {
                return Ok(Some(ClientFrame::Command(command)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn reader(data: &'static [u8]) -> FrameReader<BufReader<&'static [u8]>> {
        FrameReader::new(BufReader::new(data))
    }

    #[tokio::test]
    async fn test_read_audio_then_line() {
        let mut r = reader(b"DATA:3:4\n\x00\n\xff\x01ID:9\n");

        match r.read_server_event().await.unwrap() {
            Some(ServerEvent::Audio { sender, payload }) => {
                assert_eq!(sender, ClientId(3));
                assert_eq!(payload, vec![0x00, b'\n', 0xff, 0x01]);
            }
            other => panic!("Expected audio, got {:?}", other),
        }

        assert_eq!(
            r.read_server_event().await.unwrap(),
            Some(ServerEvent::Control(ServerMessage::AssignedId(ClientId(9))))
        );
        assert_eq!(r.read_server_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_short_segment_is_error() {
        let mut r = reader(b"DATA:1:10\nabc");
        assert!(matches!(
            r.read_server_event().await,
            Err(ProtocolError::ShortAudioSegment { expected: 10 })
        ));
    }

    #[tokio::test]
    async fn test_segment_limit() {
        let mut r = reader(b"DATA:1:99999999\n");
        assert!(matches!(
            r.read_server_event().await,
            Err(ProtocolError::SegmentTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_line_too_long() {
        let long: &'static [u8] = Box::leak(vec![b'a'; MAX_LINE_LEN + 10].into_boxed_slice());
        let mut r = reader(long);
        assert!(matches!(
            r.read_line().await,
            Err(ProtocolError::LineTooLong(_))
        ));
    }

    #[tokio::test]
    async fn test_unterminated_final_line() {
        let mut r = reader(b"NEW:demo");
        assert_eq!(r.read_line().await.unwrap(), Some("NEW:demo".to_string()));
        assert_eq!(r.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_client_frames() {
        let mut r = reader(b"\nNEW:demo\r\nAUDIO:3\nxyzREQ:ROOM_LIST\n");

        assert_eq!(
            r.read_client_frame().await.unwrap(),
            Some(ClientFrame::Command(ClientCommand::Create("demo".into())))
        );
        assert_eq!(
            r.read_client_frame().await.unwrap(),
            Some(ClientFrame::Audio(b"xyz".to_vec()))
        );
        assert_eq!(
            r.read_client_frame().await.unwrap(),
            Some(ClientFrame::Command(ClientCommand::RequestRoomList))
        );
        assert_eq!(r.read_client_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_chunk_respects_max() {
        let mut r = reader(b"0123456789");
        assert_eq!(r.read_chunk(4).await.unwrap(), Some(b"0123".to_vec()));
        assert_eq!(r.read_chunk(100).await.unwrap(), Some(b"456789".to_vec()));
        assert_eq!(r.read_chunk(100).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_mock_stream_split_across_reads() {
        let mock = tokio_test::io::Builder::new()
            .read(b"DATA:2:")
            .read(b"6\nhel")
            .read(b"lo!")
            .build();
        let mut r = FrameReader::new(BufReader::new(mock));

        assert_eq!(
            r.read_server_event().await.unwrap(),
            Some(ServerEvent::Audio {
                sender: ClientId(2),
                payload: b"hello!".to_vec()
            })
        );
    }

    #[tokio::test]
    async fn test_write_server_audio_frame() {
        let mock = tokio_test::io::Builder::new()
            .write(b"DATA:1:3\n")
            .write(b"abc")
            .build();
        let mut writer = mock;

        ServerFrame::Audio {
            sender: ClientId(1),
            payload: Arc::from(&b"abc"[..]),
        }
        .write_to(&mut writer)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_write_client_audio_framings() {
        let mut tagged = Vec::new();
        ClientFrame::Audio(vec![1, 2])
            .write_to(&mut tagged, Framing::Tagged)
            .await
            .unwrap();
        assert_eq!(tagged, b"AUDIO:2\n\x01\x02");

        let mut legacy = Vec::new();
        ClientFrame::Audio(vec![1, 2])
            .write_to(&mut legacy, Framing::Legacy)
            .await
            .unwrap();
        assert_eq!(legacy, vec![1, 2]);

        let mut command = Vec::new();
        ClientFrame::Command(ClientCommand::Leave)
            .write_to(&mut command, Framing::Legacy)
            .await
            .unwrap();
        assert_eq!(command, b"LEAVE\n");
    }
}
