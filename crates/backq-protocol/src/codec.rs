use crate::{Command, ProtocolError, Response, Result, MAX_BODY_LENGTH, MAX_LINE_LENGTH};
use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const CRLF: &[u8] = b"\r\n";

/// Codec for the beanstalkd text protocol
///
/// Frame format: `<header>\r\n` optionally followed by `<body>\r\n` when the
/// header announces a body length (`RESERVED <id> <bytes>`, `OK <bytes>`).
pub struct BeanstalkCodec;

impl Decoder for BeanstalkCodec {
    type Item = Response;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let line_end = match src.windows(2).position(|window| window == CRLF) {
            Some(position) => position,
            None => {
                if src.len() > MAX_LINE_LENGTH {
                    return Err(ProtocolError::BadFrame(format!(
                        "no line terminator within {} bytes",
                        MAX_LINE_LENGTH
                    )));
                }
                return Ok(None);
            }
        };

        let line = std::str::from_utf8(&src[..line_end])
            .map_err(|_| ProtocolError::BadFrame("header is not utf-8".to_string()))?;
        let header = parse_header(line)?;

        // Frame length including both terminators
        let body_len = header.body_len();
        let frame_len = match body_len {
            Some(len) if len > MAX_BODY_LENGTH => {
                return Err(ProtocolError::BadFrame(format!(
                    "body of {} bytes exceeds {} bytes",
                    len, MAX_BODY_LENGTH
                )));
            }
            Some(len) => (line_end + 2)
                .checked_add(len)
                .and_then(|end| end.checked_add(2))
                .ok_or_else(|| ProtocolError::BadFrame(line.to_string()))?,
            None => line_end + 2,
        };

        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(frame_len).freeze();
        let response = match (header, body_len) {
            (Header::Reserved { id, .. }, Some(len)) => Response::Reserved {
                id,
                body: body(&frame, line_end, len)?,
            },
            (Header::Ok { .. }, Some(len)) => Response::Ok(body(&frame, line_end, len)?),
            (Header::Plain(response), _) => response,
            _ => return Err(ProtocolError::BadFrame("inconsistent frame header".to_string())),
        };

        Ok(Some(response))
    }
}

fn body(frame: &Bytes, line_end: usize, len: usize) -> Result<Bytes> {
    let start = line_end + 2;
    if &frame[start + len..] != CRLF {
        return Err(ProtocolError::BadFrame(
            "body is not terminated by CRLF".to_string(),
        ));
    }
    Ok(frame.slice(start..start + len))
}

enum Header {
    Reserved { id: u64, len: usize },
    Ok { len: usize },
    Plain(Response),
}

impl Header {
    fn body_len(&self) -> Option<usize> {
        match self {
            Header::Reserved { len, .. } | Header::Ok { len } => Some(*len),
            Header::Plain(_) => None,
        }
    }
}

fn parse_header(line: &str) -> Result<Header> {
    let mut parts = line.split(' ');
    let word = parts.next().unwrap_or_default();

    let header = match word {
        "INSERTED" => Header::Plain(Response::Inserted(number(parts.next(), line)?)),
        "BURIED" => Header::Plain(Response::Buried(
            parts.next().map(|id| number(Some(id), line)).transpose()?,
        )),
        "USING" => Header::Plain(Response::Using(
            parts
                .next()
                .ok_or_else(|| ProtocolError::BadFrame(line.to_string()))?
                .to_string(),
        )),
        "WATCHING" => Header::Plain(Response::Watching(number(parts.next(), line)?)),
        "RESERVED" => Header::Reserved {
            id: number(parts.next(), line)?,
            len: number(parts.next(), line)?,
        },
        "OK" => Header::Ok {
            len: number(parts.next(), line)?,
        },
        "TIMED_OUT" => Header::Plain(Response::TimedOut),
        "DEADLINE_SOON" => Header::Plain(Response::DeadlineSoon),
        "DELETED" => Header::Plain(Response::Deleted),
        "RELEASED" => Header::Plain(Response::Released),
        "NOT_FOUND" => Header::Plain(Response::NotFound),
        "NOT_IGNORED" => Header::Plain(Response::NotIgnored),
        "OUT_OF_MEMORY" | "INTERNAL_ERROR" | "BAD_FORMAT" | "UNKNOWN_COMMAND"
        | "EXPECTED_CRLF" | "JOB_TOO_BIG" | "DRAINING" => {
            Header::Plain(Response::Error(word.to_string()))
        }
        _ => return Err(ProtocolError::UnexpectedResponse(line.to_string())),
    };

    Ok(header)
}

fn number<T: std::str::FromStr>(part: Option<&str>, line: &str) -> Result<T> {
    part.and_then(|value| value.parse().ok())
        .ok_or_else(|| ProtocolError::BadFrame(line.to_string()))
}

impl Encoder<Command> for BeanstalkCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<()> {
        let header = item.header();
        if header.len() > MAX_LINE_LENGTH {
            return Err(ProtocolError::BadFrame(format!(
                "{} command line exceeds {} bytes",
                item.name(),
                MAX_LINE_LENGTH
            )));
        }

        dst.reserve(header.len() + 2);
        dst.put_slice(header.as_bytes());
        dst.put_slice(CRLF);

        if let Command::Put { body, .. } = item {
            dst.reserve(body.len() + 2);
            dst.put_slice(&body);
            dst.put_slice(CRLF);
        }

        Ok(())
    }
}
