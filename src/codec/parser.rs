//! Parsing for meta-protocol responses.
//!
//! Mirrors the streaming-combinator style of the classic ASCII meta parser
//! this crate grew out of: `nom::streaming` primitives so a partial buffer
//! yields `Incomplete` rather than a spurious parse error, and the caller
//! loops on more bytes from the socket.

use std::num::NonZeroUsize;

use bytes::Bytes;
use nom::{
    branch::alt,
    bytes::streaming::{tag, take, take_until, take_while},
    character::streaming::{crlf, digit1, space1},
    combinator::{map, map_res, opt, value},
    multi::many0,
    sequence::tuple,
    IResult,
};

use crate::error::Error;

/// A single meta-protocol flag: one ASCII letter, optionally followed by a
/// token (no embedded whitespace).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Flag {
    pub letter: u8,
    pub token: Option<Bytes>,
}

impl Flag {
    pub fn bare(letter: u8) -> Self {
        Flag { letter, token: None }
    }

    pub fn with_token(letter: u8, token: Bytes) -> Self {
        Flag { letter, token: Some(token) }
    }
}

/// Status line of a meta-protocol response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Status {
    /// `HD` — success, no value.
    Hd,
    /// `VA` — success, value follows.
    Va,
    /// `EN` — miss (get).
    En,
    /// `NS` — not stored.
    Ns,
    /// `EX` — exists / CAS mismatch.
    Ex,
    /// `NF` — not found (modify command).
    Nf,
    /// `ME` — debug info.
    Me,
    /// `CLIENT_ERROR <msg>`.
    ClientError(String),
    /// `SERVER_ERROR <msg>`.
    ServerError(String),
    /// Bare `ERROR` — unknown/unsupported command.
    Error,
    /// A well-formed but unrecognized status code. Surfaced as an error
    /// without poisoning the connection: the line was framed correctly.
    Unknown(String),
}

impl Status {
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Hd | Status::Va)
    }

    pub fn code(&self) -> &str {
        match self {
            Status::Hd => "HD",
            Status::Va => "VA",
            Status::En => "EN",
            Status::Ns => "NS",
            Status::Ex => "EX",
            Status::Nf => "NF",
            Status::Me => "ME",
            Status::ClientError(_) => "CLIENT_ERROR",
            Status::ServerError(_) => "SERVER_ERROR",
            Status::Error => "ERROR",
            Status::Unknown(_) => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::ClientError(msg) => write!(f, "CLIENT_ERROR {msg}"),
            Status::ServerError(msg) => write!(f, "SERVER_ERROR {msg}"),
            Status::Unknown(msg) => write!(f, "unrecognized status: {msg}"),
            other => write!(f, "{}", other.code()),
        }
    }
}

/// A fully parsed response.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub status: Status,
    pub flags: Vec<Flag>,
    pub value: Option<Bytes>,
    pub opaque: Option<Bytes>,
}

impl Response {
    /// Returns the decoded error for this response, or `None` on `HD`/`VA`.
    pub fn error(&self) -> Option<Error> {
        if self.status.is_success() {
            None
        } else {
            Some(Error::Server(self.status.clone()))
        }
    }

    pub fn flag(&self, letter: u8) -> Option<&Flag> {
        self.flags.iter().find(|f| f.letter == letter)
    }
}

/// Parses exactly one response from `buf`.
///
/// Returns `Ok(Some((n, response)))` when a full response was parsed,
/// consuming `n` bytes; `Ok(None)` when more data is needed; `Err` on a
/// framing error (malformed status line, short value block, bad trailer).
pub fn parse_response(buf: &[u8]) -> Result<Option<(usize, Response)>, Error> {
    match response(buf) {
        Ok((rest, response)) => Ok(Some((buf.len() - rest.len(), response))),
        Err(nom::Err::Incomplete(_)) => Ok(None),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(Error::Protocol(format!(
            "malformed response near byte {}: {:?}",
            buf.len() - e.input.len(),
            e.code
        ))),
    }
}

fn response(buf: &[u8]) -> IResult<&[u8], Response> {
    alt((
        value_response,
        line_status_response,
        client_error_response,
        server_error_response,
        generic_error_response,
        unknown_status_response,
    ))(buf)
}

fn value_response(buf: &[u8]) -> IResult<&[u8], Response> {
    let (input, _) = tag("VA ")(buf)?;
    let (input, len) = parse_u32(input)?;
    let (input, flags) = flag_list(input)?;
    let (input, _) = crlf(input)?;
    let (input, data) = take_exact_then_crlf(input, len as usize)?;
    let opaque = extract_opaque(&flags);
    Ok((
        input,
        Response {
            status: Status::Va,
            flags,
            value: Some(Bytes::copy_from_slice(data)),
            opaque,
        },
    ))
}

fn line_status_response(buf: &[u8]) -> IResult<&[u8], Response> {
    let (input, status) = alt((
        value(Status::Hd, tag("HD")),
        value(Status::En, tag("EN")),
        value(Status::Ns, tag("NS")),
        value(Status::Ex, tag("EX")),
        value(Status::Nf, tag("NF")),
        value(Status::Me, tag("ME")),
    ))(buf)?;
    let (input, flags) = flag_list(input)?;
    let (input, _) = crlf(input)?;
    let opaque = extract_opaque(&flags);
    Ok((
        input,
        Response { status, flags, value: None, opaque },
    ))
}

fn client_error_response(buf: &[u8]) -> IResult<&[u8], Response> {
    let (input, _) = tag("CLIENT_ERROR")(buf)?;
    let (input, msg) = rest_of_line(input)?;
    Ok((
        input,
        Response {
            status: Status::ClientError(msg),
            flags: Vec::new(),
            value: None,
            opaque: None,
        },
    ))
}

fn server_error_response(buf: &[u8]) -> IResult<&[u8], Response> {
    let (input, _) = tag("SERVER_ERROR")(buf)?;
    let (input, msg) = rest_of_line(input)?;
    Ok((
        input,
        Response {
            status: Status::ServerError(msg),
            flags: Vec::new(),
            value: None,
            opaque: None,
        },
    ))
}

fn generic_error_response(buf: &[u8]) -> IResult<&[u8], Response> {
    let (input, _) = tag("ERROR")(buf)?;
    let (input, _) = crlf(input)?;
    Ok((
        input,
        Response {
            status: Status::Error,
            flags: Vec::new(),
            value: None,
            opaque: None,
        },
    ))
}

/// Catches a well-formed but unrecognized two-letter-or-longer status code.
/// Per the protocol's forward-compatibility story this is a client error,
/// not a framing error: the line was well-formed, just unexpected.
fn unknown_status_response(buf: &[u8]) -> IResult<&[u8], Response> {
    let (input, code) = take_while(|c: u8| c.is_ascii_uppercase() || c == b'_')(buf)?;
    if code.is_empty() {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Tag,
        )));
    }
    let (input, _) = opt(tag(" "))(input)?;
    let (input, rest) = take_until("\r\n")(input)?;
    let (input, _) = crlf(input)?;
    let code_str = String::from_utf8_lossy(code).into_owned();
    let detail = String::from_utf8_lossy(rest).trim().to_string();
    let msg = if detail.is_empty() { code_str } else { format!("{code_str} {detail}") };
    Ok((
        input,
        Response {
            status: Status::Unknown(msg),
            flags: Vec::new(),
            value: None,
            opaque: None,
        },
    ))
}

fn rest_of_line(input: &[u8]) -> IResult<&[u8], String> {
    let (input, _) = opt(tag(" "))(input)?;
    let (input, text) = take_until("\r\n")(input)?;
    let (input, _) = crlf(input)?;
    Ok((input, String::from_utf8_lossy(text).trim().to_string()))
}

fn flag_list(input: &[u8]) -> IResult<&[u8], Vec<Flag>> {
    many0(map(
        tuple((space1, take(1usize), take_while(|c: u8| c != b'\r' && c != b' '))),
        |(_, letter, token): (_, &[u8], &[u8])| Flag {
            letter: letter[0],
            token: if token.is_empty() { None } else { Some(Bytes::copy_from_slice(token)) },
        },
    ))(input)
}

fn extract_opaque(flags: &[Flag]) -> Option<Bytes> {
    flags.iter().find(|f| f.letter == b'O').and_then(|f| f.token.clone())
}

fn parse_u32(buf: &[u8]) -> IResult<&[u8], u32> {
    map_res(digit1, btoi::btou)(buf)
}

/// Reads exactly `size` bytes followed by a `\r\n` trailer. A short or
/// missing trailer is a framing error (propagated as `nom::Err::Error`,
/// which `parse_response` turns into `Error::Protocol`), not `Incomplete` —
/// incompleteness is reserved for "not enough bytes buffered yet".
fn take_exact_then_crlf(input: &[u8], size: usize) -> IResult<&[u8], &[u8]> {
    if input.len() < size {
        return Err(nom::Err::Incomplete(nom::Needed::Size(
            NonZeroUsize::new(size - input.len()).unwrap_or(NonZeroUsize::new(1).unwrap()),
        )));
    }
    let (data, rest) = input.split_at(size);
    let (rest, _) = crlf(rest)?;
    Ok((rest, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stored_with_no_flags() {
        let (n, response) = parse_response(b"HD\r\n").unwrap().unwrap();
        assert_eq!(n, 4);
        assert_eq!(response.status, Status::Hd);
        assert!(response.value.is_none());
    }

    #[test]
    fn parses_value_response() {
        let (n, response) = parse_response(b"VA 5 f0\r\nhello\r\n").unwrap().unwrap();
        assert_eq!(n, 17);
        assert_eq!(response.status, Status::Va);
        assert_eq!(response.value.as_deref(), Some(b"hello".as_ref()));
    }

    #[test]
    fn value_with_embedded_crlf_uses_length_not_terminator() {
        let (n, response) = parse_response(b"VA 7\r\nhe\r\nllo\r\n").unwrap().unwrap();
        assert_eq!(n, 15);
        assert_eq!(response.value.as_deref(), Some(b"he\r\nllo".as_ref()));
    }

    #[test]
    fn short_value_block_is_a_framing_error() {
        let err = parse_response(b"VA 5 f0\r\nhell\r\n").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn incomplete_buffer_requests_more_data() {
        assert_eq!(parse_response(b"VA 5 f0\r\nhel").unwrap(), None);
        assert_eq!(parse_response(b"HD").unwrap(), None);
    }

    #[test]
    fn opaque_is_echoed_and_matched_against_flag_list() {
        let (_, response) = parse_response(b"HD O42 kmykey\r\n").unwrap().unwrap();
        assert_eq!(response.opaque.as_deref(), Some(b"42".as_ref()));
        assert_eq!(response.flag(b'k').unwrap().token.as_deref(), Some(b"mykey".as_ref()));
    }

    #[test]
    fn miss_is_not_a_framing_error() {
        let (_, response) = parse_response(b"EN\r\n").unwrap().unwrap();
        assert_eq!(response.status, Status::En);
        assert!(response.error().unwrap().is_miss());
    }

    #[test]
    fn client_and_server_errors_carry_their_message() {
        let (_, response) = parse_response(b"CLIENT_ERROR bad command line format\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(
            response.status,
            Status::ClientError("bad command line format".to_string())
        );

        let (_, response) = parse_response(b"SERVER_ERROR out of memory\r\n").unwrap().unwrap();
        assert_eq!(response.status, Status::ServerError("out of memory".to_string()));
    }

    #[test]
    fn bare_error_is_recognized() {
        let (_, response) = parse_response(b"ERROR\r\n").unwrap().unwrap();
        assert_eq!(response.status, Status::Error);
    }

    #[test]
    fn unknown_status_is_surfaced_without_poisoning() {
        let (_, response) = parse_response(b"XX some detail\r\n").unwrap().unwrap();
        match &response.status {
            Status::Unknown(msg) => assert!(msg.starts_with("XX")),
            other => panic!("expected Unknown, got {other:?}"),
        }
        assert!(!response.error().unwrap().poisons_connection());
    }

    #[test]
    fn flag_without_token_is_recorded_bare() {
        let (_, response) = parse_response(b"VA 1 h l56\r\nx\r\n").unwrap().unwrap();
        assert_eq!(response.flag(b'h').unwrap().token, None);
        assert_eq!(response.flag(b'l').unwrap().token.as_deref(), Some(b"56".as_ref()));
    }
}
