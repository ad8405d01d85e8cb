//! Parsers for CGI/1.1 responses
//!
//! Handlers disagree on framing. Some print `Content-Type`, a blank line and
//! the body and leave the length to us; others compute `Content-Length`
//! themselves and then print a stray newline or two after the body. Both
//! are accepted here without the caller knowing which one it got.

use crate::cgi::{ParsedResponse, Status, Header, TruncatedBody};
use crate::errors::{Result, Error};
use crate::log_util::ascii_escape;

use nom::branch::alt;
use nom::bytes::complete::{tag, take_till, take_while1, take_while_m_n};
use nom::character::complete::{space0, space1};
use nom::character::is_digit;
use nom::combinator::{eof, map, map_res, rest, verify};
use nom::sequence::{preceded, tuple};
use nom::IResult;

use std::str::{self, FromStr};

/// Splits handler output into structured form
#[derive(Debug, Clone, Copy)]
pub struct ResponseParser {
    scan_limit: usize
}

impl ResponseParser {
    /// `scan_limit` bounds how far into the output the end of the header
    /// block may be.
    pub fn new(scan_limit: usize) -> ResponseParser {
        ResponseParser { scan_limit }
    }

    pub fn parse(&self, output: &[u8]) -> Result<ParsedResponse> {
        let (head, body) = match split_document(output, self.scan_limit) {
            Some(parts) => parts,
            None => return Err(Error::MalformedResponse)
        };

        let mut status = None;
        let mut declared_length = None;
        let mut headers = Vec::new();

        for (index, line) in head.split(|&b| b == b'\n').enumerate() {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() {
                continue;
            }

            if index == 0 {
                if let Ok((_, stat)) = status_line(line) {
                    status = Some(stat);
                    continue;
                }
            }

            let hdr = match header(line) {
                Ok((_, hdr)) => hdr,
                Err(_) => {
                    warn!("Dropping malformed header line from handler: \"{}\"",
                          ascii_escape(line));
                    continue;
                }
            };

            if hdr.is("Status") {
                match status_value(&hdr.content) {
                    Ok((_, stat)) if status.is_none() => status = Some(stat),
                    Ok(_) => warn!("Ignoring repeated Status header from handler"),
                    Err(_) => warn!("Dropping unparseable Status header: \"{}\"",
                                    ascii_escape(&hdr.content))
                }
            }
            else if hdr.is("Content-Length") {
                match content_length(&hdr.content) {
                    Some(n) if declared_length.is_none() => declared_length = Some(n),
                    Some(_) => warn!("Ignoring repeated Content-Length header from handler"),
                    None => warn!("Dropping unparseable Content-Length header: \"{}\"",
                                  ascii_escape(&hdr.content))
                }
            }
            else {
                headers.push(hdr);
            }
        }

        let status = match status {
            Some(stat) => stat,
            None if headers.iter().any(|h| h.is("Location")) => Status {
                code: 302,
                reason_phrase: Vec::from(&b"Found"[..])
            },
            None => Status {
                code: 200,
                reason_phrase: Vec::from(&b"OK"[..])
            }
        };

        let (body, truncated) = match declared_length {
            Some(declared) if declared <= body.len() => (&body[.. declared], None),
            Some(declared) => {
                warn!("Handler declared {} body bytes but wrote {}",
                      declared, body.len());
                (body, Some(TruncatedBody { declared, available: body.len() }))
            },
            None => (body, None)
        };

        Ok(ParsedResponse {
            status,
            headers,
            body: Vec::from(body),
            declared_length,
            truncated
        })
    }
}

/// Finds the first blank line and splits around it.
///
/// The separator may be `\n\n`, `\r\n\r\n` or a mix of the two. Only
/// separators starting within the first `scan_limit` bytes count.
pub fn split_document(output: &[u8], scan_limit: usize) -> Option<(&[u8], &[u8])> {
    let window = &output[.. output.len().min(scan_limit)];

    for (i, _) in window.iter().enumerate().filter(|&(_, &b)| b == b'\n') {
        let after = &output[i + 1 ..];
        if after.starts_with(b"\n") {
            return Some((&output[.. i], &output[i + 2 ..]));
        }
        if after.starts_with(b"\r\n") {
            return Some((&output[.. i], &output[i + 3 ..]));
        }
    }

    None
}

/// An NPH-style first line, e.g. `HTTP/1.1 404 Not Found`
pub fn status_line(input: &[u8]) -> IResult<&[u8], Status> {
    preceded(
        tuple((tag("HTTP/"), take_till(is_space), space1)),
        status_value
    )(input)
}

/// The value of a `Status:` header: a three-digit code and an optional
/// reason phrase
pub fn status_value(input: &[u8]) -> IResult<&[u8], Status> {
    let (input, code) = code(input)?;
    let (input, reason) = alt((
        map(eof, |_: &[u8]| Vec::new()),
        map(preceded(space1, rest), |phrase: &[u8]| phrase.to_vec())
    ))(input)?;

    let reason_phrase = if reason.is_empty() {
        Vec::from(super::default_reason(code).as_bytes())
    }
    else {
        reason
    };

    Ok((input, Status { code, reason_phrase }))
}

/// A three-digit code in 100..=599
fn code(input: &[u8]) -> IResult<&[u8], u16> {
    verify(
        map_res(
            map_res(take_while_m_n(3, 3, is_digit), str::from_utf8),
            FromStr::from_str
        ),
        |code: &u16| (100 ..= 599).contains(code)
    )(input)
}

fn is_space(x: u8) -> bool {
    x == b' ' || x == b'\t'
}

/// Token characters per RFC 7230
fn is_token(x: u8) -> bool {
    x.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&x)
}

/// Field value bytes: anything but controls, with HTAB allowed
fn is_field_byte(x: u8) -> bool {
    x == b'\t' || (x >= 0x20 && x != 0x7F)
}

/// One `Name: Value` line, line terminator already removed
pub fn header(input: &[u8]) -> IResult<&[u8], Header> {
    let (input, (name, _, _, content)) =
        tuple((take_while1(is_token), tag(":"), space0,
               verify(rest, |value: &[u8]| value.iter().all(|&b| is_field_byte(b)))))(input)?;

    let end = content.iter().rposition(|&b| !is_space(b)).map_or(0, |i| i + 1);

    Ok((input, Header {
        name: Vec::from(name),
        content: Vec::from(&content[.. end])
    }))
}

fn content_length(value: &[u8]) -> Option<usize> {
    if value.is_empty() || !value.iter().all(|&b| is_digit(b)) {
        return None;
    }

    str::from_utf8(value).ok()?.parse().ok()
}

#[cfg(test)]
mod test {
    use super::*;

    fn parser() -> ResponseParser {
        ResponseParser::new(16 * 1024)
    }

    #[test]
    fn header_works() {
        let input: &[u8] = b"Foo: bar";
        let expected = Header {
            name: Vec::from(&b"Foo"[..]),
            content: Vec::from(&b"bar"[..])
        };

        assert_eq!(header(input).unwrap(), (&b""[..], expected));
    }

    #[test]
    fn header_trims_surrounding_whitespace() {
        let (_, hdr) = header(b"X-Thing:\t  spaced out  ").unwrap();
        assert_eq!(hdr.content, b"spaced out");
    }

    #[test]
    fn header_rejects_lines_without_a_name() {
        assert!(header(b": no name").is_err());
        assert!(header(b"no colon here").is_err());
        assert!(header(b"    Content-Type: text/html").is_err());
    }

    #[test]
    fn header_rejects_control_bytes_in_values() {
        assert!(header(b"X-A: a\rSet-Cookie: evil=1").is_err());
        assert!(header(b"X-A: nul\0byte").is_err());
        assert!(header(b"X-A: del\x7f").is_err());
        assert_eq!(header(b"X-A: tab\tseparated").unwrap().1.content, b"tab\tseparated");
    }

    #[test]
    fn status_codes_outside_the_valid_range_are_rejected() {
        assert!(status_value(b"007 Bond").is_err());
        assert!(status_value(b"600 Too Far").is_err());
        assert!(status_value(b"099").is_err());
        assert_eq!(status_value(b"599 Edge").unwrap().1.code, 599);
        assert_eq!(status_value(b"100").unwrap().1.code, 100);
    }

    #[test]
    fn bad_status_and_smuggled_headers_are_dropped() {
        let parsed = parser().parse(
            b"Status: 007 Bond\nX-A: a\rSet-Cookie: evil=1\nContent-Type: text/plain\n\nbody"
        ).unwrap();

        assert_eq!(parsed.status.code, 200);
        assert_eq!(parsed.headers, vec![Header::new("Content-Type", "text/plain")]);
        assert_eq!(parsed.header_values("Set-Cookie").count(), 0);
    }

    #[test]
    fn status_value_with_and_without_reason() {
        let (_, stat) = status_value(b"404 Not Found").unwrap();
        assert_eq!(stat, Status { code: 404, reason_phrase: Vec::from(&b"Not Found"[..]) });

        let (_, stat) = status_value(b"302").unwrap();
        assert_eq!(stat.code, 302);
        assert_eq!(stat.reason_phrase, b"Found");

        assert!(status_value(b"4040 Nope").is_err());
        assert!(status_value(b"ok").is_err());
    }

    #[test]
    fn split_handles_both_separators() {
        assert_eq!(split_document(b"A: b\n\nbody", 100),
                   Some((&b"A: b"[..], &b"body"[..])));
        assert_eq!(split_document(b"A: b\r\n\r\nbody", 100),
                   Some((&b"A: b\r"[..], &b"body"[..])));
        assert_eq!(split_document(b"A: b\r\n\nbody", 100),
                   Some((&b"A: b\r"[..], &b"body"[..])));
        assert_eq!(split_document(b"A: b\nno separator", 100), None);
    }

    #[test]
    fn split_respects_the_scan_limit() {
        let output = b"A: b\nC: d\n\nbody";
        assert!(split_document(output, 4).is_none());
        assert!(split_document(output, 10).is_some());
    }

    #[test]
    fn doc_headers_on_captured_traffic() {
        let input: &[u8] = b"Status: 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nDate: Thu, 07 Apr 2016 20:42:43 GMT\r\n\r\n<!DOCTYPE html>\n<html>\n  <head>\n    <title>Guestbook</title>\n  </head>\n</html>\n";

        let parsed = parser().parse(input).unwrap();

        assert_eq!(parsed.status, Status {
            code: 200,
            reason_phrase: Vec::from(&b"OK"[..])
        });
        assert_eq!(parsed.headers, vec![
            Header::new("Content-Type", "text/html; charset=utf-8"),
            Header::new("Date", "Thu, 07 Apr 2016 20:42:43 GMT"),
        ]);
        assert!(parsed.body.starts_with(b"<!DOCTYPE html>"));
        assert!(!parsed.is_truncated());
    }

    #[test]
    fn defaults_to_200_with_server_computed_length() {
        let parsed = parser().parse(b"Content-Type: text/html\n\n<p>hi</p>\n").unwrap();

        assert_eq!(parsed.status.code, 200);
        assert_eq!(parsed.header("content-type"), Some("text/html"));
        assert_eq!(parsed.body, b"<p>hi</p>\n");
        assert_eq!(parsed.declared_length, None);
    }

    #[test]
    fn exact_content_length_is_byte_identical() {
        let body: Vec<u8> = (0 .. 255u8).collect();
        let mut output = format!("Content-Type: application/octet-stream\r\nContent-Length: {}\r\n\r\n",
                                 body.len()).into_bytes();
        output.extend_from_slice(&body);

        let parsed = parser().parse(&output).unwrap();

        assert_eq!(parsed.body, body);
        assert_eq!(parsed.declared_length, Some(255));
        assert!(parsed.truncated.is_none());
        assert!(parsed.header("Content-Length").is_none());
    }

    #[test]
    fn declared_length_trims_trailing_bytes() {
        let parsed = parser().parse(b"Content-Length: 5\n\nhello\n\n").unwrap();
        assert_eq!(parsed.body, b"hello");
        assert!(!parsed.is_truncated());
    }

    #[test]
    fn short_body_is_flagged_not_fatal() {
        let mut output = Vec::from(&b"Content-Type: text/plain\nContent-Length: 100\n\n"[..]);
        output.extend_from_slice(&[b'x'; 40]);

        let parsed = parser().parse(&output).unwrap();

        assert_eq!(parsed.body.len(), 40);
        assert_eq!(parsed.truncated, Some(TruncatedBody { declared: 100, available: 40 }));
    }

    #[test]
    fn status_header_sets_the_code() {
        let parsed = parser().parse(b"Status: 404 Not Found\nContent-Type: text/plain\n\nnope").unwrap();
        assert_eq!(parsed.status.code, 404);
        assert_eq!(parsed.status.reason_phrase, b"Not Found");
        assert!(parsed.header("Status").is_none());
    }

    #[test]
    fn nph_status_line_is_accepted() {
        let parsed = parser().parse(b"HTTP/1.1 201 Created\r\nContent-Type: text/plain\r\n\r\nmade").unwrap();
        assert_eq!(parsed.status.code, 201);
        assert_eq!(parsed.headers, vec![Header::new("Content-Type", "text/plain")]);
    }

    #[test]
    fn location_without_status_redirects() {
        let parsed = parser().parse(b"Location: https://example.org/\n\n").unwrap();
        assert_eq!(parsed.status.code, 302);
        assert!(parsed.body.is_empty());
    }

    #[test]
    fn repeated_set_cookie_headers_stay_separate() {
        let parsed = parser().parse(
            b"Content-Type: text/html\nSet-Cookie: a=1\nX-Other: y\nSet-Cookie: b=2; Max-Age=20\n\n"
        ).unwrap();

        let cookies: Vec<&[u8]> = parsed.header_values("Set-Cookie").collect();
        assert_eq!(cookies, vec![&b"a=1"[..], &b"b=2; Max-Age=20"[..]]);
        assert_eq!(parsed.headers[2], Header::new("X-Other", "y"));
    }

    #[test]
    fn malformed_lines_are_dropped() {
        let parsed = parser().parse(
            b"Content-Type: text/plain\nthis is not a header\nStatus: banana\nContent-Length: lots\n\nbody"
        ).unwrap();

        assert_eq!(parsed.headers, vec![Header::new("Content-Type", "text/plain")]);
        assert_eq!(parsed.status.code, 200);
        assert_eq!(parsed.declared_length, None);
        assert_eq!(parsed.body, b"body");
    }

    #[test]
    fn leading_blank_line_is_skipped() {
        let parsed = parser().parse(b"\nContent-Type: text/html\n\n<p>ok</p>").unwrap();
        assert_eq!(parsed.header("Content-Type"), Some("text/html"));
        assert_eq!(parsed.body, b"<p>ok</p>");
    }

    #[test]
    fn missing_separator_is_malformed() {
        for output in &[&b""[..], &b"Content-Type: text/plain\n"[..], &b"just some text"[..]] {
            match parser().parse(output) {
                Err(Error::MalformedResponse) => (),
                other => panic!("{:?}", other)
            }
        }
    }

    #[test]
    fn separator_past_the_scan_limit_is_malformed() {
        let mut output = Vec::from(&b"X-Padding: "[..]);
        output.extend_from_slice(&[b'a'; 64]);
        output.extend_from_slice(b"\n\nbody");

        assert!(ResponseParser::new(32).parse(&output).is_err());
        assert!(ResponseParser::new(128).parse(&output).is_ok());
    }
}
