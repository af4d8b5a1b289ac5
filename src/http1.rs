/*
 * Copyright (C) 2025 Filament Contributors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::buffer::ReadBuffer;
use std::cmp;
use std::collections::HashMap;
use std::io::Write;
use std::mem;
use std::str;

pub const HEADERS_MAX: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] httparse::Error),

    #[error("request header too large ({0} bytes max)")]
    RequestTooLarge(usize),

    #[error("request body too large ({0} bytes max)")]
    BodyTooLarge(usize),

    #[error("invalid content length")]
    InvalidContentLength,

    #[error("unsupported transfer encoding")]
    UnsupportedTransferEncoding,

    #[error("invalid header value")]
    InvalidHeader,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http10 => "1.0",
            Self::Http11 => "1.1",
        }
    }
}

#[derive(Debug)]
pub struct Header {
    pub name: String,
    pub value: String,
}

// one parsed request. the header list preserves names as received; lookups
// are case-insensitive
#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub uri: String,
    pub version: Version,
    pub headers: Vec<Header>,
    pub query_params: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }
}

// true if a comma-separated header value contains the given token,
// compared case-insensitively
pub fn header_value_has_token(value: &str, token: &str) -> bool {
    value.split(',').any(|p| p.trim().eq_ignore_ascii_case(token))
}

pub fn status_reason(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

// one outbound response. headers keep insertion order and names stay
// unique; setting an existing name replaces its value in place
#[derive(Debug)]
pub struct Reply {
    version: Version,
    code: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Reply {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            version: Version::Http11,
            code: 200,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn status(&self) -> u16 {
        self.code
    }

    pub fn set_status(&mut self, code: u16) -> &mut Self {
        self.code = code;

        self
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_version(&mut self, version: Version) -> &mut Self {
        self.version = version;

        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> &mut Self {
        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some((_, v)) => *v = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }

        self
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body<B: Into<Vec<u8>>>(&mut self, body: B) -> &mut Self {
        self.body = body.into();

        self
    }

    pub fn set_content<B: Into<Vec<u8>>>(&mut self, body: B, content_type: &str) -> &mut Self {
        self.set_body(body);
        self.set_header("Content-Type", content_type);

        self
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        write!(
            out,
            "HTTP/{} {} {}\r\n",
            self.version.as_str(),
            self.code,
            status_reason(self.code)
        )
        .unwrap();

        for (name, value) in self.headers.iter() {
            write!(out, "{}: {}\r\n", name, value).unwrap();
        }

        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
    }
}

pub enum ParseStatus {
    // need more input bytes
    Incomplete,

    Complete(Request),
}

enum ParserState {
    ReceivingHeader,
    ReceivingBody { req: Request, remaining: usize },
}

// incremental request parser. feed the connection's read buffer until a
// complete request comes out, then reset for the next one. bytes past the
// end of a request are left in the buffer
pub struct RequestParser {
    state: ParserState,
    body_max: usize,
}

impl RequestParser {
    pub fn new(body_max: usize) -> Self {
        Self {
            state: ParserState::ReceivingHeader,
            body_max,
        }
    }

    pub fn reset(&mut self) {
        self.state = ParserState::ReceivingHeader;
    }

    pub fn parse(&mut self, buf: &mut ReadBuffer) -> Result<ParseStatus, Error> {
        if let ParserState::ReceivingHeader = self.state {
            let mut headers = [httparse::EMPTY_HEADER; HEADERS_MAX];
            let mut req = httparse::Request::new(&mut headers);

            let size = match req.parse(buf.read_buf())? {
                httparse::Status::Complete(size) => size,
                httparse::Status::Partial => {
                    if buf.remaining_capacity() == 0 {
                        return Err(Error::RequestTooLarge(buf.capacity()));
                    }

                    return Ok(ParseStatus::Incomplete);
                }
            };

            let method = req.method.unwrap().to_string();
            let uri = req.path.unwrap().to_string();

            let version = match req.version.unwrap() {
                0 => Version::Http10,
                _ => Version::Http11,
            };

            let mut out_headers = Vec::with_capacity(req.headers.len());
            let mut content_length = 0;

            for h in req.headers.iter() {
                let value = str::from_utf8(h.value)
                    .map_err(|_| Error::InvalidHeader)?
                    .to_string();

                if h.name.eq_ignore_ascii_case("Content-Length") {
                    content_length = value.parse().map_err(|_| Error::InvalidContentLength)?;

                    if content_length > self.body_max {
                        return Err(Error::BodyTooLarge(self.body_max));
                    }
                } else if h.name.eq_ignore_ascii_case("Transfer-Encoding") {
                    return Err(Error::UnsupportedTransferEncoding);
                }

                out_headers.push(Header {
                    name: h.name.to_string(),
                    value,
                });
            }

            buf.read_commit(size);

            let request = Request {
                method,
                uri,
                version,
                headers: out_headers,
                query_params: HashMap::new(),
                body: Vec::new(),
            };

            if content_length == 0 {
                return Ok(ParseStatus::Complete(request));
            }

            self.state = ParserState::ReceivingBody {
                req: request,
                remaining: content_length,
            };
        }

        let ParserState::ReceivingBody { req, remaining } = &mut self.state else {
            unreachable!();
        };

        let take = cmp::min(*remaining, buf.read_buf().len());

        req.body.extend_from_slice(&buf.read_buf()[..take]);
        buf.read_commit(take);
        *remaining -= take;

        if *remaining > 0 {
            return Ok(ParseStatus::Incomplete);
        }

        let ParserState::ReceivingBody { req, .. } =
            mem::replace(&mut self.state, ParserState::ReceivingHeader)
        else {
            unreachable!();
        };

        Ok(ParseStatus::Complete(req))
    }
}
