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
use crate::io::{io_split, recv_into, AsyncRead, AsyncWrite, AsyncWriteExt};
use arrayvec::ArrayString;
use sha1::{Digest, Sha1};
use std::cell::RefCell;
use std::cmp;
use std::io;
use std::rc::Rc;
use std::str;
use std::str::FromStr;

pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

// 1 byte flags + 9 bytes payload size + 4 bytes mask
pub const HEADER_SIZE_MAX: usize = 14;

const PSIZE_3BYTE: usize = 126;
const PSIZE_9BYTE: usize = 65536;

pub const OPCODE_CONTINUATION: u8 = 0;
pub const OPCODE_TEXT: u8 = 1;
pub const OPCODE_BINARY: u8 = 2;
pub const OPCODE_CLOSE: u8 = 8;
pub const OPCODE_PING: u8 = 9;
pub const OPCODE_PONG: u8 = 10;

pub const CONTROL_FRAME_PAYLOAD_MAX: usize = 125;

const MESSAGE_SIZE_MAX: usize = 1_048_576;

const WS_KEY_INPUT_MAX: usize = 256;
const WS_ACCEPT_MAX: usize = 28; // base64_encode(sha1_hash) = 28 bytes

#[derive(Clone, Copy)]
pub struct FrameInfo {
    pub fin: bool,
    pub opcode: u8,
    pub mask: Option<[u8; 4]>,
    pub payload_offset: usize,
    pub payload_size: usize,
}

fn header_size(payload_size: usize, masked: bool) -> usize {
    let size = if payload_size < PSIZE_3BYTE {
        1 + 1
    } else if payload_size < PSIZE_9BYTE {
        1 + 3
    } else {
        1 + 9
    };

    if masked {
        size + 4
    } else {
        size
    }
}

pub fn read_header(buf: &[u8]) -> Result<FrameInfo, io::Error> {
    if buf.len() < 2 {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
    }

    let b1 = buf[1] & 0x7f;

    let (mut hsize, psize) = if b1 < (PSIZE_3BYTE as u8) {
        (2, b1 as usize)
    } else if b1 == (PSIZE_3BYTE as u8) {
        if buf.len() < 2 + 2 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }

        let mut arr = [0; 2];
        arr.copy_from_slice(&buf[2..4]);
        (4, u16::from_be_bytes(arr) as usize)
    } else {
        if buf.len() < 2 + 8 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }

        let mut arr = [0; 8];
        arr.copy_from_slice(&buf[2..10]);
        (10, u64::from_be_bytes(arr) as usize)
    };

    let mask = if buf[1] & 0x80 != 0 {
        if buf.len() < hsize + 4 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }

        let mut mask = [0; 4];
        mask.copy_from_slice(&buf[hsize..hsize + 4]);
        hsize += 4;

        Some(mask)
    } else {
        None
    };

    Ok(FrameInfo {
        fin: buf[0] & 0x80 != 0,
        opcode: buf[0] & 0x0f,
        mask,
        payload_offset: hsize,
        payload_size: psize,
    })
}

// returns the payload offset
pub fn write_header(
    fin: bool,
    opcode: u8,
    payload_size: usize,
    mask: Option<[u8; 4]>,
    buf: &mut [u8],
) -> Result<usize, io::Error> {
    let hsize = header_size(payload_size, mask.is_some());

    if buf.len() < hsize {
        return Err(io::Error::from(io::ErrorKind::WriteZero));
    }

    let mut b0 = 0;
    if fin {
        b0 |= 0x80;
    }
    b0 |= opcode & 0x0f;

    buf[0] = b0;

    let hsize = if payload_size < PSIZE_3BYTE {
        buf[1] = payload_size as u8;
        2
    } else if payload_size < PSIZE_9BYTE {
        buf[1] = PSIZE_3BYTE as u8;
        let arr = (payload_size as u16).to_be_bytes();
        buf[2..4].copy_from_slice(&arr);
        4
    } else {
        buf[1] = 0x7f;
        let arr = (payload_size as u64).to_be_bytes();
        buf[2..10].copy_from_slice(&arr);
        10
    };

    if let Some(mask) = mask {
        buf[1] |= 0x80;
        buf[hsize..hsize + 4].copy_from_slice(&mask);
        Ok(hsize + 4)
    } else {
        Ok(hsize)
    }
}

pub fn apply_mask(buf: &mut [u8], mask: [u8; 4], offset: usize) {
    for (i, c) in buf.iter_mut().enumerate() {
        *c ^= mask[(offset + i) % 4];
    }
}

// Sec-WebSocket-Accept value for a handshake key, per RFC 6455
#[allow(clippy::result_unit_err)]
pub fn accept_key(key: &[u8]) -> Result<ArrayString<WS_ACCEPT_MAX>, ()> {
    let input_len = key.len() + WS_GUID.len();

    if input_len > WS_KEY_INPUT_MAX {
        return Err(());
    }

    let mut input = [0; WS_KEY_INPUT_MAX];

    input[..key.len()].copy_from_slice(key);
    input[key.len()..input_len].copy_from_slice(WS_GUID.as_bytes());

    let mut hasher = Sha1::new();
    hasher.update(&input[..input_len]);
    let digest = hasher.finalize();

    let mut output = [0; WS_ACCEPT_MAX];

    let size = base64::encode_config_slice(digest, base64::STANDARD, &mut output);

    let output = match str::from_utf8(&output[..size]) {
        Ok(s) => s,
        Err(_) => return Err(()),
    };

    Ok(ArrayString::from_str(output).unwrap())
}

#[derive(Debug, PartialEq)]
pub struct Message {
    pub opcode: u8,
    pub data: Vec<u8>,
}

struct FrameInProgress {
    info: FrameInfo,
    read: usize,
    data: Vec<u8>,
}

// message stream over an established connection. the read buffer is taken
// over from the HTTP layer so bytes already buffered past the handshake are
// not lost. receiving reassembles fragmented messages, answers pings, and
// replies to a close before reporting end-of-stream
pub struct WsSocket<S: AsyncRead + AsyncWrite> {
    stream: Rc<RefCell<S>>,
    rbuf: ReadBuffer,
    frame: Option<FrameInProgress>,
    message: Option<Message>,
}

impl<S: AsyncRead + AsyncWrite> WsSocket<S> {
    pub fn new(stream: Rc<RefCell<S>>, rbuf: ReadBuffer) -> Self {
        Self {
            stream,
            rbuf,
            frame: None,
            message: None,
        }
    }

    // next complete text/binary message. None on a clean close or EOF
    pub async fn recv_message(&mut self) -> Result<Option<Message>, io::Error> {
        loop {
            if self.frame.is_none() {
                match read_header(self.rbuf.read_buf()) {
                    Ok(fi) => {
                        if fi.opcode & 0x08 != 0
                            && (fi.payload_size > CONTROL_FRAME_PAYLOAD_MAX || !fi.fin)
                        {
                            return Err(io::Error::from(io::ErrorKind::InvalidData));
                        }

                        self.rbuf.read_commit(fi.payload_offset);

                        self.frame = Some(FrameInProgress {
                            info: fi,
                            read: 0,
                            data: Vec::with_capacity(cmp::min(fi.payload_size, 16_384)),
                        });
                    }
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        if self.fill().await? == 0 {
                            return Ok(None);
                        }

                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            let frame = self.frame.as_mut().unwrap();

            let left = frame.info.payload_size - frame.read;

            if left > 0 {
                if self.rbuf.is_empty() {
                    let stream = self.stream.clone();
                    let (mut r, _) = io_split(&stream);

                    if recv_into(&mut r, &mut self.rbuf).await? == 0 {
                        return Ok(None);
                    }

                    continue;
                }

                let take = cmp::min(left, self.rbuf.len());

                if frame.data.len() + take > MESSAGE_SIZE_MAX {
                    return Err(io::Error::from(io::ErrorKind::InvalidData));
                }

                let start = frame.data.len();
                frame.data.extend_from_slice(&self.rbuf.read_buf()[..take]);

                if let Some(mask) = frame.info.mask {
                    apply_mask(&mut frame.data[start..], mask, frame.read);
                }

                self.rbuf.read_commit(take);
                frame.read += take;

                if frame.read < frame.info.payload_size {
                    continue;
                }
            }

            let frame = self.frame.take().unwrap();

            match frame.info.opcode {
                OPCODE_CLOSE => {
                    // answer the close, then report end-of-stream
                    let _ = self.send_message(OPCODE_CLOSE, &frame.data).await;

                    return Ok(None);
                }
                OPCODE_PING => {
                    self.send_message(OPCODE_PONG, &frame.data).await?;
                }
                OPCODE_PONG => {}
                OPCODE_CONTINUATION => {
                    let Some(message) = &mut self.message else {
                        return Err(io::Error::from(io::ErrorKind::InvalidData));
                    };

                    if message.data.len() + frame.data.len() > MESSAGE_SIZE_MAX {
                        return Err(io::Error::from(io::ErrorKind::InvalidData));
                    }

                    message.data.extend_from_slice(&frame.data);

                    if frame.info.fin {
                        return Ok(self.message.take());
                    }
                }
                opcode => {
                    if self.message.is_some() {
                        return Err(io::Error::from(io::ErrorKind::InvalidData));
                    }

                    let message = Message {
                        opcode,
                        data: frame.data,
                    };

                    if frame.info.fin {
                        return Ok(Some(message));
                    }

                    self.message = Some(message);
                }
            }
        }
    }

    // write one unfragmented, unmasked frame
    pub async fn send_message(&mut self, opcode: u8, payload: &[u8]) -> Result<(), io::Error> {
        let mut h = [0; HEADER_SIZE_MAX];

        let hsize = write_header(true, opcode, payload.len(), None, &mut h)?;

        let stream = self.stream.clone();
        let (_, mut w) = io_split(&stream);

        w.write(&h[..hsize]).await?;
        w.write(payload).await?;

        Ok(())
    }

    async fn fill(&mut self) -> Result<usize, io::Error> {
        let stream = self.stream.clone();
        let (mut r, _) = io_split(&stream);

        recv_into(&mut r, &mut self.rbuf).await
    }
}
