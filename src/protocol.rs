// Copyright 2020 Joyent, Inc.

//! HAPI packet layer: header layout, command and response codes, and the
//! stream codec used by byte-stream transports.

use std::io;
use std::io::{Error, ErrorKind};

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{HapiError, Result};

const HAPI_OFF_LENGTH: usize = 0x0;
const HAPI_OFF_CODE: usize = 0x4;
const HAPI_OFF_SEQUENCE_ID: usize = 0x6;
const HAPI_OFF_BODY: usize = 0xa;

pub const HAPI_HEADER_SIZE: usize = HAPI_OFF_BODY;

/// Upper bound accepted by [`HapiCodec`] for a single packet.
pub const MAX_PACKET_SIZE: usize = 64 * 1024 * 1024;

/// Codes at or above this value are responses.
pub const RESPONSE_CODE_BASE: u16 = 0x8000;

/// Extension commands registered by a concrete plugin or gate start here.
pub const USER_COMMAND_START: u16 = 0x1000;

/// Sequence id used for commands that expect no reply.
pub const FIRE_AND_FORGET_SEQUENCE_ID: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
pub enum HapiCommandCode {
    GetMonitoringServerInfo = 0,
    GetTimestampOfLastTrigger = 1,
    GetLastEventId = 2,
    GetTimeOfLastEvent = 3,
    GetIfHostsChanged = 4,
    SendUpdatedTriggers = 5,
    SendHosts = 6,
    SendHostGroupElements = 7,
    SendHostGroups = 8,
    SendUpdatedEvents = 9,
    SendArmInfo = 10,
    SendHapSelfTriggers = 11,
    ReqFetchItems = 12,
    ReqTerminate = 13,
    ReqFetchHistory = 14,
    ReqFetchTriggers = 15,
    Initiation = 0x7f00,
}

impl HapiCommandCode {
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl From<HapiCommandCode> for u16 {
    fn from(code: HapiCommandCode) -> u16 {
        code as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
pub enum HapiResponseCode {
    Ok = 0x8000,
    UnsupportedCommand = 0x8001,
    NotInitiated = 0x8002,
    MalformedCommand = 0x8003,
    NotFound = 0x8004,
    HandlerError = 0x8005,
}

impl HapiResponseCode {
    pub fn code(self) -> u16 {
        self as u16
    }
}

pub fn command_code_name(code: u16) -> String {
    match HapiCommandCode::from_u16(code) {
        Some(c) => format!("{:?}", c),
        None => format!("0x{:04x}", code),
    }
}

pub fn response_code_name(code: u16) -> String {
    match HapiResponseCode::from_u16(code) {
        Some(c) => format!("{:?}", c),
        None => format!("0x{:04x}", code),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HapiHeader {
    pub length: u32,
    pub code: u16,
    pub sequence_id: u32,
}

impl HapiHeader {
    pub fn is_response(&self) -> bool {
        self.code >= RESPONSE_CODE_BASE
    }
}

/// One received packet: the header and the bytes that follow it.
#[derive(Debug, Clone)]
pub struct HapiMessage {
    pub header: HapiHeader,
    pub body: Bytes,
}

impl HapiMessage {
    pub fn parse(packet: Bytes) -> Result<HapiMessage> {
        if packet.len() < HAPI_HEADER_SIZE {
            return Err(HapiError::broken(format!(
                "packet of {} bytes is shorter than the header",
                packet.len()
            )));
        }
        let header = HapiHeader {
            length: LittleEndian::read_u32(&packet[HAPI_OFF_LENGTH..HAPI_OFF_CODE]),
            code: LittleEndian::read_u16(&packet[HAPI_OFF_CODE..HAPI_OFF_SEQUENCE_ID]),
            sequence_id: LittleEndian::read_u32(&packet[HAPI_OFF_SEQUENCE_ID..HAPI_OFF_BODY]),
        };
        if header.length as usize != packet.len() {
            return Err(HapiError::broken(format!(
                "packet declares {} bytes but {} were received",
                header.length,
                packet.len()
            )));
        }
        Ok(HapiMessage {
            header,
            body: packet.slice(HAPI_OFF_BODY..),
        })
    }

    pub fn code(&self) -> u16 {
        self.header.code
    }

    pub fn sequence_id(&self) -> u32 {
        self.header.sequence_id
    }

    pub fn is_response(&self) -> bool {
        self.header.is_response()
    }
}

/// A parsed response. The first two body bytes echo the command code.
#[derive(Debug, Clone)]
pub struct HapiResponse {
    pub code: u16,
    pub command: u16,
    pub sequence_id: u32,
    pub body: Bytes,
}

impl HapiResponse {
    pub fn from_message(msg: HapiMessage) -> Result<HapiResponse> {
        if msg.body.len() < 2 {
            return Err(HapiError::broken("response lacks the echoed command code"));
        }
        Ok(HapiResponse {
            code: msg.header.code,
            command: LittleEndian::read_u16(&msg.body[..2]),
            sequence_id: msg.header.sequence_id,
            body: msg.body.slice(2..),
        })
    }

    pub fn is_ok(&self) -> bool {
        self.code == HapiResponseCode::Ok.code()
    }

    pub fn into_result(self) -> Result<Bytes> {
        if self.is_ok() {
            Ok(self.body)
        } else {
            Err(HapiError::ErrorResponse {
                code: self.code,
                command: self.command,
            })
        }
    }
}

/// Builds a packet: header followed by `body`.
pub fn encode_packet(code: u16, sequence_id: u32, body: &[u8]) -> Result<Bytes> {
    let total = HAPI_HEADER_SIZE + body.len();
    if total > MAX_PACKET_SIZE {
        return Err(HapiError::Handler(format!(
            "packet of {} bytes exceeds the maximum size",
            total
        )));
    }
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u32_le(total as u32);
    buf.put_u16_le(code);
    buf.put_u32_le(sequence_id);
    buf.put_slice(body);
    Ok(buf.freeze())
}

pub fn encode_command(code: u16, sequence_id: u32, body: &[u8]) -> Result<Bytes> {
    debug_assert!(code < RESPONSE_CODE_BASE);
    encode_packet(code, sequence_id, body)
}

pub fn encode_response(
    code: HapiResponseCode,
    command: u16,
    sequence_id: u32,
    body: &[u8],
) -> Result<Bytes> {
    let mut full = BytesMut::with_capacity(2 + body.len());
    full.put_u16_le(command);
    full.put_slice(body);
    encode_packet(code.code(), sequence_id, &full)
}

/// Frames HAPI packets on a byte stream using the length in the header.
pub struct HapiCodec;

impl Decoder for HapiCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> std::result::Result<Option<Bytes>, io::Error> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let length = LittleEndian::read_u32(&buf[..4]) as usize;
        if length < HAPI_HEADER_SIZE || length > MAX_PACKET_SIZE {
            let msg = format!("invalid HAPI packet length: {}", length);
            return Err(Error::new(ErrorKind::InvalidData, msg));
        }
        if buf.len() < length {
            buf.reserve(length - buf.len());
            return Ok(None);
        }
        Ok(Some(buf.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for HapiCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, buf: &mut BytesMut) -> std::result::Result<(), io::Error> {
        buf.reserve(item.len());
        buf.put_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use quickcheck::quickcheck;

    #[test]
    fn header_layout() {
        let packet = encode_command(0x0102, 0x0a0b_0c0d, &[0xee]).unwrap();
        assert_eq!(
            &packet[..],
            &[11, 0, 0, 0, 0x02, 0x01, 0x0d, 0x0c, 0x0b, 0x0a, 0xee]
        );
        let msg = HapiMessage::parse(packet).unwrap();
        assert_eq!(msg.code(), 0x0102);
        assert_eq!(msg.sequence_id(), 0x0a0b_0c0d);
        assert_eq!(&msg.body[..], &[0xee]);
        assert!(!msg.is_response());
    }

    #[test]
    fn response_echoes_command() {
        let packet = encode_response(
            HapiResponseCode::UnsupportedCommand,
            0x1234,
            77,
            &[],
        )
        .unwrap();
        let res = HapiResponse::from_message(HapiMessage::parse(packet).unwrap()).unwrap();
        assert_eq!(res.command, 0x1234);
        assert_eq!(res.sequence_id, 77);
        match res.into_result() {
            Err(HapiError::ErrorResponse { code, command }) => {
                assert_eq!(code, HapiResponseCode::UnsupportedCommand.code());
                assert_eq!(command, 0x1234);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let packet = encode_command(1, 1, &[1, 2, 3]).unwrap();
        assert!(HapiMessage::parse(packet.slice(..packet.len() - 1)).is_err());
        assert!(HapiMessage::parse(packet.slice(..4)).is_err());
    }

    #[test]
    fn codec_waits_for_whole_packet() {
        let packet = encode_command(3, 9, b"abcdef").unwrap();
        let mut buf = BytesMut::new();
        buf.put_slice(&packet[..7]);
        assert!(HapiCodec.decode(&mut buf).unwrap().is_none());
        buf.put_slice(&packet[7..]);
        buf.put_slice(&packet[..2]);
        assert_eq!(HapiCodec.decode(&mut buf).unwrap().unwrap(), packet);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn codec_rejects_bogus_length() {
        let mut buf = BytesMut::from(&[3u8, 0, 0, 0, 0, 0][..]);
        assert!(HapiCodec.decode(&mut buf).is_err());
    }

    quickcheck! {
        fn prop_packet_roundtrip(code: u16, seq: u32, body: Vec<u8>) -> bool {
            let code = code & 0x7fff;
            match encode_command(code, seq, &body).and_then(HapiMessage::parse) {
                Ok(msg) => msg.code() == code && msg.sequence_id() == seq && msg.body == body,
                Err(_) => false,
            }
        }
    }
}
