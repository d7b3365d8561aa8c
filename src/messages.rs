// Copyright 2020 Joyent, Inc.

//! Fixed-layout command and response bodies.
//!
//! Each body is a packed little-endian struct. String fields are stored as
//! `u16 offset, u16 length` pairs relative to the start of the body and
//! their bytes follow the fixed fields. Decoding first checks that the
//! fixed part is present, then validates every string reference.

use chrono::{DateTime, TimeZone, Utc};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use serde_derive::{Deserialize, Serialize};

use bytes::Bytes;

use crate::arm_info::{ArmInfo, ArmWorkingStatus};
use crate::error::{HapiError, Result};
use crate::wire::{BodyWriter, WireReader};

/// Host id meaning "every host" in fetch requests.
pub const ALL_HOSTS: u64 = u64::max_value();

/// Event id returned when the gate has no event yet.
pub const EVENT_ID_NONE: u64 = u64::max_value();

pub trait WireBody: Sized {
    /// Size of the fixed part of the body.
    const FIXED_SIZE: usize;

    fn encode(&self) -> Result<Bytes>;

    fn decode_fixed(reader: &mut WireReader<'_>, body: &[u8]) -> Result<Self>;

    fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < Self::FIXED_SIZE {
            return Err(HapiError::broken(format!(
                "body of {} bytes is shorter than {}",
                body.len(),
                Self::FIXED_SIZE
            )));
        }
        let mut reader = WireReader::new(body);
        Self::decode_fixed(&mut reader, body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitiationBody {
    pub key: u64,
}

impl WireBody for InitiationBody {
    const FIXED_SIZE: usize = 8;

    fn encode(&self) -> Result<Bytes> {
        let mut w = BodyWriter::new(Self::FIXED_SIZE);
        w.put_u64(self.key);
        Ok(w.finish())
    }

    fn decode_fixed(reader: &mut WireReader<'_>, _body: &[u8]) -> Result<Self> {
        Ok(InitiationBody {
            key: reader.read_u64()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, FromPrimitive, ToPrimitive)]
pub enum MonitoringSystemType {
    Zabbix = 0,
    Nagios = 1,
    HapiZabbix = 2,
    HapiNagios = 3,
    HapiJson = 4,
    Unknown = 0xffff,
}

impl Default for MonitoringSystemType {
    fn default() -> Self {
        MonitoringSystemType::Unknown
    }
}

/// The monitoring server an arm plugin is responsible for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringServerInfo {
    pub server_id: u32,
    #[serde(rename = "type")]
    pub server_type: MonitoringSystemType,
    pub host_name: String,
    pub ip_address: String,
    pub nickname: String,
    pub port: u16,
    pub polling_interval_sec: u16,
    pub retry_interval_sec: u16,
    pub user_name: String,
    pub password: String,
    pub db_name: String,
}

impl WireBody for MonitoringServerInfo {
    const FIXED_SIZE: usize = 4 + 2 + 4 + 4 + 4 + 2 + 2 + 2 + 4 + 4 + 4;

    fn encode(&self) -> Result<Bytes> {
        let mut w = BodyWriter::new(Self::FIXED_SIZE);
        w.put_u32(self.server_id);
        w.put_u16(self.server_type as u16);
        w.put_string(&self.host_name)?;
        w.put_string(&self.ip_address)?;
        w.put_string(&self.nickname)?;
        w.put_u16(self.port);
        w.put_u16(self.polling_interval_sec);
        w.put_u16(self.retry_interval_sec);
        w.put_string(&self.user_name)?;
        w.put_string(&self.password)?;
        w.put_string(&self.db_name)?;
        Ok(w.finish())
    }

    fn decode_fixed(r: &mut WireReader<'_>, body: &[u8]) -> Result<Self> {
        let server_id = r.read_u32()?;
        let raw_type = r.read_u16()?;
        Ok(MonitoringServerInfo {
            server_id,
            server_type: MonitoringSystemType::from_u16(raw_type)
                .unwrap_or(MonitoringSystemType::Unknown),
            host_name: r.read_string_field(body)?,
            ip_address: r.read_string_field(body)?,
            nickname: r.read_string_field(body)?,
            port: r.read_u16()?,
            polling_interval_sec: r.read_u16()?,
            retry_interval_sec: r.read_u16()?,
            user_name: r.read_string_field(body)?,
            password: r.read_string_field(body)?,
            db_name: r.read_string_field(body)?,
        })
    }
}

/// A point in time as `u64 sec, u32 nsec` since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timespec {
    pub sec: u64,
    pub nsec: u32,
}

impl Timespec {
    pub fn new(sec: u64, nsec: u32) -> Timespec {
        Timespec { sec, nsec }
    }

    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.nsec == 0
    }

    pub fn from_datetime(t: &DateTime<Utc>) -> Timespec {
        if t.timestamp() < 0 {
            return Timespec::default();
        }
        Timespec {
            sec: t.timestamp() as u64,
            nsec: t.timestamp_subsec_nanos(),
        }
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        if self.sec > i64::max_value() as u64 {
            return None;
        }
        Utc.timestamp_opt(self.sec as i64, self.nsec).single()
    }

    fn put(&self, w: &mut BodyWriter) {
        w.put_u64(self.sec);
        w.put_u32(self.nsec);
    }

    fn read(r: &mut WireReader<'_>) -> Result<Timespec> {
        let sec = r.read_u64()?;
        let nsec = r.read_u32()?;
        if nsec >= 1_000_000_000 {
            return Err(HapiError::broken(format!("nanoseconds out of range: {}", nsec)));
        }
        Ok(Timespec { sec, nsec })
    }
}

impl WireBody for Timespec {
    const FIXED_SIZE: usize = 12;

    fn encode(&self) -> Result<Bytes> {
        let mut w = BodyWriter::new(Self::FIXED_SIZE);
        self.put(&mut w);
        Ok(w.finish())
    }

    fn decode_fixed(r: &mut WireReader<'_>, _body: &[u8]) -> Result<Self> {
        Timespec::read(r)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastEventIdBody {
    pub event_id: u64,
}

impl LastEventIdBody {
    pub fn event_id(&self) -> Option<u64> {
        if self.event_id == EVENT_ID_NONE {
            None
        } else {
            Some(self.event_id)
        }
    }
}

impl WireBody for LastEventIdBody {
    const FIXED_SIZE: usize = 8;

    fn encode(&self) -> Result<Bytes> {
        let mut w = BodyWriter::new(Self::FIXED_SIZE);
        w.put_u64(self.event_id);
        Ok(w.finish())
    }

    fn decode_fixed(r: &mut WireReader<'_>, _body: &[u8]) -> Result<Self> {
        Ok(LastEventIdBody {
            event_id: r.read_u64()?,
        })
    }
}

/// Request body of GET_TIME_OF_LAST_EVENT. An empty trigger id asks for
/// the newest event of any trigger.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TimeOfLastEventRequest {
    pub trigger_id: String,
}

impl WireBody for TimeOfLastEventRequest {
    const FIXED_SIZE: usize = 4;

    fn encode(&self) -> Result<Bytes> {
        let mut w = BodyWriter::new(Self::FIXED_SIZE);
        w.put_string(&self.trigger_id)?;
        Ok(w.finish())
    }

    fn decode_fixed(r: &mut WireReader<'_>, body: &[u8]) -> Result<Self> {
        Ok(TimeOfLastEventRequest {
            trigger_id: r.read_string_field(body)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostsChangedBody {
    pub changed: bool,
}

impl WireBody for HostsChangedBody {
    const FIXED_SIZE: usize = 1;

    fn encode(&self) -> Result<Bytes> {
        let mut w = BodyWriter::new(Self::FIXED_SIZE);
        w.put_u8(self.changed as u8);
        Ok(w.finish())
    }

    fn decode_fixed(r: &mut WireReader<'_>, _body: &[u8]) -> Result<Self> {
        Ok(HostsChangedBody {
            changed: r.read_u8()? != 0,
        })
    }
}

/// Request body of REQ_FETCH_ITEMS and REQ_FETCH_TRIGGERS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    pub host_id: u64,
}

impl FetchRequest {
    pub fn all_hosts() -> FetchRequest {
        FetchRequest { host_id: ALL_HOSTS }
    }
}

impl WireBody for FetchRequest {
    const FIXED_SIZE: usize = 8;

    fn encode(&self) -> Result<Bytes> {
        let mut w = BodyWriter::new(Self::FIXED_SIZE);
        w.put_u64(self.host_id);
        Ok(w.finish())
    }

    fn decode_fixed(r: &mut WireReader<'_>, _body: &[u8]) -> Result<Self> {
        Ok(FetchRequest {
            host_id: r.read_u64()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchHistoryRequest {
    pub host_id: u64,
    pub item_id: u64,
    pub value_type: u16,
    pub begin_time: u64,
    pub end_time: u64,
}

impl WireBody for FetchHistoryRequest {
    const FIXED_SIZE: usize = 8 + 8 + 2 + 8 + 8;

    fn encode(&self) -> Result<Bytes> {
        let mut w = BodyWriter::new(Self::FIXED_SIZE);
        w.put_u64(self.host_id);
        w.put_u64(self.item_id);
        w.put_u16(self.value_type);
        w.put_u64(self.begin_time);
        w.put_u64(self.end_time);
        Ok(w.finish())
    }

    fn decode_fixed(r: &mut WireReader<'_>, _body: &[u8]) -> Result<Self> {
        Ok(FetchHistoryRequest {
            host_id: r.read_u64()?,
            item_id: r.read_u64()?,
            value_type: r.read_u16()?,
            begin_time: r.read_u64()?,
            end_time: r.read_u64()?,
        })
    }
}

fn optional_time(t: &Option<DateTime<Utc>>) -> Timespec {
    t.as_ref().map(Timespec::from_datetime).unwrap_or_default()
}

fn read_optional_time(r: &mut WireReader<'_>) -> Result<Option<DateTime<Utc>>> {
    let t = Timespec::read(r)?;
    if t.is_zero() {
        return Ok(None);
    }
    t.to_datetime()
        .map(Some)
        .ok_or_else(|| HapiError::broken("timestamp out of range"))
}

impl WireBody for ArmInfo {
    const FIXED_SIZE: usize = 2 + 2 + 12 * 3 + 8 + 8 + 4;

    fn encode(&self) -> Result<Bytes> {
        let mut w = BodyWriter::new(Self::FIXED_SIZE);
        w.put_u16(self.running as u16);
        w.put_u16(self.stat as u16);
        optional_time(&self.stat_update_time).put(&mut w);
        optional_time(&self.last_success_time).put(&mut w);
        optional_time(&self.last_failure_time).put(&mut w);
        w.put_u64(self.num_update);
        w.put_u64(self.num_failure);
        w.put_string(&self.failure_comment)?;
        Ok(w.finish())
    }

    fn decode_fixed(r: &mut WireReader<'_>, body: &[u8]) -> Result<Self> {
        let running = r.read_u16()? != 0;
        let raw_stat = r.read_u16()?;
        let stat = ArmWorkingStatus::from_u16(raw_stat)
            .ok_or_else(|| HapiError::broken(format!("unknown arm status: {}", raw_stat)))?;
        Ok(ArmInfo {
            running,
            stat,
            stat_update_time: read_optional_time(r)?,
            last_success_time: read_optional_time(r)?,
            last_failure_time: read_optional_time(r)?,
            num_update: r.read_u64()?,
            num_failure: r.read_u64()?,
            failure_comment: r.read_string_field(body)?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn server_info() -> MonitoringServerInfo {
        MonitoringServerInfo {
            server_id: 3,
            server_type: MonitoringSystemType::HapiZabbix,
            host_name: "zbx1.example.com".to_string(),
            ip_address: "192.0.2.10".to_string(),
            nickname: "zbx1".to_string(),
            port: 10051,
            polling_interval_sec: 60,
            retry_interval_sec: 10,
            user_name: "Admin".to_string(),
            password: "zabbix".to_string(),
            db_name: String::new(),
        }
    }

    #[test]
    fn server_info_roundtrip() {
        let info = server_info();
        let body = info.encode().unwrap();
        assert_eq!(MonitoringServerInfo::decode(&body).unwrap(), info);
    }

    #[test]
    fn server_info_host_name_needs_terminator() {
        let body = server_info().encode().unwrap();
        let mut broken = body.to_vec();
        // host name is the first string in the variable region
        let at = MonitoringServerInfo::FIXED_SIZE + "zbx1.example.com".len();
        assert_eq!(broken[at], 0);
        broken[at] = b'!';
        assert!(MonitoringServerInfo::decode(&broken).is_err());
    }

    #[test]
    fn short_body_is_rejected() {
        let body = server_info().encode().unwrap();
        assert!(MonitoringServerInfo::decode(&body[..MonitoringServerInfo::FIXED_SIZE - 1]).is_err());
        // fixed part intact but string region cut
        assert!(MonitoringServerInfo::decode(&body[..body.len() - 1]).is_err());
    }

    #[test]
    fn timespec_rejects_bad_nanoseconds() {
        let body = Timespec::new(1, 1_000_000_000).encode().unwrap();
        assert!(Timespec::decode(&body).is_err());
    }

    #[test]
    fn arm_info_roundtrip() {
        let now = Utc.timestamp_opt(1_600_000_000, 5).single().unwrap();
        let info = ArmInfo {
            running: true,
            stat: ArmWorkingStatus::Failure,
            stat_update_time: Some(now),
            last_success_time: None,
            last_failure_time: Some(now),
            num_update: 12,
            num_failure: 2,
            failure_comment: "connection refused".to_string(),
        };
        let decoded = ArmInfo::decode(&info.encode().unwrap()).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn last_event_id_none() {
        let body = LastEventIdBody { event_id: EVENT_ID_NONE };
        assert_eq!(LastEventIdBody::decode(&body.encode().unwrap()).unwrap().event_id(), None);
    }
}
