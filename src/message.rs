//! The message record (C1): the unit of work routed between BOX connections
//! and SMSC connections.
//!
//! A [`Message`] is an envelope (internal id, submission time, optional
//! smsc-id routing hint) wrapping a [`MessageBody`] variant. `pack`/`unpack`
//! round-trip the whole record to/from a flat byte buffer; the 4-byte
//! length prefix used on the wire is added by the connection layer
//! (`boxconn::wire`), not by `pack` itself, so the same bytes can be
//! reused unprefixed inside the persistent store's URL-encoded lines.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use uuid::Uuid;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("truncated message")]
    Incomplete,
    #[error("invalid utf-8 in field {0}")]
    InvalidUtf8(&'static str),
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("unknown enum value {value} for field {field}")]
    UnknownEnumValue { field: &'static str, value: u32 },
}

type Result<T> = std::result::Result<T, MessageError>;

/// Data-coding scheme of an SMS payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Coding {
    Default7Bit,
    Bit8,
    Ucs2,
    Undefined,
}

/// GSM message class, or `Undef` when the handset should pick a default.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageClass {
    Undef,
    Class0,
    Class1,
    Class2,
    Class3,
}

/// `sms-type` as described in spec §3.1: set exactly once, before the
/// message leaves its originating component, and never string-matched
/// downstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmsType {
    Mo,
    MtPush,
    MtReply,
    ReportMo,
    ReportMt,
}

/// Delivery disposition carried by an [`MessageBody::Ack`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NackCode {
    Success,
    Buffered,
    Failed,
    FailedTmp,
}

/// Administrative command carried by [`MessageBody::Admin`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdminCommand {
    Shutdown,
    Restart,
    Suspend,
    Resume,
    Identify,
}

/// Delivery-report mask bits (§4.3). A `u8` is enough: only the low five
/// bits are defined.
pub mod dlr_mask {
    pub const SMSC_SUCCESS: u8 = 0x08;
    pub const SMSC_FAIL: u8 = 0x10;
    pub const DELIVERED_SUCCESS: u8 = 0x01;
    pub const FAIL: u8 = 0x02;
    pub const BUFFERED: u8 = 0x04;
}

/// Carried by a split child so the consolidation pass (§4.4) can find its
/// parent: `parent_id`/`parent_time` identify the pre-split record that was
/// persisted to the store, `total_parts` is the child count the tracker
/// counts down from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SplitParts {
    pub parent_id: Uuid,
    pub parent_time: i64,
    pub total_parts: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SplitStatus {
    Success = 0,
    OtherFailure = 1,
    Rejected = 2,
    Discarded = 3,
    Malformed = 4,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SmsFields {
    pub sender: String,
    pub receiver: String,
    pub msgdata: Bytes,
    pub udhdata: Option<Bytes>,
    pub coding: Coding,
    pub message_class: MessageClass,
    pub mwi: bool,
    pub compress: bool,
    pub dlr_mask: u8,
    pub dlr_url: Option<String>,
    pub validity: Option<u32>,
    pub deferred: Option<u32>,
    pub service_name: Option<String>,
    pub account: Option<String>,
    pub billing_info: Option<String>,
    pub priority: i8,
    pub protocol_id: u8,
    pub boxc_id: Option<String>,
    pub sms_type: SmsType,
    pub split_parts: Option<SplitParts>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckFields {
    pub nack_code: NackCode,
    /// id and submission time of the SMS this ack answers.
    pub acked_id: Uuid,
    pub acked_time: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WdpFields {
    pub source_address: String,
    pub source_port: u16,
    pub destination_address: String,
    pub destination_port: u16,
    pub user_data: Bytes,
}

/// A back-end-detected delivery receipt, not yet correlated against the DLR
/// index (§4.3). Protocol-agnostic: each back-end's receiver fiber is
/// responsible for recognizing its own wire-level receipt shape (an SMPP
/// `deliver_sm` with a `DeliveryAck` `esm_class`, an EMI2 O-31, ...) and
/// reducing it to this triple before handing it to `Pool::receive_mo`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageBody {
    Sms(SmsFields),
    Ack(AckFields),
    WdpDatagram(WdpFields),
    Heartbeat { load: u32 },
    Admin { command: AdminCommand, boxc_id: Option<String> },
    DlrEvent { smsc_timestamp: String, destination: String, event: u8 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    /// UNIX seconds.
    pub time: i64,
    pub smsc_id: Option<String>,
    pub body: MessageBody,
}

impl Message {
    pub fn new_sms(fields: SmsFields) -> Self {
        Message { id: Uuid::new_v4(), time: now_unix(), smsc_id: None, body: MessageBody::Sms(fields) }
    }

    pub fn new_ack(for_msg: &Message, nack_code: NackCode) -> Self {
        Message {
            id: Uuid::new_v4(),
            time: now_unix(),
            smsc_id: for_msg.smsc_id.clone(),
            body: MessageBody::Ack(AckFields { nack_code, acked_id: for_msg.id, acked_time: for_msg.time }),
        }
    }

    pub fn new_dlr_event(smsc_id: impl Into<String>, smsc_timestamp: String, destination: String, event: u8) -> Self {
        Message {
            id: Uuid::new_v4(),
            time: now_unix(),
            smsc_id: Some(smsc_id.into()),
            body: MessageBody::DlrEvent { smsc_timestamp, destination, event },
        }
    }

    /// A short type tag, matching spec §4.1's `type(msg)`.
    pub fn type_tag(&self) -> &'static str {
        match &self.body {
            MessageBody::Sms(_) => "sms",
            MessageBody::Ack(_) => "ack",
            MessageBody::WdpDatagram(_) => "wdp-datagram",
            MessageBody::Heartbeat { .. } => "heartbeat",
            MessageBody::Admin { .. } => "admin",
            MessageBody::DlrEvent { .. } => "dlr-event",
        }
    }

    pub fn sms(&self) -> Option<&SmsFields> {
        match &self.body {
            MessageBody::Sms(f) => Some(f),
            _ => None,
        }
    }

    pub fn sms_mut(&mut self) -> Option<&mut SmsFields> {
        match &mut self.body {
            MessageBody::Sms(f) => Some(f),
            _ => None,
        }
    }

    /// Deep copy, for the "duplicate on enqueue" idiom (§3.1 Lifecycle, §9).
    pub fn duplicate(&self) -> Message {
        self.clone()
    }

    /// Diagnostic one-line rendering.
    pub fn dump(&self) -> String {
        format!("{:?}", self)
    }

    pub fn pack(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u128(self.id.as_u128());
        buf.put_i64(self.time);
        put_opt_string(&mut buf, self.smsc_id.as_deref());
        match &self.body {
            MessageBody::Sms(f) => {
                buf.put_u8(0);
                encode_sms(&mut buf, f);
            }
            MessageBody::Ack(f) => {
                buf.put_u8(1);
                buf.put_u8(f.nack_code as u8);
                buf.put_u128(f.acked_id.as_u128());
                buf.put_i64(f.acked_time);
            }
            MessageBody::WdpDatagram(f) => {
                buf.put_u8(2);
                put_string(&mut buf, &f.source_address);
                buf.put_u16(f.source_port);
                put_string(&mut buf, &f.destination_address);
                buf.put_u16(f.destination_port);
                put_bytes(&mut buf, &f.user_data);
            }
            MessageBody::Heartbeat { load } => {
                buf.put_u8(3);
                buf.put_u32(*load);
            }
            MessageBody::Admin { command, boxc_id } => {
                buf.put_u8(4);
                buf.put_u8(*command as u8);
                put_opt_string(&mut buf, boxc_id.as_deref());
            }
            MessageBody::DlrEvent { smsc_timestamp, destination, event } => {
                buf.put_u8(5);
                put_string(&mut buf, smsc_timestamp);
                put_string(&mut buf, destination);
                buf.put_u8(*event);
            }
        }
        buf.freeze()
    }

    pub fn unpack(bytes: &[u8]) -> Result<Message> {
        let mut buf = Bytes::copy_from_slice(bytes);
        let id = Uuid::from_u128(need_u128(&mut buf)?);
        let time = need_i64(&mut buf)?;
        let smsc_id = get_opt_string(&mut buf)?;
        let tag = need_u8(&mut buf)?;
        let body = match tag {
            0 => MessageBody::Sms(decode_sms(&mut buf)?),
            1 => {
                let nack_code = match need_u8(&mut buf)? {
                    0 => NackCode::Success,
                    1 => NackCode::Buffered,
                    2 => NackCode::Failed,
                    3 => NackCode::FailedTmp,
                    v => return Err(MessageError::UnknownEnumValue { field: "nack_code", value: v as u32 }),
                };
                let acked_id = Uuid::from_u128(need_u128(&mut buf)?);
                let acked_time = need_i64(&mut buf)?;
                MessageBody::Ack(AckFields { nack_code, acked_id, acked_time })
            }
            2 => {
                let source_address = get_string(&mut buf)?;
                let source_port = need_u16(&mut buf)?;
                let destination_address = get_string(&mut buf)?;
                let destination_port = need_u16(&mut buf)?;
                let user_data = get_bytes(&mut buf)?;
                MessageBody::WdpDatagram(WdpFields { source_address, source_port, destination_address, destination_port, user_data })
            }
            3 => MessageBody::Heartbeat { load: need_u32(&mut buf)? },
            4 => {
                let command = match need_u8(&mut buf)? {
                    0 => AdminCommand::Shutdown,
                    1 => AdminCommand::Restart,
                    2 => AdminCommand::Suspend,
                    3 => AdminCommand::Resume,
                    4 => AdminCommand::Identify,
                    v => return Err(MessageError::UnknownEnumValue { field: "admin_command", value: v as u32 }),
                };
                let boxc_id = get_opt_string(&mut buf)?;
                MessageBody::Admin { command, boxc_id }
            }
            5 => {
                let smsc_timestamp = get_string(&mut buf)?;
                let destination = get_string(&mut buf)?;
                let event = need_u8(&mut buf)?;
                MessageBody::DlrEvent { smsc_timestamp, destination, event }
            }
            other => return Err(MessageError::UnknownTag(other)),
        };
        Ok(Message { id, time, smsc_id, body })
    }
}

fn encode_sms(buf: &mut BytesMut, f: &SmsFields) {
    put_string(buf, &f.sender);
    put_string(buf, &f.receiver);
    put_bytes(buf, &f.msgdata);
    put_opt_bytes(buf, f.udhdata.as_deref());
    buf.put_u8(f.coding as u8);
    buf.put_u8(f.message_class as u8);
    buf.put_u8(f.mwi as u8);
    buf.put_u8(f.compress as u8);
    buf.put_u8(f.dlr_mask);
    put_opt_string(buf, f.dlr_url.as_deref());
    put_opt_u32(buf, f.validity);
    put_opt_u32(buf, f.deferred);
    put_opt_string(buf, f.service_name.as_deref());
    put_opt_string(buf, f.account.as_deref());
    put_opt_string(buf, f.billing_info.as_deref());
    buf.put_i8(f.priority);
    buf.put_u8(f.protocol_id);
    put_opt_string(buf, f.boxc_id.as_deref());
    buf.put_u8(f.sms_type as u8);
    match &f.split_parts {
        None => buf.put_u8(0),
        Some(sp) => {
            buf.put_u8(1);
            buf.put_u128(sp.parent_id.as_u128());
            buf.put_i64(sp.parent_time);
            buf.put_u32(sp.total_parts);
        }
    }
}

fn decode_sms(buf: &mut Bytes) -> Result<SmsFields> {
    let sender = get_string(buf)?;
    let receiver = get_string(buf)?;
    let msgdata = get_bytes(buf)?;
    let udhdata = get_opt_bytes(buf)?;
    let coding = match need_u8(buf)? {
        0 => Coding::Default7Bit,
        1 => Coding::Bit8,
        2 => Coding::Ucs2,
        3 => Coding::Undefined,
        // unknown fields tolerated per §4.1; fall back to the safe default.
        _ => Coding::Undefined,
    };
    let message_class = match need_u8(buf)? {
        0 => MessageClass::Undef,
        1 => MessageClass::Class0,
        2 => MessageClass::Class1,
        3 => MessageClass::Class2,
        4 => MessageClass::Class3,
        _ => MessageClass::Undef,
    };
    let mwi = need_u8(buf)? != 0;
    let compress = need_u8(buf)? != 0;
    let dlr_mask = need_u8(buf)?;
    let dlr_url = get_opt_string(buf)?;
    let validity = get_opt_u32(buf)?;
    let deferred = get_opt_u32(buf)?;
    let service_name = get_opt_string(buf)?;
    let account = get_opt_string(buf)?;
    let billing_info = get_opt_string(buf)?;
    let priority = need_i8(buf)?;
    let protocol_id = need_u8(buf)?;
    let boxc_id = get_opt_string(buf)?;
    let sms_type = match need_u8(buf)? {
        0 => SmsType::Mo,
        1 => SmsType::MtPush,
        2 => SmsType::MtReply,
        3 => SmsType::ReportMo,
        4 => SmsType::ReportMt,
        v => return Err(MessageError::UnknownEnumValue { field: "sms_type", value: v as u32 }),
    };
    let split_parts = match need_u8(buf)? {
        0 => None,
        _ => {
            let parent_id = Uuid::from_u128(need_u128(buf)?);
            let parent_time = need_i64(buf)?;
            let total_parts = need_u32(buf)?;
            Some(SplitParts { parent_id, parent_time, total_parts })
        }
    };
    Ok(SmsFields {
        sender, receiver, msgdata, udhdata, coding, message_class, mwi, compress, dlr_mask,
        dlr_url, validity, deferred, service_name, account, billing_info, priority, protocol_id,
        boxc_id, sms_type, split_parts,
    })
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_opt_string(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        None => buf.put_u8(0),
        Some(s) => {
            buf.put_u8(1);
            put_string(buf, s);
        }
    }
}

fn put_bytes(buf: &mut BytesMut, b: &[u8]) {
    buf.put_u32(b.len() as u32);
    buf.put_slice(b);
}

fn put_opt_bytes(buf: &mut BytesMut, b: Option<&[u8]>) {
    match b {
        None => buf.put_u8(0),
        Some(b) => {
            buf.put_u8(1);
            put_bytes(buf, b);
        }
    }
}

fn put_opt_u32(buf: &mut BytesMut, v: Option<u32>) {
    match v {
        None => buf.put_u8(0),
        Some(v) => {
            buf.put_u8(1);
            buf.put_u32(v);
        }
    }
}

fn need_u8(buf: &mut Bytes) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(MessageError::Incomplete);
    }
    Ok(buf.get_u8())
}

fn need_i8(buf: &mut Bytes) -> Result<i8> {
    Ok(need_u8(buf)? as i8)
}

fn need_u16(buf: &mut Bytes) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(MessageError::Incomplete);
    }
    Ok(buf.get_u16())
}

fn need_u32(buf: &mut Bytes) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(MessageError::Incomplete);
    }
    Ok(buf.get_u32())
}

fn need_i64(buf: &mut Bytes) -> Result<i64> {
    if buf.remaining() < 8 {
        return Err(MessageError::Incomplete);
    }
    Ok(buf.get_i64())
}

fn need_u128(buf: &mut Bytes) -> Result<u128> {
    if buf.remaining() < 16 {
        return Err(MessageError::Incomplete);
    }
    Ok(buf.get_u128())
}

fn get_string(buf: &mut Bytes) -> Result<String> {
    let len = need_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(MessageError::Incomplete);
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| MessageError::InvalidUtf8("string"))
}

fn get_opt_string(buf: &mut Bytes) -> Result<Option<String>> {
    match need_u8(buf)? {
        0 => Ok(None),
        _ => Ok(Some(get_string(buf)?)),
    }
}

fn get_bytes(buf: &mut Bytes) -> Result<Bytes> {
    let len = need_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(MessageError::Incomplete);
    }
    Ok(buf.copy_to_bytes(len))
}

fn get_opt_bytes(buf: &mut Bytes) -> Result<Option<Bytes>> {
    match need_u8(buf)? {
        0 => Ok(None),
        _ => Ok(Some(get_bytes(buf)?)),
    }
}

fn get_opt_u32(buf: &mut Bytes) -> Result<Option<u32>> {
    match need_u8(buf)? {
        0 => Ok(None),
        _ => Ok(Some(need_u32(buf)?)),
    }
}

pub fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.type_tag(), self.id)
    }
}
