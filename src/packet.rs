//! Wire protocol codec.
//!
//! Every packet begins with a 4-byte base header (type, version, flags).
//! The type namespace splits into control/data packets (3..=10) and REQ
//! packets (>= 64): the initial packet of every sub-protocol. REQ packets
//! carry a mandatory per-type header, optional headers in fixed order
//! (raw address, CQ data, connid), then payload. Control packets embed
//! their connid field directly, gated by the 0x40 flag bit.
//!
//! All fields are little-endian and packed. The codec borrows space in a
//! packet entry; it never allocates payload buffers itself.

use bitflags::bitflags;

use crate::addr::{RawAddr, RAW_ADDR_LEN};
use crate::error::{Error, Result};

/// Wire protocol version. Fixed.
pub const PROTOCOL_VERSION: u8 = 4;

/// Size of the base header.
pub const BASE_HDR_LEN: usize = 4;

/// Size of a serialized `RmaIov`.
pub const RMA_IOV_LEN: usize = 24;

/// Packet types. Values 3..=10 are control/data packets; values >= 64 are
/// REQ packets. Gaps in the numbering are retired types kept reserved for
/// wire compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PktType {
    Cts = 3,
    Data = 4,
    ReadRsp = 5,
    Eor = 7,
    AtomRsp = 8,
    Handshake = 9,
    Receipt = 10,

    EagerMsgRtm = 64,
    EagerTagRtm = 65,
    MediumMsgRtm = 66,
    MediumTagRtm = 67,
    LongCtsMsgRtm = 68,
    LongCtsTagRtm = 69,
    EagerRtw = 70,
    LongCtsRtw = 71,
    ShortRtr = 72,
    LongCtsRtr = 73,
    WriteRta = 74,
    FetchRta = 75,
    CompareRta = 76,

    LongReadMsgRtm = 128,
    LongReadTagRtm = 129,
    LongReadRtw = 130,

    DcEagerMsgRtm = 133,
    DcEagerTagRtm = 134,
    DcMediumMsgRtm = 135,
    DcMediumTagRtm = 136,
    DcLongCtsMsgRtm = 137,
    DcLongCtsTagRtm = 138,
    DcEagerRtw = 139,
    DcLongCtsRtw = 140,
    DcWriteRta = 141,
}

/// First REQ packet type value.
pub const REQ_PKT_BEGIN: u8 = 64;

impl TryFrom<u8> for PktType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        use PktType::*;
        Ok(match value {
            3 => Cts,
            4 => Data,
            5 => ReadRsp,
            7 => Eor,
            8 => AtomRsp,
            9 => Handshake,
            10 => Receipt,
            64 => EagerMsgRtm,
            65 => EagerTagRtm,
            66 => MediumMsgRtm,
            67 => MediumTagRtm,
            68 => LongCtsMsgRtm,
            69 => LongCtsTagRtm,
            70 => EagerRtw,
            71 => LongCtsRtw,
            72 => ShortRtr,
            73 => LongCtsRtr,
            74 => WriteRta,
            75 => FetchRta,
            76 => CompareRta,
            128 => LongReadMsgRtm,
            129 => LongReadTagRtm,
            130 => LongReadRtw,
            133 => DcEagerMsgRtm,
            134 => DcEagerTagRtm,
            135 => DcMediumMsgRtm,
            136 => DcMediumTagRtm,
            137 => DcLongCtsMsgRtm,
            138 => DcLongCtsTagRtm,
            139 => DcEagerRtw,
            140 => DcLongCtsRtw,
            141 => DcWriteRta,
            other => {
                return Err(Error::Malformed {
                    what: "packet type",
                    value: other as u64,
                })
            }
        })
    }
}

impl PktType {
    /// REQ packets are the initial packet of a sub-protocol.
    #[inline]
    pub fn is_req(self) -> bool {
        self as u8 >= REQ_PKT_BEGIN
    }

    /// Two-sided message REQ (any family).
    #[inline]
    pub fn is_rtm(self) -> bool {
        use PktType::*;
        matches!(
            self,
            EagerMsgRtm
                | EagerTagRtm
                | MediumMsgRtm
                | MediumTagRtm
                | LongCtsMsgRtm
                | LongCtsTagRtm
                | LongReadMsgRtm
                | LongReadTagRtm
                | DcEagerMsgRtm
                | DcEagerTagRtm
                | DcMediumMsgRtm
                | DcMediumTagRtm
                | DcLongCtsMsgRtm
                | DcLongCtsTagRtm
        )
    }

    #[inline]
    pub fn is_tagged_rtm(self) -> bool {
        use PktType::*;
        matches!(
            self,
            EagerTagRtm
                | MediumTagRtm
                | LongCtsTagRtm
                | LongReadTagRtm
                | DcEagerTagRtm
                | DcMediumTagRtm
                | DcLongCtsTagRtm
        )
    }

    #[inline]
    pub fn is_medium_rtm(self) -> bool {
        use PktType::*;
        matches!(
            self,
            MediumMsgRtm | MediumTagRtm | DcMediumMsgRtm | DcMediumTagRtm
        )
    }

    #[inline]
    pub fn is_longcts_rtm(self) -> bool {
        use PktType::*;
        matches!(
            self,
            LongCtsMsgRtm | LongCtsTagRtm | DcLongCtsMsgRtm | DcLongCtsTagRtm
        )
    }

    #[inline]
    pub fn is_longread_rtm(self) -> bool {
        use PktType::*;
        matches!(self, LongReadMsgRtm | LongReadTagRtm)
    }

    /// Delivery-complete variant: the receiver must send a RECEIPT after
    /// the payload lands in the application buffer.
    #[inline]
    pub fn is_dc(self) -> bool {
        use PktType::*;
        matches!(
            self,
            DcEagerMsgRtm
                | DcEagerTagRtm
                | DcMediumMsgRtm
                | DcMediumTagRtm
                | DcLongCtsMsgRtm
                | DcLongCtsTagRtm
                | DcEagerRtw
                | DcLongCtsRtw
                | DcWriteRta
        )
    }

    #[inline]
    pub fn is_rtw(self) -> bool {
        use PktType::*;
        matches!(
            self,
            EagerRtw | LongCtsRtw | LongReadRtw | DcEagerRtw | DcLongCtsRtw
        )
    }

    #[inline]
    pub fn is_rtr(self) -> bool {
        matches!(self, PktType::ShortRtr | PktType::LongCtsRtr)
    }

    #[inline]
    pub fn is_rta(self) -> bool {
        use PktType::*;
        matches!(self, WriteRta | FetchRta | CompareRta | DcWriteRta)
    }

    /// RTM and RTA packets consume a per-peer msg_id and flow through the
    /// reorder window; everything else is unordered.
    #[inline]
    pub fn is_ordered(self) -> bool {
        self.is_rtm() || self.is_rta()
    }
}

bitflags! {
    /// Base header flag bits.
    ///
    /// For REQ packets, 0x01/0x02/0x40 signal the optional headers and
    /// 0x04/0x08/0x10/0x20 describe the operation class. Control packets
    /// only use `OPT_CONNID`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PktFlags: u16 {
        const OPT_RAW_ADDR = 0x01;
        const OPT_CQ_DATA = 0x02;
        const REQ_MSG = 0x04;
        const REQ_TAGGED = 0x08;
        const REQ_RMA = 0x10;
        const REQ_ATOMIC = 0x20;
        const OPT_CONNID = 0x40;
    }
}

/// Extra feature / extra request identifiers exchanged via HANDSHAKE.
pub mod extra_feature {
    /// Peer can be the source of RDMA reads (long-read protocols).
    pub const RDMA_READ: u64 = 0;
    /// Peer implements the delivery-complete protocol (RECEIPT packets).
    pub const DELIVERY_COMPLETE: u64 = 1;
    /// Request: keep REQ header length constant; do not drop the raw
    /// address header after handshake.
    pub const CONSTANT_HEADER_LENGTH: u64 = 2;
    /// Request: include the connid header in every packet.
    pub const CONNID_HEADER: u64 = 3;
}

/// Feature/request bitmap carried by HANDSHAKE packets.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtraInfo(pub Vec<u64>);

impl ExtraInfo {
    #[inline]
    pub fn has(&self, id: u64) -> bool {
        let word = (id / 64) as usize;
        self.0.get(word).is_some_and(|w| w & (1 << (id % 64)) != 0)
    }

    pub fn set(&mut self, id: u64) {
        let word = (id / 64) as usize;
        if self.0.len() <= word {
            self.0.resize(word + 1, 0);
        }
        self.0[word] |= 1 << (id % 64);
    }
}

/// RMA iov describing one registered buffer region: `addr | len | key`,
/// 24 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmaIov {
    pub addr: u64,
    pub len: u64,
    pub key: u64,
}

/// Little-endian cursor over an outgoing packet buffer.
struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[inline]
    fn put_u8(&mut self, v: u8) {
        self.buf[self.pos] = v;
        self.pos += 1;
    }

    #[inline]
    fn put_u16(&mut self, v: u16) {
        self.buf[self.pos..self.pos + 2].copy_from_slice(&v.to_le_bytes());
        self.pos += 2;
    }

    #[inline]
    fn put_u32(&mut self, v: u32) {
        self.buf[self.pos..self.pos + 4].copy_from_slice(&v.to_le_bytes());
        self.pos += 4;
    }

    #[inline]
    fn put_u64(&mut self, v: u64) {
        self.buf[self.pos..self.pos + 8].copy_from_slice(&v.to_le_bytes());
        self.pos += 8;
    }

    #[inline]
    fn put_bytes(&mut self, v: &[u8]) {
        self.buf[self.pos..self.pos + v.len()].copy_from_slice(v);
        self.pos += v.len();
    }
}

/// Little-endian cursor over an incoming packet buffer.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.len() - self.pos < n {
            return Err(Error::Malformed {
                what: "truncated packet",
                value: self.buf.len() as u64,
            });
        }
        Ok(())
    }

    fn get_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn get_u16(&mut self) -> Result<u16> {
        self.need(2)?;
        let v = u16::from_le_bytes(self.buf[self.pos..self.pos + 2].try_into().unwrap());
        self.pos += 2;
        Ok(v)
    }

    fn get_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        let v = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    fn get_u64(&mut self) -> Result<u64> {
        self.need(8)?;
        let v = u64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    fn get_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n)?;
        let v = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(v)
    }
}

/// Base header present in every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseHdr {
    pub typ: PktType,
    pub flags: PktFlags,
}

impl BaseHdr {
    pub fn new(typ: PktType, flags: PktFlags) -> Self {
        Self { typ, flags }
    }

    fn put(&self, w: &mut Writer<'_>) {
        w.put_u8(self.typ as u8);
        w.put_u8(PROTOCOL_VERSION);
        w.put_u16(self.flags.bits());
    }

    fn get(r: &mut Reader<'_>) -> Result<Self> {
        let typ = PktType::try_from(r.get_u8()?)?;
        let version = r.get_u8()?;
        if version != PROTOCOL_VERSION {
            return Err(Error::Malformed {
                what: "protocol version",
                value: version as u64,
            });
        }
        let flags = PktFlags::from_bits_retain(r.get_u16()?);
        Ok(Self { typ, flags })
    }

    /// Peek the base header without consuming payload.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Self::get(&mut Reader::new(bytes))
    }
}

/// Optional headers a REQ packet may carry, in fixed wire order:
/// raw address, CQ data, connid. Presence is signaled by the base header
/// flag bits 0x01, 0x02 and 0x40 respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReqOptHdrs {
    pub raw_addr: Option<RawAddr>,
    pub cq_data: Option<u64>,
    pub connid: Option<u32>,
}

impl ReqOptHdrs {
    /// Flag bits contributed by the present optional headers.
    pub fn flags(&self) -> PktFlags {
        let mut f = PktFlags::empty();
        if self.raw_addr.is_some() {
            f |= PktFlags::OPT_RAW_ADDR;
        }
        if self.cq_data.is_some() {
            f |= PktFlags::OPT_CQ_DATA;
        }
        if self.connid.is_some() {
            f |= PktFlags::OPT_CONNID;
        }
        f
    }

    pub fn wire_len(&self) -> usize {
        let mut n = 0;
        if self.raw_addr.is_some() {
            n += 4 + RAW_ADDR_LEN;
        }
        if self.cq_data.is_some() {
            n += 8;
        }
        if self.connid.is_some() {
            n += 4;
        }
        n
    }

    fn put(&self, w: &mut Writer<'_>) {
        if let Some(raw) = &self.raw_addr {
            w.put_u32(RAW_ADDR_LEN as u32);
            w.put_bytes(&raw.to_bytes());
        }
        if let Some(data) = self.cq_data {
            w.put_u64(data);
        }
        if let Some(connid) = self.connid {
            w.put_u32(connid);
        }
    }

    fn get(r: &mut Reader<'_>, flags: PktFlags) -> Result<Self> {
        let mut out = Self::default();
        if flags.contains(PktFlags::OPT_RAW_ADDR) {
            let size = r.get_u32()? as usize;
            let bytes = r.get_bytes(size)?;
            out.raw_addr = Some(RawAddr::from_bytes(bytes).ok_or(Error::Malformed {
                what: "raw address header",
                value: size as u64,
            })?);
        }
        if flags.contains(PktFlags::OPT_CQ_DATA) {
            out.cq_data = Some(r.get_u64()?);
        }
        if flags.contains(PktFlags::OPT_CONNID) {
            out.connid = Some(r.get_u32()?);
        }
        Ok(out)
    }
}

fn put_opt_connid(w: &mut Writer<'_>, connid: Option<u32>) {
    if let Some(c) = connid {
        w.put_u32(c);
    }
}

fn get_opt_connid(r: &mut Reader<'_>, flags: PktFlags) -> Result<Option<u32>> {
    if flags.contains(PktFlags::OPT_CONNID) {
        Ok(Some(r.get_u32()?))
    } else {
        Ok(None)
    }
}

fn connid_flag(connid: Option<u32>) -> PktFlags {
    if connid.is_some() {
        PktFlags::OPT_CONNID
    } else {
        PktFlags::empty()
    }
}

fn put_rma_iovs(w: &mut Writer<'_>, iovs: &[RmaIov]) {
    for iov in iovs {
        w.put_u64(iov.addr);
        w.put_u64(iov.len);
        w.put_u64(iov.key);
    }
}

fn get_rma_iovs(r: &mut Reader<'_>, count: usize) -> Result<Vec<RmaIov>> {
    let mut iovs = Vec::with_capacity(count);
    for _ in 0..count {
        iovs.push(RmaIov {
            addr: r.get_u64()?,
            len: r.get_u64()?,
            key: r.get_u64()?,
        });
    }
    Ok(iovs)
}

/// HANDSHAKE: `base | nex_p3:u32 | exinfo:u64[nex_p3 - 3]`.
///
/// `nex_p3` is the number of exinfo words plus 3. The "+3" is historical
/// version skew and is preserved verbatim for wire compatibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeHdr {
    pub extra_info: ExtraInfo,
    pub connid: Option<u32>,
}

impl HandshakeHdr {
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut w = Writer::new(buf);
        BaseHdr::new(PktType::Handshake, connid_flag(self.connid)).put(&mut w);
        w.put_u32(self.extra_info.0.len() as u32 + 3);
        for word in &self.extra_info.0 {
            w.put_u64(*word);
        }
        put_opt_connid(&mut w, self.connid);
        w.pos
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let base = BaseHdr::get(&mut r)?;
        let nex_p3 = r.get_u32()?;
        if nex_p3 < 3 {
            return Err(Error::Malformed {
                what: "handshake nex_p3",
                value: nex_p3 as u64,
            });
        }
        let mut words = Vec::with_capacity((nex_p3 - 3) as usize);
        for _ in 0..nex_p3 - 3 {
            words.push(r.get_u64()?);
        }
        let connid = get_opt_connid(&mut r, base.flags)?;
        Ok(Self {
            extra_info: ExtraInfo(words),
            connid,
        })
    }
}

/// Common fields of every RTM/RTA REQ header.
///
/// `msg_id` is per-peer, per-direction and wraps modulo 2^32; the receive
/// side reorders by modular distance from the next expected id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReqCommon {
    pub typ: PktType,
    pub msg_id: u32,
    pub tag: Option<u64>,
}

impl ReqCommon {
    fn class_flags(&self) -> PktFlags {
        if self.typ.is_rta() {
            PktFlags::REQ_ATOMIC
        } else if self.typ.is_rtw() || self.typ.is_rtr() {
            PktFlags::REQ_RMA
        } else if self.tag.is_some() {
            PktFlags::REQ_TAGGED
        } else {
            PktFlags::REQ_MSG
        }
    }
}

/// EAGER RTM: `base | msg_id:u32 [| tag:u64] | opt | payload`.
///
/// The payload length is the packet size minus the header length; there is
/// no length field on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EagerRtmHdr {
    pub common: ReqCommon,
    pub opt: ReqOptHdrs,
}

impl EagerRtmHdr {
    pub fn wire_len(&self) -> usize {
        BASE_HDR_LEN + 4 + if self.common.tag.is_some() { 8 } else { 0 } + self.opt.wire_len()
    }

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut w = Writer::new(buf);
        let flags = self.common.class_flags() | self.opt.flags();
        BaseHdr::new(self.common.typ, flags).put(&mut w);
        w.put_u32(self.common.msg_id);
        if let Some(tag) = self.common.tag {
            w.put_u64(tag);
        }
        self.opt.put(&mut w);
        w.pos
    }

    /// Decode header; returns the header and the payload offset.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut r = Reader::new(bytes);
        let base = BaseHdr::get(&mut r)?;
        let msg_id = r.get_u32()?;
        let tag = if base.typ.is_tagged_rtm() {
            Some(r.get_u64()?)
        } else {
            None
        };
        let opt = ReqOptHdrs::get(&mut r, base.flags)?;
        Ok((
            Self {
                common: ReqCommon {
                    typ: base.typ,
                    msg_id,
                    tag,
                },
                opt,
            },
            r.pos,
        ))
    }
}

/// MEDIUM RTM: `base | msg_id:u32 | data_len:u64 | seg_offset:u64
/// [| tag:u64] | opt | payload`.
///
/// `data_len` is the total message length and is identical in every
/// segment of a burst; the receiver needs it on whichever segment lands
/// first, because segments may arrive in any order and are reassembled
/// by `seg_offset`. Each segment's own payload length is the packet
/// size minus the header length, like eager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediumRtmHdr {
    pub common: ReqCommon,
    pub data_len: u64,
    pub seg_offset: u64,
    pub opt: ReqOptHdrs,
}

impl MediumRtmHdr {
    pub fn wire_len(&self) -> usize {
        BASE_HDR_LEN + 4 + 16 + if self.common.tag.is_some() { 8 } else { 0 } + self.opt.wire_len()
    }

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut w = Writer::new(buf);
        let flags = self.common.class_flags() | self.opt.flags();
        BaseHdr::new(self.common.typ, flags).put(&mut w);
        w.put_u32(self.common.msg_id);
        w.put_u64(self.data_len);
        w.put_u64(self.seg_offset);
        if let Some(tag) = self.common.tag {
            w.put_u64(tag);
        }
        self.opt.put(&mut w);
        w.pos
    }

    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut r = Reader::new(bytes);
        let base = BaseHdr::get(&mut r)?;
        let msg_id = r.get_u32()?;
        let data_len = r.get_u64()?;
        let seg_offset = r.get_u64()?;
        let tag = if base.typ.is_tagged_rtm() {
            Some(r.get_u64()?)
        } else {
            None
        };
        let opt = ReqOptHdrs::get(&mut r, base.flags)?;
        Ok((
            Self {
                common: ReqCommon {
                    typ: base.typ,
                    msg_id,
                    tag,
                },
                data_len,
                seg_offset,
                opt,
            },
            r.pos,
        ))
    }
}

/// LONGCTS RTM: `base | msg_id:u32 | msg_length:u64 | send_id:u32 |
/// credit_request:u32 [| tag:u64] | opt | first payload chunk`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongCtsRtmHdr {
    pub common: ReqCommon,
    pub msg_length: u64,
    pub send_id: u32,
    pub credit_request: u32,
    pub opt: ReqOptHdrs,
}

impl LongCtsRtmHdr {
    pub fn wire_len(&self) -> usize {
        BASE_HDR_LEN + 4 + 8 + 8 + if self.common.tag.is_some() { 8 } else { 0 }
            + self.opt.wire_len()
    }

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut w = Writer::new(buf);
        let flags = self.common.class_flags() | self.opt.flags();
        BaseHdr::new(self.common.typ, flags).put(&mut w);
        w.put_u32(self.common.msg_id);
        w.put_u64(self.msg_length);
        w.put_u32(self.send_id);
        w.put_u32(self.credit_request);
        if let Some(tag) = self.common.tag {
            w.put_u64(tag);
        }
        self.opt.put(&mut w);
        w.pos
    }

    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut r = Reader::new(bytes);
        let base = BaseHdr::get(&mut r)?;
        let msg_id = r.get_u32()?;
        let msg_length = r.get_u64()?;
        let send_id = r.get_u32()?;
        let credit_request = r.get_u32()?;
        let tag = if base.typ.is_tagged_rtm() {
            Some(r.get_u64()?)
        } else {
            None
        };
        let opt = ReqOptHdrs::get(&mut r, base.flags)?;
        Ok((
            Self {
                common: ReqCommon {
                    typ: base.typ,
                    msg_id,
                    tag,
                },
                msg_length,
                send_id,
                credit_request,
                opt,
            },
            r.pos,
        ))
    }
}

/// LONGREAD RTM: `base | msg_id:u32 | msg_length:u64 | send_id:u32 |
/// read_iov_count:u32 [| tag:u64] | opt | read_iov[]`.
///
/// The iov array describes the *sender's* registered buffers; the receiver
/// pulls them with RDMA reads and answers with EOR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongReadRtmHdr {
    pub common: ReqCommon,
    pub msg_length: u64,
    pub send_id: u32,
    pub read_iov: Vec<RmaIov>,
    pub opt: ReqOptHdrs,
}

impl LongReadRtmHdr {
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut w = Writer::new(buf);
        let flags = self.common.class_flags() | self.opt.flags();
        BaseHdr::new(self.common.typ, flags).put(&mut w);
        w.put_u32(self.common.msg_id);
        w.put_u64(self.msg_length);
        w.put_u32(self.send_id);
        w.put_u32(self.read_iov.len() as u32);
        if let Some(tag) = self.common.tag {
            w.put_u64(tag);
        }
        self.opt.put(&mut w);
        put_rma_iovs(&mut w, &self.read_iov);
        w.pos
    }

    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut r = Reader::new(bytes);
        let base = BaseHdr::get(&mut r)?;
        let msg_id = r.get_u32()?;
        let msg_length = r.get_u64()?;
        let send_id = r.get_u32()?;
        let read_iov_count = r.get_u32()? as usize;
        let tag = if base.typ.is_tagged_rtm() {
            Some(r.get_u64()?)
        } else {
            None
        };
        let opt = ReqOptHdrs::get(&mut r, base.flags)?;
        let read_iov = get_rma_iovs(&mut r, read_iov_count)?;
        Ok((
            Self {
                common: ReqCommon {
                    typ: base.typ,
                    msg_id,
                    tag,
                },
                msg_length,
                send_id,
                read_iov,
                opt,
            },
            r.pos,
        ))
    }
}

/// RTW (emulated write): `base | rma_iov_count:u32 | send_id:u32 |
/// [msg_length:u64 | credit_request:u32] | [read_iov_count:u32] | opt |
/// rma_iov[] | [read_iov[]] | payload`.
///
/// The `rma_iov` array always describes the target buffer on the
/// responder. One-sided operations are unordered, so no msg_id is
/// carried; `send_id` routes the RECEIPT/CTS back-channel. The bracketed
/// fields are present for the long-CTS and long-read size classes
/// respectively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtwHdr {
    pub typ: PktType,
    pub rma_iov: Vec<RmaIov>,
    pub send_id: u32,
    /// Long-CTS and long-read variants only.
    pub msg_length: u64,
    pub credit_request: u32,
    /// Long-read variant only: source iovs on the requester.
    pub read_iov: Vec<RmaIov>,
    pub opt: ReqOptHdrs,
}

impl RtwHdr {
    fn is_long(typ: PktType) -> bool {
        matches!(
            typ,
            PktType::LongCtsRtw | PktType::DcLongCtsRtw | PktType::LongReadRtw
        )
    }

    pub fn wire_len(&self) -> usize {
        BASE_HDR_LEN
            + 8
            + if Self::is_long(self.typ) { 12 } else { 0 }
            + if self.typ == PktType::LongReadRtw { 4 } else { 0 }
            + self.opt.wire_len()
            + RMA_IOV_LEN * (self.rma_iov.len() + self.read_iov.len())
    }

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut w = Writer::new(buf);
        let flags = PktFlags::REQ_RMA | self.opt.flags();
        BaseHdr::new(self.typ, flags).put(&mut w);
        w.put_u32(self.rma_iov.len() as u32);
        w.put_u32(self.send_id);
        if Self::is_long(self.typ) {
            w.put_u64(self.msg_length);
            w.put_u32(self.credit_request);
        }
        if self.typ == PktType::LongReadRtw {
            w.put_u32(self.read_iov.len() as u32);
        }
        self.opt.put(&mut w);
        put_rma_iovs(&mut w, &self.rma_iov);
        if self.typ == PktType::LongReadRtw {
            put_rma_iovs(&mut w, &self.read_iov);
        }
        w.pos
    }

    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut r = Reader::new(bytes);
        let base = BaseHdr::get(&mut r)?;
        let rma_iov_count = r.get_u32()? as usize;
        let send_id = r.get_u32()?;
        let (mut msg_length, mut credit_request) = (0u64, 0u32);
        if Self::is_long(base.typ) {
            msg_length = r.get_u64()?;
            credit_request = r.get_u32()?;
        }
        let read_iov_count = if base.typ == PktType::LongReadRtw {
            r.get_u32()? as usize
        } else {
            0
        };
        let opt = ReqOptHdrs::get(&mut r, base.flags)?;
        let rma_iov = get_rma_iovs(&mut r, rma_iov_count)?;
        let read_iov = get_rma_iovs(&mut r, read_iov_count)?;
        Ok((
            Self {
                typ: base.typ,
                rma_iov,
                send_id,
                msg_length,
                credit_request,
                read_iov,
                opt,
            },
            r.pos,
        ))
    }
}

/// RTR (emulated read request): `base | rma_iov_count:u32 | recv_id:u32 |
/// msg_length:u64 | window:u32 | opt | rma_iov[]`.
///
/// The requester is the receiver of the ensuing READRSP (short) or DATA
/// (long-CTS) flow; `recv_id` names its receive-side entry and `window`
/// is the requested response window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtrHdr {
    pub typ: PktType,
    pub rma_iov: Vec<RmaIov>,
    pub msg_length: u64,
    pub recv_id: u32,
    pub window: u32,
    pub opt: ReqOptHdrs,
}

impl RtrHdr {
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut w = Writer::new(buf);
        let flags = PktFlags::REQ_RMA | self.opt.flags();
        BaseHdr::new(self.typ, flags).put(&mut w);
        w.put_u32(self.rma_iov.len() as u32);
        w.put_u32(self.recv_id);
        w.put_u64(self.msg_length);
        w.put_u32(self.window);
        self.opt.put(&mut w);
        put_rma_iovs(&mut w, &self.rma_iov);
        w.pos
    }

    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut r = Reader::new(bytes);
        let base = BaseHdr::get(&mut r)?;
        let rma_iov_count = r.get_u32()? as usize;
        let recv_id = r.get_u32()?;
        let msg_length = r.get_u64()?;
        let window = r.get_u32()?;
        let opt = ReqOptHdrs::get(&mut r, base.flags)?;
        let rma_iov = get_rma_iovs(&mut r, rma_iov_count)?;
        Ok((
            Self {
                typ: base.typ,
                rma_iov,
                msg_length,
                recv_id,
                window,
                opt,
            },
            r.pos,
        ))
    }
}

/// Atomic datatype carried in RTA headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AtomicDatatype {
    U32 = 0,
    U64 = 1,
    I32 = 2,
    I64 = 3,
}

impl AtomicDatatype {
    pub fn size(self) -> usize {
        match self {
            AtomicDatatype::U32 | AtomicDatatype::I32 => 4,
            AtomicDatatype::U64 | AtomicDatatype::I64 => 8,
        }
    }
}

impl TryFrom<u32> for AtomicDatatype {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            0 => AtomicDatatype::U32,
            1 => AtomicDatatype::U64,
            2 => AtomicDatatype::I32,
            3 => AtomicDatatype::I64,
            other => {
                return Err(Error::Malformed {
                    what: "atomic datatype",
                    value: other as u64,
                })
            }
        })
    }
}

/// Atomic operation carried in RTA headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AtomicOp {
    Sum = 0,
    Min = 1,
    Max = 2,
    Swap = 3,
    CompareSwap = 4,
}

impl TryFrom<u32> for AtomicOp {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            0 => AtomicOp::Sum,
            1 => AtomicOp::Min,
            2 => AtomicOp::Max,
            3 => AtomicOp::Swap,
            4 => AtomicOp::CompareSwap,
            other => {
                return Err(Error::Malformed {
                    what: "atomic op",
                    value: other as u64,
                })
            }
        })
    }
}

/// RTA (emulated atomic): `base | msg_id:u32 | tx_id:u32 |
/// rma_iov_count:u32 | datatype:u32 | op:u32 | opt | rma_iov[] | operands`.
///
/// `tx_id` is the requester's transmit entry; FETCH/COMPARE responders
/// echo it in the ATOMRSP. COMPARE operands are the compare buffer
/// followed by the swap buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtaHdr {
    pub common: ReqCommon,
    pub tx_id: u32,
    pub rma_iov: Vec<RmaIov>,
    pub datatype: AtomicDatatype,
    pub op: AtomicOp,
    pub opt: ReqOptHdrs,
}

impl RtaHdr {
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut w = Writer::new(buf);
        let flags = self.common.class_flags() | self.opt.flags();
        BaseHdr::new(self.common.typ, flags).put(&mut w);
        w.put_u32(self.common.msg_id);
        w.put_u32(self.tx_id);
        w.put_u32(self.rma_iov.len() as u32);
        w.put_u32(self.datatype as u32);
        w.put_u32(self.op as u32);
        self.opt.put(&mut w);
        put_rma_iovs(&mut w, &self.rma_iov);
        w.pos
    }

    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut r = Reader::new(bytes);
        let base = BaseHdr::get(&mut r)?;
        let msg_id = r.get_u32()?;
        let tx_id = r.get_u32()?;
        let rma_iov_count = r.get_u32()? as usize;
        let datatype = AtomicDatatype::try_from(r.get_u32()?)?;
        let op = AtomicOp::try_from(r.get_u32()?)?;
        let opt = ReqOptHdrs::get(&mut r, base.flags)?;
        let rma_iov = get_rma_iovs(&mut r, rma_iov_count)?;
        Ok((
            Self {
                common: ReqCommon {
                    typ: base.typ,
                    msg_id,
                    tag: None,
                },
                tx_id,
                rma_iov,
                datatype,
                op,
                opt,
            },
            r.pos,
        ))
    }
}

/// CTS: `base | pad:u32 | send_id:u32 | recv_id:u32 | recv_length:u64
/// [| connid:u32]`. `recv_length` must be nonzero: the receiver grants at
/// least one packet per CTS so the sender always makes progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtsHdr {
    pub send_id: u32,
    pub recv_id: u32,
    pub recv_length: u64,
    pub connid: Option<u32>,
}

impl CtsHdr {
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut w = Writer::new(buf);
        BaseHdr::new(PktType::Cts, connid_flag(self.connid)).put(&mut w);
        w.put_u32(0);
        w.put_u32(self.send_id);
        w.put_u32(self.recv_id);
        w.put_u64(self.recv_length);
        put_opt_connid(&mut w, self.connid);
        w.pos
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let base = BaseHdr::get(&mut r)?;
        let _pad = r.get_u32()?;
        let send_id = r.get_u32()?;
        let recv_id = r.get_u32()?;
        let recv_length = r.get_u64()?;
        let connid = get_opt_connid(&mut r, base.flags)?;
        Ok(Self {
            send_id,
            recv_id,
            recv_length,
            connid,
        })
    }
}

/// DATA: `base | recv_id:u32 | data_length:u64 | data_offset:u64
/// [| connid:u32] | payload`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHdr {
    pub recv_id: u32,
    pub data_length: u64,
    pub data_offset: u64,
    pub connid: Option<u32>,
}

impl DataHdr {
    pub fn wire_len(&self) -> usize {
        BASE_HDR_LEN + 4 + 16 + if self.connid.is_some() { 4 } else { 0 }
    }

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut w = Writer::new(buf);
        BaseHdr::new(PktType::Data, connid_flag(self.connid)).put(&mut w);
        w.put_u32(self.recv_id);
        w.put_u64(self.data_length);
        w.put_u64(self.data_offset);
        put_opt_connid(&mut w, self.connid);
        w.pos
    }

    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut r = Reader::new(bytes);
        let base = BaseHdr::get(&mut r)?;
        let recv_id = r.get_u32()?;
        let data_length = r.get_u64()?;
        let data_offset = r.get_u64()?;
        let connid = get_opt_connid(&mut r, base.flags)?;
        Ok((
            Self {
                recv_id,
                data_length,
                data_offset,
                connid,
            },
            r.pos,
        ))
    }
}

/// READRSP: `base | pad:u32 | send_id:u32 | recv_id:u32 | data_length:u64
/// [| connid:u32] | payload`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRspHdr {
    pub send_id: u32,
    pub recv_id: u32,
    pub data_length: u64,
    pub connid: Option<u32>,
}

impl ReadRspHdr {
    pub fn wire_len(&self) -> usize {
        BASE_HDR_LEN + 4 + 8 + 8 + if self.connid.is_some() { 4 } else { 0 }
    }

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut w = Writer::new(buf);
        BaseHdr::new(PktType::ReadRsp, connid_flag(self.connid)).put(&mut w);
        w.put_u32(0);
        w.put_u32(self.send_id);
        w.put_u32(self.recv_id);
        w.put_u64(self.data_length);
        put_opt_connid(&mut w, self.connid);
        w.pos
    }

    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut r = Reader::new(bytes);
        let base = BaseHdr::get(&mut r)?;
        let _pad = r.get_u32()?;
        let send_id = r.get_u32()?;
        let recv_id = r.get_u32()?;
        let data_length = r.get_u64()?;
        let connid = get_opt_connid(&mut r, base.flags)?;
        Ok((
            Self {
                send_id,
                recv_id,
                data_length,
                connid,
            },
            r.pos,
        ))
    }
}

/// EOR: `base | send_id:u32 | recv_id:u32 [| connid:u32]`. Ends a
/// long-read transfer; the sender may release its registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EorHdr {
    pub send_id: u32,
    pub recv_id: u32,
    pub connid: Option<u32>,
}

impl EorHdr {
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut w = Writer::new(buf);
        BaseHdr::new(PktType::Eor, connid_flag(self.connid)).put(&mut w);
        w.put_u32(self.send_id);
        w.put_u32(self.recv_id);
        put_opt_connid(&mut w, self.connid);
        w.pos
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let base = BaseHdr::get(&mut r)?;
        let send_id = r.get_u32()?;
        let recv_id = r.get_u32()?;
        let connid = get_opt_connid(&mut r, base.flags)?;
        Ok(Self {
            send_id,
            recv_id,
            connid,
        })
    }
}

/// RECEIPT: `base | send_id:u32 | msg_id:u32 | pad:u32 [| connid:u32]`.
/// Sent by the receiver of a delivery-complete operation once the payload
/// is in the application buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptHdr {
    pub send_id: u32,
    pub msg_id: u32,
    pub connid: Option<u32>,
}

impl ReceiptHdr {
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut w = Writer::new(buf);
        BaseHdr::new(PktType::Receipt, connid_flag(self.connid)).put(&mut w);
        w.put_u32(self.send_id);
        w.put_u32(self.msg_id);
        w.put_u32(0);
        put_opt_connid(&mut w, self.connid);
        w.pos
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let base = BaseHdr::get(&mut r)?;
        let send_id = r.get_u32()?;
        let msg_id = r.get_u32()?;
        let _pad = r.get_u32()?;
        let connid = get_opt_connid(&mut r, base.flags)?;
        Ok(Self {
            send_id,
            msg_id,
            connid,
        })
    }
}

/// ATOMRSP: `base | pad:u32 | tx_id:u32 | data_length:u64 [| connid:u32]
/// | payload`. Carries the pre-operation value back for FETCH and COMPARE
/// atomics; `tx_id` is the requester's entry echoed from the RTA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomRspHdr {
    pub tx_id: u32,
    pub data_length: u64,
    pub connid: Option<u32>,
}

impl AtomRspHdr {
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut w = Writer::new(buf);
        BaseHdr::new(PktType::AtomRsp, connid_flag(self.connid)).put(&mut w);
        w.put_u32(0);
        w.put_u32(self.tx_id);
        w.put_u64(self.data_length);
        put_opt_connid(&mut w, self.connid);
        w.pos
    }

    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut r = Reader::new(bytes);
        let base = BaseHdr::get(&mut r)?;
        let _pad = r.get_u32()?;
        let tx_id = r.get_u32()?;
        let data_length = r.get_u64()?;
        let connid = get_opt_connid(&mut r, base.flags)?;
        Ok((
            Self {
                tx_id,
                data_length,
                connid,
            },
            r.pos,
        ))
    }
}

/// Extract the connid a packet carries, if any, without fully decoding it.
///
/// REQ packets carry it in the optional header block; control packets have
/// a type-specific field gated by the 0x40 flag.
pub fn pkt_connid(bytes: &[u8]) -> Result<Option<u32>> {
    let base = BaseHdr::decode(bytes)?;
    if !base.flags.contains(PktFlags::OPT_CONNID) {
        return Ok(None);
    }
    if base.typ.is_req() {
        let opt_off = req_opt_offset(bytes, base)?;
        let mut r = Reader::new(&bytes[opt_off..]);
        let opt = ReqOptHdrs::get(&mut r, base.flags)?;
        return Ok(opt.connid);
    }
    Ok(match base.typ {
        PktType::Cts => CtsHdr::decode(bytes)?.connid,
        PktType::Data => DataHdr::decode(bytes)?.0.connid,
        PktType::ReadRsp => ReadRspHdr::decode(bytes)?.0.connid,
        PktType::Eor => EorHdr::decode(bytes)?.connid,
        PktType::AtomRsp => AtomRspHdr::decode(bytes)?.0.connid,
        PktType::Handshake => HandshakeHdr::decode(bytes)?.connid,
        PktType::Receipt => ReceiptHdr::decode(bytes)?.connid,
        _ => None,
    })
}

/// Extract the raw-address optional header of a REQ packet, if present.
/// Used to learn a previously unknown peer's identity.
pub fn pkt_raw_addr(bytes: &[u8]) -> Result<Option<RawAddr>> {
    let base = BaseHdr::decode(bytes)?;
    if !base.typ.is_req() || !base.flags.contains(PktFlags::OPT_RAW_ADDR) {
        return Ok(None);
    }
    let opt_off = req_opt_offset(bytes, base)?;
    let mut r = Reader::new(&bytes[opt_off..]);
    let opt = ReqOptHdrs::get(&mut r, base.flags)?;
    Ok(opt.raw_addr)
}

/// Byte offset of the optional-header block in a REQ packet.
fn req_opt_offset(bytes: &[u8], base: BaseHdr) -> Result<usize> {
    let tag = if base.typ.is_tagged_rtm() { 8 } else { 0 };
    let mandatory = if base.typ.is_rtm() {
        match base.typ {
            t if t.is_medium_rtm() => 4 + 16,
            t if t.is_longcts_rtm() => 4 + 8 + 8,
            t if t.is_longread_rtm() => 4 + 8 + 8,
            _ => 4, // eager
        }
    } else if base.typ.is_rtw() {
        let long = matches!(
            base.typ,
            PktType::LongCtsRtw | PktType::DcLongCtsRtw | PktType::LongReadRtw
        );
        4 + 4
            + if long { 12 } else { 0 }
            + if base.typ == PktType::LongReadRtw { 4 } else { 0 }
    } else if base.typ.is_rtr() {
        4 + 4 + 8 + 4
    } else {
        // RTA
        4 + 4 + 4 + 8
    };
    let off = BASE_HDR_LEN + mandatory + tag;
    if off > bytes.len() {
        return Err(Error::Malformed {
            what: "truncated packet",
            value: bytes.len() as u64,
        });
    }
    Ok(off)
}

/// Extract the msg_id of an ordered (RTM/RTA) REQ packet. The field sits
/// directly after the base header in every ordered type.
pub fn pkt_msg_id(bytes: &[u8]) -> Result<u32> {
    let mut r = Reader::new(bytes);
    let base = BaseHdr::get(&mut r)?;
    debug_assert!(base.typ.is_ordered());
    r.get_u32()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Gid;

    fn opt_full() -> ReqOptHdrs {
        ReqOptHdrs {
            raw_addr: Some(RawAddr::new(Gid([7; 16]), 42, 0x1111_2222)),
            cq_data: Some(0xdead_beef_cafe_f00d),
            connid: Some(0x3333_4444),
        }
    }

    #[test]
    fn test_base_hdr_roundtrip() {
        let mut buf = [0u8; 64];
        let hdr = BaseHdr::new(PktType::Cts, PktFlags::OPT_CONNID);
        let mut w = Writer::new(&mut buf);
        hdr.put(&mut w);
        assert_eq!(w.pos, BASE_HDR_LEN);
        assert_eq!(BaseHdr::decode(&buf).unwrap(), hdr);
    }

    #[test]
    fn test_base_hdr_rejects_bad_version() {
        let buf = [PktType::Cts as u8, 9, 0, 0];
        assert!(BaseHdr::decode(&buf).is_err());
    }

    #[test]
    fn test_eager_rtm_roundtrip() {
        for (typ, tag) in [
            (PktType::EagerMsgRtm, None),
            (PktType::EagerTagRtm, Some(0x0102_0304_0506_0708)),
            (PktType::DcEagerMsgRtm, None),
            (PktType::DcEagerTagRtm, Some(u64::MAX)),
        ] {
            let hdr = EagerRtmHdr {
                common: ReqCommon {
                    typ,
                    msg_id: 77,
                    tag,
                },
                opt: opt_full(),
            };
            let mut buf = [0u8; 128];
            let n = hdr.encode(&mut buf);
            assert_eq!(n, hdr.wire_len());
            let (back, off) = EagerRtmHdr::decode(&buf[..n]).unwrap();
            assert_eq!(back, hdr);
            assert_eq!(off, n);

            // Re-encode must reproduce identical bytes.
            let mut buf2 = [0u8; 128];
            let n2 = back.encode(&mut buf2);
            assert_eq!(&buf[..n], &buf2[..n2]);
        }
    }

    #[test]
    fn test_medium_rtm_roundtrip() {
        let hdr = MediumRtmHdr {
            common: ReqCommon {
                typ: PktType::MediumTagRtm,
                msg_id: u32::MAX,
                tag: Some(9),
            },
            data_len: 0x1_0000,
            seg_offset: 0x8000,
            opt: ReqOptHdrs {
                connid: Some(5),
                ..Default::default()
            },
        };
        let mut buf = [0u8; 128];
        let n = hdr.encode(&mut buf);
        let (back, off) = MediumRtmHdr::decode(&buf[..n]).unwrap();
        assert_eq!(back, hdr);
        assert_eq!(off, n);
    }

    #[test]
    fn test_medium_rtm_segment_lengths_vary_independently() {
        // Two segments of one burst: the header's data_len is the total
        // and identical on both, the segment's own payload length is
        // whatever rides after the header, and only seg_offset moves.
        let total = 1500u64;
        let segs: [(u64, &[u8]); 2] = [(0, &[0xaa; 960]), (960, &[0xbb; 540])];

        for (seg_offset, payload) in segs {
            let hdr = MediumRtmHdr {
                common: ReqCommon {
                    typ: PktType::MediumMsgRtm,
                    msg_id: 7,
                    tag: None,
                },
                data_len: total,
                seg_offset,
                opt: ReqOptHdrs::default(),
            };
            let mut buf = [0u8; 2048];
            let n = hdr.encode(&mut buf);
            buf[n..n + payload.len()].copy_from_slice(payload);
            let pkt = &buf[..n + payload.len()];

            let (back, off) = MediumRtmHdr::decode(pkt).unwrap();
            assert_eq!(back.data_len, total);
            assert_eq!(back.seg_offset, seg_offset);
            // Per-segment length comes from the packet size alone.
            assert_eq!(pkt.len() - off, payload.len());
            assert_eq!(&pkt[off..], payload);
        }
    }

    #[test]
    fn test_longcts_rtm_roundtrip() {
        let hdr = LongCtsRtmHdr {
            common: ReqCommon {
                typ: PktType::LongCtsMsgRtm,
                msg_id: 3,
                tag: None,
            },
            msg_length: 1 << 20,
            send_id: 17,
            credit_request: 16,
            opt: opt_full(),
        };
        let mut buf = [0u8; 128];
        let n = hdr.encode(&mut buf);
        let (back, off) = LongCtsRtmHdr::decode(&buf[..n]).unwrap();
        assert_eq!(back, hdr);
        assert_eq!(off, n);
    }

    #[test]
    fn test_longread_rtm_roundtrip() {
        let hdr = LongReadRtmHdr {
            common: ReqCommon {
                typ: PktType::LongReadTagRtm,
                msg_id: 8,
                tag: Some(0xfeed),
            },
            msg_length: 1 << 24,
            send_id: 4,
            read_iov: vec![
                RmaIov {
                    addr: 0,
                    len: 1 << 23,
                    key: 11,
                },
                RmaIov {
                    addr: 1 << 23,
                    len: 1 << 23,
                    key: 12,
                },
            ],
            opt: ReqOptHdrs {
                connid: Some(1),
                ..Default::default()
            },
        };
        let mut buf = [0u8; 256];
        let n = hdr.encode(&mut buf);
        let (back, off) = LongReadRtmHdr::decode(&buf[..n]).unwrap();
        assert_eq!(back, hdr);
        assert_eq!(off, n);
    }

    #[test]
    fn test_rtw_roundtrip() {
        for typ in [
            PktType::EagerRtw,
            PktType::DcEagerRtw,
            PktType::LongCtsRtw,
            PktType::DcLongCtsRtw,
            PktType::LongReadRtw,
        ] {
            let hdr = RtwHdr {
                typ,
                rma_iov: vec![RmaIov {
                    addr: 0x1000,
                    len: 4096,
                    key: 33,
                }],
                send_id: 2,
                msg_length: 4096,
                credit_request: 8,
                read_iov: if typ == PktType::LongReadRtw {
                    vec![RmaIov {
                        addr: 0,
                        len: 4096,
                        key: 44,
                    }]
                } else {
                    Vec::new()
                },
                opt: ReqOptHdrs {
                    connid: Some(0xaa),
                    ..Default::default()
                },
            };
            let mut buf = [0u8; 256];
            let n = hdr.encode(&mut buf);
            assert_eq!(n, hdr.wire_len());
            let (mut back, off) = RtwHdr::decode(&buf[..n]).unwrap();
            assert_eq!(off, n);
            // Short variants do not carry the long fields on the wire.
            if !RtwHdr::is_long(typ) {
                back.msg_length = hdr.msg_length;
                back.credit_request = hdr.credit_request;
            }
            assert_eq!(back, hdr);
        }
    }

    #[test]
    fn test_rtr_roundtrip() {
        let hdr = RtrHdr {
            typ: PktType::LongCtsRtr,
            rma_iov: vec![RmaIov {
                addr: 64,
                len: 1 << 16,
                key: 9,
            }],
            msg_length: 1 << 16,
            recv_id: 13,
            window: 4,
            opt: ReqOptHdrs::default(),
        };
        let mut buf = [0u8; 256];
        let n = hdr.encode(&mut buf);
        let (back, off) = RtrHdr::decode(&buf[..n]).unwrap();
        assert_eq!(back, hdr);
        assert_eq!(off, n);
    }

    #[test]
    fn test_rta_roundtrip() {
        let hdr = RtaHdr {
            common: ReqCommon {
                typ: PktType::CompareRta,
                msg_id: 100,
                tag: None,
            },
            tx_id: 55,
            rma_iov: vec![RmaIov {
                addr: 8,
                len: 8,
                key: 2,
            }],
            datatype: AtomicDatatype::U64,
            op: AtomicOp::CompareSwap,
            opt: ReqOptHdrs {
                connid: Some(3),
                ..Default::default()
            },
        };
        let mut buf = [0u8; 256];
        let n = hdr.encode(&mut buf);
        let (back, off) = RtaHdr::decode(&buf[..n]).unwrap();
        assert_eq!(back, hdr);
        assert_eq!(off, n);
    }

    #[test]
    fn test_ctrl_roundtrips() {
        let mut buf = [0u8; 128];

        let cts = CtsHdr {
            send_id: 1,
            recv_id: 2,
            recv_length: 65536,
            connid: Some(7),
        };
        let n = cts.encode(&mut buf);
        assert_eq!(CtsHdr::decode(&buf[..n]).unwrap(), cts);

        let data = DataHdr {
            recv_id: 2,
            data_length: 8000,
            data_offset: 16000,
            connid: None,
        };
        let n = data.encode(&mut buf);
        assert_eq!(n, data.wire_len());
        assert_eq!(DataHdr::decode(&buf[..n]).unwrap().0, data);

        let rsp = ReadRspHdr {
            send_id: 3,
            recv_id: 4,
            data_length: 100,
            connid: Some(9),
        };
        let n = rsp.encode(&mut buf);
        assert_eq!(ReadRspHdr::decode(&buf[..n]).unwrap().0, rsp);

        let eor = EorHdr {
            send_id: 5,
            recv_id: 6,
            connid: Some(1),
        };
        let n = eor.encode(&mut buf);
        assert_eq!(EorHdr::decode(&buf[..n]).unwrap(), eor);

        let receipt = ReceiptHdr {
            send_id: 7,
            msg_id: 8,
            connid: None,
        };
        let n = receipt.encode(&mut buf);
        assert_eq!(ReceiptHdr::decode(&buf[..n]).unwrap(), receipt);

        let atomrsp = AtomRspHdr {
            tx_id: 12,
            data_length: 8,
            connid: Some(2),
        };
        let n = atomrsp.encode(&mut buf);
        assert_eq!(AtomRspHdr::decode(&buf[..n]).unwrap().0, atomrsp);
    }

    #[test]
    fn test_handshake_roundtrip_and_skew() {
        let mut info = ExtraInfo::default();
        info.set(extra_feature::RDMA_READ);
        info.set(extra_feature::DELIVERY_COMPLETE);
        info.set(extra_feature::CONNID_HEADER);
        let hdr = HandshakeHdr {
            extra_info: info.clone(),
            connid: Some(0xabcd),
        };
        let mut buf = [0u8; 128];
        let n = hdr.encode(&mut buf);
        // nex_p3 field is word count + 3.
        let nex_p3 = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        assert_eq!(nex_p3, info.0.len() as u32 + 3);
        let back = HandshakeHdr::decode(&buf[..n]).unwrap();
        assert_eq!(back, hdr);
        assert!(back.extra_info.has(extra_feature::RDMA_READ));
        assert!(!back.extra_info.has(extra_feature::CONSTANT_HEADER_LENGTH));
    }

    #[test]
    fn test_pkt_connid_extraction() {
        let mut buf = [0u8; 128];
        let hdr = EagerRtmHdr {
            common: ReqCommon {
                typ: PktType::EagerMsgRtm,
                msg_id: 0,
                tag: None,
            },
            opt: ReqOptHdrs {
                raw_addr: Some(RawAddr::new(Gid([1; 16]), 3, 0xc1)),
                cq_data: None,
                connid: Some(0xc1),
            },
        };
        let n = hdr.encode(&mut buf);
        assert_eq!(pkt_connid(&buf[..n]).unwrap(), Some(0xc1));

        let cts = CtsHdr {
            send_id: 0,
            recv_id: 0,
            recv_length: 1,
            connid: Some(0xc2),
        };
        let n = cts.encode(&mut buf);
        assert_eq!(pkt_connid(&buf[..n]).unwrap(), Some(0xc2));

        let cts_plain = CtsHdr {
            connid: None,
            ..cts
        };
        let n = cts_plain.encode(&mut buf);
        assert_eq!(pkt_connid(&buf[..n]).unwrap(), None);
    }

    #[test]
    fn test_msg_id_extraction() {
        let mut buf = [0u8; 128];
        let hdr = MediumRtmHdr {
            common: ReqCommon {
                typ: PktType::MediumMsgRtm,
                msg_id: 0xfeed_f00d,
                tag: None,
            },
            data_len: 10,
            seg_offset: 0,
            opt: ReqOptHdrs::default(),
        };
        let n = hdr.encode(&mut buf);
        assert_eq!(pkt_msg_id(&buf[..n]).unwrap(), 0xfeed_f00d);
    }

    #[test]
    fn test_truncated_packet() {
        let mut buf = [0u8; 128];
        let hdr = CtsHdr {
            send_id: 1,
            recv_id: 2,
            recv_length: 3,
            connid: Some(4),
        };
        let n = hdr.encode(&mut buf);
        assert!(CtsHdr::decode(&buf[..n - 1]).is_err());
    }
}
