//! Segment encoding and decoding.
//!
//! Outgoing packets are assembled as IPv4 + TCP with `etherparse` and handed
//! to an [`IpSink`]; incoming packets are sliced into a [`ControlBlock`]
//! before they reach the state machine.

use etherparse::{Ipv4Header, Ipv4HeaderSlice, TcpHeader, TcpHeaderSlice};

use super::{Dual, Quad, ACK, FIN, PSH, RST, SYN};

const TTL: u8 = 32;
const IPPROTO_TCP: u8 = 6;

/// Fire-and-forget emission into the IP layer below.
pub(crate) trait IpSink: Send {
    fn send_ip(&mut self, packet: &[u8]);
}

/// The parsed summary of one incoming segment.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ControlBlock<'a> {
    /// Endpoints as seen on the wire: `src` is the remote sender.
    pub quad: Quad,
    pub seq: u32,
    /// One past the last sequence number the segment occupies, counting
    /// SYN and FIN.
    pub seq_end: u32,
    pub ack: u32,
    pub flags: u8,
    /// Receive window advertised by the sender.
    pub rwnd: u32,
    pub payload: &'a [u8],
}

impl ControlBlock<'_> {
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

pub(crate) fn parse_segment(packet: &[u8]) -> Option<ControlBlock<'_>> {
    let ip4h = Ipv4HeaderSlice::from_slice(packet).ok()?;
    if ip4h.protocol() != IPPROTO_TCP {
        return None;
    }

    let ip_hdr_len = (ip4h.ihl() as usize) * 4;
    let tcph = TcpHeaderSlice::from_slice(&packet[ip_hdr_len..]).ok()?;

    // The read may hand us trailing bytes past the datagram; trust the IP
    // length field for where the payload ends.
    let total_len = (ip4h.total_len() as usize).min(packet.len());
    let payload_at = ip_hdr_len + (tcph.data_offset() as usize) * 4;
    if payload_at > total_len {
        return None;
    }
    let payload = &packet[payload_at..total_len];

    let mut flags = 0u8;
    if tcph.fin() {
        flags |= FIN;
    }
    if tcph.syn() {
        flags |= SYN;
    }
    if tcph.rst() {
        flags |= RST;
    }
    if tcph.psh() {
        flags |= PSH;
    }
    if tcph.ack() {
        flags |= ACK;
    }

    let seq = tcph.sequence_number();
    let seq_end = seq
        .wrapping_add(payload.len() as u32)
        .wrapping_add(u32::from(tcph.syn()))
        .wrapping_add(u32::from(tcph.fin()));

    Some(ControlBlock {
        quad: Quad {
            src: Dual {
                ipv4: ip4h.source_addr(),
                port: tcph.source_port(),
            },
            dst: Dual {
                ipv4: ip4h.destination_addr(),
                port: tcph.destination_port(),
            },
        },
        seq,
        seq_end,
        ack: tcph.acknowledgment_number(),
        flags,
        rwnd: tcph.window_size() as u32,
        payload,
    })
}

/// Assemble one segment from `quad.src` to `quad.dst`.
pub(crate) fn build_segment(
    quad: &Quad,
    seq: u32,
    ack: u32,
    wnd: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let wnd = wnd.min(u16::MAX as u32) as u16;
    let mut tcph = TcpHeader::new(quad.src.port, quad.dst.port, seq, wnd);
    tcph.fin = flags & FIN != 0;
    tcph.syn = flags & SYN != 0;
    tcph.rst = flags & RST != 0;
    tcph.psh = flags & PSH != 0;
    tcph.ack = flags & ACK != 0;
    tcph.acknowledgment_number = ack;

    let ip4h = Ipv4Header::new(
        tcph.header_len() + payload.len() as u16,
        TTL,
        IPPROTO_TCP,
        quad.src.ipv4.octets(),
        quad.dst.ipv4.octets(),
    );
    tcph.checksum = tcph.calc_checksum_ipv4(&ip4h, payload).unwrap();

    let mut buf = Vec::with_capacity(20 + tcph.header_len() as usize + payload.len());
    ip4h.write(&mut buf).unwrap();
    tcph.write(&mut buf).unwrap();
    buf.extend_from_slice(payload);
    buf
}

/// Reset reply for a segment that matches no socket: take the sequence
/// number from the offending ACK when there is one, acknowledge everything
/// the segment occupied.
pub(crate) fn send_reset(cb: &ControlBlock, sink: &mut dyn IpSink) {
    let seq = if cb.has(ACK) { cb.ack } else { 0 };
    let pkt = build_segment(&cb.quad.flip(), seq, cb.seq_end, 0, RST | ACK, &[]);
    sink.send_ip(&pkt);
}
