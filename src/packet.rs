use std::collections::VecDeque;
use std::fmt::Debug;

/// Highest transmit priority a packet may carry.
pub const MAX_PRIORITY: u8 = 15;

/// Number of priority levels served by the default discipline.
pub const NUM_PRIORITIES: usize = MAX_PRIORITY as usize + 1;

/// Priority assigned to packets that were never classified.
pub const DEFAULT_PRIORITY: u8 = 3;

pub trait Packet: Debug + 'static + Send {
    fn from_raw_buffer(buf: &[u8]) -> Self;

    // Raw buffer length
    fn length(&self) -> usize;
    fn as_slice(&self) -> &[u8];

    /// Transmit priority in `0..=MAX_PRIORITY`, assigned by classification
    /// before the packet reaches a transmit queue.
    fn priority(&self) -> u8;
    fn set_priority(&mut self, priority: u8);

    /// Flow hint used to spread packets over multi-queue hardware.
    fn flow_id(&self) -> Option<u32> {
        None
    }
    fn set_flow_id(&mut self, _flow_id: u32) {}

    fn is_multicast(&self) -> bool {
        false
    }

    /// Interface index and routing domain stamped on the receive path.
    fn input_interface(&self) -> Option<(u32, u32)> {
        None
    }
    fn set_input_interface(&mut self, _if_index: u32, _rdomain: u32) {}
}

const FNV1_64_INIT: u64 = 0xcbf29ce484222325;
const FNV_64_PRIME: u64 = 0x100000001b3;

fn fnv<'a>(bytes: impl Iterator<Item = &'a u8>) -> u64 {
    let mut hash = FNV1_64_INIT;
    for b in bytes {
        hash ^= *b as u64;
        hash = u64::wrapping_mul(hash, FNV_64_PRIME);
    }
    hash
}

#[derive(Clone, Debug)]
pub struct StdPacket {
    buf: Vec<u8>,
    priority: u8,
    flow_id: Option<u32>,
    input: Option<(u32, u32)>,
}

impl StdPacket {
    /// Derive a flow hint by hashing the IPv4 address/port 4-tuple. Frames
    /// that do not parse keep whatever hint they already carried.
    pub fn classify_flow(&mut self) {
        let Ok(ether_hdr) = etherparse::Ethernet2HeaderSlice::from_slice(self.buf.as_slice())
        else {
            return;
        };
        if ether_hdr.ether_type() != etherparse::EtherType::IPV4 {
            return;
        }
        let Ok(ip_hdr) = etherparse::Ipv4HeaderSlice::from_slice(
            self.buf
                .as_slice()
                .get(ether_hdr.slice().len()..)
                .unwrap_or(&[]),
        ) else {
            return;
        };
        let transport = self
            .buf
            .as_slice()
            .get(ether_hdr.slice().len() + ip_hdr.slice().len()..)
            .unwrap_or(&[]);
        let ports = match ip_hdr.protocol() {
            etherparse::IpNumber::UDP => etherparse::UdpHeaderSlice::from_slice(transport)
                .ok()
                .map(|udp| [udp.source_port(), udp.destination_port()]),
            etherparse::IpNumber::TCP => etherparse::TcpHeaderSlice::from_slice(transport)
                .ok()
                .map(|tcp| [tcp.source_port(), tcp.destination_port()]),
            _ => None,
        };
        let Some(ports) = ports else { return };
        let src = ip_hdr.source_addr().octets();
        let dst = ip_hdr.destination_addr().octets();
        let port_bytes: Vec<u8> = ports.iter().flat_map(|p| p.to_be_bytes()).collect();
        let hash = fnv(src.iter().chain(dst.iter()).chain(port_bytes.iter()));
        self.flow_id = Some(hash as u32);
    }
}

impl Packet for StdPacket {
    fn from_raw_buffer(buf: &[u8]) -> Self {
        Self {
            buf: buf.to_vec(),
            priority: DEFAULT_PRIORITY,
            flow_id: None,
            input: None,
        }
    }

    fn length(&self) -> usize {
        self.buf.len()
    }

    fn as_slice(&self) -> &[u8] {
        self.buf.as_slice()
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    fn set_priority(&mut self, priority: u8) {
        self.priority = priority;
    }

    fn flow_id(&self) -> Option<u32> {
        self.flow_id
    }

    fn set_flow_id(&mut self, flow_id: u32) {
        self.flow_id = Some(flow_id);
    }

    fn is_multicast(&self) -> bool {
        // Group bit of the destination MAC.
        etherparse::Ethernet2Header::from_slice(self.buf.as_slice())
            .map(|(hdr, _)| hdr.destination[0] & 0x01 != 0)
            .unwrap_or(false)
    }

    fn input_interface(&self) -> Option<(u32, u32)> {
        self.input
    }

    fn set_input_interface(&mut self, if_index: u32, rdomain: u32) {
        self.input = Some((if_index, rdomain));
    }
}

/// FIFO batch of packets with a running byte count. O(1) append and
/// pop-front; the unit everything hands around when more than one packet
/// moves at a time.
#[derive(Debug)]
pub struct PacketList<P> {
    list: VecDeque<P>,
    bytes: usize,
}

impl<P> Default for PacketList<P> {
    fn default() -> Self {
        Self {
            list: VecDeque::new(),
            bytes: 0,
        }
    }
}

impl<P: Packet> PacketList<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn enqueue(&mut self, packet: P) {
        self.bytes += packet.length();
        self.list.push_back(packet);
    }

    pub fn dequeue(&mut self) -> Option<P> {
        let packet = self.list.pop_front()?;
        self.bytes -= packet.length();
        Some(packet)
    }

    pub fn front(&self) -> Option<&P> {
        self.list.front()
    }

    /// Move every packet of `other` to the tail of `self`, leaving `other`
    /// empty.
    pub fn concat(&mut self, other: &mut PacketList<P>) {
        self.bytes += other.bytes;
        other.bytes = 0;
        self.list.append(&mut other.list);
    }

    /// Swap the contents out, leaving `self` empty.
    pub fn take(&mut self) -> PacketList<P> {
        std::mem::take(self)
    }

    pub fn iter(&self) -> impl Iterator<Item = &P> {
        self.list.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut P> {
        self.list.iter_mut()
    }
}

impl<P> IntoIterator for PacketList<P> {
    type Item = P;
    type IntoIter = std::collections::vec_deque::IntoIter<P>;

    fn into_iter(self) -> Self::IntoIter {
        self.list.into_iter()
    }
}

impl<P: Packet> FromIterator<P> for PacketList<P> {
    fn from_iter<T: IntoIterator<Item = P>>(iter: T) -> Self {
        let mut list = PacketList::new();
        for packet in iter {
            list.enqueue(packet);
        }
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udp_frame(payload_len: usize) -> Vec<u8> {
        let builder = etherparse::PacketBuilder::ethernet2(
            [0x02, 0, 0, 0, 0, 1],
            [0x02, 0, 0, 0, 0, 2],
        )
        .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
        .udp(12345, 443);
        let payload = vec![0u8; payload_len];
        let mut frame = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut frame, &payload).unwrap();
        frame
    }

    #[test_log::test]
    fn test_list_accounting() {
        let mut list = PacketList::new();
        assert!(list.is_empty());
        list.enqueue(StdPacket::from_raw_buffer(&[0; 100]));
        list.enqueue(StdPacket::from_raw_buffer(&[0; 50]));
        assert_eq!(list.len(), 2);
        assert_eq!(list.bytes(), 150);

        let first = list.dequeue().unwrap();
        assert_eq!(first.length(), 100);
        assert_eq!(list.bytes(), 50);

        let mut other = PacketList::new();
        other.enqueue(StdPacket::from_raw_buffer(&[0; 25]));
        list.concat(&mut other);
        assert!(other.is_empty());
        assert_eq!(other.bytes(), 0);
        assert_eq!(list.len(), 2);
        assert_eq!(list.bytes(), 75);

        let taken = list.take();
        assert!(list.is_empty());
        assert_eq!(taken.len(), 2);
    }

    #[test_log::test]
    fn test_flow_classification() {
        let mut packet = StdPacket::from_raw_buffer(&udp_frame(32));
        assert_eq!(packet.flow_id(), None);
        packet.classify_flow();
        let flow = packet.flow_id().expect("udp frame should classify");

        // Same tuple, same flow.
        let mut again = StdPacket::from_raw_buffer(&udp_frame(900));
        again.classify_flow();
        assert_eq!(again.flow_id(), Some(flow));

        // Garbage stays unclassified.
        let mut junk = StdPacket::from_raw_buffer(&[0xff; 10]);
        junk.classify_flow();
        assert_eq!(junk.flow_id(), None);
    }

    #[test_log::test]
    fn test_multicast_bit() {
        let mut frame = udp_frame(10);
        assert!(!StdPacket::from_raw_buffer(&frame).is_multicast());
        frame[0] = 0x01;
        assert!(StdPacket::from_raw_buffer(&frame).is_multicast());
    }

    #[test_log::test]
    fn test_default_priority() {
        let mut packet = StdPacket::from_raw_buffer(&[0; 10]);
        assert_eq!(packet.priority(), DEFAULT_PRIORITY);
        packet.set_priority(MAX_PRIORITY);
        assert_eq!(packet.priority(), MAX_PRIORITY);
    }
}
