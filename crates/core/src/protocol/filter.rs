//! Heuristic classification of datagrams an exit socket is asked to send

use super::cell::COMMUNITY_PREFIX;

/// Protocol an outbound datagram appears to speak
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressClass {
    Utp,
    UdpTracker,
    Dht,
    Overlay,
}

/// Nesting limit for the bencode scanner
const MAX_BENCODE_DEPTH: usize = 16;

/// uTP header: version 1 in the low nibble, type 0..=4 in the high nibble,
/// extension 0..=2 in the second byte
pub fn looks_like_utp(packet: &[u8]) -> bool {
    packet.len() >= 20 && (packet[0] >> 4) <= 4 && (packet[0] & 0x0f) == 1 && packet[1] <= 2
}

/// UDP tracker action (connect, announce, scrape, error) at offset 0 for
/// responses or offset 8 for requests
pub fn looks_like_udp_tracker(packet: &[u8]) -> bool {
    let action_at = |offset: usize| {
        packet
            .get(offset..offset + 4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]) <= 3)
            .unwrap_or(false)
    };
    (packet.len() >= 8 && action_at(0)) || (packet.len() >= 12 && action_at(8))
}

/// A complete bencoded dictionary whose `y` key is `q`, `r` or `e`
pub fn looks_like_dht(packet: &[u8]) -> bool {
    matches!(dht_message_kind(packet), Some(b"q") | Some(b"r") | Some(b"e"))
}

/// A packet of this community, long enough to carry a message header
pub fn looks_like_overlay(packet: &[u8]) -> bool {
    packet.len() >= COMMUNITY_PREFIX.len() + 23 && packet.starts_with(&COMMUNITY_PREFIX)
}

pub fn classify(packet: &[u8]) -> Option<EgressClass> {
    if looks_like_overlay(packet) {
        Some(EgressClass::Overlay)
    } else if looks_like_utp(packet) {
        Some(EgressClass::Utp)
    } else if looks_like_udp_tracker(packet) {
        Some(EgressClass::UdpTracker)
    } else if looks_like_dht(packet) {
        Some(EgressClass::Dht)
    } else {
        None
    }
}

/// Whether an exit socket may forward this datagram
pub fn is_allowed(packet: &[u8]) -> bool {
    classify(packet).is_some()
}

fn dht_message_kind(packet: &[u8]) -> Option<&[u8]> {
    if packet.first() != Some(&b'd') {
        return None;
    }

    let mut pos = 1;
    let mut kind = None;
    while *packet.get(pos)? != b'e' {
        let (key, after_key) = parse_string(packet, pos)?;
        let after_value = skip_value(packet, after_key, 1)?;
        if key == b"y" {
            kind = parse_string(packet, after_key).map(|(value, _)| value);
        }
        pos = after_value;
    }

    if pos + 1 == packet.len() {
        kind
    } else {
        None
    }
}

/// `<len>:<bytes>`, returning the bytes and the position after them
fn parse_string(data: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let colon = pos + data.get(pos..)?.iter().position(|&b| b == b':')?;
    let digits = data.get(pos..colon)?;
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let len: usize = std::str::from_utf8(digits).ok()?.parse().ok()?;
    let end = colon.checked_add(1)?.checked_add(len)?;
    Some((data.get(colon + 1..end)?, end))
}

fn skip_value(data: &[u8], pos: usize, depth: usize) -> Option<usize> {
    if depth > MAX_BENCODE_DEPTH {
        return None;
    }
    match *data.get(pos)? {
        b'i' => {
            let end = pos + data.get(pos..)?.iter().position(|&b| b == b'e')?;
            let digits = data.get(pos + 1..end)?;
            let digits = digits.strip_prefix(b"-").unwrap_or(digits);
            if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
                return None;
            }
            Some(end + 1)
        }
        b'l' => {
            let mut cursor = pos + 1;
            while *data.get(cursor)? != b'e' {
                cursor = skip_value(data, cursor, depth + 1)?;
            }
            Some(cursor + 1)
        }
        b'd' => {
            let mut cursor = pos + 1;
            while *data.get(cursor)? != b'e' {
                let (_, after_key) = parse_string(data, cursor)?;
                cursor = skip_value(data, after_key, depth + 1)?;
            }
            Some(cursor + 1)
        }
        b'0'..=b'9' => parse_string(data, pos).map(|(_, end)| end),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn utp_syn() -> Vec<u8> {
        let mut packet = vec![0u8; 20];
        packet[0] = 0x41; // ST_SYN, version 1
        packet[1] = 0;
        packet
    }

    fn tracker_connect() -> Vec<u8> {
        let mut packet = 0x41727101980u64.to_be_bytes().to_vec();
        packet.extend_from_slice(&0u32.to_be_bytes());
        packet.extend_from_slice(&0x1234u32.to_be_bytes());
        packet
    }

    #[test]
    fn test_accepts_known_protocols() {
        assert_eq!(classify(&utp_syn()), Some(EgressClass::Utp));
        assert_eq!(classify(&tracker_connect()), Some(EgressClass::UdpTracker));

        let ping = b"d1:ad2:id20:abcdefghij0123456789e1:q4:ping1:t2:aa1:y1:qe";
        assert!(looks_like_dht(ping));
        let reply = b"d1:rd2:id20:abcdefghij0123456789e1:t2:aa1:y1:re";
        assert!(looks_like_dht(reply));

        let mut overlay = COMMUNITY_PREFIX.to_vec();
        overlay.extend_from_slice(&[0u8; 23]);
        assert_eq!(classify(&overlay), Some(EgressClass::Overlay));
    }

    #[test]
    fn test_rejects_near_misses() {
        let mut utp = utp_syn();
        utp[0] = 0x42;
        assert!(!looks_like_utp(&utp));
        assert!(!looks_like_utp(&utp_syn()[..19]));

        assert!(!looks_like_dht(b"d1:y1:xe"));
        assert!(!looks_like_dht(b"d1:y1:qe trailing"));
        assert!(!looks_like_dht(b"d1:y1:q"));
        assert!(looks_like_dht(b"d1:y1:qe"));

        let mut short_overlay = COMMUNITY_PREFIX.to_vec();
        short_overlay.extend_from_slice(&[0u8; 22]);
        assert!(!looks_like_overlay(&short_overlay));
    }

    #[test]
    fn test_random_bytes_are_blocked() {
        let mut rng = rand::thread_rng();
        let mut allowed = 0;
        for _ in 0..10_000 {
            let mut packet = vec![0u8; 64];
            rng.fill_bytes(&mut packet);
            if is_allowed(&packet) {
                allowed += 1;
            }
        }
        // a uTP-looking header turns up about 4 times in 10k
        assert!(allowed < 50, "{} random packets passed the filter", allowed);
    }
}
