//! Streaming packet receive
//!
//! Frames one complete MQTT packet off a byte-stream connection. The
//! transport may deliver arbitrarily small segments; the loop
//! accumulates across partial reads until the packet is whole.

use std::time::Duration;

use crate::protocol::{Error, Result, MAX_FIXED_HEADER};
use crate::transport::{NetHandle, NetServices};

use super::{read_remaining_length, Packet};

/// Receive exactly `want` bytes into `buf`, accumulating partial reads.
fn recv_fill(
    net: &dyn NetServices,
    conn: NetHandle,
    buf: &mut [u8],
    wait: Option<Duration>,
) -> Result<()> {
    let mut have = 0;
    while have < buf.len() {
        let n = net.recv(conn, &mut buf[have..], wait)?;
        if n == 0 {
            return Err(Error::Network);
        }
        have += n;
    }
    Ok(())
}

/// Read one complete MQTT packet from `conn` into `pkt`.
///
/// Progression: single bytes are read until the first fixed-header byte
/// and at least one length byte are present, then further length bytes
/// while the continuation bit stays set (bounded by the maximum header
/// length, else the packet is a protocol violation). The decoded
/// remaining length is checked against the packet's buffer budget, then
/// exactly that many bytes are accumulated.
///
/// Returns the total number of bytes framed.
pub fn recv_packet(
    net: &dyn NetServices,
    conn: NetHandle,
    pkt: &mut Packet,
    wait: Option<Duration>,
) -> Result<usize> {
    pkt.reset(0);

    let (fh_byte1, have, remlen) = {
        let buf = pkt.raw_mut();
        let mut have = 0usize;

        // Fixed-header byte 1 plus length bytes, one at a time.
        loop {
            if have >= MAX_FIXED_HEADER {
                return Err(Error::Content("fixed header exceeds maximum length"));
            }

            recv_fill(net, conn, &mut buf[have..have + 1], wait)?;
            have += 1;

            // Need the type byte and at least one length byte before the
            // continuation bit can be inspected.
            if have >= 2 && (buf[have - 1] & 0x80) == 0 {
                break;
            }
        }

        let (remlen, _) = read_remaining_length(&buf[1..have])?;
        let remlen = remlen as usize;

        if have + remlen > buf.len() {
            return Err(Error::PacketLength);
        }

        recv_fill(net, conn, &mut buf[have..have + remlen], wait)?;

        (buf[0], have, remlen)
    };

    pkt.fh_byte1 = fh_byte1;
    pkt.fh_len = have;
    pkt.vh_len = 0;
    pkt.pl_len = remlen;

    Ok(have + remlen)
}
