//! Channel-backed link endpoint
//!
//! The smoltcp `phy::Device` the bridge hands to its interface. Packets
//! arrive and leave through in-memory queues instead of a kernel device:
//! [`inject`](ChannelEndpoint::inject) feeds received packets in,
//! [`pop_outbound`](ChannelEndpoint::pop_outbound) takes transmitted
//! packets out. Both queues are bounded; overflow drops the oldest packet.

use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant as SmoltcpInstant;
use std::collections::VecDeque;
use tracing::warn;

pub(crate) struct ChannelEndpoint {
    rx_queue: VecDeque<Vec<u8>>,
    tx_queue: VecDeque<Vec<u8>>,
    mtu: usize,
    capacity: usize,
}

impl ChannelEndpoint {
    pub(crate) fn new(mtu: usize, capacity: usize) -> Self {
        Self {
            rx_queue: VecDeque::new(),
            tx_queue: VecDeque::new(),
            mtu,
            capacity,
        }
    }

    /// Queue a received packet for the interface to process.
    pub(crate) fn inject(&mut self, packet: Vec<u8>) {
        if self.rx_queue.len() >= self.capacity {
            warn!("Inbound queue full, dropping oldest packet");
            self.rx_queue.pop_front();
        }
        self.rx_queue.push_back(packet);
    }

    /// Take the next packet the interface transmitted, if any.
    pub(crate) fn pop_outbound(&mut self) -> Option<Vec<u8>> {
        self.tx_queue.pop_front()
    }

    #[cfg(test)]
    pub(crate) fn push_outbound(&mut self, packet: Vec<u8>) {
        self.tx_queue.push_back(packet);
    }

    #[cfg(test)]
    pub(crate) fn pending_inbound(&self) -> usize {
        self.rx_queue.len()
    }
}

pub(crate) struct ChannelRxToken {
    data: Vec<u8>,
}

impl RxToken for ChannelRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.data)
    }
}

pub(crate) struct ChannelTxToken<'a> {
    tx_queue: &'a mut VecDeque<Vec<u8>>,
    capacity: usize,
}

impl<'a> TxToken for ChannelTxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = vec![0u8; len];
        let result = f(&mut buffer);
        if self.tx_queue.len() >= self.capacity {
            warn!("Outbound queue full, dropping oldest packet");
            self.tx_queue.pop_front();
        }
        self.tx_queue.push_back(buffer);
        result
    }
}

impl Device for ChannelEndpoint {
    type RxToken<'a> = ChannelRxToken;
    type TxToken<'a> = ChannelTxToken<'a>;

    fn receive(
        &mut self,
        _timestamp: SmoltcpInstant,
    ) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let data = self.rx_queue.pop_front()?;
        Some((
            ChannelRxToken { data },
            ChannelTxToken {
                tx_queue: &mut self.tx_queue,
                capacity: self.capacity,
            },
        ))
    }

    fn transmit(&mut self, _timestamp: SmoltcpInstant) -> Option<Self::TxToken<'_>> {
        Some(ChannelTxToken {
            tx_queue: &mut self.tx_queue,
            capacity: self.capacity,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.max_transmission_unit = self.mtu;
        caps.medium = Medium::Ip;
        caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inject_then_pop_preserves_order() {
        let mut endpoint = ChannelEndpoint::new(1420, 4);
        endpoint.push_outbound(vec![1]);
        endpoint.push_outbound(vec![2]);
        assert_eq!(endpoint.pop_outbound(), Some(vec![1]));
        assert_eq!(endpoint.pop_outbound(), Some(vec![2]));
        assert_eq!(endpoint.pop_outbound(), None);
    }

    #[test]
    fn test_inbound_overflow_drops_oldest() {
        let mut endpoint = ChannelEndpoint::new(1420, 2);
        endpoint.inject(vec![1]);
        endpoint.inject(vec![2]);
        endpoint.inject(vec![3]);
        assert_eq!(endpoint.pending_inbound(), 2);
        assert_eq!(endpoint.rx_queue.pop_front(), Some(vec![2]));
        assert_eq!(endpoint.rx_queue.pop_front(), Some(vec![3]));
    }

    #[test]
    fn test_transmit_consume_queues_packet() {
        let mut endpoint = ChannelEndpoint::new(1420, 4);
        let token = endpoint.transmit(SmoltcpInstant::from_micros(0)).unwrap();
        token.consume(3, |buf| buf.copy_from_slice(&[9, 9, 9]));
        assert_eq!(endpoint.pop_outbound(), Some(vec![9, 9, 9]));
    }

    #[test]
    fn test_capabilities_report_ip_medium_and_mtu() {
        let endpoint = ChannelEndpoint::new(1280, 4);
        let caps = endpoint.capabilities();
        assert_eq!(caps.max_transmission_unit, 1280);
        assert_eq!(caps.medium, Medium::Ip);
    }
}
