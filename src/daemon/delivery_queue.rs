use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::protocol::packet::{Packet, PacketError};


#[derive(Debug, Clone)]
struct OutboundMessage {
    packet: Packet,
    num_sent: u32,
}

#[derive(Debug)]
struct InFlight {
    message: OutboundMessage,
    deadline: Instant,
}

/// Stop-and-wait delivery of chat messages to the peer daemon.
///
/// Messages are sent in FIFO order, and there is at most one message on the wire without an
///  ACK. If the ACK does not arrive within the configured timeout, the very same packet goes
///  back to the head of the queue and is sent again. There is no upper bound on the number of
///  retries.
///
/// This is pure bookkeeping: the caller sends the packets returned by [DeliveryQueue::next_to_send],
///  feeds in ACKs, and calls [DeliveryQueue::on_timeout] when [DeliveryQueue::retransmit_deadline]
///  has passed.
#[derive(Debug)]
pub struct DeliveryQueue {
    ack_timeout: Duration,
    queue: VecDeque<OutboundMessage>,
    in_flight: Option<InFlight>,
}

impl DeliveryQueue {
    pub fn new(ack_timeout: Duration) -> DeliveryQueue {
        DeliveryQueue {
            ack_timeout,
            queue: Default::default(),
            in_flight: None,
        }
    }

    /// Appends a `Chat/Message/Request` packet. Packets that could not be encoded are rejected
    ///  here rather than failing on every (re)send.
    pub fn enqueue(&mut self, user: &str, payload: &str) -> Result<(), PacketError> {
        let packet = Packet::chat(user, payload);
        packet.validate()?;

        self.queue.push_back(OutboundMessage { packet, num_sent: 0 });
        trace!("enqueued chat message, {} message(s) waiting", self.queue.len());
        Ok(())
    }

    /// Returns the next packet to put on the wire, marking it as in flight - or `None` if a
    ///  packet is still waiting for its ACK or there is nothing to send.
    pub fn next_to_send(&mut self, now: Instant) -> Option<Packet> {
        if self.in_flight.is_some() {
            return None;
        }

        let mut message = self.queue.pop_front()?;
        message.num_sent += 1;
        let packet = message.packet.clone();

        if message.num_sent > 1 {
            debug!("re-sending chat message (attempt #{}): {:?}", message.num_sent, packet);
        }

        self.in_flight = Some(InFlight {
            message,
            deadline: now + self.ack_timeout,
        });
        Some(packet)
    }

    /// Returns `true` if the ACK matched the in-flight message; an ACK while nothing is in
    ///  flight is stale and ignored.
    pub fn on_ack(&mut self) -> bool {
        match self.in_flight.take() {
            Some(in_flight) => {
                trace!("chat message acknowledged after {} attempt(s)", in_flight.message.num_sent);
                true
            }
            None => {
                debug!("received ACK while no chat message is in flight - ignoring");
                false
            }
        }
    }

    pub fn retransmit_deadline(&self) -> Option<Instant> {
        self.in_flight.as_ref()
            .map(|in_flight| in_flight.deadline)
    }

    /// Puts the in-flight message back at the head of the queue if its deadline has passed.
    ///  Returns `true` if that happened.
    pub fn on_timeout(&mut self, now: Instant) -> bool {
        match self.in_flight.take() {
            Some(in_flight) if now >= in_flight.deadline => {
                debug!("no ACK for chat message within {:?}", self.ack_timeout);
                self.queue.push_front(in_flight.message);
                true
            }
            other => {
                self.in_flight = other;
                false
            }
        }
    }

    /// Drops all pending messages, including the one in flight.
    pub fn clear(&mut self) {
        let num_dropped = self.len();
        if num_dropped > 0 {
            debug!("discarding {} undelivered chat message(s)", num_dropped);
        }
        self.queue.clear();
        self.in_flight = None;
    }

    /// number of messages not acknowledged yet, including the one in flight
    pub fn len(&self) -> usize {
        self.queue.len() + self.in_flight.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn payload(packet: Option<Packet>) -> String {
        packet.expect("a packet should be ready").payload
    }

    #[test]
    fn test_single_message_acknowledged_in_time() {
        let start = Instant::now();
        let mut queue = DeliveryQueue::new(TIMEOUT);
        queue.enqueue("alice", "hello").unwrap();

        let packet = queue.next_to_send(start).unwrap();
        assert_eq!(packet, Packet::chat("alice", "hello"));
        assert_eq!(queue.retransmit_deadline(), Some(start + TIMEOUT));
        assert!(queue.next_to_send(start).is_none());

        assert!(!queue.on_timeout(start + Duration::from_secs(1)));
        assert!(queue.on_ack());

        assert!(queue.is_empty());
        assert!(queue.retransmit_deadline().is_none());
        assert!(!queue.on_timeout(start + Duration::from_secs(10)));
        assert!(queue.next_to_send(start + Duration::from_secs(10)).is_none());
    }

    #[test]
    fn test_retransmission_preserves_fifo_order() {
        let mut now = Instant::now();
        let mut queue = DeliveryQueue::new(TIMEOUT);
        for p in ["one", "two", "three"] {
            queue.enqueue("alice", p).unwrap();
        }

        for expected in ["one", "two", "three"] {
            assert_eq!(payload(queue.next_to_send(now)), expected);

            // no ACK: the same message is re-sent, nothing overtakes it
            for _ in 0..3 {
                now += TIMEOUT;
                assert!(queue.on_timeout(now));
                assert_eq!(payload(queue.next_to_send(now)), expected);
            }

            assert!(queue.on_ack());
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_timeout_before_deadline_is_ignored() {
        let start = Instant::now();
        let mut queue = DeliveryQueue::new(TIMEOUT);
        queue.enqueue("alice", "hello").unwrap();
        queue.next_to_send(start);

        assert!(!queue.on_timeout(start + TIMEOUT - Duration::from_millis(1)));
        assert!(queue.retransmit_deadline().is_some());
        assert!(queue.on_timeout(start + TIMEOUT));
        assert!(queue.retransmit_deadline().is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_stale_ack() {
        let mut queue = DeliveryQueue::new(TIMEOUT);
        assert!(!queue.on_ack());

        queue.enqueue("alice", "hello").unwrap();
        assert!(!queue.on_ack());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_enqueue_rejects_non_ascii() {
        let mut queue = DeliveryQueue::new(TIMEOUT);
        assert_eq!(queue.enqueue("alice", "grüße"), Err(PacketError::NonAsciiPayload));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clear() {
        let now = Instant::now();
        let mut queue = DeliveryQueue::new(TIMEOUT);
        queue.enqueue("alice", "one").unwrap();
        queue.enqueue("alice", "two").unwrap();
        queue.next_to_send(now);
        assert_eq!(queue.len(), 2);

        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.retransmit_deadline().is_none());
    }
}
