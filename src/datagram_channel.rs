use crate::frame;
use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use std::cmp::max;
use std::collections::VecDeque;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// The redundant-datagram engine of a connection: sequence numbering and the history
///  window on the send side, sequence-gap recovery on the receive side.
///
/// All mutable state lives behind a single lock that is independent of the stream
///  channel's send-queue lock, so datagram traffic never blocks on stream traffic or
///  vice versa. The engine composes and classifies bytes; actually moving them is the
///  connection's job.
pub struct DatagramChannel {
    max_payload_len: usize,
    inner: Mutex<DatagramChannelInner>,
}

struct DatagramChannelInner {
    /// sequence number of the most recently sent packet; the counter wraps at 65536
    last_sent_seq: u16,

    /// previously sent encoded packets, most recent first
    history: VecDeque<Bytes>,

    /// the largest redundancy ever requested on this connection - the history never
    ///  needs to hold more entries than that
    history_bound: usize,

    /// sequence number of the freshest packet accepted from the peer
    last_received_seq: u16,
}

impl DatagramChannel {
    pub fn new(max_payload_len: usize) -> DatagramChannel {
        DatagramChannel {
            max_payload_len,
            inner: Mutex::new(DatagramChannelInner {
                last_sent_seq: 0,
                history: VecDeque::new(),
                history_bound: 0,
                last_received_seq: 0,
            }),
        }
    }

    /// Assigns the next sequence number to the payload and composes the outbound
    ///  datagram: the newly encoded packet first, followed by up to `redundancy`
    ///  previously sent packets, most recent first.
    pub async fn compose(&self, payload: &[u8], redundancy: usize) -> anyhow::Result<Bytes> {
        if payload.len() > self.max_payload_len {
            bail!("datagram payload of length {} exceeds the configured maximum of {}", payload.len(), self.max_payload_len);
        }

        let mut inner = self.inner.lock().await;

        let seq = inner.last_sent_seq.wrapping_add(1);
        inner.last_sent_seq = seq;
        let packet = frame::encode_datagram_packet(payload, seq);

        let num_redundant = inner.history.len().min(redundancy);
        let mut datagram = BytesMut::with_capacity(
            packet.len() + inner.history.iter().take(redundancy).map(|p| p.len()).sum::<usize>());
        datagram.put_slice(&packet);
        for prev in inner.history.iter().take(redundancy) {
            datagram.put_slice(prev);
        }
        trace!("composed datagram #{} carrying {} redundant packets", seq, num_redundant);

        inner.history_bound = max(inner.history_bound, redundancy);
        inner.history.push_front(packet);
        while inner.history.len() > inner.history_bound {
            inner.history.pop_back();
        }

        Ok(datagram.freeze())
    }

    /// Classifies the sub-packets of one inbound datagram against the last accepted
    ///  sequence number and returns the payloads to dispatch, in delivery order:
    ///  previously missing packets oldest first, the freshest packet last.
    ///
    /// Sub-packets appear newest first on the wire, so the first new one encountered is
    ///  the freshest; any further new ones are older packets whose own datagrams were
    ///  lost and which are now recovered from the redundancy.
    pub async fn accept(&self, datagram: Bytes) -> Vec<Bytes> {
        let sub_packets = frame::decode_datagram(datagram, self.max_payload_len);

        let mut inner = self.inner.lock().await;

        let mut freshest = None;
        let mut recovered = Vec::new();
        for sub_packet in sub_packets {
            // signed wrapping difference: a delta of exactly i16::MIN is outside the
            //  range where wraparound comparison is unambiguous, and counts as stale
            let delta = sub_packet.seq.wrapping_sub(inner.last_received_seq) as i16;
            if delta <= 0 {
                trace!("sub-packet #{} is stale (last received #{}) - skipping", sub_packet.seq, inner.last_received_seq);
                continue;
            }

            if freshest.is_none() {
                freshest = Some(sub_packet);
            }
            else {
                debug!("recovered lost packet #{} from redundancy", sub_packet.seq);
                recovered.push(sub_packet.payload);
            }
        }

        // recovered packets were encountered newest first - deliver them oldest first
        let mut deliverable: Vec<Bytes> = recovered.into_iter().rev().collect();
        if let Some(sub_packet) = freshest {
            trace!("accepting packet #{} as freshest", sub_packet.seq);
            inner.last_received_seq = sub_packet.seq;
            deliverable.push(sub_packet.payload);
        }
        deliverable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;
    use tokio::runtime::Builder;

    fn assert_composed(datagram: &Bytes, expected: &[(u16, &[u8])]) {
        let actual = frame::decode_datagram(datagram.clone(), 1024)
            .into_iter()
            .map(|s| (s.seq, s.payload.to_vec()))
            .collect::<Vec<_>>();
        let expected = expected.iter()
            .map(|&(seq, payload)| (seq, payload.to_vec()))
            .collect::<Vec<_>>();
        assert_eq!(actual, expected);
    }

    #[rstest]
    fn test_compose_carries_history_most_recent_first() {
        let rt = Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let channel = DatagramChannel::new(1024);

            assert_composed(&channel.compose(&[1], 2).await.unwrap(), &[(1, &[1])]);
            assert_composed(&channel.compose(&[2], 2).await.unwrap(), &[(2, &[2]), (1, &[1])]);
            assert_composed(&channel.compose(&[3], 2).await.unwrap(), &[(3, &[3]), (2, &[2]), (1, &[1])]);
            // the oldest entry was evicted - the window holds at most 'redundancy' packets
            assert_composed(&channel.compose(&[4], 2).await.unwrap(), &[(4, &[4]), (3, &[3]), (2, &[2])]);
        });
    }

    #[rstest]
    fn test_compose_zero_redundancy() {
        let rt = Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let channel = DatagramChannel::new(1024);

            assert_composed(&channel.compose(&[1], 0).await.unwrap(), &[(1, &[1])]);
            assert_composed(&channel.compose(&[2], 0).await.unwrap(), &[(2, &[2])]);
        });
    }

    #[rstest]
    fn test_compose_history_bound_grows_but_never_shrinks() {
        let rt = Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let channel = DatagramChannel::new(1024);

            channel.compose(&[1], 0).await.unwrap();
            channel.compose(&[2], 3).await.unwrap();
            channel.compose(&[3], 1).await.unwrap();
            channel.compose(&[4], 1).await.unwrap();

            // the bound is the largest redundancy ever requested (3), so packets 2..4
            //  are all still in the window
            assert_composed(&channel.compose(&[5], 3).await.unwrap(),
                            &[(5, &[5]), (4, &[4]), (3, &[3]), (2, &[2])]);
        });
    }

    #[rstest]
    fn test_compose_rejects_oversized_payload() {
        let rt = Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let channel = DatagramChannel::new(4);
            assert!(channel.compose(&[0; 5], 0).await.is_err());
            assert!(channel.compose(&[0; 4], 0).await.is_ok());
        });
    }

    async fn accept_all(channel: &DatagramChannel, datagrams: Vec<Bytes>) -> Vec<Vec<u8>> {
        let mut delivered = Vec::new();
        for datagram in datagrams {
            for payload in channel.accept(datagram).await {
                delivered.push(payload.to_vec());
            }
        }
        delivered
    }

    #[rstest]
    fn test_single_loss_recovered_in_order() {
        // redundancy 2, datagram #2 lost in transit; the peer still
        //  sees payloads 1,2,3,4 in order, recovered from the redundancy in #3
        let rt = Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let sender = DatagramChannel::new(1024);
            let receiver = DatagramChannel::new(1024);

            let d1 = sender.compose(&[1], 2).await.unwrap();
            let _lost = sender.compose(&[2], 2).await.unwrap();
            let d3 = sender.compose(&[3], 2).await.unwrap();
            let d4 = sender.compose(&[4], 2).await.unwrap();

            let delivered = accept_all(&receiver, vec![d1, d3, d4]).await;
            assert_eq!(delivered, vec![vec![1], vec![2], vec![3], vec![4]]);
        });
    }

    #[rstest]
    #[case::first_lost(0)]
    #[case::middle_lost(1)]
    #[case::last_but_one_lost(2)]
    fn test_any_single_loss_among_n_plus_1(#[case] lost: usize) {
        // with redundancy N, any single lost datagram among N+1 consecutive sends is
        //  recovered; here N = 3
        let rt = Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let sender = DatagramChannel::new(1024);
            let receiver = DatagramChannel::new(1024);

            let mut datagrams = Vec::new();
            for i in 1u8..=4 {
                datagrams.push(sender.compose(&[i], 3).await.unwrap());
            }
            datagrams.remove(lost);

            let delivered = accept_all(&receiver, datagrams).await;
            assert_eq!(delivered, vec![vec![1], vec![2], vec![3], vec![4]]);
        });
    }

    #[rstest]
    fn test_duplicate_datagram_is_stale() {
        let rt = Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let sender = DatagramChannel::new(1024);
            let receiver = DatagramChannel::new(1024);

            let d1 = sender.compose(&[1], 1).await.unwrap();
            let d2 = sender.compose(&[2], 1).await.unwrap();

            let delivered = accept_all(&receiver, vec![d1.clone(), d2, d1]).await;
            assert_eq!(delivered, vec![vec![1], vec![2]]);
        });
    }

    #[rstest]
    fn test_reordered_datagram_is_stale() {
        let rt = Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let sender = DatagramChannel::new(1024);
            let receiver = DatagramChannel::new(1024);

            let d1 = sender.compose(&[1], 0).await.unwrap();
            let d2 = sender.compose(&[2], 0).await.unwrap();

            // no redundancy and out-of-order arrival: the older datagram is dropped
            let delivered = accept_all(&receiver, vec![d2, d1]).await;
            assert_eq!(delivered, vec![vec![2]]);
        });
    }

    #[rstest]
    fn test_sequence_wraparound() {
        // 70,000 sends wrap the 16-bit counter; the signed-difference comparison must
        //  still classify every packet as new
        let rt = Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let sender = DatagramChannel::new(1024);
            let receiver = DatagramChannel::new(1024);

            let mut num_delivered = 0usize;
            for i in 0u32..70_000 {
                let payload = i.to_be_bytes();
                let datagram = sender.compose(&payload, 0).await.unwrap();
                let delivered = receiver.accept(datagram).await;
                assert_eq!(delivered.len(), 1, "packet {} misclassified as stale", i);
                assert_eq!(delivered[0].as_ref(), payload);
                num_delivered += 1;
            }
            assert_eq!(num_delivered, 70_000);

            // seq 70000 mod 65536 must count as newer than seq 65000
            let inner = receiver.inner.lock().await;
            assert_eq!(inner.last_received_seq, (70_000 % 65_536) as u16);
            let delta = inner.last_received_seq.wrapping_sub(65_000) as i16;
            assert!(delta > 0);
        });
    }

    #[rstest]
    fn test_truncated_datagram_still_delivers_leading_packets() {
        let rt = Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let sender = DatagramChannel::new(1024);
            let receiver = DatagramChannel::new(1024);

            let datagram = sender.compose(&[1, 2, 3], 0).await.unwrap();
            let mut corrupt = BytesMut::from(datagram.as_ref());
            corrupt.put_slice(&[9, 0]); // claims another sub-packet, then ends

            let delivered = accept_all(&receiver, vec![corrupt.freeze()]).await;
            assert_eq!(delivered, vec![vec![1, 2, 3]]);
        });
    }
}
