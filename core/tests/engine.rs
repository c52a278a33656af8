//! Integration tests that drive two engines across an in-memory channel
//! that can drop, duplicate, and reorder datagrams, exercising the parts of
//! the protocol that only show up across a lossy link: retransmission,
//! reassembly, and total message ordering.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use arq_core::{Engine, Profile};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// A channel that queues outgoing datagrams with a fixed propagation delay
/// and can be told to drop or duplicate a fraction of them.
struct LossyChannel {
    rng: SmallRng,
    drop_rate: f64,
    duplicate_rate: f64,
}

impl LossyChannel {
    fn new(seed: u64, drop_rate: f64, duplicate_rate: f64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            drop_rate,
            duplicate_rate,
        }
    }

    /// Decides the fate of one datagram: `0` copies, `1` copy, or `2`
    /// copies (duplicated).
    fn copies(&mut self) -> u8 {
        if self.rng.gen_bool(self.drop_rate) {
            0
        } else if self.rng.gen_bool(self.duplicate_rate) {
            2
        } else {
            1
        }
    }
}

fn make_engine(conv: u32, out: Rc<RefCell<VecDeque<Vec<u8>>>>) -> Engine {
    struct NotSend(Rc<RefCell<VecDeque<Vec<u8>>>>);
    unsafe impl Send for NotSend {}
    let adapter = NotSend(out);
    Engine::new(conv, move |bytes: &[u8]| {
        adapter.0.borrow_mut().push_back(bytes.to_vec());
    })
}

/// Runs `sender` -> `receiver` over a lossy channel until every message in
/// `messages` has been delivered, or `max_ticks` elapses (in which case the
/// test fails). Returns the messages in the order the receiver observed
/// them.
fn run_to_completion(
    messages: &[&[u8]],
    drop_rate: f64,
    duplicate_rate: f64,
    seed: u64,
    max_ticks: u32,
) -> Vec<Vec<u8>> {
    let a_out = Rc::new(RefCell::new(VecDeque::new()));
    let b_out = Rc::new(RefCell::new(VecDeque::new()));
    let mut a = make_engine(0xC0FFEE, a_out.clone());
    let mut b = make_engine(0xC0FFEE, b_out.clone());
    a.set_nodelay(Profile::Fast.params());
    b.set_nodelay(Profile::Fast.params());

    for msg in messages {
        a.send(msg).unwrap();
    }

    let mut channel = LossyChannel::new(seed, drop_rate, duplicate_rate);
    let mut delivered = Vec::new();
    let mut t = 0u32;

    while delivered.len() < messages.len() && t < max_ticks {
        a.update(t);
        while let Some(pkt) = a_out.borrow_mut().pop_front() {
            for _ in 0..channel.copies() {
                b.input(&pkt);
            }
        }

        b.update(t);
        while let Some(pkt) = b_out.borrow_mut().pop_front() {
            for _ in 0..channel.copies() {
                a.input(&pkt);
            }
        }

        let mut out = Vec::new();
        while b.recv(&mut out).is_ok() {
            delivered.push(out.clone());
        }

        t += 10;
    }

    delivered
}

#[test]
fn messages_survive_heavy_loss_in_order() {
    let messages: Vec<&[u8]> = vec![b"one", b"two", b"three", b"four", b"five"];
    let delivered = run_to_completion(&messages, 0.3, 0.05, 42, 20_000);

    assert_eq!(delivered.len(), messages.len());
    for (expected, actual) in messages.iter().zip(delivered.iter()) {
        assert_eq!(*expected, actual.as_slice());
    }
}

#[test]
fn large_message_reassembles_across_fragments() {
    let payload = vec![0xABu8; 5000];
    let delivered = run_to_completion(&[&payload], 0.1, 0.0, 7, 20_000);

    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0], payload);
}

#[test]
fn duplicated_datagrams_do_not_duplicate_delivery() {
    let messages: Vec<&[u8]> = vec![b"alpha", b"beta", b"gamma"];
    let delivered = run_to_completion(&messages, 0.0, 0.5, 13, 20_000);

    assert_eq!(delivered.len(), messages.len());
    for (expected, actual) in messages.iter().zip(delivered.iter()) {
        assert_eq!(*expected, actual.as_slice());
    }
}

#[test]
fn conv_mismatch_is_silently_ignored() {
    let a_out = Rc::new(RefCell::new(VecDeque::new()));
    let mut stranger = make_engine(1, a_out.clone());
    let mut receiver = make_engine(2, Rc::new(RefCell::new(VecDeque::new())));

    stranger.send(b"not for you").unwrap();
    stranger.update(0);

    let mut saw_anything = false;
    while let Some(pkt) = a_out.borrow_mut().pop_front() {
        let outcome = receiver.input(&pkt);
        assert_eq!(outcome, arq_core::InputOutcome::ConvMismatch);
        saw_anything = true;
    }
    assert!(saw_anything);
    assert!(receiver.peek_size().is_none());
}
