//! Sequencing gate: lets concurrent producers through in sequence order.
//!
//! The gate is a monitor over a single cursor. [`SequenceGate::acquire`]
//! sleeps on the condition variable until the cursor equals the caller's
//! sequence number, re-checking the predicate after every wake-up.
//! [`Turn::release`] advances the cursor by one and wakes every waiter.
//!
//! The gate orders producers; it does not exclude them from a shared
//! resource. Callers pair each turn with their own lock around the section
//! being ordered.
//!
//! Waiters are bounded by the number of threads calling `acquire`, not by the
//! number of sequence numbers, so a broadcast on every advance is cheap.

use crate::error::GateError;
use parking_lot::{Condvar, Mutex};

struct GateState {
    next: u64,
    closed: bool,
}

/// Ordering primitive over a monotonically advancing cursor.
pub struct SequenceGate {
    state: Mutex<GateState>,
    turn: Condvar,
}

impl Default for SequenceGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceGate {
    /// Creates a gate whose cursor starts at 0.
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(next: u64) -> Self {
        Self {
            state: Mutex::new(GateState {
                next,
                closed: false,
            }),
            turn: Condvar::new(),
        }
    }

    /// Blocks until `seq` is the next expected sequence number.
    ///
    /// Every sequence number must be acquired exactly once, and every number
    /// below it must eventually be acquired too, or the caller waits until
    /// the gate is closed.
    pub fn acquire(&self, seq: u64) -> Result<Turn<'_>, GateError> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(GateError::Closed { seq });
            }
            if state.next == seq {
                return Ok(Turn {
                    gate: self,
                    seq,
                    released: false,
                });
            }
            if state.next > seq {
                return Err(GateError::AlreadyPassed {
                    seq,
                    cursor: state.next,
                });
            }
            self.turn.wait(&mut state);
        }
    }

    /// Closes the gate: current and future `acquire` calls fail.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            self.turn.notify_all();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// The next sequence number allowed through.
    pub fn cursor(&self) -> u64 {
        self.state.lock().next
    }

    fn advance(&self, seq: u64) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.next, seq, "turn released out of order");
        state.next += 1;
        self.turn.notify_all();
    }
}

/// The right to run the ordered section for one sequence number.
///
/// Dropping a turn without calling [`Turn::release`] closes the gate, so
/// later sequence numbers fail instead of waiting forever.
#[must_use = "dropping a turn without releasing it closes the gate"]
pub struct Turn<'a> {
    gate: &'a SequenceGate,
    seq: u64,
    released: bool,
}

impl Turn<'_> {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Advances the cursor and wakes the waiters.
    pub fn release(mut self) {
        self.released = true;
        self.gate.advance(self.seq);
    }
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.gate.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_release_order_matches_sequence() {
        const N: u64 = 32;
        let gate = Arc::new(SequenceGate::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        // Start the threads in a scrambled order with uneven delays.
        let mut seqs: Vec<u64> = (0..N).collect();
        seqs.sort_by_key(|s| (s * 7919) % 13);

        let threads: Vec<_> = seqs
            .into_iter()
            .map(|seq| {
                let gate = Arc::clone(&gate);
                let order = Arc::clone(&order);
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis((seq * 31) % 7));
                    let turn = gate.acquire(seq).unwrap();
                    order.lock().push(seq);
                    turn.release();
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(*order.lock(), (0..N).collect::<Vec<_>>());
        assert_eq!(gate.cursor(), N);
    }

    #[test]
    fn test_close_wakes_waiters() {
        let gate = Arc::new(SequenceGate::new());
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.acquire(5).map(|turn| turn.seq()))
        };
        thread::sleep(Duration::from_millis(20));
        gate.close();
        assert_eq!(waiter.join().unwrap(), Err(GateError::Closed { seq: 5 }));
    }

    #[test]
    fn test_dropped_turn_closes_gate() {
        let gate = SequenceGate::new();
        drop(gate.acquire(0).unwrap());
        assert!(gate.is_closed());
        assert_eq!(gate.cursor(), 0);
        assert!(matches!(gate.acquire(1), Err(GateError::Closed { seq: 1 })));
    }

    #[test]
    fn test_passed_sequence_is_rejected() {
        let gate = SequenceGate::starting_at(3);
        assert_eq!(
            gate.acquire(1).map(|turn| turn.seq()),
            Err(GateError::AlreadyPassed { seq: 1, cursor: 3 })
        );
        gate.acquire(3).unwrap().release();
        assert_eq!(gate.cursor(), 4);
    }
}
