use std::{collections::VecDeque, time::Duration};

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::error::Result;

use super::SerialLink;

/// What happens to one outgoing `send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Pass,
    /// Flip one bit, counted from the first byte of the write. Wraps around
    /// the write length.
    FlipBit(usize),
    /// The write never reaches the peer.
    Drop,
    /// Only the first `n` bytes reach the peer.
    Truncate(usize),
}

enum Plan {
    Script(VecDeque<Fault>),
    Random {
        rng: StdRng,
        corrupt_rate: f64,
        drop_rate: f64,
    },
}

/// Wraps a link and damages what it sends, for bench testing the protocol
/// against a noisy line.
pub struct FaultyLink<L> {
    inner: L,
    plan: Plan,
    injected: usize,
}

impl<L: SerialLink> FaultyLink<L> {
    /// Apply `faults` to consecutive writes, then pass everything.
    pub fn scripted(inner: L, faults: impl IntoIterator<Item = Fault>) -> Self {
        Self {
            inner,
            plan: Plan::Script(faults.into_iter().collect()),
            injected: 0,
        }
    }

    /// Corrupt or drop writes at the given rates, reproducibly for a seed.
    pub fn random(inner: L, seed: u64, corrupt_rate: f64, drop_rate: f64) -> Self {
        Self {
            inner,
            plan: Plan::Random {
                rng: StdRng::seed_from_u64(seed),
                corrupt_rate,
                drop_rate,
            },
            injected: 0,
        }
    }

    /// Writes that were damaged or dropped so far.
    pub fn injected(&self) -> usize {
        self.injected
    }

    pub fn into_inner(self) -> L {
        self.inner
    }

    fn next_fault(&mut self, len: usize) -> Fault {
        match &mut self.plan {
            Plan::Script(faults) => faults.pop_front().unwrap_or(Fault::Pass),
            Plan::Random {
                rng,
                corrupt_rate,
                drop_rate,
            } => {
                if rng.gen_bool(drop_rate.clamp(0.0, 1.0)) {
                    Fault::Drop
                } else if len > 0 && rng.gen_bool(corrupt_rate.clamp(0.0, 1.0)) {
                    Fault::FlipBit(rng.gen_range(0..len * 8))
                } else {
                    Fault::Pass
                }
            }
        }
    }
}

impl<L: SerialLink> SerialLink for FaultyLink<L> {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let fault = self.next_fault(bytes.len());
        if fault != Fault::Pass {
            self.injected += 1;
            tracing::debug!("Inject {:?} into {} byte write", fault, bytes.len());
        }

        match fault {
            Fault::Pass => self.inner.send(bytes),
            Fault::Drop => Ok(()),
            Fault::Truncate(n) => self.inner.send(&bytes[..n.min(bytes.len())]),
            Fault::FlipBit(bit) => {
                if bytes.is_empty() {
                    return self.inner.send(bytes);
                }
                let bit = bit % (bytes.len() * 8);
                let mut damaged = bytes.to_vec();
                damaged[bit / 8] ^= 1 << (bit % 8);
                self.inner.send(&damaged)
            }
        }
    }

    fn recv_byte(&mut self, timeout: Option<Duration>) -> Result<Option<u8>> {
        self.inner.recv_byte(timeout)
    }
}
