use crossbeam_channel::{unbounded, Receiver, Sender};

use super::{CommError, Communicator};

#[derive(Clone, Debug, PartialEq)]
enum Packet {
    Barrier,
    Reduce(Vec<f64>),
    Data(Vec<u8>),
    Ack,
}

impl Packet {
    fn kind(&self) -> &'static str {
        match self {
            Packet::Barrier => "barrier",
            Packet::Reduce(_) => "reduce",
            Packet::Data(_) => "data",
            Packet::Ack => "ack",
        }
    }
}

/// In-process communicator connecting ranks that run on separate threads.
///
/// Each ordered pair of ranks has its own FIFO channel, so messages of consecutive collectives
/// cannot overtake each other.
pub struct LocalComm {
    rank: usize,
    size: usize,
    /// Channel to each destination rank (`None` for self).
    senders: Vec<Option<Sender<Packet>>>,
    /// Channel from each source rank (`None` for self).
    receivers: Vec<Option<Receiver<Packet>>>,
}

impl LocalComm {
    fn send(&self, dst: usize, packet: Packet) -> Result<(), CommError> {
        match &self.senders[dst] {
            Some(sender) => sender
                .send(packet)
                .map_err(|_| CommError::Disconnected { rank: dst }),
            None => Ok(()),
        }
    }

    fn recv(&self, src: usize) -> Result<Packet, CommError> {
        match &self.receivers[src] {
            Some(receiver) => receiver
                .recv()
                .map_err(|_| CommError::Disconnected { rank: src }),
            None => Err(CommError::Disconnected { rank: src }),
        }
    }

    fn others(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.size).filter(move |&r| r != self.rank)
    }

    fn unexpected(rank: usize, expected: &'static str, found: &Packet) -> CommError {
        CommError::UnexpectedMessage {
            rank,
            expected,
            found: found.kind(),
        }
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) -> Result<(), CommError> {
        for dst in self.others() {
            self.send(dst, Packet::Barrier)?;
        }
        for src in self.others() {
            match self.recv(src)? {
                Packet::Barrier => {}
                p => return Err(Self::unexpected(src, "barrier", &p)),
            }
        }
        Ok(())
    }

    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<(), CommError> {
        if self.size == 1 {
            return Ok(());
        }
        for dst in self.others() {
            self.send(dst, Packet::Reduce(values.to_vec()))?;
        }
        let mut contributions = Vec::with_capacity(self.size);
        for src in 0..self.size {
            if src == self.rank {
                contributions.push(values.to_vec());
                continue;
            }
            match self.recv(src)? {
                Packet::Reduce(v) if v.len() == values.len() => contributions.push(v),
                Packet::Reduce(v) => {
                    return Err(CommError::SizeMismatch {
                        rank: src,
                        expected: values.len(),
                        found: v.len(),
                    })
                }
                p => return Err(Self::unexpected(src, "reduce", &p)),
            }
        }
        // Sum in rank order so that all ranks produce identical results.
        for (i, out) in values.iter_mut().enumerate() {
            *out = contributions.iter().fold(0.0, |acc, c| acc + c[i]);
        }
        Ok(())
    }

    fn exchange(&self, mut outgoing: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, CommError> {
        if outgoing.len() != self.size {
            return Err(CommError::InvalidExchange {
                expected: self.size,
                found: outgoing.len(),
            });
        }
        for dst in self.others() {
            let buf = std::mem::take(&mut outgoing[dst]);
            self.send(dst, Packet::Data(buf))?;
        }
        let mut incoming = Vec::with_capacity(self.size - 1);
        for src in self.others() {
            match self.recv(src)? {
                Packet::Data(buf) => incoming.push(buf),
                p => return Err(Self::unexpected(src, "data", &p)),
            }
        }
        // Acknowledge receipt, then wait for our own sends to be acknowledged.
        for src in self.others() {
            self.send(src, Packet::Ack)?;
        }
        for dst in self.others() {
            match self.recv(dst)? {
                Packet::Ack => {}
                p => return Err(Self::unexpected(dst, "ack", &p)),
            }
        }
        Ok(incoming)
    }
}

/// Factory for a set of connected [`LocalComm`]s.
pub struct LocalCluster;

impl LocalCluster {
    /// Creates `size` communicators, one per rank, connected by channels.
    pub fn new(size: usize) -> Vec<LocalComm> {
        assert!(size > 0, "A cluster needs at least one rank");
        let mut senders: Vec<Vec<Option<Sender<Packet>>>> = (0..size)
            .map(|_| (0..size).map(|_| None).collect())
            .collect();
        let mut receivers: Vec<Vec<Option<Receiver<Packet>>>> = (0..size)
            .map(|_| (0..size).map(|_| None).collect())
            .collect();
        for src in 0..size {
            for dst in 0..size {
                if src == dst {
                    continue;
                }
                let (s, r) = unbounded();
                senders[src][dst] = Some(s);
                receivers[dst][src] = Some(r);
            }
        }
        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (senders, receivers))| LocalComm {
                rank,
                size,
                senders,
                receivers,
            })
            .collect()
    }

    /// Runs `f` on `size` ranks, each on its own thread, and returns the results in rank order.
    pub fn run<T, F>(size: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(LocalComm) -> T + Sync,
    {
        let comms = Self::new(size);
        let f = &f;
        std::thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| s.spawn(move || f(comm)))
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(res) => res,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        })
    }
}
