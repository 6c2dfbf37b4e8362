use std::{io, num::NonZeroUsize, sync::Arc};

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::{Collective, length_mismatch, reducible::Reducible};

struct Round {
    slots: Vec<Vec<f64>>,
    arrived: usize,
    generation: u64,
    /// Set once any member is dropped, the group can't make progress after it.
    poisoned: bool,
}

struct Shared {
    round: Mutex<Round>,
    all_arrived: Condvar,
    world_size: usize,
}

impl Shared {
    /// Blocks until every rank reaches this point of the current round.
    ///
    /// # Returns
    /// An io error if a member left the group before every rank arrived.
    fn wait(&self, round: &mut MutexGuard<'_, Round>) -> io::Result<()> {
        if round.poisoned {
            return Err(left_group());
        }

        let generation = round.generation;
        round.arrived += 1;
        if round.arrived == self.world_size {
            round.arrived = 0;
            round.generation += 1;
            self.all_arrived.notify_all();
            return Ok(());
        }

        while round.generation == generation {
            if round.poisoned {
                return Err(left_group());
            }
            self.all_arrived.wait(round);
        }

        Ok(())
    }
}

fn left_group() -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionAborted,
        "a rank left the process group",
    )
}

/// A group whose ranks are threads of the same process.
///
/// Each rank publishes its buffer into a shared slot, waits for the others and
/// then sums every slot in rank order. Dropping a member fails every pending
/// and future operation of the others.
pub struct LocalGroup {
    rank: usize,
    world_size: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Creates every member of a new group, the i-th handle being rank i.
    ///
    /// # Arguments
    /// * `world_size` - The amount of ranks in the group.
    ///
    /// # Returns
    /// One handle per rank, to be moved into its thread.
    pub fn new(world_size: NonZeroUsize) -> Vec<Self> {
        let world_size = world_size.get();
        let shared = Arc::new(Shared {
            round: Mutex::new(Round {
                slots: vec![Vec::new(); world_size],
                arrived: 0,
                generation: 0,
                poisoned: false,
            }),
            all_arrived: Condvar::new(),
            world_size,
        });

        (0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn all_reduce<T: Reducible>(&mut self, buf: &mut [T]) -> io::Result<()> {
        let shared = &*self.shared;
        let mut round = shared.round.lock();

        round.slots[self.rank] = buf.iter().map(|x| x.to_f64()).collect();
        shared.wait(&mut round)?;

        let mut acc = vec![0.; buf.len()];
        let mut mismatch = None;
        for slot in &round.slots {
            if slot.len() != acc.len() {
                mismatch = Some(slot.len());
                continue;
            }

            acc.iter_mut().zip(slot).for_each(|(a, x)| *a += x);
        }

        // Nobody may publish the next round until every rank has read this one.
        shared.wait(&mut round)?;
        drop(round);

        if let Some(got) = mismatch {
            return Err(length_mismatch(got, buf.len()));
        }

        for (x, r) in buf.iter_mut().zip(acc) {
            *x = T::from_f64(r);
        }

        Ok(())
    }
}

impl Drop for LocalGroup {
    fn drop(&mut self) {
        self.shared.round.lock().poisoned = true;
        self.shared.all_arrived.notify_all();
    }
}

impl Collective for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&mut self, buf: &mut [f32]) -> io::Result<()> {
        self.all_reduce(buf)
    }

    fn all_reduce_sum_f64(&mut self, buf: &mut [f64]) -> io::Result<()> {
        self.all_reduce(buf)
    }
}
