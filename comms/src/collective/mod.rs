//! Process groups used to keep data-parallel replicas in lock-step.
//!
//! Every rank must call the same collective operations in the same order with
//! buffers of the same length, otherwise the group hangs or fails.

mod local;
mod reducible;
mod solo;
mod tcp;

use std::io;

pub use local::LocalGroup;
pub use solo::Solo;
pub use tcp::TcpGroup;

/// A group of ranks that can combine buffers element-wise.
pub trait Collective: Send {
    /// The rank of this process within the group.
    fn rank(&self) -> usize;

    /// The amount of ranks in the group.
    fn world_size(&self) -> usize;

    /// Whether this rank is the one that performs I/O side effects.
    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    /// Replaces `buf` with the element-wise sum of every rank's `buf`.
    ///
    /// # Arguments
    /// * `buf` - The local contribution, overwritten with the reduced values.
    ///
    /// # Returns
    /// An io error if the exchange failed or the ranks disagree on the length.
    fn all_reduce_sum(&mut self, buf: &mut [f32]) -> io::Result<()>;

    /// Same as `all_reduce_sum` but in double precision, used for metric totals.
    fn all_reduce_sum_f64(&mut self, buf: &mut [f64]) -> io::Result<()>;

    /// Replaces `buf` with the element-wise mean over every rank's `buf`.
    fn all_reduce_mean(&mut self, buf: &mut [f32]) -> io::Result<()> {
        self.all_reduce_sum(buf)?;

        let n = self.world_size() as f32;
        if n > 1. {
            buf.iter_mut().for_each(|x| *x /= n);
        }

        Ok(())
    }

    /// Overwrites every rank's `buf` with the coordinator's contents.
    fn broadcast(&mut self, buf: &mut [f32]) -> io::Result<()> {
        if !self.is_coordinator() {
            buf.fill(0.);
        }

        self.all_reduce_sum(buf)
    }

    /// Blocks until every rank reaches this point.
    fn barrier(&mut self) -> io::Result<()> {
        self.all_reduce_sum(&mut [])
    }
}

impl<C: Collective + ?Sized> Collective for Box<C> {
    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn world_size(&self) -> usize {
        (**self).world_size()
    }

    fn is_coordinator(&self) -> bool {
        (**self).is_coordinator()
    }

    fn all_reduce_sum(&mut self, buf: &mut [f32]) -> io::Result<()> {
        (**self).all_reduce_sum(buf)
    }

    fn all_reduce_sum_f64(&mut self, buf: &mut [f64]) -> io::Result<()> {
        (**self).all_reduce_sum_f64(buf)
    }

    fn all_reduce_mean(&mut self, buf: &mut [f32]) -> io::Result<()> {
        (**self).all_reduce_mean(buf)
    }

    fn broadcast(&mut self, buf: &mut [f32]) -> io::Result<()> {
        (**self).broadcast(buf)
    }

    fn barrier(&mut self) -> io::Result<()> {
        (**self).barrier()
    }
}

fn length_mismatch(got: usize, expected: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("collective buffer length mismatch, got {got} and expected {expected}"),
    )
}
