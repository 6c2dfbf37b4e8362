use std::io;

use super::Collective;

/// The trivial group of a single, non-distributed process.
#[derive(Debug, Default, Clone, Copy)]
pub struct Solo;

impl Collective for Solo {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&mut self, _buf: &mut [f32]) -> io::Result<()> {
        Ok(())
    }

    fn all_reduce_sum_f64(&mut self, _buf: &mut [f64]) -> io::Result<()> {
        Ok(())
    }
}
