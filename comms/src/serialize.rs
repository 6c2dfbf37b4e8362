use std::io;

pub trait Serialize<'a> {
    /// Writes the owned part of `self` into `buf`.
    ///
    /// # Returns
    /// A borrowed tail that goes on the wire right after `buf` without being
    /// copied, if any, or an io error if `self` can't be encoded.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>>;
}
