//! Useful traits and other utilities that don't really belong anywhere else.

use std::io::{self, Read};

pub trait ReadExt {
    /// Append up to `read_len` bytes to `vec`, stopping early only at EOF.
    ///
    /// Unlike `read_exact`, a short stream is not an error: fewer than `read_len` new bytes means
    /// the stream has ended.
    fn read_to_vec(&mut self, vec: &mut Vec<u8>, read_len: usize) -> io::Result<()>;
}

impl<T: Read> ReadExt for T {
    fn read_to_vec(&mut self, vec: &mut Vec<u8>, read_len: usize) -> io::Result<()> {
        vec.reserve(read_len);
        self.by_ref().take(read_len as u64).read_to_end(vec)?;
        Ok(())
    }
}

#[test]
fn test_read_to_vec() -> io::Result<()> {
    let mut vec = Vec::new();
    io::repeat(0xAA).read_to_vec(&mut vec, 4)?;
    assert_eq!(vec, [0xAA; 4]);

    let mut stream = &[1, 2, 3][..];
    stream.read_to_vec(&mut vec, 2)?;
    assert_eq!(vec, [0xAA, 0xAA, 0xAA, 0xAA, 1, 2]);
    stream.read_to_vec(&mut vec, 8)?;
    assert_eq!(vec, [0xAA, 0xAA, 0xAA, 0xAA, 1, 2, 3]);
    stream.read_to_vec(&mut vec, 8)?;
    assert_eq!(vec.len(), 7);
    Ok(())
}
