//! Compressed cluster decoding: raw deflate and zstd.

use flate2::{Decompress, FlushDecompress};

use crate::api::{DeviceError, OpResult};

/// Inflate one raw-deflate compressed cluster into `out` (cluster-sized).
///
/// The compressed bytes are read in whole 512-byte sectors, so the input
/// may run into the start of the next compressed stream; a decoder that
/// stops cleanly with the output full is success regardless of leftover
/// input.
pub(super) fn inflate_cluster(compressed: &[u8], out: &mut [u8], file_offset: u64) -> OpResult<()> {
    let mut d = Decompress::new(false);
    d.decompress(compressed, out, FlushDecompress::Finish)
        .map_err(|e| DeviceError::io(format!("deflate: {}", e)))?;
    if d.total_out() != out.len() as u64 {
        return Err(DeviceError::io(format!(
            "deflate: incomplete compressed stream at qcow2 offset {:#x}: \
             read {} bytes of input, wrote {} bytes of output",
            file_offset,
            d.total_in(),
            d.total_out()
        )));
    }
    Ok(())
}

/// Decompress one zstd compressed cluster into `out` (cluster-sized).
///
/// The streaming decoder stops after `out.len()` decoded bytes, ignoring
/// the sector padding that may follow the frame; a decoder that cannot
/// make forward progress surfaces as an I/O error.
pub(super) fn zstd_cluster(compressed: &[u8], out: &mut [u8], file_offset: u64) -> OpResult<()> {
    use std::io::Read;

    let mut dec = zstd::stream::read::Decoder::new(compressed)
        .map_err(|e| DeviceError::io(format!("zstd: {}", e)))?;
    dec.read_exact(out).map_err(|e| {
        DeviceError::io(format!(
            "zstd: error decompressing cluster at qcow2 offset {:#x} \
             (compressed size {}): {}",
            file_offset,
            compressed.len(),
            e
        ))
    })
}
