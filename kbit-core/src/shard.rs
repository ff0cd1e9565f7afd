// Shard bitmap I/O
// A shard file is a KBITv1 header (flags=2) followed by the portable
// serialization of a 64-bit compressed bitmap of present ids

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use roaring::RoaringTreemap;

use kbit_common::{universe_size, KbitError, KbitHeader, Result, FLAG_PORTABLE_BITMAP};

/// An opened shard: its header and the deserialized set of present ids.
pub struct ShardBitmap {
    pub header: KbitHeader,
    pub bitmap: RoaringTreemap,
}

/// Open a shard file, verify the header, and deserialize the bitmap.
/// A payload the bitmap library rejects marks the file unrecoverable.
pub fn load_shard(path: &Path) -> Result<ShardBitmap> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let header = KbitHeader::read_from(&mut reader)?;
    header.require_flags(FLAG_PORTABLE_BITMAP)?;

    let mut payload = Vec::with_capacity(header.payload_len as usize);
    reader
        .by_ref()
        .take(header.payload_len)
        .read_to_end(&mut payload)?;
    if payload.len() as u64 != header.payload_len {
        return Err(KbitError::TruncatedPayload {
            expected: header.payload_len,
            got: payload.len() as u64,
        });
    }

    let bitmap = RoaringTreemap::deserialize_from(&payload[..])
        .map_err(|e| KbitError::Deserialization(format!("{}: {e}", path.display())))?;

    Ok(ShardBitmap { header, bitmap })
}

/// Write a shard file for a set of present ids.
pub fn write_shard(path: &Path, k: u8, seed: u64, bitmap: &RoaringTreemap) -> Result<()> {
    let mut payload = Vec::with_capacity(bitmap.serialized_size());
    bitmap
        .serialize_into(&mut payload)
        .map_err(|e| KbitError::Deserialization(e.to_string()))?;

    let header = KbitHeader {
        total_bits: universe_size(k),
        ones: bitmap.len(),
        k: k as u64,
        seed,
        flags: FLAG_PORTABLE_BITMAP,
        payload_len: payload.len() as u64,
    };

    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&header.write())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}
