//! Raw storage blocks streamed by the reduced-memory export path.
//!
//! A block arrives in its encoded form and is decoded on demand, so a block
//! that is forwarded verbatim (native export) is never decoded at all.

use crate::storage::data::{take_bytes, take_u32, DataError};
use crate::storage::search::TimeRange;

/// Version tag at the start of every encoded block
const BLOCK_VERSION: u8 = 1;

/// Encoded rows of a single series
#[derive(Debug, Clone, Default)]
pub struct Block {
    /// Portable encoding
    data: Vec<u8>,
    /// Decoded timestamps, filled by `unmarshal_data`
    timestamps: Vec<i64>,
    /// Decoded payloads, filled by `unmarshal_data`
    payloads: Vec<Vec<u8>>,
    decoded: bool,
}

impl Block {
    /// Encodes rows into a block.
    ///
    /// Layout: `{u8 version}{u32 rows}{i64 first}{i64 delta}*{u32 len, payload}*`,
    /// integers big-endian.
    pub fn from_rows(timestamps: &[i64], payloads: &[Vec<u8>]) -> Self {
        let mut data = Vec::with_capacity(1 + 4 + timestamps.len() * 8);
        data.push(BLOCK_VERSION);
        data.extend_from_slice(&(timestamps.len() as u32).to_be_bytes());
        let mut prev = 0i64;
        for (i, &ts) in timestamps.iter().enumerate() {
            let v = if i == 0 { ts } else { ts.wrapping_sub(prev) };
            data.extend_from_slice(&v.to_be_bytes());
            prev = ts;
        }
        for i in 0..timestamps.len() {
            let p = payloads.get(i).map(Vec::as_slice).unwrap_or(&[]);
            data.extend_from_slice(&(p.len() as u32).to_be_bytes());
            data.extend_from_slice(p);
        }
        Self {
            data,
            ..Default::default()
        }
    }

    /// Wraps encoded bytes received from a storage node
    pub fn from_encoded(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    /// Appends the portable encoding to `dst`
    pub fn marshal_portable(&self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(&self.data);
    }

    /// Decodes the block. Calling it again is a no-op.
    pub fn unmarshal_data(&mut self) -> Result<(), DataError> {
        if self.decoded {
            return Ok(());
        }
        let mut src = self.data.as_slice();
        match src.first() {
            Some(&BLOCK_VERSION) => src = &src[1..],
            other => {
                return Err(DataError::Corrupted {
                    what: "block",
                    reason: format!("unexpected version {:?}", other),
                })
            }
        }
        let rows = take_u32(&mut src, "block row count")? as usize;
        if src.len() < rows * 8 {
            return Err(DataError::Corrupted {
                what: "block timestamps",
                reason: format!("need {} bytes, got {}", rows * 8, src.len()),
            });
        }
        self.timestamps.clear();
        let mut prev = 0i64;
        for (i, chunk) in src[..rows * 8].chunks_exact(8).enumerate() {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            let v = i64::from_be_bytes(raw);
            let ts = if i == 0 { v } else { prev.wrapping_add(v) };
            self.timestamps.push(ts);
            prev = ts;
        }
        src = &src[rows * 8..];
        self.payloads.clear();
        for _ in 0..rows {
            self.payloads.push(take_bytes(&mut src, "block payload")?.to_vec());
        }
        if !src.is_empty() {
            return Err(DataError::Corrupted {
                what: "block",
                reason: format!("{} trailing bytes", src.len()),
            });
        }
        self.decoded = true;
        Ok(())
    }

    /// Number of decoded rows
    pub fn rows(&self) -> usize {
        self.timestamps.len()
    }

    /// Appends decoded rows within `tr` to the destination buffers.
    ///
    /// The block must be decoded first; an undecoded block yields no rows.
    pub fn append_rows_with_time_range_filter(
        &self,
        dst_timestamps: &mut Vec<i64>,
        dst_payloads: &mut Vec<Vec<u8>>,
        tr: TimeRange,
    ) {
        for (ts, payload) in self.timestamps.iter().zip(self.payloads.iter()) {
            if tr.contains(*ts) {
                dst_timestamps.push(*ts);
                dst_payloads.push(payload.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payloads(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("line {}", i).into_bytes()).collect()
    }

    #[test]
    fn test_decode_and_filter() {
        let timestamps = vec![1000, 1500, 2000, 2500, 3000];
        let mut block = Block::from_rows(&timestamps, &payloads(5));
        assert_eq!(block.rows(), 0);
        block.unmarshal_data().unwrap();
        assert_eq!(block.rows(), 5);

        let mut ts = Vec::new();
        let mut ps = Vec::new();
        block.append_rows_with_time_range_filter(&mut ts, &mut ps, TimeRange::new(1500, 2500));
        assert_eq!(ts, vec![1500, 2000, 2500]);
        assert_eq!(ps[0], b"line 1".to_vec());
        assert_eq!(ps.len(), 3);
    }

    #[test]
    fn test_portable_bytes_are_the_encoding() {
        let block = Block::from_rows(&[5, 6], &payloads(2));
        let mut out = Vec::new();
        block.marshal_portable(&mut out);
        let mut copy = Block::from_encoded(out);
        copy.unmarshal_data().unwrap();
        assert_eq!(copy.rows(), 2);
    }

    #[test]
    fn test_corrupted_block() {
        let block = Block::from_rows(&[5, 6], &payloads(2));
        let mut out = Vec::new();
        block.marshal_portable(&mut out);
        out.truncate(out.len() - 2);
        assert!(matches!(
            Block::from_encoded(out).unmarshal_data(),
            Err(DataError::Corrupted { .. })
        ));
        assert!(Block::from_encoded(vec![9]).unmarshal_data().is_err());
    }
}
