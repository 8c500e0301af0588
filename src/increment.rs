//! # Block Increments
//!
//! An increment stores only the blocks of a file that differ from the
//! ancestor's copy. Body layout, all integers little-endian:
//!
//! ```text
//! "BLZINC01" | u32 block_size | u64 file_size | u32 n | n × u32 block index | u32 crc32(header)
//! n × block data (the final block of the file is stored at its real length)
//! ```
//!
//! Applying an increment resizes the target to `file_size` and overwrites the
//! listed blocks; every other block is taken from the restored ancestor.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crc32fast::Hasher as Crc32Hasher;

use crate::backup::BlockDigests;
use crate::error::{BackupError, Result};

pub const INCREMENT_MAGIC: &[u8; 8] = b"BLZINC01";

/// First 8 bytes of the block's blake3 hash.
pub fn block_digest(block: &[u8]) -> u64 {
    let hash = blake3::hash(block);
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(head)
}

/// Reads until `buf` is full or the reader is exhausted.
pub(crate) fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Whole-file fingerprint and per-block digests, from a single read pass.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub fingerprint: String,
    pub size: u64,
    pub blocks: BlockDigests,
}

pub fn scan_blocks(reader: &mut impl Read, block_size: u32) -> io::Result<ScannedFile> {
    let mut hasher = blake3::Hasher::new();
    let mut digests = Vec::new();
    let mut buf = vec![0u8; block_size as usize];
    let mut size = 0u64;
    loop {
        let n = read_full(reader, &mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        digests.push(block_digest(&buf[..n]));
        size += n as u64;
        if n < buf.len() {
            break;
        }
    }
    Ok(ScannedFile {
        fingerprint: hasher.finalize().to_hex().to_string(),
        size,
        blocks: BlockDigests { block_size, digests },
    })
}

/// Which blocks of a file must be stored to rebuild it from the ancestor.
#[derive(Debug, Clone)]
pub struct IncrementPlan {
    pub block_size: u32,
    pub file_size: u64,
    pub changed: Vec<u32>,
    pub scanned: ScannedFile,
}

impl IncrementPlan {
    /// Scans `file` and compares it with the ancestor's digests. Blocks past
    /// the ancestor's end are always changed.
    pub fn build(file: &mut File, base: &BlockDigests) -> io::Result<Self> {
        file.seek(SeekFrom::Start(0))?;
        let scanned = scan_blocks(file, base.block_size)?;
        let changed = scanned
            .blocks
            .digests
            .iter()
            .enumerate()
            .filter(|(idx, digest)| base.digests.get(*idx) != Some(*digest))
            .map(|(idx, _)| idx as u32)
            .collect();
        Ok(Self { block_size: base.block_size, file_size: scanned.size, changed, scanned })
    }

    fn block_len(&self, idx: u32) -> u64 {
        let start = idx as u64 * self.block_size as u64;
        (self.file_size - start).min(self.block_size as u64)
    }

    pub fn header_bytes(&self) -> Vec<u8> {
        let mut header = Vec::with_capacity(28 + 4 * self.changed.len());
        header.extend_from_slice(INCREMENT_MAGIC);
        header.extend_from_slice(&self.block_size.to_le_bytes());
        header.extend_from_slice(&self.file_size.to_le_bytes());
        header.extend_from_slice(&(self.changed.len() as u32).to_le_bytes());
        for idx in &self.changed {
            header.extend_from_slice(&idx.to_le_bytes());
        }
        let mut crc = Crc32Hasher::new();
        crc.update(&header);
        header.extend_from_slice(&crc.finalize().to_le_bytes());
        header
    }

    /// Size of the whole increment body.
    pub fn encoded_len(&self) -> u64 {
        let header = 8 + 4 + 8 + 4 + 4 * self.changed.len() as u64 + 4;
        header + self.changed.iter().map(|idx| self.block_len(*idx)).sum::<u64>()
    }

    /// Writes header and changed blocks. Blocks that shrank since the scan are
    /// zero-padded so the body keeps its announced length.
    pub fn write_body(&self, file: &mut File, out: &mut impl Write) -> io::Result<()> {
        out.write_all(&self.header_bytes())?;
        let mut buf = vec![0u8; self.block_size as usize];
        for idx in &self.changed {
            let len = self.block_len(*idx) as usize;
            file.seek(SeekFrom::Start(*idx as u64 * self.block_size as u64))?;
            let n = read_full(file, &mut buf[..len])?;
            buf[n..len].fill(0);
            out.write_all(&buf[..len])?;
        }
        Ok(())
    }
}

fn invalid(path: &str, reason: impl Into<String>) -> BackupError {
    BackupError::InvalidIncrement { path: path.to_string(), reason: reason.into() }
}

/// Applies an increment body read from `body` on top of the file at `target`.
/// `archive_path` is only used for error messages.
pub fn apply_increment(body: &mut impl Read, target: &Path, archive_path: &str) -> Result<()> {
    let mut fixed = [0u8; 24];
    body.read_exact(&mut fixed).map_err(|_| invalid(archive_path, "truncated header"))?;
    if &fixed[..8] != INCREMENT_MAGIC {
        return Err(invalid(archive_path, "bad magic"));
    }
    let block_size = u32::from_le_bytes([fixed[8], fixed[9], fixed[10], fixed[11]]);
    let mut size_bytes = [0u8; 8];
    size_bytes.copy_from_slice(&fixed[12..20]);
    let file_size = u64::from_le_bytes(size_bytes);
    let count = u32::from_le_bytes([fixed[20], fixed[21], fixed[22], fixed[23]]) as usize;
    if block_size == 0 {
        return Err(invalid(archive_path, "zero block size"));
    }

    let mut index_bytes = vec![0u8; 4 * count + 4];
    body.read_exact(&mut index_bytes).map_err(|_| invalid(archive_path, "truncated block map"))?;
    let (map, crc_bytes) = index_bytes.split_at(4 * count);
    let mut crc = Crc32Hasher::new();
    crc.update(&fixed);
    crc.update(map);
    if crc.finalize().to_le_bytes() != crc_bytes {
        return Err(invalid(archive_path, "header checksum mismatch"));
    }
    let blocks: Vec<u32> = map
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let mut out = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(target)
        .map_err(|e| BackupError::io(e, target))?;
    out.set_len(file_size).map_err(|e| BackupError::io(e, target))?;

    let mut buf = vec![0u8; block_size as usize];
    for idx in blocks {
        let start = idx as u64 * block_size as u64;
        if start >= file_size {
            return Err(invalid(archive_path, format!("block {idx} beyond end of file")));
        }
        let len = (file_size - start).min(block_size as u64) as usize;
        body.read_exact(&mut buf[..len]).map_err(|_| invalid(archive_path, "truncated block data"))?;
        out.seek(SeekFrom::Start(start)).map_err(|e| BackupError::io(e, target))?;
        out.write_all(&buf[..len]).map_err(|e| BackupError::io(e, target))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const BS: u32 = 512;

    fn blocks(fill: &[u8]) -> Vec<u8> {
        fill.iter().flat_map(|b| vec![*b; BS as usize]).collect()
    }

    #[test]
    fn only_changed_blocks_are_stored() {
        let dir = tempdir().unwrap();
        let old_path = dir.path().join("old");
        let new_path = dir.path().join("new");
        let old = blocks(b"abcd");
        let mut new = blocks(b"abXd");
        new.extend_from_slice(&[7u8; 100]); // grew by a partial block
        fs::write(&old_path, &old).unwrap();
        fs::write(&new_path, &new).unwrap();

        let base = scan_blocks(&mut File::open(&old_path).unwrap(), BS).unwrap().blocks;
        let mut file = File::open(&new_path).unwrap();
        let plan = IncrementPlan::build(&mut file, &base).unwrap();
        assert_eq!(plan.changed, vec![2, 4]);
        assert_eq!(plan.file_size, new.len() as u64);

        let mut body = Vec::new();
        plan.write_body(&mut file, &mut body).unwrap();
        assert_eq!(body.len() as u64, plan.encoded_len());

        // Restore on top of the old copy.
        let restored = dir.path().join("restored");
        fs::copy(&old_path, &restored).unwrap();
        apply_increment(&mut body.as_slice(), &restored, "new").unwrap();
        assert_eq!(fs::read(&restored).unwrap(), new);
    }

    #[test]
    fn shrinking_file_is_truncated() {
        let dir = tempdir().unwrap();
        let old_path = dir.path().join("old");
        let new_path = dir.path().join("new");
        fs::write(&old_path, blocks(b"abcd")).unwrap();
        fs::write(&new_path, blocks(b"ab")).unwrap();

        let base = scan_blocks(&mut File::open(&old_path).unwrap(), BS).unwrap().blocks;
        let mut file = File::open(&new_path).unwrap();
        let plan = IncrementPlan::build(&mut file, &base).unwrap();
        assert!(plan.changed.is_empty());
        let mut body = Vec::new();
        plan.write_body(&mut file, &mut body).unwrap();

        apply_increment(&mut body.as_slice(), &old_path, "new").unwrap();
        assert_eq!(fs::read(&old_path).unwrap(), blocks(b"ab"));
    }

    #[test]
    fn corrupt_header_is_rejected() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("t");
        let plan = IncrementPlan {
            block_size: BS,
            file_size: BS as u64,
            changed: vec![0],
            scanned: scan_blocks(&mut blocks(b"z").as_slice(), BS).unwrap(),
        };
        let mut body = plan.header_bytes();
        body.extend_from_slice(&blocks(b"z"));
        body[13] ^= 0xff;
        let err = apply_increment(&mut body.as_slice(), &target, "t").unwrap_err();
        assert!(matches!(err, BackupError::InvalidIncrement { .. }));

        let err = apply_increment(&mut &b"NOTMAGIC"[..], &target, "t").unwrap_err();
        assert!(matches!(err, BackupError::InvalidIncrement { .. }));
    }

    #[test]
    fn scan_fingerprint_matches_blake3() {
        let data = blocks(b"xyz");
        let scanned = scan_blocks(&mut data.as_slice(), BS).unwrap();
        assert_eq!(scanned.fingerprint, blake3::hash(&data).to_hex().to_string());
        assert_eq!(scanned.blocks.digests.len(), 3);
        assert_eq!(scanned.size, data.len() as u64);
    }
}
