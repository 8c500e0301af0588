//! One output stream: a worker thread that spools a zstd-compressed tar to a
//! temp file and uploads it when its queue closes.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::{ComposeFileInfo, TarFileSetRegistry};
use crate::backup::{Backup, BlockDigests, FileDescription};
use crate::config::PathRules;
use crate::error::{BackupError, Result};
use crate::increment::{block_digest, IncrementPlan};
use crate::progress::StreamMetrics;

/// PAX key naming how a regular entry's body is to be read.
pub const ENTRY_KIND_KEY: &str = "BLITZ.kind";
pub(crate) const KIND_FULL: &str = "full";
pub(crate) const KIND_MARKER: &str = "marker";
pub(crate) const KIND_INCREMENT: &str = "increment";

/// Object name of the stream at `index` (0-based); names are 1-based.
pub fn stream_name(index: usize) -> String {
    format!("part_{:03}.tar.zst", index + 1)
}

pub(crate) enum StreamJob {
    File(ComposeFileInfo),
    Header { archive_path: String, header: tar::Header, link_target: Option<PathBuf> },
}

/// What a worker needs besides its queue.
pub(crate) struct StreamContext {
    pub name: String,
    pub key: String,
    pub backup: Backup,
    pub zstd_level: i32,
    pub block_size: u32,
    pub rules: Arc<PathRules>,
    pub registry: Arc<TarFileSetRegistry>,
    pub cancel: Arc<AtomicBool>,
    pub metrics: Arc<StreamMetrics>,
}

/// A stream that was uploaded.
#[derive(Debug, Clone)]
pub(crate) struct StreamOutcome {
    pub name: String,
    pub key: String,
    pub files: u64,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
}

/// Counts bytes passing into the compressor.
struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Per-block digests accumulated from a byte stream in arbitrary chunks.
struct BlockAccumulator {
    block_size: usize,
    pending: Vec<u8>,
    digests: Vec<u64>,
}

impl BlockAccumulator {
    fn new(block_size: u32) -> Self {
        Self { block_size: block_size as usize, pending: Vec::with_capacity(block_size as usize), digests: Vec::new() }
    }

    fn feed(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (self.block_size - self.pending.len()).min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.pending.len() == self.block_size {
                self.digests.push(block_digest(&self.pending));
                self.pending.clear();
            }
        }
    }

    fn finish(mut self) -> Vec<u64> {
        if !self.pending.is_empty() {
            self.digests.push(block_digest(&self.pending));
        }
        self.digests
    }
}

/// Body of a full entry: exactly `size` bytes from the file, zero-padded if
/// it shrank after its header was built. Fingerprints what it yields.
struct FullBody {
    file: File,
    remaining: u64,
    padded: u64,
    hasher: blake3::Hasher,
    blocks: Option<BlockAccumulator>,
}

impl Read for FullBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = self.remaining.min(buf.len() as u64) as usize;
        let mut n = self.file.read(&mut buf[..want])?;
        if n == 0 {
            buf[..want].fill(0);
            n = want;
            self.padded += n as u64;
        }
        self.remaining -= n as u64;
        self.hasher.update(&buf[..n]);
        if let Some(blocks) = self.blocks.as_mut() {
            blocks.feed(&buf[..n]);
        }
        Ok(n)
    }
}

type StreamBuilder = tar::Builder<CountingWriter<zstd::Encoder<'static, File>>>;

struct StreamWriter {
    ctx: StreamContext,
    spool: NamedTempFile,
    builder: StreamBuilder,
    files: u64,
}

impl StreamWriter {
    fn open(ctx: StreamContext) -> io::Result<Self> {
        let spool = NamedTempFile::new()?;
        let mut encoder = zstd::Encoder::new(spool.reopen()?, ctx.zstd_level)?;
        encoder.include_checksum(true)?;
        let mut builder = tar::Builder::new(CountingWriter { inner: encoder, written: 0 });
        builder.mode(tar::HeaderMode::Complete);
        Ok(Self { ctx, spool, builder, files: 0 })
    }

    fn write(&mut self, job: StreamJob) -> io::Result<()> {
        match job {
            StreamJob::File(info) => self.write_file(info),
            StreamJob::Header { archive_path, mut header, link_target } => {
                match link_target {
                    Some(target) => self.builder.append_link(&mut header, &archive_path, &target)?,
                    None => {
                        header.set_size(0);
                        self.builder.append_data(&mut header, &archive_path, io::empty())?;
                    }
                }
                self.ctx.registry.record(&self.ctx.name, &archive_path);
                Ok(())
            }
        }
    }

    fn write_file(&mut self, info: ComposeFileInfo) -> io::Result<()> {
        let path = info.archive_path.clone();
        if info.was_in_base {
            if let Some(base) = info.base_description.clone() {
                return self.write_marker(info, base);
            }
        }

        let mut file = match File::open(&info.abs_path) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path, error = %e, "file vanished before it could be read, excluded");
                self.ctx.registry.exclude(&path);
                return Ok(());
            }
        };

        let base_blocks = info
            .base_description
            .as_ref()
            .and_then(|d| d.block_digests.clone())
            .filter(|_| info.is_incremented);
        match base_blocks {
            Some(base) => self.write_increment(info, &mut file, &base),
            None => self.write_full(info, file),
        }
    }

    fn write_marker(&mut self, info: ComposeFileInfo, base: FileDescription) -> io::Result<()> {
        let mut header = info.header;
        header.set_size(0);
        self.builder.append_pax_extensions([(ENTRY_KIND_KEY, KIND_MARKER.as_bytes())])?;
        self.builder.append_data(&mut header, &info.archive_path, io::empty())?;
        let description = FileDescription { was_in_base: true, is_incremented: false, is_skipped: false, ..base };
        self.finish_entry(&info.archive_path, description);
        self.ctx.metrics.record_marker();
        Ok(())
    }

    fn write_increment(
        &mut self,
        info: ComposeFileInfo,
        file: &mut File,
        base: &BlockDigests,
    ) -> io::Result<()> {
        let plan = IncrementPlan::build(file, base)?;
        let mut body = tempfile::tempfile()?;
        plan.write_body(file, &mut body)?;
        body.seek(SeekFrom::Start(0))?;

        let encoded = plan.encoded_len();
        let mut header = info.header;
        header.set_size(encoded);
        self.builder.append_pax_extensions([(ENTRY_KIND_KEY, KIND_INCREMENT.as_bytes())])?;
        self.builder.append_data(&mut header, &info.archive_path, &mut body)?;
        debug!(path = %info.archive_path, changed = plan.changed.len(), "increment written");

        let description = FileDescription {
            fingerprint: plan.scanned.fingerprint,
            size: plan.file_size,
            mtime: info.meta.mtime,
            is_incremented: true,
            is_skipped: false,
            was_in_base: false,
            block_digests: Some(plan.scanned.blocks),
        };
        self.finish_entry(&info.archive_path, description);
        self.ctx.metrics.record_increment(encoded);
        Ok(())
    }

    fn write_full(&mut self, info: ComposeFileInfo, file: File) -> io::Result<()> {
        let size = info.header.entry_size()?;
        let diffable = self.ctx.rules.is_diffable(&info.archive_path);
        let mut body = FullBody {
            file,
            remaining: size,
            padded: 0,
            hasher: blake3::Hasher::new(),
            blocks: diffable.then(|| BlockAccumulator::new(self.ctx.block_size)),
        };

        let mut header = info.header;
        self.builder.append_pax_extensions([(ENTRY_KIND_KEY, KIND_FULL.as_bytes())])?;
        self.builder.append_data(&mut header, &info.archive_path, &mut body)?;
        if body.padded > 0 {
            warn!(path = %info.archive_path, padded = body.padded, "file shrank while being archived, zero-padded");
        }

        let block_size = self.ctx.block_size;
        let description = FileDescription {
            fingerprint: body.hasher.finalize().to_hex().to_string(),
            size,
            mtime: info.meta.mtime,
            is_incremented: false,
            is_skipped: false,
            was_in_base: false,
            block_digests: body
                .blocks
                .map(|b| BlockDigests { block_size, digests: b.finish() }),
        };
        self.finish_entry(&info.archive_path, description);
        self.ctx.metrics.record_full(size);
        Ok(())
    }

    fn finish_entry(&mut self, archive_path: &str, description: FileDescription) {
        self.ctx.registry.record(&self.ctx.name, archive_path);
        self.ctx.registry.describe(archive_path, description);
        self.files += 1;
    }

    /// Finishes the tar and zstd frames and uploads the spool.
    fn close(self) -> Result<StreamOutcome> {
        let StreamWriter { ctx, spool, builder, files } = self;
        let counting = builder.into_inner().map_err(|e| BackupError::io(e, spool.path()))?;
        let uncompressed_size = counting.written;
        let mut out = counting.inner.finish().map_err(|e| BackupError::io(e, spool.path()))?;
        out.flush().map_err(|e| BackupError::io(e, spool.path()))?;
        let compressed_size = out.seek(SeekFrom::End(0)).map_err(|e| BackupError::io(e, spool.path()))?;
        out.seek(SeekFrom::Start(0)).map_err(|e| BackupError::io(e, spool.path()))?;

        if ctx.cancel.load(Ordering::SeqCst) {
            return Err(BackupError::Cancelled);
        }
        ctx.backup.folder().put_object(&ctx.key, &mut out)?;
        debug!(stream = %ctx.name, files, compressed_size, "stream uploaded");
        Ok(StreamOutcome { name: ctx.name, key: ctx.key, files, uncompressed_size, compressed_size })
    }
}

/// Worker body. Returns an error if this stream failed or the run was
/// cancelled; in both cases nothing is uploaded.
pub(crate) fn run_stream(ctx: StreamContext, jobs: Receiver<StreamJob>) -> Result<StreamOutcome> {
    let name = ctx.name.clone();
    let cancel = ctx.cancel.clone();
    let fail = |reason: String| {
        cancel.store(true, Ordering::SeqCst);
        BackupError::StreamFailed { stream: name.clone(), reason }
    };

    let mut writer = StreamWriter::open(ctx).map_err(|e| fail(e.to_string()))?;
    for job in jobs.iter() {
        if cancel.load(Ordering::SeqCst) {
            return Err(BackupError::Cancelled);
        }
        writer.write(job).map_err(|e| fail(e.to_string()))?;
    }
    if cancel.load(Ordering::SeqCst) {
        return Err(BackupError::Cancelled);
    }
    match writer.close() {
        Err(BackupError::Cancelled) => Err(BackupError::Cancelled),
        Err(other) => Err(fail(other.to_string())),
        ok => ok,
    }
}
