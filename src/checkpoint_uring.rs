// io_uring bulk writer for large checkpoint files.
//
// A big sieve can carry millions of surviving candidates; serializing them
// through one synchronous BufWriter leaves the disk idle between writes.
// This path queues the pre-built text blocks at increasing offsets and lets
// the kernel drain them asynchronously.

use io_uring::{IoUring, opcode, types};
use std::collections::VecDeque;
use std::fs::File;
use std::os::unix::io::AsRawFd;

const QUEUE_DEPTH: u32 = 256;
const MAX_IN_FLIGHT: usize = 200; // Backpressure threshold
const BATCH_SIZE: usize = 64; // Submit every N blocks

struct UringBlockWriter {
    ring: IoUring,
    file: File, // Keep file alive to prevent FD from being closed
    pending_buffers: VecDeque<Vec<u8>>,
    offset: u64,
    submitted: usize,
    completed: usize,
}

impl UringBlockWriter {
    fn new(file: File) -> std::io::Result<Self> {
        Ok(Self {
            ring: IoUring::new(QUEUE_DEPTH)?,
            file,
            pending_buffers: VecDeque::new(),
            offset: 0,
            submitted: 0,
            completed: 0,
        })
    }

    /// Queue one write at the current offset (non-blocking).
    fn submit_write(&mut self, data: Vec<u8>) -> std::io::Result<()> {
        let len = data.len();

        let write_op =
            opcode::Write::new(types::Fd(self.file.as_raw_fd()), data.as_ptr(), len as u32)
                .offset(self.offset);

        unsafe {
            self.ring.submission().push(&write_op.build()).map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::Other, "submission queue full")
            })?;
        }

        self.pending_buffers.push_back(data); // Keep buffer alive
        self.offset += len as u64;
        self.submitted += 1;

        Ok(())
    }

    /// Push everything queued so far to the kernel.
    fn submit_batch(&mut self) -> std::io::Result<()> {
        self.ring.submit()?;
        Ok(())
    }

    /// Block until `count` more writes have completed.
    fn wait_completions(&mut self, count: usize) -> std::io::Result<()> {
        for _ in 0..count {
            self.ring.submit_and_wait(1)?;
            let cqe = self
                .ring
                .completion()
                .next()
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "no completion"))?;

            if cqe.result() < 0 {
                return Err(std::io::Error::from_raw_os_error(-cqe.result()));
            }
            self.pending_buffers.pop_front();
            self.completed += 1;
        }
        Ok(())
    }

    fn in_flight(&self) -> usize {
        self.submitted - self.completed
    }
}

/// Write `blocks` to `file` back-to-back starting at offset 0 and wait for
/// every write to land. Returns the file for syncing/renaming.
pub fn write_blocks(file: File, blocks: Vec<Vec<u8>>) -> std::io::Result<File> {
    let mut writer = UringBlockWriter::new(file)?;

    let mut batch_count = 0;
    for block in blocks {
        writer.submit_write(block)?;
        batch_count += 1;

        if batch_count >= BATCH_SIZE {
            writer.submit_batch()?;
            batch_count = 0;
        }

        // Backpressure: cap the number of in-flight writes
        if writer.in_flight() > MAX_IN_FLIGHT {
            writer.wait_completions(100)?;
        }
    }

    writer.submit_batch()?;
    let remaining = writer.in_flight();
    if remaining > 0 {
        writer.wait_completions(remaining)?;
    }

    Ok(writer.file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Read;

    #[test]
    fn test_write_blocks_produces_contiguous_file() {
        let dir = std::env::temp_dir().join(format!("tdsieve_uring_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("blocks.txt");

        let blocks: Vec<Vec<u8>> = (0..10)
            .map(|i| format!("block {} {}\n", i, "x".repeat(100)).into_bytes())
            .collect();
        let expected: Vec<u8> = blocks.iter().flatten().copied().collect();

        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        let file = write_blocks(file, blocks).unwrap();
        file.sync_all().unwrap();
        drop(file);

        let mut content = Vec::new();
        fs::File::open(&path)
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(content, expected);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_write_blocks_handles_many_small_blocks() {
        // More blocks than the batch size and backpressure thresholds
        let dir = std::env::temp_dir().join(format!("tdsieve_uring_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("many.txt");

        let blocks: Vec<Vec<u8>> = (0..500).map(|i| format!("{}\n", i).into_bytes()).collect();
        let expected_len: usize = blocks.iter().map(|b| b.len()).sum();

        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        let file = write_blocks(file, blocks).unwrap();
        drop(file);

        assert_eq!(fs::metadata(&path).unwrap().len() as usize, expected_len);
        fs::remove_file(&path).unwrap();
    }
}
