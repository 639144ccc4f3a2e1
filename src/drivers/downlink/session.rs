use super::protocol::DownlinkChunk;
use super::DownlinkError;
use std::collections::{BTreeSet, VecDeque};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

struct SessionState {
    file: Option<File>,
    pending: VecDeque<u32>,
    unacknowledged: BTreeSet<u32>,
}

/// One file being sent to the ground. The pending queue and the
/// unacknowledged set are guarded internally so the command handler and
/// any transmitting task can share the session.
pub struct DownlinkSession {
    file_id: u32,
    total_size: u64,
    chunk_size: usize,
    num_chunks: u32,
    state: Mutex<SessionState>,
}

impl DownlinkSession {
    pub fn open(file_id: u32, path: &Path, chunk_size: usize) -> Result<Self, DownlinkError> {
        let file = File::open(path)?;
        Self::from_file(file_id, file, chunk_size)
    }

    pub fn from_file(file_id: u32, file: File, chunk_size: usize) -> Result<Self, DownlinkError> {
        if chunk_size == 0 {
            return Err(DownlinkError::InvalidChunkSize(chunk_size));
        }
        let total_size = file.metadata()?.len();
        let num_chunks = u32::try_from(total_size.div_ceil(chunk_size as u64))
            .map_err(|_| DownlinkError::FileTooLarge(total_size))?;

        Ok(Self {
            file_id,
            total_size,
            chunk_size,
            num_chunks,
            state: Mutex::new(SessionState {
                file: Some(file),
                pending: (0..num_chunks).collect(),
                unacknowledged: (0..num_chunks).collect(),
            }),
        })
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn num_chunks(&self) -> u32 {
        self.num_chunks
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn is_open(&self) -> bool {
        self.lock().file.is_some()
    }

    /// Pops the next pending chunk and reads its bytes. Chunks the ground
    /// has acknowledged since they were queued are skipped. `Ok(None)` when
    /// nothing is pending.
    pub fn next_chunk(&self) -> Result<Option<DownlinkChunk>, DownlinkError> {
        let mut state = self.lock();
        let SessionState {
            file,
            pending,
            unacknowledged,
        } = &mut *state;
        let file = file.as_mut().ok_or(DownlinkError::SessionClosed)?;
        let Some(chunk_num) = core::iter::from_fn(|| pending.pop_front())
            .find(|chunk| unacknowledged.contains(chunk))
        else {
            return Ok(None);
        };

        let offset = u64::from(chunk_num) * self.chunk_size as u64;
        let len = (self.total_size - offset).min(self.chunk_size as u64) as usize;
        let mut body = vec![0u8; len];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut body)?;
        Ok(Some(DownlinkChunk { chunk_num, body }))
    }

    /// Queues each named chunk again and marks it unacknowledged. Chunk
    /// numbers past the end are ignored; a chunk already pending is not
    /// queued twice.
    pub fn retransmit(&self, missing: impl IntoIterator<Item = u32>) {
        let mut state = self.lock();
        for chunk in missing {
            if chunk >= self.num_chunks {
                continue;
            }
            if !state.pending.contains(&chunk) {
                state.pending.push_back(chunk);
            }
            state.unacknowledged.insert(chunk);
        }
    }

    /// Puts a chunk that could not be sent back at the head of the queue.
    pub fn requeue_front(&self, chunk_num: u32) {
        let mut state = self.lock();
        if state.file.is_some() && !state.pending.contains(&chunk_num) {
            state.pending.push_front(chunk_num);
        }
    }

    /// Every chunk not named in `missing` has arrived.
    pub fn acknowledge_except(&self, missing: &BTreeSet<u32>) {
        self.lock()
            .unacknowledged
            .retain(|chunk| missing.contains(chunk));
    }

    pub fn pending(&self) -> Vec<u32> {
        self.lock().pending.iter().copied().collect()
    }

    pub fn unacknowledged(&self) -> BTreeSet<u32> {
        self.lock().unacknowledged.clone()
    }

    /// Drops the file handle. Later reads fail with `SessionClosed`.
    pub fn close(&self) {
        let mut state = self.lock();
        state.file = None;
        state.pending.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
