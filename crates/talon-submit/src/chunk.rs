//! Untrusted submission payload decoding.
//!
//! A submission arrives as one little-endian byte buffer: a fixed header
//! followed by `chunk_count` length-prefixed chunks. Every chunk payload is
//! copied into an owned buffer sized by the caller-declared length before a
//! single field of it is read, and fixed-shape chunk kinds are checked
//! against their minimum size. Buffer handles named by the resource list
//! are resolved eagerly, which pins the buffers (`Arc` clone) against
//! destruction for the rest of the admission. Failing partway through
//! simply drops the partially built [`DecodedSubmission`], releasing every
//! pin taken so far.

use talon_mem::{BufferRef, BufferTable};

use crate::context::QueueSelector;
use crate::error::{Result, SubmitError};

pub const CHUNK_WORK: u32 = 1;
pub const CHUNK_RESOURCES: u32 = 2;
pub const CHUNK_USER_FENCE: u32 = 3;
pub const CHUNK_DEPS: u32 = 4;
pub const CHUNK_SYNC_IN: u32 = 5;
pub const CHUNK_SYNC_OUT: u32 = 6;

pub const SUBMISSION_HEADER_BYTES: u32 = 8;
pub const CHUNK_HEADER_BYTES: u32 = 8;
pub const WORK_DESC_BYTES: u32 = 32;
pub const RESOURCE_LIST_HEADER_BYTES: u32 = 8;
pub const RESOURCE_ENTRY_BYTES: u32 = 16;
pub const USER_FENCE_BYTES: u32 = 16;
pub const DEP_ENTRY_BYTES: u32 = 24;
pub const SYNC_ENTRY_BYTES: u32 = 8;

/// Resource-list entry flag: the job writes the buffer.
pub const RESOURCE_FLAG_WRITE: u32 = 1 << 0;

/// User-fence target buffers must be exactly one page.
pub const USER_FENCE_PAGE_BYTES: u64 = 4096;

/// One work item, bound for a specific engine queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDesc {
    pub queue: QueueSelector,
    pub flags: u32,
    pub cmd_va: u64,
    pub cmd_size_bytes: u32,
}

/// A named buffer plus its per-submission metadata, with the buffer
/// already resolved and pinned.
#[derive(Debug, Clone)]
pub struct ResourceEntry {
    pub handle: u32,
    pub bo: BufferRef,
    pub priority: u32,
    pub write: bool,
}

#[derive(Debug, Clone)]
pub struct UserFence {
    pub bo: BufferRef,
    pub offset: u64,
}

/// An explicit dependency on a prior submission, named by fence point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepEntry {
    pub context_id: u32,
    pub queue: QueueSelector,
    pub sequence: u64,
}

/// Fully decoded, typed submission. Transient: lives for one admission.
#[derive(Debug)]
pub struct DecodedSubmission {
    pub context_id: u32,
    pub work: Vec<WorkDesc>,
    pub resources: Vec<ResourceEntry>,
    pub user_fence: Option<UserFence>,
    pub deps: Vec<DepEntry>,
    pub sync_in: Vec<u32>,
    pub sync_out: Vec<u32>,
}

impl DecodedSubmission {
    /// The single queue every work descriptor targets.
    pub fn queue(&self) -> QueueSelector {
        self.work[0].queue
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or(SubmitError::Truncated(what))?;
        if end > self.buf.len() {
            return Err(SubmitError::Truncated(what));
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self, what: &'static str) -> Result<u32> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self, what: &'static str) -> Result<u64> {
        let b = self.take(8, what)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

fn require_min(kind: u32, len: u32, min: u32) -> Result<()> {
    if len < min {
        return Err(SubmitError::ChunkTooShort { kind, len, min });
    }
    Ok(())
}

fn entry_count(kind: u32, len: u32, entry: u32) -> Result<usize> {
    if len == 0 || len % entry != 0 {
        return Err(SubmitError::ChunkBadArrayLength { kind, len, entry });
    }
    Ok((len / entry) as usize)
}

fn decode_work(payload: &[u8]) -> Result<WorkDesc> {
    let mut r = Reader::new(payload);
    let engine_class = r.u32("work.engine_class")?;
    let engine_instance = r.u32("work.engine_instance")?;
    let queue_index = r.u32("work.queue_index")?;
    let flags = r.u32("work.flags")?;
    let cmd_va = r.u64("work.cmd_va")?;
    let cmd_size_bytes = r.u32("work.cmd_size_bytes")?;
    let _pad = r.u32("work.pad")?;
    Ok(WorkDesc {
        queue: QueueSelector {
            engine_class,
            engine_instance,
            index: queue_index,
        },
        flags,
        cmd_va,
        cmd_size_bytes,
    })
}

fn decode_resources(payload: &[u8], buffers: &BufferTable) -> Result<Vec<ResourceEntry>> {
    let mut r = Reader::new(payload);
    let count = r.u32("resource_list.count")? as usize;
    let _pad = r.u32("resource_list.pad")?;

    let declared = payload.len() - RESOURCE_LIST_HEADER_BYTES as usize;
    let needed = count
        .checked_mul(RESOURCE_ENTRY_BYTES as usize)
        .ok_or(SubmitError::Truncated("resource_list.count"))?;
    if declared < needed {
        return Err(SubmitError::Truncated("resource_list.entries"));
    }

    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let handle = r.u32("resource.handle")?;
        let priority = r.u32("resource.priority")?;
        let flags = r.u32("resource.flags")?;
        let _pad = r.u32("resource.pad")?;
        let bo = buffers
            .lookup(handle)
            .ok_or(SubmitError::UnknownHandle { handle })?;
        out.push(ResourceEntry {
            handle,
            bo,
            priority,
            write: flags & RESOURCE_FLAG_WRITE != 0,
        });
    }
    Ok(out)
}

fn decode_user_fence(payload: &[u8], buffers: &BufferTable) -> Result<UserFence> {
    let mut r = Reader::new(payload);
    let handle = r.u32("user_fence.handle")?;
    let _pad = r.u32("user_fence.pad")?;
    let offset = r.u64("user_fence.offset")?;

    let bo = buffers
        .lookup(handle)
        .ok_or(SubmitError::UnknownHandle { handle })?;
    if bo.size_bytes() != USER_FENCE_PAGE_BYTES {
        return Err(SubmitError::BadUserFence {
            reason: "target buffer must be exactly one page",
        });
    }
    if offset.checked_add(8).map_or(true, |end| end > bo.size_bytes()) {
        return Err(SubmitError::BadUserFence {
            reason: "fence slot does not fit inside the buffer",
        });
    }
    if bo.is_user_backed() {
        return Err(SubmitError::BadUserFence {
            reason: "target buffer must not be user-backed",
        });
    }
    Ok(UserFence { bo, offset })
}

fn decode_deps(payload: &[u8]) -> Result<Vec<DepEntry>> {
    let count = entry_count(CHUNK_DEPS, payload.len() as u32, DEP_ENTRY_BYTES)?;
    let mut r = Reader::new(payload);
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let context_id = r.u32("dep.context_id")?;
        let engine_class = r.u32("dep.engine_class")?;
        let engine_instance = r.u32("dep.engine_instance")?;
        let queue_index = r.u32("dep.queue_index")?;
        let sequence = r.u64("dep.sequence")?;
        out.push(DepEntry {
            context_id,
            queue: QueueSelector {
                engine_class,
                engine_instance,
                index: queue_index,
            },
            sequence,
        });
    }
    Ok(out)
}

fn decode_sync_handles(kind: u32, payload: &[u8]) -> Result<Vec<u32>> {
    let count = entry_count(kind, payload.len() as u32, SYNC_ENTRY_BYTES)?;
    let mut r = Reader::new(payload);
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let handle = r.u32("sync.handle")?;
        let _pad = r.u32("sync.pad")?;
        out.push(handle);
    }
    Ok(out)
}

/// Decode and validate an untrusted submission payload.
///
/// Buffer handles are resolved through `buffers` as they are seen, so a
/// returned [`DecodedSubmission`] holds every named buffer alive. Any
/// validation failure discards all partially decoded state.
pub fn decode_submission(bytes: &[u8], buffers: &BufferTable) -> Result<DecodedSubmission> {
    let mut r = Reader::new(bytes);
    let context_id = r.u32("header.context_id")?;
    let chunk_count = r.u32("header.chunk_count")?;

    let mut decoded = DecodedSubmission {
        context_id,
        work: Vec::new(),
        resources: Vec::new(),
        user_fence: None,
        deps: Vec::new(),
        sync_in: Vec::new(),
        sync_out: Vec::new(),
    };
    let mut have_resources = false;

    for _ in 0..chunk_count {
        let kind = r.u32("chunk.kind")?;
        let len = r.u32("chunk.len")?;
        // Copy first, parse from the owned bytes only.
        let payload = r.take(len as usize, "chunk.payload")?.to_vec();

        match kind {
            CHUNK_WORK => {
                require_min(kind, len, WORK_DESC_BYTES)?;
                decoded.work.push(decode_work(&payload)?);
            }
            CHUNK_RESOURCES => {
                require_min(kind, len, RESOURCE_LIST_HEADER_BYTES)?;
                if have_resources {
                    return Err(SubmitError::DuplicateChunk { kind });
                }
                have_resources = true;
                decoded.resources = decode_resources(&payload, buffers)?;
            }
            CHUNK_USER_FENCE => {
                require_min(kind, len, USER_FENCE_BYTES)?;
                if decoded.user_fence.is_some() {
                    return Err(SubmitError::DuplicateChunk { kind });
                }
                decoded.user_fence = Some(decode_user_fence(&payload, buffers)?);
            }
            CHUNK_DEPS => {
                require_min(kind, len, DEP_ENTRY_BYTES)?;
                decoded.deps.extend(decode_deps(&payload)?);
            }
            CHUNK_SYNC_IN => {
                require_min(kind, len, SYNC_ENTRY_BYTES)?;
                decoded
                    .sync_in
                    .extend(decode_sync_handles(kind, &payload)?);
            }
            CHUNK_SYNC_OUT => {
                require_min(kind, len, SYNC_ENTRY_BYTES)?;
                decoded
                    .sync_out
                    .extend(decode_sync_handles(kind, &payload)?);
            }
            _ => return Err(SubmitError::UnknownChunkKind { kind }),
        }
    }

    if decoded.work.is_empty() {
        return Err(SubmitError::NoWork);
    }
    let queue = decoded.work[0].queue;
    if decoded.work.iter().any(|w| w.queue != queue) {
        return Err(SubmitError::QueueMismatch);
    }

    Ok(decoded)
}

/// Userspace-side payload builder. The decoder's tests and embedding
/// userspace libraries share it; the kernel-side path never uses it.
#[derive(Debug, Default)]
pub struct SubmissionBuilder {
    context_id: u32,
    chunks: Vec<(u32, Vec<u8>)>,
}

impl SubmissionBuilder {
    pub fn new(context_id: u32) -> Self {
        Self {
            context_id,
            chunks: Vec::new(),
        }
    }

    pub fn work(mut self, queue: QueueSelector, cmd_va: u64, cmd_size_bytes: u32) -> Self {
        let mut p = Vec::with_capacity(WORK_DESC_BYTES as usize);
        p.extend_from_slice(&queue.engine_class.to_le_bytes());
        p.extend_from_slice(&queue.engine_instance.to_le_bytes());
        p.extend_from_slice(&queue.index.to_le_bytes());
        p.extend_from_slice(&0u32.to_le_bytes());
        p.extend_from_slice(&cmd_va.to_le_bytes());
        p.extend_from_slice(&cmd_size_bytes.to_le_bytes());
        p.extend_from_slice(&0u32.to_le_bytes());
        self.chunks.push((CHUNK_WORK, p));
        self
    }

    pub fn resources(mut self, entries: &[(u32, u32)]) -> Self {
        let mut p = Vec::new();
        p.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        p.extend_from_slice(&0u32.to_le_bytes());
        for &(handle, flags) in entries {
            p.extend_from_slice(&handle.to_le_bytes());
            p.extend_from_slice(&0u32.to_le_bytes()); // priority
            p.extend_from_slice(&flags.to_le_bytes());
            p.extend_from_slice(&0u32.to_le_bytes());
        }
        self.chunks.push((CHUNK_RESOURCES, p));
        self
    }

    pub fn user_fence(mut self, handle: u32, offset: u64) -> Self {
        let mut p = Vec::with_capacity(USER_FENCE_BYTES as usize);
        p.extend_from_slice(&handle.to_le_bytes());
        p.extend_from_slice(&0u32.to_le_bytes());
        p.extend_from_slice(&offset.to_le_bytes());
        self.chunks.push((CHUNK_USER_FENCE, p));
        self
    }

    pub fn dep(mut self, context_id: u32, queue: QueueSelector, sequence: u64) -> Self {
        let mut p = Vec::with_capacity(DEP_ENTRY_BYTES as usize);
        p.extend_from_slice(&context_id.to_le_bytes());
        p.extend_from_slice(&queue.engine_class.to_le_bytes());
        p.extend_from_slice(&queue.engine_instance.to_le_bytes());
        p.extend_from_slice(&queue.index.to_le_bytes());
        p.extend_from_slice(&sequence.to_le_bytes());
        self.chunks.push((CHUNK_DEPS, p));
        self
    }

    pub fn sync_in(self, handle: u32) -> Self {
        self.sync_handle(CHUNK_SYNC_IN, handle)
    }

    pub fn sync_out(self, handle: u32) -> Self {
        self.sync_handle(CHUNK_SYNC_OUT, handle)
    }

    fn sync_handle(mut self, kind: u32, handle: u32) -> Self {
        let mut p = Vec::with_capacity(SYNC_ENTRY_BYTES as usize);
        p.extend_from_slice(&handle.to_le_bytes());
        p.extend_from_slice(&0u32.to_le_bytes());
        self.chunks.push((kind, p));
        self
    }

    /// Append a raw chunk verbatim. Test hook for malformed payloads.
    pub fn raw_chunk(mut self, kind: u32, payload: Vec<u8>) -> Self {
        self.chunks.push((kind, payload));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.context_id.to_le_bytes());
        out.extend_from_slice(&(self.chunks.len() as u32).to_le_bytes());
        for (kind, payload) in self.chunks {
            out.extend_from_slice(&kind.to_le_bytes());
            out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            out.extend_from_slice(&payload);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use talon_mem::{BufferDesc, MemDomain};

    fn q() -> QueueSelector {
        QueueSelector {
            engine_class: 0,
            engine_instance: 0,
            index: 0,
        }
    }

    fn table_with_buffer(size: u64, user_backed: bool) -> (BufferTable, u32) {
        let table = BufferTable::new();
        let mut desc = BufferDesc::new(size, MemDomain::GTT, MemDomain::GTT);
        desc.user_backed = user_backed;
        let (handle, _) = table.create(desc);
        (table, handle)
    }

    #[test]
    fn round_trip_of_a_full_submission() {
        let (table, handle) = table_with_buffer(4096, false);
        let bytes = SubmissionBuilder::new(3)
            .work(q(), 0x1000, 256)
            .resources(&[(handle, RESOURCE_FLAG_WRITE)])
            .user_fence(handle, 8)
            .dep(3, q(), 17)
            .sync_in(5)
            .sync_out(6)
            .build();

        let decoded = decode_submission(&bytes, &table).unwrap();
        assert_eq!(decoded.context_id, 3);
        assert_eq!(decoded.work.len(), 1);
        assert_eq!(decoded.work[0].cmd_va, 0x1000);
        assert_eq!(decoded.work[0].cmd_size_bytes, 256);
        assert_eq!(decoded.resources.len(), 1);
        assert!(decoded.resources[0].write);
        assert_eq!(decoded.user_fence.as_ref().unwrap().offset, 8);
        assert_eq!(
            decoded.deps,
            vec![DepEntry {
                context_id: 3,
                queue: q(),
                sequence: 17
            }]
        );
        assert_eq!(decoded.sync_in, vec![5]);
        assert_eq!(decoded.sync_out, vec![6]);
    }

    #[test]
    fn unknown_chunk_kind_is_rejected() {
        let (table, _) = table_with_buffer(4096, false);
        let bytes = SubmissionBuilder::new(0)
            .work(q(), 0, 0)
            .raw_chunk(0x77, vec![0; 8])
            .build();
        assert_eq!(
            decode_submission(&bytes, &table).unwrap_err(),
            SubmitError::UnknownChunkKind { kind: 0x77 }
        );
    }

    #[test]
    fn short_fixed_shape_chunk_is_rejected() {
        let (table, _) = table_with_buffer(4096, false);
        let bytes = SubmissionBuilder::new(0)
            .raw_chunk(CHUNK_USER_FENCE, vec![0; USER_FENCE_BYTES as usize - 1])
            .build();
        assert_eq!(
            decode_submission(&bytes, &table).unwrap_err(),
            SubmitError::ChunkTooShort {
                kind: CHUNK_USER_FENCE,
                len: USER_FENCE_BYTES - 1,
                min: USER_FENCE_BYTES
            }
        );
    }

    #[test]
    fn ragged_dep_array_is_rejected() {
        let (table, _) = table_with_buffer(4096, false);
        let bytes = SubmissionBuilder::new(0)
            .raw_chunk(CHUNK_DEPS, vec![0; DEP_ENTRY_BYTES as usize + 4])
            .build();
        assert_eq!(
            decode_submission(&bytes, &table).unwrap_err(),
            SubmitError::ChunkBadArrayLength {
                kind: CHUNK_DEPS,
                len: DEP_ENTRY_BYTES + 4,
                entry: DEP_ENTRY_BYTES
            }
        );
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let (table, _) = table_with_buffer(4096, false);
        let mut bytes = SubmissionBuilder::new(0).work(q(), 0, 0).build();
        bytes.truncate(bytes.len() - 1);
        assert_eq!(
            decode_submission(&bytes, &table).unwrap_err(),
            SubmitError::Truncated("chunk.payload")
        );
    }

    #[test]
    fn declared_length_beyond_buffer_is_rejected() {
        let (table, _) = table_with_buffer(4096, false);
        // Chunk header declares a large payload that is not actually there.
        let mut bytes = SubmissionBuilder::new(0)
            .raw_chunk(CHUNK_WORK, vec![])
            .build();
        // Rewrite the length field to a huge value.
        let len_off = SUBMISSION_HEADER_BYTES as usize + 4;
        bytes[len_off..len_off + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert_eq!(
            decode_submission(&bytes, &table).unwrap_err(),
            SubmitError::Truncated("chunk.payload")
        );
    }

    #[test]
    fn unresolvable_handle_fails_the_submission() {
        let table = BufferTable::new();
        let bytes = SubmissionBuilder::new(0)
            .work(q(), 0, 0)
            .resources(&[(99, 0)])
            .build();
        assert_eq!(
            decode_submission(&bytes, &table).unwrap_err(),
            SubmitError::UnknownHandle { handle: 99 }
        );
    }

    #[test]
    fn decode_failure_releases_every_pinned_buffer() {
        let table = BufferTable::new();
        let (good, bo) = table.create(BufferDesc::new(4096, MemDomain::GTT, MemDomain::GTT));
        let before = Arc::strong_count(&bo);

        // Good resource list decodes first (pinning the buffer), then an
        // unknown handle fails the whole submission.
        let bytes = SubmissionBuilder::new(0)
            .work(q(), 0, 0)
            .resources(&[(good, 0), (12345, 0)])
            .build();
        assert_eq!(
            decode_submission(&bytes, &table).unwrap_err(),
            SubmitError::UnknownHandle { handle: 12345 }
        );
        assert_eq!(Arc::strong_count(&bo), before, "pin leaked on error path");
    }

    #[test]
    fn user_fence_must_be_one_unbacked_page_with_room_for_the_slot() {
        let (table, small) = table_with_buffer(2048, false);
        let bytes = SubmissionBuilder::new(0)
            .work(q(), 0, 0)
            .user_fence(small, 0)
            .build();
        assert!(matches!(
            decode_submission(&bytes, &table).unwrap_err(),
            SubmitError::BadUserFence { .. }
        ));

        let (table, page) = table_with_buffer(4096, false);
        let bytes = SubmissionBuilder::new(0)
            .work(q(), 0, 0)
            .user_fence(page, 4092)
            .build();
        assert!(matches!(
            decode_submission(&bytes, &table).unwrap_err(),
            SubmitError::BadUserFence { .. }
        ));

        let (table, user) = table_with_buffer(4096, true);
        let bytes = SubmissionBuilder::new(0)
            .work(q(), 0, 0)
            .user_fence(user, 0)
            .build();
        assert!(matches!(
            decode_submission(&bytes, &table).unwrap_err(),
            SubmitError::BadUserFence { .. }
        ));
    }

    #[test]
    fn no_work_and_mixed_queues_are_rejected() {
        let (table, _) = table_with_buffer(4096, false);
        let bytes = SubmissionBuilder::new(0).build();
        assert_eq!(
            decode_submission(&bytes, &table).unwrap_err(),
            SubmitError::NoWork
        );

        let other = QueueSelector {
            engine_class: 1,
            engine_instance: 0,
            index: 0,
        };
        let bytes = SubmissionBuilder::new(0)
            .work(q(), 0, 0)
            .work(other, 0, 0)
            .build();
        assert_eq!(
            decode_submission(&bytes, &table).unwrap_err(),
            SubmitError::QueueMismatch
        );
    }

    #[test]
    fn duplicate_resource_list_is_rejected() {
        let (table, handle) = table_with_buffer(4096, false);
        let bytes = SubmissionBuilder::new(0)
            .work(q(), 0, 0)
            .resources(&[(handle, 0)])
            .resources(&[(handle, 0)])
            .build();
        assert_eq!(
            decode_submission(&bytes, &table).unwrap_err(),
            SubmitError::DuplicateChunk {
                kind: CHUNK_RESOURCES
            }
        );
    }
}
