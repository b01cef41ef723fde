//! Inspection operations scheduled through the session

use std::sync::Arc;

use heapscope_common::{Tid, TypeHandle};
use log::debug;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::Session;
use crate::analysis::{self, HeapStatistics, TypeStat};
use crate::blocking::{BlockingDetector, BlockingObjectRecord};
use crate::domain::{Address, SessionError};
use crate::materialize::{ObjectValueRecord, ObjectView};
use crate::stack::render_stack;

/// One managed thread with its rendered stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadSummary {
    pub os_id: Tid,
    pub managed_id: u32,
    pub is_alive: bool,
    pub lock_count: u32,
    /// Rendered call stack, innermost frame first
    pub stack: String,
    /// Stack matches a known blocking call
    pub likely_blocked: bool,
}

impl Session {
    /// Materialize the object at `address`
    ///
    /// With no `type_handle` the type is read from the object header.
    ///
    /// # Errors
    /// Returns [`SessionError::NotAttached`] when detached and
    /// [`SessionError::Materialize`] when the object's type is unknown
    pub async fn inspect_object(
        &self,
        address: Address,
        type_handle: Option<TypeHandle>,
        cancel: CancellationToken,
    ) -> Result<Vec<ObjectValueRecord>, SessionError> {
        let records = self
            .execute(move |ctx| {
                let view =
                    ObjectView::resolve(ctx.runtime.as_ref(), address.0, type_handle, cancel);
                view.records().map(<[ObjectValueRecord]>::to_vec)
            })
            .await??;
        Ok(records)
    }

    /// Synchronization objects implicated in `thread`'s blocking state
    ///
    /// # Errors
    /// Returns [`SessionError::NotAttached`] when detached
    pub async fn inspect_thread_blocking(
        &self,
        thread: Tid,
        cancel: CancellationToken,
    ) -> Result<Vec<BlockingObjectRecord>, SessionError> {
        self.execute(move |ctx| {
            BlockingDetector::new(Arc::clone(&ctx.runtime)).blocking_objects(thread, &cancel)
        })
        .await
    }

    /// Managed threads with rendered stacks
    ///
    /// # Errors
    /// Returns [`SessionError::NotAttached`] when detached
    pub async fn threads(&self) -> Result<Vec<ThreadSummary>, SessionError> {
        self.execute(|ctx| {
            let detector = BlockingDetector::new(Arc::clone(&ctx.runtime));
            let cancel = CancellationToken::new();
            ctx.runtime
                .threads()
                .into_iter()
                .map(|thread| {
                    let frames = ctx.runtime.stack_trace(thread.os_id).unwrap_or_else(|e| {
                        debug!("No stack for {}: {e}", thread.os_id);
                        Vec::new()
                    });
                    ThreadSummary {
                        os_id: thread.os_id,
                        managed_id: thread.managed_id,
                        is_alive: thread.is_alive,
                        lock_count: thread.lock_count,
                        stack: render_stack(&frames),
                        likely_blocked: detector.is_likely_blocked(thread.os_id, &cancel),
                    }
                })
                .collect()
        })
        .await
    }

    /// Heap size by generation
    ///
    /// # Errors
    /// Returns [`SessionError::NotAttached`] when detached
    pub async fn heap_statistics(&self) -> Result<HeapStatistics, SessionError> {
        self.execute(|ctx| analysis::heap_statistics(ctx.heap.as_ref())).await
    }

    /// Objects on the heap grouped by type, largest first
    ///
    /// # Errors
    /// Returns [`SessionError::NotAttached`] when detached
    pub async fn type_histogram(
        &self,
        cancel: CancellationToken,
    ) -> Result<Vec<TypeStat>, SessionError> {
        self.execute(move |ctx| analysis::type_histogram(ctx.heap.as_ref(), &cancel)).await
    }

    /// Read raw target memory
    ///
    /// # Errors
    /// Returns the engine's read error; a lost target also detaches the
    /// session
    pub async fn read_memory(&self, address: Address, len: usize) -> Result<Vec<u8>, SessionError> {
        self.try_execute(move |ctx| {
            let mut buf = vec![0u8; len];
            ctx.heap.read_memory(address.0, &mut buf)?;
            Ok(buf)
        })
        .await
    }
}

