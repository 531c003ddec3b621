//! # Immediate Dispatch
//!
//! Submission paths of a ready request.
//!
//! | operation | route | path |
//! |-----------|-------|------|
//! | no-submission | any | event inherits existing work |
//! | any other | primary | one batch on the primary engine |
//! | copy dispatch | copy / split | one batch per partition |
//!
//! Everything runs with the queue lock held, engine locks taken after it.
//! Split transfers lock every participating copy engine in ascending order,
//! encode all partitions, update queue state, then release the queue lock
//! before flushing.

use std::sync::Arc;
use std::vec::Vec;

use arrayvec::ArrayVec;
use ember_cmd::{
    AuxDirection, CommandStream, DependencySet, DependencyToken, EngineCaps, EngineState, EngineTarget, FlushFlags,
    FlushRequest, MultiWorkDescriptor, ProfilingPoint, SurfaceRef, WorkDescriptor, WorkPayload,
};
use ember_core::{CompletionStamp, Error, QueuePriority, Result, TaskCount};
use spin::MutexGuard;

use crate::event::{Event, EventKind, EventRecord};
use crate::properties::{EnqueueProperties, Operation};
use crate::queue::{CommandQueue, QueueState};
use crate::request::RequestKind;
use crate::resolver::DependencyResolver;
use crate::selector::{plan_for, EngineSelector, Route};
use crate::split::MAX_COPY_ENGINES;

/// A ready request on its way to the hardware
#[derive(Debug)]
pub(crate) struct Pending {
    pub(crate) kind: RequestKind,
    pub(crate) wait_list: Vec<Arc<Event>>,
    pub(crate) task_level: TaskCount,
    pub(crate) event: Option<Arc<Event>>,
    pub(crate) fragment: Option<CommandStream>,
    pub(crate) blocking: bool,
    pub(crate) resubmitted: bool,
}

/// Per-request inputs shared by the paths
struct Submission<'a> {
    kind: &'a RequestKind,
    wait_list: &'a [Arc<Event>],
    task_level: TaskCount,
    props: EnqueueProperties,
    flags: FlushFlags,
    fragment: Option<&'a CommandStream>,
}

/// What goes into one batch, in encoding order
#[derive(Default)]
struct Encoding<'a> {
    deps: DependencySet,
    stalling: bool,
    profiled: bool,
    pre: &'a [WorkDescriptor],
    fragment: Option<&'a CommandStream>,
    works: &'a [WorkDescriptor],
    post: &'a [WorkDescriptor],
    signals: Vec<DependencyToken>,
    residency: &'a [SurfaceRef],
}

impl CommandQueue {
    /// Submit a ready request; the queue lock is released on return
    pub(crate) fn submit(&self, state: MutexGuard<'_, QueueState>, pending: Pending) -> Result<()> {
        let Pending {
            kind,
            wait_list,
            task_level,
            event,
            fragment,
            blocking,
            resubmitted,
        } = pending;

        let route = EngineSelector::new(&self.config, &self.primary, &self.copies).select(&kind);
        let pending_deps = kind.is_kernel_less() && !self.resolver(&state).resolve_explicit(&self.primary, &wait_list).is_empty();
        let profiled = self.config.profiling && event.as_ref().is_some_and(|e| e.kind() == EventKind::Command);
        let props = EnqueueProperties::classify(&kind, &route, self.primary.kind(), pending_deps, profiled);

        let mut flags = FlushFlags::empty();
        if self.config.priority == QueuePriority::Low {
            flags |= FlushFlags::LOW_PRIORITY;
        }
        if blocking {
            flags |= FlushFlags::BLOCKING;
        }
        if resubmitted {
            flags |= FlushFlags::RESUBMITTED;
        }

        log::trace!(
            "queue {}: {} level {} -> {:?} via {:?}",
            self.id,
            kind.name(),
            task_level,
            props.operation(),
            route
        );

        let submission = Submission {
            kind: &kind,
            wait_list: &wait_list,
            task_level,
            props,
            flags,
            fragment: fragment.as_ref(),
        };
        let outcome = match (props.operation(), &route) {
            (Operation::NoSubmission, _) => Ok(self.submit_without_flush(state, &submission)),
            (_, Route::Primary) => self.submit_primary(state, &submission),
            (_, Route::Copy(_) | Route::Split(_)) => self.submit_copy(state, &submission, &route),
        };

        if let Some(fragment) = fragment {
            self.device.pool().release(fragment);
        }

        match outcome {
            Ok(record) => {
                if let (RequestKind::Free(surfaces), Some(event)) = (&kind, &event) {
                    self.state.lock().pending_frees.push((Arc::clone(event), surfaces.clone()));
                }
                if let Some(event) = event {
                    event.submit(record).fire();
                }
                Ok(())
            }
            Err(err) => {
                log::debug!("queue {}: {} failed: {}", self.id, kind.name(), err);
                if let Some(event) = event {
                    event.fail(err).fire();
                }
                Err(err)
            }
        }
    }

    fn resolver<'s>(&self, state: &'s QueueState) -> DependencyResolver<'s> {
        DependencyResolver::new(self.id, self.config.ordering, &state.last_tokens)
    }

    // =========================================================================
    // No submission
    // =========================================================================

    fn submit_without_flush(&self, mut state: MutexGuard<'_, QueueState>, submission: &Submission<'_>) -> EventRecord {
        if submission.props.is_barrier() {
            state.stall_pending = true;
            log::debug!("queue {}: barrier, next flush stalls", self.id);
        }

        let mut record = EventRecord::new(submission.task_level);
        if self.config.is_in_order() || submission.wait_list.is_empty() {
            self.high_water(&state, &mut record);
        } else {
            for event in submission.wait_list {
                record.merge(&event.record());
            }
        }
        record
    }

    /// Cover everything the queue submitted so far
    pub(crate) fn high_water(&self, state: &QueueState, record: &mut EventRecord) {
        record.add_wait(&self.primary, state.task_count, Some(state.flush_stamp));
        for (engine, copy) in self.copies.iter().zip(&state.copies) {
            if copy.used {
                record.add_wait(engine, copy.task_count, None);
            }
            if let Some(token) = &copy.last_signalled {
                record.add_token(token);
            }
        }
        for token in &state.last_tokens {
            record.add_token(token);
        }
    }

    // =========================================================================
    // Primary engine
    // =========================================================================

    fn submit_primary(&self, mut state: MutexGuard<'_, QueueState>, submission: &Submission<'_>) -> Result<EventRecord> {
        if submission.props.is_barrier() {
            state.stall_pending = true;
        }
        let mut deps = self.resolver(&state).resolve(&self.primary, submission.wait_list);
        // Tokens come first so exhaustion leaves no pass running on hardware
        let token = self.primary.allocate_token()?;

        let mut inline_pre = Vec::new();
        let mut inline_post = Vec::new();
        let mut aux_post = None;
        if let RequestKind::Dispatch(multi) = submission.kind {
            if multi.needs_aux_translation() {
                let pre = multi.aux_passes(AuxDirection::AuxToNonAux);
                let post = multi.aux_passes(AuxDirection::NonAuxToAux);
                match self.aux_engine() {
                    Some(index) => {
                        let engine = &self.copies[index];
                        let pre_token = engine.allocate_token()?;
                        let post_token = engine.allocate_token()?;
                        let pre_deps = self.resolver(&state).resolve(engine, submission.wait_list);
                        self.flush_copy_pass(&mut state, index, pre_deps, &pre, &pre_token, submission)?;
                        deps.add_token(&pre_token, self.primary.id());
                        aux_post = Some((index, post, post_token));
                    }
                    None => {
                        inline_pre = pre;
                        inline_post = post;
                    }
                }
            }
        }

        let works = primary_works(submission.kind, submission.fragment.is_some());
        let residency = residency_of(submission.kind);

        let mut flags = submission.flags;
        if matches!(submission.props.operation(), Operation::FlushOnly) {
            flags |= FlushFlags::DEPENDENCY_ONLY;
        }
        let encoding = Encoding {
            deps,
            profiled: submission.props.is_profiled(),
            pre: &inline_pre,
            fragment: submission.fragment,
            works: &works,
            post: &inline_post,
            signals: vec![token.clone()],
            residency: &residency,
            ..Encoding::default()
        };
        let stamp = match self.flush_primary(&mut state, encoding, flags, submission.task_level) {
            Ok(stamp) => stamp,
            Err(err) => {
                if let Some((index, post, post_token)) = aux_post {
                    // The pre-pass already ran; restore the compressed layout
                    let restored =
                        self.flush_copy_pass(&mut state, index, DependencySet::new(), &post, &post_token, submission);
                    if let Err(post_err) = restored {
                        log::warn!("queue {}: aux restore on copy {} failed: {}", self.id, index, post_err);
                    }
                }
                return Err(err);
            }
        };

        let mut record = EventRecord::new(submission.task_level);
        record.add_flush(&self.primary, &stamp);
        record.add_token(&token);
        let mut produced = vec![token];

        if let Some((index, post, post_token)) = aux_post {
            let engine = &self.copies[index];
            let mut post_deps = DependencySet::new();
            post_deps.add_token(&produced[0], engine.id());
            let post_stamp = self.flush_copy_pass(&mut state, index, post_deps, &post, &post_token, submission)?;
            record.add_flush(engine, &post_stamp);
            record.add_token(&post_token);
            produced.push(post_token);
        }

        state.supersede(produced);
        Ok(record)
    }

    /// Encode and flush one batch on the primary engine
    ///
    /// A pending stall turns this flush into the stalling one: it waits on
    /// every copy engine's last signalled token and hands a shared barrier
    /// token to the copy engines in use.
    fn flush_primary(
        &self,
        state: &mut QueueState,
        mut encoding: Encoding<'_>,
        mut flags: FlushFlags,
        task_level: TaskCount,
    ) -> Result<CompletionStamp> {
        let primary = &self.primary;
        let stalling = state.stall_pending;
        let mut barrier = None;
        if stalling {
            for copy in &state.copies {
                if let Some(token) = &copy.last_signalled {
                    encoding.deps.add_token(token, primary.id());
                }
            }
            if state.copies.iter().any(|c| c.used) {
                let token = primary.allocate_token()?;
                encoding.signals.push(token.clone());
                barrier = Some(token);
            }
            encoding.stalling = true;
            flags |= FlushFlags::STALLING;
        }

        let stamp = {
            let mut engine = primary.lock();
            let start = self.encode(primary, &mut engine, &encoding)?;
            primary.flush(
                &mut engine,
                FlushRequest {
                    start,
                    signals: core::mem::take(&mut encoding.signals),
                    flags,
                    task_level,
                    throttle: self.config.throttle,
                },
            )
        };
        stamp.status()?;

        state.task_count = state.task_count.max(stamp.task_count);
        state.flush_stamp = stamp.flush_stamp;
        if stalling {
            state.stall_pending = false;
            for copy in &mut state.copies {
                copy.last_signalled = None;
                if copy.used {
                    copy.last_barrier = barrier.clone();
                }
            }
            log::debug!(
                "queue {}: stalled {} at task {}{}",
                self.id,
                primary.id(),
                stamp.task_count,
                if barrier.is_some() { ", barrier shared with copy engines" } else { "" }
            );
        }
        Ok(stamp)
    }

    /// Issue the pending stall on the primary engine ahead of copy work
    fn flush_stall(&self, state: &mut QueueState, submission: &Submission<'_>) -> Result<()> {
        let flags = submission.flags | FlushFlags::DEPENDENCY_ONLY;
        self.flush_primary(state, Encoding::default(), flags, submission.task_level)?;
        Ok(())
    }

    // =========================================================================
    // Copy engines
    // =========================================================================

    /// Copy engine for translation passes, if configured
    fn aux_engine(&self) -> Option<usize> {
        if !self.config.aux_translation_on_copy {
            return None;
        }
        self.copies
            .iter()
            .enumerate()
            .filter(|(_, e)| e.supports(EngineCaps::AUX_TRANSLATION) && !e.is_hung())
            .min_by_key(|(_, e)| e.outstanding())
            .map(|(i, _)| i)
    }

    /// Flush translation passes on a copy engine with the queue lock held
    fn flush_copy_pass(
        &self,
        state: &mut QueueState,
        index: usize,
        mut deps: DependencySet,
        works: &[WorkDescriptor],
        token: &DependencyToken,
        submission: &Submission<'_>,
    ) -> Result<CompletionStamp> {
        let engine = &self.copies[index];
        state.copies[index].used = true;
        if state.stall_pending {
            self.flush_stall(state, submission)?;
        }
        if let Some(barrier) = &state.copies[index].last_barrier {
            deps.add_token(barrier, engine.id());
        }

        let residency: Vec<SurfaceRef> = works.iter().flat_map(|w| w.residency().copied()).collect();
        let encoding = Encoding {
            deps,
            works,
            signals: vec![token.clone()],
            residency: &residency,
            ..Encoding::default()
        };
        let stamp = {
            let mut guard = engine.lock();
            let start = self.encode(engine, &mut guard, &encoding)?;
            engine.flush(
                &mut guard,
                FlushRequest {
                    start,
                    signals: encoding.signals.clone(),
                    flags: submission.flags,
                    task_level: submission.task_level,
                    throttle: self.config.throttle,
                },
            )
        };
        stamp.status()?;

        let copy = &mut state.copies[index];
        copy.task_count = copy.task_count.max(stamp.task_count);
        copy.last_barrier = None;
        copy.last_signalled = Some(token.clone());
        Ok(stamp)
    }

    fn submit_copy(
        &self,
        mut state: MutexGuard<'_, QueueState>,
        submission: &Submission<'_>,
        route: &Route,
    ) -> Result<EventRecord> {
        let mut parts: ArrayVec<(usize, WorkDescriptor), MAX_COPY_ENGINES> = ArrayVec::new();
        match (submission.kind, route) {
            (RequestKind::Copy(region), _) => {
                let plan = plan_for(route, region).ok_or(Error::InvalidParameter)?;
                for partition in plan.partitions() {
                    parts.push((partition.engine, WorkDescriptor::new(WorkPayload::Copy(partition.region))));
                }
            }
            (kind, Route::Copy(index)) => {
                let work = kind.transfer_work().ok_or(Error::InvalidParameter)?;
                parts.push((*index, work));
            }
            _ => return Err(Error::InvalidParameter),
        }

        for (index, _) in &parts {
            state.copies[*index].used = true;
        }
        if state.stall_pending {
            self.flush_stall(&mut state, submission)?;
        }

        let mut guards: ArrayVec<(usize, MutexGuard<'_, EngineState>), MAX_COPY_ENGINES> = ArrayVec::new();
        let mut order: ArrayVec<usize, MAX_COPY_ENGINES> = parts.iter().map(|(i, _)| *i).collect();
        order.sort_unstable();
        for index in order {
            guards.push((index, self.copies[index].lock()));
        }

        let tokens = parts
            .iter()
            .map(|(index, _)| self.copies[*index].allocate_token())
            .collect::<Result<Vec<_>>>()?;

        // Encode every partition before anything is flushed
        let mut starts: ArrayVec<usize, MAX_COPY_ENGINES> = ArrayVec::new();
        let resolver = self.resolver(&state);
        for (n, (index, work)) in parts.iter().enumerate() {
            let engine = &self.copies[*index];
            let mut deps = resolver.resolve(engine, submission.wait_list);
            if let Some(barrier) = &state.copies[*index].last_barrier {
                deps.add_token(barrier, engine.id());
            }
            let residency: Vec<SurfaceRef> = work.residency().copied().collect();
            let encoding = Encoding {
                deps,
                profiled: submission.props.is_profiled(),
                works: core::slice::from_ref(work),
                signals: vec![tokens[n].clone()],
                residency: &residency,
                ..Encoding::default()
            };
            let encoded = self.encode(engine, guard_for(&mut guards, *index)?, &encoding);
            match encoded {
                Ok(start) => starts.push(start),
                Err(err) => {
                    for (m, start) in starts.iter().enumerate() {
                        guard_for(&mut guards, parts[m].0)?.stream().rewind_to(*start);
                    }
                    return Err(err);
                }
            }
        }

        // Published before the flush so concurrent submissions order behind
        // the partitions; failed partitions are rolled back below
        let previous_tokens = state.last_tokens.clone();
        let mut previous: ArrayVec<(Option<DependencyToken>, Option<DependencyToken>), MAX_COPY_ENGINES> =
            ArrayVec::new();
        for (n, (index, _)) in parts.iter().enumerate() {
            let copy = &mut state.copies[*index];
            previous.push((
                core::mem::replace(&mut copy.last_signalled, Some(tokens[n].clone())),
                copy.last_barrier.take(),
            ));
        }
        state.supersede(tokens.clone());
        drop(state);

        let mut record = EventRecord::new(submission.task_level);
        let mut flushed: ArrayVec<(usize, CompletionStamp), MAX_COPY_ENGINES> = ArrayVec::new();
        let mut failed: ArrayVec<usize, MAX_COPY_ENGINES> = ArrayVec::new();
        let mut first_error = None;
        for (n, (index, _)) in parts.iter().enumerate() {
            let engine = &self.copies[*index];
            let stamp = engine.flush(
                guard_for(&mut guards, *index)?,
                FlushRequest {
                    start: starts[n],
                    signals: vec![tokens[n].clone()],
                    flags: submission.flags,
                    task_level: submission.task_level,
                    throttle: self.config.throttle,
                },
            );
            match stamp.status() {
                Ok(()) => {
                    record.add_flush(engine, &stamp);
                    record.add_token(&tokens[n]);
                    flushed.push((*index, stamp));
                }
                Err(err) => {
                    failed.push(n);
                    first_error.get_or_insert(err);
                }
            }
        }
        drop(guards);

        let mut state = self.state.lock();
        for (index, stamp) in &flushed {
            let copy = &mut state.copies[*index];
            copy.task_count = copy.task_count.max(stamp.task_count);
        }
        if !failed.is_empty() {
            self.roll_back(&mut state, &parts, &tokens, &failed, previous, previous_tokens);
        }
        drop(state);

        match first_error {
            Some(err) => Err(err),
            None => Ok(record),
        }
    }

    /// Forget tokens of partitions that never reached the hardware
    ///
    /// Nothing may wait on them later: they would never signal.
    fn roll_back(
        &self,
        state: &mut QueueState,
        parts: &[(usize, WorkDescriptor)],
        tokens: &[DependencyToken],
        failed: &[usize],
        previous: ArrayVec<(Option<DependencyToken>, Option<DependencyToken>), MAX_COPY_ENGINES>,
        previous_tokens: Vec<DependencyToken>,
    ) {
        for (n, (signalled, barrier)) in previous.into_iter().enumerate() {
            if !failed.contains(&n) {
                continue;
            }
            let copy = &mut state.copies[parts[n].0];
            if copy.last_signalled.as_ref() == Some(&tokens[n]) {
                copy.last_signalled = signalled;
                if copy.last_barrier.is_none() {
                    copy.last_barrier = barrier;
                }
            }
        }

        let is_failed = |token: &DependencyToken| failed.iter().any(|n| &tokens[*n] == token);
        state.deferred.retain(|token| !is_failed(token));
        if state.last_tokens.as_slice() == tokens {
            let mut kept: Vec<DependencyToken> = tokens.iter().filter(|t| !is_failed(*t)).cloned().collect();
            for token in previous_tokens {
                if !token.is_signalled() && !kept.contains(&token) {
                    kept.push(token);
                }
            }
            state.last_tokens = kept;
        } else {
            state.last_tokens.retain(|token| !is_failed(token));
        }
        log::debug!("queue {}: {} of {} copy partitions failed", self.id, failed.len(), parts.len());
    }

    // =========================================================================
    // Encoding
    // =========================================================================

    /// Encode one batch into `engine`'s stream and return its start
    ///
    /// Residency is established last; any failure rewinds the stream.
    fn encode(&self, engine: &EngineTarget, state: &mut EngineState, encoding: &Encoding<'_>) -> Result<usize> {
        let encoder = self.device.encoder();
        let kind = engine.kind();
        let work_bytes: usize = encoding
            .pre
            .iter()
            .chain(encoding.works)
            .chain(encoding.post)
            .map(|w| encoder.work_size(w))
            .sum();
        let bytes = encoder.dependencies_size(&encoding.deps)
            + work_bytes
            + encoding.fragment.map_or(0, CommandStream::used_bytes)
            + (encoding.signals.len() + 3) * encoder.fixed_command_size();
        let start = engine.acquire_space(state, bytes)?;

        let result = (|| -> Result<()> {
            let stream = state.stream();
            encoder.encode_dependencies(stream, kind, &encoding.deps)?;
            if encoding.stalling {
                encoder.encode_barrier(stream, kind, true)?;
            }
            if encoding.profiled {
                encoder.encode_profiling(stream, kind, ProfilingPoint::Start)?;
            }
            for work in encoding.pre {
                encoder.encode_work(stream, kind, work, &encoding.deps)?;
            }
            if let Some(fragment) = encoding.fragment {
                stream.append(fragment)?;
            }
            for work in encoding.works.iter().chain(encoding.post) {
                encoder.encode_work(stream, kind, work, &encoding.deps)?;
            }
            if encoding.profiled {
                encoder.encode_profiling(stream, kind, ProfilingPoint::End)?;
            }
            for token in &encoding.signals {
                encoder.encode_signal(stream, kind, token)?;
            }
            for surface in encoding.residency {
                self.device.residency().make_resident(engine.id(), surface)?;
            }
            Ok(())
        })();

        if let Err(err) = result {
            state.stream().rewind_to(start);
            return Err(err);
        }
        Ok(start)
    }

    /// Pre-encode the kernels of a blocked dispatch into a pool buffer
    pub(crate) fn encode_fragment(&self, multi: &MultiWorkDescriptor) -> Result<CommandStream> {
        let encoder = self.device.encoder();
        let bytes: usize = multi.dispatches.iter().map(|w| encoder.work_size(w)).sum();
        let mut stream = self.device.pool().acquire(bytes)?;
        let deps = DependencySet::new();
        for work in &multi.dispatches {
            if let Err(err) = encoder.encode_work(&mut stream, self.primary.kind(), work, &deps) {
                self.device.pool().release(stream);
                return Err(err);
            }
        }
        Ok(stream)
    }
}

fn guard_for<'g, 'e>(
    guards: &'g mut ArrayVec<(usize, MutexGuard<'e, EngineState>), MAX_COPY_ENGINES>,
    index: usize,
) -> Result<&'g mut EngineState> {
    guards
        .iter_mut()
        .find(|(i, _)| *i == index)
        .map(|(_, guard)| &mut **guard)
        .ok_or(Error::InvalidParameter)
}

/// Work encoded on the primary engine
fn primary_works(kind: &RequestKind, has_fragment: bool) -> Vec<WorkDescriptor> {
    match kind {
        RequestKind::Dispatch(_) if has_fragment => Vec::new(),
        RequestKind::Dispatch(multi) => multi.dispatches.clone(),
        RequestKind::Copy(_) | RequestKind::CopyImage(_) | RequestKind::Fill(_) => {
            kind.transfer_work().into_iter().collect()
        }
        RequestKind::Migrate(surfaces) => {
            vec![WorkDescriptor::new(WorkPayload::CacheFlush).with_surfaces(surfaces.clone())]
        }
        RequestKind::Barrier | RequestKind::Marker | RequestKind::Free(_) => Vec::new(),
    }
}

/// Surfaces made resident before the flush
fn residency_of(kind: &RequestKind) -> Vec<SurfaceRef> {
    match kind {
        RequestKind::Dispatch(multi) => multi.residency().copied().collect(),
        RequestKind::Migrate(surfaces) => surfaces.clone(),
        other => other
            .transfer_work()
            .map(|work| work.residency().copied().collect())
            .unwrap_or_default(),
    }
}
