// SPDX-FileCopyrightText: The taxel authors
// SPDX-License-Identifier: MPL-2.0

//! Worker thread that drives a [`SurfacePipeline`].
//!
//! The transport thread produces frames through a [`FrameSender`] whose
//! bounded queue never blocks: when the consumer falls behind, the newest
//! frame is dropped with a warning instead of stalling the realtime USB
//! callback. Processed frame grids travel back through a recycle queue so
//! steady-state operation allocates nothing.
//!
//! Control-plane commands arrive over a separate channel and are drained
//! between frames, which makes calibration cancellation and parameter
//! updates safe without any locking of the pipeline state.

use std::{any::Any, sync::mpsc, thread::JoinHandle, time::Duration};

use crossbeam_channel as channel;

use crate::{
    calibrate::ExportError,
    frame::{Grid, SequencedFrame},
    params::TrackerParams,
    zone::ZoneMap,
};

use super::{DiagnosticsSink, SurfacePipeline, TouchFrameSink};

/// Default capacity of the frame queue, sized to absorb scheduling jitter
/// at the sensor's 1 kHz frame rate.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// How long the worker waits for a frame before polling for commands.
const COMMAND_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Control-plane request handled between two frames.
#[derive(Debug)]
pub enum Command {
    SetParams(TrackerParams),
    SetZoneMap(ZoneMap),
    BeginCalibration,
    CancelCalibration,
    ImportCalibration(Vec<u8>),
    /// Reply with the serialized calibration over the provided channel.
    ExportCalibration(mpsc::Sender<Result<Vec<u8>, ExportError>>),
    /// Drop all tracking state, keeping calibration data.
    Reset,
    Terminate,
}

/// Producer half of the bounded frame queue.
///
/// Owned by the transport thread. [`FrameSender::send`] never blocks; a
/// full queue hands the frame straight back so its grid can be recycled
/// by the producer-side [`crate::frame::GridRecycler`].
#[derive(Debug)]
pub struct FrameSender {
    frame_tx: channel::Sender<SequencedFrame>,
    recycle_rx: channel::Receiver<Grid>,
    dropped_frames: u64,
}

impl FrameSender {
    /// Enqueue a frame for the worker.
    ///
    /// Returns the rejected frame when the queue is full or the worker is
    /// gone, so the caller can reclaim its grid.
    pub fn send(&mut self, frame: SequencedFrame) -> Option<SequencedFrame> {
        match self.frame_tx.try_send(frame) {
            Ok(()) => None,
            Err(channel::TrySendError::Full(frame)) => {
                self.dropped_frames += 1;
                log::warn!(
                    "Frame queue full, dropping frame {seq} ({dropped} dropped so far)",
                    seq = frame.seq,
                    dropped = self.dropped_frames
                );
                Some(frame)
            }
            Err(channel::TrySendError::Disconnected(frame)) => Some(frame),
        }
    }

    /// Grid buffers returned by the worker after processing.
    pub fn reclaim(&mut self) -> impl Iterator<Item = Grid> + '_ {
        self.recycle_rx.try_iter()
    }

    #[must_use]
    pub const fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }
}

/// Consumer half of the bounded frame queue, owned by the worker.
#[derive(Debug)]
pub struct FrameReceiver {
    frame_rx: channel::Receiver<SequencedFrame>,
    recycle_tx: channel::Sender<Grid>,
}

impl FrameReceiver {
    fn recycle(&self, grid: Grid) {
        // The producer may be gone during shutdown, then the grid simply
        // drops.
        let _ = self.recycle_tx.try_send(grid);
    }
}

/// Create the connected producer/consumer halves of a frame queue.
#[must_use]
pub fn frame_queue(capacity: usize) -> (FrameSender, FrameReceiver) {
    debug_assert!(capacity > 0);
    let (frame_tx, frame_rx) = channel::bounded(capacity);
    // One extra slot so recycling a grid right after popping the last
    // queued frame cannot fail.
    let (recycle_tx, recycle_rx) = channel::bounded(capacity + 1);
    (
        FrameSender {
            frame_tx,
            recycle_rx,
            dropped_frames: 0,
        },
        FrameReceiver {
            frame_rx,
            recycle_tx,
        },
    )
}

/// Everything the worker thread owns while running.
///
/// Returned to the host on [`ProcessThread::join`], so the pipeline with
/// its calibration data outlives the thread.
#[derive(Debug)]
pub struct Environment<T, D> {
    pub pipeline: SurfacePipeline,
    pub frames: FrameReceiver,
    pub commands: mpsc::Receiver<Command>,
    pub touches: T,
    pub diagnostics: D,
}

fn handle_command(pipeline: &mut SurfacePipeline, command: Command) -> bool {
    match command {
        Command::Terminate => return false,
        Command::SetParams(params) => pipeline.set_params(params),
        Command::SetZoneMap(map) => pipeline.set_zone_map(map),
        Command::BeginCalibration => pipeline.begin_calibration(),
        Command::CancelCalibration => pipeline.cancel_calibration(),
        Command::ImportCalibration(bytes) => {
            if let Err(err) = pipeline.import_calibration(&bytes) {
                log::warn!("Rejecting calibration import: {err}");
            }
        }
        Command::ExportCalibration(reply_tx) => {
            if reply_tx.send(pipeline.export_calibration()).is_err() {
                log::warn!("Calibration export requester is gone");
            }
        }
        Command::Reset => pipeline.reset(),
    }
    true
}

fn thread_fn<T, D>(environment: &mut Environment<T, D>)
where
    T: TouchFrameSink,
    D: DiagnosticsSink,
{
    let Environment {
        pipeline,
        frames,
        commands,
        touches,
        diagnostics,
    } = environment;
    log::info!("Processing thread running");
    'main: loop {
        // Drain all pending commands before touching the next frame.
        loop {
            match commands.try_recv() {
                Ok(command) => {
                    if !handle_command(pipeline, command) {
                        break 'main;
                    }
                }
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => {
                    log::info!("Command channel closed, terminating");
                    break 'main;
                }
            }
        }
        match frames.frame_rx.recv_timeout(COMMAND_POLL_INTERVAL) {
            Ok(frame) => {
                let SequencedFrame { seq, grid } = frame;
                log::trace!("Processing frame {seq}");
                pipeline.process_frame(&grid, touches, diagnostics);
                frames.recycle(grid);
            }
            Err(channel::RecvTimeoutError::Timeout) => {}
            Err(channel::RecvTimeoutError::Disconnected) => {
                log::info!("Frame queue closed, terminating");
                break;
            }
        }
    }
    log::info!("Processing thread terminating");
}

/// The worker thread handle.
#[derive(Debug)]
pub struct ProcessThread<T, D> {
    join_handle: JoinHandle<Environment<T, D>>,
}

impl<T, D> ProcessThread<T, D>
where
    T: TouchFrameSink + Send + 'static,
    D: DiagnosticsSink + Send + 'static,
{
    pub fn spawn(environment: Environment<T, D>) -> std::io::Result<Self> {
        let join_handle = std::thread::Builder::new()
            .name("taxel-process".to_owned())
            .spawn(move || {
                let mut environment = environment;
                thread_fn(&mut environment);
                environment
            })?;
        log::debug!("Spawned processing thread: {join_handle:?}");
        Ok(Self { join_handle })
    }

    pub fn join(self) -> JoinedThread<T, D> {
        let Self { join_handle } = self;
        log::debug!("Joining processing thread");
        join_handle
            .join()
            .map_or_else(JoinedThread::JoinError, JoinedThread::Terminated)
    }

    /// Request termination and join, mapping a worker panic into an error.
    pub fn terminate_and_join(
        self,
        command_tx: &mpsc::Sender<Command>,
    ) -> anyhow::Result<Environment<T, D>> {
        // The channel is already closed if the worker terminated on its own.
        let _ = command_tx.send(Command::Terminate);
        match self.join() {
            JoinedThread::Terminated(environment) => Ok(environment),
            JoinedThread::JoinError(err) => {
                Err(anyhow::anyhow!("Processing thread panicked: {err:?}"))
            }
        }
    }
}

#[expect(missing_debug_implementations)]
pub enum JoinedThread<T, D> {
    Terminated(Environment<T, D>),
    JoinError(Box<dyn Any + Send + 'static>),
}
