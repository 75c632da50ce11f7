//! Per-job progress streaming endpoint (SSE).
//!
//! GET /api/v1/jobs/{id}/events
//!
//! Replays the current snapshot as a `status` frame, then forwards
//! published events until the terminal `done` frame, after which the
//! stream closes. A subscriber attaching mid-run sees the snapshot plus
//! subsequent events only; intermediate history is not replayed.

use std::convert::Infallible;
use std::pin::Pin;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};

use crate::common::id::is_valid_job_id;
use crate::common::ApiError;
use crate::kernel::events::ProgressEvent;
use crate::kernel::jobs::JobRecord;
use crate::server::app::AppState;

type EventFrames = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

fn to_frame(event: &ProgressEvent) -> Option<Result<Event, Infallible>> {
    Event::default()
        .event(event.kind())
        .json_data(event)
        .ok()
        .map(Ok)
}

/// Snapshot plus final frame for a job that already finished.
fn terminal_frames(job: JobRecord) -> EventFrames {
    let snapshot = ProgressEvent::Status {
        status: job.status,
        progress: job.progress,
    };
    let done = ProgressEvent::Done {
        status: job.status,
        result: job.result,
        error: job.error,
    };
    let frames: Vec<_> = [snapshot, done].iter().filter_map(to_frame).collect();
    Box::pin(stream::iter(frames))
}

pub async fn job_events_handler(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Sse<EventFrames>, ApiError> {
    if !is_valid_job_id(&job_id) {
        return Err(ApiError::NotFound(format!("job {job_id}")));
    }
    let job = state
        .store
        .get_job(&job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id}")))?;

    if job.status.is_terminal() {
        return Ok(Sse::new(terminal_frames(job)).keep_alive(KeepAlive::default()));
    }

    let subscription = state.bus.subscribe(&job_id).await?;

    // The job may have finished between the snapshot read and the
    // subscription; without a re-read the done frame would never arrive.
    if let Some(current) = state.store.get_job(&job_id).await? {
        if current.status.is_terminal() {
            return Ok(Sse::new(terminal_frames(current)).keep_alive(KeepAlive::default()));
        }
    }

    let snapshot = ProgressEvent::Status {
        status: job.status,
        progress: job.progress,
    };

    // Forward up to and including the done frame, then end the stream.
    let tail = subscription.scan(false, |finished, event| {
        let emit = if *finished {
            None
        } else {
            *finished = event.is_done();
            Some(event)
        };
        futures::future::ready(emit)
    });
    let frames: EventFrames = Box::pin(
        stream::iter(vec![snapshot])
            .chain(tail)
            .filter_map(|event| futures::future::ready(to_frame(&event))),
    );

    Ok(Sse::new(frames).keep_alive(KeepAlive::default()))
}
